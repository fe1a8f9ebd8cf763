//! Snapshot capture backend.
//!
//! A live-rendering player keeps the source playing and continuously renders its
//! current frame into a transient JPEG artifact. Each `capture_one` waits for a
//! fresh artifact and loads it back. This costs throughput and CPU compared to
//! continuous decoding, but avoids the smearing some network sources show when
//! pulled frame by frame.
//!
//! The player is an `ffmpeg` child process (binary overridable through
//! `MULTICAM_FFMPEG_BIN`). Synthetic sources use an in-process player that renders
//! generated frames into the same artifact.

use anyhow::{anyhow, Context, Result};
use image::ImageFormat;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant, SystemTime};

use super::synthetic::SyntheticSource;
use super::{BackendKind, BackendOptions, CaptureBackend, SourceDescriptor, SourceInfo};
use crate::frame::Frame;
use crate::record::{prepare_recording_path, write_jpeg};

const PLAYER_BIN_ENV: &str = "MULTICAM_FFMPEG_BIN";
const DEFAULT_PLAYER_BIN: &str = "ffmpeg";
/// How long `open` waits for the player's first frame before reporting "not ready".
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Snapshot-based capture.
pub struct SnapshotCapture {
    descriptor: SourceDescriptor,
    options: BackendOptions,
    artifact: PathBuf,
    player: Option<Player>,
    frame_count: u64,
}

enum Player {
    Synthetic(SyntheticPlayer),
    Process(ProcessPlayer),
}

impl SnapshotCapture {
    pub fn new(descriptor: SourceDescriptor, options: BackendOptions) -> Self {
        let artifact = artifact_path(&options.feed_name);
        Self {
            descriptor,
            options,
            artifact,
            player: None,
            frame_count: 0,
        }
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    fn start_player(&self) -> Result<Player> {
        match &self.descriptor {
            SourceDescriptor::Synthetic { params, .. } => {
                log::info!("SnapshotCapture: playing {} (synthetic)", self.descriptor);
                Ok(Player::Synthetic(SyntheticPlayer::new(SyntheticSource::new(
                    params.clone(),
                ))))
            }
            descriptor => {
                let recording = match &self.options.recording_dir {
                    Some(dir) => Some(prepare_recording_path(dir, &self.options.feed_name, "ts")?),
                    None => None,
                };
                let args = player_args(descriptor, &self.options, &self.artifact, recording.as_deref());
                let player = ProcessPlayer::spawn(&args, self.options.target_fps)?;
                log::info!("SnapshotCapture: playing {} (ffmpeg)", descriptor);
                Ok(Player::Process(player))
            }
        }
    }

    fn load_artifact(&mut self) -> Result<Frame> {
        let bytes = std::fs::read(&self.artifact)
            .with_context(|| format!("read snapshot {}", self.artifact.display()))?;
        let image = image::load_from_memory_with_format(&bytes, ImageFormat::Jpeg)
            .context("decode snapshot")?
            .to_rgb8();
        self.frame_count += 1;
        Ok(Frame::from_image(image, self.frame_count))
    }
}

impl CaptureBackend for SnapshotCapture {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Snapshot
    }

    fn open(&mut self) -> Result<SourceInfo> {
        if self.player.is_none() {
            self.player = Some(self.start_player()?);
        }
        let fps = self.options.target_fps.unwrap_or(0.0);
        match &mut self.player {
            Some(Player::Synthetic(player)) => Ok(player.source.info()),
            Some(Player::Process(player)) => {
                if let Err(err) = player.wait_for_frame(&self.artifact, OPEN_TIMEOUT) {
                    log::debug!("{} not rendering yet: {:#}", self.options.feed_name, err);
                    return Ok(SourceInfo {
                        fps,
                        width: 0,
                        height: 0,
                    });
                }
                let frame = self.load_artifact()?;
                Ok(SourceInfo {
                    fps,
                    width: frame.width,
                    height: frame.height,
                })
            }
            None => Ok(SourceInfo::default()),
        }
    }

    fn capture_one(&mut self) -> Result<Frame> {
        match &mut self.player {
            Some(Player::Synthetic(player)) => player.render(&self.artifact)?,
            Some(Player::Process(player)) => {
                let timeout = player.frame_timeout();
                player.wait_for_frame(&self.artifact, timeout)?
            }
            None => return Err(anyhow!("{} has no active player", self.descriptor)),
        }
        self.load_artifact()
    }

    fn close(&mut self) {
        if let Some(Player::Process(mut player)) = self.player.take() {
            player.stop();
        }
        if self.artifact.exists() {
            if let Err(err) = std::fs::remove_file(&self.artifact) {
                log::debug!("remove {}: {}", self.artifact.display(), err);
            }
        }
    }

    fn reconnect(&mut self) -> Result<()> {
        self.close();
        self.player = Some(self.start_player()?);
        Ok(())
    }

    fn archives_source(&self) -> bool {
        self.options.recording_dir.is_some()
            && !matches!(self.descriptor, SourceDescriptor::Synthetic { .. })
    }
}

impl Drop for SnapshotCapture {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// Synthetic player
// ----------------------------------------------------------------------------

struct SyntheticPlayer {
    source: SyntheticSource,
    last_render: Option<Instant>,
}

impl SyntheticPlayer {
    fn new(source: SyntheticSource) -> Self {
        Self {
            source,
            last_render: None,
        }
    }

    /// Render the next frame into the artifact at the source's frame rate.
    fn render(&mut self, artifact: &Path) -> Result<()> {
        let interval = Duration::from_secs_f64(1.0 / self.source.fps());
        if let Some(last) = self.last_render {
            if let Some(remaining) = interval.checked_sub(last.elapsed()) {
                std::thread::sleep(remaining);
            }
        }
        self.last_render = Some(Instant::now());

        let frame = self.source.next_frame()?;
        let staging = artifact.with_extension("jpg.tmp");
        {
            let file = File::create(&staging)
                .with_context(|| format!("create {}", staging.display()))?;
            let mut writer = BufWriter::new(file);
            write_jpeg(&frame, &mut writer)?;
        }
        std::fs::rename(&staging, artifact)
            .with_context(|| format!("publish snapshot {}", artifact.display()))
    }
}

// ----------------------------------------------------------------------------
// FFmpeg player process
// ----------------------------------------------------------------------------

struct ProcessPlayer {
    child: Child,
    target_fps: Option<f64>,
    last_modified: Option<SystemTime>,
}

impl ProcessPlayer {
    fn spawn(args: &[String], target_fps: Option<f64>) -> Result<Self> {
        let binary =
            std::env::var(PLAYER_BIN_ENV).unwrap_or_else(|_| DEFAULT_PLAYER_BIN.to_string());
        let child = Command::new(&binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn player {}", binary))?;
        Ok(Self {
            child,
            target_fps,
            last_modified: None,
        })
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = match self.target_fps {
            Some(fps) if fps > 0.0 => ((1000.0 / fps) as u64).saturating_mul(4),
            _ => 2_000,
        };
        Duration::from_millis(base_ms.max(2_000))
    }

    /// Block until the player has published a frame newer than the last one seen.
    fn wait_for_frame(&mut self, artifact: &Path, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().context("poll player")? {
                anyhow::bail!("player exited with {}", status);
            }
            let modified = std::fs::metadata(artifact).and_then(|m| m.modified()).ok();
            if modified.is_some() && modified != self.last_modified {
                self.last_modified = modified;
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("no new frame from player within {:?}", timeout);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn stop(&mut self) {
        if let Err(err) = self.child.kill() {
            log::debug!("player already gone: {}", err);
        }
        let _ = self.child.wait();
    }
}

impl Drop for ProcessPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Command line for the player: decode the source and keep overwriting one JPEG
/// with the latest frame, optionally archiving the untouched stream alongside.
fn player_args(
    descriptor: &SourceDescriptor,
    options: &BackendOptions,
    artifact: &Path,
    recording: Option<&Path>,
) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    if descriptor.is_rtsp() {
        let transport = if options.rtsp_tcp { "tcp" } else { "udp" };
        args.extend(["-rtsp_transport".to_string(), transport.to_string()]);
    }
    if let SourceDescriptor::Usb { .. } = descriptor {
        args.extend(["-f".to_string(), "v4l2".to_string()]);
    }
    args.extend(["-i".to_string(), descriptor.media_address()]);

    args.push("-an".to_string());
    if let Some(fps) = options.target_fps.filter(|fps| *fps > 0.0) {
        args.extend(["-vf".to_string(), format!("fps={}", fps)]);
    }
    args.extend(
        ["-q:v", "2", "-f", "image2", "-update", "1", "-atomic_writing", "1", "-y"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(artifact.display().to_string());

    if let Some(path) = recording {
        args.extend(
            ["-map", "0:v", "-c:v", "copy", "-f", "mpegts"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(path.display().to_string());
    }
    args
}

fn artifact_path(feed_name: &str) -> PathBuf {
    let safe: String = feed_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    std::env::temp_dir().join(format!(
        "temp_snapshot_frame_{}_{}.jpg",
        safe,
        std::process::id()
    ))
}
