//! Best-effort archival of captured frames.
//!
//! A `RecordingSink` receives every successfully captured frame of one source.
//! Archival must never break acquisition: the stream worker logs sink failures
//! and carries on.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::frame::Frame;

const JPEG_QUALITY: u8 = 85;

/// Receives raw frames for archival.
pub trait RecordingSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close the archive.
    fn release(&mut self) -> Result<()>;
}

/// Everything a sink needs to know about the stream it archives.
#[derive(Clone, Debug)]
pub struct RecordingRequest {
    pub dir: PathBuf,
    pub feed_name: String,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

/// Builds the sink for a stream once its source is initialised.
pub type RecorderFactory =
    Arc<dyn Fn(&RecordingRequest) -> Result<Box<dyn RecordingSink>> + Send + Sync>;

/// Factory producing `MjpegRecorder`s.
pub fn mjpeg_recorder_factory() -> RecorderFactory {
    Arc::new(|request: &RecordingRequest| {
        let recorder = MjpegRecorder::create(request)?;
        Ok(Box::new(recorder) as Box<dyn RecordingSink>)
    })
}

/// `orig_<name>_<YYYY_MM_DD_HH-MM-SS>.<extension>`
pub fn recording_file_name(feed_name: &str, extension: &str, now: DateTime<Local>) -> String {
    format!(
        "orig_{}_{}.{}",
        feed_name,
        now.format("%Y_%m_%d_%H-%M-%S"),
        extension
    )
}

/// Create `dir` if needed and return the path of a new archive file in it.
pub fn prepare_recording_path(dir: &Path, feed_name: &str, extension: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create recording dir {}", dir.display()))?;
    Ok(dir.join(recording_file_name(feed_name, extension, Local::now())))
}

/// Motion-JPEG archive: each frame appended as a complete JPEG image.
pub struct MjpegRecorder {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    width: u32,
    height: u32,
    frames_written: u64,
}

impl MjpegRecorder {
    pub fn create(request: &RecordingRequest) -> Result<Self> {
        let path = prepare_recording_path(&request.dir, &request.feed_name, "mjpeg")?;
        let file = File::create(&path)
            .with_context(|| format!("create recording {}", path.display()))?;
        log::info!(
            "recording {} at {:.1} fps ({}x{}) to {}",
            request.feed_name,
            request.fps,
            request.width,
            request.height,
            path.display()
        );
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            width: request.width,
            height: request.height,
            frames_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl RecordingSink for MjpegRecorder {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height {
            return Err(anyhow!(
                "frame is {}x{}, recording expects {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            ));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("recording {} already released", self.path.display()))?;
        write_jpeg(frame, writer)?;
        self.frames_written += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .with_context(|| format!("flush recording {}", self.path.display()))?;
        }
        Ok(())
    }
}

impl Drop for MjpegRecorder {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::warn!("{}", err);
        }
    }
}

/// Encode `frame` as a baseline JPEG into `writer`.
pub(crate) fn write_jpeg<W: Write>(frame: &Frame, writer: &mut W) -> Result<()> {
    let image = frame.to_image()?;
    JpegEncoder::new_with_quality(writer, JPEG_QUALITY)
        .encode_image(&image)
        .context("encode jpeg")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn solid_frame(width: u32, height: u32) -> Frame {
        Frame::new(vec![120u8; (width * height * 3) as usize], width, height, 1).unwrap()
    }

    #[test]
    fn file_name_uses_feed_name_and_timestamp() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap();
        assert_eq!(
            recording_file_name("gate", "mjpeg", now),
            "orig_gate_2024_03_09_07-05-02.mjpeg"
        );
    }

    #[test]
    fn recorder_appends_jpeg_frames() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let request = RecordingRequest {
            dir: dir.path().join("nested"),
            feed_name: "gate".to_string(),
            fps: 10.0,
            width: 16,
            height: 8,
        };
        let mut recorder = MjpegRecorder::create(&request)?;
        recorder.write(&solid_frame(16, 8))?;
        recorder.write(&solid_frame(16, 8))?;
        recorder.release()?;

        assert_eq!(recorder.frames_written(), 2);
        let bytes = std::fs::read(recorder.path())?;
        // Two JPEG start-of-image markers.
        let soi = bytes.windows(2).filter(|w| *w == [0xFF, 0xD8]).count();
        assert!(soi >= 2);
        Ok(())
    }

    #[test]
    fn recorder_rejects_mismatched_frames() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let request = RecordingRequest {
            dir: dir.path().to_path_buf(),
            feed_name: "gate".to_string(),
            fps: 10.0,
            width: 16,
            height: 8,
        };
        let mut recorder = MjpegRecorder::create(&request)?;
        assert!(recorder.write(&solid_frame(8, 8)).is_err());
        recorder.release()?;
        assert!(recorder.write(&solid_frame(16, 8)).is_err());
        Ok(())
    }
}
