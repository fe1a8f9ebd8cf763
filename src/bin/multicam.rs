//! multicam - run the acquisition engine over a source list
//!
//! Opens every source of a `name,type:address[,fps]` list, prints the per-source
//! metadata, then polls all sources until Ctrl-C, a time limit, or every worker
//! has stopped on its own.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use multicam_ingest::config::{parse_queue_size, ManagerConfig};
use multicam_ingest::{CaptureMethod, VideoManager};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Source list file (`name,type:address[,fps]` per line).
    #[arg(long, env = "MULTICAM_SOURCES")]
    sources: Option<PathBuf>,
    /// Capture method: continuous or snapshot.
    #[arg(long, env = "MULTICAM_METHOD")]
    method: Option<CaptureMethod>,
    /// Frames kept per source, or "unbounded".
    #[arg(long, env = "MULTICAM_QUEUE_SIZE")]
    queue_size: Option<String>,
    /// Archive captured frames under this directory.
    #[arg(long, env = "MULTICAM_RECORDING_DIR")]
    recording_dir: Option<PathBuf>,
    /// Seconds of continuous failure before reconnecting.
    #[arg(long, env = "MULTICAM_RECONNECT_SECS")]
    reconnect_secs: Option<u64>,
    /// Stop a source instead of reconnecting it.
    #[arg(long)]
    no_reconnect: bool,
    /// Downsize frames taller than this at read time.
    #[arg(long, env = "MULTICAM_MAX_HEIGHT")]
    max_height: Option<u32>,
    /// Delay between aggregator reads, in milliseconds.
    #[arg(long, default_value_t = 20)]
    read_interval_ms: u64,
    /// Stop after this many seconds (runs until Ctrl-C when absent).
    #[arg(long)]
    duration_secs: Option<u64>,
    /// Print source metadata as JSON and exit.
    #[arg(long)]
    info: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = ManagerConfig::load()?;
    if let Some(sources) = args.sources {
        cfg.sources = sources;
    }
    if let Some(method) = args.method {
        cfg.method = method;
    }
    if let Some(size) = args.queue_size.as_deref() {
        cfg.queue_size = Some(parse_queue_size(size)?);
    }
    if let Some(dir) = args.recording_dir {
        cfg.recording_dir = Some(dir);
    }
    if let Some(secs) = args.reconnect_secs {
        cfg.reconnect.threshold = Duration::from_secs(secs.max(1));
    }
    if args.no_reconnect {
        cfg.reconnect.enabled = false;
    }
    if let Some(height) = args.max_height {
        cfg.max_height = Some(height.max(1));
    }

    let mut manager = VideoManager::from_list_file(&cfg.sources, &cfg.to_options())
        .with_context(|| format!("load sources from {}", cfg.sources.display()))?;

    let infos = manager.get_all_videos_information();
    if args.info {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }
    for info in &infos {
        log::info!(
            "{}: {}x{} at {:.1} fps (manual fps: {}, initialised: {})",
            info.video_feed_name,
            info.width,
            info.height,
            info.fps,
            info.manual_fps_inputted,
            info.inited
        );
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_handler.store(true, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    manager.start()?;
    log::info!("multicam running {} source(s) (Ctrl-C to stop)", manager.len());

    let started = Instant::now();
    let deadline = args.duration_secs.map(Duration::from_secs);
    let read_interval = Duration::from_millis(args.read_interval_ms);
    let mut delivered = vec![0u64; manager.len()];
    let mut last_health = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        if deadline.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        for (count, frame) in delivered.iter_mut().zip(manager.read()) {
            if frame.is_some() {
                *count += 1;
            }
        }
        if manager.check_all_stopped() {
            log::info!("all sources stopped");
            break;
        }
        if last_health.elapsed() >= HEALTH_LOG_INTERVAL {
            for (name, count) in manager.names().iter().zip(&delivered) {
                if let Some(stream) = manager.stream(name) {
                    log::info!(
                        "{}: {:?}, {} delivered, {} buffered, {} reconnect(s)",
                        name,
                        stream.state(),
                        count,
                        stream.buffered(),
                        stream.reconnect_count()
                    );
                }
            }
            last_health = Instant::now();
        }
        std::thread::sleep(read_interval);
    }

    log::info!("stopping sources...");
    manager.stop();
    Ok(())
}
