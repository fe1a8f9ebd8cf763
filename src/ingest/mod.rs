//! Frame acquisition backends.
//!
//! Every stream worker drives exactly one `CaptureBackend`. Two variants exist:
//! - continuous read (`ContinuousCapture`): pulls one decoded frame per call at the
//!   source's native rate; the worker paces the loop to the target frame rate
//! - snapshot (`SnapshotCapture`): asks a live-rendering player for its current
//!   frame through a transient image artifact; the call itself is rate-limiting
//!
//! Both report failures uniformly as `Err`, never distinguishing causes to the
//! caller. The failure/reconnect policy lives in the stream worker and is written
//! once against this trait.
//!
//! Sources with the `stub:` type tag are synthetic and work with both variants
//! without any capture library. Real decoding needs the `capture-ffmpeg` feature
//! (continuous) or an `ffmpeg` binary on `PATH` (snapshot).

pub mod continuous;
#[cfg(feature = "capture-ffmpeg")]
pub(crate) mod ffmpeg;
pub mod snapshot;
pub mod source;
pub(crate) mod synthetic;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

use crate::frame::Frame;

pub use continuous::ContinuousCapture;
pub use snapshot::SnapshotCapture;
pub use source::{SourceDescriptor, SourceParseError, SyntheticParams};

/// How a backend obtains frames; decides whether the worker paces the loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Continuous,
    Snapshot,
}

/// Capture method selected by configuration for every source of a manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMethod {
    #[default]
    Continuous,
    /// Slower and heavier, but avoids decode artifacts on some network sources.
    Snapshot,
}

impl FromStr for CaptureMethod {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "continuous" => Ok(CaptureMethod::Continuous),
            "snapshot" => Ok(CaptureMethod::Snapshot),
            other => Err(anyhow!(
                "unknown capture method {:?} (expected continuous or snapshot)",
                other
            )),
        }
    }
}

/// What a backend learned about its source when opening it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SourceInfo {
    /// Source-reported frame rate; 0 when unknown.
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

impl SourceInfo {
    /// Dimensions are only known once the source is actually connected.
    pub fn is_ready(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// Per-source settings resolved once when the backend is built.
#[derive(Clone, Debug)]
pub struct BackendOptions {
    /// Human-readable stream name, used for logs and artifact names.
    pub feed_name: String,
    /// Use TCP for RTSP transport (UDP otherwise).
    pub rtsp_tcp: bool,
    /// Frame rate requested by the caller, if any.
    pub target_fps: Option<f64>,
    /// Where the backend should archive the source, if it archives on its own.
    pub recording_dir: Option<PathBuf>,
}

impl BackendOptions {
    pub fn new(feed_name: impl Into<String>) -> Self {
        Self {
            feed_name: feed_name.into(),
            rtsp_tcp: true,
            target_fps: None,
            recording_dir: None,
        }
    }
}

/// Capability shared by both acquisition variants.
pub trait CaptureBackend: Send {
    /// Backend identifier for logs.
    fn name(&self) -> &'static str;

    fn kind(&self) -> BackendKind;

    /// Initialise the source. A source that is reachable but not yet delivering
    /// reports zero dimensions rather than an error; callers may retry.
    fn open(&mut self) -> Result<SourceInfo>;

    /// Obtain exactly one frame.
    fn capture_one(&mut self) -> Result<Frame>;

    /// Release the underlying session. Idempotent.
    fn close(&mut self);

    /// Re-establish the underlying session after a failure.
    fn reconnect(&mut self) -> Result<()>;

    /// True when the backend writes its own archive of the source, so the
    /// worker must not attach a recorder.
    fn archives_source(&self) -> bool {
        false
    }
}

/// Build the backend for `descriptor` using the configured capture method.
pub fn open_backend(
    method: CaptureMethod,
    descriptor: &SourceDescriptor,
    options: BackendOptions,
) -> Box<dyn CaptureBackend> {
    match method {
        CaptureMethod::Continuous => Box::new(ContinuousCapture::new(descriptor.clone(), options)),
        CaptureMethod::Snapshot => Box::new(SnapshotCapture::new(descriptor.clone(), options)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_method_parses_case_insensitively() {
        assert_eq!(
            "Snapshot".parse::<CaptureMethod>().unwrap(),
            CaptureMethod::Snapshot
        );
        assert_eq!(
            "continuous".parse::<CaptureMethod>().unwrap(),
            CaptureMethod::Continuous
        );
        assert!("vlc".parse::<CaptureMethod>().is_err());
    }

    #[test]
    fn source_info_readiness_needs_dimensions() {
        assert!(!SourceInfo::default().is_ready());
        assert!(SourceInfo {
            fps: 0.0,
            width: 640,
            height: 480
        }
        .is_ready());
    }

    #[test]
    fn factory_selects_backend_kind() {
        let desc = SourceDescriptor::parse("stub:front").unwrap();
        let continuous = open_backend(CaptureMethod::Continuous, &desc, BackendOptions::new("a"));
        let snapshot = open_backend(CaptureMethod::Snapshot, &desc, BackendOptions::new("b"));
        assert_eq!(continuous.kind(), BackendKind::Continuous);
        assert_eq!(snapshot.kind(), BackendKind::Snapshot);
    }
}
