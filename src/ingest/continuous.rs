//! Continuous-read capture backend.
//!
//! Holds an open decode session and pulls one frame per `capture_one` call.
//! Synthetic (`stub:`) sources generate frames in-process; every other source
//! is decoded with FFmpeg when the `capture-ffmpeg` feature is enabled.

use anyhow::{anyhow, Result};

#[cfg(feature = "capture-ffmpeg")]
use super::ffmpeg::FfmpegCapture;
use super::synthetic::SyntheticSource;
use super::{BackendKind, BackendOptions, CaptureBackend, SourceDescriptor, SourceInfo};
use crate::frame::Frame;

/// Continuous pull-based capture.
pub struct ContinuousCapture {
    descriptor: SourceDescriptor,
    options: BackendOptions,
    session: Option<ContinuousSession>,
}

enum ContinuousSession {
    Synthetic(SyntheticSource),
    #[cfg(feature = "capture-ffmpeg")]
    Ffmpeg(Box<FfmpegCapture>),
}

impl ContinuousCapture {
    pub fn new(descriptor: SourceDescriptor, options: BackendOptions) -> Self {
        Self {
            descriptor,
            options,
            session: None,
        }
    }

    fn connect_session(&self) -> Result<ContinuousSession> {
        match &self.descriptor {
            SourceDescriptor::Synthetic { params, .. } => {
                log::info!(
                    "ContinuousCapture: connected to {} (synthetic)",
                    self.descriptor
                );
                Ok(ContinuousSession::Synthetic(SyntheticSource::new(
                    params.clone(),
                )))
            }
            #[cfg(feature = "capture-ffmpeg")]
            descriptor => {
                let capture = FfmpegCapture::open(descriptor, &self.options)?;
                log::info!("ContinuousCapture: connected to {} (ffmpeg)", descriptor);
                Ok(ContinuousSession::Ffmpeg(Box::new(capture)))
            }
            #[cfg(not(feature = "capture-ffmpeg"))]
            descriptor => Err(anyhow!(
                "continuous capture of {} for {} requires the capture-ffmpeg feature",
                descriptor,
                self.options.feed_name
            )),
        }
    }
}

impl CaptureBackend for ContinuousCapture {
    fn name(&self) -> &'static str {
        "continuous"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Continuous
    }

    fn open(&mut self) -> Result<SourceInfo> {
        if self.session.is_none() {
            self.session = Some(self.connect_session()?);
        }
        match &self.session {
            Some(ContinuousSession::Synthetic(source)) => Ok(source.info()),
            #[cfg(feature = "capture-ffmpeg")]
            Some(ContinuousSession::Ffmpeg(capture)) => Ok(capture.info()),
            None => Ok(SourceInfo::default()),
        }
    }

    fn capture_one(&mut self) -> Result<Frame> {
        match &mut self.session {
            Some(ContinuousSession::Synthetic(source)) => source.next_frame(),
            #[cfg(feature = "capture-ffmpeg")]
            Some(ContinuousSession::Ffmpeg(capture)) => capture.next_frame(),
            None => Err(anyhow!("{} is not connected", self.descriptor)),
        }
    }

    fn close(&mut self) {
        self.session = None;
    }

    fn reconnect(&mut self) -> Result<()> {
        self.close();
        self.session = Some(self.connect_session()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_capture() -> ContinuousCapture {
        let desc = SourceDescriptor::parse("stub:front?width=64&height=48&fps=25").unwrap();
        ContinuousCapture::new(desc, BackendOptions::new("front"))
    }

    #[test]
    fn open_reports_source_dimensions() -> Result<()> {
        let mut capture = stub_capture();
        let info = capture.open()?;
        assert!(info.is_ready());
        assert_eq!((info.width, info.height), (64, 48));
        assert_eq!(info.fps, 25.0);
        Ok(())
    }

    #[test]
    fn capture_requires_open_session() -> Result<()> {
        let mut capture = stub_capture();
        assert!(capture.capture_one().is_err());

        capture.open()?;
        let frame = capture.capture_one()?;
        assert_eq!((frame.width, frame.height), (64, 48));

        capture.close();
        capture.close();
        assert!(capture.capture_one().is_err());
        Ok(())
    }

    #[test]
    fn reconnect_restores_capture() -> Result<()> {
        let mut capture = stub_capture();
        capture.open()?;
        capture.close();
        capture.reconnect()?;
        assert!(capture.capture_one().is_ok());
        Ok(())
    }

    #[cfg(not(feature = "capture-ffmpeg"))]
    #[test]
    fn network_sources_need_ffmpeg() {
        let desc = SourceDescriptor::parse("rtsp://camera.local/stream").unwrap();
        let mut capture = ContinuousCapture::new(desc, BackendOptions::new("cam"));
        assert!(capture.open().is_err());
    }
}
