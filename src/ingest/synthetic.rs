//! Synthetic frame generator for `stub:` sources.

use anyhow::Result;

use super::source::SyntheticParams;
use super::SourceInfo;
use crate::frame::{Frame, CHANNELS};

pub(crate) struct SyntheticSource {
    params: SyntheticParams,
    frame_count: u64,
    /// Simulated scene state so consecutive frames differ visibly.
    scene_state: u8,
}

impl SyntheticSource {
    pub(crate) fn new(params: SyntheticParams) -> Self {
        Self {
            params,
            frame_count: 0,
            scene_state: 0,
        }
    }

    pub(crate) fn info(&self) -> SourceInfo {
        SourceInfo {
            fps: self.params.fps,
            width: self.params.width,
            height: self.params.height,
        }
    }

    pub(crate) fn fps(&self) -> f64 {
        self.params.fps
    }

    pub(crate) fn next_frame(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::new(
            pixels,
            self.params.width,
            self.params.height,
            self.frame_count,
        )
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = self.params.width as usize * self.params.height as usize * CHANNELS;

        if self.frame_count.is_multiple_of(50) {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_have_requested_dimensions_and_sequence() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticParams {
            width: 32,
            height: 16,
            fps: 5.0,
        });
        let first = source.next_frame()?;
        let second = source.next_frame()?;

        assert_eq!((first.width, first.height), (32, 16));
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_ne!(first.data(), second.data());
        Ok(())
    }
}
