//! Captured frames and per-source frame buffering.
//!
//! - `Frame`: packed RGB24 pixels plus dimensions and a capture sequence number.
//! - `CropRect`: LTRB crop applied by the acquisition loop at insertion time.
//! - `FrameBuffer`: bounded, drop-oldest buffer shared by one producer and one consumer.
//! - `ResizeFn`: optional hook applied to frames at read time.

use anyhow::{anyhow, Result};
use image::{imageops::FilterType, RgbImage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Bytes per pixel of every frame produced by the ingestion layer.
pub const CHANNELS: usize = 3;

/// Buffer capacity used when neither the caller nor the source list says otherwise.
pub const DEFAULT_QUEUE_SIZE: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A single captured frame in packed RGB24 layout (no row padding).
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Per-source capture counter, starting at 1.
    pub sequence: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(anyhow!(
                "frame data is {} bytes, expected {} for {}x{} RGB",
                data.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
            captured_at: Instant::now(),
        })
    }

    pub fn from_image(image: RgbImage, sequence: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn to_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }

    /// Copy out the region covered by `rect`.
    pub fn crop(&self, rect: &CropRect) -> Result<Frame> {
        if !rect.fits_within(self.width, self.height) {
            return Err(anyhow!(
                "crop {:?} exceeds frame {}x{}",
                rect,
                self.width,
                self.height
            ));
        }
        let row_bytes = self.width as usize * CHANNELS;
        let start_col = rect.left as usize * CHANNELS;
        let crop_row_bytes = rect.width() as usize * CHANNELS;

        let mut data = Vec::with_capacity(crop_row_bytes * rect.height() as usize);
        for row in rect.top as usize..rect.bottom as usize {
            let start = row * row_bytes + start_col;
            data.extend_from_slice(&self.data[start..start + crop_row_bytes]);
        }

        Ok(Frame {
            data,
            width: rect.width(),
            height: rect.height(),
            sequence: self.sequence,
            captured_at: self.captured_at,
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// CropRect
// ----------------------------------------------------------------------------

/// Crop rectangle in LTRB pixel coordinates; `right` and `bottom` are exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropRect {
    pub fn new(left: u32, top: u32, right: u32, bottom: u32) -> Result<Self> {
        if right <= left || bottom <= top {
            return Err(anyhow!(
                "invalid frame crop [{}, {}, {}, {}]: right/bottom must exceed left/top",
                left,
                top,
                right,
                bottom
            ));
        }
        Ok(Self {
            left,
            top,
            right,
            bottom,
        })
    }

    /// Build from signed LTRB values, as found in config files.
    pub fn from_ltrb(values: &[i64]) -> Result<Self> {
        let [l, t, r, b] = values else {
            return Err(anyhow!(
                "frame crop needs exactly 4 values (LTRB), got {}",
                values.len()
            ));
        };
        let coord = |v: i64| {
            u32::try_from(v).map_err(|_| anyhow!("frame crop coordinate {} is out of range", v))
        };
        Self::new(coord(*l)?, coord(*t)?, coord(*r)?, coord(*b)?)
    }

    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.right <= width && self.bottom <= height
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

/// Maximum number of frames a `FrameBuffer` keeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferCapacity {
    Bounded(usize),
    /// Never evict. Used for file playback, which should be consumed in full.
    Unbounded,
}

impl BufferCapacity {
    pub fn limit(&self) -> Option<usize> {
        match self {
            BufferCapacity::Bounded(n) => Some((*n).max(1)),
            BufferCapacity::Unbounded => None,
        }
    }
}

impl Default for BufferCapacity {
    fn default() -> Self {
        BufferCapacity::Bounded(DEFAULT_QUEUE_SIZE)
    }
}

/// Bounded FIFO of the most recent frames for one source.
///
/// Written by the source's acquisition thread and read by the consumer on
/// another thread; all synchronization is internal, so every method takes `&self`.
/// When full, a push evicts the oldest frame first, so a lagging consumer loses
/// old frames instead of blocking the producer.
pub struct FrameBuffer {
    frames: Mutex<VecDeque<Frame>>,
    capacity: BufferCapacity,
    evicted: AtomicU64,
}

impl FrameBuffer {
    pub fn new(capacity: BufferCapacity) -> Self {
        let initial = capacity.limit().unwrap_or(DEFAULT_QUEUE_SIZE);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(initial)),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    /// Insert a frame, returning the evicted frame if the buffer was full.
    pub fn push(&self, frame: Frame) -> Option<Frame> {
        let mut frames = self.lock();
        let evicted = match self.capacity.limit() {
            Some(limit) if frames.len() >= limit => frames.pop_front(),
            _ => None,
        };
        if evicted.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(frame);
        evicted
    }

    /// Remove and return the oldest buffered frame.
    pub fn pop_oldest(&self) -> Option<Frame> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn capacity(&self) -> BufferCapacity {
        self.capacity
    }

    /// Frames dropped by the eviction policy since creation.
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Frame>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(BufferCapacity::default())
    }
}

// ----------------------------------------------------------------------------
// Read-time resize hook
// ----------------------------------------------------------------------------

/// Transformation applied to each frame as it is read out of a buffer.
pub type ResizeFn = Arc<dyn Fn(Frame) -> Frame + Send + Sync>;

/// Hook that downsizes frames taller than `max_height`, keeping the aspect ratio.
pub fn resize_to_max_height(max_height: u32) -> ResizeFn {
    let max_height = max_height.max(1);
    Arc::new(move |frame: Frame| {
        if frame.height <= max_height {
            return frame;
        }
        let scale = max_height as f64 / frame.height as f64;
        let width = ((frame.width as f64 * scale).round() as u32).max(1);
        match frame.to_image() {
            Ok(image) => {
                let resized = image::imageops::resize(&image, width, max_height, FilterType::Triangle);
                let mut out = Frame::from_image(resized, frame.sequence);
                out.captured_at = frame.captured_at;
                out
            }
            Err(err) => {
                log::warn!("resize skipped: {}", err);
                frame
            }
        }
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(sequence: u64) -> Frame {
        Frame::new(vec![sequence as u8; 4 * 2 * CHANNELS], 4, 2, sequence).unwrap()
    }

    fn gradient_frame(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity(width as usize * height as usize * CHANNELS);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, 0]);
            }
        }
        Frame::new(data, width, height, 1).unwrap()
    }

    #[test]
    fn frame_rejects_mismatched_data() {
        assert!(Frame::new(vec![0u8; 10], 4, 2, 1).is_err());
    }

    #[test]
    fn buffer_keeps_most_recent_frames_in_insertion_order() {
        let buf = FrameBuffer::new(BufferCapacity::Bounded(3));
        for seq in 1..=5 {
            buf.push(make_frame(seq));
        }

        assert_eq!(buf.len(), 3);
        assert_eq!(buf.evicted_count(), 2);
        let order: Vec<u64> = std::iter::from_fn(|| buf.pop_oldest())
            .map(|f| f.sequence)
            .collect();
        assert_eq!(order, vec![3, 4, 5]);
    }

    #[test]
    fn buffer_eviction_holds_for_many_capacities() {
        for capacity in 1..=6usize {
            for extra in 1..=4usize {
                let buf = FrameBuffer::new(BufferCapacity::Bounded(capacity));
                let total = capacity + extra;
                for seq in 1..=total as u64 {
                    buf.push(make_frame(seq));
                }
                assert_eq!(buf.len(), capacity);
                let first = buf.pop_oldest().map(|f| f.sequence);
                assert_eq!(first, Some((extra + 1) as u64));
            }
        }
    }

    #[test]
    fn push_returns_evicted_frame() {
        let buf = FrameBuffer::new(BufferCapacity::Bounded(1));
        assert!(buf.push(make_frame(1)).is_none());
        let evicted = buf.push(make_frame(2)).map(|f| f.sequence);
        assert_eq!(evicted, Some(1));
    }

    #[test]
    fn unbounded_buffer_never_evicts() {
        let buf = FrameBuffer::new(BufferCapacity::Unbounded);
        for seq in 1..=500 {
            buf.push(make_frame(seq));
        }
        assert_eq!(buf.len(), 500);
        assert_eq!(buf.evicted_count(), 0);
    }

    #[test]
    fn pop_on_empty_buffer_is_none() {
        let buf = FrameBuffer::default();
        assert!(buf.pop_oldest().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_capacity_behaves_as_one() {
        let buf = FrameBuffer::new(BufferCapacity::Bounded(0));
        buf.push(make_frame(1));
        buf.push(make_frame(2));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn buffer_supports_concurrent_producer_and_consumer() {
        let buf = Arc::new(FrameBuffer::new(BufferCapacity::Bounded(4)));
        let producer = {
            let buf = buf.clone();
            std::thread::spawn(move || {
                for seq in 1..=1000 {
                    buf.push(make_frame(seq));
                }
            })
        };
        let mut last_seen = 0;
        while !producer.is_finished() || !buf.is_empty() {
            if let Some(frame) = buf.pop_oldest() {
                assert!(frame.sequence > last_seen, "frames must come out in order");
                last_seen = frame.sequence;
            }
        }
        producer.join().unwrap();
        assert!(buf.len() <= 4);
    }

    #[test]
    fn crop_extracts_region() -> Result<()> {
        let frame = gradient_frame(8, 6);
        let rect = CropRect::new(2, 1, 5, 4)?;
        let cropped = frame.crop(&rect)?;

        assert_eq!((cropped.width, cropped.height), (3, 3));
        // First pixel of the crop is (x=2, y=1) of the source.
        assert_eq!(&cropped.data()[..3], &[2, 1, 0]);
        // Last pixel is (x=4, y=3).
        assert_eq!(&cropped.data()[cropped.data().len() - 3..], &[4, 3, 0]);
        Ok(())
    }

    #[test]
    fn crop_outside_frame_is_rejected() -> Result<()> {
        let frame = gradient_frame(8, 6);
        let rect = CropRect::new(0, 0, 9, 6)?;
        assert!(frame.crop(&rect).is_err());
        Ok(())
    }

    #[test]
    fn crop_rect_validation() {
        assert!(CropRect::new(5, 0, 5, 10).is_err());
        assert!(CropRect::new(0, 7, 10, 3).is_err());
        assert!(CropRect::from_ltrb(&[-1, 0, 10, 10]).is_err());
        assert!(CropRect::from_ltrb(&[0, 0, 10]).is_err());
        assert_eq!(
            CropRect::from_ltrb(&[1, 2, 11, 22]).unwrap(),
            CropRect {
                left: 1,
                top: 2,
                right: 11,
                bottom: 22
            }
        );
    }

    #[test]
    fn resize_hook_limits_height_and_keeps_aspect() {
        let hook = resize_to_max_height(3);
        let resized = hook(gradient_frame(8, 6));
        assert_eq!((resized.width, resized.height), (4, 3));
        assert_eq!(resized.data().len(), 4 * 3 * CHANNELS);

        let untouched = hook(gradient_frame(4, 2));
        assert_eq!((untouched.width, untouched.height), (4, 2));
    }
}
