//! Multi-source aggregator.
//!
//! `VideoManager` owns one `VideoStream` per configured source and fans
//! start/stop/read/info out across all of them in configuration order. A source
//! without a buffered frame yields `None` from `read()`; failures of one source
//! never reach the others.

use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::descriptor::{self, SourceEntry};
use crate::frame::{resize_to_max_height, BufferCapacity, CropRect, Frame, ResizeFn};
use crate::ingest::CaptureMethod;
use crate::stream::{StreamConfig, VideoInfo, VideoStream};

/// Settings shared by every stream of a manager.
#[derive(Clone)]
pub struct ManagerOptions {
    /// `None` selects the default: unbounded for all-file lists, bounded otherwise.
    pub buffer_capacity: Option<BufferCapacity>,
    pub recording_dir: Option<PathBuf>,
    pub reconnect_threshold: Duration,
    pub do_reconnect: bool,
    /// Downsize frames taller than this at read time.
    pub max_height: Option<u32>,
    pub method: CaptureMethod,
    pub frame_crop: Option<CropRect>,
    pub rtsp_tcp: bool,
    pub producer_pause_threshold: usize,
    /// Custom read-time hook; takes precedence over `max_height`.
    pub resize_fn: Option<ResizeFn>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        let stream = StreamConfig::default();
        Self {
            buffer_capacity: None,
            recording_dir: None,
            reconnect_threshold: stream.reconnect_threshold,
            do_reconnect: stream.do_reconnect,
            max_height: None,
            method: CaptureMethod::default(),
            frame_crop: None,
            rtsp_tcp: stream.rtsp_tcp,
            producer_pause_threshold: stream.producer_pause_threshold,
            resize_fn: None,
        }
    }
}

impl std::fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("buffer_capacity", &self.buffer_capacity)
            .field("recording_dir", &self.recording_dir)
            .field("reconnect_threshold", &self.reconnect_threshold)
            .field("do_reconnect", &self.do_reconnect)
            .field("max_height", &self.max_height)
            .field("method", &self.method)
            .field("frame_crop", &self.frame_crop)
            .field("rtsp_tcp", &self.rtsp_tcp)
            .field("producer_pause_threshold", &self.producer_pause_threshold)
            .field("resize_fn", &self.resize_fn.is_some())
            .finish()
    }
}

impl ManagerOptions {
    fn resolve_capacity(&self, entries: &[SourceEntry]) -> BufferCapacity {
        match self.buffer_capacity {
            Some(capacity) => capacity,
            None if descriptor::all_files(entries) => BufferCapacity::Unbounded,
            None => BufferCapacity::default(),
        }
    }

    fn resize_hook(&self) -> Option<ResizeFn> {
        self.resize_fn
            .clone()
            .or_else(|| self.max_height.map(resize_to_max_height))
    }

    fn stream_config(&self, entry: &SourceEntry, capacity: BufferCapacity) -> StreamConfig {
        StreamConfig {
            reconnect_threshold: self.reconnect_threshold,
            do_reconnect: self.do_reconnect,
            frame_crop: self.frame_crop,
            buffer_capacity: capacity,
            producer_pause_threshold: self.producer_pause_threshold,
            manual_fps: entry.manual_fps,
            recording_dir: self.recording_dir.clone(),
            rtsp_tcp: self.rtsp_tcp,
            ..StreamConfig::default()
        }
    }
}

/// Named collection of stream workers.
pub struct VideoManager {
    videos: Vec<(String, VideoStream)>,
    stopped: bool,
}

impl VideoManager {
    /// Build one worker per entry. Names must be unique.
    pub fn new(entries: Vec<SourceEntry>, options: &ManagerOptions) -> Result<Self> {
        let capacity = options.resolve_capacity(&entries);
        let resize = options.resize_hook();
        let mut streams = Vec::with_capacity(entries.len());
        for entry in &entries {
            let stream = VideoStream::new(
                entry.name.clone(),
                entry.descriptor.clone(),
                options.stream_config(entry, capacity),
                options.method,
            );
            stream.set_resize_fn(resize.clone());
            streams.push(stream);
        }
        Self::from_streams(streams)
    }

    /// Wrap workers built elsewhere.
    pub fn from_streams(streams: Vec<VideoStream>) -> Result<Self> {
        let mut seen = HashSet::new();
        for stream in &streams {
            if !seen.insert(stream.name().to_string()) {
                return Err(anyhow!("duplicate source name {:?}", stream.name()));
            }
        }
        log::info!("video manager built with {} source(s)", streams.len());
        Ok(Self {
            videos: streams
                .into_iter()
                .map(|stream| (stream.name().to_string(), stream))
                .collect(),
            stopped: true,
        })
    }

    /// Build from a `name,type:address[,fps]` source list file.
    pub fn from_list_file(path: &Path, options: &ManagerOptions) -> Result<Self> {
        let entries = descriptor::load_source_list(path)?;
        Self::new(entries, options)
    }

    pub fn start(&mut self) -> Result<()> {
        if !self.stopped {
            return Ok(());
        }
        for (index, (name, stream)) in self.videos.iter().enumerate() {
            if let Err(err) = stream.start() {
                for (_, started) in &self.videos[..index] {
                    started.stop();
                }
                return Err(err.context(format!("start {}", name)));
            }
        }
        self.stopped = false;
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        for (_, stream) in &self.videos {
            stream.stop();
        }
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// One entry per source in configuration order; `None` when a source has no frame buffered.
    pub fn read(&self) -> Vec<Option<Frame>> {
        self.videos.iter().map(|(_, stream)| stream.read()).collect()
    }

    /// Open any source not yet initialised, then report metadata for all of them.
    pub fn get_all_videos_information(&self) -> Vec<VideoInfo> {
        for (_, stream) in &self.videos {
            stream.ensure_inited();
        }
        self.update_info()
    }

    /// Metadata as currently known, without opening anything.
    pub fn update_info(&self) -> Vec<VideoInfo> {
        self.videos.iter().map(|(_, stream)| stream.info()).collect()
    }

    pub fn check_all_stopped(&self) -> bool {
        self.videos.iter().all(|(_, stream)| stream.is_stopped())
    }

    pub fn check_any_stopped(&self) -> bool {
        self.videos.iter().any(|(_, stream)| stream.is_stopped())
    }

    pub fn len(&self) -> usize {
        self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.videos.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn stream(&self, name: &str) -> Option<&VideoStream> {
        self.videos
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, stream)| stream)
    }
}

impl Drop for VideoManager {
    fn drop(&mut self) {
        self.stop();
    }
}
