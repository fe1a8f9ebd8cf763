//! Multi-source video acquisition.
//!
//! Ingests frames from cameras, video files and network streams, keeps the most
//! recent frames of each source in a bounded buffer, and recovers from source
//! failures without stopping the rest of the pipeline.
//!
//! # Architecture
//!
//! - A **stream worker** (`VideoStream`) runs one background acquisition loop per
//!   source. Failed captures start a countdown; when it runs out the worker either
//!   reconnects the source or, with reconnection disabled and nothing left to
//!   consume, stops itself.
//! - The **frame buffer** keeps at most N frames and evicts the oldest on overflow,
//!   so a slow consumer loses old frames instead of blocking capture.
//! - **Capture backends** turn a source into frames, either by continuous decoding
//!   or by snapshots of a live-rendering player.
//! - The **aggregator** (`VideoManager`) fans start/stop/read/info out over all
//!   named sources and reports "no frame yet" as `None`.
//!
//! # Module Structure
//!
//! - `frame`: Frame, CropRect, FrameBuffer, read-time resize hook
//! - `ingest`: capture backends and source descriptors
//! - `stream`: per-source worker and its state machine
//! - `manager`: multi-source aggregator
//! - `descriptor`: `name,type:address[,fps]` source lists
//! - `record`: best-effort archival of captured frames
//! - `config`: config file and environment overrides

pub mod config;
pub mod descriptor;
pub mod frame;
pub mod ingest;
pub mod manager;
pub mod record;
pub mod stream;

pub use config::ManagerConfig;
pub use descriptor::{
    load_source_list, parse_entry, parse_source_list, DescriptorError, EntryError, SourceEntry,
};
pub use frame::{
    resize_to_max_height, BufferCapacity, CropRect, Frame, FrameBuffer, ResizeFn,
    DEFAULT_QUEUE_SIZE,
};
pub use ingest::{
    open_backend, BackendKind, BackendOptions, CaptureBackend, CaptureMethod, SourceDescriptor,
    SourceInfo, SourceParseError,
};
pub use manager::{ManagerOptions, VideoManager};
pub use record::{MjpegRecorder, RecorderFactory, RecordingRequest, RecordingSink};
pub use stream::{StreamConfig, StreamState, VideoInfo, VideoStream};
