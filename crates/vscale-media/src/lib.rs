//! FFmpeg CLI wrapper for the chunk pipeline.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building and a timeout-bounded runner
//! - Stream probing via ffprobe
//! - Segment splitting (`SegmentSplitter`)
//! - The per-segment frame transform (`FrameTransform`)
//! - Concatenation and audio remuxing for reassembly (`ReassemblyTool`)

pub mod command;
pub mod error;
pub mod probe;
pub mod reassembly;
pub mod splitter;
pub mod transform;

pub use command::{FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use probe::{probe_media, MediaInfo};
pub use reassembly::{concat_manifest, FfmpegReassembler, ReassemblyTool};
pub use splitter::{FfmpegSplitter, SegmentSplitter, DEFAULT_SEGMENT_SECONDS};
pub use transform::{CommandTransform, FfmpegUpscaler, FrameTransform};
