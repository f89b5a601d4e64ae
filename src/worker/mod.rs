//! Decode Worker Protocol
//!
//! The engine talks to its decoders through message-passing contracts, not
//! concrete codecs: a per-pass video worker that accepts codec parameter
//! sets and NAL units and emits raw pixel buffers, and a persistent archive
//! worker that accepts an archive buffer plus an index range and emits one
//! image per entry. The actual codecs are opaque backends behind the
//! [`VideoDecodeBackend`] and [`ArchiveExtractBackend`] traits.

mod archive;
mod video;

pub use archive::{
    spawn_archive_worker, ArchiveEntry, ArchiveEvent, ArchiveExtractBackend, ArchiveRequest,
    ArchiveWorker,
};
pub use video::{RawVideoFrame, VideoDecodeBackend, VideoWorker};

use bytes::Bytes;

/// Pixel layout requested from the video backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum ColorFormat {
    #[default]
    Rgba,
    Bgra,
}

/// One-time video worker initialization options.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct VideoDecodeOptions {
    pub color_format: ColorFormat,
    /// Allow the backend to hand out the same output buffer repeatedly
    pub memory_reuse: bool,
}

/// Commands sent to the video worker thread.
#[derive(Debug)]
pub enum VideoCommand {
    /// Sent once before any NAL unit
    Init { options: VideoDecodeOptions },
    /// One elementary bitstream unit; the first two carry SPS then PPS
    Nal { data: Bytes },
}

/// Events from the video worker thread.
#[derive(Debug)]
pub enum VideoEvent {
    /// One decoded frame. The reported height may include codec padding.
    Frame { data: Bytes, width: u32, height: u32 },
    /// Decode failure; the worker stops after sending this
    Error(String),
}
