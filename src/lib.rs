//! # frame-provider
//!
//! A chunk decode engine for frame-accurate media scrubbing. Media arrives
//! pre-split into fixed-size chunks, each either a fragment of an MP4 video
//! or an archive of per-frame images. The engine decodes whole chunks into
//! RGBA frames, caches a bounded number of decoded chunks, and keeps at most
//! one decode running plus one request waiting at any time; newer requests
//! supersede older waiting ones.
//!
//! The entry point is [`FrameProvider`]: `submit` a [`Chunk`] with the frame
//! numbers it covers and receive [`DecodeEvent`]s progressively over a
//! channel, then look frames up by number with `frame`. The actual codecs
//! sit behind the [`VideoDecodeBackend`] and [`ArchiveExtractBackend`]
//! traits so the engine stays codec-agnostic.

pub mod cache;
pub mod chunk;
pub mod error;
pub mod frame;
pub mod mp4;
pub mod provider;
pub mod worker;

pub use cache::DecodedChunk;
pub use chunk::{BlockType, Chunk, ImageQuality};
pub use error::{RejectReason, ValidationError};
pub use frame::{crop_image, Frame, BYTES_PER_PIXEL};
pub use mp4::{ContainerError, Mp4File};
pub use provider::{DecodeEvent, FrameProvider, ProviderConfig};
pub use worker::{
    ArchiveEntry, ArchiveEvent, ArchiveExtractBackend, ColorFormat, RawVideoFrame,
    VideoDecodeBackend, VideoDecodeOptions,
};
