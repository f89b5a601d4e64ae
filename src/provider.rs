//! Chunk decode engine
//!
//! Owns the single in-flight decode slot, the one pending-request slot, the
//! decoded-chunk cache, and the pipeline mutex that serializes decode work.
//! Results are delivered progressively over a per-request event channel:
//! one `Frame` event per decoded frame, then `Completed`, or exactly one
//! `Rejected` if the request was superseded or its decode failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::cache::{ChunkCache, DecodedChunk};
use crate::chunk::{validate_frame_numbers, BlockType, Chunk, ImageQuality};
use crate::error::{RejectReason, ValidationError};
use crate::frame::{crop_image, Frame};
use crate::mp4::Mp4File;
use crate::worker::{
    spawn_archive_worker, ArchiveEvent, ArchiveExtractBackend, ArchiveRequest, ArchiveWorker,
    VideoDecodeBackend, VideoDecodeOptions, VideoEvent, VideoWorker,
};

/// How long a pipeline thread waits on a worker event before re-checking
/// whether the provider was closed.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Provider configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProviderConfig {
    /// Maximum number of decoded chunks kept in the cache (minimum 1)
    pub cached_chunks_limit: usize,
    /// Target render width for video frames
    pub render_width: u32,
    /// Target render height for video frames
    pub render_height: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            cached_chunks_limit: 5,
            render_width: 1280,
            render_height: 720,
        }
    }
}

/// Progressive decode results for one submission.
#[derive(Debug)]
pub enum DecodeEvent {
    /// One frame became available; sent as soon as the worker produces it
    Frame { number: u32, image: Arc<Frame> },
    /// All requested frames were decoded and the chunk is now cached
    Completed,
    /// The request will produce nothing further; sent at most once
    Rejected(RejectReason),
}

/// A request accepted by `submit` but not yet decoding.
struct DecodeRequest {
    chunk: Chunk,
    chunk_index: u32,
    frame_numbers: Vec<u32>,
    events: Sender<DecodeEvent>,
}

/// The request currently holding the pipeline lock.
struct InFlight {
    chunk_index: u32,
    /// Swapped in place when a same-chunk submission arrives mid-decode
    events: Sender<DecodeEvent>,
}

struct State {
    pending: Option<DecodeRequest>,
    in_flight: Option<InFlight>,
    cache: ChunkCache,
    render_size: (u32, u32),
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Exactly one holder at a time; guards a whole decode pass
    pipeline: Mutex<()>,
}

type VideoBackendFactory = dyn Fn() -> Box<dyn VideoDecodeBackend> + Send + Sync;
type ChunkIndexFn = dyn Fn(u32) -> u32 + Send + Sync;

/// The chunk decode engine.
///
/// `submit` is fire-and-forget: decode work happens on background threads
/// and surfaces only through the submission's event channel. Read-only
/// queries may be called from any thread at any time.
pub struct FrameProvider {
    shared: Arc<Shared>,
    chunk_index_for_frame: Arc<ChunkIndexFn>,
    video_backend_factory: Arc<VideoBackendFactory>,
    archive_worker: ArchiveWorker,
}

impl FrameProvider {
    /// Create a provider.
    ///
    /// `chunk_index_for_frame` encodes the caller's fixed chunk size: it
    /// maps a global frame number to the index of the chunk containing it.
    /// `video_backend` is invoked once per video decode pass; the archive
    /// backend lives on a persistent worker thread until `close`.
    pub fn new<F, V>(
        config: ProviderConfig,
        chunk_index_for_frame: F,
        video_backend: V,
        archive_backend: Box<dyn ArchiveExtractBackend>,
    ) -> Self
    where
        F: Fn(u32) -> u32 + Send + Sync + 'static,
        V: Fn() -> Box<dyn VideoDecodeBackend> + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                pending: None,
                in_flight: None,
                cache: ChunkCache::new(config.cached_chunks_limit),
                render_size: (config.render_width, config.render_height),
                closed: false,
            }),
            pipeline: Mutex::new(()),
        });
        Self {
            shared,
            chunk_index_for_frame: Arc::new(chunk_index_for_frame),
            video_backend_factory: Arc::new(video_backend),
            archive_worker: spawn_archive_worker(archive_backend),
        }
    }

    /// Submit a chunk for decoding.
    ///
    /// Never blocks. Supersession policy, in order:
    /// 1. A pending request exists: it receives `Rejected(Outdated)` and is
    ///    replaced by this one (same or different chunk index).
    /// 2. No pending request and the in-flight decode is for the same
    ///    chunk: the in-flight event channel is swapped for this one (the
    ///    old channel receives `Rejected(Outdated)`); the running decode
    ///    now reports to the new caller.
    /// 3. Otherwise this request becomes pending.
    ///
    /// A pipeline start is attempted unconditionally afterwards; it is a
    /// no-op while a decode is running.
    pub fn submit(
        &self,
        chunk: Chunk,
        chunk_index: u32,
        frame_numbers: Vec<u32>,
        events: Sender<DecodeEvent>,
    ) -> Result<(), ValidationError> {
        validate_frame_numbers(&frame_numbers)?;

        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(ValidationError::Closed);
            }

            let request = DecodeRequest {
                chunk,
                chunk_index,
                frame_numbers,
                events,
            };

            if let Some(old) = state.pending.take() {
                log::debug!(
                    "chunk {} superseded by chunk {} while pending",
                    old.chunk_index,
                    chunk_index
                );
                let _ = old.events.send(DecodeEvent::Rejected(RejectReason::Outdated));
                state.pending = Some(request);
            } else {
                match state.in_flight.as_mut() {
                    Some(in_flight) if in_flight.chunk_index == chunk_index => {
                        // same chunk is already decoding: reroute its results
                        let old = std::mem::replace(&mut in_flight.events, request.events);
                        let _ = old.send(DecodeEvent::Rejected(RejectReason::Outdated));
                    }
                    _ => state.pending = Some(request),
                }
            }
        }

        self.start_pipeline(chunk_index);
        Ok(())
    }

    /// Spawn a pipeline pass for the request that `trigger_index` queued.
    /// The thread blocks until the pipeline mutex is free; acquiring it
    /// while the pending slot no longer matches the trigger means the
    /// request was superseded in the meantime.
    fn start_pipeline(&self, trigger_index: u32) {
        let shared = Arc::clone(&self.shared);
        let video_factory = Arc::clone(&self.video_backend_factory);
        let archive_tx = self.archive_worker.sender();

        thread::spawn(move || {
            let _guard = shared.pipeline.lock();

            let request = {
                let mut state = shared.state.lock();
                if state.closed {
                    return;
                }
                match state.pending.take() {
                    None => return, // an earlier pass already consumed it
                    Some(p) if p.chunk_index != trigger_index => {
                        log::debug!(
                            "pending chunk {} outdated at pipeline start (trigger was {})",
                            p.chunk_index,
                            trigger_index
                        );
                        let _ = p.events.send(DecodeEvent::Rejected(RejectReason::Outdated));
                        return;
                    }
                    Some(p) => {
                        state.in_flight = Some(InFlight {
                            chunk_index: p.chunk_index,
                            events: p.events.clone(),
                        });
                        state.cache.begin_insert(p.chunk_index);
                        state.cache.cleanup(1);
                        p
                    }
                }
            };

            log::debug!(
                "decoding chunk {} ({} frames)",
                request.chunk_index,
                request.frame_numbers.len()
            );

            let result = match request.chunk.block_type {
                BlockType::Mp4Video => decode_video_chunk(&shared, &request, video_factory.as_ref()),
                BlockType::ImageArchive { quality } => {
                    decode_archive_chunk(&shared, &request, archive_tx.as_ref(), quality)
                }
            };

            let mut state = shared.state.lock();
            let Some(in_flight) = state.in_flight.take() else {
                return; // closed mid-decode
            };
            match result {
                Ok(decoded) => {
                    state
                        .cache
                        .install(request.chunk_index, DecodedChunk::new(decoded));
                    let _ = in_flight.events.send(DecodeEvent::Completed);
                }
                Err(message) => {
                    log::warn!("chunk {} failed to decode: {}", request.chunk_index, message);
                    state.cache.abort_insert(request.chunk_index);
                    let _ = in_flight
                        .events
                        .send(DecodeEvent::Rejected(RejectReason::Worker(message)));
                }
            }
            // pipeline guard drops here; per-pass workers are joined inside
            // the decode helpers
        });
    }

    /// Cached image for a frame, or `None` if its chunk is not cached or
    /// the frame was not decoded within it. Never blocks on decode work and
    /// never triggers any.
    pub fn frame(&self, frame_number: u32) -> Option<Arc<Frame>> {
        let chunk_index = (self.chunk_index_for_frame)(frame_number);
        let state = self.shared.state.lock();
        state.cache.get(chunk_index)?.frame(frame_number)
    }

    /// Whether a chunk's frames are fully decoded and cached.
    pub fn is_chunk_cached(&self, chunk_index: u32) -> bool {
        self.shared.state.lock().cache.contains(chunk_index)
    }

    /// Whether another chunk can be cached without evicting.
    pub fn has_free_space(&self) -> bool {
        let state = self.shared.state.lock();
        state.cache.len() < state.cache.capacity()
    }

    /// Cached chunk indices in ascending order, optionally including the
    /// chunk currently being decoded.
    pub fn cached_chunks(&self, include_in_progress: bool) -> Vec<u32> {
        let state = self.shared.state.lock();
        let mut indices = state.cache.indices();
        if include_in_progress {
            if let Some(in_flight) = &state.in_flight {
                if !indices.contains(&in_flight.chunk_index) {
                    indices.push(in_flight.chunk_index);
                    indices.sort_unstable();
                }
            }
        }
        indices
    }

    /// Set the target render size used to crop decoder padding.
    pub fn set_render_size(&self, width: u32, height: u32) {
        self.shared.state.lock().render_size = (width, height);
    }

    /// Tear the provider down: reject the pending and in-flight requests,
    /// terminate the workers, and release every cached image handle. The
    /// provider accepts no submissions afterwards.
    pub fn close(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(pending) = state.pending.take() {
                let _ = pending
                    .events
                    .send(DecodeEvent::Rejected(RejectReason::Outdated));
            }
            // the pass itself observes `closed` and stops without caching;
            // its listener still gets a terminal event
            if let Some(in_flight) = state.in_flight.take() {
                let _ = in_flight
                    .events
                    .send(DecodeEvent::Rejected(RejectReason::Outdated));
            }
            state.cache.clear();
        }
        self.archive_worker.terminate();
        log::debug!("frame provider closed");
    }
}

impl Drop for FrameProvider {
    fn drop(&mut self) {
        self.close();
    }
}

/// Deliver one frame to whichever listener currently owns the in-flight
/// request. Looked up fresh per frame so a mid-decode listener swap takes
/// effect immediately, and sent under the same lock `submit` swaps under,
/// so a channel that saw `Rejected` never sees a frame afterwards. The
/// channel is unbounded; the send cannot block while the lock is held.
fn send_frame(shared: &Shared, number: u32, image: &Arc<Frame>) {
    let state = shared.state.lock();
    if let Some(in_flight) = state.in_flight.as_ref() {
        let _ = in_flight.events.send(DecodeEvent::Frame {
            number,
            image: Arc::clone(image),
        });
    }
}

fn is_closed(shared: &Shared) -> bool {
    shared.state.lock().closed
}

/// Decode an MP4 chunk: parse the box tree, feed SPS/PPS and every sample's
/// NAL units to a fresh video worker, and collect one frame per sample.
fn decode_video_chunk(
    shared: &Shared,
    request: &DecodeRequest,
    video_factory: &VideoBackendFactory,
) -> Result<HashMap<u32, Arc<Frame>>, String> {
    let mp4 = Mp4File::parse(request.chunk.data.clone()).map_err(|e| e.to_string())?;
    let track = mp4
        .video_track()
        .ok_or_else(|| "chunk has no video track".to_string())?;
    let avc = track
        .avc
        .as_ref()
        .ok_or_else(|| "video track has no AVC configuration".to_string())?;

    let needed = request.frame_numbers.len();
    if (track.sample_count() as usize) < needed {
        return Err(format!(
            "chunk holds {} samples but {} frames were requested",
            track.sample_count(),
            needed
        ));
    }

    let mut worker = VideoWorker::spawn(video_factory());
    worker.init(VideoDecodeOptions::default())?;
    for sps in &avc.sps {
        worker.send_nal(sps.clone())?;
    }
    for pps in &avc.pps {
        worker.send_nal(pps.clone())?;
    }
    for sample in 0..needed as u32 {
        for nal in mp4
            .nal_units_for_sample(track, sample)
            .map_err(|e| e.to_string())?
        {
            worker.send_nal(nal)?;
        }
    }
    worker.finish_input();

    let mut decoded = HashMap::with_capacity(needed);
    let mut produced = 0usize;
    while produced < needed {
        if is_closed(shared) {
            return Err("provider closed during decode".to_string());
        }
        match worker.events().recv_timeout(WORKER_POLL_INTERVAL) {
            Ok(VideoEvent::Frame {
                data,
                width,
                height,
            }) => {
                let (render_width, render_height) = shared.state.lock().render_size;
                let image = Arc::new(normalize_video_frame(
                    data,
                    width,
                    height,
                    render_width,
                    render_height,
                ));
                let number = request.frame_numbers[produced];
                send_frame(shared, number, &image);
                decoded.insert(number, image);
                produced += 1;
            }
            Ok(VideoEvent::Error(message)) => return Err(message),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                return Err(format!(
                    "video worker produced {} of {} frames",
                    produced, needed
                ));
            }
        }
    }
    Ok(decoded)
    // worker handle drops here, joining the per-pass thread
}

/// Crop a decoded video buffer to the true output dimensions.
///
/// Some decoders report a height padded to a macroblock multiple; the true
/// dimensions follow from the requested render height and the reported
/// height via an integer scale factor.
fn normalize_video_frame(
    data: Bytes,
    width: u32,
    height: u32,
    render_width: u32,
    render_height: u32,
) -> Frame {
    if render_width == 0 || render_height == 0 || height == 0 {
        return Frame::new(data, width, height);
    }
    let scale = render_height.div_ceil(height).max(1);
    let dst_width = (render_width / scale).min(width).max(1);
    let dst_height = (render_height / scale).min(height).max(1);
    let cropped = crop_image(&data, width, height, dst_width, dst_height);
    Frame::new(cropped, dst_width, dst_height)
}

/// Decode an archive chunk: one request to the persistent archive worker,
/// one frame per extracted entry.
fn decode_archive_chunk(
    shared: &Shared,
    request: &DecodeRequest,
    archive_tx: Option<&crossbeam_channel::Sender<ArchiveRequest>>,
    quality: ImageQuality,
) -> Result<HashMap<u32, Arc<Frame>>, String> {
    let archive_tx = archive_tx.ok_or_else(|| "archive worker terminated".to_string())?;
    let needed = request.frame_numbers.len();
    let (events_tx, events_rx) = unbounded();
    archive_tx
        .send(ArchiveRequest {
            archive: request.chunk.data.clone(),
            start: 0,
            end: needed as u32,
            quality,
            events: events_tx,
        })
        .map_err(|_| "archive worker terminated".to_string())?;

    let mut decoded = HashMap::with_capacity(needed);
    while decoded.len() < needed {
        if is_closed(shared) {
            return Err("provider closed during decode".to_string());
        }
        match events_rx.recv_timeout(WORKER_POLL_INTERVAL) {
            Ok(ArchiveEvent::Entry { index, image, .. }) => {
                let Some(&number) = request.frame_numbers.get(index as usize) else {
                    return Err(format!("archive entry index {} out of range", index));
                };
                send_frame(shared, number, &image);
                decoded.insert(number, image);
            }
            Ok(ArchiveEvent::Error(message)) => return Err(message),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                return Err(format!(
                    "archive worker produced {} of {} entries",
                    decoded.len(),
                    needed
                ));
            }
        }
    }
    Ok(decoded)
}
