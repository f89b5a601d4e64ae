//! Video worker thread
//!
//! Owns one opaque video backend for the duration of a single decode pass.
//! The engine feeds it `Init` then one `Nal` message per unit over a channel
//! and reads decoded frames back from the event channel. Dropping the worker
//! handle closes the command channel and joins the thread.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{VideoCommand, VideoDecodeOptions, VideoEvent};
use bytes::Bytes;

/// A raw decoded pixel buffer as produced by a backend.
#[derive(Debug)]
pub struct RawVideoFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

/// An opaque video decoder: accepts parameter sets and NAL units, emits raw
/// pixel buffers. Implementations may buffer internally and emit zero or
/// more frames per unit.
pub trait VideoDecodeBackend: Send {
    /// Called once, before any NAL unit.
    fn init(&mut self, options: &VideoDecodeOptions) -> anyhow::Result<()>;

    /// Feed one NAL unit; returns any frames that became ready.
    fn decode(&mut self, nal: &[u8]) -> anyhow::Result<Vec<RawVideoFrame>>;
}

/// Handle to a per-pass video worker thread.
pub struct VideoWorker {
    command_tx: Option<Sender<VideoCommand>>,
    event_rx: Receiver<VideoEvent>,
    handle: Option<JoinHandle<()>>,
}

impl VideoWorker {
    /// Spawn a worker around the given backend. The channels are unbounded
    /// so the engine can queue a whole chunk's NAL units before draining
    /// frame events.
    pub fn spawn(backend: Box<dyn VideoDecodeBackend>) -> Self {
        let (command_tx, command_rx) = unbounded::<VideoCommand>();
        let (event_tx, event_rx) = unbounded::<VideoEvent>();

        let handle = thread::spawn(move || {
            worker_loop(backend, command_rx, event_tx);
        });

        Self {
            command_tx: Some(command_tx),
            event_rx,
            handle: Some(handle),
        }
    }

    /// Send the one-time init message.
    pub fn init(&self, options: VideoDecodeOptions) -> Result<(), String> {
        self.send(VideoCommand::Init { options })
    }

    /// Send one NAL unit.
    pub fn send_nal(&self, data: Bytes) -> Result<(), String> {
        self.send(VideoCommand::Nal { data })
    }

    fn send(&self, command: VideoCommand) -> Result<(), String> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| "video worker already finished".to_string())?
            .send(command)
            .map_err(|_| "video worker terminated".to_string())
    }

    /// Signal end of input; the worker exits after draining its queue.
    pub fn finish_input(&mut self) {
        self.command_tx = None;
    }

    pub fn events(&self) -> &Receiver<VideoEvent> {
        &self.event_rx
    }
}

impl Drop for VideoWorker {
    fn drop(&mut self) {
        self.command_tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    mut backend: Box<dyn VideoDecodeBackend>,
    command_rx: Receiver<VideoCommand>,
    event_tx: Sender<VideoEvent>,
) {
    while let Ok(command) = command_rx.recv() {
        let result = match command {
            VideoCommand::Init { options } => backend.init(&options).map(|_| Vec::new()),
            VideoCommand::Nal { data } => backend.decode(&data),
        };
        match result {
            Ok(frames) => {
                for frame in frames {
                    let event = VideoEvent::Frame {
                        data: frame.data,
                        width: frame.width,
                        height: frame.height,
                    };
                    if event_tx.send(event).is_err() {
                        return; // engine stopped listening
                    }
                }
            }
            Err(e) => {
                log::warn!("video backend failed: {:#}", e);
                let _ = event_tx.send(VideoEvent::Error(e.to_string()));
                return; // single-fire error policy
            }
        }
    }
}
