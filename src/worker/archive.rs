//! Archive worker thread
//!
//! A persistent thread owned by the engine for the lifetime of the provider.
//! Each request carries the archive bytes, a half-open entry range, and a
//! per-request reply channel; the worker extracts entries through an opaque
//! backend, decodes the image bytes to RGBA, and streams one event per
//! entry. After the first error for a request no further events are sent
//! for it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::chunk::ImageQuality;
use crate::frame::Frame;

/// One extracted archive entry: still-encoded image bytes.
#[derive(Debug)]
pub struct ArchiveEntry {
    /// Entry name inside the archive
    pub name: String,
    /// Zero-based position relative to the request's `start`
    pub index: u32,
    /// Encoded image bytes (PNG, JPEG, ...)
    pub data: Vec<u8>,
}

/// An opaque archive extractor: yields the entries of `archive` whose
/// positions fall in `start..end`, calling `emit` once per entry in order.
pub trait ArchiveExtractBackend: Send {
    fn extract(
        &mut self,
        archive: &Bytes,
        start: u32,
        end: u32,
        quality: ImageQuality,
        emit: &mut dyn FnMut(ArchiveEntry),
    ) -> anyhow::Result<()>;
}

/// One chunk's worth of extraction work.
pub struct ArchiveRequest {
    pub archive: Bytes,
    /// Half-open zero-based entry range
    pub start: u32,
    pub end: u32,
    pub quality: ImageQuality,
    /// Per-request reply channel
    pub events: Sender<ArchiveEvent>,
}

/// Events streamed back for one request.
#[derive(Debug)]
pub enum ArchiveEvent {
    /// One decoded entry
    Entry {
        name: String,
        index: u32,
        image: Arc<Frame>,
    },
    /// Extraction or decode failure; nothing further follows
    Error(String),
}

/// Handle to the persistent archive worker thread.
pub struct ArchiveWorker {
    request_tx: Option<Sender<ArchiveRequest>>,
    handle: Option<JoinHandle<()>>,
}

pub fn spawn_archive_worker(backend: Box<dyn ArchiveExtractBackend>) -> ArchiveWorker {
    let (request_tx, request_rx) = unbounded::<ArchiveRequest>();
    let handle = thread::spawn(move || worker_loop(backend, request_rx));
    ArchiveWorker {
        request_tx: Some(request_tx),
        handle: Some(handle),
    }
}

impl ArchiveWorker {
    /// A clone of the request channel for use from pipeline threads.
    pub(crate) fn sender(&self) -> Option<Sender<ArchiveRequest>> {
        self.request_tx.clone()
    }

    /// Stop the worker and wait for it to exit.
    pub fn terminate(&mut self) {
        self.request_tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ArchiveWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn worker_loop(mut backend: Box<dyn ArchiveExtractBackend>, request_rx: Receiver<ArchiveRequest>) {
    while let Ok(request) = request_rx.recv() {
        let ArchiveRequest {
            archive,
            start,
            end,
            quality,
            events,
        } = request;

        let mut failed = false;
        let result = backend.extract(&archive, start, end, quality, &mut |entry| {
            if failed {
                return;
            }
            match decode_entry(&entry) {
                Ok(image) => {
                    // receiver gone means the request was abandoned
                    let _ = events.send(ArchiveEvent::Entry {
                        name: entry.name,
                        index: entry.index,
                        image: Arc::new(image),
                    });
                }
                Err(e) => {
                    log::warn!("archive entry '{}' failed to decode: {:#}", entry.name, e);
                    failed = true;
                    let _ = events.send(ArchiveEvent::Error(e.to_string()));
                }
            }
        });

        if let Err(e) = result {
            log::warn!("archive extraction failed: {:#}", e);
            if !failed {
                let _ = events.send(ArchiveEvent::Error(e.to_string()));
            }
        }
    }
}

/// Decode one entry's encoded image bytes into a packed RGBA frame.
fn decode_entry(entry: &ArchiveEntry) -> anyhow::Result<Frame> {
    let decoded = image::load_from_memory(&entry.data)?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(Frame::new(Bytes::from(rgba.into_raw()), width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_bytes(shade: u8) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([shade, 0, 0, 255]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    /// Emits one synthetic PNG per index in range; entry name mimics an
    /// archive listing.
    struct StubArchive;

    impl ArchiveExtractBackend for StubArchive {
        fn extract(
            &mut self,
            _archive: &Bytes,
            start: u32,
            end: u32,
            _quality: ImageQuality,
            emit: &mut dyn FnMut(ArchiveEntry),
        ) -> anyhow::Result<()> {
            for index in 0..(end - start) {
                emit(ArchiveEntry {
                    name: format!("{:06}.png", start + index),
                    index,
                    data: png_bytes(index as u8),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_entries_are_decoded_in_order() {
        let worker = spawn_archive_worker(Box::new(StubArchive));
        let (tx, rx) = unbounded();
        worker
            .sender()
            .unwrap()
            .send(ArchiveRequest {
                archive: Bytes::new(),
                start: 0,
                end: 3,
                quality: ImageQuality::Compressed,
                events: tx,
            })
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            match rx.recv().unwrap() {
                ArchiveEvent::Entry { index, image, .. } => {
                    assert_eq!(image.width, 2);
                    assert!(image.is_valid());
                    seen.push(index);
                }
                ArchiveEvent::Error(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_corrupt_entry_fires_single_error() {
        struct Corrupt;
        impl ArchiveExtractBackend for Corrupt {
            fn extract(
                &mut self,
                _archive: &Bytes,
                _start: u32,
                end: u32,
                _quality: ImageQuality,
                emit: &mut dyn FnMut(ArchiveEntry),
            ) -> anyhow::Result<()> {
                for index in 0..end {
                    emit(ArchiveEntry {
                        name: format!("{}.png", index),
                        index,
                        data: vec![0xde, 0xad], // not an image
                    });
                }
                Ok(())
            }
        }

        let worker = spawn_archive_worker(Box::new(Corrupt));
        let (tx, rx) = unbounded();
        worker
            .sender()
            .unwrap()
            .send(ArchiveRequest {
                archive: Bytes::new(),
                start: 0,
                end: 4,
                quality: ImageQuality::Original,
                events: tx,
            })
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ArchiveEvent::Error(_)));
    }
}
