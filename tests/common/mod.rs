//! Shared fixtures for the integration tests: a synthetic MP4 builder and
//! stub decode backends.

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use frame_provider::worker::{ArchiveEntry, RawVideoFrame};
use frame_provider::{
    ArchiveExtractBackend, DecodeEvent, ImageQuality, VideoDecodeBackend, VideoDecodeOptions,
};

pub const SPS_NAL: [u8; 4] = [0x67, 0x42, 0x00, 0x1E];
pub const PPS_NAL: [u8; 2] = [0x68, 0xCE];

/// Marker byte of the slice NAL for a given sample index.
pub fn slice_marker(sample: u32) -> u8 {
    0x80 + sample as u8
}

fn boxed(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&(8 + payload.len() as u32).to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(payload);
    out
}

/// Full-box payload: version byte, zero flags, then the body.
fn full_box(fourcc: &[u8; 4], version: u8, body: &[u8]) -> Vec<u8> {
    let mut payload = vec![version, 0, 0, 0];
    payload.extend_from_slice(body);
    boxed(fourcc, &payload)
}

/// One sample's mdat bytes: a single length-prefixed two-byte slice NAL.
fn sample_bytes(sample: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&2u32.to_be_bytes());
    out.extend_from_slice(&[slice_marker(sample), 0x00]);
    out
}

pub const SAMPLE_SIZE: u32 = 6;
pub const SAMPLES_PER_CHUNK: u32 = 3;

fn avcc_payload(version: u8) -> Vec<u8> {
    let mut out = vec![version, 66, 0, 30, 0xFF, 0xE1];
    out.extend_from_slice(&(SPS_NAL.len() as u16).to_be_bytes());
    out.extend_from_slice(&SPS_NAL);
    out.push(1);
    out.extend_from_slice(&(PPS_NAL.len() as u16).to_be_bytes());
    out.extend_from_slice(&PPS_NAL);
    out
}

fn avc1_entry(width: u16, height: u16, avcc_version: u8) -> Vec<u8> {
    let mut entry = Vec::new();
    entry.extend_from_slice(&[0; 6]); // reserved
    entry.extend_from_slice(&1u16.to_be_bytes()); // data reference index
    entry.extend_from_slice(&[0; 16]); // pre_defined + reserved
    entry.extend_from_slice(&width.to_be_bytes());
    entry.extend_from_slice(&height.to_be_bytes());
    entry.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // 72 dpi
    entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    entry.extend_from_slice(&[0; 4]); // reserved
    entry.extend_from_slice(&1u16.to_be_bytes()); // frame count
    entry.extend_from_slice(&[0; 32]); // compressor name
    entry.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
    entry.extend_from_slice(&0xFFFFu16.to_be_bytes()); // pre_defined
    entry.extend_from_slice(&boxed(b"avcC", &avcc_payload(avcc_version)));

    let mut out = Vec::new();
    out.extend_from_slice(&(8 + entry.len() as u32).to_be_bytes());
    out.extend_from_slice(b"avc1");
    out.extend_from_slice(&entry);
    out
}

/// Build a minimal but structurally valid MP4 video fragment.
///
/// `mdat` precedes `moov` so chunk offsets are known without backpatching.
/// Every sample is `SAMPLE_SIZE` bytes (one two-byte slice NAL behind a
/// four-byte length prefix) and chunks hold `SAMPLES_PER_CHUNK` samples.
pub fn sample_mp4(sample_count: u32) -> Bytes {
    sample_mp4_with(sample_count, 1)
}

/// Same as [`sample_mp4`] but with a chosen avcC configuration version, so
/// tests can produce a structurally broken codec configuration.
pub fn sample_mp4_with(sample_count: u32, avcc_version: u8) -> Bytes {
    let ftyp = {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"isom");
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(b"isom");
        boxed(b"ftyp", &payload)
    };

    let mut mdat_payload = Vec::new();
    for sample in 0..sample_count {
        mdat_payload.extend_from_slice(&sample_bytes(sample));
    }
    let mdat = boxed(b"mdat", &mdat_payload);
    let mdat_data_start = ftyp.len() as u32 + 8;

    let chunk_count = sample_count.div_ceil(SAMPLES_PER_CHUNK);
    let mut stco_body = Vec::new();
    stco_body.extend_from_slice(&chunk_count.to_be_bytes());
    for chunk in 0..chunk_count {
        let offset = mdat_data_start + chunk * SAMPLES_PER_CHUNK * SAMPLE_SIZE;
        stco_body.extend_from_slice(&offset.to_be_bytes());
    }

    let mut stsd_body = Vec::new();
    stsd_body.extend_from_slice(&1u32.to_be_bytes());
    stsd_body.extend_from_slice(&avc1_entry(4, 4, avcc_version));

    let mut stts_body = Vec::new();
    stts_body.extend_from_slice(&1u32.to_be_bytes());
    stts_body.extend_from_slice(&sample_count.to_be_bytes());
    stts_body.extend_from_slice(&1u32.to_be_bytes());

    let mut stsc_body = Vec::new();
    stsc_body.extend_from_slice(&1u32.to_be_bytes());
    stsc_body.extend_from_slice(&1u32.to_be_bytes()); // first_chunk
    stsc_body.extend_from_slice(&SAMPLES_PER_CHUNK.to_be_bytes());
    stsc_body.extend_from_slice(&1u32.to_be_bytes()); // description index

    let mut stsz_body = Vec::new();
    stsz_body.extend_from_slice(&SAMPLE_SIZE.to_be_bytes());
    stsz_body.extend_from_slice(&sample_count.to_be_bytes());

    let stbl = {
        let mut payload = Vec::new();
        payload.extend_from_slice(&full_box(b"stsd", 0, &stsd_body));
        payload.extend_from_slice(&full_box(b"stts", 0, &stts_body));
        payload.extend_from_slice(&full_box(b"stsc", 0, &stsc_body));
        payload.extend_from_slice(&full_box(b"stsz", 0, &stsz_body));
        payload.extend_from_slice(&full_box(b"stco", 0, &stco_body));
        boxed(b"stbl", &payload)
    };

    let minf = boxed(b"minf", &stbl);

    let mdhd = {
        let mut body = vec![0; 8]; // creation / modification times
        body.extend_from_slice(&25u32.to_be_bytes()); // timescale
        body.extend_from_slice(&sample_count.to_be_bytes()); // duration
        full_box(b"mdhd", 0, &body)
    };

    let hdlr = {
        let mut body = vec![0; 4]; // pre_defined
        body.extend_from_slice(b"vide");
        body.extend_from_slice(&[0; 12]); // reserved
        body.push(0); // empty name
        full_box(b"hdlr", 0, &body)
    };

    let mdia = {
        let mut payload = Vec::new();
        payload.extend_from_slice(&mdhd);
        payload.extend_from_slice(&hdlr);
        payload.extend_from_slice(&minf);
        boxed(b"mdia", &payload)
    };

    let tkhd = {
        let mut body = vec![0; 8]; // creation / modification times
        body.extend_from_slice(&1u32.to_be_bytes()); // track id
        body.extend_from_slice(&[0; 4]); // reserved
        full_box(b"tkhd", 0, &body)
    };

    let trak = {
        let mut payload = Vec::new();
        payload.extend_from_slice(&tkhd);
        payload.extend_from_slice(&mdia);
        boxed(b"trak", &payload)
    };

    let mvhd = {
        let mut body = vec![0; 8]; // creation / modification times
        body.extend_from_slice(&25u32.to_be_bytes()); // timescale
        body.extend_from_slice(&sample_count.to_be_bytes()); // duration
        full_box(b"mvhd", 0, &body)
    };

    let moov = {
        let mut payload = Vec::new();
        payload.extend_from_slice(&mvhd);
        payload.extend_from_slice(&trak);
        boxed(b"moov", &payload)
    };

    let mut file = Vec::new();
    file.extend_from_slice(&ftyp);
    file.extend_from_slice(&mdat);
    file.extend_from_slice(&moov);
    Bytes::from(file)
}

/// Video backend stub: parameter sets produce nothing, every slice NAL
/// produces one 4x4 frame filled with the NAL's marker byte.
pub struct StubVideo {
    initialized: bool,
}

impl StubVideo {
    pub fn new() -> Self {
        Self { initialized: false }
    }
}

impl VideoDecodeBackend for StubVideo {
    fn init(&mut self, _options: &VideoDecodeOptions) -> anyhow::Result<()> {
        self.initialized = true;
        Ok(())
    }

    fn decode(&mut self, nal: &[u8]) -> anyhow::Result<Vec<RawVideoFrame>> {
        anyhow::ensure!(self.initialized, "decode before init");
        let kind = nal.first().copied().unwrap_or(0);
        if kind == 0x67 || kind == 0x68 {
            return Ok(Vec::new());
        }
        Ok(vec![RawVideoFrame {
            data: Bytes::from(vec![kind; 4 * 4 * 4]),
            width: 4,
            height: 4,
        }])
    }
}

/// Archive backend stub: emits one synthetic PNG per requested entry. Each
/// pixel's red channel carries the entry index.
pub struct StubArchive {
    /// Number of concurrently running `extract` calls, shared with the test
    pub active: Arc<AtomicUsize>,
    /// Highest concurrency ever observed
    pub max_active: Arc<AtomicUsize>,
    /// Extra latency per entry, to widen race windows
    pub delay: Duration,
}

impl StubArchive {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }
}

pub fn png_bytes(shade: u8) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([shade, 0, 0, 255]));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

impl ArchiveExtractBackend for StubArchive {
    fn extract(
        &mut self,
        _archive: &Bytes,
        start: u32,
        end: u32,
        _quality: ImageQuality,
        emit: &mut dyn FnMut(ArchiveEntry),
    ) -> anyhow::Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        for index in 0..(end - start) {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            emit(ArchiveEntry {
                name: format!("{:06}.png", start + index),
                index,
                data: png_bytes(index as u8),
            });
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Archive backend that always fails.
pub struct BrokenArchive;

impl ArchiveExtractBackend for BrokenArchive {
    fn extract(
        &mut self,
        _archive: &Bytes,
        _start: u32,
        _end: u32,
        _quality: ImageQuality,
        _emit: &mut dyn FnMut(ArchiveEntry),
    ) -> anyhow::Result<()> {
        anyhow::bail!("archive is corrupt")
    }
}

/// Drain a decode event channel until a terminal event (`Completed` or
/// `Rejected`) arrives, or panic after `timeout` of silence.
pub fn collect_until_terminal(rx: &Receiver<DecodeEvent>, timeout: Duration) -> Vec<DecodeEvent> {
    let mut events = Vec::new();
    loop {
        match rx.recv_timeout(timeout) {
            Ok(event) => {
                let terminal =
                    matches!(event, DecodeEvent::Completed | DecodeEvent::Rejected(_));
                events.push(event);
                if terminal {
                    return events;
                }
            }
            Err(RecvTimeoutError::Timeout) => panic!("no decode event within {:?}", timeout),
            Err(RecvTimeoutError::Disconnected) => return events,
        }
    }
}
