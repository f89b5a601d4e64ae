//! ISO base-media ("MP4") box parsing
//!
//! A chunk delivered as an MP4 fragment is parsed into a tree of typed,
//! sized boxes; the tables inside `moov/trak/mdia/minf/stbl` become
//! per-track sample tables from which the engine pulls codec parameter sets
//! and per-sample NAL units. A structurally invalid container is not
//! recoverable: fixed-value fields (reserved bytes, version numbers) are
//! checked and parsing fails fast with [`ContainerError`].

mod tables;

pub use tables::{AvcConfiguration, ChunkPosition, StscEntry, SttsEntry, Track};

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Four-character box type code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({})", self)
    }
}

pub const FTYP: FourCc = FourCc::new(b"ftyp");
pub const MOOV: FourCc = FourCc::new(b"moov");
pub const MVHD: FourCc = FourCc::new(b"mvhd");
pub const TRAK: FourCc = FourCc::new(b"trak");
pub const TKHD: FourCc = FourCc::new(b"tkhd");
pub const MDIA: FourCc = FourCc::new(b"mdia");
pub const MDHD: FourCc = FourCc::new(b"mdhd");
pub const HDLR: FourCc = FourCc::new(b"hdlr");
pub const MINF: FourCc = FourCc::new(b"minf");
pub const STBL: FourCc = FourCc::new(b"stbl");
pub const STSD: FourCc = FourCc::new(b"stsd");
pub const AVC1: FourCc = FourCc::new(b"avc1");
pub const AVCC: FourCc = FourCc::new(b"avcC");
pub const STTS: FourCc = FourCc::new(b"stts");
pub const STSS: FourCc = FourCc::new(b"stss");
pub const STSC: FourCc = FourCc::new(b"stsc");
pub const STSZ: FourCc = FourCc::new(b"stsz");
pub const STCO: FourCc = FourCc::new(b"stco");

/// Handler type of a video track (`hdlr`).
pub const HANDLER_VIDEO: FourCc = FourCc::new(b"vide");

/// Box types whose payload is a sequence of child boxes.
const CONTAINER_TYPES: [FourCc; 5] = [MOOV, TRAK, MDIA, MINF, STBL];

/// Structurally invalid container data. Fatal for the parse attempt; the
/// engine surfaces it as a worker failure for the chunk being processed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContainerError {
    #[error("unexpected end of data while reading {0}")]
    Truncated(&'static str),
    #[error("`{box_type}` box: unsupported version {version}")]
    UnsupportedVersion { box_type: FourCc, version: u8 },
    #[error("`{box_type}` box: reserved field holds a non-zero value")]
    NonZeroReserved { box_type: FourCc },
    #[error("`{box_type}` box: {reason}")]
    Malformed {
        box_type: FourCc,
        reason: &'static str,
    },
    #[error("required `{0}` box is missing")]
    MissingBox(&'static str),
    #[error("sample {sample} out of range: track has {count} samples")]
    SampleOutOfRange { sample: u32, count: u32 },
}

/// Forward-only cursor over a byte buffer. Slices are zero-copy views into
/// the underlying `Bytes`.
pub(crate) struct Cursor {
    data: Bytes,
    pos: usize,
}

impl Cursor {
    pub(crate) fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize, ctx: &'static str) -> Result<&[u8], ContainerError> {
        if self.remaining() < n {
            return Err(ContainerError::Truncated(ctx));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self, ctx: &'static str) -> Result<u8, ContainerError> {
        Ok(self.take(1, ctx)?[0])
    }

    pub(crate) fn read_u16(&mut self, ctx: &'static str) -> Result<u16, ContainerError> {
        let b = self.take(2, ctx)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u32(&mut self, ctx: &'static str) -> Result<u32, ContainerError> {
        let b = self.take(4, ctx)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_u64(&mut self, ctx: &'static str) -> Result<u64, ContainerError> {
        let b = self.take(8, ctx)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub(crate) fn read_fourcc(&mut self, ctx: &'static str) -> Result<FourCc, ContainerError> {
        let b = self.take(4, ctx)?;
        Ok(FourCc([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_bytes(
        &mut self,
        n: usize,
        ctx: &'static str,
    ) -> Result<Bytes, ContainerError> {
        if self.remaining() < n {
            return Err(ContainerError::Truncated(ctx));
        }
        let slice = self.data.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, n: usize, ctx: &'static str) -> Result<(), ContainerError> {
        self.take(n, ctx).map(|_| ())
    }

    /// Consume `n` bytes that the format defines as zero.
    pub(crate) fn expect_zeros(
        &mut self,
        n: usize,
        box_type: FourCc,
    ) -> Result<(), ContainerError> {
        let bytes = self.take(n, "reserved field")?;
        if bytes.iter().any(|&b| b != 0) {
            return Err(ContainerError::NonZeroReserved { box_type });
        }
        Ok(())
    }

    /// Consume a full-box header, checking the version against the allowed
    /// set and returning it.
    pub(crate) fn read_full_box_header(
        &mut self,
        box_type: FourCc,
        allowed_versions: &[u8],
    ) -> Result<u8, ContainerError> {
        let version = self.read_u8("full box version")?;
        if !allowed_versions.contains(&version) {
            return Err(ContainerError::UnsupportedVersion { box_type, version });
        }
        self.skip(3, "full box flags")?;
        Ok(version)
    }
}

/// One parsed box.
#[derive(Debug)]
pub enum BoxNode {
    /// Container box: children in file order
    Container(BoxTree),
    /// Leaf box: raw payload, headers stripped
    Leaf(Bytes),
}

/// Ordered children of a container, keyed by box type. Repeated sibling
/// types (multiple `trak` under `moov`) are preserved as a sequence.
#[derive(Debug, Default)]
pub struct BoxTree {
    entries: Vec<(FourCc, BoxNode)>,
}

impl BoxTree {
    /// First child of the given type.
    pub fn first(&self, box_type: FourCc) -> Option<&BoxNode> {
        self.entries
            .iter()
            .find(|(ty, _)| *ty == box_type)
            .map(|(_, node)| node)
    }

    /// All children of the given type, in file order.
    pub fn all(&self, box_type: FourCc) -> impl Iterator<Item = &BoxNode> {
        self.entries
            .iter()
            .filter(move |(ty, _)| *ty == box_type)
            .map(|(_, node)| node)
    }

    /// Payload of the first leaf child of the given type.
    pub(crate) fn leaf(&self, box_type: FourCc, name: &'static str) -> Result<Bytes, ContainerError> {
        match self.first(box_type) {
            Some(BoxNode::Leaf(payload)) => Ok(payload.clone()),
            _ => Err(ContainerError::MissingBox(name)),
        }
    }

    /// First container child of the given type.
    pub(crate) fn container(
        &self,
        box_type: FourCc,
        name: &'static str,
    ) -> Result<&BoxTree, ContainerError> {
        match self.first(box_type) {
            Some(BoxNode::Container(tree)) => Ok(tree),
            _ => Err(ContainerError::MissingBox(name)),
        }
    }
}

/// Walk a byte region as a sequence of `size + fourcc` boxes, recursing into
/// known container types.
pub(crate) fn parse_tree(data: Bytes) -> Result<BoxTree, ContainerError> {
    let mut cursor = Cursor::new(data);
    let mut entries = Vec::new();

    while cursor.remaining() > 0 {
        let size = cursor.read_u32("box size")?;
        let box_type = cursor.read_fourcc("box type")?;

        let payload_len = match size {
            0 => cursor.remaining(), // box extends to the end of the buffer
            1 => {
                let large = cursor.read_u64("box largesize")?;
                let large = usize::try_from(large).map_err(|_| ContainerError::Malformed {
                    box_type,
                    reason: "64-bit box size does not fit in memory",
                })?;
                large.checked_sub(16).ok_or(ContainerError::Malformed {
                    box_type,
                    reason: "largesize smaller than its header",
                })?
            }
            2..=7 => {
                return Err(ContainerError::Malformed {
                    box_type,
                    reason: "box size smaller than its header",
                })
            }
            _ => size as usize - 8,
        };

        let payload = cursor.read_bytes(payload_len, "box payload")?;
        let node = if CONTAINER_TYPES.contains(&box_type) {
            BoxNode::Container(parse_tree(payload)?)
        } else {
            BoxNode::Leaf(payload)
        };
        entries.push((box_type, node));
    }

    Ok(BoxTree { entries })
}

/// A fully parsed MP4 buffer: the movie header, per-track sample tables, and
/// the original bytes (sample data is sliced out of them on demand).
#[derive(Debug)]
pub struct Mp4File {
    data: Bytes,
    /// `ftyp` major brand, when the box is present
    pub major_brand: Option<FourCc>,
    /// Movie timescale (`mvhd`)
    pub timescale: u32,
    /// Movie duration in timescale units (`mvhd`)
    pub duration: u64,
    /// One entry per `trak`
    pub tracks: Vec<Track>,
}

impl Mp4File {
    /// Parse a raw MP4 byte buffer.
    pub fn parse(data: Bytes) -> Result<Self, ContainerError> {
        let tree = parse_tree(data.clone())?;

        let major_brand = match tree.first(FTYP) {
            Some(BoxNode::Leaf(payload)) => {
                let mut cursor = Cursor::new(payload.clone());
                Some(cursor.read_fourcc("ftyp major brand")?)
            }
            _ => None,
        };

        let moov = tree.container(MOOV, "moov")?;
        let (timescale, duration) = parse_mvhd(moov.leaf(MVHD, "mvhd")?)?;

        let mut tracks = Vec::new();
        for trak in moov.all(TRAK) {
            let BoxNode::Container(trak_tree) = trak else {
                return Err(ContainerError::Malformed {
                    box_type: TRAK,
                    reason: "trak is not a container",
                });
            };
            tracks.push(Track::parse(trak_tree)?);
        }
        if tracks.is_empty() {
            return Err(ContainerError::MissingBox("trak"));
        }

        log::debug!(
            "parsed mp4 buffer: {} bytes, {} track(s), timescale {}",
            data.len(),
            tracks.len(),
            timescale
        );

        Ok(Self {
            data,
            major_brand,
            timescale,
            duration,
            tracks,
        })
    }

    /// First track whose handler is `vide`.
    pub fn video_track(&self) -> Option<&Track> {
        self.tracks.iter().find(|t| t.handler == HANDLER_VIDEO)
    }

    /// Split sample `sample` (zero-based) of `track` into its
    /// length-prefixed NAL units.
    ///
    /// Each unit is a zero-copy slice of the original buffer, without the
    /// length prefix.
    pub fn nal_units_for_sample(
        &self,
        track: &Track,
        sample: u32,
    ) -> Result<Vec<Bytes>, ContainerError> {
        let start = track.sample_byte_offset(sample)? as usize;
        let size = track.sample_size(sample)? as usize;
        let end = start
            .checked_add(size)
            .filter(|&e| e <= self.data.len())
            .ok_or(ContainerError::Truncated("sample data"))?;

        let length_size = track
            .avc
            .as_ref()
            .map(|avc| avc.nal_length_size)
            .unwrap_or(4);

        let mut units = Vec::new();
        let mut pos = start;
        while pos < end {
            if pos + length_size > end {
                return Err(ContainerError::Truncated("NAL unit length prefix"));
            }
            let mut unit_len = 0usize;
            for &b in &self.data[pos..pos + length_size] {
                unit_len = (unit_len << 8) | b as usize;
            }
            pos += length_size;
            if pos + unit_len > end {
                return Err(ContainerError::Truncated("NAL unit payload"));
            }
            units.push(self.data.slice(pos..pos + unit_len));
            pos += unit_len;
        }
        Ok(units)
    }
}

fn parse_mvhd(payload: Bytes) -> Result<(u32, u64), ContainerError> {
    let mut cursor = Cursor::new(payload);
    let version = cursor.read_full_box_header(MVHD, &[0, 1])?;
    let (timescale, duration) = if version == 1 {
        cursor.skip(16, "mvhd times")?;
        let timescale = cursor.read_u32("mvhd timescale")?;
        let duration = cursor.read_u64("mvhd duration")?;
        (timescale, duration)
    } else {
        cursor.skip(8, "mvhd times")?;
        let timescale = cursor.read_u32("mvhd timescale")?;
        let duration = cursor.read_u32("mvhd duration")? as u64;
        (timescale, duration)
    };
    if timescale == 0 {
        return Err(ContainerError::Malformed {
            box_type: MVHD,
            reason: "timescale is zero",
        });
    }
    Ok((timescale, duration))
}
