//! Per-track sample tables and derived queries
//!
//! Parses the `stbl` leaves of a track into table structs and answers the
//! queries the decode engine needs: how many samples a track has, which
//! chunk a sample lives in, and where its bytes sit in the file.

use bytes::Bytes;

use super::{
    BoxNode, BoxTree, ContainerError, Cursor, FourCc, AVC1, AVCC, HDLR, MDHD, MDIA, MINF, STBL,
    STCO, STSC, STSD, STSS, STSZ, STTS, TKHD,
};

/// One row of the decoding-time-to-sample table (`stts`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SttsEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

/// One row of the sample-to-chunk table (`stsc`). `first_chunk` is 1-based,
/// as in the file format; a row describes a run of chunks that lasts until
/// the next row's `first_chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: u32,
}

/// Where a sample lives: zero-based chunk index and the sample's position
/// within that chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPosition {
    pub index: u32,
    pub offset: u32,
}

/// AVC decoder configuration (`avcC`): the parameter sets the video worker
/// must see before any slice NAL unit.
#[derive(Debug, Clone)]
pub struct AvcConfiguration {
    pub profile: u8,
    pub level: u8,
    /// Size of the per-NAL length prefix in sample data, normally 4
    pub nal_length_size: usize,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

#[derive(Debug, Clone)]
pub(crate) enum SampleSizes {
    /// All samples share one size (`stsz.sample_size != 0`)
    Uniform { size: u32, count: u32 },
    PerSample(Vec<u32>),
}

/// One `trak` with its sample tables.
#[derive(Debug)]
pub struct Track {
    pub id: u32,
    /// Handler type from `hdlr` (`vide` for video)
    pub handler: FourCc,
    /// Media timescale (`mdhd`)
    pub timescale: u32,
    /// Media duration in timescale units (`mdhd`)
    pub duration: u64,
    /// Coded width from the sample entry
    pub width: u16,
    /// Coded height from the sample entry
    pub height: u16,
    /// Present when the sample description is an AVC entry
    pub avc: Option<AvcConfiguration>,
    pub(crate) time_to_sample: Vec<SttsEntry>,
    /// 1-based sync-sample numbers (`stss`); empty means every sample syncs
    pub(crate) sync_samples: Vec<u32>,
    pub(crate) sample_to_chunk: Vec<StscEntry>,
    pub(crate) sample_sizes: SampleSizes,
    /// Absolute file offsets of each chunk (`stco`)
    pub(crate) chunk_offsets: Vec<u32>,
}

impl Track {
    pub(crate) fn parse(trak: &BoxTree) -> Result<Self, ContainerError> {
        let id = parse_tkhd(trak.leaf(TKHD, "tkhd")?)?;
        let mdia = trak.container(MDIA, "mdia")?;
        let (timescale, duration) = parse_mdhd(mdia.leaf(MDHD, "mdhd")?)?;
        let handler = parse_hdlr(mdia.leaf(HDLR, "hdlr")?)?;
        let stbl = mdia.container(MINF, "minf")?.container(STBL, "stbl")?;

        let (width, height, avc) = parse_stsd(stbl.leaf(STSD, "stsd")?)?;
        let time_to_sample = parse_stts(stbl.leaf(STTS, "stts")?)?;
        let sync_samples = match stbl.first(STSS) {
            Some(BoxNode::Leaf(payload)) => parse_stss(payload.clone())?,
            _ => Vec::new(),
        };
        let sample_to_chunk = parse_stsc(stbl.leaf(STSC, "stsc")?)?;
        let sample_sizes = parse_stsz(stbl.leaf(STSZ, "stsz")?)?;
        let chunk_offsets = parse_stco(stbl.leaf(STCO, "stco")?)?;

        Ok(Self {
            id,
            handler,
            timescale,
            duration,
            width,
            height,
            avc,
            time_to_sample,
            sync_samples,
            sample_to_chunk,
            sample_sizes,
            chunk_offsets,
        })
    }

    /// Number of samples in the track.
    pub fn sample_count(&self) -> u32 {
        match &self.sample_sizes {
            SampleSizes::Uniform { count, .. } => *count,
            SampleSizes::PerSample(sizes) => sizes.len() as u32,
        }
    }

    /// Size in bytes of sample `sample` (zero-based).
    pub fn sample_size(&self, sample: u32) -> Result<u32, ContainerError> {
        let count = self.sample_count();
        if sample >= count {
            return Err(ContainerError::SampleOutOfRange { sample, count });
        }
        Ok(match &self.sample_sizes {
            SampleSizes::Uniform { size, .. } => *size,
            SampleSizes::PerSample(sizes) => sizes[sample as usize],
        })
    }

    /// Whether sample `sample` (zero-based) is a sync sample.
    pub fn is_sync_sample(&self, sample: u32) -> bool {
        self.sync_samples.is_empty() || self.sync_samples.contains(&(sample + 1))
    }

    /// Decode duration of sample `sample` (zero-based) in timescale units,
    /// from the run-length `stts` table.
    pub fn sample_delta(&self, sample: u32) -> Result<u32, ContainerError> {
        let count = self.sample_count();
        if sample >= count {
            return Err(ContainerError::SampleOutOfRange { sample, count });
        }
        let mut remaining = sample;
        for row in &self.time_to_sample {
            if remaining < row.sample_count {
                return Ok(row.sample_delta);
            }
            remaining -= row.sample_count;
        }
        Err(ContainerError::Malformed {
            box_type: STTS,
            reason: "table covers fewer samples than stsz",
        })
    }

    /// Map sample `sample` (zero-based) to its chunk via the run-length
    /// sample-to-chunk table.
    ///
    /// A single-row table is the common case for fragments and resolves in
    /// O(1); multi-row tables accumulate the prior rows' chunk and sample
    /// counts.
    pub fn sample_to_offset(&self, sample: u32) -> Result<ChunkPosition, ContainerError> {
        let count = self.sample_count();
        if sample >= count {
            return Err(ContainerError::SampleOutOfRange { sample, count });
        }
        let rows = &self.sample_to_chunk;
        let Some(first_row) = rows.first() else {
            return Err(ContainerError::Malformed {
                box_type: STSC,
                reason: "table is empty",
            });
        };

        if rows.len() == 1 {
            let per_chunk = first_row.samples_per_chunk;
            return Ok(ChunkPosition {
                index: sample / per_chunk,
                offset: sample % per_chunk,
            });
        }

        let mut samples_before = 0u64;
        for (i, row) in rows.iter().enumerate() {
            let per_chunk = row.samples_per_chunk as u64;
            let run_chunks = match rows.get(i + 1) {
                Some(next) => (next.first_chunk - row.first_chunk) as u64,
                // the last row runs to the end of the track
                None => u64::MAX,
            };
            let run_samples = run_chunks.saturating_mul(per_chunk);
            let rel = sample as u64 - samples_before;
            if rel < run_samples {
                return Ok(ChunkPosition {
                    index: row.first_chunk - 1 + (rel / per_chunk) as u32,
                    offset: (rel % per_chunk) as u32,
                });
            }
            samples_before += run_samples;
        }
        unreachable!("last stsc row is open-ended");
    }

    /// Absolute byte offset of sample `sample` in the file: its chunk's
    /// offset plus the sizes of the preceding samples in that chunk.
    pub fn sample_byte_offset(&self, sample: u32) -> Result<u64, ContainerError> {
        let position = self.sample_to_offset(sample)?;
        let chunk_offset = *self
            .chunk_offsets
            .get(position.index as usize)
            .ok_or(ContainerError::Malformed {
                box_type: STCO,
                reason: "fewer chunk offsets than stsc implies",
            })?;

        let first_sample_of_chunk = sample - position.offset;
        let mut offset = chunk_offset as u64;
        for prior in first_sample_of_chunk..sample {
            offset += self.sample_size(prior)? as u64;
        }
        Ok(offset)
    }
}

fn parse_tkhd(payload: Bytes) -> Result<u32, ContainerError> {
    let mut cursor = Cursor::new(payload);
    let version = cursor.read_full_box_header(TKHD, &[0, 1])?;
    if version == 1 {
        cursor.skip(16, "tkhd times")?;
    } else {
        cursor.skip(8, "tkhd times")?;
    }
    let id = cursor.read_u32("tkhd track id")?;
    cursor.expect_zeros(4, TKHD)?;
    Ok(id)
}

fn parse_mdhd(payload: Bytes) -> Result<(u32, u64), ContainerError> {
    let mut cursor = Cursor::new(payload);
    let version = cursor.read_full_box_header(MDHD, &[0, 1])?;
    let (timescale, duration) = if version == 1 {
        cursor.skip(16, "mdhd times")?;
        (
            cursor.read_u32("mdhd timescale")?,
            cursor.read_u64("mdhd duration")?,
        )
    } else {
        cursor.skip(8, "mdhd times")?;
        (
            cursor.read_u32("mdhd timescale")?,
            cursor.read_u32("mdhd duration")? as u64,
        )
    };
    if timescale == 0 {
        return Err(ContainerError::Malformed {
            box_type: MDHD,
            reason: "timescale is zero",
        });
    }
    Ok((timescale, duration))
}

fn parse_hdlr(payload: Bytes) -> Result<FourCc, ContainerError> {
    let mut cursor = Cursor::new(payload);
    cursor.read_full_box_header(HDLR, &[0])?;
    cursor.expect_zeros(4, HDLR)?; // pre_defined
    cursor.read_fourcc("hdlr handler type")
}

/// Parse `stsd`, descending into the first sample entry. Returns the coded
/// dimensions and, for an AVC entry, the decoder configuration.
fn parse_stsd(payload: Bytes) -> Result<(u16, u16, Option<AvcConfiguration>), ContainerError> {
    let mut cursor = Cursor::new(payload);
    cursor.read_full_box_header(STSD, &[0])?;
    let entry_count = cursor.read_u32("stsd entry count")?;
    if entry_count == 0 {
        return Err(ContainerError::Malformed {
            box_type: STSD,
            reason: "no sample entries",
        });
    }

    let entry_size = cursor.read_u32("sample entry size")? as usize;
    let entry_type = cursor.read_fourcc("sample entry type")?;
    let entry_len = entry_size.checked_sub(8).ok_or(ContainerError::Malformed {
        box_type: STSD,
        reason: "sample entry size smaller than its header",
    })?;
    let entry = cursor.read_bytes(entry_len, "sample entry payload")?;

    if entry_type != AVC1 {
        // non-AVC entry: dimensions unknown here, no codec configuration
        return Ok((0, 0, None));
    }
    parse_avc_sample_entry(entry).map(|(w, h, avc)| (w, h, Some(avc)))
}

fn parse_avc_sample_entry(payload: Bytes) -> Result<(u16, u16, AvcConfiguration), ContainerError> {
    let mut cursor = Cursor::new(payload);
    cursor.expect_zeros(6, AVC1)?; // SampleEntry reserved
    cursor.skip(2, "data reference index")?;
    cursor.expect_zeros(2, AVC1)?; // pre_defined
    cursor.expect_zeros(2, AVC1)?; // reserved
    cursor.expect_zeros(12, AVC1)?; // pre_defined[3]
    let width = cursor.read_u16("avc1 width")?;
    let height = cursor.read_u16("avc1 height")?;
    // horiz/vert resolution: fixed-point 72 dpi is the only defined value
    for _ in 0..2 {
        if cursor.read_u32("avc1 resolution")? != 0x0048_0000 {
            return Err(ContainerError::Malformed {
                box_type: AVC1,
                reason: "resolution is not 72 dpi",
            });
        }
    }
    cursor.expect_zeros(4, AVC1)?; // reserved
    if cursor.read_u16("avc1 frame count")? != 1 {
        return Err(ContainerError::Malformed {
            box_type: AVC1,
            reason: "frame_count is not 1",
        });
    }
    cursor.skip(32, "compressor name")?;
    if cursor.read_u16("avc1 depth")? != 0x0018 {
        return Err(ContainerError::Malformed {
            box_type: AVC1,
            reason: "depth is not 0x0018",
        });
    }
    if cursor.read_u16("avc1 pre_defined")? != 0xFFFF {
        return Err(ContainerError::Malformed {
            box_type: AVC1,
            reason: "trailing pre_defined is not -1",
        });
    }

    // remaining bytes are child boxes; avcC is required
    let children = super::parse_tree(cursor.read_bytes(cursor.remaining(), "avc1 children")?)?;
    let avc = parse_avcc(children.leaf(AVCC, "avcC")?)?;
    Ok((width, height, avc))
}

fn parse_avcc(payload: Bytes) -> Result<AvcConfiguration, ContainerError> {
    let mut cursor = Cursor::new(payload);
    if cursor.read_u8("avcC configuration version")? != 1 {
        return Err(ContainerError::Malformed {
            box_type: AVCC,
            reason: "configuration version is not 1",
        });
    }
    let profile = cursor.read_u8("avcC profile")?;
    cursor.skip(1, "avcC profile compatibility")?;
    let level = cursor.read_u8("avcC level")?;

    let length_byte = cursor.read_u8("avcC length size")?;
    if length_byte >> 2 != 0x3F {
        return Err(ContainerError::Malformed {
            box_type: AVCC,
            reason: "length-size reserved bits are not all ones",
        });
    }
    let nal_length_size = (length_byte & 0x03) as usize + 1;

    let sps_byte = cursor.read_u8("avcC SPS count")?;
    if sps_byte >> 5 != 0x07 {
        return Err(ContainerError::Malformed {
            box_type: AVCC,
            reason: "SPS-count reserved bits are not all ones",
        });
    }
    let mut sps = Vec::new();
    for _ in 0..(sps_byte & 0x1F) {
        let len = cursor.read_u16("SPS length")? as usize;
        sps.push(cursor.read_bytes(len, "SPS data")?);
    }

    let pps_count = cursor.read_u8("avcC PPS count")?;
    let mut pps = Vec::new();
    for _ in 0..pps_count {
        let len = cursor.read_u16("PPS length")? as usize;
        pps.push(cursor.read_bytes(len, "PPS data")?);
    }

    if sps.is_empty() || pps.is_empty() {
        return Err(ContainerError::Malformed {
            box_type: AVCC,
            reason: "missing SPS or PPS",
        });
    }

    Ok(AvcConfiguration {
        profile,
        level,
        nal_length_size,
        sps,
        pps,
    })
}

fn parse_stts(payload: Bytes) -> Result<Vec<SttsEntry>, ContainerError> {
    let mut cursor = Cursor::new(payload);
    cursor.read_full_box_header(STTS, &[0])?;
    let entry_count = cursor.read_u32("stts entry count")?;
    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        entries.push(SttsEntry {
            sample_count: cursor.read_u32("stts sample count")?,
            sample_delta: cursor.read_u32("stts sample delta")?,
        });
    }
    Ok(entries)
}

fn parse_stss(payload: Bytes) -> Result<Vec<u32>, ContainerError> {
    let mut cursor = Cursor::new(payload);
    cursor.read_full_box_header(STSS, &[0])?;
    let entry_count = cursor.read_u32("stss entry count")?;
    let mut samples = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        samples.push(cursor.read_u32("stss sample number")?);
    }
    Ok(samples)
}

fn parse_stsc(payload: Bytes) -> Result<Vec<StscEntry>, ContainerError> {
    let mut cursor = Cursor::new(payload);
    cursor.read_full_box_header(STSC, &[0])?;
    let entry_count = cursor.read_u32("stsc entry count")?;
    let mut entries: Vec<StscEntry> = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let entry = StscEntry {
            first_chunk: cursor.read_u32("stsc first chunk")?,
            samples_per_chunk: cursor.read_u32("stsc samples per chunk")?,
            sample_description_index: cursor.read_u32("stsc description index")?,
        };
        if entry.samples_per_chunk == 0 {
            return Err(ContainerError::Malformed {
                box_type: STSC,
                reason: "samples_per_chunk is zero",
            });
        }
        if let Some(prev) = entries.last() {
            if entry.first_chunk <= prev.first_chunk {
                return Err(ContainerError::Malformed {
                    box_type: STSC,
                    reason: "first_chunk values are not ascending",
                });
            }
        } else if entry.first_chunk != 1 {
            return Err(ContainerError::Malformed {
                box_type: STSC,
                reason: "first row does not start at chunk 1",
            });
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn parse_stsz(payload: Bytes) -> Result<SampleSizes, ContainerError> {
    let mut cursor = Cursor::new(payload);
    cursor.read_full_box_header(STSZ, &[0])?;
    let sample_size = cursor.read_u32("stsz sample size")?;
    let sample_count = cursor.read_u32("stsz sample count")?;
    if sample_size != 0 {
        return Ok(SampleSizes::Uniform {
            size: sample_size,
            count: sample_count,
        });
    }
    let mut sizes = Vec::with_capacity(sample_count as usize);
    for _ in 0..sample_count {
        sizes.push(cursor.read_u32("stsz entry")?);
    }
    Ok(SampleSizes::PerSample(sizes))
}

fn parse_stco(payload: Bytes) -> Result<Vec<u32>, ContainerError> {
    let mut cursor = Cursor::new(payload);
    cursor.read_full_box_header(STCO, &[0])?;
    let entry_count = cursor.read_u32("stco entry count")?;
    let mut offsets = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        offsets.push(cursor.read_u32("stco chunk offset")?);
    }
    Ok(offsets)
}
