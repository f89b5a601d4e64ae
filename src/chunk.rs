//! Compressed frame chunks
//!
//! A chunk is a server-delivered block of encoded frames: either an MP4
//! fragment or an archive of per-frame images. The engine consumes the byte
//! payload once during a decode pass and does not retain it afterwards.

use bytes::Bytes;

use crate::error::ValidationError;

/// Quality variant requested from the archive worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum ImageQuality {
    /// Server-side recompressed images
    #[default]
    Compressed,
    /// Original uploaded images
    Original,
}

/// How the chunk payload is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BlockType {
    /// ISO base-media fragment with an AVC video track
    Mp4Video,
    /// Archive with one image entry per frame
    ImageArchive { quality: ImageQuality },
}

/// A compressed block of frames awaiting decode.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Raw chunk bytes as delivered by the network layer
    pub data: Bytes,
    /// Payload encoding
    pub block_type: BlockType,
}

impl Chunk {
    pub fn new(data: Bytes, block_type: BlockType) -> Self {
        Self { data, block_type }
    }
}

/// Check the submit precondition: non-empty, strictly ascending.
///
/// A violation is a caller bug, not a recoverable condition, so it fails
/// before any request slot is touched.
pub(crate) fn validate_frame_numbers(frame_numbers: &[u32]) -> Result<(), ValidationError> {
    if frame_numbers.is_empty() {
        return Err(ValidationError::EmptyFrameNumbers);
    }
    for pair in frame_numbers.windows(2) {
        if pair[1] <= pair[0] {
            return Err(ValidationError::NonAscendingFrameNumbers {
                prev: pair[0],
                next: pair[1],
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascending_frame_numbers_accepted() {
        assert!(validate_frame_numbers(&[5, 7, 9]).is_ok());
        assert!(validate_frame_numbers(&[0]).is_ok());
    }

    #[test]
    fn test_empty_frame_numbers_rejected() {
        assert_eq!(
            validate_frame_numbers(&[]),
            Err(ValidationError::EmptyFrameNumbers)
        );
    }

    #[test]
    fn test_non_ascending_frame_numbers_rejected() {
        assert_eq!(
            validate_frame_numbers(&[10, 8]),
            Err(ValidationError::NonAscendingFrameNumbers { prev: 10, next: 8 })
        );
        // equal neighbours are not strictly ascending either
        assert!(validate_frame_numbers(&[3, 3]).is_err());
    }
}
