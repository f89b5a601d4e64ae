//! Decoded frame representation and padding crop
//!
//! Frames are tightly packed RGBA buffers. `crop_image` normalizes a decoder
//! output buffer to a target size: video decoders commonly report a height
//! padded to a macroblock multiple, and some report a row stride wider than
//! the visible width.

use bytes::{Bytes, BytesMut};

/// Bytes per RGBA pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// A single decoded, ready-to-render image.
///
/// The cache keeps one handle per decoded frame; consumers receive clones of
/// the surrounding `Arc`. Dropping the last handle releases the pixel data.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Packed RGBA pixel data, `width * height * 4` bytes
    pub data: Bytes,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

impl Frame {
    pub fn new(data: Bytes, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }

    /// Expected packed buffer size for the given dimensions.
    pub fn expected_size(width: u32, height: u32) -> usize {
        width as usize * height as usize * BYTES_PER_PIXEL
    }

    /// Whether the buffer length matches the dimensions.
    pub fn is_valid(&self) -> bool {
        self.data.len() == Self::expected_size(self.width, self.height)
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }
}

/// Crop a packed RGBA buffer from `(src_width, src_height)` down to
/// `(dst_width, dst_height)`.
///
/// Three cases, cheapest first:
/// - identical dimensions: the buffer is reused as-is (zero copy);
/// - equal width, smaller height: a contiguous prefix slice (zero copy);
/// - otherwise: row-by-row copy from the strided source into a packed
///   destination.
///
/// The destination must not exceed the source in either dimension.
pub fn crop_image(
    buffer: &Bytes,
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
) -> Bytes {
    debug_assert!(dst_width <= src_width && dst_height <= src_height);
    debug_assert!(buffer.len() >= Frame::expected_size(src_width, src_height));

    if src_width == dst_width && src_height == dst_height {
        return buffer.clone();
    }

    if src_width == dst_width {
        return buffer.slice(0..Frame::expected_size(dst_width, dst_height));
    }

    let src_stride = src_width as usize * BYTES_PER_PIXEL;
    let dst_stride = dst_width as usize * BYTES_PER_PIXEL;
    let mut packed = BytesMut::with_capacity(dst_stride * dst_height as usize);
    for y in 0..dst_height as usize {
        let row_start = y * src_stride;
        packed.extend_from_slice(&buffer[row_start..row_start + dst_stride]);
    }
    packed.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Bytes {
        let mut data = Vec::with_capacity(Frame::expected_size(width, height));
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, 0, 255]);
            }
        }
        Bytes::from(data)
    }

    #[test]
    fn test_crop_same_dimensions_is_zero_copy() {
        let src = gradient(4, 4);
        let out = crop_image(&src, 4, 4, 4, 4);
        assert_eq!(out, src);
    }

    #[test]
    fn test_crop_height_only_slices_prefix() {
        let src = gradient(4, 6);
        let out = crop_image(&src, 4, 6, 4, 4);
        assert_eq!(out.len(), Frame::expected_size(4, 4));
        assert_eq!(&out[..], &src[..Frame::expected_size(4, 4)]);
    }

    #[test]
    fn test_crop_strided_copy() {
        let src = gradient(6, 4);
        let out = crop_image(&src, 6, 4, 4, 3);
        assert_eq!(out.len(), Frame::expected_size(4, 3));
        // pixel (x=2, y=2) keeps its channel values
        let idx = (2 * 4 + 2) * BYTES_PER_PIXEL;
        assert_eq!(&out[idx..idx + 4], &[2, 2, 0, 255]);
    }

    #[test]
    fn test_frame_validity() {
        let frame = Frame::new(gradient(4, 4), 4, 4);
        assert!(frame.is_valid());
        assert_eq!(frame.stride(), 16);
    }
}
