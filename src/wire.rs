//! RFB Wire Helpers
//!
//! Append helpers for the pieces of the RFB update wire format the
//! encoders emit: rectangle counts, rectangle heads and the Tight
//! compact length field. All multi-byte fields are big-endian.

use bytes::{BufMut, BytesMut};

/// RFB encoding number for Tight.
pub const ENCODING_TIGHT: i32 = 7;

/// RFB encoding number for Open H.264.
pub const ENCODING_OPEN_H264: i32 = 50;

/// Append the rectangle count of a framebuffer update.
pub fn encode_rect_count(dst: &mut BytesMut, count: u16) {
    dst.put_u16(count);
}

/// Append a rectangle head: position, size and encoding number.
pub fn encode_rect_head(dst: &mut BytesMut, encoding: i32, x: u16, y: u16, width: u16, height: u16) {
    dst.put_u16(x);
    dst.put_u16(y);
    dst.put_u16(width);
    dst.put_u16(height);
    dst.put_i32(encoding);
}

/// Append a Tight compact length: one to three bytes of seven value bits
/// each, least significant group first, continuation flag in the top bit.
pub fn encode_compact_size(dst: &mut BytesMut, size: usize) {
    debug_assert!(size < 1 << 22, "compact size field overflow");
    dst.put_u8((size & 0x7f) as u8 | (((size >= 128) as u8) << 7));
    if size >= 128 {
        dst.put_u8(((size >> 7) & 0x7f) as u8 | (((size >= 16384) as u8) << 7));
    }
    if size >= 16384 {
        dst.put_u8(((size >> 14) & 0xff) as u8);
    }
}
