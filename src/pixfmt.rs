//! Pixel Format Registry
//!
//! Maps DRM FourCC codes onto the RFB pixel-format records the wire
//! protocol negotiates, and converts rows of 32-bit pixels into the
//! "compact pixel" form the Tight encoder transmits.

/// Build a FourCC code from its four characters.
pub const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | (b as u32) << 8 | (c as u32) << 16 | (d as u32) << 24
}

/// Pixel formats understood by the pipeline, identified by DRM FourCC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum PixelFormat {
    Argb8888,
    Xrgb8888,
    Abgr8888,
    Xbgr8888,
    Rgba8888,
    Rgbx8888,
    Bgra8888,
    Bgrx8888,
    Argb4444,
    Xrgb4444,
    Abgr4444,
    Xbgr4444,
    Rgba4444,
    Rgbx4444,
    Bgra4444,
    Bgrx4444,
}

impl PixelFormat {
    /// Look a format up by its FourCC code.
    pub fn from_fourcc(code: u32) -> Option<Self> {
        let format = match code {
            c if c == fourcc(b'A', b'R', b'2', b'4') => Self::Argb8888,
            c if c == fourcc(b'X', b'R', b'2', b'4') => Self::Xrgb8888,
            c if c == fourcc(b'A', b'B', b'2', b'4') => Self::Abgr8888,
            c if c == fourcc(b'X', b'B', b'2', b'4') => Self::Xbgr8888,
            c if c == fourcc(b'R', b'A', b'2', b'4') => Self::Rgba8888,
            c if c == fourcc(b'R', b'X', b'2', b'4') => Self::Rgbx8888,
            c if c == fourcc(b'B', b'A', b'2', b'4') => Self::Bgra8888,
            c if c == fourcc(b'B', b'X', b'2', b'4') => Self::Bgrx8888,
            c if c == fourcc(b'A', b'R', b'1', b'2') => Self::Argb4444,
            c if c == fourcc(b'X', b'R', b'1', b'2') => Self::Xrgb4444,
            c if c == fourcc(b'A', b'B', b'1', b'2') => Self::Abgr4444,
            c if c == fourcc(b'X', b'B', b'1', b'2') => Self::Xbgr4444,
            c if c == fourcc(b'R', b'A', b'1', b'2') => Self::Rgba4444,
            c if c == fourcc(b'R', b'X', b'1', b'2') => Self::Rgbx4444,
            c if c == fourcc(b'B', b'A', b'1', b'2') => Self::Bgra4444,
            c if c == fourcc(b'B', b'X', b'1', b'2') => Self::Bgrx4444,
            _ => return None,
        };
        Some(format)
    }

    /// The FourCC code of this format.
    pub fn fourcc(self) -> u32 {
        match self {
            Self::Argb8888 => fourcc(b'A', b'R', b'2', b'4'),
            Self::Xrgb8888 => fourcc(b'X', b'R', b'2', b'4'),
            Self::Abgr8888 => fourcc(b'A', b'B', b'2', b'4'),
            Self::Xbgr8888 => fourcc(b'X', b'B', b'2', b'4'),
            Self::Rgba8888 => fourcc(b'R', b'A', b'2', b'4'),
            Self::Rgbx8888 => fourcc(b'R', b'X', b'2', b'4'),
            Self::Bgra8888 => fourcc(b'B', b'A', b'2', b'4'),
            Self::Bgrx8888 => fourcc(b'B', b'X', b'2', b'4'),
            Self::Argb4444 => fourcc(b'A', b'R', b'1', b'2'),
            Self::Xrgb4444 => fourcc(b'X', b'R', b'1', b'2'),
            Self::Abgr4444 => fourcc(b'A', b'B', b'1', b'2'),
            Self::Xbgr4444 => fourcc(b'X', b'B', b'1', b'2'),
            Self::Rgba4444 => fourcc(b'R', b'A', b'1', b'2'),
            Self::Rgbx4444 => fourcc(b'R', b'X', b'1', b'2'),
            Self::Bgra4444 => fourcc(b'B', b'A', b'1', b'2'),
            Self::Bgrx4444 => fourcc(b'B', b'X', b'1', b'2'),
        }
    }

    /// Bytes per pixel in memory.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Argb8888
            | Self::Xrgb8888
            | Self::Abgr8888
            | Self::Xbgr8888
            | Self::Rgba8888
            | Self::Rgbx8888
            | Self::Bgra8888
            | Self::Bgrx8888 => 4,
            Self::Argb4444
            | Self::Xrgb4444
            | Self::Abgr4444
            | Self::Xbgr4444
            | Self::Rgba4444
            | Self::Rgbx4444
            | Self::Bgra4444
            | Self::Bgrx4444 => 2,
        }
    }

    /// The RFB pixel-format record describing this format on the wire.
    pub fn rfb_format(self) -> RfbPixelFormat {
        let (red_shift, green_shift, blue_shift) = match self {
            Self::Rgba8888 | Self::Rgbx8888 => (24, 16, 8),
            Self::Bgra8888 | Self::Bgrx8888 => (8, 16, 24),
            Self::Argb8888 | Self::Xrgb8888 => (16, 8, 0),
            Self::Abgr8888 | Self::Xbgr8888 => (0, 8, 16),
            Self::Rgba4444 | Self::Rgbx4444 => (12, 8, 4),
            Self::Bgra4444 | Self::Bgrx4444 => (4, 8, 12),
            Self::Argb4444 | Self::Xrgb4444 => (8, 4, 0),
            Self::Abgr4444 | Self::Xbgr4444 => (0, 4, 8),
        };
        let (bits_per_pixel, depth, max) = match self.bytes_per_pixel() {
            4 => (32, 24, 0xff),
            _ => (16, 12, 0x7f),
        };
        RfbPixelFormat {
            bits_per_pixel,
            depth,
            big_endian: false,
            true_colour: true,
            red_max: max,
            green_max: max,
            blue_max: max,
            red_shift,
            green_shift,
            blue_shift,
        }
    }
}

/// An RFB pixel-format record as negotiated on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfbPixelFormat {
    /// Bits per pixel on the wire (8, 16 or 32).
    pub bits_per_pixel: u8,
    /// Colour depth in significant bits.
    pub depth: u8,
    /// Multi-byte pixels are big-endian.
    pub big_endian: bool,
    /// True-colour flag; palettes are not supported.
    pub true_colour: bool,
    /// Maximum red value.
    pub red_max: u16,
    /// Maximum green value.
    pub green_max: u16,
    /// Maximum blue value.
    pub blue_max: u16,
    /// Red shift within a pixel.
    pub red_shift: u8,
    /// Green shift within a pixel.
    pub green_shift: u8,
    /// Blue shift within a pixel.
    pub blue_shift: u8,
}

impl RfbPixelFormat {
    /// Bytes per "compact pixel": Tight transmits 24 significant bits of
    /// a 32-bit format as three bytes.
    pub fn bytes_per_cpixel(&self) -> usize {
        if self.bits_per_pixel == 32 && self.depth <= 24 {
            3
        } else {
            self.bits_per_pixel as usize / 8
        }
    }
}

/// Convert a row of 32-bit pixels into compact destination pixels.
///
/// Reads `len` native-endian 32-bit pixels from `src` and writes
/// `len * bytes_per_cpixel` bytes to `dst`. For three-byte destinations
/// the channel shifts are normalised down so the significant 24 bits land
/// in the low bytes, with the byte order corrected for big-endian
/// destinations.
pub fn pixel32_to_cpixel(
    dst: &mut [u8],
    dst_fmt: &RfbPixelFormat,
    src: &[u8],
    src_fmt: &RfbPixelFormat,
    bytes_per_cpixel: usize,
    len: usize,
) {
    debug_assert!(src_fmt.true_colour && src_fmt.bits_per_pixel == 32);
    debug_assert!(dst_fmt.true_colour && dst_fmt.bits_per_pixel <= 32);
    debug_assert!((1..=4).contains(&bytes_per_cpixel));
    debug_assert!(src.len() >= len * 4);
    debug_assert!(dst.len() >= len * bytes_per_cpixel);

    let src_red_shift = src_fmt.red_shift as u32;
    let src_green_shift = src_fmt.green_shift as u32;
    let src_blue_shift = src_fmt.blue_shift as u32;

    let mut dst_red_shift = dst_fmt.red_shift as u32;
    let mut dst_green_shift = dst_fmt.green_shift as u32;
    let mut dst_blue_shift = dst_fmt.blue_shift as u32;

    let src_red_max = src_fmt.red_max as u32;
    let src_green_max = src_fmt.green_max as u32;
    let src_blue_max = src_fmt.blue_max as u32;

    let src_red_bits = src_red_max.count_ones();
    let src_green_bits = src_green_max.count_ones();
    let src_blue_bits = src_blue_max.count_ones();

    let dst_red_bits = (dst_fmt.red_max as u32).count_ones();
    let dst_green_bits = (dst_fmt.green_max as u32).count_ones();
    let dst_blue_bits = (dst_fmt.blue_max as u32).count_ones();

    if bytes_per_cpixel == 3 && dst_fmt.bits_per_pixel == 32 && dst_fmt.depth <= 24 {
        let min_shift = dst_red_shift.min(dst_green_shift).min(dst_blue_shift);
        dst_red_shift -= min_shift;
        dst_green_shift -= min_shift;
        dst_blue_shift -= min_shift;
    }

    let convert = |px: u32| -> u32 {
        let r = (((px >> src_red_shift) & src_red_max) << dst_red_bits >> src_red_bits)
            << dst_red_shift;
        let g = (((px >> src_green_shift) & src_green_max) << dst_green_bits >> src_green_bits)
            << dst_green_shift;
        let b = (((px >> src_blue_shift) & src_blue_max) << dst_blue_bits >> src_blue_bits)
            << dst_blue_shift;
        r | g | b
    };

    let pixels = src
        .chunks_exact(4)
        .take(len)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]));

    match bytes_per_cpixel {
        4 => {
            for (px, out) in pixels.zip(dst.chunks_exact_mut(4)) {
                let cpx = convert(px);
                out.copy_from_slice(&if dst_fmt.big_endian {
                    cpx.to_be_bytes()
                } else {
                    cpx.to_le_bytes()
                });
            }
        }
        3 => {
            let corr = if dst_fmt.big_endian { 16 } else { 0 };
            for (px, out) in pixels.zip(dst.chunks_exact_mut(3)) {
                let cpx = convert(px);
                out[0] = (cpx >> corr) as u8;
                out[1] = (cpx >> 8) as u8;
                out[2] = (cpx >> (16 ^ corr)) as u8;
            }
        }
        2 => {
            let corr = if dst_fmt.big_endian { 8 } else { 0 };
            for (px, out) in pixels.zip(dst.chunks_exact_mut(2)) {
                let cpx = convert(px);
                out[0] = (cpx >> corr) as u8;
                out[1] = (cpx >> (8 ^ corr)) as u8;
            }
        }
        1 => {
            for (px, out) in pixels.zip(dst.chunks_exact_mut(1)) {
                out[0] = convert(px) as u8;
            }
        }
        _ => unreachable!("bytes_per_cpixel out of range"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_round_trip() {
        for format in [
            PixelFormat::Argb8888,
            PixelFormat::Xrgb8888,
            PixelFormat::Rgba8888,
            PixelFormat::Bgrx8888,
            PixelFormat::Xbgr4444,
        ] {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(0), None);
    }

    #[test]
    fn test_xrgb8888_rfb_record() {
        let fmt = PixelFormat::Xrgb8888.rfb_format();
        assert_eq!(fmt.bits_per_pixel, 32);
        assert_eq!(fmt.depth, 24);
        assert_eq!(fmt.red_shift, 16);
        assert_eq!(fmt.green_shift, 8);
        assert_eq!(fmt.blue_shift, 0);
        assert_eq!(fmt.red_max, 0xff);
        assert_eq!(fmt.bytes_per_cpixel(), 3);
    }

    #[test]
    fn test_cpixel_identity_4_bytes() {
        let src_fmt = PixelFormat::Xrgb8888.rfb_format();
        let mut dst_fmt = src_fmt;
        dst_fmt.depth = 32; // keep four wire bytes
        let src = 0x0011_2233u32.to_ne_bytes();
        let mut dst = [0u8; 4];
        pixel32_to_cpixel(&mut dst, &dst_fmt, &src, &src_fmt, 4, 1);
        assert_eq!(u32::from_le_bytes(dst), 0x0011_2233);
    }

    #[test]
    fn test_cpixel_3_bytes_rgb_order() {
        // XRGB source recoded through the XBGR-derived compact form
        // yields R, G, B byte order.
        let src_fmt = PixelFormat::Xrgb8888.rfb_format();
        let dst_fmt = PixelFormat::Xbgr8888.rfb_format();
        let src = 0x0011_2233u32.to_ne_bytes(); // R=0x11 G=0x22 B=0x33
        let mut dst = [0u8; 3];
        pixel32_to_cpixel(&mut dst, &dst_fmt, &src, &src_fmt, 3, 1);
        assert_eq!(dst, [0x11, 0x22, 0x33]);
    }

    #[test]
    fn test_cpixel_row_conversion() {
        let src_fmt = PixelFormat::Xrgb8888.rfb_format();
        let dst_fmt = PixelFormat::Xbgr8888.rfb_format();
        let mut src = Vec::new();
        for px in [0x00ff0000u32, 0x0000ff00, 0x000000ff] {
            src.extend_from_slice(&px.to_ne_bytes());
        }
        let mut dst = [0u8; 9];
        pixel32_to_cpixel(&mut dst, &dst_fmt, &src, &src_fmt, 3, 3);
        assert_eq!(
            dst,
            [0xff, 0x00, 0x00, 0x00, 0xff, 0x00, 0x00, 0x00, 0xff]
        );
    }

    #[test]
    fn test_cpixel_16_bit_destination() {
        let src_fmt = PixelFormat::Xrgb8888.rfb_format();
        // RGB565 destination as a client might request it.
        let dst_fmt = RfbPixelFormat {
            bits_per_pixel: 16,
            depth: 16,
            big_endian: false,
            true_colour: true,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        };
        let src = 0x00ff_ffffu32.to_ne_bytes(); // white
        let mut dst = [0u8; 2];
        pixel32_to_cpixel(&mut dst, &dst_fmt, &src, &src_fmt, 2, 1);
        assert_eq!(u16::from_le_bytes(dst), 0xffff);
    }
}
