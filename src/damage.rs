//! Damage Refinery
//!
//! Capture sources over-report damage: a compositor redraw of a whole
//! output usually changes only a fraction of its pixels. The refinery
//! keeps a content hash per 32x32 tile of the previous frame and shrinks
//! a caller-supplied damage hint to the tiles whose pixels actually
//! changed, so the encoders and the network only see real updates.
//!
//! Only tiles intersecting the hint are hashed; everything else keeps its
//! stored hash, so the refined result never grows beyond the hint.

use tracing::debug;

use crate::fb::FrameBuffer;
use crate::region::{Rect, Region};

/// Side length of a refinery tile in pixels.
pub const TILE_SIZE: u32 = 32;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over one tile's rows. Deterministic and stable across the
/// process lifetime, which is all the refinery needs.
fn hash_tile(
    data: &[u8],
    stride_bytes: usize,
    bytes_per_pixel: usize,
    rect: Rect,
) -> u64 {
    let mut hash = FNV_OFFSET;
    let row_bytes = rect.width as usize * bytes_per_pixel;
    for y in rect.y..rect.bottom() {
        let start = y as usize * stride_bytes + rect.x as usize * bytes_per_pixel;
        for &byte in &data[start..start + row_bytes] {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

/// Per-display damage refinement state.
///
/// The hash grid is sized lazily from the frames that arrive; a dimension
/// change resets it, making every tile of the next frame count as
/// changed.
#[derive(Debug, Default)]
pub struct DamageRefinery {
    width: u32,
    height: u32,
    hashes: Vec<u64>,
}

impl DamageRefinery {
    /// Create an empty refinery; the grid is allocated on first resize.
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the hash grid for the given frame dimensions.
    ///
    /// A no-op when the dimensions are unchanged; otherwise the stored
    /// hashes are discarded.
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.width == width && self.height == height {
            return;
        }
        debug!(width, height, "resizing damage refinery grid");
        self.width = width;
        self.height = height;
        let tiles = (width.div_ceil(TILE_SIZE) * height.div_ceil(TILE_SIZE)) as usize;
        self.hashes.clear();
        self.hashes.resize(tiles, 0);
    }

    /// Refine a damage hint against the previous frame.
    ///
    /// Hashes every tile that intersects `hint` over `fb`'s current
    /// pixels and returns the union of the tiles whose hash changed
    /// since the last refinement. Tiles outside the hint are untouched.
    /// The framebuffer must be mapped.
    pub fn refine(&mut self, hint: &Region, fb: &FrameBuffer) -> Region {
        debug_assert_eq!(
            (self.width, self.height),
            (fb.width(), fb.height()),
            "refinery not sized for this framebuffer"
        );

        let mut refined = Region::new();
        if hint.is_empty() {
            return refined;
        }

        let data = fb.data();
        let stride_bytes = fb.stride_bytes();
        let bytes_per_pixel = fb.format().bytes_per_pixel();
        let grid_width = self.width.div_ceil(TILE_SIZE);
        let grid_height = self.height.div_ceil(TILE_SIZE);

        for ty in 0..grid_height {
            for tx in 0..grid_width {
                let x = tx * TILE_SIZE;
                let y = ty * TILE_SIZE;
                // Partial tiles at the right/bottom edges hash their
                // actual pixels only.
                let tile = Rect::new(
                    x,
                    y,
                    TILE_SIZE.min(self.width - x),
                    TILE_SIZE.min(self.height - y),
                );
                if !hint.intersects_rect(&tile) {
                    continue;
                }

                let hash = hash_tile(data, stride_bytes, bytes_per_pixel, tile);
                let slot = (ty * grid_width + tx) as usize;
                if self.hashes[slot] != hash {
                    self.hashes[slot] = hash;
                    refined.add_rect(tile);
                }
            }
        }

        refined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixfmt::PixelFormat;

    fn solid_fb(width: u32, height: u32, value: u8) -> FrameBuffer {
        FrameBuffer::from_buffer(
            vec![value; (width * height * 4) as usize],
            width,
            height,
            PixelFormat::Xrgb8888,
            width,
        )
    }

    fn full(width: u32, height: u32) -> Region {
        Region::from_rect(Rect::full_frame(width, height))
    }

    #[test]
    fn test_first_refinement_reports_everything() {
        let mut refinery = DamageRefinery::new();
        refinery.resize(64, 64);
        let fb = solid_fb(64, 64, 0x40);
        let refined = refinery.refine(&full(64, 64), &fb);
        assert_eq!(refined.bounding_rect(), Some(Rect::full_frame(64, 64)));
    }

    #[test]
    fn test_identical_frame_refines_to_empty() {
        let mut refinery = DamageRefinery::new();
        refinery.resize(64, 64);
        let fb = solid_fb(64, 64, 0x40);
        let _ = refinery.refine(&full(64, 64), &fb);
        let second = refinery.refine(&full(64, 64), &fb);
        assert!(second.is_empty());
    }

    #[test]
    fn test_changed_pixel_damages_its_tile() {
        let mut refinery = DamageRefinery::new();
        refinery.resize(96, 96);
        let mut fb = solid_fb(96, 96, 0x40);
        let _ = refinery.refine(&full(96, 96), &fb);

        // Flip one pixel at (40, 70): tile (1, 2).
        let offset = (70 * 96 + 40) * 4;
        fb.data_mut()[offset] ^= 0xff;

        let refined = refinery.refine(&full(96, 96), &fb);
        assert_eq!(refined.len(), 1);
        assert_eq!(refined.rects()[0], Rect::new(32, 64, 32, 32));
    }

    #[test]
    fn test_refinement_never_exceeds_hint() {
        let mut refinery = DamageRefinery::new();
        refinery.resize(96, 96);
        let mut fb = solid_fb(96, 96, 0x40);
        let _ = refinery.refine(&full(96, 96), &fb);

        // Change a pixel outside the hint; the hint's tiles are clean.
        let offset = (70 * 96 + 40) * 4;
        fb.data_mut()[offset] ^= 0xff;
        let hint = Region::from_rect(Rect::new(0, 0, 32, 32));
        assert!(refinery.refine(&hint, &fb).is_empty());

        // The changed tile's stored hash was untouched, so widening the
        // hint still finds it.
        let refined = refinery.refine(&full(96, 96), &fb);
        assert_eq!(refined.rects(), [Rect::new(32, 64, 32, 32)]);
    }

    #[test]
    fn test_partial_edge_tiles_hash_actual_pixels() {
        let mut refinery = DamageRefinery::new();
        refinery.resize(40, 40); // 2x2 grid with 8-pixel edge tiles
        let mut fb = solid_fb(40, 40, 0x40);
        let _ = refinery.refine(&full(40, 40), &fb);

        // Change the bottom-right corner pixel.
        let offset = (39 * 40 + 39) * 4;
        fb.data_mut()[offset] ^= 0xff;
        let refined = refinery.refine(&full(40, 40), &fb);
        assert_eq!(refined.rects(), [Rect::new(32, 32, 8, 8)]);
    }

    #[test]
    fn test_resize_resets_the_grid() {
        let mut refinery = DamageRefinery::new();
        refinery.resize(64, 64);
        let fb = solid_fb(64, 64, 0x40);
        let _ = refinery.refine(&full(64, 64), &fb);

        refinery.resize(64, 64); // unchanged: state kept
        assert!(refinery.refine(&full(64, 64), &fb).is_empty());

        refinery.resize(32, 32); // changed: state reset
        refinery.resize(64, 64);
        let refined = refinery.refine(&full(64, 64), &fb);
        assert!(!refined.is_empty());
    }

    #[test]
    fn test_empty_hint_refines_to_empty() {
        let mut refinery = DamageRefinery::new();
        refinery.resize(64, 64);
        let fb = solid_fb(64, 64, 0x40);
        assert!(refinery.refine(&Region::new(), &fb).is_empty());
    }
}
