//! Tight Encoder
//!
//! Produces the RFB "Tight" wire representation of a damaged frame. The
//! frame is cut into 64x64 tiles and the damaged ones are encoded by four
//! worker shards in parallel, one shard per persistent deflate stream.
//! Shard `i` owns exactly the tiles of grid columns `x mod 4 == i`, so
//! the same stream sees the same succession of tiles frame after frame
//! and its dictionary keeps paying off across frames.
//!
//! Basic mode converts each pixel row to the client's compact pixel form
//! and deflates it on the tile's shard stream, sync-flushing the last row
//! so the tile is self-contained while the stream state carries over.
//! With the `jpeg` feature, the high/low quality levels encode tiles as
//! self-contained 4:2:2 JPEG instead.
//!
//! A frame is encoded asynchronously: `encode_frame` schedules the
//! shards and returns; once all four complete, a finish job on the main
//! context serialises the tiles in row-major order and hands the bytes to
//! the completion callback. Frames never overlap: starting a frame while
//! the previous one is in flight is a caller bug.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use flate2::{Compress, Compression, FlushCompress};
use parking_lot::Mutex;
use tracing::{error, trace};
#[cfg(feature = "jpeg")]
use tracing::warn;

use crate::fb::{FbError, FrameBuffer};
use crate::pixfmt::{pixel32_to_cpixel, PixelFormat, RfbPixelFormat};
use crate::region::{Rect, Region};
use crate::sched::Scheduler;
use crate::wire::{self, ENCODING_TIGHT};

/// Side length of a Tight tile in pixels.
pub const TILE_SIDE: u32 = 64;

/// Fixed capacity of one tile's output buffer.
const MAX_TILE_SIZE: usize = 2 * (TILE_SIDE as usize) * (TILE_SIDE as usize) * 4;

/// Number of deflate streams and worker shards.
const STREAM_COUNT: usize = 4;

const TIGHT_BASIC: u8 = 0x00;
#[cfg(feature = "jpeg")]
const TIGHT_JPEG: u8 = 0x90;

#[cfg(feature = "jpeg")]
const JPEG_QUALITY_HIGH: i32 = 66;
#[cfg(feature = "jpeg")]
const JPEG_QUALITY_LOW: i32 = 33;

/// Requested encoding quality.
///
/// Without the `jpeg` feature every level encodes losslessly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TightQuality {
    /// Deflate-compressed true-colour tiles.
    Lossless,
    /// JPEG tiles at high quality.
    High,
    /// JPEG tiles at low quality.
    Low,
}

/// Tight encoder errors reported before any work is scheduled.
#[derive(Debug, thiserror::Error)]
pub enum TightError {
    /// The frame does not match the encoder's configured size.
    #[error("encoder sized {encoder_width}x{encoder_height} but frame is {fb_width}x{fb_height}")]
    DimensionMismatch {
        /// Configured encoder width.
        encoder_width: u32,
        /// Configured encoder height.
        encoder_height: u32,
        /// Frame width.
        fb_width: u32,
        /// Frame height.
        fb_height: u32,
    },

    /// Mapping the source framebuffer failed.
    #[error(transparent)]
    Fb(#[from] FbError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TileState {
    Ready,
    Damaged,
    Encoded,
}

struct Tile {
    state: TileState,
    ty: u8,
    size: usize,
    buf: Box<[u8]>,
}

impl Tile {
    fn new() -> Self {
        Self {
            state: TileState::Ready,
            ty: 0,
            size: 0,
            buf: vec![0u8; MAX_TILE_SIZE].into_boxed_slice(),
        }
    }
}

/// One worker shard: a persistent deflate stream plus the tiles of the
/// grid columns it owns.
struct Shard {
    zs: Compress,
    tiles: Vec<Tile>,
    /// Grid columns owned by this shard.
    cols: usize,
}

impl Shard {
    fn tile_index(&self, gx: u32, gy: u32) -> usize {
        gy as usize * self.cols + gx as usize / STREAM_COUNT
    }
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    width: u32,
    height: u32,
    grid_width: u32,
    grid_height: u32,
}

impl Geometry {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            grid_width: width.div_ceil(TILE_SIDE),
            grid_height: height.div_ceil(TILE_SIDE),
        }
    }

    /// Pixel rectangle of a grid tile, clipped to the frame.
    fn tile_rect(&self, gx: u32, gy: u32) -> Rect {
        let x = gx * TILE_SIDE;
        let y = gy * TILE_SIDE;
        Rect::new(
            x,
            y,
            TILE_SIDE.min(self.width - x),
            TILE_SIDE.min(self.height - y),
        )
    }
}

fn shard_cols(grid_width: u32, index: usize) -> usize {
    ((grid_width as usize).saturating_sub(index) + STREAM_COUNT - 1) / STREAM_COUNT
}

struct FrameJob {
    fb: Arc<FrameBuffer>,
    sfmt: RfbPixelFormat,
    dfmt: RfbPixelFormat,
    quality: TightQuality,
    dst: BytesMut,
    on_done: Box<dyn FnOnce(BytesMut) + Send>,
}

struct Inner {
    sched: Scheduler,
    geom: Mutex<Geometry>,
    shards: [Mutex<Shard>; STREAM_COUNT],
    job: Mutex<Option<FrameJob>>,
    pending_jobs: AtomicUsize,
}

/// Tile-sharded parallel Tight encoder.
pub struct TightEncoder {
    inner: Arc<Inner>,
}

impl TightEncoder {
    /// Create an encoder for the given frame size.
    pub fn new(sched: Scheduler, width: u32, height: u32) -> Self {
        let shards = std::array::from_fn(|_| {
            Mutex::new(Shard {
                zs: Compress::new(Compression::new(1), true),
                tiles: Vec::new(),
                cols: 0,
            })
        });
        let encoder = Self {
            inner: Arc::new(Inner {
                sched,
                geom: Mutex::new(Geometry::new(0, 0)),
                shards,
                job: Mutex::new(None),
                pending_jobs: AtomicUsize::new(0),
            }),
        };
        encoder.resize(width, height);
        encoder
    }

    /// Resize the tile grid. The deflate streams persist across resizes.
    ///
    /// Must not be called while a frame is in flight.
    pub fn resize(&self, width: u32, height: u32) {
        debug_assert!(
            self.inner.job.lock().is_none(),
            "tight encoder resized mid-frame"
        );
        let mut geom = self.inner.geom.lock();
        *geom = Geometry::new(width, height);
        for (index, shard) in self.inner.shards.iter().enumerate() {
            let mut shard = shard.lock();
            shard.cols = shard_cols(geom.grid_width, index);
            let tiles = shard.cols * geom.grid_height as usize;
            shard.tiles.clear();
            shard.tiles.resize_with(tiles, Tile::new);
        }
    }

    /// Encode one damaged frame asynchronously.
    ///
    /// Returns after scheduling the shard jobs; `on_done` receives the
    /// serialised update payload exactly once, on the main context. The
    /// previous frame must have completed first, since the wire stream
    /// cannot interleave updates.
    ///
    /// # Panics
    ///
    /// Panics if the previous frame has not drained, and aborts the
    /// process on a mid-encode basic-mode failure (a partially emitted
    /// update cannot be recovered on the wire).
    pub fn encode_frame<F>(
        &self,
        dfmt: &RfbPixelFormat,
        fb: Arc<FrameBuffer>,
        sfmt: &RfbPixelFormat,
        damage: &Region,
        quality: TightQuality,
        on_done: F,
    ) -> Result<(), TightError>
    where
        F: FnOnce(BytesMut) + Send + 'static,
    {
        let inner = &self.inner;
        let mut job_slot = inner.job.lock();
        assert!(
            job_slot.is_none(),
            "tight encoder fed before the previous frame drained"
        );

        fb.map()?;
        debug_assert_eq!(sfmt.bits_per_pixel, 32, "tight sources are 32-bit");

        let geom = *inner.geom.lock();
        if geom.width != fb.width() || geom.height != fb.height() {
            return Err(TightError::DimensionMismatch {
                encoder_width: geom.width,
                encoder_height: geom.height,
                fb_width: fb.width(),
                fb_height: fb.height(),
            });
        }

        let n_rects = self.apply_damage(&geom, damage);
        trace!(n_rects, quality = ?quality, "tight frame scheduled");

        let mut dst =
            BytesMut::with_capacity(geom.width as usize * geom.height as usize * 4);
        debug_assert!(n_rects <= u16::MAX as usize);
        wire::encode_rect_count(&mut dst, n_rects as u16);

        *job_slot = Some(FrameJob {
            fb,
            sfmt: *sfmt,
            dfmt: *dfmt,
            quality,
            dst,
            on_done: Box::new(on_done),
        });
        drop(job_slot);

        inner.pending_jobs.store(STREAM_COUNT, Ordering::Release);
        for index in 0..STREAM_COUNT {
            let work_inner = inner.clone();
            let done_inner = inner.clone();
            inner.sched.spawn_worker(
                move || shard_work(&work_inner, index),
                move || {
                    if done_inner.pending_jobs.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let finish_inner = done_inner.clone();
                        done_inner.sched.post(move || finish(&finish_inner));
                    }
                },
            );
        }
        Ok(())
    }

    /// Mark every tile overlapping `damage` and return how many there
    /// are; this is the rectangle count of the update.
    fn apply_damage(&self, geom: &Geometry, damage: &Region) -> usize {
        let mut damaged = 0;
        for (index, shard) in self.inner.shards.iter().enumerate() {
            let mut shard = shard.lock();
            for gy in 0..geom.grid_height {
                for gx in (index as u32..geom.grid_width).step_by(STREAM_COUNT) {
                    let idx = shard.tile_index(gx, gy);
                    let state = if damage.intersects_rect(&geom.tile_rect(gx, gy)) {
                        damaged += 1;
                        TileState::Damaged
                    } else {
                        TileState::Ready
                    };
                    shard.tiles[idx].state = state;
                }
            }
        }
        damaged
    }
}

/// Encode every damaged tile owned by shard `index`.
fn shard_work(inner: &Arc<Inner>, index: usize) {
    let (fb, sfmt, dfmt, quality) = {
        let job = inner.job.lock();
        let job = job.as_ref().expect("shard scheduled without a frame");
        (job.fb.clone(), job.sfmt, job.dfmt, job.quality)
    };
    let geom = *inner.geom.lock();

    let mut shard = inner.shards[index].lock();
    let shard = &mut *shard;
    for gy in 0..geom.grid_height {
        for gx in (index as u32..geom.grid_width).step_by(STREAM_COUNT) {
            let idx = shard.tile_index(gx, gy);
            if shard.tiles[idx].state != TileState::Damaged {
                continue;
            }
            let rect = geom.tile_rect(gx, gy);
            let tile = &mut shard.tiles[idx];
            encode_tile(tile, &mut shard.zs, index, &fb, &sfmt, &dfmt, quality, rect);
            tile.state = TileState::Encoded;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn encode_tile(
    tile: &mut Tile,
    zs: &mut Compress,
    stream_index: usize,
    fb: &FrameBuffer,
    sfmt: &RfbPixelFormat,
    dfmt: &RfbPixelFormat,
    quality: TightQuality,
    rect: Rect,
) {
    tile.size = 0;

    // Without JPEG support every quality level degrades to lossless.
    let quality = if cfg!(feature = "jpeg") {
        quality
    } else {
        TightQuality::Lossless
    };

    match quality {
        TightQuality::Lossless => {
            encode_tile_basic(tile, zs, stream_index, fb, sfmt, dfmt, rect);
        }
        #[cfg(feature = "jpeg")]
        TightQuality::High | TightQuality::Low => {
            if let Err(e) = encode_tile_jpeg(tile, fb, quality, rect) {
                warn!("JPEG tile at {},{} failed, sending it empty: {e}", rect.x, rect.y);
                tile.size = 0;
            }
        }
        #[cfg(not(feature = "jpeg"))]
        TightQuality::High | TightQuality::Low => unreachable!(),
    }
}

fn encode_tile_basic(
    tile: &mut Tile,
    zs: &mut Compress,
    stream_index: usize,
    fb: &FrameBuffer,
    sfmt: &RfbPixelFormat,
    dfmt: &RfbPixelFormat,
    rect: Rect,
) {
    tile.ty = TIGHT_BASIC | (stream_index as u8) << 4;

    let bytes_per_cpixel = dfmt.bytes_per_cpixel();
    debug_assert!(bytes_per_cpixel <= 4);

    // 24-bit destinations recode through the canonical XBGR-derived
    // three-byte form; everything else passes through unchanged.
    let cfmt = if bytes_per_cpixel == 3 {
        PixelFormat::Xbgr8888.rfb_format()
    } else {
        *dfmt
    };

    let data = fb.data();
    let stride = fb.stride() as usize;
    let mut row = [0u8; TILE_SIDE as usize * 4];

    for y in rect.y..rect.bottom() {
        let offset = (y as usize * stride + rect.x as usize) * 4;
        let src_row = &data[offset..offset + rect.width as usize * 4];
        pixel32_to_cpixel(&mut row, &cfmt, src_row, sfmt, bytes_per_cpixel, rect.width as usize);

        let flush = y == rect.bottom() - 1;
        if let Err(e) = tight_deflate(
            tile,
            &row[..bytes_per_cpixel * rect.width as usize],
            zs,
            flush,
        ) {
            // The rectangle count is already on the wire; there is no
            // way to back out of a half-encoded basic tile.
            error!("unrecoverable tight basic failure: {e}");
            std::process::abort();
        }
    }
}

/// Deflate `src` into the tile's fixed buffer, sync-flushing when the
/// tile's last row goes in.
fn tight_deflate(
    tile: &mut Tile,
    src: &[u8],
    zs: &mut Compress,
    flush: bool,
) -> Result<(), String> {
    let mode = if flush {
        FlushCompress::Sync
    } else {
        FlushCompress::None
    };
    let mut consumed = 0;
    loop {
        if tile.size >= MAX_TILE_SIZE {
            return Err("tile output buffer overflow".into());
        }
        let in_before = zs.total_in();
        let out_before = zs.total_out();
        zs.compress(&src[consumed..], &mut tile.buf[tile.size..], mode)
            .map_err(|e| format!("deflate failed: {e}"))?;
        consumed += (zs.total_in() - in_before) as usize;
        tile.size += (zs.total_out() - out_before) as usize;
        if tile.size < MAX_TILE_SIZE {
            break;
        }
    }
    debug_assert_eq!(consumed, src.len());
    Ok(())
}

#[cfg(feature = "jpeg")]
fn jpeg_pixel_format(format: PixelFormat) -> Option<turbojpeg::PixelFormat> {
    match format {
        PixelFormat::Rgba8888 | PixelFormat::Rgbx8888 => Some(turbojpeg::PixelFormat::XBGR),
        PixelFormat::Bgra8888 | PixelFormat::Bgrx8888 => Some(turbojpeg::PixelFormat::XRGB),
        PixelFormat::Argb8888 | PixelFormat::Xrgb8888 => Some(turbojpeg::PixelFormat::BGRX),
        PixelFormat::Abgr8888 | PixelFormat::Xbgr8888 => Some(turbojpeg::PixelFormat::RGBX),
        _ => None,
    }
}

#[cfg(feature = "jpeg")]
fn encode_tile_jpeg(
    tile: &mut Tile,
    fb: &FrameBuffer,
    quality: TightQuality,
    rect: Rect,
) -> Result<(), String> {
    tile.ty = TIGHT_JPEG;

    let quality = match quality {
        TightQuality::High => JPEG_QUALITY_HIGH,
        TightQuality::Low => JPEG_QUALITY_LOW,
        TightQuality::Lossless => unreachable!("lossless never reaches the JPEG path"),
    };

    let format = jpeg_pixel_format(fb.format())
        .ok_or_else(|| format!("no JPEG mapping for {:?}", fb.format()))?;

    let data = fb.data();
    let offset = (rect.y as usize * fb.stride() as usize + rect.x as usize) * 4;
    let image = turbojpeg::Image {
        pixels: &data[offset..],
        width: rect.width as usize,
        pitch: fb.stride_bytes(),
        height: rect.height as usize,
        format,
    };

    let jpeg = turbojpeg::compress(image, quality, turbojpeg::Subsamp::Sub2x1)
        .map_err(|e| format!("compression failed: {e}"))?;
    if jpeg.len() > MAX_TILE_SIZE {
        return Err(format!(
            "encoded JPEG ({} bytes) too big for the tile buffer",
            jpeg.len()
        ));
    }
    tile.buf[..jpeg.len()].copy_from_slice(&jpeg);
    tile.size = jpeg.len();
    Ok(())
}

/// Serialise every encoded tile in row-major order and complete the
/// frame. Runs on the main context after all shards have drained.
fn finish(inner: &Arc<Inner>) {
    Scheduler::assert_main_context();
    let job = inner
        .job
        .lock()
        .take()
        .expect("tight finish without a frame");
    let FrameJob {
        fb,
        mut dst,
        on_done,
        ..
    } = job;
    let geom = *inner.geom.lock();

    let mut shards: Vec<_> = inner.shards.iter().map(|s| s.lock()).collect();
    for gy in 0..geom.grid_height {
        for gx in 0..geom.grid_width {
            let shard = &mut *shards[gx as usize % STREAM_COUNT];
            let idx = shard.tile_index(gx, gy);
            let tile = &mut shard.tiles[idx];
            debug_assert_ne!(tile.state, TileState::Damaged, "tile skipped by its shard");
            if tile.state != TileState::Encoded {
                continue;
            }
            let rect = geom.tile_rect(gx, gy);
            wire::encode_rect_head(
                &mut dst,
                ENCODING_TIGHT,
                rect.x as u16,
                rect.y as u16,
                rect.width as u16,
                rect.height as u16,
            );
            dst.put_u8(tile.ty);
            wire::encode_compact_size(&mut dst, tile.size);
            dst.extend_from_slice(&tile.buf[..tile.size]);
            tile.state = TileState::Ready;
        }
    }
    drop(shards);
    drop(fb);

    trace!(bytes = dst.len(), "tight frame serialised");
    on_done(dst);
}
