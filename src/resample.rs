//! Frame Resampler
//!
//! Normalises the orientation of incoming framebuffers. Frames that
//! already have the identity transform pass through untouched; rotated
//! or mirrored frames are copied into a pool-owned buffer on a worker
//! thread, pixel coordinates remapped into identity orientation.
//!
//! The completion callback always runs on the main context and never
//! before [`Resampler::feed`] returns, for both paths.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::fb::{FbError, FbPool, FrameBuffer};
use crate::region::{Region, Transform};
use crate::sched::Scheduler;

/// Orientation normaliser with a private framebuffer pool for its
/// outputs.
pub struct Resampler {
    sched: Scheduler,
    pool: FbPool,
}

impl Resampler {
    /// Create a resampler on the given scheduler.
    pub fn new(sched: Scheduler) -> Self {
        Self {
            sched,
            pool: FbPool::new(0, 0, crate::pixfmt::PixelFormat::Xrgb8888, 0),
        }
    }

    /// Feed one frame for normalisation.
    ///
    /// `damage` must already be in identity orientation (the caller
    /// transforms it alongside the frame). The callback receives the
    /// normalised framebuffer, which is the input buffer itself when no
    /// transform is needed; the callee takes whatever holds or clones it
    /// wants to keep.
    pub fn feed<F>(&self, fb: Arc<FrameBuffer>, damage: Region, on_done: F) -> Result<(), FbError>
    where
        F: FnOnce(Arc<FrameBuffer>, Region) + Send + 'static,
    {
        if fb.transform() == Transform::Normal {
            trace!("identity transform, passing frame through");
            self.sched.post(move || on_done(fb, damage));
            return Ok(());
        }

        fb.map()?;

        let (out_width, out_height) =
            fb.transform().apply_to_dimensions(fb.width(), fb.height());
        self.pool.resize(out_width, out_height, fb.format(), out_width);
        let out = self.pool.acquire();

        fb.hold();

        // The worker produces the output buffer; the completion hands it
        // to the callback on the main context.
        let slot = Arc::new(Mutex::new(None));
        let work_slot = slot.clone();
        self.sched.spawn_worker(
            move || {
                let mut out = out;
                {
                    let dst = Arc::get_mut(&mut out)
                        .expect("freshly acquired pool buffer is uniquely owned");
                    transform_copy(&fb, dst);
                }
                *work_slot.lock() = Some((fb, out));
            },
            move || {
                let (fb, out) = slot.lock().take().expect("worker completed");
                fb.release();
                on_done(out, damage);
            },
        );
        Ok(())
    }
}

/// Copy `src` into `dst`, remapping every pixel into identity
/// orientation.
fn transform_copy(src: &FrameBuffer, dst: &mut FrameBuffer) {
    let transform = src.transform();
    let bpp = src.format().bytes_per_pixel();
    let width = src.width();
    let height = src.height();
    let src_stride = src.stride() as usize;
    let dst_stride = dst.stride() as usize;

    let src_data = src.data();
    let dst_data = dst.data_mut();

    for sy in 0..height {
        for sx in 0..width {
            let (dx, dy) = transform.apply_to_point(sx, sy, width, height);
            let from = (sy as usize * src_stride + sx as usize) * bpp;
            let to = (dy as usize * dst_stride + dx as usize) * bpp;
            dst_data[to..to + bpp].copy_from_slice(&src_data[from..from + bpp]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixfmt::PixelFormat;
    use crate::region::Rect;
    use tokio::sync::oneshot;

    fn coded_fb(width: u32, height: u32, transform: Transform) -> Arc<FrameBuffer> {
        // Each pixel encodes its own coordinates so tests can check the
        // remapping exactly.
        let mut data = vec![0u8; (width * height * 4) as usize];
        for y in 0..height {
            for x in 0..width {
                let i = ((y * width + x) * 4) as usize;
                data[i] = x as u8;
                data[i + 1] = y as u8;
            }
        }
        let mut fb = FrameBuffer::from_buffer(data, width, height, PixelFormat::Xrgb8888, width);
        fb.set_transform(transform);
        Arc::new(fb)
    }

    fn pixel(fb: &FrameBuffer, x: u32, y: u32) -> (u8, u8) {
        let i = ((y * fb.stride() + x) * 4) as usize;
        let data = fb.data();
        (data[i], data[i + 1])
    }

    #[tokio::test]
    async fn test_identity_passes_input_through() {
        let sched = Scheduler::spawn();
        let resampler = Resampler::new(sched);
        let fb = coded_fb(8, 4, Transform::Normal);
        let damage = Region::from_rect(Rect::full_frame(8, 4));

        let input = fb.clone();
        let (tx, rx) = oneshot::channel();
        resampler
            .feed(fb, damage, move |out, region| {
                let _ = tx.send((Arc::ptr_eq(&out, &input), region));
            })
            .unwrap();
        let (same, region) = rx.await.unwrap();
        assert!(same, "identity frames must pass through by reference");
        assert_eq!(region.rects(), [Rect::full_frame(8, 4)]);
    }

    #[tokio::test]
    async fn test_rot90_remaps_pixels() {
        let sched = Scheduler::spawn();
        let resampler = Resampler::new(sched);
        let fb = coded_fb(8, 4, Transform::Rot90);

        let (tx, rx) = oneshot::channel();
        resampler
            .feed(fb, Region::new(), move |out, _| {
                let _ = tx.send(out);
            })
            .unwrap();
        let out = rx.await.unwrap();

        assert_eq!((out.width(), out.height()), (4, 8));
        // Source (0, 0) lands at (H - 1, 0) = (3, 0).
        assert_eq!(pixel(&out, 3, 0), (0, 0));
        // Source (7, 3) lands at (0, 7).
        assert_eq!(pixel(&out, 0, 7), (7, 3));
    }

    #[tokio::test]
    async fn test_flipped_remaps_pixels() {
        let sched = Scheduler::spawn();
        let resampler = Resampler::new(sched);
        let fb = coded_fb(8, 4, Transform::Flipped);

        let (tx, rx) = oneshot::channel();
        resampler
            .feed(fb, Region::new(), move |out, _| {
                let _ = tx.send(out);
            })
            .unwrap();
        let out = rx.await.unwrap();

        assert_eq!((out.width(), out.height()), (8, 4));
        assert_eq!(pixel(&out, 7, 0), (0, 0));
        assert_eq!(pixel(&out, 0, 3), (7, 3));
    }

    #[tokio::test]
    async fn test_input_hold_is_balanced() {
        let sched = Scheduler::spawn();
        let resampler = Resampler::new(sched);
        let fb = coded_fb(8, 4, Transform::Rot180);
        let input = fb.clone();

        let (tx, rx) = oneshot::channel();
        resampler
            .feed(fb, Region::new(), move |_, _| {
                let _ = tx.send(());
            })
            .unwrap();
        rx.await.unwrap();
        assert_eq!(input.hold_count(), 0);
    }
}
