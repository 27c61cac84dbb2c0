//! Framebuffer Objects
//!
//! A [`FrameBuffer`] owns one captured frame's pixels together with the
//! metadata the pipeline needs: geometry, FourCC format, output transform
//! and storage kind. Buffers are shared through `Arc`; on top of that the
//! *hold* count tracks pipeline possession. While the hold count is
//! non-zero the producer may read the buffer but must not write to it.
//! When the count returns to zero the release hook fires, which is how
//! producers (and [`FbPool`]) learn that the pixels are theirs again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::pixfmt::PixelFormat;
use crate::region::Transform;

/// Framebuffer errors
#[derive(Debug, thiserror::Error)]
pub enum FbError {
    /// Importing a GPU buffer object into system memory failed.
    #[error("failed to import GPU buffer: {0}")]
    ImportFailed(String),

    /// The imported pixel data does not match the declared geometry.
    #[error("imported buffer too small: {got} bytes, expected {expected}")]
    ImportTooSmall {
        /// Bytes the import produced.
        got: usize,
        /// Bytes the geometry requires.
        expected: usize,
    },
}

/// Storage kind of a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FbKind {
    /// Pixels live in system memory and are always readable.
    Memory,
    /// Pixels live in a GPU buffer object and must be mapped first.
    Gpu,
}

/// A GPU buffer object that can be imported into system memory.
///
/// Capture sources that produce GPU-side buffers implement this to give
/// the software encoders CPU access. `export` is called at most once per
/// buffer, from a worker or the main context, and the result is cached by
/// [`FrameBuffer::map`].
pub trait BufferObject: Send + Sync {
    /// Copy the buffer contents into system memory, row-contiguous at the
    /// framebuffer's stride.
    fn export(&self) -> Result<Vec<u8>, FbError>;
}

/// Release hook invoked when the hold count returns to zero.
pub type ReleaseFn = Arc<dyn Fn(&Arc<FrameBuffer>) + Send + Sync>;

enum Storage {
    Memory(Vec<u8>),
    Gpu(Box<dyn BufferObject>),
}

/// A pixel buffer and its metadata
///
/// Geometry, format and transform are fixed at construction time; only
/// the hold count, the release hook and the cached GPU mapping change
/// afterwards. Memory lifetime is the `Arc` count, pipeline possession is
/// the hold count, and the two are deliberately independent: a producer
/// can drop its `Arc` while the pipeline still holds the frame, and the
/// pipeline can release its hold while the producer keeps the `Arc` for
/// reuse.
pub struct FrameBuffer {
    width: u32,
    height: u32,
    /// Distance between rows, in pixels.
    stride: u32,
    format: PixelFormat,
    modifier: u64,
    transform: Transform,
    storage: Storage,
    mapped: OnceLock<Vec<u8>>,
    hold_count: AtomicUsize,
    on_release: Mutex<Option<ReleaseFn>>,
}

impl FrameBuffer {
    /// Allocate a zeroed system-memory framebuffer.
    pub fn new(width: u32, height: u32, format: PixelFormat, stride: u32) -> Self {
        let size = stride as usize * height as usize * format.bytes_per_pixel();
        Self::from_buffer(vec![0u8; size], width, height, format, stride)
    }

    /// Wrap an existing system-memory pixel buffer.
    ///
    /// `data` must cover `stride * height` pixels at the format's pixel
    /// size.
    pub fn from_buffer(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: u32,
    ) -> Self {
        debug_assert!(width > 0 && height > 0, "zero-sized framebuffer");
        debug_assert!(stride >= width, "stride shorter than a row");
        debug_assert!(
            data.len() >= stride as usize * height as usize * format.bytes_per_pixel(),
            "pixel buffer shorter than its geometry"
        );
        Self {
            width,
            height,
            stride,
            format,
            modifier: 0,
            transform: Transform::Normal,
            storage: Storage::Memory(data),
            mapped: OnceLock::new(),
            hold_count: AtomicUsize::new(0),
            on_release: Mutex::new(None),
        }
    }

    /// Wrap a GPU buffer object.
    ///
    /// The pixels are not readable until [`map`](Self::map) has imported
    /// them.
    pub fn from_bo(
        bo: Box<dyn BufferObject>,
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: u32,
        modifier: u64,
    ) -> Self {
        debug_assert!(width > 0 && height > 0, "zero-sized framebuffer");
        Self {
            width,
            height,
            stride,
            format,
            modifier,
            transform: Transform::Normal,
            storage: Storage::Gpu(bo),
            mapped: OnceLock::new(),
            hold_count: AtomicUsize::new(0),
            on_release: Mutex::new(None),
        }
    }

    /// Set the output transform. Must happen before the buffer is shared
    /// with the pipeline.
    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    /// Install the hook invoked whenever the hold count returns to zero.
    pub fn set_release_fn<F>(&self, f: F)
    where
        F: Fn(&Arc<FrameBuffer>) + Send + Sync + 'static,
    {
        *self.on_release.lock() = Some(Arc::new(f));
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in pixels.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Row stride in bytes.
    pub fn stride_bytes(&self) -> usize {
        self.stride as usize * self.format.bytes_per_pixel()
    }

    /// Pixel format.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// DRM format modifier of the underlying buffer object.
    pub fn modifier(&self) -> u64 {
        self.modifier
    }

    /// Output transform the producer rendered with.
    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Storage kind.
    pub fn kind(&self) -> FbKind {
        match self.storage {
            Storage::Memory(_) => FbKind::Memory,
            Storage::Gpu(_) => FbKind::Gpu,
        }
    }

    /// Make the pixel data readable.
    ///
    /// A no-op for memory buffers. For GPU buffers the first call imports
    /// the contents into system memory; subsequent calls reuse the cached
    /// import.
    pub fn map(&self) -> Result<(), FbError> {
        let bo = match &self.storage {
            Storage::Memory(_) => return Ok(()),
            Storage::Gpu(bo) => bo,
        };
        if self.mapped.get().is_some() {
            return Ok(());
        }
        let pixels = bo.export()?;
        let expected = self.stride_bytes() * self.height as usize;
        if pixels.len() < expected {
            return Err(FbError::ImportTooSmall {
                got: pixels.len(),
                expected,
            });
        }
        trace!(width = self.width, height = self.height, "imported GPU buffer");
        let _ = self.mapped.set(pixels);
        Ok(())
    }

    /// Borrow the pixel data.
    ///
    /// # Panics
    ///
    /// Panics for a GPU buffer that has not been mapped.
    pub fn data(&self) -> &[u8] {
        match &self.storage {
            Storage::Memory(data) => data,
            Storage::Gpu(_) => self
                .mapped
                .get()
                .expect("GPU framebuffer accessed before map()"),
        }
    }

    /// Mutably borrow the pixel data of a memory buffer.
    ///
    /// Only legal while the caller is the sole owner (hold count zero,
    /// unshared `Arc`), which is how the resampler fills pool buffers
    /// before publishing them.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Memory(data) => data,
            Storage::Gpu(_) => panic!("GPU framebuffers are not writable by the pipeline"),
        }
    }

    /// Take pipeline possession of the buffer.
    pub fn hold(&self) {
        self.hold_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Give up one unit of pipeline possession.
    ///
    /// Invokes the release hook when the count returns to zero.
    pub fn release(self: &Arc<Self>) {
        let prev = self.hold_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            // Undo the wrap so drop checks stay meaningful.
            self.hold_count.fetch_add(1, Ordering::AcqRel);
            panic!("framebuffer released without a matching hold");
        }
        if prev == 1 {
            let hook = self.on_release.lock().clone();
            if let Some(hook) = hook {
                hook(self);
            }
        }
    }

    /// Current hold count.
    pub fn hold_count(&self) -> usize {
        self.hold_count.load(Ordering::Acquire)
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        let holds = self.hold_count.load(Ordering::Acquire);
        if holds != 0 {
            error!(holds, "framebuffer dropped while still held by the pipeline");
            debug_assert_eq!(holds, 0, "framebuffer dropped while held");
        }
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("transform", &self.transform)
            .field("kind", &self.kind())
            .field("hold_count", &self.hold_count())
            .finish()
    }
}

struct PoolConfig {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: u32,
}

struct PoolInner {
    config: Mutex<PoolConfig>,
    spares: Mutex<Vec<Arc<FrameBuffer>>>,
}

impl PoolInner {
    fn put_back(&self, fb: Arc<FrameBuffer>) {
        let config = self.config.lock();
        if fb.width() == config.width
            && fb.height() == config.height
            && fb.format() == config.format
            && fb.stride() == config.stride
        {
            self.spares.lock().push(fb);
        }
    }
}

/// A ring of reusable memory framebuffers
///
/// `acquire` hands out buffers whose release hook returns them to the
/// pool once the pipeline lets go, so steady-state operation allocates
/// nothing. Resizing drops spares of the old geometry as they come back.
pub struct FbPool {
    inner: Arc<PoolInner>,
}

impl FbPool {
    /// Create a pool producing buffers of the given geometry.
    pub fn new(width: u32, height: u32, format: PixelFormat, stride: u32) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config: Mutex::new(PoolConfig {
                    width,
                    height,
                    format,
                    stride,
                }),
                spares: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Change the buffer geometry. Returns true if it changed; spare
    /// buffers of the old geometry are discarded.
    pub fn resize(&self, width: u32, height: u32, format: PixelFormat, stride: u32) -> bool {
        let mut config = self.inner.config.lock();
        if config.width == width
            && config.height == height
            && config.format == format
            && config.stride == stride
        {
            return false;
        }
        *config = PoolConfig {
            width,
            height,
            format,
            stride,
        };
        drop(config);
        self.inner.spares.lock().clear();
        true
    }

    /// Take a buffer from the pool, allocating if no spare is available.
    ///
    /// Returned buffers are uniquely owned and therefore writable.
    pub fn acquire(&self) -> Arc<FrameBuffer> {
        {
            let mut spares = self.inner.spares.lock();
            while let Some(fb) = spares.pop() {
                // A late reader may still reference a returned spare;
                // such a buffer must not be handed to a writer.
                if Arc::strong_count(&fb) == 1 {
                    return fb;
                }
            }
        }
        let config = self.inner.config.lock();
        let fb = FrameBuffer::new(config.width, config.height, config.format, config.stride);
        drop(config);
        let pool = Arc::downgrade(&self.inner);
        fb.set_release_fn(move |fb: &Arc<FrameBuffer>| {
            if let Some(pool) = pool.upgrade() {
                pool.put_back(fb.clone());
            }
        });
        Arc::new(fb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fb_geometry() {
        let fb = FrameBuffer::new(640, 480, PixelFormat::Xrgb8888, 640);
        assert_eq!(fb.width(), 640);
        assert_eq!(fb.height(), 480);
        assert_eq!(fb.stride_bytes(), 640 * 4);
        assert_eq!(fb.kind(), FbKind::Memory);
        assert_eq!(fb.data().len(), 640 * 480 * 4);
    }

    #[test]
    fn test_release_hook_fires_once_per_zero_crossing() {
        let fb = Arc::new(FrameBuffer::new(4, 4, PixelFormat::Xrgb8888, 4));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        fb.set_release_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        fb.hold();
        fb.hold();
        fb.release();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        fb.release();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A fresh hold cycle fires the hook again.
        fb.hold();
        fb.release();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_hold_outlasts_producer_reference() {
        let fb = Arc::new(FrameBuffer::new(4, 4, PixelFormat::Xrgb8888, 4));
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        fb.set_release_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        fb.hold();
        let pipeline_ref = fb.clone();
        drop(fb); // producer lets go of its Arc first
        assert_eq!(pipeline_ref.hold_count(), 1);
        pipeline_ref.release();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "without a matching hold")]
    fn test_unbalanced_release_panics() {
        let fb = Arc::new(FrameBuffer::new(4, 4, PixelFormat::Xrgb8888, 4));
        fb.release();
    }

    struct TestBo {
        pixels: Vec<u8>,
    }

    impl BufferObject for TestBo {
        fn export(&self) -> Result<Vec<u8>, FbError> {
            Ok(self.pixels.clone())
        }
    }

    #[test]
    fn test_gpu_buffer_map_is_idempotent() {
        let bo = TestBo {
            pixels: vec![0xAB; 8 * 8 * 4],
        };
        let fb = FrameBuffer::from_bo(Box::new(bo), 8, 8, PixelFormat::Xrgb8888, 8, 0);
        assert_eq!(fb.kind(), FbKind::Gpu);
        fb.map().unwrap();
        fb.map().unwrap();
        assert_eq!(fb.data()[0], 0xAB);
    }

    #[test]
    fn test_gpu_buffer_short_import_fails() {
        let bo = TestBo {
            pixels: vec![0; 16],
        };
        let fb = FrameBuffer::from_bo(Box::new(bo), 8, 8, PixelFormat::Xrgb8888, 8, 0);
        assert!(matches!(fb.map(), Err(FbError::ImportTooSmall { .. })));
    }

    #[test]
    fn test_pool_recycles_released_buffers() {
        let pool = FbPool::new(16, 16, PixelFormat::Xrgb8888, 16);
        let fb = pool.acquire();
        let id = Arc::as_ptr(&fb) as usize;
        fb.hold();
        fb.release(); // returns to the pool
        drop(fb);

        let again = pool.acquire();
        assert_eq!(Arc::as_ptr(&again) as usize, id);
    }

    #[test]
    fn test_pool_resize_discards_stale_spares() {
        let pool = FbPool::new(16, 16, PixelFormat::Xrgb8888, 16);
        let fb = pool.acquire();
        fb.hold();
        fb.release();
        drop(fb);

        assert!(pool.resize(32, 32, PixelFormat::Xrgb8888, 32));
        let fb = pool.acquire();
        assert_eq!(fb.width(), 32);
    }
}
