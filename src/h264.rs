//! H.264 Encoder
//!
//! A serial video encoder over a framebuffer queue. Frames are fed from
//! the main context, encoded one at a time on a worker thread, and the
//! resulting packets are delivered to the packet handler on the main
//! context in feed order. At most one encode is ever in flight.
//!
//! Keyframes are selected manually: the first frame is always a
//! keyframe, after that [`H264Encoder::request_keyframe`] latches one
//! for whichever frame enters encoding next. OpenH264 is tuned for
//! real-time screen content; its output is an Annex B byte stream, which
//! is what the Open H.264 RFB encoding carries.

use std::collections::VecDeque;
use std::sync::Arc;

use openh264::encoder::{Encoder, EncoderConfig, UsageType};
use openh264::formats::{AbgrSliceU8, ArgbSliceU8, BgraSliceU8, RgbaSliceU8, YUVBuffer};
use openh264::OpenH264API;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::fb::{FbKind, FrameBuffer};
use crate::pixfmt::PixelFormat;
use crate::region::Transform;
use crate::sched::Scheduler;

/// Target bitrate for the video stream.
const BITRATE_BPS: u32 = 5_000_000;

/// Upper bound the rate control plans for.
const MAX_FRAME_RATE: f32 = 30.0;

/// H.264 encoder errors.
#[derive(Debug, thiserror::Error)]
pub enum H264Error {
    /// Creating the codec failed.
    #[error("encoder initialisation failed: {0}")]
    InitFailed(String),

    /// The framebuffer format cannot be converted for encoding.
    #[error("pixel format {0:?} is not encodable")]
    UnsupportedFormat(PixelFormat),
}

/// Handler receiving encoded packets on the main context.
pub type PacketHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Memory layout of the source pixels, selected once at creation.
#[derive(Debug, Clone, Copy)]
enum SourceLayout {
    Bgra,
    Rgba,
    Abgr,
    Argb,
}

impl SourceLayout {
    fn for_format(format: PixelFormat) -> Option<Self> {
        match format {
            PixelFormat::Xrgb8888 | PixelFormat::Argb8888 => Some(Self::Bgra),
            PixelFormat::Xbgr8888 | PixelFormat::Abgr8888 => Some(Self::Rgba),
            PixelFormat::Rgbx8888 | PixelFormat::Rgba8888 => Some(Self::Abgr),
            PixelFormat::Bgrx8888 | PixelFormat::Bgra8888 => Some(Self::Argb),
            _ => None,
        }
    }

    fn to_yuv(self, pixels: &[u8], dimensions: (usize, usize)) -> YUVBuffer {
        match self {
            Self::Bgra => YUVBuffer::from_rgb_source(BgraSliceU8::new(pixels, dimensions)),
            Self::Rgba => YUVBuffer::from_rgb_source(RgbaSliceU8::new(pixels, dimensions)),
            Self::Abgr => YUVBuffer::from_rgb_source(AbgrSliceU8::new(pixels, dimensions)),
            Self::Argb => YUVBuffer::from_rgb_source(ArgbSliceU8::new(pixels, dimensions)),
        }
    }
}

struct EncoderState {
    queue: VecDeque<Arc<FrameBuffer>>,
    current: Option<Arc<FrameBuffer>>,
    current_is_keyframe: bool,
    next_frame_is_keyframe: bool,
    on_packet: Option<PacketHandler>,
    packet: Option<Vec<u8>>,
}

struct Inner {
    sched: Scheduler,
    width: u32,
    height: u32,
    layout: SourceLayout,
    codec: Mutex<Encoder>,
    state: Mutex<EncoderState>,
}

/// Serial H.264 encoder over a frame queue.
pub struct H264Encoder {
    inner: Arc<Inner>,
}

impl H264Encoder {
    /// Create an encoder for frames of the given geometry and format.
    pub fn create(
        sched: Scheduler,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self, H264Error> {
        let layout =
            SourceLayout::for_format(format).ok_or(H264Error::UnsupportedFormat(format))?;

        let config = EncoderConfig::new()
            .set_bitrate_bps(BITRATE_BPS)
            .max_frame_rate(MAX_FRAME_RATE)
            .enable_skip_frame(false)
            .usage_type(UsageType::ScreenContentRealTime);
        let codec = Encoder::with_api_config(OpenH264API::from_source(), config)
            .map_err(|e| H264Error::InitFailed(format!("{e:?}")))?;

        debug!(width, height, ?format, "created H.264 encoder");

        Ok(Self {
            inner: Arc::new(Inner {
                sched,
                width,
                height,
                layout,
                codec: Mutex::new(codec),
                state: Mutex::new(EncoderState {
                    queue: VecDeque::new(),
                    current: None,
                    current_is_keyframe: false,
                    next_frame_is_keyframe: true,
                    on_packet: None,
                    packet: None,
                }),
            }),
        })
    }

    /// Install the handler invoked with each encoded packet.
    pub fn set_packet_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.inner.state.lock().on_packet = Some(Arc::new(handler));
    }

    /// Latch a keyframe for the next frame that enters encoding.
    pub fn request_keyframe(&self) {
        self.inner.state.lock().next_frame_is_keyframe = true;
    }

    /// Enqueue one framebuffer for encoding.
    ///
    /// Takes a hold on the buffer for the duration of the encode. Frames
    /// must be GPU-backed and identity-transformed; the display gates
    /// the video path on exactly that.
    pub fn feed(&self, fb: Arc<FrameBuffer>) {
        debug_assert_eq!(fb.kind(), FbKind::Gpu, "video path needs GPU frames");
        debug_assert_eq!(fb.transform(), Transform::Normal);

        fb.hold();
        self.inner.state.lock().queue.push_back(fb);
        schedule_work(&self.inner);
    }
}

/// Start an encode if none is in flight and a frame is queued.
fn schedule_work(inner: &Arc<Inner>) {
    {
        let mut state = inner.state.lock();
        if state.current.is_some() {
            return;
        }
        let Some(fb) = state.queue.pop_front() else {
            return;
        };
        state.current = Some(fb);
        state.current_is_keyframe = state.next_frame_is_keyframe;
        state.next_frame_is_keyframe = false;
    }

    let work_inner = inner.clone();
    let done_inner = inner.clone();
    inner
        .sched
        .spawn_worker(move || encode_current(&work_inner), move || deliver(&done_inner));
}

/// Worker half: encode the current frame into `state.packet`.
fn encode_current(inner: &Arc<Inner>) {
    let (fb, keyframe) = {
        let state = inner.state.lock();
        (
            state.current.clone().expect("encode without a frame"),
            state.current_is_keyframe,
        )
    };

    if let Err(e) = fb.map() {
        warn!("dropping frame, GPU import failed: {e}");
        return;
    }

    let width = inner.width as usize;
    let height = inner.height as usize;
    let data = fb.data();
    let row_bytes = width * 4;

    // OpenH264's sources want tightly packed rows.
    let packed;
    let pixels: &[u8] = if fb.stride() as usize == width {
        &data[..row_bytes * height]
    } else {
        let stride_bytes = fb.stride_bytes();
        let mut rows = Vec::with_capacity(row_bytes * height);
        for y in 0..height {
            let start = y * stride_bytes;
            rows.extend_from_slice(&data[start..start + row_bytes]);
        }
        packed = rows;
        &packed
    };

    let yuv = inner.layout.to_yuv(pixels, (width, height));

    let mut codec = inner.codec.lock();
    if keyframe {
        codec.force_intra_frame();
    }
    match codec.encode(&yuv) {
        Ok(bitstream) => {
            let bytes = bitstream.to_vec();
            if bytes.is_empty() {
                warn!("encoder produced no output, dropping frame");
            } else {
                trace!(bytes = bytes.len(), keyframe, "encoded H.264 packet");
                inner.state.lock().packet = Some(bytes);
            }
        }
        Err(e) => {
            warn!("dropping frame, encode failed: {e:?}");
        }
    }
}

/// Main-context half: release the frame, deliver the packet, move on.
fn deliver(inner: &Arc<Inner>) {
    let (fb, packet, handler) = {
        let mut state = inner.state.lock();
        (
            state.current.take().expect("delivery without a frame"),
            state.packet.take(),
            state.on_packet.clone(),
        )
    };

    fb.release();
    drop(fb);

    if let (Some(packet), Some(handler)) = (packet, handler) {
        handler(&packet);
    }

    schedule_work(inner);
}
