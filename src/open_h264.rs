//! Open H.264 Rectangle Framing
//!
//! Wraps the raw packets of an [`H264Encoder`] in the Open H.264 RFB
//! rectangle format. Packets accumulate in a pending buffer between
//! client reads; a read drains them into a single rectangle covering the
//! whole display, prefixed with a length/flags header.
//!
//! Feeding a frame whose geometry or format differs from the current
//! encoder tears the encoder down and builds a fresh one, latching the
//! "reset context" flag so the next emitted rectangle tells decoders to
//! re-initialise. Since the framer starts without an encoder, the very
//! first rectangle always carries the flag.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::fb::FrameBuffer;
use crate::h264::{H264Encoder, H264Error};
use crate::pixfmt::PixelFormat;
use crate::sched::Scheduler;
use crate::wire::{self, ENCODING_OPEN_H264};

/// Flag bit telling the decoder to re-initialise its context.
pub const FLAG_RESET_CONTEXT: u32 = 1;

struct FramerState {
    encoder: Option<H264Encoder>,
    pending: BytesMut,
    width: u32,
    height: u32,
    format: Option<PixelFormat>,
    needs_reset: bool,
    on_ready: Arc<dyn Fn() + Send + Sync>,
}

/// Open H.264 framing over a rebuild-on-resize encoder.
pub struct OpenH264Framer {
    sched: Scheduler,
    state: Arc<Mutex<FramerState>>,
}

impl OpenH264Framer {
    /// Create a framer. `on_ready` is invoked on the main context each
    /// time new encoded bytes become available for reading.
    pub fn new<F>(sched: Scheduler, on_ready: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            sched,
            state: Arc::new(Mutex::new(FramerState {
                encoder: None,
                pending: BytesMut::new(),
                width: 0,
                height: 0,
                format: None,
                needs_reset: false,
                on_ready: Arc::new(on_ready),
            })),
        }
    }

    /// Feed one frame into the video stream, rebuilding the encoder
    /// first when the frame's geometry or format changed.
    pub fn feed_frame(&self, fb: &Arc<FrameBuffer>) -> Result<(), H264Error> {
        let mut state = self.state.lock();
        if state.width != fb.width()
            || state.height != fb.height()
            || state.format != Some(fb.format())
        {
            debug!(
                width = fb.width(),
                height = fb.height(),
                "rebuilding H.264 encoder for new frame geometry"
            );
            let encoder = H264Encoder::create(
                self.sched.clone(),
                fb.width(),
                fb.height(),
                fb.format(),
            )?;

            let pending = Arc::downgrade(&self.state);
            let on_ready = state.on_ready.clone();
            encoder.set_packet_handler(move |packet| {
                if let Some(state) = pending.upgrade() {
                    state.lock().pending.extend_from_slice(packet);
                    on_ready();
                }
            });

            state.encoder = Some(encoder);
            state.width = fb.width();
            state.height = fb.height();
            state.format = Some(fb.format());
            state.needs_reset = true;
        }

        state
            .encoder
            .as_ref()
            .expect("encoder exists after rebuild")
            .feed(fb.clone());
        Ok(())
    }

    /// Drain pending packets into `buffer` as one Open H.264 rectangle.
    ///
    /// Returns false and leaves `buffer` untouched when nothing is
    /// pending. Otherwise `buffer` is replaced with a rectangle count of
    /// one, a full-display rectangle head, the length/flags header and
    /// the packet bytes; the reset flag is consumed by this emission.
    pub fn read(&self, buffer: &mut BytesMut) -> bool {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return false;
        }

        buffer.clear();
        let flags = if state.needs_reset {
            FLAG_RESET_CONTEXT
        } else {
            0
        };
        state.needs_reset = false;

        wire::encode_rect_count(buffer, 1);
        wire::encode_rect_head(
            buffer,
            ENCODING_OPEN_H264,
            0,
            0,
            state.width as u16,
            state.height as u16,
        );
        buffer.put_u32(state.pending.len() as u32);
        buffer.put_u32(flags);
        buffer.extend_from_slice(&state.pending);
        state.pending.clear();
        true
    }

    /// Latch a keyframe on the underlying encoder, if one exists yet.
    pub fn request_keyframe(&self) {
        if let Some(encoder) = &self.state.lock().encoder {
            encoder.request_keyframe();
        }
    }
}
