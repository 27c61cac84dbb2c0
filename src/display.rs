//! Display Aggregator
//!
//! A [`Display`] is the entry point of the pipeline: capture sources
//! feed it framebuffers with a damage hint, and it wires together the
//! damage refinery, the resampler and the Open H.264 framer. Once a
//! frame has been normalised, the display adopts it as the *current
//! buffer* (held for as long as it may be encoded from) and notifies the
//! owning server that the damaged region can be offered to clients.
//!
//! The server is referenced weakly: displays belong to the server, never
//! the other way around.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;
#[cfg(feature = "h264")]
use tracing::warn;

use crate::damage::DamageRefinery;
use crate::fb::{FbError, FrameBuffer};
use crate::region::{transform_region, Region};
use crate::resample::Resampler;
use crate::sched::Scheduler;

#[cfg(feature = "h264")]
use crate::fb::FbKind;
#[cfg(feature = "h264")]
use crate::open_h264::OpenH264Framer;
#[cfg(feature = "h264")]
use crate::region::Transform;

/// Display errors reported to the producer.
#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    /// The framebuffer's pixels could not be made readable.
    #[error(transparent)]
    Fb(#[from] FbError),
}

/// Notification sink the owning server implements.
///
/// Both callbacks run on the main context.
pub trait ServerSink: Send + Sync {
    /// A region of the current buffer is ready for update delivery.
    fn damage_region(&self, region: &Region);

    /// New encoded video content is available; pending client update
    /// requests can be serviced.
    fn process_update_requests(&self);
}

struct DisplayState {
    buffer: Option<Arc<FrameBuffer>>,
    h264_supported: bool,
}

/// One remote display fed by a capture source.
pub struct Display {
    x_pos: u16,
    y_pos: u16,
    resampler: Resampler,
    refinery: Mutex<DamageRefinery>,
    #[cfg(feature = "h264")]
    open_h264: OpenH264Framer,
    state: Mutex<DisplayState>,
    server: Mutex<Option<Weak<dyn ServerSink>>>,
}

impl Display {
    /// Create a display at the given position in the server's layout.
    pub fn new(sched: Scheduler, x_pos: u16, y_pos: u16) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Display>| {
            #[cfg(feature = "h264")]
            let open_h264 = {
                let weak = weak.clone();
                OpenH264Framer::new(sched.clone(), move || {
                    if let Some(display) = weak.upgrade() {
                        if let Some(server) = display.server() {
                            server.process_update_requests();
                        }
                    }
                })
            };
            #[cfg(not(feature = "h264"))]
            let _ = weak;

            Display {
                x_pos,
                y_pos,
                resampler: Resampler::new(sched),
                refinery: Mutex::new(DamageRefinery::new()),
                #[cfg(feature = "h264")]
                open_h264,
                state: Mutex::new(DisplayState {
                    buffer: None,
                    h264_supported: false,
                }),
                server: Mutex::new(None),
            }
        })
    }

    /// Attach the display to its owning server.
    pub fn attach_server(&self, server: &Arc<dyn ServerSink>) {
        *self.server.lock() = Some(Arc::downgrade(server));
    }

    /// The owning server, while it is alive.
    pub fn server(&self) -> Option<Arc<dyn ServerSink>> {
        self.server.lock().as_ref()?.upgrade()
    }

    /// Position of this display in the server's layout.
    pub fn position(&self) -> (u16, u16) {
        (self.x_pos, self.y_pos)
    }

    /// Whether the last fed frame was eligible for the Open H.264 path.
    pub fn is_h264_supported(&self) -> bool {
        self.state.lock().h264_supported
    }

    /// The current normalised buffer, if a frame has completed the
    /// pipeline.
    pub fn current_buffer(&self) -> Option<Arc<FrameBuffer>> {
        self.state.lock().buffer.clone()
    }

    /// The Open H.264 framing for this display, read by the session
    /// layer when serving video-capable clients.
    #[cfg(feature = "h264")]
    pub fn open_h264(&self) -> &OpenH264Framer {
        &self.open_h264
    }

    /// Feed one captured frame and its damage hint into the pipeline.
    ///
    /// Returns after scheduling: the damage hint is refined against the
    /// previous frame, transformed into identity orientation, and the
    /// frame handed to the resampler. On completion the display adopts
    /// the normalised buffer and reports the damage to the server.
    /// GPU-backed identity frames are additionally fed to the video
    /// encoder. Calls for the same display must not overlap.
    pub fn feed_buffer(
        self: &Arc<Self>,
        fb: Arc<FrameBuffer>,
        damage: &Region,
    ) -> Result<(), DisplayError> {
        #[cfg(feature = "h264")]
        {
            if fb.kind() == FbKind::Gpu && fb.transform() == Transform::Normal {
                self.state.lock().h264_supported = true;
                if let Err(e) = self.open_h264.feed_frame(&fb) {
                    warn!("video path failed, clients fall back to tight: {e}");
                }
            } else {
                self.state.lock().h264_supported = false;
            }
        }

        fb.map()?;

        let refined = {
            let mut refinery = self.refinery.lock();
            refinery.resize(fb.width(), fb.height());
            refinery.refine(damage, &fb)
        };
        trace!(
            hint_rects = damage.len(),
            refined_rects = refined.len(),
            "refined frame damage"
        );

        let transformed = transform_region(&refined, fb.transform(), fb.width(), fb.height());

        let display = Arc::downgrade(self);
        self.resampler
            .feed(fb, transformed, move |fb, damage| {
                if let Some(display) = display.upgrade() {
                    display.adopt_buffer(fb, &damage);
                }
            })?;
        Ok(())
    }

    /// Resampler completion: make `fb` the current buffer and pass the
    /// damage upstream. Runs on the main context.
    fn adopt_buffer(&self, fb: Arc<FrameBuffer>, damage: &Region) {
        Scheduler::assert_main_context();

        let mut state = self.state.lock();
        if let Some(prev) = state.buffer.take() {
            prev.release();
        }
        fb.hold();
        state.buffer = Some(fb);
        drop(state);

        if let Some(server) = self.server() {
            server.damage_region(damage);
        }
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        if let Some(fb) = self.state.lock().buffer.take() {
            fb.release();
        }
    }
}
