//! Lamco VNC Core
//!
//! Display-to-encoder frame pipeline for a VNC (RFB) server. Capture
//! sources feed framebuffers into a [`display::Display`]; the pipeline
//! refines the reported damage against the previous frame, normalises
//! the orientation, and encodes updates with the RFB Tight encoding or
//! the Open H.264 encoding for delivery by the session layer above.
//!
//! This crate is the pipeline only: socket handling, the RFB handshake
//! and per-client scheduling live in the server built on top of it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod damage;
pub mod display;
pub mod fb;
pub mod pixfmt;
pub mod region;
pub mod resample;
pub mod sched;
pub mod tight;
pub mod wire;

#[cfg(feature = "h264")]
pub mod h264;
#[cfg(feature = "h264")]
pub mod open_h264;

pub use damage::DamageRefinery;
pub use display::{Display, DisplayError, ServerSink};
pub use fb::{BufferObject, FbError, FbKind, FbPool, FrameBuffer};
pub use pixfmt::{PixelFormat, RfbPixelFormat};
pub use region::{transform_region, Rect, Region, Transform};
pub use resample::Resampler;
pub use sched::Scheduler;
pub use tight::{TightEncoder, TightError, TightQuality};

#[cfg(feature = "h264")]
pub use h264::{H264Encoder, H264Error};
#[cfg(feature = "h264")]
pub use open_h264::OpenH264Framer;
