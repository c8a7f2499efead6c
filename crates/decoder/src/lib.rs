//! `sp-decoder`: decode-unit submission and presentation pacing for hardware
//! video decoders.
//!
//! A streaming client hands encoded NAL units to a [`DecoderSession`]; the
//! session feeds them into a platform decoder through a pool of input slots
//! and releases decoded frames on a dedicated presentation thread, paced to
//! the display refresh rate.
//!
//! # Architecture
//!
//! - **SPS patching**: the H.264 SPS is rewritten per decoder family before it
//!   is cached ([`bitstream`])
//! - **Input slots**: a fixed pool with an INVALID/FREE/WORKING/QUEUING
//!   lifecycle shared by the producer and the decoder ([`input_pool`])
//! - **Parameter sets**: cached and replayed as a codec-config buffer or
//!   fused with the next picture, depending on adaptive playback ([`params`])
//! - **Pacing**: immediate or scheduled release chosen from measured decode
//!   time with hysteresis ([`pacing`])
//! - **Platform seam**: the decoder is reached only through the
//!   [`MediaCodec`] trait; [`sim::LoopbackCodec`] implements it in-process
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use sp_common::BufferType;
//! use sp_decoder::{DecoderConfig, DecoderSession, MonotonicClock};
//!
//! let mut session = DecoderSession::create(codec, Some(surface), DecoderConfig::default(),
//!     Arc::new(MonotonicClock::new()))?;
//! session.start()?;
//!
//! for unit in decode_units {
//!     let status = session.submit_decode_unit(&unit.data, unit.kind, unit.frame, unit.received_ms);
//!     if !status.is_ok() {
//!         request_idr_frame();
//!     }
//! }
//!
//! println!("{}", session.format_info("{resolution} {received_fps:.1} fps"));
//! session.release();
//! ```

pub mod bitstream;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod format;
pub mod input_pool;
pub mod output;
pub mod pacing;
pub mod params;
pub mod platform;
pub mod quirks;
pub mod session;
pub mod sim;
pub mod stats;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{DecoderConfig, PacingConfig};
pub use diagnostics::{DecoderStage, DiagnosticReport};
pub use format::FormatInfo;
pub use platform::{MediaCodec, MediaFormat, OutputBufferInfo, OutputEvent, Release, Surface};
pub use quirks::DecoderQuirks;
pub use session::{DecoderSession, SessionStats};
pub use stats::{VideoStats, VideoStatsFps};
