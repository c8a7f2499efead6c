//! Interface to the platform hardware decoder.
//!
//! The pipeline never talks to a concrete decoder API. Everything it needs is
//! expressed by [`MediaCodec`], which mirrors the buffer-index model of
//! Android's `AMediaCodec`: the decoder owns a fixed set of input and output
//! buffers, hands out their indices, and takes them back when they are queued
//! or released.
//!
//! ## Buffer ownership
//!
//! An input index returned by `dequeue_input_buffer` (or announced through
//! [`CodecCallbacks::on_input_available`]) belongs to the caller until it is
//! passed to `queue_input_buffer`. An output index belongs to the caller until
//! it is passed to `release_output_buffer`. Using an index after handing it
//! back is a protocol violation the platform does not always detect.
//!
//! ## Release deadlines
//!
//! [`Release::RenderAt`] deadlines are read from the session [`Clock`], not
//! from the platform's own monotonic clock. The session hands its clock to the
//! decoder through [`MediaCodec::attach_clock`]; an adapter whose platform
//! schedules on another clock converts with [`Release::render_delay`] and adds
//! the delay to its own `now`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sp_common::CodecError;

use crate::clock::Clock;

/// Input and output buffer flags.
pub mod flags {
    pub const KEY_FRAME: u32 = 0x01;
    pub const CODEC_CONFIG: u32 = 0x02;
    pub const END_OF_STREAM: u32 = 0x04;
}

// ---------------------------------------------------------------------------
// Media format
// ---------------------------------------------------------------------------

/// Value stored under a [`MediaFormat`] key.
#[derive(Clone, Debug, PartialEq)]
pub enum FormatValue {
    Int(i32),
    Float(f32),
    Str(String),
}

impl fmt::Display for FormatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatValue::Int(v) => write!(f, "{v}"),
            FormatValue::Float(v) => write!(f, "{v}"),
            FormatValue::Str(v) => f.write_str(v),
        }
    }
}

/// Key/value configuration handed to [`MediaCodec::configure`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaFormat {
    entries: BTreeMap<String, FormatValue>,
}

impl MediaFormat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_i32(&mut self, key: &str, value: i32) {
        self.entries.insert(key.to_string(), FormatValue::Int(value));
    }

    pub fn set_f32(&mut self, key: &str, value: f32) {
        self.entries.insert(key.to_string(), FormatValue::Float(value));
    }

    pub fn set_string(&mut self, key: &str, value: impl Into<String>) {
        self.entries
            .insert(key.to_string(), FormatValue::Str(value.into()));
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        match self.entries.get(key) {
            Some(FormatValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(FormatValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}: {value}")?;
        }
        f.write_str("}")
    }
}

// ---------------------------------------------------------------------------
// Output events
// ---------------------------------------------------------------------------

/// Metadata of a decoded output buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputBufferInfo {
    /// Platform output buffer index.
    pub index: usize,
    pub offset: usize,
    /// Payload size; zero for frames that carry nothing to render.
    pub size: usize,
    /// The timestamp the matching input was queued with.
    pub presentation_time_us: u64,
    pub flags: u32,
}

/// Result of [`MediaCodec::dequeue_output_buffer`].
#[derive(Clone, Debug, PartialEq)]
pub enum OutputEvent {
    Frame(OutputBufferInfo),
    TryAgainLater,
    FormatChanged(MediaFormat),
}

/// What to do with an output buffer when handing it back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// Return the buffer without rendering.
    Drop,
    /// Render as soon as possible.
    Render,
    /// Render once the session clock reaches `timestamp_ns`.
    RenderAt { timestamp_ns: i64 },
}

impl Release {
    pub fn renders(self) -> bool {
        !matches!(self, Release::Drop)
    }

    /// Time left until the frame should be shown, measured on `clock`.
    ///
    /// `None` for [`Release::Drop`]. Deadlines already behind `clock` give a
    /// zero delay.
    pub fn render_delay(self, clock: &dyn Clock) -> Option<Duration> {
        match self {
            Release::Drop => None,
            Release::Render => Some(Duration::ZERO),
            Release::RenderAt { timestamp_ns } => {
                let left = timestamp_ns.saturating_sub(clock.now_ns()).max(0);
                Some(Duration::from_nanos(left as u64))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Display surface the decoder renders into.
pub trait Surface: Send + Sync {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Drop the platform reference to the surface.
    fn release(&self) {}
}

/// Notifications delivered by a decoder running in callback (async) mode.
pub trait CodecCallbacks: Send + Sync {
    fn on_input_available(&self, index: usize, capacity: usize);
    fn on_output_available(&self, info: OutputBufferInfo);
    fn on_format_changed(&self, format: &MediaFormat);
    fn on_error(&self, error: &CodecError);
}

/// A hardware video decoder exposing the buffer-index protocol.
///
/// Implementations must be callable from the submission thread and the
/// presentation thread at the same time.
pub trait MediaCodec: Send + Sync {
    /// Component name, e.g. `OMX.qcom.video.decoder.avc`.
    fn name(&self) -> &str;

    /// # Errors
    /// Returns `CodecError::Configure` if the decoder rejects the format.
    fn configure(&self, format: &MediaFormat, surface: Option<&dyn Surface>)
        -> Result<(), CodecError>;

    /// Receive the clock that [`Release::RenderAt`] deadlines are read from.
    /// Called once, before `configure`.
    fn attach_clock(&self, _clock: Arc<dyn Clock>) {}

    /// Switch the decoder to callback mode. Must be called before `start`.
    ///
    /// Returns `Ok(false)` if the decoder only supports synchronous polling.
    fn set_callbacks(&self, _callbacks: Arc<dyn CodecCallbacks>) -> Result<bool, CodecError> {
        Ok(false)
    }

    fn start(&self) -> Result<(), CodecError>;

    fn stop(&self) -> Result<(), CodecError>;

    /// Free the decoder. No other method may be called afterwards.
    fn release(&self);

    /// Wait up to `timeout` for a free input buffer.
    fn dequeue_input_buffer(&self, timeout: Duration) -> Result<Option<usize>, CodecError>;

    /// Capacity in bytes of the input buffer at `index`.
    fn input_buffer_capacity(&self, index: usize) -> Result<usize, CodecError>;

    /// Copy `data` into the input buffer at `index` and queue it.
    fn queue_input_buffer(
        &self,
        index: usize,
        data: &[u8],
        timestamp_us: u64,
        flags: u32,
    ) -> Result<(), CodecError>;

    /// Wait up to `timeout` for a decoded frame or a format change.
    fn dequeue_output_buffer(&self, timeout: Duration) -> Result<OutputEvent, CodecError>;

    fn release_output_buffer(&self, index: usize, release: Release) -> Result<(), CodecError>;

    fn output_format(&self) -> Option<MediaFormat> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn media_format_accessors() {
        let mut format = MediaFormat::new();
        format.set_string("mime", "video/avc");
        format.set_i32("frame-rate", 60);
        format.set_i32("frame-rate", 120);
        assert_eq!(format.get_i32("frame-rate"), Some(120));
        assert_eq!(format.get_string("mime"), Some("video/avc"));
        assert_eq!(format.get_i32("mime"), None);
        assert_eq!(format.len(), 2);
    }

    #[test]
    fn media_format_display_is_sorted() {
        let mut format = MediaFormat::new();
        format.set_i32("width", 1920);
        format.set_string("mime", "video/avc");
        assert_eq!(format.to_string(), "{mime: video/avc, width: 1920}");
    }

    #[test]
    fn release_rendering() {
        assert!(!Release::Drop.renders());
        assert!(Release::Render.renders());
        assert!(Release::RenderAt { timestamp_ns: 5 }.renders());
    }

    #[test]
    fn render_delay_is_measured_on_the_session_clock() {
        let clock = ManualClock::new(2_000_000);
        let due = Release::RenderAt {
            timestamp_ns: 2_000_000_000 + 5_000_000,
        };
        assert_eq!(due.render_delay(&clock), Some(Duration::from_millis(5)));

        let late = Release::RenderAt {
            timestamp_ns: 1_000_000_000,
        };
        assert_eq!(late.render_delay(&clock), Some(Duration::ZERO));
        assert_eq!(Release::Render.render_delay(&clock), Some(Duration::ZERO));
        assert_eq!(Release::Drop.render_delay(&clock), None);
    }
}
