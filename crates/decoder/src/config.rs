//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use sp_common::{DecodeError, Resolution, VideoCodec};

/// Number of input slots tracked by the pool.
pub const DEFAULT_INPUT_SLOTS: usize = 20;

/// Configuration for a [`DecoderSession`](crate::DecoderSession).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub codec: VideoCodec,
    /// Initial stream resolution.
    pub resolution: Resolution,
    /// Display refresh rate in Hz. Drives the output poll interval.
    pub refresh_rate: u32,
    /// Stream frame rate requested by the user, used for the `frame-rate` key.
    pub frame_rate: u32,
    /// Platform API level the quirk tables are evaluated against.
    pub sdk_level: u32,
    /// Reference frame invalidation is in use for this stream.
    pub ref_frame_invalidation: bool,
    /// Force adaptive playback on or off; `None` uses the decoder allow-list.
    pub adaptive_playback: Option<bool>,
    /// Running on an Exynos 4 board; `None` reads `/proc/cpuinfo` and sysfs.
    pub exynos4: Option<bool>,
    pub low_latency: bool,
    pub max_operating_rate: bool,
    /// Drive the decoder through callbacks instead of polling.
    pub callback_mode: bool,
    pub input_slots: usize,
    pub pacing: PacingConfig,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            resolution: Resolution::FHD,
            refresh_rate: 60,
            frame_rate: 60,
            sdk_level: 30,
            ref_frame_invalidation: false,
            adaptive_playback: None,
            exynos4: None,
            low_latency: true,
            max_operating_rate: true,
            callback_mode: false,
            input_slots: DEFAULT_INPUT_SLOTS,
            pacing: PacingConfig::default(),
        }
    }
}

impl DecoderConfig {
    /// # Errors
    /// Returns `DecodeError::InvalidConfig` for zero-sized geometry, a zero
    /// refresh rate, or an empty input pool.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(DecodeError::InvalidConfig(format!(
                "resolution {} has a zero dimension",
                self.resolution
            )));
        }
        if self.refresh_rate == 0 {
            return Err(DecodeError::InvalidConfig("refresh rate is zero".into()));
        }
        if self.input_slots == 0 {
            return Err(DecodeError::InvalidConfig("input pool has no slots".into()));
        }
        Ok(())
    }

    /// One refresh interval.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.refresh_rate.max(1)))
    }
}

/// Tunables for output pacing and input acquisition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Seconds of on-budget decoding before switching to scheduled release.
    pub hysteresis_seconds: u32,
    /// Queued outputs that trigger an early release in callback mode.
    pub busy_threshold: usize,
    /// Slack subtracted from the output wait in callback mode.
    pub output_margin_us: u64,
    /// Wake-up interval while waiting for a free input slot.
    pub acquire_poll_ms: u64,
    /// Give up on an input slot after this long and ask for a keyframe.
    pub acquire_timeout_ms: u64,
    /// Input dequeues slower than this are logged.
    pub slow_dequeue_warn_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            hysteresis_seconds: 3,
            busy_threshold: 2,
            output_margin_us: 1_000,
            acquire_poll_ms: 1,
            acquire_timeout_ms: 1_000,
            slow_dequeue_warn_ms: 20,
        }
    }
}

impl PacingConfig {
    pub fn acquire_poll(&self) -> Duration {
        Duration::from_millis(self.acquire_poll_ms.max(1))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DecoderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.input_slots, 20);
        assert_eq!(config.frame_interval(), Duration::from_micros(16_666));
    }

    #[test]
    fn rejects_zero_refresh() {
        let config = DecoderConfig {
            refresh_rate: 0,
            ..DecoderConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("refresh rate"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: DecoderConfig = serde_json::from_str(
            r#"{ "refresh_rate": 120, "resolution": { "width": 1280, "height": 720 },
                 "pacing": { "hysteresis_seconds": 5 } }"#,
        )
        .unwrap();
        assert_eq!(config.refresh_rate, 120);
        assert_eq!(config.resolution, Resolution::HD);
        assert_eq!(config.pacing.hysteresis_seconds, 5);
        assert_eq!(config.pacing.busy_threshold, 2);
        assert_eq!(config.codec, VideoCodec::H264);
    }
}
