//! Per-decoder behaviour tables.
//!
//! Decoder families are matched by case-insensitive name prefix. The tables
//! decide how the SPS is patched, whether parameter sets are fused with the
//! next keyframe, and which low-latency format keys are set at configure time.

use std::fs;

use tracing::{debug, info};

use sp_common::VideoCodec;

use crate::bitstream::SpsPatchOptions;
use crate::config::DecoderConfig;
use crate::platform::MediaFormat;

/// Platform API levels the tables refer to.
pub mod sdk {
    pub const KITKAT: u32 = 19;
    pub const LOLLIPOP: u32 = 21;
    pub const M: u32 = 23;
    pub const O: u32 = 26;
    pub const R: u32 = 30;
}

const SPS_FIXUP_PREFIXES: &[&str] = &["omx.nvidia", "omx.qcom", "omx.brcm"];
const BASELINE_HACK_PREFIXES: &[&str] = &["omx.intel"];
const CONSTRAINED_HIGH_PREFIXES: &[&str] = &["omx.intel"];
const ADAPTIVE_PREFIXES: &[&str] = &["omx.nvidia", "omx.qcom", "omx.sec", "omx.TI"];
const QCOM_LOW_LATENCY_PREFIXES: &[&str] = &["omx.qcom", "c2.qti"];

/// Case-insensitive prefix match against a decoder list.
pub fn is_decoder_in_list(list: &[&str], decoder_name: &str) -> bool {
    list.iter().any(|prefix| {
        decoder_name
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

/// Whether a `/proc/cpuinfo` dump identifies an Exynos 4 SoC.
pub fn is_exynos4_cpuinfo(cpuinfo: &str) -> bool {
    let lower = cpuinfo.to_ascii_lowercase();
    lower.contains("smdk4") || lower.contains("exynos 4")
}

/// Check the running system for an Exynos 4 SoC.
pub fn detect_exynos4() -> bool {
    if let Ok(cpuinfo) = fs::read_to_string("/proc/cpuinfo") {
        if is_exynos4_cpuinfo(&cpuinfo) {
            info!("Found Exynos 4 in /proc/cpuinfo");
            return true;
        }
    }
    if let Ok(entries) = fs::read_dir("/sys/devices/system") {
        for entry in entries.flatten() {
            if entry
                .file_name()
                .to_string_lossy()
                .to_ascii_lowercase()
                .contains("exynos4")
            {
                info!("Found exynos4 in /sys/devices/system");
                return true;
            }
        }
    }
    false
}

/// Resolved behaviour switches for one decoder on one platform.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderQuirks {
    pub needs_sps_bitstream_fixup: bool,
    pub needs_baseline_sps_hack: bool,
    pub constrained_high_profile: bool,
    pub adaptive_playback: bool,
    pub qcom_low_latency: bool,
    pub exynos4: bool,
    pub sdk_level: u32,
}

impl DecoderQuirks {
    /// Evaluate the tables for `decoder_name` under `config`.
    ///
    /// When `config.exynos4` is unset the running system is checked with
    /// [`detect_exynos4`].
    pub fn detect(decoder_name: &str, config: &DecoderConfig) -> Self {
        let h264 = config.codec == VideoCodec::H264;
        let adaptive_playback = config.adaptive_playback.unwrap_or_else(|| {
            config.sdk_level >= sdk::KITKAT && is_decoder_in_list(ADAPTIVE_PREFIXES, decoder_name)
        });

        let quirks = Self {
            needs_sps_bitstream_fixup: h264
                && is_decoder_in_list(SPS_FIXUP_PREFIXES, decoder_name),
            needs_baseline_sps_hack: h264
                && is_decoder_in_list(BASELINE_HACK_PREFIXES, decoder_name),
            constrained_high_profile: h264
                && is_decoder_in_list(CONSTRAINED_HIGH_PREFIXES, decoder_name),
            adaptive_playback,
            qcom_low_latency: config.sdk_level >= sdk::O
                && is_decoder_in_list(QCOM_LOW_LATENCY_PREFIXES, decoder_name),
            exynos4: config.exynos4.unwrap_or_else(detect_exynos4),
            sdk_level: config.sdk_level,
        };

        debug!(decoder = decoder_name, ?quirks, "Resolved decoder quirks");
        quirks
    }

    /// SPS patch switches for this decoder.
    pub fn sps_patch_options(&self, config: &DecoderConfig) -> SpsPatchOptions {
        SpsPatchOptions {
            resolution: config.resolution,
            refresh_rate: config.refresh_rate,
            ref_frame_invalidation: config.ref_frame_invalidation,
            strip_vui_extensions: self.sdk_level < sdk::O,
            bitstream_restrictions: self.needs_sps_bitstream_fixup
                || self.exynos4
                || self.sdk_level >= sdk::O,
            constrained_high_profile: self.constrained_high_profile,
            baseline_hack: self.needs_baseline_sps_hack,
        }
    }

    /// Build the format handed to `configure`, including low-latency keys.
    pub fn media_format(&self, config: &DecoderConfig) -> MediaFormat {
        let mut format = MediaFormat::new();
        format.set_string("mime", config.codec.mime_type());
        format.set_i32("width", config.resolution.width as i32);
        format.set_i32("height", config.resolution.height as i32);

        if self.sdk_level >= sdk::LOLLIPOP {
            format.set_i32("frame-rate", config.frame_rate as i32);
        }

        if self.adaptive_playback && self.sdk_level >= sdk::KITKAT {
            format.set_i32("max-width", config.resolution.width as i32);
            format.set_i32("max-height", config.resolution.height as i32);
        }

        if self.sdk_level >= sdk::R && config.low_latency {
            format.set_i32("latency", 0);
        } else if self.sdk_level >= sdk::M {
            if self.qcom_low_latency {
                format.set_i32("vendor.qti-ext-dec-low-latency.enable", 1);
            }
            if config.max_operating_rate {
                format.set_i32("operating-rate", i32::from(i16::MAX));
            }
        }

        format
    }
}
