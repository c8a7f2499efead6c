//! Failure diagnostics.
//!
//! When a decoder misbehaves, the most useful fact is how far the stream got
//! before it did. [`DecoderStage`] classifies that from the parameter-set and
//! frame counters; [`DiagnosticReport`] bundles it with the session's
//! configuration and lifetime stats into one log line.

use std::fmt;

use serde::Serialize;

use sp_common::{Resolution, VideoCodec};

use crate::stats::VideoStats;

/// Delimiter between report fields.
pub const DELIMITER: &str = " | ";

/// Counters that locate a failure in the stream lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StageCounters {
    pub vps_in: u64,
    pub sps_in: u64,
    pub pps_in: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub output_format_seen: bool,
}

/// How far the stream progressed before a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DecoderStage {
    PreSps,
    PrePps,
    PreIFrame,
    PreOutputConfig,
    PreOutput,
    EarlyOutput,
    WhileStreaming,
}

impl DecoderStage {
    /// Classify from counters. Output counts up to `refresh_rate * 30`
    /// (about thirty seconds) are still treated as early.
    pub fn classify(counters: &StageCounters, refresh_rate: u32) -> Self {
        if counters.vps_in == 0 && counters.sps_in == 0 && counters.pps_in == 0 {
            DecoderStage::PreSps
        } else if counters.sps_in > 0 && counters.pps_in == 0 {
            DecoderStage::PrePps
        } else if counters.pps_in > 0 && counters.frames_in == 0 {
            DecoderStage::PreIFrame
        } else if counters.frames_in > 0 && !counters.output_format_seen {
            DecoderStage::PreOutputConfig
        } else if counters.output_format_seen && counters.frames_out == 0 {
            DecoderStage::PreOutput
        } else if counters.frames_out <= u64::from(refresh_rate) * 30 {
            DecoderStage::EarlyOutput
        } else {
            DecoderStage::WhileStreaming
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DecoderStage::PreSps => "PreSPSError",
            DecoderStage::PrePps => "PrePPSError",
            DecoderStage::PreIFrame => "PreIFrameError",
            DecoderStage::PreOutputConfig => "PreOutputConfigError",
            DecoderStage::PreOutput => "PreOutputError",
            DecoderStage::EarlyOutput => "EarlyOutputError",
            DecoderStage::WhileStreaming => "ErrorWhileStreaming",
        }
    }
}

impl fmt::Display for DecoderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a session for error reports.
#[derive(Clone, Debug, Serialize)]
pub struct DiagnosticReport {
    pub stage: DecoderStage,
    pub codec: VideoCodec,
    pub decoder: String,
    pub configured_format: String,
    pub output_format: Option<String>,
    pub adaptive_playback: bool,
    pub ref_frame_invalidation: bool,
    pub modern_sps_patching: bool,
    pub resolution: Resolution,
    pub refresh_rate: u32,
    pub counters: StageCounters,
    pub global: VideoStats,
    pub immediate_release: bool,
    pub last_error: Option<String>,
}

impl DiagnosticReport {
    /// Mean receive-to-present latency over the session.
    pub fn average_end_to_end_latency_ms(&self) -> u64 {
        if self.global.received == 0 {
            return 0;
        }
        self.global.total_time_ms / self.global.received
    }

    /// Mean decoder latency over the session.
    pub fn average_decoder_latency_ms(&self) -> u64 {
        if self.global.received == 0 {
            return 0;
        }
        self.global.decoder_time_ms / self.global.received
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = DELIMITER;
        write!(f, "{}{d}", self.stage)?;
        write!(f, "Codec: {}{d}", self.codec)?;
        write!(f, "Decoder: {}{d}", self.decoder)?;
        write!(f, "Configured format: {}{d}", self.configured_format)?;
        write!(
            f,
            "Output format: {}{d}",
            self.output_format.as_deref().unwrap_or("(none)")
        )?;
        write!(f, "Adaptive playback: {}{d}", self.adaptive_playback)?;
        write!(f, "RFI active: {}{d}", self.ref_frame_invalidation)?;
        write!(f, "Using modern SPS patching: {}{d}", self.modern_sps_patching)?;
        write!(f, "Fused IDR frames: {}{d}", self.adaptive_playback)?;
        write!(f, "Video dimensions: {}{d}", self.resolution)?;
        write!(f, "FPS target: {}{d}", self.refresh_rate)?;
        let c = &self.counters;
        write!(f, "CSD stats: {}, {}, {}{d}", c.vps_in, c.sps_in, c.pps_in)?;
        write!(f, "Frames in-out: {}, {}{d}", c.frames_in, c.frames_out)?;
        write!(f, "Total frames received: {}{d}", self.global.received)?;
        write!(f, "Total frames rendered: {}{d}", self.global.rendered)?;
        write!(
            f,
            "Frame losses: {} in {} loss events{d}",
            self.global.frames_lost, self.global.loss_events
        )?;
        write!(
            f,
            "Average end-to-end client latency: {}ms{d}",
            self.average_end_to_end_latency_ms()
        )?;
        write!(
            f,
            "Average hardware decoder latency: {}ms{d}",
            self.average_decoder_latency_ms()
        )?;
        write!(
            f,
            "Frame pacing mode: {}",
            if self.immediate_release { "immediate" } else { "scheduled" }
        )?;
        if let Some(error) = &self.last_error {
            write!(f, "{d}Last error: {error}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters() -> StageCounters {
        StageCounters::default()
    }

    #[test]
    fn stage_progression() {
        let mut c = counters();
        assert_eq!(DecoderStage::classify(&c, 60), DecoderStage::PreSps);
        c.sps_in = 1;
        assert_eq!(DecoderStage::classify(&c, 60), DecoderStage::PrePps);
        c.pps_in = 1;
        assert_eq!(DecoderStage::classify(&c, 60), DecoderStage::PreIFrame);
        c.frames_in = 10;
        assert_eq!(DecoderStage::classify(&c, 60), DecoderStage::PreOutputConfig);
        c.output_format_seen = true;
        assert_eq!(DecoderStage::classify(&c, 60), DecoderStage::PreOutput);
        c.frames_out = 1_800;
        assert_eq!(DecoderStage::classify(&c, 60), DecoderStage::EarlyOutput);
        c.frames_out = 1_801;
        assert_eq!(DecoderStage::classify(&c, 60), DecoderStage::WhileStreaming);
    }

    #[test]
    fn vps_alone_is_past_pre_sps() {
        let c = StageCounters {
            vps_in: 1,
            ..counters()
        };
        // No SPS and no PPS, but a VPS arrived: falls through to the output checks.
        assert_eq!(DecoderStage::classify(&c, 60), DecoderStage::EarlyOutput);
    }

    #[test]
    fn report_formatting() {
        let report = DiagnosticReport {
            stage: DecoderStage::PreOutput,
            codec: VideoCodec::H264,
            decoder: "OMX.qcom.video.decoder.avc".into(),
            configured_format: "{mime: video/avc}".into(),
            output_format: None,
            adaptive_playback: true,
            ref_frame_invalidation: false,
            modern_sps_patching: true,
            resolution: Resolution::HD,
            refresh_rate: 60,
            counters: StageCounters {
                sps_in: 1,
                pps_in: 1,
                frames_in: 3,
                ..counters()
            },
            global: VideoStats {
                received: 4,
                total_time_ms: 42,
                decoder_time_ms: 10,
                ..VideoStats::default()
            },
            immediate_release: true,
            last_error: Some("boom".into()),
        };
        let text = report.to_string();
        assert!(text.starts_with("PreOutputError | Codec: H.264 | "));
        assert!(text.contains("CSD stats: 0, 1, 1 | "));
        assert!(text.contains("Output format: (none) | "));
        assert!(text.contains("Average end-to-end client latency: 10ms"));
        assert!(text.contains("Average hardware decoder latency: 2ms"));
        assert!(text.ends_with("Last error: boom"));
    }

    #[test]
    fn latency_is_zero_without_frames() {
        let report = DiagnosticReport {
            stage: DecoderStage::PreSps,
            codec: VideoCodec::H264,
            decoder: String::new(),
            configured_format: String::new(),
            output_format: None,
            adaptive_playback: false,
            ref_frame_invalidation: false,
            modern_sps_patching: false,
            resolution: Resolution::FHD,
            refresh_rate: 60,
            counters: counters(),
            global: VideoStats::default(),
            immediate_release: true,
            last_error: None,
        };
        assert_eq!(report.average_end_to_end_latency_ms(), 0);
        assert_eq!(report.average_decoder_latency_ms(), 0);
        assert!(report.to_string().ends_with("Frame pacing mode: immediate"));
    }
}
