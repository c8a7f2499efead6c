//! Rolling video statistics.
//!
//! Three [`VideoStats`] instances are kept per session: the live window being
//! accumulated, the most recently closed window, and lifetime totals. The
//! live window closes roughly once per second; on close it is folded into the
//! lifetime totals and copied into the "last" slot before being cleared.

use serde::Serialize;
use tracing::{debug, trace};

/// Length of one stats window.
pub const WINDOW_MS: u64 = 1_000;

/// Decode-time deltas at or above this are treated as measurement noise.
pub const MAX_PLAUSIBLE_DELTA_MS: u64 = 1_000;

/// Counters for one measurement window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VideoStats {
    pub decoder_time_ms: u64,
    pub total_time_ms: u64,
    pub total_frames: u64,
    pub received: u64,
    pub rendered: u64,
    pub loss_events: u64,
    pub frames_lost: u64,
    pub measurement_start_ms: Option<u64>,
}

/// Frame rates derived from a [`VideoStats`] window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct VideoStatsFps {
    pub total_fps: f32,
    pub received_fps: f32,
    pub rendered_fps: f32,
}

impl VideoStats {
    /// Accumulate `other` into `self`, keeping the earliest start time.
    pub fn add(&mut self, other: &VideoStats) {
        self.decoder_time_ms += other.decoder_time_ms;
        self.total_time_ms += other.total_time_ms;
        self.total_frames += other.total_frames;
        self.received += other.received;
        self.rendered += other.rendered;
        self.loss_events += other.loss_events;
        self.frames_lost += other.frames_lost;
        if self.measurement_start_ms.is_none() {
            self.measurement_start_ms = other.measurement_start_ms;
        }
    }

    pub fn clear(&mut self) {
        *self = VideoStats::default();
    }

    /// Rates over the time elapsed since the window started.
    ///
    /// Zero elapsed time (or no start time) yields zero rates.
    pub fn fps(&self, now_ms: u64) -> VideoStatsFps {
        let Some(start) = self.measurement_start_ms else {
            return VideoStatsFps::default();
        };
        let elapsed = now_ms.saturating_sub(start) as f32 / 1_000.0;
        if elapsed <= 0.0 {
            return VideoStatsFps::default();
        }
        VideoStatsFps {
            total_fps: self.total_frames as f32 / elapsed,
            received_fps: self.received as f32 / elapsed,
            rendered_fps: self.rendered as f32 / elapsed,
        }
    }

    /// Mean decoder latency per received frame.
    pub fn avg_decode_ms(&self) -> Option<f32> {
        (self.received > 0).then(|| self.decoder_time_ms as f32 / self.received as f32)
    }

    /// Mean end-to-end latency per received frame.
    pub fn avg_total_ms(&self) -> Option<f32> {
        (self.received > 0).then(|| self.total_time_ms as f32 / self.received as f32)
    }

    pub fn loss_percent(&self) -> f32 {
        if self.total_frames == 0 {
            return 0.0;
        }
        self.frames_lost as f32 / self.total_frames as f32 * 100.0
    }
}

/// Live, last and lifetime windows plus frame-number loss tracking.
#[derive(Clone, Debug, Default)]
pub struct StatsWindows {
    pub active: VideoStats,
    pub last: VideoStats,
    pub global: VideoStats,
    last_frame_number: u32,
}

impl StatsWindows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_frame_number(&self) -> u32 {
        self.last_frame_number
    }

    /// Check `frame_number` against the previous one and account for gaps.
    ///
    /// Repeats of the previous number are expected (an IDR frame arrives as
    /// several frame-start NALs sharing one number) and are not losses.
    pub fn record_frame_number(&mut self, frame_number: u32, now_ms: u64) {
        let last = self.last_frame_number;
        if last == 0 {
            self.active.measurement_start_ms = Some(now_ms);
        } else if frame_number != last && frame_number != last.wrapping_add(1) {
            if frame_number > last {
                let gap = u64::from(frame_number - last - 1);
                self.active.frames_lost += gap;
                self.active.total_frames += gap;
                self.active.loss_events += 1;
                debug!(last, frame_number, lost = gap, "Frame loss detected");
            } else {
                debug!(last, frame_number, "Frame number went backwards");
            }
        }
        self.last_frame_number = frame_number;
    }

    /// Close the live window once [`WINDOW_MS`] have passed since it opened.
    pub fn roll_if_due(&mut self, now_ms: u64) -> bool {
        match self.active.measurement_start_ms {
            None => {
                self.active.measurement_start_ms = Some(now_ms);
                false
            }
            Some(start) if now_ms >= start + WINDOW_MS => {
                self.global.add(&self.active);
                self.last = self.active;
                self.active.clear();
                self.active.measurement_start_ms = Some(now_ms);
                trace!(
                    received = self.last.received,
                    rendered = self.last.rendered,
                    "Stats window closed"
                );
                true
            }
            Some(_) => false,
        }
    }

    /// Count one received picture and its receive-to-submit time.
    pub fn record_received(&mut self, now_ms: u64, receive_time_ms: u64) {
        self.active.received += 1;
        self.active.total_frames += 1;
        self.active.total_time_ms += now_ms.saturating_sub(receive_time_ms);
    }

    /// Count one released frame and fold in its decode latency if plausible.
    pub fn record_rendered(&mut self, now_us: u64, presentation_time_us: u64) {
        self.active.rendered += 1;
        if now_us < presentation_time_us {
            return;
        }
        let delta_ms = (now_us - presentation_time_us) / 1_000;
        if delta_ms < MAX_PLAUSIBLE_DELTA_MS {
            self.active.decoder_time_ms += delta_ms;
            self.active.total_time_ms += delta_ms;
        }
    }

    /// Last closed window plus the live one.
    pub fn last_two(&self) -> VideoStats {
        let mut combined = VideoStats::default();
        combined.add(&self.last);
        combined.add(&self.active);
        combined
    }
}
