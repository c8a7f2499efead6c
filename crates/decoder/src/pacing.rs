//! Presentation pacing.
//!
//! The presentation thread pulls finished frames from the decoder and hands
//! them back with a release decision:
//!
//! - **Immediate**: render as soon as possible. Used while decoding keeps up
//!   poorly, so no extra latency is added on top of a slow decoder.
//! - **Scheduled**: render at an ideal instant that advances by one refresh
//!   interval per frame and resynchronizes when the wall clock overtakes it.
//!
//! [`ReleaseModeGovernor`] picks the mode from the measured decode time with
//! hysteresis; [`FrameScheduler`] computes the release for each frame.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::output::Dequeued;
use crate::platform::{OutputBufferInfo, OutputEvent, Release};
use crate::session::Shared;

// ---------------------------------------------------------------------------
// Release mode
// ---------------------------------------------------------------------------

/// Switches between immediate and scheduled release.
///
/// Scheduled release is only entered after decode time has stayed under the
/// refresh budget for `refresh_rate * hysteresis_seconds` consecutive
/// observations. A single observation over budget switches back immediately.
#[derive(Clone, Debug)]
pub struct ReleaseModeGovernor {
    immediate: bool,
    count: u32,
    hysteresis_seconds: u32,
    transitions: u32,
}

impl ReleaseModeGovernor {
    pub fn new(hysteresis_seconds: u32) -> Self {
        Self {
            immediate: true,
            count: 0,
            hysteresis_seconds,
            transitions: 0,
        }
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    /// Number of mode switches so far.
    pub fn transitions(&self) -> u32 {
        self.transitions
    }

    /// Feed one decode-time sample and return the resulting mode.
    ///
    /// `None` (nothing measured yet) leaves the mode untouched.
    pub fn observe(&mut self, avg_decode_ms: Option<f32>, refresh_rate: u32) -> bool {
        let Some(avg) = avg_decode_ms else {
            return self.immediate;
        };
        let budget_ms = 1_000.0 / refresh_rate.max(1) as f32;

        if avg < budget_ms {
            let count = self.count;
            self.count = self.count.saturating_add(1);
            if count > refresh_rate.saturating_mul(self.hysteresis_seconds) {
                self.set_immediate(false, avg, budget_ms);
                self.count = 0;
            }
        } else {
            self.set_immediate(true, avg, budget_ms);
            self.count = 0;
        }
        self.immediate
    }

    fn set_immediate(&mut self, immediate: bool, avg: f32, budget_ms: f32) {
        if self.immediate != immediate {
            self.transitions += 1;
            info!(
                mode = if immediate { "immediate" } else { "scheduled" },
                avg_decode_ms = avg,
                budget_ms,
                "Release mode changed"
            );
        }
        self.immediate = immediate;
    }
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Computes the release decision for each presented frame.
#[derive(Clone, Debug)]
pub struct FrameScheduler {
    interval_ns: i64,
    anchor_ns: Option<i64>,
    index: u32,
    last_immediate: bool,
}

impl FrameScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ns: interval.as_nanos() as i64,
            anchor_ns: None,
            index: 0,
            last_immediate: true,
        }
    }

    /// Start of the current scheduling phase.
    pub fn anchor_ns(&self) -> Option<i64> {
        self.anchor_ns
    }

    /// Frames scheduled since the phase anchor.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Decide how to release a frame of `size` bytes at `now_ns`.
    pub fn next(&mut self, now_ns: i64, immediate: bool, size: usize) -> Release {
        let mut anchor = *self.anchor_ns.get_or_insert(now_ns);

        if immediate != self.last_immediate {
            debug!(immediate, "Release mode changed, resetting phase");
            self.index = 0;
            anchor = now_ns;
        }
        self.last_immediate = immediate;

        if now_ns > self.deadline(anchor) {
            self.index = 0;
            anchor = now_ns;
        }
        let deadline = self.deadline(anchor);
        self.index += 1;
        self.anchor_ns = Some(anchor);

        if immediate {
            if size == 0 {
                Release::Drop
            } else {
                Release::Render
            }
        } else {
            Release::RenderAt {
                timestamp_ns: deadline,
            }
        }
    }

    fn deadline(&self, anchor: i64) -> i64 {
        anchor + i64::from(self.index + 1) * self.interval_ns
    }
}

// ---------------------------------------------------------------------------
// Presentation thread
// ---------------------------------------------------------------------------

/// Body of the presentation thread. Runs until the session stops, then
/// invokes the registered teardown.
pub(crate) fn presentation_loop(shared: Arc<Shared>) {
    let interval = shared.config.frame_interval();
    let pacing = &shared.config.pacing;
    let mut scheduler = FrameScheduler::new(interval);
    let mut dropped = Vec::new();

    info!(
        decoder = shared.codec.name(),
        interval_us = interval.as_micros() as u64,
        callback_mode = shared.outputs.is_some(),
        "Presentation thread started"
    );

    while !shared.is_stopping() {
        let event = match &shared.outputs {
            Some(queue) => {
                let wait = interval.saturating_sub(Duration::from_micros(pacing.output_margin_us));
                let event = match queue.next(wait, pacing.busy_threshold, &mut dropped) {
                    Dequeued::Frame(info) => Ok(OutputEvent::Frame(info)),
                    Dequeued::FormatChanged(format) => Ok(OutputEvent::FormatChanged(format)),
                    Dequeued::TimedOut => Ok(OutputEvent::TryAgainLater),
                    Dequeued::Closed => break,
                };
                for info in dropped.drain(..) {
                    discard(&shared, info);
                }
                event
            }
            None => shared.codec.dequeue_output_buffer(interval),
        };

        match event {
            Ok(OutputEvent::Frame(info)) => {
                if shared.outputs.is_none() && shared.state.lock().governor.is_immediate() {
                    drain_extra_outputs(&shared);
                }
                present(&shared, &mut scheduler, info);
            }
            Ok(OutputEvent::TryAgainLater) => {
                trace!("No output ready");
            }
            Ok(OutputEvent::FormatChanged(format)) => shared.on_output_format(format),
            Err(e) => {
                warn!(error = %e, "Output dequeue failed");
                shared.state.lock().last_error = Some(e);
                thread::sleep(pacing.acquire_poll());
            }
        }
    }

    debug!("Presentation thread exiting");
    shared.run_teardown();
}

fn present(shared: &Shared, scheduler: &mut FrameScheduler, info: OutputBufferInfo) {
    let immediate = shared.state.lock().governor.is_immediate();
    let release = scheduler.next(shared.clock.now_ns(), immediate, info.size);

    if let Err(e) = shared.codec.release_output_buffer(info.index, release) {
        warn!(index = info.index, error = %e, "Output release failed");
        return;
    }

    let now_us = shared.clock.now_us();
    let mut state = shared.state.lock();
    state.stats.record_rendered(now_us, info.presentation_time_us);
    state.stages.frames_out += 1;
    trace!(
        index = info.index,
        pts = info.presentation_time_us,
        ?release,
        "Frame released"
    );
}

fn discard(shared: &Shared, info: OutputBufferInfo) {
    trace!(index = info.index, pts = info.presentation_time_us, "Dropping stale output");
    if let Err(e) = shared.codec.release_output_buffer(info.index, Release::Drop) {
        warn!(index = info.index, error = %e, "Output release failed");
    }
}

/// In immediate mode, throw away anything that queued up behind the frame
/// just dequeued.
fn drain_extra_outputs(shared: &Shared) {
    loop {
        match shared.codec.dequeue_output_buffer(Duration::ZERO) {
            Ok(OutputEvent::Frame(extra)) => discard(shared, extra),
            Ok(OutputEvent::FormatChanged(format)) => shared.on_output_format(format),
            Ok(OutputEvent::TryAgainLater) | Err(_) => break,
        }
    }
}
