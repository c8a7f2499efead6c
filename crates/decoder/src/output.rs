//! Decoded-output queue for callback mode.
//!
//! In callback mode the decoder announces finished frames on its own thread.
//! They are parked here until the presentation thread picks one. Only the
//! earliest and the latest frame by presentation time are kept; everything in
//! between is handed back for release without rendering.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::platform::{MediaFormat, OutputBufferInfo};

/// Outcome of [`select_output`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    /// Frame to present now, if one is ready.
    pub chosen: Option<OutputBufferInfo>,
    /// Intermediate frames to release without rendering.
    pub dropped: Vec<OutputBufferInfo>,
}

/// Trim `queued` to its earliest and latest frame and pick one if ready.
///
/// The earliest frame is chosen once at least `busy_threshold` frames are
/// waiting, or as soon as anything is queued after the wait `timed_out`.
pub fn select_output(
    queued: &mut Vec<OutputBufferInfo>,
    timed_out: bool,
    busy_threshold: usize,
) -> Selection {
    let mut selection = Selection::default();
    if queued.is_empty() {
        return selection;
    }

    if queued.len() > 2 {
        let (mut min, mut max) = (0, 0);
        for (i, info) in queued.iter().enumerate() {
            if info.presentation_time_us < queued[min].presentation_time_us {
                min = i;
            }
            if info.presentation_time_us >= queued[max].presentation_time_us {
                max = i;
            }
        }
        let mut kept = Vec::with_capacity(2);
        for (i, info) in queued.drain(..).enumerate() {
            if i == min || i == max {
                kept.push(info);
            } else {
                selection.dropped.push(info);
            }
        }
        *queued = kept;
    }

    if queued.len() >= busy_threshold.max(1) || timed_out {
        let earliest = queued
            .iter()
            .enumerate()
            .min_by_key(|(_, info)| info.presentation_time_us)
            .map(|(i, _)| i);
        selection.chosen = earliest.map(|i| queued.remove(i));
    }
    selection
}

/// Result of waiting on an [`OutputQueue`].
#[derive(Clone, Debug, PartialEq)]
pub enum Dequeued {
    Frame(OutputBufferInfo),
    FormatChanged(MediaFormat),
    TimedOut,
    Closed,
}

#[derive(Default)]
struct QueueInner {
    frames: Vec<OutputBufferInfo>,
    format: Option<MediaFormat>,
    closed: bool,
}

/// Frames announced by the decoder, waiting for the presentation thread.
#[derive(Default)]
pub struct OutputQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, info: OutputBufferInfo) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.frames.push(info);
        self.ready.notify_one();
    }

    pub fn push_format(&self, format: MediaFormat) {
        let mut inner = self.inner.lock();
        inner.format = Some(format);
        self.ready.notify_one();
    }

    /// Wake the waiter and refuse further frames.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every parked frame, e.g. to release them at teardown.
    pub fn drain(&self) -> Vec<OutputBufferInfo> {
        std::mem::take(&mut self.inner.lock().frames)
    }

    /// Wait up to `timeout` for a frame to present.
    ///
    /// Frames trimmed while waiting are appended to `dropped`; the caller
    /// owns them and must release them without rendering.
    pub fn next(
        &self,
        timeout: Duration,
        busy_threshold: usize,
        dropped: &mut Vec<OutputBufferInfo>,
    ) -> Dequeued {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Dequeued::Closed;
            }
            if let Some(format) = inner.format.take() {
                return Dequeued::FormatChanged(format);
            }

            let timed_out = Instant::now() >= deadline;
            let selection = select_output(&mut inner.frames, timed_out, busy_threshold);
            dropped.extend(selection.dropped);
            if let Some(frame) = selection.chosen {
                trace!(index = frame.index, pts = frame.presentation_time_us, "Output selected");
                return Dequeued::Frame(frame);
            }
            if timed_out {
                return Dequeued::TimedOut;
            }
            self.ready.wait_until(&mut inner, deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn frame(index: usize, pts: u64) -> OutputBufferInfo {
        OutputBufferInfo {
            index,
            offset: 0,
            size: 100,
            presentation_time_us: pts,
            flags: 0,
        }
    }

    #[test]
    fn keeps_earliest_and_latest() {
        let mut queued = vec![frame(0, 30), frame(1, 10), frame(2, 20), frame(3, 40)];
        let sel = select_output(&mut queued, false, 2);
        assert_eq!(sel.chosen, Some(frame(1, 10)));
        assert_eq!(sel.dropped, vec![frame(0, 30), frame(2, 20)]);
        assert_eq!(queued, vec![frame(3, 40)]);
    }

    #[test]
    fn single_frame_waits_until_timeout() {
        let mut queued = vec![frame(5, 100)];
        assert_eq!(select_output(&mut queued, false, 2), Selection::default());
        let sel = select_output(&mut queued, true, 2);
        assert_eq!(sel.chosen, Some(frame(5, 100)));
        assert!(queued.is_empty());
    }

    #[test]
    fn empty_queue_selects_nothing() {
        let mut queued = Vec::new();
        assert_eq!(select_output(&mut queued, true, 2), Selection::default());
    }

    #[test]
    fn queue_times_out_then_closes() {
        let queue = OutputQueue::new();
        let mut dropped = Vec::new();
        assert_eq!(
            queue.next(Duration::from_millis(2), 2, &mut dropped),
            Dequeued::TimedOut
        );
        queue.close();
        queue.push(frame(0, 1));
        assert!(queue.is_empty());
        assert_eq!(queue.next(Duration::from_millis(2), 2, &mut dropped), Dequeued::Closed);
    }

    #[test]
    fn waiter_wakes_on_push() {
        let queue = Arc::new(OutputQueue::new());
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                queue.push(frame(0, 10));
                queue.push(frame(1, 20));
            })
        };
        let mut dropped = Vec::new();
        let got = queue.next(Duration::from_secs(2), 2, &mut dropped);
        producer.join().unwrap();
        assert!(matches!(got, Dequeued::Frame(f) if f.presentation_time_us == 10));
        assert!(dropped.is_empty());
    }

    #[test]
    fn format_change_is_reported_first() {
        let queue = OutputQueue::new();
        queue.push(frame(0, 10));
        queue.push(frame(1, 20));
        let mut format = MediaFormat::new();
        format.set_i32("width", 1280);
        queue.push_format(format.clone());
        let mut dropped = Vec::new();
        assert_eq!(
            queue.next(Duration::ZERO, 2, &mut dropped),
            Dequeued::FormatChanged(format)
        );
        assert!(matches!(queue.next(Duration::ZERO, 2, &mut dropped), Dequeued::Frame(_)));
    }
}
