//! In-process loopback decoder.
//!
//! [`LoopbackCodec`] implements [`MediaCodec`] without any hardware: every
//! queued input is recorded, and every non-config input comes straight back
//! as an output frame carrying the input's timestamp and size. The first
//! picture is preceded by an output format change, as a real decoder does.
//!
//! In polling mode outputs travel over a crossbeam channel drained by
//! `dequeue_output_buffer`. Once callbacks are registered, input buffers are
//! announced through `on_input_available` and outputs through
//! `on_output_available` instead.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use sp_common::CodecError;

use crate::clock::Clock;
use crate::platform::{
    flags, CodecCallbacks, MediaCodec, MediaFormat, OutputBufferInfo, OutputEvent, Release, Surface,
};

/// One buffer handed to [`MediaCodec::queue_input_buffer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedInput {
    pub index: usize,
    pub data: Vec<u8>,
    pub timestamp_us: u64,
    pub flags: u32,
}

impl QueuedInput {
    pub fn is_config(&self) -> bool {
        self.flags & flags::CODEC_CONFIG != 0
    }
}

#[derive(Default)]
struct LoopbackState {
    configured: Option<MediaFormat>,
    started: bool,
    released: bool,
    free_inputs: VecDeque<usize>,
    outstanding_inputs: HashSet<usize>,
    outstanding_outputs: HashSet<usize>,
    next_output: usize,
    format_announced: bool,
    queued: Vec<QueuedInput>,
    releases: Vec<(usize, Release)>,
}

/// Software stand-in for a hardware decoder.
pub struct LoopbackCodec {
    name: String,
    input_buffers: usize,
    capacity: usize,
    configure_error: Option<String>,
    polling_only: bool,
    state: Mutex<LoopbackState>,
    input_ready: Condvar,
    callbacks: Mutex<Option<Arc<dyn CodecCallbacks>>>,
    clock: Mutex<Option<Arc<dyn Clock>>>,
    outputs_tx: Sender<OutputEvent>,
    outputs_rx: Receiver<OutputEvent>,
}

impl std::fmt::Debug for LoopbackCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackCodec")
            .field("name", &self.name)
            .field("input_buffers", &self.input_buffers)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl LoopbackCodec {
    /// # Arguments
    /// * `name` - Component name reported to the quirk tables.
    /// * `input_buffers` - Number of native input buffers.
    /// * `capacity` - Size of each input buffer in bytes.
    pub fn new(name: &str, input_buffers: usize, capacity: usize) -> Self {
        let (outputs_tx, outputs_rx) = channel::unbounded();
        let state = LoopbackState {
            free_inputs: (0..input_buffers).collect(),
            ..LoopbackState::default()
        };
        Self {
            name: name.to_string(),
            input_buffers,
            capacity,
            configure_error: None,
            polling_only: false,
            state: Mutex::new(state),
            input_ready: Condvar::new(),
            callbacks: Mutex::new(None),
            clock: Mutex::new(None),
            outputs_tx,
            outputs_rx,
        }
    }

    /// Make `configure` fail with `reason`.
    pub fn with_configure_error(mut self, reason: &str) -> Self {
        self.configure_error = Some(reason.to_string());
        self
    }

    /// Refuse callback registration.
    pub fn polling_only(mut self) -> Self {
        self.polling_only = true;
        self
    }

    /// Every buffer queued so far, in queue order.
    pub fn queued_inputs(&self) -> Vec<QueuedInput> {
        self.state.lock().queued.clone()
    }

    /// Every output release so far, in release order.
    pub fn releases(&self) -> Vec<(usize, Release)> {
        self.state.lock().releases.clone()
    }

    pub fn configured_format(&self) -> Option<MediaFormat> {
        self.state.lock().configured.clone()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    /// Time left until `release` is due on the attached clock. `None` for
    /// drops or when no clock has been attached.
    pub fn render_delay(&self, release: Release) -> Option<Duration> {
        let clock = self.clock.lock().clone()?;
        release.render_delay(clock.as_ref())
    }

    fn callbacks(&self) -> Option<Arc<dyn CodecCallbacks>> {
        self.callbacks.lock().clone()
    }

    fn check_live(state: &LoopbackState) -> Result<(), CodecError> {
        if state.released {
            return Err(CodecError::Released);
        }
        Ok(())
    }

    fn decoded_format(&self, configured: Option<&MediaFormat>) -> MediaFormat {
        let mut format = MediaFormat::new();
        if let Some(configured) = configured {
            for key in ["mime", "width", "height"] {
                if let Some(v) = configured.get_i32(key) {
                    format.set_i32(key, v);
                } else if let Some(v) = configured.get_string(key) {
                    format.set_string(key, v);
                }
            }
        }
        format.set_i32("color-format", 0x7F00_0789);
        format
    }
}

impl MediaCodec for LoopbackCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, format: &MediaFormat, surface: Option<&dyn Surface>) -> Result<(), CodecError> {
        let mut state = self.state.lock();
        Self::check_live(&state)?;
        if let Some(reason) = &self.configure_error {
            return Err(CodecError::Configure(reason.clone()));
        }
        debug!(
            decoder = %self.name,
            format = %format,
            surface = surface.map(|s| s.describe()).unwrap_or_default(),
            "Loopback decoder configured"
        );
        state.configured = Some(format.clone());
        Ok(())
    }

    fn attach_clock(&self, clock: Arc<dyn Clock>) {
        *self.clock.lock() = Some(clock);
    }

    fn set_callbacks(&self, callbacks: Arc<dyn CodecCallbacks>) -> Result<bool, CodecError> {
        if self.polling_only {
            return Ok(false);
        }
        Self::check_live(&self.state.lock())?;
        *self.callbacks.lock() = Some(callbacks);
        Ok(true)
    }

    fn start(&self) -> Result<(), CodecError> {
        let announce: Vec<usize> = {
            let mut state = self.state.lock();
            Self::check_live(&state)?;
            state.started = true;
            if self.callbacks.lock().is_some() {
                let free: Vec<usize> = state.free_inputs.drain(..).collect();
                state.outstanding_inputs.extend(free.iter().copied());
                free
            } else {
                Vec::new()
            }
        };
        if let Some(callbacks) = self.callbacks() {
            for index in announce {
                callbacks.on_input_available(index, self.capacity);
            }
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), CodecError> {
        let mut state = self.state.lock();
        Self::check_live(&state)?;
        state.started = false;
        Ok(())
    }

    fn release(&self) {
        self.state.lock().released = true;
        self.callbacks.lock().take();
        self.input_ready.notify_all();
    }

    fn dequeue_input_buffer(&self, timeout: Duration) -> Result<Option<usize>, CodecError> {
        if self.callbacks.lock().is_some() {
            return Err(CodecError::DequeueInput("decoder is in callback mode".into()));
        }
        let mut state = self.state.lock();
        Self::check_live(&state)?;
        if !state.started {
            return Err(CodecError::DequeueInput("decoder not started".into()));
        }
        if state.free_inputs.is_empty() {
            self.input_ready.wait_for(&mut state, timeout);
        }
        let index = state.free_inputs.pop_front();
        if let Some(index) = index {
            state.outstanding_inputs.insert(index);
        }
        Ok(index)
    }

    fn input_buffer_capacity(&self, index: usize) -> Result<usize, CodecError> {
        if index >= self.input_buffers {
            return Err(CodecError::InvalidIndex(index));
        }
        Ok(self.capacity)
    }

    fn queue_input_buffer(
        &self,
        index: usize,
        data: &[u8],
        timestamp_us: u64,
        buffer_flags: u32,
    ) -> Result<(), CodecError> {
        let callbacks = self.callbacks();
        let mut events = Vec::with_capacity(2);
        {
            let mut state = self.state.lock();
            Self::check_live(&state)?;
            if !state.outstanding_inputs.remove(&index) {
                return Err(CodecError::InvalidIndex(index));
            }
            if data.len() > self.capacity {
                state.outstanding_inputs.insert(index);
                return Err(CodecError::QueueInput {
                    index,
                    reason: format!("{} bytes exceed capacity {}", data.len(), self.capacity),
                });
            }

            state.queued.push(QueuedInput {
                index,
                data: data.to_vec(),
                timestamp_us,
                flags: buffer_flags,
            });
            trace!(index, len = data.len(), timestamp_us, flags = buffer_flags, "Loopback input");

            if buffer_flags & flags::CODEC_CONFIG == 0 {
                if !state.format_announced {
                    state.format_announced = true;
                    events.push(OutputEvent::FormatChanged(
                        self.decoded_format(state.configured.as_ref()),
                    ));
                }
                let output = state.next_output;
                state.next_output += 1;
                state.outstanding_outputs.insert(output);
                events.push(OutputEvent::Frame(OutputBufferInfo {
                    index: output,
                    offset: 0,
                    size: data.len(),
                    presentation_time_us: timestamp_us,
                    flags: buffer_flags,
                }));
            }

            if callbacks.is_some() {
                state.outstanding_inputs.insert(index);
            } else {
                state.free_inputs.push_back(index);
                self.input_ready.notify_one();
            }
        }

        match callbacks {
            Some(callbacks) => {
                for event in events {
                    match event {
                        OutputEvent::Frame(info) => callbacks.on_output_available(info),
                        OutputEvent::FormatChanged(format) => callbacks.on_format_changed(&format),
                        OutputEvent::TryAgainLater => {}
                    }
                }
                callbacks.on_input_available(index, self.capacity);
            }
            None => {
                for event in events {
                    let _ = self.outputs_tx.send(event);
                }
            }
        }
        Ok(())
    }

    fn dequeue_output_buffer(&self, timeout: Duration) -> Result<OutputEvent, CodecError> {
        Self::check_live(&self.state.lock())?;
        match self.outputs_rx.recv_timeout(timeout) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => Ok(OutputEvent::TryAgainLater),
            Err(RecvTimeoutError::Disconnected) => Err(CodecError::Released),
        }
    }

    fn release_output_buffer(&self, index: usize, release: Release) -> Result<(), CodecError> {
        let mut state = self.state.lock();
        Self::check_live(&state)?;
        if !state.outstanding_outputs.remove(&index) {
            return Err(CodecError::ReleaseOutput {
                index,
                reason: "buffer not owned by client".into(),
            });
        }
        trace!(index, ?release, delay = ?self.render_delay(release), "Loopback output released");
        state.releases.push((index, release));
        Ok(())
    }

    fn output_format(&self) -> Option<MediaFormat> {
        let state = self.state.lock();
        state
            .format_announced
            .then(|| self.decoded_format(state.configured.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polling_round_trip() {
        let codec = LoopbackCodec::new("c2.loopback.avc", 2, 64);
        codec.configure(&MediaFormat::new(), None).unwrap();
        codec.start().unwrap();

        let input = codec.dequeue_input_buffer(Duration::ZERO).unwrap().unwrap();
        codec
            .queue_input_buffer(input, &[0, 0, 0, 1, 0x67], 10, flags::CODEC_CONFIG)
            .unwrap();
        let input = codec.dequeue_input_buffer(Duration::ZERO).unwrap().unwrap();
        codec.queue_input_buffer(input, &[0, 0, 0, 1, 0x65, 1], 20, 0).unwrap();

        assert!(matches!(
            codec.dequeue_output_buffer(Duration::ZERO).unwrap(),
            OutputEvent::FormatChanged(_)
        ));
        let OutputEvent::Frame(info) = codec.dequeue_output_buffer(Duration::ZERO).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(info.presentation_time_us, 20);
        assert_eq!(info.size, 6);
        assert_eq!(
            codec.dequeue_output_buffer(Duration::ZERO).unwrap(),
            OutputEvent::TryAgainLater
        );

        codec.release_output_buffer(info.index, Release::Render).unwrap();
        assert!(codec.release_output_buffer(info.index, Release::Render).is_err());
        assert_eq!(codec.releases(), vec![(info.index, Release::Render)]);
        assert_eq!(codec.queued_inputs().len(), 2);
        assert!(codec.queued_inputs()[0].is_config());
    }

    #[test]
    fn rejects_unowned_and_oversized_inputs() {
        let codec = LoopbackCodec::new("c2.loopback.avc", 1, 4);
        codec.start().unwrap();
        assert_eq!(
            codec.queue_input_buffer(0, &[1], 0, 0),
            Err(CodecError::InvalidIndex(0))
        );
        let input = codec.dequeue_input_buffer(Duration::ZERO).unwrap().unwrap();
        assert!(codec.queue_input_buffer(input, &[0; 8], 0, 0).is_err());
        assert!(codec.queue_input_buffer(input, &[0; 4], 0, 0).is_ok());
    }

    #[test]
    fn configure_failure_is_reported() {
        let codec = LoopbackCodec::new("c2.loopback.avc", 1, 4).with_configure_error("no surface");
        assert_eq!(
            codec.configure(&MediaFormat::new(), None),
            Err(CodecError::Configure("no surface".into()))
        );
    }

    #[test]
    fn released_codec_refuses_work() {
        let codec = LoopbackCodec::new("c2.loopback.avc", 1, 4);
        codec.release();
        assert_eq!(codec.start(), Err(CodecError::Released));
        assert!(codec.is_released());
    }
}
