//! Decoder session: one per active stream.
//!
//! A [`DecoderSession`] owns the platform decoder, the input slot pool, the
//! parameter-set cache, the stats windows and the presentation thread. Decode
//! units enter through [`DecoderSession::submit_decode_unit`] on the caller's
//! thread; frames leave on the presentation thread.
//!
//! ## Shutdown
//!
//! Stopping only raises a flag. The presentation thread observes it within one
//! frame interval, leaves its loop and runs the teardown, which releases the
//! decoder and surface exactly once. A producer still holding a slot sees the
//! flag on its next pool call and gets [`DecodeStatus::NeedKeyframe`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use sp_common::{BufferType, CodecError, DecodeError, DecodeStatus};

use crate::clock::Clock;
use crate::config::DecoderConfig;
use crate::diagnostics::{DecoderStage, DiagnosticReport, StageCounters};
use crate::format::FormatInfo;
use crate::input_pool::{InputBufferPool, PoolError, PoolMode, SlotState};
use crate::output::OutputQueue;
use crate::pacing::{presentation_loop, ReleaseModeGovernor};
use crate::params::{Assembly, ParameterSetAssembler};
use crate::platform::{
    flags, CodecCallbacks, MediaCodec, MediaFormat, OutputBufferInfo, Release, Surface,
};
use crate::quirks::{sdk, DecoderQuirks};
use crate::stats::{StatsWindows, VideoStats};

/// Name of the presentation thread.
pub const PRESENTATION_THREAD_NAME: &str = "sp-present";

type TeardownHook = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Mutable state guarded by the session mutex.
pub(crate) struct SessionState {
    pub(crate) stats: StatsWindows,
    pub(crate) governor: ReleaseModeGovernor,
    pub(crate) assembler: ParameterSetAssembler,
    pub(crate) stages: StageCounters,
    pub(crate) output_format: Option<MediaFormat>,
    pub(crate) last_error: Option<CodecError>,
}

/// Everything both pipeline threads touch.
pub(crate) struct Shared {
    pub(crate) codec: Arc<dyn MediaCodec>,
    pub(crate) surface: Option<Arc<dyn Surface>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: DecoderConfig,
    pub(crate) quirks: DecoderQuirks,
    pub(crate) configured_format: MediaFormat,
    pub(crate) pool: InputBufferPool,
    /// Present in callback mode only.
    pub(crate) outputs: Option<OutputQueue>,
    pub(crate) state: Mutex<SessionState>,
    stopping: AtomicBool,
    torn_down: AtomicBool,
    teardown_hook: Mutex<Option<TeardownHook>>,
}

impl Shared {
    fn new(
        codec: Arc<dyn MediaCodec>,
        surface: Option<Arc<dyn Surface>>,
        clock: Arc<dyn Clock>,
        config: DecoderConfig,
        quirks: DecoderQuirks,
        configured_format: MediaFormat,
        callback_mode: bool,
    ) -> Self {
        let mode = if callback_mode {
            PoolMode::Callback
        } else {
            PoolMode::Serial
        };
        let pacing = &config.pacing;
        let pool = InputBufferPool::new(
            codec.clone(),
            mode,
            config.input_slots,
            pacing.acquire_poll(),
            std::time::Duration::from_millis(pacing.slow_dequeue_warn_ms),
        );
        let assembler = ParameterSetAssembler::new(
            config.codec,
            quirks.adaptive_playback,
            quirks.sps_patch_options(&config),
        );
        let state = SessionState {
            stats: StatsWindows::new(),
            governor: ReleaseModeGovernor::new(pacing.hysteresis_seconds),
            assembler,
            stages: StageCounters::default(),
            output_format: None,
            last_error: None,
        };

        Self {
            codec,
            surface,
            clock,
            config,
            quirks,
            configured_format,
            pool,
            outputs: callback_mode.then(OutputQueue::new),
            state: Mutex::new(state),
            stopping: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            teardown_hook: Mutex::new(None),
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Raise the stopping flag and wake every waiter. Returns `false` if the
    /// session was already stopping.
    fn request_stop(&self) -> bool {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.pool.shutdown();
        if let Some(queue) = &self.outputs {
            queue.close();
        }
        true
    }

    pub(crate) fn on_output_format(&self, format: MediaFormat) {
        info!(format = %format, "Output format changed");
        let mut state = self.state.lock();
        state.stages.output_format_seen = true;
        state.output_format = Some(format);
    }

    /// Release the decoder, surface and buffers. Runs at most once.
    pub(crate) fn run_teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.request_stop();
        self.pool.wait_for_submissions();

        if let Some(queue) = &self.outputs {
            for info in queue.drain() {
                let _ = self.codec.release_output_buffer(info.index, Release::Drop);
            }
        }

        if let Err(e) = self.codec.stop() {
            warn!(error = %e, "Decoder stop failed during teardown");
        }
        self.codec.release();
        if let Some(surface) = &self.surface {
            surface.release();
        }
        self.pool.clear();
        self.state.lock().assembler.clear_cache();

        debug!(decoder = self.codec.name(), "Decoder resources released");

        let hook = self.teardown_hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Routes decoder notifications into the session without keeping it alive.
struct CallbackRouter {
    shared: Weak<Shared>,
}

impl CodecCallbacks for CallbackRouter {
    fn on_input_available(&self, index: usize, capacity: usize) {
        if let Some(shared) = self.shared.upgrade() {
            trace!(index, capacity, "Input buffer available");
            shared.pool.on_input_available(index, capacity);
        }
    }

    fn on_output_available(&self, info: OutputBufferInfo) {
        if let Some(queue) = self.shared.upgrade().as_ref().and_then(|s| s.outputs.as_ref()) {
            queue.push(info);
        }
    }

    fn on_format_changed(&self, format: &MediaFormat) {
        if let Some(queue) = self.shared.upgrade().as_ref().and_then(|s| s.outputs.as_ref()) {
            queue.push_format(format.clone());
        }
    }

    fn on_error(&self, err: &CodecError) {
        if let Some(shared) = self.shared.upgrade() {
            error!(error = %err, "Decoder reported an error");
            shared.state.lock().last_error = Some(err.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Snapshot of a session's counters.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStats {
    pub active: VideoStats,
    pub last: VideoStats,
    pub global: VideoStats,
    pub stages: StageCounters,
    pub immediate_release: bool,
    pub release_mode_changes: u32,
}

impl SessionStats {
    /// Last closed window plus the live one.
    pub fn last_two(&self) -> VideoStats {
        let mut combined = self.last;
        combined.add(&self.active);
        combined
    }

    /// Lifetime totals including the live window.
    pub fn lifetime(&self) -> VideoStats {
        let mut combined = self.global;
        combined.add(&self.active);
        combined
    }
}

/// One decoding pipeline bound to one stream.
pub struct DecoderSession {
    shared: Arc<Shared>,
    presenter: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DecoderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderSession")
            .field("decoder", &self.shared.codec.name())
            .field("codec", &self.shared.config.codec)
            .field("started", &self.presenter.is_some())
            .field("stopping", &self.shared.is_stopping())
            .field("pool", &self.shared.pool)
            .finish()
    }
}

impl DecoderSession {
    /// Configure `codec` for a new stream.
    ///
    /// The session does not pull or push any buffers until [`start`] is called.
    ///
    /// # Arguments
    /// * `codec` - Platform decoder, not yet configured.
    /// * `surface` - Display surface to render into, if any.
    /// * `config` - Stream and pacing configuration.
    /// * `clock` - Time source shared by timestamps, stats and scheduling.
    ///
    /// # Errors
    /// Returns `DecodeError::InvalidConfig` for an unusable configuration and
    /// `DecodeError::DecoderInit` if the decoder rejects the format or the
    /// callback registration. No session is returned in either case.
    ///
    /// [`start`]: DecoderSession::start
    pub fn create(
        codec: Arc<dyn MediaCodec>,
        surface: Option<Arc<dyn Surface>>,
        config: DecoderConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DecodeError> {
        config.validate()?;

        let decoder = codec.name().to_string();
        let quirks = DecoderQuirks::detect(&decoder, &config);
        let format = quirks.media_format(&config);

        codec.attach_clock(clock.clone());
        codec
            .configure(&format, surface.as_deref())
            .map_err(|e| {
                error!(decoder = %decoder, error = %e, "Decoder configure failed");
                DecodeError::DecoderInit {
                    codec: config.codec,
                    reason: e.to_string(),
                }
            })?;

        let mut callback_mode = config.callback_mode;
        let mut shared = Arc::new(Shared::new(
            codec.clone(),
            surface.clone(),
            clock.clone(),
            config.clone(),
            quirks.clone(),
            format.clone(),
            callback_mode,
        ));

        if callback_mode {
            let router = Arc::new(CallbackRouter {
                shared: Arc::downgrade(&shared),
            });
            match codec.set_callbacks(router) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(decoder = %decoder, "Decoder has no callback mode, polling instead");
                    callback_mode = false;
                    shared = Arc::new(Shared::new(
                        codec, surface, clock, config, quirks, format, false,
                    ));
                }
                Err(e) => {
                    error!(decoder = %decoder, error = %e, "Callback registration failed");
                    codec.release();
                    return Err(DecodeError::DecoderInit {
                        codec: shared.config.codec,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            decoder = %decoder,
            codec = shared.config.codec.display_name(),
            resolution = %shared.config.resolution,
            refresh_rate = shared.config.refresh_rate,
            adaptive = shared.quirks.adaptive_playback,
            baseline_hack = shared.quirks.needs_baseline_sps_hack,
            exynos4 = shared.quirks.exynos4,
            callback_mode,
            format = %shared.configured_format,
            "Decoder session configured"
        );

        Ok(Self {
            shared,
            presenter: None,
        })
    }

    /// Start the decoder and the presentation thread.
    ///
    /// # Errors
    /// Returns `DecodeError::AlreadyStarted` or `DecodeError::SessionStopped`
    /// when called out of order, `DecodeError::DecoderInit` if the decoder
    /// fails to start, or `DecodeError::ThreadSpawn`.
    pub fn start(&mut self) -> Result<(), DecodeError> {
        if self.presenter.is_some() {
            return Err(DecodeError::AlreadyStarted);
        }
        if self.shared.is_stopping() {
            return Err(DecodeError::SessionStopped);
        }

        self.shared.codec.start().map_err(|e| {
            error!(decoder = self.shared.codec.name(), error = %e, "Decoder start failed");
            DecodeError::DecoderInit {
                codec: self.shared.config.codec,
                reason: e.to_string(),
            }
        })?;

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(PRESENTATION_THREAD_NAME.into())
            .spawn(move || presentation_loop(shared))
            .inspect_err(|e| {
                error!(error = %e, "Failed to spawn presentation thread");
                if let Err(e) = self.shared.codec.stop() {
                    warn!(error = %e, "Decoder stop failed");
                }
            })?;
        self.presenter = Some(handle);

        info!(decoder = self.shared.codec.name(), "Decoder session started");
        Ok(())
    }

    /// Ask the pipeline to stop. Returns immediately; resources are released
    /// by the presentation thread once it has left its loop.
    pub fn stop(&self) {
        if self.shared.request_stop() {
            info!(decoder = self.shared.codec.name(), "Decoder session stopping");
        }
    }

    /// Stop, wait for the presentation thread and release every resource.
    pub fn release(mut self) {
        self.shutdown();
    }

    /// Register a callback to run after the decoder has been released.
    pub fn on_teardown(&self, hook: impl FnOnce() + Send + 'static) {
        *self.shared.teardown_hook.lock() = Some(Box::new(hook));
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }

    pub fn decoder_name(&self) -> &str {
        self.shared.codec.name()
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.shared.config
    }

    pub fn quirks(&self) -> &DecoderQuirks {
        &self.shared.quirks
    }

    pub fn configured_format(&self) -> &MediaFormat {
        &self.shared.configured_format
    }

    /// Current state of every input slot.
    pub fn slot_states(&self) -> Vec<SlotState> {
        self.shared.pool.states()
    }

    /// Hand one decode unit to the pipeline.
    ///
    /// Parameter sets are cached and may be returned `Ok` without touching
    /// the decoder. Picture data is copied into an input slot and queued,
    /// preceded by the cached parameter sets when they are due.
    ///
    /// # Arguments
    /// * `data` - One Annex-B NAL unit including its 4-byte start code.
    /// * `kind` - Classification from the protocol engine.
    /// * `frame_number` - Host frame number, used for loss accounting.
    /// * `receive_time_ms` - When the unit arrived, on the session clock.
    ///
    /// Returns [`DecodeStatus::NeedKeyframe`] when no input slot became
    /// available, the session is stopping, or the decoder refused the buffer.
    ///
    /// # Panics
    /// Panics if the assembled buffer exceeds the decoder's input buffer
    /// capacity. That is an upstream configuration error, not a runtime state.
    pub fn submit_decode_unit(
        &self,
        data: &[u8],
        kind: BufferType,
        frame_number: u32,
        receive_time_ms: u64,
    ) -> DecodeStatus {
        if self.shared.is_stopping() {
            return DecodeStatus::NeedKeyframe;
        }

        let now_us = self.shared.clock.now_us();
        let now_ms = now_us / 1_000;

        let assembly = {
            let mut state = self.shared.state.lock();
            match kind {
                BufferType::Vps => state.stages.vps_in += 1,
                BufferType::Sps => state.stages.sps_in += 1,
                BufferType::Pps => state.stages.pps_in += 1,
                BufferType::PicData => {
                    state.stages.frames_in += 1;
                    state.stats.record_frame_number(frame_number, now_ms);
                    state.stats.roll_if_due(now_ms);
                    state.stats.record_received(now_ms, receive_time_ms);
                    let avg = state.stats.last_two().avg_decode_ms();
                    state.governor.observe(avg, self.shared.config.refresh_rate);
                }
            }

            match state.assembler.accept(kind, data) {
                Ok(assembly) => assembly,
                Err(e) => {
                    warn!(error = %e, len = data.len(), "Rejecting parameter set");
                    return DecodeStatus::NeedKeyframe;
                }
            }
        };

        match assembly {
            Assembly::Cached => DecodeStatus::Ok,
            Assembly::Config(blob) => self.submit_config(&blob, now_us),
            Assembly::Picture { prefix: Some(prefix) } => {
                let status = self.queue(&[prefix.as_slice(), data], now_us, 0);
                if status.is_ok() {
                    self.shared.state.lock().assembler.on_picture_submitted();
                }
                status
            }
            Assembly::Picture { prefix: None } => self.queue(&[data], now_us, 0),
        }
    }

    fn submit_config(&self, blob: &[u8], now_us: u64) -> DecodeStatus {
        let status = self.queue(&[blob], now_us, flags::CODEC_CONFIG);
        if !status.is_ok() {
            return status;
        }
        let replay = self.shared.state.lock().assembler.on_config_submitted();
        match replay {
            Some(nal) => self.queue(&[nal.as_slice()], now_us, flags::CODEC_CONFIG),
            None => DecodeStatus::Ok,
        }
    }

    /// Copy `parts` into one input slot and queue it.
    fn queue(&self, parts: &[&[u8]], timestamp_us: u64, buffer_flags: u32) -> DecodeStatus {
        let pool = &self.shared.pool;
        let Some(slot) = pool.acquire(self.shared.config.pacing.acquire_timeout()) else {
            if !self.shared.is_stopping() {
                warn!("No input buffer available, requesting keyframe");
            }
            return DecodeStatus::NeedKeyframe;
        };

        let length = {
            let Some(mut writer) = pool.write(slot) else {
                return DecodeStatus::NeedKeyframe;
            };
            for part in parts {
                if let Err(e) = writer.put(part) {
                    panic!("{e}");
                }
            }
            writer.len()
        };

        match pool.submit(slot, length, timestamp_us, buffer_flags) {
            Ok(timestamp) => {
                trace!(slot, length, timestamp, flags = buffer_flags, "Decode unit queued");
                DecodeStatus::Ok
            }
            Err(PoolError::Stopping) => DecodeStatus::NeedKeyframe,
            Err(e) => {
                error!(slot, error = %e, "Failed to queue input buffer");
                if let PoolError::Codec(codec_error) = e {
                    self.shared.state.lock().last_error = Some(codec_error);
                }
                DecodeStatus::NeedKeyframe
            }
        }
    }

    /// Counters for all three stats windows.
    pub fn stats(&self) -> SessionStats {
        let state = self.shared.state.lock();
        SessionStats {
            active: state.stats.active,
            last: state.stats.last,
            global: state.stats.global,
            stages: state.stages,
            immediate_release: state.governor.is_immediate(),
            release_mode_changes: state.governor.transitions(),
        }
    }

    /// Overlay figures for the last two stats windows.
    pub fn format_info_values(&self) -> FormatInfo {
        let now_ms = self.shared.clock.now_ms();
        let state = self.shared.state.lock();
        let mut resolution = self.shared.config.resolution;
        if let Some(format) = &state.output_format {
            if let (Some(w), Some(h)) = (format.get_i32("width"), format.get_i32("height")) {
                resolution = sp_common::Resolution::new(w as u32, h as u32);
            }
        }
        FormatInfo::from_stats(
            resolution,
            self.shared.codec.name(),
            &state.stats.last_two(),
            now_ms,
        )
    }

    /// Fill an overlay template. See [`FormatInfo::render`].
    pub fn format_info(&self, template: &str) -> String {
        self.format_info_values().render(template)
    }

    /// Describe how far the stream got, for error reports.
    pub fn diagnostics(&self) -> DiagnosticReport {
        let shared = &self.shared;
        let state = shared.state.lock();
        let mut lifetime = state.stats.global;
        lifetime.add(&state.stats.active);

        DiagnosticReport {
            stage: DecoderStage::classify(&state.stages, shared.config.refresh_rate),
            codec: shared.config.codec,
            decoder: shared.codec.name().to_string(),
            configured_format: shared.configured_format.to_string(),
            output_format: state.output_format.as_ref().map(|f| f.to_string()),
            adaptive_playback: shared.quirks.adaptive_playback,
            ref_frame_invalidation: shared.config.ref_frame_invalidation,
            modern_sps_patching: shared.quirks.sdk_level >= sdk::O,
            resolution: shared.config.resolution,
            refresh_rate: shared.config.refresh_rate,
            counters: state.stages,
            global: lifetime,
            immediate_release: state.governor.is_immediate(),
            last_error: state.last_error.as_ref().map(|e| e.to_string()),
        }
    }

    fn shutdown(&mut self) {
        self.stop();
        if let Some(handle) = self.presenter.take() {
            if handle.join().is_err() {
                error!("Presentation thread panicked");
            }
        }
        self.shared.run_teardown();
    }
}

impl Drop for DecoderSession {
    fn drop(&mut self) {
        self.shutdown();

        let state = self.shared.state.lock();
        let mut lifetime = state.stats.global;
        lifetime.add(&state.stats.active);
        info!(
            decoder = self.shared.codec.name(),
            received = lifetime.received,
            rendered = lifetime.rendered,
            frames_lost = lifetime.frames_lost,
            loss_events = lifetime.loss_events,
            "Decoder session destroyed"
        );
    }
}
