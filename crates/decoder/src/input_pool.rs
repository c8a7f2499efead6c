//! Input buffer slot pool.
//!
//! The pool tracks a fixed number of slots, each of which can hold one
//! decoder-owned input buffer. Slots move through four states:
//!
//! ```text
//!   INVALID --(decoder hands out a buffer)--> FREE
//!   FREE    --(acquire)-------------------->  WORKING
//!   WORKING --(submit)--------------------->  QUEUING
//!   QUEUING --(queued to the decoder)------>  INVALID
//!   QUEUING --(decoder refused it)--------->  FREE
//! ```
//!
//! Only the producer moves a slot out of `FREE` and `WORKING`, and only the
//! retirement step inside [`InputBufferPool::submit`] moves it out of
//! `QUEUING`. Once a buffer has been queued the slot forgets its native
//! index; the pool never keeps a handle to memory the decoder owns again.
//! A buffer the decoder refused is still ours, so its slot keeps it.
//!
//! In serial mode the pool pulls native buffers from the decoder itself while
//! acquiring. In callback mode the decoder pushes them through
//! [`InputBufferPool::on_input_available`].
//!
//! Encoded bytes are staged per slot and copied into the native buffer when
//! the slot is queued.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, trace, warn};

use sp_common::CodecError;

use crate::platform::MediaCodec;

/// Lifecycle state of one input slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// No native buffer attached.
    Invalid,
    /// Holds a native buffer nobody has claimed.
    Free,
    /// Claimed by the producer and being filled.
    Working,
    /// Filled and on its way to the decoder.
    Queuing,
}

/// How native input buffers reach the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolMode {
    Serial,
    Callback,
}

/// Errors from slot operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Slot {0} is out of range")]
    OutOfRange(usize),

    #[error("Slot {0} is not being filled")]
    NotWorking(usize),

    #[error("Decode unit of {requested} bytes overflows input buffer of {capacity} bytes")]
    Overflow { capacity: usize, requested: usize },

    #[error("Input pool is shutting down")]
    Stopping,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    state: SlotState,
    native_index: Option<usize>,
    capacity: usize,
}

impl Slot {
    const EMPTY: Slot = Slot {
        state: SlotState::Invalid,
        native_index: None,
        capacity: 0,
    };

    fn attach(&mut self, native_index: usize, capacity: usize) {
        self.state = SlotState::Free;
        self.native_index = Some(native_index);
        self.capacity = capacity;
    }
}

struct PoolInner {
    slots: Vec<Slot>,
    /// Native buffers announced while every slot was occupied.
    pending: VecDeque<(usize, usize)>,
    stopping: bool,
}

impl PoolInner {
    fn attach_to_invalid(&mut self, native_index: usize, capacity: usize) -> bool {
        match self.slots.iter_mut().find(|s| s.state == SlotState::Invalid) {
            Some(slot) => {
                slot.attach(native_index, capacity);
                true
            }
            None => false,
        }
    }
}

/// Thread-safe pool of decoder input slots.
pub struct InputBufferPool {
    codec: Arc<dyn MediaCodec>,
    mode: PoolMode,
    inner: Mutex<PoolInner>,
    available: Condvar,
    staging: Vec<Mutex<Vec<u8>>>,
    /// Last timestamp handed to the decoder. Held across the queue call so
    /// the decoder observes timestamps in submission order.
    last_timestamp_us: Mutex<u64>,
    poll: Duration,
    slow_dequeue: Duration,
}

impl std::fmt::Debug for InputBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InputBufferPool")
            .field("mode", &self.mode)
            .field("slots", &inner.slots.len())
            .field("pending", &inner.pending.len())
            .field("stopping", &inner.stopping)
            .finish()
    }
}

impl InputBufferPool {
    /// Create a pool of `slots` empty slots.
    ///
    /// # Arguments
    /// * `codec` - Decoder the slots belong to.
    /// * `mode` - Where native buffers come from.
    /// * `poll` - Upper bound on a single wait, so a stop request is seen promptly.
    /// * `slow_dequeue` - Acquisitions slower than this are logged.
    pub fn new(
        codec: Arc<dyn MediaCodec>,
        mode: PoolMode,
        slots: usize,
        poll: Duration,
        slow_dequeue: Duration,
    ) -> Self {
        Self {
            codec,
            mode,
            inner: Mutex::new(PoolInner {
                slots: vec![Slot::EMPTY; slots],
                pending: VecDeque::new(),
                stopping: false,
            }),
            available: Condvar::new(),
            staging: (0..slots).map(|_| Mutex::new(Vec::new())).collect(),
            last_timestamp_us: Mutex::new(0),
            poll,
            slow_dequeue,
        }
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.staging.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    /// Snapshot of every slot's state.
    pub fn states(&self) -> Vec<SlotState> {
        self.inner.lock().slots.iter().map(|s| s.state).collect()
    }

    pub fn count(&self, state: SlotState) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|s| s.state == state)
            .count()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.lock().stopping
    }

    /// Last timestamp queued to the decoder.
    pub fn last_timestamp_us(&self) -> u64 {
        *self.last_timestamp_us.lock()
    }

    /// Claim a free slot, waiting up to `timeout`.
    ///
    /// Returns the slot index in `WORKING` state, or `None` if no slot became
    /// free in time or the pool is shutting down.
    pub fn acquire(&self, timeout: Duration) -> Option<usize> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut inner = self.inner.lock();

        loop {
            if inner.stopping {
                return None;
            }

            if let Some(index) = inner
                .slots
                .iter()
                .position(|s| s.state == SlotState::Free)
            {
                inner.slots[index].state = SlotState::Working;
                drop(inner);
                self.staging[index].lock().clear();

                let waited = started.elapsed();
                if waited >= self.slow_dequeue {
                    warn!(
                        waited_ms = waited.as_millis() as u64,
                        slot = index,
                        "Slow input buffer dequeue"
                    );
                }
                trace!(slot = index, "Input slot acquired");
                return Some(index);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(slots = inner.slots.len(), "No free input slot");
                return None;
            }
            let wait = self.poll.min(deadline - now);

            let can_pull = self.mode == PoolMode::Serial
                && inner.slots.iter().any(|s| s.state == SlotState::Invalid);
            if can_pull {
                let codec = &self.codec;
                let pulled = MutexGuard::unlocked(&mut inner, || {
                    codec.dequeue_input_buffer(wait).and_then(|native| match native {
                        Some(index) => Ok(Some((index, codec.input_buffer_capacity(index)?))),
                        None => Ok(None),
                    })
                });
                match pulled {
                    Ok(Some((native, capacity))) => {
                        if !inner.attach_to_invalid(native, capacity) {
                            inner.pending.push_back((native, capacity));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "Input buffer dequeue failed");
                        self.available.wait_for(&mut inner, wait);
                    }
                }
            } else {
                self.available.wait_for(&mut inner, wait);
            }
        }
    }

    /// Open the staging buffer of a `WORKING` slot for writing.
    ///
    /// Returns `None` if the slot is not `WORKING`, e.g. because a stop
    /// reclaimed it. The returned writer must be dropped before [`submit`].
    ///
    /// [`submit`]: InputBufferPool::submit
    pub fn write(&self, index: usize) -> Option<SlotWriter<'_>> {
        let capacity = {
            let inner = self.inner.lock();
            let slot = inner.slots.get(index)?;
            if inner.stopping || slot.state != SlotState::Working {
                debug!(slot = index, state = ?slot.state, "Write to unclaimed input slot");
                return None;
            }
            slot.capacity
        };
        Some(SlotWriter {
            buf: self.staging[index].lock(),
            capacity,
        })
    }

    /// Queue the first `length` staged bytes of a `WORKING` slot.
    ///
    /// A `timestamp_us` that does not exceed the previous submission is bumped
    /// to `previous + 1`. The slot returns to `INVALID` once the decoder has
    /// the buffer. If the buffer was not queued the slot goes back to `FREE`
    /// with its native buffer still attached.
    ///
    /// # Errors
    /// Returns `PoolError::NotWorking` if the slot was not claimed,
    /// `PoolError::Stopping` during shutdown, `PoolError::Overflow` if
    /// `length` exceeds the staged data, or the decoder's queue error.
    pub fn submit(
        &self,
        index: usize,
        length: usize,
        timestamp_us: u64,
        flags: u32,
    ) -> Result<u64, PoolError> {
        let mut last_timestamp = self.last_timestamp_us.lock();

        let native = {
            let mut inner = self.inner.lock();
            let stopping = inner.stopping;
            let slot = inner
                .slots
                .get_mut(index)
                .ok_or(PoolError::OutOfRange(index))?;
            if slot.state != SlotState::Working {
                return Err(PoolError::NotWorking(index));
            }
            let Some(native) = slot.native_index else {
                return Err(PoolError::NotWorking(index));
            };
            if stopping {
                *slot = Slot::EMPTY;
                return Err(PoolError::Stopping);
            }
            slot.state = SlotState::Queuing;
            native
        };

        let timestamp = if timestamp_us <= *last_timestamp {
            *last_timestamp + 1
        } else {
            timestamp_us
        };

        let result = {
            let staged = self.staging[index].lock();
            if length > staged.len() {
                Err(PoolError::Overflow {
                    capacity: staged.len(),
                    requested: length,
                })
            } else {
                self.codec
                    .queue_input_buffer(native, &staged[..length], timestamp, flags)
                    .map_err(PoolError::from)
            }
        };

        if result.is_ok() {
            *last_timestamp = timestamp;
        }
        drop(last_timestamp);

        if result.is_ok() {
            self.retire(index);
        } else {
            self.reclaim(index);
        }
        trace!(slot = index, native, length, timestamp, flags, "Input queued");
        result.map(|()| timestamp)
    }

    fn retire(&self, index: usize) {
        let mut inner = self.inner.lock();
        inner.slots[index] = Slot::EMPTY;
        if let Some((native, capacity)) = inner.pending.pop_front() {
            inner.slots[index].attach(native, capacity);
            self.available.notify_one();
        }
    }

    /// Put a slot whose buffer never reached the decoder back into `FREE`.
    fn reclaim(&self, index: usize) {
        let mut inner = self.inner.lock();
        if inner.stopping {
            inner.slots[index] = Slot::EMPTY;
            return;
        }
        let slot = &mut inner.slots[index];
        slot.state = SlotState::Free;
        debug!(slot = index, native = ?slot.native_index, "Input slot reclaimed after failed queue");
        self.available.notify_one();
    }

    /// Attach a native buffer announced by the decoder (callback mode).
    pub fn on_input_available(&self, native_index: usize, capacity: usize) {
        let mut inner = self.inner.lock();
        if inner.stopping {
            return;
        }
        if inner.attach_to_invalid(native_index, capacity) {
            self.available.notify_one();
        } else {
            debug!(native_index, "All input slots occupied, parking native buffer");
            inner.pending.push_back((native_index, capacity));
        }
    }

    /// Stop handing out slots and wake every waiter.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.stopping = true;
        self.available.notify_all();
    }

    /// Block until no submission is in flight. After [`shutdown`] this
    /// guarantees nothing else reaches the decoder's input side.
    ///
    /// [`shutdown`]: InputBufferPool::shutdown
    pub fn wait_for_submissions(&self) {
        drop(self.last_timestamp_us.lock());
    }

    /// Drop every slot and staging buffer. Only valid after [`shutdown`].
    ///
    /// [`shutdown`]: InputBufferPool::shutdown
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.iter_mut().for_each(|s| *s = Slot::EMPTY);
        inner.pending.clear();
        drop(inner);
        for staging in &self.staging {
            let mut buf = staging.lock();
            buf.clear();
            buf.shrink_to_fit();
        }
    }
}

/// Write access to a `WORKING` slot's staging buffer.
pub struct SlotWriter<'a> {
    buf: MutexGuard<'a, Vec<u8>>,
    capacity: usize,
}

impl SlotWriter<'_> {
    /// Append `data`.
    ///
    /// # Errors
    /// Returns `PoolError::Overflow` if the native buffer cannot hold it; the
    /// staged data is left unchanged.
    pub fn put(&mut self, data: &[u8]) -> Result<(), PoolError> {
        let requested = self.buf.len() + data.len();
        if requested > self.capacity {
            return Err(PoolError::Overflow {
                capacity: self.capacity,
                requested,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}
