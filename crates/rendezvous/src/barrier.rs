//! A reusable (cyclic) barrier.
//!
//! A [ReusableBarrier] releases its participants in groups of `participant_count`.  Each group is a cycle, identified by
//! a generation counter which advances exactly once per cycle; waiters block until the generation moves past the one
//! they arrived in, which makes spurious wakeups harmless and means that a participant racing ahead into the next cycle
//! can never release the stragglers of the previous one.
//!
//! The participant which completes a cycle is its leader.  The leader runs the barrier's [CycleAction], if any, before
//! anyone else is released, and while still holding the barrier's lock: nothing can observe the cycle half-completed.
//!
//! # Cancellation
//!
//! A participant which gives up through [ReusableBarrier::wait_cancellable] or [ReusableBarrier::wait_timeout]
//! withdraws its arrival, so the cycle it left still needs `participant_count` arrivals to complete.  If the cycle
//! completed while it was giving up, the wait succeeds instead.
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
#[cfg(not(loom))]
use std::time::Duration;

use crate::sync::{lock, Condvar, Mutex};
#[cfg(not(loom))]
use crate::wait::{CancelToken, Interruptible};
use crate::wait::{never_fails, Forever, Wait};
use crate::{Error, Result};

/// Work to run once per completed cycle, on the leader's thread, before the other participants are released.
///
/// Any `FnMut() + Send` closure is a `CycleAction`.
pub trait CycleAction: Send + 'static {
    /// `generation` is the generation of the cycle which just completed, starting at 0.
    fn on_cycle_complete(&mut self, generation: u64);
}

impl<F: FnMut() + Send + 'static> CycleAction for F {
    fn on_cycle_complete(&mut self, _generation: u64) {
        self()
    }
}

struct BarrierState {
    /// Arrivals in the current cycle.  Always less than the participant count outside of the leader's critical section.
    arrived: usize,

    generation: u64,

    action: Option<Box<dyn CycleAction>>,
}

pub struct ReusableBarrier {
    participant_count: NonZeroUsize,
    state: Mutex<BarrierState>,

    /// Broadcast when the generation advances.
    released: Condvar,
}

/// What a participant learns when it is released.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BarrierWaitResult {
    is_leader: bool,
    generation: u64,
}

impl BarrierWaitResult {
    /// True for exactly one participant per cycle: the one which arrived last and ran the cycle action.
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// The generation of the cycle this participant was released from.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl ReusableBarrier {
    pub fn new(participant_count: NonZeroUsize) -> Self {
        Self::build(participant_count, None)
    }

    pub fn with_action(participant_count: NonZeroUsize, action: impl CycleAction) -> Self {
        Self::build(participant_count, Some(Box::new(action)))
    }

    /// Like [ReusableBarrier::new], for counts only known at runtime.  Fails if `participant_count` is 0.
    pub fn try_new(participant_count: usize) -> Result<Self> {
        let count = NonZeroUsize::new(participant_count).ok_or_else(Error::zero_participants)?;
        Ok(Self::new(count))
    }

    pub fn try_with_action(participant_count: usize, action: impl CycleAction) -> Result<Self> {
        let count = NonZeroUsize::new(participant_count).ok_or_else(Error::zero_participants)?;
        Ok(Self::with_action(count, action))
    }

    fn build(participant_count: NonZeroUsize, action: Option<Box<dyn CycleAction>>) -> Self {
        Self {
            participant_count,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                action,
            }),
            released: Condvar::new(),
        }
    }

    pub fn participant_count(&self) -> usize {
        self.participant_count.get()
    }

    /// Number of completed cycles.
    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    /// Participants currently blocked in the ongoing cycle.
    pub fn arrived(&self) -> usize {
        lock(&self.state).arrived
    }

    /// Block until `participant_count` participants have called this in the current cycle.
    ///
    /// If the cycle action panics, the cycle still completes and the other participants are released normally; the
    /// panic then resumes on the leader's thread.
    pub fn wait(&self) -> BarrierWaitResult {
        never_fails(self.wait_with(&Forever))
    }

    /// Like [ReusableBarrier::wait], but gives up if `token` is cancelled.
    #[cfg(not(loom))]
    pub fn wait_cancellable(&self, token: &CancelToken) -> Result<BarrierWaitResult> {
        self.wait_with(&Interruptible::cancellable(token))
    }

    /// Like [ReusableBarrier::wait], but gives up once `timeout` has elapsed.
    #[cfg(not(loom))]
    pub fn wait_timeout(&self, timeout: Duration) -> Result<BarrierWaitResult> {
        self.wait_with(&Interruptible::timeout(timeout))
    }

    fn wait_with<W: Wait>(&self, waiter: &W) -> Result<BarrierWaitResult, W::Error> {
        let mut state = lock(&self.state);
        let arrived_in = state.generation;
        state.arrived += 1;

        if state.arrived == self.participant_count.get() {
            let outcome = match state.action.as_mut() {
                Some(action) => {
                    panic::catch_unwind(AssertUnwindSafe(|| action.on_cycle_complete(arrived_in)))
                }
                None => Ok(()),
            };

            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            drop(state);

            log::trace!("Barrier cycle {} complete", arrived_in);
            if let Err(payload) = outcome {
                panic::resume_unwind(payload);
            }

            return Ok(BarrierWaitResult {
                is_leader: true,
                generation: arrived_in,
            });
        }

        while state.generation == arrived_in {
            if let Err(e) = waiter.check() {
                state.arrived -= 1;
                drop(state);
                log::debug!("Participant withdrew from barrier cycle {}", arrived_in);
                return Err(e);
            }

            state = waiter.wait(&self.released, state);
        }

        Ok(BarrierWaitResult {
            is_leader: false,
            generation: arrived_in,
        })
    }
}

impl std::fmt::Debug for ReusableBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ReusableBarrier")
            .field("participant_count", &self.participant_count)
            .field("arrived", &state.arrived)
            .field("generation", &state.generation)
            .field("has_action", &state.action.is_some())
            .finish()
    }
}
