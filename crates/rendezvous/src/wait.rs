//! How the blocking operations wait, and how callers abandon those waits.
//!
//! Every blocking operation in this crate is written once, generic over a [Wait] strategy, and then instantiated
//! twice:
//!
//! - [Forever] blocks on the condition variable until notified.  Its error type is [Infallible], so the plain
//!   operations (`enqueue`, `dequeue`, `wait`) return their values directly.
//! - [Interruptible] blocks in slices of at most [CANCEL_POLL_INTERVAL], checking a [CancelToken] and/or a deadline
//!   between slices.  It gives up with [Error::is_cancelled] or [Error::is_timed_out].
//!
//! Strategies are only ever consulted while the caller's condition is still unsatisfied.  A waiter that gives up is
//! therefore never sitting on a notification some other waiter could have used: if it had been woken for a real state
//! change it would have observed that change and proceeded instead.
//!
//! Loom does not model timeouts, so [Interruptible] is not available with `--cfg loom`.
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
#[cfg(not(loom))]
use std::time::{Duration, Instant};

use crate::sync::{Condvar, MutexGuard};
#[cfg(not(loom))]
use crate::Error;

/// Interruptible waits re-check their cancel token this often.
#[cfg(not(loom))]
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A cloneable flag shared between blocked threads and whoever may ask them to stop waiting.
///
/// Cancelling is sticky: once cancelled, every present and future interruptible wait using this token (or a clone of
/// it) fails with a cancellation error, until [CancelToken::reset] is called.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every wait using this token to give up.
    ///
    /// Waiters notice within [CANCEL_POLL_INTERVAL].
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Re-arm the token so that it can be used for further waits.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}

/// A strategy for blocking on a condition variable.
pub(crate) trait Wait {
    type Error;

    /// Called before every block.  An error means the caller should give up, leaving state as it found it.
    fn check(&self) -> Result<(), Self::Error>;

    /// Block until notified, or possibly spuriously.
    fn wait<'a, T>(&self, condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T>;
}

/// Block until notified, without any way to give up.
pub(crate) struct Forever;

impl Wait for Forever {
    type Error = Infallible;

    fn check(&self) -> Result<(), Infallible> {
        Ok(())
    }

    fn wait<'a, T>(&self, condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        condvar
            .wait(guard)
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Unwrap the result of an operation which waited [Forever].
pub(crate) fn never_fails<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(x) => x,
        Err(never) => match never {},
    }
}

/// Block until notified, until a token is cancelled, or until a deadline passes.
#[cfg(not(loom))]
pub(crate) struct Interruptible<'a> {
    token: Option<&'a CancelToken>,
    deadline: Option<Instant>,
}

#[cfg(not(loom))]
impl<'a> Interruptible<'a> {
    pub(crate) fn cancellable(token: &'a CancelToken) -> Self {
        Self {
            token: Some(token),
            deadline: None,
        }
    }

    /// Give up after `timeout`.
    ///
    /// Timeouts too large to represent as an [Instant] wait forever.
    pub(crate) fn timeout(timeout: Duration) -> Self {
        Self {
            token: None,
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// How long the next block may last.
    fn slice(&self, now: Instant) -> Option<Duration> {
        let until_deadline = self.deadline.map(|d| d.saturating_duration_since(now));
        match (self.token.is_some(), until_deadline) {
            (true, Some(d)) => Some(d.min(CANCEL_POLL_INTERVAL)),
            (true, None) => Some(CANCEL_POLL_INTERVAL),
            (false, d) => d,
        }
    }
}

#[cfg(not(loom))]
impl Wait for Interruptible<'_> {
    type Error = Error;

    fn check(&self) -> Result<(), Error> {
        if self.token.is_some_and(CancelToken::is_cancelled) {
            return Err(Error::cancelled());
        }

        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::timed_out());
        }

        Ok(())
    }

    fn wait<'g, T>(&self, condvar: &Condvar, guard: MutexGuard<'g, T>) -> MutexGuard<'g, T> {
        match self.slice(Instant::now()) {
            Some(slice) => {
                condvar
                    .wait_timeout(guard, slice)
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .0
            }
            None => Forever.wait(condvar, guard),
        }
    }
}
