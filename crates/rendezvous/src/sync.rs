//! The primitives every lock-based algorithm in this crate is written against: std normally, loom under `--cfg loom`.
#[cfg(not(loom))]
mod not_loom {
    pub mod atomic {
        pub use std::sync::atomic::{AtomicUsize, Ordering};
    }
    pub use std::sync::{Condvar, Mutex, MutexGuard};

    #[cfg(test)]
    pub use std::sync::Arc;
    #[cfg(test)]
    pub use std::thread::spawn;

    #[cfg(test)]
    pub fn wrap_test(what: impl Fn() + Sync + Send + 'static) {
        what()
    }
}

#[cfg(not(loom))]
pub(crate) use not_loom::*;

#[cfg(loom)]
mod with_loom {
    pub mod atomic {
        pub use loom::sync::atomic::{AtomicUsize, Ordering};
    }
    pub use loom::sync::{Condvar, Mutex, MutexGuard};

    #[cfg(test)]
    pub use loom::sync::Arc;
    #[cfg(test)]
    pub use loom::thread::spawn;

    #[cfg(test)]
    pub fn wrap_test(what: impl Fn() + Sync + Send + 'static) {
        loom::model(what)
    }
}
#[cfg(loom)]
pub(crate) use with_loom::*;

/// Lock a mutex, ignoring poisoning.
///
/// Nothing in this crate can panic while one of its own locks is held, so a poisoned lock still guards consistent state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
