//! Blocking coordination primitives for threads.
//!
//! - [ReusableBarrier]: a cyclic rendezvous point for a fixed number of participants, with an optional action run once
//!   per cycle.
//! - [BlockingQueue]: a fixed-capacity FIFO whose operations block on full and empty, implemented with one lock
//!   ([CoarseGrainedQueue]) or with separate locks for each end ([FineGrainedQueue]).
//! - [pipeline]: producers and consumers over a shared bounded channel, shut down with one poison pill per consumer.
//!
//! Every blocking operation has an interruptible form taking a [CancelToken] or a timeout.  An interrupted operation
//! returns an [Error], has released every lock it took, and leaves the primitive usable.
//!
//! The lock-based algorithms can be model-checked with loom: `RUSTFLAGS="--cfg loom" cargo test --release`.  The
//! interruptible forms and the pipeline are not available in that configuration.
pub mod barrier;
mod error;
#[cfg(not(loom))]
pub mod pipeline;
pub mod queue;
mod sync;
mod wait;

pub use barrier::{BarrierWaitResult, CycleAction, ReusableBarrier};
pub use error::{EnqueueError, Error, Result};
pub use queue::{BlockingQueue, CoarseGrainedQueue, FineGrainedQueue};
#[cfg(not(loom))]
pub use wait::CANCEL_POLL_INTERVAL;
pub use wait::CancelToken;
