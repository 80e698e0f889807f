//! Multi-producer/multi-consumer pipeline with poison-pill shutdown.
//!
//! Producers push a fixed batch of unique ids onto a shared bounded [Channel].  Consumers pull until they receive
//! [POISON_PILL].  Shutdown is driven from outside, by [run_pipeline] or by hand:
//!
//! 1. Wait for every producer to finish.
//! 2. Put exactly one [POISON_PILL] per consumer.
//! 3. Wait for every consumer to finish.
//!
//! Because the pills go in only after all real items and the channel is FIFO, every consumer gets exactly one pill and
//! no pill overtakes an item still in flight.
//!
//! The pill must never be a legitimate item.  Nothing in the channel can check this; [Producer] guarantees it by only
//! ever producing non-negative ids.
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam::channel as chan;

use crate::queue::BlockingQueue;
use crate::wait::{CancelToken, CANCEL_POLL_INTERVAL};
use crate::{Error, Result};

/// The type carried through the pipeline.
pub type Item = i64;

/// Tells a consumer to stop.  Never produced as a real item.
pub const POISON_PILL: Item = -1;

pub const DEFAULT_PRODUCERS: usize = 2;
pub const DEFAULT_CONSUMERS: usize = 2;
pub const DEFAULT_BATCH_SIZE: u32 = 10;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 5;
pub const DEFAULT_ID_STRIDE: u32 = 100;

/// A blocking FIFO channel of [Item]s shared by producers and consumers.
pub trait Channel: Sync {
    /// Put an item, blocking while the channel is full.
    fn put(&self, item: Item) -> Result<()>;

    /// Take the oldest item, blocking while the channel is empty.
    fn take(&self) -> Result<Item>;

    fn put_cancellable(&self, item: Item, token: &CancelToken) -> Result<()>;

    fn take_cancellable(&self, token: &CancelToken) -> Result<Item>;
}

impl<Q: BlockingQueue<Item>> Channel for Q {
    fn put(&self, item: Item) -> Result<()> {
        self.enqueue(item);
        Ok(())
    }

    fn take(&self) -> Result<Item> {
        Ok(self.dequeue())
    }

    fn put_cancellable(&self, item: Item, token: &CancelToken) -> Result<()> {
        Ok(self.enqueue_cancellable(item, token)?)
    }

    fn take_cancellable(&self, token: &CancelToken) -> Result<Item> {
        self.dequeue_cancellable(token)
    }
}

/// A [Channel] backed by a crossbeam channel.  Holds both halves, so it never disconnects.
#[derive(Clone, Debug)]
pub struct CrossbeamChannel {
    sender: chan::Sender<Item>,
    receiver: chan::Receiver<Item>,
}

impl CrossbeamChannel {
    pub fn bounded(capacity: NonZeroUsize) -> Self {
        let (sender, receiver) = chan::bounded(capacity.get());
        Self { sender, receiver }
    }

    /// A channel which never blocks producers.
    pub fn unbounded() -> Self {
        let (sender, receiver) = chan::unbounded();
        Self { sender, receiver }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.sender.capacity()
    }
}

impl Channel for CrossbeamChannel {
    fn put(&self, item: Item) -> Result<()> {
        self.sender.send(item).map_err(|_| Error::disconnected())
    }

    fn take(&self) -> Result<Item> {
        self.receiver.recv().map_err(|_| Error::disconnected())
    }

    fn put_cancellable(&self, mut item: Item, token: &CancelToken) -> Result<()> {
        loop {
            if token.is_cancelled() {
                return Err(Error::cancelled());
            }

            match self.sender.send_timeout(item, CANCEL_POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(chan::SendTimeoutError::Timeout(i)) => item = i,
                Err(chan::SendTimeoutError::Disconnected(_)) => return Err(Error::disconnected()),
            }
        }
    }

    fn take_cancellable(&self, token: &CancelToken) -> Result<Item> {
        loop {
            if token.is_cancelled() {
                return Err(Error::cancelled());
            }

            match self.receiver.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(item) => return Ok(item),
                Err(chan::RecvTimeoutError::Timeout) => continue,
                Err(chan::RecvTimeoutError::Disconnected) => return Err(Error::disconnected()),
            }
        }
    }
}

/// Produces `batch_size` items with ids `id * id_stride + sequence`.
///
/// With `batch_size <= id_stride` the ids of distinct producers never collide, and all ids are non-negative.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Producer {
    id: u32,
    batch_size: u32,
    id_stride: u32,
}

impl Producer {
    pub fn new(id: u32, batch_size: u32, id_stride: u32) -> Result<Self> {
        if batch_size > id_stride {
            return Err(Error::invalid_config(format!(
                "a batch of {batch_size} items does not fit in an id stride of {id_stride}"
            )));
        }

        if last_item_id(id, batch_size, id_stride).is_none() {
            return Err(Error::invalid_config(format!(
                "producer {id} with an id stride of {id_stride} would produce ids beyond {}",
                Item::MAX
            )));
        }

        Ok(Self {
            id,
            batch_size,
            id_stride,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// The item this producer emits at position `sequence` of its batch.  `sequence` must be below the batch size.
    pub fn item_id(&self, sequence: u32) -> Item {
        debug_assert!(sequence < self.batch_size);
        Item::from(self.id) * Item::from(self.id_stride) + Item::from(sequence)
    }

    /// Put the whole batch in order and return what was put.
    pub fn run<C: Channel + ?Sized>(&self, channel: &C) -> Result<Vec<Item>> {
        self.run_with(|item| channel.put(item))
    }

    /// Like [Producer::run], but stops early with a cancellation error if `token` is cancelled while blocked.
    pub fn run_cancellable<C: Channel + ?Sized>(
        &self,
        channel: &C,
        token: &CancelToken,
    ) -> Result<Vec<Item>> {
        self.run_with(|item| channel.put_cancellable(item, token))
    }

    fn run_with(&self, mut put: impl FnMut(Item) -> Result<()>) -> Result<Vec<Item>> {
        let mut produced = Vec::with_capacity(self.batch_size as usize);
        for sequence in 0..self.batch_size {
            let item = self.item_id(sequence);
            put(item)?;
            produced.push(item);
            log::trace!("Producer {} put {}", self.id, item);
        }

        log::debug!("Producer {} finished after {} items", self.id, produced.len());
        Ok(produced)
    }
}

/// The largest id producer `id` emits, or `None` if its ids do not all fit in a non-negative [Item].
fn last_item_id(id: u32, batch_size: u32, id_stride: u32) -> Option<Item> {
    Item::from(id)
        .checked_mul(Item::from(id_stride))?
        .checked_add(Item::from(batch_size.saturating_sub(1)))
}

/// Takes items until it sees [POISON_PILL].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Consumer {
    id: u32,
}

impl Consumer {
    pub fn new(id: u32) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Take items until the pill arrives; return everything taken except the pill.
    pub fn run<C: Channel + ?Sized>(&self, channel: &C) -> Result<Vec<Item>> {
        self.run_with(|| channel.take())
    }

    pub fn run_cancellable<C: Channel + ?Sized>(
        &self,
        channel: &C,
        token: &CancelToken,
    ) -> Result<Vec<Item>> {
        self.run_with(|| channel.take_cancellable(token))
    }

    fn run_with(&self, mut take: impl FnMut() -> Result<Item>) -> Result<Vec<Item>> {
        let mut consumed = vec![];
        loop {
            let item = take()?;
            if item == POISON_PILL {
                break;
            }

            log::trace!("Consumer {} took {}", self.id, item);
            consumed.push(item);
        }

        log::debug!(
            "Consumer {} received the poison pill after {} items",
            self.id,
            consumed.len()
        );
        Ok(consumed)
    }
}

/// Shape of a pipeline run.
///
/// Defaults match a small demo: two producers of ten items each, two consumers, a channel of five.
#[derive(Clone, Debug, derive_builder::Builder)]
#[builder(pattern = "owned", build_fn(name = "build_unchecked", private))]
pub struct PipelineConfig {
    #[builder(default = "DEFAULT_PRODUCERS")]
    producers: usize,

    #[builder(default = "DEFAULT_CONSUMERS")]
    consumers: usize,

    /// Items per producer.
    #[builder(default = "DEFAULT_BATCH_SIZE")]
    batch_size: u32,

    /// Capacity of the channel [run_pipeline] creates.  Ignored by [run_pipeline_on].
    #[builder(default = "DEFAULT_CHANNEL_CAPACITY")]
    channel_capacity: usize,

    /// Distance between the first ids of consecutive producers.  Must be at least `batch_size`.
    #[builder(default = "DEFAULT_ID_STRIDE")]
    id_stride: u32,
}

impl PipelineConfigBuilder {
    /// Build and validate the configuration.
    pub fn build(self) -> Result<PipelineConfig> {
        let config = self
            .build_unchecked()
            .map_err(|e| Error::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            producers: DEFAULT_PRODUCERS,
            consumers: DEFAULT_CONSUMERS,
            batch_size: DEFAULT_BATCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            id_stride: DEFAULT_ID_STRIDE,
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    fn validate(&self) -> Result<()> {
        if self.producers == 0 {
            return Err(Error::invalid_config("at least one producer is required"));
        }

        if self.consumers == 0 {
            return Err(Error::invalid_config("at least one consumer is required"));
        }

        if self.channel_capacity == 0 {
            return Err(Error::zero_capacity());
        }

        let Ok(last_producer) = u32::try_from(self.producers - 1) else {
            return Err(Error::invalid_config(format!(
                "{} producers cannot all be given distinct ids",
                self.producers
            )));
        };

        if u32::try_from(self.consumers - 1).is_err() {
            return Err(Error::invalid_config(format!(
                "{} consumers cannot all be given distinct ids",
                self.consumers
            )));
        }

        if self.batch_size > self.id_stride {
            return Err(Error::invalid_config(format!(
                "a batch of {} items does not fit in an id stride of {}",
                self.batch_size, self.id_stride
            )));
        }

        if last_item_id(last_producer, self.batch_size, self.id_stride).is_none() {
            return Err(Error::invalid_config(format!(
                "{} producers with an id stride of {} would produce ids beyond {}",
                self.producers,
                self.id_stride,
                Item::MAX
            )));
        }

        Ok(())
    }

    pub fn producers(&self) -> usize {
        self.producers
    }

    pub fn consumers(&self) -> usize {
        self.consumers
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    pub fn id_stride(&self) -> u32 {
        self.id_stride
    }

    fn make_producers(&self) -> Result<Vec<Producer>> {
        (0..self.producers)
            .map(|id| {
                let id = u32::try_from(id).map_err(|e| Error::invalid_config(e.to_string()))?;
                Producer::new(id, self.batch_size, self.id_stride)
            })
            .collect()
    }

    fn make_consumers(&self) -> Result<Vec<Consumer>> {
        (0..self.consumers)
            .map(|id| {
                let id = u32::try_from(id).map_err(|e| Error::invalid_config(e.to_string()))?;
                Ok(Consumer::new(id))
            })
            .collect()
    }
}

/// What every producer produced and every consumer consumed, indexed by id.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PipelineReport {
    produced: Vec<Vec<Item>>,
    consumed: Vec<Vec<Item>>,
}

impl PipelineReport {
    pub fn produced(&self) -> &[Vec<Item>] {
        &self.produced
    }

    pub fn consumed(&self) -> &[Vec<Item>] {
        &self.consumed
    }

    pub fn total_produced(&self) -> usize {
        self.produced.iter().map(Vec::len).sum()
    }

    pub fn total_consumed(&self) -> usize {
        self.consumed.iter().map(Vec::len).sum()
    }

    /// True if every produced item was consumed exactly once, and nothing else was consumed.
    pub fn is_exactly_once(&self) -> bool {
        let mut produced = self.produced.iter().flatten().copied().collect::<Vec<_>>();
        let mut consumed = self.consumed.iter().flatten().copied().collect::<Vec<_>>();
        produced.sort_unstable();
        consumed.sort_unstable();
        produced == consumed
    }
}

/// Run a whole pipeline over a fresh bounded crossbeam channel.
pub fn run_pipeline(config: &PipelineConfig) -> Result<PipelineReport> {
    let capacity =
        NonZeroUsize::new(config.channel_capacity).ok_or_else(Error::zero_capacity)?;
    run_pipeline_on(config, &CrossbeamChannel::bounded(capacity))
}

/// Run a whole pipeline over `channel`, which should start out empty.
///
/// Producer and consumer panics are propagated to the caller.  If any producer or consumer fails, every other worker
/// is cancelled so that the run still ends, and the failure which started the shutdown is returned.
///
/// The channel must deliver in FIFO order and must not already hold a [POISON_PILL].
pub fn run_pipeline_on<C: Channel + ?Sized>(
    config: &PipelineConfig,
    channel: &C,
) -> Result<PipelineReport> {
    config.validate()?;
    let producers = config.make_producers()?;
    let consumers = config.make_consumers()?;
    let shutdown = &CancelToken::new();

    thread::scope(|s| -> Result<PipelineReport> {
        let producer_threads = producers
            .iter()
            .map(|p| {
                s.spawn(move || cancel_on_failure(shutdown, || p.run_cancellable(channel, shutdown)))
            })
            .collect::<Vec<_>>();
        let consumer_threads = consumers
            .iter()
            .map(|c| {
                s.spawn(move || cancel_on_failure(shutdown, || c.run_cancellable(channel, shutdown)))
            })
            .collect::<Vec<_>>();

        let produced = producer_threads
            .into_iter()
            .map(|h| h.join())
            .collect::<Vec<_>>();
        log::debug!(
            "All {} producers finished; sending {} poison pills",
            produced.len(),
            consumer_threads.len()
        );

        let pills = (0..consumer_threads.len())
            .try_for_each(|_| channel.put_cancellable(POISON_PILL, shutdown));
        if pills.is_err() {
            shutdown.cancel();
        }

        let consumed = consumer_threads
            .into_iter()
            .map(|h| h.join())
            .collect::<Vec<_>>();
        log::debug!("All {} consumers finished", consumed.len());

        let mut lists = vec![];
        let mut errors = vec![];
        for outcome in produced.into_iter().chain(consumed) {
            match outcome {
                Ok(Ok(list)) => lists.push(list),
                Ok(Err(e)) => errors.push(e),
                Err(payload) => panic::resume_unwind(payload),
            }
        }
        errors.extend(pills.err());

        if let Some(e) = root_cause(errors) {
            log::debug!("Pipeline shut down early: {}", e);
            return Err(e);
        }

        let consumed = lists.split_off(producers.len());
        Ok(PipelineReport {
            produced: lists,
            consumed,
        })
    })
}

/// Run one worker, cancelling `shutdown` if it fails or panics.
fn cancel_on_failure(
    shutdown: &CancelToken,
    work: impl FnOnce() -> Result<Vec<Item>>,
) -> Result<Vec<Item>> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(work));
    if !matches!(outcome, Ok(Ok(_))) {
        shutdown.cancel();
    }
    outcome.unwrap_or_else(|payload| panic::resume_unwind(payload))
}

/// The error which started a shutdown, in preference to the cancellations it caused.
fn root_cause(mut errors: Vec<Error>) -> Option<Error> {
    let index = errors.iter().position(|e| !e.is_cancelled()).unwrap_or(0);
    (!errors.is_empty()).then(|| errors.swap_remove(index))
}
