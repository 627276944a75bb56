// Append-Only Log Broker Seam
//
// The history writer and recoverer talk to a durable, partitioned log
// through these traits only. Concrete brokers live in submodules.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::ClientConfig;

pub mod file;
pub mod memory;

pub use file::FileBroker;
pub use memory::{AckMode, MemoryBroker};

/// The only partition the schema history ever uses.
pub const HISTORY_PARTITION: i32 = 0;

/// How often a blocked acknowledgment wait re-checks the shutdown signal.
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("unknown partition {partition} for topic '{topic}'")]
    UnknownPartition { topic: String, partition: i32 },

    #[error("invalid topic name '{0}'")]
    InvalidTopic(String),

    #[error("client is closed")]
    Closed,

    #[error("consumer is not subscribed to any topic")]
    NotSubscribed,

    #[error("invalid client setting `{key}`: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("record rejected: {0}")]
    Rejected(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Why an acknowledgment never arrived.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("interrupted while waiting for acknowledgment")]
    Interrupted,

    #[error("delivery failed: {0}")]
    Failed(#[source] BrokerError),
}

/// An append request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub partition: i32,
    pub key: Option<String>,
    pub payload: String,
}

impl ProducerRecord {
    /// Keyless record for an explicit partition.
    pub fn new(topic: impl Into<String>, partition: i32, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            key: None,
            payload: payload.into(),
        }
    }
}

/// Where the broker placed an acknowledged record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: u64,
}

/// An entry handed back by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedEntry {
    pub topic: String,
    pub partition: i32,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: String,
}

/// Cooperative cancellation for blocking acknowledgment waits.
///
/// Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct DeliverySlot {
    result: Mutex<Option<Result<RecordMetadata, BrokerError>>>,
    ready: Condvar,
}

impl DeliverySlot {
    fn fill(&self, result: Result<RecordMetadata, BrokerError>) {
        *self.result.lock() = Some(result);
        self.ready.notify_all();
    }
}

/// Broker-side half of a pending acknowledgment.
///
/// Dropping it without completing resolves the handle with
/// [`BrokerError::Closed`], so no waiter is left hanging on a dead client.
pub struct DeliveryCompleter {
    slot: Option<Arc<DeliverySlot>>,
}

impl DeliveryCompleter {
    pub fn complete(mut self, result: Result<RecordMetadata, BrokerError>) {
        if let Some(slot) = self.slot.take() {
            slot.fill(result);
        }
    }
}

impl Drop for DeliveryCompleter {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.fill(Err(BrokerError::Closed));
        }
    }
}

/// Caller-side half of a pending acknowledgment.
pub struct DeliveryHandle {
    slot: Arc<DeliverySlot>,
}

impl DeliveryHandle {
    /// A pending acknowledgment and the completer that resolves it.
    pub fn pending() -> (DeliveryCompleter, DeliveryHandle) {
        let slot = Arc::new(DeliverySlot::default());
        (
            DeliveryCompleter {
                slot: Some(slot.clone()),
            },
            DeliveryHandle { slot },
        )
    }

    /// An acknowledgment that is already resolved.
    pub fn resolved(result: Result<RecordMetadata, BrokerError>) -> Self {
        let slot = Arc::new(DeliverySlot::default());
        slot.fill(result);
        DeliveryHandle { slot }
    }

    /// Block until the broker answers, with no timeout.
    ///
    /// The only way out without an answer is `shutdown` being triggered.
    pub fn wait(self, shutdown: &ShutdownSignal) -> Result<RecordMetadata, DeliveryError> {
        let mut guard = self.slot.result.lock();
        loop {
            if let Some(result) = guard.take() {
                return result.map_err(DeliveryError::Failed);
            }
            if shutdown.is_triggered() {
                return Err(DeliveryError::Interrupted);
            }
            self.slot.ready.wait_for(&mut guard, SHUTDOWN_CHECK_INTERVAL);
        }
    }
}

/// Write side of the log.
///
/// A producer is shared across threads; appends from concurrent callers are
/// ordered by the broker.
pub trait LogProducer: Send + Sync {
    /// Submit an append. The returned handle resolves on acknowledgment.
    fn send(&self, record: ProducerRecord) -> Result<DeliveryHandle, BrokerError>;

    /// Push out anything buffered client-side.
    fn flush(&self) -> Result<(), BrokerError>;

    fn close(&self) -> Result<(), BrokerError>;
}

/// Read side of the log.
pub trait LogConsumer: Send {
    fn subscribe(&mut self, topics: &[&str]) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for entries past the current read position.
    ///
    /// Entries of one partition come back in offset order.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedEntry>, BrokerError>;

    fn close(&mut self) -> Result<(), BrokerError>;
}

/// Builds producer and consumer handles from client settings.
pub trait LogClientFactory: Send + Sync {
    type Producer: LogProducer + 'static;
    type Consumer: LogConsumer;

    fn create_producer(&self, config: &ClientConfig) -> Result<Self::Producer, BrokerError>;

    fn create_consumer(&self, config: &ClientConfig) -> Result<Self::Consumer, BrokerError>;
}

/// Consumer that is closed when it goes out of scope.
pub struct ScopedConsumer<C: LogConsumer> {
    inner: C,
}

impl<C: LogConsumer> ScopedConsumer<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C: LogConsumer> Deref for ScopedConsumer<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.inner
    }
}

impl<C: LogConsumer> DerefMut for ScopedConsumer<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.inner
    }
}

impl<C: LogConsumer> Drop for ScopedConsumer<C> {
    fn drop(&mut self) {
        if let Err(err) = self.inner.close() {
            tracing::warn!(error = %err, "failed to close history consumer");
        }
    }
}
