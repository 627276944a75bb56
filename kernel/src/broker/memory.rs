// In-Process Log Broker
//
// Topics live in memory and are shared by every client built from the
// same broker. Used by tests and embedders that need no external broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{
    BrokerError, ConsumedEntry, DeliveryCompleter, DeliveryHandle, LogClientFactory, LogConsumer,
    LogProducer, ProducerRecord, RecordMetadata,
};
use crate::config::ClientConfig;

const DEFAULT_MAX_POLL_RECORDS: usize = 500;

/// How the broker answers appends.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Store and acknowledge right away.
    #[default]
    Immediate,
    /// Reject without storing.
    Fail(String),
    /// Store but hold the acknowledgment until released.
    Withhold,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    key: Option<String>,
    payload: String,
}

#[derive(Default)]
struct Topics {
    partitions: HashMap<String, Vec<Vec<StoredEntry>>>,
}

impl Topics {
    fn partition_mut(
        &mut self,
        topic: &str,
        partition: i32,
    ) -> Result<&mut Vec<StoredEntry>, BrokerError> {
        let partitions = self
            .partitions
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new()]);
        usize::try_from(partition)
            .ok()
            .and_then(|p| partitions.get_mut(p))
            .ok_or_else(|| BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })
    }
}

#[derive(Default)]
struct BrokerState {
    topics: Mutex<Topics>,
    appended: Condvar,
    ack_mode: Mutex<AckMode>,
    withheld: Mutex<Vec<(DeliveryCompleter, RecordMetadata)>>,
    open_consumers: AtomicUsize,
    producers_created: AtomicUsize,
}

/// Shared in-memory broker. Clones refer to the same topics.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `topic` with a fixed partition count. Topics that are written
    /// to without being created get a single partition.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut topics = self.state.topics.lock();
        topics
            .partitions
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1)]);
    }

    pub fn set_ack_mode(&self, mode: AckMode) {
        *self.state.ack_mode.lock() = mode;
    }

    /// Acknowledge every withheld append. Returns how many were released.
    pub fn release_withheld(&self) -> usize {
        let withheld: Vec<_> = self.state.withheld.lock().drain(..).collect();
        let count = withheld.len();
        for (completer, metadata) in withheld {
            completer.complete(Ok(metadata));
        }
        count
    }

    /// Append a payload directly, bypassing producers and ack handling.
    pub fn append_raw(
        &self,
        topic: &str,
        partition: i32,
        payload: impl Into<String>,
    ) -> Result<u64, BrokerError> {
        self.append(topic, partition, None, payload.into())
    }

    /// Payloads of one partition, in offset order.
    pub fn payloads(&self, topic: &str, partition: i32) -> Vec<String> {
        let topics = self.state.topics.lock();
        topics
            .partitions
            .get(topic)
            .and_then(|p| usize::try_from(partition).ok().and_then(|i| p.get(i)))
            .map(|entries| entries.iter().map(|e| e.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Consumers created and not yet closed.
    pub fn open_consumers(&self) -> usize {
        self.state.open_consumers.load(Ordering::SeqCst)
    }

    pub fn producers_created(&self) -> usize {
        self.state.producers_created.load(Ordering::SeqCst)
    }

    fn append(
        &self,
        topic: &str,
        partition: i32,
        key: Option<String>,
        payload: String,
    ) -> Result<u64, BrokerError> {
        let mut topics = self.state.topics.lock();
        let entries = topics.partition_mut(topic, partition)?;
        entries.push(StoredEntry { key, payload });
        let offset = (entries.len() - 1) as u64;
        drop(topics);
        self.state.appended.notify_all();
        Ok(offset)
    }
}

pub struct MemoryProducer {
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl LogProducer for MemoryProducer {
    fn send(&self, record: ProducerRecord) -> Result<DeliveryHandle, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }

        let mode = self.broker.state.ack_mode.lock().clone();
        if let AckMode::Fail(reason) = &mode {
            return Ok(DeliveryHandle::resolved(Err(BrokerError::Rejected(
                reason.clone(),
            ))));
        }

        let offset = self.broker.append(
            &record.topic,
            record.partition,
            record.key,
            record.payload,
        )?;
        let metadata = RecordMetadata {
            topic: record.topic,
            partition: record.partition,
            offset,
        };

        match mode {
            AckMode::Withhold => {
                let (completer, handle) = DeliveryHandle::pending();
                self.broker.state.withheld.lock().push((completer, metadata));
                Ok(handle)
            }
            _ => Ok(DeliveryHandle::resolved(Ok(metadata))),
        }
    }

    fn flush(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OffsetReset {
    Earliest,
    Latest,
}

pub struct MemoryConsumer {
    broker: MemoryBroker,
    topics: Vec<String>,
    positions: HashMap<(String, usize), usize>,
    max_poll_records: usize,
    reset: OffsetReset,
    closed: bool,
}

impl MemoryConsumer {
    fn pin_to_end(&mut self, topics: &Topics) {
        for topic in &self.topics {
            if let Some(partitions) = topics.partitions.get(topic) {
                for (partition, entries) in partitions.iter().enumerate() {
                    self.positions.insert((topic.clone(), partition), entries.len());
                }
            }
        }
    }

    fn fetch(&mut self, topics: &Topics) -> Vec<ConsumedEntry> {
        let mut batch = Vec::new();
        for topic in &self.topics {
            let Some(partitions) = topics.partitions.get(topic) else {
                continue;
            };
            for (partition, entries) in partitions.iter().enumerate() {
                let reset = self.reset;
                let position = self
                    .positions
                    .entry((topic.clone(), partition))
                    .or_insert_with(|| match reset {
                        OffsetReset::Earliest => 0,
                        OffsetReset::Latest => entries.len(),
                    });
                while *position < entries.len() && batch.len() < self.max_poll_records {
                    let entry = &entries[*position];
                    batch.push(ConsumedEntry {
                        topic: topic.clone(),
                        partition: partition as i32,
                        offset: *position as u64,
                        key: entry.key.clone(),
                        payload: entry.payload.clone(),
                    });
                    *position += 1;
                }
            }
        }
        batch
    }
}

impl LogConsumer for MemoryConsumer {
    fn subscribe(&mut self, topics: &[&str]) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        self.topics = topics.iter().map(|t| t.to_string()).collect();
        self.positions.clear();
        if self.reset == OffsetReset::Latest {
            let state = self.broker.state.clone();
            let guard = state.topics.lock();
            self.pin_to_end(&guard);
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedEntry>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        if self.topics.is_empty() {
            return Err(BrokerError::NotSubscribed);
        }

        let deadline = Instant::now() + timeout;
        let state = self.broker.state.clone();
        let mut topics = state.topics.lock();
        loop {
            let batch = self.fetch(&topics);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if state.appended.wait_until(&mut topics, deadline).timed_out() {
                return Ok(self.fetch(&topics));
            }
        }
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        if !self.closed {
            self.closed = true;
            self.broker.state.open_consumers.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl LogClientFactory for MemoryBroker {
    type Producer = MemoryProducer;
    type Consumer = MemoryConsumer;

    fn create_producer(&self, _config: &ClientConfig) -> Result<MemoryProducer, BrokerError> {
        self.state.producers_created.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryProducer {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn create_consumer(&self, config: &ClientConfig) -> Result<MemoryConsumer, BrokerError> {
        let max_poll_records = config
            .get_or("max.poll.records", DEFAULT_MAX_POLL_RECORDS)
            .map_err(|reason| BrokerError::InvalidSetting {
                key: "max.poll.records".into(),
                reason,
            })?
            .max(1);
        let reset = match config.get("auto.offset.reset").unwrap_or("latest") {
            "earliest" => OffsetReset::Earliest,
            "latest" => OffsetReset::Latest,
            other => {
                return Err(BrokerError::InvalidSetting {
                    key: "auto.offset.reset".into(),
                    reason: format!("unsupported value '{other}'"),
                })
            }
        };

        self.state.open_consumers.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConsumer {
            broker: self.clone(),
            topics: Vec::new(),
            positions: HashMap::new(),
            max_poll_records,
            reset,
            closed: false,
        })
    }
}
