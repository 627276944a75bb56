// Topic-Backed Database History
//
// Stores each schema change as one entry on partition 0 of a log topic
// and rebuilds the history by replaying that topic from the start.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::broker::{
    DeliveryError, LogClientFactory, LogConsumer, LogProducer, ProducerRecord, RecordMetadata,
    ScopedConsumer, ShutdownSignal, HISTORY_PARTITION,
};
use crate::config::HistoryConfig;
use crate::log::{DatabaseHistory, Document, HistoryError, HistoryRecord};
use crate::replay::{replay_history, ReplaySettings, ReplaySummary};

/// Result of a `store_record` call that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The broker acknowledged the append.
    Acknowledged(RecordMetadata),
    /// The wait ended without an acknowledgment. The record may or may not
    /// be on the log; the failure has already been logged.
    Unconfirmed,
}

/// Database history persisted on a single-partition log topic.
///
/// Recovery is expected to finish before the first `store_record` after a
/// restart. Nothing here enforces that.
pub struct TopicDatabaseHistory<F: LogClientFactory> {
    config: HistoryConfig,
    factory: F,
    // Publication guard for the producer handle: readers see either no
    // producer or a fully built one. It does not serialize appends.
    producer: RwLock<Option<Arc<F::Producer>>>,
    shutdown: ShutdownSignal,
}

impl<F: LogClientFactory> TopicDatabaseHistory<F> {
    pub fn new(config: HistoryConfig, factory: F) -> Self {
        tracing::info!(
            "database history consumer config: {}",
            config.consumer.masked()
        );
        tracing::info!(
            "database history producer config: {}",
            config.producer.masked()
        );
        Self {
            config,
            factory,
            producer: RwLock::new(None),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Use `signal` to interrupt acknowledgment waits.
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = signal;
        self
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn is_started(&self) -> bool {
        self.producer.read().is_some()
    }

    /// Create the producer. Repeated calls keep the existing one.
    pub fn start(&self) -> Result<(), HistoryError> {
        let mut slot = self.producer.write();
        if slot.is_none() {
            let producer = self.factory.create_producer(&self.config.producer)?;
            *slot = Some(Arc::new(producer));
        }
        Ok(())
    }

    /// Append one record and block until the broker acknowledges it.
    ///
    /// There is no timeout. The wait ends early only when the shutdown
    /// signal fires; that case and a broker-reported delivery failure are
    /// logged and returned as [`StoreOutcome::Unconfirmed`], never retried.
    pub fn store_record(&self, record: &HistoryRecord) -> Result<StoreOutcome, HistoryError> {
        let producer = self
            .producer
            .read()
            .clone()
            .ok_or(HistoryError::NotStarted)?;
        tracing::trace!(%record, "Storing record into database history");

        let request = ProducerRecord::new(
            self.config.topic.clone(),
            HISTORY_PARTITION,
            record.to_payload(),
        );
        let ack = producer.send(request)?;
        if let Err(err) = producer.flush() {
            tracing::warn!(error = %err, "flush of database history producer failed");
        }

        match ack.wait(&self.shutdown) {
            Ok(metadata) => {
                tracing::debug!(
                    "Stored record in topic '{}' partition {} at offset {}",
                    metadata.topic,
                    metadata.partition,
                    metadata.offset
                );
                Ok(StoreOutcome::Acknowledged(metadata))
            }
            Err(DeliveryError::Interrupted) => {
                tracing::error!(
                    %record,
                    "Interrupted while waiting for response to storing record into database history"
                );
                Ok(StoreOutcome::Unconfirmed)
            }
            Err(DeliveryError::Failed(err)) => {
                tracing::error!(
                    %record,
                    error = %err,
                    "Error while storing database history record"
                );
                Ok(StoreOutcome::Unconfirmed)
            }
        }
    }

    /// Replay the whole topic into `sink`, oldest entry first.
    ///
    /// Ends after `recovery_attempts` consecutive empty polls of
    /// `poll_interval` each. Entries that show up later than that are
    /// silently left out.
    pub fn recover_records<S>(&self, sink: S) -> Result<ReplaySummary, HistoryError>
    where
        S: FnMut(HistoryRecord),
    {
        let consumer = self.factory.create_consumer(&self.config.consumer)?;
        let mut consumer = ScopedConsumer::new(consumer);
        tracing::debug!(
            "Subscribing to database history topic '{}' partition {} at offset 0",
            self.config.topic,
            HISTORY_PARTITION
        );
        consumer.subscribe(&[self.config.topic.as_str()])?;

        let settings = ReplaySettings {
            poll_interval: self.config.poll_interval,
            max_attempts: self.config.recovery_attempts,
        };
        let summary = replay_history(&mut *consumer, settings, sink);
        tracing::info!(
            recovered = summary.recovered,
            skipped = summary.skipped,
            polls = summary.polls,
            "database history recovered from topic '{}'",
            self.config.topic
        );
        Ok(summary)
    }

    /// Flush and release the producer. Safe without a prior `start`.
    pub fn stop(&self) -> Result<(), HistoryError> {
        let Some(producer) = self.producer.write().take() else {
            return Ok(());
        };
        let flushed = producer.flush();
        let closed = producer.close();
        flushed?;
        closed?;
        Ok(())
    }
}

impl<F: LogClientFactory> DatabaseHistory for TopicDatabaseHistory<F> {
    fn start(&self) -> Result<(), HistoryError> {
        TopicDatabaseHistory::start(self)
    }

    fn record(
        &self,
        source: Document,
        position: Document,
        database_name: Option<&str>,
        ddl: &str,
    ) -> Result<(), HistoryError> {
        let record = HistoryRecord::new(source, position, database_name, Some(ddl));
        self.store_record(&record).map(|_| ())
    }

    fn recover<S, A>(&self, schema: &mut S, mut apply: A) -> Result<(), HistoryError>
    where
        A: FnMut(&mut S, HistoryRecord),
    {
        self.recover_records(|record| apply(schema, record)).map(|_| ())
    }

    fn stop(&self) -> Result<(), HistoryError> {
        TopicDatabaseHistory::stop(self)
    }
}

impl<F: LogClientFactory> fmt::Display for TopicDatabaseHistory<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "topic {}:{} using brokers at {}",
            self.config.topic, HISTORY_PARTITION, self.config.bootstrap_servers
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AckMode, BrokerError, MemoryBroker};
    use serde_json::json;
    use std::thread;
    use std::time::{Duration, Instant};

    fn history(broker: &MemoryBroker) -> TopicDatabaseHistory<MemoryBroker> {
        let config = HistoryConfig::new("schema-changes", "localhost:9092")
            .with_poll_interval(Duration::from_millis(10))
            .with_recovery_attempts(3);
        TopicDatabaseHistory::new(config, broker.clone())
    }

    fn record(ddl: &str) -> HistoryRecord {
        let position = json!({"pos": ddl.len()}).as_object().cloned().unwrap();
        HistoryRecord::new(Document::new(), position, Some("db"), Some(ddl))
    }

    #[test]
    fn store_before_start_fails_without_touching_the_broker() {
        let broker = MemoryBroker::new();
        let history = history(&broker);

        let err = history.store_record(&record("CREATE TABLE a (x INT)")).unwrap_err();

        assert!(matches!(err, HistoryError::NotStarted));
        assert_eq!(broker.producers_created(), 0);
        assert!(broker.payloads("schema-changes", 0).is_empty());
    }

    #[test]
    fn start_is_idempotent_and_stop_is_safe_without_start() {
        let broker = MemoryBroker::new();
        let history = history(&broker);

        history.stop().unwrap();
        history.start().unwrap();
        history.start().unwrap();
        assert_eq!(broker.producers_created(), 1);

        history.stop().unwrap();
        assert!(!history.is_started());
        history.stop().unwrap();
    }

    #[test]
    fn store_targets_partition_zero() {
        let broker = MemoryBroker::new();
        broker.create_topic("schema-changes", 3);
        let history = history(&broker);
        history.start().unwrap();

        let outcome = history.store_record(&record("CREATE TABLE a (x INT)")).unwrap();

        let metadata = match outcome {
            StoreOutcome::Acknowledged(metadata) => metadata,
            other => panic!("expected an acknowledgment, got {other:?}"),
        };
        assert_eq!(metadata.partition, 0);
        assert_eq!(metadata.offset, 0);
        assert_eq!(broker.payloads("schema-changes", 1).len(), 0);
    }

    #[test]
    fn broker_failure_is_logged_not_raised() {
        let broker = MemoryBroker::new();
        broker.set_ack_mode(AckMode::Fail("not enough replicas".into()));
        let history = history(&broker);
        history.start().unwrap();

        let outcome = history.store_record(&record("DROP TABLE a")).unwrap();

        assert_eq!(outcome, StoreOutcome::Unconfirmed);
    }

    #[test]
    fn shutdown_interrupts_a_pending_store() {
        let broker = MemoryBroker::new();
        broker.set_ack_mode(AckMode::Withhold);
        let history = history(&broker);
        history.start().unwrap();

        let signal = history.shutdown_signal();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            signal.trigger();
        });

        let outcome = history.store_record(&record("DROP TABLE a")).unwrap();

        assert_eq!(outcome, StoreOutcome::Unconfirmed);
        // The entry reached the log even though its ack never did.
        assert_eq!(broker.payloads("schema-changes", 0).len(), 1);
    }

    #[test]
    fn store_after_stop_fails_again() {
        let broker = MemoryBroker::new();
        let history = history(&broker);
        history.start().unwrap();
        history.stop().unwrap();

        assert!(matches!(
            history.store_record(&record("DROP TABLE a")),
            Err(HistoryError::NotStarted)
        ));
    }

    #[test]
    fn recover_closes_its_consumer() {
        let broker = MemoryBroker::new();
        let history = history(&broker);

        let summary = history.recover_records(|_| {}).unwrap();

        assert_eq!(summary.recovered, 0);
        assert_eq!(summary.polls, 3);
        assert_eq!(broker.open_consumers(), 0);
    }

    #[test]
    fn recover_reports_consumer_setup_errors() {
        let broker = MemoryBroker::new();
        let mut config = HistoryConfig::new("schema-changes", "localhost:9092");
        config.consumer.set("max.poll.records", "lots");
        let history = TopicDatabaseHistory::new(config, broker.clone());

        let err = history.recover_records(|_| {}).unwrap_err();

        assert!(matches!(
            err,
            HistoryError::Broker(BrokerError::InvalidSetting { .. })
        ));
        assert_eq!(broker.open_consumers(), 0);
    }

    #[test]
    fn recover_threads_schema_through_apply() {
        let broker = MemoryBroker::new();
        let history = history(&broker);
        history.start().unwrap();
        history
            .record(Document::new(), Document::new(), Some("db"), "CREATE TABLE a (x INT)")
            .unwrap();
        history
            .record(Document::new(), Document::new(), Some("db"), "CREATE TABLE b (y INT)")
            .unwrap();

        let mut schema: Vec<String> = Vec::new();
        DatabaseHistory::recover(&history, &mut schema, |tables, record| {
            tables.push(record.ddl().unwrap_or_default().to_string());
        })
        .unwrap();

        assert_eq!(schema, vec!["CREATE TABLE a (x INT)", "CREATE TABLE b (y INT)"]);
    }

    #[test]
    fn recover_waits_for_quiescence() {
        let broker = MemoryBroker::new();
        let config = HistoryConfig::new("schema-changes", "localhost:9092")
            .with_poll_interval(Duration::from_millis(25))
            .with_recovery_attempts(4);
        let history = TopicDatabaseHistory::new(config, broker.clone());
        let writer = broker.clone();

        thread::spawn(move || {
            for i in 0..3 {
                thread::sleep(Duration::from_millis(20));
                writer
                    .append_raw("schema-changes", 0, format!(r#"{{"ddl":"late {i}"}}"#))
                    .unwrap();
            }
        });

        let started = Instant::now();
        let mut seen = Vec::new();
        history.recover_records(|r| seen.push(r)).unwrap();

        // Each append lands well inside the 100ms quiet window.
        assert_eq!(seen.len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn display_names_topic_and_brokers() {
        let broker = MemoryBroker::new();
        assert_eq!(
            history(&broker).to_string(),
            "topic schema-changes:0 using brokers at localhost:9092"
        );
    }
}
