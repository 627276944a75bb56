// File-Backed Log Broker
//
// Each topic is a directory and each partition a newline-delimited file
// (`<root>/<topic>/<partition>.log`). An entry's offset is its line index.
// Appends are buffered and acknowledged once the producer is flushed and
// the data is synced to disk.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{
    BrokerError, ConsumedEntry, DeliveryCompleter, DeliveryHandle, LogClientFactory, LogConsumer,
    LogProducer, ProducerRecord, RecordMetadata,
};
use crate::config::ClientConfig;

const DEFAULT_MAX_POLL_RECORDS: usize = 500;
const POLL_TICK: Duration = Duration::from_millis(10);
const LOG_SUFFIX: &str = ".log";

/// Broker rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FileBroker {
    root: PathBuf,
}

impl FileBroker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn topic_dir(&self, topic: &str) -> Result<PathBuf, BrokerError> {
        let legal = !topic.is_empty()
            && topic != "."
            && topic != ".."
            && topic
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !legal {
            return Err(BrokerError::InvalidTopic(topic.to_string()));
        }
        Ok(self.root.join(topic))
    }

    fn partition_path(&self, topic: &str, partition: i32) -> Result<PathBuf, BrokerError> {
        if partition < 0 {
            return Err(BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            });
        }
        Ok(self.topic_dir(topic)?.join(format!("{partition}{LOG_SUFFIX}")))
    }
}

struct PartitionWriter {
    file: BufWriter<File>,
    next_offset: u64,
}

impl PartitionWriter {
    fn open(path: &Path) -> Result<Self, BrokerError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let existing = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let mut next_offset = existing.iter().filter(|b| **b == b'\n').count() as u64;

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut file = BufWriter::new(file);

        // Terminate a torn trailing write so the next entry starts on its own line.
        if existing.last().is_some_and(|b| *b != b'\n') {
            file.write_all(b"\n")?;
            next_offset += 1;
        }

        Ok(Self { file, next_offset })
    }
}

#[derive(Default)]
struct ProducerState {
    writers: HashMap<(String, i32), PartitionWriter>,
    pending: Vec<(DeliveryCompleter, RecordMetadata)>,
}

pub struct FileProducer {
    broker: FileBroker,
    state: Mutex<ProducerState>,
    closed: AtomicBool,
}

impl FileProducer {
    fn flush_locked(state: &mut ProducerState) -> Result<(), BrokerError> {
        let synced = state.writers.values_mut().try_for_each(|writer| {
            writer.file.flush()?;
            writer.file.get_ref().sync_data()
        });

        let pending = std::mem::take(&mut state.pending);
        match synced {
            Ok(()) => {
                for (completer, metadata) in pending {
                    completer.complete(Ok(metadata));
                }
                Ok(())
            }
            Err(err) => {
                for (completer, _) in pending {
                    completer.complete(Err(BrokerError::Rejected(err.to_string())));
                }
                Err(err.into())
            }
        }
    }
}

impl LogProducer for FileProducer {
    fn send(&self, record: ProducerRecord) -> Result<DeliveryHandle, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if record.payload.contains('\n') {
            return Err(BrokerError::Rejected(
                "payload must not contain a line break".into(),
            ));
        }

        let mut state = self.state.lock();
        let key = (record.topic.clone(), record.partition);
        if !state.writers.contains_key(&key) {
            let path = self.broker.partition_path(&record.topic, record.partition)?;
            state.writers.insert(key.clone(), PartitionWriter::open(&path)?);
        }
        let Some(writer) = state.writers.get_mut(&key) else {
            return Err(BrokerError::Closed);
        };

        writer.file.write_all(record.payload.as_bytes())?;
        writer.file.write_all(b"\n")?;
        let metadata = RecordMetadata {
            topic: record.topic,
            partition: record.partition,
            offset: writer.next_offset,
        };
        writer.next_offset += 1;

        let (completer, handle) = DeliveryHandle::pending();
        state.pending.push((completer, metadata));
        Ok(handle)
    }

    fn flush(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Self::flush_locked(&mut self.state.lock())
    }

    fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.state.lock();
        let flushed = Self::flush_locked(&mut state);
        state.writers.clear();
        flushed
    }
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    byte: u64,
    offset: u64,
}

pub struct FileConsumer {
    broker: FileBroker,
    topics: Vec<String>,
    cursors: HashMap<(String, i32), Cursor>,
    max_poll_records: usize,
    from_earliest: bool,
    closed: bool,
}

impl FileConsumer {
    fn partitions(&self, topic: &str) -> Result<Vec<(i32, PathBuf)>, BrokerError> {
        let dir = self.broker.topic_dir(topic)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut partitions = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let partition = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(LOG_SUFFIX))
                .and_then(|n| n.parse::<i32>().ok());
            if let Some(partition) = partition {
                partitions.push((partition, path));
            }
        }
        partitions.sort_by_key(|(p, _)| *p);
        Ok(partitions)
    }

    fn fetch(&mut self) -> Result<Vec<ConsumedEntry>, BrokerError> {
        let mut batch = Vec::new();
        for topic in self.topics.clone() {
            for (partition, path) in self.partitions(&topic)? {
                if batch.len() >= self.max_poll_records {
                    return Ok(batch);
                }
                let cursor = match self.cursors.get(&(topic.clone(), partition)) {
                    Some(cursor) => *cursor,
                    None if self.from_earliest => Cursor { byte: 0, offset: 0 },
                    None => end_of(&path)?,
                };
                let cursor = read_entries(
                    &path,
                    &topic,
                    partition,
                    cursor,
                    self.max_poll_records,
                    &mut batch,
                )?;
                self.cursors.insert((topic.clone(), partition), cursor);
            }
        }
        Ok(batch)
    }
}

fn end_of(path: &Path) -> Result<Cursor, BrokerError> {
    let bytes = fs::read(path)?;
    let complete = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let offset = bytes[..complete].iter().filter(|b| **b == b'\n').count();
    Ok(Cursor {
        byte: complete as u64,
        offset: offset as u64,
    })
}

fn read_entries(
    path: &Path,
    topic: &str,
    partition: i32,
    mut cursor: Cursor,
    limit: usize,
    batch: &mut Vec<ConsumedEntry>,
) -> Result<Cursor, BrokerError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(cursor.byte))?;
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();

    while batch.len() < limit {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        // Stop at EOF or at a line still being written.
        if read == 0 || line.last() != Some(&b'\n') {
            break;
        }
        line.pop();
        batch.push(ConsumedEntry {
            topic: topic.to_string(),
            partition,
            offset: cursor.offset,
            key: None,
            payload: String::from_utf8_lossy(&line).into_owned(),
        });
        cursor.byte += read as u64;
        cursor.offset += 1;
    }
    Ok(cursor)
}

impl LogConsumer for FileConsumer {
    fn subscribe(&mut self, topics: &[&str]) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        for topic in topics {
            self.broker.topic_dir(topic)?;
        }
        self.topics = topics.iter().map(|t| t.to_string()).collect();
        self.cursors.clear();
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
        loop {
            let batch = self.fetch()?;
            let now = Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }
            thread::sleep(POLL_TICK.min(deadline - now));
        }
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        self.closed = true;
        self.cursors.clear();
        Ok(())
    }
}

impl LogClientFactory for FileBroker {
    type Producer = FileProducer;
    type Consumer = FileConsumer;

    fn create_producer(&self, _config: &ClientConfig) -> Result<FileProducer, BrokerError> {
        fs::create_dir_all(&self.root)?;
        Ok(FileProducer {
            broker: self.clone(),
            state: Mutex::new(ProducerState::default()),
            closed: AtomicBool::new(false),
        })
    }

    fn create_consumer(&self, config: &ClientConfig) -> Result<FileConsumer, BrokerError> {
        let max_poll_records = config
            .get_or("max.poll.records", DEFAULT_MAX_POLL_RECORDS)
            .map_err(|reason| BrokerError::InvalidSetting {
                key: "max.poll.records".into(),
                reason,
            })?
            .max(1);
        let from_earliest = match config.get("auto.offset.reset").unwrap_or("latest") {
            "earliest" => true,
            "latest" => false,
            other => {
                return Err(BrokerError::InvalidSetting {
                    key: "auto.offset.reset".into(),
                    reason: format!("unsupported value '{other}'"),
                })
            }
        };

        Ok(FileConsumer {
            broker: self.clone(),
            topics: Vec::new(),
            cursors: HashMap::new(),
            max_poll_records,
            from_earliest,
            closed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DeliveryError, ShutdownSignal};

    fn earliest() -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("auto.offset.reset", "earliest");
        config
    }

    #[test]
    fn ack_arrives_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let broker = FileBroker::new(dir.path());
        let producer = broker.create_producer(&ClientConfig::new()).unwrap();

        let first = producer.send(ProducerRecord::new("history", 0, "{}")).unwrap();
        let second = producer.send(ProducerRecord::new("history", 0, "[]")).unwrap();
        producer.flush().unwrap();

        let shutdown = ShutdownSignal::new();
        assert_eq!(first.wait(&shutdown).unwrap().offset, 0);
        assert_eq!(second.wait(&shutdown).unwrap().offset, 1);

        let contents = fs::read_to_string(dir.path().join("history").join("0.log")).unwrap();
        assert_eq!(contents, "{}\n[]\n");
    }

    #[test]
    fn offsets_continue_across_producers() {
        let dir = tempfile::tempdir().unwrap();
        let broker = FileBroker::new(dir.path());
        let shutdown = ShutdownSignal::new();

        for expected in 0..3u64 {
            let producer = broker.create_producer(&ClientConfig::new()).unwrap();
            let handle = producer.send(ProducerRecord::new("t", 0, "x")).unwrap();
            producer.close().unwrap();
            assert_eq!(handle.wait(&shutdown).unwrap().offset, expected);
        }
    }

    #[test]
    fn unflushed_ack_fails_when_producer_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let broker = FileBroker::new(dir.path());
        let producer = broker.create_producer(&ClientConfig::new()).unwrap();

        let handle = producer.send(ProducerRecord::new("t", 0, "x")).unwrap();
        drop(producer);

        let err = handle.wait(&ShutdownSignal::new()).unwrap_err();
        assert!(matches!(err, DeliveryError::Failed(BrokerError::Closed)));
    }

    #[test]
    fn consumer_skips_torn_tail_until_completed() {
        let dir = tempfile::tempdir().unwrap();
        let topic = dir.path().join("t");
        fs::create_dir_all(&topic).unwrap();
        fs::write(topic.join("0.log"), "one\ntw").unwrap();

        let broker = FileBroker::new(dir.path());
        let mut consumer = broker.create_consumer(&earliest()).unwrap();
        consumer.subscribe(&["t"]).unwrap();

        let batch = consumer.poll(Duration::from_millis(20)).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, "one");

        let mut file = OpenOptions::new().append(true).open(topic.join("0.log")).unwrap();
        file.write_all(b"o\n").unwrap();

        let batch = consumer.poll(Duration::from_millis(20)).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, "two");
        assert_eq!(batch[0].offset, 1);
    }

    #[test]
    fn rejects_illegal_topics_and_multiline_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let broker = FileBroker::new(dir.path());
        let producer = broker.create_producer(&ClientConfig::new()).unwrap();

        assert!(matches!(
            producer.send(ProducerRecord::new("../escape", 0, "x")).err(),
            Some(BrokerError::InvalidTopic(_))
        ));
        assert!(matches!(
            producer.send(ProducerRecord::new("t", 0, "a\nb")).err(),
            Some(BrokerError::Rejected(_))
        ));
    }
}
