// History Configuration
//
// Reads the flat `database.history.*` property namespace, validates it,
// and derives the producer and consumer client settings.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TOPIC: &str = "database.history.kafka.topic";
pub const BOOTSTRAP_SERVERS: &str = "database.history.kafka.bootstrap.servers";
pub const RECOVERY_POLL_INTERVAL_MS: &str = "database.history.kafka.recovery.poll.interval.ms";
pub const RECOVERY_POLL_ATTEMPTS: &str = "database.history.kafka.recovery.attempts";
pub const NAME: &str = "database.history.name";

const CONSUMER_PREFIX: &str = "database.history.consumer.";
const PRODUCER_PREFIX: &str = "database.history.producer.";

pub const DEFAULT_POLL_INTERVAL_MS: u32 = 100;
pub const DEFAULT_RECOVERY_ATTEMPTS: u32 = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid history configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Flat key/value settings handed to a broker client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    props: BTreeMap<String, String>,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    /// Parse a setting, falling back to `default` when it is absent.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, String> {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| format!("`{key}` has unparseable value '{raw}'")),
            None => Ok(default),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.props.insert(key.into(), value.to_string());
        self
    }

    /// Set `key` only if nothing has set it yet.
    pub fn set_default(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.props
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Renders with secrets replaced by `********`.
    pub fn masked(&self) -> MaskedConfig<'_> {
        MaskedConfig(self)
    }

    fn subset(props: &BTreeMap<String, String>, prefix: &str) -> Self {
        let props = props
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(prefix).map(|k| (k.to_string(), v.clone())))
            .collect();
        Self { props }
    }
}

pub struct MaskedConfig<'a>(&'a ClientConfig);

impl fmt::Display for MaskedConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let lower = key.to_ascii_lowercase();
            if lower.contains("password") || lower.contains("secret") {
                write!(f, "{key}=********")?;
            } else {
                write!(f, "{key}={value}")?;
            }
        }
        f.write_str("}")
    }
}

/// Validated settings for a topic-backed database history.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub topic: String,
    pub bootstrap_servers: String,
    pub name: String,
    pub poll_interval: Duration,
    pub recovery_attempts: u32,
    pub consumer: ClientConfig,
    pub producer: ClientConfig,
}

impl HistoryConfig {
    /// Configuration with defaults for everything but topic and brokers.
    pub fn new(topic: impl Into<String>, bootstrap_servers: impl Into<String>) -> Self {
        Self::assemble(
            topic.into(),
            bootstrap_servers.into(),
            None,
            DEFAULT_POLL_INTERVAL_MS,
            DEFAULT_RECOVERY_ATTEMPTS,
            &BTreeMap::new(),
        )
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_recovery_attempts(mut self, attempts: u32) -> Self {
        self.recovery_attempts = attempts;
        self
    }

    /// Build from `database.history.*` properties.
    ///
    /// Every problem is logged and collected, not just the first one.
    pub fn from_properties(props: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();

        let topic = required(props, TOPIC, &mut problems);
        let bootstrap_servers = required(props, BOOTSTRAP_SERVERS, &mut problems);
        let poll_interval_ms = integer(
            props,
            RECOVERY_POLL_INTERVAL_MS,
            DEFAULT_POLL_INTERVAL_MS,
            &mut problems,
        );
        let recovery_attempts = integer(
            props,
            RECOVERY_POLL_ATTEMPTS,
            DEFAULT_RECOVERY_ATTEMPTS,
            &mut problems,
        );

        if !problems.is_empty() {
            for problem in &problems {
                tracing::error!("{problem}");
            }
            return Err(ConfigError::Invalid(problems));
        }

        Ok(Self::assemble(
            topic,
            bootstrap_servers,
            props.get(NAME).cloned(),
            poll_interval_ms,
            recovery_attempts,
            props,
        ))
    }

    fn assemble(
        topic: String,
        bootstrap_servers: String,
        name: Option<String>,
        poll_interval_ms: u32,
        recovery_attempts: u32,
        props: &BTreeMap<String, String>,
    ) -> Self {
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut consumer = ClientConfig::subset(props, CONSUMER_PREFIX);
        consumer
            .set_default("bootstrap.servers", &bootstrap_servers)
            .set_default("client.id", &name)
            .set_default("group.id", &name)
            .set_default("fetch.min.bytes", 1)
            .set_default("enable.auto.commit", false)
            .set_default("session.timeout.ms", 30_000)
            .set_default("auto.offset.reset", "earliest");

        let mut producer = ClientConfig::subset(props, PRODUCER_PREFIX);
        producer
            .set_default("bootstrap.servers", &bootstrap_servers)
            .set_default("client.id", &name)
            .set_default("acks", 1)
            // May duplicate records; recovery tolerates that.
            .set_default("retries", 1)
            .set_default("batch.size", 32 * 1024)
            .set_default("linger.ms", 0)
            .set_default("buffer.memory", 1024 * 1024);

        Self {
            topic,
            bootstrap_servers,
            name,
            poll_interval: Duration::from_millis(u64::from(poll_interval_ms)),
            recovery_attempts,
            consumer,
            producer,
        }
    }
}

fn required(props: &BTreeMap<String, String>, key: &str, problems: &mut Vec<String>) -> String {
    match props.get(key).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => {
            problems.push(format!("`{key}` is required"));
            String::new()
        }
    }
}

/// Non-negative value that fits a signed 32-bit integer.
fn integer(
    props: &BTreeMap<String, String>,
    key: &str,
    default: u32,
    problems: &mut Vec<String>,
) -> u32 {
    let Some(raw) = props.get(key) else {
        return default;
    };
    match raw.trim().parse::<u32>() {
        Ok(value) if i32::try_from(value).is_ok() => value,
        _ => {
            problems.push(format!("`{key}` must be a non-negative integer, got '{raw}'"));
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_applied() {
        let config = HistoryConfig::from_properties(&props(&[
            (TOPIC, "schema-changes"),
            (BOOTSTRAP_SERVERS, "broker:9092"),
            (NAME, "inventory-history"),
        ]))
        .unwrap();

        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.recovery_attempts, 4);
        assert_eq!(config.consumer.get("group.id"), Some("inventory-history"));
        assert_eq!(config.consumer.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.consumer.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.producer.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(config.producer.get("batch.size"), Some("32768"));
    }

    #[test]
    fn pass_through_overrides_defaults() {
        let config = HistoryConfig::from_properties(&props(&[
            (TOPIC, "t"),
            (BOOTSTRAP_SERVERS, "b:9092"),
            ("database.history.consumer.max.poll.records", "10"),
            ("database.history.producer.acks", "all"),
        ]))
        .unwrap();

        assert_eq!(config.consumer.get("max.poll.records"), Some("10"));
        assert_eq!(config.producer.get("acks"), Some("all"));
    }

    #[test]
    fn missing_name_gets_a_random_identity() {
        let a = HistoryConfig::new("t", "b:9092");
        let b = HistoryConfig::new("t", "b:9092");

        assert_ne!(a.name, b.name);
        assert_eq!(a.consumer.get("client.id"), Some(a.name.as_str()));
    }

    #[test]
    fn all_problems_are_reported() {
        let err = HistoryConfig::from_properties(&props(&[(RECOVERY_POLL_ATTEMPTS, "-3")]))
            .unwrap_err();

        let ConfigError::Invalid(problems) = err;
        assert_eq!(problems.len(), 3);
        assert!(problems[0].contains(TOPIC));
        assert!(problems[1].contains(BOOTSTRAP_SERVERS));
        assert!(problems[2].contains(RECOVERY_POLL_ATTEMPTS));
    }

    #[test]
    fn integers_beyond_i32_are_rejected() {
        let err = HistoryConfig::from_properties(&props(&[
            (TOPIC, "t"),
            (BOOTSTRAP_SERVERS, "b:9092"),
            (RECOVERY_POLL_INTERVAL_MS, "18446744073709551615"),
            (RECOVERY_POLL_ATTEMPTS, "2147483648"),
        ]))
        .unwrap_err();

        let ConfigError::Invalid(problems) = err;
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains(RECOVERY_POLL_INTERVAL_MS));
        assert!(problems[1].contains(RECOVERY_POLL_ATTEMPTS));

        let config = HistoryConfig::from_properties(&props(&[
            (TOPIC, "t"),
            (BOOTSTRAP_SERVERS, "b:9092"),
            (RECOVERY_POLL_INTERVAL_MS, "2147483647"),
        ]))
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(2_147_483_647));
    }

    #[test]
    fn masked_hides_secrets() {
        let mut config = ClientConfig::new();
        config
            .set("sasl.password", "hunter2")
            .set("client.id", "history");

        assert_eq!(
            config.masked().to_string(),
            "{client.id=history, sasl.password=********}"
        );
    }
}
