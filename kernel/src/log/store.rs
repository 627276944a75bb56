// Database History Storage Abstraction
//
// Defines the contract a connector uses to remember DDL evolution
// across restarts. Backends may persist to a log topic, files, etc.

use super::{Document, HistoryRecord};
use crate::broker::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// `store` was called before `start`. This is a caller bug.
    #[error("no producer is available; call start() before storing database history records")]
    NotStarted,

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Storage backend for the schema history.
///
/// Properties required from implementations:
/// - Append-only
/// - Ordered: records are recovered in the order they were recorded
/// - Recovery replays from the very first record
///
/// Implementations MAY deliver duplicates during recovery.
pub trait DatabaseHistory {
    /// Acquire the resources needed to record changes.
    fn start(&self) -> Result<(), HistoryError>;

    /// Record one schema change.
    fn record(
        &self,
        source: Document,
        position: Document,
        database_name: Option<&str>,
        ddl: &str,
    ) -> Result<(), HistoryError>;

    /// Replay every stored record, in order, into `schema` through `apply`.
    ///
    /// The schema is never inspected here; it is only handed to `apply`.
    fn recover<S, F>(&self, schema: &mut S, apply: F) -> Result<(), HistoryError>
    where
        F: FnMut(&mut S, HistoryRecord);

    /// Release resources. Safe to call without a prior `start`.
    fn stop(&self) -> Result<(), HistoryError>;
}
