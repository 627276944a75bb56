// Histlog Kernel
//
// Durable schema-change history for change-data-capture connectors,
// stored on a single-partition log topic and rebuilt by replay.

pub mod broker;
pub mod config;
pub mod history;
pub mod log;
pub mod replay;

pub use history::{StoreOutcome, TopicDatabaseHistory};
pub use log::{DatabaseHistory, Document, HistoryError, HistoryRecord};
