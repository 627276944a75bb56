// Schema History Records
//
// A history record is one schema-change event, stored as a single
// self-describing JSON document. Field order is preserved so the
// serialized form is stable across encode/parse cycles.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod store;

pub use store::{DatabaseHistory, HistoryError};

/// Ordered JSON object used for record fields such as `source` and `position`.
pub type Document = Map<String, Value>;

pub const SOURCE: &str = "source";
pub const POSITION: &str = "position";
pub const DATABASE_NAME: &str = "databaseName";
pub const DDL_STATEMENTS: &str = "ddl";

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("malformed history record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("history record must be a JSON object, found {0}")]
    NotAnObject(&'static str),
}

/// One recorded schema change.
///
/// Immutable once built. The connector produces one per DDL event; the
/// recoverer rebuilds them from log payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryRecord {
    document: Document,
}

impl HistoryRecord {
    pub fn new(
        source: Document,
        position: Document,
        database_name: Option<&str>,
        ddl: Option<&str>,
    ) -> Self {
        let mut document = Document::new();
        document.insert(SOURCE.into(), Value::Object(source));
        document.insert(POSITION.into(), Value::Object(position));
        if let Some(name) = database_name {
            document.insert(DATABASE_NAME.into(), Value::String(name.into()));
        }
        if let Some(ddl) = ddl {
            document.insert(DDL_STATEMENTS.into(), Value::String(ddl.into()));
        }
        Self { document }
    }

    /// Parse a log payload back into a record.
    pub fn parse(payload: &str) -> Result<Self, RecordError> {
        match serde_json::from_str::<Value>(payload)? {
            Value::Object(document) => Ok(Self { document }),
            other => Err(RecordError::NotAnObject(json_kind(&other))),
        }
    }

    /// Serialize to the single-line payload stored on the log.
    pub fn to_payload(&self) -> String {
        // A Map of Values always serializes.
        Value::Object(self.document.clone()).to_string()
    }

    pub fn source(&self) -> Option<&Document> {
        self.document.get(SOURCE).and_then(Value::as_object)
    }

    pub fn position(&self) -> Option<&Document> {
        self.document.get(POSITION).and_then(Value::as_object)
    }

    pub fn database_name(&self) -> Option<&str> {
        self.document.get(DATABASE_NAME).and_then(Value::as_str)
    }

    pub fn ddl(&self) -> Option<&str> {
        self.document.get(DDL_STATEMENTS).and_then(Value::as_str)
    }
}

impl fmt::Display for HistoryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_payload())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn payload_keeps_field_order() {
        let record = HistoryRecord::new(
            doc(json!({"server": "db1"})),
            doc(json!({"file": "binlog.000003", "pos": 154})),
            Some("inventory"),
            Some("CREATE TABLE products (id INT)"),
        );

        assert_eq!(
            record.to_payload(),
            r#"{"source":{"server":"db1"},"position":{"file":"binlog.000003","pos":154},"databaseName":"inventory","ddl":"CREATE TABLE products (id INT)"}"#
        );
    }

    #[test]
    fn parse_restores_accessors() {
        let payload = r#"{"source":{"server":"db1"},"position":{"pos":7},"databaseName":"shop","ddl":"DROP TABLE t"}"#;
        let record = HistoryRecord::parse(payload).unwrap();

        assert_eq!(record.source().unwrap()["server"], json!("db1"));
        assert_eq!(record.database_name(), Some("shop"));
        assert_eq!(record.ddl(), Some("DROP TABLE t"));
        assert_eq!(record.position().unwrap()["pos"], json!(7));
        assert_eq!(record.to_payload(), payload);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let record = HistoryRecord::new(Document::new(), Document::new(), None, None);

        assert_eq!(record.to_payload(), r#"{"source":{},"position":{}}"#);
        assert_eq!(record.ddl(), None);
        assert_eq!(record.database_name(), None);
    }

    #[test]
    fn rejects_garbage_and_non_objects() {
        assert!(matches!(
            HistoryRecord::parse("{not json"),
            Err(RecordError::Malformed(_))
        ));
        assert!(matches!(
            HistoryRecord::parse("[1, 2]"),
            Err(RecordError::NotAnObject("an array"))
        ));
    }
}
