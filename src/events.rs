//! The typed event stream produced by replication.
//!
//! Raw binlog events are normalized into [`DatabaseEvent`] values before the
//! capture coordinator sees them. Change events carry fully decoded row
//! images plus an order-preserving encoded row key; flush events mark commit
//! boundaries at which the cursor may be checkpointed.

use crate::state::{join_stream_id, StreamId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// Provenance attached to every change event.
///
/// `cursor` identifies the position of the change within the binlog
/// (`<logfile>:<offset>:<row>`); it is empty for backfill rows, which carry
/// `snapshot: true` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub schema: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cursor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub snapshot: bool,
}

/// A single decoded row-level change.
///
/// `before` is present for updates and deletes; `after` is present for
/// inserts and updates. `row_key` is the tuple encoding of the key-column
/// values, so byte-wise comparison against a `scanned` watermark respects
/// key order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub row_key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Map<String, Value>>,
    pub source: SourceMetadata,
}

impl ChangeEvent {
    pub fn stream_id(&self) -> StreamId {
        join_stream_id(&self.source.schema, &self.source.table)
    }

    /// The row image carrying the key columns: the after-image for inserts
    /// and updates, the before-image for deletes.
    pub fn key_fields(&self) -> Option<&Map<String, Value>> {
        match self.operation {
            ChangeOperation::Delete => self.before.as_ref(),
            _ => self.after.as_ref(),
        }
    }
}

/// Events delivered from the replication stream to the capture coordinator.
#[derive(Debug, Clone)]
pub enum DatabaseEvent {
    /// A decoded row-level change on some stream.
    Change(ChangeEvent),
    /// All prior events are part of a committed transaction; `cursor` may be
    /// checkpointed.
    Flush { cursor: String },
    /// The persisted column metadata for `stream_id` must be updated before
    /// any subsequent change event for that stream is decoded downstream.
    Metadata {
        stream_id: StreamId,
        metadata: Value,
    },
    /// The stream is alive but produced nothing that needs decoding.
    Keepalive,
    /// Replication for `stream_id` has become impossible.
    TableDrop { stream_id: StreamId, cause: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_event_stream_id() {
        let event = ChangeEvent {
            operation: ChangeOperation::Insert,
            row_key: vec![],
            before: None,
            after: Some(Map::new()),
            source: SourceMetadata {
                schema: "Public".to_string(),
                table: "Users".to_string(),
                cursor: "binlog.000001:4:0".to_string(),
                ts_ms: None,
                txid: None,
                snapshot: false,
            },
        };
        assert_eq!(event.stream_id(), "public.users");
    }

    #[test]
    fn test_key_fields_by_operation() {
        let mut before = Map::new();
        before.insert("id".to_string(), json!(1));
        let mut after = Map::new();
        after.insert("id".to_string(), json!(2));

        let mut event = ChangeEvent {
            operation: ChangeOperation::Delete,
            row_key: vec![],
            before: Some(before),
            after: Some(after),
            source: SourceMetadata {
                schema: "public".to_string(),
                table: "t".to_string(),
                cursor: String::new(),
                ts_ms: None,
                txid: None,
                snapshot: false,
            },
        };
        assert_eq!(event.key_fields().unwrap()["id"], json!(1));
        event.operation = ChangeOperation::Update;
        assert_eq!(event.key_fields().unwrap()["id"], json!(2));
    }
}
