//! In-memory buffering of backfill chunks.
//!
//! While a chunk is being synchronized against the replication stream, any
//! change that races ahead of the scan is patched into the buffered rows by
//! key. When the buffer is flushed, each stream's rows come back out in key
//! order as insert events, with the net effect of the patches applied, so
//! every row is emitted exactly once.

use crate::error::{Error, Result};
use crate::events::{ChangeEvent, ChangeOperation, SourceMetadata};
use crate::state::StreamId;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

#[derive(Debug)]
struct BackfillChunk {
    key_columns: Vec<String>,
    /// Buffered rows keyed by tuple-encoded row key, so iteration order is
    /// key order and the flush can emit rows strictly increasing.
    rows: BTreeMap<Vec<u8>, Map<String, Value>>,
    /// The key of the last row produced by the scan. Patches beyond this
    /// point belong to a later chunk (unless the chunk is final).
    scanned: Vec<u8>,
    complete: bool,
    schema: String,
    table: String,
}

/// The set of in-progress backfill chunks, one per stream.
#[derive(Debug, Default)]
pub struct ResultSet {
    streams: HashMap<StreamId, BackfillChunk>,
}

impl ResultSet {
    pub fn new() -> Self {
        ResultSet::default()
    }

    /// Installs a freshly scanned chunk for a stream. `complete` marks the
    /// chunk as the final one, meaning it covers the entire remaining key
    /// range of the table.
    pub fn buffer(
        &mut self,
        stream_id: &str,
        key_columns: &[String],
        events: Vec<ChangeEvent>,
        complete: bool,
    ) -> Result<()> {
        let mut chunk = BackfillChunk {
            key_columns: key_columns.to_vec(),
            rows: BTreeMap::new(),
            scanned: Vec::new(),
            complete,
            schema: String::new(),
            table: String::new(),
        };
        for event in events {
            if event.operation != ChangeOperation::Insert {
                return Err(Error::Consistency {
                    message: format!(
                        "scan of {stream_id:?} produced a {:?} event",
                        event.operation
                    ),
                });
            }
            let after = event.after.ok_or_else(|| Error::Consistency {
                message: format!("scan row for {stream_id:?} has no values"),
            })?;
            if event.row_key > chunk.scanned {
                chunk.scanned = event.row_key.clone();
            }
            chunk.schema = event.source.schema;
            chunk.table = event.source.table;
            chunk.rows.insert(event.row_key, after);
        }
        debug!(
            stream = stream_id,
            rows = chunk.rows.len(),
            complete = chunk.complete,
            "buffered backfill chunk"
        );
        self.streams.insert(stream_id.to_string(), chunk);
        Ok(())
    }

    /// Applies a replication event that raced ahead of the scan point.
    ///
    /// Events beyond the chunk's scan boundary are dropped: a later chunk
    /// will observe their effect directly. A final chunk has no boundary.
    pub fn patch(&mut self, stream_id: &str, event: &ChangeEvent) -> Result<()> {
        let Some(chunk) = self.streams.get_mut(stream_id) else {
            // No chunk buffered yet for this stream; the row will be picked
            // up by a future scan.
            return Ok(());
        };
        if !chunk.complete && event.row_key > chunk.scanned {
            return Ok(());
        }

        match event.operation {
            ChangeOperation::Insert => {
                let after = require_image(stream_id, event.after.as_ref())?;
                if chunk.rows.contains_key(&event.row_key) {
                    warn!(
                        stream = stream_id,
                        "insert patch overwrites an already-buffered row"
                    );
                }
                chunk.rows.insert(event.row_key.clone(), after.clone());
            }
            ChangeOperation::Update => {
                let after = require_image(stream_id, event.after.as_ref())?;
                chunk.rows.insert(event.row_key.clone(), after.clone());
            }
            ChangeOperation::Delete => {
                chunk.rows.remove(&event.row_key);
            }
        }
        Ok(())
    }

    /// The IDs of all buffered streams, sorted for deterministic flushing.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drains a stream's buffered rows in key order as insert events.
    /// Rows deleted by patches simply never existed for downstream.
    pub fn changes(&mut self, stream_id: &str) -> Vec<ChangeEvent> {
        let Some(chunk) = self.streams.get_mut(stream_id) else {
            return Vec::new();
        };
        let rows = std::mem::take(&mut chunk.rows);
        rows.into_iter()
            .map(|(row_key, after)| ChangeEvent {
                operation: ChangeOperation::Insert,
                row_key,
                before: None,
                after: Some(after),
                source: SourceMetadata {
                    schema: chunk.schema.clone(),
                    table: chunk.table.clone(),
                    cursor: String::new(),
                    ts_ms: None,
                    txid: None,
                    snapshot: true,
                },
            })
            .collect()
    }

    /// The scan watermark reached by this stream's chunk.
    pub fn scanned(&self, stream_id: &str) -> Option<&[u8]> {
        self.streams
            .get(stream_id)
            .map(|chunk| chunk.scanned.as_slice())
    }

    /// Whether this stream's chunk was the final one.
    pub fn complete(&self, stream_id: &str) -> bool {
        self.streams
            .get(stream_id)
            .map(|chunk| chunk.complete)
            .unwrap_or(false)
    }

    pub fn key_columns(&self, stream_id: &str) -> Option<&[String]> {
        self.streams
            .get(stream_id)
            .map(|chunk| chunk.key_columns.as_slice())
    }
}

fn require_image<'a>(
    stream_id: &str,
    image: Option<&'a Map<String, Value>>,
) -> Result<&'a Map<String, Value>> {
    image.ok_or_else(|| Error::Consistency {
        message: format!("patch event for {stream_id:?} is missing its row image"),
    })
}
