//! A scripted in-memory database for driving the capture coordinator
//! without a live server.
//!
//! The mock keeps real table contents so backfill scans observe the effect
//! of every committed change, and it queues the corresponding replication
//! events exactly the way the binlog would deliver them. Change batches are
//! scripted per watermark write, which is the only point where the real
//! capture interleaves new commits with its scan cycles, so tests are fully
//! deterministic.

use async_trait::async_trait;
use mysql_capture::db::{ColumnInfo, Database, DiscoveryInfo, ReplicationStream};
use mysql_capture::events::{ChangeEvent, ChangeOperation, DatabaseEvent, SourceMetadata};
use mysql_capture::output::{MemoryOutput, Message, MessageOutput};
use mysql_capture::state::{split_stream_id, StreamId};
use mysql_capture::tuple;
use mysql_capture::{Error, Result};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const WATERMARKS_STREAM: &str = "mock.watermarks";

/// One scripted operation, committed on the source during capture.
#[allow(dead_code)]
pub enum ScriptOp {
    Insert(&'static str, Value),
    Update(&'static str, Value),
    Delete(&'static str, Value),
    DropTable(&'static str),
    Commit,
}

pub struct MockTable {
    pub key_columns: Vec<String>,
    pub columns: Vec<String>,
    pub rows: BTreeMap<Vec<u8>, Map<String, Value>>,
}

#[derive(Default)]
pub struct Shared {
    pub tables: HashMap<StreamId, MockTable>,
    pub queue: VecDeque<DatabaseEvent>,
    /// Batches of operations applied one per watermark write.
    pub pending_commits: VecDeque<Vec<ScriptOp>>,
    pub active: HashSet<StreamId>,
    pub dirty_metadata: Vec<(StreamId, Value)>,
    pub cursor: u64,
    pub watermark_writes: usize,
    /// Every cursor a replication stream was opened at.
    pub start_cursors: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockDatabase {
    pub shared: Arc<Mutex<Shared>>,
}

impl MockDatabase {
    pub fn new() -> Self {
        let db = MockDatabase::default();
        db.add_table(WATERMARKS_STREAM, &["watermark"], &["watermark"], vec![]);
        db
    }

    pub fn add_table(&self, stream_id: &str, key_columns: &[&str], columns: &[&str], rows: Vec<Value>) {
        let mut table = MockTable {
            key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: BTreeMap::new(),
        };
        for row in rows {
            let row = row.as_object().expect("row must be an object").clone();
            let key = tuple::encode_row_key(&table.key_columns, &row).expect("encodable key");
            table.rows.insert(key, row);
        }
        self.shared.lock().unwrap().tables.insert(stream_id.to_string(), table);
    }

    /// Queues a batch of operations to be committed at the next watermark
    /// write. Batches are consumed in order, one per write.
    pub fn push_batch(&self, ops: Vec<ScriptOp>) {
        self.shared.lock().unwrap().pending_commits.push_back(ops);
    }
}

fn source_for(stream_id: &str, cursor: u64) -> SourceMetadata {
    let (schema, table) = split_stream_id(stream_id).unwrap();
    SourceMetadata {
        schema,
        table,
        cursor: format!("binlog.000001:{cursor}:0"),
        ts_ms: None,
        txid: None,
        snapshot: false,
    }
}

fn apply_op(shared: &mut Shared, op: ScriptOp) {
    match op {
        ScriptOp::Insert(stream_id, row) => {
            let row = row.as_object().expect("row must be an object").clone();
            let table = shared.tables.get_mut(stream_id).expect("unknown table");
            let key = tuple::encode_row_key(&table.key_columns, &row).unwrap();
            table.rows.insert(key.clone(), row.clone());
            shared.cursor += 1;
            if shared.active.contains(stream_id) {
                shared.queue.push_back(DatabaseEvent::Change(ChangeEvent {
                    operation: ChangeOperation::Insert,
                    row_key: key,
                    before: None,
                    after: Some(row),
                    source: source_for(stream_id, shared.cursor),
                }));
            } else {
                shared.queue.push_back(DatabaseEvent::Keepalive);
            }
        }
        ScriptOp::Update(stream_id, changes) => {
            let changes = changes.as_object().expect("row must be an object").clone();
            let table = shared.tables.get_mut(stream_id).expect("unknown table");
            let key = tuple::encode_row_key(&table.key_columns, &changes).unwrap();
            let before = table.rows.get(&key).expect("update of missing row").clone();
            let mut after = before.clone();
            for (column, value) in changes {
                after.insert(column, value);
            }
            table.rows.insert(key.clone(), after.clone());
            shared.cursor += 1;
            if shared.active.contains(stream_id) {
                shared.queue.push_back(DatabaseEvent::Change(ChangeEvent {
                    operation: ChangeOperation::Update,
                    row_key: key,
                    before: Some(before),
                    after: Some(after),
                    source: source_for(stream_id, shared.cursor),
                }));
            } else {
                shared.queue.push_back(DatabaseEvent::Keepalive);
            }
        }
        ScriptOp::Delete(stream_id, key_fields) => {
            let key_fields = key_fields.as_object().expect("row must be an object").clone();
            let table = shared.tables.get_mut(stream_id).expect("unknown table");
            let key = tuple::encode_row_key(&table.key_columns, &key_fields).unwrap();
            let before = table.rows.remove(&key).expect("delete of missing row");
            shared.cursor += 1;
            if shared.active.contains(stream_id) {
                shared.queue.push_back(DatabaseEvent::Change(ChangeEvent {
                    operation: ChangeOperation::Delete,
                    row_key: key,
                    before: Some(before),
                    after: None,
                    source: source_for(stream_id, shared.cursor),
                }));
            } else {
                shared.queue.push_back(DatabaseEvent::Keepalive);
            }
        }
        ScriptOp::DropTable(stream_id) => {
            shared.cursor += 1;
            if shared.active.remove(stream_id) {
                shared.queue.push_back(DatabaseEvent::TableDrop {
                    stream_id: stream_id.to_string(),
                    cause: format!("table {stream_id:?} was dropped"),
                });
            }
        }
        ScriptOp::Commit => {
            shared.cursor += 1;
            let cursor = shared.cursor;
            shared.queue.push_back(DatabaseEvent::Flush {
                cursor: format!("binlog.000001:{cursor}"),
            });
        }
    }
}

pub struct MockReplicationStream {
    shared: Arc<Mutex<Shared>>,
}

#[async_trait]
impl ReplicationStream for MockReplicationStream {
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn recv(&mut self) -> Option<DatabaseEvent> {
        // All deliverable events are queued synchronously by watermark
        // writes, so an empty queue means the test script is exhausted.
        self.shared.lock().unwrap().queue.pop_front()
    }

    async fn activate_table(
        &mut self,
        stream_id: &str,
        _key_columns: &[String],
        discovery: Option<&DiscoveryInfo>,
        metadata: Option<Value>,
    ) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if !shared.active.insert(stream_id.to_string()) {
            return Ok(());
        }
        let metadata = metadata.unwrap_or_else(|| {
            json!({
                "schema": {
                    "columns": discovery.map(|d| d.column_names.clone()).unwrap_or_default(),
                    "types": {},
                }
            })
        });
        shared.dirty_metadata.push((stream_id.to_string(), metadata));
        Ok(())
    }

    async fn deactivate_table(&mut self, stream_id: &str) -> Result<()> {
        self.shared.lock().unwrap().active.remove(stream_id);
        Ok(())
    }

    fn take_dirty_metadata(&mut self) -> Result<Vec<(StreamId, Value)>> {
        Ok(std::mem::take(&mut self.shared.lock().unwrap().dirty_metadata))
    }

    async fn stream_to_fence(
        &mut self,
        _fence_after: Duration,
        callback: &mut (dyn FnMut(DatabaseEvent) -> Result<()> + Send),
    ) -> Result<()> {
        for update in self.take_dirty_metadata()? {
            callback(DatabaseEvent::Metadata {
                stream_id: update.0,
                metadata: update.1,
            })?;
        }
        loop {
            let (event, fence) = {
                let mut shared = self.shared.lock().unwrap();
                (shared.queue.pop_front(), shared.cursor)
            };
            match event {
                Some(event) => callback(event)?,
                None => {
                    // Idle: a synthetic flush at the current position.
                    return callback(DatabaseEvent::Flush {
                        cursor: format!("binlog.000001:{fence}"),
                    });
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Database for MockDatabase {
    type Stream = MockReplicationStream;

    async fn discover_tables(&self) -> Result<HashMap<StreamId, DiscoveryInfo>> {
        let shared = self.shared.lock().unwrap();
        let mut discovered = HashMap::new();
        for (stream_id, table) in &shared.tables {
            let (schema, name) = split_stream_id(stream_id)?;
            let columns = table
                .columns
                .iter()
                .enumerate()
                .map(|(index, column)| {
                    (
                        column.clone(),
                        ColumnInfo {
                            name: column.clone(),
                            index,
                            is_nullable: true,
                            data_type: json!("text"),
                            json_type: "string",
                        },
                    )
                })
                .collect();
            discovered.insert(
                stream_id.clone(),
                DiscoveryInfo {
                    schema,
                    table: name,
                    base_table: true,
                    column_names: table.columns.clone(),
                    columns,
                    primary_key: table.key_columns.clone(),
                    default_charset: "utf8mb4".to_string(),
                    non_transactional: false,
                },
            );
        }
        Ok(discovered)
    }

    async fn replication_stream(&self, start_cursor: &str) -> Result<MockReplicationStream> {
        self.shared
            .lock()
            .unwrap()
            .start_cursors
            .push(start_cursor.to_string());
        Ok(MockReplicationStream {
            shared: Arc::clone(&self.shared),
        })
    }

    async fn scan_table_chunk(
        &self,
        schema: &str,
        table: &str,
        _key_columns: &[String],
        resume_key: Option<&[u8]>,
        chunk_size: usize,
    ) -> Result<Vec<ChangeEvent>> {
        let stream_id = format!("{schema}.{table}");
        let shared = self.shared.lock().unwrap();
        let mock_table = shared
            .tables
            .get(&stream_id)
            .ok_or_else(|| Error::Config(format!("unknown table {stream_id:?}")))?;
        let events = mock_table
            .rows
            .iter()
            .filter(|(key, _)| resume_key.map(|resume| key.as_slice() > resume).unwrap_or(true))
            .take(chunk_size)
            .map(|(key, row)| ChangeEvent {
                operation: ChangeOperation::Insert,
                row_key: key.clone(),
                before: None,
                after: Some(row.clone()),
                source: SourceMetadata {
                    schema: schema.to_string(),
                    table: table.to_string(),
                    cursor: String::new(),
                    ts_ms: None,
                    txid: None,
                    snapshot: true,
                },
            })
            .collect();
        Ok(events)
    }

    async fn write_watermark(&self, watermark: &str) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.watermark_writes += 1;
        if let Some(batch) = shared.pending_commits.pop_front() {
            for op in batch {
                apply_op(&mut shared, op);
            }
        }
        // Upsert by caller: the single sentinel row is replaced wholesale,
        // and only the insert is significant downstream.
        if let Some(table) = shared.tables.get_mut(WATERMARKS_STREAM) {
            table.rows.clear();
        }
        apply_op(
            &mut shared,
            ScriptOp::Insert(WATERMARKS_STREAM, json!({"watermark": watermark})),
        );
        apply_op(&mut shared, ScriptOp::Commit);
        Ok(())
    }

    fn watermarks_table(&self) -> StreamId {
        WATERMARKS_STREAM.to_string()
    }
}

/// A memory sink that stays inspectable after the capture consumes it.
#[derive(Clone, Default)]
pub struct SharedOutput(pub Arc<Mutex<MemoryOutput>>);

impl SharedOutput {
    pub fn new() -> Self {
        SharedOutput::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.0.lock().unwrap().messages.clone()
    }
}

impl MessageOutput for SharedOutput {
    fn write(&mut self, message: Message) -> Result<()> {
        self.0.lock().unwrap().write(message)
    }
}
