//! The binlog replication stream.
//!
//! A background worker reads raw binlog events, decodes them into typed
//! [`DatabaseEvent`] values, and writes them to a bounded channel consumed
//! by the capture coordinator. The bounded capacity provides backpressure:
//! the worker blocks rather than buffering events without limit.

use super::connection::MysqlDatabase;
use super::ddl;
use super::decoder;
use super::types::{BinlogCursor, TableMetadata};
use crate::db::{DiscoveryInfo, ReplicationStream};
use crate::error::{Error, Result};
use crate::events::{ChangeEvent, ChangeOperation, DatabaseEvent, SourceMetadata};
use crate::state::{join_stream_id, split_stream_id, StreamId};
use crate::tuple;
use async_trait::async_trait;
use futures::StreamExt;
use mysql_async::binlog::events::{Event, EventData, RowsEventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// How many decoded events can be buffered before the worker stops reading
/// further binlog events from the server.
pub(crate) const REPLICATION_BUFFER_SIZE: usize = 256;

/// How long a stream-to-fence operation will wait for further events when
/// there ought to be some before erroring out. Never hit in normal
/// operation; it exists so rare failure modes surface as an error rather
/// than blocking forever.
const STREAM_TO_FENCE_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a binlog read may sit idle before the link is presumed dead.
/// Heartbeats are requested well inside this window, so expiry means a
/// silent link failure.
const REPLICATION_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// How often the server is asked to emit heartbeat events.
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Connection retries are bounded so that unreachability eventually
/// surfaces as a fatal error.
const MAX_CONNECT_ATTEMPTS: usize = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// The active-table set and associated metadata, shared between the worker
/// (which reads it while decoding) and the main task (which mutates it via
/// activation and DDL handling).
#[derive(Debug, Default)]
pub(crate) struct ActiveTables {
    pub active: HashSet<StreamId>,
    pub metadata: HashMap<StreamId, TableMetadata>,
    pub key_columns: HashMap<StreamId, Vec<String>>,
    pub non_transactional: HashSet<StreamId>,
    pub dirty_metadata: Vec<StreamId>,
}

impl ActiveTables {
    pub fn is_active(&self, stream_id: &str) -> bool {
        self.active.contains(stream_id)
    }

    pub fn schema_active(&self, schema: &str) -> bool {
        self.active.iter().any(|stream_id| {
            split_stream_id(stream_id)
                .map(|(active_schema, _)| active_schema.eq_ignore_ascii_case(schema))
                .unwrap_or(false)
        })
    }

    /// Removes a stream from the active set, forgetting its metadata.
    /// Returns whether the stream was active.
    pub fn deactivate(&mut self, stream_id: &str) -> bool {
        let was_active = self.active.remove(stream_id);
        self.metadata.remove(stream_id);
        self.key_columns.remove(stream_id);
        self.non_transactional.remove(stream_id);
        self.dirty_metadata.retain(|id| id != stream_id);
        was_active
    }
}

/// Row changes observed since the last commit marker. The separate
/// non-transactional count exists because changes to tables on engines
/// without transaction support are never followed by an XID event; their
/// commit marker is a raw `COMMIT` query event instead.
#[derive(Debug, Default)]
pub(crate) struct ChangeCounters {
    pub uncommitted: usize,
    pub non_transactional: usize,
}

impl ChangeCounters {
    pub fn reset(&mut self) {
        self.uncommitted = 0;
        self.non_transactional = 0;
    }
}

/// The consumer half of binlog replication. See [`ReplicationStream`] for
/// the operation contract.
pub struct MysqlReplicationStream {
    db: MysqlDatabase,
    start_position: BinlogCursor,
    /// The latest fence position, updated at the end of each
    /// stream-to-fence cycle.
    fence_position: BinlogCursor,
    tables: Arc<RwLock<ActiveTables>>,
    events: Option<mpsc::Receiver<DatabaseEvent>>,
    worker: Option<JoinHandle<Result<()>>>,
    shutdown: Option<watch::Sender<bool>>,
}

impl MysqlReplicationStream {
    pub(crate) fn new(db: MysqlDatabase, start_position: BinlogCursor) -> Self {
        MysqlReplicationStream {
            db,
            fence_position: start_position.clone(),
            start_position,
            tables: Arc::new(RwLock::new(ActiveTables::default())),
            events: None,
            worker: None,
            shutdown: None,
        }
    }

    async fn connect_binlog(&self) -> Result<BinlogStream> {
        let mut attempt = 0;
        let mut conn = loop {
            attempt += 1;
            match Conn::new(self.db.connection_opts()).await {
                Ok(conn) => break conn,
                Err(e) if attempt < MAX_CONNECT_ATTEMPTS => {
                    warn!(attempt, error = %e, "binlog connection failed, retrying");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(Error::Connection(format!(
                        "error connecting for binlog sync after {MAX_CONNECT_ATTEMPTS} attempts: {e}"
                    )))
                }
            }
        };

        // Ask the server to emit heartbeat events so the read timeout only
        // fires on genuine link failures.
        use mysql_async::prelude::Queryable;
        conn.query_drop(format!(
            "SET @master_heartbeat_period = {}",
            HEARTBEAT_PERIOD.as_nanos()
        ))
        .await?;

        let request = BinlogStreamRequest::new(self.db.server_id())
            .with_filename(self.start_position.file.as_bytes())
            .with_pos(self.start_position.pos);
        let stream = conn.get_binlog_stream(request).await?;
        Ok(stream)
    }
}

#[async_trait]
impl ReplicationStream for MysqlReplicationStream {
    async fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::Replication {
                message: "replication stream already started".to_string(),
            });
        }

        info!(position = %self.start_position, "starting replication");
        let stream = self.connect_binlog().await?;

        let (tx, rx) = mpsc::channel(REPLICATION_BUFFER_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = BinlogWorker {
            stream,
            tables: Arc::clone(&self.tables),
            tx,
            cursor: self.start_position.clone(),
            counters: ChangeCounters::default(),
            gtid_string: None,
            gtid_millis: None,
        };

        self.events = Some(rx);
        self.shutdown = Some(shutdown_tx);
        self.worker = Some(tokio::spawn(worker.run(shutdown_rx)));
        Ok(())
    }

    async fn recv(&mut self) -> Option<DatabaseEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    async fn activate_table(
        &mut self,
        stream_id: &str,
        key_columns: &[String],
        discovery: Option<&DiscoveryInfo>,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        if tables.active.contains(stream_id) {
            return Ok(());
        }

        let non_transactional = discovery.map(|d| d.non_transactional).unwrap_or(false);

        let metadata = match metadata {
            Some(json) => serde_json::from_value::<TableMetadata>(json).map_err(|e| {
                Error::Consistency {
                    message: format!("error parsing metadata for {stream_id:?}: {e}"),
                }
            })?,
            None => {
                let Some(discovery) = discovery else {
                    return Err(Error::Consistency {
                        message: format!(
                            "cannot activate {stream_id:?} without discovery info or metadata"
                        ),
                    });
                };
                debug!(stream = stream_id, "initializing table metadata");
                let mut metadata = TableMetadata {
                    default_charset: Some(discovery.default_charset.clone()),
                    ..Default::default()
                };
                metadata.schema.columns = discovery.column_names.clone();
                for (name, column) in &discovery.columns {
                    metadata.schema.column_types.insert(
                        name.clone(),
                        serde_json::from_value(column.data_type.clone()).ok(),
                    );
                }
                metadata
            }
        };

        tables.active.insert(stream_id.to_string());
        tables
            .key_columns
            .insert(stream_id.to_string(), key_columns.to_vec());
        tables.metadata.insert(stream_id.to_string(), metadata);
        if non_transactional {
            tables.non_transactional.insert(stream_id.to_string());
        }
        tables.dirty_metadata.push(stream_id.to_string());
        Ok(())
    }

    async fn deactivate_table(&mut self, stream_id: &str) -> Result<()> {
        self.tables.write().unwrap().deactivate(stream_id);
        Ok(())
    }

    fn take_dirty_metadata(&mut self) -> Result<Vec<(StreamId, serde_json::Value)>> {
        let mut tables = self.tables.write().unwrap();
        let dirty = std::mem::take(&mut tables.dirty_metadata);
        let mut updates = Vec::with_capacity(dirty.len());
        for stream_id in dirty {
            if let Some(metadata) = tables.metadata.get(&stream_id) {
                updates.push((stream_id, serde_json::to_value(metadata)?));
            }
        }
        Ok(updates)
    }

    async fn stream_to_fence(
        &mut self,
        fence_after: Duration,
        callback: &mut (dyn FnMut(DatabaseEvent) -> Result<()> + Send),
    ) -> Result<()> {
        // Report metadata changes from newly activated tables first, so the
        // metadata is updated downstream before any change event needs it.
        for (stream_id, metadata) in self.take_dirty_metadata()? {
            callback(DatabaseEvent::Metadata {
                stream_id,
                metadata,
            })?;
        }

        let mut rx = self.events.take().ok_or_else(|| Error::Replication {
            message: "replication stream not started".to_string(),
        })?;
        let result = self.fence_cycle(&mut rx, fence_after, callback).await;
        self.events = Some(rx);
        result
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        // Dropping the receiver unblocks a worker stuck on a full channel.
        self.events = None;
        match self.worker.take() {
            None => Ok(()),
            Some(worker) => match worker.await {
                Ok(Ok(())) | Ok(Err(Error::Shutdown)) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(Error::Replication {
                    message: format!("replication worker panicked: {e}"),
                }),
            },
        }
    }
}

impl MysqlReplicationStream {
    async fn fence_cycle(
        &mut self,
        rx: &mut mpsc::Receiver<DatabaseEvent>,
        fence_after: Duration,
        callback: &mut (dyn FnMut(DatabaseEvent) -> Result<()> + Send),
    ) -> Result<()> {
        debug!(cursor = %self.fence_position, "beginning timed streaming phase");
        let (latest_flush_cursor, timed_events_since_flush) =
            timed_phase(rx, fence_after, self.fence_position.to_string(), callback).await?;
        debug!(cursor = %latest_flush_cursor, "finished timed streaming phase");

        // Establish a binlog-position fence.
        let fence_position = self.db.query_binlog_position().await?;
        if let Some(flush) =
            fence_fast_path(&latest_flush_cursor, &fence_position, timed_events_since_flush)?
        {
            self.fence_position = fence_position;
            return callback(flush);
        }

        debug!(cursor = %latest_flush_cursor, target = %fence_position, "beginning fenced streaming phase");
        self.fence_position = fence_phase(
            rx,
            fence_position,
            STREAM_TO_FENCE_WATCHDOG_TIMEOUT,
            callback,
        )
        .await?;
        Ok(())
    }
}

/// Decides whether a stream-to-fence operation can complete without a
/// fenced streaming phase. When the newly established fence position equals
/// the latest flush position already seen, the stream is idle at a valid
/// flush position, which is always between transactions, so a synthetic
/// flush event is safe to emit and ensures every stream-to-fence operation
/// ends in a flush. It should never be possible to take this exit unless
/// the database has been idle since the last observed flush event.
fn fence_fast_path(
    latest_flush_cursor: &str,
    fence_position: &BinlogCursor,
    timed_events_since_flush: usize,
) -> Result<Option<DatabaseEvent>> {
    let latest_flush_position: BinlogCursor = latest_flush_cursor.parse()?;
    if latest_flush_position != *fence_position {
        return Ok(None);
    }
    if timed_events_since_flush > 0 {
        return Err(Error::Replication {
            message: format!(
                "sanity check failed: already at fence after processing {timed_events_since_flush} changes during timed phase"
            ),
        });
    }
    Ok(Some(DatabaseEvent::Flush {
        cursor: latest_flush_cursor.to_string(),
    }))
}

/// Consumes events for up to `fence_after`, remembering the latest flush
/// cursor seen and how many events followed it.
async fn timed_phase(
    rx: &mut mpsc::Receiver<DatabaseEvent>,
    fence_after: Duration,
    start_cursor: String,
    callback: &mut (dyn FnMut(DatabaseEvent) -> Result<()> + Send),
) -> Result<(String, usize)> {
    let mut latest_flush_cursor = start_cursor;
    let mut timed_events_since_flush = 0usize;
    if fence_after.is_zero() {
        return Ok((latest_flush_cursor, timed_events_since_flush));
    }

    let deadline = tokio::time::sleep(fence_after);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = rx.recv() => {
                let Some(event) = event else {
                    return Err(Error::FenceNotReached);
                };
                timed_events_since_flush += 1;
                if let DatabaseEvent::Flush { cursor } = &event {
                    latest_flush_cursor = cursor.clone();
                    timed_events_since_flush = 0;
                }
                callback(event)?;
            }
        }
    }
    Ok((latest_flush_cursor, timed_events_since_flush))
}

/// Consumes events until a flush at or past `fence_position`. The watchdog
/// resets on every received event; expiry without reaching the fence is
/// fatal.
async fn fence_phase(
    rx: &mut mpsc::Receiver<DatabaseEvent>,
    fence_position: BinlogCursor,
    watchdog: Duration,
    callback: &mut (dyn FnMut(DatabaseEvent) -> Result<()> + Send),
) -> Result<BinlogCursor> {
    loop {
        let event = tokio::time::timeout(watchdog, rx.recv())
            .await
            .map_err(|_| Error::Timeout {
                message: format!(
                    "replication became idle while streaming to an established fence at {fence_position}"
                ),
            })?;
        let Some(event) = event else {
            return Err(Error::FenceNotReached);
        };

        // The first flush event whose cursor is at or after the fence
        // position ends the operation.
        let reached = match &event {
            DatabaseEvent::Flush { cursor } => {
                let position: BinlogCursor = cursor.parse()?;
                (position >= fence_position).then_some(position)
            }
            _ => None,
        };
        callback(event)?;
        if let Some(position) = reached {
            debug!(cursor = %position, "finished fenced streaming phase");
            return Ok(position);
        }
    }
}

/// The background worker: reads binlog events and produces typed events.
struct BinlogWorker {
    stream: BinlogStream,
    tables: Arc<RwLock<ActiveTables>>,
    tx: mpsc::Sender<DatabaseEvent>,
    cursor: BinlogCursor,
    counters: ChangeCounters,
    /// The GTID of the current transaction, formatted `<uuid>:<counter>`.
    gtid_string: Option<String>,
    /// The commit timestamp of the last GTID event, in milliseconds.
    gtid_millis: Option<i64>,
}

impl BinlogWorker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                next = tokio::time::timeout(REPLICATION_READ_TIMEOUT, self.stream.next()) => next,
            };
            let event = match next {
                Err(_) => {
                    return Err(Error::Timeout {
                        message: "timed out waiting for a binlog event".to_string(),
                    })
                }
                Ok(None) => {
                    return Err(Error::Replication {
                        message: "binlog stream ended unexpectedly".to_string(),
                    })
                }
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(event))) => event,
            };
            self.process_event(event).await?;
        }
    }

    async fn process_event(&mut self, event: Event) -> Result<()> {
        let header = event.header();
        if header.log_pos() > 0 {
            self.cursor.pos = header.log_pos() as u64;
        }
        let timestamp = header.timestamp();

        // Events which are neither row changes nor commits are reported as
        // an implicit flush if and only if there are no uncommitted changes,
        // which avoids edge cases in the positional fence implementation.
        let mut implicit_flush = false;

        match event.read_data()? {
            Some(EventData::RowsEvent(rows_event)) => {
                self.handle_rows_event(&rows_event, timestamp).await?;
            }
            Some(EventData::TableMapEvent(table_map)) => {
                trace!(
                    table = %table_map.table_name(),
                    schema = %table_map.database_name(),
                    "table map event"
                );
            }
            Some(EventData::XidEvent(xid)) => {
                trace!(xid = xid.xid, cursor = %self.cursor, "XID event");
                self.emit(DatabaseEvent::Flush {
                    cursor: self.cursor.to_string(),
                })
                .await?;
                self.counters.reset();
            }
            Some(EventData::QueryEvent(query_event)) => {
                let schema = query_event.schema().into_owned();
                let query = query_event.query().into_owned();
                let outcome = ddl::process_query_event(
                    &self.tables,
                    &mut self.counters,
                    &self.cursor,
                    &schema,
                    &query,
                )?;
                implicit_flush = outcome.implicit_flush;
                for event in outcome.events {
                    self.emit(event).await?;
                }
            }
            Some(EventData::RotateEvent(rotate)) => {
                implicit_flush = true;
                self.cursor = BinlogCursor {
                    file: rotate.name().into_owned(),
                    pos: rotate.position(),
                };
                trace!(cursor = %self.cursor, "rotate event");
            }
            Some(EventData::GtidEvent(gtid)) => {
                implicit_flush = true;
                self.gtid_millis = Some((timestamp as i64) * 1000);
                let sid = gtid.sid();
                if sid == [0u8; 16] && gtid.gno() == 0 {
                    self.gtid_string = None;
                } else {
                    self.gtid_string =
                        Some(format!("{}:{}", Uuid::from_bytes(sid), gtid.gno()));
                }
            }
            Some(_) => {
                // Format descriptions, previous-GTIDs, heartbeats, and other
                // bookkeeping events only advance the cursor.
                implicit_flush = true;
            }
            None => {
                implicit_flush = true;
            }
        }

        if implicit_flush && self.counters.uncommitted == 0 {
            self.emit(DatabaseEvent::Flush {
                cursor: self.cursor.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    async fn handle_rows_event(
        &mut self,
        rows_event: &RowsEventData<'_>,
        timestamp: u32,
    ) -> Result<()> {
        let operation = match rows_event {
            RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => {
                ChangeOperation::Insert
            }
            RowsEventData::UpdateRowsEvent(_) | RowsEventData::UpdateRowsEventV1(_) => {
                ChangeOperation::Update
            }
            RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => {
                ChangeOperation::Delete
            }
            other => {
                return Err(Error::InvalidMessage {
                    message: format!("unknown row event type: {other:?}"),
                })
            }
        };

        // Extract everything needed from the table-map event up front, so
        // the borrow of the stream's table-map registry ends before any
        // channel send can suspend.
        let (schema, table, rows) = {
            let table_map = self.stream.get_tme(rows_event.table_id()).ok_or_else(|| {
                Error::InvalidMessage {
                    message: format!(
                        "no table map event for table id {}",
                        rows_event.table_id()
                    ),
                }
            })?;
            let schema = table_map.database_name().into_owned();
            let table = table_map.table_name().into_owned();
            let mut rows = Vec::new();
            for row in rows_event.rows(table_map) {
                let (before, after) = row.map_err(|e| Error::InvalidMessage {
                    message: format!("error parsing row image: {e}"),
                })?;
                rows.push((
                    before.map(binlog_row_values).transpose()?,
                    after.map(binlog_row_values).transpose()?,
                ));
            }
            (schema, table, rows)
        };
        let stream_id = join_stream_id(&schema, &table);

        // Skip change events from tables which aren't being captured; a
        // keepalive still signals that events are actively being received.
        let Some((metadata, key_columns, non_transactional)) = ({
            let tables = self.tables.read().unwrap();
            if !tables.is_active(&stream_id) {
                None
            } else {
                let metadata =
                    tables
                        .metadata
                        .get(&stream_id)
                        .cloned()
                        .ok_or_else(|| Error::Consistency {
                            message: format!("missing metadata for stream {stream_id:?}"),
                        })?;
                let key_columns = tables
                    .key_columns
                    .get(&stream_id)
                    .cloned()
                    .ok_or_else(|| Error::Consistency {
                        message: format!("unknown key columns for stream {stream_id:?}"),
                    })?;
                let non_transactional = tables.non_transactional.contains(&stream_id);
                Some((metadata, key_columns, non_transactional))
            }
        }) else {
            return self.emit(DatabaseEvent::Keepalive).await;
        };

        let ts_ms = self.gtid_millis.or(Some((timestamp as i64) * 1000));

        for (row_index, (before_values, after_values)) in rows.into_iter().enumerate() {
            let before = before_values
                .map(|values| decoder::decode_row(&stream_id, &metadata, values))
                .transpose()?;
            let mut after = after_values
                .map(|values| decoder::decode_row(&stream_id, &metadata, values))
                .transpose()?;

            if operation == ChangeOperation::Update {
                // Columns omitted from the after-image inherit their
                // before-image values.
                if let (Some(after), Some(before)) = (after.as_mut(), before.as_ref()) {
                    decoder::merge_preimage(after, before);
                }
            }

            let key_image = match operation {
                ChangeOperation::Delete => before.as_ref(),
                _ => after.as_ref(),
            }
            .ok_or_else(|| Error::InvalidMessage {
                message: format!("row event on {stream_id:?} is missing its row image"),
            })?;
            let row_key = tuple::encode_row_key(&key_columns, key_image)?;

            let source = SourceMetadata {
                schema: schema.clone(),
                table: table.clone(),
                cursor: self.cursor.event_cursor(row_index),
                ts_ms,
                txid: self.gtid_string.clone(),
                snapshot: false,
            };

            self.emit(DatabaseEvent::Change(ChangeEvent {
                operation,
                row_key,
                before,
                after,
                source,
            }))
            .await?;

            self.counters.uncommitted += 1;
            if non_transactional {
                self.counters.non_transactional += 1;
            }
        }
        Ok(())
    }

    async fn emit(&self, event: DatabaseEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| Error::Shutdown)
    }
}

/// Unpacks a binlog row image into per-column values, preserving the
/// skipped-column mask as `None` entries.
fn binlog_row_values(mut row: BinlogRow) -> Result<Vec<Option<mysql_async::Value>>> {
    let mut values = Vec::with_capacity(row.len());
    for index in 0..row.len() {
        let value = match row.take(index) {
            None => None,
            Some(BinlogValue::Value(value)) => Some(value),
            Some(BinlogValue::Jsonb(json)) => {
                let value = serde_json::Value::try_from(json).map_err(|e| Error::InvalidMessage {
                    message: format!("error decoding JSON column: {e}"),
                })?;
                Some(mysql_async::Value::Bytes(value.to_string().into_bytes()))
            }
            Some(BinlogValue::JsonDiff(_)) => {
                return Err(Error::Unsupported {
                    message: "partial JSON updates are not supported".to_string(),
                })
            }
        };
        values.push(value);
    }
    Ok(values)
}
