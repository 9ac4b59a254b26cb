//! The capability interface between the generic capture logic and a
//! concrete database flavor.
//!
//! The coordinator only ever talks to a [`Database`] and the
//! [`ReplicationStream`] it opens; everything flavor-specific (discovery
//! queries, chunk scans, log decoding, DDL parsing, value translation) lives
//! behind these traits.

use crate::events::{ChangeEvent, DatabaseEvent};
use crate::state::StreamId;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// A column discovered on a table.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    /// Zero-based ordinal position within the table.
    pub index: usize,
    pub is_nullable: bool,
    /// Flavor-specific type descriptor, serialized so it can be persisted
    /// as part of the table's metadata.
    pub data_type: serde_json::Value,
    /// The JSON type this column's values translate to downstream.
    pub json_type: &'static str,
}

/// Everything discovery reports about one table.
#[derive(Debug, Clone)]
pub struct DiscoveryInfo {
    pub schema: String,
    pub table: String,
    /// False for views and other non-table entities, which cannot be
    /// captured.
    pub base_table: bool,
    /// Column names in ordinal order.
    pub column_names: Vec<String>,
    pub columns: HashMap<String, ColumnInfo>,
    /// Primary-key column names in key order; empty when the table has no
    /// usable key.
    pub primary_key: Vec<String>,
    pub default_charset: String,
    /// True when the table's storage engine does not participate in
    /// transactions, so its changes never appear inside commit markers.
    pub non_transactional: bool,
}

/// Flavor-specific database operations used by the capture coordinator.
#[async_trait]
pub trait Database: Send + Sync {
    type Stream: ReplicationStream;

    /// Queries the database for all capturable tables.
    async fn discover_tables(&self) -> Result<HashMap<StreamId, DiscoveryInfo>>;

    /// Opens a replication stream. An empty `start_cursor` begins at the
    /// server's current position; otherwise the cursor is parsed and
    /// replication resumes exactly from that position, failing if the server
    /// has discarded that portion of the log.
    async fn replication_stream(&self, start_cursor: &str) -> Result<Self::Stream>;

    /// Fetches the next chunk of rows with keys strictly greater than
    /// `resume_key` (the tuple-encoded scan watermark), in key order, as
    /// synthetic insert events. Returns at most `chunk_size` rows; a shorter
    /// result means the scan is complete.
    async fn scan_table_chunk(
        &self,
        schema: &str,
        table: &str,
        key_columns: &[String],
        resume_key: Option<&[u8]>,
        chunk_size: usize,
    ) -> Result<Vec<ChangeEvent>>;

    /// Idempotently writes a sentinel value to the watermarks table. The
    /// resulting change event provides a replication-log position which is
    /// provably after any scan executed before this call.
    async fn write_watermark(&self, watermark: &str) -> Result<()>;

    /// The stream ID of the watermarks table.
    fn watermarks_table(&self) -> StreamId;
}

/// A long-lived producer of normalized replication events.
///
/// Implementations run a background worker which decodes the database's log
/// into [`DatabaseEvent`] values and writes them to a bounded channel; the
/// consumer endpoint is [`ReplicationStream::recv`].
#[async_trait]
pub trait ReplicationStream: Send {
    /// Launches the background worker. Must be called exactly once, after
    /// the initial set of tables has been activated.
    async fn start(&mut self) -> Result<()>;

    /// Receives the next event, or `None` once the worker has shut down.
    async fn recv(&mut self) -> Option<DatabaseEvent>;

    /// Adds a table to the active set. Either reloads previously persisted
    /// metadata or initializes fresh metadata from `discovery`; newly
    /// initialized metadata is reported through
    /// [`ReplicationStream::take_dirty_metadata`] before any change events
    /// for the stream are decoded.
    async fn activate_table(
        &mut self,
        stream_id: &str,
        key_columns: &[String],
        discovery: Option<&DiscoveryInfo>,
        metadata: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Removes a table from the active set and forgets its metadata.
    async fn deactivate_table(&mut self, stream_id: &str) -> Result<()>;

    /// Returns and clears the set of streams whose metadata has changed
    /// since activation and has not yet been reported downstream.
    fn take_dirty_metadata(&mut self) -> Result<Vec<(StreamId, serde_json::Value)>>;

    /// Streams events through `callback` up to a positional fence.
    ///
    /// First reports pending dirty metadata, then consumes events for up to
    /// `fence_after` of wall time, then establishes the server's current log
    /// position and continues until a flush event at or past that position.
    /// On an idle server this devolves to a single synthetic flush event at
    /// the last known position.
    async fn stream_to_fence(
        &mut self,
        fence_after: Duration,
        callback: &mut (dyn FnMut(DatabaseEvent) -> Result<()> + Send),
    ) -> Result<()>;

    /// Signals cancellation and joins the worker.
    async fn close(&mut self) -> Result<()>;
}
