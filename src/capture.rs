//! The capture coordinator.
//!
//! Orchestrates the interleaving of backfill scans with live replication:
//! watermark writes pin down where each scan chunk sits relative to the
//! log, replication events racing ahead of a scan are merged through the
//! result-set buffer, and the union of backfill output and post-activation
//! streaming delivers every row exactly once. State checkpoints are emitted
//! at every commit boundary.

use crate::config::{Binding, CaptureConfig};
use crate::db::{Database, ReplicationStream};
use crate::error::{Error, Result};
use crate::events::{ChangeEvent, ChangeOperation, DatabaseEvent};
use crate::output::{self, MessageOutput};
use crate::resultset::ResultSet;
use crate::state::{
    split_stream_id, PersistentState, StateStore, StreamId, TableMode, TableState,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Encapsulates the generic process of capturing data from a SQL database
/// via replication, backfilling preexisting table contents, and emitting
/// records and state updates.
pub struct Capture<D: Database> {
    db: D,
    bindings: Vec<Binding>,
    state: PersistentState,
    output: Box<dyn MessageOutput>,
    state_store: Option<StateStore>,
    chunk_size: usize,
    tail: bool,
    poll_interval: Duration,
}

impl<D: Database> Capture<D> {
    pub fn new(
        db: D,
        config: &CaptureConfig,
        state: PersistentState,
        output: Box<dyn MessageOutput>,
    ) -> Self {
        Capture {
            db,
            bindings: config.bindings.clone(),
            state,
            output,
            state_store: config.state_file.as_ref().map(StateStore::new),
            chunk_size: config.chunk_size,
            tail: config.tail,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        }
    }

    /// The state as it stands; the final checkpoint after a completed run.
    pub fn state(&self) -> &PersistentState {
        &self.state
    }

    /// Top-level entry point of the capture process.
    pub async fn run(&mut self) -> Result<()> {
        let discovered = self.db.discover_tables().await?;
        let mut repl = self.db.replication_stream(&self.state.cursor).await?;

        self.update_state(&discovered).await?;

        // Activate every captured stream so the replication worker can
        // decode its row events, restoring persisted metadata where we
        // have it. The watermarks stream is always active: the backfill
        // protocol depends on observing its sentinel rows.
        for (stream_id, table_state) in self.state.streams.clone() {
            if table_state.mode == TableMode::Ignore {
                continue;
            }
            repl.activate_table(
                &stream_id,
                &table_state.key_columns,
                discovered.get(&stream_id),
                table_state.metadata,
            )
            .await?;
        }
        let watermarks_stream = self.db.watermarks_table();
        // The watermarks table is a single text column with no declared
        // key; the sentinel value itself serves as the row key.
        let watermarks_key = discovered
            .get(&watermarks_stream)
            .map(|info| info.primary_key.clone())
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| vec!["watermark".to_string()]);
        repl.activate_table(
            &watermarks_stream,
            &watermarks_key,
            discovered.get(&watermarks_stream),
            None,
        )
        .await?;

        repl.start().await?;

        // Backfill any tables which require it. Each cycle writes a fresh
        // watermark, streams replication up to it (patching buffered rows),
        // flushes the synchronized buffer, and scans the next chunks.
        let mut results: Option<ResultSet> = None;
        loop {
            if self.state.pending_streams().is_empty() && results.is_none() {
                break;
            }
            let watermark = Uuid::new_v4().to_string();
            self.db.write_watermark(&watermark).await?;
            self.stream_to_watermark(&mut repl, &watermark, results.as_mut())
                .await?;
            if let Some(mut buffered) = results.take() {
                self.emit_buffered(&mut buffered).await?;
            }
            let pending = self.state.pending_streams();
            if !pending.is_empty() {
                results = Some(self.backfill_streams(&pending).await?);
            }
        }

        // Once there is no more backfilling to do, stream changes and emit
        // state updates on every transaction commit.
        if self.tail {
            info!("backfill complete, streaming changes indefinitely");
            loop {
                self.stream_cycle(&mut repl).await?;
            }
        }

        let watermark = Uuid::new_v4().to_string();
        self.db.write_watermark(&watermark).await?;
        info!(watermark, "streaming until final watermark");
        self.stream_to_watermark(&mut repl, &watermark, None).await?;
        repl.close().await
    }

    /// Reconciles the configured binding list with discovered tables,
    /// initializing state for new bindings and dropping state for removed
    /// ones.
    async fn update_state(
        &mut self,
        discovered: &HashMap<StreamId, crate::db::DiscoveryInfo>,
    ) -> Result<()> {
        let mut state_dirty = false;

        for binding in self.bindings.clone() {
            let stream_id = &binding.stream_id;
            let Some(discovery) = discovered.get(stream_id) else {
                return Err(Error::Config(format!(
                    "configured table {stream_id:?} not found in database"
                )));
            };
            if !discovery.base_table {
                return Err(Error::Config(format!(
                    "configured table {stream_id:?} is a view or other non-table entity"
                )));
            }

            // If key columns are specified in the binding then use those,
            // otherwise use the native primary key of the table.
            let discovered_key = &discovery.primary_key;
            let key_columns = if binding.key_columns.is_empty() {
                discovered_key.clone()
            } else {
                if !discovered_key.is_empty() && &binding.key_columns != discovered_key {
                    warn!(
                        stream = %stream_id,
                        configured_key = ?binding.key_columns,
                        database_key = ?discovered_key,
                        "configured key differs from the table's primary key"
                    );
                }
                binding.key_columns.clone()
            };
            if key_columns.is_empty() {
                return Err(Error::Config(format!(
                    "stream {stream_id:?}: no key columns configured and no primary key found in database"
                )));
            }

            match self.state.streams.get(stream_id) {
                None => {
                    self.state
                        .streams
                        .insert(stream_id.clone(), TableState::new_backfill(key_columns));
                    state_dirty = true;
                }
                Some(existing) => {
                    if existing.key_columns != key_columns {
                        return Err(Error::Consistency {
                            message: format!(
                                "stream {stream_id:?}: key {key_columns:?} doesn't match initialized scan key {:?}",
                                existing.key_columns
                            ),
                        });
                    }
                }
            }
        }

        // Streams removed from the bindings lose their state.
        let bound: HashSet<&StreamId> = self.bindings.iter().map(|b| &b.stream_id).collect();
        let removed: Vec<StreamId> = self
            .state
            .streams
            .keys()
            .filter(|id| !bound.contains(id))
            .cloned()
            .collect();
        for stream_id in removed {
            info!(stream = %stream_id, "stream removed from configuration");
            self.state.streams.remove(&stream_id);
            state_dirty = true;
        }

        if state_dirty {
            self.emit_state().await?;
        }
        Ok(())
    }

    /// Consumes replication events until a flush is observed after the
    /// sentinel row carrying `watermark`. Events on backfilling streams are
    /// either emitted directly (already-scanned key range) or patched into
    /// the buffered result set.
    async fn stream_to_watermark(
        &mut self,
        repl: &mut D::Stream,
        watermark: &str,
        mut results: Option<&mut ResultSet>,
    ) -> Result<()> {
        debug!(watermark, "streaming to watermark");

        // Metadata for newly activated tables must reach downstream before
        // any change events decoded with it.
        for (stream_id, metadata) in repl.take_dirty_metadata()? {
            self.handle_metadata_update(stream_id, metadata);
        }

        let watermarks_stream = self.db.watermarks_table();
        let mut watermark_reached = false;

        loop {
            let Some(event) = repl.recv().await else {
                return Err(Error::Replication {
                    message: "replication stream closed while streaming to watermark".to_string(),
                });
            };
            match event {
                DatabaseEvent::Keepalive => {}
                DatabaseEvent::Metadata {
                    stream_id,
                    metadata,
                } => self.handle_metadata_update(stream_id, metadata),
                DatabaseEvent::TableDrop { stream_id, cause } => {
                    self.handle_table_drop(&stream_id, &cause)
                }
                DatabaseEvent::Flush { cursor } => {
                    // Flush events update the checkpointed cursor and, once
                    // the watermark has been observed, end the loop.
                    self.state.cursor = cursor;
                    self.emit_state().await?;
                    if watermark_reached {
                        return Ok(());
                    }
                }
                DatabaseEvent::Change(change) => {
                    let stream_id = change.stream_id();

                    if stream_id == watermarks_stream
                        && change.operation != ChangeOperation::Delete
                    {
                        let actual = change
                            .after
                            .as_ref()
                            .and_then(|after| after.get("watermark"))
                            .and_then(|value| value.as_str());
                        debug!(expected = watermark, actual, "watermark change");
                        if actual == Some(watermark) {
                            watermark_reached = true;
                        }
                    }

                    match self.state.streams.get(&stream_id).map(|s| s.mode) {
                        None | Some(TableMode::Ignore) => {
                            debug!(stream = %stream_id, "ignoring stream");
                        }
                        Some(TableMode::Active) => self.handle_change_event(&change)?,
                        Some(TableMode::Backfill) => {
                            // Events at or before the current scan point are
                            // emitted; events past it are patched into the
                            // buffer (or dropped until a chunk exists).
                            let scanned = self
                                .state
                                .streams
                                .get(&stream_id)
                                .and_then(|s| s.scanned.clone())
                                .unwrap_or_default();
                            if !scanned.is_empty() && change.row_key <= scanned {
                                self.handle_change_event(&change)?;
                            } else if let Some(results) = results.as_deref_mut() {
                                results.patch(&stream_id, &change)?;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Emits buffered results in key order and advances per-table state.
    async fn emit_buffered(&mut self, results: &mut ResultSet) -> Result<()> {
        for stream_id in results.stream_ids() {
            // A stream that stopped backfilling mid-cycle (dropped table)
            // must not have its buffered rows emitted or its state advanced.
            if self.state.streams.get(&stream_id).map(|s| s.mode) != Some(TableMode::Backfill) {
                warn!(stream = %stream_id, "discarding buffered chunk for non-backfilling stream");
                continue;
            }

            let events = results.changes(&stream_id);
            for event in &events {
                self.handle_change_event(event)?;
            }

            let Some(table_state) = self.state.streams.get_mut(&stream_id) else {
                continue;
            };
            if results.complete(&stream_id) {
                info!(stream = %stream_id, "backfill complete");
                table_state.mode = TableMode::Active;
                table_state.scanned = None;
            } else {
                table_state.scanned = results.scanned(&stream_id).map(|key| key.to_vec());
            }
        }

        // The cursor was advanced by the watermark commit and the per-table
        // scan progress was advanced just above.
        self.emit_state().await
    }

    /// Fetches the next chunk of each pending stream into a fresh buffer.
    async fn backfill_streams(&mut self, pending: &[StreamId]) -> Result<ResultSet> {
        let mut results = ResultSet::new();
        for stream_id in pending {
            let table_state = self
                .state
                .streams
                .get(stream_id)
                .cloned()
                .ok_or_else(|| Error::Consistency {
                    message: format!("no state for pending stream {stream_id:?}"),
                })?;
            let (schema, table) = split_stream_id(stream_id)?;
            let events = self
                .db
                .scan_table_chunk(
                    &schema,
                    &table,
                    &table_state.key_columns,
                    table_state.scanned.as_deref(),
                    self.chunk_size,
                )
                .await?;
            let complete = events.len() < self.chunk_size;
            debug!(
                stream = %stream_id,
                rows = events.len(),
                complete,
                "scanned backfill chunk"
            );
            results.buffer(stream_id, &table_state.key_columns, events, complete)?;
        }
        Ok(results)
    }

    /// One steady-state streaming cycle: consume events up to a fence,
    /// checkpointing at each flush.
    async fn stream_cycle(&mut self, repl: &mut D::Stream) -> Result<()> {
        let state = &mut self.state;
        let output = &mut self.output;
        let mut callback = |event: DatabaseEvent| -> Result<()> {
            match event {
                DatabaseEvent::Keepalive => {}
                DatabaseEvent::Metadata {
                    stream_id,
                    metadata,
                } => {
                    if let Some(table_state) = state.streams.get_mut(&stream_id) {
                        table_state.metadata = Some(metadata);
                    }
                }
                DatabaseEvent::TableDrop { stream_id, cause } => {
                    warn!(stream = %stream_id, cause, "replication for stream has ended");
                    if let Some(table_state) = state.streams.get_mut(&stream_id) {
                        table_state.mode = TableMode::Ignore;
                    }
                }
                DatabaseEvent::Flush { cursor } => {
                    state.cursor = cursor;
                    output.write(output::checkpoint_message(state)?)?;
                }
                DatabaseEvent::Change(change) => {
                    match state.streams.get(&change.stream_id()).map(|s| s.mode) {
                        Some(TableMode::Active) => {
                            output.write(output::record_message(&change)?)?;
                        }
                        Some(TableMode::Backfill) => {
                            return Err(Error::Consistency {
                                message: format!(
                                    "stream {:?} still backfilling during steady-state streaming",
                                    change.stream_id()
                                ),
                            });
                        }
                        None | Some(TableMode::Ignore) => {}
                    }
                }
            }
            Ok(())
        };
        repl.stream_to_fence(self.poll_interval, &mut callback).await?;
        self.persist_state().await
    }

    fn handle_change_event(&mut self, event: &ChangeEvent) -> Result<()> {
        self.output.write(output::record_message(event)?)
    }

    fn handle_metadata_update(&mut self, stream_id: StreamId, metadata: serde_json::Value) {
        if let Some(table_state) = self.state.streams.get_mut(&stream_id) {
            table_state.metadata = Some(metadata);
        }
    }

    fn handle_table_drop(&mut self, stream_id: &str, cause: &str) {
        warn!(stream = %stream_id, cause, "replication for stream has ended");
        if let Some(table_state) = self.state.streams.get_mut(stream_id) {
            table_state.mode = TableMode::Ignore;
        }
    }

    /// Emits a state checkpoint downstream and persists it locally when a
    /// state file is configured.
    async fn emit_state(&mut self) -> Result<()> {
        self.output.write(output::checkpoint_message(&self.state)?)?;
        self.persist_state().await
    }

    async fn persist_state(&self) -> Result<()> {
        if let Some(store) = &self.state_store {
            store.save(&self.state).await?;
        }
        Ok(())
    }
}
