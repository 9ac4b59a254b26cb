//! Resumable capture state and its persistence.
//!
//! [`PersistentState`] is the flat JSON document emitted as a checkpoint
//! after every committed transaction. It records the replication cursor of
//! the most recent flush plus per-table backfill progress, and is everything
//! a restarted capture needs to resume without losing or duplicating rows.
//!
//! # Example
//!
//! ```rust,no_run
//! use mysql_capture::state::{PersistentState, StateStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = StateStore::new("state.json");
//!
//!     if let Some(state) = store.load().await? {
//!         println!("Resuming from cursor: {}", state.cursor);
//!     }
//!
//!     Ok(())
//! }
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// Canonical lowercase `<schema>.<table>` stream identifier.
pub type StreamId = String;

/// Combines a schema and table name into a stream ID like `public.users`.
pub fn join_stream_id(schema: &str, table: &str) -> StreamId {
    format!("{schema}.{table}").to_lowercase()
}

/// Splits a stream ID back into schema and table components. This is the
/// only sanctioned inverse of [`join_stream_id`].
pub fn split_stream_id(stream_id: &str) -> Result<(String, String)> {
    match stream_id.split_once('.') {
        Some((schema, table)) => Ok((schema.to_string(), table.to_string())),
        None => Err(Error::Consistency {
            message: format!("malformed stream ID {stream_id:?}"),
        }),
    }
}

/// Per-table capture phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableMode {
    /// The table is deliberately not captured.
    Ignore,
    /// Preexisting rows are still being scanned; replication events are only
    /// emitted for the already-scanned key range.
    Backfill,
    /// The backfill is complete and replication events are emitted for the
    /// entire table.
    Active,
}

/// The serializable, resumable state of a single table's capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableState {
    pub mode: TableMode,
    /// The key used for ordering and chunking the backfill scan.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_columns: Vec<String>,
    /// Tuple-encoded key of the last row successfully backfilled.
    /// Replication events are only emitted for rows with keys less than or
    /// equal to this value while the backfill is in progress. Empty means
    /// the scan has not yet started.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub scanned: Option<Vec<u8>>,
    /// Serialized column metadata used to decode replication events for
    /// this table, updated whenever a metadata event is observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl TableState {
    pub fn new_backfill(key_columns: Vec<String>) -> Self {
        TableState {
            mode: TableMode::Backfill,
            key_columns,
            scanned: None,
            metadata: None,
        }
    }
}

/// The capture's complete resumable state.
///
/// `cursor` is the replication position of the most recent flush; it is only
/// ever assigned from positions declared by a flush event, never from a
/// mid-transaction position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    #[serde(default)]
    pub cursor: String,
    #[serde(default)]
    pub streams: BTreeMap<StreamId, TableState>,
}

impl PersistentState {
    /// Returns the IDs of all streams which still need to be backfilled, in
    /// sorted order for reproducibility.
    pub fn pending_streams(&self) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|(_, table)| table.mode == TableMode::Backfill)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Persists [`PersistentState`] to disk between runs.
///
/// Writes go through a temporary file followed by an atomic rename, so a
/// crash mid-write never leaves a corrupt state file behind.
pub struct StateStore {
    file_path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            file_path: path.as_ref().to_path_buf(),
        }
    }

    /// Loads state from disk if it exists.
    ///
    /// Returns `None` if the state file doesn't exist, which typically means
    /// this is the first run.
    pub async fn load(&self) -> Result<Option<PersistentState>> {
        if !self.file_path.exists() {
            debug!("No state file found at {:?}", self.file_path);
            return Ok(None);
        }

        match fs::read_to_string(&self.file_path).await {
            Ok(content) => match serde_json::from_str::<PersistentState>(&content) {
                Ok(state) => {
                    info!(
                        cursor = %state.cursor,
                        streams = state.streams.len(),
                        "Loaded persisted state"
                    );
                    Ok(Some(state))
                }
                Err(e) => {
                    error!("Failed to parse state file: {}", e);
                    Err(Error::Config(format!("Invalid state file: {e}")))
                }
            },
            Err(e) => {
                error!("Failed to read state file: {}", e);
                Err(Error::Io(e))
            }
        }
    }

    /// Saves state to disk atomically.
    pub async fn save(&self, state: &PersistentState) -> Result<()> {
        debug!(cursor = %state.cursor, "Saving state");

        let temp_path = self.file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(state)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;

        debug!("State saved successfully");
        Ok(())
    }

    /// Deletes the state file if it exists, resetting the capture to start
    /// from scratch on the next run.
    pub async fn delete(&self) -> Result<()> {
        if self.file_path.exists() {
            fs::remove_file(&self.file_path).await?;
            info!("Deleted state file");
        }
        Ok(())
    }
}

/// Serde adapter storing the `scanned` key bytes as a base64 string, keeping
/// the checkpoint document flat and readable.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let value = Option::<String>::deserialize(deserializer)?;
        match value {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stream_id_roundtrip() {
        assert_eq!(join_stream_id("Public", "Users"), "public.users");
        let (schema, table) = split_stream_id("public.users").unwrap();
        assert_eq!((schema.as_str(), table.as_str()), ("public", "users"));
        assert!(split_stream_id("nodot").is_err());
    }

    #[test]
    fn test_pending_streams_sorted() {
        let mut state = PersistentState::default();
        state.streams.insert(
            "b.t".to_string(),
            TableState::new_backfill(vec!["id".to_string()]),
        );
        state.streams.insert(
            "a.t".to_string(),
            TableState::new_backfill(vec!["id".to_string()]),
        );
        state.streams.insert(
            "c.t".to_string(),
            TableState {
                mode: TableMode::Active,
                key_columns: vec![],
                scanned: None,
                metadata: None,
            },
        );
        assert_eq!(state.pending_streams(), vec!["a.t", "b.t"]);
    }

    #[test]
    fn test_state_json_shape() {
        let mut state = PersistentState {
            cursor: "binlog.000003:1234".to_string(),
            streams: BTreeMap::new(),
        };
        state.streams.insert(
            "public.t".to_string(),
            TableState {
                mode: TableMode::Backfill,
                key_columns: vec!["id".to_string()],
                scanned: Some(vec![0x15, 0x03]),
                metadata: None,
            },
        );

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["cursor"], "binlog.000003:1234");
        assert_eq!(json["streams"]["public.t"]["mode"], "Backfill");
        // Scanned keys serialize as base64 so the checkpoint stays flat JSON.
        assert_eq!(json["streams"]["public.t"]["scanned"], "FQM=");

        let parsed: PersistentState = serde_json::from_value(json).unwrap();
        assert_eq!(
            parsed.streams["public.t"].scanned.as_deref(),
            Some(&[0x15, 0x03][..])
        );
    }

    #[tokio::test]
    async fn test_state_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let state_path = temp_dir.path().join("state.json");

        let store = StateStore::new(&state_path);

        // Initially no state
        assert!(store.load().await.unwrap().is_none());

        // Save state
        let mut state = PersistentState {
            cursor: "binlog.000001:4".to_string(),
            streams: BTreeMap::new(),
        };
        state.streams.insert(
            "public.users".to_string(),
            TableState::new_backfill(vec!["id".to_string()]),
        );
        store.save(&state).await.unwrap();

        // Load state
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.cursor, "binlog.000001:4");
        assert_eq!(loaded.streams.len(), 1);
    }

    #[tokio::test]
    async fn test_state_atomic_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let state_path = temp_dir.path().join("state.json");

        let store = StateStore::new(&state_path);

        let first = PersistentState {
            cursor: "binlog.000001:100".to_string(),
            streams: BTreeMap::new(),
        };
        store.save(&first).await.unwrap();

        let second = PersistentState {
            cursor: "binlog.000001:200".to_string(),
            streams: BTreeMap::new(),
        };
        store.save(&second).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.cursor, "binlog.000001:200");
    }
}
