//! The MySQL database adapter: discovery, chunked scans, watermark writes,
//! and replication-stream setup.

use super::replication::MysqlReplicationStream;
use super::types::{
    charset_from_collation, is_non_transactional_engine, parse_column_type, BinlogCursor,
    ColumnType, MYSQL_DEFAULT_CHARSET,
};
use super::decoder;
use crate::config::MysqlConfig;
use crate::db::{ColumnInfo, Database, DiscoveryInfo};
use crate::error::{Error, Result};
use crate::events::{ChangeEvent, ChangeOperation, SourceMetadata};
use crate::state::{join_stream_id, StreamId};
use crate::tuple::{self, TupleValue};
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Pool, Row, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Schemas whose tables are never eligible for capture.
const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

/// A connected MySQL endpoint. Cheap to clone; clones share the underlying
/// connection pool and discovery cache.
#[derive(Clone)]
pub struct MysqlDatabase {
    pool: Pool,
    config: MysqlConfig,
    watermarks_table: StreamId,
    /// Server (major, minor) version, read once at connect time.
    version: (u32, u32),
    /// Discovery results, cached so chunk scans can translate values
    /// without re-querying INFORMATION_SCHEMA.
    discovery: Arc<RwLock<HashMap<StreamId, DiscoveryInfo>>>,
}

impl MysqlDatabase {
    /// Connects to the configured server, verifies that it is usable as a
    /// replication source, and ensures the watermarks table exists.
    pub async fn connect(config: &MysqlConfig, watermarks_table: &str) -> Result<Self> {
        let pool = Pool::new(config.connection_opts());
        let mut conn = pool.get_conn().await.map_err(map_connect_error)?;

        let version_text: String = conn
            .query_first("SELECT @@GLOBAL.version")
            .await?
            .unwrap_or_default();
        let version = parse_version(&version_text);
        info!(
            host = %config.host,
            port = config.port,
            version = %version_text,
            "connected to MySQL"
        );

        // Preflight: the binlog must be enabled and in row format, or no
        // amount of streaming will produce decodable change events.
        let log_bin: Option<i64> = conn.query_first("SELECT @@GLOBAL.log_bin").await?;
        if log_bin != Some(1) {
            return Err(Error::Unsupported {
                message: "binary logging is disabled (log_bin=OFF); enable it to use change capture"
                    .to_string(),
            });
        }
        let binlog_format: Option<String> =
            conn.query_first("SELECT @@GLOBAL.binlog_format").await?;
        match binlog_format.as_deref() {
            Some("ROW") => {}
            other => {
                return Err(Error::Unsupported {
                    message: format!(
                        "binlog_format must be ROW for change capture, found {:?}",
                        other.unwrap_or("unknown")
                    ),
                })
            }
        }

        let db = MysqlDatabase {
            pool,
            config: config.clone(),
            watermarks_table: watermarks_table.to_lowercase(),
            version,
            discovery: Arc::new(RwLock::new(HashMap::new())),
        };
        db.create_watermarks_table(&mut conn).await?;
        Ok(db)
    }

    pub(crate) fn connection_opts(&self) -> mysql_async::Opts {
        self.config.connection_opts()
    }

    pub(crate) fn server_id(&self) -> u32 {
        self.config.server_id
    }

    /// The server's current binlog position.
    pub(crate) async fn query_binlog_position(&self) -> Result<BinlogCursor> {
        let mut conn = self.pool.get_conn().await?;
        let query = if self.version >= (8, 4) {
            "SHOW BINARY LOG STATUS"
        } else {
            "SHOW MASTER STATUS"
        };
        let row: Option<Row> = conn.query_first(query).await?;
        let Some(row) = row else {
            return Err(Error::Unsupported {
                message: "server reported no binlog position; is binary logging enabled?"
                    .to_string(),
            });
        };
        let file: Option<String> = row.get("File");
        let pos: Option<u64> = row.get("Position");
        match (file, pos) {
            (Some(file), Some(pos)) => Ok(BinlogCursor { file, pos }),
            _ => Err(Error::InvalidMessage {
                message: format!("malformed {query} result"),
            }),
        }
    }

    async fn create_watermarks_table(&self, conn: &mut mysql_async::Conn) -> Result<()> {
        let (schema, table) = crate::state::split_stream_id(&self.watermarks_table)?;
        conn.query_drop(format!(
            "CREATE TABLE IF NOT EXISTS {} (watermark TEXT)",
            qualified(&schema, &table)
        ))
        .await?;
        Ok(())
    }

    /// Logs the replication-related server state useful when diagnosing a
    /// capture that cannot start or keep up.
    pub async fn replication_diagnostics(&self) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        for query in ["SELECT @@GLOBAL.binlog_format", "SHOW BINARY LOGS"] {
            match conn.query::<Row, _>(query).await {
                Ok(rows) => info!(query, rows = rows.len(), "diagnostics query"),
                Err(e) => warn!(query, error = %e, "unable to execute diagnostics query"),
            }
        }
        Ok(())
    }

    fn cached_discovery(&self, stream_id: &str) -> Option<DiscoveryInfo> {
        self.discovery.read().unwrap().get(stream_id).cloned()
    }
}

#[async_trait]
impl Database for MysqlDatabase {
    type Stream = MysqlReplicationStream;

    async fn discover_tables(&self) -> Result<HashMap<StreamId, DiscoveryInfo>> {
        let mut conn = self.pool.get_conn().await?;
        let exclusion = SYSTEM_SCHEMAS
            .iter()
            .map(|s| format!("'{s}'"))
            .collect::<Vec<_>>()
            .join(",");

        let mut tables: HashMap<StreamId, DiscoveryInfo> = HashMap::new();
        let table_rows: Vec<Row> = conn
            .query(format!(
                "SELECT TABLE_SCHEMA, TABLE_NAME, TABLE_TYPE, ENGINE, TABLE_COLLATION \
                 FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA NOT IN ({exclusion})"
            ))
            .await?;
        for row in table_rows {
            let schema: String = get_text(&row, "TABLE_SCHEMA")?;
            let table: String = get_text(&row, "TABLE_NAME")?;
            let table_type: String = get_text(&row, "TABLE_TYPE")?;
            let engine: Option<String> = row.get("ENGINE");
            let collation: Option<String> = row.get("TABLE_COLLATION");

            let stream_id = join_stream_id(&schema, &table);
            tables.insert(
                stream_id,
                DiscoveryInfo {
                    schema,
                    table,
                    base_table: table_type == "BASE TABLE",
                    column_names: Vec::new(),
                    columns: HashMap::new(),
                    primary_key: Vec::new(),
                    default_charset: collation
                        .as_deref()
                        .map(charset_from_collation)
                        .unwrap_or_else(|| MYSQL_DEFAULT_CHARSET.to_string()),
                    non_transactional: engine
                        .as_deref()
                        .map(is_non_transactional_engine)
                        .unwrap_or(false),
                },
            );
        }

        let column_rows: Vec<Row> = conn
            .query(format!(
                "SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME, IS_NULLABLE, COLUMN_TYPE, \
                        CHARACTER_SET_NAME \
                 FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA NOT IN ({exclusion}) \
                 ORDER BY TABLE_SCHEMA, TABLE_NAME, ORDINAL_POSITION"
            ))
            .await?;
        for row in column_rows {
            let schema: String = get_text(&row, "TABLE_SCHEMA")?;
            let table: String = get_text(&row, "TABLE_NAME")?;
            let name: String = get_text(&row, "COLUMN_NAME")?;
            let is_nullable: String = get_text(&row, "IS_NULLABLE")?;
            let column_type: String = get_text(&row, "COLUMN_TYPE")?;
            let charset: Option<String> = row.get("CHARACTER_SET_NAME");

            let stream_id = join_stream_id(&schema, &table);
            let Some(info) = tables.get_mut(&stream_id) else {
                continue;
            };
            let parsed = parse_column_type(&column_type, charset.as_deref());
            let index = info.column_names.len();
            info.column_names.push(name.clone());
            info.columns.insert(
                name.clone(),
                ColumnInfo {
                    name,
                    index,
                    is_nullable: is_nullable == "YES",
                    json_type: parsed.json_type(),
                    data_type: serde_json::to_value(&parsed)?,
                },
            );
        }

        let key_rows: Vec<Row> = conn
            .query(format!(
                "SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME \
                 FROM information_schema.STATISTICS \
                 WHERE INDEX_NAME = 'PRIMARY' AND TABLE_SCHEMA NOT IN ({exclusion}) \
                 ORDER BY TABLE_SCHEMA, TABLE_NAME, SEQ_IN_INDEX"
            ))
            .await?;
        for row in key_rows {
            let schema: String = get_text(&row, "TABLE_SCHEMA")?;
            let table: String = get_text(&row, "TABLE_NAME")?;
            let column: String = get_text(&row, "COLUMN_NAME")?;
            if let Some(info) = tables.get_mut(&join_stream_id(&schema, &table)) {
                info.primary_key.push(column);
            }
        }

        debug!(tables = tables.len(), "discovered tables");
        *self.discovery.write().unwrap() = tables.clone();
        Ok(tables)
    }

    async fn replication_stream(&self, start_cursor: &str) -> Result<MysqlReplicationStream> {
        let position = if start_cursor.is_empty() {
            let position = self.query_binlog_position().await?;
            debug!(position = %position, "initialized binlog position");
            position
        } else {
            let position: BinlogCursor = start_cursor.parse()?;
            debug!(position = %position, "resuming from binlog position");
            position
        };
        Ok(MysqlReplicationStream::new(self.clone(), position))
    }

    async fn scan_table_chunk(
        &self,
        schema: &str,
        table: &str,
        key_columns: &[String],
        resume_key: Option<&[u8]>,
        chunk_size: usize,
    ) -> Result<Vec<ChangeEvent>> {
        let stream_id = join_stream_id(schema, table);
        let discovery = match self.cached_discovery(&stream_id) {
            Some(discovery) => discovery,
            None => {
                self.discover_tables().await?;
                self.cached_discovery(&stream_id)
                    .ok_or_else(|| Error::Consistency {
                        message: format!("table {stream_id:?} not found during discovery"),
                    })?
            }
        };

        let key_list = key_columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut query = format!("SELECT * FROM {}", qualified(schema, table));
        let mut params: Vec<Value> = Vec::new();
        if let Some(resume_key) = resume_key {
            let resume_values = tuple::decode(resume_key)?;
            if resume_values.len() != key_columns.len() {
                return Err(Error::Consistency {
                    message: format!(
                        "expected {} resume-key values but got {}",
                        key_columns.len(),
                        resume_values.len()
                    ),
                });
            }
            let placeholders = vec!["?"; key_columns.len()].join(", ");
            query.push_str(&format!(" WHERE ({key_list}) > ({placeholders})"));
            params.extend(resume_values.into_iter().map(tuple_to_mysql_value));
        }
        query.push_str(&format!(" ORDER BY {key_list} LIMIT {chunk_size}"));
        debug!(query = %query, "scanning table chunk");

        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<Row> = conn.exec(query, params).await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let columns = row.columns();
            let values = row.unwrap();
            let mut fields = serde_json::Map::new();
            for (column, value) in columns.iter().zip(values) {
                let name = column.name_str().into_owned();
                let column_type = discovery
                    .columns
                    .get(&name)
                    .map(|info| serde_json::from_value::<ColumnType>(info.data_type.clone()))
                    .transpose()?;
                fields.insert(
                    name,
                    decoder::translate_value(column_type.as_ref(), value)?,
                );
            }
            let row_key = tuple::encode_row_key(key_columns, &fields)?;
            events.push(ChangeEvent {
                operation: ChangeOperation::Insert,
                row_key,
                before: None,
                after: Some(fields),
                source: SourceMetadata {
                    schema: schema.to_string(),
                    table: table.to_string(),
                    cursor: String::new(),
                    ts_ms: None,
                    txid: None,
                    snapshot: true,
                },
            });
        }

        // The scan produces rows in key order, but the buffer merges by
        // encoded key; verify the encodings agree on that order.
        for window in events.windows(2) {
            if window[0].row_key >= window[1].row_key {
                return Err(Error::Consistency {
                    message: format!(
                        "scan of {stream_id:?} produced out-of-order row keys"
                    ),
                });
            }
        }
        Ok(events)
    }

    async fn write_watermark(&self, watermark: &str) -> Result<()> {
        let (schema, table) = crate::state::split_stream_id(&self.watermarks_table)?;
        let qualified = qualified(&schema, &table);
        let mut conn = self.pool.get_conn().await?;
        // The table holds a single `watermark` column; upsert is a
        // delete-then-insert so exactly one sentinel row exists. Only the
        // insert matters downstream: deletes on the watermarks stream are
        // never treated as sentinels.
        conn.query_drop(format!("DELETE FROM {qualified}")).await?;
        conn.exec_drop(
            format!("INSERT INTO {qualified} (watermark) VALUES (?)"),
            (watermark,),
        )
        .await?;
        debug!(watermark, "wrote watermark");
        Ok(())
    }

    fn watermarks_table(&self) -> StreamId {
        self.watermarks_table.clone()
    }
}

fn get_text(row: &Row, column: &str) -> Result<String> {
    row.get::<String, _>(column)
        .ok_or_else(|| Error::InvalidMessage {
            message: format!("missing column {column:?} in catalog query result"),
        })
}

fn quote_identifier(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

fn tuple_to_mysql_value(value: TupleValue) -> Value {
    match value {
        TupleValue::Null => Value::NULL,
        TupleValue::Bool(b) => Value::Int(b as i64),
        TupleValue::Int(n) => Value::Int(n),
        TupleValue::UInt(n) => Value::UInt(n),
        TupleValue::Float(f) => Value::Double(f),
        TupleValue::Text(s) => Value::Bytes(s.into_bytes()),
        TupleValue::Bytes(b) => Value::Bytes(b),
    }
}

/// Maps the well-known connection failures onto user-readable errors;
/// anything unrecognized bubbles up verbatim.
fn map_connect_error(error: mysql_async::Error) -> Error {
    if let mysql_async::Error::Server(server_error) = &error {
        match server_error.code {
            1044 | 1045 => {
                return Error::Connection(format!(
                    "access denied: double-check the configured username and password ({server_error})"
                ))
            }
            1049 => {
                return Error::Config(format!(
                    "the configured database does not exist ({server_error})"
                ))
            }
            1227 => {
                return Error::Connection(format!(
                    "insufficient privileges: the capture user needs REPLICATION SLAVE and REPLICATION CLIENT ({server_error})"
                ))
            }
            _ => {}
        }
    }
    Error::Mysql(error)
}

fn parse_version(version: &str) -> (u32, u32) {
    let mut parts = version.split('.');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor = parts
        .next()
        .map(|p| {
            p.chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
        })
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    (major, minor)
}
