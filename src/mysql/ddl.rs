//! Handling of statement (query) events observed in the binlog.
//!
//! Most query events are noise from the capture's point of view and are
//! ignored, some (schema alterations on captured tables) mutate the tracked
//! column metadata, and some (statement-form DML, dropping a captured
//! schema) indicate a server state the capture cannot continue from.

use super::replication::{ActiveTables, ChangeCounters};
use super::types::{BinlogCursor, ColumnType, DetailedColumnType, TableMetadata};
use crate::error::{Error, Result};
use crate::events::DatabaseEvent;
use crate::state::StreamId;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{
    AlterTableOperation, ColumnOption, DataType, MySQLColumnPosition, ObjectName, ObjectType,
    Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use std::sync::RwLock;
use tracing::{debug, info, warn};

// Query events are normalized enough that prefix matching catches many
// statement kinds the SQL parser disagrees with the binlog about, such as
// GRANT and CREATE USER.
static SILENT_IGNORE_QUERIES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(BEGIN|COMMIT|SAVEPOINT .*|# [^\n]*)$").unwrap());
static IGNORE_QUERIES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(GRANT|REVOKE|CREATE USER|CREATE\s*(OR REPLACE){0,1}\s*(ALGORITHM\s*=\s*[^ ]+)*\s*DEFINER|DROP USER|ALTER USER|DROP PROCEDURE|DROP FUNCTION|DROP TRIGGER|SET STATEMENT|CREATE EVENT|ALTER EVENT|DROP EVENT)",
    )
    .unwrap()
});
// RENAME TABLE and DROP DATABASE are matched directly rather than through
// the SQL parser, so their active-stream checks cannot be skipped by a
// grammar gap.
static RENAME_TABLE_QUERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^RENAME\s+TABLE\s+(.*)$").unwrap());
static DROP_DATABASE_QUERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^DROP\s+(?:DATABASE|SCHEMA)\s+(?:IF\s+EXISTS\s+)?(\S+)").unwrap());

/// What processing one query event produced.
pub(crate) struct QueryOutcome {
    pub events: Vec<DatabaseEvent>,
    /// Whether this event may be reported as an implicit flush when there
    /// are no uncommitted changes pending.
    pub implicit_flush: bool,
}

/// Processes a query event from the binlog.
///
/// A raw `COMMIT` with uncommitted non-transactional changes pending is the
/// commit marker for engines that have no transaction support, and emits a
/// flush; everything else is classified and handled as DDL.
pub(crate) fn process_query_event(
    tables: &RwLock<ActiveTables>,
    counters: &mut ChangeCounters,
    cursor: &BinlogCursor,
    default_schema: &str,
    query: &str,
) -> Result<QueryOutcome> {
    if query == "COMMIT" && counters.non_transactional > 0 {
        counters.reset();
        return Ok(QueryOutcome {
            events: vec![DatabaseEvent::Flush {
                cursor: cursor.to_string(),
            }],
            implicit_flush: false,
        });
    }
    Ok(QueryOutcome {
        events: handle_query(tables, default_schema, query)?,
        implicit_flush: true,
    })
}

/// Classifies a query and applies its effect, returning any events to emit.
pub(crate) fn handle_query(
    tables: &RwLock<ActiveTables>,
    default_schema: &str,
    query: &str,
) -> Result<Vec<DatabaseEvent>> {
    let query = query.trim();

    if SILENT_IGNORE_QUERIES.is_match(query) {
        return Ok(Vec::new());
    }
    if IGNORE_QUERIES.is_match(query) {
        info!(query, "ignoring query event");
        return Ok(Vec::new());
    }

    if let Some(captures) = DROP_DATABASE_QUERY.captures(query) {
        let schema = unquote_identifier(&captures[1]);
        let guard = tables.read().unwrap();
        if guard.schema_active(&schema) {
            return Err(Error::Unsupported {
                message: format!(
                    "cannot handle query {query:?}: schema {schema:?} is actively being captured"
                ),
            });
        }
        debug!(query, "ignorable dropped schema (not being captured from)");
        return Ok(Vec::new());
    }

    if let Some(captures) = RENAME_TABLE_QUERY.captures(query) {
        return handle_rename_table(tables, default_schema, query, &captures[1]);
    }

    info!(query, "handling query event");

    let statements = match Parser::parse_sql(&MySqlDialect {}, query) {
        Ok(statements) => statements,
        Err(e) => {
            warn!(query, error = %e, "failed to parse query event, ignoring it");
            return Ok(Vec::new());
        }
    };

    let mut events = Vec::new();
    for statement in &statements {
        events.extend(handle_statement(tables, default_schema, query, statement)?);
    }
    Ok(events)
}

fn handle_statement(
    tables: &RwLock<ActiveTables>,
    default_schema: &str,
    query: &str,
    statement: &Statement,
) -> Result<Vec<DatabaseEvent>> {
    match statement {
        Statement::CreateDatabase { .. }
        | Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. }
        | Statement::AlterView { .. }
        | Statement::Savepoint { .. }
        | Statement::Flush { .. }
        | Statement::Commit { .. }
        | Statement::StartTransaction { .. }
        | Statement::SetVariable { .. }
        | Statement::SetNames { .. } => {
            debug!(query, "ignoring benign query");
            Ok(Vec::new())
        }
        Statement::AlterTable {
            name, operations, ..
        } => {
            let stream_id = resolve_table_name(default_schema, name);
            if !tables.read().unwrap().is_active(&stream_id) {
                return Ok(Vec::new());
            }
            handle_alter_table(tables, &stream_id, query, operations)
        }
        Statement::Drop {
            object_type: ObjectType::Table,
            names,
            ..
        } => {
            let mut events = Vec::new();
            for name in names {
                let stream_id = resolve_table_name(default_schema, name);
                if tables.write().unwrap().deactivate(&stream_id) {
                    // Change streaming for this table is no longer possible.
                    events.push(DatabaseEvent::TableDrop {
                        stream_id: stream_id.clone(),
                        cause: format!("table {stream_id:?} was dropped by query {query:?}"),
                    });
                }
            }
            Ok(events)
        }
        Statement::Drop { .. } => {
            debug!(query, "ignoring benign query");
            Ok(Vec::new())
        }
        Statement::Truncate { table_name, .. } => {
            let stream_id = resolve_table_name(default_schema, table_name);
            if tables.read().unwrap().is_active(&stream_id) {
                warn!(table = %stream_id, "ignoring TRUNCATE on active table");
            }
            Ok(Vec::new())
        }
        Statement::Insert(insert) => {
            let stream_id = resolve_table_name(default_schema, &insert.table_name);
            if tables.read().unwrap().is_active(&stream_id) {
                return Err(unsupported_dml(query));
            }
            Ok(Vec::new())
        }
        Statement::Update { .. } => {
            // UPDATE statements are complicated enough that identifying the
            // impacted tables reliably is not worth it; any statement-form
            // update means the server is not in row-based replication mode.
            Err(unsupported_dml(query))
        }
        Statement::Delete(delete) => {
            let guard = tables.read().unwrap();
            for name in delete_targets(delete) {
                let stream_id = resolve_table_name(default_schema, &name);
                if guard.is_active(&stream_id) {
                    return Err(unsupported_dml(query));
                }
            }
            Ok(Vec::new())
        }
        other => Err(Error::Unsupported {
            message: format!("unhandled query (kind {:?}): {query}", statement_kind(other)),
        }),
    }
}

fn handle_rename_table(
    tables: &RwLock<ActiveTables>,
    default_schema: &str,
    query: &str,
    pair_list: &str,
) -> Result<Vec<DatabaseEvent>> {
    let mut events = Vec::new();
    for pair in pair_list.split(',') {
        let mut parts = pair.split_whitespace();
        let (Some(from), Some(to_keyword)) = (parts.next(), parts.next()) else {
            warn!(query, "failed to parse RENAME TABLE pair, ignoring it");
            continue;
        };
        if !to_keyword.eq_ignore_ascii_case("to") {
            warn!(query, "failed to parse RENAME TABLE pair, ignoring it");
            continue;
        }
        let stream_id = resolve_table_text(default_schema, from);
        if tables.write().unwrap().deactivate(&stream_id) {
            events.push(DatabaseEvent::TableDrop {
                stream_id: stream_id.clone(),
                cause: format!("table {stream_id:?} was renamed by query {query:?}"),
            });
        }
    }
    Ok(events)
}

fn handle_alter_table(
    tables: &RwLock<ActiveTables>,
    stream_id: &StreamId,
    query: &str,
    operations: &[AlterTableOperation],
) -> Result<Vec<DatabaseEvent>> {
    let mut guard = tables.write().unwrap();
    let Some(metadata) = guard.metadata.get_mut(stream_id) else {
        return Err(Error::Consistency {
            message: format!("missing metadata for stream {stream_id:?}"),
        });
    };

    apply_alter_table(metadata, query, operations)
        .map_err(|e| Error::Unsupported {
            message: format!("cannot handle table alteration {query:?}: {e}"),
        })?;

    let serialized = serde_json::to_value(&*metadata)?;
    info!(
        stream = %stream_id,
        columns = ?metadata.schema.columns,
        "applied table alteration"
    );
    Ok(vec![DatabaseEvent::Metadata {
        stream_id: stream_id.clone(),
        metadata: serialized,
    }])
}

/// Applies the supported subset of ALTER TABLE operations to the tracked
/// metadata. Partition-only specifications never reach this point; anything
/// else unrecognized is logged and skipped as not affecting row decoding.
pub(crate) fn apply_alter_table(
    metadata: &mut TableMetadata,
    query: &str,
    operations: &[AlterTableOperation],
) -> Result<()> {
    for operation in operations {
        match operation {
            AlterTableOperation::RenameColumn {
                old_column_name,
                new_column_name,
            } => {
                let old_name = old_column_name.value.clone();
                let new_name = new_column_name.value.clone();
                let index = column_index(metadata, &old_name)?;
                metadata.schema.columns[index] = new_name.clone();

                let column_type = metadata
                    .schema
                    .column_types
                    .get(&old_name)
                    .cloned()
                    .flatten();
                metadata.schema.column_types.insert(old_name, None);
                metadata.schema.column_types.insert(new_name, column_type);
            }
            AlterTableOperation::RenameTable { .. } => {
                return Err(Error::Unsupported {
                    message: format!("unsupported table alteration: {query}"),
                });
            }
            AlterTableOperation::ChangeColumn {
                old_name,
                new_name,
                data_type,
                options,
                column_position,
            } => {
                let old_name = old_name.value.clone();
                let old_index = column_index(metadata, &old_name)?;
                metadata.schema.columns.remove(old_index);

                let new_name = new_name.value.clone();
                let new_type = translate_data_type(metadata, data_type, options);
                let new_index = target_index(metadata, column_position.as_ref(), old_index)?;
                metadata.schema.columns.insert(new_index, new_name.clone());
                metadata.schema.column_types.insert(old_name, None);
                metadata
                    .schema
                    .column_types
                    .insert(new_name, Some(new_type));
            }
            AlterTableOperation::ModifyColumn {
                col_name,
                data_type,
                options,
                column_position,
            } => {
                let name = col_name.value.clone();
                let old_index = column_index(metadata, &name)?;
                metadata.schema.columns.remove(old_index);

                let new_type = translate_data_type(metadata, data_type, options);
                let new_index = target_index(metadata, column_position.as_ref(), old_index)?;
                metadata.schema.columns.insert(new_index, name.clone());
                metadata.schema.column_types.insert(name, Some(new_type));
            }
            AlterTableOperation::AddColumn {
                column_def,
                column_position,
                ..
            } => {
                let name = column_def.name.value.clone();
                let insert_at = target_index(
                    metadata,
                    column_position.as_ref(),
                    metadata.schema.columns.len(),
                )?;
                let options: Vec<ColumnOption> = column_def
                    .options
                    .iter()
                    .map(|o| o.option.clone())
                    .collect();
                let data_type = translate_data_type(metadata, &column_def.data_type, &options);
                metadata.schema.columns.insert(insert_at, name.clone());
                metadata.schema.column_types.insert(name, Some(data_type));
            }
            AlterTableOperation::DropColumn { column_name, .. } => {
                let name = column_name.value.clone();
                let index = column_index(metadata, &name)?;
                metadata.schema.columns.remove(index);
                metadata.schema.column_types.insert(name, None);
            }
            other => {
                info!(query, operation = ?other, "ignorable table alteration");
            }
        }
    }
    Ok(())
}

fn column_index(metadata: &TableMetadata, name: &str) -> Result<usize> {
    metadata
        .schema
        .columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| Error::Consistency {
            message: format!("unknown column {name:?}"),
        })
}

fn target_index(
    metadata: &TableMetadata,
    position: Option<&MySQLColumnPosition>,
    fallback: usize,
) -> Result<usize> {
    match position {
        None => Ok(fallback),
        Some(MySQLColumnPosition::First) => Ok(0),
        Some(MySQLColumnPosition::After(ident)) => {
            Ok(column_index(metadata, &ident.value)? + 1)
        }
    }
}

/// Translates a parsed column data type into the tracked type descriptor,
/// mirroring the discovery-time translation so the two sources agree.
pub(crate) fn translate_data_type(
    metadata: &TableMetadata,
    data_type: &DataType,
    options: &[ColumnOption],
) -> ColumnType {
    let declared_charset = options.iter().find_map(|option| match option {
        ColumnOption::CharacterSet(name) => Some(object_name_text(name)),
        _ => None,
    });

    match data_type {
        DataType::Enum(values) => {
            let mut cases = vec![String::new()];
            cases.extend(values.iter().cloned());
            ColumnType::Detailed(DetailedColumnType {
                type_name: "enum".to_string(),
                enum_values: cases,
                ..Default::default()
            })
        }
        DataType::TinyInt(_) => integer_type("tinyint", false),
        DataType::UnsignedTinyInt(_) => integer_type("tinyint", true),
        DataType::SmallInt(_) => integer_type("smallint", false),
        DataType::UnsignedSmallInt(_) => integer_type("smallint", true),
        DataType::MediumInt(_) => integer_type("mediumint", false),
        DataType::UnsignedMediumInt(_) => integer_type("mediumint", true),
        DataType::Int(_) | DataType::Integer(_) => integer_type("int", false),
        DataType::UnsignedInt(_) | DataType::UnsignedInteger(_) => integer_type("int", true),
        DataType::BigInt(_) => integer_type("bigint", false),
        DataType::UnsignedBigInt(_) => integer_type("bigint", true),
        DataType::Char(_) | DataType::Character(_) => {
            text_type("char", declared_charset, metadata)
        }
        DataType::Varchar(_) => text_type("varchar", declared_charset, metadata),
        DataType::Text => text_type("text", declared_charset, metadata),
        DataType::Binary(length) => ColumnType::Detailed(DetailedColumnType {
            type_name: "binary".to_string(),
            max_length: Some(length.map(|l| l as usize).unwrap_or(1)),
            ..Default::default()
        }),
        DataType::Custom(name, args) => {
            let type_name = object_name_text(name).to_lowercase();
            match type_name.as_str() {
                "set" => ColumnType::Detailed(DetailedColumnType {
                    type_name,
                    enum_values: args.clone(),
                    ..Default::default()
                }),
                "tinytext" | "mediumtext" | "longtext" => {
                    text_type(&type_name, declared_charset, metadata)
                }
                _ => ColumnType::Simple(type_name),
            }
        }
        other => {
            let rendered = other.to_string().to_lowercase();
            let base = rendered.split('(').next().unwrap_or(&rendered).trim();
            ColumnType::Simple(base.to_string())
        }
    }
}

fn integer_type(name: &str, unsigned: bool) -> ColumnType {
    ColumnType::Detailed(DetailedColumnType {
        type_name: name.to_string(),
        unsigned,
        ..Default::default()
    })
}

fn text_type(name: &str, declared_charset: Option<String>, metadata: &TableMetadata) -> ColumnType {
    ColumnType::Detailed(DetailedColumnType {
        type_name: name.to_string(),
        charset: Some(declared_charset.unwrap_or_else(|| metadata.effective_charset().to_string())),
        ..Default::default()
    })
}

fn unsupported_dml(query: &str) -> Error {
    Error::Unsupported {
        message: format!(
            "unsupported DML query (server is not using row-based replication?): {query}"
        ),
    }
}

fn delete_targets(delete: &sqlparser::ast::Delete) -> Vec<ObjectName> {
    if !delete.tables.is_empty() {
        return delete.tables.clone();
    }
    let relations: &[TableWithJoins] = match &delete.from {
        sqlparser::ast::FromTable::WithFromKeyword(tables) => tables,
        sqlparser::ast::FromTable::WithoutKeyword(tables) => tables,
    };
    relations
        .iter()
        .filter_map(|table| match &table.relation {
            TableFactor::Table { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

fn resolve_table_name(default_schema: &str, name: &ObjectName) -> StreamId {
    let parts = &name.0;
    match parts.len() {
        0 => default_schema.to_lowercase(),
        1 => crate::state::join_stream_id(default_schema, &parts[0].value),
        _ => crate::state::join_stream_id(&parts[0].value, &parts[parts.len() - 1].value),
    }
}

fn resolve_table_text(default_schema: &str, name: &str) -> StreamId {
    let name = name.trim();
    match name.split_once('.') {
        Some((schema, table)) => crate::state::join_stream_id(
            &unquote_identifier(schema),
            &unquote_identifier(table),
        ),
        None => crate::state::join_stream_id(default_schema, &unquote_identifier(name)),
    }
}

fn unquote_identifier(identifier: &str) -> String {
    identifier.trim().trim_matches('`').to_string()
}

fn object_name_text(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|ident| ident.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

fn statement_kind(statement: &Statement) -> &'static str {
    // Only used for error reporting on unhandled statement kinds.
    match statement {
        Statement::Query(_) => "query",
        Statement::Analyze { .. } => "analyze",
        Statement::Call(_) => "call",
        _ => "other",
    }
}
