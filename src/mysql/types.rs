//! MySQL-specific cursor, column-type, and table-metadata types.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A position within the binlog, serialized as `<logfile>:<offset>`.
///
/// Binlog file names carry a fixed-width numeric suffix, so ordering by
/// `(file, pos)` matches log order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct BinlogCursor {
    pub file: String,
    pub pos: u64,
}

impl BinlogCursor {
    /// The cursor of a specific row within an event, used as per-record
    /// source provenance.
    pub fn event_cursor(&self, row_index: usize) -> String {
        format!("{}:{}:{}", self.file, self.pos, row_index)
    }
}

impl fmt::Display for BinlogCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.pos)
    }
}

impl FromStr for BinlogCursor {
    type Err = Error;

    fn from_str(cursor: &str) -> Result<Self> {
        let Some((file, offset)) = cursor.rsplit_once(':') else {
            return Err(Error::InvalidCursor {
                cursor: cursor.to_string(),
                message: "must have <logfile>:<offset> shape".to_string(),
            });
        };
        let pos = offset.parse::<u64>().map_err(|e| Error::InvalidCursor {
            cursor: cursor.to_string(),
            message: format!("invalid offset value {offset:?}: {e}"),
        })?;
        Ok(BinlogCursor {
            file: file.to_string(),
            pos,
        })
    }
}

/// Fallback charset when neither the column, its collation, nor the table
/// declares one.
pub const MYSQL_DEFAULT_CHARSET: &str = "utf8mb4";

/// The set of storage engines whose writes never appear inside transaction
/// commit markers.
pub fn is_non_transactional_engine(engine: &str) -> bool {
    engine.eq_ignore_ascii_case("MyISAM")
}

/// Per-column type descriptor tracked in table metadata.
///
/// Most columns are described by their bare lowercase type name; the types
/// whose binlog values cannot be decoded from the name alone carry extra
/// detail. The serialized form must round-trip through JSON because it is
/// persisted in state checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnType {
    Detailed(DetailedColumnType),
    Simple(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetailedColumnType {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    /// Declared cases for enum and set columns. For enums the list is
    /// prefixed with a sentinel empty case so that indexing mirrors MySQL's
    /// 1-based enum values, with 0 as the illegal-enum value.
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unsigned: bool,
    /// Declared length of fixed-length `binary(n)` columns, whose values
    /// must be right-padded to full width.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

impl ColumnType {
    pub fn simple(name: &str) -> ColumnType {
        ColumnType::Simple(name.to_string())
    }

    pub fn type_name(&self) -> &str {
        match self {
            ColumnType::Simple(name) => name,
            ColumnType::Detailed(detailed) => &detailed.type_name,
        }
    }

    /// The JSON type values of this column translate to downstream.
    pub fn json_type(&self) -> &'static str {
        match self.type_name() {
            "tinyint" | "smallint" | "mediumint" | "int" | "bigint" | "year" | "bit" => "integer",
            "float" | "double" => "number",
            "decimal" | "numeric" => "string",
            "bool" | "boolean" => "boolean",
            _ => "string",
        }
    }
}

/// Per-table column metadata, persisted across restarts and mutated by DDL
/// handling while the stream is live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableMetadata {
    pub schema: TableSchema,
    #[serde(rename = "charset", default, skip_serializing_if = "Option::is_none")]
    pub default_charset: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSchema {
    /// Column names in row-image order. The length of this list must equal
    /// the arity of every row image decoded for the table.
    pub columns: Vec<String>,
    /// Column-name to type-descriptor map. Stale entries are set to `null`
    /// rather than removed so that JSON merge semantics erase the old key
    /// downstream.
    #[serde(rename = "types")]
    pub column_types: HashMap<String, Option<ColumnType>>,
}

impl TableMetadata {
    pub fn column_type(&self, column: &str) -> Option<&ColumnType> {
        self.schema
            .column_types
            .get(column)
            .and_then(|t| t.as_ref())
    }

    /// The charset governing a text column without an explicit charset of
    /// its own.
    pub fn effective_charset(&self) -> &str {
        self.default_charset
            .as_deref()
            .unwrap_or(MYSQL_DEFAULT_CHARSET)
    }
}

/// Derives the charset implied by a collation name, e.g. `utf8mb4_general_ci`
/// implies `utf8mb4`.
pub fn charset_from_collation(collation: &str) -> String {
    collation
        .split_once('_')
        .map(|(charset, _)| charset)
        .unwrap_or(collation)
        .to_string()
}

/// Parses the `COLUMN_TYPE` text reported by `INFORMATION_SCHEMA.COLUMNS`
/// (e.g. `int(11) unsigned`, `enum('a','b')`, `varchar(32)`) into a type
/// descriptor, using `charset` as the column's declared character set.
pub fn parse_column_type(column_type: &str, charset: Option<&str>) -> ColumnType {
    let text = column_type.trim();
    let lower = text.to_lowercase();
    let base = lower
        .split(|c: char| c == '(' || c.is_whitespace())
        .next()
        .unwrap_or(&lower)
        .to_string();

    match base.as_str() {
        "enum" => {
            let mut values = vec![String::new()];
            values.extend(parse_case_list(text));
            ColumnType::Detailed(DetailedColumnType {
                type_name: base,
                enum_values: values,
                ..Default::default()
            })
        }
        "set" => ColumnType::Detailed(DetailedColumnType {
            type_name: base,
            enum_values: parse_case_list(text),
            ..Default::default()
        }),
        "tinyint" | "smallint" | "mediumint" | "int" | "bigint" => {
            ColumnType::Detailed(DetailedColumnType {
                type_name: base,
                unsigned: lower.contains("unsigned"),
                ..Default::default()
            })
        }
        "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" => {
            ColumnType::Detailed(DetailedColumnType {
                type_name: base,
                charset: Some(charset.unwrap_or(MYSQL_DEFAULT_CHARSET).to_string()),
                ..Default::default()
            })
        }
        "binary" => ColumnType::Detailed(DetailedColumnType {
            type_name: base,
            // A bare BINARY is a synonym for BINARY(1).
            max_length: Some(parse_length(text).unwrap_or(1)),
            ..Default::default()
        }),
        _ => ColumnType::Simple(base),
    }
}

/// Extracts the quoted case list from an `enum('a','b')` or `set('a','b')`
/// declaration, undoing MySQL's single-quote escaping.
fn parse_case_list(declaration: &str) -> Vec<String> {
    let Some(open) = declaration.find('(') else {
        return Vec::new();
    };
    let Some(close) = declaration.rfind(')') else {
        return Vec::new();
    };
    let body = &declaration[open + 1..close];

    let mut cases = Vec::new();
    let mut current = String::new();
    let mut chars = body.chars().peekable();
    let mut in_quotes = false;
    while let Some(c) = chars.next() {
        if !in_quotes {
            if c == '\'' {
                in_quotes = true;
                current.clear();
            }
            continue;
        }
        match c {
            '\'' if chars.peek() == Some(&'\'') => {
                chars.next();
                current.push('\'');
            }
            '\'' => {
                in_quotes = false;
                cases.push(std::mem::take(&mut current));
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            other => current.push(other),
        }
    }
    cases
}

fn parse_length(declaration: &str) -> Option<usize> {
    let open = declaration.find('(')?;
    let close = declaration.find(')')?;
    declaration[open + 1..close].trim().parse().ok()
}
