//! Decoding of raw row images into JSON row maps.
//!
//! The binlog carries positional row values with no column names and no
//! type detail beyond what the wire format needs, so decoding zips the
//! tracked column-name list with the row image and normalizes each value
//! according to the tracked column type: text is decoded per the column
//! charset, unsigned integers are reinterpreted from their signed wire
//! form, enum ordinals become their declared case, and binary values are
//! carried as base64.

use super::types::{ColumnType, TableMetadata};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{NaiveDate, NaiveTime};
use serde_json::{Map, Number, Value};

/// Decodes a positional row image into a column-name to value map.
///
/// `values` must have exactly one entry per tracked column; `None` entries
/// are columns omitted from the image by the skipped-column mask and are
/// left out of the result. An arity mismatch means the tracked metadata has
/// drifted from the actual table schema and is fatal.
pub fn decode_row(
    stream_id: &str,
    metadata: &TableMetadata,
    values: Vec<Option<mysql_async::Value>>,
) -> Result<Map<String, Value>> {
    let columns = &metadata.schema.columns;
    if columns.is_empty() {
        return Err(Error::Consistency {
            message: format!("unknown column names for stream {stream_id:?}"),
        });
    }
    if values.len() != columns.len() {
        return Err(Error::Consistency {
            message: format!(
                "change event on stream {stream_id:?} contains {} values, expected {}",
                values.len(),
                columns.len()
            ),
        });
    }

    let mut fields = Map::new();
    for (name, value) in columns.iter().zip(values) {
        if let Some(value) = value {
            fields.insert(
                name.clone(),
                translate_value(metadata.column_type(name), value)?,
            );
        }
    }
    Ok(fields)
}

/// Fills out any properties missing from `fields` with the corresponding
/// values from `preimage`. Update events may omit unchanged columns from
/// the after-image; those inherit from the before-image.
pub fn merge_preimage(fields: &mut Map<String, Value>, preimage: &Map<String, Value>) {
    for (key, value) in preimage {
        if !fields.contains_key(key) {
            fields.insert(key.clone(), value.clone());
        }
    }
}

/// Normalizes a single raw value into its canonical JSON form.
pub fn translate_value(
    column_type: Option<&ColumnType>,
    value: mysql_async::Value,
) -> Result<Value> {
    use mysql_async::Value as V;

    match value {
        V::NULL => Ok(Value::Null),
        V::Int(n) => translate_integer(column_type, n),
        V::UInt(n) => Ok(Value::Number(Number::from(n))),
        V::Float(f) => Ok(float_value(f as f64)),
        V::Double(d) => Ok(float_value(d)),
        V::Bytes(bytes) => translate_bytes(column_type, bytes),
        V::Date(year, month, day, hour, minute, second, micros) => {
            let date = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32).ok_or(
                Error::InvalidMessage {
                    message: format!("invalid date {year:04}-{month:02}-{day:02}"),
                },
            )?;
            if column_type.map(|t| t.type_name()) == Some("date") {
                return Ok(Value::String(date.format("%Y-%m-%d").to_string()));
            }
            let time = NaiveTime::from_hms_micro_opt(
                hour as u32,
                minute as u32,
                second as u32,
                micros,
            )
            .ok_or(Error::InvalidMessage {
                message: format!("invalid time {hour:02}:{minute:02}:{second:02}.{micros:06}"),
            })?;
            Ok(Value::String(
                date.and_time(time).format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            ))
        }
        V::Time(negative, days, hours, minutes, seconds, micros) => {
            let total_hours = days * 24 + hours as u32;
            let sign = if negative { "-" } else { "" };
            Ok(Value::String(format!(
                "{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
            )))
        }
    }
}

fn translate_integer(column_type: Option<&ColumnType>, n: i64) -> Result<Value> {
    let Some(ColumnType::Detailed(detailed)) = column_type else {
        return Ok(Value::Number(Number::from(n)));
    };

    match detailed.type_name.as_str() {
        "enum" => {
            let index = usize::try_from(n).ok();
            match index.and_then(|i| detailed.enum_values.get(i)) {
                Some(case) => Ok(Value::String(case.clone())),
                None => Err(Error::Consistency {
                    message: format!(
                        "enum value {n} out of range for declared cases {:?}",
                        detailed.enum_values
                    ),
                }),
            }
        }
        "set" => {
            let mut cases = Vec::new();
            for (bit, case) in detailed.enum_values.iter().enumerate() {
                if n & (1 << bit) != 0 {
                    cases.push(case.as_str());
                }
            }
            Ok(Value::String(cases.join(",")))
        }
        type_name if detailed.unsigned => {
            // The binlog encodes all integers in their signed wire form;
            // unsigned columns are reinterpreted by declared width.
            let unsigned = match type_name {
                "tinyint" => (n as i8 as u8) as u64,
                "smallint" => (n as i16 as u16) as u64,
                "mediumint" => (n as u64) & 0x00FF_FFFF,
                "int" => (n as i32 as u32) as u64,
                _ => n as u64,
            };
            Ok(Value::Number(Number::from(unsigned)))
        }
        _ => Ok(Value::Number(Number::from(n))),
    }
}

fn translate_bytes(column_type: Option<&ColumnType>, mut bytes: Vec<u8>) -> Result<Value> {
    let detailed = match column_type {
        Some(ColumnType::Detailed(detailed)) => Some(detailed),
        _ => None,
    };
    let type_name = column_type.map(|t| t.type_name()).unwrap_or("");

    let is_binary = matches!(
        type_name,
        "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob"
    ) || detailed.and_then(|d| d.charset.as_deref()) == Some("binary");

    if is_binary {
        if type_name == "binary" {
            // Fixed-length binary values are right-padded with zero bytes to
            // their declared width.
            if let Some(length) = detailed.and_then(|d| d.max_length) {
                if bytes.len() < length {
                    bytes.resize(length, 0);
                }
            }
        }
        return Ok(Value::String(BASE64.encode(bytes)));
    }

    // Everything else arrives as a byte string holding text in the column
    // charset: char/varchar/text, but also decimals, JSON documents, and
    // temporal values from plain query results.
    Ok(Value::String(
        String::from_utf8_lossy(&bytes).into_owned(),
    ))
}

fn float_value(f: f64) -> Value {
    match Number::from_f64(f) {
        Some(n) => Value::Number(n),
        None => Value::Null,
    }
}
