//! Emission of records and state checkpoints to the host runtime.
//!
//! The capture writes two kinds of messages: change records (the decoded
//! row image plus a `_meta` envelope describing the operation and its
//! provenance) and state checkpoints. In normal usage these are JSON lines
//! on stdout; tests substitute an in-memory sink.

use crate::events::{ChangeEvent, ChangeOperation};
use crate::state::PersistentState;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::Write;

/// A single message written to the host runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Record(RecordMessage),
    Checkpoint(CheckpointMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMessage {
    pub namespace: String,
    pub stream: String,
    pub emitted_at: i64,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMessage {
    pub state: Value,
}

/// The thing to which the capture writes records and state checkpoints.
/// A JSON-lines stdout writer satisfies this in normal usage; tests use a
/// sink which collects messages in memory.
pub trait MessageOutput: Send {
    fn write(&mut self, message: Message) -> Result<()>;
}

/// Builds the record message for a change event.
///
/// The row image is the after-image for inserts and updates and the
/// before-image for deletes; updates additionally carry their before-image
/// inside `_meta` so downstream reductions can retract the old row.
pub fn record_message(event: &ChangeEvent) -> Result<Message> {
    let mut data = match event.operation {
        ChangeOperation::Insert | ChangeOperation::Update => {
            event.after.clone().ok_or_else(|| missing_image(event))?
        }
        ChangeOperation::Delete => event.before.clone().ok_or_else(|| missing_image(event))?,
    };

    let mut meta = json!({
        "op": operation_code(event.operation),
        "source": event.source,
    });
    if event.operation == ChangeOperation::Update {
        if let Some(before) = &event.before {
            meta["before"] = Value::Object(before.clone());
        }
    }
    data.insert("_meta".to_string(), meta);

    Ok(Message::Record(RecordMessage {
        namespace: event.source.schema.clone(),
        stream: event.source.table.clone(),
        emitted_at: chrono::Utc::now().timestamp_millis(),
        data: Value::Object(data),
    }))
}

/// Builds the checkpoint message for the current state.
pub fn checkpoint_message(state: &PersistentState) -> Result<Message> {
    Ok(Message::Checkpoint(CheckpointMessage {
        state: serde_json::to_value(state)?,
    }))
}

fn operation_code(op: ChangeOperation) -> &'static str {
    match op {
        ChangeOperation::Insert => "c",
        ChangeOperation::Update => "u",
        ChangeOperation::Delete => "d",
    }
}

fn missing_image(event: &ChangeEvent) -> Error {
    Error::Consistency {
        message: format!(
            "{:?} event on {:?} is missing its row image",
            event.operation, event.source.table
        ),
    }
}

/// Writes messages as JSON lines to stdout.
pub struct StdoutOutput {
    writer: std::io::Stdout,
}

impl StdoutOutput {
    pub fn new() -> Self {
        Self {
            writer: std::io::stdout(),
        }
    }
}

impl Default for StdoutOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageOutput for StdoutOutput {
    fn write(&mut self, message: Message) -> Result<()> {
        let mut lock = self.writer.lock();
        serde_json::to_writer(&mut lock, &message)?;
        lock.write_all(b"\n")?;
        lock.flush()?;
        Ok(())
    }
}

/// Collects messages in memory. Used by tests to assert on the exact
/// sequence of records and checkpoints a capture produces.
#[derive(Debug, Default)]
pub struct MemoryOutput {
    pub messages: Vec<Message>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<&RecordMessage> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::Record(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    pub fn checkpoints(&self) -> Vec<&CheckpointMessage> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::Checkpoint(checkpoint) => Some(checkpoint),
                _ => None,
            })
            .collect()
    }
}

impl MessageOutput for MemoryOutput {
    fn write(&mut self, message: Message) -> Result<()> {
        self.messages.push(message);
        Ok(())
    }
}
