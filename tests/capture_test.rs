//! End-to-end coordinator tests over a scripted in-memory database.

mod common;

use common::{MockDatabase, ScriptOp, SharedOutput};
use mysql_capture::config::{Binding, CaptureConfig};
use mysql_capture::output::Message;
use mysql_capture::state::{PersistentState, TableMode, TableState};
use mysql_capture::Capture;
use serde_json::{json, Value};

fn capture_config(chunk_size: usize) -> CaptureConfig {
    CaptureConfig {
        bindings: vec![Binding {
            stream_id: "public.t".to_string(),
            key_columns: vec![],
        }],
        watermarks_table: common::WATERMARKS_STREAM.to_string(),
        chunk_size,
        state_file: None,
        tail: false,
        poll_interval_secs: 0,
    }
}

fn row(id: i64, value: &str) -> Value {
    json!({"id": id, "value": value})
}

/// Records emitted for `public.t`, as `(id, value, op, snapshot)` tuples.
fn t_records(output: &SharedOutput) -> Vec<(i64, String, String, bool)> {
    output
        .messages()
        .iter()
        .filter_map(|message| match message {
            Message::Record(record) if record.stream == "t" => Some((
                record.data["id"].as_i64().unwrap(),
                record.data["value"].as_str().unwrap_or_default().to_string(),
                record.data["_meta"]["op"].as_str().unwrap().to_string(),
                record.data["_meta"]["source"]["snapshot"].as_bool().unwrap_or(false),
            )),
            _ => None,
        })
        .collect()
}

fn checkpoints(output: &SharedOutput) -> Vec<Value> {
    output
        .messages()
        .iter()
        .filter_map(|message| match message {
            Message::Checkpoint(checkpoint) => Some(checkpoint.state.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_backfill_merges_concurrent_changes() {
    let db = MockDatabase::new();
    db.add_table(
        "public.t",
        &["id"],
        &["id", "value"],
        vec![row(1, "a"), row(2, "b"), row(3, "c")],
    );
    // Nothing happens before the first sync point; then, while the first
    // chunk sits in the buffer, a concurrent transaction inserts row 4 and
    // updates row 2.
    db.push_batch(vec![]);
    db.push_batch(vec![
        ScriptOp::Insert("public.t", row(4, "d")),
        ScriptOp::Update("public.t", row(2, "B")),
        ScriptOp::Commit,
    ]);

    let output = SharedOutput::new();
    let mut capture = Capture::new(
        db.clone(),
        &capture_config(100),
        PersistentState::default(),
        Box::new(output.clone()),
    );
    capture.run().await.unwrap();

    // The update to row 2 was merged in the buffer and row 4 joined the
    // chunk; everything comes out as inserts in key order, exactly once.
    let records = t_records(&output);
    assert_eq!(
        records,
        vec![
            (1, "a".to_string(), "c".to_string(), true),
            (2, "B".to_string(), "c".to_string(), true),
            (3, "c".to_string(), "c".to_string(), true),
            (4, "d".to_string(), "c".to_string(), true),
        ]
    );

    let final_state = capture.state();
    assert_eq!(final_state.streams["public.t"].mode, TableMode::Active);
    assert!(final_state.streams["public.t"].scanned.is_none());
    assert!(!final_state.cursor.is_empty());
}

#[tokio::test]
async fn test_exactly_once_across_chunked_backfill() {
    let db = MockDatabase::new();
    let initial: Vec<Value> = (1..=10).map(|id| row(id, "v")).collect();
    db.add_table("public.t", &["id"], &["id", "value"], initial);
    // Chunk size 3 forces four scan cycles; changes land between them.
    db.push_batch(vec![]);
    db.push_batch(vec![
        ScriptOp::Insert("public.t", row(11, "new")),
        ScriptOp::Commit,
    ]);
    db.push_batch(vec![
        ScriptOp::Update("public.t", row(5, "patched")),
        ScriptOp::Commit,
    ]);
    db.push_batch(vec![
        ScriptOp::Delete("public.t", json!({"id": 9})),
        ScriptOp::Commit,
    ]);

    let output = SharedOutput::new();
    let mut capture = Capture::new(
        db.clone(),
        &capture_config(3),
        PersistentState::default(),
        Box::new(output.clone()),
    );
    capture.run().await.unwrap();

    let records = t_records(&output);

    // Exactly-once per row: each surviving id exactly once, the deleted row
    // never, the patched row with its final value.
    let ids: Vec<i64> = records.iter().map(|(id, ..)| *id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7, 8, 10, 11]);
    let patched: Vec<&(i64, String, String, bool)> =
        records.iter().filter(|(id, ..)| *id == 5).collect();
    assert_eq!(patched.len(), 1);
    assert_eq!(patched[0].1, "patched");

    // Key ordering: backfill output is strictly increasing.
    let mut sorted = ids.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(ids, sorted);

    assert_eq!(capture.state().streams["public.t"].mode, TableMode::Active);
}

#[tokio::test]
async fn test_resume_from_checkpoint_does_not_replay_backfill() {
    let db = MockDatabase::new();
    db.add_table(
        "public.t",
        &["id"],
        &["id", "value"],
        vec![row(1, "a"), row(2, "b")],
    );
    db.push_batch(vec![]);

    let output = SharedOutput::new();
    let mut capture = Capture::new(
        db.clone(),
        &capture_config(100),
        PersistentState::default(),
        Box::new(output.clone()),
    );
    capture.run().await.unwrap();
    let resumed_state = capture.state().clone();
    assert_eq!(resumed_state.streams["public.t"].mode, TableMode::Active);
    let first_run_records = t_records(&output).len();
    assert_eq!(first_run_records, 2);

    // Restart from the emitted checkpoint; a commit made while the capture
    // was down is emitted exactly once, with no backfill replay.
    db.push_batch(vec![
        ScriptOp::Insert("public.t", row(3, "late")),
        ScriptOp::Commit,
    ]);
    let output2 = SharedOutput::new();
    let mut capture2 = Capture::new(
        db.clone(),
        &capture_config(100),
        resumed_state.clone(),
        Box::new(output2.clone()),
    );
    capture2.run().await.unwrap();

    let records = t_records(&output2);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, 3);
    assert_eq!(records[0].2, "c");
    assert!(!records[0].3, "no snapshot records on resume");

    // The second run opened replication at the checkpointed cursor.
    let start_cursors = db.shared.lock().unwrap().start_cursors.clone();
    assert_eq!(start_cursors.len(), 2);
    assert_eq!(start_cursors[0], "");
    assert_eq!(start_cursors[1], resumed_state.cursor);
}

#[tokio::test]
async fn test_drop_table_after_backfill_ignores_later_events() {
    let db = MockDatabase::new();
    db.add_table(
        "public.t",
        &["id"],
        &["id", "value"],
        vec![row(1, "a"), row(2, "b"), row(3, "c")],
    );
    db.push_batch(vec![]);
    db.push_batch(vec![ScriptOp::Commit]);
    // After the backfill completes, the table is dropped; the row event
    // following the drop must not be emitted.
    db.push_batch(vec![
        ScriptOp::DropTable("public.t"),
        ScriptOp::Insert("public.t", row(9, "x")),
        ScriptOp::Commit,
    ]);

    let output = SharedOutput::new();
    let mut capture = Capture::new(
        db.clone(),
        &capture_config(100),
        PersistentState::default(),
        Box::new(output.clone()),
    );
    capture.run().await.unwrap();

    let records = t_records(&output);
    let ids: Vec<i64> = records.iter().map(|(id, ..)| *id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(capture.state().streams["public.t"].mode, TableMode::Ignore);
}

#[tokio::test]
async fn test_drop_table_during_backfill_discards_buffer() {
    let db = MockDatabase::new();
    db.add_table(
        "public.t",
        &["id"],
        &["id", "value"],
        vec![row(1, "a"), row(2, "b")],
    );
    db.push_batch(vec![]);
    db.push_batch(vec![ScriptOp::DropTable("public.t"), ScriptOp::Commit]);

    let output = SharedOutput::new();
    let mut capture = Capture::new(
        db.clone(),
        &capture_config(100),
        PersistentState::default(),
        Box::new(output.clone()),
    );
    capture.run().await.unwrap();

    assert!(t_records(&output).is_empty());
    assert_eq!(capture.state().streams["public.t"].mode, TableMode::Ignore);
}

#[tokio::test]
async fn test_checkpoint_cursors_are_ordered_and_parseable() {
    let db = MockDatabase::new();
    db.add_table(
        "public.t",
        &["id"],
        &["id", "value"],
        vec![row(1, "a"), row(2, "b")],
    );
    db.push_batch(vec![]);
    db.push_batch(vec![
        ScriptOp::Insert("public.t", row(3, "c")),
        ScriptOp::Commit,
    ]);

    let output = SharedOutput::new();
    let mut capture = Capture::new(
        db.clone(),
        &capture_config(100),
        PersistentState::default(),
        Box::new(output.clone()),
    );
    capture.run().await.unwrap();

    let cursors: Vec<u64> = checkpoints(&output)
        .iter()
        .filter_map(|state| state["cursor"].as_str().map(|c| c.to_string()))
        .filter(|cursor| !cursor.is_empty())
        .map(|cursor| {
            let (file, pos) = cursor.rsplit_once(':').expect("well-formed cursor");
            assert_eq!(file, "binlog.000001");
            pos.parse::<u64>().expect("numeric offset")
        })
        .collect();
    assert!(!cursors.is_empty());
    assert!(
        cursors.windows(2).all(|pair| pair[0] <= pair[1]),
        "checkpoint cursors must never move backwards: {cursors:?}"
    );

    // The final checkpoint reflects the completed backfill.
    let last = checkpoints(&output).last().unwrap().clone();
    assert_eq!(last["streams"]["public.t"]["mode"], json!("Active"));
}

#[tokio::test]
async fn test_binding_without_key_is_rejected() {
    let db = MockDatabase::new();
    db.add_table("public.t", &[], &["id", "value"], vec![]);

    let output = SharedOutput::new();
    let mut capture = Capture::new(
        db.clone(),
        &capture_config(100),
        PersistentState::default(),
        Box::new(output.clone()),
    );
    let result = capture.run().await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_persisted_key_mismatch_is_fatal() {
    let db = MockDatabase::new();
    db.add_table("public.t", &["id"], &["id", "value"], vec![row(1, "a")]);

    let mut state = PersistentState::default();
    state.streams.insert(
        "public.t".to_string(),
        TableState::new_backfill(vec!["other".to_string()]),
    );

    let output = SharedOutput::new();
    let mut capture = Capture::new(
        db.clone(),
        &capture_config(100),
        state,
        Box::new(output.clone()),
    );
    assert!(capture.run().await.is_err());
}

#[tokio::test]
async fn test_removed_binding_state_is_dropped() {
    let db = MockDatabase::new();
    db.add_table("public.t", &["id"], &["id", "value"], vec![]);
    db.push_batch(vec![]);

    let mut state = PersistentState::default();
    state.streams.insert(
        "public.gone".to_string(),
        TableState::new_backfill(vec!["id".to_string()]),
    );

    let output = SharedOutput::new();
    let mut capture = Capture::new(
        db.clone(),
        &capture_config(100),
        state,
        Box::new(output.clone()),
    );
    capture.run().await.unwrap();

    assert!(!capture.state().streams.contains_key("public.gone"));
    assert!(capture.state().streams.contains_key("public.t"));
}
