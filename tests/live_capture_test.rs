//! End-to-end tests against a real MySQL server.
//!
//! These require a server with `binlog_format=ROW` reachable through the
//! `TEST_MYSQL_*` environment variables and are ignored by default.
//! Run with: cargo test -- --ignored

use mysql_capture::config::{MysqlConfig, SslMode};
use mysql_capture::db::Database;
use mysql_capture::mysql::MysqlDatabase;
use std::env;

fn test_config() -> MysqlConfig {
    MysqlConfig {
        host: env::var("TEST_MYSQL_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_MYSQL_PORT")
            .unwrap_or_else(|_| "3306".to_string())
            .parse()
            .unwrap_or(3306),
        database: env::var("TEST_MYSQL_DATABASE").unwrap_or_else(|_| "test".to_string()),
        username: env::var("TEST_MYSQL_USERNAME").unwrap_or_else(|_| "root".to_string()),
        password: env::var("TEST_MYSQL_PASSWORD").unwrap_or_else(|_| "secret".to_string()),
        server_id: 59999,
        connect_timeout_secs: 30,
        ssl_mode: SslMode::Disable,
    }
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored live_connect_and_discover
async fn live_connect_and_discover() {
    let config = test_config();
    let watermarks = format!("{}.watermarks", config.database);
    let db = MysqlDatabase::connect(&config, &watermarks).await.unwrap();

    let tables = db.discover_tables().await.unwrap();
    assert!(
        tables.contains_key(&watermarks),
        "watermarks table should be created and discoverable"
    );

    let position = db.replication_stream("").await;
    assert!(position.is_ok(), "server should report a binlog position");
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored live_watermark_roundtrip
async fn live_watermark_roundtrip() {
    let config = test_config();
    let watermarks = format!("{}.watermarks", config.database);
    let db = MysqlDatabase::connect(&config, &watermarks).await.unwrap();

    db.write_watermark("test-watermark-1").await.unwrap();
    // The upsert replaces the single sentinel row; a second write must not
    // fail or accumulate rows.
    db.write_watermark("test-watermark-2").await.unwrap();
}
