//! # mysql-capture
//!
//! A MySQL change-data-capture engine that produces a consistent, resumable
//! stream of row-level changes by combining an initial table scan (the
//! *backfill*) with continuous binlog replication.
//!
//! ## Overview
//!
//! `mysql-capture` connects to MySQL as a replication client, backfills the
//! preexisting contents of each captured table, and then streams ongoing
//! changes, emitting an ordered sequence of change records plus
//! checkpointable state updates. It provides:
//!
//! - **Exactly-once per row** interleaving of backfill scans with the live
//!   replication stream, synchronized through watermark writes
//! - **Resumable state** checkpointed at transaction commit boundaries
//! - **Schema tracking** across `ALTER TABLE` and other DDL observed in the
//!   binlog
//! - **Positional fences** so a host runtime can commit checkpoints at
//!   well-defined points
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mysql_capture::mysql::MysqlDatabase;
//! use mysql_capture::output::StdoutOutput;
//! use mysql_capture::state::PersistentState;
//! use mysql_capture::{Capture, Config, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Load configuration from environment variables
//!     let config = Config::from_env()?;
//!
//!     let db = MysqlDatabase::connect(&config.mysql, &config.capture.watermarks_table).await?;
//!     let mut capture = Capture::new(
//!         db,
//!         &config.capture,
//!         PersistentState::default(),
//!         Box::new(StdoutOutput::new()),
//!     );
//!     capture.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables. Required variables:
//!
//! - `MYSQL_DATABASE` - MySQL database name
//! - `MYSQL_USERNAME` - MySQL username
//! - `MYSQL_PASSWORD` - MySQL password
//! - `CAPTURE_TABLES` - Comma-separated `schema.table[:key]` bindings
//!
//! See [`Config`] for all available options.
//!
//! ## MySQL Setup
//!
//! 1. Enable row-based binary logging in the server configuration:
//!    ```ini
//!    log-bin = binlog
//!    binlog_format = ROW
//!    ```
//!
//! 2. Create a capture user with replication privileges:
//!    ```sql
//!    CREATE USER capture IDENTIFIED BY 'secret';
//!    GRANT REPLICATION CLIENT, REPLICATION SLAVE ON *.* TO capture;
//!    GRANT SELECT, INSERT, CREATE ON *.* TO capture;
//!    ```
//!
//! ## Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`capture`] - Capture coordinator orchestrating backfill and streaming
//! - [`mysql`] - MySQL discovery, scanning, and binlog replication
//! - [`resultset`] - Buffering and patching of in-progress backfill chunks
//! - [`state`] - Resumable state and checkpoint persistence
//! - [`tuple`] - Order-preserving row-key encoding
//! - [`events`] - The normalized replication event model
//! - [`db`] - The database capability traits
//! - [`output`] - Record and checkpoint emission
//! - [`config`] - Configuration structures and parsing
//! - [`error`] - Error types and handling

/// Capture coordinator orchestrating backfill and streaming
pub mod capture;

/// Configuration structures and environment variable parsing
pub mod config;

/// Database capability traits implemented per flavor
pub mod db;

/// Error types and result handling
pub mod error;

/// The normalized replication event model
pub mod events;

/// MySQL-specific discovery, scanning, DDL handling, and replication
pub mod mysql;

/// Record and state-checkpoint emission
pub mod output;

/// Buffering of in-progress backfill chunks
pub mod resultset;

/// Resumable capture state and its persistence
pub mod state;

/// Order-preserving tuple encoding for row keys
pub mod tuple;

pub use capture::Capture;
pub use config::Config;
pub use error::{Error, Result};
