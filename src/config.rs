//! Configuration module for mysql-capture.
//!
//! This module provides configuration structures and utilities for loading
//! settings from environment variables. All configuration follows the 12-factor
//! app methodology.
//!
//! # Example
//!
//! ```rust,no_run
//! use mysql_capture::Config;
//!
//! // Load from environment variables
//! let config = Config::from_env().expect("Failed to load config");
//!
//! println!("Capturing from MySQL at {}:{}",
//!          config.mysql.host, config.mysql.port);
//! println!("Configured tables: {:?}",
//!          config.capture.bindings);
//! ```

use crate::Error;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main configuration structure containing all settings for mysql-capture.
///
/// Configuration is organized into two sections:
/// - `mysql` - MySQL connection and replication settings
/// - `capture` - Capture behavior and tuning parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub mysql: MysqlConfig,
    pub capture: CaptureConfig,
}

/// MySQL connection and replication configuration.
///
/// Contains all settings needed to establish both an ordinary query
/// connection and a binlog replication connection to MySQL.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// The server ID this capture registers with when requesting the binlog.
    /// Must be distinct from every other replica of the same server.
    pub server_id: u32,
    pub connect_timeout_secs: u64,
    pub ssl_mode: SslMode,
}

/// SSL/TLS connection mode for MySQL.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub enum SslMode {
    #[default]
    Disable,
    Prefer,
    Require,
}

impl std::str::FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            _ => Err(format!(
                "Invalid SSL mode: {s}. Valid values: disable, prefer, require"
            )),
        }
    }
}

/// A single table selected for capture.
///
/// `key_columns` optionally overrides the table's native primary key as the
/// backfill scan key. When empty, the discovered primary key is used.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Binding {
    pub stream_id: String,
    #[serde(default)]
    pub key_columns: Vec<String>,
}

impl std::str::FromStr for Binding {
    type Err = String;

    /// Parses a binding of the form `schema.table` or `schema.table:col+col`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stream, key) = match s.split_once(':') {
            Some((stream, key)) => (stream, Some(key)),
            None => (s, None),
        };
        if !stream.contains('.') {
            return Err(format!(
                "invalid table {s:?}: expected <schema>.<table> or <schema>.<table>:<col>+<col>"
            ));
        }
        let key_columns = key
            .map(|k| {
                k.split('+')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Binding {
            stream_id: stream.trim().to_lowercase(),
            key_columns,
        })
    }
}

/// Capture behavior and tuning configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    /// Tables to capture, in `schema.table[:key]` form.
    pub bindings: Vec<Binding>,
    /// Fully-qualified name of the watermarks table.
    pub watermarks_table: String,
    /// Maximum number of rows fetched by one backfill scan.
    pub chunk_size: usize,
    /// Path used to persist state checkpoints between runs.
    pub state_file: Option<PathBuf>,
    /// When true, keep streaming changes forever after the backfill
    /// completes. When false, stream up to one final watermark and exit.
    pub tail: bool,
    /// How long each steady-state streaming cycle runs before a fence is
    /// established and a checkpoint becomes due.
    pub poll_interval_secs: u64,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `MYSQL_DATABASE` - MySQL database name
    /// - `MYSQL_USERNAME` - MySQL username
    /// - `MYSQL_PASSWORD` - MySQL password
    /// - `CAPTURE_TABLES` - Comma-separated list of `schema.table[:key]` bindings
    ///
    /// Optional variables have sensible defaults. See the struct fields
    /// for documentation of all available options.
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - Required environment variables are missing
    /// - Values cannot be parsed (e.g., invalid port number)
    /// - Values are invalid (e.g., empty table list)
    pub fn from_env() -> crate::Result<Self> {
        let database = env::var("MYSQL_DATABASE")
            .map_err(|_| Error::Config("MYSQL_DATABASE is required".to_string()))?;

        let mysql = MysqlConfig {
            host: env::var("MYSQL_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("MYSQL_PORT")
                .unwrap_or_else(|_| "3306".to_string())
                .parse::<u16>()
                .map_err(|_| Error::Config("MYSQL_PORT must be a valid port number".to_string()))?,
            database: database.clone(),
            username: env::var("MYSQL_USERNAME")
                .map_err(|_| Error::Config("MYSQL_USERNAME is required".to_string()))?,
            password: env::var("MYSQL_PASSWORD")
                .map_err(|_| Error::Config("MYSQL_PASSWORD is required".to_string()))?,
            server_id: env::var("MYSQL_SERVER_ID")
                .unwrap_or_else(|_| "5678".to_string())
                .parse::<u32>()
                .map_err(|_| Error::Config("MYSQL_SERVER_ID must be a number".to_string()))?,
            connect_timeout_secs: env::var("MYSQL_CONNECT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse::<u64>()
                .unwrap_or(30),
            ssl_mode: env::var("MYSQL_SSL_MODE")
                .unwrap_or_else(|_| "disable".to_string())
                .parse::<SslMode>()
                .map_err(Error::Config)?,
        };

        let bindings = env::var("CAPTURE_TABLES")
            .map_err(|_| Error::Config("CAPTURE_TABLES is required".to_string()))?
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<Binding>().map_err(Error::Config))
            .collect::<crate::Result<Vec<_>>>()?;

        if bindings.is_empty() {
            return Err(Error::Config(
                "CAPTURE_TABLES must contain at least one table".to_string(),
            ));
        }

        let capture = CaptureConfig {
            bindings,
            watermarks_table: env::var("CAPTURE_WATERMARKS_TABLE")
                .unwrap_or_else(|_| format!("{database}.watermarks"))
                .to_lowercase(),
            chunk_size: env::var("CAPTURE_CHUNK_SIZE")
                .unwrap_or_else(|_| "4096".to_string())
                .parse::<usize>()
                .unwrap_or(4096),
            state_file: env::var("CAPTURE_STATE_FILE").ok().map(PathBuf::from),
            tail: env::var("CAPTURE_TAIL")
                .unwrap_or_else(|_| "true".to_string())
                .parse::<bool>()
                .map_err(|_| Error::Config("CAPTURE_TAIL must be true or false".to_string()))?,
            poll_interval_secs: env::var("CAPTURE_POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse::<u64>()
                .unwrap_or(5),
        };

        if !capture.watermarks_table.contains('.') {
            return Err(Error::Config(format!(
                "CAPTURE_WATERMARKS_TABLE {:?} must be fully qualified as <schema>.<table>",
                capture.watermarks_table
            )));
        }

        Ok(Config { mysql, capture })
    }
}

impl MysqlConfig {
    /// Builds connection options for an ordinary (non-replication) session.
    pub fn connection_opts(&self) -> mysql_async::Opts {
        let ssl_opts = match self.ssl_mode {
            SslMode::Disable => None,
            // Matches the permissive verification the replication link uses;
            // the endpoint address is trusted configuration.
            SslMode::Prefer | SslMode::Require => Some(
                mysql_async::SslOpts::default()
                    .with_danger_accept_invalid_certs(true)
                    .with_danger_skip_domain_validation(true),
            ),
        };
        mysql_async::OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .db_name(Some(self.database.clone()))
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .ssl_opts(ssl_opts)
            .into()
    }
}
