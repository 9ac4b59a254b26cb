pub mod connection;
pub mod ddl;
pub mod decoder;
pub mod replication;
pub mod types;




pub use connection::MysqlDatabase;
pub use replication::MysqlReplicationStream;
pub use types::{BinlogCursor, ColumnType, TableMetadata};
