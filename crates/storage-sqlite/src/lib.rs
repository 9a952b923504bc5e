//! SQLite persistence for the op log and ancillary sync state.

pub mod db;
pub mod errors;
pub mod oplog;
pub mod schema;

pub use db::{create_pool, DbPool};
pub use errors::StorageError;
pub use oplog::SqliteOpLog;
