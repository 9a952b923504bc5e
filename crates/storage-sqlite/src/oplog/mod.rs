//! SQLite-backed op log store.

mod model;
mod repository;

pub use model::{OpLogRowDB, SyncClientRowDB, SyncCursorRowDB, SyncEngineStateRowDB};
pub use repository::SqliteOpLog;
