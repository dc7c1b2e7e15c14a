//! Durable append-only log backends.

pub mod libsql_log;
pub mod memory;
pub mod traits;

pub use libsql_log::LibSqlLog;
pub use memory::MemoryLog;
pub use traits::SnapshotLog;
