//! SQLite storage layer.
//!
//! The automation store backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod automation;
pub mod pool;
