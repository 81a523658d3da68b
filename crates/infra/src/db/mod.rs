//! Database adapters (connection pool, schema provisioning, read queries).

pub mod sqlite;

pub use sqlite::{SqliteInventoryStore, StoreError};
