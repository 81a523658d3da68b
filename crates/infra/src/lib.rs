//! Infrastructure layer: SQLite store, configuration, and the transactional
//! shipment processor.

pub mod config;
pub mod db;
pub mod shipment;


pub use config::{ConfigError, StoreConfig};
pub use db::{SqliteInventoryStore, StoreError};
pub use shipment::ShipmentProcessor;
