//! Inventory shipment domain module.
//!
//! This crate contains the business vocabulary for shipping stock out of
//! inventory: validated item names and quantities, the shipment protocol's
//! state machine, its outcome types, and the progress narration emitted to a
//! report sink. It is pure domain logic (no IO, no storage).

pub mod item;
pub mod report;
pub mod shipment;

pub use item::{InventoryRecord, ItemName, Quantity, ShipmentLogEntry, ShipmentRequest};
pub use report::{CollectingSink, ProgressMessage, ProgressSink, TracingSink};
pub use shipment::{ShipmentError, ShipmentReceipt, ShipmentStage, ShipmentState};
