//! Shipment processing: the transactional stock-deduction protocol.

pub mod processor;

pub use processor::ShipmentProcessor;
