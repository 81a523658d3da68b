use serde::{Deserialize, Serialize};

use stockflow_core::{DomainError, DomainResult, ValueObject};

/// Name of an inventory item (the unique key of an inventory record).
///
/// Stored verbatim; only empty or whitespace-only names are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemName(String);

impl ItemName {
    pub fn new(name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("item name cannot be empty"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for ItemName {}

impl core::fmt::Display for ItemName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ItemName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ItemName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ItemName {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ItemName> for String {
    fn from(value: ItemName) -> Self {
        value.0
    }
}

/// Number of units moved by one shipment. Always strictly positive.
///
/// A non-positive quantity would turn the guarded decrement into an increment
/// (`stock_qty - (-n)`), so it is rejected before any storage is touched.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Quantity(i64);

impl Quantity {
    pub fn new(value: i64) -> DomainResult<Self> {
        if value <= 0 {
            return Err(DomainError::validation(format!(
                "quantity must be positive (got {value})"
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl ValueObject for Quantity {}

impl core::fmt::Display for Quantity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl TryFrom<i64> for Quantity {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quantity> for i64 {
    fn from(value: Quantity) -> Self {
        value.0
    }
}

/// Read model: one row of the `inventory` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub item_name: ItemName,
    pub stock_qty: i64,
}

/// Read model: one row of the append-only `shipment_log` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentLogEntry {
    pub item_name: ItemName,
    pub qty_moved: i64,
}

/// A validated request to ship `quantity` units of `item_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentRequest {
    pub item_name: ItemName,
    pub quantity: Quantity,
}

impl ShipmentRequest {
    pub fn new(item_name: &str, quantity: i64) -> DomainResult<Self> {
        Ok(Self {
            item_name: ItemName::new(item_name)?,
            quantity: Quantity::new(quantity)?,
        })
    }

    /// The audit row a successful shipment appends.
    pub fn log_entry(&self) -> ShipmentLogEntry {
        ShipmentLogEntry {
            item_name: self.item_name.clone(),
            qty_moved: self.quantity.get(),
        }
    }
}
