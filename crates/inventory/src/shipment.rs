//! Shipment protocol vocabulary: state machine, outcomes and errors.
//!
//! A shipment walks a fixed protocol:
//!
//! ```text
//! START -> DECREMENTING -> DECREMENT_OK -> LOGGING -> LOG_OK -> COMMITTED
//!               |                            |           |
//!               v                            v           v
//!        DECREMENT_FAILED               LOG_FAILED   COMMIT_FAILED
//!               \____________________________|___________/
//!                                            v
//!                                       ROLLED_BACK
//! ```
//!
//! `COMMITTED` and `ROLLED_BACK` are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use stockflow_core::{DomainError, DomainResult};

use crate::item::{ItemName, Quantity, ShipmentLogEntry};

/// Position of a shipment within the transactional protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ShipmentState {
    Start,
    Decrementing,
    DecrementOk,
    Logging,
    LogOk,
    Committed,
    DecrementFailed,
    LogFailed,
    CommitFailed,
    RolledBack,
}

impl ShipmentState {
    pub fn as_str(self) -> &'static str {
        match self {
            ShipmentState::Start => "START",
            ShipmentState::Decrementing => "DECREMENTING",
            ShipmentState::DecrementOk => "DECREMENT_OK",
            ShipmentState::Logging => "LOGGING",
            ShipmentState::LogOk => "LOG_OK",
            ShipmentState::Committed => "COMMITTED",
            ShipmentState::DecrementFailed => "DECREMENT_FAILED",
            ShipmentState::LogFailed => "LOG_FAILED",
            ShipmentState::CommitFailed => "COMMIT_FAILED",
            ShipmentState::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ShipmentState::Committed | ShipmentState::RolledBack)
    }

    pub fn can_transition_to(self, next: ShipmentState) -> bool {
        use ShipmentState::*;

        matches!(
            (self, next),
            (Start, Decrementing)
                | (Decrementing, DecrementOk)
                | (Decrementing, DecrementFailed)
                | (DecrementOk, Logging)
                | (Logging, LogOk)
                | (Logging, LogFailed)
                | (LogOk, Committed)
                | (LogOk, CommitFailed)
                | (DecrementFailed, RolledBack)
                | (LogFailed, RolledBack)
                | (CommitFailed, RolledBack)
        )
    }

    /// Move to `next`, rejecting transitions the protocol does not allow.
    pub fn advance(self, next: ShipmentState) -> DomainResult<ShipmentState> {
        if !self.can_transition_to(next) {
            return Err(DomainError::invariant(format!(
                "illegal shipment transition {} -> {}",
                self.as_str(),
                next.as_str()
            )));
        }
        Ok(next)
    }
}

impl core::fmt::Display for ShipmentState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage step during which a fault occurred.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ShipmentStage {
    /// Opening the transaction.
    Begin,
    /// The guarded `UPDATE inventory`.
    Decrement,
    /// The `INSERT INTO shipment_log`.
    Log,
    Commit,
}

impl ShipmentStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ShipmentStage::Begin => "begin",
            ShipmentStage::Decrement => "decrement",
            ShipmentStage::Log => "log",
            ShipmentStage::Commit => "commit",
        }
    }

    /// The failure state the protocol enters when this stage faults.
    ///
    /// A transaction that never opened could not decrement, so `Begin`
    /// shares `DECREMENT_FAILED`.
    pub fn failed_state(self) -> ShipmentState {
        match self {
            ShipmentStage::Begin | ShipmentStage::Decrement => ShipmentState::DecrementFailed,
            ShipmentStage::Log => ShipmentState::LogFailed,
            ShipmentStage::Commit => ShipmentState::CommitFailed,
        }
    }
}

impl core::fmt::Display for ShipmentStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a shipment did not commit. Every variant implies nothing was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShipmentError {
    /// The request was rejected before a transaction was opened.
    #[error("invalid shipment request: {0}")]
    InvalidRequest(#[from] DomainError),

    /// The guarded decrement did not affect exactly one row.
    #[error("Not enough stock available or item does not exist")]
    InsufficientStockOrMissingItem {
        item_name: ItemName,
        requested: Quantity,
        rows_affected: u64,
    },

    /// The store failed underneath the protocol.
    #[error("storage fault during {stage}: {message}")]
    StorageFault { stage: ShipmentStage, message: String },
}

impl ShipmentError {
    pub fn storage(stage: ShipmentStage, message: impl Into<String>) -> Self {
        Self::StorageFault {
            stage,
            message: message.into(),
        }
    }

    /// The failure state reached before rolling back, if a transaction was involved.
    pub fn failed_state(&self) -> Option<ShipmentState> {
        match self {
            ShipmentError::InvalidRequest(_) => None,
            ShipmentError::InsufficientStockOrMissingItem { .. } => {
                Some(ShipmentState::DecrementFailed)
            }
            ShipmentError::StorageFault { stage, .. } => Some(stage.failed_state()),
        }
    }

    pub fn is_insufficient_stock(&self) -> bool {
        matches!(self, ShipmentError::InsufficientStockOrMissingItem { .. })
    }
}

/// Proof of a committed shipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentReceipt {
    /// Correlation id for logs and callers; not persisted.
    pub shipment_id: Uuid,
    pub item_name: ItemName,
    pub quantity: Quantity,
    pub committed_at: DateTime<Utc>,
}

impl ShipmentReceipt {
    pub fn log_entry(&self) -> ShipmentLogEntry {
        ShipmentLogEntry {
            item_name: self.item_name.clone(),
            qty_moved: self.quantity.get(),
        }
    }
}
