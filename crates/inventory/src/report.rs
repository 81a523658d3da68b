//! Human-readable progress narration for the shipment protocol.
//!
//! The processor narrates every step to a [`ProgressSink`] supplied by the
//! caller (a GUI console, a log, a test buffer). Narration is independent of
//! the returned outcome; the sink never influences the transaction.

/// Receiver of progress narration, one plain-text line per protocol step.
///
/// Called synchronously, in step order. Implementations must not fail.
pub trait ProgressSink {
    fn report(&mut self, message: &str);
}

impl<F> ProgressSink for F
where
    F: FnMut(&str),
{
    fn report(&mut self, message: &str) {
        self(message)
    }
}

/// Sink that keeps every message, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectingSink {
    messages: Vec<String>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn last(&self) -> Option<&str> {
        self.messages.last().map(String::as_str)
    }

    pub fn into_messages(self) -> Vec<String> {
        self.messages
    }
}

impl ProgressSink for CollectingSink {
    fn report(&mut self, message: &str) {
        self.messages.push(message.to_owned());
    }
}

/// Sink that forwards narration to `tracing` at `info` level.
#[derive(Debug, Copy, Clone, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn report(&mut self, message: &str) {
        tracing::info!(target: "stockflow::progress", "{message}");
    }
}

/// The fixed narration lines of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressMessage {
    Starting { quantity: i64, item_name: String },
    InventoryDeducted,
    ShipmentLogged,
    Committed,
    RolledBack { reason: String },
}

impl core::fmt::Display for ProgressMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProgressMessage::Starting {
                quantity,
                item_name,
            } => write!(
                f,
                "--- STARTING TRANSACTION: Move {quantity} of {item_name} ---"
            ),
            ProgressMessage::InventoryDeducted => {
                f.write_str(">> STEP 1 SUCCESS: Inventory Deducted.")
            }
            ProgressMessage::ShipmentLogged => f.write_str(">> STEP 2 SUCCESS: Shipment Logged."),
            ProgressMessage::Committed => f.write_str("--- TRANSACTION COMMITTED ---"),
            ProgressMessage::RolledBack { reason } => {
                write!(f, "--- TRANSACTION ROLLED BACK: {reason} ---")
            }
        }
    }
}

impl ProgressMessage {
    /// Render and hand the message to `sink`.
    pub fn emit<S>(&self, sink: &mut S)
    where
        S: ProgressSink + ?Sized,
    {
        sink.report(&self.to_string());
    }
}
