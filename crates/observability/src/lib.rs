//! Tracing and logging setup shared by every StockFlow process.

/// Initialize process-wide observability (JSON logs, `RUST_LOG` filtering).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::Json);
}

/// Subscriber configuration (filters, formats).
pub mod tracing;

pub use self::tracing::LogFormat;
