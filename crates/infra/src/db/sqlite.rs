//! SQLite-backed inventory store.
//!
//! The store owns the connection pool and exposes the read side of the two
//! tables the shipment protocol writes to:
//!
//! ```sql
//! inventory(item_name TEXT UNIQUE, stock_qty INTEGER CHECK(stock_qty >= 0))
//! shipment_log(item_name TEXT, qty_moved INTEGER)
//! ```
//!
//! Schema creation and item seeding are provisioning concerns. They live here
//! for tooling and tests; the shipment protocol itself never creates tables.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (any SQLite result code) | `Database` (code preserved) |
//! | PoolClosed / PoolTimedOut | `Unavailable` |
//! | ColumnDecode / Decode / ColumnNotFound | `Decode` |
//! | Other | `Other` |

use anyhow::Context;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::instrument;

use stockflow_inventory::{InventoryRecord, ItemName, ShipmentLogEntry};

use crate::config::{ConfigError, StoreConfig};

/// SQLite extended result codes that signal a constraint violation.
const CONSTRAINT_CODES: &[&str] = &[
    "19",   // SQLITE_CONSTRAINT
    "275",  // SQLITE_CONSTRAINT_CHECK
    "787",  // SQLITE_CONSTRAINT_FOREIGNKEY
    "1299", // SQLITE_CONSTRAINT_NOTNULL
    "1555", // SQLITE_CONSTRAINT_PRIMARYKEY
    "2067", // SQLITE_CONSTRAINT_UNIQUE
];

/// Inventory store error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        code: Option<String>,
        message: String,
    },

    #[error("store unavailable in {operation}: {message}")]
    Unavailable {
        operation: &'static str,
        message: String,
    },

    #[error("invalid row in {operation}: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },

    #[error("sqlx error in {operation}: {message}")]
    Other {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            StoreError::Database {
                code: Some(code), ..
            } => CONSTRAINT_CODES.contains(&code.as_str()),
            _ => false,
        }
    }
}

/// Handle to the inventory database.
///
/// Cheap to clone; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct SqliteInventoryStore {
    pool: SqlitePool,
}

impl SqliteInventoryStore {
    /// Open a connection pool according to `config`.
    #[instrument(skip(config), fields(database_url = %config.database_url), err)]
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let options = config.connect_options()?;

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if config.is_in_memory() {
            // The database lives exactly as long as its only connection.
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        tracing::debug!(
            max_connections = config.max_connections,
            "inventory store connected"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool (e.g. one shared with other components).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the `inventory` and `shipment_log` tables if they do not exist.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inventory (
                item_name TEXT UNIQUE,
                stock_qty INTEGER CHECK (stock_qty >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create inventory table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS shipment_log (
                item_name TEXT,
                qty_moved INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create shipment_log table")?;

        Ok(())
    }

    /// Provision an item, or reset its stock if it already exists.
    pub async fn upsert_item(&self, item_name: &ItemName, stock_qty: i64) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory (item_name, stock_qty)
            VALUES (?1, ?2)
            ON CONFLICT(item_name)
            DO UPDATE SET stock_qty = excluded.stock_qty
            "#,
        )
        .bind(item_name.as_str())
        .bind(stock_qty)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_item", e))
        .with_context(|| format!("failed to provision item {item_name:?} with stock {stock_qty}"))?;

        Ok(())
    }

    /// Current stock of an item, or `None` if the item does not exist.
    pub async fn stock_of(&self, item_name: &ItemName) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT stock_qty
            FROM inventory
            WHERE item_name = ?1
            "#,
        )
        .bind(item_name.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stock_of", e))?;

        row.map(|row| {
            row.try_get::<i64, _>("stock_qty")
                .map_err(|e| map_sqlx_error("stock_of", e))
        })
        .transpose()
    }

    /// All inventory records, ordered by item name.
    pub async fn inventory(&self) -> Result<Vec<InventoryRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT item_name, stock_qty
            FROM inventory
            ORDER BY item_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("inventory", e))?;

        rows.iter()
            .map(|row| {
                Ok(InventoryRecord {
                    item_name: item_name_from_row("inventory", row)?,
                    stock_qty: row
                        .try_get("stock_qty")
                        .map_err(|e| map_sqlx_error("inventory", e))?,
                })
            })
            .collect()
    }

    /// Every shipment log entry, in insertion order.
    pub async fn shipment_log(&self) -> Result<Vec<ShipmentLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT item_name, qty_moved
            FROM shipment_log
            ORDER BY rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("shipment_log", e))?;

        rows.iter()
            .map(|row| log_entry_from_row("shipment_log", row))
            .collect()
    }

    /// Shipment log entries for one item, in insertion order.
    pub async fn shipments_for(
        &self,
        item_name: &ItemName,
    ) -> Result<Vec<ShipmentLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT item_name, qty_moved
            FROM shipment_log
            WHERE item_name = ?1
            ORDER BY rowid ASC
            "#,
        )
        .bind(item_name.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("shipments_for", e))?;

        rows.iter()
            .map(|row| log_entry_from_row("shipments_for", row))
            .collect()
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn item_name_from_row(operation: &'static str, row: &SqliteRow) -> Result<ItemName, StoreError> {
    let raw: String = row
        .try_get("item_name")
        .map_err(|e| map_sqlx_error(operation, e))?;
    ItemName::new(raw).map_err(|e| StoreError::Decode {
        operation,
        message: e.to_string(),
    })
}

fn log_entry_from_row(
    operation: &'static str,
    row: &SqliteRow,
) -> Result<ShipmentLogEntry, StoreError> {
    Ok(ShipmentLogEntry {
        item_name: item_name_from_row(operation, row)?,
        qty_moved: row
            .try_get("qty_moved")
            .map_err(|e| map_sqlx_error(operation, e))?,
    })
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Database {
            operation,
            code: db_err.code().map(|code| code.into_owned()),
            message: db_err.message().to_string(),
        },
        sqlx::Error::PoolClosed => StoreError::Unavailable {
            operation,
            message: "connection pool closed".to_string(),
        },
        sqlx::Error::PoolTimedOut => StoreError::Unavailable {
            operation,
            message: "timed out waiting for a connection".to_string(),
        },
        e @ (sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)) => StoreError::Decode {
            operation,
            message: e.to_string(),
        },
        other => StoreError::Other {
            operation,
            message: other.to_string(),
        },
    }
}
