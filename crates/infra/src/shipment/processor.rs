//! Transactional shipment processing.
//!
//! A shipment deducts stock and appends an audit row as one atomic unit:
//!
//! 1. Open a write transaction (`BEGIN IMMEDIATE`)
//! 2. Guarded decrement: `UPDATE inventory ... WHERE item_name = ? AND stock_qty >= ?`
//! 3. Require exactly one affected row (otherwise: insufficient stock or unknown item)
//! 4. Insert `(item_name, qty)` into `shipment_log`
//! 5. Commit
//!
//! Any failure rolls the whole transaction back. The guarded decrement is both
//! the stock-sufficiency check and the write, so there is no read-then-write
//! window for a concurrent shipment to slip through.
//!
//! ## Narration
//!
//! Every step is narrated to the caller's [`ProgressSink`] in order. The
//! outcome is also returned as `Result<ShipmentReceipt, ShipmentError>`, so
//! callers do not have to parse narration to learn whether stock moved.
//!
//! ## Session Release
//!
//! The sqlx `Transaction` guard owns the pooled connection. Failures roll
//! back explicitly; any exit that skips that (a panicking sink, a dropped
//! future, a failed `COMMIT`) rolls back when the guard is dropped, and the
//! connection returns to the pool either way.

use chrono::Utc;
use sqlx::{Sqlite, Transaction};
use tracing::instrument;
use uuid::Uuid;

use stockflow_inventory::{
    ProgressMessage, ProgressSink, ShipmentError, ShipmentReceipt, ShipmentRequest, ShipmentStage,
    ShipmentState,
};

use crate::config::StoreConfig;
use crate::db::sqlite::{SqliteInventoryStore, StoreError, map_sqlx_error};

/// Takes the write lock up front so concurrent shipments queue behind the busy
/// timeout instead of failing on a lock upgrade.
const BEGIN_IMMEDIATE: &str = "BEGIN IMMEDIATE";

/// Executes shipments against an inventory store.
#[derive(Debug, Clone)]
pub struct ShipmentProcessor {
    store: SqliteInventoryStore,
}

impl ShipmentProcessor {
    pub fn new(store: SqliteInventoryStore) -> Self {
        Self { store }
    }

    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        Ok(Self::new(SqliteInventoryStore::connect(config).await?))
    }

    pub fn store(&self) -> &SqliteInventoryStore {
        &self.store
    }

    /// Ship `quantity` units of `item_name`, narrating each step to `report`.
    ///
    /// Raw inputs are validated first; an invalid request never reaches the
    /// store. No transaction is opened for it, but it is still narrated with
    /// the rollback line so every start message is followed by a commit or
    /// rollback message.
    pub async fn process<S>(
        &self,
        item_name: &str,
        quantity: i64,
        report: &mut S,
    ) -> Result<ShipmentReceipt, ShipmentError>
    where
        S: ProgressSink + ?Sized,
    {
        ProgressMessage::Starting {
            quantity,
            item_name: item_name.to_owned(),
        }
        .emit(report);

        let request = match ShipmentRequest::new(item_name, quantity) {
            Ok(request) => request,
            Err(err) => {
                let err = ShipmentError::from(err);
                tracing::warn!(item_name, quantity, error = %err, "shipment request rejected");
                ProgressMessage::RolledBack {
                    reason: err.to_string(),
                }
                .emit(report);
                return Err(err);
            }
        };

        self.run(Uuid::now_v7(), &request, report).await
    }

    /// Ship an already-validated request, narrating each step to `report`.
    pub async fn process_request<S>(
        &self,
        request: &ShipmentRequest,
        report: &mut S,
    ) -> Result<ShipmentReceipt, ShipmentError>
    where
        S: ProgressSink + ?Sized,
    {
        ProgressMessage::Starting {
            quantity: request.quantity.get(),
            item_name: request.item_name.to_string(),
        }
        .emit(report);

        self.run(Uuid::now_v7(), request, report).await
    }

    #[instrument(
        name = "shipment",
        skip(self, shipment_id, request, report),
        fields(
            shipment_id = %shipment_id,
            item_name = %request.item_name,
            quantity = request.quantity.get()
        )
    )]
    async fn run<S>(
        &self,
        shipment_id: Uuid,
        request: &ShipmentRequest,
        report: &mut S,
    ) -> Result<ShipmentReceipt, ShipmentError>
    where
        S: ProgressSink + ?Sized,
    {
        let mut protocol = Protocol::new();

        match self.execute(request, report, &mut protocol).await {
            Ok(()) => {
                protocol.enter(ShipmentState::Committed);
                ProgressMessage::Committed.emit(report);
                tracing::info!("shipment committed");

                Ok(ShipmentReceipt {
                    shipment_id,
                    item_name: request.item_name.clone(),
                    quantity: request.quantity,
                    committed_at: Utc::now(),
                })
            }
            Err(err) => {
                if let Some(failed) = err.failed_state() {
                    protocol.enter(failed);
                }
                protocol.enter(ShipmentState::RolledBack);
                tracing::warn!(error = %err, "shipment rolled back");
                ProgressMessage::RolledBack {
                    reason: err.to_string(),
                }
                .emit(report);
                Err(err)
            }
        }
    }

    /// Open the transaction, write, and commit or roll back.
    async fn execute<S>(
        &self,
        request: &ShipmentRequest,
        report: &mut S,
        protocol: &mut Protocol,
    ) -> Result<(), ShipmentError>
    where
        S: ProgressSink + ?Sized,
    {
        protocol.enter(ShipmentState::Decrementing);

        let mut tx = self
            .store
            .pool()
            .begin_with(BEGIN_IMMEDIATE)
            .await
            .map_err(|e| storage_fault(ShipmentStage::Begin, "begin_transaction", e))?;

        if let Err(err) = write_shipment(&mut tx, request, report, protocol).await {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::error!(
                    error = %map_sqlx_error("rollback", rollback_err),
                    "explicit rollback failed; transaction is discarded on release"
                );
            }
            return Err(err);
        }

        tx.commit()
            .await
            .map_err(|e| storage_fault(ShipmentStage::Commit, "commit_transaction", e))
    }
}

/// Guarded decrement followed by the audit insert, inside `tx`.
async fn write_shipment<S>(
    tx: &mut Transaction<'static, Sqlite>,
    request: &ShipmentRequest,
    report: &mut S,
    protocol: &mut Protocol,
) -> Result<(), ShipmentError>
where
    S: ProgressSink + ?Sized,
{
    let quantity = request.quantity.get();

    let rows_affected = sqlx::query(
        r#"
        UPDATE inventory
        SET stock_qty = stock_qty - ?1
        WHERE item_name = ?2 AND stock_qty >= ?1
        "#,
    )
    .bind(quantity)
    .bind(request.item_name.as_str())
    .execute(&mut **tx)
    .await
    .map_err(|e| storage_fault(ShipmentStage::Decrement, "decrement_stock", e))?
    .rows_affected();

    // Zero rows: unknown item or not enough stock. More than one would mean
    // the unique key is gone; neither may commit.
    if rows_affected != 1 {
        return Err(ShipmentError::InsufficientStockOrMissingItem {
            item_name: request.item_name.clone(),
            requested: request.quantity,
            rows_affected,
        });
    }
    protocol.enter(ShipmentState::DecrementOk);
    ProgressMessage::InventoryDeducted.emit(report);

    protocol.enter(ShipmentState::Logging);
    sqlx::query(
        r#"
        INSERT INTO shipment_log (item_name, qty_moved)
        VALUES (?1, ?2)
        "#,
    )
    .bind(request.item_name.as_str())
    .bind(quantity)
    .execute(&mut **tx)
    .await
    .map_err(|e| storage_fault(ShipmentStage::Log, "insert_shipment_log", e))?;
    protocol.enter(ShipmentState::LogOk);
    ProgressMessage::ShipmentLogged.emit(report);

    Ok(())
}

fn storage_fault(stage: ShipmentStage, operation: &'static str, err: sqlx::Error) -> ShipmentError {
    let err = map_sqlx_error(operation, err);
    tracing::error!(stage = %stage, error = %err, "storage fault during shipment");
    ShipmentError::storage(stage, err.to_string())
}

/// Walks the shipment state machine, tracing every transition.
#[derive(Debug)]
struct Protocol {
    state: ShipmentState,
}

impl Protocol {
    fn new() -> Self {
        Self {
            state: ShipmentState::Start,
        }
    }

    fn enter(&mut self, next: ShipmentState) {
        match self.state.advance(next) {
            Ok(state) => {
                tracing::debug!(from = %self.state, to = %state, "shipment state transition");
                self.state = state;
            }
            Err(err) => tracing::error!(error = %err, "shipment protocol step out of order"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_inventory::{CollectingSink, ItemName};

    const COMMITTED: &str = "--- TRANSACTION COMMITTED ---";

    async fn processor_with(items: &[(&str, i64)]) -> ShipmentProcessor {
        let store = SqliteInventoryStore::connect(&StoreConfig::in_memory())
            .await
            .unwrap();
        store.ensure_schema().await.unwrap();
        for (item, stock) in items {
            store.upsert_item(&name(item), *stock).await.unwrap();
        }
        ShipmentProcessor::new(store)
    }

    fn name(raw: &str) -> ItemName {
        ItemName::new(raw).unwrap()
    }

    async fn stock(processor: &ShipmentProcessor, item: &str) -> Option<i64> {
        processor.store().stock_of(&name(item)).await.unwrap()
    }

    async fn log_len(processor: &ShipmentProcessor) -> usize {
        processor.store().shipment_log().await.unwrap().len()
    }

    #[tokio::test]
    async fn shipment_within_stock_commits_both_writes() {
        let processor = processor_with(&[("widget", 10)]).await;
        let mut sink = CollectingSink::new();

        let receipt = processor.process("widget", 4, &mut sink).await.unwrap();

        assert_eq!(receipt.item_name, name("widget"));
        assert_eq!(receipt.quantity.get(), 4);
        assert_eq!(stock(&processor, "widget").await, Some(6));

        let log = processor.store().shipment_log().await.unwrap();
        assert_eq!(log, vec![receipt.log_entry()]);

        assert_eq!(
            sink.messages(),
            [
                "--- STARTING TRANSACTION: Move 4 of widget ---",
                ">> STEP 1 SUCCESS: Inventory Deducted.",
                ">> STEP 2 SUCCESS: Shipment Logged.",
                COMMITTED,
            ]
        );
    }

    #[tokio::test]
    async fn shipment_beyond_stock_rolls_back() {
        let processor = processor_with(&[("widget", 3)]).await;
        let mut sink = CollectingSink::new();

        let err = processor.process("widget", 4, &mut sink).await.unwrap_err();

        match &err {
            ShipmentError::InsufficientStockOrMissingItem {
                item_name,
                requested,
                rows_affected,
            } => {
                assert_eq!(item_name, &name("widget"));
                assert_eq!(requested.get(), 4);
                assert_eq!(*rows_affected, 0);
            }
            other => panic!("expected insufficient stock, got {other:?}"),
        }
        assert_eq!(stock(&processor, "widget").await, Some(3));
        assert_eq!(log_len(&processor).await, 0);

        assert_eq!(sink.messages().len(), 2);
        let last = sink.last().unwrap();
        assert!(last.contains("TRANSACTION ROLLED BACK"), "{last}");
        assert!(last.contains("Not enough stock"), "{last}");
    }

    #[tokio::test]
    async fn unknown_item_takes_the_insufficient_stock_path() {
        let processor = processor_with(&[("widget", 10)]).await;
        let mut sink = CollectingSink::new();

        let err = processor.process("ghost-item", 1, &mut sink).await.unwrap_err();

        assert!(err.is_insufficient_stock());
        assert_eq!(stock(&processor, "ghost-item").await, None);
        assert_eq!(stock(&processor, "widget").await, Some(10));
        assert_eq!(log_len(&processor).await, 0);
        assert_eq!(
            sink.messages(),
            [
                "--- STARTING TRANSACTION: Move 1 of ghost-item ---",
                "--- TRANSACTION ROLLED BACK: Not enough stock available or item does not exist ---",
            ]
        );
    }

    #[tokio::test]
    async fn exact_stock_drains_to_zero_then_refuses() {
        let processor = processor_with(&[("widget", 5)]).await;
        let mut sink = CollectingSink::new();

        processor.process("widget", 5, &mut sink).await.unwrap();
        assert_eq!(stock(&processor, "widget").await, Some(0));

        let err = processor.process("widget", 1, &mut sink).await.unwrap_err();
        assert!(err.is_insufficient_stock());
        assert_eq!(stock(&processor, "widget").await, Some(0));
        assert_eq!(log_len(&processor).await, 1);
    }

    #[tokio::test]
    async fn invalid_requests_never_touch_the_store() {
        let processor = processor_with(&[("widget", 10)]).await;

        for (item, qty) in [("widget", 0), ("widget", -5), ("", 1), ("   ", 2)] {
            let mut sink = CollectingSink::new();
            let err = processor.process(item, qty, &mut sink).await.unwrap_err();

            assert!(matches!(err, ShipmentError::InvalidRequest(_)), "{err:?}");
            assert_eq!(err.failed_state(), None);
            assert_eq!(sink.messages().len(), 2);
            assert!(sink.messages()[0].starts_with("--- STARTING TRANSACTION"));
            assert!(sink.last().unwrap().contains("TRANSACTION ROLLED BACK"));
        }

        // A negative quantity must not have turned into a restock.
        assert_eq!(stock(&processor, "widget").await, Some(10));
        assert_eq!(log_len(&processor).await, 0);
    }

    #[tokio::test]
    async fn failed_log_insert_undoes_the_decrement() {
        let processor = processor_with(&[("widget", 10)]).await;
        sqlx::query("DROP TABLE shipment_log")
            .execute(processor.store().pool())
            .await
            .unwrap();
        let mut sink = CollectingSink::new();

        let err = processor.process("widget", 4, &mut sink).await.unwrap_err();

        match &err {
            ShipmentError::StorageFault { stage, message } => {
                assert_eq!(*stage, ShipmentStage::Log);
                assert!(message.contains("no such table"), "{message}");
            }
            other => panic!("expected storage fault, got {other:?}"),
        }
        assert_eq!(err.failed_state(), Some(ShipmentState::LogFailed));
        assert_eq!(stock(&processor, "widget").await, Some(10));

        let messages = sink.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1], ">> STEP 1 SUCCESS: Inventory Deducted.");
        assert!(messages[2].contains("TRANSACTION ROLLED BACK: storage fault during log"));
        assert!(!messages.iter().any(|m| m == COMMITTED));
    }

    #[tokio::test]
    async fn failed_commit_persists_nothing() {
        let store = SqliteInventoryStore::connect(&StoreConfig::in_memory())
            .await
            .unwrap();
        store.ensure_schema().await.unwrap();
        store.upsert_item(&name("widget"), 10).await.unwrap();

        // A deferred foreign key is only checked at COMMIT, so the insert
        // succeeds and the commit is what fails.
        for ddl in [
            "PRAGMA foreign_keys = ON",
            "DROP TABLE shipment_log",
            "CREATE TABLE carriers (name TEXT PRIMARY KEY)",
            "CREATE TABLE shipment_log (
                item_name TEXT REFERENCES carriers(name) DEFERRABLE INITIALLY DEFERRED,
                qty_moved INTEGER
            )",
        ] {
            sqlx::query(ddl).execute(store.pool()).await.unwrap();
        }
        let processor = ShipmentProcessor::new(store);
        let mut sink = CollectingSink::new();

        let err = processor.process("widget", 4, &mut sink).await.unwrap_err();

        assert!(
            matches!(err, ShipmentError::StorageFault { stage: ShipmentStage::Commit, .. }),
            "{err:?}"
        );
        assert_eq!(err.failed_state(), Some(ShipmentState::CommitFailed));
        assert_eq!(stock(&processor, "widget").await, Some(10));
        assert_eq!(log_len(&processor).await, 0);

        let messages = sink.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2], ">> STEP 2 SUCCESS: Shipment Logged.");
        assert!(messages[3].contains("TRANSACTION ROLLED BACK"));
    }

    #[tokio::test]
    async fn missing_schema_is_a_decrement_fault() {
        let store = SqliteInventoryStore::connect(&StoreConfig::in_memory())
            .await
            .unwrap();
        let processor = ShipmentProcessor::new(store);
        let mut sink = CollectingSink::new();

        let err = processor.process("widget", 1, &mut sink).await.unwrap_err();

        assert!(
            matches!(err, ShipmentError::StorageFault { stage: ShipmentStage::Decrement, .. }),
            "{err:?}"
        );
        assert_eq!(err.failed_state(), Some(ShipmentState::DecrementFailed));
        assert_eq!(sink.messages().len(), 2);
    }

    #[tokio::test]
    async fn closed_store_is_a_begin_fault() {
        let processor = processor_with(&[("widget", 10)]).await;
        processor.store().close().await;
        let mut sink = CollectingSink::new();

        let err = processor.process("widget", 1, &mut sink).await.unwrap_err();

        assert!(
            matches!(err, ShipmentError::StorageFault { stage: ShipmentStage::Begin, .. }),
            "{err:?}"
        );
        assert_eq!(sink.messages().len(), 2);
    }

    #[tokio::test]
    async fn panicking_sink_releases_the_transaction() {
        let processor = processor_with(&[("widget", 10)]).await;

        let task = {
            let processor = processor.clone();
            tokio::spawn(async move {
                let mut sink = |message: &str| {
                    if message.contains("STEP 1") {
                        panic!("sink failed after the decrement");
                    }
                };
                processor.process("widget", 4, &mut sink).await
            })
        };
        let joined = task.await;
        assert!(joined.unwrap_err().is_panic());

        assert_eq!(stock(&processor, "widget").await, Some(10));
        assert_eq!(log_len(&processor).await, 0);

        let mut sink = CollectingSink::new();
        processor.process("widget", 4, &mut sink).await.unwrap();
        assert_eq!(stock(&processor, "widget").await, Some(6));
        assert_eq!(sink.last(), Some(COMMITTED));
    }

    #[tokio::test]
    async fn closure_sinks_receive_messages_in_order() {
        let processor = processor_with(&[("widget", 10)]).await;
        let mut lines: Vec<String> = Vec::new();
        let mut sink = |message: &str| lines.push(message.to_uppercase());

        processor.process("widget", 2, &mut sink).await.unwrap();

        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("MOVE 2 OF WIDGET"));
        assert_eq!(lines[3], COMMITTED);
    }

    #[tokio::test]
    async fn validated_requests_skip_revalidation() {
        let processor = processor_with(&[("widget", 10)]).await;
        let request = ShipmentRequest::new("widget", 7).unwrap();
        let mut sink = CollectingSink::new();

        let receipt = processor.process_request(&request, &mut sink).await.unwrap();

        assert_eq!(receipt.quantity, request.quantity);
        assert_eq!(stock(&processor, "widget").await, Some(3));
        assert_eq!(sink.messages()[0], "--- STARTING TRANSACTION: Move 7 of widget ---");
    }

    #[tokio::test]
    async fn receipts_carry_distinct_shipment_ids() {
        let processor = processor_with(&[("widget", 10)]).await;
        let mut sink = CollectingSink::new();

        let first = processor.process("widget", 1, &mut sink).await.unwrap();
        let second = processor.process("widget", 1, &mut sink).await.unwrap();

        assert_ne!(first.shipment_id, second.shipment_id);
        assert!(second.committed_at >= first.committed_at);
    }

    #[test]
    fn protocol_ignores_out_of_order_steps() {
        let mut protocol = Protocol::new();
        protocol.enter(ShipmentState::Logging);
        assert_eq!(protocol.state, ShipmentState::Start);

        for next in [
            ShipmentState::Decrementing,
            ShipmentState::DecrementFailed,
            ShipmentState::RolledBack,
        ] {
            protocol.enter(next);
        }
        assert_eq!(protocol.state, ShipmentState::RolledBack);
    }
}
