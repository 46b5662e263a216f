//! PostgreSQL inventory table integration tests
//!
//! ```bash
//! cargo test -p stock --test postgres_inventory
//! ```

use std::sync::Arc;

use serial_test::serial;
use sqlx::PgPool;
use stock::{
    AdjustmentOutcome, InMemoryStockLedger, InventoryError, InventoryTable, LockConfig,
    PostgresInventoryTable, ProductId, StockLedger,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/003_create_inventory_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_table() -> PostgresInventoryTable {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE inventory_adjustments, inventory")
        .execute(&pool)
        .await
        .unwrap();

    PostgresInventoryTable::new(pool)
}

#[tokio::test]
#[serial]
async fn seed_and_read() {
    let table = get_test_table().await;
    let sku = ProductId::new("SKU-1");

    table.seed(&sku, 10).await.unwrap();
    table.seed(&sku, 12).await.unwrap();

    assert_eq!(table.quantity(&sku).await.unwrap(), Some(12));
    assert_eq!(table.quantity(&ProductId::new("SKU-404")).await.unwrap(), None);
    assert_eq!(table.all_quantities().await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn redelivered_adjustment_applies_once() {
    let table = get_test_table().await;
    let sku = ProductId::new("SKU-1");
    table.seed(&sku, 10).await.unwrap();

    let key = "STOCK_REDUCED:order-1:SKU-1";
    assert_eq!(
        table.apply_adjustment(&sku, -3, key).await.unwrap(),
        AdjustmentOutcome::Applied(7)
    );
    assert_eq!(
        table.apply_adjustment(&sku, -3, key).await.unwrap(),
        AdjustmentOutcome::AlreadyApplied
    );
    assert_eq!(table.quantity(&sku).await.unwrap(), Some(7));

    let restore = "STOCK_RESTORED:order-1:SKU-1";
    assert_eq!(
        table.apply_adjustment(&sku, 3, restore).await.unwrap(),
        AdjustmentOutcome::Applied(10)
    );
}

#[tokio::test]
#[serial]
async fn unknown_product_rolls_back_the_dedupe_key() {
    let table = get_test_table().await;
    let sku = ProductId::new("SKU-LATE");

    let result = table.apply_adjustment(&sku, -1, "k-1").await;
    assert!(matches!(result, Err(InventoryError::UnknownProduct(_))));

    // Once the product exists the same event can still be applied.
    table.seed(&sku, 5).await.unwrap();
    assert_eq!(
        table.apply_adjustment(&sku, -1, "k-1").await.unwrap(),
        AdjustmentOutcome::Applied(4)
    );
}

#[tokio::test]
#[serial]
async fn ledger_counters_seed_from_postgres() {
    let table = get_test_table().await;
    let sku = ProductId::new("SKU-1");
    table.seed(&sku, 5).await.unwrap();

    let ledger = InMemoryStockLedger::in_memory(table, LockConfig::default());
    assert_eq!(ledger.available(&sku).await.unwrap(), None);
    assert!(ledger.try_reserve(&sku, 3).await.unwrap());
    assert!(!ledger.try_reserve(&sku, 3).await.unwrap());
    assert_eq!(ledger.available(&sku).await.unwrap(), Some(2));
}
