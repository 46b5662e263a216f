//! PostgreSQL order ledger integration tests
//!
//! These tests use a shared PostgreSQL container and truncate the order
//! tables before each test, so they run serially.
//!
//! ```bash
//! cargo test -p domain --test postgres_ledger
//! ```

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use domain::{
    LedgerError, MemberId, Money, Order, OrderId, OrderLedger, OrderLine, OrderStatus,
    PostgresOrderLedger,
};
use serial_test::serial;
use sqlx::PgPool;
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
            sqlx::raw_sql(include_str!("../../../migrations/002_create_order_tables.sql"))
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

async fn get_test_ledger() -> PostgresOrderLedger {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE order_lines, orders")
        .execute(&pool)
        .await
        .unwrap();

    PostgresOrderLedger::new(pool)
}

fn day(d: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, d, 9, 0, 0).unwrap()
}

fn new_order(owner: MemberId, key: Option<&str>) -> Order {
    Order::place(
        owner,
        vec![
            OrderLine::new("SKU-001", "Widget", Money::from_cents(1000), 2),
            OrderLine::new("SKU-002", "Gadget", Money::from_cents(250), 4),
        ],
        key.map(str::to_string),
        day(1),
    )
    .unwrap()
}

#[tokio::test]
#[serial]
async fn insert_and_load_with_lines() {
    let ledger = get_test_ledger().await;
    let order = new_order(MemberId::new(), None);

    ledger.insert(&order).await.unwrap();
    let loaded = ledger.get(order.id()).await.unwrap().unwrap();

    assert_eq!(loaded, order);
    assert_eq!(loaded.lines()[1].product_name, "Gadget");
    assert!(ledger.get(OrderId::new()).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn idempotency_key_is_unique_per_owner() {
    let ledger = get_test_ledger().await;
    let owner = MemberId::new();

    let first = new_order(owner, Some("checkout-42"));
    ledger.insert(&first).await.unwrap();

    let second = ledger.insert(&new_order(owner, Some("checkout-42"))).await;
    assert!(matches!(second, Err(LedgerError::DuplicateOrder { .. })));

    let found = ledger
        .find_by_idempotency_key(owner, "checkout-42")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id(), first.id());

    // Orders without a key never collide.
    ledger.insert(&new_order(owner, None)).await.unwrap();
    ledger.insert(&new_order(owner, None)).await.unwrap();
}

#[tokio::test]
#[serial]
async fn compare_and_set_allows_exactly_one_writer() {
    let ledger = get_test_ledger().await;
    let order = new_order(MemberId::new(), None);
    ledger.insert(&order).await.unwrap();

    let deliver = order.scheduled_transition(day(2), Duration::days(1)).unwrap();
    let cancel = order.cancel(day(2)).unwrap();

    let updated = ledger.compare_and_set_status(&deliver).await.unwrap();
    assert_eq!(updated.status(), OrderStatus::Delivering);
    assert_eq!(updated.delivery_start_date(), Some(day(2)));

    let lost = ledger.compare_and_set_status(&cancel).await;
    assert!(matches!(
        lost,
        Err(LedgerError::StaleStatus {
            actual: OrderStatus::Delivering,
            ..
        })
    ));
}

#[tokio::test]
#[serial]
async fn compare_and_set_returns_the_row_it_wrote() {
    let ledger = get_test_ledger().await;
    let order = new_order(MemberId::new(), None);
    ledger.insert(&order).await.unwrap();

    let deliver = order.scheduled_transition(day(2), Duration::days(1)).unwrap();
    let delivering = ledger.compare_and_set_status(&deliver).await.unwrap();

    let complete = delivering
        .scheduled_transition(day(3), Duration::days(1))
        .unwrap();
    let completed = ledger.compare_and_set_status(&complete).await.unwrap();

    assert_eq!(delivering.status(), OrderStatus::Delivering);
    assert_eq!(delivering.delivery_complete_date(), None);
    assert_eq!(delivering.lines(), order.lines());
    assert_eq!(completed.status(), OrderStatus::DeliveryCompleted);
    assert_eq!(completed.delivery_complete_date(), Some(day(3)));
    assert_eq!(ledger.get(order.id()).await.unwrap().unwrap(), completed);
}

#[tokio::test]
#[serial]
async fn oversized_line_quantity_is_rejected() {
    let ledger = get_test_ledger().await;
    let order = Order::place(
        MemberId::new(),
        vec![OrderLine::new(
            "SKU-001",
            "Widget",
            Money::from_cents(1),
            i32::MAX as u32 + 1,
        )],
        None,
        day(1),
    )
    .unwrap();

    let result = ledger.insert(&order).await;
    assert!(matches!(result, Err(LedgerError::Corrupt(_))));
    assert!(ledger.get(order.id()).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn negative_stored_quantity_is_reported_corrupt() {
    let ledger = get_test_ledger().await;
    let order = new_order(MemberId::new(), None);
    ledger.insert(&order).await.unwrap();

    sqlx::query("UPDATE order_lines SET quantity = -1 WHERE order_id = $1")
        .bind(order.id().as_uuid())
        .execute(ledger.pool())
        .await
        .unwrap();

    assert!(matches!(
        ledger.get(order.id()).await,
        Err(LedgerError::Corrupt(_))
    ));
}

#[tokio::test]
#[serial]
async fn list_due_uses_the_status_date() {
    let ledger = get_test_ledger().await;
    let order = new_order(MemberId::new(), None);
    ledger.insert(&order).await.unwrap();

    let deliver = order.scheduled_transition(day(3), Duration::days(1)).unwrap();
    ledger.compare_and_set_status(&deliver).await.unwrap();

    assert!(
        ledger
            .list_due(OrderStatus::OrderReceived, day(5))
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        ledger
            .list_due(OrderStatus::Delivering, day(2))
            .await
            .unwrap()
            .is_empty()
    );

    let due = ledger.list_due(OrderStatus::Delivering, day(4)).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].lines().len(), 2);
    assert!(ledger.list_due(OrderStatus::Cancelled, day(9)).await.unwrap().is_empty());
}
