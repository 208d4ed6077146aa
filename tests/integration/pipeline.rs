//! End-to-end scenarios: poller → queue → workers → accrual HTTP client →
//! ledger store.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use gophermart::accrual::{AccrualClient, AccrualError, AccrualSource, FetchOutcome};
use gophermart::engine::dispatcher::DispatchSnapshot;
use gophermart::engine::{EngineConfig, Reconciler, ShutdownSignal};
use gophermart::storage::{LedgerError, LedgerStore, MemoryLedger, SqliteLedger};
use gophermart::types::{OrderStatus, UpdateOutcome, UserId};

use crate::mock_accrual::{MockAccrual, Reply};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn engine_config(workers: usize) -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(50),
        workers,
        queue_capacity: 16,
    }
}

/// Temporary on-disk SQLite database, removed on drop.
struct TempDb {
    path: PathBuf,
}

impl TempDb {
    fn new() -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!("gophermart_it_{}.db", Uuid::new_v4()));
        Self { path }
    }

    fn uri(&self) -> String {
        format!("sqlite://{}", self.path.to_string_lossy())
    }

    async fn open(&self) -> Arc<SqliteLedger> {
        Arc::new(SqliteLedger::connect(&self.uri(), 4).await.unwrap())
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let base = self.path.to_string_lossy().to_string();
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{base}{suffix}"));
        }
    }
}

struct Running {
    reconciler: Arc<Reconciler>,
    signal: ShutdownSignal,
    handle: JoinHandle<()>,
}

impl Running {
    fn start(store: Arc<dyn LedgerStore>, base_url: &str, workers: usize) -> Self {
        let client = AccrualClient::new(base_url).unwrap();
        let reconciler = Arc::new(Reconciler::new(store, Arc::new(client), engine_config(workers)));
        let signal = ShutdownSignal::new();
        let listener = signal.listener();
        let engine = Arc::clone(&reconciler);
        let handle = tokio::spawn(async move { engine.start(listener).await });
        Self {
            reconciler,
            signal,
            handle,
        }
    }

    async fn stop(self) -> DispatchSnapshot {
        self.signal.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("reconciler did not stop")
            .unwrap();
        self.reconciler.stats()
    }
}

/// Poll `check` until it returns true or ten seconds pass.
async fn eventually<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 10s");
}

async fn user_with_orders(store: &dyn LedgerStore, login: &str, numbers: &[&str]) -> UserId {
    let user = store.create_user(login, "$2a$10$hash").await.unwrap();
    for n in numbers {
        store.create_order(n, &user).await.unwrap();
    }
    user
}

async fn status_of(store: &dyn LedgerStore, user: &str, number: &str) -> OrderStatus {
    store
        .list_orders(user)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.number == number)
        .map(|o| o.status)
        .unwrap()
}

// ---------------------------------------------------------------------------
// Accrual client against HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_client_maps_http_responses() {
    let mock = MockAccrual::start().await;
    mock.script("ready", vec![Reply::processed(729.98)]);
    mock.script("limited", vec![Reply::RateLimited { retry_after: Some(7) }]);
    mock.script("limited-bare", vec![Reply::RateLimited { retry_after: None }]);
    mock.script("broken", vec![Reply::ServerError]);
    mock.script("bad", vec![Reply::BadRequest]);
    mock.script("garbage", vec![Reply::Garbage]);

    let client = AccrualClient::new(&mock.base_url()).unwrap();

    match client.fetch("ready").await.unwrap() {
        FetchOutcome::Ready(reply) => {
            assert_eq!(reply.order, "ready");
            assert_eq!(reply.status, "PROCESSED");
            assert_eq!(reply.accrual, Some(dec!(729.98)));
        }
        other => panic!("expected Ready, got {other:?}"),
    }

    assert_eq!(client.fetch("unknown").await.unwrap(), FetchOutcome::NotRegistered);
    assert_eq!(
        client.fetch("limited").await.unwrap(),
        FetchOutcome::RateLimited(Duration::from_secs(7))
    );
    assert_eq!(
        client.fetch("limited-bare").await.unwrap(),
        FetchOutcome::RateLimited(Duration::from_secs(60))
    );

    match client.fetch("broken").await.unwrap_err() {
        AccrualError::Server { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "database is down");
        }
        other => panic!("expected Server, got {other:?}"),
    }
    assert!(matches!(
        client.fetch("bad").await.unwrap_err(),
        AccrualError::Rejected { status: 400, .. }
    ));
    assert!(matches!(client.fetch("garbage").await.unwrap_err(), AccrualError::Decode(_)));
}

#[tokio::test]
async fn test_client_404_means_not_registered() {
    let mock = MockAccrual::start().await;
    let client = AccrualClient::new(&mock.base_url())
        .unwrap()
        .with_orders_path("/api/unknown/");
    assert_eq!(client.fetch("1").await.unwrap(), FetchOutcome::NotRegistered);
}

#[tokio::test]
async fn test_client_transport_error_when_service_down() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = AccrualClient::new(&format!("http://{addr}")).unwrap();
    assert!(matches!(client.fetch("1").await.unwrap_err(), AccrualError::Transport(_)));
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_processed_order_credits_balance() {
    let mock = MockAccrual::start().await;
    mock.script("12345678903", vec![Reply::processed(729.98)]);

    let db = TempDb::new();
    let store = db.open().await;
    let user = user_with_orders(store.as_ref(), "gopher", &["12345678903"]).await;

    let running = Running::start(store.clone(), &mock.base_url(), 2);
    eventually(|| async { store.list_pending().await.unwrap().is_empty() }).await;

    let balance = store.get_balance(&user).await.unwrap();
    assert_eq!(balance.current, dec!(729.98));
    assert_eq!(balance.withdrawn, Decimal::ZERO);

    let order = &store.list_orders(&user).await.unwrap()[0];
    assert_eq!(order.status, OrderStatus::Processed);
    assert_eq!(order.accrual, Some(dec!(729.98)));

    // Terminal orders are not polled again.
    let hits = mock.hits("12345678903").len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(mock.hits("12345678903").len(), hits);

    let stats = running.stop().await;
    assert_eq!(stats.credited, 1);
}

#[tokio::test]
async fn test_order_moves_through_processing_to_processed() {
    let mock = MockAccrual::start().await;
    mock.script(
        "A",
        vec![
            Reply::status("REGISTERED"),
            Reply::status("PROCESSING"),
            Reply::processed(100.0),
        ],
    );

    let store = Arc::new(MemoryLedger::new());
    let user = user_with_orders(store.as_ref(), "gopher", &["A"]).await;

    let running = Running::start(store.clone(), &mock.base_url(), 1);
    eventually(|| async { status_of(store.as_ref(), &user, "A").await == OrderStatus::Processed }).await;
    running.stop().await;

    assert!(mock.hits("A").len() >= 3);
    assert_eq!(store.get_balance(&user).await.unwrap().current, dec!(100));
}

#[tokio::test]
async fn test_invalid_order_is_final_and_never_credited() {
    let mock = MockAccrual::start().await;
    mock.script("A", vec![Reply::status("INVALID")]);

    let store = Arc::new(MemoryLedger::new());
    let user = user_with_orders(store.as_ref(), "gopher", &["A"]).await;

    let running = Running::start(store.clone(), &mock.base_url(), 2);
    eventually(|| async { status_of(store.as_ref(), &user, "A").await == OrderStatus::Invalid }).await;

    let hits = mock.hits("A").len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    running.stop().await;

    assert_eq!(mock.hits("A").len(), hits);
    assert_eq!(store.get_balance(&user).await.unwrap().current, Decimal::ZERO);
}

#[tokio::test]
async fn test_unregistered_order_is_retried_every_tick() {
    let mock = MockAccrual::start().await;

    let store = Arc::new(MemoryLedger::new());
    let user = user_with_orders(store.as_ref(), "gopher", &["A"]).await;

    let running = Running::start(store.clone(), &mock.base_url(), 2);
    eventually(|| async { mock.hits("A").len() >= 3 }).await;
    let stats = running.stop().await;

    assert!(stats.not_registered >= 3);
    assert_eq!(status_of(store.as_ref(), &user, "A").await, OrderStatus::New);
}

#[tokio::test]
async fn test_unknown_status_leaves_order_pending() {
    let mock = MockAccrual::start().await;
    mock.script("A", vec![Reply::status("ON_HOLD"), Reply::processed(5.0)]);

    let store = Arc::new(MemoryLedger::new());
    let user = user_with_orders(store.as_ref(), "gopher", &["A"]).await;

    let running = Running::start(store.clone(), &mock.base_url(), 1);
    eventually(|| async { status_of(store.as_ref(), &user, "A").await == OrderStatus::Processed }).await;
    let stats = running.stop().await;

    assert!(stats.failed >= 1);
    assert_eq!(store.get_balance(&user).await.unwrap().current, dec!(5));
}

#[tokio::test]
async fn test_rate_limit_pauses_every_worker() {
    let mock = MockAccrual::start().await;
    mock.script(
        "A",
        vec![Reply::RateLimited { retry_after: Some(1) }, Reply::processed(10.0)],
    );
    mock.script("B", vec![Reply::status("REGISTERED"), Reply::processed(20.0)]);

    let store = Arc::new(MemoryLedger::new());
    let user = user_with_orders(store.as_ref(), "gopher", &["A", "B"]).await;

    let running = Running::start(store.clone(), &mock.base_url(), 2);
    eventually(|| async { store.list_pending().await.unwrap().is_empty() }).await;
    let stats = running.stop().await;

    let limited_at = mock.hits("A")[0];
    assert!(mock.hits("A")[1] >= limited_at + Duration::from_secs(1));

    // Requests already in flight when the 429 arrived may land just after
    // it; nothing new goes out until the pause ends.
    let quiet_from = limited_at + Duration::from_millis(200);
    let quiet_to = limited_at + Duration::from_millis(950);
    for at in mock.all_hits() {
        assert!(at < quiet_from || at > quiet_to, "request sent during backoff");
    }

    assert_eq!(stats.rate_limited, 1);
    assert_eq!(store.get_balance(&user).await.unwrap().current, dec!(30));
}

#[tokio::test]
async fn test_shutdown_interrupts_backoff() {
    let mock = MockAccrual::start().await;
    mock.script("A", vec![Reply::RateLimited { retry_after: Some(3600) }]);

    let store = Arc::new(MemoryLedger::new());
    let user = user_with_orders(store.as_ref(), "gopher", &["A"]).await;

    let running = Running::start(store.clone(), &mock.base_url(), 2);
    eventually(|| async { !mock.hits("A").is_empty() }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = running.stop().await;
    assert_eq!(stats.rate_limited, 1);
    assert_eq!(mock.hits("A").len(), 1);
    assert_eq!(status_of(store.as_ref(), &user, "A").await, OrderStatus::New);
}

#[tokio::test]
async fn test_restart_resumes_pending_orders() {
    let mock = MockAccrual::start().await;
    mock.script("A", vec![Reply::status("PROCESSING")]);

    let db = TempDb::new();
    let store = db.open().await;
    let user = user_with_orders(store.as_ref(), "gopher", &["A"]).await;

    let running = Running::start(store.clone(), &mock.base_url(), 1);
    eventually(|| async { status_of(store.as_ref(), &user, "A").await == OrderStatus::Processing }).await;
    running.stop().await;
    store.close().await;

    mock.script("A", vec![Reply::processed(42.5)]);
    let store = db.open().await;
    assert_eq!(store.list_pending().await.unwrap(), vec!["A".to_string()]);

    let running = Running::start(store.clone(), &mock.base_url(), 1);
    eventually(|| async { store.list_pending().await.unwrap().is_empty() }).await;
    running.stop().await;

    assert_eq!(store.get_balance(&user).await.unwrap().current, dec!(42.5));
}

#[tokio::test]
async fn test_balance_holds_while_crediting_and_withdrawing() {
    let mock = MockAccrual::start().await;
    let numbers: Vec<String> = (0..10).map(|i| format!("order-{i}")).collect();
    for n in &numbers {
        mock.script(n, vec![Reply::status("PROCESSING"), Reply::processed(50.0)]);
    }

    let db = TempDb::new();
    let store = db.open().await;
    let refs: Vec<&str> = numbers.iter().map(String::as_str).collect();
    let user = user_with_orders(store.as_ref(), "gopher", &refs).await;

    let running = Running::start(store.clone(), &mock.base_url(), 4);

    let withdrawer = {
        let store = store.clone();
        let user = user.clone();
        tokio::spawn(async move {
            let mut approved = 0u32;
            for i in 0..40 {
                match store.withdraw(&user, &format!("w-{i}"), dec!(40)).await {
                    Ok(_) => approved += 1,
                    Err(LedgerError::InsufficientFunds { .. }) => {}
                    Err(e) => panic!("unexpected withdraw error: {e}"),
                }
                let balance = store.get_balance(&user).await.unwrap();
                assert!(balance.current >= Decimal::ZERO);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            approved
        })
    };

    let approved = withdrawer.await.unwrap();
    eventually(|| async { store.list_pending().await.unwrap().is_empty() }).await;
    running.stop().await;

    let balance = store.get_balance(&user).await.unwrap();
    assert_eq!(balance.current + balance.withdrawn, dec!(500));
    assert_eq!(balance.withdrawn, Decimal::from(approved) * dec!(40));
    assert_eq!(store.list_withdrawals(&user).await.unwrap().len(), approved as usize);
}

// ---------------------------------------------------------------------------
// Store parity
// ---------------------------------------------------------------------------

async fn check_withdraw_rules(store: Arc<dyn LedgerStore>) {
    let user = user_with_orders(store.as_ref(), "gopher", &["A"]).await;
    store
        .apply_accrual_update("A", OrderStatus::Processed, Some(dec!(500)))
        .await
        .unwrap();

    let w = store.withdraw(&user, "2377225624", dec!(300)).await.unwrap();
    assert_eq!(w.amount, dec!(300));

    let err = store.withdraw(&user, "2377225625", dec!(300)).await.unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

    let balance = store.get_balance(&user).await.unwrap();
    assert_eq!(balance.current, dec!(200));
    assert_eq!(balance.withdrawn, dec!(300));

    let history = store.list_withdrawals(&user).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].order_ref, "2377225624");
}

async fn check_update_idempotence(store: Arc<dyn LedgerStore>) {
    let user = user_with_orders(store.as_ref(), "gopher", &["A"]).await;

    let first = store
        .apply_accrual_update("A", OrderStatus::Processed, Some(dec!(500)))
        .await
        .unwrap();
    assert_eq!(first, UpdateOutcome::Applied { credited: dec!(500) });

    let again = store
        .apply_accrual_update("A", OrderStatus::Processed, Some(dec!(500)))
        .await
        .unwrap();
    assert_eq!(again, UpdateOutcome::AlreadyFinal);

    let backwards = store
        .apply_accrual_update("A", OrderStatus::Processing, None)
        .await
        .unwrap();
    assert_eq!(backwards, UpdateOutcome::AlreadyFinal);

    assert_eq!(store.get_balance(&user).await.unwrap().current, dec!(500));
}

async fn check_bad_accruals_leave_ledger_alone(store: Arc<dyn LedgerStore>) {
    let user = user_with_orders(store.as_ref(), "gopher", &["A", "B"]).await;

    store
        .apply_accrual_update("A", OrderStatus::Processing, None)
        .await
        .unwrap();
    let stamped = store.list_orders(&user).await.unwrap()[0].updated_at;
    let repeat = store
        .apply_accrual_update("A", OrderStatus::Processing, None)
        .await
        .unwrap();
    assert_eq!(repeat, UpdateOutcome::Unchanged);
    assert_eq!(store.list_orders(&user).await.unwrap()[0].updated_at, stamped);

    let huge = Decimal::from_scientific("1e27").unwrap();
    let err = store
        .apply_accrual_update("B", OrderStatus::Processed, Some(huge))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidAmount(_)));

    assert_eq!(store.get_balance(&user).await.unwrap().current, Decimal::ZERO);
    assert_eq!(status_of(store.as_ref(), &user, "B").await, OrderStatus::New);
}

#[tokio::test]
async fn test_bad_accruals_memory() {
    check_bad_accruals_leave_ledger_alone(Arc::new(MemoryLedger::new())).await;
}

#[tokio::test]
async fn test_bad_accruals_sqlite() {
    let db = TempDb::new();
    check_bad_accruals_leave_ledger_alone(db.open().await).await;
}

#[tokio::test]
async fn test_oversized_accrual_does_not_block_other_orders() {
    let mock = MockAccrual::start().await;
    mock.script("A", vec![Reply::processed(1e27)]);
    mock.script("B", vec![Reply::processed(5.0)]);

    let db = TempDb::new();
    let store = db.open().await;
    let user = user_with_orders(store.as_ref(), "gopher", &["A", "B"]).await;

    let running = Running::start(store.clone(), &mock.base_url(), 1);
    eventually(|| async { status_of(store.as_ref(), &user, "B").await == OrderStatus::Processed }).await;
    // A keeps being retried rather than being stuck as claimed.
    eventually(|| async { mock.hits("A").len() >= 2 }).await;
    let stats = running.stop().await;

    assert!(stats.failed >= 2);
    assert_eq!(status_of(store.as_ref(), &user, "A").await, OrderStatus::New);
    assert_eq!(store.get_balance(&user).await.unwrap().current, dec!(5));
}

#[tokio::test]
async fn test_withdraw_rules_memory() {
    check_withdraw_rules(Arc::new(MemoryLedger::new())).await;
}

#[tokio::test]
async fn test_withdraw_rules_sqlite() {
    let db = TempDb::new();
    check_withdraw_rules(db.open().await).await;
}

#[tokio::test]
async fn test_update_idempotence_memory() {
    check_update_idempotence(Arc::new(MemoryLedger::new())).await;
}

#[tokio::test]
async fn test_update_idempotence_sqlite() {
    check_update_idempotence(Arc::new(SqliteLedger::in_memory().await.unwrap())).await;
}
