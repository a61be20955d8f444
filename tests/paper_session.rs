//! Grid sessions driven end to end against the paper exchange

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use spot_grid_bot::grid::{
    EngineConfig, GridConfig, GridEngine, GridSupervisor, JsonFileRepository, MemoryCache,
    OrderBook, OrderBookRepository, OrderSide, OrderStatus, PaperConfig, PaperExchange,
    PaperMarket, RetryPolicy, SessionLocks, StartedSession,
};

const SYMBOL: &str = "BTCUSDT";

struct Harness {
    exchange: Arc<PaperExchange>,
    supervisor: GridSupervisor,
    state_dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let exchange = Arc::new(
            PaperExchange::new(PaperConfig {
                quote_balance: 10_000.0,
                maker_fee: 0.001,
                tick_size: "0.01".into(),
                step_size: "0.00001".into(),
                markets: vec![PaperMarket::new(SYMBOL, 0.0, Some(100.0))],
            })
            .unwrap(),
        );
        let state_dir = tempfile::tempdir().unwrap();
        let repository: Arc<dyn OrderBookRepository> =
            Arc::new(JsonFileRepository::new(state_dir.path()).unwrap());
        let engine = GridEngine::new(
            exchange.clone(),
            repository,
            Arc::new(MemoryCache::new()),
            Arc::new(SessionLocks::new()),
            EngineConfig {
                retry: RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(5)),
                cache_ttl: Duration::from_secs(60),
            },
        );
        Self {
            exchange,
            supervisor: GridSupervisor::new(Arc::new(engine)),
            state_dir,
        }
    }

    async fn start(&self) -> StartedSession {
        let config = GridConfig::new(3, 100.0)
            .with_gaps(0.01, 0.9, 0.01, 0.001)
            .with_reset(0.05, 0.1);
        self.supervisor.start_session(SYMBOL, config).await.unwrap()
    }

    async fn book(&self, session_id: &str) -> OrderBook {
        self.supervisor
            .engine()
            .session(session_id)
            .await
            .unwrap()
            .unwrap()
    }

    /// Poll the session until `check` holds or two seconds pass
    async fn wait_for<F>(&self, session_id: &str, check: F) -> OrderBook
    where
        F: Fn(&OrderBook) -> bool,
    {
        for _ in 0..200 {
            let book = self.book(session_id).await;
            if check(&book) {
                return book;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {} never reached the expected state", session_id);
    }
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

async fn settle<F: Future>(f: F) -> F::Output {
    let out = f.await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    out
}

#[tokio::test]
async fn test_seeded_ladder_rests_on_paper_book() {
    let h = Harness::new();
    let started = h.start().await;

    let book = h.book(&started.session_id).await;
    let bids: Vec<f64> = book.grid_orders.iter().map(|r| r.bid_price).collect();
    assert_eq!(bids, vec![100.0, 99.1, 98.3]);
    assert!(close(book.rung(0).unwrap().ask_price, 101.0));
    assert!(close(book.rung(1).unwrap().ask_price, 100.0));
    assert_eq!(book.subscription_handle, Some(started.subscription_handle));

    let snapshot = h.exchange.snapshot().await;
    assert_eq!(snapshot.open_orders, 3);
    assert!(snapshot.quote_free < 10_000.0 - 300.0);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_round_trip_books_profit() {
    let h = Harness::new();
    let started = h.start().await;
    let id = started.session_id.as_str();

    assert_eq!(h.exchange.push_price(SYMBOL, 99.9).await, 1);
    let book = h
        .wait_for(id, |b| b.rung(0).map(|r| r.side) == Some(OrderSide::Sell))
        .await;
    let rung = book.rung(0).unwrap();
    assert_eq!(rung.status, OrderStatus::New);
    assert_eq!(rung.number_filled, 1);
    assert!(close(rung.quantity, 0.999));

    assert_eq!(h.exchange.push_price(SYMBOL, 101.0).await, 1);
    let book = h.wait_for(id, |b| b.profit.num_round_trips == 1).await;
    let rung = book.rung(0).unwrap();
    assert_eq!(rung.side, OrderSide::Buy);
    assert!(close(rung.bid_price, 100.0));
    assert!(close(rung.quantity, 1.00798));

    // gross 100.899, fee 0.100899, cost 99.9
    assert!(close(book.profit.realized_pnl, 0.898101));
    assert!(close(book.profit.total_fees, 0.100899));

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_falling_price_extends_and_flips_floor() {
    let h = Harness::new();
    let started = h.start().await;
    let id = started.session_id.as_str();

    // Crosses all three buys; the deepest one waits for the ladder to grow
    assert_eq!(h.exchange.push_price(SYMBOL, 98.3).await, 3);
    let book = h
        .wait_for(id, |b| {
            b.rung(2).map(|r| r.status) == Some(OrderStatus::Filled)
                && b.rung(1).map(|r| r.side) == Some(OrderSide::Sell)
        })
        .await;
    assert_eq!(book.rung(2).unwrap().side, OrderSide::Buy);

    h.exchange.push_price(SYMBOL, 97.4).await;
    let book = h.wait_for(id, |b| b.grid_orders.len() == 4).await;

    let floor = book.rung(3).unwrap();
    assert!(close(floor.bid_price, 97.58));
    assert!(close(floor.ask_price, 98.3));
    assert_eq!(floor.side, OrderSide::Buy);

    let flipped = book.rung(2).unwrap();
    assert_eq!(flipped.side, OrderSide::Sell);
    assert_eq!(flipped.status, OrderStatus::New);
    assert!(close(flipped.quantity, 1.01627));

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_breakout_resets_ladder() {
    let h = Harness::new();
    let started = h.start().await;
    let id = started.session_id.as_str();

    h.exchange.push_price(SYMBOL, 105.5).await;
    let book = h
        .wait_for(id, |b| b.rung(0).map(|r| r.bid_price) == Some(105.5))
        .await;

    assert!(close(book.config.initial_gap_percent, 0.011));
    assert_eq!(book.grid_orders.len(), 3);
    assert!(book
        .grid_orders
        .iter()
        .all(|r| r.side == OrderSide::Buy && r.status == OrderStatus::New));
    // Level 0 keeps its 100 quote of trade value at the new price
    assert!(close(book.rung(0).unwrap().quantity, 0.94787));

    let snapshot = h.exchange.snapshot().await;
    assert_eq!(snapshot.open_orders, 3);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stopped_session_ignores_ticks_but_flips_fills() {
    let h = Harness::new();
    let started = h.start().await;
    let id = started.session_id.as_str();

    assert!(h.supervisor.stop_session(&started.subscription_handle).await);
    assert!(!h.supervisor.stop_session(&started.subscription_handle).await);

    settle(h.exchange.push_price(SYMBOL, 106.0)).await;
    let book = h.book(id).await;
    assert!(close(book.rung(0).unwrap().bid_price, 100.0));
    assert_eq!(book.subscription_handle, None);

    h.exchange.push_price(SYMBOL, 99.9).await;
    h.wait_for(id, |b| b.rung(0).map(|r| r.side) == Some(OrderSide::Sell))
        .await;

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_sessions_are_persisted_as_json() {
    let h = Harness::new();
    let started = h.start().await;

    let path = h.state_dir.path().join(format!("{}.json", started.session_id));
    let stored = OrderBook::load_from_file(&path).unwrap();
    assert_eq!(stored.symbol, SYMBOL);
    assert_eq!(stored.grid_orders.len(), 3);

    h.supervisor.shutdown().await;
}
