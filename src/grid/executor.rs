//! Exchange abstraction for grid trading - enables mocking for tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use super::errors::GridResult;
use super::types::{FillEvent, OrderSide, SubscriptionHandle};

/// Queue of last-trade prices for one symbol
pub type PriceReceiver = UnboundedReceiver<f64>;

/// Queue of fill notifications for one symbol
pub type FillReceiver = UnboundedReceiver<FillEvent>;

/// Exchange operations the grid engine needs - can be mocked for testing.
///
/// Transport failures must surface as [`GridError::Exchange`](super::GridError::Exchange)
/// so the engine treats them like any other terminal rejection.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Current market price
    async fn get_current_price(&self, symbol: &str) -> GridResult<f64>;

    /// Maker fee as a fraction (0.001 = 0.1%)
    async fn get_trading_fee(&self, symbol: &str) -> GridResult<f64>;

    /// Decimal places allowed on prices (from the tick size)
    async fn get_price_decimals(&self, symbol: &str) -> GridResult<u32>;

    /// Decimal places allowed on quantities (from the lot step size)
    async fn get_quantity_decimals(&self, symbol: &str) -> GridResult<u32>;

    /// Place a GTC limit order, returning the broker order id
    async fn place_limit_order(
        &self,
        symbol: &str,
        price: f64,
        quantity: f64,
        side: OrderSide,
    ) -> GridResult<u64>;

    /// Cancel every open order on the symbol, returning how many were cancelled
    async fn cancel_all_orders(&self, symbol: &str) -> GridResult<u32>;

    /// Attach to the symbol's price-tick feed
    async fn subscribe_price_ticks(
        &self,
        symbol: &str,
    ) -> GridResult<(SubscriptionHandle, PriceReceiver)>;

    /// Attach to the account's fill feed for the symbol
    async fn subscribe_fill_events(
        &self,
        symbol: &str,
    ) -> GridResult<(SubscriptionHandle, FillReceiver)>;

    /// Detach a subscription; its queue closes once drained.
    /// Returns false if the handle was not active.
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> GridResult<bool>;
}

/// Fan-out of feed events to per-symbol subscribers.
///
/// Dropping a subscriber's sender closes its queue, which is how the session
/// task learns a feed was detached.
pub struct FeedHub<T> {
    prefix: &'static str,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionHandle, (String, UnboundedSender<T>)>>,
}

impl<T: Clone + Send> FeedHub<T> {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, symbol: &str) -> (SubscriptionHandle, UnboundedReceiver<T>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = SubscriptionHandle::new(format!("{}-{}", self.prefix, id));
        let (tx, rx) = unbounded_channel();
        self.subscribers
            .lock()
            .await
            .insert(handle.clone(), (symbol.to_string(), tx));
        debug!("Subscribed {} to {}", handle, symbol);
        (handle, rx)
    }

    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.subscribers.lock().await.remove(handle).is_some()
    }

    /// Deliver to every subscriber of `symbol`, dropping closed queues.
    /// Returns the number of queues the event reached.
    pub async fn publish(&self, symbol: &str, event: T) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        let mut delivered = 0;
        subscribers.retain(|_, (sub_symbol, tx)| {
            if sub_symbol != symbol {
                return true;
            }
            match tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    pub async fn len(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Mock exchange for testing the engine without a real exchange connection.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::grid::config::AssetPrecision;
    use crate::grid::errors::GridError;

    /// Order accepted by the mock
    #[derive(Debug, Clone, PartialEq)]
    pub struct RecordedOrder {
        pub order_id: u64,
        pub symbol: String,
        pub price: f64,
        pub quantity: f64,
        pub side: OrderSide,
    }

    /// Mock exchange for testing
    pub struct MockExchange {
        pub orders: Arc<Mutex<Vec<RecordedOrder>>>,
        pub cancel_all_calls: Arc<Mutex<Vec<String>>>,
        pub price: Arc<Mutex<f64>>,
        pub fee: Arc<Mutex<f64>>,
        pub precision: Arc<Mutex<AssetPrecision>>,
        /// Failures returned by the next placements, in order
        scripted_failures: Arc<Mutex<VecDeque<GridError>>>,
        /// Failure returned by every placement while set
        pub should_fail: Arc<Mutex<Option<GridError>>>,
        /// Delay applied to every placement
        place_delay: Arc<Mutex<Option<Duration>>>,
        pub place_attempts: AtomicU32,
        next_oid: AtomicU64,
        price_feed: FeedHub<f64>,
        fill_feed: FeedHub<FillEvent>,
    }

    impl MockExchange {
        pub fn new(price: f64) -> Self {
            Self {
                orders: Arc::new(Mutex::new(Vec::new())),
                cancel_all_calls: Arc::new(Mutex::new(Vec::new())),
                price: Arc::new(Mutex::new(price)),
                fee: Arc::new(Mutex::new(0.001)),
                precision: Arc::new(Mutex::new(AssetPrecision::new(3, 3))),
                scripted_failures: Arc::new(Mutex::new(VecDeque::new())),
                should_fail: Arc::new(Mutex::new(None)),
                place_delay: Arc::new(Mutex::new(None)),
                place_attempts: AtomicU32::new(0),
                next_oid: AtomicU64::new(1),
                price_feed: FeedHub::new("mock-ticker"),
                fill_feed: FeedHub::new("mock-user"),
            }
        }

        pub async fn set_price(&self, price: f64) {
            *self.price.lock().await = price;
        }

        pub async fn set_should_fail(&self, failure: Option<GridError>) {
            *self.should_fail.lock().await = failure;
        }

        pub async fn set_place_delay(&self, delay: Option<Duration>) {
            *self.place_delay.lock().await = delay;
        }

        /// Fail the next placement with `failure`, then behave normally
        pub async fn fail_next(&self, failure: GridError) {
            self.scripted_failures.lock().await.push_back(failure);
        }

        pub async fn placed_orders(&self) -> Vec<RecordedOrder> {
            self.orders.lock().await.clone()
        }

        pub async fn last_order(&self) -> Option<RecordedOrder> {
            self.orders.lock().await.last().cloned()
        }

        pub fn attempts(&self) -> u32 {
            self.place_attempts.load(Ordering::SeqCst)
        }

        pub async fn push_price(&self, symbol: &str, price: f64) -> usize {
            self.set_price(price).await;
            self.price_feed.publish(symbol, price).await
        }

        pub async fn push_fill(&self, symbol: &str, event: FillEvent) -> usize {
            self.fill_feed.publish(symbol, event).await
        }

        pub async fn price_subscribers(&self) -> usize {
            self.price_feed.len().await
        }

        pub async fn fill_subscribers(&self) -> usize {
            self.fill_feed.len().await
        }
    }

    #[async_trait]
    impl ExchangeGateway for MockExchange {
        async fn get_current_price(&self, _symbol: &str) -> GridResult<f64> {
            Ok(*self.price.lock().await)
        }

        async fn get_trading_fee(&self, _symbol: &str) -> GridResult<f64> {
            Ok(*self.fee.lock().await)
        }

        async fn get_price_decimals(&self, _symbol: &str) -> GridResult<u32> {
            Ok(self.precision.lock().await.price_decimals)
        }

        async fn get_quantity_decimals(&self, _symbol: &str) -> GridResult<u32> {
            Ok(self.precision.lock().await.quantity_decimals)
        }

        async fn place_limit_order(
            &self,
            symbol: &str,
            price: f64,
            quantity: f64,
            side: OrderSide,
        ) -> GridResult<u64> {
            self.place_attempts.fetch_add(1, Ordering::SeqCst);

            let delay = *self.place_delay.lock().await;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if let Some(failure) = self.scripted_failures.lock().await.pop_front() {
                return Err(failure);
            }
            if let Some(failure) = self.should_fail.lock().await.clone() {
                return Err(failure);
            }

            let order_id = self.next_oid.fetch_add(1, Ordering::SeqCst);
            self.orders.lock().await.push(RecordedOrder {
                order_id,
                symbol: symbol.to_string(),
                price,
                quantity,
                side,
            });
            Ok(order_id)
        }

        async fn cancel_all_orders(&self, symbol: &str) -> GridResult<u32> {
            self.cancel_all_calls.lock().await.push(symbol.to_string());
            let orders = self.orders.lock().await;
            Ok(orders.iter().filter(|o| o.symbol == symbol).count() as u32)
        }

        async fn subscribe_price_ticks(
            &self,
            symbol: &str,
        ) -> GridResult<(SubscriptionHandle, PriceReceiver)> {
            Ok(self.price_feed.subscribe(symbol).await)
        }

        async fn subscribe_fill_events(
            &self,
            symbol: &str,
        ) -> GridResult<(SubscriptionHandle, FillReceiver)> {
            Ok(self.fill_feed.subscribe(symbol).await)
        }

        async fn unsubscribe(&self, handle: &SubscriptionHandle) -> GridResult<bool> {
            if self.price_feed.unsubscribe(handle).await {
                return Ok(true);
            }
            Ok(self.fill_feed.unsubscribe(handle).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_hub_routes_by_symbol() {
        let hub: FeedHub<f64> = FeedHub::new("ticker");
        let (btc, mut btc_rx) = hub.subscribe("BTCUSDT").await;
        let (_eth, mut eth_rx) = hub.subscribe("ETHUSDT").await;

        assert_eq!(hub.publish("BTCUSDT", 100.0).await, 1);
        assert_eq!(btc_rx.recv().await, Some(100.0));
        assert!(eth_rx.try_recv().is_err());

        assert!(hub.unsubscribe(&btc).await);
        assert!(!hub.unsubscribe(&btc).await);
        assert_eq!(hub.len().await, 1);
        assert_eq!(btc_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_feed_hub_prunes_dropped_receivers() {
        let hub: FeedHub<FillEvent> = FeedHub::new("user");
        let (_handle, rx) = hub.subscribe("BTCUSDT").await;
        drop(rx);

        assert_eq!(hub.publish("BTCUSDT", FillEvent::full(1)).await, 0);
        assert_eq!(hub.len().await, 0);
    }
}
