//! Paper trading exchange
//!
//! Simulates limit order execution against pushed last-trade prices. Orders
//! rest until a price crosses them, then fill completely at their limit.
//! Fees are charged in the quote asset on both sides.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::config::AssetPrecision;
use super::errors::{GridError, GridResult};
use super::executor::{ExchangeGateway, FeedHub, FillReceiver, PriceReceiver};
use super::types::{FillEvent, OrderSide, SubscriptionHandle};

/// Starting state of one paper market
#[derive(Debug, Clone, Deserialize)]
pub struct PaperMarket {
    pub symbol: String,
    /// Base asset held at start
    #[serde(default)]
    pub base_balance: f64,
    /// Last price before the first tick arrives
    pub price: Option<f64>,
}

impl PaperMarket {
    pub fn new(symbol: impl Into<String>, base_balance: f64, price: Option<f64>) -> Self {
        Self {
            symbol: symbol.into(),
            base_balance,
            price,
        }
    }
}

/// Paper account settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    /// Starting quote balance (e.g. USDT)
    pub quote_balance: f64,
    /// Maker fee as a fraction
    pub maker_fee: f64,
    /// Price increment, as the exchange publishes it
    pub tick_size: String,
    /// Quantity increment
    pub step_size: String,
    pub markets: Vec<PaperMarket>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            quote_balance: 10_000.0,
            maker_fee: 0.001,
            tick_size: "0.01".to_string(),
            step_size: "0.00001".to_string(),
            markets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    symbol: String,
    side: OrderSide,
    price: f64,
    quantity: f64,
}

impl PaperOrder {
    fn crossed_by(&self, price: f64) -> bool {
        match self.side {
            OrderSide::Buy => price <= self.price,
            OrderSide::Sell => price >= self.price,
        }
    }
}

#[derive(Debug, Default)]
struct PaperAccount {
    quote_free: f64,
    base_free: HashMap<String, f64>,
    orders: HashMap<u64, PaperOrder>,
    prices: HashMap<String, f64>,
    total_fees: f64,
}

impl PaperAccount {
    /// Return an order's reservation to the free balances
    fn release(&mut self, order: &PaperOrder, fee_rate: f64) {
        match order.side {
            OrderSide::Buy => self.quote_free += order.price * order.quantity * (1.0 + fee_rate),
            OrderSide::Sell => {
                *self.base_free.entry(order.symbol.clone()).or_default() += order.quantity
            }
        }
    }

    fn settle(&mut self, order: &PaperOrder, fee_rate: f64) {
        let notional = order.price * order.quantity;
        let fee = notional * fee_rate;
        self.total_fees += fee;
        match order.side {
            OrderSide::Buy => {
                *self.base_free.entry(order.symbol.clone()).or_default() += order.quantity
            }
            OrderSide::Sell => self.quote_free += notional - fee,
        }
    }
}

/// Balances and open orders at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct PaperSnapshot {
    pub quote_free: f64,
    pub base_free: HashMap<String, f64>,
    pub open_orders: usize,
    pub total_fees: f64,
}

/// In-process exchange for dry runs
pub struct PaperExchange {
    precision: AssetPrecision,
    fee_rate: f64,
    account: Mutex<PaperAccount>,
    next_oid: AtomicU64,
    price_feed: FeedHub<f64>,
    fill_feed: FeedHub<FillEvent>,
}

impl PaperExchange {
    pub fn new(config: PaperConfig) -> GridResult<Self> {
        if config.quote_balance < 0.0 || config.maker_fee < 0.0 {
            return Err(GridError::InvalidConfig(
                "paper balances and fees must be non-negative".into(),
            ));
        }
        let precision = AssetPrecision::from_increments(&config.tick_size, &config.step_size)?;
        info!(
            "Paper exchange ready: quote balance {}, maker fee {}, precision {:?}",
            config.quote_balance, config.maker_fee, precision
        );

        let mut account = PaperAccount {
            quote_free: config.quote_balance,
            ..Default::default()
        };
        for market in config.markets {
            if market.base_balance < 0.0 {
                return Err(GridError::InvalidConfig(format!(
                    "negative base balance for {}",
                    market.symbol
                )));
            }
            if let Some(price) = market.price {
                account.prices.insert(market.symbol.clone(), price);
            }
            account.base_free.insert(market.symbol, market.base_balance);
        }

        Ok(Self {
            precision,
            fee_rate: config.maker_fee,
            account: Mutex::new(account),
            next_oid: AtomicU64::new(1),
            price_feed: FeedHub::new("paper-ticker"),
            fill_feed: FeedHub::new("paper-user"),
        })
    }

    /// Record a trade price, fill every order it crosses, and publish the
    /// tick followed by the fills. Returns the number of orders filled.
    pub async fn push_price(&self, symbol: &str, price: f64) -> usize {
        let filled: Vec<u64> = {
            let mut account = self.account.lock().await;
            account.prices.insert(symbol.to_string(), price);

            let mut crossed: Vec<(u64, PaperOrder)> = account
                .orders
                .iter()
                .filter(|(_, o)| o.symbol == symbol && o.crossed_by(price))
                .map(|(&id, o)| (id, o.clone()))
                .collect();
            crossed.sort_by_key(|(id, _)| *id);

            for (id, order) in &crossed {
                account.orders.remove(id);
                account.settle(order, self.fee_rate);
                info!(
                    "Paper fill: {} {} {} at {} (order {})",
                    order.side, order.quantity, symbol, order.price, id
                );
            }
            crossed.into_iter().map(|(id, _)| id).collect()
        };

        self.price_feed.publish(symbol, price).await;
        for order_id in &filled {
            self.fill_feed.publish(symbol, FillEvent::full(*order_id)).await;
        }
        filled.len()
    }

    pub async fn snapshot(&self) -> PaperSnapshot {
        let account = self.account.lock().await;
        PaperSnapshot {
            quote_free: account.quote_free,
            base_free: account.base_free.clone(),
            open_orders: account.orders.len(),
            total_fees: account.total_fees,
        }
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn get_current_price(&self, symbol: &str) -> GridResult<f64> {
        self.account
            .lock()
            .await
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| GridError::Exchange(format!("no price for {}", symbol)))
    }

    async fn get_trading_fee(&self, _symbol: &str) -> GridResult<f64> {
        Ok(self.fee_rate)
    }

    async fn get_price_decimals(&self, _symbol: &str) -> GridResult<u32> {
        Ok(self.precision.price_decimals)
    }

    async fn get_quantity_decimals(&self, _symbol: &str) -> GridResult<u32> {
        Ok(self.precision.quantity_decimals)
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        price: f64,
        quantity: f64,
        side: OrderSide,
    ) -> GridResult<u64> {
        if price <= 0.0 || quantity <= 0.0 {
            return Err(GridError::OrderRejected(format!(
                "invalid price {} or quantity {}",
                price, quantity
            )));
        }

        let mut account = self.account.lock().await;
        match side {
            OrderSide::Buy => {
                let required = price * quantity * (1.0 + self.fee_rate);
                if required > account.quote_free {
                    return Err(GridError::InsufficientBalance {
                        required,
                        available: account.quote_free,
                    });
                }
                account.quote_free -= required;
            }
            OrderSide::Sell => {
                let available = account.base_free.get(symbol).copied().unwrap_or(0.0);
                if quantity > available {
                    return Err(GridError::InsufficientBalance {
                        required: quantity,
                        available,
                    });
                }
                account.base_free.insert(symbol.to_string(), available - quantity);
            }
        }

        let order_id = self.next_oid.fetch_add(1, Ordering::SeqCst);
        account.orders.insert(
            order_id,
            PaperOrder {
                symbol: symbol.to_string(),
                side,
                price,
                quantity,
            },
        );
        debug!(
            "Paper order {}: {} {} {} @ {}",
            order_id, side, quantity, symbol, price
        );
        Ok(order_id)
    }

    async fn cancel_all_orders(&self, symbol: &str) -> GridResult<u32> {
        let mut account = self.account.lock().await;
        let ids: Vec<u64> = account
            .orders
            .iter()
            .filter(|(_, o)| o.symbol == symbol)
            .map(|(&id, _)| id)
            .collect();

        for id in &ids {
            if let Some(order) = account.orders.remove(id) {
                account.release(&order, self.fee_rate);
            }
        }
        info!("Paper cancel-all on {}: {} orders", symbol, ids.len());
        Ok(ids.len() as u32)
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

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(quote: f64, base: f64) -> PaperExchange {
        let config = PaperConfig {
            quote_balance: quote,
            maker_fee: 0.001,
            markets: vec![PaperMarket::new("BTCUSDT", base, Some(100.0))],
            ..Default::default()
        };
        PaperExchange::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_precision_from_increments() {
        let ex = exchange(1000.0, 0.0);
        assert_eq!(ex.get_price_decimals("BTCUSDT").await.unwrap(), 2);
        assert_eq!(ex.get_quantity_decimals("BTCUSDT").await.unwrap(), 5);
        assert_eq!(ex.get_current_price("BTCUSDT").await.unwrap(), 100.0);
        assert!(ex.get_current_price("ETHUSDT").await.is_err());
    }

    #[tokio::test]
    async fn test_buy_reserves_quote_with_fee() {
        let ex = exchange(200.0, 0.0);
        ex.place_limit_order("BTCUSDT", 99.0, 1.0, OrderSide::Buy)
            .await
            .unwrap();

        let snapshot = ex.snapshot().await;
        assert!((snapshot.quote_free - (200.0 - 99.0 * 1.001)).abs() < 1e-9);
        assert_eq!(snapshot.open_orders, 1);

        let err = ex
            .place_limit_order("BTCUSDT", 99.0, 1.0, OrderSide::Buy)
            .await
            .unwrap_err();
        assert!(err.is_insufficient_balance());
    }

    #[tokio::test]
    async fn test_sell_without_base_is_unfunded() {
        let ex = exchange(1000.0, 0.0);
        let err = ex
            .place_limit_order("BTCUSDT", 101.0, 0.5, OrderSide::Sell)
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn test_crossing_price_fills_and_publishes() {
        let ex = exchange(1000.0, 1.0);
        let (_p, mut prices) = ex.subscribe_price_ticks("BTCUSDT").await.unwrap();
        let (_f, mut fills) = ex.subscribe_fill_events("BTCUSDT").await.unwrap();

        let buy = ex
            .place_limit_order("BTCUSDT", 99.0, 1.0, OrderSide::Buy)
            .await
            .unwrap();
        let sell = ex
            .place_limit_order("BTCUSDT", 101.0, 1.0, OrderSide::Sell)
            .await
            .unwrap();

        assert_eq!(ex.push_price("BTCUSDT", 99.5).await, 0);
        assert_eq!(ex.push_price("BTCUSDT", 98.9).await, 1);
        assert_eq!(prices.recv().await, Some(99.5));
        assert_eq!(prices.recv().await, Some(98.9));
        assert_eq!(fills.recv().await, Some(FillEvent::full(buy)));

        assert_eq!(ex.push_price("BTCUSDT", 101.0).await, 1);
        assert_eq!(fills.recv().await, Some(FillEvent::full(sell)));

        let snapshot = ex.snapshot().await;
        assert_eq!(snapshot.open_orders, 0);
        assert!((snapshot.base_free["BTCUSDT"] - 1.0).abs() < 1e-9);
        let expected_quote = 1000.0 - 99.0 * 1.001 + 101.0 * 0.999;
        assert!((snapshot.quote_free - expected_quote).abs() < 1e-9);
        assert!((snapshot.total_fees - (0.099 + 0.101)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cancel_all_releases_reservations() {
        let ex = exchange(500.0, 2.0);
        ex.place_limit_order("BTCUSDT", 99.0, 1.0, OrderSide::Buy)
            .await
            .unwrap();
        ex.place_limit_order("BTCUSDT", 101.0, 2.0, OrderSide::Sell)
            .await
            .unwrap();

        assert_eq!(ex.cancel_all_orders("BTCUSDT").await.unwrap(), 2);
        let snapshot = ex.snapshot().await;
        assert!((snapshot.quote_free - 500.0).abs() < 1e-9);
        assert!((snapshot.base_free["BTCUSDT"] - 2.0).abs() < 1e-9);
        assert_eq!(snapshot.open_orders, 0);
    }

    #[test]
    fn test_rejects_bad_increments() {
        let config = PaperConfig {
            tick_size: "0".into(),
            ..Default::default()
        };
        assert!(PaperExchange::new(config).is_err());
    }
}
