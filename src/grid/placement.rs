//! Limit order placement with bounded retry on insufficient balance

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};

use super::errors::{GridError, GridResult};
use super::executor::ExchangeGateway;
use super::state::OrderBook;
use super::types::OrderSide;

/// Retry tuning for order placement
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total placement attempts, including the first
    pub max_attempts: u32,
    /// Wait after an unfunded buy
    pub buy_delay: Duration,
    /// Wait after an unfunded sell
    pub sell_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, buy_delay: Duration, sell_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            buy_delay,
            sell_delay,
        }
    }

    pub fn delay_for(&self, side: OrderSide) -> Duration {
        match side {
            OrderSide::Buy => self.buy_delay,
            OrderSide::Sell => self.sell_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60), Duration::from_secs(5))
    }
}

/// Broker acknowledgment of a placed order, with the values actually sent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacedOrder {
    pub order_id: u64,
    pub price: f64,
    pub quantity: f64,
    pub side: OrderSide,
}

/// Places single limit orders for a session
pub struct OrderPlacer {
    gateway: Arc<dyn ExchangeGateway>,
    policy: RetryPolicy,
}

impl OrderPlacer {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, policy: RetryPolicy) -> Self {
        Self { gateway, policy }
    }

    /// Round to the session's precision and place the order.
    ///
    /// Insufficient balance is retried after the side's delay, up to
    /// `max_attempts`; exhausting them returns
    /// [`GridError::OrderPlacementFailed`]. Any other failure is returned
    /// immediately. A missing order id counts as a rejection.
    pub async fn place_limit_order(
        &self,
        grid_level: u32,
        book: &OrderBook,
        price: f64,
        quantity: f64,
        side: OrderSide,
    ) -> GridResult<PlacedOrder> {
        let price = book.precision.round_price(price);
        let quantity = book.precision.round_quantity(quantity);

        if price <= 0.0 || quantity <= 0.0 {
            error!(
                "[{}] Refusing {} at level {}: price={}, quantity={}",
                book.symbol, side, grid_level, price, quantity
            );
            return Err(GridError::OrderRejected(format!(
                "non-positive price {} or quantity {}",
                price, quantity
            )));
        }

        let max_attempts = self.policy.max_attempts;
        let mut last_error = GridError::Exchange("no attempt made".into());

        for attempt in 1..=max_attempts {
            match self
                .gateway
                .place_limit_order(&book.symbol, price, quantity, side)
                .await
            {
                Ok(order_id) if order_id > 0 => {
                    debug!(
                        "[{}] Placed {} level={} price={} quantity={} order_id={}",
                        book.symbol, side, grid_level, price, quantity, order_id
                    );
                    return Ok(PlacedOrder {
                        order_id,
                        price,
                        quantity,
                        side,
                    });
                }
                Ok(_) => {
                    error!(
                        "[{}] Exchange returned no order id for {} level={} price={} quantity={}",
                        book.symbol, side, grid_level, price, quantity
                    );
                    return Err(GridError::OrderRejected("exchange returned no order id".into()));
                }
                Err(e) if e.is_insufficient_balance() => {
                    last_error = e;
                    if attempt < max_attempts {
                        let delay = self.policy.delay_for(side);
                        warn!(
                            "[{}] Insufficient balance for {} level={} (attempt {}/{}), retrying in {:?}",
                            book.symbol, side, grid_level, attempt, max_attempts, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    error!(
                        "[{}] Failed to place {} level={} price={} quantity={}: {}",
                        book.symbol, side, grid_level, price, quantity, e
                    );
                    return Err(e);
                }
            }
        }

        error!(
            "[{}] Gave up placing {} level={} price={} quantity={} after {} attempts: {}",
            book.symbol, side, grid_level, price, quantity, max_attempts, last_error
        );
        Err(GridError::OrderPlacementFailed {
            attempts: max_attempts,
            reason: last_error.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::{AssetPrecision, GridConfig};
    use crate::grid::executor::mock::MockExchange;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(10, Duration::from_millis(2), Duration::from_millis(1))
    }

    fn book() -> OrderBook {
        let mut book = OrderBook::new("BTCUSDT", GridConfig::new(3, 100.0));
        book.precision = AssetPrecision::new(2, 3);
        book
    }

    fn unfunded() -> GridError {
        GridError::Exchange("Account has insufficient balance for requested action.".into())
    }

    #[tokio::test]
    async fn test_places_with_session_precision() {
        let exchange = Arc::new(MockExchange::new(100.0));
        let placer = OrderPlacer::new(exchange.clone(), fast_policy());

        let placed = placer
            .place_limit_order(1, &book(), 99.1234, 1.00951, OrderSide::Buy)
            .await
            .unwrap();

        assert!(placed.order_id > 0);
        assert!((placed.price - 99.12).abs() < 1e-9);
        assert!((placed.quantity - 1.01).abs() < 1e-9);
        let recorded = exchange.last_order().await.unwrap();
        assert_eq!(recorded.order_id, placed.order_id);
        assert_eq!(recorded.side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn test_retries_insufficient_balance_then_succeeds() {
        let exchange = Arc::new(MockExchange::new(100.0));
        exchange.fail_next(unfunded()).await;
        exchange.fail_next(unfunded()).await;
        let placer = OrderPlacer::new(exchange.clone(), fast_policy());

        let placed = placer
            .place_limit_order(0, &book(), 100.0, 1.0, OrderSide::Sell)
            .await
            .unwrap();

        assert_eq!(exchange.attempts(), 3);
        assert_eq!(exchange.placed_orders().await.len(), 1);
        assert_eq!(placed.side, OrderSide::Sell);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let exchange = Arc::new(MockExchange::new(100.0));
        exchange
            .set_should_fail(Some(GridError::OrderRejected("Filter failure: LOT_SIZE".into())))
            .await;
        let placer = OrderPlacer::new(exchange.clone(), fast_policy());

        let err = placer
            .place_limit_order(0, &book(), 100.0, 1.0, OrderSide::Buy)
            .await
            .unwrap_err();

        assert!(matches!(err, GridError::OrderRejected(_)));
        assert_eq!(exchange.attempts(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let exchange = Arc::new(MockExchange::new(100.0));
        exchange.set_should_fail(Some(unfunded())).await;
        let placer = OrderPlacer::new(
            exchange.clone(),
            RetryPolicy::new(4, Duration::from_millis(1), Duration::from_millis(1)),
        );

        let err = placer
            .place_limit_order(2, &book(), 98.0, 1.0, OrderSide::Buy)
            .await
            .unwrap_err();

        match err {
            GridError::OrderPlacementFailed { attempts, reason } => {
                assert_eq!(attempts, 4);
                assert!(reason.to_lowercase().contains("insufficient balance"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(exchange.attempts(), 4);
        assert!(exchange.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_zero_quantity_without_calling_exchange() {
        let exchange = Arc::new(MockExchange::new(100.0));
        let placer = OrderPlacer::new(exchange.clone(), fast_policy());

        let result = placer
            .place_limit_order(0, &book(), 100.0, 0.0001, OrderSide::Buy)
            .await;

        assert!(result.is_err());
        assert_eq!(exchange.attempts(), 0);
    }

    #[test]
    fn test_default_policy_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.delay_for(OrderSide::Buy), Duration::from_secs(60));
        assert_eq!(policy.delay_for(OrderSide::Sell), Duration::from_secs(5));
    }
}
