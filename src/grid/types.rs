//! Core data types for grid trading

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order side of a grid rung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of the order currently resting on a rung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Placed and acknowledged, nothing filled yet
    New,
    /// At least one partial fill received
    PartiallyFilled,
    /// Fully filled; the opposite order has not been placed yet
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Canceled, rejected and expired rungs stay idle until the next reset
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    /// Whether an order is expected to be resting on the book
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }
}

/// One ladder rung. Mutated in place for its whole life so the grid level
/// keeps its identity across side flips and resets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridOrder {
    /// Broker id of the currently open order (None = nothing open)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<u64>,
    pub side: OrderSide,
    /// Buy-entry price
    pub bid_price: f64,
    /// Sell-exit price
    pub ask_price: f64,
    pub quantity: f64,
    /// 0 = closest to market
    pub grid_level: u32,
    /// Gap used to derive `bid_price` from the shallower rung
    pub gap_percent: f64,
    pub status: OrderStatus,
    /// Partial-fill notifications since the order was (re)placed
    pub number_filled: u32,
    pub created_at: DateTime<Utc>,
}

impl GridOrder {
    /// Create a freshly placed buy rung
    pub fn new_buy(
        order_id: u64,
        grid_level: u32,
        bid_price: f64,
        ask_price: f64,
        quantity: f64,
        gap_percent: f64,
    ) -> Self {
        Self {
            order_id: Some(order_id),
            side: OrderSide::Buy,
            bid_price,
            ask_price,
            quantity,
            grid_level,
            gap_percent,
            status: OrderStatus::New,
            number_filled: 1,
            created_at: Utc::now(),
        }
    }

    /// Capital committed to this rung at its entry price
    pub fn trade_value(&self) -> f64 {
        self.bid_price * self.quantity
    }

    /// Whether a fill for `order_id` belongs to the order currently open here
    pub fn owns_order(&self, order_id: u64) -> bool {
        self.order_id == Some(order_id)
    }

    /// Record a newly acknowledged order on this rung
    pub fn mark_placed(&mut self, order_id: u64, side: OrderSide, quantity: f64) {
        self.order_id = Some(order_id);
        self.side = side;
        self.quantity = quantity;
        self.status = OrderStatus::New;
        self.number_filled = 1;
        self.created_at = Utc::now();
    }

    pub fn mark_partially_filled(&mut self) {
        self.number_filled += 1;
        self.status = OrderStatus::PartiallyFilled;
    }

    pub fn mark_filled(&mut self) {
        self.status = OrderStatus::Filled;
    }

    /// Nothing is resting here any more
    pub fn mark_canceled(&mut self) {
        self.order_id = None;
        self.status = OrderStatus::Canceled;
    }
}

/// Fill notification from the exchange's user-data feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillEvent {
    pub order_id: u64,
    pub is_full_fill: bool,
}

impl FillEvent {
    pub fn full(order_id: u64) -> Self {
        Self {
            order_id,
            is_full_fill: true,
        }
    }

    pub fn partial(order_id: u64) -> Self {
        Self {
            order_id,
            is_full_fill: false,
        }
    }
}

/// Opaque reference to an active feed subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionHandle(pub String);

impl SubscriptionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Profit tracking for a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridProfit {
    /// Realized quote-currency PnL, net of fees
    pub realized_pnl: f64,
    /// Total fees paid on completed sells
    pub total_fees: f64,
    /// Completed buy→sell cycles
    pub num_round_trips: u32,
    /// Total quote volume sold
    pub total_volume: f64,
}

impl GridProfit {
    /// Add a completed sell to profit tracking
    pub fn add_trade(&mut self, pnl: f64, fee: f64, volume: f64) {
        self.realized_pnl += pnl;
        self.total_fees += fee;
        self.total_volume += volume;
    }

    pub fn complete_round_trip(&mut self) {
        self.num_round_trips += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_display() {
        assert_eq!(OrderSide::Buy.to_string(), "BUY");
        assert_eq!(format!("{}", OrderSide::Sell), "SELL");
    }

    #[test]
    fn test_rung_lifecycle() {
        let mut rung = GridOrder::new_buy(7, 1, 99.1, 100.0, 1.009, 0.009);
        assert!(rung.owns_order(7));
        assert_eq!(rung.number_filled, 1);

        rung.mark_partially_filled();
        rung.mark_partially_filled();
        assert_eq!(rung.number_filled, 3);
        assert_eq!(rung.status, OrderStatus::PartiallyFilled);

        rung.mark_placed(8, OrderSide::Sell, 1.0);
        assert!(!rung.owns_order(7));
        assert_eq!(rung.side, OrderSide::Sell);
        assert_eq!(rung.status, OrderStatus::New);
        assert_eq!(rung.number_filled, 1);
        assert_eq!(rung.grid_level, 1);

        rung.mark_canceled();
        assert!(rung.status.is_terminal());
        assert_eq!(rung.order_id, None);
    }

    #[test]
    fn test_profit_tracking() {
        let mut profit = GridProfit::default();
        profit.add_trade(1.5, 0.1, 100.0);
        profit.complete_round_trip();
        profit.add_trade(0.5, 0.1, 50.0);
        profit.complete_round_trip();

        assert!((profit.realized_pnl - 2.0).abs() < 0.0001);
        assert!((profit.total_fees - 0.2).abs() < 0.0001);
        assert_eq!(profit.num_round_trips, 2);
    }
}
