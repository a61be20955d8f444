//! Session state: one order book per running grid, with JSON persistence

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::{AssetPrecision, GridConfig};
use super::errors::GridResult;
use super::types::{GridOrder, GridProfit, OrderSide, OrderStatus, SubscriptionHandle};

/// One running grid session bound to a symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    /// Assigned at creation, never changes
    pub id: String,

    pub symbol: String,

    /// Active price-tick subscription; cleared on stop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_handle: Option<SubscriptionHandle>,

    /// Resolved once from the exchange during seeding
    pub precision: AssetPrecision,

    /// Ladder parameters; only reset mutates them
    pub config: GridConfig,

    /// Rungs, at most one per grid level
    pub grid_orders: Vec<GridOrder>,

    #[serde(default)]
    pub profit: GridProfit,

    pub created_at: DateTime<Utc>,

    pub last_updated: DateTime<Utc>,
}

impl OrderBook {
    /// Create an empty session with a fresh id
    pub fn new(symbol: impl Into<String>, config: GridConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            subscription_handle: None,
            precision: AssetPrecision::default(),
            config,
            grid_orders: Vec::new(),
            profit: GridProfit::default(),
            created_at: now,
            last_updated: now,
        }
    }

    pub fn rung(&self, level: u32) -> Option<&GridOrder> {
        self.grid_orders.iter().find(|o| o.grid_level == level)
    }

    pub fn rung_mut(&mut self, level: u32) -> Option<&mut GridOrder> {
        self.grid_orders.iter_mut().find(|o| o.grid_level == level)
    }

    /// Rung whose current open order is `order_id`
    pub fn rung_by_order_id(&self, order_id: u64) -> Option<&GridOrder> {
        self.grid_orders.iter().find(|o| o.owns_order(order_id))
    }

    pub fn contains_order(&self, order_id: u64) -> bool {
        self.rung_by_order_id(order_id).is_some()
    }

    /// Rung with the highest grid level (lowest bid)
    pub fn deepest(&self) -> Option<&GridOrder> {
        self.grid_orders.iter().max_by_key(|o| o.grid_level)
    }

    pub fn max_level(&self) -> Option<u32> {
        self.deepest().map(|o| o.grid_level)
    }

    /// Level-0 bid, the reference for reset decisions
    pub fn top_bid(&self) -> Option<f64> {
        self.rung(0).map(|o| o.bid_price)
    }

    /// Insert or replace the rung at its level, keeping rungs ordered by level
    pub fn upsert_rung(&mut self, rung: GridOrder) {
        match self
            .grid_orders
            .iter_mut()
            .find(|o| o.grid_level == rung.grid_level)
        {
            Some(existing) => *existing = rung,
            None => {
                self.grid_orders.push(rung);
                self.grid_orders.sort_by_key(|o| o.grid_level);
            }
        }
    }

    pub fn count_open(&self, side: OrderSide) -> usize {
        self.grid_orders
            .iter()
            .filter(|o| o.side == side && o.status.is_open())
            .count()
    }

    /// Update timestamp
    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            symbol: self.symbol.clone(),
            subscription_handle: self.subscription_handle.clone(),
            num_rungs: self.grid_orders.len(),
            open_buys: self.count_open(OrderSide::Buy),
            open_sells: self.count_open(OrderSide::Sell),
            idle_rungs: self
                .grid_orders
                .iter()
                .filter(|o| o.status.is_terminal() || o.status == OrderStatus::Filled)
                .count(),
            deepest_level: self.max_level(),
            top_bid: self.top_bid(),
            realized_pnl: self.profit.realized_pnl,
            total_fees: self.profit.total_fees,
            round_trips: self.profit.num_round_trips,
        }
    }

    /// Load a session from file
    pub fn load_from_file(path: impl AsRef<Path>) -> GridResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let book: Self = serde_json::from_str(&content)?;
        Ok(book)
    }

    /// Save to file atomically (write to temp, then rename)
    pub fn save_to_file_atomic(&self, path: impl AsRef<Path>) -> GridResult<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }
}

/// Summary of a session for logs and the HTTP API
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub symbol: String,
    pub subscription_handle: Option<SubscriptionHandle>,
    pub num_rungs: usize,
    pub open_buys: usize,
    pub open_sells: usize,
    pub idle_rungs: usize,
    pub deepest_level: Option<u32>,
    pub top_bid: Option<f64>,
    pub realized_pnl: f64,
    pub total_fees: f64,
    pub round_trips: u32,
}
