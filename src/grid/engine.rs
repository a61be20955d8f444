//! Grid trading state machine.
//!
//! Every handler that mutates a session runs under that session's lock,
//! reloads the order book through the cache, and mutates a rung only after
//! the broker has acknowledged the replacement order. Successful mutations are
//! written to the repository and then re-cached; a failed write is logged and
//! leaves the previous cache entry in place.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use super::cache::OrderBookCache;
use super::calculator::{gap_percent, price_from_gap, quantity_from_value, round_to};
use super::config::AssetPrecision;
use super::errors::{GridError, GridResult};
use super::executor::ExchangeGateway;
use super::locks::SessionLocks;
use super::placement::{OrderPlacer, RetryPolicy};
use super::repository::OrderBookRepository;
use super::state::OrderBook;
use super::types::{FillEvent, GridOrder, OrderSide, OrderStatus, SubscriptionHandle};

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// How long a cached order book is served before reloading
    pub cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            cache_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// What a price tick did to the ladder
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    NoAction,
    /// Ladder re-anchored at the tick price
    Reset {
        initial_gap_percent: f64,
        placed: usize,
    },
    /// A deeper rung was added
    Extended {
        level: u32,
        order_id: u64,
        /// Previous floor flipped to a sell, if its buy had filled
        flipped_level: Option<u32>,
    },
}

/// What a fill event did to the ladder
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// Unknown or stale order id
    Ignored,
    PartialRecorded { level: u32, number_filled: u32 },
    /// Buy filled on the deepest rung; its sell waits for a deeper rung
    SellDeferred { level: u32 },
    SellPlaced { level: u32, order_id: u64 },
    BuyPlaced {
        level: u32,
        order_id: u64,
        profit_percent: f64,
    },
}

/// Quantity left to sell after maker fees taken on each fill of the buy
fn fee_adjusted_quantity(quantity: f64, fee: f64, number_filled: u32) -> f64 {
    quantity - quantity * fee * number_filled as f64
}

pub struct GridEngine {
    gateway: Arc<dyn ExchangeGateway>,
    placer: OrderPlacer,
    repository: Arc<dyn OrderBookRepository>,
    cache: Arc<dyn OrderBookCache>,
    locks: Arc<SessionLocks>,
    cache_ttl: Duration,
}

impl GridEngine {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        repository: Arc<dyn OrderBookRepository>,
        cache: Arc<dyn OrderBookCache>,
        locks: Arc<SessionLocks>,
        config: EngineConfig,
    ) -> Self {
        Self {
            placer: OrderPlacer::new(gateway.clone(), config.retry),
            gateway,
            repository,
            cache,
            locks,
            cache_ttl: config.cache_ttl,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn ExchangeGateway> {
        &self.gateway
    }

    pub fn locks(&self) -> &Arc<SessionLocks> {
        &self.locks
    }

    /// Read-only copy of a session
    pub async fn session(&self, session_id: &str) -> GridResult<Option<OrderBook>> {
        self.cache
            .get_or_load(session_id, self.cache_ttl, self.repository.as_ref())
            .await
    }

    /// Every stored session
    pub async fn sessions(&self) -> GridResult<Vec<OrderBook>> {
        self.repository.get_all().await
    }

    async fn load(&self, session_id: &str) -> GridResult<OrderBook> {
        self.session(session_id)
            .await?
            .ok_or_else(|| GridError::SessionNotFound(session_id.to_string()))
    }

    /// Write to the repository, then refresh the cache
    async fn persist(&self, book: &mut OrderBook) {
        book.touch();
        match self.repository.update(book).await {
            Ok(()) => {
                self.cache.set(&book.id, book.clone(), self.cache_ttl).await;
            }
            Err(e) => {
                error!(
                    "[{}] Failed to persist order book {}, cache left stale: {}",
                    book.symbol, book.id, e
                );
            }
        }
    }

    /// Maker fee, or zero when the exchange cannot report it
    async fn trading_fee(&self, symbol: &str) -> f64 {
        match self.gateway.get_trading_fee(symbol).await {
            Ok(fee) => fee,
            Err(e) => {
                warn!("[{}] Could not fetch trading fee, assuming 0: {}", symbol, e);
                0.0
            }
        }
    }

    /// Seed the ladder for a new session and store it.
    ///
    /// Level 0 buys at the current price; each deeper level is one gap below
    /// the previous level's price. A level whose placement fails is skipped
    /// but the next level is still derived from its price.
    pub async fn init_grid(&self, book: &mut OrderBook) -> GridResult<()> {
        let symbol = book.symbol.clone();
        let price_decimals = self.gateway.get_price_decimals(&symbol).await?;
        let quantity_decimals = self.gateway.get_quantity_decimals(&symbol).await?;
        book.precision = AssetPrecision::new(price_decimals, quantity_decimals);

        let config = book.config.clone();
        let current_price = self.gateway.get_current_price(&symbol).await?;

        info!(
            "[{}] Seeding {} levels for session {} at price {}",
            symbol, config.total_grid_levels, book.id, current_price
        );

        let mut bid = book.precision.round_price(current_price);
        for level in 0..config.total_grid_levels {
            let gap = gap_percent(&config, level);
            let ask = if level == 0 {
                book.precision.round_price(bid * (1.0 + config.initial_gap_percent))
            } else {
                let previous = bid;
                bid = price_from_gap(bid, gap, price_decimals);
                previous
            };

            let quantity = quantity_from_value(bid, config.trade_value_at(level), quantity_decimals);
            match self
                .placer
                .place_limit_order(level, book, bid, quantity, OrderSide::Buy)
                .await
            {
                Ok(placed) => {
                    book.upsert_rung(GridOrder::new_buy(
                        placed.order_id,
                        level,
                        placed.price,
                        ask,
                        placed.quantity,
                        gap,
                    ));
                }
                Err(e) => {
                    error!(
                        "[{}] Skipping level {} at price {}: {}",
                        symbol, level, bid, e
                    );
                }
            }
        }

        if book.grid_orders.is_empty() {
            return Err(GridError::Initialization(format!(
                "no grid level could be placed for {}",
                symbol
            )));
        }

        book.touch();
        self.repository.insert(book).await?;
        self.cache.set(&book.id, book.clone(), self.cache_ttl).await;

        info!(
            "[{}] Session {} seeded with {}/{} levels",
            symbol,
            book.id,
            book.grid_orders.len(),
            config.total_grid_levels
        );
        Ok(())
    }

    /// Record (or clear) the session's price subscription
    pub async fn set_subscription(
        &self,
        session_id: &str,
        handle: Option<SubscriptionHandle>,
    ) -> GridResult<()> {
        let _guard = self.locks.acquire(session_id).await;
        let mut book = self.load(session_id).await?;
        book.subscription_handle = handle;
        self.persist(&mut book).await;
        Ok(())
    }

    /// React to a last-trade price for the session.
    ///
    /// Resets the ladder when the price clears the level-0 bid by
    /// `reset_grid_percent`, or on any tick while level 0 is missing; adds a
    /// deeper rung once the price has reached the next level below the
    /// current floor.
    pub async fn handle_price_tick(&self, session_id: &str, price: f64) -> GridResult<TickOutcome> {
        let _guard = self.locks.acquire(session_id).await;
        let mut book = self.load(session_id).await?;

        let reset_at = book
            .top_bid()
            .map_or(0.0, |bid| bid * (1.0 + book.config.reset_grid_percent));
        if price >= reset_at {
            let placed = self.reset_grid(&mut book, price).await;
            return Ok(TickOutcome::Reset {
                initial_gap_percent: book.config.initial_gap_percent,
                placed,
            });
        }

        let Some(lowest) = book.deepest().cloned() else {
            warn!("[{}] Session {} has no ladder, ignoring tick", book.symbol, session_id);
            return Ok(TickOutcome::NoAction);
        };
        if price >= lowest.bid_price {
            return Ok(TickOutcome::NoAction);
        }

        let level = lowest.grid_level + 1;
        let gap = gap_percent(&book.config, level);
        let price_grid = price_from_gap(lowest.bid_price, gap, book.precision.price_decimals);
        if price > price_grid {
            debug!(
                "[{}] Price {} below floor {} but above next level {}",
                book.symbol, price, lowest.bid_price, price_grid
            );
            return Ok(TickOutcome::NoAction);
        }

        let quantity = quantity_from_value(
            price_grid,
            book.config.trade_value_at(level),
            book.precision.quantity_decimals,
        );
        let placed = self
            .placer
            .place_limit_order(level, &book, price_grid, quantity, OrderSide::Buy)
            .await?;
        book.upsert_rung(GridOrder::new_buy(
            placed.order_id,
            level,
            placed.price,
            lowest.bid_price,
            placed.quantity,
            gap,
        ));
        info!(
            "[{}] Extended ladder to level {} at {} (order {})",
            book.symbol, level, placed.price, placed.order_id
        );

        let mut flipped_level = None;
        if lowest.side == OrderSide::Buy && lowest.status == OrderStatus::Filled {
            let fee = self.trading_fee(&book.symbol).await;
            let quantity = fee_adjusted_quantity(lowest.quantity, fee, lowest.number_filled);
            match self
                .placer
                .place_limit_order(lowest.grid_level, &book, lowest.ask_price, quantity, OrderSide::Sell)
                .await
            {
                Ok(sell) => {
                    if let Some(rung) = book.rung_mut(lowest.grid_level) {
                        rung.mark_placed(sell.order_id, OrderSide::Sell, sell.quantity);
                        flipped_level = Some(lowest.grid_level);
                    }
                }
                Err(e) => {
                    error!(
                        "[{}] Deferred sell for level {} still pending: {}",
                        book.symbol, lowest.grid_level, e
                    );
                }
            }
        }

        self.persist(&mut book).await;
        Ok(TickOutcome::Extended {
            level,
            order_id: placed.order_id,
            flipped_level,
        })
    }

    /// Re-anchor the ladder at `price`. Returns the number of levels placed.
    ///
    /// Every rung keeps its grid level and trade value; rungs deeper than
    /// the configured ladder are dropped. A level that cannot be re-placed
    /// stays on the ladder as canceled.
    async fn reset_grid(&self, book: &mut OrderBook, price: f64) -> usize {
        let symbol = book.symbol.clone();
        info!("[{}] Resetting session {} at price {}", symbol, book.id, price);

        match self.gateway.cancel_all_orders(&symbol).await {
            Ok(count) => debug!("[{}] Cancelled {} open orders", symbol, count),
            Err(e) => warn!("[{}] Cancel-all failed, continuing reset: {}", symbol, e),
        }

        book.config.initial_gap_percent *= 1.0 + book.config.reset_increment_percent;
        let config = book.config.clone();
        let precision = book.precision;

        let dropped = book.grid_orders.len();
        book.grid_orders
            .retain(|rung| rung.grid_level < config.total_grid_levels);
        let dropped = dropped - book.grid_orders.len();
        if dropped > 0 {
            debug!("[{}] Dropped {} rungs below the ladder", book.symbol, dropped);
        }

        let mut placed_count = 0;
        let mut bid = precision.round_price(price);
        for level in 0..config.total_grid_levels {
            let gap = gap_percent(&config, level);
            let ask = if level == 0 {
                precision.round_price(bid * (1.0 + config.initial_gap_percent))
            } else {
                let previous = bid;
                bid = price_from_gap(bid, gap, precision.price_decimals);
                previous
            };

            let trade_value = book
                .rung(level)
                .map(|rung| rung.trade_value())
                .filter(|value| *value > 0.0)
                .unwrap_or_else(|| config.trade_value_at(level));
            let quantity = quantity_from_value(bid, trade_value, precision.quantity_decimals);

            match self
                .placer
                .place_limit_order(level, book, bid, quantity, OrderSide::Buy)
                .await
            {
                Ok(placed) => {
                    placed_count += 1;
                    if let Some(rung) = book.rung_mut(level) {
                        rung.bid_price = placed.price;
                        rung.ask_price = ask;
                        rung.gap_percent = gap;
                        rung.mark_placed(placed.order_id, OrderSide::Buy, placed.quantity);
                    } else {
                        book.upsert_rung(GridOrder::new_buy(
                            placed.order_id,
                            level,
                            placed.price,
                            ask,
                            placed.quantity,
                            gap,
                        ));
                    }
                }
                Err(e) => {
                    error!("[{}] Reset could not re-place level {}: {}", symbol, level, e);
                    if let Some(rung) = book.rung_mut(level) {
                        rung.bid_price = bid;
                        rung.ask_price = ask;
                        rung.gap_percent = gap;
                        rung.mark_canceled();
                    }
                }
            }
        }

        self.persist(book).await;
        info!(
            "[{}] Reset complete: {}/{} levels placed, initial gap now {:.5}",
            book.symbol, placed_count, config.total_grid_levels, config.initial_gap_percent
        );
        placed_count
    }

    /// Route a fill to the session that owns the order id
    pub async fn handle_fill(&self, event: FillEvent) -> GridResult<FillOutcome> {
        match self.repository.get_by_contained_order_id(event.order_id).await? {
            Some(book) => self.handle_session_fill(&book.id, event).await,
            None => {
                info!("Fill for unknown order {} ignored", event.order_id);
                Ok(FillOutcome::Ignored)
            }
        }
    }

    /// Apply a fill to one session.
    ///
    /// The event must name the rung's current order id; anything else is a
    /// stale or duplicate notification and is ignored.
    pub async fn handle_session_fill(
        &self,
        session_id: &str,
        event: FillEvent,
    ) -> GridResult<FillOutcome> {
        let _guard = self.locks.acquire(session_id).await;
        let mut book = self.load(session_id).await?;

        let Some(rung) = book.rung_by_order_id(event.order_id).cloned() else {
            info!(
                "[{}] Fill for order {} does not match any open rung, ignoring",
                book.symbol, event.order_id
            );
            return Ok(FillOutcome::Ignored);
        };
        let level = rung.grid_level;

        if !event.is_full_fill {
            let number_filled = match book.rung_mut(level) {
                Some(rung) => {
                    rung.mark_partially_filled();
                    rung.number_filled
                }
                None => return Err(GridError::LevelNotFound(level)),
            };
            debug!(
                "[{}] Partial fill on level {} (order {}), fills={}",
                book.symbol, level, event.order_id, number_filled
            );
            self.persist(&mut book).await;
            return Ok(FillOutcome::PartialRecorded {
                level,
                number_filled,
            });
        }

        let outcome = match rung.side {
            OrderSide::Buy => {
                if book.max_level() == Some(level) {
                    if let Some(rung) = book.rung_mut(level) {
                        rung.mark_filled();
                    }
                    info!(
                        "[{}] Buy filled on deepest level {}, sell deferred",
                        book.symbol, level
                    );
                    FillOutcome::SellDeferred { level }
                } else {
                    self.place_sell(&mut book, &rung).await?
                }
            }
            OrderSide::Sell => self.place_buy_back(&mut book, &rung).await?,
        };

        self.persist(&mut book).await;
        Ok(outcome)
    }

    /// Buy filled: offer the bought quantity (less fees) at the rung's ask
    async fn place_sell(&self, book: &mut OrderBook, rung: &GridOrder) -> GridResult<FillOutcome> {
        let fee = self.trading_fee(&book.symbol).await;
        let quantity = fee_adjusted_quantity(rung.quantity, fee, rung.number_filled);

        let placed = self
            .placer
            .place_limit_order(rung.grid_level, book, rung.ask_price, quantity, OrderSide::Sell)
            .await?;

        let level = rung.grid_level;
        book.rung_mut(level)
            .ok_or(GridError::LevelNotFound(level))?
            .mark_placed(placed.order_id, OrderSide::Sell, placed.quantity);

        info!(
            "[{}] Level {} buy filled, sell placed at {} x {} (order {})",
            book.symbol, level, placed.price, placed.quantity, placed.order_id
        );
        Ok(FillOutcome::SellPlaced {
            level,
            order_id: placed.order_id,
        })
    }

    /// Sell filled: book the profit and buy back at the rung's bid with the proceeds
    async fn place_buy_back(&self, book: &mut OrderBook, rung: &GridOrder) -> GridResult<FillOutcome> {
        let fee_rate = self.trading_fee(&book.symbol).await;
        let gross = rung.ask_price * rung.quantity;
        let fee = fee_rate * rung.number_filled as f64 * gross;
        let trade_value = gross - fee;
        let cost = rung.bid_price * rung.quantity;
        let profit_percent = if cost > 0.0 {
            round_to((trade_value - cost) / cost * 100.0, 2)
        } else {
            0.0
        };

        let quantity = quantity_from_value(
            rung.bid_price,
            trade_value,
            book.precision.quantity_decimals,
        );
        let placed = self
            .placer
            .place_limit_order(rung.grid_level, book, rung.bid_price, quantity, OrderSide::Buy)
            .await?;

        let level = rung.grid_level;
        book.rung_mut(level)
            .ok_or(GridError::LevelNotFound(level))?
            .mark_placed(placed.order_id, OrderSide::Buy, placed.quantity);
        book.profit.add_trade(trade_value - cost, fee, gross);
        book.profit.complete_round_trip();

        info!(
            "[{}] Level {} sell filled, profit {}%, buy placed at {} x {} (order {})",
            book.symbol, level, profit_percent, placed.price, placed.quantity, placed.order_id
        );
        Ok(FillOutcome::BuyPlaced {
            level,
            order_id: placed.order_id,
            profit_percent,
        })
    }

    /// Drop every cached order book; later reads reload from the repository
    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    /// Cancel every open order on a symbol without touching session state
    pub async fn cancel_all(&self, symbol: &str) -> GridResult<u32> {
        let count = self.gateway.cancel_all_orders(symbol).await?;
        info!("[{}] Cancelled {} orders", symbol, count);
        Ok(count)
    }
}
