//! Spot Grid Trading Engine
//!
//! A ladder of limit buys below the market, each paired with a sell one grid
//! gap above it. A filled buy flips into its paired sell; a filled sell books
//! the profit and re-buys at the rung's bid. The ladder is re-centred when
//! price runs away above it and extended downward when price falls through
//! the floor.
//!
//! # Architecture
//!
//! - [`calculator`] - Gap, price and quantity math
//! - [`config`] - Grid parameters and symbol precision
//! - [`types`] - Rungs, fills, subscription handles, profit
//! - [`errors`] - Grid-specific error types
//! - [`state`] - The per-session order book and its JSON form
//! - [`executor`] - Exchange abstraction (mockable for testing)
//! - [`paper`] - Simulated exchange for dry runs
//! - [`placement`] - Single order placement with retry on insufficient balance
//! - [`repository`] / [`cache`] - Session persistence
//! - [`locks`] - Per-session serialization of handlers
//! - [`engine`] - Seeding, price-tick and fill handling
//! - [`supervisor`] - Session lifecycle and event dispatch
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use spot_grid_bot::grid::*;
//!
//! let exchange = Arc::new(PaperExchange::new(PaperConfig::default())?);
//! let engine = GridEngine::new(
//!     exchange.clone(),
//!     Arc::new(InMemoryRepository::new()),
//!     Arc::new(MemoryCache::new()),
//!     Arc::new(SessionLocks::new()),
//!     EngineConfig::default(),
//! );
//! let supervisor = GridSupervisor::new(Arc::new(engine));
//!
//! // 10 levels of $100, 1% initial gap
//! let started = supervisor
//!     .start_session("BTCUSDT", GridConfig::new(10, 100.0))
//!     .await?;
//!
//! exchange.push_price("BTCUSDT", 99.0).await;
//! supervisor.stop_session(&started.subscription_handle).await;
//! ```

pub mod cache;
pub mod calculator;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod locks;
pub mod paper;
pub mod placement;
pub mod repository;
pub mod state;
pub mod supervisor;
pub mod types;

// Re-export commonly used types
pub use cache::{MemoryCache, OrderBookCache};
pub use config::{AssetPrecision, GridConfig};
pub use engine::{EngineConfig, FillOutcome, GridEngine, TickOutcome};
pub use errors::{GridError, GridResult};
pub use executor::{ExchangeGateway, FeedHub, FillReceiver, PriceReceiver};
pub use locks::SessionLocks;
pub use paper::{PaperConfig, PaperExchange, PaperMarket, PaperSnapshot};
pub use placement::{OrderPlacer, PlacedOrder, RetryPolicy};
pub use repository::{InMemoryRepository, JsonFileRepository, OrderBookRepository};
pub use state::{OrderBook, SessionSummary};
pub use supervisor::{GridSupervisor, StartedSession};
pub use types::{
    FillEvent, GridOrder, GridProfit, OrderSide, OrderStatus, SubscriptionHandle,
};
