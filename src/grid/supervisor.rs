//! Session lifecycle: start, stop and drain grid sessions.
//!
//! Each session gets one task that consumes its price-tick and fill queues.
//! Handler errors are logged and contained to that event; the task ends once
//! both feeds are detached and drained, and then drops the session lock.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::config::GridConfig;
use super::engine::GridEngine;
use super::errors::GridResult;
use super::executor::{ExchangeGateway, FillReceiver, PriceReceiver};
use super::state::OrderBook;
use super::types::SubscriptionHandle;

/// Consecutive handler failures before the session task starts shouting
const ERROR_ALERT_THRESHOLD: u32 = 5;

/// Returned to callers of [`GridSupervisor::start_session`]
#[derive(Debug, Clone, Serialize)]
pub struct StartedSession {
    pub session_id: String,
    pub symbol: String,
    pub subscription_handle: SubscriptionHandle,
}

struct ActiveSession {
    session_id: String,
    symbol: String,
    fill_handle: SubscriptionHandle,
    /// Cleared once the price feed has been detached
    price_attached: bool,
    task: JoinHandle<()>,
}

pub struct GridSupervisor {
    engine: Arc<GridEngine>,
    gateway: Arc<dyn ExchangeGateway>,
    /// Keyed by price subscription handle
    sessions: Mutex<HashMap<SubscriptionHandle, ActiveSession>>,
}

impl GridSupervisor {
    pub fn new(engine: Arc<GridEngine>) -> Self {
        Self {
            gateway: engine.gateway().clone(),
            engine,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<GridEngine> {
        &self.engine
    }

    /// Create a session, seed its ladder and attach both feeds.
    ///
    /// Cached order books are dropped first so every session reloads from the
    /// repository. The fill feed is attached before seeding so no fill for a
    /// freshly placed order can be missed; events queue until the session
    /// task runs.
    pub async fn start_session(
        &self,
        symbol: &str,
        config: GridConfig,
    ) -> GridResult<StartedSession> {
        config.validate()?;
        self.engine.clear_cache().await;
        let mut book = OrderBook::new(symbol, config);
        info!("[{}] Starting grid session {}", symbol, book.id);

        let (fill_handle, fill_rx) = self.gateway.subscribe_fill_events(symbol).await?;

        if let Err(e) = self.engine.init_grid(&mut book).await {
            error!("[{}] Seeding session {} failed: {}", symbol, book.id, e);
            self.detach(&fill_handle).await;
            if !book.grid_orders.is_empty() {
                // Orders went out but the session could not be stored
                if let Err(cancel_err) = self.gateway.cancel_all_orders(symbol).await {
                    warn!("[{}] Could not cancel orphaned orders: {}", symbol, cancel_err);
                }
            }
            return Err(e);
        }

        let (price_handle, price_rx) = match self.gateway.subscribe_price_ticks(symbol).await {
            Ok(sub) => sub,
            Err(e) => {
                error!("[{}] Price feed subscription failed: {}", symbol, e);
                self.detach(&fill_handle).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .engine
            .set_subscription(&book.id, Some(price_handle.clone()))
            .await
        {
            warn!("[{}] Could not record subscription {}: {}", symbol, price_handle, e);
        }

        let task = tokio::spawn(run_session(
            self.engine.clone(),
            book.id.clone(),
            book.symbol.clone(),
            price_rx,
            fill_rx,
        ));

        self.sessions.lock().await.insert(
            price_handle.clone(),
            ActiveSession {
                session_id: book.id.clone(),
                symbol: symbol.to_string(),
                fill_handle,
                price_attached: true,
                task,
            },
        );

        info!(
            "[{}] Session {} running, price subscription {}",
            symbol, book.id, price_handle
        );
        Ok(StartedSession {
            session_id: book.id,
            symbol: symbol.to_string(),
            subscription_handle: price_handle,
        })
    }

    /// Detach the session's price feed. Fills keep being processed so
    /// resting orders still flip. Returns false if no active subscription
    /// matched the handle.
    pub async fn stop_session(&self, handle: &SubscriptionHandle) -> bool {
        let session_id = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(handle) {
                Some(session) if session.price_attached => {
                    session.price_attached = false;
                    session.session_id.clone()
                }
                _ => {
                    warn!("Subscription {} not found in active subscriptions", handle);
                    return false;
                }
            }
        };

        self.detach(handle).await;
        if let Err(e) = self.engine.set_subscription(&session_id, None).await {
            warn!("Could not clear subscription on session {}: {}", session_id, e);
        }
        info!("Stopped price feed {} for session {}", handle, session_id);
        true
    }

    /// Price subscription handles of sessions still receiving ticks
    pub async fn active_handles(&self) -> Vec<SubscriptionHandle> {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|(_, s)| s.price_attached)
            .map(|(h, _)| h.clone())
            .collect()
    }

    /// Detach every feed, wait for in-flight handlers to finish and release
    /// session locks.
    pub async fn shutdown(&self) {
        let sessions: Vec<(SubscriptionHandle, ActiveSession)> =
            self.sessions.lock().await.drain().collect();
        info!("Shutting down {} grid sessions", sessions.len());

        let mut tasks = Vec::with_capacity(sessions.len());
        for (price_handle, session) in sessions {
            if session.price_attached {
                self.detach(&price_handle).await;
            }
            self.detach(&session.fill_handle).await;
            debug!("[{}] Draining session {}", session.symbol, session.session_id);
            tasks.push(session.task);
        }

        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Session task ended abnormally: {}", e);
            }
        }
        info!("All grid sessions drained");
    }

    async fn detach(&self, handle: &SubscriptionHandle) {
        match self.gateway.unsubscribe(handle).await {
            Ok(true) => debug!("Unsubscribed {}", handle),
            Ok(false) => debug!("Subscription {} was already gone", handle),
            Err(e) => warn!("Failed to unsubscribe {}: {}", handle, e),
        }
    }
}

/// Consume one session's feeds until both are closed
async fn run_session(
    engine: Arc<GridEngine>,
    session_id: String,
    symbol: String,
    mut price_rx: PriceReceiver,
    mut fill_rx: FillReceiver,
) {
    let mut price_open = true;
    let mut fill_open = true;
    let mut consecutive_errors = 0u32;

    while price_open || fill_open {
        let result = tokio::select! {
            tick = price_rx.recv(), if price_open => match tick {
                Some(price) => engine.handle_price_tick(&session_id, price).await.map(|outcome| {
                    debug!("[{}] Tick {} -> {:?}", symbol, price, outcome);
                }),
                None => {
                    debug!("[{}] Price feed closed for session {}", symbol, session_id);
                    price_open = false;
                    Ok(())
                }
            },
            fill = fill_rx.recv(), if fill_open => match fill {
                Some(event) => engine.handle_session_fill(&session_id, event).await.map(|outcome| {
                    debug!("[{}] Fill {:?} -> {:?}", symbol, event, outcome);
                }),
                None => {
                    debug!("[{}] Fill feed closed for session {}", symbol, session_id);
                    fill_open = false;
                    Ok(())
                }
            },
        };

        match result {
            Ok(()) => consecutive_errors = 0,
            Err(e) => {
                consecutive_errors += 1;
                error!("[{}] Session {} handler failed: {}", symbol, session_id, e);
                if consecutive_errors >= ERROR_ALERT_THRESHOLD {
                    warn!(
                        "[{}] Session {} has failed {} events in a row",
                        symbol, session_id, consecutive_errors
                    );
                }
            }
        }
    }

    engine.locks().remove(&session_id);
    info!("[{}] Session {} drained", symbol, session_id);
}
