//! Spot Grid Bot Binary
//!
//! Runs grid sessions against the paper exchange.
//!
//! ## Setup
//!
//! 1. Create a `config.toml` (see `config.example.toml`) listing the sessions
//!    to start and the paper account to trade with.
//!
//! 2. Run the bot:
//!    ```bash
//!    cargo run --bin spot_grid_bot -- config.toml
//!    ```
//!
//! Prices come from `[feed] replay_file`, one `symbol,price` per line.
//! Ctrl-C detaches every feed and drains the sessions before exiting.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::time::interval;

use spot_grid_bot::{
    config::Settings,
    grid::{
        GridEngine, GridSupervisor, InMemoryRepository, JsonFileRepository, MemoryCache,
        OrderBookRepository, PaperExchange, SessionLocks,
    },
    server::{self, AppState},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    let dotenv = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let default_config = "config.toml".to_string();
    let config_path = args.get(1).unwrap_or(&default_config);
    if !Path::new(config_path).exists() {
        eprintln!("Config file '{}' not found. Please create one.", config_path);
        std::process::exit(1);
    }
    let settings = Settings::new(config_path)?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log.level.as_str()),
    )
    .init();

    match dotenv {
        Ok(path) => info!("Loaded environment from: {}", path.display()),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let exchange = Arc::new(PaperExchange::new(settings.paper.clone())?);
    let repository: Arc<dyn OrderBookRepository> = match &settings.storage.state_dir {
        Some(dir) => {
            info!("Persisting sessions to {}", dir.display());
            Arc::new(JsonFileRepository::new(dir)?)
        }
        None => {
            warn!("No state_dir configured, sessions are kept in memory only");
            Arc::new(InMemoryRepository::new())
        }
    };

    let engine = GridEngine::new(
        exchange.clone(),
        repository,
        Arc::new(MemoryCache::new()),
        Arc::new(SessionLocks::new()),
        settings.engine.to_engine_config(),
    );
    let supervisor = Arc::new(GridSupervisor::new(Arc::new(engine)));

    for session in &settings.sessions {
        match supervisor
            .start_session(&session.symbol, session.grid.clone())
            .await
        {
            Ok(started) => info!(
                "Started {} session {} (subscription {})",
                started.symbol, started.session_id, started.subscription_handle
            ),
            Err(e) => error!("Failed to start {} session: {}", session.symbol, e),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_task = if settings.server.enabled {
        let state = AppState {
            supervisor: supervisor.clone(),
        };
        let host = settings.server.host.clone();
        let port = settings.server.port;
        let mut rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.changed().await;
            };
            if let Err(e) = server::serve(state, &host, port, shutdown).await {
                error!("API server failed: {}", e);
            }
        }))
    } else {
        None
    };

    let replay_task = settings.feed.replay_file.clone().map(|path| {
        let exchange = exchange.clone();
        let pause = Duration::from_millis(settings.feed.interval_ms);
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = replay_prices(&exchange, &path, pause) => {
                    if let Err(e) = result {
                        error!("Price replay from {} failed: {}", path.display(), e);
                    }
                }
                _ = rx.changed() => {}
            }
        })
    });

    info!("Grid bot is now RUNNING");

    let mut summary_timer = interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            _ = summary_timer.tick() => {
                match supervisor.engine().sessions().await {
                    Ok(books) => {
                        for book in books {
                            let s = book.summary();
                            info!(
                                "[{}] {} rungs, {} buys / {} sells open, PnL {:.4} over {} round trips",
                                s.symbol, s.num_rungs, s.open_buys, s.open_sells, s.realized_pnl, s.round_trips
                            );
                        }
                    }
                    Err(e) => warn!("Failed to load sessions: {}", e),
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(task) = replay_task {
        let _ = task.await;
    }
    supervisor.shutdown().await;
    if let Some(task) = server_task {
        let _ = task.await;
    }

    let snapshot = exchange.snapshot().await;
    info!(
        "Paper account: quote {:.4}, {} open orders, fees {:.4}",
        snapshot.quote_free, snapshot.open_orders, snapshot.total_fees
    );
    Ok(())
}

/// Push every `symbol,price` line of the file to the paper exchange
async fn replay_prices(
    exchange: &PaperExchange,
    path: &Path,
    pause: Duration,
) -> std::io::Result<()> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut pushed = 0usize;

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((symbol, price)) = line.split_once(',') else {
            warn!("Skipping malformed line {}: {}", line_no + 1, line);
            continue;
        };
        let Ok(price) = price.trim().parse::<f64>() else {
            warn!("Skipping bad price on line {}: {}", line_no + 1, line);
            continue;
        };

        let fills = exchange.push_price(symbol.trim(), price).await;
        if fills > 0 {
            info!("{} @ {} filled {} orders", symbol.trim(), price, fills);
        }
        pushed += 1;
        tokio::time::sleep(pause).await;
    }

    info!("Price replay finished: {} prices from {}", pushed, path.display());
    Ok(())
}
