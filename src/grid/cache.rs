//! Read-through cache of recently touched order books

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use tokio::sync::RwLock;

use super::errors::GridResult;
use super::repository::OrderBookRepository;
use super::state::OrderBook;

/// Cache in front of the repository
#[async_trait]
pub trait OrderBookCache: Send + Sync {
    /// Cached copy if fresh, otherwise load through `loader` and cache it for `ttl`
    async fn get_or_load(
        &self,
        id: &str,
        ttl: Duration,
        loader: &dyn OrderBookRepository,
    ) -> GridResult<Option<OrderBook>>;

    async fn set(&self, id: &str, book: OrderBook, ttl: Duration);

    async fn clear(&self);
}

struct CacheEntry {
    book: OrderBook,
    expires_at: Instant,
}

/// In-process cache with per-entry expiry
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl OrderBookCache for MemoryCache {
    async fn get_or_load(
        &self,
        id: &str,
        ttl: Duration,
        loader: &dyn OrderBookRepository,
    ) -> GridResult<Option<OrderBook>> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(id) {
                if entry.expires_at > Instant::now() {
                    return Ok(Some(entry.book.clone()));
                }
            }
        }

        debug!("Cache miss for order book {}", id);
        let loaded = loader.get_by_id(id).await?;
        if let Some(book) = &loaded {
            self.set(id, book.clone(), ttl).await;
        }
        Ok(loaded)
    }

    async fn set(&self, id: &str, book: OrderBook, ttl: Duration) {
        self.entries.write().await.insert(
            id.to_string(),
            CacheEntry {
                book,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
