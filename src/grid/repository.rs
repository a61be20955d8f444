//! Order book persistence

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::RwLock;

use super::errors::{GridError, GridResult};
use super::state::OrderBook;

/// Storage for session order books. Implementations hold copies; the engine
/// owns the authoritative instance while it holds the session lock.
#[async_trait]
pub trait OrderBookRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> GridResult<Option<OrderBook>>;

    /// Session whose rungs currently reference `order_id`
    async fn get_by_contained_order_id(&self, order_id: u64) -> GridResult<Option<OrderBook>>;

    async fn get_all(&self) -> GridResult<Vec<OrderBook>>;

    /// Fails if the id already exists
    async fn insert(&self, book: &OrderBook) -> GridResult<()>;

    /// Fails if the id does not exist
    async fn update(&self, book: &OrderBook) -> GridResult<()>;

    /// Returns whether anything was deleted
    async fn delete(&self, id: &str) -> GridResult<bool>;
}

/// Repository kept in process memory
#[derive(Default)]
pub struct InMemoryRepository {
    books: RwLock<HashMap<String, OrderBook>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderBookRepository for InMemoryRepository {
    async fn get_by_id(&self, id: &str) -> GridResult<Option<OrderBook>> {
        Ok(self.books.read().await.get(id).cloned())
    }

    async fn get_by_contained_order_id(&self, order_id: u64) -> GridResult<Option<OrderBook>> {
        Ok(self
            .books
            .read()
            .await
            .values()
            .find(|b| b.contains_order(order_id))
            .cloned())
    }

    async fn get_all(&self) -> GridResult<Vec<OrderBook>> {
        let mut books: Vec<_> = self.books.read().await.values().cloned().collect();
        books.sort_by_key(|b| b.created_at);
        Ok(books)
    }

    async fn insert(&self, book: &OrderBook) -> GridResult<()> {
        let mut books = self.books.write().await;
        if books.contains_key(&book.id) {
            return Err(GridError::Repository(format!(
                "order book {} already exists",
                book.id
            )));
        }
        books.insert(book.id.clone(), book.clone());
        Ok(())
    }

    async fn update(&self, book: &OrderBook) -> GridResult<()> {
        let mut books = self.books.write().await;
        match books.get_mut(&book.id) {
            Some(existing) => {
                *existing = book.clone();
                Ok(())
            }
            None => Err(GridError::Repository(format!(
                "order book {} does not exist",
                book.id
            ))),
        }
    }

    async fn delete(&self, id: &str) -> GridResult<bool> {
        Ok(self.books.write().await.remove(id).is_some())
    }
}

/// Repository storing one `<id>.json` file per session, written atomically
pub struct JsonFileRepository {
    dir: PathBuf,
    /// Serializes writers so an update never races an insert of the same id
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileRepository {
    /// Open (and create if needed) the state directory
    pub fn new(dir: impl Into<PathBuf>) -> GridResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn path_for(&self, id: &str) -> GridResult<PathBuf> {
        if id.is_empty() || id.contains(|c| matches!(c, '/' | '\\' | '.')) {
            return Err(GridError::Repository(format!("invalid order book id '{}'", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn read_file(path: PathBuf) -> GridResult<OrderBook> {
        tokio::task::spawn_blocking(move || OrderBook::load_from_file(path))
            .await
            .map_err(|e| GridError::StatePersistence(e.to_string()))?
    }

    async fn write_file(path: PathBuf, book: OrderBook) -> GridResult<()> {
        tokio::task::spawn_blocking(move || book.save_to_file_atomic(path))
            .await
            .map_err(|e| GridError::StatePersistence(e.to_string()))?
    }

    async fn load_all(&self) -> GridResult<Vec<OrderBook>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut books = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_file(path.clone()).await {
                Ok(book) => books.push(book),
                Err(e) => warn!("Skipping unreadable order book {:?}: {}", path, e),
            }
        }
        books.sort_by_key(|b| b.created_at);
        Ok(books)
    }
}

#[async_trait]
impl OrderBookRepository for JsonFileRepository {
    async fn get_by_id(&self, id: &str) -> GridResult<Option<OrderBook>> {
        let path = self.path_for(id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read_file(path).await.map(Some)
    }

    async fn get_by_contained_order_id(&self, order_id: u64) -> GridResult<Option<OrderBook>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .find(|b| b.contains_order(order_id)))
    }

    async fn get_all(&self) -> GridResult<Vec<OrderBook>> {
        self.load_all().await
    }

    async fn insert(&self, book: &OrderBook) -> GridResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(&book.id)?;
        if tokio::fs::try_exists(&path).await? {
            return Err(GridError::Repository(format!(
                "order book {} already exists",
                book.id
            )));
        }
        Self::write_file(path.clone(), book.clone()).await?;
        debug!("Order book {} saved to {:?}", book.id, path);
        Ok(())
    }

    async fn update(&self, book: &OrderBook) -> GridResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(&book.id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(GridError::Repository(format!(
                "order book {} does not exist",
                book.id
            )));
        }
        Self::write_file(path, book.clone()).await
    }

    async fn delete(&self, id: &str) -> GridResult<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::GridConfig;
    use crate::grid::types::GridOrder;

    fn book_with_order(order_id: u64) -> OrderBook {
        let mut book = OrderBook::new("BTCUSDT", GridConfig::new(2, 100.0));
        book.upsert_rung(GridOrder::new_buy(order_id, 0, 100.0, 101.0, 1.0, 0.01));
        book
    }

    async fn exercise(repo: &dyn OrderBookRepository) {
        let mut book = book_with_order(41);
        repo.insert(&book).await.unwrap();
        assert!(repo.insert(&book).await.is_err());

        let found = repo.get_by_contained_order_id(41).await.unwrap().unwrap();
        assert_eq!(found.id, book.id);
        assert!(repo.get_by_contained_order_id(42).await.unwrap().is_none());

        if let Some(rung) = book.rung_mut(0) {
            rung.order_id = Some(42);
        }
        repo.update(&book).await.unwrap();
        assert!(repo.get_by_contained_order_id(41).await.unwrap().is_none());
        assert_eq!(
            repo.get_by_id(&book.id).await.unwrap().unwrap().rung(0).unwrap().order_id,
            Some(42)
        );

        let other = book_with_order(7);
        assert!(repo.update(&other).await.is_err());
        repo.insert(&other).await.unwrap();
        assert_eq!(repo.get_all().await.unwrap().len(), 2);

        assert!(repo.delete(&book.id).await.unwrap());
        assert!(!repo.delete(&book.id).await.unwrap());
        assert!(repo.get_by_id(&book.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_repository() {
        exercise(&InMemoryRepository::new()).await;
    }

    #[tokio::test]
    async fn test_json_file_repository() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(dir.path().join("books")).unwrap();
        exercise(&repo).await;
    }

    #[tokio::test]
    async fn test_json_file_repository_rejects_path_ids() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(dir.path()).unwrap();
        assert!(repo.get_by_id("../escape").await.is_err());
    }
}
