//! Named databases with an explicit lifecycle.
//!
//! A database is created on the first `open` of its name and shared by every
//! later `open` until `close` removes it from the registry.

use crate::database::{Database, DatabaseConfig};
use cinder_merkle::{BlockStore, MemoryBlockStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Builds the block store for a newly opened database name.
pub type StoreFactory = Arc<dyn Fn(&str) -> Arc<dyn BlockStore> + Send + Sync>;

pub struct Registry {
    factory: StoreFactory,
    config: DatabaseConfig,
    databases: RwLock<HashMap<String, Arc<Database>>>,
}

impl Registry {
    pub fn new<F>(factory: F, config: DatabaseConfig) -> Self
    where
        F: Fn(&str) -> Arc<dyn BlockStore> + Send + Sync + 'static,
    {
        Registry {
            factory: Arc::new(factory),
            config,
            databases: RwLock::new(HashMap::new()),
        }
    }

    /// Every database gets its own in-memory block store.
    pub fn in_memory() -> Self {
        Self::new(
            |_| Arc::new(MemoryBlockStore::new()) as Arc<dyn BlockStore>,
            DatabaseConfig::default(),
        )
    }

    /// The database called `name`, created on first use. Must be called
    /// inside a tokio runtime.
    pub fn open(&self, name: &str) -> Arc<Database> {
        if let Some(db) = self.databases.read().get(name) {
            return db.clone();
        }

        let mut databases = self.databases.write();
        databases
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(db = name, "opening database");
                Arc::new(Database::new(
                    name,
                    (self.factory)(name),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.read().get(name).cloned()
    }

    /// Forget `name`. Handles already given out stay usable; the next
    /// `open` creates a fresh database.
    pub fn close(&self, name: &str) -> bool {
        let removed = self.databases.write().remove(name).is_some();
        if removed {
            info!(db = name, "closed database");
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.databases.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    #[tokio::test]
    async fn test_open_shares_instance() {
        let registry = Registry::in_memory();
        let first = registry.open("notes");
        let second = registry.open("notes");
        assert!(Arc::ptr_eq(&first, &second));

        first.put(Document::with_id("a").set("v", 1)).await.unwrap();
        assert!(second.get("a").await.is_ok());
        assert_eq!(registry.names(), vec!["notes"]);
    }

    #[tokio::test]
    async fn test_close_and_reopen() {
        let registry = Registry::in_memory();
        let db = registry.open("tmp");
        db.put(Document::with_id("a")).await.unwrap();

        assert!(registry.close("tmp"));
        assert!(!registry.close("tmp"));
        assert!(registry.get("tmp").is_none());
        assert!(registry.is_empty());

        let fresh = registry.open("tmp");
        assert!(fresh.get("a").await.is_err());
        // The closed handle still works.
        assert!(db.get("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_factory_per_name() {
        let shared = Arc::new(MemoryBlockStore::new());
        let store = shared.clone();
        let registry = Registry::new(
            move |_| store.clone() as Arc<dyn BlockStore>,
            DatabaseConfig::default(),
        );

        let a = registry.open("a");
        a.put(Document::with_id("x")).await.unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(registry.len(), 1);
    }
}
