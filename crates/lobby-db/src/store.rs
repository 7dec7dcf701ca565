use std::path::Path;
use std::sync::Arc;

use tracing::error;

use crate::{Database, StoreError};

/// Async handle to the database. Each call runs on the blocking pool so a
/// slow query suspends only the calling task.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Run `f` against the database off the async runtime.
    pub async fn call<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StoreError::Task(e.to_string())
            })?
    }

    /// Direct access for synchronous setup code and tests.
    pub fn database(&self) -> &Database {
        &self.db
    }
}
