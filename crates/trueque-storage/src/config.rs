use crate::{InMemoryStorage, PostgresStorage, StorageResult, TruequeStorage};
use std::sync::Arc;

/// Storage engine selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// Volatile in-process engine, for tests and local development.
    Memory,
    /// Durable PostgreSQL engine.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Open the configured storage engine.
pub async fn open(config: &StorageConfig) -> StorageResult<Arc<dyn TruequeStorage>> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(InMemoryStorage::new())),
        StorageConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let storage = PostgresStorage::connect(database_url, *max_connections).await?;
            Ok(Arc::new(storage))
        }
    }
}
