use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::traits::ErrorStore;

#[cfg(feature = "memory")]
use crate::memory::MemoryStore;

#[cfg(feature = "postgres")]
use crate::postgres::PostgresStore;

/// Build the store selected by `config`.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn ErrorStore>, StoreError> {
    match config {
        #[cfg(feature = "memory")]
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),

        #[cfg(feature = "postgres")]
        StoreConfig::Postgres {
            url,
            max_connections,
        } => {
            let store = PostgresStore::connect(url, *max_connections).await?;
            Ok(Arc::new(store))
        }

        #[allow(unreachable_patterns)]
        _ => Err(StoreError::NotConfigured(
            "No suitable storage backend enabled".to_string(),
        )),
    }
}
