//! Account balance persistence.
//!
//! - `r#trait`: the `AccountStore` interface and `StoreError`
//! - `cached_file`: in-memory working set flushed to per-account JSON records
//! - `relational`: SQLite/PostgreSQL through `sqlx`

pub mod cached_file;
pub mod relational;
pub mod r#trait;

use std::sync::Arc;

pub use cached_file::{CachedFileStore, FlushReport};
pub use r#trait::{AccountStore, StoreError};
pub use relational::{PoolSettings, RelationalStore};

use crate::config::{BackendKind, StoreConfig};

/// Build the configured backend and run its `initialize()`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn AccountStore>, StoreError> {
    let store: Arc<dyn AccountStore> = match config.backend {
        BackendKind::File => Arc::new(CachedFileStore::new(
            config.data_dir.clone(),
            config.flush_interval,
        )),
        BackendKind::Relational => Arc::new(
            RelationalStore::connect(&config.database_url, &config.pool_settings()).await?,
        ),
    };

    store.initialize().await?;
    tracing::info!(backend = store.backend_name(), "account store opened");
    Ok(store)
}
