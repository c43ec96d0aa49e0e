//! Infrastructure layer: account stores and their configuration.

pub mod account_store;
pub mod config;

pub use account_store::{
    AccountStore, CachedFileStore, FlushReport, PoolSettings, RelationalStore, StoreError,
    open_store,
};
pub use config::{BackendKind, StoreConfig};
