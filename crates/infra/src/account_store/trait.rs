use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use coinvault_core::{AccountId, Balance, BalanceEntry, DomainError};

/// Account store operation error.
///
/// These are **infrastructure errors** (I/O, drivers, pools) as opposed to the
/// deterministic failures in `DomainError`. Insufficient funds is not an error at
/// this layer: `perform_transfer` reports it as `Ok(false)`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure in the file-cache backend.
    #[error("io error in {operation}: {message}")]
    Io { operation: String, message: String },

    /// Driver or database failure in the relational backend.
    #[error("database error: {0}")]
    Database(String),

    /// Connection or lock acquisition exceeded its bound.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A persisted record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The store was used after `close()` (or before `initialize()`).
    #[error("store is closed")]
    Closed,

    /// The store was built with settings it cannot run with.
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    /// An in-process lock was poisoned by a panicking holder.
    #[error("lock poisoned: {0}")]
    Poisoned(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl StoreError {
    pub fn io(operation: &str, err: std::io::Error) -> Self {
        Self::Io {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }

    /// Whether the caller may reasonably retry. The store itself never retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Io { .. } | Self::Database(_))
    }
}

/// Persistence for one running balance per account.
///
/// ## Design Principles
///
/// - **One field per account**: a balance, nothing else
/// - **Atomic primitives**: `add_balance`, `remove_balance` and `perform_transfer`
///   are single atomic units at the storage layer (one statement, one transaction,
///   or one critical section), never a read in the caller followed by a write
/// - **No per-account ordering**: two calls for the same account may interleave;
///   serializing them is the ledger's job
/// - **No retries**: every failure is returned as-is so a mutation is never applied
///   twice behind the caller's back
///
/// ## Backend Agreement
///
/// Every implementation must agree on:
/// - missing accounts read as balance `0`
/// - `create_account` never overwrites an existing account
/// - `remove_balance` clamps at zero
/// - `top_balances` orders by balance descending, then account id ascending
/// - `perform_transfer` burns the fee and creates the receiver if needed
///
/// ## Lifecycle
///
/// `initialize()` once before first use, `close()` once at shutdown. Operations after
/// `close()` fail with `StoreError::Closed`.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Backend name for logs.
    fn backend_name(&self) -> &'static str;

    async fn initialize(&self) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError>;

    /// Current balance, `0` when the account does not exist.
    async fn get_balance(&self, id: AccountId) -> Result<Balance, StoreError>;

    /// Create or overwrite.
    async fn set_balance(&self, id: AccountId, balance: Balance) -> Result<(), StoreError>;

    async fn has_account(&self, id: AccountId) -> Result<bool, StoreError>;

    /// Create with `starting_balance` if absent. Returns `false` when the account
    /// already existed (and was left untouched).
    async fn create_account(
        &self,
        id: AccountId,
        starting_balance: Balance,
    ) -> Result<bool, StoreError>;

    /// Atomic increment. Creates the account if absent. Returns the new balance.
    async fn add_balance(&self, id: AccountId, delta: Balance) -> Result<Balance, StoreError>;

    /// Atomic decrement clamped at zero. Creates the account if absent. Returns the
    /// new balance.
    async fn remove_balance(&self, id: AccountId, delta: Balance) -> Result<Balance, StoreError>;

    /// Move `amount` from `from` to `to`, burning `fee`.
    ///
    /// Returns `Ok(false)` with no state change when `from` holds less than
    /// `amount + fee`. Debit and credit are committed together or not at all.
    async fn perform_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Balance,
        fee: Balance,
    ) -> Result<bool, StoreError>;

    /// Leaderboard slice, re-queried on every call.
    async fn top_balances(&self, limit: u32, offset: u32) -> Result<Vec<BalanceEntry>, StoreError>;

    async fn account_count(&self) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> AccountStore for Arc<S>
where
    S: AccountStore + ?Sized,
{
    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        (**self).initialize().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        (**self).close().await
    }

    async fn get_balance(&self, id: AccountId) -> Result<Balance, StoreError> {
        (**self).get_balance(id).await
    }

    async fn set_balance(&self, id: AccountId, balance: Balance) -> Result<(), StoreError> {
        (**self).set_balance(id, balance).await
    }

    async fn has_account(&self, id: AccountId) -> Result<bool, StoreError> {
        (**self).has_account(id).await
    }

    async fn create_account(
        &self,
        id: AccountId,
        starting_balance: Balance,
    ) -> Result<bool, StoreError> {
        (**self).create_account(id, starting_balance).await
    }

    async fn add_balance(&self, id: AccountId, delta: Balance) -> Result<Balance, StoreError> {
        (**self).add_balance(id, delta).await
    }

    async fn remove_balance(&self, id: AccountId, delta: Balance) -> Result<Balance, StoreError> {
        (**self).remove_balance(id, delta).await
    }

    async fn perform_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Balance,
        fee: Balance,
    ) -> Result<bool, StoreError> {
        (**self).perform_transfer(from, to, amount, fee).await
    }

    async fn top_balances(&self, limit: u32, offset: u32) -> Result<Vec<BalanceEntry>, StoreError> {
        (**self).top_balances(limit, offset).await
    }

    async fn account_count(&self) -> Result<u64, StoreError> {
        (**self).account_count().await
    }
}
