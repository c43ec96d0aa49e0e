//! The balance engine.
//!
//! `Ledger` serializes every mutation of an account through that account's lock and
//! every transfer through both accounts' locks (canonical order). Each operation runs
//! as its own task on the tokio worker pool; the returned future only awaits the task,
//! so dropping it never abandons a mutation halfway.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use coinvault_core::{
    AccountId, Balance, BalanceEntry, DomainError, checked_credit, checked_total,
    ensure_non_negative, ensure_positive,
};
use coinvault_infra::config::env_or;
use coinvault_infra::{AccountStore, StoreError};

use crate::locks::AccountLockRegistry;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(StoreError),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid account id: {0}")]
    InvalidId(String),

    #[error("balance overflow: {0}")]
    Overflow(String),

    #[error("cannot transfer from an account to itself")]
    SelfTransfer,

    /// The spawned task panicked or was cancelled by runtime shutdown.
    #[error("ledger task failed in {operation}: {message}")]
    Worker { operation: &'static str, message: String },
}

impl From<DomainError> for LedgerError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => Self::InvalidAmount(msg),
            DomainError::InvalidId(msg) => Self::InvalidId(msg),
            DomainError::Overflow(msg) => Self::Overflow(msg),
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Domain(domain) => domain.into(),
            other => Self::Store(other),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LedgerConfig {
    /// Balance given to accounts made by `create_account`.
    pub starting_balance: Balance,
}

impl LedgerConfig {
    /// Reads `COINVAULT_STARTING_BALANCE` (default `0`).
    pub fn from_env() -> Self {
        Self {
            starting_balance: env_or("COINVAULT_STARTING_BALANCE", 0),
        }
    }

    pub fn with_starting_balance(mut self, balance: Balance) -> Self {
        self.starting_balance = balance;
        self
    }
}

/// Balances on both sides of a committed transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub from_old: Balance,
    pub from_new: Balance,
    pub to_old: Balance,
    pub to_new: Balance,
}

struct LedgerInner {
    store: Arc<dyn AccountStore>,
    locks: Arc<AccountLockRegistry>,
    config: LedgerConfig,
}

/// Cheap to clone; clones share the store and the lock registry.
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<LedgerInner>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("backend", &self.inner.store.backend_name())
            .field("config", &self.inner.config)
            .field("locks", &self.inner.locks.len())
            .finish()
    }
}

impl Ledger {
    pub fn new(
        store: Arc<dyn AccountStore>,
        locks: Arc<AccountLockRegistry>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                store,
                locks,
                config,
            }),
        }
    }

    /// Ledger with a fresh lock registry.
    pub fn with_store(store: Arc<dyn AccountStore>, config: LedgerConfig) -> Self {
        Self::new(store, Arc::new(AccountLockRegistry::new()), config)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.inner.config
    }

    pub fn locks(&self) -> &Arc<AccountLockRegistry> {
        &self.inner.locks
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, LedgerError>
    where
        F: FnOnce(Arc<LedgerInner>) -> Fut,
        Fut: Future<Output = Result<T, LedgerError>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(op(self.inner.clone()))
            .await
            .map_err(|e| LedgerError::Worker {
                operation,
                message: e.to_string(),
            })?
    }

    /// Current balance, `0` for unknown accounts. Not serialized against writers.
    pub async fn balance(&self, id: AccountId) -> Result<Balance, LedgerError> {
        self.run("balance", move |l| async move {
            Ok::<_, LedgerError>(l.store.get_balance(id).await?)
        })
        .await
    }

    pub async fn has_account(&self, id: AccountId) -> Result<bool, LedgerError> {
        self.run("has_account", move |l| async move {
            Ok::<_, LedgerError>(l.store.has_account(id).await?)
        })
        .await
    }

    /// Create with the configured starting balance. Returns `false` if it already
    /// existed; the existing balance is left alone.
    pub async fn create_account(&self, id: AccountId) -> Result<bool, LedgerError> {
        self.run("create_account", move |l| l.create_account(id)).await
    }

    /// Admin override: no negativity check.
    pub async fn set_balance(&self, id: AccountId, balance: Balance) -> Result<(), LedgerError> {
        self.run("set_balance", move |l| l.set_balance(id, balance))
            .await
    }

    /// Returns the new balance.
    pub async fn add_balance(&self, id: AccountId, delta: Balance) -> Result<Balance, LedgerError> {
        self.run("add_balance", move |l| l.add_balance(id, delta))
            .await
    }

    /// Returns the new balance, clamped at zero.
    pub async fn remove_balance(
        &self,
        id: AccountId,
        delta: Balance,
    ) -> Result<Balance, LedgerError> {
        self.run("remove_balance", move |l| l.remove_balance(id, delta))
            .await
    }

    /// Remove `delta` only if the account holds at least that much.
    ///
    /// `Ok(None)` means insufficient funds and nothing was written.
    pub async fn try_remove_balance(
        &self,
        id: AccountId,
        delta: Balance,
    ) -> Result<Option<Balance>, LedgerError> {
        self.run("try_remove_balance", move |l| l.try_remove_balance(id, delta))
            .await
    }

    /// Move `amount` from `from` to `to`, burning `fee`.
    ///
    /// `Ok(false)` means `from` holds less than `amount + fee`; neither side changed.
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Balance,
        fee: Balance,
    ) -> Result<bool, LedgerError> {
        Ok(self
            .transfer_with_receipt(from, to, amount, fee)
            .await?
            .is_some())
    }

    /// [`Ledger::transfer`] that also reports both sides' balances.
    pub async fn transfer_with_receipt(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Balance,
        fee: Balance,
    ) -> Result<Option<TransferReceipt>, LedgerError> {
        self.run("transfer", move |l| l.transfer(from, to, amount, fee))
            .await
    }

    /// Highest balances first, ties by ascending account id.
    pub async fn top_balances(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<BalanceEntry>, LedgerError> {
        self.run("top_balances", move |l| async move {
            Ok::<_, LedgerError>(l.store.top_balances(limit, offset).await?)
        })
        .await
    }

    pub async fn account_count(&self) -> Result<u64, LedgerError> {
        self.run("account_count", move |l| async move {
            Ok::<_, LedgerError>(l.store.account_count().await?)
        })
        .await
    }

    /// Close the underlying store (the file cache flushes here).
    pub async fn close(&self) -> Result<(), LedgerError> {
        self.run("close", move |l| async move { Ok::<_, LedgerError>(l.store.close().await?) })
            .await
    }
}

impl LedgerInner {
    #[instrument(skip(self), fields(account = %id), err)]
    async fn create_account(self: Arc<Self>, id: AccountId) -> Result<bool, LedgerError> {
        let _guard = self.locks.lock_one(id).await;
        let created = self
            .store
            .create_account(id, self.config.starting_balance)
            .await?;
        if created {
            tracing::debug!(starting_balance = self.config.starting_balance, "account created");
        }
        Ok(created)
    }

    #[instrument(skip(self), fields(account = %id), err)]
    async fn set_balance(self: Arc<Self>, id: AccountId, balance: Balance) -> Result<(), LedgerError> {
        let _guard = self.locks.lock_one(id).await;
        self.store.set_balance(id, balance).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(account = %id), err)]
    async fn add_balance(self: Arc<Self>, id: AccountId, delta: Balance) -> Result<Balance, LedgerError> {
        ensure_non_negative("delta", delta)?;
        let _guard = self.locks.lock_one(id).await;

        let current = self.store.get_balance(id).await?;
        checked_credit(current, delta)?;
        Ok(self.store.add_balance(id, delta).await?)
    }

    #[instrument(skip(self), fields(account = %id), err)]
    async fn remove_balance(
        self: Arc<Self>,
        id: AccountId,
        delta: Balance,
    ) -> Result<Balance, LedgerError> {
        ensure_non_negative("delta", delta)?;
        let _guard = self.locks.lock_one(id).await;
        Ok(self.store.remove_balance(id, delta).await?)
    }

    #[instrument(skip(self), fields(account = %id), err)]
    async fn try_remove_balance(
        self: Arc<Self>,
        id: AccountId,
        delta: Balance,
    ) -> Result<Option<Balance>, LedgerError> {
        ensure_non_negative("delta", delta)?;
        let _guard = self.locks.lock_one(id).await;

        let current = self.store.get_balance(id).await?;
        if current < delta {
            return Ok(None);
        }
        Ok(Some(self.store.remove_balance(id, delta).await?))
    }

    #[instrument(skip(self), fields(from = %from, to = %to), err)]
    async fn transfer(
        self: Arc<Self>,
        from: AccountId,
        to: AccountId,
        amount: Balance,
        fee: Balance,
    ) -> Result<Option<TransferReceipt>, LedgerError> {
        ensure_positive("amount", amount)?;
        ensure_non_negative("fee", fee)?;
        if from == to {
            return Err(LedgerError::SelfTransfer);
        }
        let total = checked_total(amount, fee)?;

        let _guard = self.locks.lock_pair(from, to).await;

        let from_old = self.store.get_balance(from).await?;
        if from_old < total {
            tracing::debug!(balance = from_old, total, "insufficient funds");
            return Ok(None);
        }
        let to_old = self.store.get_balance(to).await?;
        let to_new = checked_credit(to_old, amount)?;

        if !self.store.perform_transfer(from, to, amount, fee).await? {
            return Ok(None);
        }

        Ok(Some(TransferReceipt {
            from_old,
            from_new: from_old - total,
            to_old,
            to_new,
        }))
    }
}
