//! Per-account mutual exclusion.
//!
//! One async mutex per account id, created on first use and kept for the life of the
//! registry. Two-account operations lock in canonical order (smaller id first), so any
//! set of concurrent transfers is deadlock-free regardless of direction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use coinvault_core::AccountId;

/// Exclusive access to one account until dropped.
#[derive(Debug)]
pub struct AccountGuard {
    account: AccountId,
    _guard: OwnedMutexGuard<()>,
}

impl AccountGuard {
    pub fn account(&self) -> AccountId {
        self.account
    }
}

/// Exclusive access to two accounts until dropped.
///
/// Fields drop in declaration order, so the second-acquired lock is released first.
#[derive(Debug)]
pub struct PairGuard {
    second: Option<AccountGuard>,
    first: AccountGuard,
}

impl PairGuard {
    /// The accounts in acquisition order.
    pub fn accounts(&self) -> (AccountId, Option<AccountId>) {
        (self.first.account, self.second.as_ref().map(|g| g.account))
    }
}

/// Registry of account locks.
///
/// Injected into the ledger rather than held globally, so tests and multiple ledgers
/// never share lock state by accident.
#[derive(Debug, Default)]
pub struct AccountLockRegistry {
    locks: Mutex<HashMap<AccountId, Arc<AsyncMutex<()>>>>,
}

impl AccountLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock handle for `id`, creating it if absent.
    ///
    /// The map lock is held across lookup and insert, so only one handle is ever
    /// published per id.
    pub fn lock_for(&self, id: AccountId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.entry(id).or_default().clone()
    }

    pub async fn lock_one(&self, id: AccountId) -> AccountGuard {
        let guard = self.lock_for(id).lock_owned().await;
        AccountGuard {
            account: id,
            _guard: guard,
        }
    }

    /// Lock two accounts, smaller id first. `a == b` takes a single lock.
    pub async fn lock_pair(&self, a: AccountId, b: AccountId) -> PairGuard {
        if a == b {
            return PairGuard {
                first: self.lock_one(a).await,
                second: None,
            };
        }

        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let first = self.lock_one(low).await;
        let second = self.lock_one(high).await;
        PairGuard {
            second: Some(second),
            first,
        }
    }

    /// Number of lock handles ever created.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn same_id_yields_same_handle() {
        let registry = AccountLockRegistry::new();
        let id = AccountId::new();

        let a = registry.lock_for(id);
        let b = registry.lock_for(id);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn pair_orders_by_id() {
        let registry = AccountLockRegistry::new();
        let (x, y) = (AccountId::new(), AccountId::new());
        let (low, high) = if x < y { (x, y) } else { (y, x) };

        let guard = registry.lock_pair(high, low).await;
        assert_eq!(guard.accounts(), (low, Some(high)));
    }

    #[tokio::test]
    async fn equal_pair_takes_one_lock() {
        let registry = AccountLockRegistry::new();
        let id = AccountId::new();

        let guard = registry.lock_pair(id, id).await;
        assert_eq!(guard.accounts(), (id, None));
        assert!(registry.lock_for(id).try_lock().is_err());
        drop(guard);
        assert!(registry.lock_for(id).try_lock().is_ok());
    }

    #[tokio::test]
    async fn held_lock_blocks_second_acquirer() {
        let registry = Arc::new(AccountLockRegistry::new());
        let id = AccountId::new();

        let guard = registry.lock_one(id).await;
        let contender = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.lock_one(id).await.account() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);

        let acquired = tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acquired, id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn opposite_pairs_do_not_deadlock() {
        let registry = Arc::new(AccountLockRegistry::new());
        let (a, b) = (AccountId::new(), AccountId::new());

        let tasks: Vec<_> = (0..200)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let _guard = if i % 2 == 0 {
                        registry.lock_pair(a, b).await
                    } else {
                        registry.lock_pair(b, a).await
                    };
                    tokio::task::yield_now().await;
                })
            })
            .collect();

        tokio::time::timeout(Duration::from_secs(5), async {
            for task in tasks {
                task.await.unwrap();
            }
        })
        .await
        .expect("pair locking deadlocked");
    }
}
