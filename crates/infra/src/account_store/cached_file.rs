//! File-cached account store.
//!
//! The whole working set lives in memory and is the source of truth for reads.
//! Mutations only touch memory and mark the account dirty; a background sweep (and a
//! final synchronous sweep in `close()`) writes each dirty account to its own record
//! under the data directory:
//!
//! ```text
//! <data_dir>/<account-uuid>.json   {"balance": 690}
//! ```
//!
//! A crash between a mutation and the next sweep loses that mutation. This is an
//! accepted property of the backend, not something the sweep tries to paper over.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::instrument;

use coinvault_core::{
    AccountId, Balance, BalanceEntry, checked_credit, checked_total, clamped_debit,
};

use super::r#trait::{AccountStore, StoreError};

const RECORD_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "json.tmp";

/// On-disk shape of one account.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AccountRecord {
    balance: Balance,
}

#[derive(Debug, Default)]
struct CacheState {
    accounts: HashMap<AccountId, Balance>,
    dirty: HashSet<AccountId>,
    open: bool,
}

impl CacheState {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open { Ok(()) } else { Err(StoreError::Closed) }
    }

    fn put(&mut self, id: AccountId, balance: Balance) {
        self.accounts.insert(id, balance);
        self.dirty.insert(id);
    }
}

/// Outcome of one flush sweep.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub deleted: usize,
    /// Records that failed and were re-marked dirty for the next sweep.
    pub failed: usize,
}

struct FlushWorker {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

struct Shared {
    data_dir: PathBuf,
    state: RwLock<CacheState>,
    /// Serializes sweeps so the timer and `close()` never write the same record
    /// concurrently.
    flush_lock: tokio::sync::Mutex<()>,
}

/// Account store backed by an in-memory map with periodic per-account file flushes.
///
/// The in-memory lock is only held for map operations, never across I/O, so reads
/// (`get_balance`, `top_balances`) never wait on the disk.
pub struct CachedFileStore {
    shared: Arc<Shared>,
    flush_interval: Duration,
    worker: Mutex<Option<FlushWorker>>,
}

impl CachedFileStore {
    pub fn new(data_dir: impl Into<PathBuf>, flush_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                data_dir: data_dir.into(),
                state: RwLock::new(CacheState::default()),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
            flush_interval,
            worker: Mutex::new(None),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.shared.data_dir
    }

    /// Write every dirty account now.
    pub async fn flush(&self) -> Result<FlushReport, StoreError> {
        self.shared.flush().await
    }

    /// Number of accounts waiting for the next sweep.
    pub fn dirty_count(&self) -> Result<usize, StoreError> {
        Ok(self.shared.read()?.dirty.len())
    }

    /// Administrative removal: drops the account from memory; its record is deleted
    /// by the next sweep.
    pub fn delete_account(&self, id: AccountId) -> Result<bool, StoreError> {
        let mut state = self.shared.write()?;
        state.ensure_open()?;
        let existed = state.accounts.remove(&id).is_some();
        state.dirty.insert(id);
        Ok(existed)
    }

    fn start_worker(&self) -> Result<(), StoreError> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| StoreError::Poisoned("flush worker".to_string()))?;
        if worker.is_some() {
            return Ok(());
        }

        let shutdown = Arc::new(Notify::new());
        let shared = self.shared.clone();
        let interval = self.flush_interval;
        let stop = shutdown.clone();

        let join = tokio::spawn(async move {
            tracing::info!(?interval, "account flush worker started");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; nothing is dirty yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticker.tick() => {
                        match shared.flush().await {
                            Ok(report) if report.written + report.deleted + report.failed > 0 => {
                                tracing::info!(
                                    written = report.written,
                                    deleted = report.deleted,
                                    failed = report.failed,
                                    "auto-saved account records"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!(error = %e, "auto-save sweep failed"),
                        }
                    }
                }
            }

            tracing::info!("account flush worker stopped");
        });

        *worker = Some(FlushWorker { shutdown, join });
        Ok(())
    }

    async fn stop_worker(&self) -> Result<(), StoreError> {
        let worker = self
            .worker
            .lock()
            .map_err(|_| StoreError::Poisoned("flush worker".to_string()))?
            .take();

        if let Some(worker) = worker {
            worker.shutdown.notify_one();
            if let Err(e) = worker.join.await {
                tracing::warn!(error = %e, "flush worker ended abnormally");
            }
        }
        Ok(())
    }
}

impl Drop for CachedFileStore {
    fn drop(&mut self) {
        let worker = self.worker.get_mut().ok().and_then(Option::take);
        if let Some(worker) = worker {
            tracing::warn!("account store dropped without close(); unflushed changes are lost");
            worker.shutdown.notify_one();
        }
    }
}

impl Shared {
    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, CacheState>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Poisoned("account cache".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, CacheState>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Poisoned("account cache".to_string()))
    }

    fn record_path(&self, id: AccountId) -> PathBuf {
        self.data_dir.join(format!("{}.{RECORD_EXTENSION}", id.to_key()))
    }

    #[instrument(skip(self), fields(data_dir = %self.data_dir.display()), err, level = "debug")]
    async fn flush(&self) -> Result<FlushReport, StoreError> {
        let _sweep = self.flush_lock.lock().await;

        // Snapshot under the lock, write without it.
        let pending: Vec<(AccountId, Option<Balance>)> = {
            let mut state = self.write()?;
            let dirty: Vec<AccountId> = state.dirty.drain().collect();
            dirty
                .into_iter()
                .map(|id| (id, state.accounts.get(&id).copied()))
                .collect()
        };

        let mut report = FlushReport::default();
        for (id, balance) in pending {
            let path = self.record_path(id);
            let result = match balance {
                Some(balance) => write_record(&path, AccountRecord { balance })
                    .await
                    .map(|_| report.written += 1),
                None => remove_record(&path).await.map(|_| report.deleted += 1),
            };

            if let Err(e) = result {
                tracing::error!(account = %id, error = %e, "failed to persist account record");
                report.failed += 1;
                self.write()?.dirty.insert(id);
            }
        }

        Ok(report)
    }

    async fn load_all(&self) -> Result<usize, StoreError> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| StoreError::io("create_data_dir", e))?;

        let mut loaded = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.data_dir)
            .await
            .map_err(|e| StoreError::io("read_data_dir", e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io("read_data_dir", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<AccountId>().ok())
            else {
                tracing::warn!(path = %path.display(), "skipping record with non-account file name");
                continue;
            };

            match read_record(&path).await {
                Ok(record) => {
                    loaded.insert(id, record.balance);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable account record");
                }
            }
        }

        let count = loaded.len();
        let mut state = self.write()?;
        state.accounts = loaded;
        state.dirty.clear();
        state.open = true;
        Ok(count)
    }
}

async fn read_record(path: &Path) -> Result<AccountRecord, StoreError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| StoreError::io("read_record", e))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

async fn write_record(path: &Path, record: AccountRecord) -> Result<(), StoreError> {
    let bytes =
        serde_json::to_vec_pretty(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let tmp = path.with_extension(TEMP_EXTENSION);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| StoreError::io("write_record", e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io("rename_record", e))
}

async fn remove_record(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io("remove_record", e)),
    }
}

#[async_trait]
impl AccountStore for CachedFileStore {
    fn backend_name(&self) -> &'static str {
        "cached-file"
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        if self.flush_interval.is_zero() {
            return Err(StoreError::InvalidConfig(
                "flush interval must be greater than zero".to_string(),
            ));
        }

        let count = self.shared.load_all().await?;
        tracing::info!(
            accounts = count,
            data_dir = %self.shared.data_dir.display(),
            "loaded account records"
        );
        self.start_worker()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.stop_worker().await?;
        let report = self.shared.flush().await?;
        self.shared.write()?.open = false;
        tracing::info!(
            written = report.written,
            deleted = report.deleted,
            failed = report.failed,
            "account store closed"
        );
        Ok(())
    }

    async fn get_balance(&self, id: AccountId) -> Result<Balance, StoreError> {
        let state = self.shared.read()?;
        state.ensure_open()?;
        Ok(state.accounts.get(&id).copied().unwrap_or(0))
    }

    async fn set_balance(&self, id: AccountId, balance: Balance) -> Result<(), StoreError> {
        let mut state = self.shared.write()?;
        state.ensure_open()?;
        state.put(id, balance);
        Ok(())
    }

    async fn has_account(&self, id: AccountId) -> Result<bool, StoreError> {
        let state = self.shared.read()?;
        state.ensure_open()?;
        Ok(state.accounts.contains_key(&id))
    }

    async fn create_account(
        &self,
        id: AccountId,
        starting_balance: Balance,
    ) -> Result<bool, StoreError> {
        let mut state = self.shared.write()?;
        state.ensure_open()?;
        if state.accounts.contains_key(&id) {
            return Ok(false);
        }
        state.put(id, starting_balance);
        Ok(true)
    }

    async fn add_balance(&self, id: AccountId, delta: Balance) -> Result<Balance, StoreError> {
        let mut state = self.shared.write()?;
        state.ensure_open()?;
        let current = state.accounts.get(&id).copied().unwrap_or(0);
        let next = checked_credit(current, delta)?;
        state.put(id, next);
        Ok(next)
    }

    async fn remove_balance(&self, id: AccountId, delta: Balance) -> Result<Balance, StoreError> {
        let mut state = self.shared.write()?;
        state.ensure_open()?;
        let current = state.accounts.get(&id).copied().unwrap_or(0);
        let next = clamped_debit(current, delta);
        state.put(id, next);
        Ok(next)
    }

    #[instrument(skip(self), fields(from = %from, to = %to), err, level = "debug")]
    async fn perform_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Balance,
        fee: Balance,
    ) -> Result<bool, StoreError> {
        let total = checked_total(amount, fee)?;

        // One critical section covers check, debit and credit.
        let mut state = self.shared.write()?;
        state.ensure_open()?;

        let from_balance = state.accounts.get(&from).copied().unwrap_or(0);
        if from_balance < total {
            return Ok(false);
        }

        let debited = from_balance - total;
        let to_balance = if from == to {
            debited
        } else {
            state.accounts.get(&to).copied().unwrap_or(0)
        };
        let credited = checked_credit(to_balance, amount)?;

        state.put(from, debited);
        state.put(to, credited);
        Ok(true)
    }

    async fn top_balances(&self, limit: u32, offset: u32) -> Result<Vec<BalanceEntry>, StoreError> {
        let mut entries: Vec<BalanceEntry> = {
            let state = self.shared.read()?;
            state.ensure_open()?;
            state
                .accounts
                .iter()
                .map(|(id, balance)| BalanceEntry::new(*id, *balance))
                .collect()
        };

        entries.sort_by(|a, b| b.balance.cmp(&a.balance).then(a.account.cmp(&b.account)));
        Ok(entries
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn account_count(&self) -> Result<u64, StoreError> {
        let state = self.shared.read()?;
        state.ensure_open()?;
        Ok(state.accounts.len() as u64)
    }
}
