//! The physical side of deposits and withdrawals.
//!
//! A `PhysicalWallet` (item inventory, cash drawer, anything that must be touched from
//! one thread only) is owned by a dedicated OS thread. Async callers hand it closures
//! through [`PhysicalExecutor::run`] and await the reply; the wallet never runs on a
//! tokio worker.

use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, mpsc};
use std::thread;

use tokio::sync::oneshot;

use coinvault_core::{AccountId, Balance};

use crate::coordinator::CoordinatorError;

/// Single-threaded holdings keyed by account.
///
/// Implementations may assume every call happens on the same thread.
pub trait PhysicalWallet: Send + 'static {
    /// Whether the account can be acted on right now (e.g. its owner is present).
    fn is_online(&self, account: AccountId) -> bool;

    /// Units currently held.
    fn balance(&self, account: AccountId) -> Balance;

    /// Take `amount` units. Returns `false`, changing nothing, if fewer are held.
    fn remove(&mut self, account: AccountId, amount: Balance) -> bool;

    /// Whether `amount` more units would fit.
    fn has_room(&self, account: AccountId, amount: Balance) -> bool;

    /// Give `amount` units. Returns `false`, changing nothing, if they do not fit.
    fn add(&mut self, account: AccountId, amount: Balance) -> bool;
}

type Job = Box<dyn FnOnce(&mut dyn PhysicalWallet) + Send>;

/// Handle to the thread that owns the wallet.
///
/// Dropping the handle closes the queue and joins the thread after queued jobs finish.
pub struct PhysicalExecutor {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for PhysicalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalExecutor")
            .field("running", &self.is_running())
            .finish()
    }
}

impl PhysicalExecutor {
    pub const THREAD_NAME: &'static str = "physical-wallet";

    /// Move `wallet` onto a new thread.
    pub fn spawn<W: PhysicalWallet>(wallet: W) -> Result<Self, CoordinatorError> {
        let (sender, receiver) = mpsc::channel::<Job>();

        let join = thread::Builder::new()
            .name(Self::THREAD_NAME.to_string())
            .spawn(move || physical_loop(wallet, receiver))
            .map_err(|e| CoordinatorError::Spawn(e.to_string()))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            join: Mutex::new(Some(join)),
        })
    }

    /// Run `f` against the wallet on its thread and await the result.
    pub async fn run<T, F>(&self, f: F) -> Result<T, CoordinatorError>
    where
        F: FnOnce(&mut dyn PhysicalWallet) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job: Job = Box::new(move |wallet| {
            let _ = reply.send(f(wallet));
        });

        {
            let sender = self
                .sender
                .lock()
                .map_err(|_| CoordinatorError::PhysicalUnavailable)?;
            sender
                .as_ref()
                .ok_or(CoordinatorError::PhysicalUnavailable)?
                .send(job)
                .map_err(|_| CoordinatorError::PhysicalUnavailable)?;
        }

        response
            .await
            .map_err(|_| CoordinatorError::PhysicalUnavailable)
    }

    pub fn is_running(&self) -> bool {
        self.join
            .lock()
            .map(|join| join.as_ref().is_some_and(|j| !j.is_finished()))
            .unwrap_or(false)
    }

    /// Stop accepting work and wait for the thread to drain its queue.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let join = self.join.lock().ok().and_then(|mut j| j.take());
        if let Some(join) = join {
            if join.join().is_err() {
                tracing::error!("physical wallet thread panicked");
            }
        }
    }
}

impl Drop for PhysicalExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn physical_loop<W: PhysicalWallet>(mut wallet: W, receiver: mpsc::Receiver<Job>) {
    tracing::info!("physical wallet thread started");

    while let Ok(job) = receiver.recv() {
        // A panicking job drops its reply sender; the caller sees PhysicalUnavailable.
        if std::panic::catch_unwind(AssertUnwindSafe(|| job(&mut wallet))).is_err() {
            tracing::error!("physical wallet job panicked");
        }
    }

    tracing::info!("physical wallet thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Counter {
        held: HashMap<AccountId, Balance>,
    }

    impl PhysicalWallet for Counter {
        fn is_online(&self, _account: AccountId) -> bool {
            true
        }

        fn balance(&self, account: AccountId) -> Balance {
            self.held.get(&account).copied().unwrap_or(0)
        }

        fn remove(&mut self, account: AccountId, amount: Balance) -> bool {
            let held = self.held.entry(account).or_default();
            if *held < amount {
                return false;
            }
            *held -= amount;
            true
        }

        fn has_room(&self, _account: AccountId, _amount: Balance) -> bool {
            true
        }

        fn add(&mut self, account: AccountId, amount: Balance) -> bool {
            *self.held.entry(account).or_default() += amount;
            true
        }
    }

    #[tokio::test]
    async fn jobs_run_on_the_owning_thread() {
        let executor = PhysicalExecutor::spawn(Counter::default()).unwrap();

        let name = executor
            .run(|_| thread::current().name().map(str::to_string))
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some(PhysicalExecutor::THREAD_NAME));
    }

    #[tokio::test]
    async fn state_persists_between_jobs() {
        let executor = PhysicalExecutor::spawn(Counter::default()).unwrap();
        let id = AccountId::new();

        assert!(executor.run(move |w| w.add(id, 5)).await.unwrap());
        assert!(!executor.run(move |w| w.remove(id, 6)).await.unwrap());
        assert_eq!(executor.run(move |w| w.balance(id)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_the_thread() {
        let executor = PhysicalExecutor::spawn(Counter::default()).unwrap();

        let failed = executor.run(|_| -> i32 { panic!("boom") }).await;
        assert!(matches!(failed, Err(CoordinatorError::PhysicalUnavailable)));
        assert_eq!(executor.run(|_| 7).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn run_after_shutdown_is_unavailable() {
        let executor = PhysicalExecutor::spawn(Counter::default()).unwrap();
        executor.shutdown();

        assert!(!executor.is_running());
        assert!(matches!(
            executor.run(|_| ()).await,
            Err(CoordinatorError::PhysicalUnavailable)
        ));
    }
}
