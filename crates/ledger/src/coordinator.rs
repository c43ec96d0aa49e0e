//! Deposits, withdrawals and payments that pair a ledger mutation with a physical one.
//!
//! Each flow walks the same stages:
//!
//! ```text
//! Validate → PreEvent (hooks) → PhysicalMutate → LedgerMutate → PostEvent
//! ```
//!
//! with one deliberate asymmetry in the middle stages:
//!
//! - **deposit**: physical units are removed *before* the ledger is credited
//! - **withdraw**: the ledger is debited *before* physical units are granted
//!
//! A crash between the two stages is not compensated. If the grant of a withdrawal is
//! refused after the debit, the flow fails with [`CoordinatorError::GrantFailed`] and
//! the debit stands.

use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use coinvault_core::{AccountId, Balance, ChangeReason, TransferReason};
use coinvault_events::{Event, EventBus, LedgerEvent};

use crate::hooks::{BalanceRequest, EconomyHooks, HookVerdict, TransferRequest};
use crate::ledger::{Ledger, LedgerError, TransferReceipt};
use crate::physical::PhysicalExecutor;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The physical thread is gone or dropped the request.
    #[error("physical wallet unavailable")]
    PhysicalUnavailable,

    /// Withdrawal debited the ledger but the wallet refused the units.
    #[error("debited {amount} from {account} but the wallet refused the grant")]
    GrantFailed { account: AccountId, amount: Balance },

    #[error("failed to start physical wallet thread: {0}")]
    Spawn(String),
}

/// Why a flow stopped before changing anything.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RejectReason {
    InvalidAmount,
    SelfTransfer,
    Offline,
    Vetoed,
    /// The ledger balance does not cover the amount.
    InsufficientFunds,
    /// The wallet holds fewer units than the deposit.
    WalletInsufficient,
    /// The wallet cannot fit the withdrawal.
    WalletFull,
}

/// Result of a deposit or withdrawal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BalanceOutcome {
    /// `amount` is the value actually applied, after hooks.
    Completed {
        amount: Balance,
        old_balance: Balance,
        new_balance: Balance,
    },
    Rejected(RejectReason),
}

pub type DepositOutcome = BalanceOutcome;
pub type WithdrawOutcome = BalanceOutcome;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayOutcome {
    Completed {
        amount: Balance,
        fee: Balance,
        receipt: TransferReceipt,
    },
    Rejected(RejectReason),
}

impl BalanceOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

impl PayOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Runs deposit / withdraw / pay flows.
pub struct TransferCoordinator<B> {
    ledger: Ledger,
    physical: Arc<PhysicalExecutor>,
    hooks: Arc<dyn EconomyHooks>,
    bus: B,
}

impl<B> TransferCoordinator<B>
where
    B: EventBus<LedgerEvent>,
{
    pub fn new(
        ledger: Ledger,
        physical: Arc<PhysicalExecutor>,
        hooks: Arc<dyn EconomyHooks>,
        bus: B,
    ) -> Self {
        Self {
            ledger,
            physical,
            hooks,
            bus,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Units the wallet currently holds for `account`.
    pub async fn wallet_balance(&self, account: AccountId) -> Result<Balance, CoordinatorError> {
        self.physical.run(move |w| w.balance(account)).await
    }

    /// Move `amount` units out of the wallet and credit them to the ledger.
    #[instrument(skip(self), fields(account = %account), err)]
    pub async fn deposit(
        &self,
        account: AccountId,
        amount: Balance,
    ) -> Result<DepositOutcome, CoordinatorError> {
        if amount <= 0 {
            return Ok(BalanceOutcome::Rejected(RejectReason::InvalidAmount));
        }
        if !self.physical.run(move |w| w.is_online(account)).await? {
            return Ok(BalanceOutcome::Rejected(RejectReason::Offline));
        }

        let hooks = self.hooks.clone();
        let request = BalanceRequest::new(account, amount);
        let Some(request) = self
            .pre_hook(move |mut r: BalanceRequest| (hooks.before_deposit(&mut r), r), request)
            .await?
        else {
            return Ok(BalanceOutcome::Rejected(RejectReason::Vetoed));
        };
        let amount = request.amount;
        if amount <= 0 {
            return Ok(BalanceOutcome::Rejected(RejectReason::InvalidAmount));
        }

        let removed = self
            .physical
            .run(move |w| w.balance(account) >= amount && w.remove(account, amount))
            .await?;
        if !removed {
            return Ok(BalanceOutcome::Rejected(RejectReason::WalletInsufficient));
        }

        let new_balance = match self.ledger.add_balance(account, amount).await {
            Ok(balance) => balance,
            Err(e) => {
                // Units are already out of the wallet; put them back before failing.
                let refunded = self.physical.run(move |w| w.add(account, amount)).await;
                if !matches!(refunded, Ok(true)) {
                    tracing::error!(amount, "deposit credit failed and wallet refund was refused");
                }
                return Err(e.into());
            }
        };
        let old_balance = new_balance - amount;

        self.post(vec![LedgerEvent::balance_changed(
            account,
            ChangeReason::Deposit,
            old_balance,
            new_balance,
        )])
        .await;

        Ok(BalanceOutcome::Completed {
            amount,
            old_balance,
            new_balance,
        })
    }

    /// Debit the ledger and grant `amount` units into the wallet.
    #[instrument(skip(self), fields(account = %account), err)]
    pub async fn withdraw(
        &self,
        account: AccountId,
        amount: Balance,
    ) -> Result<WithdrawOutcome, CoordinatorError> {
        if amount <= 0 {
            return Ok(BalanceOutcome::Rejected(RejectReason::InvalidAmount));
        }
        if !self.physical.run(move |w| w.is_online(account)).await? {
            return Ok(BalanceOutcome::Rejected(RejectReason::Offline));
        }

        let hooks = self.hooks.clone();
        let request = BalanceRequest::new(account, amount);
        let Some(request) = self
            .pre_hook(move |mut r: BalanceRequest| (hooks.before_withdraw(&mut r), r), request)
            .await?
        else {
            return Ok(BalanceOutcome::Rejected(RejectReason::Vetoed));
        };
        let amount = request.amount;
        if amount <= 0 {
            return Ok(BalanceOutcome::Rejected(RejectReason::InvalidAmount));
        }

        if !self.physical.run(move |w| w.has_room(account, amount)).await? {
            return Ok(BalanceOutcome::Rejected(RejectReason::WalletFull));
        }

        let Some(new_balance) = self.ledger.try_remove_balance(account, amount).await? else {
            return Ok(BalanceOutcome::Rejected(RejectReason::InsufficientFunds));
        };
        let old_balance = new_balance + amount;

        let granted = self.physical.run(move |w| w.add(account, amount)).await;
        if !matches!(granted, Ok(true)) {
            tracing::error!(
                amount,
                old_balance,
                new_balance,
                "withdrawal debited but wallet grant failed"
            );
            return Err(CoordinatorError::GrantFailed { account, amount });
        }

        self.post(vec![LedgerEvent::balance_changed(
            account,
            ChangeReason::Withdraw,
            old_balance,
            new_balance,
        )])
        .await;

        Ok(BalanceOutcome::Completed {
            amount,
            old_balance,
            new_balance,
        })
    }

    /// Ledger-only payment between two accounts. Hooks may set a fee, which is burned.
    #[instrument(skip(self), fields(from = %from, to = %to), err)]
    pub async fn pay(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Balance,
        reason: TransferReason,
    ) -> Result<PayOutcome, CoordinatorError> {
        if amount <= 0 {
            return Ok(PayOutcome::Rejected(RejectReason::InvalidAmount));
        }
        if from == to {
            return Ok(PayOutcome::Rejected(RejectReason::SelfTransfer));
        }

        let hooks = self.hooks.clone();
        let request = TransferRequest::new(from, to, amount, reason);
        let Some(request) = self
            .pre_hook(move |mut r: TransferRequest| (hooks.before_transfer(&mut r), r), request)
            .await?
        else {
            return Ok(PayOutcome::Rejected(RejectReason::Vetoed));
        };

        let receipt = match self
            .ledger
            .transfer_with_receipt(from, to, request.amount, request.fee)
            .await
        {
            Ok(Some(receipt)) => receipt,
            Ok(None) => return Ok(PayOutcome::Rejected(RejectReason::InsufficientFunds)),
            Err(LedgerError::InvalidAmount(_)) => {
                return Ok(PayOutcome::Rejected(RejectReason::InvalidAmount));
            }
            Err(e) => return Err(e.into()),
        };

        self.post(vec![
            LedgerEvent::transfer_completed(from, to, reason, request.amount, request.fee),
            LedgerEvent::balance_changed(
                from,
                ChangeReason::TransferSend,
                receipt.from_old,
                receipt.from_new,
            ),
            LedgerEvent::balance_changed(
                to,
                ChangeReason::TransferReceive,
                receipt.to_old,
                receipt.to_new,
            ),
        ])
        .await;

        Ok(PayOutcome::Completed {
            amount: request.amount,
            fee: request.fee,
            receipt,
        })
    }

    /// Run a pre-hook on the physical thread. `None` means vetoed.
    async fn pre_hook<R, F>(&self, hook: F, request: R) -> Result<Option<R>, CoordinatorError>
    where
        R: Send + 'static,
        F: FnOnce(R) -> (HookVerdict, R) + Send + 'static,
    {
        let (verdict, request) = self.physical.run(move |_| hook(request)).await?;
        Ok(match verdict {
            HookVerdict::Allow => Some(request),
            HookVerdict::Veto => {
                tracing::debug!("flow vetoed by hook");
                None
            }
        })
    }

    /// Publish and run post-hooks. The change is already committed; failures only log.
    async fn post(&self, events: Vec<LedgerEvent>) {
        for event in &events {
            if let Err(e) = self.bus.publish(event.clone()) {
                tracing::warn!(
                    event_type = event.event_type(),
                    error = ?e,
                    "failed to publish ledger event"
                );
            }
        }

        let hooks = self.hooks.clone();
        let notified = self
            .physical
            .run(move |_| {
                for event in &events {
                    hooks.after_change(event);
                }
            })
            .await;
        if let Err(e) = notified {
            tracing::warn!(error = %e, "post-change hooks did not run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoHooks;
    use crate::ledger::LedgerConfig;
    use crate::physical::PhysicalWallet;
    use coinvault_events::InMemoryEventBus;
    use coinvault_infra::{AccountStore, CachedFileStore};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Wallet with a per-account capacity and an explicit online set.
    struct TestWallet {
        held: HashMap<AccountId, Balance>,
        online: HashSet<AccountId>,
        capacity: Balance,
    }

    impl TestWallet {
        fn new(capacity: Balance) -> Self {
            Self {
                held: HashMap::new(),
                online: HashSet::new(),
                capacity,
            }
        }

        fn with_online(mut self, account: AccountId, held: Balance) -> Self {
            self.online.insert(account);
            self.held.insert(account, held);
            self
        }
    }

    impl PhysicalWallet for TestWallet {
        fn is_online(&self, account: AccountId) -> bool {
            self.online.contains(&account)
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

        fn has_room(&self, account: AccountId, amount: Balance) -> bool {
            self.balance(account) + amount <= self.capacity
        }

        fn add(&mut self, account: AccountId, amount: Balance) -> bool {
            if !self.has_room(account, amount) {
                return false;
            }
            *self.held.entry(account).or_default() += amount;
            true
        }
    }

    struct VetoAll;

    impl EconomyHooks for VetoAll {
        fn before_deposit(&self, _request: &mut BalanceRequest) -> HookVerdict {
            HookVerdict::Veto
        }

        fn before_transfer(&self, _request: &mut TransferRequest) -> HookVerdict {
            HookVerdict::Veto
        }
    }

    /// Halves deposits, charges a flat fee on payments, and records what it sees.
    #[derive(Default)]
    struct Adjusting {
        seen: Mutex<Vec<(LedgerEvent, Option<String>)>>,
    }

    impl EconomyHooks for Adjusting {
        fn before_deposit(&self, request: &mut BalanceRequest) -> HookVerdict {
            request.amount /= 2;
            HookVerdict::Allow
        }

        fn before_transfer(&self, request: &mut TransferRequest) -> HookVerdict {
            request.fee = 10;
            HookVerdict::Allow
        }

        fn after_change(&self, event: &LedgerEvent) {
            let thread = std::thread::current().name().map(str::to_string);
            self.seen.lock().unwrap().push((event.clone(), thread));
        }
    }

    /// Records the parties each pre-hook is shown.
    #[derive(Default)]
    struct Observing {
        transfers: Mutex<Vec<(AccountId, AccountId, TransferReason)>>,
        deposits: Mutex<Vec<AccountId>>,
    }

    impl EconomyHooks for Observing {
        fn before_deposit(&self, request: &mut BalanceRequest) -> HookVerdict {
            self.deposits.lock().unwrap().push(request.account());
            HookVerdict::Allow
        }

        fn before_transfer(&self, request: &mut TransferRequest) -> HookVerdict {
            self.transfers
                .lock()
                .unwrap()
                .push((request.from(), request.to(), request.reason()));
            request.amount += 1;
            HookVerdict::Allow
        }
    }

    struct Fixture {
        coordinator: TransferCoordinator<Arc<InMemoryEventBus<LedgerEvent>>>,
        bus: Arc<InMemoryEventBus<LedgerEvent>>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(wallet: TestWallet, hooks: Arc<dyn EconomyHooks>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CachedFileStore::new(dir.path(), Duration::from_secs(300)));
        store.initialize().await.unwrap();
        let ledger = Ledger::with_store(store, LedgerConfig::default());
        let physical = Arc::new(PhysicalExecutor::spawn(wallet).unwrap());
        let bus = Arc::new(InMemoryEventBus::new());

        Fixture {
            coordinator: TransferCoordinator::new(ledger, physical, hooks, bus.clone()),
            bus,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn deposit_moves_units_into_ledger() {
        let id = AccountId::new();
        let f = fixture(TestWallet::new(64).with_online(id, 40), Arc::new(NoHooks)).await;
        let events = f.bus.subscribe();

        let outcome = f.coordinator.deposit(id, 25).await.unwrap();
        assert_eq!(
            outcome,
            BalanceOutcome::Completed {
                amount: 25,
                old_balance: 0,
                new_balance: 25,
            }
        );
        assert_eq!(f.coordinator.wallet_balance(id).await.unwrap(), 15);
        assert_eq!(f.coordinator.ledger().balance(id).await.unwrap(), 25);

        let published = events.drain();
        assert!(matches!(
            published.as_slice(),
            [LedgerEvent::BalanceChanged {
                reason: ChangeReason::Deposit,
                new_balance: 25,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn vetoed_deposit_touches_nothing() {
        let id = AccountId::new();
        let f = fixture(TestWallet::new(64).with_online(id, 40), Arc::new(VetoAll)).await;

        let outcome = f.coordinator.deposit(id, 25).await.unwrap();
        assert_eq!(outcome, BalanceOutcome::Rejected(RejectReason::Vetoed));
        assert_eq!(f.coordinator.wallet_balance(id).await.unwrap(), 40);
        assert!(!f.coordinator.ledger().has_account(id).await.unwrap());
    }

    #[tokio::test]
    async fn deposit_with_too_few_units_leaves_ledger_alone() {
        let id = AccountId::new();
        let f = fixture(TestWallet::new(64).with_online(id, 3), Arc::new(NoHooks)).await;

        let outcome = f.coordinator.deposit(id, 4).await.unwrap();
        assert_eq!(outcome, BalanceOutcome::Rejected(RejectReason::WalletInsufficient));
        assert_eq!(f.coordinator.wallet_balance(id).await.unwrap(), 3);
        assert_eq!(f.coordinator.ledger().balance(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn offline_account_is_rejected() {
        let id = AccountId::new();
        let f = fixture(TestWallet::new(64), Arc::new(NoHooks)).await;

        assert_eq!(
            f.coordinator.deposit(id, 1).await.unwrap(),
            BalanceOutcome::Rejected(RejectReason::Offline)
        );
        assert_eq!(
            f.coordinator.withdraw(id, 1).await.unwrap(),
            BalanceOutcome::Rejected(RejectReason::Offline)
        );
    }

    #[tokio::test]
    async fn hook_adjusted_deposit_applies_new_amount() {
        let id = AccountId::new();
        let hooks = Arc::new(Adjusting::default());
        let f = fixture(TestWallet::new(64).with_online(id, 40), hooks.clone()).await;

        let outcome = f.coordinator.deposit(id, 20).await.unwrap();
        assert_eq!(
            outcome,
            BalanceOutcome::Completed {
                amount: 10,
                old_balance: 0,
                new_balance: 10,
            }
        );
        assert_eq!(f.coordinator.wallet_balance(id).await.unwrap(), 30);

        let seen = hooks.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1.as_deref(), Some(PhysicalExecutor::THREAD_NAME));
    }

    #[tokio::test]
    async fn withdraw_debits_then_grants() {
        let id = AccountId::new();
        let f = fixture(TestWallet::new(64).with_online(id, 0), Arc::new(NoHooks)).await;
        f.coordinator.ledger().set_balance(id, 50).await.unwrap();

        let outcome = f.coordinator.withdraw(id, 30).await.unwrap();
        assert_eq!(
            outcome,
            BalanceOutcome::Completed {
                amount: 30,
                old_balance: 50,
                new_balance: 20,
            }
        );
        assert_eq!(f.coordinator.wallet_balance(id).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn withdraw_into_full_wallet_leaves_ledger_alone() {
        let id = AccountId::new();
        let f = fixture(TestWallet::new(64).with_online(id, 60), Arc::new(NoHooks)).await;
        f.coordinator.ledger().set_balance(id, 50).await.unwrap();

        let outcome = f.coordinator.withdraw(id, 10).await.unwrap();
        assert_eq!(outcome, BalanceOutcome::Rejected(RejectReason::WalletFull));
        assert_eq!(f.coordinator.ledger().balance(id).await.unwrap(), 50);
        assert_eq!(f.coordinator.wallet_balance(id).await.unwrap(), 60);
    }

    #[tokio::test]
    async fn withdraw_beyond_balance_is_insufficient() {
        let id = AccountId::new();
        let f = fixture(TestWallet::new(64).with_online(id, 0), Arc::new(NoHooks)).await;
        f.coordinator.ledger().set_balance(id, 5).await.unwrap();

        let outcome = f.coordinator.withdraw(id, 6).await.unwrap();
        assert_eq!(outcome, BalanceOutcome::Rejected(RejectReason::InsufficientFunds));
        assert_eq!(f.coordinator.ledger().balance(id).await.unwrap(), 5);
        assert_eq!(f.coordinator.wallet_balance(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pay_charges_hook_fee_and_publishes_both_sides() {
        let (a, b) = (AccountId::new(), AccountId::new());
        let f = fixture(TestWallet::new(64), Arc::new(Adjusting::default())).await;
        let events = f.bus.subscribe();
        f.coordinator.ledger().set_balance(a, 1000).await.unwrap();

        let outcome = f
            .coordinator
            .pay(a, b, 300, TransferReason::PlayerPayment)
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(f.coordinator.ledger().balance(a).await.unwrap(), 690);
        assert_eq!(f.coordinator.ledger().balance(b).await.unwrap(), 300);

        let published = events.drain();
        assert_eq!(published.len(), 3);
        assert!(matches!(
            published[0],
            LedgerEvent::TransferCompleted {
                amount: 300,
                fee: 10,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn vetoed_or_invalid_payments_are_rejected() {
        let (a, b) = (AccountId::new(), AccountId::new());
        let f = fixture(TestWallet::new(64), Arc::new(VetoAll)).await;
        f.coordinator.ledger().set_balance(a, 100).await.unwrap();

        let reason = TransferReason::Other;
        assert_eq!(
            f.coordinator.pay(a, b, 10, reason).await.unwrap(),
            PayOutcome::Rejected(RejectReason::Vetoed)
        );
        assert_eq!(
            f.coordinator.pay(a, a, 10, reason).await.unwrap(),
            PayOutcome::Rejected(RejectReason::SelfTransfer)
        );
        assert_eq!(
            f.coordinator.pay(a, b, 0, reason).await.unwrap(),
            PayOutcome::Rejected(RejectReason::InvalidAmount)
        );
        assert_eq!(f.coordinator.ledger().balance(a).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn insufficient_payment_is_rejected() {
        let (a, b) = (AccountId::new(), AccountId::new());
        let f = fixture(TestWallet::new(64), Arc::new(NoHooks)).await;
        f.coordinator.ledger().set_balance(a, 10).await.unwrap();

        let outcome = f
            .coordinator
            .pay(a, b, 11, TransferReason::PluginPurchase)
            .await
            .unwrap();
        assert_eq!(outcome, PayOutcome::Rejected(RejectReason::InsufficientFunds));
    }

    #[tokio::test]
    async fn hooks_see_fixed_parties_and_adjust_only_amounts() {
        let (a, b) = (AccountId::new(), AccountId::new());
        let hooks = Arc::new(Observing::default());
        let f = fixture(TestWallet::new(64).with_online(a, 5), hooks.clone()).await;
        f.coordinator.ledger().set_balance(a, 100).await.unwrap();

        let outcome = f
            .coordinator
            .pay(a, b, 40, TransferReason::PlayerPayment)
            .await
            .unwrap();
        assert!(matches!(outcome, PayOutcome::Completed { amount: 41, fee: 0, .. }));
        assert_eq!(f.coordinator.ledger().balance(a).await.unwrap(), 59);
        assert_eq!(f.coordinator.ledger().balance(b).await.unwrap(), 41);
        assert_eq!(
            hooks.transfers.lock().unwrap().as_slice(),
            &[(a, b, TransferReason::PlayerPayment)]
        );

        f.coordinator.deposit(a, 5).await.unwrap();
        assert_eq!(hooks.deposits.lock().unwrap().as_slice(), &[a]);
    }
}
