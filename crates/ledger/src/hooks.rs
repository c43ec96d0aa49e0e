//! Extension points around coordinator flows.
//!
//! Pre-hooks run before anything is touched and may veto the flow or rewrite its
//! amounts. The post-hook sees each committed change. All hooks run on the physical
//! wallet thread, in flow order.

use coinvault_core::{AccountId, Balance, TransferReason};
use coinvault_events::LedgerEvent;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HookVerdict {
    Allow,
    Veto,
}

/// A pending deposit or withdrawal. Hooks may change `amount`; the account is fixed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BalanceRequest {
    account: AccountId,
    pub amount: Balance,
}

impl BalanceRequest {
    pub(crate) fn new(account: AccountId, amount: Balance) -> Self {
        Self { account, amount }
    }

    pub fn account(&self) -> AccountId {
        self.account
    }
}

/// A pending payment. Hooks may change `amount` and `fee`; the parties and the reason
/// are fixed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    from: AccountId,
    to: AccountId,
    reason: TransferReason,
    pub amount: Balance,
    /// Burned on success. Starts at `0`.
    pub fee: Balance,
}

impl TransferRequest {
    pub(crate) fn new(
        from: AccountId,
        to: AccountId,
        amount: Balance,
        reason: TransferReason,
    ) -> Self {
        Self {
            from,
            to,
            reason,
            amount,
            fee: 0,
        }
    }

    pub fn from(&self) -> AccountId {
        self.from
    }

    pub fn to(&self) -> AccountId {
        self.to
    }

    pub fn reason(&self) -> TransferReason {
        self.reason
    }
}

pub trait EconomyHooks: Send + Sync + 'static {
    fn before_deposit(&self, _request: &mut BalanceRequest) -> HookVerdict {
        HookVerdict::Allow
    }

    fn before_withdraw(&self, _request: &mut BalanceRequest) -> HookVerdict {
        HookVerdict::Allow
    }

    fn before_transfer(&self, _request: &mut TransferRequest) -> HookVerdict {
        HookVerdict::Allow
    }

    /// Called once per published event. Cannot undo anything.
    fn after_change(&self, _event: &LedgerEvent) {}
}

/// Allows everything, observes nothing.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoHooks;

impl EconomyHooks for NoHooks {}
