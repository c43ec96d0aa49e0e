//! Balance values and the arithmetic every backend must agree on.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::AccountId;

/// A running account balance in the smallest currency unit.
pub type Balance = i64;

/// One row of a leaderboard query.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub account: AccountId,
    pub balance: Balance,
}

impl BalanceEntry {
    pub fn new(account: AccountId, balance: Balance) -> Self {
        Self { account, balance }
    }
}

/// Why a transfer was requested.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferReason {
    /// A player paying another player.
    PlayerPayment,
    AdminCommand,
    PluginReward,
    PluginPurchase,
    PluginGeneric,
    Other,
}

/// Why a balance changed, carried on change notifications.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    AdminSet,
    AdminAdd,
    AdminRemove,
    Deposit,
    Withdraw,
    TransferSend,
    TransferReceive,
    PluginApi,
    Other,
}

/// Total deduction for a transfer: `amount + fee`.
///
/// The fee is burned; only `amount` reaches the receiver.
pub fn checked_total(amount: Balance, fee: Balance) -> DomainResult<Balance> {
    amount
        .checked_add(fee)
        .ok_or_else(|| DomainError::overflow(format!("amount {amount} + fee {fee}")))
}

/// `current + delta`, refusing to wrap.
pub fn checked_credit(current: Balance, delta: Balance) -> DomainResult<Balance> {
    current
        .checked_add(delta)
        .ok_or_else(|| DomainError::overflow(format!("balance {current} + {delta}")))
}

/// `max(0, current - delta)`. Saturates instead of wrapping for extreme inputs.
pub fn clamped_debit(current: Balance, delta: Balance) -> Balance {
    current.saturating_sub(delta).max(0)
}

/// Reject negative amounts before they reach a store.
pub fn ensure_non_negative(what: &str, value: Balance) -> DomainResult<()> {
    if value < 0 {
        return Err(DomainError::validation(format!("{what} must not be negative, got {value}")));
    }
    Ok(())
}

/// Reject zero or negative amounts.
pub fn ensure_positive(what: &str, value: Balance) -> DomainResult<()> {
    if value <= 0 {
        return Err(DomainError::validation(format!("{what} must be positive, got {value}")));
    }
    Ok(())
}
