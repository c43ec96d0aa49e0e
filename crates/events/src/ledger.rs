//! Notifications published after a ledger change has committed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coinvault_core::{AccountId, Balance, ChangeReason, TransferReason};

use crate::event::Event;

/// Post-commit ledger notification.
///
/// These describe facts: by the time a subscriber sees one, the store already holds
/// the new balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    BalanceChanged {
        account: AccountId,
        reason: ChangeReason,
        old_balance: Balance,
        new_balance: Balance,
        occurred_at: DateTime<Utc>,
    },
    TransferCompleted {
        from: AccountId,
        to: AccountId,
        reason: TransferReason,
        amount: Balance,
        /// Burned; not credited anywhere.
        fee: Balance,
        occurred_at: DateTime<Utc>,
    },
}

impl LedgerEvent {
    pub fn balance_changed(
        account: AccountId,
        reason: ChangeReason,
        old_balance: Balance,
        new_balance: Balance,
    ) -> Self {
        Self::BalanceChanged {
            account,
            reason,
            old_balance,
            new_balance,
            occurred_at: Utc::now(),
        }
    }

    pub fn transfer_completed(
        from: AccountId,
        to: AccountId,
        reason: TransferReason,
        amount: Balance,
        fee: Balance,
    ) -> Self {
        Self::TransferCompleted {
            from,
            to,
            reason,
            amount,
            fee,
            occurred_at: Utc::now(),
        }
    }

    /// Accounts whose balance this event describes.
    pub fn accounts(&self) -> Vec<AccountId> {
        match self {
            Self::BalanceChanged { account, .. } => vec![*account],
            Self::TransferCompleted { from, to, .. } => vec![*from, *to],
        }
    }
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::BalanceChanged { .. } => "ledger.balance.changed",
            Self::TransferCompleted { .. } => "ledger.transfer.completed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::BalanceChanged { occurred_at, .. } | Self::TransferCompleted { occurred_at, .. } => {
                *occurred_at
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let account = AccountId::new();
        let event = LedgerEvent::balance_changed(account, ChangeReason::Deposit, 10, 25);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "balance_changed");
        assert_eq!(json["reason"], "deposit");
        assert_eq!(json["new_balance"], 25);
    }

    #[test]
    fn transfer_names_both_accounts() {
        let (a, b) = (AccountId::new(), AccountId::new());
        let event = LedgerEvent::transfer_completed(a, b, TransferReason::PlayerPayment, 300, 10);
        assert_eq!(event.accounts(), vec![a, b]);
        assert_eq!(event.event_type(), "ledger.transfer.completed");
    }
}
