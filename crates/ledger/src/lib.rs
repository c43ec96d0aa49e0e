//! `coinvault-ledger`: the balance engine and the flows built on it.
//!
//! - [`Ledger`]: lock-serialized balance operations over an `AccountStore`
//! - [`AccountLockRegistry`]: per-account async locks with canonical pair ordering
//! - [`TransferCoordinator`]: deposit / withdraw / pay against a [`PhysicalWallet`]

pub mod coordinator;
pub mod hooks;
pub mod ledger;
pub mod locks;
pub mod physical;

pub use coordinator::{
    BalanceOutcome, CoordinatorError, DepositOutcome, PayOutcome, RejectReason,
    TransferCoordinator, WithdrawOutcome,
};
pub use hooks::{BalanceRequest, EconomyHooks, HookVerdict, NoHooks, TransferRequest};
pub use ledger::{Ledger, LedgerConfig, LedgerError, TransferReceipt};
pub use locks::{AccountGuard, AccountLockRegistry, PairGuard};
pub use physical::{PhysicalExecutor, PhysicalWallet};
