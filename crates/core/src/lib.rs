//! `coinvault-core`: ledger building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! account identity, balance rows, and the reason tags carried through mutations.

pub mod balance;
pub mod error;
pub mod id;

pub use balance::{
    Balance, BalanceEntry, ChangeReason, TransferReason, checked_credit, checked_total,
    clamped_debit, ensure_non_negative, ensure_positive,
};
pub use error::{DomainError, DomainResult};
pub use id::AccountId;
