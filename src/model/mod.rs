//! Domain types shared between the ledger side and the budget side.

mod account;
mod transaction;

pub use account::{AccountType, BudgetAccount, LedgerAccount};
pub use transaction::{
    minor_units, BudgetTransaction, ImportOutcome, ImportRecordError, LedgerTransaction,
};
