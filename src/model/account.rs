use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A bank account as reported by the ledger application.
///
/// This is a read-only snapshot taken fresh on every run; the balance is the
/// balance at query time and is only used to synthesize a starting-balance
/// record for budget accounts with no history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    /// Opaque unique id assigned by the ledger application.
    pub id: String,

    /// Bank account number, when the institution provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,

    pub name: String,

    /// Current balance at query time.
    pub balance: Decimal,

    /// ISO currency code of the balance, e.g. `EUR`.
    pub currency: String,
}

/// An account as reported by the budget service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetAccount {
    /// Opaque id assigned by the budget service.
    pub id: String,

    pub name: String,

    /// Passthrough only; reconciliation never branches on this.
    #[serde(default)]
    pub kind: AccountType,
}

/// The budget service's account type tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Checking,
    Savings,
    Credit,
    Investment,
    Mortgage,
    Debt,
    #[default]
    Other,
}
