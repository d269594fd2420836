use crate::Result;
use anyhow::Context;
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// A transaction exported from the ledger application. Immutable snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Unique per source account, assigned by the ledger application.
    pub id: u64,

    /// Id of the [`crate::model::LedgerAccount`] this transaction belongs to.
    pub account_id: String,

    /// Signed amount in source currency units, e.g. `-12.34`.
    pub amount: Decimal,

    /// False while the transaction is still pending at the bank.
    pub booked: bool,

    pub value_date: NaiveDate,

    pub booking_date: NaiveDate,

    /// Payee as recorded by the bank.
    pub name: String,

    /// Free-text purpose line.
    #[serde(default)]
    pub purpose: String,

    /// Free-text user comment.
    #[serde(default)]
    pub comment: String,
}

/// A transaction in the budget service's shape, used for both the existing
/// records read back from the service and the records we write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetTransaction {
    /// Calendar date, no time component.
    pub date: NaiveDate,

    /// Integer minor units: source amount × 100, rounded half away from zero.
    pub amount: i64,

    /// The budget service's dedup key. Stable across runs for the same
    /// source record; see [`crate::reconcile`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imported_id: Option<String>,

    /// Payee before any normalization.
    pub imported_payee: String,

    /// Final payee. Equals `imported_payee` unless normalization ran.
    pub payee_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleared: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// What the budget service reported back for one import batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    #[serde(default)]
    pub errors: Vec<ImportRecordError>,
}

/// A per-record error from the budget service. Not fatal to the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRecordError {
    pub message: String,
}

/// Converts a decimal currency amount to integer minor units the way the
/// budget service expects: multiply by 100 and round to the nearest integer,
/// ties away from zero. Never truncates.
pub fn minor_units(amount: Decimal) -> Result<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .with_context(|| format!("amount {amount} does not fit in integer minor units"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_minor_units_exact() {
        assert_eq!(minor_units(dec("12.34")).unwrap(), 1234);
        assert_eq!(minor_units(dec("-12.34")).unwrap(), -1234);
        assert_eq!(minor_units(dec("0")).unwrap(), 0);
    }

    #[test]
    fn test_minor_units_rounds_to_nearest() {
        assert_eq!(minor_units(dec("12.344")).unwrap(), 1234);
        assert_eq!(minor_units(dec("12.346")).unwrap(), 1235);
    }

    #[test]
    fn test_minor_units_ties_away_from_zero() {
        assert_eq!(minor_units(dec("2.675")).unwrap(), 268);
        assert_eq!(minor_units(dec("-2.675")).unwrap(), -268);
        assert_eq!(minor_units(dec("-0.005")).unwrap(), -1);
    }

    #[test]
    fn test_minor_units_never_truncates() {
        assert_eq!(minor_units(dec("0.999")).unwrap(), 100);
    }

    #[test]
    fn test_budget_transaction_serde_omits_empty_options() {
        let tx = BudgetTransaction {
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            amount: -1234,
            imported_id: None,
            imported_payee: "ACME".to_string(),
            payee_name: "ACME".to_string(),
            cleared: None,
            notes: None,
        };
        let json = serde_json::to_string(&tx).unwrap();
        assert!(!json.contains("imported_id"));
        assert!(!json.contains("cleared"));
        assert!(!json.contains("notes"));
    }
}
