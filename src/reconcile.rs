//! Turns ledger transactions into the batch of budget records an import
//! should send: filter, convert, synthesize a starting balance, and drop
//! everything the destination already has.

use crate::config::BudgetConfig;
use crate::model::{minor_units, BudgetTransaction, LedgerAccount, LedgerTransaction};
use crate::Result;
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Note attached to the synthesized starting-balance record.
const STARTING_BALANCE_NOTE: &str = "Starting balance";

/// Per-budget switches that shape the reconciliation, borrowed from the
/// budget's configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions<'a> {
    /// Include pending transactions instead of booked ones only.
    pub import_unchecked: bool,
    /// Mirror the booked flag into the destination's cleared flag.
    pub synchronize_cleared: bool,
    pub ignored_comment_patterns: &'a [String],
    pub ignored_payee_patterns: &'a [String],
    pub ignored_purpose_patterns: &'a [String],
}

impl<'a> From<&'a BudgetConfig> for ReconcileOptions<'a> {
    fn from(budget: &'a BudgetConfig) -> Self {
        Self {
            import_unchecked: budget.import_unchecked,
            synchronize_cleared: budget.synchronize_cleared,
            ignored_comment_patterns: &budget.ignored_comment_patterns,
            ignored_payee_patterns: &budget.ignored_payee_patterns,
            ignored_purpose_patterns: &budget.ignored_purpose_patterns,
        }
    }
}

/// Computes the records to import for one account pair.
///
/// `records` is the ledger's window for this account, `existing` what the
/// destination already holds in the same window. When the destination has no
/// history at all, the result starts with a synthesized starting-balance
/// record dated like the oldest surviving transaction, so that the
/// destination's running balance lines up with the ledger's current balance;
/// an account with any history keeps its own baseline. Records whose import
/// id is already present in `existing` are dropped; the budget service
/// treats resends as updates, and an unchanged resend would still count as
/// one.
pub fn plan(
    source: &LedgerAccount,
    records: &[LedgerTransaction],
    existing: &[BudgetTransaction],
    opts: &ReconcileOptions<'_>,
) -> Result<Vec<BudgetTransaction>> {
    let surviving: Vec<&LedgerTransaction> = records
        .iter()
        .filter(|t| t.booked || opts.import_unchecked)
        .filter(|t| !is_ignored(t, opts))
        .collect();

    if surviving.is_empty() && existing.is_empty() {
        warn!(
            "account '{}' has no transactions in the window on either side, \
             nothing to import",
            source.name
        );
        return Ok(Vec::new());
    }

    let mut candidates = Vec::with_capacity(surviving.len() + 1);
    if existing.is_empty() {
        candidates.push(starting_balance(source, &surviving)?);
    }
    for transaction in &surviving {
        candidates.push(to_budget_transaction(transaction, opts)?);
    }

    let known: HashSet<&str> = existing
        .iter()
        .filter_map(|t| t.imported_id.as_deref())
        .collect();
    candidates.retain(|c| {
        c.imported_id
            .as_deref()
            .map(|id| !known.contains(id))
            .unwrap_or(true)
    });

    if candidates.is_empty() {
        debug!(
            "account '{}': every candidate is already present in the destination",
            source.name
        );
    }
    Ok(candidates)
}

/// Substring match of any configured pattern against the transaction's
/// comment, payee name, or purpose.
fn is_ignored(transaction: &LedgerTransaction, opts: &ReconcileOptions<'_>) -> bool {
    let hit = |patterns: &[String], text: &str| patterns.iter().any(|p| text.contains(p.as_str()));
    hit(opts.ignored_comment_patterns, &transaction.comment)
        || hit(opts.ignored_payee_patterns, &transaction.name)
        || hit(opts.ignored_purpose_patterns, &transaction.purpose)
}

fn to_budget_transaction(
    transaction: &LedgerTransaction,
    opts: &ReconcileOptions<'_>,
) -> Result<BudgetTransaction> {
    Ok(BudgetTransaction {
        date: transaction.value_date,
        amount: minor_units(transaction.amount)?,
        imported_id: Some(format!("{}-{}", transaction.account_id, transaction.id)),
        imported_payee: transaction.name.clone(),
        payee_name: transaction.name.clone(),
        cleared: opts.synchronize_cleared.then_some(transaction.booked),
        notes: (!transaction.purpose.is_empty()).then(|| transaction.purpose.clone()),
    })
}

/// The destination's balance before the oldest surviving transaction: the
/// ledger's current balance minus everything booked inside the window. Only
/// booked amounts are subtracted because pending ones are not part of the
/// ledger balance yet.
fn starting_balance(
    source: &LedgerAccount,
    surviving: &[&LedgerTransaction],
) -> Result<BudgetTransaction> {
    let booked_sum: Decimal = surviving
        .iter()
        .filter(|t| t.booked)
        .map(|t| t.amount)
        .sum();
    let date = surviving
        .iter()
        .map(|t| t.value_date)
        .min()
        .unwrap_or_default();
    Ok(BudgetTransaction {
        date,
        amount: minor_units(source.balance - booked_sum)?,
        imported_id: Some(format!("{}-start", source.id)),
        imported_payee: STARTING_BALANCE_NOTE.to_string(),
        payee_name: STARTING_BALANCE_NOTE.to_string(),
        cleared: Some(true),
        notes: Some(STARTING_BALANCE_NOTE.to_string()),
    })
}
