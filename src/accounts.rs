//! Resolves the configured account mapping into concrete pairs of ledger
//! and budget accounts.
//!
//! Each side of a mapping entry is a free-form reference that is matched
//! against an account's id first, then its account number (ledger side
//! only), then its display name with surrounding whitespace ignored. Name
//! matches take the first hit in listing order.

use crate::api::{BudgetSession, LedgerClient};
use crate::config::{BudgetConfig, MappingEntry};
use crate::model::{BudgetAccount, LedgerAccount};
use crate::Result;
use anyhow::bail;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One resolved mapping entry: where transactions come from and where they
/// go.
#[derive(Debug, Clone)]
pub struct AccountPair {
    pub source: LedgerAccount,
    pub budget: BudgetAccount,
}

enum LoadState {
    NotLoaded,
    Loaded(Vec<AccountPair>),
}

/// The resolved account mapping for one budget. Built once per run from the
/// live account listings on both sides, then queried for the pairs an import
/// should cover.
pub struct AccountMap {
    budget_name: String,
    entries: Vec<MappingEntry>,
    ledger: Arc<dyn LedgerClient>,
    state: LoadState,
}

impl AccountMap {
    pub fn new(budget: &BudgetConfig, ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            budget_name: budget.name.clone(),
            entries: budget.accounts.clone(),
            ledger,
            state: LoadState::NotLoaded,
        }
    }

    /// Fetches the account listings from both sides and resolves every
    /// configured entry. Entries that do not resolve fail the load as one
    /// aggregated error, except entries outside `filter` when a filter is
    /// given, which are dropped silently so a partial run does not trip over
    /// accounts it will not touch. Filter entries name source accounts only.
    /// A second call while a mapping exists is a no-op.
    pub async fn load(
        &mut self,
        session: &BudgetSession,
        filter: Option<&[String]>,
    ) -> Result<()> {
        if let LoadState::Loaded(_) = self.state {
            debug!(
                "account mapping for budget '{}' is already loaded",
                self.budget_name
            );
            return Ok(());
        }
        let (ledger_accounts, budget_accounts) =
            tokio::join!(self.ledger.accounts(), session.accounts());
        let ledger_accounts = ledger_accounts?;
        let budget_accounts = budget_accounts?;
        let pairs = resolve_entries(
            &self.budget_name,
            &self.entries,
            &ledger_accounts,
            &budget_accounts,
            filter,
        )?;
        for pair in &pairs {
            info!(
                "budget '{}': mapped {} ({}) to {} ({})",
                self.budget_name, pair.source.name, pair.source.id, pair.budget.name,
                pair.budget.id
            );
        }
        self.state = LoadState::Loaded(pairs);
        Ok(())
    }

    /// The resolved pairs, narrowed by an optional list of source account
    /// references. Filter entries that match nothing are logged and skipped.
    pub fn pairs(&self, filter: Option<&[String]>) -> Result<Vec<AccountPair>> {
        let LoadState::Loaded(pairs) = &self.state else {
            bail!(
                "account mapping for budget '{}' has not been loaded",
                self.budget_name
            );
        };
        let Some(filter) = filter else {
            return Ok(pairs.clone());
        };
        let mut selected: Vec<AccountPair> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for reference in filter {
            let matched = pairs.iter().find(|pair| {
                pair_matches(pair, reference)
            });
            match matched {
                Some(pair) => {
                    if seen.insert(pair.source.id.clone()) {
                        selected.push(pair.clone());
                    }
                }
                None => {
                    error!(
                        "budget '{}': account filter '{reference}' matches no mapped \
                         account, skipping it",
                        self.budget_name
                    );
                }
            }
        }
        Ok(selected)
    }
}

// Filters name source accounts only; the budget side is never matched.
fn pair_matches(pair: &AccountPair, reference: &str) -> bool {
    find_ledger_account(std::slice::from_ref(&pair.source), reference).is_some()
}

fn resolve_entries(
    budget_name: &str,
    entries: &[MappingEntry],
    ledger_accounts: &[LedgerAccount],
    budget_accounts: &[BudgetAccount],
    filter: Option<&[String]>,
) -> Result<Vec<AccountPair>> {
    let mut pairs = Vec::new();
    let mut unresolved = Vec::new();
    for entry in entries {
        let source = find_ledger_account(ledger_accounts, &entry.ledger);
        let budget = find_budget_account(budget_accounts, &entry.budget);
        match (source, budget) {
            (Some(source), Some(budget)) => pairs.push(AccountPair {
                source: source.clone(),
                budget: budget.clone(),
            }),
            (source, budget) => {
                let in_scope = filter
                    .map(|refs| {
                        refs.iter().any(|r| {
                            r == &entry.ledger
                                || source.map(|s| account_matches_ledger(s, r)).unwrap_or(false)
                        })
                    })
                    .unwrap_or(true);
                let missing = match (source.is_some(), budget.is_some()) {
                    (false, false) => format!(
                        "'{}' (ledger) and '{}' (budget)",
                        entry.ledger, entry.budget
                    ),
                    (false, true) => format!("'{}' (ledger)", entry.ledger),
                    _ => format!("'{}' (budget)", entry.budget),
                };
                if in_scope {
                    unresolved.push(missing);
                } else {
                    debug!(
                        "budget '{budget_name}': mapping entry {missing} did not \
                         resolve but is outside the requested accounts, ignoring it"
                    );
                }
            }
        }
    }
    if !unresolved.is_empty() {
        bail!(
            "budget '{budget_name}': could not resolve account reference(s) {}; \
             check the account mapping against both account listings",
            unresolved.join(", ")
        );
    }
    Ok(pairs)
}

/// Finds a ledger account by id, account number, or trimmed display name,
/// in that order of precedence. A warning is logged when several accounts
/// share the matching name.
pub fn find_ledger_account<'a>(
    accounts: &'a [LedgerAccount],
    reference: &str,
) -> Option<&'a LedgerAccount> {
    if let Some(found) = accounts.iter().find(|a| a.id == reference) {
        return Some(found);
    }
    if let Some(found) = accounts
        .iter()
        .find(|a| a.account_number.as_deref() == Some(reference))
    {
        return Some(found);
    }
    find_by_name(accounts, reference, |a: &LedgerAccount| &a.name)
}

/// Finds a budget account by id or trimmed display name. Budget accounts
/// carry no account number.
pub fn find_budget_account<'a>(
    accounts: &'a [BudgetAccount],
    reference: &str,
) -> Option<&'a BudgetAccount> {
    if let Some(found) = accounts.iter().find(|a| a.id == reference) {
        return Some(found);
    }
    find_by_name(accounts, reference, |a: &BudgetAccount| &a.name)
}

fn account_matches_ledger(account: &LedgerAccount, reference: &str) -> bool {
    find_ledger_account(std::slice::from_ref(account), reference).is_some()
}

fn find_by_name<'a, T>(
    accounts: &'a [T],
    reference: &str,
    name: impl Fn(&T) -> &str,
) -> Option<&'a T> {
    let wanted = reference.trim();
    let mut matches = accounts.iter().filter(|a| name(a).trim() == wanted);
    let first = matches.next()?;
    let extra = matches.count();
    if extra > 0 {
        warn!(
            "{} account(s) besides the first share the name '{wanted}', using the \
             first one in listing order",
            extra
        );
    }
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn ledger(id: &str, number: Option<&str>, name: &str) -> LedgerAccount {
        LedgerAccount {
            id: id.to_string(),
            account_number: number.map(str::to_string),
            name: name.to_string(),
            balance: Decimal::ZERO,
            currency: "EUR".to_string(),
        }
    }

    fn budget(id: &str, name: &str) -> BudgetAccount {
        BudgetAccount {
            id: id.to_string(),
            name: name.to_string(),
            kind: Default::default(),
        }
    }

    fn entry(ledger: &str, budget: &str) -> MappingEntry {
        MappingEntry {
            ledger: ledger.to_string(),
            budget: budget.to_string(),
        }
    }

    #[test]
    fn test_id_wins_over_number_and_name() {
        let accounts = vec![
            ledger("DE99", None, "Giro"),
            ledger("ML-2", Some("DE99"), "DE99"),
        ];
        let found = find_ledger_account(&accounts, "DE99").unwrap();
        assert_eq!(found.id, "DE99");
    }

    #[test]
    fn test_number_wins_over_name() {
        let accounts = vec![
            ledger("ML-1", None, "DE99"),
            ledger("ML-2", Some("DE99"), "Giro"),
        ];
        let found = find_ledger_account(&accounts, "DE99").unwrap();
        assert_eq!(found.id, "ML-2");
    }

    #[test]
    fn test_name_match_ignores_surrounding_whitespace() {
        let accounts = vec![ledger("ML-1", None, "  Girokonto ")];
        assert!(find_ledger_account(&accounts, "Girokonto").is_some());
        assert!(find_ledger_account(&accounts, "  Girokonto  ").is_some());
    }

    #[test]
    fn test_ambiguous_name_takes_first_in_listing_order() {
        let accounts = vec![
            ledger("ML-1", None, "Giro"),
            ledger("ML-2", None, "Giro"),
        ];
        let found = find_ledger_account(&accounts, "Giro").unwrap();
        assert_eq!(found.id, "ML-1");
    }

    #[test]
    fn test_budget_reference_never_matches_account_numbers() {
        let accounts = vec![budget("ba-1", "Checking")];
        assert!(find_budget_account(&accounts, "ba-1").is_some());
        assert!(find_budget_account(&accounts, "Checking").is_some());
        assert!(find_budget_account(&accounts, "DE99").is_none());
    }

    #[test]
    fn test_unresolved_entries_fail_with_aggregated_error() {
        let err = resolve_entries(
            "Family",
            &[entry("Giro", "Checking"), entry("Nope", "Missing")],
            &[ledger("ML-1", None, "Giro")],
            &[budget("ba-1", "Checking")],
            None,
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Family"));
        assert!(message.contains("'Nope' (ledger)"));
        assert!(message.contains("'Missing' (budget)"));
    }

    #[test]
    fn test_out_of_scope_unresolved_entries_are_dropped_under_filter() {
        let filter = vec!["Giro".to_string()];
        let pairs = resolve_entries(
            "Family",
            &[entry("Giro", "Checking"), entry("Nope", "Missing")],
            &[ledger("ML-1", None, "Giro")],
            &[budget("ba-1", "Checking")],
            Some(&filter),
        )
        .unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].source.id, "ML-1");
    }

    #[test]
    fn test_budget_side_references_never_scope_entries() {
        // "Checking" names the budget side only; the entry's source
        // reference is not in the filter, so the entry is out of scope and
        // its unresolved ledger side does not fail the load.
        let filter = vec!["Checking".to_string()];
        let pairs = resolve_entries(
            "Family",
            &[entry("Nope", "Checking")],
            &[ledger("ML-1", None, "Giro")],
            &[budget("ba-1", "Checking")],
            Some(&filter),
        )
        .unwrap();
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_unresolved_entry_named_by_source_filter_still_fails() {
        let filter = vec!["Nope".to_string()];
        let result = resolve_entries(
            "Family",
            &[entry("Nope", "Checking")],
            &[ledger("ML-1", None, "Giro")],
            &[budget("ba-1", "Checking")],
            Some(&filter),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_second_load_is_a_noop() {
        use crate::api::{DemoBudget, TransactionQuery};
        use crate::config::Config;
        use crate::model::LedgerTransaction;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct CountingLedger {
            calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl crate::api::LedgerClient for CountingLedger {
            async fn is_locked(&self) -> crate::Result<bool> {
                Ok(false)
            }
            async fn accounts(&self) -> crate::Result<Vec<LedgerAccount>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![ledger("ML-1", None, "Giro")])
            }
            async fn transactions(
                &self,
                _query: &TransactionQuery,
            ) -> crate::Result<Vec<LedgerTransaction>> {
                Ok(Vec::new())
            }
        }

        let dir = tempfile::TempDir::new().unwrap();
        let api = Arc::new(DemoBudget::new("pw"));
        api.add_budget("sync-1", None).await;
        api.set_accounts(vec![budget("ba-1", "Checking")]).await;
        let budget_config = BudgetConfig {
            name: "Family".to_string(),
            sync_id: "sync-1".to_string(),
            e2e_password: None,
            earliest_import_date: None,
            import_unchecked: false,
            synchronize_cleared: false,
            rewrite_payees: false,
            mask_payees_in_logs: false,
            ignored_comment_patterns: Vec::new(),
            ignored_payee_patterns: Vec::new(),
            ignored_purpose_patterns: Vec::new(),
            accounts: vec![entry("Giro", "Checking")],
        };
        let config = Config {
            server_url: "https://budget.test".to_string(),
            password: "pw".to_string(),
            data_dir: Some(dir.path().to_path_buf()),
            timeout_secs: None,
            budgets: vec![budget_config.clone()],
        };
        let mut session = BudgetSession::new(api, &config);
        session.load_budget("sync-1").await.unwrap();

        let ledger_client = Arc::new(CountingLedger {
            calls: AtomicUsize::new(0),
        });
        let mut map = AccountMap::new(&budget_config, ledger_client.clone());
        map.load(&session, None).await.unwrap();
        map.load(&session, None).await.unwrap();
        assert_eq!(ledger_client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(map.pairs(None).unwrap().len(), 1);
    }
}
