//! Drives one import run for a budget: pick the account pairs, fetch the
//! ledger window once, reconcile per pair, normalize payees, and send the
//! batches.

use crate::accounts::{AccountMap, AccountPair};
use crate::api::{BudgetSession, LedgerClient, PayeeRewriter, TransactionQuery};
use crate::config::BudgetConfig;
use crate::model::{BudgetTransaction, LedgerTransaction};
use crate::reconcile::{self, ReconcileOptions};
use crate::Result;
use anyhow::bail;
use chrono::{Months, NaiveDate, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What one `sync` invocation asked for.
#[derive(Debug, Default, Clone)]
pub struct ImportRequest {
    /// Restrict the run to these account references; `None` means all mapped
    /// accounts.
    pub account_refs: Option<Vec<String>>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub dry_run: bool,
}

/// Per-run counters, one row per account pair.
#[derive(Debug, Default, Serialize)]
pub struct ImportSummary {
    pub dry_run: bool,
    pub accounts: Vec<AccountImportSummary>,
}

#[derive(Debug, Serialize)]
pub struct AccountImportSummary {
    pub source: String,
    pub destination: String,
    pub planned: usize,
    pub added: usize,
    pub updated: usize,
    pub rejected: usize,
}

/// Import engine for one configured budget. Stateless across runs apart from
/// the per-run masking salt, so payee hashes cannot be correlated between
/// runs.
pub struct Importer {
    budget: BudgetConfig,
    ledger: Arc<dyn LedgerClient>,
    rewriter: Option<Arc<dyn PayeeRewriter>>,
    mask_salt: String,
}

impl Importer {
    pub fn new(
        budget: BudgetConfig,
        ledger: Arc<dyn LedgerClient>,
        rewriter: Option<Arc<dyn PayeeRewriter>>,
    ) -> Self {
        Self {
            budget,
            ledger,
            rewriter,
            mask_salt: Uuid::new_v4().to_string(),
        }
    }

    /// Runs the import against an already loaded session and account map.
    pub async fn import_transactions(
        &self,
        session: &BudgetSession,
        map: &AccountMap,
        request: &ImportRequest,
    ) -> Result<ImportSummary> {
        let pairs = map.pairs(request.account_refs.as_deref())?;
        let mut summary = ImportSummary {
            dry_run: request.dry_run,
            ..ImportSummary::default()
        };
        if pairs.is_empty() {
            if request.account_refs.is_some() {
                warn!(
                    "budget '{}': none of the requested accounts are mapped, \
                     nothing to do",
                    self.budget.name
                );
                return Ok(summary);
            }
            bail!(
                "budget '{}' has no resolved account mapping",
                self.budget.name
            );
        }

        let today = Utc::now().date_naive();
        if let (Some(from), Some(to)) = (request.from, request.to) {
            if from > to {
                bail!("invalid import window: {from} is after {to}");
            }
        }
        let Some((from, to)) = self.effective_window(request, today) else {
            warn!(
                "budget '{}': the requested window ends before the earliest \
                 import date, nothing to do",
                self.budget.name
            );
            return Ok(summary);
        };

        if self.ledger.is_locked().await? {
            bail!("the ledger application is locked; unlock it and run the import again");
        }

        // One window-wide fetch instead of one per account.
        let query = TransactionQuery {
            from,
            to,
            account_id: None,
        };
        let mut by_account: HashMap<String, Vec<LedgerTransaction>> = HashMap::new();
        for transaction in self.ledger.transactions(&query).await? {
            by_account
                .entry(transaction.account_id.clone())
                .or_default()
                .push(transaction);
        }

        for pair in &pairs {
            let row = self
                .import_pair(session, pair, &by_account, from, to, request.dry_run)
                .await?;
            summary.accounts.push(row);
        }
        Ok(summary)
    }

    /// The window to import, with the configured earliest import date as a
    /// floor. `None` when the floor pushes the start past the end.
    fn effective_window(
        &self,
        request: &ImportRequest,
        today: NaiveDate,
    ) -> Option<(NaiveDate, NaiveDate)> {
        let default_from = today.checked_sub_months(Months::new(1)).unwrap_or(today);
        let mut from = request.from.unwrap_or(default_from);
        let to = request.to.unwrap_or(today);
        if let Some(earliest) = self.budget.earliest_import_date {
            if from < earliest {
                warn!(
                    "budget '{}': window start {from} is before the earliest \
                     import date, moving it to {earliest}",
                    self.budget.name
                );
                from = earliest;
            }
        }
        (from <= to).then_some((from, to))
    }

    async fn import_pair(
        &self,
        session: &BudgetSession,
        pair: &AccountPair,
        by_account: &HashMap<String, Vec<LedgerTransaction>>,
        from: NaiveDate,
        to: NaiveDate,
        dry_run: bool,
    ) -> Result<AccountImportSummary> {
        let mut row = AccountImportSummary {
            source: pair.source.name.clone(),
            destination: pair.budget.name.clone(),
            planned: 0,
            added: 0,
            updated: 0,
            rejected: 0,
        };
        let window = by_account
            .get(&pair.source.id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let existing = session.transactions(&pair.budget.id, from, to).await?;
        let opts = ReconcileOptions::from(&self.budget);
        let mut planned = reconcile::plan(&pair.source, window, &existing, &opts)?;
        row.planned = planned.len();
        if planned.is_empty() {
            debug!(
                "'{}' -> '{}': nothing new in {from}..{to}",
                pair.source.name, pair.budget.name
            );
            return Ok(row);
        }

        if self.budget.rewrite_payees && !dry_run {
            if let Some(rewriter) = &self.rewriter {
                self.finalize_payees(rewriter.as_ref(), &mut planned).await;
            }
        }
        debug!(
            "'{}' -> '{}': importing payees [{}]",
            pair.source.name,
            pair.budget.name,
            self.display_payees(&planned)
        );

        if dry_run {
            info!(
                "'{}' -> '{}': would import {} record(s) for {from}..{to}",
                pair.source.name,
                pair.budget.name,
                planned.len()
            );
            return Ok(row);
        }

        let outcome = session
            .import_transactions(&pair.budget.id, planned)
            .await?;
        row.added = outcome.added.len();
        row.updated = outcome.updated.len();
        row.rejected = outcome.errors.len();
        info!(
            "'{}' -> '{}': {} added, {} updated, {} rejected",
            pair.source.name, pair.budget.name, row.added, row.updated, row.rejected
        );
        Ok(row)
    }

    /// Replaces each record's payee name with the normalized form. Any
    /// failure or absent answer falls back to the raw ledger payee; a run
    /// never fails because normalization did.
    async fn finalize_payees(
        &self,
        rewriter: &dyn PayeeRewriter,
        records: &mut [BudgetTransaction],
    ) {
        let mut names: Vec<String> = Vec::new();
        for record in records.iter() {
            if !names.contains(&record.imported_payee) {
                names.push(record.imported_payee.clone());
            }
        }
        match rewriter.transform_payees(&names).await {
            Ok(Some(normalized)) => {
                for record in records.iter_mut() {
                    if let Some(name) = normalized.get(&record.imported_payee) {
                        record.payee_name = name.clone();
                    }
                }
            }
            Ok(None) => {
                warn!(
                    "budget '{}': payee normalization returned no result, \
                     keeping the raw payee names",
                    self.budget.name
                );
            }
            Err(err) => {
                warn!(
                    "budget '{}': payee normalization failed ({err:#}), \
                     keeping the raw payee names",
                    self.budget.name
                );
            }
        }
    }

    /// Payee names for log output, hashed when the budget asks for masking.
    fn display_payees(&self, records: &[BudgetTransaction]) -> String {
        records
            .iter()
            .map(|record| {
                if self.budget.mask_payees_in_logs {
                    mask(&self.mask_salt, &record.payee_name)
                } else {
                    record.payee_name.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Stable-within-a-run pseudonym for a payee name.
fn mask(salt: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    format!(
        "payee-{:02x}{:02x}{:02x}{:02x}",
        digest[0], digest[1], digest[2], digest[3]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DemoBudget, DemoLedger};
    use crate::config::{Config, MappingEntry};
    use crate::model::{AccountType, BudgetAccount, LedgerAccount};
    use rust_decimal::Decimal;
    use std::path::Path;

    fn budget_config() -> BudgetConfig {
        BudgetConfig {
            name: "Family".to_string(),
            sync_id: "sync-1".to_string(),
            e2e_password: None,
            earliest_import_date: None,
            import_unchecked: false,
            synchronize_cleared: true,
            rewrite_payees: false,
            mask_payees_in_logs: false,
            ignored_comment_patterns: Vec::new(),
            ignored_payee_patterns: Vec::new(),
            ignored_purpose_patterns: Vec::new(),
            accounts: vec![MappingEntry {
                ledger: "Giro".to_string(),
                budget: "Checking".to_string(),
            }],
        }
    }

    fn ledger_account() -> LedgerAccount {
        LedgerAccount {
            id: "ML-1".to_string(),
            account_number: None,
            name: "Giro".to_string(),
            balance: Decimal::new(10000, 2),
            currency: "EUR".to_string(),
        }
    }

    fn ledger_tx(id: u64, amount: &str, day: u32) -> LedgerTransaction {
        let date = NaiveDate::from_ymd_opt(2024, 5, day).unwrap();
        LedgerTransaction {
            id,
            account_id: "ML-1".to_string(),
            amount: amount.parse().unwrap(),
            booked: true,
            value_date: date,
            booking_date: date,
            name: format!("Payee {id}"),
            purpose: String::new(),
            comment: String::new(),
        }
    }

    async fn loaded_session(
        dir: &Path,
        budget: Arc<DemoBudget>,
    ) -> BudgetSession {
        budget.add_budget("sync-1", None).await;
        budget
            .set_accounts(vec![BudgetAccount {
                id: "ba-1".to_string(),
                name: "Checking".to_string(),
                kind: AccountType::Checking,
            }])
            .await;
        let config = Config {
            server_url: "https://budget.test".to_string(),
            password: "pw".to_string(),
            data_dir: Some(dir.to_path_buf()),
            timeout_secs: None,
            budgets: vec![budget_config()],
        };
        let mut session = BudgetSession::new(budget, &config);
        session.load_budget("sync-1").await.unwrap();
        session
    }

    fn request(from: u32, to: u32) -> ImportRequest {
        ImportRequest {
            account_refs: None,
            from: NaiveDate::from_ymd_opt(2024, 5, from),
            to: NaiveDate::from_ymd_opt(2024, 5, to),
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn test_second_run_imports_nothing_new() {
        let dir = tempfile::TempDir::new().unwrap();
        let budget = Arc::new(DemoBudget::new("pw"));
        let session = loaded_session(dir.path(), budget.clone()).await;
        let ledger = Arc::new(DemoLedger::new(
            vec![ledger_account()],
            vec![ledger_tx(1, "-20.00", 2), ledger_tx(2, "35.50", 10)],
        ));
        let mut map = AccountMap::new(&budget_config(), ledger.clone());
        map.load(&session, None).await.unwrap();
        let importer = Importer::new(budget_config(), ledger, None);

        let first = importer
            .import_transactions(&session, &map, &request(1, 28))
            .await
            .unwrap();
        // Two transactions plus the starting balance.
        assert_eq!(first.accounts[0].added, 3);

        let second = importer
            .import_transactions(&session, &map, &request(1, 28))
            .await
            .unwrap();
        assert_eq!(second.accounts[0].planned, 0);
        assert_eq!(second.accounts[0].added, 0);
    }

    #[tokio::test]
    async fn test_dry_run_sends_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let budget = Arc::new(DemoBudget::new("pw"));
        let session = loaded_session(dir.path(), budget.clone()).await;
        let ledger = Arc::new(DemoLedger::new(
            vec![ledger_account()],
            vec![ledger_tx(1, "-20.00", 2)],
        ));
        let mut map = AccountMap::new(&budget_config(), ledger.clone());
        map.load(&session, None).await.unwrap();
        let importer = Importer::new(budget_config(), ledger, None);

        let mut req = request(1, 28);
        req.dry_run = true;
        let summary = importer
            .import_transactions(&session, &map, &req)
            .await
            .unwrap();
        assert_eq!(summary.accounts[0].planned, 2);
        assert_eq!(summary.accounts[0].added, 0);
        assert!(budget.stored("ba-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_filter_matching_nothing_is_not_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let budget = Arc::new(DemoBudget::new("pw"));
        let session = loaded_session(dir.path(), budget.clone()).await;
        let ledger = Arc::new(DemoLedger::new(vec![ledger_account()], Vec::new()));
        let mut map = AccountMap::new(&budget_config(), ledger.clone());
        map.load(&session, None).await.unwrap();
        let importer = Importer::new(budget_config(), ledger, None);

        let req = ImportRequest {
            account_refs: Some(vec!["No-Such-Account".to_string()]),
            ..request(1, 28)
        };
        let summary = importer
            .import_transactions(&session, &map, &req)
            .await
            .unwrap();
        assert!(summary.accounts.is_empty());
    }

    #[tokio::test]
    async fn test_locked_ledger_aborts_before_any_import() {
        let dir = tempfile::TempDir::new().unwrap();
        let budget = Arc::new(DemoBudget::new("pw"));
        let session = loaded_session(dir.path(), budget.clone()).await;
        let ledger = Arc::new(
            DemoLedger::new(
                vec![ledger_account()],
                vec![ledger_tx(1, "-20.00", 2)],
            )
            .locked(),
        );
        let mut map = AccountMap::new(&budget_config(), ledger.clone());
        map.load(&session, None).await.unwrap();
        let importer = Importer::new(budget_config(), ledger, None);

        let err = importer
            .import_transactions(&session, &map, &request(1, 28))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("locked"));
        assert!(budget.stored("ba-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_payee_normalization_with_fallback() {
        struct HalfRewriter;
        #[async_trait::async_trait]
        impl PayeeRewriter for HalfRewriter {
            async fn transform_payees(
                &self,
                names: &[String],
            ) -> crate::Result<Option<HashMap<String, String>>> {
                let mut out = HashMap::new();
                for name in names {
                    if name == "Payee 1" {
                        out.insert(name.clone(), "Nice Payee".to_string());
                    }
                }
                Ok(Some(out))
            }
        }

        let dir = tempfile::TempDir::new().unwrap();
        let budget = Arc::new(DemoBudget::new("pw"));
        let session = loaded_session(dir.path(), budget.clone()).await;
        let ledger = Arc::new(DemoLedger::new(
            vec![ledger_account()],
            vec![ledger_tx(1, "-20.00", 2), ledger_tx(2, "-5.00", 3)],
        ));
        let mut map = AccountMap::new(&budget_config(), ledger.clone());
        map.load(&session, None).await.unwrap();
        let mut config = budget_config();
        config.rewrite_payees = true;
        let importer = Importer::new(config, ledger, Some(Arc::new(HalfRewriter)));

        importer
            .import_transactions(&session, &map, &request(1, 28))
            .await
            .unwrap();
        let stored = budget.stored("ba-1").await;
        let find = |imported: &str| {
            stored
                .iter()
                .find(|r| r.imported_payee == imported)
                .unwrap()
                .payee_name
                .clone()
        };
        assert_eq!(find("Payee 1"), "Nice Payee");
        // No normalized form answered for this one, the raw name survives.
        assert_eq!(find("Payee 2"), "Payee 2");
    }

    #[test]
    fn test_earliest_import_date_floors_the_window() {
        let mut config = budget_config();
        config.earliest_import_date = NaiveDate::from_ymd_opt(2024, 5, 10);
        let ledger = Arc::new(DemoLedger::new(Vec::new(), Vec::new()));
        let importer = Importer::new(config, ledger, None);
        let today = NaiveDate::from_ymd_opt(2024, 5, 28).unwrap();

        let (from, to) = importer
            .effective_window(&request(1, 28), today)
            .unwrap();
        assert_eq!(from, NaiveDate::from_ymd_opt(2024, 5, 10).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2024, 5, 28).unwrap());

        // Window entirely before the floor collapses to nothing.
        assert!(importer.effective_window(&request(1, 5), today).is_none());
    }

    #[test]
    fn test_default_window_is_the_last_month() {
        let ledger = Arc::new(DemoLedger::new(Vec::new(), Vec::new()));
        let importer = Importer::new(budget_config(), ledger, None);
        let today = NaiveDate::from_ymd_opt(2024, 5, 28).unwrap();
        let (from, to) = importer
            .effective_window(&ImportRequest::default(), today)
            .unwrap();
        assert_eq!(from, NaiveDate::from_ymd_opt(2024, 4, 28).unwrap());
        assert_eq!(to, today);
    }

    #[tokio::test]
    async fn test_masking_hides_raw_names_on_both_normalization_paths() {
        struct Normalizer;
        #[async_trait::async_trait]
        impl PayeeRewriter for Normalizer {
            async fn transform_payees(
                &self,
                names: &[String],
            ) -> crate::Result<Option<HashMap<String, String>>> {
                Ok(Some(
                    names
                        .iter()
                        .map(|n| (n.clone(), format!("Clean {n}")))
                        .collect(),
                ))
            }
        }

        struct BrokenRewriter;
        #[async_trait::async_trait]
        impl PayeeRewriter for BrokenRewriter {
            async fn transform_payees(
                &self,
                _names: &[String],
            ) -> crate::Result<Option<HashMap<String, String>>> {
                anyhow::bail!("service unavailable")
            }
        }

        let record = || BudgetTransaction {
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            amount: -100,
            imported_id: None,
            imported_payee: "Hidden GmbH".to_string(),
            payee_name: "Hidden GmbH".to_string(),
            cleared: None,
            notes: None,
        };
        let ledger = Arc::new(DemoLedger::new(Vec::new(), Vec::new()));
        let mut config = budget_config();
        config.mask_payees_in_logs = true;
        config.rewrite_payees = true;
        let importer = Importer::new(config, ledger, None);

        // Normalization succeeded; the normalized name must not leak either.
        let mut records = vec![record()];
        importer.finalize_payees(&Normalizer, &mut records).await;
        assert_eq!(records[0].payee_name, "Clean Hidden GmbH");
        let shown = importer.display_payees(&records);
        assert!(!shown.contains("Hidden"));
        assert!(!shown.contains("Clean"));
        assert!(shown.starts_with("payee-"));

        // Normalization failed; the raw fallback name must not leak.
        let mut records = vec![record()];
        importer.finalize_payees(&BrokenRewriter, &mut records).await;
        assert_eq!(records[0].payee_name, "Hidden GmbH");
        assert!(!importer.display_payees(&records).contains("Hidden"));
    }

    #[test]
    fn test_masked_payees_never_show_raw_names() {
        let ledger = Arc::new(DemoLedger::new(Vec::new(), Vec::new()));
        let mut config = budget_config();
        config.mask_payees_in_logs = true;
        let importer = Importer::new(config, ledger, None);
        let record = BudgetTransaction {
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            amount: -100,
            imported_id: None,
            imported_payee: "Dr. Secret".to_string(),
            payee_name: "Dr. Secret".to_string(),
            cleared: None,
            notes: None,
        };
        let shown = importer.display_payees(std::slice::from_ref(&record));
        assert!(!shown.contains("Secret"));
        assert!(shown.starts_with("payee-"));
        // Stable within one run.
        assert_eq!(shown, importer.display_payees(std::slice::from_ref(&record)));
    }
}
