//! In-process stand-ins for the ledger application and the budget service.
//!
//! [`DemoBudget`] implements the full [`BudgetApi`] surface against an
//! in-memory store and real metadata files on disk, with switches for the
//! failure modes the session has to handle (hangs, vanished local
//! directories, benign shutdown errors). [`DemoLedger`] serves a fixed set
//! of accounts and transactions. Both back the `--demo` mode of the binary
//! and the test suites.

use crate::api::{BudgetApi, BudgetApiError, LedgerClient, TransactionQuery};
use crate::model::{
    AccountType, BudgetAccount, BudgetTransaction, ImportOutcome, ImportRecordError,
    LedgerAccount, LedgerTransaction,
};
use crate::Result;
use anyhow::bail;
use chrono::{Days, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Sync id of the budget served in `--demo` mode.
pub const DEMO_SYNC_ID: &str = "demo-budget";

struct BudgetFile {
    sync_id: String,
    e2e_password: Option<String>,
    local_id: String,
    dir_name: String,
}

#[derive(Default)]
struct Inner {
    expected_password: String,
    initialized: bool,
    data_dir: Option<PathBuf>,
    budgets: Vec<BudgetFile>,
    loaded: Option<String>,
    accounts: Vec<BudgetAccount>,
    store: HashMap<String, Vec<BudgetTransaction>>,
    hang: HashSet<String>,
    rotate_ids_on_download: bool,
    drop_local_dir_once: bool,
    fail_next_shutdown_benign: bool,
    reject_payees: HashSet<String>,
    init_calls: u32,
    shutdown_calls: u32,
    was_silenced: bool,
}

/// Budget service double keeping everything in memory except the
/// `metadata.json` files, which it writes to the real data directory so the
/// session's directory scan runs against actual files.
pub struct DemoBudget {
    inner: Mutex<Inner>,
    silenced: AtomicBool,
}

impl DemoBudget {
    pub fn new(expected_password: &str) -> Self {
        Self {
            inner: Mutex::new(Inner {
                expected_password: expected_password.to_string(),
                ..Inner::default()
            }),
            silenced: AtomicBool::new(false),
        }
    }

    /// A server with the demo budget and two on-budget accounts, matching
    /// [`DemoLedger::seeded`].
    pub fn seeded(expected_password: &str) -> Self {
        Self {
            inner: Mutex::new(Inner {
                expected_password: expected_password.to_string(),
                budgets: vec![BudgetFile {
                    sync_id: DEMO_SYNC_ID.to_string(),
                    e2e_password: None,
                    local_id: format!("{DEMO_SYNC_ID}-local"),
                    dir_name: "Demo-Budget-a1b2c3".to_string(),
                }],
                accounts: vec![
                    BudgetAccount {
                        id: "ba-checking".to_string(),
                        name: "Checking".to_string(),
                        kind: AccountType::Checking,
                    },
                    BudgetAccount {
                        id: "ba-savings".to_string(),
                        name: "Savings".to_string(),
                        kind: AccountType::Savings,
                    },
                ],
                ..Inner::default()
            }),
            silenced: AtomicBool::new(false),
        }
    }

    /// Registers a budget on the "server" side.
    pub async fn add_budget(&self, sync_id: &str, e2e_password: Option<&str>) {
        let mut inner = self.inner.lock().await;
        let n = inner.budgets.len();
        inner.budgets.push(BudgetFile {
            sync_id: sync_id.to_string(),
            e2e_password: e2e_password.map(str::to_string),
            local_id: format!("{sync_id}-local"),
            dir_name: format!("budget-{n}"),
        });
    }

    pub async fn set_accounts(&self, accounts: Vec<BudgetAccount>) {
        self.inner.lock().await.accounts = accounts;
    }

    /// Makes the named operation block forever until [`unhang`](Self::unhang).
    pub async fn hang(&self, operation: &str) {
        self.inner.lock().await.hang.insert(operation.to_string());
    }

    pub async fn unhang(&self, operation: &str) {
        self.inner.lock().await.hang.remove(operation);
    }

    /// The next `loadBudget` call reports a missing local directory.
    pub async fn drop_local_dir_once(&self) {
        self.inner.lock().await.drop_local_dir_once = true;
    }

    /// Every download rewrites the local budget id, as the real SDK may do.
    pub async fn rotate_ids_on_download(&self) {
        self.inner.lock().await.rotate_ids_on_download = true;
    }

    pub async fn fail_next_shutdown_benign(&self) {
        self.inner.lock().await.fail_next_shutdown_benign = true;
    }

    /// Records imported with this payee come back as per-record errors.
    pub async fn reject_payee(&self, payee: &str) {
        self.inner.lock().await.reject_payees.insert(payee.to_string());
    }

    pub async fn init_calls(&self) -> u32 {
        self.inner.lock().await.init_calls
    }

    pub async fn shutdown_calls(&self) -> u32 {
        self.inner.lock().await.shutdown_calls
    }

    pub fn is_silenced(&self) -> bool {
        self.silenced.load(Ordering::SeqCst)
    }

    /// Whether the output channel was silenced at any point so far.
    pub async fn was_silenced(&self) -> bool {
        self.inner.lock().await.was_silenced
    }

    /// Everything imported so far for one account.
    pub async fn stored(&self, account_id: &str) -> Vec<BudgetTransaction> {
        self.inner
            .lock()
            .await
            .store
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn maybe_hang(&self, operation: &str) {
        let hang = self.inner.lock().await.hang.contains(operation);
        if hang {
            std::future::pending::<()>().await;
        }
    }

    async fn write_metadata(&self, data_dir: &Path, budget: &BudgetFile) -> Result<()> {
        let dir = data_dir.join(&budget.dir_name);
        tokio::fs::create_dir_all(&dir).await?;
        let metadata = serde_json::json!({
            "id": budget.local_id,
            "groupId": budget.sync_id,
        });
        tokio::fs::write(dir.join("metadata.json"), metadata.to_string()).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BudgetApi for DemoBudget {
    async fn init(&self, data_dir: &Path, server_url: &str, password: &str) -> Result<()> {
        self.maybe_hang("init").await;
        let mut inner = self.inner.lock().await;
        inner.init_calls += 1;
        if password != inner.expected_password {
            return Err(BudgetApiError::InvalidPassword {
                server: server_url.to_string(),
            }
            .into());
        }
        inner.data_dir = Some(data_dir.to_path_buf());
        inner.initialized = true;
        Ok(())
    }

    async fn download_budget(&self, sync_id: &str, e2e_password: Option<&str>) -> Result<()> {
        self.maybe_hang("downloadBudget").await;
        let mut inner = self.inner.lock().await;
        if !inner.initialized {
            bail!("not initialized");
        }
        let rotate = inner.rotate_ids_on_download;
        let Some(data_dir) = inner.data_dir.clone() else {
            bail!("not initialized");
        };
        let Some(budget) = inner.budgets.iter_mut().find(|b| b.sync_id == sync_id) else {
            return Err(BudgetApiError::FileNotFound.into());
        };
        if budget.e2e_password.as_deref() != e2e_password {
            bail!("wrong end-to-end encryption password for budget '{sync_id}'");
        }
        if rotate {
            budget.local_id = Uuid::new_v4().to_string();
        }
        let snapshot = BudgetFile {
            sync_id: budget.sync_id.clone(),
            e2e_password: budget.e2e_password.clone(),
            local_id: budget.local_id.clone(),
            dir_name: budget.dir_name.clone(),
        };
        drop(inner);
        self.write_metadata(&data_dir, &snapshot).await
    }

    async fn load_budget(&self, local_id: &str) -> Result<()> {
        self.maybe_hang("loadBudget").await;
        let mut inner = self.inner.lock().await;
        if inner.drop_local_dir_once {
            inner.drop_local_dir_once = false;
            return Err(BudgetApiError::LocalBudgetMissing.into());
        }
        if !inner.budgets.iter().any(|b| b.local_id == local_id) {
            return Err(BudgetApiError::LocalBudgetMissing.into());
        }
        inner.loaded = Some(local_id.to_string());
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        self.maybe_hang("sync").await;
        let inner = self.inner.lock().await;
        if inner.loaded.is_none() {
            bail!("no budget loaded");
        }
        Ok(())
    }

    async fn accounts(&self) -> Result<Vec<BudgetAccount>> {
        self.maybe_hang("getAccounts").await;
        let inner = self.inner.lock().await;
        if inner.loaded.is_none() {
            bail!("no budget loaded");
        }
        Ok(inner.accounts.clone())
    }

    async fn transactions(
        &self,
        account_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<BudgetTransaction>> {
        self.maybe_hang("getTransactions").await;
        let inner = self.inner.lock().await;
        if inner.loaded.is_none() {
            bail!("no budget loaded");
        }
        Ok(inner
            .store
            .get(account_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.date >= from && r.date <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn import_transactions(
        &self,
        account_id: &str,
        records: Vec<BudgetTransaction>,
    ) -> Result<ImportOutcome> {
        self.maybe_hang("importTransactions").await;
        let mut inner = self.inner.lock().await;
        if inner.loaded.is_none() {
            bail!("no budget loaded");
        }
        if !inner.accounts.iter().any(|a| a.id == account_id) {
            bail!("unknown account '{account_id}'");
        }
        let mut outcome = ImportOutcome::default();
        let rejects = inner.reject_payees.clone();
        let existing = inner.store.entry(account_id.to_string()).or_default();
        for record in records {
            if rejects.contains(&record.imported_payee) {
                outcome.errors.push(ImportRecordError {
                    message: format!("rejected payee '{}'", record.imported_payee),
                });
                continue;
            }
            let id = record.imported_id.clone().unwrap_or_default();
            let slot = existing
                .iter_mut()
                .find(|r| r.imported_id.as_deref() == Some(id.as_str()));
            match slot {
                Some(slot) => {
                    *slot = record;
                    outcome.updated.push(id);
                }
                None => {
                    existing.push(record);
                    outcome.added.push(id);
                }
            }
        }
        Ok(outcome)
    }

    async fn shutdown(&self) -> Result<()> {
        self.maybe_hang("shutdown").await;
        let mut inner = self.inner.lock().await;
        inner.shutdown_calls += 1;
        inner.loaded = None;
        inner.initialized = false;
        if inner.fail_next_shutdown_benign {
            inner.fail_next_shutdown_benign = false;
            return Err(BudgetApiError::NoConnectionToClose.into());
        }
        Ok(())
    }

    fn silence_output(&self) {
        self.silenced.store(true, Ordering::SeqCst);
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.was_silenced = true;
        }
    }

    fn restore_output(&self) {
        self.silenced.store(false, Ordering::SeqCst);
    }
}

/// Ledger application double serving a fixed account list and transaction
/// history.
pub struct DemoLedger {
    locked: bool,
    accounts: Vec<LedgerAccount>,
    transactions: Vec<LedgerTransaction>,
}

impl DemoLedger {
    pub fn new(accounts: Vec<LedgerAccount>, transactions: Vec<LedgerTransaction>) -> Self {
        Self {
            locked: false,
            accounts,
            transactions,
        }
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    /// Two accounts with a couple of weeks of booked and pending activity,
    /// dated relative to today so the default import window always covers
    /// them. Matches [`DemoBudget::seeded`].
    pub fn seeded() -> Self {
        let today = Utc::now().date_naive();
        let days_ago = |n: u64| today.checked_sub_days(Days::new(n)).unwrap_or(today);
        let tx = |id: u64,
                  account_id: &str,
                  amount: &str,
                  booked: bool,
                  age: u64,
                  name: &str,
                  purpose: &str| LedgerTransaction {
            id,
            account_id: account_id.to_string(),
            amount: amount.parse().unwrap_or_default(),
            booked,
            value_date: days_ago(age),
            booking_date: days_ago(age),
            name: name.to_string(),
            purpose: purpose.to_string(),
            comment: String::new(),
        };
        Self::new(
            vec![
                LedgerAccount {
                    id: "ML-1".to_string(),
                    account_number: Some("DE02120300000000202051".to_string()),
                    name: "Girokonto".to_string(),
                    balance: Decimal::new(274025, 2),
                    currency: "EUR".to_string(),
                },
                LedgerAccount {
                    id: "ML-2".to_string(),
                    account_number: None,
                    name: "Sparkonto".to_string(),
                    balance: Decimal::new(1500000, 2),
                    currency: "EUR".to_string(),
                },
            ],
            vec![
                tx(1001, "ML-1", "-42.50", true, 12, "REWE Markt", "Lebensmittel"),
                tx(1002, "ML-1", "-9.99", true, 8, "Spotify AB", "Abo 2026-08"),
                tx(1003, "ML-1", "2500.00", true, 5, "ACME GmbH", "Gehalt"),
                tx(1004, "ML-1", "-120.00", false, 1, "Stadtwerke", "Abschlag Strom"),
                tx(2001, "ML-2", "500.00", true, 10, "Eigenübertrag", "Sparrate"),
            ],
        )
    }
}

#[async_trait::async_trait]
impl LedgerClient for DemoLedger {
    async fn is_locked(&self) -> Result<bool> {
        Ok(self.locked)
    }

    async fn accounts(&self) -> Result<Vec<LedgerAccount>> {
        Ok(self.accounts.clone())
    }

    async fn transactions(&self, query: &TransactionQuery) -> Result<Vec<LedgerTransaction>> {
        Ok(self
            .transactions
            .iter()
            .filter(|t| t.booking_date >= query.from && t.booking_date <= query.to)
            .filter(|t| {
                query
                    .account_id
                    .as_deref()
                    .map(|id| t.account_id == id)
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }
}
