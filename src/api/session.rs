//! Lifecycle wrapper around the remote budget SDK for one server and its
//! budgets: initialize, resolve local budget directories for a sync id,
//! download/load with a bounded retry, run every remote call under a
//! timeout, and tear down.

use crate::api::{BudgetApi, BudgetApiError};
use crate::config::{BudgetConfig, Config};
use crate::model::{BudgetAccount, BudgetTransaction, ImportOutcome};
use crate::Result;
use anyhow::{bail, Context};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bound for a forced shutdown, separate from the per-call timeout so a
/// hanging shutdown cannot block the retry path.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// At most this many local budget directories are examined per scan.
const MAX_DIR_SCAN: usize = 100;

/// Prefix for import ids generated for records that arrive without one.
const GENERATED_ID_PREFIX: &str = "mm-sync-";

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Uninitialized,
    Ready,
    Loaded(String),
}

/// One logical connection to a budget server. Owns the SDK lifecycle so that
/// no process-wide singleton is needed; each server gets its own instance.
pub struct BudgetSession {
    api: Arc<dyn BudgetApi>,
    server_url: String,
    password: String,
    data_dir: PathBuf,
    timeout: Duration,
    budgets: Vec<BudgetConfig>,
    state: SessionState,
}

impl BudgetSession {
    pub fn new(api: Arc<dyn BudgetApi>, config: &Config) -> Self {
        Self {
            api,
            server_url: config.server_url.clone(),
            password: config.password.clone(),
            data_dir: config.data_dir(),
            timeout: config.timeout(),
            budgets: config.budgets.clone(),
            state: SessionState::Uninitialized,
        }
    }

    /// Connects to the server and downloads every configured budget.
    /// Re-entrant: a no-op once the session is Ready or Loaded.
    pub async fn init(&mut self) -> Result<()> {
        if self.state != SessionState::Uninitialized {
            debug!("budget session already initialized");
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| {
                format!("Unable to create data directory {}", self.data_dir.display())
            })?;
        self.timed(
            "init",
            self.api.init(&self.data_dir, &self.server_url, &self.password),
        )
        .await
        .with_context(|| {
            format!(
                "Failed to connect to budget server {}; check the network and verify \
                 the server is running",
                self.server_url
            )
        })?;
        self.state = SessionState::Ready;
        let budgets = self.budgets.clone();
        for budget in &budgets {
            self.download_with_retry(budget).await?;
        }
        Ok(())
    }

    /// Makes `sync_id` the active budget: resolve its local directory,
    /// refresh it from the server, re-resolve (the local id may rotate
    /// during download), load it, and trigger a sync.
    ///
    /// When the local directory turns out to be missing mid-sequence, the
    /// whole session is torn down, re-initialized, and the sequence is run
    /// exactly once more. A timeout during this sequence also tears the
    /// session down so the next call starts clean, but is not retried.
    pub async fn load_budget(&mut self, sync_id: &str) -> Result<()> {
        self.init().await?;
        let e2e_password = self
            .budgets
            .iter()
            .find(|b| b.sync_id == sync_id)
            .and_then(|b| b.e2e_password.clone());
        let mut restarted = false;
        loop {
            match self.load_once(sync_id, e2e_password.as_deref()).await {
                Ok(()) => {
                    self.state = SessionState::Loaded(sync_id.to_string());
                    return Ok(());
                }
                Err(err) => {
                    match err.downcast_ref::<BudgetApiError>() {
                        Some(BudgetApiError::Timeout { .. }) => {
                            warn!(
                                "loading budget '{sync_id}' timed out, shutting the \
                                 session down so the next call starts clean"
                            );
                            self.shutdown().await;
                            return Err(err);
                        }
                        Some(BudgetApiError::LocalBudgetMissing) if !restarted => {
                            warn!(
                                "local directory for budget '{sync_id}' is missing, \
                                 restarting the session and retrying once"
                            );
                            restarted = true;
                            self.shutdown().await;
                            self.init().await?;
                            continue;
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
    }

    async fn load_once(&self, sync_id: &str, e2e_password: Option<&str>) -> Result<()> {
        // init() already downloaded every configured budget, so finding no
        // directory here means the sync id was never synced to this machine.
        let scan = scan_budget_dirs(&self.data_dir, sync_id).await?;
        let Some(found) = scan.matched else {
            return Err(not_found_error(scan, sync_id, &self.data_dir));
        };
        debug!(
            "budget {sync_id} resolves to local directory '{}' (local id {})",
            found.dir_name, found.local_id
        );

        self.timed(
            "downloadBudget",
            self.api.download_budget(sync_id, e2e_password),
        )
        .await?;

        // The download may rotate the local id inside metadata.json.
        let scan = scan_budget_dirs(&self.data_dir, sync_id).await?;
        let Some(found) = scan.matched else {
            return Err(BudgetApiError::LocalBudgetMissing.into());
        };

        self.timed("loadBudget", self.api.load_budget(&found.local_id))
            .await?;
        self.timed("sync", self.api.sync()).await?;
        Ok(())
    }

    pub async fn accounts(&self) -> Result<Vec<BudgetAccount>> {
        self.require_loaded("getAccounts")?;
        self.timed("getAccounts", self.api.accounts()).await
    }

    pub async fn transactions(
        &self,
        account_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<BudgetTransaction>> {
        self.require_loaded("getTransactions")?;
        self.timed(
            "getTransactions",
            self.api.transactions(account_id, from, to),
        )
        .await
    }

    /// Sends a batch to the budget service. Records without an import id get
    /// a generated one and duplicate ids within the batch are dropped, first
    /// occurrence wins. Per-record errors are logged, not raised.
    pub async fn import_transactions(
        &self,
        account_id: &str,
        mut records: Vec<BudgetTransaction>,
    ) -> Result<ImportOutcome> {
        self.require_loaded("importTransactions")?;
        for record in &mut records {
            if record.imported_id.is_none() {
                record.imported_id = Some(format!("{GENERATED_ID_PREFIX}{}", Uuid::new_v4()));
            }
        }
        let before = records.len();
        let mut seen: HashSet<String> = HashSet::new();
        records.retain(|record| match &record.imported_id {
            Some(id) => seen.insert(id.clone()),
            None => true,
        });
        if records.len() < before {
            warn!(
                "dropped {} records with duplicate import ids from the batch",
                before - records.len()
            );
        }
        let outcome = self
            .timed(
                "importTransactions",
                self.api.import_transactions(account_id, records),
            )
            .await?;
        for error in &outcome.errors {
            warn!("budget server rejected a record: {}", error.message);
        }
        Ok(outcome)
    }

    /// Tears the session down. Always succeeds from the caller's
    /// perspective: benign errors, timeouts, and anything else the SDK
    /// reports are logged and discarded.
    pub async fn shutdown(&mut self) {
        if self.state == SessionState::Uninitialized {
            return;
        }
        let result = {
            let _quiet = QuietOutput::new(self.api.as_ref());
            tokio::time::timeout(SHUTDOWN_TIMEOUT, self.api.shutdown()).await
        };
        match result {
            Ok(Ok(())) => debug!("budget session shut down"),
            Ok(Err(err)) if BudgetApiError::is_benign_shutdown(&err) => {
                warn!("ignoring benign shutdown error: {err}");
            }
            Ok(Err(err)) => warn!("shutdown reported an error, discarding it: {err:#}"),
            Err(_) => warn!(
                "shutdown did not finish within {}s, abandoning it",
                SHUTDOWN_TIMEOUT.as_secs()
            ),
        }
        self.state = SessionState::Uninitialized;
    }

    async fn download_with_retry(&mut self, budget: &BudgetConfig) -> Result<()> {
        let mut retried = false;
        loop {
            let attempt = self
                .timed(
                    "downloadBudget",
                    self.api
                        .download_budget(&budget.sync_id, budget.e2e_password.as_deref()),
                )
                .await;
            match attempt {
                Ok(()) => return Ok(()),
                Err(err) if !retried && is_retryable_download(&err) => {
                    warn!(
                        "download of budget '{}' failed ({err:#}), retrying once",
                        budget.name
                    );
                    retried = true;
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!(
                            "Failed to download budget '{}' (sync id {}) from {}",
                            budget.name, budget.sync_id, self.server_url
                        )
                    });
                }
            }
        }
    }

    /// Runs one raw SDK call with the side channel silenced and the
    /// per-server timeout applied. On timeout the logical wait is abandoned;
    /// the underlying call is not interrupted at the transport level.
    async fn timed<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let _quiet = QuietOutput::new(self.api.as_ref());
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BudgetApiError::Timeout {
                operation,
                secs: self.timeout.as_secs(),
            }
            .into()),
        }
    }

    fn require_loaded(&self, operation: &str) -> Result<()> {
        match &self.state {
            SessionState::Loaded(_) => Ok(()),
            state => bail!("'{operation}' requires a loaded budget (session is {state:?})"),
        }
    }
}

/// Credential and file-not-found failures are terminal; everything else is
/// worth one more attempt at init time.
fn is_retryable_download(err: &crate::Error) -> bool {
    !matches!(
        err.downcast_ref::<BudgetApiError>(),
        Some(BudgetApiError::FileNotFound | BudgetApiError::InvalidPassword { .. })
    )
}

/// Silences the SDK's console side channel for a scope. Restores it on every
/// exit path via `Drop`.
struct QuietOutput<'a> {
    api: &'a dyn BudgetApi,
}

impl<'a> QuietOutput<'a> {
    fn new(api: &'a dyn BudgetApi) -> Self {
        api.silence_output();
        Self { api }
    }
}

impl Drop for QuietOutput<'_> {
    fn drop(&mut self) {
        self.api.restore_output();
    }
}

/// The `{id, groupId}` pairing the SDK writes into each local budget
/// directory. Read-only from our side.
#[derive(Debug, Deserialize)]
struct BudgetMetadata {
    id: String,
    #[serde(rename = "groupId")]
    group_id: String,
}

#[derive(Debug)]
struct FoundBudgetDir {
    dir_name: String,
    local_id: String,
}

#[derive(Debug, Default)]
struct DirScan {
    matched: Option<FoundBudgetDir>,
    considered: Vec<String>,
    mismatches: Vec<String>,
}

/// Scans the data root for a directory whose metadata groupId matches the
/// sync id. Corrupt or unreadable metadata files are skipped, and the scan
/// is capped at [`MAX_DIR_SCAN`] directories.
async fn scan_budget_dirs(data_dir: &Path, sync_id: &str) -> Result<DirScan> {
    let mut scan = DirScan::default();
    let mut entries = tokio::fs::read_dir(data_dir)
        .await
        .with_context(|| format!("Unable to read data directory {}", data_dir.display()))?;
    let mut skipped = 0usize;
    while let Some(entry) = entries.next_entry().await? {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }
        if scan.considered.len() >= MAX_DIR_SCAN {
            skipped += 1;
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        scan.considered.push(dir_name.clone());
        let metadata_path = entry.path().join("metadata.json");
        let content = match tokio::fs::read_to_string(&metadata_path).await {
            Ok(content) => content,
            Err(err) => {
                debug!("skipping '{dir_name}': cannot read metadata.json ({err})");
                continue;
            }
        };
        let metadata: BudgetMetadata = match serde_json::from_str(&content) {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!("skipping '{dir_name}': corrupt metadata.json ({err})");
                continue;
            }
        };
        if metadata.group_id == sync_id {
            scan.matched = Some(FoundBudgetDir {
                dir_name,
                local_id: metadata.id,
            });
            break;
        }
        scan.mismatches.push(format!(
            "'{dir_name}': groupId '{}' does not match requested syncId '{sync_id}'",
            metadata.group_id
        ));
    }
    if skipped > 0 {
        warn!(
            "more than {MAX_DIR_SCAN} budget directories under {}, skipped {skipped}",
            data_dir.display()
        );
    }
    Ok(scan)
}

fn not_found_error(scan: DirScan, sync_id: &str, data_dir: &Path) -> crate::Error {
    let mismatches = if scan.mismatches.is_empty() {
        String::new()
    } else {
        format!("Mismatches: {}. ", scan.mismatches.join("; "))
    };
    anyhow::anyhow!(
        "No local budget directory matches sync id '{sync_id}' under {root}. \
         Directories considered: [{dirs}]. {mismatches}Open the budget in the \
         desktop client and let it sync, then retry.",
        root = data_dir.display(),
        dirs = scan.considered.join(", "),
    )
}
