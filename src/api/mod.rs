//! Trait seams for the three external collaborators: the local ledger
//! application, the remote budget SDK, and the optional payee normalization
//! service. Production bridges and the in-memory demo implementations both
//! plug in behind these traits.

mod demo;
mod session;

pub use demo::{DemoBudget, DemoLedger, DEMO_SYNC_ID};
pub use session::BudgetSession;

use crate::model::{
    BudgetAccount, BudgetTransaction, ImportOutcome, LedgerAccount, LedgerTransaction,
};
use crate::Result;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Query parameters for a ledger transaction export.
#[derive(Debug, Clone)]
pub struct TransactionQuery {
    /// Inclusive.
    pub from: NaiveDate,
    /// Inclusive.
    pub to: NaiveDate,
    /// Restrict the export to one account.
    pub account_id: Option<String>,
}

/// Read-only access to the local personal-finance ledger application.
#[async_trait::async_trait]
pub trait LedgerClient: Send + Sync {
    /// True when the ledger database is locked and cannot be exported from.
    async fn is_locked(&self) -> Result<bool>;

    async fn accounts(&self) -> Result<Vec<LedgerAccount>>;

    async fn transactions(&self, query: &TransactionQuery) -> Result<Vec<LedgerTransaction>>;
}

/// Facade over the remote budget SDK. Calls here are raw: timeouts, retry,
/// and error translation live in [`BudgetSession`], which is the only caller.
#[async_trait::async_trait]
pub trait BudgetApi: Send + Sync {
    async fn init(&self, data_dir: &Path, server_url: &str, password: &str) -> Result<()>;

    async fn download_budget(&self, sync_id: &str, e2e_password: Option<&str>) -> Result<()>;

    /// Loads a budget by its *local* directory id, not its sync id.
    async fn load_budget(&self, local_id: &str) -> Result<()>;

    async fn sync(&self) -> Result<()>;

    async fn accounts(&self) -> Result<Vec<BudgetAccount>>;

    async fn transactions(
        &self,
        account_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<BudgetTransaction>>;

    async fn import_transactions(
        &self,
        account_id: &str,
        records: Vec<BudgetTransaction>,
    ) -> Result<ImportOutcome>;

    async fn shutdown(&self) -> Result<()>;

    /// The SDK writes progress noise directly to the console. These toggle
    /// that side channel; the session holds them in an RAII guard.
    fn silence_output(&self);
    fn restore_output(&self);
}

/// Optional payee-name normalization service.
#[async_trait::async_trait]
pub trait PayeeRewriter: Send + Sync {
    /// Returns canonical names keyed by input name, or `None` when the
    /// service declined to produce a mapping. Callers fall back to the
    /// original names in either failure mode.
    async fn transform_payees(&self, names: &[String]) -> Result<Option<HashMap<String, String>>>;
}

/// Typed failures from the budget service, carried inside `anyhow::Error`
/// and recovered with `downcast_ref` where behavior branches on them.
#[derive(Debug, Error)]
pub enum BudgetApiError {
    /// A remote call exceeded its configured bound. The in-flight call is
    /// abandoned, not interrupted at the transport level.
    #[error("remote operation '{operation}' timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    /// The SDK's local cache for a budget is missing or stale. Recoverable
    /// by a full session restart; see [`BudgetSession::load_budget`].
    #[error("local budget directory is missing")]
    LocalBudgetMissing,

    /// The budget file does not exist on the server. Terminal.
    #[error("budget file not found on the server")]
    FileNotFound,

    /// The server rejected the configured password. Terminal.
    #[error("server '{server}' rejected the configured password")]
    InvalidPassword { server: String },

    /// Shutdown-time error meaning nothing was open to close. Benign.
    #[error("no database connection to close")]
    NoConnectionToClose,
}

impl BudgetApiError {
    /// True for shutdown errors that mean shutdown had nothing to do.
    pub fn is_benign_shutdown(err: &crate::Error) -> bool {
        if matches!(
            err.downcast_ref::<BudgetApiError>(),
            Some(BudgetApiError::NoConnectionToClose)
        ) {
            return true;
        }
        // Bridges that stringify SDK errors lose the type; match the class
        // of message instead.
        err.to_string()
            .to_lowercase()
            .contains("no database connection")
    }
}
