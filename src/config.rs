//! Configuration for moneysync.
//!
//! The configuration file is JSON and describes one budget server plus the
//! budgets under it. Each budget carries its sync id, import policy flags,
//! ignore patterns, and the mapping from ledger account references to budget
//! account references.

use crate::Result;
use anyhow::{bail, Context};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard upper bound for any single remote call.
pub const HARD_MAX_TIMEOUT_SECS: u64 = 300;

/// Used when `timeout_secs` is not configured.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Top-level configuration: one budget server and its budgets.
///
/// Example:
/// ```json
/// {
///   "server_url": "https://budget.example.com",
///   "password": "hunter2",
///   "timeout_secs": 30,
///   "budgets": [
///     {
///       "name": "Household",
///       "sync_id": "c6b1b0c8-1111-2222-3333-444455556666",
///       "earliest_import_date": "2024-02-01",
///       "synchronize_cleared": true,
///       "accounts": [
///         { "ledger": "DE02120300000000202051", "budget": "Checking" }
///       ]
///     }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// URL of the budget server.
    pub server_url: String,

    /// Server password.
    pub password: String,

    /// Where the budget SDK keeps its local budget directories. Defaults to
    /// a `moneysync` directory under the platform data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Per-call timeout for remote operations, clamped to
    /// [`HARD_MAX_TIMEOUT_SECS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    pub budgets: Vec<BudgetConfig>,
}

/// Configuration for one budget under the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetConfig {
    /// Display name, used in log and error messages.
    pub name: String,

    /// The budget service's stable identifier for this budget file. Not the
    /// same as the local on-disk directory name, which may rotate.
    pub sync_id: String,

    /// End-to-end encryption password, when the budget file is encrypted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e2e_password: Option<String>,

    /// Floor for the import window. A requested start date earlier than this
    /// is clamped up to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earliest_import_date: Option<NaiveDate>,

    /// Import transactions that are still pending at the bank.
    #[serde(default)]
    pub import_unchecked: bool,

    /// Mirror the booked flag into the budget service's cleared flag.
    #[serde(default)]
    pub synchronize_cleared: bool,

    /// Run payee names through the normalization service before import.
    #[serde(default)]
    pub rewrite_payees: bool,

    /// Replace payee names in debug logs with pseudonymous tokens.
    #[serde(default)]
    pub mask_payees_in_logs: bool,

    /// A transaction is dropped when any pattern from any of the three lists
    /// is a substring of the respective field.
    #[serde(default)]
    pub ignored_comment_patterns: Vec<String>,
    #[serde(default)]
    pub ignored_payee_patterns: Vec<String>,
    #[serde(default)]
    pub ignored_purpose_patterns: Vec<String>,

    /// Ledger-account reference → budget-account reference. References are
    /// resolved by id, account number (ledger side only), or display name.
    pub accounts: Vec<MappingEntry>,
}

/// One configured account pairing, as reference strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappingEntry {
    pub ledger: String,
    pub budget: String,
}

impl Config {
    /// Loads and validates the configuration from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the parts of the configuration that the schema cannot express.
    /// All problems are reported at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.server_url.trim().is_empty() {
            problems.push("server_url must not be empty".to_string());
        }
        if self.budgets.is_empty() {
            problems.push("at least one budget must be configured".to_string());
        }
        let mut seen_sync_ids = std::collections::HashSet::new();
        for budget in &self.budgets {
            if budget.name.trim().is_empty() {
                problems.push("every budget needs a name".to_string());
            }
            if budget.sync_id.trim().is_empty() {
                problems.push(format!("budget '{}' has an empty sync_id", budget.name));
            } else if !seen_sync_ids.insert(budget.sync_id.as_str()) {
                problems.push(format!(
                    "sync_id '{}' is configured more than once",
                    budget.sync_id
                ));
            }
            if budget.accounts.is_empty() {
                problems.push(format!(
                    "budget '{}' has no account mappings",
                    budget.name
                ));
            }
        }
        if !problems.is_empty() {
            bail!("invalid configuration: {}", problems.join("; "));
        }
        Ok(())
    }

    /// The data root for the budget SDK's local budget directories.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// The configured per-call timeout, clamped to the hard maximum.
    pub fn timeout(&self) -> Duration {
        let secs = self
            .timeout_secs
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(HARD_MAX_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }

    /// The configuration used by `--demo` mode: the built-in demo budget and
    /// ledger accounts, with a throwaway data directory.
    pub fn demo() -> Self {
        Self {
            server_url: "https://demo.budget.invalid".to_string(),
            password: "demo".to_string(),
            data_dir: Some(
                std::env::temp_dir().join(format!("moneysync-demo-{}", uuid::Uuid::new_v4())),
            ),
            timeout_secs: None,
            budgets: vec![BudgetConfig {
                name: "Demo".to_string(),
                sync_id: crate::api::DEMO_SYNC_ID.to_string(),
                e2e_password: None,
                earliest_import_date: None,
                import_unchecked: false,
                synchronize_cleared: true,
                rewrite_payees: false,
                mask_payees_in_logs: false,
                ignored_comment_patterns: Vec::new(),
                ignored_payee_patterns: Vec::new(),
                ignored_purpose_patterns: Vec::new(),
                accounts: vec![
                    MappingEntry {
                        ledger: "Girokonto".to_string(),
                        budget: "Checking".to_string(),
                    },
                    MappingEntry {
                        ledger: "Sparkonto".to_string(),
                        budget: "Savings".to_string(),
                    },
                ],
            }],
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("moneysync")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_budget() -> BudgetConfig {
        BudgetConfig {
            name: "Household".to_string(),
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
            accounts: vec![MappingEntry {
                ledger: "acct-1".to_string(),
                budget: "Checking".to_string(),
            }],
        }
    }

    fn minimal_config() -> Config {
        Config {
            server_url: "https://budget.example.com".to_string(),
            password: "pw".to_string(),
            data_dir: None,
            timeout_secs: None,
            budgets: vec![minimal_budget()],
        }
    }

    #[tokio::test]
    async fn test_load_minimal_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let json = r#"{
            "server_url": "https://budget.example.com",
            "password": "pw",
            "budgets": [
                {
                    "name": "Household",
                    "sync_id": "sync-1",
                    "accounts": [ { "ledger": "a", "budget": "b" } ]
                }
            ]
        }"#;
        tokio::fs::write(&path, json).await.unwrap();
        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.budgets.len(), 1);
        assert!(!config.budgets[0].import_unchecked);
        assert_eq!(config.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = Config::load(dir.path().join("nope.json")).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_timeout_clamped_to_hard_max() {
        let mut config = minimal_config();
        config.timeout_secs = Some(HARD_MAX_TIMEOUT_SECS * 10);
        assert_eq!(
            config.timeout(),
            Duration::from_secs(HARD_MAX_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_validate_aggregates_all_problems() {
        let mut config = minimal_config();
        config.server_url = " ".to_string();
        let mut unnamed = minimal_budget();
        unnamed.name = String::new();
        unnamed.sync_id = String::new();
        let mut no_accounts = minimal_budget();
        no_accounts.name = "Empty".to_string();
        no_accounts.sync_id = "sync-2".to_string();
        no_accounts.accounts.clear();
        config.budgets = vec![unnamed, no_accounts];

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("server_url"));
        assert!(message.contains("needs a name"));
        assert!(message.contains("empty sync_id"));
        assert!(message.contains("no account mappings"));
    }

    #[test]
    fn test_validate_rejects_duplicate_sync_ids() {
        let mut config = minimal_config();
        config.budgets.push(minimal_budget());
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("more than once"));
    }
}
