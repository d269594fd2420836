mod accounts;
mod api;
pub mod args;
pub mod commands;
mod config;
mod error;
mod importer;
pub mod model;
mod reconcile;

pub use api::{
    BudgetApi, BudgetApiError, BudgetSession, LedgerClient, PayeeRewriter, TransactionQuery,
};
pub use config::{BudgetConfig, Config, MappingEntry};
pub use error::Error;
pub use error::Result;

/// Whether commands talk to the built-in demo data or expect real
/// collaborators. When MONEYSYNC_DEMO is set and non-zero in length, the
/// mode is `Mode::Demo`, otherwise it is `Mode::Live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    Demo,
}

impl Mode {
    pub fn from_env() -> Self {
        match std::env::var("MONEYSYNC_DEMO") {
            Ok(value) if !value.is_empty() => Mode::Demo,
            _ => Mode::Live,
        }
    }
}
