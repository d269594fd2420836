//! Command handlers for the moneysync CLI.
//!
//! This module contains implementations for all CLI subcommands.

mod accounts;
mod sync;

use crate::api::{BudgetApi, DemoBudget, DemoLedger, LedgerClient, PayeeRewriter};
use crate::{Config, Mode, Result};
use anyhow::bail;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info};

pub use accounts::{accounts, EntryReport, MappingReport};
pub use sync::{sync, BudgetRun};

/// The output type for a command. This allows the command to return a
/// consistent message and, optionally, structured data.
#[derive(Debug, Clone, Serialize)]
pub struct Out<T>
where
    T: Serialize + Clone + Debug,
{
    /// A message that can be printed to the user regarding the outcome of the
    /// command execution.
    message: String,

    /// Any structured data that needs to be output from the call.
    structure: Option<T>,
}

impl<T, S> From<S> for Out<T>
where
    T: Debug + Clone + Serialize,
    S: Into<String>,
{
    fn from(value: S) -> Self {
        Out::new_message(value)
    }
}

impl<T> Out<T>
where
    T: Serialize + Clone + Debug,
{
    /// Create a new `Out` object that has `Some(structure)`.
    pub fn new<S>(message: S, structure: T) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            structure: Some(structure),
        }
    }

    /// Create a new `Out` object that has `None` for `structure`.
    pub fn new_message<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            structure: None,
        }
    }

    /// Get the `message`.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the structured data stored in `structure`.
    pub fn structure(&self) -> Option<&T> {
        self.structure.as_ref()
    }

    /// Print the message to `info!` and the structured data (if it exists) as
    /// JSON to `debug!`.
    pub fn print(&self) {
        info!("{}", self.message);
        if let Some(structure) = self.structure() {
            if let Ok(json) = serde_json::to_string_pretty(structure) {
                debug!("Command output:\n\n{json}\n\n");
            }
        }
    }
}

/// The collaborators a command talks to. In demo mode these are the built-in
/// in-process doubles; bridges to a real ledger application and budget
/// server are not bundled with this binary.
pub(crate) struct Clients {
    pub ledger: Arc<dyn LedgerClient>,
    pub budget: Arc<dyn BudgetApi>,
    pub rewriter: Option<Arc<dyn PayeeRewriter>>,
}

pub(crate) fn clients(config: &Config, mode: Mode) -> Result<Clients> {
    match mode {
        Mode::Demo => Ok(Clients {
            ledger: Arc::new(DemoLedger::seeded()),
            budget: Arc::new(DemoBudget::seeded(&config.password)),
            rewriter: None,
        }),
        Mode::Live => bail!(
            "no bridge to a ledger application is bundled with this binary; run with --demo \
             (or MONEYSYNC_DEMO=1) to exercise the import against built-in demo data"
        ),
    }
}
