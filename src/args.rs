//! These structs provide the CLI interface for the moneysync CLI.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

/// moneysync: A command-line tool for importing banking transactions into a
/// budget.
///
/// The purpose of this program is to read the transactions your ledger
/// application has already downloaded from your banks and import them into
/// the accounts of a self-hosted budget server, converting amounts, skipping
/// what was imported before, and keeping the running balance consistent.
///
/// Budgets, account mappings and the server connection are described in a
/// JSON configuration file; see the README at
/// https://github.com/moneysync/moneysync for documentation on how to set
/// this up.
#[derive(Debug, Parser, Clone)]
pub struct Args {
    #[clap(flatten)]
    common: Common,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    pub fn new(common: Common, command: Command) -> Self {
        Self { common, command }
    }

    pub fn common(&self) -> &Common {
        &self.common
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Import transactions from the ledger application into the configured
    /// budgets.
    Sync(SyncArgs),
    /// List the accounts on both sides and how the configuration maps them.
    Accounts(AccountsArgs),
}

/// Arguments common to all subcommands.
#[derive(Debug, Parser, Clone)]
pub struct Common {
    /// The logging verbosity. One of, from least to most verbose:
    /// off, error, warn, info, debug, trace
    ///
    /// This can be overridden by RUST_LOG.
    #[arg(long, default_value_t = LevelFilter::INFO)]
    log_level: LevelFilter,

    /// The path to the configuration file. Defaults to
    /// ~/.config/moneysync/config.json
    #[arg(long, env = "MONEYSYNC_CONFIG", default_value_t = default_config_path())]
    config: DisplayPath,

    /// Run against built-in demo data instead of a real ledger application
    /// and budget server. Also enabled by setting MONEYSYNC_DEMO.
    #[arg(long)]
    demo: bool,
}

impl Common {
    pub fn new(log_level: LevelFilter, config: PathBuf, demo: bool) -> Self {
        Self {
            log_level,
            config: config.into(),
            demo,
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    pub fn config(&self) -> &DisplayPath {
        &self.config
    }

    pub fn demo(&self) -> bool {
        self.demo
    }
}

/// Args for the `moneysync sync` command.
#[derive(Debug, Parser, Clone, Default)]
pub struct SyncArgs {
    /// Only import into the budget with this name. By default every
    /// configured budget is imported.
    #[arg(long)]
    budget: Option<String>,

    /// Only import these accounts, given as id, account number or name.
    /// Repeat the flag for several accounts.
    #[arg(long = "account")]
    accounts: Vec<String>,

    /// The first day of the import window (YYYY-MM-DD). Defaults to one
    /// month before today.
    #[arg(long)]
    from: Option<NaiveDate>,

    /// The last day of the import window (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    to: Option<NaiveDate>,

    /// Compute and show what would be imported without sending anything.
    #[arg(long)]
    dry_run: bool,
}

impl SyncArgs {
    pub fn budget(&self) -> Option<&str> {
        self.budget.as_deref()
    }

    pub fn accounts(&self) -> &[String] {
        &self.accounts
    }

    pub fn from(&self) -> Option<NaiveDate> {
        self.from
    }

    pub fn to(&self) -> Option<NaiveDate> {
        self.to
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }
}

/// Args for the `moneysync accounts` command.
#[derive(Debug, Parser, Clone, Default)]
pub struct AccountsArgs {
    /// Only show the mapping of the budget with this name.
    #[arg(long)]
    budget: Option<String>,

    /// Only show mapping entries for these accounts, given as id, account
    /// number or name. Repeat the flag for several accounts.
    #[arg(long = "account")]
    accounts: Vec<String>,
}

impl AccountsArgs {
    pub fn budget(&self) -> Option<&str> {
        self.budget.as_deref()
    }

    pub fn accounts(&self) -> &[String] {
        &self.accounts
    }
}

fn default_config_path() -> DisplayPath {
    DisplayPath(match dirs::config_dir() {
        Some(config) => config.join("moneysync").join("config.json"),
        None => {
            error!(
                "There was an error when trying to find your configuration directory. You can \
                get around this by providing --config or MONEYSYNC_CONFIG instead of relying on \
                the default configuration path. If you continue using the program right now, you \
                may have problems!",
            );
            PathBuf::from("config.json")
        }
    })
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DisplayPath(PathBuf);

impl From<PathBuf> for DisplayPath {
    fn from(value: PathBuf) -> Self {
        DisplayPath(value)
    }
}

impl Deref for DisplayPath {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<Path> for DisplayPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Display for DisplayPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_string_lossy())
    }
}

impl FromStr for DisplayPath {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(PathBuf::from(s)))
    }
}

impl DisplayPath {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}
