use clap::Parser;
use moneysync::args::{Args, Command};
use moneysync::{commands, Config, Mode, Result};
use std::process::ExitCode;
use tracing::{debug, error, trace};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log_level = args.common().log_level();
    init_logger(log_level);
    debug!("Log level set to {}", log_level.to_string().to_lowercase());

    match main_inner(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Exiting with error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

pub async fn main_inner(args: Args) -> Result<()> {
    trace!("{args:?}");

    // This allows for exercising the program without a ledger application or
    // budget server. When --demo is passed or MONEYSYNC_DEMO is set and
    // non-zero in length, the mode will be Mode::Demo with built-in data,
    // otherwise it will be Mode::Live.
    let mode = if args.common().demo() {
        Mode::Demo
    } else {
        Mode::from_env()
    };
    let config = match mode {
        Mode::Demo => Config::demo(),
        Mode::Live => Config::load(args.common().config()).await?,
    };

    let _: () = match args.command() {
        Command::Sync(sync_args) => commands::sync(config, mode, sync_args).await?.print(),

        Command::Accounts(accounts_args) => {
            commands::accounts(config, mode, accounts_args).await?.print()
        }
    };
    Ok(())
}

/// Initializes the tracing subscriber.
pub fn init_logger(level: LevelFilter) {
    let filter = match std::env::var("RUST_LOG").ok() {
        Some(_) => {
            // RUST_LOG exists; use it.
            EnvFilter::from_default_env()
        }
        None => {
            // RUST_LOG does not exist; use default log level for this crate only.
            EnvFilter::new(format!(
                "{}={},{}={}",
                env!("CARGO_CRATE_NAME"),
                level,
                env!("CARGO_BIN_NAME"),
                level
            ))
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
