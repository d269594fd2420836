//! The `sync` command: one import run across the configured budgets.

use crate::accounts::AccountMap;
use crate::api::BudgetSession;
use crate::args::SyncArgs;
use crate::commands::{clients, Out};
use crate::config::BudgetConfig;
use crate::importer::{ImportRequest, ImportSummary, Importer};
use crate::{Config, Mode, Result};
use anyhow::bail;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// The result of one budget's import within a run.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetRun {
    pub budget: String,
    pub added: usize,
    pub updated: usize,
    pub rejected: usize,
    pub dry_run: bool,
}

pub async fn sync(config: Config, mode: Mode, args: &SyncArgs) -> Result<Out<Vec<BudgetRun>>> {
    let budgets: Vec<BudgetConfig> = config
        .budgets
        .iter()
        .filter(|b| args.budget().map(|name| name == b.name).unwrap_or(true))
        .cloned()
        .collect();
    if budgets.is_empty() {
        bail!(
            "no configured budget is named '{}'",
            args.budget().unwrap_or_default()
        );
    }

    let clients = clients(&config, mode)?;
    let mut session = BudgetSession::new(clients.budget.clone(), &config);
    let account_refs = (!args.accounts().is_empty()).then(|| args.accounts().to_vec());
    let request = ImportRequest {
        account_refs,
        from: args.from(),
        to: args.to(),
        dry_run: args.dry_run(),
    };

    let mut runs = Vec::new();
    let mut failure = None;
    for budget in &budgets {
        info!("importing into budget '{}'", budget.name);
        let result = run_budget(
            &mut session,
            budget,
            clients.ledger.clone(),
            clients.rewriter.clone(),
            &request,
        )
        .await;
        match result {
            Ok(summary) => runs.push(BudgetRun {
                budget: budget.name.clone(),
                added: summary.accounts.iter().map(|a| a.added).sum(),
                updated: summary.accounts.iter().map(|a| a.updated).sum(),
                rejected: summary.accounts.iter().map(|a| a.rejected).sum(),
                dry_run: summary.dry_run,
            }),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    session.shutdown().await;
    if let Some(err) = failure {
        return Err(err);
    }

    let added: usize = runs.iter().map(|r| r.added).sum();
    let message = if args.dry_run() {
        format!("Dry run finished across {} budget(s)", runs.len())
    } else {
        format!("Imported {added} record(s) into {} budget(s)", runs.len())
    };
    Ok(Out::new(message, runs))
}

async fn run_budget(
    session: &mut BudgetSession,
    budget: &BudgetConfig,
    ledger: Arc<dyn crate::api::LedgerClient>,
    rewriter: Option<Arc<dyn crate::api::PayeeRewriter>>,
    request: &ImportRequest,
) -> Result<ImportSummary> {
    session.load_budget(&budget.sync_id).await?;
    let mut map = AccountMap::new(budget, ledger.clone());
    map.load(session, request.account_refs.as_deref()).await?;
    let importer = Importer::new(budget.clone(), ledger, rewriter);
    importer.import_transactions(session, &map, request).await
}
