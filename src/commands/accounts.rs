//! The `accounts` command: show the account listings on both sides and how
//! the configured mapping resolves against them.

use crate::accounts::{find_budget_account, find_ledger_account};
use crate::api::BudgetSession;
use crate::args::AccountsArgs;
use crate::commands::{clients, Out};
use crate::{Config, Mode, Result};
use anyhow::bail;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize)]
pub struct MappingReport {
    pub budget: String,
    pub entries: Vec<EntryReport>,
    pub unmapped_ledger_accounts: Vec<String>,
    pub unmapped_budget_accounts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    pub ledger_reference: String,
    pub budget_reference: String,
    pub resolved: bool,
    pub source: Option<String>,
    pub destination: Option<String>,
}

pub async fn accounts(
    config: Config,
    mode: Mode,
    args: &AccountsArgs,
) -> Result<Out<Vec<MappingReport>>> {
    let clients = clients(&config, mode)?;
    let mut session = BudgetSession::new(clients.budget.clone(), &config);
    let result = reports(&config, &mut session, clients.ledger.as_ref(), args).await;
    session.shutdown().await;
    let reports = result?;
    let resolved: usize = reports
        .iter()
        .flat_map(|r| &r.entries)
        .filter(|e| e.resolved)
        .count();
    let total: usize = reports.iter().map(|r| r.entries.len()).sum();
    Ok(Out::new(
        format!("{resolved} of {total} mapping entries resolve"),
        reports,
    ))
}

async fn reports(
    config: &Config,
    session: &mut BudgetSession,
    ledger: &dyn crate::api::LedgerClient,
    args: &AccountsArgs,
) -> Result<Vec<MappingReport>> {
    let mut reports = Vec::new();
    let ledger_accounts = ledger.accounts().await?;
    for budget in &config.budgets {
        if let Some(name) = args.budget() {
            if name != budget.name {
                continue;
            }
        }
        session.load_budget(&budget.sync_id).await?;
        let budget_accounts = session.accounts().await?;

        let mut entries = Vec::new();
        let mut mapped_sources = HashSet::new();
        let mut mapped_destinations = HashSet::new();
        for entry in &budget.accounts {
            let source = find_ledger_account(&ledger_accounts, &entry.ledger);
            let destination = find_budget_account(&budget_accounts, &entry.budget);
            if !args.accounts().is_empty() {
                let selected = args.accounts().iter().any(|reference| {
                    reference == &entry.ledger
                        || reference == &entry.budget
                        || source
                            .map(|a| {
                                find_ledger_account(std::slice::from_ref(a), reference).is_some()
                            })
                            .unwrap_or(false)
                        || destination
                            .map(|a| {
                                find_budget_account(std::slice::from_ref(a), reference).is_some()
                            })
                            .unwrap_or(false)
                });
                if !selected {
                    continue;
                }
            }
            if let Some(source) = source {
                mapped_sources.insert(source.id.clone());
            }
            if let Some(destination) = destination {
                mapped_destinations.insert(destination.id.clone());
            }
            entries.push(EntryReport {
                ledger_reference: entry.ledger.clone(),
                budget_reference: entry.budget.clone(),
                resolved: source.is_some() && destination.is_some(),
                source: source.map(|a| format!("{} ({})", a.name, a.id)),
                destination: destination.map(|a| format!("{} ({})", a.name, a.id)),
            });
        }
        reports.push(MappingReport {
            budget: budget.name.clone(),
            entries,
            unmapped_ledger_accounts: ledger_accounts
                .iter()
                .filter(|a| !mapped_sources.contains(&a.id))
                .map(|a| format!("{} ({})", a.name, a.id))
                .collect(),
            unmapped_budget_accounts: budget_accounts
                .iter()
                .filter(|a| !mapped_destinations.contains(&a.id))
                .map(|a| format!("{} ({})", a.name, a.id))
                .collect(),
        });
    }
    if reports.is_empty() {
        bail!(
            "no configured budget is named '{}'",
            args.budget().unwrap_or_default()
        );
    }
    Ok(reports)
}
