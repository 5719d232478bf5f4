//! Ledger administration commands: grant, entries, limit adjust, detach,
//! summary.
//!
//! Each command runs one ledger operation against the local database and
//! prints either a styled summary or, with `--json`, the raw result.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde::Serialize;
use tally_core::ledger::CreditLedger;
use tally_observe::attrs::SPAN_LEDGER_ADMIN;
use tally_types::ledger::{CreditGrant, CreditSnapshot};
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::cli::{CreditsCommand, LimitCommand};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_snapshot(snapshot: &CreditSnapshot) {
    println!("  Pool balance:     {}", style(snapshot.pool_balance).bold());
    println!("  Allocated:        {}", snapshot.allocated_total);
    println!("  Unallocated:      {}", snapshot.unallocated_balance);
}

pub async fn handle_credits_command<L: CreditLedger>(cmd: CreditsCommand, ledger: &L, json: bool) -> Result<()> {
    match cmd {
        CreditsCommand::Grant {
            company,
            amount,
            user,
            reason,
            key,
        } => {
            let grant = CreditGrant {
                company_id: company,
                user_id: user,
                amount,
                reason,
                idempotency_key: key,
            };
            grant_credits(ledger, &grant, json).await
        }
        CreditsCommand::Entries { company, limit } => list_entries(ledger, &company, limit, json).await,
    }
}

pub async fn handle_limit_command<L: CreditLedger>(cmd: LimitCommand, ledger: &L, json: bool) -> Result<()> {
    match cmd {
        LimitCommand::Adjust { company, user, delta } => adjust_limit(ledger, &company, &user, delta, json).await,
    }
}

async fn grant_credits<L: CreditLedger>(ledger: &L, grant: &CreditGrant, json: bool) -> Result<()> {
    let span = info_span!(SPAN_LEDGER_ADMIN, op = "grant", company_id = %grant.company_id);
    let entry = ledger.grant_credits(grant).instrument(span.clone()).await?;
    let balance = ledger.pool_balance(&grant.company_id).instrument(span.clone()).await?;
    span.in_scope(|| info!(delta = entry.delta, key = %entry.idempotency_key, "credits granted"));

    if json {
        return print_json(&serde_json::json!({ "entry": entry, "pool_balance": balance }));
    }

    println!();
    println!(
        "  {} {} credits to company {} ({})",
        style("✓").green().bold(),
        style(format!("{:+}", entry.delta)).bold(),
        style(entry.company_id).cyan(),
        entry.reason
    );
    println!("  Idempotency key:  {}", style(&entry.idempotency_key).dim());
    println!("  Pool balance:     {}", style(balance).bold());
    println!();
    Ok(())
}

async fn list_entries<L: CreditLedger>(ledger: &L, company: &Uuid, limit: i64, json: bool) -> Result<()> {
    let entries = ledger.list_entries(company, limit).await?;

    if json {
        return print_json(&entries);
    }

    if entries.is_empty() {
        println!();
        println!(
            "  {} No ledger rows for company {}. Add credits with: {}",
            style("i").blue().bold(),
            style(company).cyan(),
            style(format!("tally credits grant {company} 100")).yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("When").fg(Color::White),
        Cell::new("Delta").fg(Color::White),
        Cell::new("Reason").fg(Color::White),
        Cell::new("User").fg(Color::White),
        Cell::new("Key").fg(Color::White),
    ]);

    for entry in &entries {
        let delta_color = if entry.delta < 0 { Color::Red } else { Color::Green };
        table.add_row(vec![
            Cell::new(entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string()).fg(Color::DarkGrey),
            Cell::new(format!("{:+}", entry.delta)).fg(delta_color),
            Cell::new(&entry.reason),
            Cell::new(entry.user_id.map(|u| u.to_string()).unwrap_or_else(|| "-".to_string())),
            Cell::new(&entry.idempotency_key).fg(Color::Cyan),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} row{}",
        style(entries.len()).bold(),
        if entries.len() == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

async fn adjust_limit<L: CreditLedger>(ledger: &L, company: &Uuid, user: &Uuid, delta: i64, json: bool) -> Result<()> {
    let span = info_span!(SPAN_LEDGER_ADMIN, op = "limit_adjust", company_id = %company, user_id = %user);
    let adjustment = ledger
        .apply_user_limit_delta(company, user, delta)
        .instrument(span.clone())
        .await?;
    span.in_scope(|| info!(delta, remaining = adjustment.remaining_credits, "limit adjusted"));

    if json {
        return print_json(&adjustment);
    }

    println!();
    println!(
        "  {} User {} now holds {} credits",
        style("✓").green().bold(),
        style(adjustment.user_id).cyan(),
        style(adjustment.remaining_credits).bold()
    );
    print_snapshot(&adjustment.snapshot);
    println!();
    Ok(())
}

pub async fn detach_user<L: CreditLedger>(ledger: &L, company: &Uuid, user: &Uuid, json: bool) -> Result<()> {
    let span = info_span!(SPAN_LEDGER_ADMIN, op = "detach", company_id = %company, user_id = %user);
    let outcome = ledger.detach_user(company, user).instrument(span.clone()).await?;
    span.in_scope(|| info!(released = outcome.released_limit, "user detached"));

    if json {
        return print_json(&outcome);
    }

    println!();
    println!(
        "  {} Detached {} (was {}); released {} credits",
        style("✓").green().bold(),
        style(outcome.user_id).cyan(),
        outcome.previous_role,
        style(outcome.released_limit).bold()
    );
    println!();
    Ok(())
}

pub async fn company_summary<L: CreditLedger>(ledger: &L, company: &Uuid, json: bool) -> Result<()> {
    let summary = ledger.company_summary(company).await?;

    if json {
        return print_json(&summary);
    }

    println!();
    println!("  Company {}", style(summary.company_id).cyan().bold());
    print_snapshot(&summary.snapshot);
    println!(
        "  Users:            {} active / {} total",
        summary.active_users, summary.total_users
    );
    println!();
    Ok(())
}
