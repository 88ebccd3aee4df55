//! Migrate command - plan, apply, revert and inspect schema migrations

use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use clap::Subcommand;
use colored::Colorize;
use dialoguer::Confirm;
use serde::Serialize;

use super::{get_context, Location};
use crate::output;
use finledger_core::{Error, LedgerContext, MigrationState, MigrationStatus, MigrationUnit};

#[derive(Subcommand)]
pub enum MigrateCommands {
    /// Apply pending migrations
    Up {
        /// Stop after this version (inclusive)
        #[arg(long)]
        to: Option<String>,
        /// Show what would be applied without applying it
        #[arg(long)]
        dry_run: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show every known and recorded version
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Revert the newest applied migration
    Down {
        /// Skip confirmation prompt (required with --json)
        #[arg(long, short)]
        force: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Verify checksums of applied migrations and lint SQL steps
    Check {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the migration event log
    Log {
        /// Number of entries to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Show only errors
        #[arg(long)]
        errors: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete old event log entries
    ClearLog {
        /// Delete entries older than N days
        #[arg(long, default_value = "30")]
        older_than_days: u64,
        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// JSON shape of a planned unit
#[derive(Serialize)]
struct PlannedUnit {
    version: String,
    name: String,
    reversible: bool,
}

impl From<&MigrationUnit> for PlannedUnit {
    fn from(unit: &MigrationUnit) -> Self {
        Self {
            version: unit.version().to_string(),
            name: unit.name().to_string(),
            reversible: unit.is_reversible(),
        }
    }
}

pub fn run(location: &Location, command: MigrateCommands) -> Result<()> {
    let ctx = get_context(location)?;

    match command {
        MigrateCommands::Up { to, dry_run, json } => {
            ctx.log_command("migrate up");
            if dry_run {
                plan(&ctx, to.as_deref(), json)
            } else {
                up(&ctx, to.as_deref(), json)
            }
        }
        MigrateCommands::Status { json } => {
            ctx.log_command("migrate status");
            status(&ctx, json)
        }
        MigrateCommands::Down { force, json } => {
            ctx.log_command("migrate down");
            down(&ctx, force, json)
        }
        MigrateCommands::Check { json } => {
            ctx.log_command("migrate check");
            check(&ctx, json)
        }
        MigrateCommands::Log { limit, errors, json } => log(&ctx, limit, errors, json),
        MigrateCommands::ClearLog {
            older_than_days,
            force,
            json,
        } => clear_log(&ctx, older_than_days, force, json),
    }
}

fn exit_failed() -> ! {
    std::process::exit(1)
}

fn plan(ctx: &LedgerContext, to: Option<&str>, json: bool) -> Result<()> {
    let units = match to {
        Some(target) => ctx.plan_to(target),
        None => ctx.plan(),
    };
    let pending = units.map(|units| units.iter().map(PlannedUnit::from).collect::<Vec<_>>());

    if json {
        if !output::print_json(pending)? {
            exit_failed();
        }
        return Ok(());
    }

    let pending = pending?;
    if pending.is_empty() {
        output::success("Schema is up to date");
        return Ok(());
    }

    let mut table = output::create_table();
    table.set_header(vec!["Version", "Name", "Reversible"]);
    for unit in &pending {
        table.add_row(vec![
            unit.version.clone(),
            unit.name.clone(),
            if unit.reversible { "yes" } else { "no" }.to_string(),
        ]);
    }
    println!("{}", table);
    output::info(&format!("{} migration(s) would be applied", pending.len()));

    Ok(())
}

fn up(ctx: &LedgerContext, to: Option<&str>, json: bool) -> Result<()> {
    let result = match to {
        Some(target) => ctx.migrate_to(target),
        None => ctx.migrate(),
    };

    if json {
        if !output::print_json(result)? {
            exit_failed();
        }
        return Ok(());
    }

    let result = result?;
    if result.applied.is_empty() {
        output::success("Schema is up to date");
        return Ok(());
    }

    for record in &result.applied {
        println!("  {} {}", "✓".green(), record.version);
    }
    output::success(&format!(
        "Applied {} migration(s) ({} already applied)",
        result.applied.len(),
        result.already_applied
    ));

    Ok(())
}

fn state_label(state: &MigrationState) -> String {
    match state {
        MigrationState::Applied { .. } => "applied".green().to_string(),
        MigrationState::Pending => "pending".yellow().to_string(),
        MigrationState::Drifted { .. } => "drifted".red().to_string(),
        MigrationState::Unknown { .. } => "unknown".magenta().to_string(),
    }
}

fn applied_at(state: &MigrationState) -> String {
    match state {
        MigrationState::Applied { applied_at }
        | MigrationState::Drifted { applied_at, .. }
        | MigrationState::Unknown { applied_at } => output::format_time(applied_at),
        MigrationState::Pending => String::new(),
    }
}

fn status_table(statuses: &[MigrationStatus]) -> comfy_table::Table {
    let mut table = output::create_table();
    table.set_header(vec!["Version", "Name", "State", "Applied at", "Reversible"]);
    for status in statuses {
        table.add_row(vec![
            status.version.clone(),
            status.name.clone().unwrap_or_default(),
            state_label(&status.state),
            applied_at(&status.state),
            if status.reversible { "yes" } else { "no" }.to_string(),
        ]);
    }
    table
}

fn status(ctx: &LedgerContext, json: bool) -> Result<()> {
    let statuses = ctx.status();

    if json {
        if !output::print_json(statuses)? {
            exit_failed();
        }
        return Ok(());
    }

    let statuses = statuses?;
    if statuses.is_empty() {
        output::info("No migrations known");
        return Ok(());
    }

    println!("{}", "Schema Migrations".bold());
    println!("{}", status_table(&statuses));

    let pending = statuses
        .iter()
        .filter(|s| s.state == MigrationState::Pending)
        .count();
    if pending > 0 {
        output::warning(&format!("{} pending migration(s); run `fl migrate up`", pending));
    }

    Ok(())
}

/// `--json` output cannot be combined with an interactive prompt
fn unattended_revert(force: bool, json: bool) -> finledger_core::Result<()> {
    if json && !force {
        return Err(Error::validation(
            "reverting with --json needs --force; there is no prompt to confirm",
        ));
    }
    Ok(())
}

fn down(ctx: &LedgerContext, force: bool, json: bool) -> Result<()> {
    if let Err(e) = unattended_revert(force, json) {
        output::print_json::<()>(Err(e))?;
        exit_failed();
    }

    if !force {
        let statuses = ctx.status()?;
        let Some(newest) = statuses
            .iter()
            .rev()
            .find(|s| s.state != MigrationState::Pending)
        else {
            output::info("Nothing to revert");
            return Ok(());
        };

        println!(
            "\n{}",
            format!(
                "This will revert {} {}.",
                newest.version,
                newest.name.as_deref().unwrap_or("(unknown)")
            )
            .yellow()
        );
        println!("{}\n", "Data in dropped tables or columns is lost.".dimmed());

        if !Confirm::new()
            .with_prompt("Are you sure?")
            .default(false)
            .interact()?
        {
            println!("{}\n", "Cancelled".dimmed());
            return Ok(());
        }
    }

    let reverted = ctx.revert_last();

    if json {
        if !output::print_json(reverted)? {
            exit_failed();
        }
        return Ok(());
    }

    match reverted? {
        Some(version) => output::success(&format!("Reverted {}", version)),
        None => output::info("Nothing to revert"),
    }
    Ok(())
}

fn check(ctx: &LedgerContext, json: bool) -> Result<()> {
    let report = ctx.check();

    if json {
        let clean = report.as_ref().map(|r| r.is_clean()).unwrap_or(false);
        if !output::print_json(report)? || !clean {
            exit_failed();
        }
        return Ok(());
    }

    let report = report?;

    if !report.lint.is_empty() {
        println!("{}", "Lint".bold());
        let mut table = output::create_table();
        table.set_header(vec!["Version", "Direction", "Step", "Message"]);
        for issue in &report.lint {
            table.add_row(vec![
                issue.version.clone(),
                issue.direction.to_string(),
                issue.step.to_string(),
                issue.message.clone(),
            ]);
        }
        println!("{}", table);
    }

    if report.is_clean() {
        output::success("All applied migrations match their source");
        return Ok(());
    }

    let mut problems = report.drifted.clone();
    problems.extend(report.unknown.iter().cloned());
    println!("{}", status_table(&problems));

    Err(anyhow!(
        "{} drifted and {} unknown migration(s)",
        report.drifted.len(),
        report.unknown.len()
    ))
}

fn log(ctx: &LedgerContext, limit: usize, errors: bool, json: bool) -> Result<()> {
    let event_log = ctx
        .event_log
        .as_ref()
        .ok_or_else(|| anyhow!("Event log is unavailable"))?;

    let entries = if errors {
        event_log.get_errors(limit)?
    } else {
        event_log.get_recent(limit)?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No log entries found.");
        return Ok(());
    }

    let mut table = output::create_table();
    table.set_header(vec!["Time", "Entry", "Event", "Context", "Error"]);

    for entry in entries {
        let context = [entry.version.as_deref(), entry.command.as_deref()]
            .iter()
            .filter_map(|&s| s)
            .collect::<Vec<_>>()
            .join(", ");

        table.add_row(vec![
            output::format_timestamp(entry.timestamp),
            entry.entry_point,
            entry.event,
            context,
            entry.error_message.unwrap_or_default().red().to_string(),
        ]);
    }

    println!("{}", table);
    Ok(())
}

fn clear_log(ctx: &LedgerContext, older_than_days: u64, force: bool, json: bool) -> Result<()> {
    let event_log = ctx
        .event_log
        .as_ref()
        .ok_or_else(|| anyhow!("Event log is unavailable"))?;

    let cutoff = Utc::now() - Duration::days(older_than_days as i64);

    if !force && !json {
        if !Confirm::new()
            .with_prompt(format!("Delete log entries older than {} days?", older_than_days))
            .default(false)
            .interact()?
        {
            println!("{}\n", "Cancelled".dimmed());
            return Ok(());
        }
    }

    let deleted = event_log.delete_before(cutoff.timestamp_millis())?;

    if json {
        println!("{}", serde_json::json!({ "deleted": deleted }));
    } else {
        output::success(&format!("Deleted {} log entries", deleted));
    }
    Ok(())
}
