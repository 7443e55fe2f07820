use std::process::ExitCode;

use aot_core::OpportunityState;
use aot_sync::{HumanEdit, RunMode, RunSummary, SyncConfig, SyncError, SyncPipeline};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "aot-cli")]
#[command(about = "Academic Opportunity Tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Treat this date (YYYY-MM-DD) as today.
    #[arg(long, global = true)]
    run_date: Option<NaiveDate>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape, consolidate, report and notify.
    Run,
    /// Scrape and consolidate without sending the notification.
    Scrape,
    /// Rescore and re-evaluate stored records without scraping.
    Resync,
    /// Record a human decision on one opportunity.
    Mark {
        #[arg(long)]
        name: String,
        #[arg(long)]
        entity: String,
        #[arg(long)]
        state: OpportunityState,
        #[arg(long)]
        note: Option<String>,
    },
    /// Move an expired opportunity back to new.
    Reopen {
        #[arg(long)]
        name: String,
        #[arg(long)]
        entity: String,
        #[arg(long)]
        closing_date: Option<NaiveDate>,
    },
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} complete: run_id={} date={} sources_ok={} sources_failed={} new={} updated={} expired={} total={}",
        summary.mode.as_str(),
        summary.run_id,
        summary.run_date,
        summary.sources_ok,
        summary.sources_failed,
        summary.inserted,
        summary.updated,
        summary.expired,
        summary.total
    );
    if let Some(dir) = &summary.report_dir {
        println!("report: {}", dir.display());
    }
}

async fn execute(cli: Cli) -> Result<(), SyncError> {
    let mut config = SyncConfig::from_env()?;
    if cli.run_date.is_some() {
        config.run_date = cli.run_date;
    }
    let pipeline = SyncPipeline::new(config)?;

    let mode = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => RunMode::Full,
        Commands::Scrape => RunMode::ScrapeOnly,
        Commands::Resync => RunMode::Resync,
        Commands::Mark {
            name,
            entity,
            state,
            note,
        } => {
            let commit = pipeline
                .apply_human_edit(&HumanEdit::SetState {
                    name,
                    entity,
                    state,
                    note,
                })
                .await?;
            println!("mark complete: updated={} total={}", commit.updated, commit.total);
            return Ok(());
        }
        Commands::Reopen {
            name,
            entity,
            closing_date,
        } => {
            let commit = pipeline
                .apply_human_edit(&HumanEdit::Reopen {
                    name,
                    entity,
                    closing_date,
                })
                .await?;
            println!("reopen complete: updated={} total={}", commit.updated, commit.total);
            return Ok(());
        }
    };

    let summary = pipeline.run(mode).await?;
    print_summary(&summary);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match execute(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "aot-cli failed");
            ExitCode::FAILURE
        }
    }
}
