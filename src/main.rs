//! `costbar` command line: sync, report and a periodic refresh loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use costbar::model::{DimensionSummary, GroupBy};
use costbar::source::{CostExplorerSource, StaticSource};
use costbar::{
    ClockRef, Config, CostAnalysis, CostEvent, CostSourceRef, CostStore, FixedClock, Notifier,
    SyncError, SyncReconciler, SystemClock,
};

#[derive(Parser, Debug)]
#[command(name = "costbar", version)]
#[command(about = "Sync daily cost data and compare spend across periods")]
struct Cli {
    /// Settings file (JSON)
    #[arg(long, global = true, env = "COSTBAR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch new and recently corrected cost data into the local store
    Sync {
        /// Re-fetch the whole lookback window
        #[arg(long)]
        full: bool,

        /// Plan the run against an empty in-memory source; nothing is fetched
        #[arg(long)]
        offline: bool,
    },
    /// Print cost comparisons from the local store
    Report {
        /// Leave credits and refunds out of totals
        #[arg(long)]
        exclude_credits: bool,

        /// Print the dashboard as JSON
        #[arg(long)]
        json: bool,

        /// Reference date (YYYY-MM-DD) instead of today
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Sync on the configured refresh interval until interrupted
    Watch {
        /// Force a full resync on the first run
        #[arg(long)]
        full_first: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("costbar=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let store = Arc::new(
        CostStore::open(&config.database_path).with_context(|| {
            format!(
                "Failed to open cost database at {}",
                config.database_path.display()
            )
        })?,
    );

    match cli.command {
        Commands::Sync { full, offline } => run_sync(&config, store, full, offline).await,
        Commands::Report {
            exclude_credits,
            json,
            today,
        } => run_report(store, exclude_credits, json, today),
        Commands::Watch { full_first } => run_watch(&config, store, full_first).await,
    }
}

fn build_source(config: &Config, offline: bool) -> Result<CostSourceRef> {
    if offline {
        return Ok(Arc::new(StaticSource::default()));
    }
    let source = CostExplorerSource::new(config.source.cost_explorer())
        .context("Failed to create cost source")?;
    Ok(Arc::new(source))
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, cancelling");
            token.cancel();
        }
    });
}

async fn run_sync(config: &Config, store: Arc<CostStore>, full: bool, offline: bool) -> Result<()> {
    let source = build_source(config, offline)?;
    let clock: ClockRef = Arc::new(SystemClock);
    let reconciler = SyncReconciler::new(store.clone(), source, clock);

    if offline {
        let plan = reconciler.plan(full)?;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match reconciler.run(full, &cancel).await {
        Ok(outcome) => {
            println!(
                "Synced {} facts for {} to {} ({:?}); {} rows dropped",
                outcome.fetched,
                outcome.plan.from,
                outcome.plan.to,
                outcome.plan.mode,
                outcome.dropped
            );
            if let Some((first, last)) = store.date_span()? {
                println!(
                    "Store holds {} facts from {} to {}",
                    store.fact_count()?,
                    first,
                    last
                );
            }
            Ok(())
        }
        Err(SyncError::Cancelled) => {
            println!("Sync cancelled; nothing was written");
            Ok(())
        }
        Err(e) => Err(e).context("Sync failed"),
    }
}

fn run_report(
    store: Arc<CostStore>,
    exclude_credits: bool,
    json: bool,
    today: Option<NaiveDate>,
) -> Result<()> {
    let clock: ClockRef = match today {
        Some(date) => Arc::new(FixedClock(date)),
        None => Arc::new(SystemClock),
    };
    let analysis = CostAnalysis::new(store.clone(), clock);
    analysis.set_include_credits(!exclude_credits);

    if store.latest_date()?.is_none() {
        println!("No cost data yet. Run `costbar sync` first.");
        return Ok(());
    }

    let dashboard = analysis.dashboard()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&dashboard)?);
        return Ok(());
    }

    let mode = if dashboard.include_credits {
        "including credits (net cost)"
    } else {
        "excluding credits (gross cost)"
    };
    println!("Costs as of {} {}", dashboard.today, mode);
    println!();

    let ranges = &dashboard.date_ranges;
    let mtd = &dashboard.month_to_date;
    println!(
        "{:<24} {:>12} vs {:>12}  {:>8}%   ({} vs {})",
        mtd.label,
        money(mtd.current),
        money(mtd.previous),
        pct(mtd.percentage_change),
        ranges.mtd,
        ranges.last_month_to_date
    );
    let full = &dashboard.full_month;
    println!(
        "{:<24} {:>12} vs {:>12}  {:>8}%",
        full.label,
        money(full.current),
        money(full.previous),
        pct(full.percentage_change)
    );
    println!(
        "Credits: {} this month, {} last month",
        money(dashboard.credits.mtd_credits),
        money(dashboard.credits.last_month_credits)
    );
    if let Some(top) = &dashboard.top_account {
        println!("Top account: {} ({})", top.account_name, money(top.total_cost));
    }

    println!();
    println!(
        "{:>4} {:>12} {:>12} {:>12} {:>9}",
        "Day", "This month", "Last month", "Diff", "Change"
    );
    for day in analysis.day_by_day_comparison()? {
        println!(
            "{:>4} {:>12} {:>12} {:>12} {:>8}%",
            day.day_of_month,
            money(day.this_month),
            money(day.last_month),
            money(day.difference),
            pct(day.percentage_change)
        );
    }

    println!();
    print_dimension_table(
        GroupBy::Service,
        &analysis.service_comparison()?,
        &ranges.rolling_30,
        &ranges.previous_30,
    );
    println!();
    print_dimension_table(
        GroupBy::Account,
        &analysis.account_comparison()?,
        &ranges.rolling_30,
        &ranges.previous_30,
    );
    Ok(())
}

fn print_dimension_table(
    group_by: GroupBy,
    rows: &[DimensionSummary],
    rolling: &str,
    previous: &str,
) {
    println!("By {} (rolling: {} vs {})", group_by, rolling, previous);
    println!(
        "{:<40} {:>12} {:>12} {:>8} {:>12} {:>12} {:>8}",
        "Name", "MTD", "Last MTD", "Change", "Rolling 30", "Prev 30", "Change"
    );
    for row in rows {
        println!(
            "{:<40} {:>12} {:>12} {:>7}{} {:>12} {:>12} {:>7}{}",
            row.name,
            money(row.mtd_cost),
            money(row.last_month_same_day_cost),
            pct(row.mtd_change_percent),
            arrow(row.mtd_is_up),
            money(row.rolling_30_cost),
            money(row.previous_30_cost),
            pct(row.rolling_change_percent),
            arrow(row.rolling_is_up)
        );
    }
}

async fn run_watch(config: &Config, store: Arc<CostStore>, full_first: bool) -> Result<()> {
    let source = build_source(config, false)?;
    let notifier = Notifier::new();
    let clock: ClockRef = Arc::new(SystemClock);
    let reconciler = SyncReconciler::new(store.clone(), source, clock.clone())
        .with_notifier(notifier.clone());
    let analysis = CostAnalysis::new(store, clock).with_notifier(notifier.clone());

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let mut events = notifier.subscribe();
    let listener = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let CostEvent::DataRefreshed {
                completed_at,
                fetched,
            } = event
            {
                tracing::info!(%completed_at, fetched, "Data refreshed");
            }
        }
    });

    let mut interval = tokio::time::interval(config.refresh_interval());
    let mut force = full_first;
    tracing::info!(
        every_minutes = config.refresh_interval_minutes,
        "Watching for cost updates"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match reconciler.run(force, &cancel).await {
            Ok(_) => match analysis.month_to_date_comparison() {
                Ok(mtd) => println!(
                    "{} {}: {} ({}%)",
                    chrono::Local::now().format("%H:%M"),
                    mtd.label,
                    money(mtd.current),
                    pct(mtd.percentage_change)
                ),
                Err(e) => tracing::error!(error = %e, "Failed to compute month-to-date"),
            },
            Err(SyncError::Cancelled) => break,
            Err(e) => tracing::warn!(
                error = %e,
                transient = e.is_transient(),
                "Refresh failed; will retry next interval"
            ),
        }
        force = false;
    }

    listener.abort();
    tracing::info!("Stopped watching");
    Ok(())
}

fn money(value: Decimal) -> String {
    format!("{:.2}", value.round_dp(2))
}

fn pct(value: Decimal) -> String {
    format!("{:.1}", value.round_dp(1))
}

fn arrow(up: bool) -> char {
    if up {
        '▲'
    } else {
        '▼'
    }
}
