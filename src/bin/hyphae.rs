//! `hyphae`: admin CLI for usage reports, budget sweeps and routing.
//!
//! Build: `cargo build --bin hyphae --features cli`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hyphae::alerts::BudgetAlerts;
use hyphae::usage::ReportFormat;
use hyphae::{
    Config, DateRange, HealthTracker, HyphaeError, IntelligentRouter, ModelRegistry,
    RoutingPreferences, UsageAccountant,
};

#[derive(Parser)]
#[command(name = "hyphae")]
#[command(version = hyphae::PKG_VERSION)]
#[command(about = "Hyphae orchestration admin tool")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "HYPHAE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// evaluate budget alerts and notify for triggered ones
    Sweep {
        /// keep sweeping every N seconds instead of once
        #[arg(long)]
        interval: Option<u64>,
    },
    /// export a cost report over a date range
    Report {
        /// first day (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,
        /// last day, inclusive (default: today)
        #[arg(long)]
        end: Option<NaiveDate>,
        /// csv or json
        #[arg(long, default_value = "csv")]
        format: ReportFormat,
    },
    /// explain which model a prompt would be routed to
    Route {
        prompt: String,
        /// number of candidates to show
        #[arg(long, default_value_t = 3)]
        top: usize,
    },
    /// print one day's aggregate usage
    Stats {
        /// day (YYYY-MM-DD, default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    let store = hyphae::store::connect(&config.store).await?;
    info!(version = %hyphae::version_string(), backend = %config.store.backend, "hyphae starting");

    let accountant = Arc::new(UsageAccountant::new(store.clone(), config.accounting.clone()));

    match args.command {
        Command::Sweep { interval } => {
            let alerts = BudgetAlerts::new(store, accountant, config.alerts.clone());
            match interval {
                Some(secs) => loop {
                    sweep_once(&alerts).await?;
                    tokio::time::sleep(Duration::from_secs(secs.max(1))).await;
                },
                None => sweep_once(&alerts).await?,
            }
        }
        Command::Report { start, end, format } => {
            let end = end.unwrap_or_else(|| Utc::now().date_naive());
            if end < start {
                return Err(HyphaeError::InvalidInput("--end is before --start".into()).into());
            }
            let report = accountant
                .export_cost_report(DateRange::new(start, end), format)
                .await?;
            println!("{report}");
        }
        Command::Route { prompt, top } => {
            let registry = Arc::new(ModelRegistry::with_embedded_seed());
            let health = Arc::new(HealthTracker::new(store, config.health.clone()));
            let router = IntelligentRouter::new(registry, health);
            let recommendations = router
                .recommendations(&prompt, &RoutingPreferences::default(), top)
                .await;
            if recommendations.is_empty() {
                println!("no candidate models");
            }
            for (rank, rec) in recommendations.iter().enumerate() {
                println!("{}. {} (score {})", rank + 1, rec.model_id, rec.score);
                for reason in &rec.reasoning {
                    println!("     - {reason}");
                }
            }
        }
        Command::Stats { date } => {
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            match accountant.get_daily_stats(date).await? {
                Some(stats) => println!("{}", serde_json::to_string_pretty(&stats)?),
                None => println!("no usage recorded on {date}"),
            }
        }
    }

    Ok(())
}

async fn sweep_once(alerts: &BudgetAlerts) -> hyphae::Result<()> {
    let triggered = alerts.run_sweep().await?;
    info!(triggered = triggered.len(), "budget sweep complete");
    for alert in &triggered {
        println!(
            "{}: {:.1}% of ${:.2} ({:?}, {:?})",
            alert.name, alert.percent_used, alert.threshold, alert.period, alert.scope
        );
    }
    Ok(())
}
