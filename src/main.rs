use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{error, info, warn};

use flu_etl::config::Config;
use flu_etl::db::SqliteStore;
use flu_etl::error::EtlError;
use flu_etl::logging;
use flu_etl::observability;
use flu_etl::pipeline::orchestrator::{cancellation, CancelHandle};
use flu_etl::tasks;
use flu_etl::types::{Epiweek, Region, WeekRange};

#[derive(Parser)]
#[command(name = "flu_etl")]
#[command(about = "Influenza surveillance ETL: CDC ILINet into SQLite")]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file (defaults to ./flu_etl.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, validate and store one window of data
    Run {
        /// Provider region codes (comma-separated), e.g. nat,hhs1
        #[arg(long)]
        regions: Option<String>,
        /// First epiweek (YYYYWW); defaults to week 40 of the current season
        #[arg(long)]
        start: Option<i64>,
        /// Last epiweek (YYYYWW); defaults to the current week
        #[arg(long)]
        end: Option<i64>,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run now and then on a fixed interval until Ctrl-C
    Schedule {
        #[arg(long)]
        interval_hours: Option<u64>,
    },
    /// Create the database file and schema
    InitDb,
    /// Show what is stored and how fresh it is
    Status,
}

fn parse_regions(list: &str) -> anyhow::Result<Vec<Region>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|code| code.parse::<Region>().map_err(anyhow::Error::from))
        .collect()
}

fn resolve_range(start: Option<i64>, end: Option<i64>) -> anyhow::Result<WeekRange> {
    let default = tasks::current_range().context("could not determine the current epiweek")?;
    let end = match end {
        Some(code) => Epiweek::from_code(code)?,
        None => default.end,
    };
    let start = match start {
        Some(code) => Epiweek::from_code(code)?,
        None => Epiweek::new(end.season().start_year(), flu_etl::constants::SEASON_START_WEEK)?,
    };
    WeekRange::new(start, end).with_context(|| format!("start epiweek {start} is after end epiweek {end}"))
}

fn cancel_on_ctrl_c(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; no new regions will be started");
            handle.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let _log_guard = logging::init_logging();
    observability::init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            regions,
            start,
            end,
            json,
        } => {
            let regions = match regions {
                Some(list) => parse_regions(&list)?,
                None => config.pipeline.resolve_regions()?,
            };
            let range = resolve_range(start, end)?;
            println!("🔄 Running ETL for {} regions over {}...", regions.len(), range);

            let (handle, token) = cancellation();
            cancel_on_ctrl_c(handle);

            match tasks::run_once(&config, &regions, range, &token).await {
                Ok(summary) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&summary)?);
                    } else {
                        tasks::print_summary(&summary);
                    }
                    let failed = summary.failed_regions();
                    if failed.is_empty() {
                        println!("\n✅ Run completed");
                    } else {
                        println!("\n⚠️  Run completed with {} failed regions", failed.len());
                    }
                }
                Err(EtlError::TotalOutage { regions, summary }) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&summary)?);
                    } else {
                        tasks::print_summary(&summary);
                    }
                    error!("Total outage across {} regions", regions);
                    bail!("all {} attempted regions failed to fetch", regions);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Schedule { interval_hours } => {
            let interval = match interval_hours {
                Some(0) => bail!("--interval-hours must be at least 1"),
                Some(hours) => Duration::from_secs(hours * 60 * 60),
                None => config.schedule.interval(),
            };
            let (handle, token) = cancellation();
            cancel_on_ctrl_c(handle);

            let runs = tasks::run_scheduled(&config, interval, &token).await?;
            println!("🛑 Scheduler stopped after {} runs", runs);
        }
        Commands::InitDb => {
            SqliteStore::open(&config.database.path)?;
            info!("Database ready at {}", config.database.path.display());
            println!("✅ Database initialized at {}", config.database.path.display());
        }
        Commands::Status => {
            let store = SqliteStore::open(&config.database.path)?;
            let regions = store.regions()?;
            println!("📦 Database: {}", config.database.path.display());
            println!("   Rows: {}", store.row_count()?);
            println!(
                "   Regions: {}",
                regions.iter().map(|r| r.name()).collect::<Vec<_>>().join(", ")
            );
            match store.latest_observed_at()? {
                Some(ts) => println!("   Last ingested: {}", ts.to_rfc3339()),
                None => println!("   Last ingested: never"),
            }
        }
    }
    Ok(())
}
