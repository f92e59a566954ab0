use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::apis::fluview::FluviewClient;
use crate::config::Config;
use crate::db::SqliteStore;
use crate::error::{EtlError, Result};
use crate::pipeline::orchestrator::{CancelToken, Pipeline, RegionOutcome, RunSummary};
use crate::pipeline::processing::quality_gate::QualityGate;
use crate::types::{Region, WeekRange};

/// Wire the fluview client, the SQLite store and the quality gate from config.
pub fn build_pipeline(config: &Config) -> Result<Pipeline> {
    let store = SqliteStore::open(&config.database.path)?;
    let source = FluviewClient::with_reqwest(config.source.clone());
    Ok(Pipeline::new(
        Arc::new(source),
        Arc::new(store),
        QualityGate::new(config.quality.clone()),
        config.pipeline.concurrency,
    ))
}

/// Season-to-date as of now.
pub fn current_range() -> Option<WeekRange> {
    WeekRange::season_to_date(Utc::now().date_naive())
}

/// One run over `regions` and `range` against the configured store.
pub async fn run_once(
    config: &Config,
    regions: &[Region],
    range: WeekRange,
    cancel: &CancelToken,
) -> Result<RunSummary> {
    let pipeline = build_pipeline(config)?;
    pipeline.run(regions, range, cancel).await
}

/// Run immediately, then once per `interval`, until `cancel` fires.
/// Each run gets a fresh season-to-date window. Returns the number of runs.
pub async fn run_scheduled(config: &Config, interval: Duration, cancel: &CancelToken) -> Result<usize> {
    let pipeline = build_pipeline(config)?;
    let regions = config.pipeline.resolve_regions()?;
    Ok(schedule(&pipeline, &regions, interval, cancel).await)
}

pub async fn schedule(pipeline: &Pipeline, regions: &[Region], interval: Duration, cancel: &CancelToken) -> usize {
    info!("⏰ Scheduling runs every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut runs = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(range) = current_range() else {
            warn!("Could not compute the current epiweek, skipping this tick");
            continue;
        };

        match pipeline.run(regions, range, cancel).await {
            Ok(summary) => print_summary(&summary),
            Err(EtlError::TotalOutage { regions: failed, summary }) => {
                error!("Scheduled run failed: all {} regions failed to fetch", failed);
                print_summary(&summary);
            }
            Err(e) => error!("Scheduled run failed: {}", e),
        }
        runs += 1;
    }

    info!("🛑 Scheduler stopped after {} runs", runs);
    runs
}

pub fn print_summary(summary: &RunSummary) {
    println!("\n📊 Run summary for {}:", summary.range);
    println!("   Fetched: {}", summary.fetched);
    println!("   Transformed: {}", summary.transformed);
    println!("   Mapping errors: {}", summary.mapping_errors);
    println!("   Rejected: {}", summary.rejected);
    println!("   Inserted: {}", summary.inserted);
    println!("   Updated: {}", summary.updated);

    for report in summary.regions.values() {
        let status = match &report.outcome {
            RegionOutcome::Complete => "✅ complete".to_string(),
            RegionOutcome::Partial => "⚠️  partial".to_string(),
            RegionOutcome::FetchFailed { reason, .. } => format!("❌ fetch failed: {reason}"),
            RegionOutcome::PersistenceFailed { reason } => format!("❌ not stored: {reason}"),
            RegionOutcome::Aborted { reason } => format!("❌ aborted: {reason}"),
            RegionOutcome::Skipped => "⏭️  skipped".to_string(),
        };
        println!(
            "   {:<14} {} (fetched {}, +{} ~{} -{})",
            report.region.name(),
            status,
            report.fetched,
            report.inserted,
            report.updated,
            report.rejected
        );
    }

    let alarms = summary.alarms();
    if !alarms.is_empty() {
        println!("\n🚨 Quality alarms:");
        for (region, alarm) in alarms {
            println!("   - {}: {}", region, alarm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::SurveillanceSource;
    use crate::error::FetchError;
    use crate::pipeline::orchestrator::{cancellation, CancelHandle};
    use crate::storage::InMemoryStore;
    use crate::types::RawRow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns no rows and requests cancellation on its `stop_after`th call.
    struct StoppingSource {
        calls: AtomicUsize,
        stop_after: usize,
        handle: CancelHandle,
    }

    #[async_trait]
    impl SurveillanceSource for StoppingSource {
        fn source_name(&self) -> &'static str {
            "stopping"
        }

        async fn fetch(&self, _region: Region, _range: WeekRange) -> std::result::Result<Vec<RawRow>, FetchError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.stop_after {
                self.handle.cancel();
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn schedule_runs_until_cancelled() {
        let (handle, token) = cancellation();
        let source = Arc::new(StoppingSource {
            calls: AtomicUsize::new(0),
            stop_after: 2,
            handle,
        });
        let pipeline = Pipeline::new(source.clone(), Arc::new(InMemoryStore::new()), QualityGate::default(), 1);

        let runs = schedule(&pipeline, &[Region::National], Duration::from_millis(10), &token).await;

        assert_eq!(runs, 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn schedule_does_nothing_when_already_cancelled() {
        let (handle, token) = cancellation();
        handle.cancel();
        let source = Arc::new(StoppingSource {
            calls: AtomicUsize::new(0),
            stop_after: 1,
            handle: handle.clone(),
        });
        let pipeline = Pipeline::new(source.clone(), Arc::new(InMemoryStore::new()), QualityGate::default(), 1);

        let runs = schedule(&pipeline, &[Region::National], Duration::from_secs(3600), &token).await;

        assert_eq!(runs, 0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
