//! Runs fetch, map, gate and reconcile for a set of regions and folds the
//! per-region results into one [`RunSummary`].
//!
//! Regions are independent: each one is spawned as its own task and a
//! semaphore bounds how many are in flight. Within a region the stages run
//! strictly in order. The summary is built with a commutative merge, so the
//! order in which region tasks finish does not matter.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::apis::SurveillanceSource;
use crate::error::EtlError;
use crate::observability::metrics;
use crate::pipeline::processing::normalize::map_batch;
use crate::pipeline::processing::quality_gate::{QualityAlarm, QualityGate};
use crate::storage::FluStore;
use crate::types::{Region, WeekRange};

/// How one region's pipeline ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegionOutcome {
    /// Every fetched row was mapped, accepted and stored.
    Complete,
    /// Stored, but some rows failed mapping or were rejected by the gate.
    Partial,
    FetchFailed { reason: String, transient: bool },
    /// The batch was rolled back; nothing from this region was written.
    PersistenceFailed { reason: String },
    /// The region task died before reporting.
    Aborted { reason: String },
    /// Not started because the run was cancelled.
    Skipped,
}

impl RegionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            RegionOutcome::FetchFailed { .. } | RegionOutcome::PersistenceFailed { .. } | RegionOutcome::Aborted { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionReport {
    pub region: Region,
    pub fetched: usize,
    pub transformed: usize,
    pub mapping_errors: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub updated: usize,
    pub alarm: Option<QualityAlarm>,
    pub outcome: RegionOutcome,
}

impl RegionReport {
    pub fn new(region: Region, outcome: RegionOutcome) -> Self {
        Self {
            region,
            fetched: 0,
            transformed: 0,
            mapping_errors: 0,
            rejected: 0,
            inserted: 0,
            updated: 0,
            alarm: None,
            outcome,
        }
    }
}

/// Result of one orchestrated run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub range: WeekRange,
    pub fetched: usize,
    pub transformed: usize,
    pub mapping_errors: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub updated: usize,
    pub regions: BTreeMap<Region, RegionReport>,
}

impl RunSummary {
    pub fn new(range: WeekRange) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            range,
            fetched: 0,
            transformed: 0,
            mapping_errors: 0,
            rejected: 0,
            inserted: 0,
            updated: 0,
            regions: BTreeMap::new(),
        }
    }

    /// Fold one region's report in. Order of calls does not affect the result.
    pub fn absorb(&mut self, report: RegionReport) {
        self.fetched += report.fetched;
        self.transformed += report.transformed;
        self.mapping_errors += report.mapping_errors;
        self.rejected += report.rejected;
        self.inserted += report.inserted;
        self.updated += report.updated;
        self.regions.insert(report.region, report);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn outcome(&self, region: Region) -> Option<&RegionOutcome> {
        self.regions.get(&region).map(|r| &r.outcome)
    }

    /// Regions whose fetch failed, with the cause.
    pub fn fetch_failures(&self) -> Vec<(Region, &str)> {
        self.regions
            .values()
            .filter_map(|r| match &r.outcome {
                RegionOutcome::FetchFailed { reason, .. } => Some((r.region, reason.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn failed_regions(&self) -> Vec<Region> {
        self.regions
            .values()
            .filter(|r| r.outcome.is_failure())
            .map(|r| r.region)
            .collect()
    }

    pub fn alarms(&self) -> Vec<(Region, &QualityAlarm)> {
        self.regions
            .values()
            .filter_map(|r| r.alarm.as_ref().map(|a| (r.region, a)))
            .collect()
    }

    /// Regions that were started, i.e. not skipped by cancellation.
    pub fn attempted(&self) -> usize {
        self.regions
            .values()
            .filter(|r| r.outcome != RegionOutcome::Skipped)
            .count()
    }

    /// At least one region was attempted and every attempted region failed to fetch.
    pub fn is_total_outage(&self) -> bool {
        let attempted = self.attempted();
        attempted > 0 && self.fetch_failures().len() == attempted
    }
}

/// Caller side of a run's cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Pipeline side of the cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelToken { rx })
}

pub struct Pipeline {
    source: Arc<dyn SurveillanceSource>,
    store: Arc<dyn FluStore>,
    gate: QualityGate,
    concurrency: usize,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn SurveillanceSource>,
        store: Arc<dyn FluStore>,
        gate: QualityGate,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            store,
            gate,
            concurrency: concurrency.max(1),
        }
    }

    /// Run every region in `regions` over `range`.
    ///
    /// Fails only with [`EtlError::TotalOutage`] when every attempted region
    /// failed to fetch; any other per-region failure is recorded in the
    /// summary. Once `cancel` fires no further region is started, and the
    /// regions already in flight run to completion.
    pub async fn run(
        &self,
        regions: &[Region],
        range: WeekRange,
        cancel: &CancelToken,
    ) -> Result<RunSummary, EtlError> {
        let started = Instant::now();
        let mut summary = RunSummary::new(range);
        let mut seen = BTreeSet::new();
        let targets: Vec<Region> = regions.iter().copied().filter(|r| seen.insert(*r)).collect();

        info!(
            "🚀 Starting {} run for {} regions over {}",
            self.source.source_name(),
            targets.len(),
            range
        );

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut handles: Vec<(Region, JoinHandle<RegionReport>)> = Vec::with_capacity(targets.len());

        for region in targets {
            if cancel.is_cancelled() {
                summary.absorb(RegionReport::new(region, RegionOutcome::Skipped));
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = permits.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                debug!("Cancelled before {} started", region);
                summary.absorb(RegionReport::new(region, RegionOutcome::Skipped));
                continue;
            };

            let source = self.source.clone();
            let store = self.store.clone();
            let gate = self.gate.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                process_region(source, store, gate, region, range).await
            });
            handles.push((region, handle));
        }

        for (region, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!("Region task for {} did not complete: {}", region, e);
                    metrics::pipeline::region_failed(region.code(), "task");
                    RegionReport::new(region, RegionOutcome::Aborted { reason: e.to_string() })
                }
            };
            summary.absorb(report);
        }

        summary.finish();
        metrics::pipeline::run_finished(started.elapsed().as_secs_f64());

        let skipped = summary.regions.len() - summary.attempted();
        if skipped > 0 {
            warn!("⏹️  Run cancelled; {} regions not started", skipped);
        }

        if summary.is_total_outage() {
            error!("💥 Every attempted region failed to fetch");
            return Err(EtlError::TotalOutage {
                regions: summary.attempted(),
                summary: Box::new(summary),
            });
        }

        info!(
            "✅ Run finished: fetched={} inserted={} updated={} rejected={} mapping_errors={} failed_regions={}",
            summary.fetched,
            summary.inserted,
            summary.updated,
            summary.rejected,
            summary.mapping_errors,
            summary.failed_regions().len()
        );
        Ok(summary)
    }
}

#[instrument(skip_all, fields(region = region.code()))]
async fn process_region(
    source: Arc<dyn SurveillanceSource>,
    store: Arc<dyn FluStore>,
    gate: QualityGate,
    region: Region,
    range: WeekRange,
) -> RegionReport {
    let raw = match source.fetch(region, range).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!("❌ {}", e);
            metrics::pipeline::region_failed(region.code(), "fetch");
            return RegionReport::new(
                region,
                RegionOutcome::FetchFailed {
                    reason: e.kind.to_string(),
                    transient: e.is_transient(),
                },
            );
        }
    };

    let mut report = RegionReport::new(region, RegionOutcome::Complete);
    report.fetched = raw.len();

    let (mapped, mapping_errors) = map_batch(&raw, Utc::now());
    for e in &mapping_errors {
        debug!("Skipping unmappable row: {}", e);
    }
    report.transformed = mapped.len();
    report.mapping_errors = mapping_errors.len();

    let gated = gate.assess(mapped);
    report.rejected = gated.rejected.len();
    if let Some(alarm) = &gated.alarm {
        warn!("🚨 Quality alarm for {}: {}", region, alarm);
    }
    report.alarm = gated.alarm;

    if !gated.accepted.is_empty() {
        match store.reconcile(gated.accepted).await {
            Ok(outcome) => {
                report.inserted = outcome.inserted;
                report.updated = outcome.updated;
            }
            Err(e) => {
                error!("Failed to persist {}: {}", region, e);
                metrics::pipeline::region_failed(region.code(), "persist");
                report.outcome = RegionOutcome::PersistenceFailed { reason: e.to_string() };
                return report;
            }
        }
    }

    if report.rejected > 0 || report.mapping_errors > 0 {
        report.outcome = RegionOutcome::Partial;
    }
    info!(
        "{}: fetched={} inserted={} updated={} rejected={}",
        region, report.fetched, report.inserted, report.updated, report.rejected
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, FetchErrorKind};
    use crate::storage::InMemoryStore;
    use crate::types::{Epiweek, RawRecord, RawRow};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct CannedSource {
        rows: HashMap<Region, Vec<RawRow>>,
    }

    #[async_trait]
    impl SurveillanceSource for CannedSource {
        fn source_name(&self) -> &'static str {
            "canned"
        }

        async fn fetch(&self, region: Region, _range: WeekRange) -> Result<Vec<RawRow>, FetchError> {
            self.rows.get(&region).cloned().ok_or_else(|| {
                FetchError::new(
                    region,
                    FetchErrorKind::RetriesExhausted {
                        attempts: 3,
                        last_error: "connection refused".to_string(),
                    },
                )
            })
        }
    }

    fn row(epiweek: i64, region: &str, ili: f64) -> RawRow {
        RawRecord {
            epiweek: Some(epiweek),
            region: Some(region.to_string()),
            ili: Some(ili),
            num_patients: Some(100),
        }
        .into()
    }

    fn range() -> WeekRange {
        WeekRange::new(Epiweek::from_code(202440).unwrap(), Epiweek::from_code(202442).unwrap()).unwrap()
    }

    fn report(region: Region, inserted: usize) -> RegionReport {
        RegionReport {
            inserted,
            fetched: inserted,
            ..RegionReport::new(region, RegionOutcome::Complete)
        }
    }

    #[test]
    fn absorb_is_order_independent() {
        let mut a = RunSummary::new(range());
        a.absorb(report(Region::National, 3));
        a.absorb(report(Region::Hhs5, 4));

        let mut b = RunSummary::new(range());
        b.absorb(report(Region::Hhs5, 4));
        b.absorb(report(Region::National, 3));

        assert_eq!(a.inserted, 7);
        assert_eq!(a.inserted, b.inserted);
        assert_eq!(a.fetched, b.fetched);
        assert_eq!(a.regions, b.regions);
    }

    #[test]
    fn total_outage_needs_an_attempt() {
        let mut summary = RunSummary::new(range());
        summary.absorb(RegionReport::new(Region::National, RegionOutcome::Skipped));
        assert!(!summary.is_total_outage());

        summary.absorb(RegionReport::new(
            Region::Hhs1,
            RegionOutcome::FetchFailed {
                reason: "down".to_string(),
                transient: true,
            },
        ));
        assert!(summary.is_total_outage());
    }

    #[tokio::test]
    async fn rejected_rows_mark_region_partial() {
        let source = CannedSource {
            rows: HashMap::from([
                (Region::National, vec![row(202440, "nat", 2.0), row(202441, "nat", 2.5)]),
                (Region::Hhs3, vec![row(202440, "hhs3", 1.0), row(202441, "hhs3", 150.0)]),
            ]),
        };
        let store = InMemoryStore::new();
        let pipeline = Pipeline::new(Arc::new(source), Arc::new(store.clone()), QualityGate::default(), 2);

        let summary = pipeline
            .run(&[Region::National, Region::Hhs3, Region::National], range(), &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(summary.regions.len(), 2);
        assert_eq!(summary.outcome(Region::National), Some(&RegionOutcome::Complete));
        assert_eq!(summary.outcome(Region::Hhs3), Some(&RegionOutcome::Partial));
        assert_eq!(summary.fetched, 4);
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.rejected, 1);
        assert!(summary.finished_at.is_some());
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn mapping_errors_do_not_abort_region() {
        let source = CannedSource {
            rows: HashMap::from([(
                Region::Hhs7,
                vec![row(202440, "hhs7", 1.0), row(202440, "hhs77", 1.0), row(202460, "hhs7", 1.0)],
            )]),
        };
        let pipeline = Pipeline::new(Arc::new(source), Arc::new(InMemoryStore::new()), QualityGate::default(), 1);

        let summary = pipeline.run(&[Region::Hhs7], range(), &CancelToken::never()).await.unwrap();

        let hhs7 = &summary.regions[&Region::Hhs7];
        assert_eq!(hhs7.fetched, 3);
        assert_eq!(hhs7.transformed, 1);
        assert_eq!(hhs7.mapping_errors, 2);
        assert_eq!(hhs7.inserted, 1);
        assert_eq!(hhs7.outcome, RegionOutcome::Partial);
    }

    #[tokio::test]
    async fn wrongly_typed_row_is_counted_not_fatal() {
        let source = CannedSource {
            rows: HashMap::from([(
                Region::Hhs2,
                vec![
                    row(202440, "hhs2", 1.0),
                    serde_json::json!({"epiweek": 202441, "region": "hhs2", "ili": 1.1, "num_patients": 1500.5}),
                    row(202442, "hhs2", 1.2),
                ],
            )]),
        };
        let store = InMemoryStore::new();
        let pipeline = Pipeline::new(Arc::new(source), Arc::new(store.clone()), QualityGate::default(), 1);

        let summary = pipeline.run(&[Region::Hhs2], range(), &CancelToken::never()).await.unwrap();

        let hhs2 = &summary.regions[&Region::Hhs2];
        assert_eq!(hhs2.fetched, 3);
        assert_eq!(hhs2.mapping_errors, 1);
        assert_eq!(hhs2.inserted, 2);
        assert_eq!(hhs2.outcome, RegionOutcome::Partial);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn cancel_token_observes_handle() {
        let (handle, token) = cancellation();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await;
        assert!(handle.token().is_cancelled());
    }
}
