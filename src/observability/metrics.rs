//! Metrics for the ETL pipeline, grouped by phase.
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op, so library code and tests never need to
//! set anything up.

use std::fmt;
use std::net::SocketAddr;

use tracing::{info, warn};

use crate::constants::ENV_METRICS_ADDR;

/// Every metric name used in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Sources
    SourcesRequestAttempts,
    SourcesRequestErrors,
    SourcesRequestDuration,

    // Normalize
    NormalizeRecordsMapped,
    NormalizeMappingErrors,

    // Quality Gate
    QualityGateRecordsAccepted,
    QualityGateRecordsRejected,
    QualityGateAlarms,
    QualityGateBatchSize,

    // Storage
    StorageRowsInserted,
    StorageRowsUpdated,
    StorageCommitFailures,
    StorageCommitDuration,

    // Orchestrator
    PipelineRuns,
    PipelineRegionFailures,
    PipelineDuration,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::SourcesRequestAttempts => "flu_etl_sources_request_attempts_total",
            MetricName::SourcesRequestErrors => "flu_etl_sources_request_errors_total",
            MetricName::SourcesRequestDuration => "flu_etl_sources_request_duration_seconds",
            MetricName::NormalizeRecordsMapped => "flu_etl_normalize_records_mapped_total",
            MetricName::NormalizeMappingErrors => "flu_etl_normalize_mapping_errors_total",
            MetricName::QualityGateRecordsAccepted => "flu_etl_quality_gate_records_accepted_total",
            MetricName::QualityGateRecordsRejected => "flu_etl_quality_gate_records_rejected_total",
            MetricName::QualityGateAlarms => "flu_etl_quality_gate_alarms_total",
            MetricName::QualityGateBatchSize => "flu_etl_quality_gate_batch_size",
            MetricName::StorageRowsInserted => "flu_etl_storage_rows_inserted_total",
            MetricName::StorageRowsUpdated => "flu_etl_storage_rows_updated_total",
            MetricName::StorageCommitFailures => "flu_etl_storage_commit_failures_total",
            MetricName::StorageCommitDuration => "flu_etl_storage_commit_duration_seconds",
            MetricName::PipelineRuns => "flu_etl_pipeline_runs_total",
            MetricName::PipelineRegionFailures => "flu_etl_pipeline_region_failures_total",
            MetricName::PipelineDuration => "flu_etl_pipeline_duration_seconds",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install a Prometheus recorder with an HTTP listener when
/// `FLU_ETL_METRICS_ADDR` is set. Must be called from within a tokio runtime.
pub fn init() {
    let Ok(addr_str) = std::env::var(ENV_METRICS_ADDR) else {
        return;
    };
    let addr: SocketAddr = match addr_str.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("Invalid {} '{}': {}", ENV_METRICS_ADDR, addr_str, e);
            return;
        }
    };
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => info!("Prometheus exporter listening on http://{}/metrics", addr),
        Err(e) => warn!("Failed to install Prometheus recorder: {}", e),
    }
}

// ============================================================================
// Sources Metrics
// ============================================================================

pub mod sources {
    use super::MetricName;

    pub fn request_attempt(region: &'static str) {
        ::metrics::counter!(MetricName::SourcesRequestAttempts.as_str(), "region" => region).increment(1);
    }

    pub fn request_error(region: &'static str, kind: &'static str) {
        ::metrics::counter!(
            MetricName::SourcesRequestErrors.as_str(),
            "region" => region,
            "kind" => kind
        )
        .increment(1);
    }

    pub fn request_duration(secs: f64) {
        ::metrics::histogram!(MetricName::SourcesRequestDuration.as_str()).record(secs);
    }
}

// ============================================================================
// Normalize Metrics
// ============================================================================

pub mod normalize {
    use super::MetricName;

    pub fn batch_mapped(mapped: usize, errors: usize) {
        ::metrics::counter!(MetricName::NormalizeRecordsMapped.as_str()).increment(mapped as u64);
        ::metrics::counter!(MetricName::NormalizeMappingErrors.as_str()).increment(errors as u64);
    }
}

// ============================================================================
// Quality Gate Metrics
// ============================================================================

pub mod quality_gate {
    use super::MetricName;

    pub fn record_rejected(reason: &'static str) {
        ::metrics::counter!(MetricName::QualityGateRecordsRejected.as_str(), "reason" => reason).increment(1);
    }

    pub fn alarm_raised() {
        ::metrics::counter!(MetricName::QualityGateAlarms.as_str()).increment(1);
    }

    pub fn batch_processed(total_records: usize, accepted_count: usize, _rejected_count: usize) {
        ::metrics::histogram!(MetricName::QualityGateBatchSize.as_str()).record(total_records as f64);
        ::metrics::counter!(MetricName::QualityGateRecordsAccepted.as_str()).increment(accepted_count as u64);
    }
}

// ============================================================================
// Storage Metrics
// ============================================================================

pub mod storage {
    use super::MetricName;

    pub fn committed(inserted: usize, updated: usize, secs: f64) {
        ::metrics::counter!(MetricName::StorageRowsInserted.as_str()).increment(inserted as u64);
        ::metrics::counter!(MetricName::StorageRowsUpdated.as_str()).increment(updated as u64);
        ::metrics::histogram!(MetricName::StorageCommitDuration.as_str()).record(secs);
    }

    pub fn commit_failed() {
        ::metrics::counter!(MetricName::StorageCommitFailures.as_str()).increment(1);
    }
}

// ============================================================================
// Orchestrator Metrics
// ============================================================================

pub mod pipeline {
    use super::MetricName;

    pub fn run_finished(secs: f64) {
        ::metrics::counter!(MetricName::PipelineRuns.as_str()).increment(1);
        ::metrics::histogram!(MetricName::PipelineDuration.as_str()).record(secs);
    }

    pub fn region_failed(region: &'static str, stage: &'static str) {
        ::metrics::counter!(
            MetricName::PipelineRegionFailures.as_str(),
            "region" => region,
            "stage" => stage
        )
        .increment(1);
    }
}
