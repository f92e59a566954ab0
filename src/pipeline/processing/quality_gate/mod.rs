use std::fmt;

use serde::Serialize;

use crate::config::QualityGateConfig;
use crate::types::{CanonicalRecord, NaturalKey, ValidatedRecord};

/// Why a record was kept out of the accepted batch. Checks run in
/// declaration order and the first failing one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum RejectionReason {
    MissingRequiredField,
    RateOutOfRange,
    NegativeCount,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::MissingRequiredField => "missing required field",
            RejectionReason::RateOutOfRange => "rate out of range",
            RejectionReason::NegativeCount => "negative count",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    pub record: CanonicalRecord,
    pub reason: RejectionReason,
}

/// Batch-level signal: too large a share of the batch was rejected. Accepted
/// records still flow on; the alarm is for an operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityAlarm {
    pub batch_size: usize,
    pub rejected: usize,
    pub rejection_rate: f64,
    pub threshold: f64,
}

impl fmt::Display for QualityAlarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} records rejected ({:.1}% > {:.1}%)",
            self.rejected,
            self.batch_size,
            self.rejection_rate * 100.0,
            self.threshold * 100.0
        )
    }
}

/// Partition produced by [`QualityGate::assess`].
#[derive(Debug, Clone, Default)]
pub struct GateReport {
    pub accepted: Vec<ValidatedRecord>,
    pub rejected: Vec<RejectedRecord>,
    pub rejection_rate: f64,
    pub alarm: Option<QualityAlarm>,
}

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    pub config: QualityGateConfig,
}

impl QualityGate {
    pub fn new(config: QualityGateConfig) -> Self {
        Self { config }
    }

    /// Validate one record. Null rate or count is tolerated; only values
    /// that are present and wrong are refused.
    pub fn check(&self, record: &CanonicalRecord) -> Result<ValidatedRecord, RejectionReason> {
        let (Some(region), Some(week_ending), Some(season)) =
            (record.region, record.week_ending, record.season)
        else {
            return Err(RejectionReason::MissingRequiredField);
        };

        if let Some(rate) = record.rate {
            // written so that NaN fails as well
            if !(rate >= self.config.rate_min && rate <= self.config.rate_max) {
                return Err(RejectionReason::RateOutOfRange);
            }
        }

        if matches!(record.count, Some(count) if count < 0) {
            return Err(RejectionReason::NegativeCount);
        }

        Ok(ValidatedRecord {
            key: NaturalKey {
                season,
                region,
                week_ending,
            },
            rate: record.rate,
            count: record.count,
            observed_at: record.observed_at,
        })
    }

    /// Partition a batch into accepted and rejected records and decide
    /// whether the rejection rate warrants an alarm.
    pub fn assess(&self, batch: Vec<CanonicalRecord>) -> GateReport {
        let batch_size = batch.len();
        let mut report = GateReport::default();

        for record in batch {
            match self.check(&record) {
                Ok(valid) => report.accepted.push(valid),
                Err(reason) => {
                    crate::observability::metrics::quality_gate::record_rejected(reason.as_str());
                    report.rejected.push(RejectedRecord { record, reason });
                }
            }
        }

        report.rejection_rate = if batch_size == 0 {
            0.0
        } else {
            report.rejected.len() as f64 / batch_size as f64
        };

        if report.rejection_rate > self.config.alarm_threshold {
            crate::observability::metrics::quality_gate::alarm_raised();
            report.alarm = Some(QualityAlarm {
                batch_size,
                rejected: report.rejected.len(),
                rejection_rate: report.rejection_rate,
                threshold: self.config.alarm_threshold,
            });
        }

        crate::observability::metrics::quality_gate::batch_processed(
            batch_size,
            report.accepted.len(),
            report.rejected.len(),
        );
        report
    }
}
