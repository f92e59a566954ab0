//! Field mapping from provider-native rows to the stored schema.
//!
//! Mapping is pure: nothing here touches the network or the store. Fields
//! the provider omitted come through as `None` and are judged later by the
//! quality gate; only values that cannot mean anything (an unknown region
//! code, a malformed epiweek, a field of the wrong type) are mapping errors.

use chrono::{DateTime, Utc};

use crate::error::MappingError;
use crate::types::{CanonicalRecord, Epiweek, RawRecord, RawRow, Region};

/// Map one provider row, stamping it with the ingestion time `observed_at`.
pub fn map_record(row: &RawRow, observed_at: DateTime<Utc>) -> Result<CanonicalRecord, MappingError> {
    let raw = RawRecord::from_row(row)?;
    let epiweek = raw.epiweek.map(Epiweek::from_code).transpose()?;
    let region = raw.region.as_deref().map(map_region).transpose()?;

    Ok(CanonicalRecord {
        week_ending: epiweek.map(|ew| ew.week_ending()),
        season: epiweek.map(|ew| ew.season()),
        region,
        rate: raw.ili,
        count: raw.num_patients,
        observed_at,
    })
}

/// Exhaustive provider code lookup; anything outside the table is refused.
pub fn map_region(code: &str) -> Result<Region, MappingError> {
    Region::from_code(code).ok_or_else(|| MappingError::UnknownRegion(code.to_string()))
}

/// Map a whole fetch result, keeping successes in input order and collecting
/// the failures alongside.
pub fn map_batch(raw: &[RawRow], observed_at: DateTime<Utc>) -> (Vec<CanonicalRecord>, Vec<MappingError>) {
    let mut mapped = Vec::with_capacity(raw.len());
    let mut errors = Vec::new();
    for record in raw {
        match map_record(record, observed_at) {
            Ok(canonical) => mapped.push(canonical),
            Err(e) => errors.push(e),
        }
    }
    crate::observability::metrics::normalize::batch_mapped(mapped.len(), errors.len());
    (mapped, errors)
}
