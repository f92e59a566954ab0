use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::PersistenceError;
use crate::types::{NaturalKey, Region, Season, ValidatedRecord};

/// Counts produced by merging one batch into the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub inserted: usize,
    pub updated: usize,
}

/// A row as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub id: i64,
    pub week_ending: NaiveDate,
    pub season: Season,
    pub region: Region,
    pub rate: Option<f64>,
    pub count: Option<i64>,
    pub observed_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn key(&self) -> NaturalKey {
        NaturalKey {
            season: self.season,
            region: self.region,
            week_ending: self.week_ending,
        }
    }
}

/// The only writer of durable surveillance data.
///
/// `reconcile` applies a batch all-or-nothing: every record either updates
/// the row holding its natural key or inserts a new one, and on error the
/// store is left exactly as it was before the call.
#[async_trait]
pub trait FluStore: Send + Sync {
    async fn reconcile(&self, batch: Vec<ValidatedRecord>) -> Result<ReconcileOutcome, PersistenceError>;
}

/// In-memory store for development/testing
#[derive(Clone, Default)]
pub struct InMemoryStore {
    rows: Arc<Mutex<HashMap<NaturalKey, StoredRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &NaturalKey) -> Option<StoredRecord> {
        self.rows.lock().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FluStore for InMemoryStore {
    async fn reconcile(&self, batch: Vec<ValidatedRecord>) -> Result<ReconcileOutcome, PersistenceError> {
        let mut rows = self.rows.lock().map_err(|_| PersistenceError::Poisoned)?;
        let mut outcome = ReconcileOutcome::default();

        for record in batch {
            match rows.get_mut(&record.key) {
                Some(existing) => {
                    existing.rate = record.rate;
                    existing.count = record.count;
                    existing.observed_at = record.observed_at;
                    outcome.updated += 1;
                }
                None => {
                    let id = rows.len() as i64 + 1;
                    rows.insert(
                        record.key,
                        StoredRecord {
                            id,
                            week_ending: record.key.week_ending,
                            season: record.key.season,
                            region: record.key.region,
                            rate: record.rate,
                            count: record.count,
                            observed_at: record.observed_at,
                        },
                    );
                    outcome.inserted += 1;
                }
            }
        }

        debug!("In-memory reconcile: {} inserted, {} updated", outcome.inserted, outcome.updated);
        Ok(outcome)
    }
}
