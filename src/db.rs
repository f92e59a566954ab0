use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Params, Row, TransactionBehavior};
use tracing::{debug, info, instrument, warn};

use crate::constants::DEFAULT_BUSY_TIMEOUT_SECS;
use crate::error::PersistenceError;
use crate::observability::metrics::storage;
use crate::storage::{FluStore, ReconcileOutcome, StoredRecord};
use crate::types::{NaturalKey, Region, Season, ValidatedRecord};

const MIGRATION: &str = include_str!("../migrations/001_create_cdc_flu_data.sql");
const DATE_FORMAT: &str = "%Y-%m-%d";
const SELECT_ROWS: &str = "SELECT id, week_ending, season, region, percent_positive, total_specimens, timestamp FROM cdc_flu_data";

type RawRow = (i64, String, String, String, Option<f64>, Option<i64>, String);

/// SQLite-backed Reconciler. Clones share one connection; separate
/// `open` calls on the same file serialize through SQLite's write lock.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and apply the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(DEFAULT_BUSY_TIMEOUT_SECS))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self::migrate(conn)?;
        info!("Opened flu store at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        Self::migrate(Connection::open_in_memory()?)
    }

    fn migrate(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch(MIGRATION)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn.lock().map_err(|_| PersistenceError::Poisoned)
    }

    /// Apply `batch` inside one IMMEDIATE transaction. Any failure drops the
    /// transaction uncommitted, which rolls every statement of the batch back.
    pub fn reconcile_batch(&self, batch: &[ValidatedRecord]) -> Result<ReconcileOutcome, PersistenceError> {
        if batch.is_empty() {
            return Ok(ReconcileOutcome::default());
        }

        let started = Instant::now();
        let mut conn = self.lock()?;
        match apply_batch(&mut conn, batch) {
            Ok(outcome) => {
                storage::committed(outcome.inserted, outcome.updated, started.elapsed().as_secs_f64());
                debug!(
                    "Committed batch of {}: {} inserted, {} updated",
                    batch.len(),
                    outcome.inserted,
                    outcome.updated
                );
                Ok(outcome)
            }
            Err(e) => {
                storage::commit_failed();
                warn!("Rolled back batch of {}: {}", batch.len(), e);
                Err(e)
            }
        }
    }

    // Read side

    pub fn get(&self, key: &NaturalKey) -> Result<Option<StoredRecord>, PersistenceError> {
        let sql = format!("{SELECT_ROWS} WHERE season = ?1 AND region = ?2 AND week_ending = ?3");
        let rows = self.query_rows(
            &sql,
            params![key.season.to_string(), key.region.name(), format_date(key.week_ending)],
        )?;
        Ok(rows.into_iter().next())
    }

    /// Rows for one region with `from <= week_ending <= to`, oldest first.
    pub fn by_region(
        &self,
        region: Region,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<StoredRecord>, PersistenceError> {
        let sql = format!(
            "{SELECT_ROWS} WHERE region = ?1 AND week_ending >= ?2 AND week_ending <= ?3 ORDER BY week_ending"
        );
        self.query_rows(&sql, params![region.name(), format_date(from), format_date(to)])
    }

    /// Every row of a season, ordered by region then week.
    pub fn by_season(&self, season: &Season) -> Result<Vec<StoredRecord>, PersistenceError> {
        let sql = format!("{SELECT_ROWS} WHERE season = ?1");
        let mut rows = self.query_rows(&sql, params![season.to_string()])?;
        rows.sort_by_key(|r| (r.region, r.week_ending));
        Ok(rows)
    }

    /// Distinct regions present in the store.
    pub fn regions(&self) -> Result<Vec<Region>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT DISTINCT region FROM cdc_flu_data")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut regions = names
            .iter()
            .map(|name| {
                Region::from_name(name).ok_or_else(|| PersistenceError::CorruptRow(format!("unknown region '{name}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        regions.sort();
        Ok(regions)
    }

    pub fn row_count(&self) -> Result<usize, PersistenceError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cdc_flu_data", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Most recent ingestion time, i.e. how fresh the data is.
    pub fn latest_observed_at(&self) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        let conn = self.lock()?;
        let latest: Option<String> = conn.query_row("SELECT MAX(timestamp) FROM cdc_flu_data", [], |row| row.get(0))?;
        latest.map(|ts| parse_timestamp(&ts)).transpose()
    }

    fn query_rows<P: Params>(&self, sql: &str, params: P) -> Result<Vec<StoredRecord>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt
            .query_map(params, read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(into_stored).collect()
    }
}

#[async_trait]
impl FluStore for SqliteStore {
    #[instrument(skip_all, fields(batch = batch.len()))]
    async fn reconcile(&self, batch: Vec<ValidatedRecord>) -> Result<ReconcileOutcome, PersistenceError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.reconcile_batch(&batch))
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))?
    }
}

fn apply_batch(conn: &mut Connection, batch: &[ValidatedRecord]) -> Result<ReconcileOutcome, PersistenceError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut outcome = ReconcileOutcome::default();
    {
        let mut find =
            tx.prepare_cached("SELECT id FROM cdc_flu_data WHERE season = ?1 AND region = ?2 AND week_ending = ?3")?;
        let mut update = tx.prepare_cached(
            "UPDATE cdc_flu_data SET percent_positive = ?2, total_specimens = ?3, timestamp = ?4 WHERE id = ?1",
        )?;
        let mut insert = tx.prepare_cached(
            "INSERT INTO cdc_flu_data (week_ending, season, region, percent_positive, total_specimens, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;

        for record in batch {
            let season = record.key.season.to_string();
            let region = record.key.region.name();
            let week_ending = format_date(record.key.week_ending);
            let observed_at = format_timestamp(record.observed_at);

            let existing: Option<i64> = find
                .query_row(params![season, region, week_ending], |row| row.get(0))
                .optional()?;
            match existing {
                Some(id) => {
                    update.execute(params![id, record.rate, record.count, observed_at])?;
                    outcome.updated += 1;
                }
                None => {
                    insert.execute(params![week_ending, season, region, record.rate, record.count, observed_at])?;
                    outcome.inserted += 1;
                }
            }
        }
    }
    tx.commit()?;
    Ok(outcome)
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_stored(raw: RawRow) -> Result<StoredRecord, PersistenceError> {
    let (id, week_ending, season, region, rate, count, timestamp) = raw;
    let week_ending = NaiveDate::parse_from_str(&week_ending, DATE_FORMAT)
        .map_err(|e| PersistenceError::CorruptRow(format!("row {id}: week_ending '{week_ending}': {e}")))?;
    let season: Season = season
        .parse()
        .map_err(|e: String| PersistenceError::CorruptRow(format!("row {id}: {e}")))?;
    let region = Region::from_name(&region)
        .ok_or_else(|| PersistenceError::CorruptRow(format!("row {id}: unknown region '{region}'")))?;
    Ok(StoredRecord {
        id,
        week_ending,
        season,
        region,
        rate,
        count,
        observed_at: parse_timestamp(&timestamp)?,
    })
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PersistenceError::CorruptRow(format!("timestamp '{ts}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Epiweek;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 10, hour, 0, 0).unwrap()
    }

    fn record(code: i64, region: Region, rate: Option<f64>, count: Option<i64>, hour: u32) -> ValidatedRecord {
        let ew = Epiweek::from_code(code).unwrap();
        ValidatedRecord {
            key: NaturalKey {
                season: ew.season(),
                region,
                week_ending: ew.week_ending(),
            },
            rate,
            count,
            observed_at: at(hour),
        }
    }

    #[test]
    fn insert_then_update_by_natural_key() {
        let store = SqliteStore::open_in_memory().unwrap();

        let first = store
            .reconcile_batch(&[
                record(202440, Region::National, Some(3.2), Some(1500), 1),
                record(202441, Region::National, Some(3.4), Some(1600), 1),
            ])
            .unwrap();
        assert_eq!(first, ReconcileOutcome { inserted: 2, updated: 0 });

        let revised = record(202440, Region::National, Some(3.3), None, 2);
        let second = store.reconcile_batch(&[revised.clone()]).unwrap();
        assert_eq!(second, ReconcileOutcome { inserted: 0, updated: 1 });
        assert_eq!(store.row_count().unwrap(), 2);

        let stored = store.get(&revised.key).unwrap().unwrap();
        assert_eq!(stored.rate, Some(3.3));
        assert_eq!(stored.count, None);
        assert_eq!(stored.observed_at, at(2));
        assert_eq!(stored.season.to_string(), "2024-25");
    }

    #[test]
    fn constraint_violation_rolls_back_whole_batch() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .reconcile_batch(&[record(202440, Region::Hhs1, Some(1.0), Some(10), 1)])
            .unwrap();

        // Bypasses the gate; the CHECK constraint catches the third row.
        let err = store
            .reconcile_batch(&[
                record(202440, Region::Hhs1, Some(9.0), Some(90), 2),
                record(202441, Region::Hhs1, Some(2.0), Some(20), 2),
                record(202442, Region::Hhs1, Some(150.0), Some(30), 2),
            ])
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Database(_)));

        assert_eq!(store.row_count().unwrap(), 1);
        let key = record(202440, Region::Hhs1, None, None, 0).key;
        let stored = store.get(&key).unwrap().unwrap();
        assert_eq!(stored.rate, Some(1.0));
        assert_eq!(stored.observed_at, at(1));
    }

    #[test]
    fn read_queries() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.latest_observed_at().unwrap(), None);

        store
            .reconcile_batch(&[
                record(202439, Region::Hhs2, Some(1.0), Some(1), 1),
                record(202440, Region::Hhs2, Some(2.0), Some(2), 1),
                record(202441, Region::Hhs2, Some(3.0), Some(3), 3),
                record(202440, Region::National, Some(4.0), Some(4), 2),
            ])
            .unwrap();

        let window = store
            .by_region(
                Region::Hhs2,
                NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 10, 31).unwrap(),
            )
            .unwrap();
        let weeks: Vec<_> = window.iter().map(|r| r.week_ending.to_string()).collect();
        assert_eq!(weeks, vec!["2024-10-05", "2024-10-12"]);

        let season = store.by_season(&Season::new(2024)).unwrap();
        assert_eq!(season.len(), 3);
        assert_eq!(season[0].region, Region::National);

        assert_eq!(store.regions().unwrap(), vec![Region::National, Region::Hhs2]);
        assert_eq!(store.latest_observed_at().unwrap(), Some(at(3)));
    }

    #[tokio::test]
    async fn trait_reconcile_runs_off_the_runtime() {
        let store = SqliteStore::open_in_memory().unwrap();
        let outcome = FluStore::reconcile(&store, vec![record(202501, Region::Hhs9, Some(5.0), Some(50), 1)])
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(store.row_count().unwrap(), 1);
    }
}
