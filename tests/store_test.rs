use anyhow::Result;
use chrono::{TimeZone, Utc};
use flu_etl::db::SqliteStore;
use flu_etl::storage::{FluStore, ReconcileOutcome};
use flu_etl::types::{Epiweek, NaturalKey, Region, Season, ValidatedRecord};
use tempfile::tempdir;

fn record(code: i64, region: Region, rate: f64, count: i64, minute: u32) -> ValidatedRecord {
    let ew = Epiweek::from_code(code).unwrap();
    ValidatedRecord {
        key: NaturalKey {
            season: ew.season(),
            region,
            week_ending: ew.week_ending(),
        },
        rate: Some(rate),
        count: Some(count),
        observed_at: Utc.with_ymd_and_hms(2025, 1, 6, 12, minute, 0).unwrap(),
    }
}

#[tokio::test]
async fn test_rows_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("nested").join("flu.db");

    {
        let store = SqliteStore::open(&path)?;
        let outcome = store
            .reconcile(vec![
                record(202452, Region::Hhs5, 4.0, 400, 0),
                record(202501, Region::Hhs5, 4.5, 450, 0),
            ])
            .await?;
        assert_eq!(outcome, ReconcileOutcome { inserted: 2, updated: 0 });
    }

    let store = SqliteStore::open(&path)?;
    assert_eq!(store.row_count()?, 2);
    // Both weeks belong to the 2024-25 season even though they straddle New Year.
    let season = store.by_season(&Season::new(2024))?;
    assert_eq!(season.len(), 2);
    assert_eq!(season[1].week_ending.to_string(), "2025-01-04");
    Ok(())
}

#[tokio::test]
async fn test_separate_connections_serialize_writes() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("flu.db");
    let left = SqliteStore::open(&path)?;
    let right = SqliteStore::open(&path)?;

    let batch = |rate: f64, minute: u32| -> Vec<ValidatedRecord> {
        (40..=52)
            .map(|week| record(202400 + week, Region::National, rate, 100, minute))
            .collect()
    };

    let (a, b) = tokio::join!(left.reconcile(batch(1.0, 1)), right.reconcile(batch(2.0, 2)));
    let (a, b) = (a?, b?);

    assert_eq!(a.inserted + b.inserted, 13);
    assert_eq!(a.updated + b.updated, 13);
    assert_eq!(left.row_count()?, 13);

    // Every row carries the fields of one batch, never a blend of both.
    let rows = left.by_season(&Season::new(2024))?;
    let winner = rows[0].rate;
    assert!(rows.iter().all(|r| r.rate == winner));
    for row in &rows {
        let expected_minute = if winner == Some(1.0) { 1 } else { 2 };
        assert_eq!(row.observed_at, Utc.with_ymd_and_hms(2025, 1, 6, 12, expected_minute, 0).unwrap());
    }
    Ok(())
}

#[tokio::test]
async fn test_lookup_by_natural_key() -> Result<()> {
    let store = SqliteStore::open_in_memory()?;
    let target = record(202445, Region::Hhs3, 2.2, 220, 5);
    store.reconcile(vec![target.clone(), record(202446, Region::Hhs3, 2.4, 240, 5)]).await?;

    let row = store.get(&target.key)?.expect("row stored");
    assert_eq!(row.key(), target.key);
    assert_eq!(row.rate, Some(2.2));
    assert_eq!(row.count, Some(220));

    let missing = NaturalKey {
        region: Region::Hhs4,
        ..target.key
    };
    assert!(store.get(&missing)?.is_none());
    Ok(())
}
