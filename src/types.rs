use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::constants::SEASON_START_WEEK;
use crate::error::MappingError;

/// Aggregation regions published by the provider. The set is closed: every
/// provider code maps to exactly one variant and nothing else is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Region {
    National,
    Hhs1,
    Hhs2,
    Hhs3,
    Hhs4,
    Hhs5,
    Hhs6,
    Hhs7,
    Hhs8,
    Hhs9,
    Hhs10,
}

impl Region {
    pub const ALL: [Region; 11] = [
        Region::National,
        Region::Hhs1,
        Region::Hhs2,
        Region::Hhs3,
        Region::Hhs4,
        Region::Hhs5,
        Region::Hhs6,
        Region::Hhs7,
        Region::Hhs8,
        Region::Hhs9,
        Region::Hhs10,
    ];

    /// Provider-side code, as sent in the `regions` query parameter.
    pub fn code(self) -> &'static str {
        match self {
            Region::National => "nat",
            Region::Hhs1 => "hhs1",
            Region::Hhs2 => "hhs2",
            Region::Hhs3 => "hhs3",
            Region::Hhs4 => "hhs4",
            Region::Hhs5 => "hhs5",
            Region::Hhs6 => "hhs6",
            Region::Hhs7 => "hhs7",
            Region::Hhs8 => "hhs8",
            Region::Hhs9 => "hhs9",
            Region::Hhs10 => "hhs10",
        }
    }

    /// Canonical name, as stored in the `region` column.
    pub fn name(self) -> &'static str {
        match self {
            Region::National => "National",
            Region::Hhs1 => "HHS Region 1",
            Region::Hhs2 => "HHS Region 2",
            Region::Hhs3 => "HHS Region 3",
            Region::Hhs4 => "HHS Region 4",
            Region::Hhs5 => "HHS Region 5",
            Region::Hhs6 => "HHS Region 6",
            Region::Hhs7 => "HHS Region 7",
            Region::Hhs8 => "HHS Region 8",
            Region::Hhs9 => "HHS Region 9",
            Region::Hhs10 => "HHS Region 10",
        }
    }

    pub fn from_code(code: &str) -> Option<Region> {
        Self::ALL.into_iter().find(|r| r.code() == code)
    }

    pub fn from_name(name: &str) -> Option<Region> {
        Self::ALL.into_iter().find(|r| r.name() == name)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Region {
    type Err = MappingError;

    /// Accepts either the provider code or the canonical name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Region::from_code(s)
            .or_else(|| Region::from_name(s))
            .ok_or_else(|| MappingError::UnknownRegion(s.to_string()))
    }
}

impl Serialize for Region {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// First day (Sunday) of MMWR week 1: the Sunday-Saturday week holding at
/// least four days of January.
fn week_one_start(year: i32) -> Option<NaiveDate> {
    let jan1 = NaiveDate::from_ymd_opt(year, 1, 1)?;
    let offset = i64::from(jan1.weekday().num_days_from_sunday());
    if offset <= 3 {
        Some(jan1 - Duration::days(offset))
    } else {
        Some(jan1 + Duration::days(7 - offset))
    }
}

/// A provider epiweek (`YYYYWW`), MMWR convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epiweek {
    year: i32,
    week: u32,
    ending: NaiveDate,
}

impl Epiweek {
    pub fn new(year: i32, week: u32) -> Result<Self, MappingError> {
        let out_of_range = MappingError::WeekOutOfRange { year, week };
        let start = week_one_start(year).ok_or_else(|| out_of_range.clone())?;
        let next = week_one_start(year + 1).ok_or_else(|| out_of_range.clone())?;
        let weeks_in_year = ((next - start).num_days() / 7) as u32;
        if week == 0 || week > weeks_in_year {
            return Err(out_of_range);
        }
        let ending = start + Duration::days(7 * i64::from(week - 1) + 6);
        Ok(Self { year, week, ending })
    }

    /// Parses the integer `YYYYWW` encoding.
    pub fn from_code(code: i64) -> Result<Self, MappingError> {
        if !(100_000..=999_999).contains(&code) {
            return Err(MappingError::InvalidEpiweek(code));
        }
        let year = (code / 100) as i32;
        let week = (code % 100) as u32;
        if !(1..=53).contains(&week) {
            return Err(MappingError::WeekOutOfRange { year, week });
        }
        Self::new(year, week)
    }

    /// The epiweek a calendar date falls in.
    pub fn containing(date: NaiveDate) -> Option<Self> {
        let mut year = date.year();
        if date >= week_one_start(year + 1)? {
            year += 1;
        } else if date < week_one_start(year)? {
            year -= 1;
        }
        let start = week_one_start(year)?;
        let week = ((date - start).num_days() / 7) as u32 + 1;
        Self::new(year, week).ok()
    }

    pub fn code(&self) -> i64 {
        i64::from(self.year) * 100 + i64::from(self.week)
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn week(&self) -> u32 {
        self.week
    }

    /// Saturday closing this epiweek.
    pub fn week_ending(&self) -> NaiveDate {
        self.ending
    }

    pub fn season(&self) -> Season {
        if self.week >= SEASON_START_WEEK {
            Season::new(self.year)
        } else {
            Season::new(self.year - 1)
        }
    }
}

impl fmt::Display for Epiweek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:02}", self.year, self.week)
    }
}

impl Serialize for Epiweek {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

/// Inclusive range of epiweeks requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WeekRange {
    pub start: Epiweek,
    pub end: Epiweek,
}

impl WeekRange {
    pub fn new(start: Epiweek, end: Epiweek) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Week 40 of the running season's first year through the week holding `today`.
    pub fn season_to_date(today: NaiveDate) -> Option<Self> {
        let current = Epiweek::containing(today)?;
        let start = Epiweek::new(current.season().start_year(), SEASON_START_WEEK).ok()?;
        Self::new(start, current)
    }
}

impl fmt::Display for WeekRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Surveillance season, labelled `YYYY-YY` (e.g. `2024-25`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Season {
    start_year: i32,
}

impl Season {
    pub fn new(start_year: i32) -> Self {
        Self { start_year }
    }

    pub fn start_year(&self) -> i32 {
        self.start_year
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.start_year, (self.start_year + 1).rem_euclid(100))
    }
}

impl FromStr for Season {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (first, second) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("season '{s}' is not of the form YYYY-YY"))?;
        let start_year: i32 = first
            .parse()
            .map_err(|_| format!("season '{s}' has a non-numeric start year"))?;
        let season = Season::new(start_year);
        if second.len() != 2 || season.to_string() != s.trim() {
            return Err(format!("season '{s}' does not span consecutive years"));
        }
        Ok(season)
    }
}

impl Serialize for Season {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One entry of the provider's `epidata` array, untyped as returned. Rows
/// are typed one at a time during mapping.
pub type RawRow = serde_json::Value;

/// The fields of a provider row that the stored schema uses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub epiweek: Option<i64>,
    pub region: Option<String>,
    /// Unweighted ILI percentage.
    pub ili: Option<f64>,
    pub num_patients: Option<i64>,
}

impl RawRecord {
    /// Type one provider row. A field of the wrong type fails this row only.
    pub fn from_row(row: &RawRow) -> Result<Self, MappingError> {
        Self::deserialize(row).map_err(|e| MappingError::MalformedRow(e.to_string()))
    }
}

impl From<RawRecord> for RawRow {
    fn from(record: RawRecord) -> Self {
        serde_json::json!({
            "epiweek": record.epiweek,
            "region": record.region,
            "ili": record.ili,
            "num_patients": record.num_patients,
        })
    }
}

/// A raw record mapped onto the stored schema. Fields the provider left
/// out stay `None`; admissibility is decided by the quality gate.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub week_ending: Option<NaiveDate>,
    pub season: Option<Season>,
    pub region: Option<Region>,
    pub rate: Option<f64>,
    pub count: Option<i64>,
    pub observed_at: DateTime<Utc>,
}

/// Natural key of a stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NaturalKey {
    pub season: Season,
    pub region: Region,
    pub week_ending: NaiveDate,
}

/// A record accepted by the quality gate; its key is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecord {
    pub key: NaturalKey,
    pub rate: Option<f64>,
    pub count: Option<i64>,
    pub observed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn week_ending_is_the_saturday_of_the_mmwr_week() {
        assert_eq!(Epiweek::from_code(202440).unwrap().week_ending(), date(2024, 10, 5));
        assert_eq!(Epiweek::from_code(202401).unwrap().week_ending(), date(2024, 1, 6));
        // 2025 week 1 starts on Sunday 2024-12-29
        assert_eq!(Epiweek::from_code(202501).unwrap().week_ending(), date(2025, 1, 4));
    }

    #[test]
    fn week_53_only_exists_in_long_years() {
        assert_eq!(Epiweek::from_code(202053).unwrap().week_ending(), date(2021, 1, 2));
        assert_eq!(
            Epiweek::from_code(202453),
            Err(MappingError::WeekOutOfRange { year: 2024, week: 53 })
        );
    }

    #[test]
    fn rejects_weeks_outside_1_to_53() {
        assert!(matches!(
            Epiweek::from_code(202400),
            Err(MappingError::WeekOutOfRange { week: 0, .. })
        ));
        assert!(matches!(
            Epiweek::from_code(202454),
            Err(MappingError::WeekOutOfRange { week: 54, .. })
        ));
        assert_eq!(Epiweek::from_code(24401), Err(MappingError::InvalidEpiweek(24401)));
    }

    #[test]
    fn season_boundary_is_week_40() {
        assert_eq!(Epiweek::from_code(202439).unwrap().season().to_string(), "2023-24");
        assert_eq!(Epiweek::from_code(202440).unwrap().season().to_string(), "2024-25");
        assert_eq!(Epiweek::from_code(199952).unwrap().season().to_string(), "1999-00");
    }

    #[test]
    fn containing_handles_year_edges() {
        let ew = Epiweek::containing(date(2024, 12, 31)).unwrap();
        assert_eq!((ew.year(), ew.week()), (2025, 1));
        let ew = Epiweek::containing(date(2021, 1, 1)).unwrap();
        assert_eq!((ew.year(), ew.week()), (2020, 53));
        let ew = Epiweek::containing(date(2024, 10, 5)).unwrap();
        assert_eq!(ew.code(), 202440);
    }

    #[test]
    fn season_to_date_starts_at_week_40() {
        let range = WeekRange::season_to_date(date(2025, 2, 12)).unwrap();
        assert_eq!(range.start.code(), 202440);
        assert_eq!(range.end.code(), 202507);
        assert_eq!(range.to_string(), "202440-202507");

        let range = WeekRange::season_to_date(date(2024, 10, 16)).unwrap();
        assert_eq!(range.start.code(), 202440);
        assert_eq!(range.end.code(), 202442);
    }

    #[test]
    fn region_table_is_exhaustive_and_round_trips() {
        for region in Region::ALL {
            assert_eq!(Region::from_code(region.code()), Some(region));
            assert_eq!(Region::from_name(region.name()), Some(region));
        }
        assert_eq!("hhs10".parse::<Region>().unwrap().name(), "HHS Region 10");
        assert_eq!("National".parse::<Region>().unwrap(), Region::National);
        assert!("hhs11".parse::<Region>().is_err());
    }

    #[test]
    fn season_parses_its_own_label() {
        assert_eq!("2024-25".parse::<Season>().unwrap(), Season::new(2024));
        assert!("2024-26".parse::<Season>().is_err());
        assert!("2024".parse::<Season>().is_err());
    }
}
