use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::orchestrator::RunSummary;
use crate::types::Region;

/// A region's fetch could not produce records.
#[derive(Error, Debug)]
#[error("fetch failed for {region}: {kind}")]
pub struct FetchError {
    pub region: Region,
    pub kind: FetchErrorKind,
}

#[derive(Error, Debug)]
pub enum FetchErrorKind {
    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("malformed response body: {0}")]
    Malformed(String),

    #[error("provider returned result {code}: {message}")]
    Provider { code: i64, message: String },
}

impl FetchError {
    pub fn new(region: Region, kind: FetchErrorKind) -> Self {
        Self { region, kind }
    }

    /// True when the failure came from the network or HTTP status rather
    /// than from the content of a response.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, FetchErrorKind::RetriesExhausted { .. })
    }
}

/// One raw record could not be mapped to the canonical schema.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("malformed epiweek code {0}")]
    InvalidEpiweek(i64),

    #[error("week {week} does not exist in epiweek year {year}")]
    WeekOutOfRange { year: i32, week: u32 },

    #[error("unrecognized region code '{0}'")]
    UnknownRegion(String),

    #[error("row does not have the expected shape: {0}")]
    MalformedRow(String),
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored row is corrupt: {0}")]
    CorruptRow(String),

    #[error("storage task failed: {0}")]
    Task(String),

    #[error("store connection lock poisoned")]
    Poisoned,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("TOML deserialization failed: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum EtlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("total outage: all {regions} attempted regions failed to fetch")]
    TotalOutage {
        regions: usize,
        summary: Box<RunSummary>,
    },
}

pub type Result<T> = std::result::Result<T, EtlError>;
