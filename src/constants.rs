//! Defaults shared by the configuration layer and the pipeline stages.

// Delphi Epidata fluview endpoint (CDC ILINet, weekly)
pub const DEFAULT_FLUVIEW_URL: &str = "https://api.delphi.cmu.edu/epidata/fluview/";
pub const FLUVIEW_SOURCE_NAME: &str = "fluview";

// Source client
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;

// Provider result codes
pub const PROVIDER_RESULT_SUCCESS: i64 = 1;
pub const PROVIDER_RESULT_NO_RESULTS: i64 = -2;

/// First epiweek of a surveillance season.
pub const SEASON_START_WEEK: u32 = 40;

// Quality gate
pub const DEFAULT_RATE_MIN: f64 = 0.0;
pub const DEFAULT_RATE_MAX: f64 = 100.0;
pub const DEFAULT_ALARM_THRESHOLD: f64 = 0.5;

// Orchestration
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_SCHEDULE_INTERVAL_HOURS: u64 = 6;

// Storage
pub const DEFAULT_DATABASE_PATH: &str = "data/flu_etl.db";
pub const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 30;

// Configuration sources
pub const DEFAULT_CONFIG_FILE: &str = "flu_etl.toml";
pub const ENV_API_URL: &str = "FLU_ETL_API_URL";
pub const ENV_DATABASE_PATH: &str = "FLU_ETL_DATABASE_PATH";
pub const ENV_METRICS_ADDR: &str = "FLU_ETL_METRICS_ADDR";
