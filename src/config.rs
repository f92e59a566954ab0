use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::constants;
use crate::error::ConfigError;
use crate::types::Region;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub pipeline: PipelineConfig,
    pub quality: QualityGateConfig,
    pub database: DatabaseConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: constants::DEFAULT_FLUVIEW_URL.to_string(),
            timeout_secs: constants::DEFAULT_TIMEOUT_SECS,
            max_attempts: constants::DEFAULT_MAX_ATTEMPTS,
            retry_delay_secs: constants::DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Provider region codes processed by a default run.
    pub regions: Vec<String>,
    /// Upper bound on regions processed at the same time.
    pub concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            regions: Region::ALL.iter().map(|r| r.code().to_string()).collect(),
            concurrency: constants::DEFAULT_CONCURRENCY,
        }
    }
}

impl PipelineConfig {
    pub fn resolve_regions(&self) -> Result<Vec<Region>, ConfigError> {
        self.regions
            .iter()
            .map(|code| {
                code.parse::<Region>()
                    .map_err(|e| ConfigError::Invalid(format!("pipeline.regions: {e}")))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualityGateConfig {
    pub rate_min: f64,
    pub rate_max: f64,
    /// Batch rejection rate above which a quality alarm is raised.
    pub alarm_threshold: f64,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            rate_min: constants::DEFAULT_RATE_MIN,
            rate_max: constants::DEFAULT_RATE_MAX,
            alarm_threshold: constants::DEFAULT_ALARM_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(constants::DEFAULT_DATABASE_PATH),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_hours: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_hours: constants::DEFAULT_SCHEDULE_INTERVAL_HOURS,
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 60 * 60)
    }
}

impl Config {
    /// Loads configuration from `path`, or from `flu_etl.toml` in the working
    /// directory when present, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(constants::DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    debug!("No {} found, using defaults", constants::DEFAULT_CONFIG_FILE);
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded configuration from {}", path.display());
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(constants::ENV_API_URL) {
            if !url.trim().is_empty() {
                self.source.base_url = url;
            }
        }
        if let Ok(path) = std::env::var(constants::ENV_DATABASE_PATH) {
            if !path.trim().is_empty() {
                self.database.path = PathBuf::from(path);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.max_attempts == 0 {
            return Err(ConfigError::Invalid("source.max_attempts must be at least 1".into()));
        }
        if self.source.timeout_secs == 0 {
            return Err(ConfigError::Invalid("source.timeout_secs must be at least 1".into()));
        }
        if self.pipeline.concurrency == 0 {
            return Err(ConfigError::Invalid("pipeline.concurrency must be at least 1".into()));
        }
        if self.quality.rate_min > self.quality.rate_max {
            return Err(ConfigError::Invalid(format!(
                "quality.rate_min ({}) exceeds quality.rate_max ({})",
                self.quality.rate_min, self.quality.rate_max
            )));
        }
        if !(0.0..=1.0).contains(&self.quality.alarm_threshold) {
            return Err(ConfigError::Invalid(
                "quality.alarm_threshold must lie in [0, 1]".into(),
            ));
        }
        if self.schedule.interval_hours == 0 {
            return Err(ConfigError::Invalid("schedule.interval_hours must be at least 1".into()));
        }
        self.pipeline.resolve_regions()?;
        Ok(())
    }
}
