use serde::Deserialize;
use std::{env, path::Path, str::FromStr, time::Duration};
use thiserror::Error;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_FILL_THRESHOLD: f64 = 60.0;
pub const DEFAULT_DESCRIPTION_MIN: usize = 1300;
pub const DEFAULT_DESCRIPTION_MAX: usize = 2000;
pub const DEFAULT_MAX_TITLE_LEN: usize = 60;
/// Confidence for catalog-aligned (stage 2) attributes.
pub const CATALOG_CONFIDENCE: f32 = 0.95;
/// Confidence for attributes mined from free-form (stage 1) output.
pub const FREEFORM_CONFIDENCE: f32 = 0.85;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub retry: RetrySettings,
    pub tasks: TaskSettings,
    pub scoring: ScoringConfig,
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub request_max_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            request_max_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
        }
    }
}

impl RetrySettings {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskSettings {
    pub timeout_secs: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
        }
    }
}

impl TaskSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub fill_threshold: f64,
    pub description_min: usize,
    pub description_max: usize,
    pub max_title_len: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            fill_threshold: DEFAULT_FILL_THRESHOLD,
            description_min: DEFAULT_DESCRIPTION_MIN,
            description_max: DEFAULT_DESCRIPTION_MAX,
            max_title_len: DEFAULT_MAX_TITLE_LEN,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    pub catalog_confidence: f32,
    pub freeform_confidence: f32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            catalog_confidence: CATALOG_CONFIDENCE,
            freeform_confidence: FREEFORM_CONFIDENCE,
        }
    }
}

impl AppConfig {
    /// Defaults, then the optional YAML file named by `CARDFORGE_CONFIG`,
    /// then individual environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var("CARDFORGE_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_yaml_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(port) = parse_opt::<u16>(get("PORT")) {
            self.server.port = port;
        }
        if let Some(limit) = parse_opt::<usize>(get("REQUEST_MAX_BYTES")).filter(|v| *v > 0) {
            self.server.request_max_bytes = limit;
        }
        if let Some(attempts) = parse_opt::<u32>(get("STAGE_MAX_RETRIES")).filter(|v| *v >= 1) {
            self.retry.max_attempts = attempts;
        }
        if let Some(base) = parse_opt::<u64>(get("STAGE_BACKOFF_BASE_MS")) {
            self.retry.backoff_base_ms = base;
        }
        if let Some(timeout) = parse_opt::<u64>(get("TASK_TIMEOUT_SECS")).filter(|v| *v > 0) {
            self.tasks.timeout_secs = timeout;
        }
        if let Some(threshold) = parse_opt::<f64>(get("QUALITY_FILL_THRESHOLD")) {
            self.scoring.fill_threshold = threshold;
        }
        if let Some(min) = parse_opt::<usize>(get("QUALITY_DESC_MIN")) {
            self.scoring.description_min = min;
        }
        if let Some(max) = parse_opt::<usize>(get("QUALITY_DESC_MAX")) {
            self.scoring.description_max = max;
        }
        if let Some(title) = parse_opt::<usize>(get("QUALITY_MAX_TITLE_LEN")).filter(|v| *v > 0) {
            self.scoring.max_title_len = title;
        }
        if let Some(conf) = parse_opt::<f32>(get("CONFIDENCE_CATALOG")) {
            self.reconcile.catalog_confidence = conf;
        }
        if let Some(conf) = parse_opt::<f32>(get("CONFIDENCE_FREEFORM")) {
            self.reconcile.freeform_confidence = conf;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.scoring.description_min > self.scoring.description_max {
            return Err(ConfigError::Invalid(format!(
                "description window is inverted: {} > {}",
                self.scoring.description_min, self.scoring.description_max
            )));
        }
        if !(0.0..=100.0).contains(&self.scoring.fill_threshold) || self.scoring.fill_threshold == 0.0 {
            return Err(ConfigError::Invalid(format!(
                "fill_threshold must be within (0, 100], got {}",
                self.scoring.fill_threshold
            )));
        }
        for (name, value) in [
            ("catalog_confidence", self.reconcile.catalog_confidence),
            ("freeform_confidence", self.reconcile.freeform_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        Ok(())
    }
}

fn parse_opt<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.parse::<T>().ok())
}
