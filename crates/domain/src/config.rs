//! Environment-driven configuration structures shared by all binaries.

use std::{collections::HashSet, env, str::FromStr, time::Duration};

use thiserror::Error;

/// Process wiring derived from `.env`/process variables: where the ledger
/// lives, where alerts go, and how often the bundled trigger fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    database_url: String,
    backend_base_url: String,
    webhook_token: String,
    schedule_minutes: u64,
}

impl BootstrapConfig {
    pub const DEFAULT_BACKEND_BASE_URL: &'static str = "http://backend:3000";
    pub const DEFAULT_WEBHOOK_TOKEN: &'static str = "super-secret";
    pub const DEFAULT_SCHEDULE_MINUTES: u64 = 5;

    /// Loads configuration by hydrating `.env` (if present) and reading the
    /// process variables. Missing or malformed entries surface as
    /// `ConfigError` so binaries can respond gracefully.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let database_url = get_required_var("DATABASE_URL")?;
        let backend_base_url = get_optional_var("BACKEND_BASE_URL")
            .unwrap_or_else(|| Self::DEFAULT_BACKEND_BASE_URL.to_string());
        let webhook_token = get_optional_var("ANALYTICS_WEBHOOK_TOKEN")
            .unwrap_or_else(|| Self::DEFAULT_WEBHOOK_TOKEN.to_string());
        let schedule_minutes =
            parse_var("SCHEDULE_MINUTES")?.unwrap_or(Self::DEFAULT_SCHEDULE_MINUTES);

        Ok(Self {
            database_url,
            backend_base_url,
            webhook_token,
            schedule_minutes: schedule_minutes.max(1),
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn backend_base_url(&self) -> &str {
        &self.backend_base_url
    }

    pub fn webhook_token(&self) -> &str {
        &self.webhook_token
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_minutes * 60)
    }
}

/// Detector knobs. Each detector can be switched off independently.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub use_iqr: bool,
    pub use_zscore: bool,
    pub use_isolation: bool,
    pub iqr_multiplier: f64,
    pub zscore_threshold: f64,
    pub isolation_min_samples: usize,
    /// Confidence in the batch being clean; contamination is derived from it.
    pub detection_confidence: f64,
    pub isolation_trees: usize,
    pub isolation_seed: u64,
}

impl DetectorSettings {
    /// Expected anomaly rate, floored at 1%.
    pub fn contamination(&self) -> f64 {
        (1.0 - self.detection_confidence).max(0.01)
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            use_iqr: true,
            use_zscore: true,
            use_isolation: true,
            iqr_multiplier: 1.5,
            zscore_threshold: 3.0,
            isolation_min_samples: 20,
            detection_confidence: 0.95,
            isolation_trees: 100,
            isolation_seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierSettings {
    pub dedup_ttl: Duration,
    pub dedup_prefix: String,
    /// Lower-cased addresses exempt from alerting.
    pub whitelist: HashSet<String>,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            dedup_ttl: Duration::from_secs(604_800),
            dedup_prefix: "an:dup:".to_string(),
            whitelist: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub base: Duration,
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

/// Stable keys for the two cursor scalars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkKeys {
    pub block: String,
    pub log: String,
}

impl Default for WatermarkKeys {
    fn default() -> Self {
        Self {
            block: "an:wm:block".to_string(),
            log: "an:wm:log".to_string(),
        }
    }
}

/// Everything a scan run needs besides its collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    pub lookback_days: u32,
    pub max_batch_size: u64,
    /// Expected payment size in smallest units; `ratio = amount / reference_price`.
    pub reference_price: u128,
    pub amount_decimals: u32,
    /// Hold the watermark back when any delivery in the batch failed.
    pub strict_watermark: bool,
    pub watermark_keys: WatermarkKeys,
    pub detectors: DetectorSettings,
    pub notifier: NotifierSettings,
    pub retry: RetrySettings,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            max_batch_size: 5000,
            reference_price: 100_000_000_000_000_000,
            amount_decimals: 18,
            strict_watermark: false,
            watermark_keys: WatermarkKeys::default(),
            detectors: DetectorSettings::default(),
            notifier: NotifierSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl ScanSettings {
    /// Reads every scan knob from the environment, falling back to defaults
    /// for unset or empty variables.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;
        let defaults = Self::default();

        let detectors = DetectorSettings {
            use_iqr: parse_flag("USE_IQR")?.unwrap_or(defaults.detectors.use_iqr),
            use_zscore: parse_flag("USE_ZSCORE")?.unwrap_or(defaults.detectors.use_zscore),
            use_isolation: parse_flag("USE_ISO")?.unwrap_or(defaults.detectors.use_isolation),
            iqr_multiplier: parse_var("IQR_MULTIPLIER")?
                .unwrap_or(defaults.detectors.iqr_multiplier),
            zscore_threshold: parse_var("ZSCORE_THRESHOLD")?
                .unwrap_or(defaults.detectors.zscore_threshold),
            isolation_min_samples: parse_var("ISO_MIN_SAMPLES")?
                .unwrap_or(defaults.detectors.isolation_min_samples),
            detection_confidence: parse_var("ANOMALY_DETECTION_THRESHOLD")?
                .unwrap_or(defaults.detectors.detection_confidence),
            isolation_trees: parse_var("ISO_TREES")?
                .unwrap_or(defaults.detectors.isolation_trees),
            isolation_seed: parse_var("ISO_SEED")?.unwrap_or(defaults.detectors.isolation_seed),
        };

        let notifier = NotifierSettings {
            dedup_ttl: parse_var("ALERT_TTL_SECONDS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.notifier.dedup_ttl),
            dedup_prefix: get_optional_var("DEDUP_PREFIX")
                .unwrap_or(defaults.notifier.dedup_prefix),
            whitelist: get_optional_var("WHITELIST_ADDRESSES")
                .map(|raw| parse_address_list(&raw))
                .unwrap_or_default(),
        };

        let retry = RetrySettings {
            base: parse_var("SCAN_RETRY_BASE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry.base),
            max_retries: parse_var("SCAN_MAX_RETRIES")?.unwrap_or(defaults.retry.max_retries),
        };

        let watermark_keys = WatermarkKeys {
            block: get_optional_var("WATERMARK_KEY_BLOCK").unwrap_or(defaults.watermark_keys.block),
            log: get_optional_var("WATERMARK_KEY_LOG").unwrap_or(defaults.watermark_keys.log),
        };

        Ok(Self {
            lookback_days: parse_var("ANALYSIS_WINDOW_DAYS")?.unwrap_or(defaults.lookback_days),
            max_batch_size: parse_var("MAX_ROWS_PER_SCAN")?.unwrap_or(defaults.max_batch_size),
            reference_price: parse_var("SUBSCRIPTION_PRICE_WEI")?
                .unwrap_or(defaults.reference_price),
            amount_decimals: parse_var("AMOUNT_DECIMALS")?.unwrap_or(defaults.amount_decimals),
            strict_watermark: parse_flag("SCAN_STRICT_WATERMARK")?
                .unwrap_or(defaults.strict_watermark),
            watermark_keys,
            detectors,
            notifier,
            retry,
        })
    }
}

/// Splits a comma separated address list, trimming and lower-casing entries.
pub fn parse_address_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

fn get_required_var(key: &'static str) -> Result<String, ConfigError> {
    get_optional_var(key).ok_or(ConfigError::MissingVar { key })
}

fn get_optional_var(key: &'static str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_var<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_optional_var(key)
        .map(|value| {
            value.parse().map_err(|err: T::Err| ConfigError::InvalidValue {
                key,
                reason: err.to_string(),
            })
        })
        .transpose()
}

fn parse_flag(key: &'static str) -> Result<Option<bool>, ConfigError> {
    get_optional_var(key)
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key,
                reason: format!("expected a boolean, got `{value}`"),
            }),
        })
        .transpose()
}

pub fn hydrate_env_file() -> Result<(), ConfigError> {
    if env::var_os("PAY_SENTINEL_SKIP_DOTENV").is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted when `.env` hydration or environment parsing fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{key}`")]
    MissingVar { key: &'static str },
    #[error("invalid value in `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}
