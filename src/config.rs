use std::path::PathBuf;

use crate::pricing::{PricingPolicy, PricingStrategy, SeasonCalendar};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Variable set but not understood. Carries (name, value).
    Invalid(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid(name, value) => write!(f, "invalid {name}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Server settings, read once from `STAYBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub pricing: PricingPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7878,
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            max_connections: 256,
            compact_threshold: 1000,
            pricing: PricingPolicy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Pricing settings fail closed; tuning knobs fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let strategy = match get("STAYBOOK_PRICING") {
            Some(s) => s
                .parse::<PricingStrategy>()
                .map_err(|_| ConfigError::Invalid("STAYBOOK_PRICING", s))?,
            None => PricingStrategy::default(),
        };
        let seasons = match get("STAYBOOK_HIGH_SEASON_MONTHS") {
            Some(s) => parse_months(&s)
                .ok_or_else(|| ConfigError::Invalid("STAYBOOK_HIGH_SEASON_MONTHS", s))?,
            None => SeasonCalendar::default(),
        };
        let port = match get("STAYBOOK_PORT") {
            Some(s) => s
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid("STAYBOOK_PORT", s))?,
            None => defaults.port,
        };

        Ok(Self {
            bind: get("STAYBOOK_BIND").unwrap_or(defaults.bind),
            port,
            data_dir: get("STAYBOOK_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            metrics_port: get("STAYBOOK_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            max_connections: get("STAYBOOK_MAX_CONNECTIONS")
                .and_then(|s| s.trim().parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: get("STAYBOOK_COMPACT_THRESHOLD")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.compact_threshold),
            pricing: PricingPolicy::new(strategy, seasons),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("staybook.wal")
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_months(s: &str) -> Option<SeasonCalendar> {
    let months: Vec<u32> = s
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(|m| m.parse().ok())
        .collect::<Option<_>>()?;
    SeasonCalendar::from_high_months(&months)
}
