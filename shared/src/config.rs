use crate::{Error, Result};
use serde::Deserialize;
use std::str::FromStr;
use tracing::warn;

/// Raw cache settings for the check aggregator, as read from the environment.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CheckSettings {
    pub num_entries: usize,
    pub flush_interval_ms: u64,
    pub expiration_ms: u64,
}

/// Raw cache settings for the quota aggregator.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct QuotaSettings {
    pub num_entries: usize,
    pub refresh_interval_ms: u64,
    pub expiration_interval_ms: u64,
}

/// Raw cache settings for the report aggregator.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ReportSettings {
    pub num_entries: usize,
    pub flush_interval_ms: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    pub service_name: String,
    pub service_config_id: String,
    pub check: CheckSettings,
    pub quota: QuotaSettings,
    pub report: ReportSettings,
}

impl ClientConfig {
    pub const DEFAULT_CACHE_ENTRIES: usize = 10_000;
    pub const DEFAULT_CHECK_FLUSH_INTERVAL_MS: u64 = 500;
    pub const DEFAULT_CHECK_EXPIRATION_MS: u64 = 1_000;
    pub const DEFAULT_QUOTA_REFRESH_INTERVAL_MS: u64 = 1_000;
    pub const DEFAULT_QUOTA_EXPIRATION_MS: u64 = 60_000;
    pub const DEFAULT_REPORT_FLUSH_INTERVAL_MS: u64 = 1_000;

    /// Build a config from `SCC_*` environment variables, falling back to the
    /// defaults for anything unset. A variable that is set but does not parse
    /// is an error rather than a silent fallback.
    pub fn from_env() -> Result<Self> {
        let service_name = std::env::var("SCC_SERVICE_NAME").unwrap_or_else(|_| {
            warn!("SCC_SERVICE_NAME not set, using 'unknown.service'");
            "unknown.service".to_string()
        });
        let service_config_id =
            std::env::var("SCC_SERVICE_CONFIG_ID").unwrap_or_else(|_| "default".to_string());

        Ok(Self {
            service_name,
            service_config_id,
            check: CheckSettings {
                num_entries: env_or("SCC_CHECK_CACHE_ENTRIES", Self::DEFAULT_CACHE_ENTRIES)?,
                flush_interval_ms: env_or(
                    "SCC_CHECK_FLUSH_INTERVAL_MS",
                    Self::DEFAULT_CHECK_FLUSH_INTERVAL_MS,
                )?,
                expiration_ms: env_or("SCC_CHECK_EXPIRATION_MS", Self::DEFAULT_CHECK_EXPIRATION_MS)?,
            },
            quota: QuotaSettings {
                num_entries: env_or("SCC_QUOTA_CACHE_ENTRIES", Self::DEFAULT_CACHE_ENTRIES)?,
                refresh_interval_ms: env_or(
                    "SCC_QUOTA_REFRESH_INTERVAL_MS",
                    Self::DEFAULT_QUOTA_REFRESH_INTERVAL_MS,
                )?,
                expiration_interval_ms: env_or(
                    "SCC_QUOTA_EXPIRATION_MS",
                    Self::DEFAULT_QUOTA_EXPIRATION_MS,
                )?,
            },
            report: ReportSettings {
                num_entries: env_or("SCC_REPORT_CACHE_ENTRIES", Self::DEFAULT_CACHE_ENTRIES)?,
                flush_interval_ms: env_or(
                    "SCC_REPORT_FLUSH_INTERVAL_MS",
                    Self::DEFAULT_REPORT_FLUSH_INTERVAL_MS,
                )?,
            },
        })
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown.service".to_string(),
            service_config_id: "default".to_string(),
            check: CheckSettings {
                num_entries: Self::DEFAULT_CACHE_ENTRIES,
                flush_interval_ms: Self::DEFAULT_CHECK_FLUSH_INTERVAL_MS,
                expiration_ms: Self::DEFAULT_CHECK_EXPIRATION_MS,
            },
            quota: QuotaSettings {
                num_entries: Self::DEFAULT_CACHE_ENTRIES,
                refresh_interval_ms: Self::DEFAULT_QUOTA_REFRESH_INTERVAL_MS,
                expiration_interval_ms: Self::DEFAULT_QUOTA_EXPIRATION_MS,
            },
            report: ReportSettings {
                num_entries: Self::DEFAULT_CACHE_ENTRIES,
                flush_interval_ms: Self::DEFAULT_REPORT_FLUSH_INTERVAL_MS,
            },
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| {
            Error::InvalidConfiguration(format!("{name}: cannot parse '{raw}'"))
        }),
        Err(_) => Ok(default),
    }
}
