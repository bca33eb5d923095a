use crate::domain::MetricKind;
use shared::config::{CheckSettings, ClientConfig, QuotaSettings, ReportSettings};
use shared::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub type MetricKindMap = HashMap<String, MetricKind>;

/// Cache options for the check aggregator.
///
/// `num_entries == 0` disables caching. Otherwise the expiration must be
/// strictly longer than the flush interval so an entry gets a chance to be
/// revalidated before it goes stale.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckAggregationOptions {
    num_entries: usize,
    flush_interval: Duration,
    expiration: Duration,
}

impl CheckAggregationOptions {
    pub fn new(num_entries: usize, flush_interval_ms: u64, expiration_ms: u64) -> Result<Self> {
        if num_entries > 0 && flush_interval_ms == 0 {
            return Err(Error::invalid_config("check flush_interval_ms must be positive"));
        }
        if expiration_ms <= flush_interval_ms {
            return Err(Error::invalid_config(format!(
                "check expiration_ms ({expiration_ms}) must exceed flush_interval_ms ({flush_interval_ms})"
            )));
        }
        Ok(Self {
            num_entries,
            flush_interval: Duration::from_millis(flush_interval_ms),
            expiration: Duration::from_millis(expiration_ms),
        })
    }

    pub fn disabled() -> Self {
        Self {
            num_entries: 0,
            ..Self::default()
        }
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }
}

impl Default for CheckAggregationOptions {
    fn default() -> Self {
        Self {
            num_entries: ClientConfig::DEFAULT_CACHE_ENTRIES,
            flush_interval: Duration::from_millis(ClientConfig::DEFAULT_CHECK_FLUSH_INTERVAL_MS),
            expiration: Duration::from_millis(ClientConfig::DEFAULT_CHECK_EXPIRATION_MS),
        }
    }
}

impl TryFrom<&CheckSettings> for CheckAggregationOptions {
    type Error = Error;

    fn try_from(settings: &CheckSettings) -> Result<Self> {
        Self::new(
            settings.num_entries,
            settings.flush_interval_ms,
            settings.expiration_ms,
        )
    }
}

/// Cache options for the quota aggregator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaAggregationOptions {
    num_entries: usize,
    refresh_interval: Duration,
    expiration_interval: Duration,
}

impl QuotaAggregationOptions {
    pub fn new(
        num_entries: usize,
        refresh_interval_ms: u64,
        expiration_interval_ms: u64,
    ) -> Result<Self> {
        if num_entries > 0 && refresh_interval_ms == 0 {
            return Err(Error::invalid_config("quota refresh_interval_ms must be positive"));
        }
        if num_entries > 0 && expiration_interval_ms <= refresh_interval_ms {
            return Err(Error::invalid_config(format!(
                "quota expiration_interval_ms ({expiration_interval_ms}) must exceed refresh_interval_ms ({refresh_interval_ms})"
            )));
        }
        Ok(Self {
            num_entries,
            refresh_interval: Duration::from_millis(refresh_interval_ms),
            expiration_interval: Duration::from_millis(expiration_interval_ms),
        })
    }

    pub fn disabled() -> Self {
        Self {
            num_entries: 0,
            ..Self::default()
        }
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn expiration_interval(&self) -> Duration {
        self.expiration_interval
    }
}

impl Default for QuotaAggregationOptions {
    fn default() -> Self {
        Self {
            num_entries: ClientConfig::DEFAULT_CACHE_ENTRIES,
            refresh_interval: Duration::from_millis(ClientConfig::DEFAULT_QUOTA_REFRESH_INTERVAL_MS),
            expiration_interval: Duration::from_millis(ClientConfig::DEFAULT_QUOTA_EXPIRATION_MS),
        }
    }
}

impl TryFrom<&QuotaSettings> for QuotaAggregationOptions {
    type Error = Error;

    fn try_from(settings: &QuotaSettings) -> Result<Self> {
        Self::new(
            settings.num_entries,
            settings.refresh_interval_ms,
            settings.expiration_interval_ms,
        )
    }
}

/// Cache options for the report aggregator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportAggregationOptions {
    num_entries: usize,
    flush_interval: Duration,
    metric_kinds: Arc<MetricKindMap>,
}

impl ReportAggregationOptions {
    pub fn new(num_entries: usize, flush_interval_ms: u64) -> Result<Self> {
        if num_entries > 0 && flush_interval_ms == 0 {
            return Err(Error::invalid_config("report flush_interval_ms must be positive"));
        }
        Ok(Self {
            num_entries,
            flush_interval: Duration::from_millis(flush_interval_ms),
            metric_kinds: Arc::new(MetricKindMap::new()),
        })
    }

    /// Metrics missing from the map are merged as deltas.
    pub fn with_metric_kinds(mut self, metric_kinds: MetricKindMap) -> Self {
        self.metric_kinds = Arc::new(metric_kinds);
        self
    }

    pub fn disabled() -> Self {
        Self {
            num_entries: 0,
            ..Self::default()
        }
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn metric_kinds(&self) -> &Arc<MetricKindMap> {
        &self.metric_kinds
    }
}

impl Default for ReportAggregationOptions {
    fn default() -> Self {
        Self {
            num_entries: ClientConfig::DEFAULT_CACHE_ENTRIES,
            flush_interval: Duration::from_millis(ClientConfig::DEFAULT_REPORT_FLUSH_INTERVAL_MS),
            metric_kinds: Arc::new(MetricKindMap::new()),
        }
    }
}

impl TryFrom<&ReportSettings> for ReportAggregationOptions {
    type Error = Error;

    fn try_from(settings: &ReportSettings) -> Result<Self> {
        Self::new(settings.num_entries, settings.flush_interval_ms)
    }
}

/// Everything needed to construct a client.
#[derive(Clone, Debug, Default)]
pub struct ClientOptions {
    pub service_name: String,
    pub service_config_id: String,
    pub check: CheckAggregationOptions,
    pub quota: QuotaAggregationOptions,
    pub report: ReportAggregationOptions,
}

impl TryFrom<&ClientConfig> for ClientOptions {
    type Error = Error;

    fn try_from(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            service_name: config.service_name.clone(),
            service_config_id: config.service_config_id.clone(),
            check: (&config.check).try_into()?,
            quota: (&config.quota).try_into()?,
            report: (&config.report).try_into()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_expiration_must_exceed_flush_interval() {
        assert!(CheckAggregationOptions::new(100, 500, 500).is_err());
        assert!(CheckAggregationOptions::new(100, 500, 499).is_err());
        let options = CheckAggregationOptions::new(100, 500, 501).unwrap();
        assert_eq!(options.flush_interval(), Duration::from_millis(500));
        assert_eq!(options.expiration(), Duration::from_millis(501));
    }

    #[test]
    fn test_check_rejects_zero_flush_interval_when_enabled() {
        let err = CheckAggregationOptions::new(10, 0, 100).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn test_quota_expiration_must_exceed_refresh() {
        assert!(QuotaAggregationOptions::new(10, 1000, 1000).is_err());
        assert!(QuotaAggregationOptions::new(10, 1000, 60_000).is_ok());
        // disabled caches skip interval validation
        assert!(QuotaAggregationOptions::new(0, 0, 0).is_ok());
    }

    #[test]
    fn test_report_zero_interval() {
        assert!(ReportAggregationOptions::new(10, 0).is_err());
        assert!(ReportAggregationOptions::new(0, 0).is_ok());
    }

    #[test]
    fn test_client_options_from_config() {
        let mut config = ClientConfig::default();
        config.check.expiration_ms = config.check.flush_interval_ms;
        let err = ClientOptions::try_from(&config).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));

        let options = ClientOptions::try_from(&ClientConfig::default()).unwrap();
        assert_eq!(options.check, CheckAggregationOptions::default());
        assert_eq!(options.quota, QuotaAggregationOptions::default());
    }
}
