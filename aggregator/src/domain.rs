//! Request and response shapes exchanged with the remote control plane.
//!
//! Encoding these onto the wire is the transport's job; they derive serde so
//! any transport can pick its own format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Labels = BTreeMap<String, String>;

/// How successive values of one metric combine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    #[default]
    Delta,
    Gauge,
    Cumulative,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetricValueKind {
    Int64(i64),
    Double(f64),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    #[serde(default)]
    pub labels: Labels,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub value: MetricValueKind,
}

impl MetricValue {
    pub fn int64(value: i64) -> Self {
        Self {
            labels: Labels::new(),
            start_time: None,
            end_time: None,
            value: MetricValueKind::Int64(value),
        }
    }

    pub fn double(value: f64) -> Self {
        Self {
            labels: Labels::new(),
            start_time: None,
            end_time: None,
            value: MetricValueKind::Double(value),
        }
    }

    pub fn with_times(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn as_int64(&self) -> Option<i64> {
        match self.value {
            MetricValueKind::Int64(v) => Some(v),
            MetricValueKind::Double(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricValueSet {
    pub metric_name: String,
    pub metric_values: Vec<MetricValue>,
}

impl MetricValueSet {
    pub fn new(metric_name: impl Into<String>, metric_values: Vec<MetricValue>) -> Self {
        Self {
            metric_name: metric_name.into(),
            metric_values,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub name: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub severity: String,
    pub text_payload: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: String,
    pub operation_name: String,
    pub consumer_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub metric_value_sets: Vec<MetricValueSet>,
    #[serde(default)]
    pub log_entries: Vec<LogEntry>,
}

impl Operation {
    pub fn new(
        operation_id: impl Into<String>,
        operation_name: impl Into<String>,
        consumer_id: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            operation_name: operation_name.into(),
            consumer_id: consumer_id.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_metric(mut self, metric_name: impl Into<String>, value: MetricValue) -> Self {
        self.metric_value_sets
            .push(MetricValueSet::new(metric_name, vec![value]));
        self
    }

    pub fn with_log_entry(mut self, entry: LogEntry) -> Self {
        self.log_entries.push(entry);
        self
    }
}

pub mod request {
    use super::{Operation, QuotaOperation};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct CheckRequest {
        pub service_name: String,
        pub service_config_id: String,
        pub operation: Operation,
    }

    impl CheckRequest {
        pub fn new(service_name: impl Into<String>, operation: Operation) -> Self {
            Self {
                service_name: service_name.into(),
                service_config_id: String::new(),
                operation,
            }
        }
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct AllocateQuotaRequest {
        pub service_name: String,
        pub service_config_id: String,
        pub allocate_operation: QuotaOperation,
    }

    impl AllocateQuotaRequest {
        pub fn new(service_name: impl Into<String>, allocate_operation: QuotaOperation) -> Self {
            Self {
                service_name: service_name.into(),
                service_config_id: String::new(),
                allocate_operation,
            }
        }
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct ReportRequest {
        pub service_name: String,
        pub service_config_id: String,
        pub operations: Vec<Operation>,
    }

    impl ReportRequest {
        pub fn new(service_name: impl Into<String>, operations: Vec<Operation>) -> Self {
            Self {
                service_name: service_name.into(),
                service_config_id: String::new(),
                operations,
            }
        }
    }
}

pub mod response {
    use super::MetricValueSet;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CheckError {
        pub code: String,
        pub detail: String,
    }

    impl CheckError {
        pub fn new(code: impl Into<String>, detail: impl Into<String>) -> Self {
            Self {
                code: code.into(),
                detail: detail.into(),
            }
        }
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CheckResponse {
        pub operation_id: String,
        #[serde(default)]
        pub check_errors: Vec<CheckError>,
    }

    impl CheckResponse {
        pub fn allowed(operation_id: impl Into<String>) -> Self {
            Self {
                operation_id: operation_id.into(),
                check_errors: Vec::new(),
            }
        }

        pub fn denied(operation_id: impl Into<String>, error: CheckError) -> Self {
            Self {
                operation_id: operation_id.into(),
                check_errors: vec![error],
            }
        }

        pub fn is_allowed(&self) -> bool {
            self.check_errors.is_empty()
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct QuotaError {
        pub code: String,
        pub subject: String,
        pub description: String,
    }

    /// Result of a quota allocation. `quota_metrics` carries the amount
    /// granted per metric.
    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct AllocateQuotaResponse {
        pub operation_id: String,
        #[serde(default)]
        pub allocate_errors: Vec<QuotaError>,
        #[serde(default)]
        pub quota_metrics: Vec<MetricValueSet>,
    }

    impl AllocateQuotaResponse {
        pub fn is_granted(&self) -> bool {
            self.allocate_errors.is_empty()
        }
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ReportError {
        pub operation_id: String,
        pub message: String,
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ReportResponse {
        #[serde(default)]
        pub report_errors: Vec<ReportError>,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaOperation {
    pub operation_id: String,
    pub method_name: String,
    pub consumer_id: String,
    #[serde(default)]
    pub labels: Labels,
    /// One value per metric: the amount requested.
    #[serde(default)]
    pub quota_metrics: Vec<MetricValueSet>,
}

impl QuotaOperation {
    pub fn new(
        operation_id: impl Into<String>,
        method_name: impl Into<String>,
        consumer_id: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            method_name: method_name.into(),
            consumer_id: consumer_id.into(),
            ..Default::default()
        }
    }

    pub fn with_metric(mut self, metric_name: impl Into<String>, amount: i64) -> Self {
        self.quota_metrics
            .push(MetricValueSet::new(metric_name, vec![MetricValue::int64(amount)]));
        self
    }

    /// Requested amount per metric name.
    pub fn requested_amounts(&self) -> BTreeMap<String, i64> {
        self.quota_metrics
            .iter()
            .map(|set| {
                let amount = set
                    .metric_values
                    .iter()
                    .filter_map(MetricValue::as_int64)
                    .fold(0i64, i64::saturating_add);
                (set.metric_name.clone(), amount)
            })
            .collect()
    }
}
