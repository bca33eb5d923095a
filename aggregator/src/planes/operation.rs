//! Merging of reported and quota operations that share a fingerprint.

use crate::domain::{MetricKind, MetricValue, MetricValueKind, MetricValueSet, Operation, QuotaOperation};
use crate::options::MetricKindMap;
use crate::signature::{Fingerprint, metric_value_signature};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// An aggregated operation holding this many log entries is flushed without
/// waiting for the timer.
pub const MAX_LOG_ENTRIES: usize = 100;

fn earliest(current: &mut Option<DateTime<Utc>>, incoming: Option<DateTime<Utc>>) {
    if let Some(t) = incoming {
        if current.is_none_or(|c| t < c) {
            *current = Some(t);
        }
    }
}

fn latest(current: &mut Option<DateTime<Utc>>, incoming: Option<DateTime<Utc>>) {
    if let Some(t) = incoming {
        if current.is_none_or(|c| t > c) {
            *current = Some(t);
        }
    }
}

fn merge_delta(from: &MetricValue, to: &mut MetricValue) {
    let merged = match (&to.value, &from.value) {
        (MetricValueKind::Int64(a), MetricValueKind::Int64(b)) => MetricValueKind::Int64(a.saturating_add(*b)),
        (MetricValueKind::Double(a), MetricValueKind::Double(b)) => MetricValueKind::Double(a + b),
        _ => {
            warn!(?from, ?to, "metric values are not compatible, dropping incoming value");
            return;
        }
    };
    to.value = merged;
    earliest(&mut to.start_time, from.start_time);
    latest(&mut to.end_time, from.end_time);
}

fn merge_cumulative_or_gauge(from: &MetricValue, to: &mut MetricValue) {
    if from.end_time < to.end_time {
        return;
    }
    *to = from.clone();
}

pub fn merge_metric_value(kind: MetricKind, from: &MetricValue, to: &mut MetricValue) {
    match kind {
        MetricKind::Delta => merge_delta(from, to),
        MetricKind::Gauge | MetricKind::Cumulative => merge_cumulative_or_gauge(from, to),
    }
}

/// Accumulates reported operations with the same operation signature.
#[derive(Clone, Debug)]
pub struct OperationAggregator {
    operation: Operation,
    metric_value_sets: BTreeMap<String, BTreeMap<Fingerprint, MetricValue>>,
    metric_kinds: Arc<MetricKindMap>,
}

impl OperationAggregator {
    pub fn new(mut operation: Operation, metric_kinds: Arc<MetricKindMap>) -> Self {
        let sets = std::mem::take(&mut operation.metric_value_sets);
        let mut aggregator = Self {
            operation,
            metric_value_sets: BTreeMap::new(),
            metric_kinds,
        };
        aggregator.merge_metric_value_sets(&sets);
        aggregator
    }

    pub fn merge_operation(&mut self, operation: &Operation) {
        earliest(&mut self.operation.start_time, operation.start_time);
        latest(&mut self.operation.end_time, operation.end_time);
        self.merge_metric_value_sets(&operation.metric_value_sets);
        self.operation
            .log_entries
            .extend(operation.log_entries.iter().cloned());
    }

    /// Fold another aggregate into this one.
    pub fn merge(&mut self, other: OperationAggregator) {
        let other = other.into_operation();
        self.merge_operation(&other);
    }

    pub fn too_big(&self) -> bool {
        self.operation.log_entries.len() >= MAX_LOG_ENTRIES
    }

    pub fn into_operation(self) -> Operation {
        let mut op = self.operation;
        op.metric_value_sets = self
            .metric_value_sets
            .into_iter()
            .map(|(name, values)| MetricValueSet::new(name, values.into_values().collect()))
            .collect();
        op
    }

    pub fn to_operation(&self) -> Operation {
        self.clone().into_operation()
    }

    fn merge_metric_value_sets(&mut self, sets: &[MetricValueSet]) {
        for set in sets {
            let kind = self
                .metric_kinds
                .get(&set.metric_name)
                .copied()
                .unwrap_or_default();
            let values = self
                .metric_value_sets
                .entry(set.metric_name.clone())
                .or_default();
            for value in &set.metric_values {
                match values.get_mut(&metric_value_signature(value)) {
                    Some(existing) => merge_metric_value(kind, value, existing),
                    None => {
                        values.insert(metric_value_signature(value), value.clone());
                    }
                }
            }
        }
    }
}

/// Accumulates the amounts requested against one quota fingerprint.
#[derive(Clone, Debug, PartialEq)]
pub struct QuotaOperationAggregator {
    operation: QuotaOperation,
    metric_values: BTreeMap<String, MetricValue>,
}

impl QuotaOperationAggregator {
    pub fn new(operation: &QuotaOperation) -> Self {
        let mut aggregator = Self {
            operation: QuotaOperation {
                quota_metrics: Vec::new(),
                ..operation.clone()
            },
            metric_values: BTreeMap::new(),
        };
        aggregator.merge_operation(operation);
        aggregator
    }

    pub fn merge_operation(&mut self, operation: &QuotaOperation) {
        for set in &operation.quota_metrics {
            let Some(value) = set.metric_values.first() else {
                continue;
            };
            match self.metric_values.get_mut(&set.metric_name) {
                Some(existing) => merge_delta(value, existing),
                None => {
                    self.metric_values
                        .insert(set.metric_name.clone(), value.clone());
                }
            }
        }
    }

    pub fn to_operation(&self) -> QuotaOperation {
        let mut op = self.operation.clone();
        op.quota_metrics = self
            .metric_values
            .iter()
            .map(|(name, value)| MetricValueSet::new(name.clone(), vec![value.clone()]))
            .collect();
        op
    }
}
