//! Report aggregation: merge now, send later.
//!
//! Reported operations sharing an operation signature are folded into one
//! aggregate. Every `flush_interval` the whole cache is drained and shipped
//! in batches. Aggregates that grow too big, or that are pushed out by
//! capacity pressure, are sent straight away.

use crate::cache::{AggregationCache, Expiry};
use crate::domain::Operation;
use crate::domain::request::ReportRequest;
use crate::options::ReportAggregationOptions;
use crate::ports::ReportTransport;
use crate::signature::{Fingerprint, report_signature};
use crate::stats::{FlushSummary, KindCounters};
use futures::StreamExt;
use parking_lot::Mutex;
use shared::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::MAX_CONCURRENT_FLUSH;
use super::operation::OperationAggregator;

/// Largest number of operations carried by one outbound report.
pub const MAX_OPERATIONS_PER_REPORT: usize = 1000;

#[derive(Clone, Debug)]
pub struct ReportEntry {
    pub service_name: String,
    pub service_config_id: String,
    pub aggregate: OperationAggregator,
}

impl ReportEntry {
    fn merge(&mut self, other: ReportEntry) {
        self.aggregate.merge(other.aggregate);
    }
}

/// Group operations per service envelope, then cut each group into
/// requests of at most [`MAX_OPERATIONS_PER_REPORT`] operations.
pub fn build_batches(entries: impl IntoIterator<Item = ReportEntry>) -> Vec<ReportRequest> {
    let mut groups: BTreeMap<(String, String), Vec<Operation>> = BTreeMap::new();
    for entry in entries {
        groups
            .entry((entry.service_name, entry.service_config_id))
            .or_default()
            .push(entry.aggregate.into_operation());
    }

    let mut batches = Vec::new();
    for ((service_name, service_config_id), operations) in groups {
        let mut operations = operations.into_iter().peekable();
        while operations.peek().is_some() {
            batches.push(ReportRequest {
                service_name: service_name.clone(),
                service_config_id: service_config_id.clone(),
                operations: operations.by_ref().take(MAX_OPERATIONS_PER_REPORT).collect(),
            });
        }
    }
    batches
}

pub struct ReportAggregator {
    options: ReportAggregationOptions,
    cache: AggregationCache<Fingerprint, ReportEntry>,
    counters: Arc<KindCounters>,
    last_flush: Mutex<Instant>,
}

impl ReportAggregator {
    pub fn new(options: ReportAggregationOptions, counters: Arc<KindCounters>) -> Self {
        let cache = AggregationCache::new("report", options.num_entries(), Expiry::Never);
        Self {
            options,
            cache,
            counters,
            last_flush: Mutex::new(Instant::now()),
        }
    }

    pub fn options(&self) -> &ReportAggregationOptions {
        &self.options
    }

    pub fn cache(&self) -> &AggregationCache<Fingerprint, ReportEntry> {
        &self.cache
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_enabled()
    }

    /// Accept a report. With caching enabled this only merges, unless an
    /// aggregate has to leave the cache early; with caching disabled the
    /// request goes straight to `transport` and its failure is returned.
    pub async fn report(&self, request: ReportRequest, transport: &dyn ReportTransport) -> Result<()> {
        if !self.cache.is_enabled() {
            let count = request.operations.len();
            let _in_flight = self.counters.track_in_flight();
            self.counters.record_sync_send();
            transport.report(request).await?;
            self.counters.record_operations_sent(count);
            return Ok(());
        }

        let ReportRequest {
            service_name,
            service_config_id,
            operations,
        } = request;

        let now = Instant::now();
        let mut evicted = Vec::new();
        let mut too_big = Vec::new();
        for operation in operations {
            let key = report_signature(&service_name, &service_config_id, &operation);
            let entry = ReportEntry {
                service_name: service_name.clone(),
                service_config_id: service_config_id.clone(),
                aggregate: OperationAggregator::new(operation, self.options.metric_kinds().clone()),
            };
            if let Some((evicted_key, entry)) = self.cache.merge_or_insert(key, entry, now, ReportEntry::merge) {
                debug!(key = ?evicted_key, "report aggregate evicted, sending early");
                evicted.push(entry);
            }
            if let Some(entry) = self.cache.remove_if(&key, |entry| entry.aggregate.too_big()) {
                debug!(key = ?key, "report aggregate too big, sending early");
                too_big.push(entry);
            }
        }

        // An evicted aggregate has no slot to go back to; a too-big one just
        // freed its own.
        self.send_early(transport, evicted, false).await;
        self.send_early(transport, too_big, true).await;
        Ok(())
    }

    async fn send_early(&self, transport: &dyn ReportTransport, entries: Vec<ReportEntry>, restore_failed: bool) {
        for batch in build_batches(entries) {
            let count = batch.operations.len();
            let result = {
                let _in_flight = self.counters.track_in_flight();
                self.counters.record_sync_send();
                transport.report(batch.clone()).await
            };
            match result {
                Ok(_) => self.counters.record_operations_sent(count),
                Err(err) => {
                    self.counters.record_flush_failure();
                    if restore_failed {
                        warn!(error = %err, operations = count, "early report send failed, keeping for next flush");
                        self.restore(batch);
                    } else {
                        warn!(error = %err, operations = count, "early report send failed, dropping");
                    }
                }
            }
        }
    }

    /// Drain and send everything once `flush_interval` has passed since the
    /// previous drain. Does nothing in between.
    pub async fn flush(&self, transport: &dyn ReportTransport) -> FlushSummary {
        if !self.cache.is_enabled() {
            return FlushSummary::default();
        }
        let now = Instant::now();
        {
            let mut last = self.last_flush.lock();
            if now.saturating_duration_since(*last) < self.options.flush_interval() {
                return FlushSummary::default();
            }
            *last = now;
        }
        self.send_drained(transport, true).await
    }

    /// Drain and send everything now. Failed batches are merged back so the
    /// next flush retries them.
    pub async fn flush_now(&self, transport: &dyn ReportTransport) -> FlushSummary {
        if !self.cache.is_enabled() {
            return FlushSummary::default();
        }
        *self.last_flush.lock() = Instant::now();
        self.send_drained(transport, true).await
    }

    /// Drain and send everything, best effort: a failed batch is counted and
    /// dropped. Used when the client goes away.
    pub async fn flush_all(&self, transport: &dyn ReportTransport) -> FlushSummary {
        if !self.cache.is_enabled() {
            return FlushSummary::default();
        }
        self.send_drained(transport, false).await
    }

    async fn send_drained(&self, transport: &dyn ReportTransport, restore_failed: bool) -> FlushSummary {
        let drained = self.cache.drain();
        if drained.is_empty() {
            return FlushSummary::default();
        }
        let batches = build_batches(drained.into_iter().map(|(_, entry)| entry.value));
        debug!(batches = batches.len(), "flushing report aggregates");

        let results = futures::stream::iter(batches)
            .map(|batch| async move {
                let result = {
                    let _in_flight = self.counters.track_in_flight();
                    self.counters.record_flush_send();
                    transport.report(batch.clone()).await
                };
                (batch, result)
            })
            .buffer_unordered(MAX_CONCURRENT_FLUSH)
            .collect::<Vec<_>>()
            .await;

        let mut summary = FlushSummary::default();
        for (batch, result) in results {
            match result {
                Ok(response) => {
                    if !response.report_errors.is_empty() {
                        warn!(errors = response.report_errors.len(), "remote rejected some reported operations");
                    }
                    self.counters.record_operations_sent(batch.operations.len());
                    summary.sent += 1;
                }
                Err(err) => {
                    warn!(error = %err, operations = batch.operations.len(), "report flush failed");
                    self.counters.record_flush_failure();
                    summary.failed += 1;
                    if restore_failed {
                        self.restore(batch);
                    }
                }
            }
        }
        summary
    }

    /// Merge an unsent batch back in. Anything that no longer fits is lost.
    fn restore(&self, batch: ReportRequest) {
        let now = Instant::now();
        for operation in batch.operations {
            let key = report_signature(&batch.service_name, &batch.service_config_id, &operation);
            let entry = ReportEntry {
                service_name: batch.service_name.clone(),
                service_config_id: batch.service_config_id.clone(),
                aggregate: OperationAggregator::new(operation, self.options.metric_kinds().clone()),
            };
            if let Some((evicted, _)) = self.cache.merge_or_insert(key, entry, now, ReportEntry::merge) {
                warn!(key = ?evicted, "no room to keep unsent report aggregate, dropping");
            }
        }
    }
}

impl std::fmt::Debug for ReportAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportAggregator")
            .field("options", &self.options)
            .field("cache", &self.cache)
            .finish()
    }
}
