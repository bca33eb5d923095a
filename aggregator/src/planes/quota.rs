//! Cached quota allocations.
//!
//! A granted allocation is spent down locally: hits deduct from the cached
//! allowance and accumulate the consumed amounts as usage. The refresh pass
//! ships that usage to the remote side every `refresh_interval`, which also
//! renews the allowance. An entry nobody touches for
//! `expiration_interval` is dropped.

use crate::cache::{Admission, AggregationCache, CacheEntry, Expiry, Probe, Waiter};
use crate::domain::request::AllocateQuotaRequest;
use crate::domain::response::AllocateQuotaResponse;
use crate::domain::{MetricValue, QuotaOperation};
use crate::options::QuotaAggregationOptions;
use crate::ports::QuotaTransport;
use crate::signature::{Fingerprint, quota_request_signature};
use crate::stats::{FlushSummary, KindCounters};
use futures::StreamExt;
use shared::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::MAX_CONCURRENT_FLUSH;
use super::operation::QuotaOperationAggregator;

#[derive(Clone, Debug)]
pub struct QuotaEntry {
    /// The request that produced `response`; refreshes reuse its envelope.
    pub request: AllocateQuotaRequest,
    pub response: AllocateQuotaResponse,
    /// Allowance left to hand out locally, per metric.
    pub remaining: BTreeMap<String, i64>,
    /// Amounts consumed locally since the last refresh.
    pub usage: Option<QuotaOperationAggregator>,
}

impl QuotaEntry {
    fn new(
        request: AllocateQuotaRequest,
        response: AllocateQuotaResponse,
        spent: &BTreeMap<String, i64>,
    ) -> Self {
        let mut remaining = granted_amounts(&response);
        for (metric, amount) in spent {
            if let Some(left) = remaining.get_mut(metric) {
                *left = left.saturating_sub(*amount);
            }
        }
        Self {
            request,
            response,
            remaining,
            usage: None,
        }
    }

    fn record_usage(&mut self, operation: &QuotaOperation) {
        match &mut self.usage {
            Some(usage) => usage.merge_operation(operation),
            None => self.usage = Some(QuotaOperationAggregator::new(operation)),
        }
    }

    /// Take `requested` out of the allowance if all of it fits.
    fn try_spend(&mut self, requested: &BTreeMap<String, i64>) -> bool {
        let fits = requested
            .iter()
            .all(|(metric, amount)| self.remaining.get(metric).is_some_and(|left| left >= amount));
        if fits {
            for (metric, amount) in requested {
                if let Some(left) = self.remaining.get_mut(metric) {
                    *left = left.saturating_sub(*amount);
                }
            }
        }
        fits
    }

    /// Replace the remote verdict, keeping usage that accrued meanwhile.
    fn absorb(&mut self, fresh: QuotaEntry) {
        self.request = fresh.request;
        self.response = fresh.response;
        self.remaining = fresh.remaining;
        if let Some(usage) = fresh.usage {
            self.restore_usage(usage);
        }
    }

    fn restore_usage(&mut self, usage: QuotaOperationAggregator) {
        match &mut self.usage {
            Some(current) => current.merge_operation(&usage.to_operation()),
            None => self.usage = Some(usage),
        }
    }
}

/// Granted amount per metric.
pub fn granted_amounts(response: &AllocateQuotaResponse) -> BTreeMap<String, i64> {
    response
        .quota_metrics
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

fn serve(
    entry: &mut CacheEntry<QuotaEntry>,
    operation: &QuotaOperation,
    requested: &BTreeMap<String, i64>,
) -> Option<AllocateQuotaResponse> {
    let quota = &mut entry.value;
    // A denial stands until the next refresh; the attempt still counts.
    if quota.response.is_granted() && !quota.try_spend(requested) {
        return None;
    }
    quota.record_usage(operation);
    Some(AllocateQuotaResponse {
        operation_id: operation.operation_id.clone(),
        ..quota.response.clone()
    })
}

pub struct QuotaAggregator {
    options: QuotaAggregationOptions,
    cache: AggregationCache<Fingerprint, QuotaEntry>,
    counters: Arc<KindCounters>,
}

impl QuotaAggregator {
    pub fn new(options: QuotaAggregationOptions, counters: Arc<KindCounters>) -> Self {
        let cache = AggregationCache::new(
            "quota",
            options.num_entries(),
            Expiry::AfterIdle(options.expiration_interval()),
        );
        Self {
            options,
            cache,
            counters,
        }
    }

    pub fn options(&self) -> &QuotaAggregationOptions {
        &self.options
    }

    pub fn cache(&self) -> &AggregationCache<Fingerprint, QuotaEntry> {
        &self.cache
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_enabled()
    }

    /// Allocate from the cached allowance when it covers the request,
    /// otherwise ask the remote side (once per fingerprint at a time).
    pub async fn allocate_quota(
        &self,
        request: AllocateQuotaRequest,
        transport: &dyn QuotaTransport,
    ) -> Result<AllocateQuotaResponse> {
        if !self.cache.is_enabled() {
            return self.send(transport, request).await;
        }

        let key = quota_request_signature(&request);
        let operation = &request.allocate_operation;
        let requested = operation.requested_amounts();

        loop {
            let probed = self
                .cache
                .probe(&key, Instant::now(), |entry| serve(entry, operation, &requested));
            let waiter = match probed {
                Probe::Hit(response) => {
                    debug!(key = ?key, "quota served from cached allowance");
                    return Ok(response);
                }
                Probe::InFlight(waiter) => waiter,
                Probe::Miss => {
                    let admission = self.cache.begin_pending(&key, Instant::now(), |entry| {
                        serve(entry, operation, &requested)
                    });
                    match admission {
                        Admission::Hit(response) => return Ok(response),
                        Admission::Follower(waiter) => waiter,
                        Admission::Leader(ticket) => {
                            let outcome = self
                                .send(transport, request.clone())
                                .await
                                .map(|response| QuotaEntry::new(request.clone(), response, &requested));
                            return self
                                .cache
                                .commit_with(ticket, outcome, Instant::now(), QuotaEntry::absorb)
                                .map(|entry| entry.response);
                        }
                    }
                }
            };
            if let Some(result) = Self::await_leader(waiter, operation).await {
                return result;
            }
        }
    }

    /// Followers share the leader's verdict.
    async fn await_leader(
        waiter: Waiter<QuotaEntry>,
        operation: &QuotaOperation,
    ) -> Option<Result<AllocateQuotaResponse>> {
        match waiter.wait().await {
            Ok(entry) => Some(Ok(AllocateQuotaResponse {
                operation_id: operation.operation_id.clone(),
                ..entry.response
            })),
            Err(Error::Cancelled(reason)) => {
                debug!(%reason, "in-flight allocation released, retrying");
                None
            }
            Err(err) => Some(Err(err)),
        }
    }

    async fn send(
        &self,
        transport: &dyn QuotaTransport,
        request: AllocateQuotaRequest,
    ) -> Result<AllocateQuotaResponse> {
        let _in_flight = self.counters.track_in_flight();
        self.counters.record_sync_send();
        transport.allocate_quota(request).await
    }

    /// Drop idle entries, then refresh every entry with unreported usage
    /// whose allowance is at least `refresh_interval` old.
    pub async fn flush(&self, transport: &dyn QuotaTransport) -> FlushSummary {
        if !self.cache.is_enabled() {
            return FlushSummary::default();
        }
        let now = Instant::now();
        let expired = self.cache.remove_expired(now);
        for (key, _) in &expired {
            debug!(key = ?key, "dropping idle quota allowance");
        }

        let due = self.cache.due_for_flush(now, self.options.refresh_interval());
        let outcomes = futures::stream::iter(due)
            .map(|key| self.refresh_one(key, transport))
            .buffer_unordered(MAX_CONCURRENT_FLUSH)
            .collect::<Vec<_>>()
            .await;

        let mut summary = FlushSummary {
            expired: expired.len(),
            ..FlushSummary::default()
        };
        for sent in outcomes.into_iter().flatten() {
            if sent {
                summary.sent += 1;
            } else {
                summary.failed += 1;
            }
        }
        summary
    }

    /// Report every entry's outstanding usage, then empty the cache.
    pub async fn flush_all(&self, transport: &dyn QuotaTransport) -> FlushSummary {
        if !self.cache.is_enabled() {
            return FlushSummary::default();
        }
        let requests = self
            .cache
            .drain()
            .into_iter()
            .filter_map(|(_, entry)| {
                let QuotaEntry { request, usage, .. } = entry.value;
                usage.map(|usage| AllocateQuotaRequest {
                    allocate_operation: usage.to_operation(),
                    ..request
                })
            })
            .collect::<Vec<_>>();

        let results = futures::stream::iter(requests)
            .map(|request| async move {
                let _in_flight = self.counters.track_in_flight();
                self.counters.record_flush_send();
                transport.allocate_quota(request).await
            })
            .buffer_unordered(MAX_CONCURRENT_FLUSH)
            .collect::<Vec<_>>()
            .await;

        let mut summary = FlushSummary::default();
        for result in results {
            match result {
                Ok(_) => summary.sent += 1,
                Err(err) => {
                    warn!(error = %err, "final quota flush failed");
                    self.counters.record_flush_failure();
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    async fn refresh_one(&self, key: Fingerprint, transport: &dyn QuotaTransport) -> Option<bool> {
        let ticket = self.cache.begin_refresh(&key)?;

        let taken = self.cache.update(&key, |entry| {
            let usage = entry.value.usage.take()?;
            let request = AllocateQuotaRequest {
                allocate_operation: usage.to_operation(),
                ..entry.value.request.clone()
            };
            Some((usage, request))
        });
        let Some(Some((usage, request))) = taken else {
            ticket.abandon();
            return None;
        };

        let result = {
            let _in_flight = self.counters.track_in_flight();
            self.counters.record_flush_send();
            transport.allocate_quota(request.clone()).await
        };

        match result {
            Ok(response) => {
                let fresh = QuotaEntry::new(request, response, &BTreeMap::new());
                let committed = self
                    .cache
                    .commit_with(ticket, Ok(fresh), Instant::now(), QuotaEntry::absorb);
                Some(committed.is_ok())
            }
            Err(err) => {
                warn!(key = ?key, error = %err, "quota refresh failed, keeping cached allowance");
                self.counters.record_flush_failure();
                self.cache
                    .update(&key, |entry| entry.value.restore_usage(usage));
                ticket.abandon();
                Some(false)
            }
        }
    }
}

impl std::fmt::Debug for QuotaAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaAggregator")
            .field("options", &self.options)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MetricValueSet;
    use crate::domain::response::QuotaError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Grants a fixed amount per metric and remembers every request.
    struct QuotaServer {
        grant: i64,
        deny: Mutex<bool>,
        fail: Mutex<bool>,
        requests: Mutex<Vec<AllocateQuotaRequest>>,
    }

    impl QuotaServer {
        fn new(grant: i64) -> Self {
            Self {
                grant,
                deny: Mutex::new(false),
                fail: Mutex::new(false),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl QuotaTransport for QuotaServer {
        async fn allocate_quota(&self, request: AllocateQuotaRequest) -> Result<AllocateQuotaResponse> {
            self.requests.lock().push(request.clone());
            tokio::time::sleep(Duration::from_millis(5)).await;
            if *self.fail.lock() {
                return Err(Error::transport("quota backend unavailable"));
            }
            let operation = request.allocate_operation;
            if *self.deny.lock() {
                return Ok(AllocateQuotaResponse {
                    operation_id: operation.operation_id,
                    allocate_errors: vec![QuotaError {
                        code: "RESOURCE_EXHAUSTED".to_string(),
                        subject: operation.consumer_id,
                        description: "out of quota".to_string(),
                    }],
                    quota_metrics: Vec::new(),
                });
            }
            Ok(AllocateQuotaResponse {
                operation_id: operation.operation_id,
                allocate_errors: Vec::new(),
                quota_metrics: operation
                    .quota_metrics
                    .iter()
                    .map(|set| MetricValueSet::new(set.metric_name.clone(), vec![MetricValue::int64(self.grant)]))
                    .collect(),
            })
        }
    }

    fn request(id: &str, amount: i64) -> AllocateQuotaRequest {
        AllocateQuotaRequest::new(
            "library.googleapis.com",
            QuotaOperation::new(id, "ListShelves", "project:a").with_metric("reads", amount),
        )
    }

    fn aggregator(num_entries: usize) -> QuotaAggregator {
        let options = QuotaAggregationOptions::new(num_entries, 1000, 60_000).unwrap();
        QuotaAggregator::new(options, Arc::new(KindCounters::new()))
    }

    #[test]
    fn test_allowance_arithmetic_saturates() {
        let response = AllocateQuotaResponse {
            operation_id: "q".to_string(),
            allocate_errors: Vec::new(),
            quota_metrics: vec![MetricValueSet::new(
                "reads".to_string(),
                vec![MetricValue::int64(i64::MAX), MetricValue::int64(1)],
            )],
        };
        assert_eq!(granted_amounts(&response)["reads"], i64::MAX);

        let spent = BTreeMap::from([("reads".to_string(), i64::MIN)]);
        let entry = QuotaEntry::new(request("q", 1), response, &spent);
        assert_eq!(entry.remaining["reads"], i64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hits_spend_cached_allowance_until_exhausted() {
        let agg = aggregator(10);
        let server = QuotaServer::new(10);

        // first call grants 10 and spends 4
        agg.allocate_quota(request("q-1", 4), &server).await.unwrap();
        let hit = agg.allocate_quota(request("q-2", 4), &server).await.unwrap();
        assert_eq!(hit.operation_id, "q-2");
        assert!(hit.is_granted());
        assert_eq!(server.calls(), 1);

        // 2 left, so asking for 4 goes remote again
        agg.allocate_quota(request("q-3", 4), &server).await.unwrap();
        assert_eq!(server.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_denial_is_served_without_remote_call() {
        let agg = aggregator(10);
        let server = QuotaServer::new(10);
        *server.deny.lock() = true;
        assert!(!agg.allocate_quota(request("q-1", 1), &server).await.unwrap().is_granted());
        assert!(!agg.allocate_quota(request("q-2", 1), &server).await.unwrap().is_granted());
        assert_eq!(server.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_allocations_share_one_call() {
        let agg = Arc::new(aggregator(10));
        let server = Arc::new(QuotaServer::new(100));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let agg = agg.clone();
                let server = server.clone();
                tokio::spawn(async move {
                    agg.allocate_quota(request(&format!("q-{i}"), 1), server.as_ref())
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_granted());
        }
        assert_eq!(server.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_sends_aggregated_usage() {
        let agg = aggregator(10);
        let server = QuotaServer::new(100);
        agg.allocate_quota(request("q-1", 1), &server).await.unwrap();
        agg.allocate_quota(request("q-2", 2), &server).await.unwrap();
        agg.allocate_quota(request("q-3", 3), &server).await.unwrap();

        tokio::time::advance(Duration::from_millis(1000)).await;
        let summary = agg.flush(&server).await;
        assert_eq!(summary.sent, 1);

        let requests = server.requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].allocate_operation.requested_amounts().get("reads"), Some(&5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_without_usage_is_not_refreshed() {
        let agg = aggregator(10);
        let server = QuotaServer::new(100);
        agg.allocate_quota(request("q-1", 1), &server).await.unwrap();

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(agg.flush(&server).await.is_idle());
        assert_eq!(server.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_use_refreshes_before_expiry() {
        let options = QuotaAggregationOptions::new(10, 100, 300).unwrap();
        let agg = QuotaAggregator::new(options, Arc::new(KindCounters::new()));
        let server = QuotaServer::new(1_000);
        agg.allocate_quota(request("q-0", 1), &server).await.unwrap();

        for i in 1..20 {
            tokio::time::advance(Duration::from_millis(50)).await;
            agg.allocate_quota(request(&format!("q-{i}"), 1), &server).await.unwrap();
            agg.flush(&server).await;
            let key = quota_request_signature(&request("q", 1));
            let entry = agg.cache().get(&key).unwrap();
            assert!(entry.age(Instant::now()) < Duration::from_millis(300));
        }
        assert!(server.calls() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entry_expires() {
        let agg = aggregator(10);
        let server = QuotaServer::new(100);
        agg.allocate_quota(request("q-1", 1), &server).await.unwrap();

        tokio::time::advance(Duration::from_millis(60_000)).await;
        let summary = agg.flush(&server).await;
        assert_eq!(summary.expired, 1);
        assert!(agg.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_usage_for_next_cycle() {
        let agg = aggregator(10);
        let server = QuotaServer::new(100);
        agg.allocate_quota(request("q-1", 1), &server).await.unwrap();
        agg.allocate_quota(request("q-2", 2), &server).await.unwrap();

        tokio::time::advance(Duration::from_millis(1000)).await;
        *server.fail.lock() = true;
        assert_eq!(agg.flush(&server).await.failed, 1);

        *server.fail.lock() = false;
        assert_eq!(agg.flush(&server).await.sent, 1);
        let requests = server.requests.lock();
        assert_eq!(requests.last().unwrap().allocate_operation.requested_amounts().get("reads"), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_cache_calls_transport_every_time() {
        let agg = aggregator(0);
        let server = QuotaServer::new(100);
        agg.allocate_quota(request("q-1", 1), &server).await.unwrap();
        agg.allocate_quota(request("q-2", 1), &server).await.unwrap();
        assert_eq!(server.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_reports_usage_and_empties_cache() {
        let agg = aggregator(10);
        let server = QuotaServer::new(100);
        agg.allocate_quota(request("q-1", 1), &server).await.unwrap();
        agg.allocate_quota(request("q-2", 1), &server).await.unwrap();

        let summary = agg.flush_all(&server).await;
        assert_eq!(summary.sent, 1);
        assert!(agg.cache().is_empty());
        assert_eq!(server.calls(), 2);
    }
}
