//! Cached authorization verdicts.
//!
//! A verdict is served from the cache until it expires. Entries that were
//! used since their last refresh are revalidated by the flush pass once they
//! are `flush_interval` old; entries nobody asked for age out at
//! `expiration` and are dropped.

use crate::cache::{Admission, AggregationCache, CacheEntry, Expiry, Probe, Waiter};
use crate::domain::request::CheckRequest;
use crate::domain::response::CheckResponse;
use crate::options::CheckAggregationOptions;
use crate::ports::CheckTransport;
use crate::signature::{Fingerprint, check_request_signature};
use crate::stats::{FlushSummary, KindCounters};
use futures::StreamExt;
use shared::{Error, Result};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::MAX_CONCURRENT_FLUSH;

#[derive(Clone, Debug)]
pub struct CheckEntry {
    /// Replayed on revalidation.
    pub request: CheckRequest,
    pub response: CheckResponse,
    /// Cache hits since the last successful refresh.
    pub hits_since_refresh: u64,
}

fn serve(entry: &mut CacheEntry<CheckEntry>) -> Option<CheckResponse> {
    entry.value.hits_since_refresh += 1;
    Some(entry.value.response.clone())
}

pub struct CheckAggregator {
    options: CheckAggregationOptions,
    cache: AggregationCache<Fingerprint, CheckEntry>,
    counters: Arc<KindCounters>,
}

impl CheckAggregator {
    pub fn new(options: CheckAggregationOptions, counters: Arc<KindCounters>) -> Self {
        let cache = AggregationCache::new(
            "check",
            options.num_entries(),
            Expiry::AfterRefresh(options.expiration()),
        );
        Self {
            options,
            cache,
            counters,
        }
    }

    pub fn options(&self) -> &CheckAggregationOptions {
        &self.options
    }

    pub fn cache(&self) -> &AggregationCache<Fingerprint, CheckEntry> {
        &self.cache
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_enabled()
    }

    /// Answer a check from the cache, joining an identical in-flight call,
    /// or by calling `transport` and caching the verdict.
    pub async fn check(
        &self,
        request: CheckRequest,
        transport: &dyn CheckTransport,
    ) -> Result<CheckResponse> {
        if !self.cache.is_enabled() {
            return self.send(transport, request).await;
        }

        let key = check_request_signature(&request);
        loop {
            let waiter = match self.cache.probe(&key, Instant::now(), serve) {
                Probe::Hit(response) => {
                    debug!(key = ?key, "check served from cache");
                    return Ok(response);
                }
                Probe::InFlight(waiter) => waiter,
                Probe::Miss => match self.cache.begin_pending(&key, Instant::now(), serve) {
                    Admission::Hit(response) => return Ok(response),
                    Admission::Follower(waiter) => waiter,
                    Admission::Leader(ticket) => {
                        let outcome = self
                            .send(transport, request.clone())
                            .await
                            .map(|response| CheckEntry {
                                request,
                                response,
                                hits_since_refresh: 0,
                            });
                        return self
                            .cache
                            .commit(ticket, outcome, Instant::now())
                            .map(|entry| entry.response);
                    }
                },
            };
            if let Some(result) = Self::await_leader(waiter).await {
                return result;
            }
        }
    }

    /// `None` means the leader went away without an answer; try again.
    async fn await_leader(waiter: Waiter<CheckEntry>) -> Option<Result<CheckResponse>> {
        match waiter.wait().await {
            Ok(entry) => Some(Ok(entry.response)),
            Err(Error::Cancelled(reason)) => {
                debug!(%reason, "in-flight check released, retrying");
                None
            }
            Err(err) => Some(Err(err)),
        }
    }

    async fn send(
        &self,
        transport: &dyn CheckTransport,
        request: CheckRequest,
    ) -> Result<CheckResponse> {
        let _in_flight = self.counters.track_in_flight();
        self.counters.record_sync_send();
        transport.check(request).await
    }

    /// Drop expired entries, then revalidate every entry that was used since
    /// its last refresh and is at least `flush_interval` old.
    pub async fn flush(&self, transport: &dyn CheckTransport) -> FlushSummary {
        if !self.cache.is_enabled() {
            return FlushSummary::default();
        }
        let now = Instant::now();
        let expired = self.evict_expired(now);
        let due = self.cache.due_for_flush(now, self.options.flush_interval());
        let mut summary = self.revalidate(due, transport).await;
        summary.expired = expired;
        summary
    }

    /// Revalidate every used entry regardless of age, then empty the cache.
    pub async fn flush_all(&self, transport: &dyn CheckTransport) -> FlushSummary {
        if !self.cache.is_enabled() {
            return FlushSummary::default();
        }
        let used = self
            .cache
            .drain()
            .into_iter()
            .filter(|(_, entry)| entry.value.hits_since_refresh > 0)
            .map(|(_, entry)| entry.value)
            .collect::<Vec<_>>();

        let results = futures::stream::iter(used)
            .map(|entry| async move {
                let _in_flight = self.counters.track_in_flight();
                self.counters.record_flush_send();
                transport.check(entry.request).await
            })
            .buffer_unordered(MAX_CONCURRENT_FLUSH)
            .collect::<Vec<_>>()
            .await;

        let mut summary = FlushSummary::default();
        for result in results {
            match result {
                Ok(_) => summary.sent += 1,
                Err(err) => {
                    warn!(error = %err, "final check flush failed");
                    self.counters.record_flush_failure();
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    fn evict_expired(&self, now: Instant) -> usize {
        let expired = self.cache.remove_expired(now);
        for (key, _) in &expired {
            debug!(key = ?key, "dropping expired check verdict");
        }
        expired.len()
    }

    async fn revalidate(
        &self,
        due: Vec<Fingerprint>,
        transport: &dyn CheckTransport,
    ) -> FlushSummary {
        let outcomes = futures::stream::iter(due)
            .map(|key| self.revalidate_one(key, transport))
            .buffer_unordered(MAX_CONCURRENT_FLUSH)
            .collect::<Vec<_>>()
            .await;

        let mut summary = FlushSummary::default();
        for sent in outcomes.into_iter().flatten() {
            if sent {
                summary.sent += 1;
            } else {
                summary.failed += 1;
            }
        }
        summary
    }

    /// `None` when the entry needed no refresh or was already being fetched,
    /// otherwise whether the refresh went through.
    async fn revalidate_one(&self, key: Fingerprint, transport: &dyn CheckTransport) -> Option<bool> {
        let ticket = self.cache.begin_refresh(&key)?;

        let taken = self.cache.update(&key, |entry| {
            let hits = std::mem::take(&mut entry.value.hits_since_refresh);
            (hits, entry.value.request.clone())
        });
        let (hits, request) = match taken {
            Some((hits, request)) if hits > 0 => (hits, request),
            _ => {
                ticket.abandon();
                return None;
            }
        };

        let result = {
            let _in_flight = self.counters.track_in_flight();
            self.counters.record_flush_send();
            transport.check(request.clone()).await
        };

        match result {
            Ok(response) => {
                let fresh = CheckEntry {
                    request,
                    response,
                    hits_since_refresh: 0,
                };
                // Hits that arrived while the call was out stay counted.
                let committed = self.cache.commit_with(ticket, Ok(fresh), Instant::now(), |current, fresh| {
                    current.response = fresh.response;
                    current.request = fresh.request;
                });
                Some(committed.is_ok())
            }
            Err(err) => {
                warn!(key = ?key, error = %err, "check revalidation failed, keeping cached verdict");
                self.counters.record_flush_failure();
                self.cache.update(&key, |entry| entry.value.hits_since_refresh += hits);
                ticket.abandon();
                Some(false)
            }
        }
    }
}

impl std::fmt::Debug for CheckAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckAggregator")
            .field("options", &self.options)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Operation;
    use crate::domain::response::CheckError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedTransport {
        calls: AtomicUsize,
        fail: Mutex<bool>,
        deny: Mutex<bool>,
    }

    #[async_trait]
    impl CheckTransport for ScriptedTransport {
        async fn check(&self, request: CheckRequest) -> Result<CheckResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            if *self.fail.lock() {
                return Err(Error::transport("unavailable"));
            }
            if *self.deny.lock() {
                return Ok(CheckResponse::denied(
                    request.operation.operation_id,
                    CheckError::new("PERMISSION_DENIED", "no"),
                ));
            }
            Ok(CheckResponse::allowed(request.operation.operation_id))
        }
    }

    fn request(consumer: &str) -> CheckRequest {
        CheckRequest::new("library.googleapis.com", Operation::new("op", "ListShelves", consumer))
    }

    fn aggregator(num_entries: usize) -> CheckAggregator {
        let options = CheckAggregationOptions::new(num_entries, 500, 1000).unwrap();
        CheckAggregator::new(options, Arc::new(KindCounters::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_check_is_served_from_cache() {
        let agg = aggregator(10);
        let transport = ScriptedTransport::default();
        assert!(agg.check(request("a"), &transport).await.unwrap().is_allowed());
        assert!(agg.check(request("a"), &transport).await.unwrap().is_allowed());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_checks_share_one_call() {
        let agg = Arc::new(aggregator(10));
        let transport = Arc::new(ScriptedTransport::default());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let agg = agg.clone();
                let transport = transport.clone();
                tokio::spawn(async move { agg.check(request("a"), transport.as_ref()).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_allowed());
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_reaches_caller_and_is_not_cached() {
        let agg = aggregator(10);
        let transport = ScriptedTransport::default();
        *transport.fail.lock() = true;
        assert!(agg.check(request("a"), &transport).await.is_err());
        assert!(agg.cache().is_empty());

        *transport.fail.lock() = false;
        assert!(agg.check(request("a"), &transport).await.is_ok());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_verdict_is_cached_too() {
        let agg = aggregator(10);
        let transport = ScriptedTransport::default();
        *transport.deny.lock() = true;
        assert!(!agg.check(request("a"), &transport).await.unwrap().is_allowed());
        assert!(!agg.check(request("a"), &transport).await.unwrap().is_allowed());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_cache_calls_transport_every_time() {
        let agg = aggregator(0);
        let transport = ScriptedTransport::default();
        agg.check(request("a"), &transport).await.unwrap();
        agg.check(request("a"), &transport).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_revalidates_used_entries_only() {
        let agg = aggregator(10);
        let transport = ScriptedTransport::default();
        agg.check(request("used"), &transport).await.unwrap();
        agg.check(request("idle"), &transport).await.unwrap();
        agg.check(request("used"), &transport).await.unwrap(); // hit

        tokio::time::advance(Duration::from_millis(500)).await;
        let summary = agg.flush(&transport).await;
        assert_eq!(summary.sent, 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(agg.cache().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrefreshed_entry_expires() {
        let agg = aggregator(10);
        let transport = ScriptedTransport::default();
        agg.check(request("a"), &transport).await.unwrap();

        tokio::time::advance(Duration::from_millis(1000)).await;
        let summary = agg.flush(&transport).await;
        assert_eq!(summary.expired, 1);
        assert!(agg.cache().is_empty());

        agg.check(request("a"), &transport).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_revalidation_keeps_entry_for_retry() {
        let agg = aggregator(10);
        let transport = ScriptedTransport::default();
        agg.check(request("a"), &transport).await.unwrap();
        agg.check(request("a"), &transport).await.unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        *transport.fail.lock() = true;
        let summary = agg.flush(&transport).await;
        assert_eq!(summary.failed, 1);
        let entry = agg.cache().get(&check_request_signature(&request("a"))).unwrap();
        assert_eq!(entry.value.hits_since_refresh, 1);

        *transport.fail.lock() = false;
        let summary = agg.flush(&transport).await;
        assert_eq!(summary.sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_sends_used_entries_and_empties_cache() {
        let agg = aggregator(10);
        let transport = ScriptedTransport::default();
        agg.check(request("a"), &transport).await.unwrap();
        agg.check(request("a"), &transport).await.unwrap();
        agg.check(request("b"), &transport).await.unwrap();

        let summary = agg.flush_all(&transport).await;
        assert_eq!(summary.sent, 1);
        assert!(agg.cache().is_empty());
    }
}
