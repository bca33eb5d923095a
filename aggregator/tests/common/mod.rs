//! Recording transport shared by the client tests.

#![allow(dead_code)]

use aggregator::domain::request::{AllocateQuotaRequest, CheckRequest, ReportRequest};
use aggregator::domain::response::{AllocateQuotaResponse, CheckResponse, ReportResponse};
use aggregator::domain::{MetricValue, MetricValueSet, Operation, QuotaOperation};
use aggregator::{CheckTransport, Error, QuotaTransport, ReportTransport, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub const SERVICE: &str = "library.googleapis.com";
pub const REQUEST_COUNT: &str = "library.googleapis.com/rpc/client/count";

/// Answers every call successfully unless told to fail, optionally after a
/// delay, and remembers what it was sent.
pub struct RecordingTransport {
    pub checks: AtomicUsize,
    pub allocations: AtomicUsize,
    pub reports: Mutex<Vec<ReportRequest>>,
    pub quota_requests: Mutex<Vec<AllocateQuotaRequest>>,
    fail: AtomicBool,
    delay: Mutex<Duration>,
    quota_grant: i64,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::with_grant(1_000)
    }

    pub fn with_grant(quota_grant: i64) -> Self {
        Self {
            checks: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
            reports: Mutex::new(Vec::new()),
            quota_requests: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            delay: Mutex::new(Duration::from_millis(1)),
            quota_grant,
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn check_calls(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn quota_calls(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn report_calls(&self) -> usize {
        self.reports.lock().len()
    }

    /// Every operation delivered across all report calls.
    pub fn reported_operations(&self) -> Vec<Operation> {
        self.reports
            .lock()
            .iter()
            .flat_map(|request| request.operations.iter().cloned())
            .collect()
    }

    async fn respond(&self) -> Result<()> {
        let delay = *self.delay.lock();
        tokio::time::sleep(delay).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::transport("remote unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckTransport for RecordingTransport {
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.respond().await?;
        Ok(CheckResponse::allowed(request.operation.operation_id))
    }
}

#[async_trait]
impl QuotaTransport for RecordingTransport {
    async fn allocate_quota(&self, request: AllocateQuotaRequest) -> Result<AllocateQuotaResponse> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.quota_requests.lock().push(request.clone());
        self.respond().await?;
        let operation = request.allocate_operation;
        Ok(AllocateQuotaResponse {
            quota_metrics: operation
                .quota_metrics
                .iter()
                .map(|set| {
                    MetricValueSet::new(set.metric_name.clone(), vec![MetricValue::int64(self.quota_grant)])
                })
                .collect(),
            operation_id: operation.operation_id,
            allocate_errors: Vec::new(),
        })
    }
}

#[async_trait]
impl ReportTransport for RecordingTransport {
    async fn report(&self, request: ReportRequest) -> Result<ReportResponse> {
        self.respond().await?;
        self.reports.lock().push(request);
        Ok(ReportResponse::default())
    }
}

pub fn check_request(consumer: &str) -> CheckRequest {
    CheckRequest::new(SERVICE, Operation::new("check-op", "ListShelves", consumer))
}

pub fn quota_request(id: &str, consumer: &str, amount: i64) -> AllocateQuotaRequest {
    AllocateQuotaRequest::new(
        SERVICE,
        QuotaOperation::new(id, "ListShelves", consumer).with_metric("read_requests", amount),
    )
}

pub fn report_request(id: &str, consumer: &str, count: i64) -> ReportRequest {
    ReportRequest::new(
        SERVICE,
        vec![Operation::new(id, "ListShelves", consumer).with_metric(REQUEST_COUNT, MetricValue::int64(count))],
    )
}
