#![deny(clippy::all)]

use crate::domain::request::{AllocateQuotaRequest, CheckRequest, ReportRequest};
use crate::domain::response::{AllocateQuotaResponse, CheckResponse, ReportResponse};
use async_trait::async_trait;
use shared::Result;
use std::sync::Arc;

// Ports are the pluggable transports that carry a request to the remote
// control plane. Retries, deadlines and encoding are theirs to own.

/// Port for delivering check calls.
#[async_trait]
pub trait CheckTransport: Send + Sync + 'static {
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse>;
}

/// Port for delivering quota allocation calls.
#[async_trait]
pub trait QuotaTransport: Send + Sync + 'static {
    async fn allocate_quota(&self, request: AllocateQuotaRequest) -> Result<AllocateQuotaResponse>;
}

/// Port for delivering report batches.
#[async_trait]
pub trait ReportTransport: Send + Sync + 'static {
    async fn report(&self, request: ReportRequest) -> Result<ReportResponse>;
}

/// The default transports a client is constructed with.
#[derive(Clone)]
pub struct Transports {
    pub check: Arc<dyn CheckTransport>,
    pub quota: Arc<dyn QuotaTransport>,
    pub report: Arc<dyn ReportTransport>,
}

impl Transports {
    pub fn new(
        check: Arc<dyn CheckTransport>,
        quota: Arc<dyn QuotaTransport>,
        report: Arc<dyn ReportTransport>,
    ) -> Self {
        Self {
            check,
            quota,
            report,
        }
    }

    /// Use one object for all three kinds.
    pub fn from_shared<T>(transport: Arc<T>) -> Self
    where
        T: CheckTransport + QuotaTransport + ReportTransport,
    {
        Self {
            check: transport.clone(),
            quota: transport.clone(),
            report: transport,
        }
    }
}

impl std::fmt::Debug for Transports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transports")
            .field("check", &"<dyn CheckTransport>")
            .field("quota", &"<dyn QuotaTransport>")
            .field("report", &"<dyn ReportTransport>")
            .finish()
    }
}
