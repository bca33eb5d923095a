use aggregator::domain::request::{AllocateQuotaRequest, CheckRequest, ReportRequest};
use aggregator::domain::response::{
    AllocateQuotaResponse, CheckError, CheckResponse, QuotaError, ReportResponse,
};
use aggregator::domain::{MetricValue, MetricValueSet, Operation, QuotaOperation};
use aggregator::{
    CheckTransport, ClientOptions, QuotaTransport, ReportTransport, ServiceControlClient,
    Transports,
};
use async_trait::async_trait;
use rand::Rng;
use shared::config::ClientConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const REQUEST_COUNT_METRIC: &str = "serviceruntime.googleapis.com/api/consumer/request_count";
const READ_QUOTA_METRIC: &str = "serviceruntime.googleapis.com/api/consumer/read_requests";
/// Consumers with this id are always refused by the simulated service.
const BLOCKED_CONSUMER: &str = "project:blocked";

/// In-memory stand-in for the remote control plane.
struct SimulatedControlPlane {
    quota_grant: i64,
    max_latency_ms: u64,
    checks: AtomicU64,
    allocations: AtomicU64,
    reports: AtomicU64,
    reported_operations: AtomicU64,
}

impl SimulatedControlPlane {
    fn new(quota_grant: i64, max_latency_ms: u64) -> Self {
        Self {
            quota_grant,
            max_latency_ms,
            checks: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            reports: AtomicU64::new(0),
            reported_operations: AtomicU64::new(0),
        }
    }

    async fn latency(&self) {
        let millis = rand::rng().random_range(1..=self.max_latency_ms.max(1));
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

#[async_trait]
impl CheckTransport for SimulatedControlPlane {
    async fn check(&self, request: CheckRequest) -> shared::Result<CheckResponse> {
        self.checks.fetch_add(1, Ordering::Relaxed);
        self.latency().await;
        let operation = request.operation;
        if operation.consumer_id == BLOCKED_CONSUMER {
            return Ok(CheckResponse::denied(
                operation.operation_id,
                CheckError::new("PERMISSION_DENIED", "consumer is blocked"),
            ));
        }
        Ok(CheckResponse::allowed(operation.operation_id))
    }
}

#[async_trait]
impl QuotaTransport for SimulatedControlPlane {
    async fn allocate_quota(
        &self,
        request: AllocateQuotaRequest,
    ) -> shared::Result<AllocateQuotaResponse> {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.latency().await;
        let operation = request.allocate_operation;
        if operation.consumer_id == BLOCKED_CONSUMER {
            return Ok(AllocateQuotaResponse {
                operation_id: operation.operation_id,
                allocate_errors: vec![QuotaError {
                    code: "RESOURCE_EXHAUSTED".to_string(),
                    subject: operation.consumer_id,
                    description: "quota exhausted".to_string(),
                }],
                quota_metrics: Vec::new(),
            });
        }
        let quota_metrics = operation
            .quota_metrics
            .iter()
            .map(|set| {
                MetricValueSet::new(
                    set.metric_name.clone(),
                    vec![MetricValue::int64(self.quota_grant)],
                )
            })
            .collect();
        Ok(AllocateQuotaResponse {
            operation_id: operation.operation_id,
            allocate_errors: Vec::new(),
            quota_metrics,
        })
    }
}

#[async_trait]
impl ReportTransport for SimulatedControlPlane {
    async fn report(&self, request: ReportRequest) -> shared::Result<ReportResponse> {
        self.reports.fetch_add(1, Ordering::Relaxed);
        self.reported_operations
            .fetch_add(request.operations.len() as u64, Ordering::Relaxed);
        self.latency().await;
        Ok(ReportResponse::default())
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn consumer_for(key: u64) -> String {
    if key == 0 {
        BLOCKED_CONSUMER.to_string()
    } else {
        format!("project:consumer-{key}")
    }
}

async fn drive_worker(
    client: Arc<ServiceControlClient>,
    worker: u64,
    calls: u64,
    key_space: u64,
) -> (u64, u64) {
    let mut allowed = 0;
    let mut failed = 0;
    for call in 0..calls {
        let key = rand::rng().random_range(0..key_space.max(1));
        let consumer = consumer_for(key);
        let operation_id = format!("w{worker}-c{call}");

        let check = CheckRequest::new(
            client.service_name(),
            Operation::new(&operation_id, "ListShelves", &consumer),
        );
        match client.check(check).await {
            Ok(response) if response.is_allowed() => allowed += 1,
            Ok(_) => {}
            Err(err) => {
                warn!(worker, error = %err, "check failed");
                failed += 1;
                continue;
            }
        }

        let quota = AllocateQuotaRequest::new(
            client.service_name(),
            QuotaOperation::new(&operation_id, "ListShelves", &consumer)
                .with_metric(READ_QUOTA_METRIC, 1),
        );
        if let Err(err) = client.allocate_quota(quota).await {
            warn!(worker, error = %err, "quota allocation failed");
            failed += 1;
        }

        let report = ReportRequest::new(
            client.service_name(),
            vec![
                Operation::new(&operation_id, "ListShelves", &consumer)
                    .with_metric(REQUEST_COUNT_METRIC, MetricValue::int64(1)),
            ],
        );
        if let Err(err) = client.report(report).await {
            warn!(worker, error = %err, "report failed");
            failed += 1;
        }
    }
    (allowed, failed)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting control plane simulation");

    match dotenvy::dotenv() {
        Ok(_) => info!("Loaded environment variables from .env file"),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let config = ClientConfig::from_env()?;
    let options = ClientOptions::try_from(&config)?;

    let workers: u64 = env_or("SIM_WORKERS", 32);
    let calls_per_worker: u64 = env_or("SIM_CALLS_PER_WORKER", 200);
    let key_space: u64 = env_or("SIM_KEY_SPACE", 16);
    let quota_grant: i64 = env_or("SIM_QUOTA_GRANT", 100);
    let max_latency_ms: u64 = env_or("SIM_MAX_LATENCY_MS", 5);

    let remote = Arc::new(SimulatedControlPlane::new(quota_grant, max_latency_ms));
    let client = Arc::new(ServiceControlClient::new(
        options,
        Transports::from_shared(remote.clone()),
    )?);

    info!(
        workers,
        calls_per_worker,
        key_space,
        flush_interval_ms = client.next_flush_interval().map(|d| d.as_millis() as u64),
        "Driving load"
    );

    let start = Instant::now();
    let mut tasks = JoinSet::new();
    for worker in 0..workers {
        tasks.spawn(drive_worker(client.clone(), worker, calls_per_worker, key_space));
    }

    let mut allowed = 0;
    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((worker_allowed, worker_failed)) => {
                allowed += worker_allowed;
                failed += worker_failed;
            }
            Err(err) => warn!(error = %err, "worker task panicked"),
        }
    }
    let elapsed = start.elapsed();

    if let Err(err) = client.shutdown().await {
        warn!(error = %err, "final flush incomplete");
    }

    let stats = client.statistics();
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        allowed,
        failed,
        remote_checks = remote.checks.load(Ordering::Relaxed),
        remote_allocations = remote.allocations.load(Ordering::Relaxed),
        remote_reports = remote.reports.load(Ordering::Relaxed),
        remote_reported_operations = remote.reported_operations.load(Ordering::Relaxed),
        "Simulation finished"
    );
    info!("Client statistics: {}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}
