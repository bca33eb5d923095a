//! The client façade: one aggregator per call kind, one shared flush timer.

use crate::domain::request::{AllocateQuotaRequest, CheckRequest, ReportRequest};
use crate::domain::response::{AllocateQuotaResponse, CheckResponse};
use crate::options::ClientOptions;
use crate::planes::check::CheckAggregator;
use crate::planes::quota::QuotaAggregator;
use crate::planes::report::ReportAggregator;
use crate::ports::{CheckTransport, QuotaTransport, ReportTransport, Transports};
use crate::stats::{FlushSummary, KindCounters, Statistics};
use parking_lot::Mutex;
use shared::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{RwLock, RwLockReadGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

struct ClientInner {
    service_name: String,
    service_config_id: String,
    check: CheckAggregator,
    quota: QuotaAggregator,
    report: ReportAggregator,
    check_counters: Arc<KindCounters>,
    quota_counters: Arc<KindCounters>,
    report_counters: Arc<KindCounters>,
    transports: Transports,
    shut_down: AtomicBool,
    /// Held shared by every call for its whole duration; shutdown takes it
    /// exclusively so nothing is still merging when the final drain runs.
    gate: RwLock<()>,
}

impl ClientInner {
    async fn enter(&self) -> Result<RwLockReadGuard<'_, ()>> {
        let guard = self.gate.read().await;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }
        Ok(guard)
    }

    /// Requests that leave the service envelope empty inherit the client's.
    fn stamp(&self, service_name: &mut String, service_config_id: &mut String) {
        if service_name.is_empty() {
            service_name.clone_from(&self.service_name);
        }
        if service_config_id.is_empty() {
            service_config_id.clone_from(&self.service_config_id);
        }
    }

    /// One timer tick: every aggregator decides what is due.
    async fn flush_due(&self) -> FlushSummary {
        let (check, quota, report) = tokio::join!(
            self.check.flush(self.transports.check.as_ref()),
            self.quota.flush(self.transports.quota.as_ref()),
            self.report.flush(self.transports.report.as_ref()),
        );
        let mut summary = check;
        summary.absorb(quota);
        summary.absorb(report);
        summary
    }

    async fn flush_now(&self) -> FlushSummary {
        let (check, quota, report) = tokio::join!(
            self.check.flush(self.transports.check.as_ref()),
            self.quota.flush(self.transports.quota.as_ref()),
            self.report.flush_now(self.transports.report.as_ref()),
        );
        let mut summary = check;
        summary.absorb(quota);
        summary.absorb(report);
        summary
    }

    async fn flush_all(&self) -> FlushSummary {
        let (check, quota, report) = tokio::join!(
            self.check.flush_all(self.transports.check.as_ref()),
            self.quota.flush_all(self.transports.quota.as_ref()),
            self.report.flush_all(self.transports.report.as_ref()),
        );
        let mut summary = check;
        summary.absorb(quota);
        summary.absorb(report);
        summary
    }

    /// Finest cadence any enabled aggregator needs.
    fn next_flush_interval(&self) -> Option<Duration> {
        [
            self.check
                .is_enabled()
                .then(|| self.check.options().flush_interval()),
            self.quota
                .is_enabled()
                .then(|| self.quota.options().refresh_interval()),
            self.report
                .is_enabled()
                .then(|| self.report.options().flush_interval()),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

struct FlushTimer {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Holds a weak reference so a forgotten client does not stay alive
/// because of its own timer.
async fn run_flush_timer(
    inner: Weak<ClientInner>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(period_ms = period.as_millis() as u64, "flush timer started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let summary = inner.flush_due().await;
                if !summary.is_idle() {
                    debug!(
                        sent = summary.sent,
                        failed = summary.failed,
                        expired = summary.expired,
                        "flush tick"
                    );
                }
            }
        }
    }
    info!("flush timer stopped");
}

/// Aggregating front end to a remote check/quota/report service.
///
/// Dropping the client stops the timer but sends nothing; call
/// [`shutdown`](Self::shutdown) to drain cached state first.
pub struct ServiceControlClient {
    inner: Arc<ClientInner>,
    timer: Mutex<Option<FlushTimer>>,
}

impl ServiceControlClient {
    /// Build the client and, if any aggregator is enabled, start the flush
    /// timer on the current tokio runtime.
    pub fn new(options: ClientOptions, transports: Transports) -> Result<Self> {
        let check_counters = Arc::new(KindCounters::new());
        let quota_counters = Arc::new(KindCounters::new());
        let report_counters = Arc::new(KindCounters::new());

        let inner = Arc::new(ClientInner {
            service_name: options.service_name,
            service_config_id: options.service_config_id,
            check: CheckAggregator::new(options.check, check_counters.clone()),
            quota: QuotaAggregator::new(options.quota, quota_counters.clone()),
            report: ReportAggregator::new(options.report, report_counters.clone()),
            check_counters,
            quota_counters,
            report_counters,
            transports,
            shut_down: AtomicBool::new(false),
            gate: RwLock::new(()),
        });

        let timer = match inner.next_flush_interval() {
            Some(period) => {
                let handle = Handle::try_current().map_err(|err| {
                    Error::Internal(format!("flush timer needs a tokio runtime: {err}"))
                })?;
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let task = handle.spawn(run_flush_timer(Arc::downgrade(&inner), period, shutdown_rx));
                Some(FlushTimer { shutdown_tx, task })
            }
            None => {
                info!("all aggregation disabled, no flush timer");
                None
            }
        };

        info!(
            service = %inner.service_name,
            check_entries = inner.check.options().num_entries(),
            quota_entries = inner.quota.options().num_entries(),
            report_entries = inner.report.options().num_entries(),
            "service control client ready"
        );

        Ok(Self {
            inner,
            timer: Mutex::new(timer),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub async fn check(&self, request: CheckRequest) -> Result<CheckResponse> {
        self.check_with(request, self.inner.transports.check.as_ref())
            .await
    }

    /// Check through `transport` instead of the default one. Only this call
    /// uses it; background revalidation keeps using the default.
    pub async fn check_with(
        &self,
        mut request: CheckRequest,
        transport: &dyn CheckTransport,
    ) -> Result<CheckResponse> {
        let _active = self.inner.enter().await?;
        self.inner.check_counters.record_call();
        self.inner
            .stamp(&mut request.service_name, &mut request.service_config_id);
        self.inner.check.check(request, transport).await
    }

    pub async fn allocate_quota(&self, request: AllocateQuotaRequest) -> Result<AllocateQuotaResponse> {
        self.allocate_quota_with(request, self.inner.transports.quota.as_ref())
            .await
    }

    pub async fn allocate_quota_with(
        &self,
        mut request: AllocateQuotaRequest,
        transport: &dyn QuotaTransport,
    ) -> Result<AllocateQuotaResponse> {
        let _active = self.inner.enter().await?;
        self.inner.quota_counters.record_call();
        self.inner
            .stamp(&mut request.service_name, &mut request.service_config_id);
        self.inner.quota.allocate_quota(request, transport).await
    }

    pub async fn report(&self, request: ReportRequest) -> Result<()> {
        self.report_with(request, self.inner.transports.report.as_ref())
            .await
    }

    pub async fn report_with(&self, mut request: ReportRequest, transport: &dyn ReportTransport) -> Result<()> {
        let _active = self.inner.enter().await?;
        self.inner.report_counters.record_call();
        self.inner
            .stamp(&mut request.service_name, &mut request.service_config_id);
        self.inner.report.report(request, transport).await
    }

    pub fn statistics(&self) -> Statistics {
        let inner = &self.inner;
        Statistics {
            check: inner
                .check_counters
                .snapshot(inner.check.cache().len(), inner.check.cache().pending_len()),
            quota: inner
                .quota_counters
                .snapshot(inner.quota.cache().len(), inner.quota.cache().pending_len()),
            report: inner
                .report_counters
                .snapshot(inner.report.cache().len(), inner.report.cache().pending_len()),
        }
    }

    /// Timer period: the smallest interval among enabled aggregators, or
    /// `None` when everything is disabled.
    pub fn next_flush_interval(&self) -> Option<Duration> {
        self.inner.next_flush_interval()
    }

    /// Run one flush pass now instead of waiting for the timer. Failed
    /// sends stay cached for the next pass and are reported as an error.
    pub async fn flush(&self) -> Result<()> {
        let _active = self.inner.enter().await?;
        let summary = self.inner.flush_now().await;
        if summary.failed > 0 {
            return Err(Error::transport(format!("{} flush calls failed", summary.failed)));
        }
        Ok(())
    }

    /// Refuse new calls, wait for the ones already running, stop the timer,
    /// then send everything still cached. Later calls fail with
    /// [`Error::ShutDown`]. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        drop(self.inner.gate.write().await);

        let timer = self.timer.lock().take();
        if let Some(FlushTimer { shutdown_tx, task }) = timer {
            let _ = shutdown_tx.send(true);
            if let Err(err) = task.await {
                warn!(error = %err, "flush timer ended abnormally");
            }
        }

        let summary = self.inner.flush_all().await;
        info!(
            sent = summary.sent,
            failed = summary.failed,
            "service control client shut down"
        );
        if summary.failed > 0 {
            return Err(Error::transport(format!(
                "{} calls failed during final flush",
                summary.failed
            )));
        }
        Ok(())
    }
}

impl Drop for ServiceControlClient {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            let _ = timer.shutdown_tx.send(true);
        }
    }
}

impl std::fmt::Debug for ServiceControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceControlClient")
            .field("service_name", &self.inner.service_name)
            .field("check", &self.inner.check)
            .field("quota", &self.inner.quota)
            .field("report", &self.inner.report)
            .field("transports", &self.inner.transports)
            .finish()
    }
}
