//! Prometheus metrics exposition
//!
//! - `oidc_gate_requests_total` (counter): label `status`
//! - `oidc_gate_authorization_redirects_total` (counter): label `reason`
//!   (`initial` or `revocation`)
//! - `oidc_gate_callbacks_total` (counter): label `outcome` (`success` or
//!   the flow error kind)
//! - `oidc_gate_token_exchange_duration_seconds` (histogram): label `grant`

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use oidc_flow::BoxFuture;
use oidc_flow::token::{CodeExchange, ExchangeError, RefreshResponse, TokenResponse};

const EXCHANGE_DURATION: &str = "oidc_gate_token_exchange_duration_seconds";

/// Token endpoint round trips are tens of milliseconds to a few seconds.
const EXCHANGE_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The exchange histogram gets explicit buckets so it renders `_bucket`
/// lines rather than a summary.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(EXCHANGE_DURATION.to_string()), EXCHANGE_BUCKETS)
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Process-local counters backing `/health`.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub flows_completed: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            flows_completed: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.flows_completed.load(Ordering::Relaxed)
    }
}

/// Record a gated request by final status code.
pub fn record_request(status: u16) {
    metrics::counter!("oidc_gate_requests_total", "status" => status.to_string()).increment(1);
}

/// Record a redirect to the authorization endpoint.
pub fn record_authorization_redirect(reason: &'static str) {
    metrics::counter!("oidc_gate_authorization_redirects_total", "reason" => reason).increment(1);
}

/// Record a callback by outcome label.
pub fn record_callback(outcome: &'static str) {
    metrics::counter!("oidc_gate_callbacks_total", "outcome" => outcome).increment(1);
}

/// `CodeExchange` decorator timing each token endpoint call.
pub struct TimedExchange<E> {
    inner: E,
}

impl<E: CodeExchange> TimedExchange<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<E: CodeExchange> CodeExchange for TimedExchange<E> {
    fn exchange<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: &'a str,
        code_verifier: Option<&'a str>,
    ) -> BoxFuture<'a, Result<TokenResponse, ExchangeError>> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.exchange(code, redirect_uri, code_verifier).await;
            metrics::histogram!(EXCHANGE_DURATION, "grant" => "authorization_code")
                .record(started.elapsed().as_secs_f64());
            result
        })
    }

    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<RefreshResponse, ExchangeError>> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.refresh(refresh_token).await;
            metrics::histogram!(EXCHANGE_DURATION, "grant" => "refresh_token")
                .record(started.elapsed().as_secs_f64());
            result
        })
    }
}
