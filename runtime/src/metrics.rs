//! Prometheus metrics for observability and monitoring.
//!
//! Every runtime component records through the `metrics` facade, so nothing
//! is collected unless a recorder is installed. [`MetricsServer`] installs the
//! Prometheus recorder and renders the text exposition for whatever HTTP
//! layer the application already runs.
//!
//! Recorded metrics:
//! - Container dispatch, unhandled events, handler failures and duration
//! - Published transitions
//! - Coalescer executions, joins and in-flight keys
//! - Scope starts, ends and cleanup timeouts/failures
//!
//! # Example
//!
//! ```rust,no_run
//! use statecraft_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new();
//! server.start()?;
//!
//! // Serve this from a /metrics endpoint
//! let exposition = server.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder handle.
#[derive(Default)]
pub struct MetricsServer {
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create an unstarted server
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed (common in tests) is not an error;
    /// the server then has no handle and [`render`](Self::render) returns `None`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let message = e.to_string();
                if message.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

impl std::fmt::Debug for MetricsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsServer")
            .field("started", &self.handle.is_some())
            .finish()
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Container
    describe_counter!(
        "container_events_dispatched_total",
        "Total number of events dispatched to a use case"
    );
    describe_counter!(
        "container_events_unhandled_total",
        "Total number of events sent with no registered use case"
    );
    describe_counter!(
        "container_handler_failures_total",
        "Total number of use case executions that failed or panicked"
    );
    describe_histogram!(
        "container_handler_duration_seconds",
        "Use case execution duration in seconds"
    );
    describe_counter!(
        "container_transitions_published_total",
        "Total number of status transitions published"
    );

    // Coalescer
    describe_counter!(
        "coalescer_executions_total",
        "Total number of underlying operations started by the coalescer"
    );
    describe_counter!(
        "coalescer_joins_total",
        "Total number of callers that joined an in-flight operation"
    );
    describe_gauge!("coalescer_inflight", "Number of request keys currently in flight");

    // Scopes
    describe_counter!("scope_started_total", "Total number of scopes started");
    describe_counter!("scope_ended_total", "Total number of scopes ended");
    describe_counter!(
        "scope_cleanup_timeouts_total",
        "Total number of scope ends whose cleanup barrier timed out"
    );
    describe_counter!(
        "scope_cleanup_failures_total",
        "Total number of cleanup tasks that failed or panicked"
    );
}

/// Container metrics recorder.
pub struct ContainerMetrics;

impl ContainerMetrics {
    /// Record an event dispatched to a use case.
    pub fn record_dispatch(container: &str, event: &'static str) {
        counter!(
            "container_events_dispatched_total",
            "container" => container.to_string(),
            "event" => event
        )
        .increment(1);
    }

    /// Record an event with no use case.
    pub fn record_unhandled(container: &str, event: &'static str) {
        counter!(
            "container_events_unhandled_total",
            "container" => container.to_string(),
            "event" => event
        )
        .increment(1);
    }

    /// Record a finished use case execution.
    pub fn record_execution(container: &str, duration: Duration) {
        histogram!("container_handler_duration_seconds", "container" => container.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a use case failure or panic.
    pub fn record_failure(container: &str, event: &'static str) {
        counter!(
            "container_handler_failures_total",
            "container" => container.to_string(),
            "event" => event
        )
        .increment(1);
    }

    /// Record a published transition.
    pub fn record_transition(container: &str, kind: &'static str) {
        counter!(
            "container_transitions_published_total",
            "container" => container.to_string(),
            "kind" => kind
        )
        .increment(1);
    }
}

/// Coalescer metrics recorder.
pub struct CoalescerMetrics;

impl CoalescerMetrics {
    /// Record a new underlying execution.
    pub fn record_execution() {
        counter!("coalescer_executions_total").increment(1);
    }

    /// Record a caller joining an in-flight execution.
    pub fn record_join() {
        counter!("coalescer_joins_total").increment(1);
    }

    /// Record the number of keys in flight.
    pub fn record_inflight(count: usize) {
        // Precision loss acceptable for gauge values
        #[allow(clippy::cast_precision_loss)]
        gauge!("coalescer_inflight").set(count as f64);
    }
}

/// Scope metrics recorder.
pub struct ScopeMetrics;

impl ScopeMetrics {
    /// Record a scope start.
    pub fn record_start() {
        counter!("scope_started_total").increment(1);
    }

    /// Record a completed end protocol.
    pub fn record_end() {
        counter!("scope_ended_total").increment(1);
    }

    /// Record a cleanup barrier timeout.
    pub fn record_cleanup_timeout() {
        counter!("scope_cleanup_timeouts_total").increment(1);
    }

    /// Record failed cleanup tasks.
    pub fn record_cleanup_failures(count: usize) {
        counter!("scope_cleanup_failures_total").increment(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let server = MetricsServer::new();
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        ContainerMetrics::record_dispatch("counter", "Increment");
        CoalescerMetrics::record_inflight(3);
        ScopeMetrics::record_cleanup_failures(2);
    }

    #[test]
    fn test_metrics_server_render() {
        let mut server = MetricsServer::new();
        assert!(server.start().is_ok());

        ContainerMetrics::record_dispatch("counter", "Increment");
        CoalescerMetrics::record_join();
        ScopeMetrics::record_start();

        // Another test may have installed the recorder first
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("container_events_dispatched_total"));
            assert!(rendered.contains("coalescer_joins_total"));
            assert!(rendered.contains("scope_started_total"));
        }
    }
}
