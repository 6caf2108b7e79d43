//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use parley_core::{BufferStats, MessageBuffer, WaiterId};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const MESSAGES_POSTED_TOTAL: &str = "parley_messages_posted_total";
    pub const MESSAGES_CACHED: &str = "parley_messages_cached";
    pub const POLLS_TOTAL: &str = "parley_polls_total";
    pub const WAITERS_ACTIVE: &str = "parley_waiters_active";
    pub const DELIVERY_FAILURES_TOTAL: &str = "parley_delivery_failures_total";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::MESSAGES_POSTED_TOTAL,
        "Total number of messages posted since server start"
    );
    metrics::describe_gauge!(names::MESSAGES_CACHED, "Current number of cached messages");
    metrics::describe_counter!(
        names::POLLS_TOTAL,
        "Total number of update polls by outcome"
    );
    metrics::describe_gauge!(names::WAITERS_ACTIVE, "Current number of parked long-polls");
    metrics::describe_counter!(
        names::DELIVERY_FAILURES_TOTAL,
        "Total number of failed waiter deliveries"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of request errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record posted messages.
pub fn record_posted(count: usize) {
    counter!(names::MESSAGES_POSTED_TOTAL).increment(count as u64);
}

/// Record the outcome of an update poll.
pub fn record_poll(outcome: &'static str) {
    counter!(names::POLLS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a request error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish a snapshot of buffer statistics.
pub fn set_buffer_stats(stats: &BufferStats) {
    gauge!(names::MESSAGES_CACHED).set(stats.cached as f64);
    gauge!(names::WAITERS_ACTIVE).set(stats.waiters as f64);
    counter!(names::DELIVERY_FAILURES_TOTAL).absolute(stats.delivery_failures);
}

/// Metrics guard for one update poll.
///
/// Records `immediate` or `parked` when created. If dropped before
/// [`PollMetricsGuard::finish`], the poll was abandoned mid-wait: the waiter is
/// cancelled, `cancelled` is recorded and the buffer gauges are refreshed.
pub struct PollMetricsGuard {
    buffer: MessageBuffer,
    waiter: Option<WaiterId>,
    finished: bool,
}

impl PollMetricsGuard {
    /// Create a guard for a poll registered as `waiter`.
    ///
    /// `None` means the poll was answered from the cache.
    #[must_use]
    pub fn new(buffer: &MessageBuffer, waiter: Option<WaiterId>) -> Self {
        match waiter {
            None => record_poll("immediate"),
            Some(_) => {
                record_poll("parked");
                set_buffer_stats(&buffer.stats());
            }
        }
        Self {
            buffer: buffer.clone(),
            waiter,
            finished: false,
        }
    }

    /// Mark the poll as answered, recording `outcome` if given.
    pub fn finish(mut self, outcome: Option<&'static str>) {
        self.finished = true;
        if let Some(outcome) = outcome {
            record_poll(outcome);
        }
        if self.waiter.is_some() {
            set_buffer_stats(&self.buffer.stats());
        }
    }
}

impl Drop for PollMetricsGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // The waiter may still be alive; cancel first so the gauges are exact.
        if let Some(id) = self.waiter {
            self.buffer.cancel(id);
        }
        record_poll("cancelled");
        set_buffer_stats(&self.buffer.stats());
    }
}
