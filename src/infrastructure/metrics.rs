//! Call metrics
//!
//! Recorded through the `metrics` facade; without an installed recorder every
//! call is a no-op, which is what the test suite relies on.

use crate::domain::call::{CallRole, EndReason, SignalKind};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and describe the call metrics
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("coach_call_duration_seconds".to_string()),
            &[5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0],
        )?
        .install_recorder()?;

    describe_counter!("coach_calls_started_total", "Calls placed or accepted");
    describe_counter!("coach_calls_ended_total", "Calls finished, by end reason");
    describe_gauge!("coach_call_active", "1 while this client has a call in progress");
    describe_histogram!("coach_call_duration_seconds", "Connected duration of finished calls");
    describe_counter!(
        "coach_signals_published_total",
        "Signaling messages published, by type"
    );
    describe_counter!(
        "coach_signal_publish_failures_total",
        "Signaling messages that could not be published"
    );

    Ok(handle)
}

pub fn record_call_started(role: CallRole) {
    let role = match role {
        CallRole::Caller => "caller",
        CallRole::Callee => "callee",
    };
    counter!("coach_calls_started_total", "role" => role).increment(1);
}

pub fn record_call_ended(reason: EndReason, duration_seconds: u64) {
    counter!("coach_calls_ended_total", "reason" => reason.as_str()).increment(1);
    if duration_seconds > 0 {
        histogram!("coach_call_duration_seconds").record(duration_seconds as f64);
    }
}

pub fn set_call_active(active: bool) {
    gauge!("coach_call_active").set(if active { 1.0 } else { 0.0 });
}

pub fn record_signal_published(kind: SignalKind) {
    counter!("coach_signals_published_total", "type" => kind.as_str()).increment(1);
}

pub fn record_signal_publish_failure(kind: SignalKind) {
    counter!("coach_signal_publish_failures_total", "type" => kind.as_str()).increment(1);
}
