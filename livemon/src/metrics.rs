use metrics::{counter, describe_counter, describe_gauge, gauge, histogram, with_local_recorder};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use time::OffsetDateTime;

use crate::state::State;

pub const LAST_TOUCHED: &str = "livemon_last_touched";
pub const LAST_SUCCESS: &str = "livemon_last_success";
pub const REPORTS: &str = "livemon_reports_total";
pub const HTTP_REQUESTS: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION: &str = "http_requests_duration_seconds";

const BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Outcome of a single control connection, used as the `outcome` label of
/// `livemon_reports_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Success,
    Failure,
    Malformed,
    PersistError,
}

impl ReportOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportOutcome::Success => "success",
            ReportOutcome::Failure => "failure",
            ReportOutcome::Malformed => "malformed",
            ReportOutcome::PersistError => "persist_error",
        }
    }
}

/// Exported view of the registry.
///
/// Each instance records into its own prometheus recorder instead of the global one,
/// so several registries (tests, mostly) never see each other's series.
pub struct LivenessMetrics {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl LivenessMetrics {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new()
            .set_buckets(BUCKETS)
            .expect("bucket list is not empty")
            .build_recorder();
        let handle = recorder.handle();

        with_local_recorder(&recorder, || {
            describe_gauge!(LAST_TOUCHED, "timestamp of the last time a unit was poked");
            describe_gauge!(LAST_SUCCESS, "timestamp of the last time a unit succeeded");
            describe_counter!(REPORTS, "control connections handled, by outcome");
        });

        Self { recorder, handle }
    }

    /// Mirror every known timestamp into the gauges. Series are only ever set,
    /// never removed: a unit going quiet must keep its last value so that
    /// staleness shows up downstream.
    pub fn refresh(&self, state: &State) {
        with_local_recorder(&self.recorder, || {
            for (unit, record) in &state.units {
                if let Some(touched) = record.last_touched {
                    gauge!(LAST_TOUCHED, "unit" => unit.clone()).set(unix_seconds(touched));
                }
                if let Some(success) = record.last_success {
                    gauge!(LAST_SUCCESS, "unit" => unit.clone()).set(unix_seconds(success));
                }
            }
        });
    }

    pub fn record_report(&self, outcome: ReportOutcome) {
        with_local_recorder(&self.recorder, || {
            counter!(REPORTS, "outcome" => outcome.as_str()).increment(1);
        });
    }

    pub fn record_request(&self, method: String, path: String, status: String, latency: f64) {
        let labels = [("method", method), ("path", path), ("status", status)];

        with_local_recorder(&self.recorder, || {
            counter!(HTTP_REQUESTS, &labels).increment(1);
            histogram!(HTTP_REQUEST_DURATION, &labels).record(latency);
        });
    }

    /// Prometheus text exposition of everything recorded so far.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Default for LivenessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub fn unix_seconds(t: OffsetDateTime) -> f64 {
    t.unix_timestamp() as f64
}
