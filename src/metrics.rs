//! Metric emission helpers
//!
//! Uses the `metrics` facade; wiring an exporter is the embedder's concern.
//! Names are stable: dashboards key on them.

use metrics::counter;

pub const PROXY_REQUESTS_TOTAL: &str = "codex_lb_proxy_requests_total";
pub const PROXY_ERRORS_TOTAL: &str = "codex_lb_proxy_errors_total";
pub const LB_MARK_TOTAL: &str = "codex_lb_mark_total";
pub const LB_MARK_PERMANENT_FAILURE_TOTAL: &str = "codex_lb_mark_permanent_failure_total";
pub const LB_EMPTY_POOL_TOTAL: &str = "codex_lb_empty_pool_total";
pub const REQUEST_LOG_BUFFER_DROPPED_TOTAL: &str = "codex_lb_request_log_buffer_dropped_total";
pub const USAGE_REFRESH_FAILURES_TOTAL: &str = "codex_lb_usage_refresh_failures_total";

pub fn record_proxy_request(status: &str, api: &str) {
    counter!(PROXY_REQUESTS_TOTAL, "status" => status.to_string(), "api" => api.to_string())
        .increment(1);
}

pub fn record_proxy_error(error_code: &str) {
    counter!(PROXY_ERRORS_TOTAL, "error_code" => error_code.to_string()).increment(1);
}

pub fn record_mark(event: &'static str) {
    counter!(LB_MARK_TOTAL, "event" => event).increment(1);
}

pub fn record_mark_permanent_failure(code: &str) {
    counter!(LB_MARK_PERMANENT_FAILURE_TOTAL, "code" => code.to_string()).increment(1);
}

pub fn record_empty_pool(reason: &'static str) {
    counter!(LB_EMPTY_POOL_TOTAL, "reason" => reason).increment(1);
}

pub fn record_request_log_dropped() {
    counter!(REQUEST_LOG_BUFFER_DROPPED_TOTAL).increment(1);
}

pub fn record_usage_refresh_failure(status_code: Option<u16>, phase: &'static str) {
    let status = status_code.map_or_else(|| "none".to_string(), |code| code.to_string());
    counter!(USAGE_REFRESH_FAILURES_TOTAL, "status_code" => status, "phase" => phase).increment(1);
}
