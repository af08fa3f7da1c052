//! Metrics definitions for the discussion service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `ds_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `endpoint`: route templates, unknown paths collapse to `/other`
//! - `outcome`, `kind`, `event`, `sender_kind`: fixed enumerations in code

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the global Prometheus recorder and return the handle that
/// renders `/metrics`.
///
/// Must run before anything is recorded. HTTP duration buckets are centred
/// on a 200ms p95 target.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("ds_http_request".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.150, 0.200, 0.300, 0.500, 1.000, 2.000,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP request buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

/// Route templates reported as `endpoint`. `{id}` stands for a UUID segment.
const KNOWN_ENDPOINTS: &[&str] = &[
    "/health",
    "/metrics",
    "/api/v1/invitations",
    "/api/v1/invitations/{id}/cancel",
    "/api/v1/invitations/{id}/resend",
    "/api/v1/invite/{token}",
    "/api/v1/invite/{token}/validate",
    "/api/v1/invite/{token}/accept",
    "/api/v1/invite/{token}/decline",
    "/api/v1/discussions/{id}/invitations",
    "/api/v1/discussions/{id}/invitation-link",
    "/api/v1/discussions/{id}/join",
    "/api/v1/discussions/{id}/leave",
    "/api/v1/discussions/{id}/messages",
    "/api/v1/discussions/{id}/typing",
    "/api/v1/discussions/{id}/stream",
    "/api/v1/messages/{id}",
    "/api/v1/messages/{id}/reactions",
];

// ============================================================================
// HTTP
// ============================================================================

/// Record HTTP request completion
///
/// Metric: `ds_http_requests_total`, `ds_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status` / `status_code`
pub fn record_http_request(method: &str, path: &str, status_code: u16, duration: Duration) {
    let endpoint = normalize_endpoint(path);
    let status = categorize_status_code(status_code);

    histogram!("ds_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => endpoint.clone(),
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("ds_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Collapse dynamic path segments so the label set stays bounded.
fn normalize_endpoint(path: &str) -> String {
    let mut normalized = Vec::new();
    let mut previous = "";
    for segment in path.split('/') {
        let replaced = if previous == "invite" {
            "{token}"
        } else if uuid::Uuid::parse_str(segment).is_ok() {
            "{id}"
        } else {
            segment
        };
        normalized.push(replaced);
        previous = segment;
    }
    let candidate = normalized.join("/");

    if KNOWN_ENDPOINTS.contains(&candidate.as_str()) {
        candidate
    } else {
        "/other".to_string()
    }
}

// ============================================================================
// Invitations and tokens
// ============================================================================

/// Metric: `ds_token_verifications_total`
/// Labels: `outcome` (valid, expired, or a token fault)
pub fn record_token_verification(outcome: &'static str) {
    counter!("ds_token_verifications_total", "outcome" => outcome).increment(1);
}

/// Metric: `ds_invitations_created_total`
/// Labels: `kind` (email, link)
pub fn record_invitation_created(kind: &'static str) {
    counter!("ds_invitations_created_total", "kind" => kind).increment(1);
}

/// Metric: `ds_invitations_expired_total`
pub fn record_invitations_expired(count: u64) {
    counter!("ds_invitations_expired_total").increment(count);
}

// ============================================================================
// Participation
// ============================================================================

/// Metric: `ds_joins_total`
/// Labels: `kind` (account, anonymous), `outcome` (admitted, rejoined, or an error code)
pub fn record_join(kind: &'static str, outcome: &'static str) {
    counter!("ds_joins_total", "kind" => kind, "outcome" => outcome).increment(1);
}

/// Metric: `ds_messages_sent_total`
/// Labels: `sender_kind`
pub fn record_message_sent(sender_kind: &'static str) {
    counter!("ds_messages_sent_total", "sender_kind" => sender_kind).increment(1);
}

// ============================================================================
// Streams
// ============================================================================

/// Metric: `ds_active_streams` (gauge)
pub fn stream_opened() {
    gauge!("ds_active_streams").increment(1.0);
}

pub fn stream_closed() {
    gauge!("ds_active_streams").decrement(1.0);
}

/// Metric: `ds_stream_events_total`
/// Labels: `event`
pub fn record_stream_event(event: &'static str) {
    counter!("ds_stream_events_total", "event" => event).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_normalize_endpoint_known_paths() {
        assert_eq!(normalize_endpoint("/health"), "/health");
        assert_eq!(normalize_endpoint("/metrics"), "/metrics");
        assert_eq!(normalize_endpoint("/api/v1/invitations"), "/api/v1/invitations");
    }

    #[test]
    fn test_normalize_endpoint_replaces_ids_and_tokens() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(
            normalize_endpoint(&format!("/api/v1/discussions/{id}/messages")),
            "/api/v1/discussions/{id}/messages"
        );
        assert_eq!(
            normalize_endpoint(&format!("/api/v1/messages/{id}/reactions")),
            "/api/v1/messages/{id}/reactions"
        );
        assert_eq!(
            normalize_endpoint("/api/v1/invite/eyJhbGciOi.eyJwdXJwb3Nl.c2ln/accept"),
            "/api/v1/invite/{token}/accept"
        );
    }

    #[test]
    fn test_normalize_endpoint_unknown_paths() {
        assert_eq!(normalize_endpoint("/"), "/other");
        assert_eq!(normalize_endpoint("/api/v1/discussions/not-a-uuid/join"), "/other");
        assert_eq!(normalize_endpoint("/wp-admin"), "/other");
    }

    #[test]
    fn test_categorize_status_code() {
        assert_eq!(categorize_status_code(200), "success");
        assert_eq!(categorize_status_code(201), "success");
        assert_eq!(categorize_status_code(408), "timeout");
        assert_eq!(categorize_status_code(504), "timeout");
        assert_eq!(categorize_status_code(401), "error");
        assert_eq!(categorize_status_code(500), "error");
    }

    #[test]
    fn test_recorded_metric_names() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_http_request("GET", "/health", 200, Duration::from_millis(3));
            record_token_verification("valid");
            record_token_verification("bad_signature");
            record_invitation_created("link");
            record_invitations_expired(2);
            record_join("anonymous", "admitted");
            record_message_sent("participant");
            stream_opened();
            stream_opened();
            stream_closed();
            record_stream_event("keepalive");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let names: Vec<&str> = snapshot.iter().map(|(key, _, _, _)| key.key().name()).collect();
        for expected in [
            "ds_http_requests_total",
            "ds_http_request_duration_seconds",
            "ds_token_verifications_total",
            "ds_invitations_created_total",
            "ds_invitations_expired_total",
            "ds_joins_total",
            "ds_messages_sent_total",
            "ds_active_streams",
            "ds_stream_events_total",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }

        let streams = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "ds_active_streams")
            .map(|(_, _, _, value)| value)
            .unwrap();
        assert!(matches!(streams, DebugValue::Gauge(v) if (v.into_inner() - 1.0).abs() < f64::EPSILON));
    }
}
