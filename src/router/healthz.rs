//! Liveness probe.

/// `GET /healthz`.
pub async fn handler() -> &'static str {
    "OK"
}
