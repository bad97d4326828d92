//! Prometheus scrape endpoint.

use axum::extract::State;
use axum::http::{HeaderMap, header};

use crate::AppState;
use crate::credentials::Credentials;
use crate::error::{Result, ServerError};

/// `GET /metrics`, guarded by Basic authentication when
/// `prometheus.username` and `prometheus.password` are both set.
pub async fn handler(State(state): State<AppState>, headers: HeaderMap) -> Result<String> {
    if let Some((username, password)) = state.config.prometheus.credentials() {
        let credentials = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Credentials::from_header(value).ok())
            .ok_or(ServerError::Unauthorized)?;

        if credentials.username != username || credentials.password != password {
            tracing::info!(username = %credentials.username, "invalid metrics credentials");
            return Err(ServerError::Unauthorized);
        }
    }

    let handle = state.metrics.as_ref().ok_or_else(|| ServerError::Internal {
        details: "metrics recorder not installed".into(),
        source: None,
    })?;

    Ok(handle.render())
}
