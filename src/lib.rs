//! kube-ldap turns LDAP credentials into tokens Kubernetes can review.

#![forbid(unsafe_code)]
#![deny(unused_mut)]

pub mod config;
mod credentials;
pub mod error;
pub mod ldap;
mod router;
pub mod telemetry;
pub mod token;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::{get, post};
use axum::{Router, middleware as AxumMiddleware};
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};

use ldap::{Authenticator, Client, Connector, Ldap3Connector};

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    headers: Vec<(header::HeaderName, String)>,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        request = request.header(name, value);
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// State backed by an in-memory directory.
#[cfg(test)]
pub fn test_state(directory: &ldap::mock::Directory) -> AppState {
    test_state_with(directory, |_| {})
}

/// Same as [`test_state`], with `update` applied to the configuration.
#[cfg(test)]
pub fn test_state_with(
    directory: &ldap::mock::Directory,
    update: impl FnOnce(&mut config::Configuration),
) -> AppState {
    let mut config = config::Configuration::default();
    config.ldap.bind_dn = ldap::mock::SERVICE_DN.into();
    config.ldap.bind_pw = ldap::mock::SERVICE_PASSWORD.into();
    config.mapping.extra_fields = vec!["uidNumber".into(), "gidNumber".into()];
    update(&mut config);

    AppState::new(
        Arc::new(config),
        Arc::new(ldap::mock::MockConnector::new(directory.clone())),
        None,
    )
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub authenticator: Arc<Authenticator>,
    pub token: token::TokenManager,
    /// Serves `/metrics` when set.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wire the directory client, authenticator and token manager.
    pub fn new(
        config: Arc<config::Configuration>,
        connector: Arc<dyn Connector>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let ldap = &config.ldap;
        let client = Client::new(connector, &ldap.base_dn, &ldap.bind_dn, &ldap.bind_pw)
            .mode(ldap.mode)
            .require_tls(ldap.is_secure())
            .timeout(ldap.timeout());
        let authenticator = Arc::new(Authenticator::new(client, &ldap.filter));
        let token = token::TokenManager::new(&config.jwt.key, config.jwt.token_lifetime);

        Self {
            config,
            authenticator,
            token,
            metrics,
        }
    }
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout, longer than any directory round-trip.
        .layer(TimeoutLayer::with_status_code(
            StatusCode::SERVICE_UNAVAILABLE,
            state.config.request_timeout(),
        ))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    let mut routes = Router::new()
        // `GET /healthz` goes to `healthz`.
        .route("/healthz", get(router::healthz::handler))
        // `GET /auth` exchanges credentials for a token.
        .route("/auth", get(router::login::handler))
        // `POST /token` is the Kubernetes webhook.
        .route("/token", post(router::review::handler));

    if state.metrics.is_some() {
        routes = routes.route("/metrics", get(router::metrics::handler));
    }

    routes
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
pub fn initialize_state(
    config: Arc<config::Configuration>,
) -> Result<AppState, Box<dyn std::error::Error + Send + Sync>> {
    let metrics = telemetry::setup_metrics_recorder()?;

    let connector = Ldap3Connector::new(&config.ldap.uri, config.ldap.starttls, config.ldap.timeout());
    tracing::info!(
        uri = %config.ldap.uri,
        mode = ?config.ldap.mode,
        "directory client configured"
    );

    Ok(AppState::new(config, Arc::new(connector), Some(metrics)))
}
