use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use kube_ldap::config::Configuration;
use kube_ldap::{app, initialize_state, telemetry};
use tokio::net::TcpListener;

const GRACE_PERIOD: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path = std::env::var("CONFIG_PATH").map(PathBuf::from).unwrap_or_default();
    let config = Configuration::default().path(path).read()?;

    telemetry::init(&config)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let state = initialize_state(config.clone())?;
    let router = app(state);

    if config.tls.enabled {
        let tls = RustlsConfig::from_pem_file(&config.tls.cert, &config.tls.key).await?;
        let handle = Handle::new();
        tokio::spawn({
            let handle = handle.clone();
            async move {
                shutdown_signal().await;
                handle.graceful_shutdown(Some(GRACE_PERIOD));
            }
        });

        tracing::info!(%addr, "listening on https");
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(router.into_make_service())
            .await?;
    } else {
        let listener = TcpListener::bind(addr).await?;

        tracing::info!(%addr, "listening on http");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    tracing::info!("server stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "cannot listen for ctrl+c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(err) => {
                tracing::error!(%err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
