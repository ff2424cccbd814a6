//! HTTP server implementation.
//!
//! This module provides the main [`FabServer`] struct for serving a bundle
//! over plain HTTP or HTTPS.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bridge::{serve, RequestBridge};
use crate::error::FabError;

/// Certificate and private key, both PEM encoded.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Serve HTTPS instead of HTTP when set.
    pub tls: Option<TlsConfig>,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            tls: None,
            graceful_shutdown: true,
        }
    }
}

impl ServerConfig {
    /// Create a new server config with custom bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Serve over TLS with the given certificate and key.
    pub fn with_tls(mut self, tls: Option<TlsConfig>) -> Self {
        self.tls = tls;
        self
    }

    /// URL scheme clients use to reach this server.
    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }
}

/// Build the router: every method and path goes through the bridge.
pub fn build_router(bridge: RequestBridge) -> Router {
    Router::new()
        .fallback(serve)
        .with_state(bridge)
        .layer(TraceLayer::new_for_http())
}

/// Bundle HTTP server.
pub struct FabServer {
    bridge: RequestBridge,
    config: ServerConfig,
}

impl FabServer {
    pub fn new(bridge: RequestBridge, config: ServerConfig) -> Self {
        Self { bridge, config }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound or the TLS material
    /// cannot be loaded.
    pub async fn run(self) -> Result<(), FabError> {
        let addr = self.config.bind_addr;
        let app = build_router(self.bridge);

        match self.config.tls {
            Some(tls) => {
                // reqwest and axum-server may both link a rustls provider
                let _ = rustls::crypto::ring::default_provider().install_default();

                let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                    .await
                    .map_err(|e| {
                        FabError::invalid_config(format!("Failed to load TLS certificate/key: {e}"))
                    })?;

                let handle = axum_server::Handle::new();
                if self.config.graceful_shutdown {
                    let shutdown = handle.clone();
                    tokio::spawn(async move {
                        shutdown_signal().await;
                        shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
                    });
                }

                info!(addr = %addr, "Starting HTTPS server");
                axum_server::bind_rustls(addr, rustls)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
                    .map_err(|e| FabError::invalid_config(format!("Server error: {e}")))?;
            }
            None => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| FabError::invalid_config(format!("Failed to bind: {e}")))?;

                info!(addr = %addr, "Starting HTTP server");
                if self.config.graceful_shutdown {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown_signal())
                        .await
                        .map_err(|e| FabError::invalid_config(format!("Server error: {e}")))?;
                } else {
                    axum::serve(listener, app)
                        .await
                        .map_err(|e| FabError::invalid_config(format!("Server error: {e}")))?;
                }
            }
        }

        info!("Server shutdown complete");
        Ok(())
    }

    /// Start the server on an ephemeral port (127.0.0.1:0) and return a
    /// handle for testing.
    pub async fn start_test(bridge: RequestBridge) -> Result<TestHandle, FabError> {
        let app = build_router(bridge);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| FabError::invalid_config(format!("Failed to bind: {e}")))?;

        let addr = listener
            .local_addr()
            .map_err(|e| FabError::invalid_config(format!("Failed to get addr: {e}")))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(TestHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

/// Handle for a test server instance.
pub struct TestHandle {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
