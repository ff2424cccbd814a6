//! fab-serve CLI entry point.
//!
//! Usage:
//!   fab-serve <FILE> [--port 3000] [--host 0.0.0.0] [--cert cert.pem --key key.pem]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fab_serve::{
    BridgeConfig, Bundle, FabServer, RequestBridge, SandboxConfig, SandboxHost, ServerConfig,
    TlsConfig,
};

/// Serve a FAB bundle over HTTP.
#[derive(Debug, Parser)]
#[command(name = "fab-serve", version, about)]
struct Cli {
    /// Path to the bundle (.zip)
    file: PathBuf,

    /// Port to listen on
    #[arg(long, env = "FAB_PORT", default_value_t = 3000)]
    port: u16,

    /// Interface to bind
    #[arg(long, env = "FAB_HOST", default_value = "0.0.0.0")]
    host: String,

    /// PEM certificate; serve HTTPS when given together with --key
    #[arg(long, env = "FAB_CERT", requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key for --cert
    #[arg(long, env = "FAB_KEY", requires = "cert")]
    key: Option<PathBuf>,

    /// Origin the bundle may fetch() from (repeatable or comma separated)
    #[arg(long = "allow-origin", env = "FAB_ALLOW_ORIGIN", value_delimiter = ',')]
    allow_origin: Vec<String>,

    /// Sandbox heap limit in MiB (0 = unlimited)
    #[arg(long, env = "FAB_MAX_HEAP_MB", default_value_t = 64)]
    max_heap_mb: usize,

    /// Abort renders that take longer than this
    #[arg(long, env = "FAB_RENDER_TIMEOUT_MS")]
    render_timeout_ms: Option<u64>,

    /// Largest request body forwarded to the renderer
    #[arg(long, env = "FAB_MAX_BODY_BYTES", default_value_t = BridgeConfig::default().max_body_bytes)]
    max_body_bytes: usize,
}

impl Cli {
    fn tls(&self) -> Option<TlsConfig> {
        match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_path: cert.clone(),
                key_path: key.clone(),
            }),
            _ => None,
        }
    }

    fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            max_heap_size: (self.max_heap_mb > 0).then(|| self.max_heap_mb * 1024 * 1024),
            allowed_origins: self.allow_origin.clone(),
        }
    }

    async fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("Invalid --host '{}'", self.host))?
            .next()
            .ok_or_else(|| anyhow!("--host '{}' did not resolve to an address", self.host))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fab_serve=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let bundle = Bundle::open(&cli.file)
        .await
        .with_context(|| format!("Failed to read bundle {}", cli.file.display()))?;
    info!(path = %cli.file.display(), files = bundle.len(), "Bundle loaded");
    let bundle = Arc::new(bundle);

    let renderer = SandboxHost::start(bundle.clone(), cli.sandbox_config()).await?;

    let server_config = ServerConfig::default()
        .with_bind_addr(cli.bind_addr().await?)
        .with_tls(cli.tls());

    let bridge_config = BridgeConfig::default()
        .with_scheme(server_config.scheme())
        .with_render_timeout(cli.render_timeout_ms.map(Duration::from_millis))
        .with_max_body_bytes(cli.max_body_bytes);

    let bridge = RequestBridge::new(bundle, Arc::new(renderer), bridge_config);

    info!(
        "Listening on {}://{}",
        server_config.scheme(),
        server_config.bind_addr
    );
    FabServer::new(bridge, server_config).run().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["fab-serve", "fab.zip"]).unwrap();
        assert_eq!(cli.file, PathBuf::from("fab.zip"));
        assert_eq!(cli.port, 3000);
        assert_eq!(cli.host, "0.0.0.0");
        assert!(cli.tls().is_none());
        assert_eq!(cli.sandbox_config().max_heap_size, Some(64 * 1024 * 1024));
        assert!(cli.render_timeout_ms.is_none());
    }

    #[test]
    fn test_cert_requires_key() {
        assert!(Cli::try_parse_from(["fab-serve", "fab.zip", "--cert", "c.pem"]).is_err());

        let cli = Cli::try_parse_from([
            "fab-serve", "fab.zip", "--cert", "c.pem", "--key", "k.pem",
        ])
        .unwrap();
        let tls = cli.tls().unwrap();
        assert_eq!(tls.cert_path, PathBuf::from("c.pem"));
        assert_eq!(tls.key_path, PathBuf::from("k.pem"));
    }

    #[test]
    fn test_allow_origin_list() {
        let cli = Cli::try_parse_from([
            "fab-serve",
            "fab.zip",
            "--allow-origin",
            "https://api.example.com,https://cdn.example.com",
            "--allow-origin",
            "http://localhost:8080",
            "--max-heap-mb",
            "0",
        ])
        .unwrap();

        let config = cli.sandbox_config();
        assert_eq!(config.allowed_origins.len(), 3);
        assert!(config.max_heap_size.is_none());
    }

    #[test]
    fn test_missing_file_argument() {
        assert!(Cli::try_parse_from(["fab-serve"]).is_err());
    }
}
