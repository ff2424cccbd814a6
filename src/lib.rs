//! # fab-serve
//!
//! Serves a FAB (Frontend Application Bundle) over HTTP.
//!
//! A FAB is a zip archive holding a `/server.js` entry program plus static
//! files under `/_assets/`. Assets are answered straight from the archive;
//! every other request goes to the `render(request, settings)` function the
//! entry program exports, which runs inside a sandboxed V8 isolate.
//!
//! ## Sandbox
//!
//! - **Whitelisted globals only**: fetch, Request, Response, Headers, URL,
//!   console, process, timers and `NODE_ENV`
//! - **No `Deno` namespace**: no filesystem, env or subprocess access
//! - **Imports stay in the bundle**: remote and `file:` specifiers are blocked
//! - **Outbound fetch is opt-in**: only allowlisted origins are reachable
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fab_serve::{BridgeConfig, Bundle, FabServer, RequestBridge, SandboxConfig, SandboxHost, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fab_serve::FabError> {
//!     let bundle = Arc::new(Bundle::open("fab.zip").await?);
//!     let renderer = SandboxHost::start(bundle.clone(), SandboxConfig::default()).await?;
//!     let bridge = RequestBridge::new(bundle, Arc::new(renderer), BridgeConfig::default());
//!     FabServer::new(bridge, ServerConfig::default()).run().await
//! }
//! ```

mod bridge;
mod bundle;
mod capabilities;
mod error;
mod loader;
mod ops;
mod renderer;
mod sandbox;
mod server;

pub use bridge::{content_type_for, into_http_response, BridgeConfig, RequestBridge, ASSET_PREFIX};
pub use bundle::{Bundle, ENTRY_PATH};
pub use capabilities::{CapabilityEnvironment, GLOBALS, NODE_ENV};
pub use error::FabError;
pub use loader::BundleLoader;
pub use ops::{FetchConfig, RenderRequest, RenderedResponse};
pub use renderer::{default_settings, Renderer, RendererInfo};
pub use sandbox::{create_runtime, RendererHandle, SandboxConfig, SandboxHost};
pub use server::{build_router, FabServer, ServerConfig, TestHandle, TlsConfig};
