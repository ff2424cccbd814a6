//! The contract between the HTTP side and the bundle's exported renderer.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::FabError;
use crate::ops::{RenderRequest, RenderedResponse};

/// Something that turns a request into a response the way the bundle's
/// `render(request, settings)` does.
///
/// [`crate::RendererHandle`] is the production implementation; it forwards
/// to the sandbox thread.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, request: RenderRequest) -> Result<RenderedResponse, FabError>;
}

/// What the sandbox learned about `module.exports` at load time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererInfo {
    /// Whether `getProdSettings()` is exported and will be merged per request.
    pub has_prod_settings: bool,
}

/// Settings every render receives before `getProdSettings()` overrides.
pub fn default_settings() -> serde_json::Value {
    serde_json::json!({
        "injected": "variables",
        "should": "work!",
    })
}
