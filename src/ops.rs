//! Shared ops module - used by both build.rs (snapshot) and the crate.
//!
//! This module contains all custom ops and the extension! macro definition.
//! It must be importable by both the main crate and the build script, so it
//! only depends on external crates.

use deno_core::{op2, JsBuffer, OpState, ToJsBuffer};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::oneshot;

// ============================================================================
// Console
// ============================================================================

#[op2(fast)]
pub fn op_console_log(#[string] msg: &str) {
    tracing::info!(target: "fab_serve::console", "{}", msg);
}

#[op2(fast)]
pub fn op_console_error(#[string] msg: &str) {
    tracing::error!(target: "fab_serve::console", "{}", msg);
}

// ============================================================================
// Request bridge
// ============================================================================

/// A request on its way into `render`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub method: String,
    /// Absolute URL: scheme, host and original path+query.
    pub url: String,
    /// Header pairs in arrival order; repeated names stay repeated.
    pub headers: Vec<(String, String)>,
    /// `None` for methods that carry no body.
    pub body: Option<Vec<u8>>,
}

/// What `render` resolved to, fully materialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Result reported back to the waiting HTTP handler.
pub type RenderOutcome = Result<RenderedResponse, String>;

#[derive(Debug, Serialize)]
pub struct WireRequest {
    url: String,
    method: String,
    headers: Vec<(String, String)>,
    body: Option<ToJsBuffer>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseHead {
    status: u16,
    #[serde(default)]
    headers: Vec<(String, String)>,
}

struct PendingRender {
    request: Option<RenderRequest>,
    reply: oneshot::Sender<RenderOutcome>,
}

/// In-flight renders, keyed by the id handed to `__fab_dispatch`.
#[derive(Default)]
pub struct RenderQueue {
    next_id: u32,
    pending: HashMap<u32, PendingRender>,
}

impl RenderQueue {
    /// Register a request and return the id the JS side will ask for.
    pub fn admit(&mut self, request: RenderRequest, reply: oneshot::Sender<RenderOutcome>) -> u32 {
        // ids must fit in a V8 small integer
        let id = self.next_id;
        self.next_id = (self.next_id + 1) & 0x3fff_ffff;
        self.pending.insert(
            id,
            PendingRender {
                request: Some(request),
                reply,
            },
        );
        id
    }

    /// Hand the request over to JS. Each request can be taken once.
    pub fn take_request(&mut self, id: u32) -> Option<RenderRequest> {
        self.pending.get_mut(&id).and_then(|p| p.request.take())
    }

    /// Complete a render. Returns `false` if nobody is waiting any more.
    pub fn settle(&mut self, id: u32, outcome: RenderOutcome) -> bool {
        match self.pending.remove(&id) {
            Some(pending) => pending.reply.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fail every in-flight render. Returns how many were still waiting.
    pub fn fail_all(&mut self, reason: &str) -> usize {
        self.pending
            .drain()
            .map(|(_, pending)| pending.reply.send(Err(reason.to_string())).is_ok())
            .filter(|delivered| *delivered)
            .count()
    }
}

#[op2]
#[serde]
pub fn op_bridge_take_request(state: &mut OpState, #[smi] id: u32) -> Option<WireRequest> {
    let request = state.borrow_mut::<RenderQueue>().take_request(id)?;
    Some(WireRequest {
        url: request.url,
        method: request.method,
        headers: request.headers,
        body: request.body.map(ToJsBuffer::from),
    })
}

#[op2]
pub fn op_bridge_respond(
    state: &mut OpState,
    #[smi] id: u32,
    #[serde] head: ResponseHead,
    #[buffer] body: JsBuffer,
) {
    let response = RenderedResponse {
        status: head.status,
        headers: head.headers,
        body: body.to_vec(),
    };
    if !state.borrow_mut::<RenderQueue>().settle(id, Ok(response)) {
        tracing::debug!(id, "Render finished after its request was abandoned");
    }
}

#[op2(fast)]
pub fn op_bridge_fail(state: &mut OpState, #[smi] id: u32, #[string] reason: String) {
    if !state.borrow_mut::<RenderQueue>().settle(id, Err(reason)) {
        tracing::debug!(id, "Render failed after its request was abandoned");
    }
}

// ============================================================================
// Fetch API
// ============================================================================

/// Configuration for fetch allowlist
#[derive(Debug, Clone, Default)]
pub struct FetchConfig {
    /// Allowed origins (e.g., "https://api.example.com")
    /// An origin is scheme + host + port
    pub allowed_origins: Vec<String>,
}

impl FetchConfig {
    pub fn is_origin_allowed(&self, url: &url::Url) -> bool {
        if self.allowed_origins.is_empty() {
            return false;
        }
        let origin = url.origin().ascii_serialization();
        self.allowed_origins.iter().any(|allowed| origin == *allowed)
    }
}

/// Request info passed from JS
#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<Vec<(String, String)>>,
    #[serde(default)]
    pub body: Option<JsBuffer>,
}

/// Response info returned to JS
#[derive(Debug, Serialize)]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub url: String,
    pub body: ToJsBuffer,
}

#[op2(async)]
#[serde]
pub async fn op_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    let config = {
        let state_ref = state.borrow();
        state_ref.borrow::<FetchConfig>().clone()
    };

    do_fetch(request, config, 0).await
}

/// Same-origin redirects followed before a fetch gives up.
pub const MAX_REDIRECTS: usize = 20;

/// Internal fetch implementation (can be called recursively for redirects)
async fn do_fetch(
    request: FetchRequest,
    config: FetchConfig,
    redirects: usize,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    use anyhow::anyhow;
    use reqwest::{Client, Method};
    use url::Url;

    let url = Url::parse(&request.url)
        .map_err(|e| anyhow!("Invalid URL '{}': {}", request.url, e))?;

    if !config.is_origin_allowed(&url) {
        return Err(anyhow!(
            "Fetch blocked: origin '{}' is not in the allowlist. Allowed: {:?}",
            url.origin().ascii_serialization(),
            config.allowed_origins
        ));
    }

    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

    let method_name = request.method.as_deref().unwrap_or("GET").to_uppercase();
    let method = Method::from_bytes(method_name.as_bytes())
        .map_err(|_| anyhow!("Unsupported HTTP method: {}", method_name))?;

    let mut req_builder = client.request(method, url.clone());

    if let Some(ref headers) = request.headers {
        for (key, value) in headers {
            req_builder = req_builder.header(key, value);
        }
    }

    if let Some(body) = request.body {
        req_builder = req_builder.body(body.to_vec());
    }

    let response = req_builder
        .send()
        .await
        .map_err(|e| anyhow!("Fetch failed: {}", e))?;

    let status = response.status();
    let final_url = response.url().clone();

    // Only same-origin redirects are followed
    if status.is_redirection() {
        if let Some(location) = response.headers().get("location") {
            let location_str = location
                .to_str()
                .map_err(|_| anyhow!("Invalid redirect location"))?;
            let redirect_url = final_url
                .join(location_str)
                .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;

            if redirects >= MAX_REDIRECTS {
                return Err(anyhow!(
                    "Fetch failed: more than {} redirects starting at '{}'",
                    MAX_REDIRECTS,
                    url
                ));
            }

            if redirect_url.origin() != url.origin() {
                return Err(anyhow!(
                    "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                    redirect_url.origin().ascii_serialization(),
                    url.origin().ascii_serialization()
                ));
            }

            let redirect_request = FetchRequest {
                url: redirect_url.to_string(),
                method: Some("GET".to_string()),
                headers: request.headers.clone(),
                body: None,
            };

            return Box::pin(do_fetch(redirect_request, config, redirects + 1)).await;
        }
    }

    let resp_headers = response
        .headers()
        .iter()
        .filter_map(|(key, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (key.to_string(), v.to_string()))
        })
        .collect();

    let body = response
        .bytes()
        .await
        .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

    Ok(FetchResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
        headers: resp_headers,
        url: final_url.to_string(),
        body: ToJsBuffer::from(body.to_vec()),
    })
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    fab_sandbox,
    ops = [
        op_console_log,
        op_console_error,
        op_bridge_take_request,
        op_bridge_respond,
        op_bridge_fail,
        op_fetch,
    ],
    esm_entry_point = "ext:fab_sandbox/bootstrap.js",
    esm = ["ext:fab_sandbox/bootstrap.js" = "src/bootstrap.js"],
);
