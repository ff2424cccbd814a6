//! Request bridge between axum and the renderer.
//!
//! Every request either hits a static asset under `/_assets` or is handed
//! to the bundle's `render`. This module does all the shape translation in
//! both directions.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{
    CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING,
};
use axum::http::{HeaderName, HeaderValue, Method, Response, StatusCode};
use axum::response::IntoResponse;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use mime_guess::mime;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::bundle::Bundle;
use crate::error::FabError;
use crate::ops::{RenderRequest, RenderedResponse};
use crate::renderer::Renderer;

/// Paths under this prefix are served straight from the bundle.
pub const ASSET_PREFIX: &str = "/_assets";

/// Content type for assets whose extension is unknown.
pub const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Cache directive attached to every asset.
pub const ASSET_CACHE_CONTROL: &str = "immutable";

/// Default limit for buffered request bodies (16 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Content type for a bundle path, inferred from its extension.
pub fn content_type_for(path: &str) -> String {
    let Some(mime) = mime_guess::from_path(path).first() else {
        return DEFAULT_CONTENT_TYPE.to_string();
    };
    let textual = mime.type_() == mime::TEXT
        || mime.subtype() == mime::JAVASCRIPT
        || mime.subtype() == mime::JSON;
    if textual && mime.get_param(mime::CHARSET).is_none() {
        format!("{mime}; charset=utf-8")
    } else {
        mime.to_string()
    }
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Scheme used when rebuilding the absolute request URL.
    pub scheme: String,
    /// Host used when the request carries neither a Host header nor an authority.
    pub fallback_host: String,
    /// Give up on a render after this long (None = wait forever).
    pub render_timeout: Option<Duration>,
    /// Largest request body that will be buffered.
    pub max_body_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            fallback_host: "localhost".to_string(),
            render_timeout: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl BridgeConfig {
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_render_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.render_timeout = timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }
}

/// Per-request translation layer. Stateless between calls; cheap to clone.
#[derive(Clone)]
pub struct RequestBridge {
    bundle: Arc<Bundle>,
    renderer: Arc<dyn Renderer>,
    config: BridgeConfig,
}

impl RequestBridge {
    pub fn new(bundle: Arc<Bundle>, renderer: Arc<dyn Renderer>, config: BridgeConfig) -> Self {
        Self {
            bundle,
            renderer,
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Handle one HTTP transaction.
    pub async fn handle(&self, request: Request) -> Result<Response<Body>, FabError> {
        if request.uri().path().starts_with(ASSET_PREFIX) {
            return self.serve_asset(request.uri().path());
        }

        let render_request = self.to_render_request(request).await?;
        let rendered = match self.config.render_timeout {
            Some(limit) => tokio::time::timeout(limit, self.renderer.render(render_request))
                .await
                .map_err(|_| FabError::RenderTimeout {
                    duration_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })??,
            None => self.renderer.render(render_request).await?,
        };

        into_http_response(rendered)
    }

    fn serve_asset(&self, path: &str) -> Result<Response<Body>, FabError> {
        let bytes = self.bundle.get(path).ok_or_else(|| FabError::AssetNotFound {
            path: path.to_string(),
        })?;

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type_for(path))
            .header(CACHE_CONTROL, ASSET_CACHE_CONTROL)
            .body(Body::from(bytes.clone()))
            .map_err(|e| FabError::render(e.to_string()))
    }

    /// Buffer the body and rebuild the request the way `render` expects it.
    pub async fn to_render_request(&self, request: Request) -> Result<RenderRequest, FabError> {
        let (parts, body) = request.into_parts();

        let declared_length = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared_length.is_some_and(|len| len > self.config.max_body_bytes) {
            return Err(FabError::PayloadTooLarge {
                limit: self.config.max_body_bytes,
            });
        }

        let bytes = Limited::new(body, self.config.max_body_bytes)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    FabError::PayloadTooLarge {
                        limit: self.config.max_body_bytes,
                    }
                } else {
                    FabError::render(format!("Failed to read request body: {e}"))
                }
            })?
            .to_bytes();

        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_else(|| self.config.fallback_host.clone());
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let body = if parts.method == Method::GET || parts.method == Method::HEAD {
            None
        } else {
            Some(bytes.to_vec())
        };

        Ok(RenderRequest {
            method: parts.method.as_str().to_string(),
            url: format!("{}://{}{}", self.config.scheme, host, path_and_query),
            headers,
            body,
        })
    }
}

/// Headers never forwarded from a rendered response.
///
/// The body has already been decoded into raw bytes, so a stale
/// `content-encoding` would corrupt the client's decoding. Framing headers
/// are recomputed by hyper for the materialized body.
fn is_stripped(name: &HeaderName) -> bool {
    name == CONTENT_ENCODING || name == CONTENT_LENGTH || name == TRANSFER_ENCODING
}

/// Turn a materialized render result into an HTTP response.
pub fn into_http_response(rendered: RenderedResponse) -> Result<Response<Body>, FabError> {
    let status = StatusCode::from_u16(rendered.status)
        .map_err(|_| FabError::render(format!("Invalid status code: {}", rendered.status)))?;

    let mut response = Response::builder().status(status);
    for (name, value) in &rendered.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| FabError::render(format!("Invalid header name: {name}")))?;
        if is_stripped(&name) {
            continue;
        }
        let value = HeaderValue::from_str(value)
            .map_err(|_| FabError::render(format!("Invalid value for header {name}")))?;
        response = response.header(name, value);
    }

    response
        .body(Body::from(rendered.body))
        .map_err(|e| FabError::render(e.to_string()))
}

/// Axum entry point: every route lands here.
#[instrument(
    skip_all,
    fields(
        request_id = %Uuid::new_v4(),
        method = %request.method(),
        path = %request.uri().path(),
    )
)]
pub async fn serve(State(bridge): State<RequestBridge>, request: Request) -> Response<Body> {
    match bridge.handle(request).await {
        Ok(response) => response,
        Err(err @ FabError::AssetNotFound { .. }) => {
            warn!(error = %err, "Asset not found");
            err.into_response()
        }
        Err(err) => {
            error!(error = %err, "Request failed");
            err.into_response()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Renderer that records requests and answers with a fixed result.
    pub(crate) struct StubRenderer {
        pub(crate) seen: Mutex<Vec<RenderRequest>>,
        pub(crate) result: Result<RenderedResponse, String>,
    }

    impl StubRenderer {
        pub(crate) fn ok(response: RenderedResponse) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                result: Ok(response),
            })
        }

        pub(crate) fn failing(reason: &str) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                result: Err(reason.to_string()),
            })
        }
    }

    #[async_trait]
    impl Renderer for StubRenderer {
        async fn render(&self, request: RenderRequest) -> Result<RenderedResponse, FabError> {
            self.seen.lock().unwrap().push(request);
            self.result.clone().map_err(FabError::render)
        }
    }

    struct NeverRenderer;

    #[async_trait]
    impl Renderer for NeverRenderer {
        async fn render(&self, _request: RenderRequest) -> Result<RenderedResponse, FabError> {
            std::future::pending().await
        }
    }

    pub(crate) fn bundle() -> Arc<Bundle> {
        Arc::new(
            Bundle::from_files([
                ("/server.js", &b"module.exports = {}"[..]),
                ("/_assets/logo.png", &[0x89, b'P', b'N', b'G'][..]),
                ("/_assets/app.js", &b"console.log(1)"[..]),
                ("/_assets/blob", &b"???"[..]),
            ])
            .unwrap(),
        )
    }

    fn hello() -> RenderedResponse {
        RenderedResponse {
            status: 200,
            headers: vec![("content-type".into(), "text/plain".into())],
            body: b"hello".to_vec(),
        }
    }

    async fn body_bytes(response: Response<Body>) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("/_assets/logo.png"), "image/png");
        assert_eq!(content_type_for("/_assets/site.css"), "text/css; charset=utf-8");
        assert_eq!(content_type_for("/_assets/data.json"), "application/json; charset=utf-8");
        assert_eq!(content_type_for("/_assets/blob"), DEFAULT_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_asset_served_from_bundle() {
        let renderer = StubRenderer::ok(hello());
        let bridge = RequestBridge::new(bundle(), renderer.clone(), BridgeConfig::default());

        let request = axum::http::Request::get("/_assets/logo.png").body(Body::empty()).unwrap();
        let response = bridge.handle(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
        assert_eq!(response.headers()[CACHE_CONTROL], "immutable");
        assert_eq!(body_bytes(response).await, vec![0x89, b'P', b'N', b'G']);
        assert!(renderer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_asset_is_not_found() {
        let bridge = RequestBridge::new(bundle(), StubRenderer::ok(hello()), BridgeConfig::default());

        let request = axum::http::Request::get("/_assets/missing.png").body(Body::empty()).unwrap();
        let err = bridge.handle(request).await.unwrap_err();

        assert!(matches!(err, FabError::AssetNotFound { ref path } if path == "/_assets/missing.png"));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_reaches_render_without_body() {
        let renderer = StubRenderer::ok(hello());
        let bridge = RequestBridge::new(bundle(), renderer.clone(), BridgeConfig::default());

        let request = axum::http::Request::get("/blog/post?id=7")
            .header(HOST, "example.test:8080")
            .header("accept", "text/html")
            .body(Body::empty())
            .unwrap();
        let response = bridge.handle(request).await.unwrap();
        assert_eq!(body_bytes(response).await, b"hello");

        let seen = renderer.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, "GET");
        assert_eq!(seen[0].url, "http://example.test:8080/blog/post?id=7");
        assert_eq!(seen[0].body, None);
        assert!(seen[0]
            .headers
            .contains(&("accept".to_string(), "text/html".to_string())));
    }

    #[tokio::test]
    async fn test_post_body_is_forwarded() {
        let renderer = StubRenderer::ok(hello());
        let bridge = RequestBridge::new(
            bundle(),
            renderer.clone(),
            BridgeConfig::default().with_scheme("https"),
        );

        let request = axum::http::Request::post("/submit")
            .header(HOST, "example.test")
            .body(Body::from("name=fab"))
            .unwrap();
        bridge.handle(request).await.unwrap();

        let seen = renderer.seen.lock().unwrap();
        assert_eq!(seen[0].url, "https://example.test/submit");
        assert_eq!(seen[0].body.as_deref(), Some(&b"name=fab"[..]));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let renderer = StubRenderer::ok(hello());
        let bridge = RequestBridge::new(
            bundle(),
            renderer.clone(),
            BridgeConfig::default().with_max_body_bytes(4),
        );

        let request = axum::http::Request::post("/submit")
            .header(CONTENT_LENGTH, "9")
            .body(Body::from("too large"))
            .unwrap();
        let err = bridge.handle(request).await.unwrap_err();

        assert!(matches!(err, FabError::PayloadTooLarge { limit: 4 }));

        // No declared length: the limit is hit while buffering
        let request = axum::http::Request::post("/submit")
            .body(Body::from("too large"))
            .unwrap();
        let err = bridge.handle(request).await.unwrap_err();

        assert!(matches!(err, FabError::PayloadTooLarge { limit: 4 }));
        assert!(renderer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_render_failure_is_render_error() {
        let bridge = RequestBridge::new(bundle(), StubRenderer::failing("boom"), BridgeConfig::default());

        let request = axum::http::Request::get("/").body(Body::empty()).unwrap();
        let err = bridge.handle(request).await.unwrap_err();

        assert!(matches!(err, FabError::Render { ref reason } if reason == "boom"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_render_timeout() {
        let bridge = RequestBridge::new(
            bundle(),
            Arc::new(NeverRenderer),
            BridgeConfig::default().with_render_timeout(Some(Duration::from_millis(20))),
        );

        let request = axum::http::Request::get("/slow").body(Body::empty()).unwrap();
        let err = bridge.handle(request).await.unwrap_err();

        assert!(matches!(err, FabError::RenderTimeout { duration_ms: 20 }));
    }

    #[tokio::test]
    async fn test_response_headers_translated() {
        let rendered = RenderedResponse {
            status: 201,
            headers: vec![
                ("content-type".into(), "text/html".into()),
                ("content-encoding".into(), "gzip".into()),
                ("content-length".into(), "999".into()),
                ("set-cookie".into(), "a=1".into()),
                ("set-cookie".into(), "b=2".into()),
                ("x-custom".into(), "yes".into()),
            ],
            body: b"<p>hi</p>".to_vec(),
        };
        let response = into_http_response(rendered).unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get(CONTENT_ENCODING).is_none());
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(response.headers()["x-custom"], "yes");
        let cookies: Vec<_> = response.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(body_bytes(response).await, b"<p>hi</p>");
    }

    #[test]
    fn test_invalid_response_shape() {
        let bad_status = RenderedResponse {
            status: 1000,
            ..Default::default()
        };
        assert!(matches!(
            into_http_response(bad_status),
            Err(FabError::Render { .. })
        ));

        let bad_header = RenderedResponse {
            status: 200,
            headers: vec![("bad header".into(), "x".into())],
            body: vec![],
        };
        assert!(matches!(
            into_http_response(bad_header),
            Err(FabError::Render { .. })
        ));
    }
}
