//! Request Router: the HTTP front-end. Alias resolution, spawn-on-demand,
//! streaming reverse proxy, token-ledger writes. Grounded on the teacher's
//! `api_proxy_server/{server,router,registry}.rs` streaming-proxy pattern,
//! generalized from a fixed `/chat/completions` route to the specified
//! alias-addressed catch-all.

pub mod token_extract;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use futures_util::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tower_http::cors::CorsLayer;

use crate::config::ConfigManager;
use crate::controller::ModelController;
use crate::errors::{OrchestratorError, Result};
use crate::ledger::{LedgerStore, RequestRecord};

/// Chunks captured from a streaming upstream response are bounded to this
/// many bytes before the token extractor stops accumulating them.
const MAX_STREAM_CAPTURE_BYTES: usize = 64 * 1024 * 1024;
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const UPSTREAM_READ_TIMEOUT: Duration = Duration::from_secs(600);

const HOP_BY_HOP_HEADERS: &[&str] = &["host", "content-length", "transfer-encoding", "connection"];

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigManager>,
    pub controller: Arc<ModelController>,
    pub ledger: Arc<LedgerStore>,
    pub upstream_client: reqwest::Client,
}

impl AppState {
    pub fn new(config: Arc<ConfigManager>, controller: Arc<ModelController>, ledger: Arc<LedgerStore>) -> Self {
        let upstream_client = reqwest::Client::builder()
            .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
            .timeout(UPSTREAM_READ_TIMEOUT)
            .build()
            .expect("building the upstream reqwest client cannot fail with this configuration");
        Self { config, controller, ledger, upstream_client }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/models", get(list_models).fallback(proxy))
        .route("/{*path}", any(proxy))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let now = now_secs() as i64;
    let models: Vec<serde_json::Value> = state
        .config
        .all_model_configs()
        .into_iter()
        .map(|c| {
            serde_json::json!({
                "id": c.primary_name(),
                "object": "model",
                "created": now,
                "owned_by": "local",
                "aliases": c.aliases,
                "mode": format!("{:?}", c.mode),
            })
        })
        .collect();
    Json(serde_json::json!({ "object": "list", "data": models }))
}

/// Decrements the pending-request counter exactly once, however the proxy
/// pipeline exits (success, error, or the task being dropped on client
/// cancellation). Grounded on the specification's "scoped resource
/// acquisition with guaranteed release" design note.
struct PendingGuard {
    controller: Arc<ModelController>,
    primary_name: String,
    released: bool,
}

impl PendingGuard {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let controller = self.controller.clone();
        let primary_name = self.primary_name.clone();
        tokio::spawn(async move {
            let _ = controller.mark_request_completed(&primary_name).await;
        });
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.release();
    }
}

async fn proxy(State(state): State<AppState>, req: Request) -> Response {
    if req.method() == Method::OPTIONS {
        return options_response();
    }
    match proxy_inner(state, req).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

fn options_response() -> Response {
    (StatusCode::NO_CONTENT, ()).into_response()
}

async fn proxy_inner(state: AppState, req: Request) -> Result<Response> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().trim_start_matches('/').to_string();
    let query = uri.query().map(|q| q.to_string());
    let headers = req.headers().clone();

    let body_bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| OrchestratorError::BadRequest(format!("reading request body: {e}")))?;

    let model_alias = extract_model_alias(&headers, &body_bytes)?;
    let primary_name = state
        .config
        .resolve_primary_name(&model_alias)
        .ok_or_else(|| OrchestratorError::NotFound(format!("unknown model alias '{model_alias}'")))?;

    let model_config = state
        .config
        .model_config(&primary_name)
        .ok_or_else(|| OrchestratorError::NotFound(format!("unknown model '{primary_name}'")))?;

    let interface = crate::interfaces::ModeInterface::new(model_config.mode);
    interface.validate_request(&path).map_err(OrchestratorError::BadRequest)?;

    state.controller.increment_pending(&primary_name).await?;
    let mut guard = PendingGuard { controller: state.controller.clone(), primary_name: primary_name.clone(), released: false };

    if let Err(e) = state.controller.start_model(&primary_name).await {
        guard.release();
        return Err(OrchestratorError::Unavailable(e.to_string()));
    }

    let mut target = format!("http://127.0.0.1:{}/{}", model_config.port, path);
    if let Some(q) = &query {
        target.push('?');
        target.push_str(q);
    }

    let mut outbound_headers = HeaderMap::new();
    for (name, value) in headers.iter() {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()) {
            continue;
        }
        outbound_headers.insert(name.clone(), value.clone());
    }

    let upstream_result = state
        .upstream_client
        .request(method, &target)
        .headers(outbound_headers)
        .body(body_bytes)
        .send()
        .await;

    let upstream_response = match upstream_result {
        Ok(resp) => resp,
        Err(e) => {
            // The controller believed this model was routing; a connect
            // failure means the backend died without the liveness sweep
            // having caught it yet. Re-admit the next request by marking
            // it stopped now.
            let _ = state.controller.stop_model(&primary_name).await;
            guard.release();
            return Err(OrchestratorError::UpstreamDown(e.to_string()));
        }
    };

    let status = upstream_response.status();
    let response_headers = upstream_response.headers().clone();
    let is_streaming = response_headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false);

    if is_streaming {
        Ok(stream_response(state, primary_name, status, response_headers, upstream_response, guard))
    } else {
        let body = upstream_response
            .bytes()
            .await
            .map_err(|e| OrchestratorError::UpstreamDown(e.to_string()))?;
        guard.release();

        let counts = token_extract::extract(&body);
        if counts != token_extract::TokenCounts::default() {
            spawn_ledger_write(state.ledger.clone(), primary_name, counts);
        }

        let mut builder = Response::builder().status(status);
        for (name, value) in response_headers.iter() {
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from(body))
            .map_err(|e| OrchestratorError::Internal(format!("building response: {e}")))
    }
}

fn stream_response(
    state: AppState,
    primary_name: String,
    status: reqwest::StatusCode,
    headers: reqwest::header::HeaderMap,
    upstream_response: reqwest::Response,
    guard: PendingGuard,
) -> Response {
    let accumulated = Arc::new(AsyncMutex::new(Vec::<u8>::new()));
    let acc_for_stream = accumulated.clone();
    let ledger = state.ledger.clone();

    let byte_stream = upstream_response.bytes_stream();
    let tee = async_stream::stream! {
        // `_guard` keeps the pending-request counter incremented for the
        // lifetime of the streamed response; it releases on every exit
        // path (end of stream, error, or this generator being dropped).
        let _guard = guard;
        let mut captured = 0usize;
        futures_util::pin_mut!(byte_stream);
        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if captured < MAX_STREAM_CAPTURE_BYTES {
                        let mut buf = acc_for_stream.lock().await;
                        let remaining = MAX_STREAM_CAPTURE_BYTES - captured;
                        let take = remaining.min(bytes.len());
                        buf.extend_from_slice(&bytes[..take]);
                        captured += take;
                    }
                    yield Ok::<Bytes, std::io::Error>(bytes);
                }
                Err(e) => {
                    yield Err(std::io::Error::new(std::io::ErrorKind::Other, e));
                    break;
                }
            }
        }

        let captured_bytes = acc_for_stream.lock().await.clone();
        let counts = token_extract::extract(&captured_bytes);
        if counts != token_extract::TokenCounts::default() {
            spawn_ledger_write(ledger, primary_name, counts);
        }
    };

    let mut builder = Response::builder().status(axum_status(status));
    for (name, value) in headers.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from_stream(tee))
        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "failed to build streaming response").into_response())
}

fn axum_status(status: reqwest::StatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn spawn_ledger_write(ledger: Arc<LedgerStore>, primary_name: String, counts: token_extract::TokenCounts) {
    tokio::spawn(async move {
        let now = now_secs();
        let record = RequestRecord {
            start_time: now,
            end_time: now,
            input_tokens: counts.input_tokens,
            output_tokens: counts.output_tokens,
            cache_n: counts.cache_n,
            prompt_n: counts.prompt_n,
        };
        if let Err(e) = ledger.add_model_request(&primary_name, &record).await {
            tracing::warn!(model = %primary_name, error = %e, "ledger write failed, dropping");
        }
    });
}

fn extract_model_alias(headers: &HeaderMap, body: &[u8]) -> Result<String> {
    let is_json = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);

    if is_json {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| OrchestratorError::BadRequest(format!("invalid JSON body: {e}")))?;
        return value
            .get("model")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| OrchestratorError::BadRequest("missing 'model' field".to_string()));
    }

    Err(OrchestratorError::BadRequest("missing 'model' field".to_string()))
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_model_from_json_body() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = br#"{"model":"chat-a","messages":[]}"#;
        assert_eq!(extract_model_alias(&headers, body).unwrap(), "chat-a");
    }

    #[test]
    fn missing_model_field_is_bad_request() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = br#"{"messages":[]}"#;
        assert!(extract_model_alias(&headers, body).is_err());
    }
}
