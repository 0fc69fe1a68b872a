//! HTTP front door: accepts OpenAI chat-completions and native Messages
//! requests, attaches the OAuth bearer token and forwards them upstream.

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{ApiSettings, Settings, ThinkingSettings};
use crate::error::{UpstreamError, error_envelope};
use crate::oauth::OAuthClient;
use crate::sanitize::sanitize_request;
use crate::translate::stream::relay_event_stream;
use crate::translate::{
    ChatCompletionRequest, MessagesResponse, StreamTranslator, chat_to_native,
    max_tokens_or_default, native_to_chat, translate_event_stream, unix_secs,
};

/// Betas every OAuth-authenticated call needs, sent ahead of any others.
pub const REQUIRED_BETAS: &[&str] = &[
    "claude-code-20250219",
    "oauth-2025-04-20",
    "fine-grained-tool-streaming-2025-05-14",
];

const ANTHROPIC_BETA: &str = "anthropic-beta";
const ANTHROPIC_VERSION: &str = "anthropic-version";

/// Shared state for the proxy server
pub struct ProxyState {
    pub oauth: Arc<OAuthClient>,
    pub client: reqwest::Client,
    pub messages_url: String,
    pub api: ApiSettings,
    pub thinking: ThinkingSettings,
}

impl ProxyState {
    pub fn new(settings: &Settings, oauth: Arc<OAuthClient>) -> Result<Self> {
        // No total timeout: a long stream is fine as long as bytes keep coming.
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .read_timeout(settings.request_timeout())
            .build()
            .context("Failed to build upstream HTTP client")?;
        Ok(Self::with_http_client(settings, oauth, client))
    }

    pub fn with_http_client(
        settings: &Settings,
        oauth: Arc<OAuthClient>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            oauth,
            client,
            messages_url: format!(
                "{}/v1/messages?beta=true",
                settings.api.base_url.trim_end_matches('/')
            ),
            api: settings.api.clone(),
            thinking: settings.thinking.clone(),
        }
    }
}

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/auth/status", get(auth_status_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/messages", post(messages_handler))
        .fallback(fallback_handler)
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Start the proxy server and run until Ctrl-C.
pub async fn start_server(settings: &Settings, oauth: Arc<OAuthClient>) -> Result<()> {
    let state = Arc::new(ProxyState::new(settings, oauth)?);
    let app = router(state);

    let addr = format!(
        "{}:{}",
        settings.server.bind_address, settings.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Proxy listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Proxy server failed")?;

    info!("Proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn log_requests(req: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    let span = info_span!(
        "request",
        id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    let started = Instant::now();

    async move {
        let response = next.run(req).await;
        info!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "handled"
        );
        response
    }
    .instrument(span)
    .await
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": unix_secs() }))
}

async fn auth_status_handler(State(state): State<Arc<ProxyState>>) -> Response {
    Json(state.oauth.store().status()).into_response()
}

async fn fallback_handler(req: Request) -> Response {
    let message = format!("No route for {} {}", req.method(), req.uri().path());
    (
        StatusCode::NOT_FOUND,
        Json(error_envelope("not_found_error", &message)),
    )
        .into_response()
}

/// OpenAI-compatible endpoint: translate, forward, translate back.
async fn chat_completions_handler(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_chat_request(&state, &headers, &body)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn handle_chat_request(
    state: &ProxyState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, UpstreamError> {
    let request: ChatCompletionRequest = serde_json::from_slice(body)
        .map_err(|e| UpstreamError::InvalidRequest(format!("Invalid JSON body: {}", e)))?;

    let native = chat_to_native(&request, &state.api.default_model);
    let model = native.model.clone();
    let is_streaming = native.stream;

    let mut payload = match serde_json::to_value(&native) {
        Ok(Value::Object(map)) => map,
        _ => {
            return Err(UpstreamError::InvalidRequest(
                "Request could not be translated".to_string(),
            ));
        }
    };
    sanitize_request(&mut payload);

    let response = forward(state, &payload, client_betas(headers), is_streaming).await?;

    if is_streaming {
        let translator = StreamTranslator::new(model, request.include_usage());
        return Ok(sse_response(Body::from_stream(translate_event_stream(
            response.bytes_stream(),
            translator,
        ))));
    }

    let native_response: MessagesResponse = response
        .json()
        .await
        .map_err(|e| UpstreamError::InvalidResponse(format!("Parse error: {}", e)))?;
    Ok(Json(native_to_chat(&native_response, &model)).into_response())
}

/// Native Messages endpoint: sanitize and pass through.
async fn messages_handler(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_native_request(&state, &headers, &body)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn handle_native_request(
    state: &ProxyState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, UpstreamError> {
    let mut payload: Map<String, Value> = serde_json::from_slice(body)
        .map_err(|e| UpstreamError::InvalidRequest(format!("Invalid JSON body: {}", e)))?;

    if !payload.get("model").is_some_and(Value::is_string) {
        return Err(UpstreamError::InvalidRequest(
            "Missing required field: model".to_string(),
        ));
    }
    if !payload.get("messages").is_some_and(Value::is_array) {
        return Err(UpstreamError::InvalidRequest(
            "Missing required field: messages".to_string(),
        ));
    }

    let max_tokens = max_tokens_or_default(payload.get("max_tokens"));
    payload.insert("max_tokens".to_string(), Value::from(max_tokens));

    if state.thinking.force_enabled && payload.get("thinking").is_none_or(Value::is_null) {
        debug!(
            "Enabling thinking with budget {}",
            state.thinking.default_budget
        );
        payload.insert(
            "thinking".to_string(),
            json!({ "type": "enabled", "budget_tokens": state.thinking.default_budget }),
        );
    }
    sanitize_request(&mut payload);

    let is_streaming = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let response = forward(state, &payload, client_betas(headers), is_streaming).await?;

    if is_streaming {
        return Ok(sse_response(Body::from_stream(relay_event_stream(
            response.bytes_stream(),
        ))));
    }

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| UpstreamError::Transport(format!("Failed to read upstream body: {}", e)))?;
    Ok((
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        bytes,
    )
        .into_response())
}

fn client_betas(headers: &HeaderMap) -> Option<&str> {
    headers.get(ANTHROPIC_BETA).and_then(|v| v.to_str().ok())
}

/// Required betas first, then configured and client-supplied ones, each flag
/// kept once in first-seen order.
pub fn merge_betas(configured: Option<&str>, client: Option<&str>) -> String {
    let mut merged: Vec<&str> = Vec::new();
    let extra = [configured, client]
        .into_iter()
        .flatten()
        .flat_map(|list| list.split(','));
    for beta in REQUIRED_BETAS.iter().copied().chain(extra) {
        let beta = beta.trim();
        if !beta.is_empty() && !merged.contains(&beta) {
            merged.push(beta);
        }
    }
    merged.join(",")
}

/// Send with the current token; on a 401, refresh once and retry once.
async fn forward(
    state: &ProxyState,
    payload: &Map<String, Value>,
    client_betas: Option<&str>,
    is_streaming: bool,
) -> Result<reqwest::Response, UpstreamError> {
    let token = state
        .oauth
        .valid_token()
        .await
        .ok_or(UpstreamError::Unauthenticated)?;
    let betas = merge_betas(state.api.beta.as_deref(), client_betas);

    let response = send_upstream(state, payload, &token, &betas, is_streaming).await?;
    if response.status() != StatusCode::UNAUTHORIZED {
        return ensure_success(response).await;
    }

    warn!("Upstream rejected the access token, refreshing");
    let Some(token) = state.oauth.refresh_after_rejection(&token).await else {
        error!("Token refresh failed after upstream rejection");
        return Err(UpstreamError::Unauthenticated);
    };

    let response = send_upstream(state, payload, &token, &betas, is_streaming).await?;
    if response.status() == StatusCode::UNAUTHORIZED {
        error!("Upstream rejected the refreshed token");
        return Err(UpstreamError::Unauthenticated);
    }
    ensure_success(response).await
}

async fn send_upstream(
    state: &ProxyState,
    payload: &Map<String, Value>,
    token: &str,
    betas: &str,
    is_streaming: bool,
) -> Result<reqwest::Response, UpstreamError> {
    let accept = if is_streaming {
        "text/event-stream"
    } else {
        "application/json"
    };
    debug!(url = %state.messages_url, stream = is_streaming, "forwarding upstream");

    state
        .client
        .post(&state.messages_url)
        .bearer_auth(token)
        .header(ANTHROPIC_VERSION, &state.api.version)
        .header(ANTHROPIC_BETA, betas)
        .header(header::ACCEPT, accept)
        .json(payload)
        .send()
        .await
        .map_err(|e| UpstreamError::Transport(format!("Failed to connect to upstream: {}", e)))
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), "Upstream returned an error");
    Err(UpstreamError::from_status(status, &body))
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthSettings;
    use crate::oauth::OAuthEndpoints;
    use crate::storage::TokenStore;
    use axum::body::to_bytes;
    use std::path::Path;
    use tower::ServiceExt;
    use wiremock::matchers::{body_partial_json, header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings_for(server_uri: &str, dir: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.api.base_url = server_uri.to_string();
        settings.api.default_model = "claude-default".to_string();
        settings.oauth = OAuthSettings {
            token_base: server_uri.to_string(),
            token_file: dir.join("tokens.json"),
            ..OAuthSettings::default()
        };
        settings
    }

    fn app_for(settings: &Settings, dir: &Path) -> (Router, Arc<OAuthClient>) {
        let store = TokenStore::new(settings.oauth.token_file.clone());
        let oauth = Arc::new(OAuthClient::new(
            OAuthEndpoints::from_settings(&settings.oauth),
            store,
            dir.join("pkce.json"),
        )
        .unwrap());
        let state = ProxyState::new(settings, oauth.clone()).unwrap();
        (router(Arc::new(state)), oauth)
    }

    fn post_json(uri: &str, body: Value) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    fn native_reply() -> Value {
        json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "Hello there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 2}
        })
    }

    #[test]
    fn betas_are_merged_required_first_without_duplicates() {
        assert_eq!(merge_betas(None, None), REQUIRED_BETAS.join(","));
        assert_eq!(
            merge_betas(Some("x-beta, oauth-2025-04-20"), Some("y-beta,x-beta,")),
            format!("{},x-beta,y-beta", REQUIRED_BETAS.join(","))
        );
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for("http://127.0.0.1:9", dir.path());
        let (app, _) = app_for(&settings, dir.path());

        let response = app.oneshot(get_req("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert!(body["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn auth_status_never_exposes_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for("http://127.0.0.1:9", dir.path());
        let (app, oauth) = app_for(&settings, dir.path());
        oauth.store().save("secret-access", "secret-refresh", 3600).unwrap();

        let response = app.oneshot(get_req("/auth/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(!text.contains("secret-access"));
        assert!(!text.contains("secret-refresh"));
        let body: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["present"], true);
        assert_eq!(body["expired"], false);
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for("http://127.0.0.1:9", dir.path());
        let (app, _) = app_for(&settings, dir.path());

        let response = app.oneshot(get_req("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_json(response).await["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn missing_tokens_yield_401_without_calling_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(native_reply()))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server.uri(), dir.path());
        let (app, _) = app_for(&settings, dir.path());

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "authentication_error");
    }

    #[tokio::test]
    async fn invalid_json_is_rejected_with_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for("http://127.0.0.1:9", dir.path());
        let (app, _) = app_for(&settings, dir.path());

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["error"]["type"],
            "invalid_request_error"
        );
    }

    #[tokio::test]
    async fn chat_completion_is_translated_both_ways() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(query_param("beta", "true"))
            .and(header_eq("authorization", "Bearer at-1"))
            .and(header_eq("anthropic-version", "2023-06-01"))
            .and(body_partial_json(json!({
                "model": "claude-default",
                "max_tokens": 4096,
                "system": "S",
                "messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(native_reply()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server.uri(), dir.path());
        let (app, oauth) = app_for(&settings, dir.path());
        oauth.store().save("at-1", "rt-1", 3600).unwrap();

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({
                    "max_tokens": "lots",
                    "messages": [
                        {"role": "system", "content": "S"},
                        {"role": "user", "content": "hi"}
                    ]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "claude-default");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello there");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["total_tokens"], 7);
    }

    #[tokio::test]
    async fn upstream_401_triggers_one_refresh_and_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header_eq("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": {}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header_eq("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(native_reply()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .and(body_partial_json(json!({"grant_type": "refresh_token", "refresh_token": "rt-old"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "refresh_token": "rt-new",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server.uri(), dir.path());
        let (app, oauth) = app_for(&settings, dir.path());
        oauth.store().save("stale", "rt-old", 3600).unwrap();

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(oauth.store().refresh_token().as_deref(), Some("rt-new"));
    }

    #[tokio::test]
    async fn failed_refresh_after_401_asks_to_reauthenticate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server.uri(), dir.path());
        let (app, oauth) = app_for(&settings, dir.path());
        oauth.store().save("stale", "rt-old", 3600).unwrap();

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await["error"]["type"],
            "authentication_error"
        );
    }

    #[tokio::test]
    async fn rate_limit_passes_through_without_retry() {
        let server = MockServer::start().await;
        let upstream_body = json!({"type": "error", "error": {"type": "rate_limit_error", "message": "slow down"}});
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429).set_body_json(upstream_body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server.uri(), dir.path());
        let (app, oauth) = app_for(&settings, dir.path());
        oauth.store().save("at", "rt", 3600).unwrap();

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_json(response).await, upstream_body);
    }

    #[tokio::test]
    async fn non_json_server_error_is_wrapped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server.uri(), dir.path());
        let (app, oauth) = app_for(&settings, dir.path());
        oauth.store().save("at", "rt", 3600).unwrap();

        let response = app
            .oneshot(post_json(
                "/v1/messages",
                json!({"model": "m", "messages": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            body_json(response).await,
            json!({"error": {"type": "api_error", "message": "bad gateway"}})
        );
    }

    #[tokio::test]
    async fn streaming_chat_is_reframed() {
        let server = MockServer::start().await;
        let upstream = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":4,\"output_tokens\":1}}}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":3}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header_eq("accept", "text/event-stream"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(upstream),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server.uri(), dir.path());
        let (app, oauth) = app_for(&settings, dir.path());
        oauth.store().save("at", "rt", 3600).unwrap();

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({
                    "model": "m",
                    "stream": true,
                    "stream_options": {"include_usage": true},
                    "messages": [{"role": "user", "content": "hi"}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

        let text = body_text(response).await;
        assert!(text.contains("\"role\":\"assistant\""));
        assert!(text.contains("\"content\":\"Hi\""));
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.contains("\"total_tokens\":7"));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn streaming_request_keeps_upstream_error_status() {
        let server = MockServer::start().await;
        let upstream_body = json!({"type": "error", "error": {"type": "rate_limit_error", "message": "slow down"}});
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(429).set_body_json(upstream_body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server.uri(), dir.path());
        let (app, oauth) = app_for(&settings, dir.path());
        oauth.store().save("at", "rt", 3600).unwrap();

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"stream": true, "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_ne!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(body_json(response).await, upstream_body);
    }

    #[tokio::test]
    async fn native_streaming_server_error_is_not_wrapped_in_sse() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server.uri(), dir.path());
        let (app, oauth) = app_for(&settings, dir.path());
        oauth.store().save("at", "rt", 3600).unwrap();

        let response = app
            .oneshot(post_json(
                "/v1/messages",
                json!({"model": "m", "stream": true, "messages": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_json(response).await,
            json!({"error": {"type": "api_error", "message": "overloaded"}})
        );
    }

    #[tokio::test]
    async fn native_stream_is_relayed_unchanged() {
        let server = MockServer::start().await;
        let upstream = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":4}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"h\u{e9}llo\"}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header_eq("accept", "text/event-stream"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(upstream),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server.uri(), dir.path());
        let (app, oauth) = app_for(&settings, dir.path());
        oauth.store().save("at", "rt", 3600).unwrap();

        let response = app
            .oneshot(post_json(
                "/v1/messages",
                json!({"model": "m", "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(body_text(response).await, upstream);
    }

    #[tokio::test]
    async fn native_messages_are_sanitized_and_passed_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({
                "model": "m",
                "max_tokens": 17024,
                "temperature": 1.0,
                "thinking": {"type": "enabled", "budget_tokens": 16000}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(native_reply()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server.uri(), dir.path());
        let (app, oauth) = app_for(&settings, dir.path());
        oauth.store().save("at", "rt", 3600).unwrap();

        let response = app
            .oneshot(post_json(
                "/v1/messages",
                json!({
                    "model": "m",
                    "max_tokens": 2000,
                    "temperature": 0.2,
                    "top_k": 5,
                    "thinking": {"type": "enabled", "budget_tokens": 16000},
                    "messages": [{"role": "user", "content": "hi"}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, native_reply());
    }

    #[tokio::test]
    async fn native_request_without_model_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for("http://127.0.0.1:9", dir.path());
        let (app, _) = app_for(&settings, dir.path());

        let response = app
            .oneshot(post_json("/v1/messages", json!({"messages": []})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn forced_thinking_is_injected_into_native_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({
                "thinking": {"type": "enabled", "budget_tokens": 2048},
                "max_tokens": 3072
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(native_reply()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(&server.uri(), dir.path());
        settings.thinking.force_enabled = true;
        settings.thinking.default_budget = 2048;
        let (app, oauth) = app_for(&settings, dir.path());
        oauth.store().save("at", "rt", 3600).unwrap();

        let response = app
            .oneshot(post_json(
                "/v1/messages",
                json!({"model": "m", "max_tokens": 100, "messages": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
