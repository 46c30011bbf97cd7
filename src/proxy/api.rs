//! Client-facing HTTP surface
//!
//! Codex-native routes (`/backend-api/codex/...`), the OpenAI-compatible
//! `/v1` routes, and the usage status endpoint. Every proxy response carries
//! the pooled usage headers and mirrors the request id.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::openai::chat::{
    chat_chunk_stream, collect_chat_completion, ChatCompletionOutcome, ChatCompletionsRequest,
};
use crate::openai::requests::{ClientPayloadError, ResponsesCompactRequest, ResponsesRequest};
use crate::upstream::sse::extract_data;
use crate::upstream::ProxyResponseError;
use crate::usage::pricing::priced_model_ids;
use crate::AppState;

/// Testing-only escape hatch: route to one specific account.
const FORCE_ACCOUNT_HEADER: &str = "x-codex-lb-force-account-id";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/backend-api/codex/responses", post(backend_responses))
        .route("/backend-api/codex/responses/compact", post(responses_compact))
        .route("/v1/responses", post(v1_responses))
        .route("/v1/responses/compact", post(responses_compact))
        .route("/v1/chat/completions", post(v1_chat_completions))
        .route("/v1/models", get(v1_models))
        .route("/api/codex/usage", get(codex_usage))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Codex-native endpoint: always an SSE stream.
async fn backend_responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let request_id = ensure_request_id(&headers);
    let mut payload = match ResponsesRequest::from_value(body) {
        Ok(payload) => payload,
        Err(error) => return payload_error_response(&error, &request_id),
    };
    payload.set_stream(true);
    respond_streaming(&state, payload, headers, request_id).await
}

/// OpenAI-compatible endpoint: SSE when `stream`, JSON otherwise.
async fn v1_responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let request_id = ensure_request_id(&headers);
    let mut payload = match ResponsesRequest::from_value(body) {
        Ok(payload) => payload,
        Err(error) => return payload_error_response(&error, &request_id),
    };
    let wants_stream = payload.stream();
    payload.set_stream(true);
    if wants_stream {
        respond_streaming(&state, payload, headers, request_id).await
    } else {
        respond_collected(&state, payload, headers, request_id).await
    }
}

async fn responses_compact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let request_id = ensure_request_id(&headers);
    let payload = match ResponsesCompactRequest::from_value(body) {
        Ok(payload) => payload,
        Err(error) => return payload_error_response(&error, &request_id),
    };
    let rate_headers = state.status.rate_limit_headers().await.unwrap_or_default();
    match state
        .service
        .compact_responses(payload, header_map(&headers), request_id.clone())
        .await
    {
        Ok(result) => {
            json_response(StatusCode::OK, &result, &rate_headers, &request_id)
        }
        Err(error) => json_response(
            StatusCode::from_u16(error.status).unwrap_or(StatusCode::BAD_GATEWAY),
            &error.payload,
            &rate_headers,
            &request_id,
        ),
    }
}

async fn v1_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let request_id = ensure_request_id(&headers);
    let rate_headers = state.status.rate_limit_headers().await.unwrap_or_default();

    let chat: ChatCompletionsRequest = match serde_json::from_value(body) {
        Ok(chat) => chat,
        Err(error) => {
            let envelope = json!({
                "error": {
                    "message": format!("Invalid request payload: {error}"),
                    "type": "invalid_request_error",
                    "code": "invalid_request_error",
                }
            });
            return json_response(StatusCode::BAD_REQUEST, &envelope, &rate_headers, &request_id);
        }
    };
    let mut payload = match chat.to_responses_request() {
        Ok(payload) => payload,
        Err(error) => return payload_error_response(&error, &request_id),
    };
    payload.set_stream(true);

    let forced = forced_account_id(&headers);
    let stream = state.service.stream_responses(
        payload,
        header_map(&headers),
        request_id.clone(),
        true,
        forced,
    );
    let mut stream = Box::pin(stream);
    let first = match stream.next().await {
        Some(Err(error)) => {
            return json_response(
                StatusCode::from_u16(error.status).unwrap_or(StatusCode::BAD_GATEWAY),
                &error.payload,
                &rate_headers,
                &request_id,
            );
        }
        first => first,
    };
    let full = futures::stream::iter(first).chain(stream);

    if chat.stream.unwrap_or(false) {
        let chunks = chat_chunk_stream(
            full,
            request_id.clone(),
            chat.model.clone(),
            chat.include_usage(),
        );
        return sse_response(chunks, &rate_headers, &request_id);
    }

    match collect_chat_completion(full, &request_id, &chat.model).await {
        Ok(ChatCompletionOutcome::Completed(payload)) => {
            json_response(StatusCode::OK, &payload, &rate_headers, &request_id)
        }
        Ok(ChatCompletionOutcome::Failed { envelope, code }) => {
            let status = if code.as_deref() == Some("no_accounts") {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::BAD_GATEWAY
            };
            json_response(status, &envelope, &rate_headers, &request_id)
        }
        Err(error) => json_response(
            StatusCode::from_u16(error.status).unwrap_or(StatusCode::BAD_GATEWAY),
            &error.payload,
            &rate_headers,
            &request_id,
        ),
    }
}

async fn v1_models() -> Json<Value> {
    let created = chrono::Utc::now().timestamp();
    let data: Vec<Value> = priced_model_ids()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "codex-lb",
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

async fn codex_usage(State(state): State<Arc<AppState>>) -> Response {
    match state.status.usage_status_payload().await {
        Ok(payload) => Json(payload).into_response(),
        Err(error) => {
            tracing::error!(%error, "Usage status failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": { "code": "internal_error", "message": "usage status failed" } })),
            )
                .into_response()
        }
    }
}

/// Stream the service's SSE blocks, downgrading a leading HTTP error to the
/// matching JSON response.
async fn respond_streaming(
    state: &AppState,
    payload: ResponsesRequest,
    headers: HeaderMap,
    request_id: String,
) -> Response {
    let rate_headers = state.status.rate_limit_headers().await.unwrap_or_default();
    let forced = forced_account_id(&headers);
    let stream = state.service.stream_responses(
        payload,
        header_map(&headers),
        request_id.clone(),
        true,
        forced,
    );
    let mut stream = Box::pin(stream);
    match stream.next().await {
        Some(Err(error)) => json_response(
            StatusCode::from_u16(error.status).unwrap_or(StatusCode::BAD_GATEWAY),
            &error.payload,
            &rate_headers,
            &request_id,
        ),
        first => {
            let full = futures::stream::iter(first).chain(stream);
            sse_response(full, &rate_headers, &request_id)
        }
    }
}

/// Drive the stream to completion and reply with one JSON body.
async fn respond_collected(
    state: &AppState,
    payload: ResponsesRequest,
    headers: HeaderMap,
    request_id: String,
) -> Response {
    let rate_headers = state.status.rate_limit_headers().await.unwrap_or_default();
    let forced = forced_account_id(&headers);
    let stream = state.service.stream_responses(
        payload,
        header_map(&headers),
        request_id.clone(),
        true,
        forced,
    );
    tokio::pin!(stream);

    while let Some(item) = stream.next().await {
        let block = match item {
            Ok(block) => block,
            Err(error) => {
                return json_response(
                    StatusCode::from_u16(error.status).unwrap_or(StatusCode::BAD_GATEWAY),
                    &error.payload,
                    &rate_headers,
                    &request_id,
                );
            }
        };
        let Some(data) = extract_data(&block) else { continue };
        let Ok(payload) = serde_json::from_str::<Value>(&data) else { continue };
        match payload.get("type").and_then(Value::as_str) {
            Some("error") => {
                let envelope = json!({ "error": payload.get("error").cloned().unwrap_or_default() });
                let status = status_for_error_envelope(&envelope);
                return json_response(status, &envelope, &rate_headers, &request_id);
            }
            Some("response.failed") => {
                let error = payload
                    .get("response")
                    .and_then(|response| response.get("error"))
                    .cloned()
                    .unwrap_or_else(|| {
                        json!({
                            "message": "Upstream error",
                            "type": "server_error",
                            "code": "upstream_error",
                        })
                    });
                let envelope = json!({ "error": error });
                let status = status_for_error_envelope(&envelope);
                return json_response(status, &envelope, &rate_headers, &request_id);
            }
            Some("response.completed") | Some("response.incomplete") => {
                let response = payload.get("response").cloned().unwrap_or_default();
                return json_response(StatusCode::OK, &response, &rate_headers, &request_id);
            }
            _ => {}
        }
    }

    let envelope = json!({
        "error": {
            "message": "Upstream error",
            "type": "server_error",
            "code": "upstream_error",
        }
    });
    json_response(StatusCode::BAD_GATEWAY, &envelope, &rate_headers, &request_id)
}

/// HTTP status for a normalized error code, per error kind.
fn status_for_error_envelope(envelope: &Value) -> StatusCode {
    let code = envelope
        .get("error")
        .and_then(|error| error.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("");
    if matches!(code, "no_accounts" | "all_blocked" | "all_deactivated") {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if crate::proxy::service::is_rate_limit_code(code) || crate::proxy::service::is_quota_code(code)
    {
        return StatusCode::TOO_MANY_REQUESTS;
    }
    if code.starts_with("auth_") || matches!(code, "invalid_api_key" | "invalid_auth") {
        return StatusCode::UNAUTHORIZED;
    }
    if code.starts_with("invalid_") || code == "missing_prompt_cache_key" {
        return StatusCode::BAD_REQUEST;
    }
    StatusCode::BAD_GATEWAY
}

fn payload_error_response(error: &ClientPayloadError, request_id: &str) -> Response {
    let mut detail = json!({
        "message": &error.message,
        "type": "invalid_request_error",
        "code": "invalid_request_error",
    });
    if let Some(param) = &error.param {
        detail["param"] = json!(param);
    }
    json_response(
        StatusCode::BAD_REQUEST,
        &json!({ "error": detail }),
        &HashMap::new(),
        request_id,
    )
}

fn sse_response(
    stream: impl Stream<Item = Result<String, ProxyResponseError>> + Send + 'static,
    rate_headers: &HashMap<String, String>,
    request_id: &str,
) -> Response {
    // HTTP-level errors are decided before the body starts; anything later
    // is already a terminal response.failed block.
    let body = Body::from_stream(
        stream.filter_map(|item| async move { item.ok().map(|block| Ok::<_, Infallible>(Bytes::from(block))) }),
    );
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    apply_extra_headers(response.headers_mut(), rate_headers, request_id);
    response
}

fn json_response(
    status: StatusCode,
    payload: &Value,
    rate_headers: &HashMap<String, String>,
    request_id: &str,
) -> Response {
    let mut response = (status, Json(payload.clone())).into_response();
    apply_extra_headers(response.headers_mut(), rate_headers, request_id);
    response
}

fn apply_extra_headers(
    headers: &mut HeaderMap,
    rate_headers: &HashMap<String, String>,
    request_id: &str,
) {
    for (key, value) in rate_headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", value);
    }
}

/// The caller's request id, or a fresh UUIDv4.
fn ensure_request_id(headers: &HeaderMap) -> String {
    for name in ["x-request-id", "request-id"] {
        if let Some(value) = headers.get(name).and_then(|value| value.to_str().ok()) {
            if !value.trim().is_empty() {
                return value.trim().to_string();
            }
        }
    }
    Uuid::new_v4().to_string()
}

fn forced_account_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(FORCE_ACCOUNT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_request_id_prefers_caller_value() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("req_42"));
        assert_eq!(ensure_request_id(&headers), "req_42");

        let mut headers = HeaderMap::new();
        headers.insert("request-id", HeaderValue::from_static("req_43"));
        assert_eq!(ensure_request_id(&headers), "req_43");

        let minted = ensure_request_id(&HeaderMap::new());
        assert!(Uuid::parse_str(&minted).is_ok());
    }

    #[test]
    fn test_status_for_error_envelope() {
        let envelope = |code: &str| json!({ "error": { "code": code } });
        assert_eq!(status_for_error_envelope(&envelope("no_accounts")), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for_error_envelope(&envelope("rate_limit_exceeded")), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for_error_envelope(&envelope("insufficient_quota")), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for_error_envelope(&envelope("invalid_request")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_error_envelope(&envelope("invalid_auth")), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for_error_envelope(&envelope("kaboom")), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_forced_account_id() {
        let mut headers = HeaderMap::new();
        headers.insert(FORCE_ACCOUNT_HEADER, HeaderValue::from_static(" acc_a "));
        assert_eq!(forced_account_id(&headers).as_deref(), Some("acc_a"));
        assert_eq!(forced_account_id(&HeaderMap::new()), None);
    }
}
