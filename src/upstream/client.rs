//! Upstream HTTP client
//!
//! Two entry points against the responses backend: a streaming SSE call and
//! a compact JSON call, plus the usage poll the refresher runs. One pooled
//! reqwest client serves them all.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::Value;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::openai::models::{
    normalize_error_code, openai_error, parse_error_envelope, parse_event, response_failed_event,
};
use crate::upstream::inline::inline_input_images;
use crate::upstream::sse::{format_event, normalize_event_block, SseFraming};

/// Inbound headers never forwarded upstream.
const IGNORE_INBOUND_HEADERS: &[&str] =
    &["authorization", "chatgpt-account-id", "content-length", "host"];

/// Upstream returned an HTTP-level error envelope.
#[derive(Debug, Clone, thiserror::Error)]
#[error("proxy response error ({status})")]
pub struct ProxyResponseError {
    pub status: u16,
    pub payload: Value,
}

/// Usage poll failed; classified for the refresher's counters.
#[derive(Debug, Clone, thiserror::Error)]
#[error("usage fetch failed ({phase})")]
pub struct UsageFetchError {
    pub status_code: Option<u16>,
    pub phase: &'static str,
}

/// `GET /usage` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsagePayload {
    #[serde(default)]
    pub rate_limit: Option<RateLimitWindows>,
    #[serde(default)]
    pub credits: Option<CreditsInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitWindows {
    #[serde(default)]
    pub primary_window: Option<UsageWindowPayload>,
    #[serde(default)]
    pub secondary_window: Option<UsageWindowPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageWindowPayload {
    #[serde(default)]
    pub used_percent: Option<f64>,
    #[serde(default)]
    pub reset_at: Option<i64>,
    #[serde(default)]
    pub limit_window_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreditsInfo {
    #[serde(default, alias = "has_credits")]
    pub has: Option<bool>,
    #[serde(default)]
    pub unlimited: Option<bool>,
    #[serde(default)]
    pub balance: Option<f64>,
}

/// Drop hop-by-hop and credential headers from the inbound request.
pub fn filter_inbound_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(key, _)| !IGNORE_INBOUND_HEADERS.contains(&key.to_lowercase().as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    config: Arc<Config>,
}

impl UpstreamClient {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.upstream_connect_timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Stream `/codex/responses` as complete SSE event blocks.
    ///
    /// Items are `Ok(block)` on the happy path. With `raise_for_status` an
    /// upstream 4xx/5xx before the stream opens surfaces as `Err`; otherwise
    /// it becomes a terminal `response.failed` block. Guard trips (idle
    /// timeout, oversized event) and transport failures always terminate the
    /// stream with a `response.failed` block. A stream that ends without a
    /// terminal event gets one synthesized.
    pub fn stream_responses(
        &self,
        mut payload: Value,
        headers: HashMap<String, String>,
        access_token: String,
        account_id: Option<String>,
        request_id: String,
        raise_for_status: bool,
    ) -> impl Stream<Item = std::result::Result<String, ProxyResponseError>> + Send + 'static {
        let client = self.clone();
        async_stream::stream! {
            let url = format!("{}/codex/responses", client.config.upstream_base_url);
            if client.config.image_inline_fetch_enabled {
                inline_input_images(&mut payload, &client.config).await;
            }
            let upstream_headers = build_upstream_headers(
                &headers,
                &access_token,
                account_id.as_deref(),
                &request_id,
                "text/event-stream",
            );

            let response = match client
                .http
                .post(&url)
                .headers(upstream_headers)
                .json(&payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    yield Ok(format_event(&response_failed_event(
                        "upstream_unavailable",
                        &error.to_string(),
                        "server_error",
                        Some(&request_id),
                        None,
                    )));
                    return;
                }
            };

            let status = response.status();
            if status.as_u16() >= 400 {
                let envelope = error_payload_from_response(response).await;
                if raise_for_status {
                    yield Err(ProxyResponseError { status: status.as_u16(), payload: envelope });
                    return;
                }
                yield Ok(format_event(&failed_event_from_envelope(&envelope, &request_id)));
                return;
            }

            let mut framing = SseFraming::new(client.config.max_sse_event_bytes);
            let body = response.bytes_stream();
            tokio::pin!(body);
            let mut seen_terminal = false;

            loop {
                let chunk = match tokio::time::timeout(
                    client.config.stream_idle_timeout,
                    body.next(),
                )
                .await
                {
                    Err(_) => {
                        yield Ok(format_event(&response_failed_event(
                            "stream_idle_timeout",
                            "Upstream stream idle timeout",
                            "server_error",
                            Some(&request_id),
                            None,
                        )));
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(error))) => {
                        yield Ok(format_event(&response_failed_event(
                            "upstream_unavailable",
                            &error.to_string(),
                            "server_error",
                            Some(&request_id),
                            None,
                        )));
                        return;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };

                let events = match framing.push(&chunk) {
                    Ok(events) => events,
                    Err(oversize) => {
                        yield Ok(format_event(&response_failed_event(
                            "stream_event_too_large",
                            &format!(
                                "SSE event exceeded {} bytes (received {} bytes)",
                                oversize.limit_bytes, oversize.size_bytes
                            ),
                            "server_error",
                            Some(&request_id),
                            None,
                        )));
                        return;
                    }
                };
                for block in events {
                    let block = normalize_event_block(&block);
                    if let Some(event) = parse_event(&block) {
                        if event.is_terminal() {
                            seen_terminal = true;
                        }
                    }
                    yield Ok(block);
                }
            }

            match framing.finish() {
                Ok(Some(tail)) => {
                    let tail = normalize_event_block(&tail);
                    if let Some(event) = parse_event(&tail) {
                        if event.is_terminal() {
                            seen_terminal = true;
                        }
                    }
                    yield Ok(tail);
                }
                Ok(None) => {}
                Err(oversize) => {
                    yield Ok(format_event(&response_failed_event(
                        "stream_event_too_large",
                        &format!(
                            "SSE event exceeded {} bytes (received {} bytes)",
                            oversize.limit_bytes, oversize.size_bytes
                        ),
                        "server_error",
                        Some(&request_id),
                        None,
                    )));
                    return;
                }
            }

            if !seen_terminal {
                yield Ok(format_event(&response_failed_event(
                    "stream_incomplete",
                    "Upstream closed stream without completion",
                    "server_error",
                    Some(&request_id),
                    None,
                )));
            }
        }
    }

    /// `POST /codex/responses/compact`: JSON in, JSON out.
    pub async fn compact_responses(
        &self,
        mut payload: Value,
        headers: HashMap<String, String>,
        access_token: &str,
        account_id: Option<&str>,
        request_id: &str,
    ) -> std::result::Result<Value, ProxyResponseError> {
        let url = format!("{}/codex/responses/compact", self.config.upstream_base_url);
        if self.config.image_inline_fetch_enabled {
            inline_input_images(&mut payload, &self.config).await;
        }
        let upstream_headers = build_upstream_headers(
            &headers,
            access_token,
            account_id,
            request_id,
            "application/json",
        );

        let response = self
            .http
            .post(&url)
            .headers(upstream_headers)
            .json(&payload)
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await
            .map_err(|error| ProxyResponseError {
                status: 502,
                payload: openai_error("upstream_unavailable", &error.to_string(), "server_error"),
            })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let envelope = error_payload_from_response(response).await;
            return Err(ProxyResponseError { status: status.as_u16(), payload: envelope });
        }

        let body: Value = response.json().await.map_err(|_| ProxyResponseError {
            status: 502,
            payload: openai_error("upstream_error", "Invalid JSON from upstream", "server_error"),
        })?;
        if !body.is_object() {
            return Err(ProxyResponseError {
                status: 502,
                payload: openai_error("upstream_error", "Unexpected upstream payload", "server_error"),
            });
        }
        Ok(body)
    }

    /// `GET /usage` for one account.
    pub async fn fetch_usage(
        &self,
        access_token: &str,
        account_id: Option<&str>,
    ) -> std::result::Result<UsagePayload, UsageFetchError> {
        let url = format!("{}/usage", self.config.upstream_base_url);
        let mut request = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .timeout(self.config.usage_fetch_timeout);
        if let Some(account_id) = account_id {
            request = request.header("chatgpt-account-id", account_id);
        }

        let response = request
            .send()
            .await
            .map_err(|_| UsageFetchError { status_code: None, phase: "request" })?;
        let status = response.status();
        if !status.is_success() {
            return Err(UsageFetchError {
                status_code: Some(status.as_u16()),
                phase: "status",
            });
        }
        response
            .json()
            .await
            .map_err(|_| UsageFetchError { status_code: Some(status.as_u16()), phase: "decode" })
    }
}

/// Outbound headers: the filtered inbound set, plus auth, accept, and a
/// request id when the caller did not send one.
fn build_upstream_headers(
    inbound: &HashMap<String, String>,
    access_token: &str,
    account_id: Option<&str>,
    request_id: &str,
    accept: &str,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (key, value) in inbound {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    let has_request_id =
        headers.contains_key("x-request-id") || headers.contains_key("request-id");
    if !has_request_id {
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert("x-request-id", value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {access_token}")) {
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }
    if let Ok(value) = HeaderValue::from_str(accept) {
        headers.insert(reqwest::header::ACCEPT, value);
    }
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Some(account_id) = account_id {
        if let Ok(value) = HeaderValue::from_str(account_id) {
            headers.insert("chatgpt-account-id", value);
        }
    }
    headers
}

/// Build a failed event from an error-envelope body.
fn failed_event_from_envelope(envelope: &Value, request_id: &str) -> Value {
    match parse_error_envelope(envelope) {
        Some(error) => {
            let code = normalize_error_code(error.code.as_deref(), error.kind.as_deref());
            let mut event = response_failed_event(
                &code,
                error.message.as_deref().unwrap_or("Upstream error"),
                error.kind.as_deref().unwrap_or("server_error"),
                Some(request_id),
                error.param.as_deref(),
            );
            crate::openai::models::apply_error_metadata(&mut event, &error);
            event
        }
        None => response_failed_event(
            "upstream_error",
            "Upstream error",
            "server_error",
            Some(request_id),
            None,
        ),
    }
}

/// Parse an upstream error body into the OpenAI envelope, with fallbacks for
/// non-JSON and non-envelope payloads.
async fn error_payload_from_response(response: reqwest::Response) -> Value {
    let status = response.status();
    let fallback = format!(
        "Upstream error: HTTP {}{}",
        status.as_u16(),
        status.canonical_reason().map(|r| format!(" {r}")).unwrap_or_default()
    );
    let Ok(text) = response.text().await else {
        return openai_error("upstream_error", &fallback, "server_error");
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(data) if data.is_object() => {
            if parse_error_envelope(&data).is_some() {
                return data;
            }
            for key in ["message", "detail", "error"] {
                if let Some(message) = data.get(key).and_then(Value::as_str) {
                    if !message.trim().is_empty() {
                        return openai_error("upstream_error", message, "server_error");
                    }
                }
            }
            openai_error("upstream_error", &fallback, "server_error")
        }
        _ => {
            let message = text.trim();
            if message.is_empty() {
                openai_error("upstream_error", &fallback, "server_error")
            } else {
                openai_error("upstream_error", message, "server_error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_inbound_headers() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer client".to_string());
        headers.insert("chatgpt-account-id".to_string(), "acc".to_string());
        headers.insert("Content-Length".to_string(), "10".to_string());
        headers.insert("Host".to_string(), "proxy".to_string());
        headers.insert("x-custom".to_string(), "keep".to_string());
        let filtered = filter_inbound_headers(&headers);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("x-custom").map(String::as_str), Some("keep"));
    }

    #[test]
    fn test_build_upstream_headers() {
        let mut inbound = HashMap::new();
        inbound.insert("x-custom".to_string(), "keep".to_string());
        let headers = build_upstream_headers(&inbound, "tok", Some("acc_1"), "req_1", "text/event-stream");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer tok");
        assert_eq!(headers.get("accept").unwrap(), "text/event-stream");
        assert_eq!(headers.get("chatgpt-account-id").unwrap(), "acc_1");
        assert_eq!(headers.get("x-request-id").unwrap(), "req_1");
        assert_eq!(headers.get("x-custom").unwrap(), "keep");
    }

    #[test]
    fn test_build_upstream_headers_keeps_caller_request_id() {
        let mut inbound = HashMap::new();
        inbound.insert("request-id".to_string(), "caller-id".to_string());
        let headers = build_upstream_headers(&inbound, "tok", None, "minted", "application/json");
        assert!(headers.get("x-request-id").is_none());
        assert_eq!(headers.get("request-id").unwrap(), "caller-id");
        assert!(headers.get("chatgpt-account-id").is_none());
    }

    #[test]
    fn test_failed_event_from_envelope() {
        let envelope = json!({
            "error": {"code": "RATE_LIMIT_EXCEEDED", "message": "slow down", "resets_in_seconds": 30}
        });
        let event = failed_event_from_envelope(&envelope, "req_1");
        assert_eq!(event["response"]["error"]["code"], "rate_limit_exceeded");
        assert_eq!(event["response"]["error"]["resets_in_seconds"], 30.0);

        let event = failed_event_from_envelope(&json!({"unexpected": true}), "req_1");
        assert_eq!(event["response"]["error"]["code"], "upstream_error");
    }
}
