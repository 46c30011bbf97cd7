//! Upstream event and error models
//!
//! Payloads are untyped JSON on the wire. Only the fields driving control
//! flow (event type, error code, usage counters) are parsed; everything else
//! is forwarded verbatim.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// OpenAI-compatible error detail.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OpenAiError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_in_seconds: Option<f64>,
}

/// Token usage reported by `response.completed`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResponseUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens_details: Option<InputTokensDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens_details: Option<OutputTokensDetails>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InputTokensDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutputTokensDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<i64>,
}

impl ResponseUsage {
    pub fn cached_input_tokens(&self) -> Option<i64> {
        self.input_tokens_details.as_ref().and_then(|d| d.cached_tokens)
    }

    pub fn reasoning_tokens(&self) -> Option<i64> {
        self.output_tokens_details.as_ref().and_then(|d| d.reasoning_tokens)
    }
}

/// The response body carried by terminal events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventResponse {
    pub id: Option<String>,
    pub status: Option<String>,
    pub error: Option<OpenAiError>,
    pub usage: Option<ResponseUsage>,
}

/// One parsed SSE event; unknown types still carry their `kind`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParsedEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub response: Option<EventResponse>,
    #[serde(default)]
    pub error: Option<OpenAiError>,
    #[serde(default)]
    pub delta: Option<Value>,
}

impl ParsedEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind.as_str(),
            "response.completed" | "response.failed" | "response.incomplete"
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.kind.as_str(), "response.failed" | "error")
    }

    /// The error detail, wherever the event variant put it.
    pub fn error_detail(&self) -> Option<&OpenAiError> {
        match self.kind.as_str() {
            "error" => self.error.as_ref(),
            _ => self.response.as_ref().and_then(|r| r.error.as_ref()),
        }
    }

    pub fn usage(&self) -> Option<&ResponseUsage> {
        self.response.as_ref().and_then(|r| r.usage.as_ref())
    }
}

/// Parse the JSON carried by one SSE event block. Returns `None` for
/// comments, `[DONE]`, and payloads that are not objects.
pub fn parse_event(block: &str) -> Option<ParsedEvent> {
    let data = crate::upstream::sse::extract_data(block)?;
    let value: Value = serde_json::from_str(&data).ok()?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// `{"error": {...}}` envelope used on non-streaming error paths.
pub fn openai_error(code: &str, message: &str, error_type: &str) -> Value {
    json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": code,
        }
    })
}

/// Terminal `response.failed` event payload.
pub fn response_failed_event(
    code: &str,
    message: &str,
    error_type: &str,
    response_id: Option<&str>,
    param: Option<&str>,
) -> Value {
    let mut error = json!({
        "message": message,
        "type": error_type,
        "code": code,
    });
    if let Some(param) = param {
        error["param"] = json!(param);
    }
    let mut response = json!({
        "object": "response",
        "status": "failed",
        "created_at": Utc::now().timestamp(),
        "error": error,
        "incomplete_details": Value::Null,
    });
    if let Some(id) = response_id {
        response["id"] = json!(id);
    }
    json!({ "type": "response.failed", "response": response })
}

/// Attach optional upstream hints to a failed event's error detail.
pub fn apply_error_metadata(event: &mut Value, error: &OpenAiError) {
    let Some(detail) = event
        .get_mut("response")
        .and_then(|r| r.get_mut("error"))
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    if let Some(plan_type) = &error.plan_type {
        detail.insert("plan_type".into(), json!(plan_type));
    }
    if let Some(resets_at) = error.resets_at {
        detail.insert("resets_at".into(), json!(resets_at));
    }
    if let Some(resets_in) = error.resets_in_seconds {
        detail.insert("resets_in_seconds".into(), json!(resets_in));
    }
}

/// Parse an `{"error": {...}}` body; tolerates partial shapes.
pub fn parse_error_envelope(payload: &Value) -> Option<OpenAiError> {
    let error = payload.get("error")?;
    serde_json::from_value(error.clone()).ok()
}

/// Normalized lowercase error code, falling back to the error type and then
/// to `upstream_error`.
pub fn normalize_error_code(code: Option<&str>, error_type: Option<&str>) -> String {
    code.filter(|value| !value.is_empty())
        .or(error_type.filter(|value| !value.is_empty()))
        .map(|value| value.to_lowercase())
        .unwrap_or_else(|| "upstream_error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_terminal_with_usage() {
        let block = concat!(
            "event: response.completed\n",
            "data: {\"type\":\"response.completed\",\"response\":{\"id\":\"resp_1\",",
            "\"usage\":{\"input_tokens\":10,\"output_tokens\":3,",
            "\"input_tokens_details\":{\"cached_tokens\":4}}}}\n\n"
        );
        let event = parse_event(block).unwrap();
        assert!(event.is_terminal());
        assert!(!event.is_failure());
        let usage = event.usage().unwrap();
        assert_eq!(usage.input_tokens, Some(10));
        assert_eq!(usage.cached_input_tokens(), Some(4));
    }

    #[test]
    fn test_parse_event_error_variants() {
        let failed = parse_event(
            "data: {\"type\":\"response.failed\",\"response\":{\"error\":{\"code\":\"rate_limit_exceeded\",\"message\":\"slow down\"}}}\n\n",
        )
        .unwrap();
        assert!(failed.is_failure());
        assert_eq!(failed.error_detail().unwrap().code.as_deref(), Some("rate_limit_exceeded"));

        let top_level = parse_event(
            "data: {\"type\":\"error\",\"error\":{\"code\":\"invalid_request\"}}\n\n",
        )
        .unwrap();
        assert!(top_level.is_failure());
        assert_eq!(top_level.error_detail().unwrap().code.as_deref(), Some("invalid_request"));
    }

    #[test]
    fn test_parse_event_skips_done_and_comments() {
        assert!(parse_event("data: [DONE]\n\n").is_none());
        assert!(parse_event(": keepalive\n\n").is_none());
        assert!(parse_event("data: \"just a string\"\n\n").is_none());
    }

    #[test]
    fn test_normalize_error_code() {
        assert_eq!(normalize_error_code(Some("Rate_Limit_Exceeded"), None), "rate_limit_exceeded");
        assert_eq!(normalize_error_code(None, Some("server_error")), "server_error");
        assert_eq!(normalize_error_code(None, None), "upstream_error");
        assert_eq!(normalize_error_code(Some(""), Some("x")), "x");
    }

    #[test]
    fn test_response_failed_event_shape() {
        let event = response_failed_event("no_accounts", "none left", "server_error", Some("req_1"), None);
        assert_eq!(event["type"], "response.failed");
        assert_eq!(event["response"]["status"], "failed");
        assert_eq!(event["response"]["id"], "req_1");
        assert_eq!(event["response"]["error"]["code"], "no_accounts");
    }

    #[test]
    fn test_apply_error_metadata() {
        let mut event = response_failed_event("quota_exceeded", "done", "server_error", None, None);
        apply_error_metadata(
            &mut event,
            &OpenAiError {
                plan_type: Some("plus".into()),
                resets_at: Some(1_900_000_000.0),
                ..Default::default()
            },
        );
        assert_eq!(event["response"]["error"]["plan_type"], "plus");
        assert_eq!(event["response"]["error"]["resets_at"], 1_900_000_000.0);
    }
}
