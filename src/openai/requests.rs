//! Inbound responses-API request handling
//!
//! The body is passthrough JSON: typed accessors cover only the fields the
//! proxy itself reads (model, stream, prompt_cache_key, reasoning effort).
//! Validation rejects what the upstream cannot serve through a pooled
//! account: server-side conversation state and file references.

use serde_json::{Map, Value};

/// Client payload rejected before selection (400/422 class).
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid request payload: {message}")]
pub struct ClientPayloadError {
    pub message: String,
    pub param: Option<String>,
}

impl ClientPayloadError {
    fn new(message: impl Into<String>, param: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            param: Some(param.into()),
        }
    }
}

const SUPPORTED_TOOL_TYPES: &[&str] = &["function", "custom", "web_search", "local_shell"];

/// A validated `/responses` request body, forwarded verbatim.
#[derive(Debug, Clone)]
pub struct ResponsesRequest {
    body: Map<String, Value>,
}

impl ResponsesRequest {
    pub fn from_value(value: Value) -> Result<Self, ClientPayloadError> {
        let Value::Object(body) = value else {
            return Err(ClientPayloadError {
                message: "request body must be a JSON object".into(),
                param: None,
            });
        };
        validate(&body)?;
        Ok(Self { body })
    }

    pub fn model(&self) -> &str {
        self.body.get("model").and_then(Value::as_str).unwrap_or("")
    }

    pub fn stream(&self) -> bool {
        self.body.get("stream").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn set_stream(&mut self, stream: bool) {
        self.body.insert("stream".into(), Value::Bool(stream));
    }

    pub fn prompt_cache_key(&self) -> Option<&str> {
        self.body.get("prompt_cache_key").and_then(Value::as_str)
    }

    pub fn reasoning_effort(&self) -> Option<&str> {
        self.body
            .get("reasoning")
            .and_then(|r| r.get("effort"))
            .and_then(Value::as_str)
    }

    pub fn to_payload(&self) -> Value {
        Value::Object(self.body.clone())
    }

    pub fn into_payload(self) -> Value {
        Value::Object(self.body)
    }
}

fn validate(body: &Map<String, Value>) -> Result<(), ClientPayloadError> {
    if body.get("store").and_then(Value::as_bool) == Some(true) {
        return Err(ClientPayloadError::new(
            "store=true is not supported through the proxy",
            "store",
        ));
    }
    if body
        .get("previous_response_id")
        .is_some_and(|v| !v.is_null())
    {
        return Err(ClientPayloadError::new(
            "previous_response_id is not supported through the proxy",
            "previous_response_id",
        ));
    }
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        for (index, tool) in tools.iter().enumerate() {
            let kind = tool.get("type").and_then(Value::as_str).unwrap_or("");
            if !SUPPORTED_TOOL_TYPES.contains(&kind) {
                return Err(ClientPayloadError::new(
                    format!("unsupported tool type '{kind}'"),
                    format!("tools.{index}.type"),
                ));
            }
        }
    }
    if let Some(input) = body.get("input").and_then(Value::as_array) {
        for (index, item) in input.iter().enumerate() {
            validate_input_item(item, index)?;
        }
    }
    Ok(())
}

fn validate_input_item(item: &Value, index: usize) -> Result<(), ClientPayloadError> {
    let contents = match item.get("content") {
        Some(Value::Array(parts)) => parts.as_slice(),
        _ => std::slice::from_ref(item),
    };
    for part in contents {
        if part.get("file_id").is_some_and(|v| !v.is_null()) {
            return Err(ClientPayloadError::new(
                "file_id inputs are not supported through the proxy",
                format!("input.{index}.file_id"),
            ));
        }
    }
    Ok(())
}

/// A `/responses/compact` request body; the same validation applies, minus
/// any streaming concerns.
#[derive(Debug, Clone)]
pub struct ResponsesCompactRequest {
    inner: ResponsesRequest,
}

impl ResponsesCompactRequest {
    pub fn from_value(value: Value) -> Result<Self, ClientPayloadError> {
        Ok(Self {
            inner: ResponsesRequest::from_value(value)?,
        })
    }

    pub fn model(&self) -> &str {
        self.inner.model()
    }

    pub fn prompt_cache_key(&self) -> Option<&str> {
        self.inner.prompt_cache_key()
    }

    pub fn reasoning_effort(&self) -> Option<&str> {
        self.inner.reasoning_effort()
    }

    pub fn to_payload(&self) -> Value {
        self.inner.to_payload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accepts_passthrough_fields() {
        let request = ResponsesRequest::from_value(json!({
            "model": "gpt-5.1",
            "stream": true,
            "prompt_cache_key": "thread_1",
            "reasoning": {"effort": "high"},
            "some_future_field": {"nested": true},
            "input": [{"type": "message", "role": "user", "content": [{"type": "input_text", "text": "hi"}]}],
        }))
        .unwrap();
        assert_eq!(request.model(), "gpt-5.1");
        assert!(request.stream());
        assert_eq!(request.prompt_cache_key(), Some("thread_1"));
        assert_eq!(request.reasoning_effort(), Some("high"));
        assert_eq!(request.to_payload()["some_future_field"]["nested"], json!(true));
    }

    #[test]
    fn test_rejects_store_true() {
        let error = ResponsesRequest::from_value(json!({"model": "gpt-5.1", "store": true})).unwrap_err();
        assert_eq!(error.param.as_deref(), Some("store"));
        // store=false passes
        assert!(ResponsesRequest::from_value(json!({"model": "gpt-5.1", "store": false})).is_ok());
    }

    #[test]
    fn test_rejects_previous_response_id_and_file_id() {
        let error = ResponsesRequest::from_value(
            json!({"model": "gpt-5.1", "previous_response_id": "resp_9"}),
        )
        .unwrap_err();
        assert_eq!(error.param.as_deref(), Some("previous_response_id"));

        let error = ResponsesRequest::from_value(json!({
            "model": "gpt-5.1",
            "input": [{"type": "message", "content": [{"type": "input_file", "file_id": "file_1"}]}],
        }))
        .unwrap_err();
        assert_eq!(error.param.as_deref(), Some("input.0.file_id"));
    }

    #[test]
    fn test_rejects_unsupported_tool_type() {
        let error = ResponsesRequest::from_value(json!({
            "model": "gpt-5.1",
            "tools": [{"type": "function", "name": "f"}, {"type": "file_search"}],
        }))
        .unwrap_err();
        assert_eq!(error.param.as_deref(), Some("tools.1.type"));
    }
}
