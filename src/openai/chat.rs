//! OpenAI chat-completions compatibility
//!
//! `/v1/chat/completions` bodies are mapped onto a responses request; the
//! responses SSE stream is translated back into `chat.completion.chunk`
//! frames or collected into a single `chat.completion` object. Text content
//! and function tools are mapped; anything the responses shape cannot
//! express is dropped rather than rejected.

use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::openai::models::{parse_event, OpenAiError, ResponseUsage};
use crate::openai::requests::{ClientPayloadError, ResponsesRequest};
use crate::upstream::ProxyResponseError;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionsRequest {
    pub model: String,
    pub messages: Vec<Value>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stream_options: Option<StreamOptions>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_completion_tokens: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub prompt_cache_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

impl ChatCompletionsRequest {
    pub fn include_usage(&self) -> bool {
        self.stream_options
            .as_ref()
            .map(|options| options.include_usage)
            .unwrap_or(false)
    }

    /// Map onto a responses request. System/developer messages fold into
    /// `instructions`; the rest become input message items.
    pub fn to_responses_request(&self) -> Result<ResponsesRequest, ClientPayloadError> {
        let mut instructions: Vec<String> = Vec::new();
        let mut input: Vec<Value> = Vec::new();

        for message in &self.messages {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
            match role {
                "system" | "developer" => {
                    if let Some(text) = plain_text_content(message.get("content")) {
                        instructions.push(text);
                    }
                }
                _ => {
                    if let Some(item) = message_to_input_item(role, message.get("content")) {
                        input.push(item);
                    }
                }
            }
        }

        let mut body = Map::new();
        body.insert("model".into(), json!(&self.model));
        body.insert("input".into(), Value::Array(input));
        body.insert("stream".into(), json!(self.stream.unwrap_or(false)));
        if !instructions.is_empty() {
            body.insert("instructions".into(), json!(instructions.join("\n\n")));
        }
        if let Some(max_output) = self.max_completion_tokens.or(self.max_tokens) {
            body.insert("max_output_tokens".into(), json!(max_output));
        }
        if let Some(temperature) = self.temperature {
            body.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = self.top_p {
            body.insert("top_p".into(), json!(top_p));
        }
        if let Some(effort) = &self.reasoning_effort {
            body.insert("reasoning".into(), json!({ "effort": effort }));
        }
        if let Some(key) = &self.prompt_cache_key {
            body.insert("prompt_cache_key".into(), json!(key));
        }
        if let Some(tools) = &self.tools {
            let mapped: Vec<Value> = tools.iter().filter_map(|tool| map_tool(tool)).collect();
            if !mapped.is_empty() {
                body.insert("tools".into(), Value::Array(mapped));
                if let Some(choice) = &self.tool_choice {
                    body.insert("tool_choice".into(), choice.clone());
                }
            }
        }
        ResponsesRequest::from_value(Value::Object(body))
    }
}

fn plain_text_content(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n"))
        }
        _ => None,
    }
}

fn message_to_input_item(role: &str, content: Option<&Value>) -> Option<Value> {
    // Tool results have no responses-side message role; fold them in as
    // user-visible context.
    let role = match role {
        "assistant" => "assistant",
        _ => "user",
    };
    let text_type = if role == "assistant" { "output_text" } else { "input_text" };

    let parts: Vec<Value> = match content? {
        Value::String(text) => vec![json!({ "type": text_type, "text": text })],
        Value::Array(raw_parts) => raw_parts
            .iter()
            .filter_map(|part| match part.get("type").and_then(Value::as_str) {
                Some("text") => part
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|text| json!({ "type": text_type, "text": text })),
                Some("image_url") => part
                    .get("image_url")
                    .and_then(|image| image.get("url"))
                    .and_then(Value::as_str)
                    .map(|url| json!({ "type": "input_image", "image_url": url })),
                _ => None,
            })
            .collect(),
        _ => return None,
    };
    if parts.is_empty() {
        return None;
    }
    Some(json!({ "type": "message", "role": role, "content": parts }))
}

/// Chat `{type:"function", function:{...}}` tools flatten to responses form.
fn map_tool(tool: &Value) -> Option<Value> {
    match tool.get("type").and_then(Value::as_str) {
        Some("function") => {
            let function = tool.get("function")?;
            let mut mapped = json!({
                "type": "function",
                "name": function.get("name")?.as_str()?,
            });
            if let Some(description) = function.get("description") {
                mapped["description"] = description.clone();
            }
            if let Some(parameters) = function.get("parameters") {
                mapped["parameters"] = parameters.clone();
            }
            Some(mapped)
        }
        _ => None,
    }
}

fn chunk(request_id: &str, model: &str, created: i64, delta: Value, finish: Option<&str>) -> String {
    let payload = json!({
        "id": format!("chatcmpl-{request_id}"),
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }],
    });
    format!("data: {payload}\n\n")
}

fn usage_json(usage: &ResponseUsage) -> Value {
    let prompt = usage.input_tokens.unwrap_or(0);
    let completion = usage.output_tokens.or(usage.reasoning_tokens()).unwrap_or(0);
    json!({
        "prompt_tokens": prompt,
        "completion_tokens": completion,
        "total_tokens": prompt + completion,
    })
}

fn error_frame(detail: &OpenAiError) -> String {
    let payload = json!({ "error": detail });
    format!("data: {payload}\n\n")
}

/// Translate a responses SSE stream into chat-completions chunks.
pub fn chat_chunk_stream(
    upstream: impl Stream<Item = Result<String, ProxyResponseError>> + Send + 'static,
    request_id: String,
    model: String,
    include_usage: bool,
) -> impl Stream<Item = Result<String, ProxyResponseError>> + Send + 'static {
    async_stream::stream! {
        let created = Utc::now().timestamp();
        let mut sent_role = false;
        let mut usage: Option<ResponseUsage> = None;
        tokio::pin!(upstream);

        while let Some(item) = upstream.next().await {
            let block = match item {
                Ok(block) => block,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };
            let Some(event) = parse_event(&block) else { continue };
            match event.kind.as_str() {
                "response.output_text.delta" => {
                    let Some(text) = event.delta.as_ref().and_then(Value::as_str) else {
                        continue;
                    };
                    if !sent_role {
                        sent_role = true;
                        yield Ok(chunk(&request_id, &model, created, json!({ "role": "assistant" }), None));
                    }
                    yield Ok(chunk(&request_id, &model, created, json!({ "content": text }), None));
                }
                "response.completed" | "response.incomplete" => {
                    if let Some(reported) = event.usage() {
                        usage = Some(reported.clone());
                    }
                    yield Ok(chunk(&request_id, &model, created, json!({}), Some("stop")));
                    if include_usage {
                        let usage_value = usage
                            .as_ref()
                            .map(usage_json)
                            .unwrap_or_else(|| usage_json(&ResponseUsage::default()));
                        let payload = json!({
                            "id": format!("chatcmpl-{request_id}"),
                            "object": "chat.completion.chunk",
                            "created": created,
                            "model": model,
                            "choices": [],
                            "usage": usage_value,
                        });
                        yield Ok(format!("data: {payload}\n\n"));
                    }
                    yield Ok("data: [DONE]\n\n".to_string());
                    return;
                }
                "response.failed" | "error" => {
                    let detail = event.error_detail().cloned().unwrap_or_default();
                    yield Ok(error_frame(&detail));
                    yield Ok("data: [DONE]\n\n".to_string());
                    return;
                }
                _ => {}
            }
        }
        yield Ok("data: [DONE]\n\n".to_string());
    }
}

/// Outcome of collecting a responses stream into one chat completion.
pub enum ChatCompletionOutcome {
    Completed(Value),
    Failed { envelope: Value, code: Option<String> },
}

/// Collect a responses SSE stream into a single `chat.completion` object.
pub async fn collect_chat_completion(
    upstream: impl Stream<Item = Result<String, ProxyResponseError>> + Send,
    request_id: &str,
    model: &str,
) -> Result<ChatCompletionOutcome, ProxyResponseError> {
    let mut text = String::new();
    let mut usage: Option<ResponseUsage> = None;
    tokio::pin!(upstream);

    while let Some(item) = upstream.next().await {
        let block = item?;
        let Some(event) = parse_event(&block) else { continue };
        match event.kind.as_str() {
            "response.output_text.delta" => {
                if let Some(delta) = event.delta.as_ref().and_then(Value::as_str) {
                    text.push_str(delta);
                }
            }
            "response.completed" | "response.incomplete" => {
                if let Some(reported) = event.usage() {
                    usage = Some(reported.clone());
                }
                let usage_value = usage
                    .as_ref()
                    .map(usage_json)
                    .unwrap_or_else(|| usage_json(&ResponseUsage::default()));
                return Ok(ChatCompletionOutcome::Completed(json!({
                    "id": format!("chatcmpl-{request_id}"),
                    "object": "chat.completion",
                    "created": Utc::now().timestamp(),
                    "model": model,
                    "choices": [{
                        "index": 0,
                        "message": { "role": "assistant", "content": text },
                        "finish_reason": "stop",
                    }],
                    "usage": usage_value,
                })));
            }
            "response.failed" | "error" => {
                let detail = event.error_detail().cloned().unwrap_or_default();
                let code = detail.code.clone();
                return Ok(ChatCompletionOutcome::Failed {
                    envelope: json!({ "error": detail }),
                    code,
                });
            }
            _ => {}
        }
    }
    Ok(ChatCompletionOutcome::Failed {
        envelope: json!({
            "error": {
                "message": "Upstream error",
                "type": "server_error",
                "code": "upstream_error",
            }
        }),
        code: Some("upstream_error".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn request(value: Value) -> ChatCompletionsRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_to_responses_request_maps_messages() {
        let chat = request(json!({
            "model": "gpt-5.1",
            "messages": [
                {"role": "system", "content": "be nice"},
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi there"},
                {"role": "user", "content": [
                    {"type": "text", "text": "look"},
                    {"type": "image_url", "image_url": {"url": "https://cdn.example.com/a.png"}},
                ]},
            ],
            "max_completion_tokens": 512,
            "reasoning_effort": "high",
            "prompt_cache_key": "thread_9",
        }));
        let responses = chat.to_responses_request().unwrap();
        let payload = responses.to_payload();
        assert_eq!(payload["instructions"], "be nice");
        assert_eq!(payload["max_output_tokens"], 512);
        assert_eq!(payload["reasoning"]["effort"], "high");
        assert_eq!(payload["prompt_cache_key"], "thread_9");

        let input = payload["input"].as_array().unwrap();
        assert_eq!(input.len(), 3);
        assert_eq!(input[0]["content"][0]["type"], "input_text");
        assert_eq!(input[1]["role"], "assistant");
        assert_eq!(input[1]["content"][0]["type"], "output_text");
        assert_eq!(input[2]["content"][1]["type"], "input_image");
    }

    #[test]
    fn test_to_responses_request_maps_function_tools() {
        let chat = request(json!({
            "model": "gpt-5.1",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{
                "type": "function",
                "function": {"name": "lookup", "description": "d", "parameters": {"type": "object"}},
            }],
            "tool_choice": "auto",
        }));
        let payload = chat.to_responses_request().unwrap().to_payload();
        assert_eq!(payload["tools"][0]["type"], "function");
        assert_eq!(payload["tools"][0]["name"], "lookup");
        assert_eq!(payload["tool_choice"], "auto");
    }

    #[tokio::test]
    async fn test_chat_chunk_stream_translates_deltas() {
        let upstream = stream::iter(vec![
            Ok("data: {\"type\":\"response.output_text.delta\",\"delta\":\"Hel\"}\n\n".to_string()),
            Ok("data: {\"type\":\"response.output_text.delta\",\"delta\":\"lo\"}\n\n".to_string()),
            Ok("data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":4,\"output_tokens\":2}}}\n\n".to_string()),
        ]);
        let chunks: Vec<String> = chat_chunk_stream(upstream, "req_1".into(), "gpt-5.1".into(), true)
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert!(chunks[0].contains("\"role\":\"assistant\""));
        assert!(chunks[1].contains("\"content\":\"Hel\""));
        assert!(chunks[2].contains("\"content\":\"lo\""));
        assert!(chunks[3].contains("\"finish_reason\":\"stop\""));
        assert!(chunks[4].contains("\"total_tokens\":6"));
        assert_eq!(chunks.last().unwrap(), "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_collect_chat_completion_failure_keeps_code() {
        let upstream = stream::iter(vec![Ok(
            "data: {\"type\":\"response.failed\",\"response\":{\"error\":{\"code\":\"no_accounts\",\"message\":\"none\"}}}\n\n".to_string(),
        )]);
        match collect_chat_completion(upstream, "req_1", "gpt-5.1").await.unwrap() {
            ChatCompletionOutcome::Failed { code, envelope } => {
                assert_eq!(code.as_deref(), Some("no_accounts"));
                assert_eq!(envelope["error"]["code"], "no_accounts");
            }
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_collect_chat_completion_success() {
        let upstream = stream::iter(vec![
            Ok("data: {\"type\":\"response.output_text.delta\",\"delta\":\"Hi\"}\n\n".to_string()),
            Ok("data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":1,\"output_tokens\":1}}}\n\n".to_string()),
        ]);
        match collect_chat_completion(upstream, "req_1", "gpt-5.1").await.unwrap() {
            ChatCompletionOutcome::Completed(payload) => {
                assert_eq!(payload["choices"][0]["message"]["content"], "Hi");
                assert_eq!(payload["usage"]["total_tokens"], 2);
            }
            _ => panic!("expected completion"),
        }
    }
}
