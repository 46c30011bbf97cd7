//! Proxy service: select, refresh, stream, classify, mark, retry
//!
//! One streaming request runs up to `MAX_ATTEMPTS` accounts. An attempt
//! whose first event is a retryable failure (rate limit, quota, upstream
//! 5xx) closes the stream, marks the account, and moves on; any other first
//! event commits the attempt and everything after it is forwarded verbatim
//! as it arrives. Every attempt enqueues exactly one request log, success
//! or error.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::accounts::AccountsRepository;
use crate::auth::AuthManager;
use crate::balancer::{LoadBalancer, PERMANENT_FAILURE_CODES};
use crate::config::Config;
use crate::crypto::TokenEncryptor;
use crate::db::models::Account;
use crate::metrics;
use crate::openai::models::{
    apply_error_metadata, normalize_error_code, openai_error, parse_error_envelope, parse_event,
    response_failed_event, OpenAiError, ResponseUsage,
};
use crate::openai::requests::{ResponsesCompactRequest, ResponsesRequest};
use crate::request_logs::{RequestLogBuffer, RequestLogCreate};
use crate::sticky::sticky_key_fingerprint;
use crate::upstream::client::filter_inbound_headers;
use crate::upstream::sse::format_event;
use crate::upstream::{ProxyResponseError, UpstreamClient};

const MAX_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct ProxyService {
    balancer: Arc<LoadBalancer>,
    auth: AuthManager,
    upstream: UpstreamClient,
    encryptor: Arc<TokenEncryptor>,
    buffer: RequestLogBuffer,
    accounts: AccountsRepository,
    config: Arc<Config>,
}

/// Everything logged about one attempt.
struct AttemptLog {
    account_id: String,
    request_id: String,
    model: String,
    reasoning_effort: Option<String>,
    prompt_cache_key_hash: Option<String>,
    started: Instant,
    usage: Option<ResponseUsage>,
    status: &'static str,
    error_code: Option<String>,
    error_message: Option<String>,
}

impl AttemptLog {
    fn new(
        account_id: &str,
        request_id: &str,
        model: &str,
        reasoning_effort: Option<&str>,
        prompt_cache_key_hash: Option<&str>,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            request_id: request_id.to_string(),
            model: model.to_string(),
            reasoning_effort: reasoning_effort.map(str::to_string),
            prompt_cache_key_hash: prompt_cache_key_hash.map(str::to_string),
            started: Instant::now(),
            usage: None,
            status: "success",
            error_code: None,
            error_message: None,
        }
    }

    fn fail(&mut self, code: &str, message: Option<&str>) {
        self.status = "error";
        self.error_code = Some(code.to_string());
        self.error_message = message.map(str::to_string);
    }

    /// Observe one forwarded event for token accounting and error state.
    fn observe(&mut self, block: &str) {
        let Some(event) = parse_event(block) else { return };
        if event.is_failure() {
            let detail = event.error_detail().cloned().unwrap_or_default();
            let code = normalize_error_code(detail.code.as_deref(), detail.kind.as_deref());
            self.fail(&code, detail.message.as_deref());
        }
        if let Some(usage) = event.usage() {
            self.usage = Some(usage.clone());
        }
    }

    fn into_entry(self) -> RequestLogCreate {
        let latency_ms = self.started.elapsed().as_millis() as i64;
        let usage = self.usage.unwrap_or_default();
        RequestLogCreate {
            account_id: self.account_id,
            request_id: self.request_id,
            model: self.model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cached_input_tokens: usage.cached_input_tokens(),
            reasoning_tokens: usage.reasoning_tokens(),
            reasoning_effort: self.reasoning_effort,
            latency_ms: Some(latency_ms),
            status: self.status.to_string(),
            error_code: self.error_code,
            error_message: self.error_message,
            prompt_cache_key_hash: self.prompt_cache_key_hash,
            requested_at: Utc::now(),
        }
    }
}

impl ProxyService {
    pub fn new(
        balancer: Arc<LoadBalancer>,
        auth: AuthManager,
        upstream: UpstreamClient,
        encryptor: Arc<TokenEncryptor>,
        buffer: RequestLogBuffer,
        accounts: AccountsRepository,
        config: Arc<Config>,
    ) -> Self {
        Self {
            balancer,
            auth,
            upstream,
            encryptor,
            buffer,
            accounts,
            config,
        }
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Stream a responses call with account retry.
    ///
    /// Items are SSE event blocks. With `propagate_http_errors`, an upstream
    /// HTTP error that exhausts its options surfaces as `Err` so the HTTP
    /// layer can mirror the status code; otherwise it becomes a terminal
    /// `response.failed` block.
    pub fn stream_responses(
        &self,
        payload: ResponsesRequest,
        headers: HashMap<String, String>,
        request_id: String,
        propagate_http_errors: bool,
        forced_account_id: Option<String>,
    ) -> impl Stream<Item = Result<String, ProxyResponseError>> + Send + 'static {
        let service = self.clone();
        let headers = filter_inbound_headers(&headers);
        async_stream::stream! {
            let model = payload.model().to_string();
            let reasoning_effort = payload.reasoning_effort().map(str::to_string);
            let sticky_key = payload.prompt_cache_key().map(sticky_key_fingerprint);
            let seed = request_seed(&request_id);
            let body = payload.to_payload();

            let forced = forced_account_id.is_some();
            let max_attempts = if forced { 1 } else { MAX_ATTEMPTS };

            'attempts: for attempt_index in 0..max_attempts {
                let retryable_attempt = attempt_index + 1 < max_attempts;

                // Pick an account: the forced id, or the selector's best.
                let account = if let Some(forced_id) = &forced_account_id {
                    match service.accounts.get(forced_id).await {
                        Ok(Some(account)) => account,
                        _ => {
                            yield Ok(format_event(&response_failed_event(
                                "no_accounts",
                                &format!("Account '{forced_id}' not found"),
                                "server_error",
                                Some(&request_id),
                                None,
                            )));
                            return;
                        }
                    }
                } else {
                    let selection = match service
                        .balancer
                        .select_account(sticky_key.as_deref(), false, seed)
                        .await
                    {
                        Ok(selection) => selection,
                        Err(error) => {
                            tracing::error!(%error, "Account selection failed");
                            yield Ok(format_event(&response_failed_event(
                                "upstream_error",
                                "Account selection failed",
                                "server_error",
                                Some(&request_id),
                                None,
                            )));
                            return;
                        }
                    };
                    match selection.account {
                        Some(account) => account,
                        None => {
                            let code = selection.reason.unwrap_or("no_accounts");
                            metrics::record_proxy_error(code);
                            yield Ok(format_event(&response_failed_event(
                                code,
                                selection
                                    .error_message
                                    .as_deref()
                                    .unwrap_or("No active accounts available"),
                                "server_error",
                                Some(&request_id),
                                None,
                            )));
                            return;
                        }
                    }
                };

                let mut account = match service.auth.ensure_fresh(account, false).await {
                    Ok(account) => account,
                    Err(refresh_error) => {
                        tracing::warn!(
                            request_id = %request_id,
                            code = %refresh_error.code,
                            permanent = refresh_error.permanent,
                            "Token refresh failed"
                        );
                        metrics::record_proxy_error(&refresh_error.code);
                        continue 'attempts;
                    }
                };

                // Open the stream, replaying once through a forced refresh
                // when the upstream rejects the access token outright.
                let mut forced_refresh_done = false;
                let (first, mut upstream, mut log) = loop {
                    let mut log = AttemptLog::new(
                        &account.id,
                        &request_id,
                        &model,
                        reasoning_effort.as_deref(),
                        sticky_key.as_deref(),
                    );
                    let access_token =
                        match service.encryptor.decrypt(&account.access_token_encrypted) {
                            Ok(token) => token,
                            Err(_) => {
                                log.fail("auth_refresh_failed", Some("Stored token unreadable"));
                                service.buffer.try_enqueue(log.into_entry());
                                metrics::record_proxy_request("error", "responses");
                                service.balancer.record_error(&account.id);
                                continue 'attempts;
                            }
                        };
                    let mut upstream = Box::pin(service.upstream.stream_responses(
                        body.clone(),
                        headers.clone(),
                        access_token,
                        header_account_id(&account).map(str::to_string),
                        request_id.clone(),
                        true,
                    ));
                    match upstream.next().await {
                        Some(Err(http_error))
                            if http_error.status == 401 && !forced_refresh_done =>
                        {
                            forced_refresh_done = true;
                            match service.auth.ensure_fresh(account.clone(), true).await {
                                Ok(refreshed) => {
                                    log.fail("invalid_auth", Some("Access token rejected; refreshed"));
                                    service.buffer.try_enqueue(log.into_entry());
                                    metrics::record_proxy_request("error", "responses");
                                    account = refreshed;
                                    continue;
                                }
                                Err(refresh_error) => {
                                    if refresh_error.permanent {
                                        let _ = service
                                            .balancer
                                            .mark_permanent_failure(&account, &refresh_error.code)
                                            .await;
                                    }
                                    break (Some(Err(http_error)), upstream, log);
                                }
                            }
                        }
                        first => break (first, upstream, log),
                    }
                };

                match first {
                    None => {
                        // Upstream closed before a single event.
                        service.buffer.try_enqueue(log.into_entry());
                        metrics::record_proxy_request("success", "responses");
                        return;
                    }
                    Some(Err(http_error)) => {
                        let detail = parse_error_envelope(&http_error.payload);
                        let code = normalize_error_code(
                            detail.as_ref().and_then(|d| d.code.as_deref()),
                            detail.as_ref().and_then(|d| d.kind.as_deref()),
                        );
                        log.fail(&code, detail.as_ref().and_then(|d| d.message.as_deref()));
                        service.buffer.try_enqueue(log.into_entry());
                        metrics::record_proxy_request("error", "responses");
                        metrics::record_proxy_error(&code);
                        service.apply_error_marks(&account, detail.as_ref(), &code).await;

                        let retryable = is_retryable_code(&code) || http_error.status >= 500;
                        if retryable_attempt && retryable {
                            continue 'attempts;
                        }
                        if propagate_http_errors {
                            yield Err(http_error);
                            return;
                        }
                        let mut event = response_failed_event(
                            &code,
                            detail
                                .as_ref()
                                .and_then(|d| d.message.as_deref())
                                .unwrap_or("Upstream error"),
                            detail
                                .as_ref()
                                .and_then(|d| d.kind.as_deref())
                                .unwrap_or("server_error"),
                            Some(&request_id),
                            detail.as_ref().and_then(|d| d.param.as_deref()),
                        );
                        if let Some(detail) = &detail {
                            apply_error_metadata(&mut event, detail);
                        }
                        yield Ok(format_event(&event));
                        return;
                    }
                    Some(Ok(first_block)) => {
                        if let Some(event) = parse_event(&first_block) {
                            if event.is_failure() {
                                let detail = event.error_detail().cloned().unwrap_or_default();
                                let code = normalize_error_code(
                                    detail.code.as_deref(),
                                    detail.kind.as_deref(),
                                );
                                if retryable_attempt && is_retryable_code(&code) {
                                    // Close this stream; the client never
                                    // sees the failed account's events.
                                    log.fail(&code, detail.message.as_deref());
                                    service.buffer.try_enqueue(log.into_entry());
                                    metrics::record_proxy_request("error", "responses");
                                    metrics::record_proxy_error(&code);
                                    service
                                        .apply_error_marks(&account, Some(&detail), &code)
                                        .await;
                                    continue 'attempts;
                                }
                                metrics::record_proxy_error(&code);
                                service.apply_error_marks(&account, Some(&detail), &code).await;
                            }
                        }
                        log.observe(&first_block);
                        yield Ok(first_block);

                        while let Some(next) = upstream.next().await {
                            match next {
                                Ok(block) => {
                                    log.observe(&block);
                                    yield Ok(block);
                                }
                                Err(http_error) => {
                                    // HTTP status is settled before the first
                                    // event; nothing to do but end the body.
                                    yield Err(http_error);
                                    break;
                                }
                            }
                        }

                        metrics::record_proxy_request(log.status, "responses");
                        service.buffer.try_enqueue(log.into_entry());
                        return;
                    }
                }
            }

            metrics::record_proxy_error("no_accounts");
            yield Ok(format_event(&response_failed_event(
                "no_accounts",
                "No available accounts after retries",
                "server_error",
                Some(&request_id),
                None,
            )));
        }
    }

    /// Non-streaming compact call: one upstream HTTP round trip. The sticky
    /// mapping is reallocated: compaction rebinds the thread to the
    /// currently best account.
    pub async fn compact_responses(
        &self,
        payload: ResponsesCompactRequest,
        headers: HashMap<String, String>,
        request_id: String,
    ) -> Result<Value, ProxyResponseError> {
        let headers = filter_inbound_headers(&headers);
        let sticky_key = payload.prompt_cache_key().map(sticky_key_fingerprint);
        let seed = request_seed(&request_id);

        let selection = self
            .balancer
            .select_account(sticky_key.as_deref(), true, seed)
            .await
            .map_err(|error| {
                tracing::error!(%error, "Account selection failed");
                ProxyResponseError {
                    status: 500,
                    payload: openai_error("upstream_error", "Account selection failed", "server_error"),
                }
            })?;
        let Some(account) = selection.account else {
            let code = selection.reason.unwrap_or("no_accounts");
            metrics::record_proxy_error(code);
            return Err(ProxyResponseError {
                status: 503,
                payload: openai_error(
                    code,
                    selection
                        .error_message
                        .as_deref()
                        .unwrap_or("No active accounts available"),
                    "server_error",
                ),
            });
        };

        let account = self.ensure_fresh_or_mark(account, false).await?;

        let log = AttemptLog::new(
            &account.id,
            &request_id,
            payload.model(),
            payload.reasoning_effort(),
            sticky_key.as_deref(),
        );
        match self.call_compact(&account, &payload, &headers, &request_id).await {
            Ok(value) => {
                self.buffer.try_enqueue(log.into_entry());
                metrics::record_proxy_request("success", "compact");
                Ok(value)
            }
            Err(error) if error.status == 401 => {
                // One forced refresh, one replay.
                let account = self.ensure_fresh_or_mark(account, true).await?;
                match self.call_compact(&account, &payload, &headers, &request_id).await {
                    Ok(value) => {
                        self.buffer.try_enqueue(log.into_entry());
                        metrics::record_proxy_request("success", "compact");
                        Ok(value)
                    }
                    Err(error) => self.finish_compact_error(&account, log, error).await,
                }
            }
            Err(error) => self.finish_compact_error(&account, log, error).await,
        }
    }

    async fn call_compact(
        &self,
        account: &Account,
        payload: &ResponsesCompactRequest,
        headers: &HashMap<String, String>,
        request_id: &str,
    ) -> Result<Value, ProxyResponseError> {
        let access_token = self.encryptor.decrypt(&account.access_token_encrypted).map_err(|_| {
            ProxyResponseError {
                status: 500,
                payload: openai_error("auth_refresh_failed", "Stored token unreadable", "server_error"),
            }
        })?;
        self.upstream
            .compact_responses(
                payload.to_payload(),
                headers.clone(),
                &access_token,
                header_account_id(account),
                request_id,
            )
            .await
    }

    async fn finish_compact_error(
        &self,
        account: &Account,
        mut log: AttemptLog,
        error: ProxyResponseError,
    ) -> Result<Value, ProxyResponseError> {
        let detail = parse_error_envelope(&error.payload);
        let code = normalize_error_code(
            detail.as_ref().and_then(|d| d.code.as_deref()),
            detail.as_ref().and_then(|d| d.kind.as_deref()),
        );
        log.fail(&code, detail.as_ref().and_then(|d| d.message.as_deref()));
        self.buffer.try_enqueue(log.into_entry());
        metrics::record_proxy_request("error", "compact");
        metrics::record_proxy_error(&code);
        self.apply_error_marks(account, detail.as_ref(), &code).await;
        Err(error)
    }

    async fn ensure_fresh_or_mark(
        &self,
        account: Account,
        force: bool,
    ) -> Result<Account, ProxyResponseError> {
        match self.auth.ensure_fresh(account.clone(), force).await {
            Ok(account) => Ok(account),
            Err(refresh_error) => {
                if refresh_error.permanent {
                    let _ = self
                        .balancer
                        .mark_permanent_failure(&account, &refresh_error.code)
                        .await;
                }
                Err(ProxyResponseError {
                    status: 401,
                    payload: openai_error(
                        "auth_refresh_failed",
                        "Could not refresh account credentials",
                        "server_error",
                    ),
                })
            }
        }
    }

    /// Route a classified error code to the matching lifecycle mark.
    async fn apply_error_marks(&self, account: &Account, detail: Option<&OpenAiError>, code: &str) {
        let result = if is_rate_limit_code(code) {
            self.balancer.mark_rate_limit(account, detail).await
        } else if is_quota_code(code) {
            self.balancer.mark_quota_exceeded(account, detail).await
        } else if PERMANENT_FAILURE_CODES.contains(&code) {
            self.balancer.mark_permanent_failure(account, code).await
        } else {
            self.balancer.record_error(&account.id);
            Ok(())
        };
        if let Err(error) = result {
            tracing::warn!(account_id = %account.id, %error, "Failed to persist account mark");
        }
    }
}

/// Rate limiting classes the retry loop recognizes.
pub fn is_rate_limit_code(code: &str) -> bool {
    matches!(code, "rate_limit_exceeded" | "usage_limit_reached")
}

pub fn is_quota_code(code: &str) -> bool {
    matches!(code, "insufficient_quota" | "usage_not_included" | "quota_exceeded")
}

fn is_server_code(code: &str) -> bool {
    code.starts_with("server_") || code.ends_with("_server_error")
}

/// Whether the next attempt may use a different account.
pub fn is_retryable_code(code: &str) -> bool {
    is_rate_limit_code(code) || is_quota_code(code) || is_server_code(code)
}

fn header_account_id(account: &Account) -> Option<&str> {
    account
        .chatgpt_account_id
        .as_deref()
        .filter(|id| !id.is_empty())
}

/// Deterministic per-request seed for the selector's weighted draw.
fn request_seed(request_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    request_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_classes() {
        assert!(is_rate_limit_code("rate_limit_exceeded"));
        assert!(is_rate_limit_code("usage_limit_reached"));
        assert!(is_quota_code("insufficient_quota"));
        assert!(is_quota_code("usage_not_included"));
        assert!(is_quota_code("quota_exceeded"));
        assert!(is_retryable_code("server_overloaded"));
        assert!(is_retryable_code("internal_server_error"));
        assert!(!is_retryable_code("invalid_request"));
        assert!(!is_retryable_code("invalid_api_key"));
        assert!(!is_retryable_code("stream_idle_timeout"));
    }

    #[test]
    fn test_request_seed_is_deterministic() {
        assert_eq!(request_seed("req_1"), request_seed("req_1"));
        assert_ne!(request_seed("req_1"), request_seed("req_2"));
    }

    #[test]
    fn test_attempt_log_tracks_usage_and_errors() {
        let mut log = AttemptLog::new("acc_a", "req_1", "gpt-5.1", Some("high"), None);
        log.observe(
            "data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":7,\"output_tokens\":2}}}\n\n",
        );
        let entry = log.into_entry();
        assert_eq!(entry.status, "success");
        assert_eq!(entry.input_tokens, Some(7));
        assert_eq!(entry.output_tokens, Some(2));
        assert_eq!(entry.reasoning_effort.as_deref(), Some("high"));

        let mut log = AttemptLog::new("acc_a", "req_1", "gpt-5.1", None, None);
        log.observe(
            "data: {\"type\":\"response.failed\",\"response\":{\"error\":{\"code\":\"quota_exceeded\",\"message\":\"done\"}}}\n\n",
        );
        let entry = log.into_entry();
        assert_eq!(entry.status, "error");
        assert_eq!(entry.error_code.as_deref(), Some("quota_exceeded"));
        assert_eq!(entry.error_message.as_deref(), Some("done"));
    }
}
