//! Bounded request-log queue
//!
//! Enqueue never blocks the proxy hot path: when the queue is full the entry
//! is dropped and counted. Each enqueued record is eventually persisted by
//! the flush scheduler or dropped; no ordering guarantee beyond that.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::metrics;

/// One proxy attempt, queued for persistence.
#[derive(Debug, Clone)]
pub struct RequestLogCreate {
    pub account_id: String,
    pub request_id: String,
    pub model: String,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cached_input_tokens: Option<i64>,
    pub reasoning_tokens: Option<i64>,
    pub reasoning_effort: Option<String>,
    pub latency_ms: Option<i64>,
    pub status: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub prompt_cache_key_hash: Option<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RequestLogBuffer {
    enabled: bool,
    tx: mpsc::Sender<RequestLogCreate>,
}

impl RequestLogBuffer {
    /// Build the buffer and hand back the receiver for the flush scheduler.
    pub fn new(enabled: bool, maxsize: usize) -> (Self, mpsc::Receiver<RequestLogCreate>) {
        let (tx, rx) = mpsc::channel(maxsize.max(1));
        (Self { enabled, tx }, rx)
    }

    /// Non-blocking enqueue; returns false when disabled or full.
    pub fn try_enqueue(&self, entry: RequestLogCreate) -> bool {
        if !self.enabled {
            return false;
        }
        match self.tx.try_send(entry) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(entry)) => {
                tracing::warn!(request_id = %entry.request_id, "Request log buffer full; dropping");
                metrics::record_request_log_dropped();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Pull up to `max_items` entries without waiting.
pub(crate) fn drain(
    rx: &mut mpsc::Receiver<RequestLogCreate>,
    max_items: usize,
) -> Vec<RequestLogCreate> {
    let mut items = Vec::new();
    while items.len() < max_items {
        match rx.try_recv() {
            Ok(entry) => items.push(entry),
            Err(_) => break,
        }
    }
    items
}

#[cfg(test)]
pub(crate) fn test_entry(account_id: &str, request_id: &str) -> RequestLogCreate {
    RequestLogCreate {
        account_id: account_id.to_string(),
        request_id: request_id.to_string(),
        model: "gpt-5.1".to_string(),
        input_tokens: Some(1),
        output_tokens: Some(1),
        cached_input_tokens: None,
        reasoning_tokens: None,
        reasoning_effort: None,
        latency_ms: Some(5),
        status: "success".to_string(),
        error_code: None,
        error_message: None,
        prompt_cache_key_hash: None,
        requested_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_drops_when_full() {
        let (buffer, mut rx) = RequestLogBuffer::new(true, 2);
        assert!(buffer.try_enqueue(test_entry("acc", "r1")));
        assert!(buffer.try_enqueue(test_entry("acc", "r2")));
        assert!(!buffer.try_enqueue(test_entry("acc", "r3")));

        let drained = drain(&mut rx, 10);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].request_id, "r1");
    }

    #[tokio::test]
    async fn test_disabled_buffer_rejects() {
        let (buffer, _rx) = RequestLogBuffer::new(false, 8);
        assert!(!buffer.try_enqueue(test_entry("acc", "r1")));
    }
}
