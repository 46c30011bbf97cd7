//! Row types shared by the repositories

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account lifecycle state.
///
/// `RateLimited` and `QuotaExceeded` are informational: the effective gate is
/// `max(status_reset_at, usage reset_at)` compared to now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    RateLimited,
    QuotaExceeded,
    Paused,
    Deactivated,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::RateLimited => "rate_limited",
            AccountStatus::QuotaExceeded => "quota_exceeded",
            AccountStatus::Paused => "paused",
            AccountStatus::Deactivated => "deactivated",
        }
    }
}

/// A pooled upstream credential.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: String,
    pub chatgpt_account_id: Option<String>,
    pub email: String,
    pub plan_type: String,
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: String,
    pub id_token_encrypted: String,
    pub last_refresh: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: AccountStatus,
    /// Epoch seconds after which the current block is stale
    pub status_reset_at: Option<i64>,
    pub deactivation_reason: Option<String>,
}

/// Append-only usage time-series row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UsageSnapshot {
    pub id: i64,
    pub account_id: String,
    pub recorded_at: DateTime<Utc>,
    pub window: Option<String>,
    pub used_percent: f64,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub reset_at: Option<i64>,
    pub window_minutes: Option<i64>,
    pub credits_has: Option<bool>,
    pub credits_unlimited: Option<bool>,
    pub credits_balance: Option<f64>,
}

/// One persisted proxy attempt.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RequestLog {
    pub id: i64,
    pub account_id: String,
    pub request_id: String,
    pub requested_at: DateTime<Utc>,
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
}

/// Sticky `key -> account_id` row (db backend).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StickySessionRow {
    pub key: String,
    pub account_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Decoded single-row dashboard settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardSettings {
    pub sticky_threads_enabled: bool,
    pub prefer_earlier_reset_accounts: bool,
    pub pinned_account_ids: Vec<String>,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            sticky_threads_enabled: true,
            prefer_earlier_reset_accounts: false,
            pinned_account_ids: Vec::new(),
        }
    }
}
