//! Configuration for codex-lb
//!
//! Everything is injected via `CODEX_LB_*` environment variables at runtime
//! (a `.env` file is honored when present). The source code contains no
//! secrets; account tokens are encrypted at rest with a key file.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Account selection strategy for the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Prefer the account with the lowest primary usage.
    Usage,
    /// Prefer the account that must burn the most credits before reset.
    WastePressure,
}

/// Where sticky `key -> account_id` mappings live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StickyBackend {
    /// Per-process LRU; fastest, lost on restart.
    Memory,
    /// UPSERT rows in the main store; survives restarts and multiple workers.
    Db,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on
    pub port: u16,

    /// Main store (usage history, request logs, sticky sessions, settings)
    pub database_url: String,

    /// Optional split store for accounts; falls back to `database_url`
    pub accounts_database_url: Option<String>,

    /// Upstream responses API base, e.g. https://chatgpt.com/backend-api
    pub upstream_base_url: String,

    /// OAuth token endpoint base
    pub auth_base_url: String,

    /// OAuth client id used for refresh_token grants
    pub oauth_client_id: String,

    /// TCP connect timeout towards the upstream
    pub upstream_connect_timeout: Duration,

    /// Abort a stream after this long without a single byte
    pub stream_idle_timeout: Duration,

    /// Fail a stream when one SSE event exceeds this many bytes
    pub max_sse_event_bytes: usize,

    /// Total timeout for one token refresh call
    pub token_refresh_timeout: Duration,

    /// Timeout for one upstream usage fetch
    pub usage_fetch_timeout: Duration,

    /// Periodic usage polling
    pub usage_refresh_enabled: bool,
    pub usage_refresh_interval: Duration,
    pub usage_refresh_fetch_concurrency: usize,

    /// File holding the base64-encoded 32-byte AES-256-GCM key
    pub encryption_key_file: PathBuf,

    /// Inline remote `input_image` URLs as data: URLs before forwarding
    pub image_inline_fetch_enabled: bool,
    pub image_inline_allowed_hosts: Vec<String>,
    pub image_inline_max_bytes: usize,

    /// Sticky session storage
    pub sticky_sessions_backend: StickyBackend,
    pub sticky_sessions_memory_maxsize: u64,
    pub sticky_sessions_memory_ttl: Duration,

    /// Selection snapshot TTL; the snapshot is also invalidated on marks
    pub proxy_snapshot_ttl: Duration,

    /// Scoring strategy
    pub proxy_selection_strategy: SelectionStrategy,

    /// Request log buffering
    pub request_logs_buffer_enabled: bool,
    pub request_logs_buffer_maxsize: usize,
    pub request_logs_flush_interval: Duration,
    pub request_logs_flush_max_batch: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let home = default_home_dir();

        let database_url = var_or("CODEX_LB_DATABASE_URL", || {
            format!("sqlite:{}", home.join("store.db").display())
        });
        let accounts_database_url = std::env::var("CODEX_LB_ACCOUNTS_DATABASE_URL")
            .ok()
            .filter(|v| !v.is_empty());
        if accounts_database_url.as_deref() == Some(database_url.as_str()) {
            return Err(Error::Configuration(
                "CODEX_LB_ACCOUNTS_DATABASE_URL must differ from CODEX_LB_DATABASE_URL".into(),
            ));
        }

        Ok(Self {
            port: parse_var("CODEX_LB_PORT", 8080_u16)?,
            database_url,
            accounts_database_url,
            upstream_base_url: var_or("CODEX_LB_UPSTREAM_BASE_URL", || {
                "https://chatgpt.com/backend-api".to_string()
            })
            .trim_end_matches('/')
            .to_string(),
            auth_base_url: var_or("CODEX_LB_AUTH_BASE_URL", || {
                "https://auth.openai.com".to_string()
            })
            .trim_end_matches('/')
            .to_string(),
            oauth_client_id: var_or("CODEX_LB_OAUTH_CLIENT_ID", || {
                "app_EMoamEEZ73f0CkXaXp7hrann".to_string()
            }),
            upstream_connect_timeout: Duration::from_secs_f64(parse_var(
                "CODEX_LB_UPSTREAM_CONNECT_TIMEOUT_SECONDS",
                30.0_f64,
            )?),
            stream_idle_timeout: Duration::from_secs_f64(parse_var(
                "CODEX_LB_STREAM_IDLE_TIMEOUT_SECONDS",
                300.0_f64,
            )?),
            max_sse_event_bytes: parse_var("CODEX_LB_MAX_SSE_EVENT_BYTES", 2 * 1024 * 1024_usize)?,
            token_refresh_timeout: Duration::from_secs_f64(parse_var(
                "CODEX_LB_TOKEN_REFRESH_TIMEOUT_SECONDS",
                30.0_f64,
            )?),
            usage_fetch_timeout: Duration::from_secs_f64(parse_var(
                "CODEX_LB_USAGE_FETCH_TIMEOUT_SECONDS",
                10.0_f64,
            )?),
            usage_refresh_enabled: parse_var("CODEX_LB_USAGE_REFRESH_ENABLED", true)?,
            usage_refresh_interval: Duration::from_secs(parse_var(
                "CODEX_LB_USAGE_REFRESH_INTERVAL_SECONDS",
                60_u64,
            )?),
            usage_refresh_fetch_concurrency: parse_var(
                "CODEX_LB_USAGE_REFRESH_FETCH_CONCURRENCY",
                20_usize,
            )?
            .max(1),
            encryption_key_file: std::env::var("CODEX_LB_ENCRYPTION_KEY_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| home.join("encryption.key")),
            image_inline_fetch_enabled: parse_var("CODEX_LB_IMAGE_INLINE_FETCH_ENABLED", false)?,
            image_inline_allowed_hosts: parse_host_list(
                std::env::var("CODEX_LB_IMAGE_INLINE_ALLOWED_HOSTS").ok(),
            ),
            image_inline_max_bytes: parse_var(
                "CODEX_LB_IMAGE_INLINE_MAX_BYTES",
                8 * 1024 * 1024_usize,
            )?,
            sticky_sessions_backend: match var_or("CODEX_LB_STICKY_SESSIONS_BACKEND", || {
                "memory".to_string()
            })
            .to_lowercase()
            .as_str()
            {
                "memory" => StickyBackend::Memory,
                "db" => StickyBackend::Db,
                other => {
                    return Err(Error::Configuration(format!(
                        "CODEX_LB_STICKY_SESSIONS_BACKEND must be 'memory' or 'db', got '{other}'"
                    )))
                }
            },
            sticky_sessions_memory_maxsize: parse_var(
                "CODEX_LB_STICKY_SESSIONS_MEMORY_MAXSIZE",
                10_000_u64,
            )?,
            sticky_sessions_memory_ttl: Duration::from_secs_f64(parse_var(
                "CODEX_LB_STICKY_SESSIONS_MEMORY_TTL_SECONDS",
                24.0 * 60.0 * 60.0,
            )?),
            proxy_snapshot_ttl: Duration::from_secs_f64(parse_var(
                "CODEX_LB_PROXY_SNAPSHOT_TTL_SECONDS",
                1.0_f64,
            )?),
            proxy_selection_strategy: match var_or("CODEX_LB_PROXY_SELECTION_STRATEGY", || {
                "waste_pressure".to_string()
            })
            .to_lowercase()
            .as_str()
            {
                "usage" => SelectionStrategy::Usage,
                "waste_pressure" => SelectionStrategy::WastePressure,
                other => {
                    return Err(Error::Configuration(format!(
                        "CODEX_LB_PROXY_SELECTION_STRATEGY must be 'usage' or 'waste_pressure', got '{other}'"
                    )))
                }
            },
            request_logs_buffer_enabled: parse_var("CODEX_LB_REQUEST_LOGS_BUFFER_ENABLED", true)?,
            request_logs_buffer_maxsize: parse_var(
                "CODEX_LB_REQUEST_LOGS_BUFFER_MAXSIZE",
                5000_usize,
            )?,
            request_logs_flush_interval: Duration::from_secs_f64(parse_var(
                "CODEX_LB_REQUEST_LOGS_FLUSH_INTERVAL_SECONDS",
                0.5_f64,
            )?),
            request_logs_flush_max_batch: parse_var(
                "CODEX_LB_REQUEST_LOGS_FLUSH_MAX_BATCH",
                200_usize,
            )?,
        })
    }

    /// Whether accounts live in their own store.
    pub fn has_split_accounts_db(&self) -> bool {
        self.accounts_database_url.is_some()
    }
}

fn default_home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".codex-lb"))
        .unwrap_or_else(|_| PathBuf::from("./codex-lb-data"))
}

fn var_or(name: &str, default: impl FnOnce() -> String) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(default)
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| Error::Configuration(format!("Invalid value for {name}: '{raw}'"))),
        _ => Ok(default),
    }
}

fn parse_host_list(raw: Option<String>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(|entry| entry.trim().to_lowercase().trim_end_matches('.').to_string())
            .filter(|entry| !entry.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_list() {
        let hosts = parse_host_list(Some("CDN.Example.com, images.example.org. ,,".to_string()));
        assert_eq!(hosts, vec!["cdn.example.com", "images.example.org"]);
        assert!(parse_host_list(None).is_empty());
    }

    #[test]
    fn test_parse_var_falls_back_to_default() {
        std::env::remove_var("CODEX_LB_TEST_UNSET");
        let value: u16 = parse_var("CODEX_LB_TEST_UNSET", 42).unwrap();
        assert_eq!(value, 42);
    }
}
