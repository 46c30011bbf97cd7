//! codex-lb: multi-account load balancer and reverse proxy for the Codex
//! responses API
//!
//! A fleet of accounts (OAuth tokens, plan type, two usage windows) is
//! pooled behind one endpoint. Requests are routed to the best-scoring
//! eligible account, streamed back as SSE, logged, metered, and used to
//! drive account status transitions without operator intervention.

pub mod accounts;
pub mod auth;
pub mod balancer;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod metrics;
pub mod openai;
pub mod proxy;
pub mod request_logs;
pub mod settings;
pub mod sticky;
pub mod upstream;
pub mod usage;

use std::sync::Arc;

use crate::accounts::AccountsRepository;
use crate::auth::AuthManager;
use crate::balancer::LoadBalancer;
use crate::config::{Config, StickyBackend};
use crate::crypto::TokenEncryptor;
use crate::db::Database;
use crate::error::Result;
use crate::proxy::status::StatusService;
use crate::proxy::ProxyService;
use crate::request_logs::{RequestLogBuffer, RequestLogsFlushScheduler, RequestLogsRepository};
use crate::settings::SettingsRepository;
use crate::sticky::{DbStickyStore, MemoryStickyStore, StickyStore};
use crate::upstream::UpstreamClient;
use crate::usage::refresher::UsageRefresher;
use crate::usage::repository::UsageRepository;

/// Shared application state behind the HTTP router.
pub struct AppState {
    pub service: ProxyService,
    pub status: StatusService,
    pub settings: SettingsRepository,
    pub config: Arc<Config>,
}

/// Fully wired application: state plus the background workers the embedder
/// starts and stops.
pub struct App {
    pub state: Arc<AppState>,
    pub flush_scheduler: Arc<RequestLogsFlushScheduler>,
    pub refresher: Arc<UsageRefresher>,
    pub db: Database,
}

/// Wire every component from configuration. Nothing is spawned here; the
/// caller starts the flush scheduler and refresher.
pub async fn build_app(config: Config) -> Result<App> {
    let config = Arc::new(config);
    let db = Database::connect(&config).await?;
    let encryptor = Arc::new(TokenEncryptor::from_key_file(&config.encryption_key_file)?);

    let accounts = AccountsRepository::new(&db);
    let usage = UsageRepository::new(db.main().clone());
    let settings = SettingsRepository::new(db.main().clone());
    let logs_repo = RequestLogsRepository::new(db.main().clone());

    let sticky: Arc<dyn StickyStore> = match config.sticky_sessions_backend {
        StickyBackend::Memory => Arc::new(MemoryStickyStore::new(
            config.sticky_sessions_memory_maxsize,
            config.sticky_sessions_memory_ttl,
        )),
        StickyBackend::Db => Arc::new(DbStickyStore::new(db.main().clone())),
    };

    let balancer = Arc::new(LoadBalancer::new(
        accounts.clone(),
        usage.clone(),
        Arc::clone(&sticky),
        settings.clone(),
        &config,
    ));
    let auth = AuthManager::new(accounts.clone(), Arc::clone(&encryptor), Arc::clone(&config));
    let upstream = UpstreamClient::new(Arc::clone(&config))?;

    let (buffer, buffer_rx) =
        RequestLogBuffer::new(config.request_logs_buffer_enabled, config.request_logs_buffer_maxsize);
    let flush_scheduler = RequestLogsFlushScheduler::new(
        config.request_logs_flush_interval,
        config.request_logs_flush_max_batch,
        logs_repo,
        buffer_rx,
    );

    let refresher = UsageRefresher::new(
        config.usage_refresh_interval,
        config.usage_refresh_fetch_concurrency,
        accounts.clone(),
        usage.clone(),
        upstream.clone(),
        Arc::clone(&encryptor),
    );

    let service = ProxyService::new(
        balancer,
        auth,
        upstream,
        encryptor,
        buffer,
        accounts.clone(),
        Arc::clone(&config),
    );
    let status = StatusService::new(usage, accounts);

    Ok(App {
        state: Arc::new(AppState {
            service,
            status,
            settings,
            config,
        }),
        flush_scheduler,
        refresher,
        db,
    })
}
