//! codex-lb entry point
//!
//! Wires configuration, stores, and background workers, then serves the
//! proxy until ctrl-c. Shutdown stops the usage refresher, drains the
//! request-log buffer, and closes the pools.

use anyhow::Result;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use codex_lb::config::{Config, SelectionStrategy, StickyBackend};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codex_lb=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    log_startup(&config);

    let app = codex_lb::build_app(config).await?;
    let flush_handle = app.flush_scheduler.start();
    let refresher_enabled = app.state.config.usage_refresh_enabled;
    let refresher_handle = refresher_enabled.then(|| app.refresher.start());

    let router = codex_lb::proxy::api::router()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(app.state.clone());

    let addr = format!("0.0.0.0:{}", app.state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("codex-lb listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    if let Some(handle) = refresher_handle {
        app.refresher.stop();
        let _ = handle.await;
    }
    app.flush_scheduler.stop();
    let _ = flush_handle.await;
    app.db.close().await;
    Ok(())
}

fn log_startup(config: &Config) {
    let strategy = match config.proxy_selection_strategy {
        SelectionStrategy::Usage => "usage",
        SelectionStrategy::WastePressure => "waste_pressure",
    };
    let sticky = match config.sticky_sessions_backend {
        StickyBackend::Memory => "memory",
        StickyBackend::Db => "db",
    };
    tracing::info!(
        upstream = %config.upstream_base_url,
        store = %config.database_url,
        split_accounts = config.has_split_accounts_db(),
        sticky_backend = sticky,
        selection_strategy = strategy,
        usage_refresh = config.usage_refresh_enabled,
        image_inlining = config.image_inline_fetch_enabled,
        "Starting codex-lb"
    );
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
