//! HTTP server support (standalone + embeddable).
//!
//! - **Standalone**: `cv-entitlements-server` binary calls `run()`
//! - **Embedded**: host Axum app calls `router(state)` (and may nest it)

mod http;
mod http_auth;
mod http_errors;
mod http_parse;
mod http_types;
mod state;

pub use http::router;
pub use state::{
    build_state_from_env, build_state_with_pool, AppState, ArtifactServiceType,
    EntitlementServiceType, IdentityResolverType, PaymentReconcilerType,
};

use crate::infrastructure::AppConfig;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Every 15 minutes.
const SESSION_SWEEP_SCHEDULE: &str = "0 */15 * * * *";

/// Standalone entrypoint for the `cv-entitlements-server` binary.
pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("cv_entitlements=info,tower_http=info")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env().context("load config")?;
    let state = build_state_from_env(config.clone()).await?;

    let _sweep = start_session_sweep(
        state.reconciler.clone(),
        chrono::Duration::hours(config.checkout_session_ttl_hours),
    )
    .await?;

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .context("parse listen address")?;
    let listener = TcpListener::bind(addr).await.context("bind listener")?;

    info!(
        host = %config.server_host,
        port = config.server_port,
        history = %config.anonymous_history,
        free_action_limit = config.free_action_limit,
        "Server running"
    );
    info!(
        docs = %format!("http://{}:{}/docs", config.server_host, config.server_port),
        "API docs"
    );

    let app = router(state);
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}

/// Periodically expires checkout sessions abandoned in CREATED.
async fn start_session_sweep(
    reconciler: Arc<PaymentReconcilerType>,
    ttl: chrono::Duration,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow::anyhow!("create scheduler: {:?}", e))?;

    let job = Job::new_async(SESSION_SWEEP_SCHEDULE, move |_id, _scheduler| {
        let reconciler = reconciler.clone();
        Box::pin(async move {
            if let Err(e) = reconciler.expire_stale_sessions(ttl).await {
                error!(error = %e, "Checkout session sweep failed");
            }
        })
    })
    .map_err(|e| anyhow::anyhow!("create sweep job: {:?}", e))?;

    scheduler
        .add(job)
        .await
        .map_err(|e| anyhow::anyhow!("schedule sweep job: {:?}", e))?;
    scheduler
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("start scheduler: {:?}", e))?;

    info!(schedule = SESSION_SWEEP_SCHEDULE, "Checkout session sweep scheduled");
    Ok(scheduler)
}
