use crate::application::{
    ArtifactService, CheckoutSettings, EntitlementService, IdentityResolver, PaymentReconciler,
};
use crate::infrastructure::{
    AppConfig, PostgresAccountRepository, PostgresArtifactRepository,
    PostgresFingerprintRepository, PostgresPaymentRepository, PostgresUsageRepository,
    StripeClient,
};
use anyhow::Context;
use sqlx::PgPool;
use std::sync::Arc;

pub type IdentityResolverType =
    IdentityResolver<PostgresFingerprintRepository, PostgresAccountRepository>;

pub type EntitlementServiceType = EntitlementService<
    PostgresAccountRepository,
    PostgresUsageRepository,
    PostgresPaymentRepository,
>;

pub type PaymentReconcilerType =
    PaymentReconciler<PostgresAccountRepository, PostgresPaymentRepository, StripeClient>;

pub type ArtifactServiceType = ArtifactService<PostgresArtifactRepository>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub identity: Arc<IdentityResolverType>,
    pub entitlements: Arc<EntitlementServiceType>,
    pub reconciler: Arc<PaymentReconcilerType>,
    pub artifacts: Arc<ArtifactServiceType>,
    pub api_token: Arc<str>,
    pub webhook_secret: Arc<str>,
    pub webhook_tolerance_secs: i64,
}

/// Build full state from config + an existing pool.
///
/// Intended for embedding into a larger service that already manages a `PgPool`.
pub async fn build_state_with_pool(
    config: AppConfig,
    pool: PgPool,
    run_migrations: bool,
) -> anyhow::Result<AppState> {
    if run_migrations {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("run migrations")?;
    }

    let policy = config.quota_policy();
    let history = config.history_policy().context("anonymous_history")?;

    let stripe = Arc::new(
        StripeClient::new(&config.stripe_secret_key, config.stripe_api_base.clone())
            .context("init Stripe client")?,
    );

    let fingerprint_repo = Arc::new(PostgresFingerprintRepository::new(pool.clone()));
    let account_repo = Arc::new(PostgresAccountRepository::new(pool.clone()));
    let usage_repo = Arc::new(PostgresUsageRepository::new(pool.clone()));
    let payment_repo = Arc::new(PostgresPaymentRepository::new(pool.clone()));
    let artifact_repo = Arc::new(PostgresArtifactRepository::new(pool.clone()));

    let identity = Arc::new(IdentityResolver::new(
        fingerprint_repo,
        account_repo.clone(),
    ));

    let entitlements = Arc::new(EntitlementService::new(
        account_repo.clone(),
        usage_repo,
        payment_repo.clone(),
        policy,
        history,
    ));

    let base_url = config.app_base_url.trim_end_matches('/');
    let settings = CheckoutSettings {
        pro_price_id: config.stripe_pro_price_id.clone(),
        lifetime_price_id: config.stripe_lifetime_price_id.clone(),
        action_price_cents: config.action_price_cents,
        currency: config.currency.clone(),
        success_url: format!(
            "{}/payment/success?session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        ),
        cancel_url: format!("{}/payment/cancelled", base_url),
    };

    let reconciler = Arc::new(PaymentReconciler::new(
        account_repo,
        payment_repo,
        stripe,
        settings,
    ));

    let artifacts = Arc::new(ArtifactService::new(
        artifact_repo,
        config.max_artifacts_per_parent,
    ));

    Ok(AppState {
        pool,
        identity,
        entitlements,
        reconciler,
        artifacts,
        api_token: Arc::from(config.api_token.as_str()),
        webhook_secret: Arc::from(config.stripe_webhook_secret.as_str()),
        webhook_tolerance_secs: config.webhook_tolerance_secs,
    })
}

/// Build state for the standalone server.
///
/// Creates the `PgPool`, runs migrations, and wires repositories/services.
pub async fn build_state_from_env(config: AppConfig) -> anyhow::Result<AppState> {
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("connect database")?;
    build_state_with_pool(config, pool, true).await
}
