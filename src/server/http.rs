use super::http_auth::{extract_account_id, is_service_authorized};
use super::http_errors::{
    map_artifact_error, map_entitlement_error, map_identity_error, map_reconcile_error,
    map_validation_errors,
};
use super::http_parse::{
    checkout_purpose, decimal_to_cents, parse_artifact_kind, require_action_kind,
};
use super::http_types::{
    CheckEntitlementRequest, CheckoutRequest, CheckoutResponse, HealthResponse,
    RecordUsageRequest, SaveArtifactRequest, StatsQuery, UsageRecordResponse,
    VerifyCheckoutRequest,
};
use super::state::AppState;
use crate::application::{IdentityError, ReconcileOutcome, SaveArtifact};
use crate::domain::{
    ActionKind, ActionUsage, ArtifactKind, Entitlement, PlanTier, Principal, Resolution,
    SavedArtifact, UsageStats,
};
use crate::infrastructure::{parse_event, verify_webhook_signature};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::fmt::Display;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;
use validator::Validate;

type ApiResponse = (StatusCode, Json<serde_json::Value>);
type ApiResult = Result<ApiResponse, ApiResponse>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/entitlements/check", post(check_entitlement))
        .route("/usage", post(record_usage))
        .route("/usage/stats", get(usage_stats))
        .route("/payments/checkout", post(create_checkout))
        .route("/payments/verify", post(verify_checkout))
        .route("/payments/:session_id/cancel", post(cancel_checkout))
        .route("/webhooks/stripe", post(stripe_webhook))
        .route("/artifacts", post(save_artifact).get(list_artifacts))
        .route("/artifacts/:id", get(get_artifact).delete(delete_artifact))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        check_entitlement,
        record_usage,
        usage_stats,
        create_checkout,
        verify_checkout,
        cancel_checkout,
        stripe_webhook,
        save_artifact,
        list_artifacts,
        get_artifact,
        delete_artifact,
    ),
    components(
        schemas(
            HealthResponse,
            CheckEntitlementRequest,
            RecordUsageRequest,
            UsageRecordResponse,
            CheckoutRequest,
            CheckoutResponse,
            VerifyCheckoutRequest,
            SaveArtifactRequest,
            Entitlement,
            UsageStats,
            ActionUsage,
            ActionKind,
            PlanTier,
            Resolution,
            ReconcileOutcome,
            SavedArtifact,
            ArtifactKind,
        )
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Entitlements", description = "Quota checks and usage recording"),
        (name = "Payments", description = "Checkout, verification and provider webhooks"),
        (name = "Artifacts", description = "Saved CVs, cover letters and emails"),
    ),
    info(
        title = "CV Entitlements API",
        version = "0.1.0",
        description = "Usage quota, entitlement and payment reconciliation for the CV builder",
        license(name = "MIT")
    )
)]
struct ApiDoc;

fn reply((status, body): (StatusCode, serde_json::Value)) -> ApiResponse {
    (status, Json(body))
}

/// Logs server-side failures at error level, client errors at debug.
fn failure(mapped: (StatusCode, serde_json::Value), err: &dyn Display, what: &str) -> ApiResponse {
    if mapped.0.is_server_error() {
        error!(error = %err, "{}", what);
    } else {
        debug!(error = %err, status = %mapped.0, "{}", what);
    }
    reply(mapped)
}

fn require_service(state: &AppState, headers: &HeaderMap) -> Result<(), ApiResponse> {
    if is_service_authorized(headers, &state.api_token) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Missing or invalid authorization token"})),
        ))
    }
}

fn require_account(headers: &HeaderMap) -> Result<Uuid, ApiResponse> {
    extract_account_id(headers).ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Missing or invalid X-Account-Id header"})),
        )
    })
}

fn validated<T: Validate>(req: &T) -> Result<(), ApiResponse> {
    req.validate()
        .map_err(|errors| reply(map_validation_errors(&errors)))
}

async fn resolve(
    state: &AppState,
    fingerprint: &str,
    account_id: Option<Uuid>,
) -> Result<Principal, ApiResponse> {
    state
        .identity
        .resolve(fingerprint, account_id)
        .await
        .map_err(|e| failure(map_identity_error(&e), &e, "Failed to resolve identity"))
}

/// Health check endpoint
///
/// Verifies database connectivity and returns service health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse)
    )
)]
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").fetch_one(&state.pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy".to_string(),
                error: None,
            }),
        ),
        Err(e) => {
            error!(error = %e, "Health check failed: DB connectivity issue");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy".to_string(),
                    error: Some("Database connectivity failed".to_string()),
                }),
            )
        }
    }
}

/// Check whether an action is allowed
///
/// Advisory: the authoritative decision is taken when the usage is recorded.
/// Storage failures deny the action rather than erroring.
#[utoipa::path(
    post,
    path = "/entitlements/check",
    tag = "Entitlements",
    request_body = CheckEntitlementRequest,
    responses(
        (status = 200, description = "Entitlement decision", body = Entitlement),
        (status = 400, description = "Invalid fingerprint or action kind", body = Object),
        (status = 401, description = "Missing or invalid service token", body = Object)
    )
)]
async fn check_entitlement(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CheckEntitlementRequest>,
) -> ApiResult {
    require_service(&state, &headers)?;
    validated(&req)?;
    let action = require_action_kind(&req.action_kind).map_err(reply)?;

    let principal = match state.identity.resolve(&req.fingerprint, req.account_id).await {
        Ok(principal) => principal,
        Err(IdentityError::Repository(e)) => {
            error!(error = %e, "Identity lookup failed, denying");
            let tier = if req.account_id.is_some() {
                PlanTier::Freemium
            } else {
                PlanTier::Anonymous
            };
            let denied = state.entitlements.policy().fail_closed(tier);
            return Ok((StatusCode::OK, Json(serde_json::json!(denied))));
        }
        Err(e) => return Err(reply(map_identity_error(&e))),
    };

    let entitlement = state.entitlements.evaluate(&principal, action).await;
    Ok((StatusCode::OK, Json(serde_json::json!(entitlement))))
}

/// Record a completed action
///
/// Free actions take a slot from the shared free quota, atomically. Paid actions
/// must present the checkout session id of an unconsumed purchase.
#[utoipa::path(
    post,
    path = "/usage",
    tag = "Entitlements",
    request_body = RecordUsageRequest,
    responses(
        (status = 201, description = "Usage recorded", body = UsageRecordResponse),
        (status = 400, description = "Invalid request", body = Object),
        (status = 401, description = "Missing or invalid service token", body = Object),
        (status = 402, description = "Payment evidence does not cover this action", body = Object),
        (status = 409, description = "Payment evidence already used", body = Object),
        (status = 429, description = "Free quota exhausted", body = Object),
        (status = 500, description = "Failed to record usage", body = Object)
    )
)]
async fn record_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RecordUsageRequest>,
) -> ApiResult {
    require_service(&state, &headers)?;
    validated(&req)?;
    let action = require_action_kind(&req.action_kind).map_err(reply)?;
    let principal = resolve(&state, &req.fingerprint, req.account_id).await?;
    let amount_paid_cents = req.amount_paid.map(decimal_to_cents).unwrap_or(0);

    let record = state
        .entitlements
        .record(
            &principal,
            action,
            amount_paid_cents,
            req.payment_evidence.as_deref(),
        )
        .await
        .map_err(|e| failure(map_entitlement_error(&e), &e, "Failed to record usage"))?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!(UsageRecordResponse::from(record))),
    ))
}

/// Usage statistics for a principal
#[utoipa::path(
    get,
    path = "/usage/stats",
    tag = "Entitlements",
    params(StatsQuery),
    responses(
        (status = 200, description = "Usage statistics", body = UsageStats),
        (status = 400, description = "Invalid fingerprint", body = Object),
        (status = 401, description = "Missing or invalid service token", body = Object),
        (status = 500, description = "Failed to read usage", body = Object)
    )
)]
async fn usage_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> ApiResult {
    require_service(&state, &headers)?;
    validated(&query)?;
    let principal = resolve(&state, &query.fingerprint, query.account_id).await?;

    let stats = state
        .entitlements
        .stats(&principal)
        .await
        .map_err(|e| failure(map_entitlement_error(&e), &e, "Failed to read usage stats"))?;

    Ok((StatusCode::OK, Json(serde_json::json!(stats))))
}

/// Start a Stripe checkout
///
/// `purpose = plan` buys PRO (subscription) or LIFETIME (one-time) and needs an
/// account. `purpose = action` buys a single action; anonymous users may only buy
/// downloads.
#[utoipa::path(
    post,
    path = "/payments/checkout",
    tag = "Payments",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Checkout session created", body = CheckoutResponse),
        (status = 400, description = "Invalid purpose, plan or action kind", body = Object),
        (status = 401, description = "Account required", body = Object),
        (status = 429, description = "Rate limited by Stripe", body = Object),
        (status = 500, description = "Failed to create checkout", body = Object)
    )
)]
async fn create_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult {
    require_service(&state, &headers)?;
    validated(&req)?;
    let principal = resolve(&state, &req.fingerprint, req.account_id).await?;
    let purpose = checkout_purpose(&req, &principal).map_err(reply)?;

    let link = state
        .reconciler
        .start_checkout(purpose)
        .await
        .map_err(|e| failure(map_reconcile_error(&e), &e, "Failed to create checkout"))?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!(CheckoutResponse {
            session_id: link.session_id,
            url: link.url,
        })),
    ))
}

/// Verify a checkout after the redirect back from Stripe
///
/// Applies the payment if the webhook has not done so yet.
#[utoipa::path(
    post,
    path = "/payments/verify",
    tag = "Payments",
    request_body = VerifyCheckoutRequest,
    responses(
        (status = 200, description = "Verification outcome", body = ReconcileOutcome),
        (status = 401, description = "Missing or invalid service token", body = Object),
        (status = 404, description = "Checkout session not found", body = Object),
        (status = 500, description = "Verification failed", body = Object)
    )
)]
async fn verify_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VerifyCheckoutRequest>,
) -> ApiResult {
    require_service(&state, &headers)?;
    validated(&req)?;

    let outcome = state
        .reconciler
        .verify_checkout(req.session_id.trim())
        .await
        .map_err(|e| failure(map_reconcile_error(&e), &e, "Failed to verify checkout"))?;

    Ok((StatusCode::OK, Json(serde_json::json!(outcome))))
}

#[utoipa::path(
    post,
    path = "/payments/{session_id}/cancel",
    tag = "Payments",
    params(("session_id" = String, Path, description = "Checkout session ID")),
    responses(
        (status = 200, description = "Cancellation outcome", body = ReconcileOutcome),
        (status = 404, description = "Checkout session not found", body = Object)
    )
)]
async fn cancel_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ApiResult {
    require_service(&state, &headers)?;

    let outcome = state
        .reconciler
        .cancel_checkout(&session_id)
        .await
        .map_err(|e| failure(map_reconcile_error(&e), &e, "Failed to cancel checkout"))?;

    Ok((StatusCode::OK, Json(serde_json::json!(outcome))))
}

/// Stripe webhook receiver
///
/// Authenticated by the `Stripe-Signature` header, not the service token. Once the
/// signature checks out the event is always acknowledged; failures are logged and
/// the client verify path picks them up.
#[utoipa::path(
    post,
    path = "/webhooks/stripe",
    tag = "Payments",
    request_body(content = String, description = "Raw Stripe event payload"),
    responses(
        (status = 200, description = "Event received", body = Object),
        (status = 400, description = "Missing or invalid signature", body = Object)
    )
)]
async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let Some(signature) = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
    else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Missing Stripe-Signature header"})),
        ));
    };

    if let Err(e) = verify_webhook_signature(
        &body,
        signature,
        &state.webhook_secret,
        state.webhook_tolerance_secs,
        chrono::Utc::now().timestamp(),
    ) {
        warn!(error = %e, "Rejected webhook signature");
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid signature"})),
        ));
    }

    let event = parse_event(&body).map_err(|e| {
        warn!(error = %e, "Unparseable webhook payload");
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid event payload"})),
        )
    })?;

    let event_id = event.event_id().to_string();
    match state.reconciler.handle_event(event).await {
        Ok(outcome) => info!(event_id = %event_id, outcome = ?outcome, "Webhook processed"),
        Err(e) => error!(event_id = %event_id, error = %e, "Webhook processing failed"),
    }

    Ok((StatusCode::OK, Json(serde_json::json!({"received": true}))))
}

/// Create or update a saved artifact
#[utoipa::path(
    post,
    path = "/artifacts",
    tag = "Artifacts",
    request_body = SaveArtifactRequest,
    params(("X-Account-Id" = Uuid, Header, description = "Owning account")),
    responses(
        (status = 200, description = "Artifact updated", body = SavedArtifact),
        (status = 201, description = "Artifact created", body = SavedArtifact),
        (status = 400, description = "Invalid artifact", body = Object),
        (status = 401, description = "Missing account", body = Object),
        (status = 404, description = "Artifact or parent not found", body = Object),
        (status = 409, description = "Per-CV limit reached", body = Object)
    )
)]
async fn save_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SaveArtifactRequest>,
) -> ApiResult {
    require_service(&state, &headers)?;
    let account_id = require_account(&headers)?;
    validated(&req)?;

    let kind = parse_artifact_kind(&req.kind).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "Invalid kind",
                "allowed": ["CV", "COVER_LETTER", "EMAIL"]
            })),
        )
    })?;

    let status = if req.id.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    let artifact = state
        .artifacts
        .save(
            account_id,
            SaveArtifact {
                id: req.id,
                kind,
                parent_id: req.parent_id,
                title: req.title,
                content: req.content,
            },
        )
        .await
        .map_err(|e| failure(map_artifact_error(&e), &e, "Failed to save artifact"))?;

    Ok((status, Json(serde_json::json!(artifact))))
}

#[utoipa::path(
    get,
    path = "/artifacts",
    tag = "Artifacts",
    params(("X-Account-Id" = Uuid, Header, description = "Owning account")),
    responses(
        (status = 200, description = "Artifacts of the account", body = [SavedArtifact]),
        (status = 401, description = "Missing account", body = Object)
    )
)]
async fn list_artifacts(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    require_service(&state, &headers)?;
    let account_id = require_account(&headers)?;

    let artifacts = state
        .artifacts
        .list(account_id)
        .await
        .map_err(|e| failure(map_artifact_error(&e), &e, "Failed to list artifacts"))?;

    Ok((StatusCode::OK, Json(serde_json::json!(artifacts))))
}

#[utoipa::path(
    get,
    path = "/artifacts/{id}",
    tag = "Artifacts",
    params(
        ("id" = Uuid, Path, description = "Artifact ID"),
        ("X-Account-Id" = Uuid, Header, description = "Owning account")
    ),
    responses(
        (status = 200, description = "Artifact found", body = SavedArtifact),
        (status = 404, description = "Artifact not found", body = Object)
    )
)]
async fn get_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult {
    require_service(&state, &headers)?;
    let account_id = require_account(&headers)?;

    let artifact = state
        .artifacts
        .get(account_id, id)
        .await
        .map_err(|e| failure(map_artifact_error(&e), &e, "Failed to fetch artifact"))?;

    Ok((StatusCode::OK, Json(serde_json::json!(artifact))))
}

#[utoipa::path(
    delete,
    path = "/artifacts/{id}",
    tag = "Artifacts",
    params(
        ("id" = Uuid, Path, description = "Artifact ID"),
        ("X-Account-Id" = Uuid, Header, description = "Owning account")
    ),
    responses(
        (status = 200, description = "Artifact deleted", body = Object),
        (status = 404, description = "Artifact not found", body = Object)
    )
)]
async fn delete_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult {
    require_service(&state, &headers)?;
    let account_id = require_account(&headers)?;

    state
        .artifacts
        .delete(account_id, id)
        .await
        .map_err(|e| failure(map_artifact_error(&e), &e, "Failed to delete artifact"))?;

    Ok((StatusCode::OK, Json(serde_json::json!({"status": "deleted"}))))
}
