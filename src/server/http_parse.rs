use super::http_types::CheckoutRequest;
use crate::domain::{ActionKind, ArtifactKind, CheckoutPurpose, PlanTier, Principal};
use axum::http::StatusCode;
use std::str::FromStr;

/// Accepts the wire names case-insensitively (`DOWNLOAD_SPANISH`, `download_spanish`).
pub(super) fn parse_action_kind(kind: &str) -> Option<ActionKind> {
    ActionKind::from_str(&kind.trim().to_ascii_uppercase()).ok()
}

/// Only plans that can be bought.
pub(super) fn parse_plan(plan: &str) -> Option<PlanTier> {
    match plan.trim().to_ascii_uppercase().as_str() {
        "PRO" => Some(PlanTier::Pro),
        "LIFETIME" => Some(PlanTier::Lifetime),
        _ => None,
    }
}

pub(super) fn parse_artifact_kind(kind: &str) -> Option<ArtifactKind> {
    ArtifactKind::from_str(&kind.trim().to_ascii_uppercase()).ok()
}

pub(super) fn require_action_kind(kind: &str) -> Result<ActionKind, (StatusCode, serde_json::Value)> {
    parse_action_kind(kind).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            serde_json::json!({
                "error": "Invalid action_kind",
                "allowed": ActionKind::allowed_values()
            }),
        )
    })
}

/// Plans need an account; anonymous principals may only buy downloads.
pub(super) fn checkout_purpose(
    req: &CheckoutRequest,
    principal: &Principal,
) -> Result<CheckoutPurpose, (StatusCode, serde_json::Value)> {
    match req.purpose.trim().to_ascii_lowercase().as_str() {
        "plan" => {
            let Some(account_id) = principal.account_id() else {
                return Err((
                    StatusCode::UNAUTHORIZED,
                    serde_json::json!({ "error": "Sign in to purchase a plan" }),
                ));
            };
            let plan = req.plan.as_deref().and_then(parse_plan).ok_or_else(|| {
                (
                    StatusCode::BAD_REQUEST,
                    serde_json::json!({
                        "error": "Invalid plan",
                        "allowed": ["PRO", "LIFETIME"]
                    }),
                )
            })?;
            Ok(CheckoutPurpose::Plan { account_id, plan })
        }
        "action" => {
            let action_kind = require_action_kind(req.action_kind.as_deref().unwrap_or(""))?;
            if principal.is_anonymous() && !action_kind.purchasable_anonymously() {
                return Err((
                    StatusCode::UNAUTHORIZED,
                    serde_json::json!({
                        "error": "Sign in to purchase this action",
                        "requiresRegistration": true
                    }),
                ));
            }
            Ok(CheckoutPurpose::Action {
                principal: principal.clone(),
                action_kind,
            })
        }
        _ => Err((
            StatusCode::BAD_REQUEST,
            serde_json::json!({
                "error": "Invalid purpose",
                "allowed": ["plan", "action"]
            }),
        )),
    }
}

/// Decimal currency units to cents, e.g. `1.99` -> `199`.
pub(super) fn decimal_to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}
