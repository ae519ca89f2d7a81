use crate::application::{ArtifactError, EntitlementError, IdentityError, ReconcileError};
use crate::infrastructure::{RepositoryError, StripeError};
use axum::http::StatusCode;
use validator::ValidationErrors;

pub(super) fn map_validation_errors(errors: &ValidationErrors) -> (StatusCode, serde_json::Value) {
    (
        StatusCode::BAD_REQUEST,
        serde_json::json!({ "error": "Invalid request", "details": errors }),
    )
}

pub(super) fn map_identity_error(err: &IdentityError) -> (StatusCode, serde_json::Value) {
    match err {
        IdentityError::InvalidFingerprint(msg) => (
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "Invalid fingerprint", "details": msg }),
        ),
        IdentityError::Repository(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "Failed to resolve identity" }),
        ),
    }
}

pub(super) fn map_entitlement_error(err: &EntitlementError) -> (StatusCode, serde_json::Value) {
    match err {
        EntitlementError::Validation(msg) => {
            (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }))
        }
        EntitlementError::Identity(e) => map_identity_error(e),
        EntitlementError::PaymentRequired(msg) => (
            StatusCode::PAYMENT_REQUIRED,
            serde_json::json!({ "error": "Payment required", "details": msg }),
        ),
        EntitlementError::QuotaExceeded(entitlement) => (
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({
                "error": "Free action quota exhausted",
                "entitlement": entitlement,
            }),
        ),
        EntitlementError::PaymentAlreadyConsumed(_) => (
            StatusCode::CONFLICT,
            serde_json::json!({ "error": "Payment already used for another action" }),
        ),
        EntitlementError::Repository(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "Failed to record usage" }),
        ),
    }
}

pub(super) fn map_reconcile_error(err: &ReconcileError) -> (StatusCode, serde_json::Value) {
    match err {
        ReconcileError::Validation(msg) | ReconcileError::InvalidMetadata(msg) => {
            (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }))
        }
        ReconcileError::SessionNotFound(_) => (
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "Checkout session not found" }),
        ),
        ReconcileError::Stripe(StripeError::RateLimited) => (
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({ "error": "Rate limited by Stripe, please retry" }),
        ),
        ReconcileError::Stripe(StripeError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "Checkout session not found" }),
        ),
        ReconcileError::PlanNotConfigured(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "Plan is not available" }),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "Payment processing failed" }),
        ),
    }
}

pub(super) fn map_artifact_error(err: &ArtifactError) -> (StatusCode, serde_json::Value) {
    match err {
        ArtifactError::NotFound(_) | ArtifactError::Repository(RepositoryError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "Artifact not found" }),
        ),
        ArtifactError::Invalid(msg) => {
            (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }))
        }
        ArtifactError::LimitReached { kind, max } => (
            StatusCode::CONFLICT,
            serde_json::json!({
                "error": format!("Limit reached: maximum {} {} per CV", max, kind)
            }),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "Failed to access artifacts" }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArtifactKind, PlanTier, QuotaPolicy};
    use uuid::Uuid;

    #[test]
    fn entitlement_errors_map_to_distinct_statuses() {
        let policy = QuotaPolicy::default();
        let exhausted = policy.decide(
            PlanTier::Freemium,
            crate::domain::ActionKind::AdaptCv,
            3,
        );

        let cases = [
            (EntitlementError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (EntitlementError::PaymentRequired("x".into()), StatusCode::PAYMENT_REQUIRED),
            (
                EntitlementError::QuotaExceeded(Box::new(exhausted)),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (EntitlementError::PaymentAlreadyConsumed("cs_1".into()), StatusCode::CONFLICT),
            (
                EntitlementError::Repository(RepositoryError::InvalidData("x".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(map_entitlement_error(&err).0, status, "{}", err);
        }
    }

    #[test]
    fn quota_exceeded_body_carries_entitlement() {
        let policy = QuotaPolicy::default();
        let err = EntitlementError::QuotaExceeded(Box::new(policy.decide(
            PlanTier::Anonymous,
            crate::domain::ActionKind::DownloadEnglish,
            3,
        )));

        let (_, body) = map_entitlement_error(&err);
        assert_eq!(body["entitlement"]["allowed"], false);
        assert_eq!(body["entitlement"]["price"], 1.99);
        assert_eq!(body["entitlement"]["resolutions"][0], "PAY_PER_ACTION");
    }

    #[test]
    fn storage_details_are_not_leaked() {
        let err = IdentityError::Repository(RepositoryError::InvalidData("secret".into()));
        let (status, body) = map_identity_error(&err);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.to_string().contains("secret"));
    }

    #[test]
    fn artifact_and_reconcile_errors() {
        assert_eq!(
            map_artifact_error(&ArtifactError::NotFound(Uuid::new_v4())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            map_artifact_error(&ArtifactError::LimitReached {
                kind: ArtifactKind::Email,
                max: 3
            })
            .0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            map_reconcile_error(&ReconcileError::Stripe(StripeError::RateLimited)).0,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            map_reconcile_error(&ReconcileError::SessionNotFound("cs_x".into())).0,
            StatusCode::NOT_FOUND
        );
    }
}
