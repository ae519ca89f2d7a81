use crate::domain::{cents_to_decimal, ActionKind, UsageRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

#[derive(Serialize, ToSchema)]
pub(super) struct HealthResponse {
    pub(super) status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) error: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(super) struct CheckEntitlementRequest {
    #[validate(length(min = 8, max = 256))]
    #[schema(example = "3f9a1c0b7d2e4a6f")]
    pub(super) fingerprint: String,
    #[serde(default, alias = "account_id")]
    pub(super) account_id: Option<Uuid>,
    #[serde(alias = "action_kind")]
    #[schema(example = "DOWNLOAD_SPANISH")]
    pub(super) action_kind: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(super) struct RecordUsageRequest {
    #[validate(length(min = 8, max = 256))]
    pub(super) fingerprint: String,
    #[serde(default, alias = "account_id")]
    pub(super) account_id: Option<Uuid>,
    #[serde(alias = "action_kind")]
    #[schema(example = "GENERATE_COVER_LETTER")]
    pub(super) action_kind: String,
    /// Decimal amount, e.g. `1.99`. Omitted or `0` for a free action.
    #[serde(default, alias = "amount_paid")]
    #[validate(range(min = 0.0))]
    pub(super) amount_paid: Option<f64>,
    /// Checkout session id of the purchase that paid for this action.
    #[serde(default, alias = "payment_evidence")]
    #[validate(length(min = 1, max = 255))]
    pub(super) payment_evidence: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(super) struct UsageRecordResponse {
    pub(super) id: Uuid,
    pub(super) action_kind: ActionKind,
    pub(super) amount_paid: f64,
    pub(super) paid: bool,
    pub(super) created_at: DateTime<Utc>,
}

impl From<UsageRecord> for UsageRecordResponse {
    fn from(record: UsageRecord) -> Self {
        Self {
            id: record.id,
            action_kind: record.action_kind,
            amount_paid: cents_to_decimal(record.amount_paid_cents),
            paid: !record.is_free(),
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Deserialize, Validate, IntoParams)]
pub(super) struct StatsQuery {
    #[validate(length(min = 8, max = 256))]
    pub(super) fingerprint: String,
    #[serde(default, alias = "accountId")]
    pub(super) account_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(super) struct CheckoutRequest {
    #[validate(length(min = 8, max = 256))]
    pub(super) fingerprint: String,
    #[serde(default, alias = "account_id")]
    pub(super) account_id: Option<Uuid>,
    /// `plan` or `action`.
    #[schema(example = "plan")]
    pub(super) purpose: String,
    #[serde(default)]
    #[schema(example = "PRO")]
    pub(super) plan: Option<String>,
    #[serde(default, alias = "action_kind")]
    pub(super) action_kind: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(super) struct CheckoutResponse {
    pub(super) session_id: String,
    pub(super) url: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(super) struct VerifyCheckoutRequest {
    #[serde(alias = "session_id")]
    #[validate(length(min = 1, max = 255))]
    pub(super) session_id: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(super) struct SaveArtifactRequest {
    #[serde(default)]
    pub(super) id: Option<Uuid>,
    #[schema(example = "CV")]
    pub(super) kind: String,
    #[serde(default, alias = "parent_id")]
    pub(super) parent_id: Option<Uuid>,
    #[validate(length(min = 1, max = 200))]
    pub(super) title: String,
    #[schema(value_type = Object)]
    pub(super) content: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::Uri;

    #[test]
    fn stats_query_accepts_both_account_id_spellings() {
        let account_id = Uuid::new_v4();
        for param in ["account_id", "accountId"] {
            let uri: Uri = format!("/usage/stats?fingerprint=fp-test-0001&{}={}", param, account_id)
                .parse()
                .unwrap();
            let Query(query) = Query::<StatsQuery>::try_from_uri(&uri).unwrap();
            assert_eq!(query.account_id, Some(account_id));
            assert_eq!(query.fingerprint, "fp-test-0001");
        }

        let uri: Uri = "/usage/stats?fingerprint=fp-test-0001".parse().unwrap();
        let Query(query) = Query::<StatsQuery>::try_from_uri(&uri).unwrap();
        assert_eq!(query.account_id, None);
    }
}
