use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: Uuid,
    pub plan_tier: PlanTier,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Plan level governing whether the free quota applies at all.
///
/// `Anonymous` is synthetic: it is reported for fingerprint principals and is
/// never persisted on an account row.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[cfg_attr(feature = "server", derive(utoipa::ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanTier {
    Anonymous,
    Freemium,
    Pro,
    Lifetime,
}

impl PlanTier {
    pub fn has_full_access(self) -> bool {
        matches!(self, PlanTier::Pro | PlanTier::Lifetime)
    }

    /// Tier after a successful plan purchase. LIFETIME is terminal.
    pub fn upgraded_to(self, purchased: PlanTier) -> PlanTier {
        match (self, purchased) {
            (PlanTier::Lifetime, _) => PlanTier::Lifetime,
            (_, PlanTier::Lifetime) => PlanTier::Lifetime,
            (_, PlanTier::Pro) => PlanTier::Pro,
            (current, _) => current,
        }
    }

    /// Tier after the renewing subscription is cancelled.
    pub fn after_subscription_cancelled(self) -> PlanTier {
        match self {
            PlanTier::Pro => PlanTier::Freemium,
            other => other,
        }
    }
}

impl Account {
    pub fn new(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            plan_tier: PlanTier::Freemium,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}
