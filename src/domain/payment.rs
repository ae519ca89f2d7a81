use super::{ActionKind, PlanTier, Principal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle of one provider checkout session.
///
/// `Created -> Verified -> Applied`, or `Created -> Expired | Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[cfg_attr(feature = "server", derive(utoipa::ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentSessionState {
    Created,
    Verified,
    Applied,
    Expired,
    Cancelled,
}

impl PaymentSessionState {
    pub fn can_transition_to(self, next: PaymentSessionState) -> bool {
        use PaymentSessionState::*;
        matches!(
            (self, next),
            (Created, Verified)
                | (Created, Expired)
                | (Created, Cancelled)
                | (Verified, Applied)
                // A late payment still wins over a local expiry/cancel.
                | (Expired, Verified)
                | (Cancelled, Verified)
        )
    }

    /// States from which `next` may be entered.
    pub fn predecessors(next: PaymentSessionState) -> Vec<PaymentSessionState> {
        use PaymentSessionState::*;
        [Created, Verified, Applied, Expired, Cancelled]
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PaymentSessionState::Applied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CheckoutMode {
    Subscription,
    Payment,
}

/// Why a checkout was started; carried in the provider session metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "purpose", rename_all = "snake_case")]
pub enum CheckoutPurpose {
    Plan { account_id: Uuid, plan: PlanTier },
    Action {
        principal: Principal,
        action_kind: ActionKind,
    },
}

pub const META_PURPOSE: &str = "purpose";
pub const META_ACCOUNT_ID: &str = "account_id";
pub const META_FINGERPRINT: &str = "fingerprint";
pub const META_ACTION_KIND: &str = "action_kind";
pub const META_PLAN: &str = "plan";

impl CheckoutPurpose {
    pub fn mode(&self) -> CheckoutMode {
        match self {
            CheckoutPurpose::Plan {
                plan: PlanTier::Pro,
                ..
            } => CheckoutMode::Subscription,
            _ => CheckoutMode::Payment,
        }
    }

    pub fn principal(&self) -> Principal {
        match self {
            CheckoutPurpose::Plan { account_id, .. } => Principal::account(*account_id),
            CheckoutPurpose::Action { principal, .. } => principal.clone(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CheckoutPurpose::Plan { .. } => "plan",
            CheckoutPurpose::Action { .. } => "action",
        }
    }

    pub fn to_metadata(&self) -> HashMap<String, String> {
        let mut meta = HashMap::new();
        meta.insert(META_PURPOSE.to_string(), self.label().to_string());
        match self {
            CheckoutPurpose::Plan { account_id, plan } => {
                meta.insert(META_ACCOUNT_ID.to_string(), account_id.to_string());
                meta.insert(META_PLAN.to_string(), plan.to_string());
            }
            CheckoutPurpose::Action {
                principal,
                action_kind,
            } => {
                match principal {
                    Principal::Account { account_id } => {
                        meta.insert(META_ACCOUNT_ID.to_string(), account_id.to_string());
                    }
                    Principal::Anonymous { fingerprint_hash } => {
                        meta.insert(META_FINGERPRINT.to_string(), fingerprint_hash.clone());
                    }
                }
                meta.insert(META_ACTION_KIND.to_string(), action_kind.to_string());
            }
        }
        meta
    }

    pub fn from_metadata(meta: &HashMap<String, String>) -> Result<Self, String> {
        let account_id = meta
            .get(META_ACCOUNT_ID)
            .map(|s| Uuid::parse_str(s).map_err(|_| format!("invalid account_id: {}", s)))
            .transpose()?;

        match meta.get(META_PURPOSE).map(String::as_str) {
            Some("plan") => {
                let account_id = account_id.ok_or("plan purchase without account_id")?;
                let plan = meta
                    .get(META_PLAN)
                    .ok_or("plan purchase without plan")
                    .and_then(|p| PlanTier::from_str(p).map_err(|_| "unknown plan"))?;
                if !plan.has_full_access() {
                    return Err(format!("plan {} cannot be purchased", plan));
                }
                Ok(CheckoutPurpose::Plan { account_id, plan })
            }
            Some("action") => {
                let action_kind = meta
                    .get(META_ACTION_KIND)
                    .ok_or("action purchase without action_kind")
                    .and_then(|k| ActionKind::from_str(k).map_err(|_| "unknown action_kind"))?;
                let principal = match (account_id, meta.get(META_FINGERPRINT)) {
                    (Some(id), _) => Principal::account(id),
                    (None, Some(fp)) => Principal::anonymous(fp.clone()),
                    (None, None) => return Err("action purchase without principal".to_string()),
                };
                Ok(CheckoutPurpose::Action {
                    principal,
                    action_kind,
                })
            }
            Some(other) => Err(format!("unknown purpose: {}", other)),
            None => Err("missing purpose".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub session_id: String,
    pub principal: Principal,
    pub purpose: CheckoutPurpose,
    pub state: PaymentSessionState,
    pub amount_cents: Option<i64>,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentSession {
    pub fn new(
        session_id: String,
        purpose: CheckoutPurpose,
        amount_cents: Option<i64>,
        currency: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            principal: purpose.principal(),
            purpose,
            state: PaymentSessionState::Created,
            amount_cents,
            currency,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One-off purchase of a single action; its session id is the payment evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub session_id: String,
    pub principal: Principal,
    pub action_kind: ActionKind,
    pub amount_cents: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// Provider-neutral view of a checkout session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSessionSummary {
    pub id: String,
    pub mode: CheckoutMode,
    pub paid: bool,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutLink {
    pub session_id: String,
    pub url: String,
}

/// Provider events the reconciler understands.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentEvent {
    CheckoutCompleted {
        event_id: String,
        session: CheckoutSessionSummary,
    },
    CheckoutExpired {
        event_id: String,
        session_id: String,
    },
    InvoicePaid {
        event_id: String,
        subscription_id: Option<String>,
    },
    SubscriptionDeleted {
        event_id: String,
        subscription_id: String,
    },
    Unhandled {
        event_id: String,
        event_type: String,
    },
}

impl PaymentEvent {
    pub fn event_id(&self) -> &str {
        match self {
            PaymentEvent::CheckoutCompleted { event_id, .. }
            | PaymentEvent::CheckoutExpired { event_id, .. }
            | PaymentEvent::InvoicePaid { event_id, .. }
            | PaymentEvent::SubscriptionDeleted { event_id, .. }
            | PaymentEvent::Unhandled { event_id, .. } => event_id,
        }
    }
}

/// Dedupe key shared by the webhook and the client verify path.
pub fn checkout_dedupe_key(session_id: &str) -> String {
    format!("checkout:{}", session_id)
}
