use super::{PlanTier, Principal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use uuid::Uuid;

/// Sentinel reported as `remaining`/`freeActionLimit` for full-access tiers.
pub const UNLIMITED: i64 = -1;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[cfg_attr(feature = "server", derive(utoipa::ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    DownloadSpanish,
    DownloadEnglish,
    TranslateToEnglish,
    GenerateEmail,
    GenerateCoverLetter,
    AdaptCv,
}

impl ActionKind {
    pub fn is_download(self) -> bool {
        matches!(self, ActionKind::DownloadSpanish | ActionKind::DownloadEnglish)
    }

    /// Downloads can be bought one-off without an account; AI actions cannot.
    pub fn purchasable_anonymously(self) -> bool {
        self.is_download()
    }

    pub fn allowed_values() -> Vec<String> {
        ActionKind::iter().map(|k| k.to_string()).collect()
    }
}

/// Immutable ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub id: Uuid,
    pub principal: Principal,
    pub action_kind: ActionKind,
    pub amount_paid_cents: i64,
    pub payment_evidence: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn free(principal: Principal, action_kind: ActionKind) -> Self {
        Self::new(principal, action_kind, 0, None)
    }

    pub fn paid(
        principal: Principal,
        action_kind: ActionKind,
        amount_paid_cents: i64,
        payment_evidence: String,
    ) -> Self {
        Self::new(
            principal,
            action_kind,
            amount_paid_cents,
            Some(payment_evidence),
        )
    }

    fn new(
        principal: Principal,
        action_kind: ActionKind,
        amount_paid_cents: i64,
        payment_evidence: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal,
            action_kind,
            amount_paid_cents,
            payment_evidence,
            created_at: Utc::now(),
        }
    }

    /// Paid means backed by a purchase, whatever it cost (discounted checkouts total 0).
    pub fn is_free(&self) -> bool {
        self.payment_evidence.is_none()
    }
}

/// Outcome of an atomic reserve-if-available append.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    Recorded(UsageRecord),
    Exhausted { free_used: i64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounts {
    pub free: i64,
    pub paid: i64,
}

/// Counts derived from the ledger for one principal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageTally {
    pub by_action: BTreeMap<ActionKind, ActionCounts>,
}

impl UsageTally {
    pub fn add(&mut self, action_kind: ActionKind, paid: bool, count: i64) {
        let entry = self.by_action.entry(action_kind).or_default();
        if paid {
            entry.paid += count;
        } else {
            entry.free += count;
        }
    }

    pub fn free_used(&self) -> i64 {
        self.by_action.values().map(|c| c.free).sum()
    }

    pub fn paid(&self) -> i64 {
        self.by_action.values().map(|c| c.paid).sum()
    }

    pub fn total(&self) -> i64 {
        self.free_used() + self.paid()
    }
}

/// What the caller can do to get past a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "server", derive(utoipa::ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    PayPerAction,
    UpgradePlan,
    Register,
    RetryLater,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "server", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub allowed: bool,
    /// Free actions left, or `-1` for unlimited.
    pub remaining: i64,
    pub requires_payment: bool,
    pub requires_registration: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_cents: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub tier: PlanTier,
    pub resolutions: Vec<Resolution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "server", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ActionUsage {
    pub action_kind: ActionKind,
    pub free: i64,
    pub paid: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "server", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub tier: PlanTier,
    pub total_actions: i64,
    pub free_actions_used: i64,
    pub paid_actions: i64,
    pub remaining_free_actions: i64,
    pub free_action_limit: i64,
    pub has_full_access: bool,
    pub by_action: Vec<ActionUsage>,
}

/// Free-quota rules: a single bucket shared by every action kind.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaPolicy {
    pub free_action_limit: i64,
    pub action_price_cents: i64,
    pub currency: String,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            free_action_limit: 3,
            action_price_cents: 199,
            currency: "eur".to_string(),
        }
    }
}

impl QuotaPolicy {
    pub fn remaining(&self, free_used: i64) -> i64 {
        (self.free_action_limit - free_used).max(0)
    }

    pub fn decide(&self, tier: PlanTier, action: ActionKind, free_used: i64) -> Entitlement {
        if tier.has_full_access() {
            return Entitlement {
                allowed: true,
                remaining: UNLIMITED,
                requires_payment: false,
                requires_registration: false,
                price: None,
                price_cents: None,
                currency: None,
                tier,
                resolutions: Vec::new(),
            };
        }

        let remaining = self.remaining(free_used);
        if remaining > 0 {
            return Entitlement {
                allowed: true,
                remaining,
                requires_payment: false,
                requires_registration: false,
                price: None,
                price_cents: None,
                currency: None,
                tier,
                resolutions: Vec::new(),
            };
        }

        let (requires_registration, resolutions) = match tier {
            PlanTier::Anonymous if action.purchasable_anonymously() => {
                (false, vec![Resolution::PayPerAction, Resolution::Register])
            }
            PlanTier::Anonymous => (true, vec![Resolution::Register]),
            _ => (false, vec![Resolution::PayPerAction, Resolution::UpgradePlan]),
        };

        Entitlement {
            requires_registration,
            resolutions,
            ..self.denied(tier)
        }
    }

    /// Denial returned when the ledger or plan cannot be read.
    pub fn fail_closed(&self, tier: PlanTier) -> Entitlement {
        Entitlement {
            resolutions: vec![Resolution::RetryLater],
            ..self.denied(tier)
        }
    }

    fn denied(&self, tier: PlanTier) -> Entitlement {
        Entitlement {
            allowed: false,
            remaining: 0,
            requires_payment: true,
            requires_registration: false,
            price: Some(cents_to_decimal(self.action_price_cents)),
            price_cents: Some(self.action_price_cents),
            currency: Some(self.currency.clone()),
            tier,
            resolutions: Vec::new(),
        }
    }

    pub fn stats(&self, tier: PlanTier, tally: &UsageTally) -> UsageStats {
        let full = tier.has_full_access();
        let free_used = tally.free_used();

        UsageStats {
            tier,
            total_actions: tally.total(),
            free_actions_used: free_used,
            paid_actions: tally.paid(),
            remaining_free_actions: if full {
                UNLIMITED
            } else {
                self.remaining(free_used)
            },
            free_action_limit: if full {
                UNLIMITED
            } else {
                self.free_action_limit
            },
            has_full_access: full,
            by_action: tally
                .by_action
                .iter()
                .map(|(kind, counts)| ActionUsage {
                    action_kind: *kind,
                    free: counts.free,
                    paid: counts.paid,
                })
                .collect(),
        }
    }
}

pub fn cents_to_decimal(cents: i64) -> f64 {
    cents as f64 / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn action_kind_wire_names() {
        assert_eq!(ActionKind::DownloadSpanish.to_string(), "DOWNLOAD_SPANISH");
        assert_eq!(
            ActionKind::from_str("TRANSLATE_TO_ENGLISH").unwrap(),
            ActionKind::TranslateToEnglish
        );
        assert!(ActionKind::from_str("DOWNLOAD_FRENCH").is_err());
        assert_eq!(ActionKind::allowed_values().len(), 6);
    }

    #[test]
    fn full_access_tiers_are_unlimited_regardless_of_usage() {
        let policy = QuotaPolicy::default();
        for tier in [PlanTier::Pro, PlanTier::Lifetime] {
            for used in [0, 3, 1_000] {
                let e = policy.decide(tier, ActionKind::AdaptCv, used);
                assert!(e.allowed);
                assert_eq!(e.remaining, UNLIMITED);
                assert!(!e.requires_payment);
            }
        }
    }

    #[test]
    fn bounded_tiers_follow_remaining_formula() {
        let policy = QuotaPolicy::default();
        for tier in [PlanTier::Anonymous, PlanTier::Freemium] {
            for used in 0..6 {
                let e = policy.decide(tier, ActionKind::GenerateEmail, used);
                assert_eq!(e.remaining, (3 - used).max(0));
                assert_eq!(e.allowed, e.remaining > 0);
                assert_eq!(e.requires_payment, !e.allowed);
            }
        }
    }

    #[test]
    fn exhausted_denial_carries_price_and_resolutions() {
        let policy = QuotaPolicy::default();

        let anon_download = policy.decide(PlanTier::Anonymous, ActionKind::DownloadEnglish, 3);
        assert_eq!(anon_download.price, Some(1.99));
        assert_eq!(anon_download.price_cents, Some(199));
        assert!(!anon_download.requires_registration);
        assert_eq!(
            anon_download.resolutions,
            vec![Resolution::PayPerAction, Resolution::Register]
        );

        let anon_ai = policy.decide(PlanTier::Anonymous, ActionKind::AdaptCv, 3);
        assert!(anon_ai.requires_registration);
        assert_eq!(anon_ai.resolutions, vec![Resolution::Register]);

        let freemium = policy.decide(PlanTier::Freemium, ActionKind::AdaptCv, 4);
        assert!(!freemium.requires_registration);
        assert_eq!(
            freemium.resolutions,
            vec![Resolution::PayPerAction, Resolution::UpgradePlan]
        );
    }

    #[test]
    fn fail_closed_denies() {
        let e = QuotaPolicy::default().fail_closed(PlanTier::Freemium);
        assert!(!e.allowed);
        assert!(e.requires_payment);
        assert_eq!(e.resolutions, vec![Resolution::RetryLater]);
    }

    #[test]
    fn stats_split_free_and_paid() {
        let mut tally = UsageTally::default();
        tally.add(ActionKind::DownloadSpanish, false, 1);
        tally.add(ActionKind::GenerateEmail, false, 1);
        tally.add(ActionKind::DownloadSpanish, true, 1);

        let stats = QuotaPolicy::default().stats(PlanTier::Freemium, &tally);
        assert_eq!(stats.total_actions, 3);
        assert_eq!(stats.free_actions_used, 2);
        assert_eq!(stats.paid_actions, 1);
        assert_eq!(stats.remaining_free_actions, 1);
        assert_eq!(stats.free_action_limit, 3);
        assert!(!stats.has_full_access);
        assert_eq!(stats.by_action.len(), 2);

        let pro = QuotaPolicy::default().stats(PlanTier::Pro, &tally);
        assert_eq!(pro.free_action_limit, UNLIMITED);
        assert_eq!(pro.remaining_free_actions, UNLIMITED);
        assert!(pro.has_full_access);
    }

    #[test]
    fn records_with_evidence_are_paid_even_at_zero_cost() {
        let principal = Principal::anonymous("fp-test-0001");
        assert!(UsageRecord::free(principal.clone(), ActionKind::AdaptCv).is_free());

        let discounted =
            UsageRecord::paid(principal, ActionKind::AdaptCv, 0, "cs_discounted".to_string());
        assert!(!discounted.is_free());
    }

    #[test]
    fn entitlement_serializes_camel_case() {
        let e = QuotaPolicy::default().decide(PlanTier::Anonymous, ActionKind::DownloadSpanish, 0);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["allowed"], true);
        assert_eq!(json["remaining"], 3);
        assert_eq!(json["requiresPayment"], false);
        assert_eq!(json["tier"], "ANONYMOUS");
        assert!(json.get("price").is_none());
    }
}
