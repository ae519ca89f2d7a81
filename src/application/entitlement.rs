use crate::application::IdentityError;
use crate::domain::{
    ActionKind, AnonymousHistoryPolicy, Entitlement, PlanTier, Principal, QuotaPolicy,
    Reservation, UsageRecord, UsageStats,
};
use crate::infrastructure::{
    AccountRepository, PaymentRepository, RepositoryError, UsageRepository,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum EntitlementError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Payment required: {0}")]
    PaymentRequired(String),
    #[error("Free action quota exhausted")]
    QuotaExceeded(Box<Entitlement>),
    #[error("Payment evidence already consumed: {0}")]
    PaymentAlreadyConsumed(String),
}

/// Decides whether a principal may perform an action and writes the ledger entry
/// once it has.
pub struct EntitlementService<A, U, P>
where
    A: AccountRepository,
    U: UsageRepository,
    P: PaymentRepository,
{
    account_repo: Arc<A>,
    usage_repo: Arc<U>,
    payment_repo: Arc<P>,
    policy: QuotaPolicy,
    history: AnonymousHistoryPolicy,
}

impl<A, U, P> EntitlementService<A, U, P>
where
    A: AccountRepository,
    U: UsageRepository,
    P: PaymentRepository,
{
    pub fn new(
        account_repo: Arc<A>,
        usage_repo: Arc<U>,
        payment_repo: Arc<P>,
        policy: QuotaPolicy,
        history: AnonymousHistoryPolicy,
    ) -> Self {
        Self {
            account_repo,
            usage_repo,
            payment_repo,
            policy,
            history,
        }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Current plan tier. Accounts with no row yet are FREEMIUM.
    pub async fn tier_for(&self, principal: &Principal) -> Result<PlanTier, RepositoryError> {
        let Some(account_id) = principal.account_id() else {
            return Ok(PlanTier::Anonymous);
        };

        match self.account_repo.get_by_id(account_id).await {
            Ok(account) => Ok(account.plan_tier),
            Err(RepositoryError::NotFound(_)) => Ok(PlanTier::Freemium),
            Err(e) => Err(e),
        }
    }

    /// Never fails: storage errors produce a denial asking the caller to retry.
    pub async fn evaluate(&self, principal: &Principal, action: ActionKind) -> Entitlement {
        let tier = match self.tier_for(principal).await {
            Ok(tier) => tier,
            Err(e) => {
                error!(principal = %principal, error = %e, "Failed to read plan tier");
                let assumed = if principal.is_anonymous() {
                    PlanTier::Anonymous
                } else {
                    PlanTier::Freemium
                };
                return self.policy.fail_closed(assumed);
            }
        };

        if tier.has_full_access() {
            return self.policy.decide(tier, action, 0);
        }

        match self.usage_repo.tally(principal, self.history).await {
            Ok(tally) => {
                let decision = self.policy.decide(tier, action, tally.free_used());
                debug!(
                    principal = %principal,
                    action = %action,
                    allowed = decision.allowed,
                    remaining = decision.remaining,
                    "Evaluated entitlement"
                );
                decision
            }
            Err(e) => {
                error!(principal = %principal, error = %e, "Failed to read usage ledger");
                self.policy.fail_closed(tier)
            }
        }
    }

    /// Appends a ledger entry for a completed action.
    ///
    /// With `payment_evidence` the entry is paid and must reference an unconsumed
    /// purchase of the same action by the same principal; the stored amount comes
    /// from the purchase, not from `amount_paid_cents`. Without evidence the entry
    /// takes a free slot, atomically, unless the tier has full access.
    pub async fn record(
        &self,
        principal: &Principal,
        action: ActionKind,
        amount_paid_cents: i64,
        payment_evidence: Option<&str>,
    ) -> Result<UsageRecord, EntitlementError> {
        if amount_paid_cents < 0 {
            return Err(EntitlementError::Validation(
                "amount_paid cannot be negative".to_string(),
            ));
        }

        match payment_evidence.map(str::trim).filter(|e| !e.is_empty()) {
            Some(evidence) => self.record_paid(principal, action, evidence).await,
            None if amount_paid_cents > 0 => Err(EntitlementError::Validation(
                "a paid action needs payment_evidence".to_string(),
            )),
            None => self.record_free(principal, action).await,
        }
    }

    async fn record_paid(
        &self,
        principal: &Principal,
        action: ActionKind,
        evidence: &str,
    ) -> Result<UsageRecord, EntitlementError> {
        let purchase = self
            .payment_repo
            .get_purchase(evidence)
            .await?
            .ok_or_else(|| {
                EntitlementError::PaymentRequired(format!(
                    "no completed purchase for {}",
                    evidence
                ))
            })?;

        if purchase.principal != *principal {
            warn!(
                principal = %principal,
                owner = %purchase.principal,
                "Payment evidence presented by another principal"
            );
            return Err(EntitlementError::PaymentRequired(
                "purchase belongs to another principal".to_string(),
            ));
        }

        if purchase.action_kind != action {
            return Err(EntitlementError::PaymentRequired(format!(
                "purchase covers {}, not {}",
                purchase.action_kind, action
            )));
        }

        let record = UsageRecord::paid(
            principal.clone(),
            action,
            purchase.amount_cents,
            purchase.session_id,
        );

        match self.usage_repo.append(&record).await {
            Ok(()) => {
                info!(principal = %principal, action = %action, "Recorded paid action");
                Ok(record)
            }
            Err(RepositoryError::Conflict(_)) => Err(EntitlementError::PaymentAlreadyConsumed(
                evidence.to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_free(
        &self,
        principal: &Principal,
        action: ActionKind,
    ) -> Result<UsageRecord, EntitlementError> {
        let tier = self.tier_for(principal).await?;
        let record = UsageRecord::free(principal.clone(), action);

        if tier.has_full_access() {
            self.usage_repo.append(&record).await?;
            debug!(principal = %principal, action = %action, tier = %tier, "Recorded action");
            return Ok(record);
        }

        match self
            .usage_repo
            .append_within_limit(&record, self.policy.free_action_limit, self.history)
            .await?
        {
            Reservation::Recorded(record) => {
                info!(principal = %principal, action = %action, "Recorded free action");
                Ok(record)
            }
            Reservation::Exhausted { free_used } => {
                info!(
                    principal = %principal,
                    action = %action,
                    free_used,
                    "Free quota exhausted"
                );
                Err(EntitlementError::QuotaExceeded(Box::new(
                    self.policy.decide(tier, action, free_used),
                )))
            }
        }
    }

    pub async fn stats(&self, principal: &Principal) -> Result<UsageStats, EntitlementError> {
        let tier = self.tier_for(principal).await?;
        let tally = self.usage_repo.tally(principal, self.history).await?;
        Ok(self.policy.stats(tier, &tally))
    }
}
