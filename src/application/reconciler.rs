use crate::domain::{
    checkout_dedupe_key, CheckoutLink, CheckoutPurpose, CheckoutSessionSummary, PaymentEvent,
    PaymentSession, PaymentSessionState, PlanTier, Purchase,
};
use crate::infrastructure::{
    AccountRepository, CheckoutParams, LineItem, PaymentProvider, PaymentRepository,
    RepositoryError, StripeError,
};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Stripe error: {0}")]
    Stripe(#[from] StripeError),
    #[error("Invalid checkout metadata: {0}")]
    InvalidMetadata(String),
    #[error("Invalid checkout: {0}")]
    Validation(String),
    #[error("No price configured for plan {0}")]
    PlanNotConfigured(PlanTier),
    #[error("Checkout session not found: {0}")]
    SessionNotFound(String),
}

/// What applying a provider event or verification did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "server", derive(utoipa::ToSchema))]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcileOutcome {
    PlanApplied { tier: PlanTier },
    PurchaseRecorded,
    Downgraded,
    /// The dedupe key was already claimed.
    Duplicate,
    NotPaid,
    Ignored,
    SessionExpired,
    SessionCancelled,
}

#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub pro_price_id: String,
    pub lifetime_price_id: String,
    pub action_price_cents: i64,
    pub currency: String,
    /// Must contain `{CHECKOUT_SESSION_ID}` so the client can call verify.
    pub success_url: String,
    pub cancel_url: String,
}

/// Turns provider events (webhook or client verify) into tier changes and purchases,
/// applying each checkout at most once.
pub struct PaymentReconciler<A, P, K>
where
    A: AccountRepository,
    P: PaymentRepository,
    K: PaymentProvider,
{
    account_repo: Arc<A>,
    payment_repo: Arc<P>,
    provider: Arc<K>,
    settings: CheckoutSettings,
}

impl<A, P, K> PaymentReconciler<A, P, K>
where
    A: AccountRepository,
    P: PaymentRepository,
    K: PaymentProvider,
{
    pub fn new(
        account_repo: Arc<A>,
        payment_repo: Arc<P>,
        provider: Arc<K>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            account_repo,
            payment_repo,
            provider,
            settings,
        }
    }

    pub async fn start_checkout(
        &self,
        purpose: CheckoutPurpose,
    ) -> Result<CheckoutLink, ReconcileError> {
        let (line_item, amount_cents) = match &purpose {
            CheckoutPurpose::Plan { account_id, plan } => {
                let price_id = match plan {
                    PlanTier::Pro => &self.settings.pro_price_id,
                    PlanTier::Lifetime => &self.settings.lifetime_price_id,
                    other => {
                        return Err(ReconcileError::Validation(format!(
                            "plan {} cannot be purchased",
                            other
                        )))
                    }
                };
                if price_id.is_empty() {
                    return Err(ReconcileError::PlanNotConfigured(*plan));
                }

                let account = self.account_repo.ensure(*account_id).await?;
                if account.plan_tier == PlanTier::Lifetime {
                    return Err(ReconcileError::Validation(
                        "account already has lifetime access".to_string(),
                    ));
                }
                (LineItem::Price(price_id.clone()), None)
            }
            CheckoutPurpose::Action { action_kind, .. } => (
                LineItem::Inline {
                    amount_cents: self.settings.action_price_cents,
                    currency: self.settings.currency.clone(),
                    name: format!("CV action: {}", action_kind),
                },
                Some(self.settings.action_price_cents),
            ),
        };

        let params = CheckoutParams {
            mode: purpose.mode(),
            line_item,
            metadata: purpose.to_metadata(),
            client_reference_id: purpose.principal().account_id().map(|id| id.to_string()),
            success_url: self.settings.success_url.clone(),
            cancel_url: self.settings.cancel_url.clone(),
        };

        let link = self.provider.create_checkout_session(&params).await?;

        let session = PaymentSession::new(
            link.session_id.clone(),
            purpose,
            amount_cents,
            self.settings.currency.clone(),
        );
        self.payment_repo.create_session(&session).await?;

        info!(
            session_id = %link.session_id,
            principal = %session.principal,
            purpose = session.purpose.label(),
            "Checkout session created"
        );

        Ok(link)
    }

    pub async fn handle_event(
        &self,
        event: PaymentEvent,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        match event {
            PaymentEvent::CheckoutCompleted { event_id, session } => {
                debug!(event_id = %event_id, session_id = %session.id, "Checkout completed");
                self.apply_checkout(&session).await
            }
            PaymentEvent::CheckoutExpired {
                event_id,
                session_id,
            } => {
                self.with_claim(&event_id, self.apply_checkout_expired(&session_id))
                    .await
            }
            PaymentEvent::InvoicePaid {
                event_id,
                subscription_id,
            } => {
                let Some(subscription_id) = subscription_id else {
                    return Ok(ReconcileOutcome::Ignored);
                };
                self.with_claim(&event_id, self.apply_invoice_paid(&subscription_id))
                    .await
            }
            PaymentEvent::SubscriptionDeleted {
                event_id,
                subscription_id,
            } => {
                self.with_claim(&event_id, self.apply_subscription_deleted(&subscription_id))
                    .await
            }
            PaymentEvent::Unhandled {
                event_id,
                event_type,
            } => {
                debug!(event_id = %event_id, event_type = %event_type, "Ignoring event");
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    /// Client-side fallback for a missed or delayed webhook. Shares the webhook's
    /// dedupe key, so whichever path arrives second is a no-op.
    pub async fn verify_checkout(
        &self,
        session_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let session = self
            .provider
            .retrieve_checkout_session(session_id)
            .await
            .map_err(|e| match e {
                StripeError::NotFound(id) => ReconcileError::SessionNotFound(id),
                other => ReconcileError::Stripe(other),
            })?;

        self.apply_checkout(&session).await
    }

    pub async fn cancel_checkout(
        &self,
        session_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if self.payment_repo.get_session(session_id).await?.is_none() {
            return Err(ReconcileError::SessionNotFound(session_id.to_string()));
        }

        let cancelled = self
            .payment_repo
            .transition_session(
                session_id,
                &[PaymentSessionState::Created],
                PaymentSessionState::Cancelled,
            )
            .await?;

        if cancelled {
            info!(session_id = %session_id, "Checkout cancelled");
            Ok(ReconcileOutcome::SessionCancelled)
        } else {
            Ok(ReconcileOutcome::Ignored)
        }
    }

    /// Marks sessions left in CREATED longer than `ttl` as expired.
    pub async fn expire_stale_sessions(&self, ttl: Duration) -> Result<usize, ReconcileError> {
        let stale = self
            .payment_repo
            .list_stale_sessions(Utc::now() - ttl)
            .await?;

        let mut expired = 0;
        for session in stale {
            if self
                .payment_repo
                .transition_session(
                    &session.session_id,
                    &[PaymentSessionState::Created],
                    PaymentSessionState::Expired,
                )
                .await?
            {
                expired += 1;
            }
        }

        if expired > 0 {
            info!(count = expired, "Expired stale checkout sessions");
        }
        Ok(expired)
    }

    async fn apply_checkout(
        &self,
        session: &CheckoutSessionSummary,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if !session.paid {
            info!(session_id = %session.id, "Checkout not paid yet");
            return Ok(ReconcileOutcome::NotPaid);
        }

        let purpose = CheckoutPurpose::from_metadata(&session.metadata)
            .map_err(ReconcileError::InvalidMetadata)?;

        let key = checkout_dedupe_key(&session.id);
        self.with_claim(&key, self.apply_paid_checkout(session, purpose))
            .await
    }

    async fn apply_paid_checkout(
        &self,
        session: &CheckoutSessionSummary,
        purpose: CheckoutPurpose,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.mark_verified(session, &purpose).await?;

        let outcome = match &purpose {
            CheckoutPurpose::Plan { account_id, plan } => {
                let account = self.account_repo.ensure(*account_id).await?;
                let next = account.plan_tier.upgraded_to(*plan);
                let subscription_id = if next == PlanTier::Pro {
                    session.subscription_id.as_deref()
                } else {
                    None
                };

                if next == PlanTier::Lifetime && account.stripe_subscription_id.is_some() {
                    warn!(
                        account_id = %account_id,
                        "Lifetime purchased while a subscription is still on file"
                    );
                }

                self.account_repo
                    .apply_plan(
                        *account_id,
                        next,
                        session.customer_id.as_deref(),
                        subscription_id,
                    )
                    .await?;

                info!(
                    account_id = %account_id,
                    from = %account.plan_tier,
                    to = %next,
                    session_id = %session.id,
                    "Plan applied"
                );
                ReconcileOutcome::PlanApplied { tier: next }
            }
            CheckoutPurpose::Action {
                principal,
                action_kind,
            } => {
                let purchase = Purchase {
                    session_id: session.id.clone(),
                    principal: principal.clone(),
                    action_kind: *action_kind,
                    amount_cents: session
                        .amount_total
                        .unwrap_or(self.settings.action_price_cents),
                    currency: session
                        .currency
                        .clone()
                        .unwrap_or_else(|| self.settings.currency.clone()),
                    created_at: Utc::now(),
                };

                match self.payment_repo.insert_purchase(&purchase).await {
                    Ok(()) => {
                        info!(
                            session_id = %session.id,
                            principal = %principal,
                            action = %action_kind,
                            "Purchase recorded"
                        );
                    }
                    Err(RepositoryError::Conflict(_)) => {
                        warn!(session_id = %session.id, "Purchase already recorded");
                    }
                    Err(e) => return Err(e.into()),
                }
                ReconcileOutcome::PurchaseRecorded
            }
        };

        self.payment_repo
            .transition_session(
                &session.id,
                &[PaymentSessionState::Verified],
                PaymentSessionState::Applied,
            )
            .await?;

        Ok(outcome)
    }

    async fn mark_verified(
        &self,
        session: &CheckoutSessionSummary,
        purpose: &CheckoutPurpose,
    ) -> Result<(), ReconcileError> {
        if self.payment_repo.get_session(&session.id).await?.is_some() {
            self.payment_repo
                .transition_session(
                    &session.id,
                    &PaymentSessionState::predecessors(PaymentSessionState::Verified),
                    PaymentSessionState::Verified,
                )
                .await?;
            return Ok(());
        }

        // Checkout opened outside this service (e.g. a payment link).
        let mut record = PaymentSession::new(
            session.id.clone(),
            purpose.clone(),
            session.amount_total,
            session
                .currency
                .clone()
                .unwrap_or_else(|| self.settings.currency.clone()),
        );
        record.state = PaymentSessionState::Verified;

        match self.payment_repo.create_session(&record).await {
            Ok(()) | Err(RepositoryError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_checkout_expired(
        &self,
        session_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let expired = self
            .payment_repo
            .transition_session(
                session_id,
                &[PaymentSessionState::Created],
                PaymentSessionState::Expired,
            )
            .await?;

        debug!(session_id = %session_id, expired, "Checkout expired at provider");
        Ok(if expired {
            ReconcileOutcome::SessionExpired
        } else {
            ReconcileOutcome::Ignored
        })
    }

    /// Renewals need no tier change: PRO stays PRO until the subscription is deleted,
    /// and a deleted subscription is never revived by a late invoice.
    async fn apply_invoice_paid(
        &self,
        subscription_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        match self.account_repo.find_by_subscription(subscription_id).await? {
            Some(account) => {
                info!(
                    account_id = %account.id,
                    tier = %account.plan_tier,
                    subscription_id = %subscription_id,
                    "Subscription invoice paid"
                );
            }
            None => {
                warn!(subscription_id = %subscription_id, "Invoice for unknown subscription");
            }
        }
        Ok(ReconcileOutcome::Ignored)
    }

    async fn apply_subscription_deleted(
        &self,
        subscription_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if self
            .account_repo
            .downgrade_subscription(subscription_id)
            .await?
        {
            info!(subscription_id = %subscription_id, "Subscription ended, downgraded to FREEMIUM");
            Ok(ReconcileOutcome::Downgraded)
        } else {
            info!(
                subscription_id = %subscription_id,
                "Subscription ended but account is not on it; nothing to do"
            );
            Ok(ReconcileOutcome::Ignored)
        }
    }

    /// Runs `work` only if `key` has not been processed, releasing the claim when
    /// `work` fails so a retry can apply it.
    async fn with_claim<F>(&self, key: &str, work: F) -> Result<ReconcileOutcome, ReconcileError>
    where
        F: Future<Output = Result<ReconcileOutcome, ReconcileError>>,
    {
        if !self.payment_repo.claim_event(key).await? {
            info!(key = %key, "Already processed");
            return Ok(ReconcileOutcome::Duplicate);
        }

        match work.await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(release_err) = self.payment_repo.release_event(key).await {
                    error!(key = %key, error = %release_err, "Failed to release event claim");
                }
                Err(e)
            }
        }
    }
}
