use crate::domain::{
    Account, ActionKind, AnonymousHistoryPolicy, ArtifactKind, FingerprintRecord,
    PaymentSession, PaymentSessionState, PlanTier, Principal, Purchase, Reservation,
    SavedArtifact, UsageRecord, UsageTally,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

#[async_trait]
pub trait FingerprintRepository: Send + Sync {
    #[must_use]
    async fn find_by_hash(
        &self,
        fingerprint_hash: &str,
    ) -> Result<Option<FingerprintRecord>, RepositoryError>;
    /// Fails with `Conflict` when a row for the same hash already exists.
    #[must_use]
    async fn insert(&self, record: &FingerprintRecord) -> Result<(), RepositoryError>;
    #[must_use]
    async fn link_account(
        &self,
        fingerprint_hash: &str,
        account_id: Uuid,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Returns the account, creating it as FREEMIUM if it does not exist yet.
    #[must_use]
    async fn ensure(&self, id: Uuid) -> Result<Account, RepositoryError>;
    #[must_use]
    async fn get_by_id(&self, id: Uuid) -> Result<Account, RepositoryError>;
    /// Sets the plan tier and provider ids. Never moves an account off LIFETIME.
    #[must_use]
    async fn apply_plan(
        &self,
        id: Uuid,
        tier: PlanTier,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> Result<(), RepositoryError>;
    #[must_use]
    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Account>, RepositoryError>;
    /// PRO -> FREEMIUM only when the stored subscription id still matches.
    /// Returns whether a row changed.
    #[must_use]
    async fn downgrade_subscription(&self, subscription_id: &str)
        -> Result<bool, RepositoryError>;
}

/// Append-only quota ledger.
#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Unconditional append. Duplicate payment evidence fails with `Conflict`.
    #[must_use]
    async fn append(&self, record: &UsageRecord) -> Result<(), RepositoryError>;
    /// Counts free records in scope and appends only while below `limit`,
    /// serialized per principal so concurrent callers cannot both take the last slot.
    #[must_use]
    async fn append_within_limit(
        &self,
        record: &UsageRecord,
        limit: i64,
        policy: AnonymousHistoryPolicy,
    ) -> Result<Reservation, RepositoryError>;
    #[must_use]
    async fn tally(
        &self,
        principal: &Principal,
        policy: AnonymousHistoryPolicy,
    ) -> Result<UsageTally, RepositoryError>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    #[must_use]
    async fn create_session(&self, session: &PaymentSession) -> Result<(), RepositoryError>;
    #[must_use]
    async fn get_session(&self, session_id: &str)
        -> Result<Option<PaymentSession>, RepositoryError>;
    /// Moves the session to `to` only if its current state is one of `from`.
    /// Returns whether a row changed.
    #[must_use]
    async fn transition_session(
        &self,
        session_id: &str,
        from: &[PaymentSessionState],
        to: PaymentSessionState,
    ) -> Result<bool, RepositoryError>;
    /// Sessions still CREATED that were opened before `before`.
    #[must_use]
    async fn list_stale_sessions(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<PaymentSession>, RepositoryError>;
    /// Inserts the dedupe key; returns false if it was already claimed.
    #[must_use]
    async fn claim_event(&self, key: &str) -> Result<bool, RepositoryError>;
    #[must_use]
    async fn release_event(&self, key: &str) -> Result<(), RepositoryError>;
    /// Fails with `Conflict` if a purchase already exists for the session.
    #[must_use]
    async fn insert_purchase(&self, purchase: &Purchase) -> Result<(), RepositoryError>;
    #[must_use]
    async fn get_purchase(&self, session_id: &str) -> Result<Option<Purchase>, RepositoryError>;
}

#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    #[must_use]
    async fn create(&self, artifact: &SavedArtifact) -> Result<(), RepositoryError>;
    #[must_use]
    async fn get_by_id(&self, id: Uuid) -> Result<SavedArtifact, RepositoryError>;
    #[must_use]
    async fn list_by_account(&self, account_id: Uuid) -> Result<Vec<SavedArtifact>, RepositoryError>;
    #[must_use]
    async fn count_children(
        &self,
        parent_id: Uuid,
        kind: ArtifactKind,
    ) -> Result<i64, RepositoryError>;
    /// Updates title/content of an artifact owned by `account_id`.
    #[must_use]
    async fn update_content(
        &self,
        id: Uuid,
        account_id: Uuid,
        title: &str,
        content: &serde_json::Value,
    ) -> Result<SavedArtifact, RepositoryError>;
    #[must_use]
    async fn delete(&self, id: Uuid, account_id: Uuid) -> Result<(), RepositoryError>;
}

pub(crate) fn map_write_error(e: sqlx::Error, what: &str) -> RepositoryError {
    match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            RepositoryError::Conflict(what.to_string())
        }
        other => RepositoryError::DatabaseError(other),
    }
}

pub(crate) fn principal_columns(principal: &Principal) -> (Option<&str>, Option<Uuid>) {
    match principal {
        Principal::Anonymous { fingerprint_hash } => (Some(fingerprint_hash.as_str()), None),
        Principal::Account { account_id } => (None, Some(*account_id)),
    }
}

pub(crate) fn principal_from_columns(
    fingerprint_hash: Option<String>,
    account_id: Option<Uuid>,
) -> Result<Principal, RepositoryError> {
    match (fingerprint_hash, account_id) {
        (None, Some(id)) => Ok(Principal::account(id)),
        (Some(hash), None) => Ok(Principal::anonymous(hash)),
        _ => Err(RepositoryError::InvalidData(
            "row must reference exactly one of fingerprint_hash or account_id".to_string(),
        )),
    }
}

pub struct PostgresFingerprintRepository {
    pool: PgPool,
}

impl PostgresFingerprintRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FingerprintRepository for PostgresFingerprintRepository {
    async fn find_by_hash(
        &self,
        fingerprint_hash: &str,
    ) -> Result<Option<FingerprintRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, fingerprint_hash, account_id, created_at, updated_at
            FROM fingerprints
            WHERE fingerprint_hash = $1
            "#,
        )
        .bind(fingerprint_hash)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(FingerprintRecord {
                id: r.try_get("id")?,
                fingerprint_hash: r.try_get("fingerprint_hash")?,
                account_id: r.try_get("account_id")?,
                created_at: r.try_get("created_at")?,
                updated_at: r.try_get("updated_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn insert(&self, record: &FingerprintRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO fingerprints (id, fingerprint_hash, account_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.id)
        .bind(&record.fingerprint_hash)
        .bind(record.account_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, "fingerprint already exists"))?;

        Ok(())
    }

    async fn link_account(
        &self,
        fingerprint_hash: &str,
        account_id: Uuid,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE fingerprints
            SET account_id = $1, updated_at = $2
            WHERE fingerprint_hash = $3
            "#,
        )
        .bind(account_id)
        .bind(Utc::now())
        .bind(fingerprint_hash)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound("Fingerprint".to_string()));
        }

        Ok(())
    }
}

pub struct PostgresAccountRepository {
    pool: PgPool,
}

impl PostgresAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ACCOUNT_COLUMNS: &str =
    "id, plan_tier, stripe_customer_id, stripe_subscription_id, created_at, updated_at";

#[async_trait]
impl AccountRepository for PostgresAccountRepository {
    async fn ensure(&self, id: Uuid) -> Result<Account, RepositoryError> {
        let account = Account::new(id);

        sqlx::query(
            r#"
            INSERT INTO accounts (id, plan_tier, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(account.id)
        .bind(account.plan_tier.to_string())
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_by_id(id).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Account, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => RepositoryError::NotFound(format!("Account {}", id)),
            _ => RepositoryError::DatabaseError(e),
        })?;

        row_to_account(&row)
    }

    async fn apply_plan(
        &self,
        id: Uuid,
        tier: PlanTier,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET plan_tier = $1,
                stripe_customer_id = COALESCE($2, stripe_customer_id),
                stripe_subscription_id = COALESCE($3, stripe_subscription_id),
                updated_at = $4
            WHERE id = $5
              AND (plan_tier <> 'LIFETIME' OR $1 = 'LIFETIME')
            "#,
        )
        .bind(tier.to_string())
        .bind(customer_id)
        .bind(subscription_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either missing or already LIFETIME; only the former is an error.
            let account = self.get_by_id(id).await?;
            if account.plan_tier != PlanTier::Lifetime {
                return Err(RepositoryError::InvalidData(format!(
                    "Account {} was not updated",
                    id
                )));
            }
        }

        Ok(())
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Account>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE stripe_subscription_id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_account).transpose()
    }

    async fn downgrade_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET plan_tier = 'FREEMIUM', stripe_subscription_id = NULL, updated_at = $1
            WHERE stripe_subscription_id = $2
              AND plan_tier = 'PRO'
            "#,
        )
        .bind(Utc::now())
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn row_to_account(row: &sqlx::postgres::PgRow) -> Result<Account, RepositoryError> {
    let tier_str: String = row.try_get("plan_tier")?;
    let plan_tier = PlanTier::from_str(&tier_str)
        .map_err(|_| RepositoryError::InvalidData(format!("Unknown tier: {}", tier_str)))?;

    Ok(Account {
        id: row.try_get("id")?,
        plan_tier,
        stripe_customer_id: row.try_get("stripe_customer_id")?,
        stripe_subscription_id: row.try_get("stripe_subscription_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub struct PostgresUsageRepository {
    pool: PgPool,
}

impl PostgresUsageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// WHERE fragment selecting the ledger rows that count for `principal`; `$1` is
/// the fingerprint hash or account id.
fn scope_clause(principal: &Principal, policy: AnonymousHistoryPolicy) -> &'static str {
    match (principal, policy) {
        (Principal::Anonymous { .. }, _) => "fingerprint_hash = $1",
        (Principal::Account { .. }, AnonymousHistoryPolicy::Separate) => "account_id = $1",
        (Principal::Account { .. }, AnonymousHistoryPolicy::CarryOver) => {
            "(account_id = $1 OR fingerprint_hash IN \
             (SELECT fingerprint_hash FROM fingerprints WHERE account_id = $1))"
        }
    }
}

async fn insert_usage<'e, E>(executor: E, record: &UsageRecord) -> Result<(), RepositoryError>
where
    E: sqlx::PgExecutor<'e>,
{
    let (fingerprint_hash, account_id) = principal_columns(&record.principal);

    sqlx::query(
        r#"
        INSERT INTO usage_records (id, fingerprint_hash, account_id, action_kind,
                                   amount_paid_cents, payment_evidence, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(record.id)
    .bind(fingerprint_hash)
    .bind(account_id)
    .bind(record.action_kind.to_string())
    .bind(record.amount_paid_cents)
    .bind(&record.payment_evidence)
    .bind(record.created_at)
    .execute(executor)
    .await
    .map_err(|e| map_write_error(e, "payment evidence already consumed"))?;

    Ok(())
}

#[async_trait]
impl UsageRepository for PostgresUsageRepository {
    async fn append(&self, record: &UsageRecord) -> Result<(), RepositoryError> {
        insert_usage(&self.pool, record).await
    }

    async fn append_within_limit(
        &self,
        record: &UsageRecord,
        limit: i64,
        policy: AnonymousHistoryPolicy,
    ) -> Result<Reservation, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // Held until commit/rollback; serializes reservations per principal.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(record.principal.lock_key())
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "SELECT COUNT(*) FROM usage_records WHERE payment_evidence IS NULL AND {}",
            scope_clause(&record.principal, policy)
        );
        let free_used: i64 = match &record.principal {
            Principal::Anonymous { fingerprint_hash } => {
                sqlx::query_scalar(&sql)
                    .bind(fingerprint_hash)
                    .fetch_one(&mut *tx)
                    .await?
            }
            Principal::Account { account_id } => {
                sqlx::query_scalar(&sql)
                    .bind(account_id)
                    .fetch_one(&mut *tx)
                    .await?
            }
        };

        if free_used >= limit {
            tx.rollback().await?;
            return Ok(Reservation::Exhausted { free_used });
        }

        insert_usage(&mut *tx, record).await?;
        tx.commit().await?;

        Ok(Reservation::Recorded(record.clone()))
    }

    async fn tally(
        &self,
        principal: &Principal,
        policy: AnonymousHistoryPolicy,
    ) -> Result<UsageTally, RepositoryError> {
        let sql = format!(
            r#"
            SELECT action_kind, (payment_evidence IS NOT NULL) AS paid, COUNT(*) AS n
            FROM usage_records
            WHERE {}
            GROUP BY action_kind, (payment_evidence IS NOT NULL)
            "#,
            scope_clause(principal, policy)
        );

        let rows = match principal {
            Principal::Anonymous { fingerprint_hash } => {
                sqlx::query(&sql)
                    .bind(fingerprint_hash)
                    .fetch_all(&self.pool)
                    .await?
            }
            Principal::Account { account_id } => {
                sqlx::query(&sql)
                    .bind(account_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut tally = UsageTally::default();
        for row in rows {
            let kind_str: String = row.try_get("action_kind")?;
            let kind = ActionKind::from_str(&kind_str).map_err(|_| {
                RepositoryError::InvalidData(format!("Unknown action kind: {}", kind_str))
            })?;
            tally.add(kind, row.try_get("paid")?, row.try_get("n")?);
        }

        Ok(tally)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_columns_are_exclusive() {
        let anon = Principal::anonymous("abcdef123456");
        assert_eq!(principal_columns(&anon), (Some("abcdef123456"), None));

        let id = Uuid::new_v4();
        assert_eq!(principal_columns(&Principal::account(id)), (None, Some(id)));
    }

    #[test]
    fn principal_from_columns_rejects_ambiguous_rows() {
        let id = Uuid::new_v4();
        assert_eq!(
            principal_from_columns(None, Some(id)).unwrap(),
            Principal::account(id)
        );
        assert!(principal_from_columns(Some("fp".into()), Some(id)).is_err());
        assert!(principal_from_columns(None, None).is_err());
    }

    #[test]
    fn scope_clause_respects_history_policy() {
        let acct = Principal::account(Uuid::new_v4());
        assert_eq!(
            scope_clause(&acct, AnonymousHistoryPolicy::Separate),
            "account_id = $1"
        );
        assert!(scope_clause(&acct, AnonymousHistoryPolicy::CarryOver).contains("fingerprints"));
        assert_eq!(
            scope_clause(
                &Principal::anonymous("abcdef123456"),
                AnonymousHistoryPolicy::CarryOver
            ),
            "fingerprint_hash = $1"
        );
    }
}
