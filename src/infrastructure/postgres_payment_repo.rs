use crate::domain::{ActionKind, CheckoutPurpose, PaymentSession, PaymentSessionState, Purchase};
use crate::infrastructure::{
    map_write_error, principal_columns, principal_from_columns, PaymentRepository,
    RepositoryError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::str::FromStr;

pub struct PostgresPaymentRepository {
    pool: PgPool,
}

impl PostgresPaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SESSION_COLUMNS: &str = "session_id, fingerprint_hash, account_id, purpose, state, \
                               amount_cents, currency, created_at, updated_at";

#[async_trait]
impl PaymentRepository for PostgresPaymentRepository {
    async fn create_session(&self, session: &PaymentSession) -> Result<(), RepositoryError> {
        let purpose_json = serde_json::to_value(&session.purpose).map_err(|e| {
            RepositoryError::InvalidData(format!("Failed to serialize checkout purpose: {}", e))
        })?;
        let (fingerprint_hash, account_id) = principal_columns(&session.principal);

        sqlx::query(
            r#"
            INSERT INTO payment_sessions (session_id, fingerprint_hash, account_id, purpose,
                                          state, amount_cents, currency, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&session.session_id)
        .bind(fingerprint_hash)
        .bind(account_id)
        .bind(purpose_json)
        .bind(session.state.to_string())
        .bind(session.amount_cents)
        .bind(&session.currency)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, "payment session already exists"))?;

        Ok(())
    }

    async fn get_session(
        &self,
        session_id: &str,
    ) -> Result<Option<PaymentSession>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payment_sessions WHERE session_id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn transition_session(
        &self,
        session_id: &str,
        from: &[PaymentSessionState],
        to: PaymentSessionState,
    ) -> Result<bool, RepositoryError> {
        let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();

        let result = sqlx::query(
            r#"
            UPDATE payment_sessions
            SET state = $1, updated_at = $2
            WHERE session_id = $3
              AND state = ANY($4)
            "#,
        )
        .bind(to.to_string())
        .bind(Utc::now())
        .bind(session_id)
        .bind(from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_stale_sessions(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<PaymentSession>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payment_sessions WHERE state = 'CREATED' AND created_at < $1",
            SESSION_COLUMNS
        ))
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_session).collect()
    }

    async fn claim_event(&self, key: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_key, processed_at)
            VALUES ($1, $2)
            ON CONFLICT (event_key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_event(&self, key: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM processed_events WHERE event_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert_purchase(&self, purchase: &Purchase) -> Result<(), RepositoryError> {
        let (fingerprint_hash, account_id) = principal_columns(&purchase.principal);

        sqlx::query(
            r#"
            INSERT INTO purchases (session_id, fingerprint_hash, account_id, action_kind,
                                   amount_cents, currency, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&purchase.session_id)
        .bind(fingerprint_hash)
        .bind(account_id)
        .bind(purchase.action_kind.to_string())
        .bind(purchase.amount_cents)
        .bind(&purchase.currency)
        .bind(purchase.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, "purchase already recorded"))?;

        Ok(())
    }

    async fn get_purchase(&self, session_id: &str) -> Result<Option<Purchase>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT session_id, fingerprint_hash, account_id, action_kind,
                   amount_cents, currency, created_at
            FROM purchases
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let kind_str: String = r.try_get("action_kind")?;
                Ok(Some(Purchase {
                    session_id: r.try_get("session_id")?,
                    principal: principal_from_columns(
                        r.try_get("fingerprint_hash")?,
                        r.try_get("account_id")?,
                    )?,
                    action_kind: ActionKind::from_str(&kind_str).map_err(|_| {
                        RepositoryError::InvalidData(format!("Unknown action kind: {}", kind_str))
                    })?,
                    amount_cents: r.try_get("amount_cents")?,
                    currency: r.try_get("currency")?,
                    created_at: r.try_get("created_at")?,
                }))
            }
            None => Ok(None),
        }
    }
}

fn row_to_session(row: &sqlx::postgres::PgRow) -> Result<PaymentSession, RepositoryError> {
    let purpose_json: serde_json::Value = row.try_get("purpose")?;
    let purpose: CheckoutPurpose = serde_json::from_value(purpose_json).map_err(|e| {
        RepositoryError::InvalidData(format!("Failed to deserialize checkout purpose: {}", e))
    })?;
    let state_str: String = row.try_get("state")?;

    Ok(PaymentSession {
        session_id: row.try_get("session_id")?,
        principal: principal_from_columns(row.try_get("fingerprint_hash")?, row.try_get("account_id")?)?,
        purpose,
        state: PaymentSessionState::from_str(&state_str).map_err(|_| {
            RepositoryError::InvalidData(format!("Unknown session state: {}", state_str))
        })?,
        amount_cents: row.try_get("amount_cents")?,
        currency: row.try_get("currency")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
