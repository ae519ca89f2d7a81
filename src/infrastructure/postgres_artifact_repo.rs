use crate::domain::{ArtifactKind, SavedArtifact};
use crate::infrastructure::{ArtifactRepository, RepositoryError};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

pub struct PostgresArtifactRepository {
    pool: PgPool,
}

impl PostgresArtifactRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArtifactRepository for PostgresArtifactRepository {
    async fn create(&self, artifact: &SavedArtifact) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO saved_artifacts (id, account_id, kind, parent_id, title, content,
                                         created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(artifact.id)
        .bind(artifact.account_id)
        .bind(artifact.kind.to_string())
        .bind(artifact.parent_id)
        .bind(&artifact.title)
        .bind(&artifact.content)
        .bind(artifact.created_at)
        .bind(artifact.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<SavedArtifact, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, kind, parent_id, title, content, created_at, updated_at
            FROM saved_artifacts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => RepositoryError::NotFound(format!("Artifact {}", id)),
            _ => RepositoryError::DatabaseError(e),
        })?;

        row_to_artifact(&row)
    }

    async fn list_by_account(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<SavedArtifact>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, kind, parent_id, title, content, created_at, updated_at
            FROM saved_artifacts
            WHERE account_id = $1
            ORDER BY updated_at DESC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_artifact).collect()
    }

    async fn count_children(
        &self,
        parent_id: Uuid,
        kind: ArtifactKind,
    ) -> Result<i64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM saved_artifacts
            WHERE parent_id = $1 AND kind = $2
            "#,
        )
        .bind(parent_id)
        .bind(kind.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn update_content(
        &self,
        id: Uuid,
        account_id: Uuid,
        title: &str,
        content: &serde_json::Value,
    ) -> Result<SavedArtifact, RepositoryError> {
        let row = sqlx::query(
            r#"
            UPDATE saved_artifacts
            SET title = $1, content = $2, updated_at = $3
            WHERE id = $4 AND account_id = $5
            RETURNING id, account_id, kind, parent_id, title, content, created_at, updated_at
            "#,
        )
        .bind(title)
        .bind(content)
        .bind(Utc::now())
        .bind(id)
        .bind(account_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => RepositoryError::NotFound(format!("Artifact {}", id)),
            _ => RepositoryError::DatabaseError(e),
        })?;

        row_to_artifact(&row)
    }

    async fn delete(&self, id: Uuid, account_id: Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            DELETE FROM saved_artifacts
            WHERE id = $1 AND account_id = $2
            "#,
        )
        .bind(id)
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("Artifact {}", id)));
        }

        Ok(())
    }
}

fn row_to_artifact(row: &sqlx::postgres::PgRow) -> Result<SavedArtifact, RepositoryError> {
    let kind_str: String = row.try_get("kind")?;

    Ok(SavedArtifact {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        kind: ArtifactKind::from_str(&kind_str)
            .map_err(|_| RepositoryError::InvalidData(format!("Unknown kind: {}", kind_str)))?,
        parent_id: row.try_get("parent_id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
