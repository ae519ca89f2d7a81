use crate::domain::{ArtifactKind, SavedArtifact};
use crate::infrastructure::{ArtifactRepository, RepositoryError};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const MAX_TITLE_LEN: usize = 200;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Artifact not found: {0}")]
    NotFound(Uuid),
    #[error("Invalid artifact: {0}")]
    Invalid(String),
    #[error("At most {max} {kind} artifacts per CV")]
    LimitReached { kind: ArtifactKind, max: i64 },
}

/// Create-or-update request. `id` set means update.
#[derive(Debug, Clone)]
pub struct SaveArtifact {
    pub id: Option<Uuid>,
    pub kind: ArtifactKind,
    pub parent_id: Option<Uuid>,
    pub title: String,
    pub content: serde_json::Value,
}

pub struct ArtifactService<R>
where
    R: ArtifactRepository,
{
    repo: Arc<R>,
    max_per_parent: i64,
}

impl<R> ArtifactService<R>
where
    R: ArtifactRepository,
{
    pub fn new(repo: Arc<R>, max_per_parent: i64) -> Self {
        Self {
            repo,
            max_per_parent,
        }
    }

    pub async fn save(
        &self,
        account_id: Uuid,
        req: SaveArtifact,
    ) -> Result<SavedArtifact, ArtifactError> {
        let title = req.title.trim();
        if title.is_empty() || title.len() > MAX_TITLE_LEN {
            return Err(ArtifactError::Invalid(format!(
                "title must be 1-{} characters",
                MAX_TITLE_LEN
            )));
        }

        if let Some(id) = req.id {
            let existing = self.owned(account_id, id).await?;
            if existing.kind != req.kind {
                return Err(ArtifactError::Invalid(
                    "artifact kind cannot change".to_string(),
                ));
            }
            return self
                .repo
                .update_content(id, account_id, title, &req.content)
                .await
                .map_err(|e| not_found_as(e, id));
        }

        match (req.kind.requires_parent(), req.parent_id) {
            (true, None) => {
                return Err(ArtifactError::Invalid(format!(
                    "{} needs a parent CV",
                    req.kind
                )))
            }
            (false, Some(_)) => {
                return Err(ArtifactError::Invalid("a CV cannot have a parent".to_string()))
            }
            (true, Some(parent_id)) => {
                let parent = self.owned(account_id, parent_id).await?;
                if parent.kind != ArtifactKind::Cv {
                    return Err(ArtifactError::Invalid("parent must be a CV".to_string()));
                }
                let existing = self.repo.count_children(parent_id, req.kind).await?;
                if existing >= self.max_per_parent {
                    return Err(ArtifactError::LimitReached {
                        kind: req.kind,
                        max: self.max_per_parent,
                    });
                }
            }
            (false, None) => {}
        }

        let artifact = SavedArtifact::new(
            account_id,
            req.kind,
            req.parent_id,
            title.to_string(),
            req.content,
        );
        self.repo.create(&artifact).await?;

        info!(
            artifact_id = %artifact.id,
            account_id = %account_id,
            kind = %artifact.kind,
            "Artifact saved"
        );
        Ok(artifact)
    }

    pub async fn get(&self, account_id: Uuid, id: Uuid) -> Result<SavedArtifact, ArtifactError> {
        self.owned(account_id, id).await
    }

    pub async fn list(&self, account_id: Uuid) -> Result<Vec<SavedArtifact>, ArtifactError> {
        Ok(self.repo.list_by_account(account_id).await?)
    }

    /// Children of a deleted CV go with it.
    pub async fn delete(&self, account_id: Uuid, id: Uuid) -> Result<(), ArtifactError> {
        self.repo
            .delete(id, account_id)
            .await
            .map_err(|e| not_found_as(e, id))?;
        info!(artifact_id = %id, account_id = %account_id, "Artifact deleted");
        Ok(())
    }

    /// Another account's artifact reads as missing.
    async fn owned(&self, account_id: Uuid, id: Uuid) -> Result<SavedArtifact, ArtifactError> {
        let artifact = self
            .repo
            .get_by_id(id)
            .await
            .map_err(|e| not_found_as(e, id))?;

        if artifact.account_id != account_id {
            return Err(ArtifactError::NotFound(id));
        }
        Ok(artifact)
    }
}

fn not_found_as(e: RepositoryError, id: Uuid) -> ArtifactError {
    match e {
        RepositoryError::NotFound(_) => ArtifactError::NotFound(id),
        other => ArtifactError::Repository(other),
    }
}
