use crate::domain::{validate_fingerprint_hash, FingerprintRecord, Principal};
use crate::infrastructure::{AccountRepository, FingerprintRepository, RepositoryError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Maps a request's fingerprint (and optional account) onto exactly one principal,
/// making sure the fingerprint row exists before anything references it.
pub struct IdentityResolver<F, A>
where
    F: FingerprintRepository,
    A: AccountRepository,
{
    fingerprint_repo: Arc<F>,
    account_repo: Arc<A>,
}

impl<F, A> IdentityResolver<F, A>
where
    F: FingerprintRepository,
    A: AccountRepository,
{
    pub fn new(fingerprint_repo: Arc<F>, account_repo: Arc<A>) -> Self {
        Self {
            fingerprint_repo,
            account_repo,
        }
    }

    pub async fn resolve(
        &self,
        fingerprint_hash: &str,
        account_id: Option<Uuid>,
    ) -> Result<Principal, IdentityError> {
        validate_fingerprint_hash(fingerprint_hash).map_err(IdentityError::InvalidFingerprint)?;

        // fingerprints.account_id references accounts
        if let Some(account_id) = account_id {
            self.account_repo.ensure(account_id).await?;
        }

        let record = match self.fingerprint_repo.find_by_hash(fingerprint_hash).await? {
            Some(existing) => existing,
            None => self.create_fingerprint(fingerprint_hash, account_id).await?,
        };

        match account_id {
            Some(account_id) => {
                if record.account_id != Some(account_id) {
                    self.fingerprint_repo
                        .link_account(fingerprint_hash, account_id)
                        .await?;
                    info!(
                        fingerprint_id = %record.id,
                        account_id = %account_id,
                        previous = ?record.account_id,
                        "Linked fingerprint to account"
                    );
                }
                Ok(Principal::account(account_id))
            }
            None => Ok(Principal::anonymous(fingerprint_hash)),
        }
    }

    async fn create_fingerprint(
        &self,
        fingerprint_hash: &str,
        account_id: Option<Uuid>,
    ) -> Result<FingerprintRecord, IdentityError> {
        let record = FingerprintRecord::new(fingerprint_hash.to_string(), account_id);

        match self.fingerprint_repo.insert(&record).await {
            Ok(()) => {
                debug!(fingerprint_id = %record.id, "Created fingerprint");
                Ok(record)
            }
            Err(RepositoryError::Conflict(_)) => {
                // A concurrent first request inserted it; use theirs.
                debug!("Fingerprint insert raced, re-reading");
                self.fingerprint_repo
                    .find_by_hash(fingerprint_hash)
                    .await?
                    .ok_or_else(|| {
                        RepositoryError::NotFound("Fingerprint after conflict".to_string()).into()
                    })
            }
            Err(e) => Err(e.into()),
        }
    }
}
