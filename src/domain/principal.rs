use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Identity against which quota is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    Anonymous { fingerprint_hash: String },
    Account { account_id: Uuid },
}

impl Principal {
    pub fn anonymous(fingerprint_hash: impl Into<String>) -> Self {
        Principal::Anonymous {
            fingerprint_hash: fingerprint_hash.into(),
        }
    }

    pub fn account(account_id: Uuid) -> Self {
        Principal::Account { account_id }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Principal::Anonymous { .. })
    }

    pub fn account_id(&self) -> Option<Uuid> {
        match self {
            Principal::Account { account_id } => Some(*account_id),
            Principal::Anonymous { .. } => None,
        }
    }

    pub fn fingerprint_hash(&self) -> Option<&str> {
        match self {
            Principal::Anonymous { fingerprint_hash } => Some(fingerprint_hash),
            Principal::Account { .. } => None,
        }
    }

    /// Stable key used to serialize quota reservations for this principal.
    pub fn lock_key(&self) -> String {
        match self {
            Principal::Anonymous { fingerprint_hash } => format!("fp:{}", fingerprint_hash),
            Principal::Account { account_id } => format!("acct:{}", account_id),
        }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Principal::Anonymous { fingerprint_hash } => {
                // Prefix only; full hashes do not belong in logs.
                let shown: String = fingerprint_hash.chars().take(8).collect();
                write!(f, "anonymous:{}", shown)
            }
            Principal::Account { account_id } => write!(f, "account:{}", account_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FingerprintRecord {
    pub id: Uuid,
    pub fingerprint_hash: String,
    pub account_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FingerprintRecord {
    pub fn new(fingerprint_hash: String, account_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            fingerprint_hash,
            account_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Whether an account's quota also counts usage made anonymously by fingerprints
/// later linked to that account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AnonymousHistoryPolicy {
    /// Linking starts the account with its own, separate history.
    Separate,
    /// Linked fingerprints' anonymous usage counts against the account.
    CarryOver,
}

impl Default for AnonymousHistoryPolicy {
    fn default() -> Self {
        AnonymousHistoryPolicy::Separate
    }
}

pub const FINGERPRINT_MIN_LEN: usize = 8;
pub const FINGERPRINT_MAX_LEN: usize = 256;

/// Basic format check on a client-computed fingerprint hash.
pub fn validate_fingerprint_hash(hash: &str) -> Result<(), String> {
    if hash.len() < FINGERPRINT_MIN_LEN || hash.len() > FINGERPRINT_MAX_LEN {
        return Err(format!(
            "fingerprint must be between {} and {} characters",
            FINGERPRINT_MIN_LEN, FINGERPRINT_MAX_LEN
        ));
    }

    if !hash
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
    {
        return Err("fingerprint contains invalid characters".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn fingerprint_validation() {
        assert!(validate_fingerprint_hash("a1b2c3d4e5f6").is_ok());
        assert!(validate_fingerprint_hash("fp:abc-123_XYZ").is_ok());
        assert!(validate_fingerprint_hash("short").is_err());
        assert!(validate_fingerprint_hash("has spaces in it").is_err());
        assert!(validate_fingerprint_hash(&"a".repeat(FINGERPRINT_MAX_LEN + 1)).is_err());
    }

    #[test]
    fn principal_accessors_follow_variant() {
        let anon = Principal::anonymous("abcdef123456");
        assert!(anon.is_anonymous());
        assert_eq!(anon.fingerprint_hash(), Some("abcdef123456"));
        assert_eq!(anon.account_id(), None);

        let id = Uuid::new_v4();
        let acct = Principal::account(id);
        assert!(!acct.is_anonymous());
        assert_eq!(acct.account_id(), Some(id));
        assert_eq!(acct.fingerprint_hash(), None);
        assert_ne!(anon.lock_key(), acct.lock_key());
    }

    #[test]
    fn display_truncates_fingerprint() {
        let anon = Principal::anonymous("abcdef1234567890");
        assert_eq!(anon.to_string(), "anonymous:abcdef12");
    }

    #[test]
    fn history_policy_parses_config_values() {
        assert_eq!(
            AnonymousHistoryPolicy::from_str("carry_over").unwrap(),
            AnonymousHistoryPolicy::CarryOver
        );
        assert_eq!(AnonymousHistoryPolicy::default(), AnonymousHistoryPolicy::Separate);
    }
}
