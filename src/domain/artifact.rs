use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[cfg_attr(feature = "server", derive(utoipa::ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    Cv,
    CoverLetter,
    Email,
}

impl ArtifactKind {
    /// Cover letters and emails hang off a parent CV.
    pub fn requires_parent(self) -> bool {
        matches!(self, ArtifactKind::CoverLetter | ArtifactKind::Email)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "server", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct SavedArtifact {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: ArtifactKind,
    pub parent_id: Option<Uuid>,
    pub title: String,
    #[cfg_attr(feature = "server", schema(value_type = Object))]
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SavedArtifact {
    pub fn new(
        account_id: Uuid,
        kind: ArtifactKind,
        parent_id: Option<Uuid>,
        title: String,
        content: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id,
            kind,
            parent_id,
            title,
            content,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_children_require_parent() {
        assert!(!ArtifactKind::Cv.requires_parent());
        assert!(ArtifactKind::CoverLetter.requires_parent());
        assert!(ArtifactKind::Email.requires_parent());
    }
}
