use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReleaseError;
use crate::model::{generate_id, model_schema_ref, EntityKind, Id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "CREATE",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChangeType {
    type Err = ReleaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATE" => Ok(ChangeType::Create),
            "UPDATE" => Ok(ChangeType::Update),
            "DELETE" => Ok(ChangeType::Delete),
            _ => Err(ReleaseError::Validation(format!("unknown change type: {}", s))),
        }
    }
}

/// A staged, not-yet-published edit of one entity.
///
/// While `committed_release_id` is `None` the record is pending against `parent_release_id`.
/// Publishing sets `committed_release_id` and the record becomes audit history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: Id,
    /// Release this change is staged against
    pub parent_release_id: Id,
    /// Release this change was folded into, once published
    pub committed_release_id: Option<Id>,
    pub change_type: ChangeType,
    pub entity_kind: EntityKind,
    /// Id of the target entity; always equal to `syntax_json.id`
    pub object_id: Id,
    pub syntax_json: Value,
    pub created_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn pending(
        parent_release_id: Id,
        change_type: ChangeType,
        entity_kind: EntityKind,
        object_id: Id,
        syntax_json: Value,
    ) -> Self {
        Self {
            id: generate_id(),
            parent_release_id,
            committed_release_id: None,
            change_type,
            entity_kind,
            object_id,
            syntax_json,
            created_at: Utc::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.committed_release_id.is_none()
    }

    /// True when the staged syntax points at the given model-schema
    pub fn references_model_schema(&self, schema_id: &Id) -> bool {
        model_schema_ref(&self.syntax_json).as_ref() == Some(schema_id)
    }
}
