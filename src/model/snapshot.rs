use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{EntityKind, Id};

/// The full collection of one entity kind's syntax as of a release.
///
/// There is at most one snapshot per (release, kind); it is written once when the release is
/// published and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntaxSnapshot {
    pub release_id: Id,
    pub entity_kind: EntityKind,
    pub items: Vec<Value>,
    /// SHA-256 of the canonical JSON of `items`
    pub checksum: String,
}

impl SyntaxSnapshot {
    pub fn new(release_id: Id, entity_kind: EntityKind, items: Vec<Value>) -> Self {
        let checksum = Self::calculate_checksum(entity_kind, &items);
        Self {
            release_id,
            entity_kind,
            items,
            checksum,
        }
    }

    /// Recompute the checksum and compare it with the stored one
    pub fn verify(&self) -> bool {
        Self::calculate_checksum(self.entity_kind, &self.items) == self.checksum
    }

    fn calculate_checksum(entity_kind: EntityKind, items: &[Value]) -> String {
        use sha2::{Digest, Sha256};

        // serde_json maps are key-sorted, so Display output is canonical
        let mut hasher = Sha256::new();
        hasher.update(format!("kind:{}\n", entity_kind));
        for item in items {
            hasher.update(format!("item:{}\n", item));
        }

        hex::encode(hasher.finalize())
    }
}
