//! Read-time reconciliation of a release's snapshot with its pending changes.
//!
//! Staging never rewrites a snapshot. A read takes the nearest stored snapshot for the kind
//! and replays the release's uncommitted changes over it in creation order:
//! CREATE appends, UPDATE drops the element with the same id and appends the new document,
//! DELETE drops the element.

use serde_json::Value;
use std::collections::HashSet;

use crate::error::{ReleaseError, Result};
use crate::model::{find_by_id, syntax_id, ChangeRecord, ChangeType, EntityKind, Id, Release};
use crate::store::traits::Store;

/// Replay changes over a base collection. Changes of other kinds are ignored by callers.
pub fn apply_changes<'a>(
    mut items: Vec<Value>,
    changes: impl IntoIterator<Item = &'a ChangeRecord>,
) -> Vec<Value> {
    for change in changes {
        match change.change_type {
            ChangeType::Create => items.push(change.syntax_json.clone()),
            ChangeType::Update => {
                items.retain(|item| syntax_id(item) != Some(change.object_id));
                items.push(change.syntax_json.clone());
            }
            ChangeType::Delete => {
                items.retain(|item| syntax_id(item) != Some(change.object_id));
            }
        }
    }
    items
}

pub struct Overlay;

impl Overlay {
    /// Stored collection of the closest release on the path to the root that has a snapshot
    /// for `kind`; empty when none does.
    pub async fn nearest_snapshot<S: Store>(
        store: &S,
        release: &Release,
        kind: EntityKind,
    ) -> Result<Vec<Value>> {
        let mut visited = HashSet::new();
        let mut cursor = Some(release.clone());

        while let Some(current) = cursor {
            if !visited.insert(current.id) {
                return Err(ReleaseError::constraint(format!(
                    "release ancestry of {} contains a cycle",
                    release.version_label
                )));
            }
            if let Some(snapshot) = store.find_snapshot(&current.id, kind).await? {
                return Ok(snapshot.items);
            }
            cursor = match current.parent_id {
                Some(parent_id) => Some(
                    store
                        .get_release(&parent_id)
                        .await?
                        .ok_or_else(|| ReleaseError::not_found(format!("release {}", parent_id)))?,
                ),
                None => None,
            };
        }

        Ok(Vec::new())
    }

    /// Snapshot of `kind` with the release's pending changes overlaid
    pub async fn live_entities<S: Store>(
        store: &S,
        release: &Release,
        kind: EntityKind,
    ) -> Result<Vec<Value>> {
        let pending = store.pending_changes(&release.id, Some(kind)).await?;
        let base = Self::nearest_snapshot(store, release, kind).await?;
        log::debug!(
            "Overlaying {} pending {} changes on {} items for release {}",
            pending.len(),
            kind,
            base.len(),
            release.version_label
        );
        Ok(apply_changes(base, &pending))
    }

    pub async fn get_entity<S: Store>(
        store: &S,
        release: &Release,
        kind: EntityKind,
        object_id: &Id,
    ) -> Result<Option<Value>> {
        let items = Self::live_entities(store, release, kind).await?;
        Ok(find_by_id(&items, object_id).cloned())
    }

    /// Snapshot of `kind` overlaid with an already-fetched set of pending changes of any kind
    pub async fn overlay<S: Store>(
        store: &S,
        release: &Release,
        kind: EntityKind,
        pending: &[ChangeRecord],
    ) -> Result<Vec<Value>> {
        let base = Self::nearest_snapshot(store, release, kind).await?;
        Ok(apply_changes(base, pending.iter().filter(|c| c.entity_kind == kind)))
    }

    /// Overlay every kind with an already-fetched set of pending changes
    pub async fn fold<S: Store>(
        store: &S,
        release: &Release,
        pending: &[ChangeRecord],
    ) -> Result<Vec<(EntityKind, Vec<Value>)>> {
        let mut collections = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            collections.push((kind, Self::overlay(store, release, kind, pending).await?));
        }
        Ok(collections)
    }
}
