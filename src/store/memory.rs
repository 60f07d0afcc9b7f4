//! In-memory implementation of the release store.
//!
//! All tables live behind a single `parking_lot::RwLock`. Every mutating call validates its
//! whole input first and only then mutates, all under one write-lock acquisition, so each call
//! is atomic and calls are serialized. That is the single-writer model the engine assumes of
//! a transactional backend.
//!
//! Not durable: state is lost when the process exits. Used for tests and local development.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{ReleaseError, Result};
use crate::model::{ChangeRecord, EntityKind, Id, Release, ReleaseStatus, SyntaxSnapshot};
use crate::store::traits::{Activation, ChangeStore, ReleaseStore, StagingBatch, SyntaxStore};

#[derive(Debug, Default)]
struct Tables {
    /// Insertion order doubles as release order
    releases: Vec<Release>,
    snapshots: HashMap<(Id, EntityKind), SyntaxSnapshot>,
    /// Insertion order is creation order
    changes: Vec<ChangeRecord>,
}

impl Tables {
    fn release(&self, id: &Id) -> Option<&Release> {
        self.releases.iter().find(|r| &r.id == id)
    }

    fn active_release(&self, id: &Id) -> Result<&Release> {
        self.release(id)
            .filter(|r| r.is_active())
            .ok_or_else(|| ReleaseError::not_found(format!("release {}", id)))
    }

    fn label_taken(&self, label: &str) -> bool {
        self.releases.iter().any(|r| r.version_label == label)
    }

    fn pending_for(&self, release_id: &Id) -> impl Iterator<Item = &ChangeRecord> {
        let release_id = *release_id;
        self.changes
            .iter()
            .filter(move |c| c.is_pending() && c.parent_release_id == release_id)
    }

    /// Ids of `root` and every descendant, parents before children
    fn subtree(&self, root: &Id) -> Vec<Id> {
        let mut ids = vec![*root];
        let mut cursor = 0;
        while cursor < ids.len() {
            let parent = ids[cursor];
            ids.extend(
                self.releases
                    .iter()
                    .filter(|r| r.parent_id == Some(parent))
                    .map(|r| r.id),
            );
            cursor += 1;
        }
        ids
    }

    fn check_snapshot_slot(&self, snapshot: &SyntaxSnapshot) -> Result<()> {
        if self
            .snapshots
            .contains_key(&(snapshot.release_id, snapshot.entity_kind))
        {
            return Err(ReleaseError::constraint(format!(
                "snapshot for release {} and kind {} already exists",
                snapshot.release_id, snapshot.entity_kind
            )));
        }
        Ok(())
    }
}

/// Non-durable store for tests and local development
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every change record, pending or committed, in creation order
    pub fn all_changes(&self) -> Vec<ChangeRecord> {
        self.tables.read().changes.clone()
    }

    /// Every release row including pending ones
    pub fn all_releases(&self) -> Vec<Release> {
        self.tables.read().releases.clone()
    }

    pub fn snapshot_count(&self) -> usize {
        self.tables.read().snapshots.len()
    }
}

#[async_trait::async_trait]
impl ReleaseStore for InMemoryStore {
    async fn get_release(&self, id: &Id) -> Result<Option<Release>> {
        Ok(self.tables.read().release(id).cloned())
    }

    async fn get_release_by_label(&self, label: &str) -> Result<Option<Release>> {
        Ok(self
            .tables
            .read()
            .releases
            .iter()
            .find(|r| r.is_active() && r.version_label == label)
            .cloned())
    }

    async fn get_current_release(&self) -> Result<Option<Release>> {
        Ok(self
            .tables
            .read()
            .releases
            .iter()
            .find(|r| r.is_current)
            .cloned())
    }

    async fn list_releases(&self) -> Result<Vec<Release>> {
        let mut releases: Vec<Release> = self
            .tables
            .read()
            .releases
            .iter()
            .filter(|r| r.is_active())
            .cloned()
            .collect();
        releases.sort_by_key(|r| r.released_at);
        Ok(releases)
    }

    async fn label_exists(&self, label: &str) -> Result<bool> {
        Ok(self.tables.read().label_taken(label))
    }

    async fn create_root_release(&self, release: Release) -> Result<Release> {
        let mut tables = self.tables.write();

        if tables.releases.iter().any(|r| r.is_active()) {
            return Err(ReleaseError::constraint(
                "a root release already exists; publish a new release instead",
            ));
        }
        if tables.label_taken(&release.version_label) {
            return Err(ReleaseError::constraint(format!(
                "version label {} is already used",
                release.version_label
            )));
        }

        let release = Release {
            parent_id: None,
            is_current: true,
            status: ReleaseStatus::Active,
            ..release
        };
        tables.releases.push(release.clone());
        Ok(release)
    }

    async fn stage_release(&self, release: Release, snapshots: Vec<SyntaxSnapshot>) -> Result<()> {
        let mut tables = self.tables.write();

        if release.status != ReleaseStatus::Pending || release.is_current {
            return Err(ReleaseError::constraint(
                "only a pending, non-current release can be staged",
            ));
        }
        let parent_id = release
            .parent_id
            .ok_or_else(|| ReleaseError::constraint("a staged release needs a parent"))?;
        tables.active_release(&parent_id)?;
        if tables.release(&release.id).is_some() {
            return Err(ReleaseError::constraint(format!(
                "release {} already exists",
                release.id
            )));
        }
        if tables.label_taken(&release.version_label) {
            return Err(ReleaseError::constraint(format!(
                "version label {} is already used",
                release.version_label
            )));
        }

        let mut kinds = HashSet::new();
        for snapshot in &snapshots {
            if snapshot.release_id != release.id {
                return Err(ReleaseError::constraint(
                    "snapshot belongs to a different release",
                ));
            }
            if !kinds.insert(snapshot.entity_kind) {
                return Err(ReleaseError::constraint(format!(
                    "duplicate {} snapshot for release {}",
                    snapshot.entity_kind, release.id
                )));
            }
            tables.check_snapshot_slot(snapshot)?;
        }

        tables.releases.push(release);
        for snapshot in snapshots {
            tables
                .snapshots
                .insert((snapshot.release_id, snapshot.entity_kind), snapshot);
        }
        Ok(())
    }

    async fn activate_release(&self, activation: Activation) -> Result<Release> {
        let mut tables = self.tables.write();

        let staged = tables
            .release(&activation.release_id)
            .filter(|r| r.status == ReleaseStatus::Pending)
            .ok_or_else(|| {
                ReleaseError::not_found(format!("pending release {}", activation.release_id))
            })?;
        if staged.parent_id != Some(activation.parent_id) {
            return Err(ReleaseError::constraint("activation parent does not match"));
        }
        tables.active_release(&activation.parent_id)?;

        let pending: HashSet<Id> = tables
            .pending_for(&activation.parent_id)
            .map(|c| c.id)
            .collect();
        let folded: HashSet<Id> = activation.folded_change_ids.iter().copied().collect();
        if pending != folded {
            return Err(ReleaseError::constraint(format!(
                "pending changes of release {} changed while publishing",
                activation.parent_id
            )));
        }

        for release in tables.releases.iter_mut() {
            release.is_current = false;
        }
        let mut activated = None;
        if let Some(release) = tables
            .releases
            .iter_mut()
            .find(|r| r.id == activation.release_id)
        {
            release.status = ReleaseStatus::Active;
            release.is_current = true;
            activated = Some(release.clone());
        }
        for change in tables.changes.iter_mut() {
            if folded.contains(&change.id) {
                change.committed_release_id = Some(activation.release_id);
            }
        }

        activated
            .ok_or_else(|| ReleaseError::not_found(format!("release {}", activation.release_id)))
    }

    async fn discard_pending_release(&self, id: &Id) -> Result<()> {
        let mut tables = self.tables.write();

        match tables.release(id) {
            None => return Ok(()),
            Some(release) if release.is_active() => {
                return Err(ReleaseError::constraint(format!(
                    "release {} is active and cannot be discarded",
                    id
                )))
            }
            Some(_) => {}
        }

        tables.releases.retain(|r| &r.id != id);
        tables.snapshots.retain(|(release_id, _), _| release_id != id);
        Ok(())
    }

    async fn delete_release_tree(&self, id: &Id) -> Result<Vec<Id>> {
        let mut tables = self.tables.write();

        if tables.release(id).is_none() {
            return Err(ReleaseError::not_found(format!("release {}", id)));
        }
        let doomed = tables.subtree(id);
        if let Some(current) = tables
            .releases
            .iter()
            .find(|r| r.is_current && doomed.contains(&r.id))
        {
            return Err(ReleaseError::constraint(format!(
                "release {} is current and cannot be deleted",
                current.version_label
            )));
        }

        let doomed_set: HashSet<Id> = doomed.iter().copied().collect();
        tables.releases.retain(|r| !doomed_set.contains(&r.id));
        tables
            .snapshots
            .retain(|(release_id, _), _| !doomed_set.contains(release_id));
        tables.changes.retain(|c| {
            !doomed_set.contains(&c.parent_release_id)
                && !c
                    .committed_release_id
                    .map(|committed| doomed_set.contains(&committed))
                    .unwrap_or(false)
        });

        Ok(doomed)
    }
}

#[async_trait::async_trait]
impl SyntaxStore for InMemoryStore {
    async fn find_snapshot(
        &self,
        release_id: &Id,
        kind: EntityKind,
    ) -> Result<Option<SyntaxSnapshot>> {
        Ok(self.tables.read().snapshots.get(&(*release_id, kind)).cloned())
    }

    async fn write_snapshot(&self, snapshot: SyntaxSnapshot) -> Result<()> {
        let mut tables = self.tables.write();

        if tables.release(&snapshot.release_id).is_none() {
            return Err(ReleaseError::not_found(format!(
                "release {}",
                snapshot.release_id
            )));
        }
        tables.check_snapshot_slot(&snapshot)?;
        tables
            .snapshots
            .insert((snapshot.release_id, snapshot.entity_kind), snapshot);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChangeStore for InMemoryStore {
    async fn pending_changes(
        &self,
        release_id: &Id,
        kind: Option<EntityKind>,
    ) -> Result<Vec<ChangeRecord>> {
        Ok(self
            .tables
            .read()
            .pending_for(release_id)
            .filter(|c| kind.map(|k| c.entity_kind == k).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn find_pending_change(
        &self,
        release_id: &Id,
        kind: EntityKind,
        object_id: &Id,
    ) -> Result<Option<ChangeRecord>> {
        Ok(self
            .tables
            .read()
            .pending_for(release_id)
            .find(|c| c.entity_kind == kind && &c.object_id == object_id)
            .cloned())
    }

    async fn committed_changes(&self, release_id: &Id) -> Result<Vec<ChangeRecord>> {
        Ok(self
            .tables
            .read()
            .changes
            .iter()
            .filter(|c| c.committed_release_id.as_ref() == Some(release_id))
            .cloned()
            .collect())
    }

    async fn apply_staging(&self, batch: StagingBatch) -> Result<()> {
        let mut tables = self.tables.write();

        tables.active_release(&batch.release_id)?;

        let removing: HashSet<Id> = batch.remove.iter().copied().collect();
        let pending: Vec<&ChangeRecord> = tables.pending_for(&batch.release_id).collect();
        if !batch.matches_pending(&pending.iter().map(|c| c.id).collect()) {
            return Err(ReleaseError::constraint(format!(
                "pending changes of release {} changed while the edit was prepared",
                batch.release_id
            )));
        }
        for id in &removing {
            if !pending.iter().any(|c| &c.id == id) {
                return Err(ReleaseError::constraint(format!(
                    "change {} is no longer pending",
                    id
                )));
            }
        }

        let mut occupied: HashSet<(EntityKind, Id)> = pending
            .iter()
            .filter(|c| !removing.contains(&c.id))
            .map(|c| (c.entity_kind, c.object_id))
            .collect();
        for record in &batch.insert {
            if record.parent_release_id != batch.release_id || !record.is_pending() {
                return Err(ReleaseError::constraint(
                    "staged change does not belong to the batch release",
                ));
            }
            if !occupied.insert((record.entity_kind, record.object_id)) {
                return Err(ReleaseError::constraint(format!(
                    "a pending {} change for {} already exists",
                    record.entity_kind, record.object_id
                )));
            }
        }

        tables.changes.retain(|c| !removing.contains(&c.id));
        tables.changes.extend(batch.insert);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{generate_id, ChangeType};
    use serde_json::json;

    fn root() -> Release {
        Release::new_root("0.0.0".to_string(), "Initial".to_string(), None)
    }

    fn page_change(release_id: Id, object_id: Id) -> ChangeRecord {
        ChangeRecord::pending(
            release_id,
            ChangeType::Create,
            EntityKind::Page,
            object_id,
            json!({"id": object_id.to_string(), "page_name": "list"}),
        )
    }

    #[tokio::test]
    async fn test_write_snapshot_twice_is_a_constraint_violation() {
        let store = InMemoryStore::new();
        let release = store.create_root_release(root()).await.unwrap();

        let items = vec![json!({"id": generate_id().to_string()})];
        let snapshot = SyntaxSnapshot::new(release.id, EntityKind::Page, items);
        store.write_snapshot(snapshot.clone()).await.unwrap();

        let err = store.write_snapshot(snapshot).await.unwrap_err();
        assert!(matches!(err, ReleaseError::ConstraintViolation(_)));
        assert_eq!(store.get_snapshot(&release.id, EntityKind::Page).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_snapshot_reads_as_empty() {
        let store = InMemoryStore::new();
        let release = store.create_root_release(root()).await.unwrap();

        let items = store.get_snapshot(&release.id, EntityKind::Workflow).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_second_root_release_rejected() {
        let store = InMemoryStore::new();
        store.create_root_release(root()).await.unwrap();

        let second = Release::new_root("0.0.1".to_string(), String::new(), None);
        let err = store.create_root_release(second).await.unwrap_err();
        assert!(matches!(err, ReleaseError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_apply_staging_enforces_single_pending_change_per_object() {
        let store = InMemoryStore::new();
        let release = store.create_root_release(root()).await.unwrap();
        let object_id = generate_id();

        let mut batch = StagingBatch::new(release.id);
        batch.insert.push(page_change(release.id, object_id));
        store.apply_staging(batch).await.unwrap();

        let mut duplicate = StagingBatch::new(release.id);
        duplicate.insert.push(page_change(release.id, object_id));
        let err = store.apply_staging(duplicate).await.unwrap_err();
        assert!(matches!(err, ReleaseError::ConstraintViolation(_)));

        // Replacing the pending record in the same batch is fine
        let existing = store
            .find_pending_change(&release.id, EntityKind::Page, &object_id)
            .await
            .unwrap()
            .unwrap();
        let mut replace = StagingBatch::new(release.id);
        replace.remove.push(existing.id);
        replace.insert.push(page_change(release.id, object_id));
        store.apply_staging(replace).await.unwrap();

        assert_eq!(store.pending_changes(&release.id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_staging_rejects_batch_from_outdated_pending_set() {
        let store = InMemoryStore::new();
        let release = store.create_root_release(root()).await.unwrap();

        // Both batches were computed while nothing was pending
        let mut first = StagingBatch::new(release.id).expecting(Vec::new());
        first.insert.push(page_change(release.id, generate_id()));
        let mut second = StagingBatch::new(release.id).expecting(Vec::new());
        second.insert.push(page_change(release.id, generate_id()));

        store.apply_staging(first).await.unwrap();
        let err = store.apply_staging(second).await.unwrap_err();

        assert!(matches!(err, ReleaseError::ConstraintViolation(_)));
        assert_eq!(store.pending_changes(&release.id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_staging_unknown_release() {
        let store = InMemoryStore::new();
        let err = store.apply_staging(StagingBatch::new(generate_id())).await.unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stage_activate_flow() {
        let store = InMemoryStore::new();
        let parent = store.create_root_release(root()).await.unwrap();
        let change = page_change(parent.id, generate_id());
        let mut batch = StagingBatch::new(parent.id);
        batch.insert.push(change.clone());
        store.apply_staging(batch).await.unwrap();

        let child = Release::new_pending_child(&parent, "0.1.0".to_string(), String::new(), None);
        let snapshots = EntityKind::ALL
            .into_iter()
            .map(|kind| SyntaxSnapshot::new(child.id, kind, Vec::new()))
            .collect();
        store.stage_release(child.clone(), snapshots).await.unwrap();

        // Pending releases stay invisible to readers
        assert!(store.list_releases().await.unwrap().iter().all(|r| r.id != child.id));
        assert!(store.get_release_by_label("0.1.0").await.unwrap().is_none());
        assert_eq!(store.get_current_release().await.unwrap().unwrap().id, parent.id);

        let activated = store
            .activate_release(Activation {
                release_id: child.id,
                parent_id: parent.id,
                folded_change_ids: vec![change.id],
            })
            .await
            .unwrap();

        assert!(activated.is_current);
        assert!(activated.is_active());
        let current: Vec<_> = store.all_releases().into_iter().filter(|r| r.is_current).collect();
        assert_eq!(current.len(), 1);
        assert_eq!(store.committed_changes(&child.id).await.unwrap().len(), 1);
        assert!(store.pending_changes(&parent.id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_activation_rejects_stale_fold() {
        let store = InMemoryStore::new();
        let parent = store.create_root_release(root()).await.unwrap();
        let mut batch = StagingBatch::new(parent.id);
        batch.insert.push(page_change(parent.id, generate_id()));
        store.apply_staging(batch).await.unwrap();

        let child = Release::new_pending_child(&parent, "0.1.0".to_string(), String::new(), None);
        store.stage_release(child.clone(), Vec::new()).await.unwrap();

        let err = store
            .activate_release(Activation {
                release_id: child.id,
                parent_id: parent.id,
                folded_change_ids: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::ConstraintViolation(_)));

        store.discard_pending_release(&child.id).await.unwrap();
        assert!(store.get_release(&child.id).await.unwrap().is_none());
        assert!(store.get_current_release().await.unwrap().unwrap().is_root());
    }

    #[tokio::test]
    async fn test_delete_tree_refuses_current_and_cascades() {
        let store = InMemoryStore::new();
        let parent = store.create_root_release(root()).await.unwrap();

        let err = store.delete_release_tree(&parent.id).await.unwrap_err();
        assert!(matches!(err, ReleaseError::ConstraintViolation(_)));

        // Stage and activate a child, then branch the root again so the child is no longer current
        let first = Release::new_pending_child(&parent, "A".to_string(), String::new(), None);
        store
            .stage_release(
                first.clone(),
                vec![SyntaxSnapshot::new(first.id, EntityKind::Page, Vec::new())],
            )
            .await
            .unwrap();
        store
            .activate_release(Activation {
                release_id: first.id,
                parent_id: parent.id,
                folded_change_ids: Vec::new(),
            })
            .await
            .unwrap();
        let second = Release::new_pending_child(&parent, "B".to_string(), String::new(), None);
        store.stage_release(second.clone(), Vec::new()).await.unwrap();
        store
            .activate_release(Activation {
                release_id: second.id,
                parent_id: parent.id,
                folded_change_ids: Vec::new(),
            })
            .await
            .unwrap();

        let deleted = store.delete_release_tree(&first.id).await.unwrap();
        assert_eq!(deleted, vec![first.id]);
        assert!(store.find_snapshot(&first.id, EntityKind::Page).await.unwrap().is_none());
        assert_eq!(store.list_releases().await.unwrap().len(), 2);
    }
}
