use serde_json::Value;
use std::collections::HashSet;

use crate::error::Result;
use crate::model::{ChangeRecord, EntityKind, Id, Release, SyntaxSnapshot};

/// Atomic edit of the pending changes staged against one release
#[derive(Debug, Clone)]
pub struct StagingBatch {
    pub release_id: Id,
    /// Pending change ids the batch was computed from. When set, the store refuses the batch
    /// unless the release's pending set is still exactly this one.
    pub expected_pending: Option<HashSet<Id>>,
    /// Pending change ids to drop; every one must still be pending
    pub remove: Vec<Id>,
    /// New pending changes, in creation order
    pub insert: Vec<ChangeRecord>,
}

impl StagingBatch {
    pub fn new(release_id: Id) -> Self {
        Self {
            release_id,
            expected_pending: None,
            remove: Vec::new(),
            insert: Vec::new(),
        }
    }

    pub fn expecting(mut self, pending: impl IntoIterator<Item = Id>) -> Self {
        self.expected_pending = Some(pending.into_iter().collect());
        self
    }

    /// True when `current` is the pending set the batch was computed from
    pub fn matches_pending(&self, current: &HashSet<Id>) -> bool {
        self.expected_pending
            .as_ref()
            .map(|expected| expected == current)
            .unwrap_or(true)
    }
}

/// Final step of a publish: flip the pending release to active and current
#[derive(Debug, Clone)]
pub struct Activation {
    pub release_id: Id,
    pub parent_id: Id,
    /// Exactly the pending changes of the parent that were folded into the release
    pub folded_change_ids: Vec<Id>,
}

/// Release graph storage
#[async_trait::async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Get a release by id, whatever its status
    async fn get_release(&self, id: &Id) -> Result<Option<Release>>;
    /// Get an active release by its version label
    async fn get_release_by_label(&self, label: &str) -> Result<Option<Release>>;
    async fn get_current_release(&self) -> Result<Option<Release>>;
    /// All active releases ordered by release time
    async fn list_releases(&self) -> Result<Vec<Release>>;
    /// True if any release, pending or active, already uses the label
    async fn label_exists(&self, label: &str) -> Result<bool>;
    /// Insert the first release; fails if an active release already exists
    async fn create_root_release(&self, release: Release) -> Result<Release>;
    /// Insert a pending release together with all of its snapshots
    async fn stage_release(&self, release: Release, snapshots: Vec<SyntaxSnapshot>) -> Result<()>;
    /// Make a staged release active and current, committing the folded changes
    async fn activate_release(&self, activation: Activation) -> Result<Release>;
    /// Remove a release that is still pending, along with its snapshots
    async fn discard_pending_release(&self, id: &Id) -> Result<()>;
    /// Delete a release and its whole subtree; returns the deleted ids
    async fn delete_release_tree(&self, id: &Id) -> Result<Vec<Id>>;
}

/// Per-release, per-kind materialized syntax
#[async_trait::async_trait]
pub trait SyntaxStore: Send + Sync {
    async fn find_snapshot(&self, release_id: &Id, kind: EntityKind)
        -> Result<Option<SyntaxSnapshot>>;
    /// Create the snapshot row; fails with `ConstraintViolation` if one already exists
    async fn write_snapshot(&self, snapshot: SyntaxSnapshot) -> Result<()>;

    /// Stored collection for (release, kind), empty when no snapshot exists
    async fn get_snapshot(&self, release_id: &Id, kind: EntityKind) -> Result<Vec<Value>> {
        Ok(self
            .find_snapshot(release_id, kind)
            .await?
            .map(|snapshot| snapshot.items)
            .unwrap_or_default())
    }
}

/// Staging area of pending changes
#[async_trait::async_trait]
pub trait ChangeStore: Send + Sync {
    /// Uncommitted changes staged against a release, in creation order
    async fn pending_changes(
        &self,
        release_id: &Id,
        kind: Option<EntityKind>,
    ) -> Result<Vec<ChangeRecord>>;
    async fn find_pending_change(
        &self,
        release_id: &Id,
        kind: EntityKind,
        object_id: &Id,
    ) -> Result<Option<ChangeRecord>>;
    /// Changes that were folded into the given release
    async fn committed_changes(&self, release_id: &Id) -> Result<Vec<ChangeRecord>>;
    async fn apply_staging(&self, batch: StagingBatch) -> Result<()>;
}

pub trait Store: ReleaseStore + SyntaxStore + ChangeStore + Send + Sync {}

impl<T: ReleaseStore + SyntaxStore + ChangeStore + Send + Sync> Store for T {}
