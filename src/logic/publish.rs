//! Folds a release's pending changes into a new release.
//!
//! Publishing runs in three steps:
//! 1. stage: the child release is persisted as `pending` together with all five snapshots
//! 2. migrate: backing-table operations for folded model-schema changes are applied
//! 3. activate: the child becomes active and current and the folded changes are committed
//!
//! Readers only ever see active releases, so a failure in steps 2 or 3 is rolled back by undoing
//! the applied migrations and discarding the pending release. The caller gets the original error.

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{ReleaseError, Result};
use crate::logic::migration::{MigrationPlan, TableMigrator};
use crate::logic::overlay::Overlay;
use crate::model::{
    generate_version_label, EntityKind, Id, Release, SyntaxSnapshot,
};
use crate::store::traits::{Activation, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Release whose pending changes are folded; becomes the parent
    pub release_id: Id,
    /// Generated when absent
    pub version_label: Option<String>,
    #[serde(default)]
    pub notes: String,
    pub published_by: Option<String>,
}

pub struct PublishEngine;

impl PublishEngine {
    pub async fn publish<S, M>(
        store: &S,
        migrator: &M,
        config: &EngineConfig,
        request: PublishRequest,
    ) -> Result<Release>
    where
        S: Store,
        M: TableMigrator + ?Sized,
    {
        let parent = store
            .get_release(&request.release_id)
            .await?
            .filter(|r| r.is_active())
            .ok_or_else(|| ReleaseError::not_found(format!("release {}", request.release_id)))?;

        let pending = store.pending_changes(&parent.id, None).await?;
        if pending.is_empty() {
            return Err(ReleaseError::NoChanges(parent.version_label));
        }

        let version_label =
            Self::choose_label(store, config, request.version_label.as_deref()).await?;

        let collections = Overlay::fold(store, &parent, &pending).await?;
        let upstream_schemas =
            Overlay::nearest_snapshot(store, &parent, EntityKind::ModelSchema).await?;
        let plan = MigrationPlan::from_changes(&pending, &upstream_schemas)?;

        let child = Release::new_pending_child(
            &parent,
            version_label,
            request.notes,
            request.published_by,
        );
        let snapshots: Vec<SyntaxSnapshot> = collections
            .into_iter()
            .map(|(kind, items)| SyntaxSnapshot::new(child.id, kind, items))
            .collect();

        log::info!(
            "Staging release {} from {} ({} changes, {} table operations)",
            child.version_label,
            parent.version_label,
            pending.len(),
            plan.operations.len()
        );
        store.stage_release(child.clone(), snapshots).await?;

        if let Err((applied, err)) = plan.apply(migrator).await {
            log::warn!(
                "Table migration failed while publishing {}: {}",
                child.version_label,
                err
            );
            Self::roll_back(store, migrator, &plan, applied, &child).await;
            return Err(ReleaseError::MigrationFailure(err.to_string()));
        }

        let activation = Activation {
            release_id: child.id,
            parent_id: parent.id,
            folded_change_ids: pending.iter().map(|c| c.id).collect(),
        };
        match store.activate_release(activation).await {
            Ok(release) => {
                log::info!(
                    "Published release {} (parent {})",
                    release.version_label,
                    parent.version_label
                );
                Ok(release)
            }
            Err(err) => {
                log::warn!("Activating release {} failed: {}", child.version_label, err);
                Self::roll_back(store, migrator, &plan, plan.operations.len(), &child).await;
                Err(err)
            }
        }
    }

    /// Caller label if given and free, otherwise a generated one
    async fn choose_label<S: Store>(
        store: &S,
        config: &EngineConfig,
        requested: Option<&str>,
    ) -> Result<String> {
        if let Some(label) = requested {
            let label = label.trim();
            if label.is_empty() {
                return Err(ReleaseError::Validation("version label must not be empty".to_string()));
            }
            if store.label_exists(label).await? {
                return Err(ReleaseError::constraint(format!(
                    "version label {} is already used",
                    label
                )));
            }
            return Ok(label.to_string());
        }

        if config.version_label_length == 0 {
            return Err(ReleaseError::Validation(
                "generated version labels need a length of at least 1".to_string(),
            ));
        }
        for _ in 0..config.id_retry_limit.max(1) {
            let candidate = generate_version_label(config.version_label_length);
            if !store.label_exists(&candidate).await? {
                return Ok(candidate);
            }
            log::debug!("Version label {} collided, retrying", candidate);
        }

        Err(ReleaseError::constraint(format!(
            "could not generate a free version label after {} attempts",
            config.id_retry_limit
        )))
    }

    async fn roll_back<S, M>(
        store: &S,
        migrator: &M,
        plan: &MigrationPlan,
        applied: usize,
        release: &Release,
    ) where
        S: Store,
        M: TableMigrator + ?Sized,
    {
        plan.compensate(migrator, applied).await;
        if let Err(err) = store.discard_pending_release(&release.id).await {
            log::warn!(
                "Failed to discard pending release {}: {}",
                release.version_label,
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::migration::NoopMigrator;
    use crate::logic::staging::{ChangeLog, StageRequest};
    use crate::model::{ChangeType, ReleaseStatus};
    use crate::store::{ChangeStore, InMemoryStore, ReleaseStore, SyntaxStore};
    use serde_json::json;

    async fn root(store: &InMemoryStore) -> Release {
        store
            .create_root_release(Release::new_root("0.0.0".to_string(), String::new(), None))
            .await
            .unwrap()
    }

    fn request(release_id: Id, label: Option<&str>) -> PublishRequest {
        PublishRequest {
            release_id,
            version_label: label.map(str::to_string),
            notes: "notes".to_string(),
            published_by: Some("dev".to_string()),
        }
    }

    async fn publish(
        store: &InMemoryStore,
        config: &EngineConfig,
        release_id: Id,
        label: Option<&str>,
    ) -> Result<Release> {
        PublishEngine::publish(store, &NoopMigrator, config, request(release_id, label)).await
    }

    async fn stage_function(store: &InMemoryStore, release_id: Id, name: &str) -> Id {
        ChangeLog::record_change(
            store,
            &EngineConfig::default(),
            StageRequest {
                release_id,
                change_type: ChangeType::Create,
                entity_kind: EntityKind::Function,
                object_id: None,
                syntax_json: json!({"function_name": name}),
            },
        )
        .await
        .unwrap()
        .object_id
    }

    #[tokio::test]
    async fn test_publish_without_changes_is_rejected() {
        let store = InMemoryStore::new();
        let parent = root(&store).await;

        let err = publish(&store, &EngineConfig::default(), parent.id, None)
            .await
            .unwrap_err();

        assert!(matches!(err, ReleaseError::NoChanges(_)));
        assert_eq!(store.all_releases().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_generates_label_and_snapshots_every_kind() {
        let store = InMemoryStore::new();
        let parent = root(&store).await;
        let id = stage_function(&store, parent.id, "Send Email").await;

        let release = publish(&store, &EngineConfig::default(), parent.id, None)
            .await
            .unwrap();

        assert_eq!(release.version_label.len(), 5);
        assert_eq!(release.status, ReleaseStatus::Active);
        assert_eq!(release.released_by.as_deref(), Some("dev"));
        for kind in EntityKind::ALL {
            let snapshot = store.find_snapshot(&release.id, kind).await.unwrap().unwrap();
            assert!(snapshot.verify());
        }
        let functions = store.get_snapshot(&release.id, EntityKind::Function).await.unwrap();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0]["id"], id.to_string());
        assert!(store.pending_changes(&parent.id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_label_rejected_before_anything_is_written() {
        let store = InMemoryStore::new();
        let parent = root(&store).await;
        stage_function(&store, parent.id, "Send Email").await;

        let err = publish(&store, &EngineConfig::default(), parent.id, Some("0.0.0"))
            .await
            .unwrap_err();

        assert!(matches!(err, ReleaseError::ConstraintViolation(_)));
        assert_eq!(store.all_releases().len(), 1);
        assert_eq!(store.pending_changes(&parent.id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_length_generated_label_rejected() {
        let store = InMemoryStore::new();
        let parent = root(&store).await;
        stage_function(&store, parent.id, "Send Email").await;
        let config = EngineConfig {
            version_label_length: 0,
            ..EngineConfig::default()
        };

        let err = publish(&store, &config, parent.id, None).await.unwrap_err();

        assert!(matches!(err, ReleaseError::Validation(_)));
        assert_eq!(store.all_releases().len(), 1);
        assert_eq!(store.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_label_collisions_exhaust_retries_without_writing() {
        let store = InMemoryStore::new();
        root(&store).await;
        // 36 possible labels and a single attempt each: a collision is certain by the 37th
        let config = EngineConfig {
            version_label_length: 1,
            id_retry_limit: 1,
            ..EngineConfig::default()
        };

        let mut published = 0;
        let err = loop {
            let current = store.get_current_release().await.unwrap().unwrap();
            stage_function(&store, current.id, &format!("Function {}", published)).await;
            match publish(&store, &config, current.id, None).await {
                Ok(release) => {
                    assert_eq!(release.version_label.len(), 1);
                    published += 1;
                    assert!(published <= 36);
                }
                Err(err) => break err,
            }
        };

        assert!(matches!(err, ReleaseError::ConstraintViolation(_)));
        assert_eq!(store.all_releases().len(), published + 1);
        assert_eq!(store.snapshot_count(), published * EntityKind::ALL.len());
        let current = store.get_current_release().await.unwrap().unwrap();
        assert_eq!(store.pending_changes(&current.id, None).await.unwrap().len(), 1);
    }
}
