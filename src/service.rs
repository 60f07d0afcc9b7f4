//! Entity-shaped operations over the release engine, as consumed by an HTTP layer.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{ReleaseError, Result};
use crate::logic::{
    ChangeLog, NoopMigrator, Overlay, PublishEngine, PublishRequest, StageOutcome, StageRequest,
    TableMigrator,
};
use crate::model::{
    find_by_id, model_name_of, model_schema_ref, syntax_id, ChangeRecord, ChangeType, EntityKind,
    Id, Release, ReleaseTree, SyntaxFilter, UserContext,
};
use crate::store::traits::Store;

/// How a caller names a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseRef {
    Current,
    Id(Id),
    Label(String),
}

impl ReleaseRef {
    /// A UUID names a release by id, anything else by version label
    pub fn parse(value: &str) -> Self {
        match uuid::Uuid::parse_str(value) {
            Ok(id) => ReleaseRef::Id(id),
            Err(_) => ReleaseRef::Label(value.to_string()),
        }
    }
}

impl From<Id> for ReleaseRef {
    fn from(id: Id) -> Self {
        ReleaseRef::Id(id)
    }
}

impl From<&Release> for ReleaseRef {
    fn from(release: &Release) -> Self {
        ReleaseRef::Id(release.id)
    }
}

impl From<Option<&str>> for ReleaseRef {
    fn from(value: Option<&str>) -> Self {
        value.map(ReleaseRef::parse).unwrap_or(ReleaseRef::Current)
    }
}

pub struct SyntaxService<S, M = NoopMigrator> {
    store: Arc<S>,
    migrator: Arc<M>,
    config: EngineConfig,
}

impl<S: Store> SyntaxService<S, NoopMigrator> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self::with_migrator(store, Arc::new(NoopMigrator), config)
    }
}

impl<S: Store, M: TableMigrator> SyntaxService<S, M> {
    pub fn with_migrator(store: Arc<S>, migrator: Arc<M>, config: EngineConfig) -> Self {
        Self {
            store,
            migrator,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Look up an active release; `Current` requires that one exists
    pub async fn resolve_release(&self, release: &ReleaseRef) -> Result<Release> {
        let found = match release {
            ReleaseRef::Current => self.store.get_current_release().await?,
            ReleaseRef::Id(id) => self.store.get_release(id).await?.filter(|r| r.is_active()),
            ReleaseRef::Label(label) => self.store.get_release_by_label(label).await?,
        };

        found.ok_or_else(|| match release {
            ReleaseRef::Current => ReleaseError::not_found("current release"),
            ReleaseRef::Id(id) => ReleaseError::not_found(format!("release {}", id)),
            ReleaseRef::Label(label) => ReleaseError::not_found(format!("release {}", label)),
        })
    }

    pub async fn list(
        &self,
        kind: EntityKind,
        release: &ReleaseRef,
        filter: Option<&SyntaxFilter>,
    ) -> Result<Vec<Value>> {
        let release = self.resolve_release(release).await?;
        let items = Overlay::live_entities(&*self.store, &release, kind).await?;

        Ok(match filter {
            Some(filter) => items.into_iter().filter(|item| filter.matches(item)).collect(),
            None => items,
        })
    }

    /// Single document, or an empty object when the release has no such entity
    pub async fn detail(
        &self,
        kind: EntityKind,
        object_id: &Id,
        release: &ReleaseRef,
    ) -> Result<Value> {
        let release = self.resolve_release(release).await?;
        Ok(Overlay::get_entity(&*self.store, &release, kind, object_id)
            .await?
            .unwrap_or_else(|| json!({})))
    }

    /// Stage a CREATE; returns the object id
    pub async fn create(
        &self,
        kind: EntityKind,
        release: &ReleaseRef,
        payload: Value,
    ) -> Result<Id> {
        let outcome = self
            .stage_on(release, ChangeType::Create, kind, None, payload)
            .await?;
        Ok(outcome.object_id)
    }

    pub async fn update(
        &self,
        kind: EntityKind,
        object_id: &Id,
        release: &ReleaseRef,
        payload: Value,
    ) -> Result<()> {
        self.stage_on(release, ChangeType::Update, kind, Some(*object_id), payload)
            .await?;
        Ok(())
    }

    pub async fn delete(
        &self,
        kind: EntityKind,
        object_id: &Id,
        release: &ReleaseRef,
    ) -> Result<()> {
        self.stage_on(release, ChangeType::Delete, kind, Some(*object_id), json!({}))
            .await?;
        Ok(())
    }

    /// Stage an edit and report everything it touched
    pub async fn stage(&self, request: StageRequest) -> Result<StageOutcome> {
        ChangeLog::record_change(&*self.store, &self.config, request).await
    }

    async fn stage_on(
        &self,
        release: &ReleaseRef,
        change_type: ChangeType,
        entity_kind: EntityKind,
        object_id: Option<Id>,
        syntax_json: Value,
    ) -> Result<StageOutcome> {
        let release = self.resolve_release(release).await?;
        self.stage(StageRequest {
            release_id: release.id,
            change_type,
            entity_kind,
            object_id,
            syntax_json,
        })
        .await
    }

    /// Fold the release's pending changes into a new current release
    pub async fn publish(
        &self,
        release: &ReleaseRef,
        version_label: Option<&str>,
        notes: &str,
        actor: Option<&UserContext>,
    ) -> Result<Release> {
        let release = self.resolve_release(release).await?;
        PublishEngine::publish(
            &*self.store,
            &*self.migrator,
            &self.config,
            PublishRequest {
                release_id: release.id,
                version_label: version_label.map(str::to_string),
                notes: notes.to_string(),
                published_by: actor.map(UserContext::released_by),
            },
        )
        .await
    }

    pub async fn create_root_release(
        &self,
        version_label: &str,
        notes: &str,
        actor: Option<&UserContext>,
    ) -> Result<Release> {
        let release = Release::new_root(
            version_label.to_string(),
            notes.to_string(),
            actor.map(UserContext::released_by),
        );
        let release = self.store.create_root_release(release).await?;
        log::info!("Created root release {}", release.version_label);
        Ok(release)
    }

    pub async fn release_tree(&self) -> Result<ReleaseTree> {
        Ok(ReleaseTree::new(self.store.list_releases().await?))
    }

    pub async fn current_release(&self) -> Result<Option<Release>> {
        self.store.get_current_release().await
    }

    /// Delete a release with its subtree; returns the deleted release ids
    pub async fn delete_release(&self, release: &ReleaseRef) -> Result<Vec<Id>> {
        let release = self.resolve_release(release).await?;
        let deleted = self.store.delete_release_tree(&release.id).await?;
        log::info!(
            "Deleted release {} and {} descendants",
            release.version_label,
            deleted.len().saturating_sub(1)
        );
        Ok(deleted)
    }

    pub async fn pending_changes(&self, release: &ReleaseRef) -> Result<Vec<ChangeRecord>> {
        let release = self.resolve_release(release).await?;
        self.store.pending_changes(&release.id, None).await
    }

    /// Changes folded into the release when it was published
    pub async fn committed_changes(&self, release: &ReleaseRef) -> Result<Vec<ChangeRecord>> {
        let release = self.resolve_release(release).await?;
        self.store.committed_changes(&release.id).await
    }

    /// Case-insensitive model-schema lookup by `model_name`
    pub async fn model_schema_id_from_name(
        &self,
        release: &ReleaseRef,
        model_name: &str,
    ) -> Result<Option<Id>> {
        let schemas = self.list(EntityKind::ModelSchema, release, None).await?;
        Ok(schemas
            .iter()
            .find(|schema| {
                model_name_of(schema)
                    .map(|name| name.eq_ignore_ascii_case(model_name))
                    .unwrap_or(false)
            })
            .and_then(syntax_id))
    }

    /// Layout of the named page bound to the named model, or an empty object
    pub async fn page_layout(
        &self,
        release: &ReleaseRef,
        model_name: &str,
        page_name: &str,
    ) -> Result<Value> {
        let release = self.resolve_release(release).await?;
        let schemas =
            Overlay::live_entities(&*self.store, &release, EntityKind::ModelSchema).await?;
        let Some(schema_id) = schemas
            .iter()
            .find(|schema| {
                model_name_of(schema)
                    .map(|name| name.eq_ignore_ascii_case(model_name))
                    .unwrap_or(false)
            })
            .and_then(syntax_id)
        else {
            return Ok(json!({}));
        };

        let pages = Overlay::live_entities(&*self.store, &release, EntityKind::Page).await?;
        let layout = pages
            .iter()
            .filter(|page| model_schema_ref(page) == Some(schema_id))
            .find(|page| page.get("page_name").and_then(Value::as_str) == Some(page_name))
            .and_then(|page| page.get("layout").cloned());

        Ok(layout.unwrap_or_else(|| json!({})))
    }

    /// Whether `object_id` is visible in the release
    pub async fn exists(
        &self,
        kind: EntityKind,
        object_id: &Id,
        release: &ReleaseRef,
    ) -> Result<bool> {
        let items = self.list(kind, release, None).await?;
        Ok(find_by_id(&items, object_id).is_some())
    }
}

impl<S, M> Clone for SyntaxService<S, M> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            migrator: Arc::clone(&self.migrator),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_ref_parse() {
        let id = crate::model::generate_id();
        assert_eq!(ReleaseRef::parse(&id.to_string()), ReleaseRef::Id(id));
        assert_eq!(ReleaseRef::parse("0.1.0"), ReleaseRef::Label("0.1.0".to_string()));
        assert_eq!(ReleaseRef::from(None), ReleaseRef::Current);
    }
}
