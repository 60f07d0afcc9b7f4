//! Change log: stages developer edits against a release.
//!
//! At most one pending change exists per (release, kind, object). A new edit to an object that
//! already has one supersedes it following the transition table in [`ChangeLog::resolve`],
//! carrying the object's `id` and `model_schema_id` forward. Everything a single edit writes
//! (the record, superseded or cancelled records, companion pages) goes to the store as one
//! [`StagingBatch`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::config::EngineConfig;
use crate::error::{ReleaseError, Result};
use crate::logic::overlay::Overlay;
use crate::logic::templates::PageTemplate;
use crate::logic::validate::SyntaxValidator;
use crate::model::{
    carry_identity, find_by_id, generate_id, model_name_of, model_schema_ref, set_syntax_id,
    syntax_id, ChangeRecord, ChangeType, EntityKind, Id, Release,
};
use crate::store::traits::{StagingBatch, Store};

/// A developer edit to stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRequest {
    pub release_id: Id,
    pub change_type: ChangeType,
    pub entity_kind: EntityKind,
    /// Target object; falls back to the payload's `id`
    pub object_id: Option<Id>,
    pub syntax_json: Value,
}

/// What a staging call persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub object_id: Id,
    /// `None` when the edit cancelled a pending creation
    pub record: Option<ChangeRecord>,
    /// Records staged as a side effect (default pages, dependent page deletes)
    pub companions: Vec<ChangeRecord>,
    /// Pending change ids removed without replacement
    pub cancelled: Vec<Id>,
}

/// Effective operation after applying the transition table
#[derive(Debug, Clone, PartialEq)]
enum Resolution {
    Stage {
        change_type: ChangeType,
        /// Document whose identity is carried onto the new payload
        previous: Option<Value>,
        /// True only for an object that exists nowhere yet
        genuine_create: bool,
    },
    Cancel,
}

/// Page changes triggered by deleting their model-schema
#[derive(Debug, Default)]
struct DependentPages {
    /// Pending page edits replaced by a DELETE
    superseded: Vec<Id>,
    /// Pending page creations dropped outright
    cancelled: Vec<Id>,
    deletes: Vec<ChangeRecord>,
}

pub struct ChangeLog;

impl ChangeLog {
    /// Stage one edit against `request.release_id`
    ///
    /// Every decision is derived from one read of the release's pending changes, and the batch
    /// carries that read. The store refuses the batch with `ConstraintViolation` if another edit
    /// or a publish changed the pending set in between.
    pub async fn record_change<S: Store>(
        store: &S,
        config: &EngineConfig,
        request: StageRequest,
    ) -> Result<StageOutcome> {
        let release = store
            .get_release(&request.release_id)
            .await?
            .filter(|r| r.is_active())
            .ok_or_else(|| ReleaseError::not_found(format!("release {}", request.release_id)))?;
        let kind = request.entity_kind;

        SyntaxValidator::validate(kind, request.change_type, &request.syntax_json)?;

        let requested_id = request.object_id.or_else(|| syntax_id(&request.syntax_json));
        if requested_id.is_none() && request.change_type != ChangeType::Create {
            return Err(ReleaseError::Validation(format!(
                "{} of a {} requires an object id",
                request.change_type, kind
            )));
        }

        let pending = store.pending_changes(&release.id, None).await?;
        let prior = requested_id.and_then(|id| {
            pending
                .iter()
                .find(|c| c.entity_kind == kind && c.object_id == id)
                .cloned()
        });
        let upstream = Overlay::nearest_snapshot(store, &release, kind).await?;
        let upstream_item = requested_id.and_then(|id| find_by_id(&upstream, &id).cloned());

        let resolution = Self::resolve(prior.as_ref(), upstream_item, request.change_type)
            .ok_or_else(|| {
                ReleaseError::not_found(format!(
                    "{} {} in release {}",
                    kind,
                    requested_id.map(|id| id.to_string()).unwrap_or_default(),
                    release.version_label
                ))
            })?;

        let mut batch = StagingBatch::new(release.id).expecting(pending.iter().map(|c| c.id));
        if let Some(prior) = &prior {
            batch.remove.push(prior.id);
        }

        let (change_type, previous, genuine_create) = match resolution {
            Resolution::Cancel => {
                // `prior` is always a pending CREATE here
                let object_id = requested_id.ok_or_else(|| {
                    ReleaseError::Validation("cancelled change has no object id".to_string())
                })?;
                if kind == EntityKind::ModelSchema {
                    for id in Self::pending_dependents(&pending, &object_id) {
                        if !batch.remove.contains(&id) {
                            batch.remove.push(id);
                        }
                    }
                }
                let cancelled = batch.remove.clone();
                log::debug!(
                    "Cancelled pending {} {} in release {} ({} records)",
                    kind,
                    object_id,
                    release.version_label,
                    cancelled.len()
                );
                store.apply_staging(batch).await?;
                return Ok(StageOutcome {
                    object_id,
                    record: None,
                    companions: Vec::new(),
                    cancelled,
                });
            }
            Resolution::Stage {
                change_type,
                previous,
                genuine_create,
            } => (change_type, previous, genuine_create),
        };

        let object_id = match requested_id {
            Some(id) => id,
            None => Self::unique_object_id(
                kind,
                &upstream,
                &pending,
                &HashSet::new(),
                config.id_retry_limit,
                generate_id,
            )?,
        };

        let mut syntax = request.syntax_json;
        if let Some(previous) = &previous {
            carry_identity(previous, &mut syntax);
        }
        set_syntax_id(&mut syntax, object_id);

        if change_type != ChangeType::Delete {
            Self::check_model_schema_ref(store, &release, &pending, kind, &object_id, &syntax)
                .await?;
        }

        let record = ChangeRecord::pending(release.id, change_type, kind, object_id, syntax);
        batch.insert.push(record.clone());

        let mut companions = Vec::new();
        let mut cancelled = Vec::new();
        if kind == EntityKind::ModelSchema {
            if genuine_create && config.auto_stage_pages {
                companions = Self::default_pages(
                    store,
                    &release,
                    &pending,
                    &record,
                    config.id_retry_limit,
                )
                .await?;
            } else if change_type == ChangeType::Delete {
                let dependents =
                    Self::dependent_page_deletes(store, &release, &pending, &object_id).await?;
                batch.remove.extend(dependents.superseded);
                batch.remove.extend(dependents.cancelled.iter().copied());
                cancelled = dependents.cancelled;
                companions = dependents.deletes;
            }
        }
        batch.insert.extend(companions.iter().cloned());

        log::debug!(
            "Staging {} {} {} against release {} ({} companions)",
            change_type,
            kind,
            object_id,
            release.version_label,
            companions.len()
        );
        store.apply_staging(batch).await?;

        Ok(StageOutcome {
            object_id,
            record: Some(record),
            companions,
            cancelled,
        })
    }

    /// Transition table. `None` means the edit targets an object that does not exist.
    fn resolve(
        prior: Option<&ChangeRecord>,
        upstream: Option<Value>,
        requested: ChangeType,
    ) -> Option<Resolution> {
        use ChangeType::*;

        let stage = |change_type: ChangeType, previous: Option<Value>| Resolution::Stage {
            change_type,
            previous,
            genuine_create: false,
        };

        Some(match (prior, requested) {
            (Some(p), Delete) if p.change_type == Create => Resolution::Cancel,
            (Some(p), Create | Update) if p.change_type == Create => {
                stage(Create, Some(p.syntax_json.clone()))
            }
            (Some(p), Delete) => stage(Delete, Some(p.syntax_json.clone())),
            (Some(p), Create | Update) => stage(Update, Some(p.syntax_json.clone())),
            (None, requested) => match (upstream, requested) {
                (Some(existing), Delete) => stage(Delete, Some(existing)),
                (Some(existing), Create | Update) => stage(Update, Some(existing)),
                (None, Create) => Resolution::Stage {
                    change_type: Create,
                    previous: None,
                    genuine_create: true,
                },
                (None, Update | Delete) => return None,
            },
        })
    }

    /// Draw ids from `next_id` until one is not used by the upstream snapshot, a pending
    /// creation of the same kind, or `reserved`
    fn unique_object_id(
        kind: EntityKind,
        upstream: &[Value],
        pending: &[ChangeRecord],
        reserved: &HashSet<Id>,
        retry_limit: usize,
        mut next_id: impl FnMut() -> Id,
    ) -> Result<Id> {
        let taken: HashSet<Id> = pending
            .iter()
            .filter(|c| c.entity_kind == kind && c.change_type == ChangeType::Create)
            .map(|c| c.object_id)
            .chain(upstream.iter().filter_map(syntax_id))
            .chain(reserved.iter().copied())
            .collect();

        for _ in 0..retry_limit.max(1) {
            let candidate = next_id();
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
            log::debug!("Generated {} id {} collided, retrying", kind, candidate);
        }

        Err(ReleaseError::constraint(format!(
            "could not generate a unique {} id after {} attempts",
            kind, retry_limit
        )))
    }

    async fn check_model_schema_ref<S: Store>(
        store: &S,
        release: &Release,
        pending: &[ChangeRecord],
        kind: EntityKind,
        object_id: &Id,
        syntax: &Value,
    ) -> Result<()> {
        let Some(schema_id) = model_schema_ref(syntax) else {
            return Ok(());
        };
        if kind == EntityKind::ModelSchema && &schema_id == object_id {
            return Ok(());
        }

        let schemas = Overlay::overlay(store, release, EntityKind::ModelSchema, pending).await?;
        if find_by_id(&schemas, &schema_id).is_none() {
            return Err(ReleaseError::InvalidReference(format!(
                "{} references unknown model-schema {}",
                kind, schema_id
            )));
        }
        Ok(())
    }

    /// Pending changes of any kind bound to a model-schema
    fn pending_dependents(pending: &[ChangeRecord], schema_id: &Id) -> Vec<Id> {
        pending
            .iter()
            .filter(|c| c.references_model_schema(schema_id))
            .map(|c| c.id)
            .collect()
    }

    /// The four default pages for a freshly created model-schema
    async fn default_pages<S: Store>(
        store: &S,
        release: &Release,
        pending: &[ChangeRecord],
        schema: &ChangeRecord,
        retry_limit: usize,
    ) -> Result<Vec<ChangeRecord>> {
        let model_name = model_name_of(&schema.syntax_json).unwrap_or_default().to_string();
        let upstream_pages = Overlay::nearest_snapshot(store, release, EntityKind::Page).await?;

        let mut reserved = HashSet::new();
        let mut pages = Vec::with_capacity(PageTemplate::ALL.len());
        for template in PageTemplate::ALL {
            let page_id = Self::unique_object_id(
                EntityKind::Page,
                &upstream_pages,
                pending,
                &reserved,
                retry_limit,
                generate_id,
            )?;
            reserved.insert(page_id);

            pages.push(ChangeRecord::pending(
                release.id,
                ChangeType::Create,
                EntityKind::Page,
                page_id,
                template.companion_page(page_id, schema.object_id, &model_name),
            ));
        }
        Ok(pages)
    }

    /// Deletes for the live pages bound to a model-schema being deleted
    async fn dependent_page_deletes<S: Store>(
        store: &S,
        release: &Release,
        pending: &[ChangeRecord],
        schema_id: &Id,
    ) -> Result<DependentPages> {
        let live_pages = Overlay::overlay(store, release, EntityKind::Page, pending).await?;

        let mut dependents = DependentPages::default();
        for page in live_pages
            .iter()
            .filter(|page| model_schema_ref(page).as_ref() == Some(schema_id))
        {
            let Some(page_id) = syntax_id(page) else {
                continue;
            };
            let pending_page = pending
                .iter()
                .find(|c| c.entity_kind == EntityKind::Page && c.object_id == page_id);
            match pending_page {
                Some(change) if change.change_type == ChangeType::Create => {
                    dependents.cancelled.push(change.id);
                    continue;
                }
                Some(change) => dependents.superseded.push(change.id),
                None => {}
            }
            dependents.deletes.push(ChangeRecord::pending(
                release.id,
                ChangeType::Delete,
                EntityKind::Page,
                page_id,
                page.clone(),
            ));
        }
        Ok(dependents)
    }
}
