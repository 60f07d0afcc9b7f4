//! Backing-table operations derived from published model-schema changes.

use serde_json::Value;
use std::collections::HashSet;

use crate::error::{ReleaseError, Result};
use crate::model::{
    fields_of, find_by_id, model_name_of, ChangeRecord, ChangeType, EntityKind, FieldSpec, Id,
};

/// Materializes model-schemas as dynamic tables. Implemented outside the engine.
#[async_trait::async_trait]
pub trait TableMigrator: Send + Sync {
    async fn create_table(
        &self,
        schema_id: &Id,
        name: &str,
        fields: &[FieldSpec],
    ) -> anyhow::Result<()>;
    async fn add_columns(&self, schema_id: &Id, fields: &[FieldSpec]) -> anyhow::Result<()>;
    async fn drop_table(&self, schema_id: &Id) -> anyhow::Result<()>;
}

/// Migrator for deployments that materialize tables elsewhere
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMigrator;

#[async_trait::async_trait]
impl TableMigrator for NoopMigrator {
    async fn create_table(
        &self,
        schema_id: &Id,
        name: &str,
        fields: &[FieldSpec],
    ) -> anyhow::Result<()> {
        log::debug!(
            "Skipping create_table for {} ({}, {} fields)",
            name,
            schema_id,
            fields.len()
        );
        Ok(())
    }

    async fn add_columns(&self, schema_id: &Id, fields: &[FieldSpec]) -> anyhow::Result<()> {
        log::debug!("Skipping add_columns for {} ({} fields)", schema_id, fields.len());
        Ok(())
    }

    async fn drop_table(&self, schema_id: &Id) -> anyhow::Result<()> {
        log::debug!("Skipping drop_table for {}", schema_id);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOperation {
    CreateTable {
        schema_id: Id,
        name: String,
        fields: Vec<FieldSpec>,
    },
    AddColumns {
        schema_id: Id,
        fields: Vec<FieldSpec>,
    },
    DropTable {
        schema_id: Id,
    },
}

impl TableOperation {
    pub fn schema_id(&self) -> &Id {
        match self {
            TableOperation::CreateTable { schema_id, .. }
            | TableOperation::AddColumns { schema_id, .. }
            | TableOperation::DropTable { schema_id } => schema_id,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            TableOperation::CreateTable { .. } => 0,
            TableOperation::AddColumns { .. } => 1,
            TableOperation::DropTable { .. } => 2,
        }
    }

    async fn apply<M: TableMigrator + ?Sized>(&self, migrator: &M) -> anyhow::Result<()> {
        match self {
            TableOperation::CreateTable { schema_id, name, fields } => {
                migrator.create_table(schema_id, name, fields).await
            }
            TableOperation::AddColumns { schema_id, fields } => {
                migrator.add_columns(schema_id, fields).await
            }
            TableOperation::DropTable { schema_id } => migrator.drop_table(schema_id).await,
        }
    }
}

/// Ordered table operations for one publish: creates, then column additions, then drops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    pub operations: Vec<TableOperation>,
}

impl MigrationPlan {
    /// Build the plan from the folded changes.
    ///
    /// `upstream_schemas` is the model-schema collection the publish started from; new columns
    /// are the fields whose names it does not already have.
    pub fn from_changes(changes: &[ChangeRecord], upstream_schemas: &[Value]) -> Result<Self> {
        let mut operations = Vec::new();

        for change in changes
            .iter()
            .filter(|c| c.entity_kind == EntityKind::ModelSchema)
        {
            let schema_id = change.object_id;
            match change.change_type {
                ChangeType::Create => {
                    let name = model_name_of(&change.syntax_json).ok_or_else(|| {
                        ReleaseError::Validation(format!(
                            "model-schema {} has no model_name",
                            schema_id
                        ))
                    })?;
                    operations.push(TableOperation::CreateTable {
                        schema_id,
                        name: name.to_string(),
                        fields: fields_of(&change.syntax_json)?,
                    });
                }
                ChangeType::Update => {
                    let existing: HashSet<String> = match find_by_id(upstream_schemas, &schema_id) {
                        Some(upstream) => fields_of(upstream)?
                            .into_iter()
                            .map(|f| f.field_name)
                            .collect(),
                        None => HashSet::new(),
                    };
                    let added: Vec<FieldSpec> = fields_of(&change.syntax_json)?
                        .into_iter()
                        .filter(|f| !existing.contains(&f.field_name))
                        .collect();
                    if !added.is_empty() {
                        operations.push(TableOperation::AddColumns { schema_id, fields: added });
                    }
                }
                ChangeType::Delete => operations.push(TableOperation::DropTable { schema_id }),
            }
        }

        operations.sort_by_key(TableOperation::rank);
        Ok(Self { operations })
    }

    /// Run every operation in order. On failure returns how many operations completed
    /// alongside the error.
    pub async fn apply<M: TableMigrator + ?Sized>(
        &self,
        migrator: &M,
    ) -> std::result::Result<(), (usize, anyhow::Error)> {
        for (index, operation) in self.operations.iter().enumerate() {
            log::info!("Applying table migration {:?}", operation);
            operation.apply(migrator).await.map_err(|err| (index, err))?;
        }
        Ok(())
    }

    /// Undo the first `applied` operations, newest first. Only table creation can be undone;
    /// anything else is logged and left in place.
    pub async fn compensate<M: TableMigrator + ?Sized>(&self, migrator: &M, applied: usize) {
        for operation in self.operations.iter().take(applied).rev() {
            match operation {
                TableOperation::CreateTable { schema_id, .. } => {
                    if let Err(err) = migrator.drop_table(schema_id).await {
                        log::warn!(
                            "Failed to drop table for model-schema {} during rollback: {}",
                            schema_id,
                            err
                        );
                    }
                }
                other => {
                    log::warn!("Cannot undo table migration {:?}; leaving it applied", other);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::generate_id;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_on_add: bool,
    }

    #[async_trait::async_trait]
    impl TableMigrator for Recorder {
        async fn create_table(
            &self,
            _schema_id: &Id,
            name: &str,
            _fields: &[FieldSpec],
        ) -> anyhow::Result<()> {
            self.calls.lock().push(format!("create {}", name));
            Ok(())
        }

        async fn add_columns(&self, _schema_id: &Id, fields: &[FieldSpec]) -> anyhow::Result<()> {
            if self.fail_on_add {
                anyhow::bail!("column type not supported");
            }
            let names: Vec<_> = fields.iter().map(|f| f.field_name.as_str()).collect();
            self.calls.lock().push(format!("add {}", names.join(",")));
            Ok(())
        }

        async fn drop_table(&self, schema_id: &Id) -> anyhow::Result<()> {
            self.calls.lock().push(format!("drop {}", schema_id));
            Ok(())
        }
    }

    fn schema_change(change_type: ChangeType, id: Id, syntax: Value) -> ChangeRecord {
        ChangeRecord::pending(generate_id(), change_type, EntityKind::ModelSchema, id, syntax)
    }

    #[test]
    fn test_plan_orders_and_diffs_columns() {
        let book = generate_id();
        let old = generate_id();
        let rental = generate_id();
        let upstream = vec![json!({
            "id": book.to_string(),
            "model_name": "Book",
            "fields": [{"field_name": "book_name", "field_type": "text"}]
        })];
        let changes = vec![
            schema_change(ChangeType::Delete, old, json!({"id": old.to_string()})),
            schema_change(
                ChangeType::Update,
                book,
                json!({"id": book.to_string(), "model_name": "Book", "fields": [
                    {"field_name": "book_name", "field_type": "text"},
                    {"field_name": "author", "field_type": "text"}
                ]}),
            ),
            schema_change(
                ChangeType::Create,
                rental,
                json!({"id": rental.to_string(), "model_name": "Rental", "fields": []}),
            ),
        ];

        let plan = MigrationPlan::from_changes(&changes, &upstream).unwrap();

        assert_eq!(plan.operations.len(), 3);
        assert!(matches!(
            &plan.operations[0],
            TableOperation::CreateTable { name, .. } if name == "Rental"
        ));
        match &plan.operations[1] {
            TableOperation::AddColumns { fields, .. } => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].field_name, "author");
            }
            other => panic!("expected AddColumns, got {:?}", other),
        }
        assert_eq!(plan.operations[2].schema_id(), &old);
    }

    #[test]
    fn test_update_without_new_fields_is_skipped() {
        let book = generate_id();
        let syntax = json!({"id": book.to_string(), "model_name": "Book", "fields": [{"field_name": "a", "field_type": "text"}]});
        let plan = MigrationPlan::from_changes(
            &[schema_change(ChangeType::Update, book, syntax.clone())],
            &[syntax],
        )
        .unwrap();
        assert!(plan.operations.is_empty());
    }

    #[tokio::test]
    async fn test_failure_reports_progress_and_compensates() {
        let created = generate_id();
        let plan = MigrationPlan {
            operations: vec![
                TableOperation::CreateTable {
                    schema_id: created,
                    name: "Book".to_string(),
                    fields: Vec::new(),
                },
                TableOperation::AddColumns {
                    schema_id: generate_id(),
                    fields: vec![FieldSpec {
                        field_name: "x".to_string(),
                        field_type: "text".to_string(),
                        required: false,
                    }],
                },
            ],
        };
        let migrator = Recorder {
            fail_on_add: true,
            ..Default::default()
        };

        let (applied, err) = plan.apply(&migrator).await.unwrap_err();
        assert_eq!(applied, 1);
        assert!(err.to_string().contains("not supported"));

        plan.compensate(&migrator, applied).await;
        assert_eq!(
            *migrator.calls.lock(),
            vec!["create Book".to_string(), format!("drop {}", created)]
        );
    }
}
