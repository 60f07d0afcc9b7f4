#![cfg(feature = "pg-tests")]

use lowcode_releases::config::EngineConfig;
use lowcode_releases::model::{syntax_id, ChangeType, EntityKind};
use lowcode_releases::store::{ChangeStore, PostgresStore, ReleaseStore, SyntaxStore};
use lowcode_releases::{ReleaseError, ReleaseRef, StageRequest, SyntaxService};
use serde_json::json;
use std::sync::Arc;

async fn pg_store() -> Option<PostgresStore> {
    let url = match std::env::var("RELEASES_TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
    {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping pg-tests: set RELEASES_TEST_DATABASE_URL or DATABASE_URL");
            return None;
        }
    };
    let store = match PostgresStore::new(&url, 5).await {
        Ok(store) => store,
        Err(err) => {
            eprintln!("skipping pg-tests: cannot connect to postgres: {err}");
            return None;
        }
    };
    store.migrate().await.ok()?;
    sqlx::query("TRUNCATE release_changes, syntax_snapshots, releases RESTART IDENTITY CASCADE")
        .execute(store.pool())
        .await
        .ok()?;
    Some(store)
}

// One test body: the tables are shared, so the scenarios run in sequence
#[tokio::test]
async fn test_postgres_release_lifecycle() {
    let Some(store) = pg_store().await else {
        return;
    };
    let store = Arc::new(store);
    let service = SyntaxService::new(Arc::clone(&store), EngineConfig::default());

    let root = service.create_root_release("0.0.0", "", None).await.unwrap();
    let err = service.create_root_release("0.0.1", "", None).await.unwrap_err();
    assert!(matches!(err, ReleaseError::ConstraintViolation(_)));

    let book = service
        .create(
            EntityKind::ModelSchema,
            &ReleaseRef::Current,
            json!({"model_name": "Book", "fields": [{"field_name": "title", "field_type": "text"}]}),
        )
        .await
        .unwrap();
    assert_eq!(store.pending_changes(&root.id, None).await.unwrap().len(), 5);

    // Second pending change for the same object is collapsed, not duplicated
    service
        .update(
            EntityKind::ModelSchema,
            &book,
            &ReleaseRef::Current,
            json!({"model_name": "Book", "fields": []}),
        )
        .await
        .unwrap();
    let pending = store
        .find_pending_change(&root.id, EntityKind::ModelSchema, &book)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.change_type, ChangeType::Create);

    let r1 = service
        .publish(&ReleaseRef::Current, Some("AAAA1"), "first", None)
        .await
        .unwrap();
    assert!(r1.is_current);
    assert_eq!(store.get_current_release().await.unwrap().unwrap().id, r1.id);
    assert!(!store.get_release(&root.id).await.unwrap().unwrap().is_current);

    let schemas = store.get_snapshot(&r1.id, EntityKind::ModelSchema).await.unwrap();
    assert_eq!(schemas.len(), 1);
    assert_eq!(syntax_id(&schemas[0]), Some(book));
    for kind in EntityKind::ALL {
        assert!(store.find_snapshot(&r1.id, kind).await.unwrap().unwrap().verify());
    }
    assert_eq!(store.committed_changes(&r1.id).await.unwrap().len(), 5);
    assert!(store.pending_changes(&root.id, None).await.unwrap().is_empty());

    let err = service
        .publish(&ReleaseRef::Current, None, "", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ReleaseError::NoChanges(_)));

    // Branch from the root and drop the abandoned line
    let outcome = service
        .stage(StageRequest {
            release_id: root.id,
            change_type: ChangeType::Create,
            entity_kind: EntityKind::Function,
            object_id: None,
            syntax_json: json!({"function_name": "Send Email"}),
        })
        .await
        .unwrap();
    assert!(outcome.record.is_some());
    let r2 = service
        .publish(&ReleaseRef::from(&root), Some("0.2.0"), "", None)
        .await
        .unwrap();
    assert_eq!(r2.parent_id, Some(root.id));

    let err = service.delete_release(&ReleaseRef::from(&r2)).await.unwrap_err();
    assert!(matches!(err, ReleaseError::ConstraintViolation(_)));
    assert_eq!(service.delete_release(&ReleaseRef::from(&r1)).await.unwrap(), vec![r1.id]);
    assert!(store.find_snapshot(&r1.id, EntityKind::Page).await.unwrap().is_none());
    assert_eq!(store.list_releases().await.unwrap().len(), 2);
}
