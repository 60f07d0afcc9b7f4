//! Postgres-backed release store.
//!
//! Every mutating call runs in one transaction. Publishing locks the parent release row with
//! `SELECT ... FOR UPDATE`, and staging locks the same row, so a publish and concurrent staging
//! against one release are serialized. Partial unique indexes enforce the single current
//! release and the single pending change per object even under concurrent writers; their
//! violations surface as `ConstraintViolation`.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::HashSet;

use crate::error::{ReleaseError, Result};
use crate::model::{
    ChangeRecord, EntityKind, Id, Release, ReleaseStatus, SyntaxSnapshot,
};
use crate::store::traits::{Activation, ChangeStore, ReleaseStore, StagingBatch, SyntaxStore};

const RELEASE_COLUMNS: &str =
    "id, version_label, notes, released_at, released_by, is_current, parent_id, status";
const CHANGE_COLUMNS: &str = "id, parent_release_id, committed_release_id, change_type, \
     entity_kind, object_id, syntax_json, created_at";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

#[derive(Debug, Clone, FromRow)]
struct DbRelease {
    id: Id,
    version_label: String,
    notes: String,
    released_at: DateTime<Utc>,
    released_by: Option<String>,
    is_current: bool,
    parent_id: Option<Id>,
    status: String,
}

#[derive(Debug, Clone, FromRow)]
struct DbSnapshot {
    release_id: Id,
    entity_kind: String,
    items: Value,
    checksum: String,
}

#[derive(Debug, Clone, FromRow)]
struct DbChange {
    id: Id,
    parent_release_id: Id,
    committed_release_id: Option<Id>,
    change_type: String,
    entity_kind: String,
    object_id: Id,
    syntax_json: Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<DbRelease> for Release {
    type Error = ReleaseError;

    fn try_from(row: DbRelease) -> Result<Self> {
        Ok(Release {
            id: row.id,
            version_label: row.version_label,
            notes: row.notes,
            released_at: row.released_at,
            released_by: row.released_by,
            is_current: row.is_current,
            parent_id: row.parent_id,
            status: row.status.parse()?,
        })
    }
}

impl TryFrom<DbSnapshot> for SyntaxSnapshot {
    type Error = ReleaseError;

    fn try_from(row: DbSnapshot) -> Result<Self> {
        let items = match row.items {
            Value::Array(items) => items,
            other => {
                return Err(ReleaseError::Storage(anyhow::anyhow!(
                    "snapshot items must be a JSON array, got {}",
                    other
                )))
            }
        };
        Ok(SyntaxSnapshot {
            release_id: row.release_id,
            entity_kind: row.entity_kind.parse()?,
            items,
            checksum: row.checksum,
        })
    }
}

impl TryFrom<DbChange> for ChangeRecord {
    type Error = ReleaseError;

    fn try_from(row: DbChange) -> Result<Self> {
        Ok(ChangeRecord {
            id: row.id,
            parent_release_id: row.parent_release_id,
            committed_release_id: row.committed_release_id,
            change_type: row.change_type.parse()?,
            entity_kind: row.entity_kind.parse()?,
            object_id: row.object_id,
            syntax_json: row.syntax_json,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = ReleaseError>,
{
    rows.into_iter().map(T::try_from).collect()
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock an active release row for the rest of the transaction
    async fn lock_active_release(
        tx: &mut Transaction<'_, Postgres>,
        id: &Id,
    ) -> Result<Release> {
        let row = sqlx::query_as::<_, DbRelease>(&format!(
            "SELECT {} FROM releases WHERE id = $1 AND status = 'active' FOR UPDATE",
            RELEASE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        row.ok_or_else(|| ReleaseError::not_found(format!("release {}", id)))?
            .try_into()
    }

    async fn insert_snapshot(
        tx: &mut Transaction<'_, Postgres>,
        snapshot: &SyntaxSnapshot,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO syntax_snapshots (release_id, entity_kind, items, checksum)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(snapshot.release_id)
        .bind(snapshot.entity_kind.as_str())
        .bind(Value::Array(snapshot.items.clone()))
        .bind(&snapshot.checksum)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReleaseStore for PostgresStore {
    async fn get_release(&self, id: &Id) -> Result<Option<Release>> {
        let row = sqlx::query_as::<_, DbRelease>(&format!(
            "SELECT {} FROM releases WHERE id = $1",
            RELEASE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch release")?;

        row.map(Release::try_from).transpose()
    }

    async fn get_release_by_label(&self, label: &str) -> Result<Option<Release>> {
        let row = sqlx::query_as::<_, DbRelease>(&format!(
            "SELECT {} FROM releases WHERE version_label = $1 AND status = 'active'",
            RELEASE_COLUMNS
        ))
        .bind(label)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch release by label")?;

        row.map(Release::try_from).transpose()
    }

    async fn get_current_release(&self) -> Result<Option<Release>> {
        let row = sqlx::query_as::<_, DbRelease>(&format!(
            "SELECT {} FROM releases WHERE is_current",
            RELEASE_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch current release")?;

        row.map(Release::try_from).transpose()
    }

    async fn list_releases(&self) -> Result<Vec<Release>> {
        let rows = sqlx::query_as::<_, DbRelease>(&format!(
            "SELECT {} FROM releases WHERE status = 'active' ORDER BY released_at, id",
            RELEASE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list releases")?;

        convert_all(rows)
    }

    async fn label_exists(&self, label: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM releases WHERE version_label = $1)")
                .bind(label)
                .fetch_one(&self.pool)
                .await
                .context("Failed to check version label")?;
        Ok(exists)
    }

    async fn create_root_release(&self, release: Release) -> Result<Release> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent bootstraps
        sqlx::query("LOCK TABLE releases IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM releases WHERE status = 'active'")
                .fetch_one(&mut *tx)
                .await?;
        if existing > 0 {
            return Err(ReleaseError::constraint(
                "a root release already exists; publish a new release instead",
            ));
        }

        let release = Release {
            parent_id: None,
            is_current: true,
            status: ReleaseStatus::Active,
            ..release
        };
        sqlx::query(
            r#"INSERT INTO releases (id, version_label, notes, released_at, released_by, is_current, parent_id, status)
               VALUES ($1, $2, $3, $4, $5, TRUE, NULL, 'active')"#,
        )
        .bind(release.id)
        .bind(&release.version_label)
        .bind(&release.notes)
        .bind(release.released_at)
        .bind(&release.released_by)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(release)
    }

    async fn stage_release(&self, release: Release, snapshots: Vec<SyntaxSnapshot>) -> Result<()> {
        if release.status != ReleaseStatus::Pending || release.is_current {
            return Err(ReleaseError::constraint(
                "only a pending, non-current release can be staged",
            ));
        }
        let parent_id = release
            .parent_id
            .ok_or_else(|| ReleaseError::constraint("a staged release needs a parent"))?;
        if snapshots.iter().any(|s| s.release_id != release.id) {
            return Err(ReleaseError::constraint(
                "snapshot belongs to a different release",
            ));
        }

        let mut tx = self.pool.begin().await?;
        Self::lock_active_release(&mut tx, &parent_id).await?;

        sqlx::query(
            r#"INSERT INTO releases (id, version_label, notes, released_at, released_by, is_current, parent_id, status)
               VALUES ($1, $2, $3, $4, $5, FALSE, $6, 'pending')"#,
        )
        .bind(release.id)
        .bind(&release.version_label)
        .bind(&release.notes)
        .bind(release.released_at)
        .bind(&release.released_by)
        .bind(parent_id)
        .execute(&mut *tx)
        .await?;

        for snapshot in &snapshots {
            Self::insert_snapshot(&mut tx, snapshot).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn activate_release(&self, activation: Activation) -> Result<Release> {
        let mut tx = self.pool.begin().await?;

        Self::lock_active_release(&mut tx, &activation.parent_id).await?;

        let staged = sqlx::query_as::<_, DbRelease>(&format!(
            "SELECT {} FROM releases WHERE id = $1 AND status = 'pending' FOR UPDATE",
            RELEASE_COLUMNS
        ))
        .bind(activation.release_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            ReleaseError::not_found(format!("pending release {}", activation.release_id))
        })?;
        if staged.parent_id != Some(activation.parent_id) {
            return Err(ReleaseError::constraint("activation parent does not match"));
        }

        let pending: Vec<Id> = sqlx::query_scalar(
            r#"SELECT id FROM release_changes
               WHERE parent_release_id = $1 AND committed_release_id IS NULL
               FOR UPDATE"#,
        )
        .bind(activation.parent_id)
        .fetch_all(&mut *tx)
        .await?;
        let pending: HashSet<Id> = pending.into_iter().collect();
        let folded: HashSet<Id> = activation.folded_change_ids.iter().copied().collect();
        if pending != folded {
            return Err(ReleaseError::constraint(format!(
                "pending changes of release {} changed while publishing",
                activation.parent_id
            )));
        }

        sqlx::query("UPDATE releases SET is_current = FALSE WHERE is_current")
            .execute(&mut *tx)
            .await?;
        let activated = sqlx::query_as::<_, DbRelease>(&format!(
            "UPDATE releases SET status = 'active', is_current = TRUE WHERE id = $1 RETURNING {}",
            RELEASE_COLUMNS
        ))
        .bind(activation.release_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE release_changes SET committed_release_id = $1 WHERE id = ANY($2)")
            .bind(activation.release_id)
            .bind(&activation.folded_change_ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        activated.try_into()
    }

    async fn discard_pending_release(&self, id: &Id) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM releases WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        match status.as_deref() {
            None => return Ok(()),
            Some("active") => {
                return Err(ReleaseError::constraint(format!(
                    "release {} is active and cannot be discarded",
                    id
                )))
            }
            Some(_) => {}
        }

        // Snapshots go with the release through ON DELETE CASCADE
        sqlx::query("DELETE FROM releases WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_release_tree(&self, id: &Id) -> Result<Vec<Id>> {
        let mut tx = self.pool.begin().await?;

        let subtree: Vec<(Id, bool)> = sqlx::query_as(
            r#"
            WITH RECURSIVE subtree AS (
                SELECT id, is_current, 0 AS depth FROM releases WHERE id = $1
                UNION ALL
                SELECT r.id, r.is_current, s.depth + 1
                FROM releases r JOIN subtree s ON r.parent_id = s.id
            )
            SELECT id, is_current FROM subtree ORDER BY depth
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        if subtree.is_empty() {
            return Err(ReleaseError::not_found(format!("release {}", id)));
        }
        if subtree.iter().any(|(_, is_current)| *is_current) {
            return Err(ReleaseError::constraint(
                "the subtree contains the current release and cannot be deleted",
            ));
        }

        // Children, snapshots and both sides of the change log cascade from the root row
        sqlx::query("DELETE FROM releases WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(subtree.into_iter().map(|(id, _)| id).collect())
    }
}

#[async_trait::async_trait]
impl SyntaxStore for PostgresStore {
    async fn find_snapshot(
        &self,
        release_id: &Id,
        kind: EntityKind,
    ) -> Result<Option<SyntaxSnapshot>> {
        let row = sqlx::query_as::<_, DbSnapshot>(
            r#"SELECT release_id, entity_kind, items, checksum FROM syntax_snapshots
               WHERE release_id = $1 AND entity_kind = $2"#,
        )
        .bind(release_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch snapshot")?;

        row.map(SyntaxSnapshot::try_from).transpose()
    }

    async fn write_snapshot(&self, snapshot: SyntaxSnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM releases WHERE id = $1)")
                .bind(snapshot.release_id)
                .fetch_one(&mut *tx)
                .await?;
        if !exists {
            return Err(ReleaseError::not_found(format!(
                "release {}",
                snapshot.release_id
            )));
        }

        Self::insert_snapshot(&mut tx, &snapshot).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChangeStore for PostgresStore {
    async fn pending_changes(
        &self,
        release_id: &Id,
        kind: Option<EntityKind>,
    ) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query_as::<_, DbChange>(&format!(
            r#"SELECT {} FROM release_changes
               WHERE parent_release_id = $1 AND committed_release_id IS NULL
                 AND ($2::TEXT IS NULL OR entity_kind = $2)
               ORDER BY seq"#,
            CHANGE_COLUMNS
        ))
        .bind(release_id)
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pending changes")?;

        convert_all(rows)
    }

    async fn find_pending_change(
        &self,
        release_id: &Id,
        kind: EntityKind,
        object_id: &Id,
    ) -> Result<Option<ChangeRecord>> {
        let row = sqlx::query_as::<_, DbChange>(&format!(
            r#"SELECT {} FROM release_changes
               WHERE parent_release_id = $1 AND entity_kind = $2 AND object_id = $3
                 AND committed_release_id IS NULL"#,
            CHANGE_COLUMNS
        ))
        .bind(release_id)
        .bind(kind.as_str())
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch pending change")?;

        row.map(ChangeRecord::try_from).transpose()
    }

    async fn committed_changes(&self, release_id: &Id) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query_as::<_, DbChange>(&format!(
            "SELECT {} FROM release_changes WHERE committed_release_id = $1 ORDER BY seq",
            CHANGE_COLUMNS
        ))
        .bind(release_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list committed changes")?;

        convert_all(rows)
    }

    async fn apply_staging(&self, batch: StagingBatch) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        Self::lock_active_release(&mut tx, &batch.release_id).await?;

        if batch.expected_pending.is_some() {
            let current: HashSet<Id> = sqlx::query_scalar::<_, Id>(
                r#"SELECT id FROM release_changes
                   WHERE parent_release_id = $1 AND committed_release_id IS NULL"#,
            )
            .bind(batch.release_id)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .collect();
            if !batch.matches_pending(&current) {
                return Err(ReleaseError::constraint(format!(
                    "pending changes of release {} changed while the edit was prepared",
                    batch.release_id
                )));
            }
        }

        if !batch.remove.is_empty() {
            let removed = sqlx::query(
                r#"DELETE FROM release_changes
                   WHERE id = ANY($1) AND parent_release_id = $2 AND committed_release_id IS NULL"#,
            )
            .bind(&batch.remove)
            .bind(batch.release_id)
            .execute(&mut *tx)
            .await?;
            if removed.rows_affected() != batch.remove.len() as u64 {
                return Err(ReleaseError::constraint(
                    "a superseded change is no longer pending",
                ));
            }
        }

        for record in &batch.insert {
            if record.parent_release_id != batch.release_id || !record.is_pending() {
                return Err(ReleaseError::constraint(
                    "staged change does not belong to the batch release",
                ));
            }
            sqlx::query(
                r#"INSERT INTO release_changes
                   (id, parent_release_id, committed_release_id, change_type, entity_kind, object_id, syntax_json, created_at)
                   VALUES ($1, $2, NULL, $3, $4, $5, $6, $7)"#,
            )
            .bind(record.id)
            .bind(record.parent_release_id)
            .bind(record.change_type.as_str())
            .bind(record.entity_kind.as_str())
            .bind(record.object_id)
            .bind(&record.syntax_json)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
