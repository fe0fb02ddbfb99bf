//! Postgres-backed status store.
//!
//! Records are stored whole as JSONB next to a few indexed columns used for
//! filtering (`kind`, `status`, `subject_id`, `phase`, `parent_id`,
//! `updated_at`). Upserts lock the row with `SELECT ... FOR UPDATE` so
//! concurrent patches to the same record merge instead of overwriting each
//! other.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StatusStoreError |
//! |------------|------------------|
//! | PoolClosed / PoolTimedOut / Io | `Unavailable` |
//! | Decode / ColumnDecode | `Serialization` |
//! | everything else | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;

use sellerflow_core::Clock;

use super::{StatusPatch, StatusQuery, StatusRecord, StatusSort, StatusStore, StatusStoreError};

const TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS sellerflow_status (
    id          TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    status      TEXT NOT NULL,
    subject_id  TEXT,
    phase       TEXT,
    parent_id   TEXT,
    updated_at  TIMESTAMPTZ NOT NULL,
    record      JSONB NOT NULL
)
"#;

const INDEX_DDL: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS sellerflow_status_kind_status ON sellerflow_status (kind, status, updated_at DESC)",
    "CREATE INDEX IF NOT EXISTS sellerflow_status_subject ON sellerflow_status (subject_id)",
    "CREATE INDEX IF NOT EXISTS sellerflow_status_parent ON sellerflow_status (parent_id)",
];

#[derive(Debug, Clone)]
pub struct PostgresStatusStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl PostgresStatusStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: Arc::new(pool),
            clock,
        }
    }

    /// Connect and make sure the table exists.
    pub async fn connect(database_url: &str, clock: Arc<dyn Clock>) -> Result<Self, StatusStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool, clock);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StatusStoreError> {
        sqlx::query(TABLE_DDL)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        for ddl in INDEX_DDL {
            sqlx::query(ddl)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StatusStore for PostgresStatusStore {
    #[instrument(skip(self, patch), err)]
    async fn upsert(&self, id: &str, patch: StatusPatch) -> Result<StatusRecord, StatusStoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("upsert", e))?;

        let existing = sqlx::query("SELECT record FROM sellerflow_status WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("upsert", e))?;

        let mut record = match existing {
            Some(row) => {
                row.try_get::<Json<StatusRecord>, _>("record")
                    .map_err(|e| map_sqlx_error("upsert", e))?
                    .0
            }
            None => StatusRecord::new(id, patch.kind.unwrap_or_default(), now),
        };
        record.apply(patch, now);

        sqlx::query(
            r#"
            INSERT INTO sellerflow_status
                (id, kind, status, subject_id, phase, parent_id, updated_at, record)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                kind = EXCLUDED.kind,
                status = EXCLUDED.status,
                subject_id = EXCLUDED.subject_id,
                phase = EXCLUDED.phase,
                parent_id = EXCLUDED.parent_id,
                updated_at = EXCLUDED.updated_at,
                record = EXCLUDED.record
            "#,
        )
        .bind(&record.id)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(record.subject_id.as_deref())
        .bind(record.phase.as_deref())
        .bind(record.parent_id.as_deref())
        .bind(record.updated_at)
        .bind(Json(&record))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("upsert", e))?;
        Ok(record)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: &str) -> Result<Option<StatusRecord>, StatusStoreError> {
        let row = sqlx::query("SELECT record FROM sellerflow_status WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| {
            row.try_get::<Json<StatusRecord>, _>("record")
                .map(|json| json.0)
                .map_err(|e| map_sqlx_error("get", e))
        })
        .transpose()
    }

    #[instrument(skip(self), err)]
    async fn query(&self, query: &StatusQuery) -> Result<Vec<StatusRecord>, StatusStoreError> {
        let mut builder = build_query(query);
        let rows = builder
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("query", e))?;

        rows.into_iter()
            .map(|row| {
                row.try_get::<Json<StatusRecord>, _>("record")
                    .map(|json| json.0)
                    .map_err(|e| map_sqlx_error("query", e))
            })
            .collect()
    }
}

fn build_query(query: &StatusQuery) -> QueryBuilder<'_, Postgres> {
    let filter = &query.filter;
    let mut builder = QueryBuilder::new("SELECT record FROM sellerflow_status WHERE TRUE");

    if let Some(kind) = filter.kind {
        builder.push(" AND kind = ").push_bind(kind.as_str());
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(subject_id) = filter.subject_id.as_deref() {
        builder.push(" AND subject_id = ").push_bind(subject_id);
    }
    if let Some(phase) = filter.phase.as_deref() {
        builder.push(" AND phase = ").push_bind(phase);
    }
    if let Some(parent_id) = filter.parent_id.as_deref() {
        builder.push(" AND parent_id = ").push_bind(parent_id);
    }
    if let Some(after) = filter.updated_after {
        builder.push(" AND updated_at > ").push_bind(after);
    }

    builder.push(match query.sort {
        StatusSort::UpdatedDesc => " ORDER BY updated_at DESC, id ASC",
        StatusSort::UpdatedAsc => " ORDER BY updated_at ASC, id ASC",
    });
    if let Some(limit) = query.limit {
        builder.push(" LIMIT ").push_bind(limit as i64);
    }
    builder
}

fn map_sqlx_error(operation: &str, error: sqlx::Error) -> StatusStoreError {
    match error {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            StatusStoreError::Unavailable(format!("{operation}: {error}"))
        }
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            StatusStoreError::Serialization(format!("{operation}: {error}"))
        }
        other => StatusStoreError::Backend(format!("{operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{StatusFilter, StatusKind, StatusState};

    #[test]
    fn query_builder_binds_only_given_filters() {
        let query = StatusQuery {
            filter: StatusFilter {
                kind: Some(StatusKind::Unit),
                status: Some(StatusState::Failed),
                ..Default::default()
            },
            sort: StatusSort::UpdatedDesc,
            limit: Some(10),
        };
        let sql = build_query(&query).into_sql();
        assert_eq!(
            sql,
            "SELECT record FROM sellerflow_status WHERE TRUE AND kind = $1 AND status = $2 \
             ORDER BY updated_at DESC, id ASC LIMIT $3"
        );
    }

    #[test]
    fn pool_errors_map_to_unavailable() {
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::PoolClosed),
            StatusStoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::RowNotFound),
            StatusStoreError::Backend(_)
        ));
    }
}
