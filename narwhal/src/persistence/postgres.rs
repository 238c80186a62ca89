//! PostgreSQL-backed implementation of the run store.
//!
//! Expected schema (managed externally; migrations are out of scope):
//!
//! ```sql
//! CREATE TABLE narwhal_runs (
//!     id              UUID PRIMARY KEY,
//!     runnable_kind   TEXT        NOT NULL,
//!     runnable_id     UUID        NOT NULL,
//!     status          TEXT        NOT NULL,
//!     input_variables JSONB       NOT NULL DEFAULT '{}'::jsonb,
//!     output_data     JSONB,
//!     error_message   TEXT,
//!     submitted_at    TIMESTAMPTZ NOT NULL,
//!     started_at      TIMESTAMPTZ,
//!     ended_at        TIMESTAMPTZ,
//!     worker_handle   TEXT
//! );
//! CREATE INDEX narwhal_runs_active_idx
//!     ON narwhal_runs (submitted_at)
//!     WHERE status IN ('pending', 'running');
//! CREATE INDEX narwhal_runs_runnable_idx ON narwhal_runs (runnable_id);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::run::{Run, RunId, RunPatch, RunStatus, RunnableKind};
use crate::store::{RunFilter, RunStore, RunStoreError};

/// PostgreSQL-backed run store.
///
/// Every transition is a single conditional UPDATE, so a successful return
/// implies the write is durable and no reader can observe a half-applied
/// patch.
#[derive(Clone, Debug)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    /// Create a new store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_run(row: &sqlx::postgres::PgRow) -> Result<Run, RunStoreError> {
        let backend = |e: anyhow::Error| RunStoreError::Backend(e);

        let id: Uuid = row.try_get("id").map_err(|e| backend(e.into()))?;
        let kind_str: String = row
            .try_get("runnable_kind")
            .map_err(|e| backend(e.into()))?;
        let status_str: String =
            row.try_get("status").map_err(|e| backend(e.into()))?;
        let input: serde_json::Value = row
            .try_get("input_variables")
            .map_err(|e| backend(e.into()))?;
        let input_variables = match input {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };

        Ok(Run {
            id: RunId(id),
            runnable_kind: kind_str
                .parse::<RunnableKind>()
                .map_err(|e| backend(anyhow::anyhow!(e)))?,
            runnable_id: row
                .try_get("runnable_id")
                .map_err(|e| backend(e.into()))?,
            status: status_str
                .parse::<RunStatus>()
                .map_err(|e| backend(anyhow::anyhow!(e)))?,
            input_variables,
            output_data: row
                .try_get("output_data")
                .map_err(|e| backend(e.into()))?,
            error_message: row
                .try_get("error_message")
                .map_err(|e| backend(e.into()))?,
            submitted_at: row
                .try_get("submitted_at")
                .map_err(|e| backend(e.into()))?,
            started_at: row
                .try_get("started_at")
                .map_err(|e| backend(e.into()))?,
            ended_at: row.try_get("ended_at").map_err(|e| backend(e.into()))?,
            worker_handle: row
                .try_get("worker_handle")
                .map_err(|e| backend(e.into()))?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, runnable_kind, runnable_id, status, \
     input_variables, output_data, error_message, submitted_at, started_at, \
     ended_at, worker_handle";

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn insert_pending(
        &self,
        runnable_kind: RunnableKind,
        runnable_id: Uuid,
        input_variables: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Run, RunStoreError> {
        let submitted_at: DateTime<Utc> = Utc::now();
        let input_json = serde_json::Value::Object(input_variables.clone());

        // UUID v7 collisions are vanishingly rare; retry a couple of times
        // on unique violation before giving up.
        let mut last_id = RunId::new();
        for attempt in 0..3 {
            let id = if attempt == 0 { last_id } else { RunId::new() };
            last_id = id;

            let res = sqlx::query(
                r#"
                INSERT INTO narwhal_runs (
                    id, runnable_kind, runnable_id, status, input_variables,
                    output_data, error_message, submitted_at, started_at,
                    ended_at, worker_handle
                )
                VALUES ($1, $2, $3, 'pending', $4, NULL, NULL, $5, NULL, NULL, NULL)
                "#,
            )
            .bind(id.0)
            .bind(runnable_kind.as_str())
            .bind(runnable_id)
            .bind(&input_json)
            .bind(submitted_at)
            .execute(&self.pool)
            .await;

            match res {
                Ok(_) => {
                    return Ok(Run {
                        id,
                        runnable_kind,
                        runnable_id,
                        status: RunStatus::Pending,
                        input_variables,
                        output_data: None,
                        error_message: None,
                        submitted_at,
                        started_at: None,
                        ended_at: None,
                        worker_handle: None,
                    });
                }
                Err(sqlx::Error::Database(db_err))
                    if db_err.code().map(|c| c.to_string()).as_deref()
                        == Some("23505") =>
                {
                    debug!(%id, "run id collision on insert; retrying");
                    continue;
                }
                Err(e) => return Err(RunStoreError::Backend(e.into())),
            }
        }
        Err(RunStoreError::Conflict(last_id))
    }

    async fn transition(
        &self,
        id: RunId,
        expected: &[RunStatus],
        next: RunStatus,
        patch: RunPatch,
    ) -> Result<bool, RunStoreError> {
        let expected_strs: Vec<String> =
            expected.iter().map(|s| s.as_str().to_string()).collect();

        let res = sqlx::query(
            r#"
            UPDATE narwhal_runs
            SET status = $2,
                started_at = COALESCE(started_at, $3),
                ended_at = COALESCE(ended_at, $4),
                worker_handle = COALESCE($5, worker_handle),
                output_data = COALESCE($6, output_data),
                error_message = COALESCE($7, error_message)
            WHERE id = $1
              AND status = ANY($8)
            "#,
        )
        .bind(id.0)
        .bind(next.as_str())
        .bind(patch.started_at)
        .bind(patch.ended_at)
        .bind(patch.worker_handle)
        .bind(patch.output_data)
        .bind(patch.error_message)
        .bind(&expected_strs)
        .execute(&self.pool)
        .await
        .map_err(|e| RunStoreError::Backend(e.into()))?;

        Ok(res.rows_affected() > 0)
    }

    async fn fetch(&self, id: RunId) -> Result<Run, RunStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM narwhal_runs WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RunStoreError::Backend(e.into()))?;

        match row {
            Some(row) => Self::row_to_run(&row),
            None => Err(RunStoreError::NotFound(id)),
        }
    }

    async fn list(&self, filter: RunFilter) -> Result<Vec<Run>, RunStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM narwhal_runs
            WHERE ($1::uuid IS NULL OR runnable_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY submitted_at DESC
            "#
        ))
        .bind(filter.runnable_id)
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RunStoreError::Backend(e.into()))?;

        rows.iter().map(Self::row_to_run).collect()
    }

    async fn list_active(&self) -> Result<Vec<Run>, RunStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM narwhal_runs
            WHERE status IN ('pending', 'running')
            ORDER BY submitted_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RunStoreError::Backend(e.into()))?;

        rows.iter().map(Self::row_to_run).collect()
    }
}
