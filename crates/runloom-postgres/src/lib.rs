//! PostgreSQL implementation of the runloom state repository
//!
//! Production-ready persistence with one table per record family and
//! upsert writes throughout; the engine's operations are idempotent, so
//! at-least-once delivery is safe.
//!
//! # Example
//!
//! ```ignore
//! use runloom_postgres::PostgresRepository;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/runloom").await?;
//! let repository = PostgresRepository::new(pool);
//! repository.migrate().await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use runloom_core::{
    AsyncTaskState, CircuitSnapshot, ContextSnapshot, InstanceStatus, RepositoryError,
    RetryState, StateRepository, SuspensionPayload, WorkflowFailure, WorkflowInstance,
};

/// Embedded schema, applied idempotently by [`PostgresRepository::migrate`]
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS runloom_instances (
        instance_id    TEXT PRIMARY KEY,
        graph_id       TEXT NOT NULL,
        graph_version  INTEGER NOT NULL,
        status         TEXT NOT NULL,
        current_step   TEXT,
        context        JSONB NOT NULL,
        failure        JSONB,
        suspended_step TEXT,
        async_task     TEXT,
        created_at     TIMESTAMPTZ NOT NULL,
        updated_at     TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS runloom_retry_state (
        instance_id TEXT NOT NULL,
        step_id     TEXT NOT NULL,
        data        JSONB NOT NULL,
        PRIMARY KEY (instance_id, step_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS runloom_breakers (
        graph_id TEXT NOT NULL,
        step_id  TEXT NOT NULL,
        data     JSONB NOT NULL,
        PRIMARY KEY (graph_id, step_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS runloom_async_tasks (
        instance_id TEXT NOT NULL,
        task_id     TEXT NOT NULL,
        data        JSONB NOT NULL,
        PRIMARY KEY (instance_id, task_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS runloom_suspensions (
        instance_id TEXT PRIMARY KEY,
        data        JSONB NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS runloom_instances_status_idx
        ON runloom_instances (status)
    "#,
];

/// PostgreSQL implementation of [`StateRepository`]
///
/// Uses a connection pool for efficient access; safe to clone and share.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Create a repository over an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema (idempotent)
    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        }
        debug!("runloom schema is up to date");
        Ok(())
    }
}

fn db_error(error: sqlx::Error) -> RepositoryError {
    error!("database operation failed: {error}");
    RepositoryError::Database(error.to_string())
}

fn parse_status(status: &str) -> Result<InstanceStatus, RepositoryError> {
    match status {
        "created" => Ok(InstanceStatus::Created),
        "running" => Ok(InstanceStatus::Running),
        "suspended" => Ok(InstanceStatus::Suspended),
        "completed" => Ok(InstanceStatus::Completed),
        "failed" => Ok(InstanceStatus::Failed),
        "cancelled" => Ok(InstanceStatus::Cancelled),
        other => Err(RepositoryError::Serialization(format!(
            "unknown instance status '{other}'"
        ))),
    }
}

#[async_trait]
impl StateRepository for PostgresRepository {
    #[instrument(skip(self, instance), fields(instance_id = %instance.instance_id))]
    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let context = serde_json::to_value(&instance.context)?;
        let failure = instance
            .failure
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO runloom_instances
                (instance_id, graph_id, graph_version, status, current_step,
                 context, failure, suspended_step, async_task, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (instance_id) DO UPDATE SET
                status         = EXCLUDED.status,
                current_step   = EXCLUDED.current_step,
                context        = EXCLUDED.context,
                failure        = EXCLUDED.failure,
                suspended_step = EXCLUDED.suspended_step,
                async_task     = EXCLUDED.async_task,
                updated_at     = EXCLUDED.updated_at
            "#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.graph_id)
        .bind(instance.graph_version as i32)
        .bind(instance.status.to_string())
        .bind(&instance.current_step)
        .bind(&context)
        .bind(&failure)
        .bind(&instance.suspended_step)
        .bind(&instance.async_task)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT instance_id, graph_id, graph_version, status, current_step,
                   context, failure, suspended_step, async_task, created_at, updated_at
            FROM runloom_instances
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        let Some(row) = row else { return Ok(None) };

        let status: String = row.get("status");
        let context: serde_json::Value = row.get("context");
        let context: ContextSnapshot = serde_json::from_value(context)?;
        let failure: Option<serde_json::Value> = row.get("failure");
        let failure: Option<WorkflowFailure> =
            failure.map(serde_json::from_value).transpose()?;
        let created_at: DateTime<Utc> = row.get("created_at");
        let updated_at: DateTime<Utc> = row.get("updated_at");
        let graph_version: i32 = row.get("graph_version");

        Ok(Some(WorkflowInstance {
            instance_id: row.get("instance_id"),
            graph_id: row.get("graph_id"),
            graph_version: graph_version as u32,
            status: parse_status(&status)?,
            current_step: row.get("current_step"),
            context,
            failure,
            suspended_step: row.get("suspended_step"),
            async_task: row.get("async_task"),
            created_at,
            updated_at,
        }))
    }

    #[instrument(skip(self))]
    async fn delete_instance(&self, instance_id: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM runloom_instances WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self, state), fields(step_id = %state.step_id))]
    async fn save_retry_state(
        &self,
        instance_id: &str,
        state: &RetryState,
    ) -> Result<(), RepositoryError> {
        let data = serde_json::to_value(state)?;
        sqlx::query(
            r#"
            INSERT INTO runloom_retry_state (instance_id, step_id, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (instance_id, step_id) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(instance_id)
        .bind(&state.step_id)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_retry_state(
        &self,
        instance_id: &str,
        step_id: &str,
    ) -> Result<Option<RetryState>, RepositoryError> {
        let row = sqlx::query(
            "SELECT data FROM runloom_retry_state WHERE instance_id = $1 AND step_id = $2",
        )
        .bind(instance_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            let data: serde_json::Value = row.get("data");
            serde_json::from_value(data).map_err(RepositoryError::from)
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn delete_retry_state(
        &self,
        instance_id: &str,
        step_id: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM runloom_retry_state WHERE instance_id = $1 AND step_id = $2")
            .bind(instance_id)
            .bind(step_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self, snapshot))]
    async fn save_breaker(
        &self,
        graph_id: &str,
        step_id: &str,
        snapshot: &CircuitSnapshot,
    ) -> Result<(), RepositoryError> {
        let data = serde_json::to_value(snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO runloom_breakers (graph_id, step_id, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (graph_id, step_id) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(graph_id)
        .bind(step_id)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_breaker(
        &self,
        graph_id: &str,
        step_id: &str,
    ) -> Result<Option<CircuitSnapshot>, RepositoryError> {
        let row =
            sqlx::query("SELECT data FROM runloom_breakers WHERE graph_id = $1 AND step_id = $2")
                .bind(graph_id)
                .bind(step_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        row.map(|row| {
            let data: serde_json::Value = row.get("data");
            serde_json::from_value(data).map_err(RepositoryError::from)
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn delete_breaker(&self, graph_id: &str, step_id: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM runloom_breakers WHERE graph_id = $1 AND step_id = $2")
            .bind(graph_id)
            .bind(step_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self, state), fields(task_id = %state.task_id))]
    async fn save_async_task(
        &self,
        instance_id: &str,
        state: &AsyncTaskState,
    ) -> Result<(), RepositoryError> {
        let data = serde_json::to_value(state)?;
        sqlx::query(
            r#"
            INSERT INTO runloom_async_tasks (instance_id, task_id, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (instance_id, task_id) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(instance_id)
        .bind(&state.task_id)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_async_task(
        &self,
        instance_id: &str,
        task_id: &str,
    ) -> Result<Option<AsyncTaskState>, RepositoryError> {
        let row = sqlx::query(
            "SELECT data FROM runloom_async_tasks WHERE instance_id = $1 AND task_id = $2",
        )
        .bind(instance_id)
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            let data: serde_json::Value = row.get("data");
            serde_json::from_value(data).map_err(RepositoryError::from)
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn delete_async_task(
        &self,
        instance_id: &str,
        task_id: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM runloom_async_tasks WHERE instance_id = $1 AND task_id = $2")
            .bind(instance_id)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self, payload), fields(instance_id = %payload.instance_id))]
    async fn save_suspension(&self, payload: &SuspensionPayload) -> Result<(), RepositoryError> {
        let data = serde_json::to_value(payload)?;
        sqlx::query(
            r#"
            INSERT INTO runloom_suspensions (instance_id, data)
            VALUES ($1, $2)
            ON CONFLICT (instance_id) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(&payload.instance_id)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_suspension(
        &self,
        instance_id: &str,
    ) -> Result<Option<SuspensionPayload>, RepositoryError> {
        let row = sqlx::query("SELECT data FROM runloom_suspensions WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(|row| {
            let data: serde_json::Value = row.get("data");
            serde_json::from_value(data).map_err(RepositoryError::from)
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn delete_suspension(&self, instance_id: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM runloom_suspensions WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_all(&self, instance_id: &str) -> Result<(), RepositoryError> {
        // Breaker snapshots are keyed by graph, not instance, and survive
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query("DELETE FROM runloom_instances WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        sqlx::query("DELETE FROM runloom_retry_state WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        sqlx::query("DELETE FROM runloom_async_tasks WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        sqlx::query("DELETE FROM runloom_suspensions WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("running").unwrap(), InstanceStatus::Running);
        assert_eq!(parse_status("suspended").unwrap(), InstanceStatus::Suspended);
        assert!(parse_status("bogus").is_err());
    }

    #[test]
    fn test_status_round_trip_through_display() {
        for status in [
            InstanceStatus::Created,
            InstanceStatus::Running,
            InstanceStatus::Suspended,
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::Cancelled,
        ] {
            assert_eq!(parse_status(&status.to_string()).unwrap(), status);
        }
    }
}
