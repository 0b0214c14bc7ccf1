//! PostgreSQL metadata store implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{ControlError, ControlResult};
use crate::types::{
    DeploymentId, DeploymentRecord, DeploymentStatus, FunctionId, FunctionRecord, FunctionStatus,
    InvocationId, InvocationRecord, InvocationStatus, OwnerId,
};

use super::MetadataStore;

const FUNCTION_COLUMNS: &str =
    "id, uuid, owner_id, name, status, active_deployment_id, created_at, updated_at";

const DEPLOYMENT_COLUMNS: &str = "id, uuid, function_id, version, image_tag, archive_key, \
     status, is_active, error, created_at, deployed_at";

/// PostgreSQL-backed metadata store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect using the database configuration.
    ///
    /// The required tables are created if they don't exist.
    pub async fn connect(config: &DatabaseConfig) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Connect to PostgreSQL with default pool settings.
    pub async fn new(url: &str) -> ControlResult<Self> {
        Self::connect(&DatabaseConfig {
            url: url.to_owned(),
            ..DatabaseConfig::default()
        })
        .await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS functions (
                id TEXT PRIMARY KEY,
                uuid UUID NOT NULL UNIQUE,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                active_deployment_id TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (owner_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                uuid UUID NOT NULL UNIQUE,
                function_id TEXT NOT NULL REFERENCES functions(id),
                version BIGINT NOT NULL,
                image_tag TEXT NOT NULL,
                archive_key TEXT NOT NULL,
                status TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT FALSE,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                deployed_at TIMESTAMPTZ,
                UNIQUE (function_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_one_active
            ON deployments (function_id) WHERE is_active
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS invocations (
                id TEXT PRIMARY KEY,
                function_id TEXT NOT NULL REFERENCES functions(id),
                deployment_id TEXT NOT NULL REFERENCES deployments(id),
                status TEXT NOT NULL,
                duration_ms BIGINT NOT NULL,
                error TEXT,
                logs JSONB NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_invocations_function_timestamp
            ON invocations (function_id, timestamp DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_function(row: &PgRow) -> ControlResult<FunctionRecord> {
        let status_str: String = row.get("status");
        let status: FunctionStatus = status_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse status '{status_str}': {e}"))
        })?;
        let active: Option<String> = row.get("active_deployment_id");

        Ok(FunctionRecord {
            id: FunctionId::new(row.get::<String, _>("id")),
            uuid: row.get::<Uuid, _>("uuid"),
            owner_id: OwnerId::new(row.get::<String, _>("owner_id")),
            name: row.get("name"),
            status,
            active_deployment_id: active.map(DeploymentId::new),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_deployment(row: &PgRow) -> ControlResult<DeploymentRecord> {
        let status_str: String = row.get("status");
        let status: DeploymentStatus = status_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse status '{status_str}': {e}"))
        })?;
        let version: i64 = row.get("version");
        let version = u32::try_from(version).map_err(|_| {
            ControlError::Serialisation(format!("deployment version {version} out of range"))
        })?;

        Ok(DeploymentRecord {
            id: DeploymentId::new(row.get::<String, _>("id")),
            uuid: row.get("uuid"),
            function_id: FunctionId::new(row.get::<String, _>("function_id")),
            version,
            image_tag: row.get("image_tag"),
            archive_key: row.get("archive_key"),
            status,
            is_active: row.get("is_active"),
            created_at: row.get("created_at"),
            deployed_at: row.get::<Option<DateTime<Utc>>, _>("deployed_at"),
            error: row.get("error"),
        })
    }

    fn row_to_invocation(row: &PgRow) -> ControlResult<InvocationRecord> {
        let status_str: String = row.get("status");
        let status: InvocationStatus = status_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse status '{status_str}': {e}"))
        })?;
        let logs_json: serde_json::Value = row.get("logs");
        let logs: Vec<String> = serde_json::from_value(logs_json)
            .map_err(|e| ControlError::Serialisation(format!("failed to deserialise logs: {e}")))?;
        let duration_ms: i64 = row.get("duration_ms");

        Ok(InvocationRecord {
            id: InvocationId::new(row.get::<String, _>("id")),
            function_id: FunctionId::new(row.get::<String, _>("function_id")),
            deployment_id: DeploymentId::new(row.get::<String, _>("deployment_id")),
            status,
            duration_ms: u64::try_from(duration_ms).unwrap_or(0),
            error: row.get("error"),
            logs,
            timestamp: row.get("timestamp"),
        })
    }

    /// Lock a function row for the rest of the transaction.
    async fn lock_function(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: &FunctionId,
    ) -> ControlResult<FunctionRecord> {
        let row = sqlx::query(&format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some(r) => Self::row_to_function(&r),
            None => Err(ControlError::not_found(format!("function {id}"))),
        }
    }

    async fn set_function_status(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: &FunctionId,
        status: FunctionStatus,
    ) -> ControlResult<()> {
        sqlx::query("UPDATE functions SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status.as_str())
            .bind(id.as_str())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

/// Map unique-constraint violations to a conflict, everything else to a database error.
fn conflict_or_database(e: sqlx::Error, what: &str) -> ControlError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ControlError::ConcurrencyConflict(format!("{what}: {}", db.message()))
        }
        _ => ControlError::Database(e),
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn create_function(&self, record: &FunctionRecord) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO functions (
                id, uuid, owner_id, name, status, active_deployment_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.uuid)
        .bind(record.owner_id.as_str())
        .bind(&record.name)
        .bind(record.status.as_str())
        .bind(record.active_deployment_id.as_ref().map(DeploymentId::as_str))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.is_unique_violation()
                    && db.constraint() == Some("functions_owner_id_name_key") =>
            {
                Err(ControlError::AlreadyExists(format!(
                    "function {} for owner {}",
                    record.name, record.owner_id
                )))
            }
            Err(e) => Err(conflict_or_database(e, "insert function")),
        }
    }

    async fn get_function(&self, id: &FunctionId) -> ControlResult<Option<FunctionRecord>> {
        let row = sqlx::query(&format!("SELECT {FUNCTION_COLUMNS} FROM functions WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_function).transpose()
    }

    async fn find_function(
        &self,
        owner_id: &OwnerId,
        name: &str,
    ) -> ControlResult<Option<FunctionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions WHERE owner_id = $1 AND name = $2"
        ))
        .bind(owner_id.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_function).transpose()
    }

    async fn reserve_deployment(&self, function_id: &FunctionId) -> ControlResult<DeploymentRecord> {
        let mut tx = self.pool.begin().await?;

        let function = Self::lock_function(&mut tx, function_id).await?;
        let next_status = function.status.transition(FunctionStatus::Building)?;

        let max_version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM deployments WHERE function_id = $1",
        )
        .bind(function_id.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let next_version = u32::try_from(max_version + 1)
            .map_err(|_| ControlError::internal("version counter exhausted"))?;

        let record = DeploymentRecord::reserve(&function, next_version);

        sqlx::query(
            r#"
            INSERT INTO deployments (
                id, uuid, function_id, version, image_tag, archive_key,
                status, is_active, error, created_at, deployed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.uuid)
        .bind(record.function_id.as_str())
        .bind(i64::from(record.version))
        .bind(&record.image_tag)
        .bind(&record.archive_key)
        .bind(record.status.as_str())
        .bind(record.is_active)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.deployed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_or_database(e, "reserve version"))?;

        Self::set_function_status(&mut tx, function_id, next_status).await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn fail_deployment(&self, deployment_id: &DeploymentId, error: &str) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;

        let function_id: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE deployments
            SET status = $1, is_active = FALSE, error = $2
            WHERE id = $3
            RETURNING function_id
            "#,
        )
        .bind(DeploymentStatus::Failed.as_str())
        .bind(error)
        .bind(deployment_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let function_id = FunctionId::new(
            function_id.ok_or_else(|| ControlError::not_found(format!("deployment {deployment_id}")))?,
        );

        let function = Self::lock_function(&mut tx, &function_id).await?;
        let next_status = function.status.transition(FunctionStatus::Failed)?;
        Self::set_function_status(&mut tx, &function_id, next_status).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn activate(
        &self,
        function_id: &FunctionId,
        deployment_id: &DeploymentId,
    ) -> ControlResult<DeploymentRecord> {
        let mut tx = self.pool.begin().await?;

        let function = Self::lock_function(&mut tx, function_id).await?;
        let next_status = function.status.transition(FunctionStatus::Active)?;

        sqlx::query(
            r#"
            UPDATE deployments
            SET is_active = FALSE, status = $1
            WHERE function_id = $2 AND is_active AND id <> $3
            "#,
        )
        .bind(DeploymentStatus::Disabled.as_str())
        .bind(function_id.as_str())
        .bind(deployment_id.as_str())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE deployments
            SET is_active = TRUE, status = $1, deployed_at = NOW(), error = NULL
            WHERE id = $2 AND function_id = $3
            RETURNING {DEPLOYMENT_COLUMNS}
            "#
        ))
        .bind(DeploymentStatus::Active.as_str())
        .bind(deployment_id.as_str())
        .bind(function_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| conflict_or_database(e, "activate deployment"))?;

        let Some(row) = row else {
            return Err(ControlError::not_found(format!(
                "deployment {deployment_id} of function {function_id}"
            )));
        };
        let activated = Self::row_to_deployment(&row)?;

        sqlx::query(
            r#"
            UPDATE functions
            SET status = $1, active_deployment_id = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(next_status.as_str())
        .bind(deployment_id.as_str())
        .bind(function_id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(activated)
    }

    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_deployment).transpose()
    }

    async fn get_deployment_by_version(
        &self,
        function_id: &FunctionId,
        version: u32,
    ) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE function_id = $1 AND version = $2"
        ))
        .bind(function_id.as_str())
        .bind(i64::from(version))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_deployment).transpose()
    }

    async fn get_active_deployment(
        &self,
        function_id: &FunctionId,
    ) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE function_id = $1 AND is_active"
        ))
        .bind(function_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_deployment).transpose()
    }

    async fn list_deployments(&self, function_id: &FunctionId) -> ControlResult<Vec<DeploymentRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE function_id = $1 ORDER BY version"
        ))
        .bind(function_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_deployment).collect()
    }

    async fn record_invocation(&self, record: &InvocationRecord) -> ControlResult<()> {
        let logs_json = serde_json::to_value(&record.logs)
            .map_err(|e| ControlError::Serialisation(format!("failed to serialise logs: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO invocations (
                id, function_id, deployment_id, status, duration_ms, error, logs, timestamp
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.function_id.as_str())
        .bind(record.deployment_id.as_str())
        .bind(record.status.as_str())
        .bind(i64::try_from(record.duration_ms).unwrap_or(i64::MAX))
        .bind(&record.error)
        .bind(&logs_json)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_invocations(
        &self,
        function_id: &FunctionId,
        limit: u32,
    ) -> ControlResult<Vec<InvocationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, function_id, deployment_id, status, duration_ms, error, logs, timestamp
            FROM invocations
            WHERE function_id = $1
            ORDER BY timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(function_id.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_invocation).collect()
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}
