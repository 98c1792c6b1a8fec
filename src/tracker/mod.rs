//! Operation tracking store
//!
//! The engine owns one operation record exclusively for the duration of a
//! run: it appends progress steps and sets exactly one terminal state.
//! In-memory store for tests and single-process use; Postgres store for the
//! deployed service.

use crate::models::{Operation, OperationStatus, OperationStep};
use crate::error::EngineError;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Trait for operation persistence
#[async_trait::async_trait]
pub trait OperationStore: Send + Sync {
    async fn create(&self, operation: Operation) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Operation>>;
    async fn set_processing(&self, id: Uuid) -> Result<()>;
    /// Append a progress step. Steps are append-only; never reordered.
    async fn update_step(&self, id: Uuid, description: &str) -> Result<()>;
    /// Set the completed terminal state. Ignored once terminal.
    async fn complete(&self, id: Uuid, result: &str) -> Result<()>;
    /// Set the failed terminal state. Ignored once terminal.
    async fn fail(&self, id: Uuid, error: &str) -> Result<()>;
}

/// In-memory operation store for development and tests
pub struct InMemoryOperationStore {
    operations: Arc<RwLock<HashMap<Uuid, Operation>>>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self {
            operations: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryOperationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn create(&self, operation: Operation) -> Result<()> {
        let mut operations = self.operations.write().await;
        operations.insert(operation.id, operation);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Operation>> {
        let operations = self.operations.read().await;
        Ok(operations.get(&id).cloned())
    }

    async fn set_processing(&self, id: Uuid) -> Result<()> {
        let mut operations = self.operations.write().await;
        if let Some(op) = operations.get_mut(&id) {
            if !op.is_terminal() {
                op.status = OperationStatus::Processing;
            }
        }
        Ok(())
    }

    async fn update_step(&self, id: Uuid, description: &str) -> Result<()> {
        debug!(operation_id = %id, step = description, "Operation step");
        let mut operations = self.operations.write().await;
        if let Some(op) = operations.get_mut(&id) {
            op.record_step(description);
        }
        Ok(())
    }

    async fn complete(&self, id: Uuid, result: &str) -> Result<()> {
        let mut operations = self.operations.write().await;
        if let Some(op) = operations.get_mut(&id) {
            op.complete(result.to_string());
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        let mut operations = self.operations.write().await;
        if let Some(op) = operations.get_mut(&id) {
            op.fail(error.to_string());
        }
        Ok(())
    }
}

/// Postgres-backed operation store. Schema is created lazily on first use.
pub struct PgOperationStore {
    pool: sqlx::PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgOperationStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS ai_operations (
                      id UUID PRIMARY KEY,
                      user_id UUID NOT NULL,
                      status TEXT NOT NULL DEFAULT 'pending',
                      current_step TEXT,
                      steps JSONB NOT NULL DEFAULT '[]'::jsonb,
                      result TEXT,
                      error TEXT,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_ai_operations_user_status
                    ON ai_operations (user_id, status);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                EngineError::StoreError(format!("Failed to initialize operation schema: {}", e))
            })?;

        Ok(())
    }

    fn status_from_db(status: &str) -> OperationStatus {
        match status {
            "processing" => OperationStatus::Processing,
            "completed" => OperationStatus::Completed,
            "failed" => OperationStatus::Failed,
            _ => OperationStatus::Pending,
        }
    }
}

#[async_trait::async_trait]
impl OperationStore for PgOperationStore {
    async fn create(&self, operation: Operation) -> Result<()> {
        self.ensure_schema().await?;

        let steps = serde_json::to_value(&operation.steps)?;
        sqlx::query(
            r#"
            INSERT INTO ai_operations
              (id, user_id, status, current_step, steps, result, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(operation.id)
        .bind(operation.user_id)
        .bind(operation.status.as_str())
        .bind(&operation.current_step)
        .bind(steps)
        .bind(&operation.result)
        .bind(&operation.error)
        .bind(operation.created_at)
        .bind(operation.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Operation>> {
        use sqlx::Row;

        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT id, user_id, status, current_step, steps, result, error, created_at, updated_at
            FROM ai_operations WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status").unwrap_or_else(|_| "pending".to_string());
        let steps_value: serde_json::Value =
            row.try_get("steps").unwrap_or(serde_json::Value::Null);
        let steps: Vec<OperationStep> = serde_json::from_value(steps_value).unwrap_or_default();

        Ok(Some(Operation {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            status: Self::status_from_db(&status),
            current_step: row.try_get("current_step").ok(),
            steps,
            result: row.try_get("result").ok(),
            error: row.try_get("error").ok(),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn set_processing(&self, id: Uuid) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            UPDATE ai_operations SET status = 'processing', updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_step(&self, id: Uuid, description: &str) -> Result<()> {
        debug!(operation_id = %id, step = description, "Operation step");
        self.ensure_schema().await?;

        let Some(mut operation) = self.get(id).await? else {
            return Ok(());
        };
        operation.record_step(description);
        let steps = serde_json::to_value(&operation.steps)?;

        sqlx::query(
            r#"
            UPDATE ai_operations SET current_step = $2, steps = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&operation.current_step)
        .bind(steps)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete(&self, id: Uuid, result: &str) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            UPDATE ai_operations
            SET status = 'completed', result = $2, current_step = 'Completed', updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            UPDATE ai_operations
            SET status = 'failed', error = $2, current_step = 'Failed', updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn steps_are_append_only_and_ordered() {
        let store = InMemoryOperationStore::new();
        let id = Uuid::new_v4();
        store
            .create(Operation::new(id, Uuid::new_v4()))
            .await
            .unwrap();

        store.update_step(id, "Initializing analysis").await.unwrap();
        store.update_step(id, "Preparing request").await.unwrap();
        store.update_step(id, "Processing request").await.unwrap();

        let op = store.get(id).await.unwrap().unwrap();
        let descriptions: Vec<&str> =
            op.steps.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(
            descriptions,
            vec![
                "Initializing analysis",
                "Preparing request",
                "Processing request"
            ]
        );
    }

    #[tokio::test]
    async fn terminal_state_set_exactly_once() {
        let store = InMemoryOperationStore::new();
        let id = Uuid::new_v4();
        store
            .create(Operation::new(id, Uuid::new_v4()))
            .await
            .unwrap();

        store.fail(id, "backend outage").await.unwrap();
        store.complete(id, "late result").await.unwrap();

        let op = store.get(id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.error.as_deref(), Some("backend outage"));
        assert!(op.result.is_none());
    }

    #[tokio::test]
    async fn missing_operation_is_none() {
        let store = InMemoryOperationStore::new();
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }
}
