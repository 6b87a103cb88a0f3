/// SQLite persistence layer for workflow definitions
///
/// Definitions are written by the surrounding application; the engine only reads
/// them. Each row keeps the graph as JSON plus an `active` flag the scheduler
/// honours.

use crate::workflow::types::WorkflowDefinition;
use anyhow::Result;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;

/// SQLite-based workflow storage manager
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    /// SQLite connection pool for workflow database
    pool: SqlitePool,
}

impl WorkflowStorage {
    /// Create new storage instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the workflow storage schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition JSON NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflows_active ON workflows(active)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Store a new workflow or update existing one
    pub async fn save_workflow(&self, workflow: &WorkflowDefinition, active: bool) -> Result<()> {
        let definition_json = serde_json::to_string(workflow)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, definition, active, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                active = excluded.active,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&definition_json)
        .bind(active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retrieve a workflow by ID together with its active flag
    pub async fn get_workflow(&self, id: &str) -> Result<Option<(WorkflowDefinition, bool)>> {
        let row = sqlx::query("SELECT definition, active FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                let active: bool = row.get("active");
                let workflow: WorkflowDefinition = serde_json::from_str(&definition_json)?;
                Ok(Some((workflow, active)))
            }
            None => Ok(None),
        }
    }

    /// Load all workflows for registry initialization
    ///
    /// Rows whose JSON no longer parses are logged and skipped so one bad
    /// definition cannot block the others.
    pub async fn load_all_workflows(&self) -> Result<HashMap<String, (WorkflowDefinition, bool)>> {
        let rows = sqlx::query("SELECT id, definition, active FROM workflows")
            .fetch_all(&self.pool)
            .await?;

        let mut workflows = HashMap::new();
        for row in rows {
            let id: String = row.get("id");
            let definition_json: String = row.get("definition");
            let active: bool = row.get("active");
            match serde_json::from_str::<WorkflowDefinition>(&definition_json) {
                Ok(workflow) => {
                    workflows.insert(id, (workflow, active));
                }
                Err(e) => tracing::warn!("⚠️ Skipping unparsable workflow definition {}: {}", id, e),
            }
        }

        Ok(workflows)
    }

    /// Flip the active flag without touching the definition
    pub async fn set_active(&self, id: &str, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE workflows SET active = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a workflow by ID
    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::database::connect_in_memory;
    use serde_json::json;

    fn sample(id: &str) -> WorkflowDefinition {
        serde_json::from_value(json!({
            "id": id,
            "name": "sample",
            "nodes": [{ "id": "t", "type": "trigger.manual" }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_load_and_toggle() {
        let storage = WorkflowStorage::new(connect_in_memory().await.unwrap());
        storage.init_schema().await.unwrap();

        storage.save_workflow(&sample("wf-1"), true).await.unwrap();
        storage.save_workflow(&sample("wf-2"), false).await.unwrap();

        let all = storage.load_all_workflows().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all["wf-1"].1);
        assert!(!all["wf-2"].1);

        assert!(storage.set_active("wf-2", true).await.unwrap());
        let (_, active) = storage.get_workflow("wf-2").await.unwrap().unwrap();
        assert!(active);

        assert!(storage.delete_workflow("wf-1").await.unwrap());
        assert!(storage.get_workflow("wf-1").await.unwrap().is_none());
    }
}
