/// Execution and step persistence
///
/// The engine writes one `Execution` per run and one `ExecutionStep` per node
/// visit. The store owns the schema; the engine only relies on the
/// `ExecutionStore` contract, including the "next step number" query it calls
/// from inside its per-execution serial section.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use std::sync::Mutex;

/// Execution lifecycle status
///
/// pending → running → {paused ↔ running}* → completed | failed | cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(anyhow::anyhow!("Unknown execution status: {}", other)),
        }
    }
}

/// Outcome of a single step record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("Unknown step status: {}", other)),
        }
    }
}

/// One run of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Debug state, tenant ids, variable snapshots keyed by node id, replay origin
    pub metadata: Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(id: String, workflow_id: String, input: Value, metadata: Value) -> Self {
        Self {
            id,
            workflow_id,
            status: ExecutionStatus::Pending,
            input,
            output: None,
            error: None,
            metadata,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// One recorded node visit; retries inside the visit are folded into `retry_attempt`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    pub id: String,
    pub execution_id: String,
    pub step_number: i64,
    pub node_id: String,
    pub node_type: String,
    pub status: StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retry_attempt: u32,
    pub execution_time_ms: Option<u64>,
    pub parent_step_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Persistence contract used by the engine
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, execution: &Execution) -> Result<()>;

    /// Overwrite the stored record with `execution`
    async fn update_execution(&self, execution: &Execution) -> Result<()>;

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>>;

    /// 1 + highest step number recorded for the execution
    ///
    /// Not atomic on its own; callers serialize per execution.
    async fn next_step_number(&self, execution_id: &str) -> Result<i64>;

    async fn create_step(&self, step: &ExecutionStep) -> Result<()>;

    async fn update_step(&self, step: &ExecutionStep) -> Result<()>;

    /// Steps ordered by step number
    async fn list_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>>;
}

/// SQLite-backed execution store
#[derive(Debug, Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                input JSON NOT NULL,
                output JSON,
                error TEXT,
                metadata JSON NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_steps (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                step_number INTEGER NOT NULL,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                status TEXT NOT NULL,
                input JSON NOT NULL,
                output JSON,
                error TEXT,
                retry_attempt INTEGER NOT NULL DEFAULT 0,
                execution_time_ms INTEGER,
                parent_step_id TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                UNIQUE(execution_id, step_number)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn to_json_text(value: &Option<Value>) -> Result<Option<String>> {
    value.as_ref().map(serde_json::to_string).transpose().map_err(Into::into)
}

fn parse_json_text(raw: Option<String>) -> Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> Result<Execution> {
    let status: String = row.get("status");
    let input: String = row.get("input");
    let metadata: String = row.get("metadata");
    let started_at: String = row.get("started_at");
    let finished_at: Option<String> = row.get("finished_at");

    Ok(Execution {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        status: status.parse()?,
        input: serde_json::from_str(&input)?,
        output: parse_json_text(row.get("output"))?,
        error: row.get("error"),
        metadata: serde_json::from_str(&metadata)?,
        started_at: parse_timestamp(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> Result<ExecutionStep> {
    let status: String = row.get("status");
    let input: String = row.get("input");
    let started_at: String = row.get("started_at");
    let finished_at: Option<String> = row.get("finished_at");
    let retry_attempt: i64 = row.get("retry_attempt");
    let execution_time_ms: Option<i64> = row.get("execution_time_ms");

    Ok(ExecutionStep {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        step_number: row.get("step_number"),
        node_id: row.get("node_id"),
        node_type: row.get("node_type"),
        status: status.parse()?,
        input: serde_json::from_str(&input)?,
        output: parse_json_text(row.get("output"))?,
        error: row.get("error"),
        retry_attempt: retry_attempt.max(0) as u32,
        execution_time_ms: execution_time_ms.map(|ms| ms.max(0) as u64),
        parent_step_id: row.get("parent_step_id"),
        started_at: parse_timestamp(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions (id, workflow_id, status, input, output, error, metadata, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.workflow_id)
        .bind(execution.status.to_string())
        .bind(serde_json::to_string(&execution.input)?)
        .bind(to_json_text(&execution.output)?)
        .bind(&execution.error)
        .bind(serde_json::to_string(&execution.metadata)?)
        .bind(execution.started_at.to_rfc3339())
        .bind(execution.finished_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, output = ?, error = ?, metadata = ?, finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(execution.status.to_string())
        .bind(to_json_text(&execution.output)?)
        .bind(&execution.error)
        .bind(serde_json::to_string(&execution.metadata)?)
        .bind(execution.finished_at.map(|t| t.to_rfc3339()))
        .bind(&execution.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_execution).transpose()
    }

    async fn next_step_number(&self, execution_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(step_number), 0) + 1 AS next FROM execution_steps WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("next"))
    }

    async fn create_step(&self, step: &ExecutionStep) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_steps (id, execution_id, step_number, node_id, node_type, status, input,
                output, error, retry_attempt, execution_time_ms, parent_step_id, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&step.id)
        .bind(&step.execution_id)
        .bind(step.step_number)
        .bind(&step.node_id)
        .bind(&step.node_type)
        .bind(step.status.to_string())
        .bind(serde_json::to_string(&step.input)?)
        .bind(to_json_text(&step.output)?)
        .bind(&step.error)
        .bind(step.retry_attempt as i64)
        .bind(step.execution_time_ms.map(|ms| ms as i64))
        .bind(&step.parent_step_id)
        .bind(step.started_at.to_rfc3339())
        .bind(step.finished_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_step(&self, step: &ExecutionStep) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE execution_steps
            SET status = ?, input = ?, output = ?, error = ?, retry_attempt = ?, execution_time_ms = ?, finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(step.status.to_string())
        .bind(serde_json::to_string(&step.input)?)
        .bind(to_json_text(&step.output)?)
        .bind(&step.error)
        .bind(step.retry_attempt as i64)
        .bind(step.execution_time_ms.map(|ms| ms as i64))
        .bind(step.finished_at.map(|t| t.to_rfc3339()))
        .bind(&step.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>> {
        let rows = sqlx::query("SELECT * FROM execution_steps WHERE execution_id = ? ORDER BY step_number")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_step).collect()
    }
}

/// In-process store for tests and embedders without a database
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    executions: Mutex<HashMap<String, Execution>>,
    steps: Mutex<HashMap<String, Vec<ExecutionStep>>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> anyhow::Error {
    anyhow::anyhow!("Execution store lock poisoned")
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        self.executions
            .lock()
            .map_err(poisoned)?
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<()> {
        self.executions
            .lock()
            .map_err(poisoned)?
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        Ok(self.executions.lock().map_err(poisoned)?.get(execution_id).cloned())
    }

    async fn next_step_number(&self, execution_id: &str) -> Result<i64> {
        let steps = self.steps.lock().map_err(poisoned)?;
        let max = steps
            .get(execution_id)
            .and_then(|s| s.iter().map(|step| step.step_number).max())
            .unwrap_or(0);
        Ok(max + 1)
    }

    async fn create_step(&self, step: &ExecutionStep) -> Result<()> {
        self.steps
            .lock()
            .map_err(poisoned)?
            .entry(step.execution_id.clone())
            .or_default()
            .push(step.clone());
        Ok(())
    }

    async fn update_step(&self, step: &ExecutionStep) -> Result<()> {
        let mut steps = self.steps.lock().map_err(poisoned)?;
        let records = steps
            .get_mut(&step.execution_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown execution for step {}", step.id))?;
        let existing = records
            .iter_mut()
            .find(|s| s.id == step.id)
            .ok_or_else(|| anyhow::anyhow!("Unknown step {}", step.id))?;
        *existing = step.clone();
        Ok(())
    }

    async fn list_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>> {
        let mut steps = self
            .steps
            .lock()
            .map_err(poisoned)?
            .get(execution_id)
            .cloned()
            .unwrap_or_default();
        steps.sort_by_key(|s| s.step_number);
        Ok(steps)
    }
}
