/// Durable execution queue and bounded worker pool
///
/// Every execution started through the pool is first written to the
/// `execution_jobs` table, then waits for a semaphore permit so at most
/// `max_concurrent_executions` runs are in flight. Jobs still `queued` or
/// `running` when the process stops are picked up again by `recover`.

use crate::runtime::engine::{Engine, ExecutionResult, RunOptions};
use crate::store::ExecutionStatus;
use crate::workflow::registry::DefinitionSource;
use crate::workflow::types::WorkflowDefinition;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{sqlite::SqlitePool, Row};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("Unknown job status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionJob {
    pub id: String,
    pub workflow_id: String,
    pub trigger_node_id: Option<String>,
    pub input: Value,
    pub status: JobStatus,
    pub execution_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_jobs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                trigger_node_id TEXT,
                input JSON NOT NULL,
                status TEXT NOT NULL,
                execution_id TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_execution_jobs_status ON execution_jobs(status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn enqueue(&self, workflow_id: &str, trigger_node_id: Option<&str>, input: &Value) -> Result<ExecutionJob> {
        let now = Utc::now();
        let job = ExecutionJob {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            trigger_node_id: trigger_node_id.map(str::to_string),
            input: input.clone(),
            status: JobStatus::Queued,
            execution_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO execution_jobs (id, workflow_id, trigger_node_id, input, status, execution_id, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.workflow_id)
        .bind(&job.trigger_node_id)
        .bind(serde_json::to_string(&job.input)?)
        .bind(job.status.to_string())
        .bind(&job.execution_id)
        .bind(&job.error)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn mark(
        &self,
        job_id: &str,
        status: JobStatus,
        execution_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE execution_jobs
            SET status = ?, execution_id = COALESCE(?, execution_id), error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(execution_id)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<ExecutionJob>> {
        let row = sqlx::query("SELECT * FROM execution_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    /// Jobs left `queued` or `running`, oldest first
    pub async fn unfinished(&self) -> Result<Vec<ExecutionJob>> {
        let rows = sqlx::query(
            "SELECT * FROM execution_jobs WHERE status IN ('queued', 'running') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    /// Delete finished jobs last touched before `cutoff`
    pub async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM execution_jobs WHERE status IN ('done', 'failed') AND updated_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<ExecutionJob> {
    let status: String = row.get("status");
    let input: String = row.get("input");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(ExecutionJob {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        trigger_node_id: row.get("trigger_node_id"),
        input: serde_json::from_str(&input)?,
        status: status.parse()?,
        execution_id: row.get("execution_id"),
        error: row.get("error"),
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

/// Bounded pool of concurrent executions
pub struct WorkerPool {
    engine: Arc<Engine>,
    queue: Option<JobQueue>,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(engine: Arc<Engine>, queue: Option<JobQueue>, max_concurrent: usize) -> Self {
        Self {
            engine,
            queue,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn queue(&self) -> Option<&JobQueue> {
        self.queue.as_ref()
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Persist a job, wait for a permit and run it to completion
    pub async fn submit(
        &self,
        definition: Arc<WorkflowDefinition>,
        input: Value,
        trigger_node_id: Option<&str>,
        options: RunOptions,
    ) -> Result<ExecutionResult> {
        let job = match &self.queue {
            Some(queue) => Some(queue.enqueue(&definition.id, trigger_node_id, &input).await?),
            None => None,
        };
        self.execute(job, definition, input, options).await
    }

    /// `submit` on a background task
    pub fn spawn(
        self: &Arc<Self>,
        definition: Arc<WorkflowDefinition>,
        input: Value,
        trigger_node_id: Option<String>,
        options: RunOptions,
    ) -> JoinHandle<Result<ExecutionResult>> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.submit(definition, input, trigger_node_id.as_deref(), options)
                .await
        })
    }

    async fn execute(
        &self,
        job: Option<ExecutionJob>,
        definition: Arc<WorkflowDefinition>,
        input: Value,
        mut options: RunOptions,
    ) -> Result<ExecutionResult> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| anyhow::anyhow!("Worker pool closed: {}", e))?;

        let execution_id = options
            .execution_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();

        if let (Some(queue), Some(job)) = (&self.queue, &job) {
            queue.mark(&job.id, JobStatus::Running, Some(&execution_id), None).await?;

            let mut metadata = match options.metadata.take() {
                Some(Value::Object(map)) => map,
                _ => serde_json::Map::new(),
            };
            metadata.insert("jobId".to_string(), json!(job.id));
            if let Some(node_id) = &job.trigger_node_id {
                metadata.insert("triggerNodeId".to_string(), json!(node_id));
            }
            options.metadata = Some(Value::Object(metadata));
        }

        let outcome = self.engine.run_with(definition, input, options).await;

        if let (Some(queue), Some(job)) = (&self.queue, &job) {
            let (status, error) = match &outcome {
                Ok(result) if result.status == ExecutionStatus::Completed => (JobStatus::Done, None),
                Ok(result) => (JobStatus::Failed, result.error.clone()),
                Err(e) => (JobStatus::Failed, Some(e.to_string())),
            };
            if let Err(e) = queue.mark(&job.id, status, None, error.as_deref()).await {
                tracing::error!("❌ Failed to update job {}: {}", job.id, e);
            }
        }

        outcome
    }

    /// Re-run jobs a previous process left unfinished
    ///
    /// Returns the number of jobs relaunched; jobs whose workflow is gone or
    /// inactive are marked failed instead.
    pub async fn recover(self: &Arc<Self>, definitions: Arc<dyn DefinitionSource>) -> Result<usize> {
        let Some(queue) = &self.queue else {
            return Ok(0);
        };

        let mut relaunched = 0;
        for job in queue.unfinished().await? {
            let definition = match definitions.load_definition(&job.workflow_id).await {
                Ok(Some(definition)) if definitions.is_active(&job.workflow_id).await.unwrap_or(false) => definition,
                Ok(_) => {
                    queue
                        .mark(&job.id, JobStatus::Failed, None, Some("Workflow no longer available"))
                        .await?;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Could not load workflow '{}' for job {}: {}", job.workflow_id, job.id, e);
                    continue;
                }
            };

            tracing::info!("♻️ Recovering job {} for workflow '{}'", job.id, job.workflow_id);

            let mut metadata = serde_json::Map::new();
            if let Some(previous) = &job.execution_id {
                let reason = format!("Interrupted before completion, relaunched from job {}", job.id);
                if let Err(e) = self
                    .engine
                    .close_orphaned(previous, ExecutionStatus::Failed, reason)
                    .await
                {
                    tracing::warn!("⚠️ Could not close interrupted execution {}: {}", previous, e);
                }
                metadata.insert("recoveredFrom".to_string(), json!(previous));
            }
            if let Some(node_id) = &job.trigger_node_id {
                tracing::info!(
                    "ℹ️ Job {} came from trigger '{}'; its recovered outcome is not reported to backoff",
                    job.id,
                    node_id
                );
            }

            let options = RunOptions {
                execution_id: None,
                metadata: (!metadata.is_empty()).then(|| Value::Object(metadata)),
            };
            let pool = Arc::clone(self);
            let input = job.input.clone();
            tokio::spawn(async move {
                if let Err(e) = pool.execute(Some(job), definition, input, options).await {
                    tracing::error!("❌ Recovered job failed to start: {}", e);
                }
            });
            relaunched += 1;
        }

        Ok(relaunched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::executor::BuiltinNodeRegistry;
    use crate::runtime::pause::PauseHub;
    use crate::store::{database::connect_in_memory, Execution, ExecutionStore, MemoryExecutionStore};
    use crate::workflow::registry::WorkflowRegistry;
    use std::time::Duration;

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::new(
            Arc::new(MemoryExecutionStore::new()),
            Arc::new(BuiltinNodeRegistry::new()),
            Arc::new(PauseHub::new(Duration::from_secs(5))),
        ))
    }

    fn workflow(id: &str) -> WorkflowDefinition {
        serde_json::from_value(json!({
            "id": id,
            "nodes": [
                { "id": "t", "type": "trigger.manual" },
                { "id": "set", "type": "util.set", "config": { "values": { "done": true } } }
            ],
            "edges": [{ "source": "t", "target": "set" }]
        }))
        .unwrap()
    }

    async fn queue() -> JobQueue {
        let queue = JobQueue::new(connect_in_memory().await.unwrap());
        queue.init_schema().await.unwrap();
        queue
    }

    #[tokio::test]
    async fn test_submit_records_job_lifecycle() {
        let pool = WorkerPool::new(engine(), Some(queue().await), 2);
        let result = pool
            .submit(Arc::new(workflow("wf")), json!({ "x": 1 }), Some("t"), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        let queue = pool.queue().unwrap();
        assert!(queue.unfinished().await.unwrap().is_empty());

        let execution = pool.engine().get_execution(&result.execution_id).await.unwrap().unwrap();
        let job_id = execution.metadata["jobId"].as_str().unwrap().to_string();
        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.execution_id.as_deref(), Some(result.execution_id.as_str()));
        assert_eq!(job.trigger_node_id.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn test_recover_relaunches_unfinished_jobs() {
        let queue = queue().await;
        let stale = queue.enqueue("wf", None, &json!({})).await.unwrap();
        let orphan = queue.enqueue("gone", None, &json!({})).await.unwrap();

        // The previous process got as far as starting an execution for `stale`
        let store = Arc::new(MemoryExecutionStore::new());
        let mut interrupted = Execution::new("exec-old".into(), "wf".into(), json!({}), json!({}));
        interrupted.status = ExecutionStatus::Running;
        store.create_execution(&interrupted).await.unwrap();
        queue.mark(&stale.id, JobStatus::Running, Some("exec-old"), None).await.unwrap();

        let engine = Arc::new(Engine::new(
            store.clone(),
            Arc::new(BuiltinNodeRegistry::new()),
            Arc::new(PauseHub::new(Duration::from_secs(5))),
        ));
        let registry = WorkflowRegistry::in_memory();
        registry.upsert(workflow("wf"), true);

        let pool = Arc::new(WorkerPool::new(engine, Some(queue), 1));
        assert_eq!(pool.recover(Arc::new(registry)).await.unwrap(), 1);

        let queue = pool.queue().unwrap();
        assert_eq!(queue.get(&orphan.id).await.unwrap().unwrap().status, JobStatus::Failed);

        let old = store.get_execution("exec-old").await.unwrap().unwrap();
        assert_eq!(old.status, ExecutionStatus::Failed);
        assert!(old.finished_at.is_some());
        assert!(old.error.unwrap().contains(&stale.id));

        for _ in 0..100 {
            let job = queue.get(&stale.id).await.unwrap().unwrap();
            if job.status == JobStatus::Done {
                let relaunched = job.execution_id.unwrap();
                assert_ne!(relaunched, "exec-old");
                let execution = store.get_execution(&relaunched).await.unwrap().unwrap();
                assert_eq!(execution.status, ExecutionStatus::Completed);
                assert_eq!(execution.metadata["recoveredFrom"], json!("exec-old"));
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("recovered job never finished");
    }

    #[tokio::test]
    async fn test_purge_keeps_recent_jobs() {
        let queue = queue().await;
        let job = queue.enqueue("wf", None, &json!({})).await.unwrap();
        queue.mark(&job.id, JobStatus::Done, None, None).await.unwrap();

        assert_eq!(queue.purge_finished(Utc::now() - chrono::Duration::days(30)).await.unwrap(), 0);
        assert_eq!(queue.purge_finished(Utc::now() + chrono::Duration::seconds(1)).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bounds_concurrency() {
        let pool = Arc::new(WorkerPool::new(engine(), None, 2));
        let slow: Arc<WorkflowDefinition> = Arc::new(
            serde_json::from_value(json!({
                "id": "slow",
                "nodes": [{ "id": "wait", "type": "human.input" }]
            }))
            .unwrap(),
        );

        let handles: Vec<_> = (0..3)
            .map(|i| {
                pool.spawn(
                    slow.clone(),
                    json!({}),
                    None,
                    RunOptions { execution_id: Some(format!("exec-{}", i)), metadata: None },
                )
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.available_permits(), 0);
        let running = (0..3).filter(|i| pool.engine().is_running(&format!("exec-{}", i))).count();
        assert_eq!(running, 2);

        for i in 0..3 {
            let id = format!("exec-{}", i);
            for _ in 0..100 {
                if pool.engine().submit_input(&id, "wait", json!({})).unwrap_or(false) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().status, ExecutionStatus::Completed);
        }
    }
}
