/// Cron scheduler for `trigger.schedule` nodes
///
/// A reconciliation loop compares the cron triggers of every active workflow
/// with the jobs currently registered in tokio-cron-scheduler and registers,
/// replaces or removes jobs so the two match. Each job key is
/// `workflow_id:node_id`. When a job fires, the per-job backoff controller
/// decides whether it may run, the execution goes through the worker pool and
/// the outcome is reported back (both gated by the `scheduler_backoff` flag).
///
/// Two daily housekeeping jobs share the same `JobScheduler`: the backoff idle
/// sweep and the execution-job retention sweep.

use crate::runtime::backoff::{job_key, BackoffController, BackoffDecision};
use crate::runtime::engine::{ExecutionResult, RunOptions};
use crate::runtime::flags::{FeatureFlags, SCHEDULER_BACKOFF};
use crate::runtime::queue::WorkerPool;
use crate::store::ExecutionStatus;
use crate::workflow::registry::DefinitionSource;
use anyhow::Result;
use chrono::{FixedOffset, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::json;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

const BACKOFF_SWEEP_CRON: &str = "0 0 3 * * *";
const JOB_RETENTION_CRON: &str = "0 30 3 * * *";

/// A cron job currently registered for a trigger node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredTrigger {
    pub workflow_id: String,
    pub node_id: String,
    pub cron: String,
    pub timezone: String,
    uuid: Uuid,
}

/// What a single timer fire did
#[derive(Debug, Clone)]
pub enum FireOutcome {
    /// Backoff refused the run
    Skipped(BackoffDecision),
    /// Workflow deleted or switched off since registration
    Inactive,
    Executed(ExecutionResult),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub registered: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub invalid: usize,
}

/// Timer body shared by every cron job
pub struct TriggerRunner {
    definitions: Arc<dyn DefinitionSource>,
    pool: Arc<WorkerPool>,
    backoff: Arc<BackoffController>,
    flags: Arc<dyn FeatureFlags>,
}

impl TriggerRunner {
    pub fn new(
        definitions: Arc<dyn DefinitionSource>,
        pool: Arc<WorkerPool>,
        backoff: Arc<BackoffController>,
        flags: Arc<dyn FeatureFlags>,
    ) -> Self {
        Self {
            definitions,
            pool,
            backoff,
            flags,
        }
    }

    /// Run one scheduled trigger now
    pub async fn fire(&self, workflow_id: &str, node_id: &str) -> Result<FireOutcome> {
        let key = job_key(workflow_id, node_id);
        let backoff_enabled = self.flags.is_enabled(SCHEDULER_BACKOFF, None, None).await;

        if backoff_enabled {
            let decision = self.backoff.should_execute(&key).await;
            if !decision.allow {
                tracing::info!(
                    "⏭️ Skipping cron job {}: {} (next retry: {:?})",
                    key,
                    decision.reason.as_deref().unwrap_or("backing off"),
                    decision.next_retry_at
                );
                return Ok(FireOutcome::Skipped(decision));
            }
        }

        let definition = match self.definitions.load_definition(workflow_id).await? {
            Some(definition) if self.definitions.is_active(workflow_id).await? => definition,
            _ => {
                tracing::debug!("⏭️ Skipping cron trigger for inactive workflow: {}", workflow_id);
                return Ok(FireOutcome::Inactive);
            }
        };

        tracing::info!("🔔 Cron trigger {} fired", key);

        let input = json!({
            "triggeredBy": "schedule",
            "triggerNodeId": node_id,
            "scheduledAt": Utc::now().to_rfc3339(),
        });
        let outcome = self
            .pool
            .submit(definition, input, Some(node_id), RunOptions::default())
            .await;

        if backoff_enabled {
            let succeeded = matches!(&outcome, Ok(result) if result.status == ExecutionStatus::Completed);
            if succeeded {
                self.backoff.record_success(&key).await?;
            } else {
                self.backoff.record_failure(&key).await?;
            }
        }

        match outcome {
            Ok(result) => {
                tracing::info!("✅ Cron-triggered execution {} ended {}", result.execution_id, result.status);
                Ok(FireOutcome::Executed(result))
            }
            Err(e) => {
                tracing::error!("❌ Cron-triggered workflow {} failed to start: {}", workflow_id, e);
                Err(e)
            }
        }
    }
}

/// Hot-reload cron scheduler service
pub struct CronSchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    /// Key: job key, tracks UUIDs for removal
    job_uuid_map: Arc<RwLock<HashMap<String, RegisteredTrigger>>>,
    runner: Arc<TriggerRunner>,
    reconcile_interval: Duration,
    job_retention_days: i64,
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
}

impl CronSchedulerService {
    pub async fn new(runner: Arc<TriggerRunner>, reconcile_interval: Duration, job_retention_days: i64) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create scheduler: {}", e))?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid_map: Arc::new(RwLock::new(HashMap::new())),
            runner,
            reconcile_interval,
            job_retention_days,
            reconcile_task: Mutex::new(None),
        })
    }

    pub fn runner(&self) -> Arc<TriggerRunner> {
        Arc::clone(&self.runner)
    }

    /// Register triggers, housekeeping jobs and the reconcile loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        tracing::info!("⏰ Starting cron scheduler service");

        if let Err(e) = self.reconcile().await {
            tracing::warn!("⚠️ Initial cron reconciliation failed: {}", e);
        }
        self.register_housekeeping().await?;

        {
            let scheduler = self.scheduler.read().await;
            scheduler
                .start()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to start scheduler: {}", e))?;
        }

        let service = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.reconcile_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = service.reconcile().await {
                    tracing::warn!("⚠️ Cron reconciliation failed, retrying next pass: {}", e);
                }
            }
        });
        *self.reconcile_task.lock().await = Some(task);

        tracing::info!("✅ Cron scheduler started (reconcile every {:?})", self.reconcile_interval);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping cron scheduler service");

        if let Some(task) = self.reconcile_task.lock().await.take() {
            task.abort();
        }
        self.job_uuid_map.write().await.clear();

        {
            let mut scheduler = self.scheduler.write().await;
            scheduler
                .shutdown()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to stop scheduler: {}", e))?;
        }

        tracing::info!("✅ Cron scheduler stopped");
        Ok(())
    }

    /// One reconciliation pass
    ///
    /// Invalid cron expressions or timezones are logged and skipped; they are
    /// retried on the next pass.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let workflows = self.runner.definitions.list_active().await?;
        let mut report = ReconcileReport::default();

        let mut desired = HashMap::new();
        for workflow in &workflows {
            for trigger in workflow.schedule_triggers() {
                desired.insert(job_key(&workflow.id, &trigger.node_id), (workflow.id.clone(), trigger));
            }
        }

        let stale: Vec<String> = {
            let job_uuid_map = self.job_uuid_map.read().await;
            job_uuid_map
                .keys()
                .filter(|key| !desired.contains_key(*key))
                .cloned()
                .collect()
        };
        for key in stale {
            self.remove_job(&key).await;
            report.removed += 1;
        }

        for (key, (workflow_id, trigger)) in desired {
            let cron = normalize_cron(&trigger.cron);

            let unchanged = self
                .job_uuid_map
                .read()
                .await
                .get(&key)
                .map(|existing| existing.cron == cron && existing.timezone == trigger.timezone)
                .unwrap_or(false);
            if unchanged {
                report.unchanged += 1;
                continue;
            }

            let job = match self.build_job(&cron, &trigger.timezone, &workflow_id, &trigger.node_id) {
                Ok(job) => job,
                Err(e) => {
                    // An edit that breaks the schedule must not leave the old one firing
                    tracing::warn!("⚠️ Skipping cron trigger {}: {}", key, e);
                    self.remove_job(&key).await;
                    report.invalid += 1;
                    continue;
                }
            };

            self.remove_job(&key).await;

            let uuid = {
                let scheduler = self.scheduler.write().await;
                scheduler
                    .add(job)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to add cron job {}: {}", key, e))?
            };

            self.job_uuid_map.write().await.insert(
                key.clone(),
                RegisteredTrigger {
                    workflow_id,
                    node_id: trigger.node_id.clone(),
                    cron: cron.clone(),
                    timezone: trigger.timezone.clone(),
                    uuid,
                },
            );
            tracing::info!("🔥 Registered cron job {} ({} {})", key, cron, trigger.timezone);
            report.registered += 1;
        }

        tracing::debug!("📊 Cron reconciliation: {:?}", report);
        Ok(report)
    }

    pub async fn registered_triggers(&self) -> Vec<RegisteredTrigger> {
        self.job_uuid_map.read().await.values().cloned().collect()
    }

    pub async fn job_count(&self) -> usize {
        self.job_uuid_map.read().await.len()
    }

    async fn remove_job(&self, key: &str) {
        let Some(existing) = self.job_uuid_map.write().await.remove(key) else {
            return;
        };

        let scheduler = self.scheduler.read().await;
        if let Err(e) = scheduler.remove(&existing.uuid).await {
            tracing::warn!("⚠️ Failed to remove job {} from scheduler: {}", key, e);
        } else {
            tracing::debug!("🛑 Removed cron job from scheduler: {}", key);
        }
    }

    fn build_job(&self, cron: &str, timezone: &str, workflow_id: &str, node_id: &str) -> Result<Job> {
        let runner = Arc::clone(&self.runner);
        let workflow_id = workflow_id.to_string();
        let node_id = node_id.to_string();

        match parse_timezone(timezone)? {
            CronTimezone::Utc => create_cron_job(cron, Utc, runner, workflow_id, node_id),
            CronTimezone::FixedOffset(offset) => create_cron_job(cron, offset, runner, workflow_id, node_id),
            CronTimezone::Named(tz) => create_cron_job(cron, tz, runner, workflow_id, node_id),
        }
    }

    async fn register_housekeeping(&self) -> Result<()> {
        let backoff = Arc::clone(&self.runner.backoff);
        let backoff_sweep = Job::new_async(BACKOFF_SWEEP_CRON, move |_uuid, _lock| {
            let backoff = Arc::clone(&backoff);
            Box::pin(async move {
                if let Err(e) = backoff.sweep_idle().await {
                    tracing::error!("❌ Backoff idle sweep failed: {}", e);
                }
            })
        })
        .map_err(|e| anyhow::anyhow!("Failed to create backoff sweep job: {}", e))?;

        let pool = Arc::clone(&self.runner.pool);
        let retention_days = self.job_retention_days;
        let retention_sweep = Job::new_async(JOB_RETENTION_CRON, move |_uuid, _lock| {
            let pool = Arc::clone(&pool);
            Box::pin(async move {
                let Some(queue) = pool.queue() else {
                    return;
                };
                let cutoff = Utc::now() - chrono::Duration::days(retention_days);
                match queue.purge_finished(cutoff).await {
                    Ok(purged) if purged > 0 => tracing::info!("🧹 Purged {} finished execution jobs", purged),
                    Ok(_) => {}
                    Err(e) => tracing::error!("❌ Execution job retention sweep failed: {}", e),
                }
            })
        })
        .map_err(|e| anyhow::anyhow!("Failed to create retention sweep job: {}", e))?;

        let scheduler = self.scheduler.write().await;
        for job in [backoff_sweep, retention_sweep] {
            scheduler
                .add(job)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to add housekeeping job: {}", e))?;
        }
        tracing::debug!("🧹 Registered daily housekeeping jobs");
        Ok(())
    }
}

/// Prefix a seconds field to classic 5-field expressions
pub fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

enum CronTimezone {
    Utc,
    FixedOffset(FixedOffset),
    Named(Tz),
}

fn parse_timezone(raw: &str) -> Result<CronTimezone> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("utc") {
        return Ok(CronTimezone::Utc);
    }

    if let Ok(tz) = trimmed.parse::<Tz>() {
        return Ok(CronTimezone::Named(tz));
    }

    if let Some(offset) = parse_fixed_offset(trimmed) {
        return Ok(CronTimezone::FixedOffset(offset));
    }

    Err(anyhow::anyhow!(
        "Invalid timezone '{}'. Use an IANA name (e.g. 'Asia/Jakarta') or a UTC offset (e.g. '+07:00')",
        raw
    ))
}

fn parse_fixed_offset(raw: &str) -> Option<FixedOffset> {
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };

    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None if rest.len() == 4 => (rest.get(0..2)?.parse::<i32>().ok()?, rest.get(2..4)?.parse::<i32>().ok()?),
        None => return None,
    };

    if hours > 23 || minutes > 59 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn create_cron_job<TZ: TimeZone + Send + Sync + 'static>(
    cron: &str,
    timezone: TZ,
    runner: Arc<TriggerRunner>,
    workflow_id: String,
    node_id: String,
) -> Result<Job> {
    Job::new_async_tz(cron, timezone, move |_uuid, _lock| {
        let runner = Arc::clone(&runner);
        let workflow_id = workflow_id.clone();
        let node_id = node_id.clone();

        Box::pin(async move {
            if let Err(e) = runner.fire(&workflow_id, &node_id).await {
                tracing::error!("❌ Cron trigger {}:{} failed: {}", workflow_id, node_id, e);
            }
        })
    })
    .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", cron, e))
}
