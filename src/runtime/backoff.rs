/// Per-job exponential backoff for scheduled triggers
///
/// Every scheduled job key `(workflow_id, trigger_node_id)` owns a small state
/// record: consecutive failures, the earliest time the job may fire again and a
/// sticky `disabled` flag. The scheduler asks `should_execute` before each tick
/// and reports the run outcome afterwards.
///
/// State lives in a durable `BackoffStore` (SQLite by default). If the store
/// errors the controller degrades to an in-process map, so state is then local
/// to this instance.

use crate::config::BackoffConfig;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Entries untouched for this long are treated as absent and swept
pub const IDLE_EXPIRY_DAYS: i64 = 30;

/// Job key for a scheduled trigger node
pub fn job_key(workflow_id: &str, node_id: &str) -> String {
    format!("{}:{}", workflow_id, node_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffState {
    pub consecutive_failures: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Sticky until a success (with reset-on-success) or a manual reset
    pub disabled: bool,
    pub updated_at: DateTime<Utc>,
}

impl BackoffState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            consecutive_failures: 0,
            next_retry_at: None,
            last_failure_at: None,
            last_success_at: None,
            disabled: false,
            updated_at: now,
        }
    }
}

/// Answer to "may this job fire now?"
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffDecision {
    pub allow: bool,
    pub reason: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl BackoffDecision {
    fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
            next_retry_at: None,
        }
    }
}

/// Durable key-value store for backoff state
#[async_trait]
pub trait BackoffStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<BackoffState>>;

    async fn put(&self, key: &str, state: &BackoffState) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Drop entries whose last update is older than `cutoff`; returns the count
    async fn sweep_idle(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct SqliteBackoffStore {
    pool: SqlitePool,
}

impl SqliteBackoffStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backoff_state (
                job_key TEXT PRIMARY KEY,
                state JSON NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl BackoffStore for SqliteBackoffStore {
    async fn get(&self, key: &str) -> Result<Option<BackoffState>> {
        let row = sqlx::query("SELECT state FROM backoff_state WHERE job_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.get("state");
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, state: &BackoffState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backoff_state (job_key, state, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(job_key) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(serde_json::to_string(state)?)
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM backoff_state WHERE job_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sweep_idle(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM backoff_state WHERE updated_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// In-process store; also the controller's fallback when the durable store fails
#[derive(Debug, Default)]
pub struct MemoryBackoffStore {
    entries: Mutex<HashMap<String, BackoffState>>,
}

impl MemoryBackoffStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> anyhow::Error {
    anyhow::anyhow!("Backoff store lock poisoned")
}

#[async_trait]
impl BackoffStore for MemoryBackoffStore {
    async fn get(&self, key: &str) -> Result<Option<BackoffState>> {
        Ok(self.entries.lock().map_err(poisoned)?.get(key).cloned())
    }

    async fn put(&self, key: &str, state: &BackoffState) -> Result<()> {
        self.entries
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), state.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().map_err(poisoned)?.remove(key);
        Ok(())
    }

    async fn sweep_idle(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|_, state| state.updated_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }
}

/// Backoff state machine over a `BackoffStore`
pub struct BackoffController {
    store: Arc<dyn BackoffStore>,
    fallback: MemoryBackoffStore,
    config: BackoffConfig,
    /// Per-key locks so concurrent ticks never lose a failure increment
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BackoffController {
    pub fn new(store: Arc<dyn BackoffStore>, config: BackoffConfig) -> Self {
        Self {
            store,
            fallback: MemoryBackoffStore::new(),
            config,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory(config: BackoffConfig) -> Self {
        Self::new(Arc::new(MemoryBackoffStore::new()), config)
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// `min(initial * multiplier^(failures-1), max)`; zero failures means no delay
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = consecutive_failures.saturating_sub(1).min(64) as i32;
        let raw = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = raw.min(self.config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub async fn should_execute(&self, key: &str) -> BackoffDecision {
        let Some(state) = self.load(key).await else {
            return BackoffDecision::allow();
        };

        if state.disabled {
            return BackoffDecision {
                allow: false,
                reason: Some(format!(
                    "Job {} is disabled after {} consecutive failures",
                    key, state.consecutive_failures
                )),
                next_retry_at: None,
            };
        }

        match state.next_retry_at {
            Some(next_retry_at) if Utc::now() < next_retry_at => BackoffDecision {
                allow: false,
                reason: Some(format!(
                    "Job {} is backing off after {} consecutive failures",
                    key, state.consecutive_failures
                )),
                next_retry_at: Some(next_retry_at),
            },
            _ => BackoffDecision::allow(),
        }
    }

    pub async fn record_success(&self, key: &str) -> Result<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        if self.config.reset_on_success {
            if let Some(state) = self.load(key).await {
                if state.consecutive_failures > 0 || state.disabled {
                    tracing::info!("✅ Backoff reset for {} after success", key);
                }
            }
            self.remove(key).await;
            return Ok(());
        }

        let now = Utc::now();
        if let Some(mut state) = self.load(key).await {
            state.last_success_at = Some(now);
            state.updated_at = now;
            self.save(key, &state).await;
        }
        Ok(())
    }

    pub async fn record_failure(&self, key: &str) -> Result<BackoffState> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut state = self.load(key).await.unwrap_or_else(|| BackoffState::fresh(now));

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let delay = self.delay_for(state.consecutive_failures);
        state.next_retry_at = Some(now + chrono::Duration::milliseconds(delay.as_millis() as i64));
        state.last_failure_at = Some(now);
        state.updated_at = now;

        if state.consecutive_failures >= self.config.max_failures && !state.disabled {
            state.disabled = true;
            tracing::error!(
                "🚫 Job {} disabled after {} consecutive failures",
                key,
                state.consecutive_failures
            );
        } else {
            tracing::warn!(
                "⏳ Job {} failed {} time(s) in a row, next attempt after {:?}",
                key,
                state.consecutive_failures,
                delay
            );
        }

        self.save(key, &state).await;
        Ok(state)
    }

    /// Manual reset, clears `disabled`
    pub async fn reset(&self, key: &str) -> Result<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.remove(key).await;
        tracing::info!("🔄 Backoff state for {} reset", key);
        Ok(())
    }

    pub async fn state(&self, key: &str) -> Option<BackoffState> {
        self.load(key).await
    }

    /// Housekeeping: drop entries idle longer than `IDLE_EXPIRY_DAYS`
    pub async fn sweep_idle(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(IDLE_EXPIRY_DAYS);
        let swept = self.store.sweep_idle(cutoff).await? + self.fallback.sweep_idle(cutoff).await?;
        if swept > 0 {
            tracing::info!("🧹 Swept {} idle backoff entries", swept);
        }
        self.prune_key_locks();
        Ok(swept)
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Drop locks nobody holds or waits on; they are recreated on demand
    fn prune_key_locks(&self) {
        let mut locks = self.key_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    async fn load(&self, key: &str) -> Option<BackoffState> {
        let loaded = match self.store.get(key).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("⚠️ Backoff store read failed for {}, using local state: {}", key, e);
                self.fallback.get(key).await.ok().flatten()
            }
        };

        let expiry = Utc::now() - chrono::Duration::days(IDLE_EXPIRY_DAYS);
        loaded.filter(|state| state.updated_at >= expiry)
    }

    async fn save(&self, key: &str, state: &BackoffState) {
        if let Err(e) = self.store.put(key, state).await {
            tracing::warn!("⚠️ Backoff store write failed for {}, keeping local state: {}", key, e);
            let _ = self.fallback.put(key, state).await;
        }
    }

    async fn remove(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            tracing::warn!("⚠️ Backoff store delete failed for {}: {}", key, e);
        }
        let _ = self.fallback.delete(key).await;
    }
}
