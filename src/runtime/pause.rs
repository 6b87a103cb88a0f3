/// Pause/Resume channel hub
///
/// Every paused node registers a oneshot channel keyed by execution id and node
/// id, then blocks on it with a bounded wait. External `resume`, `step`,
/// `cancel` and human-input calls complete those channels. The hub is owned by
/// the engine and passed around by handle; there is no ambient global.

use crate::runtime::error::EngineError;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Message delivered to a paused node
#[derive(Debug, Clone, PartialEq)]
pub enum PauseSignal {
    /// Continue; optional object merged into the paused node's input
    Resume { modifications: Option<Value> },
    /// Abort the waiting branch with a cancellation error
    Cancel,
    /// Response payload for a human-input node
    Input(Value),
}

impl PauseSignal {
    /// Decode a raw transport message: the literal tokens `resume` / `cancel`,
    /// or a JSON payload
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "resume" => Ok(PauseSignal::Resume { modifications: None }),
            "cancel" => Ok(PauseSignal::Cancel),
            other => {
                let payload: Value = serde_json::from_str(other)
                    .map_err(|e| anyhow::anyhow!("Unrecognised pause message '{}': {}", other, e))?;
                Ok(PauseSignal::Input(payload))
            }
        }
    }
}

/// Why a node is waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    Breakpoint,
    HumanInput,
}

#[derive(Debug)]
struct Waiter {
    seq: u64,
    node_id: String,
    kind: WaitKind,
    tx: oneshot::Sender<PauseSignal>,
}

/// Handle returned by `PauseHub::register`, consumed by `PauseHub::wait`
#[derive(Debug)]
pub struct PauseWait {
    execution_id: String,
    node_id: String,
    seq: u64,
    rx: oneshot::Receiver<PauseSignal>,
}

#[derive(Debug)]
pub struct PauseHub {
    /// Key: execution_id, waiters in registration order
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
    next_seq: AtomicU64,
    timeout: Duration,
}

impl PauseHub {
    pub fn new(timeout: Duration) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            timeout,
        }
    }

    /// Register a waiter before announcing the pause, so a resume that races
    /// the status update is never lost
    pub fn register(&self, execution_id: &str, node_id: &str, kind: WaitKind) -> PauseWait {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.entry(execution_id.to_string()).or_default().push(Waiter {
                seq,
                node_id: node_id.to_string(),
                kind,
                tx,
            });
        }

        PauseWait {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            seq,
            rx,
        }
    }

    /// Block until a signal arrives or the timeout elapses
    pub async fn wait(&self, wait: PauseWait) -> Result<PauseSignal, EngineError> {
        let PauseWait { execution_id, node_id, seq, rx } = wait;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(signal)) => Ok(signal),
            // Sender dropped without a message: the hub let go of us
            Ok(Err(_)) => Err(EngineError::Cancelled { execution_id }),
            Err(_) => {
                self.take(&execution_id, |w| w.seq == seq);
                tracing::warn!("⏰ Pause at node '{}' of execution {} timed out", node_id, execution_id);
                Err(EngineError::PauseTimeout {
                    execution_id,
                    node_id,
                    waited: self.timeout,
                })
            }
        }
    }

    /// Release every breakpoint waiter of the execution
    pub fn resume(&self, execution_id: &str, modifications: Option<Value>) -> usize {
        let released = self.take(execution_id, |w| w.kind == WaitKind::Breakpoint);
        let count = released.len();
        for waiter in released {
            let _ = waiter.tx.send(PauseSignal::Resume { modifications: modifications.clone() });
        }
        count
    }

    /// Release only the oldest breakpoint waiter
    pub fn step(&self, execution_id: &str) -> bool {
        let oldest = {
            let Ok(mut waiters) = self.waiters.lock() else {
                return false;
            };
            let Some(list) = waiters.get_mut(execution_id) else {
                return false;
            };
            let position = list.iter().position(|w| w.kind == WaitKind::Breakpoint);
            let waiter = position.map(|idx| list.remove(idx));
            if list.is_empty() {
                waiters.remove(execution_id);
            }
            waiter
        };

        match oldest {
            Some(waiter) => waiter.tx.send(PauseSignal::Resume { modifications: None }).is_ok(),
            None => false,
        }
    }

    /// Release every waiter of the execution with a cancel signal
    pub fn cancel(&self, execution_id: &str) -> usize {
        let released = self.take(execution_id, |_| true);
        let count = released.len();
        for waiter in released {
            let _ = waiter.tx.send(PauseSignal::Cancel);
        }
        count
    }

    /// Deliver a human-input response to a specific node
    pub fn submit_input(&self, execution_id: &str, node_id: &str, payload: Value) -> bool {
        let mut released = self.take(execution_id, |w| w.node_id == node_id);
        match released.pop() {
            Some(waiter) => waiter.tx.send(PauseSignal::Input(payload)).is_ok(),
            None => false,
        }
    }

    /// Node ids currently blocked for the execution, oldest first
    pub fn waiting_nodes(&self, execution_id: &str) -> Vec<String> {
        self.waiters
            .lock()
            .map(|waiters| {
                waiters
                    .get(execution_id)
                    .map(|list| list.iter().map(|w| w.node_id.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn take(&self, execution_id: &str, mut predicate: impl FnMut(&Waiter) -> bool) -> Vec<Waiter> {
        let Ok(mut waiters) = self.waiters.lock() else {
            return Vec::new();
        };
        let Some(list) = waiters.get_mut(execution_id) else {
            return Vec::new();
        };

        let mut taken = Vec::new();
        let mut kept = Vec::new();
        for waiter in list.drain(..) {
            if predicate(&waiter) {
                taken.push(waiter);
            } else {
                kept.push(waiter);
            }
        }

        if kept.is_empty() {
            waiters.remove(execution_id);
        } else {
            *list = kept;
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_parse_tokens() {
        assert_eq!(PauseSignal::parse("resume").unwrap(), PauseSignal::Resume { modifications: None });
        assert_eq!(PauseSignal::parse(" cancel ").unwrap(), PauseSignal::Cancel);
        assert_eq!(PauseSignal::parse(r#"{"approved":true}"#).unwrap(), PauseSignal::Input(json!({ "approved": true })));
        assert!(PauseSignal::parse("resume please").is_err());
    }

    #[tokio::test]
    async fn test_resume_releases_waiter() {
        let hub = Arc::new(PauseHub::new(Duration::from_secs(5)));
        let wait = hub.register("e1", "n1", WaitKind::Breakpoint);
        assert_eq!(hub.waiting_nodes("e1"), vec!["n1".to_string()]);

        let waiter = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.wait(wait).await })
        };

        assert_eq!(hub.resume("e1", Some(json!({ "x": 2 }))), 1);
        let signal = waiter.await.unwrap().unwrap();
        assert_eq!(signal, PauseSignal::Resume { modifications: Some(json!({ "x": 2 })) });
        assert!(hub.waiting_nodes("e1").is_empty());
    }

    #[tokio::test]
    async fn test_step_releases_only_oldest() {
        let hub = PauseHub::new(Duration::from_secs(5));
        let _first = hub.register("e1", "a", WaitKind::Breakpoint);
        let _second = hub.register("e1", "b", WaitKind::Breakpoint);

        assert!(hub.step("e1"));
        assert_eq!(hub.waiting_nodes("e1"), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_timeout_removes_waiter() {
        let hub = PauseHub::new(Duration::from_millis(20));
        let wait = hub.register("e1", "slow", WaitKind::Breakpoint);

        let result = hub.wait(wait).await;
        assert!(matches!(result, Err(EngineError::PauseTimeout { .. })));
        assert!(hub.waiting_nodes("e1").is_empty());
    }

    #[tokio::test]
    async fn test_input_reaches_only_named_node() {
        let hub = PauseHub::new(Duration::from_secs(5));
        let wait = hub.register("e1", "approve", WaitKind::HumanInput);

        // resume does not touch human-input waiters
        assert_eq!(hub.resume("e1", None), 0);
        assert!(!hub.submit_input("e1", "other", json!({ "ok": 0 })));
        assert!(hub.submit_input("e1", "approve", json!({ "ok": 1 })));
        assert_eq!(hub.wait(wait).await.unwrap(), PauseSignal::Input(json!({ "ok": 1 })));
    }

    #[tokio::test]
    async fn test_cancel_reaches_every_waiter() {
        let hub = PauseHub::new(Duration::from_secs(5));
        let a = hub.register("e1", "a", WaitKind::Breakpoint);
        let b = hub.register("e1", "b", WaitKind::HumanInput);

        assert_eq!(hub.cancel("e1"), 2);
        assert_eq!(hub.wait(a).await.unwrap(), PauseSignal::Cancel);
        assert_eq!(hub.wait(b).await.unwrap(), PauseSignal::Cancel);
    }
}
