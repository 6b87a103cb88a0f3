/// Core workflow type definitions
///
/// Defines the immutable graph the engine consumes for one run: nodes with dotted
/// type strings, edges optionally tagged with a source handle, and workflow-level
/// settings for retries, error handling and loop guards. These types are
/// serialized/deserialized from JSON for persistence.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Type prefix shared by every trigger node
pub const TRIGGER_PREFIX: &str = "trigger.";

/// Type string of cron trigger nodes picked up by the scheduler
pub const SCHEDULE_TRIGGER: &str = "trigger.schedule";

/// A complete workflow definition containing nodes and their connections
///
/// Node ids referenced by edges are expected to exist in `nodes`; the engine
/// tolerates dangling edges by skipping them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Unique workflow identifier (e.g., "wf-nightly-sync")
    pub id: String,
    /// Human-readable workflow name
    #[serde(default)]
    pub name: String,
    /// Nodes in declaration order
    pub nodes: Vec<Node>,
    /// Edges in declaration order
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Workflow-wide execution settings
    #[serde(default)]
    pub settings: WorkflowSettings,
}

/// A single node in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "n1", "fetch-orders")
    pub id: String,
    /// Dotted type string, e.g. "logic.if", "trigger.schedule", "http.request"
    #[serde(rename = "type")]
    pub node_type: String,
    /// Opaque node configuration handed to the node body
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Pause before executing this node's body
    #[serde(default)]
    pub breakpoint: bool,
}

/// Connection between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Source node ID
    pub source: String,
    /// Target node ID
    pub target: String,
    /// Routing tag: "true"/"false", a switch case, "default", "body" or "error"
    #[serde(default)]
    pub source_handle: Option<String>,
}

/// Control-flow kinds the engine interprets itself
///
/// Everything else is an `Action` whose type string is passed through to the
/// node registry untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Trigger,
    If,
    Switch,
    Merge,
    LoopFor,
    LoopForEach,
    LoopWhile,
    HumanInput,
    Action,
}

impl ControlKind {
    pub fn from_type(node_type: &str) -> Self {
        match node_type {
            "logic.if" => ControlKind::If,
            "logic.switch" => ControlKind::Switch,
            "logic.merge" => ControlKind::Merge,
            "logic.loop.for" => ControlKind::LoopFor,
            "logic.loop.foreach" => ControlKind::LoopForEach,
            "logic.loop.while" => ControlKind::LoopWhile,
            "human.input" => ControlKind::HumanInput,
            t if t.starts_with(TRIGGER_PREFIX) => ControlKind::Trigger,
            _ => ControlKind::Action,
        }
    }

    pub fn is_loop(&self) -> bool {
        matches!(self, ControlKind::LoopFor | ControlKind::LoopForEach | ControlKind::LoopWhile)
    }
}

/// Workflow-level execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    /// Default retry policy for every node (nodes may override via `config.retry`)
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Hard cap on `logic.loop.while` iterations
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,
}

fn default_max_loop_iterations() -> usize {
    1000
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            retry: None,
            error_handling: ErrorHandling::default(),
            max_loop_iterations: default_max_loop_iterations(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandling {
    /// Keep dispatching normal successors after a node failure without an error edge
    #[serde(default)]
    pub continue_on_error: bool,
}

/// Retry policy for a node's body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Base delay in milliseconds
    #[serde(default = "default_retry_delay", rename = "delay")]
    pub delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retry_delay() -> u64 {
    1000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Fixed,
}

impl RetryConfig {
    /// Attempts the retry loop may make; always at least one
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Sleep before the attempt following `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let millis = match self.backoff {
            BackoffStrategy::Fixed => self.delay_ms,
            BackoffStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                self.delay_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(millis)
    }
}

impl Node {
    pub fn kind(&self) -> ControlKind {
        ControlKind::from_type(&self.node_type)
    }

    /// Node-level retry override, falling back to the workflow default
    pub fn retry_config(&self, settings: &WorkflowSettings) -> Option<RetryConfig> {
        self.config
            .get("retry")
            .and_then(|raw| serde_json::from_value::<RetryConfig>(raw.clone()).ok())
            .or_else(|| settings.retry.clone())
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

impl WorkflowDefinition {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Cron trigger nodes with their (schedule, timezone) parameters
    ///
    /// Nodes missing a `cron` / `schedule` string are skipped.
    pub fn schedule_triggers(&self) -> Vec<ScheduleTrigger> {
        self.nodes
            .iter()
            .filter(|node| node.node_type == SCHEDULE_TRIGGER)
            .filter_map(|node| {
                let cron = node.config_str("cron").or_else(|| node.config_str("schedule"))?;
                Some(ScheduleTrigger {
                    node_id: node.id.clone(),
                    cron: cron.trim().to_string(),
                    timezone: node.config_str("timezone").unwrap_or("UTC").to_string(),
                })
            })
            .collect()
    }
}

/// Cron parameters extracted from a `trigger.schedule` node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleTrigger {
    pub node_id: String,
    pub cron: String,
    pub timezone: String,
}

/// Context handed to a node body for one attempt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeContext {
    pub node_id: String,
    pub workflow_id: String,
    pub execution_id: String,
    /// Original execution input merged with all direct predecessors' outputs
    pub input: Value,
    pub config: Map<String, Value>,
}
