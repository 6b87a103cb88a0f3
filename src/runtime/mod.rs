/// Runtime Execution Engine
///
/// This module provides the petgraph-based graph execution engine and the
/// services around it. It handles:
/// - Walking workflow graphs with branching, merges, loops and error edges
/// - Breakpoints, step mode and human input through the pause hub
/// - Bounded, durable execution through the worker pool
/// - Cron triggers gated by per-job backoff

// Engine-level error taxonomy
pub mod error;

// Pause/resume channel hub
pub mod pause;

// Node bodies and sandboxed Lua evaluation
pub mod executor;

// Core execution engine using petgraph
pub mod engine;

// Per-job exponential backoff for recurring triggers
pub mod backoff;

// Feature flag lookup
pub mod flags;

// Durable job queue and bounded worker pool
pub mod queue;

// Background cron scheduler service for trigger.schedule nodes
pub mod scheduler;

// Re-export main types
pub use backoff::{BackoffController, BackoffDecision, BackoffState};
pub use engine::{Engine, ExecutionResult, ReplayPlan, RunOptions};
pub use error::EngineError;
pub use executor::{BuiltinNodeRegistry, NodeRegistry, NodeResult};
pub use pause::{PauseHub, PauseSignal};
pub use queue::{JobQueue, WorkerPool};
pub use scheduler::{CronSchedulerService, TriggerRunner};
