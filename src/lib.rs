/// flowrun: workflow graph execution engine
///
/// This library provides the engine that walks workflow graphs (branching,
/// merges, loops, retries, error edges), step debugging through a pause hub,
/// and a cron scheduler gated by per-job backoff.

// Core configuration and setup
pub mod config;

// Workflow management layer - definitions, storage and hot-reload registry
pub mod workflow;

// Execution audit trail persistence
pub mod store;

// Runtime execution engine - graph walking, pausing, queueing, scheduling
pub mod runtime;

// HTTP API layer - control surface over the engine
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use runtime::{Engine, ExecutionResult, NodeRegistry, NodeResult};
pub use server::start_server;
pub use workflow::{Edge, Node, WorkflowDefinition};
