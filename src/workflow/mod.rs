/// Workflow Management Layer
///
/// This module handles workflow definitions, persistence, and the hot-reload
/// registry the engine and scheduler read from:
/// - Type definitions (WorkflowDefinition, Node, Edge, settings)
/// - SQLite persistence with sqlx
/// - Lock-free hot-reload registry using ArcSwap

// Core workflow type definitions
pub mod types;

// SQLite persistence layer for workflow storage
pub mod storage;

// Hot-reload registry using ArcSwap, doubles as the definition source
pub mod registry;

// Re-export commonly used types
pub use registry::{DefinitionSource, WorkflowRegistry};
pub use types::{ControlKind, Edge, Node, NodeContext, RetryConfig, WorkflowDefinition, WorkflowSettings};
