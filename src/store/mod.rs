/// Persistence layer
///
/// SQLite pool setup plus the execution/step store the engine records its
/// audit trail into.

pub mod database;
pub mod executions;

pub use executions::{
    Execution, ExecutionStatus, ExecutionStep, ExecutionStore, MemoryExecutionStore, SqliteExecutionStore,
    StepStatus,
};
