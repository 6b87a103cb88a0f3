/// Hot-reload workflow registry using ArcSwap
///
/// Provides lock-free, atomic updates to the in-memory set of workflow
/// definitions. Each update swaps the entire map pointer, so executions that
/// already hold an `Arc<WorkflowDefinition>` keep running against the version
/// they started with.

use crate::workflow::{storage::WorkflowStorage, types::WorkflowDefinition};
use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

/// Source of workflow definitions consumed by the scheduler and the API
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// Load a definition by id, `None` if it does not exist
    async fn load_definition(&self, workflow_id: &str) -> Result<Option<Arc<WorkflowDefinition>>>;

    /// Whether the workflow exists and is switched on
    async fn is_active(&self, workflow_id: &str) -> Result<bool>;

    /// Every active definition, freshly loaded
    async fn list_active(&self) -> Result<Vec<Arc<WorkflowDefinition>>>;
}

#[derive(Debug, Clone)]
struct RegisteredWorkflow {
    definition: Arc<WorkflowDefinition>,
    active: bool,
}

/// Lock-free workflow registry for hot-reload capabilities
///
/// Without a storage backend the registry is purely in-memory, which is what
/// tests and embedders that push definitions directly use.
#[derive(Debug)]
pub struct WorkflowRegistry {
    /// Key: workflow_id
    workflows: ArcSwap<HashMap<String, RegisteredWorkflow>>,
    storage: Option<WorkflowStorage>,
}

impl WorkflowRegistry {
    /// Create new registry instance with storage backend
    pub fn new(storage: WorkflowStorage) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            storage: Some(storage),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            storage: None,
        }
    }

    /// Load every stored workflow and atomically replace the registry contents
    pub async fn init_from_storage(&self) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        let stored = storage.load_all_workflows().await?;
        let registered: HashMap<String, RegisteredWorkflow> = stored
            .into_iter()
            .map(|(id, (definition, active))| {
                (id, RegisteredWorkflow { definition: Arc::new(definition), active })
            })
            .collect();

        self.workflows.store(Arc::new(registered));
        tracing::debug!("📥 Workflow registry holds {} workflows", self.workflows.load().len());

        Ok(())
    }

    /// Hot-reload a single workflow from storage
    pub async fn reload_workflow(&self, workflow_id: &str) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        match storage.get_workflow(workflow_id).await? {
            Some((definition, active)) => self.upsert(definition, active),
            None => self.remove(workflow_id),
        }

        tracing::info!("🔥 Hot-reloaded workflow: {}", workflow_id);
        Ok(())
    }

    /// Insert or replace a definition in memory
    ///
    /// `rcu` reapplies the change if another writer swapped the map first.
    pub fn upsert(&self, definition: WorkflowDefinition, active: bool) {
        let registered = RegisteredWorkflow { definition: Arc::new(definition), active };
        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(registered.definition.id.clone(), registered.clone());
            next
        });
    }

    /// Remove a workflow from registry
    pub fn remove(&self, workflow_id: &str) {
        let previous = self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            next.remove(workflow_id);
            next
        });
        if previous.contains_key(workflow_id) {
            tracing::info!("🗑️ Removed workflow from registry: {}", workflow_id);
        }
    }

    /// Get a workflow by ID (lock-free read)
    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows
            .load()
            .get(workflow_id)
            .map(|registered| Arc::clone(&registered.definition))
    }

    /// List all workflow IDs regardless of state
    pub fn list_workflow_ids(&self) -> Vec<String> {
        self.workflows.load().keys().cloned().collect()
    }
}

#[async_trait]
impl DefinitionSource for WorkflowRegistry {
    async fn load_definition(&self, workflow_id: &str) -> Result<Option<Arc<WorkflowDefinition>>> {
        if self.get_workflow(workflow_id).is_none() {
            self.reload_workflow(workflow_id).await?;
        }
        Ok(self.get_workflow(workflow_id))
    }

    async fn is_active(&self, workflow_id: &str) -> Result<bool> {
        Ok(self
            .workflows
            .load()
            .get(workflow_id)
            .map(|registered| registered.active)
            .unwrap_or(false))
    }

    async fn list_active(&self) -> Result<Vec<Arc<WorkflowDefinition>>> {
        // Pick up rows written by other processes since the last pass
        self.init_from_storage().await?;

        Ok(self
            .workflows
            .load()
            .values()
            .filter(|registered| registered.active)
            .map(|registered| Arc::clone(&registered.definition))
            .collect())
    }
}
