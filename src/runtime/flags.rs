/// Feature flag lookup
///
/// The scheduler only consults `scheduler_backoff`, but the lookup is keyed by
/// optional user and workspace ids so a hosted deployment can scope flags.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// Gates backoff consultation and reporting in the scheduler
pub const SCHEDULER_BACKOFF: &str = "scheduler_backoff";

#[async_trait]
pub trait FeatureFlags: Send + Sync {
    async fn is_enabled(&self, flag: &str, user_id: Option<&str>, workspace_id: Option<&str>) -> bool;
}

/// Flags fixed at startup, with optional per-workspace overrides
#[derive(Debug, Clone, Default)]
pub struct StaticFeatureFlags {
    enabled: HashSet<String>,
    /// Key: (workspace_id, flag)
    workspace_overrides: HashMap<(String, String), bool>,
}

impl StaticFeatureFlags {
    pub fn new<I, S>(enabled: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: enabled.into_iter().map(Into::into).collect(),
            workspace_overrides: HashMap::new(),
        }
    }

    pub fn with_workspace_override(mut self, workspace_id: &str, flag: &str, enabled: bool) -> Self {
        self.workspace_overrides
            .insert((workspace_id.to_string(), flag.to_string()), enabled);
        self
    }
}

#[async_trait]
impl FeatureFlags for StaticFeatureFlags {
    async fn is_enabled(&self, flag: &str, _user_id: Option<&str>, workspace_id: Option<&str>) -> bool {
        if let Some(workspace_id) = workspace_id {
            if let Some(enabled) = self
                .workspace_overrides
                .get(&(workspace_id.to_string(), flag.to_string()))
            {
                return *enabled;
            }
        }
        self.enabled.contains(flag)
    }
}
