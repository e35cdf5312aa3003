//! Definition registry: stores and retrieves workflow definitions
//!
//! Workflow definitions are immutable once registered. To modify one,
//! register a new version under the same id. Instances remember the version
//! they started on and finish on it, so every version is kept.

use crate::error::{EngineError, EngineResult};
use gatehouse_types::{DefinitionError, WorkflowDefinition, WorkflowDefinitionId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct DefinitionRegistry {
    /// Every registered version, keyed by id then version
    definitions: HashMap<WorkflowDefinitionId, BTreeMap<u32, Arc<WorkflowDefinition>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow definition
    ///
    /// Validates the definition before storing. A version may only be
    /// registered once.
    pub fn register(&mut self, definition: WorkflowDefinition) -> EngineResult<WorkflowDefinitionId> {
        definition.validate()?;

        let id = definition.id.clone();
        let version = definition.version;
        let versions = self.definitions.entry(id.clone()).or_default();
        if versions.contains_key(&version) {
            return Err(DefinitionError::DuplicateVersion { id, version }.into());
        }
        versions.insert(version, Arc::new(definition));

        tracing::info!(definition_id = %id, version, "Workflow definition registered");
        Ok(id)
    }

    /// Register a definition from its JSON form.
    pub fn register_json(&mut self, json: &str) -> EngineResult<WorkflowDefinitionId> {
        let definition: WorkflowDefinition = serde_json::from_str(json)?;
        self.register(definition)
    }

    /// Latest version of a definition
    pub fn get(&self, id: &WorkflowDefinitionId) -> EngineResult<Arc<WorkflowDefinition>> {
        self.definitions
            .get(id)
            .and_then(|versions| versions.values().next_back())
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(id.clone()))
    }

    pub fn get_version(
        &self,
        id: &WorkflowDefinitionId,
        version: u32,
    ) -> EngineResult<Arc<WorkflowDefinition>> {
        self.definitions
            .get(id)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(id.clone()))
    }

    /// Latest version of every registered definition
    pub fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut latest: Vec<_> = self
            .definitions
            .values()
            .filter_map(|versions| versions.values().next_back().cloned())
            .collect();
        latest.sort_by(|a, b| a.id.cmp(&b.id));
        latest
    }

    /// Number of distinct definition ids
    pub fn count(&self) -> usize {
        self.definitions.len()
    }

    pub fn contains(&self, id: &WorkflowDefinitionId) -> bool {
        self.definitions.contains_key(id)
    }
}
