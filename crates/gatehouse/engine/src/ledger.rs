//! Per-instance usage accounting.
//!
//! Updated only by [`crate::gateway::MeteredGateway`]; read when the engine
//! builds audit records.

use gatehouse_types::WorkflowInstanceId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub units: u64,
    pub actions: u64,
    /// Units by action name
    pub by_action: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct UsageLedger {
    entries: RwLock<HashMap<WorkflowInstanceId, UsageEntry>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, instance_id: &WorkflowInstanceId, action: &str, units: u64) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(instance_id.clone()).or_default();
        entry.units = entry.units.saturating_add(units);
        entry.actions += 1;
        *entry.by_action.entry(action.to_string()).or_default() += units;
    }

    pub fn total_for(&self, instance_id: &WorkflowInstanceId) -> u64 {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .map(|e| e.units)
            .unwrap_or(0)
    }

    pub fn entry(&self, instance_id: &WorkflowInstanceId) -> Option<UsageEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .cloned()
    }

    pub fn grand_total(&self) -> u64 {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.units)
            .sum()
    }
}
