//! Static role-based visibility of workflow definitions.
//!
//! Consulted by `start`, `cancel` and `visible_definitions`. Roles come from
//! the transport layer; this table only maps them to definitions.

use crate::registry::DefinitionRegistry;
use gatehouse_types::{Actor, WorkflowDefinition, WorkflowDefinitionId, WorkflowInstance};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrant {
    /// Definitions the role may start. Empty with `all_definitions` unset means none.
    #[serde(default)]
    pub definitions: BTreeSet<WorkflowDefinitionId>,
    #[serde(default)]
    pub all_definitions: bool,
    /// May cancel instances started by someone else
    #[serde(default)]
    pub cancel_any: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationTable {
    /// Grants everything to everyone; for development and tests
    #[serde(default)]
    open: bool,
    #[serde(default)]
    roles: BTreeMap<String, RoleGrant>,
}

impl AuthorizationTable {
    /// Deny-by-default table.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_all() -> Self {
        Self {
            open: true,
            roles: BTreeMap::new(),
        }
    }

    pub fn grant(mut self, role: impl Into<String>, definition: impl Into<WorkflowDefinitionId>) -> Self {
        self.roles
            .entry(role.into())
            .or_default()
            .definitions
            .insert(definition.into());
        self
    }

    pub fn grant_all(mut self, role: impl Into<String>) -> Self {
        self.roles.entry(role.into()).or_default().all_definitions = true;
        self
    }

    pub fn allow_cancel_any(mut self, role: impl Into<String>) -> Self {
        self.roles.entry(role.into()).or_default().cancel_any = true;
        self
    }

    pub fn can_start(&self, actor: &Actor, definition: &WorkflowDefinitionId) -> bool {
        self.open
            || self.grants(actor).any(|grant| {
                grant.all_definitions || grant.definitions.contains(definition)
            })
    }

    /// The initiator may always cancel their own instance.
    pub fn can_cancel(&self, actor: &Actor, instance: &WorkflowInstance) -> bool {
        self.open
            || actor.id == instance.actor
            || self.grants(actor).any(|grant| grant.cancel_any)
    }

    pub fn visible_definitions(
        &self,
        actor: &Actor,
        registry: &DefinitionRegistry,
    ) -> Vec<Arc<WorkflowDefinition>> {
        registry
            .list()
            .into_iter()
            .filter(|def| self.can_start(actor, &def.id))
            .collect()
    }

    fn grants<'a>(&'a self, actor: &'a Actor) -> impl Iterator<Item = &'a RoleGrant> + 'a {
        actor.roles.iter().filter_map(move |role| self.roles.get(role))
    }
}
