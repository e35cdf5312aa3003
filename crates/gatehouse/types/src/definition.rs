//! Workflow definitions: the ordered step programs the engine runs.
//!
//! A definition is a straight line of steps. Each step is one of:
//! - `Automatic`: a named handler runs without human involvement
//! - `Confirmation`: a gate that suspends the instance until a human
//!   presents a confirmation token for one of the offered options
//! - `TerminalAction`: the single state-changing call to the governance
//!   backend, always the last step
//!
//! Definitions are immutable once validated. To change one, register a new
//! version.

use crate::{RiskBucket, WorkflowDefinitionId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("definition {0} has no steps")]
    Empty(WorkflowDefinitionId),

    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("the last step must be a terminal action")]
    MissingTerminalAction,

    #[error("terminal action {0} must be the last step")]
    TerminalActionNotLast(String),

    #[error("step {step}: {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("{id} version {version} is already registered")]
    DuplicateVersion {
        id: WorkflowDefinitionId,
        version: u32,
    },
}

// ── Workflow Definition ──────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowDefinitionId,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub description: String,
    /// Parameter holding the governance items of a review definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_param: Option<String>,
    pub steps: Vec<StepDefinition>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<WorkflowDefinitionId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: 1,
            description: String::new(),
            items_param: None,
            steps: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_items_param(mut self, param: impl Into<String>) -> Self {
        self.items_param = Some(param.into());
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    pub fn is_review(&self) -> bool {
        self.items_param.is_some()
    }

    /// Check the definition is well-formed.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::Empty(self.id.clone()));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(DefinitionError::DuplicateStep(step.name.clone()));
            }
        }

        let last = self.steps.len() - 1;
        for (index, step) in self.steps.iter().enumerate() {
            match &step.kind {
                StepKind::TerminalAction { .. } if index != last => {
                    return Err(DefinitionError::TerminalActionNotLast(step.name.clone()));
                }
                StepKind::TerminalAction {
                    params,
                    require_decisions,
                    ..
                } => {
                    self.check_source(index, step, params)?;
                    if *require_decisions && !self.has_item_gate_before(index) {
                        return Err(invalid(
                            step,
                            "require_decisions needs an earlier per-item gate",
                        ));
                    }
                }
                StepKind::Confirmation(gate) => self.check_gate(index, step, gate)?,
                StepKind::Automatic { handler } if handler.is_empty() => {
                    return Err(invalid(step, "automatic step names no handler"));
                }
                StepKind::Automatic { .. } => {}
            }
        }

        if !matches!(self.steps[last].kind, StepKind::TerminalAction { .. }) {
            return Err(DefinitionError::MissingTerminalAction);
        }
        Ok(())
    }

    fn check_gate(
        &self,
        index: usize,
        step: &StepDefinition,
        gate: &GateSpec,
    ) -> Result<(), DefinitionError> {
        self.check_source(index, step, &gate.params)?;
        check_options(step, &gate.options)?;

        if gate.skip_when_empty && !matches!(gate.params, ParamSource::Bucket { .. }) {
            return Err(invalid(step, "skip_when_empty requires a bucket parameter source"));
        }

        let bucket_source = matches!(gate.params, ParamSource::Bucket { .. });
        match &gate.scope {
            GateScope::Single => {
                for option in &gate.options {
                    match option.effect {
                        OptionEffect::DecideBucket { .. } | OptionEffect::Defer if !bucket_source => {
                            return Err(invalid(
                                step,
                                format!("option {} acts on a bucket the gate does not bind", option.id),
                            ));
                        }
                        OptionEffect::DecideItem { .. } | OptionEffect::SignOff => {
                            return Err(invalid(
                                step,
                                format!("option {} is only valid on a per-item gate", option.id),
                            ));
                        }
                        _ => {}
                    }
                }
            }
            GateScope::PerPendingItem {
                item_action,
                item_options,
                ..
            } => {
                if !self.is_review() {
                    return Err(invalid(step, "per-item gate on a definition without items"));
                }
                if item_action.is_empty() {
                    return Err(invalid(step, "per-item gate names no item action"));
                }
                check_options(step, item_options)?;
                if item_options
                    .iter()
                    .any(|o| !matches!(o.effect, OptionEffect::DecideItem { .. }))
                {
                    return Err(invalid(step, "item options may only decide the item"));
                }
                if !gate
                    .options
                    .iter()
                    .any(|o| o.effect == OptionEffect::SignOff)
                {
                    return Err(invalid(step, "per-item gate offers no sign-off option"));
                }
                if gate
                    .options
                    .iter()
                    .any(|o| !matches!(o.effect, OptionEffect::SignOff | OptionEffect::Cancel))
                {
                    return Err(invalid(step, "sign-off options may only sign off or cancel"));
                }
            }
        }
        Ok(())
    }

    fn check_source(
        &self,
        index: usize,
        step: &StepDefinition,
        source: &ParamSource,
    ) -> Result<(), DefinitionError> {
        match source {
            ParamSource::Parameters => Ok(()),
            ParamSource::Output { step: from } => match self.step_index(from) {
                Some(i) if i < index => Ok(()),
                _ => Err(invalid(step, format!("reads output of unknown or later step {from}"))),
            },
            ParamSource::Bucket { .. } | ParamSource::Batch | ParamSource::Decisions => {
                if self.is_review() {
                    Ok(())
                } else {
                    Err(invalid(step, "item parameter source on a definition without items"))
                }
            }
        }
    }

    fn has_item_gate_before(&self, index: usize) -> bool {
        self.steps[..index].iter().any(|s| {
            matches!(
                &s.kind,
                StepKind::Confirmation(GateSpec {
                    scope: GateScope::PerPendingItem { .. },
                    ..
                })
            )
        })
    }
}

fn check_options(step: &StepDefinition, options: &[PromptOption]) -> Result<(), DefinitionError> {
    if options.is_empty() {
        return Err(invalid(step, "gate offers no options"));
    }
    let mut seen = HashSet::new();
    for option in options {
        if !seen.insert(option.id.as_str()) {
            return Err(invalid(step, format!("duplicate option {}", option.id)));
        }
    }
    Ok(())
}

fn invalid(step: &StepDefinition, reason: impl Into<String>) -> DefinitionError {
    DefinitionError::InvalidStep {
        step: step.name.clone(),
        reason: reason.into(),
    }
}

// ── Steps ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub kind: StepKind,
    /// Gateway action that undoes this step when the instance fails later
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<String>,
}

impl StepDefinition {
    pub fn automatic(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Automatic {
                handler: handler.into(),
            },
            compensation: None,
        }
    }

    pub fn gate(name: impl Into<String>, gate: GateSpec) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Confirmation(gate),
            compensation: None,
        }
    }

    pub fn terminal(name: impl Into<String>, action: impl Into<String>, params: ParamSource) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::TerminalAction {
                action: action.into(),
                params,
                require_decisions: false,
            },
            compensation: None,
        }
    }

    pub fn with_compensation(mut self, action: impl Into<String>) -> Self {
        self.compensation = Some(action.into());
        self
    }

    /// Require every governance item to be decided before the action runs.
    pub fn requiring_decisions(mut self) -> Self {
        if let StepKind::TerminalAction {
            require_decisions, ..
        } = &mut self.kind
        {
            *require_decisions = true;
        }
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Automatic {
        handler: String,
    },
    Confirmation(GateSpec),
    TerminalAction {
        action: String,
        #[serde(default)]
        params: ParamSource,
        #[serde(default)]
        require_decisions: bool,
    },
}

/// A confirmation gate.
///
/// `action`, `prompt` and `options` describe the gate's own prompt. For a
/// per-item gate that prompt is the sign-off, and one additional prompt is
/// issued for every undecided item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    pub action: String,
    /// Prompt template; `{key}` is replaced by the top-level parameter `key`
    pub prompt: String,
    pub options: Vec<PromptOption>,
    #[serde(default)]
    pub params: ParamSource,
    #[serde(default)]
    pub scope: GateScope,
    /// Pass straight through when the bound bucket holds no pending items
    #[serde(default)]
    pub skip_when_empty: bool,
}

impl GateSpec {
    pub fn new(action: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            prompt: prompt.into(),
            options: Vec::new(),
            params: ParamSource::Parameters,
            scope: GateScope::Single,
            skip_when_empty: false,
        }
    }

    pub fn with_option(mut self, option: PromptOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn with_params(mut self, params: ParamSource) -> Self {
        self.params = params;
        self
    }

    pub fn with_scope(mut self, scope: GateScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn skip_when_empty(mut self) -> Self {
        self.skip_when_empty = true;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum GateScope {
    #[default]
    Single,
    PerPendingItem {
        item_action: String,
        item_prompt: String,
        item_options: Vec<PromptOption>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptOption {
    pub id: String,
    pub label: String,
    pub effect: OptionEffect,
}

impl PromptOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>, effect: OptionEffect) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            effect,
        }
    }
}

/// What choosing an option does to the instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum OptionEffect {
    /// Satisfy the gate and continue
    Proceed,
    /// Cancel the instance
    Cancel,
    /// Apply a decision to every pending item the gate bound, then continue
    DecideBucket { decision: crate::Decision },
    /// Leave the bound items pending for individual review, then continue
    Defer,
    /// Decide the single item an item prompt was issued for
    DecideItem { decision: crate::Decision },
    /// Finish a per-item gate; refused while any item is pending
    SignOff,
}

/// Where a gate or terminal action takes its parameters from.
///
/// The resolved parameters are what the confirmation token's digest covers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ParamSource {
    /// The instance's start parameters
    #[default]
    Parameters,
    /// The stored output of an earlier step
    Output { step: String },
    /// Pending items in one risk bucket: `{bucket, count, items}`
    Bucket { bucket: RiskBucket },
    /// Start parameters with the item list replaced by `item_count`
    Batch,
    /// `Batch` plus every item decision and its attribution
    Decisions,
}
