//! The workflow engine.
//!
//! Every operation follows the same shape: load the latest checkpoint,
//! compute the next state, save it with the loaded version. The checkpoint
//! store's compare-and-swap is the only lock; suspended instances hold no
//! threads, timers or locks.

use crate::authz::AuthorizationTable;
use crate::builtin;
use crate::config::{EngineConfig, StorageHandles};
use crate::error::{ConfirmationRejection, EngineError, EngineResult};
use crate::gateway::{ActionGateway, ActionResult, GatewayError, MeteredGateway};
use crate::handlers::{HandlerRegistry, StepError, StepHandler};
use crate::ledger::{UsageEntry, UsageLedger};
use crate::prompt::{render_template, Suspension};
use crate::registry::DefinitionRegistry;
use crate::retry::RetryPolicy;
use gatehouse_risk::{RiskClassifier, RiskConfig};
use gatehouse_storage::{
    AuditAppend, AuditOutcome, AuditRecord, AuditSink, Checkpoint, CheckpointStore,
    GatehouseStorage, StorageError,
};
use gatehouse_token::{TokenBinding, TokenManager, TokenSecret, DEFAULT_MAX_CLOCK_SKEW, DEFAULT_TTL};
use gatehouse_types::{
    ActionAttempt, Actor, ActorId, Clock, ConfirmationRecord, DecisionAttribution, DefinitionError,
    GateScope, GateSpec, GovernanceItem, IdempotencyKey, ItemId, OptionEffect, ParamSource,
    PendingPrompt, PromptOption, StepDefinition, StepKind, SystemClock, WorkflowDefinition,
    WorkflowDefinitionId, WorkflowInstance, WorkflowInstanceId, WorkflowStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

// ── Requests and results ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub definition_id: WorkflowDefinitionId,
    pub parameters: Value,
    pub actor: Actor,
    /// Conversation thread; becomes the prefix of the instance id
    pub thread_id: String,
}

impl StartRequest {
    pub fn new(
        definition_id: impl Into<WorkflowDefinitionId>,
        parameters: Value,
        actor: Actor,
        thread_id: impl Into<String>,
    ) -> Self {
        Self {
            definition_id: definition_id.into(),
            parameters,
            actor,
            thread_id: thread_id.into(),
        }
    }
}

/// Where an instance stands after the engine stopped driving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Advance {
    Suspended(Suspension),
    Completed {
        instance_id: WorkflowInstanceId,
        external_id: Option<String>,
    },
    Cancelled {
        instance_id: WorkflowInstanceId,
    },
    Failed {
        instance_id: WorkflowInstanceId,
        reason: String,
    },
    /// Another caller is driving the instance, or its terminal action is
    /// awaiting recovery
    InProgress {
        instance_id: WorkflowInstanceId,
        status: WorkflowStatus,
    },
}

impl Advance {
    pub fn of(instance: &WorkflowInstance) -> Self {
        let instance_id = instance.id.clone();
        match instance.status {
            WorkflowStatus::Suspended => Advance::Suspended(Suspension::of(instance)),
            WorkflowStatus::Completed => Advance::Completed {
                instance_id,
                external_id: instance.external_id.clone(),
            },
            WorkflowStatus::Cancelled => Advance::Cancelled { instance_id },
            WorkflowStatus::Failed => Advance::Failed {
                instance_id,
                reason: instance.failure.clone().unwrap_or_default(),
            },
            status => Advance::InProgress {
                instance_id,
                status,
            },
        }
    }

    pub fn instance_id(&self) -> &WorkflowInstanceId {
        match self {
            Advance::Suspended(s) => &s.instance_id,
            Advance::Completed { instance_id, .. }
            | Advance::Cancelled { instance_id }
            | Advance::Failed { instance_id, .. }
            | Advance::InProgress { instance_id, .. } => instance_id,
        }
    }

    pub fn status(&self) -> WorkflowStatus {
        match self {
            Advance::Suspended(_) => WorkflowStatus::Suspended,
            Advance::Completed { .. } => WorkflowStatus::Completed,
            Advance::Cancelled { .. } => WorkflowStatus::Cancelled,
            Advance::Failed { .. } => WorkflowStatus::Failed,
            Advance::InProgress { status, .. } => *status,
        }
    }

    pub fn suspension(&self) -> Option<&Suspension> {
        match self {
            Advance::Suspended(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub instance_id: WorkflowInstanceId,
    pub advance: Advance,
}

/// A loaded instance and the checkpoint version it came from.
#[derive(Debug, Clone)]
struct Tracked {
    instance: WorkflowInstance,
    version: u64,
}

// ── Builder ──────────────────────────────────────────────────────────

pub struct EngineBuilder {
    checkpoints: Arc<dyn CheckpointStore>,
    audit: Arc<dyn AuditSink>,
    gateway: Arc<dyn ActionGateway>,
    definitions: Vec<WorkflowDefinition>,
    handlers: Vec<(String, Arc<dyn StepHandler>)>,
    builtins: bool,
    authz: AuthorizationTable,
    clock: Arc<dyn Clock>,
    secret: Option<TokenSecret>,
    ttl: Duration,
    max_clock_skew: Duration,
    retry: RetryPolicy,
    max_conflict_retries: u32,
    risk: RiskConfig,
}

impl EngineBuilder {
    pub fn new(
        checkpoints: Arc<dyn CheckpointStore>,
        audit: Arc<dyn AuditSink>,
        gateway: Arc<dyn ActionGateway>,
    ) -> Self {
        Self {
            checkpoints,
            audit,
            gateway,
            definitions: Vec::new(),
            handlers: Vec::new(),
            builtins: false,
            authz: AuthorizationTable::allow_all(),
            clock: Arc::new(SystemClock),
            secret: None,
            ttl: DEFAULT_TTL,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            retry: RetryPolicy::default(),
            max_conflict_retries: 5,
            risk: RiskConfig::default(),
        }
    }

    /// One backend serving both checkpoints and audit.
    pub fn with_storage<S: GatehouseStorage + 'static>(
        storage: Arc<S>,
        gateway: Arc<dyn ActionGateway>,
    ) -> Self {
        Self::new(storage.clone(), storage, gateway)
    }

    pub fn with_handles(handles: StorageHandles, gateway: Arc<dyn ActionGateway>) -> Self {
        Self::new(handles.checkpoints, handles.audit, gateway)
    }

    /// Apply token, retry, concurrency and risk settings.
    pub fn config(mut self, config: &EngineConfig) -> EngineResult<Self> {
        self.ttl = config.token.ttl();
        self.max_clock_skew = config.token.max_clock_skew();
        if config.token.secret_hex.is_some() {
            self.secret = Some(config.token.secret()?);
        }
        self.retry = config.retry.clone();
        self.max_conflict_retries = config.concurrency.max_conflict_retries;
        self.risk = config.risk.clone();
        Ok(self)
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn secret(mut self, secret: TokenSecret) -> Self {
        self.secret = Some(secret);
        self
    }

    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reloads allowed per operation after a lost checkpoint race or while
    /// another confirmation is settling.
    pub fn max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn risk(mut self, risk: RiskConfig) -> Self {
        self.risk = risk;
        self
    }

    pub fn authorization(mut self, authz: AuthorizationTable) -> Self {
        self.authz = authz;
        self
    }

    pub fn register(mut self, definition: WorkflowDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn handler(mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.push((name.into(), handler));
        self
    }

    /// Register `access.request` and `certification.review`.
    pub fn with_builtin_definitions(mut self) -> Self {
        self.builtins = true;
        self
    }

    pub fn build(self) -> EngineResult<WorkflowEngine> {
        let classifier =
            RiskClassifier::new(self.risk).map_err(|e| EngineError::Config(e.to_string()))?;
        let mut handlers = HandlerRegistry::with_builtins(classifier);
        for (name, handler) in self.handlers {
            handlers.register(name, handler);
        }

        let mut definitions = DefinitionRegistry::new();
        let builtins = if self.builtins { builtin::all() } else { Vec::new() };
        for definition in builtins.into_iter().chain(self.definitions) {
            check_handlers(&definition, &handlers)?;
            definitions.register(definition)?;
        }

        let secret = match self.secret {
            Some(secret) => secret,
            None => {
                tracing::warn!("No token secret supplied; generated an ephemeral one");
                TokenSecret::generate()
            }
        };
        let tokens = TokenManager::new(secret, self.clock.clone())
            .with_ttl(self.ttl)
            .with_max_clock_skew(self.max_clock_skew);

        let ledger = Arc::new(UsageLedger::new());
        let gateway = MeteredGateway::new(self.gateway, ledger.clone());

        tracing::info!(
            definitions = definitions.count(),
            ttl_secs = self.ttl.as_secs(),
            max_attempts = self.retry.max_attempts,
            "Workflow engine ready"
        );

        Ok(WorkflowEngine {
            definitions,
            handlers,
            authz: self.authz,
            checkpoints: self.checkpoints,
            audit: self.audit,
            gateway,
            ledger,
            tokens,
            retry: self.retry,
            max_conflict_retries: self.max_conflict_retries,
            clock: self.clock,
        })
    }
}

fn check_handlers(
    definition: &WorkflowDefinition,
    handlers: &HandlerRegistry,
) -> Result<(), DefinitionError> {
    for step in &definition.steps {
        if let StepKind::Automatic { handler } = &step.kind {
            if !handlers.contains(handler) {
                return Err(DefinitionError::InvalidStep {
                    step: step.name.clone(),
                    reason: format!("no handler registered as {handler}"),
                });
            }
        }
    }
    Ok(())
}

// ── Engine ───────────────────────────────────────────────────────────

/// Durable approval workflow engine. `Send + Sync`; share it via `Arc`.
pub struct WorkflowEngine {
    definitions: DefinitionRegistry,
    handlers: HandlerRegistry,
    authz: AuthorizationTable,
    checkpoints: Arc<dyn CheckpointStore>,
    audit: Arc<dyn AuditSink>,
    gateway: MeteredGateway,
    ledger: Arc<UsageLedger>,
    tokens: TokenManager,
    retry: RetryPolicy,
    max_conflict_retries: u32,
    clock: Arc<dyn Clock>,
}

impl WorkflowEngine {
    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    /// Definitions `actor` may start.
    pub fn visible_definitions(&self, actor: &Actor) -> Vec<Arc<WorkflowDefinition>> {
        self.authz.visible_definitions(actor, &self.definitions)
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    pub fn usage(&self, instance_id: &WorkflowInstanceId) -> Option<UsageEntry> {
        self.ledger.entry(instance_id)
    }

    // ── Lifecycle operations ─────────────────────────────────────────

    /// Create an instance, save it as version 1 and drive it to its first
    /// stop.
    pub async fn start(&self, request: StartRequest) -> EngineResult<Started> {
        let definition = self.definitions.get(&request.definition_id)?;
        if !self.authz.can_start(&request.actor, &definition.id) {
            return Err(EngineError::Unauthorized {
                actor: request.actor.id,
                operation: format!("start {}", definition.id),
            });
        }

        let items = match &definition.items_param {
            Some(param) => decode_items(&request.parameters, param)?,
            None => Vec::new(),
        };

        let instance_id = WorkflowInstanceId::for_thread(&request.thread_id);
        let instance = WorkflowInstance::new(
            instance_id.clone(),
            &definition,
            request.actor.id.clone(),
            request.parameters,
            self.clock.now(),
        )
        .with_items(items);

        let mut tracked = Tracked {
            instance,
            version: 0,
        };
        self.persist(&mut tracked).await?;
        tracing::info!(
            instance_id = %instance_id,
            definition_id = %definition.id,
            definition_version = definition.version,
            actor = %request.actor.id,
            items = tracked.instance.items.len(),
            "Workflow started"
        );

        let advance = self.drive(tracked).await?;
        Ok(Started {
            instance_id,
            advance,
        })
    }

    /// Drive an instance from its current step. A no-op on suspended and
    /// terminal instances.
    pub async fn advance(&self, instance_id: &WorkflowInstanceId) -> EngineResult<Advance> {
        let tracked = self.load(instance_id).await?;
        self.drive(tracked).await
    }

    /// Apply a human confirmation.
    ///
    /// The token is validated against the prompt it was issued for and the
    /// presenting actor. On success its nonce is consumed in the same
    /// checkpoint write that moves the instance to `RESUMING`; on any
    /// rejection nothing is written.
    pub async fn resume(
        &self,
        instance_id: &WorkflowInstanceId,
        token: &str,
        actor_id: &ActorId,
        option: &str,
    ) -> EngineResult<Advance> {
        let claims = self.tokens.decode(token)?;

        for attempt in 0..=self.max_conflict_retries {
            let mut tracked = self.load(instance_id).await?;
            let instance = &tracked.instance;

            let used_here = instance
                .confirmations
                .iter()
                .any(|c| c.token_nonce == claims.nonce);
            if instance.status == WorkflowStatus::Cancelled && !used_here {
                return Err(ConfirmationRejection::InstanceCancelled.into());
            }

            let prompt = instance.prompt(&claims.nonce).cloned();
            let expected = match &prompt {
                Some(p) => TokenBinding::new(
                    instance_id.clone(),
                    actor_id.clone(),
                    p.action.clone(),
                    &p.params,
                ),
                // Not outstanding: bind to the token's own claims so the
                // instance and consumed checks decide the rejection.
                None => TokenBinding {
                    instance_id: instance_id.clone(),
                    actor_id: actor_id.clone(),
                    action: claims.action.clone(),
                    parameter_digest: claims.parameter_digest.clone(),
                },
            };
            self.tokens
                .validate(token, &expected, &instance.consumed_nonces)?;

            let Some(prompt) = prompt else {
                return Err(ConfirmationRejection::NotPending.into());
            };
            // Another confirmation on this instance is mid-flight; its prompt
            // survives, so wait for the gate to settle.
            let settling = instance.status == WorkflowStatus::Resuming
                || (instance.status == WorkflowStatus::Running && instance.action_attempt.is_none());
            if settling {
                tracing::debug!(
                    instance_id = %instance_id,
                    attempt,
                    status = %instance.status,
                    "Instance busy with another confirmation; retrying"
                );
                tokio::time::sleep(self.retry.delay_for(attempt + 1)).await;
                continue;
            }
            if instance.status != WorkflowStatus::Suspended {
                return Err(EngineError::InvalidState {
                    status: instance.status,
                    expected: WorkflowStatus::Suspended,
                });
            }
            let Some(choice) = prompt.options.iter().find(|o| o.id == option).cloned() else {
                return Err(ConfirmationRejection::UnknownOption(option.to_string()).into());
            };
            if choice.effect == OptionEffect::SignOff {
                let pending = instance.pending_items();
                if !pending.is_empty() {
                    return Err(EngineError::IncompleteDecisions { pending });
                }
            }

            let definition = self.definition_of(instance)?;
            let step = current_step(&definition, instance)?.name.clone();

            self.apply_confirmation(&mut tracked.instance, &step, &prompt, &choice, actor_id);

            let now = self.clock.now();
            let to = if choice.effect == OptionEffect::Cancel {
                WorkflowStatus::Cancelled
            } else {
                WorkflowStatus::Resuming
            };
            tracked
                .instance
                .transition(to, now, format!("{} chose {}", actor_id, choice.id))?;

            match self.persist(&mut tracked).await {
                Ok(()) => {}
                Err(EngineError::VersionConflict { .. }) => {
                    tracing::debug!(
                        instance_id = %instance_id,
                        attempt,
                        "Resume lost a checkpoint race; reloading"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }

            tracing::info!(
                instance_id = %instance_id,
                step = %step,
                option = %choice.id,
                actor = %actor_id,
                version = tracked.version,
                "Confirmation accepted"
            );

            if to == WorkflowStatus::Cancelled {
                return Ok(Advance::of(&tracked.instance));
            }
            return self.drive(tracked).await;
        }

        Err(EngineError::EngineBusy(instance_id.clone()))
    }

    /// Cancel a non-terminal instance and retire its outstanding tokens.
    ///
    /// Idempotent on terminal instances. Refused with `ActionInFlight` while
    /// the terminal action is between its marker and its outcome.
    pub async fn cancel(
        &self,
        instance_id: &WorkflowInstanceId,
        actor: &Actor,
    ) -> EngineResult<WorkflowStatus> {
        for attempt in 0..=self.max_conflict_retries {
            let mut tracked = self.load(instance_id).await?;
            if !self.authz.can_cancel(actor, &tracked.instance) {
                return Err(EngineError::Unauthorized {
                    actor: actor.id.clone(),
                    operation: format!("cancel {instance_id}"),
                });
            }
            if tracked.instance.status.is_terminal() {
                return Ok(tracked.instance.status);
            }
            if tracked.instance.action_attempt.is_some() {
                return Err(EngineError::ActionInFlight(instance_id.clone()));
            }

            let retired = tracked.instance.retire_pending();
            let now = self.clock.now();
            tracked.instance.transition(
                WorkflowStatus::Cancelled,
                now,
                format!("cancelled by {}", actor.id),
            )?;

            match self.persist(&mut tracked).await {
                Ok(()) => {
                    tracing::info!(
                        instance_id = %instance_id,
                        actor = %actor.id,
                        retired_tokens = retired,
                        "Workflow cancelled"
                    );
                    return Ok(WorkflowStatus::Cancelled);
                }
                Err(EngineError::VersionConflict { .. }) => {
                    tracing::debug!(instance_id = %instance_id, attempt, "Cancel raced; reloading");
                }
                Err(e) => return Err(e),
            }
        }

        Err(EngineError::EngineBusy(instance_id.clone()))
    }

    /// Fresh tokens for every outstanding prompt of a suspended instance.
    /// The superseded tokens report `Consumed` from then on.
    pub async fn reissue(
        &self,
        instance_id: &WorkflowInstanceId,
        actor_id: &ActorId,
    ) -> EngineResult<Suspension> {
        for _ in 0..=self.max_conflict_retries {
            let mut tracked = self.load(instance_id).await?;
            if &tracked.instance.actor != actor_id {
                return Err(EngineError::Unauthorized {
                    actor: actor_id.clone(),
                    operation: format!("reissue confirmations for {instance_id}"),
                });
            }
            if tracked.instance.status != WorkflowStatus::Suspended {
                return Err(EngineError::InvalidState {
                    status: tracked.instance.status,
                    expected: WorkflowStatus::Suspended,
                });
            }

            let now = self.clock.now();
            let mut fresh = Vec::with_capacity(tracked.instance.pending.len());
            for prompt in &tracked.instance.pending {
                let binding = TokenBinding::new(
                    instance_id.clone(),
                    tracked.instance.actor.clone(),
                    prompt.action.clone(),
                    &prompt.params,
                );
                let issued = self.tokens.issue(&binding)?;
                fresh.push(PendingPrompt {
                    nonce: issued.claims.nonce,
                    token: issued.token,
                    issued_at: now,
                    expires_at: issued.expires_at,
                    ..prompt.clone()
                });
            }
            let retired = tracked.instance.retire_pending();
            tracked.instance.pending = fresh;

            match self.persist(&mut tracked).await {
                Ok(()) => {
                    tracing::info!(instance_id = %instance_id, reissued = retired, "Confirmation tokens reissued");
                    return Ok(Suspension::of(&tracked.instance));
                }
                Err(EngineError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(EngineError::EngineBusy(instance_id.clone()))
    }

    // ── Recovery ─────────────────────────────────────────────────────

    /// Bring one instance back after a restart.
    ///
    /// A terminal action interrupted after its marker was written is asked
    /// about by idempotency key first, and only executed again (with the same
    /// key) if the backend never saw it.
    pub async fn recover(&self, instance_id: &WorkflowInstanceId) -> EngineResult<Advance> {
        let tracked = self.load(instance_id).await?;
        match (tracked.instance.status, tracked.instance.action_attempt.clone()) {
            (WorkflowStatus::Running, Some(attempt)) => {
                tracing::info!(
                    instance_id = %instance_id,
                    key = %attempt.idempotency_key,
                    "Recovering interrupted terminal action"
                );
                let definition = self.definition_of(&tracked.instance)?;
                self.settle_action(tracked, &definition, attempt, true).await
            }
            (WorkflowStatus::Created | WorkflowStatus::Running | WorkflowStatus::Resuming, _) => {
                self.drive(tracked).await
            }
            _ => Ok(Advance::of(&tracked.instance)),
        }
    }

    /// Recover every non-terminal instance in the store.
    pub async fn recover_all(&self) -> EngineResult<Vec<(WorkflowInstanceId, EngineResult<Advance>)>> {
        let mut results = Vec::new();
        for instance_id in self.checkpoints.list_instances().await? {
            let status = match self.load(&instance_id).await {
                Ok(tracked) => tracked.instance.status,
                Err(e) => {
                    results.push((instance_id, Err(e)));
                    continue;
                }
            };
            if status.is_terminal() {
                continue;
            }
            let outcome = self.recover(&instance_id).await;
            if let Err(err) = &outcome {
                tracing::warn!(instance_id = %instance_id, error = %err, "Recovery failed");
            }
            results.push((instance_id, outcome));
        }
        tracing::info!(recovered = results.len(), "Recovery pass complete");
        Ok(results)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn instance(&self, instance_id: &WorkflowInstanceId) -> EngineResult<WorkflowInstance> {
        Ok(self.load(instance_id).await?.instance)
    }

    pub async fn history(&self, instance_id: &WorkflowInstanceId) -> EngineResult<Vec<Checkpoint>> {
        Ok(self.checkpoints.history(instance_id).await?)
    }

    pub async fn audit_trail(&self, instance_id: &WorkflowInstanceId) -> EngineResult<Vec<AuditRecord>> {
        Ok(self.audit.for_instance(instance_id).await?)
    }

    // ── Driving ──────────────────────────────────────────────────────

    async fn drive(&self, mut tracked: Tracked) -> EngineResult<Advance> {
        let definition = self.definition_of(&tracked.instance)?;

        loop {
            match tracked.instance.status {
                WorkflowStatus::Created | WorkflowStatus::Resuming => {
                    let now = self.clock.now();
                    tracked
                        .instance
                        .transition(WorkflowStatus::Running, now, "advancing")?;
                    if let Some(view) = self.commit(&mut tracked).await? {
                        return Ok(view);
                    }
                }
                WorkflowStatus::Running => {}
                _ => return Ok(Advance::of(&tracked.instance)),
            }
            // The terminal action belongs to whoever wrote the marker.
            if tracked.instance.action_attempt.is_some() {
                return Ok(Advance::of(&tracked.instance));
            }

            let step = current_step(&definition, &tracked.instance)?.clone();
            tracing::debug!(
                instance_id = %tracked.instance.id,
                step = %step.name,
                index = tracked.instance.step_index,
                "Running step"
            );

            let stop = match &step.kind {
                StepKind::Automatic { handler } => {
                    self.run_automatic(&mut tracked, &definition, &step, handler)
                        .await?
                }
                StepKind::Confirmation(gate) => {
                    self.open_gate(&mut tracked, &definition, &step, gate).await?
                }
                StepKind::TerminalAction {
                    action,
                    params,
                    require_decisions,
                } => {
                    return self
                        .run_terminal(tracked, &definition, &step, action, params, *require_decisions)
                        .await;
                }
            };
            if let Some(view) = stop {
                return Ok(view);
            }
        }
    }

    async fn run_automatic(
        &self,
        tracked: &mut Tracked,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        handler_name: &str,
    ) -> EngineResult<Option<Advance>> {
        let handler = self
            .handlers
            .get(handler_name)
            .ok_or_else(|| EngineError::StepFailed {
                step: step.name.clone(),
                reason: format!("no handler registered as {handler_name}"),
            })?;

        let snapshot = tracked.instance.clone();
        let gateway: &dyn ActionGateway = &self.gateway;
        let result = self
            .retry
            .run(&step.name, |_| {
                let handler = handler.clone();
                let mut scratch = snapshot.clone();
                async move {
                    let output = handler.run(&mut scratch, gateway).await?;
                    Ok::<_, StepError>((scratch, output))
                }
            })
            .await;

        match result {
            Ok((updated, output)) => {
                tracked.instance = updated;
                tracked.instance.outputs.insert(step.name.clone(), output);
                tracked.instance.complete_step(&step.name);
                self.commit(tracked).await
            }
            Err(err) => {
                let reason = err.to_string();
                tracing::warn!(
                    instance_id = %tracked.instance.id,
                    step = %step.name,
                    error = %reason,
                    "Automatic step failed"
                );
                self.fail(tracked, definition, format!("step {}: {reason}", step.name))
                    .await?;
                Err(EngineError::StepFailed {
                    step: step.name.clone(),
                    reason,
                })
            }
        }
    }

    /// Issue the gate's prompts and suspend, or pass through an empty
    /// bucket gate that may be skipped.
    async fn open_gate(
        &self,
        tracked: &mut Tracked,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        gate: &GateSpec,
    ) -> EngineResult<Option<Advance>> {
        match &gate.scope {
            GateScope::Single => {
                let params = resolve_params(&tracked.instance, definition, &gate.params)?;
                let empty = params.get("count").and_then(Value::as_u64) == Some(0);
                if gate.skip_when_empty && empty {
                    tracing::info!(
                        instance_id = %tracked.instance.id,
                        step = %step.name,
                        "Nothing to confirm; gate skipped"
                    );
                    tracked.instance.complete_step(&step.name);
                    return self.commit(tracked).await;
                }
                let prompt = self.issue_prompt(
                    &tracked.instance,
                    &gate.action,
                    params,
                    &gate.prompt,
                    &gate.options,
                    None,
                )?;
                tracked.instance.pending.push(prompt);
            }
            GateScope::PerPendingItem {
                item_action,
                item_prompt,
                item_options,
            } => {
                // Prompts from an earlier visit to this gate stay valid.
                let prompted: HashSet<ItemId> = tracked
                    .instance
                    .pending
                    .iter()
                    .filter_map(|p| p.item_id.clone())
                    .collect();
                for item_id in tracked.instance.pending_items() {
                    if prompted.contains(&item_id) {
                        continue;
                    }
                    let params = item_params(&tracked.instance, &item_id)?;
                    let prompt = self.issue_prompt(
                        &tracked.instance,
                        item_action,
                        params,
                        item_prompt,
                        item_options,
                        Some(item_id),
                    )?;
                    tracked.instance.pending.push(prompt);
                }
                if !tracked.instance.pending.iter().any(|p| p.item_id.is_none()) {
                    let params = resolve_params(&tracked.instance, definition, &gate.params)?;
                    let prompt = self.issue_prompt(
                        &tracked.instance,
                        &gate.action,
                        params,
                        &gate.prompt,
                        &gate.options,
                        None,
                    )?;
                    tracked.instance.pending.push(prompt);
                }
            }
        }

        let now = self.clock.now();
        tracked.instance.transition(
            WorkflowStatus::Suspended,
            now,
            format!("awaiting {}", gate.action),
        )?;
        if let Some(view) = self.commit(tracked).await? {
            return Ok(Some(view));
        }

        tracing::info!(
            instance_id = %tracked.instance.id,
            step = %step.name,
            action = %gate.action,
            prompts = tracked.instance.pending.len(),
            version = tracked.version,
            "Workflow suspended at confirmation gate"
        );
        Ok(Some(Advance::Suspended(Suspension::of(&tracked.instance))))
    }

    async fn run_terminal(
        &self,
        mut tracked: Tracked,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        action: &str,
        source: &ParamSource,
        require_decisions: bool,
    ) -> EngineResult<Advance> {
        if require_decisions {
            let pending = tracked.instance.pending_items();
            if !pending.is_empty() {
                return Err(EngineError::IncompleteDecisions { pending });
            }
        }

        let params = resolve_params(&tracked.instance, definition, source)?;
        let attempt = ActionAttempt {
            step: step.name.clone(),
            action: action.to_string(),
            idempotency_key: IdempotencyKey::for_step(&tracked.instance.id, &step.name),
            params,
            token_nonce: tracked
                .instance
                .last_confirmation()
                .map(|c| c.token_nonce.clone()),
            started_at: self.clock.now(),
        };

        // The marker must be durable before the backend sees the request.
        tracked.instance.action_attempt = Some(attempt.clone());
        if let Some(view) = self.commit(&mut tracked).await? {
            return Ok(view);
        }

        tracing::info!(
            instance_id = %tracked.instance.id,
            step = %step.name,
            action = %action,
            key = %attempt.idempotency_key,
            "Executing terminal action"
        );
        self.settle_action(tracked, definition, attempt, false).await
    }

    /// Obtain the outcome of a marked terminal action and finish the
    /// instance with it.
    async fn settle_action(
        &self,
        tracked: Tracked,
        definition: &WorkflowDefinition,
        attempt: ActionAttempt,
        lookup_first: bool,
    ) -> EngineResult<Advance> {
        let key = &attempt.idempotency_key;
        let known = if lookup_first {
            self.retry
                .run("lookup", |_| self.gateway.lookup(key))
                .await
        } else {
            Ok(None)
        };

        let result = match known {
            Ok(Some(result)) => {
                tracing::info!(key = %key, success = result.success, "Adopting outcome reported by the backend");
                Ok(result)
            }
            Ok(None) => {
                self.retry
                    .run(&attempt.action, |_| {
                        self.gateway.execute(&attempt.action, &attempt.params, key)
                    })
                    .await
            }
            Err(err) => Err(err),
        };

        match result {
            Err(err) if err.is_transient() && lookup_first => {
                // Still unreachable during recovery; the marker stays for the next pass.
                tracing::warn!(
                    instance_id = %tracked.instance.id,
                    key = %key,
                    error = %err,
                    "Gateway unavailable; terminal action left for recovery"
                );
                Err(EngineError::TransientGateway(err.to_string()))
            }
            Err(err) if err.is_transient() => {
                let settled = self.reconcile(key, err).await;
                self.finish_terminal(tracked, definition, attempt, settled)
                    .await
            }
            other => self.finish_terminal(tracked, definition, attempt, other).await,
        }
    }

    /// Retries are spent: adopt whatever the backend recorded under `key`,
    /// or escalate the transient error to a failure.
    async fn reconcile(
        &self,
        key: &IdempotencyKey,
        err: GatewayError,
    ) -> Result<ActionResult, GatewayError> {
        match self.gateway.lookup(key).await {
            Ok(Some(result)) => {
                tracing::info!(key = %key, success = result.success, "Backend applied the action despite the outage");
                Ok(result)
            }
            Ok(None) => {
                tracing::warn!(key = %key, error = %err, "Retries exhausted; terminal action failed");
                Err(err)
            }
            Err(lookup_err) => {
                tracing::warn!(
                    key = %key,
                    error = %err,
                    lookup_error = %lookup_err,
                    "Retries exhausted and outcome unknown; terminal action failed"
                );
                Err(err)
            }
        }
    }

    async fn finish_terminal(
        &self,
        mut tracked: Tracked,
        definition: &WorkflowDefinition,
        attempt: ActionAttempt,
        result: Result<ActionResult, GatewayError>,
    ) -> EngineResult<Advance> {
        let outcome = match result {
            Ok(r) if r.success => AuditOutcome::Succeeded {
                external_id: r.external_id,
            },
            Ok(r) => AuditOutcome::Failed {
                reason: r
                    .error
                    .unwrap_or_else(|| "rejected by the governance backend".to_string()),
            },
            Err(err) => AuditOutcome::Failed {
                reason: err.to_string(),
            },
        };

        // Audit first: a terminal checkpoint without its record must not exist.
        self.record_audit(
            &tracked.instance,
            &attempt.action,
            &attempt.params,
            attempt.token_nonce.clone(),
            &attempt.idempotency_key,
            outcome.clone(),
        )
        .await?;
        tracked.instance.action_attempt = None;

        match outcome {
            AuditOutcome::Succeeded { external_id } => {
                let now = self.clock.now();
                tracked.instance.external_id = external_id.clone();
                tracked.instance.complete_step(&attempt.step);
                tracked
                    .instance
                    .transition(WorkflowStatus::Completed, now, format!("{} succeeded", attempt.action))?;
                if let Some(view) = self.commit(&mut tracked).await? {
                    return Ok(view);
                }
                tracing::info!(
                    instance_id = %tracked.instance.id,
                    action = %attempt.action,
                    external_id = ?external_id,
                    "Workflow completed"
                );
                Ok(Advance::Completed {
                    instance_id: tracked.instance.id,
                    external_id,
                })
            }
            AuditOutcome::Failed { reason } => {
                tracing::warn!(
                    instance_id = %tracked.instance.id,
                    action = %attempt.action,
                    reason = %reason,
                    "Terminal action failed"
                );
                self.fail(&mut tracked, definition, reason.clone()).await?;
                Err(EngineError::ActionFailed {
                    instance_id: tracked.instance.id,
                    reason,
                })
            }
        }
    }

    /// Move to `FAILED` and run compensations, unless another writer got
    /// there first.
    async fn fail(
        &self,
        tracked: &mut Tracked,
        definition: &WorkflowDefinition,
        reason: String,
    ) -> EngineResult<()> {
        let now = self.clock.now();
        tracked.instance.retire_pending();
        tracked.instance.failure = Some(reason.clone());
        tracked
            .instance
            .transition(WorkflowStatus::Failed, now, reason)?;
        if self.commit(tracked).await?.is_none() {
            self.compensate(&tracked.instance, definition).await;
        }
        Ok(())
    }

    /// Undo completed steps in reverse. Best effort: failures are logged and
    /// audited, never raised.
    async fn compensate(&self, instance: &WorkflowInstance, definition: &WorkflowDefinition) {
        for name in instance.completed_steps.iter().rev() {
            let Some(action) = definition
                .step_index(name)
                .and_then(|i| definition.step(i))
                .and_then(|s| s.compensation.as_ref())
            else {
                continue;
            };

            let key = IdempotencyKey::for_compensation(&instance.id, name);
            let params = json!({
                "step": name,
                "output": instance.outputs.get(name).cloned().unwrap_or(Value::Null),
            });
            let result = self
                .retry
                .run(action, |_| self.gateway.execute(action, &params, &key))
                .await;
            let outcome = match result {
                Ok(r) if r.success => AuditOutcome::Succeeded {
                    external_id: r.external_id,
                },
                Ok(r) => AuditOutcome::Failed {
                    reason: r.error.unwrap_or_else(|| "compensation rejected".to_string()),
                },
                Err(err) => AuditOutcome::Failed {
                    reason: err.to_string(),
                },
            };

            if outcome.is_success() {
                tracing::info!(instance_id = %instance.id, step = %name, action = %action, "Step compensated");
            } else {
                tracing::warn!(instance_id = %instance.id, step = %name, action = %action, outcome = ?outcome, "Compensation failed");
            }
            if let Err(err) = self
                .record_audit(instance, action, &params, None, &key, outcome)
                .await
            {
                tracing::warn!(instance_id = %instance.id, step = %name, error = %err, "Compensation not audited");
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn apply_confirmation(
        &self,
        instance: &mut WorkflowInstance,
        step: &str,
        prompt: &PendingPrompt,
        choice: &PromptOption,
        actor_id: &ActorId,
    ) {
        let now = self.clock.now();
        instance.consumed_nonces.insert(prompt.nonce.clone());
        instance.confirmations.push(ConfirmationRecord {
            step: step.to_string(),
            action: prompt.action.clone(),
            option: choice.id.clone(),
            actor: actor_id.clone(),
            token_nonce: prompt.nonce.clone(),
            confirmed_at: now,
        });
        let attribution = DecisionAttribution {
            actor: actor_id.clone(),
            token_nonce: prompt.nonce.clone(),
            decided_at: now,
        };

        match choice.effect {
            OptionEffect::Cancel => {
                instance.retire_pending();
            }
            OptionEffect::Proceed | OptionEffect::Defer | OptionEffect::SignOff => {
                instance.retire_pending();
                instance.complete_step(step);
            }
            OptionEffect::DecideBucket { decision } => {
                for item_id in bound_items(&prompt.params) {
                    if let Some(item) = instance.item_mut(&item_id) {
                        item.decide(decision, attribution.clone());
                    }
                }
                instance.retire_pending();
                instance.complete_step(step);
            }
            OptionEffect::DecideItem { decision } => {
                if let Some(item) = prompt
                    .item_id
                    .as_ref()
                    .and_then(|id| instance.item_mut(id))
                {
                    item.decide(decision, attribution);
                }
                // The gate stays open; only this prompt is spent.
                instance.pending.retain(|p| p.nonce != prompt.nonce);
            }
        }
    }

    fn issue_prompt(
        &self,
        instance: &WorkflowInstance,
        action: &str,
        params: Value,
        template: &str,
        options: &[PromptOption],
        item_id: Option<ItemId>,
    ) -> EngineResult<PendingPrompt> {
        let binding = TokenBinding::new(
            instance.id.clone(),
            instance.actor.clone(),
            action,
            &params,
        );
        let issued = self.tokens.issue(&binding)?;
        Ok(PendingPrompt {
            nonce: issued.claims.nonce,
            token: issued.token,
            action: action.to_string(),
            prompt_text: render_template(template, &params),
            params,
            options: options.to_vec(),
            item_id,
            issued_at: self.clock.now(),
            expires_at: issued.expires_at,
        })
    }

    async fn record_audit(
        &self,
        instance: &WorkflowInstance,
        action: &str,
        params: &Value,
        token_nonce: Option<String>,
        key: &IdempotencyKey,
        outcome: AuditOutcome,
    ) -> EngineResult<()> {
        let event = AuditAppend {
            timestamp: self.clock.now(),
            instance_id: instance.id.clone(),
            token_nonce,
            actor: instance.actor.clone(),
            action: action.to_string(),
            parameters: params.clone(),
            outcome,
            idempotency_key: key.to_string(),
            usage_units: self.ledger.total_for(&instance.id),
        };
        match self.audit.append(event).await {
            Ok(record) => {
                tracing::debug!(
                    instance_id = %instance.id,
                    sequence = record.sequence,
                    key = %key,
                    "Audit record appended"
                );
                Ok(())
            }
            Err(StorageError::Duplicate(_)) => {
                tracing::debug!(instance_id = %instance.id, key = %key, "Action already audited");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn definition_of(&self, instance: &WorkflowInstance) -> EngineResult<Arc<WorkflowDefinition>> {
        self.definitions
            .get_version(&instance.definition_id, instance.definition_version)
    }

    async fn load(&self, instance_id: &WorkflowInstanceId) -> EngineResult<Tracked> {
        let checkpoint = self
            .checkpoints
            .load(instance_id)
            .await
            .map_err(|e| match e {
                StorageError::NotFound(_) => EngineError::InstanceNotFound(instance_id.clone()),
                other => other.into(),
            })?;
        let instance = serde_json::from_value(checkpoint.state)?;
        Ok(Tracked {
            instance,
            version: checkpoint.version,
        })
    }

    async fn persist(&self, tracked: &mut Tracked) -> EngineResult<()> {
        tracked.instance.updated_at = self.clock.now();
        let state = serde_json::to_value(&tracked.instance)?;
        tracked.version = self
            .checkpoints
            .save(&tracked.instance.id, state, tracked.version)
            .await?;
        tracing::debug!(
            instance_id = %tracked.instance.id,
            version = tracked.version,
            status = %tracked.instance.status,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Persist, or on a lost race reload and report the winner's state.
    async fn commit(&self, tracked: &mut Tracked) -> EngineResult<Option<Advance>> {
        match self.persist(tracked).await {
            Ok(()) => Ok(None),
            Err(EngineError::VersionConflict { .. }) => {
                let latest = self.load(&tracked.instance.id).await?;
                tracing::warn!(
                    instance_id = %latest.instance.id,
                    version = latest.version,
                    status = %latest.instance.status,
                    "Checkpoint race lost; stopping in favour of the newer state"
                );
                *tracked = latest;
                Ok(Some(Advance::of(&tracked.instance)))
            }
            Err(e) => Err(e),
        }
    }
}

fn current_step<'a>(
    definition: &'a WorkflowDefinition,
    instance: &WorkflowInstance,
) -> EngineResult<&'a StepDefinition> {
    definition
        .step(instance.step_index)
        .ok_or_else(|| EngineError::StepFailed {
            step: format!("#{}", instance.step_index),
            reason: format!("{} has no such step", definition.id),
        })
}

// ── Parameter resolution ─────────────────────────────────────────────

fn decode_items(parameters: &Value, param: &str) -> EngineResult<Vec<GovernanceItem>> {
    let raw = parameters
        .get(param)
        .ok_or_else(|| EngineError::InvalidParameters(format!("missing {param}")))?;
    let items: Vec<GovernanceItem> = serde_json::from_value(raw.clone())
        .map_err(|e| EngineError::InvalidParameters(format!("{param}: {e}")))?;

    let mut seen = HashSet::new();
    for item in &items {
        if !seen.insert(&item.id) {
            return Err(EngineError::InvalidParameters(format!(
                "duplicate item {}",
                item.id
            )));
        }
    }
    Ok(items)
}

/// The parameters a gate or terminal action binds. What this returns is
/// exactly what a token's digest covers.
fn resolve_params(
    instance: &WorkflowInstance,
    definition: &WorkflowDefinition,
    source: &ParamSource,
) -> EngineResult<Value> {
    match source {
        ParamSource::Parameters => Ok(instance.parameters.clone()),
        ParamSource::Output { step } => {
            instance
                .outputs
                .get(step)
                .cloned()
                .ok_or_else(|| EngineError::StepFailed {
                    step: step.clone(),
                    reason: "output not recorded".to_string(),
                })
        }
        ParamSource::Bucket { bucket } => {
            let items: Vec<&ItemId> = instance
                .items
                .iter()
                .filter(|i| i.is_pending() && i.bucket() == Some(*bucket))
                .map(|i| &i.id)
                .collect();
            Ok(json!({
                "bucket": bucket,
                "count": items.len(),
                "items": items,
            }))
        }
        ParamSource::Batch => Ok(Value::Object(batch_params(instance, definition))),
        ParamSource::Decisions => {
            let mut params = batch_params(instance, definition);
            let decisions: Vec<Value> = instance
                .items
                .iter()
                .map(|item| {
                    let attribution = item.attribution.as_ref();
                    json!({
                        "item_id": item.id,
                        "decision": item.decision.as_str(),
                        "decided_by": attribution.map(|a| a.actor.clone()),
                        "token_nonce": attribution.map(|a| a.token_nonce.clone()),
                        "decided_at": attribution.map(|a| a.decided_at),
                    })
                })
                .collect();
            params.insert("decisions".to_string(), Value::Array(decisions));
            Ok(Value::Object(params))
        }
    }
}

fn batch_params(instance: &WorkflowInstance, definition: &WorkflowDefinition) -> Map<String, Value> {
    let mut params = match &instance.parameters {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Some(param) = &definition.items_param {
        params.remove(param);
    }
    params.insert("item_count".to_string(), json!(instance.items.len()));
    params
}

fn item_params(instance: &WorkflowInstance, item_id: &ItemId) -> EngineResult<Value> {
    let item = instance
        .item(item_id)
        .ok_or_else(|| EngineError::InvalidParameters(format!("unknown item {item_id}")))?;
    Ok(json!({
        "item_id": item.id,
        "item_name": item.name,
        "score": item.assessment.map(|a| a.score),
        "bucket": item.bucket(),
        "recommendation": item.recommendation,
    }))
}

/// Item ids a bucket prompt was issued for.
fn bound_items(params: &Value) -> Vec<ItemId> {
    params
        .get("items")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(ItemId::from)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::RecordingGateway;
    use gatehouse_storage::InMemoryStorage;
    use gatehouse_types::{Decision, RiskAssessment, RiskBucket};

    fn engine() -> WorkflowEngine {
        EngineBuilder::with_storage(
            Arc::new(InMemoryStorage::new()),
            Arc::new(RecordingGateway::new()),
        )
        .with_builtin_definitions()
        .build()
        .unwrap()
    }

    fn review_instance() -> WorkflowInstance {
        let mut low = GovernanceItem::new("low", "Wiki reader");
        low.assessment = Some(RiskAssessment {
            score: 0.1,
            bucket: RiskBucket::AutoApprove,
        });
        let mut high = GovernanceItem::new("high", "Payroll admin");
        high.assessment = Some(RiskAssessment {
            score: 0.9,
            bucket: RiskBucket::Escalate,
        });
        WorkflowInstance::new(
            WorkflowInstanceId::new("t:1"),
            &builtin::certification_review(),
            "reviewer".into(),
            json!({"campaign": "Q3", "items": []}),
            chrono::Utc::now(),
        )
        .with_items(vec![low, high])
    }

    #[test]
    fn test_bucket_params_list_pending_items() {
        let instance = review_instance();
        let params = resolve_params(
            &instance,
            &builtin::certification_review(),
            &ParamSource::Bucket {
                bucket: RiskBucket::AutoApprove,
            },
        )
        .unwrap();
        assert_eq!(params, json!({"bucket": "auto_approve", "count": 1, "items": ["low"]}));
        assert_eq!(bound_items(&params), vec![ItemId::new("low")]);
    }

    #[test]
    fn test_batch_params_drop_item_list() {
        let instance = review_instance();
        let params = resolve_params(
            &instance,
            &builtin::certification_review(),
            &ParamSource::Batch,
        )
        .unwrap();
        assert_eq!(params, json!({"campaign": "Q3", "item_count": 2}));
    }

    #[test]
    fn test_decision_params_carry_attribution() {
        let mut instance = review_instance();
        instance.items[0].decide(
            Decision::Approved,
            DecisionAttribution {
                actor: "reviewer".into(),
                token_nonce: "n1".into(),
                decided_at: chrono::Utc::now(),
            },
        );
        let params = resolve_params(
            &instance,
            &builtin::certification_review(),
            &ParamSource::Decisions,
        )
        .unwrap();
        let decisions = params["decisions"].as_array().unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0]["decision"], "approved");
        assert_eq!(decisions[0]["token_nonce"], "n1");
        assert_eq!(decisions[1]["decision"], "pending");
        assert!(decisions[1]["decided_by"].is_null());
    }

    #[test]
    fn test_decode_items_rejects_bad_input() {
        assert!(matches!(
            decode_items(&json!({}), "items"),
            Err(EngineError::InvalidParameters(_))
        ));
        assert!(matches!(
            decode_items(&json!({"items": "nope"}), "items"),
            Err(EngineError::InvalidParameters(_))
        ));
        let dup = json!({"items": [
            {"id": "a", "name": "A"},
            {"id": "a", "name": "A again"},
        ]});
        assert!(matches!(
            decode_items(&dup, "items"),
            Err(EngineError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_unknown_handler_rejected_at_build() {
        let definition = WorkflowDefinition::new("custom", "Custom")
            .with_step(StepDefinition::automatic("prep", "does.not.exist"))
            .with_step(StepDefinition::terminal("act", "custom.act", ParamSource::Parameters));
        let result = EngineBuilder::with_storage(
            Arc::new(InMemoryStorage::new()),
            Arc::new(RecordingGateway::new()),
        )
        .register(definition)
        .build();
        assert!(matches!(result, Err(EngineError::InvalidDefinition(_))));
    }

    #[tokio::test]
    async fn test_unknown_definition_and_instance() {
        let engine = engine();
        let err = engine
            .start(StartRequest::new("nope", json!({}), Actor::new("alice"), "thread"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownDefinition(_)));

        let err = engine
            .advance(&WorkflowInstanceId::new("thread:missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn test_unauthorized_start() {
        let engine = EngineBuilder::with_storage(
            Arc::new(InMemoryStorage::new()),
            Arc::new(RecordingGateway::new()),
        )
        .with_builtin_definitions()
        .authorization(AuthorizationTable::new().grant("employee", builtin::ACCESS_REQUEST))
        .build()
        .unwrap();

        let err = engine
            .start(StartRequest::new(
                builtin::CERTIFICATION_REVIEW,
                json!({"items": []}),
                Actor::new("alice").with_role("employee"),
                "thread",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized { .. }));
        assert_eq!(
            engine
                .visible_definitions(&Actor::new("alice").with_role("employee"))
                .len(),
            1
        );
    }
}
