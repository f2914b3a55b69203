//! Step-based workflow engine
//!
//! Information Hiding:
//! - Instance drive loop and branch fan-out internalized
//! - Retry bookkeeping hidden inside step execution
//! - Listener notification isolated from execution

mod definition;
mod instance;

pub use definition::{
    task_fn, DecisionFn, StepKind, TaskHandler, WorkflowDefinition, WorkflowStep,
};
pub use instance::{
    InstanceStatus, StepExecution, StepStatus, WorkflowEvent, WorkflowInstance, WorkflowListener,
};

use crate::bus::ContentMap;
use anyhow::Context;
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Registry of workflow templates and store of running instances.
///
/// `start_instance` drives an instance inline until it completes, fails,
/// pauses at a wait step or observes cancellation; `resume_instance`
/// re-enters the drive after the wait step. Branches of a parallel step
/// interleave at await points; there is no OS-thread parallelism.
pub struct WorkflowEngine {
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    instances: RwLock<HashMap<Uuid, Arc<Mutex<WorkflowInstance>>>>,
    agent_handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    listeners: RwLock<Vec<Arc<dyn WorkflowListener>>>,
}

impl WorkflowEngine {
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            agent_handlers: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a template after validating its step graph. Template ids
    /// are registered once; re-registration is rejected.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> anyhow::Result<()> {
        definition.validate()?;

        let mut definitions = self.definitions.write();
        if definitions.contains_key(&definition.id) {
            anyhow::bail!("workflow '{}' is already registered", definition.id);
        }

        tracing::info!(workflow = %definition.id, version = %definition.version, "workflow registered");
        definitions.insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    /// Register the worker handler behind agent_call steps of this type.
    pub fn register_agent_handler(
        &self,
        agent_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) {
        let agent_type = agent_type.into();
        tracing::debug!(%agent_type, "agent handler registered");
        self.agent_handlers.write().insert(agent_type, handler);
    }

    pub fn add_listener(&self, listener: Arc<dyn WorkflowListener>) {
        self.listeners.write().push(listener);
    }

    pub fn list_workflows(&self) -> Vec<String> {
        self.definitions.read().keys().cloned().collect()
    }

    /// Create a pending instance of a registered template.
    pub fn create_instance(
        &self,
        workflow_id: &str,
        initial_context: ContentMap,
    ) -> anyhow::Result<Uuid> {
        if !self.definitions.read().contains_key(workflow_id) {
            anyhow::bail!("unknown workflow '{}'", workflow_id);
        }

        let instance = WorkflowInstance::new(workflow_id, initial_context);
        let id = instance.id;
        self.instances
            .write()
            .insert(id, Arc::new(Mutex::new(instance)));

        tracing::debug!(instance = %id, workflow = %workflow_id, "instance created");
        Ok(id)
    }

    /// Cloned view of an instance for inspection.
    pub async fn get_instance(&self, id: Uuid) -> Option<WorkflowInstance> {
        let instance = self.instances.read().get(&id).cloned()?;
        let guard = instance.lock().await;
        Some(guard.clone())
    }

    pub async fn instance_status(&self, id: Uuid) -> Option<InstanceStatus> {
        let instance = self.instances.read().get(&id).cloned()?;
        let guard = instance.lock().await;
        Some(guard.status)
    }

    /// Drive a pending instance from the template's start step. Returns
    /// once the instance reaches a terminal status or pauses at a wait
    /// step; the instance's own status/error fields carry the outcome.
    pub async fn start_instance(&self, id: Uuid) -> anyhow::Result<()> {
        let instance = self
            .instances
            .read()
            .get(&id)
            .cloned()
            .with_context(|| format!("unknown instance {}", id))?;

        let (definition, start_step) = {
            let mut guard = instance.lock().await;
            anyhow::ensure!(
                guard.status == InstanceStatus::Pending,
                "instance {} is {:?}, expected pending",
                id,
                guard.status
            );

            let definition = self
                .definitions
                .read()
                .get(&guard.workflow_id)
                .cloned()
                .with_context(|| format!("unknown workflow '{}'", guard.workflow_id))?;

            guard.status = InstanceStatus::Running;
            guard.started_at = Some(Utc::now());
            let start_step = definition.start_step.clone();
            (definition, start_step)
        };

        let workflow_id = definition.id.clone();
        tracing::info!(instance = %id, workflow = %workflow_id, "instance started");
        self.emit(WorkflowEvent::InstanceStarted {
            instance_id: id,
            workflow_id,
        });

        self.drive(&definition, &instance, start_step).await;
        Ok(())
    }

    /// Continue a paused instance past its wait step, merging the caller's
    /// input into the context first. Returns false unless the instance is
    /// exactly paused.
    pub async fn resume_instance(&self, id: Uuid, user_input: ContentMap) -> bool {
        let Some(instance) = self.instances.read().get(&id).cloned() else {
            tracing::warn!(instance = %id, "resume of unknown instance");
            return false;
        };

        let (definition, next) = {
            let mut guard = instance.lock().await;
            if guard.status != InstanceStatus::Paused {
                tracing::warn!(
                    instance = %id,
                    status = ?guard.status,
                    "resume rejected, instance is not paused"
                );
                return false;
            }

            let Some(definition) = self.definitions.read().get(&guard.workflow_id).cloned() else {
                return false;
            };

            for (key, value) in user_input {
                guard.context.insert(key, value);
            }

            // current_step holds the wait step while paused.
            let Some(wait_id) = guard.current_step.clone() else {
                return false;
            };
            let Some(wait_step) = definition.steps.get(&wait_id) else {
                return false;
            };

            if let Some(exec) = guard.steps.get_mut(&wait_id) {
                exec.finish_ok(None);
            }
            guard.status = InstanceStatus::Running;

            // The wait step itself is never re-entered.
            (Arc::clone(&definition), wait_step.next_steps.first().cloned())
        };

        tracing::info!(instance = %id, "instance resumed");
        self.emit(WorkflowEvent::InstanceResumed { instance_id: id });

        match next {
            Some(step) => self.drive(&definition, &instance, step).await,
            None => self.complete_instance(&instance).await,
        }
        true
    }

    /// Cancel from any non-terminal status. A running drive observes the
    /// cancellation at its next step boundary.
    pub async fn cancel_instance(&self, id: Uuid) -> bool {
        let Some(instance) = self.instances.read().get(&id).cloned() else {
            return false;
        };

        {
            let mut guard = instance.lock().await;
            if guard.status.is_terminal() {
                return false;
            }
            guard.status = InstanceStatus::Cancelled;
            guard.current_step = None;
            guard.completed_at = Some(Utc::now());
        }

        tracing::info!(instance = %id, "instance cancelled");
        self.emit(WorkflowEvent::InstanceCancelled { instance_id: id });
        true
    }

    /// Main-chain drive loop: one step at a time, following first-listed
    /// next steps, until the chain ends, pauses, fails or is cancelled.
    async fn drive(
        &self,
        definition: &Arc<WorkflowDefinition>,
        instance: &Arc<Mutex<WorkflowInstance>>,
        start: String,
    ) {
        let mut next = Some(start);

        while let Some(step_id) = next {
            let instance_id = {
                let mut guard = instance.lock().await;
                if guard.status != InstanceStatus::Running {
                    return;
                }
                guard.current_step = Some(step_id.clone());
                guard.id
            };

            let Some(step) = definition.steps.get(&step_id) else {
                self.fail_instance(instance, format!("unknown step '{}'", step_id))
                    .await;
                return;
            };

            match step.kind {
                StepKind::Wait => {
                    {
                        let mut guard = instance.lock().await;
                        guard
                            .steps
                            .insert(step_id.clone(), StepExecution::running(&step_id));
                        guard.status = InstanceStatus::Paused;
                    }
                    tracing::info!(instance = %instance_id, step = %step_id, "instance paused at wait step");
                    self.emit(WorkflowEvent::InstancePaused {
                        instance_id,
                        step_id,
                    });
                    return;
                }
                StepKind::Parallel => {
                    let branches = step.next_steps.clone();
                    let results = join_all(
                        branches
                            .into_iter()
                            .map(|branch| self.run_branch(definition, instance, branch)),
                    )
                    .await;

                    for result in results {
                        if let Err(error) = result {
                            self.fail_instance(instance, error).await;
                            return;
                        }
                    }

                    {
                        let mut guard = instance.lock().await;
                        let mut exec = StepExecution::running(&step_id);
                        exec.finish_ok(None);
                        guard.steps.insert(step_id.clone(), exec);
                    }
                    self.emit(WorkflowEvent::StepCompleted {
                        instance_id,
                        step_id,
                    });
                    self.complete_instance(instance).await;
                    return;
                }
                StepKind::Decision => {
                    next = self.execute_decision(instance, step, instance_id).await;
                    if next.is_none() {
                        self.complete_instance(instance).await;
                        return;
                    }
                }
                StepKind::Task | StepKind::AgentCall => {
                    match self.execute_step(instance, step).await {
                        Ok(()) => {
                            next = step.next_steps.first().cloned();
                            if next.is_none() {
                                self.complete_instance(instance).await;
                                return;
                            }
                        }
                        Err(error) => {
                            self.fail_instance(instance, error).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One branch of a parallel step: a full chain driven to its end.
    /// Wait steps are not supported inside branches; nested parallel steps
    /// recurse.
    fn run_branch<'a>(
        &'a self,
        definition: &'a Arc<WorkflowDefinition>,
        instance: &'a Arc<Mutex<WorkflowInstance>>,
        start: String,
    ) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            let mut next = Some(start);

            while let Some(step_id) = next {
                let instance_id = {
                    let guard = instance.lock().await;
                    if guard.status != InstanceStatus::Running {
                        return Ok(());
                    }
                    guard.id
                };

                let step = definition
                    .steps
                    .get(&step_id)
                    .ok_or_else(|| format!("unknown step '{}'", step_id))?;

                match step.kind {
                    StepKind::Wait => {
                        return Err(format!(
                            "wait step '{}' is not supported inside a parallel branch",
                            step_id
                        ));
                    }
                    StepKind::Parallel => {
                        let results = join_all(
                            step.next_steps
                                .iter()
                                .map(|branch| self.run_branch(definition, instance, branch.clone())),
                        )
                        .await;
                        for result in results {
                            result?;
                        }
                        return Ok(());
                    }
                    StepKind::Decision => {
                        next = self.execute_decision(instance, step, instance_id).await;
                    }
                    StepKind::Task | StepKind::AgentCall => {
                        self.execute_step(instance, step).await?;
                        next = step.next_steps.first().cloned();
                    }
                }
            }

            Ok(())
        })
    }

    /// Evaluate a decision step's predicate against the context and pick
    /// the follow-up step. A missing predicate, a miss, or an id not in
    /// next_steps falls back to the first listed next step.
    async fn execute_decision(
        &self,
        instance: &Arc<Mutex<WorkflowInstance>>,
        step: &WorkflowStep,
        instance_id: Uuid,
    ) -> Option<String> {
        self.emit(WorkflowEvent::StepStarted {
            instance_id,
            step_id: step.id.clone(),
            attempt: 0,
        });

        let chosen = {
            let guard = instance.lock().await;
            step.decision.as_ref().and_then(|decide| decide(&guard.context))
        };

        let selected = chosen
            .filter(|candidate| step.next_steps.iter().any(|n| n == candidate))
            .or_else(|| step.next_steps.first().cloned());

        {
            let mut guard = instance.lock().await;
            let mut exec = StepExecution::running(&step.id);
            let mut result = ContentMap::new();
            result.insert("selected".to_string(), json!(selected));
            exec.finish_ok(Some(result));
            guard.steps.insert(step.id.clone(), exec);
        }

        self.emit(WorkflowEvent::StepCompleted {
            instance_id,
            step_id: step.id.clone(),
        });

        selected
    }

    /// Run a task or agent_call step with its retry budget: up to
    /// `retry_count` re-entries after the first failure, the execution
    /// record overwritten per attempt. Exhausting the budget returns the
    /// final error, failing the instance.
    async fn execute_step(
        &self,
        instance: &Arc<Mutex<WorkflowInstance>>,
        step: &WorkflowStep,
    ) -> Result<(), String> {
        let handler = match step.kind {
            StepKind::AgentCall => {
                let agent_type = step.agent_type.clone().unwrap_or_default();
                self.agent_handlers.read().get(&agent_type).cloned()
            }
            _ => step.handler.clone(),
        };

        let (instance_id, workflow_id) = {
            let guard = instance.lock().await;
            (guard.id, guard.workflow_id.clone())
        };

        let mut last_error = String::new();

        for attempt in 0..=step.retry_count {
            {
                let mut guard = instance.lock().await;
                let mut exec = StepExecution::running(&step.id);
                exec.retry_attempts = attempt;
                guard.steps.insert(step.id.clone(), exec);
            }
            self.emit(WorkflowEvent::StepStarted {
                instance_id,
                step_id: step.id.clone(),
                attempt,
            });

            let (context, metadata) = {
                let guard = instance.lock().await;
                (
                    guard.context.clone(),
                    step_metadata(step, &workflow_id, instance_id, attempt),
                )
            };

            let outcome = match &handler {
                Some(handler) => handler.execute(context, metadata).await,
                None => Err(missing_handler_error(step)),
            };

            match outcome {
                Ok(result) => {
                    {
                        let mut guard = instance.lock().await;
                        if let Some(merge) = &result {
                            for (key, value) in merge {
                                guard.context.insert(key.clone(), value.clone());
                            }
                        }
                        if let Some(exec) = guard.steps.get_mut(&step.id) {
                            exec.finish_ok(result);
                        }
                    }
                    self.emit(WorkflowEvent::StepCompleted {
                        instance_id,
                        step_id: step.id.clone(),
                    });
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    {
                        let mut guard = instance.lock().await;
                        if let Some(exec) = guard.steps.get_mut(&step.id) {
                            exec.finish_err(&last_error);
                        }
                    }
                    tracing::warn!(
                        instance = %instance_id,
                        step = %step.id,
                        attempt,
                        error = %last_error,
                        "step attempt failed"
                    );
                    self.emit(WorkflowEvent::StepFailed {
                        instance_id,
                        step_id: step.id.clone(),
                        error: last_error.clone(),
                        attempt,
                    });
                }
            }
        }

        Err(last_error)
    }

    async fn complete_instance(&self, instance: &Arc<Mutex<WorkflowInstance>>) {
        let event = {
            let mut guard = instance.lock().await;
            if guard.status != InstanceStatus::Running {
                return;
            }
            guard.status = InstanceStatus::Completed;
            guard.current_step = None;
            guard.completed_at = Some(Utc::now());
            tracing::info!(instance = %guard.id, workflow = %guard.workflow_id, "instance completed");
            WorkflowEvent::InstanceCompleted {
                instance_id: guard.id,
            }
        };
        self.emit(event);
    }

    async fn fail_instance(&self, instance: &Arc<Mutex<WorkflowInstance>>, error: String) {
        let event = {
            let mut guard = instance.lock().await;
            if guard.status != InstanceStatus::Running {
                return;
            }
            guard.status = InstanceStatus::Failed;
            guard.current_step = None;
            guard.completed_at = Some(Utc::now());
            guard.error = Some(error.clone());
            tracing::warn!(instance = %guard.id, workflow = %guard.workflow_id, %error, "instance failed");
            WorkflowEvent::InstanceFailed {
                instance_id: guard.id,
                error,
            }
        };
        self.emit(event);
    }

    fn emit(&self, event: WorkflowEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if let Err(e) = listener.on_event(&event) {
                tracing::warn!(error = %e, "workflow listener failed");
            }
        }
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn missing_handler_error(step: &WorkflowStep) -> anyhow::Error {
    match step.kind {
        StepKind::AgentCall => anyhow::anyhow!(
            "no handler registered for agent type '{}'",
            step.agent_type.as_deref().unwrap_or("")
        ),
        _ => anyhow::anyhow!("step '{}' has no handler", step.id),
    }
}

fn step_metadata(
    step: &WorkflowStep,
    workflow_id: &str,
    instance_id: Uuid,
    attempt: u32,
) -> ContentMap {
    let mut metadata = ContentMap::new();
    metadata.insert("step_id".to_string(), json!(step.id));
    metadata.insert("step_name".to_string(), json!(step.name));
    metadata.insert("workflow_id".to_string(), json!(workflow_id));
    metadata.insert("instance_id".to_string(), json!(instance_id));
    metadata.insert("attempt".to_string(), json!(attempt));
    if let Some(timeout) = step.timeout {
        metadata.insert("timeout_ms".to_string(), json!(timeout.as_millis() as u64));
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(key: &'static str, value: serde_json::Value) -> Arc<dyn TaskHandler> {
        task_fn(move |_context, _metadata| {
            let value = value.clone();
            async move {
                let mut out = ContentMap::new();
                out.insert(key.to_string(), value);
                Ok(Some(out))
            }
        })
    }

    #[tokio::test]
    async fn test_linear_workflow_merges_context() {
        let engine = WorkflowEngine::new();
        engine
            .register_workflow(
                WorkflowDefinition::new("wf", "Linear", "1.0", "a")
                    .step(WorkflowStep::task("a", "A", constant("a", json!(1))).next("b"))
                    .step(WorkflowStep::task("b", "B", constant("b", json!(2)))),
            )
            .expect("valid definition");

        let id = engine.create_instance("wf", ContentMap::new()).unwrap();
        engine.start_instance(id).await.unwrap();

        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert!(instance.current_step.is_none());
        assert_eq!(instance.context.get("a"), Some(&json!(1)));
        assert_eq!(instance.context.get("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let engine = WorkflowEngine::new();
        let make = || {
            WorkflowDefinition::new("wf", "W", "1.0", "a")
                .step(WorkflowStep::task("a", "A", constant("a", json!(true))))
        };

        assert!(engine.register_workflow(make()).is_ok());
        assert!(engine.register_workflow(make()).is_err());
    }

    #[tokio::test]
    async fn test_decision_falls_back_to_first_next_step() {
        let engine = WorkflowEngine::new();
        let decide: DecisionFn = Arc::new(|_context| Some("nonexistent".to_string()));

        engine
            .register_workflow(
                WorkflowDefinition::new("wf", "Decide", "1.0", "choose")
                    .step(
                        WorkflowStep::decision("choose", "Choose", decide)
                            .next("left")
                            .next("right"),
                    )
                    .step(WorkflowStep::task("left", "Left", constant("took", json!("left"))))
                    .step(WorkflowStep::task("right", "Right", constant("took", json!("right")))),
            )
            .unwrap();

        let id = engine.create_instance("wf", ContentMap::new()).unwrap();
        engine.start_instance(id).await.unwrap();

        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.context.get("took"), Some(&json!("left")));
    }

    #[tokio::test]
    async fn test_start_requires_pending() {
        let engine = WorkflowEngine::new();
        engine
            .register_workflow(
                WorkflowDefinition::new("wf", "W", "1.0", "a")
                    .step(WorkflowStep::task("a", "A", constant("a", json!(1)))),
            )
            .unwrap();

        let id = engine.create_instance("wf", ContentMap::new()).unwrap();
        engine.start_instance(id).await.unwrap();
        assert!(engine.start_instance(id).await.is_err());
    }
}
