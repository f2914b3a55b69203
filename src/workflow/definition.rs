use crate::bus::ContentMap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Step kinds understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Task,
    Decision,
    Parallel,
    Wait,
    AgentCall,
}

/// Handler executed by task and agent_call steps.
///
/// Receives a snapshot of the instance context plus step metadata; a
/// returned map is merged into the instance context. The declared step
/// timeout is passed through in the metadata (`timeout_ms`) for handlers
/// that want to enforce it themselves.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(
        &self,
        context: ContentMap,
        metadata: ContentMap,
    ) -> anyhow::Result<Option<ContentMap>>;
}

struct FnTaskHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnTaskHandler<F>
where
    F: Fn(ContentMap, ContentMap) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<ContentMap>>> + Send + 'static,
{
    async fn execute(
        &self,
        context: ContentMap,
        metadata: ContentMap,
    ) -> anyhow::Result<Option<ContentMap>> {
        (self.0)(context, metadata).await
    }
}

/// Wrap an async closure as a [`TaskHandler`].
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(ContentMap, ContentMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<ContentMap>>> + Send + 'static,
{
    Arc::new(FnTaskHandler(f))
}

/// Predicate evaluated by decision steps against the instance context.
/// Returning None, or a step id not listed in `next_steps`, falls back to
/// the first listed next step.
pub type DecisionFn = Arc<dyn Fn(&ContentMap) -> Option<String> + Send + Sync>;

/// One node in a workflow template's execution graph.
#[derive(Clone)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub kind: StepKind,
    pub handler: Option<Arc<dyn TaskHandler>>,
    pub agent_type: Option<String>,
    pub next_steps: Vec<String>,
    pub decision: Option<DecisionFn>,
    /// Declared budget, carried to handlers; the engine does not pre-empt.
    pub timeout: Option<Duration>,
    /// Additional attempts after the first failure.
    pub retry_count: u32,
}

impl WorkflowStep {
    fn base(id: impl Into<String>, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            handler: None,
            agent_type: None,
            next_steps: Vec::new(),
            decision: None,
            timeout: None,
            retry_count: 0,
        }
    }

    pub fn task(
        id: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let mut step = Self::base(id, name, StepKind::Task);
        step.handler = Some(handler);
        step
    }

    pub fn decision(id: impl Into<String>, name: impl Into<String>, decide: DecisionFn) -> Self {
        let mut step = Self::base(id, name, StepKind::Decision);
        step.decision = Some(decide);
        step
    }

    pub fn parallel(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::base(id, name, StepKind::Parallel)
    }

    pub fn wait(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::base(id, name, StepKind::Wait)
    }

    /// Task variant whose handler is resolved at execution time from the
    /// engine's agent-type registry, decoupling templates from concrete
    /// workers.
    pub fn agent_call(
        id: impl Into<String>,
        name: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Self {
        let mut step = Self::base(id, name, StepKind::AgentCall);
        step.agent_type = Some(agent_type.into());
        step
    }

    /// Append a follow-up step. Sequential kinds follow the first entry;
    /// decision picks one entry; parallel fans out to all entries.
    pub fn next(mut self, step_id: impl Into<String>) -> Self {
        self.next_steps.push(step_id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

impl std::fmt::Debug for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStep")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("next_steps", &self.next_steps)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

/// A registered workflow template: a step graph plus its entry point.
/// Registered once, read-only during execution.
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    pub steps: HashMap<String, WorkflowStep>,
    pub start_step: String,
}

impl WorkflowDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        start_step: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            steps: HashMap::new(),
            start_step: start_step.into(),
        }
    }

    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.insert(step.id.clone(), step);
        self
    }

    /// Check graph integrity: the start step and every referenced next
    /// step must exist.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.steps.contains_key(&self.start_step) {
            anyhow::bail!(
                "workflow '{}': start step '{}' does not exist",
                self.id,
                self.start_step
            );
        }

        for step in self.steps.values() {
            for next in &step.next_steps {
                if !self.steps.contains_key(next) {
                    anyhow::bail!(
                        "workflow '{}': step '{}' references unknown step '{}'",
                        self.id,
                        step.id,
                        next
                    );
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn TaskHandler> {
        task_fn(|_context, _metadata| async { Ok(None) })
    }

    #[test]
    fn test_step_builder() {
        let step = WorkflowStep::task("fetch", "Fetch data", noop())
            .next("store")
            .retries(2)
            .timeout(Duration::from_secs(30));

        assert_eq!(step.kind, StepKind::Task);
        assert_eq!(step.next_steps, vec!["store"]);
        assert_eq!(step.retry_count, 2);
        assert!(step.handler.is_some());
    }

    #[test]
    fn test_validate_accepts_well_formed_graph() {
        let definition = WorkflowDefinition::new("wf", "Workflow", "1.0", "a")
            .step(WorkflowStep::task("a", "A", noop()).next("b"))
            .step(WorkflowStep::task("b", "B", noop()));

        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_start() {
        let definition = WorkflowDefinition::new("wf", "Workflow", "1.0", "missing")
            .step(WorkflowStep::task("a", "A", noop()));

        assert!(definition.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_dangling_reference() {
        let definition = WorkflowDefinition::new("wf", "Workflow", "1.0", "a")
            .step(WorkflowStep::task("a", "A", noop()).next("ghost"));

        assert!(definition.validate().is_err());
    }
}
