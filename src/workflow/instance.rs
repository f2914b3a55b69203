use crate::bus::ContentMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Execution record for one (instance, step) pair. Created lazily when the
/// step first runs and overwritten on retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<ContentMap>,
    pub error: Option<String>,
    pub retry_attempts: u32,
}

impl StepExecution {
    pub fn running(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
            retry_attempts: 0,
        }
    }

    pub fn finish_ok(&mut self, result: Option<ContentMap>) {
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = result;
        self.error = None;
    }

    pub fn finish_err(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
    }
}

/// One stateful execution of a workflow template. Owned exclusively by the
/// engine driving it; never auto-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub workflow_id: String,
    pub status: InstanceStatus,
    /// Set exactly while running or paused, None otherwise.
    pub current_step: Option<String>,
    pub context: ContentMap,
    pub steps: HashMap<String, StepExecution>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkflowInstance {
    pub fn new(workflow_id: impl Into<String>, context: ContentMap) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            status: InstanceStatus::Pending,
            current_step: None,
            context,
            steps: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Lifecycle and step events delivered to registered listeners.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    InstanceStarted {
        instance_id: Uuid,
        workflow_id: String,
    },
    InstanceCompleted {
        instance_id: Uuid,
    },
    InstanceFailed {
        instance_id: Uuid,
        error: String,
    },
    InstancePaused {
        instance_id: Uuid,
        step_id: String,
    },
    InstanceResumed {
        instance_id: Uuid,
    },
    InstanceCancelled {
        instance_id: Uuid,
    },
    StepStarted {
        instance_id: Uuid,
        step_id: String,
        attempt: u32,
    },
    StepCompleted {
        instance_id: Uuid,
        step_id: String,
    },
    StepFailed {
        instance_id: Uuid,
        step_id: String,
        error: String,
        attempt: u32,
    },
}

/// Observer for engine events. Errors are swallowed by the engine; a
/// misbehaving listener never disturbs execution.
pub trait WorkflowListener: Send + Sync {
    fn on_event(&self, event: &WorkflowEvent) -> anyhow::Result<()>;
}
