//! Workflow and step records
//!
//! A workflow is an ordered list of agent steps attached to a task. Its
//! overall status is always derived from the steps, never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TaskError;
use crate::queue::{TaskId, TaskStatus};
use crate::router::Complexity;

/// Task metadata key holding a submitted `Vec<StepSpec>`.
pub const WORKFLOW_KEY: &str = "workflow";
/// Task metadata key naming a [`WorkflowTemplate`].
pub const WORKFLOW_TEMPLATE_KEY: &str = "workflow_template";
/// Task metadata key holding the persisted [`Workflow`] progress.
pub const WORKFLOW_STATE_KEY: &str = "workflow_state";

/// Action that runs a debate instead of a single agent call.
pub const DEBATE_ACTION: &str = "debate";

/// One requested step: which role performs which action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub role: String,
    pub action: String,
}

impl StepSpec {
    pub fn new(role: &str, action: &str) -> Self {
        Self {
            role: role.to_string(),
            action: action.to_string(),
        }
    }

    /// Whether this step runs a debate.
    pub fn is_debate(&self) -> bool {
        self.action == DEBATE_ACTION
    }
}

/// Step lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A step and what came of it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub role: String,
    pub action: String,
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<TaskError>,
    /// Model that produced the result.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub complexity: Option<Complexity>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn from_spec(spec: StepSpec) -> Self {
        Self {
            role: spec.role,
            action: spec.action,
            status: StepStatus::Pending,
            result: None,
            error: None,
            model: None,
            complexity: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn spec(&self) -> StepSpec {
        StepSpec {
            role: self.role.clone(),
            action: self.action.clone(),
        }
    }

    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.error = None;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
    }

    pub fn succeed(&mut self, result: Value, model: Option<String>, complexity: Option<Complexity>) {
        self.status = StepStatus::Done;
        self.result = Some(result);
        self.error = None;
        self.model = model;
        self.complexity = complexity;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: TaskError) {
        self.status = StepStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    /// Result rendered as prompt text.
    pub fn output_text(&self) -> Option<String> {
        match self.result.as_ref()? {
            Value::String(text) => Some(text.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Overall status derived from the steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Ordered steps executed for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub task_id: TaskId,
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn new(task_id: &str, specs: Vec<StepSpec>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            steps: specs.into_iter().map(Step::from_spec).collect(),
        }
    }

    /// Derived status: any failed step fails the workflow; all done completes
    /// it; nothing started is pending; anything else is running. A workflow
    /// without steps is complete.
    pub fn status(&self) -> WorkflowStatus {
        if self.steps.iter().any(|s| s.status == StepStatus::Failed) {
            WorkflowStatus::Failed
        } else if self.steps.iter().all(|s| s.status == StepStatus::Done) {
            WorkflowStatus::Completed
        } else if self.steps.iter().all(|s| s.status == StepStatus::Pending) {
            WorkflowStatus::Pending
        } else {
            WorkflowStatus::Running
        }
    }

    /// Index of the first step not yet done.
    pub fn next_step(&self) -> Option<usize> {
        self.steps.iter().position(|s| s.status != StepStatus::Done)
    }

    /// Output of the closest finished step before `index`.
    pub fn previous_output(&self, index: usize) -> Option<String> {
        self.steps[..index.min(self.steps.len())]
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Done)
            .and_then(Step::output_text)
    }

    /// Prepare a persisted workflow for another attempt: steps that did not
    /// finish go back to pending, finished ones are kept.
    pub fn reset_unfinished(&mut self) {
        for step in &mut self.steps {
            if step.status != StepStatus::Done {
                step.status = StepStatus::Pending;
                step.started_at = None;
                step.finished_at = None;
            }
        }
    }

    /// Put running steps back to pending. Used once the task stopped
    /// without finishing them.
    pub fn clear_running(&mut self) {
        for step in &mut self.steps {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Pending;
                step.started_at = None;
            }
        }
    }

    /// Number of steps done.
    pub fn done_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .count()
    }

    /// Final task result: every step's output plus the last one.
    pub fn result_value(&self) -> Value {
        let steps: Vec<Value> = self
            .steps
            .iter()
            .map(|s| {
                serde_json::json!({
                    "role": s.role,
                    "action": s.action,
                    "model": s.model,
                    "complexity": s.complexity,
                    "result": s.result,
                })
            })
            .collect();
        serde_json::json!({
            "workflow_id": self.id,
            "steps": steps,
            "output": self.steps.last().and_then(|s| s.result.clone()),
        })
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] workflow {} | {}/{} steps done | task={}",
            self.status(),
            self.id,
            self.done_count(),
            self.steps.len(),
            self.task_id
        )
    }
}

/// Two pinned models sharing one step: the leader does the work, then the
/// assistant reviews the leader's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaborationStrategy {
    pub leader: String,
    pub assistant: String,
}

impl CollaborationStrategy {
    pub fn new(leader: &str, assistant: &str) -> Self {
        Self {
            leader: leader.to_string(),
            assistant: assistant.to_string(),
        }
    }

    /// Standard pairings keyed by step action.
    pub fn defaults() -> BTreeMap<String, CollaborationStrategy> {
        [
            ("code_implementation", "claude-sonnet", "gemini-2.5-flash"),
            ("bug_fix", "claude-sonnet", "gemini-3-pro"),
            ("refactoring", "gemini-3-pro", "claude-sonnet"),
            ("code_review", "gemini-3-pro", "claude-sonnet"),
        ]
        .into_iter()
        .map(|(action, leader, assistant)| (action.to_string(), Self::new(leader, assistant)))
        .collect()
    }
}

/// Where a step stands, as reported by a status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    pub index: usize,
    pub role: String,
    pub action: String,
    pub started_at: Option<DateTime<Utc>>,
}

/// Snapshot of a task's workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub task_id: TaskId,
    pub task_status: TaskStatus,
    /// Unset until the workflow has been persisted by a worker.
    pub workflow_id: Option<String>,
    pub status: WorkflowStatus,
    pub steps_done: usize,
    pub steps_total: usize,
    /// Percent of steps done, 0 to 100.
    pub progress: f64,
    /// The step a worker is running right now.
    pub current_step: Option<StepProgress>,
}

impl WorkflowProgress {
    /// Build from a workflow as it stands for a task in `task_status`.
    pub fn from_workflow(workflow: &Workflow, task_status: TaskStatus, persisted: bool) -> Self {
        let steps_done = workflow.done_count();
        let steps_total = workflow.steps.len();
        let progress = if steps_total == 0 {
            0.0
        } else {
            steps_done as f64 / steps_total as f64 * 100.0
        };
        let current_step = if task_status == TaskStatus::InProgress {
            workflow.next_step().map(|index| {
                let step = &workflow.steps[index];
                StepProgress {
                    index,
                    role: step.role.clone(),
                    action: step.action.clone(),
                    started_at: step.started_at,
                }
            })
        } else {
            None
        };
        Self {
            task_id: workflow.task_id.clone(),
            task_status,
            workflow_id: persisted.then(|| workflow.id.clone()),
            status: workflow.status(),
            steps_done,
            steps_total,
            progress,
            current_step,
        }
    }

    /// A task whose steps could not be resolved.
    pub fn unresolved(task_id: &str, task_status: TaskStatus) -> Self {
        let status = match task_status {
            TaskStatus::Pending => WorkflowStatus::Pending,
            TaskStatus::InProgress => WorkflowStatus::Running,
            TaskStatus::Completed => WorkflowStatus::Completed,
            TaskStatus::Failed | TaskStatus::Cancelled => WorkflowStatus::Failed,
        };
        Self {
            task_id: task_id.to_string(),
            task_status,
            workflow_id: None,
            status,
            steps_done: 0,
            steps_total: 0,
            progress: 0.0,
            current_step: None,
        }
    }
}

/// Built-in step sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowTemplate {
    Feature,
    Bugfix,
    Review,
    Refactor,
}

impl WorkflowTemplate {
    pub const ALL: [WorkflowTemplate; 4] = [Self::Feature, Self::Bugfix, Self::Review, Self::Refactor];

    /// Steps of the template.
    pub fn steps(self) -> Vec<StepSpec> {
        let pairs: &[(&str, &str)] = match self {
            Self::Feature => &[
                ("architect", "system_design"),
                ("developer", "code_implementation"),
                ("reviewer", "code_review"),
                ("tester", "unit_test_generation"),
                ("security", "security_analysis"),
                ("documenter", "documentation"),
            ],
            Self::Bugfix => &[
                ("developer", "bug_fix"),
                ("reviewer", "code_review"),
                ("tester", "unit_test_generation"),
            ],
            Self::Review => &[
                ("reviewer", "code_review"),
                ("optimizer", "performance_analysis"),
                ("security", "security_analysis"),
            ],
            Self::Refactor => &[
                ("architect", "architecture"),
                ("optimizer", "performance_analysis"),
                ("developer", "refactoring"),
                ("reviewer", "code_review"),
                ("tester", "unit_test_generation"),
            ],
        };
        pairs
            .iter()
            .map(|(role, action)| StepSpec::new(role, action))
            .collect()
    }
}

impl std::fmt::Display for WorkflowTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Feature => write!(f, "feature"),
            Self::Bugfix => write!(f, "bugfix"),
            Self::Review => write!(f, "review"),
            Self::Refactor => write!(f, "refactor"),
        }
    }
}

impl FromStr for WorkflowTemplate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "feature" => Ok(Self::Feature),
            "bugfix" => Ok(Self::Bugfix),
            "review" => Ok(Self::Review),
            "refactor" => Ok(Self::Refactor),
            other => Err(format!("unknown workflow template: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn workflow() -> Workflow {
        Workflow::new("task-1", WorkflowTemplate::Bugfix.steps())
    }

    #[test]
    fn test_status_is_derived() {
        let mut wf = workflow();
        assert_eq!(wf.status(), WorkflowStatus::Pending);

        wf.steps[0].start();
        assert_eq!(wf.status(), WorkflowStatus::Running);

        wf.steps[0].succeed(Value::String("patch".into()), Some("gpt-4o".into()), None);
        assert_eq!(wf.status(), WorkflowStatus::Running);
        assert_eq!(wf.next_step(), Some(1));

        wf.steps[1].fail(TaskError::new(ErrorKind::ProviderPermanent, "refused"));
        assert_eq!(wf.status(), WorkflowStatus::Failed);

        for step in &mut wf.steps {
            step.succeed(Value::Null, None, None);
        }
        assert_eq!(wf.status(), WorkflowStatus::Completed);
        assert_eq!(wf.next_step(), None);
    }

    #[test]
    fn test_previous_output() {
        let mut wf = workflow();
        assert_eq!(wf.previous_output(0), None);
        wf.steps[0].succeed(Value::String("patch".into()), None, None);
        assert_eq!(wf.previous_output(1).as_deref(), Some("patch"));
        assert_eq!(wf.previous_output(2).as_deref(), Some("patch"));

        wf.steps[1].succeed(serde_json::json!({"approved": true}), None, None);
        assert_eq!(
            wf.previous_output(2).as_deref(),
            Some(r#"{"approved":true}"#)
        );
    }

    #[test]
    fn test_reset_unfinished_keeps_done_steps() {
        let mut wf = workflow();
        wf.steps[0].succeed(Value::String("patch".into()), None, None);
        wf.steps[1].start();
        wf.steps[1].fail(TaskError::new(ErrorKind::Timeout, "slow"));

        wf.reset_unfinished();
        assert_eq!(wf.steps[0].status, StepStatus::Done);
        assert_eq!(wf.steps[1].status, StepStatus::Pending);
        assert_eq!(wf.next_step(), Some(1));
        assert_eq!(wf.status(), WorkflowStatus::Running);
    }

    #[test]
    fn test_progress_snapshot() {
        let mut wf = workflow();
        wf.steps[0].succeed(Value::String("patch".into()), None, None);
        wf.steps[1].start();

        let running = WorkflowProgress::from_workflow(&wf, TaskStatus::InProgress, true);
        assert_eq!(running.status, WorkflowStatus::Running);
        assert_eq!((running.steps_done, running.steps_total), (1, 3));
        assert!((running.progress - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(running.workflow_id.as_deref(), Some(wf.id.as_str()));
        let current = running.current_step.unwrap();
        assert_eq!((current.index, current.role.as_str()), (1, "reviewer"));
        assert!(current.started_at.is_some());

        wf.clear_running();
        assert_eq!(wf.steps[1].status, StepStatus::Pending);
        let cancelled = WorkflowProgress::from_workflow(&wf, TaskStatus::Cancelled, true);
        assert!(cancelled.current_step.is_none());

        let empty = WorkflowProgress::from_workflow(&Workflow::new("t", Vec::new()), TaskStatus::Pending, false);
        assert_eq!(empty.progress, 0.0);
        assert_eq!(empty.workflow_id, None);

        let unresolved = WorkflowProgress::unresolved("t", TaskStatus::Failed);
        assert_eq!(unresolved.status, WorkflowStatus::Failed);
        assert_eq!(unresolved.steps_total, 0);
    }

    #[test]
    fn test_default_collaboration_pairs() {
        let strategies = CollaborationStrategy::defaults();
        assert_eq!(strategies.len(), 4);
        assert_eq!(
            strategies["bug_fix"],
            CollaborationStrategy::new("claude-sonnet", "gemini-3-pro")
        );
        for strategy in strategies.values() {
            assert_ne!(strategy.leader, strategy.assistant);
        }
    }

    #[test]
    fn test_templates() {
        let feature = WorkflowTemplate::Feature.steps();
        assert_eq!(feature.len(), 6);
        assert_eq!(feature[0], StepSpec::new("architect", "system_design"));
        assert_eq!(feature[5], StepSpec::new("documenter", "documentation"));
        assert_eq!(WorkflowTemplate::Refactor.steps().len(), 5);
        assert_eq!(WorkflowTemplate::Review.steps()[1].role, "optimizer");

        for template in WorkflowTemplate::ALL {
            assert_eq!(template.to_string().parse::<WorkflowTemplate>(), Ok(template));
        }
        assert!("deploy".parse::<WorkflowTemplate>().is_err());
    }

    #[test]
    fn test_workflow_serde() {
        let mut wf = workflow();
        wf.steps[0].succeed(Value::String("patch".into()), Some("gpt-4o".into()), Some(Complexity::Medium));
        let value = serde_json::to_value(&wf).unwrap();
        assert_eq!(value["steps"][0]["status"], "done");
        let restored: Workflow = serde_json::from_value(value).unwrap();
        assert_eq!(restored, wf);
    }
}
