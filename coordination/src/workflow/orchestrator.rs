//! Workflow orchestrator
//!
//! Workers dequeue tasks, resolve the task's workflow, run its steps in order
//! through the agent invoker (or the debate runner), and settle the task in
//! the queue. Step progress is written back to task metadata when a step
//! starts and when it ends, so a retried task resumes at its first
//! unfinished step and [`Orchestrator::workflow_status`] can report it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{
    CollaborationStrategy, StepSpec, Workflow, WorkflowProgress, WorkflowTemplate, WORKFLOW_KEY,
    WORKFLOW_STATE_KEY, WORKFLOW_TEMPLATE_KEY,
};
use crate::agents::{AgentError, AgentRegistry, AgentRequest, ProviderError, SharedInvoker};
use crate::debate::{DebateError, DebateRequest, DebateRunner, Participant, DEFAULT_MAX_ROUNDS};
use crate::error::{ErrorKind, TaskError};
use crate::events::{topics, Event, SharedEventBus};
use crate::queue::{
    NewTask, QueueError, RequeueOutcome, SharedTaskQueue, Task, TaskId, TaskStatus,
};
use crate::router::Complexity;

const ORIGIN: &str = "orchestrator";

/// Error type for orchestrator operations
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Debate(#[from] DebateError),

    #[error("Service degraded: {0}")]
    Degraded(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl OrchestratorError {
    /// Whether the failure came from an unreachable store
    pub fn is_storage_unavailable(&self) -> bool {
        match self {
            Self::Queue(e) => e.is_storage_unavailable(),
            Self::Degraded(_) => true,
            _ => false,
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Worker tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Idle wait between dequeue attempts when no notification arrives
    pub poll_interval: Duration,
    /// Claim refresh period while a step runs
    pub heartbeat_interval: Duration,
    /// Step time budget for tasks without `timeout_secs`
    pub default_step_timeout: Duration,
    /// Panel used by `debate` steps
    pub debate_participants: Vec<Participant>,
    pub debate_rounds: u32,
    /// Steps whose action is listed here run leader then assistant.
    pub collaboration: BTreeMap<String, CollaborationStrategy>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(10),
            default_step_timeout: Duration::from_secs(300),
            debate_participants: Participant::default_panel(),
            debate_rounds: DEFAULT_MAX_ROUNDS,
            collaboration: BTreeMap::new(),
        }
    }
}

/// How a claimed task was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed,
    Requeued { retry_count: u32 },
    Cancelled,
    /// Handed back on shutdown without a retry penalty.
    Released,
    /// The claim was taken away mid-run (reclaimed or cancelled elsewhere).
    Lost,
}

/// Result of [`Orchestrator::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was not running here and is now cancelled in the queue.
    Cancelled,
    /// The local worker running it was signalled.
    Signalled,
}

/// Per-worker tallies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub completed: usize,
    pub failed: usize,
    pub requeued: usize,
    pub cancelled: usize,
    pub released: usize,
    pub lost: usize,
    /// Loop iterations that ended in an error.
    pub errors: usize,
}

impl WorkerReport {
    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => self.completed += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::Requeued { .. } => self.requeued += 1,
            TaskOutcome::Cancelled => self.cancelled += 1,
            TaskOutcome::Released => self.released += 1,
            TaskOutcome::Lost => self.lost += 1,
        }
    }

    /// Tasks settled by this worker
    pub fn processed(&self) -> usize {
        self.completed + self.failed + self.requeued + self.cancelled + self.released + self.lost
    }
}

struct StepOutput {
    result: Value,
    model: Option<String>,
    complexity: Option<Complexity>,
}

enum StepFailure {
    Error(TaskError),
    /// The task's cancellation token fired.
    Interrupted,
    Lost(QueueError),
}

/// Shared reference to an orchestrator
pub type SharedOrchestrator = Arc<Orchestrator>;

/// Queue consumer that executes workflows
pub struct Orchestrator {
    queue: SharedTaskQueue,
    events: SharedEventBus,
    invoker: SharedInvoker,
    registry: Arc<AgentRegistry>,
    debate: Option<Arc<DebateRunner>>,
    config: OrchestratorConfig,
    running: Mutex<HashMap<TaskId, CancellationToken>>,
    degraded: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        queue: SharedTaskQueue,
        events: SharedEventBus,
        invoker: SharedInvoker,
        registry: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            queue,
            events,
            invoker,
            registry,
            debate: None,
            config: OrchestratorConfig::default(),
            running: Mutex::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Enable `debate` steps
    pub fn with_debate(mut self, runner: Arc<DebateRunner>) -> Self {
        self.debate = Some(runner);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn shared(self) -> SharedOrchestrator {
        Arc::new(self)
    }

    pub fn queue(&self) -> &SharedTaskQueue {
        &self.queue
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Whether submissions are currently rejected because the store is down
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Validate and enqueue a task, then announce it
    pub fn submit(&self, new: NewTask) -> OrchestratorResult<TaskId> {
        self.ensure_available()?;

        let title = new.title.clone();
        let task_type = new.task_type.clone();
        let priority = new.priority;
        let task_id = match self.queue.enqueue(new) {
            Ok(id) => id,
            Err(e) if e.is_storage_unavailable() => {
                self.enter_degraded(&e.to_string());
                return Err(OrchestratorError::Degraded(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        self.publish(
            topics::TASK_CREATED,
            &task_id,
            json!({ "title": title, "task_type": task_type, "priority": priority }),
        );
        self.publish(topics::TASK_AVAILABLE, &task_id, json!({ "reason": "created" }));
        Ok(task_id)
    }

    /// Attach an ordered list of steps to a pending task
    pub fn submit_workflow(&self, task_id: &str, steps: Vec<StepSpec>) -> OrchestratorResult<()> {
        if steps.is_empty() {
            return Err(OrchestratorError::Validation(
                "workflow has no steps".to_string(),
            ));
        }
        for step in &steps {
            if step.is_debate() {
                if self.debate.is_none() {
                    return Err(OrchestratorError::Validation(
                        "debate step submitted but no debate runner is configured".to_string(),
                    ));
                }
            } else if !self.registry.contains(&step.role) {
                return Err(OrchestratorError::Validation(format!(
                    "unknown agent role: {}",
                    step.role
                )));
            }
        }

        let value = serde_json::to_value(&steps)
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;
        self.queue
            .update_pending_metadata(task_id, WORKFLOW_KEY, value)?;
        info!(task_id, steps = steps.len(), "Workflow attached");
        Ok(())
    }

    /// Cancel a task: signal the local worker running it, or cancel it in
    /// the queue directly.
    pub fn cancel(&self, task_id: &str) -> OrchestratorResult<CancelOutcome> {
        let token = self.running().get(task_id).cloned();
        if let Some(token) = token {
            token.cancel();
            info!(task_id, "Cancellation signalled to worker");
            return Ok(CancelOutcome::Signalled);
        }

        self.queue.cancel(task_id, "cancelled by request")?;
        self.publish(topics::TASK_CANCELLED, task_id, json!({ "reason": "cancelled by request" }));
        Ok(CancelOutcome::Cancelled)
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Spawn `count` workers named `{prefix}-{n}` that stop when `shutdown`
    /// fires
    pub fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        prefix: &str,
        shutdown: &CancellationToken,
    ) -> Vec<JoinHandle<WorkerReport>> {
        (0..count)
            .map(|n| {
                let orchestrator = Arc::clone(self);
                let worker_id = format!("{}-{}", prefix, n);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { orchestrator.run_worker(&worker_id, shutdown).await })
            })
            .collect()
    }

    /// Process tasks until `shutdown` fires. In-flight tasks are released
    /// back to the queue on shutdown.
    pub async fn run_worker(&self, worker_id: &str, shutdown: CancellationToken) -> WorkerReport {
        let mut notifications = self.events.subscribe_raw();
        let mut report = WorkerReport::default();
        info!(worker_id, "Worker started");

        while !shutdown.is_cancelled() {
            match self.process_one(worker_id, &shutdown).await {
                Ok(Some(outcome)) => {
                    self.mark_recovered();
                    report.record(outcome);
                    continue;
                }
                Ok(None) => self.mark_recovered(),
                Err(e) => {
                    if e.is_storage_unavailable() {
                        self.enter_degraded(&e.to_string());
                    }
                    warn!(worker_id, error = %e, "Worker iteration failed");
                    report.errors += 1;
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = wait_for_available(&mut notifications) => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker_id, processed = report.processed(), "Worker stopped");
        report
    }

    /// Claim and run at most one task. `Ok(None)` when nothing is available.
    pub async fn process_one(
        &self,
        worker_id: &str,
        shutdown: &CancellationToken,
    ) -> OrchestratorResult<Option<TaskOutcome>> {
        let Some(task) = self.queue.dequeue(worker_id)? else {
            return Ok(None);
        };

        info!(task_id = %task.id, worker_id, retry_count = task.retry_count, "Task claimed");
        self.publish(
            topics::TASK_STARTED,
            &task.id,
            json!({ "worker_id": worker_id, "retry_count": task.retry_count, "title": task.title }),
        );

        let token = shutdown.child_token();
        self.running().insert(task.id.clone(), token.clone());
        let result = self.execute(&task, worker_id, &token).await;
        self.running().remove(&task.id);

        self.settle(&task, worker_id, result, shutdown).map(Some)
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Where a task's workflow stands: derived status, percent of steps
    /// done and the step being run.
    pub fn workflow_status(&self, task_id: &str) -> OrchestratorResult<WorkflowProgress> {
        let task = self.queue.get(task_id)?;

        let Some(state) = task.metadata.get(WORKFLOW_STATE_KEY) else {
            return Ok(match self.resolve_workflow(&task) {
                Ok(planned) => WorkflowProgress::from_workflow(&planned, task.status, false),
                Err(_) => WorkflowProgress::unresolved(&task.id, task.status),
            });
        };

        let mut workflow: Workflow = serde_json::from_value(state.clone()).map_err(|e| {
            OrchestratorError::Queue(QueueError::Corrupted(format!(
                "workflow state of {}: {}",
                task.id, e
            )))
        })?;
        match task.status {
            TaskStatus::InProgress => {}
            TaskStatus::Pending => workflow.reset_unfinished(),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                workflow.clear_running()
            }
        }
        Ok(WorkflowProgress::from_workflow(&workflow, task.status, true))
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn resolve_workflow(&self, task: &Task) -> Result<Workflow, TaskError> {
        let invalid = |message: String| TaskError::new(ErrorKind::Validation, message);

        if let Some(state) = task.metadata.get(WORKFLOW_STATE_KEY) {
            let mut workflow: Workflow = serde_json::from_value(state.clone())
                .map_err(|e| invalid(format!("corrupt workflow state: {}", e)))?;
            workflow.reset_unfinished();
            return Ok(workflow);
        }

        let specs = if let Some(value) = task.metadata.get(WORKFLOW_KEY) {
            serde_json::from_value::<Vec<StepSpec>>(value.clone())
                .map_err(|e| invalid(format!("invalid workflow: {}", e)))?
        } else if let Some(value) = task.metadata.get(WORKFLOW_TEMPLATE_KEY) {
            let name = value
                .as_str()
                .ok_or_else(|| invalid("workflow_template must be a string".to_string()))?;
            name.parse::<WorkflowTemplate>().map_err(invalid)?.steps()
        } else {
            let role = match &task.assigned_agent {
                Some(role) => role.clone(),
                None => self
                    .registry
                    .role_for_task_type(&task.task_type)
                    .ok_or_else(|| invalid(format!("no agent for task type {}", task.task_type)))?,
            };
            vec![StepSpec {
                role,
                action: task.task_type.clone(),
            }]
        };

        if specs.is_empty() {
            return Err(invalid("workflow has no steps".to_string()));
        }
        Ok(Workflow::new(&task.id, specs))
    }

    async fn execute(
        &self,
        task: &Task,
        worker_id: &str,
        token: &CancellationToken,
    ) -> Result<Value, StepFailure> {
        let mut workflow = self.resolve_workflow(task).map_err(StepFailure::Error)?;
        if workflow.done_count() > 0 {
            info!(task_id = %task.id, done = workflow.done_count(), "Resuming workflow");
        }

        while let Some(index) = workflow.next_step() {
            if token.is_cancelled() {
                return Err(StepFailure::Interrupted);
            }
            let spec = workflow.steps[index].spec();
            let previous = workflow.previous_output(index);
            workflow.steps[index].start();
            self.persist(task, worker_id, &workflow)?;
            self.publish(
                topics::STEP_STARTED,
                &task.id,
                json!({
                    "workflow_id": workflow.id,
                    "index": index,
                    "role": spec.role,
                    "action": spec.action,
                }),
            );

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(StepFailure::Interrupted),
                result = self.run_step(task, worker_id, &spec, previous, token) => result,
            };

            match outcome {
                Ok(output) => {
                    let step = &mut workflow.steps[index];
                    step.succeed(output.result, output.model, output.complexity);
                    let payload = json!({
                        "workflow_id": workflow.id,
                        "index": index,
                        "role": spec.role,
                        "action": spec.action,
                        "model": workflow.steps[index].model,
                        "complexity": workflow.steps[index].complexity,
                    });
                    self.persist(task, worker_id, &workflow)?;
                    self.publish(topics::STEP_COMPLETED, &task.id, payload);
                }
                Err(StepFailure::Error(error)) => {
                    workflow.steps[index].fail(error.clone());
                    if let Err(StepFailure::Lost(e)) = self.persist(task, worker_id, &workflow) {
                        debug!(task_id = %task.id, error = %e, "Could not persist failed step");
                    }
                    self.publish(
                        topics::STEP_FAILED,
                        &task.id,
                        json!({
                            "workflow_id": workflow.id,
                            "index": index,
                            "role": spec.role,
                            "action": spec.action,
                            "error": error,
                        }),
                    );
                    return Err(StepFailure::Error(error));
                }
                Err(other) => return Err(other),
            }
        }

        Ok(workflow.result_value())
    }

    /// Write workflow progress back to task metadata.
    fn persist(&self, task: &Task, worker_id: &str, workflow: &Workflow) -> Result<(), StepFailure> {
        let value = serde_json::to_value(workflow).map_err(|e| {
            StepFailure::Error(TaskError::new(ErrorKind::Validation, e.to_string()))
        })?;
        self.queue
            .update_metadata(&task.id, worker_id, WORKFLOW_STATE_KEY, value)
            .map_err(StepFailure::Lost)?;
        Ok(())
    }

    /// Run one step under its time budget, refreshing the claim meanwhile.
    async fn run_step(
        &self,
        task: &Task,
        worker_id: &str,
        spec: &StepSpec,
        previous: Option<String>,
        token: &CancellationToken,
    ) -> Result<StepOutput, StepFailure> {
        let timeout = task
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_step_timeout);

        let call = self.call_step(task, spec, previous, token);
        tokio::pin!(call);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(
            self.config
                .heartbeat_interval
                .max(Duration::from_millis(1)),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut call => return result.map_err(StepFailure::Error),
                _ = &mut deadline => {
                    warn!(task_id = %task.id, role = %spec.role, timeout_secs = timeout.as_secs(), "Step timed out");
                    return Err(StepFailure::Error(
                        TaskError::new(
                            ErrorKind::Timeout,
                            format!("step {}/{} exceeded {}s", spec.role, spec.action, timeout.as_secs()),
                        )
                        .with_context("role", spec.role.clone())
                        .with_context("action", spec.action.clone()),
                    ));
                }
                _ = ticker.tick() => match self.queue.heartbeat(&task.id, worker_id) {
                    Ok(_) => debug!(task_id = %task.id, worker_id, "Heartbeat"),
                    Err(e) if e.is_storage_unavailable() => {
                        warn!(task_id = %task.id, error = %e, "Heartbeat failed, store unavailable");
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, worker_id, error = %e, "Claim lost");
                        return Err(StepFailure::Lost(e));
                    }
                },
            }
        }
    }

    async fn call_step(
        &self,
        task: &Task,
        spec: &StepSpec,
        previous: Option<String>,
        token: &CancellationToken,
    ) -> Result<StepOutput, TaskError> {
        if spec.is_debate() {
            return self.debate_step(task, token).await;
        }
        if let Some(strategy) = self.config.collaboration.get(&spec.action) {
            return self.collaborative_step(task, spec, previous, strategy).await;
        }

        let request = agent_request(task, spec, previous, None);
        let output = self.invoker.invoke(&request).await.map_err(|e| {
            TaskError::from(e)
                .with_context("role", spec.role.clone())
                .with_context("action", spec.action.clone())
        })?;

        Ok(StepOutput {
            result: Value::String(output.content),
            model: Some(output.model),
            complexity: Some(output.complexity),
        })
    }

    /// Leader works the step, then the assistant reviews the leader's output.
    async fn collaborative_step(
        &self,
        task: &Task,
        spec: &StepSpec,
        previous: Option<String>,
        strategy: &CollaborationStrategy,
    ) -> Result<StepOutput, TaskError> {
        debug!(task_id = %task.id, action = %spec.action, leader = %strategy.leader, "Collaborative step, leader");
        let request = agent_request(task, spec, previous, Some(&strategy.leader));
        let leader = self
            .invoker
            .invoke(&request)
            .await
            .map_err(|e| collaboration_error(e, spec, "leader", &strategy.leader))?;

        debug!(task_id = %task.id, action = %spec.action, assistant = %strategy.assistant, "Collaborative step, assistant");
        let request = agent_request(task, spec, Some(leader.content.clone()), Some(&strategy.assistant));
        let assistant = self
            .invoker
            .invoke(&request)
            .await
            .map_err(|e| collaboration_error(e, spec, "assistant", &strategy.assistant))?;

        Ok(StepOutput {
            result: json!({
                "source": "collaborative",
                "leader": { "model": leader.model, "content": leader.content },
                "assistant": { "model": assistant.model, "content": assistant.content },
            }),
            model: Some(leader.model),
            complexity: Some(leader.complexity),
        })
    }

    async fn debate_step(&self, task: &Task, token: &CancellationToken) -> Result<StepOutput, TaskError> {
        let runner = self.debate.as_ref().ok_or_else(|| {
            TaskError::new(ErrorKind::Validation, "no debate runner configured")
        })?;

        let topic = if task.description.trim().is_empty() {
            task.title.clone()
        } else {
            format!("{}\n\n{}", task.title, task.description)
        };
        let request = DebateRequest::new(topic, self.config.debate_participants.clone())
            .with_max_rounds(self.config.debate_rounds)
            .correlated(&task.id);

        let outcome = runner.execute(request, token).await?;
        let synthesis = &outcome.synthesis;
        Ok(StepOutput {
            result: json!({
                "debate_id": outcome.session.id,
                "rounds": outcome.session.rounds.len(),
                "recommendation": synthesis.recommendation,
                "next_steps": synthesis.next_steps,
                "consensual": synthesis.consensual,
                "confidence": synthesis.confidence,
            }),
            model: None,
            complexity: None,
        })
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    fn settle(
        &self,
        task: &Task,
        worker_id: &str,
        result: Result<Value, StepFailure>,
        shutdown: &CancellationToken,
    ) -> OrchestratorResult<TaskOutcome> {
        let task_id = task.id.as_str();
        let settled = match result {
            Ok(value) => self.queue.complete(task_id, worker_id, value).map(|_| {
                info!(task_id, worker_id, "Task completed");
                self.publish(topics::TASK_COMPLETED, task_id, json!({ "worker_id": worker_id }));
                TaskOutcome::Completed
            }),
            Err(StepFailure::Error(error)) if error.retryable => self
                .queue
                .requeue(task_id, Some(worker_id), Some(error.clone()))
                .map(|outcome| match outcome {
                    RequeueOutcome::Requeued {
                        retry_count,
                        available_at,
                    } => {
                        self.publish(
                            topics::TASK_REQUEUED,
                            task_id,
                            json!({
                                "retry_count": retry_count,
                                "available_at": available_at,
                                "error": error,
                            }),
                        );
                        self.publish(topics::TASK_AVAILABLE, task_id, json!({ "reason": "requeued" }));
                        TaskOutcome::Requeued { retry_count }
                    }
                    RequeueOutcome::Exhausted { retry_count } => {
                        self.publish(
                            topics::TASK_FAILED,
                            task_id,
                            json!({
                                "worker_id": worker_id,
                                "retries_exhausted": true,
                                "retry_count": retry_count,
                                "error": error,
                            }),
                        );
                        TaskOutcome::Failed
                    }
                }),
            Err(StepFailure::Error(error)) => self
                .queue
                .fail(task_id, worker_id, error.clone())
                .map(|_| {
                    self.publish(
                        topics::TASK_FAILED,
                        task_id,
                        json!({ "worker_id": worker_id, "error": error }),
                    );
                    TaskOutcome::Failed
                }),
            Err(StepFailure::Interrupted) if shutdown.is_cancelled() => {
                self.queue.release(task_id, worker_id).map(|_| {
                    self.publish(topics::TASK_AVAILABLE, task_id, json!({ "reason": "released" }));
                    TaskOutcome::Released
                })
            }
            Err(StepFailure::Interrupted) => self
                .queue
                .cancel(task_id, "cancelled by request")
                .map(|_| {
                    self.publish(
                        topics::TASK_CANCELLED,
                        task_id,
                        json!({ "worker_id": worker_id, "reason": "cancelled by request" }),
                    );
                    TaskOutcome::Cancelled
                }),
            Err(StepFailure::Lost(e)) => Err(e),
        };

        match settled {
            Ok(outcome) => Ok(outcome),
            Err(e @ QueueError::Conflict { .. }) => {
                warn!(task_id, worker_id, error = %e, "Claim lost before settling");
                Ok(TaskOutcome::Lost)
            }
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn running(&self) -> MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> OrchestratorResult<()> {
        if !self.is_degraded() {
            return Ok(());
        }
        match self.queue.health_check() {
            Ok(()) => {
                self.mark_recovered();
                Ok(())
            }
            Err(e) => Err(OrchestratorError::Degraded(e.to_string())),
        }
    }

    fn enter_degraded(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(reason, "Store unavailable, entering degraded mode");
            self.events.publish(
                Event::new(
                    topics::SERVICE_DEGRADED,
                    json!({ "component": "store", "reason": reason }),
                )
                .from_origin(ORIGIN),
            );
        }
    }

    fn mark_recovered(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!("Store reachable again, leaving degraded mode");
            self.events.publish(
                Event::new(topics::SERVICE_RECOVERED, json!({ "component": "store" }))
                    .from_origin(ORIGIN),
            );
        }
    }

    fn publish(&self, topic: &str, task_id: &str, mut payload: Value) {
        if let Value::Object(map) = &mut payload {
            map.insert("task_id".to_string(), Value::String(task_id.to_string()));
        }
        self.events.publish(
            Event::new(topic, payload)
                .from_origin(ORIGIN)
                .correlated(task_id),
        );
    }
}

/// Resolve once a `task.available` notification arrives. Lag counts as a
/// notification; a closed bus never resolves.
fn agent_request(
    task: &Task,
    spec: &StepSpec,
    previous: Option<String>,
    model_override: Option<&str>,
) -> AgentRequest {
    AgentRequest {
        role: spec.role.clone(),
        action: spec.action.clone(),
        title: task.title.clone(),
        description: task.description.clone(),
        task_type: task.task_type.clone(),
        previous_output: previous,
        model_override: model_override.map(str::to_string),
    }
}

fn collaboration_error(err: AgentError, spec: &StepSpec, part: &str, model: &str) -> TaskError {
    TaskError::from(err)
        .with_context("role", spec.role.clone())
        .with_context("action", spec.action.clone())
        .with_context("collaboration", part)
        .with_context("model", model)
}

async fn wait_for_available(notifications: &mut broadcast::Receiver<Event>) {
    loop {
        match notifications.recv().await {
            Ok(event) if event.topic == topics::TASK_AVAILABLE => return,
            Ok(_) => continue,
            Err(RecvError::Lagged(_)) => return,
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentError, AgentInvoker, AgentOutput};
    use crate::debate::{DebateReply, RecordedResponder};
    use crate::events::{EventBus, HistoryQuery};
    use crate::queue::{
        MemoryStore, Priority, QueueConfig, SharedTaskStore, StoreError, StoreResult, TaskMutation,
        TaskQueue, TaskStatus, TaskStore,
    };
    use crate::workflow::WorkflowStatus;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicUsize;

    /// Invoker that answers from a script, one entry per call.
    struct ScriptedInvoker {
        script: Mutex<Vec<Result<String, AgentError>>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<AgentRequest>>,
    }

    impl ScriptedInvoker {
        fn new(script: Vec<Result<String, AgentError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().rev().collect()),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn ok(n: usize) -> Arc<Self> {
            Self::new((0..n).map(|i| Ok(format!("output {}", i))).collect())
        }
    }

    #[async_trait]
    impl AgentInvoker for ScriptedInvoker {
        async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok("extra".to_string()));
            next.map(|content| AgentOutput {
                role: request.role.clone(),
                model: request
                    .model_override
                    .clone()
                    .unwrap_or_else(|| format!("{}-model", request.role)),
                complexity: Complexity::Medium,
                content,
                latency_ms: 1,
            })
        }
    }

    fn setup(invoker: Arc<ScriptedInvoker>) -> (Orchestrator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (over_store(store.clone(), invoker), store)
    }

    fn over_store(store: SharedTaskStore, invoker: Arc<ScriptedInvoker>) -> Orchestrator {
        let config = QueueConfig {
            backoff: crate::queue::BackoffPolicy {
                base: Duration::ZERO,
                max: Duration::ZERO,
            },
            ..QueueConfig::default()
        };
        let queue = TaskQueue::new(store, config).shared();
        Orchestrator::new(
            queue,
            EventBus::new().shared(),
            invoker,
            Arc::new(AgentRegistry::with_defaults()),
        )
    }

    /// Store whose pending records no longer decode.
    struct CorruptStore(MemoryStore);

    impl TaskStore for CorruptStore {
        fn insert(&self, task: &Task) -> StoreResult<()> {
            self.0.insert(task)
        }
        fn get(&self, task_id: &str) -> StoreResult<Option<Task>> {
            self.0.get(task_id)
        }
        fn claim_next(&self, _worker_id: &str, _now: DateTime<Utc>) -> StoreResult<Option<Task>> {
            Err(StoreError::Deserialization("expected value at line 1 column 1".into()))
        }
        fn update(&self, task_id: &str, apply: TaskMutation<'_>) -> Result<Task, QueueError> {
            self.0.update(task_id, apply)
        }
        fn scan(&self, status: Option<TaskStatus>) -> StoreResult<Vec<Task>> {
            self.0.scan(status)
        }
        fn remove(&self, task_id: &str) -> StoreResult<bool> {
            self.0.remove(task_id)
        }
        fn next_sequence(&self) -> StoreResult<u64> {
            self.0.next_sequence()
        }
        fn health_check(&self) -> StoreResult<()> {
            self.0.health_check()
        }
    }

    fn topics_for(orchestrator: &Orchestrator, task_id: &str) -> Vec<String> {
        orchestrator
            .events()
            .history(&HistoryQuery::new().correlation(task_id))
            .into_iter()
            .map(|e| e.topic)
            .collect()
    }

    #[tokio::test]
    async fn test_single_step_task_completes() {
        let invoker = ScriptedInvoker::ok(1);
        let (orchestrator, _) = setup(invoker.clone());
        let id = orchestrator
            .submit(NewTask::new("Review PR 42", Priority::High).with_type("code_review"))
            .unwrap();

        let outcome = orchestrator
            .process_one("w1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Some(TaskOutcome::Completed));

        let task = orchestrator.queue().get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_ref().unwrap()["output"], "output 0");
        assert_eq!(invoker.seen.lock().unwrap()[0].role, "reviewer");

        assert_eq!(
            topics_for(&orchestrator, &id),
            vec![
                "task.created",
                "task.available",
                "task.started",
                "step.started",
                "step.completed",
                "task.completed",
            ]
        );
    }

    #[tokio::test]
    async fn test_previous_output_flows_between_steps() {
        let invoker = ScriptedInvoker::ok(3);
        let (orchestrator, _) = setup(invoker.clone());
        let id = orchestrator
            .submit(NewTask::new("Fix login", Priority::Medium).with_metadata("workflow_template", "bugfix"))
            .unwrap();

        orchestrator
            .process_one("w1", &CancellationToken::new())
            .await
            .unwrap();

        let seen = invoker.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].action, "bug_fix");
        assert_eq!(seen[0].previous_output, None);
        assert_eq!(seen[1].previous_output.as_deref(), Some("output 0"));
        assert_eq!(seen[2].previous_output.as_deref(), Some("output 1"));
        assert_eq!(
            orchestrator.queue().get(&id).unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_and_resumes() {
        let invoker = ScriptedInvoker::new(vec![
            Ok("design".into()),
            Err(AgentError::Provider(ProviderError::Transient("rate limited".into()))),
            Ok("code".into()),
        ]);
        let (orchestrator, _) = setup(invoker.clone());
        let id = orchestrator
            .submit(NewTask::new("Add endpoint", Priority::Medium).with_type("feature"))
            .unwrap();
        orchestrator
            .submit_workflow(
                &id,
                vec![
                    StepSpec::new("architect", "system_design"),
                    StepSpec::new("developer", "code_implementation"),
                ],
            )
            .unwrap();

        let token = CancellationToken::new();
        let first = orchestrator.process_one("w1", &token).await.unwrap();
        assert_eq!(first, Some(TaskOutcome::Requeued { retry_count: 1 }));

        let task = orchestrator.queue().get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.last_error.unwrap().kind, ErrorKind::ProviderTransient);

        let second = orchestrator.process_one("w2", &token).await.unwrap();
        assert_eq!(second, Some(TaskOutcome::Completed));

        // The architect step was not re-run.
        let seen = invoker.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].role, "developer");
        assert_eq!(seen[2].previous_output.as_deref(), Some("design"));
    }

    #[tokio::test]
    async fn test_unavailable_provider_fails_task() {
        let invoker = ScriptedInvoker::new(vec![Err(AgentError::Unavailable {
            model: "gpt-4o".into(),
            reason: "no provider".into(),
        })]);
        let (orchestrator, _) = setup(invoker);
        let id = orchestrator
            .submit(NewTask::new("Add caching layer", Priority::Medium))
            .unwrap();

        let outcome = orchestrator
            .process_one("w1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Some(TaskOutcome::Failed));

        let task = orchestrator.queue().get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.unwrap().kind, ErrorKind::ProviderUnavailable);
        assert!(topics_for(&orchestrator, &id).contains(&"step.failed".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_template_fails_without_calls() {
        let invoker = ScriptedInvoker::ok(1);
        let (orchestrator, _) = setup(invoker.clone());
        let id = orchestrator
            .submit(NewTask::new("x", Priority::Low).with_metadata("workflow_template", "deploy"))
            .unwrap();
        orchestrator
            .process_one("w1", &CancellationToken::new())
            .await
            .unwrap();
        let task = orchestrator.queue().get(&id).unwrap();
        assert_eq!(task.last_error.unwrap().kind, ErrorKind::Validation);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_submit_workflow_validation() {
        let (orchestrator, _) = setup(ScriptedInvoker::ok(0));
        let id = orchestrator
            .submit(NewTask::new("x", Priority::Low))
            .unwrap();

        assert!(matches!(
            orchestrator.submit_workflow(&id, vec![]),
            Err(OrchestratorError::Validation(_))
        ));
        assert!(matches!(
            orchestrator.submit_workflow(&id, vec![StepSpec::new("wizard", "magic")]),
            Err(OrchestratorError::Validation(_))
        ));
        assert!(matches!(
            orchestrator.submit_workflow(&id, vec![StepSpec::new("panel", "debate")]),
            Err(OrchestratorError::Validation(_))
        ));
        assert!(matches!(
            orchestrator.submit_workflow("missing", vec![StepSpec::new("developer", "x")]),
            Err(OrchestratorError::Queue(QueueError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let (orchestrator, _) = setup(ScriptedInvoker::ok(0));
        let id = orchestrator
            .submit(NewTask::new("x", Priority::Low))
            .unwrap();
        assert_eq!(orchestrator.cancel(&id).unwrap(), CancelOutcome::Cancelled);
        assert_eq!(
            orchestrator.queue().get(&id).unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(
            orchestrator
                .process_one("w1", &CancellationToken::new())
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_degraded_mode() {
        let (orchestrator, store) = setup(ScriptedInvoker::ok(0));
        store.set_available(false);

        let err = orchestrator
            .submit(NewTask::new("x", Priority::Low))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Degraded(_)));
        assert!(orchestrator.is_degraded());

        store.set_available(true);
        orchestrator
            .submit(NewTask::new("y", Priority::Low))
            .unwrap();
        assert!(!orchestrator.is_degraded());

        let topics: Vec<String> = orchestrator
            .events()
            .history(&HistoryQuery::new().topic("service.*"))
            .into_iter()
            .map(|e| e.topic)
            .collect();
        assert_eq!(topics, vec!["service.degraded", "service.recovered"]);
    }

    #[tokio::test]
    async fn test_debate_step() {
        let responder = RecordedResponder::new()
            .reply("a", 1, DebateReply::plain("Use Redis"))
            .reply(
                "a",
                2,
                DebateReply {
                    content: "Redis".into(),
                    agrees_with: vec!["b".into()],
                    disagrees_with: vec![],
                    confidence: 80,
                },
            )
            .reply("b", 1, DebateReply::plain("Use Redis too"))
            .reply(
                "b",
                2,
                DebateReply {
                    content: "Redis, agreed".into(),
                    agrees_with: vec!["a".into()],
                    disagrees_with: vec![],
                    confidence: 90,
                },
            );
        let (orchestrator, _) = setup(ScriptedInvoker::ok(0));
        let orchestrator = orchestrator
            .with_debate(Arc::new(DebateRunner::new(Arc::new(responder))))
            .with_config(OrchestratorConfig {
                debate_participants: vec![
                    Participant::new("a", "architecture", "m1"),
                    Participant::new("b", "implementation", "m2"),
                ],
                ..OrchestratorConfig::default()
            });

        let id = orchestrator
            .submit(NewTask::new("Choose a cache", Priority::High))
            .unwrap();
        orchestrator
            .submit_workflow(&id, vec![StepSpec::new("panel", "debate")])
            .unwrap();
        orchestrator
            .process_one("w1", &CancellationToken::new())
            .await
            .unwrap();

        let task = orchestrator.queue().get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let output = &task.result.unwrap()["output"];
        assert_eq!(output["consensual"], true);
        assert_eq!(output["recommendation"], "Redis, agreed");
    }
    #[tokio::test]
    async fn test_workflow_status_follows_execution() {
        let invoker = ScriptedInvoker::new(vec![
            Ok("design".into()),
            Err(AgentError::Provider(ProviderError::Transient("rate limited".into()))),
            Ok("code".into()),
        ]);
        let (orchestrator, _) = setup(invoker);
        let id = orchestrator
            .submit(NewTask::new("Add endpoint", Priority::Medium))
            .unwrap();
        orchestrator
            .submit_workflow(
                &id,
                vec![
                    StepSpec::new("architect", "system_design"),
                    StepSpec::new("developer", "code_implementation"),
                ],
            )
            .unwrap();

        let planned = orchestrator.workflow_status(&id).unwrap();
        assert_eq!(planned.status, WorkflowStatus::Pending);
        assert_eq!((planned.steps_done, planned.steps_total), (0, 2));
        assert_eq!(planned.workflow_id, None);
        assert!(planned.current_step.is_none());

        let token = CancellationToken::new();
        orchestrator.process_one("w1", &token).await.unwrap();
        let requeued = orchestrator.workflow_status(&id).unwrap();
        assert_eq!(requeued.task_status, TaskStatus::Pending);
        assert_eq!(requeued.status, WorkflowStatus::Running);
        assert_eq!(requeued.progress, 50.0);
        assert!(requeued.workflow_id.is_some());
        assert!(requeued.current_step.is_none());

        orchestrator.process_one("w2", &token).await.unwrap();
        let done = orchestrator.workflow_status(&id).unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.progress, 100.0);
        assert_eq!(done.workflow_id, requeued.workflow_id);

        assert!(matches!(
            orchestrator.workflow_status("missing"),
            Err(OrchestratorError::Queue(QueueError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_status_of_task_without_resolvable_steps() {
        let (orchestrator, _) = setup(ScriptedInvoker::ok(0));
        let id = orchestrator
            .submit(NewTask::new("x", Priority::Low).with_metadata("workflow_template", "deploy"))
            .unwrap();
        let status = orchestrator.workflow_status(&id).unwrap();
        assert_eq!(status.status, WorkflowStatus::Pending);
        assert_eq!(status.steps_total, 0);
        assert_eq!(status.progress, 0.0);
    }

    #[tokio::test]
    async fn test_collaborative_step_runs_leader_then_assistant() {
        let invoker = ScriptedInvoker::new(vec![
            Ok("patch".into()),
            Ok("patch looks right".into()),
            Ok("approved".into()),
        ]);
        let (orchestrator, _) = setup(invoker.clone());
        let orchestrator = orchestrator.with_config(OrchestratorConfig {
            collaboration: [("bug_fix".to_string(), CollaborationStrategy::new("lead-m", "assist-m"))]
                .into_iter()
                .collect(),
            ..OrchestratorConfig::default()
        });
        let id = orchestrator
            .submit(
                NewTask::new("Fix login", Priority::Medium)
                    .with_metadata("workflow", json!([
                        {"role": "developer", "action": "bug_fix"},
                        {"role": "reviewer", "action": "code_review"},
                    ])),
            )
            .unwrap();

        let outcome = orchestrator
            .process_one("w1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Some(TaskOutcome::Completed));

        let seen = invoker.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].model_override.as_deref(), Some("lead-m"));
        assert_eq!(seen[0].previous_output, None);
        assert_eq!(seen[1].model_override.as_deref(), Some("assist-m"));
        assert_eq!(seen[1].previous_output.as_deref(), Some("patch"));
        // Steps without a strategy are routed as usual.
        assert_eq!(seen[2].model_override, None);
        assert!(seen[2].previous_output.as_deref().unwrap().contains("patch looks right"));

        let result = orchestrator.queue().get(&id).unwrap().result.unwrap();
        let step = &result["steps"][0];
        assert_eq!(step["model"], "lead-m");
        assert_eq!(step["result"]["leader"]["content"], "patch");
        assert_eq!(step["result"]["assistant"]["model"], "assist-m");
        assert_eq!(step["result"]["assistant"]["content"], "patch looks right");
    }

    #[tokio::test]
    async fn test_collaborative_assistant_failure_names_its_part() {
        let invoker = ScriptedInvoker::new(vec![
            Ok("patch".into()),
            Err(AgentError::Unavailable {
                model: "assist-m".into(),
                reason: "no provider".into(),
            }),
        ]);
        let (orchestrator, _) = setup(invoker);
        let orchestrator = orchestrator.with_config(OrchestratorConfig {
            collaboration: [("bug_fix".to_string(), CollaborationStrategy::new("lead-m", "assist-m"))]
                .into_iter()
                .collect(),
            ..OrchestratorConfig::default()
        });
        let id = orchestrator
            .submit(NewTask::new("Fix login", Priority::Medium).with_type("bug_fix"))
            .unwrap();
        orchestrator
            .process_one("w1", &CancellationToken::new())
            .await
            .unwrap();

        let error = orchestrator.queue().get(&id).unwrap().last_error.unwrap();
        assert_eq!(error.kind, ErrorKind::ProviderUnavailable);
        assert_eq!(error.context["collaboration"], "assistant");
        assert_eq!(error.context["model"], "assist-m");
    }

    #[tokio::test]
    async fn test_corrupt_record_does_not_degrade() {
        let store: SharedTaskStore = Arc::new(CorruptStore(MemoryStore::new()));
        let orchestrator = over_store(store, ScriptedInvoker::ok(0)).with_config(OrchestratorConfig {
            poll_interval: Duration::from_millis(5),
            ..OrchestratorConfig::default()
        });
        orchestrator
            .submit(NewTask::new("x", Priority::Low))
            .unwrap();

        let err = orchestrator
            .process_one("w1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Queue(QueueError::Corrupted(_))));
        assert!(!err.is_storage_unavailable());

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.cancel();
        });
        let report = orchestrator.run_worker("w1", shutdown).await;
        assert!(report.errors >= 1);
        assert!(!orchestrator.is_degraded());
        orchestrator
            .submit(NewTask::new("y", Priority::Low))
            .unwrap();
    }
}
