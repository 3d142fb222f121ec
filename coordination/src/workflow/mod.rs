//! Workflow Orchestration
//!
//! A task runs as an ordered list of steps, each naming an agent role and an
//! action. Steps run strictly in order; each one receives the previous
//! step's output. A step whose action is `debate` runs a full debate
//! session instead of a single agent call. A step whose action has a
//! [`CollaborationStrategy`] runs two pinned models: the leader, then the
//! assistant on the leader's output.
//!
//! # Step resolution
//!
//! ```text
//! metadata.workflow_state     → resume a partially executed workflow
//! metadata.workflow           → explicit [{role, action}, ...]
//! metadata.workflow_template  → feature | bugfix | review | refactor
//! otherwise                   → one step: assigned_agent or task_type's role
//! ```
//!
//! # Failure handling
//!
//! | Step failure                        | Task outcome                      |
//! |-------------------------------------|-----------------------------------|
//! | transient (rate limit, timeout)     | requeued with backoff, resumes    |
//! | permanent / provider unavailable    | failed                            |
//! | cancelled by request                | cancelled                         |
//! | worker shutdown                     | released, no retry penalty        |

pub mod orchestrator;
pub mod types;

pub use orchestrator::{
    CancelOutcome, Orchestrator, OrchestratorConfig, OrchestratorError, OrchestratorResult,
    SharedOrchestrator, TaskOutcome, WorkerReport,
};
pub use types::{
    CollaborationStrategy, Step, StepProgress, StepSpec, StepStatus, Workflow, WorkflowProgress,
    WorkflowStatus, WorkflowTemplate, DEBATE_ACTION, WORKFLOW_KEY, WORKFLOW_STATE_KEY,
    WORKFLOW_TEMPLATE_KEY,
};
