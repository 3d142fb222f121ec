//! Error types for the debate protocol

use super::persistence::PersistenceError;
use super::state::TransitionError;
use crate::agents::AgentError;
use crate::error::{ErrorKind, TaskError};

/// Error type for debate runs
#[derive(Debug, thiserror::Error)]
pub enum DebateError {
    #[error("Invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("Invalid debate request: {0}")]
    InvalidRequest(String),

    #[error("Invalid debate transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("Participant {participant} failed: {source}")]
    Participant {
        participant: String,
        #[source]
        source: AgentError,
    },

    #[error("Debate cancelled")]
    Cancelled,

    #[error("Transcript serialization failed: {0}")]
    Serialization(#[from] PersistenceError),
}

pub type DebateResult<T> = Result<T, DebateError>;

impl From<DebateError> for TaskError {
    fn from(err: DebateError) -> Self {
        match err {
            DebateError::Participant {
                participant,
                source,
            } => TaskError::from(source).with_context("participant", participant),
            DebateError::Cancelled => TaskError::new(ErrorKind::Cancelled, "debate cancelled"),
            DebateError::InvalidParticipants(_) | DebateError::InvalidRequest(_) => {
                TaskError::new(ErrorKind::Validation, err.to_string())
            }
            other => TaskError::new(ErrorKind::Debate, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::ProviderError;

    #[test]
    fn test_participant_error_keeps_provider_kind() {
        let err = DebateError::Participant {
            participant: "gpt".into(),
            source: AgentError::Provider(ProviderError::Transient("429".into())),
        };
        assert_eq!(err.to_string(), "Participant gpt failed: Transient provider error: 429");

        let task_error: TaskError = err.into();
        assert_eq!(task_error.kind, ErrorKind::ProviderTransient);
        assert!(task_error.retryable);
        assert_eq!(task_error.context["participant"], "gpt");
    }

    #[test]
    fn test_kinds() {
        let cancelled: TaskError = DebateError::Cancelled.into();
        assert_eq!(cancelled.kind, ErrorKind::Cancelled);

        let invalid: TaskError = DebateError::InvalidParticipants("one".into()).into();
        assert_eq!(invalid.kind, ErrorKind::Validation);
    }
}
