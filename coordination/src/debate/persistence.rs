//! Debate persistence: transcript export/import and display formatting.
//!
//! A [`DebateTranscript`] is the complete, versioned JSON record of a session
//! plus the consensus checks made along the way. Importing validates the
//! schema version and the session's internal consistency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::consensus::ConsensusCheck;
use super::state::DebateSession;

/// Exported debate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateTranscript {
    /// Schema version for forward compatibility.
    pub version: u32,
    /// The session, rounds and synthesis included.
    pub session: DebateSession,
    /// One check per round ≥ 2.
    pub checks: Vec<ConsensusCheck>,
    pub exported_at: DateTime<Utc>,
}

impl DebateTranscript {
    /// Current schema version.
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(session: &DebateSession, checks: &[ConsensusCheck]) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            session: session.clone(),
            checks: checks.to_vec(),
            exported_at: Utc::now(),
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, PersistenceError> {
        serde_json::to_string_pretty(self).map_err(|e| PersistenceError::SerializeFailed {
            reason: e.to_string(),
        })
    }

    /// Deserialize from JSON string.
    pub fn from_json(json: &str) -> Result<Self, PersistenceError> {
        let transcript: Self =
            serde_json::from_str(json).map_err(|e| PersistenceError::DeserializeFailed {
                reason: e.to_string(),
            })?;

        if transcript.version > Self::CURRENT_VERSION {
            return Err(PersistenceError::VersionMismatch {
                expected: Self::CURRENT_VERSION,
                found: transcript.version,
            });
        }

        let errors = integrity_errors(&transcript.session);
        if !errors.is_empty() {
            return Err(PersistenceError::IntegrityCheckFailed {
                reason: errors.join("; "),
            });
        }

        Ok(transcript)
    }
}

/// Error during persistence operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("serialize failed: {reason}")]
    SerializeFailed { reason: String },

    #[error("deserialize failed: {reason}")]
    DeserializeFailed { reason: String },

    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("integrity check failed: {reason}")]
    IntegrityCheckFailed { reason: String },
}

/// Inconsistencies that make a session unusable.
pub fn integrity_errors(session: &DebateSession) -> Vec<String> {
    let mut errors = Vec::new();

    if session.current_round > session.max_rounds {
        errors.push(format!(
            "current_round {} exceeds max_rounds {}",
            session.current_round, session.max_rounds
        ));
    }
    if session.rounds.len() as u32 > session.current_round {
        errors.push(format!(
            "{} rounds recorded but current_round is {}",
            session.rounds.len(),
            session.current_round
        ));
    }

    match session.transitions.last() {
        Some(last) if last.to != session.phase => errors.push(format!(
            "last transition target {} doesn't match current phase {}",
            last.to, session.phase
        )),
        _ => {}
    }

    for (index, round) in session.rounds.iter().enumerate() {
        let expected = index as u32 + 1;
        if round.number != expected {
            errors.push(format!("round {} recorded at position {}", round.number, expected));
        }
        for message in &round.messages {
            if message.round != round.number {
                errors.push(format!(
                    "message from {} tagged round {} inside round {}",
                    message.participant_id, message.round, round.number
                ));
            }
            if session.participant(&message.participant_id).is_none() {
                errors.push(format!("unknown participant {}", message.participant_id));
            }
        }
    }

    errors
}

const RULE: &str = "======================================================================";
const THIN_RULE: &str = "----------------------------------------------------------------------";

/// Human-readable transcript.
pub fn format_transcript(session: &DebateSession) -> String {
    let mut out = Vec::new();

    out.push(RULE.to_string());
    out.push(format!("DEBATE: {}", session.topic));
    out.push(RULE.to_string());
    out.push(format!("Rounds: {}/{}", session.current_round, session.max_rounds));
    let status = if session.consensus {
        "consensus reached".to_string()
    } else {
        session.phase.to_string()
    };
    out.push(format!("Status: {}", status));
    out.push(RULE.to_string());

    let label = |id: &str| match session.participant(id) {
        Some(p) => format!("{} ({}, {})", p.id.to_uppercase(), p.role, p.model),
        None => id.to_uppercase(),
    };

    for round in &session.rounds {
        out.push(String::new());
        out.push(format!("[ROUND {}]", round.number));
        out.push(THIN_RULE.to_string());
        for message in &round.messages {
            out.push(format!(
                "\n[{}] confidence {}:",
                label(&message.participant_id),
                message.confidence
            ));
            out.push(message.content.clone());
            if !message.agrees_with.is_empty() {
                out.push(format!("  -> agrees with: {}", upper_list(&message.agrees_with)));
            }
            if !message.disagrees_with.is_empty() {
                out.push(format!(
                    "  -> disagrees with: {}",
                    upper_list(&message.disagrees_with)
                ));
            }
        }
    }

    if let Some(synthesis) = &session.synthesis {
        out.push(String::new());
        out.push(RULE.to_string());
        if synthesis.consensual {
            out.push("FINAL DECISION".to_string());
        } else {
            out.push("FINAL DECISION (no consensus)".to_string());
        }
        out.push(RULE.to_string());
        out.push(synthesis.recommendation.clone());
        if !synthesis.next_steps.is_empty() {
            out.push(String::new());
            out.push("Next steps:".to_string());
            for (i, step) in synthesis.next_steps.iter().enumerate() {
                out.push(format!("{}. {}", i + 1, step));
            }
        }
        out.push(format!("Confidence: {}", synthesis.confidence));
    }

    out.join("\n")
}

fn upper_list(ids: &[String]) -> String {
    ids.iter()
        .map(|id| id.to_uppercase())
        .collect::<Vec<_>>()
        .join(", ")
}
