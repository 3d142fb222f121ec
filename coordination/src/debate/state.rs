//! Debate state machine: phases, transitions, and session tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::synthesis::Synthesis;

/// Phase of a debate session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebatePhase {
    /// Session created but not started.
    Idle,
    /// Round 1: every participant answers on its own.
    Independent,
    /// Round k ≥ 2: participants answer with the previous round in view.
    Conditioned,
    /// Evaluating the agreement graph of the round just finished.
    ConsensusCheck,
    /// Every pair of participants agrees.
    ConsensusReached,
    /// Round budget spent without consensus.
    RoundsExhausted,
    /// Coordinator is producing the final recommendation.
    Synthesis,
    /// Synthesis recorded.
    Complete,
    /// Aborted by the caller.
    Cancelled,
}

impl DebatePhase {
    /// Whether this is a terminal phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }

    /// Whether this phase is one where participants are answering.
    pub fn is_round(self) -> bool {
        matches!(self, Self::Independent | Self::Conditioned)
    }

    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [DebatePhase] {
        match self {
            Self::Idle => &[Self::Independent, Self::Cancelled],
            Self::Independent => &[Self::Conditioned, Self::Cancelled],
            Self::Conditioned => &[Self::ConsensusCheck, Self::Cancelled],
            Self::ConsensusCheck => &[
                Self::ConsensusReached,
                Self::Conditioned,
                Self::RoundsExhausted,
                Self::Cancelled,
            ],
            Self::ConsensusReached | Self::RoundsExhausted => &[Self::Synthesis, Self::Cancelled],
            Self::Synthesis => &[Self::Complete, Self::Cancelled],
            Self::Complete | Self::Cancelled => &[],
        }
    }
}

impl std::fmt::Display for DebatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Independent => write!(f, "independent"),
            Self::Conditioned => write!(f, "conditioned"),
            Self::ConsensusCheck => write!(f, "consensus_check"),
            Self::ConsensusReached => write!(f, "consensus_reached"),
            Self::RoundsExhausted => write!(f, "rounds_exhausted"),
            Self::Synthesis => write!(f, "synthesis"),
            Self::Complete => write!(f, "complete"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A debate participant bound to a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Unique id within the session, referenced by agreement lists.
    pub id: String,
    /// Perspective label, e.g. "architecture" or "implementation".
    pub role: String,
    /// Model the participant speaks through.
    pub model: String,
}

impl Participant {
    pub fn new(id: &str, role: &str, model: &str) -> Self {
        Self {
            id: id.to_string(),
            role: role.to_string(),
            model: model.to_string(),
        }
    }

    /// The default panel: one participant per provider family.
    pub fn default_panel() -> Vec<Participant> {
        vec![
            Self::new("claude", "architecture", "claude-opus"),
            Self::new("gpt", "implementation", "gpt-4o"),
            Self::new("gemini", "quality", "gemini-2.5-pro"),
        ]
    }
}

/// Check a participant list: at least two, unique non-empty ids.
pub fn validate_participants(participants: &[Participant]) -> Result<(), String> {
    if participants.len() < 2 {
        return Err(format!(
            "a debate needs at least 2 participants, got {}",
            participants.len()
        ));
    }
    let mut seen = HashSet::new();
    for participant in participants {
        if participant.id.trim().is_empty() {
            return Err("participant id is empty".to_string());
        }
        if !seen.insert(participant.id.as_str()) {
            return Err(format!("duplicate participant id: {}", participant.id));
        }
    }
    Ok(())
}

/// One participant's contribution to a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebateMessage {
    pub participant_id: String,
    /// Round number (1-indexed).
    pub round: u32,
    pub content: String,
    #[serde(default)]
    pub agrees_with: Vec<String>,
    #[serde(default)]
    pub disagrees_with: Vec<String>,
    /// Confidence, 0–100.
    pub confidence: u8,
}

impl DebateMessage {
    /// Build a message; confidence above 100 is clamped.
    pub fn new(participant_id: &str, round: u32, content: impl Into<String>, confidence: u8) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            round,
            content: content.into(),
            agrees_with: Vec::new(),
            disagrees_with: Vec::new(),
            confidence: confidence.min(100),
        }
    }

    pub fn agreeing(mut self, ids: &[&str]) -> Self {
        self.agrees_with = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn disagreeing(mut self, ids: &[&str]) -> Self {
        self.disagrees_with = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Whether this message declares agreement with `other`.
    pub fn agrees(&self, other: &str) -> bool {
        self.agrees_with.iter().any(|id| id == other)
    }

    /// Whether this message declares disagreement with `other`.
    pub fn disagrees(&self, other: &str) -> bool {
        self.disagrees_with.iter().any(|id| id == other)
    }
}

/// Record of a single debate round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateRound {
    /// Round number (1-indexed).
    pub number: u32,
    /// One message per participant, in participant order.
    pub messages: Vec<DebateMessage>,
    /// Whether the consensus check after this round succeeded. `None` for
    /// round 1, which is never checked.
    pub consensus: Option<bool>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DebateRound {
    /// Message from `participant_id`, if any.
    pub fn message_from(&self, participant_id: &str) -> Option<&DebateMessage> {
        self.messages
            .iter()
            .find(|m| m.participant_id == participant_id)
    }

    /// Mean confidence of the round's messages, 0 when empty.
    pub fn mean_confidence(&self) -> u8 {
        if self.messages.is_empty() {
            return 0;
        }
        let sum: u32 = self.messages.iter().map(|m| u32::from(m.confidence)).sum();
        (sum / self.messages.len() as u32) as u8
    }
}

/// A phase transition record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebateTransition {
    /// Previous phase.
    pub from: DebatePhase,
    /// New phase.
    pub to: DebatePhase,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
    /// Reason for the transition.
    pub reason: String,
}

/// Error for invalid state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: DebatePhase,
    pub to: DebatePhase,
    pub reason: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} -> {}: {}",
            self.from, self.to, self.reason
        )
    }
}

impl std::error::Error for TransitionError {}

/// A debate session tracking state and history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateSession {
    /// Unique session identifier.
    pub id: String,
    /// Question under debate.
    pub topic: String,
    pub participants: Vec<Participant>,
    /// Current phase.
    pub phase: DebatePhase,
    /// Current round number.
    pub current_round: u32,
    /// Maximum rounds allowed.
    pub max_rounds: u32,
    /// Round history.
    pub rounds: Vec<DebateRound>,
    /// Whether the final consensus check succeeded.
    pub consensus: bool,
    pub synthesis: Option<Synthesis>,
    /// Final confidence, 0–100, set with the synthesis.
    pub confidence: Option<u8>,
    /// Transition history.
    pub transitions: Vec<DebateTransition>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DebateSession {
    /// Create a new debate session.
    pub fn new(id: &str, topic: &str, participants: Vec<Participant>, max_rounds: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            topic: topic.to_string(),
            participants,
            phase: DebatePhase::Idle,
            current_round: 0,
            max_rounds,
            rounds: Vec::new(),
            consensus: false,
            synthesis: None,
            confidence: None,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Transition to a new phase with a reason.
    pub fn transition(&mut self, to: DebatePhase, reason: &str) -> Result<(), TransitionError> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.phase,
                to,
                reason: format!(
                    "not a valid transition (allowed: {:?})",
                    self.phase.valid_transitions()
                ),
            });
        }
        if to == DebatePhase::Conditioned && !self.has_rounds_remaining() {
            return Err(TransitionError {
                from: self.phase,
                to,
                reason: format!("round budget of {} spent", self.max_rounds),
            });
        }

        let now = Utc::now();
        self.transitions.push(DebateTransition {
            from: self.phase,
            to,
            timestamp: now,
            reason: reason.to_string(),
        });
        self.phase = to;
        self.updated_at = now;

        if to.is_round() {
            self.current_round += 1;
        }
        match to {
            DebatePhase::ConsensusReached => self.consensus = true,
            DebatePhase::Complete | DebatePhase::Cancelled => self.finished_at = Some(now),
            _ => {}
        }

        Ok(())
    }

    /// Start the debate (Idle → Independent).
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(DebatePhase::Independent, "debate started")
    }

    /// Record a finished round.
    pub fn record_round(&mut self, round: DebateRound) {
        self.updated_at = round.finished_at;
        self.rounds.push(round);
    }

    /// The most recent round.
    pub fn last_round(&self) -> Option<&DebateRound> {
        self.rounds.last()
    }

    /// Record the synthesis (Synthesis → Complete).
    pub fn finish(&mut self, synthesis: Synthesis) -> Result<(), TransitionError> {
        self.transition(DebatePhase::Complete, "synthesis recorded")?;
        self.confidence = Some(synthesis.confidence);
        self.synthesis = Some(synthesis);
        Ok(())
    }

    /// Whether the debate has ended.
    pub fn is_complete(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Whether more rounds are available.
    pub fn has_rounds_remaining(&self) -> bool {
        self.current_round < self.max_rounds
    }

    /// Participant by id.
    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] round {}/{} | {} participants | consensus={} | {}",
            self.phase,
            self.current_round,
            self.max_rounds,
            self.participants.len(),
            self.consensus,
            self.topic
        )
    }
}
