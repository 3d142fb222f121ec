//! Debate runner: drives a session through its rounds.
//!
//! Calls within a round run concurrently; rounds are sequential. The
//! consensus check and the default synthesis are pure functions of the
//! transcript, so a [`RecordedResponder`] makes a whole run reproducible.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::consensus::ConsensusCheck;
use super::error::{DebateError, DebateResult};
use super::persistence::DebateTranscript;
use super::reply::DebateReply;
use super::state::{
    validate_participants, DebateMessage, DebatePhase, DebateRound, DebateSession, Participant,
};
use super::synthesis::{Synthesis, Synthesizer, TranscriptSynthesizer};
use crate::agents::{AgentError, GenerateOptions, Generation, SharedProvider};
use crate::events::{topics, Event, SharedEventBus};

/// Rounds run when the caller does not say.
pub const DEFAULT_MAX_ROUNDS: u32 = 3;

/// Fewest rounds a debate may have; round 2 is the first consensus check.
pub const MIN_ROUNDS: u32 = 2;

const ORIGIN: &str = "debate";

/// What a participant sees when asked for a round.
#[derive(Debug, Clone, Copy)]
pub struct RoundContext<'a> {
    pub topic: &'a str,
    /// Round being played (1-indexed).
    pub round: u32,
    pub participants: &'a [Participant],
    /// The full previous round, absent in round 1.
    pub previous: Option<&'a DebateRound>,
}

/// Produces a participant's reply for a round
#[async_trait]
pub trait DebateResponder: Send + Sync {
    async fn respond(
        &self,
        participant: &Participant,
        context: RoundContext<'_>,
    ) -> Result<DebateReply, AgentError>;
}

// ============================================================================
// Responders
// ============================================================================

/// Responder that prompts each participant's model through a provider
pub struct ProviderResponder {
    provider: SharedProvider,
    options: GenerateOptions,
}

impl ProviderResponder {
    pub fn new(provider: SharedProvider) -> Self {
        Self {
            provider,
            options: GenerateOptions::default(),
        }
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    /// Prompt sent to `participant` for a round.
    pub fn prompt(participant: &Participant, context: RoundContext<'_>) -> String {
        let mut prompt = format!(
            "You are {}, a participant in a technical debate focusing on {}.\n\nTopic: {}\n\n",
            participant.id, participant.role, context.topic
        );

        match context.previous {
            None => {
                prompt.push_str(
                    "Give your independent analysis. Be concise and technical.\n\n\
                     Reply with a JSON object: {\"content\": string, \"confidence\": 0-100}",
                );
            }
            Some(previous) => {
                prompt.push_str(&format!("Responses from round {}:\n", previous.number));
                for message in &previous.messages {
                    prompt.push_str(&format!(
                        "\n[{}] (confidence {}):\n{}\n",
                        message.participant_id, message.confidence, message.content
                    ));
                }
                let others: Vec<&str> = context
                    .participants
                    .iter()
                    .filter(|p| p.id != participant.id)
                    .map(|p| p.id.as_str())
                    .collect();
                prompt.push_str(&format!(
                    "\nThis is round {}. Update your position considering the other participants. \
                     For each of [{}] state whether you agree or disagree.\n\n\
                     Reply with a JSON object: {{\"content\": string, \"agrees_with\": [id], \
                     \"disagrees_with\": [id], \"confidence\": 0-100}}",
                    context.round,
                    others.join(", ")
                ));
            }
        }
        prompt
    }
}

#[async_trait]
impl DebateResponder for ProviderResponder {
    async fn respond(
        &self,
        participant: &Participant,
        context: RoundContext<'_>,
    ) -> Result<DebateReply, AgentError> {
        let prompt = Self::prompt(participant, context);
        match self
            .provider
            .generate(&participant.model, &prompt, &self.options)
            .await?
        {
            Generation::Real(text) => Ok(DebateReply::parse(&text)),
            Generation::Unavailable(reason) => Err(AgentError::Unavailable {
                model: participant.model.clone(),
                reason,
            }),
        }
    }
}

/// Responder replaying recorded replies.
///
/// A participant without a reply for the requested round repeats its latest
/// earlier one; with no earlier reply at all the call fails as unavailable.
#[derive(Debug, Clone, Default)]
pub struct RecordedResponder {
    replies: BTreeMap<(String, u32), DebateReply>,
}

impl RecordedResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `participant`'s reply for `round`.
    pub fn reply(mut self, participant: &str, round: u32, reply: DebateReply) -> Self {
        self.replies.insert((participant.to_string(), round), reply);
        self
    }

    fn lookup(&self, participant: &str, round: u32) -> Option<&DebateReply> {
        self.replies
            .range((participant.to_string(), 0)..=(participant.to_string(), round))
            .next_back()
            .map(|(_, reply)| reply)
    }
}

#[async_trait]
impl DebateResponder for RecordedResponder {
    async fn respond(
        &self,
        participant: &Participant,
        context: RoundContext<'_>,
    ) -> Result<DebateReply, AgentError> {
        self.lookup(&participant.id, context.round)
            .cloned()
            .ok_or_else(|| AgentError::Unavailable {
                model: participant.model.clone(),
                reason: format!("no recorded reply for round {}", context.round),
            })
    }
}

// ============================================================================
// Runner
// ============================================================================

/// A debate to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebateRequest {
    pub topic: String,
    pub participants: Vec<Participant>,
    /// Round budget; the runner default when absent.
    #[serde(default)]
    pub max_rounds: Option<u32>,
    /// Id linking the debate's events to a task.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl DebateRequest {
    pub fn new(topic: impl Into<String>, participants: Vec<Participant>) -> Self {
        Self {
            topic: topic.into(),
            participants,
            max_rounds: None,
            correlation_id: None,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = Some(max_rounds);
        self
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Finished debate.
#[derive(Debug, Clone, PartialEq)]
pub struct DebateOutcome {
    /// Full transcript.
    pub session: DebateSession,
    pub synthesis: Synthesis,
    /// One check per round ≥ 2.
    pub checks: Vec<ConsensusCheck>,
}

impl DebateOutcome {
    pub fn consensus_reached(&self) -> bool {
        self.session.consensus
    }

    /// Exportable transcript.
    pub fn transcript(&self) -> DebateTranscript {
        DebateTranscript::new(&self.session, &self.checks)
    }

    /// Compact summary line.
    pub fn summary_line(&self) -> String {
        format!(
            "Debate {}: {} after {} round(s), confidence {}",
            self.session.id,
            if self.synthesis.consensual {
                "consensus"
            } else {
                "no consensus"
            },
            self.session.rounds.len(),
            self.synthesis.confidence
        )
    }
}

/// Drives debate sessions
pub struct DebateRunner {
    responder: Arc<dyn DebateResponder>,
    synthesizer: Arc<dyn Synthesizer>,
    events: Option<SharedEventBus>,
    default_max_rounds: u32,
}

impl DebateRunner {
    /// Runner with transcript synthesis and no event publishing.
    pub fn new(responder: Arc<dyn DebateResponder>) -> Self {
        Self {
            responder,
            synthesizer: Arc::new(TranscriptSynthesizer),
            events: None,
            default_max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    /// Publish `debate.*` events to `events`.
    pub fn with_events(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_default_rounds(mut self, max_rounds: u32) -> Self {
        self.default_max_rounds = max_rounds;
        self
    }

    /// Run a debate to completion.
    pub async fn run(
        &self,
        topic: &str,
        participants: Vec<Participant>,
        max_rounds: Option<u32>,
    ) -> DebateResult<DebateOutcome> {
        let mut request = DebateRequest::new(topic, participants);
        request.max_rounds = max_rounds;
        self.execute(request, &CancellationToken::new()).await
    }

    /// Run a debate, aborting when `cancel` fires.
    pub async fn execute(
        &self,
        request: DebateRequest,
        cancel: &CancellationToken,
    ) -> DebateResult<DebateOutcome> {
        if request.topic.trim().is_empty() {
            return Err(DebateError::InvalidRequest("topic is empty".to_string()));
        }
        validate_participants(&request.participants).map_err(DebateError::InvalidParticipants)?;

        let requested = request.max_rounds.unwrap_or(self.default_max_rounds);
        let max_rounds = requested.max(MIN_ROUNDS);
        if max_rounds != requested {
            warn!(requested, max_rounds, "Round budget raised to the minimum");
        }

        let id = Uuid::new_v4().to_string();
        let correlation = request.correlation_id.clone().unwrap_or_else(|| id.clone());
        let mut session = DebateSession::new(&id, &request.topic, request.participants, max_rounds);
        session.start()?;

        info!(debate_id = %id, participants = session.participants.len(), max_rounds, "Debate started");
        self.publish(
            topics::DEBATE_STARTED,
            &correlation,
            json!({
                "debate_id": id,
                "topic": session.topic,
                "participants": session.participants.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
                "max_rounds": max_rounds,
            }),
        );

        let mut checks = Vec::new();
        loop {
            let round = match self.play_round(&session, cancel).await {
                Ok(round) => round,
                Err(e) => {
                    if matches!(e, DebateError::Cancelled) {
                        let _ = session.transition(DebatePhase::Cancelled, "cancelled by caller");
                        info!(debate_id = %id, round = session.current_round, "Debate cancelled");
                    }
                    return Err(e);
                }
            };
            let number = round.number;

            if session.phase == DebatePhase::Independent {
                session.record_round(round);
                self.round_completed(&session, &correlation, None);
                session.transition(DebatePhase::Conditioned, "independent round finished")?;
                continue;
            }

            let check = ConsensusCheck::evaluate(&session.participants, &round);
            let mut round = round;
            round.consensus = Some(check.reached);
            session.record_round(round);
            session.transition(DebatePhase::ConsensusCheck, "conditioned round finished")?;
            self.round_completed(&session, &correlation, Some(check.reached));
            debug!(
                debate_id = %id,
                round = number,
                agreeing = check.agreeing_pairs.len(),
                missing = check.missing_pairs.len(),
                "Consensus check"
            );
            let reached = check.reached;
            checks.push(check);

            if reached {
                session.transition(DebatePhase::ConsensusReached, "agreement graph complete")?;
                info!(debate_id = %id, round = number, "Consensus reached");
                self.publish(
                    topics::DEBATE_CONSENSUS_REACHED,
                    &correlation,
                    json!({ "debate_id": id, "round": number }),
                );
                break;
            }
            if session.has_rounds_remaining() {
                session.transition(DebatePhase::Conditioned, "no consensus yet")?;
            } else {
                session.transition(DebatePhase::RoundsExhausted, "round budget spent")?;
                info!(debate_id = %id, rounds = number, "Rounds exhausted without consensus");
                self.publish(
                    topics::DEBATE_ROUNDS_EXHAUSTED,
                    &correlation,
                    json!({ "debate_id": id, "rounds": number }),
                );
                break;
            }
        }

        if cancel.is_cancelled() {
            let _ = session.transition(DebatePhase::Cancelled, "cancelled before synthesis");
            return Err(DebateError::Cancelled);
        }
        session.transition(DebatePhase::Synthesis, "synthesizing")?;
        let synthesized = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            synthesis = self.synthesizer.synthesize(&session) => Some(synthesis),
        };
        let Some(synthesis) = synthesized else {
            let _ = session.transition(DebatePhase::Cancelled, "cancelled during synthesis");
            return Err(DebateError::Cancelled);
        };
        session.finish(synthesis.clone())?;

        self.publish(
            topics::DEBATE_SYNTHESIZED,
            &correlation,
            json!({
                "debate_id": id,
                "consensual": synthesis.consensual,
                "confidence": synthesis.confidence,
                "next_steps": synthesis.next_steps.len(),
            }),
        );
        info!(debate_id = %id, consensual = synthesis.consensual, confidence = synthesis.confidence, "Debate complete");

        Ok(DebateOutcome {
            session,
            synthesis,
            checks,
        })
    }

    /// Ask every participant concurrently for the current round.
    async fn play_round(
        &self,
        session: &DebateSession,
        cancel: &CancellationToken,
    ) -> DebateResult<DebateRound> {
        let number = session.current_round;
        let context = RoundContext {
            topic: &session.topic,
            round: number,
            participants: &session.participants,
            previous: session.last_round(),
        };
        let started_at = chrono::Utc::now();

        let calls = session
            .participants
            .iter()
            .map(|participant| self.responder.respond(participant, context));

        let replies = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DebateError::Cancelled),
            replies = join_all(calls) => replies,
        };

        let mut messages = Vec::with_capacity(replies.len());
        for (participant, reply) in session.participants.iter().zip(replies) {
            let reply = reply.map_err(|source| {
                warn!(debate_id = %session.id, participant = %participant.id, round = number, error = %source, "Participant failed");
                DebateError::Participant {
                    participant: participant.id.clone(),
                    source,
                }
            })?;

            let mut message =
                DebateMessage::new(&participant.id, number, reply.content, reply.confidence);
            // Round 1 is independent: declarations carry no meaning yet.
            if number > 1 {
                message.agrees_with = reply.agrees_with;
                message.disagrees_with = reply.disagrees_with;
            }
            messages.push(message);
        }

        Ok(DebateRound {
            number,
            messages,
            consensus: None,
            started_at,
            finished_at: chrono::Utc::now(),
        })
    }

    fn round_completed(&self, session: &DebateSession, correlation: &str, consensus: Option<bool>) {
        let round = session.last_round();
        self.publish(
            topics::DEBATE_ROUND_COMPLETED,
            correlation,
            json!({
                "debate_id": session.id,
                "round": round.map(|r| r.number),
                "mean_confidence": round.map(|r| r.mean_confidence()),
                "consensus": consensus,
            }),
        );
    }

    fn publish(&self, topic: &str, correlation: &str, payload: serde_json::Value) {
        if let Some(events) = &self.events {
            events.publish(
                Event::new(topic, payload)
                    .from_origin(ORIGIN)
                    .correlated(correlation),
            );
        }
    }
}
