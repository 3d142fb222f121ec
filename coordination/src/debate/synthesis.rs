//! Final recommendation for a debate.
//!
//! The coordinator is never one of the participants. [`synthesize_transcript`]
//! is a pure function of the session; [`ModelSynthesizer`] asks a coordinator
//! model and falls back to it when the model is unavailable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::persistence::format_transcript;
use super::reply::json_object;
use super::state::DebateSession;
use crate::agents::{GenerateOptions, Generation, SharedProvider};

/// Upper bound on next steps carried by a synthesis.
pub const MAX_NEXT_STEPS: usize = 5;

/// Coordinator output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synthesis {
    pub recommendation: String,
    /// Ordered, at most [`MAX_NEXT_STEPS`].
    pub next_steps: Vec<String>,
    /// False when the debate ended without consensus.
    pub consensual: bool,
    /// 0–100.
    pub confidence: u8,
}

/// Produces a [`Synthesis`] from a finished transcript
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, session: &DebateSession) -> Synthesis;
}

/// Deterministic synthesis from the final round.
///
/// The recommendation is the highest-confidence message, ties going to the
/// earlier participant. Next steps are list items found in the final round,
/// recommendation first. Confidence is the final round's mean.
pub fn synthesize_transcript(session: &DebateSession) -> Synthesis {
    let Some(last) = session.last_round() else {
        return Synthesis {
            recommendation: String::new(),
            next_steps: Vec::new(),
            consensual: session.consensus,
            confidence: 0,
        };
    };

    let order = |id: &str| {
        session
            .participants
            .iter()
            .position(|p| p.id == id)
            .unwrap_or(usize::MAX)
    };

    let mut ranked: Vec<_> = last.messages.iter().collect();
    ranked.sort_by(|a, b| {
        b.confidence
            .cmp(&a.confidence)
            .then_with(|| order(&a.participant_id).cmp(&order(&b.participant_id)))
    });

    let recommendation = ranked
        .first()
        .map(|m| m.content.trim().to_string())
        .unwrap_or_default();

    let mut next_steps = Vec::new();
    for message in &ranked {
        for step in list_items(&message.content) {
            if next_steps.len() == MAX_NEXT_STEPS {
                break;
            }
            if !next_steps.contains(&step) {
                next_steps.push(step);
            }
        }
    }

    Synthesis {
        recommendation,
        next_steps,
        consensual: session.consensus,
        confidence: last.mean_confidence(),
    }
}

/// Bullet and numbered list items in `text`, marker stripped.
pub fn list_items(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = if let Some(rest) = line
                .strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
            {
                rest
            } else {
                let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
                if digits == 0 {
                    return None;
                }
                let tail = &line[digits..];
                tail.strip_prefix(". ").or_else(|| tail.strip_prefix(") "))?
            };
            let rest = rest.trim();
            (!rest.is_empty()).then(|| rest.to_string())
        })
        .collect()
}

/// [`Synthesizer`] backed by [`synthesize_transcript`]
#[derive(Debug, Clone, Copy, Default)]
pub struct TranscriptSynthesizer;

#[async_trait]
impl Synthesizer for TranscriptSynthesizer {
    async fn synthesize(&self, session: &DebateSession) -> Synthesis {
        synthesize_transcript(session)
    }
}

#[derive(Deserialize)]
struct CoordinatorReply {
    recommendation: String,
    #[serde(default)]
    next_steps: Vec<String>,
}

/// Synthesizer that asks a coordinator model
pub struct ModelSynthesizer {
    provider: SharedProvider,
    model: String,
    options: GenerateOptions,
}

impl ModelSynthesizer {
    pub fn new(provider: SharedProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            options: GenerateOptions::default(),
        }
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    fn prompt(session: &DebateSession) -> String {
        let stance = if session.consensus {
            "The participants reached consensus."
        } else {
            "The participants did NOT reach consensus; say where they still differ."
        };
        format!(
            "You coordinate a technical debate and did not take part in it.\n\
             {}\n\n{}\n\n\
             Reply with a JSON object: {{\"recommendation\": string, \"next_steps\": [string]}} \
             with at most {} next steps, most important first.",
            stance,
            format_transcript(session),
            MAX_NEXT_STEPS
        )
    }
}

#[async_trait]
impl Synthesizer for ModelSynthesizer {
    async fn synthesize(&self, session: &DebateSession) -> Synthesis {
        let fallback = synthesize_transcript(session);
        let prompt = Self::prompt(session);

        let text = match self.provider.generate(&self.model, &prompt, &self.options).await {
            Ok(Generation::Real(text)) => text,
            Ok(Generation::Unavailable(reason)) => {
                warn!(debate_id = %session.id, model = %self.model, %reason, "Coordinator unavailable, using transcript synthesis");
                return fallback;
            }
            Err(e) => {
                warn!(debate_id = %session.id, model = %self.model, error = %e, "Coordinator failed, using transcript synthesis");
                return fallback;
            }
        };

        let parsed = json_object(&text)
            .and_then(|json| serde_json::from_str::<CoordinatorReply>(json).ok());
        let (recommendation, mut next_steps) = match parsed {
            Some(reply) => (reply.recommendation, reply.next_steps),
            None => {
                debug!(debate_id = %session.id, "Coordinator reply not JSON, extracting list items");
                let steps = list_items(&text);
                (text.trim().to_string(), steps)
            }
        };
        next_steps.retain(|s| !s.trim().is_empty());
        next_steps.truncate(MAX_NEXT_STEPS);

        Synthesis {
            recommendation,
            next_steps,
            consensual: fallback.consensual,
            confidence: fallback.confidence,
        }
    }
}
