//! Participant reply format.
//!
//! Participants are asked to answer with a JSON object:
//!
//! ```json
//! {"content": "...", "agrees_with": ["gpt"], "disagrees_with": [], "confidence": 80}
//! ```
//!
//! Models often wrap the object in prose or a code fence, so parsing looks
//! for the outermost braces. Anything unparseable is kept verbatim as the
//! content with no declarations and a neutral confidence.

use serde::{Deserialize, Serialize};

/// Confidence assigned to replies that carry none.
pub const NEUTRAL_CONFIDENCE: u8 = 50;

/// Structured participant reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebateReply {
    pub content: String,
    #[serde(default)]
    pub agrees_with: Vec<String>,
    #[serde(default)]
    pub disagrees_with: Vec<String>,
    #[serde(default = "neutral")]
    pub confidence: u8,
}

fn neutral() -> u8 {
    NEUTRAL_CONFIDENCE
}

#[derive(Deserialize)]
struct RawReply {
    content: String,
    #[serde(default)]
    agrees_with: Vec<String>,
    #[serde(default)]
    disagrees_with: Vec<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

impl DebateReply {
    /// Reply with only content.
    pub fn plain(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            agrees_with: Vec::new(),
            disagrees_with: Vec::new(),
            confidence: NEUTRAL_CONFIDENCE,
        }
    }

    /// Parse model output. Never fails: see the module docs for the fallback.
    pub fn parse(text: &str) -> Self {
        let parsed = json_object(text).and_then(|json| serde_json::from_str::<RawReply>(json).ok());
        match parsed {
            Some(raw) => Self {
                content: raw.content,
                agrees_with: raw.agrees_with,
                disagrees_with: raw.disagrees_with,
                confidence: raw
                    .confidence
                    .map(normalize_confidence)
                    .unwrap_or(NEUTRAL_CONFIDENCE),
            },
            None => Self::plain(text.trim()),
        }
    }
}

/// Map a model-reported confidence to 0–100. Values in `[0, 1]` are read as
/// fractions.
fn normalize_confidence(value: f64) -> u8 {
    if !value.is_finite() {
        return NEUTRAL_CONFIDENCE;
    }
    let scaled = if (0.0..=1.0).contains(&value) && value.fract() != 0.0 {
        value * 100.0
    } else {
        value
    };
    scaled.round().clamp(0.0, 100.0) as u8
}

/// Outermost `{...}` span of `text`.
pub(crate) fn json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
