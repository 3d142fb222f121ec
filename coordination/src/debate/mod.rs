//! Debate Protocol: multi-party rounds until consensus
//!
//! Several participants, each bound to a model, debate a topic. Round 1 is
//! independent; in later rounds every participant sees the previous round
//! and declares who it agrees and disagrees with. After each round ≥ 2 the
//! agreement graph is checked. A coordinator then synthesizes a
//! recommendation, flagged non-consensual when the budget ran out first.
//!
//! # Debate Flow
//!
//! ```text
//! Idle → Independent → Conditioned → ConsensusCheck ─┬─ complete graph → ConsensusReached ─┐
//!             (round 1)    (round k)        ▲        ├─ rounds left → Conditioned          │
//!                                           │        └─ budget spent → RoundsExhausted ────┤
//!                                           └────────────────┘                             ▼
//!                                                                    Synthesis → Complete
//!   cancel at any non-terminal phase → Cancelled
//! ```

pub mod consensus;
pub mod error;
pub mod persistence;
pub mod reply;
pub mod runner;
pub mod state;
pub mod synthesis;

pub use consensus::{AgreementGraph, ConsensusCheck};
pub use error::{DebateError, DebateResult};
pub use persistence::{format_transcript, integrity_errors, DebateTranscript, PersistenceError};
pub use reply::{DebateReply, NEUTRAL_CONFIDENCE};
pub use runner::{
    DebateOutcome, DebateRequest, DebateResponder, DebateRunner, ProviderResponder,
    RecordedResponder, RoundContext, DEFAULT_MAX_ROUNDS, MIN_ROUNDS,
};
pub use state::{
    validate_participants, DebateMessage, DebatePhase, DebateRound, DebateSession,
    DebateTransition, Participant, TransitionError,
};
pub use synthesis::{
    list_items, synthesize_transcript, ModelSynthesizer, Synthesis, Synthesizer,
    TranscriptSynthesizer, MAX_NEXT_STEPS,
};
