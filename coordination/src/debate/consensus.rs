//! Consensus protocol: agreement graph over one round's declarations.
//!
//! Participants `a` and `b` are connected when each lists the other as
//! agreed and neither lists the other as disagreed. A round reaches
//! consensus when the graph is complete. Self references and ids that do not
//! name a participant are ignored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::state::{DebateMessage, DebateRound, Participant};

/// Undirected agreement graph for one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreementGraph {
    nodes: Vec<String>,
    edges: BTreeSet<(String, String)>,
}

impl AgreementGraph {
    /// Build the graph from one message per participant. Participants with
    /// no message have no edges.
    pub fn build(participants: &[Participant], messages: &[DebateMessage]) -> Self {
        let nodes: Vec<String> = participants.iter().map(|p| p.id.clone()).collect();
        let message = |id: &str| messages.iter().find(|m| m.participant_id == id);

        let mut edges = BTreeSet::new();
        for (i, a) in nodes.iter().enumerate() {
            for b in nodes.iter().skip(i + 1) {
                let (Some(ma), Some(mb)) = (message(a), message(b)) else {
                    continue;
                };
                let mutual = ma.agrees(b) && mb.agrees(a);
                let contested = ma.disagrees(b) || mb.disagrees(a);
                if mutual && !contested {
                    edges.insert(edge(a, b));
                }
            }
        }

        Self { nodes, edges }
    }

    /// Whether `a` and `b` are connected.
    pub fn has_edge(&self, a: &str, b: &str) -> bool {
        a != b && self.edges.contains(&edge(a, b))
    }

    /// Connected pairs, each ordered lexicographically.
    pub fn edges(&self) -> impl Iterator<Item = &(String, String)> {
        self.edges.iter()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Pairs that still need an edge for the graph to be complete.
    pub fn missing_pairs(&self) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for (i, a) in self.nodes.iter().enumerate() {
            for b in self.nodes.iter().skip(i + 1) {
                if !self.has_edge(a, b) {
                    missing.push(edge(a, b));
                }
            }
        }
        missing
    }

    /// Every pair connected.
    pub fn is_complete(&self) -> bool {
        let n = self.nodes.len();
        self.edges.len() == n * n.saturating_sub(1) / 2
    }
}

fn edge(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Result of checking one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusCheck {
    /// Round that was checked.
    pub round: u32,
    /// Whether the agreement graph is complete.
    pub reached: bool,
    /// Connected pairs.
    pub agreeing_pairs: Vec<(String, String)>,
    /// Pairs without mutual, uncontested agreement.
    pub missing_pairs: Vec<(String, String)>,
    /// Mean participant confidence for the round, 0–100.
    pub mean_confidence: u8,
}

impl ConsensusCheck {
    /// Evaluate a finished round.
    pub fn evaluate(participants: &[Participant], round: &DebateRound) -> Self {
        let graph = AgreementGraph::build(participants, &round.messages);
        Self {
            round: round.number,
            reached: graph.is_complete(),
            agreeing_pairs: graph.edges().cloned().collect(),
            missing_pairs: graph.missing_pairs(),
            mean_confidence: round.mean_confidence(),
        }
    }
}
