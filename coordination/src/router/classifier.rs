//! Keyword-based task complexity classification
//!
//! Runs BEFORE the router picks a model tier. Classification is a pure
//! function of the task text and the configured keyword sets.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

/// Task complexity, which selects the model tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Medium => write!(f, "medium"),
            Self::Complex => write!(f, "complex"),
        }
    }
}

impl FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "medium" => Ok(Self::Medium),
            "complex" => Ok(Self::Complex),
            other => Err(format!("unknown complexity '{}'", other)),
        }
    }
}

/// Keyword sets, one per complexity level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierKeywords {
    pub complex: Vec<String>,
    pub medium: Vec<String>,
    pub simple: Vec<String>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for ClassifierKeywords {
    fn default() -> Self {
        Self {
            complex: words(&[
                "architecture",
                "architectural",
                "design",
                "distributed",
                "scalable",
                "scalability",
                "migration",
                "migrate",
                "concurrency",
                "security",
                "consensus",
                "infrastructure",
                "redesign",
            ]),
            medium: words(&[
                "implement",
                "feature",
                "refactor",
                "review",
                "test",
                "tests",
                "debug",
                "optimize",
                "configure",
                "setup",
                "integration",
                "endpoint",
            ]),
            simple: words(&[
                "format",
                "formatting",
                "lint",
                "typo",
                "rename",
                "docstring",
                "docstrings",
                "comment",
                "comments",
                "changelog",
                "readme",
                "quick",
                "simple",
            ]),
        }
    }
}

/// Classification result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub complexity: Complexity,
    /// Keywords of the winning level found in the text
    pub matched: Vec<String>,
}

/// Split text into lowercase alphanumeric words
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

/// Whole-word keyword classifier.
///
/// Complex keywords win over medium, medium over simple; text without any
/// keyword is medium.
#[derive(Debug, Clone)]
pub struct ComplexityClassifier {
    complex: HashSet<String>,
    medium: HashSet<String>,
    simple: HashSet<String>,
}

impl ComplexityClassifier {
    /// Build from keyword sets (matching is case-insensitive)
    pub fn new(keywords: &ClassifierKeywords) -> Self {
        let set = |list: &[String]| -> HashSet<String> {
            list.iter().map(|k| k.trim().to_lowercase()).collect()
        };
        Self {
            complex: set(&keywords.complex),
            medium: set(&keywords.medium),
            simple: set(&keywords.simple),
        }
    }

    /// Classify free text
    pub fn classify(&self, text: &str) -> Classification {
        let mut complex = Vec::new();
        let mut medium = Vec::new();
        let mut simple = Vec::new();

        for word in tokenize(text) {
            let bucket = if self.complex.contains(&word) {
                &mut complex
            } else if self.medium.contains(&word) {
                &mut medium
            } else if self.simple.contains(&word) {
                &mut simple
            } else {
                continue;
            };
            if !bucket.contains(&word) {
                bucket.push(word);
            }
        }

        let (complexity, matched) = if !complex.is_empty() {
            (Complexity::Complex, complex)
        } else if !medium.is_empty() {
            (Complexity::Medium, medium)
        } else if !simple.is_empty() {
            (Complexity::Simple, simple)
        } else {
            (Complexity::Medium, Vec::new())
        };

        Classification {
            complexity,
            matched,
        }
    }

    /// Classify a task by its title and description
    pub fn classify_task(&self, title: &str, description: &str) -> Classification {
        self.classify(&format!("{} {}", title, description))
    }
}

impl Default for ComplexityClassifier {
    fn default() -> Self {
        Self::new(&ClassifierKeywords::default())
    }
}
