//! Model Router Module
//!
//! Picks the model for a step from the task's complexity and the role's
//! tier roster.
//!
//! # Model Selection Strategy
//!
//! ```text
//! Role                         | simple           | medium         | complex
//! -----------------------------|------------------|----------------|--------------
//! architect, documenter        | claude-haiku     | claude-sonnet  | claude-opus
//! developer                    | gpt-4o-mini      | gpt-4o         | gpt-5.1
//! reviewer, tester, devops,    | gemini-2.5-flash | gemini-2.5-pro | gemini-3-pro
//! security, optimizer          |                  |                |
//! ```

pub mod classifier;

pub use classifier::{tokenize, Classification, ClassifierKeywords, Complexity, ComplexityClassifier};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::agents::{AgentDescriptor, AgentRegistry};

/// Model selection result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub role: String,
    pub complexity: Complexity,
    pub model_id: String,
    /// Reason for selection
    pub reason: String,
}

/// Complexity classifier plus role registry
#[derive(Debug, Clone)]
pub struct ModelRouter {
    classifier: ComplexityClassifier,
    registry: Arc<AgentRegistry>,
}

impl ModelRouter {
    pub fn new(classifier: ComplexityClassifier, registry: Arc<AgentRegistry>) -> Self {
        Self {
            classifier,
            registry,
        }
    }

    /// Role registry
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Classifier
    pub fn classifier(&self) -> &ComplexityClassifier {
        &self.classifier
    }

    /// Select the model `role` should use for a task. `None` when the role
    /// is not registered.
    pub fn select(
        &self,
        role: &str,
        title: &str,
        description: &str,
    ) -> Option<(Arc<AgentDescriptor>, ModelSelection)> {
        let descriptor = self.registry.get(role)?;
        let classification = self.classifier.classify_task(title, description);
        let model_id = descriptor
            .roster
            .model_for(classification.complexity)
            .to_string();

        let reason = if classification.matched.is_empty() {
            "no complexity keywords, defaulting to medium".to_string()
        } else {
            format!(
                "{} keywords: {}",
                classification.complexity,
                classification.matched.join(", ")
            )
        };

        let selection = ModelSelection {
            role: role.to_string(),
            complexity: classification.complexity,
            model_id,
            reason,
        };
        Some((descriptor, selection))
    }
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new(
            ComplexityClassifier::default(),
            Arc::new(AgentRegistry::with_defaults()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_by_complexity() {
        let router = ModelRouter::default();

        let (_, selection) = router.select("developer", "Add caching layer", "").unwrap();
        assert_eq!(selection.complexity, Complexity::Medium);
        assert_eq!(selection.model_id, "gpt-4o");

        let (_, selection) = router
            .select("architect", "Redesign the storage layer", "")
            .unwrap();
        assert_eq!(selection.model_id, "claude-opus");
        assert!(selection.reason.contains("redesign"));

        let (_, selection) = router.select("reviewer", "Fix typo", "").unwrap();
        assert_eq!(selection.model_id, "gemini-2.5-flash");
    }

    #[test]
    fn test_unknown_role() {
        assert!(ModelRouter::default().select("wizard", "x", "y").is_none());
    }
}
