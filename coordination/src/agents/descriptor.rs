//! Agent descriptors and the role registry
//!
//! A role is data, not code: adding a role means registering a descriptor
//! with a tier roster and a prompt template. Descriptors are immutable once
//! registered.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::router::Complexity;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Role already registered: {0}")]
    Duplicate(String),

    #[error("Invalid descriptor for role {role}: {reason}")]
    Invalid { role: String, reason: String },
}

/// Model id per complexity tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRoster {
    pub simple: String,
    pub medium: String,
    pub complex: String,
}

impl TierRoster {
    pub fn new(simple: &str, medium: &str, complex: &str) -> Self {
        Self {
            simple: simple.to_string(),
            medium: medium.to_string(),
            complex: complex.to_string(),
        }
    }

    /// Model bound to `complexity`
    pub fn model_for(&self, complexity: Complexity) -> &str {
        match complexity {
            Complexity::Simple => &self.simple,
            Complexity::Medium => &self.medium,
            Complexity::Complex => &self.complex,
        }
    }

    /// The Claude family roster
    pub fn anthropic() -> Self {
        Self::new("claude-haiku", "claude-sonnet", "claude-opus")
    }

    /// The GPT family roster
    pub fn openai() -> Self {
        Self::new("gpt-4o-mini", "gpt-4o", "gpt-5.1")
    }

    /// The Gemini family roster
    pub fn google() -> Self {
        Self::new("gemini-2.5-flash", "gemini-2.5-pro", "gemini-3-pro")
    }
}

/// Values substituted into a prompt template
#[derive(Debug, Clone, Default)]
pub struct PromptContext<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub task_type: &'a str,
    pub action: &'a str,
    pub previous_output: Option<&'a str>,
}

/// Default prompt used when a descriptor does not provide one
pub const DEFAULT_PROMPT_TEMPLATE: &str = "You are the {role} of a software team.\n\
Task: {title}\n\
Type: {task_type}\n\
Action: {action}\n\n\
{description}\n\n\
Previous step output:\n{previous_output}";

/// Registered agent role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub roster: TierRoster,
    #[serde(default = "default_template")]
    pub prompt_template: String,
}

fn default_template() -> String {
    DEFAULT_PROMPT_TEMPLATE.to_string()
}

impl AgentDescriptor {
    /// Create a descriptor with the default prompt template
    pub fn new(role: &str, capabilities: &[&str], roster: TierRoster) -> Self {
        Self {
            role: role.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            roster,
            prompt_template: default_template(),
        }
    }

    /// Replace the prompt template
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    /// Whether the role advertises `capability`
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Fill the template. Placeholders: `{role}`, `{title}`, `{description}`,
    /// `{task_type}`, `{action}`, `{previous_output}`.
    pub fn render_prompt(&self, ctx: &PromptContext<'_>) -> String {
        self.prompt_template
            .replace("{role}", &self.role)
            .replace("{title}", ctx.title)
            .replace("{description}", ctx.description)
            .replace("{task_type}", ctx.task_type)
            .replace("{action}", ctx.action)
            .replace("{previous_output}", ctx.previous_output.unwrap_or("(none)"))
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::Invalid {
            role: self.role.clone(),
            reason: reason.to_string(),
        };
        if self.role.trim().is_empty() {
            return Err(invalid("role name is empty"));
        }
        for model in [
            &self.roster.simple,
            &self.roster.medium,
            &self.roster.complex,
        ] {
            if model.trim().is_empty() {
                return Err(invalid("roster has an empty model id"));
            }
        }
        Ok(())
    }
}

/// Role registry, keyed by role name
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<AgentDescriptor>>,
    task_type_roles: BTreeMap<String, String>,
    fallback_role: Option<String>,
}

impl AgentRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the standard team roles
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for descriptor in default_descriptors() {
            // Defaults are distinct and valid.
            let _ = registry.register(descriptor);
        }
        for (task_type, role) in DEFAULT_TASK_TYPE_ROLES {
            registry
                .task_type_roles
                .insert(task_type.to_string(), role.to_string());
        }
        registry.fallback_role = Some("developer".to_string());
        registry
    }

    /// Add a role. Re-registering an existing role is an error.
    pub fn register(&mut self, descriptor: AgentDescriptor) -> Result<(), RegistryError> {
        descriptor.validate()?;
        if self.agents.contains_key(&descriptor.role) {
            return Err(RegistryError::Duplicate(descriptor.role));
        }
        self.agents
            .insert(descriptor.role.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Route a task-type tag to a role
    pub fn map_task_type(&mut self, task_type: &str, role: &str) {
        self.task_type_roles
            .insert(task_type.to_string(), role.to_string());
    }

    /// Look up a role
    pub fn get(&self, role: &str) -> Option<Arc<AgentDescriptor>> {
        self.agents.get(role).cloned()
    }

    /// Whether `role` is registered
    pub fn contains(&self, role: &str) -> bool {
        self.agents.contains_key(role)
    }

    /// Registered role names, sorted
    pub fn roles(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    /// Role responsible for a task-type tag. Falls back to the role named
    /// like the tag, then to the default role.
    pub fn role_for_task_type(&self, task_type: &str) -> Option<String> {
        if let Some(role) = self.task_type_roles.get(task_type) {
            return Some(role.clone());
        }
        if self.contains(task_type) {
            return Some(task_type.to_string());
        }
        self.fallback_role
            .clone()
            .filter(|r| self.contains(r))
    }

    /// Number of registered roles
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no role is registered
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

const DEFAULT_TASK_TYPE_ROLES: &[(&str, &str)] = &[
    ("architecture", "architect"),
    ("system_design", "architect"),
    ("api_design", "architect"),
    ("code_implementation", "developer"),
    ("feature", "developer"),
    ("bug_fix", "developer"),
    ("refactoring", "developer"),
    ("code_review", "reviewer"),
    ("unit_test_generation", "tester"),
    ("testing", "tester"),
    ("deployment", "devops"),
    ("ci_cd", "devops"),
    ("documentation", "documenter"),
    ("security_analysis", "security"),
    ("performance_analysis", "optimizer"),
];

/// The standard eight roles and their tier rosters
pub fn default_descriptors() -> Vec<AgentDescriptor> {
    vec![
        AgentDescriptor::new(
            "architect",
            &["architecture", "system_design", "api_design"],
            TierRoster::anthropic(),
        ),
        AgentDescriptor::new(
            "developer",
            &["code_generation", "debugging", "refactoring"],
            TierRoster::openai(),
        ),
        AgentDescriptor::new("reviewer", &["code_review"], TierRoster::google()),
        AgentDescriptor::new("tester", &["testing"], TierRoster::google()),
        AgentDescriptor::new("devops", &["devops"], TierRoster::google()),
        AgentDescriptor::new("documenter", &["documentation"], TierRoster::anthropic()),
        AgentDescriptor::new("security", &["security_analysis"], TierRoster::google()),
        AgentDescriptor::new(
            "optimizer",
            &["performance_analysis"],
            TierRoster::google(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rosters() {
        let registry = AgentRegistry::with_defaults();
        assert_eq!(registry.len(), 8);

        let architect = registry.get("architect").unwrap();
        assert_eq!(architect.roster.model_for(Complexity::Simple), "claude-haiku");
        assert_eq!(architect.roster.model_for(Complexity::Complex), "claude-opus");

        let developer = registry.get("developer").unwrap();
        assert_eq!(developer.roster.model_for(Complexity::Medium), "gpt-4o");
        assert_eq!(developer.roster.model_for(Complexity::Complex), "gpt-5.1");

        let reviewer = registry.get("reviewer").unwrap();
        assert_eq!(reviewer.roster.model_for(Complexity::Simple), "gemini-2.5-flash");
        assert_eq!(
            registry
                .get("documenter")
                .unwrap()
                .roster
                .model_for(Complexity::Medium),
            "claude-sonnet"
        );
    }

    #[test]
    fn test_register_new_role() {
        let mut registry = AgentRegistry::with_defaults();
        let translator = AgentDescriptor::new(
            "translator",
            &["translation"],
            TierRoster::new("small", "mid", "large"),
        );
        registry.register(translator.clone()).unwrap();
        assert!(registry.contains("translator"));
        assert_eq!(
            registry.register(translator),
            Err(RegistryError::Duplicate("translator".to_string()))
        );
        assert_eq!(registry.role_for_task_type("translator").as_deref(), Some("translator"));
    }

    #[test]
    fn test_invalid_descriptor() {
        let mut registry = AgentRegistry::new();
        let bad = AgentDescriptor::new("broken", &[], TierRoster::new("a", "", "c"));
        assert!(matches!(
            registry.register(bad),
            Err(RegistryError::Invalid { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_task_type_routing() {
        let registry = AgentRegistry::with_defaults();
        assert_eq!(registry.role_for_task_type("code_review").as_deref(), Some("reviewer"));
        assert_eq!(registry.role_for_task_type("tester").as_deref(), Some("tester"));
        assert_eq!(registry.role_for_task_type("unheard_of").as_deref(), Some("developer"));
        assert_eq!(AgentRegistry::new().role_for_task_type("anything"), None);
    }

    #[test]
    fn test_render_prompt() {
        let descriptor = AgentDescriptor::new("reviewer", &[], TierRoster::google())
            .with_template("{role}: {action} '{title}' after {previous_output}");
        let prompt = descriptor.render_prompt(&PromptContext {
            title: "Add caching layer",
            action: "code_review",
            previous_output: Some("diff"),
            ..Default::default()
        });
        assert_eq!(prompt, "reviewer: code_review 'Add caching layer' after diff");

        let fallback = descriptor.render_prompt(&PromptContext::default());
        assert!(fallback.ends_with("(none)"));
    }
}
