//! Class registry.
//!
//! Maps automation class names to their built definitions so persisted
//! instances can be rebound to their graph when the driver or a message
//! picks them up.

use std::sync::Arc;

use dashmap::DashMap;

use super::definition::WorkflowDefinition;
use super::error::ConfigError;

/// Shared, concurrent class-name -> definition map. Cloning shares the map.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    classes: Arc<DashMap<String, Arc<WorkflowDefinition>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under its class name, replacing any earlier one.
    pub fn register(&self, definition: Arc<WorkflowDefinition>) {
        let class = definition.class().to_string();
        if self.classes.insert(class.clone(), definition).is_some() {
            tracing::warn!(class = %class, "replaced previously registered workflow definition");
        } else {
            tracing::debug!(class = %class, "registered workflow definition");
        }
    }

    pub fn get(&self, class: &str) -> Result<Arc<WorkflowDefinition>, ConfigError> {
        self.classes
            .get(class)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConfigError::UnknownClass(class.to_string()))
    }

    pub fn contains(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    /// `(class, verbose_name)` pairs sorted by class.
    pub fn classes(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .classes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().verbose_name().to_string()))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::node::Node;

    fn definition(class: &str) -> Arc<WorkflowDefinition> {
        WorkflowDefinition::builder(class)
            .node("done", Node::end())
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let registry = Registry::new();
        registry.register(definition("billing"));
        registry.register(definition("audit"));

        assert_eq!(registry.get("billing").unwrap().class(), "billing");
        assert!(registry.contains("audit"));
        assert_eq!(
            registry.get("missing").unwrap_err(),
            ConfigError::UnknownClass("missing".into())
        );
        assert_eq!(
            registry.classes(),
            vec![
                ("audit".to_string(), "Automation audit".to_string()),
                ("billing".to_string(), "Automation billing".to_string()),
            ]
        );
    }

    #[test]
    fn test_clones_share_entries() {
        let registry = Registry::new();
        let clone = registry.clone();
        clone.register(definition("billing"));
        assert!(registry.contains("billing"));
    }
}
