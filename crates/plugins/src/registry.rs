//! Shared registry shape for the plugin families.
//!
//! Plugin ids are resolved from an explicit map populated once at process
//! start. There is no runtime discovery: everything a process can create is
//! registered in code before the first lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use murmur_common::error::AppError;

/// Metadata describing a registered plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginDefinition {
    pub id: &'static str,
    pub label: &'static str,
}

type PluginFactory<T> = Box<dyn Fn(&serde_json::Value) -> Arc<T> + Send + Sync>;

struct PluginEntry<T: ?Sized> {
    definition: PluginDefinition,
    factory: PluginFactory<T>,
}

/// Id-keyed plugin registry: a definitions map plus a factory per id.
///
/// `BTreeMap` keeps definition iteration deterministic.
pub struct PluginRegistry<T: ?Sized> {
    entries: BTreeMap<&'static str, PluginEntry<T>>,
}

impl<T: ?Sized> PluginRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register a plugin under its definition id. Last registration wins,
    /// matching how site-specific plugins override stock ones.
    pub fn register<F>(&mut self, definition: PluginDefinition, factory: F)
    where
        F: Fn(&serde_json::Value) -> Arc<T> + Send + Sync + 'static,
    {
        self.entries.insert(
            definition.id,
            PluginEntry {
                definition,
                factory: Box::new(factory),
            },
        );
    }

    /// All registered definitions, keyed by id.
    pub fn definitions(&self) -> BTreeMap<&'static str, &PluginDefinition> {
        self.entries
            .iter()
            .map(|(id, entry)| (*id, &entry.definition))
            .collect()
    }

    /// Instantiate the plugin registered under `id` with the given config.
    pub fn create(&self, id: &str, config: &serde_json::Value) -> Result<Arc<T>, AppError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("No plugin registered for id '{id}'")))?;
        Ok((entry.factory)(config))
    }

    /// Instantiate every registered plugin with an empty config, in
    /// definition order.
    pub fn create_all(&self) -> Vec<Arc<T>> {
        let empty = serde_json::Value::Null;
        self.entries
            .values()
            .map(|entry| (entry.factory)(&empty))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }
}

impl<T: ?Sized> Default for PluginRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct Hello;
    impl Greeter for Hello {
        fn greet(&self) -> String {
            "hello".to_string()
        }
    }

    fn registry() -> PluginRegistry<dyn Greeter> {
        let mut registry: PluginRegistry<dyn Greeter> = PluginRegistry::new();
        registry.register(
            PluginDefinition {
                id: "hello",
                label: "Hello",
            },
            |_| Arc::new(Hello),
        );
        registry
    }

    #[test]
    fn test_create_by_id() {
        let registry = registry();
        let plugin = registry.create("hello", &serde_json::Value::Null).unwrap();
        assert_eq!(plugin.greet(), "hello");
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let registry = registry();
        assert!(registry.create("missing", &serde_json::Value::Null).is_err());
    }

    #[test]
    fn test_definitions_listed() {
        let registry = registry();
        let definitions = registry.definitions();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions["hello"].label, "Hello");
    }
}
