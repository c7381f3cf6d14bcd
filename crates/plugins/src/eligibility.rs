//! Entity-condition rules — "is this entity/bundle combination eligible for
//! notification at all".
//!
//! Rules are pure predicates keyed by (kind, bundle). The absence of a rule
//! means eligible, so stock content flows through untouched and sites only
//! register the conditions they care about.

use std::collections::HashMap;

use murmur_common::types::{Entity, EntityKind};

type EligibilityPredicate = Box<dyn Fn(&Entity) -> bool + Send + Sync>;

struct EligibilityRule {
    id: &'static str,
    predicate: EligibilityPredicate,
}

/// Registry of entity-condition rules, populated once at process start.
pub struct EligibilityRegistry {
    rules: HashMap<(EntityKind, String), EligibilityRule>,
}

impl EligibilityRegistry {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Registry with the stock rules: content must be published, and
    /// notification-config objects must be enabled.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for kind in [EntityKind::Post, EntityKind::Comment] {
            for bundle in ["topic", "discussion", "event"] {
                registry.register("published_content", kind, bundle, |entity| {
                    entity.published
                });
            }
        }
        registry.register(
            "enabled_config",
            EntityKind::NotificationConfig,
            "default",
            |entity| {
                entity
                    .fields
                    .get("enabled")
                    .and_then(|value| value.as_bool())
                    .unwrap_or(false)
            },
        );
        registry
    }

    /// Register a rule for a kind/bundle pair. Last registration wins.
    pub fn register<F>(&mut self, id: &'static str, kind: EntityKind, bundle: &str, predicate: F)
    where
        F: Fn(&Entity) -> bool + Send + Sync + 'static,
    {
        self.rules.insert(
            (kind, bundle.to_string()),
            EligibilityRule {
                id,
                predicate: Box::new(predicate),
            },
        );
    }

    /// Evaluate the rule registered for (kind, bundle) against the entity.
    /// No rule registered means eligible.
    pub fn is_eligible(&self, kind: EntityKind, bundle: &str, entity: &Entity) -> bool {
        match self.rules.get(&(kind, bundle.to_string())) {
            Some(rule) => {
                let eligible = (rule.predicate)(entity);
                if !eligible {
                    tracing::debug!(
                        rule = rule.id,
                        entity = %entity.entity_ref,
                        bundle,
                        "Entity filtered by eligibility rule"
                    );
                }
                eligible
            }
            None => true,
        }
    }
}

impl Default for EligibilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
