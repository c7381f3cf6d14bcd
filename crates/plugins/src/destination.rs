//! Destination plugins — the delivery channels an activity can reach.
//!
//! Destinations answer channel-specific presentation questions. Whether a
//! destination is active in a given view is a pure filter-state check; the
//! rendering pipeline that consumes the view mode lives outside this system.

use std::collections::BTreeSet;
use std::sync::Arc;

use murmur_common::error::AppError;
use murmur_common::types::{Entity, EntityKind};

use crate::registry::{PluginDefinition, PluginRegistry};

/// Destination selection state of a presentation context (e.g., an activity
/// stream view with a destination exposed filter).
#[derive(Debug, Clone, Default)]
pub struct DestinationFilter {
    selected: BTreeSet<String>,
}

impl DestinationFilter {
    pub fn new<I, S>(selected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            selected: selected.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.selected.contains(id)
    }
}

/// A delivery channel for activities.
pub trait ActivityDestination: Send + Sync {
    fn id(&self) -> &'static str;

    /// Channel-specific view mode override for rendering an entity.
    fn view_mode(&self, original: &str, entity: &Entity) -> String;
}

/// Email channel. Everything renders through mail view modes.
pub struct EmailDestination;

impl ActivityDestination for EmailDestination {
    fn id(&self) -> &'static str {
        "email"
    }

    fn view_mode(&self, _original: &str, entity: &Entity) -> String {
        match entity.entity_ref.kind {
            EntityKind::Comment => "mail_comment".to_string(),
            _ => "mail".to_string(),
        }
    }
}

/// In-app notification center. Keeps the caller's view mode.
pub struct NotificationsDestination;

impl ActivityDestination for NotificationsDestination {
    fn id(&self) -> &'static str {
        "notifications"
    }

    fn view_mode(&self, original: &str, _entity: &Entity) -> String {
        original.to_string()
    }
}

/// Registry of delivery channels plus the view-filter check.
pub struct DestinationRegistry {
    plugins: PluginRegistry<dyn ActivityDestination>,
}

impl DestinationRegistry {
    /// Registry with the stock channels.
    pub fn builtin() -> Self {
        let mut plugins: PluginRegistry<dyn ActivityDestination> = PluginRegistry::new();
        plugins.register(
            PluginDefinition {
                id: "email",
                label: "Email",
            },
            |_| Arc::new(EmailDestination),
        );
        plugins.register(
            PluginDefinition {
                id: "notifications",
                label: "Notification center",
            },
            |_| Arc::new(NotificationsDestination),
        );
        Self { plugins }
    }

    pub fn create(&self, id: &str) -> Result<Arc<dyn ActivityDestination>, AppError> {
        self.plugins.create(id, &serde_json::Value::Null)
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.plugins.definitions().into_keys().collect()
    }

    /// True exactly when the presentation context has this destination's id
    /// selected in its destination filter.
    pub fn is_active_in_view(&self, filter: &DestinationFilter, plugin_id: &str) -> bool {
        self.plugins.contains(plugin_id) && filter.is_selected(plugin_id)
    }
}
