//! Body rendering stand-in.
//!
//! The real render stack (themes, tokens, translation pipeline) is outside
//! this system. What the delivery job needs from it is small: given a message
//! and an optional language, produce subject and body text. This renderer
//! substitutes `[token]` markers from the message's bound arguments into
//! per-template patterns, with optional per-language body overrides.

use std::collections::HashMap;

use sqlx::PgPool;

use murmur_common::error::AppError;
use murmur_common::types::{Langcode, Message, RenderedBody};

use crate::traits::BodyRenderer;

/// Subject/body patterns for one template.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TemplatePatterns {
    pub subject: String,
    pub body: String,
    /// Body pattern overrides keyed by langcode.
    #[serde(default)]
    pub translations: HashMap<String, String>,
}

/// Token-substituting renderer over an in-memory template catalog.
pub struct TokenBodyRenderer {
    catalog: HashMap<String, TemplatePatterns>,
}

impl TokenBodyRenderer {
    pub fn new(catalog: HashMap<String, TemplatePatterns>) -> Self {
        Self { catalog }
    }

    /// Load the catalog from the `message_templates` table.
    pub async fn load(pool: &PgPool) -> Result<Self, AppError> {
        let rows: Vec<(String, String, String, serde_json::Value)> = sqlx::query_as(
            "SELECT template, subject_pattern, body_pattern, translations FROM message_templates",
        )
        .fetch_all(pool)
        .await?;

        let mut catalog = HashMap::new();
        for (template, subject, body, translations) in rows {
            catalog.insert(
                template,
                TemplatePatterns {
                    subject,
                    body,
                    translations: serde_json::from_value(translations).unwrap_or_default(),
                },
            );
        }
        tracing::info!(templates = catalog.len(), "Template catalog loaded");
        Ok(Self { catalog })
    }

    fn substitute(pattern: &str, arguments: &serde_json::Value) -> String {
        let Some(map) = arguments.as_object() else {
            return pattern.to_string();
        };
        let mut rendered = pattern.to_string();
        for (key, value) in map {
            let token = format!("[{key}]");
            if !rendered.contains(&token) {
                continue;
            }
            let text = match value {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            rendered = rendered.replace(&token, &text);
        }
        rendered
    }
}

impl BodyRenderer for TokenBodyRenderer {
    fn render(
        &self,
        message: &Message,
        langcode: Option<&Langcode>,
    ) -> Result<RenderedBody, AppError> {
        let patterns = self.catalog.get(&message.template).ok_or_else(|| {
            AppError::NotFound(format!("No patterns for template '{}'", message.template))
        })?;

        let body_pattern = langcode
            .and_then(|langcode| patterns.translations.get(langcode.as_str()))
            .unwrap_or(&patterns.body);

        Ok(RenderedBody {
            subject: Self::substitute(&patterns.subject, &message.arguments),
            body: Self::substitute(body_pattern, &message.arguments),
        })
    }
}
