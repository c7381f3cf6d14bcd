//! Action resolution — turns a content-change event into an activity with a
//! message and a resolved recipient set, then queues delivery.

use std::collections::HashSet;
use std::sync::Arc;

use murmur_common::error::AppError;
use murmur_common::types::{
    Activity, DeliveryJobPayload, Entity, EntityKind, EntityRef, NewActivity,
};
use murmur_plugins::context::{ActivityContext, ContextData};
use murmur_plugins::eligibility::EligibilityRegistry;

use crate::traits::{ActivityStore, JobTransport, MessageFactory};

const LOG_TARGET: &str = "murmur::action";

/// Page size used while draining context plugins at creation time.
const CONTEXT_PAGE_SIZE: usize = 100;

/// Decides, on a content-change event, whether an activity is recorded, and
/// creates the associated message. No retries; failures propagate to the
/// event-handling layer.
pub struct ActionResolver {
    eligibility: EligibilityRegistry,
    contexts: Vec<Arc<dyn ActivityContext>>,
    factory: Arc<dyn MessageFactory>,
    store: Arc<dyn ActivityStore>,
    transport: Arc<dyn JobTransport>,
    /// Destination ids stamped onto every created activity.
    destinations: Vec<String>,
}

impl ActionResolver {
    pub fn new(
        eligibility: EligibilityRegistry,
        contexts: Vec<Arc<dyn ActivityContext>>,
        factory: Arc<dyn MessageFactory>,
        store: Arc<dyn ActivityStore>,
        transport: Arc<dyn JobTransport>,
        destinations: Vec<String>,
    ) -> Self {
        Self {
            eligibility,
            contexts,
            factory,
            store,
            transport,
            destinations,
        }
    }

    /// Handle one entity event. Returns the created activity, or `None` when
    /// the event is structurally out of scope or filtered by an eligibility
    /// rule.
    pub async fn on_entity_event(
        &self,
        entity: &Entity,
        action_id: &str,
    ) -> Result<Option<Activity>, AppError> {
        // Structural filter: only content-bearing entities and
        // notification-config objects can trigger activities. This is not an
        // eligibility rule; it never consults the registry.
        let kind = entity.entity_ref.kind;
        if !kind.is_content_bearing() && kind != EntityKind::NotificationConfig {
            return Ok(None);
        }

        if !self
            .eligibility
            .is_eligible(kind, &entity.bundle, entity)
        {
            tracing::debug!(
                target: LOG_TARGET,
                entity = %entity.entity_ref,
                action_id,
                "Entity not eligible, no activity recorded"
            );
            return Ok(None);
        }

        let message = self.factory.create_for_action(entity, action_id).await?;
        let recipients = self.collect_recipients(entity).await?;

        let activity = self
            .store
            .create_activity(NewActivity {
                related_entity: entity.entity_ref,
                recipients,
                message_id: message.id,
                destinations: self.destinations.clone(),
            })
            .await?;

        self.transport
            .enqueue(&DeliveryJobPayload::initial(activity.id))
            .await?;

        tracing::info!(
            target: LOG_TARGET,
            activity_id = activity.id,
            entity = %entity.entity_ref,
            action_id,
            recipients = activity.recipients.len(),
            "Activity recorded and queued for delivery"
        );
        Ok(Some(activity))
    }

    /// Drain every applicable context plugin to completion, deduplicating
    /// across contexts while keeping first-seen order.
    async fn collect_recipients(&self, entity: &Entity) -> Result<Vec<EntityRef>, AppError> {
        let data = ContextData {
            related_entity: entity.entity_ref,
            parameters: entity.fields.clone(),
        };

        let mut seen: HashSet<EntityRef> = HashSet::new();
        let mut recipients: Vec<EntityRef> = Vec::new();

        for context in &self.contexts {
            if !context.applies_to(entity) {
                continue;
            }

            let mut cursor = None;
            loop {
                let page = context
                    .recipients(&data, cursor, CONTEXT_PAGE_SIZE)
                    .await?;
                let Some(last) = page.last() else {
                    break;
                };
                cursor = last.as_account();
                let full_page = page.len() == CONTEXT_PAGE_SIZE;

                for recipient in page {
                    if seen.insert(recipient) {
                        recipients.push(recipient);
                    }
                }

                // A short page is the last one; a page of non-account refs
                // cannot advance the cursor either way.
                if !full_page || cursor.is_none() {
                    break;
                }
            }
        }

        Ok(recipients)
    }
}
