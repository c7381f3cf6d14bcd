//! Collaborator boundaries the delivery pipeline depends on.
//!
//! Every collaborator is passed into the consuming component at construction
//! so tests can substitute in-memory implementations. The Postgres/Redis
//! implementations live in `store` and `transport`.

use std::collections::HashMap;

use async_trait::async_trait;

use murmur_common::error::AppError;
use murmur_common::types::{
    Account, AccountId, Activity, ActivityId, DeliveryJobPayload, Entity, EntityRef, Frequency,
    Langcode, Message, MessageId, NewActivity, RenderedBody,
};

/// Activity, message and account storage.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn load_activity(&self, id: ActivityId) -> Result<Option<Activity>, AppError>;

    async fn create_activity(&self, activity: NewActivity) -> Result<Activity, AppError>;

    /// Delete an activity and everything hanging off it (pending outbox and
    /// digest rows).
    async fn delete_activity(&self, id: ActivityId) -> Result<(), AppError>;

    /// Whether the referenced entity still exists.
    async fn entity_exists(&self, entity: &EntityRef) -> Result<bool, AppError>;

    async fn load_message(&self, id: MessageId) -> Result<Option<Message>, AppError>;

    /// Load accounts preserving the order of `ids`. Ids that no longer
    /// resolve are silently absent from the result.
    async fn load_accounts(&self, ids: &[AccountId]) -> Result<Vec<Account>, AppError>;

    /// Stored preferred language per account. Accounts without a stored
    /// preference map to `None`.
    async fn preferred_langcodes(
        &self,
        ids: &[AccountId],
    ) -> Result<HashMap<AccountId, Option<Langcode>>, AppError>;
}

/// Per-(account, template) frequency preference lookup.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// The stored preference for one account, if any.
    async fn frequency_for(
        &self,
        account: AccountId,
        template: &str,
    ) -> Result<Option<Frequency>, AppError>;

    /// The subset of `accounts` whose stored preference for `template` is
    /// `frequency`, preserving the order of `accounts`.
    async fn matching(
        &self,
        accounts: &[AccountId],
        template: &str,
        frequency: Frequency,
    ) -> Result<Vec<AccountId>, AppError>;

    /// The template's configured default, falling back to `immediately` when
    /// the template has none configured.
    async fn default_for(&self, template: &str) -> Result<Frequency, AppError>;
}

/// Access policy evaluation; only the boolean result is consumed here.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn can_view(&self, account: &Account, entity: &EntityRef) -> Result<bool, AppError>;
}

/// Opaque re-enqueue onto the delivery queue.
#[async_trait]
pub trait JobTransport: Send + Sync {
    async fn enqueue(&self, payload: &DeliveryJobPayload) -> Result<(), AppError>;
}

/// Lazy per-language body rendering. Internals are outside this system.
pub trait BodyRenderer: Send + Sync {
    fn render(
        &self,
        message: &Message,
        langcode: Option<&Langcode>,
    ) -> Result<RenderedBody, AppError>;
}

/// External message factory, keyed by action id.
#[async_trait]
pub trait MessageFactory: Send + Sync {
    async fn create_for_action(
        &self,
        entity: &Entity,
        action_id: &str,
    ) -> Result<Message, AppError>;
}
