//! Context plugins — pluggable strategies that resolve which accounts should
//! receive an activity.
//!
//! Every context is a pure pagination function: the same (data, cursor, limit)
//! input yields the same page, and callers advance the cursor with the last
//! element of the previous page. Pages are ordered by ascending account id.
//! Backing lookups go through the `ContextSource` collaborator injected at
//! plugin construction.

use std::sync::Arc;

use async_trait::async_trait;

use murmur_common::error::AppError;
use murmur_common::types::{AccountId, Entity, EntityKind, EntityRef};

use crate::registry::{PluginDefinition, PluginRegistry};

/// Input handed to a context plugin: the activity's related entity plus the
/// triggering entity's field values.
#[derive(Debug, Clone)]
pub struct ContextData {
    pub related_entity: EntityRef,
    pub parameters: serde_json::Value,
}

/// Follower/membership lookups a context plugin may need. Implementations
/// must return pages ordered by ascending account id so cursor pagination
/// stays deterministic.
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Accounts following the target entity, with id greater than the cursor.
    async fn followers_of(
        &self,
        target: &EntityRef,
        cursor: Option<AccountId>,
        limit: usize,
    ) -> Result<Vec<AccountId>, AppError>;

    /// Accounts that are members of the group, with id greater than the cursor.
    async fn members_of(
        &self,
        group: &EntityRef,
        cursor: Option<AccountId>,
        limit: usize,
    ) -> Result<Vec<AccountId>, AppError>;
}

/// A recipient-producing strategy for one kind of activity.
#[async_trait]
pub trait ActivityContext: Send + Sync {
    fn id(&self) -> &'static str;

    /// Whether this context applies to the triggering entity at all.
    fn applies_to(&self, entity: &Entity) -> bool;

    /// One page of recipients. Pure pagination over (data, cursor, limit).
    async fn recipients(
        &self,
        data: &ContextData,
        cursor: Option<AccountId>,
        limit: usize,
    ) -> Result<Vec<EntityRef>, AppError>;
}

/// Resolve the owning account of a tagged item. Zero-or-one recipient;
/// anonymous items (owner 0) resolve to nothing.
pub fn item_owner(item: &Entity) -> Option<EntityRef> {
    if item.owner > 0 {
        Some(EntityRef::account(item.owner))
    } else {
        None
    }
}

/// Resolve the account a relationship object points at, read from its
/// `account` field. Zero-or-one recipient.
pub fn relationship_account(relationship: &Entity) -> Option<EntityRef> {
    relationship
        .fields
        .get("account")
        .and_then(|value| value.as_i64())
        .filter(|id| *id > 0)
        .map(EntityRef::account)
}

fn embedded_entity(parameters: &serde_json::Value, key: &str) -> Option<Entity> {
    parameters
        .get(key)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

fn embedded_ref(parameters: &serde_json::Value, key: &str) -> Option<EntityRef> {
    parameters
        .get(key)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

/// Keyset-page a zero-or-one resolution result.
fn page_single(recipient: Option<EntityRef>, cursor: Option<AccountId>) -> Vec<EntityRef> {
    recipient
        .into_iter()
        .filter(|entity| match (entity.as_account(), cursor) {
            (Some(id), Some(cursor)) => id > cursor,
            _ => cursor.is_none(),
        })
        .collect()
}

/// Everyone following the group an entity was posted to.
pub struct GroupFollowersContext {
    source: Arc<dyn ContextSource>,
}

impl GroupFollowersContext {
    pub fn new(source: Arc<dyn ContextSource>) -> Self {
        Self { source }
    }

    fn group_ref(data: &ContextData) -> Option<EntityRef> {
        embedded_ref(&data.parameters, "group").or({
            if data.related_entity.kind == EntityKind::Group {
                Some(data.related_entity)
            } else {
                None
            }
        })
    }
}

#[async_trait]
impl ActivityContext for GroupFollowersContext {
    fn id(&self) -> &'static str {
        "group_followers"
    }

    fn applies_to(&self, entity: &Entity) -> bool {
        entity.entity_ref.kind == EntityKind::Group || entity.fields.get("group").is_some()
    }

    async fn recipients(
        &self,
        data: &ContextData,
        cursor: Option<AccountId>,
        limit: usize,
    ) -> Result<Vec<EntityRef>, AppError> {
        let Some(group) = Self::group_ref(data) else {
            return Ok(Vec::new());
        };
        let followers = self.source.followers_of(&group, cursor, limit).await?;
        Ok(followers.into_iter().map(EntityRef::account).collect())
    }
}

/// Everyone following the content entity itself.
pub struct ContentFollowersContext {
    source: Arc<dyn ContextSource>,
}

impl ContentFollowersContext {
    pub fn new(source: Arc<dyn ContextSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ActivityContext for ContentFollowersContext {
    fn id(&self) -> &'static str {
        "content_followers"
    }

    fn applies_to(&self, entity: &Entity) -> bool {
        matches!(
            entity.entity_ref.kind,
            EntityKind::Post | EntityKind::Comment
        )
    }

    async fn recipients(
        &self,
        data: &ContextData,
        cursor: Option<AccountId>,
        limit: usize,
    ) -> Result<Vec<EntityRef>, AppError> {
        let followers = self
            .source
            .followers_of(&data.related_entity, cursor, limit)
            .await?;
        Ok(followers.into_iter().map(EntityRef::account).collect())
    }
}

/// All members of the group an entity was posted to.
pub struct GroupMembersContext {
    source: Arc<dyn ContextSource>,
}

impl GroupMembersContext {
    pub fn new(source: Arc<dyn ContextSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ActivityContext for GroupMembersContext {
    fn id(&self) -> &'static str {
        "group_members"
    }

    fn applies_to(&self, entity: &Entity) -> bool {
        entity.entity_ref.kind == EntityKind::Group || entity.fields.get("group").is_some()
    }

    async fn recipients(
        &self,
        data: &ContextData,
        cursor: Option<AccountId>,
        limit: usize,
    ) -> Result<Vec<EntityRef>, AppError> {
        let Some(group) = GroupFollowersContext::group_ref(data) else {
            return Ok(Vec::new());
        };
        let members = self.source.members_of(&group, cursor, limit).await?;
        Ok(members.into_iter().map(EntityRef::account).collect())
    }
}

/// The owner of a tagged item, via the `item_owner` leaf.
pub struct ItemOwnerContext;

#[async_trait]
impl ActivityContext for ItemOwnerContext {
    fn id(&self) -> &'static str {
        "item_owner"
    }

    fn applies_to(&self, entity: &Entity) -> bool {
        entity.fields.get("item").is_some()
    }

    async fn recipients(
        &self,
        data: &ContextData,
        cursor: Option<AccountId>,
        _limit: usize,
    ) -> Result<Vec<EntityRef>, AppError> {
        let recipient = embedded_entity(&data.parameters, "item")
            .as_ref()
            .and_then(item_owner);
        Ok(page_single(recipient, cursor))
    }
}

/// The account a relationship object references, via the
/// `relationship_account` leaf.
pub struct RelationshipContext;

#[async_trait]
impl ActivityContext for RelationshipContext {
    fn id(&self) -> &'static str {
        "relationship_account"
    }

    fn applies_to(&self, entity: &Entity) -> bool {
        entity.fields.get("relationship").is_some()
    }

    async fn recipients(
        &self,
        data: &ContextData,
        cursor: Option<AccountId>,
        _limit: usize,
    ) -> Result<Vec<EntityRef>, AppError> {
        let recipient = embedded_entity(&data.parameters, "relationship")
            .as_ref()
            .and_then(relationship_account);
        Ok(page_single(recipient, cursor))
    }
}

/// Registry with the stock context plugins, built once at process start.
pub fn context_registry(source: Arc<dyn ContextSource>) -> PluginRegistry<dyn ActivityContext> {
    let mut registry: PluginRegistry<dyn ActivityContext> = PluginRegistry::new();

    let followers_source = source.clone();
    registry.register(
        PluginDefinition {
            id: "group_followers",
            label: "Group followers",
        },
        move |_| Arc::new(GroupFollowersContext::new(followers_source.clone())),
    );

    let content_source = source.clone();
    registry.register(
        PluginDefinition {
            id: "content_followers",
            label: "Content followers",
        },
        move |_| Arc::new(ContentFollowersContext::new(content_source.clone())),
    );

    let members_source = source;
    registry.register(
        PluginDefinition {
            id: "group_members",
            label: "Group members",
        },
        move |_| Arc::new(GroupMembersContext::new(members_source.clone())),
    );

    registry.register(
        PluginDefinition {
            id: "item_owner",
            label: "Tagged item owner",
        },
        |_| Arc::new(ItemOwnerContext),
    );

    registry.register(
        PluginDefinition {
            id: "relationship_account",
            label: "Relationship account",
        },
        |_| Arc::new(RelationshipContext),
    );

    registry
}
