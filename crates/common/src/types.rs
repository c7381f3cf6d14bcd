use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Account identifier. Matches the integer ids used on the queue wire format.
pub type AccountId = i64;

/// Activity identifier.
pub type ActivityId = i64;

/// Message identifier.
pub type MessageId = i64;

/// Upper bound on the number of recipients a single delivery job may carry.
///
/// Enforced once, at `RecipientChunk` construction. Everything downstream can
/// rely on the bound without re-checking it.
pub const CHUNK_LIMIT: usize = 50;

/// Kinds of entities the platform stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Account,
    Post,
    Comment,
    Group,
    NotificationConfig,
}

impl EntityKind {
    /// Content-bearing kinds can trigger activity creation on change events.
    pub fn is_content_bearing(self) -> bool {
        matches!(self, EntityKind::Post | EntityKind::Comment | EntityKind::Group)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Account => write!(f, "account"),
            EntityKind::Post => write!(f, "post"),
            EntityKind::Comment => write!(f, "comment"),
            EntityKind::Group => write!(f, "group"),
            EntityKind::NotificationConfig => write!(f, "notification_config"),
        }
    }
}

/// Typed reference to a stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: i64) -> Self {
        Self { kind, id }
    }

    /// Reference to an account entity.
    pub fn account(id: AccountId) -> Self {
        Self {
            kind: EntityKind::Account,
            id,
        }
    }

    /// The account id when this reference points at an account.
    pub fn as_account(&self) -> Option<AccountId> {
        match self.kind {
            EntityKind::Account => Some(self.id),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Language tag (e.g., "en", "nl").
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct Langcode(String);

impl Langcode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Langcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery cadence a recipient prefers for a message template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Immediately,
    Daily,
    Weekly,
    None,
}

impl Frequency {
    /// Fixed order in which the delivery job partitions a recipient pool.
    /// Each recipient is claimed by the first class that matches their stored
    /// preference, so the order is part of the partition contract.
    pub const PRIORITY: [Frequency; 4] = [
        Frequency::Immediately,
        Frequency::Daily,
        Frequency::Weekly,
        Frequency::None,
    ];
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frequency::Immediately => write!(f, "immediately"),
            Frequency::Daily => write!(f, "daily"),
            Frequency::Weekly => write!(f, "weekly"),
            Frequency::None => write!(f, "none"),
        }
    }
}

/// Who can see an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Community,
    Private,
}

/// Snapshot of a stored entity, handed across the storage boundary.
///
/// The query machinery that produced it lives outside this system; plugins
/// only ever see this value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_ref: EntityRef,
    pub bundle: String,
    pub owner: AccountId,
    pub langcode: Option<Langcode>,
    pub published: bool,
    pub visibility: Visibility,
    pub fields: serde_json::Value,
}

/// A platform account.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: AccountId,
    pub mail: String,
    pub display_name: String,
    pub preferred_langcode: Option<Langcode>,
    pub blocked: bool,
    pub created_at: DateTime<Utc>,
}

/// A recorded notable event, the unit of notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub related_entity: EntityRef,
    /// Ordinarily account refs. May be empty, meaning "resolve at delivery
    /// time from the stored recipients field".
    pub recipients: Vec<EntityRef>,
    pub message_id: MessageId,
    pub destinations: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields for an activity about to be stored.
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub related_entity: EntityRef,
    pub recipients: Vec<EntityRef>,
    pub message_id: MessageId,
    pub destinations: Vec<String>,
}

/// Templated message text with bound arguments. Immutable once created;
/// body rendering happens lazily per requested language.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: MessageId,
    pub template: String,
    pub arguments: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Rendered message text for one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedBody {
    pub subject: String,
    pub body: String,
}

/// A bounded (≤ `CHUNK_LIMIT`) subset of recipients processed or re-enqueued
/// as one unit of work. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientChunk {
    accounts: Vec<AccountId>,
    langcode: Option<Langcode>,
}

impl RecipientChunk {
    /// Build a chunk, rejecting empty or over-sized input.
    pub fn new(accounts: Vec<AccountId>, langcode: Option<Langcode>) -> Result<Self, AppError> {
        if accounts.is_empty() {
            return Err(AppError::Validation(
                "recipient chunk must not be empty".to_string(),
            ));
        }
        if accounts.len() > CHUNK_LIMIT {
            return Err(AppError::Validation(format!(
                "recipient chunk holds {} accounts, limit is {}",
                accounts.len(),
                CHUNK_LIMIT
            )));
        }
        Ok(Self { accounts, langcode })
    }

    /// Partition an arbitrary recipient list into conforming chunks,
    /// preserving input order.
    pub fn split_all(accounts: &[AccountId], langcode: Option<Langcode>) -> Vec<RecipientChunk> {
        accounts
            .chunks(CHUNK_LIMIT)
            .map(|chunk| Self {
                accounts: chunk.to_vec(),
                langcode: langcode.clone(),
            })
            .collect()
    }

    pub fn accounts(&self) -> &[AccountId] {
        &self.accounts
    }

    pub fn langcode(&self) -> Option<&Langcode> {
        self.langcode.as_ref()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

/// Queue wire payload for one delivery job invocation.
///
/// Either carries no explicit recipient list ("derive from the activity's
/// stored recipients") or a previously split chunk of at most `CHUNK_LIMIT`
/// accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJobPayload {
    #[serde(rename = "activityID")]
    pub activity_id: ActivityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<AccountId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub langcode: Option<Langcode>,
}

impl DeliveryJobPayload {
    /// Payload for the first invocation after activity creation.
    pub fn initial(activity_id: ActivityId) -> Self {
        Self {
            activity_id,
            recipients: None,
            langcode: None,
        }
    }

    /// Payload for a previously split chunk. The chunk constructor already
    /// enforced the size bound.
    pub fn for_chunk(activity_id: ActivityId, chunk: RecipientChunk) -> Self {
        let RecipientChunk { accounts, langcode } = chunk;
        Self {
            activity_id,
            recipients: Some(accounts),
            langcode,
        }
    }

    /// Parse and validate a raw queue item. Fails fast on a missing
    /// `activityID` or an over-sized recipient list.
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let payload: Self = serde_json::from_str(raw)?;
        payload.validate()?;
        Ok(payload)
    }

    /// Schema validation beyond what serde enforces structurally.
    pub fn validate(&self) -> Result<(), AppError> {
        if let Some(recipients) = &self.recipients
            && recipients.len() > CHUNK_LIMIT
        {
            return Err(AppError::Validation(format!(
                "payload carries {} recipients, limit is {}",
                recipients.len(),
                CHUNK_LIMIT
            )));
        }
        Ok(())
    }

    /// The explicit recipient list, when this payload is a split chunk.
    /// An empty list behaves the same as an absent one.
    pub fn chunk_accounts(&self) -> Option<&[AccountId]> {
        match self.recipients.as_deref() {
            Some([]) | None => None,
            Some(accounts) => Some(accounts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_rejects_oversized_input() {
        let accounts: Vec<AccountId> = (1..=51).collect();
        let result = RecipientChunk::new(accounts, None);
        assert!(result.is_err());
    }

    #[test]
    fn test_chunk_rejects_empty_input() {
        assert!(RecipientChunk::new(vec![], None).is_err());
    }

    #[test]
    fn test_chunk_accepts_limit() {
        let accounts: Vec<AccountId> = (1..=50).collect();
        let chunk = RecipientChunk::new(accounts, Some(Langcode::new("en"))).unwrap();
        assert_eq!(chunk.len(), 50);
        assert_eq!(chunk.langcode().unwrap().as_str(), "en");
    }

    #[test]
    fn test_split_all_chunk_sizes() {
        let accounts: Vec<AccountId> = (1..=120).collect();
        let chunks = RecipientChunk::split_all(&accounts, None);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 50);
        assert_eq!(chunks[1].len(), 50);
        assert_eq!(chunks[2].len(), 20);
        // Order preserved across the split
        assert_eq!(chunks[0].accounts()[0], 1);
        assert_eq!(chunks[2].accounts()[19], 120);
    }

    #[test]
    fn test_payload_requires_activity_id() {
        let result = DeliveryJobPayload::from_json(r#"{"recipients": [1, 2]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_payload_wire_format_round_trip() {
        let raw = r#"{"activityID": 7, "recipients": [1, 2, 3], "langcode": "nl"}"#;
        let payload = DeliveryJobPayload::from_json(raw).unwrap();
        assert_eq!(payload.activity_id, 7);
        assert_eq!(payload.chunk_accounts().unwrap(), &[1, 2, 3]);
        assert_eq!(payload.langcode.as_ref().unwrap().as_str(), "nl");

        let serialized = serde_json::to_value(&payload).unwrap();
        assert_eq!(serialized["activityID"], 7);
    }

    #[test]
    fn test_payload_rejects_oversized_recipient_list() {
        let recipients: Vec<AccountId> = (1..=51).collect();
        let raw = serde_json::json!({"activityID": 1, "recipients": recipients}).to_string();
        assert!(DeliveryJobPayload::from_json(&raw).is_err());
    }

    #[test]
    fn test_payload_empty_recipients_behave_as_absent() {
        let payload = DeliveryJobPayload::from_json(r#"{"activityID": 3, "recipients": []}"#).unwrap();
        assert!(payload.chunk_accounts().is_none());
    }

    #[test]
    fn test_frequency_priority_order() {
        assert_eq!(
            Frequency::PRIORITY,
            [
                Frequency::Immediately,
                Frequency::Daily,
                Frequency::Weekly,
                Frequency::None,
            ]
        );
    }

    #[test]
    fn test_entity_ref_display() {
        let entity = EntityRef::new(EntityKind::Post, 42);
        assert_eq!(entity.to_string(), "post:42");
        assert!(entity.as_account().is_none());
        assert_eq!(EntityRef::account(9).as_account(), Some(9));
    }
}
