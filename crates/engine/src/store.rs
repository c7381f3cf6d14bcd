//! PostgreSQL implementations of the collaborator boundaries.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use murmur_common::error::AppError;
use murmur_common::types::{
    Account, AccountId, Activity, ActivityId, Entity, EntityKind, EntityRef, Frequency, Langcode,
    Message, MessageId, NewActivity, RenderedBody, Visibility,
};
use murmur_plugins::context::ContextSource;
use murmur_plugins::frequency::DispatchSink;

use crate::traits::{AccessControl, ActivityStore, MessageFactory, PreferenceStore};

/// Row shape of the `activities` table; recipients and destinations are
/// stored as JSONB.
#[derive(sqlx::FromRow)]
struct ActivityRow {
    id: ActivityId,
    entity_kind: EntityKind,
    entity_id: i64,
    message_id: MessageId,
    recipients: serde_json::Value,
    destinations: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl ActivityRow {
    fn into_activity(self) -> Result<Activity, AppError> {
        Ok(Activity {
            id: self.id,
            related_entity: EntityRef::new(self.entity_kind, self.entity_id),
            recipients: serde_json::from_value(self.recipients)?,
            message_id: self.message_id,
            destinations: serde_json::from_value(self.destinations)?,
            created_at: self.created_at,
        })
    }
}

/// Activity, message and account storage over Postgres.
#[derive(Clone)]
pub struct PgActivityStore {
    pool: PgPool,
}

impl PgActivityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActivityStore for PgActivityStore {
    async fn load_activity(&self, id: ActivityId) -> Result<Option<Activity>, AppError> {
        let row: Option<ActivityRow> =
            sqlx::query_as("SELECT * FROM activities WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(ActivityRow::into_activity).transpose()
    }

    async fn create_activity(&self, activity: NewActivity) -> Result<Activity, AppError> {
        let row: ActivityRow = sqlx::query_as(
            r#"
            INSERT INTO activities (entity_kind, entity_id, message_id, recipients, destinations)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(activity.related_entity.kind)
        .bind(activity.related_entity.id)
        .bind(activity.message_id)
        .bind(serde_json::to_value(&activity.recipients)?)
        .bind(serde_json::to_value(&activity.destinations)?)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            activity_id = row.id,
            entity = %activity.related_entity,
            "Activity created"
        );
        row.into_activity()
    }

    async fn delete_activity(&self, id: ActivityId) -> Result<(), AppError> {
        // Pending hand-off rows go first, then the activity itself.
        sqlx::query("DELETE FROM email_outbox WHERE activity_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM email_digest_queue WHERE activity_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM activities WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            tracing::info!(activity_id = id, "Activity deleted");
        }
        Ok(())
    }

    async fn entity_exists(&self, entity: &EntityRef) -> Result<bool, AppError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM entities WHERE kind = $1 AND id = $2)",
        )
        .bind(entity.kind)
        .bind(entity.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn load_message(&self, id: MessageId) -> Result<Option<Message>, AppError> {
        let message: Option<Message> = sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(message)
    }

    async fn load_accounts(&self, ids: &[AccountId]) -> Result<Vec<Account>, AppError> {
        let rows: Vec<Account> = sqlx::query_as("SELECT * FROM accounts WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;

        // Postgres gives no order guarantee for ANY(); restore request order.
        let mut by_id: HashMap<AccountId, Account> =
            rows.into_iter().map(|account| (account.id, account)).collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn preferred_langcodes(
        &self,
        ids: &[AccountId],
    ) -> Result<HashMap<AccountId, Option<Langcode>>, AppError> {
        let rows: Vec<(AccountId, Option<Langcode>)> =
            sqlx::query_as("SELECT id, preferred_langcode FROM accounts WHERE id = ANY($1)")
                .bind(ids.to_vec())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }
}

/// Frequency preference lookups over Postgres.
#[derive(Clone)]
pub struct PgPreferenceStore {
    pool: PgPool,
}

impl PgPreferenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferenceStore for PgPreferenceStore {
    async fn frequency_for(
        &self,
        account: AccountId,
        template: &str,
    ) -> Result<Option<Frequency>, AppError> {
        let row: Option<(Frequency,)> = sqlx::query_as(
            "SELECT frequency FROM notification_preferences WHERE account_id = $1 AND template = $2",
        )
        .bind(account)
        .bind(template)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(frequency,)| frequency))
    }

    async fn matching(
        &self,
        accounts: &[AccountId],
        template: &str,
        frequency: Frequency,
    ) -> Result<Vec<AccountId>, AppError> {
        let rows: Vec<(AccountId,)> = sqlx::query_as(
            r#"
            SELECT account_id FROM notification_preferences
            WHERE account_id = ANY($1) AND template = $2 AND frequency = $3
            "#,
        )
        .bind(accounts.to_vec())
        .bind(template)
        .bind(frequency)
        .fetch_all(&self.pool)
        .await?;

        // Report matches in input-pool order so partitioning stays
        // deterministic regardless of row order.
        let matched: std::collections::HashSet<AccountId> =
            rows.into_iter().map(|(id,)| id).collect();
        Ok(accounts
            .iter()
            .copied()
            .filter(|id| matched.contains(id))
            .collect())
    }

    async fn default_for(&self, template: &str) -> Result<Frequency, AppError> {
        let row: Option<(Option<Frequency>,)> = sqlx::query_as(
            "SELECT default_frequency FROM message_templates WHERE template = $1",
        )
        .bind(template)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .and_then(|(frequency,)| frequency)
            .unwrap_or(Frequency::Immediately))
    }
}

/// View-access evaluation against the related entity. Only the boolean
/// verdict leaves this type.
#[derive(Clone)]
pub struct PgAccessControl {
    pool: PgPool,
}

impl PgAccessControl {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccessControl for PgAccessControl {
    async fn can_view(&self, account: &Account, entity: &EntityRef) -> Result<bool, AppError> {
        let row: Option<(bool, Visibility, AccountId)> = sqlx::query_as(
            "SELECT published, visibility, owner_id FROM entities WHERE kind = $1 AND id = $2",
        )
        .bind(entity.kind)
        .bind(entity.id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((published, visibility, owner_id)) = row else {
            return Ok(false);
        };
        if !published {
            return Ok(false);
        }
        Ok(match visibility {
            Visibility::Public | Visibility::Community => true,
            Visibility::Private => owner_id == account.id,
        })
    }
}

/// Follower/membership lookups with keyset pagination.
#[derive(Clone)]
pub struct PgContextSource {
    pool: PgPool,
}

impl PgContextSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContextSource for PgContextSource {
    async fn followers_of(
        &self,
        target: &EntityRef,
        cursor: Option<AccountId>,
        limit: usize,
    ) -> Result<Vec<AccountId>, AppError> {
        let rows: Vec<(AccountId,)> = sqlx::query_as(
            r#"
            SELECT account_id FROM follows
            WHERE target_kind = $1 AND target_id = $2 AND account_id > $3
            ORDER BY account_id
            LIMIT $4
            "#,
        )
        .bind(target.kind)
        .bind(target.id)
        .bind(cursor.unwrap_or(0))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn members_of(
        &self,
        group: &EntityRef,
        cursor: Option<AccountId>,
        limit: usize,
    ) -> Result<Vec<AccountId>, AppError> {
        let rows: Vec<(AccountId,)> = sqlx::query_as(
            r#"
            SELECT account_id FROM group_members
            WHERE group_id = $1 AND account_id > $2
            ORDER BY account_id
            LIMIT $3
            "#,
        )
        .bind(group.id)
        .bind(cursor.unwrap_or(0))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

/// Hand-off rows for mail infrastructure: one outbox entry per immediate
/// send, one digest entry per periodic accumulation. The senders draining
/// these tables are outside this system.
#[derive(Clone)]
pub struct PgDispatchSink {
    pool: PgPool,
}

impl PgDispatchSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DispatchSink for PgDispatchSink {
    async fn deliver_now(
        &self,
        activity: &Activity,
        _message: &Message,
        account: &Account,
        body: &RenderedBody,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO email_outbox (id, activity_id, account_id, mail, subject, body, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(activity.id)
        .bind(account.id)
        .bind(&account.mail)
        .bind(&body.subject)
        .bind(&body.body)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            activity_id = activity.id,
            account_id = account.id,
            "Outbox entry spooled"
        );
        Ok(())
    }

    async fn queue_digest(
        &self,
        frequency: Frequency,
        activity: &Activity,
        _message: &Message,
        account: &Account,
        body: &RenderedBody,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO email_digest_queue (id, account_id, frequency, activity_id, subject, body)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account.id)
        .bind(frequency)
        .bind(activity.id)
        .bind(&body.subject)
        .bind(&body.body)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            activity_id = activity.id,
            account_id = account.id,
            frequency = %frequency,
            "Digest entry queued"
        );
        Ok(())
    }
}

/// Message creation keyed by action id. The action id doubles as the message
/// template; the triggering entity's fields become the bound arguments.
#[derive(Clone)]
pub struct PgMessageFactory {
    pool: PgPool,
}

impl PgMessageFactory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageFactory for PgMessageFactory {
    async fn create_for_action(
        &self,
        entity: &Entity,
        action_id: &str,
    ) -> Result<Message, AppError> {
        let mut arguments = entity.fields.clone();
        if let Some(map) = arguments.as_object_mut() {
            map.insert(
                "entity".to_string(),
                serde_json::Value::String(entity.entity_ref.to_string()),
            );
            map.insert("author".to_string(), serde_json::json!(entity.owner));
        }

        let message: Message = sqlx::query_as(
            r#"
            INSERT INTO messages (template, arguments)
            VALUES ($1, $2)
            RETURNING *
            "#,
        )
        .bind(action_id)
        .bind(&arguments)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            message_id = message.id,
            template = action_id,
            entity = %entity.entity_ref,
            "Message created"
        );
        Ok(message)
    }
}
