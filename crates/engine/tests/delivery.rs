//! Delivery pipeline tests against in-memory collaborators.
//!
//! These cover the split/partition/dispatch contract of the delivery job and
//! the activity-creation path of the action resolver, without a database or
//! a Redis instance.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use murmur_common::error::AppError;
use murmur_common::types::{
    Account, AccountId, Activity, ActivityId, CHUNK_LIMIT, DeliveryJobPayload, Entity, EntityKind,
    EntityRef, Frequency, Langcode, Message, MessageId, NewActivity, RenderedBody, Visibility,
};
use murmur_engine::action::ActionResolver;
use murmur_engine::job::{DeliveryJob, JobOutcome};
use murmur_engine::traits::{
    AccessControl, ActivityStore, BodyRenderer, JobTransport, MessageFactory, PreferenceStore,
};
use murmur_plugins::context::{ActivityContext, ContentFollowersContext, ContextSource, ItemOwnerContext};
use murmur_plugins::eligibility::EligibilityRegistry;
use murmur_plugins::frequency::{FrequencyDispatcher, FrequencyRegistry};

// ============================================================
// In-memory collaborators
// ============================================================

#[derive(Default)]
struct MemoryStore {
    activities: Mutex<HashMap<ActivityId, Activity>>,
    entities: Mutex<HashSet<EntityRef>>,
    messages: Mutex<HashMap<MessageId, Message>>,
    accounts: Mutex<HashMap<AccountId, Account>>,
    deleted: Mutex<Vec<ActivityId>>,
    next_activity_id: Mutex<ActivityId>,
}

impl MemoryStore {
    fn insert_activity(&self, activity: Activity) {
        self.entities
            .lock()
            .unwrap()
            .insert(activity.related_entity);
        self.activities
            .lock()
            .unwrap()
            .insert(activity.id, activity);
    }

    fn insert_message(&self, message: Message) {
        self.messages.lock().unwrap().insert(message.id, message);
    }

    fn insert_account(&self, account: Account) {
        self.accounts.lock().unwrap().insert(account.id, account);
    }

    fn remove_entity(&self, entity: &EntityRef) {
        self.entities.lock().unwrap().remove(entity);
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn load_activity(&self, id: ActivityId) -> Result<Option<Activity>, AppError> {
        Ok(self.activities.lock().unwrap().get(&id).cloned())
    }

    async fn create_activity(&self, activity: NewActivity) -> Result<Activity, AppError> {
        let mut next = self.next_activity_id.lock().unwrap();
        *next += 1;
        let created = Activity {
            id: *next,
            related_entity: activity.related_entity,
            recipients: activity.recipients,
            message_id: activity.message_id,
            destinations: activity.destinations,
            created_at: Utc::now(),
        };
        self.activities
            .lock()
            .unwrap()
            .insert(created.id, created.clone());
        Ok(created)
    }

    async fn delete_activity(&self, id: ActivityId) -> Result<(), AppError> {
        self.activities.lock().unwrap().remove(&id);
        self.deleted.lock().unwrap().push(id);
        Ok(())
    }

    async fn entity_exists(&self, entity: &EntityRef) -> Result<bool, AppError> {
        Ok(self.entities.lock().unwrap().contains(entity))
    }

    async fn load_message(&self, id: MessageId) -> Result<Option<Message>, AppError> {
        Ok(self.messages.lock().unwrap().get(&id).cloned())
    }

    async fn load_accounts(&self, ids: &[AccountId]) -> Result<Vec<Account>, AppError> {
        let accounts = self.accounts.lock().unwrap();
        Ok(ids.iter().filter_map(|id| accounts.get(id).cloned()).collect())
    }

    async fn preferred_langcodes(
        &self,
        ids: &[AccountId],
    ) -> Result<HashMap<AccountId, Option<Langcode>>, AppError> {
        let accounts = self.accounts.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| {
                accounts
                    .get(id)
                    .map(|account| (*id, account.preferred_langcode.clone()))
            })
            .collect())
    }
}

#[derive(Default)]
struct MemoryPrefs {
    stored: HashMap<(AccountId, String), Frequency>,
    defaults: HashMap<String, Frequency>,
}

impl MemoryPrefs {
    fn with_pref(mut self, account: AccountId, template: &str, frequency: Frequency) -> Self {
        self.stored.insert((account, template.to_string()), frequency);
        self
    }

    fn with_default(mut self, template: &str, frequency: Frequency) -> Self {
        self.defaults.insert(template.to_string(), frequency);
        self
    }
}

#[async_trait]
impl PreferenceStore for MemoryPrefs {
    async fn frequency_for(
        &self,
        account: AccountId,
        template: &str,
    ) -> Result<Option<Frequency>, AppError> {
        Ok(self.stored.get(&(account, template.to_string())).copied())
    }

    async fn matching(
        &self,
        accounts: &[AccountId],
        template: &str,
        frequency: Frequency,
    ) -> Result<Vec<AccountId>, AppError> {
        Ok(accounts
            .iter()
            .copied()
            .filter(|id| {
                self.stored.get(&(*id, template.to_string())) == Some(&frequency)
            })
            .collect())
    }

    async fn default_for(&self, template: &str) -> Result<Frequency, AppError> {
        Ok(self
            .defaults
            .get(template)
            .copied()
            .unwrap_or(Frequency::Immediately))
    }
}

#[derive(Default)]
struct MemoryAccess {
    denied: HashSet<AccountId>,
}

#[async_trait]
impl AccessControl for MemoryAccess {
    async fn can_view(&self, account: &Account, _entity: &EntityRef) -> Result<bool, AppError> {
        Ok(!self.denied.contains(&account.id))
    }
}

#[derive(Default)]
struct MemoryTransport {
    queued: Mutex<Vec<DeliveryJobPayload>>,
}

#[async_trait]
impl JobTransport for MemoryTransport {
    async fn enqueue(&self, payload: &DeliveryJobPayload) -> Result<(), AppError> {
        self.queued.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

/// Renders "template:langcode" so tests can observe which language a body
/// was rendered in.
struct EchoRenderer;

impl BodyRenderer for EchoRenderer {
    fn render(
        &self,
        message: &Message,
        langcode: Option<&Langcode>,
    ) -> Result<RenderedBody, AppError> {
        let lang = langcode.map(Langcode::as_str).unwrap_or("default");
        Ok(RenderedBody {
            subject: message.template.clone(),
            body: format!("{}:{}", message.template, lang),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DispatchRecord {
    frequency: Frequency,
    account_id: AccountId,
    body: String,
}

/// Records every processed tuple; optionally errors on one account to
/// exercise the no-isolation path.
struct RecordingDispatcher {
    frequency: Frequency,
    log: Arc<Mutex<Vec<DispatchRecord>>>,
    fail_on: Option<AccountId>,
}

#[async_trait]
impl FrequencyDispatcher for RecordingDispatcher {
    fn frequency(&self) -> Frequency {
        self.frequency
    }

    async fn process_item(
        &self,
        _activity: &Activity,
        _message: &Message,
        account: &Account,
        body: &RenderedBody,
    ) -> Result<(), AppError> {
        if self.fail_on == Some(account.id) {
            return Err(AppError::Internal(format!(
                "dispatcher refused account {}",
                account.id
            )));
        }
        self.log.lock().unwrap().push(DispatchRecord {
            frequency: self.frequency,
            account_id: account.id,
            body: body.body.clone(),
        });
        Ok(())
    }
}

// ============================================================
// Harness
// ============================================================

struct Harness {
    store: Arc<MemoryStore>,
    transport: Arc<MemoryTransport>,
    log: Arc<Mutex<Vec<DispatchRecord>>>,
    job: DeliveryJob,
}

struct HarnessConfig {
    prefs: MemoryPrefs,
    denied: HashSet<AccountId>,
    languages: Vec<Langcode>,
    fail_on: Option<AccountId>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            prefs: MemoryPrefs::default(),
            denied: HashSet::new(),
            languages: vec![Langcode::new("en")],
            fail_on: None,
        }
    }
}

fn harness(config: HarnessConfig) -> Harness {
    let store = Arc::new(MemoryStore::default());
    let prefs = Arc::new(config.prefs);
    let access = Arc::new(MemoryAccess {
        denied: config.denied,
    });
    let transport = Arc::new(MemoryTransport::default());
    let log: Arc<Mutex<Vec<DispatchRecord>>> = Arc::new(Mutex::new(Vec::new()));

    let mut frequencies = FrequencyRegistry::new();
    for frequency in Frequency::PRIORITY {
        frequencies.register(Arc::new(RecordingDispatcher {
            frequency,
            log: log.clone(),
            fail_on: config.fail_on,
        }));
    }

    let job = DeliveryJob::new(
        store.clone(),
        prefs,
        access,
        transport.clone(),
        Arc::new(EchoRenderer),
        frequencies,
        config.languages,
    );

    Harness {
        store,
        transport,
        log,
        job,
    }
}

fn make_account(id: AccountId, langcode: Option<&str>) -> Account {
    Account {
        id,
        mail: format!("u{id}@example.com"),
        display_name: format!("u{id}"),
        preferred_langcode: langcode.map(Langcode::new),
        blocked: false,
        created_at: Utc::now(),
    }
}

fn make_message(id: MessageId, template: &str) -> Message {
    Message {
        id,
        template: template.to_string(),
        arguments: serde_json::json!({}),
        created_at: Utc::now(),
    }
}

fn make_activity(id: ActivityId, recipients: &[AccountId], message_id: MessageId) -> Activity {
    Activity {
        id,
        related_entity: EntityRef::new(EntityKind::Post, 1000 + id),
        recipients: recipients.iter().copied().map(EntityRef::account).collect(),
        message_id,
        destinations: vec!["email".to_string()],
        created_at: Utc::now(),
    }
}

/// Seed an activity, its message and its recipient accounts.
fn seed(harness: &Harness, activity_id: ActivityId, recipients: &[AccountId], template: &str) {
    for id in recipients {
        harness.store.insert_account(make_account(*id, None));
    }
    harness.store.insert_message(make_message(activity_id, template));
    harness
        .store
        .insert_activity(make_activity(activity_id, recipients, activity_id));
}

fn dispatched_accounts(harness: &Harness) -> Vec<AccountId> {
    harness
        .log
        .lock()
        .unwrap()
        .iter()
        .map(|record| record.account_id)
        .collect()
}

fn accounts_for(harness: &Harness, frequency: Frequency) -> Vec<AccountId> {
    harness
        .log
        .lock()
        .unwrap()
        .iter()
        .filter(|record| record.frequency == frequency)
        .map(|record| record.account_id)
        .collect()
}

// ============================================================
// Scenario A: small pool, no stored preferences
// ============================================================

#[tokio::test]
async fn test_scenario_a_all_default_immediately() {
    let h = harness(HarnessConfig::default());
    seed(&h, 1, &[1, 2, 3], "post_created");

    let outcome = h.job.execute(DeliveryJobPayload::initial(1)).await;

    assert_eq!(outcome, JobOutcome::Completed { dispatched: 3 });
    assert_eq!(accounts_for(&h, Frequency::Immediately), vec![1, 2, 3]);
    for frequency in [Frequency::Daily, Frequency::Weekly, Frequency::None] {
        assert!(accounts_for(&h, frequency).is_empty());
    }
    assert!(h.transport.queued.lock().unwrap().is_empty());
}

// ============================================================
// Split invariants
// ============================================================

#[tokio::test]
async fn test_no_split_at_chunk_limit() {
    let h = harness(HarnessConfig::default());
    let recipients: Vec<AccountId> = (1..=CHUNK_LIMIT as i64).collect();
    seed(&h, 1, &recipients, "post_created");

    let outcome = h.job.execute(DeliveryJobPayload::initial(1)).await;

    assert_eq!(
        outcome,
        JobOutcome::Completed {
            dispatched: CHUNK_LIMIT
        }
    );
    assert!(h.transport.queued.lock().unwrap().is_empty());

    // Every recipient lands in exactly one frequency group
    let mut all = dispatched_accounts(&h);
    all.sort_unstable();
    assert_eq!(all, recipients);
}

#[tokio::test]
async fn test_scenario_b_sixty_recipients_split_fifty_ten() {
    let h = harness(HarnessConfig::default());
    let recipients: Vec<AccountId> = (1..=60).collect();
    seed(&h, 2, &recipients, "post_created");

    let outcome = h.job.execute(DeliveryJobPayload::initial(2)).await;

    assert_eq!(outcome, JobOutcome::Delegated { jobs_enqueued: 2 });
    // The splitting invocation performs zero direct dispatch
    assert!(dispatched_accounts(&h).is_empty());

    let queued = h.transport.queued.lock().unwrap();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].activity_id, 2);
    assert_eq!(queued[0].recipients.as_ref().unwrap().len(), 50);
    assert_eq!(queued[1].recipients.as_ref().unwrap().len(), 10);
    assert!(queued[0].langcode.is_none());
    for payload in queued.iter() {
        payload.validate().unwrap();
    }
}

#[tokio::test]
async fn test_split_enqueues_ceil_of_pool_over_limit() {
    let h = harness(HarnessConfig::default());
    let recipients: Vec<AccountId> = (1..=151).collect();
    seed(&h, 3, &recipients, "post_created");

    let outcome = h.job.execute(DeliveryJobPayload::initial(3)).await;

    // ceil(151 / 50) = 4
    assert_eq!(outcome, JobOutcome::Delegated { jobs_enqueued: 4 });
    let queued = h.transport.queued.lock().unwrap();
    let total: usize = queued
        .iter()
        .map(|payload| payload.recipients.as_ref().unwrap().len())
        .sum();
    assert_eq!(total, 151);
}

#[tokio::test]
async fn test_multilingual_split_groups_by_language() {
    let h = harness(HarnessConfig {
        languages: vec![Langcode::new("en"), Langcode::new("nl")],
        ..HarnessConfig::default()
    });

    // 55 Dutch accounts, 10 English, 5 without a stored language
    let recipients: Vec<AccountId> = (1..=70).collect();
    for id in 1..=55 {
        h.store.insert_account(make_account(id, Some("nl")));
    }
    for id in 56..=65 {
        h.store.insert_account(make_account(id, Some("en")));
    }
    for id in 66..=70 {
        h.store.insert_account(make_account(id, None));
    }
    h.store.insert_message(make_message(4, "post_created"));
    h.store.insert_activity(make_activity(4, &recipients, 4));

    let outcome = h.job.execute(DeliveryJobPayload::initial(4)).await;

    // en group: 10 stored + 5 default = 15 → 1 chunk; nl group: 55 → 2 chunks
    assert_eq!(outcome, JobOutcome::Delegated { jobs_enqueued: 3 });
    let queued = h.transport.queued.lock().unwrap();

    let en: Vec<_> = queued
        .iter()
        .filter(|p| p.langcode.as_ref().map(Langcode::as_str) == Some("en"))
        .collect();
    let nl: Vec<_> = queued
        .iter()
        .filter(|p| p.langcode.as_ref().map(Langcode::as_str) == Some("nl"))
        .collect();
    assert_eq!(en.len(), 1);
    assert_eq!(nl.len(), 2);
    assert_eq!(en[0].recipients.as_ref().unwrap().len(), 15);
    assert_eq!(nl[0].recipients.as_ref().unwrap().len(), 50);
    assert_eq!(nl[1].recipients.as_ref().unwrap().len(), 5);
}

#[tokio::test]
async fn test_chunk_payload_is_processed_verbatim() {
    let h = harness(HarnessConfig::default());
    // The stored activity has an over-sized pool, but a chunk payload must
    // never be split again.
    let recipients: Vec<AccountId> = (1..=60).collect();
    seed(&h, 5, &recipients, "post_created");

    let chunk: Vec<AccountId> = vec![7, 8, 9];
    let payload = DeliveryJobPayload {
        activity_id: 5,
        recipients: Some(chunk.clone()),
        langcode: Some(Langcode::new("nl")),
    };
    let outcome = h.job.execute(payload).await;

    assert_eq!(outcome, JobOutcome::Completed { dispatched: 3 });
    assert!(h.transport.queued.lock().unwrap().is_empty());
    assert_eq!(dispatched_accounts(&h), chunk);

    // One batch render covers the whole chunk
    for record in h.log.lock().unwrap().iter() {
        assert_eq!(record.body, "post_created:nl");
    }
}

// ============================================================
// Partitioning
// ============================================================

#[tokio::test]
async fn test_partition_totality_with_scenario_c() {
    let prefs = MemoryPrefs::default()
        .with_pref(1, "t", Frequency::Immediately)
        .with_pref(2, "t", Frequency::Immediately)
        .with_pref(3, "t", Frequency::Daily)
        .with_pref(7, "t", Frequency::Weekly)
        .with_pref(9, "t", Frequency::None)
        .with_default("t", Frequency::Daily);
    let h = harness(HarnessConfig {
        prefs,
        ..HarnessConfig::default()
    });
    let recipients: Vec<AccountId> = (1..=10).collect();
    seed(&h, 6, &recipients, "t");

    let outcome = h.job.execute(DeliveryJobPayload::initial(6)).await;
    assert_eq!(outcome, JobOutcome::Completed { dispatched: 10 });

    assert_eq!(accounts_for(&h, Frequency::Immediately), vec![1, 2]);
    // u7 appears only in the weekly group; u8 (no stored preference) only in
    // the default-fallback group dispatched via daily
    assert_eq!(accounts_for(&h, Frequency::Weekly), vec![7]);
    assert_eq!(accounts_for(&h, Frequency::None), vec![9]);
    assert_eq!(accounts_for(&h, Frequency::Daily), vec![3, 4, 5, 6, 8, 10]);

    // Union of all groups equals the pool, each exactly once
    let mut all = dispatched_accounts(&h);
    all.sort_unstable();
    assert_eq!(all, recipients);
}

#[tokio::test]
async fn test_priority_determinism_across_store_orders() {
    // Two stores with the same logical content, built in different orders
    let forward = MemoryPrefs::default()
        .with_pref(1, "t", Frequency::Daily)
        .with_pref(2, "t", Frequency::Weekly)
        .with_pref(3, "t", Frequency::Immediately);
    let reverse = MemoryPrefs::default()
        .with_pref(3, "t", Frequency::Immediately)
        .with_pref(2, "t", Frequency::Weekly)
        .with_pref(1, "t", Frequency::Daily);

    let mut logs = Vec::new();
    for prefs in [forward, reverse] {
        let h = harness(HarnessConfig {
            prefs,
            ..HarnessConfig::default()
        });
        seed(&h, 7, &[1, 2, 3, 4], "t");
        let outcome = h.job.execute(DeliveryJobPayload::initial(7)).await;
        assert_eq!(outcome, JobOutcome::Completed { dispatched: 4 });
        logs.push(h.log.lock().unwrap().clone());
    }

    assert_eq!(logs[0], logs[1], "same snapshot must partition identically");
}

// ============================================================
// Cleanup and failure paths
// ============================================================

#[tokio::test]
async fn test_dangling_entity_cleanup_returns_success() {
    let h = harness(HarnessConfig::default());
    seed(&h, 5, &[1, 2], "post_created");
    let activity = h.store.load_activity(5).await.unwrap().unwrap();
    h.store.remove_entity(&activity.related_entity);

    let outcome = h.job.execute(DeliveryJobPayload::initial(5)).await;

    assert_eq!(outcome, JobOutcome::CleanedUp);
    assert_eq!(*h.store.deleted.lock().unwrap(), vec![5]);
    assert!(h.store.load_activity(5).await.unwrap().is_none());
    assert!(dispatched_accounts(&h).is_empty());
}

#[tokio::test]
async fn test_missing_activity_is_expected_garbage() {
    let h = harness(HarnessConfig::default());
    let outcome = h.job.execute(DeliveryJobPayload::initial(404)).await;
    assert_eq!(outcome, JobOutcome::CleanedUp);
}

#[tokio::test]
async fn test_oversized_chunk_payload_fails() {
    let h = harness(HarnessConfig::default());
    seed(&h, 8, &[1], "post_created");

    let payload = DeliveryJobPayload {
        activity_id: 8,
        recipients: Some((1..=51).collect()),
        langcode: None,
    };
    match h.job.execute(payload).await {
        JobOutcome::Failed { error } => assert!(error.contains("51")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_group_is_a_resolution_failure() {
    let h = harness(HarnessConfig::default());
    seed(&h, 9, &[1], "post_created");
    let activity = h.store.load_activity(9).await.unwrap().unwrap();
    let message = h.store.load_message(9).await.unwrap().unwrap();

    let result = h
        .job
        .send_to_frequency(&activity, &message, &[], Frequency::Immediately, None)
        .await;

    match result {
        Err(AppError::Resolution(text)) => {
            assert_eq!(text, "expected recipients, none provided");
        }
        other => panic!("expected resolution failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_dispatch_error_aborts_rest_of_chunk() {
    let h = harness(HarnessConfig {
        fail_on: Some(2),
        ..HarnessConfig::default()
    });
    seed(&h, 10, &[1, 2, 3], "post_created");

    let outcome = h.job.execute(DeliveryJobPayload::initial(10)).await;

    // No per-account isolation: account 1 was already processed, account 3
    // never ran, and the job reports failure.
    assert!(matches!(outcome, JobOutcome::Failed { .. }));
    assert_eq!(dispatched_accounts(&h), vec![1]);
}

// ============================================================
// Per-account skips and rendering
// ============================================================

#[tokio::test]
async fn test_blocked_and_inaccessible_accounts_are_skipped() {
    let h = harness(HarnessConfig {
        denied: HashSet::from([3]),
        ..HarnessConfig::default()
    });
    seed(&h, 11, &[1, 2, 3], "post_created");
    h.store.insert_account(Account {
        blocked: true,
        ..make_account(2, None)
    });

    let outcome = h.job.execute(DeliveryJobPayload::initial(11)).await;

    // Skips are silent: the job still completes
    assert_eq!(outcome, JobOutcome::Completed { dispatched: 1 });
    assert_eq!(dispatched_accounts(&h), vec![1]);
}

#[tokio::test]
async fn test_body_rendered_per_account_language_without_batch_langcode() {
    let h = harness(HarnessConfig::default());
    h.store.insert_account(make_account(1, Some("nl")));
    h.store.insert_account(make_account(2, Some("en")));
    h.store.insert_account(make_account(3, None));
    h.store.insert_message(make_message(12, "post_created"));
    h.store.insert_activity(make_activity(12, &[1, 2, 3], 12));

    let outcome = h.job.execute(DeliveryJobPayload::initial(12)).await;
    assert_eq!(outcome, JobOutcome::Completed { dispatched: 3 });

    let bodies: Vec<String> = h
        .log
        .lock()
        .unwrap()
        .iter()
        .map(|record| record.body.clone())
        .collect();
    assert_eq!(
        bodies,
        vec![
            "post_created:nl".to_string(),
            "post_created:en".to_string(),
            "post_created:default".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_non_account_recipients_are_ignored() {
    let h = harness(HarnessConfig::default());
    h.store.insert_account(make_account(1, None));
    h.store.insert_message(make_message(13, "post_created"));
    let mut activity = make_activity(13, &[1], 13);
    activity
        .recipients
        .push(EntityRef::new(EntityKind::Group, 99));
    h.store.insert_activity(activity);

    let outcome = h.job.execute(DeliveryJobPayload::initial(13)).await;

    assert_eq!(outcome, JobOutcome::Completed { dispatched: 1 });
    assert_eq!(dispatched_accounts(&h), vec![1]);
}

// ============================================================
// Action resolver
// ============================================================

struct MemoryFactory {
    store: Arc<MemoryStore>,
    next_id: Mutex<MessageId>,
}

#[async_trait]
impl MessageFactory for MemoryFactory {
    async fn create_for_action(
        &self,
        _entity: &Entity,
        action_id: &str,
    ) -> Result<Message, AppError> {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        let message = make_message(*next, action_id);
        self.store.insert_message(message.clone());
        Ok(message)
    }
}

struct FixedFollowers {
    followers: Vec<AccountId>,
}

#[async_trait]
impl ContextSource for FixedFollowers {
    async fn followers_of(
        &self,
        _target: &EntityRef,
        cursor: Option<AccountId>,
        limit: usize,
    ) -> Result<Vec<AccountId>, AppError> {
        let floor = cursor.unwrap_or(0);
        Ok(self
            .followers
            .iter()
            .copied()
            .filter(|id| *id > floor)
            .take(limit)
            .collect())
    }

    async fn members_of(
        &self,
        group: &EntityRef,
        cursor: Option<AccountId>,
        limit: usize,
    ) -> Result<Vec<AccountId>, AppError> {
        self.followers_of(group, cursor, limit).await
    }
}

fn make_post(id: i64, published: bool, fields: serde_json::Value) -> Entity {
    Entity {
        entity_ref: EntityRef::new(EntityKind::Post, id),
        bundle: "topic".to_string(),
        owner: 1,
        langcode: None,
        published,
        visibility: Visibility::Community,
        fields,
    }
}

fn resolver(
    store: Arc<MemoryStore>,
    transport: Arc<MemoryTransport>,
    contexts: Vec<Arc<dyn ActivityContext>>,
) -> ActionResolver {
    let factory = Arc::new(MemoryFactory {
        store: store.clone(),
        next_id: Mutex::new(0),
    });
    ActionResolver::new(
        EligibilityRegistry::builtin(),
        contexts,
        factory,
        store,
        transport,
        vec!["email".to_string(), "notifications".to_string()],
    )
}

#[tokio::test]
async fn test_action_resolver_creates_and_queues_activity() {
    let store = Arc::new(MemoryStore::default());
    let transport = Arc::new(MemoryTransport::default());
    let source = Arc::new(FixedFollowers {
        followers: vec![10, 11, 12],
    });
    let resolver = resolver(
        store.clone(),
        transport.clone(),
        vec![Arc::new(ContentFollowersContext::new(source))],
    );

    let post = make_post(1, true, serde_json::json!({}));
    let activity = resolver
        .on_entity_event(&post, "post_created")
        .await
        .unwrap()
        .expect("activity should be recorded");

    assert_eq!(activity.related_entity, post.entity_ref);
    assert_eq!(
        activity.recipients,
        vec![
            EntityRef::account(10),
            EntityRef::account(11),
            EntityRef::account(12),
        ]
    );
    assert_eq!(activity.destinations, vec!["email", "notifications"]);

    // One initial payload with no explicit recipient list
    let queued = transport.queued.lock().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].activity_id, activity.id);
    assert!(queued[0].recipients.is_none());

    // The message exists and is referenced by the activity
    assert!(
        store
            .load_message(activity.message_id)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_action_resolver_structural_filter() {
    let store = Arc::new(MemoryStore::default());
    let transport = Arc::new(MemoryTransport::default());
    let resolver = resolver(store.clone(), transport.clone(), vec![]);

    let account_entity = Entity {
        entity_ref: EntityRef::account(5),
        bundle: "account".to_string(),
        owner: 5,
        langcode: None,
        published: true,
        visibility: Visibility::Public,
        fields: serde_json::json!({}),
    };
    let result = resolver
        .on_entity_event(&account_entity, "account_updated")
        .await
        .unwrap();

    assert!(result.is_none());
    assert!(transport.queued.lock().unwrap().is_empty());
    assert!(store.messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_action_resolver_respects_eligibility() {
    let store = Arc::new(MemoryStore::default());
    let transport = Arc::new(MemoryTransport::default());
    let resolver = resolver(store.clone(), transport.clone(), vec![]);

    let unpublished = make_post(2, false, serde_json::json!({}));
    let result = resolver
        .on_entity_event(&unpublished, "post_created")
        .await
        .unwrap();

    assert!(result.is_none());
    assert!(transport.queued.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_action_resolver_dedupes_across_contexts() {
    let store = Arc::new(MemoryStore::default());
    let transport = Arc::new(MemoryTransport::default());
    // The item owner (account 1) also follows the post
    let source = Arc::new(FixedFollowers {
        followers: vec![1, 2],
    });
    let item = make_post(3, true, serde_json::json!({}));
    let contexts: Vec<Arc<dyn ActivityContext>> = vec![
        Arc::new(ContentFollowersContext::new(source)),
        Arc::new(ItemOwnerContext),
    ];
    let resolver = resolver(store.clone(), transport.clone(), contexts);

    let post = make_post(3, true, serde_json::json!({"item": item}));
    let activity = resolver
        .on_entity_event(&post, "post_created")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        activity.recipients,
        vec![EntityRef::account(1), EntityRef::account(2)]
    );
}

#[tokio::test]
async fn test_action_resolver_pages_large_contexts_to_completion() {
    let store = Arc::new(MemoryStore::default());
    let transport = Arc::new(MemoryTransport::default());
    let source = Arc::new(FixedFollowers {
        followers: (1..=250).collect(),
    });
    let resolver = resolver(
        store.clone(),
        transport.clone(),
        vec![Arc::new(ContentFollowersContext::new(source))],
    );

    let post = make_post(4, true, serde_json::json!({}));
    let activity = resolver
        .on_entity_event(&post, "post_created")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(activity.recipients.len(), 250);
}
