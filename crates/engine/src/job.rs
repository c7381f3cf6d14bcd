//! The queue-consumed delivery job.
//!
//! One invocation takes a `DeliveryJobPayload` and either cleans up a
//! dangling activity, splits an over-sized recipient pool into bounded
//! re-enqueued chunks, or partitions the pool by frequency preference and
//! dispatches each group. Splitting instead of processing is the
//! backpressure strategy: no invocation ever works on more than
//! `CHUNK_LIMIT` recipients.
//!
//! Jobs are safely re-runnable: everything is re-derived from the payload
//! plus a fresh load of the activity. Re-running the same payload against
//! the same preference snapshot yields the same split and the same
//! partition. Delivery itself is at-least-once; there is no dedup ledger.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use murmur_common::error::AppError;
use murmur_common::types::{
    AccountId, Activity, ActivityId, CHUNK_LIMIT, DeliveryJobPayload, Frequency, Langcode,
    Message, RecipientChunk,
};
use murmur_plugins::frequency::FrequencyRegistry;

use crate::traits::{AccessControl, ActivityStore, BodyRenderer, JobTransport, PreferenceStore};

const LOG_TARGET: &str = "murmur::delivery";

/// Terminal result of one job invocation, consumed by the queue runtime.
/// No in-place retries; a failure requires an operator to re-submit the
/// original payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Recipients were partitioned and dispatched in this invocation.
    Completed { dispatched: usize },
    /// The pool was over-sized; this invocation only enqueued sub-jobs.
    Delegated { jobs_enqueued: usize },
    /// The activity or its related entity was gone; cleanup ran.
    CleanedUp,
    /// Something failed; the error text is all the runtime gets.
    Failed { error: String },
}

/// The delivery job with all collaborators passed in at construction.
pub struct DeliveryJob {
    store: Arc<dyn ActivityStore>,
    preferences: Arc<dyn PreferenceStore>,
    access: Arc<dyn AccessControl>,
    transport: Arc<dyn JobTransport>,
    renderer: Arc<dyn BodyRenderer>,
    frequencies: FrequencyRegistry,
    /// Platform languages in configuration order; first entry is the site
    /// default. More than one entry means recipient pools split per language.
    languages: Vec<Langcode>,
}

impl DeliveryJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ActivityStore>,
        preferences: Arc<dyn PreferenceStore>,
        access: Arc<dyn AccessControl>,
        transport: Arc<dyn JobTransport>,
        renderer: Arc<dyn BodyRenderer>,
        frequencies: FrequencyRegistry,
        languages: Vec<Langcode>,
    ) -> Self {
        Self {
            store,
            preferences,
            access,
            transport,
            renderer,
            frequencies,
            languages,
        }
    }

    /// Run one invocation to its terminal outcome. Errors are caught here,
    /// logged once, and reported as `Failed`.
    pub async fn execute(&self, payload: DeliveryJobPayload) -> JobOutcome {
        let activity_id = payload.activity_id;
        match self.process(payload).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(
                    target: LOG_TARGET,
                    activity_id,
                    error = %error,
                    "Delivery job failed"
                );
                JobOutcome::Failed {
                    error: error.to_string(),
                }
            }
        }
    }

    async fn process(&self, payload: DeliveryJobPayload) -> Result<JobOutcome, AppError> {
        payload.validate()?;

        let Some(activity) = self.store.load_activity(payload.activity_id).await? else {
            return self.clean_up(payload.activity_id).await;
        };
        if !self.store.entity_exists(&activity.related_entity).await? {
            return self.clean_up(activity.id).await;
        }

        // A chunked payload is a previously split unit of work: its list is
        // used verbatim and never split again.
        let (pool, batch_langcode, is_chunk) = match payload.chunk_accounts() {
            Some(accounts) => (accounts.to_vec(), payload.langcode.clone(), true),
            None => (Self::account_pool(&activity), None, false),
        };

        if !is_chunk && pool.len() > CHUNK_LIMIT {
            let jobs_enqueued = self.split_and_enqueue(&activity, &pool).await?;
            return Ok(JobOutcome::Delegated { jobs_enqueued });
        }

        let message = self
            .store
            .load_message(activity.message_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Message {} for activity {} not found",
                    activity.message_id, activity.id
                ))
            })?;

        let dispatched = self
            .partition_and_dispatch(&activity, &message, pool, batch_langcode)
            .await?;
        Ok(JobOutcome::Completed { dispatched })
    }

    /// A dangling reference is expected steady-state garbage, not an error.
    async fn clean_up(&self, activity_id: ActivityId) -> Result<JobOutcome, AppError> {
        self.store.delete_activity(activity_id).await?;
        tracing::info!(
            target: LOG_TARGET,
            activity_id,
            "Related entity gone, activity and pending notifications deleted"
        );
        Ok(JobOutcome::CleanedUp)
    }

    /// The dispatchable account pool of an activity. Non-account refs are
    /// not deliverable and are dropped with a warning.
    fn account_pool(activity: &Activity) -> Vec<AccountId> {
        let mut pool = Vec::with_capacity(activity.recipients.len());
        for recipient in &activity.recipients {
            match recipient.as_account() {
                Some(id) => pool.push(id),
                None => tracing::warn!(
                    target: LOG_TARGET,
                    activity_id = activity.id,
                    recipient = %recipient,
                    "Ignoring non-account recipient"
                ),
            }
        }
        pool
    }

    /// Chunk the pool to ≤ `CHUNK_LIMIT` and enqueue one sub-job per chunk,
    /// per language group on multilingual platforms. This invocation
    /// delegates all further work and performs no dispatch itself.
    async fn split_and_enqueue(
        &self,
        activity: &Activity,
        pool: &[AccountId],
    ) -> Result<usize, AppError> {
        let mut jobs_enqueued = 0;

        if self.languages.len() > 1 {
            let stored = self.store.preferred_langcodes(pool).await?;
            for (langcode, subset) in group_by_language(pool, &stored, &self.languages) {
                jobs_enqueued += self
                    .enqueue_chunks(activity.id, &subset, Some(langcode))
                    .await?;
            }
        } else {
            jobs_enqueued += self.enqueue_chunks(activity.id, pool, None).await?;
        }

        tracing::info!(
            target: LOG_TARGET,
            activity_id = activity.id,
            recipients = pool.len(),
            jobs_enqueued,
            "Recipient pool split into bounded sub-jobs"
        );
        Ok(jobs_enqueued)
    }

    async fn enqueue_chunks(
        &self,
        activity_id: ActivityId,
        accounts: &[AccountId],
        langcode: Option<Langcode>,
    ) -> Result<usize, AppError> {
        let chunks = RecipientChunk::split_all(accounts, langcode);
        let count = chunks.len();
        for chunk in chunks {
            self.transport
                .enqueue(&DeliveryJobPayload::for_chunk(activity_id, chunk))
                .await?;
        }
        Ok(count)
    }

    /// Partition the pool by iterating frequency classes in the fixed
    /// priority order. Each account is claimed by the first class matching
    /// its stored preference; the remainder goes out with the template's
    /// default frequency.
    async fn partition_and_dispatch(
        &self,
        activity: &Activity,
        message: &Message,
        pool: Vec<AccountId>,
        batch_langcode: Option<Langcode>,
    ) -> Result<usize, AppError> {
        let mut remaining = pool;
        let mut dispatched = 0;

        for frequency in Frequency::PRIORITY {
            if remaining.is_empty() {
                break;
            }
            let matched = self
                .preferences
                .matching(&remaining, &message.template, frequency)
                .await?;
            if matched.is_empty() {
                continue;
            }
            let claimed: HashSet<AccountId> = matched.iter().copied().collect();
            remaining.retain(|account| !claimed.contains(account));
            dispatched += self
                .send_to_frequency(activity, message, &matched, frequency, batch_langcode.as_ref())
                .await?;
        }

        if !remaining.is_empty() {
            let default = self.preferences.default_for(&message.template).await?;
            dispatched += self
                .send_to_frequency(
                    activity,
                    message,
                    &remaining,
                    default,
                    batch_langcode.as_ref(),
                )
                .await?;
        }

        Ok(dispatched)
    }

    /// Hand one frequency group to its dispatcher, account by account.
    ///
    /// Blocked accounts and accounts without view access are silent skips.
    /// There is no per-account isolation: an error from one `process_item`
    /// call aborts the rest of the group and fails the job, so accounts
    /// already processed in this chunk can be dispatched again if the
    /// payload is re-submitted.
    pub async fn send_to_frequency(
        &self,
        activity: &Activity,
        message: &Message,
        accounts: &[AccountId],
        frequency: Frequency,
        batch_langcode: Option<&Langcode>,
    ) -> Result<usize, AppError> {
        if accounts.is_empty() {
            return Err(AppError::Resolution(
                "expected recipients, none provided".to_string(),
            ));
        }

        // One render covers the whole group when it was split by language;
        // otherwise each account renders in its own preferred language.
        let batch_body = match batch_langcode {
            Some(langcode) => Some(self.renderer.render(message, Some(langcode))?),
            None => None,
        };

        let loaded = self.store.load_accounts(accounts).await?;
        let dispatcher = self.frequencies.dispatcher_for(frequency)?;
        let mut processed = 0;

        for account in &loaded {
            if account.blocked {
                tracing::debug!(
                    target: LOG_TARGET,
                    account_id = account.id,
                    "Skipping blocked account"
                );
                continue;
            }
            if !self
                .access
                .can_view(account, &activity.related_entity)
                .await?
            {
                tracing::debug!(
                    target: LOG_TARGET,
                    account_id = account.id,
                    entity = %activity.related_entity,
                    "Skipping account without view access"
                );
                continue;
            }

            let body = match &batch_body {
                Some(body) => body.clone(),
                None => self
                    .renderer
                    .render(message, account.preferred_langcode.as_ref())?,
            };

            dispatcher
                .process_item(activity, message, account, &body)
                .await?;
            processed += 1;
        }

        tracing::info!(
            target: LOG_TARGET,
            activity_id = activity.id,
            frequency = %frequency,
            recipients = accounts.len(),
            processed,
            "Frequency group dispatched"
        );
        Ok(processed)
    }
}

/// Group a pool by effective preferred language, preserving pool order
/// within each group and configuration order across groups.
///
/// The effective language is the stored preference when the platform serves
/// it, otherwise the site default (first configured language), so every
/// account lands in exactly one group.
fn group_by_language(
    pool: &[AccountId],
    stored: &HashMap<AccountId, Option<Langcode>>,
    languages: &[Langcode],
) -> Vec<(Langcode, Vec<AccountId>)> {
    let default = &languages[0];
    let mut groups: HashMap<&Langcode, Vec<AccountId>> = HashMap::new();

    for account in pool {
        let effective = stored
            .get(account)
            .and_then(|langcode| langcode.as_ref())
            .filter(|langcode| languages.contains(*langcode))
            .unwrap_or(default);
        groups.entry(effective).or_default().push(*account);
    }

    languages
        .iter()
        .filter_map(|langcode| {
            groups
                .remove(langcode)
                .map(|accounts| (langcode.clone(), accounts))
        })
        .collect()
}
