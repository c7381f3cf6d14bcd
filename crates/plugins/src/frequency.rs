//! Frequency dispatchers — per-cadence hand-off of a fully resolved
//! (activity, message, account, rendered body) tuple.
//!
//! Each dispatcher decides how the tuple reaches mail infrastructure:
//! `immediately` spools one outbox entry, `daily`/`weekly` append to the
//! digest queue a periodic sender drains, `none` drops silently. The sink
//! behind the dispatchers is the external transport boundary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use murmur_common::error::AppError;
use murmur_common::types::{Account, Activity, Frequency, Message, RenderedBody};

/// Hand-off boundary to mail infrastructure. Implementations persist the
/// tuple for immediate or periodic sending; they do not transport mail.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    /// Spool one message for immediate sending.
    async fn deliver_now(
        &self,
        activity: &Activity,
        message: &Message,
        account: &Account,
        body: &RenderedBody,
    ) -> Result<(), AppError>;

    /// Append one entry to the account's periodic digest.
    async fn queue_digest(
        &self,
        frequency: Frequency,
        activity: &Activity,
        message: &Message,
        account: &Account,
        body: &RenderedBody,
    ) -> Result<(), AppError>;
}

/// One delivery cadence's accumulation/send-now policy.
#[async_trait]
pub trait FrequencyDispatcher: Send + Sync {
    fn frequency(&self) -> Frequency;

    async fn process_item(
        &self,
        activity: &Activity,
        message: &Message,
        account: &Account,
        body: &RenderedBody,
    ) -> Result<(), AppError>;
}

/// Sends as soon as the tuple arrives.
pub struct ImmediateDispatcher {
    sink: Arc<dyn DispatchSink>,
}

impl ImmediateDispatcher {
    pub fn new(sink: Arc<dyn DispatchSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl FrequencyDispatcher for ImmediateDispatcher {
    fn frequency(&self) -> Frequency {
        Frequency::Immediately
    }

    async fn process_item(
        &self,
        activity: &Activity,
        message: &Message,
        account: &Account,
        body: &RenderedBody,
    ) -> Result<(), AppError> {
        self.sink.deliver_now(activity, message, account, body).await
    }
}

/// Accumulates into a periodic digest (daily or weekly).
pub struct DigestDispatcher {
    frequency: Frequency,
    sink: Arc<dyn DispatchSink>,
}

impl DigestDispatcher {
    pub fn new(frequency: Frequency, sink: Arc<dyn DispatchSink>) -> Self {
        debug_assert!(matches!(frequency, Frequency::Daily | Frequency::Weekly));
        Self { frequency, sink }
    }
}

#[async_trait]
impl FrequencyDispatcher for DigestDispatcher {
    fn frequency(&self) -> Frequency {
        self.frequency
    }

    async fn process_item(
        &self,
        activity: &Activity,
        message: &Message,
        account: &Account,
        body: &RenderedBody,
    ) -> Result<(), AppError> {
        self.sink
            .queue_digest(self.frequency, activity, message, account, body)
            .await
    }
}

/// The account opted out; the tuple goes nowhere.
pub struct NoneDispatcher;

#[async_trait]
impl FrequencyDispatcher for NoneDispatcher {
    fn frequency(&self) -> Frequency {
        Frequency::None
    }

    async fn process_item(
        &self,
        _activity: &Activity,
        _message: &Message,
        account: &Account,
        _body: &RenderedBody,
    ) -> Result<(), AppError> {
        tracing::debug!(account_id = account.id, "Account opted out, dropping item");
        Ok(())
    }
}

/// Frequency-keyed dispatcher registry, populated once at process start.
pub struct FrequencyRegistry {
    dispatchers: HashMap<Frequency, Arc<dyn FrequencyDispatcher>>,
}

impl FrequencyRegistry {
    pub fn new() -> Self {
        Self {
            dispatchers: HashMap::new(),
        }
    }

    /// Register a dispatcher under the frequency it reports. Last
    /// registration wins.
    pub fn register(&mut self, dispatcher: Arc<dyn FrequencyDispatcher>) {
        self.dispatchers.insert(dispatcher.frequency(), dispatcher);
    }

    /// Registry with the four stock cadences over one sink.
    pub fn builtin(sink: Arc<dyn DispatchSink>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ImmediateDispatcher::new(sink.clone())));
        registry.register(Arc::new(DigestDispatcher::new(Frequency::Daily, sink.clone())));
        registry.register(Arc::new(DigestDispatcher::new(Frequency::Weekly, sink)));
        registry.register(Arc::new(NoneDispatcher));
        registry
    }

    pub fn dispatcher_for(
        &self,
        frequency: Frequency,
    ) -> Result<Arc<dyn FrequencyDispatcher>, AppError> {
        self.dispatchers
            .get(&frequency)
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!("No dispatcher registered for frequency '{frequency}'"))
            })
    }
}

impl Default for FrequencyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
