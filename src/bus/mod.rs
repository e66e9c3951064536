//! In-process publish/subscribe message bus.
//!
//! Components never hold references to each other. Everything they exchange
//! travels over this bus as `(topic, payload)` messages, so a component can
//! be swapped, disabled or moved to another job without touching its peers.
//!
//! Patterns supported:
//! - **Exact topic subscription**: listener fires for one topic string
//! - **Wildcard subscription**: listener fires for every topic
//! - **Predicate gating**: optional payload filter on top of the topic match
//! - **Lifecycle triggers**: subscriptions owned by a job that switch the
//!   current app instead of invoking a callback
//!
//! Delivery is synchronous and runs in global subscription order. A failing
//! listener is isolated: the error is turned into a [`Fault`] report and the
//! remaining listeners still run. The bus owns the subscribed listeners
//! (ownership moves in on subscribe and back out on unsubscribe), and it is
//! only driven by the runtime core, so the subscription table never changes
//! in the middle of a delivery pass; everything a callback wants to change
//! is queued on the dispatch context instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use tracing::debug;

use crate::kernel::context::{Context, Intent};
use crate::kernel::job::Trigger;
use crate::types::{ComponentName, Fault, FaultKind, JobName, ListenerId, Result};

/// Reserved topic for supervisory fault reports (see [`crate::types::Fault`]).
pub const FAULT_TOPIC: &str = "faults";

// ============================================================================
// Message Types
// ============================================================================

/// Who produced a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum Origin {
    /// Published from outside the runtime (embedding code, actor command).
    External,
    /// Published by the runtime itself (fault reports).
    Runtime,
    /// Published from a callback owned by a component.
    Component {
        job: JobName,
        component: ComponentName,
    },
}

/// A message travelling over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Routing key. Matched exactly against subscription filters.
    pub topic: String,
    /// Arbitrary JSON payload.
    pub payload: Value,
    /// Who published it.
    pub origin: Origin,
    /// Publication timestamp.
    pub sent_at: DateTime<Utc>,
}

impl Message {
    pub(crate) fn new(topic: impl Into<String>, payload: Value, origin: Origin) -> Self {
        Self {
            topic: topic.into(),
            payload,
            origin,
            sent_at: Utc::now(),
        }
    }
}

/// Topic filter for subscriptions: one exact topic or every topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    /// Fires only for messages whose topic equals the string.
    Exact(String),
    /// Fires for every message.
    All,
}

impl TopicFilter {
    pub fn exact(topic: impl Into<String>) -> Self {
        Self::Exact(topic.into())
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(t) => t == topic,
        }
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Callback invoked when a message matches a listener subscription.
pub type ListenerFn = Box<dyn FnMut(&mut Context<'_>, &Message) -> Result<()> + Send>;

/// Optional payload filter evaluated after the topic match.
pub type Predicate = Box<dyn Fn(&Message) -> bool + Send>;

/// A component's subscription: filter, optional predicate, callback.
///
/// Built by the component author, parked inside the component while it is
/// disabled, and moved into the bus table for exactly the interval the
/// component is enabled.
pub struct Listener {
    id: ListenerId,
    filter: TopicFilter,
    predicate: Option<Predicate>,
    callback: ListenerFn,
}

impl Listener {
    pub fn new(
        filter: TopicFilter,
        callback: impl FnMut(&mut Context<'_>, &Message) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            id: ListenerId::new(),
            filter,
            predicate: None,
            callback: Box::new(callback),
        }
    }

    /// Add a payload predicate; the callback only runs when it returns true.
    pub fn when(mut self, predicate: impl Fn(&Message) -> bool + Send + 'static) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn id(&self) -> &ListenerId {
        &self.id
    }

    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    pub(crate) fn accepts(&self, msg: &Message) -> bool {
        self.filter.matches(&msg.topic) && self.predicate.as_ref().map_or(true, |p| p(msg))
    }

    pub(crate) fn invoke(&mut self, ctx: &mut Context<'_>, msg: &Message) -> Result<()> {
        (self.callback)(ctx, msg)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("predicate", &self.predicate.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Subscriber Table
// ============================================================================

/// One row of the subscription table.
///
/// Listener rows invoke a callback; trigger rows queue an app switch for the
/// owning job. They share one table so delivery order is the global
/// subscription order, not per-kind.
pub(crate) enum Subscriber {
    Listener {
        job: JobName,
        component: ComponentName,
        listener: Listener,
    },
    Activator {
        job: JobName,
        trigger: Trigger,
    },
    Deactivator {
        job: JobName,
        trigger: Trigger,
    },
}

impl Subscriber {
    pub(crate) fn id(&self) -> &ListenerId {
        match self {
            Self::Listener { listener, .. } => listener.id(),
            Self::Activator { trigger, .. } | Self::Deactivator { trigger, .. } => trigger.id(),
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listener { job, component, listener } => f
                .debug_struct("Listener")
                .field("job", job)
                .field("component", component)
                .field("listener", listener)
                .finish(),
            Self::Activator { job, trigger } => f
                .debug_struct("Activator")
                .field("job", job)
                .field("trigger", trigger)
                .finish(),
            Self::Deactivator { job, trigger } => f
                .debug_struct("Deactivator")
                .field("job", job)
                .field("trigger", trigger)
                .finish(),
        }
    }
}

// ============================================================================
// MessageBus
// ============================================================================

/// The routing table. Owned and driven by the runtime core.
#[derive(Debug, Default)]
pub struct MessageBus {
    /// Global subscription order doubles as delivery order.
    subscribers: Vec<Subscriber>,
    stats: BusStats,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription row. Re-adding an id already present is a no-op.
    pub(crate) fn subscribe(&mut self, sub: Subscriber) {
        if self.subscribers.iter().any(|s| s.id() == sub.id()) {
            debug!("Subscription {} already present, ignoring", sub.id());
            return;
        }
        self.subscribers.push(sub);
        self.stats.subscriptions = self.subscribers.len();
    }

    /// Remove and return a subscription row. Unknown ids are a no-op.
    pub(crate) fn unsubscribe(&mut self, id: &ListenerId) -> Option<Subscriber> {
        let pos = self.subscribers.iter().position(|s| s.id() == id)?;
        let sub = self.subscribers.remove(pos);
        self.stats.subscriptions = self.subscribers.len();
        Some(sub)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &ListenerId) -> bool {
        self.subscribers.iter().any(|s| s.id() == id)
    }

    /// Route one message through the table, invoking matching listeners and
    /// firing matching triggers. Returns the number of rows that matched.
    ///
    /// Listener failures become [`Fault`] intents; a failure while delivering
    /// a fault-topic message is queued without re-publishing so the fault
    /// topic cannot feed itself.
    pub(crate) fn deliver(&mut self, msg: &Message, intents: &mut VecDeque<Intent>) -> usize {
        let mut matched = 0;
        for sub in self.subscribers.iter_mut() {
            match sub {
                Subscriber::Listener { job, component, listener } => {
                    if !listener.accepts(msg) {
                        continue;
                    }
                    matched += 1;
                    let mut ctx = Context::new(
                        Origin::Component {
                            job: job.clone(),
                            component: component.clone(),
                        },
                        intents,
                    );
                    if let Err(e) = listener.invoke(&mut ctx, msg) {
                        let fault = Fault::new(
                            FaultKind::Listener {
                                job: job.clone(),
                                component: component.clone(),
                            },
                            e.to_string(),
                        );
                        ctx.report_fault_with_echo(fault, msg.topic != FAULT_TOPIC);
                    }
                    // Device-callback changes requested by a listener travel
                    // through the main queue, after anything it published.
                    ctx.flush();
                }
                Subscriber::Activator { job, trigger } => {
                    if !trigger.accepts(msg) {
                        continue;
                    }
                    matched += 1;
                    debug!("Activator fired for job={} on topic={}", job, msg.topic);
                    intents.push_back(Intent::Activate(job.clone()));
                }
                Subscriber::Deactivator { job, trigger } => {
                    if !trigger.accepts(msg) {
                        continue;
                    }
                    matched += 1;
                    debug!("Deactivator fired for job={} on topic={}", job, msg.topic);
                    intents.push_back(Intent::Deactivate(job.clone()));
                }
            }
        }
        self.stats.published += 1;
        self.stats.delivered += matched as u64;
        debug!("Delivered topic={} to {} subscribers", msg.topic, matched);
        matched
    }

    /// Record a message discarded because the runtime is not started.
    pub(crate) fn note_dropped(&mut self, topic: &str) {
        self.stats.dropped += 1;
        debug!("Dropped message for topic={} (runtime not started)", topic);
    }

    /// Get current bus statistics.
    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Bus statistics.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusStats {
    /// Messages routed through the table.
    pub published: u64,
    /// Listener invocations plus trigger firings.
    pub delivered: u64,
    /// Messages discarded while the runtime was not started.
    pub dropped: u64,
    /// Current number of subscription rows.
    pub subscriptions: usize,
}

// ============================================================================
// Tests
// ============================================================================
