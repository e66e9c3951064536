//! Jobs: installable groups of components with a lifecycle kind.

use std::fmt;

use crate::bus::{Message, Predicate, TopicFilter};
use crate::types::{Error, JobName, ListenerId, Result};

use super::component::Component;

/// How a job participates in the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Activated at start, active until stop.
    Service,
    /// Foreground job; at most one app is active at any moment.
    App,
}

/// A callback-free subscription owned by an app.
///
/// A matching message switches the current app instead of invoking user
/// code. Activators are live for the whole installed interval, deactivators
/// only while the app is active.
pub struct Trigger {
    id: ListenerId,
    filter: TopicFilter,
    predicate: Option<Predicate>,
}

impl Trigger {
    pub fn new(filter: TopicFilter) -> Self {
        Self {
            id: ListenerId::new(),
            filter,
            predicate: None,
        }
    }

    /// Add a payload predicate; the trigger only fires when it returns true.
    pub fn when(mut self, predicate: impl Fn(&Message) -> bool + Send + 'static) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub(crate) fn id(&self) -> &ListenerId {
        &self.id
    }

    pub(crate) fn accepts(&self, msg: &Message) -> bool {
        self.filter.matches(&msg.topic) && self.predicate.as_ref().map_or(true, |p| p(msg))
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

pub(crate) struct TriggerSlot {
    pub(crate) id: ListenerId,
    pub(crate) state: TriggerState,
}

pub(crate) enum TriggerState {
    Parked(Trigger),
    Registered,
}

/// An installable group of components.
pub struct Job {
    name: JobName,
    kind: JobKind,
    active: bool,
    components: Vec<Component>,
    activators: Vec<TriggerSlot>,
    deactivators: Vec<TriggerSlot>,
}

impl Job {
    /// A job activated at start and active until stop.
    pub fn service(name: impl Into<JobName>) -> Self {
        Self::with_kind(name, JobKind::Service)
    }

    /// A foreground job activated explicitly or through an activator.
    pub fn app(name: impl Into<JobName>) -> Self {
        Self::with_kind(name, JobKind::App)
    }

    fn with_kind(name: impl Into<JobName>, kind: JobKind) -> Self {
        Self {
            name: name.into(),
            kind,
            active: false,
            components: Vec::new(),
            activators: Vec::new(),
            deactivators: Vec::new(),
        }
    }

    /// Add a component. Component names must be unique within the job;
    /// duplicates are rejected at install time.
    pub fn add_component(mut self, component: Component) -> Self {
        self.components.push(component);
        self
    }

    /// Add an activation trigger. Only apps can have activators.
    pub fn add_activator(mut self, trigger: Trigger) -> Result<Self> {
        if self.kind != JobKind::App {
            return Err(Error::validation(format!(
                "service '{}' cannot have activators",
                self.name
            )));
        }
        self.activators.push(TriggerSlot {
            id: trigger.id().clone(),
            state: TriggerState::Parked(trigger),
        });
        Ok(self)
    }

    /// Add a deactivation trigger. Only apps can have deactivators.
    pub fn add_deactivator(mut self, trigger: Trigger) -> Result<Self> {
        if self.kind != JobKind::App {
            return Err(Error::validation(format!(
                "service '{}' cannot have deactivators",
                self.name
            )));
        }
        self.deactivators.push(TriggerSlot {
            id: trigger.id().clone(),
            state: TriggerState::Parked(trigger),
        });
        Ok(self)
    }

    pub fn name(&self) -> &JobName {
        &self.name
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub(crate) fn components_mut(&mut self) -> &mut Vec<Component> {
        &mut self.components
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub(crate) fn activators_mut(&mut self) -> &mut Vec<TriggerSlot> {
        &mut self.activators
    }

    pub(crate) fn deactivators_mut(&mut self) -> &mut Vec<TriggerSlot> {
        &mut self.deactivators
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("active", &self.active)
            .field("components", &self.components)
            .field("activators", &self.activators.len())
            .field("deactivators", &self.deactivators.len())
            .finish()
    }
}
