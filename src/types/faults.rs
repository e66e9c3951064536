//! Supervisory fault reports.
//!
//! A bind callback that returns an error must not abort the enumeration
//! sweep that invoked it, and a failing listener must not starve the
//! listeners subscribed after it. Failures inside user callbacks are
//! therefore captured as [`Fault`] values: logged, counted, and re-published
//! on the reserved fault topic so supervisory components can react to them
//! like to any other message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{ComponentName, EventCode, JobName, TypeCode, UnitUid};

/// Where a fault originated.
///
/// Handles are identified by their label rather than their runtime id; the
/// label is what a human grepping logs can recognize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultKind {
    /// A listener callback returned an error during delivery.
    Listener { job: JobName, component: ComponentName },
    /// A component enable/disable hook returned an error.
    Hook { job: JobName, component: ComponentName },
    /// A bind callback returned an error.
    Bind { component: ComponentName, handle: String },
    /// An unbind callback returned an error.
    Unbind { component: ComponentName, handle: String },
    /// A unit initializer hook returned an error.
    Initializer { type_code: TypeCode },
    /// A unit finalizer hook returned an error.
    Finalizer { type_code: TypeCode },
    /// A per-event device callback returned an error.
    UnitEvent { handle: String, event: EventCode },
    /// A callback registration named a handle that is not registered.
    Registration { handle: String, event: EventCode },
    /// A unit matched a single-unit handle whose slot was already taken.
    BindingConflict { handle: String, uid: UnitUid },
    /// The device-bus provider rejected an event stream change.
    Provider { uid: UnitUid, event: EventCode },
    /// A queued lifecycle request could not be applied.
    Lifecycle { job: JobName },
    /// Queued work exceeded the configured cascade bound and was discarded.
    CascadeOverflow,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listener { job, component } => {
                write!(f, "listener callback in {}/{}", job, component)
            }
            Self::Hook { job, component } => {
                write!(f, "lifecycle hook in {}/{}", job, component)
            }
            Self::Bind { component, handle } => {
                write!(f, "bind callback of handle '{}' in {}", handle, component)
            }
            Self::Unbind { component, handle } => {
                write!(f, "unbind callback of handle '{}' in {}", handle, component)
            }
            Self::Initializer { type_code } => {
                write!(f, "initializer for type {}", type_code)
            }
            Self::Finalizer { type_code } => {
                write!(f, "finalizer for type {}", type_code)
            }
            Self::UnitEvent { handle, event } => {
                write!(f, "event {} callback of handle '{}'", event, handle)
            }
            Self::Registration { handle, event } => {
                write!(f, "event {} registration for unknown handle {}", event, handle)
            }
            Self::BindingConflict { handle, uid } => {
                write!(f, "binding conflict on handle '{}' for unit {}", handle, uid)
            }
            Self::Provider { uid, event } => {
                write!(f, "provider stream change for unit {} event {}", uid, event)
            }
            Self::Lifecycle { job } => {
                write!(f, "queued lifecycle change for job {}", job)
            }
            Self::CascadeOverflow => write!(f, "cascade bound exceeded"),
        }
    }
}

/// One supervisory fault record.
///
/// Serialized as the payload of fault-topic messages. The kind tag is
/// flattened so subscribers see `{"kind": "bind", "component": ..., ...}`
/// rather than a nested object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fault {
    #[serde(flatten)]
    pub kind: FaultKind,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl Fault {
    pub fn new(kind: FaultKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}
