//! Dispatch context handed to user callbacks.
//!
//! Callbacks never receive the runtime core itself. They get a [`Context`]
//! that queues what they want done: bus publishes, app switches, device
//! callback changes, fault reports. The core drains the queue to completion
//! before the public operation that triggered the callbacks returns, which
//! keeps every handler run-to-completion and preserves per-publisher order
//! without handing out reentrant access to the core's tables.

use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;

use crate::bus::{Message, Origin};
use crate::devices::handle::UnitEventFn;
use crate::devices::DeviceEvent;
use crate::types::{EventCode, Fault, HandleId, JobName, Result};

/// Work queued by a callback, applied by the core's drain loop.
#[derive(Debug)]
pub(crate) enum Intent {
    /// Route a message through the bus.
    Publish(Message),
    /// Make the named app the current one.
    Activate(JobName),
    /// Release the named app if it is the current one.
    Deactivate(JobName),
    /// Change a handle's per-event callback registry.
    Device(DeviceIntent),
    /// Record a fault; `echo` re-publishes it on the fault topic.
    Fault { fault: Fault, echo: bool },
}

/// A device-callback registry change.
///
/// Queued per-callback and applied by the binding manager as soon as the
/// callback returns, so a registration made inside a bind callback is
/// attached within the same enumeration event.
pub(crate) enum DeviceIntent {
    Register {
        handle: HandleId,
        event: EventCode,
        callback: UnitEventFn,
    },
    Unregister {
        handle: HandleId,
        event: EventCode,
    },
}

impl fmt::Debug for DeviceIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { handle, event, .. } => f
                .debug_struct("Register")
                .field("handle", handle)
                .field("event", event)
                .finish_non_exhaustive(),
            Self::Unregister { handle, event } => f
                .debug_struct("Unregister")
                .field("handle", handle)
                .field("event", event)
                .finish(),
        }
    }
}

/// What a callback is allowed to do while it runs.
pub struct Context<'a> {
    origin: Origin,
    intents: &'a mut VecDeque<Intent>,
    device_intents: Vec<DeviceIntent>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(origin: Origin, intents: &'a mut VecDeque<Intent>) -> Self {
        Self {
            origin,
            intents,
            device_intents: Vec::new(),
        }
    }

    /// Identity attached to everything this context publishes.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Publish a message. Delivered after the current callback returns,
    /// in the order publishes were requested.
    pub fn send(&mut self, topic: impl Into<String>, payload: Value) {
        let msg = Message::new(topic, payload, self.origin.clone());
        self.intents.push_back(Intent::Publish(msg));
    }

    /// Request that the named app become the current one.
    pub fn activate(&mut self, app: impl Into<JobName>) {
        self.intents.push_back(Intent::Activate(app.into()));
    }

    /// Request that the named app be released if it is the current one.
    pub fn deactivate(&mut self, app: impl Into<JobName>) {
        self.intents.push_back(Intent::Deactivate(app.into()));
    }

    /// Register a per-event device callback on a handle.
    ///
    /// If the handle is bound the callback is attached to every bound unit
    /// as soon as the current callback returns; otherwise it waits in the
    /// handle's registry until the next bind. Registering for an event that
    /// already has a callback replaces it.
    pub fn register_device_callback(
        &mut self,
        handle: &HandleId,
        event: EventCode,
        callback: impl FnMut(&mut Context<'_>, DeviceEvent<'_>) -> Result<()> + Send + 'static,
    ) {
        self.device_intents.push(DeviceIntent::Register {
            handle: handle.clone(),
            event,
            callback: Box::new(callback),
        });
    }

    /// Remove a per-event device callback, detaching it from bound units.
    pub fn unregister_device_callback(&mut self, handle: &HandleId, event: EventCode) {
        self.device_intents.push(DeviceIntent::Unregister {
            handle: handle.clone(),
            event,
        });
    }

    /// Record a fault and echo it on the fault topic.
    pub(crate) fn report_fault(&mut self, fault: Fault) {
        self.report_fault_with_echo(fault, true);
    }

    pub(crate) fn report_fault_with_echo(&mut self, fault: Fault, echo: bool) {
        self.intents.push_back(Intent::Fault { fault, echo });
    }

    /// Take the device-registry changes queued so far. Used by the binding
    /// manager, which applies them immediately after each callback.
    pub(crate) fn take_device_intents(&mut self) -> Vec<DeviceIntent> {
        std::mem::take(&mut self.device_intents)
    }

    /// Move leftover device-registry changes onto the main queue. Used by
    /// invokers without direct manager access (bus delivery, lifecycle
    /// hooks).
    pub(crate) fn flush(mut self) {
        for di in self.device_intents.drain(..) {
            self.intents.push_back(Intent::Device(di));
        }
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("origin", &self.origin)
            .field("queued", &self.intents.len())
            .field("device_queued", &self.device_intents.len())
            .finish()
    }
}
