//! Components: the reusable unit of capability.
//!
//! A component bundles what one capability needs: bus listeners, device
//! handles, and enable/disable hooks. While its component is disabled,
//! everything is parked here; enabling moves listeners into the bus table
//! and handles into the binding manager, and disabling moves them back. The
//! slot states below make a half-registered component unrepresentable.

use std::fmt;

use crate::bus::Listener;
use crate::devices::DeviceHandle;
use crate::types::{ComponentName, HandleId, ListenerId, Result};

use super::context::Context;

/// Hook invoked when a component is enabled or disabled.
pub type LifecycleFn = Box<dyn FnMut(&mut Context<'_>) -> Result<()> + Send>;

pub(crate) struct ListenerSlot {
    pub(crate) id: ListenerId,
    pub(crate) state: ListenerState,
}

pub(crate) enum ListenerState {
    /// Held by the component while disabled.
    Parked(Listener),
    /// Moved into the bus table while enabled.
    Registered,
}

pub(crate) struct HandleSlot {
    pub(crate) id: HandleId,
    pub(crate) state: HandleState,
}

pub(crate) enum HandleState {
    Parked(DeviceHandle),
    Registered,
}

/// A named bundle of listeners, device handles and lifecycle hooks.
pub struct Component {
    name: ComponentName,
    enabled: bool,
    /// Declaration order; doubles as registration order on enable.
    handles: Vec<HandleSlot>,
    listeners: Vec<ListenerSlot>,
    on_enabled: Option<LifecycleFn>,
    on_disabled: Option<LifecycleFn>,
}

impl Component {
    pub fn new(name: impl Into<ComponentName>) -> Self {
        Self {
            name: name.into(),
            enabled: false,
            handles: Vec::new(),
            listeners: Vec::new(),
            on_enabled: None,
            on_disabled: None,
        }
    }

    /// Declare a bus listener, registered while the component is enabled.
    pub fn with_listener(mut self, listener: Listener) -> Self {
        self.push_listener(listener);
        self
    }

    /// Declare a device handle, registered while the component is enabled.
    pub fn with_handle(mut self, handle: DeviceHandle) -> Self {
        self.push_handle(handle);
        self
    }

    /// Hook run when the component is enabled, before its handles and
    /// listeners register.
    pub fn on_enabled(
        mut self,
        hook: impl FnMut(&mut Context<'_>) -> Result<()> + Send + 'static,
    ) -> Self {
        self.on_enabled = Some(Box::new(hook));
        self
    }

    /// Hook run when the component is disabled, after its handles and
    /// listeners are gone.
    pub fn on_disabled(
        mut self,
        hook: impl FnMut(&mut Context<'_>) -> Result<()> + Send + 'static,
    ) -> Self {
        self.on_disabled = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &ComponentName {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of declared device handles.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Number of declared listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    // ------------------------------------------------------------------------
    // Core internals
    // ------------------------------------------------------------------------

    pub(crate) fn push_listener(&mut self, listener: Listener) {
        self.listeners.push(ListenerSlot {
            id: listener.id().clone(),
            state: ListenerState::Parked(listener),
        });
    }

    pub(crate) fn push_handle(&mut self, handle: DeviceHandle) {
        self.handles.push(HandleSlot {
            id: handle.id().clone(),
            state: HandleState::Parked(handle),
        });
    }

    /// Record a listener that is already in the bus table.
    pub(crate) fn push_registered_listener(&mut self, id: ListenerId) {
        self.listeners.push(ListenerSlot {
            id,
            state: ListenerState::Registered,
        });
    }

    /// Record a handle that is already in the binding manager.
    pub(crate) fn push_registered_handle(&mut self, id: HandleId) {
        self.handles.push(HandleSlot {
            id,
            state: HandleState::Registered,
        });
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn hook_enabled(&mut self) -> Option<&mut LifecycleFn> {
        self.on_enabled.as_mut()
    }

    pub(crate) fn hook_disabled(&mut self) -> Option<&mut LifecycleFn> {
        self.on_disabled.as_mut()
    }

    pub(crate) fn handles_mut(&mut self) -> &mut Vec<HandleSlot> {
        &mut self.handles
    }

    pub(crate) fn listeners_mut(&mut self) -> &mut Vec<ListenerSlot> {
        &mut self.listeners
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("handles", &self.handles.len())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}
