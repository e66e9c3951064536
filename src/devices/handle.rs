//! Declarative device requests.
//!
//! A component does not look units up; it declares what it wants as a
//! [`DeviceHandle`] ("one unit of type 4", "every unit of type 7 with one of
//! these uids") and the binding manager calls back as matching units come
//! and go. The handle carries its component's callbacks and the identity
//! keys of the units currently bound to it; it never owns a unit.

use serde_json::Value;
use std::fmt;

use crate::kernel::context::Context;
use crate::types::{EventCode, HandleId, Result, TypeCode, UnitUid};

use super::unit::Unit;

/// Callback invoked when a unit is bound to or unbound from a handle.
pub type BindFn = Box<dyn FnMut(&mut Context<'_>, BindEvent<'_>) -> Result<()> + Send>;

/// Callback invoked when an attached unit event arrives.
pub type UnitEventFn = Box<dyn FnMut(&mut Context<'_>, DeviceEvent<'_>) -> Result<()> + Send>;

/// Arguments to bind and unbind callbacks.
#[derive(Debug)]
pub struct BindEvent<'a> {
    /// The handle the unit was matched to.
    pub handle: &'a HandleId,
    /// The unit being bound or unbound.
    pub unit: &'a Unit,
}

/// Arguments to per-event device callbacks.
#[derive(Debug)]
pub struct DeviceEvent<'a> {
    pub handle: &'a HandleId,
    pub unit: &'a Unit,
    pub event: EventCode,
    pub payload: &'a Value,
}

/// How many units a handle may hold at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleArity {
    /// One unit; further matches are conflicts.
    Single,
    /// Every matching unit.
    Multi,
}

/// Type and uid filter of a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSelector {
    type_code: TypeCode,
    uids: Option<Vec<UnitUid>>,
}

impl UnitSelector {
    pub fn type_code(&self) -> TypeCode {
        self.type_code
    }

    /// Uid allowlist, or `None` when any uid of the type is acceptable.
    pub fn uids(&self) -> Option<&[UnitUid]> {
        self.uids.as_deref()
    }

    pub fn matches(&self, unit: &Unit) -> bool {
        unit.type_code == self.type_code
            && self.uids.as_ref().map_or(true, |uids| uids.contains(&unit.uid))
    }
}

/// A component's declarative request for units of one type.
pub struct DeviceHandle {
    id: HandleId,
    label: String,
    selector: UnitSelector,
    arity: HandleArity,
    bind: Option<BindFn>,
    unbind: Option<BindFn>,
    /// Per-event callbacks in attachment order.
    registry: Vec<(EventCode, UnitEventFn)>,
    /// Bound units in bind order.
    bound: Vec<UnitUid>,
}

impl DeviceHandle {
    /// Request exactly one unit of `type_code`.
    pub fn single(label: impl Into<String>, type_code: TypeCode) -> Self {
        Self::with_arity(label, type_code, HandleArity::Single)
    }

    /// Request every unit of `type_code`.
    pub fn multi(label: impl Into<String>, type_code: TypeCode) -> Self {
        Self::with_arity(label, type_code, HandleArity::Multi)
    }

    fn with_arity(label: impl Into<String>, type_code: TypeCode, arity: HandleArity) -> Self {
        Self {
            id: HandleId::new(),
            label: label.into(),
            selector: UnitSelector {
                type_code,
                uids: None,
            },
            arity,
            bind: None,
            unbind: None,
            registry: Vec::new(),
            bound: Vec::new(),
        }
    }

    /// Restrict the handle to a specific uid. May be called repeatedly to
    /// build an allowlist.
    pub fn with_uid(mut self, uid: impl Into<UnitUid>) -> Self {
        self.selector.uids.get_or_insert_with(Vec::new).push(uid.into());
        self
    }

    /// Callback invoked after a unit is bound to this handle.
    pub fn on_bind(
        mut self,
        callback: impl FnMut(&mut Context<'_>, BindEvent<'_>) -> Result<()> + Send + 'static,
    ) -> Self {
        self.bind = Some(Box::new(callback));
        self
    }

    /// Callback invoked before a unit is released from this handle.
    pub fn on_unbind(
        mut self,
        callback: impl FnMut(&mut Context<'_>, BindEvent<'_>) -> Result<()> + Send + 'static,
    ) -> Self {
        self.unbind = Some(Box::new(callback));
        self
    }

    /// Declare a per-event callback up front. It is attached to every unit
    /// the handle binds, for as long as the binding lasts. Declaring the
    /// same event twice keeps the later callback.
    pub fn on_unit_event(
        mut self,
        event: EventCode,
        callback: impl FnMut(&mut Context<'_>, DeviceEvent<'_>) -> Result<()> + Send + 'static,
    ) -> Self {
        self.insert_callback(event, Box::new(callback));
        self
    }

    pub fn id(&self) -> &HandleId {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn selector(&self) -> &UnitSelector {
        &self.selector
    }

    pub fn arity(&self) -> HandleArity {
        self.arity
    }

    /// Units currently bound, in bind order.
    pub fn bound(&self) -> &[UnitUid] {
        &self.bound
    }

    pub fn is_bound(&self) -> bool {
        !self.bound.is_empty()
    }

    // ------------------------------------------------------------------------
    // Binding manager internals
    // ------------------------------------------------------------------------

    /// Returns true when an existing callback for the event was replaced.
    pub(crate) fn insert_callback(&mut self, event: EventCode, callback: UnitEventFn) -> bool {
        if let Some(slot) = self.registry.iter_mut().find(|(e, _)| *e == event) {
            slot.1 = callback;
            return true;
        }
        self.registry.push((event, callback));
        false
    }

    pub(crate) fn remove_callback(&mut self, event: EventCode) -> bool {
        let before = self.registry.len();
        self.registry.retain(|(e, _)| *e != event);
        self.registry.len() != before
    }

    pub(crate) fn registry_events(&self) -> Vec<EventCode> {
        self.registry.iter().map(|(e, _)| *e).collect()
    }

    pub(crate) fn note_bound(&mut self, uid: UnitUid) {
        if !self.bound.contains(&uid) {
            self.bound.push(uid);
        }
    }

    pub(crate) fn forget_bound(&mut self, uid: &UnitUid) -> bool {
        let before = self.bound.len();
        self.bound.retain(|u| u != uid);
        self.bound.len() != before
    }

    pub(crate) fn invoke_bind(&mut self, ctx: &mut Context<'_>, unit: &Unit) -> Result<()> {
        match self.bind.as_mut() {
            Some(cb) => cb(
                ctx,
                BindEvent {
                    handle: &self.id,
                    unit,
                },
            ),
            None => Ok(()),
        }
    }

    pub(crate) fn invoke_unbind(&mut self, ctx: &mut Context<'_>, unit: &Unit) -> Result<()> {
        match self.unbind.as_mut() {
            Some(cb) => cb(
                ctx,
                BindEvent {
                    handle: &self.id,
                    unit,
                },
            ),
            None => Ok(()),
        }
    }

    /// Invoke the registered callback for `event`, if any.
    pub(crate) fn invoke_unit_event(
        &mut self,
        ctx: &mut Context<'_>,
        unit: &Unit,
        event: EventCode,
        payload: &Value,
    ) -> Option<Result<()>> {
        let slot = self.registry.iter_mut().find(|(e, _)| *e == event)?;
        Some((slot.1)(
            ctx,
            DeviceEvent {
                handle: &self.id,
                unit,
                event,
                payload,
            },
        ))
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("selector", &self.selector)
            .field("arity", &self.arity)
            .field("registry", &self.registry_events())
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}
