//! Device binding manager.
//!
//! Tracks the units the provider has enumerated, matches them against the
//! handles components registered, and keeps the per-`(unit, event)`
//! attachment table that routes unit events to handle callbacks. The same
//! table drives the provider's event streams: a stream is enabled when its
//! first callback attaches and disabled when its last callback detaches.
//!
//! All mutation happens on the runtime core's dispatch path; the manager is
//! a plain struct with no interior locking. Callbacks it invokes queue their
//! follow-up work on the dispatch context, and registry changes they request
//! are applied as soon as the callback returns, within the same enumeration
//! event.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{debug, warn};

use crate::bus::Origin;
use crate::kernel::context::{Context, DeviceIntent, Intent};
use crate::types::{
    ComponentName, EventCode, Fault, FaultKind, HandleId, JobName, Result, TypeCode, UnitUid,
};

use super::handle::{DeviceHandle, HandleArity, UnitEventFn};
use super::provider::ProviderControl;
use super::unit::Unit;

/// Hook invoked once per appearing or vanishing unit of one type.
pub type UnitHookFn = Box<dyn FnMut(&mut Context<'_>, &Unit) -> Result<()> + Send>;

struct UnitHook {
    type_code: TypeCode,
    hook: UnitHookFn,
}

/// A registered handle plus the component that owns it.
struct HandleEntry {
    job: JobName,
    component: ComponentName,
    handle: DeviceHandle,
}

// ============================================================================
// BindingManager
// ============================================================================

/// Matches enumerated units against registered handles.
pub struct BindingManager {
    /// Units in appearance order.
    units: Vec<Unit>,
    /// Handles in registration order; the order decides contested slots.
    entries: Vec<HandleEntry>,
    /// `(unit, event)` to attached handles, in attachment order.
    attachments: HashMap<(UnitUid, EventCode), Vec<HandleId>>,
    initializers: Vec<UnitHook>,
    finalizers: Vec<UnitHook>,
    provider: Box<dyn ProviderControl>,
    stats: BindingStats,
}

impl BindingManager {
    pub(crate) fn new(provider: Box<dyn ProviderControl>) -> Self {
        Self {
            units: Vec::new(),
            entries: Vec::new(),
            attachments: HashMap::new(),
            initializers: Vec::new(),
            finalizers: Vec::new(),
            provider,
            stats: BindingStats::default(),
        }
    }

    // ------------------------------------------------------------------------
    // Enumeration events
    // ------------------------------------------------------------------------

    /// A unit became reachable: run type initializers, then offer it to
    /// every handle in registration order.
    pub(crate) fn unit_appeared(
        &mut self,
        type_code: TypeCode,
        uid: UnitUid,
        metadata: Value,
        intents: &mut VecDeque<Intent>,
    ) {
        if let Some(existing) = self.units.iter_mut().find(|u| u.uid == uid) {
            warn!("Unit {} announced again without vanishing, refreshing metadata", uid);
            existing.metadata = metadata;
            return;
        }
        let unit = Unit::new(type_code, uid, metadata);
        debug!("Unit appeared: uid={} type={}", unit.uid, unit.type_code);
        self.units.push(unit.clone());
        self.stats.units_appeared += 1;

        self.run_hooks(HookPhase::Initialize, &unit, intents);

        for idx in 0..self.entries.len() {
            self.try_bind(idx, &unit, intents);
        }
    }

    /// A unit disappeared: release it from every handle holding it, run
    /// type finalizers, drop the arena entry.
    pub(crate) fn unit_vanished(&mut self, uid: &UnitUid, intents: &mut VecDeque<Intent>) {
        let Some(pos) = self.units.iter().position(|u| &u.uid == uid) else {
            warn!("Vanish for unknown unit {}, ignoring", uid);
            return;
        };
        let unit = self.units[pos].clone();
        debug!("Unit vanished: uid={} type={}", unit.uid, unit.type_code);

        for idx in 0..self.entries.len() {
            if self.entries[idx].handle.bound().contains(uid) {
                self.unbind_pair(idx, &unit, intents);
            }
        }
        self.run_hooks(HookPhase::Finalize, &unit, intents);
        self.units.remove(pos);
        // No attachment row may outlive its unit.
        self.attachments.retain(|(u, _), _| u != uid);
        self.stats.units_vanished += 1;
    }

    /// Bulk teardown on transport loss: units vanish newest first.
    pub(crate) fn all_vanished(&mut self, intents: &mut VecDeque<Intent>) {
        let uids: Vec<UnitUid> = self.units.iter().rev().map(|u| u.uid.clone()).collect();
        debug!("All units vanished ({} present)", uids.len());
        for uid in uids {
            self.unit_vanished(&uid, intents);
        }
    }

    /// Route a unit event to every handle attached to the `(unit, event)`
    /// pair, in attachment order. A failing callback is reported and the
    /// remaining callbacks still run.
    pub(crate) fn unit_event(
        &mut self,
        uid: &UnitUid,
        event: EventCode,
        payload: Value,
        intents: &mut VecDeque<Intent>,
    ) {
        let Some(unit) = self.units.iter().find(|u| &u.uid == uid).cloned() else {
            debug!("Event {} for unknown unit {}, ignoring", event, uid);
            return;
        };
        let key = (uid.clone(), event);
        let attached = self.attachments.get(&key).cloned().unwrap_or_default();
        for handle_id in attached {
            // An earlier callback may have detached this one.
            let still_attached = self
                .attachments
                .get(&key)
                .map_or(false, |slot| slot.contains(&handle_id));
            if !still_attached {
                continue;
            }
            let Some(idx) = self.entries.iter().position(|e| e.handle.id() == &handle_id) else {
                continue;
            };
            let (job, component, label) = self.owner_of(idx);
            self.stats.unit_events += 1;
            let queued = {
                let mut ctx = Context::new(Origin::Component { job, component }, intents);
                if let Some(Err(e)) =
                    self.entries[idx].handle.invoke_unit_event(&mut ctx, &unit, event, &payload)
                {
                    ctx.report_fault(Fault::new(
                        FaultKind::UnitEvent { handle: label, event },
                        e.to_string(),
                    ));
                }
                ctx.take_device_intents()
            };
            self.apply_device_intents(queued, intents);
        }
    }

    // ------------------------------------------------------------------------
    // Handle registration
    // ------------------------------------------------------------------------

    /// Register a handle and scan the arena for already-present matches,
    /// exactly as if those units had just appeared.
    pub(crate) fn add_handle(
        &mut self,
        job: JobName,
        component: ComponentName,
        handle: DeviceHandle,
        intents: &mut VecDeque<Intent>,
    ) {
        debug_assert!(
            !self.entries.iter().any(|e| e.handle.id() == handle.id()),
            "handle registered twice"
        );
        debug!(
            "Registered handle '{}' for {}/{} (type {})",
            handle.label(),
            job,
            component,
            handle.selector().type_code()
        );
        self.entries.push(HandleEntry { job, component, handle });
        let idx = self.entries.len() - 1;

        let snapshot = self.units.clone();
        for unit in &snapshot {
            self.try_bind(idx, unit, intents);
        }
    }

    /// Unregister a handle, releasing its bound units newest first, and
    /// return it to the caller.
    pub(crate) fn remove_handle(
        &mut self,
        handle_id: &HandleId,
        intents: &mut VecDeque<Intent>,
    ) -> Option<DeviceHandle> {
        let idx = self.entries.iter().position(|e| e.handle.id() == handle_id)?;

        let bound: Vec<UnitUid> = self.entries[idx].handle.bound().to_vec();
        for uid in bound.iter().rev() {
            if let Some(unit) = self.units.iter().find(|u| &u.uid == uid).cloned() {
                self.unbind_pair(idx, &unit, intents);
            } else {
                self.entries[idx].handle.forget_bound(uid);
            }
        }
        let entry = self.entries.remove(idx);
        debug!("Removed handle '{}'", entry.handle.label());
        Some(entry.handle)
    }

    // ------------------------------------------------------------------------
    // Callback registry
    // ------------------------------------------------------------------------

    /// Install a per-event callback on a handle. If the handle is bound the
    /// callback attaches to every bound unit immediately; otherwise it waits
    /// in the registry for the next bind. Replacing an existing callback
    /// leaves the attachment table untouched.
    pub(crate) fn register_callback(
        &mut self,
        handle_id: &HandleId,
        event: EventCode,
        callback: UnitEventFn,
        intents: &mut VecDeque<Intent>,
    ) {
        let Some(idx) = self.entries.iter().position(|e| e.handle.id() == handle_id) else {
            warn!("Callback registration for unknown handle {}", handle_id);
            intents.push_back(Intent::Fault {
                fault: Fault::new(
                    FaultKind::Registration {
                        handle: handle_id.to_string(),
                        event,
                    },
                    "handle is not registered",
                ),
                echo: true,
            });
            return;
        };
        if self.entries[idx].handle.insert_callback(event, callback) {
            debug!("Replaced callback for event {} on handle {}", event, handle_id);
            return;
        }
        for uid in self.entries[idx].handle.bound().to_vec() {
            self.attach(&uid, event, handle_id, intents);
        }
    }

    /// Remove a per-event callback, detaching it from every bound unit.
    pub(crate) fn unregister_callback(
        &mut self,
        handle_id: &HandleId,
        event: EventCode,
        intents: &mut VecDeque<Intent>,
    ) {
        let Some(idx) = self.entries.iter().position(|e| e.handle.id() == handle_id) else {
            return;
        };
        if !self.entries[idx].handle.remove_callback(event) {
            return;
        }
        for uid in self.entries[idx].handle.bound().to_vec() {
            self.detach(&uid, event, handle_id, intents);
        }
    }

    /// Apply registry changes a callback queued on its context.
    pub(crate) fn apply_device_intents(
        &mut self,
        queued: Vec<DeviceIntent>,
        intents: &mut VecDeque<Intent>,
    ) {
        for di in queued {
            self.apply_device_intent(di, intents);
        }
    }

    pub(crate) fn apply_device_intent(&mut self, di: DeviceIntent, intents: &mut VecDeque<Intent>) {
        match di {
            DeviceIntent::Register { handle, event, callback } => {
                self.register_callback(&handle, event, callback, intents);
            }
            DeviceIntent::Unregister { handle, event } => {
                self.unregister_callback(&handle, event, intents);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Type hooks
    // ------------------------------------------------------------------------

    /// Run before any handle sees a newly appeared unit of the type.
    pub(crate) fn add_initializer(&mut self, type_code: TypeCode, hook: UnitHookFn) {
        self.initializers.push(UnitHook { type_code, hook });
    }

    /// Run after every handle has released a vanished unit of the type.
    pub(crate) fn add_finalizer(&mut self, type_code: TypeCode, hook: UnitHookFn) {
        self.finalizers.push(UnitHook { type_code, hook });
    }

    /// Stop-time teardown: finalize remaining units newest first and clear
    /// the arena. Handles are expected to be gone by the time this runs.
    pub(crate) fn finalize_all(&mut self, intents: &mut VecDeque<Intent>) {
        let units: Vec<Unit> = self.units.iter().rev().cloned().collect();
        for unit in &units {
            self.run_hooks(HookPhase::Finalize, unit, intents);
        }
        self.units.clear();
        self.attachments.clear();
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Units currently known, in appearance order.
    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn unit(&self, uid: &UnitUid) -> Option<&Unit> {
        self.units.iter().find(|u| &u.uid == uid)
    }

    pub fn handle_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_registered(&self, handle_id: &HandleId) -> bool {
        self.entries.iter().any(|e| e.handle.id() == handle_id)
    }

    /// Uids bound to a handle, or `None` for an unregistered handle.
    pub fn bound_units(&self, handle_id: &HandleId) -> Option<Vec<UnitUid>> {
        self.entries
            .iter()
            .find(|e| e.handle.id() == handle_id)
            .map(|e| e.handle.bound().to_vec())
    }

    /// Number of `(unit, event)` pairs with at least one attachment.
    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    /// Get current binding statistics.
    pub fn stats(&self) -> &BindingStats {
        &self.stats
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn owner_of(&self, idx: usize) -> (JobName, ComponentName, String) {
        let entry = &self.entries[idx];
        (
            entry.job.clone(),
            entry.component.clone(),
            entry.handle.label().to_string(),
        )
    }

    /// Offer a unit to one handle: selector, then slot, then bind.
    fn try_bind(&mut self, idx: usize, unit: &Unit, intents: &mut VecDeque<Intent>) {
        let entry = &self.entries[idx];
        if !entry.handle.selector().matches(unit) {
            return;
        }
        if entry.handle.bound().contains(&unit.uid) {
            return;
        }
        if entry.handle.arity() == HandleArity::Single && entry.handle.is_bound() {
            let occupant = entry
                .handle
                .bound()
                .first()
                .map(|u| u.to_string())
                .unwrap_or_default();
            warn!(
                "Binding conflict: unit {} matches occupied handle '{}'",
                unit.uid,
                entry.handle.label()
            );
            let fault = Fault::new(
                FaultKind::BindingConflict {
                    handle: entry.handle.label().to_string(),
                    uid: unit.uid.clone(),
                },
                format!("slot occupied by {}", occupant),
            );
            self.stats.conflicts += 1;
            intents.push_back(Intent::Fault { fault, echo: true });
            return;
        }
        self.bind_pair(idx, unit, intents);
    }

    fn bind_pair(&mut self, idx: usize, unit: &Unit, intents: &mut VecDeque<Intent>) {
        let (job, component, label) = self.owner_of(idx);
        debug!("Binding unit {} to handle '{}' of {}/{}", unit.uid, label, job, component);

        // Recorded before the callback so teardown stays symmetric even
        // when the callback fails.
        self.entries[idx].handle.note_bound(unit.uid.clone());
        self.stats.binds += 1;

        let queued = {
            let mut ctx = Context::new(
                Origin::Component {
                    job,
                    component: component.clone(),
                },
                intents,
            );
            if let Err(e) = self.entries[idx].handle.invoke_bind(&mut ctx, unit) {
                ctx.report_fault(Fault::new(
                    FaultKind::Bind { component, handle: label },
                    e.to_string(),
                ));
            }
            ctx.take_device_intents()
        };
        self.apply_device_intents(queued, intents);

        // Attach the registry, including anything the bind callback just
        // registered. Rows the registration already created are skipped.
        let handle_id = self.entries[idx].handle.id().clone();
        for event in self.entries[idx].handle.registry_events() {
            self.attach(&unit.uid, event, &handle_id, intents);
        }
    }

    fn unbind_pair(&mut self, idx: usize, unit: &Unit, intents: &mut VecDeque<Intent>) {
        let (job, component, label) = self.owner_of(idx);
        debug!("Unbinding unit {} from handle '{}'", unit.uid, label);

        // Event routing stops before the unbind callback runs.
        let handle_id = self.entries[idx].handle.id().clone();
        for event in self.entries[idx].handle.registry_events() {
            self.detach(&unit.uid, event, &handle_id, intents);
        }

        let queued = {
            let mut ctx = Context::new(
                Origin::Component {
                    job,
                    component: component.clone(),
                },
                intents,
            );
            if let Err(e) = self.entries[idx].handle.invoke_unbind(&mut ctx, unit) {
                ctx.report_fault(Fault::new(
                    FaultKind::Unbind { component, handle: label },
                    e.to_string(),
                ));
            }
            ctx.take_device_intents()
        };
        // The binding must be gone before queued registrations apply: a
        // callback registered during unbind never attaches to this unit.
        self.entries[idx].handle.forget_bound(&unit.uid);
        self.apply_device_intents(queued, intents);

        self.stats.unbinds += 1;
    }

    fn attach(
        &mut self,
        uid: &UnitUid,
        event: EventCode,
        handle_id: &HandleId,
        intents: &mut VecDeque<Intent>,
    ) {
        let slot = self.attachments.entry((uid.clone(), event)).or_default();
        if slot.iter().any(|h| h == handle_id) {
            return;
        }
        let first = slot.is_empty();
        slot.push(handle_id.clone());
        if first {
            debug!("Enabling event stream {} for unit {}", event, uid);
            if let Err(e) = self.provider.enable_unit_event(uid, event) {
                warn!("Provider rejected enabling event {} for unit {}: {}", event, uid, e);
                intents.push_back(Intent::Fault {
                    fault: Fault::new(
                        FaultKind::Provider { uid: uid.clone(), event },
                        e.to_string(),
                    ),
                    echo: true,
                });
            }
        }
    }

    fn detach(
        &mut self,
        uid: &UnitUid,
        event: EventCode,
        handle_id: &HandleId,
        intents: &mut VecDeque<Intent>,
    ) {
        let key = (uid.clone(), event);
        let Some(slot) = self.attachments.get_mut(&key) else {
            return;
        };
        let before = slot.len();
        slot.retain(|h| h != handle_id);
        if slot.len() == before {
            return;
        }
        if slot.is_empty() {
            self.attachments.remove(&key);
            debug!("Disabling event stream {} for unit {}", event, uid);
            if let Err(e) = self.provider.disable_unit_event(uid, event) {
                warn!("Provider rejected disabling event {} for unit {}: {}", event, uid, e);
                intents.push_back(Intent::Fault {
                    fault: Fault::new(
                        FaultKind::Provider { uid: uid.clone(), event },
                        e.to_string(),
                    ),
                    echo: true,
                });
            }
        }
    }

    fn run_hooks(&mut self, phase: HookPhase, unit: &Unit, intents: &mut VecDeque<Intent>) {
        let hooks = match phase {
            HookPhase::Initialize => &mut self.initializers,
            HookPhase::Finalize => &mut self.finalizers,
        };
        for hook in hooks.iter_mut().filter(|h| h.type_code == unit.type_code) {
            let mut ctx = Context::new(Origin::Runtime, intents);
            if let Err(e) = (hook.hook)(&mut ctx, unit) {
                let kind = match phase {
                    HookPhase::Initialize => FaultKind::Initializer { type_code: unit.type_code },
                    HookPhase::Finalize => FaultKind::Finalizer { type_code: unit.type_code },
                };
                ctx.report_fault(Fault::new(kind, e.to_string()));
            }
            ctx.flush();
        }
    }
}

#[derive(Clone, Copy)]
enum HookPhase {
    Initialize,
    Finalize,
}

impl fmt::Debug for BindingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingManager")
            .field("units", &self.units.len())
            .field("handles", &self.entries.len())
            .field("attachments", &self.attachments.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Binding manager statistics.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BindingStats {
    pub units_appeared: u64,
    pub units_vanished: u64,
    pub binds: u64,
    pub unbinds: u64,
    /// Units that matched an occupied single-unit handle.
    pub conflicts: u64,
    /// Unit event callback invocations.
    pub unit_events: u64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Error;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    const KNOB: TypeCode = TypeCode(4);
    const PRESS: EventCode = EventCode(9);

    /// Provider that records stream changes into a shared log.
    struct RecordingProvider {
        log: Log,
    }

    impl ProviderControl for RecordingProvider {
        fn enable_unit_event(&mut self, uid: &UnitUid, event: EventCode) -> Result<()> {
            self.log.lock().unwrap().push(format!("enable:{}:{}", uid, event));
            Ok(())
        }

        fn disable_unit_event(&mut self, uid: &UnitUid, event: EventCode) -> Result<()> {
            self.log.lock().unwrap().push(format!("disable:{}:{}", uid, event));
            Ok(())
        }
    }

    fn mgr_with_log() -> (BindingManager, Log) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = BindingManager::new(Box::new(RecordingProvider { log: Arc::clone(&log) }));
        (mgr, log)
    }

    fn appear(mgr: &mut BindingManager, intents: &mut VecDeque<Intent>, uid: &str) {
        mgr.unit_appeared(KNOB, UnitUid::from(uid), json!({}), intents);
    }

    fn logging_handle(label: &str, log: &Log) -> DeviceHandle {
        let bind_log = Arc::clone(log);
        let unbind_log = Arc::clone(log);
        let l = label.to_string();
        let l2 = label.to_string();
        DeviceHandle::multi(label, KNOB)
            .on_bind(move |_ctx, ev| {
                bind_log.lock().unwrap().push(format!("bind:{}:{}", l, ev.unit.uid));
                Ok(())
            })
            .on_unbind(move |_ctx, ev| {
                unbind_log.lock().unwrap().push(format!("unbind:{}:{}", l2, ev.unit.uid));
                Ok(())
            })
    }

    // ------------------------------------------------------------------------
    // Binding
    // ------------------------------------------------------------------------

    #[test]
    fn test_appeared_unit_binds_matching_handle() {
        let (mut mgr, log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let handle = logging_handle("knob", &log);
        let id = handle.id().clone();
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);

        appear(&mut mgr, &mut intents, "u1");

        assert_eq!(mgr.bound_units(&id), Some(vec![UnitUid::from("u1")]));
        assert_eq!(log.lock().unwrap().as_slice(), ["bind:knob:u1"]);
        assert_eq!(mgr.stats().binds, 1);
    }

    #[test]
    fn test_appearance_runs_initializer_then_bind_then_attach() {
        let (mut mgr, log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let init_log = Arc::clone(&log);
        mgr.add_initializer(
            KNOB,
            Box::new(move |_ctx, unit| {
                init_log.lock().unwrap().push(format!("init:{}", unit.uid));
                Ok(())
            }),
        );

        let bind_log = Arc::clone(&log);
        let handle = DeviceHandle::multi("knob", KNOB)
            .on_bind(move |_ctx, _ev| {
                bind_log.lock().unwrap().push("bind".to_string());
                Ok(())
            })
            .on_unit_event(PRESS, |_ctx, _ev| Ok(()));
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);

        appear(&mut mgr, &mut intents, "u1");

        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["init:u1", "bind", "enable:u1:9"]
        );
    }

    #[test]
    fn test_single_handle_reports_conflict_for_second_match() {
        let (mut mgr, _log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let handle = DeviceHandle::single("solo", KNOB);
        let id = handle.id().clone();
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);

        appear(&mut mgr, &mut intents, "u1");
        appear(&mut mgr, &mut intents, "u2");

        assert_eq!(mgr.bound_units(&id), Some(vec![UnitUid::from("u1")]));
        assert_eq!(mgr.stats().conflicts, 1);
        let conflict = intents.iter().find_map(|i| match i {
            Intent::Fault { fault, .. } => match &fault.kind {
                FaultKind::BindingConflict { handle, uid } => Some((handle.clone(), uid.clone())),
                _ => None,
            },
            _ => None,
        });
        assert_eq!(conflict, Some(("solo".to_string(), UnitUid::from("u2"))));
    }

    #[test]
    fn test_uid_allowlist_ignores_other_units() {
        let (mut mgr, _log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let handle = DeviceHandle::single("left", KNOB).with_uid("left-knob");
        let id = handle.id().clone();
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);

        appear(&mut mgr, &mut intents, "right-knob");
        assert_eq!(mgr.bound_units(&id), Some(vec![]));

        appear(&mut mgr, &mut intents, "left-knob");
        assert_eq!(mgr.bound_units(&id), Some(vec![UnitUid::from("left-knob")]));
    }

    #[test]
    fn test_multi_handle_binds_every_match() {
        let (mut mgr, _log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let handle = DeviceHandle::multi("all", KNOB);
        let id = handle.id().clone();
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);

        appear(&mut mgr, &mut intents, "u1");
        appear(&mut mgr, &mut intents, "u2");

        assert_eq!(
            mgr.bound_units(&id),
            Some(vec![UnitUid::from("u1"), UnitUid::from("u2")])
        );
        assert_eq!(mgr.stats().conflicts, 0);
    }

    #[test]
    fn test_late_handle_registration_scans_arena() {
        let (mut mgr, log) = mgr_with_log();
        let mut intents = VecDeque::new();

        appear(&mut mgr, &mut intents, "u1");
        let handle = logging_handle("late", &log);
        let id = handle.id().clone();
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);

        assert_eq!(mgr.bound_units(&id), Some(vec![UnitUid::from("u1")]));
    }

    #[test]
    fn test_reappearing_uid_refreshes_metadata_without_rebinding() {
        let (mut mgr, _log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let handle = DeviceHandle::multi("knob", KNOB);
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);

        mgr.unit_appeared(KNOB, UnitUid::from("u1"), json!({"fw": 1}), &mut intents);
        mgr.unit_appeared(KNOB, UnitUid::from("u1"), json!({"fw": 2}), &mut intents);

        assert_eq!(mgr.units().len(), 1);
        assert_eq!(mgr.units()[0].metadata["fw"], 2);
        assert_eq!(mgr.stats().binds, 1);
    }

    // ------------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------------

    #[test]
    fn test_vanish_detaches_then_unbinds_then_finalizes() {
        let (mut mgr, log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let final_log = Arc::clone(&log);
        mgr.add_finalizer(
            KNOB,
            Box::new(move |_ctx, unit| {
                final_log.lock().unwrap().push(format!("final:{}", unit.uid));
                Ok(())
            }),
        );

        let unbind_log = Arc::clone(&log);
        let handle = DeviceHandle::multi("knob", KNOB)
            .on_unbind(move |_ctx, _ev| {
                unbind_log.lock().unwrap().push("unbind".to_string());
                Ok(())
            })
            .on_unit_event(PRESS, |_ctx, _ev| Ok(()));
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);

        appear(&mut mgr, &mut intents, "u1");
        log.lock().unwrap().clear();

        mgr.unit_vanished(&UnitUid::from("u1"), &mut intents);

        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["disable:u1:9", "unbind", "final:u1"]
        );
        assert!(mgr.units().is_empty());
        assert_eq!(mgr.attachment_count(), 0);
    }

    #[test]
    fn test_vanish_for_unknown_unit_is_ignored() {
        let (mut mgr, _log) = mgr_with_log();
        let mut intents = VecDeque::new();

        mgr.unit_vanished(&UnitUid::from("ghost"), &mut intents);

        assert_eq!(mgr.stats().units_vanished, 0);
        assert!(intents.is_empty());
    }

    #[test]
    fn test_remove_handle_releases_bound_units() {
        let (mut mgr, log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let handle = logging_handle("knob", &log);
        let id = handle.id().clone();
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);
        appear(&mut mgr, &mut intents, "u1");

        let removed = mgr.remove_handle(&id, &mut intents);

        assert!(removed.is_some());
        assert!(!mgr.is_registered(&id));
        assert!(log.lock().unwrap().contains(&"unbind:knob:u1".to_string()));
        // The unit itself is still present for future handles.
        assert_eq!(mgr.units().len(), 1);
    }

    #[test]
    fn test_all_vanished_finalizes_newest_first() {
        let (mut mgr, log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let final_log = Arc::clone(&log);
        mgr.add_finalizer(
            KNOB,
            Box::new(move |_ctx, unit| {
                final_log.lock().unwrap().push(format!("final:{}", unit.uid));
                Ok(())
            }),
        );

        appear(&mut mgr, &mut intents, "u1");
        appear(&mut mgr, &mut intents, "u2");
        mgr.all_vanished(&mut intents);

        assert_eq!(log.lock().unwrap().as_slice(), ["final:u2", "final:u1"]);
        assert!(mgr.units().is_empty());
    }

    #[test]
    fn test_failing_bind_callback_still_records_binding() {
        let (mut mgr, log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let unbind_log = Arc::clone(&log);
        let handle = DeviceHandle::multi("flaky", KNOB)
            .on_bind(|_ctx, _ev| Err(Error::callback("bind exploded")))
            .on_unbind(move |_ctx, _ev| {
                unbind_log.lock().unwrap().push("unbind".to_string());
                Ok(())
            });
        let id = handle.id().clone();
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);

        appear(&mut mgr, &mut intents, "u1");

        assert_eq!(mgr.bound_units(&id), Some(vec![UnitUid::from("u1")]));
        assert!(intents
            .iter()
            .any(|i| matches!(i, Intent::Fault { fault, .. } if matches!(fault.kind, FaultKind::Bind { .. }))));

        // Teardown stays symmetric: the unbind callback still runs.
        mgr.unit_vanished(&UnitUid::from("u1"), &mut intents);
        assert_eq!(log.lock().unwrap().as_slice(), ["unbind"]);
    }

    // ------------------------------------------------------------------------
    // Callback registry and event routing
    // ------------------------------------------------------------------------

    #[test]
    fn test_register_callback_attaches_to_bound_units() {
        let (mut mgr, log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let handle = DeviceHandle::multi("knob", KNOB);
        let id = handle.id().clone();
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);
        appear(&mut mgr, &mut intents, "u1");

        mgr.register_callback(&id, PRESS, Box::new(|_ctx, _ev| Ok(())), &mut intents);

        assert_eq!(log.lock().unwrap().as_slice(), ["enable:u1:9"]);
        assert_eq!(mgr.attachment_count(), 1);
    }

    #[test]
    fn test_replacing_callback_keeps_attachments() {
        let (mut mgr, log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let handle = DeviceHandle::multi("knob", KNOB).on_unit_event(PRESS, |_ctx, _ev| Ok(()));
        let id = handle.id().clone();
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);
        appear(&mut mgr, &mut intents, "u1");

        mgr.register_callback(&id, PRESS, Box::new(|_ctx, _ev| Ok(())), &mut intents);

        // One enable from the bind, nothing from the replacement.
        assert_eq!(log.lock().unwrap().as_slice(), ["enable:u1:9"]);
    }

    #[test]
    fn test_unregister_callback_detaches_and_disables() {
        let (mut mgr, log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let handle = DeviceHandle::multi("knob", KNOB).on_unit_event(PRESS, |_ctx, _ev| Ok(()));
        let id = handle.id().clone();
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);
        appear(&mut mgr, &mut intents, "u1");
        log.lock().unwrap().clear();

        mgr.unregister_callback(&id, PRESS, &mut intents);

        assert_eq!(log.lock().unwrap().as_slice(), ["disable:u1:9"]);
        assert_eq!(mgr.attachment_count(), 0);
    }

    #[test]
    fn test_stream_enabled_once_for_two_attached_handles() {
        let (mut mgr, log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let a = DeviceHandle::multi("a", KNOB).on_unit_event(PRESS, |_ctx, _ev| Ok(()));
        let b = DeviceHandle::multi("b", KNOB).on_unit_event(PRESS, |_ctx, _ev| Ok(()));
        let b_id = b.id().clone();
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), a, &mut intents);
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), b, &mut intents);

        appear(&mut mgr, &mut intents, "u1");
        assert_eq!(log.lock().unwrap().as_slice(), ["enable:u1:9"]);

        // The stream survives until the last handle detaches.
        log.lock().unwrap().clear();
        mgr.unregister_callback(&b_id, PRESS, &mut intents);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unit_event_routes_payload_to_callback() {
        let (mut mgr, _log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let handle = DeviceHandle::multi("knob", KNOB).on_unit_event(PRESS, move |_ctx, ev| {
            s.lock().unwrap().push(ev.payload["delta"].as_i64().unwrap_or(0));
            Ok(())
        });
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);
        appear(&mut mgr, &mut intents, "u1");

        mgr.unit_event(&UnitUid::from("u1"), PRESS, json!({"delta": 3}), &mut intents);

        assert_eq!(seen.lock().unwrap().as_slice(), [3]);
        assert_eq!(mgr.stats().unit_events, 1);
    }

    #[test]
    fn test_unit_event_failure_is_isolated() {
        let (mut mgr, _log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        let bad = DeviceHandle::multi("bad", KNOB)
            .on_unit_event(PRESS, |_ctx, _ev| Err(Error::callback("handler broke")));
        let good = DeviceHandle::multi("good", KNOB).on_unit_event(PRESS, move |_ctx, _ev| {
            *h.lock().unwrap() += 1;
            Ok(())
        });
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), bad, &mut intents);
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), good, &mut intents);
        appear(&mut mgr, &mut intents, "u1");

        mgr.unit_event(&UnitUid::from("u1"), PRESS, json!({}), &mut intents);

        assert_eq!(*hits.lock().unwrap(), 1);
        assert!(intents
            .iter()
            .any(|i| matches!(i, Intent::Fault { fault, .. } if matches!(fault.kind, FaultKind::UnitEvent { .. }))));
    }

    #[test]
    fn test_unit_event_without_attachment_is_ignored() {
        let (mut mgr, _log) = mgr_with_log();
        let mut intents = VecDeque::new();

        appear(&mut mgr, &mut intents, "u1");
        mgr.unit_event(&UnitUid::from("u1"), PRESS, json!({}), &mut intents);

        assert_eq!(mgr.stats().unit_events, 0);
    }

    #[test]
    fn test_failing_initializer_does_not_prevent_binding() {
        let (mut mgr, _log) = mgr_with_log();
        let mut intents = VecDeque::new();

        mgr.add_initializer(KNOB, Box::new(|_ctx, _unit| Err(Error::callback("init broke"))));

        let handle = DeviceHandle::multi("knob", KNOB);
        let id = handle.id().clone();
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);

        appear(&mut mgr, &mut intents, "u1");

        // The sweep continues: the unit is enumerated and bound anyway.
        assert_eq!(mgr.bound_units(&id), Some(vec![UnitUid::from("u1")]));
        assert!(intents
            .iter()
            .any(|i| matches!(i, Intent::Fault { fault, .. } if matches!(fault.kind, FaultKind::Initializer { .. }))));
    }

    #[test]
    fn test_failing_finalizer_still_releases_the_unit() {
        let (mut mgr, log) = mgr_with_log();
        let mut intents = VecDeque::new();

        mgr.add_finalizer(KNOB, Box::new(|_ctx, _unit| Err(Error::callback("final broke"))));
        let final_log = Arc::clone(&log);
        mgr.add_finalizer(
            KNOB,
            Box::new(move |_ctx, unit| {
                final_log.lock().unwrap().push(format!("final:{}", unit.uid));
                Ok(())
            }),
        );

        appear(&mut mgr, &mut intents, "u1");
        mgr.unit_vanished(&UnitUid::from("u1"), &mut intents);

        // The later finalizer still ran and the arena entry is gone.
        assert_eq!(log.lock().unwrap().as_slice(), ["final:u1"]);
        assert!(mgr.units().is_empty());
        assert!(intents
            .iter()
            .any(|i| matches!(i, Intent::Fault { fault, .. } if matches!(fault.kind, FaultKind::Finalizer { .. }))));
    }

    #[test]
    fn test_callback_registration_for_unknown_handle_is_a_fault() {
        let (mut mgr, _log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let ghost = HandleId::new();
        mgr.register_callback(&ghost, PRESS, Box::new(|_ctx, _ev| Ok(())), &mut intents);

        assert_eq!(mgr.attachment_count(), 0);
        assert!(intents
            .iter()
            .any(|i| matches!(i, Intent::Fault { fault, .. } if matches!(fault.kind, FaultKind::Registration { .. }))));
    }

    #[test]
    fn test_callback_registered_during_unbind_cannot_attach_to_vanishing_unit() {
        let (mut mgr, log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let handle = DeviceHandle::multi("knob", KNOB).on_unbind(|ctx, ev| {
            ctx.register_device_callback(ev.handle, PRESS, |_ctx, _ev| Ok(()));
            Ok(())
        });
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);
        appear(&mut mgr, &mut intents, "u1");
        log.lock().unwrap().clear();

        mgr.unit_vanished(&UnitUid::from("u1"), &mut intents);

        // No stream was enabled for the vanished unit, nothing to disable.
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(mgr.attachment_count(), 0);
    }

    #[test]
    fn test_bind_callback_can_register_callbacks_for_same_unit() {
        let (mut mgr, log) = mgr_with_log();
        let mut intents = VecDeque::new();

        let handle = DeviceHandle::multi("knob", KNOB).on_bind(move |ctx, ev| {
            ctx.register_device_callback(ev.handle, PRESS, |_ctx, _ev| Ok(()));
            Ok(())
        });
        mgr.add_handle(JobName::from("svc"), ComponentName::from("c"), handle, &mut intents);

        appear(&mut mgr, &mut intents, "u1");

        // The registration landed within the same enumeration event.
        assert_eq!(log.lock().unwrap().as_slice(), ["enable:u1:9"]);
        assert_eq!(mgr.attachment_count(), 1);
    }
}
