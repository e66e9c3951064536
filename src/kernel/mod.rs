//! Runtime core - the lifecycle orchestrator.
//!
//! The `Core` owns all mutable state and is driven from a single logical
//! thread: the message bus, the device binding manager and the installed jobs
//! are plain structs mutated via `&mut self`, never separate actors. User
//! callbacks queue follow-up work (publishes, app switches, device-registry
//! changes) on a [`Context`]; the core drains that queue to completion before
//! the public operation that triggered the callbacks returns, so every
//! handler is run-to-completion and per-publisher order holds without locks.
//!
//! Lifecycle cascade:
//! - `start` activates every installed service, then the default app
//! - activating a job enables its components in registration order
//! - enabling a component registers its device handles with the binding
//!   manager and its listeners with the bus
//! - every step reverses in the opposite order on deactivate/stop
//!
//! At most one app is active at any moment; `current_app` is mutated only by
//! the core's own activation path, never by jobs.

use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

use crate::bus::{BusStats, Listener, Message, MessageBus, Origin, Subscriber, FAULT_TOPIC};
use crate::devices::{
    BindingManager, BindingStats, DeviceHandle, NullProvider, ProviderControl, ProviderEvent, Unit,
};
use crate::types::{
    ComponentName, CoreConfig, Error, Fault, FaultKind, HandleId, JobName, Result, TypeCode,
    UnitUid,
};

pub mod actor;
pub mod component;
pub mod context;
pub mod job;

pub use component::Component;
pub use context::Context;
pub use job::{Job, JobKind, Trigger};

use component::{HandleState, ListenerState};
use context::Intent;
use job::TriggerState;

/// The runtime core: bus, binding manager, installed jobs, lifecycle state.
#[derive(Debug)]
pub struct Core {
    config: CoreConfig,
    started: bool,
    bus: MessageBus,
    manager: BindingManager,
    /// Install order; start/stop sequencing follows it.
    jobs: Vec<Job>,
    /// Name of the single active app, if any. Non-`None` implies `started`.
    current_app: Option<JobName>,
    default_app: Option<JobName>,
    /// Work queued by callbacks, drained before each public operation returns.
    intents: VecDeque<Intent>,
    faults: u64,
}

impl Core {
    /// Core without a device-bus transport; enumeration events are fed
    /// through [`Core::dispatch`] directly.
    pub fn new(config: CoreConfig) -> Self {
        Self::with_provider(config, Box::new(NullProvider))
    }

    pub fn with_provider(config: CoreConfig, provider: Box<dyn ProviderControl>) -> Self {
        let default_app = config.default_app.clone();
        Self {
            started: false,
            bus: MessageBus::new(),
            manager: BindingManager::new(provider),
            jobs: Vec::new(),
            current_app: None,
            default_app,
            intents: VecDeque::new(),
            faults: 0,
            config,
        }
    }

    // ------------------------------------------------------------------------
    // Install / uninstall
    // ------------------------------------------------------------------------

    /// Install a job. Fails on a duplicate job name or duplicate component
    /// names within the job. Installing a service into a started core
    /// activates it immediately; activators of an app are live from here on.
    pub fn install(&mut self, job: Job) -> Result<()> {
        if self.jobs.iter().any(|j| j.name() == job.name()) {
            return Err(Error::validation(format!(
                "job '{}' is already installed",
                job.name()
            )));
        }
        for (i, comp) in job.components().iter().enumerate() {
            if job.components()[..i].iter().any(|c| c.name() == comp.name()) {
                return Err(Error::validation(format!(
                    "job '{}' declares component '{}' twice",
                    job.name(),
                    comp.name()
                )));
            }
        }

        info!("Installing job {} ({:?})", job.name(), job.kind());
        self.jobs.push(job);
        let idx = self.jobs.len() - 1;
        let name = self.jobs[idx].name().clone();

        for i in 0..self.jobs[idx].activators_mut().len() {
            let taken = {
                let slot = &mut self.jobs[idx].activators_mut()[i];
                match std::mem::replace(&mut slot.state, TriggerState::Registered) {
                    TriggerState::Parked(t) => Some(t),
                    TriggerState::Registered => None,
                }
            };
            if let Some(trigger) = taken {
                self.bus.subscribe(Subscriber::Activator {
                    job: name.clone(),
                    trigger,
                });
            }
        }

        if self.started && self.jobs[idx].kind() == JobKind::Service {
            self.activate_job(idx);
        }
        self.drain();
        Ok(())
    }

    /// Uninstall a job, forcing deactivation first, and return it by value.
    /// An uninstalled current app is not replaced by the default app.
    pub fn uninstall(&mut self, name: &JobName) -> Result<Job> {
        let idx = self.job_index(name)?;

        if self.jobs[idx].is_active() {
            if self.current_app.as_ref() == Some(name) {
                self.current_app = None;
            }
            self.deactivate_job(idx);
        }
        for i in (0..self.jobs[idx].activators_mut().len()).rev() {
            let id = self.jobs[idx].activators_mut()[i].id.clone();
            if let Some(Subscriber::Activator { trigger, .. }) = self.bus.unsubscribe(&id) {
                self.jobs[idx].activators_mut()[i].state = TriggerState::Parked(trigger);
            }
        }

        let job = self.jobs.remove(idx);
        info!("Uninstalled job {}", job.name());
        self.drain();
        Ok(job)
    }

    // ------------------------------------------------------------------------
    // Start / stop
    // ------------------------------------------------------------------------

    /// Start the runtime: activate every installed service in install order,
    /// then the default app if one is configured.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::lifecycle("runtime is already started"));
        }
        info!("Starting runtime ({} jobs installed)", self.jobs.len());
        self.started = true;

        for idx in 0..self.jobs.len() {
            if self.jobs[idx].kind() == JobKind::Service {
                self.activate_job(idx);
            }
        }
        let result = match self.default_app.clone() {
            Some(app) => self.apply_activate(&app),
            None => Ok(()),
        };
        self.drain();
        result
    }

    /// Stop the runtime: deactivate active jobs in reverse install order,
    /// finalize and clear the unit arena, then mark not started.
    pub fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Err(Error::lifecycle("runtime is not started"));
        }
        info!("Stopping runtime");
        for idx in (0..self.jobs.len()).rev() {
            if self.jobs[idx].is_active() {
                self.deactivate_job(idx);
            }
        }
        self.current_app = None;
        self.manager.finalize_all(&mut self.intents);
        self.drain();
        self.started = false;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // App switching
    // ------------------------------------------------------------------------

    /// Make the named app the current one, deactivating the previous current
    /// app first. Activating the current app again is a no-op.
    pub fn activate(&mut self, name: &JobName) -> Result<()> {
        let result = self.apply_activate(name);
        self.drain();
        result
    }

    /// Release the named app if it is the current one; the default app takes
    /// over unless the released app is itself the default.
    pub fn deactivate(&mut self, name: &JobName) -> Result<()> {
        let result = self.apply_deactivate(name);
        self.drain();
        result
    }

    /// App activated after start and fallen back to on deactivation.
    /// Overrides `CoreConfig::default_app`.
    pub fn set_default_app(&mut self, app: Option<JobName>) {
        self.default_app = app;
    }

    // ------------------------------------------------------------------------
    // Bus and provider entry points
    // ------------------------------------------------------------------------

    /// Publish a message from outside the runtime. Messages published while
    /// the runtime is not started are dropped and counted.
    pub fn publish(&mut self, topic: impl Into<String>, payload: Value) {
        let topic = topic.into();
        if !self.started {
            self.bus.note_dropped(&topic);
            return;
        }
        self.intents
            .push_back(Intent::Publish(Message::new(topic, payload, Origin::External)));
        self.drain();
    }

    /// Feed one provider event through the binding manager. Events arriving
    /// while the runtime is not started are dropped; providers re-enumerate
    /// after `start`.
    pub fn dispatch(&mut self, event: ProviderEvent) {
        if !self.started {
            debug!("Dropping provider event while runtime not started");
            return;
        }
        match event {
            ProviderEvent::UnitAppeared {
                type_code,
                uid,
                metadata,
            } => self.manager.unit_appeared(type_code, uid, metadata, &mut self.intents),
            ProviderEvent::UnitVanished { uid } => {
                self.manager.unit_vanished(&uid, &mut self.intents);
            }
            ProviderEvent::AllVanished => self.manager.all_vanished(&mut self.intents),
            ProviderEvent::UnitEvent { uid, event, payload } => {
                self.manager.unit_event(&uid, event, payload, &mut self.intents);
            }
        }
        self.drain();
    }

    // ------------------------------------------------------------------------
    // Runtime mutation
    // ------------------------------------------------------------------------

    /// Attach a listener to an installed component. Registers with the bus
    /// immediately when the component is enabled, otherwise parks it until
    /// the next enable.
    pub fn add_listener(
        &mut self,
        job: &JobName,
        component: &ComponentName,
        listener: Listener,
    ) -> Result<()> {
        let (job_idx, comp_idx) = self.locate(job, component)?;
        if self.jobs[job_idx].components()[comp_idx].is_enabled() {
            let id = listener.id().clone();
            self.bus.subscribe(Subscriber::Listener {
                job: job.clone(),
                component: component.clone(),
                listener,
            });
            self.jobs[job_idx].components_mut()[comp_idx].push_registered_listener(id);
        } else {
            self.jobs[job_idx].components_mut()[comp_idx].push_listener(listener);
        }
        Ok(())
    }

    /// Attach a device handle to an installed component. Registers with the
    /// binding manager immediately when the component is enabled, otherwise
    /// parks it until the next enable.
    pub fn add_device_handle(
        &mut self,
        job: &JobName,
        component: &ComponentName,
        handle: DeviceHandle,
    ) -> Result<()> {
        let (job_idx, comp_idx) = self.locate(job, component)?;
        if self.jobs[job_idx].components()[comp_idx].is_enabled() {
            let id = handle.id().clone();
            self.manager
                .add_handle(job.clone(), component.clone(), handle, &mut self.intents);
            self.jobs[job_idx].components_mut()[comp_idx].push_registered_handle(id);
            self.drain();
        } else {
            self.jobs[job_idx].components_mut()[comp_idx].push_handle(handle);
        }
        Ok(())
    }

    /// Hook run once per newly appeared unit of `type_code`, before any
    /// handle binds it.
    pub fn add_unit_initializer(
        &mut self,
        type_code: TypeCode,
        hook: impl FnMut(&mut Context<'_>, &Unit) -> Result<()> + Send + 'static,
    ) {
        self.manager.add_initializer(type_code, Box::new(hook));
    }

    /// Hook run once per vanishing unit of `type_code`, after every handle
    /// has released it, and for remaining units at stop.
    pub fn add_unit_finalizer(
        &mut self,
        type_code: TypeCode,
        hook: impl FnMut(&mut Context<'_>, &Unit) -> Result<()> + Send + 'static,
    ) {
        self.manager.add_finalizer(type_code, Box::new(hook));
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn current_app(&self) -> Option<&JobName> {
        self.current_app.as_ref()
    }

    /// Whether the named job is installed and active. Unknown names read as
    /// inactive.
    pub fn is_active(&self, name: &JobName) -> bool {
        self.jobs.iter().any(|j| j.name() == name && j.is_active())
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Units currently known to the binding manager, in appearance order.
    pub fn units(&self) -> &[Unit] {
        self.manager.units()
    }

    pub fn unit(&self, uid: &UnitUid) -> Option<&Unit> {
        self.manager.unit(uid)
    }

    /// Uids bound to a handle, or `None` for a handle that is not currently
    /// registered (component disabled or never installed).
    pub fn bound_units(&self, handle: &HandleId) -> Option<Vec<UnitUid>> {
        self.manager.bound_units(handle)
    }

    pub fn bus_stats(&self) -> &BusStats {
        self.bus.stats()
    }

    pub fn binding_stats(&self) -> &BindingStats {
        self.manager.stats()
    }

    /// Total faults routed through the supervisory sink so far.
    pub fn faults_reported(&self) -> u64 {
        self.faults
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Lifecycle internals
    // ------------------------------------------------------------------------

    fn job_index(&self, name: &JobName) -> Result<usize> {
        self.jobs
            .iter()
            .position(|j| j.name() == name)
            .ok_or_else(|| Error::not_found(format!("job '{}'", name)))
    }

    fn locate(&self, job: &JobName, component: &ComponentName) -> Result<(usize, usize)> {
        let job_idx = self.job_index(job)?;
        let comp_idx = self.jobs[job_idx]
            .components()
            .iter()
            .position(|c| c.name() == component)
            .ok_or_else(|| {
                Error::not_found(format!("component '{}' in job '{}'", component, job))
            })?;
        Ok((job_idx, comp_idx))
    }

    fn apply_activate(&mut self, name: &JobName) -> Result<()> {
        if !self.started {
            return Err(Error::lifecycle(format!(
                "cannot activate '{}': runtime is not started",
                name
            )));
        }
        let idx = self.job_index(name)?;
        if self.jobs[idx].kind() != JobKind::App {
            return Err(Error::validation(format!(
                "job '{}' is a service; services activate on start",
                name
            )));
        }
        if self.current_app.as_ref() == Some(name) {
            return Ok(());
        }

        // The previous app is fully torn down before its successor comes up.
        if let Some(previous) = self.current_app.take() {
            if let Ok(prev_idx) = self.job_index(&previous) {
                self.deactivate_job(prev_idx);
            }
        }
        self.activate_job(idx);
        self.current_app = Some(name.clone());
        Ok(())
    }

    fn apply_deactivate(&mut self, name: &JobName) -> Result<()> {
        if !self.started {
            return Err(Error::lifecycle(format!(
                "cannot deactivate '{}': runtime is not started",
                name
            )));
        }
        let idx = self.job_index(name)?;
        if self.jobs[idx].kind() != JobKind::App {
            return Err(Error::validation(format!(
                "job '{}' is a service; services deactivate on stop",
                name
            )));
        }
        if self.current_app.as_ref() != Some(name) {
            return Ok(());
        }

        self.current_app = None;
        self.deactivate_job(idx);
        if let Some(default) = self.default_app.clone() {
            if &default != name {
                self.intents.push_back(Intent::Activate(default));
            }
        }
        Ok(())
    }

    fn activate_job(&mut self, idx: usize) {
        let name = self.jobs[idx].name().clone();
        debug!("Activating job {}", name);
        self.jobs[idx].set_active(true);

        // Deactivators are live only while the job is active.
        for i in 0..self.jobs[idx].deactivators_mut().len() {
            let taken = {
                let slot = &mut self.jobs[idx].deactivators_mut()[i];
                match std::mem::replace(&mut slot.state, TriggerState::Registered) {
                    TriggerState::Parked(t) => Some(t),
                    TriggerState::Registered => None,
                }
            };
            if let Some(trigger) = taken {
                self.bus.subscribe(Subscriber::Deactivator {
                    job: name.clone(),
                    trigger,
                });
            }
        }

        for comp_idx in 0..self.jobs[idx].components().len() {
            self.enable_component(idx, comp_idx);
        }
    }

    fn deactivate_job(&mut self, idx: usize) {
        let name = self.jobs[idx].name().clone();
        debug!("Deactivating job {}", name);

        for comp_idx in (0..self.jobs[idx].components().len()).rev() {
            self.disable_component(idx, comp_idx);
        }
        for i in (0..self.jobs[idx].deactivators_mut().len()).rev() {
            let id = self.jobs[idx].deactivators_mut()[i].id.clone();
            if let Some(Subscriber::Deactivator { trigger, .. }) = self.bus.unsubscribe(&id) {
                self.jobs[idx].deactivators_mut()[i].state = TriggerState::Parked(trigger);
            }
        }
        self.jobs[idx].set_active(false);
    }

    /// Enable one component: hook, then handles, then listeners, in
    /// declaration order.
    fn enable_component(&mut self, job_idx: usize, comp_idx: usize) {
        let job_name = self.jobs[job_idx].name().clone();
        let comp_name = self.jobs[job_idx].components()[comp_idx].name().clone();
        debug!("Enabling component {}/{}", job_name, comp_name);

        self.run_component_hook(job_idx, comp_idx, true);

        for i in 0..self.jobs[job_idx].components_mut()[comp_idx].handles_mut().len() {
            let taken = {
                let slot = &mut self.jobs[job_idx].components_mut()[comp_idx].handles_mut()[i];
                match std::mem::replace(&mut slot.state, HandleState::Registered) {
                    HandleState::Parked(h) => Some(h),
                    HandleState::Registered => None,
                }
            };
            if let Some(handle) = taken {
                self.manager.add_handle(
                    job_name.clone(),
                    comp_name.clone(),
                    handle,
                    &mut self.intents,
                );
            }
        }

        for i in 0..self.jobs[job_idx].components_mut()[comp_idx].listeners_mut().len() {
            let taken = {
                let slot = &mut self.jobs[job_idx].components_mut()[comp_idx].listeners_mut()[i];
                match std::mem::replace(&mut slot.state, ListenerState::Registered) {
                    ListenerState::Parked(l) => Some(l),
                    ListenerState::Registered => None,
                }
            };
            if let Some(listener) = taken {
                self.bus.subscribe(Subscriber::Listener {
                    job: job_name.clone(),
                    component: comp_name.clone(),
                    listener,
                });
            }
        }

        self.jobs[job_idx].components_mut()[comp_idx].set_enabled(true);
    }

    /// Disable one component: listeners, then handles, in reverse declaration
    /// order, then the hook. Best-effort; a missing registration is skipped.
    fn disable_component(&mut self, job_idx: usize, comp_idx: usize) {
        let job_name = self.jobs[job_idx].name().clone();
        let comp_name = self.jobs[job_idx].components()[comp_idx].name().clone();
        debug!("Disabling component {}/{}", job_name, comp_name);

        for i in (0..self.jobs[job_idx].components_mut()[comp_idx].listeners_mut().len()).rev() {
            let id = self.jobs[job_idx].components_mut()[comp_idx].listeners_mut()[i]
                .id
                .clone();
            if let Some(Subscriber::Listener { listener, .. }) = self.bus.unsubscribe(&id) {
                self.jobs[job_idx].components_mut()[comp_idx].listeners_mut()[i].state =
                    ListenerState::Parked(listener);
            }
        }

        for i in (0..self.jobs[job_idx].components_mut()[comp_idx].handles_mut().len()).rev() {
            let id = self.jobs[job_idx].components_mut()[comp_idx].handles_mut()[i]
                .id
                .clone();
            if let Some(handle) = self.manager.remove_handle(&id, &mut self.intents) {
                self.jobs[job_idx].components_mut()[comp_idx].handles_mut()[i].state =
                    HandleState::Parked(handle);
            }
        }

        self.run_component_hook(job_idx, comp_idx, false);
        self.jobs[job_idx].components_mut()[comp_idx].set_enabled(false);
    }

    fn run_component_hook(&mut self, job_idx: usize, comp_idx: usize, enabling: bool) {
        let job_name = self.jobs[job_idx].name().clone();
        let comp = &mut self.jobs[job_idx].components_mut()[comp_idx];
        let comp_name = comp.name().clone();
        let hook = if enabling {
            comp.hook_enabled()
        } else {
            comp.hook_disabled()
        };
        if let Some(hook) = hook {
            let mut ctx = Context::new(
                Origin::Component {
                    job: job_name.clone(),
                    component: comp_name.clone(),
                },
                &mut self.intents,
            );
            if let Err(e) = hook(&mut ctx) {
                ctx.report_fault(Fault::new(
                    FaultKind::Hook {
                        job: job_name,
                        component: comp_name,
                    },
                    e.to_string(),
                ));
            }
            ctx.flush();
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Apply queued work until the queue is empty or the cascade bound is
    /// hit. New intents queued while draining are processed in the same pass.
    fn drain(&mut self) {
        let mut processed = 0usize;
        while let Some(intent) = self.intents.pop_front() {
            processed += 1;
            if processed > self.config.max_cascade {
                let discarded = self.intents.len() + 1;
                self.intents.clear();
                error!(
                    "Cascade bound of {} exceeded, discarding {} queued items",
                    self.config.max_cascade, discarded
                );
                self.record_fault(
                    Fault::new(
                        FaultKind::CascadeOverflow,
                        format!("discarded {} queued items", discarded),
                    ),
                    false,
                );
                break;
            }
            match intent {
                Intent::Publish(msg) => {
                    if self.started {
                        self.bus.deliver(&msg, &mut self.intents);
                    } else {
                        self.bus.note_dropped(&msg.topic);
                    }
                }
                Intent::Activate(name) => {
                    if let Err(e) = self.apply_activate(&name) {
                        self.record_fault(
                            Fault::new(FaultKind::Lifecycle { job: name }, e.to_string()),
                            true,
                        );
                    }
                }
                Intent::Deactivate(name) => {
                    if let Err(e) = self.apply_deactivate(&name) {
                        self.record_fault(
                            Fault::new(FaultKind::Lifecycle { job: name }, e.to_string()),
                            true,
                        );
                    }
                }
                Intent::Device(di) => self.manager.apply_device_intent(di, &mut self.intents),
                Intent::Fault { fault, echo } => self.record_fault(fault, echo),
            }
        }
    }

    /// Supervisory sink: log, count, and (optionally) echo the fault on the
    /// reserved fault topic.
    fn record_fault(&mut self, fault: Fault, echo: bool) {
        warn!("Fault: {}", fault);
        self.faults += 1;
        if echo && self.started {
            match serde_json::to_value(&fault) {
                Ok(payload) => self.intents.push_back(Intent::Publish(Message::new(
                    FAULT_TOPIC,
                    payload,
                    Origin::Runtime,
                ))),
                Err(e) => warn!("Fault report serialization failed: {}", e),
            }
        }
    }
}
