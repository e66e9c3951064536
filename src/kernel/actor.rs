//! Serialized entry point for deployments with real concurrency.
//!
//! The [`Core`] itself is single-threaded by design. `spawn` moves it into a
//! tokio task that consumes two channels through one loop - commands from any
//! number of [`CoreHandle`] clones, and enumeration/unit events from the
//! device-bus provider - so both reach the core strictly serialized, exactly
//! like a direct single-threaded caller. The task exits when every handle is
//! dropped and returns the core for inspection.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::BusStats;
use crate::devices::{BindingStats, ProviderEvent, Unit};
use crate::types::{Error, HandleId, JobName, Result, UnitUid};

use super::{Core, Job};

/// One request to the runtime actor.
#[derive(Debug)]
pub enum Command {
    Install(Job, oneshot::Sender<Result<()>>),
    Uninstall(JobName, oneshot::Sender<Result<Job>>),
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<Result<()>>),
    Activate(JobName, oneshot::Sender<Result<()>>),
    Deactivate(JobName, oneshot::Sender<Result<()>>),
    Publish {
        topic: String,
        payload: Value,
        done: oneshot::Sender<()>,
    },
    SetDefaultApp(Option<JobName>, oneshot::Sender<()>),
    IsStarted(oneshot::Sender<bool>),
    CurrentApp(oneshot::Sender<Option<JobName>>),
    Units(oneshot::Sender<Vec<Unit>>),
    BoundUnits(HandleId, oneshot::Sender<Option<Vec<UnitUid>>>),
    BusStats(oneshot::Sender<BusStats>),
    BindingStats(oneshot::Sender<BindingStats>),
    FaultsReported(oneshot::Sender<u64>),
}

/// Move the core into a tokio task and return a cloneable handle to it.
///
/// `events` is the provider's event channel; its capacity is the embedder's
/// choice (`CoreConfig::event_capacity` is the suggestion). The task runs
/// until every [`CoreHandle`] is dropped.
pub fn spawn(core: Core, events: mpsc::Receiver<ProviderEvent>) -> (CoreHandle, JoinHandle<Core>) {
    let (tx, rx) = mpsc::channel(core.config().command_capacity);
    let task = tokio::spawn(run(core, rx, events));
    (CoreHandle { tx }, task)
}

async fn run(
    mut core: Core,
    mut commands: mpsc::Receiver<Command>,
    mut events: mpsc::Receiver<ProviderEvent>,
) -> Core {
    let mut events_open = true;
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(cmd) => apply(&mut core, cmd),
                None => break,
            },
            event = events.recv(), if events_open => match event {
                Some(event) => core.dispatch(event),
                None => {
                    debug!("Provider event channel closed");
                    events_open = false;
                }
            },
        }
    }
    debug!("Runtime actor shutting down");
    core
}

/// Replies to dropped handles are discarded; the caller is gone either way.
fn apply(core: &mut Core, cmd: Command) {
    match cmd {
        Command::Install(job, reply) => {
            let _ = reply.send(core.install(job));
        }
        Command::Uninstall(name, reply) => {
            let _ = reply.send(core.uninstall(&name));
        }
        Command::Start(reply) => {
            let _ = reply.send(core.start());
        }
        Command::Stop(reply) => {
            let _ = reply.send(core.stop());
        }
        Command::Activate(name, reply) => {
            let _ = reply.send(core.activate(&name));
        }
        Command::Deactivate(name, reply) => {
            let _ = reply.send(core.deactivate(&name));
        }
        Command::Publish { topic, payload, done } => {
            core.publish(topic, payload);
            let _ = done.send(());
        }
        Command::SetDefaultApp(app, reply) => {
            core.set_default_app(app);
            let _ = reply.send(());
        }
        Command::IsStarted(reply) => {
            let _ = reply.send(core.is_started());
        }
        Command::CurrentApp(reply) => {
            let _ = reply.send(core.current_app().cloned());
        }
        Command::Units(reply) => {
            let _ = reply.send(core.units().to_vec());
        }
        Command::BoundUnits(handle, reply) => {
            let _ = reply.send(core.bound_units(&handle));
        }
        Command::BusStats(reply) => {
            let _ = reply.send(core.bus_stats().clone());
        }
        Command::BindingStats(reply) => {
            let _ = reply.send(core.binding_stats().clone());
        }
        Command::FaultsReported(reply) => {
            let _ = reply.send(core.faults_reported());
        }
    }
}

/// Client half of the runtime actor. Cheap to clone; every method is one
/// command round-trip.
#[derive(Debug, Clone)]
pub struct CoreHandle {
    tx: mpsc::Sender<Command>,
}

impl CoreHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| Error::lifecycle("runtime actor is gone"))?;
        rx.await
            .map_err(|_| Error::lifecycle("runtime actor dropped the reply"))
    }

    pub async fn install(&self, job: Job) -> Result<()> {
        self.request(move |reply| Command::Install(job, reply)).await?
    }

    pub async fn uninstall(&self, name: JobName) -> Result<Job> {
        self.request(move |reply| Command::Uninstall(name, reply)).await?
    }

    pub async fn start(&self) -> Result<()> {
        self.request(Command::Start).await?
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await?
    }

    pub async fn activate(&self, name: JobName) -> Result<()> {
        self.request(move |reply| Command::Activate(name, reply)).await?
    }

    pub async fn deactivate(&self, name: JobName) -> Result<()> {
        self.request(move |reply| Command::Deactivate(name, reply)).await?
    }

    /// Publish and wait until the dispatch cascade has completed.
    pub async fn publish(&self, topic: impl Into<String>, payload: Value) -> Result<()> {
        let topic = topic.into();
        self.request(move |done| Command::Publish { topic, payload, done })
            .await
    }

    pub async fn set_default_app(&self, app: Option<JobName>) -> Result<()> {
        self.request(move |reply| Command::SetDefaultApp(app, reply))
            .await
    }

    pub async fn is_started(&self) -> Result<bool> {
        self.request(Command::IsStarted).await
    }

    pub async fn current_app(&self) -> Result<Option<JobName>> {
        self.request(Command::CurrentApp).await
    }

    pub async fn units(&self) -> Result<Vec<Unit>> {
        self.request(Command::Units).await
    }

    pub async fn bound_units(&self, handle: HandleId) -> Result<Option<Vec<UnitUid>>> {
        self.request(move |reply| Command::BoundUnits(handle, reply))
            .await
    }

    pub async fn bus_stats(&self) -> Result<BusStats> {
        self.request(Command::BusStats).await
    }

    pub async fn binding_stats(&self) -> Result<BindingStats> {
        self.request(Command::BindingStats).await
    }

    pub async fn faults_reported(&self) -> Result<u64> {
        self.request(Command::FaultsReported).await
    }
}
