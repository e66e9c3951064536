//! # Switchboard Core - Device-Driven Application Runtime
//!
//! Runtime for dialog-driven control programs that talk to hot-pluggable
//! device units (sensors, displays, actuators) over a device-bus provider:
//! - Lifecycle cascade: core start → service/app activation → component
//!   enablement, with symmetric teardown
//! - Device binding manager matching appearing/vanishing units to the
//!   declarative handles components registered
//! - In-process publish/subscribe message bus so components never reference
//!   each other directly
//! - Single-active-app exclusivity with default-app fallback and
//!   message-driven app switching
//! - Supervisory fault sink isolating failures inside user callbacks
//!
//! ## Architecture
//!
//! The core follows a single-writer model where the `Core` owns all mutable
//! state; real deployments wrap it in the actor of `kernel::actor`:
//! ```text
//!                      ┌─────────────────────────────────┐
//!    CoreHandle cmds → │           Core (actor)          │
//!                      │  ┌─────────┐  ┌──────────────┐  │
//!    ProviderEvents →  │  │ Message │  │    Binding   │  │
//!                      │  │   Bus   │  │    Manager   │  │
//!                      │  └─────────┘  └──────────────┘  │
//!                      │  ┌───────────────────────────┐  │
//!                      │  │ Jobs ▸ Components ▸       │  │
//!                      │  │   Listeners / Handles     │  │
//!                      │  └───────────────────────────┘  │
//!                      └─────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod bus;
pub mod devices;
pub mod kernel;
pub mod types;

// Internal utilities
pub mod observability;

pub use bus::{Listener, Message, MessageBus, Origin, TopicFilter, FAULT_TOPIC};
pub use devices::{
    BindEvent, DeviceEvent, DeviceHandle, HandleArity, NullProvider, ProviderControl,
    ProviderEvent, Unit,
};
pub use kernel::actor::{spawn, CoreHandle};
pub use kernel::{Component, Context, Core, Job, JobKind, Trigger};
pub use types::{
    ComponentName, CoreConfig, Error, EventCode, Fault, FaultKind, HandleId, JobName, ListenerId,
    Result, TypeCode, UnitUid,
};
