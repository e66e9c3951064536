//! Core types for the Switchboard runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (JobName, HandleId, UnitUid, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Runtime configuration structure
//! - **Faults**: Supervisory reports for failures inside user callbacks

mod config;
mod errors;
mod faults;
mod ids;

pub use config::CoreConfig;
pub use errors::{BoxError, Error, Result};
pub use faults::{Fault, FaultKind};
pub use ids::{ComponentName, EventCode, HandleId, JobName, ListenerId, TypeCode, UnitUid};
