//! Configuration structures.
//!
//! Configuration is deserialized from whatever source the embedder prefers;
//! every field has a default so a plain `CoreConfig::default()` runs.

use serde::{Deserialize, Serialize};

use super::ids::JobName;

/// Runtime core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// App activated right after start, and fallen back to when the current
    /// app deactivates without a successor. `None` means no app runs until
    /// something activates one.
    pub default_app: Option<JobName>,

    /// Upper bound on queued work processed per public operation. A dispatch
    /// that still has pending intents past this bound is cut short and
    /// reported, which turns a publish loop between components into a fault
    /// instead of a hang.
    pub max_cascade: usize,

    /// Bounded capacity of the actor command channel.
    pub command_capacity: usize,

    /// Bounded capacity suggested for the provider event channel.
    pub event_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_app: None,
            max_cascade: 10_000,
            command_capacity: 64,
            event_capacity: 256,
        }
    }
}
