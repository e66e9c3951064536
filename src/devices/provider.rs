//! Device-bus provider boundary.
//!
//! The transport that talks to physical units lives outside this crate. It
//! feeds enumeration and unit events into the runtime as [`ProviderEvent`]
//! values (over the actor's event channel, or directly through
//! [`Core::dispatch`](crate::kernel::Core::dispatch)) and receives event
//! stream changes through [`ProviderControl`]. Connection management and the
//! wire protocol are entirely the provider's concern; on transport loss it
//! is expected to emit [`ProviderEvent::AllVanished`] so the normal teardown
//! path runs, and to re-enumerate after reconnecting.

use serde_json::Value;

use crate::types::{EventCode, Result, TypeCode, UnitUid};

/// Inbound events from the device-bus provider.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A unit became reachable.
    UnitAppeared {
        type_code: TypeCode,
        uid: UnitUid,
        metadata: Value,
    },
    /// A unit disappeared.
    UnitVanished { uid: UnitUid },
    /// Bulk teardown, typically on transport loss.
    AllVanished,
    /// A per-unit event previously enabled through [`ProviderControl`].
    UnitEvent {
        uid: UnitUid,
        event: EventCode,
        payload: Value,
    },
}

/// Outbound control half of the provider interface.
///
/// The binding manager calls these lazily: a stream is enabled when the
/// first callback for a `(unit, event)` pair is attached and disabled when
/// the last one is detached, so the transport never carries events nobody
/// consumes.
pub trait ProviderControl: Send {
    /// Start streaming `event` for `uid`.
    fn enable_unit_event(&mut self, uid: &UnitUid, event: EventCode) -> Result<()>;

    /// Stop streaming `event` for `uid`.
    fn disable_unit_event(&mut self, uid: &UnitUid, event: EventCode) -> Result<()>;
}

/// Provider stub for embedders and tests that feed events manually.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProvider;

impl ProviderControl for NullProvider {
    fn enable_unit_event(&mut self, _uid: &UnitUid, _event: EventCode) -> Result<()> {
        Ok(())
    }

    fn disable_unit_event(&mut self, _uid: &UnitUid, _event: EventCode) -> Result<()> {
        Ok(())
    }
}
