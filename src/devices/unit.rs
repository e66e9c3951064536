//! Device unit arena entries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::types::{TypeCode, UnitUid};

/// A device unit currently known to the binding manager.
///
/// Entries are arena-held: handles refer to units by uid, never by
/// reference, so a vanished unit cannot leave dangling state behind.
#[derive(Debug, Clone, Serialize)]
pub struct Unit {
    /// Provider-assigned device type.
    pub type_code: TypeCode,
    /// Stable identity on the device bus.
    pub uid: UnitUid,
    /// Provider-supplied description (model, firmware, capabilities).
    pub metadata: Value,
    /// When the unit was first enumerated.
    pub appeared_at: DateTime<Utc>,
}

impl Unit {
    pub(crate) fn new(type_code: TypeCode, uid: UnitUid, metadata: Value) -> Self {
        Self {
            type_code,
            uid,
            metadata,
            appeared_at: Utc::now(),
        }
    }
}
