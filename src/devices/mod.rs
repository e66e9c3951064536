//! Device binding: units, declarative handles, the binding manager, and the
//! device-bus provider boundary.
//!
//! Components declare [`DeviceHandle`]s; the provider announces
//! [`ProviderEvent`]s; the [`BindingManager`] sits between the two and keeps
//! every binding symmetric across hot-plug churn.

pub mod handle;
pub mod manager;
pub mod provider;
pub mod unit;

pub use handle::{
    BindEvent, BindFn, DeviceEvent, DeviceHandle, HandleArity, UnitEventFn, UnitSelector,
};
pub use manager::{BindingManager, BindingStats, UnitHookFn};
pub use provider::{NullProvider, ProviderControl, ProviderEvent};
pub use unit::Unit;
