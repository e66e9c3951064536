//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.
//!
//! Only misuse of the runtime API surfaces as an `Error`: lifecycle ordering
//! violations, unknown names, malformed arguments. Failures that happen
//! *inside* user callbacks while the runtime is reacting to an event are not
//! errors of the caller and never travel this path; they become
//! [`Fault`](super::Fault) reports instead.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error carried out of user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error enum for the Switchboard runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or contradictory arguments (duplicate names, wrong job kind).
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown job, component or handle.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation attempted in a lifecycle state that forbids it.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// The device-bus provider rejected an event stream change.
    #[error("provider error: {0}")]
    Provider(String),

    /// Failure escaping a user-supplied callback.
    #[error("callback failure: {0}")]
    Callback(#[from] BoxError),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn callback(msg: impl Into<String>) -> Self {
        let boxed: BoxError = msg.into().into();
        Self::Callback(boxed)
    }
}
