//! Custom error types for the focuser core.
//!
//! This module defines the primary error type, `FocuserError`, used across the
//! crate. Using the `thiserror` crate, it provides one consistent place for
//! every failure class the core can surface, from transport I/O problems to
//! rejected motion requests.
//!
//! ## Error Taxonomy
//!
//! - **`Connection`**: an open or handshake failure. Surfaced to the caller
//!   and never retried internally; the core is left in a clean disconnected
//!   state ready for an explicit reconnect.
//! - **`Validation`**: an out-of-range or malformed request. The request is
//!   rejected and prior state is unchanged.
//! - **`Busy`**: a motion request arrived while a non-overridable move was in
//!   flight.
//! - **`Unsupported`**: the request needs a capability this hardware does not
//!   declare (e.g. an absolute seek on an open-loop motor).
//! - **`HardwareFault`**: the device vanished or stopped responding during
//!   motion. Forces the motion state machine back to idle; reported as a
//!   status change, never a crash.
//! - **`NotConnected`**: a command was issued while no link is live.
//!
//! `Io` and `Config` wrap their underlying error types via `#[from]` so the
//! `?` operator works at the transport and configuration seams.

use thiserror::Error;

/// Convenience alias for results using the focuser error type.
pub type FocusResult<T> = std::result::Result<T, FocuserError>;

#[derive(Error, Debug)]
pub enum FocuserError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Hardware fault: {0}")]
    HardwareFault(String),

    #[error("Not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl FocuserError {
    /// True for errors that must force the motion state machine to idle.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            FocuserError::HardwareFault(_) | FocuserError::NotConnected | FocuserError::Io(_)
        )
    }
}
