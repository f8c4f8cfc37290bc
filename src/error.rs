//! Crate-wide status and error types.
//!
//! `Status` mirrors the original platform's `BTCES_STATUS` enum and is what
//! the public API returns; it is plain data, not `std::error::Error`, since
//! none of these variants carry a source error to chain. `CoexError` wraps
//! it for call sites that want the `std::error::Error` trait (mirroring the
//! hand-written, non-`thiserror` `Display` impls the bo-tie-linux unix
//! backend uses for its own error type).

use std::error::Error as StdError;
use std::fmt;

/// The outcome of a public API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Fail,
    OutOfMemory,
    NotImplemented,
    NotInitialized,
    InitializationFailed,
    InvalidParameters,
    InternalError,
    InvalidState,
    AlreadyRegistered,
    NotRegistered,
    AlreadyInitialized,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Status::Ok => "ok",
            Status::Fail => "failed",
            Status::OutOfMemory => "out of memory",
            Status::NotImplemented => "not implemented",
            Status::NotInitialized => "core is not initialized",
            Status::InitializationFailed => "initialization failed",
            Status::InvalidParameters => "invalid parameters",
            Status::InternalError => "internal error",
            Status::InvalidState => "invalid state",
            Status::AlreadyRegistered => "a subscriber is already registered",
            Status::NotRegistered => "no subscriber is registered",
            Status::AlreadyInitialized => "core is already initialized",
        };
        f.write_str(msg)
    }
}

/// An error returned from a fallible crate operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoexError(pub Status);

impl fmt::Display for CoexError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bt-ces: {}", self.0)
    }
}

impl StdError for CoexError {}

impl From<Status> for CoexError {
    fn from(status: Status) -> Self {
        CoexError(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        assert_eq!(CoexError(Status::NotInitialized).to_string(), "bt-ces: core is not initialized");
    }
}
