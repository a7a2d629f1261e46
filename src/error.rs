//! Error codes and Result alias for oakdb
//!
//! The numeric codes are the complete error surface of the library: no
//! message translation or localisation happens at this layer. An `Error`
//! may carry a short static context string for diagnostics, but callers
//! dispatch on the code alone.

use std::fmt;

/// Return codes surfaced unchanged at the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Generic error, including protocol misuse of the API
    Error = 1,
    /// Internal logic fault
    Internal = 2,
    /// Access permission denied
    Perm = 3,
    /// Operation aborted
    Abort = 4,
    /// A lock could not be obtained
    Busy = 5,
    /// Allocation failure
    NoMem = 7,
    /// Attempt to write a read-only database
    ReadOnly = 8,
    /// Operation interrupted
    Interrupt = 9,
    /// Disk I/O error
    IoErr = 10,
    /// The database image is malformed
    Corrupt = 11,
    /// Object not found
    NotFound = 12,
    /// Insertion failed because the disk is full
    Full = 13,
    /// Unable to open a file
    CantOpen = 14,
    /// Locking protocol violation
    Protocol = 15,
}

impl ErrorCode {
    /// Canonical name of the code, as surfaced by diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Error => "ERROR",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Perm => "PERM",
            ErrorCode::Abort => "ABORT",
            ErrorCode::Busy => "BUSY",
            ErrorCode::NoMem => "NOMEM",
            ErrorCode::ReadOnly => "READONLY",
            ErrorCode::Interrupt => "INTERRUPT",
            ErrorCode::IoErr => "IOERR",
            ErrorCode::Corrupt => "CORRUPT",
            ErrorCode::NotFound => "NOTFOUND",
            ErrorCode::Full => "FULL",
            ErrorCode::CantOpen => "CANTOPEN",
            ErrorCode::Protocol => "PROTOCOL",
        }
    }
}

/// Library error: a code plus optional static context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    code: ErrorCode,
    message: Option<&'static str>,
}

impl Error {
    /// Create an error carrying only a code.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Create an error with a short static context message.
    pub fn with_message(code: ErrorCode, message: &'static str) -> Self {
        Self {
            code,
            message: Some(message),
        }
    }

    /// The return code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The context message, if any.
    pub fn message(&self) -> Option<&'static str> {
        self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            Some(msg) => write!(f, "{}: {}", self.code.name(), msg),
            None => f.write_str(self.code.name()),
        }
    }
}

impl std::error::Error for Error {}

/// Result type alias for oakdb operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_names() {
        assert_eq!(ErrorCode::Corrupt.name(), "CORRUPT");
        assert_eq!(ErrorCode::CantOpen.name(), "CANTOPEN");
    }

    #[test]
    fn test_display() {
        let err = Error::with_message(ErrorCode::IoErr, "short read");
        assert_eq!(err.to_string(), "IOERR: short read");
        assert_eq!(Error::new(ErrorCode::Busy).to_string(), "BUSY");
    }
}
