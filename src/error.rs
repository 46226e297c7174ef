//! Error classification shared by every listener in the crate.
//!
//! Everything is a plain [`std::io::Error`]. Errors a caller may retry on
//! (the accept-loop convention for temporary listener errors) are either of a
//! transient kind or wrapped with [`temporary`]; everything else is permanent.

use std::error::Error as StdError;
use std::fmt;
use std::io::{Error, ErrorKind};

#[derive(Debug)]
struct Temporary(Error);

impl fmt::Display for Temporary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temporary: {}", self.0)
    }
}

impl StdError for Temporary {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.0)
    }
}

/// Marks `err` as temporary, keeping its kind.
pub fn temporary(err: Error) -> Error {
    if is_temporary(&err) {
        return err;
    }
    Error::new(err.kind(), Temporary(err))
}

/// Whether an accept loop should retry after `err`.
pub fn is_temporary(err: &Error) -> bool {
    is_transient(err) || err.get_ref().map_or(false, |e| e.is::<Temporary>())
}

/// Kinds that say nothing about the health of the underlying connection.
pub(crate) fn is_transient(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::TimedOut
    )
}

pub(crate) fn closed(what: &str) -> Error {
    Error::new(ErrorKind::NotConnected, format!("{} closed", what))
}

pub(crate) fn deadline_exceeded() -> Error {
    Error::new(ErrorKind::TimedOut, "deadline exceeded")
}

pub(crate) fn deadline_unsupported() -> Error {
    Error::new(
        ErrorKind::Unsupported,
        "listener does not support accept deadline setting",
    )
}
