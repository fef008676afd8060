//! Crate-wide error type.
//!
//! Every fallible operation in libcrinit returns [`Result`]. The variants
//! mirror the failure classes the subsystems actually produce: bad
//! configuration input, missing keys/files/dependency targets, resource
//! exhaustion, I/O failures with their OS error attached, crypto failures
//! from the signature subsystem, non-I/O syscall failures, and conflicts
//! (duplicate task names, directives in the wrong context, exhausted
//! respawn budgets).

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Empty where non-empty was required, or a syntactically invalid value.
    InvalidInput(String),
    /// Missing key, missing dependency target, missing file.
    NotFound(String),
    /// Allocation failure, descriptor exhaustion, table growth failure.
    Resource(String),
    /// Read/write/open failure with the underlying OS error.
    Io {
        context: String,
        source: std::io::Error,
    },
    /// Key parse failure, signature mismatch, unsupported algorithm.
    Crypto(String),
    /// Syscall failure other than plain I/O (capability, cgroup, keyring,
    /// fork, reboot).
    Os {
        context: String,
        errno: nix::Error,
    },
    /// Duplicate task name, directive disallowed in context, respawn budget
    /// exhausted.
    Conflict(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn os(context: impl Into<String>, errno: nix::Error) -> Self {
        Self::Os {
            context: context.into(),
            errno,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::Resource(msg) => write!(f, "resource exhausted: {msg}"),
            Self::Io { context, source } => write!(f, "{context}: {source}"),
            Self::Crypto(msg) => write!(f, "crypto error: {msg}"),
            Self::Os { context, errno } => write!(f, "{context}: {errno}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Os { errno, .. } => Some(errno),
            _ => None,
        }
    }
}
