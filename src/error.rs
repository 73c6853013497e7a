//! Error types for extraction and repack runs.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::progress::Phase;

/// Exit status for "bad input" (missing files, unusable arguments).
pub const EXIT_BAD_INPUT: i32 = 2;

/// Exit status for "operation failed" (an external tool or the filesystem).
pub const EXIT_FAILED: i32 = 1;

/// Exit status for "must run with elevated privilege" (sysexits `EX_NOPERM`).
pub const EXIT_PRIVILEGE: i32 = 77;

/// The main error type for superimage operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No loop device could be bound to the image.
    #[error("attaching {} to a loop device: {cause}", .image.display())]
    Attach { image: PathBuf, cause: String },

    /// `mount` exited non-zero.
    #[error("mounting {} on {}: {cause}", .device.display(), .target.display())]
    Mount {
        device: PathBuf,
        target: PathBuf,
        cause: String,
    },

    /// The partition cannot hold the replacement artifact.
    #[error(
        "not enough free space on {} for {}: need {needed} bytes, {available} available",
        .partition.display(),
        .artifact.display()
    )]
    InsufficientSpace {
        partition: PathBuf,
        artifact: PathBuf,
        needed: u64,
        available: u64,
    },

    /// A formatting or compression tool exited non-zero.
    #[error("building {}: {cause}", .output.display())]
    Build { output: PathBuf, cause: String },

    /// A copy into or out of an image failed.
    #[error("copying {} to {}: {cause}", .from.display(), .to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        cause: String,
    },

    /// Any other external tool failure.
    #[error("{tool}: {cause}")]
    Tool { tool: String, cause: String },

    /// Filesystem error with the operation that caused it.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Another run holds the image.
    #[error("{} is locked by another run", .path.display())]
    Locked { path: PathBuf },

    /// The run was interrupted between steps.
    #[error("aborted before {0}")]
    Aborted(Phase),

    /// The session was used after release or attached twice.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// A required input does not exist.
    #[error("{what} not found: {}", .path.display())]
    MissingInput { what: &'static str, path: PathBuf },

    /// Inputs exist but cannot be used as given.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The configuration file is unreadable or malformed.
    #[error("invalid configuration {}: {cause}", .path.display())]
    Config { path: PathBuf, cause: String },

    /// Host tools required for the run are not installed.
    #[error("missing required host tools:\n{0}")]
    MissingTools(String),

    /// Loop devices and mounts need raw block-device access.
    #[error("{0}")]
    Privilege(String),

    /// An error annotated with the phase in which it happened.
    #[error("{phase}: {source}")]
    Step {
        phase: Phase,
        #[source]
        source: Box<Error>,
    },
}

/// Result type alias for superimage operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an I/O error with a description of what was being done.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Annotate the error with the phase it occurred in.
    ///
    /// Errors that already carry a phase are returned unchanged so the
    /// innermost phase is the one reported.
    pub fn at(self, phase: Phase) -> Self {
        match self {
            Error::Step { .. } | Error::Aborted(_) => self,
            other => Error::Step {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The error with any phase annotation stripped.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Process exit status distinguishing bad input, failed operations and
    /// missing privileges.
    pub fn exit_code(&self) -> i32 {
        match self.root_cause() {
            Error::MissingInput { .. }
            | Error::InvalidInput(_)
            | Error::Config { .. }
            | Error::MissingTools(_) => EXIT_BAD_INPUT,
            Error::Privilege(_) => EXIT_PRIVILEGE,
            _ => EXIT_FAILED,
        }
    }
}

/// Attach a description to a raw `io::Result`.
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Error::io(f(), e))
    }
}
