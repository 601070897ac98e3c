//! Error types for the ctfile remote mode engine.
//!
//! Mirrors the error codes the wire protocol exposes to callers
//! (`INVALID_CTFILE_NAME`, `CANT_OPEN_REMOTE`, `SHORT_READ`, `SHORT_WRITE`,
//! `NOTHING_TO_DELETE`, `CAN_NOT_DELETE`, `CULL_EVERYTHING`,
//! `MISSING_CONFIG_VALUE`) plus an `Io` passthrough for generic errno-style
//! failures, following the flat, `#[error("...")]`-annotated enum pattern
//! used throughout this workspace for domain errors.

use std::io;

use thiserror::Error;

/// Result type for ctfile engine operations.
pub type CtResult<T> = Result<T, CtEngineError>;

/// Errors surfaced by the ctfile remote mode engine.
///
/// Every variant here is either fatal (the owning operation unwinds and the
/// caller observes `dying`) or a local, recoverable failure reported to the
/// caller directly (e.g. the synchronous polled open's short read/write).
#[derive(Debug, Error)]
pub enum CtEngineError {
    /// A caller-supplied or derived ctfile name failed verification.
    #[error("invalid ctfile name: {0}")]
    InvalidCtfileName(String),

    /// The server refused to open the requested remote name.
    #[error("can't open remote file: {0}")]
    CantOpenRemote(String),

    /// The synchronous polled open read fewer bytes than expected within
    /// the 20-second I/O timeout.
    #[error("short read")]
    ShortRead,

    /// The synchronous polled open wrote fewer bytes than expected within
    /// the 20-second I/O timeout.
    #[error("short write")]
    ShortWrite,

    /// A delete's match pattern selected no ctfiles.
    #[error("nothing to delete")]
    NothingToDelete,

    /// A retained ctfile's predecessor is scheduled for deletion.
    #[error("can not delete: {0}")]
    CanNotDelete(String),

    /// Cull's retention cutoff would delete every known ctfile.
    #[error("cull would delete every ctfile")]
    CullEverything,

    /// A required configuration value (e.g. `ctfile_keep_days`) was not set.
    #[error("missing config value: {0}")]
    MissingConfigValue(&'static str),

    /// A predecessor walk exceeded the total ctfile count without reaching
    /// a root, indicating a cyclic manifest chain.
    #[error("predecessor chain exceeded {0} hops without reaching a root")]
    DependencyCycle(usize),

    /// The server returned a reply that failed to parse or violated the
    /// expected transaction state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Generic I/O failure, passed through from the local filesystem or
    /// transport.
    #[error("I/O error: {0}")]
    Io(
        #[from]
        #[source]
        io::Error,
    ),
}
