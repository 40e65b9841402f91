//! Error taxonomy for the inventory and catalog subsystem.
//!
//! Callers need to tell four situations apart: an archive whose bytes do
//! not match the declared hash, a network problem, a cooperative
//! cancellation, and an entry that simply is not there. Each gets its own
//! variant so the distinction survives all the way to the orchestrator.
//! Lock contention is deliberately not represented - entry locks block
//! until available.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the dukebox core.
#[derive(Error, Debug)]
pub enum Error {
    /// The digest computed over written bytes does not match the
    /// descriptor's declared hash. The partial artifact has been
    /// discarded; nothing was committed.
    #[error("verification failed for '{id}': expected {expected}, computed {actual}")]
    VerificationFailed {
        id: String,
        expected: String,
        actual: String,
    },

    /// An on-disk entry's metadata record could not be read or parsed at
    /// load time. The entry is excluded from the index but its files are
    /// left in place.
    #[error("corrupt metadata record at {path}")]
    CorruptMetadata {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    /// A metadata record is missing a required key or carries an
    /// unparsable value.
    #[error("metadata field '{key}': {reason}")]
    MetadataField { key: String, reason: String },

    /// The operation requires an entry that does not exist.
    #[error("no entry found for '{id}'")]
    NotFound { id: String },

    /// A network or HTTP failure while fetching archives or backend
    /// metadata. `status` is set when the upstream answered with >= 400.
    #[error("transport failure for {uri}{}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transport {
        uri: String,
        status: Option<u16>,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The operation was stopped through its cancellation poll.
    #[error("operation cancelled")]
    Cancelled,

    /// The archive payload is not in a container format this build can
    /// extract.
    #[error("unsupported archive container: {detail}")]
    UnsupportedArchive { detail: String },

    /// Extraction failed after the container format was recognized.
    #[error("unpack failed: {detail}")]
    Unpack { detail: String },

    /// A descriptor field violates its construction invariant.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// A search criteria field violates its construction invariant.
    #[error("invalid search criteria: {0}")]
    InvalidCriteria(String),

    /// The catalog has no backend registered under the given uri.
    #[error("unknown repository backend '{uri}'")]
    UnknownRepository { uri: String },

    /// A backend with the given uri is already registered.
    #[error("repository backend '{uri}' is already registered")]
    DuplicateRepository { uri: String },

    /// A background task died before producing its result.
    #[error("internal task failure: {0}")]
    Internal(String),

    /// The descriptor names a digest algorithm this build cannot compute.
    #[error("unsupported hash algorithm '{algorithm}'")]
    UnsupportedAlgorithm { algorithm: String },

    /// Filesystem failure, tagged with the path that was being touched.
    #[error("I/O failure at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The client worker has already been shut down.
    #[error("client is closed")]
    ClientClosed,

    /// The on-disk configuration file is malformed or unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the rate-limit class of transport failures a backend
    /// refresh may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport {
                status: Some(400..=499),
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
