//! Error types for the data management subsystem.

use thiserror::Error;

use crate::status::{AccessMode, BackendStatus};

/// Result type alias for data management operations.
pub type DmResult<T> = Result<T, DmError>;

/// Errors raised while orchestrating the catalog and the storage elements.
#[derive(Debug, Error)]
pub enum DmError {
    /// The catalog did not grant write permission on a path.
    #[error("{operation}: Write access not permitted for this credential: {path}")]
    PermissionDenied {
        /// The operation that required write access.
        operation: &'static str,
        /// The path (or comma separated paths) that was checked.
        path: String,
    },

    /// A catalog request failed as a whole.
    #[error("catalog error: {msg}")]
    Catalog {
        /// Error message returned by the catalog.
        msg: String,
    },

    /// The status oracle could not answer a request.
    #[error("status oracle error for {backend}: {msg}")]
    StatusOracle {
        /// Backend whose status was requested.
        backend: String,
        /// Error message returned by the oracle.
        msg: String,
    },

    /// A storage element request failed.
    #[error("storage error at {backend}: {msg}")]
    Storage {
        /// Storage element name.
        backend: String,
        /// Error message returned by the storage element.
        msg: String,
    },

    /// The storage element failed its validity check or is unknown.
    #[error("The storage element is not currently valid: {backend}: {msg}")]
    InvalidBackend {
        /// Storage element name.
        backend: String,
        /// Reason reported by the factory or the element.
        msg: String,
    },

    /// The backend is not Active/Degraded for the requested access mode.
    #[error("Storage element {backend} is currently '{status}' for {mode}")]
    BackendUnavailable {
        /// Storage element name.
        backend: String,
        /// Access mode that was checked.
        mode: AccessMode,
        /// Status reported by the oracle.
        status: BackendStatus,
    },

    /// The named entity does not exist.
    #[error("No such file or directory: {what}")]
    NotFound {
        /// Description of the missing entity.
        what: String,
    },

    /// The logical name is already registered in the catalog.
    #[error("The supplied LFN already exists in the File Catalog: {lfn}")]
    AlreadyExists {
        /// The logical name.
        lfn: String,
    },

    /// The GUID is already registered under another logical name.
    #[error("This file GUID already exists for another file: {guid} is registered as {existing}")]
    GuidCollision {
        /// The colliding GUID.
        guid: String,
        /// Logical name that already owns the GUID.
        existing: String,
    },

    /// Physical size disagrees with the expected size.
    #[error("size mismatch for {what}: expected {expected}, got {actual}")]
    SizeMismatch {
        /// What was measured (locator or local path).
        what: String,
        /// Expected size in bytes.
        expected: u64,
        /// Actual size in bytes.
        actual: u64,
    },

    /// Content checksum disagrees with the catalog.
    #[error("checksum mismatch for {what}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// What was checked (locator or local path).
        what: String,
        /// Checksum recorded in the catalog.
        expected: String,
        /// Checksum computed locally.
        actual: String,
    },

    /// No replica survived source resolution.
    #[error("Failed to find any valid source Storage Elements for {lfn}")]
    NoValidSources {
        /// The logical name being replicated.
        lfn: String,
    },

    /// Every source candidate was attempted and none succeeded.
    #[error("Failed to replicate with all sources: {lfn}")]
    ReplicationExhausted {
        /// The logical name being replicated.
        lfn: String,
    },

    /// At least one cleaning backend failed to clear a directory.
    #[error("Failed to clean storage directory at all SEs: {path}")]
    CleaningFailed {
        /// The logical directory.
        path: String,
    },

    /// Caller supplied an argument the operation cannot use.
    #[error("invalid input: {msg}")]
    InvalidInput {
        /// Description of the problem.
        msg: String,
    },

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {msg}")]
    Config {
        /// Description of the problem.
        msg: String,
    },

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Free-form message, used for aggregated failures.
    #[error("{0}")]
    Message(String),
}

impl DmError {
    /// Shorthand for a whole-request catalog failure.
    pub fn catalog(msg: impl Into<String>) -> Self {
        DmError::Catalog { msg: msg.into() }
    }

    /// Shorthand for a storage element failure.
    pub fn storage(backend: impl Into<String>, msg: impl Into<String>) -> Self {
        DmError::Storage {
            backend: backend.into(),
            msg: msg.into(),
        }
    }

    /// Returns true for failures that must abort the whole operation rather
    /// than being folded into a per-item result.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            DmError::PermissionDenied { .. } | DmError::Catalog { .. } | DmError::StatusOracle { .. }
        )
    }
}
