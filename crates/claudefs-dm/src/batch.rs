//! Per-item batch results shared by every bulk operation.
//!
//! Each public operation partitions its input keys into a `successful` map
//! (key → value) and a `failed` map (key → reason). A key is never present in
//! both maps: inserting on one side evicts it from the other.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DmError, DmResult};

/// Details of a transfer whose bytes landed but whose catalog registration
/// did not, so a caller can retry only the registration phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRegistration {
    /// Logical name that should have been registered.
    pub lfn: String,
    /// Physical locator of the bytes at the destination.
    pub pfn: String,
    /// Destination storage element.
    pub backend: String,
    /// File size, when the registration was a full file registration.
    pub size: Option<u64>,
    /// File GUID, when the registration was a full file registration.
    pub guid: Option<String>,
    /// File checksum, when the registration was a full file registration.
    pub checksum: Option<String>,
    /// Why registration failed.
    pub reason: String,
}

impl fmt::Display for PendingRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Registration failed after transfer of {} to {} ({}): {}",
            self.lfn, self.backend, self.pfn, self.reason
        )
    }
}

/// Why a single item of a batch failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorReason {
    /// The entry (or physical copy) does not exist.
    NoSuchFile,
    /// The catalog entry exists but has no replicas.
    ZeroReplicas,
    /// Refused to remove the last remaining replica of a file.
    SoleReplica,
    /// Bytes were transferred but the catalog was not updated.
    RegistrationFailed(PendingRegistration),
    /// Any other failure, described by its message.
    Other(String),
}

impl ErrorReason {
    /// Returns the registration left pending by a partial success, if any.
    pub fn pending_registration(&self) -> Option<&PendingRegistration> {
        match self {
            ErrorReason::RegistrationFailed(pending) => Some(pending),
            _ => None,
        }
    }

    /// Returns true when the reason means "the thing is already absent".
    pub fn is_missing(&self) -> bool {
        match self {
            ErrorReason::NoSuchFile => true,
            ErrorReason::Other(msg) => msg.contains("No such file or directory"),
            _ => false,
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReason::NoSuchFile => write!(f, "No such file or directory"),
            ErrorReason::ZeroReplicas => write!(f, "File has zero replicas"),
            ErrorReason::SoleReplica => write!(f, "Failed to remove sole replica"),
            ErrorReason::RegistrationFailed(pending) => write!(f, "{}", pending),
            ErrorReason::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<DmError> for ErrorReason {
    fn from(err: DmError) -> Self {
        ErrorReason::Other(err.to_string())
    }
}

impl From<String> for ErrorReason {
    fn from(msg: String) -> Self {
        ErrorReason::Other(msg)
    }
}

impl From<&str> for ErrorReason {
    fn from(msg: &str) -> Self {
        ErrorReason::Other(msg.to_string())
    }
}

/// Successful/Failed partition of a batch operation's inputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult<K, V> {
    /// Items that completed, with their result value.
    pub successful: BTreeMap<K, V>,
    /// Items that failed, with the reason.
    pub failed: BTreeMap<K, ErrorReason>,
}

impl<K: Ord, V> Default for BatchResult<K, V> {
    fn default() -> Self {
        Self {
            successful: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V> BatchResult<K, V> {
    /// Create an empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a success, evicting any earlier failure for the key.
    pub fn succeed(&mut self, key: K, value: V) {
        self.failed.remove(&key);
        self.successful.insert(key, value);
    }

    /// Record a failure, evicting any earlier success for the key.
    pub fn fail(&mut self, key: K, reason: impl Into<ErrorReason>) {
        self.successful.remove(&key);
        self.failed.insert(key, reason.into());
    }

    /// Record a failure, appending to an existing failure text for the key.
    pub fn append_failure(&mut self, key: K, reason: impl Into<ErrorReason>) {
        let reason = reason.into();
        self.successful.remove(&key);
        let combined = match self.failed.remove(&key) {
            Some(previous) => ErrorReason::Other(format!("{}\n{}", previous, reason)),
            None => reason,
        };
        self.failed.insert(key, combined);
    }

    /// Fold another result into this one; the other result wins on conflicts.
    pub fn absorb(&mut self, other: BatchResult<K, V>) {
        for (key, value) in other.successful {
            self.succeed(key, value);
        }
        for (key, reason) in other.failed {
            self.fail(key, reason);
        }
    }

    /// Returns true if the key is in the successful map.
    pub fn is_successful(&self, key: &K) -> bool {
        self.successful.contains_key(key)
    }

    /// Returns true if the key is in the failed map.
    pub fn is_failed(&self, key: &K) -> bool {
        self.failed.contains_key(key)
    }

    /// Total number of accounted items.
    pub fn len(&self) -> usize {
        self.successful.len() + self.failed.len()
    }

    /// Returns true if no item has been accounted.
    pub fn is_empty(&self) -> bool {
        self.successful.is_empty() && self.failed.is_empty()
    }

    /// All accounted keys.
    pub fn keys(&self) -> BTreeSet<K> {
        self.successful
            .keys()
            .chain(self.failed.keys())
            .cloned()
            .collect()
    }

    /// Returns true if every input key is accounted exactly once and no
    /// other key appears.
    pub fn partitions<'a, I>(&self, inputs: I) -> bool
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let expected: BTreeSet<K> = inputs.into_iter().cloned().collect();
        let disjoint = self.successful.keys().all(|k| !self.failed.contains_key(k));
        disjoint && self.keys() == expected
    }

    /// Transform successful values, keeping failures untouched.
    pub fn map_values<W>(self, mut f: impl FnMut(&K, V) -> W) -> BatchResult<K, W> {
        let successful = self
            .successful
            .into_iter()
            .map(|(k, v)| {
                let w = f(&k, v);
                (k, w)
            })
            .collect();
        BatchResult {
            successful,
            failed: self.failed,
        }
    }
}

/// Merge the answers of two independent information sources.
///
/// Both succeed: `combine(primary, secondary)`. One fails: the other one's
/// data, with the failure logged. Both fail: an error whose message is the
/// two messages joined by a newline.
pub fn merge_sources<T>(
    primary: DmResult<T>,
    secondary: DmResult<T>,
    combine: impl FnOnce(T, T) -> T,
) -> DmResult<T> {
    match (primary, secondary) {
        (Ok(p), Ok(s)) => Ok(combine(p, s)),
        (Ok(p), Err(e)) => {
            warn!(error = %e, "secondary source failed, using primary only");
            Ok(p)
        }
        (Err(e), Ok(s)) => {
            warn!(error = %e, "primary source failed, using secondary only");
            Ok(s)
        }
        (Err(e1), Err(e2)) => Err(DmError::Message(format!("{}\n{}", e1, e2))),
    }
}
