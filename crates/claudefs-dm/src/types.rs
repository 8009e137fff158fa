//! Core data model shared by the catalog, the storage elements and the
//! orchestrator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Logical file name: a unique hierarchical path in the catalog namespace.
pub type Lfn = String;

/// Physical file name: a backend-specific locator for one copy of a file.
pub type Pfn = String;

/// Opaque storage element name, resolved through a storage factory.
pub type BackendId = String;

/// Physical copies of one logical file, keyed by storage element.
///
/// An empty set is a valid state meaning "no usable copy".
pub type ReplicaSet = BTreeMap<BackendId, Pfn>;

/// Catalog attributes of a logical file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Size in bytes (authoritative).
    pub size: u64,
    /// Content checksum, if one was registered.
    pub checksum: Option<String>,
    /// Globally unique identifier.
    pub guid: String,
    /// When the entry was registered.
    pub creation_date: DateTime<Utc>,
}

/// Everything the catalog needs to register a new file with its first replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRegistration {
    /// Physical locator of the first replica.
    pub pfn: Pfn,
    /// Size in bytes.
    pub size: u64,
    /// Storage element holding the first replica.
    pub backend: BackendId,
    /// Globally unique identifier.
    pub guid: String,
    /// Content checksum.
    pub checksum: Option<String>,
}

/// A (backend, locator) pair to add to or remove from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRegistration {
    /// Storage element.
    pub backend: BackendId,
    /// Physical locator at that storage element.
    pub pfn: Pfn,
}

/// Input tuple for file registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTuple {
    /// Logical name.
    pub lfn: Lfn,
    /// Physical locator as returned by the storage element.
    pub pfn: Pfn,
    /// Size in bytes.
    pub size: u64,
    /// Storage element holding the bytes.
    pub backend: BackendId,
    /// Globally unique identifier.
    pub guid: String,
    /// Content checksum.
    pub checksum: Option<String>,
}

/// Input tuple for replica registration and catalog replica removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaTuple {
    /// Logical name.
    pub lfn: Lfn,
    /// Physical locator.
    pub pfn: Pfn,
    /// Storage element.
    pub backend: BackendId,
}

impl ReplicaTuple {
    /// Create a new replica tuple.
    pub fn new(lfn: impl Into<Lfn>, pfn: impl Into<Pfn>, backend: impl Into<BackendId>) -> Self {
        Self {
            lfn: lfn.into(),
            pfn: pfn.into(),
            backend: backend.into(),
        }
    }
}

/// Catalog permissions on a path for the calling credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPermissions {
    /// Read permission.
    pub read: bool,
    /// Write permission.
    pub write: bool,
}

/// A file found while listing a catalog directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryFile {
    /// File attributes; only filled by verbose listings.
    pub metadata: Option<FileMetadata>,
    /// Registered replicas of the file.
    pub replicas: ReplicaSet,
}

/// A sub-directory found while listing a catalog directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubDirectory {
    /// Creation time; only filled by verbose listings.
    pub creation_date: Option<DateTime<Utc>>,
}

/// Contents of one catalog directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryListing {
    /// Files keyed by full logical name.
    pub files: BTreeMap<Lfn, DirectoryFile>,
    /// Sub-directories keyed by full path.
    pub sub_dirs: BTreeMap<String, SubDirectory>,
}

/// Parent directory of a logical name (`/a/b/c` → `/a/b`, `/a` → `/`).
pub fn parent_dir(lfn: &str) -> String {
    let trimmed = lfn.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// Final component of a logical name (`/a/b/c` → `c`).
pub fn base_name(lfn: &str) -> &str {
    let trimmed = lfn.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Join a directory and a name with exactly one separator.
pub fn join_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}
