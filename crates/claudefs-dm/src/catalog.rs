//! File catalog interface and an in-memory catalog.
//!
//! The catalog maps logical names to file attributes and to the replicas that
//! hold the bytes. It is the authority on where copies live; the orchestrator
//! never trusts a caller-supplied location list.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::batch::{BatchResult, ErrorReason};
use crate::error::{DmError, DmResult};
use crate::types::{
    parent_dir, BackendId, DirectoryFile, DirectoryListing, FileMetadata, FileRegistration, Lfn,
    PathPermissions, Pfn, ReplicaRegistration, ReplicaSet, SubDirectory,
};

/// Metadata and replica-location operations of a file catalog.
///
/// Whole-request failures are returned as `Err`; per-item failures land in
/// the `failed` map of the returned [`BatchResult`].
#[async_trait]
pub trait FileCatalog: Send + Sync {
    /// Replicas of each logical name. Unless `all_statuses` is set, replicas
    /// flagged as problematic are hidden. Entries without any replica fail
    /// with [`ErrorReason::ZeroReplicas`].
    async fn get_replicas(
        &self,
        lfns: &[Lfn],
        all_statuses: bool,
    ) -> DmResult<BatchResult<Lfn, ReplicaSet>>;

    /// File attributes.
    async fn get_file_metadata(&self, lfns: &[Lfn]) -> DmResult<BatchResult<Lfn, FileMetadata>>;

    /// Registered sizes.
    async fn get_file_size(&self, lfns: &[Lfn]) -> DmResult<BatchResult<Lfn, u64>>;

    /// Register new files with their first replica.
    async fn add_file(
        &self,
        files: &BTreeMap<Lfn, FileRegistration>,
    ) -> DmResult<BatchResult<Lfn, ()>>;

    /// Add a replica to existing files.
    async fn add_replica(
        &self,
        replicas: &BTreeMap<Lfn, ReplicaRegistration>,
    ) -> DmResult<BatchResult<Lfn, ()>>;

    /// Remove files together with all their replica records.
    async fn remove_file(&self, lfns: &[Lfn]) -> DmResult<BatchResult<Lfn, ()>>;

    /// Remove one replica record per file.
    async fn remove_replica(
        &self,
        replicas: &BTreeMap<Lfn, ReplicaRegistration>,
    ) -> DmResult<BatchResult<Lfn, ()>>;

    /// Files and sub-directories directly inside `path`.
    async fn list_directory(&self, path: &str, verbose: bool) -> DmResult<DirectoryListing>;

    /// Remove a directory. Fails if files are still registered below it.
    async fn remove_directory(&self, path: &str, recursive: bool) -> DmResult<()>;

    /// Permissions of the calling credential on each path.
    async fn get_path_permissions(
        &self,
        paths: &[String],
    ) -> DmResult<BatchResult<String, PathPermissions>>;

    /// Existence check by name and optional GUID.
    ///
    /// Each successful value is `Some(lfn)` when the name itself is
    /// registered, `Some(other)` when the GUID belongs to another name, and
    /// `None` when neither is known.
    async fn exists(
        &self,
        queries: &BTreeMap<Lfn, Option<String>>,
    ) -> DmResult<BatchResult<Lfn, Option<Lfn>>>;
}

/// Catalog operations that can be counted and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatalogOp {
    /// `get_replicas`
    GetReplicas,
    /// `get_file_metadata`
    GetFileMetadata,
    /// `get_file_size`
    GetFileSize,
    /// `add_file`
    AddFile,
    /// `add_replica`
    AddReplica,
    /// `remove_file`
    RemoveFile,
    /// `remove_replica`
    RemoveReplica,
    /// `list_directory`
    ListDirectory,
    /// `remove_directory`
    RemoveDirectory,
    /// `get_path_permissions`
    GetPathPermissions,
    /// `exists`
    Exists,
}

#[derive(Debug, Clone)]
struct ReplicaRecord {
    pfn: Pfn,
    problematic: bool,
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    metadata: FileMetadata,
    replicas: BTreeMap<BackendId, ReplicaRecord>,
}

#[derive(Debug, Default)]
struct CatalogState {
    files: BTreeMap<Lfn, CatalogEntry>,
    dirs: BTreeMap<String, DateTime<Utc>>,
    guids: HashMap<String, Lfn>,
    permissions: BTreeMap<String, PathPermissions>,
    op_failures: HashMap<CatalogOp, String>,
    item_failures: HashMap<(CatalogOp, String), String>,
    calls: HashMap<CatalogOp, u64>,
}

impl CatalogState {
    fn make_dirs(&mut self, path: &str) {
        let mut current = path.trim_end_matches('/').to_string();
        if current.is_empty() {
            current = "/".to_string();
        }
        loop {
            if self.dirs.contains_key(&current) {
                break;
            }
            self.dirs.insert(current.clone(), Utc::now());
            if current == "/" {
                break;
            }
            current = parent_dir(&current);
        }
    }

    fn item_failure(&self, op: CatalogOp, key: &str) -> Option<String> {
        self.item_failures.get(&(op, key.to_string())).cloned()
    }

    fn permissions_for(&self, path: &str) -> PathPermissions {
        let mut current = path.trim_end_matches('/').to_string();
        if current.is_empty() {
            current = "/".to_string();
        }
        loop {
            if let Some(perms) = self.permissions.get(&current) {
                return *perms;
            }
            if current == "/" {
                return PathPermissions {
                    read: true,
                    write: true,
                };
            }
            current = parent_dir(&current);
        }
    }
}

/// Catalog kept in memory, with permission, status and fault injection hooks.
#[derive(Debug)]
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        let mut state = CatalogState::default();
        state.dirs.insert("/".to_string(), Utc::now());
        Self {
            state: RwLock::new(state),
        }
    }
}

impl MemoryCatalog {
    /// Create a catalog holding only the root directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file directly; returns the generated GUID.
    pub fn insert_file(
        &self,
        lfn: &str,
        size: u64,
        checksum: Option<&str>,
        replicas: &[(&str, &str)],
    ) -> String {
        let guid = uuid::Uuid::new_v4().to_string().to_uppercase();
        let mut state = self.state.write();
        state.make_dirs(&parent_dir(lfn));
        state.guids.insert(guid.clone(), lfn.to_string());
        state.files.insert(
            lfn.to_string(),
            CatalogEntry {
                metadata: FileMetadata {
                    size,
                    checksum: checksum.map(str::to_string),
                    guid: guid.clone(),
                    creation_date: Utc::now(),
                },
                replicas: replicas
                    .iter()
                    .map(|(backend, pfn)| {
                        (
                            backend.to_string(),
                            ReplicaRecord {
                                pfn: pfn.to_string(),
                                problematic: false,
                            },
                        )
                    })
                    .collect(),
            },
        );
        guid
    }

    /// Create a directory and its ancestors.
    pub fn make_directory(&self, path: &str) {
        self.state.write().make_dirs(path);
    }

    /// Override the creation date of a file or directory.
    pub fn set_creation_date(&self, path: &str, date: DateTime<Utc>) {
        let mut state = self.state.write();
        if let Some(entry) = state.files.get_mut(path) {
            entry.metadata.creation_date = date;
        } else if let Some(created) = state.dirs.get_mut(path) {
            *created = date;
        }
    }

    /// Set the write permission on `prefix` and everything below it.
    pub fn set_write_permission(&self, prefix: &str, write: bool) {
        self.state.write().permissions.insert(
            prefix.trim_end_matches('/').to_string(),
            PathPermissions { read: true, write },
        );
    }

    /// Flag a replica as problematic (hidden unless all statuses are requested).
    pub fn set_problematic(&self, lfn: &str, backend: &str, problematic: bool) {
        if let Some(record) = self
            .state
            .write()
            .files
            .get_mut(lfn)
            .and_then(|entry| entry.replicas.get_mut(backend))
        {
            record.problematic = problematic;
        }
    }

    /// Fail every call of `op` as a whole request.
    pub fn fail_operation(&self, op: CatalogOp, msg: &str) {
        self.state.write().op_failures.insert(op, msg.to_string());
    }

    /// Fail `op` for a single key (logical name or path).
    pub fn fail_item(&self, op: CatalogOp, key: &str, msg: &str) {
        self.state
            .write()
            .item_failures
            .insert((op, key.to_string()), msg.to_string());
    }

    /// Clear all injected failures.
    pub fn clear_failures(&self) {
        let mut state = self.state.write();
        state.op_failures.clear();
        state.item_failures.clear();
    }

    /// Number of calls of `op` so far.
    pub fn call_count(&self, op: CatalogOp) -> u64 {
        self.state.read().calls.get(&op).copied().unwrap_or(0)
    }

    /// All replicas of a file regardless of status.
    pub fn replicas_of(&self, lfn: &str) -> Option<ReplicaSet> {
        self.state.read().files.get(lfn).map(|entry| {
            entry
                .replicas
                .iter()
                .map(|(backend, record)| (backend.clone(), record.pfn.clone()))
                .collect()
        })
    }

    /// Attributes of a file.
    pub fn metadata_of(&self, lfn: &str) -> Option<FileMetadata> {
        self.state
            .read()
            .files
            .get(lfn)
            .map(|entry| entry.metadata.clone())
    }

    /// Returns true if the file is registered.
    pub fn contains_file(&self, lfn: &str) -> bool {
        self.state.read().files.contains_key(lfn)
    }

    /// Returns true if the directory is registered.
    pub fn contains_directory(&self, path: &str) -> bool {
        self.state.read().dirs.contains_key(path)
    }

    fn record(&self, op: CatalogOp) -> DmResult<()> {
        let mut state = self.state.write();
        *state.calls.entry(op).or_insert(0) += 1;
        match state.op_failures.get(&op) {
            Some(msg) => Err(DmError::catalog(msg.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl FileCatalog for MemoryCatalog {
    async fn get_replicas(
        &self,
        lfns: &[Lfn],
        all_statuses: bool,
    ) -> DmResult<BatchResult<Lfn, ReplicaSet>> {
        self.record(CatalogOp::GetReplicas)?;
        let state = self.state.read();
        let mut result = BatchResult::new();
        for lfn in lfns {
            if let Some(msg) = state.item_failure(CatalogOp::GetReplicas, lfn) {
                result.fail(lfn.clone(), msg);
                continue;
            }
            match state.files.get(lfn) {
                None => result.fail(lfn.clone(), ErrorReason::NoSuchFile),
                Some(entry) if entry.replicas.is_empty() => {
                    result.fail(lfn.clone(), ErrorReason::ZeroReplicas)
                }
                Some(entry) => {
                    let replicas = entry
                        .replicas
                        .iter()
                        .filter(|(_, record)| all_statuses || !record.problematic)
                        .map(|(backend, record)| (backend.clone(), record.pfn.clone()))
                        .collect();
                    result.succeed(lfn.clone(), replicas);
                }
            }
        }
        Ok(result)
    }

    async fn get_file_metadata(&self, lfns: &[Lfn]) -> DmResult<BatchResult<Lfn, FileMetadata>> {
        self.record(CatalogOp::GetFileMetadata)?;
        let state = self.state.read();
        let mut result = BatchResult::new();
        for lfn in lfns {
            if let Some(msg) = state.item_failure(CatalogOp::GetFileMetadata, lfn) {
                result.fail(lfn.clone(), msg);
                continue;
            }
            match state.files.get(lfn) {
                Some(entry) => result.succeed(lfn.clone(), entry.metadata.clone()),
                None => result.fail(lfn.clone(), ErrorReason::NoSuchFile),
            }
        }
        Ok(result)
    }

    async fn get_file_size(&self, lfns: &[Lfn]) -> DmResult<BatchResult<Lfn, u64>> {
        self.record(CatalogOp::GetFileSize)?;
        let state = self.state.read();
        let mut result = BatchResult::new();
        for lfn in lfns {
            if let Some(msg) = state.item_failure(CatalogOp::GetFileSize, lfn) {
                result.fail(lfn.clone(), msg);
                continue;
            }
            match state.files.get(lfn) {
                Some(entry) => result.succeed(lfn.clone(), entry.metadata.size),
                None => result.fail(lfn.clone(), ErrorReason::NoSuchFile),
            }
        }
        Ok(result)
    }

    async fn add_file(
        &self,
        files: &BTreeMap<Lfn, FileRegistration>,
    ) -> DmResult<BatchResult<Lfn, ()>> {
        self.record(CatalogOp::AddFile)?;
        let mut state = self.state.write();
        let mut result = BatchResult::new();
        for (lfn, reg) in files {
            if let Some(msg) = state.item_failure(CatalogOp::AddFile, lfn) {
                result.fail(lfn.clone(), msg);
                continue;
            }
            if state.files.contains_key(lfn) {
                result.fail(lfn.clone(), "File already exists");
                continue;
            }
            if let Some(existing) = state.guids.get(&reg.guid) {
                result.fail(
                    lfn.clone(),
                    format!("GUID {} already registered as {}", reg.guid, existing),
                );
                continue;
            }
            state.make_dirs(&parent_dir(lfn));
            state.guids.insert(reg.guid.clone(), lfn.clone());
            let mut replicas = BTreeMap::new();
            replicas.insert(
                reg.backend.clone(),
                ReplicaRecord {
                    pfn: reg.pfn.clone(),
                    problematic: false,
                },
            );
            state.files.insert(
                lfn.clone(),
                CatalogEntry {
                    metadata: FileMetadata {
                        size: reg.size,
                        checksum: reg.checksum.clone(),
                        guid: reg.guid.clone(),
                        creation_date: Utc::now(),
                    },
                    replicas,
                },
            );
            debug!(lfn = %lfn, backend = %reg.backend, "catalog: file added");
            result.succeed(lfn.clone(), ());
        }
        Ok(result)
    }

    async fn add_replica(
        &self,
        replicas: &BTreeMap<Lfn, ReplicaRegistration>,
    ) -> DmResult<BatchResult<Lfn, ()>> {
        self.record(CatalogOp::AddReplica)?;
        let mut state = self.state.write();
        let mut result = BatchResult::new();
        for (lfn, reg) in replicas {
            if let Some(msg) = state.item_failure(CatalogOp::AddReplica, lfn) {
                result.fail(lfn.clone(), msg);
                continue;
            }
            match state.files.get_mut(lfn) {
                Some(entry) => {
                    entry.replicas.insert(
                        reg.backend.clone(),
                        ReplicaRecord {
                            pfn: reg.pfn.clone(),
                            problematic: false,
                        },
                    );
                    result.succeed(lfn.clone(), ());
                }
                None => result.fail(lfn.clone(), ErrorReason::NoSuchFile),
            }
        }
        Ok(result)
    }

    async fn remove_file(&self, lfns: &[Lfn]) -> DmResult<BatchResult<Lfn, ()>> {
        self.record(CatalogOp::RemoveFile)?;
        let mut state = self.state.write();
        let mut result = BatchResult::new();
        for lfn in lfns {
            if let Some(msg) = state.item_failure(CatalogOp::RemoveFile, lfn) {
                result.fail(lfn.clone(), msg);
                continue;
            }
            match state.files.remove(lfn) {
                Some(entry) => {
                    state.guids.remove(&entry.metadata.guid);
                    result.succeed(lfn.clone(), ());
                }
                None => result.fail(lfn.clone(), ErrorReason::NoSuchFile),
            }
        }
        Ok(result)
    }

    async fn remove_replica(
        &self,
        replicas: &BTreeMap<Lfn, ReplicaRegistration>,
    ) -> DmResult<BatchResult<Lfn, ()>> {
        self.record(CatalogOp::RemoveReplica)?;
        let mut state = self.state.write();
        let mut result = BatchResult::new();
        for (lfn, reg) in replicas {
            if let Some(msg) = state.item_failure(CatalogOp::RemoveReplica, lfn) {
                result.fail(lfn.clone(), msg);
                continue;
            }
            match state.files.get_mut(lfn) {
                Some(entry) => {
                    entry.replicas.remove(&reg.backend);
                    result.succeed(lfn.clone(), ());
                }
                None => result.fail(lfn.clone(), ErrorReason::NoSuchFile),
            }
        }
        Ok(result)
    }

    async fn list_directory(&self, path: &str, verbose: bool) -> DmResult<DirectoryListing> {
        self.record(CatalogOp::ListDirectory)?;
        let state = self.state.read();
        if let Some(msg) = state.item_failure(CatalogOp::ListDirectory, path) {
            return Err(DmError::catalog(msg));
        }
        let dir = path.trim_end_matches('/');
        let dir = if dir.is_empty() { "/" } else { dir };
        if !state.dirs.contains_key(dir) {
            return Err(DmError::NotFound {
                what: format!("directory {}", dir),
            });
        }

        let mut listing = DirectoryListing::default();
        for (lfn, entry) in &state.files {
            if parent_dir(lfn) != dir {
                continue;
            }
            listing.files.insert(
                lfn.clone(),
                DirectoryFile {
                    metadata: verbose.then(|| entry.metadata.clone()),
                    replicas: entry
                        .replicas
                        .iter()
                        .map(|(backend, record)| (backend.clone(), record.pfn.clone()))
                        .collect(),
                },
            );
        }
        for (sub, created) in &state.dirs {
            if sub != "/" && parent_dir(sub) == dir {
                listing.sub_dirs.insert(
                    sub.clone(),
                    SubDirectory {
                        creation_date: verbose.then_some(*created),
                    },
                );
            }
        }
        Ok(listing)
    }

    async fn remove_directory(&self, path: &str, recursive: bool) -> DmResult<()> {
        self.record(CatalogOp::RemoveDirectory)?;
        let mut state = self.state.write();
        if let Some(msg) = state.item_failure(CatalogOp::RemoveDirectory, path) {
            return Err(DmError::catalog(msg));
        }
        let dir = path.trim_end_matches('/').to_string();
        if !state.dirs.contains_key(&dir) {
            return Err(DmError::NotFound {
                what: format!("directory {}", dir),
            });
        }
        let prefix = format!("{}/", dir);
        if state.files.keys().any(|lfn| lfn.starts_with(&prefix)) {
            return Err(DmError::catalog(format!("Directory not empty: {}", dir)));
        }
        let subdirs: Vec<String> = state
            .dirs
            .keys()
            .filter(|d| d.starts_with(&prefix))
            .cloned()
            .collect();
        if !subdirs.is_empty() && !recursive {
            return Err(DmError::catalog(format!("Directory not empty: {}", dir)));
        }
        for sub in subdirs {
            state.dirs.remove(&sub);
        }
        state.dirs.remove(&dir);
        Ok(())
    }

    async fn get_path_permissions(
        &self,
        paths: &[String],
    ) -> DmResult<BatchResult<String, PathPermissions>> {
        self.record(CatalogOp::GetPathPermissions)?;
        let state = self.state.read();
        let mut result = BatchResult::new();
        for path in paths {
            match state.item_failure(CatalogOp::GetPathPermissions, path) {
                Some(msg) => result.fail(path.clone(), msg),
                None => result.succeed(path.clone(), state.permissions_for(path)),
            }
        }
        Ok(result)
    }

    async fn exists(
        &self,
        queries: &BTreeMap<Lfn, Option<String>>,
    ) -> DmResult<BatchResult<Lfn, Option<Lfn>>> {
        self.record(CatalogOp::Exists)?;
        let state = self.state.read();
        let mut result = BatchResult::new();
        for (lfn, guid) in queries {
            if let Some(msg) = state.item_failure(CatalogOp::Exists, lfn) {
                result.fail(lfn.clone(), msg);
                continue;
            }
            let found = if state.files.contains_key(lfn) {
                Some(lfn.clone())
            } else {
                guid.as_ref().and_then(|g| state.guids.get(g).cloned())
            };
            result.succeed(lfn.clone(), found);
        }
        Ok(result)
    }
}
