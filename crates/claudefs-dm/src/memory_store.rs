//! In-memory storage element.
//!
//! Native locators have the form `mem://<name><lfn>`; the element additionally
//! serves its files to peers through its configured remote protocols (`srm`
//! by default), so `srm://<name><lfn>` addresses the same bytes. Faults can be
//! injected per operation or per path, and every call is counted.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::batch::{BatchResult, ErrorReason};
use crate::error::{DmError, DmResult};
use crate::storage::{split_locator, StorageElement};
use crate::types::Pfn;

const NATIVE_SCHEME: &str = "mem";

/// Operations that can be counted and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    /// `put_file`
    Put,
    /// `get_file`
    Get,
    /// `read_remote`
    ReadRemote,
    /// `replicate_from`
    Replicate,
    /// `remove_file`
    Remove,
    /// `remove_directory`
    RemoveDirectory,
    /// `exists`
    Exists,
    /// `get_file_size`
    Size,
}

/// Storage element keeping file contents in memory.
pub struct MemoryStorageElement {
    name: String,
    protocols: Vec<String>,
    files: RwLock<BTreeMap<String, Bytes>>,
    reported_sizes: RwLock<HashMap<String, u64>>,
    op_failures: RwLock<HashMap<StorageOp, String>>,
    path_failures: RwLock<HashMap<(StorageOp, String), String>>,
    calls: RwLock<HashMap<StorageOp, u64>>,
    valid: AtomicBool,
}

impl MemoryStorageElement {
    /// Create an empty, valid element serving `srm` to peers.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            protocols: vec!["srm".to_string()],
            files: RwLock::new(BTreeMap::new()),
            reported_sizes: RwLock::new(HashMap::new()),
            op_failures: RwLock::new(HashMap::new()),
            path_failures: RwLock::new(HashMap::new()),
            calls: RwLock::new(HashMap::new()),
            valid: AtomicBool::new(true),
        }
    }

    /// Replace the remote protocols.
    pub fn with_protocols(mut self, protocols: &[&str]) -> Self {
        self.protocols = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Store `data` for `lfn` directly; returns the native locator.
    pub fn insert(&self, lfn: &str, data: impl Into<Bytes>) -> Pfn {
        self.files.write().insert(lfn.to_string(), data.into());
        self.native_pfn(lfn)
    }

    /// Returns true if bytes are stored for `lfn`.
    pub fn contains(&self, lfn: &str) -> bool {
        self.files.read().contains_key(lfn)
    }

    /// Bytes stored for `lfn`.
    pub fn read(&self, lfn: &str) -> Option<Bytes> {
        self.files.read().get(lfn).cloned()
    }

    /// Number of stored files.
    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    /// Make `get_file_size` report `size` for `lfn` regardless of contents.
    pub fn set_reported_size(&self, lfn: &str, size: u64) {
        self.reported_sizes.write().insert(lfn.to_string(), size);
    }

    /// Toggle the validity check.
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    /// Fail every call of `op` as a whole request.
    pub fn fail_operation(&self, op: StorageOp, msg: &str) {
        self.op_failures.write().insert(op, msg.to_string());
    }

    /// Fail `op` for one logical path only.
    pub fn fail_path(&self, op: StorageOp, lfn: &str, msg: &str) {
        self.path_failures
            .write()
            .insert((op, lfn.to_string()), msg.to_string());
    }

    /// Number of calls of `op` so far.
    pub fn call_count(&self, op: StorageOp) -> u64 {
        self.calls.read().get(&op).copied().unwrap_or(0)
    }

    /// Number of data-path calls of any kind so far.
    pub fn total_calls(&self) -> u64 {
        self.calls.read().values().sum()
    }

    fn native_pfn(&self, lfn: &str) -> Pfn {
        format!("{}://{}/{}", NATIVE_SCHEME, self.name, lfn.trim_start_matches('/'))
    }

    fn record(&self, op: StorageOp) -> DmResult<()> {
        *self.calls.write().entry(op).or_insert(0) += 1;
        match self.op_failures.read().get(&op) {
            Some(msg) => Err(DmError::storage(&self.name, msg.clone())),
            None => Ok(()),
        }
    }

    fn path_failure(&self, op: StorageOp, key: &str) -> Option<String> {
        self.path_failures
            .read()
            .get(&(op, key.to_string()))
            .cloned()
    }

    fn key_of(&self, pfn: &str) -> DmResult<String> {
        let (_, rest) = split_locator(pfn).ok_or_else(|| {
            DmError::storage(&self.name, format!("malformed locator {}", pfn))
        })?;
        let path = rest.strip_prefix(self.name.as_str()).ok_or_else(|| {
            DmError::storage(&self.name, format!("locator {} does not belong here", pfn))
        })?;
        if !path.starts_with('/') {
            return Err(DmError::storage(
                &self.name,
                format!("locator {} does not belong here", pfn),
            ));
        }
        Ok(path.to_string())
    }

    fn lookup(&self, op: StorageOp, pfn: &str) -> DmResult<(String, Bytes)> {
        let key = self.key_of(pfn)?;
        if let Some(msg) = self.path_failure(op, &key) {
            return Err(DmError::storage(&self.name, msg));
        }
        let data = self.files.read().get(&key).cloned();
        match data {
            Some(data) => Ok((key, data)),
            None => Err(DmError::NotFound {
                what: format!("{} at {}", pfn, self.name),
            }),
        }
    }
}

#[async_trait]
impl StorageElement for MemoryStorageElement {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_valid(&self) -> DmResult<()> {
        if self.valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DmError::InvalidBackend {
                backend: self.name.clone(),
                msg: "storage element disabled".to_string(),
            })
        }
    }

    fn pfn_for_lfn(&self, lfn: &str) -> DmResult<Pfn> {
        if lfn.is_empty() {
            return Err(DmError::InvalidInput {
                msg: "empty logical name".to_string(),
            });
        }
        Ok(self.native_pfn(lfn))
    }

    fn pfn_for_protocol(&self, pfn: &str, protocols: &[String], _with_port: bool) -> DmResult<Pfn> {
        let key = self.key_of(pfn)?;
        let protocol = protocols
            .iter()
            .find(|p| self.protocols.contains(*p))
            .ok_or_else(|| {
                DmError::storage(
                    &self.name,
                    format!("none of the protocols {:?} is supported", protocols),
                )
            })?;
        Ok(format!("{}://{}{}", protocol, self.name, key))
    }

    fn remote_protocols(&self) -> Vec<String> {
        self.protocols.clone()
    }

    async fn put_file(&self, pfn: &str, source: &Path) -> DmResult<u64> {
        self.record(StorageOp::Put)?;
        let key = self.key_of(pfn)?;
        if let Some(msg) = self.path_failure(StorageOp::Put, &key) {
            return Err(DmError::storage(&self.name, msg));
        }
        let data = tokio::fs::read(source).await?;
        let size = data.len() as u64;
        self.files.write().insert(key, Bytes::from(data));
        debug!(backend = %self.name, pfn = %pfn, size, "memory put");
        Ok(size)
    }

    async fn get_file(&self, pfn: &str, destination: &Path) -> DmResult<u64> {
        self.record(StorageOp::Get)?;
        let (_, data) = self.lookup(StorageOp::Get, pfn)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(destination, &data).await?;
        Ok(data.len() as u64)
    }

    async fn read_remote(&self, url: &str) -> DmResult<Bytes> {
        self.record(StorageOp::ReadRemote)?;
        let scheme = split_locator(url).map(|(s, _)| s).unwrap_or_default();
        if !self.protocols.iter().any(|p| p == scheme) {
            return Err(DmError::storage(
                &self.name,
                format!("protocol {} is not served remotely", scheme),
            ));
        }
        let (_, data) = self.lookup(StorageOp::ReadRemote, url)?;
        Ok(data)
    }

    async fn replicate_from(
        &self,
        pfn: &str,
        source: &dyn StorageElement,
        source_url: &str,
        expected_size: u64,
    ) -> DmResult<u64> {
        self.record(StorageOp::Replicate)?;
        let key = self.key_of(pfn)?;
        if let Some(msg) = self.path_failure(StorageOp::Replicate, &key) {
            return Err(DmError::storage(&self.name, msg));
        }
        let data = source.read_remote(source_url).await?;
        let size = data.len() as u64;
        if size != expected_size {
            return Err(DmError::SizeMismatch {
                what: source_url.to_string(),
                expected: expected_size,
                actual: size,
            });
        }
        self.files.write().insert(key, data);
        Ok(size)
    }

    async fn remove_file(&self, pfns: &[Pfn]) -> DmResult<BatchResult<Pfn, Pfn>> {
        self.record(StorageOp::Remove)?;
        let mut result = BatchResult::new();
        for pfn in pfns {
            let key = match self.key_of(pfn) {
                Ok(key) => key,
                Err(e) => {
                    result.fail(pfn.clone(), e);
                    continue;
                }
            };
            if let Some(msg) = self.path_failure(StorageOp::Remove, &key) {
                result.fail(pfn.clone(), msg);
                continue;
            }
            if self.files.write().remove(&key).is_some() {
                result.succeed(pfn.clone(), pfn.clone());
            } else {
                result.fail(pfn.clone(), ErrorReason::NoSuchFile);
            }
        }
        Ok(result)
    }

    async fn remove_directory(&self, path: &str, recursive: bool) -> DmResult<u64> {
        self.record(StorageOp::RemoveDirectory)?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        if let Some(msg) = self.path_failure(StorageOp::RemoveDirectory, path) {
            return Err(DmError::storage(&self.name, msg));
        }
        let mut files = self.files.write();
        let doomed: Vec<String> = files
            .keys()
            .filter(|k| {
                k.strip_prefix(&prefix)
                    .map(|rest| recursive || !rest.contains('/'))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for key in &doomed {
            files.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn exists(&self, path: &str) -> DmResult<bool> {
        self.record(StorageOp::Exists)?;
        let trimmed = path.trim_end_matches('/');
        let prefix = format!("{}/", trimmed);
        Ok(self
            .files
            .read()
            .keys()
            .any(|k| k == trimmed || k.starts_with(&prefix)))
    }

    async fn get_file_size(&self, pfns: &[Pfn]) -> DmResult<BatchResult<Pfn, u64>> {
        self.record(StorageOp::Size)?;
        let mut result = BatchResult::new();
        for pfn in pfns {
            match self.lookup(StorageOp::Size, pfn) {
                Ok((key, data)) => {
                    let size = self
                        .reported_sizes
                        .read()
                        .get(&key)
                        .copied()
                        .unwrap_or(data.len() as u64);
                    result.succeed(pfn.clone(), size);
                }
                Err(DmError::NotFound { .. }) => result.fail(pfn.clone(), ErrorReason::NoSuchFile),
                Err(e) => result.fail(pfn.clone(), e),
            }
        }
        Ok(result)
    }
}
