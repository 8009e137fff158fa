//! Filesystem-backed storage element.
//!
//! Every logical name maps to `<root><lfn>` on the local disk and its locator
//! is `file://<root><lfn>`. The element serves `file` to peers, so two local
//! elements on the same host can copy between each other directly.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::batch::{BatchResult, ErrorReason};
use crate::error::{DmError, DmResult};
use crate::storage::{split_locator, StorageElement};
use crate::types::Pfn;

const FILE_SCHEME: &str = "file";

/// Storage element rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStorageElement {
    name: String,
    root: PathBuf,
}

impl LocalStorageElement {
    /// Create an element named `name` storing files below `root`.
    pub fn new(name: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            root: root.into(),
        }
    }

    /// Directory holding this element's files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk path of a logical name. Names with `..` components are
    /// rejected so nothing outside the root is ever touched.
    pub fn local_path(&self, lfn: &str) -> DmResult<PathBuf> {
        let relative = Path::new(lfn.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(DmError::InvalidInput {
                msg: format!("logical name {} escapes storage element {}", lfn, self.name),
            });
        }
        Ok(self.root.join(relative))
    }

    fn root_str(&self) -> String {
        self.root.to_string_lossy().trim_end_matches('/').to_string()
    }

    fn path_of(&self, pfn: &str) -> DmResult<PathBuf> {
        let (scheme, rest) = split_locator(pfn).ok_or_else(|| {
            DmError::storage(&self.name, format!("malformed locator {}", pfn))
        })?;
        if scheme != FILE_SCHEME {
            return Err(DmError::storage(
                &self.name,
                format!("unsupported scheme {} in {}", scheme, pfn),
            ));
        }
        let root = self.root_str();
        match rest.strip_prefix(root.as_str()) {
            Some(lfn) if lfn.starts_with('/') => self.local_path(lfn),
            _ => Err(DmError::storage(
                &self.name,
                format!("locator {} is outside {}", pfn, root),
            )),
        }
    }
}

async fn count_files(dir: &Path, recursive: bool) -> DmResult<u64> {
    let mut pending = vec![dir.to_path_buf()];
    let mut count = 0u64;
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if recursive {
                    pending.push(entry.path());
                }
            } else {
                count += 1;
            }
        }
    }
    Ok(count)
}

#[async_trait]
impl StorageElement for LocalStorageElement {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_valid(&self) -> DmResult<()> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(DmError::InvalidBackend {
                backend: self.name.clone(),
                msg: format!("{} is not a directory", self.root.display()),
            }),
            Err(e) => Err(DmError::InvalidBackend {
                backend: self.name.clone(),
                msg: format!("{}: {}", self.root.display(), e),
            }),
        }
    }

    fn pfn_for_lfn(&self, lfn: &str) -> DmResult<Pfn> {
        if lfn.is_empty() {
            return Err(DmError::InvalidInput {
                msg: "empty logical name".to_string(),
            });
        }
        self.local_path(lfn)?;
        Ok(format!(
            "{}://{}/{}",
            FILE_SCHEME,
            self.root_str(),
            lfn.trim_start_matches('/')
        ))
    }

    fn pfn_for_protocol(&self, pfn: &str, protocols: &[String], _with_port: bool) -> DmResult<Pfn> {
        self.path_of(pfn)?;
        if protocols.iter().any(|p| p == FILE_SCHEME) {
            Ok(pfn.to_string())
        } else {
            Err(DmError::storage(
                &self.name,
                format!("none of the protocols {:?} is supported", protocols),
            ))
        }
    }

    fn remote_protocols(&self) -> Vec<String> {
        vec![FILE_SCHEME.to_string()]
    }

    async fn put_file(&self, pfn: &str, source: &Path) -> DmResult<u64> {
        let target = self.path_of(pfn)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let size = tokio::fs::copy(source, &target).await?;
        debug!(backend = %self.name, pfn = %pfn, size, "stored file");
        Ok(size)
    }

    async fn get_file(&self, pfn: &str, destination: &Path) -> DmResult<u64> {
        let source = self.path_of(pfn)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::copy(&source, destination).await {
            Ok(size) => Ok(size),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DmError::NotFound {
                what: format!("{} at {}", pfn, self.name),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_remote(&self, url: &str) -> DmResult<Bytes> {
        let path = self.path_of(url)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DmError::NotFound {
                what: format!("{} at {}", url, self.name),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn replicate_from(
        &self,
        pfn: &str,
        source: &dyn StorageElement,
        source_url: &str,
        expected_size: u64,
    ) -> DmResult<u64> {
        let target = self.path_of(pfn)?;
        let data = source.read_remote(source_url).await?;
        let size = data.len() as u64;
        if size != expected_size {
            return Err(DmError::SizeMismatch {
                what: source_url.to_string(),
                expected: expected_size,
                actual: size,
            });
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &data).await?;
        debug!(backend = %self.name, source = %source.name(), pfn = %pfn, size, "third-party copy complete");
        Ok(size)
    }

    async fn remove_file(&self, pfns: &[Pfn]) -> DmResult<BatchResult<Pfn, Pfn>> {
        let mut result = BatchResult::new();
        for pfn in pfns {
            let path = match self.path_of(pfn) {
                Ok(path) => path,
                Err(e) => {
                    result.fail(pfn.clone(), e);
                    continue;
                }
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => result.succeed(pfn.clone(), pfn.clone()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    result.fail(pfn.clone(), ErrorReason::NoSuchFile)
                }
                Err(e) => {
                    warn!(backend = %self.name, pfn = %pfn, error = %e, "failed to remove file");
                    result.fail(pfn.clone(), e.to_string());
                }
            }
        }
        Ok(result)
    }

    async fn remove_directory(&self, path: &str, recursive: bool) -> DmResult<u64> {
        let dir = self.local_path(path)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(0);
        }
        let removed = count_files(&dir, recursive).await?;
        if recursive {
            tokio::fs::remove_dir_all(&dir).await?;
        } else {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    tokio::fs::remove_file(entry.path()).await?;
                }
            }
        }
        debug!(backend = %self.name, path = %path, removed, "removed directory");
        Ok(removed)
    }

    async fn exists(&self, path: &str) -> DmResult<bool> {
        Ok(tokio::fs::try_exists(self.local_path(path)?).await?)
    }

    async fn get_file_size(&self, pfns: &[Pfn]) -> DmResult<BatchResult<Pfn, u64>> {
        let mut result = BatchResult::new();
        for pfn in pfns {
            let path = match self.path_of(pfn) {
                Ok(path) => path,
                Err(e) => {
                    result.fail(pfn.clone(), e);
                    continue;
                }
            };
            match tokio::fs::metadata(&path).await {
                Ok(meta) => result.succeed(pfn.clone(), meta.len()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    result.fail(pfn.clone(), ErrorReason::NoSuchFile)
                }
                Err(e) => result.fail(pfn.clone(), e.to_string()),
            }
        }
        Ok(result)
    }
}
