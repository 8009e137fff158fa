//! Storage element interface and factory.
//!
//! A storage element is one independently addressable storage endpoint. The
//! orchestrator only talks to the [`StorageElement`] trait; each backend family
//! provides its own implementation (see `local_store` and `memory_store`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::batch::BatchResult;
use crate::error::{DmError, DmResult};
use crate::types::Pfn;

/// Byte-level operations on one storage element.
#[async_trait]
pub trait StorageElement: Send + Sync {
    /// Canonical name of this storage element.
    fn name(&self) -> &str;

    /// Check that the element is reachable and sanely configured.
    async fn is_valid(&self) -> DmResult<()>;

    /// Locator this element would use for a logical name.
    fn pfn_for_lfn(&self, lfn: &str) -> DmResult<Pfn>;

    /// Rewrite a locator for the first of `protocols` this element supports.
    fn pfn_for_protocol(&self, pfn: &str, protocols: &[String], with_port: bool) -> DmResult<Pfn>;

    /// Protocols this element serves to remote peers (third-party transfers).
    fn remote_protocols(&self) -> Vec<String>;

    /// Upload a local file to `pfn`; returns bytes written.
    async fn put_file(&self, pfn: &str, source: &Path) -> DmResult<u64>;

    /// Download `pfn` to the local file `destination`; returns bytes read.
    async fn get_file(&self, pfn: &str, destination: &Path) -> DmResult<u64>;

    /// Serve the bytes behind a remote-protocol locator to a peer element.
    async fn read_remote(&self, url: &str) -> DmResult<Bytes>;

    /// Third-party copy: pull `source_url` from `source` into `pfn`.
    async fn replicate_from(
        &self,
        pfn: &str,
        source: &dyn StorageElement,
        source_url: &str,
        expected_size: u64,
    ) -> DmResult<u64>;

    /// Remove physical files. A missing file is reported as
    /// `ErrorReason::NoSuchFile` in the failed map. Successful entries map
    /// each locator to its canonical form.
    async fn remove_file(&self, pfns: &[Pfn]) -> DmResult<BatchResult<Pfn, Pfn>>;

    /// Remove a directory (given as a logical path); returns files removed.
    async fn remove_directory(&self, path: &str, recursive: bool) -> DmResult<u64>;

    /// Whether a logical path exists at this element.
    async fn exists(&self, path: &str) -> DmResult<bool>;

    /// Physical sizes of files.
    async fn get_file_size(&self, pfns: &[Pfn]) -> DmResult<BatchResult<Pfn, u64>>;
}

/// Resolves storage element names to handles.
pub trait StorageFactory: Send + Sync {
    /// Look up a storage element by (possibly aliased) name.
    fn storage_element(&self, name: &str) -> DmResult<Arc<dyn StorageElement>>;
}

/// First protocol in `allowed` that both elements serve remotely, if any.
pub fn common_third_party_protocol(
    source: &dyn StorageElement,
    destination: &dyn StorageElement,
    allowed: &[String],
) -> Option<String> {
    let src = source.remote_protocols();
    let dst = destination.remote_protocols();
    allowed
        .iter()
        .find(|p| src.contains(*p) && dst.contains(*p))
        .cloned()
}

/// Split a locator into its scheme and the part after `://`.
pub fn split_locator(pfn: &str) -> Option<(&str, &str)> {
    pfn.split_once("://")
}

/// Name → element table implementing [`StorageFactory`].
#[derive(Default)]
pub struct StorageRegistry {
    elements: RwLock<HashMap<String, Arc<dyn StorageElement>>>,
}

impl StorageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an element under its canonical name.
    pub fn register(&self, element: Arc<dyn StorageElement>) {
        let name = element.name().to_string();
        self.elements.write().insert(name, element);
    }

    /// Register an element under an additional alias.
    pub fn register_alias(&self, alias: &str, element: Arc<dyn StorageElement>) {
        self.elements.write().insert(alias.to_string(), element);
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.elements.read().len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.elements.read().is_empty()
    }
}

impl StorageFactory for StorageRegistry {
    fn storage_element(&self, name: &str) -> DmResult<Arc<dyn StorageElement>> {
        self.elements
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DmError::InvalidBackend {
                backend: name.to_string(),
                msg: "unknown storage element".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStorageElement;

    #[test]
    fn test_registry_lookup_and_alias() {
        let registry = StorageRegistry::new();
        let se: Arc<dyn StorageElement> = Arc::new(MemoryStorageElement::new("CERN-DST"));
        registry.register(se.clone());
        registry.register_alias("CERN-DEFAULT", se);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.storage_element("CERN-DST").unwrap().name(), "CERN-DST");
        assert_eq!(
            registry.storage_element("CERN-DEFAULT").unwrap().name(),
            "CERN-DST"
        );
        assert!(matches!(
            registry.storage_element("RAL-DST"),
            Err(DmError::InvalidBackend { .. })
        ));
    }

    #[test]
    fn test_common_protocol_follows_preference() {
        let a = MemoryStorageElement::new("A").with_protocols(&["dip", "srm"]);
        let b = MemoryStorageElement::new("B").with_protocols(&["srm", "dip"]);
        let allowed = vec!["srm".to_string(), "dip".to_string()];
        assert_eq!(
            common_third_party_protocol(&a, &b, &allowed),
            Some("srm".to_string())
        );
    }

    #[test]
    fn test_no_common_protocol() {
        let a = MemoryStorageElement::new("A").with_protocols(&["dip"]);
        let b = MemoryStorageElement::new("B").with_protocols(&["srm"]);
        let allowed = vec!["srm".to_string(), "dip".to_string()];
        assert_eq!(common_third_party_protocol(&a, &b, &allowed), None);
    }

    #[test]
    fn test_common_protocol_must_be_allowed() {
        let a = MemoryStorageElement::new("A").with_protocols(&["gsiftp"]);
        let b = MemoryStorageElement::new("B").with_protocols(&["gsiftp"]);
        assert_eq!(
            common_third_party_protocol(&a, &b, &["srm".to_string()]),
            None
        );
    }

    #[test]
    fn test_split_locator() {
        assert_eq!(split_locator("srm://SE/a/b"), Some(("srm", "SE/a/b")));
        assert_eq!(split_locator("/a/b"), None);
    }
}
