//! The replica orchestrator.
//!
//! [`DataManager`] composes the catalog, the storage elements, the status
//! oracle, the site directory and the accounting sink. It keeps no mutable
//! state between calls, so one instance can serve concurrent callers. The
//! operations themselves live in `transfer`, `replicate`, `removal` and
//! `directory`; this module holds the shared guards and helpers.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::accounting::{AccountingSink, FinalStatus, OperationKind, OperationRecordBuilder};
use crate::batch::BatchResult;
use crate::catalog::FileCatalog;
use crate::config::DmConfig;
use crate::error::{DmError, DmResult};
use crate::proximity::rank_sources;
use crate::status::{AccessMode, StatusCache, StatusOracle};
use crate::storage::{StorageElement, StorageFactory};
use crate::topology::{country_of, SiteDirectory};
use crate::types::{BackendId, Lfn, ReplicaSet};

/// External collaborators injected into a [`DataManager`].
#[derive(Clone)]
pub struct DataManagerContext {
    /// File catalog.
    pub catalog: Arc<dyn FileCatalog>,
    /// Storage element factory.
    pub storage: Arc<dyn StorageFactory>,
    /// Backend status oracle.
    pub status: Arc<dyn StatusOracle>,
    /// Site directory.
    pub sites: Arc<dyn SiteDirectory>,
    /// Accounting sink.
    pub accounting: Arc<dyn AccountingSink>,
}

/// Orchestrates every operation that must touch both the catalog and the
/// storage elements.
pub struct DataManager {
    pub(crate) config: DmConfig,
    pub(crate) catalog: Arc<dyn FileCatalog>,
    pub(crate) storage: Arc<dyn StorageFactory>,
    pub(crate) status: Arc<dyn StatusOracle>,
    pub(crate) sites: Arc<dyn SiteDirectory>,
    pub(crate) accounting: Arc<dyn AccountingSink>,
}

impl DataManager {
    /// Create a data manager.
    pub fn new(config: DmConfig, ctx: DataManagerContext) -> Self {
        Self {
            config,
            catalog: ctx.catalog,
            storage: ctx.storage,
            status: ctx.status,
            sites: ctx.sites,
            accounting: ctx.accounting,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &DmConfig {
        &self.config
    }

    /// Returns true only if the catalog grants write permission on every
    /// path. Catalog failures, including a path missing from the answer,
    /// are errors.
    pub async fn is_write_permitted(&self, paths: &[String]) -> DmResult<bool> {
        let perms = self.catalog.get_path_permissions(paths).await?;
        if let Some((path, reason)) = perms.failed.iter().next() {
            return Err(DmError::catalog(format!(
                "failed to get permissions for {}: {}",
                path, reason
            )));
        }
        for path in paths {
            match perms.successful.get(path) {
                Some(p) if p.write => {}
                Some(_) => return Ok(false),
                None => {
                    return Err(DmError::catalog(format!(
                        "no permission information for {}",
                        path
                    )))
                }
            }
        }
        Ok(true)
    }

    /// Fail with [`DmError::PermissionDenied`] unless every path is writable.
    pub(crate) async fn verify_write_permission(
        &self,
        operation: &'static str,
        paths: &[String],
    ) -> DmResult<()> {
        if self.is_write_permitted(paths).await? {
            Ok(())
        } else {
            Err(DmError::PermissionDenied {
                operation,
                path: paths.join(", "),
            })
        }
    }

    /// Resolve a storage element and check it is currently valid.
    pub(crate) async fn valid_element(&self, backend: &str) -> DmResult<Arc<dyn StorageElement>> {
        let element = self.storage.storage_element(backend)?;
        element.is_valid().await?;
        Ok(element)
    }

    /// Order candidate storage elements by proximity to the local site.
    pub fn rank_by_proximity(&self, candidates: &[BackendId]) -> Vec<BackendId> {
        let site = self.config.local_site.as_str();
        let local = self.sites.backends_for_site(site).unwrap_or_else(|e| {
            debug!(site = %site, error = %e, "no local storage elements");
            Vec::new()
        });
        let country = self
            .sites
            .backends_for_country(country_of(site))
            .unwrap_or_else(|e| {
                debug!(site = %site, error = %e, "no storage elements in country");
                Vec::new()
            });
        rank_sources(candidates, &local, &country, &mut rand::thread_rng())
    }

    /// Replicas of each logical name, restricted to storage elements that
    /// are currently usable for reading.
    pub async fn get_active_replicas(&self, lfns: &[Lfn]) -> DmResult<BatchResult<Lfn, ReplicaSet>> {
        let replicas = self.catalog.get_replicas(lfns, false).await?;
        Ok(self.check_active_replicas(replicas).await)
    }

    /// Drop replicas at storage elements not Active/Degraded for reading.
    ///
    /// Each storage element's status is resolved once. Names are never
    /// dropped from the result, only their replicas, so an entry may end up
    /// with an empty set.
    pub async fn check_active_replicas(
        &self,
        mut replicas: BatchResult<Lfn, ReplicaSet>,
    ) -> BatchResult<Lfn, ReplicaSet> {
        let mut cache = StatusCache::new(self.status.as_ref());
        let mut backends: Vec<BackendId> = replicas
            .successful
            .values()
            .flat_map(|set| set.keys().cloned())
            .collect();
        backends.sort();
        backends.dedup();

        let mut inactive = Vec::new();
        for backend in backends {
            if !cache.is_usable(&backend, AccessMode::Read).await {
                inactive.push(backend);
            }
        }
        if !inactive.is_empty() {
            debug!(backends = ?inactive, "filtering inactive replicas");
            for set in replicas.successful.values_mut() {
                set.retain(|backend, _| !inactive.contains(backend));
            }
        }
        replicas
    }

    pub(crate) fn start_record(&self, kind: OperationKind) -> OperationRecordBuilder {
        OperationRecordBuilder::new(kind, &self.config.actor)
    }

    pub(crate) fn emit(&self, builder: OperationRecordBuilder, status: FinalStatus) {
        let record = builder.finish(status);
        debug!(kind = ?record.kind, status = ?record.status, "accounting record submitted");
        self.accounting.submit(record);
    }

    pub(crate) fn flush_accounting(&self) {
        self.accounting.flush();
    }

    pub(crate) fn log_failures<K: std::fmt::Display, V>(&self, operation: &str, result: &BatchResult<K, V>) {
        for (key, reason) in &result.failed {
            warn!(operation = %operation, item = %key, reason = %reason, "item failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use super::*;
    use crate::accounting::MemoryAccountingSink;
    use crate::catalog::MemoryCatalog;
    use crate::memory_store::MemoryStorageElement;
    use crate::status::{BackendStatus, StaticStatusOracle};
    use crate::storage::StorageRegistry;
    use crate::topology::StaticSiteDirectory;

    pub(crate) struct Harness {
        pub catalog: Arc<MemoryCatalog>,
        pub storage: Arc<StorageRegistry>,
        pub status: Arc<StaticStatusOracle>,
        pub accounting: Arc<MemoryAccountingSink>,
        pub elements: BTreeMap<String, Arc<MemoryStorageElement>>,
        pub manager: DataManager,
    }

    impl Harness {
        pub(crate) fn element(&self, name: &str) -> Arc<MemoryStorageElement> {
            self.elements[name].clone()
        }

        /// Put `data` on every listed element and register it in the catalog.
        pub(crate) fn seed(&self, lfn: &str, data: &[u8], at: &[&str]) -> String {
            let pfns: Vec<(String, String)> = at
                .iter()
                .map(|name| (name.to_string(), self.elements[*name].insert(lfn, data.to_vec())))
                .collect();
            let refs: Vec<(&str, &str)> = pfns.iter().map(|(b, p)| (b.as_str(), p.as_str())).collect();
            let checksum = crate::checksum::checksum_bytes(data);
            self.catalog
                .insert_file(lfn, data.len() as u64, Some(&checksum), &refs)
        }
    }

    /// Memory-backed manager with active elements `names`; the local site
    /// `LCG.HOME.ch` holds the first one.
    pub(crate) fn harness(names: &[&str], config: DmConfig) -> Harness {
        let catalog = Arc::new(MemoryCatalog::new());
        let storage = Arc::new(StorageRegistry::new());
        let status = Arc::new(StaticStatusOracle::new());
        let accounting = Arc::new(MemoryAccountingSink::new());
        let mut elements = BTreeMap::new();
        for name in names {
            let element = Arc::new(MemoryStorageElement::new(name));
            storage.register(element.clone());
            status.set_all(name, BackendStatus::Active);
            elements.insert(name.to_string(), element);
        }
        let mut sites = StaticSiteDirectory::default();
        if let Some(first) = names.first() {
            sites.upsert_site("LCG.HOME.ch", vec![first.to_string()]);
        }
        let config = DmConfig {
            local_site: "LCG.HOME.ch".to_string(),
            ..config
        };
        let manager = DataManager::new(
            config,
            DataManagerContext {
                catalog: catalog.clone(),
                storage: storage.clone(),
                status: status.clone(),
                sites: Arc::new(sites),
                accounting: accounting.clone(),
            },
        );
        Harness {
            catalog,
            storage,
            status,
            accounting,
            elements,
            manager,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::harness;
    use super::*;
    use crate::catalog::CatalogOp;
    use crate::status::BackendStatus;

    #[tokio::test]
    async fn test_write_permission_guard() {
        let h = harness(&["SE1"], DmConfig::default());
        h.catalog.set_write_permission("/vo/prod", false);
        assert!(h
            .manager
            .is_write_permitted(&["/vo/user/a".to_string()])
            .await
            .unwrap());
        assert!(!h
            .manager
            .is_write_permitted(&["/vo/user/a".to_string(), "/vo/prod/b".to_string()])
            .await
            .unwrap());
        let err = h
            .manager
            .verify_write_permission("removeFile", &["/vo/prod/b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, DmError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_permission_lookup_failure_is_hard() {
        let h = harness(&["SE1"], DmConfig::default());
        h.catalog
            .fail_item(CatalogOp::GetPathPermissions, "/vo/a", "no such path");
        let err = h
            .manager
            .is_write_permitted(&["/vo/a".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_hard());
    }

    #[tokio::test]
    async fn test_active_replicas_strip_banned_backends() {
        let h = harness(&["SE1", "SE2", "SE3"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1", "SE2"]);
        h.seed("/vo/b", b"def", &["SE2"]);
        h.status.set_status("SE2", AccessMode::Read, BackendStatus::Banned);

        let res = h
            .manager
            .get_active_replicas(&["/vo/a".to_string(), "/vo/b".to_string(), "/vo/c".to_string()])
            .await
            .unwrap();
        assert_eq!(res.successful["/vo/a"].keys().collect::<Vec<_>>(), vec!["SE1"]);
        assert!(res.successful["/vo/b"].is_empty());
        assert!(res.is_failed(&"/vo/c".to_string()));
        // SE1 and SE2 queried once each
        assert_eq!(h.status.query_count(), 2);
    }

    #[tokio::test]
    async fn test_active_replicas_fail_closed() {
        let h = harness(&["SE1", "SE2"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1", "SE2"]);
        h.status.fail_backend("SE1", "monitoring down");
        let res = h.manager.get_active_replicas(&["/vo/a".to_string()]).await.unwrap();
        assert_eq!(res.successful["/vo/a"].keys().collect::<Vec<_>>(), vec!["SE2"]);
    }

    #[tokio::test]
    async fn test_degraded_counts_as_active() {
        let h = harness(&["SE1"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1"]);
        h.status.set_status("SE1", AccessMode::Read, BackendStatus::Degraded);
        let res = h.manager.get_active_replicas(&["/vo/a".to_string()]).await.unwrap();
        assert_eq!(res.successful["/vo/a"].len(), 1);
    }

    #[test]
    fn test_rank_by_proximity_puts_local_first() {
        let h = harness(&["HOME", "FAR1", "FAR2"], DmConfig::default());
        let candidates = vec!["FAR1".to_string(), "HOME".to_string(), "FAR2".to_string()];
        for _ in 0..10 {
            let ranked = h.manager.rank_by_proximity(&candidates);
            assert_eq!(ranked[0], "HOME");
            assert_eq!(ranked.len(), 3);
        }
    }

    #[tokio::test]
    async fn test_valid_element_rejects_unknown_and_disabled() {
        let h = harness(&["SE1"], DmConfig::default());
        assert!(matches!(
            h.manager.valid_element("NOPE").await,
            Err(DmError::InvalidBackend { .. })
        ));
        h.element("SE1").set_valid(false);
        assert!(h.manager.valid_element("SE1").await.is_err());
    }
}
