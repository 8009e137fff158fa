//! Removal of files, replicas and catalog records.
//!
//! Every operation starts from the catalog's current replica sets. A physical
//! copy that is already gone counts as removed.

use std::collections::{BTreeMap, BTreeSet};

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::accounting::{FinalStatus, OperationKind, PhaseTimer};
use crate::batch::{BatchResult, ErrorReason};
use crate::error::DmResult;
use crate::manager::DataManager;
use crate::types::{BackendId, Lfn, Pfn, ReplicaRegistration, ReplicaSet, ReplicaTuple};

impl DataManager {
    /// Remove files from every storage element and then from the catalog.
    ///
    /// With `force` (defaulting to `ignore_missing_in_catalog`), names
    /// unknown to the catalog count as removed. A name keeps its catalog
    /// entry if any of its physical removals failed.
    pub async fn remove_file(&self, lfns: &[Lfn], force: Option<bool>) -> DmResult<BatchResult<Lfn, ()>> {
        let force = force.unwrap_or(self.config.ignore_missing_in_catalog);
        let mut result = BatchResult::new();
        if lfns.is_empty() {
            return Ok(result);
        }
        self.verify_write_permission("removeFile", lfns).await?;

        let replicas = self.catalog.get_replicas(lfns, true).await?;
        let mut candidates: BTreeSet<Lfn> = BTreeSet::new();
        for (lfn, reason) in replicas.failed {
            match reason {
                ErrorReason::ZeroReplicas => {
                    candidates.insert(lfn);
                }
                reason if reason.is_missing() && force => {
                    result.succeed(lfn, ());
                }
                reason => result.fail(lfn, reason),
            }
        }

        let mut by_backend: BTreeMap<BackendId, Vec<(Lfn, Pfn)>> = BTreeMap::new();
        for (lfn, set) in replicas.successful {
            for (backend, pfn) in set {
                by_backend.entry(backend).or_default().push((lfn.clone(), pfn));
            }
            candidates.insert(lfn);
        }

        let mut failures: BatchResult<Lfn, ()> = BatchResult::new();
        let outcomes: Vec<(BackendId, Vec<(Lfn, Pfn)>, DmResult<BatchResult<Pfn, ()>>)> =
            stream::iter(by_backend)
                .map(|(backend, items)| async move {
                    let pfns: Vec<Pfn> = items.iter().map(|(_, pfn)| pfn.clone()).collect();
                    let outcome = self.remove_physical_files(&backend, &pfns).await;
                    (backend, items, outcome)
                })
                .buffer_unordered(self.config.removal_concurrency.max(1))
                .collect()
                .await;
        for (backend, items, outcome) in outcomes {
            match outcome {
                Err(e) => {
                    warn!(backend = %backend, error = %e, "physical removal failed");
                    for (lfn, _) in items {
                        failures.append_failure(lfn, e.to_string());
                    }
                }
                Ok(removed) => {
                    for (lfn, pfn) in items {
                        if let Some(reason) = removed.failed.get(&pfn) {
                            failures.append_failure(lfn, format!("{}: {}", backend, reason));
                        }
                    }
                }
            }
        }

        let removable: Vec<Lfn> = candidates
            .into_iter()
            .filter(|lfn| !failures.is_failed(lfn))
            .collect();
        result.absorb(failures);
        if removable.is_empty() {
            self.flush_accounting();
            return Ok(result);
        }

        // bytes are already gone; report the catalog phase per item
        let removed = match self.catalog.remove_file(&removable).await {
            Ok(removed) => removed,
            Err(e) => {
                error!(files = removable.len(), error = %e, "catalog removal failed after physical removal");
                for lfn in removable {
                    result.fail(lfn, format!("Failed to remove file from the catalog: {}", e));
                }
                self.flush_accounting();
                return Ok(result);
            }
        };
        for lfn in removed.successful.into_keys() {
            result.succeed(lfn, ());
        }
        for (lfn, reason) in removed.failed {
            if reason.is_missing() && force {
                result.succeed(lfn, ());
            } else {
                result.fail(lfn, reason);
            }
        }
        info!(
            removed = result.successful.len(),
            failed = result.failed.len(),
            "removeFile complete"
        );
        self.flush_accounting();
        Ok(result)
    }

    /// Remove the replica at `backend` of each file, bytes first, then the
    /// catalog record. The last replica of a file is never removed.
    pub async fn remove_replica(&self, backend: &str, lfns: &[Lfn]) -> DmResult<BatchResult<Lfn, ()>> {
        let mut result = BatchResult::new();
        if lfns.is_empty() {
            return Ok(result);
        }
        self.verify_write_permission("removeReplica", lfns).await?;
        let replicas = self.catalog.get_replicas(lfns, true).await?;
        result.absorb(failed_only(&replicas));

        let mut targets: Vec<(Lfn, Pfn)> = Vec::new();
        for (lfn, set) in replicas.successful {
            match set.get(backend) {
                None => {
                    debug!(lfn = %lfn, backend = %backend, "no replica at storage element");
                    result.succeed(lfn, ());
                }
                Some(_) if set.len() == 1 => {
                    warn!(lfn = %lfn, backend = %backend, "refusing to remove sole replica");
                    result.fail(lfn, ErrorReason::SoleReplica);
                }
                Some(pfn) => targets.push((lfn.clone(), pfn.clone())),
            }
        }
        if targets.is_empty() {
            return Ok(result);
        }

        let physical = self.remove_physical_for(backend, &targets).await?;
        let mut tuples = Vec::new();
        for (lfn, pfn) in targets {
            match physical.failed.get(&lfn) {
                Some(reason) => result.fail(lfn, reason.clone()),
                None => tuples.push(ReplicaTuple::new(lfn, pfn, backend)),
            }
        }
        match self.remove_catalog_replicas(&tuples).await {
            Ok(removed) => result.absorb(removed),
            Err(e) => {
                error!(backend = %backend, error = %e, "catalog removal failed after physical removal");
                for tuple in tuples {
                    result.fail(
                        tuple.lfn,
                        format!("Failed to remove replica from the catalog: {}", e),
                    );
                }
            }
        }
        self.flush_accounting();
        Ok(result)
    }

    /// Remove the bytes at `backend` without touching the catalog.
    pub async fn remove_physical_replica(
        &self,
        backend: &str,
        lfns: &[Lfn],
    ) -> DmResult<BatchResult<Lfn, ()>> {
        let mut result = BatchResult::new();
        if lfns.is_empty() {
            return Ok(result);
        }
        self.verify_write_permission("removePhysicalReplica", lfns)
            .await?;
        let replicas = self.catalog.get_replicas(lfns, true).await?;
        result.absorb(failed_only(&replicas));

        let mut targets = Vec::new();
        for (lfn, set) in replicas.successful {
            match set.get(backend) {
                Some(pfn) => targets.push((lfn.clone(), pfn.clone())),
                None => result.fail(
                    lfn,
                    format!("File does not have replica at supplied Storage Element {}", backend),
                ),
            }
        }
        if !targets.is_empty() {
            result.absorb(self.remove_physical_for(backend, &targets).await?);
        }
        self.flush_accounting();
        Ok(result)
    }

    /// Remove the catalog records of replicas at `backend` without touching
    /// the bytes.
    pub async fn remove_replica_from_catalog(
        &self,
        backend: &str,
        lfns: &[Lfn],
    ) -> DmResult<BatchResult<Lfn, ()>> {
        let mut result = BatchResult::new();
        if lfns.is_empty() {
            return Ok(result);
        }
        self.verify_write_permission("removeReplicaFromCatalog", lfns)
            .await?;
        let replicas = self.catalog.get_replicas(lfns, true).await?;
        result.absorb(failed_only(&replicas));

        let mut tuples = Vec::new();
        for (lfn, set) in replicas.successful {
            match set.get(backend) {
                Some(pfn) => tuples.push(ReplicaTuple::new(lfn.clone(), pfn.clone(), backend)),
                None => {
                    debug!(lfn = %lfn, backend = %backend, "no replica record to remove");
                    result.succeed(lfn, ());
                }
            }
        }
        result.absorb(self.remove_catalog_replicas(&tuples).await?);
        self.flush_accounting();
        Ok(result)
    }

    /// Remove catalog replica records given as explicit tuples.
    pub async fn remove_catalog_physical_file_names(
        &self,
        replicas: &[ReplicaTuple],
    ) -> DmResult<BatchResult<Lfn, ()>> {
        if replicas.is_empty() {
            return Ok(BatchResult::new());
        }
        let lfns: Vec<Lfn> = replicas.iter().map(|t| t.lfn.clone()).collect();
        self.verify_write_permission("removeCatalogPhysicalFileNames", &lfns)
            .await?;
        let result = self.remove_catalog_replicas(replicas).await?;
        self.flush_accounting();
        Ok(result)
    }

    /// Physically remove `(lfn, pfn)` pairs at `backend`, keyed by lfn.
    async fn remove_physical_for(
        &self,
        backend: &str,
        targets: &[(Lfn, Pfn)],
    ) -> DmResult<BatchResult<Lfn, ()>> {
        let mut result = BatchResult::new();
        let pfns: Vec<Pfn> = targets.iter().map(|(_, pfn)| pfn.clone()).collect();
        match self.remove_physical_files(backend, &pfns).await {
            Ok(removed) => {
                for (lfn, pfn) in targets {
                    match removed.failed.get(pfn) {
                        Some(reason) => result.fail(lfn.clone(), reason.clone()),
                        None => result.succeed(lfn.clone(), ()),
                    }
                }
            }
            Err(e) if e.is_hard() => return Err(e),
            Err(e) => {
                for (lfn, _) in targets {
                    result.fail(lfn.clone(), e.to_string());
                }
            }
        }
        Ok(result)
    }

    /// Remove locators at one storage element. Missing files count as
    /// removed. Emits one accounting record per call.
    pub(crate) async fn remove_physical_files(
        &self,
        backend: &str,
        pfns: &[Pfn],
    ) -> DmResult<BatchResult<Pfn, ()>> {
        let mut result = BatchResult::new();
        if pfns.is_empty() {
            return Ok(result);
        }
        let mut record = self.start_record(OperationKind::RemovePhysicalReplica);
        record.destination(backend);
        let total = pfns.len() as u64;

        let element = match self.valid_element(backend).await {
            Ok(element) => element,
            Err(e) => {
                record.transfer(total, 0, 0, Default::default());
                self.emit(record, FinalStatus::Failed);
                return Err(e);
            }
        };
        let timer = PhaseTimer::start();
        let removed = match element.remove_file(pfns).await {
            Ok(removed) => removed,
            Err(e) => {
                record.transfer(total, 0, 0, timer.elapsed());
                self.emit(record, FinalStatus::Failed);
                return Err(e);
            }
        };
        for pfn in removed.successful.keys() {
            result.succeed(pfn.clone(), ());
        }
        for (pfn, reason) in removed.failed {
            if reason.is_missing() {
                debug!(backend = %backend, pfn = %pfn, "file already absent");
                result.succeed(pfn, ());
            } else {
                result.fail(pfn, reason);
            }
        }
        let ok = result.successful.len() as u64;
        record.transfer(total, ok, 0, timer.elapsed());
        let status = if result.failed.is_empty() {
            FinalStatus::Successful
        } else {
            FinalStatus::Failed
        };
        self.emit(record, status);
        Ok(result)
    }

    /// Remove replica records from the catalog. Records already gone count
    /// as removed. Emits one accounting record per non-empty call.
    pub(crate) async fn remove_catalog_replicas(
        &self,
        replicas: &[ReplicaTuple],
    ) -> DmResult<BatchResult<Lfn, ()>> {
        let mut result = BatchResult::new();
        if replicas.is_empty() {
            return Ok(result);
        }
        let request: BTreeMap<Lfn, ReplicaRegistration> = replicas
            .iter()
            .map(|t| {
                (
                    t.lfn.clone(),
                    ReplicaRegistration {
                        backend: t.backend.clone(),
                        pfn: t.pfn.clone(),
                    },
                )
            })
            .collect();
        let mut record = self.start_record(OperationKind::RemoveCatalogReplica);
        if let Some(first) = replicas.first() {
            record.destination(first.backend.clone());
        }
        let total = request.len() as u64;
        let timer = PhaseTimer::start();
        let removed = match self.catalog.remove_replica(&request).await {
            Ok(removed) => removed,
            Err(e) => {
                record.registration(total, 0, timer.elapsed());
                self.emit(record, FinalStatus::Failed);
                return Err(e);
            }
        };
        for lfn in removed.successful.into_keys() {
            result.succeed(lfn, ());
        }
        for (lfn, reason) in removed.failed {
            if reason.is_missing() {
                result.succeed(lfn, ());
            } else {
                result.fail(lfn, reason);
            }
        }
        record.registration(total, result.successful.len() as u64, timer.elapsed());
        let status = if result.failed.is_empty() {
            FinalStatus::Successful
        } else {
            FinalStatus::Failed
        };
        self.emit(record, status);
        Ok(result)
    }
}

fn failed_only(replicas: &BatchResult<Lfn, ReplicaSet>) -> BatchResult<Lfn, ()> {
    BatchResult {
        successful: BTreeMap::new(),
        failed: replicas.failed.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::OperationKind;
    use crate::catalog::CatalogOp;
    use crate::config::DmConfig;
    use crate::error::DmError;
    use crate::manager::testing::harness;
    use crate::memory_store::StorageOp;

    fn names(list: &[&str]) -> Vec<Lfn> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_remove_file_everywhere() {
        let h = harness(&["SE1", "SE2"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1", "SE2"]);
        h.seed("/vo/b", b"def", &["SE2"]);
        let res = h
            .manager
            .remove_file(&names(&["/vo/a", "/vo/b"]), None)
            .await
            .unwrap();
        assert!(res.partitions(&names(&["/vo/a", "/vo/b"])));
        assert_eq!(res.successful.len(), 2);
        assert!(!h.element("SE1").contains("/vo/a"));
        assert!(!h.element("SE2").contains("/vo/b"));
        assert!(!h.catalog.contains_file("/vo/a"));
        let physical: Vec<_> = h
            .accounting
            .records()
            .into_iter()
            .filter(|r| r.kind == OperationKind::RemovePhysicalReplica)
            .collect();
        assert_eq!(physical.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_file_missing_copy_is_success() {
        let h = harness(&["SE1"], DmConfig::default());
        h.catalog
            .insert_file("/vo/a", 3, None, &[("SE1", "mem://SE1/vo/a")]);
        let res = h.manager.remove_file(&names(&["/vo/a"]), None).await.unwrap();
        assert!(res.is_successful(&"/vo/a".to_string()));
        assert!(!h.catalog.contains_file("/vo/a"));
    }

    #[tokio::test]
    async fn test_remove_file_missing_in_catalog() {
        let h = harness(&["SE1"], DmConfig::default());
        let strict = h.manager.remove_file(&names(&["/vo/x"]), None).await.unwrap();
        assert_eq!(strict.failed["/vo/x"], ErrorReason::NoSuchFile);
        let forced = h
            .manager
            .remove_file(&names(&["/vo/x"]), Some(true))
            .await
            .unwrap();
        assert!(forced.is_successful(&"/vo/x".to_string()));
    }

    #[tokio::test]
    async fn test_remove_file_force_defaults_to_config() {
        let config = DmConfig {
            ignore_missing_in_catalog: true,
            ..DmConfig::default()
        };
        let h = harness(&["SE1"], config);
        let res = h.manager.remove_file(&names(&["/vo/x"]), None).await.unwrap();
        assert!(res.is_successful(&"/vo/x".to_string()));
    }

    #[tokio::test]
    async fn test_remove_file_zero_replicas_goes_to_catalog() {
        let h = harness(&["SE1"], DmConfig::default());
        h.catalog.insert_file("/vo/z", 3, None, &[]);
        let res = h.manager.remove_file(&names(&["/vo/z"]), None).await.unwrap();
        assert!(res.is_successful(&"/vo/z".to_string()));
        assert!(!h.catalog.contains_file("/vo/z"));
        assert_eq!(h.element("SE1").total_calls(), 0);
    }

    #[tokio::test]
    async fn test_remove_file_keeps_entry_on_backend_failure() {
        let h = harness(&["SE1", "SE2"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1", "SE2"]);
        h.seed("/vo/b", b"def", &["SE1"]);
        h.element("SE2").fail_path(StorageOp::Remove, "/vo/a", "permission denied on disk");
        let res = h
            .manager
            .remove_file(&names(&["/vo/a", "/vo/b"]), None)
            .await
            .unwrap();
        assert!(res.failed["/vo/a"].to_string().contains("permission denied on disk"));
        assert!(res.is_successful(&"/vo/b".to_string()));
        assert!(h.catalog.contains_file("/vo/a"));
        assert!(h.element("SE2").contains("/vo/a"));
        assert!(!h.element("SE1").contains("/vo/a"));
    }

    #[tokio::test]
    async fn test_remove_file_concatenates_backend_errors() {
        let h = harness(&["SE1", "SE2"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1", "SE2"]);
        h.element("SE1").fail_operation(StorageOp::Remove, "first down");
        h.element("SE2").fail_operation(StorageOp::Remove, "second down");
        let res = h.manager.remove_file(&names(&["/vo/a"]), None).await.unwrap();
        let text = res.failed["/vo/a"].to_string();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("first down"));
        assert!(text.contains("second down"));
    }

    #[tokio::test]
    async fn test_remove_file_serial_fan_out() {
        let config = DmConfig {
            removal_concurrency: 1,
            ..DmConfig::default()
        };
        let h = harness(&["SE1", "SE2", "SE3"], config);
        h.seed("/vo/a", b"abc", &["SE1", "SE2", "SE3"]);
        let res = h.manager.remove_file(&names(&["/vo/a"]), None).await.unwrap();
        assert!(res.is_successful(&"/vo/a".to_string()));
        for se in ["SE1", "SE2", "SE3"] {
            assert_eq!(h.element(se).call_count(StorageOp::Remove), 1);
        }
    }

    #[tokio::test]
    async fn test_remove_file_zero_concurrency_still_progresses() {
        let config = DmConfig {
            removal_concurrency: 0,
            ..DmConfig::default()
        };
        let h = harness(&["SE1", "SE2"], config);
        h.seed("/vo/a", b"abc", &["SE1", "SE2"]);
        let res = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            h.manager.remove_file(&names(&["/vo/a"]), None),
        )
        .await
        .expect("removal stalled")
        .unwrap();
        assert!(res.is_successful(&"/vo/a".to_string()));
        assert!(!h.catalog.contains_file("/vo/a"));
    }

    #[tokio::test]
    async fn test_remove_file_catalog_outage_after_physical_removal() {
        let h = harness(&["SE1"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1"]);
        h.seed("/vo/b", b"def", &["SE1"]);
        h.catalog.fail_operation(CatalogOp::RemoveFile, "catalog down");
        let res = h
            .manager
            .remove_file(&names(&["/vo/a", "/vo/b"]), None)
            .await
            .unwrap();
        assert!(res.partitions(&names(&["/vo/a", "/vo/b"])));
        for lfn in ["/vo/a", "/vo/b"] {
            let text = res.failed[lfn].to_string();
            assert!(text.contains("Failed to remove file from the catalog"));
            assert!(text.contains("catalog down"));
            assert!(!h.element("SE1").contains(lfn));
            assert!(h.catalog.contains_file(lfn));
        }
    }

    #[tokio::test]
    async fn test_remove_replica_catalog_outage_after_physical_removal() {
        let h = harness(&["SE1", "SE2"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1", "SE2"]);
        h.catalog.fail_operation(CatalogOp::RemoveReplica, "catalog down");
        let res = h
            .manager
            .remove_replica("SE1", &names(&["/vo/a"]))
            .await
            .unwrap();
        assert!(res.failed["/vo/a"]
            .to_string()
            .contains("Failed to remove replica from the catalog"));
        assert!(!h.element("SE1").contains("/vo/a"));
        assert!(h.catalog.replicas_of("/vo/a").unwrap().contains_key("SE1"));
    }

    #[tokio::test]
    async fn test_remove_file_denied() {
        let h = harness(&["SE1"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1"]);
        h.catalog.set_write_permission("/vo", false);
        assert!(matches!(
            h.manager.remove_file(&names(&["/vo/a"]), None).await,
            Err(DmError::PermissionDenied { .. })
        ));
        assert!(h.element("SE1").contains("/vo/a"));
    }

    #[tokio::test]
    async fn test_sole_replica_guard() {
        let h = harness(&["SE1"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1"]);
        let res = h
            .manager
            .remove_replica("SE1", &names(&["/vo/a"]))
            .await
            .unwrap();
        assert_eq!(res.failed["/vo/a"], ErrorReason::SoleReplica);
        assert!(h.element("SE1").contains("/vo/a"));
        assert_eq!(h.element("SE1").total_calls(), 0);
        assert!(h.catalog.replicas_of("/vo/a").unwrap().contains_key("SE1"));
    }

    #[tokio::test]
    async fn test_remove_replica_keeps_other_copies() {
        let h = harness(&["SE1", "SE2"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1", "SE2"]);
        let res = h
            .manager
            .remove_replica("SE1", &names(&["/vo/a"]))
            .await
            .unwrap();
        assert!(res.is_successful(&"/vo/a".to_string()));
        assert!(!h.element("SE1").contains("/vo/a"));
        assert!(h.element("SE2").contains("/vo/a"));
        let replicas = h.catalog.replicas_of("/vo/a").unwrap();
        assert!(!replicas.contains_key("SE1"));
        assert!(replicas.contains_key("SE2"));
    }

    #[tokio::test]
    async fn test_remove_replica_physical_failure_keeps_record() {
        let h = harness(&["SE1", "SE2"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1", "SE2"]);
        h.element("SE1").fail_path(StorageOp::Remove, "/vo/a", "busy");
        let res = h
            .manager
            .remove_replica("SE1", &names(&["/vo/a"]))
            .await
            .unwrap();
        assert!(res.is_failed(&"/vo/a".to_string()));
        assert!(h.catalog.replicas_of("/vo/a").unwrap().contains_key("SE1"));
    }

    #[tokio::test]
    async fn test_remove_physical_replica_leaves_catalog() {
        let h = harness(&["SE1", "SE2"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1"]);
        let res = h
            .manager
            .remove_physical_replica("SE1", &names(&["/vo/a"]))
            .await
            .unwrap();
        assert!(res.is_successful(&"/vo/a".to_string()));
        assert!(!h.element("SE1").contains("/vo/a"));
        assert!(h.catalog.replicas_of("/vo/a").unwrap().contains_key("SE1"));

        // idempotent
        let again = h
            .manager
            .remove_physical_replica("SE1", &names(&["/vo/a"]))
            .await
            .unwrap();
        assert!(again.is_successful(&"/vo/a".to_string()));

        let elsewhere = h
            .manager
            .remove_physical_replica("SE2", &names(&["/vo/a"]))
            .await
            .unwrap();
        assert!(elsewhere.is_failed(&"/vo/a".to_string()));
    }

    #[tokio::test]
    async fn test_remove_replica_from_catalog_leaves_bytes() {
        let h = harness(&["SE1", "SE2"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1", "SE2"]);
        let res = h
            .manager
            .remove_replica_from_catalog("SE1", &names(&["/vo/a"]))
            .await
            .unwrap();
        assert!(res.is_successful(&"/vo/a".to_string()));
        assert!(h.element("SE1").contains("/vo/a"));
        assert!(!h.catalog.replicas_of("/vo/a").unwrap().contains_key("SE1"));
        let records = h.accounting.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, OperationKind::RemoveCatalogReplica);
        assert!(h.accounting.flush_count() >= 1);
    }

    #[tokio::test]
    async fn test_remove_catalog_physical_file_names() {
        let h = harness(&["SE1", "SE2"], DmConfig::default());
        h.seed("/vo/a", b"abc", &["SE1", "SE2"]);
        h.seed("/vo/b", b"abc", &["SE1"]);
        h.catalog
            .fail_item(CatalogOp::RemoveReplica, "/vo/b", "record locked");
        let res = h
            .manager
            .remove_catalog_physical_file_names(&[
                ReplicaTuple::new("/vo/a", "mem://SE2/vo/a", "SE2"),
                ReplicaTuple::new("/vo/b", "mem://SE1/vo/b", "SE1"),
                ReplicaTuple::new("/vo/gone", "mem://SE1/vo/gone", "SE1"),
            ])
            .await
            .unwrap();
        assert!(res.is_successful(&"/vo/a".to_string()));
        assert!(res.is_successful(&"/vo/gone".to_string()));
        assert_eq!(res.failed["/vo/b"].to_string(), "record locked");
        assert_eq!(h.accounting.records()[0].status, FinalStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_requests_touch_nothing() {
        let h = harness(&["SE1"], DmConfig::default());
        assert!(h.manager.remove_file(&[], None).await.unwrap().is_empty());
        assert!(h
            .manager
            .remove_catalog_physical_file_names(&[])
            .await
            .unwrap()
            .is_empty());
        assert_eq!(h.catalog.call_count(CatalogOp::GetPathPermissions), 0);
        assert!(h.accounting.records().is_empty());
    }
}
