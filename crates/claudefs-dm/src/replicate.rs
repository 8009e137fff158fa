//! Replication of registered files to new storage elements.
//!
//! Replication of one logical name runs through four steps: initialize
//! (permissions, destination, catalog truth, statuses), resolve usable
//! sources, transfer from the first source that works, and optionally
//! register the new replica.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::accounting::{FinalStatus, OperationKind, PhaseTimer};
use crate::batch::{BatchResult, ErrorReason, PendingRegistration};
use crate::error::{DmError, DmResult};
use crate::manager::DataManager;
use crate::status::{AccessMode, StatusCache};
use crate::storage::{common_third_party_protocol, StorageElement};
use crate::types::{base_name, join_path, BackendId, Lfn, Pfn, ReplicaSet, ReplicaTuple};

/// Request to copy a registered file to another storage element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateRequest {
    /// Logical name to replicate.
    pub lfn: Lfn,
    /// Destination storage element.
    pub dest_backend: BackendId,
    /// Restrict sources to this storage element.
    pub source_backend: Option<BackendId>,
    /// Store the copy as `<dest_path>/<basename(lfn)>` instead of at `lfn`.
    pub dest_path: Option<String>,
    /// Scratch directory for copies that go through the local disk.
    pub local_cache: Option<PathBuf>,
}

impl ReplicateRequest {
    /// Replicate `lfn` to `dest_backend` from any source.
    pub fn new(lfn: impl Into<Lfn>, dest_backend: impl Into<BackendId>) -> Self {
        Self {
            lfn: lfn.into(),
            dest_backend: dest_backend.into(),
            source_backend: None,
            dest_path: None,
            local_cache: None,
        }
    }

    /// Only use `backend` as source.
    pub fn from_source(mut self, backend: impl Into<BackendId>) -> Self {
        self.source_backend = Some(backend.into());
        self
    }

    /// Store the copy under `path`.
    pub fn with_dest_path(mut self, path: impl Into<String>) -> Self {
        self.dest_path = Some(path.into());
        self
    }

    /// Use `dir` as scratch area.
    pub fn with_local_cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_cache = Some(dir.into());
        self
    }
}

/// What a replication did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ReplicationOutcome {
    /// The destination already held a registered replica.
    AlreadyPresent,
    /// Bytes were copied.
    Replicated {
        /// Storage element the bytes came from.
        source: BackendId,
        /// Locator of the new copy.
        pfn: Pfn,
        /// Bytes copied.
        size: u64,
    },
}

/// Result of a successful replicate-and-register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationReport {
    /// Locator of the new replica; `None` when it already existed.
    pub pfn: Option<Pfn>,
    /// Time spent copying.
    pub replication_time: Duration,
    /// Time spent registering.
    pub register_time: Duration,
}

struct SourceCandidate {
    backend: BackendId,
    element: Arc<dyn StorageElement>,
    pfn: Pfn,
}

struct ReplicationPlan {
    lfn: Lfn,
    size: u64,
    destination: Arc<dyn StorageElement>,
    replicas: ReplicaSet,
}

impl DataManager {
    /// Copy a registered file to another storage element without
    /// registering the copy.
    pub async fn replicate(
        &self,
        request: ReplicateRequest,
    ) -> DmResult<BatchResult<Lfn, ReplicationOutcome>> {
        let mut result = BatchResult::new();
        let lfn = request.lfn.clone();
        match self.replicate_one(&request).await {
            Ok(outcome) => result.succeed(lfn, outcome),
            Err(e) if e.is_hard() => return Err(e),
            Err(e) => {
                warn!(lfn = %lfn, error = %e, "replication failed");
                result.fail(lfn, e);
            }
        }
        Ok(result)
    }

    /// Copy a registered file to another storage element and register the
    /// new replica.
    ///
    /// A copy whose registration fails is reported as
    /// [`ErrorReason::RegistrationFailed`].
    pub async fn replicate_and_register(
        &self,
        request: ReplicateRequest,
    ) -> DmResult<BatchResult<Lfn, ReplicationReport>> {
        let mut result = BatchResult::new();
        let lfn = request.lfn.clone();
        let dest = request.dest_backend.clone();
        let timer = PhaseTimer::start();

        let (source, pfn, size) = match self.replicate_one(&request).await {
            Ok(ReplicationOutcome::AlreadyPresent) => {
                result.succeed(
                    lfn,
                    ReplicationReport {
                        pfn: None,
                        replication_time: Duration::ZERO,
                        register_time: Duration::ZERO,
                    },
                );
                return Ok(result);
            }
            Ok(ReplicationOutcome::Replicated { source, pfn, size }) => (source, pfn, size),
            Err(e) if e.is_hard() => return Err(e),
            Err(e) => {
                warn!(lfn = %lfn, error = %e, "replication failed");
                if matches!(e, DmError::ReplicationExhausted { .. }) {
                    let mut record = self.start_record(OperationKind::ReplicateAndRegister);
                    record
                        .destination(dest.clone())
                        .transfer(1, 0, 0, timer.elapsed());
                    self.emit(record, FinalStatus::Failed);
                    self.flush_accounting();
                }
                result.fail(lfn, e);
                return Ok(result);
            }
        };
        let replication_time = timer.elapsed();

        let mut record = self.start_record(OperationKind::ReplicateAndRegister);
        record
            .source(source.clone())
            .destination(dest.clone())
            .transfer(1, 1, size, replication_time);

        let timer = PhaseTimer::start();
        let tuple = ReplicaTuple::new(lfn.clone(), pfn.clone(), dest.clone());
        let failure = match self.register_replica(std::slice::from_ref(&tuple)).await {
            Ok(res) => res.failed.get(&lfn).map(|r| r.to_string()),
            Err(e) => Some(e.to_string()),
        };
        let register_time = timer.elapsed();
        record.registration(1, u64::from(failure.is_none()), register_time);

        match failure {
            None => {
                self.emit(record, FinalStatus::Successful);
                info!(lfn = %lfn, source = %source, destination = %dest, size, "replicated and registered");
                result.succeed(
                    lfn,
                    ReplicationReport {
                        pfn: Some(pfn),
                        replication_time,
                        register_time,
                    },
                );
            }
            Some(reason) => {
                self.emit(record, FinalStatus::Failed);
                warn!(lfn = %lfn, destination = %dest, reason = %reason, "replica registration failed");
                result.fail(
                    lfn.clone(),
                    ErrorReason::RegistrationFailed(PendingRegistration {
                        lfn,
                        pfn,
                        backend: dest,
                        size: None,
                        guid: None,
                        checksum: None,
                        reason,
                    }),
                );
            }
        }
        self.flush_accounting();
        Ok(result)
    }

    async fn replicate_one(&self, request: &ReplicateRequest) -> DmResult<ReplicationOutcome> {
        let mut cache = StatusCache::new(self.status.as_ref());
        let plan = self.initialize_replication(request, &mut cache).await?;
        if plan.replicas.contains_key(&request.dest_backend) {
            info!(lfn = %plan.lfn, backend = %request.dest_backend, "already replicated");
            return Ok(ReplicationOutcome::AlreadyPresent);
        }
        let sources = self
            .resolve_sources(&plan, request.source_backend.as_deref(), &mut cache)
            .await?;
        self.transfer_from_sources(request, &plan, sources).await
    }

    async fn initialize_replication(
        &self,
        request: &ReplicateRequest,
        cache: &mut StatusCache<'_>,
    ) -> DmResult<ReplicationPlan> {
        let lfn = &request.lfn;
        self.verify_write_permission("replicateAndRegister", std::slice::from_ref(lfn))
            .await?;
        let destination = self.valid_element(&request.dest_backend).await?;

        let lfns = std::slice::from_ref(lfn);
        let mut replicas = self.catalog.get_replicas(lfns, true).await?;
        let replicas = match replicas.successful.remove(lfn) {
            Some(set) => set,
            None => {
                let reason = replicas
                    .failed
                    .remove(lfn)
                    .unwrap_or(ErrorReason::NoSuchFile);
                return Err(DmError::Message(format!(
                    "Failed to get replicas for {}: {}",
                    lfn, reason
                )));
            }
        };
        let mut sizes = self.catalog.get_file_size(lfns).await?;
        let size = match sizes.successful.remove(lfn) {
            Some(size) => size,
            None => {
                let reason = sizes.failed.remove(lfn).unwrap_or(ErrorReason::NoSuchFile);
                return Err(DmError::Message(format!(
                    "Failed to get size for {}: {}",
                    lfn, reason
                )));
            }
        };
        if size == 0 {
            return Err(DmError::InvalidInput {
                msg: format!("Registered file size is 0: {}", lfn),
            });
        }

        let status = cache.status(&request.dest_backend, AccessMode::Write).await?;
        if !status.is_usable() {
            return Err(DmError::BackendUnavailable {
                backend: request.dest_backend.clone(),
                mode: AccessMode::Write,
                status,
            });
        }

        if let Some(source) = &request.source_backend {
            if !replicas.contains_key(source) {
                return Err(DmError::InvalidInput {
                    msg: format!("Requested source {} does not hold a replica of {}", source, lfn),
                });
            }
            let status = cache.status(source, AccessMode::Read).await?;
            if !status.is_usable() {
                return Err(DmError::BackendUnavailable {
                    backend: source.clone(),
                    mode: AccessMode::Read,
                    status,
                });
            }
        }

        Ok(ReplicationPlan {
            lfn: lfn.clone(),
            size,
            destination,
            replicas,
        })
    }

    async fn resolve_sources(
        &self,
        plan: &ReplicationPlan,
        requested: Option<&str>,
        cache: &mut StatusCache<'_>,
    ) -> DmResult<Vec<SourceCandidate>> {
        let allowed = &self.config.third_party_protocols;
        let mut sources = Vec::new();
        for (backend, pfn) in &plan.replicas {
            if requested.is_some_and(|r| r != backend.as_str()) {
                continue;
            }
            if !cache.is_usable(backend, AccessMode::Read).await {
                debug!(lfn = %plan.lfn, backend = %backend, "source not active for reading");
                continue;
            }
            let element = match self.valid_element(backend).await {
                Ok(element) => element,
                Err(e) => {
                    warn!(lfn = %plan.lfn, backend = %backend, error = %e, "source not valid");
                    continue;
                }
            };
            let offered = element.remote_protocols();
            if !allowed.iter().any(|p| offered.contains(p)) {
                debug!(lfn = %plan.lfn, backend = %backend, "source offers no third-party protocol");
                continue;
            }
            let url = match element.pfn_for_protocol(pfn, allowed, true) {
                Ok(url) => url,
                Err(e) => {
                    warn!(lfn = %plan.lfn, backend = %backend, error = %e, "cannot resolve source locator");
                    continue;
                }
            };
            let physical = match element.get_file_size(std::slice::from_ref(&url)).await {
                Ok(mut sizes) => sizes.successful.remove(&url),
                Err(e) => {
                    warn!(lfn = %plan.lfn, backend = %backend, error = %e, "cannot stat source");
                    continue;
                }
            };
            match physical {
                Some(size) if size == plan.size => sources.push(SourceCandidate {
                    backend: backend.clone(),
                    element,
                    pfn: pfn.clone(),
                }),
                Some(size) => warn!(
                    lfn = %plan.lfn,
                    backend = %backend,
                    catalog_size = plan.size,
                    physical_size = size,
                    "source size disagrees with catalog"
                ),
                None => warn!(lfn = %plan.lfn, backend = %backend, "source replica missing"),
            }
        }
        if sources.is_empty() {
            return Err(DmError::NoValidSources {
                lfn: plan.lfn.clone(),
            });
        }

        let dest = plan.destination.name().to_string();
        let (mut ordered, rest): (Vec<_>, Vec<_>) = sources.into_iter().partition(|c| {
            self.sites
                .is_same_site(&c.backend, &dest)
                .unwrap_or(false)
        });
        ordered.extend(rest);
        Ok(ordered)
    }

    async fn transfer_from_sources(
        &self,
        request: &ReplicateRequest,
        plan: &ReplicationPlan,
        sources: Vec<SourceCandidate>,
    ) -> DmResult<ReplicationOutcome> {
        let target = match &request.dest_path {
            Some(path) => join_path(path, base_name(&plan.lfn)),
            None => plan.lfn.clone(),
        };
        let dest_pfn = plan.destination.pfn_for_lfn(&target)?;

        for source in sources {
            let attempt = match common_third_party_protocol(
                source.element.as_ref(),
                plan.destination.as_ref(),
                &self.config.third_party_protocols,
            ) {
                Some(protocol) => self.third_party_copy(plan, &source, &protocol, &dest_pfn).await,
                None => {
                    self.copy_through_local_disk(request, plan, &source, &dest_pfn)
                        .await
                }
            };
            match attempt {
                Ok(size) => {
                    info!(lfn = %plan.lfn, source = %source.backend, destination = %plan.destination.name(), size, "replica created");
                    return Ok(ReplicationOutcome::Replicated {
                        source: source.backend,
                        pfn: dest_pfn,
                        size,
                    });
                }
                Err(e) => {
                    warn!(lfn = %plan.lfn, source = %source.backend, error = %e, "replication attempt failed");
                }
            }
        }
        Err(DmError::ReplicationExhausted {
            lfn: plan.lfn.clone(),
        })
    }

    async fn third_party_copy(
        &self,
        plan: &ReplicationPlan,
        source: &SourceCandidate,
        protocol: &str,
        dest_pfn: &str,
    ) -> DmResult<u64> {
        let url = source
            .element
            .pfn_for_protocol(&source.pfn, &[protocol.to_string()], true)?;
        debug!(lfn = %plan.lfn, url = %url, protocol = %protocol, "third-party copy");
        plan.destination
            .replicate_from(dest_pfn, source.element.as_ref(), &url, plan.size)
            .await
    }

    async fn copy_through_local_disk(
        &self,
        request: &ReplicateRequest,
        plan: &ReplicationPlan,
        source: &SourceCandidate,
        dest_pfn: &str,
    ) -> DmResult<u64> {
        let root = request
            .local_cache
            .clone()
            .unwrap_or_else(|| self.config.cache_root());
        tokio::fs::create_dir_all(&root).await?;
        // removed on drop, whatever happens below
        let scratch = tempfile::Builder::new().prefix("cfs-dm-").tempdir_in(&root)?;
        let local = scratch.path().join(base_name(&plan.lfn));
        debug!(lfn = %plan.lfn, scratch = %local.display(), "copying through local disk");

        source.element.get_file(&source.pfn, &local).await?;
        let size = tokio::fs::metadata(&local).await?.len();
        if size != plan.size {
            return Err(DmError::SizeMismatch {
                what: local.display().to_string(),
                expected: plan.size,
                actual: size,
            });
        }
        plan.destination.put_file(dest_pfn, &local).await
    }
}
