//! Downloads, uploads and registration.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::accounting::{FinalStatus, OperationKind, PhaseTimer};
use crate::batch::{BatchResult, ErrorReason, PendingRegistration};
use crate::checksum::{checksums_match, file_checksum};
use crate::error::{DmError, DmResult};
use crate::manager::DataManager;
use crate::types::{
    base_name, parent_dir, BackendId, FileMetadata, FileRegistration, FileTuple, Lfn, Pfn,
    ReplicaRegistration, ReplicaTuple,
};

/// Upload of one local file to a storage element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    /// Logical name to register.
    pub lfn: Lfn,
    /// Local file to upload.
    pub local_file: PathBuf,
    /// Destination storage element.
    pub backend: BackendId,
    /// GUID to register; generated when absent.
    pub guid: Option<String>,
    /// Checksum to register; computed when absent.
    pub checksum: Option<String>,
}

impl PutRequest {
    /// Upload `local_file` as `lfn` to `backend`.
    pub fn new(lfn: impl Into<Lfn>, local_file: impl Into<PathBuf>, backend: impl Into<BackendId>) -> Self {
        Self {
            lfn: lfn.into(),
            local_file: local_file.into(),
            backend: backend.into(),
            guid: None,
            checksum: None,
        }
    }

    /// Use a caller-supplied GUID.
    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = Some(guid.into());
        self
    }

    /// Use a caller-supplied checksum.
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// Result of a successful upload-and-register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PutOutcome {
    /// Locator of the uploaded bytes.
    pub pfn: Pfn,
    /// Bytes uploaded.
    pub size: u64,
    /// Time spent uploading.
    pub put_time: Duration,
    /// Time spent registering.
    pub register_time: Duration,
}

async fn local_file_size(path: &Path) -> DmResult<u64> {
    let meta = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DmError::NotFound {
            what: format!("local file {}", path.display()),
        },
        _ => DmError::Io(e),
    })?;
    if !meta.is_file() {
        return Err(DmError::InvalidInput {
            msg: format!("{} is not a file", path.display()),
        });
    }
    if meta.len() == 0 {
        return Err(DmError::InvalidInput {
            msg: format!("Supplied file is zero size: {}", path.display()),
        });
    }
    Ok(meta.len())
}

async fn verify_download(path: &Path, metadata: &FileMetadata) -> DmResult<()> {
    let size = tokio::fs::metadata(path).await?.len();
    if size != metadata.size {
        return Err(DmError::SizeMismatch {
            what: path.display().to_string(),
            expected: metadata.size,
            actual: size,
        });
    }
    if let Some(expected) = &metadata.checksum {
        let actual = file_checksum(path).await?;
        if !checksums_match(expected, &actual) {
            return Err(DmError::ChecksumMismatch {
                what: path.display().to_string(),
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(())
}

/// Step of a download attempt that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchStage {
    /// Nothing was written.
    Resolve,
    /// The copy itself failed; the destination may hold partial bytes.
    Transfer,
    /// The copy completed but does not match the catalog.
    Verify,
}

struct FetchFailure {
    error: DmError,
    stage: FetchStage,
}

impl FetchFailure {
    fn at(stage: FetchStage) -> impl FnOnce(DmError) -> Self {
        move |error| Self { error, stage }
    }

    /// Whether the destination holds bytes this attempt wrote.
    fn wrote_destination(&self, existed_before: bool) -> bool {
        match self.stage {
            FetchStage::Resolve => false,
            FetchStage::Transfer => !existed_before,
            FetchStage::Verify => true,
        }
    }
}

impl DataManager {
    /// Download files into `destination_dir`, trying active replicas in
    /// proximity order and verifying size and checksum of each copy.
    pub async fn get_file(
        &self,
        lfns: &[Lfn],
        destination_dir: &Path,
    ) -> DmResult<BatchResult<Lfn, PathBuf>> {
        let mut result = BatchResult::new();
        let replicas = self.get_active_replicas(lfns).await?;
        for (lfn, reason) in &replicas.failed {
            result.fail(lfn.clone(), reason.clone());
        }
        let found: Vec<Lfn> = replicas.successful.keys().cloned().collect();
        if found.is_empty() {
            return Ok(result);
        }
        let metadata = self.catalog.get_file_metadata(&found).await?;
        for (lfn, reason) in &metadata.failed {
            result.fail(lfn.clone(), reason.clone());
        }

        let mut claimed: HashSet<PathBuf> = HashSet::new();
        for (lfn, set) in &replicas.successful {
            let Some(meta) = metadata.successful.get(lfn) else {
                continue;
            };
            if set.is_empty() {
                result.fail(lfn.clone(), "No active replicas found");
                continue;
            }
            let destination = destination_dir.join(base_name(lfn));
            if !claimed.insert(destination.clone()) {
                result.fail(
                    lfn.clone(),
                    format!(
                        "Another file in the request is also retrieved to {}",
                        destination.display()
                    ),
                );
                continue;
            }
            let candidates: Vec<BackendId> = set.keys().cloned().collect();
            let mut fetched = false;
            for backend in self.rank_by_proximity(&candidates) {
                let pfn = &set[&backend];
                let existed_before = tokio::fs::try_exists(&destination).await.unwrap_or(true);
                match self.fetch_verified(&backend, pfn, &destination, meta).await {
                    Ok(()) => {
                        info!(lfn = %lfn, backend = %backend, "file retrieved");
                        fetched = true;
                        break;
                    }
                    Err(failure) => {
                        warn!(lfn = %lfn, backend = %backend, error = %failure.error, "failed to get replica");
                        if failure.wrote_destination(existed_before)
                            && tokio::fs::try_exists(&destination).await.unwrap_or(false)
                        {
                            if let Err(e) = tokio::fs::remove_file(&destination).await {
                                warn!(path = %destination.display(), error = %e, "failed to remove bad download");
                            }
                        }
                    }
                }
            }
            if fetched {
                result.succeed(lfn.clone(), destination);
            } else {
                result.fail(lfn.clone(), "Failed to get local copy from any replicas");
            }
        }
        Ok(result)
    }

    async fn fetch_verified(
        &self,
        backend: &str,
        pfn: &str,
        destination: &Path,
        metadata: &FileMetadata,
    ) -> Result<(), FetchFailure> {
        let element = self
            .valid_element(backend)
            .await
            .map_err(FetchFailure::at(FetchStage::Resolve))?;
        element
            .get_file(pfn, destination)
            .await
            .map_err(FetchFailure::at(FetchStage::Transfer))?;
        verify_download(destination, metadata)
            .await
            .map_err(FetchFailure::at(FetchStage::Verify))
    }

    /// Upload a local file without registering it.
    pub async fn put(
        &self,
        lfn: &str,
        local_file: &Path,
        backend: &str,
    ) -> DmResult<BatchResult<Lfn, Pfn>> {
        let mut result = BatchResult::new();
        let lfn = lfn.to_string();
        let upload = async {
            local_file_size(local_file).await?;
            let element = self.valid_element(backend).await?;
            let pfn = element.pfn_for_lfn(&lfn)?;
            element.put_file(&pfn, local_file).await?;
            Ok::<Pfn, DmError>(pfn)
        };
        match upload.await {
            Ok(pfn) => result.succeed(lfn, pfn),
            Err(e) => {
                warn!(lfn = %lfn, backend = %backend, error = %e, "put failed");
                result.fail(lfn, e);
            }
        }
        Ok(result)
    }

    /// Upload a local file and register it with its first replica.
    ///
    /// Permission and catalog request failures are returned as errors; every
    /// other failure lands in the `failed` map. Bytes that were uploaded but
    /// not registered are reported as [`ErrorReason::RegistrationFailed`].
    pub async fn put_and_register(&self, request: PutRequest) -> DmResult<BatchResult<Lfn, PutOutcome>> {
        let mut result = BatchResult::new();
        let lfn = request.lfn.clone();
        match self.put_and_register_inner(request).await {
            Ok(outcome) => result.succeed(lfn, outcome),
            Err(PutFailure::Hard(e)) => return Err(e),
            Err(PutFailure::Item(reason)) => {
                warn!(lfn = %lfn, reason = %reason, "putAndRegister failed");
                result.fail(lfn, reason);
            }
        }
        Ok(result)
    }

    async fn put_and_register_inner(&self, request: PutRequest) -> Result<PutOutcome, PutFailure> {
        let PutRequest {
            lfn,
            local_file,
            backend,
            guid,
            checksum,
        } = request;
        self.verify_write_permission("putAndRegister", &[parent_dir(&lfn)])
            .await?;

        let size = local_file_size(&local_file).await?;
        let checksum = match checksum {
            Some(c) => c,
            None => file_checksum(&local_file).await?,
        };
        let guid = guid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string().to_uppercase());

        let mut query = BTreeMap::new();
        query.insert(lfn.clone(), Some(guid.clone()));
        let exists = self.catalog.exists(&query).await?;
        if let Some(reason) = exists.failed.get(&lfn) {
            return Err(PutFailure::Item(reason.clone()));
        }
        match exists.successful.get(&lfn).cloned().flatten() {
            Some(existing) if existing == lfn => {
                return Err(DmError::AlreadyExists { lfn }.into());
            }
            Some(existing) => {
                return Err(DmError::GuidCollision { guid, existing }.into());
            }
            None => {}
        }

        let mut record = self.start_record(OperationKind::PutAndRegister);
        record.source("LocalDisk").destination(backend.clone());
        let element = match self.valid_element(&backend).await {
            Ok(element) => element,
            Err(e) => {
                record.transfer(1, 0, 0, Duration::ZERO);
                self.emit(record, FinalStatus::Failed);
                self.flush_accounting();
                return Err(e.into());
            }
        };

        let timer = PhaseTimer::start();
        let upload = async {
            let pfn = element.pfn_for_lfn(&lfn)?;
            let written = element.put_file(&pfn, &local_file).await?;
            Ok::<(Pfn, u64), DmError>((pfn, written))
        };
        let pfn = match upload.await {
            Ok((pfn, written)) => {
                record.transfer(1, 1, written, timer.elapsed());
                pfn
            }
            Err(e) => {
                record.transfer(1, 0, 0, timer.elapsed());
                self.emit(record, FinalStatus::Failed);
                self.flush_accounting();
                return Err(e.into());
            }
        };
        let put_time = timer.elapsed();
        debug!(lfn = %lfn, pfn = %pfn, size, "upload complete, registering");

        let timer = PhaseTimer::start();
        let tuple = FileTuple {
            lfn: lfn.clone(),
            pfn: pfn.clone(),
            size,
            backend: backend.clone(),
            guid: guid.clone(),
            checksum: Some(checksum.clone()),
        };
        let registration = self.register_file(std::slice::from_ref(&tuple)).await;
        let register_time = timer.elapsed();
        let failure = match registration {
            Ok(res) => res.failed.get(&lfn).map(|r| r.to_string()),
            Err(e) => Some(e.to_string()),
        };
        record.registration(1, u64::from(failure.is_none()), register_time);

        let outcome = match failure {
            None => {
                self.emit(record, FinalStatus::Successful);
                info!(lfn = %lfn, backend = %backend, size, "file uploaded and registered");
                Ok(PutOutcome {
                    pfn,
                    size,
                    put_time,
                    register_time,
                })
            }
            Some(reason) => {
                self.emit(record, FinalStatus::Failed);
                Err(PutFailure::Item(ErrorReason::RegistrationFailed(
                    PendingRegistration {
                        lfn,
                        pfn,
                        backend,
                        size: Some(size),
                        guid: Some(guid),
                        checksum: Some(checksum),
                        reason,
                    },
                )))
            }
        };
        self.flush_accounting();
        outcome
    }

    /// Register files with their first replica.
    ///
    /// Files are grouped by storage element and each element is validated
    /// once; the locator is canonicalized through the registration protocols
    /// when the element can do so.
    pub async fn register_file(&self, files: &[FileTuple]) -> DmResult<BatchResult<Lfn, ()>> {
        let mut result = BatchResult::new();
        let mut by_backend: BTreeMap<&str, Vec<&FileTuple>> = BTreeMap::new();
        for tuple in files {
            by_backend.entry(tuple.backend.as_str()).or_default().push(tuple);
        }

        let mut registrations = BTreeMap::new();
        for (backend, tuples) in by_backend {
            let element = match self.valid_element(backend).await {
                Ok(element) => element,
                Err(e) => {
                    warn!(backend = %backend, error = %e, "cannot register files at invalid storage element");
                    for tuple in tuples {
                        result.fail(tuple.lfn.clone(), e.to_string());
                    }
                    continue;
                }
            };
            for tuple in tuples {
                let pfn = element
                    .pfn_for_protocol(&tuple.pfn, &self.config.registration_protocols, false)
                    .unwrap_or_else(|_| tuple.pfn.clone());
                registrations.insert(
                    tuple.lfn.clone(),
                    FileRegistration {
                        pfn,
                        size: tuple.size,
                        backend: tuple.backend.clone(),
                        guid: tuple.guid.clone(),
                        checksum: tuple.checksum.clone(),
                    },
                );
            }
        }
        if !registrations.is_empty() {
            result.absorb(self.catalog.add_file(&registrations).await?);
        }
        Ok(result)
    }

    /// Register additional replicas of existing files.
    ///
    /// Like [`DataManager::register_file`], except that a locator which
    /// cannot be resolved through the registration protocols fails its item.
    pub async fn register_replica(&self, replicas: &[ReplicaTuple]) -> DmResult<BatchResult<Lfn, ()>> {
        let mut result = BatchResult::new();
        let mut by_backend: BTreeMap<&str, Vec<&ReplicaTuple>> = BTreeMap::new();
        for tuple in replicas {
            by_backend.entry(tuple.backend.as_str()).or_default().push(tuple);
        }

        let mut registrations = BTreeMap::new();
        for (backend, tuples) in by_backend {
            let element = match self.valid_element(backend).await {
                Ok(element) => element,
                Err(e) => {
                    for tuple in tuples {
                        result.fail(tuple.lfn.clone(), e.to_string());
                    }
                    continue;
                }
            };
            for tuple in tuples {
                match element.pfn_for_protocol(&tuple.pfn, &self.config.registration_protocols, false) {
                    Ok(pfn) => {
                        registrations.insert(
                            tuple.lfn.clone(),
                            ReplicaRegistration {
                                backend: tuple.backend.clone(),
                                pfn,
                            },
                        );
                    }
                    Err(e) => result.fail(tuple.lfn.clone(), e),
                }
            }
        }
        if !registrations.is_empty() {
            result.absorb(self.catalog.add_replica(&registrations).await?);
        }
        Ok(result)
    }
}

enum PutFailure {
    Hard(DmError),
    Item(ErrorReason),
}

impl From<DmError> for PutFailure {
    fn from(e: DmError) -> Self {
        if e.is_hard() {
            PutFailure::Hard(e)
        } else {
            PutFailure::Item(ErrorReason::from(e))
        }
    }
}
