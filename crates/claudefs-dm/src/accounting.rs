//! Accounting records for transfers and registrations.
//!
//! A record is started with [`OperationRecordBuilder`] when an operation
//! begins, filled in as its phases complete and turned into an immutable
//! [`OperationRecord`] by [`OperationRecordBuilder::finish`]. Sinks accept
//! records without blocking; durability is the sink's business.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{DmError, DmResult};
use crate::types::BackendId;

/// What kind of operation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Upload followed by file registration.
    PutAndRegister,
    /// Replication followed by replica registration.
    ReplicateAndRegister,
    /// Removal of physical bytes at a storage element.
    RemovePhysicalReplica,
    /// Removal of replica records from the catalog.
    RemoveCatalogReplica,
}

/// Outcome recorded for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalStatus {
    /// Every phase completed.
    Successful,
    /// At least one phase failed.
    Failed,
}

/// Immutable accounting record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Unique record id.
    pub id: Uuid,
    /// Operation kind.
    pub kind: OperationKind,
    /// User on whose behalf the operation ran.
    pub actor: String,
    /// Source storage element (or `None` for local uploads).
    pub source: Option<BackendId>,
    /// Destination storage element.
    pub destination: Option<BackendId>,
    /// Files the transfer phase attempted.
    pub transfer_total: u64,
    /// Files the transfer phase completed.
    pub transfer_ok: u64,
    /// Bytes moved by the transfer phase.
    pub transfer_bytes: u64,
    /// Time spent transferring.
    pub transfer_time: Duration,
    /// Files the registration phase attempted.
    pub registration_total: u64,
    /// Files the registration phase completed.
    pub registration_ok: u64,
    /// Time spent registering.
    pub registration_time: Duration,
    /// When the operation started.
    pub started_at: DateTime<Utc>,
    /// When the record was finished.
    pub finished_at: DateTime<Utc>,
    /// Final status.
    pub status: FinalStatus,
}

/// Mutable record under construction.
#[derive(Debug)]
pub struct OperationRecordBuilder {
    kind: OperationKind,
    actor: String,
    source: Option<BackendId>,
    destination: Option<BackendId>,
    transfer_total: u64,
    transfer_ok: u64,
    transfer_bytes: u64,
    transfer_time: Duration,
    registration_total: u64,
    registration_ok: u64,
    registration_time: Duration,
    started_at: DateTime<Utc>,
}

impl OperationRecordBuilder {
    /// Start a record for `kind` on behalf of `actor`.
    pub fn new(kind: OperationKind, actor: &str) -> Self {
        Self {
            kind,
            actor: actor.to_string(),
            source: None,
            destination: None,
            transfer_total: 0,
            transfer_ok: 0,
            transfer_bytes: 0,
            transfer_time: Duration::ZERO,
            registration_total: 0,
            registration_ok: 0,
            registration_time: Duration::ZERO,
            started_at: Utc::now(),
        }
    }

    /// Set the source storage element.
    pub fn source(&mut self, backend: impl Into<BackendId>) -> &mut Self {
        self.source = Some(backend.into());
        self
    }

    /// Set the destination storage element.
    pub fn destination(&mut self, backend: impl Into<BackendId>) -> &mut Self {
        self.destination = Some(backend.into());
        self
    }

    /// Account a transfer phase.
    pub fn transfer(&mut self, total: u64, ok: u64, bytes: u64, elapsed: Duration) -> &mut Self {
        self.transfer_total += total;
        self.transfer_ok += ok;
        self.transfer_bytes += bytes;
        self.transfer_time += elapsed;
        self
    }

    /// Account a registration phase.
    pub fn registration(&mut self, total: u64, ok: u64, elapsed: Duration) -> &mut Self {
        self.registration_total += total;
        self.registration_ok += ok;
        self.registration_time += elapsed;
        self
    }

    /// Seal the record.
    pub fn finish(self, status: FinalStatus) -> OperationRecord {
        OperationRecord {
            id: Uuid::new_v4(),
            kind: self.kind,
            actor: self.actor,
            source: self.source,
            destination: self.destination,
            transfer_total: self.transfer_total,
            transfer_ok: self.transfer_ok,
            transfer_bytes: self.transfer_bytes,
            transfer_time: self.transfer_time,
            registration_total: self.registration_total,
            registration_ok: self.registration_ok,
            registration_time: self.registration_time,
            started_at: self.started_at,
            finished_at: Utc::now(),
            status,
        }
    }
}

/// Measures one phase of an operation.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer(Instant);

impl PhaseTimer {
    /// Start timing.
    pub fn start() -> Self {
        Self(Instant::now())
    }

    /// Time since start.
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

/// Receiver of accounting records.
///
/// Neither method may block on durable storage or report failure to the
/// caller.
pub trait AccountingSink: Send + Sync {
    /// Hand a sealed record to the sink.
    fn submit(&self, record: OperationRecord);

    /// Start committing submitted records in the background.
    fn flush(&self);
}

/// Durable destination of accounting records.
#[async_trait]
pub trait RecordCommitter: Send + Sync {
    /// Persist a batch of records.
    async fn commit(&self, records: &[OperationRecord]) -> DmResult<()>;
}

struct BufferedInner {
    pending: Mutex<Vec<OperationRecord>>,
    committer: Arc<dyn RecordCommitter>,
}

impl BufferedInner {
    async fn commit_pending(&self) -> DmResult<usize> {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(0);
        }
        match self.committer.commit(&batch).await {
            Ok(()) => {
                debug!(records = batch.len(), "accounting records committed");
                Ok(batch.len())
            }
            Err(e) => {
                let mut pending = self.pending.lock();
                let newer = std::mem::replace(&mut *pending, batch);
                pending.extend(newer);
                Err(e)
            }
        }
    }
}

/// Sink that buffers records in memory and commits them on `flush`.
///
/// Commits run on a spawned tokio task. A failed commit puts the records
/// back in the buffer so the next flush retries them.
pub struct BufferedAccountingSink {
    inner: Arc<BufferedInner>,
}

impl BufferedAccountingSink {
    /// Create a sink committing through `committer`.
    pub fn new(committer: Arc<dyn RecordCommitter>) -> Self {
        Self {
            inner: Arc::new(BufferedInner {
                pending: Mutex::new(Vec::new()),
                committer,
            }),
        }
    }

    /// Records waiting for a commit.
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Commit buffered records and wait for the result.
    pub async fn commit_pending(&self) -> DmResult<usize> {
        self.inner.commit_pending().await
    }
}

impl AccountingSink for BufferedAccountingSink {
    fn submit(&self, record: OperationRecord) {
        self.inner.pending.lock().push(record);
    }

    fn flush(&self) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(pending = self.pending(), "no runtime to commit accounting records, keeping them buffered");
                return;
            }
        };
        let inner = Arc::clone(&self.inner);
        handle.spawn(async move {
            if let Err(e) = inner.commit_pending().await {
                error!(error = %e, "failed to commit accounting records");
            }
        });
    }
}

/// Committer appending records as JSON lines to a file.
pub struct JsonLinesCommitter {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonLinesCommitter {
    /// Create a committer appending to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl RecordCommitter for JsonLinesCommitter {
    async fn commit(&self, records: &[OperationRecord]) -> DmResult<()> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record).map_err(|e| DmError::Message(e.to_string()))?;
            buf.push(b'\n');
        }
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Committer keeping records in memory.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<OperationRecord>>,
    failing: AtomicBool,
}

impl MemoryRecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make commits fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Committed records.
    pub fn records(&self) -> Vec<OperationRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl RecordCommitter for MemoryRecordStore {
    async fn commit(&self, records: &[OperationRecord]) -> DmResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DmError::Message("accounting store unavailable".to_string()));
        }
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}

/// Sink remembering everything it receives.
#[derive(Default)]
pub struct MemoryAccountingSink {
    records: Mutex<Vec<OperationRecord>>,
    flushes: AtomicU64,
}

impl MemoryAccountingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Submitted records, oldest first.
    pub fn records(&self) -> Vec<OperationRecord> {
        self.records.lock().clone()
    }

    /// Number of `flush` calls.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl AccountingSink for MemoryAccountingSink {
    fn submit(&self, record: OperationRecord) {
        self.records.lock().push(record);
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Sink that drops every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAccountingSink;

impl AccountingSink for NullAccountingSink {
    fn submit(&self, _record: OperationRecord) {}

    fn flush(&self) {}
}
