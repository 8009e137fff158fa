//! Backend status oracle interface and per-call status cache.
//!
//! Only `Active` and `Degraded` backends may be used for a given access mode.
//! Statuses are never cached across orchestrator calls; a [`StatusCache`] lives
//! for exactly one call.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::merge_sources;
use crate::error::{DmError, DmResult};

/// Health of a storage element for one access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendStatus {
    /// Fully usable.
    Active,
    /// Usable with reduced performance.
    Degraded,
    /// Being tested; not usable.
    Probing,
    /// Not usable (also used for unknown backends).
    Banned,
}

impl BackendStatus {
    /// Returns true for statuses that permit use of the backend.
    pub fn is_usable(&self) -> bool {
        matches!(self, BackendStatus::Active | BackendStatus::Degraded)
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendStatus::Active => write!(f, "Active"),
            BackendStatus::Degraded => write!(f, "Degraded"),
            BackendStatus::Probing => write!(f, "Probing"),
            BackendStatus::Banned => write!(f, "Banned"),
        }
    }
}

/// Access mode a status applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    /// Reading (download, replication source).
    Read,
    /// Writing (upload, replication destination).
    Write,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => write!(f, "Read"),
            AccessMode::Write => write!(f, "Write"),
        }
    }
}

/// Authoritative source of backend health.
#[async_trait]
pub trait StatusOracle: Send + Sync {
    /// Report the status of `backend` for `mode`.
    async fn get_status(&self, backend: &str, mode: AccessMode) -> DmResult<BackendStatus>;
}

/// Oracle backed by a static table; unknown backends report `Banned`.
#[derive(Default)]
pub struct StaticStatusOracle {
    statuses: RwLock<HashMap<(String, AccessMode), BackendStatus>>,
    failing: RwLock<HashMap<String, String>>,
    queries: AtomicU64,
}

impl StaticStatusOracle {
    /// Create an empty oracle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the status of a backend for one access mode.
    pub fn set_status(&self, backend: &str, mode: AccessMode, status: BackendStatus) {
        self.statuses
            .write()
            .insert((backend.to_string(), mode), status);
    }

    /// Set the status of a backend for both access modes.
    pub fn set_all(&self, backend: &str, status: BackendStatus) {
        self.set_status(backend, AccessMode::Read, status);
        self.set_status(backend, AccessMode::Write, status);
    }

    /// Make every query about `backend` fail with `msg`.
    pub fn fail_backend(&self, backend: &str, msg: &str) {
        self.failing
            .write()
            .insert(backend.to_string(), msg.to_string());
    }

    /// Number of queries answered so far.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StatusOracle for StaticStatusOracle {
    async fn get_status(&self, backend: &str, mode: AccessMode) -> DmResult<BackendStatus> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if let Some(msg) = self.failing.read().get(backend) {
            return Err(DmError::StatusOracle {
                backend: backend.to_string(),
                msg: msg.clone(),
            });
        }
        Ok(self
            .statuses
            .read()
            .get(&(backend.to_string(), mode))
            .copied()
            .unwrap_or(BackendStatus::Banned))
    }
}

/// Queries two oracles and merges their answers; the primary wins when both
/// respond, either one alone is enough, and both failing is an error carrying
/// both messages.
pub struct FallbackStatusOracle {
    primary: Arc<dyn StatusOracle>,
    secondary: Arc<dyn StatusOracle>,
}

impl FallbackStatusOracle {
    /// Create a merged oracle.
    pub fn new(primary: Arc<dyn StatusOracle>, secondary: Arc<dyn StatusOracle>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl StatusOracle for FallbackStatusOracle {
    async fn get_status(&self, backend: &str, mode: AccessMode) -> DmResult<BackendStatus> {
        let primary = self.primary.get_status(backend, mode).await;
        let secondary = self.secondary.get_status(backend, mode).await;
        merge_sources(primary, secondary, |p, _| p).map_err(|e| DmError::StatusOracle {
            backend: backend.to_string(),
            msg: e.to_string(),
        })
    }
}

/// Status lookups memoized for the duration of one orchestrator call.
pub struct StatusCache<'a> {
    oracle: &'a dyn StatusOracle,
    entries: HashMap<(String, AccessMode), Result<BackendStatus, String>>,
}

impl<'a> StatusCache<'a> {
    /// Start an empty cache over `oracle`.
    pub fn new(oracle: &'a dyn StatusOracle) -> Self {
        Self {
            oracle,
            entries: HashMap::new(),
        }
    }

    /// Status of `backend` for `mode`; oracle failures are returned as errors.
    pub async fn status(&mut self, backend: &str, mode: AccessMode) -> DmResult<BackendStatus> {
        let key = (backend.to_string(), mode);
        if !self.entries.contains_key(&key) {
            let answer = self
                .oracle
                .get_status(backend, mode)
                .await
                .map_err(|e| e.to_string());
            self.entries.insert(key.clone(), answer);
        }
        match self.entries.get(&key) {
            Some(Ok(status)) => Ok(*status),
            Some(Err(msg)) => Err(DmError::StatusOracle {
                backend: backend.to_string(),
                msg: msg.clone(),
            }),
            None => Err(DmError::StatusOracle {
                backend: backend.to_string(),
                msg: "status not resolved".to_string(),
            }),
        }
    }

    /// True when `backend` is Active/Degraded for `mode`. Undeterminable
    /// statuses count as not usable.
    pub async fn is_usable(&mut self, backend: &str, mode: AccessMode) -> bool {
        match self.status(backend, mode).await {
            Ok(status) => status.is_usable(),
            Err(e) => {
                debug!(backend = %backend, mode = %mode, error = %e, "status unknown, treating as not active");
                false
            }
        }
    }
}
