#![warn(missing_docs)]

//! ClaudeFS data management subsystem: keeps the file catalog and the storage
//! elements consistent while files are uploaded, downloaded, replicated and removed.

pub mod accounting;
pub mod batch;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod directory;
pub mod error;
pub mod local_store;
pub mod manager;
pub mod memory_store;
pub mod proximity;
pub mod removal;
pub mod replicate;
pub mod status;
pub mod storage;
pub mod topology;
pub mod transfer;
pub mod types;

pub use accounting::{
    AccountingSink, BufferedAccountingSink, JsonLinesCommitter, MemoryAccountingSink,
    NullAccountingSink, OperationKind, OperationRecord,
};
pub use batch::{BatchResult, ErrorReason, PendingRegistration};
pub use catalog::{FileCatalog, MemoryCatalog};
pub use config::DmConfig;
pub use error::{DmError, DmResult};
pub use local_store::LocalStorageElement;
pub use manager::{DataManager, DataManagerContext};
pub use memory_store::MemoryStorageElement;
pub use replicate::{ReplicateRequest, ReplicationOutcome, ReplicationReport};
pub use status::{AccessMode, BackendStatus, StaticStatusOracle, StatusOracle};
pub use storage::{StorageElement, StorageFactory, StorageRegistry};
pub use topology::{SiteDirectory, StaticSiteDirectory};
pub use transfer::{PutOutcome, PutRequest};
pub use types::{BackendId, FileTuple, Lfn, Pfn, ReplicaSet, ReplicaTuple};
