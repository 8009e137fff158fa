//! End-to-end data management over filesystem-backed storage elements.

use claudefs_dm::accounting::FinalStatus;
use claudefs_dm::{
    BackendStatus, DataManager, DataManagerContext, DmConfig, ErrorReason, LocalStorageElement,
    MemoryAccountingSink, MemoryCatalog, OperationKind, PutRequest, ReplicateRequest,
    ReplicationOutcome, StaticSiteDirectory, StaticStatusOracle, StorageRegistry,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Cluster {
    _dir: TempDir,
    work: std::path::PathBuf,
    catalog: Arc<MemoryCatalog>,
    status: Arc<StaticStatusOracle>,
    accounting: Arc<MemoryAccountingSink>,
    elements: BTreeMap<String, Arc<LocalStorageElement>>,
    manager: DataManager,
}

fn cluster(names: &[&str]) -> Cluster {
    let dir = TempDir::new().unwrap();
    let work = dir.path().join("work");
    std::fs::create_dir_all(&work).unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    let storage = Arc::new(StorageRegistry::new());
    let status = Arc::new(StaticStatusOracle::new());
    let accounting = Arc::new(MemoryAccountingSink::new());
    let mut elements = BTreeMap::new();
    for name in names {
        let root = dir.path().join(name);
        std::fs::create_dir_all(&root).unwrap();
        let element = Arc::new(LocalStorageElement::new(name, root));
        storage.register(element.clone());
        status.set_all(name, BackendStatus::Active);
        elements.insert(name.to_string(), element);
    }
    let mut sites = StaticSiteDirectory::default();
    sites.upsert_site("LCG.HOME.ch", vec![names[0].to_string()]);
    let config = DmConfig {
        local_site: "LCG.HOME.ch".to_string(),
        actor: "tester".to_string(),
        local_cache_dir: Some(dir.path().join("cache")),
        ..DmConfig::default()
    };
    let manager = DataManager::new(
        config,
        DataManagerContext {
            catalog: catalog.clone(),
            storage,
            status: status.clone(),
            sites: Arc::new(sites),
            accounting: accounting.clone(),
        },
    );
    Cluster {
        _dir: dir,
        work,
        catalog,
        status,
        accounting,
        elements,
        manager,
    }
}

fn write_local(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

#[tokio::test]
async fn test_put_and_register_then_duplicate_is_rejected() {
    let c = cluster(&["CERN-DISK"]);
    let local = write_local(&c.work, "f.dat", &[7u8; 100]);

    let res = c
        .manager
        .put_and_register(PutRequest::new("/vo/user/f.dat", &local, "CERN-DISK"))
        .await
        .unwrap();
    let outcome = &res.successful["/vo/user/f.dat"];
    assert_eq!(outcome.size, 100);
    assert!(outcome.pfn.starts_with("file://"));
    let stored = c.elements["CERN-DISK"].local_path("/vo/user/f.dat").unwrap();
    assert_eq!(std::fs::read(&stored).unwrap().len(), 100);

    let meta = c.catalog.metadata_of("/vo/user/f.dat").unwrap();
    assert_eq!(meta.size, 100);
    assert!(meta.checksum.is_some());

    let records = c.accounting.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, OperationKind::PutAndRegister);
    assert_eq!(records[0].status, FinalStatus::Successful);
    assert_eq!(records[0].transfer_bytes, 100);

    let modified = std::fs::metadata(&stored).unwrap().modified().unwrap();
    let again = c
        .manager
        .put_and_register(PutRequest::new("/vo/user/f.dat", &local, "CERN-DISK"))
        .await
        .unwrap();
    assert!(again.failed["/vo/user/f.dat"]
        .to_string()
        .contains("already exists"));
    assert_eq!(
        std::fs::metadata(&stored).unwrap().modified().unwrap(),
        modified
    );
    assert_eq!(c.accounting.records().len(), 1);
}

#[tokio::test]
async fn test_replicate_get_and_remove_lifecycle() {
    let c = cluster(&["CERN-DISK", "PIC-DISK"]);
    let local = write_local(&c.work, "run.dst", b"event data for the run");
    c.manager
        .put_and_register(PutRequest::new("/vo/data/run.dst", &local, "CERN-DISK"))
        .await
        .unwrap();

    let res = c
        .manager
        .replicate_and_register(ReplicateRequest::new("/vo/data/run.dst", "PIC-DISK"))
        .await
        .unwrap();
    assert!(res.successful["/vo/data/run.dst"].pfn.is_some());
    let replicas = c.catalog.replicas_of("/vo/data/run.dst").unwrap();
    assert_eq!(replicas.len(), 2);
    assert_eq!(
        std::fs::read(c.elements["PIC-DISK"].local_path("/vo/data/run.dst").unwrap()).unwrap(),
        b"event data for the run"
    );

    let again = c
        .manager
        .replicate(ReplicateRequest::new("/vo/data/run.dst", "PIC-DISK"))
        .await
        .unwrap();
    assert_eq!(
        again.successful["/vo/data/run.dst"],
        ReplicationOutcome::AlreadyPresent
    );

    // the only remaining source is banned, so the download must fail
    c.status.set_all("CERN-DISK", BackendStatus::Banned);
    c.status.set_all("PIC-DISK", BackendStatus::Banned);
    let download = c.work.join("download");
    std::fs::create_dir_all(&download).unwrap();
    let got = c
        .manager
        .get_file(&["/vo/data/run.dst".to_string()], &download)
        .await
        .unwrap();
    assert!(got.is_failed(&"/vo/data/run.dst".to_string()));

    c.status.set_all("PIC-DISK", BackendStatus::Active);
    let got = c
        .manager
        .get_file(&["/vo/data/run.dst".to_string()], &download)
        .await
        .unwrap();
    let path = &got.successful["/vo/data/run.dst"];
    assert_eq!(std::fs::read(path).unwrap(), b"event data for the run");

    c.status.set_all("CERN-DISK", BackendStatus::Active);
    let removed = c
        .manager
        .remove_file(&["/vo/data/run.dst".to_string()], None)
        .await
        .unwrap();
    assert!(removed.is_successful(&"/vo/data/run.dst".to_string()));
    assert!(!c.catalog.contains_file("/vo/data/run.dst"));
    for element in c.elements.values() {
        assert!(!element.local_path("/vo/data/run.dst").unwrap().exists());
    }
}

#[tokio::test]
async fn test_sole_replica_is_protected() {
    let c = cluster(&["CERN-DISK", "PIC-DISK"]);
    let local = write_local(&c.work, "only.dat", b"single copy");
    c.manager
        .put_and_register(PutRequest::new("/vo/only.dat", &local, "CERN-DISK"))
        .await
        .unwrap();

    let res = c
        .manager
        .remove_replica("CERN-DISK", &["/vo/only.dat".to_string()])
        .await
        .unwrap();
    assert_eq!(res.failed["/vo/only.dat"], ErrorReason::SoleReplica);
    assert!(c.elements["CERN-DISK"].local_path("/vo/only.dat").unwrap().exists());
}

#[tokio::test]
async fn test_clean_directory_on_disk() {
    let c = cluster(&["CERN-DISK"]);
    for name in ["a.dat", "b.dat"] {
        let local = write_local(&c.work, name, b"payload");
        c.manager
            .put_and_register(PutRequest::new(
                format!("/vo/tmp/{}", name),
                &local,
                "CERN-DISK",
            ))
            .await
            .unwrap();
    }
    let res = c
        .manager
        .clean_logical_directory(&["/vo/tmp".to_string()])
        .await
        .unwrap();
    assert!(res.is_successful(&"/vo/tmp".to_string()));
    assert!(!c.catalog.contains_directory("/vo/tmp"));
    assert!(!c.elements["CERN-DISK"].local_path("/vo/tmp/a.dat").unwrap().exists());
}

#[tokio::test]
async fn test_logical_name_cannot_escape_storage_root() {
    let c = cluster(&["CERN-DISK"]);
    let local = write_local(&c.work, "f.dat", b"payload");
    let res = c
        .manager
        .put_and_register(PutRequest::new("/vo/../../escaped", &local, "CERN-DISK"))
        .await
        .unwrap();
    assert!(res.is_failed(&"/vo/../../escaped".to_string()));
    let root = c.elements["CERN-DISK"].root().to_path_buf();
    assert!(!root.join("../escaped").exists());
    assert!(!root.join("../../escaped").exists());
    assert!(!c.catalog.contains_file("/vo/../../escaped"));
}

#[tokio::test]
async fn test_remove_reports_catalog_phase_after_bytes_are_gone() {
    let c = cluster(&["CERN-DISK"]);
    let local = write_local(&c.work, "f", b"payload");
    c.manager
        .put_and_register(PutRequest::new("/vo/f", &local, "CERN-DISK"))
        .await
        .unwrap();
    c.catalog
        .fail_operation(claudefs_dm::catalog::CatalogOp::RemoveFile, "catalog down");

    let res = c
        .manager
        .remove_file(&["/vo/f".to_string()], None)
        .await
        .unwrap();
    assert!(res.failed["/vo/f"]
        .to_string()
        .starts_with("Failed to remove file from the catalog"));
    assert!(!c.elements["CERN-DISK"].local_path("/vo/f").unwrap().exists());
    assert!(c.catalog.contains_file("/vo/f"));
}
