use super::*;
use crate::sync::gateway::{GatewayError, RemoteChild, RemoteMetadata, UploadedObject};
use crate::sync::state::{MemoryStateStore, MemoryTables, StateError};
use async_trait::async_trait;
use drivesync_core::DriveError;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tempfile::{TempDir, tempdir};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    FindOrCreate { parent_id: String, name: String },
    Upload { parent_id: String, name: String },
}

#[derive(Default)]
struct FakeGateway {
    calls: Mutex<Vec<Call>>,
    failing_names: HashSet<String>,
}

impl FakeGateway {
    fn failing(names: &[&str]) -> Self {
        Self {
            failing_names: names.iter().map(|name| name.to_string()).collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn uploads(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Upload { .. }))
            .count()
    }

    fn persistent_error(operation: &'static str) -> GatewayError {
        GatewayError::Persistent {
            operation,
            attempts: 5,
            source: DriveError::IncompleteUpload,
        }
    }
}

#[async_trait]
impl RemoteGateway for FakeGateway {
    async fn find_or_create_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<String, GatewayError> {
        self.calls.lock().unwrap().push(Call::FindOrCreate {
            parent_id: parent_id.to_string(),
            name: name.to_string(),
        });
        if self.failing_names.contains(name) {
            return Err(Self::persistent_error("find_or_create_folder"));
        }
        Ok(format!("folder-{name}"))
    }

    async fn list_children(
        &self,
        _folder_id: &str,
    ) -> Result<BTreeMap<String, RemoteChild>, GatewayError> {
        Ok(BTreeMap::new())
    }

    async fn upload_content(
        &self,
        local_path: &Path,
        name: &str,
        parent_id: &str,
    ) -> Result<UploadedObject, GatewayError> {
        assert!(local_path.is_file(), "upload of non-file {local_path:?}");
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call::Upload {
                parent_id: parent_id.to_string(),
                name: name.to_string(),
            });
            calls.len()
        };
        if self.failing_names.contains(name) {
            return Err(Self::persistent_error("upload_content"));
        }
        Ok(UploadedObject {
            id: format!("file-{name}-{call_number}"),
            checksum: Some("checksum".into()),
        })
    }

    async fn get_metadata(
        &self,
        _remote_id: &str,
        _fields: &[&str],
    ) -> Result<Option<RemoteMetadata>, GatewayError> {
        Ok(None)
    }
}

/// Reads succeed, writes fail.
#[derive(Default)]
struct ReadOnlyStore {
    inner: MemoryStateStore,
}

fn disk_full() -> StateError {
    StateError::Io(std::io::Error::other("disk full"))
}

#[async_trait]
impl StateStore for ReadOnlyStore {
    async fn get_folder_mapping(
        &self,
        relative_path: &str,
    ) -> Result<Option<FolderMapping>, StateError> {
        self.inner.get_folder_mapping(relative_path).await
    }

    async fn put_folder_mapping(&self, _mapping: &FolderMapping) -> Result<(), StateError> {
        Err(disk_full())
    }

    async fn get_processed_item(
        &self,
        relative_path: &str,
    ) -> Result<Option<ProcessedItem>, StateError> {
        self.inner.get_processed_item(relative_path).await
    }

    async fn put_processed_item(&self, _item: &ProcessedItem) -> Result<(), StateError> {
        Err(disk_full())
    }

    async fn delete_processed_item(&self, _relative_path: &str) -> Result<(), StateError> {
        Err(disk_full())
    }

    async fn list_all_processed_items(&self) -> Result<Vec<ProcessedItem>, StateError> {
        self.inner.list_all_processed_items().await
    }

    async fn list_all_folder_mappings(&self) -> Result<Vec<FolderMapping>, StateError> {
        self.inner.list_all_folder_mappings().await
    }
}

/// `docs/report.txt` (100 bytes) and an empty `photos/`.
fn sample_tree() -> TempDir {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("docs")).unwrap();
    fs::create_dir_all(dir.path().join("photos")).unwrap();
    fs::write(dir.path().join("docs/report.txt"), vec![b'x'; 100]).unwrap();
    dir
}

fn options(root: &Path, dry_run: bool) -> SyncOptions {
    SyncOptions {
        source_root: root.to_path_buf(),
        target_folder_id: "target".into(),
        dry_run,
    }
}

#[tokio::test]
async fn first_run_creates_folders_and_uploads_files() {
    let tree = sample_tree();
    let gateway = FakeGateway::default();
    let state = MemoryStateStore::new();

    let report = SyncEngine::new(&gateway, &state, options(tree.path(), false))
        .run()
        .await
        .unwrap();

    assert_eq!(
        gateway.calls(),
        vec![
            Call::FindOrCreate {
                parent_id: "target".into(),
                name: "docs".into()
            },
            Call::Upload {
                parent_id: "folder-docs".into(),
                name: "report.txt".into()
            },
            Call::FindOrCreate {
                parent_id: "target".into(),
                name: "photos".into()
            },
        ]
    );
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.folders_resolved, 2);
    assert_eq!(report.failed(), 0);

    let snapshot = state.snapshot().await;
    assert_eq!(snapshot.folder_mappings["docs"].remote_folder_id, "folder-docs");
    assert_eq!(snapshot.folder_mappings["photos"].remote_folder_id, "folder-photos");
    let item = &snapshot.processed_items["docs/report.txt"];
    assert_eq!(item.local_size, 100);
    assert_eq!(item.remote_id.as_deref(), Some("file-report.txt-2"));
    assert_eq!(item.remote_checksum.as_deref(), Some("checksum"));
}

#[tokio::test]
async fn second_run_without_changes_makes_no_remote_calls() {
    let tree = sample_tree();
    let state = MemoryStateStore::new();
    SyncEngine::new(&FakeGateway::default(), &state, options(tree.path(), false))
        .run()
        .await
        .unwrap();
    let before = state.snapshot().await;

    let gateway = FakeGateway::default();
    let report = SyncEngine::new(&gateway, &state, options(tree.path(), false))
        .run()
        .await
        .unwrap();

    assert!(gateway.calls().is_empty());
    assert_eq!(report.to_string(), "uploaded: 0, skipped: 1, failed: 0");
    assert_eq!(report.folders_from_state, 2);
    assert_eq!(state.snapshot().await, before);
}

#[tokio::test]
async fn modified_file_is_uploaded_again() {
    let tree = sample_tree();
    let state = MemoryStateStore::new();
    SyncEngine::new(&FakeGateway::default(), &state, options(tree.path(), false))
        .run()
        .await
        .unwrap();

    fs::write(tree.path().join("docs/report.txt"), vec![b'y'; 120]).unwrap();
    let gateway = FakeGateway::default();
    let report = SyncEngine::new(&gateway, &state, options(tree.path(), false))
        .run()
        .await
        .unwrap();

    assert_eq!(report.uploaded, 1);
    assert_eq!(
        gateway.calls(),
        vec![Call::Upload {
            parent_id: "folder-docs".into(),
            name: "report.txt".into()
        }]
    );
    let item = state
        .get_processed_item("docs/report.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.local_size, 120);
    assert_eq!(item.remote_id.as_deref(), Some("file-report.txt-1"));
}

#[tokio::test]
async fn touched_file_with_same_size_is_uploaded_again() {
    let tree = sample_tree();
    let state = MemoryStateStore::new();
    SyncEngine::new(&FakeGateway::default(), &state, options(tree.path(), false))
        .run()
        .await
        .unwrap();
    let before = state
        .get_processed_item("docs/report.txt")
        .await
        .unwrap()
        .unwrap();

    let touched = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
    fs::File::options()
        .write(true)
        .open(tree.path().join("docs/report.txt"))
        .unwrap()
        .set_modified(touched)
        .unwrap();
    let gateway = FakeGateway::default();
    let report = SyncEngine::new(&gateway, &state, options(tree.path(), false))
        .run()
        .await
        .unwrap();

    assert_eq!(report.uploaded, 1);
    assert_eq!(
        gateway.calls(),
        vec![Call::Upload {
            parent_id: "folder-docs".into(),
            name: "report.txt".into()
        }]
    );
    let item = state
        .get_processed_item("docs/report.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.local_size, before.local_size);
    assert_eq!(item.local_modified_time, 1_600_000_000.0);
}

#[tokio::test]
async fn failed_folder_skips_everything_beneath_it() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("A/B")).unwrap();
    fs::write(dir.path().join("A/B/c.txt"), b"c").unwrap();
    fs::write(dir.path().join("z.txt"), b"z").unwrap();
    let gateway = FakeGateway::failing(&["A"]);
    let state = MemoryStateStore::new();

    let report = SyncEngine::new(&gateway, &state, options(dir.path(), false))
        .run()
        .await
        .unwrap();

    let failed: Vec<(&str, ItemKind)> = report
        .failures
        .iter()
        .map(|f| (f.relative_path.as_str(), f.kind))
        .collect();
    assert_eq!(
        failed,
        vec![
            ("A", ItemKind::Folder),
            ("A/B", ItemKind::Folder),
            ("A/B/c.txt", ItemKind::File),
        ]
    );
    assert_eq!(report.uploaded, 1);
    assert_eq!(gateway.uploads(), 1);
    let snapshot = state.snapshot().await;
    assert!(snapshot.folder_mappings.is_empty());
    assert_eq!(
        snapshot.processed_items.keys().collect::<Vec<_>>(),
        vec!["z.txt"]
    );
}

#[tokio::test]
async fn failed_upload_keeps_previous_record() {
    let tree = sample_tree();
    let state = MemoryStateStore::new();
    SyncEngine::new(&FakeGateway::default(), &state, options(tree.path(), false))
        .run()
        .await
        .unwrap();
    let before = state.get_processed_item("docs/report.txt").await.unwrap();

    fs::write(tree.path().join("docs/report.txt"), vec![b'y'; 120]).unwrap();
    let report = SyncEngine::new(
        &FakeGateway::failing(&["report.txt"]),
        &state,
        options(tree.path(), false),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.failed(), 1);
    assert_eq!(report.failures[0].relative_path, "docs/report.txt");
    assert_eq!(
        state.get_processed_item("docs/report.txt").await.unwrap(),
        before
    );
}

#[tokio::test]
async fn dry_run_touches_neither_remote_nor_state() {
    let tree = sample_tree();
    let gateway = FakeGateway::default();
    let state = MemoryStateStore::new();

    let report = SyncEngine::new(&gateway, &state, options(tree.path(), true))
        .run()
        .await
        .unwrap();

    assert!(gateway.calls().is_empty());
    assert_eq!(state.snapshot().await, MemoryTables::default());
    assert!(report.dry_run);
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.folders_resolved, 2);
    assert_eq!(report.to_string(), "[dry run] uploaded: 1, skipped: 0, failed: 0");
}

#[tokio::test]
async fn dry_run_reuses_recorded_state() {
    let tree = sample_tree();
    let state = MemoryStateStore::new();
    SyncEngine::new(&FakeGateway::default(), &state, options(tree.path(), false))
        .run()
        .await
        .unwrap();
    fs::write(tree.path().join("docs/new.txt"), b"new").unwrap();

    let gateway = FakeGateway::default();
    let report = SyncEngine::new(&gateway, &state, options(tree.path(), true))
        .run()
        .await
        .unwrap();

    assert!(gateway.calls().is_empty());
    assert_eq!(report.folders_from_state, 2);
    assert_eq!(report.skipped_unchanged, 1);
    assert_eq!(report.uploaded, 1);
    assert!(state.get_processed_item("docs/new.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn state_write_failure_is_counted_but_not_fatal() {
    let tree = sample_tree();
    let gateway = FakeGateway::default();
    let state = ReadOnlyStore::default();

    let report = SyncEngine::new(&gateway, &state, options(tree.path(), false))
        .run()
        .await
        .unwrap();

    assert_eq!(report.uploaded, 1);
    assert_eq!(report.folders_resolved, 2);
    assert_eq!(report.failed(), 0);
    assert_eq!(report.state_write_errors, 3);
}

#[tokio::test]
async fn missing_source_folder_is_an_error() {
    let dir = tempdir().unwrap();
    let gateway = FakeGateway::default();
    let state = MemoryStateStore::new();

    let result = SyncEngine::new(&gateway, &state, options(&dir.path().join("gone"), false))
        .run()
        .await;

    assert!(matches!(result, Err(ScanError::InvalidRoot(_))));
    assert!(gateway.calls().is_empty());
}
