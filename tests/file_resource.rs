mod common;
use common::{own_permission, path_str, tmp_dir, LocalExecutor};

use linux_remote::errors::ErrorKind;
use linux_remote::filesystem;
use linux_remote::managers::{FileManager, RemoteFile, ResourceHandler};
use linux_remote::services::logger::Logger;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

fn manager(exec: Arc<LocalExecutor>) -> FileManager {
    FileManager::new(Logger::new("test"), exec)
}

fn mode_of(path: &std::path::Path) -> u32 {
    std::fs::metadata(path).expect("metadata").permissions().mode() & 0o7777
}

#[tokio::test]
async fn created_file_reads_back_exactly() {
    let root = tmp_dir("file-roundtrip");
    let path = root.join("nested/config.txt");
    let manager = manager(Arc::new(LocalExecutor::new()));

    let desired = RemoteFile::new(path_str(&path), "line one\nline 'two'\n")
        .with_permission(own_permission("644"));
    let created = manager.create(desired.clone()).await.expect("create");
    assert!(uuid::Uuid::parse_str(&created.id).is_ok());
    assert_eq!(created.state, desired);

    let read = manager
        .read(&created.id, desired.clone())
        .await
        .expect("read")
        .expect("present");
    assert_eq!(read.content, "line one\nline 'two'\n");
    assert_eq!(read.permission, own_permission("644"));
    assert_eq!(mode_of(&path), 0o644);

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn create_refuses_existing_path_unless_overwrite() {
    let root = tmp_dir("file-reserve");
    std::fs::create_dir_all(&root).expect("root");
    let path = root.join("x");
    std::fs::write(&path, "original").expect("seed");
    let manager = manager(Arc::new(LocalExecutor::new()));

    let desired = RemoteFile::new(path_str(&path), "replaced").with_permission(own_permission("600"));
    let err = manager.create(desired.clone()).await.expect_err("conflict");
    assert_eq!(err.kind, ErrorKind::PathConflict);
    assert!(err.message.contains("exists"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "original");

    let created = manager
        .create(desired.with_overwrite(true))
        .await
        .expect("overwrite");
    assert_eq!(created.state.content, "replaced");
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "replaced");
    assert_eq!(mode_of(&path), 0o600);

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn read_of_deleted_file_reports_absence() {
    let root = tmp_dir("file-absent");
    let manager = manager(Arc::new(LocalExecutor::new()));
    let known = RemoteFile::new(path_str(&root.join("gone")), "x");
    let read = manager.read("id", known).await.expect("read");
    assert!(read.is_none());
}

#[tokio::test]
async fn delete_is_idempotent() {
    let root = tmp_dir("file-delete");
    let path = root.join("f");
    let manager = manager(Arc::new(LocalExecutor::new()));
    let desired = RemoteFile::new(path_str(&path), "x").with_permission(own_permission("644"));
    manager.create(desired.clone()).await.expect("create");

    manager.delete(desired.clone()).await.expect("first delete");
    assert!(!path.exists());
    manager.delete(desired).await.expect("second delete");

    let exec = LocalExecutor::new();
    filesystem::remove(&exec, &path_str(&path), "").expect("remove absent");
    filesystem::remove(&exec, &path_str(&path), "").expect("remove absent again");

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn delete_with_recycle_path_moves_into_timestamp_folder() {
    let root = tmp_dir("file-recycle");
    let path = root.join("d");
    let recycle = root.join("recycle");
    let manager = manager(Arc::new(LocalExecutor::new()));
    let desired = RemoteFile::new(path_str(&path), "keep me")
        .with_permission(own_permission("644"))
        .with_recycle_path(path_str(&recycle));
    manager.create(desired.clone()).await.expect("create");

    let before = chrono::Utc::now().timestamp();
    manager.delete(desired).await.expect("delete");
    assert!(!path.exists());

    let stamps: Vec<_> = std::fs::read_dir(&recycle)
        .expect("recycle dir")
        .map(|entry| entry.expect("entry").path())
        .collect();
    assert_eq!(stamps.len(), 1);
    let stamp: i64 = stamps[0]
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.parse().ok())
        .expect("unix timestamp folder");
    assert!(stamp >= before);
    assert_eq!(
        std::fs::read_to_string(stamps[0].join("d")).unwrap(),
        "keep me"
    );

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn update_moves_file_and_applies_new_content() {
    let root = tmp_dir("file-rename");
    let old_path = root.join("a.txt");
    let new_path = root.join("sub/b.txt");
    let manager = manager(Arc::new(LocalExecutor::new()));
    let old = RemoteFile::new(path_str(&old_path), "v1").with_permission(own_permission("644"));
    manager.create(old.clone()).await.expect("create");

    let new = RemoteFile::new(path_str(&new_path), "v2").with_permission(own_permission("640"));
    let state = manager
        .update(Some(old), Some(new))
        .await
        .expect("update")
        .expect("present");
    assert!(!old_path.exists());
    assert_eq!(state.content, "v2");
    assert_eq!(state.permission.mode, "640");

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn update_onto_existing_path_is_a_conflict() {
    let root = tmp_dir("file-rename-conflict");
    std::fs::create_dir_all(&root).expect("root");
    std::fs::write(root.join("taken"), "someone else").expect("seed");
    let manager = manager(Arc::new(LocalExecutor::new()));
    let old = RemoteFile::new(path_str(&root.join("mine")), "v1")
        .with_permission(own_permission("644"));
    manager.create(old.clone()).await.expect("create");

    let new = RemoteFile::new(path_str(&root.join("taken")), "v1")
        .with_permission(own_permission("644"));
    let err = manager
        .update(Some(old), Some(new))
        .await
        .expect_err("conflict");
    assert_eq!(err.kind, ErrorKind::PathConflict);
    assert_eq!(
        std::fs::read_to_string(root.join("taken")).unwrap(),
        "someone else"
    );

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn ignored_content_is_touched_not_uploaded() {
    let root = tmp_dir("file-ignore");
    std::fs::create_dir_all(&root).expect("root");
    let path = root.join("log");
    std::fs::write(&path, "written by the app").expect("seed");
    let manager = manager(Arc::new(LocalExecutor::new()));

    let mut desired = RemoteFile::new(path_str(&path), "not uploaded")
        .with_permission(own_permission("600"))
        .with_overwrite(true);
    desired.ignore_content = true;
    let created = manager.create(desired).await.expect("create");
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "written by the app"
    );
    assert_eq!(created.state.content, "not uploaded");
    assert_eq!(mode_of(&path), 0o600);

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn update_retried_after_partial_create_converges() {
    let root = tmp_dir("file-retry");
    std::fs::create_dir_all(&root).expect("root");
    let path = root.join("half");
    // Content landed but permissions were never applied.
    std::fs::write(&path, "v1").expect("seed");
    let manager = manager(Arc::new(LocalExecutor::new()));

    let desired = RemoteFile::new(path_str(&path), "v1").with_permission(own_permission("640"));
    let state = manager
        .update(Some(desired.clone()), Some(desired))
        .await
        .expect("update")
        .expect("present");
    assert_eq!(state.permission.mode, "640");

    let _ = std::fs::remove_dir_all(&root);
}
