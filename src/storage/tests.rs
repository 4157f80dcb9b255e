use super::error::FsErrorKind;
use super::fs::{FsManager, normalize_virtual};
use pretty_assertions::assert_eq;
use std::path::PathBuf;

async fn manager() -> (tempfile::TempDir, FsManager, PathBuf) {
    let root = tempfile::tempdir().unwrap();
    let fs = FsManager::open(root.path()).await.unwrap();
    let ns = fs.namespace("alice").await.unwrap();
    (root, fs, ns)
}

#[test]
fn virtual_path_normalization() {
    assert_eq!(normalize_virtual("/", "docs"), "/docs");
    assert_eq!(normalize_virtual("/docs", "a.txt"), "/docs/a.txt");
    assert_eq!(normalize_virtual("/docs", "/b.txt"), "/b.txt");
    assert_eq!(normalize_virtual("/docs", "./a/../b.txt"), "/docs/b.txt");
    assert_eq!(normalize_virtual("/docs", ""), "/docs");
    // `..` clamps at the virtual root, like POSIX `/..`
    assert_eq!(normalize_virtual("/", ".."), "/");
    assert_eq!(normalize_virtual("/", "../../etc/passwd"), "/etc/passwd");
}

#[tokio::test]
async fn resolution_never_escapes_namespace() {
    let (_root, fs, ns) = manager().await;
    for (cwd, requested) in [
        ("/", "../../etc/passwd"),
        ("/docs", "../../.."),
        ("/", "/.."),
        ("/a/b", "../../../../root"),
    ] {
        let (_, real) = fs.resolve(&ns, cwd, requested).unwrap();
        assert!(real.starts_with(&ns), "{cwd} + {requested} escaped to {real:?}");
    }
    // NUL bytes are rejected outright
    let err = fs.resolve(&ns, "/", "evil\0name").unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::SecurityViolation);
}

#[tokio::test]
async fn bad_usernames_are_rejected() {
    let root = tempfile::tempdir().unwrap();
    let fs = FsManager::open(root.path()).await.unwrap();
    for user in ["", "..", "a/b"] {
        assert_eq!(fs.namespace(user).await.unwrap_err().kind(), FsErrorKind::SecurityViolation);
    }
}

#[tokio::test]
async fn mkd_then_rmd_round_trip() {
    let (_root, fs, ns) = manager().await;
    fs.make_dir(&ns, "/", "reports").await.unwrap();
    assert_eq!(fs.list_dir(&ns, "/", ".").await.unwrap(), vec!["reports".to_string()]);

    // creating it again fails
    let err = fs.make_dir(&ns, "/", "reports").await.unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::AlreadyExists);

    fs.remove_dir(&ns, "/", "reports").await.unwrap();
    assert!(fs.list_dir(&ns, "/", ".").await.unwrap().is_empty());
}

#[tokio::test]
async fn rmd_refuses_non_empty() {
    let (_root, fs, ns) = manager().await;
    fs.make_dir(&ns, "/", "full").await.unwrap();
    let mut data = &b"x"[..];
    fs.write_stream(&ns, "/full", "x.txt", &mut data).await.unwrap();

    let err = fs.remove_dir(&ns, "/", "full").await.unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::NotEmpty);
}

#[tokio::test]
async fn write_then_read_is_byte_identical() {
    let (_root, fs, ns) = manager().await;
    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
    let mut reader = &payload[..];
    let (virtual_path, written) = fs.write_stream(&ns, "/", "hello.bin", &mut reader).await.unwrap();
    assert_eq!(virtual_path, "/hello.bin");
    assert_eq!(written, 1024);

    let (mut file, len) = fs.open_read(&ns, "/", "hello.bin").await.unwrap();
    assert_eq!(len, 1024);
    let mut back = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut file, &mut back).await.unwrap();
    assert_eq!(back, payload);
}

#[tokio::test]
async fn write_leaves_no_tmp_files_behind() {
    let (_root, fs, ns) = manager().await;
    let mut data = &b"contents"[..];
    fs.write_stream(&ns, "/", "a.txt", &mut data).await.unwrap();
    let names = fs.list_dir(&ns, "/", ".").await.unwrap();
    assert_eq!(names, vec!["a.txt".to_string()]);
}

#[tokio::test]
async fn delete_file_semantics() {
    let (_root, fs, ns) = manager().await;
    let err = fs.delete_file(&ns, "/", "ghost.txt").await.unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::NotFound);

    fs.make_dir(&ns, "/", "adir").await.unwrap();
    let err = fs.delete_file(&ns, "/", "adir").await.unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::NotAFile);

    let mut data = &b"x"[..];
    fs.write_stream(&ns, "/", "real.txt", &mut data).await.unwrap();
    fs.delete_file(&ns, "/", "real.txt").await.unwrap();
    assert!(!fs.is_file(&ns, "/", "real.txt").await);
}

#[tokio::test]
async fn rename_round_trip_is_a_no_op() {
    let (_root, fs, ns) = manager().await;
    fs.make_dir(&ns, "/", "a").await.unwrap();

    fs.rename_path(&ns, "/", "a", "b").await.unwrap();
    assert_eq!(fs.list_dir(&ns, "/", ".").await.unwrap(), vec!["b".to_string()]);

    fs.rename_path(&ns, "/", "b", "a").await.unwrap();
    assert_eq!(fs.list_dir(&ns, "/", ".").await.unwrap(), vec!["a".to_string()]);
}

#[tokio::test]
async fn rename_errors() {
    let (_root, fs, ns) = manager().await;
    let err = fs.rename_path(&ns, "/", "missing", "new").await.unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::NotFound);

    fs.make_dir(&ns, "/", "a").await.unwrap();
    fs.make_dir(&ns, "/", "b").await.unwrap();
    let err = fs.rename_path(&ns, "/", "a", "b").await.unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::AlreadyExists);
}

#[tokio::test]
async fn change_dir_validates_target() {
    let (_root, fs, ns) = manager().await;
    fs.make_dir(&ns, "/", "docs").await.unwrap();

    assert_eq!(fs.change_dir(&ns, "/", "docs").await.unwrap(), "/docs");
    assert_eq!(fs.change_dir(&ns, "/docs", "..").await.unwrap(), "/");
    // CWD .. from the root stays at the root
    assert_eq!(fs.change_dir(&ns, "/", "..").await.unwrap(), "/");

    let err = fs.change_dir(&ns, "/", "nope").await.unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::NotFound);

    let mut data = &b"x"[..];
    fs.write_stream(&ns, "/", "file.txt", &mut data).await.unwrap();
    let err = fs.change_dir(&ns, "/", "file.txt").await.unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::NotADirectory);
}

#[tokio::test]
async fn stat_reports_kind_and_size() {
    let (_root, fs, ns) = manager().await;
    let mut data = &b"12345"[..];
    fs.write_stream(&ns, "/", "f.txt", &mut data).await.unwrap();

    let stat = fs.stat(&ns, "/", "f.txt").await.unwrap();
    assert_eq!(stat.name, "f.txt");
    assert_eq!(stat.size, 5);
    assert!(stat.is_file && !stat.is_dir);

    let listing = fs.list_dir_with_stats(&ns, "/", ".").await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].path, "/f.txt");
}

#[tokio::test]
async fn copy_name_avoids_collisions() {
    let (_root, fs, ns) = manager().await;
    assert_eq!(fs.copy_name(&ns, "/report.txt").await, "/report_copy.txt");

    let mut data = &b"x"[..];
    fs.write_stream(&ns, "/", "report_copy.txt", &mut data).await.unwrap();
    assert_eq!(fs.copy_name(&ns, "/report.txt").await, "/report_copy1.txt");

    // extensionless names work too
    assert_eq!(fs.copy_name(&ns, "/README").await, "/README_copy");
}

#[tokio::test]
async fn export_tree_walks_every_namespace() {
    let root = tempfile::tempdir().unwrap();
    let fs = FsManager::open(root.path()).await.unwrap();
    let alice = fs.namespace("alice").await.unwrap();
    let bob = fs.namespace("bob").await.unwrap();
    fs.make_dir(&alice, "/", "docs").await.unwrap();
    fs.make_dir(&alice, "/docs", "old").await.unwrap();
    fs.make_dir(&bob, "/", "music").await.unwrap();

    let mut tree = fs.export_tree().await.unwrap();
    tree.sort();
    assert_eq!(
        tree,
        vec![
            ("alice".to_string(), "/".to_string()),
            ("alice".to_string(), "/docs".to_string()),
            ("alice".to_string(), "/docs/old".to_string()),
            ("bob".to_string(), "/".to_string()),
            ("bob".to_string(), "/music".to_string()),
        ]
    );
}
