//! Integration tests for local-to-local sync and file commands

mod common;

use common::{context_with, create_file, file_exists, files_under, local, read_file};
use gsg::error::Error;
use gsg::ops::{self, CopyOptions};
use gsg::retry::RetryConfig;
use gsg::sync::{SyncEngine, SyncOptions};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

const CHUNK: u64 = 8 * 1024 * 1024;

fn recursive() -> SyncOptions {
    SyncOptions {
        recursive: true,
        ..SyncOptions::default()
    }
}

#[tokio::test]
async fn test_sync_new_files_then_nothing() {
    let scratch = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    create_file(&source, "a.txt", &[b'a'; 10]);
    create_file(&source, "b.txt", &[b'b'; 20]);

    let ctx = context_with(scratch.path(), CHUNK, &[]);
    let engine = SyncEngine::new(&ctx);

    let first = engine
        .run(&local(&source, ""), &local(&dest, ""), recursive())
        .await
        .unwrap();
    assert_eq!(first.copied.len(), 2);
    assert_eq!(first.bytes, 30);
    assert_eq!(read_file(&dest, "a.txt"), vec![b'a'; 10]);
    assert_eq!(read_file(&dest, "b.txt"), vec![b'b'; 20]);

    let second = engine
        .run(&local(&source, ""), &local(&dest, ""), recursive())
        .await
        .unwrap();
    assert!(second.copied.is_empty());
    assert_eq!(second.unchanged, 2);

    ctx.pool.close().await;
}

#[tokio::test]
async fn test_sync_nested_and_modified() {
    let scratch = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    create_file(&source, "top.txt", b"top");
    create_file(&source, "sub/deep/leaf.txt", b"leaf");
    create_file(&dest, "top.txt", b"old contents");

    let ctx = context_with(scratch.path(), CHUNK, &[]);
    let report = SyncEngine::new(&ctx)
        .run(&local(&source, ""), &local(&dest, ""), recursive())
        .await
        .unwrap();

    let mut copied = report.copied.clone();
    copied.sort();
    assert_eq!(copied, vec!["sub/deep/leaf.txt", "top.txt"]);
    assert_eq!(read_file(&dest, "top.txt"), b"top");
    assert_eq!(read_file(&dest, "sub/deep/leaf.txt"), b"leaf");

    // Modification times travel with the copy
    let src_mtime = std::fs::metadata(source.path().join("top.txt")).unwrap().modified().unwrap();
    let dst_mtime = std::fs::metadata(dest.path().join("top.txt")).unwrap().modified().unwrap();
    assert_eq!(src_mtime, dst_mtime);

    ctx.pool.close().await;
}

#[tokio::test]
async fn test_sync_delete_flag() {
    let scratch = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    create_file(&source, "a.txt", &[b'a'; 10]);
    create_file(&source, "b.txt", &[b'b'; 20]);
    create_file(&dest, "c.txt", b"stale");

    let ctx = context_with(scratch.path(), CHUNK, &[]);
    let engine = SyncEngine::new(&ctx);

    let kept = engine
        .run(&local(&source, ""), &local(&dest, ""), recursive())
        .await
        .unwrap();
    assert!(kept.deleted.is_empty());
    assert!(file_exists(&dest, "c.txt"));

    let options = SyncOptions {
        delete: true,
        ..recursive()
    };
    let pruned = engine
        .run(&local(&source, ""), &local(&dest, ""), options)
        .await
        .unwrap();
    assert_eq!(pruned.deleted, vec!["c.txt"]);
    assert!(!file_exists(&dest, "c.txt"));
    assert_eq!(files_under(dest.path()), vec!["a.txt", "b.txt"]);

    ctx.pool.close().await;
}

#[tokio::test]
async fn test_sync_missing_source() {
    let scratch = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    create_file(&dest, "x/y.txt", b"y");

    let ctx = context_with(scratch.path(), CHUNK, &[]);
    let engine = SyncEngine::new(&ctx);
    let missing = local(&source, "does-not-exist");

    let err = engine
        .run(&missing, &local(&dest, ""), recursive())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert!(file_exists(&dest, "x/y.txt"));

    let options = SyncOptions {
        delete: true,
        ..recursive()
    };
    let report = engine.run(&missing, &local(&dest, ""), options).await.unwrap();
    assert_eq!(report.deleted, vec!["x/y.txt"]);
    assert!(!file_exists(&dest, "x/y.txt"));

    ctx.pool.close().await;
}

#[tokio::test]
async fn test_sync_single_object() {
    let scratch = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    create_file(&source, "only.bin", b"payload");

    let ctx = context_with(scratch.path(), CHUNK, &[]);
    let engine = SyncEngine::new(&ctx);

    // Into an existing directory: keeps its name
    let report = engine
        .run(&local(&source, "only.bin"), &local(&dest, ""), SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.copied, vec!["only.bin"]);
    assert_eq!(read_file(&dest, "only.bin"), b"payload");

    // Onto an exact path
    engine
        .run(&local(&source, "only.bin"), &local(&dest, "renamed.bin"), SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(read_file(&dest, "renamed.bin"), b"payload");

    ctx.pool.close().await;
}

#[tokio::test]
async fn test_force_checksum_catches_same_size_same_mtime_edit() {
    let scratch = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let src = create_file(&source, "f.txt", b"aaaa");
    let dst = create_file(&dest, "f.txt", b"bbbb");

    let stamp = SystemTime::now() - Duration::from_secs(3600);
    for path in [&src, &dst] {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(stamp)
            .unwrap();
    }

    let ctx = context_with(scratch.path(), CHUNK, &[]);
    let engine = SyncEngine::new(&ctx);

    let lax = engine
        .run(&local(&source, ""), &local(&dest, ""), recursive())
        .await
        .unwrap();
    assert!(lax.copied.is_empty());

    let strict = SyncOptions {
        force_checksum: true,
        ..recursive()
    };
    let report = engine
        .run(&local(&source, ""), &local(&dest, ""), strict)
        .await
        .unwrap();
    assert_eq!(report.copied, vec!["f.txt"]);
    assert_eq!(read_file(&dest, "f.txt"), b"aaaa");

    ctx.pool.close().await;
}

#[tokio::test]
async fn test_cp_mv_rm_du() {
    let scratch = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    create_file(&work, "tree/one.txt", &[1; 100]);
    create_file(&work, "tree/nested/two.txt", &[2; 50]);

    let ctx = context_with(scratch.path(), CHUNK, &[]);
    let once = RetryConfig::once();

    let recursive = CopyOptions {
        recursive: true,
        ..CopyOptions::default()
    };
    ops::cp(&ctx, &[local(&work, "tree")], &local(&work, "copy"), recursive)
        .await
        .unwrap();
    assert_eq!(
        files_under(&work.path().join("copy")),
        vec!["nested/two.txt", "one.txt"]
    );

    let usage = ops::du(&ctx, &local(&work, "copy"), &once).await.unwrap();
    assert_eq!(usage.last().unwrap().size, 150);
    let summary = ops::format_usage(&local(&work, "copy"), &usage, false, true);
    assert_eq!(summary.len(), 1);
    assert!(summary[0].starts_with("150 "));

    ops::mv(&ctx, &[local(&work, "copy")], &local(&work, "moved"), recursive)
        .await
        .unwrap();
    assert!(!file_exists(&work, "copy"));
    assert_eq!(read_file(&work, "moved/nested/two.txt"), vec![2; 50]);

    let removed = ops::rm(&ctx, &local(&work, "moved"), true).await.unwrap();
    assert_eq!(removed.len(), 2);
    assert!(!file_exists(&work, "moved"));

    assert_eq!(
        ops::hash(&ctx, &local(&work, "tree/one.txt"), &once).await.unwrap(),
        crc32c::crc32c(&[1; 100])
    );
    assert_eq!(
        ops::cat(&ctx, &local(&work, "tree/nested/two.txt"), &once).await.unwrap().as_ref(),
        &[2; 50][..]
    );

    ctx.pool.close().await;
}

#[tokio::test]
async fn test_ls_levels() {
    let scratch = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    create_file(&work, "a.txt", b"a");
    create_file(&work, "d/b.txt", b"b");

    let ctx = context_with(scratch.path(), CHUNK, &[]);
    let once = RetryConfig::once();

    let flat = ops::ls(&ctx, &local(&work, ""), false, &once).await.unwrap();
    assert_eq!(flat.iter().filter(|r| r.is_directory()).count(), 1);
    assert_eq!(flat.iter().filter(|r| r.is_object()).count(), 1);

    let deep = ops::ls(&ctx, &local(&work, ""), true, &once).await.unwrap();
    assert_eq!(deep.len(), 2);
    assert!(deep.iter().all(|r| r.is_object()));

    assert!(matches!(
        ops::ls(&ctx, &local(&work, "nope"), false, &once).await,
        Err(Error::NotFound { .. })
    ));

    ctx.pool.close().await;
}
