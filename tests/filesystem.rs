//! Integration tests driving the `FileSystem` facade through the seed
//! scenarios and laws this engine is expected to satisfy.

use quadfs::{Config, FileSystem, FsError};

fn small_fs() -> FileSystem {
    let _ = env_logger::builder().is_test(true).try_init();
    FileSystem::new(Config {
        total_blocks: 64,
        inode_capacity: 64,
        inode_hash_capacity: 64,
        wal_bytes: 64 * 1024,
        tree_node_capacity: 64,
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn create_write_commit_and_read_back() {
    // Seed scenario 1: create, write, commit, read back.
    let fs = small_fs();
    fs.create_dir("/a", 0o755).unwrap();
    fs.create_file("/a/b.txt", 0o644).unwrap();
    fs.write("/a/b.txt", 0, b"hello").unwrap();

    let mut buf = [0u8; 5];
    let n = fs.read("/a/b.txt", 0, &mut buf).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf, b"hello");
}

#[test]
fn sparse_write_leaves_a_hole_that_reads_as_zero() {
    // Seed scenario 3: write at 0, write at 8192 -> hole in between.
    let fs = small_fs();
    fs.create_file("/sparse", 0o644).unwrap();
    fs.write("/sparse", 0, &[1u8; 4096]).unwrap();
    fs.write("/sparse", 8192, &[2u8; 4096]).unwrap();

    let mut hole = [0xffu8; 4096];
    let n = fs.read("/sparse", 4096, &mut hole).unwrap();
    assert_eq!(n, 4096);
    assert!(hole.iter().all(|&b| b == 0));

    let mut tail = [0u8; 4096];
    fs.read("/sparse", 8192, &mut tail).unwrap();
    assert!(tail.iter().all(|&b| b == 2));
}

#[test]
fn thirteenth_inline_child_overflows() {
    // Seed scenario 4.
    let fs = small_fs();
    fs.create_dir("/d", 0o755).unwrap();
    for i in 0..12 {
        fs.create_file(&format!("/d/f{i}"), 0o644).unwrap();
    }
    assert_eq!(fs.create_file("/d/f12", 0o644), Err(FsError::NoSpace));
}

#[test]
fn hardlink_survives_original_unlink_until_last_link_drops() {
    // Seed scenario 6.
    let fs = small_fs();
    fs.create_file("/a", 0o644).unwrap();
    fs.write("/a", 0, b"original bytes").unwrap();
    fs.link("/a", "/b").unwrap();

    fs.unlink("/a").unwrap();
    assert_eq!(fs.stat("/b").unwrap().nlink, 1);

    let mut buf = [0u8; 14];
    fs.read("/b", 0, &mut buf).unwrap();
    assert_eq!(&buf, b"original bytes");

    fs.unlink("/b").unwrap();
    assert_eq!(fs.stat("/b"), Err(FsError::NotFound));
}

#[test]
fn round_trip_law_unlink_then_recreate_gets_a_larger_inode() {
    let fs = small_fs();
    let first = fs.create_file("/p", 0o644).unwrap();
    fs.unlink("/p").unwrap();
    let second = fs.create_file("/p", 0o644).unwrap();
    assert!(second > first);
}

#[test]
fn checkpoint_and_retry_recovers_from_a_full_log() {
    let fs = FileSystem::new(Config {
        total_blocks: 16,
        inode_capacity: 16,
        inode_hash_capacity: 16,
        wal_bytes: 256,
        tree_node_capacity: 16,
        ..Default::default()
    })
    .unwrap();
    fs.create_file("/a", 0o644).unwrap();
    let result = fs.checkpoint_and_retry(|| fs.write("/a", 0, b"x"));
    assert!(result.is_ok());
}

#[test]
fn directory_removal_is_refused_while_nonempty() {
    let fs = small_fs();
    fs.create_dir("/d", 0o755).unwrap();
    fs.create_file("/d/f", 0o644).unwrap();
    assert_eq!(fs.rmdir("/d"), Err(FsError::NotEmpty));
    fs.unlink("/d/f").unwrap();
    fs.rmdir("/d").unwrap();
}

#[test]
fn rename_moves_a_node_under_a_new_parent() {
    let fs = small_fs();
    fs.create_dir("/src", 0o755).unwrap();
    fs.create_dir("/dst", 0o755).unwrap();
    fs.create_file("/src/f", 0o644).unwrap();
    fs.rename("/src/f", "/dst/f").unwrap();
    assert!(fs.stat("/dst/f").is_ok());
    assert_eq!(fs.stat("/src/f"), Err(FsError::NotFound));
}
