//! End-to-end flows through the filesystem operations against an in-memory
//! bucket. No FUSE needed.

use std::sync::Arc;
use std::time::Duration;

use bucketfs::config::FsSettings;
use bucketfs::error::Status;
use bucketfs::fs::ops::{AccessMask, CreateDisposition, CreateMode, FileContext, FileSystemOperations};
use bucketfs::fs::BucketFs;
use bucketfs::store::memory::{MemoryBucket, MemoryStore};

fn mount(bucket: &str) -> (BucketFs, MemoryBucket) {
    let bucket = MemoryStore::new().bucket(bucket);
    let fs = BucketFs::new(Arc::new(bucket.clone()), FsSettings::default());
    (fs, bucket)
}

/// What a shell redirect does: create, write in pieces, close.
fn save(fs: &BucketFs, path: &str, chunks: &[&[u8]]) {
    let mut ctx = FileContext::default();
    let disposition = fs
        .create_file(path, AccessMask::GENERIC_WRITE, CreateMode::CreateNew, &mut ctx)
        .unwrap();
    assert_eq!(disposition, CreateDisposition::Created);
    let mut offset = 0;
    for chunk in chunks {
        offset += fs.write_file(path, chunk, offset, &ctx).unwrap() as u64;
    }
    fs.cleanup(path, &ctx).unwrap();
    fs.close_file(path, &ctx).unwrap();
}

fn read_all(fs: &BucketFs, path: &str) -> Vec<u8> {
    let mut ctx = FileContext::default();
    fs.create_file(path, AccessMask::GENERIC_READ, CreateMode::Open, &mut ctx)
        .unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 4];
    loop {
        let n = fs.read_file(path, &mut buf, out.len() as u64, &ctx).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    fs.cleanup(path, &ctx).unwrap();
    fs.close_file(path, &ctx).unwrap();
    out
}

fn names(fs: &BucketFs, path: &str) -> Vec<String> {
    fs.find_files(path, &FileContext::directory())
        .unwrap()
        .into_iter()
        .map(|f| f.file_name)
        .collect()
}

#[test]
fn project_tree_round_trip() {
    let (fs, bucket) = mount("projects");

    let mut dir = FileContext::directory();
    fs.create_file("/reports", AccessMask::GENERIC_ALL, CreateMode::CreateNew, &mut dir)
        .unwrap();
    assert_eq!(names(&fs, "/"), ["reports"]);

    save(&fs, "/reports/q1.txt", &[b"revenue ", b"up"]);
    save(&fs, "/notes.md", &[b"# notes"]);

    assert_eq!(bucket.get("reports/q1.txt").unwrap().as_ref(), b"revenue up");
    assert_eq!(names(&fs, "/"), ["reports", "notes.md"]);
    assert_eq!(read_all(&fs, "/reports/q1.txt"), b"revenue up");

    let info = fs
        .get_file_information("/reports/q1.txt", &FileContext::default())
        .unwrap();
    assert!(!info.is_directory);
    assert_eq!(info.length, 10);

    fs.move_file("/notes.md", "/reports/notes.md", false, &FileContext::default())
        .unwrap();
    assert_eq!(names(&fs, "/reports"), ["notes.md", "q1.txt"]);
    assert!(!bucket.contains("notes.md"));

    fs.delete_directory("/reports", &FileContext::directory())
        .unwrap();
    assert!(names(&fs, "/").is_empty());
    assert!(bucket.keys().is_empty());
}

#[test]
fn overwrite_replaces_previous_contents() {
    let (fs, bucket) = mount("docs");
    save(&fs, "/a.txt", &[b"first version"]);

    let mut ctx = FileContext::default();
    let disposition = fs
        .create_file("/a.txt", AccessMask::GENERIC_WRITE, CreateMode::Truncate, &mut ctx)
        .unwrap();
    assert_eq!(disposition, CreateDisposition::Opened);
    fs.write_file("/a.txt", b"v2", 0, &ctx).unwrap();
    fs.cleanup("/a.txt", &ctx).unwrap();
    fs.close_file("/a.txt", &ctx).unwrap();

    assert_eq!(bucket.get("a.txt").unwrap().as_ref(), b"v2");
    assert_eq!(read_all(&fs, "/a.txt"), b"v2");
}

#[test]
fn rejected_move_leaves_the_tree_untouched() {
    let (fs, bucket) = mount("docs");
    save(&fs, "/src/lib.rs", &[b"fn main() {}"]);
    save(&fs, "/dst.txt", &[b"keep"]);
    let before = bucket.keys();
    let mutations = bucket.mutations();

    let err = fs
        .move_file("/src", "/moved", false, &FileContext::directory())
        .unwrap_err();
    assert_eq!(err.status(), Status::DirectoryNotEmpty);

    let err = fs
        .move_file("/src/lib.rs", "/dst.txt", false, &FileContext::default())
        .unwrap_err();
    assert_eq!(err.status(), Status::AlreadyExists);

    assert_eq!(bucket.keys(), before);
    assert_eq!(bucket.mutations(), mutations);
}

#[test]
fn external_changes_show_up_after_the_listing_expires() {
    let bucket = MemoryStore::new().bucket("shared");
    let settings = FsSettings {
        listing_ttl: Duration::from_millis(50),
        ..FsSettings::default()
    };
    let fs = BucketFs::new(Arc::new(bucket.clone()), settings);

    assert!(names(&fs, "/").is_empty());
    bucket.insert("uploaded-elsewhere.bin", b"\x00\x01");
    assert!(names(&fs, "/").is_empty());

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(names(&fs, "/"), ["uploaded-elsewhere.bin"]);
}

#[test]
fn browsing_reuses_one_listing() {
    let (fs, bucket) = mount("photos");
    bucket.insert("2024/jan/a.jpg", b"a");
    bucket.insert("2024/feb/b.jpg", b"b");
    bucket.insert("readme.txt", b"r");

    let calls = bucket.list_calls();
    assert_eq!(names(&fs, "/"), ["2024", "readme.txt"]);
    assert_eq!(names(&fs, "/2024"), ["feb", "jan"]);
    fs.get_file_information("/2024/jan/a.jpg", &FileContext::default())
        .unwrap();
    assert_eq!(bucket.list_calls(), calls + 1);

    let jpgs: Vec<_> = fs
        .find_files_with_pattern("/2024/jan", "*.JPG", &FileContext::directory())
        .unwrap()
        .into_iter()
        .map(|f| f.file_name)
        .collect();
    assert_eq!(jpgs, ["a.jpg"]);
}

#[test]
fn rejected_chunk_fails_the_write() {
    let (fs, bucket) = mount("docs");
    bucket.reject_chunks(true);

    let mut ctx = FileContext::default();
    fs.create_file("/big.iso", AccessMask::GENERIC_WRITE, CreateMode::CreateNew, &mut ctx)
        .unwrap();
    let err = fs.write_file("/big.iso", b"data", 0, &ctx).unwrap_err();
    assert_eq!(err.status(), Status::Error);
    assert!(!bucket.contains("big.iso"));
}
