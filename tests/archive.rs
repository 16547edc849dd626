use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use zipvfs::zip::{
    ArchiveEntry, CompressionState, EndOfCentralDirectory, EntryMeta, write_archive,
};
use zipvfs::{ArchiveConfig, CompressionMethod, DirectoryTree, DosDateTime, SegmentedBuffer, ZipError};

fn name_set(tree: &DirectoryTree) -> BTreeSet<String> {
    tree.names()
        .into_iter()
        .map(|n| String::from_utf8(n).unwrap())
        .collect()
}

#[test]
fn create_flush_reopen_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("round.zip");

    let tree = DirectoryTree::create(&path, ArchiveConfig::default()).unwrap();
    tree.create_directory(b"a/").unwrap();
    tree.write(b"a/b.txt", b"hello").unwrap();
    tree.flush().unwrap();
    let before = name_set(&tree);

    let reopened = DirectoryTree::open(&path, ArchiveConfig::default()).unwrap();
    assert_eq!(name_set(&reopened), before);
    assert_eq!(reopened.read(b"a/b.txt").unwrap(), b"hello");
    let meta = reopened.metadata(b"a/b.txt").unwrap();
    assert_eq!(meta.method, CompressionMethod::Deflate);
    assert_eq!(meta.size, 5);
    assert_eq!(meta.crc32, Some(crc32fast::hash(b"hello")));
    assert!(!reopened.is_dirty());
    reopened.check_consistency().unwrap();
}

#[test]
fn stored_entry_crc() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stored.zip");
    let config = ArchiveConfig::default().default_method(CompressionMethod::Stored);

    let tree = DirectoryTree::create(&path, config.clone()).unwrap();
    tree.write(b"x.txt", b"abc").unwrap();
    tree.close().unwrap();

    let tree = DirectoryTree::open(&path, config).unwrap();
    assert_eq!(tree.read(b"x.txt").unwrap(), b"abc");
    let meta = tree.metadata(b"x.txt").unwrap();
    assert_eq!(meta.method, CompressionMethod::Stored);
    assert_eq!(meta.crc32, Some(0x352441C2));
    assert_eq!(meta.compressed_size, Some(3));
}

#[test]
fn comment_with_embedded_end_record_survives() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("comment.zip");

    let mut fake = Vec::new();
    EndOfCentralDirectory::default().write_to(&mut fake).unwrap();
    let mut comment = b"built by ci; ".to_vec();
    comment.extend_from_slice(&fake);
    comment.extend_from_slice(b"; trailing text");

    let tree = DirectoryTree::create(&path, ArchiveConfig::default()).unwrap();
    tree.write(b"x.txt", b"abc").unwrap();
    tree.set_comment(&comment).unwrap();
    tree.set_entry_comment(b"x.txt", b"per entry").unwrap();
    tree.close().unwrap();

    let tree = DirectoryTree::open(&path, ArchiveConfig::default()).unwrap();
    assert_eq!(tree.comment(), comment);
    assert_eq!(name_set(&tree), BTreeSet::from(["x.txt".to_string()]));
    assert_eq!(tree.metadata(b"x.txt").unwrap().comment, b"per entry");
}

#[test]
fn missing_parent_directories_are_synthesized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sparse.zip");

    let entry = Arc::new(ArchiveEntry::new(
        1,
        b"a/b/c.txt".to_vec(),
        EntryMeta::default(),
        CompressionState::written(1, CompressionMethod::Deflate, SegmentedBuffer::from_vec(b"deep".to_vec())),
    ));
    let pool = zipvfs::codec::CodecPool::default();
    let cache = zipvfs::zip::DecompressionCache::new(1 << 20);
    write_archive(fs::File::create(&path).unwrap(), &[entry], b"", &pool, &cache).unwrap();

    let tree = DirectoryTree::open(&path, ArchiveConfig::default()).unwrap();
    assert_eq!(
        name_set(&tree),
        BTreeSet::from(["a/".to_string(), "a/b/".to_string(), "a/b/c.txt".to_string()])
    );
    assert_eq!(tree.children(b"a/").unwrap(), vec![b"a/b/".to_vec()]);
    assert_eq!(tree.read(b"a/b/c.txt").unwrap(), b"deep");
    tree.check_consistency().unwrap();
}

#[test]
fn garbage_file_is_truncated_archive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk.zip");
    fs::write(&path, vec![0x55u8; 4096]).unwrap();
    assert!(matches!(
        DirectoryTree::open(&path, ArchiveConfig::default()),
        Err(ZipError::TruncatedArchive { size: 4096 })
    ));
}

#[test]
fn read_only_archives_reject_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.zip");
    let tree = DirectoryTree::create(&path, ArchiveConfig::default()).unwrap();
    tree.write(b"keep.txt", b"data").unwrap();
    tree.close().unwrap();
    let before = fs::read(&path).unwrap();

    let tree = DirectoryTree::open(&path, ArchiveConfig::default().read_only(true)).unwrap();
    assert!(matches!(tree.write(b"new.txt", b""), Err(ZipError::ReadOnly)));
    assert!(matches!(tree.remove(b"keep.txt"), Err(ZipError::ReadOnly)));
    assert_eq!(tree.read(b"keep.txt").unwrap(), b"data");
    assert!(tree.flush().unwrap().is_none());
    tree.close().unwrap();
    assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn edits_to_an_opened_archive_persist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edit.zip");
    let tree = DirectoryTree::create(&path, ArchiveConfig::default()).unwrap();
    tree.create_directories(b"src/main/").unwrap();
    tree.write(b"src/main/App.java", b"class App {}").unwrap();
    tree.write(b"README", b"readme").unwrap();
    tree.close().unwrap();

    // Mapped archive: the rewrite replaces the file the map still points into.
    let tree = DirectoryTree::open(&path, ArchiveConfig::default()).unwrap();
    tree.rename(b"README", b"src/README", false).unwrap();
    tree.copy(b"src/main/App.java", b"src/main/Copy.java", false).unwrap();
    tree.write(b"src/main/App.java", b"class App { int x; }").unwrap();
    let modified = DosDateTime::from_parts(0x6B2F, 0x54CF);
    tree.set_last_modified(b"src/README", modified).unwrap();
    tree.set_external_attributes(b"src/README", 0o100644 << 16).unwrap();
    tree.flush().unwrap();
    assert_eq!(tree.read(b"src/main/Copy.java").unwrap(), b"class App {}");
    tree.close().unwrap();

    let tree = DirectoryTree::open(&path, ArchiveConfig::default()).unwrap();
    assert_eq!(
        name_set(&tree),
        BTreeSet::from(
            ["src/", "src/main/", "src/main/App.java", "src/main/Copy.java", "src/README"]
                .map(String::from)
        )
    );
    assert_eq!(tree.read(b"src/main/App.java").unwrap(), b"class App { int x; }");
    assert_eq!(tree.read(b"src/main/Copy.java").unwrap(), b"class App {}");
    let meta = tree.metadata(b"src/README").unwrap();
    assert_eq!(meta.modified, modified);
    assert_eq!(meta.unix_mode(), Some(0o100644));
    assert_eq!(tree.read(b"src/README").unwrap(), b"readme");
}

#[test]
fn insertion_order_is_kept_when_requested() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ordered.zip");
    let config = ArchiveConfig::default().maintain_order(true);
    let tree = DirectoryTree::create(&path, config.clone()).unwrap();
    for name in ["z.txt", "m.txt", "a.txt"] {
        tree.write(name.as_bytes(), name.as_bytes()).unwrap();
    }
    tree.close().unwrap();

    let buffer = zipvfs::io::open_file(&path, false).unwrap();
    let directory = zipvfs::zip::ArchiveReader::new(&buffer).read().unwrap();
    let order: Vec<&[u8]> = directory.entries.iter().map(|e| e.name.as_slice()).collect();
    assert_eq!(order, vec![&b"z.txt"[..], &b"m.txt"[..], &b"a.txt"[..]]);
}

#[test]
fn evicted_content_is_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.zip");
    let text: Vec<u8> = (0..20_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let tree = DirectoryTree::create(&path, ArchiveConfig::default()).unwrap();
    tree.write(b"one", &text).unwrap();
    tree.write(b"two", &text).unwrap();
    tree.close().unwrap();

    let tree = DirectoryTree::open(&path, ArchiveConfig::default().cache_budget(25_000)).unwrap();
    let first = tree.read(b"one").unwrap();
    // Loading the second entry evicts the first.
    assert_eq!(tree.read(b"two").unwrap(), text);
    assert_eq!(tree.cache().bytes(), 20_000);
    let again = tree.read(b"one").unwrap();
    assert_eq!(first, text);
    assert_eq!(again, text);
}

#[test]
fn many_entries_use_zip64_end_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("many.zip");
    let config = ArchiveConfig::default().default_method(CompressionMethod::Stored);
    let tree = DirectoryTree::create(&path, config.clone()).unwrap();
    let count = 70_000u32;
    for i in 0..count {
        tree.write(format!("{i}").as_bytes(), b"").unwrap();
    }
    let summary = tree.flush().unwrap().unwrap();
    assert!(summary.zip64);
    assert_eq!(summary.entries, count as u64);

    let tree = DirectoryTree::open(&path, config).unwrap();
    assert_eq!(tree.len(), count as usize);
    assert!(tree.exists(b"69999"));
}

#[test]
fn entry_reader_and_append_writer() {
    use std::io::{Read, Seek, SeekFrom, Write};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("streams.zip");
    let tree = DirectoryTree::create(&path, ArchiveConfig::default()).unwrap();
    let mut writer = tree.writer(b"log", false).unwrap();
    writer.write_all(b"first\n").unwrap();
    writer.commit().unwrap();
    tree.close().unwrap();

    let tree = DirectoryTree::open(&path, ArchiveConfig::default()).unwrap();
    let mut writer = tree.writer(b"log", true).unwrap();
    writer.write_all(b"second\n").unwrap();
    writer.commit().unwrap();

    let mut reader = tree.reader(b"log").unwrap();
    reader.seek(SeekFrom::Start(6)).unwrap();
    let mut tail = String::new();
    reader.read_to_string(&mut tail).unwrap();
    assert_eq!(tail, "second\n");
}
