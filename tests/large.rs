//! Content beyond a single segment.
//!
//! The full-size case needs more than 10 GiB of memory and disk and is ignored by
//! default; the same boundary arithmetic runs at small scale with tiny segments.

use std::sync::Arc;

use zipvfs::codec::{CodecPool, StreamCodec, new_deflater};
use zipvfs::io::SEGMENT_MAX;
use zipvfs::{ArchiveConfig, CompressionMethod, DirectoryTree, SegmentedBuffer};

fn byte_at(i: u64) -> u8 {
    (i % 251) as u8
}

fn reference(start: u64, len: usize) -> Vec<u8> {
    (start..start + len as u64).map(byte_at).collect()
}

fn patterned(size: u64, segment_size: u64) -> SegmentedBuffer {
    let mut buffer = SegmentedBuffer::with_segment_size(segment_size);
    let mut chunk = Vec::with_capacity(1 << 20);
    let mut written = 0u64;
    while written < size {
        let n = (size - written).min(1 << 20);
        chunk.clear();
        chunk.extend((written..written + n).map(byte_at));
        buffer.append(&chunk);
        written += n;
    }
    buffer
}

#[test]
fn small_segments_straddle_boundaries() {
    let segment = 1000u64;
    let buffer = patterned(10_500, segment);
    assert_eq!(buffer.segment_count(), 11);

    for boundary in [segment, 5 * segment, 10 * segment] {
        let start = boundary - 7;
        let got = buffer.read(start, 20).unwrap();
        assert_eq!(got.as_ref(), reference(start, 20).as_slice());
    }
}

#[test]
fn small_segment_decompression_fills_every_segment() {
    let source = patterned(25_000, 1 << 20);
    let mut deflater = new_deflater(6);
    let mut compressed = Vec::new();
    let mut out = vec![0u8; 64 * 1024];
    let input = source.to_vec().unwrap();
    let mut consumed = 0;
    loop {
        let step = deflater.process(&input[consumed..], &mut out, true).unwrap();
        consumed += step.consumed;
        compressed.extend_from_slice(&out[..step.produced]);
        if step.done {
            break;
        }
    }

    let compressed = SegmentedBuffer::from_vec(compressed);
    let pool = CodecPool::default();
    let inflated = pool
        .with_inflater(|codec| {
            SegmentedBuffer::decompressed_with_segment_size(25_000, &compressed, 0, compressed.len(), codec, 4096)
        })
        .unwrap();
    assert_eq!(inflated.segment_count(), 7);
    assert_eq!(inflated.to_vec().unwrap(), input);
}

#[test]
#[ignore = "writes and reads a 5,000,000,000 byte entry"]
fn five_gigabyte_entry_round_trip() {
    const SIZE: u64 = 5_000_000_000;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("huge.zip");
    let config = ArchiveConfig::default()
        .default_method(CompressionMethod::Stored)
        .cache_budget(0);

    let tree = DirectoryTree::create(&path, config.clone()).unwrap();
    let entry = tree.write_buffer(b"huge.bin", patterned(SIZE, SEGMENT_MAX)).unwrap();
    assert_eq!(entry.metadata().size, SIZE);

    let boundaries = [SEGMENT_MAX, 2 * SEGMENT_MAX];
    for boundary in boundaries {
        let start = boundary - 100;
        assert_eq!(tree.read_at(b"huge.bin", start, 200).unwrap(), reference(start, 200));
    }
    let summary = tree.flush().unwrap().unwrap();
    assert!(summary.zip64);
    drop(entry);
    tree.close().unwrap();

    let tree = Arc::new(DirectoryTree::open(&path, config).unwrap());
    let meta = tree.metadata(b"huge.bin").unwrap();
    assert_eq!(meta.size, SIZE);
    assert_eq!(meta.compressed_size, Some(SIZE));
    for boundary in boundaries {
        let start = boundary - 100;
        assert_eq!(tree.read_at(b"huge.bin", start, 200).unwrap(), reference(start, 200));
    }
    let tail = tree.read_at(b"huge.bin", SIZE - 10, 10).unwrap();
    assert_eq!(tail, reference(SIZE - 10, 10));
}
