//! Per-entry content: the compressed and uncompressed projections and the
//! transforms between them.
//!
//! Entries loaded from an archive start with the compressed projection only;
//! entries written through the tree start with the uncompressed projection only.
//! Whichever side is missing is derived on demand. Once an entry has a compressed
//! projection it is kept strongly, and the uncompressed side moves into the
//! [`DecompressionCache`] where it may be evicted and later recomputed.

use std::sync::{Arc, Weak};

use tracing::debug;

use crate::codec::{CodecPool, StreamCodec};
use crate::error::{Result, ZipError};
use crate::io::SegmentedBuffer;

use super::cache::DecompressionCache;
use super::structures::CompressionMethod;

/// Output chunk for the deflate loop.
const DEFLATE_CHUNK: usize = 64 * 1024;

/// A byte range of a shared buffer.
#[derive(Clone)]
pub struct Slice {
    pub data: Arc<SegmentedBuffer>,
    pub offset: u64,
    pub len: u64,
}

impl Slice {
    pub fn new(data: Arc<SegmentedBuffer>, offset: u64, len: u64) -> Self {
        Self { data, offset, len }
    }

    pub fn whole(data: Arc<SegmentedBuffer>) -> Self {
        let len = data.len();
        Self {
            data,
            offset: 0,
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `dst.len()` bytes starting at `position` within the slice.
    pub fn read_into(&self, position: u64, dst: &mut [u8]) -> Result<usize> {
        self.check(position, dst.len() as u64)?;
        self.data.read_into(self.offset + position, dst)
    }

    /// Feed the slice to `consume` segment by segment.
    pub fn traverse<F>(&self, consume: F) -> Result<u64>
    where
        F: FnMut(&[u8]) -> Result<usize>,
    {
        self.data.traverse(self.offset, self.len, consume)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.len).map_err(|_| ZipError::OutOfBounds {
            position: 0,
            len: self.len,
            size: self.len,
        })?;
        let mut out = vec![0u8; len];
        self.data.read_into(self.offset, &mut out)?;
        Ok(out)
    }

    fn check(&self, position: u64, len: u64) -> Result<()> {
        match position.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(ZipError::OutOfBounds {
                position,
                len,
                size: self.len,
            }),
        }
    }
}

impl std::fmt::Debug for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slice")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// The uncompressed side of an entry.
#[derive(Debug, Clone, Default)]
enum Projection {
    #[default]
    Absent,
    /// Authoritative content written through the tree
    Strong(Arc<SegmentedBuffer>),
    /// Derived content, strongly held by the cache while it fits
    Weak(Weak<SegmentedBuffer>),
}

/// Compressed form of an entry, ready to be written.
#[derive(Debug, Clone)]
pub struct Compressed {
    pub method: CompressionMethod,
    pub crc32: u32,
    pub uncompressed_size: u64,
    pub data: Slice,
}

/// Compression state of one entry.
#[derive(Debug, Clone)]
pub struct CompressionState {
    method: CompressionMethod,
    crc32: Option<u32>,
    uncompressed_size: u64,
    compressed: Option<Slice>,
    uncompressed: Projection,
    /// Cache slot of the derived uncompressed projection
    key: u64,
}

impl CompressionState {
    /// State of an entry read from an archive: only the compressed bytes exist.
    pub fn loaded(
        key: u64,
        method: CompressionMethod,
        crc32: u32,
        uncompressed_size: u64,
        compressed: Slice,
    ) -> Self {
        Self {
            method,
            crc32: Some(crc32),
            uncompressed_size,
            compressed: Some(compressed),
            uncompressed: Projection::Absent,
            key,
        }
    }

    /// State of an entry whose content was just written.
    pub fn written(key: u64, method: CompressionMethod, content: SegmentedBuffer) -> Self {
        Self {
            method,
            crc32: None,
            uncompressed_size: content.len(),
            compressed: None,
            uncompressed: Projection::Strong(Arc::new(content)),
            key,
        }
    }

    pub fn empty(key: u64, method: CompressionMethod) -> Self {
        Self::written(key, method, SegmentedBuffer::new())
    }

    /// Copy sharing the same content buffers under a different cache slot.
    pub fn share(&self, key: u64) -> Self {
        Self { key, ..self.clone() }
    }

    /// Swap in new authoritative content. The compressed form is discarded.
    pub fn replace(&mut self, method: CompressionMethod, content: SegmentedBuffer, cache: &DecompressionCache) {
        cache.remove(self.key);
        *self = Self::written(self.key, method, content);
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    /// Known once the entry was loaded or compressed.
    pub fn crc32(&self) -> Option<u32> {
        self.crc32
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    pub fn compressed_size(&self) -> Option<u64> {
        self.compressed.as_ref().map(Slice::len)
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed.is_some()
    }

    /// Produce (or return the retained) compressed projection.
    ///
    /// # Errors
    ///
    /// - [`ZipError::Consistency`] when neither projection is available
    /// - [`ZipError::UnsupportedMethod`] for methods other than STORED and DEFLATE
    /// - [`ZipError::Format`] when the deflate engine fails to finish
    pub fn compress(&mut self, pool: &CodecPool, cache: &DecompressionCache) -> Result<Compressed> {
        if let Some(data) = &self.compressed {
            return Ok(Compressed {
                method: self.method,
                crc32: self.crc32.unwrap_or(0),
                uncompressed_size: self.uncompressed_size,
                data: data.clone(),
            });
        }

        let source = match &self.uncompressed {
            Projection::Strong(buffer) => buffer.clone(),
            Projection::Weak(weak) => weak.upgrade().ok_or_else(|| {
                ZipError::Consistency("uncompressed content was evicted before compression".into())
            })?,
            Projection::Absent => {
                return Err(ZipError::Consistency("entry has no content to compress".into()));
            }
        };

        let (data, crc32) = match self.method {
            CompressionMethod::Stored => {
                let crc32 = checksum(&Slice::whole(source.clone()))?;
                (Slice::whole(source.clone()), crc32)
            }
            CompressionMethod::Deflate => {
                let (out, crc32) = pool.with_deflater(|codec| deflate(&source, codec))?;
                debug!(
                    key = self.key,
                    input = source.len(),
                    output = out.len(),
                    "deflated entry content"
                );
                (Slice::whole(Arc::new(out)), crc32)
            }
            other => return Err(other.unsupported()),
        };

        self.crc32 = Some(crc32);
        self.compressed = Some(data.clone());
        // The compressed form is durable from here on.
        if self.method != CompressionMethod::Stored {
            self.uncompressed = Projection::Weak(Arc::downgrade(&source));
            cache.insert(self.key, source);
        }

        Ok(Compressed {
            method: self.method,
            crc32,
            uncompressed_size: self.uncompressed_size,
            data,
        })
    }

    /// Produce (or return the cached) uncompressed projection.
    ///
    /// # Errors
    ///
    /// - [`ZipError::UnsupportedMethod`] for methods other than STORED and DEFLATE
    /// - [`ZipError::Format`] for truncated, corrupt or mis-sized deflate streams
    pub fn decompress(&mut self, pool: &CodecPool, cache: &DecompressionCache) -> Result<Slice> {
        match &self.uncompressed {
            Projection::Strong(buffer) => return Ok(Slice::whole(buffer.clone())),
            Projection::Weak(weak) => {
                if let Some(buffer) = weak.upgrade() {
                    cache.touch(self.key);
                    return Ok(Slice::whole(buffer));
                }
                debug!(key = self.key, "decompressed content was evicted, recomputing");
            }
            Projection::Absent => {}
        }

        let compressed = self
            .compressed
            .clone()
            .ok_or_else(|| ZipError::Consistency("entry has no content".into()))?;

        match self.method {
            CompressionMethod::Stored => {
                if compressed.len() != self.uncompressed_size {
                    return Err(ZipError::format(format!(
                        "stored entry declares {} bytes but holds {}",
                        self.uncompressed_size,
                        compressed.len()
                    )));
                }
                Ok(compressed)
            }
            CompressionMethod::Deflate => {
                let size = self.uncompressed_size;
                let buffer = pool.with_inflater(|codec| {
                    SegmentedBuffer::decompressed(
                        size,
                        &compressed.data,
                        compressed.offset,
                        compressed.len,
                        codec,
                    )
                })?;
                let buffer = Arc::new(buffer);
                self.uncompressed = Projection::Weak(Arc::downgrade(&buffer));
                cache.insert(self.key, buffer.clone());
                Ok(Slice::whole(buffer))
            }
            other => Err(other.unsupported()),
        }
    }
}

/// CRC32 of a slice.
pub fn checksum(slice: &Slice) -> Result<u32> {
    let mut hasher = crc32fast::Hasher::new();
    slice.traverse(|chunk| {
        hasher.update(chunk);
        Ok(chunk.len())
    })?;
    Ok(hasher.finalize())
}

/// Raw-deflate `source` into a new buffer, computing the CRC32 of the input on the way.
fn deflate(source: &SegmentedBuffer, codec: &mut dyn StreamCodec) -> Result<(SegmentedBuffer, u32)> {
    let mut out = SegmentedBuffer::new();
    let mut hasher = crc32fast::Hasher::new();
    let mut chunk_out = vec![0u8; DEFLATE_CHUNK];

    let fed = source.traverse(0, source.len(), |chunk| {
        hasher.update(chunk);
        let mut consumed = 0;
        while consumed < chunk.len() {
            let step = codec.process(&chunk[consumed..], &mut chunk_out, false)?;
            out.append(&chunk_out[..step.produced]);
            consumed += step.consumed;
            if step.consumed == 0 && step.produced == 0 {
                return Err(ZipError::format("deflate stream stalled"));
            }
        }
        Ok(consumed)
    })?;
    if fed != source.len() {
        return Err(ZipError::format(format!(
            "deflate consumed {fed} of {} input bytes",
            source.len()
        )));
    }

    loop {
        let step = codec.process(&[], &mut chunk_out, true)?;
        out.append(&chunk_out[..step.produced]);
        if step.done {
            break;
        }
        if step.produced == 0 {
            return Err(ZipError::format("deflate stream did not finish"));
        }
    }

    Ok((out, hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixtures() -> (CodecPool, DecompressionCache) {
        (CodecPool::new(6), DecompressionCache::new(1 << 20))
    }

    fn loaded_from(compressed: &Compressed, key: u64) -> CompressionState {
        CompressionState::loaded(
            key,
            compressed.method,
            compressed.crc32,
            compressed.uncompressed_size,
            compressed.data.clone(),
        )
    }

    #[test]
    fn stored_abc_has_known_crc() {
        let (pool, cache) = fixtures();
        let mut state = CompressionState::written(1, CompressionMethod::Stored, SegmentedBuffer::from_vec(b"abc".to_vec()));
        let compressed = state.compress(&pool, &cache).unwrap();
        assert_eq!(compressed.crc32, 0x352441C2);
        assert_eq!(compressed.data.to_vec().unwrap(), b"abc");

        let mut loaded = loaded_from(&compressed, 2);
        assert_eq!(loaded.decompress(&pool, &cache).unwrap().to_vec().unwrap(), b"abc");
    }

    #[test]
    fn deflate_round_trip_and_crc() {
        let (pool, cache) = fixtures();
        let text = b"the quick brown fox jumps over the lazy dog. ".repeat(500);
        let mut state = CompressionState::written(
            1,
            CompressionMethod::Deflate,
            SegmentedBuffer::from_vec(text.clone()),
        );
        let compressed = state.compress(&pool, &cache).unwrap();
        assert!(compressed.data.len() < text.len() as u64);
        assert_eq!(compressed.crc32, crc32fast::hash(&text));

        let mut loaded = loaded_from(&compressed, 2);
        assert_eq!(loaded.decompress(&pool, &cache).unwrap().to_vec().unwrap(), text);
        assert_eq!(pool.idle_inflaters(), 1);
        assert_eq!(pool.idle_deflaters(), 1);
    }

    #[test]
    fn compress_is_retained() {
        let (pool, cache) = fixtures();
        let mut state = CompressionState::written(1, CompressionMethod::Deflate, SegmentedBuffer::from_vec(vec![1; 1000]));
        let first = state.compress(&pool, &cache).unwrap();
        let second = state.compress(&pool, &cache).unwrap();
        assert!(Arc::ptr_eq(&first.data.data, &second.data.data));
    }

    #[test]
    fn eviction_forces_recompute_with_equal_content() {
        let pool = CodecPool::new(6);
        let cache = DecompressionCache::new(4096);
        let text: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let compressed = CompressionState::written(1, CompressionMethod::Deflate, SegmentedBuffer::from_vec(text.clone()))
            .compress(&pool, &cache)
            .unwrap();
        cache.clear();

        let mut state = loaded_from(&compressed, 7);
        let first = state.decompress(&pool, &cache).unwrap().to_vec().unwrap();
        assert!(cache.contains(7));
        cache.clear();
        let second = state.decompress(&pool, &cache).unwrap().to_vec().unwrap();
        assert_eq!(first, text);
        assert_eq!(second, text);
    }

    #[test]
    fn missing_content_is_a_consistency_error() {
        let (pool, cache) = fixtures();
        let mut state = CompressionState::written(1, CompressionMethod::Deflate, SegmentedBuffer::new());
        state.uncompressed = Projection::Absent;
        assert!(matches!(state.compress(&pool, &cache), Err(ZipError::Consistency(_))));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let (pool, cache) = fixtures();
        let bytes = Arc::new(SegmentedBuffer::from_vec(vec![0; 4]));
        let mut state = CompressionState::loaded(1, CompressionMethod::from_u16(12), 0, 4, Slice::whole(bytes));
        assert!(matches!(
            state.decompress(&pool, &cache),
            Err(ZipError::UnsupportedMethod { method: 12, name: "bzip2" })
        ));
    }

    #[test]
    fn truncated_deflate_stream_fails() {
        let (pool, cache) = fixtures();
        let text = vec![42u8; 10_000];
        let compressed = CompressionState::written(1, CompressionMethod::Deflate, SegmentedBuffer::from_vec(text))
            .compress(&pool, &cache)
            .unwrap();
        let cut = Slice::new(compressed.data.data.clone(), 0, compressed.data.len() / 2);
        let mut state = CompressionState::loaded(2, CompressionMethod::Deflate, compressed.crc32, 10_000, cut);
        assert!(matches!(state.decompress(&pool, &cache), Err(ZipError::Format(_))));
        // The engine went back to the pool despite the failure.
        assert_eq!(pool.idle_inflaters(), 1);
    }

    #[test]
    fn declared_size_too_small_fails() {
        let (pool, cache) = fixtures();
        let compressed = CompressionState::written(1, CompressionMethod::Deflate, SegmentedBuffer::from_vec(vec![5u8; 5000]))
            .compress(&pool, &cache)
            .unwrap();
        let mut state = CompressionState::loaded(2, CompressionMethod::Deflate, compressed.crc32, 100, compressed.data);
        assert!(matches!(state.decompress(&pool, &cache), Err(ZipError::Format(_))));
    }

    #[test]
    fn empty_content_deflates() {
        let (pool, cache) = fixtures();
        let compressed = CompressionState::empty(1, CompressionMethod::Deflate)
            .compress(&pool, &cache)
            .unwrap();
        assert_eq!(compressed.crc32, 0);
        let mut loaded = loaded_from(&compressed, 2);
        assert!(loaded.decompress(&pool, &cache).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn round_trip(data in proptest::collection::vec(any::<u8>(), 0..20_000), stored in any::<bool>()) {
            let (pool, cache) = fixtures();
            let method = if stored { CompressionMethod::Stored } else { CompressionMethod::Deflate };
            let compressed = CompressionState::written(1, method, SegmentedBuffer::from_vec(data.clone()))
                .compress(&pool, &cache)
                .unwrap();
            prop_assert_eq!(compressed.crc32, crc32fast::hash(&data));
            let mut loaded = loaded_from(&compressed, 2);
            prop_assert_eq!(loaded.decompress(&pool, &cache).unwrap().to_vec().unwrap(), data);
        }
    }
}
