//! Byte storage addressable beyond the limit of a single native buffer.
//!
//! A [`SegmentedBuffer`] is an ordered run of segments, each at most
//! [`SEGMENT_MAX`] bytes, behind one 64-bit logical address space. Every segment
//! but the last is exactly full, so a logical position maps to a segment with one
//! division:
//!
//! ```text
//! index  = position / segment_size
//! offset = position % segment_size
//! ```
//!
//! Segments are either heap memory or read-only windows of a memory-mapped file.
//! Writing into a mapped window first copies it to the heap.

use std::borrow::Cow;
use std::fmt;

use memmap2::Mmap;

use crate::codec::StreamCodec;
use crate::error::{Result, ZipError};

/// Largest segment a buffer will allocate or map (2^31 - 1 bytes).
pub const SEGMENT_MAX: u64 = i32::MAX as u64;

enum Segment {
    Heap(Vec<u8>),
    Mapped(Mmap),
}

impl Segment {
    fn as_slice(&self) -> &[u8] {
        match self {
            Segment::Heap(data) => data,
            Segment::Mapped(map) => map,
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn make_mut(&mut self) -> &mut Vec<u8> {
        if let Segment::Mapped(map) = self {
            *self = Segment::Heap(map.to_vec());
        }
        match self {
            Segment::Heap(data) => data,
            Segment::Mapped(_) => unreachable!("mapped segment was just copied to the heap"),
        }
    }
}

/// Logical byte storage spanning any number of fixed-capacity segments.
pub struct SegmentedBuffer {
    segments: Vec<Segment>,
    size: u64,
    segment_size: u64,
}

impl SegmentedBuffer {
    /// Empty, growable buffer.
    pub fn new() -> Self {
        Self::with_segment_size(SEGMENT_MAX)
    }

    /// Empty buffer with a custom segment capacity (clamped to `1..=SEGMENT_MAX`).
    ///
    /// Small segments make multi-segment behaviour testable without gigabytes of
    /// memory.
    pub fn with_segment_size(segment_size: u64) -> Self {
        Self {
            segments: Vec::new(),
            size: 0,
            segment_size: segment_size.clamp(1, SEGMENT_MAX),
        }
    }

    /// Wrap owned bytes, splitting them if they exceed one segment.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let mut buffer = Self::new();
        if data.len() as u64 <= buffer.segment_size {
            buffer.size = data.len() as u64;
            if !data.is_empty() {
                buffer.segments.push(Segment::Heap(data));
            }
        } else {
            buffer.append(&data);
        }
        buffer
    }

    /// Zero-filled buffer of `size` bytes, segments allocated up front.
    pub fn zeroed(size: u64) -> Self {
        Self::zeroed_with_segment_size(size, SEGMENT_MAX)
    }

    pub fn zeroed_with_segment_size(size: u64, segment_size: u64) -> Self {
        let mut buffer = Self::with_segment_size(segment_size);
        buffer.grow(size);
        buffer
    }

    pub(crate) fn from_mapped(windows: Vec<Mmap>) -> Self {
        let size = windows.iter().map(|w| w.len() as u64).sum();
        Self {
            segments: windows.into_iter().map(Segment::Mapped).collect(),
            size,
            segment_size: SEGMENT_MAX,
        }
    }

    pub(crate) fn from_heap_segments(segments: Vec<Vec<u8>>) -> Self {
        let size = segments.iter().map(|s| s.len() as u64).sum();
        Self {
            segments: segments.into_iter().map(Segment::Heap).collect(),
            size,
            segment_size: SEGMENT_MAX,
        }
    }

    /// Decompress `len` bytes at `offset` of `source` into a new buffer of exactly
    /// `size` bytes.
    ///
    /// Output segments are allocated to the declared size before decoding starts.
    /// Fails with [`ZipError::Format`] if the stream ends early, runs past the
    /// declared size, or never signals completion once all input is consumed.
    pub fn decompressed(
        size: u64,
        source: &SegmentedBuffer,
        offset: u64,
        len: u64,
        codec: &mut dyn StreamCodec,
    ) -> Result<Self> {
        Self::decompressed_with_segment_size(size, source, offset, len, codec, SEGMENT_MAX)
    }

    pub fn decompressed_with_segment_size(
        size: u64,
        source: &SegmentedBuffer,
        offset: u64,
        len: u64,
        codec: &mut dyn StreamCodec,
        segment_size: u64,
    ) -> Result<Self> {
        source.check_range(offset, len)?;
        let mut output = Self::zeroed_with_segment_size(size, segment_size);
        let mut produced: u64 = 0;
        let mut finished = false;
        let mut spill = [0u8; 64];

        source.traverse(offset, len, |chunk| {
            if finished {
                return Ok(0);
            }
            let mut consumed = 0;
            while consumed < chunk.len() {
                let out = output.tail_mut(produced);
                let full = out.is_empty();
                let out = if full { &mut spill[..] } else { out };
                let step = codec.process(&chunk[consumed..], out, false)?;
                if full && step.produced > 0 {
                    return Err(ZipError::format(format!(
                        "inflated data exceeds declared size of {size} bytes"
                    )));
                }
                consumed += step.consumed;
                produced += step.produced as u64;
                if step.done {
                    finished = true;
                    break;
                }
                if step.consumed == 0 && step.produced == 0 {
                    return Err(ZipError::format("deflate stream stalled"));
                }
            }
            Ok(consumed)
        })?;

        // Input exhausted, the engine may still hold buffered output.
        while !finished {
            let out = output.tail_mut(produced);
            if out.is_empty() {
                break;
            }
            let step = codec.process(&[], out, false)?;
            produced += step.produced as u64;
            finished = step.done;
            if step.produced == 0 {
                break;
            }
        }

        if !finished {
            return Err(ZipError::format(format!(
                "compressed stream ended before completion ({produced} of {size} bytes inflated)"
            )));
        }
        if produced != size {
            return Err(ZipError::format(format!(
                "inflated size {produced} does not match declared size {size}"
            )));
        }
        Ok(output)
    }

    /// Logical size in bytes.
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Whether any segment still aliases a memory-mapped file.
    pub fn is_mapped(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Mapped(_)))
    }

    fn locate(&self, position: u64) -> (usize, usize) {
        (
            (position / self.segment_size) as usize,
            (position % self.segment_size) as usize,
        )
    }

    fn check_range(&self, position: u64, len: u64) -> Result<()> {
        match position.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(ZipError::OutOfBounds {
                position,
                len,
                size: self.size,
            }),
        }
    }

    /// Read `len` bytes at `position`.
    ///
    /// Borrows directly from the segment when the range lies within one segment,
    /// otherwise copies the spanning bytes into a new allocation.
    pub fn read(&self, position: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        self.check_range(position, len as u64)?;
        if len == 0 {
            return Ok(Cow::Borrowed(&[]));
        }
        let (index, offset) = self.locate(position);
        let segment = self
            .segments
            .get(index)
            .ok_or(ZipError::OutOfBounds {
                position,
                len: len as u64,
                size: self.size,
            })?
            .as_slice();
        if offset + len <= segment.len() {
            return Ok(Cow::Borrowed(&segment[offset..offset + len]));
        }
        let mut copy = vec![0u8; len];
        self.read_into(position, &mut copy)?;
        Ok(Cow::Owned(copy))
    }

    /// Copy bytes starting at `position` into `dst`, returning how many were
    /// copied (short only at the end of the buffer).
    pub fn read_into(&self, position: u64, dst: &mut [u8]) -> Result<usize> {
        if position > self.size {
            return Err(ZipError::OutOfBounds {
                position,
                len: dst.len() as u64,
                size: self.size,
            });
        }
        let len = (dst.len() as u64).min(self.size - position);
        let mut filled = 0usize;
        self.traverse(position, len, |chunk| {
            dst[filled..filled + chunk.len()].copy_from_slice(chunk);
            filled += chunk.len();
            Ok(chunk.len())
        })?;
        Ok(filled)
    }

    /// Feed the logical range `position..position + len` to `consume` one
    /// segment-bounded slice at a time.
    ///
    /// `consume` reports how many bytes it used. The walk stops early when a call
    /// uses fewer bytes than offered or the segments run out. Returns the total
    /// number of bytes consumed.
    pub fn traverse<F>(&self, position: u64, len: u64, mut consume: F) -> Result<u64>
    where
        F: FnMut(&[u8]) -> Result<usize>,
    {
        let mut done: u64 = 0;
        while done < len {
            let (index, offset) = self.locate(position + done);
            let Some(segment) = self.segments.get(index) else {
                break;
            };
            let segment = segment.as_slice();
            if offset >= segment.len() {
                break;
            }
            let step = (self.segment_size - offset as u64)
                .min(len - done)
                .min((segment.len() - offset) as u64) as usize;
            let used = consume(&segment[offset..offset + step])?;
            done += used as u64;
            if used != step {
                break;
            }
        }
        Ok(done)
    }

    /// Writable remainder of the segment holding `position`; empty at the end of
    /// the buffer.
    fn tail_mut(&mut self, position: u64) -> &mut [u8] {
        if position >= self.size {
            return &mut [];
        }
        let (index, offset) = self.locate(position);
        &mut self.segments[index].make_mut()[offset..]
    }

    /// Grow (never shrink) to `new_size`, zero filling: the trailing segment is
    /// extended up to the segment capacity before new segments are added.
    fn grow(&mut self, new_size: u64) {
        while self.size < new_size {
            let missing = new_size - self.size;
            match self.segments.last_mut() {
                Some(last) if (last.len() as u64) < self.segment_size => {
                    let data = last.make_mut();
                    let target = (data.len() as u64 + missing).min(self.segment_size);
                    let added = target - data.len() as u64;
                    data.resize(target as usize, 0);
                    self.size += added;
                }
                _ => {
                    let len = missing.min(self.segment_size);
                    self.segments.push(Segment::Heap(vec![0u8; len as usize]));
                    self.size += len;
                }
            }
        }
    }

    /// Write `bytes` at `offset`, growing the buffer if the write ends past the
    /// current size. A gap between the old end and `offset` reads as zeros.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or(ZipError::OutOfBounds {
                position: offset,
                len: bytes.len() as u64,
                size: self.size,
            })?;
        self.grow(end);
        self.copy_in(offset, bytes);
        Ok(())
    }

    /// Append `bytes` at the end of the buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        let offset = self.size;
        self.grow(offset + bytes.len() as u64);
        self.copy_in(offset, bytes);
    }

    /// Copy `bytes` into `offset..offset + bytes.len()`, which must already lie
    /// inside the buffer.
    fn copy_in(&mut self, offset: u64, bytes: &[u8]) {
        let mut written = 0usize;
        while written < bytes.len() {
            let (index, start) = self.locate(offset + written as u64);
            let segment = self.segments[index].make_mut();
            let n = (segment.len() - start).min(bytes.len() - written);
            segment[start..start + n].copy_from_slice(&bytes[written..written + n]);
            written += n;
        }
    }

    /// Independent heap copy of `len` bytes at `position`.
    pub fn copy_range(&self, position: u64, len: u64) -> Result<SegmentedBuffer> {
        self.check_range(position, len)?;
        let mut copy = Self::with_segment_size(self.segment_size);
        self.traverse(position, len, |chunk| {
            copy.append(chunk);
            Ok(chunk.len())
        })?;
        Ok(copy)
    }

    /// Whole contents as one contiguous vector.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.size).map_err(|_| ZipError::OutOfBounds {
            position: 0,
            len: self.size,
            size: self.size,
        })?;
        let mut out = vec![0u8; len];
        self.read_into(0, &mut out)?;
        Ok(out)
    }
}

impl Default for SegmentedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SegmentedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentedBuffer")
            .field("size", &self.size)
            .field("segments", &self.segments.len())
            .field("segment_size", &self.segment_size)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
