use std::fs::File;
use std::io::Read;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use tracing::{debug, warn};

use super::segmented::{SEGMENT_MAX, SegmentedBuffer};
use crate::error::Result;

/// Load a local file as a [`SegmentedBuffer`].
///
/// The whole file is mapped read-only in [`SEGMENT_MAX`]-sized windows when
/// `prefer_mmap` is set. If mapping fails for any reason, or is disabled, the file
/// is streamed into heap segments instead.
pub fn open_file(path: &Path, prefer_mmap: bool) -> Result<SegmentedBuffer> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();

    if size == 0 {
        return Ok(SegmentedBuffer::new());
    }

    if prefer_mmap {
        match map_windows(&file, size) {
            Ok(windows) => {
                debug!(path = %path.display(), size, windows = windows.len(), "mapped archive");
                return Ok(SegmentedBuffer::from_mapped(windows));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "memory mapping failed, reading into memory");
            }
        }
    }

    read_fully(file, size)
}

fn map_windows(file: &File, size: u64) -> std::io::Result<Vec<Mmap>> {
    let mut windows = Vec::with_capacity(size.div_ceil(SEGMENT_MAX) as usize);
    let mut offset = 0u64;
    while offset < size {
        let len = (size - offset).min(SEGMENT_MAX) as usize;
        // SAFETY: the map is read-only. Flushing never writes through this file:
        // replacement archives are renamed over the path, which leaves the mapped
        // inode intact for as long as the map lives.
        let window = unsafe { MmapOptions::new().offset(offset).len(len).map(file)? };
        windows.push(window);
        offset += len as u64;
    }
    Ok(windows)
}

fn read_fully(mut file: File, size: u64) -> Result<SegmentedBuffer> {
    let mut segments = Vec::with_capacity(size.div_ceil(SEGMENT_MAX) as usize);
    let mut remaining = size;
    while remaining > 0 {
        let len = remaining.min(SEGMENT_MAX) as usize;
        let mut segment = vec![0u8; len];
        file.read_exact(&mut segment)?;
        segments.push(segment);
        remaining -= len as u64;
    }
    debug!(size, segments = segments.len(), "read archive into memory");
    Ok(SegmentedBuffer::from_heap_segments(segments))
}
