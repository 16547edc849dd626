//! Serialization of a whole archive.
//!
//! Layout written, in order:
//! 1. Per entry: local file header, name, extra field, compressed data
//! 2. One central directory record per entry
//! 3. ZIP64 end of central directory record and locator, when needed
//! 4. End of central directory record and archive comment
//!
//! ZIP64 extra fields are emitted only for entries whose sizes or offset do not
//! fit in 32 bits.

use std::io::{self, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::codec::CodecPool;
use crate::error::{Result, ZipError};

use super::cache::DecompressionCache;
use super::entry::ArchiveEntry;
use super::store::Compressed;
use super::structures::*;

/// Unix host, format version 3.0.
const VERSION_MADE_BY: u16 = 0x031E;
const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
/// General purpose flag bit 11: name and comment are UTF-8.
const FLAG_UTF8: u16 = 0x0800;

/// Counts bytes written so record offsets can be taken from the stream.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// What an archive write produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub entries: u64,
    pub bytes: u64,
    pub zip64: bool,
}

struct Written {
    entry: Arc<ArchiveEntry>,
    compressed: Compressed,
    lfh_offset: u64,
}

fn saturates(value: u64) -> bool {
    value >= SENTINEL32 as u64
}

fn clamp32(value: u64) -> u32 {
    value.min(SENTINEL32 as u64) as u32
}

fn flags_for(name: &[u8], comment: &[u8]) -> u16 {
    let utf8 = |b: &[u8]| !b.is_ascii() && std::str::from_utf8(b).is_ok();
    if utf8(name) || utf8(comment) {
        FLAG_UTF8
    } else {
        0
    }
}

fn check_len(what: &str, name: &[u8], len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| {
        ZipError::format(format!(
            "{what} of {} is {len} bytes, more than a zip record can hold",
            String::from_utf8_lossy(name)
        ))
    })
}

/// Zip64 extended information block holding the given values.
fn zip64_extra(values: &[u64]) -> Result<Vec<u8>> {
    if values.is_empty() {
        return Ok(Vec::new());
    }
    let mut extra = Vec::with_capacity(4 + 8 * values.len());
    extra.write_u16::<LittleEndian>(ZIP64_EXTRA_ID)?;
    extra.write_u16::<LittleEndian>((8 * values.len()) as u16)?;
    for value in values {
        extra.write_u64::<LittleEndian>(*value)?;
    }
    Ok(extra)
}

/// Write `entries` and `comment` as a complete archive to `out`.
///
/// Every entry is compressed first if it has not been already.
pub fn write_archive<W: Write>(
    out: W,
    entries: &[Arc<ArchiveEntry>],
    comment: &[u8],
    pool: &CodecPool,
    cache: &DecompressionCache,
) -> Result<WriteSummary> {
    let mut out = CountingWriter {
        inner: out,
        written: 0,
    };
    let comment_len = u16::try_from(comment.len()).map_err(|_| {
        ZipError::format(format!("archive comment of {} bytes is too long", comment.len()))
    })?;

    let mut written = Vec::with_capacity(entries.len());
    for entry in entries {
        let compressed = entry.state().compress(pool, cache)?;
        let lfh_offset = out.written;
        write_local(&mut out, entry, &compressed)?;
        written.push(Written {
            entry: entry.clone(),
            compressed,
            lfh_offset,
        });
    }

    let cd_offset = out.written;
    let mut zip64 = false;
    for record in &written {
        zip64 |= write_central(&mut out, record)?;
    }
    let cd_size = out.written - cd_offset;
    let count = written.len() as u64;

    if count >= SENTINEL16 as u64 || saturates(cd_size) || saturates(cd_offset) {
        zip64 = true;
        let eocd64_offset = out.written;
        Zip64EOCD {
            eocd64_size: (Zip64EOCD::MIN_SIZE - 12) as u64,
            version_made_by: VERSION_ZIP64,
            version_needed: VERSION_ZIP64,
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: count,
            total_entries: count,
            cd_size,
            cd_offset,
        }
        .write_to(&mut out)?;
        Zip64EOCDLocator {
            disk_with_eocd64: 0,
            eocd64_offset,
            total_disks: 1,
        }
        .write_to(&mut out)?;
    }

    let count16 = count.min(SENTINEL16 as u64) as u16;
    EndOfCentralDirectory {
        disk_number: 0,
        disk_with_cd: 0,
        disk_entries: count16,
        total_entries: count16,
        cd_size: clamp32(cd_size),
        cd_offset: clamp32(cd_offset),
        comment_len,
    }
    .write_to(&mut out)?;
    out.write_all(comment)?;
    out.flush()?;

    Ok(WriteSummary {
        entries: count,
        bytes: out.written,
        zip64,
    })
}

fn write_local<W: Write>(out: &mut W, entry: &ArchiveEntry, compressed: &Compressed) -> Result<()> {
    let name = entry.name();
    let meta = entry.meta();
    let csize = compressed.data.len();
    let size = compressed.uncompressed_size;
    let large = saturates(csize) || saturates(size);
    let extra = if large {
        zip64_extra(&[size, csize])?
    } else {
        Vec::new()
    };

    LocalHeader {
        version_needed: if large { VERSION_ZIP64 } else { VERSION_DEFAULT },
        flags: flags_for(name, &meta.comment),
        method: compressed.method.as_u16(),
        modified: meta.modified.raw(),
        crc32: compressed.crc32,
        compressed_size: if large { SENTINEL32 } else { csize as u32 },
        uncompressed_size: if large { SENTINEL32 } else { size as u32 },
        name_len: check_len("name", name, name.len())?,
        extra_len: extra.len() as u16,
    }
    .write_to(out)?;
    out.write_all(name)?;
    out.write_all(&extra)?;

    let copied = compressed.data.traverse(|chunk| {
        out.write_all(chunk)?;
        Ok(chunk.len())
    })?;
    if copied != csize {
        return Err(ZipError::format(format!(
            "wrote {copied} of {csize} bytes for {}",
            entry.display_name()
        )));
    }
    Ok(())
}

/// Returns whether the record needed zip64 fields.
fn write_central<W: Write>(out: &mut W, record: &Written) -> Result<bool> {
    let entry = &record.entry;
    let name = entry.name();
    let meta = entry.meta();
    let compressed = &record.compressed;
    let csize = compressed.data.len();
    let size = compressed.uncompressed_size;

    let mut values = Vec::with_capacity(3);
    for value in [size, csize, record.lfh_offset] {
        if saturates(value) {
            values.push(value);
        }
    }
    let extra = zip64_extra(&values)?;
    let zip64 = !values.is_empty();

    CentralHeader {
        version_made_by: VERSION_MADE_BY,
        version_needed: if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT },
        flags: flags_for(name, &meta.comment),
        method: compressed.method.as_u16(),
        modified: meta.modified.raw(),
        crc32: compressed.crc32,
        compressed_size: clamp32(csize),
        uncompressed_size: clamp32(size),
        name_len: check_len("name", name, name.len())?,
        extra_len: extra.len() as u16,
        comment_len: check_len("comment", name, meta.comment.len())?,
        disk_start: 0,
        internal_attrs: 0,
        external_attrs: meta.external_attrs,
        lfh_offset: clamp32(record.lfh_offset),
    }
    .write_to(out)?;
    out.write_all(name)?;
    out.write_all(&extra)?;
    out.write_all(&meta.comment)?;
    Ok(zip64)
}
