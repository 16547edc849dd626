//! Low-level ZIP archive parser.
//!
//! This module locates and decodes the directory structures of an archive held in
//! a [`SegmentedBuffer`]. Nothing is decompressed here: every entry is returned as
//! a byte range of the buffer.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Scan backwards for an End of Central Directory (EOCD) signature whose
//!    comment length reaches exactly to the end of the buffer
//! 2. If a ZIP64 locator precedes it, prefer the ZIP64 EOCD values
//! 3. Walk the Central Directory, applying ZIP64 extra fields
//! 4. Read each Local File Header to find where the entry data starts
//!
//! A comment may itself contain the EOCD signature. Such a false candidate either
//! fails the comment-length check or fails while its directory is parsed; in the
//! latter case the scan moves on to the next older candidate.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use tracing::{debug, warn};

use crate::error::{Result, ZipError};
use crate::io::SegmentedBuffer;

use super::structures::*;

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for EOCD with a comment.
const MAX_COMMENT_SIZE: u64 = 65535;

/// Bytes examined per backward scan step.
const SCAN_WINDOW: u64 = 4096;

/// Number of rejected candidates quoted in the final error.
const MAX_REPORTED_FAILURES: usize = 3;

/// Directory record of one entry, with its data located in the archive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub name: Vec<u8>,
    pub comment: Vec<u8>,
    pub method: CompressionMethod,
    pub modified: DosDateTime,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub external_attrs: u32,
    pub lfh_offset: u64,
    /// First byte of the compressed data
    pub data_offset: u64,
}

/// Where the central directory lives, as declared by an EOCD candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryLocation {
    pub eocd_offset: u64,
    pub cd_offset: u64,
    pub cd_size: u64,
    pub total_entries: u64,
    pub comment_len: u16,
    pub zip64: bool,
}

/// Everything read from the directory structures of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirectory {
    pub location: DirectoryLocation,
    pub entries: Vec<RawEntry>,
    pub comment: Vec<u8>,
}

/// A candidate that was abandoned, kept for the final diagnostic.
#[derive(Debug)]
struct CandidateFailure {
    offset: u64,
    error: ZipError,
}

/// Backward scan over the tail of the buffer for plausible EOCD positions.
struct EocdScanner<'a> {
    buffer: &'a SegmentedBuffer,
    /// Exclusive upper bound of candidate start positions not yet examined
    cursor: u64,
    /// Lowest position an EOCD can start at
    floor: u64,
}

impl<'a> EocdScanner<'a> {
    fn new(buffer: &'a SegmentedBuffer) -> Self {
        let size = buffer.len();
        let record = EndOfCentralDirectory::SIZE as u64;
        let (cursor, floor) = if size < record {
            (0, 0)
        } else {
            (size - record + 1, size.saturating_sub(record + MAX_COMMENT_SIZE))
        };
        Self {
            buffer,
            cursor,
            floor,
        }
    }

    /// Next position, moving backwards, holding the EOCD signature and a comment
    /// length that ends exactly at the end of the buffer.
    fn next_candidate(&mut self) -> Result<Option<u64>> {
        let size = self.buffer.len();
        let record = EndOfCentralDirectory::SIZE as u64;
        while self.cursor > self.floor {
            let start = self.cursor.saturating_sub(SCAN_WINDOW).max(self.floor);
            let window = self
                .buffer
                .read(start, (self.cursor + record - 1 - start) as usize)?;
            for pos in (start..self.cursor).rev() {
                let at = (pos - start) as usize;
                if &window[at..at + 4] != EndOfCentralDirectory::SIGNATURE {
                    continue;
                }
                let comment_len = u16::from_le_bytes([window[at + 20], window[at + 21]]) as u64;
                if comment_len == size - pos - record {
                    self.cursor = pos;
                    return Ok(Some(pos));
                }
                debug!(offset = pos, comment_len, "signature with mismatched comment length");
            }
            self.cursor = start;
        }
        Ok(None)
    }
}

/// Low-level ZIP parser over an in-memory (or mapped) archive.
///
/// ## Example
///
/// ```ignore
/// let buffer = zipvfs::io::open_file(path, true)?;
/// let directory = ArchiveReader::new(&buffer).read()?;
/// for entry in directory.entries {
///     println!("{}", String::from_utf8_lossy(&entry.name));
/// }
/// ```
pub struct ArchiveReader<'a> {
    /// The archive bytes
    buffer: &'a SegmentedBuffer,
    /// Total size of the archive in bytes
    size: u64,
}

impl<'a> ArchiveReader<'a> {
    pub fn new(buffer: &'a SegmentedBuffer) -> Self {
        Self {
            buffer,
            size: buffer.len(),
        }
    }

    /// Locate and parse the central directory.
    ///
    /// Candidates are tried newest first. A candidate whose directory fails to
    /// parse is abandoned and the scan continues; I/O errors abort immediately.
    ///
    /// # Errors
    ///
    /// - [`ZipError::TruncatedArchive`] when no candidate exists at all
    /// - [`ZipError::Format`] when every candidate was rejected, quoting the
    ///   first few rejections
    pub fn read(&self) -> Result<CentralDirectory> {
        let mut scanner = EocdScanner::new(self.buffer);
        let mut failures = Vec::with_capacity(MAX_REPORTED_FAILURES);
        let mut rejected = 0usize;

        while let Some(offset) = scanner.next_candidate()? {
            match self.read_candidate(offset) {
                Ok(directory) => {
                    debug!(
                        offset,
                        entries = directory.entries.len(),
                        zip64 = directory.location.zip64,
                        "central directory parsed"
                    );
                    return Ok(directory);
                }
                Err(error) if error.is_retryable() => {
                    warn!(offset, %error, "rejected end of central directory candidate");
                    rejected += 1;
                    if failures.len() < MAX_REPORTED_FAILURES {
                        failures.push(CandidateFailure { offset, error });
                    }
                }
                Err(error) => return Err(error),
            }
        }

        if failures.is_empty() {
            return Err(ZipError::TruncatedArchive { size: self.size });
        }
        let details: Vec<String> = failures
            .iter()
            .map(|f| format!("candidate at {}: {}", f.offset, f.error))
            .collect();
        Err(ZipError::format(format!(
            "unable to read zip file, {rejected} directory candidate(s) rejected: {}",
            details.join("; ")
        )))
    }

    fn read_candidate(&self, offset: u64) -> Result<CentralDirectory> {
        let location = self.locate_directory(offset)?;
        let entries = self.read_entries(&location)?;
        let comment = self
            .buffer
            .read(
                offset + EndOfCentralDirectory::SIZE as u64,
                location.comment_len as usize,
            )?
            .into_owned();
        Ok(CentralDirectory {
            location,
            entries,
            comment,
        })
    }

    /// Decode the EOCD at `offset`, following a ZIP64 locator when one is linked.
    pub fn locate_directory(&self, offset: u64) -> Result<DirectoryLocation> {
        let eocd = EndOfCentralDirectory::from_bytes(
            &self.buffer.read(offset, EndOfCentralDirectory::SIZE)?,
        )?;

        let location = match self.read_zip64_eocd(offset) {
            Some(eocd64) => DirectoryLocation {
                eocd_offset: offset,
                cd_offset: eocd64.cd_offset,
                cd_size: eocd64.cd_size,
                total_entries: eocd64.total_entries,
                comment_len: eocd.comment_len,
                zip64: true,
            },
            None if eocd.is_zip64() => {
                return Err(ZipError::format(
                    "end of central directory requires a zip64 record but none is linked",
                ));
            }
            None => DirectoryLocation {
                eocd_offset: offset,
                cd_offset: eocd.cd_offset as u64,
                cd_size: eocd.cd_size as u64,
                total_entries: eocd.total_entries as u64,
                comment_len: eocd.comment_len,
                zip64: false,
            },
        };

        if eocd.disk_number != 0 && eocd.disk_number != SENTINEL16 {
            return Err(ZipError::format("multi-disk archives are not supported"));
        }
        match location.cd_offset.checked_add(location.cd_size) {
            Some(end) if end <= offset => Ok(location),
            _ => Err(ZipError::format(format!(
                "central directory {}+{} overlaps its end record at {offset}",
                location.cd_offset, location.cd_size
            ))),
        }
    }

    /// ZIP64 EOCD reached through a valid locator right before the EOCD at
    /// `eocd_offset`, if any.
    fn read_zip64_eocd(&self, eocd_offset: u64) -> Option<Zip64EOCD> {
        let locator_offset = eocd_offset.checked_sub(Zip64EOCDLocator::SIZE as u64)?;
        let locator_bytes = self
            .buffer
            .read(locator_offset, Zip64EOCDLocator::SIZE)
            .ok()?;
        let locator = Zip64EOCDLocator::from_bytes(&locator_bytes).ok()?;
        if locator.eocd64_offset >= locator_offset {
            debug!(eocd_offset, "zip64 locator points past itself");
            return None;
        }
        let record = self
            .buffer
            .read(locator.eocd64_offset, Zip64EOCD::MIN_SIZE)
            .ok()?;
        match Zip64EOCD::from_bytes(&record) {
            Ok(eocd64) => Some(eocd64),
            Err(error) => {
                debug!(eocd_offset, %error, "zip64 locator does not link a valid record");
                None
            }
        }
    }

    fn read_entries(&self, location: &DirectoryLocation) -> Result<Vec<RawEntry>> {
        let capacity = location
            .total_entries
            .min(location.cd_size / CDFH_MIN_SIZE as u64) as usize;
        let mut entries = Vec::with_capacity(capacity);
        let mut position = location.cd_offset;
        let end = location.cd_offset + location.cd_size;

        for _ in 0..location.total_entries {
            if position + CDFH_MIN_SIZE as u64 > end {
                return Err(ZipError::format(format!(
                    "central directory ends after {} of {} entries",
                    entries.len(),
                    location.total_entries
                )));
            }
            let (entry, record_len) = self.parse_cdfh(position)?;
            entries.push(entry);
            position += record_len;
        }

        Ok(entries)
    }

    /// Parse the Central Directory File Header at `position`.
    ///
    /// Returns the entry and the length of the full record.
    fn parse_cdfh(&self, position: u64) -> Result<(RawEntry, u64)> {
        let header = CentralHeader::from_bytes(&self.buffer.read(position, CDFH_MIN_SIZE)?)?;

        let name_offset = position + CDFH_MIN_SIZE as u64;
        let extra_offset = name_offset + header.name_len as u64;
        let comment_offset = extra_offset + header.extra_len as u64;

        let name = self
            .buffer
            .read(name_offset, header.name_len as usize)?
            .into_owned();
        let extra = self.buffer.read(extra_offset, header.extra_len as usize)?;
        let comment = self
            .buffer
            .read(comment_offset, header.comment_len as usize)?
            .into_owned();

        let mut uncompressed_size = header.uncompressed_size as u64;
        let mut compressed_size = header.compressed_size as u64;
        let mut lfh_offset = header.lfh_offset as u64;
        apply_zip64_extra(
            &extra,
            &mut uncompressed_size,
            &mut compressed_size,
            &mut lfh_offset,
        )?;

        let data_offset = self.data_offset(lfh_offset)?;
        match data_offset.checked_add(compressed_size) {
            Some(end) if end <= self.size => {}
            _ => {
                return Err(ZipError::format(format!(
                    "data of {} ({compressed_size} bytes at {data_offset}) exceeds the archive",
                    String::from_utf8_lossy(&name)
                )));
            }
        }

        let entry = RawEntry {
            name,
            comment,
            method: CompressionMethod::from_u16(header.method),
            modified: DosDateTime::from_raw(header.modified),
            crc32: header.crc32,
            compressed_size,
            uncompressed_size,
            external_attrs: header.external_attrs,
            lfh_offset,
            data_offset,
        };
        Ok((entry, header.record_len()))
    }

    /// Get the actual data offset for an entry.
    ///
    /// The Local File Header has variable-length fields (name, extra field) that
    /// may differ from the Central Directory entry, so it has to be read.
    pub fn data_offset(&self, lfh_offset: u64) -> Result<u64> {
        let header = LocalHeader::from_bytes(&self.buffer.read(lfh_offset, LFH_SIZE)?)?;
        Ok(lfh_offset + header.header_len())
    }
}

/// Override saturated 32-bit fields with the ZIP64 extended information block.
///
/// The block carries 8-byte values only for fields that are saturated, in the
/// fixed order: uncompressed size, compressed size, local header offset.
pub(crate) fn apply_zip64_extra(
    extra: &[u8],
    uncompressed_size: &mut u64,
    compressed_size: &mut u64,
    lfh_offset: &mut u64,
) -> Result<()> {
    let mut cursor = Cursor::new(extra);
    while cursor.position() as usize + 4 <= extra.len() {
        let header_id = cursor.read_u16::<LittleEndian>()?;
        let block_size = cursor.read_u16::<LittleEndian>()? as u64;
        let block_end = cursor.position() + block_size;
        if block_end > extra.len() as u64 {
            return Err(ZipError::format(format!(
                "extra block 0x{header_id:04x} of {block_size} bytes overruns the extra field"
            )));
        }

        if header_id == ZIP64_EXTRA_ID {
            for field in [
                &mut *uncompressed_size,
                &mut *compressed_size,
                &mut *lfh_offset,
            ] {
                if *field != SENTINEL32 as u64 {
                    continue;
                }
                if cursor.position() + 8 > block_end {
                    return Err(ZipError::format("zip64 extra block is missing a field"));
                }
                *field = cursor.read_u64::<LittleEndian>()?;
            }
        }
        cursor.set_position(block_end);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    /// Minimal STORED archive, written by hand.
    pub(crate) fn stored_zip(entries: &[(&str, &[u8])], comment: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();
        for (name, data) in entries {
            let offset = out.len() as u32;
            let crc = crc32fast::hash(data);
            LocalHeader {
                version_needed: 20,
                crc32: crc,
                compressed_size: data.len() as u32,
                uncompressed_size: data.len() as u32,
                name_len: name.len() as u16,
                modified: DosDateTime::MIN.raw(),
                ..Default::default()
            }
            .write_to(&mut out)
            .unwrap();
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(data);

            CentralHeader {
                version_made_by: 20,
                version_needed: 20,
                crc32: crc,
                compressed_size: data.len() as u32,
                uncompressed_size: data.len() as u32,
                name_len: name.len() as u16,
                modified: DosDateTime::MIN.raw(),
                lfh_offset: offset,
                ..Default::default()
            }
            .write_to(&mut central)
            .unwrap();
            central.extend_from_slice(name.as_bytes());
        }
        let cd_offset = out.len() as u32;
        out.extend_from_slice(&central);
        EndOfCentralDirectory {
            disk_entries: entries.len() as u16,
            total_entries: entries.len() as u16,
            cd_size: central.len() as u32,
            cd_offset,
            comment_len: comment.len() as u16,
            ..Default::default()
        }
        .write_to(&mut out)
        .unwrap();
        out.extend_from_slice(comment);
        out
    }

    fn read(bytes: Vec<u8>) -> Result<CentralDirectory> {
        let buffer = SegmentedBuffer::from_vec(bytes);
        ArchiveReader::new(&buffer).read()
    }

    #[test]
    fn parses_entries_and_data_offsets() {
        let bytes = stored_zip(&[("a/", b""), ("a/b.txt", b"hello")], b"");
        let directory = read(bytes.clone()).unwrap();
        assert_eq!(directory.entries.len(), 2);
        let file = &directory.entries[1];
        assert_eq!(file.name, b"a/b.txt");
        assert_eq!(file.method, CompressionMethod::Stored);
        assert_eq!(file.crc32, crc32fast::hash(b"hello"));
        let start = file.data_offset as usize;
        assert_eq!(&bytes[start..start + 5], b"hello");
        assert!(!directory.location.zip64);
    }

    #[test]
    fn embedded_signature_in_comment_is_skipped() {
        // The comment ends with something that looks like an empty archive's EOCD.
        let mut fake = Vec::new();
        EndOfCentralDirectory::default().write_to(&mut fake).unwrap();
        let mut comment = b"release notes: ".to_vec();
        comment.extend_from_slice(&fake);
        comment.extend_from_slice(b" end");

        let directory = read(stored_zip(&[("x.txt", b"abc")], &comment)).unwrap();
        assert_eq!(directory.entries.len(), 1);
        assert_eq!(directory.comment, comment);
    }

    #[test]
    fn spurious_candidate_that_fails_parsing_falls_back() {
        // A fake EOCD at the very end whose comment length is zero matches the
        // length check, but points at garbage. The real one is older.
        let real = stored_zip(&[("x.txt", b"abc")], b"");
        let mut fake = Vec::new();
        EndOfCentralDirectory {
            disk_entries: 1,
            total_entries: 1,
            cd_size: 46,
            cd_offset: 0,
            ..Default::default()
        }
        .write_to(&mut fake)
        .unwrap();

        // Make the fake record part of the real archive's comment.
        let mut bytes = real[..real.len() - 2].to_vec();
        bytes.write_u16::<LittleEndian>(fake.len() as u16).unwrap();
        bytes.extend_from_slice(&fake);

        let directory = read(bytes).unwrap();
        assert_eq!(directory.entries.len(), 1);
        assert_eq!(directory.entries[0].name, b"x.txt");
        assert_eq!(directory.comment, fake);
    }

    #[test]
    fn all_candidates_bad_is_a_format_error() {
        let mut bytes = vec![0u8; 64];
        EndOfCentralDirectory {
            disk_entries: 1,
            total_entries: 1,
            cd_size: 46,
            cd_offset: 0,
            ..Default::default()
        }
        .write_to(&mut bytes)
        .unwrap();
        let err = read(bytes).unwrap_err();
        assert!(matches!(err, ZipError::Format(ref msg) if msg.contains("1 directory candidate")));
    }

    #[test]
    fn no_candidate_is_truncated() {
        assert!(matches!(
            read(b"PK\x05\x06".to_vec()),
            Err(ZipError::TruncatedArchive { size: 4 })
        ));
        assert!(matches!(
            read(vec![0u8; 500]),
            Err(ZipError::TruncatedArchive { size: 500 })
        ));
    }

    #[test]
    fn empty_archive_has_no_entries() {
        let directory = read(stored_zip(&[], b"")).unwrap();
        assert!(directory.entries.is_empty());
    }

    #[test]
    fn zip64_extra_overrides_saturated_fields_in_order() {
        let mut extra = Vec::new();
        extra.write_u16::<LittleEndian>(0x5455).unwrap(); // unrelated block first
        extra.write_u16::<LittleEndian>(1).unwrap();
        extra.push(0);
        extra.write_u16::<LittleEndian>(ZIP64_EXTRA_ID).unwrap();
        extra.write_u16::<LittleEndian>(16).unwrap();
        extra.write_u64::<LittleEndian>(5_000_000_000).unwrap();
        extra.write_u64::<LittleEndian>(6_000_000_000).unwrap();

        let mut uncompressed = SENTINEL32 as u64;
        let mut compressed = 1234;
        let mut offset = SENTINEL32 as u64;
        apply_zip64_extra(&extra, &mut uncompressed, &mut compressed, &mut offset).unwrap();
        assert_eq!(uncompressed, 5_000_000_000);
        assert_eq!(compressed, 1234);
        assert_eq!(offset, 6_000_000_000);
    }

    #[test]
    fn short_zip64_block_is_rejected() {
        let mut extra = Vec::new();
        extra.write_u16::<LittleEndian>(ZIP64_EXTRA_ID).unwrap();
        extra.write_u16::<LittleEndian>(8).unwrap();
        extra.write_u64::<LittleEndian>(1).unwrap();
        let mut a = SENTINEL32 as u64;
        let mut b = SENTINEL32 as u64;
        let mut c = 0;
        assert!(apply_zip64_extra(&extra, &mut a, &mut b, &mut c).is_err());
    }

    #[test]
    fn overrunning_extra_block_is_rejected() {
        let mut extra = Vec::new();
        extra.write_u16::<LittleEndian>(0x000A).unwrap();
        extra.write_u16::<LittleEndian>(40).unwrap();
        let (mut a, mut b, mut c) = (0, 0, 0);
        assert!(apply_zip64_extra(&extra, &mut a, &mut b, &mut c).is_err());
    }

    #[test]
    fn zip64_end_record_takes_precedence() {
        let base = stored_zip(&[("x.txt", b"abc")], b"");
        let eocd_at = base.len() - EndOfCentralDirectory::SIZE;
        let eocd = EndOfCentralDirectory::from_bytes(&base[eocd_at..]).unwrap();

        let mut bytes = base[..eocd_at].to_vec();
        let eocd64_offset = bytes.len() as u64;
        Zip64EOCD {
            eocd64_size: 44,
            version_made_by: 45,
            version_needed: 45,
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: 1,
            total_entries: 1,
            cd_size: eocd.cd_size as u64,
            cd_offset: eocd.cd_offset as u64,
        }
        .write_to(&mut bytes)
        .unwrap();
        Zip64EOCDLocator {
            disk_with_eocd64: 0,
            eocd64_offset,
            total_disks: 1,
        }
        .write_to(&mut bytes)
        .unwrap();
        EndOfCentralDirectory {
            disk_entries: SENTINEL16,
            total_entries: SENTINEL16,
            cd_size: SENTINEL32,
            cd_offset: SENTINEL32,
            ..Default::default()
        }
        .write_to(&mut bytes)
        .unwrap();

        let directory = read(bytes).unwrap();
        assert!(directory.location.zip64);
        assert_eq!(directory.entries.len(), 1);
    }

    #[test]
    fn bad_local_header_rejects_the_candidate() {
        let mut bytes = stored_zip(&[("x.txt", b"abc")], b"");
        bytes[0] = b'Q';
        assert!(matches!(read(bytes), Err(ZipError::Format(_))));
    }
}
