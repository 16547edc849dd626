//! `std::io` streams over entry content.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::error::Result;
use crate::io::SegmentedBuffer;

use super::entry::ArchiveEntry;
use super::store::Slice;
use super::tree::DirectoryTree;

fn seek_position(current: u64, len: u64, pos: SeekFrom) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::End(delta) => len.checked_add_signed(delta),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
    };
    target.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid seek to a negative or overflowing position",
        )
    })
}

/// Reader over the decompressed content of a file entry.
///
/// The reader owns its content, so it stays usable after the entry is rewritten
/// or removed.
#[derive(Debug, Clone)]
pub struct EntryReader {
    content: Slice,
    position: u64,
}

impl EntryReader {
    pub fn new(content: Slice) -> Self {
        Self {
            content,
            position: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.content.len().saturating_sub(self.position);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.content.read_into(self.position, &mut buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for EntryReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = seek_position(self.position, self.content.len(), pos)?;
        Ok(self.position)
    }
}

/// Write stream building new content for a file entry.
///
/// Writes land in a private buffer; [`EntryWriter::commit`] installs it as the
/// entry's content. Dropping the writer without committing discards the data.
pub struct EntryWriter<'a> {
    tree: &'a DirectoryTree,
    name: Vec<u8>,
    buffer: SegmentedBuffer,
    position: u64,
}

impl<'a> EntryWriter<'a> {
    pub(crate) fn new(tree: &'a DirectoryTree, name: Vec<u8>, initial: SegmentedBuffer, append: bool) -> Self {
        let position = if append { initial.len() } else { 0 };
        Self {
            tree,
            name,
            buffer: initial,
            position,
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Bytes written so far, including any appended-to content.
    pub fn len(&self) -> u64 {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Install the written content, creating the entry if needed.
    pub fn commit(self) -> Result<Arc<ArchiveEntry>> {
        self.tree.write_buffer(&self.name, self.buffer)
    }
}

impl Write for EntryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.write(self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for EntryWriter<'_> {
    /// Seeking past the end is allowed; the gap reads as zeros once written.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = seek_position(self.position, self.buffer.len(), pos)?;
        Ok(self.position)
    }
}

impl std::fmt::Debug for EntryWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryWriter")
            .field("name", &String::from_utf8_lossy(&self.name))
            .field("len", &self.buffer.len())
            .field("position", &self.position)
            .finish()
    }
}
