//! Archive entries and canonical name handling.
//!
//! Names are raw byte strings. Directory names end with `/`, file names never do.
//! The root directory is named `/`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDateTime;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};

use super::store::CompressionState;
use super::structures::{CompressionMethod, DosDateTime};

pub const SEPARATOR: u8 = b'/';
pub const ROOT: &[u8] = b"/";

pub fn is_root(name: &[u8]) -> bool {
    name == ROOT
}

pub fn is_directory_name(name: &[u8]) -> bool {
    name.last() == Some(&SEPARATOR)
}

/// Name of the directory holding `name`: the prefix up to the last separator
/// before the trailing one, or the root. `None` for the root itself.
pub fn parent_name(name: &[u8]) -> Option<&[u8]> {
    if name.is_empty() || is_root(name) {
        return None;
    }
    let body = if is_directory_name(name) {
        &name[..name.len() - 1]
    } else {
        name
    };
    match body.iter().rposition(|&b| b == SEPARATOR) {
        Some(i) if i > 0 => Some(&name[..=i]),
        _ => Some(ROOT),
    }
}

/// Ancestors of `name`, nearest first, ending with the root.
pub fn ancestors(name: &[u8]) -> impl Iterator<Item = &[u8]> {
    std::iter::successors(parent_name(name), |n| parent_name(*n))
}

/// Mutable metadata of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntryMeta {
    pub modified: DosDateTime,
    pub external_attrs: u32,
    pub comment: Vec<u8>,
}

/// Snapshot of an entry's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub name: Vec<u8>,
    pub is_directory: bool,
    /// Uncompressed size
    pub size: u64,
    /// Known once the entry was loaded or compressed
    pub compressed_size: Option<u64>,
    pub method: CompressionMethod,
    pub crc32: Option<u32>,
    pub modified: DosDateTime,
    pub external_attrs: u32,
    pub comment: Vec<u8>,
}

impl EntryMetadata {
    pub fn last_modified(&self) -> Option<NaiveDateTime> {
        self.modified.to_naive()
    }

    /// Unix mode bits, when the entry was written by a Unix host.
    pub fn unix_mode(&self) -> Option<u32> {
        let mode = self.external_attrs >> 16;
        (mode != 0).then_some(mode)
    }
}

/// One file or directory of the archive.
///
/// Handles stay usable after removal but report [`ArchiveEntry::is_valid`] as
/// false; holders should look the name up again.
#[derive(Debug)]
pub struct ArchiveEntry {
    /// Insertion sequence, used for ordered write-back
    id: u64,
    name: Vec<u8>,
    meta: RwLock<EntryMeta>,
    valid: AtomicBool,
    /// Full names of immediate children
    children: RwLock<BTreeSet<Vec<u8>>>,
    state: Mutex<CompressionState>,
}

impl ArchiveEntry {
    pub fn new(id: u64, name: Vec<u8>, meta: EntryMeta, state: CompressionState) -> Self {
        Self {
            id,
            name,
            meta: RwLock::new(meta),
            valid: AtomicBool::new(true),
            children: RwLock::new(BTreeSet::new()),
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Name for display, lossy for non UTF-8 names.
    pub fn display_name(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn is_directory(&self) -> bool {
        is_directory_name(&self.name)
    }

    pub fn is_root(&self) -> bool {
        is_root(&self.name)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn meta(&self) -> EntryMeta {
        self.meta.read().clone()
    }

    pub fn modified(&self) -> DosDateTime {
        self.meta.read().modified
    }

    pub(crate) fn set_modified(&self, modified: DosDateTime) {
        self.meta.write().modified = modified;
    }

    pub(crate) fn set_external_attrs(&self, attrs: u32) {
        self.meta.write().external_attrs = attrs;
    }

    pub(crate) fn set_comment(&self, comment: Vec<u8>) {
        self.meta.write().comment = comment;
    }

    pub fn metadata(&self) -> EntryMetadata {
        let meta = self.meta();
        let state = self.state();
        EntryMetadata {
            name: self.name.clone(),
            is_directory: self.is_directory(),
            size: state.uncompressed_size(),
            compressed_size: state.compressed_size(),
            method: state.method(),
            crc32: state.crc32(),
            modified: meta.modified,
            external_attrs: meta.external_attrs,
            comment: meta.comment,
        }
    }

    pub fn children(&self) -> Vec<Vec<u8>> {
        self.children.read().iter().cloned().collect()
    }

    pub fn has_children(&self) -> bool {
        !self.children.read().is_empty()
    }

    pub(crate) fn children_mut(&self) -> RwLockWriteGuard<'_, BTreeSet<Vec<u8>>> {
        self.children.write()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, CompressionState> {
        self.state.lock()
    }
}
