//! The directory tree of an open archive.
//!
//! [`DirectoryTree`] maps canonical names to [`ArchiveEntry`] handles and keeps
//! every directory's child set in step with the map: for each entry other than the
//! root, its parent directory is present, and a parent lists exactly the entries
//! of the map directly below it.
//!
//! Mutations bump a generation counter. [`DirectoryTree::flush`] serializes the
//! whole tree into a temporary file next to the archive, renames it over the
//! original, and records the generation it wrote; the tree is dirty whenever the
//! current generation is newer than the persisted one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codec::CodecPool;
use crate::config::ArchiveConfig;
use crate::error::{Result, ZipError};
use crate::io::{self, SegmentedBuffer};

use super::cache::DecompressionCache;
use super::entry::{self, ArchiveEntry, EntryMeta, EntryMetadata, ROOT};
use super::parser::{ArchiveReader, RawEntry};
use super::store::{CompressionState, Slice};
use super::stream::{EntryReader, EntryWriter};
use super::structures::{CompressionMethod, DosDateTime};
use super::writer::{self, WriteSummary};

/// An archive opened as a mutable tree of entries.
///
/// All methods take `&self`; the tree can be shared between threads behind an
/// [`Arc`].
pub struct DirectoryTree {
    path: PathBuf,
    config: ArchiveConfig,
    entries: DashMap<Vec<u8>, Arc<ArchiveEntry>>,
    comment: RwLock<Vec<u8>>,
    pool: CodecPool,
    cache: DecompressionCache,
    next_id: AtomicU64,
    generation: AtomicU64,
    persisted: AtomicU64,
    flush_lock: Mutex<()>,
    closed: AtomicBool,
}

fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || entry::is_root(name) || name.len() > u16::MAX as usize {
        return Err(ZipError::invalid_name(name));
    }
    Ok(())
}

impl DirectoryTree {
    fn empty(path: PathBuf, config: ArchiveConfig) -> Self {
        let tree = Self {
            path,
            pool: CodecPool::new(config.compression_level),
            cache: DecompressionCache::new(config.cache_budget),
            config,
            entries: DashMap::new(),
            comment: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            flush_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        };
        let id = tree.allocate_id();
        let root = tree.new_directory(id, ROOT.to_vec(), DosDateTime::now());
        tree.entries.insert(ROOT.to_vec(), Arc::new(root));
        tree
    }

    /// Open an existing archive.
    ///
    /// The archive is forced read-only when the file itself is not writable.
    pub fn open(path: impl AsRef<Path>, config: ArchiveConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut config = config;
        if !config.read_only && std::fs::metadata(&path)?.permissions().readonly() {
            info!(path = %path.display(), "archive file is not writable, opening read-only");
            config.read_only = true;
        }

        let buffer = Arc::new(io::open_file(&path, config.prefer_mmap)?);
        let directory = ArchiveReader::new(&buffer).read()?;

        let tree = Self::empty(path, config);
        *tree.comment.write() = directory.comment;
        tree.bootstrap(&buffer, directory.entries);

        info!(
            path = %tree.path.display(),
            entries = tree.len(),
            size = buffer.len(),
            mapped = buffer.is_mapped(),
            zip64 = directory.location.zip64,
            "opened archive"
        );
        Ok(tree)
    }

    /// Start a new, empty archive at `path`. Nothing is written until the first
    /// flush.
    pub fn create(path: impl AsRef<Path>, config: ArchiveConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(ZipError::AlreadyExists(path.display().to_string()));
        }
        if config.read_only {
            return Err(ZipError::ReadOnly);
        }
        let tree = Self::empty(path, config);
        tree.touch();
        debug!(path = %tree.path.display(), "created empty archive");
        Ok(tree)
    }

    fn bootstrap(&self, buffer: &Arc<SegmentedBuffer>, records: Vec<RawEntry>) {
        let mut order = Vec::with_capacity(records.len());
        for raw in records {
            if raw.name.is_empty() || entry::is_root(&raw.name) {
                warn!(name = %String::from_utf8_lossy(&raw.name), "skipping entry with unusable name");
                continue;
            }
            if self.entries.contains_key(&raw.name) {
                warn!(name = %String::from_utf8_lossy(&raw.name), "duplicate entry name, keeping the first");
                continue;
            }
            let id = self.allocate_id();
            let state = CompressionState::loaded(
                id,
                raw.method,
                raw.crc32,
                raw.uncompressed_size,
                Slice::new(buffer.clone(), raw.data_offset, raw.compressed_size),
            );
            let meta = EntryMeta {
                modified: raw.modified,
                external_attrs: raw.external_attrs,
                comment: raw.comment,
            };
            order.push(raw.name.clone());
            self.entries
                .insert(raw.name.clone(), Arc::new(ArchiveEntry::new(id, raw.name, meta, state)));
        }

        for name in order {
            self.link_loaded(name);
        }
    }

    /// Register `name` with its parent, synthesizing missing directories on the way up.
    fn link_loaded(&self, name: Vec<u8>) {
        let mut child = name;
        while let Some(parent) = entry::parent_name(&child).map(<[u8]>::to_vec) {
            let (parent_entry, existed) = match self.lookup(&parent) {
                Some(found) => (found, true),
                None => {
                    warn!(
                        directory = %String::from_utf8_lossy(&parent),
                        "synthesizing missing parent directory"
                    );
                    let id = self.allocate_id();
                    let dir = Arc::new(self.new_directory(id, parent.clone(), DosDateTime::now()));
                    self.entries.insert(parent.clone(), dir.clone());
                    (dir, false)
                }
            };
            parent_entry.children_mut().insert(child);
            if existed {
                break;
            }
            child = parent;
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn touch(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn new_directory(&self, id: u64, name: Vec<u8>, modified: DosDateTime) -> ArchiveEntry {
        ArchiveEntry::new(
            id,
            name,
            EntryMeta {
                modified,
                ..Default::default()
            },
            CompressionState::empty(id, CompressionMethod::Stored),
        )
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ZipError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.config.read_only {
            return Err(ZipError::ReadOnly);
        }
        Ok(())
    }

    fn lookup(&self, name: &[u8]) -> Option<Arc<ArchiveEntry>> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    fn parent_of(&self, name: &[u8]) -> Result<Arc<ArchiveEntry>> {
        let parent = entry::parent_name(name).ok_or_else(|| ZipError::invalid_name(name))?;
        self.lookup(parent).ok_or_else(|| ZipError::not_found(parent))
    }

    /// Insert under the parent's child lock so a concurrent removal of the parent
    /// cannot interleave.
    fn insert_with(
        &self,
        name: &[u8],
        exclusive: bool,
        make: impl FnOnce(u64) -> ArchiveEntry,
    ) -> Result<(Arc<ArchiveEntry>, bool)> {
        validate_name(name)?;
        let parent = self.parent_of(name)?;
        let mut siblings = parent.children_mut();
        if !parent.is_valid() {
            return Err(ZipError::not_found(parent.name()));
        }
        let created = match self.entries.entry(name.to_vec()) {
            Entry::Occupied(existing) if exclusive => {
                return Err(ZipError::already_exists(existing.key()));
            }
            Entry::Occupied(existing) => return Ok((existing.get().clone(), false)),
            Entry::Vacant(slot) => {
                let created = Arc::new(make(self.allocate_id()));
                slot.insert(created.clone());
                created
            }
        };
        siblings.insert(name.to_vec());
        drop(siblings);
        self.touch();
        Ok((created, true))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn codec_pool(&self) -> &CodecPool {
        &self.pool
    }

    pub fn cache(&self) -> &DecompressionCache {
        &self.cache
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether there are mutations not yet flushed.
    pub fn is_dirty(&self) -> bool {
        self.generation.load(Ordering::Acquire) != self.persisted.load(Ordering::Acquire)
    }

    /// Number of entries, not counting the root.
    pub fn len(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn exists(&self, name: &[u8]) -> bool {
        self.entries.contains_key(name)
    }

    /// Look an entry up by canonical name.
    pub fn get(&self, name: &[u8]) -> Result<Arc<ArchiveEntry>> {
        self.ensure_open()?;
        self.lookup(name).ok_or_else(|| ZipError::not_found(name))
    }

    /// Insert an empty entry unless the name is taken.
    ///
    /// Returns the entry under `name` and whether it was created by this call.
    /// The parent directory must exist.
    pub fn create_entry(&self, name: &[u8]) -> Result<(Arc<ArchiveEntry>, bool)> {
        self.ensure_writable()?;
        let method = self.config.default_method;
        self.insert_with(name, false, |id| self.new_entry(id, name, method))
    }

    /// Like [`create_entry`](Self::create_entry) but fails with
    /// [`ZipError::AlreadyExists`] when the name is taken.
    pub fn create_new_entry(&self, name: &[u8]) -> Result<Arc<ArchiveEntry>> {
        self.ensure_writable()?;
        let method = self.config.default_method;
        self.insert_with(name, true, |id| self.new_entry(id, name, method))
            .map(|(entry, _)| entry)
    }

    /// Create a directory. A trailing separator is added if missing.
    pub fn create_directory(&self, name: &[u8]) -> Result<Arc<ArchiveEntry>> {
        let mut name = name.to_vec();
        if !entry::is_directory_name(&name) {
            name.push(entry::SEPARATOR);
        }
        self.create_new_entry(&name)
    }

    /// Create `name` and every missing directory above it.
    pub fn create_directories(&self, name: &[u8]) -> Result<Arc<ArchiveEntry>> {
        self.ensure_writable()?;
        let mut name = name.to_vec();
        if !entry::is_directory_name(&name) {
            name.push(entry::SEPARATOR);
        }
        let mut missing: Vec<&[u8]> = entry::ancestors(&name)
            .take_while(|a| !self.exists(a))
            .collect();
        missing.reverse();
        for dir in missing {
            self.insert_with(dir, false, |id| self.new_directory(id, dir.to_vec(), DosDateTime::now()))?;
        }
        self.insert_with(&name, false, |id| self.new_directory(id, name.clone(), DosDateTime::now()))
            .map(|(entry, _)| entry)
    }

    fn new_entry(&self, id: u64, name: &[u8], method: CompressionMethod) -> ArchiveEntry {
        if entry::is_directory_name(name) {
            return self.new_directory(id, name.to_vec(), DosDateTime::now());
        }
        ArchiveEntry::new(
            id,
            name.to_vec(),
            EntryMeta {
                modified: DosDateTime::now(),
                ..Default::default()
            },
            CompressionState::empty(id, method),
        )
    }

    /// Unlink an entry from the map and its parent, invalidating outstanding
    /// handles.
    pub fn remove(&self, name: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        if entry::is_root(name) {
            return Err(ZipError::invalid_name(name));
        }
        let target = self.lookup(name).ok_or_else(|| ZipError::not_found(name))?;
        let parent = self.parent_of(name)?;

        let children = target.children_mut();
        if !children.is_empty() {
            return Err(ZipError::not_empty(name));
        }
        let mut siblings = parent.children_mut();
        if self
            .entries
            .remove_if(name, |_, current| Arc::ptr_eq(current, &target))
            .is_none()
        {
            return Err(ZipError::not_found(name));
        }
        siblings.remove(name);
        target.invalidate();
        drop(siblings);
        drop(children);

        self.cache.remove(target.id());
        self.touch();
        debug!(name = %target.display_name(), "removed entry");
        Ok(())
    }

    /// Duplicate `source` as `target`, sharing its content, and stamp the
    /// modification time of every directory above `target`.
    ///
    /// Directories are copied without their children.
    pub fn copy(&self, source: &[u8], target: &[u8], replace: bool) -> Result<Arc<ArchiveEntry>> {
        self.ensure_writable()?;
        if entry::is_root(source) || entry::is_root(target) {
            return Err(ZipError::invalid_name(ROOT));
        }
        let original = self.lookup(source).ok_or_else(|| ZipError::not_found(source))?;
        if source == target {
            return Ok(original);
        }
        if entry::is_directory_name(source) != entry::is_directory_name(target) {
            return Err(ZipError::invalid_name(target));
        }
        validate_name(target)?;
        self.parent_of(target)?;
        if let Some(existing) = self.lookup(target) {
            if !replace {
                return Err(ZipError::already_exists(target));
            }
            if existing.has_children() {
                return Err(ZipError::not_empty(target));
            }
            self.remove(target)?;
        }

        let meta = original.meta();
        let (copy, _) = self.insert_with(target, true, |id| {
            let state = original.state().share(id);
            ArchiveEntry::new(id, target.to_vec(), meta, state)
        })?;

        let now = DosDateTime::now();
        for ancestor in entry::ancestors(target) {
            if let Some(dir) = self.lookup(ancestor) {
                dir.set_modified(now);
            }
        }
        Ok(copy)
    }

    /// Copy then remove. Not atomic: another thread may briefly observe both
    /// names, or see `target` fail to appear if the copy is rejected.
    pub fn rename(&self, source: &[u8], target: &[u8], replace: bool) -> Result<Arc<ArchiveEntry>> {
        self.ensure_writable()?;
        let original = self.lookup(source).ok_or_else(|| ZipError::not_found(source))?;
        if source == target {
            return Ok(original);
        }
        if original.has_children() {
            return Err(ZipError::not_empty(source));
        }
        let moved = self.copy(source, target, replace)?;
        self.remove(source)?;
        Ok(moved)
    }

    /// Replace the content of file `name`, creating it if absent.
    pub fn write(&self, name: &[u8], data: &[u8]) -> Result<Arc<ArchiveEntry>> {
        self.write_buffer(name, SegmentedBuffer::from_vec(data.to_vec()))
    }

    /// Like [`write`](Self::write), taking ownership of an already built buffer.
    pub fn write_buffer(&self, name: &[u8], content: SegmentedBuffer) -> Result<Arc<ArchiveEntry>> {
        self.ensure_writable()?;
        if entry::is_directory_name(name) {
            return Err(ZipError::invalid_name(name));
        }
        let method = self.config.default_method;
        let (target, _) = self.insert_with(name, false, |id| self.new_entry(id, name, method))?;
        let size = content.len();
        target.state().replace(method, content, &self.cache);
        target.set_modified(DosDateTime::now());
        self.touch();
        debug!(name = %target.display_name(), size, "wrote entry");
        Ok(target)
    }

    /// Decompressed content of file `name`.
    pub fn content(&self, name: &[u8]) -> Result<Slice> {
        let target = self.get(name)?;
        if target.is_directory() {
            return Err(ZipError::invalid_name(name));
        }
        target.state().decompress(&self.pool, &self.cache)
    }

    pub fn read(&self, name: &[u8]) -> Result<Vec<u8>> {
        self.content(name)?.to_vec()
    }

    /// `len` bytes of file `name` starting at `position`.
    pub fn read_at(&self, name: &[u8], position: u64, len: usize) -> Result<Vec<u8>> {
        let content = self.content(name)?;
        let out_of_bounds = || ZipError::OutOfBounds {
            position,
            len: len as u64,
            size: content.len(),
        };
        let end = position.checked_add(len as u64).ok_or_else(out_of_bounds)?;
        if end > content.len() {
            return Err(out_of_bounds());
        }
        let mut out = vec![0u8; len];
        content.read_into(position, &mut out)?;
        Ok(out)
    }

    pub fn reader(&self, name: &[u8]) -> Result<EntryReader> {
        Ok(EntryReader::new(self.content(name)?))
    }

    /// Open a write stream on file `name`.
    ///
    /// With `append` the stream starts with a copy of the current content and is
    /// positioned at its end; otherwise it starts empty. Nothing changes until
    /// [`EntryWriter::commit`].
    pub fn writer(&self, name: &[u8], append: bool) -> Result<EntryWriter<'_>> {
        self.ensure_writable()?;
        validate_name(name)?;
        if entry::is_directory_name(name) {
            return Err(ZipError::invalid_name(name));
        }
        self.parent_of(name)?;
        let initial = match (append, self.lookup(name)) {
            (true, Some(_)) => {
                let current = self.content(name)?;
                current.data.copy_range(current.offset, current.len)?
            }
            _ => SegmentedBuffer::new(),
        };
        Ok(EntryWriter::new(self, name.to_vec(), initial, append))
    }

    /// Full names of the entries directly inside directory `name`, sorted.
    pub fn children(&self, name: &[u8]) -> Result<Vec<Vec<u8>>> {
        let dir = self.get(name)?;
        if !dir.is_directory() {
            return Err(ZipError::invalid_name(name));
        }
        Ok(dir.children())
    }

    /// Every entry name except the root, sorted.
    pub fn names(&self) -> Vec<Vec<u8>> {
        self.matching(|_| true)
    }

    /// Entry names accepted by `predicate`, sorted. The root is never offered.
    pub fn matching(&self, predicate: impl Fn(&[u8]) -> bool) -> Vec<Vec<u8>> {
        // Keys are copied out first so `predicate` runs with no shard locked.
        let mut names: Vec<Vec<u8>> = self
            .entries
            .iter()
            .filter(|e| !entry::is_root(e.key()))
            .map(|e| e.key().clone())
            .collect();
        names.retain(|n| predicate(n.as_slice()));
        names.sort();
        names
    }

    pub fn metadata(&self, name: &[u8]) -> Result<EntryMetadata> {
        Ok(self.get(name)?.metadata())
    }

    pub fn set_last_modified(&self, name: &[u8], modified: DosDateTime) -> Result<()> {
        self.ensure_writable()?;
        self.get(name)?.set_modified(modified);
        self.touch();
        Ok(())
    }

    pub fn set_external_attributes(&self, name: &[u8], attrs: u32) -> Result<()> {
        self.ensure_writable()?;
        self.get(name)?.set_external_attrs(attrs);
        self.touch();
        Ok(())
    }

    pub fn set_entry_comment(&self, name: &[u8], comment: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        if comment.len() > u16::MAX as usize {
            return Err(ZipError::format("entry comment longer than 65535 bytes"));
        }
        self.get(name)?.set_comment(comment.to_vec());
        self.touch();
        Ok(())
    }

    /// The archive comment.
    pub fn comment(&self) -> Vec<u8> {
        self.comment.read().clone()
    }

    pub fn set_comment(&self, comment: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        if comment.len() > u16::MAX as usize {
            return Err(ZipError::format("archive comment longer than 65535 bytes"));
        }
        *self.comment.write() = comment.to_vec();
        self.touch();
        Ok(())
    }

    /// Entries in write-back order, without the root.
    fn ordered_entries(&self) -> Vec<Arc<ArchiveEntry>> {
        let mut entries: Vec<Arc<ArchiveEntry>> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_root())
            .map(|e| e.value().clone())
            .collect();
        if self.config.maintain_order {
            entries.sort_by_key(|e| e.id());
        } else {
            entries.sort_by(|a, b| {
                b.is_directory()
                    .cmp(&a.is_directory())
                    .then(a.name().len().cmp(&b.name().len()))
                    .then_with(|| a.name().cmp(b.name()))
            });
        }
        entries
    }

    /// Write the whole tree back to the archive file if anything changed.
    ///
    /// The new archive goes to a temporary file in the same directory, which is
    /// synced and then renamed over the original. Returns `None` when there was
    /// nothing to write.
    pub fn flush(&self) -> Result<Option<WriteSummary>> {
        self.ensure_open()?;
        if self.config.read_only {
            return Ok(None);
        }
        let _guard = self.flush_lock.lock();
        let generation = self.generation.load(Ordering::Acquire);
        if generation == self.persisted.load(Ordering::Acquire) {
            return Ok(None);
        }

        let entries = self.ordered_entries();
        let comment = self.comment();
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut temp = tempfile::Builder::new()
            .prefix(".zipvfs-")
            .suffix(".tmp")
            .tempfile_in(&dir)?;
        if let Ok(existing) = std::fs::metadata(&self.path) {
            temp.as_file().set_permissions(existing.permissions())?;
        }
        let summary = {
            let out = std::io::BufWriter::new(temp.as_file_mut());
            writer::write_archive(out, &entries, &comment, &self.pool, &self.cache)?
        };
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| ZipError::Io(e.error))?;

        self.persisted.store(generation, Ordering::Release);
        info!(
            path = %self.path.display(),
            entries = summary.entries,
            bytes = summary.bytes,
            zip64 = summary.zip64,
            "flushed archive"
        );
        Ok(Some(summary))
    }

    /// Flush, then release every entry. Later calls fail with
    /// [`ZipError::Closed`]; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.flush()?;
        self.closed.store(true, Ordering::Release);
        self.entries.clear();
        self.cache.clear();
        debug!(path = %self.path.display(), "closed archive");
        Ok(())
    }

    /// Check that every entry's parent exists and that child sets mirror the map.
    pub fn check_consistency(&self) -> Result<()> {
        let snapshot: Vec<Arc<ArchiveEntry>> = self.entries.iter().map(|e| e.value().clone()).collect();
        for item in &snapshot {
            for child in item.children() {
                if entry::parent_name(&child) != Some(item.name()) || !self.exists(&child) {
                    return Err(ZipError::Consistency(format!(
                        "{} lists stray child {}",
                        item.display_name(),
                        String::from_utf8_lossy(&child)
                    )));
                }
            }
            let Some(parent) = entry::parent_name(item.name()) else {
                continue;
            };
            let listed = self
                .lookup(parent)
                .is_some_and(|p| p.children().iter().any(|c| c.as_slice() == item.name()));
            if !listed {
                return Err(ZipError::Consistency(format!(
                    "{} is not listed by its parent",
                    item.display_name()
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for DirectoryTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryTree")
            .field("path", &self.path)
            .field("entries", &self.len())
            .field("dirty", &self.is_dirty())
            .field("closed", &self.is_closed())
            .finish()
    }
}
