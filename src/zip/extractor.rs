use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, ZipError};

use super::tree::DirectoryTree;

/// What happened to one entry during extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    File { path: PathBuf, bytes: u64 },
    Directory(PathBuf),
    /// Target exists and overwriting is off
    Skipped(PathBuf),
    /// Name would escape the destination directory
    Unsafe,
}

/// Copies entries out of a [`DirectoryTree`] onto the local filesystem.
pub struct Extractor<'a> {
    tree: &'a DirectoryTree,
    overwrite: bool,
    junk_paths: bool,
}

impl<'a> Extractor<'a> {
    pub fn new(tree: &'a DirectoryTree) -> Self {
        Self {
            tree,
            overwrite: false,
            junk_paths: false,
        }
    }

    /// Replace existing files instead of skipping them.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Drop the directory part of entry names.
    pub fn junk_paths(mut self, junk_paths: bool) -> Self {
        self.junk_paths = junk_paths;
        self
    }

    /// Stream file `name` to `out`; returns the number of bytes written.
    pub fn extract_to_writer<W: Write>(&self, name: &[u8], out: &mut W) -> Result<u64> {
        let content = self.tree.content(name)?;
        content.traverse(|chunk| {
            out.write_all(chunk)?;
            Ok(chunk.len())
        })
    }

    /// Write file `name` to `path`, creating parent directories.
    pub fn extract_to_file(&self, name: &[u8], path: &Path) -> Result<u64> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = std::io::BufWriter::new(fs::File::create(path)?);
        let bytes = self.extract_to_writer(name, &mut file)?;
        file.flush()?;
        Ok(bytes)
    }

    /// Where entry `name` lands below `dest`, or `None` when the name is absolute
    /// or climbs out with `..`.
    pub fn output_path(&self, name: &[u8], dest: &Path) -> Option<PathBuf> {
        let name = String::from_utf8_lossy(name);
        let relative = Path::new(name.trim_end_matches('/'));
        if relative.as_os_str().is_empty() {
            return None;
        }
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        if self.junk_paths {
            return relative.file_name().map(|f| dest.join(f));
        }
        Some(dest.join(relative))
    }

    /// Extract one entry below `dest`.
    pub fn extract_into(&self, name: &[u8], dest: &Path) -> Result<Extracted> {
        let Some(path) = self.output_path(name, dest) else {
            warn!(name = %String::from_utf8_lossy(name), "refusing to extract outside the destination");
            return Ok(Extracted::Unsafe);
        };

        let entry = self.tree.get(name)?;
        if entry.is_directory() {
            if !self.junk_paths {
                fs::create_dir_all(&path)?;
            }
            return Ok(Extracted::Directory(path));
        }

        if path.exists() && !self.overwrite {
            debug!(path = %path.display(), "skipping existing file");
            return Ok(Extracted::Skipped(path));
        }
        let bytes = self.extract_to_file(name, &path)?;
        Ok(Extracted::File { path, bytes })
    }

    /// Extract every entry accepted by `predicate`, directories first.
    pub fn extract_matching(
        &self,
        dest: &Path,
        predicate: impl Fn(&[u8]) -> bool,
    ) -> Result<Vec<(Vec<u8>, Extracted)>> {
        let mut names = self.tree.matching(predicate);
        names.sort_by_key(|n| !super::entry::is_directory_name(n));
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            match self.extract_into(&name, dest) {
                Ok(outcome) => results.push((name, outcome)),
                // Removed concurrently since listing.
                Err(ZipError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }
}
