//! Options controlling how an archive is opened and written back.

use crate::zip::CompressionMethod;

/// Default DEFLATE level for rewritten entries.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Default byte budget of the decompression cache (256 MiB).
pub const DEFAULT_CACHE_BUDGET: u64 = 256 * 1024 * 1024;

/// Archive open options.
///
/// ```
/// use zipvfs::ArchiveConfig;
///
/// let config = ArchiveConfig::default().maintain_order(true).compression_level(9);
/// assert!(config.maintain_order);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// Reject every mutation with [`ZipError::ReadOnly`](crate::ZipError::ReadOnly)
    pub read_only: bool,
    /// Write entries in insertion order instead of directories-then-files
    pub maintain_order: bool,
    /// DEFLATE level, 0 to 9
    pub compression_level: u32,
    /// Method for entries whose content is written through the tree
    pub default_method: CompressionMethod,
    /// Upper bound, in bytes, of decompressed content kept by the cache
    pub cache_budget: u64,
    /// Map the archive file instead of reading it into memory
    pub prefer_mmap: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            maintain_order: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            default_method: CompressionMethod::Deflate,
            cache_budget: DEFAULT_CACHE_BUDGET,
            prefer_mmap: true,
        }
    }
}

impl ArchiveConfig {
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn maintain_order(mut self, maintain_order: bool) -> Self {
        self.maintain_order = maintain_order;
        self
    }

    /// Levels above 9 are clamped.
    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    pub fn default_method(mut self, method: CompressionMethod) -> Self {
        self.default_method = method;
        self
    }

    pub fn cache_budget(mut self, bytes: u64) -> Self {
        self.cache_budget = bytes;
        self
    }

    pub fn prefer_mmap(mut self, prefer_mmap: bool) -> Self {
        self.prefer_mmap = prefer_mmap;
        self
    }
}
