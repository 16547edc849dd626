//! ZIP archive parsing, mutation and write-back.
//!
//! ## Architecture
//!
//! - [`structures`]: Data structures representing ZIP format elements (EOCD, file headers, etc.)
//! - [`parser`]: Locating and decoding the central directory of an archive buffer
//! - [`store`]: Per-entry compressed/uncompressed content and the transforms between them
//! - [`tree`]: The mutable path tree of an open archive, with flush
//! - [`writer`]: Serialization of a tree back into archive bytes
//! - [`extractor`]: Copying entries out to the local filesystem
//!
//! ## ZIP Format Overview
//!
//! A ZIP file consists of:
//! 1. Local file headers and compressed data for each file
//! 2. Central Directory with metadata for all files
//! 3. End of Central Directory (EOCD) record at the end
//!
//! The EOCD is read first (from the end of the buffer), then the Central
//! Directory. Entry data stays compressed in the archive buffer until read.
//!
//! ## Supported Features
//!
//! - Standard ZIP format (PKZIP APPNOTE 6.3.x compatible)
//! - ZIP64 extensions for entries and archives larger than 4GB, read and write
//! - STORED (no compression) method
//! - DEFLATE compression method
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - No BZIP2, LZMA, or other compression methods

mod cache;
mod entry;
mod extractor;
mod parser;
mod store;
mod stream;
mod structures;
mod tree;
mod writer;

pub use cache::DecompressionCache;
pub use entry::{
    ArchiveEntry, EntryMeta, EntryMetadata, ROOT, SEPARATOR, ancestors, is_directory_name,
    parent_name,
};
pub use extractor::{Extracted, Extractor};
pub use parser::{ArchiveReader, CentralDirectory, DirectoryLocation, RawEntry};
pub use store::{CompressionState, Slice, checksum};
pub use stream::{EntryReader, EntryWriter};
pub use structures::*;
pub use tree::DirectoryTree;
pub use writer::{WriteSummary, write_archive};
