//! # zipvfs
//!
//! A read/write virtual filesystem over ZIP/JAR archives.
//!
//! An archive is opened as a [`DirectoryTree`]: a concurrent map from entry names
//! to entries, with directories tracking their children. Entry content is
//! decompressed on demand and cached, writes replace content in memory, and
//! [`DirectoryTree::flush`] rewrites the whole archive atomically.
//!
//! Archives and entries may be larger than 4GB: bytes live in a
//! [`SegmentedBuffer`](io::SegmentedBuffer) addressed with 64-bit offsets, and
//! ZIP64 records are read and written as needed.
//!
//! ## Features
//!
//! - Memory mapped archives, with a streaming fallback
//! - STORED and DEFLATE entries, with pooled codecs and an evictable cache
//! - Create, remove, copy and move entries; archive and entry comments
//! - ZIP64 input and output
//! - Crash safe write-back through a temporary file and rename
//!
//! ## Example
//!
//! ```no_run
//! use zipvfs::{ArchiveConfig, DirectoryTree};
//!
//! fn main() -> zipvfs::Result<()> {
//!     let tree = DirectoryTree::open("app.jar", ArchiveConfig::default())?;
//!     for name in tree.names() {
//!         println!("{}", String::from_utf8_lossy(&name));
//!     }
//!
//!     tree.create_directories(b"META-INF/")?;
//!     tree.write(b"META-INF/NOTICE", b"patched\n")?;
//!     tree.close()?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod io;
pub mod zip;

pub use cli::Cli;
pub use config::ArchiveConfig;
pub use error::{Result, ZipError};
pub use io::SegmentedBuffer;
pub use zip::{
    ArchiveEntry, CompressionMethod, DirectoryTree, DosDateTime, EntryMetadata, EntryReader,
    EntryWriter, Extractor,
};
