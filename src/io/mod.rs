//! Backing storage for archives and entry content.
//!
//! - [`SegmentedBuffer`]: 64-bit addressable bytes over fixed-capacity segments
//! - [`open_file`]: load an archive from disk, memory mapped when possible

mod local;
mod segmented;

pub use local::open_file;
pub use segmented::{SEGMENT_MAX, SegmentedBuffer};
