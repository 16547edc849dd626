//! Streaming compression engines.
//!
//! The archive only needs raw (headerless) DEFLATE, driven incrementally so that
//! neither side of a transform ever has to fit in a single allocation. Engines are
//! expressed through [`StreamCodec`] so the flate2 backend can be swapped, and are
//! recycled through a [`CodecPool`] owned by each open archive.

mod pool;

pub use pool::CodecPool;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Result, ZipError};

/// Outcome of a single [`StreamCodec::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Input bytes consumed
    pub consumed: usize,
    /// Output bytes written
    pub produced: usize,
    /// The engine has emitted the end of the stream
    pub done: bool,
}

/// A resettable streaming transform: feed input, drain output, query completion.
pub trait StreamCodec: Send {
    /// Consume as much of `input` as possible, writing into `output`.
    ///
    /// `finish` tells the engine that no input follows `input`, so it must flush
    /// and terminate the stream once everything has been written.
    fn process(&mut self, input: &[u8], output: &mut [u8], finish: bool) -> Result<Progress>;

    /// Return the engine to its initial state so it can start a new stream.
    fn reset(&mut self);
}

/// Raw inflate engine (no zlib wrapper).
pub fn new_inflater() -> Decompress {
    Decompress::new(false)
}

/// Raw deflate engine (no zlib wrapper) at the given level.
pub fn new_deflater(level: u32) -> Compress {
    Compress::new(Compression::new(level.min(9)), false)
}

impl StreamCodec for Decompress {
    fn process(&mut self, input: &[u8], output: &mut [u8], finish: bool) -> Result<Progress> {
        let before_in = self.total_in();
        let before_out = self.total_out();
        let flush = if finish {
            FlushDecompress::Finish
        } else {
            FlushDecompress::None
        };
        let status = self
            .decompress(input, output, flush)
            .map_err(|e| ZipError::format(format!("corrupt deflate stream: {e}")))?;
        Ok(Progress {
            consumed: (self.total_in() - before_in) as usize,
            produced: (self.total_out() - before_out) as usize,
            done: status == Status::StreamEnd,
        })
    }

    fn reset(&mut self) {
        Decompress::reset(self, false);
    }
}

impl StreamCodec for Compress {
    fn process(&mut self, input: &[u8], output: &mut [u8], finish: bool) -> Result<Progress> {
        let before_in = self.total_in();
        let before_out = self.total_out();
        let flush = if finish {
            FlushCompress::Finish
        } else {
            FlushCompress::None
        };
        let status = self
            .compress(input, output, flush)
            .map_err(|e| ZipError::format(format!("deflate failed: {e}")))?;
        Ok(Progress {
            consumed: (self.total_in() - before_in) as usize,
            produced: (self.total_out() - before_out) as usize,
            done: status == Status::StreamEnd,
        })
    }

    fn reset(&mut self) {
        Compress::reset(self);
    }
}
