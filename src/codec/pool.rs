use crossbeam::queue::SegQueue;
use tracing::debug;

use super::{StreamCodec, new_deflater, new_inflater};
use crate::error::Result;

type Factory = Box<dyn Fn() -> Box<dyn StreamCodec> + Send + Sync>;

/// Unbounded lock-free free list of one kind of engine.
struct FreeList {
    kind: &'static str,
    free: SegQueue<Box<dyn StreamCodec>>,
    make: Factory,
}

impl FreeList {
    fn new(kind: &'static str, make: Factory) -> Self {
        Self {
            kind,
            free: SegQueue::new(),
            make,
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut dyn StreamCodec) -> Result<T>) -> Result<T> {
        let mut codec = match self.free.pop() {
            Some(codec) => codec,
            None => {
                debug!(kind = self.kind, "allocating codec");
                (self.make)()
            }
        };
        let result = f(codec.as_mut());
        codec.reset();
        self.free.push(codec);
        result
    }
}

/// Reusable inflate/deflate engines shared by every entry of one archive.
///
/// Engines are borrowed for the duration of a closure and are always reset and
/// returned afterwards, whether the closure succeeded or not.
pub struct CodecPool {
    inflaters: FreeList,
    deflaters: FreeList,
}

impl CodecPool {
    /// Pool of flate2 engines; `level` applies to deflate output.
    pub fn new(level: u32) -> Self {
        Self::with_factories(
            || Box::new(new_inflater()),
            move || Box::new(new_deflater(level)),
        )
    }

    /// Pool built from custom engine constructors.
    pub fn with_factories<I, D>(inflate: I, deflate: D) -> Self
    where
        I: Fn() -> Box<dyn StreamCodec> + Send + Sync + 'static,
        D: Fn() -> Box<dyn StreamCodec> + Send + Sync + 'static,
    {
        Self {
            inflaters: FreeList::new("inflate", Box::new(inflate)),
            deflaters: FreeList::new("deflate", Box::new(deflate)),
        }
    }

    /// Run `f` with a borrowed inflate engine.
    pub fn with_inflater<T>(&self, f: impl FnOnce(&mut dyn StreamCodec) -> Result<T>) -> Result<T> {
        self.inflaters.with(f)
    }

    /// Run `f` with a borrowed deflate engine.
    pub fn with_deflater<T>(&self, f: impl FnOnce(&mut dyn StreamCodec) -> Result<T>) -> Result<T> {
        self.deflaters.with(f)
    }

    pub fn idle_inflaters(&self) -> usize {
        self.inflaters.free.len()
    }

    pub fn idle_deflaters(&self) -> usize {
        self.deflaters.free.len()
    }
}

impl Default for CodecPool {
    fn default() -> Self {
        Self::new(6)
    }
}

impl std::fmt::Debug for CodecPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecPool")
            .field("idle_inflaters", &self.idle_inflaters())
            .field("idle_deflaters", &self.idle_deflaters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ZipError;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn engines_are_recycled() {
        let pool = CodecPool::default();
        assert_eq!(pool.idle_inflaters(), 0);
        pool.with_inflater(|_| Ok(())).unwrap();
        pool.with_inflater(|_| Ok(())).unwrap();
        assert_eq!(pool.idle_inflaters(), 1);
        assert_eq!(pool.idle_deflaters(), 0);
    }

    #[test]
    fn engines_come_back_after_failure() {
        let pool = CodecPool::default();
        let err = pool
            .with_deflater(|_| -> Result<()> { Err(ZipError::format("boom")) })
            .unwrap_err();
        assert!(matches!(err, ZipError::Format(_)));
        assert_eq!(pool.idle_deflaters(), 1);
    }

    #[test]
    fn nested_borrows_allocate_a_second_engine() {
        let pool = CodecPool::default();
        pool.with_inflater(|_| pool.with_inflater(|_| Ok(()))).unwrap();
        assert_eq!(pool.idle_inflaters(), 2);
    }

    #[test]
    fn concurrent_borrowers_share_the_pool() {
        let pool = Arc::new(CodecPool::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..50 {
                        pool.with_deflater(|_| Ok(())).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let idle = pool.idle_deflaters();
        assert!((1..=8).contains(&idle));
    }
}
