use crate::codec::Compressor;
use crate::config::Level;
use parking_lot::Mutex;
use tracing::trace;

/// Idle compressors kept by [`CompressorPool::new`].
pub const DEFAULT_MAX_IDLE: usize = 64;

/// A concurrency-safe pool of [`Compressor`]s sharing one compression level.
///
/// Acquisition never waits: an empty pool allocates a new compressor. A
/// compressor is moved out on [`get`](Self::get) and moved back on
/// [`put`](Self::put), so two requests can never hold the same instance.
/// At most `max_idle` compressors are kept; extras are dropped on return.
#[derive(Debug)]
pub struct CompressorPool {
    level: Level,
    max_idle: usize,
    idle: Mutex<Vec<Compressor>>,
}

impl CompressorPool {
    /// Creates an empty pool producing compressors at `level`.
    pub fn new(level: Level) -> Self {
        Self::with_max_idle(level, DEFAULT_MAX_IDLE)
    }

    /// Creates an empty pool that keeps at most `max_idle` idle compressors.
    pub fn with_max_idle(level: Level, max_idle: usize) -> Self {
        Self {
            level,
            max_idle,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Maximum number of idle compressors retained.
    pub fn max_idle(&self) -> usize {
        self.max_idle
    }

    /// Level of every compressor in this pool.
    pub fn level(&self) -> Level {
        self.level
    }

    /// Takes a reset compressor from the pool, allocating one if none is idle.
    pub fn get(&self) -> Compressor {
        let idle = self.idle.lock().pop();
        match idle {
            Some(mut compressor) => {
                compressor.reset();
                compressor
            }
            None => Compressor::new(self.level),
        }
    }

    /// Returns a compressor to the pool, dropping it if the pool is full.
    pub fn put(&self, compressor: Compressor) {
        let mut idle = self.idle.lock();
        if idle.len() >= self.max_idle {
            trace!(max_idle = self.max_idle, "pool full, dropping compressor");
            return;
        }
        idle.push(compressor);
    }

    /// Number of compressors currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn test_empty_pool_allocates() {
        let pool = CompressorPool::new(Level::Default);
        let a = pool.get();
        let b = pool.get();
        assert_eq!(pool.idle(), 0);
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_reused_compressor_is_reset() {
        let pool = CompressorPool::new(Level::Default);
        let mut compressor = pool.get();
        // Leave a half-written stream behind.
        compressor.compress(b"abandoned").unwrap();
        pool.put(compressor);

        let mut compressor = pool.get();
        assert_eq!(pool.idle(), 0);
        let mut out = compressor.compress(b"fresh").unwrap().to_vec();
        out.extend_from_slice(compressor.finish().unwrap());

        let mut decoded = Vec::new();
        GzDecoder::new(out.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, b"fresh");
    }

    #[test]
    fn test_concurrent_use() {
        let pool = CompressorPool::new(Level::Precise(1));
        std::thread::scope(|scope| {
            for worker in 0..8 {
                let pool = &pool;
                scope.spawn(move || {
                    for round in 0..50 {
                        let body = format!("worker {worker} round {round} ").repeat(20);
                        let mut compressor = pool.get();
                        let mut out = compressor.compress(body.as_bytes()).unwrap().to_vec();
                        out.extend_from_slice(compressor.finish().unwrap());
                        pool.put(compressor);

                        let mut decoded = String::new();
                        GzDecoder::new(out.as_slice())
                            .read_to_string(&mut decoded)
                            .unwrap();
                        assert_eq!(decoded, body);
                    }
                });
            }
        });
        assert!(pool.idle() >= 1 && pool.idle() <= 8);
    }

    #[test]
    fn test_idle_capped() {
        let pool = CompressorPool::with_max_idle(Level::Default, 2);
        let held: Vec<_> = (0..3).map(|_| pool.get()).collect();
        for compressor in held {
            pool.put(compressor);
        }
        assert_eq!(pool.idle(), 2);

        let empty = CompressorPool::with_max_idle(Level::Default, 0);
        empty.put(empty.get());
        assert_eq!(empty.idle(), 0);
        assert_eq!(CompressorPool::new(Level::Default).max_idle(), DEFAULT_MAX_IDLE);
    }
}
