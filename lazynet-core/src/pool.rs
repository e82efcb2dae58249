use std::mem;
use std::sync::{Arc, Mutex};

/// Max size of all pooled buffers, in bytes.
const MAX_BUFFERS_SIZE: usize = 1024 * 1024 * 1024;
/// When total pooled bytes exceed this, trim largest buffers down to this level.
const TRIM_THRESHOLD: usize = MAX_BUFFERS_SIZE / 2;

/// Tracks pool usage statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    /// Current total capacity of all pooled buffers, in bytes.
    pub current_size: usize,
    /// Number of buffers waiting in the pool.
    pub pooled: usize,
    /// Number of times a buffer was reused instead of allocated.
    pub hits: usize,
    /// Number of times a new buffer was allocated.
    pub misses: usize,
    /// Number of times a buffer was dropped due to pool size cap.
    pub drops: usize,
}

/// A simple buffer pool to reuse `f32` allocations across batches.
#[derive(Debug, Default)]
pub struct BufferPool {
    pool: Vec<Vec<f32>>,
    metrics: PoolMetrics,
}

impl BufferPool {
    /// Grab an empty Vec with at least `capacity`, reusing the smallest
    /// pooled buffer that fits.
    fn get_empty_buffer(&mut self, capacity: usize) -> Vec<f32> {
        let mut smallest_found_buf: Option<usize> = None;
        for (i, buf) in self.pool.iter().enumerate() {
            if buf.capacity() < capacity {
                continue;
            }
            let smaller = smallest_found_buf
                .map_or(true, |found| self.pool[found].capacity() > buf.capacity());
            if smaller {
                smallest_found_buf = Some(i);
            }
        }

        if let Some(idx) = smallest_found_buf {
            self.metrics.hits += 1;
            let mut buf = self.pool.swap_remove(idx);
            self.metrics.current_size = self
                .metrics
                .current_size
                .saturating_sub(buf.capacity() * mem::size_of::<f32>());
            self.metrics.pooled = self.pool.len();
            buf.clear();
            buf
        } else {
            self.metrics.misses += 1;
            Vec::with_capacity(capacity)
        }
    }

    /// Return a Vec back into the pool for reuse.
    fn recycle_buffer(&mut self, buf: Vec<f32>) {
        let buffer_bytes = buf.capacity() * mem::size_of::<f32>();
        if buffer_bytes == 0 {
            return;
        }
        if self.metrics.current_size + buffer_bytes <= MAX_BUFFERS_SIZE {
            self.metrics.current_size += buffer_bytes;
            self.pool.push(buf);
            self.trim_excess();
        } else {
            self.metrics.drops += 1;
        }
        self.metrics.pooled = self.pool.len();
    }

    /// Remove largest buffers until total pooled bytes <= TRIM_THRESHOLD.
    fn trim_excess(&mut self) {
        while self.metrics.current_size > TRIM_THRESHOLD {
            let mut max_idx = 0;
            let mut max_bytes = 0;
            for (i, buf) in self.pool.iter().enumerate() {
                let bbytes = buf.capacity() * mem::size_of::<f32>();
                if bbytes > max_bytes {
                    max_bytes = bbytes;
                    max_idx = i;
                }
            }
            self.pool.swap_remove(max_idx);
            self.metrics.current_size = self.metrics.current_size.saturating_sub(max_bytes);
            self.metrics.drops += 1;
        }
    }
}

/// Thread-safe handle to a [`BufferPool`]; buffers travel to backend threads
/// and recycle from there.
#[derive(Debug, Clone, Default)]
pub struct SharedPool(Arc<Mutex<BufferPool>>);

impl SharedPool {
    /// A zero-filled buffer of `len` elements.
    pub fn zeroed(&self, len: usize) -> PooledBuffer {
        self.filled(len, 0.0)
    }

    pub fn filled(&self, len: usize, value: f32) -> PooledBuffer {
        let mut buf = match self.0.lock() {
            Ok(mut pool) => pool.get_empty_buffer(len),
            Err(_) => Vec::with_capacity(len),
        };
        buf.resize(len, value);
        PooledBuffer {
            buf,
            pool: Some(self.clone()),
        }
    }

    pub fn from_slice(&self, data: &[f32]) -> PooledBuffer {
        let mut buf = match self.0.lock() {
            Ok(mut pool) => pool.get_empty_buffer(data.len()),
            Err(_) => Vec::with_capacity(data.len()),
        };
        buf.extend_from_slice(data);
        PooledBuffer {
            buf,
            pool: Some(self.clone()),
        }
    }

    /// Wrap an already filled buffer so it recycles into this pool.
    pub fn adopt(&self, buf: Vec<f32>) -> PooledBuffer {
        PooledBuffer {
            buf,
            pool: Some(self.clone()),
        }
    }

    /// Returns a snapshot of current pool metrics.
    pub fn metrics(&self) -> PoolMetrics {
        self.0
            .lock()
            .map(|pool| pool.metrics.clone())
            .unwrap_or_default()
    }
}

/// Wrapper around `Vec<f32>` that returns its buffer to the pool on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<f32>,
    pool: Option<SharedPool>,
}

impl PooledBuffer {
    /// A buffer that is simply freed on drop.
    pub fn detached(buf: Vec<f32>) -> Self {
        PooledBuffer { buf, pool: None }
    }

    /// Consume the wrapper and return the inner Vec without recycling.
    pub fn into_inner(mut self) -> Vec<f32> {
        self.pool = None;
        mem::take(&mut self.buf)
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<f32>;
    fn deref(&self) -> &Vec<f32> {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<f32> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let buf = mem::take(&mut self.buf);
            if let Ok(mut pool) = pool.0.lock() {
                pool.recycle_buffer(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_recycled_buffers() {
        let pool = SharedPool::default();
        drop(pool.zeroed(16));
        assert_eq!(pool.metrics().pooled, 1);
        let b = pool.filled(8, 2.0);
        assert_eq!(b.as_slice(), &[2.0; 8]);
        let m = pool.metrics();
        assert_eq!((m.hits, m.misses, m.pooled), (1, 1, 0));
    }

    #[test]
    fn into_inner_skips_recycling() {
        let pool = SharedPool::default();
        let v = pool.from_slice(&[1.0, 2.0]).into_inner();
        assert_eq!(v, vec![1.0, 2.0]);
        assert_eq!(pool.metrics().pooled, 0);
    }
}
