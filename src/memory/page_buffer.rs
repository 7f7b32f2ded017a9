//! # Page Buffer Pool
//!
//! Pool of page-sized byte buffers reused across commits.
//!
//! Single-page allocations during a write transaction draw from here, and
//! commit returns their buffers once the bytes are on disk, so a steady
//! write workload stops allocating after warm-up. Buffers are zeroed on
//! release; a freshly acquired buffer is always all zeroes. Multi-page
//! runs (overflow pages) bypass the pool since their sizes vary.
//!
//! A single mutex suffices: only the one writer and the occasional open
//! path ever touch the pool.

use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PagePool {
    inner: Arc<PagePoolInner>,
}

#[derive(Debug)]
struct PagePoolInner {
    page_size: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl PagePool {
    pub fn new(page_size: usize, initial_capacity: usize) -> Self {
        let buffers = (0..initial_capacity)
            .map(|_| vec![0u8; page_size])
            .collect();
        Self {
            inner: Arc::new(PagePoolInner {
                page_size,
                buffers: Mutex::new(buffers),
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Pops a zeroed page buffer, allocating when the pool is empty.
    pub fn acquire(&self) -> Vec<u8> {
        self.inner
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.page_size])
    }

    /// Returns a buffer to the pool. Buffers of any other size (overflow
    /// runs) are dropped instead of pooled.
    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.len() != self.inner.page_size {
            return;
        }
        buf.fill(0);
        self.inner.buffers.lock().push(buf);
    }

    pub fn available(&self) -> usize {
        self.inner.buffers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_cycle_buffers() {
        let pool = PagePool::new(512, 2);
        assert_eq!(pool.available(), 2);

        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.available(), 0);

        // Pool empty, this allocates.
        let c = pool.acquire();
        assert_eq!(c.len(), 512);

        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn released_buffers_come_back_zeroed() {
        let pool = PagePool::new(64, 1);

        let mut buf = pool.acquire();
        buf.fill(0xAB);
        pool.release(buf);

        let buf = pool.acquire();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn oversized_buffers_are_not_pooled() {
        let pool = PagePool::new(64, 0);

        pool.release(vec![0u8; 128]);

        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn clones_share_the_pool() {
        let pool = PagePool::new(64, 1);
        let other = pool.clone();

        let _buf = pool.acquire();
        assert_eq!(other.available(), 0);
    }
}
