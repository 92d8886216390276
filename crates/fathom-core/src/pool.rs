//! Bounded pool of fixed-size receive buffers.
//!
//! Slabs are allocated once at construction and recycled: the receive path
//! pops one before reading a datagram, the emit path pushes it back after
//! the data has been consumed. An empty pool means the receiver is outrunning
//! the consumer; callers drop the datagram and log.

use std::sync::RwLock;

pub struct SlicePool {
    free: RwLock<Vec<Box<[u8]>>>,
    slab_size: usize,
    capacity: usize,
}

impl SlicePool {
    /// Pre-allocate `count` zeroed slabs of `slab_size` bytes each.
    pub fn new(count: usize, slab_size: usize) -> Self {
        let free = (0..count)
            .map(|_| vec![0u8; slab_size].into_boxed_slice())
            .collect();
        Self { free: RwLock::new(free), slab_size, capacity: count }
    }

    /// Take a free slab, if any.
    pub fn pop(&self) -> Option<Box<[u8]>> {
        self.free.write().expect("pool lock poisoned").pop()
    }

    /// Return a slab to the pool.
    pub fn push(&self, slab: Box<[u8]>) {
        debug_assert_eq!(slab.len(), self.slab_size);
        self.free.write().expect("pool lock poisoned").push(slab);
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.read().expect("pool lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_bounded() {
        let pool = SlicePool::new(2, 64);
        let a = pool.pop().unwrap();
        let _b = pool.pop().unwrap();
        assert!(pool.pop().is_none());
        assert_eq!(pool.available(), 0);

        pool.push(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.pop().is_some());
    }

    #[test]
    fn slabs_have_requested_size() {
        let pool = SlicePool::new(1, 4096);
        let slab = pool.pop().unwrap();
        assert_eq!(slab.len(), 4096);
        assert_eq!(pool.slab_size(), 4096);
        assert_eq!(pool.capacity(), 1);
    }
}
