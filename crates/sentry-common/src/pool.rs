//! Generic reset-on-acquire object pool.
//!
//! Mirrors the reset discipline of the source's buffer pools (connection,
//! payload and stream-struct pools) without the raw-pointer free list: a
//! `crossbeam::queue::ArrayQueue` gives the same bounded, thread-safe
//! free-list semantics with safe code.

use crossbeam::queue::ArrayQueue;
use std::sync::Arc;

/// A type that can be returned to a pool and reused after resetting its
/// state. `reset` must leave the value indistinguishable from one freshly
/// constructed by `Default`.
pub trait Resettable: Default {
    /// Clear all fields back to their zero/empty state.
    fn reset(&mut self);
}

/// Fixed-capacity pool of reusable `T`s.
pub struct Pool<T: Resettable> {
    free: Arc<ArrayQueue<T>>,
}

impl<T: Resettable> Pool<T> {
    /// Create a pool that holds at most `capacity` idle items.
    pub fn new(capacity: usize) -> Self {
        Self { free: Arc::new(ArrayQueue::new(capacity.max(1))) }
    }

    /// Acquire an item, reset and ready for use. Allocates a fresh one if
    /// the free list is empty.
    pub fn get(&self) -> T {
        match self.free.pop() {
            Some(mut item) => {
                item.reset();
                item
            }
            None => T::default(),
        }
    }

    /// Return an item to the pool. Dropped silently if the pool is full.
    pub fn put(&self, item: T) {
        let _ = self.free.push(item);
    }

    /// Number of idle items currently held.
    pub fn idle_len(&self) -> usize {
        self.free.len()
    }
}

impl<T: Resettable> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self { free: self.free.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Buf {
        data: Vec<u8>,
    }

    impl Resettable for Buf {
        fn reset(&mut self) {
            self.data.clear();
        }
    }

    #[test]
    fn get_after_put_is_reset() {
        let pool: Pool<Buf> = Pool::new(4);
        let mut buf = pool.get();
        buf.data.extend_from_slice(b"hello");
        pool.put(buf);

        let buf2 = pool.get();
        assert!(buf2.data.is_empty());
    }

    #[test]
    fn get_on_empty_pool_allocates_fresh() {
        let pool: Pool<Buf> = Pool::new(1);
        let buf = pool.get();
        assert!(buf.data.is_empty());
    }
}
