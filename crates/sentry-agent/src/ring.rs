//! Fixed-capacity FIFO buffers for connections and signatures awaiting a
//! batch upload (spec.md §4.12): a full buffer drops the oldest entry
//! rather than the incoming one, so a slow manager never blocks capture.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Bounded, oldest-drop FIFO buffer.
pub struct RingBuffer<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    dropped: std::sync::atomic::AtomicU64,
}

impl<T> RingBuffer<T> {
    /// Build a buffer holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), items: Mutex::new(VecDeque::with_capacity(capacity)), dropped: std::sync::atomic::AtomicU64::new(0) }
    }

    /// Push one item, evicting the oldest if the buffer is full.
    pub fn push(&self, item: T) {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            items.pop_front();
            self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        items.push_back(item);
    }

    /// Drain every buffered item in FIFO order, leaving the buffer empty.
    /// Callers should only drain once the drained batch has been delivered;
    /// re-push on failure to retry (spec.md §4.12: "at-least-once").
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    /// Push a whole batch back onto the front of the buffer, preserving
    /// order, used when a delivery attempt ultimately fails.
    pub fn requeue_front(&self, batch: Vec<T>) {
        let mut items = self.items.lock();
        for item in batch.into_iter().rev() {
            if items.len() >= self.capacity {
                items.pop_back();
                self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            items.push_front(item);
        }
    }

    /// Current item count.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of items evicted for capacity since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest() {
        let ring = RingBuffer::new(2);
        ring.push(1);
        ring.push(2);
        ring.push(3);
        assert_eq!(ring.drain(), vec![2, 3]);
        assert_eq!(ring.dropped(), 1);
    }

    #[test]
    fn requeue_front_preserves_order_for_retry() {
        let ring = RingBuffer::new(4);
        ring.push(1);
        ring.push(2);
        let batch = ring.drain();
        ring.push(3);
        ring.requeue_front(batch);
        assert_eq!(ring.drain(), vec![1, 2, 3]);
    }
}
