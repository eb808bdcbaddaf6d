//! In-memory packet source used when a strategy's underlying mechanism is
//! unavailable on the host (no PF_RING userspace library, non-Linux eBPF)
//! or under test.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use sentry_common::SentryError;

use crate::{CaptureConfig, CaptureInfo, CaptureStrategy, PacketDataSource};

/// Shared queue a test (or a degraded strategy) can push frames into.
#[derive(Clone, Default)]
pub struct SimulatedFeed {
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    received: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl SimulatedFeed {
    /// Queue a raw frame for the next read.
    pub fn push(&self, frame: Vec<u8>) {
        self.queue.lock().unwrap().push_back(frame);
    }
}

/// A `PacketDataSource` that reads from an in-memory queue instead of the
/// kernel, blocking briefly rather than forever when empty.
pub struct SimulatedSource {
    feed: SimulatedFeed,
}

impl PacketDataSource for SimulatedSource {
    fn read_packet_data(&mut self) -> Result<(Vec<u8>, CaptureInfo), SentryError> {
        loop {
            if let Some(frame) = self.feed.queue.lock().unwrap().pop_front() {
                self.feed.received.fetch_add(1, Ordering::Relaxed);
                let info = CaptureInfo {
                    timestamp: SystemTime::now(),
                    capture_len: frame.len() as u32,
                    wire_len: frame.len() as u32,
                };
                return Ok((frame, info));
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}

/// Strategy wrapper so `SimulatedSource` can stand in for any strategy name.
#[derive(Default)]
pub struct SimulatedStrategy {
    feed: SimulatedFeed,
}

impl SimulatedStrategy {
    /// Expose the feed so callers (or a degraded real strategy) can inject frames.
    pub fn feed(&self) -> SimulatedFeed {
        self.feed.clone()
    }
}

impl CaptureStrategy for SimulatedStrategy {
    fn open(&mut self, _config: &CaptureConfig) -> Result<Vec<Box<dyn PacketDataSource>>, SentryError> {
        Ok(vec![Box::new(SimulatedSource { feed: self.feed.clone() })])
    }

    fn close(&mut self) {}

    fn stats(&self) -> (u64, u64) {
        (
            self.feed.received.load(Ordering::Relaxed),
            self.feed.dropped.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pushed_frame_is_read_back() {
        let mut strategy = SimulatedStrategy::default();
        let feed = strategy.feed();
        feed.push(vec![1, 2, 3]);

        let mut sources = strategy.open(&CaptureConfig::default()).unwrap();
        let (bytes, info) = sources[0].read_packet_data().unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(info.wire_len, 3);
        assert_eq!(strategy.stats().0, 1);
    }
}
