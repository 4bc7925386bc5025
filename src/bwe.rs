use std::sync::atomic::{AtomicU64, Ordering};

/// Handle on the per-connection congestion-control estimate.
///
/// The engine's congestion controller publishes its current target through
/// `set_target_bitrate`; sender controllers sample it on their control ticker.
/// Reads and writes are atomic, so both sides stay lock-free.
#[derive(Debug)]
pub struct BandwidthEstimator {
    target: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimatorStats {
    pub target_bitrate: u64,
}

impl BandwidthEstimator {
    pub fn new(initial_bitrate: u64) -> Self {
        BandwidthEstimator {
            target: AtomicU64::new(initial_bitrate),
        }
    }

    pub fn target_bitrate(&self) -> u64 {
        self.target.load(Ordering::Relaxed)
    }

    pub fn set_target_bitrate(&self, bps: u64) {
        self.target.store(bps, Ordering::Relaxed);
    }

    pub fn stats(&self) -> EstimatorStats {
        EstimatorStats {
            target_bitrate: self.target_bitrate(),
        }
    }
}
