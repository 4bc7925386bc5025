use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_INTERPOLATOR_STEP_MS: u64 = 30;
pub const MAX_INTERPOLATOR_DURATION_MS: u64 = 5_000;

/// Lazy finite sequence of values stepped linearly from `from` to `to` over a
/// bounded duration. The sequence ends on its own after the last step or
/// earlier when stopped; a stopped interpolator yields nothing more even if
/// values were already in flight.
pub struct LinearInterpolator {
    rx: mpsc::Receiver<f32>,
    cancel: CancellationToken,
}

impl LinearInterpolator {
    pub fn new(from: f32, to: f32, duration_ms: u64, step_ms: u64) -> LinearInterpolator {
        let duration_ms = duration_ms.min(MAX_INTERPOLATOR_DURATION_MS);
        let step_ms = if step_ms == 0 {
            DEFAULT_INTERPOLATOR_STEP_MS
        } else {
            step_ms
        };
        let steps = (duration_ms / step_ms).max(1);

        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let producer_cancel = cancel.clone();

        tokio::spawn(async move {
            for i in 1..=steps {
                tokio::select! {
                    _ = producer_cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(step_ms)) => {}
                }
                let value = from + (to - from) * (i as f32 / steps as f32);
                tokio::select! {
                    _ = producer_cancel.cancelled() => return,
                    res = tx.send(value) => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        LinearInterpolator { rx, cancel }
    }

    /// Next value, or `None` once the sequence completed or was stopped.
    /// A stopped interpolator never yields, even for values already queued.
    pub async fn recv(&mut self) -> Option<f32> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            value = self.rx.recv() => value,
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Handle that lets another task preempt this interpolation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
