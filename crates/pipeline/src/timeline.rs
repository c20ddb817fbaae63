//! Submission timeline: the monotonic completion counter.
//!
//! Every unit of submitted work is tagged with a value from the timeline.
//! The device signals the queue fence to that value once the work retires,
//! so `completed() >= v` is a proof that everything submitted up to `v`
//! is finished and its resources may be reclaimed.
//!
//! # Usage Pattern
//!
//! ```text
//! 1. Record work
//! 2. value = timeline.advance()
//! 3. queue.submit(work, signal value)      (one serialized step via
//!    submit_with_signal, so values reflect submission order)
//! 4. tag owned resources with value
//! 5. reclaim resources once completed() >= value
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use framepipe_hal::{CommandBuffer, Fence, Queue};

use crate::error::PipelineResult;

/// Default number of polling iterations before a wait falls back to the
/// blocking primitive.
pub const DEFAULT_SPIN_BUDGET: u32 = 128;

/// Headroom kept below `u64::MAX`; reaching it forces a drain-and-reset
/// so a new target can never be confused with an already-completed value.
const ROLLOVER_MARGIN: u64 = 1 << 12;
const ROLLOVER_THRESHOLD: u64 = u64::MAX - ROLLOVER_MARGIN;

/// Counter value after a forced reset. Small and positive, so a freshly
/// reset timeline is distinguishable from one that never submitted.
const ROLLOVER_BASE: u64 = 1;

/// Monotonic completion counter over a device fence.
///
/// The timeline owns the target value; the fence reports device progress
/// toward it. Slots, batches, and callers hold plain `u64` values from
/// the timeline, never references into it.
///
/// # Thread Safety
///
/// `advance` and `submit_with_signal` may be called concurrently from
/// multiple submitting threads (control thread plus background upload
/// threads); waits may run on any thread.
pub struct Timeline {
    fence: Arc<dyn Fence>,
    target: AtomicU64,
    spin_budget: u32,
    /// Serializes the exhaustion drain-and-reset path.
    rollover: Mutex<()>,
    /// Serializes advance-and-submit so signal values reflect submission
    /// order on the serial queue.
    submit_order: Mutex<()>,
}

impl Timeline {
    /// Creates a timeline over a fence whose counter currently reads
    /// `start_value`.
    pub fn new(fence: Arc<dyn Fence>, start_value: u64) -> Self {
        Self {
            fence,
            target: AtomicU64::new(start_value),
            spin_budget: DEFAULT_SPIN_BUDGET,
            rollover: Mutex::new(()),
            submit_order: Mutex::new(()),
        }
    }

    /// Creates a timeline over a queue's submission fence, starting at 0.
    pub fn for_queue(queue: &dyn Queue) -> Self {
        Self::new(queue.fence(), 0)
    }

    /// Sets the number of polling iterations `wait_until` performs before
    /// falling back to the blocking primitive.
    pub fn with_spin_budget(mut self, spin_budget: u32) -> Self {
        self.spin_budget = spin_budget;
        self
    }

    /// Atomically increments the target and returns the new value.
    ///
    /// The caller must arrange for the device to eventually signal the
    /// returned value (normally by submitting through
    /// [`submit_with_signal`](Self::submit_with_signal)).
    ///
    /// Near `u64::MAX` this first forces a full drain and resets the
    /// counter to a small base, so a new target can never alias an
    /// already-completed value.
    pub fn advance(&self) -> PipelineResult<u64> {
        loop {
            let current = self.target.load(Ordering::Acquire);
            if current >= ROLLOVER_THRESHOLD {
                self.drain_and_reset()?;
                continue;
            }
            if self
                .target
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(current + 1);
            }
        }
    }

    /// Advances the timeline and submits `cmd` with the new signal value,
    /// as one ordered step.
    ///
    /// Holding the submit lock across both operations guarantees that a
    /// larger timeline value is never enqueued before a smaller one, which
    /// is what makes `completed()` a watermark over submission order.
    pub fn submit_with_signal(
        &self,
        queue: &dyn Queue,
        cmd: &mut dyn CommandBuffer,
    ) -> PipelineResult<u64> {
        let _order = self.submit_order.lock().unwrap();
        let value = self.advance()?;
        queue.submit(cmd, value)?;
        Ok(value)
    }

    /// The greatest value the device has confirmed finished.
    pub fn completed(&self) -> PipelineResult<u64> {
        Ok(self.fence.completed()?)
    }

    /// The latest value handed out by [`advance`](Self::advance).
    pub fn target(&self) -> u64 {
        self.target.load(Ordering::Acquire)
    }

    /// Blocks the calling thread until `completed() >= value`.
    ///
    /// Polls up to the configured spin budget first — already-complete
    /// waits and short waits never pay for the blocking primitive — then
    /// parks on the fence with no timeout.
    ///
    /// # Errors
    ///
    /// Propagates a fatal [`HalError::SyncTimeout`] if the underlying
    /// primitive reports failure; there is no recovery path.
    ///
    /// [`HalError::SyncTimeout`]: framepipe_hal::HalError::SyncTimeout
    pub fn wait_until(&self, value: u64) -> PipelineResult<()> {
        if self.fence.completed()? >= value {
            return Ok(());
        }
        for _ in 0..self.spin_budget {
            std::hint::spin_loop();
            if self.fence.completed()? >= value {
                return Ok(());
            }
        }
        self.fence.wait(value)?;
        Ok(())
    }

    /// Blocks until everything submitted so far has completed.
    ///
    /// Once drained, calling again returns without blocking.
    pub fn drain(&self) -> PipelineResult<()> {
        self.wait_until(self.target.load(Ordering::Acquire))
    }

    fn drain_and_reset(&self) -> PipelineResult<()> {
        let _guard = self.rollover.lock().unwrap();

        // Another thread may have finished the reset while we waited on
        // the lock.
        let current = self.target.load(Ordering::Acquire);
        if current < ROLLOVER_THRESHOLD {
            return Ok(());
        }

        warn!(target = current, "completion counter near exhaustion, forcing drain");
        self.wait_until(current)?;
        self.fence.signal(u64::MAX)?;
        self.fence.wait(u64::MAX)?;
        self.fence.reset(ROLLOVER_BASE)?;
        self.target.store(ROLLOVER_BASE, Ordering::Release);
        debug!(base = ROLLOVER_BASE, "completion counter reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framepipe_hal::null::NullFence;
    use std::time::Duration;

    fn timeline_at(start: u64) -> (Arc<NullFence>, Timeline) {
        let fence = Arc::new(NullFence::new(start));
        let timeline = Timeline::new(fence.clone(), start);
        (fence, timeline)
    }

    #[test]
    fn test_advance_is_monotonic() {
        let (_fence, timeline) = timeline_at(0);
        assert_eq!(timeline.advance().unwrap(), 1);
        assert_eq!(timeline.advance().unwrap(), 2);
        assert_eq!(timeline.advance().unwrap(), 3);
        assert_eq!(timeline.target(), 3);
    }

    #[test]
    fn test_wait_until_already_complete_never_touches_blocking_primitive() {
        let (fence, timeline) = timeline_at(0);
        fence.signal(4).unwrap();
        timeline.wait_until(4).unwrap();
        timeline.wait_until(1).unwrap();
        assert_eq!(fence.blocking_waits(), 0);
    }

    #[test]
    fn test_wait_until_falls_back_to_blocking_wait() {
        let (fence, timeline) = timeline_at(0);
        let timeline = Arc::new(timeline);
        timeline.advance().unwrap();

        let signaler = {
            let fence = fence.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                fence.signal(1).unwrap();
            })
        };
        timeline.wait_until(1).unwrap();
        signaler.join().unwrap();
        assert_eq!(fence.completed().unwrap(), 1);
    }

    #[test]
    fn test_drain_waits_for_latest_target() {
        let (fence, timeline) = timeline_at(0);
        timeline.advance().unwrap();
        timeline.advance().unwrap();
        fence.signal(2).unwrap();
        timeline.drain().unwrap();
        // Second drain must not block again.
        timeline.drain().unwrap();
        assert_eq!(fence.blocking_waits(), 0);
    }

    #[test]
    fn test_exhaustion_forces_drain_and_reset_exactly_once() {
        // Device fully caught up with a target sitting on the threshold.
        let (fence, timeline) = timeline_at(ROLLOVER_THRESHOLD);

        assert_eq!(timeline.advance().unwrap(), ROLLOVER_BASE + 1);
        assert_eq!(fence.completed().unwrap(), ROLLOVER_BASE);

        // Subsequent advances continue from the base without resetting
        // again.
        assert_eq!(timeline.advance().unwrap(), ROLLOVER_BASE + 2);
        assert_eq!(timeline.advance().unwrap(), ROLLOVER_BASE + 3);
        assert_eq!(fence.completed().unwrap(), ROLLOVER_BASE);
    }

    #[test]
    fn test_post_reset_waits_are_not_satisfied_by_stale_completion() {
        let (fence, timeline) = timeline_at(ROLLOVER_THRESHOLD);
        let value = timeline.advance().unwrap();

        // The reset dropped the counter to the base; the fresh target must
        // still be outstanding even though the fence once read u64::MAX.
        assert!(fence.completed().unwrap() < value);

        fence.signal(value).unwrap();
        timeline.wait_until(value).unwrap();
    }

    #[test]
    fn test_timeline_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Timeline>();
    }
}
