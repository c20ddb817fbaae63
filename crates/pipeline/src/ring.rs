//! Frame resource ring.
//!
//! A fixed-size ring of per-frame resource bundles. Each slot owns a
//! reusable command buffer and a transient allocator, and carries the
//! timeline value its last submission will signal. Reusing a slot first
//! waits for that value, which is the single blocking point of
//! steady-state operation.
//!
//! # Usage Pattern
//!
//! ```text
//! loop {
//!     let slot = frames.begin_frame()?;       // waits for slot's last use
//!     // record into slot.command_buffer(), slot.transient()
//!     slot.command_buffer().end()?;
//!     let value = timeline.submit_with_signal(queue, slot.command_buffer())?;
//!     frames.end_frame(value);
//! }
//! ```

use std::sync::Arc;

use tracing::{debug, info, trace};

use framepipe_hal::{CommandBuffer, Device};

use crate::error::{PipelineError, PipelineResult};
use crate::timeline::Timeline;
use crate::transient::{TransientAllocator, TransientConfig};

/// Default ring depth: the control thread prepares one frame while the
/// device executes the previous one.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;

/// Configuration for a [`FrameManager`].
#[derive(Clone, Copy, Debug)]
pub struct FrameRingConfig {
    /// Ring depth. Typically 2 or 3.
    pub frames_in_flight: usize,
    /// Transient allocator configuration applied to every slot.
    pub transient: TransientConfig,
}

impl Default for FrameRingConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            transient: TransientConfig::default(),
        }
    }
}

/// One per-frame resource bundle.
///
/// The slot's command buffer and transient allocations must not be
/// touched while [`pending_value`](Self::pending_value) is set and the
/// timeline has not reached it; [`FrameManager::begin_frame`] enforces
/// this.
pub struct FrameSlot {
    index: usize,
    command_buffer: Box<dyn CommandBuffer>,
    transient: TransientAllocator,
    pending_value: Option<u64>,
}

impl FrameSlot {
    fn new(index: usize, device: &Arc<dyn Device>, transient: TransientConfig) -> PipelineResult<Self> {
        Ok(Self {
            index,
            command_buffer: device.create_command_buffer()?,
            transient: TransientAllocator::new(device.clone(), transient)?,
            pending_value: None,
        })
    }

    /// Position of this slot in the ring.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The slot's command buffer, in a recordable state between
    /// `begin_frame` and `end_frame`.
    #[inline]
    pub fn command_buffer(&mut self) -> &mut dyn CommandBuffer {
        self.command_buffer.as_mut()
    }

    /// The slot's transient allocator for this cycle.
    #[inline]
    pub fn transient(&mut self) -> &mut TransientAllocator {
        &mut self.transient
    }

    /// The timeline value the slot's last submission signals, if any is
    /// outstanding.
    #[inline]
    pub fn pending_value(&self) -> Option<u64> {
        self.pending_value
    }
}

/// Fixed-size ring of per-frame resource bundles gated by the timeline.
///
/// # Ordering
///
/// For a fixed slot, generation `g + 1` never begins recording until
/// generation `g`'s submitted work is confirmed complete. Different slots
/// carry no ordering requirement relative to each other.
///
/// # Thread Safety
///
/// Not thread-safe; driven by the single control thread.
pub struct FrameManager {
    timeline: Arc<Timeline>,
    slots: Vec<FrameSlot>,
    frame_index: u64,
}

impl FrameManager {
    /// Creates the ring and its slot resources.
    pub fn new(
        device: &Arc<dyn Device>,
        timeline: Arc<Timeline>,
        config: FrameRingConfig,
    ) -> PipelineResult<Self> {
        if config.frames_in_flight == 0 {
            return Err(PipelineError::InvalidConfig(
                "frames in flight must be at least 1".to_string(),
            ));
        }
        let mut slots = Vec::with_capacity(config.frames_in_flight);
        for index in 0..config.frames_in_flight {
            slots.push(FrameSlot::new(index, device, config.transient)?);
            debug!(slot = index, "created frame slot");
        }
        info!(
            frames_in_flight = config.frames_in_flight,
            "frame ring created"
        );
        Ok(Self {
            timeline,
            slots,
            frame_index: 0,
        })
    }

    /// Claims the slot for the current frame.
    ///
    /// Blocks the calling thread — and only it — until the slot's previous
    /// generation is confirmed complete, then returns the slot with its
    /// command buffer recordable and its transient allocator rewound.
    ///
    /// # Errors
    ///
    /// Propagates fatal synchronization errors from the wait; resource
    /// state is not trustworthy afterwards and there is no recovery path.
    pub fn begin_frame(&mut self) -> PipelineResult<&mut FrameSlot> {
        let index = (self.frame_index % self.slots.len() as u64) as usize;
        let slot = &mut self.slots[index];
        if let Some(value) = slot.pending_value.take() {
            trace!(slot = index, value, "waiting for previous slot generation");
            self.timeline.wait_until(value)?;
        }
        slot.command_buffer.reset()?;
        slot.command_buffer.begin()?;
        slot.transient.reset();
        Ok(slot)
    }

    /// Records the submitted timeline value into the current slot and
    /// advances the frame index.
    ///
    /// `submitted_value` is the value obtained at submission time (via
    /// [`Timeline::submit_with_signal`]).
    pub fn end_frame(&mut self, submitted_value: u64) {
        let index = (self.frame_index % self.slots.len() as u64) as usize;
        self.slots[index].pending_value = Some(submitted_value);
        self.frame_index += 1;
    }

    /// Waits for every outstanding slot submission.
    ///
    /// Required before destructive operations (resize, shutdown). Calling
    /// it again once drained returns without blocking.
    pub fn drain_all(&self) -> PipelineResult<()> {
        if let Some(max) = self.slots.iter().filter_map(|slot| slot.pending_value).max() {
            self.timeline.wait_until(max)?;
        }
        Ok(())
    }

    /// Monotonic frame counter.
    #[inline]
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Ring depth.
    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// The timeline gating this ring.
    #[inline]
    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framepipe_hal::null::NullDevice;
    use framepipe_hal::Fence;
    use std::time::Duration;

    fn ring(frames_in_flight: usize) -> (Arc<NullDevice>, Arc<Timeline>, FrameManager) {
        let device = Arc::new(NullDevice::new(false));
        let timeline = Arc::new(Timeline::for_queue(device.queue().as_ref()));
        let dyn_device: Arc<dyn Device> = device.clone();
        let frames = FrameManager::new(
            &dyn_device,
            timeline.clone(),
            FrameRingConfig {
                frames_in_flight,
                transient: TransientConfig {
                    block_size: 1024,
                    retained_blocks: 1,
                },
            },
        )
        .unwrap();
        (device, timeline, frames)
    }

    #[test]
    fn test_zero_depth_ring_rejected() {
        let device = Arc::new(NullDevice::new(false));
        let timeline = Arc::new(Timeline::for_queue(device.queue().as_ref()));
        let dyn_device: Arc<dyn Device> = device;
        let result = FrameManager::new(
            &dyn_device,
            timeline,
            FrameRingConfig {
                frames_in_flight: 0,
                transient: TransientConfig::default(),
            },
        );
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_slots_cycle_in_order() {
        let (device, timeline, mut frames) = ring(2);
        for expected_slot in [0usize, 1, 0, 1] {
            let slot = frames.begin_frame().unwrap();
            assert_eq!(slot.index(), expected_slot);
            slot.command_buffer().end().unwrap();
            let value = timeline.advance().unwrap();
            frames.end_frame(value);
            // Complete immediately so the next reuse does not block.
            device.null_queue().null_fence().signal(value).unwrap();
        }
        assert_eq!(frames.frame_index(), 4);
    }

    #[test]
    fn test_slot_reuse_blocks_until_generation_completes() {
        let (device, timeline, mut frames) = ring(2);
        let fence = device.null_queue().null_fence().clone();

        // Submit frame 0 (value 1) and frame 1 (value 2) with the device
        // completing neither.
        for _ in 0..2 {
            let slot = frames.begin_frame().unwrap();
            slot.command_buffer().end().unwrap();
            let value = timeline.advance().unwrap();
            frames.end_frame(value);
        }
        assert_eq!(timeline.target(), 2);

        // Frame 2 reuses slot 0 and must block until value 1 completes.
        let completer = {
            let fence = fence.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                fence.signal(1).unwrap();
            })
        };
        let slot = frames.begin_frame().unwrap();
        assert_eq!(slot.index(), 0);
        completer.join().unwrap();
        assert!(fence.completed().unwrap() >= 1);
    }

    #[test]
    fn test_drain_all_waits_for_max_and_is_idempotent() {
        let (device, timeline, mut frames) = ring(2);
        let fence = device.null_queue().null_fence().clone();

        for _ in 0..2 {
            let slot = frames.begin_frame().unwrap();
            slot.command_buffer().end().unwrap();
            let value = timeline.advance().unwrap();
            frames.end_frame(value);
        }

        let completer = {
            let fence = fence.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                fence.signal(2).unwrap();
            })
        };
        frames.drain_all().unwrap();
        completer.join().unwrap();
        let blocking_before = fence.blocking_waits();

        // Already drained: no further blocking.
        frames.drain_all().unwrap();
        assert_eq!(fence.blocking_waits(), blocking_before);
    }

    #[test]
    fn test_drain_all_without_submissions_is_a_no_op() {
        let (_device, _timeline, frames) = ring(2);
        frames.drain_all().unwrap();
    }
}
