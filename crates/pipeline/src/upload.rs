//! Batched CPU-to-device uploads with deferred staging release.
//!
//! An [`UploadBatch`] collects copy operations into one submission and
//! keeps every staging buffer it allocated alive until the device has
//! confirmed the submission complete. Decoupling "submitted" from
//! "safe to free" lets the submitting thread keep issuing work while
//! large staging allocations are reclaimed later.
//!
//! # State machine
//!
//! ```text
//! Idle --begin()--> Recording --commit()--> Submitted --resolve--> Idle
//! ```
//!
//! Resolution happens when the batch's timeline value completes:
//! explicitly ([`wait_reclaim`](UploadBatch::wait_reclaim)), polled
//! ([`try_reclaim`](UploadBatch::try_reclaim)), or lazily at the next
//! [`begin`](UploadBatch::begin). Dropping an unresolved batch blocks
//! until the device is done with the staging memory.

use std::sync::Arc;

use tracing::{debug, error, trace};

use framepipe_hal::{Buffer, BufferDesc, BufferUsage, CommandBuffer, Device, Queue};

use crate::error::{PipelineError, PipelineResult};
use crate::timeline::Timeline;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UploadState {
    Idle,
    Recording,
    Submitted { value: u64 },
}

/// Completion handle for a committed upload batch.
///
/// Holds only a timeline value; cloning or dropping it has no effect on
/// the batch's staging memory.
#[derive(Clone)]
pub struct UploadTicket {
    timeline: Arc<Timeline>,
    value: u64,
}

impl UploadTicket {
    /// The timeline value the batch's submission signals.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Whether the device has confirmed the batch complete.
    pub fn is_resolved(&self) -> PipelineResult<bool> {
        Ok(self.timeline.completed()? >= self.value)
    }

    /// Blocks until the batch completes.
    pub fn wait(&self) -> PipelineResult<()> {
        self.timeline.wait_until(self.value)
    }
}

/// A batch of CPU-to-device copies committed as one submission.
///
/// The batch exclusively owns each staging buffer it allocates; ownership
/// is never shared with the caller. Batches are reusable and are pooled
/// across frames by the pipeline driver.
pub struct UploadBatch {
    device: Arc<dyn Device>,
    timeline: Arc<Timeline>,
    cmd: Box<dyn CommandBuffer>,
    staging: Vec<Box<dyn Buffer>>,
    staging_bytes: u64,
    state: UploadState,
}

impl UploadBatch {
    /// Creates an idle batch with its own command buffer.
    pub fn new(device: Arc<dyn Device>, timeline: Arc<Timeline>) -> PipelineResult<Self> {
        let cmd = device.create_command_buffer()?;
        Ok(Self {
            device,
            timeline,
            cmd,
            staging: Vec::new(),
            staging_bytes: 0,
            state: UploadState::Idle,
        })
    }

    /// Opens the batch for recording.
    ///
    /// A batch whose previous submission has resolved is reclaimed here
    /// (staging buffers released) before recording starts.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BatchBusy`] if the batch is recording or
    /// has unresolved submitted work.
    pub fn begin(&mut self) -> PipelineResult<()> {
        match self.state {
            UploadState::Idle => {}
            UploadState::Recording => return Err(PipelineError::BatchBusy),
            UploadState::Submitted { value } => {
                if self.timeline.completed()? >= value {
                    self.release_staging();
                } else {
                    return Err(PipelineError::BatchBusy);
                }
            }
        }
        self.cmd.reset()?;
        self.cmd.begin()?;
        self.state = UploadState::Recording;
        Ok(())
    }

    /// Appends one copy to the batch.
    ///
    /// Allocates a staging buffer owned by the batch, fills it with
    /// `data`, and records a copy into `dst` at `dst_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BatchNotRecording`] unless preceded by
    /// [`begin`](Self::begin).
    pub fn enqueue(&mut self, data: &[u8], dst: &dyn Buffer, dst_offset: u64) -> PipelineResult<()> {
        if self.state != UploadState::Recording {
            return Err(PipelineError::BatchNotRecording);
        }
        let staging = self.device.create_buffer(&BufferDesc {
            size: data.len() as u64,
            usage: BufferUsage::Staging,
        })?;
        staging.write(0, data)?;
        self.cmd
            .copy_buffer(staging.as_ref(), 0, dst, dst_offset, data.len() as u64)?;
        self.staging_bytes += data.len() as u64;
        self.staging.push(staging);
        trace!(bytes = data.len(), dst_offset, "enqueued upload copy");
        Ok(())
    }

    /// Closes the recording and submits it as one unit of work.
    ///
    /// Returns a completion handle; the staging buffers stay alive inside
    /// the batch until the handle's value resolves.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BatchNotRecording`] without a prior
    /// `begin`, or [`PipelineError::BatchBusy`] if called again before
    /// the previous commit resolved.
    pub fn commit(&mut self, queue: &dyn Queue) -> PipelineResult<UploadTicket> {
        match self.state {
            UploadState::Recording => {}
            UploadState::Idle => return Err(PipelineError::BatchNotRecording),
            UploadState::Submitted { .. } => return Err(PipelineError::BatchBusy),
        }
        self.cmd.end()?;
        let value = self.timeline.submit_with_signal(queue, self.cmd.as_mut())?;
        self.state = UploadState::Submitted { value };
        debug!(
            value,
            copies = self.staging.len(),
            bytes = self.staging_bytes,
            "committed upload batch"
        );
        Ok(UploadTicket {
            timeline: self.timeline.clone(),
            value,
        })
    }

    /// Releases staging buffers if the batch's submission has resolved.
    ///
    /// Returns `true` if the batch is idle afterwards. Never blocks.
    pub fn try_reclaim(&mut self) -> PipelineResult<bool> {
        match self.state {
            UploadState::Idle => Ok(true),
            UploadState::Recording => Ok(false),
            UploadState::Submitted { value } => {
                if self.timeline.completed()? >= value {
                    self.release_staging();
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Blocks until the batch's submission resolves, then releases the
    /// staging buffers.
    pub fn wait_reclaim(&mut self) -> PipelineResult<()> {
        if let UploadState::Submitted { value } = self.state {
            self.timeline.wait_until(value)?;
            self.release_staging();
        }
        Ok(())
    }

    /// Whether the batch has submitted work that has not resolved.
    pub fn in_flight(&self) -> bool {
        matches!(self.state, UploadState::Submitted { .. })
    }

    /// Bytes of staging memory the batch currently holds alive.
    pub fn staging_bytes(&self) -> u64 {
        self.staging_bytes
    }

    fn release_staging(&mut self) {
        if !self.staging.is_empty() {
            trace!(
                buffers = self.staging.len(),
                bytes = self.staging_bytes,
                "released staging buffers"
            );
        }
        self.staging.clear();
        self.staging_bytes = 0;
        self.state = UploadState::Idle;
    }
}

impl Drop for UploadBatch {
    fn drop(&mut self) {
        // Staging memory must outlive the device's use of it: block until
        // the submission resolves before the buffers drop.
        if let UploadState::Submitted { value } = self.state {
            if let Err(e) = self.timeline.wait_until(value) {
                error!("failed to resolve upload batch before drop: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framepipe_hal::null::{NullBuffer, NullDevice};
    use std::time::Duration;

    fn setup() -> (Arc<NullDevice>, Arc<Timeline>, UploadBatch) {
        let device = Arc::new(NullDevice::new(false));
        let timeline = Arc::new(Timeline::for_queue(device.queue().as_ref()));
        let dyn_device: Arc<dyn Device> = device.clone();
        let batch = UploadBatch::new(dyn_device, timeline.clone()).unwrap();
        (device, timeline, batch)
    }

    fn dst_buffer(device: &NullDevice, size: u64) -> Box<dyn Buffer> {
        device
            .create_buffer(&BufferDesc {
                size,
                usage: BufferUsage::DeviceLocal,
            })
            .unwrap()
    }

    #[test]
    fn test_enqueue_without_begin_is_not_recording() {
        let (device, _timeline, mut batch) = setup();
        let dst = dst_buffer(&device, 16);
        let result = batch.enqueue(&[1, 2, 3], dst.as_ref(), 0);
        assert!(matches!(result, Err(PipelineError::BatchNotRecording)));
    }

    #[test]
    fn test_commit_without_begin_is_not_recording() {
        let (device, _timeline, mut batch) = setup();
        let result = batch.commit(device.queue().as_ref());
        assert!(matches!(result, Err(PipelineError::BatchNotRecording)));
    }

    #[test]
    fn test_double_commit_is_busy() {
        let (device, _timeline, mut batch) = setup();
        let dst = dst_buffer(&device, 16);

        batch.begin().unwrap();
        batch.enqueue(&[1, 2, 3, 4], dst.as_ref(), 0).unwrap();
        batch.commit(device.queue().as_ref()).unwrap();

        let result = batch.commit(device.queue().as_ref());
        assert!(matches!(result, Err(PipelineError::BatchBusy)));

        // Resolve so the drop guard does not hang the test.
        device.null_queue().complete_all().unwrap();
    }

    #[test]
    fn test_rebegin_while_unresolved_is_busy() {
        let (device, _timeline, mut batch) = setup();
        let dst = dst_buffer(&device, 16);

        batch.begin().unwrap();
        batch.enqueue(&[0u8; 8], dst.as_ref(), 0).unwrap();
        batch.commit(device.queue().as_ref()).unwrap();

        assert!(matches!(batch.begin(), Err(PipelineError::BatchBusy)));

        device.null_queue().complete_all().unwrap();
        // Resolved now: begin reclaims and reopens.
        batch.begin().unwrap();
        assert_eq!(batch.staging_bytes(), 0);
    }

    #[test]
    fn test_staging_released_exactly_after_resolution() {
        let (device, _timeline, mut batch) = setup();
        let dst = dst_buffer(&device, 16);

        batch.begin().unwrap();
        batch.enqueue(&[7u8; 16], dst.as_ref(), 0).unwrap();
        let ticket = batch.commit(device.queue().as_ref()).unwrap();

        assert!(!ticket.is_resolved().unwrap());
        assert!(!batch.try_reclaim().unwrap());
        assert_eq!(batch.staging_bytes(), 16);

        device.null_queue().complete_through(ticket.value()).unwrap();

        assert!(ticket.is_resolved().unwrap());
        assert!(batch.try_reclaim().unwrap());
        assert_eq!(batch.staging_bytes(), 0);
        assert!(!batch.in_flight());
    }

    #[test]
    fn test_copies_land_in_destination_at_resolution() {
        let (device, _timeline, mut batch) = setup();
        let dst = dst_buffer(&device, 8);

        batch.begin().unwrap();
        batch.enqueue(&[1, 2, 3, 4], dst.as_ref(), 0).unwrap();
        batch.enqueue(&[5, 6, 7, 8], dst.as_ref(), 4).unwrap();
        let ticket = batch.commit(device.queue().as_ref()).unwrap();

        device.null_queue().complete_through(ticket.value()).unwrap();
        ticket.wait().unwrap();

        let contents = dst
            .as_any()
            .downcast_ref::<NullBuffer>()
            .unwrap()
            .contents();
        assert_eq!(contents, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_drop_blocks_until_resolution() {
        let (device, _timeline, mut batch) = setup();
        let dst = dst_buffer(&device, 16);

        batch.begin().unwrap();
        batch.enqueue(&[0u8; 16], dst.as_ref(), 0).unwrap();
        let ticket = batch.commit(device.queue().as_ref()).unwrap();

        let queue = device.null_queue().clone();
        let value = ticket.value();
        let completer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            queue.complete_through(value).unwrap();
        });

        // Must not return before the device retires the submission.
        drop(batch);
        completer.join().unwrap();
        assert!(ticket.is_resolved().unwrap());
    }

    #[test]
    fn test_wait_reclaim_blocks_then_releases() {
        let (device, _timeline, mut batch) = setup();
        let dst = dst_buffer(&device, 16);

        batch.begin().unwrap();
        batch.enqueue(&[9u8; 16], dst.as_ref(), 0).unwrap();
        let ticket = batch.commit(device.queue().as_ref()).unwrap();

        let queue = device.null_queue().clone();
        let value = ticket.value();
        let completer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            queue.complete_through(value).unwrap();
        });

        batch.wait_reclaim().unwrap();
        completer.join().unwrap();
        assert!(!batch.in_flight());
        assert_eq!(batch.staging_bytes(), 0);
    }
}
