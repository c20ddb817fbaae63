//! Pipeline driver: composition of the ring, the timeline, uploads, and
//! presentation behind a host capability interface.
//!
//! Samples implement [`FramePipelineHost`] and are composed with the
//! driver by injection; the driver owns the frame loop mechanics (slot
//! claiming, ordered submission, presentation rotation, upload
//! reclamation, drain-then-resize) so hosts only record work.

use std::sync::Arc;

use tracing::{debug, error, info};

use framepipe_core::Timer;
use framepipe_hal::{Device, Extent2d, Queue, Surface, SurfaceProvider};

use crate::backbuffer::BackbufferRing;
use crate::error::PipelineResult;
use crate::ring::{FrameManager, FrameRingConfig, FrameSlot, DEFAULT_FRAMES_IN_FLIGHT};
use crate::timeline::{Timeline, DEFAULT_SPIN_BUDGET};
use crate::transient::TransientConfig;
use crate::upload::{UploadBatch, UploadTicket};

/// Per-sample capability interface.
///
/// Implementations record work; the driver supplies resources and
/// enforces the synchronization discipline around them.
pub trait FramePipelineHost {
    /// One-time resource and pipeline-state setup.
    fn init_pipelines(&mut self, device: &Arc<dyn Device>) -> PipelineResult<()>;

    /// Per-frame simulation step, before recording.
    fn frame_moved(&mut self, dt: f32);

    /// Records the frame's work into the claimed slot.
    fn render_frame(&mut self, frame: &mut FrameContext<'_>) -> PipelineResult<()>;

    /// Notification that the presentation extent changed. Runs after the
    /// pipeline has drained and recreated its surfaces.
    fn resized(&mut self, width: u32, height: u32);
}

/// Everything a host may touch while recording one frame.
pub struct FrameContext<'a> {
    slot: &'a mut FrameSlot,
    target: Option<&'a dyn Surface>,
    dt: f32,
}

impl<'a> FrameContext<'a> {
    /// The claimed frame slot (command buffer, transient allocator).
    #[inline]
    pub fn slot(&mut self) -> &mut FrameSlot {
        self.slot
    }

    /// The surface this frame renders into, absent in headless runs.
    #[inline]
    pub fn target(&self) -> Option<&dyn Surface> {
        self.target
    }

    /// Seconds since the previous frame.
    #[inline]
    pub fn dt(&self) -> f32 {
        self.dt
    }
}

/// Configuration for a [`FramePipeline`].
#[derive(Clone, Copy, Debug)]
pub struct FramePipelineConfig {
    /// Ring depth. Typically 2 or 3.
    pub frames_in_flight: usize,
    /// Transient allocator configuration for every slot.
    pub transient: TransientConfig,
    /// Poll iterations before waits fall back to blocking.
    pub spin_budget: u32,
}

impl Default for FramePipelineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            transient: TransientConfig::default(),
            spin_budget: DEFAULT_SPIN_BUDGET,
        }
    }
}

/// The assembled frame pipeline.
///
/// Owns the timeline, the frame ring, the optional presentation surfaces,
/// and the in-flight upload batches. Driven by the control thread;
/// dropped pipelines drain before releasing resources.
pub struct FramePipeline {
    device: Arc<dyn Device>,
    queue: Arc<dyn Queue>,
    timeline: Arc<Timeline>,
    frames: FrameManager,
    backbuffers: Option<BackbufferRing>,
    host: Box<dyn FramePipelineHost>,
    uploads_in_flight: Vec<UploadBatch>,
    upload_pool: Vec<UploadBatch>,
    timer: Timer,
}

impl FramePipeline {
    /// Assembles a pipeline over a device.
    ///
    /// Pass `None` as the surface provider for headless operation (pure
    /// upload/compute use); presentation steps are skipped.
    pub fn new(
        device: Arc<dyn Device>,
        surface_provider: Option<Box<dyn SurfaceProvider>>,
        extent: Extent2d,
        mut host: Box<dyn FramePipelineHost>,
        config: FramePipelineConfig,
    ) -> PipelineResult<Self> {
        let queue = device.queue();
        let timeline =
            Arc::new(Timeline::for_queue(queue.as_ref()).with_spin_budget(config.spin_budget));
        let frames = FrameManager::new(
            &device,
            timeline.clone(),
            FrameRingConfig {
                frames_in_flight: config.frames_in_flight,
                transient: config.transient,
            },
        )?;
        let backbuffers = surface_provider
            .map(|provider| BackbufferRing::new(provider, extent))
            .transpose()?;

        host.init_pipelines(&device)?;
        info!(
            frames_in_flight = config.frames_in_flight,
            presenting = backbuffers.is_some(),
            "frame pipeline assembled"
        );

        Ok(Self {
            device,
            queue,
            timeline,
            frames,
            backbuffers,
            host,
            uploads_in_flight: Vec::new(),
            upload_pool: Vec::new(),
            timer: Timer::new(),
        })
    }

    /// Runs one frame: claim the slot, let the host record, submit with
    /// an ordered signal, store the value, present.
    ///
    /// If presentation reports the surface set stale, the pipeline drains
    /// and recreates it before returning.
    pub fn frame(&mut self) -> PipelineResult<()> {
        let dt = self.timer.delta_secs();
        self.reclaim_uploads()?;
        self.host.frame_moved(dt);

        let slot = self.frames.begin_frame()?;
        let target = self.backbuffers.as_ref().map(|ring| ring.current_surface());
        let mut ctx = FrameContext { slot, target, dt };
        self.host.render_frame(&mut ctx)?;

        let cmd = ctx.slot.command_buffer();
        cmd.end()?;
        let value = self.timeline.submit_with_signal(self.queue.as_ref(), cmd)?;
        self.frames.end_frame(value);

        let mut stale_extent = None;
        if let Some(ring) = self.backbuffers.as_mut() {
            if ring.present()? {
                stale_extent = Some(ring.extent());
            }
        }
        if let Some(extent) = stale_extent {
            debug!("surface set reported stale after present");
            self.resize(extent.width, extent.height)?;
        }
        Ok(())
    }

    /// Drains all submitted work, recreates the presentation surfaces at
    /// the new extent, and notifies the host.
    pub fn resize(&mut self, width: u32, height: u32) -> PipelineResult<()> {
        debug!(width, height, "resizing pipeline");
        self.frames.drain_all()?;
        if let Some(ring) = self.backbuffers.as_mut() {
            ring.resize(width, height)?;
        }
        self.host.resized(width, height);
        Ok(())
    }

    /// Opens an upload batch, reusing a pooled one when available.
    pub fn begin_upload(&mut self) -> PipelineResult<UploadBatch> {
        let mut batch = match self.upload_pool.pop() {
            Some(batch) => batch,
            None => UploadBatch::new(self.device.clone(), self.timeline.clone())?,
        };
        batch.begin()?;
        Ok(batch)
    }

    /// Commits a recorded batch and takes ownership of it until its
    /// staging memory can be reclaimed.
    pub fn submit_upload(&mut self, mut batch: UploadBatch) -> PipelineResult<UploadTicket> {
        let ticket = batch.commit(self.queue.as_ref())?;
        self.uploads_in_flight.push(batch);
        Ok(ticket)
    }

    /// Waits for every outstanding submission, including uploads.
    pub fn drain(&mut self) -> PipelineResult<()> {
        self.frames.drain_all()?;
        for batch in &mut self.uploads_in_flight {
            batch.wait_reclaim()?;
        }
        self.upload_pool.append(&mut self.uploads_in_flight);
        Ok(())
    }

    fn reclaim_uploads(&mut self) -> PipelineResult<()> {
        let mut index = 0;
        while index < self.uploads_in_flight.len() {
            if self.uploads_in_flight[index].try_reclaim()? {
                let batch = self.uploads_in_flight.swap_remove(index);
                self.upload_pool.push(batch);
            } else {
                index += 1;
            }
        }
        Ok(())
    }

    /// The device the pipeline was assembled over.
    #[inline]
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// The pipeline's submission timeline.
    #[inline]
    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    /// Monotonic frame counter.
    #[inline]
    pub fn frame_index(&self) -> u64 {
        self.frames.frame_index()
    }

    /// Upload batches whose staging memory is still held.
    #[inline]
    pub fn uploads_in_flight(&self) -> usize {
        self.uploads_in_flight.len()
    }

    /// Smoothed frame delta, for pacing decisions.
    #[inline]
    pub fn smoothed_dt(&self) -> f32 {
        self.timer.smoothed_delta_secs()
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        if let Err(e) = self.drain() {
            error!("failed to drain pipeline on shutdown: {e}");
        }
    }
}
