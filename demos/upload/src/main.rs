//! Upload streaming demo — Vulkan backend, headless.
//!
//! Builds a presentation-free pipeline over a real Vulkan device,
//! streams data into a host-visible destination through upload batches
//! while frames keep running, then drains and verifies the contents.

use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use tracing::info;

use framepipe_hal::{Buffer, BufferDesc, BufferUsage, Device, Extent2d};
use framepipe_pipeline::{
    FrameContext, FramePipeline, FramePipelineConfig, FramePipelineHost, PipelineResult,
};
use framepipe_vulkan::{VulkanDevice, VulkanDeviceOptions};

const CHUNK_SIZE: usize = 128 * 1024;
const CHUNKS: usize = 8;

struct StreamingHost;

impl FramePipelineHost for StreamingHost {
    fn init_pipelines(&mut self, _device: &Arc<dyn Device>) -> PipelineResult<()> {
        Ok(())
    }

    fn frame_moved(&mut self, _dt: f32) {}

    fn render_frame(&mut self, frame: &mut FrameContext<'_>) -> PipelineResult<()> {
        // Keep the transient path warm on the real device.
        let constants: [f32; 4] = [frame.dt(), 0.0, 0.0, 1.0];
        frame.slot().transient().push(&constants)?;
        Ok(())
    }

    fn resized(&mut self, _width: u32, _height: u32) {}
}

fn chunk_pattern(chunk: usize) -> Vec<u8> {
    vec![(chunk as u8).wrapping_mul(37).wrapping_add(11); CHUNK_SIZE]
}

fn main() -> Result<()> {
    framepipe_core::init_logging();

    let device = Arc::new(
        VulkanDevice::new(VulkanDeviceOptions::default())
            .context("creating Vulkan device (is a Vulkan 1.2 driver installed?)")?,
    );

    let dyn_device: Arc<dyn Device> = device.clone();
    let mut pipeline = FramePipeline::new(
        dyn_device,
        None,
        Extent2d::default(),
        Box::new(StreamingHost),
        FramePipelineConfig::default(),
    )?;

    // Host-visible destination so the result can be read back directly.
    let destination = device.create_buffer(&BufferDesc {
        size: (CHUNK_SIZE * CHUNKS) as u64,
        usage: BufferUsage::Dynamic,
    })?;

    for chunk in 0..CHUNKS {
        let mut batch = pipeline.begin_upload()?;
        batch.enqueue(
            &chunk_pattern(chunk),
            destination.as_ref(),
            (chunk * CHUNK_SIZE) as u64,
        )?;
        let ticket = pipeline.submit_upload(batch)?;
        info!(chunk, value = ticket.value(), "upload chunk submitted");

        // Frames keep flowing while staging memory is still in flight.
        pipeline.frame()?;
    }

    pipeline.drain()?;
    info!(
        frames = pipeline.frame_index(),
        uploads_in_flight = pipeline.uploads_in_flight(),
        "drained"
    );

    let mapped = destination
        .mapped_ptr()
        .context("destination buffer is not host-visible")?;
    for chunk in 0..CHUNKS {
        let expected = chunk_pattern(chunk);
        let actual = unsafe {
            std::slice::from_raw_parts(mapped.as_ptr().add(chunk * CHUNK_SIZE), CHUNK_SIZE)
        };
        ensure!(actual == expected.as_slice(), "chunk {chunk} mismatch");
    }

    info!("all {CHUNKS} chunks verified");
    Ok(())
}
