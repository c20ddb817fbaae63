//! Frame pipeline demo — null device.
//!
//! Drives the full pipeline against the in-process software device: a
//! device thread retires submissions out-of-band while the control
//! thread records frames, streams periodic uploads, and performs a
//! mid-run resize.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use tracing::info;

use framepipe_hal::null::{NullDevice, NullQueue, NullSurfaceProvider};
use framepipe_hal::{Buffer, BufferDesc, BufferUsage, Device, Extent2d};
use framepipe_pipeline::{
    FrameContext, FramePipeline, FramePipelineConfig, FramePipelineHost, PipelineResult,
};

const FRAMES: u32 = 600;
const UPLOAD_INTERVAL: u32 = 120;
const RESIZE_AT: u32 = 300;

/// Per-frame constant data the host streams through the transient
/// allocator, standing in for per-draw shader constants.
#[repr(C)]
#[derive(Clone, Copy, Default, Pod, Zeroable)]
struct FrameConstants {
    time: f32,
    angle: f32,
    extent: [f32; 2],
}

struct OrbitHost {
    constants: FrameConstants,
}

impl FramePipelineHost for OrbitHost {
    fn init_pipelines(&mut self, _device: &Arc<dyn Device>) -> PipelineResult<()> {
        info!("host pipelines initialized");
        Ok(())
    }

    fn frame_moved(&mut self, dt: f32) {
        self.constants.time += dt;
        self.constants.angle = (self.constants.angle + dt * 0.8) % std::f32::consts::TAU;
    }

    fn render_frame(&mut self, frame: &mut FrameContext<'_>) -> PipelineResult<()> {
        if let Some(target) = frame.target() {
            let extent = target.extent();
            self.constants.extent = [extent.width as f32, extent.height as f32];
        }
        let constants = self.constants;
        frame.slot().transient().push(&constants)?;
        Ok(())
    }

    fn resized(&mut self, width: u32, height: u32) {
        info!(width, height, "host notified of resize");
    }
}

/// Device thread: retires one submission at a time with a small delay,
/// so the host genuinely runs ahead of the device.
fn spawn_device_thread(queue: Arc<NullQueue>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        match queue.complete_next() {
            Ok(Some(_)) => thread::sleep(Duration::from_micros(300)),
            Ok(None) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(Duration::from_micros(100));
            }
            Err(e) => {
                tracing::error!("device thread failed: {e}");
                break;
            }
        }
    })
}

fn main() -> Result<()> {
    framepipe_core::init_logging();

    let device = Arc::new(NullDevice::new(false));
    let stop = Arc::new(AtomicBool::new(false));
    let device_thread = spawn_device_thread(device.null_queue().clone(), stop.clone());

    let dyn_device: Arc<dyn Device> = device.clone();
    let mut pipeline = FramePipeline::new(
        dyn_device,
        Some(Box::new(NullSurfaceProvider::new(3))),
        Extent2d::new(1280, 720),
        Box::new(OrbitHost {
            constants: FrameConstants::default(),
        }),
        FramePipelineConfig::default(),
    )?;

    let mesh_memory = device.create_buffer(&BufferDesc {
        size: 64 * 1024,
        usage: BufferUsage::DeviceLocal,
    })?;

    for frame in 0..FRAMES {
        if frame % UPLOAD_INTERVAL == 0 {
            let payload = vec![(frame % 251) as u8; 16 * 1024];
            let mut batch = pipeline.begin_upload()?;
            batch.enqueue(&payload, mesh_memory.as_ref(), 0)?;
            let ticket = pipeline.submit_upload(batch)?;
            info!(value = ticket.value(), "upload submitted");
        }
        if frame == RESIZE_AT {
            pipeline.resize(1920, 1080)?;
        }
        pipeline.frame()?;
    }

    info!(
        frames = pipeline.frame_index(),
        smoothed_dt = pipeline.smoothed_dt(),
        uploads_in_flight = pipeline.uploads_in_flight(),
        "run complete, draining"
    );

    drop(pipeline);
    stop.store(true, Ordering::Release);
    device_thread
        .join()
        .map_err(|_| anyhow::anyhow!("device thread panicked"))?;

    info!("headless demo finished");
    Ok(())
}
