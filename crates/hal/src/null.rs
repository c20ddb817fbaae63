//! In-process software backend.
//!
//! The null device executes submissions entirely on the CPU. Recorded
//! buffer copies run when a submission retires, which happens either
//! immediately at submit time (`auto_complete`) or when a driver thread
//! or test calls [`NullQueue::complete_through`] / `complete_next`. The
//! fence is a real blocking primitive (mutex + condvar), so waiters park
//! and wake exactly as they would against a native device.
//!
//! Besides tests, this backend backs headless runs of the pipeline where
//! no GPU is present.

use std::any::Any;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use crate::buffer::{Buffer, BufferDesc, BufferUsage};
use crate::command::CommandBuffer;
use crate::device::{Device, Fence, Queue};
use crate::error::{HalError, HalResult};
use crate::surface::{Extent2d, Surface, SurfaceProvider};

/// Fabricated device address space; each buffer gets a disjoint 4 GiB slab.
static NEXT_BUFFER_SLOT: AtomicU64 = AtomicU64::new(1);

/// Software fence: a counter guarded by a mutex, with a condvar for
/// blocking waiters.
pub struct NullFence {
    value: Mutex<u64>,
    cond: Condvar,
    /// Number of waits that actually parked the calling thread.
    blocking_waits: AtomicU64,
}

impl NullFence {
    pub fn new(initial_value: u64) -> Self {
        Self {
            value: Mutex::new(initial_value),
            cond: Condvar::new(),
            blocking_waits: AtomicU64::new(0),
        }
    }

    /// Number of [`Fence::wait`] calls that found the value unreached and
    /// parked. Lets tests assert that already-satisfied waits never touch
    /// the blocking primitive.
    pub fn blocking_waits(&self) -> u64 {
        self.blocking_waits.load(Ordering::Acquire)
    }
}

impl Fence for NullFence {
    fn completed(&self) -> HalResult<u64> {
        Ok(*self.value.lock().unwrap())
    }

    fn wait(&self, value: u64) -> HalResult<()> {
        let guard = self.value.lock().unwrap();
        if *guard >= value {
            return Ok(());
        }
        self.blocking_waits.fetch_add(1, Ordering::AcqRel);
        let _guard = self
            .cond
            .wait_while(guard, |completed| *completed < value)
            .unwrap();
        Ok(())
    }

    fn signal(&self, value: u64) -> HalResult<()> {
        let mut guard = self.value.lock().unwrap();
        // Signals never lower the counter.
        *guard = (*guard).max(value);
        self.cond.notify_all();
        Ok(())
    }

    fn reset(&self, value: u64) -> HalResult<()> {
        let mut guard = self.value.lock().unwrap();
        *guard = value;
        self.cond.notify_all();
        Ok(())
    }
}

/// Software buffer backed by shared CPU memory.
///
/// Copies recorded against the buffer hold a handle to the same backing
/// storage, so a retiring submission writes through to all views.
pub struct NullBuffer {
    data: Arc<Mutex<Vec<u8>>>,
    usage: BufferUsage,
    size: u64,
    address: u64,
}

impl NullBuffer {
    fn new(desc: &BufferDesc) -> Self {
        let slot = NEXT_BUFFER_SLOT.fetch_add(1, Ordering::AcqRel);
        Self {
            data: Arc::new(Mutex::new(vec![0; desc.size as usize])),
            usage: desc.usage,
            size: desc.size,
            address: slot << 32,
        }
    }

    /// Snapshot of the buffer contents, for tests and demos.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl Buffer for NullBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn usage(&self) -> BufferUsage {
        self.usage
    }

    fn write(&self, offset: u64, data: &[u8]) -> HalResult<()> {
        if self.usage == BufferUsage::DeviceLocal {
            return Err(HalError::InvalidHandle(
                "device-local buffer is not CPU-writable".to_string(),
            ));
        }
        let end = offset + data.len() as u64;
        if end > self.size {
            return Err(HalError::InvalidHandle(format!(
                "write exceeds buffer size: offset {} + data {} > buffer {}",
                offset,
                data.len(),
                self.size
            )));
        }
        let mut guard = self.data.lock().unwrap();
        guard[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        // Backing memory is lock-guarded; callers go through write().
        None
    }

    fn device_address(&self) -> u64 {
        self.address
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One recorded copy, executed when its submission retires.
#[derive(Clone)]
struct NullCopy {
    src: Arc<Mutex<Vec<u8>>>,
    src_offset: u64,
    dst: Arc<Mutex<Vec<u8>>>,
    dst_offset: u64,
    size: u64,
}

impl NullCopy {
    fn execute(&self) {
        let src_range = self.src_offset as usize..(self.src_offset + self.size) as usize;
        let dst_start = self.dst_offset as usize;
        if Arc::ptr_eq(&self.src, &self.dst) {
            let mut data = self.src.lock().unwrap();
            data.copy_within(src_range, dst_start);
        } else {
            let src = self.src.lock().unwrap();
            let mut dst = self.dst.lock().unwrap();
            dst[dst_start..dst_start + self.size as usize].copy_from_slice(&src[src_range]);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
}

/// Software command buffer: records copies, replayed at retirement.
pub struct NullCommandBuffer {
    state: RecordState,
    copies: Vec<NullCopy>,
}

impl NullCommandBuffer {
    fn new() -> Self {
        Self {
            state: RecordState::Initial,
            copies: Vec::new(),
        }
    }
}

impl CommandBuffer for NullCommandBuffer {
    fn reset(&mut self) -> HalResult<()> {
        self.state = RecordState::Initial;
        self.copies.clear();
        Ok(())
    }

    fn begin(&mut self) -> HalResult<()> {
        if self.state == RecordState::Recording {
            return Err(HalError::InvalidHandle(
                "command buffer is already recording".to_string(),
            ));
        }
        self.copies.clear();
        self.state = RecordState::Recording;
        Ok(())
    }

    fn end(&mut self) -> HalResult<()> {
        if self.state != RecordState::Recording {
            return Err(HalError::InvalidHandle(
                "command buffer is not recording".to_string(),
            ));
        }
        self.state = RecordState::Executable;
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        src: &dyn Buffer,
        src_offset: u64,
        dst: &dyn Buffer,
        dst_offset: u64,
        size: u64,
    ) -> HalResult<()> {
        if self.state != RecordState::Recording {
            return Err(HalError::InvalidHandle(
                "command buffer is not recording".to_string(),
            ));
        }
        if src_offset + size > src.size() || dst_offset + size > dst.size() {
            return Err(HalError::InvalidHandle(format!(
                "copy of {} bytes out of bounds (src {} @ {}, dst {} @ {})",
                size,
                src.size(),
                src_offset,
                dst.size(),
                dst_offset
            )));
        }
        let src = downcast_buffer(src)?;
        let dst = downcast_buffer(dst)?;
        self.copies.push(NullCopy {
            src: src.data.clone(),
            src_offset,
            dst: dst.data.clone(),
            dst_offset,
            size,
        });
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn downcast_buffer(buffer: &dyn Buffer) -> HalResult<&NullBuffer> {
    buffer
        .as_any()
        .downcast_ref::<NullBuffer>()
        .ok_or_else(|| HalError::InvalidHandle("buffer does not belong to this device".to_string()))
}

struct NullSubmission {
    value: u64,
    copies: Vec<NullCopy>,
}

struct QueueState {
    pending: VecDeque<NullSubmission>,
    last_submitted: u64,
}

/// Software submission queue.
///
/// With `auto_complete` the queue behaves like an infinitely fast device:
/// every submission retires (copies execute, fence signals) inside
/// `submit`. Without it, submissions queue up until something retires
/// them, modelling a device that is arbitrarily far behind the host.
pub struct NullQueue {
    fence: Arc<NullFence>,
    state: Mutex<QueueState>,
    auto_complete: bool,
}

impl NullQueue {
    fn new(auto_complete: bool) -> Self {
        Self {
            fence: Arc::new(NullFence::new(0)),
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                last_submitted: 0,
            }),
            auto_complete,
        }
    }

    /// The queue fence with its concrete type, for tests that inspect
    /// blocking-wait counts.
    pub fn null_fence(&self) -> &Arc<NullFence> {
        &self.fence
    }

    /// Number of submissions the device has not retired yet.
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Retires every pending submission with value `<= value` (clamped to
    /// the highest submitted value) and signals the fence accordingly.
    ///
    /// Returns the fence value actually signaled.
    pub fn complete_through(&self, value: u64) -> HalResult<u64> {
        let cap = {
            let mut state = self.state.lock().unwrap();
            let cap = value.min(state.last_submitted);
            while let Some(submission) = state.pending.pop_front() {
                if submission.value > cap {
                    state.pending.push_front(submission);
                    break;
                }
                for copy in &submission.copies {
                    copy.execute();
                }
            }
            cap
        };
        self.fence.signal(cap)?;
        Ok(cap)
    }

    /// Retires the oldest pending submission, if any.
    pub fn complete_next(&self) -> HalResult<Option<u64>> {
        let retired = {
            let mut state = self.state.lock().unwrap();
            match state.pending.pop_front() {
                Some(submission) => {
                    for copy in &submission.copies {
                        copy.execute();
                    }
                    Some(submission.value)
                }
                None => None,
            }
        };
        if let Some(value) = retired {
            self.fence.signal(value)?;
        }
        Ok(retired)
    }

    /// Retires everything currently pending.
    pub fn complete_all(&self) -> HalResult<()> {
        let last = self.state.lock().unwrap().last_submitted;
        self.complete_through(last)?;
        Ok(())
    }
}

impl Queue for NullQueue {
    fn submit(&self, cmd: &mut dyn CommandBuffer, signal_value: u64) -> HalResult<()> {
        let cmd = cmd
            .as_any()
            .downcast_ref::<NullCommandBuffer>()
            .ok_or_else(|| {
                HalError::InvalidHandle("command buffer does not belong to this device".to_string())
            })?;
        if cmd.state != RecordState::Executable {
            return Err(HalError::InvalidHandle(
                "submitted command buffer was not finalized".to_string(),
            ));
        }
        let copies = cmd.copies.clone();

        {
            let mut state = self.state.lock().unwrap();
            state.last_submitted = state.last_submitted.max(signal_value);
            if self.auto_complete {
                for copy in &copies {
                    copy.execute();
                }
            } else {
                state.pending.push_back(NullSubmission {
                    value: signal_value,
                    copies,
                });
            }
        }
        if self.auto_complete {
            self.fence.signal(signal_value)?;
        }
        Ok(())
    }

    fn fence(&self) -> Arc<dyn Fence> {
        self.fence.clone()
    }
}

/// Software execution device.
pub struct NullDevice {
    queue: Arc<NullQueue>,
}

impl NullDevice {
    /// Creates a null device.
    ///
    /// With `auto_complete` every submission retires immediately;
    /// otherwise retirement is driven through [`NullQueue`].
    pub fn new(auto_complete: bool) -> Self {
        debug!(auto_complete, "created null device");
        Self {
            queue: Arc::new(NullQueue::new(auto_complete)),
        }
    }

    /// The queue with its concrete type, for retirement control.
    pub fn null_queue(&self) -> &Arc<NullQueue> {
        &self.queue
    }
}

impl Device for NullDevice {
    fn create_fence(&self, initial_value: u64) -> HalResult<Arc<dyn Fence>> {
        Ok(Arc::new(NullFence::new(initial_value)))
    }

    fn create_command_buffer(&self) -> HalResult<Box<dyn CommandBuffer>> {
        Ok(Box::new(NullCommandBuffer::new()))
    }

    fn create_buffer(&self, desc: &BufferDesc) -> HalResult<Box<dyn Buffer>> {
        if desc.size == 0 {
            return Err(HalError::InvalidHandle(
                "buffer size must be greater than 0".to_string(),
            ));
        }
        debug!(size = desc.size, usage = desc.usage.name(), "created null buffer");
        Ok(Box::new(NullBuffer::new(desc)))
    }

    fn queue(&self) -> Arc<dyn Queue> {
        self.queue.clone()
    }

    fn wait_idle(&self) -> HalResult<()> {
        self.queue.complete_all()
    }
}

/// Surface provider producing inert surfaces, for headless presentation.
pub struct NullSurfaceProvider {
    count: usize,
    extent: Extent2d,
    presented: u64,
    suboptimal_at: Option<u64>,
}

/// Inert presentable surface.
pub struct NullSurface {
    index: usize,
    extent: Extent2d,
}

impl NullSurfaceProvider {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            extent: Extent2d::default(),
            presented: 0,
            suboptimal_at: None,
        }
    }

    /// Report the surface set as stale on the n-th present (0-based).
    pub fn with_suboptimal_at(mut self, present_index: u64) -> Self {
        self.suboptimal_at = Some(present_index);
        self
    }

    /// Total number of presents performed.
    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl Surface for NullSurface {
    fn index(&self) -> usize {
        self.index
    }

    fn extent(&self) -> Extent2d {
        self.extent
    }
}

impl SurfaceProvider for NullSurfaceProvider {
    fn surface_count(&self) -> usize {
        self.count
    }

    fn recreate(&mut self, width: u32, height: u32) -> HalResult<Vec<Box<dyn Surface>>> {
        self.extent = Extent2d::new(width, height);
        debug!(width, height, count = self.count, "recreated null surfaces");
        Ok((0..self.count)
            .map(|index| {
                Box::new(NullSurface {
                    index,
                    extent: self.extent,
                }) as Box<dyn Surface>
            })
            .collect())
    }

    fn present(&mut self, surface: &dyn Surface) -> HalResult<bool> {
        if surface.index() >= self.count {
            return Err(HalError::InvalidHandle(format!(
                "surface index {} out of range (set of {})",
                surface.index(),
                self.count
            )));
        }
        let stale = self.suboptimal_at == Some(self.presented);
        self.presented += 1;
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fence_wait_already_complete_never_blocks() {
        let fence = NullFence::new(5);
        fence.wait(3).unwrap();
        fence.wait(5).unwrap();
        assert_eq!(fence.blocking_waits(), 0);
    }

    #[test]
    fn test_fence_wait_blocks_until_signaled() {
        let fence = Arc::new(NullFence::new(0));
        let waiter = {
            let fence = fence.clone();
            std::thread::spawn(move || fence.wait(2))
        };
        std::thread::sleep(Duration::from_millis(10));
        assert!(!waiter.is_finished());
        fence.signal(2).unwrap();
        waiter.join().unwrap().unwrap();
        assert_eq!(fence.blocking_waits(), 1);
    }

    #[test]
    fn test_fence_signal_never_lowers() {
        let fence = NullFence::new(0);
        fence.signal(7).unwrap();
        fence.signal(3).unwrap();
        assert_eq!(fence.completed().unwrap(), 7);
        fence.reset(1).unwrap();
        assert_eq!(fence.completed().unwrap(), 1);
    }

    #[test]
    fn test_copies_execute_at_retirement_not_submit() {
        let device = NullDevice::new(false);
        let queue = device.null_queue();

        let src = device
            .create_buffer(&BufferDesc {
                size: 4,
                usage: BufferUsage::Staging,
            })
            .unwrap();
        let dst = device
            .create_buffer(&BufferDesc {
                size: 4,
                usage: BufferUsage::DeviceLocal,
            })
            .unwrap();
        src.write(0, &[1, 2, 3, 4]).unwrap();

        let mut cmd = device.create_command_buffer().unwrap();
        cmd.begin().unwrap();
        cmd.copy_buffer(src.as_ref(), 0, dst.as_ref(), 0, 4).unwrap();
        cmd.end().unwrap();
        device.queue().submit(cmd.as_mut(), 1).unwrap();

        let dst_null = dst.as_any().downcast_ref::<NullBuffer>().unwrap();
        assert_eq!(dst_null.contents(), vec![0, 0, 0, 0]);

        queue.complete_through(1).unwrap();
        assert_eq!(dst_null.contents(), vec![1, 2, 3, 4]);
        assert_eq!(queue.null_fence().completed().unwrap(), 1);
    }

    #[test]
    fn test_auto_complete_retires_inside_submit() {
        let device = NullDevice::new(true);
        let mut cmd = device.create_command_buffer().unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        device.queue().submit(cmd.as_mut(), 9).unwrap();
        assert_eq!(device.null_queue().null_fence().completed().unwrap(), 9);
    }

    #[test]
    fn test_complete_through_clamps_to_submitted() {
        let device = NullDevice::new(false);
        let mut cmd = device.create_command_buffer().unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        device.queue().submit(cmd.as_mut(), 2).unwrap();

        let signaled = device.null_queue().complete_through(100).unwrap();
        assert_eq!(signaled, 2);
        assert_eq!(device.null_queue().null_fence().completed().unwrap(), 2);
    }

    #[test]
    fn test_device_local_buffer_rejects_cpu_writes() {
        let device = NullDevice::new(true);
        let buffer = device
            .create_buffer(&BufferDesc {
                size: 16,
                usage: BufferUsage::DeviceLocal,
            })
            .unwrap();
        assert!(buffer.write(0, &[0u8; 4]).is_err());
    }

    #[test]
    fn test_copy_out_of_bounds_rejected_at_record_time() {
        let device = NullDevice::new(true);
        let src = device
            .create_buffer(&BufferDesc {
                size: 4,
                usage: BufferUsage::Staging,
            })
            .unwrap();
        let dst = device
            .create_buffer(&BufferDesc {
                size: 4,
                usage: BufferUsage::DeviceLocal,
            })
            .unwrap();
        let mut cmd = device.create_command_buffer().unwrap();
        cmd.begin().unwrap();
        assert!(cmd.copy_buffer(src.as_ref(), 2, dst.as_ref(), 0, 4).is_err());
    }

    #[test]
    fn test_surface_provider_rotation_material() {
        let mut provider = NullSurfaceProvider::new(3).with_suboptimal_at(1);
        let surfaces = provider.recreate(640, 480).unwrap();
        assert_eq!(surfaces.len(), 3);
        assert_eq!(surfaces[2].index(), 2);
        assert_eq!(surfaces[0].extent(), Extent2d::new(640, 480));

        assert!(!provider.present(surfaces[0].as_ref()).unwrap());
        assert!(provider.present(surfaces[1].as_ref()).unwrap());
        assert!(!provider.present(surfaces[2].as_ref()).unwrap());
    }

    #[test]
    fn test_null_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NullDevice>();
        assert_send_sync::<NullQueue>();
        assert_send_sync::<NullFence>();
    }
}
