//! Device buffer abstraction.
//!
//! Buffers are the only resource the pipeline moves data through: staging
//! buffers feed upload batches, dynamic buffers back per-frame transient
//! allocations, and device-local buffers are upload destinations.

use std::any::Any;
use std::ptr::NonNull;

use crate::error::HalResult;

/// Buffer usage type.
///
/// Defines the intended use of the buffer, which affects memory placement
/// and the native usage flags a backend selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// CPU-writable source for copies into device-local memory.
    Staging,
    /// CPU-writable, device-readable memory for per-frame transient data.
    Dynamic,
    /// Device-local memory, written through copy commands.
    DeviceLocal,
}

impl BufferUsage {
    /// Returns a human-readable name for the buffer type.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Staging => "staging",
            BufferUsage::Dynamic => "dynamic",
            BufferUsage::DeviceLocal => "device-local",
        }
    }
}

/// Description of a buffer to create.
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc {
    /// Buffer size in bytes. Must be greater than 0.
    pub size: u64,
    /// Intended buffer usage.
    pub usage: BufferUsage,
}

/// A device buffer with exclusively owned backing memory.
///
/// The owner is responsible for not freeing the buffer while submitted
/// work still references it; the pipeline crate enforces this with
/// completion values.
pub trait Buffer: Send + Sync {
    /// Buffer size in bytes.
    fn size(&self) -> u64;

    /// The usage the buffer was created with.
    fn usage(&self) -> BufferUsage;

    /// Writes data to the buffer at the given byte offset.
    ///
    /// Only meaningful for CPU-writable usages (`Staging`, `Dynamic`).
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is not CPU-writable or the write
    /// would exceed the buffer size.
    fn write(&self, offset: u64, data: &[u8]) -> HalResult<()>;

    /// Persistently mapped CPU pointer to the start of the buffer, if the
    /// backend exposes one. Backends without host-visible mapping return
    /// `None`; callers fall back to [`write`](Self::write).
    fn mapped_ptr(&self) -> Option<NonNull<u8>>;

    /// Address of the buffer in the device address space, for backends
    /// that support direct addressing. Returns 0 when unsupported.
    fn device_address(&self) -> u64;

    /// Backend downcast hook.
    fn as_any(&self) -> &dyn Any;
}
