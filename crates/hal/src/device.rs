//! Device, queue, and fence abstractions.
//!
//! These traits are the whole surface the pipeline consumes from an
//! asynchronous execution device. A backend provides a [`Device`] that
//! creates resources, a serial [`Queue`] that executes submissions
//! out-of-band, and a [`Fence`] whose counter the queue signals as
//! submissions retire.

use std::sync::Arc;

use crate::buffer::{Buffer, BufferDesc};
use crate::command::CommandBuffer;
use crate::error::HalResult;

/// A monotonic completion fence.
///
/// The fence carries a 64-bit counter. The device raises the counter as
/// submitted work finishes; the host reads it, blocks on it, and — on the
/// drain-and-reset path only — signals or reinitializes it directly.
///
/// # Thread Safety
///
/// All methods may be called concurrently from multiple threads.
pub trait Fence: Send + Sync {
    /// The greatest counter value the device has confirmed finished.
    ///
    /// Monotonically non-decreasing between [`reset`](Self::reset) calls,
    /// and never exceeds the latest value passed to a signal mechanism.
    fn completed(&self) -> HalResult<u64>;

    /// Blocks the calling thread until `completed() >= value`.
    ///
    /// There is no timeout. A failure reported by the underlying wait
    /// primitive surfaces as [`HalError::SyncTimeout`] and is fatal to the
    /// pipeline.
    ///
    /// [`HalError::SyncTimeout`]: crate::HalError::SyncTimeout
    fn wait(&self, value: u64) -> HalResult<()>;

    /// Raises the counter to `value` from the host side.
    ///
    /// Used by the drain path; never lowers the counter.
    fn signal(&self, value: u64) -> HalResult<()>;

    /// Reinitializes the counter to `value`.
    ///
    /// Only legal once the device is drained; this is the one operation
    /// that may move the counter backwards.
    fn reset(&self, value: u64) -> HalResult<()>;
}

/// A serial submission queue.
///
/// Work submitted to the queue executes asynchronously, in submission
/// order. Each submission names a value the queue signals on its
/// [`fence`](Self::fence) once that submission retires, so fence values
/// strictly reflect submission order.
pub trait Queue: Send + Sync {
    /// Submits a finalized command buffer and enqueues a signal of
    /// `signal_value` on the queue fence immediately after it.
    ///
    /// The caller guarantees `signal_value` increases across submissions
    /// (the pipeline serializes advance-and-submit for this reason).
    fn submit(&self, cmd: &mut dyn CommandBuffer, signal_value: u64) -> HalResult<()>;

    /// The fence this queue signals as submissions retire.
    fn fence(&self) -> Arc<dyn Fence>;
}

/// An asynchronous execution device.
///
/// Factory for every resource the pipeline owns. The device outlives all
/// resources created from it; backends enforce this with shared ownership
/// of their internals.
pub trait Device: Send + Sync {
    /// Creates a standalone fence with the given initial counter value.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::SyncInit`] if the underlying wait primitive
    /// cannot be created; this is fatal to the whole pipeline.
    ///
    /// [`HalError::SyncInit`]: crate::HalError::SyncInit
    fn create_fence(&self, initial_value: u64) -> HalResult<Arc<dyn Fence>>;

    /// Allocates a reusable command buffer.
    fn create_command_buffer(&self) -> HalResult<Box<dyn CommandBuffer>>;

    /// Creates a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if `desc.size` is 0 or allocation fails.
    fn create_buffer(&self, desc: &BufferDesc) -> HalResult<Box<dyn Buffer>>;

    /// The device's submission queue.
    fn queue(&self) -> Arc<dyn Queue>;

    /// Blocks until the device has retired all submitted work.
    fn wait_idle(&self) -> HalResult<()>;
}
