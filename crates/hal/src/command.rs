//! Command buffer abstraction.

use std::any::Any;

use crate::buffer::Buffer;
use crate::error::HalResult;

/// A reusable, single-threaded command buffer.
///
/// The recording lifecycle mirrors native command lists: `reset` returns
/// the buffer to an empty recordable state, `begin`/`end` bracket
/// recording, and a submitted buffer must not be reset until the device
/// has confirmed completion of the submission (the pipeline crate gates
/// this on completion values).
pub trait CommandBuffer: Send {
    /// Returns the command buffer to an empty state.
    ///
    /// Must not be called while previously submitted work is still
    /// in flight.
    fn reset(&mut self) -> HalResult<()>;

    /// Begins recording commands.
    fn begin(&mut self) -> HalResult<()>;

    /// Finalizes recording. The buffer is ready for submission afterwards.
    fn end(&mut self) -> HalResult<()>;

    /// Records a buffer-to-buffer copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is not recording or either range is
    /// out of bounds.
    fn copy_buffer(
        &mut self,
        src: &dyn Buffer,
        src_offset: u64,
        dst: &dyn Buffer,
        dst_offset: u64,
        size: u64,
    ) -> HalResult<()>;

    /// Backend downcast hook.
    fn as_any(&self) -> &dyn Any;
}
