//! Bounded frame pipelining and GPU/CPU resource-lifetime
//! synchronization.
//!
//! A producer (the control thread) records batches of work that an
//! asynchronous execution device completes out-of-band. Every
//! producer-owned resource — per-frame command buffers, transient
//! constant memory, staging buffers, presentation surfaces — is reused
//! or freed only after the device has provably finished consuming it.
//!
//! The pieces:
//! - [`Timeline`]: monotonic completion counter over the queue fence
//! - [`FrameManager`]: N-deep ring of per-frame resource bundles
//! - [`UploadBatch`]: batched uploads with deferred staging release
//! - [`BackbufferRing`]: presentation surface rotation
//! - [`TransientAllocator`]: per-frame linear constant allocation
//! - [`FramePipeline`]: driver composing all of the above behind the
//!   [`FramePipelineHost`] capability interface

mod error;

pub mod backbuffer;
pub mod driver;
pub mod ring;
pub mod timeline;
pub mod transient;
pub mod upload;

pub use backbuffer::BackbufferRing;
pub use driver::{FrameContext, FramePipeline, FramePipelineConfig, FramePipelineHost};
pub use error::{PipelineError, PipelineResult};
pub use ring::{FrameManager, FrameRingConfig, FrameSlot, DEFAULT_FRAMES_IN_FLIGHT};
pub use timeline::{Timeline, DEFAULT_SPIN_BUDGET};
pub use transient::{TransientAllocation, TransientAllocator, TransientConfig, UNIFORM_ALIGNMENT};
pub use upload::{UploadBatch, UploadTicket};
