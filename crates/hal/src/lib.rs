//! Execution-device abstraction layer.
//!
//! This crate defines the narrow interface the frame pipeline consumes
//! from an asynchronous execution device:
//! - Device, queue, and completion-fence traits
//! - Buffer and command-buffer traits
//! - Presentation surface traits
//! - An in-process null backend for tests and headless runs

mod error;

pub mod buffer;
pub mod command;
pub mod device;
pub mod null;
pub mod surface;

pub use buffer::{Buffer, BufferDesc, BufferUsage};
pub use command::CommandBuffer;
pub use device::{Device, Fence, Queue};
pub use error::{HalError, HalResult};
pub use surface::{Extent2d, Surface, SurfaceProvider};
