//! Per-frame transient buffer allocation.
//!
//! A bump allocator over a growable set of fixed-size dynamic buffers,
//! used for per-draw constant data that lives exactly one ring cycle.
//! Each frame slot owns one allocator; [`reset`](TransientAllocator::reset)
//! runs once per cycle, after the slot's previous generation has been
//! confirmed complete, so no unresolved device work can reference the
//! rewound memory.

use std::ptr::NonNull;
use std::sync::Arc;

use bytemuck::Pod;
use tracing::debug;

use framepipe_hal::{Buffer, BufferDesc, BufferUsage, Device};

use crate::error::{PipelineError, PipelineResult};

/// Alignment used for typed constant pushes; matches the common minimum
/// constant-buffer offset alignment across devices.
pub const UNIFORM_ALIGNMENT: u64 = 256;

/// Configuration for a [`TransientAllocator`].
#[derive(Clone, Copy, Debug)]
pub struct TransientConfig {
    /// Size of each backing block in bytes. A single allocation never
    /// spans two blocks, so this is also the maximum allocation size.
    pub block_size: u64,
    /// Number of blocks kept alive across resets. Blocks grown beyond
    /// this count during a spike are released at the next reset.
    pub retained_blocks: usize,
}

impl Default for TransientConfig {
    fn default() -> Self {
        Self {
            block_size: 256 * 1024,
            retained_blocks: 2,
        }
    }
}

/// One transient allocation.
///
/// Valid until the owning allocator's next `reset`.
#[derive(Clone, Copy, Debug)]
pub struct TransientAllocation {
    /// Index of the backing block within the allocator.
    pub block: usize,
    /// Byte offset within the block.
    pub offset: u64,
    /// Allocation size in bytes.
    pub size: u64,
    /// Device address of the allocation, or 0 if the backend does not
    /// support direct addressing.
    pub device_address: u64,
    /// CPU pointer to the allocation, if the block is host-mapped.
    pub ptr: Option<NonNull<u8>>,
}

/// Bump allocator over fixed-size dynamic buffers.
pub struct TransientAllocator {
    device: Arc<dyn Device>,
    block_size: u64,
    retained_blocks: usize,
    blocks: Vec<Box<dyn Buffer>>,
    active: usize,
    cursor: u64,
}

impl TransientAllocator {
    /// Creates an allocator and its first backing block.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is degenerate or the first
    /// block cannot be allocated.
    pub fn new(device: Arc<dyn Device>, config: TransientConfig) -> PipelineResult<Self> {
        if config.block_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "transient block size must be greater than 0".to_string(),
            ));
        }
        if config.retained_blocks == 0 {
            return Err(PipelineError::InvalidConfig(
                "at least one transient block must be retained".to_string(),
            ));
        }
        let first = device.create_buffer(&BufferDesc {
            size: config.block_size,
            usage: BufferUsage::Dynamic,
        })?;
        Ok(Self {
            device,
            block_size: config.block_size,
            retained_blocks: config.retained_blocks,
            blocks: vec![first],
            active: 0,
            cursor: 0,
        })
    }

    /// Bump-allocates `size` bytes at the given power-of-two alignment.
    ///
    /// If the active block cannot fit the request, the allocator advances
    /// to the next block, growing the set if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::AllocationTooLarge`] — without touching
    /// the current high-water mark — if `size` exceeds the block size.
    pub fn allocate(&mut self, size: u64, align: u64) -> PipelineResult<TransientAllocation> {
        if size > self.block_size {
            return Err(PipelineError::AllocationTooLarge {
                requested: size,
                block_size: self.block_size,
            });
        }
        let align = align.max(1);
        if !align.is_power_of_two() {
            return Err(PipelineError::InvalidConfig(format!(
                "allocation alignment {align} is not a power of two"
            )));
        }

        let mut offset = (self.cursor + align - 1) & !(align - 1);
        if offset + size > self.block_size {
            self.active += 1;
            if self.active == self.blocks.len() {
                let block = self.device.create_buffer(&BufferDesc {
                    size: self.block_size,
                    usage: BufferUsage::Dynamic,
                })?;
                debug!(
                    block = self.active,
                    size = self.block_size,
                    "grew transient allocator"
                );
                self.blocks.push(block);
            }
            offset = 0;
        }
        self.cursor = offset + size;

        let buffer = &self.blocks[self.active];
        let base_address = buffer.device_address();
        let device_address = if base_address == 0 {
            0
        } else {
            base_address + offset
        };
        let ptr = buffer.mapped_ptr().map(|base| {
            // Safety: offset + size is within the block, so the offset
            // pointer is inside the same mapped region and non-null.
            unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) }
        });

        Ok(TransientAllocation {
            block: self.active,
            offset,
            size,
            device_address,
            ptr,
        })
    }

    /// Allocates space for `value` at uniform alignment and writes it.
    pub fn push<T: Pod>(&mut self, value: &T) -> PipelineResult<TransientAllocation> {
        self.push_bytes(bytemuck::bytes_of(value), UNIFORM_ALIGNMENT)
    }

    /// Allocates space for `data` and writes it.
    pub fn push_bytes(&mut self, data: &[u8], align: u64) -> PipelineResult<TransientAllocation> {
        let allocation = self.allocate(data.len() as u64, align)?;
        self.blocks[allocation.block].write(allocation.offset, data)?;
        Ok(allocation)
    }

    /// The backing buffer of a block, for binding at the device boundary.
    pub fn block_buffer(&self, block: usize) -> &dyn Buffer {
        self.blocks[block].as_ref()
    }

    /// Rewinds the allocator to the start of its first block and releases
    /// blocks grown beyond the retained count.
    ///
    /// Must only be called once no unresolved device work references the
    /// previous cycle's allocations; the frame ring guarantees this by
    /// resetting only after its own completion wait.
    pub fn reset(&mut self) {
        self.active = 0;
        self.cursor = 0;
        if self.blocks.len() > self.retained_blocks {
            let released = self.blocks.len() - self.retained_blocks;
            self.blocks.truncate(self.retained_blocks);
            debug!(released, "released surplus transient blocks");
        }
    }

    /// Number of blocks currently backing the allocator.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Bump position within the active block.
    pub fn high_water_mark(&self) -> u64 {
        self.cursor
    }

    /// Index of the block allocations are currently served from.
    pub fn active_block(&self) -> usize {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framepipe_hal::null::NullDevice;

    fn allocator(block_size: u64, retained: usize) -> TransientAllocator {
        let device: Arc<dyn Device> = Arc::new(NullDevice::new(true));
        TransientAllocator::new(
            device,
            TransientConfig {
                block_size,
                retained_blocks: retained,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_allocations_bump_within_block() {
        let mut transient = allocator(1024, 1);
        let a = transient.allocate(100, 1).unwrap();
        let b = transient.allocate(100, 1).unwrap();
        assert_eq!(a.block, 0);
        assert_eq!(b.block, 0);
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 100);
        assert_eq!(transient.high_water_mark(), 200);
    }

    #[test]
    fn test_allocation_respects_alignment() {
        let mut transient = allocator(1024, 1);
        transient.allocate(10, 1).unwrap();
        let aligned = transient.allocate(16, 64).unwrap();
        assert_eq!(aligned.offset, 64);
    }

    #[test]
    fn test_allocation_never_spans_blocks() {
        let mut transient = allocator(256, 1);
        transient.allocate(200, 1).unwrap();
        let next = transient.allocate(100, 1).unwrap();
        assert_eq!(next.block, 1);
        assert_eq!(next.offset, 0);
        assert_eq!(transient.block_count(), 2);
    }

    #[test]
    fn test_too_large_allocation_fails_without_corrupting_state() {
        let mut transient = allocator(256, 1);
        transient.allocate(64, 1).unwrap();
        let mark = transient.high_water_mark();

        let result = transient.allocate(512, 1);
        assert!(matches!(
            result,
            Err(PipelineError::AllocationTooLarge {
                requested: 512,
                block_size: 256
            })
        ));
        assert_eq!(transient.high_water_mark(), mark);
        assert_eq!(transient.active_block(), 0);

        // The allocator keeps working after the usage error.
        transient.allocate(64, 1).unwrap();
    }

    #[test]
    fn test_reset_rewinds_and_releases_surplus_blocks() {
        let mut transient = allocator(128, 2);
        for _ in 0..5 {
            transient.allocate(128, 1).unwrap();
        }
        assert_eq!(transient.block_count(), 5);

        transient.reset();
        assert_eq!(transient.block_count(), 2);
        assert_eq!(transient.active_block(), 0);
        assert_eq!(transient.high_water_mark(), 0);
    }

    #[test]
    fn test_push_writes_value() {
        let mut transient = allocator(1024, 1);
        let value: [f32; 4] = [1.0, 2.0, 3.0, 4.0];
        let allocation = transient.push(&value).unwrap();
        assert_eq!(allocation.size, 16);
        assert_eq!(allocation.offset % UNIFORM_ALIGNMENT, 0);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let device: Arc<dyn Device> = Arc::new(NullDevice::new(true));
        let result = TransientAllocator::new(
            device,
            TransientConfig {
                block_size: 0,
                retained_blocks: 1,
            },
        );
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }
}
