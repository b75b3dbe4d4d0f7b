//! # Linear Stream
//!
//! Cursor over a registry-owned command buffer allocation.
//!
//! A stream never owns its bytes. They live in the allocation's CPU view, so
//! a stream can be retired into a pool while recorded fragments still point
//! into it.

use kiln_core::{Error, GpuAddr, Result};
use kiln_mem::{AllocationId, AllocationRegistry};

use crate::encoder::{Command, CommandEncoder};

/// Cache line streams are padded to after a terminating command
pub const CACHE_LINE_SIZE: usize = 64;

/// Byte position inside a stream allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLocation {
    /// Allocation holding the bytes
    pub allocation: AllocationId,
    /// Offset from the allocation start
    pub offset: usize,
}

/// Half-open byte range inside a stream allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRange {
    /// Allocation holding the bytes
    pub allocation: AllocationId,
    /// GPU address of the allocation
    pub gpu_base: GpuAddr,
    /// First byte
    pub start: usize,
    /// One past the last byte
    pub end: usize,
}

impl StreamRange {
    /// GPU address of the first byte
    pub fn gpu_start(&self) -> GpuAddr {
        self.gpu_base.offset(self.start as u64)
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Growable command stream cursor
#[derive(Debug, Clone)]
pub struct LinearStream {
    allocation: Option<AllocationId>,
    gpu_base: GpuAddr,
    used: usize,
    max: usize,
}

impl LinearStream {
    /// Stream without backing memory
    pub const fn empty() -> Self {
        Self {
            allocation: None,
            gpu_base: GpuAddr::null(),
            used: 0,
            max: 0,
        }
    }

    /// Stream over an allocation
    pub const fn new(allocation: AllocationId, gpu_base: GpuAddr, size: usize) -> Self {
        Self {
            allocation: Some(allocation),
            gpu_base,
            used: 0,
            max: size,
        }
    }

    /// Backing allocation
    pub fn allocation(&self) -> Option<AllocationId> {
        self.allocation
    }

    /// GPU address of the allocation
    pub fn gpu_base(&self) -> GpuAddr {
        self.gpu_base
    }

    /// Bytes written
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes left
    pub fn available(&self) -> usize {
        self.max - self.used
    }

    /// Capacity
    pub fn max_size(&self) -> usize {
        self.max
    }

    /// Reserve `size` bytes, returning their offset
    pub fn get_space(&mut self, size: usize) -> Result<usize> {
        if self.allocation.is_none() || size > self.available() {
            return Err(Error::CommandBufferFull);
        }
        let offset = self.used;
        self.used += size;
        Ok(offset)
    }

    /// Point the stream at a new allocation, starting empty
    pub fn replace(&mut self, allocation: AllocationId, gpu_base: GpuAddr, size: usize) {
        *self = Self::new(allocation, gpu_base, size);
    }

    /// Location of a byte offset
    pub fn location(&self, offset: usize) -> Result<StreamLocation> {
        let allocation = self.allocation.ok_or(Error::InvalidState)?;
        Ok(StreamLocation { allocation, offset })
    }

    /// Range from `start` to the cursor
    pub fn range_from(&self, start: usize) -> Result<StreamRange> {
        let allocation = self.allocation.ok_or(Error::InvalidState)?;
        Ok(StreamRange {
            allocation,
            gpu_base: self.gpu_base,
            start,
            end: self.used,
        })
    }

    /// Append raw bytes
    pub fn append(&mut self, registry: &mut AllocationRegistry, bytes: &[u8]) -> Result<usize> {
        let offset = self.get_space(bytes.len())?;
        self.slot_mut(registry, offset, bytes.len())?
            .copy_from_slice(bytes);
        Ok(offset)
    }

    /// Append an encoded command
    pub fn emit<E: CommandEncoder>(
        &mut self,
        registry: &mut AllocationRegistry,
        encoder: &E,
        command: &Command,
    ) -> Result<usize> {
        let size = encoder.size_of(command.kind());
        let offset = self.get_space(size)?;
        encoder.encode(command, self.slot_mut(registry, offset, size)?)?;
        Ok(offset)
    }

    /// Append `size` bytes of no-ops
    pub fn emit_noop<E: CommandEncoder>(
        &mut self,
        registry: &mut AllocationRegistry,
        encoder: &E,
        size: usize,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let offset = self.get_space(size)?;
        encoder.encode_noop(self.slot_mut(registry, offset, size)?);
        Ok(())
    }

    /// Pad with no-ops up to the next cache line
    pub fn align_to_cache_line<E: CommandEncoder>(
        &mut self,
        registry: &mut AllocationRegistry,
        encoder: &E,
    ) -> Result<()> {
        let padding = padding_to_cache_line(self.used);
        self.emit_noop(registry, encoder, padding.min(self.available()))
    }

    fn slot_mut<'r>(
        &self,
        registry: &'r mut AllocationRegistry,
        offset: usize,
        size: usize,
    ) -> Result<&'r mut [u8]> {
        let allocation = self.allocation.ok_or(Error::InvalidState)?;
        registry
            .get_mut(allocation)?
            .cpu_view_mut()
            .get_mut(offset..offset + size)
            .ok_or(Error::CommandBufferFull)
    }
}

impl Default for LinearStream {
    fn default() -> Self {
        Self::empty()
    }
}

/// Bytes needed to reach the next cache line boundary
pub const fn padding_to_cache_line(used: usize) -> usize {
    (CACHE_LINE_SIZE - used % CACHE_LINE_SIZE) % CACHE_LINE_SIZE
}

/// Overwrite an already-written slot with an encoded command
pub fn patch_command<E: CommandEncoder>(
    registry: &mut AllocationRegistry,
    encoder: &E,
    location: StreamLocation,
    command: &Command,
) -> Result<()> {
    let size = encoder.size_of(command.kind());
    let slot = registry
        .get_mut(location.allocation)?
        .cpu_view_mut()
        .get_mut(location.offset..location.offset + size)
        .ok_or(Error::InvalidParameter)?;
    encoder.encode(command, slot)
}

/// Overwrite an already-written slot with no-ops
pub fn patch_noop<E: CommandEncoder>(
    registry: &mut AllocationRegistry,
    encoder: &E,
    location: StreamLocation,
    size: usize,
) -> Result<()> {
    let slot = registry
        .get_mut(location.allocation)?
        .cpu_view_mut()
        .get_mut(location.offset..location.offset + size)
        .ok_or(Error::InvalidParameter)?;
    encoder.encode_noop(slot);
    Ok(())
}

/// Bytes of a range
pub fn range_bytes<'r>(registry: &'r AllocationRegistry, range: &StreamRange) -> Result<&'r [u8]> {
    registry
        .get(range.allocation)?
        .cpu_view()
        .get(range.start..range.end)
        .ok_or(Error::InvalidParameter)
}
