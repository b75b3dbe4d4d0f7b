//! # KILN Core Types
//!
//! Fundamental type definitions used across the submission engine.
//!
//! These types provide:
//! - Strong typing for GPU addresses and sizes
//! - Type-safe generational handles for arena-owned objects
//! - Engine identifiers and completion counters

use core::fmt;
use core::ops::{Add, Sub};

// =============================================================================
// COMPLETION COUNTERS
// =============================================================================

/// Monotonic count of flushed tasks, unit of completion queries
pub type TaskCount = u32;

/// Monotonic dependency level, drives barrier insertion
pub type TaskLevel = u32;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// This is an address in the GPU's virtual address space.
/// It is NOT a CPU pointer and cannot be dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Align up to boundary
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<GpuAddr> for GpuAddr {
    type Output = u64;

    fn sub(self, rhs: GpuAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);
    /// 4 KiB
    pub const KIB_4: Self = Self(4 * 1024);
    /// 64 KiB
    pub const KIB_64: Self = Self(64 * 1024);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Get as usize (for buffer lengths)
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Align up
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }

    /// Scale by a fraction, rounding down
    #[inline]
    pub const fn scale(self, num: u64, den: u64) -> Self {
        if den == 0 {
            return Self::ZERO;
        }
        Self(self.0 / den * num + (self.0 % den) * num / den)
    }
}

impl Add for ByteSize {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 * 1024 {
            write!(f, "{} GiB", self.0 / (1024 * 1024 * 1024))
        } else if self.0 >= 1024 * 1024 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// ENGINE ID
// =============================================================================

/// Hardware engine a command stream receiver submits to
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct EngineId(u8);

impl EngineId {
    /// Maximum number of engines tracked per allocation
    pub const MAX: u8 = 32;

    /// Create an engine id
    ///
    /// Ids wrap at [`EngineId::MAX`] so they always index a residency bit.
    #[inline]
    pub const fn new(id: u8) -> Self {
        Self(id % Self::MAX)
    }

    /// Get the raw index
    #[inline]
    pub const fn index(self) -> u8 {
        self.0
    }

    /// Bit used in per-engine masks
    #[inline]
    pub const fn mask(self) -> u32 {
        1 << self.0
    }
}

impl fmt::Debug for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Engine({})", self.0)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Generational handle to an arena slot
///
/// Handles are type-safe wrappers that prevent mixing different arenas. The
/// generation detects use of a slot after it was freed and reused.
#[repr(C)]
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: core::marker::PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: core::marker::PhantomData,
        }
    }

    /// Get the slot index
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Get the slot generation
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

// Manual impls: derives would put bounds on `T`.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.index, self.generation).cmp(&(other.index, other.generation))
    }
}

impl<T> core::hash::Hash for Handle<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = core::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "Handle<{}>({}v{})", short, self.index, self.generation)
    }
}

static_assertions::assert_eq_size!(Handle<()>, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(GpuAddr::new(0x1001).align_up(0x1000), GpuAddr::new(0x2000));
        assert_eq!(ByteSize::from_bytes(65).align_up(64).as_bytes(), 128);
    }

    #[test]
    fn test_scale() {
        let size = ByteSize::from_mib(8);
        assert_eq!(size.scale(1, 4), ByteSize::from_mib(2));
        assert_eq!(size.scale(1, 0), ByteSize::ZERO);
        assert_eq!(ByteSize::from_bytes(10).scale(1, 3).as_bytes(), 3);
    }

    #[test]
    fn test_handle_generation() {
        struct Marker;
        let a = Handle::<Marker>::new(3, 1);
        let b = Handle::<Marker>::new(3, 2);
        assert_ne!(a, b);
        assert_eq!(a.index(), b.index());
    }

    #[test]
    fn test_engine_mask() {
        assert_eq!(EngineId::new(0).mask(), 1);
        assert_eq!(EngineId::new(5).mask(), 1 << 5);
        assert_eq!(EngineId::new(33).index(), 1);
    }
}
