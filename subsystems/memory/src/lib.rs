//! # Orion NUMA Memory Subsystem
//!
//! Per-node buddy page allocator with distance-ordered fallback.
//!
//! Every NUMA node owns its page frames behind its own IRQ-saving
//! ticket lock. Allocation prefers the requested node, splitting larger
//! blocks as needed; when a node is exhausted the other nodes are tried
//! strictly (no recursive fallback) in ascending firmware-distance
//! order. Freeing coalesces XOR-buddies back up the order ladder.
//!
//! Consumers: the scheduler places per-CPU run queues and AP kernel
//! stacks on the owning CPU's node; kernel-heap callers go through the
//! `kmalloc_node`-style wrapper.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod buddy;
pub mod numa;

use core::fmt;
use core::ptr::NonNull;

use orion_hal::arch::x86_64::smp::{cpu_info, per_cpu};
use orion_hal::{PlatformInfo, PAGE_SHIFT, PAGE_SIZE};

pub use buddy::{NodeAllocator, MAX_ORDER};
pub use numa::{NumaAllocator, NumaTopology};

// =============================================================================
// Error Type
// =============================================================================

/// Allocation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No block of the requested order on the node or any fallback.
    OutOfMemory,
    /// Node index out of range.
    InvalidNode,
    /// Order outside `[0, MAX_ORDER)`.
    InvalidOrder,
    /// Page frame not owned by any node, or double free.
    InvalidFrame,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of memory"),
            AllocError::InvalidNode => write!(f, "invalid NUMA node"),
            AllocError::InvalidOrder => write!(f, "invalid order"),
            AllocError::InvalidFrame => write!(f, "invalid page frame"),
        }
    }
}

// =============================================================================
// Global Allocator Instance
// =============================================================================

static GLOBAL: spin::Once<NumaAllocator> = spin::Once::new();

/// Initialize the NUMA allocator from the firmware description.
///
/// Must run on the BSP before the scheduler initializes; repeated calls
/// keep the first initialization.
pub fn init(info: &PlatformInfo) -> &'static NumaAllocator {
    GLOBAL.call_once(|| {
        let allocator = NumaAllocator::from_platform(info);
        log::info!(
            "NUMA: {} node(s), {} pages free",
            allocator.node_count(),
            allocator.total_free_pages()
        );
        allocator
    })
}

/// The global allocator; `None` before [`init`].
pub fn global() -> Option<&'static NumaAllocator> {
    GLOBAL.get()
}

/// NUMA node of the executing CPU.
pub fn current_node() -> u32 {
    cpu_info::cpu_to_node(per_cpu::current_cpu_id() as usize) as u32
}

/// Allocate `2^order` pages, preferring `node`, falling back by
/// distance. Returns the first page-frame number.
pub fn alloc_pages(node: u32, order: u32) -> Result<u64, AllocError> {
    global().ok_or(AllocError::OutOfMemory)?.alloc_pages(node, order)
}

/// Free a block previously returned by [`alloc_pages`]. The owning node
/// is derived from the frame number.
pub fn free_pages(pfn: u64, order: u32) -> Result<(), AllocError> {
    global().ok_or(AllocError::InvalidFrame)?.free_pages(pfn, order)
}

// =============================================================================
// kmalloc-Style Wrapper
// =============================================================================

/// Offset of the direct physical-memory map.
#[cfg(target_os = "none")]
const DIRECT_MAP_OFFSET: u64 = 0xFFFF_8000_0000_0000;
#[cfg(not(target_os = "none"))]
const DIRECT_MAP_OFFSET: u64 = 0;

/// Convert a page-frame number to its direct-mapped virtual address.
#[inline]
pub fn pfn_to_virt(pfn: u64) -> u64 {
    (pfn << PAGE_SHIFT) + DIRECT_MAP_OFFSET
}

/// Convert a direct-mapped virtual address back to its frame number.
#[inline]
pub fn virt_to_pfn(virt: u64) -> u64 {
    (virt - DIRECT_MAP_OFFSET) >> PAGE_SHIFT
}

/// Order covering `size` bytes rounded up to a power-of-two page count.
pub fn order_for_size(size: usize) -> u32 {
    let pages = size.div_ceil(PAGE_SIZE).max(1);
    pages.next_power_of_two().trailing_zeros()
}

/// Allocate `size` bytes of node-local memory, rounded up to a
/// power-of-two page count.
pub fn kmalloc_node(size: usize, node: u32) -> Result<NonNull<u8>, AllocError> {
    if size == 0 {
        return Err(AllocError::InvalidOrder);
    }
    let order = order_for_size(size);
    let pfn = alloc_pages(node, order)?;
    NonNull::new(pfn_to_virt(pfn) as *mut u8).ok_or(AllocError::InvalidFrame)
}

/// Free memory from [`kmalloc_node`]; `size` must match the original
/// request.
pub fn kfree_node(ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
    let order = order_for_size(size);
    free_pages(virt_to_pfn(ptr.as_ptr() as u64), order)
}
