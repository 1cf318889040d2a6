//! # MMU Context Construction
//!
//! Builds the page tables the kernel is entered with, before the MMU (in
//! that address space) is live. Three table formats are supported:
//!
//! | Mode | Levels | Entry | Large page | Top table |
//! |:-----|:-------|:------|:-----------|:----------|
//! | [`Mode::Ia32`]    | 2 | u32 | 4 MiB (PSE) | 1024-entry page directory |
//! | [`Mode::Ia32Pae`] | 3 | u64 | 2 MiB       | 4-entry PDPT |
//! | [`Mode::Amd64`]   | 4 | u64 | 2 MiB       | 512-entry PML4 |
//!
//! Two seams keep this testable off-target:
//!
//! * [`FrameAlloc`] hands out 4 KiB physical frames for tables. The loader
//!   backs this with the physical memory manager (PAGETABLES-typed for the
//!   kernel context, INTERNAL-typed for the trampoline context).
//! * [`PhysMapper`] converts a physical address into a usable pointer. On
//!   hardware the loader runs identity-mapped ([`IdentityMapper`]); tests
//!   substitute simulated RAM.
//!
//! Mappings choose large pages whenever the virtual address, the physical
//! address and the remaining size allow, and fall back to small pages
//! otherwise, allocating intermediate tables on demand. Kernel mappings are
//! writable by default; the present bit is only ever set on entries whose
//! target table or frame exists.

#![cfg_attr(not(test), no_std)]

mod context;
mod entry;

pub use context::{MmuContext, MmuError, Mode};
pub use entry::{Entry32, Entry64};

use initium_addrs::PhysicalAddress;

/// Whether `addr` is in 48-bit canonical form (bits 63:47 all equal).
#[inline]
#[must_use]
pub const fn is_canonical(addr: u64) -> bool {
    let top = addr >> 47;
    top == 0 || top == 0x1_ffff
}

/// Allocator for 4 KiB page-table frames.
///
/// Frames must be page-aligned; the context zeroes them itself. `None`
/// signals out-of-memory and aborts the mapping operation.
pub trait FrameAlloc {
    fn alloc_frame(&mut self) -> Option<PhysicalAddress>;
}

/// Converts physical addresses into pointers usable in the loader's own
/// address space.
pub trait PhysMapper {
    /// Borrow the object at `pa`.
    ///
    /// # Safety
    ///
    /// `pa` must be backed by accessible, writable memory of at least
    /// `size_of::<T>()` bytes, and `T` must tolerate every bit pattern.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Borrow `len` bytes at `pa`.
    ///
    /// # Safety
    ///
    /// `pa` must be backed by accessible, writable memory of at least `len`
    /// bytes, not aliased by live references.
    unsafe fn phys_to_slice_mut<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8];
}

/// The loader's view on real hardware: physical memory is identity-mapped.
pub struct IdentityMapper;

impl PhysMapper for IdentityMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: caller guarantees the range is identity-mapped and valid.
        unsafe { &mut *(pa.as_u64() as usize as *mut T) }
    }

    unsafe fn phys_to_slice_mut<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
        // SAFETY: as above.
        unsafe { core::slice::from_raw_parts_mut(pa.as_u64() as usize as *mut u8, len) }
    }
}
