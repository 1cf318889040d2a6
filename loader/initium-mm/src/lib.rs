//! # Loader Memory Management
//!
//! Two allocators used while constructing the kernel's world:
//!
//! * [`MemoryManager`] tracks physical memory as an ordered list of typed
//!   ranges and serves page-granular allocations with placement constraints
//!   (bounds, alignment, low/high bias). The final, coalesced list becomes
//!   the MEMORY records of the handoff arena.
//! * [`VirtualAllocator`], a first-fit allocator over the kernel's virtual
//!   map window, used to carve the kernel's address space.
//!
//! Both are single-owner and free of interior locking; the load pipeline is
//! strictly sequential.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod phys;
mod virt;

pub use phys::{AllocBias, MemoryError, MemoryManager, MemoryRange, MemoryType};
pub use virt::VirtualAllocator;
