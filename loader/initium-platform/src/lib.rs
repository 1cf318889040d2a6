//! # Platform Collaborator Interfaces
//!
//! The load pipeline is firmware-agnostic: everything it needs from the
//! surrounding loader (file access, device identity, video modes, the
//! physical memory map, the exit-boot-services handshake) enters through
//! the traits in this crate. A BIOS or EFI build implements them over its
//! firmware services; the test suite implements them over a simulated
//! machine.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod device;
mod fs;
mod video;

pub use device::{BootDevice, NET_IPV6, NetInfo};
pub use fs::{DirEntry, FileHandle, FileSystem, FsError};
pub use video::VideoMode;

use alloc::vec::Vec;
use initium_addrs::PhysicalAddress;

/// One physical region as advertised by the firmware.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub size: u64,
    /// Whether the region is usable RAM (as opposed to firmware-reserved).
    pub usable: bool,
}

/// Firmware shim the pipeline drives.
///
/// Between [`Platform::exit_boot_services`] and the jump into the
/// trampoline, no firmware services may be touched: no device I/O, no
/// firmware-backed console output. [`Platform::preboot`] runs in that window
/// and must restrict itself to detaching consoles and similar local work.
pub trait Platform {
    /// The initial physical memory map, delivered once at pipeline start.
    fn memory_map(&self) -> Vec<MemoryRegion>;

    /// The loader's own identity-mapped image range (page-rounded). Kept out
    /// of the kernel's virtual map and identity-mapped into the trampoline's
    /// temporary address space.
    fn loader_extent(&self) -> (PhysicalAddress, u64);

    /// Whether the CPU can enter long mode (64-bit kernels).
    fn cpu_supports_long_mode(&self) -> bool;

    /// Resolve a device specifier from the environment.
    fn lookup_device(&self, name: &str) -> Option<BootDevice>;

    /// The device backing the filesystem the kernel was read from.
    fn boot_device(&self) -> BootDevice;

    /// Pick a video mode matching the kernel's request, if video is
    /// supported at all. `types` is a mask of `VIDEO_*` kinds; zero geometry
    /// fields mean "no preference".
    fn find_video_mode(&self, types: u32, width: u32, height: u32, bpp: u8) -> Option<VideoMode>;

    /// Terminate firmware boot services and return the final memory map.
    ///
    /// Regions released by the firmware are handed to the memory manager
    /// before it finalizes. On BIOS-style platforms this is a no-op
    /// returning an empty map.
    fn exit_boot_services(&mut self) -> Vec<MemoryRegion>;

    /// Last hook before the trampoline: detach debug consoles that died
    /// with the firmware. No firmware calls allowed.
    fn preboot(&mut self);

    /// Stop: reboot on BIOS, firmware exit on EFI. Used by callers once the
    /// pipeline reports a fatal error.
    fn halt(&self) -> !;
}
