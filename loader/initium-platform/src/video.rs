//! Video modes as negotiated between the kernel's VIDEO image tag and the
//! platform's mode list.

use initium_addrs::PhysicalAddress;

/// A selected video mode. Field meanings match the VIDEO handoff record;
/// the loader fills the virtual address fields when it maps the memory into
/// the kernel's space.
#[derive(Debug, Clone, Copy)]
pub enum VideoMode {
    /// VGA text mode.
    Vga {
        cols: u32,
        lines: u32,
        x: u32,
        y: u32,
        mem_phys: PhysicalAddress,
        mem_size: u64,
    },
    /// Linear framebuffer.
    Lfb {
        width: u32,
        height: u32,
        bpp: u8,
        pitch: u32,
        red_size: u8,
        red_pos: u8,
        green_size: u8,
        green_pos: u8,
        blue_size: u8,
        blue_pos: u8,
        fb_phys: PhysicalAddress,
        fb_size: u64,
    },
}
