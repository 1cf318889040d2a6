//! Page-table entry formats.

use initium_addrs::PhysicalAddress;

/// 64-bit entry used by PAE and long-mode tables at every level.
///
/// `frame` holds the physical frame number (address bits 51:12). The `large`
/// bit is the PS bit: set on a PD entry it maps 2 MiB; it must stay clear on
/// non-leaf entries and on PT entries.
#[bitfield_struct::bitfield(u64)]
pub struct Entry64 {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large: bool,
    pub global: bool,
    #[bits(3)]
    _avl: u8,
    #[bits(40)]
    pub frame: u64,
    #[bits(11)]
    _rsv: u16,
    pub no_execute: bool,
}

impl Entry64 {
    /// Non-leaf entry pointing at the next table level.
    #[must_use]
    pub fn table(next: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame(next.as_u64() >> 12)
    }

    /// Leaf entry mapping a page at `phys`.
    #[must_use]
    pub fn leaf(phys: PhysicalAddress, large: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_large(large)
            .with_frame(phys.as_u64() >> 12)
    }

    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }
}

/// 32-bit entry used by legacy two-level tables.
///
/// `frame` holds address bits 31:12; a PS-flagged page-directory entry maps
/// 4 MiB (the low ten frame bits are then zero by alignment).
#[bitfield_struct::bitfield(u32)]
pub struct Entry32 {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large: bool,
    pub global: bool,
    #[bits(3)]
    _avl: u8,
    #[bits(20)]
    pub frame: u32,
}

impl Entry32 {
    #[must_use]
    pub fn table(next: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame((next.as_u64() >> 12) as u32)
    }

    #[must_use]
    pub fn leaf(phys: PhysicalAddress, large: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_large(large)
            .with_frame((phys.as_u64() >> 12) as u32)
    }

    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new((self.frame() as u64) << 12)
    }
}
