//! Mode-parametric page-table construction and lookup.

use crate::entry::{Entry32, Entry64};
use crate::{FrameAlloc, PhysMapper, is_canonical};
use initium_addrs::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use log::trace;

/// Paging format the kernel will run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Two-level 32-bit tables, 4 MiB large pages via PSE.
    Ia32,
    /// Three-level PAE tables, 2 MiB large pages.
    Ia32Pae,
    /// Four-level long-mode tables, 2 MiB large pages.
    Amd64,
}

impl Mode {
    /// Size of the large-page granule for this mode.
    #[must_use]
    pub const fn large_page_size(self) -> u64 {
        match self {
            Self::Ia32 => 4 * 1024 * 1024,
            Self::Ia32Pae | Self::Amd64 => 2 * 1024 * 1024,
        }
    }

    /// Number of entries in the top-level table.
    #[must_use]
    pub const fn top_slot_count(self) -> usize {
        match self {
            Self::Ia32 => 1024,
            Self::Ia32Pae => 4,
            Self::Amd64 => 512,
        }
    }

    /// Virtual span covered by one top-level entry.
    #[must_use]
    pub const fn top_slot_span(self) -> u64 {
        match self {
            Self::Ia32 => 4 * 1024 * 1024,
            Self::Ia32Pae => 1 << 30,
            Self::Amd64 => 1 << 39,
        }
    }

    /// Whether this mode runs 64-bit kernels.
    #[must_use]
    pub const fn is_64bit(self) -> bool {
        matches!(self, Self::Amd64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MmuError {
    #[error("unaligned mapping request")]
    Unaligned,
    #[error("address out of range for the target mode")]
    AddressRange,
    #[error("mapping conflicts with an existing translation")]
    Conflict,
    #[error("out of memory allocating page tables")]
    OutOfMemory,
}

/// A kernel (or trampoline) address space under construction.
///
/// The context owns nothing but the root pointer; table frames come from the
/// caller's [`FrameAlloc`] so the memory manager can tag them (PAGETABLES
/// for the kernel's own tables, INTERNAL for the temporary trampoline
/// tables, keeping the latter invisible to the kernel).
pub struct MmuContext {
    mode: Mode,
    root: PhysicalAddress,
}

impl MmuContext {
    /// Allocate and zero the top-level table.
    pub fn create<A: FrameAlloc, M: PhysMapper>(
        mode: Mode,
        alloc: &mut A,
        mapper: &M,
    ) -> Result<Self, MmuError> {
        let root = alloc_table(alloc, mapper)?;
        Ok(Self { mode, root })
    }

    /// View an already-built address space (e.g. from a stored root).
    #[must_use]
    pub const fn from_root(mode: Mode, root: PhysicalAddress) -> Self {
        Self { mode, root }
    }

    /// Physical address of the top-level table (the CR3 value).
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Establish `virt -> phys` over `size` bytes.
    ///
    /// Uses the large-page granule wherever both addresses and the remaining
    /// size permit; intermediate tables are allocated on demand. Descending
    /// through an existing large-page leaf is a conflict.
    pub fn map<A: FrameAlloc, M: PhysMapper>(
        &mut self,
        mapper: &M,
        alloc: &mut A,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: u64,
    ) -> Result<(), MmuError> {
        let v = virt.as_u64();
        let p = phys.as_u64();
        if size == 0 || size % PAGE_SIZE != 0 || v % PAGE_SIZE != 0 || p % PAGE_SIZE != 0 {
            return Err(MmuError::Unaligned);
        }
        let Some(v_last) = v.checked_add(size - 1) else {
            return Err(MmuError::AddressRange);
        };
        let Some(p_last) = p.checked_add(size - 1) else {
            return Err(MmuError::AddressRange);
        };
        self.check_range(v, v_last, p_last)?;

        let large = self.mode.large_page_size();
        let mut off = 0u64;
        while off < size {
            let cur_v = v + off;
            let cur_p = p + off;
            let remaining = size - off;
            if cur_v % large == 0 && cur_p % large == 0 && remaining >= large {
                self.map_large(mapper, alloc, cur_v, cur_p)?;
                off += large;
            } else {
                self.map_small(mapper, alloc, cur_v, cur_p)?;
                off += PAGE_SIZE;
            }
        }

        trace!("mmu: mapped 0x{v:x} -> 0x{p:x} ({size:#x} bytes)");
        Ok(())
    }

    /// Walk the tables for `virt`.
    #[must_use]
    pub fn virt_to_phys<M: PhysMapper>(
        &self,
        mapper: &M,
        virt: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let v = virt.as_u64();
        match self.mode {
            Mode::Amd64 => {
                let l3_table = entry64_next(mapper, self.root, idx64(v, 39))?;
                let l2_table = entry64_next(mapper, l3_table, idx64(v, 30))?;
                // SAFETY: table frames come from alloc_table.
                let pd = unsafe { tbl64(mapper, l2_table) };
                let pde = pd[idx64(v, 21)];
                if !pde.present() {
                    return None;
                }
                if pde.large() {
                    return Some(PhysicalAddress::new(
                        pde.address().as_u64() + (v & (self.mode.large_page_size() - 1)),
                    ));
                }
                let pt = unsafe { tbl64(mapper, pde.address()) };
                let pte = pt[idx64(v, 12)];
                pte.present()
                    .then(|| PhysicalAddress::new(pte.address().as_u64() + (v & (PAGE_SIZE - 1))))
            }
            Mode::Ia32Pae => {
                let l2_table = entry64_next(mapper, self.root, ((v >> 30) & 3) as usize)?;
                let pd = unsafe { tbl64(mapper, l2_table) };
                let pde = pd[idx64(v, 21)];
                if !pde.present() {
                    return None;
                }
                if pde.large() {
                    return Some(PhysicalAddress::new(
                        pde.address().as_u64() + (v & (self.mode.large_page_size() - 1)),
                    ));
                }
                let pt = unsafe { tbl64(mapper, pde.address()) };
                let pte = pt[idx64(v, 12)];
                pte.present()
                    .then(|| PhysicalAddress::new(pte.address().as_u64() + (v & (PAGE_SIZE - 1))))
            }
            Mode::Ia32 => {
                let pd = unsafe { tbl32(mapper, self.root) };
                let pde = pd[((v >> 22) & 1023) as usize];
                if !pde.present() {
                    return None;
                }
                if pde.large() {
                    return Some(PhysicalAddress::new(
                        pde.address().as_u64() + (v & (self.mode.large_page_size() - 1)),
                    ));
                }
                let pt = unsafe { tbl32(mapper, pde.address()) };
                let pte = pt[((v >> 12) & 1023) as usize];
                pte.present()
                    .then(|| PhysicalAddress::new(pte.address().as_u64() + (v & (PAGE_SIZE - 1))))
            }
        }
    }

    /// Find the highest non-present top-level slot outside
    /// `avoid_first..=avoid_last`, for the recursive self-map. PAE has no
    /// slot to spare (its top table covers the whole space with 4 entries).
    #[must_use]
    pub fn free_top_slot<M: PhysMapper>(
        &self,
        mapper: &M,
        avoid_first: usize,
        avoid_last: usize,
    ) -> Option<usize> {
        match self.mode {
            Mode::Amd64 => {
                // SAFETY: root is a live table frame.
                let table = unsafe { tbl64(mapper, self.root) };
                (0..self.mode.top_slot_count())
                    .rev()
                    .find(|&i| !table[i].present() && (i < avoid_first || i > avoid_last))
            }
            Mode::Ia32 => {
                let table = unsafe { tbl32(mapper, self.root) };
                (0..self.mode.top_slot_count())
                    .rev()
                    .find(|&i| !table[i].present() && (i < avoid_first || i > avoid_last))
            }
            Mode::Ia32Pae => None,
        }
    }

    /// Point the top-level slot back at the top-level table itself.
    pub fn install_recursion<M: PhysMapper>(&mut self, mapper: &M, slot: usize) {
        debug_assert!(slot < self.mode.top_slot_count());
        match self.mode {
            Mode::Amd64 | Mode::Ia32Pae => {
                // SAFETY: root is a live table frame.
                let table = unsafe { tbl64(mapper, self.root) };
                table[slot] = Entry64::table(self.root);
            }
            Mode::Ia32 => {
                let table = unsafe { tbl32(mapper, self.root) };
                table[slot] = Entry32::table(self.root);
            }
        }
    }

    fn check_range(&self, v: u64, v_last: u64, p_last: u64) -> Result<(), MmuError> {
        match self.mode {
            Mode::Amd64 => {
                if !is_canonical(v) || !is_canonical(v_last) || (v >> 47) != (v_last >> 47) {
                    return Err(MmuError::AddressRange);
                }
            }
            Mode::Ia32 => {
                if v_last > u64::from(u32::MAX) || p_last > u64::from(u32::MAX) {
                    return Err(MmuError::AddressRange);
                }
            }
            Mode::Ia32Pae => {
                if v_last > u64::from(u32::MAX) {
                    return Err(MmuError::AddressRange);
                }
            }
        }
        Ok(())
    }

    fn map_large<A: FrameAlloc, M: PhysMapper>(
        &mut self,
        mapper: &M,
        alloc: &mut A,
        v: u64,
        p: u64,
    ) -> Result<(), MmuError> {
        let phys = PhysicalAddress::new(p);
        match self.mode {
            Mode::Amd64 => {
                let l3 = self.ensure64(mapper, alloc, self.root, idx64(v, 39), false)?;
                let l2 = self.ensure64(mapper, alloc, l3, idx64(v, 30), false)?;
                write_leaf64(mapper, l2, idx64(v, 21), Entry64::leaf(phys, true))
            }
            Mode::Ia32Pae => {
                let l2 = self.ensure64(mapper, alloc, self.root, ((v >> 30) & 3) as usize, true)?;
                write_leaf64(mapper, l2, idx64(v, 21), Entry64::leaf(phys, true))
            }
            Mode::Ia32 => write_leaf32(
                mapper,
                self.root,
                ((v >> 22) & 1023) as usize,
                Entry32::leaf(phys, true),
            ),
        }
    }

    fn map_small<A: FrameAlloc, M: PhysMapper>(
        &mut self,
        mapper: &M,
        alloc: &mut A,
        v: u64,
        p: u64,
    ) -> Result<(), MmuError> {
        let phys = PhysicalAddress::new(p);
        match self.mode {
            Mode::Amd64 => {
                let l3 = self.ensure64(mapper, alloc, self.root, idx64(v, 39), false)?;
                let l2 = self.ensure64(mapper, alloc, l3, idx64(v, 30), false)?;
                let l1 = self.ensure64(mapper, alloc, l2, idx64(v, 21), false)?;
                write_leaf64(mapper, l1, idx64(v, 12), Entry64::leaf(phys, false))
            }
            Mode::Ia32Pae => {
                let l2 = self.ensure64(mapper, alloc, self.root, ((v >> 30) & 3) as usize, true)?;
                let l1 = self.ensure64(mapper, alloc, l2, idx64(v, 21), false)?;
                write_leaf64(mapper, l1, idx64(v, 12), Entry64::leaf(phys, false))
            }
            Mode::Ia32 => {
                let pd_idx = ((v >> 22) & 1023) as usize;
                let l1 = self.ensure32(mapper, alloc, pd_idx)?;
                write_leaf32(mapper, l1, ((v >> 12) & 1023) as usize, Entry32::leaf(phys, false))
            }
        }
    }

    /// Get (or allocate) the table a 64-bit non-leaf entry points at.
    ///
    /// PAE top-level entries carry only the present bit; the writable bit is
    /// reserved there.
    fn ensure64<A: FrameAlloc, M: PhysMapper>(
        &self,
        mapper: &M,
        alloc: &mut A,
        table_pa: PhysicalAddress,
        idx: usize,
        pae_top: bool,
    ) -> Result<PhysicalAddress, MmuError> {
        // SAFETY: table frames come from alloc_table.
        let table = unsafe { tbl64(mapper, table_pa) };
        let entry = table[idx];
        if entry.present() {
            if entry.large() {
                return Err(MmuError::Conflict);
            }
            return Ok(entry.address());
        }
        let next = alloc_table(alloc, mapper)?;
        table[idx] = if pae_top {
            Entry64::new()
                .with_present(true)
                .with_frame(next.as_u64() >> 12)
        } else {
            Entry64::table(next)
        };
        Ok(next)
    }

    fn ensure32<A: FrameAlloc, M: PhysMapper>(
        &self,
        mapper: &M,
        alloc: &mut A,
        idx: usize,
    ) -> Result<PhysicalAddress, MmuError> {
        // SAFETY: root is a live table frame.
        let table = unsafe { tbl32(mapper, self.root) };
        let entry = table[idx];
        if entry.present() {
            if entry.large() {
                return Err(MmuError::Conflict);
            }
            return Ok(entry.address());
        }
        let next = alloc_table(alloc, mapper)?;
        table[idx] = Entry32::table(next);
        Ok(next)
    }
}

fn alloc_table<A: FrameAlloc, M: PhysMapper>(
    alloc: &mut A,
    mapper: &M,
) -> Result<PhysicalAddress, MmuError> {
    let pa = alloc.alloc_frame().ok_or(MmuError::OutOfMemory)?;
    debug_assert!(pa.is_page_aligned());
    // SAFETY: the allocator hands out whole, unused frames.
    unsafe { mapper.phys_to_slice_mut(pa, PAGE_SIZE as usize) }.fill(0);
    Ok(pa)
}

fn write_leaf64<M: PhysMapper>(
    mapper: &M,
    table_pa: PhysicalAddress,
    idx: usize,
    entry: Entry64,
) -> Result<(), MmuError> {
    // SAFETY: table frames come from alloc_table.
    let table = unsafe { tbl64(mapper, table_pa) };
    let existing = table[idx];
    if existing.present() && existing.large() != entry.large() {
        return Err(MmuError::Conflict);
    }
    table[idx] = entry;
    Ok(())
}

fn write_leaf32<M: PhysMapper>(
    mapper: &M,
    table_pa: PhysicalAddress,
    idx: usize,
    entry: Entry32,
) -> Result<(), MmuError> {
    // SAFETY: table frames come from alloc_table.
    let table = unsafe { tbl32(mapper, table_pa) };
    let existing = table[idx];
    if existing.present() && existing.large() != entry.large() {
        return Err(MmuError::Conflict);
    }
    table[idx] = entry;
    Ok(())
}

#[inline]
const fn idx64(v: u64, shift: u32) -> usize {
    ((v >> shift) & 511) as usize
}

/// Borrow a 512-entry 64-bit table frame.
unsafe fn tbl64<'a, M: PhysMapper>(mapper: &M, pa: PhysicalAddress) -> &'a mut [Entry64; 512] {
    // SAFETY: forwarded to the caller's contract.
    unsafe { mapper.phys_to_mut::<[Entry64; 512]>(pa) }
}

/// Borrow a 1024-entry 32-bit table frame.
unsafe fn tbl32<'a, M: PhysMapper>(mapper: &M, pa: PhysicalAddress) -> &'a mut [Entry32; 1024] {
    // SAFETY: forwarded to the caller's contract.
    unsafe { mapper.phys_to_mut::<[Entry32; 1024]>(pa) }
}

/// Resolve the present, non-large 64-bit entry at `idx` to its table.
fn entry64_next<M: PhysMapper>(
    mapper: &M,
    table_pa: PhysicalAddress,
    idx: usize,
) -> Option<PhysicalAddress> {
    // SAFETY: table frames come from alloc_table.
    let table = unsafe { tbl64(mapper, table_pa) };
    let entry = table[idx];
    (entry.present() && !entry.large()).then(|| entry.address())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Simulated physical RAM starting at `base`.
    struct TestRam {
        base: u64,
        buf: Vec<u8>,
    }

    impl TestRam {
        fn new(base: u64, size: usize) -> Self {
            Self {
                base,
                buf: vec![0u8; size],
            }
        }

        fn ptr(&self, pa: PhysicalAddress, len: usize) -> *mut u8 {
            let off = (pa.as_u64() - self.base) as usize;
            assert!(off + len <= self.buf.len(), "access outside test RAM");
            self.buf.as_ptr().cast_mut().wrapping_add(off)
        }
    }

    impl PhysMapper for TestRam {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            unsafe { &mut *self.ptr(pa, size_of::<T>()).cast::<T>() }
        }

        unsafe fn phys_to_slice_mut<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
            unsafe { core::slice::from_raw_parts_mut(self.ptr(pa, len), len) }
        }
    }

    /// Hands out consecutive frames, like the early-boot path does.
    struct BumpAlloc {
        next: u64,
        end: u64,
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_frame(&mut self) -> Option<PhysicalAddress> {
            if self.next + PAGE_SIZE > self.end {
                return None;
            }
            let pa = self.next;
            self.next += PAGE_SIZE;
            Some(PhysicalAddress::new(pa))
        }
    }

    fn harness() -> (TestRam, BumpAlloc) {
        let ram = TestRam::new(0, 256 * 4096);
        let alloc = BumpAlloc {
            next: 0,
            end: 256 * 4096,
        };
        (ram, alloc)
    }

    #[test]
    fn amd64_small_page_walk() {
        let (ram, mut alloc) = harness();
        let mut ctx = MmuContext::create(Mode::Amd64, &mut alloc, &ram).unwrap();

        let va = VirtualAddress::new(0xffff_8000_0000_0000);
        let pa = PhysicalAddress::new(0x30_0000);
        ctx.map(&ram, &mut alloc, va, pa, PAGE_SIZE).unwrap();

        assert_eq!(ctx.virt_to_phys(&ram, va), Some(pa));
        assert_eq!(
            ctx.virt_to_phys(&ram, VirtualAddress::new(0xffff_8000_0000_0123)),
            Some(PhysicalAddress::new(0x30_0123))
        );
        assert_eq!(
            ctx.virt_to_phys(&ram, VirtualAddress::new(0xffff_8000_0000_1000)),
            None
        );
    }

    #[test]
    fn amd64_uses_large_pages_when_aligned() {
        let (ram, mut alloc) = harness();
        let mut ctx = MmuContext::create(Mode::Amd64, &mut alloc, &ram).unwrap();

        let before = alloc.next;
        ctx.map(
            &ram,
            &mut alloc,
            VirtualAddress::new(0xffff_8000_0020_0000),
            PhysicalAddress::new(0x40_0000),
            2 * 1024 * 1024,
        )
        .unwrap();
        // Only PDPT and PD were needed; no PT for a 2 MiB leaf.
        assert_eq!(alloc.next - before, 2 * PAGE_SIZE);

        assert_eq!(
            ctx.virt_to_phys(&ram, VirtualAddress::new(0xffff_8000_0030_0000)),
            Some(PhysicalAddress::new(0x50_0000))
        );
    }

    #[test]
    fn amd64_rejects_noncanonical() {
        let (ram, mut alloc) = harness();
        let mut ctx = MmuContext::create(Mode::Amd64, &mut alloc, &ram).unwrap();
        let err = ctx.map(
            &ram,
            &mut alloc,
            VirtualAddress::new(0x0000_9000_0000_0000),
            PhysicalAddress::new(0x10_0000),
            PAGE_SIZE,
        );
        assert_eq!(err, Err(MmuError::AddressRange));
    }

    #[test]
    fn amd64_small_under_large_is_a_conflict() {
        let (ram, mut alloc) = harness();
        let mut ctx = MmuContext::create(Mode::Amd64, &mut alloc, &ram).unwrap();
        ctx.map(
            &ram,
            &mut alloc,
            VirtualAddress::new(0xffff_8000_0020_0000),
            PhysicalAddress::new(0x40_0000),
            2 * 1024 * 1024,
        )
        .unwrap();
        let err = ctx.map(
            &ram,
            &mut alloc,
            VirtualAddress::new(0xffff_8000_0020_1000),
            PhysicalAddress::new(0x9_0000),
            PAGE_SIZE,
        );
        assert_eq!(err, Err(MmuError::Conflict));
    }

    #[test]
    fn ia32_large_page_is_4m() {
        let (ram, mut alloc) = harness();
        let mut ctx = MmuContext::create(Mode::Ia32, &mut alloc, &ram).unwrap();

        let before = alloc.next;
        ctx.map(
            &ram,
            &mut alloc,
            VirtualAddress::new(0xc040_0000),
            PhysicalAddress::new(0x40_0000),
            4 * 1024 * 1024,
        )
        .unwrap();
        // Directly in the page directory.
        assert_eq!(alloc.next, before);

        assert_eq!(
            ctx.virt_to_phys(&ram, VirtualAddress::new(0xc047_1234)),
            Some(PhysicalAddress::new(0x47_1234))
        );
    }

    #[test]
    fn ia32_rejects_addresses_past_4g() {
        let (ram, mut alloc) = harness();
        let mut ctx = MmuContext::create(Mode::Ia32, &mut alloc, &ram).unwrap();
        let err = ctx.map(
            &ram,
            &mut alloc,
            VirtualAddress::new(0xffff_f000),
            PhysicalAddress::new(0x10_0000),
            2 * PAGE_SIZE,
        );
        assert_eq!(err, Err(MmuError::AddressRange));
    }

    #[test]
    fn pae_top_entries_carry_no_write_bit() {
        let (ram, mut alloc) = harness();
        let mut ctx = MmuContext::create(Mode::Ia32Pae, &mut alloc, &ram).unwrap();
        ctx.map(
            &ram,
            &mut alloc,
            VirtualAddress::new(0x4000_0000),
            PhysicalAddress::new(0x20_0000),
            2 * 1024 * 1024,
        )
        .unwrap();

        let top = unsafe { tbl64(&ram, ctx.root()) };
        assert!(top[1].present());
        assert!(!top[1].writable());

        assert_eq!(
            ctx.virt_to_phys(&ram, VirtualAddress::new(0x4000_1000)),
            Some(PhysicalAddress::new(0x20_1000))
        );
    }

    #[test]
    fn recursion_slot_search_avoids_window_and_used_slots() {
        let (ram, mut alloc) = harness();
        let mut ctx = MmuContext::create(Mode::Amd64, &mut alloc, &ram).unwrap();
        // Occupy the top slot (511) with a real mapping.
        ctx.map(
            &ram,
            &mut alloc,
            VirtualAddress::new(0xffff_ff80_0000_0000),
            PhysicalAddress::new(0x10_0000),
            PAGE_SIZE,
        )
        .unwrap();

        // Window covers slots 256..=400.
        let slot = ctx.free_top_slot(&ram, 256, 400).unwrap();
        assert_eq!(slot, 510);

        ctx.install_recursion(&ram, slot);
        let top = unsafe { tbl64(&ram, ctx.root()) };
        assert_eq!(top[slot].address(), ctx.root());

        // A fully covered top level leaves nothing.
        assert_eq!(ctx.free_top_slot(&ram, 0, 511), None);
    }
}
