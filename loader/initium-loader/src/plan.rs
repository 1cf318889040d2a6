//! Virtual address-space planning.
//!
//! Couples the virtual allocator, the kernel MMU context and the ordered
//! mapping list. Every virtual range the kernel will see goes through here
//! so the VMEM records can be emitted sorted and complete.

use crate::error::LoadError;
use alloc::vec::Vec;
use initium_addrs::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use initium_mm::{AllocBias, MemoryManager, MemoryType, VirtualAllocator};
use initium_vmem::{FrameAlloc, MmuContext, Mode, PhysMapper};

/// One finalized virtual range; `phys` is `None` for unmapped reservations.
#[derive(Debug, Clone, Copy)]
pub struct MappingRecord {
    pub start: u64,
    pub size: u64,
    pub phys: Option<u64>,
}

/// Page-table frame allocation through the memory manager, so table frames
/// carry the right range type (PAGETABLES for the kernel context, INTERNAL
/// for the trampoline context) and stay reachable by the target mode.
pub struct TableAlloc<'a> {
    pub mm: &'a mut MemoryManager,
    pub range_type: MemoryType,
    pub max: u64,
}

impl FrameAlloc for TableAlloc<'_> {
    fn alloc_frame(&mut self) -> Option<PhysicalAddress> {
        self.mm
            .alloc(PAGE_SIZE, 0, 0, self.max, self.range_type, AllocBias::High)
            .ok()
    }
}

/// Highest physical address the given mode's table entries can reference.
#[must_use]
pub const fn phys_ceiling(mode: Mode) -> u64 {
    match mode {
        Mode::Amd64 => u64::MAX,
        Mode::Ia32 | Mode::Ia32Pae => u32::MAX as u64,
    }
}

/// The kernel's address space under construction.
pub struct Plan {
    pub mode: Mode,
    pub mmu: MmuContext,
    pub allocator: VirtualAllocator,
    mappings: Vec<MappingRecord>,
}

impl Plan {
    pub fn new(mode: Mode, mmu: MmuContext, allocator: VirtualAllocator) -> Self {
        Self {
            mode,
            mmu,
            allocator,
            mappings: Vec::new(),
        }
    }

    /// The mapping list, ascending by virtual start.
    #[must_use]
    pub fn mappings(&self) -> &[MappingRecord] {
        &self.mappings
    }

    /// Validate a mapping request the way the protocol defines it: nonzero
    /// page-multiple size; a specified virtual address must be page-aligned,
    /// must not wrap and must fit below 4 GiB for 32-bit kernels; a
    /// specified physical address must be page-aligned.
    fn check_mapping(&self, virt: Option<u64>, phys: Option<u64>, size: u64) -> bool {
        if size == 0 || size % PAGE_SIZE != 0 {
            return false;
        }
        if let Some(addr) = virt {
            if addr % PAGE_SIZE != 0 {
                return false;
            }
            let Some(last) = addr.checked_add(size - 1) else {
                return false;
            };
            if !self.mode.is_64bit() && last >= 1 << 32 {
                return false;
            }
        }
        if let Some(p) = phys {
            if p % PAGE_SIZE != 0 {
                return false;
            }
        }
        true
    }

    /// Allocate a virtual range at an allocator-chosen address, optionally
    /// backed by physical memory.
    pub fn alloc_virtual<M: PhysMapper>(
        &mut self,
        mapper: &M,
        mm: &mut MemoryManager,
        phys: Option<u64>,
        size: u64,
    ) -> Result<VirtualAddress, LoadError> {
        self.alloc_virtual_aligned(mapper, mm, phys, size, 0)
    }

    /// As [`Plan::alloc_virtual`] with an explicit alignment (used for
    /// kernel segments, which keep their physical alignment virtually).
    pub fn alloc_virtual_aligned<M: PhysMapper>(
        &mut self,
        mapper: &M,
        mm: &mut MemoryManager,
        phys: Option<u64>,
        size: u64,
        align: u64,
    ) -> Result<VirtualAddress, LoadError> {
        if !self.check_mapping(None, phys, size) {
            return Err(LoadError::InvalidMappingPhys {
                phys: phys.unwrap_or(!0),
            });
        }

        let virt = self
            .allocator
            .alloc(size, align)
            .ok_or(LoadError::AddressSpaceExhausted { size })?;

        if let Some(p) = phys {
            self.map_tables(mapper, mm, virt, PhysicalAddress::new(p), size)
                .map_err(|_| LoadError::InvalidMappingPhys { phys: p })?;
        }

        self.add_mapping(virt.as_u64(), size, phys);
        Ok(virt)
    }

    /// Map (or reserve) at a caller-specified virtual address. Conflicts
    /// with existing ranges, and addresses outside the virtual map window,
    /// are fatal.
    pub fn map_virtual<M: PhysMapper>(
        &mut self,
        mapper: &M,
        mm: &mut MemoryManager,
        virt: u64,
        phys: Option<u64>,
        size: u64,
    ) -> Result<(), LoadError> {
        if !self.check_mapping(Some(virt), phys, size) {
            return Err(LoadError::InvalidMappingVirt { virt });
        }

        let addr = VirtualAddress::new(virt);
        if !self.allocator.contains(addr, size) {
            return Err(LoadError::MappingOutsideWindow { virt });
        }
        if !self.allocator.insert(addr, size) {
            return Err(LoadError::MappingConflict { virt });
        }

        if let Some(p) = phys {
            self.map_tables(mapper, mm, addr, PhysicalAddress::new(p), size)
                .map_err(|_| LoadError::InvalidMappingVirt { virt })?;
        }

        self.add_mapping(virt, size, phys);
        Ok(())
    }

    /// Install the translation in the kernel's page tables.
    fn map_tables<M: PhysMapper>(
        &mut self,
        mapper: &M,
        mm: &mut MemoryManager,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: u64,
    ) -> Result<(), LoadError> {
        let mut alloc = TableAlloc {
            mm,
            range_type: MemoryType::Pagetables,
            max: phys_ceiling(self.mode),
        };
        self.mmu.map(mapper, &mut alloc, virt, phys, size)?;
        Ok(())
    }

    /// Keep the mapping list sorted by virtual start; the VMEM records are
    /// emitted straight from it.
    fn add_mapping(&mut self, start: u64, size: u64, phys: Option<u64>) {
        let record = MappingRecord { start, size, phys };
        let pos = self
            .mappings
            .iter()
            .position(|m| start <= m.start)
            .unwrap_or(self.mappings.len());
        self.mappings.insert(pos, record);
    }
}
