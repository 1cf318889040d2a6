//! The handoff arena.
//!
//! A RECLAIMABLE physical allocation the kernel reads its tag list from.
//! Records are appended back to back, each zero-initialized and rounded up
//! to 8-byte alignment. The CORE record sits at offset 0 and is rewritten
//! when the list is terminated, once its cursor and stack fields are final.

use crate::error::LoadError;
use initium_addrs::PhysicalAddress;
use initium_mm::{AllocBias, MemoryManager, MemoryType};
use initium_protocol::tags::{TAG_CORE, TAG_NONE, TagCore, TagHeader};
use initium_protocol::{WireRecord, bytes_of, round8};
use initium_vmem::PhysMapper;

/// Size of the arena. A kernel declaring more option/mapping payload than
/// fits here cannot be booted.
pub const TAGS_SIZE: u32 = 12288;

/// The arena and its append cursor.
pub struct TagArena {
    phys: PhysicalAddress,
    cursor: u32,
    core: TagCore,
}

impl TagArena {
    /// Allocate the arena (RECLAIMABLE, high in memory) and seed the CORE
    /// record.
    pub fn new<M: PhysMapper>(mm: &mut MemoryManager, mapper: &M) -> Result<Self, LoadError> {
        let phys = mm.alloc(
            u64::from(TAGS_SIZE),
            0,
            0,
            u64::MAX,
            MemoryType::Reclaimable,
            AllocBias::High,
        )?;

        // SAFETY: freshly allocated, exclusively ours.
        unsafe { mapper.phys_to_slice_mut(phys, TAGS_SIZE as usize) }.fill(0);

        let core = TagCore {
            header: TagHeader {
                tag_type: TAG_CORE,
                size: size_of::<TagCore>() as u32,
            },
            tags_phys: phys.as_u64(),
            tags_size: 0,
            kernel_phys: 0,
            stack_base: 0,
            stack_phys: 0,
            stack_size: 0,
        };
        write_bytes(mapper, phys, bytes_of(&core));

        Ok(Self {
            phys,
            cursor: round8(size_of::<TagCore>() as u32),
            core,
        })
    }

    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        self.phys
    }

    /// CORE fields patched over the course of the pipeline.
    pub fn core_mut(&mut self) -> &mut TagCore {
        &mut self.core
    }

    /// Reserve `size` bytes for a record: zeroed, header written, cursor
    /// advanced to the next 8-byte boundary. Returns the record's physical
    /// address.
    pub fn alloc_tag<M: PhysMapper>(
        &mut self,
        mapper: &M,
        tag_type: u32,
        size: u32,
    ) -> Result<PhysicalAddress, LoadError> {
        let rounded = round8(size);
        let new_cursor = self
            .cursor
            .checked_add(rounded)
            .ok_or(LoadError::TagListOverflow)?;
        if new_cursor > TAGS_SIZE {
            return Err(LoadError::TagListOverflow);
        }

        let pa = self.phys + u64::from(self.cursor);
        // SAFETY: within the arena allocation by the check above.
        let slot = unsafe { mapper.phys_to_slice_mut(pa, size as usize) };
        slot.fill(0);

        let header = TagHeader { tag_type, size };
        write_bytes(mapper, pa, bytes_of(&header));

        self.cursor = new_cursor;
        Ok(pa)
    }

    /// Append the terminator and write the final CORE record. The CORE's
    /// `tags_size` is the terminator's offset from the arena base.
    pub fn finish<M: PhysMapper>(&mut self, mapper: &M) -> Result<(), LoadError> {
        let none_offset = self.cursor;
        self.alloc_tag(mapper, TAG_NONE, size_of::<TagHeader>() as u32)?;

        self.core.tags_phys = self.phys.as_u64();
        self.core.tags_size = none_offset;
        let core = self.core;
        write_bytes(mapper, self.phys, bytes_of(&core));
        Ok(())
    }
}

/// Copy `bytes` to physical memory at `pa`.
pub fn write_bytes<M: PhysMapper>(mapper: &M, pa: PhysicalAddress, bytes: &[u8]) {
    // SAFETY: callers stay within allocations they own.
    unsafe { mapper.phys_to_slice_mut(pa, bytes.len()) }.copy_from_slice(bytes);
}

/// Copy a wire record to physical memory at `pa`.
pub fn write_record<M: PhysMapper, T: WireRecord>(mapper: &M, pa: PhysicalAddress, record: &T) {
    write_bytes(mapper, pa, bytes_of(record));
}
