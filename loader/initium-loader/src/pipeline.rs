//! The load pipeline.
//!
//! Runs once per boot, strictly in phase order; every error past this point
//! is fatal (the caller logs it and halts through the platform). The phases:
//! CPU check, memory manager and arena setup, LOAD parameter validation,
//! address-space planning, segment loading, kernel-requested mappings, the
//! recursive page-table slot, the tag-area mapping, sections, modules, the
//! stack, the trampoline, and finally tag emission, firmware exit and the
//! prepared [`Handoff`].

use crate::arena::{TAGS_SIZE, TagArena, write_bytes, write_record};
use crate::error::LoadError;
use crate::loader::{InitiumLoader, Module};
use crate::plan::{Plan, TableAlloc, phys_ceiling};
use crate::trampoline::{EntryArgs, Handoff, write_trampoline};
use alloc::vec::Vec;
use initium_addrs::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_up, is_pow2};
use initium_elf::{
    ElfClass, ElfError, ElfImage, PT_LOAD, ProgramHeader, SHF_ALLOC, SHT_NOBITS, SHT_PROGBITS,
    SHT_STRTAB, SHT_SYMTAB,
};
use initium_mm::{AllocBias, MemoryManager, MemoryRange, MemoryType, VirtualAllocator};
use initium_platform::{BootDevice, FileHandle, Platform, VideoMode};
use initium_protocol::itags::LOAD_FIXED;
use initium_protocol::itags::{IMAGE_SECTIONS, ItagLoad, MAPPING_ANY_VIRT};
use initium_protocol::round8;
use initium_protocol::tags::{
    BOOTDEV_FS, BOOTDEV_NET, BOOTDEV_NONE, BOOTDEV_OTHER, MEMORY_ALLOCATED, MEMORY_FREE,
    MEMORY_MODULES, MEMORY_PAGETABLES, MEMORY_RECLAIMABLE, MEMORY_RESERVED, MEMORY_STACK,
    TAG_BOOTDEV, TAG_MEMORY, TAG_MODULE, TAG_OPTION, TAG_PAGETABLES, TAG_SECTIONS, TAG_VIDEO,
    TAG_VMEM, TagBootDeviceFs, TagBootDeviceNet, TagBootDeviceNone, TagBootDeviceOther, TagHeader,
    TagMemory, TagModule, TagOption, TagPagetables, TagSections, TagVideoLfb, TagVideoVga, TagVmem,
    VIDEO_LFB, VIDEO_VGA, VMEM_UNMAPPED,
};
use initium_vmem::{MmuContext, Mode, PhysMapper};
use log::{debug, info};

/// Unpacked LOAD parameters, after validation and architecture defaults.
#[derive(Debug, Clone, Copy)]
struct LoadParams {
    flags: u32,
    alignment: u64,
    min_alignment: u64,
    virt_map_base: u64,
    virt_map_size: u64,
}

impl LoadParams {
    const fn fixed(&self) -> bool {
        self.flags & LOAD_FIXED != 0
    }
}

impl From<&ItagLoad> for LoadParams {
    fn from(tag: &ItagLoad) -> Self {
        Self {
            flags: { tag.flags },
            alignment: { tag.alignment },
            min_alignment: { tag.min_alignment },
            virt_map_base: { tag.virt_map_base },
            virt_map_size: { tag.virt_map_size },
        }
    }
}

impl InitiumLoader {
    /// Run the pipeline to completion and return the prepared handoff
    /// state. Call [`crate::trampoline::enter`] with the result; the split
    /// exists so that everything up to the jump stays observable.
    pub fn load<P: Platform + PhysMapper>(self, platform: &mut P) -> Result<Handoff, LoadError> {
        let InitiumLoader {
            path: _path,
            mut handle,
            image,
            phdrs,
            itags,
            image_tag,
            mut modules,
            env,
            video,
            root_device,
        } = self;

        let mode = match image.class {
            ElfClass::Elf32 => Mode::Ia32,
            ElfClass::Elf64 => Mode::Amd64,
        };
        info!(
            "initium: version {} image, flags 0x{:x}",
            { image_tag.version },
            { image_tag.flags }
        );

        // Check whether the CPU can host the requested mode.
        if mode.is_64bit() && !platform.cpu_supports_long_mode() {
            return Err(LoadError::UnsupportedCpu);
        }

        // Track physical memory from the firmware's initial map.
        let mut mm = MemoryManager::from_usable(
            platform
                .memory_map()
                .into_iter()
                .filter(|r| r.usable)
                .map(|r| (r.start, r.size)),
        );

        // The handoff arena comes first; tags are appended throughout.
        let mut arena = TagArena::new(&mut mm, platform)?;

        // Validate load parameters (a missing LOAD tag means all-default).
        let mut params = itags
            .load()
            .map_or_else(|| LoadParams::from(&ItagLoad::default()), LoadParams::from);
        validate_alignment_params(&mut params)?;
        validate_virt_map_params(&mut params, mode)?;
        arch_load_defaults(&mut params, mode);

        // Create the kernel address space and the virtual allocator, and
        // make sure virtual address zero is never handed out.
        let mmu = MmuContext::create(
            mode,
            &mut TableAlloc {
                mm: &mut mm,
                range_type: MemoryType::Pagetables,
                max: phys_ceiling(mode),
            },
            platform,
        )?;
        let mut allocator = VirtualAllocator::new(
            VirtualAddress::new(params.virt_map_base),
            params.virt_map_size,
        );
        allocator.reserve(VirtualAddress::zero(), PAGE_SIZE);
        let mut plan = Plan::new(mode, mmu, allocator);

        // Load the kernel image.
        let loaded = load_segments(
            platform,
            &mut mm,
            &mut plan,
            handle.as_mut(),
            &image,
            &phdrs,
            &params,
        )?;
        arena.core_mut().kernel_phys = loaded.kernel_phys;

        // Perform all mappings specified by the kernel image.
        for mapping in itags.mappings() {
            let virt = { mapping.virt };
            let phys = { mapping.phys };
            let size = { mapping.size };
            let phys = (phys != !0).then_some(phys);
            if virt == MAPPING_ANY_VIRT {
                plan.alloc_virtual(platform, &mut mm, phys, size)?;
            } else {
                plan.map_virtual(platform, &mut mm, virt, phys, size)?;
            }
        }

        // Install the recursive page-table mapping and describe it.
        arch_setup(platform, &mut arena, &mut plan, &params, mode)?;

        // Now the tag list itself can get its virtual mapping.
        let tags_virt = plan.alloc_virtual(
            platform,
            &mut mm,
            Some(arena.phys().as_u64()),
            u64::from(TAGS_SIZE),
        )?;

        // Load additional sections if the kernel asked for them.
        if { image_tag.flags } & IMAGE_SECTIONS != 0 {
            load_sections(platform, &mut mm, &mut arena, handle.as_mut(), &image)?;
        }

        // Load modules.
        load_modules(platform, &mut mm, &mut arena, &mut modules)?;

        // Allocate the kernel stack.
        let stack_phys = mm.alloc(
            PAGE_SIZE,
            0,
            0,
            u64::MAX,
            MemoryType::Stack,
            AllocBias::High,
        )?;
        let stack_virt =
            plan.alloc_virtual(platform, &mut mm, Some(stack_phys.as_u64()), PAGE_SIZE)?;
        {
            let core = arena.core_mut();
            core.stack_base = stack_virt.as_u64();
            core.stack_phys = stack_phys.as_u64();
            core.stack_size = PAGE_SIZE as u32;
        }

        // Set up the kernel entry trampoline.
        let tramp = setup_trampoline(platform, &mut mm, &mut plan, mode)?;

        // Video, options and boot device, in emission order.
        emit_video_tag(platform, &mut mm, &mut arena, &mut plan, video)?;
        emit_option_tags(platform, &mut arena, &itags, &env)?;
        emit_bootdev_tag(platform, &mut arena, root_device)?;

        // Terminate firmware services; their final map reaches the memory
        // manager before it freezes. No firmware calls from here on.
        for region in platform.exit_boot_services() {
            if region.usable {
                mm.release(region.start.as_u64(), region.size);
            }
        }

        // Reclaim loader-internal memory and emit the final maps.
        let final_map: Vec<MemoryRange> = mm.finalize().to_vec();
        debug!("initium: final physical memory map:");
        mm.dump();
        for range in &final_map {
            let record = TagMemory {
                header: TagHeader {
                    tag_type: TAG_MEMORY,
                    size: size_of::<TagMemory>() as u32,
                },
                start: range.start,
                size: range.size,
                memory_type: memory_tag_type(range.range_type),
            };
            let pa = arena.alloc_tag(platform, TAG_MEMORY, record.header.size)?;
            write_record(platform, pa, &record);
        }

        debug!("initium: final virtual memory map:");
        for mapping in plan.mappings() {
            let phys = mapping.phys.unwrap_or(VMEM_UNMAPPED);
            debug!(
                "  0x{:016x}-0x{:016x} -> 0x{:016x}",
                mapping.start,
                mapping.start + mapping.size,
                phys
            );
            let record = TagVmem {
                header: TagHeader {
                    tag_type: TAG_VMEM,
                    size: size_of::<TagVmem>() as u32,
                },
                start: mapping.start,
                size: mapping.size,
                phys,
            };
            let pa = arena.alloc_tag(platform, TAG_VMEM, record.header.size)?;
            write_record(platform, pa, &record);
        }

        // End the tag list and write the final CORE record.
        arena.finish(platform)?;

        info!(
            "initium: entry point at 0x{:x}, stack at 0x{:x}",
            loaded.entry,
            stack_virt.as_u64()
        );

        // Firmware consoles die with boot services; detach them.
        platform.preboot();

        // Populate the trampoline page last: arguments, then the blob.
        let args = EntryArgs {
            trampoline_cr3: tramp.mmu.root().as_u64(),
            trampoline_virt: tramp.virt.as_u64(),
            kernel_cr3: plan.mmu.root().as_u64(),
            sp: stack_virt.as_u64() + PAGE_SIZE,
            entry: loaded.entry,
            tags: tags_virt.as_u64(),
        };
        write_trampoline(platform, tramp.phys, mode, &args)?;

        Ok(Handoff {
            mode,
            trampoline_phys: tramp.phys,
            args,
        })
    }
}

/// Alignment constraints: `alignment` is 0 (defaulted later) or a power of
/// two of at least page size; `min_alignment` likewise, capped by
/// `alignment`, defaulting to it.
fn validate_alignment_params(params: &mut LoadParams) -> Result<(), LoadError> {
    if params.alignment != 0 && (params.alignment < PAGE_SIZE || !is_pow2(params.alignment)) {
        return Err(LoadError::InvalidAlignmentParams);
    }
    if params.min_alignment != 0 {
        if params.min_alignment < PAGE_SIZE
            || params.min_alignment > params.alignment
            || !is_pow2(params.min_alignment)
        {
            return Err(LoadError::InvalidAlignmentParams);
        }
    } else {
        params.min_alignment = params.alignment;
    }
    Ok(())
}

/// Virtual map window: page-aligned, non-wrapping, inside 4 GiB for 32-bit
/// kernels (where an unset window defaults to the whole 4 GiB).
fn validate_virt_map_params(params: &mut LoadParams, mode: Mode) -> Result<(), LoadError> {
    if params.virt_map_base % PAGE_SIZE != 0 || params.virt_map_size % PAGE_SIZE != 0 {
        return Err(LoadError::InvalidVirtMapParams);
    }
    if params.virt_map_base != 0 && params.virt_map_size == 0 {
        return Err(LoadError::InvalidVirtMapParams);
    }
    if params.virt_map_size != 0
        && params
            .virt_map_base
            .checked_add(params.virt_map_size - 1)
            .is_none()
    {
        return Err(LoadError::InvalidVirtMapParams);
    }

    if !mode.is_64bit() {
        if params.virt_map_base == 0 && params.virt_map_size == 0 {
            params.virt_map_size = 1 << 32;
        } else if params
            .virt_map_base
            .checked_add(params.virt_map_size)
            .is_none_or(|end| end > 1 << 32)
        {
            return Err(LoadError::InvalidVirtMapParams);
        }
    }
    Ok(())
}

/// Architecture defaults: large-page alignment with a 1 MiB floor for
/// relocatable kernels, and the canonical upper half as the 64-bit window
/// when the kernel names none. A declared window is taken as-is;
/// canonicality is enforced per mapping by the MMU context.
fn arch_load_defaults(params: &mut LoadParams, mode: Mode) {
    if !params.fixed() && params.alignment == 0 {
        params.alignment = mode.large_page_size();
        params.min_alignment = 0x10_0000;
    }

    if mode.is_64bit() && params.virt_map_base == 0 && params.virt_map_size == 0 {
        params.virt_map_base = 0xffff_8000_0000_0000;
        params.virt_map_size = 1 << 47;
    }
}

/// Result of segment loading.
struct LoadedKernel {
    entry: u64,
    kernel_phys: u64,
}

/// Place and copy every PT_LOAD segment.
///
/// FIXED kernels get their declared addresses verbatim. Relocatable kernels
/// get a high-biased physical range, halving the alignment down to the
/// declared minimum under memory pressure, and a virtual range of the same
/// alignment; the entry point moves with the segment that contains it.
fn load_segments<P: Platform + PhysMapper>(
    platform: &P,
    mm: &mut MemoryManager,
    plan: &mut Plan,
    handle: &mut dyn FileHandle,
    image: &ElfImage,
    phdrs: &[ProgramHeader],
    params: &LoadParams,
) -> Result<LoadedKernel, LoadError> {
    let mut entry = image.entry;
    let mut kernel_phys: Option<(u64, u64)> = None;

    for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD && p.p_memsz > 0) {
        let size = align_up(phdr.p_memsz, PAGE_SIZE);

        let (virt, phys) = if params.fixed() {
            let phys = phdr.p_paddr;
            if phys % PAGE_SIZE != 0 {
                return Err(LoadError::InvalidMappingPhys { phys });
            }
            let limit = phys
                .checked_add(size - 1)
                .ok_or(LoadError::InvalidMappingPhys { phys })?;
            mm.alloc(size, PAGE_SIZE, phys, limit, MemoryType::Allocated, AllocBias::Low)?;
            plan.map_virtual(platform, mm, phdr.p_vaddr, Some(phys), size)?;
            (phdr.p_vaddr, phys)
        } else {
            let min_align = params.min_alignment.max(PAGE_SIZE);
            let mut align = params.alignment.max(PAGE_SIZE);
            let phys = loop {
                match mm.alloc(
                    size,
                    align,
                    0,
                    phys_ceiling(plan.mode),
                    MemoryType::Allocated,
                    AllocBias::High,
                ) {
                    Ok(phys) => break phys.as_u64(),
                    Err(err) => {
                        if align > min_align {
                            align /= 2;
                        } else {
                            return Err(err.into());
                        }
                    }
                }
            };
            let virt = plan
                .alloc_virtual_aligned(platform, mm, Some(phys), size, align)?
                .as_u64();

            if image.entry >= phdr.p_vaddr && image.entry - phdr.p_vaddr < phdr.p_memsz {
                entry = virt + (image.entry - phdr.p_vaddr);
            }
            (virt, phys)
        };

        copy_segment(platform, handle, phdr, PhysicalAddress::new(phys), size)?;
        debug!(
            "initium: loaded segment 0x{:016x} -> 0x{:016x} ({:#x} bytes)",
            virt, phys, size
        );

        if kernel_phys.is_none_or(|(lowest, _)| virt < lowest) {
            kernel_phys = Some((virt, phys));
        }
    }

    Ok(LoadedKernel {
        entry,
        kernel_phys: kernel_phys.map_or(0, |(_, phys)| phys),
    })
}

/// Copy a segment's file bytes and zero the BSS tail up to the allocation
/// end.
fn copy_segment<P: PhysMapper>(
    platform: &P,
    handle: &mut dyn FileHandle,
    phdr: &ProgramHeader,
    phys: PhysicalAddress,
    size: u64,
) -> Result<(), LoadError> {
    let filesz = usize::try_from(phdr.p_filesz).map_err(|_| LoadError::Elf(ElfError::Malformed))?;
    let total = usize::try_from(size).map_err(|_| LoadError::Elf(ElfError::Malformed))?;
    if filesz > total {
        return Err(LoadError::Elf(ElfError::Malformed));
    }

    // SAFETY: the range was just allocated for this segment.
    let dest = unsafe { platform.phys_to_slice_mut(phys, total) };
    if filesz > 0 {
        handle
            .read_at(&mut dest[..filesz], phdr.p_offset)
            .map_err(|source| LoadError::Elf(ElfError::Io(source)))?;
    }
    dest[filesz..].fill(0);
    Ok(())
}

/// Find a free top-level slot outside the virtual map window, point it back
/// at the top-level table and emit the PAGETABLES record.
fn arch_setup<P: Platform + PhysMapper>(
    platform: &P,
    arena: &mut TagArena,
    plan: &mut Plan,
    params: &LoadParams,
    mode: Mode,
) -> Result<(), LoadError> {
    let span = mode.top_slot_span();
    let slots = mode.top_slot_count() as u64;
    let vm_start = ((params.virt_map_base / span) % slots) as usize;
    let vm_end = (((params.virt_map_base + (params.virt_map_size - 1)) / span) % slots) as usize;

    let slot = plan
        .mmu
        .free_top_slot(platform, vm_start, vm_end)
        .ok_or(LoadError::NoPagetableSlot)?;
    plan.mmu.install_recursion(platform, slot);

    let base = slot as u64 * span;
    let mapping = if mode.is_64bit() && slot >= 256 {
        base | 0xffff_0000_0000_0000
    } else {
        base
    };
    debug!("initium: recursive page table mapping at 0x{mapping:x}");

    let record = TagPagetables {
        header: TagHeader {
            tag_type: TAG_PAGETABLES,
            size: size_of::<TagPagetables>() as u32,
        },
        root: plan.mmu.root().as_u64(),
        mapping,
    };
    let pa = arena.alloc_tag(platform, TAG_PAGETABLES, record.header.size)?;
    write_record(platform, pa, &record);
    Ok(())
}

/// Load non-allocated sections (symbol tables, string tables, debug data)
/// and hand the patched section header table to the kernel.
fn load_sections<P: Platform + PhysMapper>(
    platform: &P,
    mm: &mut MemoryManager,
    arena: &mut TagArena,
    handle: &mut dyn FileHandle,
    image: &ElfImage,
) -> Result<(), LoadError> {
    let mut table = initium_elf::read_section_table(handle, image)?;
    let headers = initium_elf::section_headers(handle, image)?;
    let entsize = usize::from(image.shentsize);

    for (idx, section) in headers.iter().enumerate() {
        if section.sh_flags & SHF_ALLOC != 0 || section.sh_size == 0 {
            continue;
        }
        if !matches!(
            section.sh_type,
            SHT_PROGBITS | SHT_SYMTAB | SHT_STRTAB | SHT_NOBITS
        ) {
            continue;
        }

        let len = usize::try_from(section.sh_size).map_err(|_| LoadError::Elf(ElfError::Malformed))?;
        let phys = mm.alloc(
            align_up(section.sh_size, PAGE_SIZE),
            0,
            0,
            u64::MAX,
            MemoryType::Allocated,
            AllocBias::High,
        )?;

        // SAFETY: freshly allocated for this section.
        let dest = unsafe { platform.phys_to_slice_mut(phys, len) };
        if section.sh_type == SHT_NOBITS {
            dest.fill(0);
        } else {
            handle
                .read_at(dest, section.sh_offset)
                .map_err(|source| LoadError::Elf(ElfError::Io(source)))?;
        }

        initium_elf::patch_section_addr(
            image.class,
            &mut table[idx * entsize..(idx + 1) * entsize],
            phys.as_u64(),
        )?;
        debug!("initium: loaded ELF section {idx} to {phys}");
    }

    let size = TagSections::TABLE_OFFSET + table.len() as u32;
    let record = TagSections {
        header: TagHeader {
            tag_type: TAG_SECTIONS,
            size,
        },
        num: u32::from(image.shnum),
        entsize: u32::from(image.shentsize),
        shstrndx: u32::from(image.shstrndx),
    };
    let pa = arena.alloc_tag(platform, TAG_SECTIONS, size)?;
    write_record(platform, pa, &record);
    write_bytes(platform, pa + u64::from(TagSections::TABLE_OFFSET), &table);
    Ok(())
}

/// Read every module into MODULES-typed memory and emit its record, in the
/// order the command named them.
fn load_modules<P: Platform + PhysMapper>(
    platform: &P,
    mm: &mut MemoryManager,
    arena: &mut TagArena,
    modules: &mut [Module],
) -> Result<(), LoadError> {
    for module in modules {
        let file_size = module.handle.size();
        let alloc_size = align_up(file_size.max(1), PAGE_SIZE);
        let phys = mm.alloc(
            alloc_size,
            0,
            0,
            u64::MAX,
            MemoryType::Modules,
            AllocBias::High,
        )?;

        debug!(
            "initium: loading module '{}' to {} (size: {})",
            module.name, phys, file_size
        );

        if file_size > 0 {
            let len =
                usize::try_from(file_size).map_err(|_| LoadError::Elf(ElfError::Malformed))?;
            // SAFETY: freshly allocated for this module.
            let dest = unsafe { platform.phys_to_slice_mut(phys, len) };
            module
                .handle
                .read_at(dest, 0)
                .map_err(|source| LoadError::ModuleRead {
                    name: module.name.clone(),
                    source,
                })?;
        }

        let name_size = module.name.len() as u32 + 1;
        let size = TagModule::NAME_OFFSET + name_size;
        let record = TagModule {
            header: TagHeader {
                tag_type: TAG_MODULE,
                size,
            },
            addr: phys.as_u64(),
            size: file_size,
            name_size,
        };
        let pa = arena.alloc_tag(platform, TAG_MODULE, size)?;
        write_record(platform, pa, &record);
        write_cstr(platform, pa + u64::from(TagModule::NAME_OFFSET), &module.name);
    }
    Ok(())
}

/// Prepared trampoline state.
struct Trampoline {
    phys: PhysicalAddress,
    virt: VirtualAddress,
    mmu: MmuContext,
}

/// Build the temporary address space and place the trampoline page.
///
/// The loader's own extent is reserved in the virtual allocator first, so
/// the page's kernel-space address can never collide with the loader; the
/// temporary space then identity-maps the loader and maps the page at that
/// same address. All of its memory is INTERNAL-typed.
fn setup_trampoline<P: Platform + PhysMapper>(
    platform: &P,
    mm: &mut MemoryManager,
    plan: &mut Plan,
    mode: Mode,
) -> Result<Trampoline, LoadError> {
    let (loader_base, loader_size) = platform.loader_extent();

    plan.allocator
        .reserve(VirtualAddress::new(loader_base.as_u64()), loader_size);

    let phys = mm.alloc(
        PAGE_SIZE,
        0,
        0,
        phys_ceiling(mode),
        MemoryType::Internal,
        AllocBias::High,
    )?;
    let virt = plan.alloc_virtual(platform, mm, Some(phys.as_u64()), PAGE_SIZE)?;

    let mut tramp_mmu = MmuContext::create(
        mode,
        &mut TableAlloc {
            mm,
            range_type: MemoryType::Internal,
            max: phys_ceiling(mode),
        },
        platform,
    )?;
    {
        let mut table_alloc = TableAlloc {
            mm,
            range_type: MemoryType::Internal,
            max: phys_ceiling(mode),
        };
        tramp_mmu.map(
            platform,
            &mut table_alloc,
            VirtualAddress::new(loader_base.as_u64()),
            loader_base,
            loader_size,
        )?;
        tramp_mmu.map(platform, &mut table_alloc, virt, phys, PAGE_SIZE)?;
    }

    debug!("initium: trampoline at physical {phys}, virtual {virt}");
    Ok(Trampoline {
        phys,
        virt,
        mmu: tramp_mmu,
    })
}

/// Emit the VIDEO record for the selected mode, mapping its memory into the
/// kernel's space.
fn emit_video_tag<P: Platform + PhysMapper>(
    platform: &P,
    mm: &mut MemoryManager,
    arena: &mut TagArena,
    plan: &mut Plan,
    video: Option<VideoMode>,
) -> Result<(), LoadError> {
    let Some(mode) = video else {
        return Ok(());
    };

    match mode {
        VideoMode::Vga {
            cols,
            lines,
            x,
            y,
            mem_phys,
            mem_size,
        } => {
            let mem_virt = plan.alloc_virtual(
                platform,
                mm,
                Some(mem_phys.as_u64()),
                align_up(mem_size, PAGE_SIZE),
            )?;
            let record = TagVideoVga {
                header: TagHeader {
                    tag_type: TAG_VIDEO,
                    size: size_of::<TagVideoVga>() as u32,
                },
                video_type: VIDEO_VGA,
                cols,
                lines,
                x,
                y,
                mem_phys: mem_phys.as_u64(),
                mem_size,
                mem_virt: mem_virt.as_u64(),
            };
            let pa = arena.alloc_tag(platform, TAG_VIDEO, record.header.size)?;
            write_record(platform, pa, &record);
        }
        VideoMode::Lfb {
            width,
            height,
            bpp,
            pitch,
            red_size,
            red_pos,
            green_size,
            green_pos,
            blue_size,
            blue_pos,
            fb_phys,
            fb_size,
        } => {
            let fb_virt = plan.alloc_virtual(
                platform,
                mm,
                Some(fb_phys.as_u64()),
                align_up(fb_size, PAGE_SIZE),
            )?;
            let record = TagVideoLfb {
                header: TagHeader {
                    tag_type: TAG_VIDEO,
                    size: size_of::<TagVideoLfb>() as u32,
                },
                video_type: VIDEO_LFB,
                flags: initium_protocol::tags::LFB_RGB,
                width,
                height,
                bpp,
                pitch,
                red_size,
                red_pos,
                green_size,
                green_pos,
                blue_size,
                blue_pos,
                fb_phys: fb_phys.as_u64(),
                fb_size,
                fb_virt: fb_virt.as_u64(),
            };
            let pa = arena.alloc_tag(platform, TAG_VIDEO, record.header.size)?;
            write_record(platform, pa, &record);
        }
    }
    Ok(())
}

/// Emit one OPTION record per declared option, carrying its current value.
fn emit_option_tags<P: Platform + PhysMapper>(
    platform: &P,
    arena: &mut TagArena,
    itags: &crate::itags::ItagRegistry,
    env: &crate::env::Environment,
) -> Result<(), LoadError> {
    use crate::env::Value;

    for option in itags.options() {
        let value = env
            .lookup(&option.name)
            .ok_or_else(|| LoadError::OptionMissing {
                name: option.name.clone(),
            })?;

        let value_bytes: Vec<u8> = match value {
            Value::Boolean(b) => alloc::vec![u8::from(*b)],
            Value::String(s) => {
                let mut bytes = Vec::with_capacity(s.len() + 1);
                bytes.extend_from_slice(s.as_bytes());
                bytes.push(0);
                bytes
            }
            Value::Integer(i) => i.to_le_bytes().to_vec(),
        };

        let name_size = option.name.len() as u32 + 1;
        let value_size = value_bytes.len() as u32;
        let size = TagOption::NAME_OFFSET + round8(name_size) + value_size;

        let record = TagOption {
            header: TagHeader {
                tag_type: TAG_OPTION,
                size,
            },
            option_type: option.option_type,
            name_size,
            value_size,
        };
        let pa = arena.alloc_tag(platform, TAG_OPTION, size)?;
        write_record(platform, pa, &record);
        write_cstr(platform, pa + u64::from(TagOption::NAME_OFFSET), &option.name);
        write_bytes(
            platform,
            pa + u64::from(TagOption::NAME_OFFSET + round8(name_size)),
            &value_bytes,
        );
    }
    Ok(())
}

/// Emit the BOOTDEV record: the resolved `root_device` option if there was
/// one, otherwise the device the kernel was read from.
fn emit_bootdev_tag<P: Platform + PhysMapper>(
    platform: &P,
    arena: &mut TagArena,
    root_device: Option<BootDevice>,
) -> Result<(), LoadError> {
    let device = root_device.unwrap_or_else(|| platform.boot_device());

    match device {
        BootDevice::Filesystem { uuid } => {
            let mut uuid_bytes = [0u8; 64];
            let len = uuid.len().min(63);
            uuid_bytes[..len].copy_from_slice(&uuid.as_bytes()[..len]);
            let record = TagBootDeviceFs {
                header: TagHeader {
                    tag_type: TAG_BOOTDEV,
                    size: size_of::<TagBootDeviceFs>() as u32,
                },
                device_type: BOOTDEV_FS,
                flags: 0,
                uuid: uuid_bytes,
            };
            let pa = arena.alloc_tag(platform, TAG_BOOTDEV, record.header.size)?;
            write_record(platform, pa, &record);
        }
        BootDevice::Network(net) => {
            let record = TagBootDeviceNet {
                header: TagHeader {
                    tag_type: TAG_BOOTDEV,
                    size: size_of::<TagBootDeviceNet>() as u32,
                },
                device_type: BOOTDEV_NET,
                flags: net.flags,
                server_port: net.server_port,
                hw_type: net.hw_type,
                hw_addr_size: net.hw_addr_size,
                server_ip: net.server_ip,
                gateway_ip: net.gateway_ip,
                client_ip: net.client_ip,
                client_mac: net.client_mac,
            };
            let pa = arena.alloc_tag(platform, TAG_BOOTDEV, record.header.size)?;
            write_record(platform, pa, &record);
        }
        BootDevice::Other(spec) => {
            let str_len = spec.len() as u32 + 1;
            let size = TagBootDeviceOther::STR_OFFSET + str_len;
            let record = TagBootDeviceOther {
                header: TagHeader {
                    tag_type: TAG_BOOTDEV,
                    size,
                },
                device_type: BOOTDEV_OTHER,
                str_len,
            };
            let pa = arena.alloc_tag(platform, TAG_BOOTDEV, size)?;
            write_record(platform, pa, &record);
            write_cstr(
                platform,
                pa + u64::from(TagBootDeviceOther::STR_OFFSET),
                &spec,
            );
        }
        BootDevice::None => {
            let record = TagBootDeviceNone {
                header: TagHeader {
                    tag_type: TAG_BOOTDEV,
                    size: size_of::<TagBootDeviceNone>() as u32,
                },
                device_type: BOOTDEV_NONE,
            };
            let pa = arena.alloc_tag(platform, TAG_BOOTDEV, record.header.size)?;
            write_record(platform, pa, &record);
        }
    }
    Ok(())
}

/// Map a loader range type to its wire value.
const fn memory_tag_type(range_type: MemoryType) -> u8 {
    match range_type {
        MemoryType::Free => MEMORY_FREE,
        MemoryType::Allocated => MEMORY_ALLOCATED,
        // INTERNAL never survives finalization.
        MemoryType::Reclaimable | MemoryType::Internal => MEMORY_RECLAIMABLE,
        MemoryType::Pagetables => MEMORY_PAGETABLES,
        MemoryType::Stack => MEMORY_STACK,
        MemoryType::Modules => MEMORY_MODULES,
        MemoryType::Reserved => MEMORY_RESERVED,
    }
}

/// Write a NUL-terminated string to physical memory.
fn write_cstr<P: PhysMapper>(platform: &P, pa: PhysicalAddress, s: &str) {
    write_bytes(platform, pa, s.as_bytes());
    write_bytes(platform, pa + s.len() as u64, &[0]);
}
