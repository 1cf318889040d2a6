//! Simulated machine for end-to-end pipeline tests: RAM-backed physical
//! mapper, in-memory filesystem, an ELF image builder and a tag-list
//! reader.

#![allow(dead_code)]

use initium_addrs::{PhysicalAddress, VirtualAddress};
use initium_platform::{
    BootDevice, DirEntry, FileHandle, FileSystem, FsError, MemoryRegion, Platform, VideoMode,
};
use initium_vmem::{MmuContext, PhysMapper};
use std::collections::BTreeMap;

pub const MIB: u64 = 1024 * 1024;
pub const RAM_SIZE: u64 = 128 * MIB;
pub const LOADER_BASE: u64 = 1 * MIB;
pub const LOADER_SIZE: u64 = 1 * MIB;

/// A 128 MiB test machine with an identity view of its RAM.
pub struct SimPlatform {
    ram: Vec<u8>,
    pub long_mode: bool,
    pub boot_device: BootDevice,
    pub video: Option<VideoMode>,
    pub exited: bool,
    pub prebooted: bool,
    /// Override for the initial memory map (start, size) pairs.
    pub usable: Vec<(u64, u64)>,
    /// Regions the firmware releases at exit-boot-services time.
    pub released: Vec<(u64, u64)>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            ram: vec![0u8; RAM_SIZE as usize],
            long_mode: true,
            boot_device: BootDevice::Filesystem {
                uuid: "1234-ABCD".into(),
            },
            video: None,
            exited: false,
            prebooted: false,
            usable: vec![(0, RAM_SIZE)],
            released: Vec::new(),
        }
    }

    pub fn ram(&self, phys: u64, len: usize) -> &[u8] {
        &self.ram[phys as usize..phys as usize + len]
    }
}

impl PhysMapper for SimPlatform {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let off = pa.as_u64() as usize;
        assert!(off + size_of::<T>() <= self.ram.len(), "access outside RAM");
        unsafe { &mut *self.ram.as_ptr().cast_mut().add(off).cast::<T>() }
    }

    unsafe fn phys_to_slice_mut<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
        let off = pa.as_u64() as usize;
        assert!(off + len <= self.ram.len(), "access outside RAM");
        unsafe { std::slice::from_raw_parts_mut(self.ram.as_ptr().cast_mut().add(off), len) }
    }
}

impl Platform for SimPlatform {
    fn memory_map(&self) -> Vec<MemoryRegion> {
        self.usable
            .iter()
            .map(|&(start, size)| MemoryRegion {
                start: PhysicalAddress::new(start),
                size,
                usable: true,
            })
            .collect()
    }

    fn loader_extent(&self) -> (PhysicalAddress, u64) {
        (PhysicalAddress::new(LOADER_BASE), LOADER_SIZE)
    }

    fn cpu_supports_long_mode(&self) -> bool {
        self.long_mode
    }

    fn lookup_device(&self, name: &str) -> Option<BootDevice> {
        (name == "(hd0)").then(|| BootDevice::Filesystem {
            uuid: "1234-ABCD".into(),
        })
    }

    fn boot_device(&self) -> BootDevice {
        self.boot_device.clone()
    }

    fn find_video_mode(&self, _types: u32, _width: u32, _height: u32, _bpp: u8) -> Option<VideoMode> {
        self.video
    }

    fn exit_boot_services(&mut self) -> Vec<MemoryRegion> {
        self.exited = true;
        self.released
            .iter()
            .map(|&(start, size)| MemoryRegion {
                start: PhysicalAddress::new(start),
                size,
                usable: true,
            })
            .collect()
    }

    fn preboot(&mut self) {
        self.prebooted = true;
    }

    fn halt(&self) -> ! {
        panic!("platform halt");
    }
}

/// In-memory filesystem keyed by path.
pub struct MemFs {
    pub files: BTreeMap<String, Vec<u8>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(path.into(), data);
    }
}

struct MemFile(Vec<u8>);

impl FileHandle for MemFile {
    fn size(&self) -> u64 {
        self.0.len() as u64
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), FsError> {
        let offset = usize::try_from(offset).map_err(|_| FsError::ReadFailed)?;
        let end = offset.checked_add(buf.len()).ok_or(FsError::ReadFailed)?;
        if end > self.0.len() {
            return Err(FsError::ReadFailed);
        }
        buf.copy_from_slice(&self.0[offset..end]);
        Ok(())
    }
}

impl FileSystem for MemFs {
    fn open(&mut self, path: &str) -> Result<Box<dyn FileHandle>, FsError> {
        self.files
            .get(path)
            .map(|data| Box::new(MemFile(data.clone())) as Box<dyn FileHandle>)
            .ok_or(FsError::NotFound)
    }

    fn iterate(
        &mut self,
        path: &str,
        cb: &mut dyn FnMut(&DirEntry) -> bool,
    ) -> Result<(), FsError> {
        let prefix = format!("{path}/");
        let mut found = false;
        for name in self.files.keys() {
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            found = true;
            if rest.contains('/') {
                continue;
            }
            let entry = DirEntry {
                name: rest.into(),
                is_directory: false,
            };
            if !cb(&entry) {
                break;
            }
        }
        if found { Ok(()) } else { Err(FsError::NotFound) }
    }
}

/// Builds kernel ELF images with Initium notes.
pub struct ElfBuilder {
    is64: bool,
    entry: u64,
    notes: Vec<u8>,
    segments: Vec<Segment>,
    sections: Vec<Section>,
}

struct Segment {
    vaddr: u64,
    paddr: u64,
    data: Vec<u8>,
    memsz: u64,
    flags: u32,
}

struct Section {
    sh_type: u32,
    sh_flags: u64,
    data: Vec<u8>,
}

impl ElfBuilder {
    pub fn new64() -> Self {
        Self {
            is64: true,
            entry: 0,
            notes: Vec::new(),
            segments: Vec::new(),
            sections: Vec::new(),
        }
    }

    pub fn new32() -> Self {
        Self {
            is64: false,
            ..Self::new64()
        }
    }

    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    pub fn segment(mut self, vaddr: u64, paddr: u64, data: Vec<u8>, memsz: u64) -> Self {
        self.segments.push(Segment {
            vaddr,
            paddr,
            data,
            memsz,
            flags: 0x5,
        });
        self
    }

    /// Append a section (64-bit images only).
    pub fn section(mut self, sh_type: u32, sh_flags: u64, data: Vec<u8>) -> Self {
        self.sections.push(Section {
            sh_type,
            sh_flags,
            data,
        });
        self
    }

    /// Append a raw Initium note.
    pub fn note(mut self, note_type: u32, desc: &[u8]) -> Self {
        let name = b"Initium";
        self.notes
            .extend_from_slice(&(name.len() as u32 + 1).to_le_bytes());
        self.notes.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        self.notes.extend_from_slice(&note_type.to_le_bytes());
        self.notes.extend_from_slice(name);
        self.notes.push(0);
        while self.notes.len() % 4 != 0 {
            self.notes.push(0);
        }
        self.notes.extend_from_slice(desc);
        while self.notes.len() % 4 != 0 {
            self.notes.push(0);
        }
        self
    }

    pub fn image_note(self, version: u32, flags: u32) -> Self {
        let mut desc = Vec::new();
        desc.extend_from_slice(&version.to_le_bytes());
        desc.extend_from_slice(&flags.to_le_bytes());
        self.note(initium_protocol::itags::ITAG_IMAGE, &desc)
    }

    pub fn load_note(
        self,
        flags: u32,
        alignment: u64,
        min_alignment: u64,
        virt_map_base: u64,
        virt_map_size: u64,
    ) -> Self {
        let mut desc = Vec::new();
        desc.extend_from_slice(&flags.to_le_bytes());
        desc.extend_from_slice(&alignment.to_le_bytes());
        desc.extend_from_slice(&min_alignment.to_le_bytes());
        desc.extend_from_slice(&virt_map_base.to_le_bytes());
        desc.extend_from_slice(&virt_map_size.to_le_bytes());
        self.note(initium_protocol::itags::ITAG_LOAD, &desc)
    }

    pub fn option_note(self, option_type: u8, name: &str, desc_text: &str, default: &[u8]) -> Self {
        let mut desc = Vec::new();
        desc.push(option_type);
        desc.extend_from_slice(&(name.len() as u32 + 1).to_le_bytes());
        desc.extend_from_slice(&(desc_text.len() as u32 + 1).to_le_bytes());
        desc.extend_from_slice(name.as_bytes());
        desc.push(0);
        desc.extend_from_slice(desc_text.as_bytes());
        desc.push(0);
        desc.extend_from_slice(default);
        self.note(initium_protocol::itags::ITAG_OPTION, &desc)
    }

    pub fn mapping_note(self, virt: u64, phys: u64, size: u64) -> Self {
        let mut desc = Vec::new();
        desc.extend_from_slice(&virt.to_le_bytes());
        desc.extend_from_slice(&phys.to_le_bytes());
        desc.extend_from_slice(&size.to_le_bytes());
        self.note(initium_protocol::itags::ITAG_MAPPING, &desc)
    }

    pub fn build(self) -> Vec<u8> {
        if self.is64 { self.build64() } else { self.build32() }
    }

    fn build64(self) -> Vec<u8> {
        const EHSIZE: usize = 64;
        const PHENT: usize = 56;
        let phnum = self.segments.len() + usize::from(!self.notes.is_empty());
        let phoff = EHSIZE;
        let data_off = phoff + phnum * PHENT;

        let mut image = vec![0u8; data_off];
        image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // little-endian
        image[6] = 1;
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        image[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        image[24..32].copy_from_slice(&self.entry.to_le_bytes());
        image[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
        image[52..54].copy_from_slice(&(EHSIZE as u16).to_le_bytes());
        image[54..56].copy_from_slice(&(PHENT as u16).to_le_bytes());
        image[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

        let mut bodies: Vec<u8> = Vec::new();
        let mut ph = Vec::new();
        for seg in &self.segments {
            push_phdr64(
                &mut ph,
                1, // PT_LOAD
                seg.flags,
                (data_off + bodies.len()) as u64,
                seg.vaddr,
                seg.paddr,
                seg.data.len() as u64,
                seg.memsz,
            );
            bodies.extend_from_slice(&seg.data);
        }
        if !self.notes.is_empty() {
            push_phdr64(
                &mut ph,
                4, // PT_NOTE
                0x4,
                (data_off + bodies.len()) as u64,
                0,
                0,
                self.notes.len() as u64,
                self.notes.len() as u64,
            );
            bodies.extend_from_slice(&self.notes);
        }

        image[phoff..phoff + phnum * PHENT].copy_from_slice(&ph);
        image.extend_from_slice(&bodies);

        if !self.sections.is_empty() {
            // Section data, then the header table (with a leading null
            // entry).
            let mut offsets = Vec::new();
            for section in &self.sections {
                offsets.push(image.len() as u64);
                image.extend_from_slice(&section.data);
            }
            let shoff = image.len() as u64;
            image.extend_from_slice(&[0u8; 64]); // SHN_UNDEF
            for (section, offset) in self.sections.iter().zip(&offsets) {
                let mut sh = Vec::with_capacity(64);
                sh.extend_from_slice(&0u32.to_le_bytes()); // sh_name
                sh.extend_from_slice(&section.sh_type.to_le_bytes());
                sh.extend_from_slice(&section.sh_flags.to_le_bytes());
                sh.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
                sh.extend_from_slice(&offset.to_le_bytes());
                sh.extend_from_slice(&(section.data.len() as u64).to_le_bytes());
                sh.extend_from_slice(&0u32.to_le_bytes()); // sh_link
                sh.extend_from_slice(&0u32.to_le_bytes()); // sh_info
                sh.extend_from_slice(&1u64.to_le_bytes()); // sh_addralign
                sh.extend_from_slice(&0u64.to_le_bytes()); // sh_entsize
                image.extend_from_slice(&sh);
            }
            let shnum = self.sections.len() as u16 + 1;
            image[40..48].copy_from_slice(&shoff.to_le_bytes());
            image[58..60].copy_from_slice(&64u16.to_le_bytes());
            image[60..62].copy_from_slice(&shnum.to_le_bytes());
        }
        image
    }

    fn build32(self) -> Vec<u8> {
        const EHSIZE: usize = 52;
        const PHENT: usize = 32;
        let phnum = self.segments.len() + usize::from(!self.notes.is_empty());
        let phoff = EHSIZE;
        let data_off = phoff + phnum * PHENT;

        let mut image = vec![0u8; data_off];
        image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        image[4] = 1; // ELFCLASS32
        image[5] = 1;
        image[6] = 1;
        image[16..18].copy_from_slice(&2u16.to_le_bytes());
        image[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        image[24..28].copy_from_slice(&(self.entry as u32).to_le_bytes());
        image[28..32].copy_from_slice(&(phoff as u32).to_le_bytes());
        image[40..42].copy_from_slice(&(EHSIZE as u16).to_le_bytes());
        image[42..44].copy_from_slice(&(PHENT as u16).to_le_bytes());
        image[44..46].copy_from_slice(&(phnum as u16).to_le_bytes());

        let mut bodies: Vec<u8> = Vec::new();
        let mut ph = Vec::new();
        for seg in &self.segments {
            push_phdr32(
                &mut ph,
                1,
                seg.flags,
                (data_off + bodies.len()) as u32,
                seg.vaddr as u32,
                seg.paddr as u32,
                seg.data.len() as u32,
                seg.memsz as u32,
            );
            bodies.extend_from_slice(&seg.data);
        }
        if !self.notes.is_empty() {
            push_phdr32(
                &mut ph,
                4,
                0x4,
                (data_off + bodies.len()) as u32,
                0,
                0,
                self.notes.len() as u32,
                self.notes.len() as u32,
            );
            bodies.extend_from_slice(&self.notes);
        }

        image[phoff..phoff + phnum * PHENT].copy_from_slice(&ph);
        image.extend_from_slice(&bodies);
        image
    }
}

#[allow(clippy::too_many_arguments)]
fn push_phdr64(
    out: &mut Vec<u8>,
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
) {
    out.extend_from_slice(&p_type.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&paddr.to_le_bytes());
    out.extend_from_slice(&filesz.to_le_bytes());
    out.extend_from_slice(&memsz.to_le_bytes());
    out.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
}

#[allow(clippy::too_many_arguments)]
fn push_phdr32(
    out: &mut Vec<u8>,
    p_type: u32,
    flags: u32,
    offset: u32,
    vaddr: u32,
    paddr: u32,
    filesz: u32,
    memsz: u32,
) {
    out.extend_from_slice(&p_type.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&paddr.to_le_bytes());
    out.extend_from_slice(&filesz.to_le_bytes());
    out.extend_from_slice(&memsz.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&0x1000u32.to_le_bytes()); // p_align
}

/// A parsed handoff record.
#[derive(Debug, Clone)]
pub enum Tag {
    Core {
        tags_phys: u64,
        tags_size: u32,
        kernel_phys: u64,
        stack_base: u64,
        stack_phys: u64,
        stack_size: u32,
    },
    Option {
        option_type: u8,
        name: String,
        value: Vec<u8>,
    },
    Memory {
        start: u64,
        size: u64,
        memory_type: u8,
    },
    Vmem {
        start: u64,
        size: u64,
        phys: u64,
    },
    Pagetables {
        root: u64,
        mapping: u64,
    },
    Module {
        addr: u64,
        size: u64,
        name: String,
    },
    Video,
    BootDevice {
        device_type: u8,
        payload: Vec<u8>,
    },
    Sections {
        num: u32,
        entsize: u32,
        table: Vec<u8>,
    },
    Other(u32),
}

fn le32(b: &[u8]) -> u32 {
    u32::from_le_bytes(b[..4].try_into().unwrap())
}

fn le64(b: &[u8]) -> u64 {
    u64::from_le_bytes(b[..8].try_into().unwrap())
}

fn cstr(b: &[u8]) -> String {
    let raw = b.split(|&x| x == 0).next().unwrap_or(&[]);
    String::from_utf8(raw.to_vec()).unwrap()
}

/// Walk the tag list at `tags_phys` until the NONE terminator. Returns the
/// parsed tags and the terminator's offset from the arena base.
pub fn read_tags(platform: &SimPlatform, tags_phys: u64) -> (Vec<Tag>, u32) {
    let arena = platform.ram(tags_phys, initium_loader::TAGS_SIZE as usize);
    let mut tags = Vec::new();
    let mut offset = 0usize;

    loop {
        let tag_type = le32(&arena[offset..]);
        let size = le32(&arena[offset + 4..]) as usize;
        if tag_type == 0 {
            return (tags, offset as u32);
        }
        let body = &arena[offset..offset + size];

        tags.push(match tag_type {
            1 => Tag::Core {
                tags_phys: le64(&body[8..]),
                tags_size: le32(&body[16..]),
                kernel_phys: le64(&body[20..]),
                stack_base: le64(&body[28..]),
                stack_phys: le64(&body[36..]),
                stack_size: le32(&body[44..]),
            },
            2 => {
                let name_size = le32(&body[9..]) as usize;
                let value_size = le32(&body[13..]) as usize;
                let name = cstr(&body[24..24 + name_size]);
                let value_off = 24 + name_size.div_ceil(8) * 8;
                Tag::Option {
                    option_type: body[8],
                    name,
                    value: body[value_off..value_off + value_size].to_vec(),
                }
            }
            3 => Tag::Memory {
                start: le64(&body[8..]),
                size: le64(&body[16..]),
                memory_type: body[24],
            },
            4 => Tag::Vmem {
                start: le64(&body[8..]),
                size: le64(&body[16..]),
                phys: le64(&body[24..]),
            },
            5 => Tag::Pagetables {
                root: le64(&body[8..]),
                mapping: le64(&body[16..]),
            },
            6 => {
                let name_size = le32(&body[24..]) as usize;
                Tag::Module {
                    addr: le64(&body[8..]),
                    size: le64(&body[16..]),
                    name: cstr(&body[32..32 + name_size]),
                }
            }
            7 => Tag::Video,
            8 => Tag::BootDevice {
                device_type: body[8],
                payload: body[9..].to_vec(),
            },
            9 => Tag::Sections {
                num: le32(&body[8..]),
                entsize: le32(&body[12..]),
                table: body[24..].to_vec(),
            },
            other => Tag::Other(other),
        });

        offset += size.div_ceil(8) * 8;
    }
}

/// Resolve the arena's physical base by walking the kernel's page tables
/// for the tag-list virtual address from the handoff.
pub fn locate_tags(platform: &SimPlatform, handoff: &initium_loader::Handoff) -> u64 {
    let ctx = MmuContext::from_root(
        handoff.mode,
        PhysicalAddress::new(handoff.args.kernel_cr3),
    );
    ctx.virt_to_phys(platform, VirtualAddress::new(handoff.args.tags))
        .expect("tag list is mapped")
        .as_u64()
}

/// Fetch all tags of the boot described by `handoff`.
pub fn read_handoff_tags(
    platform: &SimPlatform,
    handoff: &initium_loader::Handoff,
) -> (Vec<Tag>, u32) {
    read_tags(platform, locate_tags(platform, handoff))
}

/// Kernel modes re-exported for test assertions.
pub use initium_vmem::Mode as KernelMode;

/// Convenience: prepare a loader from `fs` for `path` with default
/// environment and no modules.
pub fn prepare(
    platform: &SimPlatform,
    fs: &mut MemFs,
    path: &str,
) -> Result<initium_loader::InitiumLoader, initium_loader::CommandError> {
    initium_loader::InitiumLoader::prepare(
        platform,
        fs,
        initium_loader::LoadRequest {
            path: path.into(),
            modules: initium_loader::ModuleSpec::None,
            env: initium_loader::Environment::new(),
        },
    )
}
