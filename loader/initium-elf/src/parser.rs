//! Header identification and normalization.

use crate::ElfError;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::read_unaligned;
use initium_platform::FileHandle;

const EI_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EM_386: u16 = 3;
const EM_X86_64: u16 = 62;

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf32Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf32Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf32Shdr {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u32,
    sh_addr: u32,
    sh_offset: u32,
    sh_size: u32,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u32,
    sh_entsize: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Shdr {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u64,
    sh_addr: u64,
    sh_offset: u64,
    sh_size: u64,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u64,
    sh_entsize: u64,
}

/// Word width of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

/// Identified image: the header fields the loader needs, widened to 64 bit.
#[derive(Debug, Clone, Copy)]
pub struct ElfImage {
    pub class: ElfClass,
    pub machine: u16,
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
    pub shoff: u64,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// Normalized program header.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

/// Normalized section header.
#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
}

/// Identify a little-endian x86 ELF image of either class.
///
/// Checks the magic, class/data/version ident bytes, the machine and the
/// program header entry size. Anything else is [`ElfError::UnknownImage`].
pub fn identify(handle: &mut dyn FileHandle) -> Result<ElfImage, ElfError> {
    let mut ident = [0u8; 16];
    if handle.size() < 16 {
        return Err(ElfError::UnknownImage);
    }
    handle.read_at(&mut ident, 0)?;

    if ident[0..4] != EI_MAGIC || ident[5] != ELFDATA2LSB || ident[6] != 1 {
        return Err(ElfError::UnknownImage);
    }

    match ident[4] {
        ELFCLASS32 => {
            let mut buf = [0u8; size_of::<Elf32Ehdr>()];
            if handle.size() < buf.len() as u64 {
                return Err(ElfError::UnknownImage);
            }
            handle.read_at(&mut buf, 0)?;
            // SAFETY: buffer is exactly one header; any bits are valid.
            let ehdr = unsafe { read_unaligned(buf.as_ptr().cast::<Elf32Ehdr>()) };
            if ehdr.e_machine != EM_386 {
                return Err(ElfError::UnknownImage);
            }
            if usize::from(ehdr.e_phentsize) != size_of::<Elf32Phdr>() {
                return Err(ElfError::UnknownImage);
            }
            Ok(ElfImage {
                class: ElfClass::Elf32,
                machine: ehdr.e_machine,
                entry: u64::from(ehdr.e_entry),
                phoff: u64::from(ehdr.e_phoff),
                phentsize: ehdr.e_phentsize,
                phnum: ehdr.e_phnum,
                shoff: u64::from(ehdr.e_shoff),
                shentsize: ehdr.e_shentsize,
                shnum: ehdr.e_shnum,
                shstrndx: ehdr.e_shstrndx,
            })
        }
        ELFCLASS64 => {
            let mut buf = [0u8; size_of::<Elf64Ehdr>()];
            if handle.size() < buf.len() as u64 {
                return Err(ElfError::UnknownImage);
            }
            handle.read_at(&mut buf, 0)?;
            // SAFETY: as above.
            let ehdr = unsafe { read_unaligned(buf.as_ptr().cast::<Elf64Ehdr>()) };
            if ehdr.e_machine != EM_X86_64 {
                return Err(ElfError::UnknownImage);
            }
            if usize::from(ehdr.e_phentsize) != size_of::<Elf64Phdr>() {
                return Err(ElfError::UnknownImage);
            }
            Ok(ElfImage {
                class: ElfClass::Elf64,
                machine: ehdr.e_machine,
                entry: ehdr.e_entry,
                phoff: ehdr.e_phoff,
                phentsize: ehdr.e_phentsize,
                phnum: ehdr.e_phnum,
                shoff: ehdr.e_shoff,
                shentsize: ehdr.e_shentsize,
                shnum: ehdr.e_shnum,
                shstrndx: ehdr.e_shstrndx,
            })
        }
        _ => Err(ElfError::UnknownImage),
    }
}

/// Read and normalize the program header table.
pub fn program_headers(
    handle: &mut dyn FileHandle,
    img: &ElfImage,
) -> Result<Vec<ProgramHeader>, ElfError> {
    let table = read_table(handle, img.phoff, img.phentsize, img.phnum)?;
    let entsize = usize::from(img.phentsize);

    let mut headers = Vec::with_capacity(usize::from(img.phnum));
    for chunk in table.chunks_exact(entsize) {
        headers.push(match img.class {
            ElfClass::Elf32 => {
                // SAFETY: chunk length equals the struct size.
                let ph = unsafe { read_unaligned(chunk.as_ptr().cast::<Elf32Phdr>()) };
                ProgramHeader {
                    p_type: ph.p_type,
                    p_flags: ph.p_flags,
                    p_offset: u64::from(ph.p_offset),
                    p_vaddr: u64::from(ph.p_vaddr),
                    p_paddr: u64::from(ph.p_paddr),
                    p_filesz: u64::from(ph.p_filesz),
                    p_memsz: u64::from(ph.p_memsz),
                    p_align: u64::from(ph.p_align),
                }
            }
            ElfClass::Elf64 => {
                // SAFETY: as above.
                let ph = unsafe { read_unaligned(chunk.as_ptr().cast::<Elf64Phdr>()) };
                ProgramHeader {
                    p_type: ph.p_type,
                    p_flags: ph.p_flags,
                    p_offset: ph.p_offset,
                    p_vaddr: ph.p_vaddr,
                    p_paddr: ph.p_paddr,
                    p_filesz: ph.p_filesz,
                    p_memsz: ph.p_memsz,
                    p_align: ph.p_align,
                }
            }
        });
    }
    Ok(headers)
}

/// Read and normalize the section header table.
pub fn section_headers(
    handle: &mut dyn FileHandle,
    img: &ElfImage,
) -> Result<Vec<SectionHeader>, ElfError> {
    let table = read_section_table(handle, img)?;
    let entsize = usize::from(img.shentsize);

    let mut headers = Vec::with_capacity(usize::from(img.shnum));
    for chunk in table.chunks_exact(entsize) {
        headers.push(match img.class {
            ElfClass::Elf32 => {
                // SAFETY: chunk length equals the struct size.
                let sh = unsafe { read_unaligned(chunk.as_ptr().cast::<Elf32Shdr>()) };
                SectionHeader {
                    sh_name: sh.sh_name,
                    sh_type: sh.sh_type,
                    sh_flags: u64::from(sh.sh_flags),
                    sh_addr: u64::from(sh.sh_addr),
                    sh_offset: u64::from(sh.sh_offset),
                    sh_size: u64::from(sh.sh_size),
                }
            }
            ElfClass::Elf64 => {
                // SAFETY: as above.
                let sh = unsafe { read_unaligned(chunk.as_ptr().cast::<Elf64Shdr>()) };
                SectionHeader {
                    sh_name: sh.sh_name,
                    sh_type: sh.sh_type,
                    sh_flags: sh.sh_flags,
                    sh_addr: sh.sh_addr,
                    sh_offset: sh.sh_offset,
                    sh_size: sh.sh_size,
                }
            }
        });
    }
    Ok(headers)
}

/// Read the raw section header table (the bytes handed to the kernel in the
/// SECTIONS record).
pub fn read_section_table(
    handle: &mut dyn FileHandle,
    img: &ElfImage,
) -> Result<Vec<u8>, ElfError> {
    let expected = match img.class {
        ElfClass::Elf32 => size_of::<Elf32Shdr>(),
        ElfClass::Elf64 => size_of::<Elf64Shdr>(),
    };
    if usize::from(img.shentsize) != expected {
        return Err(ElfError::Malformed);
    }
    read_table(handle, img.shoff, img.shentsize, img.shnum)
}

/// Patch the `sh_addr` field inside one raw section header entry.
pub fn patch_section_addr(class: ElfClass, entry: &mut [u8], addr: u64) -> Result<(), ElfError> {
    match class {
        ElfClass::Elf32 => {
            let field = entry.get_mut(12..16).ok_or(ElfError::Malformed)?;
            let addr = u32::try_from(addr).map_err(|_| ElfError::Malformed)?;
            field.copy_from_slice(&addr.to_le_bytes());
        }
        ElfClass::Elf64 => {
            let field = entry.get_mut(16..24).ok_or(ElfError::Malformed)?;
            field.copy_from_slice(&addr.to_le_bytes());
        }
    }
    Ok(())
}

/// Read a `num * entsize` table at `offset`, bounds-checked.
fn read_table(
    handle: &mut dyn FileHandle,
    offset: u64,
    entsize: u16,
    num: u16,
) -> Result<Vec<u8>, ElfError> {
    let total = usize::from(entsize)
        .checked_mul(usize::from(num))
        .ok_or(ElfError::Malformed)?;
    let end = offset
        .checked_add(total as u64)
        .ok_or(ElfError::Malformed)?;
    if end > handle.size() {
        return Err(ElfError::Malformed);
    }

    let mut table = vec![0u8; total];
    if total > 0 {
        handle.read_at(&mut table, offset)?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PT_LOAD;
    use initium_platform::FsError;

    pub(crate) struct MemFile(pub Vec<u8>);

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

    fn minimal_elf64() -> Vec<u8> {
        let mut image = vec![0u8; 64 + 56];
        image[0..4].copy_from_slice(&EI_MAGIC);
        image[4] = ELFCLASS64;
        image[5] = ELFDATA2LSB;
        image[6] = 1;
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // e_type = EXEC
        image[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        image[24..32].copy_from_slice(&0xffff_ffff_8010_0000u64.to_le_bytes()); // e_entry
        image[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        image[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        image[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

        // One PT_LOAD at file offset 64.
        image[64..68].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[68..72].copy_from_slice(&5u32.to_le_bytes()); // p_flags = R+X
        image[80..88].copy_from_slice(&0xffff_ffff_8010_0000u64.to_le_bytes()); // p_vaddr
        image[104..112].copy_from_slice(&0x1_0000u64.to_le_bytes()); // p_memsz
        image
    }

    #[test]
    fn identifies_elf64() {
        let mut file = MemFile(minimal_elf64());
        let img = identify(&mut file).unwrap();
        assert_eq!(img.class, ElfClass::Elf64);
        assert_eq!(img.entry, 0xffff_ffff_8010_0000);

        let phdrs = program_headers(&mut file, &img).unwrap();
        assert_eq!(phdrs.len(), 1);
        assert_eq!(phdrs[0].p_type, PT_LOAD);
        assert_eq!(phdrs[0].p_memsz, 0x1_0000);
        assert_eq!(phdrs[0].p_flags, 5);
    }

    #[test]
    fn rejects_bad_magic_and_wrong_machine() {
        let mut bad = minimal_elf64();
        bad[0] = 0;
        assert!(matches!(
            identify(&mut MemFile(bad)),
            Err(ElfError::UnknownImage)
        ));

        let mut wrong = minimal_elf64();
        wrong[18..20].copy_from_slice(&40u16.to_le_bytes()); // EM_ARM
        assert!(matches!(
            identify(&mut MemFile(wrong)),
            Err(ElfError::UnknownImage)
        ));
    }

    #[test]
    fn rejects_truncated_phdr_table() {
        let mut img = minimal_elf64();
        img[56..58].copy_from_slice(&4u16.to_le_bytes()); // phnum = 4, table past EOF
        let mut file = MemFile(img);
        let parsed = identify(&mut file).unwrap();
        assert!(matches!(
            program_headers(&mut file, &parsed),
            Err(ElfError::Malformed)
        ));
    }

    #[test]
    fn patches_sh_addr_per_class() {
        let mut e64 = vec![0u8; 64];
        patch_section_addr(ElfClass::Elf64, &mut e64, 0x1234_5678_9abc).unwrap();
        assert_eq!(&e64[16..24], &0x1234_5678_9abcu64.to_le_bytes());

        let mut e32 = vec![0u8; 40];
        patch_section_addr(ElfClass::Elf32, &mut e32, 0x80_0000).unwrap();
        assert_eq!(&e32[12..16], &0x80_0000u32.to_le_bytes());
    }
}
