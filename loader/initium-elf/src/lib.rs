//! # ELF Image Inspection
//!
//! Just enough ELF to load a kernel: identification of 32-/64-bit
//! little-endian x86 images, a normalized view of program and section
//! headers, and a walk over `PT_NOTE` segments (which is how Initium image
//! tags reach the loader).
//!
//! Everything reads through the [`FileHandle`] collaborator at explicit file
//! offsets; segment *placement* and copying are pipeline decisions and
//! happen elsewhere.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod notes;
mod parser;

pub use notes::{Note, iterate_notes};
pub use parser::{
    ElfClass, ElfImage, ProgramHeader, SectionHeader, identify, patch_section_addr,
    program_headers, read_section_table, section_headers,
};

use initium_platform::FsError;

/// Loadable segment.
pub const PT_LOAD: u32 = 1;
/// Note segment.
pub const PT_NOTE: u32 = 4;

/// Section types the section loader cares about.
pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_NOBITS: u32 = 8;

/// Section occupies memory at load time (already covered by PT_LOAD).
pub const SHF_ALLOC: u64 = 0x2;

/// Segment flag bits.
pub const PF_X: u32 = 1 << 0;
pub const PF_W: u32 = 1 << 1;
pub const PF_R: u32 = 1 << 2;

#[derive(Debug, thiserror::Error)]
pub enum ElfError {
    /// The file is not an ELF image this loader can work with.
    #[error("unknown image format")]
    UnknownImage,
    /// Structurally broken: bad offsets, truncated tables, overflowing
    /// arithmetic.
    #[error("malformed ELF image")]
    Malformed,
    #[error("read error: {0}")]
    Io(#[from] FsError),
}
