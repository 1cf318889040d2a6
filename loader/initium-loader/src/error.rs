//! Error taxonomy of the loader.
//!
//! Two layers, matching who may recover:
//!
//! * [`CommandError`]: command-phase failures. The caller (the command
//!   interpreter) reports them and keeps running; dropping the
//!   half-constructed loader releases every handle and list it owned.
//! * [`LoadError`]: pipeline failures. Once loading has begun these are
//!   fatal: the caller logs the diagnostic and halts the machine through the
//!   platform.

use alloc::string::String;
use initium_elf::ElfError;
use initium_mm::MemoryError;
use initium_platform::FsError;
use initium_vmem::MmuError;

/// Recoverable errors from the command phase.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Error opening '{path}': {source}")]
    Open { path: String, source: FsError },
    #[error("'{path}' is not a supported ELF image")]
    UnknownImage { path: String },
    #[error("Error reading '{path}': {source}")]
    Read { path: String, source: ElfError },
    #[error("'{path}' has unrecognized image tag type {tag_type}")]
    UnrecognizedTag { path: String, tag_type: u32 },
    #[error("'{path}' has undersized tag type {tag_type}")]
    UndersizedTag { path: String, tag_type: u32 },
    #[error("'{path}' has multiple tags of type {tag_type}")]
    DuplicateTag { path: String, tag_type: u32 },
    #[error("'{path}' is not an Initium kernel")]
    NotInitium { path: String },
    #[error("'{path}' has unsupported Initium version {version}")]
    UnsupportedVersion { path: String, version: u32 },
    #[error("'{path}' has invalid option type {option_type} ('{name}')")]
    InvalidOptionType {
        path: String,
        option_type: u8,
        name: String,
    },
    #[error("Invalid value type set for option '{name}'")]
    OptionTypeMismatch { name: String },
    #[error("'root_device' option should be a string")]
    RootDeviceNotString,
    #[error("Root device '{name}' not found")]
    RootDeviceNotFound { name: String },
    #[error("Error opening module '{path}': {source}")]
    ModuleOpen { path: String, source: FsError },
    #[error("Error iterating '{path}': {source}")]
    ModuleIterate { path: String, source: FsError },
}

/// Fatal errors from the load pipeline.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("64-bit kernel requires 64-bit CPU")]
    UnsupportedCpu,
    #[error("Invalid kernel alignment parameters")]
    InvalidAlignmentParams,
    #[error("Invalid kernel virtual map range")]
    InvalidVirtMapParams,
    #[error("{0}")]
    Memory(#[from] MemoryError),
    #[error("Exceeded maximum tag list size")]
    TagListOverflow,
    #[error("Invalid virtual mapping (physical 0x{phys:x})")]
    InvalidMappingPhys { phys: u64 },
    #[error("Invalid virtual mapping (virtual 0x{virt:x})")]
    InvalidMappingVirt { virt: u64 },
    #[error("Insufficient address space available (allocating {size} bytes)")]
    AddressSpaceExhausted { size: u64 },
    #[error("Mapping 0x{virt:x} conflicts with another")]
    MappingConflict { virt: u64 },
    #[error("Mapping 0x{virt:x} outside the virtual map range")]
    MappingOutsideWindow { virt: u64 },
    #[error("Unable to allocate page table mapping space")]
    NoPagetableSlot,
    #[error("Error reading kernel image: {0}")]
    Elf(#[from] ElfError),
    #[error("Error reading module '{name}': {source}")]
    ModuleRead { name: String, source: FsError },
    #[error("Option '{name}' missing from the environment")]
    OptionMissing { name: String },
    #[error("{0}")]
    Mmu(#[from] MmuError),
}
