//! `PT_NOTE` iteration.
//!
//! A note segment is a sequence of `(n_namesz, n_descsz, n_type)` headers,
//! each followed by the name and the description, both padded to 4-byte
//! alignment. The walk stops early when the callback returns `false`; the
//! callback is expected to record why.

use crate::parser::{ElfImage, ProgramHeader};
use crate::{ElfError, PT_NOTE};
use alloc::vec;
use core::ptr::read_unaligned;
use initium_platform::FileHandle;

#[repr(C)]
#[derive(Clone, Copy)]
struct NoteHeader {
    n_namesz: u32,
    n_descsz: u32,
    n_type: u32,
}

/// One note as yielded to the callback.
#[derive(Debug, Clone, Copy)]
pub struct Note<'a> {
    /// Note name with the trailing NUL stripped.
    pub name: &'a str,
    pub note_type: u32,
    pub desc: &'a [u8],
}

/// Walk every note in every `PT_NOTE` segment, in file order.
pub fn iterate_notes(
    handle: &mut dyn FileHandle,
    _img: &ElfImage,
    phdrs: &[ProgramHeader],
    cb: &mut dyn FnMut(&Note<'_>) -> bool,
) -> Result<(), ElfError> {
    for phdr in phdrs.iter().filter(|p| p.p_type == PT_NOTE) {
        let size = usize::try_from(phdr.p_filesz).map_err(|_| ElfError::Malformed)?;
        let end = phdr
            .p_offset
            .checked_add(phdr.p_filesz)
            .ok_or(ElfError::Malformed)?;
        if end > handle.size() {
            return Err(ElfError::Malformed);
        }

        let mut segment = vec![0u8; size];
        if size > 0 {
            handle.read_at(&mut segment, phdr.p_offset)?;
        }

        let mut offset = 0usize;
        while offset + size_of::<NoteHeader>() <= segment.len() {
            // SAFETY: bounds checked just above.
            let header =
                unsafe { read_unaligned(segment.as_ptr().add(offset).cast::<NoteHeader>()) };
            offset += size_of::<NoteHeader>();

            let namesz = usize::try_from(header.n_namesz).map_err(|_| ElfError::Malformed)?;
            let descsz = usize::try_from(header.n_descsz).map_err(|_| ElfError::Malformed)?;
            let name_end = offset.checked_add(namesz).ok_or(ElfError::Malformed)?;
            let desc_start = round4(name_end).ok_or(ElfError::Malformed)?;
            let desc_end = desc_start.checked_add(descsz).ok_or(ElfError::Malformed)?;
            if desc_end > segment.len() {
                return Err(ElfError::Malformed);
            }

            // Strip the NUL terminator included in n_namesz.
            let raw_name = &segment[offset..name_end];
            let name = raw_name.split(|&b| b == 0).next().unwrap_or(&[]);
            let name = core::str::from_utf8(name).map_err(|_| ElfError::Malformed)?;

            let note = Note {
                name,
                note_type: header.n_type,
                desc: &segment[desc_start..desc_end],
            };
            if !cb(&note) {
                return Ok(());
            }

            offset = round4(desc_end).ok_or(ElfError::Malformed)?;
        }
    }
    Ok(())
}

const fn round4(x: usize) -> Option<usize> {
    match x.checked_add(3) {
        Some(v) => Some(v & !3),
        None => None,
    }
}
