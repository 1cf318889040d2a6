//! # Initium Boot Protocol
//!
//! Wire-level definitions shared between the loader and Initium kernels.
//!
//! Two record families live here:
//!
//! * **Image tags** ([`itags`]): metadata a kernel embeds in its ELF image
//!   as `PT_NOTE` entries with note name `"Initium"`. They tell the loader
//!   how to place the kernel, which options it understands, which video
//!   modes it accepts and which extra mappings it wants.
//! * **Handoff tags** ([`tags`]): the records the loader packs into the
//!   handoff arena for the kernel to read at startup: the core record,
//!   memory and virtual-memory maps, modules, options, boot device, video
//!   state and the page-table self-map location.
//!
//! All records are little-endian with **packed** fields (no implicit
//! padding); trailing variable-length data (names, strings, section header
//! tables) starts at the next 8-byte boundary after the fixed part. The
//! layouts are pinned by the unit tests below; changing them is an ABI
//! break.

#![cfg_attr(not(test), no_std)]

pub mod itags;
pub mod tags;

/// Note name identifying Initium image tags inside a kernel ELF
/// (`n_namesz` covers the trailing NUL, so 8 bytes on the wire).
pub const NOTE_NAME: &str = "Initium";

/// Protocol version the loader implements. A kernel's IMAGE tag must match
/// exactly.
pub const VERSION: u32 = 1;

/// Round `x` up to the next multiple of 8, the alignment of every record in
/// the handoff arena and of trailing payload fields.
#[inline]
#[must_use]
pub const fn round8(x: u32) -> u32 {
    (x + 7) & !7
}

/// Marker for plain wire records that may be viewed as raw bytes.
///
/// # Safety
///
/// Implement only for `#[repr(C, packed)]` types composed of integer fields
/// and byte arrays: no padding, no niches, any bit pattern valid.
pub unsafe trait WireRecord: Copy {}

/// Borrow a wire record as its byte representation.
#[must_use]
pub fn bytes_of<T: WireRecord>(v: &T) -> &[u8] {
    // SAFETY: WireRecord guarantees a padding-free packed layout.
    unsafe { core::slice::from_raw_parts(core::ptr::from_ref(v).cast::<u8>(), size_of::<T>()) }
}

/// Read a wire record from the front of `bytes`, or `None` if the buffer is
/// too short.
#[must_use]
pub fn read_record<T: WireRecord>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < size_of::<T>() {
        return None;
    }
    // SAFETY: length checked; read_unaligned tolerates any source alignment
    // and WireRecord admits every bit pattern.
    Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}
