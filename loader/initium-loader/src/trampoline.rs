//! The kernel entry trampoline.
//!
//! The loader cannot assume it can identity-map itself into the kernel's
//! address space, since the kernel may have claimed those virtual addresses. The
//! handoff therefore goes through one INTERNAL-typed page:
//!
//! 1. The page is mapped into the kernel's space at an allocator-chosen
//!    virtual address (which cannot collide with the loader: the loader's
//!    extent is reserved in the allocator first).
//! 2. A temporary address space (separate INTERNAL-typed tables)
//!    identity-maps the loader **and** maps the trampoline page at that same
//!    chosen address.
//! 3. The page gets an [`EntryArgs`] block at its base and a small
//!    architecture code blob right after it.
//! 4. [`enter`] switches to the temporary space, establishes the target CPU
//!    mode and jumps to the blob, which is now reachable at its kernel-space
//!    address; the blob installs the kernel's real tables, loads the stack
//!    and jumps to the entry point with the tag-list pointer in the argument
//!    register (RDI/EDI).

use crate::error::LoadError;
use initium_addrs::PhysicalAddress;
use initium_vmem::{Mode, PhysMapper};

/// Arguments for the trampoline blob, at the base of the trampoline page.
/// The blob indexes this by fixed offsets; field order is load-bearing.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EntryArgs {
    /// Root of the temporary address space.
    pub trampoline_cr3: u64,
    /// Virtual address of the trampoline page in both address spaces.
    pub trampoline_virt: u64,
    /// Root of the kernel's address space.
    pub kernel_cr3: u64,
    /// Initial kernel stack pointer (stack base + stack size).
    pub sp: u64,
    /// Kernel entry point.
    pub entry: u64,
    /// Virtual address of the handoff arena.
    pub tags: u64,
}

/// Byte offset of the code blob inside the trampoline page.
pub const CODE_OFFSET: usize = size_of::<EntryArgs>();

/// 64-bit trampoline. Entered in long mode with the temporary address space
/// active and RDI pointing at [`EntryArgs`]:
///
/// ```text
/// mov rax, [rdi + 16]   ; kernel_cr3
/// mov cr3, rax
/// mov rsp, [rdi + 24]   ; sp
/// mov rsi, [rdi + 32]   ; entry
/// mov rdi, [rdi + 40]   ; tags
/// xor ebp, ebp
/// jmp rsi
/// ```
pub static TRAMPOLINE_64: [u8; 23] = [
    0x48, 0x8B, 0x47, 0x10, // mov rax, [rdi + 16]
    0x0F, 0x22, 0xD8, // mov cr3, rax
    0x48, 0x8B, 0x67, 0x18, // mov rsp, [rdi + 24]
    0x48, 0x8B, 0x77, 0x20, // mov rsi, [rdi + 32]
    0x48, 0x8B, 0x7F, 0x28, // mov rdi, [rdi + 40]
    0x31, 0xED, // xor ebp, ebp
    0xFF, 0xE6, // jmp rsi
];

/// 32-bit trampoline. Entered in protected mode with paging on under the
/// temporary address space and EDI pointing at [`EntryArgs`] (only the low
/// halves of the fields are meaningful):
///
/// ```text
/// mov eax, [edi + 16]   ; kernel_cr3
/// mov cr3, eax
/// mov esp, [edi + 24]   ; sp
/// mov esi, [edi + 32]   ; entry
/// mov edi, [edi + 40]   ; tags
/// xor ebp, ebp
/// jmp esi
/// ```
pub static TRAMPOLINE_32: [u8; 19] = [
    0x8B, 0x47, 0x10, // mov eax, [edi + 16]
    0x0F, 0x22, 0xD8, // mov cr3, eax
    0x8B, 0x67, 0x18, // mov esp, [edi + 24]
    0x8B, 0x77, 0x20, // mov esi, [edi + 32]
    0x8B, 0x7F, 0x28, // mov edi, [edi + 40]
    0x31, 0xED, // xor ebp, ebp
    0xFF, 0xE6, // jmp esi
];

/// Everything [`enter`] needs, and everything the tests inspect.
#[derive(Debug, Clone, Copy)]
pub struct Handoff {
    pub mode: Mode,
    pub trampoline_phys: PhysicalAddress,
    pub args: EntryArgs,
}

/// Fill the trampoline page: arguments at the base, code blob after them.
pub fn write_trampoline<M: PhysMapper>(
    mapper: &M,
    trampoline_phys: PhysicalAddress,
    mode: Mode,
    args: &EntryArgs,
) -> Result<(), LoadError> {
    let blob: &[u8] = match mode {
        Mode::Amd64 => &TRAMPOLINE_64,
        Mode::Ia32 | Mode::Ia32Pae => &TRAMPOLINE_32,
    };

    // SAFETY: the trampoline page is a fresh INTERNAL allocation.
    let page = unsafe {
        mapper.phys_to_slice_mut(trampoline_phys, CODE_OFFSET + blob.len())
    };
    let raw_args = unsafe {
        core::slice::from_raw_parts(core::ptr::from_ref(args).cast::<u8>(), size_of::<EntryArgs>())
    };
    page[..CODE_OFFSET].copy_from_slice(raw_args);
    page[CODE_OFFSET..].copy_from_slice(blob);
    Ok(())
}

/// Switch to the temporary address space and run the trampoline. Interrupts
/// are masked and caches flushed here; nothing returns.
///
/// # Safety
///
/// The handoff must describe fully constructed address spaces and a written
/// trampoline page; the machine is past the point of no return.
#[cfg(target_arch = "x86_64")]
pub unsafe fn enter(handoff: &Handoff) -> ! {
    let args = &handoff.args;
    match handoff.mode {
        Mode::Amd64 => {
            // The loader already runs in long mode: install the temporary
            // tables and jump to the identity-present trampoline address.
            unsafe {
                core::arch::asm!(
                    "cli",
                    "wbinvd",
                    "mov cr3, {cr3}",
                    "jmp {code}",
                    cr3 = in(reg) args.trampoline_cr3,
                    code = in(reg) args.trampoline_virt + CODE_OFFSET as u64,
                    in("rdi") args.trampoline_virt,
                    options(noreturn)
                )
            }
        }
        Mode::Ia32 | Mode::Ia32Pae => {
            // Dropping from long mode to protected mode has to run from
            // identity-mapped loader code; the assembly routine below does
            // the demotion and jumps to the trampoline.
            let keep_pae = u64::from(handoff.mode == Mode::Ia32Pae);
            unsafe {
                initium_enter_ia32(
                    args.trampoline_virt,
                    args.trampoline_virt + CODE_OFFSET as u64,
                    args.trampoline_cr3,
                    keep_pae,
                )
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
unsafe extern "C" {
    /// Demote to 32-bit protected mode under the temporary address space and
    /// jump to the trampoline. `args_virt`/`code_virt` must be mapped in the
    /// temporary space below 4 GiB.
    fn initium_enter_ia32(args_virt: u64, code_virt: u64, trampoline_cr3: u64, keep_pae: u64) -> !;
}

// Long mode -> protected mode demotion. Runs from the loader's
// identity-mapped image with interrupts off.
//
// rdi = args virtual address, rsi = trampoline code virtual address,
// rdx = temporary cr3, rcx = nonzero to keep CR4.PAE (PAE kernels).
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".balign 16",
    ".global initium_enter_ia32",
    "initium_enter_ia32:",
    "cli",
    "wbinvd",
    // 32-bit flat code/data segments for the demotion.
    "lgdt [rip + 3f]",
    "mov ax, 0x10",
    "mov ds, ax",
    "mov es, ax",
    "mov ss, ax",
    // Far-return into the 32-bit code segment.
    "lea rax, [rip + 2f]",
    "push 0x08",
    "push rax",
    "retfq",
    ".code32",
    "2:",
    // Paging off.
    "mov eax, cr0",
    "and eax, 0x7fffffff",
    "mov cr0, eax",
    // Leave long mode.
    "mov ebp, ecx",
    "mov ebx, edx",
    "mov ecx, 0xc0000080",
    "rdmsr",
    "and eax, 0xfffffeff",
    "wrmsr",
    // CR4: drop PAE for legacy kernels, keep PSE available for 4 MiB pages.
    "mov eax, cr4",
    "or eax, 0x10",
    "test ebp, ebp",
    "jnz 4f",
    "and eax, 0xffffffdf",
    "4:",
    "mov cr4, eax",
    // Temporary address space and paging back on.
    "mov cr3, ebx",
    "mov eax, cr0",
    "or eax, 0x80000000",
    "mov cr0, eax",
    // Args pointer and jump into the trampoline page.
    "xor ebp, ebp",
    "jmp esi",
    ".code64",
    ".balign 8",
    "5:",
    ".quad 0",
    ".quad 0x00cf9a000000ffff", // 32-bit code, base 0, limit 4G
    ".quad 0x00cf92000000ffff", // 32-bit data, base 0, limit 4G
    "3:",
    ".word 23",
    ".quad 5b",
);
