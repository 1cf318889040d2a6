//! # Initium Kernel Loader
//!
//! The load pipeline of the Initium boot protocol: take a kernel ELF image,
//! read its embedded protocol tags, build the address space it asked for,
//! load its modules, assemble the handoff tag list and switch into it
//! through a trampoline page.
//!
//! The flow has two halves with different failure rules:
//!
//! 1. **Command phase**: [`InitiumLoader::prepare`] binds a
//!    [`LoadRequest`] to a kernel: the image is vetted, image tags are
//!    collected, options are merged into the environment, modules are
//!    opened. Failures here are [`CommandError`]s; the command interpreter
//!    reports them and the dropped loader releases everything it held.
//! 2. **Load phase**: [`InitiumLoader::load`] runs the pipeline. Every
//!    failure is a fatal [`LoadError`]: the caller prints the diagnostic
//!    and halts via the platform. On success the returned
//!    [`Handoff`](trampoline::Handoff) is consumed by
//!    [`trampoline::enter`], which does not return.
//!
//! The surrounding loader (filesystem drivers, device probe, firmware
//! glue) plugs in through the traits in `initium-platform`; nothing in this
//! crate talks to hardware directly except the final mode switch.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod arena;
mod env;
mod error;
mod itags;
mod loader;
mod pipeline;
mod plan;
pub mod trampoline;

pub use arena::{TAGS_SIZE, TagArena};
pub use env::{Environment, Value};
pub use error::{CommandError, LoadError};
pub use itags::{ImageTag, ItagRegistry, OptionTag};
pub use loader::{InitiumLoader, LoadRequest, Module, ModuleSpec};
pub use plan::MappingRecord;
pub use trampoline::{EntryArgs, Handoff};

use initium_platform::Platform;
use initium_vmem::PhysMapper;
use log::error;

/// Load and enter a prepared kernel, halting through the platform on any
/// fatal error. This is the `loader_ops.load` entry point: it never
/// returns.
#[cfg(target_arch = "x86_64")]
pub fn boot<P: Platform + PhysMapper>(loader: InitiumLoader, platform: &mut P) -> ! {
    match loader.load(platform) {
        Ok(handoff) => {
            // SAFETY: the pipeline completed; both address spaces and the
            // trampoline page are fully constructed.
            unsafe { trampoline::enter(&handoff) }
        }
        Err(err) => {
            error!("initium: {err}");
            platform.halt()
        }
    }
}
