// SPDX-License-Identifier: Apache-2.0

//! The fixed ABI every module shared object implements.
//!
//! A module exports four functions and two data symbols. The runtime calls
//! the initializers once per sandbox (after installing the sandbox's memory
//! and globals as the current instance) and then `entrypoint` on the
//! sandbox's own stack. Everything the module needs back from the runtime is
//! provided as host exports resolved by the dynamic linker, so the module
//! image itself stays self-contained.

/// `init_globals()`: populates spilled globals.
pub type InitGlobalsFn = unsafe extern "C" fn();
/// `init_mem()`: copies data segments into linear memory.
pub type InitMemFn = unsafe extern "C" fn();
/// `init_tbl()`: populates the indirect call table.
pub type InitTblFn = unsafe extern "C" fn();
/// `entrypoint() -> i32`: the guest main; the return value becomes the
/// sandbox's guest status.
pub type EntrypointFn = unsafe extern "C" fn() -> i32;

/// Names of the required module exports.
pub mod symbol {
    /// Global initializer export.
    pub const INIT_GLOBALS: &str = "init_globals";
    /// Memory initializer export.
    pub const INIT_MEM: &str = "init_mem";
    /// Table initializer export.
    pub const INIT_TBL: &str = "init_tbl";
    /// Guest main export.
    pub const ENTRYPOINT: &str = "entrypoint";
    /// `u32` data symbol: linear memory pages mapped before the first grow.
    pub const STARTING_PAGES: &str = "starting_pages";
    /// `u32` data symbol: hard page limit for this module.
    pub const MAX_PAGES: &str = "max_pages";
}

/// The resolved export set of a loaded module image.
#[derive(Clone, Copy)]
pub struct AbiSymbols {
    /// Resolved `init_globals`.
    pub init_globals: InitGlobalsFn,
    /// Resolved `init_mem`.
    pub init_mem: InitMemFn,
    /// Resolved `init_tbl`.
    pub init_tbl: InitTblFn,
    /// Resolved `entrypoint`.
    pub entrypoint: EntrypointFn,
    /// Value of `starting_pages` at load time.
    pub starting_pages: u32,
    /// Value of `max_pages` at load time.
    pub max_pages: u32,
}

impl std::fmt::Debug for AbiSymbols {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbiSymbols")
            .field("starting_pages", &self.starting_pages)
            .field("max_pages", &self.max_pages)
            .finish_non_exhaustive()
    }
}
