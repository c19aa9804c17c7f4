// SPDX-License-Identifier: Apache-2.0

//! Guest-side resources for sandboxed WebAssembly modules.
//!
//! Modules arrive as pre-compiled shared objects implementing a fixed ABI
//! ([`abi`]). Each in-flight request gets a [`memory::LinearMemory`] (a 4 GiB
//! virtual reservation grown page-by-page behind the guest's back) and a
//! guard-paged [`stack::WasmStack`] to run on. Guest failures surface as
//! [`trap::Trap`] values.

pub mod abi;
pub mod error;
pub mod globals;
pub mod loader;
pub mod memory;
pub mod stack;
pub mod trap;

/// Size of one WebAssembly page.
pub const WASM_PAGE_SIZE: usize = 65536;

/// Host page size used for guard pages and mprotect granularity.
#[must_use]
pub fn host_page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 { 4096 } else { sz as usize }
}
