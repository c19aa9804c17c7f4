// SPDX-License-Identifier: Apache-2.0

//! Loaded modules.
//!
//! A module is the immutable half of a sandbox: the dlopen'd code pages, the
//! resolved ABI exports, and the memory limits the image declares. It is
//! shared read-only across every concurrent sandbox of its route through an
//! `Arc`; the image unloads when the last sandbox completes and the tenant
//! table drops its reference.

use crate::error::Error;
use sledge_rt_wasm::WASM_PAGE_SIZE;
use sledge_rt_wasm::abi::AbiSymbols;
use sledge_rt_wasm::loader::ModuleImage;
use std::sync::Arc;

/// Default sandbox stack: half a MiB above the guard page.
pub const DEFAULT_STACK_SIZE: usize = 512 * 1024;

/// Default number of spilled-global slots given to each instance.
pub const DEFAULT_GLOBALS_COUNT: usize = 128;

/// A loadable compiled module plus its exported entrypoints.
pub struct Module {
    name: String,
    image: Option<ModuleImage>,
    starting_pages: u32,
    max_pages: u32,
    stack_size: usize,
}

impl Module {
    /// Loads the shared object at `path` and captures its declared limits.
    pub fn load(name: &str, path: &str) -> Result<Arc<Self>, Error> {
        let image = ModuleImage::open(path)?;
        let starting_pages = image.symbols().starting_pages.max(1);
        let max_pages = image
            .symbols()
            .max_pages
            .clamp(starting_pages, (u32::MAX / WASM_PAGE_SIZE as u32).saturating_add(1));
        Ok(Arc::new(Self {
            name: name.to_owned(),
            image: Some(image),
            starting_pages,
            max_pages,
            stack_size: DEFAULT_STACK_SIZE,
        }))
    }

    /// A module with limits but no native image, for in-process tests of the
    /// scheduling machinery.
    #[cfg(test)]
    pub(crate) fn stub(name: &str, starting_pages: u32, max_pages: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            image: None,
            starting_pages,
            max_pages,
            stack_size: DEFAULT_STACK_SIZE,
        })
    }

    /// Module name, for logs and perf records.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resolved ABI exports; `None` only for stub modules.
    #[must_use]
    pub fn abi(&self) -> Option<&AbiSymbols> {
        self.image.as_ref().map(ModuleImage::symbols)
    }

    /// Bytes of linear memory mapped before the guest's first grow.
    #[must_use]
    pub fn initial_memory_bytes(&self) -> usize {
        self.starting_pages as usize * WASM_PAGE_SIZE
    }

    /// The image's hard cap on linear memory, in bytes.
    #[must_use]
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_pages as usize * WASM_PAGE_SIZE)
            .min(sledge_rt_wasm::memory::LINEAR_MEMORY_MAX)
    }

    /// Stack bytes given to each instance.
    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Spilled-global slots given to each instance.
    #[must_use]
    pub fn globals_count(&self) -> usize {
        DEFAULT_GLOBALS_COUNT
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("starting_pages", &self.starting_pages)
            .field("max_pages", &self.max_pages)
            .finish_non_exhaustive()
    }
}
