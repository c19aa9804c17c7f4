// SPDX-License-Identifier: Apache-2.0

//! Loads module shared objects and resolves their ABI exports.
//!
//! No loader crate is involved: the runtime needs exactly `dlopen`, six
//! `dlsym` lookups, and `dlclose`, so those are wrapped once here. The
//! returned [`ModuleImage`] is shared read-only across every sandbox of the
//! route and unloaded when the last reference drops.

use crate::abi::{AbiSymbols, symbol};
use crate::error::Error;
use std::ffi::{CStr, CString, c_void};

/// A loaded module shared object.
pub struct ModuleImage {
    handle: *mut c_void,
    path: String,
    symbols: AbiSymbols,
}

// SAFETY: the image's code and data symbols are immutable after load; the
// handle is only used again at drop, which happens on one thread.
unsafe impl Send for ModuleImage {}
unsafe impl Sync for ModuleImage {}

fn dlerror_string() -> String {
    // SAFETY: dlerror returns a thread-local C string or null.
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown dlerror".to_owned()
    } else {
        // SAFETY: non-null dlerror result is a valid C string.
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

impl ModuleImage {
    /// Loads the shared object at `path` and resolves the fixed ABI exports.
    pub fn open(path: &str) -> Result<Self, Error> {
        let c_path = CString::new(path).map_err(|_| Error::ModuleLoad {
            path: path.to_owned(),
            detail: "path contains an interior NUL".to_owned(),
        })?;
        // SAFETY: c_path is a valid C string; flags are a valid combination.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(Error::ModuleLoad {
                path: path.to_owned(),
                detail: dlerror_string(),
            });
        }

        let lookup = |name: &'static str| -> Result<*mut c_void, Error> {
            let c_name = CString::new(name).expect("symbol names are static and NUL-free");
            // SAFETY: live handle, valid C string.
            let sym = unsafe { libc::dlsym(handle, c_name.as_ptr()) };
            if sym.is_null() {
                Err(Error::MissingSymbol {
                    path: path.to_owned(),
                    symbol: name,
                })
            } else {
                Ok(sym)
            }
        };

        let resolve = || -> Result<AbiSymbols, Error> {
            // SAFETY: the ABI contract fixes these symbols' types; a module
            // that lies about them is undefined the same way a C callee
            // with a wrong prototype is.
            unsafe {
                Ok(AbiSymbols {
                    init_globals: std::mem::transmute::<*mut c_void, crate::abi::InitGlobalsFn>(
                        lookup(symbol::INIT_GLOBALS)?,
                    ),
                    init_mem: std::mem::transmute::<*mut c_void, crate::abi::InitMemFn>(lookup(
                        symbol::INIT_MEM,
                    )?),
                    init_tbl: std::mem::transmute::<*mut c_void, crate::abi::InitTblFn>(lookup(
                        symbol::INIT_TBL,
                    )?),
                    entrypoint: std::mem::transmute::<*mut c_void, crate::abi::EntrypointFn>(
                        lookup(symbol::ENTRYPOINT)?,
                    ),
                    starting_pages: *lookup(symbol::STARTING_PAGES)?.cast::<u32>(),
                    max_pages: *lookup(symbol::MAX_PAGES)?.cast::<u32>(),
                })
            }
        };

        match resolve() {
            Ok(symbols) => Ok(Self {
                handle,
                path: path.to_owned(),
                symbols,
            }),
            Err(e) => {
                // SAFETY: handle came from dlopen above.
                let _ = unsafe { libc::dlclose(handle) };
                Err(e)
            }
        }
    }

    /// The resolved export set.
    #[must_use]
    pub fn symbols(&self) -> &AbiSymbols {
        &self.symbols
    }

    /// Path the image was loaded from.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for ModuleImage {
    fn drop(&mut self) {
        // SAFETY: handle came from dlopen and is closed exactly once.
        if unsafe { libc::dlclose(self.handle) } != 0 {
            // A module that cannot be unloaded leaves dangling code pages
            // that future sandboxes could still be scheduled onto.
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reports_dlerror() {
        let err = ModuleImage::open("/nonexistent/libmodule.so").expect_err("no such file");
        match err {
            Error::ModuleLoad { path, detail } => {
                assert_eq!(path, "/nonexistent/libmodule.so");
                assert!(!detail.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn shared_object_without_the_abi_is_rejected() {
        // libm is everywhere and certainly does not export `init_globals`.
        for candidate in ["libm.so.6", "libm.so"] {
            match ModuleImage::open(candidate) {
                Err(Error::MissingSymbol { symbol, .. }) => {
                    assert_eq!(symbol, symbol::INIT_GLOBALS);
                    return;
                }
                Err(Error::ModuleLoad { .. }) => continue,
                Ok(_) => panic!("libm should not satisfy the module ABI"),
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        // Neither name loaded; acceptable on exotic systems.
    }
}
