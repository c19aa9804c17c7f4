// SPDX-License-Identifier: Apache-2.0

//! The host exports module shared objects link against.
//!
//! Every symbol here reaches the executing sandbox through the thread-local
//! current pointer in O(1), which is the whole reason that pointer exists.
//! The surface is deliberately narrow: linear-memory and globals accessors,
//! the trap entry, a stdin/stdout view of the request/response bodies,
//! scratch storage, and the cycle counter. The full WASI preview-1 surface is
//! an external collaborator, not part of this runtime's core.
//!
//! Shims run on the sandbox's stack in guest context. The only ones that do
//! not return are `wasm_trap_raise` and `proc_exit`, which leave through the
//! worker's trap exit.

use crate::current::current_ptr;
use crate::sandbox::Sandbox;
use crate::{runtime, worker};
use sledge_rt_wasm::WASM_PAGE_SIZE;
use sledge_rt_wasm::trap::Trap;

fn with_current<R>(f: impl FnOnce(&Sandbox) -> R) -> R {
    let ptr = current_ptr();
    assert!(!ptr.is_null(), "ABI shim called outside sandbox context");
    // SAFETY: the owning slot keeps the current sandbox alive while set, and
    // shims only run while the sandbox is current.
    f(unsafe { &*ptr })
}

fn trap(trap: Trap) -> ! {
    worker::trap_out(trap)
}

/// Grows linear memory by `pages`. Returns the old size in pages, or -1 when
/// the module's declared maximum is exceeded (the size is unchanged).
#[no_mangle]
pub extern "C" fn sledge_abi__wasm_memory_expand(pages: u32) -> i32 {
    with_current(|sandbox| {
        // SAFETY: sandbox context owns the body.
        let body = unsafe { sandbox.body_mut() };
        let Some(memory) = body.memory.as_mut() else {
            trap(Trap::OutOfBoundsLinearMemory);
        };
        match memory.expand(pages as usize * WASM_PAGE_SIZE) {
            Ok(old_bytes) => (old_bytes / WASM_PAGE_SIZE) as i32,
            Err(_) => -1,
        }
    })
}

/// Current linear-memory size in pages.
#[no_mangle]
pub extern "C" fn sledge_abi__wasm_memory_size() -> u32 {
    with_current(|sandbox| {
        // SAFETY: sandbox context owns the body.
        let body = unsafe { sandbox.body_mut() };
        body.memory.as_ref().map_or(0, |m| m.page_count())
    })
}

/// Base address of linear memory, stable for the sandbox's lifetime.
#[no_mangle]
pub extern "C" fn sledge_abi__wasm_memory_base() -> *mut u8 {
    with_current(|sandbox| {
        // SAFETY: sandbox context owns the body.
        let body = unsafe { sandbox.body_mut() };
        body.memory
            .as_ref()
            .map_or(std::ptr::null_mut(), |m| m.base_ptr())
    })
}

/// Copies a data segment into linear memory; out of bounds traps.
#[no_mangle]
pub extern "C" fn sledge_abi__wasm_memory_initialize_region(
    offset: u32,
    len: u32,
    src: *const u8,
) {
    with_current(|sandbox| {
        // SAFETY: sandbox context owns the body; src/len come from the
        // module image's data segments per the ABI contract.
        let body = unsafe { sandbox.body_mut() };
        let segment = unsafe { std::slice::from_raw_parts(src, len as usize) };
        let Some(memory) = body.memory.as_mut() else {
            trap(Trap::OutOfBoundsLinearMemory);
        };
        if memory.initialize_region(offset, segment).is_err() {
            trap(Trap::OutOfBoundsLinearMemory);
        }
    });
}

/// Raises a guest trap; never returns.
#[no_mangle]
pub extern "C" fn sledge_abi__wasm_trap_raise(trapno: u32) -> ! {
    let decoded = Trap::from_raw(trapno).unwrap_or(Trap::IllegalArithmetic);
    trap(decoded)
}

/// Reads an i32 global; a bad index or type traps.
#[no_mangle]
pub extern "C" fn sledge_abi__wasm_globals_get_i32(idx: u32) -> i32 {
    with_current(|sandbox| {
        // SAFETY: sandbox context owns the body.
        let body = unsafe { sandbox.body_mut() };
        match body.globals.get_i32(idx) {
            Ok(v) => v,
            Err(t) => trap(t),
        }
    })
}

/// Reads an i64 global; a bad index or type traps.
#[no_mangle]
pub extern "C" fn sledge_abi__wasm_globals_get_i64(idx: u32) -> i64 {
    with_current(|sandbox| {
        // SAFETY: sandbox context owns the body.
        let body = unsafe { sandbox.body_mut() };
        match body.globals.get_i64(idx) {
            Ok(v) => v,
            Err(t) => trap(t),
        }
    })
}

/// Writes an i32 global; a bad index or type traps.
#[no_mangle]
pub extern "C" fn sledge_abi__wasm_globals_set_i32(idx: u32, value: i32) {
    with_current(|sandbox| {
        // SAFETY: sandbox context owns the body.
        let body = unsafe { sandbox.body_mut() };
        if let Err(t) = body.globals.set_i32(idx, value) {
            trap(t);
        }
    });
}

/// Writes an i64 global; a bad index or type traps.
#[no_mangle]
pub extern "C" fn sledge_abi__wasm_globals_set_i64(idx: u32, value: i64) {
    with_current(|sandbox| {
        // SAFETY: sandbox context owns the body.
        let body = unsafe { sandbox.body_mut() };
        if let Err(t) = body.globals.set_i64(idx, value) {
            trap(t);
        }
    });
}

/// Writes guest bytes to a descriptor. Descriptor 1 (and 2) append to the
/// response body up to the route cap. Returns bytes consumed or a negative
/// errno.
#[no_mangle]
pub extern "C" fn sledge_abi__fd_write(fd: i32, buf_offset: u32, len: u32) -> i32 {
    if fd != 1 && fd != 2 {
        return -libc::EBADF;
    }
    with_current(|sandbox| {
        // SAFETY: sandbox context owns the body.
        let body = unsafe { sandbox.body_mut() };
        let Some(memory) = body.memory.as_ref() else {
            trap(Trap::OutOfBoundsLinearMemory);
        };
        let Ok(bytes) = memory.slice(buf_offset, len as usize) else {
            trap(Trap::OutOfBoundsLinearMemory);
        };
        let cap = sandbox.route.config.max_response_size;
        let room = cap.saturating_sub(body.response_body.len());
        let take = bytes.len().min(room);
        let bytes = bytes.to_vec();
        body.response_body.extend_from_slice(&bytes[..take]);
        take as i32
    })
}

/// Reads request-body bytes into guest memory from descriptor 0. Returns
/// bytes read (0 at end of body) or a negative errno.
#[no_mangle]
pub extern "C" fn sledge_abi__fd_read(fd: i32, buf_offset: u32, len: u32) -> i32 {
    if fd != 0 {
        return -libc::EBADF;
    }
    with_current(|sandbox| {
        // SAFETY: sandbox context owns the body.
        let body = unsafe { sandbox.body_mut() };
        let request: Vec<u8> = body
            .session
            .as_ref()
            .map(|s| s.request_body().to_vec())
            .unwrap_or_default();
        let cursor = body.request_cursor.min(request.len());
        let take = (request.len() - cursor).min(len as usize);
        let chunk = &request[cursor..cursor + take];
        let Some(memory) = body.memory.as_mut() else {
            trap(Trap::OutOfBoundsLinearMemory);
        };
        let Ok(dst) = memory.slice_mut(buf_offset, take) else {
            trap(Trap::OutOfBoundsLinearMemory);
        };
        dst.copy_from_slice(chunk);
        body.request_cursor = cursor + take;
        take as i32
    })
}

/// Terminates the guest. Exit code 0 completes the response; anything else
/// is reported as a failure. Never returns.
#[no_mangle]
pub extern "C" fn sledge_abi__proc_exit(code: i32) -> ! {
    with_current(|sandbox| {
        // SAFETY: sandbox context owns the body.
        unsafe { sandbox.body_mut() }.return_value = code;
    });
    trap(Trap::Exit)
}

/// Fills guest memory with random bytes. Returns 0 or a negative errno.
#[no_mangle]
pub extern "C" fn sledge_abi__random_get(buf_offset: u32, len: u32) -> i32 {
    with_current(|sandbox| {
        // SAFETY: sandbox context owns the body.
        let body = unsafe { sandbox.body_mut() };
        let Some(memory) = body.memory.as_mut() else {
            trap(Trap::OutOfBoundsLinearMemory);
        };
        let Ok(dst) = memory.slice_mut(buf_offset, len as usize) else {
            trap(Trap::OutOfBoundsLinearMemory);
        };
        // SAFETY: dst is a valid writable buffer of the given length.
        let written =
            unsafe { libc::getrandom(dst.as_mut_ptr().cast(), dst.len(), 0) };
        if written < 0 { -libc::EIO } else { 0 }
    })
}

/// The cycle counter guests use for self-timing.
#[no_mangle]
pub extern "C" fn sledge_abi__cycles() -> u64 {
    sledge_rt_arch::cycles()
}

/// Monotonic wall clock in nanoseconds.
#[no_mangle]
pub extern "C" fn sledge_abi__clock_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: plain syscall with a valid out-parameter.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn scratch_key(sandbox: &Sandbox, key_offset: u32, key_len: u32) -> Vec<u8> {
    // SAFETY: sandbox context owns the body.
    let body = unsafe { sandbox.body_mut() };
    let Some(memory) = body.memory.as_ref() else {
        trap(Trap::OutOfBoundsLinearMemory);
    };
    match memory.slice(key_offset, key_len as usize) {
        Ok(key) => key.to_vec(),
        Err(_) => trap(Trap::OutOfBoundsLinearMemory),
    }
}

/// Copies the scratch value for a key into guest memory. Returns the value
/// length, or -1 when absent or the buffer is too small.
#[no_mangle]
pub extern "C" fn sledge_abi__scratch_get(
    key_offset: u32,
    key_len: u32,
    buf_offset: u32,
    buf_len: u32,
) -> i32 {
    with_current(|sandbox| {
        let key = scratch_key(sandbox, key_offset, key_len);
        let Some(value) = runtime::get().scratch.get(&key) else {
            return -1;
        };
        if value.len() > buf_len as usize {
            return -1;
        }
        // SAFETY: sandbox context owns the body.
        let body = unsafe { sandbox.body_mut() };
        let Some(memory) = body.memory.as_mut() else {
            trap(Trap::OutOfBoundsLinearMemory);
        };
        match memory.slice_mut(buf_offset, value.len()) {
            Ok(dst) => {
                dst.copy_from_slice(&value);
                value.len() as i32
            }
            Err(_) => trap(Trap::OutOfBoundsLinearMemory),
        }
    })
}

/// Inserts a scratch value only when the key is vacant. Returns 0 on
/// success, -1 when the key already exists.
#[no_mangle]
pub extern "C" fn sledge_abi__scratch_set(
    key_offset: u32,
    key_len: u32,
    value_offset: u32,
    value_len: u32,
) -> i32 {
    with_current(|sandbox| {
        let key = scratch_key(sandbox, key_offset, key_len);
        let value = scratch_key(sandbox, value_offset, value_len);
        if runtime::get().scratch.set(&key, &value) {
            0
        } else {
            -1
        }
    })
}

/// Inserts or replaces a scratch value.
#[no_mangle]
pub extern "C" fn sledge_abi__scratch_upsert(
    key_offset: u32,
    key_len: u32,
    value_offset: u32,
    value_len: u32,
) {
    with_current(|sandbox| {
        let key = scratch_key(sandbox, key_offset, key_len);
        let value = scratch_key(sandbox, value_offset, value_len);
        runtime::get().scratch.upsert(&key, &value);
    });
}

/// Deletes a scratch key. Returns 0 on success, -1 when absent.
#[no_mangle]
pub extern "C" fn sledge_abi__scratch_delete(key_offset: u32, key_len: u32) -> i32 {
    with_current(|sandbox| {
        let key = scratch_key(sandbox, key_offset, key_len);
        if runtime::get().scratch.delete(&key) { 0 } else { -1 }
    })
}
