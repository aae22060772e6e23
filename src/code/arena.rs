//! Executable relocation-block arena.
//!
//! Proxy blocks and dispatch stubs live in fixed-size executable blocks
//! indexed by handle. The pool is process-wide and guarded by its own lock,
//! independent of any per-mock state; freed blocks are recycled through a
//! free list rather than unmapped, since executable mappings are a scarce
//! resource in long test runs.

use std::sync::{Mutex, OnceLock};

use crate::code::cache::invalidate_icache;
use crate::types::MockError;

/// One block per allocation: a full page, which comfortably holds any proxy
/// (saved prologue + tail branch) or dispatch stub.
pub const BLOCK_SIZE: usize = 4096;

/// Handle to an arena block. Valid until the block is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle(usize);

#[derive(Debug)]
struct Slot {
    ptr: *mut u8,
    in_use: bool,
}

// Raw executable pages; the arena lock serializes all access.
unsafe impl Send for Slot {}

#[derive(Debug, Default)]
pub struct CodeArena {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl CodeArena {
    pub const fn new() -> CodeArena {
        CodeArena { slots: Vec::new(), free: Vec::new() }
    }

    /// Allocate a writable block, recycling a freed one when possible.
    pub fn alloc(&mut self) -> Result<BlockHandle, MockError> {
        if let Some(idx) = self.free.pop() {
            set_writable(self.slots[idx].ptr)?;
            self.slots[idx].in_use = true;
            return Ok(BlockHandle(idx));
        }

        let ptr = map_block()?;
        self.slots.push(Slot { ptr, in_use: true });
        Ok(BlockHandle(self.slots.len() - 1))
    }

    /// Entry address of a block.
    pub fn entry(&self, h: BlockHandle) -> usize {
        debug_assert!(self.slots[h.0].in_use);
        self.slots[h.0].ptr as usize
    }

    /// Emit into a writable block. `emit` receives the block's buffer and
    /// returns the number of bytes written.
    pub fn write(&mut self, h: BlockHandle, emit: impl FnOnce(&mut [u8]) -> usize) -> usize {
        let slot = &mut self.slots[h.0];
        debug_assert!(slot.in_use);
        let buf = unsafe { std::slice::from_raw_parts_mut(slot.ptr, BLOCK_SIZE) };
        emit(buf)
    }

    /// Flip a block read-execute and synchronize caches.
    pub fn seal(&self, h: BlockHandle) -> Result<(), MockError> {
        let slot = &self.slots[h.0];
        debug_assert!(slot.in_use);
        set_executable(slot.ptr)?;
        unsafe { invalidate_icache(slot.ptr, BLOCK_SIZE) };
        Ok(())
    }

    /// Return a block to the free list. Double-free of a handle is a no-op.
    pub fn free(&mut self, h: BlockHandle) {
        let slot = &mut self.slots[h.0];
        if !slot.in_use {
            return;
        }
        slot.in_use = false;
        self.free.push(h.0);
    }

    #[cfg(test)]
    fn live_blocks(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }
}

static ARENA: OnceLock<Mutex<CodeArena>> = OnceLock::new();

/// Run `f` with the process-wide arena locked.
pub fn with_arena<R>(f: impl FnOnce(&mut CodeArena) -> R) -> R {
    let arena = ARENA.get_or_init(|| Mutex::new(CodeArena::new()));
    let mut guard = arena.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn map_block() -> Result<*mut u8, MockError> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            BLOCK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MockError::ArenaExhausted);
    }
    Ok(ptr as *mut u8)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn map_block() -> Result<*mut u8, MockError> {
    Err(MockError::Unsupported)
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn protect(ptr: *mut u8, prot: libc::c_int) -> Result<(), MockError> {
    if unsafe { libc::mprotect(ptr as *mut libc::c_void, BLOCK_SIZE, prot) } != 0 {
        return Err(MockError::ProtectFailed { addr: ptr as usize });
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn set_writable(ptr: *mut u8) -> Result<(), MockError> {
    protect(ptr, libc::PROT_READ | libc::PROT_WRITE)
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn set_executable(ptr: *mut u8) -> Result<(), MockError> {
    protect(ptr, libc::PROT_READ | libc::PROT_EXEC)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn set_writable(_ptr: *mut u8) -> Result<(), MockError> {
    Err(MockError::Unsupported)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn set_executable(_ptr: *mut u8) -> Result<(), MockError> {
    Err(MockError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_write_seal_free_cycle() {
        let mut arena = CodeArena::new();
        let h = arena.alloc().expect("alloc");
        let entry = arena.entry(h);
        assert_ne!(entry, 0);

        let written = arena.write(h, |buf| {
            buf[0] = 0xC3;
            1
        });
        assert_eq!(written, 1);
        arena.seal(h).expect("seal");

        arena.free(h);
        assert_eq!(arena.live_blocks(), 0);
        // Double-free stays a no-op.
        arena.free(h);
        assert_eq!(arena.live_blocks(), 0);
    }

    #[test]
    fn freed_blocks_are_recycled() {
        let mut arena = CodeArena::new();
        let a = arena.alloc().unwrap();
        let addr = arena.entry(a);
        arena.seal(a).unwrap();
        arena.free(a);

        let b = arena.alloc().unwrap();
        assert_eq!(arena.entry(b), addr);
        // Recycled blocks come back writable.
        arena.write(b, |buf| {
            buf[0] = 0x90;
            1
        });
        arena.free(b);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn sealed_block_executes() {
        let mut arena = CodeArena::new();
        let h = arena.alloc().unwrap();
        arena.write(h, |buf| {
            // mov rax, rdi; ret
            buf[..4].copy_from_slice(&[0x48, 0x89, 0xF8, 0xC3]);
            4
        });
        arena.seal(h).unwrap();

        let f: extern "C" fn(u64) -> u64 = unsafe { std::mem::transmute(arena.entry(h)) };
        assert_eq!(f(42), 42);
        arena.free(h);
    }

    #[test]
    #[cfg(target_arch = "aarch64")]
    fn sealed_block_executes() {
        let mut arena = CodeArena::new();
        let h = arena.alloc().unwrap();
        arena.write(h, |buf| {
            // add x0, x0, #1; ret
            buf[..4].copy_from_slice(&0x9100_0400u32.to_le_bytes());
            buf[4..8].copy_from_slice(&0xD65F_03C0u32.to_le_bytes());
            8
        });
        arena.seal(h).unwrap();

        let f: extern "C" fn(u64) -> u64 = unsafe { std::mem::transmute(arena.entry(h)) };
        assert_eq!(f(41), 42);
        arena.free(h);
    }
}
