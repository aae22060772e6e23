//! Entry patching: atomic substitution of a function's first bytes with a
//! branch into a hook, with the original bytes preserved in a relocated
//! proxy block so the unmocked behavior stays callable.

use crate::arch;
use crate::code::arena::{with_arena, BlockHandle};
use crate::code::cache::invalidate_icache;
use crate::code::pause::with_world_stopped;
use crate::types::MockError;

/// Bytes of the target entry considered for cut-point selection. Generous:
/// a cut never exceeds the branch length plus one maximal instruction.
pub const ENTRY_WINDOW: usize = 64;

/// Live state of one applied patch. Exactly one record exists per patched
/// target; dropping a still-active record leaves the patch in place (the
/// owning mock decides when to revert).
#[derive(Debug)]
pub struct PatchRecord {
    base: usize,
    saved: Vec<u8>,
    proxy: Option<BlockHandle>,
    proxy_entry: usize,
    active: bool,
}

impl PatchRecord {
    pub fn base(&self) -> usize {
        self.base
    }

    /// Entry of the relocated block: "the original function" after patching.
    pub fn proxy_entry(&self) -> usize {
        self.proxy_entry
    }

    /// Number of leading bytes cut from the target.
    pub fn saved_len(&self) -> usize {
        self.saved.len()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Replace the entry of `base` with a branch into `hook_entry`.
///
/// The cut point is the first instruction boundary past the branch length;
/// `unsafe_mode` disables the return-instruction safety check for functions
/// shorter than the branch sequence.
pub fn apply(base: usize, hook_entry: usize, unsafe_mode: bool) -> Result<PatchRecord, MockError> {
    let dec = arch::native();
    let window = unsafe { std::slice::from_raw_parts(base as *const u8, ENTRY_WINDOW) };

    let jump = dec.branch_into(hook_entry);
    if jump.is_empty() {
        return Err(MockError::Unsupported);
    }
    let cut = dec.disassemble(window, jump.len(), !unsafe_mode)?;
    let saved = window[..cut].to_vec();

    // Proxy block: preserved prologue, then a branch back to the resume
    // point past the cut.
    let (proxy, proxy_entry) = with_arena(|arena| {
        let h = arena.alloc()?;
        let entry = arena.entry(h);
        arena.write(h, |buf| {
            buf[..cut].copy_from_slice(&saved);
            let back = dec.branch_to(base + cut);
            buf[cut..cut + back.len()].copy_from_slice(&back);
            cut + back.len()
        });
        if let Err(e) = arena.seal(h) {
            arena.free(h);
            return Err(e);
        }
        Ok((h, entry))
    })?;

    log::debug!(
        "patch apply: base={base:#x} hook={hook_entry:#x} cut={cut} proxy={proxy_entry:#x}"
    );

    if let Err(e) = with_world_stopped(|| unsafe { write_code(base, &jump) }) {
        with_arena(|arena| arena.free(proxy));
        return Err(e);
    }

    Ok(PatchRecord { base, saved, proxy: Some(proxy), proxy_entry, active: true })
}

/// Restore the original bytes and release the proxy block. Unpatching an
/// already-unpatched record is a no-op.
pub fn unpatch(record: &mut PatchRecord) -> Result<(), MockError> {
    if !record.active {
        return Ok(());
    }
    with_world_stopped(|| unsafe { write_code(record.base, &record.saved) })?;
    if let Some(h) = record.proxy.take() {
        with_arena(|arena| arena.free(h));
    }
    record.active = false;
    log::debug!("patch revert: base={:#x} len={}", record.base, record.saved.len());
    Ok(())
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Overwrite live code. Must run inside the world pause: the write is
/// decomposed into one bounded sub-write per page, and each page is flipped
/// writable and back around its sub-write.
pub(crate) unsafe fn write_code(dst: usize, bytes: &[u8]) -> Result<(), MockError> {
    let page = page_size();
    let mut off = 0usize;
    while off < bytes.len() {
        let cur = dst + off;
        let page_base = cur & !(page - 1);
        let n = (page_base + page - cur).min(bytes.len() - off);

        set_page_writable(page_base, page)?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr().add(off), cur as *mut u8, n);
        set_page_executable(page_base, page)?;
        invalidate_icache(page_base as *mut u8, page);

        off += n;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_page_writable(page: usize, len: usize) -> Result<(), MockError> {
    // RWX rather than RW: other code on the page must stay executable for
    // tasks resumed between sub-writes of *different* patch operations.
    mprotect(page, len, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)
}

#[cfg(target_os = "linux")]
fn set_page_executable(page: usize, len: usize) -> Result<(), MockError> {
    mprotect(page, len, libc::PROT_READ | libc::PROT_EXEC)
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn mprotect(page: usize, len: usize, prot: libc::c_int) -> Result<(), MockError> {
    if unsafe { libc::mprotect(page as *mut libc::c_void, len, prot) } != 0 {
        return Err(MockError::ProtectFailed { addr: page });
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn set_page_writable(page: usize, len: usize) -> Result<(), MockError> {
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;
    use mach2::vm::mach_vm_protect;
    use mach2::vm_prot::{VM_PROT_COPY, VM_PROT_READ, VM_PROT_WRITE};

    unsafe {
        let task = mach_task_self();
        let mut kr = mach_vm_protect(task, page as u64, len as u64, 0, VM_PROT_READ | VM_PROT_WRITE);
        if kr != KERN_SUCCESS {
            // Signed mappings refuse a plain RW flip; request a COW copy.
            kr = mach_vm_protect(
                task,
                page as u64,
                len as u64,
                0,
                VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY,
            );
        }
        if kr != KERN_SUCCESS {
            return mprotect(page, len, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC);
        }
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn set_page_executable(page: usize, len: usize) -> Result<(), MockError> {
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;
    use mach2::vm::mach_vm_protect;
    use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ};

    unsafe {
        let kr = mach_vm_protect(
            mach_task_self(),
            page as u64,
            len as u64,
            0,
            VM_PROT_READ | VM_PROT_EXECUTE,
        );
        if kr != KERN_SUCCESS {
            return mprotect(page, len, libc::PROT_READ | libc::PROT_EXEC);
        }
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn set_page_writable(_page: usize, _len: usize) -> Result<(), MockError> {
    Err(MockError::Unsupported)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn set_page_executable(_page: usize, _len: usize) -> Result<(), MockError> {
    Err(MockError::Unsupported)
}

#[cfg(all(
    test,
    any(target_os = "linux", target_os = "macos"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
mod tests {
    use super::*;
    use crate::code::arena::with_arena;

    /// Build `f(x) = x + c` in executable memory, padded so the entry can
    /// host the branch sequence.
    fn make_add_const(c: u32) -> usize {
        with_arena(|arena| {
            let h = arena.alloc().expect("alloc");
            arena.write(h, |buf| {
                #[cfg(target_arch = "x86_64")]
                {
                    use crate::arch::x86_64::writer::Writer;
                    let mut w = Writer::new(buf);
                    // mov rax, rdi
                    w.bytes(&[0x48, 0x89, 0xF8]);
                    // add rax, imm32 (REX.W 81 /0 id)
                    w.bytes(&[0x48, 0x81, 0xC0]);
                    w.bytes(&c.to_le_bytes());
                    // NOP sled before the return keeps the entry long enough
                    // to host the branch sequence; more NOPs after it keep
                    // the cut window decodable.
                    let mut n = w.len();
                    while n < 16 {
                        buf[n] = 0x90;
                        n += 1;
                    }
                    buf[n] = 0xC3;
                    n += 1;
                    while n < 48 {
                        buf[n] = 0x90;
                        n += 1;
                    }
                    n
                }
                #[cfg(target_arch = "aarch64")]
                {
                    use crate::arch::arm64::writer::{Reg, Writer};
                    let mut w = Writer::new(buf);
                    w.add_imm(Reg::X0, Reg::X0, c & 0xFFF);
                    let mut n = w.len();
                    while n < 16 {
                        buf[n..n + 4].copy_from_slice(&0xD503_201Fu32.to_le_bytes());
                        n += 4;
                    }
                    buf[n..n + 4].copy_from_slice(&0xD65F_03C0u32.to_le_bytes());
                    n += 4;
                    while n < 48 {
                        buf[n..n + 4].copy_from_slice(&0xD503_201Fu32.to_le_bytes());
                        n += 4;
                    }
                    n
                }
            });
            arena.seal(h).expect("seal");
            arena.entry(h)
        })
    }

    fn as_fn(addr: usize) -> extern "C" fn(u64) -> u64 {
        unsafe { std::mem::transmute(addr) }
    }

    #[test]
    fn apply_redirects_and_unpatch_restores() {
        let _g = crate::lock_hook_tests();

        let target = make_add_const(1);
        let hook = make_add_const(100);

        let before: Vec<u8> =
            unsafe { std::slice::from_raw_parts(target as *const u8, 32) }.to_vec();
        assert_eq!(as_fn(target)(1), 2);

        let mut record = apply(target, hook, false).expect("apply");
        assert_eq!(record.base(), target);
        assert!(record.saved_len() >= crate::arch::BRANCH_LEN);

        // Redirected: calls land in the hook.
        let f = std::hint::black_box(as_fn(target));
        assert_eq!(f(1), 101);

        // The proxy preserves the original behavior.
        let orig = std::hint::black_box(as_fn(record.proxy_entry()));
        assert_eq!(orig(1), 2);

        unpatch(&mut record).expect("unpatch");
        let after: Vec<u8> =
            unsafe { std::slice::from_raw_parts(target as *const u8, 32) }.to_vec();
        assert_eq!(before, after, "original bytes must be restored exactly");

        let f = std::hint::black_box(as_fn(target));
        assert_eq!(f(1), 2);
    }

    #[test]
    fn unpatch_twice_is_a_noop() {
        let _g = crate::lock_hook_tests();

        let target = make_add_const(3);
        let hook = make_add_const(7);

        let mut record = apply(target, hook, false).expect("apply");
        unpatch(&mut record).expect("first");
        assert!(!record.is_active());
        unpatch(&mut record).expect("second");
        assert_eq!(as_fn(target)(2), 5);
    }

    #[test]
    fn short_function_is_rejected_in_safety_mode() {
        let _g = crate::lock_hook_tests();

        let target = with_arena(|arena| {
            let h = arena.alloc().unwrap();
            arena.write(h, |buf| {
                #[cfg(target_arch = "x86_64")]
                {
                    buf[0] = 0xC3;
                    let rest = 48;
                    for b in buf[1..rest].iter_mut() {
                        *b = 0x90;
                    }
                    rest
                }
                #[cfg(target_arch = "aarch64")]
                {
                    buf[..4].copy_from_slice(&0xD65F_03C0u32.to_le_bytes());
                    for i in 1..12 {
                        buf[i * 4..i * 4 + 4].copy_from_slice(&0xD503_201Fu32.to_le_bytes());
                    }
                    48
                }
            });
            arena.seal(h).unwrap();
            arena.entry(h)
        });
        let hook = make_add_const(9);

        assert!(matches!(
            apply(target, hook, false),
            Err(MockError::FunctionTooShort)
        ));

        // The unsafe override patches it anyway; revert immediately.
        let mut record = apply(target, hook, true).expect("unsafe apply");
        unpatch(&mut record).expect("unpatch");
    }

    #[test]
    fn write_code_handles_page_spanning_ranges() {
        let _g = crate::lock_hook_tests();

        let page = page_size();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page * 2,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);
        unsafe {
            std::ptr::write_bytes(ptr as *mut u8, 0x90, page * 2);
            libc::mprotect(ptr, page * 2, libc::PROT_READ | libc::PROT_EXEC);
        }

        let dst = ptr as usize + page - 5;
        let data: Vec<u8> = (0u8..12).collect();
        unsafe { write_code(dst, &data).expect("write") };

        let written = unsafe { std::slice::from_raw_parts(dst as *const u8, 12) };
        assert_eq!(written, &data[..]);

        unsafe { libc::munmap(ptr, page * 2) };
    }
}
