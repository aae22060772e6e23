//! Instruction-cache maintenance after code writes.

/// Flush the data cache and invalidate the instruction cache for a freshly
/// written code region. AArch64 keeps the two incoherent; x86_64 snoops and
/// needs nothing.
///
/// # Safety
/// `addr` must point to at least `size` readable bytes.
#[inline]
pub unsafe fn invalidate_icache(addr: *mut u8, size: usize) {
    #[cfg(target_os = "macos")]
    {
        extern "C" {
            fn sys_icache_invalidate(addr: *mut core::ffi::c_void, size: usize);
            fn sys_dcache_flush(addr: *mut core::ffi::c_void, size: usize);
        }
        sys_dcache_flush(addr as *mut core::ffi::c_void, size);
        sys_icache_invalidate(addr as *mut core::ffi::c_void, size);
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    {
        extern "C" {
            fn __clear_cache(beg: *mut libc::c_void, end: *mut libc::c_void);
        }
        __clear_cache(addr as *mut libc::c_void, addr.add(size) as *mut libc::c_void);
    }

    #[cfg(not(any(target_os = "macos", all(target_os = "linux", target_arch = "aarch64"))))]
    {
        let _ = (addr, size);
    }
}
