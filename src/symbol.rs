//! Symbol resolution collaborator.
//!
//! The engine needs two things from the host: a debug name for a code
//! address (target classification) and the address ranges of the compiler's
//! bulk-copy helpers (excluded during generic dispatch-shim scans). Both are
//! behind a trait so tests can inject synthetic symbol tables.

use std::ffi::CStr;
use std::ops::Range;
use std::sync::{Arc, OnceLock, RwLock};

/// Resolved symbol: stable entry address plus debug name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    pub entry: usize,
}

pub trait SymbolResolver: Send + Sync {
    /// Symbol covering `addr`, or `None` when no name is resolvable.
    fn resolve(&self, addr: usize) -> Option<SymbolInfo>;

    /// Address ranges of bulk-copy helpers (`memcpy`-family) that a generic
    /// dispatch shim may legitimately call besides its real body.
    fn copy_helper_ranges(&self) -> Vec<Range<usize>>;
}

/// Default resolver built on `dladdr`.
///
/// `dladdr` only sees dynamic symbols; local functions in a stripped binary
/// resolve to `None`, which the analyzer treats as fatal. Callers that mock
/// such functions pass explicit classification flags instead.
pub struct DladdrResolver;

// Span assumed to cover a libc bulk-copy routine. The helpers are leaf
// routines well under a page even with vectorized variants.
const HELPER_SPAN: usize = 4096;

impl SymbolResolver for DladdrResolver {
    fn resolve(&self, addr: usize) -> Option<SymbolInfo> {
        unsafe {
            let mut info: libc::Dl_info = std::mem::zeroed();
            if libc::dladdr(addr as *const libc::c_void, &mut info) == 0 {
                return None;
            }
            if info.dli_sname.is_null() || info.dli_saddr.is_null() {
                return None;
            }
            let name = CStr::from_ptr(info.dli_sname).to_string_lossy().into_owned();
            Some(SymbolInfo { name, entry: info.dli_saddr as usize })
        }
    }

    fn copy_helper_ranges(&self) -> Vec<Range<usize>> {
        ["memcpy", "memmove", "memset"]
            .iter()
            .filter_map(|name| {
                let cname = std::ffi::CString::new(*name).ok()?;
                let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
                if addr.is_null() {
                    None
                } else {
                    let start = addr as usize;
                    Some(start..start + HELPER_SPAN)
                }
            })
            .collect()
    }
}

static RESOLVER: OnceLock<RwLock<Arc<dyn SymbolResolver>>> = OnceLock::new();

fn slot() -> &'static RwLock<Arc<dyn SymbolResolver>> {
    RESOLVER.get_or_init(|| RwLock::new(Arc::new(DladdrResolver)))
}

/// The process-wide resolver.
pub fn global() -> Arc<dyn SymbolResolver> {
    slot().read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Replace the process-wide resolver. Intended for tests and embedders with
/// richer symbol sources.
pub fn set_global(resolver: Arc<dyn SymbolResolver>) {
    *slot().write().unwrap_or_else(|e| e.into_inner()) = resolver;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dladdr_resolves_a_libc_export() {
        let addr = libc::malloc as usize;
        let info = DladdrResolver.resolve(addr);
        // Static musl builds may strip dynamic symbols; only check shape when
        // resolution succeeded.
        if let Some(info) = info {
            assert!(!info.name.is_empty());
            assert!(info.entry <= addr);
        }
    }

    #[test]
    fn copy_helper_ranges_cover_memcpy() {
        let ranges = DladdrResolver.copy_helper_ranges();
        if ranges.is_empty() {
            return;
        }
        let name = std::ffi::CString::new("memcpy").unwrap();
        let memcpy = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) } as usize;
        assert!(ranges.iter().any(|r| r.contains(&memcpy)));
    }
}
