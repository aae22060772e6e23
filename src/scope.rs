//! Nested interception scopes.
//!
//! A registry is a stack of frames, each mapping patch base addresses to the
//! mocks registered while that frame was on top. Leaving a scope reverts
//! everything registered inside it; outer frames are untouched. The registry
//! is an explicit object so tests can instantiate independent ones; a
//! process-wide default backs the free functions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::mock::Mocker;
use crate::types::MockError;

struct Registered {
    mocker: Arc<Mocker>,
    site: String,
}

struct ScopeFrame {
    name: String,
    entries: HashMap<usize, Registered>,
}

impl ScopeFrame {
    fn new(name: &str) -> ScopeFrame {
        ScopeFrame { name: name.to_string(), entries: HashMap::new() }
    }
}

pub struct ScopeRegistry {
    frames: Mutex<Vec<ScopeFrame>>,
}

impl ScopeRegistry {
    /// A fresh registry with its root frame. The root frame is never popped.
    pub fn new() -> Arc<ScopeRegistry> {
        Arc::new(ScopeRegistry { frames: Mutex::new(vec![ScopeFrame::new("root")]) })
    }

    /// The process-wide registry used by [`crate::enter_scope`] and builders
    /// without an explicit registry.
    pub fn global() -> Arc<ScopeRegistry> {
        static GLOBAL: OnceLock<Arc<ScopeRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(ScopeRegistry::new).clone()
    }

    /// Current nesting depth, root frame included.
    pub fn depth(&self) -> usize {
        self.lock().len()
    }

    /// Push a frame, run `body`, then revert every mock registered in the
    /// frame and pop it. Teardown also runs when `body` panics.
    pub fn enter_scope<R>(&self, name: &str, body: impl FnOnce() -> R) -> R {
        self.lock().push(ScopeFrame::new(name));
        log::debug!("scope enter: {name}");

        struct Teardown<'a>(&'a ScopeRegistry);
        impl Drop for Teardown<'_> {
            fn drop(&mut self) {
                self.0.exit_top();
            }
        }
        let guard = Teardown(self);
        let result = body();
        drop(guard);
        result
    }

    /// Revert every mock in the current top frame without popping it.
    pub fn unpatch_all(&self) {
        let drained: Vec<Registered> = {
            let mut frames = self.lock();
            let top = frames.last_mut().expect("root frame always exists");
            top.entries.drain().map(|(_, r)| r).collect()
        };
        for r in drained {
            r.mocker.unpatch();
        }
    }

    fn exit_top(&self) {
        let frame = {
            let mut frames = self.lock();
            if frames.len() <= 1 {
                // The root frame is cleared but never popped.
                let top = frames.last_mut().unwrap();
                ScopeFrame {
                    name: top.name.clone(),
                    entries: std::mem::take(&mut top.entries),
                }
            } else {
                frames.pop().unwrap()
            }
        };
        log::debug!("scope exit: {} ({} mocks)", frame.name, frame.entries.len());
        for (_, r) in frame.entries {
            r.mocker.unpatch();
        }
    }

    /// Record `mocker` for `base` in the top frame, failing when the target
    /// is already patched anywhere in the stack. Called before any memory
    /// mutation.
    pub(crate) fn reserve(
        &self,
        base: usize,
        mocker: Arc<Mocker>,
        site: String,
    ) -> Result<(), MockError> {
        let mut frames = self.lock();
        for frame in frames.iter() {
            if let Some(prev) = frame.entries.get(&base) {
                return Err(MockError::AlreadyMocked { addr: base, site: prev.site.clone() });
            }
        }
        let top = frames.last_mut().expect("root frame always exists");
        top.entries.insert(base, Registered { mocker, site });
        Ok(())
    }

    /// Remove `base` from the top frame. A no-op when the entry lives in an
    /// outer frame; it is reverted again (harmlessly) on that frame's exit.
    pub(crate) fn deregister(&self, base: usize) {
        let mut frames = self.lock();
        if let Some(top) = frames.last_mut() {
            top.entries.remove(&base);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ScopeFrame>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Run `body` inside a nested scope of the process-wide registry.
pub fn enter_scope<R>(name: &str, body: impl FnOnce() -> R) -> R {
    ScopeRegistry::global().enter_scope(name, body)
}

/// Revert every mock registered in the current scope of the process-wide
/// registry, without leaving the scope.
pub fn unpatch_all() {
    ScopeRegistry::global().unpatch_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_tracks_nesting() {
        let reg = ScopeRegistry::new();
        assert_eq!(reg.depth(), 1);
        reg.enter_scope("outer", || {
            assert_eq!(reg.depth(), 2);
            reg.enter_scope("inner", || {
                assert_eq!(reg.depth(), 3);
            });
            assert_eq!(reg.depth(), 2);
        });
        assert_eq!(reg.depth(), 1);
    }

    #[test]
    fn scope_exits_on_panic() {
        let reg = ScopeRegistry::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            reg.enter_scope("boom", || panic!("test"));
        }));
        assert!(result.is_err());
        assert_eq!(reg.depth(), 1);
    }

    #[test]
    fn root_frame_survives_unpatch_all() {
        let reg = ScopeRegistry::new();
        reg.unpatch_all();
        assert_eq!(reg.depth(), 1);
    }

    #[test]
    fn registries_are_independent() {
        let a = ScopeRegistry::new();
        let b = ScopeRegistry::new();
        a.enter_scope("only-a", || {
            assert_eq!(a.depth(), 2);
            assert_eq!(b.depth(), 1);
        });
    }
}
