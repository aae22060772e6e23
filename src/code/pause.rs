//! World-pause collaborator contract.
//!
//! Mutating a live instruction stream is only sound when no other task can
//! observe a half-written sequence. The patcher brackets every code write
//! with [`WorldPauser::pause`]/[`WorldPauser::resume`]; the contract is that
//! *no* other schedulable task runs in between — a partial pause (some tasks
//! only) breaks the page-split write argument.
//!
//! The default implementation is an in-process critical section: it
//! serializes all patch writes against each other, which is the strongest
//! guarantee available without scheduler cooperation. Embedders running
//! under a runtime that can actually suspend all tasks should install their
//! own pauser via [`set_world_pauser`].

use std::sync::{Condvar, Mutex, OnceLock, RwLock};
use std::sync::Arc;

pub trait WorldPauser: Send + Sync {
    /// Block until exclusive ownership of the world is acquired.
    fn pause(&self);

    /// Release the world. Only called after a matching `pause`.
    fn resume(&self);
}

/// Default pauser: a process-wide critical section.
pub struct CriticalSection {
    held: Mutex<bool>,
    cv: Condvar,
}

impl CriticalSection {
    pub fn new() -> CriticalSection {
        CriticalSection { held: Mutex::new(false), cv: Condvar::new() }
    }
}

impl Default for CriticalSection {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldPauser for CriticalSection {
    fn pause(&self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        while *held {
            held = self.cv.wait(held).unwrap_or_else(|e| e.into_inner());
        }
        *held = true;
    }

    fn resume(&self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        *held = false;
        self.cv.notify_one();
    }
}

static PAUSER: OnceLock<RwLock<Arc<dyn WorldPauser>>> = OnceLock::new();

fn slot() -> &'static RwLock<Arc<dyn WorldPauser>> {
    PAUSER.get_or_init(|| RwLock::new(Arc::new(CriticalSection::new())))
}

/// Install a pauser. Intended for embedders whose runtime can suspend all
/// tasks; the replacement applies to subsequent patch operations.
pub fn set_world_pauser(pauser: Arc<dyn WorldPauser>) {
    *slot().write().unwrap_or_else(|e| e.into_inner()) = pauser;
}

struct ResumeOnDrop(Arc<dyn WorldPauser>);

impl Drop for ResumeOnDrop {
    fn drop(&mut self) {
        self.0.resume();
    }
}

/// Run `f` with the world paused. Resumes even if `f` panics.
pub fn with_world_stopped<R>(f: impl FnOnce() -> R) -> R {
    let pauser = slot().read().unwrap_or_else(|e| e.into_inner()).clone();
    pauser.pause();
    let _resume = ResumeOnDrop(pauser);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn critical_section_is_mutually_exclusive() {
        let cs = Arc::new(CriticalSection::new());
        let active = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cs = cs.clone();
                let active = active.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cs.pause();
                        let now = active.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(now, 0, "two tasks inside the pause");
                        active.fetch_sub(1, Ordering::SeqCst);
                        cs.resume();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn with_world_stopped_resumes_after_panic() {
        let _ = std::panic::catch_unwind(|| {
            with_world_stopped(|| panic!("boom"));
        });
        // A second entry must not deadlock.
        with_world_stopped(|| ());
    }
}
