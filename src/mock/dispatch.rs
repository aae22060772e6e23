//! The constructed hook body.
//!
//! Every patched target branches into a per-mock dispatch stub, which spills
//! the integer argument registers and calls [`dispatch_raw`] with a pointer
//! to the mock's compiled [`HookState`]. Dispatch evaluates the context
//! filter and the condition chain and either returns an action's result or
//! forwards to the relocated proxy.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::adapt::AdapterTransform;
use crate::context::current_task_id;
use crate::mock::condition::{HookFn, PredicateFn};
use crate::mock::sequence::Sequence;
use crate::types::{FilterMode, Shape, Value};

#[derive(Debug, Clone, Copy)]
pub(crate) struct ContextFilter {
    pub mode: FilterMode,
    pub id: u64,
}

pub(crate) enum CompiledAction {
    /// Clause with no action: forward to the proxy.
    Passthrough,
    Call(Arc<HookFn>, AdapterTransform),
    Return(Value),
    Seq(Arc<Sequence>),
}

pub(crate) struct Clause {
    pub when: Option<(Arc<PredicateFn>, AdapterTransform)>,
    pub action: CompiledAction,
}

/// Everything a live hook invocation needs. The dispatch stub embeds a raw
/// pointer to this; the owning mock keeps it alive from patch to unpatch.
pub(crate) struct HookState {
    pub extended: Shape,
    pub filter: ContextFilter,
    pub clauses: Vec<Clause>,
    pub times: AtomicU64,
    pub matched: AtomicU64,
    /// Entry of the relocated proxy block; stored after the patch lands.
    pub proxy_entry: AtomicUsize,
    pub origin: Option<(Arc<OriginCell>, AdapterTransform)>,
}

/// Address of [`dispatch_raw`] as embedded into dispatch stubs.
pub(crate) fn dispatcher_addr() -> usize {
    let f: extern "C" fn(*const HookState, *const u64) -> u64 = dispatch_raw;
    f as usize
}

/// Entry point called from generated code.
///
/// Author code (predicates, hooks) must never unwind through the patched
/// frame — that is undefined behavior — so a panic here aborts the process
/// with the diagnostic instead.
pub(crate) extern "C" fn dispatch_raw(state: *const HookState, argv: *const u64) -> u64 {
    let outcome = catch_unwind(AssertUnwindSafe(|| unsafe { dispatch(&*state, argv) }));
    match outcome {
        Ok(word) => word,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            log::error!("panic inside mock dispatch: {msg}");
            eprintln!("remock: fatal: panic inside mock dispatch: {msg}");
            std::process::abort();
        }
    }
}

unsafe fn dispatch(state: &HookState, argv: *const u64) -> u64 {
    let words = std::slice::from_raw_parts(argv, state.extended.arity());
    let extended: Vec<Value> = state
        .extended
        .params()
        .iter()
        .zip(words)
        .map(|(k, &w)| Value::from_word(*k, w))
        .collect();

    state.times.fetch_add(1, Ordering::Relaxed);

    // Capture the hidden arguments of this invocation so the origin
    // callable can forward them when invoked with the simple shape.
    if let Some((cell, tf)) = &state.origin {
        cell.stash(tf.extras_of(&extended));
    }

    match state.filter.mode {
        FilterMode::Disabled => {}
        FilterMode::Include => {
            if current_task_id() != state.filter.id {
                return call_proxy(state, &extended);
            }
        }
        FilterMode::Exclude => {
            if current_task_id() == state.filter.id {
                return call_proxy(state, &extended);
            }
        }
    }

    for clause in &state.clauses {
        let hit = match &clause.when {
            None => true,
            Some((pred, tf)) => pred(&tf.forward(&extended)),
        };
        if !hit {
            continue;
        }
        return match &clause.action {
            CompiledAction::Passthrough => call_proxy(state, &extended),
            CompiledAction::Call(hook, tf) => {
                state.matched.fetch_add(1, Ordering::Relaxed);
                hook(&tf.forward(&extended)).to_word()
            }
            CompiledAction::Return(v) => {
                state.matched.fetch_add(1, Ordering::Relaxed);
                v.to_word()
            }
            CompiledAction::Seq(seq) => {
                state.matched.fetch_add(1, Ordering::Relaxed);
                seq.next().to_word()
            }
        };
    }

    call_proxy(state, &extended)
}

fn call_proxy(state: &HookState, extended: &[Value]) -> u64 {
    let entry = state.proxy_entry.load(Ordering::Acquire);
    debug_assert_ne!(entry, 0, "proxy entry unset during dispatch");
    let words: Vec<u64> = extended.iter().map(|v| v.to_word()).collect();
    unsafe { call_words(entry, &words) }
}

/// Invoke raw code at `entry` with up to eight word arguments.
///
/// # Safety
/// `entry` must be executable code honoring the C calling convention for
/// the given argument count; callers guarantee the arity was validated
/// against the register envelope at build time.
pub(crate) unsafe fn call_words(entry: usize, a: &[u64]) -> u64 {
    macro_rules! cast {
        ($($arg:ty),*) => {
            std::mem::transmute::<usize, extern "C" fn($($arg),*) -> u64>(entry)
        };
    }
    match a.len() {
        0 => cast!()(),
        1 => cast!(u64)(a[0]),
        2 => cast!(u64, u64)(a[0], a[1]),
        3 => cast!(u64, u64, u64)(a[0], a[1], a[2]),
        4 => cast!(u64, u64, u64, u64)(a[0], a[1], a[2], a[3]),
        5 => cast!(u64, u64, u64, u64, u64)(a[0], a[1], a[2], a[3], a[4]),
        6 => cast!(u64, u64, u64, u64, u64, u64)(a[0], a[1], a[2], a[3], a[4], a[5]),
        7 => cast!(u64, u64, u64, u64, u64, u64, u64)(a[0], a[1], a[2], a[3], a[4], a[5], a[6]),
        8 => cast!(u64, u64, u64, u64, u64, u64, u64, u64)(
            a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7],
        ),
        n => unreachable!("arity {n} exceeds the register envelope"),
    }
}

#[derive(Debug)]
struct OriginBinding {
    proxy_entry: usize,
    extended: Shape,
    transform: AdapterTransform,
    extras: Vec<Value>,
}

/// Shared slot behind an author-facing [`OriginHandle`].
#[derive(Debug)]
pub(crate) struct OriginCell {
    shape: Shape,
    binding: Mutex<Option<OriginBinding>>,
}

impl OriginCell {
    pub fn new(shape: Shape) -> OriginCell {
        OriginCell { shape, binding: Mutex::new(None) }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn bind(&self, proxy_entry: usize, extended: Shape, transform: AdapterTransform) {
        let extras = vec![Value::Unit; transform.dropped().len()];
        *self.binding.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(OriginBinding { proxy_entry, extended, transform, extras });
    }

    pub fn unbind(&self) {
        *self.binding.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Per-invocation capture of the hidden argument values.
    fn stash(&self, extras: Vec<Value>) {
        if let Some(b) = self.binding.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            b.extras = extras;
        }
    }

    fn call(&self, args: &[Value]) -> Value {
        let (proxy_entry, ret, extended_args) = {
            let guard = self.binding.lock().unwrap_or_else(|e| e.into_inner());
            let b = guard
                .as_ref()
                .expect("remock: origin is not bound; build the mock before calling it");
            (b.proxy_entry, b.extended.ret(), b.transform.reverse(args, &b.extras))
        };
        let words: Vec<u64> = extended_args.iter().map(|v| v.to_word()).collect();
        let word = unsafe { call_words(proxy_entry, &words) };
        Value::from_word(ret, word)
    }
}

/// Author-facing capture slot for "call the original" behavior.
///
/// Declared with the shape the author will use; the build step validates it
/// against the target's extended shape and binds it to the relocated proxy.
/// Hidden receiver/descriptor arguments omitted from the declared shape are
/// captured from the current invocation and forwarded automatically.
#[derive(Debug, Clone)]
pub struct OriginHandle {
    pub(crate) cell: Arc<OriginCell>,
}

impl OriginHandle {
    pub fn new(shape: Shape) -> OriginHandle {
        OriginHandle { cell: Arc::new(OriginCell::new(shape)) }
    }

    /// Invoke the preserved original behavior.
    pub fn call(&self, args: &[Value]) -> Value {
        self.cell.call(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueKind;

    #[test]
    fn dispatcher_addr_is_stable_and_nonzero() {
        let a = dispatcher_addr();
        assert_ne!(a, 0);
        assert_eq!(a, dispatcher_addr());
    }

    #[test]
    #[should_panic(expected = "origin is not bound")]
    fn unbound_origin_call_fails_fast() {
        let h = OriginHandle::new(Shape::new(&[ValueKind::Int], ValueKind::Int));
        h.call(&[Value::Int(1)]);
    }
}
