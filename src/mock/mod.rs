//! Mock construction and lifecycle.
//!
//! [`mock`] starts a builder; [`MockBuilder::build`] compiles the condition
//! chain, generates the dispatch stub, applies the entry patch, and
//! registers the result with a scope registry for teardown. The returned
//! [`Mocker`] supports counters, scoped re-patching, and in-place mutation
//! of single-clause mocks.

use std::panic::Location;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::adapt::{AbiRevision, Adapter, CURRENT_ABI};
use crate::analyze::Analyzer;
use crate::arch;
use crate::code::arena::{with_arena, BlockHandle};
use crate::code::patcher::{self, PatchRecord};
use crate::context::current_task_id;
use crate::scope::ScopeRegistry;
use crate::symbol;
use crate::types::{FilterMode, MockError, Shape, TargetDescriptor, Value, ValueKind};

pub mod condition;
pub mod dispatch;
pub mod sequence;

use condition::{Condition, ConditionAction, HookFn, PredicateFn};
use dispatch::{
    dispatcher_addr, Clause, CompiledAction, ContextFilter, HookState, OriginCell,
};
pub use dispatch::OriginHandle;
use sequence::Sequence;

/// Bytes scanned when resolving a generic dispatch shim's real body.
const SHIM_SCAN: usize = 256;

/// Begin mocking the function at `target` with the given declared shape.
///
/// `target` is the function's entry address (`f as usize`). The shape lists
/// the physical parameters the author sees — for methods that includes the
/// receiver; for generic instantiations it excludes the hidden descriptor,
/// which the engine adds.
pub fn mock(target: usize, shape: Shape) -> MockBuilder {
    MockBuilder {
        target,
        shape,
        conditions: vec![Condition::default()],
        origin: None,
        filter: ContextFilter { mode: FilterMode::Disabled, id: 0 },
        generic: false,
        method: None,
        unsafe_mode: false,
        abi: CURRENT_ABI,
    }
}

pub struct MockBuilder {
    target: usize,
    shape: Shape,
    conditions: Vec<Condition>,
    origin: Option<Arc<OriginCell>>,
    filter: ContextFilter,
    generic: bool,
    method: Option<bool>,
    unsafe_mode: bool,
    abi: AbiRevision,
}

impl MockBuilder {
    /// Mark the target as a generic instantiation dispatching through a shim
    /// and carrying a hidden descriptor parameter.
    pub fn generic(mut self) -> MockBuilder {
        self.generic = true;
        self
    }

    /// Explicit method classification, bypassing the symbol analyzer.
    pub fn method(mut self, is_method: bool) -> MockBuilder {
        self.method = Some(is_method);
        self
    }

    /// Disable the short-function safety check. The patch may then overwrite
    /// bytes past the end of the function body.
    pub fn unsafe_mode(mut self) -> MockBuilder {
        self.unsafe_mode = true;
        self
    }

    /// Override the host-runtime ABI revision used for hidden-parameter
    /// placement on generic methods.
    pub fn abi_revision(mut self, rev: AbiRevision) -> MockBuilder {
        self.abi = rev;
        self
    }

    fn last_condition(&mut self) -> &mut Condition {
        if self.conditions.last().is_some_and(Condition::complete) {
            self.conditions.push(Condition::default());
        }
        self.conditions.last_mut().unwrap()
    }

    /// Predicate over the declared target shape.
    pub fn when(self, pred: impl Fn(&[Value]) -> bool + Send + Sync + 'static) -> MockBuilder {
        let params = self.shape.params().to_vec();
        self.when_shaped(&params, pred)
    }

    /// Predicate over an explicit simple shape (receiver/descriptor may be
    /// omitted).
    pub fn when_shaped(
        mut self,
        params: &[ValueKind],
        pred: impl Fn(&[Value]) -> bool + Send + Sync + 'static,
    ) -> MockBuilder {
        let shape = Shape::new(params, ValueKind::Bool);
        self.last_condition().set_when(Arc::new(pred), shape);
        self
    }

    /// Replacement hook with the declared target shape.
    pub fn to(self, hook: impl Fn(&[Value]) -> Value + Send + Sync + 'static) -> MockBuilder {
        let shape = self.shape.clone();
        self.to_shaped(shape, hook)
    }

    /// Replacement hook with an explicit simple shape.
    pub fn to_shaped(
        mut self,
        shape: Shape,
        hook: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
    ) -> MockBuilder {
        self.last_condition()
            .set_action(ConditionAction::Call { hook: Arc::new(hook), shape });
        self
    }

    /// Fixed return value for the current clause.
    pub fn returns(mut self, value: Value) -> MockBuilder {
        assert_return_kind(&self.shape, value.kind());
        self.last_condition().set_action(ConditionAction::Return(value));
        self
    }

    /// Scripted return values for the current clause.
    pub fn sequence(mut self, seq: Sequence) -> MockBuilder {
        for kind in seq.value_kinds() {
            assert_return_kind(&self.shape, kind);
        }
        self.last_condition().set_action(ConditionAction::Seq(Arc::new(seq)));
        self
    }

    /// Bind an origin handle to the preserved original behavior.
    pub fn origin(mut self, handle: &OriginHandle) -> MockBuilder {
        assert!(self.origin.is_none(), "remock: origin already set");
        self.origin = Some(handle.cell.clone());
        self
    }

    pub fn filter_context(mut self, mode: FilterMode, id: u64) -> MockBuilder {
        self.filter = ContextFilter { mode, id };
        self
    }

    /// Only invocations from the current task hit the conditions.
    pub fn include_current_context(self) -> MockBuilder {
        self.filter_context(FilterMode::Include, current_task_id())
    }

    /// Invocations from the current task bypass the conditions.
    pub fn exclude_current_context(self) -> MockBuilder {
        self.filter_context(FilterMode::Exclude, current_task_id())
    }

    /// Finalize and apply the patch, registering with the default registry.
    /// Any failure is fatal at this call site.
    #[track_caller]
    pub fn build(self) -> Arc<Mocker> {
        let registry = ScopeRegistry::global();
        self.build_in(&registry)
    }

    #[track_caller]
    pub fn build_in(self, registry: &Arc<ScopeRegistry>) -> Arc<Mocker> {
        match self.try_build_in(registry) {
            Ok(m) => m,
            Err(e) => panic!("remock: {e}"),
        }
    }

    #[track_caller]
    pub fn try_build(self) -> Result<Arc<Mocker>, MockError> {
        let registry = ScopeRegistry::global();
        self.try_build_in(&registry)
    }

    #[track_caller]
    pub fn try_build_in(self, registry: &Arc<ScopeRegistry>) -> Result<Arc<Mocker>, MockError> {
        let site = Location::caller();
        let mocker = Arc::new_cyclic(|weak| Mocker {
            registry: registry.clone(),
            weak_self: weak.clone(),
            inner: Mutex::new(Inner {
                builder: self,
                descriptor: None,
                state: None,
                state_raw: 0,
                stub: None,
                record: None,
                base: 0,
            }),
        });
        mocker.try_patch_at(site)?;
        Ok(mocker)
    }
}

fn assert_return_kind(shape: &Shape, kind: ValueKind) {
    assert!(
        kind == shape.ret(),
        "remock: return value kind {} does not match target return {}",
        kind,
        shape.ret()
    );
}

struct Inner {
    builder: MockBuilder,
    descriptor: Option<TargetDescriptor>,
    state: Option<Arc<HookState>>,
    /// Raw pointer copy embedded in the dispatch stub (kept as usize so the
    /// guard stays Send). Released on unpatch.
    state_raw: usize,
    stub: Option<BlockHandle>,
    record: Option<PatchRecord>,
    /// Physical patch base, which differs from the target address for
    /// generic targets (resolved through the dispatch shim).
    base: usize,
}

/// A live interception of one target.
pub struct Mocker {
    registry: Arc<ScopeRegistry>,
    weak_self: Weak<Mocker>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Mocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mocker")
            .field("is_patched", &self.is_patched())
            .finish_non_exhaustive()
    }
}

impl Mocker {
    /// Total invocations since the patch was applied.
    pub fn times(&self) -> u64 {
        let inner = self.lock();
        inner.state.as_ref().map_or(0, |s| s.times.load(Ordering::Relaxed))
    }

    /// Invocations that executed a condition's action.
    pub fn matched_times(&self) -> u64 {
        let inner = self.lock();
        inner.state.as_ref().map_or(0, |s| s.matched.load(Ordering::Relaxed))
    }

    pub fn is_patched(&self) -> bool {
        let inner = self.lock();
        inner.record.as_ref().is_some_and(PatchRecord::is_active)
    }

    /// Resolved identity of the target. Available once patched.
    pub fn descriptor(&self) -> Option<TargetDescriptor> {
        self.lock().descriptor.clone()
    }

    /// Apply the patch. A no-op when already patched; any failure is fatal.
    #[track_caller]
    pub fn patch(&self) -> &Self {
        if let Err(e) = self.try_patch_at(Location::caller()) {
            panic!("remock: {e}");
        }
        self
    }

    /// Restore the original behavior. A no-op when already unpatched.
    pub fn unpatch(&self) -> &Self {
        if let Err(e) = self.try_unpatch() {
            panic!("remock: {e}");
        }
        self
    }

    /// Unpatch and reset the condition chain to a single empty clause.
    pub fn release(&self) -> &Self {
        self.unpatch();
        let mut inner = self.lock();
        inner.builder.conditions = vec![Condition::default()];
        drop(inner);
        self
    }

    /// Replace the predicate of a single-clause mock and re-apply.
    #[track_caller]
    pub fn when(&self, pred: impl Fn(&[Value]) -> bool + Send + Sync + 'static) -> &Self {
        self.re_patch(|b| {
            let shape = Shape::new(b.shape.params(), ValueKind::Bool);
            b.conditions[0].set_when_force(Arc::new(pred) as Arc<PredicateFn>, shape);
        })
    }

    /// Replace the hook of a single-clause mock and re-apply.
    #[track_caller]
    pub fn to(&self, hook: impl Fn(&[Value]) -> Value + Send + Sync + 'static) -> &Self {
        self.re_patch(|b| {
            let shape = b.shape.clone();
            b.conditions[0]
                .set_action_force(ConditionAction::Call { hook: Arc::new(hook) as Arc<HookFn>, shape });
        })
    }

    /// Replace the return value of a single-clause mock and re-apply.
    #[track_caller]
    pub fn returns(&self, value: Value) -> &Self {
        self.re_patch(move |b| {
            assert_return_kind(&b.shape, value.kind());
            b.conditions[0].set_action_force(ConditionAction::Return(value));
        })
    }

    /// Bind (or rebind) an origin handle and re-apply.
    #[track_caller]
    pub fn origin(&self, handle: &OriginHandle) -> &Self {
        let cell = handle.cell.clone();
        self.re_patch_any(move |b| b.origin = Some(cell))
    }

    /// Change the context filter and re-apply.
    #[track_caller]
    pub fn filter_context(&self, mode: FilterMode, id: u64) -> &Self {
        self.re_patch_any(move |b| b.filter = ContextFilter { mode, id })
    }

    #[track_caller]
    pub fn include_current_context(&self) -> &Self {
        self.filter_context(FilterMode::Include, current_task_id())
    }

    #[track_caller]
    pub fn exclude_current_context(&self) -> &Self {
        self.filter_context(FilterMode::Exclude, current_task_id())
    }

    #[track_caller]
    fn re_patch(&self, mutate: impl FnOnce(&mut MockBuilder)) -> &Self {
        {
            let inner = self.lock();
            assert!(
                inner.builder.conditions.len() == 1,
                "remock: only single-clause mocks can be modified in place; release() first"
            );
        }
        self.re_patch_any(mutate)
    }

    /// Unpatch, mutate the recipe, rebuild the hook, patch: one guarded
    /// sequence from the caller's point of view.
    #[track_caller]
    fn re_patch_any(&self, mutate: impl FnOnce(&mut MockBuilder)) -> &Self {
        let site = Location::caller();
        self.unpatch();
        {
            let mut inner = self.lock();
            mutate(&mut inner.builder);
        }
        if let Err(e) = self.try_patch_at(site) {
            panic!("remock: {e}");
        }
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_patch_at(&self, site: &Location<'_>) -> Result<(), MockError> {
        let mut inner = self.lock();
        if inner.record.as_ref().is_some_and(PatchRecord::is_active) {
            return Ok(());
        }

        let b = &inner.builder;
        let (generic, method) = resolve_classification(b)?;
        let descriptor = TargetDescriptor {
            addr: b.target,
            shape: b.shape.clone(),
            generic,
            method,
        };
        let adapter = Adapter::new(&b.shape, generic, method, b.abi);
        let extended = adapter.extended_shape().clone();
        if extended.arity() > arch::MAX_REG_ARGS {
            return Err(MockError::ShapeTooWide {
                shape: extended.to_string(),
                max: arch::MAX_REG_ARGS,
            });
        }

        // Generic instantiations dispatch through a short shim; the patch
        // must land on the real body behind its single call.
        let base = if generic {
            let window =
                unsafe { std::slice::from_raw_parts(b.target as *const u8, SHIM_SCAN) };
            let skip = symbol::global().copy_helper_ranges();
            arch::native().locate_indirect_target(window, b.target, &skip)?
        } else {
            b.target
        };

        // Reserve before any memory mutation so a re-mock fails cleanly.
        let me = self.weak_self.upgrade().expect("mocker alive during patch");
        let site_str = format!("{}:{}", site.file(), site.line());
        self.registry.reserve(base, me, site_str)?;

        let compiled = match compile_state(b, &adapter) {
            Ok(s) => s,
            Err(e) => {
                self.registry.deregister(base);
                return Err(e);
            }
        };
        let state = Arc::new(compiled);
        let state_raw = Arc::into_raw(state.clone()) as usize;

        let stub = with_arena(|arena| {
            let h = arena.alloc()?;
            arena.write(h, |buf| {
                arch::native().emit_dispatch_stub(buf, state_raw, dispatcher_addr())
            });
            if let Err(e) = arena.seal(h) {
                arena.free(h);
                return Err(e);
            }
            Ok(h)
        });
        let stub = match stub {
            Ok(h) => h,
            Err(e) => {
                release_state_raw(state_raw);
                self.registry.deregister(base);
                return Err(e);
            }
        };
        let stub_entry = with_arena(|arena| arena.entry(stub));

        let record = match patcher::apply(base, stub_entry, b.unsafe_mode) {
            Ok(r) => r,
            Err(e) => {
                with_arena(|arena| arena.free(stub));
                release_state_raw(state_raw);
                self.registry.deregister(base);
                return Err(e);
            }
        };

        state.proxy_entry.store(record.proxy_entry(), Ordering::Release);
        if let Some((cell, tf)) = &state.origin {
            cell.bind(record.proxy_entry(), extended.clone(), tf.clone());
        }

        log::debug!(
            "mock patched: target={:#x} base={:#x} extended={} generic={} method={}",
            descriptor.addr,
            base,
            extended,
            generic,
            method
        );

        inner.descriptor = Some(descriptor);
        inner.state = Some(state);
        inner.state_raw = state_raw;
        inner.stub = Some(stub);
        inner.record = Some(record);
        inner.base = base;
        Ok(())
    }

    fn try_unpatch(&self) -> Result<(), MockError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(record) = inner.record.as_mut() else {
            return Ok(());
        };
        if !record.is_active() {
            return Ok(());
        }

        patcher::unpatch(record)?;
        if let Some(stub) = inner.stub.take() {
            with_arena(|arena| arena.free(stub));
        }
        if let Some(state) = inner.state.take() {
            if let Some((cell, _)) = &state.origin {
                cell.unbind();
            }
            // In-flight dispatches on other tasks may still hold the state;
            // retire it instead of dropping the last reference here.
            retire_state(state);
        }
        release_state_raw(inner.state_raw);
        inner.state_raw = 0;
        inner.record = None;

        let base = inner.base;
        drop(guard);
        self.registry.deregister(base);
        log::debug!("mock unpatched: base={base:#x}");
        Ok(())
    }
}

impl Drop for Mocker {
    fn drop(&mut self) {
        // Registered mocks are kept alive by their registry; an unreferenced
        // patched mock would leave an orphan patch, so revert it.
        let _ = self.try_unpatch();
    }
}

fn release_state_raw(raw: usize) {
    if raw != 0 {
        unsafe { drop(Arc::from_raw(raw as *const HookState)) };
    }
}

/// States from unpatched mocks, kept alive for the process lifetime because
/// a concurrently scheduled task may still be inside a dispatch that started
/// before the unpatch.
fn retire_state(state: Arc<HookState>) {
    static RETIRED: OnceLock<Mutex<Vec<Arc<HookState>>>> = OnceLock::new();
    RETIRED
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(state);
}

/// Explicit flags win; otherwise consult the symbol analyzer. When no symbol
/// name is resolvable the classification is only allowed to default when it
/// cannot matter — every declared input already matches the extended shape
/// exactly — otherwise the resolution failure is fatal.
fn resolve_classification(b: &MockBuilder) -> Result<(bool, bool), MockError> {
    if let Some(method) = b.method {
        return Ok((b.generic, method));
    }
    match Analyzer::new(b.target, &b.shape, &*symbol::global()) {
        Ok(a) => Ok((b.generic || a.is_generic(), a.is_method())),
        Err(e) => {
            let plain = Adapter::new(&b.shape, b.generic, false, b.abi);
            let exact = declared_inputs(b).iter().all(|(name, shape)| {
                plain
                    .input_adapter(name, shape, b.abi)
                    .map(|t| t.dropped().is_empty() || b.generic)
                    .unwrap_or(false)
            });
            if exact {
                Ok((b.generic, false))
            } else {
                Err(e)
            }
        }
    }
}

fn declared_inputs(b: &MockBuilder) -> Vec<(&'static str, Shape)> {
    let mut out = Vec::new();
    for cond in &b.conditions {
        if let Some((_, shape)) = &cond.when {
            out.push(("when", shape.clone()));
        }
        if let Some(ConditionAction::Call { shape, .. }) = &cond.action {
            out.push(("to", shape.clone()));
        }
    }
    if let Some(cell) = &b.origin {
        out.push(("origin", cell.shape().clone()));
    }
    out
}

fn compile_state(b: &MockBuilder, adapter: &Adapter) -> Result<HookState, MockError> {
    let mut clauses = Vec::with_capacity(b.conditions.len());
    for cond in &b.conditions {
        let when = match &cond.when {
            None => None,
            Some((pred, shape)) => {
                let tf = adapter.input_adapter("when", shape, b.abi)?;
                Some((pred.clone(), tf))
            }
        };
        let action = match &cond.action {
            None => CompiledAction::Passthrough,
            Some(ConditionAction::Call { hook, shape }) => {
                adapter.check_return("to", shape)?;
                let tf = adapter.input_adapter("to", shape, b.abi)?;
                CompiledAction::Call(hook.clone(), tf)
            }
            Some(ConditionAction::Return(v)) => CompiledAction::Return(*v),
            Some(ConditionAction::Seq(seq)) => CompiledAction::Seq(seq.clone()),
        };
        clauses.push(Clause { when, action });
    }

    let origin = match &b.origin {
        None => None,
        Some(cell) => {
            adapter.check_return("origin", cell.shape())?;
            let tf = adapter.reversed_input_adapter("origin", cell.shape(), b.abi)?;
            Some((cell.clone(), tf))
        }
    };

    Ok(HookState {
        extended: adapter.extended_shape().clone(),
        filter: b.filter,
        clauses,
        times: AtomicU64::new(0),
        matched: AtomicU64::new(0),
        proxy_entry: AtomicUsize::new(0),
        origin,
    })
}

#[cfg(all(
    test,
    any(target_os = "linux", target_os = "macos"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
mod tests {
    use super::*;
    use crate::lock_hook_tests;
    use crate::mock::sequence::sequence;
    use crate::symbol::{SymbolInfo, SymbolResolver};
    use crate::types::ValueKind::{Int, Ptr};

    // Targets patched by these tests. Chunky bodies keep every entry long
    // enough for the branch sequence even under aggressive codegen.
    #[inline(never)]
    extern "C" fn target_add(a: i64, b: i64) -> i64 {
        let a = std::hint::black_box(a);
        let x = a.wrapping_mul(3).wrapping_add(b);
        let y = x.wrapping_sub(a.wrapping_mul(2));
        std::hint::black_box(y)
    }

    #[inline(never)]
    extern "C" fn target_double(a: i64) -> i64 {
        let a = std::hint::black_box(a);
        let x = a.wrapping_shl(1);
        std::hint::black_box(x.wrapping_add(a).wrapping_sub(a))
    }

    struct Counter {
        calls: std::sync::atomic::AtomicU64,
    }

    #[inline(never)]
    extern "C" fn counter_bump(recv: *const Counter, delta: i64) -> i64 {
        let recv = std::hint::black_box(recv);
        let c = unsafe { &*recv };
        let prev = c.calls.fetch_add(delta as u64, Ordering::Relaxed);
        std::hint::black_box(prev as i64)
    }

    fn int_shape(arity: usize) -> Shape {
        Shape::new(&vec![Int; arity], Int)
    }

    fn call2(f: extern "C" fn(i64, i64) -> i64, a: i64, b: i64) -> i64 {
        std::hint::black_box(f)(std::hint::black_box(a), std::hint::black_box(b))
    }

    fn call1(f: extern "C" fn(i64) -> i64, a: i64) -> i64 {
        std::hint::black_box(f)(std::hint::black_box(a))
    }

    #[test]
    fn fixed_return_and_restore() {
        let _g = lock_hook_tests();

        assert_eq!(call2(target_add, 3, 4), 7);
        let before =
            unsafe { std::slice::from_raw_parts(target_add as *const u8, 24) }.to_vec();

        let reg = ScopeRegistry::new();
        let m = mock(target_add as usize, int_shape(2))
            .returns(Value::Int(42))
            .build_in(&reg);

        assert_eq!(call2(target_add, 3, 4), 42);
        assert_eq!(call2(target_add, 9, 9), 42);
        assert_eq!(m.times(), 2);
        assert_eq!(m.matched_times(), 2);

        m.unpatch();
        let after =
            unsafe { std::slice::from_raw_parts(target_add as *const u8, 24) }.to_vec();
        assert_eq!(before, after, "entry bytes must be restored exactly");
        assert_eq!(call2(target_add, 3, 4), 7);
    }

    #[test]
    fn predicate_gates_the_action() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        let m = mock(target_double as usize, int_shape(1))
            .when(|args| args[0].as_int() < 0)
            .returns(Value::Int(-1))
            .build_in(&reg);

        assert_eq!(call1(target_double, -5), -1);
        assert_eq!(call1(target_double, 5), 10);
        assert_eq!(call1(target_double, -2), -1);
        assert_eq!(m.times(), 3);
        assert_eq!(m.matched_times(), 2);
        m.unpatch();
    }

    #[test]
    fn hook_with_origin_wraps_original() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        let origin = OriginHandle::new(int_shape(2));
        let o = origin.clone();
        let m = mock(target_add as usize, int_shape(2))
            .to(move |args| {
                let real = o.call(args).as_int();
                Value::Int(real + 1000)
            })
            .origin(&origin)
            .build_in(&reg);

        assert_eq!(call2(target_add, 3, 4), 1007);
        assert_eq!(m.matched_times(), 1);
        m.unpatch();
        assert_eq!(call2(target_add, 3, 4), 7);
    }

    #[test]
    fn first_matching_clause_wins() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        let m = mock(target_double as usize, int_shape(1))
            .when(|args| args[0].as_int() > 0)
            .returns(Value::Int(1))
            .when(|args| args[0].as_int() > 10)
            .returns(Value::Int(2))
            .build_in(&reg);

        // Both predicates match for 50; only the first action runs.
        assert_eq!(call1(target_double, 50), 1);
        assert_eq!(m.matched_times(), 1);
        // Only the second would match nothing below zero.
        assert_eq!(call1(target_double, -3), -6);
        assert_eq!(m.times(), 2);
        assert_eq!(m.matched_times(), 1);
        m.unpatch();
    }

    #[test]
    fn sequences_cycle_across_matched_calls() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        let m = mock(target_double as usize, int_shape(1))
            .sequence(sequence(Value::Int(10)).times(2).then(Value::Int(20)))
            .build_in(&reg);

        let got: Vec<i64> = (0..7).map(|_| call1(target_double, 0)).collect();
        assert_eq!(got, vec![10, 10, 20, 10, 10, 20, 10]);
        m.unpatch();
    }

    #[test]
    fn patch_and_unpatch_are_idempotent() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        let m = mock(target_double as usize, int_shape(1))
            .returns(Value::Int(5))
            .build_in(&reg);

        m.patch().patch();
        assert_eq!(call1(target_double, 2), 5);
        assert_eq!(m.times(), 1);

        m.unpatch().unpatch();
        assert_eq!(call1(target_double, 2), 4);
        assert_eq!(m.times(), 0, "counters reset on unpatch");

        // A fresh patch works after the cycle.
        m.patch();
        assert_eq!(call1(target_double, 2), 5);
        m.unpatch();
    }

    #[test]
    fn remock_is_rejected_before_any_mutation() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        let m = mock(target_double as usize, int_shape(1))
            .returns(Value::Int(5))
            .build_in(&reg);

        let bytes_patched =
            unsafe { std::slice::from_raw_parts(target_double as *const u8, 24) }.to_vec();

        let err = mock(target_double as usize, int_shape(1))
            .returns(Value::Int(6))
            .try_build_in(&reg)
            .unwrap_err();
        match &err {
            MockError::AlreadyMocked { site, .. } => {
                assert!(site.contains("mod.rs"), "prior site recorded: {site}");
            }
            other => panic!("expected AlreadyMocked, got {other}"),
        }

        // The failed attempt must not have touched the patched entry.
        let bytes_after =
            unsafe { std::slice::from_raw_parts(target_double as *const u8, 24) }.to_vec();
        assert_eq!(bytes_patched, bytes_after);
        assert_eq!(call1(target_double, 2), 5, "first mock still active");
        m.unpatch();
    }

    #[test]
    fn scopes_isolate_nested_mocks() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        reg.enter_scope("outer", || {
            let outer = mock(target_add as usize, int_shape(2))
                .returns(Value::Int(100))
                .build_in(&reg);
            assert_eq!(call2(target_add, 1, 1), 100);

            reg.enter_scope("inner", || {
                let _inner = mock(target_double as usize, int_shape(1))
                    .returns(Value::Int(200))
                    .build_in(&reg);
                assert_eq!(call1(target_double, 1), 200);
            });

            // Inner scope reverted its mock, outer one survives.
            assert_eq!(call1(target_double, 1), 2);
            assert_eq!(call2(target_add, 1, 1), 100);
            assert!(outer.is_patched());
        });

        assert_eq!(call2(target_add, 1, 1), 2);
        assert_eq!(call1(target_double, 1), 2);
    }

    #[test]
    fn unpatch_all_clears_current_scope_only() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        reg.enter_scope("outer", || {
            let outer = mock(target_add as usize, int_shape(2))
                .returns(Value::Int(100))
                .build_in(&reg);

            reg.enter_scope("inner", || {
                let inner = mock(target_double as usize, int_shape(1))
                    .returns(Value::Int(200))
                    .build_in(&reg);

                reg.unpatch_all();
                assert!(!inner.is_patched());
                assert_eq!(call1(target_double, 1), 2);
                assert!(outer.is_patched(), "outer scope untouched");

                // The scope is still open: the target can be mocked again.
                let again = mock(target_double as usize, int_shape(1))
                    .returns(Value::Int(300))
                    .build_in(&reg);
                assert_eq!(call1(target_double, 1), 300);
                again.unpatch();
            });

            outer.unpatch();
        });
    }

    #[test]
    fn context_filter_include_only_mocks_this_task() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        let m = mock(target_double as usize, int_shape(1))
            .returns(Value::Int(77))
            .include_current_context()
            .build_in(&reg);

        assert_eq!(call1(target_double, 4), 77);

        let other = std::thread::spawn(|| call1(target_double, 4)).join().unwrap();
        assert_eq!(other, 8, "other tasks reach the original");

        assert_eq!(m.times(), 2, "filtered calls still count invocations");
        assert_eq!(m.matched_times(), 1);
        m.unpatch();
    }

    #[test]
    fn context_filter_exclude_bypasses_this_task() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        let m = mock(target_double as usize, int_shape(1))
            .returns(Value::Int(88))
            .exclude_current_context()
            .build_in(&reg);

        assert_eq!(call1(target_double, 4), 8);
        let other = std::thread::spawn(|| call1(target_double, 4)).join().unwrap();
        assert_eq!(other, 88);
        m.unpatch();
    }

    #[test]
    fn concurrent_calls_count_exactly() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        let m = mock(target_add as usize, int_shape(2))
            .when(|args| args[0].as_int() % 2 == 0)
            .returns(Value::Int(0))
            .build_in(&reg);

        let threads: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    for i in 0..250i64 {
                        let expected = if i % 2 == 0 { 0 } else { i + 7 };
                        assert_eq!(call2(target_add, i, 7), expected);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(m.times(), 1000);
        assert_eq!(m.matched_times(), 500);
        m.unpatch();
    }

    #[test]
    fn method_hooks_may_omit_the_receiver() {
        let _g = lock_hook_tests();

        let counter = Counter { calls: std::sync::atomic::AtomicU64::new(5) };
        let shape = Shape::new(&[Ptr, Int], Int);

        let reg = ScopeRegistry::new();
        let m = mock(counter_bump as usize, shape)
            .method(true)
            .when_shaped(&[Int], |args| args[0].as_int() == 0)
            .to_shaped(int_shape(1), |args| Value::Int(args[0].as_int() - 100))
            .build_in(&reg);

        let f: extern "C" fn(*const Counter, i64) -> i64 = counter_bump;
        let f = std::hint::black_box(f);

        // delta == 0 matches: the hook sees only the shifted user argument.
        assert_eq!(f(&counter, 0), -100);
        // Non-matching calls reach the original, which mutates the receiver.
        assert_eq!(f(&counter, 3), 5);
        assert_eq!(counter.calls.load(Ordering::Relaxed), 8);

        assert_eq!(m.times(), 2);
        assert_eq!(m.matched_times(), 1);
        m.unpatch();
    }

    #[test]
    fn method_origin_forwards_captured_receiver() {
        let _g = lock_hook_tests();

        let counter = Counter { calls: std::sync::atomic::AtomicU64::new(0) };
        let shape = Shape::new(&[Ptr, Int], Int);

        let reg = ScopeRegistry::new();
        let origin = OriginHandle::new(int_shape(1));
        let o = origin.clone();
        let m = mock(counter_bump as usize, shape)
            .method(true)
            .to_shaped(int_shape(1), move |args| {
                // Call the original with the receiver captured from this
                // invocation, doubling the delta.
                o.call(&[Value::Int(args[0].as_int() * 2)])
            })
            .origin(&origin)
            .build_in(&reg);

        let f: extern "C" fn(*const Counter, i64) -> i64 = counter_bump;
        let f = std::hint::black_box(f);
        assert_eq!(f(&counter, 3), 0);
        assert_eq!(counter.calls.load(Ordering::Relaxed), 6, "origin hit the real receiver");
        m.unpatch();
    }

    #[test]
    fn in_place_mutators_rebuild_the_patch() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        let m = mock(target_double as usize, int_shape(1))
            .returns(Value::Int(1))
            .build_in(&reg);

        assert_eq!(call1(target_double, 3), 1);
        m.returns(Value::Int(2));
        assert_eq!(call1(target_double, 3), 2);
        m.when(|args| args[0].as_int() > 0);
        assert_eq!(call1(target_double, 3), 2);
        assert_eq!(call1(target_double, -3), -6);
        m.unpatch();
    }

    #[test]
    fn release_resets_the_condition_chain() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        let m = mock(target_double as usize, int_shape(1))
            .when(|args| args[0].as_int() > 0)
            .returns(Value::Int(1))
            .when(|args| args[0].as_int() < 0)
            .returns(Value::Int(2))
            .build_in(&reg);

        assert_eq!(call1(target_double, 1), 1);
        assert_eq!(call1(target_double, -1), 2);

        m.release();
        assert_eq!(call1(target_double, 1), 2, "released mock reverts to original");

        // A released mock is single-clause again and accepts mutators.
        m.patch();
        m.returns(Value::Int(9));
        assert_eq!(call1(target_double, 1), 9);
        m.unpatch();
    }

    #[test]
    fn shape_mismatch_fails_at_build_time() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        let err = mock(target_add as usize, int_shape(2))
            .method(false)
            .when_shaped(&[Int, Int, Int], |_| true)
            .returns(Value::Int(0))
            .try_build_in(&reg)
            .unwrap_err();
        assert!(matches!(err, MockError::ShapeMismatch { .. }), "got {err}");

        // Nothing was patched by the failed build.
        assert_eq!(call2(target_add, 3, 4), 7);
    }

    #[test]
    fn too_wide_shapes_are_rejected() {
        let _g = lock_hook_tests();

        let reg = ScopeRegistry::new();
        let err = mock(target_add as usize, int_shape(9))
            .method(false)
            .returns(Value::Int(0))
            .try_build_in(&reg)
            .unwrap_err();
        assert!(matches!(err, MockError::ShapeTooWide { .. }), "got {err}");
    }

    #[test]
    #[should_panic(expected = "does not match target return")]
    fn wrong_return_kind_is_rejected_at_declaration() {
        let _ = mock(target_add as usize, int_shape(2)).returns(Value::Bool(true));
    }

    struct StubResolver {
        addr: usize,
        name: String,
    }

    impl SymbolResolver for StubResolver {
        fn resolve(&self, addr: usize) -> Option<SymbolInfo> {
            (addr == self.addr)
                .then(|| SymbolInfo { name: self.name.clone(), entry: self.addr })
        }
        fn copy_helper_ranges(&self) -> Vec<std::ops::Range<usize>> {
            Vec::new()
        }
    }

    #[test]
    fn analyzer_classifies_methods_from_symbol_names() {
        let _g = lock_hook_tests();

        let prev = symbol::global();
        symbol::set_global(Arc::new(StubResolver {
            addr: counter_bump as usize,
            name: "demo::Counter::bump".into(),
        }));

        let counter = Counter { calls: std::sync::atomic::AtomicU64::new(0) };
        let reg = ScopeRegistry::new();
        // No explicit method flag: the analyzer resolves it from the name,
        // allowing the receiver-omitting hook shape.
        let m = mock(counter_bump as usize, Shape::new(&[Ptr, Int], Int))
            .to_shaped(int_shape(1), |args| Value::Int(args[0].as_int() + 40))
            .build_in(&reg);

        let f: extern "C" fn(*const Counter, i64) -> i64 = counter_bump;
        assert_eq!(std::hint::black_box(f)(&counter, 2), 42);

        m.unpatch();
        symbol::set_global(prev);
    }

    // ── Generic dispatch shim end-to-end ─────────────────────────────

    /// Synthetic descriptor constant passed by the shim.
    const DESC: u64 = 0x5EED;

    /// Build a body with the extended shape (descriptor, x) -> x + c and a
    /// shim with the visible shape (x) -> body(DESC, x), the shim calling
    /// the body through a single direct call the scanner can resolve.
    fn build_generic_pair(c: u32) -> (usize, usize) {
        use crate::code::arena::with_arena;

        with_arena(|arena| {
            let body = arena.alloc().expect("body alloc");
            let body_entry = arena.entry(body);
            arena.write(body, |buf| {
                #[cfg(target_arch = "x86_64")]
                {
                    // mov rax, rsi; add rax, c; nop sled; ret — the sled
                    // keeps the entry long enough for the branch sequence.
                    let mut n = 0;
                    buf[n..n + 3].copy_from_slice(&[0x48, 0x89, 0xF0]);
                    n += 3;
                    buf[n..n + 3].copy_from_slice(&[0x48, 0x81, 0xC0]);
                    n += 3;
                    buf[n..n + 4].copy_from_slice(&c.to_le_bytes());
                    n += 4;
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
                    // add x0, x1, #c; nop sled; ret; nop padding
                    let insns = [
                        0x9100_0020u32 | (c & 0xFFF) << 10,
                        0xD503_201F,
                        0xD503_201F,
                        0xD503_201F,
                        0xD65F_03C0,
                        0xD503_201F,
                        0xD503_201F,
                        0xD503_201F,
                        0xD503_201F,
                        0xD503_201F,
                        0xD503_201F,
                        0xD503_201F,
                    ];
                    for (i, insn) in insns.iter().enumerate() {
                        buf[i * 4..i * 4 + 4].copy_from_slice(&insn.to_le_bytes());
                    }
                    insns.len() * 4
                }
            });
            arena.seal(body).expect("seal body");

            let shim = arena.alloc().expect("shim alloc");
            let shim_entry = arena.entry(shim);
            arena.write(shim, |buf| {
                #[cfg(target_arch = "x86_64")]
                {
                    use crate::arch::x86_64::writer::{Reg, Writer};
                    let mut w = Writer::new(buf);
                    // Shift the user argument, load the descriptor, call the
                    // body with a rel32 call so the shim scan resolves it.
                    w.mov_reg_reg(Reg::RSI, Reg::RDI);
                    w.mov_reg_imm64(Reg::RDI, DESC);
                    let call_pc = shim_entry + w.len();
                    let rel = body_entry as i64 - (call_pc as i64 + 5);
                    w.bytes(&[0xE8]);
                    w.bytes(&(rel as i32).to_le_bytes());
                    w.ret();
                    w.len()
                }
                #[cfg(target_arch = "aarch64")]
                {
                    use crate::arch::arm64::writer::{Reg, Writer};
                    let mut w = Writer::new(buf);
                    w.stp_push(Reg::X29, Reg::X30);
                    w.mov_reg(Reg::X1, Reg::X0);
                    w.mov_imm64(Reg::X0, DESC);
                    let bl_pc = shim_entry + w.len();
                    let imm26 =
                        ((body_entry as i64 - bl_pc as i64) >> 2) as u32 & 0x03FF_FFFF;
                    let mut insn_buf = [0u8; 4];
                    insn_buf.copy_from_slice(&(0x9400_0000u32 | imm26).to_le_bytes());
                    let n = w.len();
                    buf[n..n + 4].copy_from_slice(&insn_buf);
                    let mut w = Writer::new(&mut buf[n + 4..]);
                    w.ldp_pop(Reg::X29, Reg::X30);
                    w.ret();
                    n + 4 + w.len()
                }
            });
            arena.seal(shim).expect("seal shim");

            (shim_entry, body_entry)
        })
    }

    #[test]
    fn generic_targets_patch_through_the_dispatch_shim() {
        let _g = lock_hook_tests();

        let (shim, body) = build_generic_pair(10);
        let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(shim) };
        assert_eq!(std::hint::black_box(f)(5), 15, "shim forwards to the body");

        let reg = ScopeRegistry::new();
        // The author mocks the instantiation address with the visible shape;
        // the engine resolves the real body behind the shim.
        let m = mock(shim, int_shape(1))
            .generic()
            .method(false)
            .to_shaped(int_shape(1), |args| Value::Int(args[0].as_int() + 1000))
            .build_in(&reg);

        let base = m.descriptor().map(|d| d.addr);
        assert_eq!(base, Some(shim));
        assert_eq!(std::hint::black_box(f)(5), 1005, "calls through the shim are mocked");

        m.unpatch();
        assert_eq!(std::hint::black_box(f)(5), 15);

        // A with-both hook observes the hidden descriptor the shim passes.
        let m = mock(shim, int_shape(1))
            .generic()
            .method(false)
            .to_shaped(Shape::new(&[Ptr, Int], Int), |args| {
                assert_eq!(args[0].as_ptr(), DESC as usize);
                Value::Int(args[1].as_int() + 2000)
            })
            .build_in(&reg);
        assert_eq!(std::hint::black_box(f)(5), 2005);
        m.unpatch();

        // Keep the body alive for the duration of the test.
        let _ = body;
    }

    #[test]
    fn origin_through_generic_shim_reaches_the_body() {
        let _g = lock_hook_tests();

        let (shim, _body) = build_generic_pair(3);
        let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(shim) };

        let reg = ScopeRegistry::new();
        let origin = OriginHandle::new(int_shape(1));
        let o = origin.clone();
        let m = mock(shim, int_shape(1))
            .generic()
            .method(false)
            .to_shaped(int_shape(1), move |args| {
                Value::Int(o.call(args).as_int() * 10)
            })
            .origin(&origin)
            .build_in(&reg);

        // body(5) = 8, hook multiplies by 10.
        assert_eq!(std::hint::black_box(f)(5), 80);
        m.unpatch();
        assert_eq!(std::hint::black_box(f)(5), 8);
    }
}
