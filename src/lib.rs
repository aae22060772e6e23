//! remock: runtime function interception and mocking.
//!
//! Redirects compiled functions to author-supplied behavior at runtime by
//! rewriting their entry bytes, keeps the original behavior callable through
//! a relocated proxy, and restores everything byte-for-byte on unpatch.
//! Interceptions are tracked in nested scopes so test teardown is automatic.
//!
//! ```no_run
//! use remock::{mock, Shape, Value, ValueKind};
//!
//! extern "C" fn fetch_limit(region: i64) -> i64 {
//!     region * 100
//! }
//!
//! let shape = Shape::new(&[ValueKind::Int], ValueKind::Int);
//! let m = mock(fetch_limit as usize, shape)
//!     .when(|args| args[0].as_int() == 7)
//!     .returns(Value::Int(1))
//!     .build();
//!
//! assert_eq!(fetch_limit(7), 1);
//! assert_eq!(fetch_limit(8), 800);
//! m.unpatch();
//! assert_eq!(fetch_limit(7), 700);
//! ```

pub mod adapt;
pub mod analyze;
pub mod arch;
pub mod code;
pub mod context;
pub mod mock;
pub mod scope;
pub mod symbol;
pub mod types;

pub use adapt::{AbiRevision, DescriptorPlacement, CURRENT_ABI};
pub use mock::sequence::{sequence, Sequence};
pub use mock::{mock, MockBuilder, Mocker, OriginHandle};
pub use scope::{enter_scope, unpatch_all, ScopeRegistry};
pub use types::{FilterMode, MockError, Shape, TargetDescriptor, Value, ValueKind};

/// Process-global lock for tests that modify executable code.
///
/// Tests patching functions must hold this lock so concurrent test threads
/// never patch overlapping code or race the arena against a live call.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
