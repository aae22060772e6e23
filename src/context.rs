//! Stable identity for the currently running task.
//!
//! Ids are assigned once per thread from a process-wide counter, so they are
//! stable for the thread's lifetime and never reused within a process.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TASK_ID: u64 = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
}

/// Id of the calling task.
pub fn current_task_id() -> u64 {
    TASK_ID.with(|id| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_within_a_thread() {
        assert_eq!(current_task_id(), current_task_id());
    }

    #[test]
    fn ids_differ_across_threads() {
        let here = current_task_id();
        let there = std::thread::spawn(current_task_id).join().unwrap();
        assert_ne!(here, there);
    }
}
