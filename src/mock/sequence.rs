//! Ordered multi-call return scripts.
//!
//! A sequence cycles through pre-declared (value, repeat-count) pairs across
//! successive matched calls, wrapping back to the first entry after the last
//! one is exhausted.

use std::sync::Mutex;

use crate::types::Value;

#[derive(Debug)]
struct Entry {
    value: Value,
    times: usize,
}

#[derive(Debug)]
struct State {
    entries: Vec<Entry>,
    cur: usize,
    used: usize,
}

/// A return script: `sequence(a).times(2).then(b)` yields a, a, b, a, a, b…
#[derive(Debug)]
pub struct Sequence {
    state: Mutex<State>,
}

/// Start a sequence with its first value (repeat count 1 until `times`).
pub fn sequence(value: Value) -> Sequence {
    Sequence {
        state: Mutex::new(State { entries: vec![Entry { value, times: 1 }], cur: 0, used: 0 }),
    }
}

impl Sequence {
    /// Set the repeat count of the most recently added value.
    pub fn times(self, n: usize) -> Sequence {
        assert!(n > 0, "remock: sequence repeat count must be positive");
        {
            let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
            s.entries.last_mut().unwrap().times = n;
        }
        self
    }

    /// Append the next value (repeat count 1 until `times`).
    pub fn then(self, value: Value) -> Sequence {
        {
            let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
            s.entries.push(Entry { value, times: 1 });
        }
        self
    }

    /// Kinds of every declared value, for build-time return validation.
    pub(crate) fn value_kinds(&self) -> Vec<crate::types::ValueKind> {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.entries.iter().map(|e| e.value.kind()).collect()
    }

    /// Value for the next matched call.
    pub(crate) fn next(&self) -> Value {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let value = s.entries[s.cur].value;
        s.used += 1;
        if s.used >= s.entries[s.cur].times {
            s.used = 0;
            s.cur = (s.cur + 1) % s.entries.len();
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_through_declared_values() {
        let seq = sequence(Value::Int(1)).times(2).then(Value::Int(2));
        let got: Vec<i64> = (0..8).map(|_| seq.next().as_int()).collect();
        assert_eq!(got, vec![1, 1, 2, 1, 1, 2, 1, 1]);
    }

    #[test]
    fn single_value_repeats_forever() {
        let seq = sequence(Value::Uint(9));
        for _ in 0..5 {
            assert_eq!(seq.next().as_uint(), 9);
        }
    }

    #[test]
    fn trailing_times_applies_to_last_value() {
        let seq = sequence(Value::Int(1)).then(Value::Int(2)).times(3);
        let got: Vec<i64> = (0..8).map(|_| seq.next().as_int()).collect();
        assert_eq!(got, vec![1, 2, 2, 2, 1, 2, 2, 2]);
    }

    #[test]
    #[should_panic(expected = "repeat count")]
    fn zero_repeat_count_is_rejected() {
        let _ = sequence(Value::Int(1)).times(0);
    }
}
