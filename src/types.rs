//! Shared data model: argument values, call shapes, filter modes, errors.

use std::fmt;

use thiserror::Error;

/// Kind tag for a single parameter or return slot.
///
/// Only integer-class, register-passed kinds are representable. Every kind
/// occupies exactly one machine word in the physical call frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Unit,
    Bool,
    Int,
    Uint,
    Ptr,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::Unit => "unit",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Uint => "uint",
            ValueKind::Ptr => "ptr",
        };
        f.write_str(s)
    }
}

/// A tagged argument or return value with a one-word physical representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Ptr(usize),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Unit => ValueKind::Unit,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Uint(_) => ValueKind::Uint,
            Value::Ptr(_) => ValueKind::Ptr,
        }
    }

    /// Raw machine word as passed in an argument or return register.
    pub(crate) fn to_word(self) -> u64 {
        match self {
            Value::Unit => 0,
            Value::Bool(b) => b as u64,
            Value::Int(v) => v as u64,
            Value::Uint(v) => v,
            Value::Ptr(p) => p as u64,
        }
    }

    pub(crate) fn from_word(kind: ValueKind, word: u64) -> Value {
        match kind {
            ValueKind::Unit => Value::Unit,
            ValueKind::Bool => Value::Bool(word & 1 != 0),
            ValueKind::Int => Value::Int(word as i64),
            ValueKind::Uint => Value::Uint(word),
            ValueKind::Ptr => Value::Ptr(word as usize),
        }
    }

    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(v) => *v,
            other => panic!("value is {}, not int", other.kind()),
        }
    }

    pub fn as_uint(&self) -> u64 {
        match self {
            Value::Uint(v) => *v,
            other => panic!("value is {}, not uint", other.kind()),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(v) => *v,
            other => panic!("value is {}, not bool", other.kind()),
        }
    }

    pub fn as_ptr(&self) -> usize {
        match self {
            Value::Ptr(v) => *v,
            other => panic!("value is {}, not ptr", other.kind()),
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Value::Unit)
    }
}

/// Declared call shape of a function: parameter kinds plus a return kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    params: Vec<ValueKind>,
    ret: ValueKind,
}

impl Shape {
    pub fn new(params: &[ValueKind], ret: ValueKind) -> Shape {
        Shape { params: params.to_vec(), ret }
    }

    pub fn params(&self) -> &[ValueKind] {
        &self.params
    }

    pub fn ret(&self) -> ValueKind {
        self.ret
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Shape with `kind` inserted as a parameter at `index`.
    pub(crate) fn with_param_at(&self, index: usize, kind: ValueKind) -> Shape {
        let mut params = self.params.clone();
        params.insert(index, kind);
        Shape { params, ret: self.ret }
    }

    /// Shape with the parameters at `dropped` (sorted indices) removed.
    pub(crate) fn without_params(&self, dropped: &[usize]) -> Shape {
        let params = self
            .params
            .iter()
            .enumerate()
            .filter(|(i, _)| !dropped.contains(i))
            .map(|(_, k)| *k)
            .collect();
        Shape { params, ret: self.ret }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Execution-context filter mode for a mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    #[default]
    Disabled,
    Include,
    Exclude,
}

/// Identity of an intercepted function once classification is resolved.
#[derive(Debug, Clone)]
pub struct TargetDescriptor {
    pub addr: usize,
    pub shape: Shape,
    pub generic: bool,
    pub method: bool,
}

/// Engine failure. Every variant is fatal for the author-facing surface:
/// an inconsistent intercept state risks executing corrupted code, so the
/// public builder and mutators abort with the diagnostic instead of
/// propagating.
#[derive(Debug, Error)]
pub enum MockError {
    #[error("signature mismatch: target {target} is not adaptable to {input_name} {input}")]
    ShapeMismatch {
        target: String,
        input_name: String,
        input: String,
    },

    #[error("target {addr:#x} is already mocked (previous mock at {site})")]
    AlreadyMocked { addr: usize, site: String },

    #[error("undecodable instruction at entry offset {offset}")]
    Disassembly { offset: usize },

    #[error("function is too short to patch (enable unsafe mode to override)")]
    FunctionTooShort,

    #[error("generic dispatch scan expected exactly one call target, found {count}")]
    IndirectTarget { count: usize },

    #[error("no symbol information for address {addr:#x}")]
    SymbolResolution { addr: usize },

    #[error("call shape {shape} exceeds the register-argument envelope ({max} args)")]
    ShapeTooWide { shape: String, max: usize },

    #[error("executable arena allocation failed")]
    ArenaExhausted,

    #[error("memory protection change failed at {addr:#x}")]
    ProtectFailed { addr: usize },

    #[error("unsupported architecture or platform")]
    Unsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_word_round_trip() {
        let cases = [
            Value::Unit,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(-7),
            Value::Uint(u64::MAX),
            Value::Ptr(0xDEAD_BEEF),
        ];
        for v in cases {
            let w = v.to_word();
            assert_eq!(Value::from_word(v.kind(), w), v);
        }
    }

    #[test]
    fn shape_display_reads_naturally() {
        let s = Shape::new(&[ValueKind::Int, ValueKind::Ptr], ValueKind::Bool);
        assert_eq!(s.to_string(), "fn(int, ptr) -> bool");
    }

    #[test]
    fn shape_param_insert_and_drop() {
        let s = Shape::new(&[ValueKind::Int], ValueKind::Unit);
        let ext = s.with_param_at(0, ValueKind::Ptr);
        assert_eq!(ext.params(), &[ValueKind::Ptr, ValueKind::Int]);
        assert_eq!(ext.without_params(&[0]), s);
    }
}
