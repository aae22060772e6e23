//! Calling-convention adapter.
//!
//! A target's physical ("extended") parameter list may carry hidden leading
//! parameters the author's hook omits: a receiver for methods and an opaque
//! type-descriptor for generic instantiations. The adapter computes the
//! extended shape and builds the forward/reverse argument-list transforms
//! between it and the simpler shapes test authors write.

use crate::types::{MockError, Shape, Value, ValueKind};

/// Where the hidden generic descriptor sits for a *method* target. Plain
/// generic functions always carry it at position 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorPlacement {
    /// Descriptor precedes the receiver (older ABI generations).
    BeforeReceiver,
    /// Descriptor directly follows the receiver (current ABI generations).
    AfterReceiver,
}

/// Host-runtime ABI revision. The hidden-parameter offset has changed across
/// observed revisions, so it is looked up in a table rather than hardcoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiRevision(pub u32);

pub const ABI_PLACEMENTS: &[(AbiRevision, DescriptorPlacement)] = &[
    (AbiRevision(1), DescriptorPlacement::BeforeReceiver),
    (AbiRevision(2), DescriptorPlacement::AfterReceiver),
];

pub const CURRENT_ABI: AbiRevision = AbiRevision(2);

pub fn descriptor_placement(rev: AbiRevision) -> DescriptorPlacement {
    ABI_PLACEMENTS
        .iter()
        .find(|(r, _)| *r == rev)
        .map(|(_, p)| *p)
        .unwrap_or(DescriptorPlacement::AfterReceiver)
}

/// A resolved argument-list transform between the extended shape and one
/// author-facing input shape. `dropped` holds the extended-parameter indices
/// the input omits, in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterTransform {
    dropped: Vec<usize>,
    input: Shape,
}

impl AdapterTransform {
    pub fn input_shape(&self) -> &Shape {
        &self.input
    }

    pub fn dropped(&self) -> &[usize] {
        &self.dropped
    }

    /// Extended argument list → the input shape's argument list.
    pub fn forward(&self, extended: &[Value]) -> Vec<Value> {
        extended
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.dropped.contains(i))
            .map(|(_, v)| *v)
            .collect()
    }

    /// The hidden values the input omits, in extended order. Captured per
    /// invocation so the reverse transform can restore them.
    pub fn extras_of(&self, extended: &[Value]) -> Vec<Value> {
        self.dropped.iter().map(|&i| extended[i]).collect()
    }

    /// Input argument list + captured extras → extended argument list.
    pub fn reverse(&self, input: &[Value], extras: &[Value]) -> Vec<Value> {
        debug_assert_eq!(extras.len(), self.dropped.len());
        let mut out: Vec<Value> = input.to_vec();
        for (slot, &idx) in self.dropped.iter().enumerate() {
            out.insert(idx, extras[slot]);
        }
        out
    }
}

/// Computes extended shapes and input transforms for one target.
#[derive(Debug, Clone)]
pub struct Adapter {
    target: Shape,
    extended: Shape,
    generic: bool,
    method: bool,
}

impl Adapter {
    pub fn new(target: &Shape, generic: bool, method: bool, rev: AbiRevision) -> Adapter {
        let extended = if generic {
            if method {
                match descriptor_placement(rev) {
                    DescriptorPlacement::BeforeReceiver => target.with_param_at(0, ValueKind::Ptr),
                    DescriptorPlacement::AfterReceiver => target.with_param_at(1, ValueKind::Ptr),
                }
            } else {
                target.with_param_at(0, ValueKind::Ptr)
            }
        } else {
            target.clone()
        };
        Adapter { target: target.clone(), extended, generic, method }
    }

    pub fn extended_shape(&self) -> &Shape {
        &self.extended
    }

    /// Legal drop-sets for this target, tried in order. For a generic method
    /// the four author-facing shapes are: with-both, receiver-only
    /// (descriptor dropped), descriptor-only (receiver dropped), neither.
    fn candidates(&self, rev: AbiRevision) -> Vec<Vec<usize>> {
        match (self.generic, self.method) {
            (false, false) => vec![vec![]],
            (false, true) => vec![vec![], vec![0]],
            (true, false) => vec![vec![], vec![0]],
            (true, true) => {
                let desc = match descriptor_placement(rev) {
                    DescriptorPlacement::BeforeReceiver => 0,
                    DescriptorPlacement::AfterReceiver => 1,
                };
                let recv = 1 - desc;
                vec![vec![], vec![desc], vec![recv], vec![0, 1]]
            }
        }
    }

    // Parameter lists only; returns are validated separately via
    // `check_return` so predicate shapes (bool-returning) adapt too.
    fn matches(&self, dropped: &[usize], input: &Shape) -> bool {
        self.extended.without_params(dropped).params() == input.params()
    }

    fn mismatch(&self, input_name: &str, input: &Shape) -> MockError {
        MockError::ShapeMismatch {
            target: self.target.to_string(),
            input_name: input_name.to_string(),
            input: input.to_string(),
        }
    }

    /// Transform presenting extended invocations to an input of `input`
    /// shape. Fails when no candidate drop-set reconciles the shapes.
    pub fn input_adapter(
        &self,
        input_name: &str,
        input: &Shape,
        rev: AbiRevision,
    ) -> Result<AdapterTransform, MockError> {
        for dropped in self.candidates(rev) {
            if self.matches(&dropped, input) {
                return Ok(AdapterTransform { dropped, input: input.clone() });
            }
        }
        Err(self.mismatch(input_name, input))
    }

    /// Same resolution as [`input_adapter`], used where the caller intends to
    /// run the transform in reverse (origin callables).
    pub fn reversed_input_adapter(
        &self,
        input_name: &str,
        input: &Shape,
        rev: AbiRevision,
    ) -> Result<AdapterTransform, MockError> {
        self.input_adapter(input_name, input, rev)
    }

    /// Return kinds must agree exactly; there is no return adaptation.
    pub fn check_return(&self, input_name: &str, input: &Shape) -> Result<(), MockError> {
        if input.ret() != self.extended.ret() {
            return Err(self.mismatch(input_name, input));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueKind::{Int, Ptr, Uint};

    fn vals(ws: &[i64]) -> Vec<Value> {
        ws.iter().map(|&w| Value::Int(w)).collect()
    }

    #[test]
    fn plain_function_has_identity_transform() {
        let shape = Shape::new(&[Int, Int], Int);
        let a = Adapter::new(&shape, false, false, CURRENT_ABI);
        assert_eq!(a.extended_shape(), &shape);
        let t = a.input_adapter("hook", &shape, CURRENT_ABI).unwrap();
        assert!(t.dropped().is_empty());
        assert_eq!(t.forward(&vals(&[1, 2])), vals(&[1, 2]));
    }

    #[test]
    fn method_hook_may_omit_receiver() {
        let target = Shape::new(&[Ptr, Int], Int);
        let a = Adapter::new(&target, false, true, CURRENT_ABI);

        let with_recv = a.input_adapter("hook", &target, CURRENT_ABI).unwrap();
        assert!(with_recv.dropped().is_empty());

        let bare = Shape::new(&[Int], Int);
        let t = a.input_adapter("hook", &bare, CURRENT_ABI).unwrap();
        assert_eq!(t.dropped(), &[0]);

        let ext = [Value::Ptr(0x10), Value::Int(7)];
        assert_eq!(t.forward(&ext), vec![Value::Int(7)]);
        assert_eq!(t.extras_of(&ext), vec![Value::Ptr(0x10)]);
        assert_eq!(t.reverse(&[Value::Int(7)], &[Value::Ptr(0x10)]), ext.to_vec());
    }

    #[test]
    fn generic_function_inserts_descriptor_at_zero() {
        let target = Shape::new(&[Int], Int);
        let a = Adapter::new(&target, true, false, CURRENT_ABI);
        assert_eq!(a.extended_shape().params(), &[Ptr, Int]);

        let t = a.input_adapter("hook", &target, CURRENT_ABI).unwrap();
        assert_eq!(t.dropped(), &[0]);
    }

    #[test]
    fn generic_method_supports_all_four_hook_shapes() {
        let target = Shape::new(&[Ptr, Uint], Uint);
        let a = Adapter::new(&target, true, true, CURRENT_ABI);
        // Extended: receiver, descriptor, user arg.
        assert_eq!(a.extended_shape().params(), &[Ptr, Ptr, Uint]);

        let with_both = Shape::new(&[Ptr, Ptr, Uint], Uint);
        assert!(a.input_adapter("hook", &with_both, CURRENT_ABI).unwrap().dropped().is_empty());

        // Receiver and descriptor are both ptr-kind, so the two-param shape
        // resolves to the first single-drop candidate: keep the receiver.
        let one_hidden = Shape::new(&[Ptr, Uint], Uint);
        assert_eq!(a.input_adapter("hook", &one_hidden, CURRENT_ABI).unwrap().dropped(), &[1]);

        let neither = Shape::new(&[Uint], Uint);
        assert_eq!(a.input_adapter("hook", &neither, CURRENT_ABI).unwrap().dropped(), &[0, 1]);
    }

    #[test]
    fn descriptor_placement_follows_revision_table() {
        let target = Shape::new(&[Ptr, Int], Int);
        let old = Adapter::new(&target, true, true, AbiRevision(1));
        // Descriptor first on the old revision.
        assert_eq!(old.extended_shape().params(), &[Ptr, Ptr, Int]);
        let neither = Shape::new(&[Int], Int);
        assert_eq!(old.input_adapter("hook", &neither, AbiRevision(1)).unwrap().dropped(), &[0, 1]);

        // Unknown revisions fall back to the current placement.
        assert_eq!(descriptor_placement(AbiRevision(99)), DescriptorPlacement::AfterReceiver);
    }

    #[test]
    fn shape_mismatch_reports_both_shapes() {
        let target = Shape::new(&[Int], Int);
        let a = Adapter::new(&target, false, false, CURRENT_ABI);
        let wrong = Shape::new(&[Uint, Uint], Int);
        let err = a.input_adapter("when", &wrong, CURRENT_ABI).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("fn(int) -> int"), "{msg}");
        assert!(msg.contains("fn(uint, uint) -> int"), "{msg}");
        assert!(msg.contains("when"), "{msg}");
    }

    #[test]
    fn return_kind_must_match() {
        let target = Shape::new(&[Int], Int);
        let a = Adapter::new(&target, false, false, CURRENT_ABI);
        let bad = Shape::new(&[Int], Uint);
        assert!(a.check_return("hook", &bad).is_err());
        assert!(a.check_return("hook", &target).is_ok());
    }
}
