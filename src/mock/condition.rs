//! Predicate/action clauses.
//!
//! A mock holds an ordered list of conditions. The last condition stays
//! mutable until both its predicate and its action are set; at that point
//! the builder appends a fresh empty one, which is how multi-clause
//! when/then chains are authored incrementally.

use std::sync::Arc;

use crate::mock::sequence::Sequence;
use crate::types::{Shape, Value};

pub(crate) type PredicateFn = dyn Fn(&[Value]) -> bool + Send + Sync;
pub(crate) type HookFn = dyn Fn(&[Value]) -> Value + Send + Sync;

#[derive(Clone)]
pub(crate) enum ConditionAction {
    /// Run an author hook with the declared shape.
    Call { hook: Arc<HookFn>, shape: Shape },
    /// Return a fixed value.
    Return(Value),
    /// Return the next value of a script.
    Seq(Arc<Sequence>),
}

#[derive(Clone, Default)]
pub(crate) struct Condition {
    pub when: Option<(Arc<PredicateFn>, Shape)>,
    pub action: Option<ConditionAction>,
}

impl Condition {
    pub fn complete(&self) -> bool {
        self.when.is_some() && self.action.is_some()
    }

    pub fn set_when(&mut self, pred: Arc<PredicateFn>, shape: Shape) {
        assert!(self.when.is_none(), "remock: when already set for this clause");
        self.set_when_force(pred, shape);
    }

    pub fn set_when_force(&mut self, pred: Arc<PredicateFn>, shape: Shape) {
        self.when = Some((pred, shape));
    }

    pub fn set_action(&mut self, action: ConditionAction) {
        assert!(self.action.is_none(), "remock: action already set for this clause");
        self.set_action_force(action);
    }

    pub fn set_action_force(&mut self, action: ConditionAction) {
        self.action = Some(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueKind;

    fn shape() -> Shape {
        Shape::new(&[ValueKind::Int], ValueKind::Int)
    }

    #[test]
    fn complete_requires_both_halves() {
        let mut c = Condition::default();
        assert!(!c.complete());
        c.set_when(Arc::new(|_| true), shape());
        assert!(!c.complete());
        c.set_action(ConditionAction::Return(Value::Int(1)));
        assert!(c.complete());
    }

    #[test]
    #[should_panic(expected = "when already set")]
    fn double_when_is_rejected() {
        let mut c = Condition::default();
        c.set_when(Arc::new(|_| true), shape());
        c.set_when(Arc::new(|_| false), shape());
    }

    #[test]
    #[should_panic(expected = "action already set")]
    fn double_action_is_rejected() {
        let mut c = Condition::default();
        c.set_action(ConditionAction::Return(Value::Int(1)));
        c.set_action(ConditionAction::Return(Value::Int(2)));
    }

    #[test]
    fn force_setters_replace_in_place() {
        let mut c = Condition::default();
        c.set_action(ConditionAction::Return(Value::Int(1)));
        c.set_action_force(ConditionAction::Return(Value::Int(2)));
        match c.action {
            Some(ConditionAction::Return(v)) => assert_eq!(v.as_int(), 2),
            _ => panic!("expected return action"),
        }
    }
}
