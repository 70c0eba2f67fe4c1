//! Shadow state: the predicate facts believed true about the instance while a
//! sequence is being built or replayed. Execution itself is black-box; this
//! state only exists on the generation and minimization side.

use crate::schema::{OperationSpec, Predicate, PredicateEffect, Schema};
use crate::testcase::OperationCall;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("Call #{index} invokes '{operation}', which the schema does not declare")]
    UnknownOperation { index: usize, operation: String },
    #[error("Call #{index} invokes '{operation}' without required predicates {missing:?}")]
    PreconditionViolated {
        index: usize,
        operation: String,
        missing: Vec<String>,
    },
}

/// Set of literal facts. A fact and its complement never coexist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowState {
    facts: BTreeSet<Predicate>,
}

impl ShadowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State right after the constructor ran.
    pub fn initial(schema: &Schema) -> Self {
        let mut state = Self::new();
        state.apply(&schema.constructor);
        state
    }

    pub fn contains(&self, predicate: &Predicate) -> bool {
        self.facts.contains(predicate)
    }

    pub fn facts(&self) -> impl Iterator<Item = &Predicate> {
        self.facts.iter()
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn satisfies(&self, op: &OperationSpec) -> bool {
        op.preconditions.iter().all(|p| self.contains(p))
    }

    pub fn missing_for(&self, op: &OperationSpec) -> Vec<String> {
        op.preconditions
            .iter()
            .filter(|p| !self.contains(p))
            .map(ToString::to_string)
            .collect()
    }

    pub fn apply_effect(&mut self, effect: &PredicateEffect) {
        match effect {
            PredicateEffect::Add(p) => {
                self.facts.remove(&p.complement());
                self.facts.insert(p.clone());
            }
            PredicateEffect::Remove(p) => {
                self.facts.remove(p);
            }
        }
    }

    pub fn apply(&mut self, op: &OperationSpec) {
        for effect in &op.postconditions {
            self.apply_effect(effect);
        }
    }

    /// Operations whose preconditions all hold, in schema order.
    pub fn enabled<'s>(&self, schema: &'s Schema) -> Vec<&'s OperationSpec> {
        schema
            .operations
            .iter()
            .filter(|op| self.satisfies(op))
            .collect()
    }
}

/// Replays `calls` from the constructor state, failing at the first call whose
/// preconditions do not hold.
pub fn replay(schema: &Schema, calls: &[OperationCall]) -> Result<ShadowState, ReplayError> {
    let mut state = ShadowState::initial(schema);
    for (index, call) in calls.iter().enumerate() {
        let op = schema
            .operation(&call.operation)
            .ok_or_else(|| ReplayError::UnknownOperation {
                index,
                operation: call.operation.clone(),
            })?;
        if !state.satisfies(op) {
            return Err(ReplayError::PreconditionViolated {
                index,
                operation: call.operation.clone(),
                missing: state.missing_for(op),
            });
        }
        state.apply(op);
    }
    Ok(state)
}

pub fn is_valid_sequence(schema: &Schema, calls: &[OperationCall]) -> bool {
    replay(schema, calls).is_ok()
}

/// Keeps, in order, only the calls that are enabled at their position once
/// earlier invalid calls have been dropped.
pub fn retain_valid(schema: &Schema, calls: Vec<OperationCall>) -> Vec<OperationCall> {
    let mut state = ShadowState::initial(schema);
    calls
        .into_iter()
        .filter(|call| match schema.operation(&call.operation) {
            Some(op) if state.satisfies(op) => {
                state.apply(op);
                true
            }
            _ => false,
        })
        .collect()
}
