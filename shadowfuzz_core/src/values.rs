//! Parameter value construction, driven by each [`ParamSpec`].

use crate::schema::{ParamSpec, TypeTag};
use crate::testcase::Value;
use rand::Rng;
use rand::seq::IndexedRandom;
use rand_core::RngCore;

const DEFAULT_INT_MIN: i64 = -1000;
const DEFAULT_INT_MAX: i64 = 1000;
const DEFAULT_MAX_LEN: usize = 16;
/// Depth of the "deeply nested" boundary values.
const NESTING_DEPTH: usize = 64;
const STRING_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789 _-";

/// How parameter values are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueMode {
    /// Uniform values within the declared ranges.
    Random,
    /// Edge values: zero, range ends, one past the end, empty and single-element collections.
    Boundary,
}

pub fn generate_value(spec: &ParamSpec, mode: ValueMode, rng: &mut dyn RngCore) -> Value {
    match mode {
        ValueMode::Random => random_value(&spec.ty, spec, rng),
        ValueMode::Boundary => {
            let candidates = boundary_candidates(&spec.ty, spec);
            candidates
                .choose(rng)
                .cloned()
                .unwrap_or_else(|| random_value(&spec.ty, spec, rng))
        }
    }
}

/// Inclusive range for numeric values. A missing bound is taken from the
/// default window, moved so it never crosses the declared one.
fn int_range(spec: &ParamSpec) -> (i64, i64) {
    match (spec.min, spec.max) {
        (Some(min), Some(max)) => (min, max.max(min)),
        (Some(min), None) => (min, DEFAULT_INT_MAX.max(min)),
        (None, Some(max)) => (DEFAULT_INT_MIN.min(max), max),
        (None, None) => (DEFAULT_INT_MIN, DEFAULT_INT_MAX),
    }
}

fn random_value(ty: &TypeTag, spec: &ParamSpec, rng: &mut dyn RngCore) -> Value {
    match ty {
        TypeTag::Int => {
            let (min, max) = int_range(spec);
            Value::Int(rng.random_range(min..=max))
        }
        TypeTag::Float => {
            let (min, max) = int_range(spec);
            if min == max {
                Value::Float(min as f64)
            } else {
                Value::Float(rng.random_range(min as f64..max as f64))
            }
        }
        TypeTag::Bool => Value::Bool(rng.random_bool(0.5)),
        TypeTag::Str => {
            let len = rng.random_range(0..=spec.max_len.unwrap_or(DEFAULT_MAX_LEN));
            let s: String = (0..len)
                .map(|_| STRING_ALPHABET[rng.random_range(0..STRING_ALPHABET.len())] as char)
                .collect();
            Value::Str(s)
        }
        TypeTag::List(inner) => {
            let len = rng.random_range(0..=spec.max_len.unwrap_or(DEFAULT_MAX_LEN / 2));
            Value::List((0..len).map(|_| random_value(inner, spec, rng)).collect())
        }
        TypeTag::Unit => Value::Unit,
        TypeTag::Named(name) => Value::Raw(format!("{name}::default()")),
    }
}

/// Edge values for `ty`, deduplicated, in a fixed order.
pub fn boundary_candidates(ty: &TypeTag, spec: &ParamSpec) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut push = |v: Value| {
        if !out.contains(&v) {
            out.push(v);
        }
    };
    match ty {
        TypeTag::Int => {
            let min = spec.min.unwrap_or(i64::MIN);
            let max = spec.max.unwrap_or(i64::MAX);
            push(Value::Int(0));
            push(Value::Int(min));
            push(Value::Int(max));
            push(Value::Int(max.saturating_add(1)));
            push(Value::Int(min.saturating_sub(1)));
            push(Value::Int(-1));
            push(Value::Int(1));
        }
        TypeTag::Float => {
            push(Value::Float(0.0));
            push(Value::Float(f64::EPSILON));
            push(Value::Float(spec.min.map_or(f64::MIN, |v| v as f64)));
            push(Value::Float(spec.max.map_or(f64::MAX, |v| v as f64)));
            if let Some(max) = spec.max {
                push(Value::Float(max as f64 + 1.0));
            }
        }
        TypeTag::Bool => {
            push(Value::Bool(false));
            push(Value::Bool(true));
        }
        TypeTag::Str => {
            let max_len = spec.max_len.unwrap_or(DEFAULT_MAX_LEN);
            push(Value::Str(String::new()));
            push(Value::Str("a".to_string()));
            push(Value::Str("x".repeat(max_len)));
            if let Some(over) = max_len.checked_add(1) {
                push(Value::Str("x".repeat(over)));
            }
            push(Value::Str(format!(
                "{}{}",
                "(".repeat(NESTING_DEPTH),
                ")".repeat(NESTING_DEPTH)
            )));
        }
        TypeTag::List(inner) => {
            let max_len = spec.max_len.unwrap_or(DEFAULT_MAX_LEN / 2);
            let element = boundary_candidates(inner, spec)
                .into_iter()
                .next()
                .unwrap_or(Value::Unit);
            push(Value::List(Vec::new()));
            push(Value::List(vec![element.clone()]));
            push(Value::List(vec![element.clone(); max_len]));
            if let Some(over) = max_len.checked_add(1) {
                push(Value::List(vec![element; over]));
            }
            if matches!(inner.as_ref(), TypeTag::List(_)) {
                push(deeply_nested_list(NESTING_DEPTH));
            }
        }
        TypeTag::Unit => push(Value::Unit),
        TypeTag::Named(name) => push(Value::Raw(format!("{name}::default()"))),
    }
    out
}

fn deeply_nested_list(depth: usize) -> Value {
    (0..depth).fold(Value::List(Vec::new()), |acc, _| Value::List(vec![acc]))
}
