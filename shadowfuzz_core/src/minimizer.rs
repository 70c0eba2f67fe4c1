//! Delta debugging of failing tests.
//!
//! Operation sequences are reduced call by call, and every candidate is
//! replayed against the shadow state first: candidates that break a
//! precondition are skipped without being executed. Tests without a sequence
//! are reduced line by line. A candidate only counts as reproducing when it
//! fails with exactly the original failure class.

use crate::executor::{HarnessError, TimeoutPolicy};
use crate::oracle::{FailureClass, Oracle};
use crate::render::RenderSettings;
use crate::schema::Schema;
use crate::shadow::{ReplayError, is_valid_sequence, replay};
use crate::testcase::{GeneratedTest, OperationCall};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_MAX_ATTEMPTS: usize = 256;

#[derive(Error, Debug)]
pub enum MinimizeError {
    #[error("Test '{0}' does not fail; nothing to minimize")]
    NotReproducible(String),
    #[error("Test '{0}' carries an operation sequence, but no schema was provided")]
    SchemaRequired(String),
    #[error("Test '{id}' is not valid against the schema: {source}")]
    InvalidSequence {
        id: String,
        #[source]
        source: ReplayError,
    },
    #[error(transparent)]
    Harness(#[from] HarnessError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Reproduces,
    NoRepro,
    /// Not executed: the candidate violates a precondition.
    Skipped,
    BudgetExhausted,
}

#[derive(Debug, Clone)]
pub struct Minimized {
    pub test: GeneratedTest,
    pub class: FailureClass,
    /// Executions spent, including the initial reproduction.
    pub attempts: usize,
    /// Set when `max_attempts` ran out before a 1-minimal result was reached.
    pub budget_exceeded: bool,
    pub original_len: usize,
    pub minimal_len: usize,
}

pub struct Minimizer<'a> {
    oracle: &'a dyn Oracle,
    schema: Option<&'a Schema>,
    render: RenderSettings,
    policy: TimeoutPolicy,
    max_attempts: usize,
}

impl<'a> Minimizer<'a> {
    pub fn new(oracle: &'a dyn Oracle, schema: Option<&'a Schema>) -> Self {
        Self {
            oracle,
            schema,
            render: RenderSettings::default(),
            policy: TimeoutPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_render(mut self, render: RenderSettings) -> Self {
        self.render = render;
        self
    }

    pub fn with_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn minimize(&self, test: &GeneratedTest) -> Result<Minimized, MinimizeError> {
        let class = self
            .oracle
            .examine_test(test, &self.policy)?
            .class
            .ok_or_else(|| MinimizeError::NotReproducible(test.id.clone()))?;
        let mut search = Search {
            oracle: self.oracle,
            policy: &self.policy,
            class,
            cache: HashMap::new(),
            attempts: 1,
            max_attempts: self.max_attempts,
        };

        let minimized = match &test.constructor_call {
            Some(constructor) => {
                let schema = self
                    .schema
                    .ok_or_else(|| MinimizeError::SchemaRequired(test.id.clone()))?;
                replay(schema, &test.operation_sequence).map_err(|source| {
                    MinimizeError::InvalidSequence {
                        id: test.id.clone(),
                        source,
                    }
                })?;
                let calls = &test.operation_sequence;
                let build = |keep: &[usize]| -> Option<GeneratedTest> {
                    let subset: Vec<OperationCall> = keep.iter().map(|&i| calls[i].clone()).collect();
                    if !is_valid_sequence(schema, &subset) {
                        return None;
                    }
                    let rendered_source = self.render.render_for(schema, constructor, &subset);
                    Some(GeneratedTest {
                        operation_sequence: subset,
                        rendered_source,
                        ..test.clone()
                    })
                };
                let (keep, budget_exceeded) = ddmin(calls.len(), |keep| search.probe(keep, &build))?;
                let minimal = build(&keep).unwrap_or_else(|| test.clone());
                (minimal, budget_exceeded, calls.len(), keep.len())
            }
            None => {
                let lines: Vec<&str> = test.rendered_source.split_inclusive('\n').collect();
                let build = |keep: &[usize]| -> Option<GeneratedTest> {
                    let source: String = keep.iter().map(|&i| lines[i]).collect();
                    Some(GeneratedTest {
                        rendered_source: source,
                        ..test.clone()
                    })
                };
                let (keep, budget_exceeded) = ddmin(lines.len(), |keep| search.probe(keep, &build))?;
                let minimal = build(&keep).unwrap_or_else(|| test.clone());
                (minimal, budget_exceeded, lines.len(), keep.len())
            }
        };

        let (minimal, budget_exceeded, original_len, minimal_len) = minimized;
        info!(
            test_id = %test.id,
            class = %class,
            original_len,
            minimal_len,
            attempts = search.attempts,
            budget_exceeded,
            "minimized failing test"
        );
        Ok(Minimized {
            test: minimal,
            class,
            attempts: search.attempts,
            budget_exceeded,
            original_len,
            minimal_len,
        })
    }
}

struct Search<'a> {
    oracle: &'a dyn Oracle,
    policy: &'a TimeoutPolicy,
    class: FailureClass,
    cache: HashMap<Vec<usize>, bool>,
    attempts: usize,
    max_attempts: usize,
}

impl Search<'_> {
    fn probe<B>(&mut self, keep: &[usize], build: &B) -> Result<Probe, MinimizeError>
    where
        B: Fn(&[usize]) -> Option<GeneratedTest>,
    {
        if let Some(&reproduces) = self.cache.get(keep) {
            return Ok(if reproduces { Probe::Reproduces } else { Probe::NoRepro });
        }
        let Some(candidate) = build(keep) else {
            self.cache.insert(keep.to_vec(), false);
            return Ok(Probe::Skipped);
        };
        if self.attempts >= self.max_attempts {
            return Ok(Probe::BudgetExhausted);
        }
        self.attempts += 1;
        let verdict = self.oracle.examine_test(&candidate, self.policy)?;
        let reproduces = verdict.class == Some(self.class);
        debug!(size = keep.len(), attempt = self.attempts, reproduces, "probed candidate");
        self.cache.insert(keep.to_vec(), reproduces);
        Ok(if reproduces { Probe::Reproduces } else { Probe::NoRepro })
    }
}

fn split(current: &[usize], n: usize) -> Vec<Vec<usize>> {
    let size = current.len().div_ceil(n).max(1);
    current.chunks(size).map(<[usize]>::to_vec).collect()
}

/// Reduces `0..len` to a 1-minimal index set for which `probe` reproduces.
/// Returns the indices kept and whether the attempt budget ran out.
fn ddmin<F>(len: usize, mut probe: F) -> Result<(Vec<usize>, bool), MinimizeError>
where
    F: FnMut(&[usize]) -> Result<Probe, MinimizeError>,
{
    let mut current: Vec<usize> = (0..len).collect();
    let mut n = 2;
    while current.len() >= 2 {
        let chunks = split(&current, n);
        let mut reduced = false;

        for chunk in &chunks {
            match probe(chunk)? {
                Probe::Reproduces => {
                    current = chunk.clone();
                    n = 2;
                    reduced = true;
                    break;
                }
                Probe::BudgetExhausted => return Ok((current, true)),
                Probe::NoRepro | Probe::Skipped => {}
            }
        }

        // With two chunks every complement is the other chunk.
        if !reduced && chunks.len() > 2 {
            for skip in 0..chunks.len() {
                let complement: Vec<usize> = chunks
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != skip)
                    .flat_map(|(_, c)| c.iter().copied())
                    .collect();
                match probe(&complement)? {
                    Probe::Reproduces => {
                        current = complement;
                        n = (n - 1).max(2);
                        reduced = true;
                        break;
                    }
                    Probe::BudgetExhausted => return Ok((current, true)),
                    Probe::NoRepro | Probe::Skipped => {}
                }
            }
        }

        if !reduced {
            if n >= current.len() {
                break;
            }
            n = (n * 2).min(current.len());
        }
    }

    if current.len() == 1 {
        match probe(&[])? {
            Probe::Reproduces => current.clear(),
            Probe::BudgetExhausted => return Ok((current, true)),
            Probe::NoRepro | Probe::Skipped => {}
        }
    }
    Ok((current, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InProcessExecutor;
    use crate::oracle::SingleBackendOracle;
    use crate::schema::TypeTag;
    use crate::testcase::{SchemaRef, StrategyKind, Value};

    fn stack_schema() -> Schema {
        Schema::load(
            r#"{
            "type_name": "Stack",
            "constructor": { "name": "new", "timeout_ms": 100, "returns": "Stack",
                             "postconditions": [{ "add": "is_empty" }] },
            "operations": [
                { "name": "push", "timeout_ms": 100, "returns": "unit",
                  "parameters": [{ "name": "value", "type": "int" }],
                  "postconditions": [{ "add": "!is_empty" }] },
                { "name": "pop", "preconditions": ["!is_empty"], "timeout_ms": 100, "returns": "int" },
                { "name": "clear", "preconditions": ["!is_empty"], "timeout_ms": 100, "returns": "unit",
                  "postconditions": [{ "add": "is_empty" }] }
            ],
            "max_sequence_length": 8
        }"#,
        )
        .unwrap()
    }

    fn call(schema: &Schema, name: &str, args: Vec<Value>) -> OperationCall {
        let op = schema.operation(name).unwrap();
        OperationCall {
            operation: name.to_string(),
            arguments: args,
            returns: op.returns.clone(),
            timeout_ms: op.timeout_ms,
        }
    }

    fn sequence_test(schema: &Schema, calls: Vec<OperationCall>) -> GeneratedTest {
        let constructor = OperationCall {
            operation: "new".into(),
            arguments: Vec::new(),
            returns: TypeTag::Named("Stack".into()),
            timeout_ms: 100,
        };
        let rendered_source = RenderSettings::default().render_for(schema, &constructor, &calls);
        GeneratedTest {
            id: "schema-0000000000000001-00000".into(),
            schema_ref: Some(SchemaRef::new(schema, None)),
            constructor_call: Some(constructor),
            operation_sequence: calls,
            rendered_source,
            strategy: StrategyKind::Schema,
        }
    }

    /// Crashes when a `clear` is followed, anywhere later, by a `pop`.
    fn clear_then_pop(source: &str) -> Result<String, String> {
        match (source.find("instance.clear()"), source.rfind("instance.pop()")) {
            (Some(c), Some(p)) if c < p => Err("corrupted".to_string()),
            _ => Ok(String::new()),
        }
    }

    #[test]
    fn reduces_to_precondition_valid_subsequence() {
        let schema = stack_schema();
        let test = sequence_test(
            &schema,
            vec![
                call(&schema, "push", vec![Value::Int(1)]),
                call(&schema, "push", vec![Value::Int(2)]),
                call(&schema, "pop", vec![]),
                call(&schema, "clear", vec![]),
                call(&schema, "push", vec![Value::Int(3)]),
                call(&schema, "push", vec![Value::Int(4)]),
                call(&schema, "pop", vec![]),
            ],
        );
        let oracle = SingleBackendOracle::new(Box::new(InProcessExecutor::new("vm", clear_then_pop)));
        let minimized = Minimizer::new(&oracle, Some(&schema)).minimize(&test).unwrap();

        assert_eq!(minimized.class, FailureClass::Crashed);
        assert!(!minimized.budget_exceeded);
        assert_eq!(minimized.original_len, 7);
        assert_eq!(minimized.test.operation_names(), vec!["push", "clear", "push", "pop"]);
        assert!(is_valid_sequence(&schema, &minimized.test.operation_sequence));
        assert!(minimized.test.rendered_source.contains("instance.clear();"));
        assert_eq!(minimized.test.id, test.id);
    }

    #[test]
    fn budget_exhaustion_returns_best_so_far() {
        let schema = stack_schema();
        let calls: Vec<OperationCall> = (0..6)
            .map(|i| call(&schema, "push", vec![Value::Int(i)]))
            .chain([call(&schema, "clear", vec![]), call(&schema, "push", vec![Value::Int(9)]), call(&schema, "pop", vec![])])
            .collect();
        let test = sequence_test(&schema, calls);
        let oracle = SingleBackendOracle::new(Box::new(InProcessExecutor::new("vm", clear_then_pop)));
        let minimized = Minimizer::new(&oracle, Some(&schema))
            .with_max_attempts(2)
            .minimize(&test)
            .unwrap();
        assert!(minimized.budget_exceeded);
        assert_eq!(minimized.attempts, 2);
        assert!(is_valid_sequence(&schema, &minimized.test.operation_sequence));
        assert!(clear_then_pop(&minimized.test.rendered_source).is_err());
    }

    #[test]
    fn passing_test_is_not_reproducible() {
        let schema = stack_schema();
        let test = sequence_test(&schema, vec![call(&schema, "push", vec![Value::Int(1)])]);
        let oracle = SingleBackendOracle::new(Box::new(InProcessExecutor::new("vm", clear_then_pop)));
        assert!(matches!(
            Minimizer::new(&oracle, Some(&schema)).minimize(&test),
            Err(MinimizeError::NotReproducible(_))
        ));
    }

    #[test]
    fn sequence_tests_need_a_schema() {
        let schema = stack_schema();
        let test = sequence_test(
            &schema,
            vec![
                call(&schema, "push", vec![Value::Int(1)]),
                call(&schema, "clear", vec![]),
                call(&schema, "push", vec![Value::Int(1)]),
                call(&schema, "pop", vec![]),
            ],
        );
        let oracle = SingleBackendOracle::new(Box::new(InProcessExecutor::new("vm", clear_then_pop)));
        assert!(matches!(
            Minimizer::new(&oracle, None).minimize(&test),
            Err(MinimizeError::SchemaRequired(_))
        ));
    }

    #[test]
    fn source_only_tests_are_reduced_by_line() {
        let test = GeneratedTest::from_source(
            "grammar-0000000000000002-00003",
            "let a = 1;\nprint(a);\nexplode();\nprint(2);\n",
            StrategyKind::Grammar,
        );
        let oracle = SingleBackendOracle::new(Box::new(InProcessExecutor::new("vm", |s: &str| {
            if s.contains("explode") {
                Err("boom".to_string())
            } else {
                Ok(String::new())
            }
        })));
        let minimized = Minimizer::new(&oracle, None).minimize(&test).unwrap();
        assert_eq!(minimized.test.rendered_source, "explode();\n");
        assert_eq!(minimized.minimal_len, 1);
        assert_eq!(minimized.original_len, 4);
    }

    #[test]
    fn ddmin_finds_one_minimal_set() {
        let mut probes = 0;
        let (keep, exhausted) = ddmin(8, |keep| {
            probes += 1;
            Ok(if keep.contains(&2) && keep.contains(&5) {
                Probe::Reproduces
            } else {
                Probe::NoRepro
            })
        })
        .unwrap();
        assert_eq!(keep, vec![2, 5]);
        assert!(!exhausted);
        assert!(probes > 0);
    }
}
