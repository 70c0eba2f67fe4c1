//! Test generation strategies.
//!
//! Every test draws from its own ChaCha8 stream (`seed`, stream = test index),
//! so a test depends only on the seed and its position, never on the tests
//! generated before it.

use crate::grammar::{self, Grammar, GrammarError};
use crate::mutator::{CallSequenceMutator, Mutator, TokenMutator};
use crate::render::RenderSettings;
use crate::schema::{OperationSpec, Schema};
use crate::shadow::ShadowState;
use crate::testcase::{GeneratedTest, OperationCall, SchemaRef, StrategyKind};
use crate::values::{ValueMode, generate_value};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_GRAMMAR_MAX_DEPTH: usize = 6;

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("Mutation strategy needs at least one seed program")]
    EmptySeedPool,
    #[error(transparent)]
    Grammar(#[from] GrammarError),
}

/// Non-fatal conditions reported alongside the generated tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationWarning {
    PreconditionUnsatisfiable { type_name: String },
}

impl fmt::Display for GenerationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationWarning::PreconditionUnsatisfiable { type_name } => write!(
                f,
                "no operation of '{type_name}' is enabled after construction; no tests generated"
            ),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub tests: Vec<GeneratedTest>,
    pub warnings: Vec<GenerationWarning>,
}

/// Produces one test per call, from a caller-provided random stream.
pub trait Strategy {
    fn kind(&self) -> StrategyKind;
    fn next_test(&mut self, id: &str, rng: &mut dyn RngCore) -> GeneratedTest;
}

fn call_for(op: &OperationSpec, mode: ValueMode, rng: &mut dyn RngCore) -> OperationCall {
    OperationCall {
        operation: op.name.clone(),
        arguments: op
            .parameters
            .iter()
            .map(|param| generate_value(param, mode, rng))
            .collect(),
        returns: op.returns.clone(),
        timeout_ms: op.timeout_ms,
    }
}

/// Walks the shadow state, choosing uniformly among enabled operations until
/// none is enabled or the length limit is reached.
pub fn build_sequence(
    schema: &Schema,
    mode: ValueMode,
    rng: &mut dyn RngCore,
) -> (OperationCall, Vec<OperationCall>) {
    let constructor = call_for(&schema.constructor, mode, rng);
    let mut state = ShadowState::initial(schema);
    let mut calls = Vec::with_capacity(schema.max_sequence_length);
    while calls.len() < schema.max_sequence_length {
        let enabled = state.enabled(schema);
        if enabled.is_empty() {
            break;
        }
        let op = enabled[rng.random_range(0..enabled.len())];
        calls.push(call_for(op, mode, rng));
        state.apply(op);
    }
    (constructor, calls)
}

/// Schema-driven sequences. With [`ValueMode::Boundary`] this is the boundary strategy.
pub struct SchemaStrategy<'a> {
    schema: &'a Schema,
    schema_ref: SchemaRef,
    render: &'a RenderSettings,
    mode: ValueMode,
}

impl<'a> SchemaStrategy<'a> {
    pub fn new(
        schema: &'a Schema,
        schema_ref: SchemaRef,
        render: &'a RenderSettings,
        mode: ValueMode,
    ) -> Self {
        Self {
            schema,
            schema_ref,
            render,
            mode,
        }
    }
}

impl Strategy for SchemaStrategy<'_> {
    fn kind(&self) -> StrategyKind {
        match self.mode {
            ValueMode::Random => StrategyKind::Schema,
            ValueMode::Boundary => StrategyKind::Boundary,
        }
    }

    fn next_test(&mut self, id: &str, rng: &mut dyn RngCore) -> GeneratedTest {
        let (constructor, calls) = build_sequence(self.schema, self.mode, rng);
        let rendered_source = self.render.render_for(self.schema, &constructor, &calls);
        GeneratedTest {
            id: id.to_string(),
            schema_ref: Some(self.schema_ref.clone()),
            constructor_call: Some(constructor),
            operation_sequence: calls,
            rendered_source,
            strategy: self.kind(),
        }
    }
}

pub struct GrammarStrategy {
    grammar: Grammar,
    max_depth: usize,
}

impl GrammarStrategy {
    pub fn new(grammar: Grammar, max_depth: usize) -> Self {
        Self { grammar, max_depth }
    }
}

impl Strategy for GrammarStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Grammar
    }

    fn next_test(&mut self, id: &str, rng: &mut dyn RngCore) -> GeneratedTest {
        let source = self.grammar.expand(self.max_depth, rng);
        GeneratedTest::from_source(id, source, StrategyKind::Grammar)
    }
}

/// Edits a uniformly chosen seed. Seeds built from the same schema are edited
/// call by call; anything else is edited token by token.
pub struct MutationStrategy<'a> {
    seeds: &'a [GeneratedTest],
    schema: &'a Schema,
    schema_ref: SchemaRef,
    render: &'a RenderSettings,
}

impl<'a> MutationStrategy<'a> {
    pub fn new(
        seeds: &'a [GeneratedTest],
        schema: &'a Schema,
        schema_ref: SchemaRef,
        render: &'a RenderSettings,
    ) -> Result<Self, GenerateError> {
        if seeds.is_empty() {
            return Err(GenerateError::EmptySeedPool);
        }
        Ok(Self {
            seeds,
            schema,
            schema_ref,
            render,
        })
    }

    fn edits_calls(&self, seed: &GeneratedTest) -> bool {
        seed.constructor_call.is_some()
            && seed
                .schema_ref
                .as_ref()
                .is_none_or(|r| r.type_name == self.schema.type_name)
    }
}

impl Strategy for MutationStrategy<'_> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Mutation
    }

    fn next_test(&mut self, id: &str, rng: &mut dyn RngCore) -> GeneratedTest {
        let seed = &self.seeds[rng.random_range(0..self.seeds.len())];
        if let (true, Some(constructor)) = (self.edits_calls(seed), seed.constructor_call.as_ref()) {
            let calls = CallSequenceMutator::new(self.schema)
                .mutate(&seed.operation_sequence, rng)
                .unwrap_or_else(|_| seed.operation_sequence.clone());
            let rendered_source = self.render.render_for(self.schema, constructor, &calls);
            return GeneratedTest {
                id: id.to_string(),
                schema_ref: Some(self.schema_ref.clone()),
                constructor_call: Some(constructor.clone()),
                operation_sequence: calls,
                rendered_source,
                strategy: StrategyKind::Mutation,
            };
        }
        let source = TokenMutator::new()
            .mutate(&seed.rendered_source, rng)
            .unwrap_or_else(|_| seed.rendered_source.clone());
        GeneratedTest::from_source(id, source, StrategyKind::Mutation)
    }
}

pub fn test_id(kind: StrategyKind, seed: u64, index: usize) -> String {
    format!("{kind}-{seed:016x}-{index:05}")
}

pub fn stream_rng(seed: u64, index: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(index as u64);
    rng
}

/// Configures and runs a generation pass over one schema.
pub struct Generator<'a> {
    schema: &'a Schema,
    schema_source: Option<PathBuf>,
    render: RenderSettings,
    grammar: Option<Grammar>,
    grammar_max_depth: usize,
    seeds: Vec<GeneratedTest>,
}

impl<'a> Generator<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            schema_source: None,
            render: RenderSettings::default(),
            grammar: None,
            grammar_max_depth: DEFAULT_GRAMMAR_MAX_DEPTH,
            seeds: Vec::new(),
        }
    }

    pub fn with_schema_source(mut self, path: PathBuf) -> Self {
        self.schema_source = Some(path);
        self
    }

    pub fn with_render(mut self, render: RenderSettings) -> Self {
        self.render = render;
        self
    }

    pub fn with_grammar(mut self, grammar: Grammar) -> Self {
        self.grammar = Some(grammar);
        self
    }

    pub fn with_grammar_depth(mut self, depth: usize) -> Self {
        self.grammar_max_depth = depth;
        self
    }

    pub fn with_seeds(mut self, seeds: Vec<GeneratedTest>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn generate(
        &self,
        kind: StrategyKind,
        count: usize,
        seed: u64,
    ) -> Result<Generation, GenerateError> {
        let schema_ref = SchemaRef::new(self.schema, self.schema_source.clone());
        let mut generation = Generation::default();

        let mut strategy: Box<dyn Strategy + '_> = match kind {
            StrategyKind::Schema | StrategyKind::Boundary => {
                if ShadowState::initial(self.schema).enabled(self.schema).is_empty() {
                    let warning = GenerationWarning::PreconditionUnsatisfiable {
                        type_name: self.schema.type_name.clone(),
                    };
                    warn!(type_name = %self.schema.type_name, "{warning}");
                    generation.warnings.push(warning);
                    return Ok(generation);
                }
                let mode = if kind == StrategyKind::Boundary {
                    ValueMode::Boundary
                } else {
                    ValueMode::Random
                };
                Box::new(SchemaStrategy::new(self.schema, schema_ref, &self.render, mode))
            }
            StrategyKind::Grammar => {
                let grammar = match &self.grammar {
                    Some(g) => g.clone(),
                    None => grammar::default_grammar()?,
                };
                Box::new(GrammarStrategy::new(grammar, self.grammar_max_depth))
            }
            StrategyKind::Mutation => Box::new(MutationStrategy::new(
                &self.seeds,
                self.schema,
                schema_ref,
                &self.render,
            )?),
        };

        generation.tests = (0..count)
            .map(|index| {
                let mut rng = stream_rng(seed, index);
                let test = strategy.next_test(&test_id(kind, seed, index), &mut rng);
                debug!(test_id = %test.id, calls = test.operation_sequence.len(), "generated test");
                test
            })
            .collect();

        info!(strategy = %kind, count = generation.tests.len(), seed, "generation complete");
        Ok(generation)
    }
}

/// Generates `count` tests with default rendering, grammar and no seeds.
pub fn generate(
    schema: &Schema,
    kind: StrategyKind,
    count: usize,
    seed: u64,
) -> Result<Generation, GenerateError> {
    Generator::new(schema).generate(kind, count, seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::is_valid_sequence;
    use crate::testcase::Value;
    use crate::values::boundary_candidates;

    const STACK_SCHEMA: &str = r#"{
        "type_name": "Stack",
        "constructor": { "name": "new", "timeout_ms": 100, "returns": "Stack",
                         "postconditions": [{ "add": "is_empty" }] },
        "operations": [
            { "name": "push", "timeout_ms": 100, "returns": "unit",
              "parameters": [{ "name": "value", "type": "int", "min": 0, "max": 9 }],
              "postconditions": [{ "add": "!is_empty" }] },
            { "name": "pop", "preconditions": ["!is_empty"], "timeout_ms": 100, "returns": "int" },
            { "name": "clear", "preconditions": ["!is_empty"], "timeout_ms": 100, "returns": "unit",
              "postconditions": [{ "add": "is_empty" }] }
        ],
        "max_sequence_length": 6
    }"#;

    fn stack() -> Schema {
        Schema::load(STACK_SCHEMA).unwrap()
    }

    #[test]
    fn schema_tests_respect_preconditions() {
        let schema = stack();
        let generation = generate(&schema, StrategyKind::Schema, 300, 42).unwrap();
        assert_eq!(generation.tests.len(), 300);
        assert!(generation.warnings.is_empty());
        for test in &generation.tests {
            assert!(is_valid_sequence(&schema, &test.operation_sequence), "{}", test.id);
            assert!(test.operation_sequence.len() <= schema.max_sequence_length);
            assert_eq!(test.operation_sequence.first().map(|c| c.operation.as_str()), Some("push"));
            assert!(test.rendered_source.contains("let mut instance = Stack::new();"));
        }
    }

    #[test]
    fn generation_is_deterministic() {
        let schema = stack();
        let a = generate(&schema, StrategyKind::Schema, 20, 7).unwrap();
        let b = generate(&schema, StrategyKind::Schema, 20, 7).unwrap();
        let c = generate(&schema, StrategyKind::Schema, 20, 8).unwrap();
        let sources = |g: &Generation| g.tests.iter().map(|t| t.rendered_source.clone()).collect::<Vec<_>>();
        assert_eq!(sources(&a), sources(&b));
        assert_ne!(sources(&a), sources(&c));
    }

    #[test]
    fn tests_depend_only_on_seed_and_index() {
        let schema = stack();
        let short = generate(&schema, StrategyKind::Schema, 3, 99).unwrap();
        let long = generate(&schema, StrategyKind::Schema, 10, 99).unwrap();
        assert_eq!(short.tests[..], long.tests[..3]);
        assert_eq!(long.tests[4].id, "schema-0000000000000063-00004");
    }

    #[test]
    fn unsatisfiable_schema_yields_warning_and_no_tests() {
        let text = STACK_SCHEMA.replace(
            "{ \"name\": \"push\", \"timeout_ms\"",
            "{ \"name\": \"push\", \"preconditions\": [\"!is_empty\"], \"timeout_ms\"",
        );
        let schema = Schema::load(&text).unwrap();
        let generation = generate(&schema, StrategyKind::Schema, 10, 1).unwrap();
        assert!(generation.tests.is_empty());
        assert_eq!(
            generation.warnings,
            vec![GenerationWarning::PreconditionUnsatisfiable {
                type_name: "Stack".into()
            }]
        );
    }

    #[test]
    fn boundary_arguments_come_from_edge_values() {
        let schema = stack();
        let param = &schema.operation("push").unwrap().parameters[0];
        let edges = boundary_candidates(&param.ty, param);
        let generation = generate(&schema, StrategyKind::Boundary, 50, 3).unwrap();
        let mut saw_out_of_range = false;
        for test in &generation.tests {
            assert_eq!(test.strategy, StrategyKind::Boundary);
            for call in test.operation_sequence.iter().filter(|c| c.operation == "push") {
                assert!(edges.contains(&call.arguments[0]));
                saw_out_of_range |= call.arguments[0] == Value::Int(10);
            }
        }
        assert!(saw_out_of_range);
    }

    #[test]
    fn grammar_tests_are_source_only() {
        let schema = stack();
        let generation = generate(&schema, StrategyKind::Grammar, 5, 11).unwrap();
        for test in &generation.tests {
            assert!(!test.has_operations());
            assert!(test.rendered_source.starts_with("fun main() {"));
        }
    }

    #[test]
    fn mutation_needs_seeds() {
        let schema = stack();
        assert!(matches!(
            generate(&schema, StrategyKind::Mutation, 1, 0),
            Err(GenerateError::EmptySeedPool)
        ));
    }

    #[test]
    fn mutation_keeps_sequences_valid() {
        let schema = stack();
        let seeds = generate(&schema, StrategyKind::Schema, 10, 5).unwrap().tests;
        let mut pool = seeds;
        pool.push(GeneratedTest::from_source("raw", "print(1)\nprint(2)\n", StrategyKind::Grammar));
        let generation = Generator::new(&schema)
            .with_seeds(pool)
            .generate(StrategyKind::Mutation, 100, 6)
            .unwrap();
        assert_eq!(generation.tests.len(), 100);
        for test in &generation.tests {
            assert_eq!(test.strategy, StrategyKind::Mutation);
            if test.has_operations() {
                assert!(is_valid_sequence(&schema, &test.operation_sequence));
            }
        }
        assert!(generation.tests.iter().any(|t| !t.has_operations()));
    }
}
