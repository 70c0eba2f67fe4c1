use crate::schema::Schema;
use crate::shadow::retain_valid;
use crate::testcase::OperationCall;
use rand::Rng;
use thiserror::Error;

/// Longest run touched by a single run edit.
const MAX_RUN_LEN: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("Cannot mutate an empty input")]
    EmptyInput,
}

/// A `Mutator` derives a new input from an existing one.
///
/// # Type Parameters
/// * `T`: The kind of input this mutator edits.
/// * `R`: The random number generator driving edit choices.
pub trait Mutator<T, R: Rng + ?Sized> {
    fn mutate(&mut self, input: &T, rng: &mut R) -> Result<T, MutationError>;
}

/// Structural edit applied to a list of items (calls or tokens).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edit {
    Delete,
    Duplicate,
    Swap,
    DeleteRun,
    DuplicateRun,
}

const EDITS: [Edit; 5] = [
    Edit::Delete,
    Edit::Duplicate,
    Edit::Swap,
    Edit::DeleteRun,
    Edit::DuplicateRun,
];

fn pick_run<R: Rng + ?Sized>(len: usize, rng: &mut R) -> (usize, usize) {
    let run = rng.random_range(1..=len.min(MAX_RUN_LEN));
    let start = rng.random_range(0..=len - run);
    (start, run)
}

/// Applies one randomly chosen edit to `items`. `items` must be non-empty.
pub fn apply_random_edit<T: Clone, R: Rng + ?Sized>(items: &mut Vec<T>, rng: &mut R) -> Edit {
    let edit = EDITS[rng.random_range(0..EDITS.len())];
    let len = items.len();
    match edit {
        Edit::Delete => {
            items.remove(rng.random_range(0..len));
        }
        Edit::Duplicate => {
            let idx = rng.random_range(0..len);
            items.insert(idx, items[idx].clone());
        }
        Edit::Swap => {
            let a = rng.random_range(0..len);
            let b = rng.random_range(0..len);
            items.swap(a, b);
        }
        Edit::DeleteRun => {
            let (start, run) = pick_run(len, rng);
            items.drain(start..start + run);
        }
        Edit::DuplicateRun => {
            let (start, run) = pick_run(len, rng);
            let copy: Vec<T> = items[start..start + run].to_vec();
            let at = start + run;
            items.splice(at..at, copy);
        }
    }
    edit
}

/// Call-level mutation of an operation sequence. The edited sequence is
/// re-validated against the shadow state, so disabled calls are dropped, and
/// capped at the schema's `max_sequence_length`.
#[derive(Debug, Clone, Copy)]
pub struct CallSequenceMutator<'s> {
    schema: &'s Schema,
}

impl<'s> CallSequenceMutator<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Self { schema }
    }
}

impl<R: Rng + ?Sized> Mutator<Vec<OperationCall>, R> for CallSequenceMutator<'_> {
    fn mutate(
        &mut self,
        input: &Vec<OperationCall>,
        rng: &mut R,
    ) -> Result<Vec<OperationCall>, MutationError> {
        if input.is_empty() {
            return Err(MutationError::EmptyInput);
        }
        let mut calls = input.clone();
        apply_random_edit(&mut calls, rng);
        let mut calls = retain_valid(self.schema, calls);
        calls.truncate(self.schema.max_sequence_length);
        Ok(calls)
    }
}

/// Token-level mutation of plain program text. A token is a maximal run of
/// non-whitespace characters together with the whitespace that follows it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenMutator;

impl TokenMutator {
    pub fn new() -> Self {
        TokenMutator
    }
}

pub fn tokenize(source: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut in_space = false;
    for (idx, c) in source.char_indices() {
        if c.is_whitespace() {
            in_space = true;
        } else if in_space {
            tokens.push(&source[start..idx]);
            start = idx;
            in_space = false;
        }
    }
    if start < source.len() {
        tokens.push(&source[start..]);
    }
    tokens
}

impl<R: Rng + ?Sized> Mutator<String, R> for TokenMutator {
    fn mutate(&mut self, input: &String, rng: &mut R) -> Result<String, MutationError> {
        if input.trim().is_empty() {
            return Err(MutationError::EmptyInput);
        }
        let mut tokens = tokenize(input);
        apply_random_edit(&mut tokens, rng);
        Ok(tokens.concat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TypeTag;
    use crate::shadow::is_valid_sequence;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn stack_schema() -> Schema {
        Schema::load(
            r#"{
            "type_name": "Stack",
            "constructor": { "name": "new", "timeout_ms": 100, "returns": "Stack",
                             "postconditions": [{ "add": "is_empty" }] },
            "operations": [
                { "name": "push", "timeout_ms": 10, "returns": "unit",
                  "postconditions": [{ "add": "!is_empty" }] },
                { "name": "pop", "preconditions": ["!is_empty"], "timeout_ms": 10, "returns": "int",
                  "postconditions": [{ "add": "is_empty" }] }
            ],
            "max_sequence_length": 4
        }"#,
        )
        .unwrap()
    }

    fn call(name: &str) -> OperationCall {
        OperationCall {
            operation: name.to_string(),
            arguments: Vec::new(),
            returns: TypeTag::Unit,
            timeout_ms: 10,
        }
    }

    #[test]
    fn tokenize_keeps_trailing_whitespace() {
        let source = "let a = 1;\n  print(a)\n";
        let tokens = tokenize(source);
        assert_eq!(tokens, vec!["let ", "a ", "= ", "1;\n  ", "print(a)\n"]);
        assert_eq!(tokens.concat(), source);
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn call_mutations_stay_valid_and_bounded() {
        let schema = stack_schema();
        let mut mutator = CallSequenceMutator::new(&schema);
        let mut rng = ChaCha8Rng::from_seed([11; 32]);
        let seed = vec![call("push"), call("pop"), call("push"), call("pop")];
        for _ in 0..200 {
            let mutated = mutator.mutate(&seed, &mut rng).unwrap();
            assert!(mutated.len() <= schema.max_sequence_length);
            assert!(is_valid_sequence(&schema, &mutated), "{mutated:?}");
        }
    }

    #[test]
    fn token_mutation_changes_source() {
        let mut mutator = TokenMutator::new();
        let mut rng = ChaCha8Rng::from_seed([12; 32]);
        let source = "a b c d e f\n".to_string();
        let changed = (0..20)
            .map(|_| mutator.mutate(&source, &mut rng).unwrap())
            .filter(|m| *m != source)
            .count();
        assert!(changed > 0);
    }

    #[test]
    fn empty_inputs_are_rejected() {
        let schema = stack_schema();
        let mut rng = ChaCha8Rng::from_seed([13; 32]);
        assert_eq!(
            CallSequenceMutator::new(&schema).mutate(&Vec::new(), &mut rng),
            Err(MutationError::EmptyInput)
        );
        assert_eq!(
            TokenMutator::new().mutate(&"   ".to_string(), &mut rng),
            Err(MutationError::EmptyInput)
        );
    }

    #[test]
    fn run_edits_respect_bounds() {
        let mut rng = ChaCha8Rng::from_seed([14; 32]);
        for _ in 0..500 {
            let mut items: Vec<u32> = (0..6).collect();
            let edit = apply_random_edit(&mut items, &mut rng);
            match edit {
                Edit::Delete => assert_eq!(items.len(), 5),
                Edit::Duplicate => assert_eq!(items.len(), 7),
                Edit::Swap => assert_eq!(items.len(), 6),
                Edit::DeleteRun => assert!((2..=5).contains(&items.len())),
                Edit::DuplicateRun => assert!((7..=10).contains(&items.len())),
            }
        }
    }
}
