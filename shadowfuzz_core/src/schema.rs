//! Declarative type and operation schemas.
//!
//! A [`Schema`] describes one type of the language under test: how to
//! construct it, which operations it exposes, which predicate facts each
//! operation requires, and how each operation changes those facts. Schemas are
//! loaded once, validated, and then treated as immutable value data.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Upper limit on a declared `max_len`.
pub const MAX_COLLECTION_LEN: usize = 1 << 16;

/// Errors raised while loading or validating a schema.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// Structural error: syntax, missing required field, unknown field.
    #[error("Malformed schema: {0}")]
    MalformedSchema(String),

    /// A precondition names a predicate that no operation ever establishes.
    #[error("Operation '{operation}' references undeclared predicate '{predicate}'")]
    UnknownPredicate {
        operation: String,
        predicate: String,
    },

    #[error("Constructor '{name}' is invalid: {reason}")]
    InvalidConstructor { name: String, reason: String },

    #[error("Operation '{0}' must declare timeout_ms > 0")]
    InvalidTimeout(String),

    #[error("max_sequence_length must be at least 1")]
    InvalidSequenceLength,

    #[error("Operation name '{0}' is declared more than once")]
    DuplicateOperation(String),

    #[error("Parameter '{parameter}' of operation '{operation}' is invalid: {reason}")]
    InvalidParameter {
        operation: String,
        parameter: String,
        reason: String,
    },

    #[error("Failed to read schema file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A named boolean fact about instance state. `!name` is the complementary fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Predicate {
    name: String,
    negated: bool,
}

impl Predicate {
    pub fn new(name: impl Into<String>, negated: bool) -> Self {
        Self {
            name: name.into(),
            negated,
        }
    }

    /// The predicate name without its polarity.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_negated(&self) -> bool {
        self.negated
    }

    pub fn complement(&self) -> Self {
        Self {
            name: self.name.clone(),
            negated: !self.negated,
        }
    }
}

impl FromStr for Predicate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (negated, name) = match trimmed.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, trimmed),
        };
        if name.is_empty() {
            return Err(format!("predicate '{s}' has an empty name"));
        }
        if name.starts_with('!') {
            return Err(format!("predicate '{s}' is negated more than once"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(format!("predicate '{s}' contains invalid characters"));
        }
        Ok(Self::new(name, negated))
    }
}

impl TryFrom<String> for Predicate {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Predicate> for String {
    fn from(value: Predicate) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "!{}", self.name)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// How executing an operation changes the predicate set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateEffect {
    Add(Predicate),
    Remove(Predicate),
}

impl PredicateEffect {
    pub fn predicate(&self) -> &Predicate {
        match self {
            PredicateEffect::Add(p) | PredicateEffect::Remove(p) => p,
        }
    }
}

/// Type tag of a parameter or return value, written as a string in schema files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TypeTag {
    Int,
    Float,
    Bool,
    Str,
    Unit,
    List(Box<TypeTag>),
    /// Any other type of the language under test, treated opaquely.
    Named(String),
}

impl TypeTag {
    pub fn is_unit(&self) -> bool {
        matches!(self, TypeTag::Unit)
    }
}

impl FromStr for TypeTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(inner) = s
            .strip_prefix("list<")
            .or_else(|| s.strip_prefix("List<"))
            .and_then(|rest| rest.strip_suffix('>'))
        {
            return Ok(TypeTag::List(Box::new(inner.parse()?)));
        }
        match s {
            "" => Err("empty type tag".to_string()),
            "int" | "i32" | "i64" | "integer" => Ok(TypeTag::Int),
            "float" | "f32" | "f64" => Ok(TypeTag::Float),
            "bool" | "boolean" => Ok(TypeTag::Bool),
            "string" | "str" | "String" => Ok(TypeTag::Str),
            "unit" | "()" | "void" => Ok(TypeTag::Unit),
            other if other.contains(&['<', '>', ' '][..]) => {
                Err(format!("unsupported type tag '{other}'"))
            }
            other => Ok(TypeTag::Named(other.to_string())),
        }
    }
}

impl TryFrom<String> for TypeTag {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TypeTag> for String {
    fn from(value: TypeTag) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Int => f.write_str("int"),
            TypeTag::Float => f.write_str("float"),
            TypeTag::Bool => f.write_str("bool"),
            TypeTag::Str => f.write_str("string"),
            TypeTag::Unit => f.write_str("unit"),
            TypeTag::List(inner) => write!(f, "list<{inner}>"),
            TypeTag::Named(name) => f.write_str(name),
        }
    }
}

/// Declares one parameter and the range its generated values must respect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeTag,
    /// Inclusive lower bound for numeric values (and list elements).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    /// Inclusive upper bound for numeric values (and list elements).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    /// Maximum length of strings and lists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_len: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationSpec {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    #[serde(default)]
    pub preconditions: Vec<Predicate>,
    #[serde(default)]
    pub postconditions: Vec<PredicateEffect>,
    pub timeout_ms: u64,
    pub returns: TypeTag,
}

/// Input format of a schema document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaFormat {
    #[default]
    Json,
    Toml,
}

impl SchemaFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => SchemaFormat::Toml,
            _ => SchemaFormat::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Schema {
    pub type_name: String,
    pub constructor: OperationSpec,
    pub operations: Vec<OperationSpec>,
    pub max_sequence_length: usize,
}

impl Schema {
    /// Parses and validates a JSON schema document.
    pub fn load(schema_text: &str) -> Result<Self, SchemaError> {
        Self::load_with_format(schema_text, SchemaFormat::Json)
    }

    pub fn load_with_format(schema_text: &str, format: SchemaFormat) -> Result<Self, SchemaError> {
        let schema: Schema = match format {
            SchemaFormat::Json => serde_json::from_str(schema_text)
                .map_err(|e| SchemaError::MalformedSchema(e.to_string()))?,
            SchemaFormat::Toml => {
                toml::from_str(schema_text).map_err(|e| SchemaError::MalformedSchema(e.to_string()))?
            }
        };
        schema.validate()?;
        Ok(schema)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::load_with_format(&text, SchemaFormat::from_path(path))
    }

    pub fn operation(&self, name: &str) -> Option<&OperationSpec> {
        self.operations.iter().find(|op| op.name == name)
    }

    /// Every predicate name established by some effect, regardless of polarity.
    pub fn declared_predicates(&self) -> BTreeSet<&str> {
        std::iter::once(&self.constructor)
            .chain(self.operations.iter())
            .flat_map(|op| op.postconditions.iter())
            .map(|effect| effect.predicate().name())
            .collect()
    }

    /// Every literal some effect adds, with its polarity.
    pub fn established_literals(&self) -> BTreeSet<&Predicate> {
        std::iter::once(&self.constructor)
            .chain(self.operations.iter())
            .flat_map(|op| op.postconditions.iter())
            .filter_map(|effect| match effect {
                PredicateEffect::Add(p) => Some(p),
                PredicateEffect::Remove(_) => None,
            })
            .collect()
    }

    /// Preconditions whose exact literal no effect ever adds, as
    /// `(operation, literal)` pairs. Such operations can never be enabled.
    pub fn unreachable_preconditions(&self) -> Vec<(&str, &Predicate)> {
        let established = self.established_literals();
        self.operations
            .iter()
            .flat_map(|op| op.preconditions.iter().map(move |p| (op.name.as_str(), p)))
            .filter(|(_, p)| !established.contains(p))
            .collect()
    }

    /// Stable digest of the schema contents, used to tie generated tests to it.
    pub fn fingerprint(&self) -> String {
        // Serializing plain structs and vecs cannot fail.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", md5::compute(canonical))
    }

    fn validate(&self) -> Result<(), SchemaError> {
        if self.type_name.trim().is_empty() {
            return Err(SchemaError::MalformedSchema(
                "type_name must not be empty".to_string(),
            ));
        }
        if self.max_sequence_length < 1 {
            return Err(SchemaError::InvalidSequenceLength);
        }

        let ctor = &self.constructor;
        if ctor.timeout_ms == 0 {
            return Err(SchemaError::InvalidConstructor {
                name: ctor.name.clone(),
                reason: "timeout_ms must be greater than 0".to_string(),
            });
        }
        if !ctor.preconditions.is_empty() {
            return Err(SchemaError::InvalidConstructor {
                name: ctor.name.clone(),
                reason: "constructors cannot have preconditions".to_string(),
            });
        }
        validate_parameters(ctor)?;

        let mut seen = HashSet::new();
        for op in &self.operations {
            if op.name.trim().is_empty() {
                return Err(SchemaError::MalformedSchema(
                    "operation name must not be empty".to_string(),
                ));
            }
            if !seen.insert(op.name.as_str()) {
                return Err(SchemaError::DuplicateOperation(op.name.clone()));
            }
            if op.timeout_ms == 0 {
                return Err(SchemaError::InvalidTimeout(op.name.clone()));
            }
            validate_parameters(op)?;
        }

        let declared = self.declared_predicates();
        for op in &self.operations {
            if let Some(undeclared) = op
                .preconditions
                .iter()
                .find(|p| !declared.contains(p.name()))
            {
                return Err(SchemaError::UnknownPredicate {
                    operation: op.name.clone(),
                    predicate: undeclared.to_string(),
                });
            }
        }
        for (operation, literal) in self.unreachable_preconditions() {
            warn!(
                type_name = %self.type_name,
                operation,
                precondition = %literal,
                "precondition is never established; operation can never run"
            );
        }
        Ok(())
    }
}

fn validate_parameters(op: &OperationSpec) -> Result<(), SchemaError> {
    let mut names = HashSet::new();
    for param in &op.parameters {
        let invalid = |reason: &str| SchemaError::InvalidParameter {
            operation: op.name.clone(),
            parameter: param.name.clone(),
            reason: reason.to_string(),
        };
        if !names.insert(param.name.as_str()) {
            return Err(invalid("duplicate parameter name"));
        }
        if let (Some(min), Some(max)) = (param.min, param.max) {
            if min > max {
                return Err(invalid("min is greater than max"));
            }
        }
        if param.max_len.is_some_and(|len| len > MAX_COLLECTION_LEN) {
            return Err(invalid(&format!("max_len exceeds {MAX_COLLECTION_LEN}")));
        }
        if param.ty.is_unit() {
            return Err(invalid("parameters cannot have unit type"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK_SCHEMA: &str = r#"{
        "type_name": "Stack",
        "constructor": { "name": "new", "parameters": [], "timeout_ms": 100, "returns": "Stack" },
        "operations": [
            { "name": "push", "preconditions": [], "timeout_ms": 1000, "returns": "unit",
              "parameters": [{ "name": "value", "type": "int", "min": 0, "max": 9 }],
              "postconditions": [{ "add": "!is_empty" }] },
            { "name": "pop", "preconditions": ["!is_empty"], "timeout_ms": 1000, "returns": "int" }
        ],
        "max_sequence_length": 3
    }"#;

    #[test]
    fn loads_valid_schema() {
        let schema = Schema::load(STACK_SCHEMA).expect("schema should load");
        assert_eq!(schema.type_name, "Stack");
        assert_eq!(schema.operations.len(), 2);
        let pop = schema.operation("pop").unwrap();
        assert_eq!(pop.preconditions, vec![Predicate::new("is_empty", true)]);
        assert_eq!(pop.returns, TypeTag::Int);
        assert_eq!(
            schema.declared_predicates().into_iter().collect::<Vec<_>>(),
            vec!["is_empty"]
        );
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let text = r#"{ "type_name": "Stack", "operations": [], "max_sequence_length": 1 }"#;
        assert!(matches!(Schema::load(text), Err(SchemaError::MalformedSchema(_))));
    }

    #[test]
    fn unknown_top_level_field_is_rejected() {
        let text = STACK_SCHEMA.replacen("\"max_sequence_length\": 3", "\"max_sequence_length\": 3, \"extra\": 1", 1);
        assert!(matches!(Schema::load(&text), Err(SchemaError::MalformedSchema(_))));
    }

    #[test]
    fn undeclared_precondition_is_unknown_predicate() {
        let text = STACK_SCHEMA.replace("[\"!is_empty\"]", "[\"has_entries\"]");
        match Schema::load(&text) {
            Err(SchemaError::UnknownPredicate { operation, predicate }) => {
                assert_eq!(operation, "pop");
                assert_eq!(predicate, "has_entries");
            }
            other => panic!("expected UnknownPredicate, got {other:?}"),
        }
    }

    #[test]
    fn constructor_timeout_must_be_positive() {
        let text = STACK_SCHEMA.replacen("\"timeout_ms\": 100", "\"timeout_ms\": 0", 1);
        assert!(matches!(
            Schema::load(&text),
            Err(SchemaError::InvalidConstructor { .. })
        ));
    }

    #[test]
    fn zero_sequence_length_is_rejected() {
        let text = STACK_SCHEMA.replace("\"max_sequence_length\": 3", "\"max_sequence_length\": 0");
        assert!(matches!(Schema::load(&text), Err(SchemaError::InvalidSequenceLength)));
    }

    #[test]
    fn duplicate_operations_are_rejected() {
        let text = STACK_SCHEMA.replace("\"name\": \"pop\"", "\"name\": \"push\"");
        assert!(matches!(
            Schema::load(&text),
            Err(SchemaError::DuplicateOperation(name)) if name == "push"
        ));
    }

    #[test]
    fn inverted_parameter_range_is_rejected() {
        let text = STACK_SCHEMA.replace("\"min\": 0, \"max\": 9", "\"min\": 9, \"max\": 0");
        assert!(matches!(
            Schema::load(&text),
            Err(SchemaError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn oversized_max_len_is_rejected() {
        let huge = STACK_SCHEMA.replace("\"max\": 9", &format!("\"max\": 9, \"max_len\": {}", usize::MAX));
        match Schema::load(&huge) {
            Err(SchemaError::InvalidParameter { parameter, reason, .. }) => {
                assert_eq!(parameter, "value");
                assert!(reason.contains("max_len"), "{reason}");
            }
            other => panic!("expected InvalidParameter, got {other:?}"),
        }
        let limit = STACK_SCHEMA.replace("\"max\": 9", &format!("\"max\": 9, \"max_len\": {MAX_COLLECTION_LEN}"));
        assert!(Schema::load(&limit).is_ok());
    }

    #[test]
    fn precondition_polarity_never_added_is_reported() {
        let schema = Schema::load(STACK_SCHEMA).unwrap();
        assert!(schema.unreachable_preconditions().is_empty());

        let flipped = Schema::load(&STACK_SCHEMA.replace("[\"!is_empty\"]", "[\"is_empty\"]")).unwrap();
        assert_eq!(
            flipped.unreachable_preconditions(),
            vec![("pop", &Predicate::new("is_empty", false))]
        );
    }

    #[test]
    fn loads_toml_schema() {
        let text = r#"
type_name = "Counter"
max_sequence_length = 4

[constructor]
name = "new"
timeout_ms = 50
returns = "Counter"
postconditions = [{ add = "is_zero" }]

[[operations]]
name = "incr"
timeout_ms = 50
returns = "unit"
postconditions = [{ add = "!is_zero" }]

[[operations]]
name = "decr"
preconditions = ["!is_zero"]
timeout_ms = 50
returns = "int"
"#;
        let schema = Schema::load_with_format(text, SchemaFormat::Toml).unwrap();
        assert_eq!(schema.type_name, "Counter");
        assert_eq!(
            schema.constructor.postconditions,
            vec![PredicateEffect::Add(Predicate::new("is_zero", false))]
        );
    }

    #[test]
    fn type_tags_parse_and_display() {
        let tag: TypeTag = "list<list<int>>".parse().unwrap();
        assert_eq!(
            tag,
            TypeTag::List(Box::new(TypeTag::List(Box::new(TypeTag::Int))))
        );
        assert_eq!(tag.to_string(), "list<list<int>>");
        assert_eq!("Stack".parse::<TypeTag>().unwrap(), TypeTag::Named("Stack".into()));
        assert!("map<int, int>".parse::<TypeTag>().is_err());
    }

    #[test]
    fn predicate_parsing_handles_negation() {
        let p: Predicate = "!is_empty".parse().unwrap();
        assert!(p.is_negated());
        assert_eq!(p.name(), "is_empty");
        assert_eq!(p.complement().to_string(), "is_empty");
        assert!("!".parse::<Predicate>().is_err());
        assert!("!!x".parse::<Predicate>().is_err());
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = Schema::load(STACK_SCHEMA).unwrap();
        let b = Schema::load(STACK_SCHEMA).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 32);
    }

    #[test]
    fn demo_schema_loads_from_file() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos/stack.json");
        let schema = Schema::load_from_file(&path).unwrap();
        assert_eq!(schema.type_name, "Stack");
        assert_eq!(schema.operations.len(), 4);
        assert!(schema.operation("peek").is_some());
    }
}
