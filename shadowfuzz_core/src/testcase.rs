use crate::schema::{Schema, TypeTag};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestCaseError {
    #[error("Failed to access test file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to decode test file {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to encode test '{id}': {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A concrete argument value, rendered as a literal of the language under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    List(Vec<Value>),
    Unit,
    /// Verbatim source text, used for opaque named types.
    Raw(String),
}

impl Value {
    pub fn render_literal(&self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::Float(v) => format!("{v:?}"),
            Value::Bool(v) => v.to_string(),
            Value::Str(s) => quote_string(s),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::render_literal).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Unit => "()".to_string(),
            Value::Raw(text) => text.clone(),
        }
    }
}

fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// One invocation inside a generated sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationCall {
    pub operation: String,
    pub arguments: Vec<Value>,
    pub returns: TypeTag,
    pub timeout_ms: u64,
}

impl OperationCall {
    /// Canonical single-line form, `name(arg, ...)`.
    pub fn signature_line(&self) -> String {
        let args: Vec<String> = self.arguments.iter().map(Value::render_literal).collect();
        format!("{}({})", self.operation, args.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Schema,
    Grammar,
    Mutation,
    Boundary,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrategyKind::Schema => "schema",
            StrategyKind::Grammar => "grammar",
            StrategyKind::Mutation => "mutation",
            StrategyKind::Boundary => "boundary",
        })
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schema" => Ok(StrategyKind::Schema),
            "grammar" => Ok(StrategyKind::Grammar),
            "mutation" => Ok(StrategyKind::Mutation),
            "boundary" => Ok(StrategyKind::Boundary),
            other => Err(format!("unknown strategy '{other}'")),
        }
    }
}

/// Identifies the schema a test was generated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRef {
    pub type_name: String,
    pub fingerprint: String,
    /// Schema file the test was generated from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl SchemaRef {
    pub fn new(schema: &Schema, source: Option<PathBuf>) -> Self {
        Self {
            type_name: schema.type_name.clone(),
            fingerprint: schema.fingerprint(),
            source,
        }
    }

    pub fn matches(&self, schema: &Schema) -> bool {
        self.type_name == schema.type_name && self.fingerprint == schema.fingerprint()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedTest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_ref: Option<SchemaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constructor_call: Option<OperationCall>,
    #[serde(default)]
    pub operation_sequence: Vec<OperationCall>,
    pub rendered_source: String,
    pub strategy: StrategyKind,
}

impl GeneratedTest {
    /// A test that is plain program text, with no operation sequence behind it.
    pub fn from_source(id: impl Into<String>, source: impl Into<String>, strategy: StrategyKind) -> Self {
        Self {
            id: id.into(),
            schema_ref: None,
            constructor_call: None,
            operation_sequence: Vec::new(),
            rendered_source: source.into(),
            strategy,
        }
    }

    pub fn has_operations(&self) -> bool {
        self.constructor_call.is_some() || !self.operation_sequence.is_empty()
    }

    pub fn operation_names(&self) -> Vec<&str> {
        self.operation_sequence
            .iter()
            .map(|call| call.operation.as_str())
            .collect()
    }

    /// Sum of the constructor and operation timeouts, `None` for source-only tests.
    pub fn declared_timeout_ms(&self) -> Option<u64> {
        if !self.has_operations() {
            return None;
        }
        let total = self
            .constructor_call
            .iter()
            .chain(self.operation_sequence.iter())
            .fold(0u64, |acc, call| acc.saturating_add(call.timeout_ms));
        Some(total)
    }

    pub fn to_json(&self) -> Result<String, TestCaseError> {
        serde_json::to_string_pretty(self).map_err(|source| TestCaseError::Encode {
            id: self.id.clone(),
            source,
        })
    }

    pub fn load_from_file(path: &Path) -> Result<Self, TestCaseError> {
        let text = fs::read_to_string(path).map_err(|source| TestCaseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| TestCaseError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes `<id>.json` and `<id>.src` into `dir`, returning the JSON path.
    pub fn save_to_dir(&self, dir: &Path) -> Result<PathBuf, TestCaseError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| TestCaseError::Io { path, source }
        };
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let json_path = dir.join(format!("{}.json", self.id));
        fs::write(&json_path, self.to_json()?).map_err(io_err(&json_path))?;
        let src_path = dir.join(format!("{}.src", self.id));
        fs::write(&src_path, &self.rendered_source).map_err(io_err(&src_path))?;
        Ok(json_path)
    }
}

/// Loads every `*.json` test in `dir`, sorted by file name.
pub fn load_dir(dir: &Path) -> Result<Vec<GeneratedTest>, TestCaseError> {
    let mut paths = json_files_in(dir)?;
    paths.sort();
    paths.iter().map(|p| GeneratedTest::load_from_file(p)).collect()
}

pub(crate) fn json_files_in(dir: &Path) -> Result<Vec<PathBuf>, TestCaseError> {
    let read_dir = fs::read_dir(dir).map_err(|source| TestCaseError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|source| TestCaseError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if path.is_file() && !hidden && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    Ok(paths)
}
