pub mod config;
pub mod corpus;
pub mod differential;
pub mod executor;
pub mod generator;
pub mod grammar;
pub mod minimizer;
pub mod mutator;
pub mod oracle;
pub mod pool;
pub mod render;
pub mod report;
pub mod schema;
pub mod shadow;
pub mod testcase;
pub mod values;

pub use config::ShadowfuzzConfig;
pub use corpus::{CorpusEntry, CorpusError, CorpusManager, ReplayReport, ReplayStatus};
pub use differential::{DifferentialResult, Normalization, compare};
pub use executor::{
    CommandExecutor, CommandExecutorConfig, ExecutionResult, ExecutionStatus, Executor,
    HarnessError, InProcessExecutor, TimeoutPolicy,
};
pub use generator::{GenerateError, Generation, GenerationWarning, Generator, generate};
pub use grammar::{Grammar, GrammarError};
pub use minimizer::{MinimizeError, Minimized, Minimizer};
pub use mutator::{CallSequenceMutator, Mutator, TokenMutator};
pub use oracle::{DifferentialOracle, FailureClass, Oracle, SingleBackendOracle, Verdict};
pub use report::{Finding, ReportFormat, RunReport};
pub use schema::{Schema, SchemaError};
pub use shadow::{ShadowState, replay};
pub use testcase::{GeneratedTest, OperationCall, StrategyKind, Value};
