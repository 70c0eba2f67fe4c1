use crate::differential::{self, Normalization};
use crate::executor::{ExecutionResult, ExecutionStatus, Executor, HarnessError, TimeoutPolicy};
use crate::testcase::GeneratedTest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of behavioral defect a failing test exhibits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Timeout,
    Crashed,
    /// Exactly one of two backends timed out.
    AsymmetricHang,
    OutputDivergence,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Timeout => "timeout",
            FailureClass::Crashed => "crashed",
            FailureClass::AsymmetricHang => "asymmetric_hang",
            FailureClass::OutputDivergence => "output_divergence",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(FailureClass::Timeout),
            "crashed" => Ok(FailureClass::Crashed),
            "asymmetric_hang" => Ok(FailureClass::AsymmetricHang),
            "output_divergence" => Ok(FailureClass::OutputDivergence),
            other => Err(format!("unknown failure class '{other}'")),
        }
    }
}

/// The outcome of examining one program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// `None` when the program behaved.
    pub class: Option<FailureClass>,
    /// A human-readable description of the finding.
    pub description: String,
    /// One result per backend, in backend order.
    pub results: Vec<ExecutionResult>,
}

impl Verdict {
    pub fn is_failure(&self) -> bool {
        self.class.is_some()
    }
}

/// An `Oracle` runs a program and decides whether its behavior is a defect.
///
/// Implementations differ in how many backends they consult and what counts
/// as a failure. Harness faults are returned as errors, never as verdicts.
pub trait Oracle: Send + Sync {
    fn examine(&self, source: &str, timeout_ms: u64) -> Result<Verdict, HarnessError>;

    /// Examines a generated test under the budget `policy` assigns it.
    fn examine_test(
        &self,
        test: &GeneratedTest,
        policy: &TimeoutPolicy,
    ) -> Result<Verdict, HarnessError> {
        self.examine(&test.rendered_source, policy.budget_for(test))
    }
}

fn describe(backend: &str, result: &ExecutionResult, timeout_ms: u64) -> String {
    match result.status {
        ExecutionStatus::Completed => format!("'{backend}' completed"),
        ExecutionStatus::Timeout => format!("'{backend}' exceeded its {timeout_ms}ms budget"),
        ExecutionStatus::Crashed => match (result.exit_code, result.signal) {
            (Some(code), _) => format!("'{backend}' exited with code {code}"),
            (None, Some(signal)) => format!("'{backend}' was terminated by signal {signal}"),
            (None, None) => format!("'{backend}' exited abnormally"),
        },
    }
}

/// Classifies timeouts and crashes of a single backend.
pub struct SingleBackendOracle {
    executor: Box<dyn Executor>,
}

impl SingleBackendOracle {
    pub fn new(executor: Box<dyn Executor>) -> Self {
        Self { executor }
    }
}

impl Oracle for SingleBackendOracle {
    fn examine(&self, source: &str, timeout_ms: u64) -> Result<Verdict, HarnessError> {
        let result = self.executor.execute(source, timeout_ms)?;
        let class = match result.status {
            ExecutionStatus::Completed => None,
            ExecutionStatus::Timeout => Some(FailureClass::Timeout),
            ExecutionStatus::Crashed => Some(FailureClass::Crashed),
        };
        Ok(Verdict {
            class,
            description: describe(self.executor.name(), &result, timeout_ms),
            results: vec![result],
        })
    }
}

/// Runs every program on two backends and reports divergence between them.
pub struct DifferentialOracle {
    backend_a: Box<dyn Executor>,
    backend_b: Box<dyn Executor>,
    normalization: Normalization,
}

impl DifferentialOracle {
    pub fn new(
        backend_a: Box<dyn Executor>,
        backend_b: Box<dyn Executor>,
        normalization: Normalization,
    ) -> Self {
        Self {
            backend_a,
            backend_b,
            normalization,
        }
    }
}

impl Oracle for DifferentialOracle {
    fn examine(&self, source: &str, timeout_ms: u64) -> Result<Verdict, HarnessError> {
        let diff = differential::compare(
            source,
            self.backend_a.as_ref(),
            self.backend_b.as_ref(),
            timeout_ms,
            self.normalization,
        )?;
        let class = diff.failure_class();
        let description = match class {
            Some(FailureClass::Timeout) => format!("both backends exceeded the {timeout_ms}ms budget"),
            Some(FailureClass::Crashed) => format!(
                "{}; {}",
                describe(self.backend_a.name(), &diff.backend_a, timeout_ms),
                describe(self.backend_b.name(), &diff.backend_b, timeout_ms)
            ),
            _ => diff.diff_summary.clone(),
        };
        Ok(Verdict {
            class,
            description,
            results: vec![diff.backend_a, diff.backend_b],
        })
    }
}
