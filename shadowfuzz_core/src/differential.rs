//! Runs one program on two backends and compares what they did.

use crate::executor::{ExecutionResult, ExecutionStatus, Executor, HarnessError};
use crate::oracle::FailureClass;
use serde::{Deserialize, Serialize};
use std::thread;

/// How stdout is normalized before comparison.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Normalization {
    /// Ignore whitespace at line ends and trailing blank lines.
    #[serde(default = "default_trim_trailing_whitespace")]
    pub trim_trailing_whitespace: bool,
}

fn default_trim_trailing_whitespace() -> bool {
    true
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            trim_trailing_whitespace: default_trim_trailing_whitespace(),
        }
    }
}

impl Normalization {
    pub fn exact() -> Self {
        Self {
            trim_trailing_whitespace: false,
        }
    }

    pub fn apply(&self, text: &str) -> String {
        if !self.trim_trailing_whitespace {
            return text.to_string();
        }
        let mut lines: Vec<&str> = text.lines().map(str::trim_end).collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifferentialResult {
    pub backend_a: ExecutionResult,
    pub backend_b: ExecutionResult,
    pub diverged: bool,
    pub diff_summary: String,
}

impl DifferentialResult {
    /// `None` when both backends completed and agree.
    pub fn failure_class(&self) -> Option<FailureClass> {
        let a = self.backend_a.status;
        let b = self.backend_b.status;
        match (a, b) {
            (ExecutionStatus::Timeout, ExecutionStatus::Timeout) => Some(FailureClass::Timeout),
            (ExecutionStatus::Timeout, _) | (_, ExecutionStatus::Timeout) => Some(FailureClass::AsymmetricHang),
            _ if self.diverged => Some(FailureClass::OutputDivergence),
            (ExecutionStatus::Crashed, ExecutionStatus::Crashed) => Some(FailureClass::Crashed),
            _ => None,
        }
    }
}

fn first_difference(a: &str, b: &str) -> String {
    let mut a_lines = a.lines();
    let mut b_lines = b.lines();
    let mut line = 1;
    loop {
        match (a_lines.next(), b_lines.next()) {
            (Some(x), Some(y)) if x == y => line += 1,
            (None, None) => return "stdout differs in line endings".to_string(),
            (x, y) => {
                return format!(
                    "stdout differs at line {line}: {:?} vs {:?}",
                    x.unwrap_or("<eof>"),
                    y.unwrap_or("<eof>")
                );
            }
        }
    }
}

/// Compares two finished executions under `normalization`.
pub fn diff_results(
    names: (&str, &str),
    backend_a: ExecutionResult,
    backend_b: ExecutionResult,
    normalization: Normalization,
) -> DifferentialResult {
    let (name_a, name_b) = names;
    let a_timed_out = backend_a.status == ExecutionStatus::Timeout;
    let b_timed_out = backend_b.status == ExecutionStatus::Timeout;

    let (diverged, diff_summary) = if a_timed_out && b_timed_out {
        (false, "both backends timed out".to_string())
    } else if a_timed_out || b_timed_out {
        let (hung, finished, result) = if a_timed_out {
            (name_a, name_b, &backend_b)
        } else {
            (name_b, name_a, &backend_a)
        };
        (
            true,
            format!(
                "'{hung}' timed out while '{finished}' finished with exit code {:?}",
                result.exit_code
            ),
        )
    } else if backend_a.exit_code != backend_b.exit_code || backend_a.signal != backend_b.signal {
        (
            true,
            format!(
                "exit codes differ: '{name_a}'={:?} '{name_b}'={:?}",
                backend_a.exit_code.or(backend_a.signal.map(|s| 128 + s)),
                backend_b.exit_code.or(backend_b.signal.map(|s| 128 + s))
            ),
        )
    } else if backend_a.status == ExecutionStatus::Completed {
        let out_a = normalization.apply(&backend_a.stdout);
        let out_b = normalization.apply(&backend_b.stdout);
        if out_a == out_b {
            (false, "outputs match".to_string())
        } else {
            (true, first_difference(&out_a, &out_b))
        }
    } else {
        (false, "both backends crashed the same way".to_string())
    };

    DifferentialResult {
        backend_a,
        backend_b,
        diverged,
        diff_summary,
    }
}

/// Runs `source` on both backends concurrently, each under its own timeout.
pub fn compare(
    source: &str,
    backend_a: &dyn Executor,
    backend_b: &dyn Executor,
    timeout_ms: u64,
    normalization: Normalization,
) -> Result<DifferentialResult, HarnessError> {
    let (result_a, result_b) = thread::scope(|scope| {
        let handle = scope.spawn(|| backend_a.execute(source, timeout_ms));
        let result_b = backend_b.execute(source, timeout_ms);
        let result_a = match handle.join() {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        };
        (result_a, result_b)
    });
    Ok(diff_results(
        (backend_a.name(), backend_b.name()),
        result_a?,
        result_b?,
        normalization,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InProcessExecutor;
    use std::time::Duration;

    fn printing(name: &str, out: &'static str) -> InProcessExecutor<impl Fn(&str) -> Result<String, String>> {
        InProcessExecutor::new(name, move |_: &str| Ok(out.to_string()))
    }

    #[test]
    fn trailing_newline_is_normalized_away() {
        let a = printing("vm", "42\n");
        let b = printing("native", "42");
        let normalized = compare("", &a, &b, 1000, Normalization::default()).unwrap();
        assert!(!normalized.diverged, "{}", normalized.diff_summary);
        assert_eq!(normalized.failure_class(), None);

        let exact = compare("", &a, &b, 1000, Normalization::exact()).unwrap();
        assert!(exact.diverged);
        assert_eq!(exact.failure_class(), Some(FailureClass::OutputDivergence));
    }

    #[test]
    fn differing_output_reports_first_line() {
        let a = printing("vm", "1\n2\n3\n");
        let b = printing("native", "1\n5\n3\n");
        let result = compare("", &a, &b, 1000, Normalization::default()).unwrap();
        assert!(result.diverged);
        assert!(result.diff_summary.contains("line 2"), "{}", result.diff_summary);
    }

    #[test]
    fn differing_exit_codes_diverge() {
        let a = printing("vm", "");
        let b = InProcessExecutor::new("native", |_: &str| Err("error".to_string()));
        let result = compare("", &a, &b, 1000, Normalization::default()).unwrap();
        assert!(result.diverged);
        assert_eq!(result.failure_class(), Some(FailureClass::OutputDivergence));
    }

    #[test]
    fn one_sided_timeout_is_asymmetric_hang() {
        let fast = printing("vm", "");
        let slow = InProcessExecutor::new("native", |_: &str| {
            std::thread::sleep(Duration::from_millis(40));
            Ok(String::new())
        });
        let result = compare("", &fast, &slow, 10, Normalization::default()).unwrap();
        assert!(result.diverged);
        assert_eq!(result.failure_class(), Some(FailureClass::AsymmetricHang));
        assert!(result.diff_summary.contains("'native' timed out"));
    }

    #[test]
    fn both_timing_out_is_not_divergence() {
        let slow = |name: &str| {
            InProcessExecutor::new(name, |_: &str| {
                std::thread::sleep(Duration::from_millis(40));
                Ok(String::new())
            })
        };
        let result = compare("", &slow("vm"), &slow("native"), 10, Normalization::default()).unwrap();
        assert!(!result.diverged);
        assert_eq!(result.failure_class(), Some(FailureClass::Timeout));
    }

    #[test]
    fn normalization_trims_line_ends() {
        let n = Normalization::default();
        assert_eq!(n.apply("a  \nb\t\n\n\n"), "a\nb");
        assert_eq!(Normalization::exact().apply("a \n"), "a \n");
    }
}
