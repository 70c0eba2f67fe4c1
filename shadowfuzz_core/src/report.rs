//! Structured summaries of `run` and `replay`.

use crate::corpus::{ReplayReport, ReplayStatus};
use crate::oracle::{FailureClass, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ReportFormat::Text),
            "json" => Ok(ReportFormat::Json),
            other => Err(format!("unknown report format '{other}' (expected text or json)")),
        }
    }
}

/// One failing test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub test_id: String,
    pub class: FailureClass,
    pub description: String,
    /// Sequence (or line) count before and after minimization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimized: Option<(usize, usize)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Follow-up steps that failed, such as minimization or corpus recording.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub by_class: BTreeMap<String, usize>,
    pub findings: Vec<Finding>,
}

impl RunReport {
    /// Counts one examined test; returns the finding if it failed.
    pub fn add(&mut self, test_id: &str, verdict: &Verdict) -> Option<&mut Finding> {
        self.total += 1;
        let Some(class) = verdict.class else {
            self.passed += 1;
            return None;
        };
        self.failed += 1;
        *self.by_class.entry(class.to_string()).or_default() += 1;
        self.findings.push(Finding {
            test_id: test_id.to_string(),
            class,
            description: verdict.description.clone(),
            minimized: None,
            signature: None,
            notes: Vec::new(),
        });
        self.findings.last_mut()
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn render(&self, format: ReportFormat) -> Result<String, serde_json::Error> {
        match format {
            ReportFormat::Json => serde_json::to_string_pretty(self),
            ReportFormat::Text => Ok(self.render_text()),
        }
    }

    fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} tests: {} passed, {} failed",
            self.total, self.passed, self.failed
        );
        for (class, count) in &self.by_class {
            let _ = writeln!(out, "  {class}: {count}");
        }
        for finding in &self.findings {
            let _ = writeln!(out, "[{}] {}: {}", finding.class, finding.test_id, finding.description);
            if let Some((before, after)) = finding.minimized {
                let _ = writeln!(out, "    minimized {before} -> {after}");
            }
            if let Some(signature) = &finding.signature {
                let _ = writeln!(out, "    corpus signature {signature}");
            }
            for note in &finding.notes {
                let _ = writeln!(out, "    note: {note}");
            }
        }
        out
    }
}

pub fn render_replay(report: &ReplayReport, format: ReportFormat) -> Result<String, serde_json::Error> {
    if format == ReportFormat::Json {
        return serde_json::to_string_pretty(report);
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} entries: {} reproduce, {} resolved, {} regressed",
        report.outcomes.len(),
        report.count(ReplayStatus::Reproduces),
        report.count(ReplayStatus::Resolved),
        report.count(ReplayStatus::Regressed)
    );
    for outcome in &report.outcomes {
        let observed = outcome
            .observed
            .map_or_else(|| "pass".to_string(), |c| c.to_string());
        let _ = writeln!(
            out,
            "{:<10} {} ({} -> {}): {}",
            outcome.status, outcome.signature, outcome.failure_class, observed, outcome.description
        );
    }
    Ok(out)
}
