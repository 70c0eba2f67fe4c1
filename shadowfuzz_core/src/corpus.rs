use crate::executor::{HarnessError, TimeoutPolicy};
use crate::oracle::{FailureClass, Oracle};
use crate::pool::run_pool;
use crate::testcase::{GeneratedTest, StrategyKind, TestCaseError, json_files_in};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

/// Version tag mixed into every signature, so a change in normalization
/// never collides with signatures already on disk.
const SIGNATURE_VERSION: &str = "sig-v1";

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// No entry with this signature exists in the corpus.
    #[error("Corpus entry '{0}' not found")]
    EntryNotFound(String),

    /// Reading or writing the corpus directory failed.
    #[error("Corpus I/O error at {path:?}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Corpus serialization error: {0}")]
    Serialization(String),

    /// An entry or seed file could not be decoded.
    #[error("Corpus deserialization error in {path:?}: {message}")]
    Deserialization { path: PathBuf, message: String },

    #[error(transparent)]
    TestCase(#[from] TestCaseError),

    /// Replaying an entry failed inside the harness.
    #[error(transparent)]
    Harness(#[from] HarnessError),
}

impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Serialization(format!("JSON operation error: {err}"))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CorpusError + '_ {
    move |err| CorpusError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A known failure, stored as `<signature>.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CorpusEntry {
    pub signature: String,
    pub failure_class: FailureClass,
    pub minimal_test: GeneratedTest,
    /// Milliseconds since the Unix epoch.
    pub first_seen: u64,
    pub last_seen: u64,
    pub occurrence_count: u64,
    #[serde(default)]
    pub resolved: bool,
}

/// Canonical text of a test: one call per line for sequence tests, trimmed
/// non-empty source lines otherwise.
fn normalized_form(test: &GeneratedTest) -> String {
    if test.has_operations() {
        test.constructor_call
            .iter()
            .chain(test.operation_sequence.iter())
            .map(|call| call.signature_line())
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        test.rendered_source
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// md5 over the failure class and the normalized minimal test.
pub fn signature(test: &GeneratedTest, class: FailureClass) -> String {
    let digest = md5::compute(format!(
        "{SIGNATURE_VERSION}:{class}\n{}",
        normalized_form(test)
    ));
    format!("{digest:x}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    Reproduces,
    Resolved,
    Regressed,
}

impl fmt::Display for ReplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            ReplayStatus::Reproduces => "reproduces",
            ReplayStatus::Resolved => "resolved",
            ReplayStatus::Regressed => "regressed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayOutcome {
    pub signature: String,
    pub failure_class: FailureClass,
    pub status: ReplayStatus,
    /// What the replay actually observed.
    pub observed: Option<FailureClass>,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub outcomes: Vec<ReplayOutcome>,
}

impl ReplayReport {
    pub fn count(&self, status: ReplayStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn has_regressions(&self) -> bool {
        self.count(ReplayStatus::Regressed) > 0
    }
}

/// Persistent, deduplicated store of minimized failures.
#[derive(Debug)]
pub struct CorpusManager {
    dir: PathBuf,
    entries: BTreeMap<String, CorpusEntry>,
}

impl CorpusManager {
    /// Opens (creating if needed) a corpus directory and loads every entry in it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CorpusError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        let mut entries = BTreeMap::new();
        for path in json_files_in(&dir)? {
            let text = fs::read_to_string(&path).map_err(io_error(&path))?;
            let entry: CorpusEntry =
                serde_json::from_str(&text).map_err(|e| CorpusError::Deserialization {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if stem != entry.signature {
                warn!(path = ?path, signature = %entry.signature, "corpus file name does not match its signature");
            }
            entries.insert(entry.signature.clone(), entry);
        }
        info!(dir = ?dir, entries = entries.len(), "opened corpus");
        Ok(Self { dir, entries })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, signature: &str) -> Option<&CorpusEntry> {
        self.entries.get(signature)
    }

    /// Entries ordered by signature.
    pub fn entries(&self) -> impl Iterator<Item = &CorpusEntry> {
        self.entries.values()
    }

    /// Minimal tests of every entry, for use as mutation seeds.
    pub fn seeds(&self) -> Vec<GeneratedTest> {
        self.entries.values().map(|e| e.minimal_test.clone()).collect()
    }

    fn entry_path(&self, signature: &str) -> PathBuf {
        self.dir.join(format!("{signature}.json"))
    }

    /// Writes to a temp file in the corpus directory, then renames it into place.
    fn persist(&self, entry: &CorpusEntry) -> Result<(), CorpusError> {
        let json = serde_json::to_string_pretty(entry)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".entry-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(io_error(&self.dir))?;
        tmp.write_all(json.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(io_error(tmp.path()))?;
        let target = self.entry_path(&entry.signature);
        tmp.persist(&target).map_err(|e| CorpusError::Io {
            path: target.clone(),
            message: e.error.to_string(),
        })?;
        Ok(())
    }

    /// Records a minimized failure. A known signature only bumps its
    /// occurrence count and `last_seen`; a resolved entry found again is
    /// marked unresolved.
    pub fn record(
        &mut self,
        minimal_test: &GeneratedTest,
        failure_class: FailureClass,
    ) -> Result<CorpusEntry, CorpusError> {
        let signature = signature(minimal_test, failure_class);
        let now = now_ms();
        let entry = match self.entries.get(&signature) {
            Some(existing) => {
                let mut entry = existing.clone();
                entry.occurrence_count += 1;
                entry.last_seen = now.max(entry.last_seen);
                entry.resolved = false;
                entry
            }
            None => CorpusEntry {
                signature: signature.clone(),
                failure_class,
                minimal_test: minimal_test.clone(),
                first_seen: now,
                last_seen: now,
                occurrence_count: 1,
                resolved: false,
            },
        };
        self.persist(&entry)?;
        info!(
            signature = %signature,
            class = %failure_class,
            occurrence_count = entry.occurrence_count,
            "recorded failure"
        );
        self.entries.insert(signature, entry.clone());
        Ok(entry)
    }

    /// Operator-initiated removal of one entry.
    pub fn prune(&mut self, signature: &str) -> Result<CorpusEntry, CorpusError> {
        let entry = self
            .entries
            .remove(signature)
            .ok_or_else(|| CorpusError::EntryNotFound(signature.to_string()))?;
        let path = self.entry_path(signature);
        fs::remove_file(&path).map_err(io_error(&path))?;
        info!(signature, "pruned corpus entry");
        Ok(entry)
    }

    /// Re-executes every entry on `workers` threads and classifies the result.
    pub fn replay_all(
        &mut self,
        oracle: &dyn Oracle,
        policy: &TimeoutPolicy,
        workers: usize,
    ) -> Result<ReplayReport, CorpusError> {
        let tasks: Vec<CorpusEntry> = self.entries.values().cloned().collect();
        let verdicts = run_pool(tasks, workers, |entry| {
            let verdict = oracle.examine_test(&entry.minimal_test, policy);
            (entry, verdict)
        });

        let mut report = ReplayReport::default();
        for (mut entry, verdict) in verdicts {
            let verdict = verdict?;
            let status = match verdict.class {
                None => ReplayStatus::Resolved,
                Some(class) if class == entry.failure_class && !entry.resolved => {
                    ReplayStatus::Reproduces
                }
                Some(_) => ReplayStatus::Regressed,
            };

            let became_resolved = status == ReplayStatus::Resolved && !entry.resolved;
            let reopened = status == ReplayStatus::Regressed && entry.resolved;
            if became_resolved || reopened {
                entry.resolved = became_resolved;
                entry.last_seen = now_ms().max(entry.last_seen);
                self.persist(&entry)?;
                self.entries.insert(entry.signature.clone(), entry.clone());
            }
            if status == ReplayStatus::Regressed {
                warn!(signature = %entry.signature, observed = ?verdict.class, "corpus entry regressed");
            }
            report.outcomes.push(ReplayOutcome {
                signature: entry.signature,
                failure_class: entry.failure_class,
                status,
                observed: verdict.class,
                description: verdict.description,
            });
        }
        info!(
            reproduces = report.count(ReplayStatus::Reproduces),
            resolved = report.count(ReplayStatus::Resolved),
            regressed = report.count(ReplayStatus::Regressed),
            "replay complete"
        );
        Ok(report)
    }
}

fn load_seed_file(path: &Path) -> Result<GeneratedTest, CorpusError> {
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    if path.extension().is_some_and(|ext| ext == "json") {
        if let Ok(test) = serde_json::from_str::<GeneratedTest>(&text) {
            return Ok(test);
        }
        return serde_json::from_str::<CorpusEntry>(&text)
            .map(|entry| entry.minimal_test)
            .map_err(|e| CorpusError::Deserialization {
                path: path.to_path_buf(),
                message: e.to_string(),
            });
    }
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("seed");
    Ok(GeneratedTest::from_source(
        format!("seed-{stem}"),
        text,
        StrategyKind::Mutation,
    ))
}

/// Loads mutation seeds from files or directories. JSON files may hold a
/// generated test or a corpus entry; any other file is taken as program text.
/// In a directory, `<id>.src` is skipped when `<id>.json` sits next to it.
pub fn load_seed_programs(paths: &[PathBuf]) -> Result<Vec<GeneratedTest>, CorpusError> {
    let mut seeds = Vec::new();
    for path in paths {
        if !path.is_dir() {
            seeds.push(load_seed_file(path)?);
            continue;
        }
        let mut files: Vec<PathBuf> = fs::read_dir(path)
            .map_err(io_error(path))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                !p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'))
            })
            .collect();
        files.sort();
        for file in &files {
            let shadowed = file.extension().is_some_and(|ext| ext == "src")
                && file.with_extension("json").exists();
            if !shadowed {
                seeds.push(load_seed_file(file)?);
            }
        }
    }
    Ok(seeds)
}
