use crate::testcase::GeneratedTest;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_STARTUP_ALLOWANCE_MS: u64 = 500;
/// Exit code reported when an in-process harness panics.
const PANIC_EXIT_CODE: i32 = 101;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Timeout,
    Crashed,
}

/// Outcome of exactly one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Set when stdout or stderr exceeded the capture limit.
    #[serde(default)]
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn is_failure(&self) -> bool {
        self.status != ExecutionStatus::Completed
    }
}

/// Faults of the harness itself. These are never reported as bugs in the
/// program under test.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Backend '{backend}' has an empty command")]
    EmptyCommand { backend: String },
    #[error("Backend '{backend}' failed to spawn {command:?}: {source}")]
    Spawn {
        backend: String,
        command: Vec<String>,
        #[source]
        source: std::io::Error,
    },
    #[error("Backend '{backend}' could not stage the input file: {source}")]
    InputFile {
        backend: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Backend '{backend}' failed while waiting for the child: {source}")]
    Wait {
        backend: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs program text to completion or termination within a wall-clock bound.
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;
    fn execute(&self, source: &str, timeout_ms: u64) -> Result<ExecutionResult, HarnessError>;
}

/// Per-test execution budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub startup_allowance_ms: u64,
    /// Budget of tests that carry no operation timeouts.
    pub default_timeout_ms: u64,
    /// Replaces every computed budget when set.
    pub override_ms: Option<u64>,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            startup_allowance_ms: DEFAULT_STARTUP_ALLOWANCE_MS,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            override_ms: None,
        }
    }
}

impl TimeoutPolicy {
    pub fn budget_for(&self, test: &GeneratedTest) -> u64 {
        if let Some(ms) = self.override_ms {
            return ms;
        }
        match test.declared_timeout_ms() {
            Some(total) => total.saturating_add(self.startup_allowance_ms),
            None => self.default_timeout_ms,
        }
    }
}

/// Runs a Rust closure as the harness. Meant for tests and doubles only: the
/// call is never preempted, so a hung closure hangs the caller and the
/// timeout bound holds only for calls that eventually return. Wire real
/// toolchains through [`CommandExecutor`].
pub struct InProcessExecutor<F>
where
    F: Fn(&str) -> Result<String, String>,
{
    name: String,
    harness_fn: F,
}

impl<F> InProcessExecutor<F>
where
    F: Fn(&str) -> Result<String, String>,
{
    pub fn new(name: impl Into<String>, harness_fn: F) -> Self {
        Self {
            name: name.into(),
            harness_fn,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

/// In-process harness: `Ok(stdout)` completes, `Err(stderr)` and panics crash.
/// The call cannot be preempted, so an overrun is classified after the fact.
impl<F> Executor for InProcessExecutor<F>
where
    F: Fn(&str) -> Result<String, String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, source: &str, timeout_ms: u64) -> Result<ExecutionResult, HarnessError> {
        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.harness_fn)(source)));
        let duration_ms = start.elapsed().as_millis() as u64;

        let (status, stdout, stderr, exit_code) = match outcome {
            Ok(Ok(stdout)) => (ExecutionStatus::Completed, stdout, String::new(), 0),
            Ok(Err(stderr)) => (ExecutionStatus::Crashed, String::new(), stderr, 1),
            Err(payload) => (
                ExecutionStatus::Crashed,
                String::new(),
                panic_message(payload.as_ref()),
                PANIC_EXIT_CODE,
            ),
        };
        if duration_ms > timeout_ms {
            return Ok(ExecutionResult {
                status: ExecutionStatus::Timeout,
                duration_ms: timeout_ms,
                stdout,
                stderr,
                exit_code: None,
                signal: None,
                truncated: false,
            });
        }
        Ok(ExecutionResult {
            status,
            duration_ms,
            stdout,
            stderr,
            exit_code: Some(exit_code),
            signal: None,
            truncated: false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputDelivery {
    StdIn,
    /// Source written to a temp file; `{}` in `template` becomes its path.
    File { template: String, suffix: String },
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    pub name: String,
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub working_dir: Option<PathBuf>,
    /// Bytes kept per stream; the rest is drained and dropped.
    pub output_limit: usize,
    pub poll_interval: Duration,
}

impl CommandExecutorConfig {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            input_delivery: InputDelivery::StdIn,
            working_dir: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Runs the toolchain as a child process in its own process group. On
/// timeout the whole group is killed.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandExecutorConfig {
        &self.config
    }

    fn wait_with_deadline(
        &self,
        child: &mut Child,
        start: Instant,
        timeout: Duration,
    ) -> Result<Option<std::process::ExitStatus>, HarnessError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(Some(status)),
                Ok(None) => {
                    if start.elapsed() >= timeout {
                        debug!(backend = %self.config.name, "target timed out, killing process group");
                        kill_process_group(child, &self.config.name);
                        let _ = child.wait();
                        return Ok(None);
                    }
                    thread::sleep(self.config.poll_interval);
                }
                Err(source) => {
                    kill_process_group(child, &self.config.name);
                    let _ = child.wait();
                    return Err(HarnessError::Wait {
                        backend: self.config.name.clone(),
                        source,
                    });
                }
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child, backend: &str) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => {
            warn!(backend, %errno, "killpg failed, killing the child only");
            let _ = child.kill();
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child, _backend: &str) {
    let _ = child.kill();
}

fn spawn_capture<R: Read + Send + 'static>(mut reader: R, limit: usize) -> JoinHandle<(Vec<u8>, bool)> {
    thread::spawn(move || {
        let mut kept = Vec::new();
        let mut truncated = false;
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let room = limit.saturating_sub(kept.len());
                    if n > room {
                        truncated = true;
                    }
                    kept.extend_from_slice(&buf[..n.min(room)]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        (kept, truncated)
    })
}

fn join_capture(handle: Option<JoinHandle<(Vec<u8>, bool)>>) -> (String, bool) {
    let (bytes, truncated) = handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();
    (String::from_utf8_lossy(&bytes).into_owned(), truncated)
}

impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn execute(&self, source: &str, timeout_ms: u64) -> Result<ExecutionResult, HarnessError> {
        let backend = &self.config.name;
        let (program, args) =
            self.config
                .command
                .split_first()
                .ok_or_else(|| HarnessError::EmptyCommand {
                    backend: backend.clone(),
                })?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }

        // Kept alive until the child has been reaped.
        let mut _input_file: Option<tempfile::NamedTempFile> = None;
        match &self.config.input_delivery {
            InputDelivery::StdIn => {
                cmd.stdin(Stdio::piped());
            }
            InputDelivery::File { template, suffix } => {
                let input_err = |source| HarnessError::InputFile {
                    backend: backend.clone(),
                    source,
                };
                let mut file = tempfile::Builder::new()
                    .prefix("shadowfuzz-")
                    .suffix(suffix)
                    .tempfile()
                    .map_err(input_err)?;
                file.write_all(source.as_bytes())
                    .and_then(|_| file.flush())
                    .map_err(input_err)?;
                let path = file.path().to_string_lossy().into_owned();
                for part in template.replace("{}", &path).split_whitespace() {
                    cmd.arg(part);
                }
                cmd.stdin(Stdio::null());
                _input_file = Some(file);
            }
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| HarnessError::Spawn {
            backend: backend.clone(),
            command: self.config.command.clone(),
            source,
        })?;

        let writer = child.stdin.take().map(|mut stdin| {
            let data = source.as_bytes().to_vec();
            // A target that exits without reading closes the pipe early.
            thread::spawn(move || {
                let _ = stdin.write_all(&data);
            })
        });
        let limit = self.config.output_limit;
        let stdout_reader = child.stdout.take().map(|out| spawn_capture(out, limit));
        let stderr_reader = child.stderr.take().map(|err| spawn_capture(err, limit));

        let exit = self.wait_with_deadline(&mut child, start, Duration::from_millis(timeout_ms));
        let elapsed_ms = start.elapsed().as_millis() as u64;
        // Descendants that outlive the leader would keep the pipes open.
        kill_process_group(&mut child, backend);
        if let Some(writer) = writer {
            let _ = writer.join();
        }
        let (stdout, out_truncated) = join_capture(stdout_reader);
        let (stderr, err_truncated) = join_capture(stderr_reader);
        let exit = exit?;

        let result = match exit {
            None => ExecutionResult {
                status: ExecutionStatus::Timeout,
                duration_ms: timeout_ms,
                stdout,
                stderr,
                exit_code: None,
                signal: None,
                truncated: out_truncated || err_truncated,
            },
            Some(status) => {
                #[cfg(unix)]
                let signal = {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal()
                };
                #[cfg(not(unix))]
                let signal = None;
                ExecutionResult {
                    status: if status.success() {
                        ExecutionStatus::Completed
                    } else {
                        ExecutionStatus::Crashed
                    },
                    duration_ms: elapsed_ms,
                    stdout,
                    stderr,
                    exit_code: status.code(),
                    signal,
                    truncated: out_truncated || err_truncated,
                }
            }
        };
        debug!(
            backend = %backend,
            status = ?result.status,
            duration_ms = result.duration_ms,
            exit_code = ?result.exit_code,
            "execution finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod in_process_executor_tests {
    use super::*;

    fn echo_harness(source: &str) -> Result<String, String> {
        if source.contains("fail") {
            return Err("rejected".to_string());
        }
        Ok(source.to_uppercase())
    }

    fn panicking_harness(source: &str) -> Result<String, String> {
        if source.starts_with("boom") {
            panic!("Boom!");
        }
        Ok(String::new())
    }

    #[test]
    fn in_process_executor_runs_harness() {
        let executor = InProcessExecutor::new("local", echo_harness);
        let result = executor.execute("abc", 1000).unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.stdout, "ABC");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(executor.name(), "local");
    }

    #[test]
    fn in_process_error_is_a_crash() {
        let executor = InProcessExecutor::new("local", echo_harness);
        let result = executor.execute("fail", 1000).unwrap();
        assert_eq!(result.status, ExecutionStatus::Crashed);
        assert_eq!(result.stderr, "rejected");
    }

    #[test]
    fn in_process_executor_catches_panic() {
        let executor = InProcessExecutor::new("local", panicking_harness);
        let result = executor.execute("boom", 1000).unwrap();
        assert_eq!(result.status, ExecutionStatus::Crashed);
        assert_eq!(result.exit_code, Some(PANIC_EXIT_CODE));
        assert!(result.stderr.contains("Boom!"));
    }

    #[test]
    fn in_process_overrun_is_a_timeout() {
        let executor = InProcessExecutor::new("slow", |_: &str| {
            thread::sleep(Duration::from_millis(30));
            Ok(String::new())
        });
        let result = executor.execute("", 5).unwrap();
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.duration_ms, 5);
    }

    #[test]
    fn budget_sums_operation_timeouts() {
        use crate::schema::TypeTag;
        use crate::testcase::{OperationCall, StrategyKind};

        let call = |timeout_ms| OperationCall {
            operation: "op".into(),
            arguments: Vec::new(),
            returns: TypeTag::Unit,
            timeout_ms,
        };
        let mut test = GeneratedTest::from_source("t", "", StrategyKind::Schema);
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.budget_for(&test), DEFAULT_TIMEOUT_MS);

        test.constructor_call = Some(call(100));
        test.operation_sequence = vec![call(1000), call(1000)];
        assert_eq!(policy.budget_for(&test), 2100 + DEFAULT_STARTUP_ALLOWANCE_MS);

        let forced = TimeoutPolicy {
            override_ms: Some(50),
            ..policy
        };
        assert_eq!(forced.budget_for(&test), 50);
    }
}

#[cfg(all(test, unix))]
mod command_executor_tests {
    use super::*;

    fn get_test_target_path(name: &str) -> PathBuf {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.join("../test_targets").join(name)
    }

    fn script_executor(name: &str) -> CommandExecutor {
        let target_path = get_test_target_path(name);
        if !target_path.exists() {
            panic!("Test target missing: {target_path:?}");
        }
        CommandExecutor::new(CommandExecutorConfig::new(
            name,
            vec!["/bin/sh".to_string(), target_path.to_string_lossy().into_owned()],
        ))
    }

    #[test]
    fn cmd_exec_successful_run_stdin() {
        let executor = script_executor("echo_ok.sh");
        let result = executor.execute("hello\n", 2000).unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.truncated);
    }

    #[test]
    fn cmd_exec_crash_detection() {
        let executor = script_executor("crash.sh");
        let result = executor.execute("", 2000).unwrap();
        assert_eq!(result.status, ExecutionStatus::Crashed);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.stderr.contains("boom"));
    }

    #[test]
    fn cmd_exec_signal_is_a_crash() {
        let executor = script_executor("signal.sh");
        let result = executor.execute("", 2000).unwrap();
        assert_eq!(result.status, ExecutionStatus::Crashed);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.signal, Some(9));
    }

    #[test]
    fn cmd_exec_timeout_kills_process_group() {
        let executor = script_executor("hang.sh");
        let start = Instant::now();
        let result = executor.execute("", 200).unwrap();
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.duration_ms, 200);
        // hang.sh leaves a background sleep holding the pipes open.
        assert!(start.elapsed() < Duration::from_secs(3), "{:?}", start.elapsed());
    }

    #[test]
    fn cmd_exec_input_via_file() {
        let target = get_test_target_path("print_file.sh");
        let mut config = CommandExecutorConfig::new(
            "file",
            vec!["/bin/sh".to_string(), target.to_string_lossy().into_owned()],
        );
        config.input_delivery = InputDelivery::File {
            template: "{}".to_string(),
            suffix: ".src".to_string(),
        };
        let executor = CommandExecutor::new(config);
        let result = executor.execute("print(1)\n", 2000).unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.stdout, "print(1)\n");
    }

    #[test]
    fn cmd_exec_output_is_capped() {
        let mut executor = script_executor("big_output.sh");
        executor.config.output_limit = 1024;
        let result = executor.execute("", 5000).unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.stdout.len(), 1024);
        assert!(result.truncated);
    }

    #[test]
    fn cmd_exec_invalid_command() {
        let executor = CommandExecutor::new(CommandExecutorConfig::new(
            "missing",
            vec!["./this_command_does_not_exist_ever_12345.sh".to_string()],
        ));
        assert!(matches!(
            executor.execute("", 1000),
            Err(HarnessError::Spawn { backend, .. }) if backend == "missing"
        ));

        let empty = CommandExecutor::new(CommandExecutorConfig::new("empty", Vec::new()));
        assert!(matches!(
            empty.execute("", 1000),
            Err(HarnessError::EmptyCommand { .. })
        ));
    }
}
