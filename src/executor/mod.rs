//! Supervised execution of the infrastructure tool
//!
//! The [`Executor`] owns every invocation of the declarative-infrastructure
//! tool in one working directory:
//!
//! 1. Construction locates the binary and refuses to continue unless its
//!    version satisfies the configured requirement.
//! 2. [`Executor::execute_async`] starts the tool with stdout/stderr appended
//!    to `logs/<pid>.log` and returns immediately. A background waiter records
//!    `logs/<pid>.fail` if the process exits unsuccessfully.
//! 3. [`Executor::execute`] runs the waiter alongside a log follower that
//!    forwards tool output to the operator, then derives the final status.
//! 4. [`Executor::execute_sync`] / [`Executor::output`] capture stdout for
//!    structured queries such as `output -json`.
//!
//! Only one invocation per working directory runs at a time (see [`lease`]).
//! A cancelled [`CancellationToken`] terminates the tool's process group.

pub mod lease;
pub mod status;
pub mod steps;
pub mod version;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use status::ExecutionStatus;
pub use steps::{ExecutionStep, StepHook};

use crate::{Error, Result};

/// Default tool binary name
pub const DEFAULT_TOOL: &str = "terraform";

/// Subdirectory of the working directory holding per-invocation logs
pub const LOG_DIR_NAME: &str = "logs";

/// How often the log follower looks for new output
const FOLLOW_INTERVAL: Duration = Duration::from_millis(100);

/// Where forwarded tool output goes.
#[derive(Clone, Debug, Default)]
pub enum OutputSink {
    /// Print each line to stdout
    #[default]
    Stdout,
    /// Do not follow the log at all
    Quiet,
    /// Collect lines in memory
    Buffer(Arc<Mutex<Vec<String>>>),
}

impl OutputSink {
    /// In-memory sink plus a handle to read what it collected
    pub fn buffer() -> (Self, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        (Self::Buffer(lines.clone()), lines)
    }

    fn is_quiet(&self) -> bool {
        matches!(self, Self::Quiet)
    }

    fn write_line(&self, line: &str) {
        match self {
            Self::Stdout => println!("{}", line),
            Self::Quiet => {}
            Self::Buffer(lines) => lines.lock().push(line.to_string()),
        }
    }
}

/// Configuration for an [`Executor`]
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Directory the tool runs in; also holds its state and `logs/`
    pub working_dir: PathBuf,
    /// Explicit binary path; skips the search when set
    pub binary: Option<PathBuf>,
    /// Binary name to search for
    pub tool: String,
    /// Semantic-version requirement the tool must satisfy
    pub version_requirement: String,
    /// Destination for forwarded tool output
    pub output: OutputSink,
    /// Cancelling this token terminates running invocations
    pub cancel: CancellationToken,
}

impl ExecutorConfig {
    /// Defaults for the given working directory
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            binary: None,
            tool: DEFAULT_TOOL.to_string(),
            version_requirement: version::DEFAULT_VERSION_REQUIREMENT.to_string(),
            output: OutputSink::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Handle to one running (or finished) invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// OS process id; also the process group id
    pub pid: u32,
    /// Arguments the tool was started with
    pub args: Vec<String>,
    /// Working directory of the run
    pub working_dir: PathBuf,
    /// Combined stdout/stderr of the run
    pub log_path: PathBuf,
    /// Created only if the process exits unsuccessfully
    pub failure_marker: PathBuf,
    done: watch::Receiver<bool>,
}

impl Invocation {
    /// Resolve once the exit waiter has finished recording the outcome
    pub async fn completed(&self) {
        let mut done = self.done.clone();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Infrastructure tool operations the orchestrators and platforms rely on.
///
/// Implemented by [`Executor`]; mocked in orchestration tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfraTool: Send + Sync {
    /// Prepare the working directory (providers, modules, backend)
    async fn init(&self) -> Result<()>;

    /// Show the changes an apply would make, without making them
    async fn plan(&self) -> Result<()>;

    /// Run the tool with arbitrary arguments and wait for it
    async fn execute(&self, args: &[String]) -> Result<()>;

    /// Run steps strictly in order, stopping at the first failure
    async fn execute_steps(&self, steps: Vec<ExecutionStep>) -> Result<()>;

    /// The full output map as JSON (empty object when nothing was applied)
    async fn outputs(&self) -> Result<serde_json::Value>;

    /// One named output as JSON
    async fn output_value(&self, key: &str) -> Result<serde_json::Value>;
}

/// True when the tool reports any outputs at all.
///
/// Computed fresh on each call; the content of the outputs is irrelevant.
pub async fn cluster_exists(tool: &dyn InfraTool) -> Result<bool> {
    let outputs = tool.outputs().await?;
    Ok(match outputs {
        serde_json::Value::Object(map) => !map.is_empty(),
        serde_json::Value::Null => false,
        _ => true,
    })
}

/// Fetch a named output and deserialize it into `T`.
pub async fn output<T: DeserializeOwned>(tool: &dyn InfraTool, key: &str) -> Result<T> {
    let value = tool.output_value(key).await?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization(format!("output '{}': {}", key, e)))
}

/// Supervises the infrastructure tool in one working directory.
#[derive(Debug)]
pub struct Executor {
    binary: PathBuf,
    working_dir: PathBuf,
    log_dir: PathBuf,
    version: semver::Version,
    output: OutputSink,
    cancel: CancellationToken,
}

impl Executor {
    /// Locate the tool, check its version and bind it to the working directory.
    pub async fn new(config: ExecutorConfig) -> Result<Self> {
        let binary = match &config.binary {
            Some(path) if path.is_file() => path.clone(),
            Some(path) => {
                return Err(Error::ToolNotFound {
                    tool: config.tool.clone(),
                    searched: path.display().to_string(),
                })
            }
            None => find_binary(&config.tool)?,
        };

        let version_output = Command::new(&binary)
            .arg("version")
            .stdin(Stdio::null())
            .output()
            .await?;
        if !version_output.status.success() {
            return Err(Error::ToolFailed {
                args: "version".to_string(),
                dir: config.working_dir.clone(),
                log_path: None,
                message: String::from_utf8_lossy(&version_output.stderr).trim().to_string(),
            });
        }

        let version = version::parse_version(&String::from_utf8_lossy(&version_output.stdout))?;
        version::ensure_compatible(&version, &config.version_requirement)?;

        debug!(binary = %binary.display(), %version, "infrastructure tool ready");

        Ok(Self {
            binary,
            log_dir: config.working_dir.join(LOG_DIR_NAME),
            working_dir: config.working_dir,
            version,
            output: config.output,
            cancel: config.cancel,
        })
    }

    /// Working directory this executor is bound to
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Version reported by the tool at construction
    pub fn version(&self) -> &semver::Version {
        &self.version
    }

    /// Start the tool and return without waiting for it.
    ///
    /// Fails with [`Error::DirectoryBusy`] if another invocation is running
    /// in the same working directory.
    pub async fn execute_async(&self, args: &[String]) -> Result<Invocation> {
        let lease = lease::try_acquire(&self.working_dir)?;
        tokio::fs::create_dir_all(&self.log_dir).await?;

        let mut child = Command::new(&self.binary)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| self.tool_failed(args, None, format!("failed to start: {}", e)))?;

        let pid = child
            .id()
            .ok_or_else(|| self.tool_failed(args, None, "process exited before it was tracked"))?;

        let log_path = status::log_file(&self.log_dir, pid);
        let failure_marker = status::failure_marker(&self.log_dir, pid);

        let (log, log_err) = match open_log(&log_path).await {
            Ok(files) => files,
            Err(e) => {
                warn!(pid, error = %e, "cannot open tool log, stopping the tool");
                abandon(child, pid).await;
                return Err(self.tool_failed(
                    args,
                    None,
                    format!("failed to open {}: {}", log_path.display(), e),
                ));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = self.cancel.clone();
        let marker = failure_marker.clone();

        info!(pid, args = %args.join(" "), "started infrastructure tool");

        tokio::spawn(async move {
            let wait = async {
                let exited = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = cancel.cancelled() => None,
                };
                match exited {
                    Some(status) => status,
                    None => {
                        warn!(pid, "cancellation requested, terminating tool");
                        terminate_group(pid);
                        child.wait().await
                    }
                }
            };
            let (exit, _, _) = tokio::join!(wait, pipe_into(stdout, log), pipe_into(stderr, log_err));

            let failure = match exit {
                Ok(status) if status.success() => None,
                Ok(status) => Some(status.to_string()),
                Err(e) => Some(format!("waiting for process failed: {}", e)),
            };
            if let Some(reason) = failure {
                if let Err(e) = tokio::fs::write(&marker, reason.as_bytes()).await {
                    warn!(pid, error = %e, "failed to write failure marker");
                }
            }

            drop(lease);
            let _ = done_tx.send(true);
        });

        Ok(Invocation {
            pid,
            args: args.to_vec(),
            working_dir: self.working_dir.clone(),
            log_path,
            failure_marker,
            done: done_rx,
        })
    }

    /// Run the tool to completion, forwarding its output as it is written.
    pub async fn execute(&self, args: &[String]) -> Result<()> {
        let invocation = self.execute_async(args).await?;

        let (_, followed) = tokio::join!(
            invocation.completed(),
            self.follow_log(&invocation.log_path, invocation.done.clone())
        );
        if let Err(e) = followed {
            warn!(pid = invocation.pid, error = %e, "following tool output failed");
        }

        match self.status(invocation.pid)? {
            ExecutionStatus::Success => Ok(()),
            other => {
                let reason = tokio::fs::read_to_string(&invocation.failure_marker)
                    .await
                    .ok()
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| format!("finished with status {}", other));
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                Err(self.tool_failed(args, Some(invocation.log_path), reason))
            }
        }
    }

    /// Run the tool to completion and return its raw stdout.
    pub async fn execute_sync(&self, args: &[String]) -> Result<Vec<u8>> {
        let _lease = lease::try_acquire(&self.working_dir)?;

        let child = Command::new(&self.binary)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.tool_failed(args, None, format!("failed to start: {}", e)))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        };

        if !output.status.success() {
            return Err(self.tool_failed(
                args,
                None,
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        Ok(output.stdout)
    }

    /// Fetch a named output and deserialize it into `T`.
    pub async fn output<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let raw = self.execute_sync(&output_args(Some(key))).await?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::serialization(format!("output '{}': {}", key, e)))
    }

    /// Status of an invocation started from this working directory.
    pub fn status(&self, pid: u32) -> Result<ExecutionStatus> {
        status::status(&self.log_dir, pid)
    }

    async fn follow_log(&self, path: &Path, mut done: watch::Receiver<bool>) -> Result<()> {
        if self.output.is_quiet() {
            return Ok(());
        }

        let mut file = tokio::fs::File::open(path).await?;
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; 8192];
        let mut writer_gone = false;

        loop {
            // Read the flag before draining so the final pass sees all output.
            let finished = *done.borrow_and_update() || writer_gone;

            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    self.output
                        .write_line(String::from_utf8_lossy(&line[..line.len() - 1]).as_ref());
                }
            }

            if finished {
                if !pending.is_empty() {
                    self.output.write_line(String::from_utf8_lossy(&pending).as_ref());
                }
                return Ok(());
            }

            tokio::select! {
                changed = done.changed() => writer_gone = changed.is_err(),
                _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
            }
        }
    }

    fn tool_failed(
        &self,
        args: &[String],
        log_path: Option<PathBuf>,
        message: impl Into<String>,
    ) -> Error {
        Error::ToolFailed {
            args: args.join(" "),
            dir: self.working_dir.clone(),
            log_path,
            message: message.into(),
        }
    }
}

#[async_trait]
impl InfraTool for Executor {
    async fn init(&self) -> Result<()> {
        self.execute(&to_args(["init", "-input=false"])).await
    }

    async fn plan(&self) -> Result<()> {
        self.execute(&to_args(["plan", "-input=false"])).await
    }

    async fn execute(&self, args: &[String]) -> Result<()> {
        Executor::execute(self, args).await
    }

    async fn execute_steps(&self, steps: Vec<ExecutionStep>) -> Result<()> {
        let total = steps.len();
        for (i, step) in steps.into_iter().enumerate() {
            info!(step = %step.description, "[{}/{}] running step", i + 1, total);
            if let Some(hook) = &step.pre_execution_hook {
                hook.before(&step.description).await?;
            }
            Executor::execute(self, &step.args).await?;
        }
        Ok(())
    }

    async fn outputs(&self) -> Result<serde_json::Value> {
        let raw = self.execute_sync(&output_args(None)).await?;
        serde_json::from_slice(&raw).map_err(|e| Error::serialization(format!("outputs: {}", e)))
    }

    async fn output_value(&self, key: &str) -> Result<serde_json::Value> {
        self.output(key).await
    }
}

fn output_args(key: Option<&str>) -> Vec<String> {
    let mut args = to_args(["output", "-json"]);
    if let Some(key) = key {
        args.push(key.to_string());
    }
    args
}

/// Convert string literals into an owned argument list
pub fn to_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter().map(Into::into).collect()
}

/// Search order: next to the running binary, the current directory, `PATH`.
pub fn find_binary(tool: &str) -> Result<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        candidates.push(dir.join(tool));
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join(tool));
    }
    if let Some(path) = std::env::var_os("PATH") {
        candidates.extend(std::env::split_paths(&path).map(|dir| dir.join(tool)));
    }

    candidates
        .iter()
        .find(|c| c.is_file())
        .cloned()
        .ok_or_else(|| Error::ToolNotFound {
            tool: tool.to_string(),
            searched: candidates
                .iter()
                .map(|c| c.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
}

async fn pipe_into<R>(source: Option<R>, mut log: tokio::fs::File)
where
    R: AsyncRead + Unpin,
{
    if let Some(mut source) = source {
        if let Err(e) = tokio::io::copy(&mut source, &mut log).await {
            warn!(error = %e, "copying tool output to log failed");
        }
    }
}

/// Log file for one invocation, plus a second handle for stderr
async fn open_log(path: &Path) -> std::io::Result<(tokio::fs::File, tokio::fs::File)> {
    let log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let log_err = log.try_clone().await?;
    Ok((log, log_err))
}

/// Stop a tool that can no longer be supervised and reap it.
///
/// Returns only after the process has exited, so a lease held by the caller
/// still covers the whole lifetime of the process.
async fn abandon(mut child: tokio::process::Child, pid: u32) {
    terminate_group(pid);
    if let Err(e) = child.start_kill() {
        debug!(pid, error = %e, "tool already gone");
    }
    if let Err(e) = child.wait().await {
        warn!(pid, error = %e, "waiting for abandoned tool failed");
    }
}

fn terminate_group(pid: u32) {
    if pid == 0 || pid > i32::MAX as u32 {
        return;
    }
    // The tool runs in its own process group whose id equals its pid.
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_arguments_request_json() {
        assert_eq!(output_args(None), vec!["output", "-json"]);
        assert_eq!(
            output_args(Some("kubernetes_values")),
            vec!["output", "-json", "kubernetes_values"]
        );
    }

    #[tokio::test]
    async fn empty_output_map_means_no_cluster() {
        let mut tool = MockInfraTool::new();
        tool.expect_outputs()
            .returning(|| Ok(serde_json::json!({})));
        assert!(!cluster_exists(&tool).await.unwrap());
    }

    #[tokio::test]
    async fn any_output_means_cluster_exists() {
        let mut tool = MockInfraTool::new();
        tool.expect_outputs().returning(|| {
            Ok(serde_json::json!({ "anything": { "value": "", "type": "string" } }))
        });
        assert!(cluster_exists(&tool).await.unwrap());
    }

    #[tokio::test]
    async fn existence_check_propagates_query_failure() {
        let mut tool = MockInfraTool::new();
        tool.expect_outputs()
            .returning(|| Err(Error::validation("state locked")));
        assert!(cluster_exists(&tool).await.is_err());
    }

    #[tokio::test]
    async fn typed_output_deserializes_value() {
        let mut tool = MockInfraTool::new();
        tool.expect_output_value()
            .withf(|key| key == "worker_count")
            .returning(|_| Ok(serde_json::json!(3)));
        let count: u32 = output(&tool, "worker_count").await.unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn missing_binary_lists_searched_locations() {
        let err = find_binary("definitely-not-a-real-tool-name").unwrap_err();
        match err {
            Error::ToolNotFound { tool, searched } => {
                assert_eq!(tool, "definitely-not-a-real-tool-name");
                assert!(!searched.is_empty());
            }
            other => panic!("expected ToolNotFound, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abandoned_tool_is_stopped_before_returning() {
        let child = Command::new("/bin/sh")
            .args(["-c", "sleep 30"])
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert!(status::pid_alive(pid));

        let started = std::time::Instant::now();
        abandon(child, pid).await;

        assert!(!status::pid_alive(pid));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn log_files_open_for_append() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("42.log");
        std::fs::write(&path, "earlier\n").unwrap();

        let (mut out, mut err) = open_log(&path).await.unwrap();
        out.write_all(b"stdout\n").await.unwrap();
        err.write_all(b"stderr\n").await.unwrap();
        out.flush().await.unwrap();
        err.flush().await.unwrap();

        let log = std::fs::read_to_string(&path).unwrap();
        assert!(log.starts_with("earlier\n"));
        assert!(log.contains("stdout\n") && log.contains("stderr\n"));
    }

    #[tokio::test]
    async fn unopenable_log_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-dir").join("1.log");
        assert!(open_log(&missing).await.is_err());
    }

    #[test]
    fn buffer_sink_collects_lines() {
        let (sink, lines) = OutputSink::buffer();
        sink.write_line("Apply complete!");
        assert_eq!(lines.lock().as_slice(), ["Apply complete!"]);
        assert!(OutputSink::Quiet.is_quiet());
    }
}
