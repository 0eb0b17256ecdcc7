//! # Stage: Sandbox Runner
//!
//! ## Responsibility
//! Run a candidate change in an isolated, time- and memory-bounded child
//! process and report a structured [`SandboxOutcome`].
//!
//! [`ProcessSandbox`] does, per trial:
//! 1. Create a fresh temporary directory, copy the configured base project
//!    into it (skipping `target/` and `.git/`) and overlay the candidate's
//!    files (absolute paths and `..` components are rejected).
//! 2. Spawn the candidate command there in its own process group with a
//!    cleared environment (`PATH` optionally inherited, `HOME`/`TMPDIR`
//!    pointed at the sandbox).
//! 3. Cap the address space with `ulimit -v` (unix) and sample resident memory
//!    from `/proc/<pid>/status` (linux), killing the group when it exceeds the
//!    limit.
//! 4. Kill the group when the wall-clock limit expires.
//! 5. Kill whatever is left of the group and delete the directory.
//!
//! A child that prints a JSON [`TrialReport`] as its last stdout line supplies
//! test results, validation results and before/after metrics.
//!
//! ## Guarantees
//! - A runtime failure and a timeout are distinct [`TrialResult`] variants;
//!   only infrastructure problems surface as [`SandboxError`].
//! - No process of the candidate's group outlives `execute`, including
//!   backgrounded grandchildren and an `execute` future that is dropped.

use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::{ConfigError, SandboxError};
use crate::model::{Evolution, EvolutionMetrics, TestResults, ValidationResults};

/// How long to wait for output pipes to drain after the child exits.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Directory names never copied from the base project.
const SKIPPED_DIRS: &[&str] = &["target", ".git"];

// ---------------------------------------------------------------------------
// Config and limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    pub memory_bytes: u64,
    /// Command run inside the sandbox directory, e.g. `["cargo", "test"]`.
    pub command: Vec<String>,
    /// Pass the host `PATH` through to the child.
    pub inherit_path: bool,
    /// Resident-memory sampling period.
    pub sample_interval_ms: u64,
    /// Project copied into every sandbox before the candidate's files are
    /// written over it.
    pub base_dir: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            memory_bytes: 1024 * 1024 * 1024,
            command: vec!["cargo".into(), "test".into(), "--quiet".into()],
            inherit_path: true,
            sample_interval_ms: 50,
            base_dir: None,
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("sandbox.timeout_ms", "must be > 0"));
        }
        if self.memory_bytes == 0 {
            return Err(ConfigError::invalid("sandbox.memory_bytes", "must be > 0"));
        }
        if self.command.first().map_or(true, |c| c.trim().is_empty()) {
            return Err(ConfigError::invalid("sandbox.command", "must name a program"));
        }
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::invalid("sandbox.sample_interval_ms", "must be > 0"));
        }
        if let Some(base) = &self.base_dir {
            if !base.is_dir() {
                return Err(ConfigError::invalid("sandbox.base_dir", format!("{} is not a directory", base.display())));
            }
        }
        Ok(())
    }

    pub fn limits(&self) -> SandboxLimits {
        SandboxLimits { timeout: Duration::from_millis(self.timeout_ms), memory_bytes: self.memory_bytes }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub memory_bytes: u64,
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFile {
    /// Path relative to the sandbox root.
    pub path: String,
    pub contents: String,
}

/// Everything the sandbox needs to run one trial.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub evolution_id: String,
    pub files: Vec<CandidateFile>,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Candidate {
    /// Materialise the post-change contents of every file the evolution touches.
    pub fn from_evolution(evolution: &Evolution, command: Vec<String>) -> Self {
        Self {
            evolution_id: evolution.id.clone(),
            files: evolution
                .changes
                .iter()
                .map(|c| CandidateFile { path: c.file.clone(), contents: c.after.clone() })
                .collect(),
            command,
            env: vec![("EVOLUTION_ID".into(), evolution.id.clone())],
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Resident memory of the child in bytes.  All zero where sampling is
/// unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemoryUsage {
    pub start: u64,
    pub end: u64,
    pub peak: u64,
}

/// Structured results a candidate may print as its last stdout line.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialReport {
    pub test_results: Option<TestResults>,
    pub validation_results: Option<ValidationResults>,
    pub metrics: Option<EvolutionMetrics>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrialResult {
    Success { stdout: String, report: Option<TrialReport> },
    Error { message: String, stack: Option<String>, exit_code: Option<i32> },
    Timeout { limit: Duration },
}

impl std::fmt::Display for TrialResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrialResult::Success { .. } => write!(f, "success"),
            TrialResult::Error { message, .. } => write!(f, "error: {message}"),
            TrialResult::Timeout { limit } => write!(f, "timed out after {limit:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxOutcome {
    pub execution_time: Duration,
    pub memory: MemoryUsage,
    pub result: TrialResult,
}

impl SandboxOutcome {
    pub fn success(&self) -> bool {
        matches!(self.result, TrialResult::Success { .. })
    }
}

#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn execute(&self, candidate: &Candidate, limits: SandboxLimits) -> Result<SandboxOutcome, SandboxError>;
}

// ---------------------------------------------------------------------------
// ProcessSandbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    inherit_path: bool,
    sample_interval: Duration,
    base_dir: Option<PathBuf>,
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new(&SandboxConfig::default())
    }
}

enum Exit {
    Status(ExitStatus),
    TimedOut,
    OutOfMemory(u64),
}

impl ProcessSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            inherit_path: config.inherit_path,
            sample_interval: Duration::from_millis(config.sample_interval_ms.max(1)),
            base_dir: config.base_dir.clone(),
        }
    }

    async fn prepare(&self, candidate: &Candidate, root: &Path) -> Result<(), SandboxError> {
        if let Some(base) = &self.base_dir {
            copy_tree(base, root).await?;
        }
        for file in &candidate.files {
            let target = resolve_inside(root, &file.path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(SandboxError::Setup)?;
            }
            tokio::fs::write(&target, &file.contents).await.map_err(SandboxError::Setup)?;
        }
        Ok(())
    }

    fn build_command(&self, candidate: &Candidate, root: &Path, limits: SandboxLimits) -> Command {
        #[cfg(unix)]
        let mut cmd = {
            let kb = (limits.memory_bytes / 1024).max(1);
            let mut c = Command::new("/bin/sh");
            c.arg("-c")
                .arg(format!("ulimit -v {kb} 2>/dev/null; exec \"$0\" \"$@\""))
                .args(&candidate.command);
            c
        };
        #[cfg(not(unix))]
        let mut cmd = {
            let _ = limits;
            let mut c = Command::new(&candidate.command[0]);
            c.args(&candidate.command[1..]);
            c
        };

        cmd.current_dir(root).env_clear();
        if self.inherit_path {
            if let Some(path) = std::env::var_os("PATH") {
                cmd.env("PATH", path);
            }
        }
        cmd.env("HOME", root).env("TMPDIR", root);
        for (k, v) in &candidate.env {
            cmd.env(k, v);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl SandboxRunner for ProcessSandbox {
    async fn execute(&self, candidate: &Candidate, limits: SandboxLimits) -> Result<SandboxOutcome, SandboxError> {
        if candidate.command.first().map_or(true, |c| c.is_empty()) {
            return Err(SandboxError::InvalidCandidate("empty command".into()));
        }
        let dir = tempfile::Builder::new().prefix("evo-sandbox-").tempdir().map_err(SandboxError::Setup)?;
        self.prepare(candidate, dir.path()).await?;

        let mut child = self.build_command(candidate, dir.path(), limits).spawn().map_err(SandboxError::Spawn)?;
        let started = Instant::now();
        let pid = child.id();
        let mut group = GroupGuard::new(pid);
        tracing::debug!(
            target: "evolution::sandbox",
            evolution_id = %candidate.evolution_id,
            pid = ?pid,
            "candidate spawned"
        );

        let stdout_task = drain(child.stdout.take());
        let stderr_task = drain(child.stderr.take());

        let mut memory: Option<MemoryUsage> = None;
        let deadline = tokio::time::sleep(limits.timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let exit = loop {
            tokio::select! {
                status = child.wait() => break Exit::Status(status.map_err(SandboxError::Wait)?),
                _ = &mut deadline => {
                    group.kill();
                    let _ = child.kill().await;
                    break Exit::TimedOut;
                }
                _ = ticker.tick() => {
                    let Some((rss, hwm)) = pid.and_then(read_process_memory) else { continue };
                    let m = memory.get_or_insert(MemoryUsage { start: rss, end: rss, peak: rss });
                    m.end = rss;
                    m.peak = m.peak.max(rss).max(hwm);
                    if m.peak > limits.memory_bytes {
                        let peak = m.peak;
                        group.kill();
                        let _ = child.kill().await;
                        break Exit::OutOfMemory(peak);
                    }
                }
            }
        };
        let execution_time = started.elapsed();
        // background jobs may still hold the pipes open
        group.kill();

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;

        let result = match exit {
            Exit::TimedOut => TrialResult::Timeout { limit: limits.timeout },
            Exit::OutOfMemory(peak) => TrialResult::Error {
                message: format!("memory limit exceeded: peak {peak} bytes > {} bytes", limits.memory_bytes),
                stack: non_empty(stderr),
                exit_code: None,
            },
            Exit::Status(status) if status.success() => {
                let report = parse_report(&stdout);
                TrialResult::Success { stdout, report }
            }
            Exit::Status(status) => TrialResult::Error {
                message: format!("candidate exited with {status}"),
                stack: non_empty(stderr),
                exit_code: status.code(),
            },
        };

        if let Err(e) = dir.close() {
            tracing::warn!(target: "evolution::sandbox", error = %e, "failed to remove sandbox directory");
        }
        tracing::info!(
            target: "evolution::sandbox",
            evolution_id = %candidate.evolution_id,
            elapsed_ms = execution_time.as_millis() as u64,
            result = %result,
            "trial finished"
        );

        Ok(SandboxOutcome { execution_time, memory: memory.unwrap_or_default(), result })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Sends `SIGKILL` to the candidate's process group, once, at the latest when
/// dropped.
struct GroupGuard {
    pgid: Option<i32>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid.and_then(|p| i32::try_from(p).ok()) }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(target: "evolution::sandbox", pgid, error = %e, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) {}

/// Copy `from` into `to` recursively, skipping [`SKIPPED_DIRS`] and anything
/// that is neither a file nor a directory.
async fn copy_tree(from: &Path, to: &Path) -> Result<(), SandboxError> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        tokio::fs::create_dir_all(&dst).await.map_err(SandboxError::Setup)?;
        let mut entries = tokio::fs::read_dir(&src).await.map_err(SandboxError::Setup)?;
        while let Some(entry) = entries.next_entry().await.map_err(SandboxError::Setup)? {
            let kind = entry.file_type().await.map_err(SandboxError::Setup)?;
            let name = entry.file_name();
            if kind.is_dir() {
                if SKIPPED_DIRS.iter().any(|skip| name == *skip) {
                    continue;
                }
                pending.push((entry.path(), dst.join(&name)));
            } else if kind.is_file() {
                tokio::fs::copy(entry.path(), dst.join(&name)).await.map_err(SandboxError::Setup)?;
            }
        }
    }
    Ok(())
}

/// Join `relative` onto `root`, refusing anything that could escape it.
fn resolve_inside(root: &Path, relative: &str) -> Result<PathBuf, SandboxError> {
    let rel = Path::new(relative);
    if relative.trim().is_empty() {
        return Err(SandboxError::InvalidCandidate("empty file path".into()));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::InvalidCandidate(format!("path escapes sandbox: {relative}")));
            }
        }
    }
    Ok(root.join(rel))
}

fn drain<R>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut p| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = p.read_to_end(&mut buf).await;
            buf
        })
    })
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(mut handle) = task else { return String::new() };
    match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
        Ok(Ok(buf)) => String::from_utf8_lossy(&buf).into_owned(),
        _ => {
            handle.abort();
            String::new()
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Last non-empty stdout line, if it is a JSON object.
fn parse_report(stdout: &str) -> Option<TrialReport> {
    let line = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// `(VmRSS, VmHWM)` in bytes from a `/proc/<pid>/status` document.
fn parse_proc_status(contents: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        let line = contents.lines().find(|l| l.starts_with(name))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb * 1024)
    };
    let rss = field("VmRSS:")?;
    Some((rss, field("VmHWM:").unwrap_or(rss)))
}

#[cfg(target_os = "linux")]
fn read_process_memory(pid: u32) -> Option<(u64, u64)> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_proc_status(&contents)
}

#[cfg(not(target_os = "linux"))]
fn read_process_memory(_pid: u32) -> Option<(u64, u64)> {
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_dir_rejected() {
        let root = Path::new("/tmp/x");
        assert!(matches!(resolve_inside(root, "../evil"), Err(SandboxError::InvalidCandidate(_))));
        assert!(matches!(resolve_inside(root, "a/../../b"), Err(SandboxError::InvalidCandidate(_))));
        assert!(matches!(resolve_inside(root, "/etc/passwd"), Err(SandboxError::InvalidCandidate(_))));
        assert_eq!(resolve_inside(root, "./src/lib.rs").unwrap(), root.join("./src/lib.rs"));
    }

    #[test]
    fn test_parse_proc_status() {
        let doc = "Name:\tcargo\nVmHWM:\t  2048 kB\nVmRSS:\t  1024 kB\n";
        assert_eq!(parse_proc_status(doc), Some((1024 * 1024, 2048 * 1024)));
        assert_eq!(parse_proc_status("Name:\tzombie\n"), None);
    }

    #[test]
    fn test_parse_report_uses_last_line() {
        let out = "running 3 tests\n{\"test_results\":{\"passed\":true,\"total\":3,\"passed_count\":3,\"failed_count\":0}}\n\n";
        let report = parse_report(out).unwrap();
        assert_eq!(report.test_results.unwrap().total, 3);
        assert!(report.metrics.is_none());
        assert!(parse_report("ok\n").is_none());
    }

    #[test]
    fn test_default_config_valid_and_empty_command_rejected() {
        assert!(SandboxConfig::default().validate().is_ok());
        let cfg = SandboxConfig { command: vec![], ..SandboxConfig::default() };
        assert!(cfg.validate().is_err());
        let cfg = SandboxConfig { base_dir: Some(PathBuf::from("/definitely/not/here")), ..SandboxConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        fn candidate(command: &[&str], files: Vec<CandidateFile>) -> Candidate {
            Candidate {
                evolution_id: "evo-test".into(),
                files,
                command: command.iter().map(|s| s.to_string()).collect(),
                env: vec![],
            }
        }

        fn limits(timeout: Duration) -> SandboxLimits {
            SandboxLimits { timeout, memory_bytes: 1024 * 1024 * 1024 }
        }

        #[tokio::test]
        async fn test_successful_run_parses_report() {
            let c = candidate(
                &[
                    "sh",
                    "-c",
                    "echo building; echo '{\"metrics\":{\"metric\":\"latency\",\"before\":100.0,\"after\":80.0,\"improvement_pct\":20.0}}'",
                ],
                vec![],
            );
            let out = ProcessSandbox::default().execute(&c, limits(Duration::from_secs(10))).await.unwrap();
            assert!(out.success());
            match out.result {
                TrialResult::Success { stdout, report } => {
                    assert!(stdout.contains("building"));
                    assert_eq!(report.unwrap().metrics.unwrap().improvement_pct, 20.0);
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_nonzero_exit_is_error_with_stderr() {
            let c = candidate(&["sh", "-c", "echo oops >&2; exit 3"], vec![]);
            let out = ProcessSandbox::default().execute(&c, limits(Duration::from_secs(10))).await.unwrap();
            match out.result {
                TrialResult::Error { exit_code, stack, .. } => {
                    assert_eq!(exit_code, Some(3));
                    assert!(stack.unwrap().contains("oops"));
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_deadline_kills_child() {
            let c = candidate(&["sleep", "5"], vec![]);
            let out = ProcessSandbox::default().execute(&c, limits(Duration::from_millis(200))).await.unwrap();
            assert_eq!(out.result, TrialResult::Timeout { limit: Duration::from_millis(200) });
            assert!(out.execution_time < Duration::from_secs(4));
        }

        #[tokio::test]
        async fn test_files_materialised_in_sandbox() {
            let c = candidate(
                &["cat", "src/lib.rs"],
                vec![CandidateFile { path: "src/lib.rs".into(), contents: "pub fn hi() {}".into() }],
            );
            let out = ProcessSandbox::default().execute(&c, limits(Duration::from_secs(10))).await.unwrap();
            assert!(matches!(out.result, TrialResult::Success { ref stdout, .. } if stdout == "pub fn hi() {}"));
        }

        #[tokio::test]
        async fn test_environment_is_scoped_to_sandbox() {
            let c = candidate(&["sh", "-c", "echo \"$HOME\""], vec![]);
            let out = ProcessSandbox::default().execute(&c, limits(Duration::from_secs(10))).await.unwrap();
            match out.result {
                TrialResult::Success { stdout, .. } => assert!(stdout.contains("evo-sandbox-")),
                other => panic!("unexpected {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_timeout_kills_backgrounded_grandchild() {
            let outside = tempfile::tempdir().unwrap();
            let marker = outside.path().join("grandchild-ran");
            let script = format!("(sleep 1; touch '{}') & wait", marker.display());
            let c = candidate(&["sh", "-c", &script], vec![]);

            let out = ProcessSandbox::default().execute(&c, limits(Duration::from_millis(200))).await.unwrap();
            assert_eq!(out.result, TrialResult::Timeout { limit: Duration::from_millis(200) });

            tokio::time::sleep(Duration::from_millis(1_500)).await;
            assert!(!marker.exists());
        }

        #[tokio::test]
        async fn test_clean_exit_reaps_background_jobs() {
            let outside = tempfile::tempdir().unwrap();
            let marker = outside.path().join("orphan-ran");
            let script = format!("(sleep 1; touch '{}') & echo started", marker.display());
            let c = candidate(&["sh", "-c", &script], vec![]);

            let out = ProcessSandbox::default().execute(&c, limits(Duration::from_secs(10))).await.unwrap();
            assert!(out.success());

            tokio::time::sleep(Duration::from_millis(1_500)).await;
            assert!(!marker.exists());
        }

        #[tokio::test]
        async fn test_base_project_overlaid_with_candidate_files() {
            let base = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(base.path().join("src")).unwrap();
            std::fs::create_dir_all(base.path().join("target/debug")).unwrap();
            std::fs::write(base.path().join("Cargo.toml"), "[package]\nname = \"demo\"\n").unwrap();
            std::fs::write(base.path().join("src/lib.rs"), "old").unwrap();
            std::fs::write(base.path().join("target/debug/big"), "artifact").unwrap();

            let cfg = SandboxConfig { base_dir: Some(base.path().to_path_buf()), ..SandboxConfig::default() };
            let c = candidate(
                &["sh", "-c", "cat Cargo.toml src/lib.rs; test -e target && echo has-target; true"],
                vec![CandidateFile { path: "src/lib.rs".into(), contents: "new".into() }],
            );
            let out = ProcessSandbox::new(&cfg).execute(&c, limits(Duration::from_secs(10))).await.unwrap();
            match out.result {
                TrialResult::Success { stdout, .. } => {
                    assert!(stdout.contains("name = \"demo\""));
                    assert!(stdout.contains("new"));
                    assert!(!stdout.contains("old"));
                    assert!(!stdout.contains("has-target"));
                }
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(std::fs::read_to_string(base.path().join("src/lib.rs")).unwrap(), "old");
        }

        #[tokio::test]
        async fn test_escaping_path_never_runs() {
            let c = candidate(
                &["true"],
                vec![CandidateFile { path: "../../outside".into(), contents: String::new() }],
            );
            let err = ProcessSandbox::default().execute(&c, limits(Duration::from_secs(10))).await.unwrap_err();
            assert!(err.to_string().contains("escapes"));
        }
    }
}
