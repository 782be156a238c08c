// Installation plumbing
//
// Subprocess execution (bounded, fully drained, optionally as another account), release
// download, archive unpacking and filesystem helpers shared by the provisioning steps.
//
// IMPORTANT:
// - Never log secrets (passwords, license keys, stdin payloads).
// - Arguments are always passed as argv vectors; nothing here builds a shell string.

pub mod download;
pub mod files;
pub mod service;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

/// One subprocess invocation.
#[derive(Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Written to the child's stdin, then stdin is closed. `None` attaches /dev/null.
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    /// Short label used in logs and errors.
    pub operation: String,
    /// Account to run as (wrapped with `runuser`) when it differs from the current user.
    pub run_as: Option<String>,
    /// Safe to re-run on transient spawn/IO failures.
    pub idempotent: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, operation: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            stdin: None,
            timeout: Duration::from_secs(60),
            operation: operation.into(),
            run_as: None,
            idempotent: false,
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, payload: Vec<u8>) -> Self {
        self.stdin = Some(payload);
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = dur;
        self
    }

    pub fn run_as(mut self, user: Option<String>) -> Self {
        self.run_as = user;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Final argv after account wrapping.
    pub fn resolved_argv(&self) -> (String, Vec<String>) {
        match self.run_as.as_deref() {
            Some(user) if !is_current_user(user) => {
                let mut args = vec![
                    "-u".to_string(),
                    user.to_string(),
                    "--".to_string(),
                    self.program.clone(),
                ];
                args.extend(self.args.iter().cloned());
                ("runuser".to_string(), args)
            }
            _ => (self.program.clone(), self.args.clone()),
        }
    }
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field(
                "args",
                &self.args.iter().map(|a| mask_arg_for_log(a)).collect::<Vec<_>>(),
            )
            .field("cwd", &self.cwd)
            .field("stdin_len", &self.stdin.as_ref().map(|s| s.len()))
            .field("timeout", &self.timeout)
            .field("operation", &self.operation)
            .field("run_as", &self.run_as)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stderr if present, otherwise stdout, trimmed. Used as operator-facing diagnostics.
    pub fn diagnostics(&self) -> String {
        let err = self.stderr.trim();
        if !err.is_empty() {
            return err.to_string();
        }
        self.stdout.trim().to_string()
    }
}

/// Subprocess seam. Returns captured output even for non-zero exits; the caller decides success.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands on the local host with tokio.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        if spec.idempotent {
            run_cmd_with_retry(spec).await
        } else {
            run_cmd_with_timeout_once(&spec).await
        }
    }
}

fn is_current_user(user: &str) -> bool {
    ["USER", "LOGNAME"]
        .iter()
        .filter_map(|k| std::env::var(k).ok())
        .any(|current| current == user)
}

pub(crate) fn mask_arg_for_log(arg: &str) -> String {
    // Heuristic masking: treat anything that looks like a secret as sensitive.
    let lower = arg.to_ascii_lowercase();
    if lower.contains("password")
        || lower.contains("passwd")
        || lower.contains("secret")
        || lower.contains("token")
        || lower.contains("license")
        || lower.contains("hash")
    {
        return "***".to_string();
    }

    if lower.contains("://") {
        return crate::utils::logging::mask_database_url(arg);
    }

    // Paths and flags are needed for troubleshooting.
    if arg.starts_with('/') || arg.starts_with('-') || arg.len() <= 32 {
        return arg.to_string();
    }

    crate::utils::logging::mask_sensitive(arg)
}

fn is_transient_exec_error(e: &anyhow::Error) -> bool {
    let msg = format!("{:#}", e).to_ascii_lowercase();
    msg.contains("temporarily")
        || msg.contains("temporary")
        || msg.contains("busy")
        || msg.contains("resource")
        || msg.contains("interrupted")
}

async fn run_cmd_with_timeout_once(spec: &CommandSpec) -> Result<CommandOutput> {
    let started = Instant::now();
    let operation = spec.operation.as_str();
    let (program, args) = spec.resolved_argv();

    debug!(
        "[PHASE: installation] [STEP: cmd] run_cmd_with_timeout_once entered (operation={}, program={}, args=[{}], cwd={:?}, stdin_len={:?}, timeout_ms={})",
        operation,
        program,
        args.iter().map(|a| mask_arg_for_log(a)).collect::<Vec<_>>().join(", "),
        spec.cwd,
        spec.stdin.as_ref().map(|s| s.len()),
        spec.timeout.as_millis()
    );

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "Failed to spawn command '{}' (operation={})",
            program, operation
        )
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout (operation={})", operation))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr (operation={})", operation))?;

    // Drain both pipes while the child runs so a chatty process can never block on a full pipe.
    let mut stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let mut stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    // Feeding stdin, waiting for exit and draining the pipes all share one deadline: a child
    // that never reads its stdin, or a grandchild that inherits the pipes, must not outlive it.
    let stdin_pipe = child.stdin.take();
    let exchange = async {
        if let (Some(payload), Some(mut stdin)) = (&spec.stdin, stdin_pipe) {
            // A child that exits without reading stdin yields EPIPE; its exit status tells the story.
            if let Err(e) = stdin.write_all(payload).await {
                warn!(
                    "[PHASE: installation] [STEP: cmd] stdin write failed (operation={}): {}",
                    operation, e
                );
            }
            drop(stdin);
        }
        let status = child.wait().await;
        let stdout = (&mut stdout_task).await;
        let stderr = (&mut stderr_task).await;
        (status, stdout, stderr)
    };

    let outcome = timeout(spec.timeout, exchange).await;
    let (status, stdout_joined, stderr_joined) = match outcome {
        Ok(done) => done,
        Err(_) => {
            warn!(
                "[PHASE: installation] [STEP: cmd] Timeout reached (operation={}, program={}, timeout_ms={}); attempting to kill process",
                operation,
                program,
                spec.timeout.as_millis()
            );

            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: installation] [STEP: cmd] Failed to kill timed-out process (operation={}, program={}): {}",
                    operation, program, e
                );
            }
            stdout_task.abort();
            stderr_task.abort();

            // Best-effort reap (avoid zombies)
            let _ = timeout(Duration::from_secs(5), child.wait()).await;

            return Err(anyhow::anyhow!(
                "Command timed out after {}ms (operation={}, program={})",
                spec.timeout.as_millis(),
                operation,
                program
            ));
        }
    };

    let status = status.with_context(|| {
        format!(
            "Command wait failed (operation={}, program={})",
            operation, program
        )
    })?;
    let stdout_str = stdout_joined
        .context("stdout join failed")?
        .context("stdout read failed")?;
    let stderr_str = stderr_joined
        .context("stderr join failed")?
        .context("stderr read failed")?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: installation] [STEP: cmd] run_cmd_with_timeout_once exit (operation={}, program={}, exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
        operation,
        program,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );

    Ok(out)
}

/// Run an idempotent command with a timeout and up to 3 retries for transient failures.
async fn run_cmd_with_retry(spec: CommandSpec) -> Result<CommandOutput> {
    let started = Instant::now();
    let operation = spec.operation.clone();
    info!(
        "[PHASE: installation] [STEP: cmd] run_cmd_with_retry entered (operation={}, program={}, args_count={}, timeout_ms={})",
        operation,
        spec.program,
        spec.args.len(),
        spec.timeout.as_millis()
    );

    let attempt = || {
        let spec = spec.clone();
        async move { run_cmd_with_timeout_once(&spec).await }
    };

    let retry_strategy = ExponentialBackoff::from_millis(200)
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .take(3)
        .map(jitter);

    let result = RetryIf::spawn(retry_strategy, attempt, |e: &anyhow::Error| {
        let transient = is_transient_exec_error(e);
        if transient {
            warn!(
                "[PHASE: installation] [STEP: cmd] Transient command failure detected; will retry (operation={}, err={})",
                operation, e
            );
        }
        transient
    })
    .await;

    match &result {
        Ok(out) => {
            info!(
                "[PHASE: installation] [STEP: cmd] run_cmd_with_retry exit (operation={}, exit_code={:?}, duration_ms={})",
                operation,
                out.exit_code,
                started.elapsed().as_millis()
            );
        }
        Err(e) => {
            error!(
                "[PHASE: installation] [STEP: cmd] run_cmd_with_retry error (operation={}, duration_ms={}, err={:?})",
                operation,
                started.elapsed().as_millis(),
                e
            );
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_arg_for_log_redacts_passwordish_values() {
        assert_eq!(mask_arg_for_log("--admin-password=hunter2hunter2"), "***");
        assert_eq!(mask_arg_for_log("LICENSE-KEY-ABC"), "***");
    }

    #[test]
    fn mask_arg_for_log_keeps_paths_and_flags() {
        assert_eq!(mask_arg_for_log("/var/www/example.com"), "/var/www/example.com");
        assert_eq!(mask_arg_for_log("-q"), "-q");
        assert!(mask_arg_for_log(&"x".repeat(40)).contains("..."));
    }

    #[test]
    fn run_as_other_user_wraps_with_runuser() {
        let spec = CommandSpec::new("php", vec!["-v".to_string()], "php_version")
            .run_as(Some("no-such-provisioner-user".to_string()));
        let (program, args) = spec.resolved_argv();
        assert_eq!(program, "runuser");
        assert_eq!(args, vec!["-u", "no-such-provisioner-user", "--", "php", "-v"]);
    }

    #[test]
    fn no_run_as_keeps_argv() {
        let spec = CommandSpec::new("php", vec!["-v".to_string()], "php_version");
        let (program, args) = spec.resolved_argv();
        assert_eq!(program, "php");
        assert_eq!(args, vec!["-v"]);
    }

    #[test]
    fn debug_output_hides_stdin_payload() {
        let spec = CommandSpec::new("php", vec![], "installer").stdin(b"{\"license\":\"SECRET\"}".to_vec());
        let rendered = format!("{:?}", spec);
        assert!(!rendered.contains("SECRET"), "{}", rendered);
        assert!(rendered.contains("stdin_len"));
    }

    #[tokio::test]
    async fn runs_command_with_stdin_and_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new(
            "sh",
            vec!["-c".to_string(), "pwd; cat".to_string()],
            "test_stdin",
        )
        .cwd(tmp.path())
        .stdin(b"hello from stdin".to_vec())
        .timeout(Duration::from_secs(5));

        let out = SystemCommandRunner.run(spec).await.expect("command should run");
        assert!(out.success());
        assert!(out.stdout.contains("hello from stdin"));
        let canonical = tmp.path().canonicalize().unwrap();
        let name = canonical.file_name().unwrap().to_string_lossy().to_string();
        assert!(out.stdout.contains(&name), "{}", out.stdout);
    }

    #[tokio::test]
    async fn non_zero_exit_is_returned_not_raised() {
        let spec = CommandSpec::new(
            "sh",
            vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()],
            "test_fail",
        )
        .timeout(Duration::from_secs(5));
        let out = SystemCommandRunner.run(spec).await.expect("command should run");
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.diagnostics(), "boom");
    }

    #[tokio::test]
    async fn timed_out_command_is_killed() {
        let spec = CommandSpec::new("sh", vec!["-c".to_string(), "sleep 10".to_string()], "test_sleep")
            .timeout(Duration::from_millis(200));
        let err = SystemCommandRunner.run(spec).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
    }

    #[tokio::test]
    async fn unread_stdin_is_bounded_by_the_timeout() {
        let spec = CommandSpec::new("sh", vec!["-c".to_string(), "sleep 10".to_string()], "test_unread_stdin")
            .stdin(vec![b'x'; 4 * 1024 * 1024])
            .timeout(Duration::from_millis(300));
        let started = Instant::now();
        let err = SystemCommandRunner.run(spec).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn grandchild_holding_pipes_is_bounded_by_the_timeout() {
        let spec = CommandSpec::new("sh", vec!["-c".to_string(), "sleep 10 & exit 0".to_string()], "test_grandchild")
            .timeout(Duration::from_millis(300));
        let started = Instant::now();
        let err = SystemCommandRunner.run(spec).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
