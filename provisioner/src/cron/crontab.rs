// Per-user crontab backend
//
// Reads and rewrites user crontabs through the `crontab` binary, honors cron.allow/cron.deny,
// and manages the daemon through systemd.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;

use super::{CronBackend, CronJob};
use crate::installation::{service, CommandRunner, CommandSpec};

const CRONTAB_TIMEOUT: Duration = Duration::from_secs(15);

pub struct CrontabBackend {
    runner: Arc<dyn CommandRunner>,
    allow_file: PathBuf,
    deny_file: PathBuf,
    spool_dirs: Vec<PathBuf>,
}

impl CrontabBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            allow_file: PathBuf::from("/etc/cron.allow"),
            deny_file: PathBuf::from("/etc/cron.deny"),
            // Debian keeps user crontabs in crontabs/, RHEL directly in the spool dir.
            spool_dirs: vec![
                PathBuf::from("/var/spool/cron/crontabs"),
                PathBuf::from("/var/spool/cron"),
            ],
        }
    }

    pub fn with_paths(mut self, allow_file: PathBuf, deny_file: PathBuf, spool_dirs: Vec<PathBuf>) -> Self {
        self.allow_file = allow_file;
        self.deny_file = deny_file;
        self.spool_dirs = spool_dirs;
        self
    }

    async fn read_crontab(&self, user: &str) -> Result<String> {
        let out = self
            .runner
            .run(
                CommandSpec::new(
                    "crontab",
                    vec!["-l".to_string(), "-u".to_string(), user.to_string()],
                    "crontab_list",
                )
                .timeout(CRONTAB_TIMEOUT)
                .idempotent(),
            )
            .await?;
        if out.success() {
            return Ok(out.stdout);
        }
        if out.stderr.to_ascii_lowercase().contains("no crontab for") {
            return Ok(String::new());
        }
        anyhow::bail!("crontab -l -u {} failed: {}", user, out.diagnostics())
    }

    async fn write_crontab(&self, user: &str, contents: String) -> Result<()> {
        let out = self
            .runner
            .run(
                CommandSpec::new(
                    "crontab",
                    vec!["-u".to_string(), user.to_string(), "-".to_string()],
                    "crontab_install",
                )
                .stdin(contents.into_bytes())
                .timeout(CRONTAB_TIMEOUT),
            )
            .await?;
        if !out.success() {
            anyhow::bail!("crontab -u {} - failed: {}", user, out.diagnostics());
        }
        Ok(())
    }

    async fn spool_users(&self) -> Vec<String> {
        let mut users = Vec::new();
        for dir in &self.spool_dirs {
            let mut rd = match tokio::fs::read_dir(dir).await {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            while let Ok(Some(ent)) = rd.next_entry().await {
                let is_file = ent.file_type().await.map(|t| t.is_file()).unwrap_or(false);
                let name = ent.file_name().to_string_lossy().to_string();
                if is_file && !name.starts_with('.') && !users.contains(&name) {
                    users.push(name);
                }
            }
        }
        users
    }
}

/// Jobs in a crontab, skipping comments, blanks and environment assignments.
pub fn parse_crontab(owner: &str, contents: &str) -> Vec<CronJob> {
    contents
        .lines()
        .filter_map(|line| parse_crontab_line(owner, line))
        .collect()
}

fn parse_crontab_line(owner: &str, line: &str) -> Option<CronJob> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let first = trimmed.split_whitespace().next()?;
    if first.contains('=') {
        return None;
    }

    let field_count = if first.starts_with('@') { 1 } else { 5 };
    let mut rest = trimmed;
    let mut fields = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = &rest[end..];
    }
    let command = rest.trim();
    if command.is_empty() {
        return None;
    }
    Some(CronJob::new(fields.join(" "), command, owner))
}

fn render_line(job: &CronJob) -> String {
    format!("{} {}", job.schedule, job.command)
}

/// cron(8) semantics: an allow file lists the only permitted users; otherwise a deny file lists
/// the refused ones; with neither, everyone may schedule.
pub fn permitted_by_files(user: &str, allow: Option<&str>, deny: Option<&str>) -> bool {
    let listed = |contents: &str| contents.lines().any(|l| l.trim() == user);
    if user == "root" {
        return true;
    }
    match (allow, deny) {
        (Some(allow), _) => listed(allow),
        (None, Some(deny)) => !listed(deny),
        (None, None) => true,
    }
}

async fn read_optional(path: &PathBuf) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::Error::new(e)).with_context(|| format!("Failed to read {:?}", path)),
    }
}

#[async_trait]
impl CronBackend for CrontabBackend {
    async fn is_permitted(&self, user: &str) -> Result<bool> {
        let allow = read_optional(&self.allow_file).await?;
        let deny = read_optional(&self.deny_file).await?;
        Ok(permitted_by_files(user, allow.as_deref(), deny.as_deref()))
    }

    async fn is_enabled(&self) -> Result<bool> {
        if which::which("systemctl").is_err() {
            warn!("[PHASE: cron] [STEP: status] systemctl not found; assuming the scheduler is running");
            return Ok(true);
        }
        match service::find_cron_service(self.runner.as_ref()).await? {
            Some((name, status)) => {
                debug!(
                    "[PHASE: cron] [STEP: status] {}.service active_state={}",
                    name, status.active_state
                );
                Ok(status.is_active())
            }
            None => Ok(false),
        }
    }

    async fn enable(&self) -> Result<()> {
        match service::find_cron_service(self.runner.as_ref()).await? {
            Some((name, _)) => service::enable_and_start_service(self.runner.as_ref(), &name).await,
            None => anyhow::bail!(
                "No cron service unit found (tried {})",
                service::CRON_SERVICE_CANDIDATES.join(", ")
            ),
        }
    }

    async fn list_jobs(&self, user: Option<&str>) -> Result<Vec<CronJob>> {
        if let Some(u) = user {
            let contents = self.read_crontab(u).await?;
            return Ok(parse_crontab(u, &contents));
        }
        // Spool entries can outlive their accounts; one unreadable table must not hide the rest.
        let mut jobs = Vec::new();
        for u in self.spool_users().await {
            match self.read_crontab(&u).await {
                Ok(contents) => jobs.extend(parse_crontab(&u, &contents)),
                Err(e) => warn!(
                    "[PHASE: cron] [STEP: list] Skipping crontab of {}: {:#}",
                    u, e
                ),
            }
        }
        Ok(jobs)
    }

    async fn add_job(&self, job: &CronJob) -> Result<()> {
        let mut contents = self.read_crontab(&job.owner).await?;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&render_line(job));
        contents.push('\n');
        self.write_crontab(&job.owner, contents).await
    }

    async fn remove_job(&self, job: &CronJob) -> Result<()> {
        let contents = self.read_crontab(&job.owner).await?;
        let kept: Vec<&str> = contents
            .lines()
            .filter(|line| parse_crontab_line(&job.owner, line).as_ref() != Some(job))
            .collect();
        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        self.write_crontab(&job.owner, rewritten).await
    }
}
