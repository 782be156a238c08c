// Recurring maintenance jobs
//
// Jobs are tied to an install by the document root appearing in their command. Registration is
// idempotent: a job owned by the same user that already references the root is left alone.

pub mod crontab;

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::error::{ProvisionError, ProvisionResult};
use crate::security::crypto;

/// Maintenance schedule registered by install (every five minutes).
pub const MAINTENANCE_SCHEDULE: &str = "*/5 * * * *";

/// `php -q <root>/crons/cron.php`
pub fn maintenance_command(root: &Path) -> String {
    format!("php -q {}/crons/cron.php", root_str(root))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CronJob {
    pub schedule: String,
    pub command: String,
    pub owner: String,
}

impl CronJob {
    pub fn new(schedule: impl Into<String>, command: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            schedule: schedule.into(),
            command: command.into(),
            owner: owner.into(),
        }
    }

    /// Stable identity: SHA-256 over the whitespace-collapsed command and the owner.
    pub fn signature(&self) -> String {
        let collapsed = self.command.split_whitespace().collect::<Vec<_>>().join(" ");
        crypto::sha256_hex(format!("{}\n{}", collapsed, self.owner).as_bytes())
    }

    /// True when the command references `root` as a path (not merely as a prefix of a sibling).
    pub fn references_root(&self, root: &Path) -> bool {
        command_references_root(&self.command, &root_str(root))
    }
}

fn root_str(root: &Path) -> String {
    let s = root.to_string_lossy();
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn command_references_root(command: &str, root: &str) -> bool {
    command.match_indices(root).any(|(idx, m)| {
        let before_ok = command[..idx]
            .chars()
            .next_back()
            .map_or(true, |c| c.is_whitespace() || c == '"' || c == '\'' || c == '=');
        let after_ok = command[idx + m.len()..]
            .chars()
            .next()
            .map_or(true, |c| c == '/' || c.is_whitespace() || c == '"' || c == '\'');
        before_ok && after_ok
    })
}

/// Five whitespace-separated fields, or a single `@` macro (`@daily`, `@reboot`, ...).
pub fn validate_schedule(schedule: &str) -> ProvisionResult<()> {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    let ok = match fields.as_slice() {
        [macro_] if macro_.starts_with('@') => matches!(
            *macro_,
            "@reboot" | "@yearly" | "@annually" | "@monthly" | "@weekly" | "@daily" | "@midnight" | "@hourly"
        ),
        f if f.len() == 5 => f.iter().all(|field| {
            field
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-'))
        }),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(ProvisionError::ValidationFailed(format!(
            "Invalid cron schedule '{}'",
            schedule
        )))
    }
}

/// Scheduling backend seam.
#[async_trait]
pub trait CronBackend: Send + Sync {
    /// Whether `user` may have scheduled tasks at all.
    async fn is_permitted(&self, user: &str) -> Result<bool>;
    /// Whether the scheduler daemon is running.
    async fn is_enabled(&self) -> Result<bool>;
    async fn enable(&self) -> Result<()>;
    /// Jobs for one user, or for every user when `None`.
    async fn list_jobs(&self, user: Option<&str>) -> Result<Vec<CronJob>>;
    async fn add_job(&self, job: &CronJob) -> Result<()>;
    async fn remove_job(&self, job: &CronJob) -> Result<()>;
}

pub struct CronJobManager {
    backend: Arc<dyn CronBackend>,
}

impl CronJobManager {
    pub fn new(backend: Arc<dyn CronBackend>) -> Self {
        Self { backend }
    }

    /// Scheduling must be permitted for `owner`; a stopped scheduler is started once.
    pub async fn ensure_scheduling(&self, owner: &str) -> ProvisionResult<()> {
        let permitted = self
            .backend
            .is_permitted(owner)
            .await
            .map_err(|e| ProvisionError::SchedulingNotPermitted(format!("{:#}", e)))?;
        if !permitted {
            return Err(ProvisionError::SchedulingNotPermitted(format!(
                "Task scheduling not enabled for account {} - an administrator must permit crontab use",
                owner
            )));
        }

        let enabled = self.backend.is_enabled().await.unwrap_or_else(|e| {
            warn!("[PHASE: cron] [STEP: status] Could not read scheduler state: {:#}", e);
            false
        });
        if enabled {
            return Ok(());
        }

        info!("[PHASE: cron] [STEP: enable] Scheduler is not running; enabling");
        self.backend.enable().await.map_err(|e| {
            ProvisionError::PreconditionFailed(format!("Failed to enable task scheduling: {:#}", e))
        })
    }

    /// Register a job unless one owned by `owner` already references `root`. Returns true when
    /// a job was added.
    pub async fn ensure_job(
        &self,
        root: &Path,
        schedule: &str,
        command: &str,
        owner: &str,
    ) -> ProvisionResult<bool> {
        validate_schedule(schedule)?;
        let job = CronJob::new(schedule, command, owner);

        let existing = self
            .backend
            .list_jobs(Some(owner))
            .await
            .map_err(|e| ProvisionError::PreconditionFailed(format!("Failed to list scheduled tasks: {:#}", e)))?;
        if existing
            .iter()
            .any(|j| j.references_root(root) || j.signature() == job.signature())
        {
            info!(
                "[PHASE: cron] [STEP: ensure] Job for {:?} already registered (owner={})",
                root, owner
            );
            return Ok(false);
        }

        self.backend
            .add_job(&job)
            .await
            .map_err(|e| ProvisionError::PreconditionFailed(format!("Failed to register scheduled task: {:#}", e)))?;
        info!(
            "[PHASE: cron] [STEP: ensure] Registered '{} {}' (owner={})",
            schedule, command, owner
        );
        Ok(true)
    }

    /// Remove every job referencing `root`, for any owner. Best-effort; returns how many went.
    pub async fn remove_jobs(&self, root: &Path) -> usize {
        let jobs = match self.backend.list_jobs(None).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(
                    "[PHASE: cron] [STEP: remove] Could not list scheduled tasks for {:?}: {:#}",
                    root, e
                );
                return 0;
            }
        };

        let mut removed = 0;
        for job in jobs.iter().filter(|j| j.references_root(root)) {
            match self.backend.remove_job(job).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    "[PHASE: cron] [STEP: remove] Failed to remove '{}' (owner={}): {:#}",
                    job.command, job.owner, e
                ),
            }
        }
        info!(
            "[PHASE: cron] [STEP: remove] Removed {} job(s) for {:?}",
            removed, root
        );
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryCron {
        jobs: Mutex<Vec<CronJob>>,
        permitted: bool,
        enabled: Mutex<bool>,
        enable_fails: bool,
        enable_calls: AtomicU32,
    }

    #[async_trait]
    impl CronBackend for MemoryCron {
        async fn is_permitted(&self, _user: &str) -> Result<bool> {
            Ok(self.permitted)
        }
        async fn is_enabled(&self) -> Result<bool> {
            Ok(*self.enabled.lock().unwrap())
        }
        async fn enable(&self) -> Result<()> {
            self.enable_calls.fetch_add(1, Ordering::SeqCst);
            if self.enable_fails {
                anyhow::bail!("systemctl unavailable");
            }
            *self.enabled.lock().unwrap() = true;
            Ok(())
        }
        async fn list_jobs(&self, user: Option<&str>) -> Result<Vec<CronJob>> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .iter()
                .filter(|j| user.map_or(true, |u| j.owner == u))
                .cloned()
                .collect())
        }
        async fn add_job(&self, job: &CronJob) -> Result<()> {
            self.jobs.lock().unwrap().push(job.clone());
            Ok(())
        }
        async fn remove_job(&self, job: &CronJob) -> Result<()> {
            self.jobs.lock().unwrap().retain(|j| j != job);
            Ok(())
        }
    }

    fn permitted() -> Arc<MemoryCron> {
        Arc::new(MemoryCron {
            permitted: true,
            enabled: Mutex::new(true),
            ..MemoryCron::default()
        })
    }

    #[test]
    fn root_reference_is_bounded() {
        let job = CronJob::new(MAINTENANCE_SCHEDULE, "php -q /var/www/site/crons/cron.php", "acct");
        assert!(job.references_root(Path::new("/var/www/site")));
        assert!(job.references_root(Path::new("/var/www/site/")));
        assert!(!job.references_root(Path::new("/var/www/si")));
        assert!(!job.references_root(Path::new("/var/www/site/crons/cron")));
        let bare = CronJob::new("@daily", "backup /var/www/site", "acct");
        assert!(bare.references_root(Path::new("/var/www/site")));
    }

    #[test]
    fn signature_ignores_whitespace_but_not_owner() {
        let a = CronJob::new("*/5 * * * *", "php  -q /x/crons/cron.php", "acct");
        let b = CronJob::new("0 * * * *", "php -q /x/crons/cron.php ", "acct");
        let c = CronJob::new("*/5 * * * *", "php -q /x/crons/cron.php", "other");
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn schedule_validation() {
        assert!(validate_schedule("*/5 * * * *").is_ok());
        assert!(validate_schedule("0 3 * * mon-fri").is_ok());
        assert!(validate_schedule("@hourly").is_ok());
        assert!(validate_schedule("* * * *").is_err());
        assert!(validate_schedule("@sometimes").is_err());
        assert!(validate_schedule("* * * * ; rm").is_err());
    }

    #[tokio::test]
    async fn ensure_job_twice_registers_once() {
        let backend = permitted();
        let manager = CronJobManager::new(backend.clone());
        let root = Path::new("/var/www/site");
        let cmd = maintenance_command(root);

        assert!(manager.ensure_job(root, MAINTENANCE_SCHEDULE, &cmd, "acct").await.unwrap());
        assert!(!manager.ensure_job(root, MAINTENANCE_SCHEDULE, &cmd, "acct").await.unwrap());
        assert_eq!(backend.jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_jobs_only_touches_scoped_jobs() {
        let backend = permitted();
        backend.jobs.lock().unwrap().extend([
            CronJob::new("*/5 * * * *", "php -q /var/www/site/crons/cron.php", "acct"),
            CronJob::new("0 0 * * *", "/var/www/site/bin/cleanup", "root"),
            CronJob::new("*/5 * * * *", "php -q /var/www/site2/crons/cron.php", "acct"),
        ]);
        let manager = CronJobManager::new(backend.clone());
        assert_eq!(manager.remove_jobs(Path::new("/var/www/site")).await, 2);
        let left = backend.jobs.lock().unwrap();
        assert_eq!(left.len(), 1);
        assert!(left[0].command.contains("site2"));
    }

    #[tokio::test]
    async fn scheduling_not_permitted_is_reported() {
        let backend = Arc::new(MemoryCron::default());
        let err = CronJobManager::new(backend)
            .ensure_scheduling("acct")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::SchedulingNotPermitted(_)));
    }

    #[tokio::test]
    async fn disabled_scheduler_is_enabled_once() {
        let backend = Arc::new(MemoryCron {
            permitted: true,
            ..MemoryCron::default()
        });
        CronJobManager::new(backend.clone())
            .ensure_scheduling("acct")
            .await
            .unwrap();
        assert_eq!(backend.enable_calls.load(Ordering::SeqCst), 1);

        let failing = Arc::new(MemoryCron {
            permitted: true,
            enable_fails: true,
            ..MemoryCron::default()
        });
        assert!(CronJobManager::new(failing.clone())
            .ensure_scheduling("acct")
            .await
            .is_err());
        assert_eq!(failing.enable_calls.load(Ordering::SeqCst), 1);
    }
}
