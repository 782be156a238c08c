// systemd helpers for the scheduling daemon
//
// The cron daemon ships as `cron.service` on Debian/Ubuntu and `crond.service` on RHEL-likes.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::time::Duration;

use super::{CommandRunner, CommandSpec};

/// Unit names probed, in order, when looking for the cron daemon.
pub const CRON_SERVICE_CANDIDATES: &[&str] = &["cron", "crond"];

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(15);

/// systemd unit status information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    /// "loaded", "not-found", "masked", ...
    pub load_state: String,
    /// "active", "inactive", "failed", ...
    pub active_state: String,
    /// "enabled", "disabled", ...
    pub unit_file_state: Option<String>,
}

impl ServiceStatus {
    pub fn exists(&self) -> bool {
        self.load_state == "loaded"
    }

    pub fn is_active(&self) -> bool {
        self.active_state == "active"
    }
}

/// Parse `systemctl show -p LoadState -p ActiveState -p UnitFileState` output.
pub fn parse_systemctl_show(stdout: &str) -> ServiceStatus {
    let mut status = ServiceStatus {
        load_state: String::new(),
        active_state: String::new(),
        unit_file_state: None,
    };
    for line in stdout.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().to_string();
            match key.trim() {
                "LoadState" => status.load_state = value,
                "ActiveState" => status.active_state = value,
                "UnitFileState" if !value.is_empty() => status.unit_file_state = Some(value),
                _ => {}
            }
        }
    }
    status
}

pub async fn get_service_status(runner: &dyn CommandRunner, service_name: &str) -> Result<ServiceStatus> {
    debug!(
        "[PHASE: installation] [STEP: service] get_service_status entered (service_name={})",
        service_name
    );
    let unit = format!("{}.service", service_name);
    let args = vec![
        "show".to_string(),
        unit,
        "-p".to_string(),
        "LoadState".to_string(),
        "-p".to_string(),
        "ActiveState".to_string(),
        "-p".to_string(),
        "UnitFileState".to_string(),
        "--no-pager".to_string(),
    ];
    let out = runner
        .run(
            CommandSpec::new("systemctl", args, "systemctl_show")
                .timeout(SYSTEMCTL_TIMEOUT)
                .idempotent(),
        )
        .await?;
    if !out.success() {
        anyhow::bail!(
            "systemctl show {} failed: {}",
            service_name,
            out.diagnostics()
        );
    }
    let status = parse_systemctl_show(&out.stdout);
    debug!(
        "[PHASE: installation] [STEP: service] get_service_status exit (service_name={}, status={:?})",
        service_name, status
    );
    Ok(status)
}

/// First installed cron unit and its status, if any.
pub async fn find_cron_service(runner: &dyn CommandRunner) -> Result<Option<(String, ServiceStatus)>> {
    for candidate in CRON_SERVICE_CANDIDATES {
        match get_service_status(runner, candidate).await {
            Ok(status) if status.exists() => return Ok(Some((candidate.to_string(), status))),
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    "[PHASE: installation] [STEP: service] Could not query {}: {}",
                    candidate, e
                );
            }
        }
    }
    Ok(None)
}

/// `systemctl enable --now <unit>`, then verify it reports active.
pub async fn enable_and_start_service(runner: &dyn CommandRunner, service_name: &str) -> Result<()> {
    info!(
        "[PHASE: installation] [STEP: service] Enabling {}.service",
        service_name
    );
    let args = vec![
        "enable".to_string(),
        "--now".to_string(),
        format!("{}.service", service_name),
    ];
    let out = runner
        .run(CommandSpec::new("systemctl", args, "systemctl_enable_now").timeout(SYSTEMCTL_TIMEOUT))
        .await
        .context("systemctl enable --now failed to run")?;
    if !out.success() {
        anyhow::bail!(
            "systemctl enable --now {} failed: {}",
            service_name,
            out.diagnostics()
        );
    }

    let status = get_service_status(runner, service_name).await?;
    if !status.is_active() {
        anyhow::bail!(
            "{}.service is {} after enable",
            service_name,
            status.active_state
        );
    }
    Ok(())
}
