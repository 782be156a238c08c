// Workflow state + progress reporting
//
// NOTE: This is NOT persisted; it describes where a single install run currently is so the
// caller (CLI spinner, control panel) can render progress and so failures can name their step.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Install workflow states, declared in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    Validating,
    Downloading,
    ProvisioningDatabase,
    RunningInstaller,
    SchedulingMaintenance,
    PersistingMetadata,
    Fortifying,
    Notifying,
    Done,
    Failed,
}

impl ProvisioningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningState::Validating => "validate",
            ProvisioningState::Downloading => "download",
            ProvisioningState::ProvisioningDatabase => "database",
            ProvisioningState::RunningInstaller => "installer",
            ProvisioningState::SchedulingMaintenance => "cron",
            ProvisioningState::PersistingMetadata => "metadata",
            ProvisioningState::Fortifying => "fortify",
            ProvisioningState::Notifying => "notify",
            ProvisioningState::Done => "done",
            ProvisioningState::Failed => "failed",
        }
    }

    /// Rough completion percentage shown while this state runs.
    pub fn percent(&self) -> i32 {
        match self {
            ProvisioningState::Validating => 2,
            ProvisioningState::Downloading => 10,
            ProvisioningState::ProvisioningDatabase => 40,
            ProvisioningState::RunningInstaller => 55,
            ProvisioningState::SchedulingMaintenance => 75,
            ProvisioningState::PersistingMetadata => 80,
            ProvisioningState::Fortifying => 88,
            ProvisioningState::Notifying => 95,
            ProvisioningState::Done => 100,
            ProvisioningState::Failed => 100,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisioningState::Done | ProvisioningState::Failed)
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub correlation_id: String,
    pub state: ProvisioningState,
    pub severity: String, // "info" | "warn" | "error"
    pub percent: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u128>,
}

pub type ProgressEmitter = Arc<dyn Fn(ProgressPayload) + Send + Sync>;
