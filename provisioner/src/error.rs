// Typed provisioning errors
//
// Every workflow step maps its low-level failure (anyhow, io, sqlx, reqwest) into one of these
// kinds at the component boundary. The operator sees exactly one message per failure.

use std::path::PathBuf;
use thiserror::Error;

use crate::models::state::ProvisioningState;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Version not found: {0}")]
    VersionNotFound(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Database provisioning failed: {0}")]
    DatabaseProvisioningFailed(String),

    #[error("Installer failed: {message}: {diagnostics}")]
    InstallerSubprocessFailed { message: String, diagnostics: String },

    #[error("Configuration file not found: {0:?}")]
    ConfigNotFound(PathBuf),

    #[error("Failed to obtain configuration for {root:?}: {diagnostics}")]
    ExtractionFailed { root: PathBuf, diagnostics: String },

    #[error("Malformed configuration output: {0}")]
    MalformedConfig(String),

    #[error("Task scheduling not permitted: {0}")]
    SchedulingNotPermitted(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("No installed instance at {0:?}")]
    NotInstalled(PathBuf),

    #[error("Fortification failed: {0}")]
    FortificationFailed(String),

    #[error("Metadata persistence failed: {0}")]
    MetadataFailed(String),
}

pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;

/// A workflow error tagged with the state it happened in.
#[derive(Debug, Error)]
#[error("{state} failed: {source}")]
pub struct WorkflowFailure {
    pub state: ProvisioningState,
    #[source]
    pub source: ProvisionError,
}

impl WorkflowFailure {
    pub fn new(state: ProvisioningState, source: ProvisionError) -> Self {
        Self { state, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_failure_names_step_and_cause() {
        let failure = WorkflowFailure::new(
            ProvisioningState::RunningInstaller,
            ProvisionError::InstallerSubprocessFailed {
                message: "exit code 1".to_string(),
                diagnostics: "PHP Fatal error".to_string(),
            },
        );
        let msg = failure.to_string();
        assert!(msg.starts_with("installer"), "unexpected message: {}", msg);
        assert!(msg.contains("PHP Fatal error"));
    }

    #[test]
    fn extraction_failed_surfaces_diagnostics() {
        let err = ProvisionError::ExtractionFailed {
            root: PathBuf::from("/var/www/example.com"),
            diagnostics: "Parse error in configuration.php".to_string(),
        };
        assert!(err.to_string().contains("Parse error in configuration.php"));
    }
}
