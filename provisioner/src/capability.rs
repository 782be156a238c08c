// Supported operations
//
// The control panel asks for operations by name. Anything not listed here is reported as
// unsupported rather than silently ignored.

use std::fmt;
use std::str::FromStr;

use crate::error::ProvisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Install,
    Uninstall,
    Fortify,
    DbConfig,
    Versions,
    Version,
    Valid,
    Status,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::Install,
        Operation::Uninstall,
        Operation::Fortify,
        Operation::DbConfig,
        Operation::Versions,
        Operation::Version,
        Operation::Valid,
        Operation::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Install => "install",
            Operation::Uninstall => "uninstall",
            Operation::Fortify => "fortify",
            Operation::DbConfig => "db-config",
            Operation::Versions => "versions",
            Operation::Version => "version",
            Operation::Valid => "valid",
            Operation::Status => "status",
        }
    }

    /// Whether the operation acts on one document root (and so needs a location argument).
    pub fn needs_location(&self) -> bool {
        !matches!(self, Operation::Versions)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Operation::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == normalized)
            .ok_or_else(|| ProvisionError::UnsupportedOperation(s.trim().to_string()))
    }
}
