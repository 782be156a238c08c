// Command-line parsing
//
// Manual argument scanning (no clap): the surface is small and every operation maps onto one
// engine call. Parsing is kept free of I/O so it can be tested directly.

use std::path::PathBuf;

use crate::capability::Operation;
use crate::error::ProvisionError;
use crate::models::requests::{FortificationLevel, InstallOptions, SiteLocation, UninstallScope};

pub const USAGE: &str = "\
Usage: whmcs-provisioner [--config FILE] [--verbose] <operation> [args]

Operations:
  install <hostname|root> [--path P] --license-key K [--version V]
          [--admin-username U] [--admin-password P] [--fortify min|max|write] [--no-notify]
  uninstall <hostname|root> [--path P] [--keep-files]
  fortify <hostname|root> <min|max|write> [--path P]
  db-config <hostname|root> [--path P]
  versions
  version <hostname|root> [--path P]
  valid <hostname|root> [--path P]
  status <hostname|root> [--path P]
  print-config
";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run(OperationRequest),
    PrintConfig,
    Help,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub operation: Operation,
    /// `None` only for location-free operations (`versions`).
    pub location: Option<SiteLocation>,
    pub install: InstallOptions,
    pub level: FortificationLevel,
    pub scope: UninstallScope,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub command: Command,
    pub config_file: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug)]
pub enum CliError {
    /// Malformed command line (exit code 2).
    Usage(String),
    /// Well-formed but not a supported operation (exit code 1).
    Unsupported(ProvisionError),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Usage(msg) => f.write_str(msg),
            CliError::Unsupported(e) => write!(f, "{}", e),
        }
    }
}

const VALUE_FLAGS: &[&str] = &[
    "--config",
    "--path",
    "--license-key",
    "--version",
    "--admin-username",
    "--admin-password",
    "--fortify",
];
const SWITCHES: &[&str] = &["--verbose", "-v", "--help", "-h", "--no-notify", "--keep-files"];

#[derive(Default)]
struct Scanned {
    positionals: Vec<String>,
    values: Vec<(String, String)>,
    switches: Vec<String>,
}

impl Scanned {
    fn value(&self, flag: &str) -> Option<String> {
        self.values
            .iter()
            .rev()
            .find(|(f, _)| f == flag)
            .map(|(_, v)| v.clone())
    }

    fn has(&self, switch: &str) -> bool {
        self.switches.iter().any(|s| s == switch)
    }
}

fn scan(args: &[String]) -> Result<Scanned, CliError> {
    let mut scanned = Scanned::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if !arg.starts_with('-') || arg == "-" {
            scanned.positionals.push(arg.clone());
            continue;
        }
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) => (f, Some(v.to_string())),
            None => (arg.as_str(), None),
        };
        if VALUE_FLAGS.contains(&flag) {
            let value = match inline {
                Some(v) => v,
                None => iter
                    .next()
                    .cloned()
                    .ok_or_else(|| CliError::Usage(format!("{} requires a value", flag)))?,
            };
            scanned.values.push((flag.to_string(), value));
        } else if SWITCHES.contains(&flag) && inline.is_none() {
            scanned.switches.push(flag.to_string());
        } else {
            return Err(CliError::Usage(format!("Unknown option '{}'", arg)));
        }
    }
    Ok(scanned)
}

/// Parse `args` (without the program name).
pub fn parse_args(args: &[String]) -> Result<Invocation, CliError> {
    let scanned = scan(args)?;
    let config_file = scanned.value("--config").map(PathBuf::from);
    let verbose = scanned.has("--verbose") || scanned.has("-v");

    let mut positionals = scanned.positionals.iter();
    let command = match positionals.next().map(String::as_str) {
        None => {
            if scanned.has("--help") || scanned.has("-h") {
                Command::Help
            } else {
                return Err(CliError::Usage("Missing operation".to_string()));
            }
        }
        Some("help") => Command::Help,
        Some("print-config") => Command::PrintConfig,
        Some(name) => {
            let operation: Operation = name.parse().map_err(CliError::Unsupported)?;
            let rest: Vec<&String> = positionals.collect();
            Command::Run(operation_request(operation, &rest, &scanned)?)
        }
    };

    Ok(Invocation {
        command,
        config_file,
        verbose,
    })
}

fn operation_request(
    operation: Operation,
    rest: &[&String],
    scanned: &Scanned,
) -> Result<OperationRequest, CliError> {
    let uri_path = scanned.value("--path").unwrap_or_default();
    let location = if operation.needs_location() {
        let target = rest.first().ok_or_else(|| {
            CliError::Usage(format!("{} requires a hostname or document root", operation))
        })?;
        Some(SiteLocation::parse(target, &uri_path))
    } else {
        None
    };

    let expected_positionals = match operation {
        Operation::Versions => 0,
        Operation::Fortify => 2,
        _ => 1,
    };
    if rest.len() != expected_positionals {
        return Err(CliError::Usage(format!(
            "{} expects {} positional argument(s), got {}",
            operation,
            expected_positionals,
            rest.len()
        )));
    }

    let level_arg = match operation {
        Operation::Fortify => rest.get(1).map(|s| s.to_string()),
        _ => scanned.value("--fortify"),
    };
    let level = match level_arg {
        Some(raw) => raw
            .parse::<FortificationLevel>()
            .map_err(|e| CliError::Usage(e.to_string()))?,
        None => FortificationLevel::default(),
    };

    let mut install = InstallOptions {
        version: scanned.value("--version"),
        license_key: scanned.value("--license-key"),
        admin_password: scanned.value("--admin-password"),
        fortification_level: level,
        notify: !scanned.has("--no-notify"),
        ..InstallOptions::default()
    };
    if let Some(username) = scanned.value("--admin-username") {
        install.admin_username = username;
    }

    let scope = if scanned.has("--keep-files") {
        UninstallScope::KeepFiles
    } else {
        UninstallScope::All
    };

    Ok(OperationRequest {
        operation,
        location,
        install,
        level,
        scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    fn request(line: &str) -> OperationRequest {
        match parse_args(&args(line)).expect("parses").command {
            Command::Run(req) => req,
            other => panic!("expected an operation, got {:?}", other),
        }
    }

    #[test]
    fn install_collects_options() {
        let req = request(
            "install billing.example.com --path /portal --license-key ABC123 --version=8.10.1 --fortify min --no-notify",
        );
        assert_eq!(req.operation, Operation::Install);
        assert_eq!(
            req.location,
            Some(SiteLocation::site("billing.example.com", "/portal"))
        );
        assert_eq!(req.install.license_key.as_deref(), Some("ABC123"));
        assert_eq!(req.install.version.as_deref(), Some("8.10.1"));
        assert_eq!(req.install.admin_username, "admin");
        assert_eq!(req.install.fortification_level, FortificationLevel::Min);
        assert!(!req.install.notify);
    }

    #[test]
    fn fortify_takes_level_positionally() {
        let req = request("fortify /var/www/example.com write");
        assert_eq!(req.level, FortificationLevel::Write);
        assert_eq!(
            req.location,
            Some(SiteLocation::Path(PathBuf::from("/var/www/example.com")))
        );
    }

    #[test]
    fn global_flags_and_keep_files() {
        let inv = parse_args(&args("--config /etc/p.toml -v uninstall example.com --keep-files")).unwrap();
        assert_eq!(inv.config_file, Some(PathBuf::from("/etc/p.toml")));
        assert!(inv.verbose);
        match inv.command {
            Command::Run(req) => assert_eq!(req.scope, UninstallScope::KeepFiles),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn versions_needs_no_location() {
        let req = request("versions");
        assert!(req.location.is_none());
        assert!(matches!(
            parse_args(&args("versions example.com")),
            Err(CliError::Usage(_))
        ));
    }

    #[test]
    fn usage_errors() {
        for line in ["", "status", "install example.com --license-key", "status example.com --bogus"] {
            assert!(
                matches!(parse_args(&args(line)), Err(CliError::Usage(_))),
                "expected usage error for '{}'",
                line
            );
        }
        assert!(matches!(
            parse_args(&args("fortify example.com extreme")),
            Err(CliError::Usage(_))
        ));
    }

    #[test]
    fn unknown_operation_is_unsupported_not_usage() {
        match parse_args(&args("upgrade example.com")) {
            Err(CliError::Unsupported(ProvisionError::UnsupportedOperation(name))) => {
                assert_eq!(name, "upgrade")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn print_config_and_help() {
        assert_eq!(parse_args(&args("print-config")).unwrap().command, Command::PrintConfig);
        assert_eq!(parse_args(&args("--help")).unwrap().command, Command::Help);
    }
}
