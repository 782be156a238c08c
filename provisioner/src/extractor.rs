// Config extraction
//
// Recovers the live database settings of an installed instance by letting PHP evaluate its
// configuration file and report the values on a dedicated descriptor (fd 3). The PHP process's
// own stdout is discarded so stray output from the config file cannot corrupt the result.

use log::{info, warn};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Duration;

use crate::error::{ProvisionError, ProvisionResult};
use crate::installation::{CommandRunner, CommandSpec};
use crate::models::instance::DatabaseCredentials;

pub const CONFIG_FILE: &str = "configuration.php";

const EXTRACT_SNIPPET: &str = r#"ob_start(); include("./configuration.php"); ob_end_clean(); file_put_contents("php://fd/3", json_encode(["db" => $db_name ?? null, "user" => $db_username ?? null, "host" => $db_host ?? null, "prefix" => "", "password" => $db_password ?? null]));"#;

// $1 = install root, $2 = php binary, $3 = mysqli socket, $4 = code
const SHELL_WRAPPER: &str =
    r#"cd "$1" && exec "$2" -d mysqli.default_socket="$3" -r "$4" 3>&1 1>/dev/null"#;

#[derive(Debug, Deserialize)]
struct ExtractedConfig {
    db: Option<String>,
    user: Option<String>,
    host: Option<String>,
    #[serde(default)]
    prefix: Option<String>,
    password: Option<String>,
}

pub struct ConfigExtractor {
    runner: Arc<dyn CommandRunner>,
    php_binary: String,
    mysql_socket: String,
    timeout: Duration,
}

impl ConfigExtractor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        php_binary: impl Into<String>,
        mysql_socket: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            php_binary: php_binary.into(),
            mysql_socket: mysql_socket.unwrap_or_default(),
            timeout,
        }
    }

    fn command(&self, root: &Path, run_as: Option<&str>) -> CommandSpec {
        CommandSpec::new(
            "/bin/sh",
            vec![
                "-c".to_string(),
                SHELL_WRAPPER.to_string(),
                "sh".to_string(),
                root.to_string_lossy().to_string(),
                self.php_binary.clone(),
                self.mysql_socket.clone(),
                EXTRACT_SNIPPET.to_string(),
            ],
            "extract_db_config",
        )
        .timeout(self.timeout)
        .run_as(run_as.map(str::to_string))
    }

    /// Database credentials configured for the instance at `root`.
    pub async fn extract_database_config(
        &self,
        root: &Path,
        run_as: Option<&str>,
    ) -> ProvisionResult<DatabaseCredentials> {
        let config_file = root.join(CONFIG_FILE);
        if !tokio::fs::try_exists(&config_file).await.unwrap_or(false) {
            return Err(ProvisionError::ConfigNotFound(config_file));
        }

        let out = self
            .runner
            .run(self.command(root, run_as))
            .await
            .map_err(|e| ProvisionError::ExtractionFailed {
                root: root.to_path_buf(),
                diagnostics: format!("{:#}", e),
            })?;

        if !out.success() {
            warn!(
                "[PHASE: extract] [STEP: php] Config extraction failed (root={:?}, exit_code={:?})",
                root, out.exit_code
            );
            return Err(ProvisionError::ExtractionFailed {
                root: root.to_path_buf(),
                diagnostics: out.diagnostics(),
            });
        }

        let creds = parse_extracted(&out.stdout)?;
        info!(
            "[PHASE: extract] [STEP: php] Config extracted (root={:?}, db={}, host={})",
            root, creds.database, creds.host
        );
        Ok(creds)
    }
}

fn parse_extracted(stdout: &str) -> ProvisionResult<DatabaseCredentials> {
    let body = stdout.trim();
    if body.is_empty() {
        return Err(ProvisionError::MalformedConfig(
            "configuration helper produced no output".to_string(),
        ));
    }
    let raw: ExtractedConfig = serde_json::from_str(body)
        .map_err(|e| ProvisionError::MalformedConfig(format!("unparseable helper output: {}", e)))?;

    let database = raw
        .db
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ProvisionError::MalformedConfig("db_name is not set".to_string()))?;
    let username = raw
        .user
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ProvisionError::MalformedConfig("db_username is not set".to_string()))?;

    Ok(DatabaseCredentials {
        host: raw
            .host
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string()),
        username,
        password: raw.password.unwrap_or_default(),
        database,
        // Not recorded in the application's configuration.
        connection_limit: 0,
        prefix: raw.prefix.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installation::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedRunner {
        output: anyhow::Result<CommandOutput>,
        seen: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        fn new(output: anyhow::Result<CommandOutput>) -> Arc<Self> {
            Arc::new(Self {
                output,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: CommandSpec) -> anyhow::Result<CommandOutput> {
            self.seen.lock().unwrap().push(spec);
            match &self.output {
                Ok(out) => Ok(out.clone()),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }
    }

    fn root_with_config() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), b"<?php $db_name = 'x';").unwrap();
        tmp
    }

    fn extractor(runner: Arc<ScriptedRunner>) -> ConfigExtractor {
        ConfigExtractor::new(runner, "/usr/bin/php", Some("/run/mysqld/mysqld.sock".to_string()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn missing_configuration_is_config_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(Ok(CommandOutput::default()));
        let err = extractor(runner.clone())
            .extract_database_config(tmp.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ConfigNotFound(_)));
        assert!(runner.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let tmp = root_with_config();
        let runner = ScriptedRunner::new(Ok(CommandOutput {
            exit_code: Some(255),
            stderr: "PHP Parse error: syntax error in configuration.php".to_string(),
            ..CommandOutput::default()
        }));
        let err = extractor(runner)
            .extract_database_config(tmp.path(), None)
            .await
            .unwrap_err();
        match err {
            ProvisionError::ExtractionFailed { diagnostics, .. } => {
                assert!(diagnostics.contains("PHP Parse error"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn parses_helper_output_and_passes_values_positionally() {
        let tmp = root_with_config();
        let runner = ScriptedRunner::new(Ok(CommandOutput {
            exit_code: Some(0),
            stdout: r#"{"db":"acct_whmcs","user":"acct_whmcs","host":"localhost","prefix":"","password":"s3cr3t pass"}"#.to_string(),
            ..CommandOutput::default()
        }));
        let creds = extractor(runner.clone())
            .extract_database_config(tmp.path(), Some("acct"))
            .await
            .unwrap();
        assert_eq!(creds.database, "acct_whmcs");
        assert_eq!(creds.password, "s3cr3t pass");

        let seen = runner.seen.lock().unwrap();
        let spec = &seen[0];
        assert_eq!(spec.program, "/bin/sh");
        assert_eq!(spec.args[1], SHELL_WRAPPER);
        assert_eq!(spec.args[3], tmp.path().to_string_lossy());
        assert_eq!(spec.args[4], "/usr/bin/php");
        assert_eq!(spec.args[5], "/run/mysqld/mysqld.sock");
        assert_eq!(spec.run_as.as_deref(), Some("acct"));
    }

    #[test]
    fn empty_or_garbage_output_is_malformed() {
        assert!(matches!(parse_extracted(""), Err(ProvisionError::MalformedConfig(_))));
        assert!(matches!(parse_extracted("a:5:{}"), Err(ProvisionError::MalformedConfig(_))));
        assert!(matches!(
            parse_extracted(r#"{"db":null,"user":"u","host":null,"prefix":"","password":null}"#),
            Err(ProvisionError::MalformedConfig(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_wrapper_routes_fd3_and_discards_stdout() {
        use crate::installation::SystemCommandRunner;
        let tmp = tempfile::tempdir().unwrap();
        // Same redirection as the wrapper, with a shell group in place of php.
        let out = SystemCommandRunner
            .run(
                CommandSpec::new(
                    "/bin/sh",
                    vec![
                        "-c".to_string(),
                        r#"cd "$1" && { echo noise; echo "$2" >&3; } 3>&1 1>/dev/null"#.to_string(),
                        "sh".to_string(),
                        tmp.path().to_string_lossy().to_string(),
                        r#"{"db":"d"}"#.to_string(),
                    ],
                    "fd3_smoke",
                )
                .timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), r#"{"db":"d"}"#);
    }
}
