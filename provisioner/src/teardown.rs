// Generic uninstall
//
// Drops the instance database (credentials recovered from its configuration), removes the
// document root contents and forgets the metadata. Database and metadata problems are reported
// as warnings so a half-broken instance can still be removed; failing to delete files is fatal.

use async_trait::async_trait;
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

use crate::database::DatabaseProvisioner;
use crate::error::{ProvisionError, ProvisionResult};
use crate::extractor::ConfigExtractor;
use crate::installation::files;
use crate::metadata::MetaStore;
use crate::models::requests::UninstallScope;

#[async_trait]
pub trait SiteTeardown: Send + Sync {
    /// Returns non-fatal warnings.
    async fn teardown(
        &self,
        root: &Path,
        owner: &str,
        scope: UninstallScope,
    ) -> ProvisionResult<Vec<String>>;
}

pub struct LocalTeardown {
    extractor: Arc<ConfigExtractor>,
    database: Arc<dyn DatabaseProvisioner>,
    meta: Arc<dyn MetaStore>,
    /// Run the extraction helper as the site owner.
    run_as_owner: bool,
}

impl LocalTeardown {
    pub fn new(
        extractor: Arc<ConfigExtractor>,
        database: Arc<dyn DatabaseProvisioner>,
        meta: Arc<dyn MetaStore>,
        run_as_owner: bool,
    ) -> Self {
        Self {
            extractor,
            database,
            meta,
            run_as_owner,
        }
    }
}

#[async_trait]
impl SiteTeardown for LocalTeardown {
    async fn teardown(
        &self,
        root: &Path,
        owner: &str,
        scope: UninstallScope,
    ) -> ProvisionResult<Vec<String>> {
        let mut warnings = Vec::new();

        let run_as = self.run_as_owner.then_some(owner);
        match self.extractor.extract_database_config(root, run_as).await {
            Ok(creds) => {
                if let Err(e) = self.database.destroy(&creds).await {
                    warnings.push(e.to_string());
                }
            }
            Err(e) => warnings.push(format!("Database left in place: {}", e)),
        }

        if scope == UninstallScope::All {
            let removed = files::clear_dir_contents(root).await.map_err(|e| {
                ProvisionError::PreconditionFailed(format!(
                    "Failed to remove files under {}: {:#}",
                    root.display(),
                    e
                ))
            })?;
            info!(
                "[PHASE: uninstall] [STEP: files] Removed {} top-level entries under {:?}",
                removed, root
            );
        }

        if let Err(e) = self.meta.remove(root).await {
            warnings.push(e.to_string());
        }

        for w in &warnings {
            warn!("[PHASE: uninstall] [STEP: teardown] {}", w);
        }
        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::CONFIG_FILE;
    use crate::installation::{CommandOutput, CommandRunner, CommandSpec};
    use crate::models::instance::{DatabaseCredentials, InstanceMeta};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Duration;

    const HELPER_OUTPUT: &str =
        r#"{"db":"acct_whmcs","user":"acct_whmcs","host":"localhost","prefix":"","password":"pw"}"#;

    struct ScriptedRunner {
        output: CommandOutput,
        seen: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        fn new(exit_code: i32, stdout: &str, stderr: &str) -> Arc<Self> {
            Arc::new(Self {
                output: CommandOutput {
                    exit_code: Some(exit_code),
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    ..CommandOutput::default()
                },
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: CommandSpec) -> anyhow::Result<CommandOutput> {
            self.seen.lock().unwrap().push(spec);
            Ok(self.output.clone())
        }
    }

    #[derive(Default)]
    struct StubDatabase {
        destroyed: Mutex<Vec<DatabaseCredentials>>,
    }

    #[async_trait]
    impl DatabaseProvisioner for StubDatabase {
        async fn is_available(&self) -> bool {
            true
        }

        async fn create(
            &self,
            _request: &crate::database::DatabaseRequest,
        ) -> ProvisionResult<DatabaseCredentials> {
            Err(ProvisionError::DatabaseProvisioningFailed("not used here".to_string()))
        }

        async fn destroy(&self, credentials: &DatabaseCredentials) -> ProvisionResult<()> {
            self.destroyed.lock().unwrap().push(credentials.clone());
            Ok(())
        }
    }

    struct StubMeta {
        fail_remove: bool,
        removes: AtomicU32,
    }

    #[async_trait]
    impl MetaStore for StubMeta {
        async fn load(&self, _root: &Path) -> ProvisionResult<Option<InstanceMeta>> {
            Ok(None)
        }

        async fn save(&self, _root: &Path, _meta: &InstanceMeta) -> ProvisionResult<()> {
            Ok(())
        }

        async fn remove(&self, _root: &Path) -> ProvisionResult<bool> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            if self.fail_remove {
                return Err(ProvisionError::MetadataFailed("read-only filesystem".to_string()));
            }
            Ok(true)
        }
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        runner: Arc<ScriptedRunner>,
        database: Arc<StubDatabase>,
        meta: Arc<StubMeta>,
        teardown: LocalTeardown,
    }

    fn fixture(runner: Arc<ScriptedRunner>, fail_remove: bool, run_as_owner: bool) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("admin")).unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), b"<?php $db_name = 'acct_whmcs';").unwrap();
        std::fs::write(tmp.path().join("index.php"), b"<?php").unwrap();

        let database = Arc::new(StubDatabase::default());
        let meta = Arc::new(StubMeta {
            fail_remove,
            removes: AtomicU32::new(0),
        });
        let extractor = Arc::new(ConfigExtractor::new(
            runner.clone(),
            "/usr/bin/php",
            None,
            Duration::from_secs(5),
        ));
        let teardown = LocalTeardown::new(extractor, database.clone(), meta.clone(), run_as_owner);
        Fixture {
            tmp,
            runner,
            database,
            meta,
            teardown,
        }
    }

    #[tokio::test]
    async fn drops_extracted_database_and_clears_files() {
        let f = fixture(ScriptedRunner::new(0, HELPER_OUTPUT, ""), false, true);

        let warnings = f
            .teardown
            .teardown(f.tmp.path(), "acct", UninstallScope::All)
            .await
            .unwrap();

        assert!(warnings.is_empty());
        let destroyed = f.database.destroyed.lock().unwrap();
        assert_eq!(destroyed.len(), 1);
        assert_eq!(destroyed[0].database, "acct_whmcs");
        assert_eq!(std::fs::read_dir(f.tmp.path()).unwrap().count(), 0);
        assert_eq!(f.meta.removes.load(Ordering::SeqCst), 1);
        assert_eq!(f.runner.seen.lock().unwrap()[0].run_as.as_deref(), Some("acct"));
    }

    #[tokio::test]
    async fn extraction_failure_is_a_warning_and_files_still_go() {
        let f = fixture(ScriptedRunner::new(255, "", "PHP Parse error"), false, true);

        let warnings = f
            .teardown
            .teardown(f.tmp.path(), "acct", UninstallScope::All)
            .await
            .unwrap();

        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("Database left in place"));
        assert!(f.database.destroyed.lock().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(f.tmp.path()).unwrap().count(), 0);
        assert_eq!(f.meta.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keep_files_leaves_tree_in_place() {
        let f = fixture(ScriptedRunner::new(0, HELPER_OUTPUT, ""), false, true);

        f.teardown
            .teardown(f.tmp.path(), "acct", UninstallScope::KeepFiles)
            .await
            .unwrap();

        assert_eq!(f.database.destroyed.lock().unwrap().len(), 1);
        assert!(f.tmp.path().join(CONFIG_FILE).is_file());
        assert!(f.tmp.path().join("admin").is_dir());
    }

    #[tokio::test]
    async fn metadata_failure_is_a_warning() {
        let f = fixture(ScriptedRunner::new(0, HELPER_OUTPUT, ""), true, true);

        let warnings = f
            .teardown
            .teardown(f.tmp.path(), "acct", UninstallScope::All)
            .await
            .unwrap();

        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("read-only filesystem"));
        assert_eq!(f.database.destroyed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn runs_helper_as_current_user_when_not_switching() {
        let f = fixture(ScriptedRunner::new(0, HELPER_OUTPUT, ""), false, false);

        f.teardown
            .teardown(f.tmp.path(), "acct", UninstallScope::KeepFiles)
            .await
            .unwrap();

        assert_eq!(f.runner.seen.lock().unwrap()[0].run_as, None);
    }
}
