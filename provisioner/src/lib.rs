// WHMCS provisioner
// Library entry point: module tree, logging setup and engine wiring.

pub mod account;
pub mod capability;
pub mod catalog;
pub mod cli;
pub mod cron;
pub mod database;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod fortify;
pub mod installation;
pub mod metadata;
pub mod models;
pub mod notify;
pub mod probe;
pub mod security;
pub mod settings;
pub mod teardown;
pub mod utils;

use anyhow::Result;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::account::LocalAccount;
use crate::catalog::cache::{SystemClock, TtlCache};
use crate::catalog::{HttpCatalogFetcher, ReleaseCatalog};
use crate::cron::crontab::CrontabBackend;
use crate::cron::CronJobManager;
use crate::database::mysql::MySqlProvisioner;
use crate::database::DatabaseProvisioner;
use crate::engine::{Collaborators, EngineConfig, ProvisioningEngine};
use crate::extractor::ConfigExtractor;
use crate::fortify::FortificationPolicy;
use crate::installation::download::HttpArchiveDownloader;
use crate::installation::{CommandRunner, SystemCommandRunner};
use crate::metadata::{FileMetaStore, MetaStore};
use crate::models::state::ProgressEmitter;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::settings::Settings;
use crate::teardown::LocalTeardown;

/// Initialize logging with dual format (JSON + human-readable) files under `log_dir`.
///
/// Stdout carries the command's JSON result, so console logging (when enabled) goes to stderr.
pub fn init_logging(log_dir: &Path, with_stderr: bool, level: log::LevelFilter) -> Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");
    let json_log_file = log_dir.join(format!("provisioner-{}.log", timestamp));
    let txt_log_file = log_dir.join(format!("provisioner-{}.txt", timestamp));

    let mut dispatch = fern::Dispatch::new().level(level);

    if with_stderr {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", txt_line));
                })
                .chain(std::io::stderr()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                        None,
                    );
                    out.finish(format_args!("{}\n", json_line));
                })
                .chain(fern::log_file(&json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", txt_line));
                })
                .chain(fern::log_file(&txt_log_file)?),
        );

    dispatch.apply()?;

    info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(log_dir.to_path_buf())
}

/// Wire the production collaborators from `settings`.
pub fn build_engine(settings: &Settings, emitter: ProgressEmitter) -> Result<ProvisioningEngine> {
    let mut config = EngineConfig::from_settings(settings);
    match settings.resolve_php_binary() {
        Ok(php) => config.php_binary = php.to_string_lossy().to_string(),
        Err(e) => warn!(
            "[PHASE: initialization] [STEP: php] {:#}; falling back to '{}'",
            e, settings.php_binary
        ),
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);

    let catalog = Arc::new(ReleaseCatalog::new(
        Arc::new(HttpCatalogFetcher::new(
            settings.catalog_url.clone(),
            settings.download_timeout(),
        )?),
        Arc::new(TtlCache::new(Arc::new(SystemClock))),
        settings.catalog_ttl(),
        settings.download_url_template.clone(),
    ));

    let database: Arc<dyn DatabaseProvisioner> =
        Arc::new(MySqlProvisioner::new(settings.mysql_admin_url.clone()));
    let meta: Arc<dyn MetaStore> = Arc::new(FileMetaStore::new(settings.metadata_folder()));
    let extractor = Arc::new(ConfigExtractor::new(
        runner.clone(),
        config.php_binary.clone(),
        settings.mysql_socket.clone(),
        settings.extraction_timeout(),
    ));
    let notifier: Arc<dyn Notifier> = match settings.notify_webhook_url.as_deref() {
        Some(url) if !url.trim().is_empty() => Arc::new(WebhookNotifier::new(url)?),
        _ => Arc::new(LogNotifier),
    };

    let deps = Collaborators {
        account: Arc::new(LocalAccount::new(
            settings.web_root.clone(),
            settings.account.clone(),
        )),
        catalog,
        downloader: Arc::new(HttpArchiveDownloader::new(settings.download_timeout())?),
        database: database.clone(),
        runner: runner.clone(),
        cron: Arc::new(CronJobManager::new(Arc::new(CrontabBackend::new(runner)))),
        extractor: extractor.clone(),
        fortification: FortificationPolicy::new(settings.web_group_gid),
        meta: meta.clone(),
        notifier,
        teardown: Arc::new(LocalTeardown::new(
            extractor,
            database,
            meta,
            settings.run_as_owner,
        )),
    };

    Ok(ProvisioningEngine::new(config, deps, emitter))
}
