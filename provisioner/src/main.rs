// whmcs-provisioner binary
//
// Prints exactly one JSON document (`ApiResponse`) on stdout per invocation. Logs and the
// progress spinner go to files / stderr.

use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use whmcs_provisioner::capability::Operation;
use whmcs_provisioner::cli::{self, CliError, Command, OperationRequest};
use whmcs_provisioner::engine::ProvisioningEngine;
use whmcs_provisioner::models::responses::ApiResponse;
use whmcs_provisioner::models::state::{ProgressEmitter, ProgressPayload};
use whmcs_provisioner::settings::Settings;
use whmcs_provisioner::utils::path_resolver;

const EXIT_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 2;

fn print_json<T: Serialize>(response: &ApiResponse<T>) {
    match serde_json::to_string_pretty(response) {
        Ok(s) => println!("{}", s),
        Err(e) => println!(
            "{{\"success\":false,\"error\":\"failed to render result: {}\"}}",
            e
        ),
    }
}

fn fail(message: impl Into<String>) -> ExitCode {
    print_json(&ApiResponse::<()>::fail(message));
    ExitCode::from(EXIT_FAILURE)
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{elapsed}] {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn spinner_emitter(pb: ProgressBar) -> ProgressEmitter {
    Arc::new(move |p: ProgressPayload| {
        if p.state.is_terminal() {
            pb.println(format!("{}: {}", p.state, p.message));
        } else {
            pb.set_message(format!("[{:>3}%] {}", p.percent, p.message));
        }
    })
}

fn to_json<T: Serialize, E: std::fmt::Display>(result: Result<T, E>) -> Result<serde_json::Value, String> {
    let value = result.map_err(|e| e.to_string())?;
    serde_json::to_value(value).map_err(|e| e.to_string())
}

async fn run_operation(
    engine: &ProvisioningEngine,
    req: OperationRequest,
) -> Result<serde_json::Value, String> {
    let location = match (&req.location, req.operation) {
        (_, Operation::Versions) => return to_json(Ok::<_, String>(engine.versions().await)),
        (Some(location), _) => location.clone(),
        (None, op) => return Err(format!("{} requires a location", op)),
    };

    match req.operation {
        Operation::Install => to_json(engine.install(&location, &req.install).await),
        Operation::Uninstall => to_json(engine.uninstall(&location, req.scope).await),
        Operation::Fortify => to_json(engine.fortify(&location, req.level).await),
        Operation::DbConfig => to_json(engine.db_config(&location).await),
        Operation::Version => to_json(engine.installed_version(&location).await),
        Operation::Valid => to_json(engine.is_installed(&location).await),
        Operation::Status => to_json(engine.status(&location).await),
        Operation::Versions => to_json(Ok::<_, String>(engine.versions().await)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let invocation = match cli::parse_args(&args) {
        Ok(inv) => inv,
        Err(CliError::Usage(msg)) => {
            eprintln!("{}\n\n{}", msg, cli::USAGE);
            return ExitCode::from(EXIT_USAGE);
        }
        Err(e @ CliError::Unsupported(_)) => return fail(e.to_string()),
    };

    if invocation.command == Command::Help {
        print!("{}", cli::USAGE);
        return ExitCode::SUCCESS;
    }

    let settings = match Settings::load(invocation.config_file.as_deref()) {
        Ok(s) => s,
        Err(e) => return fail(format!("{:#}", e)),
    };

    if invocation.command == Command::PrintConfig {
        return match settings.to_masked_toml() {
            Ok(toml) => {
                print!("{}", toml);
                ExitCode::SUCCESS
            }
            Err(e) => fail(format!("{:#}", e)),
        };
    }

    let level = if invocation.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    match path_resolver::resolve_log_folder(settings.log_dir.as_deref()) {
        Ok(dir) => {
            if let Err(e) = whmcs_provisioner::init_logging(&dir, invocation.verbose, level) {
                eprintln!("Failed to initialize logging: {}", e);
            }
        }
        Err(e) => eprintln!("Failed to resolve log folder: {:#}", e),
    }

    let req = match invocation.command {
        Command::Run(req) => req,
        Command::Help | Command::PrintConfig => return ExitCode::SUCCESS,
    };
    info!(
        "[PHASE: initialization] [STEP: start] whmcs-provisioner {} ({})",
        req.operation,
        env!("CARGO_PKG_VERSION")
    );

    let pb = spinner();
    let engine = match whmcs_provisioner::build_engine(&settings, spinner_emitter(pb.clone())) {
        Ok(engine) => engine,
        Err(e) => {
            pb.finish_and_clear();
            error!("[PHASE: initialization] [STEP: engine] {:#}", e);
            return fail(format!("{:#}", e));
        }
    };

    let operation = req.operation;
    let result = run_operation(&engine, req).await;
    pb.finish_and_clear();

    match result {
        Ok(value) => {
            info!("[PHASE: finished] [STEP: {}] Succeeded", operation);
            print_json(&ApiResponse::ok(value));
            ExitCode::SUCCESS
        }
        Err(message) => {
            error!("[PHASE: finished] [STEP: {}] {}", operation, message);
            fail(message)
        }
    }
}
