mod runner;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use maestro_core::adb::Adb;
use maestro_core::config::WorkspaceConfig;
use maestro_core::dispatcher::StepExecutor;
use maestro_core::driver::AndroidDriver;
use maestro_core::validator::validate_workspace;

use crate::runner::FlowRunner;

const DEFAULT_DRIVER_PORT: u16 = 8200;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 500;

// Exit codes: 1 = failed steps, 2 = validation error, 3 = no usable
// device, 4 = IO problem.
const EXIT_STEP_FAILURE: i32 = 1;
const EXIT_VALIDATION: i32 = 2;
const EXIT_DEVICE: i32 = 3;
const EXIT_IO: i32 = 4;

#[derive(Parser)]
#[command(name = "maestro", about = "Declarative UI-test runner for Android")]
struct Cli {
    /// Device serial; defaults to the workspace config or the first
    /// connected device.
    #[arg(long, env = "MAESTRO_DEVICE", global = true)]
    device: Option<String>,

    /// Local port forwarded to the on-device automation server.
    #[arg(long, default_value_t = DEFAULT_DRIVER_PORT, global = true)]
    driver_port: u16,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate and run the flows under a path
    Test {
        /// A flow file or a workspace directory
        path: PathBuf,
        /// Only run flows carrying one of these tags
        #[arg(long = "include-tags", value_delimiter = ',')]
        include_tags: Vec<String>,
        /// Skip flows carrying one of these tags
        #[arg(long = "exclude-tags", value_delimiter = ',')]
        exclude_tags: Vec<String>,
        /// KEY=VALUE pairs made available to ${NAME} substitution
        #[arg(short, long)]
        env: Vec<String>,
    },
    /// Parse and validate flows without running them
    Validate {
        /// A flow file or a workspace directory
        path: PathBuf,
        #[arg(long = "include-tags", value_delimiter = ',')]
        include_tags: Vec<String>,
        #[arg(long = "exclude-tags", value_delimiter = ',')]
        exclude_tags: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref());

    let code = match cli.command {
        Command::Validate {
            ref path,
            ref include_tags,
            ref exclude_tags,
        } => validate(path, include_tags, exclude_tags),
        Command::Test {
            ref path,
            ref include_tags,
            ref exclude_tags,
            ref env,
        } => {
            run_tests(
                path,
                include_tags,
                exclude_tags,
                env,
                cli.device.clone(),
                cli.driver_port,
            )
            .await
        }
    };
    process::exit(code);
}

fn init_tracing(log_file: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| "maestro.log".as_ref());
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

fn validate(path: &Path, include_tags: &[String], exclude_tags: &[String]) -> i32 {
    match validate_workspace(path, include_tags, exclude_tags) {
        Ok(report) => {
            for error in &report.errors {
                eprintln!("error: {}", error);
            }
            println!(
                "{} test case(s), {} error(s)",
                report.test_cases.len(),
                report.errors.len()
            );
            if report.is_ok() {
                0
            } else {
                EXIT_VALIDATION
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            EXIT_IO
        }
    }
}

async fn run_tests(
    path: &Path,
    include_tags: &[String],
    exclude_tags: &[String],
    env_pairs: &[String],
    device: Option<String>,
    driver_port: u16,
) -> i32 {
    let report = match validate_workspace(path, include_tags, exclude_tags) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("error: {}", e);
            return EXIT_IO;
        }
    };
    if !report.is_ok() {
        for error in &report.errors {
            eprintln!("error: {}", error);
        }
        return EXIT_VALIDATION;
    }
    if report.test_cases.is_empty() {
        println!("No test cases selected");
        return 0;
    }

    let workspace_dir = if path.is_dir() {
        path.to_path_buf()
    } else {
        path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    };
    let config = WorkspaceConfig::load(&workspace_dir).unwrap_or_default();

    let serial = match pick_device(device.or(config.device.clone())).await {
        Some(serial) => serial,
        None => {
            eprintln!("error: no connected device found");
            return EXIT_DEVICE;
        }
    };
    info!(serial = %serial, "using device");

    let idle_timeout = config
        .wait_for_idle_timeout
        .unwrap_or(DEFAULT_IDLE_TIMEOUT_MS);
    let driver = match AndroidDriver::connect(&serial, driver_port, idle_timeout).await {
        Ok(driver) => driver,
        Err(e) => {
            error!(error = %e, "failed to connect to the automation server");
            return EXIT_DEVICE;
        }
    };

    let mut env = config.env.clone();
    for pair in env_pairs {
        match pair.split_once('=') {
            Some((key, value)) => {
                env.insert(key.to_string(), value.to_string());
            }
            None => {
                eprintln!("error: --env expects KEY=VALUE, got '{}'", pair);
                return EXIT_VALIDATION;
            }
        }
    }

    let executor = StepExecutor::new(Arc::new(driver)).with_serial(serial.clone());
    let mut runner = FlowRunner::new(executor).with_env(env);

    let mut failed_flows = 0usize;
    for flow in &report.test_cases {
        let summary = runner.run_flow(flow).await;
        let status = if summary.is_ok() { "PASSED" } else { "FAILED" };
        println!(
            "{}  {} ({} passed, {} failed)",
            status,
            flow.source_path.display(),
            summary.passed,
            summary.failed
        );
        if !summary.is_ok() {
            failed_flows += 1;
            if let Some(reason) = &summary.first_failure {
                println!("        {}", reason);
            }
        }
    }

    println!(
        "{}/{} flow(s) passed",
        report.test_cases.len() - failed_flows,
        report.test_cases.len()
    );
    if failed_flows > 0 {
        EXIT_STEP_FAILURE
    } else {
        0
    }
}

/// Explicit serial wins; otherwise the first device adb reports as ready.
async fn pick_device(explicit: Option<String>) -> Option<String> {
    if let Some(serial) = explicit {
        return Some(serial);
    }
    Adb::devices()
        .await
        .ok()?
        .into_iter()
        .find(|(_, state)| state == "device")
        .map(|(serial, _)| serial)
}
