//! Integration suite entry point
//!
//! Boots the backend and frontend, runs the default suite and exits with
//! 0 (pass), 1 (failure or coverage gap) or 2 (watchdog deadline).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use pickban_e2e::error::EXIT_FAILURE;
use pickban_e2e::session_log::SessionLog;
use pickban_e2e::steps::default_suite;
use pickban_e2e::{RequirementSet, Supervisor, SupervisorConfig};

#[derive(Parser, Debug)]
#[command(name = "pickban-e2e")]
#[command(about = "Integration test supervisor for the pick/ban backend and frontend")]
#[command(version)]
struct Args {
    /// Configuration file (defaults apply if it does not exist)
    #[arg(short, long, default_value = "pickban-e2e.toml")]
    config: PathBuf,

    /// Project root the services are started from
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Directory for session log files
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    /// Requirement declaration file
    #[arg(short, long)]
    requirements: Option<PathBuf>,

    /// Whole-run deadline in seconds
    #[arg(long)]
    watchdog_secs: Option<u64>,

    /// Do not kill processes holding the service ports
    #[arg(long)]
    no_reclaim: bool,

    /// Write the transcript to the log file only
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let args = Args::parse();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create tokio runtime: {}", e);
            std::process::exit(EXIT_FAILURE);
        }
    };
    let code = rt.block_on(async_main(args));

    // Drain tasks of killed children must not hold up the exit
    rt.shutdown_timeout(Duration::from_secs(1));
    std::process::exit(code);
}

async fn async_main(args: Args) -> i32 {
    let mut config = match SupervisorConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return e.exit_code();
        }
    };
    apply_overrides(&mut config, &args);

    let log = match SessionLog::create(&config.logs_dir, config.log_retention) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("Error: cannot open session log: {}", e);
            return e.exit_code();
        }
    };
    if let Err(e) = log.install(config.echo_console) {
        eprintln!("Error: {}", e);
        return e.exit_code();
    }

    info!("pickban-e2e v{}", env!("CARGO_PKG_VERSION"));
    info!("Session log: {}", log.path().display());

    let requirements = match RequirementSet::load(&config.requirements_path) {
        Ok(requirements) => requirements,
        Err(e) => {
            error!("{}", e);
            return e.exit_code();
        }
    };
    info!(
        "{} requirement(s) declared in {}",
        requirements.len(),
        config.requirements_path.display()
    );

    let mut supervisor = match Supervisor::new(config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!("{}", e);
            return e.exit_code();
        }
    };

    let report = supervisor.run(default_suite(), &requirements).await;

    if let Err(e) = report.write_json(&log.path().with_extension("json")) {
        error!("Could not write results: {}", e);
    }

    info!("Exiting with status {}", report.exit_code());
    report.exit_code()
}

fn apply_overrides(config: &mut SupervisorConfig, args: &Args) {
    if let Some(root) = &args.project_root {
        config.project_root = root.clone();
    }
    if let Some(dir) = &args.logs_dir {
        config.logs_dir = dir.clone();
    }
    if let Some(path) = &args.requirements {
        config.requirements_path = path.clone();
    }
    if let Some(secs) = args.watchdog_secs {
        config.watchdog.deadline_secs = secs;
    }
    if args.no_reclaim {
        config.ports.reclaim = false;
    }
    if args.quiet {
        config.echo_console = false;
    }
}
