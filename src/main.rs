use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use icloudds::config::{Config, ConfigOverrides};
use icloudds::lock::{AlreadyRunningError, ProcessLock};

const EXIT_NORMAL: i32 = 0;
const EXIT_FAILED_ALREADY_RUNNING: i32 = 1;
const EXIT_FAILED_NOT_A_DIRECTORY: i32 = 2;
const EXIT_FAILED_MISSING_ARGUMENT: i32 = 3;
const EXIT_FAILED_CLOUD_API: i32 = 4;

/// Bidirectional synchronizer between a local directory and iCloud Drive.
#[derive(Parser, Debug)]
#[command(name = "icloudds", version)]
struct Cli {
    /// Path to a JSON config file (lowest-precedence layer)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Local directory to sync
    #[arg(short = 'd', long = "directory")]
    directory: Option<PathBuf>,

    /// Remote account username
    #[arg(short = 'u', long = "username")]
    username: Option<String>,

    /// Remote account password (prompted from the environment/keyring if omitted)
    #[arg(short = 'p', long = "password")]
    password: Option<String>,

    /// Directory holding the remote client's session cookies
    #[arg(long = "cookie-directory")]
    cookie_directory: Option<PathBuf>,

    /// File of ignore regexes, one per line (lines starting with '#' are comments)
    #[arg(long = "ignore-regexes")]
    ignore_regexes: Option<PathBuf>,

    /// File of include regexes, one per line (lines starting with '#' are comments)
    #[arg(long = "include-regexes")]
    include_regexes: Option<PathBuf>,

    /// JSON logging configuration file
    #[arg(long = "logging-config")]
    logging_config: Option<PathBuf>,

    /// Path to the daemon's log file
    #[arg(long = "log-path")]
    log_path: Option<PathBuf>,

    /// Dirty-probe interval in seconds (minimum and default: 20)
    #[arg(long = "icloud-check-period")]
    icloud_check_period: Option<u64>,

    /// Full refresh interval in seconds (minimum and default: 90)
    #[arg(long = "icloud-refresh-period")]
    icloud_refresh_period: Option<u64>,

    /// Event debounce interval in seconds (minimum and default: 10)
    #[arg(long = "debounce-period")]
    debounce_period: Option<u64>,

    /// Size of the parallel download pool (default: cpu count)
    #[arg(long = "max-workers")]
    max_workers: Option<usize>,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = run(cli);
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> i32 {
    let overrides = ConfigOverrides {
        directory: cli.directory,
        username: cli.username,
        password: cli.password,
        cookie_directory: cli.cookie_directory,
        ignore_regexes_path: cli.ignore_regexes,
        include_regexes_path: cli.include_regexes,
        logging_config_path: cli.logging_config,
        log_path: cli.log_path,
        debounce_period: cli.debounce_period,
        icloud_check_period: cli.icloud_check_period,
        icloud_refresh_period: cli.icloud_refresh_period,
        max_workers: cli.max_workers,
    };

    let resolved_config_path = Config::resolve_config_path(cli.config.as_deref());
    let cfg = match Config::load_with_overrides(&resolved_config_path, overrides) {
        Ok(cfg) => cfg,
        Err(e) => return map_config_error(&e),
    };

    let lock = match ProcessLock::try_acquire(&cfg.directory) {
        Ok(lock) => lock,
        Err(e) => return map_lock_error(&e),
    };

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e:#}");
            return EXIT_FAILED_CLOUD_API;
        }
    };

    let exit_code = rt.block_on(run_async(cfg));
    drop(lock);
    exit_code
}

async fn run_async(cfg: Config) -> i32 {
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.notify_waiters();
    });

    match icloudds::daemon::run(cfg, shutdown).await {
        Ok(()) => EXIT_NORMAL,
        Err(e) => {
            eprintln!("icloudds exited with an error: {e:#}");
            EXIT_FAILED_CLOUD_API
        }
    }
}

fn map_config_error(err: &anyhow::Error) -> i32 {
    let msg = err.to_string();
    eprintln!("icloudds: {msg}");
    if msg.contains("not a directory") {
        EXIT_FAILED_NOT_A_DIRECTORY
    } else if msg.contains("is required") {
        EXIT_FAILED_MISSING_ARGUMENT
    } else {
        EXIT_FAILED_MISSING_ARGUMENT
    }
}

fn map_lock_error(err: &anyhow::Error) -> i32 {
    if err.chain().any(|cause| cause.is::<AlreadyRunningError>()) {
        eprintln!("icloudds: another instance is already syncing this directory");
        EXIT_FAILED_ALREADY_RUNNING
    } else {
        eprintln!("icloudds: failed to acquire process lock: {err:#}");
        EXIT_FAILED_ALREADY_RUNNING
    }
}
