//! circus daemon - process supervisor with a JSON control socket
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground) with the default config file
//! circusd start
//!
//! # Start with an explicit config, in the background
//! circusd start -d -c ./circus.toml
//!
//! # Stop the daemon
//! circusd stop
//!
//! # Check daemon status
//! circusd status
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use circusd::arbiter::Arbiter;
use circusd::commands::CommandRegistry;
use circusd::config::Config;
use circusd::controller::Controller;
use circusd::monitor::spawn_monitor_task;

/// circus daemon - supervises processes and answers control commands
#[derive(Parser, Debug)]
#[command(name = "circusd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Configuration file (defaults to ~/.config/circus/circus.toml)
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status {
        /// Configuration file used to report the control endpoint
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
    },
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("circus")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("circusd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("circusd.log")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

/// Loads `path`, or the default config file if it exists, then applies
/// environment overrides.
fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => match Config::default_path().filter(|p| p.exists()) {
            Some(path) => Config::load(&path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => Config::default(),
        },
    };
    config
        .apply_env_overrides()
        .context("Invalid environment override")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'circusd stop' to stop it first.");
                process::exit(1);
            }

            let config = load_config(config.as_deref())?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..100 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 10 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status { config } => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                if let Ok(config) = load_config(config.as_deref()) {
                    println!("Endpoint: {}", config.circus.endpoint);
                }
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn run_daemon(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("circusd=info".parse()?)
                .add_directive("circus_core=info".parse()?)
                .add_directive("circus_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        watchers = config.watchers.len(),
        "circus daemon starting"
    );

    let supervisor = Arc::new(config.supervisor());
    let mut controller = Controller::new(
        config.controller(),
        Arc::new(CommandRegistry::with_defaults()),
        Arc::clone(&supervisor) as Arc<dyn Arbiter>,
    );

    if let Err(e) = controller.start().await {
        error!(error = %e, "Controller failed to start");
        supervisor.stop();
        supervisor.shutdown_token().cancelled().await;
        return Err(e.into());
    }

    let monitor_token = CancellationToken::new();
    let _monitor_handle = spawn_monitor_task(monitor_token.clone());
    info!("Process monitor started");

    // Returns once `quit` or a termination signal has stopped every process
    let result = controller.run(supervisor.shutdown_token()).await;
    monitor_token.cancel();
    controller.stop().await;

    if let Err(e) = result {
        error!(error = %e, "Controller error");
        return Err(e.into());
    }

    info!("circus daemon stopped");
    Ok(())
}
