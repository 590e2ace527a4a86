//! rinawarp - several shells in one terminal
//!
//! Every session is a shell on its own pseudo-terminal; one is shown at a
//! time and the others keep running in the background.
//!
//! # Quick Start
//!
//! ```text
//! rinawarp                 # Start with $SHELL
//! rinawarp -s zsh          # Start with zsh
//! rinawarp -d ~/src        # Start in ~/src
//! ```
//!
//! # Keybindings (Ctrl+B prefix)
//!
//! | Key | Action |
//! |-----|--------|
//! | c | New session |
//! | n/p | Next/Previous session |
//! | x | Close session |
//! | 1-9, 0 | Go to session |
//! | ] | Paste clipboard |
//! | q | Quit |

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rinawarp::config::Config;
use rinawarp::ui::{Host, HostOptions};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable holding the log filter
const LOG_ENV: &str = "RINAWARP_LOG";

/// Command line options
#[derive(Debug, Default, PartialEq)]
struct Args {
    shell: Option<String>,
    directory: Option<PathBuf>,
    config: Option<PathBuf>,
    /// Write the effective configuration and exit
    init_config: bool,
}

#[derive(Debug, PartialEq)]
enum Command {
    Run(Args),
    Help,
    Version,
}

fn print_version() {
    eprintln!("rinawarp {}", VERSION);
}

fn print_help() {
    eprintln!("rinawarp {} - several shells in one terminal", VERSION);
    eprintln!();
    eprintln!("Usage: rinawarp [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --shell <CMD>     Shell to run (default: config, then $SHELL)");
    eprintln!("  -d, --dir <PATH>      Working directory of the first session");
    eprintln!("  -c, --config <PATH>   Config file (default: ~/.rinawarp/config.toml)");
    eprintln!("      --init-config     Write the config file with all settings and exit");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Keybindings (Ctrl+B prefix, configurable):");
    eprintln!("  Ctrl+B, c             New session");
    eprintln!("  Ctrl+B, n / p         Next / previous session");
    eprintln!("  Ctrl+B, x             Close session");
    eprintln!("  Ctrl+B, 1-9, 0        Go to session 1-10");
    eprintln!("  Ctrl+B, ]             Paste clipboard");
    eprintln!("  Ctrl+B, q             Quit");
    eprintln!("  Ctrl+B, Ctrl+B        Send Ctrl+B to the shell");
    eprintln!("  Alt+Up / Alt+Down    Recall older / newer command");
    eprintln!();
    eprintln!("Logs: ~/.rinawarp/rinawarp.log (filter with {})", LOG_ENV);
}

fn parse_args<I>(args: I) -> Result<Command, String>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-v" | "--version" => return Ok(Command::Version),
            "-s" | "--shell" => {
                let shell = args.next().ok_or("Missing shell argument")?;
                parsed.shell = Some(shell);
            }
            "-d" | "--dir" => {
                let dir = args.next().ok_or("Missing directory argument")?;
                parsed.directory = Some(PathBuf::from(dir));
            }
            "-c" | "--config" => {
                let path = args.next().ok_or("Missing config path argument")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--init-config" => parsed.init_config = true,
            other => return Err(format!("Unknown option: {}", other)),
        }
    }
    Ok(Command::Run(parsed))
}

/// Log to `~/.rinawarp/rinawarp.log`; the terminal itself belongs to the shells
fn init_logging() {
    let Ok(dir) = Config::app_dir() else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("rinawarp.log"))
        .ok();

    if let Some(file) = log_file {
        let filter =
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let loaded = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    if loaded.defaulted {
        info!("running with default configuration");
    }
    if args.init_config {
        match &args.config {
            Some(path) => loaded.config.save_to(path)?,
            None => loaded.config.save()?,
        }
        eprintln!("Configuration written");
        return Ok(());
    }

    let directory = match args.directory {
        Some(dir) => Some(
            dir.canonicalize()
                .with_context(|| format!("cannot use directory {}", dir.display()))?,
        ),
        None => None,
    };

    let mut host = Host::new(
        &loaded.config,
        HostOptions {
            shell: args.shell,
            directory,
        },
    )?;
    host.run()
}

fn main() -> ExitCode {
    let args = match parse_args(env::args().skip(1)) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            print_help();
            return ExitCode::SUCCESS;
        }
        Ok(Command::Version) => {
            print_version();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            return ExitCode::FAILURE;
        }
    };

    init_logging();
    info!("rinawarp {} starting", VERSION);

    match run(args) {
        Ok(()) => {
            info!("rinawarp exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal");
            eprintln!("rinawarp: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
