//! applauncherd: prefork application launcher daemon
//!
//! The same binary runs the boosters: the daemon re-executes itself as
//! `booster-<tag> --booster=<tag>`.

use anyhow::Result;
use applauncherd::booster;
use applauncherd::booster::types::BoosterType;
use applauncherd::daemon::config::{self, LauncherConfig};
use applauncherd::daemon::server::{Daemon, DaemonOptions};
use applauncherd::error::{ErrorClass, LauncherError};
use applauncherd::logging::{self, LogTarget};
use std::env;
use std::path::PathBuf;
use std::process;

/// Parsed command line
struct Cli {
    options: DaemonOptions,
    booster: Option<BoosterType>,
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    let cli = match parse_args(&args) {
        Ok(Some(cli)) => cli,
        Ok(None) => {
            print_usage();
            process::exit(0);
        }
        Err(msg) => {
            eprintln!("applauncherd: {}", msg);
            print_usage();
            process::exit(1);
        }
    };

    let result = match cli.booster {
        Some(kind) => run_booster(kind, &cli.options),
        None => run_daemon(cli.options),
    };

    if let Err(e) = result {
        match e.downcast_ref::<LauncherError>() {
            Some(err) if err.class() == ErrorClass::StartupFatal => {
                eprintln!("{}", err);
                process::exit(err.exit_code());
            }
            _ => {
                tracing::error!("{:#}", e);
                eprintln!("applauncherd: {:#}", e);
                process::exit(1);
            }
        }
    }
}

/// `Ok(None)` means `--help`
fn parse_args(args: &[String]) -> Result<Option<Cli>, String> {
    let mut options = DaemonOptions::default();
    let mut booster = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "--boot-mode" | "-b" => options.boot_mode = true,
            "--daemon" | "-d" => options.daemonize = true,
            "--debug" => options.debug = true,
            "--quiet" | "-q" => options.quiet = true,
            "--config" => {
                let path = iter.next().ok_or("--config needs a path")?;
                options.config_path = Some(PathBuf::from(path));
            }
            other => {
                if let Some(tag) = other.strip_prefix("--booster=") {
                    booster = Some(tag.parse::<BoosterType>().map_err(|e| e.to_string())?);
                } else if let Some(path) = other.strip_prefix("--config=") {
                    options.config_path = Some(PathBuf::from(path));
                } else {
                    return Err(format!("unknown option '{}'", other));
                }
            }
        }
    }

    Ok(Some(Cli { options, booster }))
}

fn log_target(config: &LauncherConfig, options: &DaemonOptions) -> LogTarget {
    LogTarget::select(config.log_file.as_deref(), options.quiet)
}

fn run_daemon(mut options: DaemonOptions) -> Result<()> {
    // Applications need a display; checked before anything forks
    if env::var_os("DISPLAY").map_or(true, |d| d.is_empty()) {
        return Err(LauncherError::DisplayNotSet.into());
    }

    // Daemonizing moves to "/", and SIGHUP reloads and boosters reread this path
    if let Some(path) = options.config_path.take() {
        options.config_path = Some(config::absolute_path(&path)?);
    }

    let config = LauncherConfig::load(options.config_path.as_deref());
    logging::init("applauncherd", log_target(&config, &options), options.debug)?;

    let mut daemon = Daemon::new(config, options)?;
    daemon.start()
}

fn run_booster(kind: BoosterType, options: &DaemonOptions) -> Result<()> {
    let config = LauncherConfig::load(options.config_path.as_deref());
    logging::init("applauncherd", log_target(&config, options), options.debug)?;

    booster::main(kind, &config, options.boot_mode)
}

fn print_usage() {
    println!("Usage: applauncherd [options]");
    println!();
    println!("Start the application launcher daemon.");
    println!();
    println!("Options:");
    println!("  -b, --boot-mode     Start in boot mode: boosters skip heavy preloads");
    println!("                      and are respawned without delay");
    println!("  -d, --daemon        Run as a background daemon");
    println!("      --debug         Log debug messages");
    println!("  -q, --quiet         Suppress all logging");
    println!("      --config PATH   Read configuration from PATH");
    println!("  -h, --help          Print this help and exit");
    println!();
    println!("Signals:");
    println!("  SIGUSR1  leave boot mode     SIGUSR2  enter boot mode");
    println!("  SIGHUP   restart boosters    SIGTERM  shut down");
}
