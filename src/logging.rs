//! Log setup
//!
//! Lines follow the syslog convention observers grep for:
//! `applauncherd[1234]: Daemon: Entered boot mode.` The pid is read for
//! every event, so boosters (separate processes sharing this code) log
//! under their own pid.

use anyhow::{Context, Result};
use std::fmt;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a tracing filter directive
pub const LOG_ENV: &str = "APPLAUNCHERD_LOG";

/// Descriptor of the log file, once one is installed
static LOG_FD: OnceLock<RawFd> = OnceLock::new();

/// Where log lines go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    File(PathBuf),
    Discard,
}

impl LogTarget {
    /// A configured log file wins; `quiet` only silences the console
    pub fn select(log_file: Option<&Path>, quiet: bool) -> Self {
        match log_file {
            Some(path) => LogTarget::File(path.to_path_buf()),
            None if quiet => LogTarget::Discard,
            None => LogTarget::Stderr,
        }
    }
}

/// Formats events as `<ident>[<pid>]: <message>`
pub struct SyslogFormat {
    ident: &'static str,
}

impl SyslogFormat {
    pub fn new(ident: &'static str) -> Self {
        Self { ident }
    }
}

impl<S, N> FormatEvent<S, N> for SyslogFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(writer, "{}[{}]: ", self.ident, std::process::id())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber
pub fn init(ident: &'static str, target: LogTarget, debug: bool) -> Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .event_format(SyslogFormat::new(ident));

    let result = match target {
        LogTarget::Stderr => builder.with_writer(std::io::stderr).try_init(),
        LogTarget::Discard => builder.with_writer(std::io::sink).try_init(),
        LogTarget::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let fd = file.as_raw_fd();
            let result = builder.with_writer(Mutex::new(file)).try_init();
            if result.is_ok() {
                let _ = LOG_FD.set(fd);
            }
            result
        }
    };

    // A second init (e.g. in tests) keeps the first subscriber
    if let Err(e) = result {
        tracing::debug!("Logger already initialized: {}", e);
    }
    Ok(())
}

/// Log file descriptor that must survive descriptor sweeps
pub fn log_fd() -> Option<RawFd> {
    LOG_FD.get().copied()
}
