//! Launcher configuration parsing from applauncherd.conf
//!
//! Shell-style assignments, one per line:
//! - LAUNCHER_BOOT_TYPES ("m q")
//! - LAUNCHER_NORMAL_TYPES ("m q d e")
//! - LAUNCHER_RESPAWN_DELAY (seconds)
//! - LAUNCHER_SOCKET_DIR, LAUNCHER_LOCK_DIR, LAUNCHER_LOG_FILE
//! - LAUNCHER_ACTIVATE_COMMAND ("command args", called with <pid> <identity>)
//! - LAUNCHER_INVOKER_TIMEOUT (seconds)
//! - LAUNCHER_BOOSTER_<TAG>_PRELOAD ("libfoo.so libbar.so")
//! - LAUNCHER_BOOSTER_<TAG>_ENTRY (main, exec)

use crate::booster::types::{BoosterType, EntryConvention, RuntimeProfile};
use crate::daemon::mode::DaemonMode;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/applauncherd.conf";

/// Environment variable overriding the configuration file path
pub const CONFIG_ENV: &str = "APPLAUNCHERD_CONFIG";

/// Delay before a consumed booster is replaced in normal mode
const DEFAULT_RESPAWN_DELAY: Duration = Duration::from_secs(2);

/// How long the invoker waits for a booster's answer
const DEFAULT_INVOKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Complete launcher configuration
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Types kept alive in boot mode
    pub boot_types: Vec<BoosterType>,
    /// Types kept alive in normal mode
    pub normal_types: Vec<BoosterType>,
    /// Replacement delay after a hand-off (normal mode only)
    pub respawn_delay: Duration,
    /// Directory holding booster sockets and the instance lock
    pub socket_dir: PathBuf,
    /// Directory holding single-instance lock files (defaults under socket_dir)
    pub lock_dir: Option<PathBuf>,
    /// Append log lines here instead of stderr
    pub log_file: Option<PathBuf>,
    /// Command used to raise an existing single-instance application
    pub activate_command: Option<String>,
    /// Invoker reply timeout
    pub invoker_timeout: Duration,
    /// Per-type overrides of the built-in runtime profiles
    pub profiles: BTreeMap<BoosterType, RuntimeProfile>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            boot_types: vec![BoosterType::M, BoosterType::Q],
            normal_types: vec![BoosterType::M, BoosterType::Q, BoosterType::D, BoosterType::E],
            respawn_delay: DEFAULT_RESPAWN_DELAY,
            socket_dir: default_socket_dir(),
            lock_dir: None,
            log_file: None,
            activate_command: None,
            invoker_timeout: DEFAULT_INVOKER_TIMEOUT,
            profiles: BTreeMap::new(),
        }
    }
}

impl LauncherConfig {
    /// Load configuration from an explicit path, `$APPLAUNCHERD_CONFIG`, or
    /// the system default. A missing file yields the defaults.
    pub fn load(explicit: Option<&Path>) -> Self {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => Self::config_path(),
        };
        Self::from_file(&path).unwrap_or_default()
    }

    /// Resolve the configuration file path from the environment
    pub fn config_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Parse configuration from a specific file
    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    /// Parse configuration from content string
    pub fn parse(content: &str) -> Self {
        let mut config = LauncherConfig::default();
        let mut preloads: BTreeMap<BoosterType, Vec<PathBuf>> = BTreeMap::new();
        let mut entries: BTreeMap<BoosterType, EntryConvention> = BTreeMap::new();

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);

            let Some((key, value)) = parse_assignment(line) else {
                continue;
            };
            let value = unquote(&value);

            match key.as_str() {
                "LAUNCHER_BOOT_TYPES" => config.boot_types = parse_types(&key, &value),
                "LAUNCHER_NORMAL_TYPES" => config.normal_types = parse_types(&key, &value),
                "LAUNCHER_RESPAWN_DELAY" => match value.parse::<u64>() {
                    Ok(secs) => config.respawn_delay = Duration::from_secs(secs),
                    Err(_) => warn!("Config: ignoring {}={}", key, value),
                },
                "LAUNCHER_INVOKER_TIMEOUT" => match value.parse::<u64>() {
                    Ok(secs) if secs > 0 => config.invoker_timeout = Duration::from_secs(secs),
                    _ => warn!("Config: ignoring {}={}", key, value),
                },
                "LAUNCHER_SOCKET_DIR" => config.socket_dir = PathBuf::from(value),
                "LAUNCHER_LOCK_DIR" => config.lock_dir = Some(PathBuf::from(value)),
                "LAUNCHER_LOG_FILE" => config.log_file = Some(PathBuf::from(value)),
                "LAUNCHER_ACTIVATE_COMMAND" => {
                    if !value.trim().is_empty() {
                        config.activate_command = Some(value);
                    }
                }
                _ if key.starts_with("LAUNCHER_BOOSTER_") => {
                    let suffix = &key["LAUNCHER_BOOSTER_".len()..];

                    if let Some(tag) = suffix.strip_suffix("_PRELOAD") {
                        // LAUNCHER_BOOSTER_<TAG>_PRELOAD
                        if let Some(kind) = parse_tag(&key, tag) {
                            preloads.insert(
                                kind,
                                value.split_whitespace().map(PathBuf::from).collect(),
                            );
                        }
                    } else if let Some(tag) = suffix.strip_suffix("_ENTRY") {
                        // LAUNCHER_BOOSTER_<TAG>_ENTRY
                        if let Some(kind) = parse_tag(&key, tag) {
                            match value.parse::<EntryConvention>() {
                                Ok(entry) => {
                                    entries.insert(kind, entry);
                                }
                                Err(e) => warn!("Config: {}: {}", key, e),
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        for (kind, preload) in preloads {
            config.profile_mut(kind).preload = preload;
        }
        for (kind, entry) in entries {
            config.profile_mut(kind).entry = entry;
        }

        config
    }

    fn profile_mut(&mut self, kind: BoosterType) -> &mut RuntimeProfile {
        self.profiles
            .entry(kind)
            .or_insert_with(|| RuntimeProfile::default_for(kind))
    }

    /// Runtime profile for a type (configured or built-in)
    pub fn profile(&self, kind: BoosterType) -> RuntimeProfile {
        self.profiles
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| RuntimeProfile::default_for(kind))
    }

    /// Booster types kept alive in a mode
    pub fn types_for(&self, mode: DaemonMode) -> &[BoosterType] {
        match mode {
            DaemonMode::Boot => &self.boot_types,
            DaemonMode::Normal => &self.normal_types,
        }
    }

    /// Replacement delay for consumed boosters in a mode
    pub fn respawn_delay_for(&self, mode: DaemonMode) -> Duration {
        match mode {
            DaemonMode::Boot => Duration::ZERO,
            DaemonMode::Normal => self.respawn_delay,
        }
    }

    /// Socket the boosters of a type listen on
    pub fn socket_path(&self, kind: BoosterType) -> PathBuf {
        self.socket_dir.join(kind.process_name())
    }

    /// Instance lock / pid marker of the daemon
    pub fn instance_lock_path(&self) -> PathBuf {
        self.socket_dir.join("applauncherd.lock")
    }

    /// Directory of single-instance lock files
    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| self.socket_dir.join("single-instance-locks"))
    }

    /// Create the socket directory with owner-only permissions
    pub fn ensure_socket_dir(&self) -> Result<()> {
        if !self.socket_dir.exists() {
            fs::create_dir_all(&self.socket_dir).with_context(|| {
                format!("Failed to create {}", self.socket_dir.display())
            })?;

            let mut perms = fs::metadata(&self.socket_dir)?.permissions();
            perms.set_mode(0o700);
            fs::set_permissions(&self.socket_dir, perms)?;
        }
        Ok(())
    }
}

/// Socket directory used when none is configured
pub fn default_socket_dir() -> PathBuf {
    dirs::runtime_dir()
        .map(|dir| dir.join("applauncherd"))
        .unwrap_or_else(|| PathBuf::from(format!("/tmp/applauncherd-{}", nix::unistd::getuid())))
}

/// Absolute form of a path given on the command line. A missing file is
/// resolved against the current directory.
pub fn absolute_path(path: &Path) -> std::io::Result<PathBuf> {
    match fs::canonicalize(path) {
        Ok(resolved) => Ok(resolved),
        Err(_) if path.is_absolute() => Ok(path.to_path_buf()),
        Err(_) => Ok(std::env::current_dir()?.join(path)),
    }
}

fn parse_types(key: &str, value: &str) -> Vec<BoosterType> {
    let mut types = Vec::new();
    for tag in value.split_whitespace() {
        match tag.parse::<BoosterType>() {
            Ok(kind) if !types.contains(&kind) => types.push(kind),
            Ok(_) => {}
            Err(e) => warn!("Config: {}: {}", key, e),
        }
    }
    types
}

fn parse_tag(key: &str, tag: &str) -> Option<BoosterType> {
    match tag.to_lowercase().parse::<BoosterType>() {
        Ok(kind) => Some(kind),
        Err(e) => {
            warn!("Config: {}: {}", key, e);
            None
        }
    }
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();

    if s.starts_with('"') && s.ends_with('"') && s.len() >= 2 {
        return s[1..s.len() - 1].to_string();
    }

    if s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2 {
        return s[1..s.len() - 1].to_string();
    }

    s.to_string()
}
