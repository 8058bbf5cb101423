//! Single-instance lock manager
//!
//! One lock file per application identity, held with an exclusive `flock`
//! for as long as the application runs. The kernel drops the flock when
//! the owner dies, even under SIGKILL, so a crashed instance never blocks
//! the next launch. The file also records the owner's pid and a liveness
//! token (its start time) so a contender can tell a live owner from a
//! recycled pid.

use crate::error::LauncherError;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// How often a contender re-checks a lock whose owner looks dead
const ACQUIRE_ATTEMPTS: u32 = 50;

/// Pause between contended attempts
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(10);

/// Owner record stored inside a lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub pid: i32,
    pub acquired_at: DateTime<Utc>,
    /// Start time of the owner in clock ticks since boot (0 when unknown)
    pub token: u64,
}

impl LockEntry {
    /// Entry for a process, stamped now
    pub fn for_pid(pid: Pid) -> Self {
        Self {
            pid: pid.as_raw(),
            acquired_at: Utc::now(),
            token: process_start_time(pid).unwrap_or(0),
        }
    }

    /// Whether the recorded owner still runs
    pub fn is_alive(&self) -> bool {
        let pid = Pid::from_raw(self.pid);
        if self.pid <= 0 {
            return false;
        }
        match kill(pid, None) {
            Err(Errno::ESRCH) => return false,
            Ok(()) | Err(_) => {}
        }

        match read_proc_stat(pid) {
            Some(stat) => {
                // Zombies have already dropped their descriptors
                if stat.state == 'Z' || stat.state == 'X' {
                    return false;
                }
                self.token == 0 || stat.start_time == self.token
            }
            None => true,
        }
    }
}

/// Outcome of an acquire attempt
#[derive(Debug)]
pub enum Acquire {
    Granted(InstanceLock),
    Held(Pid),
}

/// Outcome of a liveness check on an existing lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    Reclaimable,
    StillOwned(Pid),
}

/// A held single-instance lock; dropping it releases the flock
#[derive(Debug)]
pub struct InstanceLock {
    identity: String,
    file: Flock<File>,
    entry: LockEntry,
}

impl InstanceLock {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn entry(&self) -> &LockEntry {
        &self.entry
    }

    /// Keep the lock open past this process image (across execve).
    ///
    /// Clears close-on-exec and leaks the descriptor; the kernel releases the
    /// lock when the process that ends up owning it exits.
    pub fn into_inherited_fd(self) -> Result<RawFd, LauncherError> {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};

        let fd = self.file.as_raw_fd();
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
        std::mem::forget(self);
        Ok(fd)
    }
}

impl AsRawFd for InstanceLock {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Per-identity lock files under one directory
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Lock file used for an identity (binary path or logical name)
    pub fn lock_path(&self, identity: &str) -> PathBuf {
        let name = identity.trim_start_matches('/').replace('/', "_");
        if name.is_empty() {
            self.dir.join("_")
        } else {
            self.dir.join(name)
        }
    }

    /// Try to become the single running instance of `identity`.
    ///
    /// Atomic across processes: of any number of concurrent callers exactly
    /// one gets `Granted`, the others see `Held` with the winner's pid.
    pub fn acquire(&self, identity: &str, pid: Pid) -> Result<Acquire, LauncherError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(identity);

        for _ in 0..ACQUIRE_ATTEMPTS {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .mode(0o644)
                .open(&path)?;

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(mut file) => {
                    let entry = LockEntry::for_pid(pid);
                    write_entry(&mut file, &entry)?;
                    debug!("Single-instance: {} acquired by {}", identity, pid);
                    return Ok(Acquire::Granted(InstanceLock {
                        identity: identity.to_string(),
                        file,
                        entry,
                    }));
                }
                // A dead owner's flock goes away with its last descriptor,
                // and an empty record means the winner is still writing it
                Err((_, Errno::EAGAIN)) => match self.reclaim_if_dead(identity)? {
                    Reclaim::StillOwned(owner) => return Ok(Acquire::Held(owner)),
                    Reclaim::Reclaimable => {}
                },
                Err((_, errno)) => return Err(errno.into()),
            }

            thread::sleep(ACQUIRE_BACKOFF);
        }

        match read_entry(&path) {
            Some(entry) => Ok(Acquire::Held(Pid::from_raw(entry.pid))),
            None => Err(LauncherError::LockContended(identity.to_string())),
        }
    }

    /// Release a lock on the normal exit path. Only the owner may release.
    pub fn release(&self, lock: InstanceLock, pid: Pid) -> Result<(), LauncherError> {
        if lock.entry.pid != pid.as_raw() {
            return Err(LauncherError::BadRequest(format!(
                "{} does not own the lock of {} (owner {})",
                pid, lock.identity, lock.entry.pid
            )));
        }

        let InstanceLock {
            identity,
            mut file,
            ..
        } = lock;
        file.set_len(0)?;
        file.unlock().map_err(|(_, errno)| LauncherError::from(errno))?;
        debug!("Single-instance: {} released by {}", identity, pid);
        Ok(())
    }

    /// Decide whether the recorded owner of `identity` is gone
    pub fn reclaim_if_dead(&self, identity: &str) -> Result<Reclaim, LauncherError> {
        match read_entry(&self.lock_path(identity)) {
            Some(entry) if entry.is_alive() => Ok(Reclaim::StillOwned(Pid::from_raw(entry.pid))),
            Some(entry) => {
                debug!(
                    "Single-instance: owner {} of {} died without releasing",
                    entry.pid, identity
                );
                Ok(Reclaim::Reclaimable)
            }
            None => Ok(Reclaim::Reclaimable),
        }
    }

}

fn write_entry(file: &mut File, entry: &LockEntry) -> Result<(), LauncherError> {
    let json = serde_json::to_vec(entry)
        .map_err(|e| LauncherError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&json)?;
    file.sync_data()?;
    Ok(())
}

fn read_entry(path: &Path) -> Option<LockEntry> {
    let content = fs::read_to_string(path).ok()?;
    if content.trim().is_empty() {
        return None;
    }
    serde_json::from_str(&content).ok()
}

struct ProcStat {
    state: char,
    start_time: u64,
}

fn read_proc_stat(pid: Pid) -> Option<ProcStat> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm may contain spaces and parentheses; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    // starttime is field 22 overall, the 20th after the state
    let start_time = fields.nth(18)?.parse().ok()?;
    Some(ProcStat { state, start_time })
}

/// Start time of a process in clock ticks since boot
pub fn process_start_time(pid: Pid) -> Option<u64> {
    read_proc_stat(pid).map(|stat| stat.start_time)
}

/// Raises the window of an already running instance
pub trait Activator {
    fn activate(&self, owner: Pid, identity: &str) -> Result<(), LauncherError>;
}

/// Runs an external command `<command...> <pid> <identity>`; exit 0 means raised.
///
/// Without a command there is no window manager hook to call, and raising
/// succeeds as a no-op: the invoker is told the running instance was raised.
#[derive(Debug, Clone, Default)]
pub struct CommandActivator {
    command: Option<Vec<String>>,
}

impl CommandActivator {
    pub fn new(command: Option<&str>) -> Self {
        let command = command
            .map(|c| c.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|parts| !parts.is_empty());
        Self { command }
    }
}

impl Activator for CommandActivator {
    fn activate(&self, owner: Pid, identity: &str) -> Result<(), LauncherError> {
        let Some((program, args)) = self.command.as_ref().and_then(|c| c.split_first()) else {
            debug!("Single-instance: no activation command, {} of {} left as is", owner, identity);
            return Ok(());
        };

        let status = Command::new(program)
            .args(args)
            .arg(owner.to_string())
            .arg(identity)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;

        if status.success() {
            Ok(())
        } else {
            Err(LauncherError::CannotActivate)
        }
    }
}
