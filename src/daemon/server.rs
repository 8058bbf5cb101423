//! applauncherd control loop
//!
//! Single-threaded. Every iteration polls the signal wake-up socket and the
//! report channel of each idle booster, then:
//! 1. records hand-offs (booster consumed, invoker connection received)
//! 2. turns pending signals into reaps, mode changes, restarts or shutdown
//! 3. spawns the boosters whose respawn deadline has passed
//!
//! Boosters are `fork`+`exec` of this binary with `--booster=<tag>`, so each
//! shows up as `booster-<tag>` and starts from a clean image.

use crate::booster::fds;
use crate::booster::types::BoosterType;
use crate::daemon::booster_pool::{BoosterHandle, BoosterPool, ExitOutcome, ServingApp};
use crate::daemon::config::LauncherConfig;
use crate::daemon::mode::{DaemonMode, ModeSignal};
use crate::daemon::protocol::{
    read_message, recv_fds, write_message, ExitStatus, Handoff, Message,
};
use crate::error::LauncherError;
use crate::signal::{DaemonEvent, SignalEvents};
use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, setsid, ForkResult, Pid};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long boosters get to exit after SIGTERM before SIGKILL
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Retry interval after a failed spawn
const SPAWN_RETRY: Duration = Duration::from_secs(1);

/// Exit status writes to a stuck invoker give up after this
const RELAY_TIMEOUT: Duration = Duration::from_secs(1);

/// Command-line switches of the daemon
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub boot_mode: bool,
    pub daemonize: bool,
    pub debug: bool,
    pub quiet: bool,
    pub config_path: Option<PathBuf>,
}

/// Exclusive lock on `<socket_dir>/applauncherd.lock`, also the pid marker
#[derive(Debug)]
pub struct DaemonLock {
    file: Flock<File>,
    path: PathBuf,
}

impl DaemonLock {
    /// Take the instance lock or report who holds it
    pub fn acquire(path: &Path) -> Result<Self, LauncherError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => Ok(Self {
                file,
                path: path.to_path_buf(),
            }),
            Err((mut file, Errno::EAGAIN)) => {
                let mut content = String::new();
                let _ = file.read_to_string(&mut content);
                match content.trim().parse::<i32>() {
                    Ok(pid) => Err(LauncherError::AlreadyRunning(pid)),
                    Err(_) => Err(LauncherError::AlreadyRunningUnknownPid),
                }
            }
            Err((_, errno)) => Err(errno.into()),
        }
    }

    /// Record the daemon's pid (after daemonizing)
    pub fn write_pid(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        let pid = std::process::id();
        (&*self.file).write_all(format!("{}\n", pid).as_bytes())?;
        self.file.sync_data()
    }

    /// Remove the marker; the lock goes with the descriptor
    pub fn remove(self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Detach from the terminal: double fork, new session, `/` as cwd, stdio on /dev/null
pub fn daemonize() -> Result<()> {
    // SAFETY: no other threads exist yet
    match unsafe { fork() }.context("Daemon: fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("Daemon: setsid failed")?;
    match unsafe { fork() }.context("Daemon: fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    std::env::set_current_dir("/")?;
    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for target in 0..3 {
        nix::unistd::dup2(null.as_raw_fd(), target)?;
    }
    Ok(())
}

/// Bind a booster socket, replacing a stale one
fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind {}", path.display()))?;

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)?;

    Ok(listener)
}

/// Non-blocking check for a hand-off report on a booster channel
fn take_handoff(channel: &mut UnixStream) -> Option<(Handoff, Option<UnixStream>)> {
    let ready = {
        let mut fds = [PollFd::new(channel.as_fd(), PollFlags::POLLIN)];
        matches!(poll(&mut fds, PollTimeout::ZERO), Ok(n) if n > 0)
    };
    if !ready {
        return None;
    }
    read_handoff(channel).ok().flatten()
}

/// Read one report; `Ok(None)` for anything but a hand-off
fn read_handoff(channel: &mut UnixStream) -> std::io::Result<Option<(Handoff, Option<UnixStream>)>> {
    match read_message(channel)? {
        (Message::Handoff(handoff), _) => {
            let invoker = match recv_fds(channel, 1) {
                Ok(mut fds) => fds.pop().map(UnixStream::from),
                Err(e) => {
                    warn!("Daemon: Hand-off from {} came without a connection: {}", handoff.pid, e);
                    None
                }
            };
            if let Some(invoker) = &invoker {
                let _ = invoker.set_write_timeout(Some(RELAY_TIMEOUT));
            }
            Ok(Some((handoff, invoker)))
        }
        (other, _) => {
            warn!("Daemon: Unexpected booster report: {:?}", other);
            Ok(None)
        }
    }
}

fn relay_exit(app: ServingApp, status: &ExitStatus) {
    info!(
        "Daemon: {} (pid {}) exited with status {}",
        app.app_name,
        app.pid,
        status.exit_code()
    );
    if let Some(mut invoker) = app.invoker {
        if let Err(e) = write_message(&mut invoker, &Message::ExitStatus(status.clone()), 0) {
            debug!("Daemon: Invoker of {} is gone: {}", app.pid, e);
        }
    }
}

fn exit_status(status: WaitStatus) -> Option<(Pid, ExitStatus)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid, ExitStatus { code, signal: None })),
        WaitStatus::Signaled(pid, signal, _) => Some((
            pid,
            ExitStatus {
                code: 128 + signal as i32,
                signal: Some(signal as i32),
            },
        )),
        _ => None,
    }
}

/// What a booster's report channel had to say
enum Report {
    Handoff(Handoff, Option<UnixStream>),
    Closed,
    Nothing,
}

/// The launcher daemon
pub struct Daemon {
    config: LauncherConfig,
    options: DaemonOptions,
    mode: DaemonMode,
    pool: BoosterPool,
    listeners: BTreeMap<BoosterType, UnixListener>,
    signals: SignalEvents,
    lock: Option<DaemonLock>,
    exe: PathBuf,
}

impl Daemon {
    /// Take the instance lock and prepare the control loop. Fails with
    /// `AlreadyRunning` when another daemon owns the socket directory.
    pub fn new(config: LauncherConfig, options: DaemonOptions) -> Result<Self> {
        config.ensure_socket_dir()?;
        let lock = DaemonLock::acquire(&config.instance_lock_path())?;

        let mode = DaemonMode::initial(options.boot_mode);
        let pool = BoosterPool::new(config.types_for(mode));
        let exe = std::env::current_exe().context("Daemon: can't locate own binary")?;

        Ok(Self {
            config,
            options,
            mode,
            pool,
            listeners: BTreeMap::new(),
            signals: SignalEvents::new()?,
            lock: Some(lock),
            exe,
        })
    }

    /// Detach if asked, publish the pid and run until SIGTERM
    pub fn start(&mut self) -> Result<()> {
        if self.options.daemonize {
            daemonize()?;
        }
        if let Some(lock) = self.lock.as_mut() {
            lock.write_pid()?;
        }
        self.signals.setup()?;
        self.run()
    }

    fn run(&mut self) -> Result<()> {
        info!("Daemon: Started in {} mode.", self.mode);
        self.sync_listeners()?;
        self.fill_vacant_slots();

        loop {
            let timeout = self.poll_timeout();
            for pid in self.ready_channels(timeout)? {
                self.read_report(pid);
            }

            for event in self.signals.drain() {
                match event {
                    DaemonEvent::ChildExited => self.reap_children(),
                    DaemonEvent::ExitBootMode => self.apply_mode(ModeSignal::ExitBoot),
                    DaemonEvent::EnterBootMode => self.apply_mode(ModeSignal::EnterBoot),
                    DaemonEvent::RestartBoosters => self.reload_and_restart(),
                    DaemonEvent::Shutdown => {
                        self.shutdown();
                        return Ok(());
                    }
                }
            }

            for kind in self.pool.due_respawns(Instant::now()) {
                self.start_booster(kind);
            }
        }
    }

    fn poll_timeout(&self) -> PollTimeout {
        match self.pool.next_deadline() {
            Some(at) => {
                let wait = at.saturating_duration_since(Instant::now());
                // Round up so a deadline is never polled for in a tight loop
                let ms = wait.as_micros().div_ceil(1000).min(u16::MAX as u128) as u16;
                PollTimeout::from(ms)
            }
            None => PollTimeout::NONE,
        }
    }

    /// Wait for signals or booster reports; returns boosters with pending reports
    fn ready_channels(&self, timeout: PollTimeout) -> Result<Vec<Pid>> {
        let watched: Vec<(Pid, &UnixStream)> = self
            .pool
            .idle()
            .filter_map(|b| b.channel.as_ref().map(|c| (b.pid, c)))
            .collect();

        let mut fds = Vec::with_capacity(watched.len() + 1);
        fds.push(PollFd::new(self.signals.wake_fd(), PollFlags::POLLIN));
        fds.extend(watched.iter().map(|(_, c)| PollFd::new(c.as_fd(), PollFlags::POLLIN)));

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(anyhow!("Daemon: poll failed: {}", e)),
        }

        Ok(watched
            .iter()
            .zip(fds.iter().skip(1))
            .filter(|(_, fd)| fd.revents().is_some_and(|r| !r.is_empty()))
            .map(|((pid, _), _)| *pid)
            .collect())
    }

    /// Record hand-offs that are already queued, without blocking
    fn collect_pending_reports(&mut self) {
        if let Ok(ready) = self.ready_channels(PollTimeout::ZERO) {
            for pid in ready {
                self.read_report(pid);
            }
        }
    }

    fn read_report(&mut self, pid: Pid) {
        let report = match self.pool.idle_mut(pid).and_then(|b| b.channel.as_mut()) {
            Some(channel) => match read_handoff(channel) {
                Ok(Some((handoff, invoker))) => Report::Handoff(handoff, invoker),
                Ok(None) => Report::Nothing,
                Err(e) => {
                    debug!("Daemon: Report channel of {} closed: {}", pid, e);
                    Report::Closed
                }
            },
            None => Report::Nothing,
        };

        match report {
            Report::Handoff(handoff, invoker) => self.on_handoff(pid, handoff, invoker),
            Report::Closed => {
                if let Some(booster) = self.pool.idle_mut(pid) {
                    booster.channel = None;
                }
            }
            Report::Nothing => {}
        }
    }

    fn on_handoff(&mut self, pid: Pid, handoff: Handoff, invoker: Option<UnixStream>) {
        let Some(kind) = self.pool.hand_off(pid, handoff.app_name.clone(), invoker) else {
            return;
        };
        info!(
            "Daemon: {} (pid {}) launched {}",
            kind.process_name(),
            pid,
            handoff.app_name
        );

        let delay = self.config.respawn_delay_for(self.mode);
        self.pool.schedule_respawn(kind, Instant::now() + delay);
    }

    fn reap_children(&mut self) {
        // A booster that launched and exited at once must be known as an app
        self.collect_pending_reports();

        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    if let Some((pid, status)) = exit_status(status) {
                        self.on_child_exit(pid, status);
                    }
                }
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("Daemon: waitpid failed: {}", e);
                    break;
                }
            }
        }

        debug!(
            "Daemon: {} descriptors open",
            fds::count_open().unwrap_or_default()
        );
    }

    fn on_child_exit(&mut self, pid: Pid, status: ExitStatus) {
        match self.pool.on_exit(pid, Instant::now()) {
            ExitOutcome::AppExited(app) => relay_exit(app, &status),
            ExitOutcome::BoosterDied { kind, pid, backoff } => {
                if backoff.is_zero() {
                    warn!(
                        "Daemon: {} (pid {}) died with status {}, respawning.",
                        kind.process_name(),
                        pid,
                        status.exit_code()
                    );
                } else {
                    error!(
                        "Daemon: {} keeps dying, next attempt in {}s.",
                        kind.process_name(),
                        backoff.as_secs()
                    );
                }
                self.pool.schedule_respawn(kind, Instant::now() + backoff);
            }
            ExitOutcome::Unknown => debug!("Daemon: Reaped untracked child {}", pid),
        }
    }

    fn apply_mode(&mut self, signal: ModeSignal) {
        let transition = self.mode.apply(signal);
        info!("{}", transition.message);

        if transition.changed() {
            self.mode = transition.to;
            if let Err(e) = self.restart_boosters() {
                error!("Daemon: Switching to {} mode failed: {:#}", self.mode, e);
            }
        }
    }

    fn reload_and_restart(&mut self) {
        info!("Daemon: Restarting boosters.");

        let mut config = LauncherConfig::load(self.options.config_path.as_deref());
        if config.socket_dir != self.config.socket_dir {
            warn!(
                "Daemon: Socket directory change to {} needs a daemon restart",
                config.socket_dir.display()
            );
            config.socket_dir = self.config.socket_dir.clone();
        }
        self.config = config;

        if let Err(e) = self.restart_boosters() {
            error!("Daemon: Restarting boosters failed: {:#}", e);
        }
    }

    /// Replace every idle booster with a fresh set for the current mode.
    /// Serving applications are never touched.
    fn restart_boosters(&mut self) -> Result<()> {
        self.collect_pending_reports();
        let old = self.pool.reset_kinds(self.config.types_for(self.mode));
        self.terminate(old);
        self.sync_listeners()?;
        self.fill_vacant_slots();
        Ok(())
    }

    /// Bind sockets for the mode's types; unlink the ones that left the set.
    /// Listeners outlive booster generations, so invokers never find a hole.
    fn sync_listeners(&mut self) -> Result<()> {
        let wanted = self.config.types_for(self.mode).to_vec();

        let stale: Vec<BoosterType> = self
            .listeners
            .keys()
            .filter(|kind| !wanted.contains(kind))
            .copied()
            .collect();
        for kind in stale {
            self.listeners.remove(&kind);
            let _ = fs::remove_file(self.config.socket_path(kind));
            debug!("Daemon: {} socket removed", kind.process_name());
        }

        for kind in wanted {
            if !self.listeners.contains_key(&kind) {
                let listener = bind_socket(&self.config.socket_path(kind))?;
                self.listeners.insert(kind, listener);
            }
        }
        Ok(())
    }

    fn fill_vacant_slots(&mut self) {
        for kind in self.pool.vacant() {
            self.start_booster(kind);
        }
    }

    fn start_booster(&mut self, kind: BoosterType) {
        match self.spawn_booster(kind) {
            Ok(handle) => {
                debug!("Daemon: Started {} (pid {})", kind.process_name(), handle.pid);
                if let Some(old) = self.pool.insert(handle) {
                    self.terminate(vec![old]);
                }
            }
            Err(e) => {
                error!("Daemon: Spawning {} failed: {:#}", kind.process_name(), e);
                self.pool.schedule_respawn(kind, Instant::now() + SPAWN_RETRY);
            }
        }
    }

    fn spawn_booster(&self, kind: BoosterType) -> Result<BoosterHandle> {
        let listener = self
            .listeners
            .get(&kind)
            .ok_or_else(|| anyhow!("no socket bound for {}", kind.process_name()))?;
        let (daemon_end, booster_end) = UnixStream::pair()?;

        let mut cmd = Command::new(&self.exe);
        cmd.arg0(kind.process_name())
            .arg(format!("--booster={}", kind))
            .stdin(Stdio::null());
        if self.mode == DaemonMode::Boot {
            cmd.arg("--boot-mode");
        }
        if self.options.debug {
            cmd.arg("--debug");
        }
        if self.options.quiet {
            cmd.arg("--quiet");
        }
        if let Some(path) = &self.options.config_path {
            cmd.arg("--config").arg(path);
        }

        let listener_fd = listener.as_raw_fd();
        let report_fd = booster_end.as_raw_fd();
        // SAFETY: the hook only issues fcntl/dup2/close/prctl
        unsafe {
            cmd.pre_exec(move || {
                fds::install_inherited(listener_fd, report_fd)?;
                // Idle boosters go down with the daemon
                nix::sys::prctl::set_pdeathsig(Signal::SIGHUP)?;
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to start {}", self.exe.display()))?;
        drop(booster_end);

        Ok(BoosterHandle {
            kind,
            pid: Pid::from_raw(child.id() as i32),
            channel: Some(daemon_end),
            spawned_at: Instant::now(),
        })
    }

    /// SIGTERM, bounded wait, SIGKILL. A booster that reports a hand-off in
    /// the meantime became an application and is spared.
    fn terminate(&mut self, boosters: Vec<BoosterHandle>) {
        for booster in &boosters {
            let _ = kill(booster.pid, Signal::SIGTERM);
        }

        let deadline = Instant::now() + TERMINATE_GRACE;
        let mut remaining = boosters;
        while !remaining.is_empty() {
            let mut still_running = Vec::with_capacity(remaining.len());
            for mut booster in remaining {
                if let Some((handoff, invoker)) = booster.channel.as_mut().and_then(take_handoff) {
                    self.adopt(&booster, handoff, invoker);
                    continue;
                }
                match waitpid(booster.pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => still_running.push(booster),
                    Ok(status) => {
                        // Consumed and gone before we looked at the channel
                        if let Some((handoff, invoker)) =
                            booster.channel.as_mut().and_then(take_handoff)
                        {
                            self.adopt(&booster, handoff, invoker);
                            if let Some((pid, status)) = exit_status(status) {
                                self.on_child_exit(pid, status);
                            }
                        }
                    }
                    Err(_) => {}
                }
            }
            remaining = still_running;

            if remaining.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        for booster in remaining {
            warn!(
                "Daemon: {} (pid {}) ignored SIGTERM, killing it",
                booster.kind.process_name(),
                booster.pid
            );
            let _ = kill(booster.pid, Signal::SIGKILL);
            let _ = waitpid(booster.pid, None);
        }
    }

    fn adopt(&mut self, booster: &BoosterHandle, handoff: Handoff, invoker: Option<UnixStream>) {
        info!(
            "Daemon: {} (pid {}) launched {} while being replaced",
            booster.kind.process_name(),
            booster.pid,
            handoff.app_name
        );
        self.pool.adopt(ServingApp {
            kind: booster.kind,
            pid: booster.pid,
            app_name: handoff.app_name,
            invoker,
            started_at: Instant::now(),
        });
    }

    /// Stop boosters, remove sockets and the instance marker. Applications
    /// keep running.
    fn shutdown(&mut self) {
        info!("Daemon: Shutting down.");
        self.collect_pending_reports();

        let boosters = self.pool.reset_kinds(&[]);
        self.terminate(boosters);

        let mut running = 0;
        for app in self.pool.serving() {
            debug!("Daemon: {} (pid {}) keeps running", app.app_name, app.pid);
            running += 1;
        }
        if running > 0 {
            info!("Daemon: Leaving {} running applications.", running);
        }

        for kind in std::mem::take(&mut self.listeners).into_keys() {
            let _ = fs::remove_file(self.config.socket_path(kind));
        }
        if let Some(lock) = self.lock.take() {
            lock.remove();
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        for kind in self.listeners.keys() {
            let _ = fs::remove_file(self.config.socket_path(*kind));
        }
    }
}
