//! Boosters: pre-initialized processes waiting to become applications
//!
//! A booster is spawned by the daemon with its type's listening socket on
//! fd 3 and a private report channel on fd 4. It preloads its runtime
//! profile, then accepts invocations one at a time. A rejected or raised
//! invocation is answered and the booster keeps waiting; an accepted one
//! turns this very process into the application:
//!
//! ```text
//! invoker ──Invoke + stdio fds──▶ booster
//!                                   │ validate target, single-instance check
//!                                   ├──Handoff + invoker conn──▶ daemon
//!                                   ├──Accepted{pid}──▶ invoker
//!                                   └─ become the application (main or exec)
//! ```

pub mod fds;
pub mod loader;
pub mod types;

use crate::daemon::config::LauncherConfig;
use crate::daemon::protocol::{
    read_message, recv_fds, send_fds, write_message, Accepted, Handoff, InvocationRequest,
    Message, MessageId, Raised, Rejected, PROTOCOL_VERSION,
};
use crate::error::{ErrorClass, LauncherError};
use crate::single_instance::{Acquire, Activator, CommandActivator, InstanceLock, LockManager};
use anyhow::{bail, Context, Result};
use libloading::os::unix::Library;
use loader::MainFn;
use nix::sys::signal::Signal;
use nix::sys::stat::{fstat, SFlag};
use nix::unistd::getpid;
use std::ffi::{c_char, c_int, CString};
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::process;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use types::{BoosterType, EntryConvention, RuntimeProfile};

/// An invoker gets this long to deliver its request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit code when execve of the target fails
const EXEC_FAILED: i32 = 127;

/// How the application is entered once the booster commits
pub enum AppEntry {
    /// Call `main` of the loaded object in this process
    Main { library: Library, main: MainFn },
    /// Replace this process image
    Exec { path: CString },
}

/// Everything needed to become the application
pub struct Launch {
    pub request: InvocationRequest,
    pub stdio: Vec<OwnedFd>,
    pub entry: AppEntry,
    pub lock: Option<InstanceLock>,
    pub invoker: UnixStream,
    pub message_id: MessageId,
}

/// Result of serving one connection
pub enum Outcome {
    /// The request was accepted; the booster must become the application
    Launch(Box<Launch>),
    /// The invoker got its answer, keep accepting
    Answered,
}

/// A booster process
pub struct Booster<A: Activator = CommandActivator> {
    kind: BoosterType,
    profile: RuntimeProfile,
    listener: UnixListener,
    report: UnixStream,
    locks: LockManager,
    activator: A,
    preloaded: Vec<Library>,
}

impl Booster<CommandActivator> {
    /// Adopt the listener and report channel installed by the daemon
    pub fn from_inherited(kind: BoosterType, config: &LauncherConfig) -> Result<Self> {
        for fd in [fds::LISTENER_FD, fds::REPORT_FD] {
            let stat = fstat(fd).with_context(|| format!("fd {} is not open", fd))?;
            if SFlag::from_bits_truncate(stat.st_mode) & SFlag::S_IFMT != SFlag::S_IFSOCK {
                bail!("fd {} is not a socket; boosters are started by applauncherd", fd);
            }
            // Keep them away from activation commands
            nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC))?;
        }

        // SAFETY: both descriptors were checked above and nothing else owns them
        let listener = unsafe { UnixListener::from_raw_fd(fds::LISTENER_FD) };
        let report = unsafe { UnixStream::from_raw_fd(fds::REPORT_FD) };

        Ok(Self::new(
            kind,
            config.profile(kind),
            listener,
            report,
            LockManager::new(config.lock_dir()),
            CommandActivator::new(config.activate_command.as_deref()),
        ))
    }
}

impl<A: Activator> Booster<A> {
    pub fn new(
        kind: BoosterType,
        profile: RuntimeProfile,
        listener: UnixListener,
        report: UnixStream,
        locks: LockManager,
        activator: A,
    ) -> Self {
        Self {
            kind,
            profile,
            listener,
            report,
            locks,
            activator,
            preloaded: Vec::new(),
        }
    }

    pub fn kind(&self) -> BoosterType {
        self.kind
    }

    /// Load the profile's libraries. Boot mode skips this to keep boot fast.
    pub fn preload(&mut self, boot_mode: bool) {
        if boot_mode {
            debug!("Booster: boot mode, {} libraries not preloaded", self.profile.preload.len());
            return;
        }
        self.preloaded = loader::preload(&self.profile.preload);
    }

    /// Accept invocations until one is launched. Returns only on error.
    pub fn run(mut self) -> Result<()> {
        debug!("Booster: {} waiting for invocations", self.kind.process_name());

        loop {
            let conn = match self.listener.accept() {
                Ok((conn, _)) => conn,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Booster: accept failed"),
            };

            // A replacement request from the daemon must not hit a booster
            // halfway through becoming an application
            ignore_sigterm(true);
            match self.serve(conn) {
                Ok(Outcome::Launch(launch)) => self.launch(*launch),
                Ok(Outcome::Answered) => {}
                Err(e) => warn!("Booster: Dropped invocation: {}", e),
            }
            ignore_sigterm(false);
        }
    }

    /// Read one invocation and decide on it.
    ///
    /// Errors are transport failures where no answer can be given.
    pub fn serve(&mut self, mut conn: UnixStream) -> Result<Outcome, LauncherError> {
        conn.set_read_timeout(Some(REQUEST_TIMEOUT))?;

        let (message, message_id) = read_message(&mut conn)?;
        let Message::Invoke(request) = message else {
            let err = LauncherError::BadRequest("expected an invocation".to_string());
            reject(&mut conn, message_id, &err);
            return Ok(Outcome::Answered);
        };
        let stdio = recv_fds(&conn, 3)?;
        conn.set_read_timeout(None)?;

        if let Err(err) = self
            .check_request(&request, &stdio)
            .and_then(|()| self.validate_target(&request))
        {
            log_rejection(&err);
            reject(&mut conn, message_id, &err);
            return Ok(Outcome::Answered);
        }

        // Nothing of the target runs until this invocation is committed
        let lock = if request.single_instance {
            match self.locks.acquire(&request.target, getpid()) {
                Ok(Acquire::Granted(lock)) => Some(lock),
                Ok(Acquire::Held(owner)) => {
                    match self.activator.activate(owner, &request.target) {
                        Ok(()) => {
                            info!("Booster: Raised running instance {} of {}", owner, request.target);
                            answer(
                                &mut conn,
                                message_id,
                                &Message::Raised(Raised {
                                    owner_pid: owner.as_raw(),
                                }),
                            );
                        }
                        Err(_) => {
                            let err = LauncherError::CannotActivate;
                            log_rejection(&err);
                            reject(&mut conn, message_id, &err);
                        }
                    }
                    return Ok(Outcome::Answered);
                }
                Err(err) => {
                    log_rejection(&err);
                    reject(&mut conn, message_id, &err);
                    return Ok(Outcome::Answered);
                }
            }
        } else {
            None
        };

        let entry = match self.prepare(&request) {
            Ok(entry) => entry,
            Err(err) => {
                if let Some(lock) = lock {
                    if let Err(e) = self.locks.release(lock, getpid()) {
                        warn!("Booster: Releasing lock for {} failed: {}", request.target, e);
                    }
                }
                log_rejection(&err);
                reject(&mut conn, message_id, &err);
                return Ok(Outcome::Answered);
            }
        };

        Ok(Outcome::Launch(Box::new(Launch {
            request,
            stdio,
            entry,
            lock,
            invoker: conn,
            message_id,
        })))
    }

    fn check_request(
        &self,
        request: &InvocationRequest,
        stdio: &[OwnedFd],
    ) -> Result<(), LauncherError> {
        if request.version != PROTOCOL_VERSION {
            return Err(LauncherError::BadRequest(format!(
                "protocol version {} not supported (expected {})",
                request.version, PROTOCOL_VERSION
            )));
        }
        if request.booster_type != self.kind {
            return Err(LauncherError::BadRequest(format!(
                "type {} sent to {}",
                request.booster_type,
                self.kind.process_name()
            )));
        }
        if stdio.len() != 3 {
            return Err(LauncherError::BadRequest(format!(
                "expected 3 stdio descriptors, got {}",
                stdio.len()
            )));
        }
        if !Path::new(&request.target).is_absolute() {
            return Err(LauncherError::BadRequest(format!(
                "target {} is not an absolute path",
                request.target
            )));
        }
        Ok(())
    }

    /// Check the target on disk without loading or running any of it
    fn validate_target(&self, request: &InvocationRequest) -> Result<(), LauncherError> {
        let target = Path::new(&request.target);
        let meta = fs::metadata(target)
            .map_err(|e| LauncherError::LoadFailed(format!("{}: {}", target.display(), e)))?;

        match self.profile.entry {
            EntryConvention::Main if !meta.is_file() => Err(LauncherError::LoadFailed(format!(
                "{}: not a regular file",
                target.display()
            ))),
            EntryConvention::Exec if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 => {
                Err(LauncherError::NotExecutable(request.target.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Load the target for this booster's entry convention
    fn prepare(&self, request: &InvocationRequest) -> Result<AppEntry, LauncherError> {
        let target = Path::new(&request.target);

        match self.profile.entry {
            EntryConvention::Main => {
                let (library, main) = loader::load_main(target)?;
                Ok(AppEntry::Main { library, main })
            }
            EntryConvention::Exec => {
                let path = CString::new(target.as_os_str().as_bytes())
                    .map_err(|_| LauncherError::BadRequest("NUL byte in target".to_string()))?;
                Ok(AppEntry::Exec { path })
            }
        }
    }

    /// Commit to an accepted invocation: report, answer, become the application
    fn launch(self, launch: Launch) -> ! {
        let Launch {
            request,
            stdio,
            entry,
            lock,
            mut invoker,
            message_id,
        } = launch;
        let pid = getpid();

        if let Err(e) = self.report_handoff(&request, &invoker) {
            warn!("Booster: Daemon did not take the invoker connection: {}", e);
        }
        answer(
            &mut invoker,
            message_id,
            &Message::Accepted(Accepted { pid: pid.as_raw() }),
        );
        info!("Booster: Launching {} as pid {}", request.app_name, pid);

        if let Err(e) = prepare_process(&request, &stdio) {
            error!("Booster: Preparing {} failed: {}", request.app_name, e);
            process::exit(1);
        }

        // Hand every descriptor we own to the sweep below
        let Booster {
            listener,
            report,
            locks,
            preloaded,
            ..
        } = self;
        let _ = listener.into_raw_fd();
        let _ = report.into_raw_fd();
        let _ = invoker.into_raw_fd();
        for fd in stdio {
            let _ = fd.into_raw_fd();
        }
        // Preloaded objects stay mapped for the application
        std::mem::forget(preloaded);

        match entry {
            AppEntry::Main { library, main } => {
                let mut keep: Vec<RawFd> = lock.iter().map(|l| l.as_raw_fd()).collect();
                keep.extend(crate::logging::log_fd());
                fds::close_inherited(&keep);

                let code = call_main(main, &request.args);

                if let Some(lock) = lock {
                    let _ = locks.release(lock, pid);
                }
                std::mem::forget(library);
                process::exit(code);
            }
            AppEntry::Exec { path } => {
                let mut keep = Vec::new();
                if let Some(lock) = lock {
                    match lock.into_inherited_fd() {
                        Ok(fd) => keep.push(fd),
                        Err(e) => warn!("Booster: Single-instance lock not inherited: {}", e),
                    }
                }
                fds::close_inherited(&keep);

                let argv = c_strings(&request.args, &path);
                let envp: Vec<CString> = request
                    .env
                    .iter()
                    .filter_map(|(k, v)| CString::new(format!("{}={}", k, v)).ok())
                    .collect();

                let err = match nix::unistd::execve(&path, &argv, &envp) {
                    Err(e) => e,
                    Ok(never) => match never {},
                };
                eprintln!("Booster: Executing {} failed: {}", request.target, err);
                process::exit(EXEC_FAILED);
            }
        }
    }

    /// Tell the daemon this booster is consumed and pass it the invoker
    /// connection, so the exit status reaches the invoker even when the
    /// application leaves through `exit()`.
    fn report_handoff(&self, request: &InvocationRequest, invoker: &UnixStream) -> io::Result<()> {
        let handoff = Handoff {
            booster_type: self.kind,
            pid: getpid().as_raw(),
            app_name: request.app_name.clone(),
        };
        let mut report = &self.report;
        write_message(&mut report, &Message::Handoff(handoff), 0)?;
        send_fds(&self.report, &[invoker.as_raw_fd()])
    }
}

/// Turn the booster's process state into the invoker's
fn prepare_process(request: &InvocationRequest, stdio: &[OwnedFd]) -> io::Result<()> {
    // Applications outlive the daemon
    nix::sys::prctl::set_pdeathsig(None::<Signal>)?;

    // SAFETY: restores the default disposition the application expects
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_DFL) };
    ignore_sigterm(false);

    // SAFETY: plain syscall on this process
    if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, request.priority) } != 0 {
        debug!(
            "Booster: setpriority({}) failed: {}",
            request.priority,
            io::Error::last_os_error()
        );
    }

    if let Err(e) = std::env::set_current_dir(&request.working_dir) {
        warn!("Booster: Can't enter {}: {}", request.working_dir, e);
    }

    replace_environment(request);
    fds::redirect_stdio(stdio)?;
    set_process_name(app_basename(&request.app_name));
    Ok(())
}

fn ignore_sigterm(ignore: bool) {
    let handler = if ignore { libc::SIG_IGN } else { libc::SIG_DFL };
    // SAFETY: switches between the two built-in dispositions
    unsafe { libc::signal(libc::SIGTERM, handler) };
}

fn replace_environment(request: &InvocationRequest) {
    // The booster is single-threaded at this point
    for (key, _) in std::env::vars_os() {
        std::env::remove_var(key);
    }
    for (key, value) in &request.env {
        if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
            continue;
        }
        std::env::set_var(key, value);
    }
}

fn app_basename(app_name: &str) -> &str {
    app_name.rsplit('/').next().unwrap_or(app_name)
}

/// Rename this process as shown by `ps` and `pgrep`
pub fn set_process_name(name: &str) {
    if let Ok(name) = CString::new(name) {
        if let Err(e) = nix::sys::prctl::set_name(&name) {
            debug!("Booster: prctl(PR_SET_NAME) failed: {}", e);
        }
    }
}

fn c_strings(args: &[String], fallback: &CString) -> Vec<CString> {
    let mut argv: Vec<CString> = args
        .iter()
        .filter_map(|a| CString::new(a.as_str()).ok())
        .collect();
    if argv.is_empty() {
        argv.push(fallback.clone());
    }
    argv
}

/// Call the application's `main` with a C argv
fn call_main(main: MainFn, args: &[String]) -> i32 {
    let fallback = CString::default();
    let c_args = c_strings(args, &fallback);
    let mut argv: Vec<*mut c_char> = c_args.iter().map(|a| a.as_ptr() as *mut c_char).collect();
    argv.push(std::ptr::null_mut());

    // SAFETY: argv is NULL-terminated and outlives the call; the strings are
    // leaked below because applications may keep argv pointers
    let code = unsafe { main(c_args.len() as c_int, argv.as_mut_ptr()) };
    std::mem::forget(c_args);
    std::mem::forget(argv);
    code
}

fn answer(conn: &mut UnixStream, message_id: MessageId, message: &Message) {
    if let Err(e) = write_message(conn, message, message_id) {
        debug!("Booster: Invoker went away before the answer: {}", e);
    }
}

/// Lost races are routine; everything else is worth an error line
fn log_rejection(err: &LauncherError) {
    match err.class() {
        ErrorClass::TransientBusy => warn!("Booster: {}", err),
        _ => error!("Booster: {}", err),
    }
}

fn reject(conn: &mut UnixStream, message_id: MessageId, err: &LauncherError) {
    let rejected = Rejected {
        reason: err.reject_reason(),
        message: err.to_string(),
    };
    answer(conn, message_id, &Message::Rejected(rejected));
}

/// Entry point of a booster process (`applauncherd --booster=<tag>`)
pub fn main(kind: BoosterType, config: &LauncherConfig, boot_mode: bool) -> Result<()> {
    set_process_name(&kind.process_name());

    let mut booster = Booster::from_inherited(kind, config)?;
    booster.preload(boot_mode);
    booster.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectReason;
    use nix::unistd::Pid;
    use std::collections::HashMap;
    use std::fs::File;
    use std::thread;

    struct FixedActivator(bool);

    impl Activator for FixedActivator {
        fn activate(&self, _owner: Pid, _identity: &str) -> Result<(), LauncherError> {
            if self.0 {
                Ok(())
            } else {
                Err(LauncherError::CannotActivate)
            }
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        booster: Booster<FixedActivator>,
        _daemon_end: UnixStream,
    }

    fn fixture(entry: EntryConvention, raise: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("booster-e")).unwrap();
        let (report, daemon_end) = UnixStream::pair().unwrap();
        let profile = RuntimeProfile {
            kind: BoosterType::E,
            preload: Vec::new(),
            entry,
        };
        let booster = Booster::new(
            BoosterType::E,
            profile,
            listener,
            report,
            LockManager::new(dir.path().join("locks")),
            FixedActivator(raise),
        );
        Fixture {
            dir,
            booster,
            _daemon_end: daemon_end,
        }
    }

    fn request(target: &str, single_instance: bool) -> InvocationRequest {
        InvocationRequest {
            version: PROTOCOL_VERSION,
            app_name: Path::new(target)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            target: target.to_string(),
            args: vec![target.to_string()],
            env: HashMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
            working_dir: "/".to_string(),
            priority: 0,
            single_instance,
            booster_type: BoosterType::E,
        }
    }

    /// Send one request; returns the answer unless the booster launched
    fn invoke(fixture: &mut Fixture, message: Message) -> (Option<Message>, Option<Box<Launch>>) {
        let path = fixture.dir.path().join("booster-e");
        let client = thread::spawn(move || {
            let mut conn = UnixStream::connect(path).unwrap();
            write_message(&mut conn, &message, 9).unwrap();
            let null: Vec<File> = (0..3).map(|_| File::open("/dev/null").unwrap()).collect();
            let raw: Vec<RawFd> = null.iter().map(|f| f.as_raw_fd()).collect();
            send_fds(&conn, &raw).unwrap();
            conn.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
            read_message(&mut conn).ok().map(|(reply, id)| {
                assert_eq!(id, 9);
                reply
            })
        });

        let (conn, _) = fixture.booster.listener.accept().unwrap();
        let outcome = fixture.booster.serve(conn).unwrap();
        let launch = match outcome {
            Outcome::Launch(launch) => Some(launch),
            Outcome::Answered => None,
        };
        (client.join().unwrap(), launch)
    }

    fn rejection(reply: Option<Message>) -> Rejected {
        match reply {
            Some(Message::Rejected(rejected)) => rejected,
            other => panic!("expected a rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_target_is_rejected() {
        let mut f = fixture(EntryConvention::Exec, true);
        let (reply, launch) = invoke(&mut f, Message::Invoke(request("/nonexistent/app", false)));

        assert!(launch.is_none());
        let rejected = rejection(reply);
        assert_eq!(rejected.reason, RejectReason::LoadFailed);
        assert!(rejected.message.starts_with("Loading invoked application failed:"));
    }

    #[test]
    fn test_non_executable_target_is_rejected() {
        let mut f = fixture(EntryConvention::Exec, true);
        let plain = f.dir.path().join("notes.txt");
        fs::write(&plain, "not a program").unwrap();

        let (reply, _) = invoke(
            &mut f,
            Message::Invoke(request(plain.to_str().unwrap(), false)),
        );
        assert_eq!(rejection(reply).reason, RejectReason::LoadFailed);
    }

    #[test]
    fn test_main_convention_rejects_unloadable_target() {
        let mut f = fixture(EntryConvention::Main, true);
        let (reply, _) = invoke(&mut f, Message::Invoke(request("/nonexistent/libapp.so", false)));
        assert_eq!(rejection(reply).reason, RejectReason::LoadFailed);
    }

    /// A regular file that `dlopen` refuses
    fn not_a_library(f: &Fixture) -> String {
        let path = f.dir.path().join("libapp.so");
        fs::write(&path, "not an ELF object").unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn test_running_instance_is_raised_without_loading_target() {
        let mut f = fixture(EntryConvention::Main, true);
        let target = not_a_library(&f);
        let locks = LockManager::new(f.dir.path().join("locks"));
        let _held = locks.acquire(&target, getpid()).unwrap();

        // Loading first would have rejected this with LoadFailed
        let (reply, launch) = invoke(&mut f, Message::Invoke(request(&target, true)));
        assert!(launch.is_none());
        match reply {
            Some(Message::Raised(raised)) => assert_eq!(raised.owner_pid, getpid().as_raw()),
            other => panic!("expected Raised, got {:?}", other),
        }
    }

    #[test]
    fn test_unloadable_single_instance_target_releases_lock() {
        let mut f = fixture(EntryConvention::Main, true);
        let target = not_a_library(&f);

        let (reply, launch) = invoke(&mut f, Message::Invoke(request(&target, true)));
        assert!(launch.is_none());
        let rejected = rejection(reply);
        assert_eq!(rejected.reason, RejectReason::LoadFailed);
        assert!(rejected.message.starts_with("Loading invoked application failed:"));

        let locks = LockManager::new(f.dir.path().join("locks"));
        assert!(matches!(locks.acquire(&target, getpid()).unwrap(), Acquire::Granted(_)));
    }

    #[test]
    fn test_main_convention_rejects_directory_before_locking() {
        let mut f = fixture(EntryConvention::Main, true);
        let target = f.dir.path().to_str().unwrap().to_string();

        let (reply, _) = invoke(&mut f, Message::Invoke(request(&target, true)));
        assert_eq!(rejection(reply).reason, RejectReason::LoadFailed);
        assert!(!f.dir.path().join("locks").exists());
    }

    #[test]
    fn test_wrong_type_and_message_are_bad_requests() {
        let mut f = fixture(EntryConvention::Exec, true);

        let mut wrong_type = request("/bin/sh", false);
        wrong_type.booster_type = BoosterType::M;
        let (reply, _) = invoke(&mut f, Message::Invoke(wrong_type));
        assert_eq!(rejection(reply).reason, RejectReason::BadRequest);

        let mut old = request("/bin/sh", false);
        old.version = PROTOCOL_VERSION + 1;
        let (reply, _) = invoke(&mut f, Message::Invoke(old));
        assert_eq!(rejection(reply).reason, RejectReason::BadRequest);
    }

    #[test]
    fn test_booster_keeps_serving_after_rejection() {
        let mut f = fixture(EntryConvention::Exec, true);
        let (first, _) = invoke(&mut f, Message::Invoke(request("/nonexistent/a", false)));
        rejection(first);

        let (_, launch) = invoke(&mut f, Message::Invoke(request("/bin/sh", false)));
        assert!(launch.is_some());
    }

    #[test]
    fn test_valid_request_launches() {
        let mut f = fixture(EntryConvention::Exec, true);
        let (_, launch) = invoke(&mut f, Message::Invoke(request("/bin/sh", false)));

        let launch = launch.expect("request should launch");
        assert_eq!(launch.request.app_name, "sh");
        assert_eq!(launch.stdio.len(), 3);
        assert!(launch.lock.is_none());
        assert!(matches!(launch.entry, AppEntry::Exec { .. }));
    }

    #[test]
    fn test_single_instance_launch_holds_lock() {
        let mut f = fixture(EntryConvention::Exec, true);
        let (_, launch) = invoke(&mut f, Message::Invoke(request("/bin/sh", true)));

        let launch = *launch.unwrap();
        let lock = launch.lock.expect("lock should be granted");
        assert_eq!(lock.identity(), "/bin/sh");
        assert_eq!(lock.entry().pid, getpid().as_raw());
    }

    #[test]
    fn test_running_instance_is_raised() {
        let mut f = fixture(EntryConvention::Exec, true);
        let locks = LockManager::new(f.dir.path().join("locks"));
        let _held = locks.acquire("/bin/sh", getpid()).unwrap();

        let (reply, launch) = invoke(&mut f, Message::Invoke(request("/bin/sh", true)));
        assert!(launch.is_none());
        match reply {
            Some(Message::Raised(raised)) => assert_eq!(raised.owner_pid, getpid().as_raw()),
            other => panic!("expected Raised, got {:?}", other),
        }
    }

    #[test]
    fn test_unraisable_instance_is_rejected() {
        let mut f = fixture(EntryConvention::Exec, false);
        let locks = LockManager::new(f.dir.path().join("locks"));
        let _held = locks.acquire("/bin/sh", getpid()).unwrap();

        let (reply, _) = invoke(&mut f, Message::Invoke(request("/bin/sh", true)));
        let rejected = rejection(reply);
        assert_eq!(rejected.reason, RejectReason::CannotActivate);
        assert_eq!(
            rejected.message,
            "Can't activate existing instance of the application!"
        );
    }

    #[test]
    fn test_app_basename() {
        assert_eq!(app_basename("/usr/bin/fala_ft_hello"), "fala_ft_hello");
        assert_eq!(app_basename("fala_ft_hello"), "fala_ft_hello");
    }

    #[test]
    fn test_c_strings_fall_back_to_path() {
        let path = CString::new("/bin/true").unwrap();
        assert_eq!(c_strings(&[], &path), vec![path.clone()]);
        assert_eq!(
            c_strings(&["a".to_string(), "b".to_string()], &path).len(),
            2
        );
    }
}
