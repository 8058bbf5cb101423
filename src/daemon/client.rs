//! Invoker client
//!
//! Thin client that asks a booster to become an application and relays the
//! application's exit status as its own.

use crate::booster::types::BoosterType;
use crate::daemon::config::LauncherConfig;
use crate::daemon::protocol::{
    read_message, send_fds, write_message, ExitStatus, InvocationRequest, Message, Rejected,
    PROTOCOL_VERSION,
};
use crate::error::LauncherError;
use std::collections::HashMap;
use std::env;
use std::ffi::OsStr;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Test-mode exit code: an existing instance was raised
pub const EXIT_RAISED: i32 = 250;

/// Test-mode exit code: no booster could be reached
pub const EXIT_CONNECT_FAILED: i32 = 251;

/// Test-mode exit code: malformed or unexpected reply
pub const EXIT_PROTOCOL_ERROR: i32 = 252;

/// Test-mode exit code: the launcher vanished before the exit status arrived
pub const EXIT_LAUNCHER_GONE: i32 = 253;

/// Pause between connection attempts
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Parsed invoker command line
#[derive(Debug, Clone, PartialEq)]
pub struct InvokerOptions {
    pub booster_type: BoosterType,
    pub single_instance: bool,
    pub test_mode: bool,
    /// Extra connection attempts after the first
    pub retries: u32,
    /// Wait for the application's exit status
    pub wait: bool,
    /// Sleep before exiting
    pub delay: Duration,
    pub app: String,
    pub args: Vec<String>,
}

/// What the command line asks for
#[derive(Debug, Clone, PartialEq)]
pub enum InvokerCommand {
    Help,
    Invoke(InvokerOptions),
}

/// How an invocation ended, from the invoker's point of view
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    /// The application ran and finished
    Exited(ExitStatus),
    /// Launched, not waited for (`--no-wait`)
    Launched(i32),
    /// A running single instance was raised
    Raised(i32),
    Rejected(Rejected),
    ConnectFailed,
    ProtocolError(String),
    /// Accepted, but the connection closed before an exit status
    LauncherGone,
}

impl InvocationOutcome {
    /// The invoker's own exit code
    pub fn exit_code(&self, test_mode: bool) -> i32 {
        match self {
            InvocationOutcome::Exited(status) => status.exit_code(),
            InvocationOutcome::Launched(_) => 0,
            InvocationOutcome::Raised(_) => {
                if test_mode {
                    EXIT_RAISED
                } else {
                    0
                }
            }
            InvocationOutcome::Rejected(rejected) => {
                if test_mode {
                    rejected.reason.test_mode_exit_code()
                } else {
                    1
                }
            }
            InvocationOutcome::ConnectFailed => {
                if test_mode {
                    EXIT_CONNECT_FAILED
                } else {
                    1
                }
            }
            InvocationOutcome::ProtocolError(_) => {
                if test_mode {
                    EXIT_PROTOCOL_ERROR
                } else {
                    1
                }
            }
            InvocationOutcome::LauncherGone => {
                if test_mode {
                    EXIT_LAUNCHER_GONE
                } else {
                    0
                }
            }
        }
    }
}

fn option_value(
    name: &str,
    inline: Option<&str>,
    rest: &mut std::slice::Iter<'_, String>,
) -> Result<String, String> {
    match inline {
        Some(value) => Ok(value.to_string()),
        None => rest
            .next()
            .cloned()
            .ok_or_else(|| format!("{} needs a value", name)),
    }
}

/// Parse `invoker [options] --type=<tag> <application> [args...]`
/// (arguments without the program name)
pub fn parse_args(args: &[String]) -> Result<InvokerCommand, String> {
    let mut booster_type = None;
    let mut single_instance = false;
    let mut test_mode = false;
    let mut retries = 0;
    let mut wait = true;
    let mut delay = Duration::ZERO;

    let mut iter = args.iter();
    let mut app = None;

    while let Some(arg) = iter.next() {
        let (name, inline) = match arg.split_once('=') {
            Some((name, value)) if name.starts_with("--") => (name, Some(value)),
            _ => (arg.as_str(), None),
        };

        match name {
            "-h" | "--help" => return Ok(InvokerCommand::Help),
            "--type" | "-t" => {
                let tag = option_value(name, inline, &mut iter)?;
                booster_type = Some(tag.parse::<BoosterType>().map_err(|e| e.to_string())?);
            }
            "--single-instance" | "-s" => single_instance = true,
            "--test-mode" => test_mode = true,
            "--no-wait" | "-n" => wait = false,
            "--retry" | "-r" => {
                let value = option_value(name, inline, &mut iter)?;
                retries = value
                    .parse()
                    .map_err(|_| format!("invalid retry count '{}'", value))?;
            }
            "--delay" | "-d" => {
                let value = option_value(name, inline, &mut iter)?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("invalid delay '{}'", value))?;
                delay = Duration::from_secs(secs);
            }
            "--" => {
                app = iter.next().cloned();
                break;
            }
            _ if arg.starts_with('-') && arg.len() > 1 => {
                return Err(format!("unknown option '{}'", arg));
            }
            _ => {
                app = Some(arg.clone());
                break;
            }
        }
    }

    let booster_type = booster_type.ok_or("--type=<tag> is required")?;
    let app = app.ok_or("no application to invoke")?;

    Ok(InvokerCommand::Invoke(InvokerOptions {
        booster_type,
        single_instance,
        test_mode,
        retries,
        wait,
        delay,
        app,
        args: iter.cloned().collect(),
    }))
}

fn is_executable_file(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolve the application: names without `/` are searched in `path_var`,
/// the result is canonicalized
pub fn resolve_target(app: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let candidate = if app.contains('/') {
        PathBuf::from(app)
    } else {
        env::split_paths(path_var?)
            .map(|dir| dir.join(app))
            .find(|path| is_executable_file(path))?
    };

    let canonical = candidate.canonicalize().ok()?;
    canonical.is_file().then_some(canonical)
}

/// Assemble the request for the current process context
pub fn build_request(options: &InvokerOptions) -> Result<InvocationRequest, LauncherError> {
    let target = resolve_target(&options.app, env::var_os("PATH").as_deref())
        .ok_or_else(|| LauncherError::LoadFailed(options.app.clone()))?;

    let mut args = Vec::with_capacity(options.args.len() + 1);
    args.push(options.app.clone());
    args.extend(options.args.iter().cloned());

    // Non UTF-8 variables cannot cross the wire
    let env: HashMap<String, String> = env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect();

    let working_dir = env::current_dir()?.to_string_lossy().into_owned();

    // SAFETY: plain syscall on this process
    let priority = unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) };

    Ok(InvocationRequest {
        version: PROTOCOL_VERSION,
        app_name: options.app.clone(),
        target: target.to_string_lossy().into_owned(),
        args,
        env,
        working_dir,
        priority,
        single_instance: options.single_instance,
        booster_type: options.booster_type,
    })
}

/// Why one attempt failed
enum AttemptError {
    /// Worth another try: no booster listening, or it closed on us
    Retry(io::Error),
    Fatal(InvocationOutcome),
}

/// Client side of the booster sockets
pub struct InvokerClient {
    socket_dir: PathBuf,
    reply_timeout: Duration,
    retry_interval: Duration,
    message_id: u32,
}

impl InvokerClient {
    pub fn new(config: &LauncherConfig) -> Self {
        Self::with_socket_dir(config.socket_dir.clone(), config.invoker_timeout)
    }

    pub fn with_socket_dir(socket_dir: PathBuf, reply_timeout: Duration) -> Self {
        Self {
            socket_dir,
            reply_timeout,
            retry_interval: RETRY_INTERVAL,
            message_id: 0,
        }
    }

    /// Shorten the pause between attempts
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Socket of a booster type
    pub fn socket_path(&self, kind: BoosterType) -> PathBuf {
        self.socket_dir.join(kind.process_name())
    }

    /// Send the request (with our stdio) and follow it to the end
    pub fn invoke(&mut self, options: &InvokerOptions, request: &InvocationRequest) -> InvocationOutcome {
        let mut attempt = 0;
        loop {
            match self.attempt(options, request) {
                Ok(outcome) => return outcome,
                Err(AttemptError::Fatal(outcome)) => return outcome,
                Err(AttemptError::Retry(e)) => {
                    debug!("invoker: attempt {} failed: {}", attempt + 1, e);
                    if attempt >= options.retries {
                        return InvocationOutcome::ConnectFailed;
                    }
                    attempt += 1;
                    thread::sleep(self.retry_interval);
                }
            }
        }
    }

    fn attempt(
        &mut self,
        options: &InvokerOptions,
        request: &InvocationRequest,
    ) -> Result<InvocationOutcome, AttemptError> {
        let mut stream =
            UnixStream::connect(self.socket_path(options.booster_type)).map_err(AttemptError::Retry)?;

        let message_id = self.next_message_id();
        write_message(&mut stream, &Message::Invoke(request.clone()), message_id)
            .map_err(AttemptError::Retry)?;
        send_fds(&stream, &[0, 1, 2]).map_err(AttemptError::Retry)?;

        stream
            .set_read_timeout(Some(self.reply_timeout))
            .map_err(AttemptError::Retry)?;
        let reply = match read_message(&mut stream) {
            Ok((reply, _)) => reply,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(AttemptError::Retry(e)),
            Err(e) => {
                return Err(AttemptError::Fatal(InvocationOutcome::ProtocolError(
                    e.to_string(),
                )))
            }
        };

        match reply {
            Message::Accepted(accepted) if !options.wait => Ok(InvocationOutcome::Launched(accepted.pid)),
            Message::Accepted(accepted) => {
                debug!("invoker: {} running as pid {}", request.app_name, accepted.pid);
                Ok(self.wait_for_exit(stream))
            }
            Message::Raised(raised) => Ok(InvocationOutcome::Raised(raised.owner_pid)),
            Message::Rejected(rejected) => Ok(InvocationOutcome::Rejected(rejected)),
            other => Ok(InvocationOutcome::ProtocolError(format!(
                "unexpected reply {:?}",
                other
            ))),
        }
    }

    /// Block until the daemon relays the exit status
    fn wait_for_exit(&self, mut stream: UnixStream) -> InvocationOutcome {
        if let Err(e) = stream.set_read_timeout(None) {
            return InvocationOutcome::ProtocolError(e.to_string());
        }
        match read_message(&mut stream) {
            Ok((Message::ExitStatus(status), _)) => InvocationOutcome::Exited(status),
            Ok((other, _)) => {
                InvocationOutcome::ProtocolError(format!("unexpected message {:?}", other))
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => InvocationOutcome::LauncherGone,
            Err(e) => InvocationOutcome::ProtocolError(e.to_string()),
        }
    }

    fn next_message_id(&mut self) -> u32 {
        let id = self.message_id;
        self.message_id = self.message_id.wrapping_add(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::{recv_fds, Accepted, Raised};
    use crate::error::RejectReason;
    use std::fs;
    use std::os::unix::net::UnixListener;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn options(kind: BoosterType) -> InvokerOptions {
        InvokerOptions {
            booster_type: kind,
            single_instance: false,
            test_mode: true,
            retries: 0,
            wait: true,
            delay: Duration::ZERO,
            app: "/bin/true".to_string(),
            args: Vec::new(),
        }
    }

    fn request(kind: BoosterType) -> InvocationRequest {
        InvocationRequest {
            version: PROTOCOL_VERSION,
            app_name: "true".to_string(),
            target: "/bin/true".to_string(),
            args: vec!["true".to_string()],
            env: HashMap::new(),
            working_dir: "/".to_string(),
            priority: 0,
            single_instance: false,
            booster_type: kind,
        }
    }

    /// Fake booster answering one invocation with `replies`, then closing
    fn fake_booster(dir: &Path, kind: BoosterType, replies: Vec<Message>) -> thread::JoinHandle<()> {
        let listener = UnixListener::bind(dir.join(kind.process_name())).unwrap();
        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let (message, id) = read_message(&mut conn).unwrap();
            assert!(matches!(message, Message::Invoke(_)));
            assert_eq!(recv_fds(&conn, 3).unwrap().len(), 3);
            for reply in replies {
                write_message(&mut conn, &reply, id).unwrap();
            }
        })
    }

    fn run(replies: Vec<Message>, wait: bool) -> InvocationOutcome {
        let dir = tempfile::tempdir().unwrap();
        let booster = fake_booster(dir.path(), BoosterType::Q, replies);
        let mut client = InvokerClient::with_socket_dir(dir.path().to_path_buf(), Duration::from_secs(5));
        let mut opts = options(BoosterType::Q);
        opts.wait = wait;
        let outcome = client.invoke(&opts, &request(BoosterType::Q));
        booster.join().unwrap();
        outcome
    }

    #[test]
    fn test_parse_full_command_line() {
        let parsed = parse_args(&args(&[
            "--type=m",
            "--single-instance",
            "--test-mode",
            "-r",
            "3",
            "--delay=2",
            "fala_multi-instance",
            "--app-flag",
            "x",
        ]))
        .unwrap();

        let InvokerCommand::Invoke(opts) = parsed else {
            panic!("expected an invocation");
        };
        assert_eq!(opts.booster_type, BoosterType::M);
        assert!(opts.single_instance);
        assert!(opts.test_mode);
        assert_eq!(opts.retries, 3);
        assert!(opts.wait);
        assert_eq!(opts.delay, Duration::from_secs(2));
        assert_eq!(opts.app, "fala_multi-instance");
        assert_eq!(opts.args, args(&["--app-flag", "x"]));
    }

    #[test]
    fn test_parse_short_forms_and_alias() {
        let InvokerCommand::Invoke(opts) =
            parse_args(&args(&["--type", "qt", "-n", "--", "-app"])).unwrap()
        else {
            panic!("expected an invocation");
        };
        assert_eq!(opts.booster_type, BoosterType::Q);
        assert!(!opts.wait);
        assert_eq!(opts.app, "-app");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_args(&args(&["--help"])).unwrap(), InvokerCommand::Help);
        assert!(parse_args(&args(&["app"])).unwrap_err().contains("--type"));
        assert!(parse_args(&args(&["--type=m"])).is_err());
        assert!(parse_args(&args(&["--type=m", "--bogus", "app"])).is_err());
        assert!(parse_args(&args(&["--type=m", "-r", "many", "app"])).is_err());
        assert!(parse_args(&args(&["--type=M", "app"])).is_err());
        assert!(parse_args(&args(&["--type=m", "--retry"])).is_err());
    }

    #[test]
    fn test_exit_codes() {
        let exited = InvocationOutcome::Exited(ExitStatus { code: 42, signal: None });
        assert_eq!(exited.exit_code(false), 42);
        assert_eq!(exited.exit_code(true), 42);

        let raised = InvocationOutcome::Raised(10);
        assert_eq!(raised.exit_code(true), EXIT_RAISED);
        assert_eq!(raised.exit_code(false), 0);

        let rejected = InvocationOutcome::Rejected(Rejected {
            reason: RejectReason::SymbolMissing,
            message: String::new(),
        });
        assert_eq!(rejected.exit_code(true), 3);
        assert_eq!(rejected.exit_code(false), 1);

        assert_eq!(InvocationOutcome::ConnectFailed.exit_code(true), 251);
        assert_eq!(InvocationOutcome::ProtocolError(String::new()).exit_code(true), 252);
        assert_eq!(InvocationOutcome::LauncherGone.exit_code(true), 253);
        assert_eq!(InvocationOutcome::LauncherGone.exit_code(false), 0);
        assert_eq!(InvocationOutcome::Launched(5).exit_code(true), 0);
    }

    #[test]
    fn test_resolve_target_searches_path() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("fala_ft_hello");
        fs::write(&app, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&app, fs::Permissions::from_mode(0o755)).unwrap();
        let data = dir.path().join("data.txt");
        fs::write(&data, "x").unwrap();

        let path_var = env::join_paths(["/nonexistent", dir.path().to_str().unwrap()]).unwrap();
        assert_eq!(
            resolve_target("fala_ft_hello", Some(path_var.as_os_str())),
            Some(app.canonicalize().unwrap())
        );
        assert_eq!(resolve_target("data.txt", Some(path_var.as_os_str())), None);
        assert_eq!(resolve_target("missing", Some(path_var.as_os_str())), None);
        assert_eq!(resolve_target("missing", None), None);
        assert_eq!(
            resolve_target(app.to_str().unwrap(), None),
            Some(app.canonicalize().unwrap())
        );
    }

    #[test]
    fn test_exit_status_is_relayed() {
        let outcome = run(
            vec![
                Message::Accepted(Accepted { pid: 4321 }),
                Message::ExitStatus(ExitStatus { code: 7, signal: None }),
            ],
            true,
        );
        assert_eq!(outcome, InvocationOutcome::Exited(ExitStatus { code: 7, signal: None }));
    }

    #[test]
    fn test_no_wait_returns_after_accept() {
        let outcome = run(vec![Message::Accepted(Accepted { pid: 4321 })], false);
        assert_eq!(outcome, InvocationOutcome::Launched(4321));
    }

    #[test]
    fn test_launcher_gone_after_accept() {
        let outcome = run(vec![Message::Accepted(Accepted { pid: 4321 })], true);
        assert_eq!(outcome, InvocationOutcome::LauncherGone);
    }

    #[test]
    fn test_raised_and_rejected_replies() {
        let raised = run(vec![Message::Raised(Raised { owner_pid: 99 })], true);
        assert_eq!(raised, InvocationOutcome::Raised(99));

        let rejected = run(
            vec![Message::Rejected(Rejected {
                reason: RejectReason::CannotActivate,
                message: "Can't activate existing instance of the application!".into(),
            })],
            true,
        );
        assert_eq!(rejected.exit_code(true), 1);
    }

    #[test]
    fn test_unexpected_reply_is_protocol_error() {
        let outcome = run(vec![Message::ExitStatus(ExitStatus { code: 0, signal: None })], true);
        assert!(matches!(outcome, InvocationOutcome::ProtocolError(_)));
    }

    #[test]
    fn test_connect_failure_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = InvokerClient::with_socket_dir(dir.path().to_path_buf(), Duration::from_secs(1))
            .retry_interval(Duration::from_millis(10));
        let mut opts = options(BoosterType::D);
        opts.retries = 2;

        let outcome = client.invoke(&opts, &request(BoosterType::D));
        assert_eq!(outcome, InvocationOutcome::ConnectFailed);
        assert_eq!(outcome.exit_code(true), EXIT_CONNECT_FAILED);
    }
}
