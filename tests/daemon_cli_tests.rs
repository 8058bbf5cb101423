use std::fs;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn applauncherd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_applauncherd"))
}

#[test]
fn test_help_prints_usage() {
    let output = applauncherd().arg("--help").output().unwrap();

    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("Usage: applauncherd [options]"));
    assert!(stdout.contains("--boot-mode"));
}

#[test]
fn test_missing_display_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("applauncherd.conf");
    fs::write(
        &config,
        format!("LAUNCHER_SOCKET_DIR=\"{}\"\n", dir.path().join("sockets").display()),
    )
    .unwrap();

    let output = applauncherd()
        .arg("--config")
        .arg(&config)
        .env_remove("DISPLAY")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("DISPLAY environment variable not set."));
    // Nothing was started
    assert!(!dir.path().join("sockets").exists());
}

#[test]
fn test_unknown_option() {
    let output = applauncherd().arg("--frobnicate").env("DISPLAY", ":0").output().unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown option"));
}

#[test]
fn test_second_instance_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let sockets = dir.path().join("sockets");
    let config = dir.path().join("applauncherd.conf");
    fs::write(
        &config,
        format!(
            "LAUNCHER_SOCKET_DIR=\"{}\"\nLAUNCHER_NORMAL_TYPES=\"e\"\n",
            sockets.display()
        ),
    )
    .unwrap();

    let mut first = applauncherd()
        .arg("--config")
        .arg(&config)
        .arg("--quiet")
        .env("DISPLAY", ":0")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let marker = sockets.join("applauncherd.lock");
    let deadline = Instant::now() + Duration::from_secs(5);
    while fs::read_to_string(&marker).map_or(true, |s| s.trim().is_empty()) {
        assert!(Instant::now() < deadline, "daemon did not start");
        thread::sleep(Duration::from_millis(20));
    }

    let second = applauncherd()
        .arg("--config")
        .arg(&config)
        .env("DISPLAY", ":0")
        .output()
        .unwrap();

    assert_eq!(second.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&second.stderr);
    assert!(stderr.contains("already running"), "stderr: {}", stderr);
    assert!(stderr.contains(&first.id().to_string()));

    unsafe {
        libc::kill(first.id() as i32, libc::SIGTERM);
    }
    let status = first.wait().unwrap();
    assert_eq!(status.code(), Some(0));
    assert!(!marker.exists());
}

fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_quiet_still_writes_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("applauncherd.conf");
    let log = dir.path().join("applauncherd.log");
    fs::write(
        &config,
        format!(
            "LAUNCHER_SOCKET_DIR=\"{}\"\nLAUNCHER_NORMAL_TYPES=\"e\"\nLAUNCHER_LOG_FILE=\"{}\"\n",
            dir.path().join("sockets").display(),
            log.display()
        ),
    )
    .unwrap();

    let mut daemon = applauncherd()
        .arg("--config")
        .arg(&config)
        .arg("--quiet")
        .env("DISPLAY", ":0")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    wait_for("start line", || {
        fs::read_to_string(&log).map_or(false, |s| s.contains("Daemon: Started in normal mode."))
    });

    unsafe {
        libc::kill(daemon.id() as i32, libc::SIGTERM);
    }
    let output = daemon.wait_with_output().unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert!(fs::read_to_string(&log).unwrap().contains("Daemon: Shutting down."));
    // The console stays silent
    assert!(output.stderr.is_empty(), "{}", String::from_utf8_lossy(&output.stderr));
}

#[test]
fn test_daemonized_with_relative_config() {
    let dir = tempfile::tempdir().unwrap();
    let sockets = dir.path().join("sockets");
    let log = dir.path().join("applauncherd.log");
    fs::write(
        dir.path().join("applauncherd.conf"),
        format!(
            "LAUNCHER_SOCKET_DIR=\"{}\"\nLAUNCHER_NORMAL_TYPES=\"e\"\nLAUNCHER_LOG_FILE=\"{}\"\n",
            sockets.display(),
            log.display()
        ),
    )
    .unwrap();

    let status = applauncherd()
        .args(["--daemon", "--debug", "--config", "applauncherd.conf"])
        .current_dir(dir.path())
        .env("DISPLAY", ":0")
        .env_remove("APPLAUNCHERD_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));

    let marker = sockets.join("applauncherd.lock");
    let mut pid = 0;
    wait_for("pid marker", || {
        pid = fs::read_to_string(&marker)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        pid > 0
    });

    // Boosters start from "/" and reread the file the daemon was given
    wait_for("booster log line", || {
        fs::read_to_string(&log).map_or(false, |s| s.contains("booster-e waiting for invocations"))
    });

    // SIGHUP rereads it too
    unsafe {
        libc::kill(pid, libc::SIGHUP);
    }
    wait_for("restart", || {
        fs::read_to_string(&log).map_or(false, |s| {
            s.matches("booster-e waiting for invocations").count() >= 2
        })
    });
    assert!(!fs::read_to_string(&log).unwrap().contains("Socket directory change"));

    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    wait_for("shutdown", || !marker.exists());
}
