//! Descriptor plumbing between daemon, booster and application

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Booster's listening socket, installed by the daemon at spawn
pub const LISTENER_FD: RawFd = 3;

/// Booster's report channel to the daemon
pub const REPORT_FD: RawFd = 4;

/// Temporaries are parked above this while the fixed slots are filled
const PARK_FD_MIN: RawFd = 10;

/// Scan limit when /proc is not mounted
const FALLBACK_FD_LIMIT: RawFd = 1024;

/// Move the listener and report channel to their fixed slots.
///
/// Runs between fork and exec, so it sticks to raw syscalls. The inputs are
/// parked above [`PARK_FD_MIN`] first because either may already sit on 3
/// or 4. `dup2` leaves the installed copies without close-on-exec.
pub fn install_inherited(listener: RawFd, report: RawFd) -> io::Result<()> {
    // SAFETY: plain descriptor syscalls on descriptors owned by this process
    unsafe {
        let parked_listener = libc::fcntl(listener, libc::F_DUPFD_CLOEXEC, PARK_FD_MIN);
        if parked_listener < 0 {
            return Err(io::Error::last_os_error());
        }
        let parked_report = libc::fcntl(report, libc::F_DUPFD_CLOEXEC, PARK_FD_MIN);
        if parked_report < 0 {
            return Err(io::Error::last_os_error());
        }

        if libc::dup2(parked_listener, LISTENER_FD) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::dup2(parked_report, REPORT_FD) < 0 {
            return Err(io::Error::last_os_error());
        }

        libc::close(parked_listener);
        libc::close(parked_report);
    }
    Ok(())
}

/// Wire the invoker's terminal onto stdin, stdout and stderr
pub fn redirect_stdio(stdio: &[OwnedFd]) -> io::Result<()> {
    for (target, fd) in stdio.iter().enumerate().take(3) {
        nix::unistd::dup2(fd.as_raw_fd(), target as RawFd)?;
    }
    Ok(())
}

/// Descriptors currently open in this process
pub fn open_fds() -> io::Result<Vec<RawFd>> {
    let entries = fs::read_dir("/proc/self/fd")?;
    let mut fds: Vec<RawFd> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    fds.sort_unstable();
    Ok(fds)
}

/// Number of descriptors currently open
pub fn count_open() -> io::Result<usize> {
    // The directory handle used for the scan shows up in the listing
    Ok(open_fds()?.len().saturating_sub(1))
}

/// Close everything above stderr except `keep`.
///
/// Nothing may own the closed descriptors afterwards: callers hand their
/// objects over with `into_raw_fd` first or never drop them.
pub fn close_inherited(keep: &[RawFd]) -> usize {
    let candidates = open_fds().unwrap_or_else(|_| (3..FALLBACK_FD_LIMIT).collect());

    let mut closed = 0;
    for fd in candidates {
        if fd <= 2 || keep.contains(&fd) {
            continue;
        }
        // SAFETY: see the ownership contract above; EBADF (the scan's own
        // directory handle, or a hole in the fallback range) is harmless
        if unsafe { libc::close(fd) } == 0 {
            closed += 1;
        }
    }
    closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    #[test]
    fn test_open_fds_sees_new_descriptor() {
        let (a, _b) = UnixStream::pair().unwrap();
        let raw = a.into_raw_fd();
        assert!(open_fds().unwrap().contains(&raw));
        assert!(count_open().unwrap() >= 2);

        // SAFETY: raw was released by into_raw_fd above
        unsafe { libc::close(raw) };
    }

    #[test]
    fn test_install_inherited_in_child() {
        let (listener, _l) = UnixStream::pair().unwrap();
        let (report, _r) = UnixStream::pair().unwrap();
        let (listener_fd, report_fd) = (listener.as_raw_fd(), report.as_raw_fd());

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg("test -S /proc/$$/fd/3 && test -S /proc/$$/fd/4");
        // SAFETY: install_inherited only issues fcntl/dup2/close
        unsafe {
            cmd.pre_exec(move || install_inherited(listener_fd, report_fd));
        }

        assert!(cmd.status().unwrap().success());
    }
}
