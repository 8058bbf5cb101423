//! Signal plumbing for the daemon's control loop
//!
//! Handlers only raise a flag and write a wake-up byte; the loop polls the
//! wake-up socket and turns raised flags into [`DaemonEvent`]s, so every
//! transition, fork and exec happens outside signal context.

use anyhow::Result;
use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Event the control loop acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonEvent {
    /// SIGCHLD: reap children
    ChildExited,
    /// SIGUSR1
    ExitBootMode,
    /// SIGUSR2
    EnterBootMode,
    /// SIGHUP: reload and restart boosters
    RestartBoosters,
    /// SIGTERM / SIGINT
    Shutdown,
}

/// Drain order: reap first so slots are current, shut down last
const SIGNAL_EVENTS: [(i32, DaemonEvent); 6] = [
    (SIGCHLD, DaemonEvent::ChildExited),
    (SIGUSR1, DaemonEvent::ExitBootMode),
    (SIGUSR2, DaemonEvent::EnterBootMode),
    (SIGHUP, DaemonEvent::RestartBoosters),
    (SIGTERM, DaemonEvent::Shutdown),
    (SIGINT, DaemonEvent::Shutdown),
];

/// Signal flags shared between the handlers and the control loop
pub struct SignalEvents {
    flags: Vec<(i32, DaemonEvent, Arc<AtomicBool>)>,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
}

impl SignalEvents {
    /// Create the flags and the wake-up socket pair
    pub fn new() -> Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;

        let flags = SIGNAL_EVENTS
            .iter()
            .map(|&(signal, event)| (signal, event, Arc::new(AtomicBool::new(false))))
            .collect();

        Ok(Self {
            flags,
            wake_rx,
            wake_tx,
        })
    }

    /// Install handlers for every signal the daemon reacts to
    pub fn setup(&self) -> Result<()> {
        for (signal, _, flag) in &self.flags {
            signal_hook::flag::register(*signal, Arc::clone(flag))?;
            signal_hook::low_level::pipe::register(*signal, self.wake_tx.try_clone()?)?;
        }
        Ok(())
    }

    /// Descriptor that becomes readable when a signal arrives
    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.wake_rx.as_fd()
    }

    /// Consume pending wake-up bytes and raised flags
    pub fn drain(&self) -> Vec<DaemonEvent> {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake_rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }

        let mut events = Vec::new();
        for (_, event, flag) in &self.flags {
            if flag.swap(false, Ordering::SeqCst) && !events.contains(event) {
                events.push(*event);
            }
        }
        events
    }
}
