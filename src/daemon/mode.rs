//! Boot/normal mode state machine
//!
//! The daemon is always in exactly one of two modes. SIGUSR1 leaves boot
//! mode, SIGUSR2 enters it. Both are idempotent: repeating a signal logs an
//! "already in" line and changes nothing.

use std::fmt;

/// Daemon-wide configuration controlling which booster types are alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaemonMode {
    Boot,
    Normal,
}

impl fmt::Display for DaemonMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonMode::Boot => write!(f, "boot"),
            DaemonMode::Normal => write!(f, "normal"),
        }
    }
}

/// Mode-changing input, decoded from SIGUSR1 / SIGUSR2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSignal {
    /// SIGUSR1
    ExitBoot,
    /// SIGUSR2
    EnterBoot,
}

/// Result of applying a mode signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: DaemonMode,
    pub to: DaemonMode,
    /// Fixed log phrase for this edge
    pub message: &'static str,
}

impl Transition {
    /// Whether the mode actually changed (boosters must be rebuilt)
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// (current, input) -> (next, log line)
const TRANSITIONS: [(DaemonMode, ModeSignal, DaemonMode, &str); 4] = [
    (DaemonMode::Boot, ModeSignal::ExitBoot, DaemonMode::Normal, "Daemon: Exited boot mode."),
    (DaemonMode::Normal, ModeSignal::ExitBoot, DaemonMode::Normal, "Daemon: Already in normal mode."),
    (DaemonMode::Normal, ModeSignal::EnterBoot, DaemonMode::Boot, "Daemon: Entered boot mode."),
    (DaemonMode::Boot, ModeSignal::EnterBoot, DaemonMode::Boot, "Daemon: Already in boot mode"),
];

impl DaemonMode {
    /// Look up the transition for a signal in this mode
    pub fn apply(self, signal: ModeSignal) -> Transition {
        TRANSITIONS
            .iter()
            .find(|(from, input, _, _)| *from == self && *input == signal)
            .map(|&(from, _, to, message)| Transition { from, to, message })
            // The table is total over (mode, signal)
            .unwrap_or(Transition {
                from: self,
                to: self,
                message: "",
            })
    }

    /// Initial mode from the `--boot-mode` flag
    pub fn initial(boot_mode: bool) -> Self {
        if boot_mode {
            DaemonMode::Boot
        } else {
            DaemonMode::Normal
        }
    }
}
