//! Error types for the launcher
//!
//! Every failure the daemon, a booster or the invoker can run into falls in
//! one of three classes. Startup errors end the process with their plain
//! diagnostic. Rejected invocations are answered and the booster keeps its
//! slot. A lost race for a single-instance slot is answered the same way but
//! logged as a warning. A lock whose owner died is reclaimed inside
//! `LockManager::acquire` and never becomes an error.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// How an error is handled by the component that observes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Process exits immediately with a fixed diagnostic
    StartupFatal,
    /// Booster answers the invoker with a failure and keeps accepting
    InvocationRejected,
    /// Lost a race for the same single-instance slot
    TransientBusy,
}

/// Reason attached to a rejected invocation on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// An existing single-instance owner could not be raised
    CannotActivate,
    /// The target could not be loaded or is not executable
    LoadFailed,
    /// The target has no `main` symbol
    SymbolMissing,
    /// Malformed or unsupported request
    BadRequest,
}

impl RejectReason {
    /// Exit code the invoker reports for this rejection in test mode
    pub fn test_mode_exit_code(self) -> i32 {
        match self {
            RejectReason::CannotActivate => 1,
            RejectReason::LoadFailed => 2,
            RejectReason::SymbolMissing => 3,
            RejectReason::BadRequest => 4,
        }
    }
}

/// Launcher error
#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("DISPLAY environment variable not set.")]
    DisplayNotSet,

    #[error("applauncherd is already running (pid {0})")]
    AlreadyRunning(i32),

    #[error("applauncherd is already running")]
    AlreadyRunningUnknownPid,

    #[error("Loading invoked application failed: {0}")]
    LoadFailed(String),

    #[error("Loading symbol '{symbol}' failed: {reason}")]
    SymbolMissing { symbol: String, reason: String },

    #[error("Loading invoked application failed: {0} is not an executable file")]
    NotExecutable(String),

    #[error("Can't activate existing instance of the application!")]
    CannotActivate,

    #[error("invalid invocation request: {0}")]
    BadRequest(String),

    #[error("unknown booster type '{0}'")]
    UnknownBoosterType(String),

    #[error("single-instance lock for '{0}' is contended")]
    LockContended(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),
}

impl LauncherError {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            LauncherError::DisplayNotSet
            | LauncherError::AlreadyRunning(_)
            | LauncherError::AlreadyRunningUnknownPid
            | LauncherError::UnknownBoosterType(_) => ErrorClass::StartupFatal,
            LauncherError::LockContended(_) => ErrorClass::TransientBusy,
            _ => ErrorClass::InvocationRejected,
        }
    }

    /// Wire-level reason for a rejected invocation
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            LauncherError::CannotActivate | LauncherError::LockContended(_) => {
                RejectReason::CannotActivate
            }
            LauncherError::LoadFailed(_) | LauncherError::NotExecutable(_) => {
                RejectReason::LoadFailed
            }
            LauncherError::SymbolMissing { .. } => RejectReason::SymbolMissing,
            _ => RejectReason::BadRequest,
        }
    }

    /// Process exit code when this error ends a process
    pub fn exit_code(&self) -> i32 {
        1
    }
}

pub type Result<T> = std::result::Result<T, LauncherError>;
