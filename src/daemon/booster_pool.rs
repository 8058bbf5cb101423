//! Booster slots and serving applications
//!
//! One slot per active booster type. A slot holds at most one idle booster;
//! when that booster is consumed it moves to the serving set (it is an
//! application now) and the slot waits for its respawn deadline. A slot with
//! neither a booster nor a deadline is vacant and gets filled on the next
//! loop turn.
//!
//! The pool only keeps books; forking and killing happen in the server.

use crate::booster::types::BoosterType;
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashMap};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

/// Booster deaths this soon after spawn count towards a crash loop
pub const CRASH_WINDOW: Duration = Duration::from_secs(1);

/// Consecutive early deaths before the slot cools down
pub const MAX_RESPAWN_ATTEMPTS: u32 = 3;

/// Pause before respawning a crash-looping type
pub const RESPAWN_COOLDOWN: Duration = Duration::from_secs(60);

/// An idle booster process
#[derive(Debug)]
pub struct BoosterHandle {
    pub kind: BoosterType,
    pub pid: Pid,
    /// Daemon end of the booster's report channel (None after EOF)
    pub channel: Option<UnixStream>,
    pub spawned_at: Instant,
}

/// A former booster now running an application
#[derive(Debug)]
pub struct ServingApp {
    pub kind: BoosterType,
    pub pid: Pid,
    pub app_name: String,
    /// Connection to the invoker waiting for the exit status
    pub invoker: Option<UnixStream>,
    pub started_at: Instant,
}

/// What a reaped pid was
#[derive(Debug)]
pub enum ExitOutcome {
    /// An application finished
    AppExited(ServingApp),
    /// An idle booster died; replace it after `backoff`
    BoosterDied {
        kind: BoosterType,
        pid: Pid,
        backoff: Duration,
    },
    /// Not tracked (already torn down, or an unrelated child)
    Unknown,
}

#[derive(Debug, Default)]
struct Slot {
    current: Option<BoosterHandle>,
    respawn_at: Option<Instant>,
    early_deaths: u32,
}

/// Slot table of the daemon
#[derive(Debug, Default)]
pub struct BoosterPool {
    slots: BTreeMap<BoosterType, Slot>,
    serving: HashMap<Pid, ServingApp>,
}

impl BoosterPool {
    /// Pool with an empty slot per type
    pub fn new(kinds: &[BoosterType]) -> Self {
        let mut pool = Self::default();
        for &kind in kinds {
            pool.slots.entry(kind).or_default();
        }
        pool
    }

    /// Types with neither a booster nor a pending respawn
    pub fn vacant(&self) -> Vec<BoosterType> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.current.is_none() && slot.respawn_at.is_none())
            .map(|(kind, _)| *kind)
            .collect()
    }

    /// Put a freshly spawned booster in its slot.
    ///
    /// Returns the booster it replaces, which the caller must terminate.
    /// Boosters of types without a slot are handed straight back.
    pub fn insert(&mut self, handle: BoosterHandle) -> Option<BoosterHandle> {
        match self.slots.get_mut(&handle.kind) {
            Some(slot) => {
                slot.respawn_at = None;
                slot.current.replace(handle)
            }
            None => Some(handle),
        }
    }

    /// Booster consumed by an invocation: it becomes a serving application.
    /// The slot is left empty for the caller to schedule a respawn.
    pub fn hand_off(
        &mut self,
        pid: Pid,
        app_name: String,
        invoker: Option<UnixStream>,
    ) -> Option<BoosterType> {
        let slot = self
            .slots
            .values_mut()
            .find(|slot| slot.current.as_ref().is_some_and(|b| b.pid == pid))?;
        let booster = slot.current.take()?;
        slot.early_deaths = 0;

        self.serving.insert(
            pid,
            ServingApp {
                kind: booster.kind,
                pid,
                app_name,
                invoker,
                started_at: Instant::now(),
            },
        );
        Some(booster.kind)
    }

    /// Track an application whose booster was already removed from its slot
    /// (consumed while being torn down)
    pub fn adopt(&mut self, app: ServingApp) {
        self.serving.insert(app.pid, app);
    }

    /// Replace the booster of `kind` at `at`
    pub fn schedule_respawn(&mut self, kind: BoosterType, at: Instant) {
        if let Some(slot) = self.slots.get_mut(&kind) {
            if slot.current.is_none() {
                slot.respawn_at = Some(at);
            }
        }
    }

    /// Types whose respawn deadline has passed; their deadlines are cleared
    pub fn due_respawns(&mut self, now: Instant) -> Vec<BoosterType> {
        let mut due = Vec::new();
        for (kind, slot) in &mut self.slots {
            if slot.respawn_at.is_some_and(|at| at <= now) {
                slot.respawn_at = None;
                due.push(*kind);
            }
        }
        due
    }

    /// Earliest pending respawn
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.values().filter_map(|slot| slot.respawn_at).min()
    }

    /// Book-keep a reaped child
    pub fn on_exit(&mut self, pid: Pid, now: Instant) -> ExitOutcome {
        if let Some(app) = self.serving.remove(&pid) {
            return ExitOutcome::AppExited(app);
        }

        for (kind, slot) in &mut self.slots {
            if !slot.current.as_ref().is_some_and(|b| b.pid == pid) {
                continue;
            }
            let Some(booster) = slot.current.take() else {
                break;
            };

            if now.saturating_duration_since(booster.spawned_at) < CRASH_WINDOW {
                slot.early_deaths += 1;
            } else {
                slot.early_deaths = 0;
            }

            let backoff = if slot.early_deaths >= MAX_RESPAWN_ATTEMPTS {
                slot.early_deaths = 0;
                RESPAWN_COOLDOWN
            } else {
                Duration::ZERO
            };

            return ExitOutcome::BoosterDied {
                kind: *kind,
                pid,
                backoff,
            };
        }

        ExitOutcome::Unknown
    }

    /// Remove every idle booster and rebuild the slot table for `kinds`.
    /// Serving applications are untouched.
    pub fn reset_kinds(&mut self, kinds: &[BoosterType]) -> Vec<BoosterHandle> {
        let old = std::mem::take(&mut self.slots);
        for &kind in kinds {
            self.slots.entry(kind).or_default();
        }
        old.into_values().filter_map(|slot| slot.current).collect()
    }

    /// Idle boosters, in tag order
    pub fn idle(&self) -> impl Iterator<Item = &BoosterHandle> {
        self.slots.values().filter_map(|slot| slot.current.as_ref())
    }

    /// Idle booster with the given pid
    pub fn idle_mut(&mut self, pid: Pid) -> Option<&mut BoosterHandle> {
        self.slots
            .values_mut()
            .filter_map(|slot| slot.current.as_mut())
            .find(|b| b.pid == pid)
    }

    /// Serving applications
    pub fn serving(&self) -> impl Iterator<Item = &ServingApp> {
        self.serving.values()
    }
}
