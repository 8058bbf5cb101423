//! Booster types and runtime profiles
//!
//! A booster type is a single-letter tag. Each tag maps to a runtime
//! profile: which libraries the booster preloads and how it enters the
//! invoked application.

use crate::error::LauncherError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Application type served by a booster, e.g. `m`, `q`, `d` or `e`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BoosterType(char);

impl BoosterType {
    /// MeeGo Touch style applications
    pub const M: BoosterType = BoosterType('m');
    /// Plain Qt applications
    pub const Q: BoosterType = BoosterType('q');
    /// Declarative (QML) applications
    pub const D: BoosterType = BoosterType('d');
    /// Applications entered through exec
    pub const E: BoosterType = BoosterType('e');

    /// Create a booster type from its tag character
    pub fn new(tag: char) -> Result<Self, LauncherError> {
        if tag.is_ascii_lowercase() {
            Ok(BoosterType(tag))
        } else {
            Err(LauncherError::UnknownBoosterType(tag.to_string()))
        }
    }

    /// The tag character
    pub fn tag(self) -> char {
        self.0
    }

    /// Name used for the booster's socket, argv[0] and process name
    pub fn process_name(self) -> String {
        format!("booster-{}", self.0)
    }
}

impl FromStr for BoosterType {
    type Err = LauncherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Older invokers spell the Qt booster "qt"
        if s == "qt" {
            return Ok(BoosterType::Q);
        }
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(tag), None) => BoosterType::new(tag),
            _ => Err(LauncherError::UnknownBoosterType(s.to_string())),
        }
    }
}

impl fmt::Display for BoosterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a booster hands control to the invoked application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryConvention {
    /// dlopen the target and call its `main` in the booster's address space
    #[default]
    Main,
    /// execve the target
    Exec,
}

impl FromStr for EntryConvention {
    type Err = LauncherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "main" => Ok(EntryConvention::Main),
            "exec" => Ok(EntryConvention::Exec),
            other => Err(LauncherError::BadRequest(format!(
                "unknown entry convention '{}'",
                other
            ))),
        }
    }
}

/// What a booster of a given type loads and how it enters applications
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeProfile {
    pub kind: BoosterType,
    /// Shared libraries opened with RTLD_NOW | RTLD_GLOBAL before accepting
    pub preload: Vec<PathBuf>,
    pub entry: EntryConvention,
}

impl RuntimeProfile {
    /// Built-in profile for a type: `e` execs, everything else calls `main`
    pub fn default_for(kind: BoosterType) -> Self {
        let entry = if kind == BoosterType::E {
            EntryConvention::Exec
        } else {
            EntryConvention::Main
        };
        Self {
            kind,
            preload: Vec::new(),
            entry,
        }
    }
}
