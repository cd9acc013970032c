//! Plan/Build mode.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Which tool set the assistant may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Read-only inspection; mutating tools are hidden and rejected.
    #[default]
    Plan,
    /// Full tool set behind the safety gate.
    Build,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Build => "build",
        }
    }

    /// Whether mutating tools may run in this mode.
    pub fn allows_mutation(&self) -> bool {
        matches!(self, Self::Build)
    }

    pub fn toggled(&self) -> Self {
        match self {
            Self::Plan => Self::Build,
            Self::Build => Self::Plan,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Plan => 0,
            Self::Build => 1,
        }
    }

    fn from_u8(v: u8) -> Self {
        if v == 1 { Self::Build } else { Self::Plan }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plan" => Ok(Self::Plan),
            "build" => Ok(Self::Build),
            other => Err(format!("unknown mode '{other}', expected 'plan' or 'build'")),
        }
    }
}

/// Shared, externally controlled mode flag.
///
/// The presentation layer holds a clone and may flip it at any time; the
/// orchestrator reads it once at the start of every model round, so a
/// switch during a turn applies from the next round on.
#[derive(Debug, Clone)]
pub struct ModeHandle(Arc<AtomicU8>);

impl ModeHandle {
    pub fn new(mode: Mode) -> Self {
        Self(Arc::new(AtomicU8::new(mode.to_u8())))
    }

    pub fn get(&self) -> Mode {
        Mode::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Set the mode, returning the previous one.
    pub fn set(&self, mode: Mode) -> Mode {
        Mode::from_u8(self.0.swap(mode.to_u8(), Ordering::SeqCst))
    }
}

impl Default for ModeHandle {
    fn default() -> Self {
        Self::new(Mode::default())
    }
}
