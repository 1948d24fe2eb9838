use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::error::{ProtocolError, Result};

/// Sandbox lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SandboxState {
    Created = 0,
    Started = 1,
    Stopped = 2,
    Disposed = 3,
}

impl SandboxState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Started,
            2 => Self::Stopped,
            _ => Self::Disposed,
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(SandboxState::Created as u8))
    }

    pub(crate) fn get(&self) -> SandboxState {
        SandboxState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next` if it lies ahead; returns the state it left.
    pub(crate) fn advance(&self, next: SandboxState) -> Option<SandboxState> {
        let previous = self.0.fetch_max(next as u8, Ordering::AcqRel);
        (previous < next as u8).then(|| SandboxState::from_u8(previous))
    }

    pub(crate) fn ensure(&self, expected: SandboxState, operation: &str) -> Result<()> {
        let state = self.get();
        if state == expected {
            Ok(())
        } else {
            Err(ProtocolError::invalid_state(format!(
                "cannot {operation}: sandbox is {state}, expected {expected}"
            ))
            .into())
        }
    }
}
