//! Lifecycle of a teleportation half
//!
//! `Created → Active → Closing → Closed`. Entering `Closing` is guarded so
//! that exactly one trigger (explicit close, data-path error, transport
//! failure) performs the teardown; every later trigger observes the gate
//! already taken and does nothing.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Created,
    Active,
    Closing,
    Closed,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Created,
            1 => Phase::Active,
            2 => Phase::Closing,
            _ => Phase::Closed,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Created => "created",
            Phase::Active => "active",
            Phase::Closing => "closing",
            Phase::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Atomic single-fire teardown gate
#[derive(Debug)]
pub struct CloseGate {
    phase: AtomicU8,
}

impl CloseGate {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Created as u8),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// `Created → Active`; no effect in any other phase
    pub fn activate(&self) {
        let _ = self.phase.compare_exchange(
            Phase::Created as u8,
            Phase::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Try to enter `Closing`
    ///
    /// Returns true for exactly one caller over the gate's lifetime.
    pub fn begin_close(&self) -> bool {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            if current >= Phase::Closing as u8 {
                return false;
            }
            match self.phase.compare_exchange_weak(
                current,
                Phase::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn finish_close(&self) {
        self.phase.store(Phase::Closed as u8, Ordering::Release);
    }

    pub fn is_closing(&self) -> bool {
        self.phase() >= Phase::Closing
    }
}

impl Default for CloseGate {
    fn default() -> Self {
        Self::new()
    }
}
