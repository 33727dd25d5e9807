//! Message identifier allocation.
//!
//! Identifiers are 16-bit and non-zero. The cursor remembers the last value
//! handed out; the next assignment starts one past it and skips anything the
//! caller reports as live.

use crate::error::{MqttError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketIdCursor {
    last: u16,
}

impl PacketIdCursor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resumes after identifiers restored from a previous run.
    #[must_use]
    pub fn starting_after(last: u16) -> Self {
        Self { last }
    }

    #[must_use]
    pub fn last(&self) -> u16 {
        self.last
    }

    /// Assigns the next identifier for which `in_use` is false.
    ///
    /// The cursor only moves when an identifier is found.
    pub fn assign(&mut self, in_use: impl Fn(u16) -> bool) -> Result<u16> {
        let mut candidate = self.last;
        for _ in 0..u16::MAX {
            candidate = next_id(candidate);
            if !in_use(candidate) {
                self.last = candidate;
                return Ok(candidate);
            }
        }
        Err(MqttError::PacketIdExhausted)
    }
}

fn next_id(id: u16) -> u16 {
    if id == u16::MAX {
        1
    } else {
        id + 1
    }
}
