//! Host port allocation.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Inclusive port range assigned to one session family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    pub fn len(&self) -> usize {
        if self.max < self.min {
            0
        } else {
            usize::from(self.max - self.min) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no free port in range {range}")]
pub struct ResourceExhausted {
    pub range: PortRange,
}

/// Pick the lowest port in `range` that is not held.
///
/// `held` covers every active session of every family, since all of them
/// publish on the same host.
pub fn allocate(range: PortRange, held: &HashSet<u16>) -> Result<u16, ResourceExhausted> {
    (range.min..=range.max)
        .find(|port| !held.contains(port))
        .ok_or(ResourceExhausted { range })
}
