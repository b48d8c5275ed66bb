#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};

pub type TargetId = usize;

const LINE_SIZE: usize = 64;

/// A resolved code location to watch. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct MonitoredTarget {
    pub id: TargetId,
    pub name: String,
    pub address: usize,
    /// Number of consecutive cache lines covered, starting at `address`.
    pub lines: usize,
}

/// One probed cache line of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct ProbePoint {
    pub target: TargetId,
    pub line: usize,
    pub address: usize,
}

impl MonitoredTarget {
    pub fn new(id: TargetId, name: impl Into<String>, address: usize, lines: usize) -> Self {
        MonitoredTarget {
            id,
            name: name.into(),
            address,
            lines: lines.max(1),
        }
    }

    /// Callers stay below `lines`, or check `end_address` first.
    pub fn line_address(&self, line: usize) -> usize {
        self.address + line * LINE_SIZE
    }

    /// One past the last byte covered, `None` when the lines run past the top
    /// of the address space.
    pub fn end_address(&self) -> Option<usize> {
        self.lines.checked_mul(LINE_SIZE)?.checked_add(self.address)
    }

    /// Display name of one line: the target name, with the byte offset for
    /// lines past the first.
    pub fn line_name(&self, line: usize) -> String {
        if line == 0 {
            self.name.clone()
        } else {
            format!("{}+{:#x}", self.name, line * LINE_SIZE)
        }
    }

    pub fn probe_points(&self) -> impl Iterator<Item = ProbePoint> + '_ {
        (0..self.lines).map(move |line| ProbePoint {
            target: self.id,
            line,
            address: self.line_address(line),
        })
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.address && address - self.address < self.lines.saturating_mul(LINE_SIZE)
    }
}

impl ProbePoint {
    pub fn as_ptr(&self) -> *const u8 {
        self.address as *const u8
    }
}

/// Every probe point of every target, in target then line order.
pub fn probe_points(targets: &[MonitoredTarget]) -> Vec<ProbePoint> {
    targets.iter().flat_map(|t| t.probe_points()).collect()
}
