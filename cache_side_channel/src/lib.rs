#![deny(unsafe_op_in_unsafe_fn)]

use log::{debug, warn};
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;
#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

pub mod hit_rate;
pub mod target;
pub mod time_series;

pub use target::{probe_points, MonitoredTarget, ProbePoint, TargetId};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn is_hit(self) -> bool {
        self == CacheStatus::Hit
    }
}

/// Latency boundary between a resident and an absent line.
/// Strictly below `value` is a hit.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct Threshold {
    pub value: u64,
}

impl Threshold {
    pub fn new(value: u64) -> Self {
        Threshold { value }
    }

    pub fn is_hit(&self, time: u64) -> bool {
        time < self.value
    }

    pub fn classify(&self, time: u64) -> CacheStatus {
        if self.is_hit(time) {
            CacheStatus::Hit
        } else {
            CacheStatus::Miss
        }
    }
}

/// One timed reload.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Measurement {
    pub latency: u64,
    pub status: CacheStatus,
}

#[derive(Debug, Error)]
pub enum SideChannelError {
    #[error("sample store reached its capacity of {capacity} rounds")]
    CapacityExceeded { capacity: usize },
    #[error("round has {got} measurements, store expects {expected}")]
    RoundShape { expected: usize, got: usize },
    #[error("cpu affinity: {0}")]
    Affinity(#[from] nix::Error),
}

/// Evict / measure seam used by the sampling loop.
pub trait SingleAddrCacheSideChannel: Debug {
    /// Best-effort eviction of the line holding `addr`.
    ///
    /// # Safety
    ///
    /// addr must point into mapped memory.
    unsafe fn prepare_single(&mut self, addr: *const u8);

    /// Times one reload of `addr` and classifies it. Leaves the line evicted
    /// if the channel is configured to.
    ///
    /// # Safety
    ///
    /// addr must be a valid pointer to read.
    unsafe fn test_single(&mut self, addr: *const u8) -> Measurement;

    fn threshold(&self) -> Threshold;
}

/// Pins the calling thread on `cpu_set`, returning the previous affinity.
pub fn set_affinity(cpu_set: &CpuSet) -> Result<CpuSet, SideChannelError> {
    let old = sched_getaffinity(Pid::from_raw(0))?;
    sched_setaffinity(Pid::from_raw(0), cpu_set)?;
    Ok(old)
}

pub fn restore_affinity(cpu_set: &CpuSet) -> Result<(), SideChannelError> {
    sched_setaffinity(Pid::from_raw(0), cpu_set)?;
    Ok(())
}

pub fn pin_to_core(core: usize) -> Result<CpuSet, SideChannelError> {
    let mut cpu_set = CpuSet::new();
    cpu_set.set(core)?;
    set_affinity(&cpu_set)
}

/// Keeps the calling thread on one core until dropped, then puts the previous
/// affinity back.
#[derive(Debug)]
pub struct CorePin {
    core: usize,
    previous: CpuSet,
}

impl CorePin {
    pub fn new(core: usize) -> Result<Self, SideChannelError> {
        let previous = pin_to_core(core)?;
        debug!("Pinned to core {}", core);
        Ok(CorePin { core, previous })
    }

    pub fn core(&self) -> usize {
        self.core
    }
}

impl Drop for CorePin {
    fn drop(&mut self) {
        if let Err(e) = restore_affinity(&self.previous) {
            warn!("Failed to restore affinity after core {}: {}", self.core, e);
        }
    }
}
