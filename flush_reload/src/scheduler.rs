// Sampling loop.
//
// One round: time every probe point once and append the round to the store.
// Free running rounds (optionally) evict every point first. Fixed slot rounds
// evict right after probing instead, so the idle part of the slot is the
// observation window. Rounds never overlap and nothing interrupts a round once
// started; the stop token is only looked at between rounds.

use cache_side_channel::hit_rate::HitRateAggregator;
use cache_side_channel::time_series::{OverflowPolicy, TraceStore};
use cache_side_channel::{
    probe_points, Measurement, MonitoredTarget, ProbePoint, SideChannelError,
    SingleAddrCacheSideChannel,
};
use cache_utils::rdtsc_nofence;
use log::{debug, error, info, log_enabled, trace, Level};
use serde::{Deserialize, Serialize};
use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Cadence {
    /// Evict everything, sleep `pause_us`, probe everything.
    FreeRunning {
        #[serde(default = "default_pause")]
        pause_us: u64,
    },
    /// Each round starts at least `slot_cycles` after the previous one, so the
    /// round index is a coarse time axis.
    FixedSlot { slot_cycles: u64 },
}

fn default_pause() -> u64 {
    10
}

impl Default for Cadence {
    fn default() -> Self {
        Cadence::FreeRunning {
            pause_us: default_pause(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub cadence: Cadence,
    pub max_rounds: u64,
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    /// Flush every point once per round on top of the flush that follows each
    /// probe: before the pause when free running, after the probes (ahead of
    /// the busy wait) in fixed slots.
    pub evict_before_probe: bool,
    /// Rounds between two progress reports, 0 disables them.
    pub progress_interval: u64,
    pub progress_window: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            cadence: Cadence::default(),
            max_rounds: 100_000,
            capacity: 100_000,
            overflow: OverflowPolicy::Stop,
            evict_before_probe: true,
            progress_interval: 1000,
            progress_window: 1000,
        }
    }
}

/// Cooperative cancellation, safe to trip from a signal handler thread.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    RoundCap,
    StopSignal,
    CapacityReached,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Rounds completed by this call.
    pub rounds: u64,
    pub stop_reason: StopReason,
    /// Counter value at the start of each slot, fixed slot cadence only.
    pub slot_starts: Vec<u64>,
    pub elapsed_cycles: u64,
}

pub struct SamplingScheduler<C: SingleAddrCacheSideChannel> {
    channel: C,
    points: Vec<ProbePoint>,
    names: Vec<String>,
    config: SchedulerConfig,
    store: TraceStore,
    aggregator: HitRateAggregator,
}

impl<C: SingleAddrCacheSideChannel> SamplingScheduler<C> {
    /// # Safety
    ///
    /// Every cache line of every target must stay mapped and readable for the
    /// whole life of the scheduler.
    pub unsafe fn new(channel: C, targets: Vec<MonitoredTarget>, config: SchedulerConfig) -> Self {
        let points = probe_points(&targets);
        // same order as probe_points
        let names = targets
            .iter()
            .flat_map(|t| (0..t.lines).map(move |line| t.line_name(line)))
            .collect();
        let aggregator = HitRateAggregator::new(points.len(), config.progress_window);
        let store = TraceStore::new(
            targets,
            channel.threshold(),
            config.capacity,
            config.overflow,
        );
        SamplingScheduler {
            channel,
            points,
            names,
            config,
            store,
            aggregator,
        }
    }

    pub fn store(&self) -> &TraceStore {
        &self.store
    }

    pub fn into_store(self) -> TraceStore {
        self.store
    }

    pub fn aggregator(&self) -> &HitRateAggregator {
        &self.aggregator
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn points(&self) -> &[ProbePoint] {
        &self.points
    }

    fn evict_all(&mut self) {
        for p in &self.points {
            unsafe { self.channel.prepare_single(p.as_ptr()) };
        }
    }

    fn probe_all(&mut self, measurements: &mut Vec<Measurement>) {
        measurements.clear();
        for p in &self.points {
            measurements.push(unsafe { self.channel.test_single(p.as_ptr()) });
        }
    }

    /// Samples until the round cap, the store capacity or `stop`, whichever
    /// comes first. The store always holds whole rounds.
    pub fn run(&mut self, stop: &StopToken) -> RunOutcome {
        let mut measurements = Vec::with_capacity(self.points.len());
        let mut slot_starts = Vec::new();
        let mut rounds = 0u64;

        info!(
            "Sampling {} probe points, {:?}, up to {} rounds",
            self.points.len(),
            self.config.cadence,
            self.config.max_rounds
        );
        let start = rdtsc_nofence();
        // cold baseline
        self.evict_all();

        let stop_reason = loop {
            if stop.is_stopped() {
                break StopReason::StopSignal;
            }
            if self.store.rounds() >= self.config.max_rounds {
                break StopReason::RoundCap;
            }

            let slot_start = match self.config.cadence {
                Cadence::FreeRunning { pause_us } => {
                    if self.config.evict_before_probe {
                        self.evict_all();
                    }
                    if pause_us > 0 {
                        thread::sleep(Duration::from_micros(pause_us));
                    }
                    self.probe_all(&mut measurements);
                    None
                }
                Cadence::FixedSlot { .. } => {
                    let slot_start = rdtsc_nofence();
                    self.probe_all(&mut measurements);
                    if self.config.evict_before_probe {
                        self.evict_all();
                    }
                    Some(slot_start)
                }
            };

            let round = match self.store.record_round(&measurements) {
                Ok(round) => round,
                Err(e) => {
                    if !matches!(e, SideChannelError::CapacityExceeded { .. }) {
                        error!("Sample store rejected round: {}", e);
                    }
                    info!("Stopping: {}", e);
                    break StopReason::CapacityReached;
                }
            };
            rounds += 1;
            self.aggregator
                .observe_round(measurements.iter().map(|m| m.status));
            self.log_round(round, &measurements);

            if let (Some(slot_start), Cadence::FixedSlot { slot_cycles }) =
                (slot_start, self.config.cadence)
            {
                slot_starts.push(slot_start);
                while rdtsc_nofence().wrapping_sub(slot_start) < slot_cycles {
                    spin_loop();
                }
            }
        };

        let elapsed_cycles = rdtsc_nofence().wrapping_sub(start);
        info!(
            "Sampling stopped after {} rounds ({:?})",
            rounds, stop_reason
        );
        RunOutcome {
            rounds,
            stop_reason,
            slot_starts,
            elapsed_cycles,
        }
    }

    fn log_round(&self, round: u64, measurements: &[Measurement]) {
        if log_enabled!(Level::Trace) {
            for (name, m) in self.names.iter().zip(measurements) {
                if m.status.is_hit() {
                    trace!("Round {:5}: {} hit (time={})", round, name, m.latency);
                }
            }
        }
        let done = round + 1;
        if self.config.progress_interval == 0 || done % self.config.progress_interval != 0 {
            return;
        }
        info!("Captured {} rounds...", done);
        if log_enabled!(Level::Debug) {
            for (i, name) in self.names.iter().enumerate() {
                debug!(
                    "  {}: {} hits in last {} rounds ({:.2}%)",
                    name,
                    self.aggregator.window_hits(i),
                    self.config.progress_window.min(done as usize),
                    self.aggregator.windowed_rate(i) * 100.0
                );
            }
        }
    }
}
