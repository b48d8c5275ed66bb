use crate::target::{probe_points, MonitoredTarget, ProbePoint, TargetId};
use crate::{CacheStatus, Measurement, SideChannelError, Threshold};

#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct TimingSample {
    pub target: TargetId,
    pub round: u64,
    pub latency: u64,
    pub status: CacheStatus,
}

impl TimingSample {
    pub fn is_hit(&self) -> bool {
        self.status.is_hit()
    }
}

/// What happens once a series holds `capacity` samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde_support",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum OverflowPolicy {
    /// Refuse the sample, the scheduler stops gracefully.
    #[default]
    Stop,
    /// Drop the oldest sample.
    Overwrite,
}

/// Append-only, capacity-bounded samples of one probe point, one per round.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct TimeSeries {
    point: ProbePoint,
    capacity: usize,
    policy: OverflowPolicy,
    samples: VecDeque<TimingSample>,
    dropped: u64,
}

impl TimeSeries {
    pub fn new(point: ProbePoint, capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        TimeSeries {
            point,
            capacity,
            policy,
            samples: VecDeque::with_capacity(capacity.min(1 << 16)),
            dropped: 0,
        }
    }

    pub fn push(&mut self, sample: TimingSample) -> Result<(), SideChannelError> {
        if self.is_full() {
            match self.policy {
                OverflowPolicy::Stop => {
                    return Err(SideChannelError::CapacityExceeded {
                        capacity: self.capacity,
                    });
                }
                OverflowPolicy::Overwrite => {
                    self.samples.pop_front();
                    self.dropped += 1;
                }
            }
        }
        debug_assert!(self.samples.back().map_or(true, |s| s.round < sample.round));
        self.samples.push_back(sample);
        Ok(())
    }

    pub fn point(&self) -> &ProbePoint {
        &self.point
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples discarded by the overwrite policy.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn first_round(&self) -> Option<u64> {
        self.samples.front().map(|s| s.round)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &TimingSample> + ExactSizeIterator + '_ {
        self.samples.iter()
    }

    pub fn hits(&self) -> impl Iterator<Item = bool> + '_ {
        self.samples.iter().map(|s| s.is_hit())
    }

    pub fn hit_count(&self) -> u64 {
        self.samples.iter().filter(|s| s.is_hit()).count() as u64
    }
}

/// Per probe point time series for a whole run. Every round appends exactly
/// one sample to every series, so equal positions share a round index.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct TraceStore {
    targets: Vec<MonitoredTarget>,
    threshold: Threshold,
    series: Vec<TimeSeries>,
    rounds: u64,
}

impl TraceStore {
    pub fn new(
        targets: Vec<MonitoredTarget>,
        threshold: Threshold,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Self {
        let series = probe_points(&targets)
            .into_iter()
            .map(|p| TimeSeries::new(p, capacity, policy))
            .collect();
        TraceStore {
            targets,
            threshold,
            series,
            rounds: 0,
        }
    }

    /// Appends one round, measurements given in probe point order.
    /// Either every series receives its sample or none does.
    pub fn record_round(&mut self, measurements: &[Measurement]) -> Result<u64, SideChannelError> {
        if measurements.len() != self.series.len() {
            return Err(SideChannelError::RoundShape {
                expected: self.series.len(),
                got: measurements.len(),
            });
        }
        if let Some(full) = self
            .series
            .iter()
            .find(|s| s.is_full() && s.policy == OverflowPolicy::Stop)
        {
            return Err(SideChannelError::CapacityExceeded {
                capacity: full.capacity,
            });
        }
        let round = self.rounds;
        for (series, m) in self.series.iter_mut().zip(measurements) {
            let target = series.point.target;
            series.push(TimingSample {
                target,
                round,
                latency: m.latency,
                status: m.status,
            })?;
        }
        self.rounds += 1;
        Ok(round)
    }

    /// Rounds recorded so far, including overwritten ones.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    pub fn targets(&self) -> &[MonitoredTarget] {
        &self.targets
    }

    pub fn series(&self) -> &[TimeSeries] {
        &self.series
    }

    pub fn points(&self) -> impl Iterator<Item = &ProbePoint> + '_ {
        self.series.iter().map(|s| &s.point)
    }

    pub fn series_for(&self, target: TargetId, line: usize) -> Option<&TimeSeries> {
        self.series
            .iter()
            .find(|s| s.point.target == target && s.point.line == line)
    }

    pub fn target_by_name(&self, name: &str) -> Option<&MonitoredTarget> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Hit sequence of the first line of the named target.
    pub fn hit_sequence(&self, name: &str) -> Option<Vec<bool>> {
        let target = self.target_by_name(name)?;
        self.series_for(target.id, 0).map(|s| s.hits().collect())
    }

    /// Round index of the first sample still held.
    pub fn first_round(&self) -> u64 {
        self.series
            .first()
            .and_then(|s| s.first_round())
            .unwrap_or(self.rounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(round: u64, status: CacheStatus) -> TimingSample {
        TimingSample {
            target: 0,
            round,
            latency: if status.is_hit() { 40 } else { 250 },
            status,
        }
    }

    fn point() -> ProbePoint {
        ProbePoint {
            target: 0,
            line: 0,
            address: 0x1000,
        }
    }

    fn m(status: CacheStatus) -> Measurement {
        Measurement {
            latency: 0,
            status,
        }
    }

    #[test]
    fn stop_policy_refuses_past_capacity() {
        let mut s = TimeSeries::new(point(), 2, OverflowPolicy::Stop);
        s.push(sample(0, CacheStatus::Hit)).unwrap();
        s.push(sample(1, CacheStatus::Miss)).unwrap();
        assert!(matches!(
            s.push(sample(2, CacheStatus::Hit)),
            Err(SideChannelError::CapacityExceeded { capacity: 2 })
        ));
        assert_eq!(s.len(), 2);
        assert_eq!(s.hit_count(), 1);
    }

    #[test]
    fn overwrite_policy_keeps_latest() {
        let mut s = TimeSeries::new(point(), 3, OverflowPolicy::Overwrite);
        for r in 0..5 {
            s.push(sample(r, CacheStatus::Hit)).unwrap();
        }
        assert_eq!(s.len(), 3);
        assert_eq!(s.dropped(), 2);
        assert_eq!(s.first_round(), Some(2));
        let rounds: Vec<_> = s.iter().map(|s| s.round).collect();
        assert_eq!(rounds, vec![2, 3, 4]);
    }

    #[test]
    fn store_rounds_are_aligned() {
        let targets = vec![
            MonitoredTarget::new(0, "square", 0x1000, 1),
            MonitoredTarget::new(1, "multiply", 0x2000, 2),
        ];
        let mut store = TraceStore::new(targets, Threshold::new(100), 10, OverflowPolicy::Stop);
        assert_eq!(store.series().len(), 3);
        for _ in 0..4 {
            store
                .record_round(&[m(CacheStatus::Hit), m(CacheStatus::Miss), m(CacheStatus::Hit)])
                .unwrap();
        }
        assert_eq!(store.rounds(), 4);
        for series in store.series() {
            assert_eq!(series.len(), 4);
            let rounds: Vec<_> = series.iter().map(|s| s.round).collect();
            assert_eq!(rounds, vec![0, 1, 2, 3]);
        }
        assert_eq!(store.hit_sequence("square"), Some(vec![true; 4]));
        assert_eq!(store.hit_sequence("multiply"), Some(vec![false; 4]));
        assert_eq!(store.series_for(1, 1).unwrap().hit_count(), 4);
        assert_eq!(store.hit_sequence("reduce"), None);
    }

    #[test]
    fn store_full_round_is_not_partially_written() {
        let targets = vec![MonitoredTarget::new(0, "a", 0x1000, 2)];
        let mut store = TraceStore::new(targets, Threshold::new(100), 1, OverflowPolicy::Stop);
        store
            .record_round(&[m(CacheStatus::Hit), m(CacheStatus::Hit)])
            .unwrap();
        assert!(store
            .record_round(&[m(CacheStatus::Hit), m(CacheStatus::Hit)])
            .is_err());
        assert_eq!(store.rounds(), 1);
        assert!(store.series().iter().all(|s| s.len() == 1));
        assert!(matches!(
            store.record_round(&[m(CacheStatus::Hit)]),
            Err(SideChannelError::RoundShape {
                expected: 2,
                got: 1
            })
        ));
    }
}
