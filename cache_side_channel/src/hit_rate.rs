//! Cumulative and windowed hit rates.
//!
//! Everything here is derived from the time series and can be recomputed at
//! any point of a run, including over a partial capture.

use crate::target::ProbePoint;
use crate::time_series::{TimeSeries, TimingSample};
use crate::{CacheStatus, Threshold};

use num_rational::Rational64;
#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Below this rate on every point, or above the high one, the threshold is
/// most likely wrong rather than the victim idle or saturating.
pub const DEGENERATE_LOW_RATE: f64 = 0.001;
pub const DEGENERATE_HIGH_RATE: f64 = 0.999;

/// Probe points hit more often than this are flagged active in reports.
pub const ACTIVE_RATE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct HitWindow {
    pub point: ProbePoint,
    /// First round of the window.
    pub start_round: u64,
    /// One past the last round of the window.
    pub end_round: u64,
    pub hits: u64,
    pub rounds: u64,
}

impl HitWindow {
    /// Zero when the window is empty.
    pub fn rate(&self) -> f64 {
        if self.rounds == 0 {
            0.0
        } else {
            self.hits as f64 / self.rounds as f64
        }
    }

    pub fn ratio(&self) -> Option<Rational64> {
        if self.rounds == 0 {
            None
        } else {
            Some(Rational64::new(self.hits as i64, self.rounds as i64))
        }
    }
}

fn window_of<'a>(
    series: &'a TimeSeries,
    samples: impl Iterator<Item = &'a TimingSample>,
) -> HitWindow {
    let mut w = HitWindow {
        point: *series.point(),
        start_round: 0,
        end_round: 0,
        hits: 0,
        rounds: 0,
    };
    for (i, s) in samples.enumerate() {
        if i == 0 {
            w.start_round = s.round;
        }
        w.end_round = s.round + 1;
        w.rounds += 1;
        if s.is_hit() {
            w.hits += 1;
        }
    }
    w
}

/// Window over every sample held by the series.
pub fn cumulative_window(series: &TimeSeries) -> HitWindow {
    window_of(series, series.iter())
}

/// Window over the last `w` samples, or fewer while the series is shorter.
pub fn last_window(series: &TimeSeries, w: usize) -> HitWindow {
    let skip = series.len().saturating_sub(w);
    window_of(series, series.iter().skip(skip))
}

/// hits / rounds so far.
pub fn cumulative_rate(series: &TimeSeries) -> f64 {
    cumulative_window(series).rate()
}

/// hits in the last `w` rounds / min(w, rounds so far).
pub fn windowed_rate(series: &TimeSeries, w: usize) -> f64 {
    last_window(series, w).rate()
}

/// Consecutive non-overlapping windows of `w` rounds; the last may be shorter.
pub fn tumbling_windows(series: &TimeSeries, w: usize) -> Vec<HitWindow> {
    if w == 0 {
        return Vec::new();
    }
    let samples: Vec<_> = series.iter().collect();
    samples
        .chunks(w)
        .map(|chunk| window_of(series, chunk.iter().copied()))
        .collect()
}

#[derive(Debug, Clone, Default)]
struct PointCounter {
    hits: u64,
    rounds: u64,
    recent: VecDeque<bool>,
    recent_hits: u64,
}

/// Running per point counters fed one round at a time, for progress reports
/// during sampling without rescanning the series.
#[derive(Debug, Clone)]
pub struct HitRateAggregator {
    window: usize,
    points: Vec<PointCounter>,
}

impl HitRateAggregator {
    pub fn new(points: usize, window: usize) -> Self {
        HitRateAggregator {
            window,
            points: vec![PointCounter::default(); points],
        }
    }

    pub fn observe_round(&mut self, statuses: impl IntoIterator<Item = CacheStatus>) {
        for (counter, status) in self.points.iter_mut().zip(statuses) {
            let hit = status.is_hit();
            counter.rounds += 1;
            counter.hits += hit as u64;
            if self.window == 0 {
                continue;
            }
            if counter.recent.len() == self.window {
                if let Some(true) = counter.recent.pop_front() {
                    counter.recent_hits -= 1;
                }
            }
            counter.recent.push_back(hit);
            counter.recent_hits += hit as u64;
        }
    }

    pub fn rounds(&self, point: usize) -> u64 {
        self.points.get(point).map_or(0, |c| c.rounds)
    }

    pub fn hits(&self, point: usize) -> u64 {
        self.points.get(point).map_or(0, |c| c.hits)
    }

    pub fn cumulative_rate(&self, point: usize) -> f64 {
        match self.points.get(point) {
            Some(c) if c.rounds > 0 => c.hits as f64 / c.rounds as f64,
            _ => 0.0,
        }
    }

    pub fn windowed_rate(&self, point: usize) -> f64 {
        match self.points.get(point) {
            Some(c) if !c.recent.is_empty() => c.recent_hits as f64 / c.recent.len() as f64,
            _ => 0.0,
        }
    }

    pub fn window_hits(&self, point: usize) -> u64 {
        self.points.get(point).map_or(0, |c| c.recent_hits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde_support",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum DegenerateKind {
    AllMiss,
    AllHit,
}

/// The threshold classifies (almost) everything the same way on every point.
/// Reported, never fatal: the operator has to re-tune the threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct DegenerateCalibration {
    pub kind: DegenerateKind,
    pub threshold: Threshold,
    pub mean_rate: f64,
}

pub fn check_calibration(rates: &[f64], threshold: Threshold) -> Option<DegenerateCalibration> {
    if rates.is_empty() {
        return None;
    }
    let mean_rate = rates.iter().sum::<f64>() / rates.len() as f64;
    let kind = if rates.iter().all(|&r| r <= DEGENERATE_LOW_RATE) {
        DegenerateKind::AllMiss
    } else if rates.iter().all(|&r| r >= DEGENERATE_HIGH_RATE) {
        DegenerateKind::AllHit
    } else {
        return None;
    };
    Some(DegenerateCalibration {
        kind,
        threshold,
        mean_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_series::OverflowPolicy;

    fn series(hits: &[bool]) -> TimeSeries {
        let point = ProbePoint {
            target: 0,
            line: 0,
            address: 0x1000,
        };
        let mut s = TimeSeries::new(point, 1024, OverflowPolicy::Stop);
        for (round, &hit) in hits.iter().enumerate() {
            s.push(TimingSample {
                target: 0,
                round: round as u64,
                latency: 0,
                status: if hit { CacheStatus::Hit } else { CacheStatus::Miss },
            })
            .unwrap();
        }
        s
    }

    #[test]
    fn empty_series_rates_are_zero() {
        let s = series(&[]);
        assert_eq!(cumulative_rate(&s), 0.0);
        assert_eq!(windowed_rate(&s, 10), 0.0);
        assert_eq!(cumulative_window(&s).ratio(), None);
    }

    #[test]
    fn partial_window_uses_rounds_so_far() {
        let s = series(&[true, false, true]);
        // W = 10 but only 3 rounds: 2 / 3
        assert!((windowed_rate(&s, 10) - 2.0 / 3.0).abs() < 1e-12);
        for n in 0..10 {
            let prefix = series(&vec![true; n]);
            let expected = if n == 0 { 0.0 } else { 1.0 };
            assert_eq!(windowed_rate(&prefix, 10), expected);
        }
    }

    #[test]
    fn full_window_only_counts_last_rounds() {
        let s = series(&[true, true, true, false, false, true]);
        let w = last_window(&s, 4);
        assert_eq!(w.start_round, 2);
        assert_eq!(w.end_round, 6);
        assert_eq!(w.hits, 2);
        assert_eq!(w.ratio(), Some(Rational64::new(1, 2)));
        assert!((cumulative_rate(&s) - 4.0 / 6.0).abs() < 1e-12);
        assert_eq!(windowed_rate(&s, 0), 0.0);
    }

    #[test]
    fn tumbling_windows_cover_series() {
        let s = series(&[true, false, true, true, false]);
        let windows = tumbling_windows(&s, 2);
        let hits: Vec<_> = windows.iter().map(|w| (w.hits, w.rounds)).collect();
        assert_eq!(hits, vec![(1, 2), (2, 2), (0, 1)]);
        assert_eq!(windows[2].start_round, 4);
    }

    #[test]
    fn aggregator_matches_series_functions() {
        let pattern = [true, false, false, true, true, false, true];
        let s = series(&pattern);
        let mut agg = HitRateAggregator::new(1, 3);
        assert_eq!(agg.cumulative_rate(0), 0.0);
        assert_eq!(agg.windowed_rate(0), 0.0);
        for &hit in &pattern {
            agg.observe_round([if hit { CacheStatus::Hit } else { CacheStatus::Miss }]);
        }
        assert_eq!(agg.rounds(0), 7);
        assert_eq!(agg.hits(0), 4);
        assert!((agg.cumulative_rate(0) - cumulative_rate(&s)).abs() < 1e-12);
        assert!((agg.windowed_rate(0) - windowed_rate(&s, 3)).abs() < 1e-12);
        assert_eq!(agg.window_hits(0), 2);
        assert_eq!(agg.cumulative_rate(5), 0.0);
    }

    #[test]
    fn degenerate_calibration_detection() {
        let t = Threshold::new(165);
        assert_eq!(check_calibration(&[], t), None);
        assert_eq!(check_calibration(&[0.02, 0.0], t), None);
        let low = check_calibration(&[0.0, 0.0005], t).unwrap();
        assert_eq!(low.kind, DegenerateKind::AllMiss);
        let high = check_calibration(&[1.0, 0.9995], t).unwrap();
        assert_eq!(high.kind, DegenerateKind::AllHit);
        assert_eq!(high.threshold, t);
    }
}
