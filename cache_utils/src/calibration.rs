use crate::histograms::{SimpleBucketU64, StaticHistogram, StaticHistogramCumSum};
use crate::{flush, maccess, rdtsc_fence, CACHE_LINE_SIZE};

use log::{debug, info};
#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};

/// # Safety
///
/// p must be valid for reads.
#[inline(always)]
pub unsafe fn only_reload(p: *const u8) -> u64 {
    let t = rdtsc_fence();
    unsafe { maccess(p) };
    rdtsc_fence() - t
}

/// # Safety
///
/// p must be valid for reads.
#[inline(always)]
pub unsafe fn flush_and_reload(p: *const u8) -> u64 {
    unsafe { flush(p) };
    let t = rdtsc_fence();
    unsafe { maccess(p) };
    rdtsc_fence() - t
}

pub const CALIBRATION_BUCKET_SIZE: u64 = 2;
pub const CALIBRATION_BUCKET_NUMBER: usize = 512;
pub const CALIBRATION_WARMUP_ITER: u32 = 1 << 10;

pub type LatencyHistogram = StaticHistogram<CALIBRATION_BUCKET_SIZE, CALIBRATION_BUCKET_NUMBER>;
type LatencyBucket = SimpleBucketU64<CALIBRATION_BUCKET_SIZE, CALIBRATION_BUCKET_NUMBER>;

/// Result of a calibration pass: hit and miss latency distributions and the
/// threshold that best separates them. A latency strictly below `threshold`
/// is a hit.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct CalibrationProfile {
    pub threshold: u64,
    pub sample_count: u64,
    pub hit: LatencyHistogram,
    pub miss: LatencyHistogram,
}

impl CalibrationProfile {
    /// Builds a profile from already collected histograms.
    /// Returns `None` when either distribution is empty.
    pub fn from_histograms(hit: LatencyHistogram, miss: LatencyHistogram) -> Option<Self> {
        let threshold = best_threshold(&hit, &miss)?;
        Some(CalibrationProfile {
            threshold,
            sample_count: hit.total() + miss.total(),
            hit,
            miss,
        })
    }

    /// Fraction of hit samples classified as hits.
    pub fn hit_accuracy(&self) -> f64 {
        let cs = self.hit.cum_sum();
        ratio(below_time(&cs, self.threshold), cs.total())
    }

    /// Fraction of miss samples classified as misses.
    pub fn miss_accuracy(&self) -> f64 {
        let cs = self.miss.cum_sum();
        ratio(cs.total() - below_time(&cs, self.threshold), cs.total())
    }

    pub fn error_rate(&self) -> f64 {
        let hit = self.hit.cum_sum();
        let miss = self.miss.cum_sum();
        let errors = (hit.total() - below_time(&hit, self.threshold))
            + below_time(&miss, self.threshold);
        ratio(errors, hit.total() + miss.total())
    }

    /// False when the threshold does not split the two distributions, in which
    /// case nearly every probe classifies the same way.
    pub fn separates(&self) -> bool {
        self.hit_accuracy() > 0.5 && self.miss_accuracy() > 0.5
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn below_time(
    cs: &StaticHistogramCumSum<CALIBRATION_BUCKET_SIZE, CALIBRATION_BUCKET_NUMBER>,
    threshold: u64,
) -> u64 {
    match LatencyBucket::try_from(threshold) {
        Ok(bucket) => cs.below(bucket),
        Err(_) => cs.total(),
    }
}

/// Threshold minimising misclassifications (hits at or above it plus misses
/// below it). Among equally good candidates, the median one is kept.
pub fn best_threshold(hit: &LatencyHistogram, miss: &LatencyHistogram) -> Option<u64> {
    let hit_cs = hit.cum_sum();
    let miss_cs = miss.cum_sum();
    let hit_total = hit_cs.total();
    let miss_total = miss_cs.total();
    if hit_total == 0 || miss_total == 0 {
        return None;
    }

    let mut min_error = u64::MAX;
    let mut candidates = Vec::new();
    for i in 1..CALIBRATION_BUCKET_NUMBER {
        let bucket = LatencyBucket::saturating_from(i as u64 * CALIBRATION_BUCKET_SIZE);
        let error = (hit_total - hit_cs.below(bucket)) + miss_cs.below(bucket);
        if error < min_error {
            min_error = error;
            candidates.clear();
        }
        if error == min_error {
            candidates.push(bucket.time());
        }
    }
    let index = (candidates.len() - 1) / 2;
    Some(candidates[index])
}

/// Measures reload latency of cached and flushed lines of `array` and derives
/// a hit/miss threshold.
///
/// `array` should be at least one cache line long and not shared with anything
/// else running concurrently.
pub fn calibrate_access(array: &[u8], iterations: u32) -> Option<CalibrationProfile> {
    if array.is_empty() {
        return None;
    }
    info!("Calibrating reload threshold over {} lines...", lines_in(array));

    let pointer = array.as_ptr();
    let lines = lines_in(array);
    let line = |i: u32| unsafe { pointer.add((i as usize % lines) * CACHE_LINE_SIZE) };

    let mut hit = LatencyHistogram::empty();
    let mut miss = LatencyHistogram::empty();

    for i in 0..CALIBRATION_WARMUP_ITER {
        unsafe { only_reload(line(i)) };
    }

    // do a large sample of accesses to a cached line
    for i in 0..iterations {
        let p = line(i);
        unsafe { maccess(p) };
        hit.record(unsafe { only_reload(p) });
    }

    // do a large number of accesses to an uncached line
    for i in 0..iterations {
        miss.record(unsafe { flush_and_reload(line(i)) });
    }

    let profile = CalibrationProfile::from_histograms(hit, miss)?;
    debug!(
        "hit mode {:?}, miss mode {:?}",
        profile.hit.mode().map(u64::from),
        profile.miss.mode().map(u64::from)
    );
    info!(
        "Threshold {} (error rate {:.4})",
        profile.threshold,
        profile.error_rate()
    );
    Some(profile)
}

fn lines_in(array: &[u8]) -> usize {
    array.len().div_ceil(CACHE_LINE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram(samples: &[(u64, u32)]) -> LatencyHistogram {
        let mut h = LatencyHistogram::empty();
        for &(time, count) in samples {
            for _ in 0..count {
                h.record(time);
            }
        }
        h
    }

    #[test]
    fn threshold_between_separated_distributions() {
        let hit = histogram(&[(40, 100), (44, 50)]);
        let miss = histogram(&[(200, 100), (210, 30)]);
        let t = best_threshold(&hit, &miss).unwrap();
        assert!(t > 44 && t <= 200, "threshold {}", t);
        let profile = CalibrationProfile::from_histograms(hit, miss).unwrap();
        assert_eq!(profile.sample_count, 280);
        assert_eq!(profile.error_rate(), 0.0);
        assert!(profile.separates());
    }

    #[test]
    fn overlapping_distributions_minimise_errors() {
        let hit = histogram(&[(50, 90), (120, 10)]);
        let miss = histogram(&[(60, 5), (150, 95)]);
        let profile = CalibrationProfile::from_histograms(hit, miss).unwrap();
        // Misreading the five fast misses costs less than the ten slow hits.
        assert!(profile.threshold > 120 && profile.threshold <= 150);
        assert!((profile.error_rate() - 5.0 / 200.0).abs() < 1e-9);
    }

    #[test]
    fn empty_distribution_has_no_threshold() {
        let hit = histogram(&[(40, 10)]);
        assert_eq!(best_threshold(&hit, &LatencyHistogram::empty()), None);
    }

    #[test]
    fn inverted_distributions_do_not_separate() {
        // Everything lands in the same bucket, the threshold cannot split it.
        let hit = histogram(&[(100, 10)]);
        let miss = histogram(&[(100, 10)]);
        let profile = CalibrationProfile::from_histograms(hit, miss).unwrap();
        assert!(!profile.separates());
    }

    #[test]
    fn calibrate_own_buffer() {
        let buffer = vec![1u8; 16 * CACHE_LINE_SIZE];
        let profile = calibrate_access(&buffer, 2000).unwrap();
        assert_eq!(profile.sample_count, 4000);
        assert!(calibrate_access(&[], 10).is_none());
    }
}
