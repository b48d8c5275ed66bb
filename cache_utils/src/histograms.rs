use core::ops::{Index, IndexMut};

#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde_support")]
use serde_big_array::BigArray;

/***********
 * Structs *
 ***********/

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct SimpleBucketU64<const WIDTH: u64, const N: usize>(usize);

/// Latency histogram with `N` buckets of `WIDTH` cycles.
/// Anything at or beyond `WIDTH * N` lands in the last bucket.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct StaticHistogram<const WIDTH: u64, const N: usize> {
    #[cfg_attr(feature = "serde_support", serde(with = "BigArray"))]
    data: [u32; N],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistogramCumSumItem {
    pub count: u32,
    pub cumulative_count: u64,
}

#[derive(Debug, Clone)]
pub struct StaticHistogramCumSum<const WIDTH: u64, const N: usize> {
    data: [HistogramCumSumItem; N],
}

/***********
 *  Impls  *
 ***********/

/* Simple Bucket*/

impl<const WIDTH: u64, const N: usize> SimpleBucketU64<WIDTH, N> {
    pub const MAX: SimpleBucketU64<WIDTH, N> = Self(N - 1);
    pub const MIN: SimpleBucketU64<WIDTH, N> = Self(0);

    /// Saturating conversion, out of range times go to the last bucket.
    pub fn saturating_from(time: u64) -> Self {
        Self::try_from(time).unwrap_or(Self::MAX)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    /// Lower bound, in cycles, of the bucket.
    pub const fn time(self) -> u64 {
        self.0 as u64 * WIDTH
    }
}

impl<const WIDTH: u64, const N: usize> TryFrom<u64> for SimpleBucketU64<WIDTH, N> {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        let r = (value / WIDTH) as usize;
        if r >= N {
            Err(())
        } else {
            Ok(SimpleBucketU64::<WIDTH, N>(r))
        }
    }
}

impl<const WIDTH: u64, const N: usize> From<SimpleBucketU64<WIDTH, N>> for u64 {
    fn from(value: SimpleBucketU64<WIDTH, N>) -> Self {
        value.time()
    }
}

/* Static Histogram */
impl<const WIDTH: u64, const N: usize> StaticHistogram<WIDTH, N> {
    pub fn empty() -> Self {
        Self { data: [0; N] }
    }

    pub fn record(&mut self, time: u64) {
        let bucket = SimpleBucketU64::<WIDTH, N>::saturating_from(time);
        self.data[bucket.0] = self.data[bucket.0].saturating_add(1);
    }

    pub fn get(&self, time: u64) -> Option<&u32> {
        match SimpleBucketU64::<WIDTH, N>::try_from(time) {
            Ok(index) => Some(&self.data[index.0]),
            Err(_) => None,
        }
    }

    pub fn total(&self) -> u64 {
        self.data.iter().map(|&c| c as u64).sum()
    }

    /// Bucket holding the most samples, first one on ties.
    pub fn mode(&self) -> Option<SimpleBucketU64<WIDTH, N>> {
        let mut best: Option<(usize, u32)> = None;
        for (i, &count) in self.data.iter().enumerate() {
            if count > 0 && best.map_or(true, |(_, c)| count > c) {
                best = Some((i, count));
            }
        }
        best.map(|(i, _)| SimpleBucketU64(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = (SimpleBucketU64<WIDTH, N>, u32)> + '_ {
        self.data
            .iter()
            .enumerate()
            .map(|(i, &c)| (SimpleBucketU64(i), c))
    }

    pub fn cum_sum(&self) -> StaticHistogramCumSum<WIDTH, N> {
        StaticHistogramCumSum::from(self)
    }
}

impl<const WIDTH: u64, const N: usize> Default for StaticHistogram<WIDTH, N> {
    fn default() -> Self {
        StaticHistogram::empty()
    }
}

impl<const WIDTH: u64, const N: usize> Index<SimpleBucketU64<WIDTH, N>>
    for StaticHistogram<WIDTH, N>
{
    type Output = u32;

    fn index(&self, index: SimpleBucketU64<WIDTH, N>) -> &Self::Output {
        &self.data[index.0]
    }
}

impl<const WIDTH: u64, const N: usize> IndexMut<SimpleBucketU64<WIDTH, N>>
    for StaticHistogram<WIDTH, N>
{
    fn index_mut(&mut self, index: SimpleBucketU64<WIDTH, N>) -> &mut Self::Output {
        &mut self.data[index.0]
    }
}

/* Static Histogram Cum Sum*/
impl<const WIDTH: u64, const N: usize> StaticHistogramCumSum<WIDTH, N> {
    pub fn total(&self) -> u64 {
        self.data[N - 1].cumulative_count
    }

    /// Samples strictly below the bucket.
    pub fn below(&self, bucket: SimpleBucketU64<WIDTH, N>) -> u64 {
        let item = self.data[bucket.0];
        item.cumulative_count - item.count as u64
    }
}

impl<const WIDTH: u64, const N: usize> From<&StaticHistogram<WIDTH, N>>
    for StaticHistogramCumSum<WIDTH, N>
{
    fn from(value: &StaticHistogram<WIDTH, N>) -> Self {
        let mut cumul = 0;
        let mut r = Self {
            data: [HistogramCumSumItem::default(); N],
        };
        for (i, &count) in value.data.iter().enumerate() {
            cumul += count as u64;
            r.data[i] = HistogramCumSumItem {
                count,
                cumulative_count: cumul,
            };
        }
        r
    }
}

impl<const WIDTH: u64, const N: usize> Index<SimpleBucketU64<WIDTH, N>>
    for StaticHistogramCumSum<WIDTH, N>
{
    type Output = HistogramCumSumItem;

    fn index(&self, index: SimpleBucketU64<WIDTH, N>) -> &Self::Output {
        &self.data[index.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Hist = StaticHistogram<5, 10>;

    #[test]
    fn record_saturates_into_last_bucket() {
        let mut h = Hist::empty();
        h.record(0);
        h.record(4);
        h.record(5);
        h.record(10_000);
        assert_eq!(h.get(0), Some(&2));
        assert_eq!(h.get(5), Some(&1));
        assert_eq!(h[SimpleBucketU64::MAX], 1);
        assert_eq!(h.get(50), None);
        assert_eq!(h.total(), 4);
    }

    #[test]
    fn mode_and_cum_sum() {
        let mut h = Hist::empty();
        assert_eq!(h.mode(), None);
        for t in [12, 13, 14, 30, 31] {
            h.record(t);
        }
        let mode = h.mode().unwrap();
        assert_eq!(mode.time(), 10);
        let cs = h.cum_sum();
        assert_eq!(cs.total(), 5);
        assert_eq!(cs.below(SimpleBucketU64::try_from(30).unwrap()), 3);
        assert_eq!(cs[mode].cumulative_count, 3);
    }
}
