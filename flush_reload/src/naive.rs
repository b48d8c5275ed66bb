use cache_side_channel::{Measurement, SingleAddrCacheSideChannel, Threshold};
use cache_utils::calibration::only_reload;
use cache_utils::flush;

/// Flush+Reload on single addresses with one fixed threshold.
#[derive(Debug)]
pub struct NaiveFlushAndReload {
    pub threshold: Threshold,
    /// Flush the line after timing it so the next round starts cold.
    pub flush_after: bool,
}

impl NaiveFlushAndReload {
    pub fn from_threshold(threshold: u64) -> Self {
        NaiveFlushAndReload {
            threshold: Threshold::new(threshold),
            flush_after: true,
        }
    }

    /// fence, counter, one byte load, fence, counter; then flush.
    ///
    /// # Safety
    ///
    /// addr must be a valid pointer to read.
    pub unsafe fn probe(&self, addr: *const u8) -> Measurement {
        let t = unsafe { only_reload(addr) };
        if self.flush_after {
            unsafe { flush(addr) };
        }
        Measurement {
            latency: t,
            status: self.threshold.classify(t),
        }
    }
}

impl SingleAddrCacheSideChannel for NaiveFlushAndReload {
    /// # Safety:
    ///
    /// addr needs to be a valid pointer
    unsafe fn prepare_single(&mut self, addr: *const u8) {
        unsafe { flush(addr) };
    }

    /// # Safety
    ///
    /// addr needs to be a valid pointer
    unsafe fn test_single(&mut self, addr: *const u8) -> Measurement {
        unsafe { self.probe(addr) }
    }

    fn threshold(&self) -> Threshold {
        self.threshold
    }
}
