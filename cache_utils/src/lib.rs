#![deny(unsafe_op_in_unsafe_fn)]

use static_assertions::const_assert;

pub mod calibration;
pub mod histograms;
pub mod mmap;

#[cfg(target_arch = "x86_64")]
use core::arch::x86_64 as arch_x86;
use core::ptr;

pub const CACHE_LINE_SIZE: usize = 64;
const_assert!(CACHE_LINE_SIZE.is_power_of_two());

/// Where cycle counts come from on this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterSource {
    /// Hardware time stamp counter.
    Tsc,
    /// Nanoseconds since a process-wide monotonic origin. Coarser, thresholds
    /// calibrated against the TSC do not carry over.
    MonotonicClock,
}

#[cfg(target_arch = "x86_64")]
pub const COUNTER_SOURCE: CounterSource = CounterSource::Tsc;
#[cfg(not(target_arch = "x86_64"))]
pub const COUNTER_SOURCE: CounterSource = CounterSource::MonotonicClock;

#[cfg(not(target_arch = "x86_64"))]
lazy_static::lazy_static! {
    static ref CLOCK_ORIGIN: std::time::Instant = std::time::Instant::now();
}

/// Serializing fence: no load, store or instruction crosses it.
#[inline(always)]
pub fn fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        arch_x86::_mm_mfence();
        arch_x86::_mm_lfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

// rdtsc no fence
#[inline(always)]
pub fn rdtsc_nofence() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        arch_x86::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        CLOCK_ORIGIN.elapsed().as_nanos() as u64
    }
}

// rdtsc (has fences before and after)
#[inline(always)]
pub fn rdtsc_fence() -> u64 {
    fence();
    let tsc: u64 = rdtsc_nofence();
    fence();
    tsc
}

/// # Safety
///
/// p must be valid for a read of one `T`.
#[inline(always)]
pub unsafe fn maccess<T>(p: *const T) {
    unsafe { ptr::read_volatile(p) };
}

// flush (clflush)
/// # Safety
///
/// p must point into mapped memory.
#[inline(always)]
pub unsafe fn flush(p: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        arch_x86::_mm_clflush(p)
    };
    #[cfg(not(target_arch = "x86_64"))]
    {
        // No unprivileged line flush here; eviction degrades to a no-op.
        let _ = p;
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
    }
}
