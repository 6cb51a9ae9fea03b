//! Thread Placement and Cycle-Accurate Timing
//!
//! Core pinning for the shard threads and the spin-wait pacer used by the
//! packet sender. All hot-path waits are explicit spins; the only OS
//! interaction here is the one-time affinity call after spawn.

use std::time::Instant;

use tracing::{debug, warn};

use crate::types::ThreadType;

/// Pin the calling thread to core `core_offset + tid`.
///
/// Placement follows the shard layout: the master sits at `core_offset`, RX
/// shards directly above it, workers above those. Callers fold the group
/// base into `core_offset`. Pinning failures are logged, not fatal; the
/// thread keeps running unpinned.
pub fn pin_to_core_with_offset(role: ThreadType, core_offset: usize, tid: usize) {
    let wanted = core_offset + tid;
    let Some(cores) = core_affinity::get_core_ids() else {
        warn!("{role} thread {tid}: cannot enumerate cores, running unpinned");
        return;
    };
    let core = cores[wanted % cores.len()];
    if core_affinity::set_for_current(core) {
        debug!("{role} thread {tid}: pinned to core {}", core.id);
    } else {
        warn!("{role} thread {tid}: failed to pin to core {}", core.id);
    }
}

/// Read the CPU cycle counter.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtsc() -> u64 {
    // SAFETY: RDTSC has no memory effects.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Monotonic nanosecond fallback for targets without a cycle counter; the
/// tick budgets are mapped through the measured frequency either way.
#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtsc() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Measure the cycle-counter frequency in GHz against the OS clock.
pub fn measure_rdtsc_freq() -> f64 {
    let wall = Instant::now();
    let start = rdtsc();
    while wall.elapsed().as_millis() < 10 {
        std::hint::spin_loop();
    }
    let cycles = rdtsc().wrapping_sub(start);
    cycles as f64 / wall.elapsed().as_nanos() as f64
}

/// Microseconds since an arbitrary process-wide epoch, for stats output.
pub fn get_time_us() -> f64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64() * 1e6
}

/// Cycle-counter pacer: converts microsecond budgets to ticks and burns
/// them with a spin wait.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    freq_ghz: f64,
}

impl Pacer {
    pub fn new(freq_ghz: f64) -> Self {
        Pacer { freq_ghz }
    }

    /// Measure the host frequency and build a pacer from it.
    pub fn calibrated() -> Self {
        Self::new(measure_rdtsc_freq())
    }

    pub fn freq_ghz(&self) -> f64 {
        self.freq_ghz
    }

    #[inline(always)]
    pub fn now(&self) -> u64 {
        rdtsc()
    }

    /// Ticks corresponding to `us` microseconds.
    pub fn us_to_ticks(&self, us: f64) -> u64 {
        (us * self.freq_ghz * 1e3) as u64
    }

    /// Spin until `ticks` have elapsed past `start`.
    #[inline]
    pub fn wait_until(&self, start: u64, ticks: u64) {
        while rdtsc().wrapping_sub(start) < ticks {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdtsc_monotonic() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn test_pacer_tick_conversion() {
        let pacer = Pacer::new(2.0);
        assert_eq!(pacer.us_to_ticks(1.0), 2000);
        assert_eq!(pacer.us_to_ticks(500.0), 1_000_000);
    }

    #[test]
    fn test_pacer_waits_at_least_budget() {
        let pacer = Pacer::calibrated();
        let budget = pacer.us_to_ticks(200.0);
        let start = pacer.now();
        pacer.wait_until(start, budget);
        assert!(pacer.now().wrapping_sub(start) >= budget);
    }
}
