//! Equalization
//!
//! Per-subcarrier complex GEMV `x̂ = W · y`: the zero-forcing precoder row
//! for each user against the antenna vector of one subcarrier. The antenna
//! vector is gathered from the per-antenna frequency-domain windows into a
//! cache-line-friendly scratch first, mirroring the partial-transpose walk
//! of the demodulation stage.

use num_complex::Complex32;

/// Gather subcarrier `sc` across all antenna windows.
#[inline]
pub fn gather_sc(ant_windows: &[&[Complex32]], sc: usize, out: &mut [Complex32]) {
    debug_assert_eq!(ant_windows.len(), out.len());
    for (dst, win) in out.iter_mut().zip(ant_windows) {
        *dst = win[sc];
    }
}

/// One equalization: `w` is the users-by-antennas precoder in row-major
/// order, `y` the received antenna vector, `out` the per-user estimates.
#[inline]
pub fn equalize(w: &[Complex32], y: &[Complex32], out: &mut [Complex32]) {
    let ants = y.len();
    debug_assert_eq!(w.len(), out.len() * ants);
    for (u, x) in out.iter_mut().enumerate() {
        let row = &w[u * ants..(u + 1) * ants];
        let mut acc = Complex32::default();
        for (&wk, &yk) in row.iter().zip(y) {
            acc += wk * yk;
        }
        *x = acc;
    }
}
