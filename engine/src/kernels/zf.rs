//! Channel Estimation and Zero-Forcing Inversion
//!
//! Per-subcarrier kernels: least-squares CSI from the known pilot sequence
//! and the pseudoinverse of the CSI matrix used as the equalization
//! precoder. The pseudoinverse is computed directly from the normal
//! equations, `W = (Hᴴ H)⁻¹ Hᴴ`, with Gauss–Jordan elimination of the
//! small user-by-user Gram matrix.

use ndarray::{Array2, ArrayView2};
use num_complex::Complex32;

/// Condition estimate above which a subcarrier is reported as
/// numerically unstable. Equalization proceeds regardless.
pub const ZF_CONDITION_LIMIT: f32 = 1.0e3;

/// Diagonal loading applied when the Gram matrix is singular.
const REGULARIZATION: f32 = 1.0e-3;

/// Channel estimate for one user: received pilot divided by the known
/// pilot, elementwise over subcarriers.
pub fn csi_from_pilot(rx: &[Complex32], pilot: &[Complex32], out: &mut [Complex32]) {
    debug_assert_eq!(rx.len(), out.len());
    for ((h, &y), &p) in out.iter_mut().zip(rx).zip(pilot) {
        *h = y / p;
    }
}

/// Result of a per-subcarrier precoder inversion.
pub struct Precoder {
    /// Users-by-antennas equalization matrix.
    pub w: Array2<Complex32>,
    /// Diagonal-ratio condition estimate of `Hᴴ H`.
    pub condition: f32,
    /// True when [`ZF_CONDITION_LIMIT`] was exceeded or regularization was
    /// needed.
    pub flagged: bool,
}

/// Invert one antennas-by-users CSI matrix into its zero-forcing precoder.
pub fn compute_precoder(h: ArrayView2<'_, Complex32>) -> Precoder {
    let ants = h.nrows();
    let users = h.ncols();
    debug_assert!(ants >= users);

    // Gram matrix G = H^H H and its condition estimate from the diagonal.
    let mut gram = Array2::<Complex32>::zeros((users, users));
    for i in 0..users {
        for j in 0..users {
            let mut acc = Complex32::default();
            for a in 0..ants {
                acc += h[(a, i)].conj() * h[(a, j)];
            }
            gram[(i, j)] = acc;
        }
    }
    let diag: Vec<f32> = (0..users).map(|i| gram[(i, i)].re).collect();
    let max_d = diag.iter().cloned().fold(f32::MIN, f32::max);
    let min_d = diag.iter().cloned().fold(f32::MAX, f32::min);
    let condition = if min_d > 1.0e-30 {
        (max_d / min_d).sqrt()
    } else {
        f32::INFINITY
    };

    let mut flagged = condition > ZF_CONDITION_LIMIT;
    let inv = match invert(gram.clone()) {
        Some(inv) => inv,
        None => {
            // Singular Gram matrix: retry with diagonal loading.
            flagged = true;
            let loading = REGULARIZATION * max_d.max(1.0);
            for i in 0..users {
                gram[(i, i)] += Complex32::new(loading, 0.0);
            }
            invert(gram).unwrap_or_else(|| Array2::eye(users))
        }
    };

    // W = G^-1 H^H.
    let mut w = Array2::<Complex32>::zeros((users, ants));
    for u in 0..users {
        for a in 0..ants {
            let mut acc = Complex32::default();
            for k in 0..users {
                acc += inv[(u, k)] * h[(a, k)].conj();
            }
            w[(u, a)] = acc;
        }
    }
    Precoder {
        w,
        condition,
        flagged,
    }
}

/// Gauss–Jordan inversion with partial pivoting. Returns `None` when a
/// pivot vanishes.
fn invert(mut m: Array2<Complex32>) -> Option<Array2<Complex32>> {
    let n = m.nrows();
    let mut inv = Array2::<Complex32>::eye(n);
    for col in 0..n {
        let pivot_row = (col..n).max_by(|&a, &b| {
            m[(a, col)]
                .norm_sqr()
                .total_cmp(&m[(b, col)].norm_sqr())
        })?;
        if m[(pivot_row, col)].norm_sqr() < 1.0e-20 {
            return None;
        }
        if pivot_row != col {
            for j in 0..n {
                m.swap((pivot_row, j), (col, j));
                inv.swap((pivot_row, j), (col, j));
            }
        }
        let pivot = m[(col, col)];
        for j in 0..n {
            m[(col, j)] /= pivot;
            inv[(col, j)] /= pivot;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = m[(row, col)];
            if factor.norm_sqr() == 0.0 {
                continue;
            }
            for j in 0..n {
                let mj = m[(col, j)];
                let ij = inv[(col, j)];
                m[(row, j)] -= factor * mj;
                inv[(row, j)] -= factor * ij;
            }
        }
    }
    Some(inv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_csi(rng: &mut StdRng, ants: usize, users: usize) -> Array2<Complex32> {
        Array2::from_shape_fn((ants, users), |_| {
            Complex32::new(rng.gen::<f32>() * 2.0 - 1.0, rng.gen::<f32>() * 2.0 - 1.0)
        })
    }

    #[test]
    fn test_csi_from_pilot_recovers_channel() {
        let pilot: Vec<Complex32> = (0..8)
            .map(|i| Complex32::new(if i % 2 == 0 { 1.0 } else { -1.0 }, 0.0))
            .collect();
        let h = Complex32::new(0.3, -0.7);
        let rx: Vec<Complex32> = pilot.iter().map(|&p| p * h).collect();
        let mut est = vec![Complex32::default(); 8];
        csi_from_pilot(&rx, &pilot, &mut est);
        for e in est {
            assert!((e - h).norm() < 1e-6);
        }
    }

    #[test]
    fn test_precoder_inverts_channel() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..16 {
            let h = random_csi(&mut rng, 16, 4);
            let p = compute_precoder(h.view());
            assert!(!p.flagged, "random 16x4 CSI should be well conditioned");

            // W H must be close to the identity.
            let wh = p.w.dot(&h);
            for i in 0..4 {
                for j in 0..4 {
                    let expect = if i == j { 1.0 } else { 0.0 };
                    let err = (wh[(i, j)] - Complex32::new(expect, 0.0)).norm();
                    assert!(err < 1e-3, "({i},{j}): {}", wh[(i, j)]);
                }
            }
        }
    }

    #[test]
    fn test_singular_csi_is_flagged() {
        // Two identical users: rank-deficient Gram matrix.
        let mut rng = StdRng::seed_from_u64(1);
        let mut h = random_csi(&mut rng, 8, 2);
        for a in 0..8 {
            let v = h[(a, 0)];
            h[(a, 1)] = v;
        }
        let p = compute_precoder(h.view());
        assert!(p.flagged);
        assert_eq!(p.w.nrows(), 2);
        assert_eq!(p.w.ncols(), 8);
    }
}
