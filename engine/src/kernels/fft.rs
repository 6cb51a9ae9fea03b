//! FFT/IFFT Adapter
//!
//! Cache-aware wrapper over the `rustfft` plans plus the int16 boundary
//! conversions and cyclic-prefix handling. Each worker owns one engine;
//! plans are built once and reused for every symbol.

use std::sync::Arc;

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

/// Scale between wire int16 samples and unit-range floats.
pub const SAMPLE_SCALE: f32 = 32768.0;

/// Per-worker FFT state: forward and inverse plans of one size plus the
/// shared scratch allocation.
pub struct FftEngine {
    size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex32>,
}

impl FftEngine {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        FftEngine {
            size,
            forward,
            inverse,
            scratch: vec![Complex32::default(); scratch_len],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// In-place forward transform, no normalization.
    pub fn run_forward(&mut self, buf: &mut [Complex32]) {
        debug_assert_eq!(buf.len(), self.size);
        self.forward.process_with_scratch(buf, &mut self.scratch);
    }

    /// In-place inverse transform with 1/N normalization, so
    /// `run_forward` followed by `run_inverse` is the identity.
    pub fn run_inverse(&mut self, buf: &mut [Complex32]) {
        debug_assert_eq!(buf.len(), self.size);
        self.inverse.process_with_scratch(buf, &mut self.scratch);
        let scale = 1.0 / self.size as f32;
        for x in buf.iter_mut() {
            *x *= scale;
        }
    }
}

/// Convert interleaved int16 I/Q to complex floats, skipping `cp_len`
/// leading samples (cyclic-prefix removal).
pub fn int16_to_complex(samples: &[i16], cp_len: usize, out: &mut [Complex32]) {
    let body = &samples[2 * cp_len..];
    debug_assert_eq!(body.len(), 2 * out.len());
    for (x, pair) in out.iter_mut().zip(body.chunks_exact(2)) {
        *x = Complex32::new(
            pair[0] as f32 / SAMPLE_SCALE,
            pair[1] as f32 / SAMPLE_SCALE,
        );
    }
}

/// Convert complex floats to interleaved int16 I/Q with `cp_len` samples of
/// cyclic prefix prepended (a copy of the symbol tail).
pub fn complex_to_int16(iq: &[Complex32], cp_len: usize, out: &mut [i16]) {
    debug_assert_eq!(out.len(), 2 * (cp_len + iq.len()));
    let quant = |v: f32| (v * SAMPLE_SCALE).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    let tail = iq.len() - cp_len;
    for (i, x) in iq[tail..].iter().chain(iq.iter()).enumerate() {
        out[2 * i] = quant(x.re);
        out[2 * i + 1] = quant(x.im);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_tone() {
        let n = 64;
        let mut engine = FftEngine::new(n);
        let mut buf: Vec<Complex32> = (0..n)
            .map(|t| {
                let phase = 2.0 * std::f32::consts::PI * 5.0 * t as f32 / n as f32;
                Complex32::new(phase.cos(), phase.sin())
            })
            .collect();
        engine.run_forward(&mut buf);
        for (k, x) in buf.iter().enumerate() {
            let expect = if k == 5 { n as f32 } else { 0.0 };
            assert!((x.norm() - expect).abs() < 1e-3, "bin {k}: {x}");
        }
    }

    #[test]
    fn test_forward_inverse_roundtrip() {
        let n = 256;
        let mut engine = FftEngine::new(n);
        let orig: Vec<Complex32> = (0..n)
            .map(|i| Complex32::new((i as f32 * 0.37).sin(), (i as f32 * 0.11).cos()))
            .collect();
        let mut buf = orig.clone();
        engine.run_forward(&mut buf);
        engine.run_inverse(&mut buf);
        for (a, b) in orig.iter().zip(&buf) {
            assert!((a - b).norm() < 1e-4);
        }
    }

    #[test]
    fn test_cyclic_prefix_roundtrip() {
        let n = 32;
        let cp = 8;
        let iq: Vec<Complex32> = (0..n)
            .map(|i| Complex32::new(i as f32 / 64.0, -(i as f32) / 128.0))
            .collect();
        let mut wire = vec![0i16; 2 * (cp + n)];
        complex_to_int16(&iq, cp, &mut wire);

        // Prefix equals the symbol tail.
        assert_eq!(&wire[..2 * cp], &wire[2 * n..]);

        let mut back = vec![Complex32::default(); n];
        int16_to_complex(&wire, cp, &mut back);
        for (a, b) in iq.iter().zip(&back) {
            assert!((a - b).norm() < 1e-3);
        }
    }
}
