//! Kernel Adapters
//!
//! Thin, allocation-free wrappers over the numeric kernels the worker
//! shards invoke: FFT/IFFT, channel estimation and zero-forcing inversion,
//! equalization, constellation mapping, and LDPC coding. Workers own the
//! per-thread state (plans, scratch, code instances); these modules hold
//! the pure math.

pub mod demul;
pub mod fft;
pub mod ldpc;
pub mod modulation;
pub mod zf;

#[cfg(test)]
mod loopback_tests {
    //! Single-frame uplink loopback over the full numeric chain:
    //! bits → LDPC → modulation → channel → ZF → demod → LDPC decode.

    use super::demul::equalize;
    use super::ldpc::LdpcCode;
    use super::modulation::{adapt_bits_for_mod, demod_soft_single, init_modulation_table, mod_single};
    use super::zf::{compute_precoder, csi_from_pilot};
    use common::config::LdpcConfig;
    use ndarray::Array2;
    use num_complex::Complex32;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, StandardNormal};

    #[test]
    fn test_single_frame_loopback_30db() {
        let (ants, users) = (16usize, 4usize);
        let ofdm_data_num = 1200usize;
        let mod_bits = 4usize;
        let noise_level = 0.0316f32;
        let ldpc = LdpcConfig {
            bg: 1,
            zc: 72,
            n_rows: 46,
            cb_len: 1056,
            cb_codew_len: 4224,
            decoder_iter: 8,
            nblocks_in_symbol: 1,
            early_termination: true,
        };
        let code = LdpcCode::new(&ldpc);
        let table = init_modulation_table(mod_bits);
        let mut rng = StdRng::seed_from_u64(0);
        fn randn(rng: &mut StdRng) -> f32 {
            StandardNormal.sample(rng)
        }

        // One code block per user; modulated onto the first
        // cb_codew_len / mod_bits data subcarriers.
        let used_scs = code.cb_codew_len() / mod_bits;
        assert!(used_scs <= ofdm_data_num);

        let mut tx_bits: Vec<Vec<u8>> = Vec::new();
        let mut tx_syms: Vec<Vec<Complex32>> = Vec::new();
        for _ in 0..users {
            let input: Vec<u8> = (0..code.input_bytes()).map(|_| rng.gen()).collect();
            let mut cw = vec![0u8; code.codeword_bytes()];
            code.encode(&input, &mut cw);
            let fields = adapt_bits_for_mod(&cw[..code.cb_codew_len() / 8], mod_bits);
            let mut syms: Vec<Complex32> =
                fields.iter().map(|&v| mod_single(v, &table)).collect();
            syms.resize(ofdm_data_num, Complex32::default());
            tx_bits.push(input);
            tx_syms.push(syms);
        }

        // Flat channel across subcarriers, per-subcarrier noise.
        let h = Array2::from_shape_fn((ants, users), |_| {
            Complex32::new(randn(&mut rng), randn(&mut rng))
        });

        // Pilot pass: estimate the channel column per user.
        let pilot: Vec<Complex32> = (0..ofdm_data_num)
            .map(|i| {
                let s = std::f32::consts::FRAC_1_SQRT_2;
                Complex32::new(
                    if i % 2 == 0 { s } else { -s },
                    if i % 3 == 0 { s } else { -s },
                )
            })
            .collect();
        let mut csi_est = Array2::<Complex32>::zeros((ants, users));
        for u in 0..users {
            for a in 0..ants {
                // Average the per-subcarrier estimates of a flat channel.
                let mut rx = vec![Complex32::default(); ofdm_data_num];
                for (sc, r) in rx.iter_mut().enumerate() {
                    let n = Complex32::new(randn(&mut rng), randn(&mut rng)) * noise_level;
                    *r = h[(a, u)] * pilot[sc] + n;
                }
                let mut est = vec![Complex32::default(); ofdm_data_num];
                csi_from_pilot(&rx, &pilot, &mut est);
                let mean = est.iter().sum::<Complex32>() / ofdm_data_num as f32;
                csi_est[(a, u)] = mean;
            }
        }
        let precoder = compute_precoder(csi_est.view());
        assert!(!precoder.flagged);
        let w: Vec<Complex32> = precoder.w.iter().copied().collect();

        // Data pass: channel, equalize, soft demod, decode.
        let mut llrs = vec![vec![0i8; ofdm_data_num * mod_bits]; users];
        for sc in 0..used_scs {
            let mut y = vec![Complex32::default(); ants];
            for a in 0..ants {
                for u in 0..users {
                    y[a] += h[(a, u)] * tx_syms[u][sc];
                }
                y[a] += Complex32::new(randn(&mut rng), randn(&mut rng)) * noise_level;
            }
            let mut x = vec![Complex32::default(); users];
            equalize(&w, &y, &mut x);
            for u in 0..users {
                demod_soft_single(x[u], mod_bits, &mut llrs[u][sc * mod_bits..][..mod_bits]);
            }
        }

        for u in 0..users {
            let mut decoded = vec![0u8; code.input_bytes()];
            code.decode(&llrs[u], &mut decoded);
            assert_eq!(decoded, tx_bits[u], "user {u} bits differ after loopback");
        }
    }
}
