//! Offline Data and Reference Generator
//!
//! Produces the files the sender replays and the correctness benchmarks
//! compare against: seeded information bits, their LDPC-encoded and
//! modulated form, and the time-domain IQ a base station would receive
//! after the modulated symbols pass through a random flat channel.
//!
//! File layout (all little-endian):
//! - `LDPC_orig_data_2048_ant<N>.bin`: packed info bytes per code block;
//! - `encoded_mod_data.bin`: float32 I/Q pairs per code block, one
//!   `ofdm_data_num`-wide row each;
//! - `LDPC_rx_data_2048_ant<N>.bin`: float32 I/Q pairs per
//!   `(symbol, antenna)` row, `ofdm_frame_len` samples with cyclic prefix.

use std::io::Write;
use std::path::Path;

use common::config::Config;
use engine::kernels::fft::FftEngine;
use engine::kernels::ldpc::LdpcCode;
use engine::kernels::modulation::{adapt_bits_for_mod, init_modulation_table, mod_single};
use ndarray::Array2;
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use tracing::info;

use crate::SimError;

/// Channel-estimate mismatch level between pilot and data symbols.
const NOISE_LEVEL: f32 = 0.01;

fn write_f32s(file: &mut std::fs::File, values: impl Iterator<Item = f32>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    file.write_all(&buf)
}

/// Time-domain symbol with cyclic prefix from occupied-subcarrier samples.
fn to_time_domain(
    fft: &mut FftEngine,
    cfg: &Config,
    freq: &[Complex32],
    full_band: bool,
) -> Vec<Complex32> {
    let ca = cfg.ofdm_ca_num;
    let mut buf = vec![Complex32::default(); ca];
    if full_band {
        buf.copy_from_slice(freq);
    } else {
        buf[cfg.ofdm_data_start..cfg.ofdm_data_start + cfg.ofdm_data_num].copy_from_slice(freq);
    }
    fft.run_inverse(&mut buf);

    let mut with_cp = Vec::with_capacity(cfg.ofdm_frame_len());
    with_cp.extend_from_slice(&buf[ca - cfg.cp_len..]);
    with_cp.extend_from_slice(&buf);
    with_cp
}

/// Generate all reference files under `dir`.
pub fn generate(cfg: &Config, dir: &Path, seed: u64) -> Result<(), SimError> {
    std::fs::create_dir_all(dir)?;
    let code = LdpcCode::new(&cfg.ldpc);
    let table = init_modulation_table(cfg.mod_order_bits());
    let mut fft = FftEngine::new(cfg.ofdm_ca_num);
    let mut rng = StdRng::seed_from_u64(seed);

    let users = cfg.ue_num;
    let ants = cfg.bs_ant_num;
    let nblocks = cfg.ldpc.nblocks_in_symbol as usize;
    let num_codeblocks = cfg.codeblocks_perframe();
    let cw_scs = code.cb_codew_len() / cfg.mod_order_bits();
    info!(
        "datagen: {num_codeblocks} code blocks ({} info bytes each), {} data subcarriers",
        code.input_bytes(),
        cfg.ofdm_data_num
    );

    // Information bits and modulated rows, code block id
    // `ue * per_ue + dsym * nblocks + b`.
    let mut info_bits: Vec<Vec<u8>> = Vec::with_capacity(num_codeblocks);
    let mut mod_rows: Vec<Vec<Complex32>> = Vec::with_capacity(num_codeblocks);
    let mut codeword = vec![0u8; code.codeword_bytes()];
    for _ in 0..num_codeblocks {
        let input: Vec<u8> = (0..code.input_bytes()).map(|_| rng.gen()).collect();
        code.encode(&input, &mut codeword);
        let fields = adapt_bits_for_mod(&codeword, cfg.mod_order_bits());
        let mut row = vec![Complex32::default(); cfg.ofdm_data_num];
        for (i, &v) in fields.iter().take(cw_scs).enumerate() {
            row[i] = mod_single(v, &table);
        }
        info_bits.push(input);
        mod_rows.push(row);
    }

    let orig_path = dir.join(format!("LDPC_orig_data_2048_ant{ants}.bin"));
    let mut orig_file = std::fs::File::create(&orig_path)?;
    for bits in &info_bits {
        orig_file.write_all(bits)?;
    }
    info!("wrote {}", orig_path.display());

    let mod_path = dir.join("encoded_mod_data.bin");
    let mut mod_file = std::fs::File::create(&mod_path)?;
    for row in &mod_rows {
        write_f32s(&mut mod_file, row.iter().flat_map(|c| [c.re, c.im]))?;
    }
    info!("wrote {}", mod_path.display());

    // Per-user transmit symbols in time domain: pilots first, then data.
    let pilots = cfg.pilots();
    let pilot_time = to_time_domain(&mut fft, cfg, &pilots, true);
    let zero_time = vec![Complex32::default(); cfg.ofdm_frame_len()];
    let per_ue = cfg.data_symbol_num * nblocks;

    let mut tx_time: Vec<Vec<&[Complex32]>> = Vec::new();
    let mut data_time: Vec<Vec<Complex32>> = Vec::new();
    for ue in 0..users {
        for dsym in 0..cfg.data_symbol_num {
            // One symbol may carry several code blocks back to back.
            let mut freq = vec![Complex32::default(); cfg.ofdm_data_num];
            for b in 0..nblocks {
                let cb = ue * per_ue + dsym * nblocks + b;
                let seg = &mod_rows[cb][..cw_scs];
                freq[b * cw_scs..(b + 1) * cw_scs].copy_from_slice(seg);
            }
            data_time.push(to_time_domain(&mut fft, cfg, &freq, false));
        }
    }
    for sym in 0..cfg.symbol_num_perframe() {
        let mut row: Vec<&[Complex32]> = Vec::with_capacity(users);
        for ue in 0..users {
            if sym < cfg.pilot_symbol_num {
                row.push(if sym == ue { &pilot_time } else { &zero_time });
            } else {
                let dsym = sym - cfg.pilot_symbol_num;
                row.push(&data_time[ue * cfg.data_symbol_num + dsym]);
            }
        }
        tx_time.push(row);
    }

    // Flat channel, redrawn noise per symbol.
    let h = Array2::from_shape_fn((ants, users), |_| {
        let re: f32 = StandardNormal.sample(&mut rng);
        let im: f32 = StandardNormal.sample(&mut rng);
        Complex32::new(re, im)
    });

    let rx_path = dir.join(format!("LDPC_rx_data_2048_ant{ants}.bin"));
    let mut rx_file = std::fs::File::create(&rx_path)?;
    let samples = cfg.ofdm_frame_len();
    for sym_row in tx_time.iter() {
        for ant in 0..ants {
            let mut rx = vec![Complex32::default(); samples];
            for (ue, tx) in sym_row.iter().enumerate() {
                let noise_re: f32 = StandardNormal.sample(&mut rng);
                let noise_im: f32 = StandardNormal.sample(&mut rng);
                let gain = h[(ant, ue)] + Complex32::new(noise_re, noise_im) * NOISE_LEVEL;
                for (r, &t) in rx.iter_mut().zip(tx.iter()) {
                    *r += t * gain;
                }
            }
            write_f32s(&mut rx_file, rx.iter().flat_map(|c| [c.re, c.im]))?;
        }
    }
    info!("wrote {}", rx_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::LdpcConfig;
    use engine::kernels::demul::equalize;
    use engine::kernels::modulation::demod_soft_single;
    use engine::kernels::zf::{compute_precoder, csi_from_pilot};

    fn small_config() -> Config {
        let cfg = Config {
            bs_ant_num: 8,
            ue_num: 2,
            ofdm_ca_num: 256,
            ofdm_data_num: 96,
            ofdm_data_start: 80,
            cp_len: 16,
            pilot_symbol_num: 2,
            data_symbol_num: 2,
            downlink_mode: false,
            modulation: "16QAM".to_string(),
            ldpc: LdpcConfig {
                bg: 2,
                zc: 8,
                n_rows: 42,
                cb_len: 80,
                cb_codew_len: 384,
                decoder_iter: 8,
                nblocks_in_symbol: 1,
                early_termination: true,
            },
            bs_addr: "127.0.0.1".to_string(),
            bs_port: 8000,
            ue_addr: "127.0.0.1".to_string(),
            ue_port: 7000,
            rru_addr: "127.0.0.1".to_string(),
            rru_port: 9000,
            socket_thread_num: 1,
            worker_thread_num: 2,
            core_offset: 0,
            demul_block_size: 24,
            zf_block_size: 16,
            frames_to_test: 4,
        };
        cfg.validate().unwrap();
        cfg
    }

    fn read_f32_rows(path: &Path, row_len: usize) -> Vec<Vec<Complex32>> {
        let bytes = std::fs::read(path).unwrap();
        bytes
            .chunks_exact(row_len * 8)
            .map(|row| {
                row.chunks_exact(8)
                    .map(|c| {
                        Complex32::new(
                            f32::from_le_bytes(c[0..4].try_into().unwrap()),
                            f32::from_le_bytes(c[4..8].try_into().unwrap()),
                        )
                    })
                    .collect()
            })
            .collect()
    }

    /// The generated IQ must decode back to the generated bits through the
    /// uplink kernel chain.
    #[test]
    fn test_generated_iq_decodes_to_source_bits() {
        let cfg = small_config();
        let dir = std::env::temp_dir().join("datagen_test");
        std::fs::remove_dir_all(&dir).ok();
        generate(&cfg, &dir, 0).unwrap();

        let code = LdpcCode::new(&cfg.ldpc);
        let rx_rows = read_f32_rows(
            &dir.join(format!("LDPC_rx_data_2048_ant{}.bin", cfg.bs_ant_num)),
            cfg.ofdm_frame_len(),
        );
        assert_eq!(rx_rows.len(), cfg.symbol_num_perframe() * cfg.bs_ant_num);

        let orig = std::fs::read(dir.join(format!(
            "LDPC_orig_data_2048_ant{}.bin",
            cfg.bs_ant_num
        )))
        .unwrap();
        assert_eq!(orig.len(), cfg.codeblocks_perframe() * code.input_bytes());

        // FFT every (symbol, antenna) row down to the data subcarriers.
        let mut fft = FftEngine::new(cfg.ofdm_ca_num);
        let n = cfg.ofdm_data_num;
        let mut freq = vec![vec![Complex32::default(); n]; rx_rows.len()];
        for (row, out) in rx_rows.iter().zip(freq.iter_mut()) {
            let mut buf = row[cfg.cp_len..].to_vec();
            fft.run_forward(&mut buf);
            out.copy_from_slice(&buf[cfg.ofdm_data_start..cfg.ofdm_data_start + n]);
        }

        // Channel estimates from the pilot symbols.
        let pilots = cfg.pilots();
        let pilot_band = &pilots[cfg.ofdm_data_start..cfg.ofdm_data_start + n];
        let mut csi = vec![vec![Complex32::default(); n]; cfg.ue_num * cfg.bs_ant_num];
        for ue in 0..cfg.ue_num {
            for ant in 0..cfg.bs_ant_num {
                let rx = &freq[ue * cfg.bs_ant_num + ant];
                csi_from_pilot(rx, pilot_band, &mut csi[ue * cfg.bs_ant_num + ant]);
            }
        }

        // Decode every (data symbol, user) and compare.
        let mod_bits = cfg.mod_order_bits();
        let mut h = Array2::<Complex32>::zeros((cfg.bs_ant_num, cfg.ue_num));
        let mut y = vec![Complex32::default(); cfg.bs_ant_num];
        let mut x = vec![Complex32::default(); cfg.ue_num];
        let mut llrs = vec![vec![0i8; n * mod_bits]; cfg.ue_num];
        for dsym in 0..cfg.data_symbol_num {
            let sym = cfg.pilot_symbol_num + dsym;
            for sc in 0..n {
                for ant in 0..cfg.bs_ant_num {
                    for ue in 0..cfg.ue_num {
                        h[(ant, ue)] = csi[ue * cfg.bs_ant_num + ant][sc];
                    }
                    y[ant] = freq[sym * cfg.bs_ant_num + ant][sc];
                }
                let precoder = compute_precoder(h.view());
                let w: Vec<Complex32> = precoder.w.iter().copied().collect();
                equalize(&w, &y, &mut x);
                for ue in 0..cfg.ue_num {
                    demod_soft_single(x[ue], mod_bits, &mut llrs[ue][sc * mod_bits..][..mod_bits]);
                }
            }
            for ue in 0..cfg.ue_num {
                let mut decoded = vec![0u8; code.input_bytes()];
                code.decode(&llrs[ue], &mut decoded);
                let cb = ue * cfg.data_symbol_num + dsym;
                let expect = &orig[cb * code.input_bytes()..(cb + 1) * code.input_bytes()];
                assert_eq!(decoded, expect, "dsym {dsym} ue {ue}");
            }
        }
        std::fs::remove_dir_all(&dir).ok();
    }
}
