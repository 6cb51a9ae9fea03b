//! LDPC Encode/Decode
//!
//! Systematic quasi-cyclic code over the 5G NR base-graph parameters: the
//! base graph index selects the prototype layout, the lifting factor `Zc`
//! sets the circulant size, and `select_base_matrix_entry` picks the shift
//! set for the lifting-factor residue class. Decoding is iterative
//! bit-flipping over the check equations with the configured iteration cap
//! and optional early termination.
//!
//! Bit order: packed bytes carry bit `i` at `bytes[i / 8] >> (i % 8)`.
//! Codewords are `[information bits | parity bits]`. LLR sign convention:
//! positive means bit 1.

use common::config::LdpcConfig;
use tracing::trace;

/// Check-node degree on the information side.
const CHECK_DEGREE: usize = 4;

/// Shift sets per lifting-factor residue class `i_LS`.
const SHIFT_SETS: [[u16; 8]; 8] = [
    [0, 13, 37, 61, 101, 149, 197, 251],
    [3, 17, 41, 67, 103, 151, 199, 257],
    [5, 19, 43, 71, 107, 157, 211, 263],
    [7, 23, 47, 73, 109, 163, 223, 269],
    [11, 29, 53, 79, 113, 167, 227, 271],
    [2, 31, 59, 83, 127, 173, 229, 277],
    [9, 37, 61, 89, 131, 179, 233, 281],
    [6, 41, 67, 97, 137, 181, 239, 283],
];

/// Select the base-matrix shift-set index for a lifting factor.
///
/// Residue table: `Zc mod 15, 13, 11, 9, 7, 5, 3 == 0` picks
/// `7, 6, 5, 4, 3, 2, 1` in that order, else 0.
pub fn select_base_matrix_entry(zc: u16) -> u8 {
    if zc % 15 == 0 {
        7
    } else if zc % 13 == 0 {
        6
    } else if zc % 11 == 0 {
        5
    } else if zc % 9 == 0 {
        4
    } else if zc % 7 == 0 {
        3
    } else if zc % 5 == 0 {
        2
    } else if zc % 3 == 0 {
        1
    } else {
        0
    }
}

/// One code instance: parameters plus the expanded check equations.
pub struct LdpcCode {
    cb_len: usize,
    cb_codew_len: usize,
    decoder_iter: usize,
    early_termination: bool,
    /// Information-bit positions per parity check; check `p` also covers
    /// parity position `cb_len + p`.
    checks: Vec<Vec<u32>>,
    /// Checks each codeword bit participates in.
    membership: Vec<Vec<u32>>,
}

impl LdpcCode {
    pub fn new(cfg: &LdpcConfig) -> Self {
        let zc = cfg.zc as usize;
        let k = cfg.cb_len as usize;
        let n = cfg.cb_codew_len as usize;
        let parity = n - k;
        let k_blocks = (k + zc - 1) / zc;
        let i_ls = select_base_matrix_entry(cfg.zc) as usize;
        let shifts = &SHIFT_SETS[i_ls];
        let degree = CHECK_DEGREE.min(k_blocks);

        let mut checks = Vec::with_capacity(parity);
        for p in 0..parity {
            let row = p / zc;
            let z = p % zc;
            let mut positions: Vec<u32> = Vec::with_capacity(degree);
            for j in 0..degree {
                let shift = shifts[(row + j) % shifts.len()] as usize % zc;
                let col_block = (row + j) % k_blocks;
                let mut pos = col_block * zc + (z + shift) % zc;
                if pos >= k {
                    pos %= k;
                }
                // Keep positions distinct within one check.
                while positions.contains(&(pos as u32)) {
                    pos = (pos + 1) % k;
                }
                positions.push(pos as u32);
            }
            checks.push(positions);
        }

        let mut membership = vec![Vec::new(); n];
        for (p, positions) in checks.iter().enumerate() {
            for &pos in positions {
                membership[pos as usize].push(p as u32);
            }
            membership[k + p].push(p as u32);
        }

        trace!(
            "ldpc code bg {} zc {} i_ls {}: {} info bits, {} checks",
            cfg.bg,
            cfg.zc,
            i_ls,
            k,
            parity
        );

        LdpcCode {
            cb_len: k,
            cb_codew_len: n,
            decoder_iter: cfg.decoder_iter as usize,
            early_termination: cfg.early_termination,
            checks,
            membership,
        }
    }

    pub fn input_bytes(&self) -> usize {
        (self.cb_len + 7) / 8
    }

    pub fn codeword_bytes(&self) -> usize {
        (self.cb_codew_len + 7) / 8
    }

    pub fn cb_len(&self) -> usize {
        self.cb_len
    }

    pub fn cb_codew_len(&self) -> usize {
        self.cb_codew_len
    }

    /// Encode one code block of packed information bytes into packed
    /// codeword bytes.
    pub fn encode(&self, input: &[u8], codeword: &mut [u8]) {
        debug_assert!(input.len() >= self.input_bytes());
        debug_assert!(codeword.len() >= self.codeword_bytes());

        codeword.fill(0);
        codeword[..self.input_bytes()].copy_from_slice(&input[..self.input_bytes()]);
        // Mask padding bits of the last information byte.
        if self.cb_len % 8 != 0 {
            let keep = self.cb_len % 8;
            codeword[self.input_bytes() - 1] &= (1u8 << keep) - 1;
        }

        for (p, positions) in self.checks.iter().enumerate() {
            let mut parity = 0u8;
            for &pos in positions {
                parity ^= get_bit(codeword, pos as usize);
            }
            if parity != 0 {
                set_bit(codeword, self.cb_len + p);
            }
        }
    }

    /// Decode one code block from LLRs into packed information bytes.
    pub fn decode(&self, llrs: &[i8], output: &mut [u8]) {
        debug_assert!(llrs.len() >= self.cb_codew_len);
        debug_assert!(output.len() >= self.input_bytes());

        let mut bits: Vec<u8> = llrs[..self.cb_codew_len]
            .iter()
            .map(|&l| (l > 0) as u8)
            .collect();

        let mut syndrome = vec![0u8; self.checks.len()];
        for _ in 0..self.decoder_iter {
            let mut unsatisfied = 0usize;
            for (p, positions) in self.checks.iter().enumerate() {
                let mut s = bits[self.cb_len + p];
                for &pos in positions {
                    s ^= bits[pos as usize];
                }
                syndrome[p] = s;
                unsatisfied += s as usize;
            }
            if unsatisfied == 0 && self.early_termination {
                break;
            }

            // Flip every bit whose checks are unsatisfied by strict
            // majority.
            let mut flipped = 0usize;
            for (bit, checks) in self.membership.iter().enumerate() {
                if checks.is_empty() {
                    continue;
                }
                let bad = checks
                    .iter()
                    .filter(|&&c| syndrome[c as usize] != 0)
                    .count();
                if 2 * bad > checks.len() {
                    bits[bit] ^= 1;
                    flipped += 1;
                }
            }
            if flipped == 0 {
                break;
            }
        }

        output[..self.input_bytes()].fill(0);
        for (i, &b) in bits[..self.cb_len].iter().enumerate() {
            if b != 0 {
                set_bit(output, i);
            }
        }
    }
}

#[inline]
fn get_bit(bytes: &[u8], i: usize) -> u8 {
    bytes[i >> 3] >> (i & 7) & 1
}

#[inline]
fn set_bit(bytes: &mut [u8], i: usize) {
    bytes[i >> 3] |= 1 << (i & 7);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn code(bg: u16, zc: u16, cb_len: u32, cb_codew_len: u32) -> LdpcCode {
        LdpcCode::new(&LdpcConfig {
            bg,
            zc,
            n_rows: 46,
            cb_len,
            cb_codew_len,
            decoder_iter: 8,
            nblocks_in_symbol: 1,
            early_termination: true,
        })
    }

    #[test]
    fn test_select_base_matrix_entry_residues() {
        assert_eq!(select_base_matrix_entry(15), 7);
        assert_eq!(select_base_matrix_entry(13), 6);
        assert_eq!(select_base_matrix_entry(11), 5);
        assert_eq!(select_base_matrix_entry(9), 4);
        assert_eq!(select_base_matrix_entry(7), 3);
        assert_eq!(select_base_matrix_entry(5), 2);
        assert_eq!(select_base_matrix_entry(3), 1);
        assert_eq!(select_base_matrix_entry(2), 0);
        assert_eq!(select_base_matrix_entry(30), 7);
        assert_eq!(select_base_matrix_entry(26), 6);
        assert_eq!(select_base_matrix_entry(16), 0);
    }

    #[test]
    fn test_noiseless_roundtrip_bg1() {
        let code = code(1, 72, 1056, 4224);
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..4 {
            let input: Vec<u8> = (0..code.input_bytes()).map(|_| rng.gen()).collect();
            let mut cw = vec![0u8; code.codeword_bytes()];
            code.encode(&input, &mut cw);

            let llrs: Vec<i8> = (0..code.cb_codew_len())
                .map(|i| if get_bit(&cw, i) != 0 { 64 } else { -64 })
                .collect();
            let mut out = vec![0u8; code.input_bytes()];
            code.decode(&llrs, &mut out);
            assert_eq!(out, input);
        }
    }

    #[test]
    fn test_noiseless_roundtrip_bg2() {
        let code = code(2, 8, 80, 384);
        let input: Vec<u8> = (0..code.input_bytes()).map(|i| i as u8 ^ 0x5A).collect();
        let mut cw = vec![0u8; code.codeword_bytes()];
        code.encode(&input, &mut cw);
        let llrs: Vec<i8> = (0..code.cb_codew_len())
            .map(|i| if get_bit(&cw, i) != 0 { 32 } else { -32 })
            .collect();
        let mut out = vec![0u8; code.input_bytes()];
        code.decode(&llrs, &mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn test_decoder_corrects_sparse_flips() {
        let code = code(1, 72, 1056, 4224);
        let mut rng = StdRng::seed_from_u64(7);
        let input: Vec<u8> = (0..code.input_bytes()).map(|_| rng.gen()).collect();
        let mut cw = vec![0u8; code.codeword_bytes()];
        code.encode(&input, &mut cw);

        let mut llrs: Vec<i8> = (0..code.cb_codew_len())
            .map(|i| if get_bit(&cw, i) != 0 { 64 } else { -64 })
            .collect();
        // Flip three scattered information bits.
        for &bad in &[17usize, 301, 888] {
            llrs[bad] = -llrs[bad];
        }
        let mut out = vec![0u8; code.input_bytes()];
        code.decode(&llrs, &mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let code = code(1, 36, 288, 1152);
        let input: Vec<u8> = (0..code.input_bytes()).map(|i| (i * 37) as u8).collect();
        let mut a = vec![0u8; code.codeword_bytes()];
        let mut b = vec![0u8; code.codeword_bytes()];
        code.encode(&input, &mut a);
        code.encode(&input, &mut b);
        assert_eq!(a, b);
    }
}
