//! Constellation Mapping and Demapping
//!
//! Gray-coded QPSK / 16-QAM / 64-QAM tables, hard slicing and soft LLR
//! output. Constellations are unit average energy. Within one m-bit field
//! the first (most significant) bits select the I axis, the rest the Q
//! axis; on each axis the leading bit is the sign bit.
//!
//! LLR convention: positive means bit 1. The LDPC decoder and the hard
//! slicer share this convention, so hard decisions are `llr > 0`.

use num_complex::Complex32;

/// Fixed-point scale applied to LLRs before the int8 clamp.
const LLR_SCALE: f32 = 64.0;

const SCALE_QPSK: f32 = std::f32::consts::FRAC_1_SQRT_2;
const SCALE_16QAM: f32 = 0.316_227_76; // 1/sqrt(10)
const SCALE_64QAM: f32 = 0.154_303_35; // 1/sqrt(42)

/// Gray level for a 2-bit axis field (sign bit first): 00 -3, 01 -1,
/// 11 +1, 10 +3.
fn level2(bits: u8) -> f32 {
    match bits & 0b11 {
        0b00 => -3.0,
        0b01 => -1.0,
        0b11 => 1.0,
        _ => 3.0,
    }
}

/// Gray level for a 3-bit axis field (sign bit first).
fn level3(bits: u8) -> f32 {
    match bits & 0b111 {
        0b000 => -7.0,
        0b001 => -5.0,
        0b011 => -3.0,
        0b010 => -1.0,
        0b110 => 1.0,
        0b111 => 3.0,
        0b101 => 5.0,
        _ => 7.0, // 0b100
    }
}

/// Precompute the constellation table for `mod_order_bits` in {2, 4, 6}.
pub fn init_modulation_table(mod_order_bits: usize) -> Vec<Complex32> {
    let size = 1usize << mod_order_bits;
    (0..size as u8)
        .map(|v| match mod_order_bits {
            2 => Complex32::new(
                if v & 0b10 != 0 { SCALE_QPSK } else { -SCALE_QPSK },
                if v & 0b01 != 0 { SCALE_QPSK } else { -SCALE_QPSK },
            ),
            4 => Complex32::new(
                SCALE_16QAM * level2(v >> 2),
                SCALE_16QAM * level2(v),
            ),
            6 => Complex32::new(
                SCALE_64QAM * level3(v >> 3),
                SCALE_64QAM * level3(v),
            ),
            _ => unreachable!("validated modulation order"),
        })
        .collect()
}

/// Map one unpacked field through the table.
#[inline]
pub fn mod_single(index: u8, table: &[Complex32]) -> Complex32 {
    table[index as usize]
}

fn hard_axis2(x: f32) -> u8 {
    let sign = (x > 0.0) as u8;
    let inner = (x.abs() < 2.0 * SCALE_16QAM) as u8;
    sign << 1 | inner
}

fn hard_axis3(x: f32) -> u8 {
    let sign = (x > 0.0) as u8;
    let a = x.abs();
    let (mid, low) = if a < 2.0 * SCALE_64QAM {
        (1, 0)
    } else if a < 4.0 * SCALE_64QAM {
        (1, 1)
    } else if a < 6.0 * SCALE_64QAM {
        (0, 1)
    } else {
        (0, 0)
    };
    sign << 2 | mid << 1 | low
}

/// Hard decision: nearest constellation index.
pub fn demod_hard_single(x: Complex32, mod_order_bits: usize) -> u8 {
    match mod_order_bits {
        2 => ((x.re > 0.0) as u8) << 1 | (x.im > 0.0) as u8,
        4 => hard_axis2(x.re) << 2 | hard_axis2(x.im),
        6 => hard_axis3(x.re) << 3 | hard_axis3(x.im),
        _ => unreachable!("validated modulation order"),
    }
}

#[inline]
fn clamp_llr(v: f32) -> i8 {
    (v * LLR_SCALE).round().clamp(-127.0, 127.0) as i8
}

/// Soft decision: `mod_order_bits` LLRs per point, field MSB first.
pub fn demod_soft_single(x: Complex32, mod_order_bits: usize, out: &mut [i8]) {
    match mod_order_bits {
        2 => {
            out[0] = clamp_llr(x.re);
            out[1] = clamp_llr(x.im);
        }
        4 => {
            let s = SCALE_16QAM;
            out[0] = clamp_llr(x.re);
            out[1] = clamp_llr(2.0 * s - x.re.abs());
            out[2] = clamp_llr(x.im);
            out[3] = clamp_llr(2.0 * s - x.im.abs());
        }
        6 => {
            let s = SCALE_64QAM;
            for (axis, v) in [x.re, x.im].into_iter().enumerate() {
                out[axis * 3] = clamp_llr(v);
                out[axis * 3 + 1] = clamp_llr(4.0 * s - v.abs());
                out[axis * 3 + 2] = clamp_llr(2.0 * s - (v.abs() - 4.0 * s).abs());
            }
        }
        _ => unreachable!("validated modulation order"),
    }
}

fn bitreverse8(mut x: u8) -> u8 {
    x = x << 4 | x >> 4;
    x = (x & 0x33) << 2 | (x >> 2) & 0x33;
    x = (x & 0x55) << 1 | (x >> 1) & 0x55;
    x
}

/// Split packed, bit-reversed bytes into unpacked m-bit constellation
/// fields, appending to `out`. Field `j` holds codeword bits
/// `j*m..(j+1)*m`, first bit as the field MSB.
pub fn adapt_bits_for_mod_into(input: &[u8], mod_order_bits: usize, out: &mut Vec<u8>) {
    let m = mod_order_bits as u32;
    let mut window: u16 = 0;
    let mut bits_avail: u32 = 0;
    for &byte in input {
        window |= (bitreverse8(byte) as u16) << (8 - bits_avail);
        bits_avail += 8;
        while bits_avail >= m {
            out.push((window >> (16 - m)) as u8);
            window <<= m;
            bits_avail -= m;
        }
    }
}

/// Allocating convenience form of [`adapt_bits_for_mod_into`]; output
/// holds `8 * input.len() / m` fields.
pub fn adapt_bits_for_mod(input: &[u8], mod_order_bits: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() * 8 / mod_order_bits);
    adapt_bits_for_mod_into(input, mod_order_bits, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_unit_energy() {
        for bits in [2usize, 4, 6] {
            let table = init_modulation_table(bits);
            assert_eq!(table.len(), 1 << bits);
            let energy: f32 = table.iter().map(|c| c.norm_sqr()).sum::<f32>() / table.len() as f32;
            assert!((energy - 1.0).abs() < 1e-3, "order {bits}: energy {energy}");
        }
    }

    #[test]
    fn test_hard_demod_inverts_modulation() {
        for bits in [2usize, 4, 6] {
            let table = init_modulation_table(bits);
            for v in 0..(1u8 << bits) {
                let x = mod_single(v, &table);
                assert_eq!(demod_hard_single(x, bits), v, "order {bits} index {v}");
            }
        }
    }

    #[test]
    fn test_soft_demod_signs_match_hard() {
        for bits in [2usize, 4, 6] {
            let table = init_modulation_table(bits);
            let mut llrs = [0i8; 6];
            for v in 0..(1u8 << bits) {
                let x = mod_single(v, &table);
                demod_soft_single(x, bits, &mut llrs);
                let mut recovered = 0u8;
                for k in 0..bits {
                    recovered = recovered << 1 | (llrs[k] > 0) as u8;
                }
                assert_eq!(recovered, v, "order {bits} index {v}");
            }
        }
    }

    #[test]
    fn test_adapt_bits_field_order() {
        // Codeword bits LSB-first in each byte; fields carry the earliest
        // bit as their MSB.
        let packed = [0b0000_0001u8, 0xFF];
        let fields = adapt_bits_for_mod(&packed, 4);
        assert_eq!(fields, vec![0b1000, 0b0000, 0b1111, 0b1111]);
    }

    #[test]
    fn test_adapt_bits_qpsk_count() {
        let fields = adapt_bits_for_mod(&[0xAA; 3], 2);
        assert_eq!(fields.len(), 12);
    }
}
