//! JSON Configuration
//!
//! Runtime parameters for the engine and the simulator programs, loaded from
//! a JSON file. Validation happens once at load; a bad configuration is a
//! single fatal diagnostic, never a runtime error.

use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SC_PER_CACHELINE;

/// Wire header length: frame, symbol, cell, antenna ids as u32 LE.
pub const PACKET_HEADER_LEN: usize = 16;

/// Errors raised while loading or validating a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// LDPC code parameters (5G NR base graphs).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LdpcConfig {
    /// Base graph index, 1 or 2
    pub bg: u16,
    /// Lifting factor
    pub zc: u16,
    /// Parity-check rows in use
    pub n_rows: u16,
    /// Information bits per code block
    pub cb_len: u32,
    /// Coded bits per code block
    pub cb_codew_len: u32,
    /// Decoder iteration cap
    #[serde(default = "default_decoder_iter")]
    pub decoder_iter: u16,
    /// Code blocks carried by one data symbol
    #[serde(default = "default_nblocks_in_symbol")]
    pub nblocks_in_symbol: u32,
    /// Stop decoding once all parity checks pass
    #[serde(default = "default_early_termination")]
    pub early_termination: bool,
}

fn default_decoder_iter() -> u16 {
    5
}

fn default_nblocks_in_symbol() -> u32 {
    1
}

fn default_early_termination() -> bool {
    true
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Base-station antennas
    pub bs_ant_num: usize,
    /// Scheduled users
    pub ue_num: usize,

    /// FFT size (subcarriers per OFDM symbol)
    pub ofdm_ca_num: usize,
    /// Occupied data subcarriers
    pub ofdm_data_num: usize,
    /// First occupied subcarrier
    pub ofdm_data_start: usize,
    /// Cyclic prefix length in samples
    #[serde(default)]
    pub cp_len: usize,

    /// Pilot symbols per frame (one per user, time-orthogonal)
    pub pilot_symbol_num: usize,
    /// Data symbols per frame
    pub data_symbol_num: usize,

    /// Downlink mode: synthesize TX symbols instead of decoding uplink
    #[serde(default)]
    pub downlink_mode: bool,

    /// Modulation: "QPSK", "16QAM" or "64QAM"
    #[serde(default = "default_modulation")]
    pub modulation: String,

    pub ldpc: LdpcConfig,

    /// Base-station bind address
    #[serde(default = "default_addr")]
    pub bs_addr: String,
    /// First base-station port; antenna `a` uses `bs_port + a`
    #[serde(default = "default_bs_port")]
    pub bs_port: u16,
    /// User-side address (channel simulator / sender)
    #[serde(default = "default_addr")]
    pub ue_addr: String,
    /// First user-side port; user `u` uses `ue_port + u`
    #[serde(default = "default_ue_port")]
    pub ue_port: u16,
    /// Radio-head address downlink packets are sent to
    #[serde(default = "default_addr")]
    pub rru_addr: String,
    /// First radio-head port; antenna `a` uses `rru_port + a`
    #[serde(default = "default_rru_port")]
    pub rru_port: u16,

    /// RX/TX socket shards
    #[serde(default = "default_socket_thread_num")]
    pub socket_thread_num: usize,
    /// Worker shards
    #[serde(default = "default_worker_thread_num")]
    pub worker_thread_num: usize,
    /// First core used by the pinned threads
    #[serde(default)]
    pub core_offset: usize,

    /// Subcarriers handled by one equalization/demodulation task
    #[serde(default = "default_demul_block_size")]
    pub demul_block_size: usize,
    /// Subcarriers handled by one precoder-inversion task
    #[serde(default = "default_zf_block_size")]
    pub zf_block_size: usize,

    /// Frames processed before the engine reports and exits
    #[serde(default = "default_frames_to_test")]
    pub frames_to_test: usize,
}

fn default_modulation() -> String {
    "16QAM".to_string()
}

fn default_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_bs_port() -> u16 {
    8000
}

fn default_ue_port() -> u16 {
    7000
}

fn default_rru_port() -> u16 {
    9000
}

fn default_socket_thread_num() -> usize {
    1
}

fn default_worker_thread_num() -> usize {
    4
}

fn default_demul_block_size() -> usize {
    48
}

fn default_zf_block_size() -> usize {
    16
}

fn default_frames_to_test() -> usize {
    200
}

impl Config {
    /// Load and validate a configuration from a JSON file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency. Called by [`Config::from_file`];
    /// hand-built configs (tests, generators) should call it too.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.bs_ant_num == 0 || self.ue_num == 0 {
            return invalid("antenna and user counts must be nonzero".into());
        }
        if self.ue_num > self.bs_ant_num {
            return invalid(format!(
                "ue_num {} exceeds bs_ant_num {}",
                self.ue_num, self.bs_ant_num
            ));
        }
        if !self.ofdm_ca_num.is_power_of_two() {
            return invalid(format!("ofdm_ca_num {} is not a power of two", self.ofdm_ca_num));
        }
        if self.ofdm_data_start + self.ofdm_data_num > self.ofdm_ca_num {
            return invalid("data subcarriers exceed the FFT size".into());
        }
        if self.ofdm_data_num % SC_PER_CACHELINE != 0 {
            return invalid(format!(
                "ofdm_data_num {} is not a multiple of {}",
                self.ofdm_data_num, SC_PER_CACHELINE
            ));
        }
        if self.ofdm_data_num % self.demul_block_size != 0 {
            return invalid(format!(
                "demul_block_size {} does not divide ofdm_data_num {}",
                self.demul_block_size, self.ofdm_data_num
            ));
        }
        if self.demul_block_size % SC_PER_CACHELINE != 0 {
            return invalid(format!(
                "demul_block_size {} is not a multiple of {}",
                self.demul_block_size, SC_PER_CACHELINE
            ));
        }
        if self.ofdm_data_num % self.zf_block_size != 0 {
            return invalid(format!(
                "zf_block_size {} does not divide ofdm_data_num {}",
                self.zf_block_size, self.ofdm_data_num
            ));
        }
        if self.pilot_symbol_num != self.ue_num {
            return invalid(format!(
                "pilot_symbol_num {} must equal ue_num {} (time-orthogonal pilots)",
                self.pilot_symbol_num, self.ue_num
            ));
        }
        match self.mod_order_bits() {
            2 | 4 | 6 => {}
            _ => return invalid(format!("unsupported modulation {}", self.modulation)),
        }

        let ldpc = &self.ldpc;
        if ldpc.bg != 1 && ldpc.bg != 2 {
            return invalid(format!("base graph {} is not 1 or 2", ldpc.bg));
        }
        if !(2..=384).contains(&ldpc.zc) {
            return invalid(format!("lifting factor {} outside 2..=384", ldpc.zc));
        }
        if ldpc.cb_codew_len <= ldpc.cb_len {
            return invalid("cb_codew_len must exceed cb_len".into());
        }
        let bits_per_symbol = (self.ofdm_data_num * self.mod_order_bits()) as u32;
        if ldpc.nblocks_in_symbol * ldpc.cb_codew_len > bits_per_symbol {
            return invalid(format!(
                "{} blocks of {} coded bits do not fit one symbol of {} bits",
                ldpc.nblocks_in_symbol, ldpc.cb_codew_len, bits_per_symbol
            ));
        }
        Ok(())
    }

    /// Total symbols per frame.
    pub fn symbol_num_perframe(&self) -> usize {
        self.pilot_symbol_num + self.data_symbol_num
    }

    /// Time-domain samples per symbol on the wire.
    pub fn ofdm_frame_len(&self) -> usize {
        self.cp_len + self.ofdm_ca_num
    }

    /// Payload bytes per packet: interleaved int16 I/Q.
    pub fn packet_payload_len(&self) -> usize {
        2 * self.ofdm_frame_len() * std::mem::size_of::<i16>()
    }

    /// Full wire length of one packet.
    pub fn packet_length(&self) -> usize {
        PACKET_HEADER_LEN + self.packet_payload_len()
    }

    /// Bits per constellation point.
    pub fn mod_order_bits(&self) -> usize {
        match self.modulation.as_str() {
            "QPSK" => 2,
            "16QAM" => 4,
            "64QAM" => 6,
            _ => 0,
        }
    }

    pub fn is_pilot(&self, symbol_id: usize) -> bool {
        symbol_id < self.pilot_symbol_num
    }

    /// User whose pilot occupies `symbol_id`, if it is a pilot symbol.
    pub fn pilot_ue(&self, symbol_id: usize) -> Option<usize> {
        self.is_pilot(symbol_id).then_some(symbol_id)
    }

    /// Index of `symbol_id` among the frame's data symbols.
    pub fn data_symbol_idx(&self, symbol_id: usize) -> Option<usize> {
        (symbol_id >= self.pilot_symbol_num && symbol_id < self.symbol_num_perframe())
            .then(|| symbol_id - self.pilot_symbol_num)
    }

    /// Equalization/demodulation task blocks per data symbol.
    pub fn demul_blocks(&self) -> usize {
        self.ofdm_data_num / self.demul_block_size
    }

    /// Precoder-inversion task blocks per frame.
    pub fn zf_blocks(&self) -> usize {
        self.ofdm_data_num / self.zf_block_size
    }

    /// Code blocks per frame across all users.
    pub fn codeblocks_perframe(&self) -> usize {
        self.data_symbol_num * self.ldpc.nblocks_in_symbol as usize * self.ue_num
    }

    /// Known pilot sequence over all subcarriers, QPSK points from a
    /// deterministic generator so every program derives the same sequence.
    pub fn pilots(&self) -> Vec<Complex32> {
        let scale = std::f32::consts::FRAC_1_SQRT_2;
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        (0..self.ofdm_ca_num)
            .map(|_| {
                // xorshift64*
                state ^= state >> 12;
                state ^= state << 25;
                state ^= state >> 27;
                let bits = state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 62;
                let re = if bits & 1 == 0 { scale } else { -scale };
                let im = if bits & 2 == 0 { scale } else { -scale };
                Complex32::new(re, im)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_config() -> Config {
        Config {
            bs_ant_num: 16,
            ue_num: 4,
            ofdm_ca_num: 2048,
            ofdm_data_num: 1200,
            ofdm_data_start: 424,
            cp_len: 0,
            pilot_symbol_num: 4,
            data_symbol_num: 4,
            downlink_mode: false,
            modulation: "16QAM".to_string(),
            ldpc: LdpcConfig {
                bg: 1,
                zc: 72,
                n_rows: 46,
                cb_len: 1056,
                cb_codew_len: 4224,
                decoder_iter: 5,
                nblocks_in_symbol: 1,
                early_termination: true,
            },
            bs_addr: default_addr(),
            bs_port: default_bs_port(),
            ue_addr: default_addr(),
            ue_port: default_ue_port(),
            rru_addr: default_addr(),
            rru_port: default_rru_port(),
            socket_thread_num: 1,
            worker_thread_num: 4,
            core_offset: 0,
            demul_block_size: 48,
            zf_block_size: 16,
            frames_to_test: 10,
        }
    }

    #[test]
    fn test_valid_config() {
        let cfg = test_config();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.symbol_num_perframe(), 8);
        assert_eq!(cfg.packet_length(), 16 + 2048 * 4);
        assert_eq!(cfg.demul_blocks(), 25);
        assert_eq!(cfg.zf_blocks(), 75);
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let mut cfg = test_config();
        cfg.demul_block_size = 7;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_lifting_factor() {
        let mut cfg = test_config();
        cfg.ldpc.zc = 400;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_pilots_are_deterministic_unit_power() {
        let cfg = test_config();
        let a = cfg.pilots();
        let b = cfg.pilots();
        assert_eq!(a.len(), cfg.ofdm_ca_num);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x, y);
            assert!((x.norm() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_parse_json() {
        let text = r#"{
            "bs_ant_num": 8,
            "ue_num": 2,
            "ofdm_ca_num": 256,
            "ofdm_data_num": 96,
            "ofdm_data_start": 80,
            "pilot_symbol_num": 2,
            "data_symbol_num": 2,
            "demul_block_size": 48,
            "zf_block_size": 16,
            "ldpc": { "bg": 2, "zc": 8, "n_rows": 42, "cb_len": 80, "cb_codew_len": 384 }
        }"#;
        let cfg: Config = serde_json::from_str(text).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.modulation, "16QAM");
        assert_eq!(cfg.frames_to_test, 200);
    }
}
