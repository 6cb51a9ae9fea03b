//! Worker Shards
//!
//! A worker is a pinned thread with a private task queue and no per-frame
//! state: it decodes the tag, loads the matching ring windows, invokes the
//! kernel adapter, and posts a completion event carrying the same tag.
//! Task emission is disjoint by construction, so two workers never write
//! the same window.

use std::sync::Arc;

use common::config::Config;
use common::types::{Event, EventKind, Tag, ThreadType};
use common::utils::pin_to_core_with_offset;
use ndarray::Array2;
use num_complex::Complex32;
use tracing::{debug, error, warn};
use transport::packet::PacketHeader;
use transport::UdpClient;

use crate::buffer::Buffers;
use crate::kernels::fft::{complex_to_int16, int16_to_complex, FftEngine};
use crate::kernels::ldpc::LdpcCode;
use crate::kernels::modulation::{
    adapt_bits_for_mod_into, demod_soft_single, init_modulation_table, mod_single,
};
use crate::kernels::zf::{compute_precoder, csi_from_pilot, ZF_CONDITION_LIMIT};
use crate::kernels::demul::equalize;
use crate::queue::{schedule, EventQueue};
use crate::{EngineError, RunFlag, SpinBarrier};

pub struct Worker {
    tid: usize,
    cfg: Arc<Config>,
    buffers: Arc<Buffers>,
    task_queue: Arc<EventQueue>,
    message_queue: Arc<EventQueue>,
    running: Arc<RunFlag>,
    barrier: Arc<SpinBarrier>,

    fft: FftEngine,
    ldpc: LdpcCode,
    pilots: Vec<Complex32>,
    mod_table: Vec<Complex32>,
    tx_clients: Vec<UdpClient>,

    // Pre-allocated scratch; nothing on the task path allocates.
    fft_buf: Vec<Complex32>,
    csi_mat: Array2<Complex32>,
    sc_buf: Vec<Complex32>,
    eq_buf: Vec<Complex32>,
    llr_buf: Vec<i8>,
    field_buf: Vec<u8>,
    pkt_buf: Vec<u8>,
}

impl Worker {
    pub fn new(
        tid: usize,
        cfg: Arc<Config>,
        buffers: Arc<Buffers>,
        task_queue: Arc<EventQueue>,
        message_queue: Arc<EventQueue>,
        running: Arc<RunFlag>,
        barrier: Arc<SpinBarrier>,
    ) -> Result<Self, EngineError> {
        let mut tx_clients = Vec::new();
        if cfg.downlink_mode {
            for ant in 0..cfg.bs_ant_num {
                tx_clients.push(UdpClient::connect(&cfg.rru_addr, cfg.rru_port + ant as u16)?);
            }
        }
        let fft = FftEngine::new(cfg.ofdm_ca_num);
        let ldpc = LdpcCode::new(&cfg.ldpc);
        let pilots = cfg.pilots();
        let mod_table = init_modulation_table(cfg.mod_order_bits());
        let a = cfg.bs_ant_num;
        let u = cfg.ue_num;
        Ok(Worker {
            tid,
            fft_buf: vec![Complex32::default(); cfg.ofdm_ca_num],
            csi_mat: Array2::zeros((a, u)),
            sc_buf: vec![Complex32::default(); a],
            eq_buf: vec![Complex32::default(); u],
            llr_buf: vec![0i8; cfg.ldpc.cb_codew_len as usize],
            field_buf: Vec::with_capacity(cfg.ofdm_data_num),
            pkt_buf: vec![0u8; cfg.packet_length()],
            cfg,
            buffers,
            task_queue,
            message_queue,
            running,
            barrier,
            fft,
            ldpc,
            pilots,
            mod_table,
            tx_clients,
        })
    }

    pub fn run(mut self) {
        let core_base = self.cfg.core_offset + 1 + self.cfg.socket_thread_num;
        pin_to_core_with_offset(ThreadType::Worker, core_base, self.tid);
        self.barrier.wait();
        debug!("worker {} running", self.tid);

        while self.running.is_running() {
            let Some(event) = self.task_queue.pop() else {
                std::hint::spin_loop();
                continue;
            };
            let tag = event.tag();
            match event.kind {
                EventKind::Fft => self.do_fft(tag),
                EventKind::Csi => self.do_csi(tag),
                EventKind::Zf => self.do_zf(tag),
                EventKind::Demul => self.do_demul(tag),
                EventKind::Decode => self.do_decode(tag),
                EventKind::Encode => self.do_encode(tag),
                EventKind::Modulate => self.do_modulate(tag),
                EventKind::Ifft => self.do_ifft(tag),
                EventKind::PacketTx => self.do_packet_tx(tag),
                EventKind::PacketRx => {
                    warn!("worker {}: unexpected event {:?}", self.tid, event.kind);
                    continue;
                }
            }
            if schedule(&self.message_queue, Event::new(event.kind, tag)).is_err() {
                error!("worker {}: completion queue overflow", self.tid);
                self.running.fail();
            }
        }
    }

    /// Time-domain int16 symbol of one antenna to frequency-domain data
    /// subcarriers.
    fn do_fft(&mut self, tag: Tag) {
        let (frame, sym, ant) = (tag.frame_id(), tag.symbol_id() as usize, tag.ant_id() as usize);
        let window = sym * self.cfg.bs_ant_num + ant;
        let rx = self.buffers.rx.window(frame, window);
        int16_to_complex(rx, self.cfg.cp_len, &mut self.fft_buf);
        self.fft.run_forward(&mut self.fft_buf);

        // SAFETY: this worker holds the only task for (frame, sym, ant).
        let out = unsafe { self.buffers.data.window_mut(frame, window) };
        let start = self.cfg.ofdm_data_start;
        out.copy_from_slice(&self.fft_buf[start..start + self.cfg.ofdm_data_num]);
    }

    /// Channel estimate of one user from its pilot symbol: one column of
    /// every subcarrier's CSI matrix.
    fn do_csi(&mut self, tag: Tag) {
        let (frame, sym, ue) = (tag.frame_id(), tag.symbol_id() as usize, tag.ue_id() as usize);
        let ants = self.cfg.bs_ant_num;
        let n = self.cfg.ofdm_data_num;
        let start = self.cfg.ofdm_data_start;
        let pilot = &self.pilots[start..start + n];
        // SAFETY: one CSI task exists per (frame, pilot symbol).
        let csi = unsafe { self.buffers.csi.window_mut(frame, ue) };
        for ant in 0..ants {
            let rx = self.buffers.data.window(frame, sym * ants + ant);
            csi_from_pilot(rx, pilot, &mut csi[ant * n..(ant + 1) * n]);
        }
    }

    /// Zero-forcing inversion of one subcarrier block.
    fn do_zf(&mut self, tag: Tag) {
        let (frame, base_sc) = (tag.frame_id(), tag.sc_id() as usize);
        let ants = self.cfg.bs_ant_num;
        let users = self.cfg.ue_num;
        let blk = base_sc / self.cfg.zf_block_size;
        // SAFETY: one ZF task exists per (frame, subcarrier block).
        let out = unsafe { self.buffers.precoder.window_mut(frame, blk) };

        let n = self.cfg.ofdm_data_num;
        for sc_off in 0..self.cfg.zf_block_size {
            let sc = base_sc + sc_off;
            for ue in 0..users {
                let csi = self.buffers.csi.window(frame, ue);
                for ant in 0..ants {
                    self.csi_mat[(ant, ue)] = csi[ant * n + sc];
                }
            }
            let precoder = compute_precoder(self.csi_mat.view());
            if precoder.flagged {
                warn!(
                    "zf: frame {frame} sc {sc} ill-conditioned ({} > {ZF_CONDITION_LIMIT})",
                    precoder.condition
                );
            }
            let dst = &mut out[sc_off * users * ants..(sc_off + 1) * users * ants];
            for ((u, a), w) in precoder.w.indexed_iter() {
                dst[u * ants + a] = *w;
            }
        }
    }

    /// Equalize and soft-demodulate one subcarrier block of one data
    /// symbol.
    fn do_demul(&mut self, tag: Tag) {
        let (frame, sym, base_sc) = (tag.frame_id(), tag.symbol_id() as usize, tag.sc_id() as usize);
        let dsym = sym - self.cfg.pilot_symbol_num;
        let ants = self.cfg.bs_ant_num;
        let users = self.cfg.ue_num;
        let dbs = self.cfg.demul_block_size;
        let zbs = self.cfg.zf_block_size;
        let mod_bits = self.cfg.mod_order_bits();
        let blk = base_sc / dbs;
        let key = dsym * self.cfg.demul_blocks() + blk;

        // SAFETY: one demul task exists per (frame, data symbol, block).
        let equal = unsafe { self.buffers.equal.window_mut(frame, key) };
        let demod = unsafe { self.buffers.demod.window_mut(frame, key) };

        for sc_off in 0..dbs {
            let sc = base_sc + sc_off;
            for ant in 0..ants {
                self.sc_buf[ant] = self.buffers.data.window(frame, sym * ants + ant)[sc];
            }
            let pre = self.buffers.precoder.window(frame, sc / zbs);
            let w = &pre[(sc % zbs) * users * ants..][..users * ants];
            equalize(w, &self.sc_buf, &mut self.eq_buf);

            equal[sc_off * users..(sc_off + 1) * users].copy_from_slice(&self.eq_buf);
            for ue in 0..users {
                let llrs = &mut demod[ue * dbs * mod_bits + sc_off * mod_bits..][..mod_bits];
                demod_soft_single(self.eq_buf[ue], mod_bits, llrs);
            }
        }
    }

    /// LDPC-decode one user's code blocks of one data symbol.
    fn do_decode(&mut self, tag: Tag) {
        let (frame, sym, ue) = (tag.frame_id(), tag.symbol_id() as usize, tag.ue_id() as usize);
        let dsym = sym - self.cfg.pilot_symbol_num;
        let users = self.cfg.ue_num;
        let dbs = self.cfg.demul_block_size;
        let mod_bits = self.cfg.mod_order_bits();
        let nblocks = self.cfg.ldpc.nblocks_in_symbol as usize;
        let cw_scs = self.ldpc.cb_codew_len() / mod_bits;

        // SAFETY: one decode task exists per (frame, data symbol, user).
        let out = unsafe { self.buffers.decoded.window_mut(frame, dsym * users + ue) };
        for cb in 0..nblocks {
            for sc_rel in 0..cw_scs {
                let sc = cb * cw_scs + sc_rel;
                let blk = sc / dbs;
                let win = self.buffers.demod.window(frame, dsym * self.cfg.demul_blocks() + blk);
                let src = &win[ue * dbs * mod_bits + (sc % dbs) * mod_bits..][..mod_bits];
                self.llr_buf[sc_rel * mod_bits..sc_rel * mod_bits + mod_bits].copy_from_slice(src);
            }
            let bytes = self.ldpc.input_bytes();
            self.ldpc.decode(&self.llr_buf, &mut out[cb * bytes..(cb + 1) * bytes]);
        }
    }

    /// LDPC-encode one user's downlink code blocks of one data symbol.
    fn do_encode(&mut self, tag: Tag) {
        let (frame, sym, ue) = (tag.frame_id(), tag.symbol_id() as usize, tag.ue_id() as usize);
        let dsym = sym - self.cfg.pilot_symbol_num;
        let users = self.cfg.ue_num;
        let nblocks = self.cfg.ldpc.nblocks_in_symbol as usize;
        let in_bytes = self.ldpc.input_bytes();
        let cw_bytes = self.ldpc.codeword_bytes();

        let bits = self.buffers.dl_bits.window(frame, dsym * users + ue);
        // SAFETY: one encode task exists per (frame, data symbol, user).
        let out = unsafe { self.buffers.dl_encoded.window_mut(frame, dsym * users + ue) };
        for cb in 0..nblocks {
            self.ldpc.encode(
                &bits[cb * in_bytes..(cb + 1) * in_bytes],
                &mut out[cb * cw_bytes..(cb + 1) * cw_bytes],
            );
        }
    }

    /// Map one user's encoded downlink bits onto constellation points.
    fn do_modulate(&mut self, tag: Tag) {
        let (frame, sym, ue) = (tag.frame_id(), tag.symbol_id() as usize, tag.ue_id() as usize);
        let dsym = sym - self.cfg.pilot_symbol_num;
        let users = self.cfg.ue_num;
        let mod_bits = self.cfg.mod_order_bits();
        let nblocks = self.cfg.ldpc.nblocks_in_symbol as usize;
        let cw_bytes = self.ldpc.codeword_bytes();
        let cw_scs = self.ldpc.cb_codew_len() / mod_bits;

        let encoded = self.buffers.dl_encoded.window(frame, dsym * users + ue);
        // SAFETY: one modulate task exists per (frame, data symbol, user).
        let out = unsafe { self.buffers.dl_mod.window_mut(frame, dsym * users + ue) };
        out.fill(Complex32::default());
        for cb in 0..nblocks {
            self.field_buf.clear();
            adapt_bits_for_mod_into(
                &encoded[cb * cw_bytes..(cb + 1) * cw_bytes],
                mod_bits,
                &mut self.field_buf,
            );
            for (i, &v) in self.field_buf.iter().take(cw_scs).enumerate() {
                out[cb * cw_scs + i] = mod_single(v, &self.mod_table);
            }
        }
    }

    /// Precode one antenna's downlink symbol and inverse-transform it to
    /// time-domain int16 samples.
    fn do_ifft(&mut self, tag: Tag) {
        let (frame, sym, ant) = (tag.frame_id(), tag.symbol_id() as usize, tag.ant_id() as usize);
        let dsym = sym - self.cfg.pilot_symbol_num;
        let ants = self.cfg.bs_ant_num;
        let users = self.cfg.ue_num;
        let zbs = self.cfg.zf_block_size;
        let start = self.cfg.ofdm_data_start;

        self.fft_buf.fill(Complex32::default());
        for sc in 0..self.cfg.ofdm_data_num {
            let pre = self.buffers.precoder.window(frame, sc / zbs);
            let w = &pre[(sc % zbs) * users * ants..][..users * ants];
            let mut acc = Complex32::default();
            for ue in 0..users {
                // Downlink reuses the uplink inverse transposed: the
                // conjugate of user `ue`'s weight on this antenna.
                let s = self.buffers.dl_mod.window(frame, dsym * users + ue)[sc];
                acc += w[ue * ants + ant].conj() * s;
            }
            self.fft_buf[start + sc] = acc;
        }
        self.fft.run_inverse(&mut self.fft_buf);

        // Headroom so the int16 quantizer does not clip precoded sums.
        let scale = 1.0 / (users as f32).sqrt();
        for x in self.fft_buf.iter_mut() {
            *x *= scale;
        }

        // SAFETY: one IFFT task exists per (frame, data symbol, antenna).
        let out = unsafe { self.buffers.tx.window_mut(frame, dsym * ants + ant) };
        complex_to_int16(&self.fft_buf, self.cfg.cp_len, out);
    }

    /// Build and transmit one antenna's packet from the TX ring.
    fn do_packet_tx(&mut self, tag: Tag) {
        let (frame, sym, ant) = (tag.frame_id(), tag.symbol_id() as usize, tag.ant_id() as usize);
        let dsym = sym - self.cfg.pilot_symbol_num;
        let ants = self.cfg.bs_ant_num;

        PacketHeader::new(frame, sym as u32, 0, ant as u32).write_to(&mut self.pkt_buf);
        let samples = self.buffers.tx.window(frame, dsym * ants + ant);
        transport::packet::write_samples(&mut self.pkt_buf, samples);
        if let Err(e) = self.tx_clients[ant].send(&self.pkt_buf) {
            error!("worker {}: tx failed on antenna {ant}: {e}", self.tid);
            self.running.fail();
        }
    }
}
