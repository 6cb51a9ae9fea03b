//! Frame State Machine
//!
//! The master's view of every in-flight frame: per-slot arrival and
//! completion counters plus the stage-transition rules. This module is pure
//! state; the master loop feeds it events and routes the tasks it emits to
//! the worker queues.
//!
//! Stage gating (uplink): packets → FFT per antenna; pilot FFTs → CSI per
//! pilot symbol; all CSI → ZF per subcarrier block; ZF plus a data symbol's
//! FFTs → equalize/demod per subcarrier block; all blocks of a symbol →
//! decode per user; all decodes → frame delivered. Downlink replaces the
//! data path with encode → modulate → (ZF-gated) IFFT per antenna →
//! transmit. Tasks are emitted subcarrier-block ascending, then antenna
//! ascending, so placement is deterministic.

use common::config::Config;
use common::types::{Event, EventKind, Tag, TagType};
use common::TASK_BUFFER_FRAME_NUM;
use tracing::{debug, warn};

use crate::counters::CounterGrid;

/// What one event did to the frame state, beyond emitting tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    None,
    /// First packet of a frame accepted; the slot is now owned.
    FrameStarted(u32),
    /// All stage counters fired; the slot is free for reuse.
    FrameDelivered(u32),
}

pub struct Pipeline {
    bs_ant_num: usize,
    ue_num: usize,
    pilot_num: usize,
    data_num: usize,
    zf_blocks: usize,
    zf_block_size: usize,
    demul_blocks: usize,
    demul_block_size: usize,
    downlink: bool,

    rx_counters: CounterGrid,
    fft_counters: CounterGrid,
    csi_counters: CounterGrid,
    zf_counters: CounterGrid,
    demul_counters: CounterGrid,
    decode_counters: CounterGrid,
    encode_counters: CounterGrid,
    modulate_counters: CounterGrid,
    ifft_counters: CounterGrid,
    tx_counters: CounterGrid,

    slot_frame: Vec<Option<u32>>,
    zf_done: Vec<bool>,
    fft_ready: Vec<bool>,
    mod_ready: Vec<bool>,

    delivered: u64,
    dropped_frames: u64,
}

impl Pipeline {
    pub fn new(cfg: &Config) -> Self {
        let a = cfg.bs_ant_num;
        let u = cfg.ue_num;
        let s = cfg.symbol_num_perframe();
        let d = cfg.data_symbol_num;
        Pipeline {
            bs_ant_num: a,
            ue_num: u,
            pilot_num: cfg.pilot_symbol_num,
            data_num: d,
            zf_blocks: cfg.zf_blocks(),
            zf_block_size: cfg.zf_block_size,
            demul_blocks: cfg.demul_blocks(),
            demul_block_size: cfg.demul_block_size,
            downlink: cfg.downlink_mode,
            rx_counters: CounterGrid::new(s, a),
            fft_counters: CounterGrid::new(s, a),
            csi_counters: CounterGrid::new(1, cfg.pilot_symbol_num),
            zf_counters: CounterGrid::new(1, cfg.zf_blocks()),
            demul_counters: CounterGrid::new(d, cfg.demul_blocks()),
            decode_counters: CounterGrid::new(1, d * u),
            encode_counters: CounterGrid::new(d, u),
            modulate_counters: CounterGrid::new(d, u),
            ifft_counters: CounterGrid::new(d, a),
            tx_counters: CounterGrid::new(1, d * a),
            slot_frame: vec![None; TASK_BUFFER_FRAME_NUM],
            zf_done: vec![false; TASK_BUFFER_FRAME_NUM],
            fft_ready: vec![false; TASK_BUFFER_FRAME_NUM * d],
            mod_ready: vec![false; TASK_BUFFER_FRAME_NUM * d],
            delivered: 0,
            dropped_frames: 0,
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    fn slot(frame_id: u32) -> usize {
        frame_id as usize % TASK_BUFFER_FRAME_NUM
    }

    /// True when every stage counter of the frame's slot is zero.
    pub fn slot_counters_clear(&self, frame_id: u32) -> bool {
        self.rx_counters.slot_is_clear(frame_id)
            && self.fft_counters.slot_is_clear(frame_id)
            && self.csi_counters.slot_is_clear(frame_id)
            && self.zf_counters.slot_is_clear(frame_id)
            && self.demul_counters.slot_is_clear(frame_id)
            && self.decode_counters.slot_is_clear(frame_id)
            && self.encode_counters.slot_is_clear(frame_id)
            && self.modulate_counters.slot_is_clear(frame_id)
            && self.ifft_counters.slot_is_clear(frame_id)
            && self.tx_counters.slot_is_clear(frame_id)
    }

    fn clear_slot(&mut self, frame_id: u32) {
        let slot = Self::slot(frame_id);
        self.rx_counters.clear_slot(frame_id);
        self.fft_counters.clear_slot(frame_id);
        self.csi_counters.clear_slot(frame_id);
        self.zf_counters.clear_slot(frame_id);
        self.demul_counters.clear_slot(frame_id);
        self.decode_counters.clear_slot(frame_id);
        self.encode_counters.clear_slot(frame_id);
        self.modulate_counters.clear_slot(frame_id);
        self.ifft_counters.clear_slot(frame_id);
        self.tx_counters.clear_slot(frame_id);
        self.zf_done[slot] = false;
        for d in 0..self.data_num {
            self.fft_ready[slot * self.data_num + d] = false;
            self.mod_ready[slot * self.data_num + d] = false;
        }
    }

    /// Accept a packet's frame id, claiming or recycling its slot.
    /// Returns `None` for stale packets that must be ignored.
    fn claim_slot(&mut self, frame_id: u32, out: &mut Vec<Event>) -> Option<Progress> {
        let slot = Self::slot(frame_id);
        match self.slot_frame[slot] {
            Some(owner) if owner == frame_id => Some(Progress::None),
            Some(owner) => {
                // Wrapping order decides who is newer.
                if frame_id.wrapping_sub(owner) < u32::MAX / 2 {
                    // The old frame never finished: data loss, recycle.
                    warn!(
                        "slot {slot}: frame {frame_id} evicts incomplete frame {owner}"
                    );
                    self.dropped_frames += 1;
                    self.clear_slot(frame_id);
                    self.slot_frame[slot] = Some(frame_id);
                    self.start_frame(frame_id, out);
                    Some(Progress::FrameStarted(frame_id))
                } else {
                    debug!("ignoring stale packet of frame {frame_id} (slot owner {owner})");
                    None
                }
            }
            None => {
                debug_assert!(self.slot_counters_clear(frame_id));
                self.slot_frame[slot] = Some(frame_id);
                self.start_frame(frame_id, out);
                Some(Progress::FrameStarted(frame_id))
            }
        }
    }

    /// Work that begins at frame start: downlink encoding does not wait for
    /// the air interface.
    fn start_frame(&mut self, frame_id: u32, out: &mut Vec<Event>) {
        if self.downlink {
            for dsym in 0..self.data_num {
                let symbol = (self.pilot_num + dsym) as u16;
                for ue in 0..self.ue_num as u16 {
                    out.push(Event::new(EventKind::Encode, Tag::frm_sym_ue(frame_id, symbol, ue)));
                }
            }
        }
    }

    fn emit_fft(&self, frame_id: u32, symbol: u16, out: &mut Vec<Event>) {
        for ant in 0..self.bs_ant_num as u16 {
            out.push(Event::new(EventKind::Fft, Tag::frm_sym_ant(frame_id, symbol, ant)));
        }
    }

    fn emit_demul(&self, frame_id: u32, symbol: u16, out: &mut Vec<Event>) {
        for blk in 0..self.demul_blocks {
            let base_sc = (blk * self.demul_block_size) as u16;
            out.push(Event::new(EventKind::Demul, Tag::frm_sym_sc(frame_id, symbol, base_sc)));
        }
    }

    fn emit_ifft(&self, frame_id: u32, symbol: u16, out: &mut Vec<Event>) {
        for ant in 0..self.bs_ant_num as u16 {
            out.push(Event::new(EventKind::Ifft, Tag::frm_sym_ant(frame_id, symbol, ant)));
        }
    }

    fn deliver(&mut self, frame_id: u32) -> Progress {
        let slot = Self::slot(frame_id);
        self.slot_frame[slot] = None;
        self.zf_done[slot] = false;
        for d in 0..self.data_num {
            self.fft_ready[slot * self.data_num + d] = false;
            self.mod_ready[slot * self.data_num + d] = false;
        }
        self.delivered += 1;
        debug_assert!(self.slot_counters_clear(frame_id));
        Progress::FrameDelivered(frame_id)
    }

    /// Advance the state machine by one event, pushing emitted tasks onto
    /// `out` in deterministic order.
    pub fn handle(&mut self, event: Event, out: &mut Vec<Event>) -> Progress {
        let tag = event.tag();
        let frame_id = tag.frame_id();
        let symbol = tag.symbol_id();
        let slot = Self::slot(frame_id);

        match event.kind {
            EventKind::PacketRx => {
                debug_assert_eq!(tag.tag_type(), TagType::Antennas);
                let Some(progress) = self.claim_slot(frame_id, out) else {
                    return Progress::None;
                };
                if self.rx_counters.add(frame_id, symbol as usize) {
                    self.rx_counters.reset(frame_id, symbol as usize);
                    self.emit_fft(frame_id, symbol, out);
                }
                progress
            }

            EventKind::Fft => {
                if self.fft_counters.add(frame_id, symbol as usize) {
                    self.fft_counters.reset(frame_id, symbol as usize);
                    if (symbol as usize) < self.pilot_num {
                        let ue = symbol;
                        out.push(Event::new(EventKind::Csi, Tag::frm_sym_ue(frame_id, symbol, ue)));
                    } else {
                        let dsym = symbol as usize - self.pilot_num;
                        if self.zf_done[slot] {
                            self.emit_demul(frame_id, symbol, out);
                        } else {
                            self.fft_ready[slot * self.data_num + dsym] = true;
                        }
                    }
                }
                Progress::None
            }

            EventKind::Csi => {
                if self.csi_counters.add(frame_id, 0) {
                    self.csi_counters.reset(frame_id, 0);
                    for blk in 0..self.zf_blocks {
                        let base_sc = (blk * self.zf_block_size) as u16;
                        out.push(Event::new(EventKind::Zf, Tag::frm_sc(frame_id, base_sc)));
                    }
                }
                Progress::None
            }

            EventKind::Zf => {
                if self.zf_counters.add(frame_id, 0) {
                    self.zf_counters.reset(frame_id, 0);
                    self.zf_done[slot] = true;
                    for dsym in 0..self.data_num {
                        let symbol = (self.pilot_num + dsym) as u16;
                        if self.fft_ready[slot * self.data_num + dsym] {
                            self.fft_ready[slot * self.data_num + dsym] = false;
                            self.emit_demul(frame_id, symbol, out);
                        }
                        if self.mod_ready[slot * self.data_num + dsym] {
                            self.mod_ready[slot * self.data_num + dsym] = false;
                            self.emit_ifft(frame_id, symbol, out);
                        }
                    }
                }
                Progress::None
            }

            EventKind::Demul => {
                let dsym = symbol as usize - self.pilot_num;
                if self.demul_counters.add(frame_id, dsym) {
                    self.demul_counters.reset(frame_id, dsym);
                    for ue in 0..self.ue_num as u16 {
                        out.push(Event::new(EventKind::Decode, Tag::frm_sym_ue(frame_id, symbol, ue)));
                    }
                }
                Progress::None
            }

            EventKind::Decode => {
                if self.decode_counters.add(frame_id, 0) {
                    self.decode_counters.reset(frame_id, 0);
                    self.deliver(frame_id)
                } else {
                    Progress::None
                }
            }

            EventKind::Encode => {
                let dsym = symbol as usize - self.pilot_num;
                if self.encode_counters.add(frame_id, dsym) {
                    self.encode_counters.reset(frame_id, dsym);
                    for ue in 0..self.ue_num as u16 {
                        out.push(Event::new(EventKind::Modulate, Tag::frm_sym_ue(frame_id, symbol, ue)));
                    }
                }
                Progress::None
            }

            EventKind::Modulate => {
                let dsym = symbol as usize - self.pilot_num;
                if self.modulate_counters.add(frame_id, dsym) {
                    self.modulate_counters.reset(frame_id, dsym);
                    if self.zf_done[slot] {
                        self.emit_ifft(frame_id, symbol, out);
                    } else {
                        self.mod_ready[slot * self.data_num + dsym] = true;
                    }
                }
                Progress::None
            }

            EventKind::Ifft => {
                let dsym = symbol as usize - self.pilot_num;
                if self.ifft_counters.add(frame_id, dsym) {
                    self.ifft_counters.reset(frame_id, dsym);
                    for ant in 0..self.bs_ant_num as u16 {
                        out.push(Event::new(EventKind::PacketTx, Tag::frm_sym_ant(frame_id, symbol, ant)));
                    }
                }
                Progress::None
            }

            EventKind::PacketTx => {
                if self.tx_counters.add(frame_id, 0) {
                    self.tx_counters.reset(frame_id, 0);
                    self.deliver(frame_id)
                } else {
                    Progress::None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::LdpcConfig;
    use std::collections::VecDeque;

    fn small_config() -> Config {
        let cfg = Config {
            bs_ant_num: 4,
            ue_num: 2,
            ofdm_ca_num: 64,
            ofdm_data_num: 48,
            ofdm_data_start: 8,
            cp_len: 0,
            pilot_symbol_num: 2,
            data_symbol_num: 4,
            downlink_mode: false,
            modulation: "16QAM".to_string(),
            ldpc: LdpcConfig {
                bg: 2,
                zc: 4,
                n_rows: 8,
                cb_len: 40,
                cb_codew_len: 160,
                decoder_iter: 5,
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
            frames_to_test: 10,
        };
        cfg.validate().unwrap();
        cfg
    }

    /// Feed all packets of one frame, then answer every emitted task with
    /// its completion, breadth-first. Returns the delivery flag and the
    /// total number of tasks completed.
    fn run_frame(pipeline: &mut Pipeline, cfg: &Config, frame_id: u32, skip_symbol: Option<u16>) -> (bool, usize) {
        let mut queue: VecDeque<Event> = VecDeque::new();
        let symbols = if cfg.downlink_mode {
            cfg.pilot_symbol_num
        } else {
            cfg.symbol_num_perframe()
        };
        for sym in 0..symbols as u16 {
            if Some(sym) == skip_symbol {
                continue;
            }
            for ant in 0..cfg.bs_ant_num as u16 {
                queue.push_back(Event::new(EventKind::PacketRx, Tag::frm_sym_ant(frame_id, sym, ant)));
            }
        }

        let mut delivered = false;
        let mut completions = 0usize;
        let mut tasks = Vec::new();
        while let Some(ev) = queue.pop_front() {
            tasks.clear();
            let progress = pipeline.handle(ev, &mut tasks);
            if matches!(progress, Progress::FrameDelivered(f) if f == frame_id) {
                delivered = true;
            }
            for task in &tasks {
                // The worker pool: every task completes exactly once, with
                // the same tag.
                completions += 1;
                queue.push_back(*task);
            }
        }
        (delivered, completions)
    }

    #[test]
    fn test_uplink_frame_delivers_with_expected_task_count() {
        let cfg = small_config();
        let mut pipeline = Pipeline::new(&cfg);
        let (delivered, completions) = run_frame(&mut pipeline, &cfg, 0, None);
        assert!(delivered);
        assert!(pipeline.slot_counters_clear(0));

        let s = cfg.symbol_num_perframe();
        let expect = s * cfg.bs_ant_num            // FFT
            + cfg.pilot_symbol_num                 // CSI
            + cfg.zf_blocks()                      // ZF
            + cfg.data_symbol_num * cfg.demul_blocks()
            + cfg.data_symbol_num * cfg.ue_num;    // decode
        assert_eq!(completions, expect);
        assert_eq!(pipeline.delivered(), 1);
        assert_eq!(pipeline.dropped_frames(), 0);
    }

    #[test]
    fn test_dropped_symbol_stalls_only_its_frame() {
        let cfg = small_config();
        let mut pipeline = Pipeline::new(&cfg);
        // Lose all antennas of data symbol 3 in frame 7.
        let (delivered7, _) = run_frame(&mut pipeline, &cfg, 7, Some(3));
        assert!(!delivered7);
        assert_eq!(pipeline.delivered(), 0);

        // Frame 8 lands in a different slot and is unaffected.
        let (delivered8, _) = run_frame(&mut pipeline, &cfg, 8, None);
        assert!(delivered8);
        assert_eq!(pipeline.delivered(), 1);
    }

    #[test]
    fn test_wraparound_200_frames_no_drops() {
        let cfg = small_config();
        let mut pipeline = Pipeline::new(&cfg);
        for frame in 0..200u32 {
            // Slot must be fully clear before its next tenant arrives.
            assert!(pipeline.slot_counters_clear(frame), "slot dirty at frame {frame}");
            let (delivered, _) = run_frame(&mut pipeline, &cfg, frame, None);
            assert!(delivered, "frame {frame} not delivered");
        }
        assert_eq!(pipeline.delivered(), 200);
        assert_eq!(pipeline.dropped_frames(), 0);
    }

    #[test]
    fn test_slot_reuse_hazard_drops_stalled_frame() {
        let cfg = small_config();
        let mut pipeline = Pipeline::new(&cfg);

        // Frame 2 stalls: one packet only.
        let mut out = Vec::new();
        pipeline.handle(
            Event::new(EventKind::PacketRx, Tag::frm_sym_ant(2, 0, 0)),
            &mut out,
        );
        assert!(!pipeline.slot_counters_clear(2));

        // One ring later its slot is claimed by frame 2 + F.
        let f = TASK_BUFFER_FRAME_NUM as u32;
        let (delivered, _) = run_frame(&mut pipeline, &cfg, 2 + f, None);
        assert!(delivered);
        assert_eq!(pipeline.dropped_frames(), 1);
    }

    #[test]
    fn test_stale_packet_ignored() {
        let cfg = small_config();
        let mut pipeline = Pipeline::new(&cfg);
        let f = TASK_BUFFER_FRAME_NUM as u32;
        let (delivered, _) = run_frame(&mut pipeline, &cfg, 2 + f, None);
        assert!(delivered);

        // While the newer frame still owns the slot, its stragglers are
        // ignored rather than treated as an eviction.
        let mut out = Vec::new();
        pipeline.handle(
            Event::new(EventKind::PacketRx, Tag::frm_sym_ant(2 + f, 0, 0)),
            &mut out,
        );
        let before = pipeline.dropped_frames();
        let mut out = Vec::new();
        pipeline.handle(
            Event::new(EventKind::PacketRx, Tag::frm_sym_ant(2, 0, 0)),
            &mut out,
        );
        assert_eq!(pipeline.dropped_frames(), before);
        assert!(out.is_empty());
    }

    #[test]
    fn test_downlink_frame_delivers() {
        let mut cfg = small_config();
        cfg.downlink_mode = true;
        let mut pipeline = Pipeline::new(&cfg);
        let (delivered, completions) = run_frame(&mut pipeline, &cfg, 0, None);
        assert!(delivered);

        let expect = cfg.pilot_symbol_num * cfg.bs_ant_num   // FFT of pilots
            + cfg.pilot_symbol_num                           // CSI
            + cfg.zf_blocks()                                // ZF
            + cfg.data_symbol_num * cfg.ue_num * 2           // encode + modulate
            + cfg.data_symbol_num * cfg.bs_ant_num * 2;      // IFFT + TX
        assert_eq!(completions, expect);
    }
}
