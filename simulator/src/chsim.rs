//! Channel Simulator
//!
//! A bidirectional relay standing between the user emulator and the
//! base-station unit. UE-side RX shards collect uplink packets; once all
//! users of a symbol have arrived, a worker mixes them through a random
//! channel matrix `H` and emits one packet per BS antenna. The downlink
//! path is symmetric through `Hᵀ`. `H` is drawn once and held for the
//! program's lifetime.
//!
//! Port plan: uplink in on `ue_port + ue`, uplink out to `bs_port + ant`,
//! downlink in on `rru_port + ant`, downlink out to
//! `ue_port + ue_num + ue`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use common::config::Config;
use common::types::{Event, EventKind, Tag, TagType, ThreadType};
use common::utils::pin_to_core_with_offset;
use common::DEQUEUE_BULK_SIZE;
use crossbeam_queue::ArrayQueue;
use engine::buffer::FrameRing;
use engine::counters::CounterGrid;
use engine::queue::{schedule, EventQueue};
use engine::{RunFlag, SpinBarrier};
use ndarray::Array2;
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use tracing::{error, info, warn};
use transport::packet::PacketHeader;
use transport::{UdpClient, UdpServer};

#[derive(Debug, Clone)]
pub struct ChSimOptions {
    pub bs_thread_num: usize,
    pub ue_thread_num: usize,
    pub worker_thread_num: usize,
    pub core_offset: usize,
    /// Seed for the channel draw; fixed for reproducible runs.
    pub channel_seed: u64,
}

/// Mix time-domain int16 payload streams through a weight matrix:
/// `out[o] = Σ_i in[i] · w[(i, o)]`, elementwise over complex samples.
pub fn mix_streams(inputs: &[&[i16]], weights: &Array2<Complex32>) -> Vec<Vec<i16>> {
    let n_in = inputs.len();
    let n_out = weights.ncols();
    debug_assert_eq!(weights.nrows(), n_in);
    let samples = inputs[0].len() / 2;

    let mut out = vec![vec![0i16; samples * 2]; n_out];
    for o in 0..n_out {
        for s in 0..samples {
            let mut acc = Complex32::default();
            for (i, input) in inputs.iter().enumerate() {
                let x = Complex32::new(input[2 * s] as f32, input[2 * s + 1] as f32);
                acc += x * weights[(i, o)];
            }
            out[o][2 * s] = acc.re.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            out[o][2 * s + 1] = acc.im.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
    }
    out
}

pub struct ChannelSim {
    cfg: Arc<Config>,
    opts: ChSimOptions,
    channel: Arc<Array2<Complex32>>,
    rx_ue: Arc<FrameRing<i16>>,
    rx_bs: Arc<FrameRing<i16>>,
    running: Arc<RunFlag>,
    relayed_symbols: Arc<AtomicU64>,
}

impl ChannelSim {
    pub fn new(cfg: Config, opts: ChSimOptions) -> Result<Self, crate::SimError> {
        let mut rng = StdRng::seed_from_u64(opts.channel_seed);
        let scale = 1.0 / (cfg.ue_num as f32).sqrt();
        let channel = Array2::from_shape_fn((cfg.ue_num, cfg.bs_ant_num), |_| {
            let re: f32 = StandardNormal.sample(&mut rng);
            let im: f32 = StandardNormal.sample(&mut rng);
            Complex32::new(re, im) * scale
        });

        let samps = 2 * cfg.ofdm_frame_len();
        let ul_windows = cfg.symbol_num_perframe() * cfg.ue_num;
        let dl_windows = cfg.data_symbol_num * cfg.bs_ant_num;
        Ok(ChannelSim {
            rx_ue: Arc::new(FrameRing::new(ul_windows, samps).map_err(crate::SimError::Engine)?),
            rx_bs: Arc::new(FrameRing::new(dl_windows, samps).map_err(crate::SimError::Engine)?),
            cfg: Arc::new(cfg),
            opts,
            channel: Arc::new(channel),
            running: RunFlag::new(),
            relayed_symbols: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn run_flag(&self) -> Arc<RunFlag> {
        self.running.clone()
    }

    pub fn relayed_counter(&self) -> Arc<AtomicU64> {
        self.relayed_symbols.clone()
    }

    /// Run until the flag stops. Blocks the caller as the master.
    pub fn run(&self) -> Result<(), crate::SimError> {
        let cfg = &self.cfg;
        info!(
            "channel simulator: {} users -> {} antennas, {} workers",
            cfg.ue_num, cfg.bs_ant_num, self.opts.worker_thread_num
        );

        let cap = common::TASK_BUFFER_FRAME_NUM
            * cfg.symbol_num_perframe()
            * (cfg.bs_ant_num + cfg.ue_num)
            * 8;
        let message_queue: Arc<EventQueue> = Arc::new(ArrayQueue::new(cap));
        let task_queue_bs: Arc<EventQueue> = Arc::new(ArrayQueue::new(cap));
        let task_queue_ue: Arc<EventQueue> = Arc::new(ArrayQueue::new(cap));
        let shards =
            self.opts.bs_thread_num + self.opts.ue_thread_num + self.opts.worker_thread_num;
        let barrier = SpinBarrier::new(shards + 1);

        let mut handles = Vec::new();
        for tid in 0..self.opts.ue_thread_num {
            let shard = self.ue_rx_shard(tid, message_queue.clone(), barrier.clone())?;
            handles.push(thread::Builder::new().name(format!("ue-rx-{tid}")).spawn(shard)?);
        }
        for tid in 0..self.opts.bs_thread_num {
            let shard = self.bs_rx_shard(tid, message_queue.clone(), barrier.clone())?;
            handles.push(thread::Builder::new().name(format!("bs-rx-{tid}")).spawn(shard)?);
        }
        for tid in 0..self.opts.worker_thread_num {
            let worker = RelayWorker::new(
                tid,
                self.cfg.clone(),
                self.opts.clone(),
                self.channel.clone(),
                self.rx_ue.clone(),
                self.rx_bs.clone(),
                task_queue_bs.clone(),
                task_queue_ue.clone(),
                message_queue.clone(),
                self.running.clone(),
                barrier.clone(),
            )?;
            handles.push(
                thread::Builder::new()
                    .name(format!("relay-{tid}"))
                    .spawn(move || worker.run())?,
            );
        }

        pin_to_core_with_offset(ThreadType::Master, self.opts.core_offset, 0);
        barrier.wait();
        self.master_loop(&message_queue, &task_queue_bs, &task_queue_ue);

        self.running.stop();
        for handle in handles {
            let _ = handle.join();
        }
        if self.running.is_failed() {
            return Err(crate::SimError::Engine(engine::EngineError::Fault(
                "relay shard failure".into(),
            )));
        }
        Ok(())
    }

    fn master_loop(
        &self,
        message_queue: &EventQueue,
        task_queue_bs: &EventQueue,
        task_queue_ue: &EventQueue,
    ) {
        let cfg = &self.cfg;
        let mut ue_rx = CounterGrid::new(cfg.symbol_num_perframe(), cfg.ue_num);
        let mut bs_rx = CounterGrid::new(cfg.data_symbol_num, cfg.bs_ant_num);
        let mut ue_tx = CounterGrid::new(1, cfg.data_symbol_num);
        let mut bs_tx = CounterGrid::new(1, cfg.symbol_num_perframe());

        while self.running.is_running() {
            let mut drained = 0;
            for _ in 0..DEQUEUE_BULK_SIZE {
                let Some(event) = message_queue.pop() else {
                    break;
                };
                drained += 1;
                let tag = event.tag();
                let frame = tag.frame_id();
                let symbol = tag.symbol_id() as usize;

                match (event.kind, tag.tag_type()) {
                    // All users of an uplink symbol arrived: mix toward BS.
                    (EventKind::PacketRx, TagType::Users) => {
                        if ue_rx.add(frame, symbol) {
                            ue_rx.reset(frame, symbol);
                            let task =
                                Event::new(EventKind::PacketTx, Tag::frm_sym_ue(frame, symbol as u16, 0));
                            if schedule(task_queue_bs, task).is_err() {
                                self.running.fail();
                            }
                        }
                    }
                    // All antennas of a downlink symbol arrived: mix toward
                    // the users.
                    (EventKind::PacketRx, TagType::Antennas) => {
                        let dsym = symbol - cfg.pilot_symbol_num;
                        if bs_rx.add(frame, dsym) {
                            bs_rx.reset(frame, dsym);
                            let task =
                                Event::new(EventKind::PacketTx, Tag::frm_sym_ant(frame, symbol as u16, 0));
                            if schedule(task_queue_ue, task).is_err() {
                                self.running.fail();
                            }
                        }
                    }
                    (EventKind::PacketTx, TagType::Users) => {
                        if bs_tx.add(frame, 0) {
                            bs_tx.reset(frame, 0);
                        }
                        self.relayed_symbols.fetch_add(1, Ordering::AcqRel);
                    }
                    (EventKind::PacketTx, TagType::Antennas) => {
                        if ue_tx.add(frame, 0) {
                            ue_tx.reset(frame, 0);
                        }
                        self.relayed_symbols.fetch_add(1, Ordering::AcqRel);
                    }
                    (kind, ty) => warn!("unexpected event {kind:?}/{ty:?}"),
                }
            }
            if drained == 0 {
                std::hint::spin_loop();
            }
        }
    }

    /// Build one UE-side RX closure over its socket range.
    fn ue_rx_shard(
        &self,
        tid: usize,
        message_queue: Arc<EventQueue>,
        barrier: Arc<SpinBarrier>,
    ) -> Result<impl FnOnce() + Send + 'static, crate::SimError> {
        let cfg = self.cfg.clone();
        let lo = tid * cfg.ue_num / self.opts.ue_thread_num;
        let hi = (tid + 1) * cfg.ue_num / self.opts.ue_thread_num;
        let mut servers = Vec::new();
        for ue in lo..hi {
            servers.push(UdpServer::bind(&cfg.ue_addr, cfg.ue_port + ue as u16)?);
        }
        let ring = self.rx_ue.clone();
        let running = self.running.clone();
        let core = self.opts.core_offset + 1;
        Ok(move || {
            pin_to_core_with_offset(ThreadType::WorkerRx, core, tid);
            barrier.wait();
            rx_loop(
                &cfg,
                &servers,
                &ring,
                cfg.ue_num,
                0,
                cfg.symbol_num_perframe(),
                TagType::Users,
                &message_queue,
                &running,
            );
        })
    }

    /// Build one BS-side RX closure over its socket range.
    fn bs_rx_shard(
        &self,
        tid: usize,
        message_queue: Arc<EventQueue>,
        barrier: Arc<SpinBarrier>,
    ) -> Result<impl FnOnce() + Send + 'static, crate::SimError> {
        let cfg = self.cfg.clone();
        let lo = tid * cfg.bs_ant_num / self.opts.bs_thread_num;
        let hi = (tid + 1) * cfg.bs_ant_num / self.opts.bs_thread_num;
        let mut servers = Vec::new();
        for ant in lo..hi {
            servers.push(UdpServer::bind(&cfg.rru_addr, cfg.rru_port + ant as u16)?);
        }
        let ring = self.rx_bs.clone();
        let running = self.running.clone();
        let core = self.opts.core_offset + 1 + self.opts.ue_thread_num;
        Ok(move || {
            pin_to_core_with_offset(ThreadType::WorkerRx, core, tid);
            barrier.wait();
            rx_loop(
                &cfg,
                &servers,
                &ring,
                cfg.bs_ant_num,
                cfg.pilot_symbol_num,
                cfg.symbol_num_perframe(),
                TagType::Antennas,
                &message_queue,
                &running,
            );
        })
    }
}

/// Shared non-blocking receive loop for both shard groups. The ring window
/// is the canonical `(symbol index within the side's schedule) * width +
/// entity` offset.
#[allow(clippy::too_many_arguments)]
fn rx_loop(
    cfg: &Config,
    servers: &[UdpServer],
    ring: &FrameRing<i16>,
    entities: usize,
    symbol_base: usize,
    symbol_limit: usize,
    tag_type: TagType,
    message_queue: &EventQueue,
    running: &RunFlag,
) {
    let packet_len = cfg.packet_length();
    let mut buf = vec![0u8; packet_len];
    let mut socket_id = 0usize;
    while running.is_running() {
        match servers[socket_id].recv_nonblocking(&mut buf) {
            Ok(None) => {}
            Ok(Some(n)) if n != packet_len => {
                warn!("chsim rx: truncated packet ({n} of {packet_len} bytes)");
            }
            Ok(Some(_)) => match PacketHeader::read_from(&buf) {
                Ok(hdr)
                    if (hdr.ant_id as usize) < entities
                        && (hdr.symbol_id as usize) >= symbol_base
                        && (hdr.symbol_id as usize) < symbol_limit =>
                {
                    let sym_idx = hdr.symbol_id as usize - symbol_base;
                    let window = sym_idx * entities + hdr.ant_id as usize;
                    // SAFETY: one packet per (frame, symbol, entity); the
                    // entity's socket belongs to this shard alone.
                    let dst = unsafe { ring.window_mut(hdr.frame_id, window) };
                    for (d, pair) in dst
                        .iter_mut()
                        .zip(transport::packet::payload(&buf).chunks_exact(2))
                    {
                        *d = i16::from_le_bytes([pair[0], pair[1]]);
                    }
                    let tag = match tag_type {
                        TagType::Users => {
                            Tag::frm_sym_ue(hdr.frame_id, hdr.symbol_id as u16, hdr.ant_id as u16)
                        }
                        _ => Tag::frm_sym_ant(hdr.frame_id, hdr.symbol_id as u16, hdr.ant_id as u16),
                    };
                    if schedule(message_queue, Event::new(EventKind::PacketRx, tag)).is_err() {
                        running.fail();
                        return;
                    }
                }
                Ok(hdr) => warn!(
                    "chsim rx: out-of-range header symbol {} entity {}",
                    hdr.symbol_id, hdr.ant_id
                ),
                Err(e) => warn!("chsim rx: bad header: {e}"),
            },
            Err(e) => {
                error!("chsim rx: receive failed: {e}");
                running.fail();
                return;
            }
        }
        socket_id += 1;
        if socket_id == servers.len() {
            socket_id = 0;
        }
    }
}

/// Worker mixing whole symbols through the channel. Prefers BS-bound work;
/// takes UE-bound work only when the BS queue is empty.
struct RelayWorker {
    tid: usize,
    cfg: Arc<Config>,
    opts: ChSimOptions,
    channel: Arc<Array2<Complex32>>,
    rx_ue: Arc<FrameRing<i16>>,
    rx_bs: Arc<FrameRing<i16>>,
    task_queue_bs: Arc<EventQueue>,
    task_queue_ue: Arc<EventQueue>,
    message_queue: Arc<EventQueue>,
    running: Arc<RunFlag>,
    barrier: Arc<SpinBarrier>,
    bs_clients: Vec<UdpClient>,
    ue_clients: Vec<UdpClient>,
    channel_t: Array2<Complex32>,
    pkt_buf: Vec<u8>,
}

impl RelayWorker {
    #[allow(clippy::too_many_arguments)]
    fn new(
        tid: usize,
        cfg: Arc<Config>,
        opts: ChSimOptions,
        channel: Arc<Array2<Complex32>>,
        rx_ue: Arc<FrameRing<i16>>,
        rx_bs: Arc<FrameRing<i16>>,
        task_queue_bs: Arc<EventQueue>,
        task_queue_ue: Arc<EventQueue>,
        message_queue: Arc<EventQueue>,
        running: Arc<RunFlag>,
        barrier: Arc<SpinBarrier>,
    ) -> Result<Self, crate::SimError> {
        let mut bs_clients = Vec::new();
        for ant in 0..cfg.bs_ant_num {
            bs_clients.push(UdpClient::connect(&cfg.bs_addr, cfg.bs_port + ant as u16)?);
        }
        let mut ue_clients = Vec::new();
        for ue in 0..cfg.ue_num {
            ue_clients.push(UdpClient::connect(
                &cfg.ue_addr,
                cfg.ue_port + (cfg.ue_num + ue) as u16,
            )?);
        }
        Ok(RelayWorker {
            tid,
            pkt_buf: vec![0u8; cfg.packet_length()],
            channel_t: channel.t().to_owned(),
            cfg,
            opts,
            channel,
            rx_ue,
            rx_bs,
            task_queue_bs,
            task_queue_ue,
            message_queue,
            running,
            barrier,
            bs_clients,
            ue_clients,
        })
    }

    fn run(mut self) {
        let core = self.opts.core_offset + 1 + self.opts.ue_thread_num + self.opts.bs_thread_num;
        pin_to_core_with_offset(ThreadType::Worker, core, self.tid);
        self.barrier.wait();

        while self.running.is_running() {
            if let Some(event) = self.task_queue_bs.pop() {
                self.relay_to_bs(event.tag());
            } else if let Some(event) = self.task_queue_ue.pop() {
                self.relay_to_ue(event.tag());
            } else {
                std::hint::spin_loop();
            }
        }
    }

    fn relay_to_bs(&mut self, tag: Tag) {
        let cfg = &self.cfg;
        let (frame, symbol) = (tag.frame_id(), tag.symbol_id() as usize);
        let inputs: Vec<&[i16]> = (0..cfg.ue_num)
            .map(|ue| self.rx_ue.window(frame, symbol * cfg.ue_num + ue))
            .collect();
        let streams = mix_streams(&inputs, &self.channel);
        for (ant, samples) in streams.iter().enumerate() {
            PacketHeader::new(frame, symbol as u32, 0, ant as u32).write_to(&mut self.pkt_buf);
            transport::packet::write_samples(&mut self.pkt_buf, samples);
            if let Err(e) = self.bs_clients[ant].send(&self.pkt_buf) {
                error!("relay {}: bs send failed: {e}", self.tid);
                self.running.fail();
                return;
            }
        }
        let done = Event::new(EventKind::PacketTx, Tag::frm_sym_ue(frame, symbol as u16, 0));
        if schedule(&self.message_queue, done).is_err() {
            self.running.fail();
        }
    }

    fn relay_to_ue(&mut self, tag: Tag) {
        let cfg = &self.cfg;
        let (frame, symbol) = (tag.frame_id(), tag.symbol_id() as usize);
        let dsym = symbol - cfg.pilot_symbol_num;
        let inputs: Vec<&[i16]> = (0..cfg.bs_ant_num)
            .map(|ant| self.rx_bs.window(frame, dsym * cfg.bs_ant_num + ant))
            .collect();
        let streams = mix_streams(&inputs, &self.channel_t);
        for (ue, samples) in streams.iter().enumerate() {
            PacketHeader::new(frame, symbol as u32, 0, ue as u32).write_to(&mut self.pkt_buf);
            transport::packet::write_samples(&mut self.pkt_buf, samples);
            if let Err(e) = self.ue_clients[ue].send(&self.pkt_buf) {
                error!("relay {}: ue send failed: {e}", self.tid);
                self.running.fail();
                return;
            }
        }
        let done = Event::new(EventKind::PacketTx, Tag::frm_sym_ant(frame, symbol as u16, 0));
        if schedule(&self.message_queue, done).is_err() {
            self.running.fail();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_streams_identity() {
        let eye = Array2::from_shape_fn((2, 2), |(i, j)| {
            Complex32::new(if i == j { 1.0 } else { 0.0 }, 0.0)
        });
        let a: Vec<i16> = vec![100, -200, 300, -400];
        let b: Vec<i16> = vec![1, 2, 3, 4];
        let out = mix_streams(&[&a, &b], &eye);
        assert_eq!(out[0], a);
        assert_eq!(out[1], b);
    }

    #[test]
    fn test_mix_streams_sums_users() {
        // Both outputs see the plain sum of the two inputs.
        let ones = Array2::from_elem((2, 2), Complex32::new(1.0, 0.0));
        let a: Vec<i16> = vec![10, 20];
        let b: Vec<i16> = vec![5, -20];
        let out = mix_streams(&[&a, &b], &ones);
        assert_eq!(out[0], vec![15, 0]);
        assert_eq!(out[1], vec![15, 0]);
    }

    #[test]
    fn test_mix_streams_complex_rotation() {
        // Weight j rotates (re, im) to (-im, re).
        let j = Array2::from_elem((1, 1), Complex32::new(0.0, 1.0));
        let input: Vec<i16> = vec![100, 50];
        let out = mix_streams(&[&input], &j);
        assert_eq!(out[0], vec![-50, 100]);
    }
}
