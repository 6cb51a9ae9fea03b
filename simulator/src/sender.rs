//! Paced Packet Sender
//!
//! Replays prepared IQ at a configured frame cadence as if it were a live
//! base-station radio head. One master thread owns the pacing and the
//! per-symbol completion counters; TX worker shards own disjoint antenna
//! sets and the sockets for them. The master seeds one task per antenna for
//! symbol 0, then emits the next symbol's tasks each time a symbol finishes
//! and the cycle budget has been burnt.
//!
//! Slow start widens the budget for early frames so the receiver's pipeline
//! warms up before the configured rate is applied.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use common::config::Config;
use common::types::{Event, EventKind, Tag, ThreadType};
use common::utils::{get_time_us, pin_to_core_with_offset, Pacer};
use common::DEQUEUE_BULK_SIZE;
use crossbeam_queue::ArrayQueue;
use engine::buffer::FrameRing;
use engine::counters::CounterGrid;
use engine::queue::{schedule, EventQueue};
use engine::stats::FrameStats;
use engine::{RunFlag, SpinBarrier};
use tracing::{error, info};
use transport::packet::PacketHeader;
use transport::UdpClient;

/// Command-line knobs of the sender binary.
#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub thread_num: usize,
    pub core_offset: usize,
    /// Microseconds per frame at the steady-state rate.
    pub delay_us: u64,
    pub enable_slow_start: bool,
    pub frames_to_send: usize,
}

/// The slow-start tick schedule: per-symbol cycle budgets by transmitted
/// frame count.
#[derive(Debug, Clone, Copy)]
pub struct SlowStart {
    enabled: bool,
    ticks_5: u64,
    ticks_100: u64,
    ticks_200: u64,
    ticks_500: u64,
    ticks_all: u64,
}

impl SlowStart {
    pub fn new(pacer: &Pacer, delay_us: u64, symbols_per_frame: usize, enabled: bool) -> Self {
        let per_symbol = |us: f64| pacer.us_to_ticks(us) / symbols_per_frame as u64;
        SlowStart {
            enabled,
            ticks_5: per_symbol(5.0e5),
            ticks_100: per_symbol(1.5e5),
            ticks_200: per_symbol(2.0e4),
            ticks_500: per_symbol(1.0e4),
            ticks_all: per_symbol(delay_us as f64),
        }
    }

    /// Cycle budget for one symbol of frame `tx_frame`.
    pub fn budget(&self, tx_frame: u64) -> u64 {
        if !self.enabled {
            self.ticks_all
        } else if tx_frame <= 5 {
            self.ticks_5
        } else if tx_frame < 100 {
            self.ticks_100
        } else if tx_frame < 200 {
            self.ticks_200
        } else if tx_frame < 500 {
            self.ticks_500
        } else {
            self.ticks_all
        }
    }

    /// Extra gap after a whole frame in downlink mode.
    pub fn frame_gap(&self, downlink: bool, tx_frame: u64, data_symbols: usize) -> u64 {
        if !downlink {
            0
        } else if tx_frame < 500 {
            2 * data_symbols as u64 * self.ticks_all
        } else {
            data_symbols as u64 * self.ticks_all
        }
    }
}

/// Load one frame's IQ from the data directory, preferring the LDPC
/// variant when the configuration carries an LDPC section. Rows are
/// `(symbol, antenna)`-major float32 pairs, quantized to wire int16.
pub fn load_iq(cfg: &Config, dir: &Path) -> Result<Vec<Vec<i16>>, crate::SimError> {
    let ldpc_name = format!("LDPC_rx_data_2048_ant{}.bin", cfg.bs_ant_num);
    let plain_name = format!("rx_data_2048_ant{}.bin", cfg.bs_ant_num);
    let path = if dir.join(&ldpc_name).exists() {
        dir.join(&ldpc_name)
    } else if dir.join(&plain_name).exists() {
        dir.join(&plain_name)
    } else {
        return Err(crate::SimError::MissingData(format!(
            "{} (or {}) under {}",
            ldpc_name,
            plain_name,
            dir.display()
        )));
    };
    info!("loading IQ from {}", path.display());

    let bytes = std::fs::read(&path)?;
    let samples_per_row = 2 * cfg.ofdm_frame_len();
    let rows = cfg.symbol_num_perframe() * cfg.bs_ant_num;
    let want = rows * samples_per_row * 4;
    if bytes.len() < want {
        return Err(crate::SimError::MissingData(format!(
            "{}: {} bytes, want {want}",
            path.display(),
            bytes.len()
        )));
    }

    let mut iq = Vec::with_capacity(rows);
    for row in 0..rows {
        let base = row * samples_per_row * 4;
        let samples: Vec<i16> = (0..samples_per_row)
            .map(|i| {
                let off = base + i * 4;
                let v = f32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
                (v * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16
            })
            .collect();
        iq.push(samples);
    }
    Ok(iq)
}

#[derive(Debug)]
pub struct SenderReport {
    pub frames_sent: u64,
    pub elapsed_us: f64,
}

pub struct Sender {
    cfg: Arc<Config>,
    opts: SenderOptions,
    iq: Arc<Vec<Vec<i16>>>,
    ring: Arc<FrameRing<u8>>,
    running: Arc<RunFlag>,
    sent_frames: Arc<AtomicU64>,
    max_symbol: usize,
}

impl Sender {
    pub fn new(cfg: Config, opts: SenderOptions, iq: Vec<Vec<i16>>) -> Result<Self, crate::SimError> {
        // Downlink frames only carry the user pilots on the air interface.
        let max_symbol = if cfg.downlink_mode {
            cfg.ue_num
        } else {
            cfg.symbol_num_perframe()
        };
        let ring = FrameRing::new(max_symbol * cfg.bs_ant_num, cfg.packet_length())
            .map_err(crate::SimError::Engine)?;
        Ok(Sender {
            cfg: Arc::new(cfg),
            opts,
            iq: Arc::new(iq),
            ring: Arc::new(ring),
            running: RunFlag::new(),
            sent_frames: Arc::new(AtomicU64::new(0)),
            max_symbol,
        })
    }

    pub fn run_flag(&self) -> Arc<RunFlag> {
        self.running.clone()
    }

    pub fn sent_counter(&self) -> Arc<AtomicU64> {
        self.sent_frames.clone()
    }

    fn write_packet(&self, frame_id: u32, symbol: usize, ant: usize) {
        let window = symbol * self.cfg.bs_ant_num + ant;
        // SAFETY: the master is the only writer, and it only refreshes a
        // window after the worker's completion for it has come back.
        let pkt = unsafe { self.ring.window_mut(frame_id, window) };
        PacketHeader::new(frame_id, symbol as u32, 0, ant as u32).write_to(pkt);
        transport::packet::write_samples(pkt, &self.iq[window]);
    }

    /// Run the sender to completion. Blocks the caller as the master.
    pub fn run(&self) -> Result<SenderReport, crate::SimError> {
        let cfg = &self.cfg;
        let ants = cfg.bs_ant_num;
        let workers = self.opts.thread_num;
        let pacer = Pacer::calibrated();
        let schedule_ticks = SlowStart::new(
            &pacer,
            self.opts.delay_us,
            self.max_symbol,
            self.opts.enable_slow_start,
        );
        info!(
            "sender: {} workers, {} symbols/frame, delay {} us, slow start {}, tsc {:.2} GHz",
            workers,
            self.max_symbol,
            self.opts.delay_us,
            self.opts.enable_slow_start,
            pacer.freq_ghz()
        );

        // Preload one ring generation: frames 0..F map straight to slots.
        for slot in 0..common::BUFFER_FRAME_NUM as u32 {
            for symbol in 0..self.max_symbol {
                for ant in 0..ants {
                    self.write_packet(slot, symbol, ant);
                }
            }
        }

        let cap = common::BUFFER_FRAME_NUM * self.max_symbol * ants * 4;
        let message_queue: Arc<EventQueue> = Arc::new(ArrayQueue::new(cap));
        let task_queues: Vec<Arc<EventQueue>> = (0..workers)
            .map(|_| Arc::new(ArrayQueue::new(cap)))
            .collect();
        let barrier = SpinBarrier::new(workers + 1);

        let mut handles = Vec::new();
        for tid in 0..workers {
            let shard = TxShard::new(
                tid,
                workers,
                self.opts.core_offset,
                cfg.clone(),
                self.ring.clone(),
                task_queues[tid].clone(),
                message_queue.clone(),
                self.running.clone(),
                barrier.clone(),
                self.max_symbol,
            )?;
            handles.push(
                thread::Builder::new()
                    .name(format!("tx-{tid}"))
                    .spawn(move || shard.run())?,
            );
        }

        pin_to_core_with_offset(ThreadType::Master, self.opts.core_offset, 0);
        barrier.wait();

        let result = self.master_loop(&task_queues, &message_queue, &pacer, &schedule_ticks);

        self.running.stop();
        for handle in handles {
            let _ = handle.join();
        }
        result
    }

    fn master_loop(
        &self,
        task_queues: &[Arc<EventQueue>],
        message_queue: &EventQueue,
        pacer: &Pacer,
        ticks: &SlowStart,
    ) -> Result<SenderReport, crate::SimError> {
        let cfg = &self.cfg;
        let ants = cfg.bs_ant_num;
        let workers = task_queues.len();
        let mut symbol_counts = CounterGrid::new(self.max_symbol, ants);
        let mut frame_counts = CounterGrid::new(1, self.max_symbol);
        let mut stats = FrameStats::new(self.opts.frames_to_send);
        let mut tx_frame_count: u64 = 0;

        let emit_symbol = |frame: u32, symbol: usize| -> Result<(), crate::SimError> {
            for ant in 0..ants {
                let ev = Event::new(
                    EventKind::PacketTx,
                    Tag::frm_sym_ant(frame, symbol as u16, ant as u16),
                );
                schedule(&task_queues[ant % workers], ev).map_err(crate::SimError::Engine)?;
            }
            Ok(())
        };

        let start_us = get_time_us();
        stats.record_start(start_us);
        emit_symbol(0, 0)?;
        let mut tick_start = pacer.now();

        while self.running.is_running() && tx_frame_count < self.opts.frames_to_send as u64 {
            let mut drained = 0;
            for _ in 0..DEQUEUE_BULK_SIZE {
                let Some(event) = message_queue.pop() else {
                    break;
                };
                drained += 1;
                let tag = event.tag();
                let (frame, symbol) = (tag.frame_id(), tag.symbol_id() as usize);

                // Keep the ring fresh one generation ahead: the slot this
                // packet occupied now belongs to frame + F.
                self.write_packet(
                    frame.wrapping_add(common::BUFFER_FRAME_NUM as u32),
                    symbol,
                    tag.ant_id() as usize,
                );

                if !symbol_counts.add(frame, symbol) {
                    continue;
                }
                symbol_counts.reset(frame, symbol);

                pacer.wait_until(tick_start, ticks.budget(tx_frame_count));
                tick_start = pacer.now();

                if frame_counts.add(frame, 0) {
                    frame_counts.reset(frame, 0);
                    stats.record_end(get_time_us());
                    tx_frame_count += 1;
                    self.sent_frames.store(tx_frame_count, Ordering::Release);

                    let gap = ticks.frame_gap(cfg.downlink_mode, tx_frame_count, cfg.data_symbol_num);
                    if gap > 0 {
                        pacer.wait_until(tick_start, gap);
                    }
                    tick_start = pacer.now();
                    stats.record_start(get_time_us());
                }

                // Emit the next symbol in the global send order.
                let (next_frame, next_symbol) = if symbol + 1 < self.max_symbol {
                    (frame, symbol + 1)
                } else {
                    (frame.wrapping_add(1), 0)
                };
                emit_symbol(next_frame, next_symbol)?;
            }
            if drained == 0 {
                std::hint::spin_loop();
            }
        }

        let elapsed_us = get_time_us() - start_us;
        info!(
            "sender finished: {tx_frame_count} frames in {:.2} s",
            elapsed_us / 1e6
        );
        stats.write_frame_ends(Path::new("data/tx_result.txt"))?;
        Ok(SenderReport {
            frames_sent: tx_frame_count,
            elapsed_us,
        })
    }
}

/// One TX worker: owns the sockets of its affine antennas, builds nothing
/// itself; it sends ring windows the master has prepared.
struct TxShard {
    tid: usize,
    cfg: Arc<Config>,
    ring: Arc<FrameRing<u8>>,
    task_queue: Arc<EventQueue>,
    message_queue: Arc<EventQueue>,
    running: Arc<RunFlag>,
    barrier: Arc<SpinBarrier>,
    clients: Vec<UdpClient>,
    core_offset: usize,
    max_symbol: usize,
    ants_this_thread: usize,
}

impl TxShard {
    #[allow(clippy::too_many_arguments)]
    fn new(
        tid: usize,
        thread_num: usize,
        core_offset: usize,
        cfg: Arc<Config>,
        ring: Arc<FrameRing<u8>>,
        task_queue: Arc<EventQueue>,
        message_queue: Arc<EventQueue>,
        running: Arc<RunFlag>,
        barrier: Arc<SpinBarrier>,
        max_symbol: usize,
    ) -> Result<Self, crate::SimError> {
        let mut clients = Vec::with_capacity(cfg.bs_ant_num);
        for ant in 0..cfg.bs_ant_num {
            clients.push(UdpClient::connect(&cfg.bs_addr, cfg.bs_port + ant as u16)?);
        }
        let ants_this_thread = (0..cfg.bs_ant_num).filter(|a| a % thread_num == tid).count();
        Ok(TxShard {
            tid,
            cfg,
            ring,
            task_queue,
            message_queue,
            running,
            barrier,
            clients,
            core_offset,
            max_symbol,
            ants_this_thread,
        })
    }

    fn run(self) {
        pin_to_core_with_offset(ThreadType::WorkerTx, self.core_offset + 1, self.tid);
        self.barrier.wait();

        let mut packets: u64 = 0;
        let report_every = (self.ants_this_thread.max(1) * self.max_symbol * 1000) as u64;
        let mut window_start = get_time_us();

        while self.running.is_running() {
            let Some(event) = self.task_queue.pop() else {
                std::hint::spin_loop();
                continue;
            };
            let tag = event.tag();
            let window = tag.symbol_id() as usize * self.cfg.bs_ant_num + tag.ant_id() as usize;
            let pkt = self.ring.window(tag.frame_id(), window);
            let client = &self.clients[tag.ant_id() as usize];
            if let Err(e) = client.send(pkt) {
                error!("tx shard {}: send failed: {e}", self.tid);
                self.running.fail();
                break;
            }
            if schedule(&self.message_queue, event).is_err() {
                error!("tx shard {}: message queue overflow", self.tid);
                self.running.fail();
                break;
            }

            packets += 1;
            if packets % report_every == 0 {
                let now = get_time_us();
                let bytes = report_every * self.cfg.packet_length() as u64;
                info!(
                    "tx shard {}: {} frames, {:.1} Mbps",
                    self.tid,
                    packets / (self.ants_this_thread.max(1) * self.max_symbol) as u64,
                    bytes as f64 * 8.0 / (now - window_start)
                );
                window_start = now;
            }
        }
    }
}
