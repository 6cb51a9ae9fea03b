//! Master Shard and Engine Assembly
//!
//! [`Engine::run`] allocates the rings and queues, spawns the pinned RX and
//! worker shards, then runs the master loop on the calling thread: bulk
//! dequeue events, advance the frame state machine, route emitted tasks to
//! the affine worker queues, and record frame timing. The master is the
//! sole exit point; after `frames_to_test` delivered frames (or a fault) it
//! drains every shard through the shared run flag and joins them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use common::config::Config;
use common::types::ThreadType;
use common::utils::{get_time_us, pin_to_core_with_offset};
use common::{DEQUEUE_BULK_SIZE, TASK_BUFFER_FRAME_NUM};
use crossbeam_queue::ArrayQueue;
use tracing::{error, info};

use crate::buffer::Buffers;
use crate::pipeline::{Pipeline, Progress};
use crate::queue::{EventQueue, TaskQueues};
use crate::stats::FrameStats;
use crate::txrx::RxShard;
use crate::worker::Worker;
use crate::{EngineError, RunFlag, SpinBarrier};

/// Headroom multiplier on queue capacities.
const QUEUE_HEADROOM: usize = 8;

/// Result of a completed run.
#[derive(Debug)]
pub struct EngineReport {
    pub delivered: u64,
    pub dropped: u64,
    pub avg_latency_us: f64,
}

pub struct Engine {
    cfg: Arc<Config>,
    running: Arc<RunFlag>,
    delivered: Arc<AtomicU64>,
}

impl Engine {
    pub fn new(cfg: Config) -> Result<Self, EngineError> {
        cfg.validate()?;
        Ok(Engine {
            cfg: Arc::new(cfg),
            running: RunFlag::new(),
            delivered: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Shutdown token; callers may stop the engine from outside.
    pub fn run_flag(&self) -> Arc<RunFlag> {
        self.running.clone()
    }

    /// Live count of delivered frames.
    pub fn delivered_counter(&self) -> Arc<AtomicU64> {
        self.delivered.clone()
    }

    /// Run to completion. Blocks the calling thread as the master shard.
    pub fn run(&self) -> Result<EngineReport, EngineError> {
        let cfg = &self.cfg;
        let buffers = Arc::new(Buffers::new(cfg)?);
        if cfg.downlink_mode {
            preload_downlink_bits(cfg, &buffers);
        }

        let s = cfg.symbol_num_perframe();
        let per_frame_events = s * cfg.bs_ant_num
            + cfg.pilot_symbol_num
            + cfg.zf_blocks()
            + cfg.data_symbol_num * (cfg.demul_blocks() + cfg.ue_num + cfg.bs_ant_num * 2)
            + cfg.data_symbol_num * cfg.ue_num * 2;
        let message_cap = TASK_BUFFER_FRAME_NUM * per_frame_events * QUEUE_HEADROOM;
        let task_cap = message_cap / cfg.worker_thread_num.max(1);

        let message_queue: Arc<EventQueue> = Arc::new(ArrayQueue::new(message_cap));
        let task_queues = TaskQueues::new(cfg.worker_thread_num, task_cap, cfg.demul_block_size);
        let barrier = SpinBarrier::new(cfg.socket_thread_num + cfg.worker_thread_num + 1);

        let mut handles = Vec::new();
        for tid in 0..cfg.socket_thread_num {
            let shard = RxShard::new(
                tid,
                cfg.clone(),
                buffers.clone(),
                message_queue.clone(),
                self.running.clone(),
                barrier.clone(),
            )?;
            handles.push(
                thread::Builder::new()
                    .name(format!("rx-{tid}"))
                    .spawn(move || shard.run())?,
            );
        }
        for tid in 0..cfg.worker_thread_num {
            let worker = Worker::new(
                tid,
                cfg.clone(),
                buffers.clone(),
                task_queues.worker_queue(tid),
                message_queue.clone(),
                self.running.clone(),
                barrier.clone(),
            )?;
            handles.push(
                thread::Builder::new()
                    .name(format!("worker-{tid}"))
                    .spawn(move || worker.run())?,
            );
        }

        pin_to_core_with_offset(ThreadType::Master, cfg.core_offset, 0);
        barrier.wait();
        info!(
            "master running: {} rx shards, {} workers, {} frames to test",
            cfg.socket_thread_num, cfg.worker_thread_num, cfg.frames_to_test
        );

        let result = self.master_loop(&message_queue, &task_queues);

        self.running.stop();
        for handle in handles {
            let _ = handle.join();
        }
        result
    }

    fn master_loop(
        &self,
        message_queue: &EventQueue,
        task_queues: &TaskQueues,
    ) -> Result<EngineReport, EngineError> {
        let cfg = &self.cfg;
        let mut pipeline = Pipeline::new(cfg);
        let mut stats = FrameStats::new(cfg.frames_to_test);
        let mut tasks = Vec::with_capacity(256);

        while self.running.is_running() && pipeline.delivered() < cfg.frames_to_test as u64 {
            let mut drained = 0;
            for _ in 0..DEQUEUE_BULK_SIZE {
                let Some(event) = message_queue.pop() else {
                    break;
                };
                drained += 1;
                tasks.clear();
                let progress = pipeline.handle(event, &mut tasks);
                for &task in &tasks {
                    if task_queues.dispatch(task).is_err() {
                        error!("task dispatch failed; stopping");
                        self.running.fail();
                        return Err(EngineError::QueueFull);
                    }
                }
                match progress {
                    Progress::FrameStarted(_) => stats.record_start(get_time_us()),
                    Progress::FrameDelivered(frame) => {
                        stats.record_end(get_time_us());
                        self.delivered.store(pipeline.delivered(), Ordering::Release);
                        if pipeline.delivered() % 100 == 0 {
                            info!("frame {frame} delivered ({} total)", pipeline.delivered());
                        }
                    }
                    Progress::None => {}
                }
            }
            if drained == 0 {
                std::hint::spin_loop();
            }
        }

        stats.dropped_frames = pipeline.dropped_frames();
        stats.report();
        if self.running.is_failed() {
            return Err(EngineError::Fault("shard failure during run".into()));
        }
        Ok(EngineReport {
            delivered: pipeline.delivered(),
            dropped: pipeline.dropped_frames(),
            avg_latency_us: stats.avg_latency_us(),
        })
    }
}


/// Fill the downlink source rings with a deterministic bit pattern so every
/// slot is transmittable from frame zero. A data-update shard refreshing
/// the upcoming slot would replace this for live traffic.
fn preload_downlink_bits(cfg: &Config, buffers: &Buffers) {
    let users = cfg.ue_num;
    for slot in 0..TASK_BUFFER_FRAME_NUM as u32 {
        for dsym in 0..cfg.data_symbol_num {
            for ue in 0..users {
                // SAFETY: single-threaded, before any shard starts.
                let win = unsafe { buffers.dl_bits.window_mut(slot, dsym * users + ue) };
                let mut state =
                    0x9E37_79B9u32 ^ (slot << 16) ^ ((dsym as u32) << 8) ^ ue as u32;
                for b in win.iter_mut() {
                    state ^= state << 13;
                    state ^= state >> 17;
                    state ^= state << 5;
                    *b = state as u8;
                }
            }
        }
    }
}
