//! Real-Time Frame Pipeline
//!
//! A partitioned dataflow engine for massive-MIMO baseband processing. One
//! master shard advances the per-frame state machine; pinned worker shards
//! execute kernel tasks addressed by packed tags; RX shards translate wire
//! packets into ring-buffer slots. All cross-shard traffic is events on
//! lock-free queues; payload data moves only through the frame-slot rings.

pub mod buffer;
pub mod counters;
pub mod kernels;
pub mod master;
pub mod pipeline;
pub mod queue;
pub mod stats;
pub mod txrx;
pub mod worker;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Engine-level errors. Runtime errors drain the shards and surface once,
/// from the master.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("buffer allocation failed: {0}")]
    Alloc(String),

    #[error("queue full after retries; capacity is mis-sized")]
    QueueFull,

    #[error("transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] common::config::ConfigError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fatal runtime fault: {0}")]
    Fault(String),
}

/// Process-wide shutdown token shared by every shard.
///
/// Shards observe it at the top of each loop iteration; RX errors stop it
/// with the failure flag so the master can exit non-zero.
#[derive(Debug, Default)]
pub struct RunFlag {
    running: AtomicBool,
    failed: AtomicBool,
}

impl RunFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(RunFlag {
            running: AtomicBool::new(true),
            failed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Stop and mark the run as failed (transport or queue fault).
    pub fn fail(&self) {
        self.failed.store(true, Ordering::Release);
        self.stop();
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// Counting spin barrier for thread start-up: the master proceeds only once
/// every shard has checked in.
#[derive(Debug)]
pub struct SpinBarrier {
    arrived: AtomicUsize,
    total: usize,
}

impl SpinBarrier {
    pub fn new(total: usize) -> Arc<Self> {
        Arc::new(SpinBarrier {
            arrived: AtomicUsize::new(0),
            total,
        })
    }

    pub fn wait(&self) {
        self.arrived.fetch_add(1, Ordering::AcqRel);
        while self.arrived.load(Ordering::Acquire) < self.total {
            std::hint::spin_loop();
        }
    }
}
