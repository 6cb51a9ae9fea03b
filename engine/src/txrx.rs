//! Network RX Shards
//!
//! Each RX shard owns a disjoint range of per-antenna sockets assigned by
//! thread id, round-robins among them with non-blocking receives, copies
//! validated payloads into the RX ring slot named by the header, and posts
//! a `PacketRx` event to the master. Shards never block: an empty socket
//! means an immediate try on the next one. Any receive error drains the
//! whole engine via the shared run flag.

use std::sync::Arc;

use common::config::Config;
use common::types::{Event, EventKind, Tag, ThreadType};
use common::utils::pin_to_core_with_offset;
use tracing::{error, info, warn};
use transport::packet::PacketHeader;
use transport::UdpServer;

use crate::buffer::Buffers;
use crate::queue::{schedule, EventQueue};
use crate::{RunFlag, SpinBarrier};

pub struct RxShard {
    tid: usize,
    cfg: Arc<Config>,
    servers: Vec<UdpServer>,
    buffers: Arc<Buffers>,
    message_queue: Arc<EventQueue>,
    running: Arc<RunFlag>,
    barrier: Arc<SpinBarrier>,
}

impl RxShard {
    /// Bind this shard's socket range `[lo, hi)` over the antenna ports.
    pub fn new(
        tid: usize,
        cfg: Arc<Config>,
        buffers: Arc<Buffers>,
        message_queue: Arc<EventQueue>,
        running: Arc<RunFlag>,
        barrier: Arc<SpinBarrier>,
    ) -> Result<Self, crate::EngineError> {
        let ants = cfg.bs_ant_num;
        let shards = cfg.socket_thread_num;
        let lo = tid * ants / shards;
        let hi = (tid + 1) * ants / shards;
        let mut servers = Vec::with_capacity(hi - lo);
        for ant in lo..hi {
            servers.push(UdpServer::bind(&cfg.bs_addr, cfg.bs_port + ant as u16)?);
        }
        info!("rx shard {tid}: antennas {lo}..{hi}");
        Ok(RxShard {
            tid,
            cfg,
            servers,
            buffers,
            message_queue,
            running,
            barrier,
        })
    }

    pub fn run(self) {
        pin_to_core_with_offset(ThreadType::WorkerRx, self.cfg.core_offset + 1, self.tid);
        self.barrier.wait();

        let packet_len = self.cfg.packet_length();
        let symbols = self.cfg.symbol_num_perframe();
        let ants = self.cfg.bs_ant_num;
        let mut buf = vec![0u8; packet_len];
        let mut socket_id = 0usize;

        while self.running.is_running() {
            let received = match self.servers[socket_id].recv_nonblocking(&mut buf) {
                Ok(None) => None,
                Ok(Some(n)) => Some(n),
                Err(e) => {
                    error!("rx shard {}: receive failed: {e}", self.tid);
                    self.running.fail();
                    break;
                }
            };
            if let Some(n) = received {
                if n != packet_len {
                    warn!(
                        "rx shard {}: truncated packet ({n} of {packet_len} bytes), dropping",
                        self.tid
                    );
                } else {
                    match PacketHeader::read_from(&buf) {
                        Ok(hdr)
                            if (hdr.symbol_id as usize) < symbols
                                && (hdr.ant_id as usize) < ants =>
                        {
                            self.accept(&hdr, &buf);
                        }
                        Ok(hdr) => {
                            warn!(
                                "rx shard {}: out-of-range header symbol {} ant {}",
                                self.tid, hdr.symbol_id, hdr.ant_id
                            );
                        }
                        Err(e) => {
                            warn!("rx shard {}: bad header: {e}", self.tid);
                        }
                    }
                }
            }
            socket_id += 1;
            if socket_id == self.servers.len() {
                socket_id = 0;
            }
        }
    }

    fn accept(&self, hdr: &PacketHeader, buf: &[u8]) {
        let window = hdr.symbol_id as usize * self.cfg.bs_ant_num + hdr.ant_id as usize;
        // SAFETY: exactly one packet exists per (frame, symbol, antenna),
        // and this shard owns the antenna's socket.
        let dst = unsafe { self.buffers.rx.window_mut(hdr.frame_id, window) };
        for (d, pair) in dst
            .iter_mut()
            .zip(transport::packet::payload(buf).chunks_exact(2))
        {
            *d = i16::from_le_bytes([pair[0], pair[1]]);
        }

        let tag = Tag::frm_sym_ant(hdr.frame_id, hdr.symbol_id as u16, hdr.ant_id as u16);
        if schedule(&self.message_queue, Event::new(EventKind::PacketRx, tag)).is_err() {
            error!("rx shard {}: message queue overflow", self.tid);
            self.running.fail();
        }
    }
}
