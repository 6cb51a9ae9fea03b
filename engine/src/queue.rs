//! Lock-Free Queue Plumbing
//!
//! The engine's queues are bounded MPMC `ArrayQueue`s carrying [`Event`]
//! records only. Each worker owns a dedicated task queue (the dequeue side
//! of the per-producer-token discipline); completions and RX notifications
//! share one message queue drained by the master.

use std::sync::Arc;

use common::types::{Event, TagType};
use crossbeam_queue::ArrayQueue;
use tracing::warn;

use crate::EngineError;

/// Queue of pipeline events.
pub type EventQueue = ArrayQueue<Event>;

/// Spins allowed for a full queue before the failure is treated as fatal.
const ENQUEUE_RETRY_SPINS: usize = 1 << 26;

/// Enqueue with backpressure: a full queue is retried with a bounded spin
/// and a warning; sustained failure means the capacity is mis-sized and is
/// fatal to the caller.
pub fn schedule(queue: &EventQueue, event: Event) -> Result<(), EngineError> {
    let mut ev = event;
    match queue.push(ev) {
        Ok(()) => return Ok(()),
        Err(rejected) => ev = rejected,
    }
    warn!("queue full, retrying enqueue of {:?}", ev.kind);
    for _ in 0..ENQUEUE_RETRY_SPINS {
        match queue.push(ev) {
            Ok(()) => return Ok(()),
            Err(rejected) => {
                ev = rejected;
                std::hint::spin_loop();
            }
        }
    }
    Err(EngineError::QueueFull)
}

/// The per-worker task queues plus the affinity routing rule: task `i` of a
/// stage goes to worker `i mod worker_num`, so within a frame a given
/// antenna (or user, or subcarrier block) always lands on the same worker.
pub struct TaskQueues {
    queues: Vec<Arc<EventQueue>>,
    demul_block_size: usize,
}

impl TaskQueues {
    pub fn new(worker_num: usize, capacity: usize, demul_block_size: usize) -> Self {
        let queues = (0..worker_num)
            .map(|_| Arc::new(ArrayQueue::new(capacity)))
            .collect();
        TaskQueues {
            queues,
            demul_block_size,
        }
    }

    pub fn worker_queue(&self, tid: usize) -> Arc<EventQueue> {
        self.queues[tid].clone()
    }

    /// Stable task index used for worker affinity.
    fn task_index(&self, event: &Event) -> usize {
        let tag = event.tag();
        match tag.tag_type() {
            TagType::Antennas => tag.ant_id() as usize,
            TagType::Users => tag.ue_id() as usize,
            TagType::Subcarriers => tag.sc_id() as usize / self.demul_block_size,
            TagType::FrmSym => tag.symbol_id() as usize,
        }
    }

    /// Route one task to its affine worker.
    pub fn dispatch(&self, event: Event) -> Result<(), EngineError> {
        let queue = &self.queues[self.task_index(&event) % self.queues.len()];
        schedule(queue, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{EventKind, Tag};

    #[test]
    fn test_schedule_and_pop() {
        let q: EventQueue = ArrayQueue::new(2);
        schedule(&q, Event::new(EventKind::Fft, Tag::frm_sym(1, 0))).unwrap();
        let ev = q.pop().unwrap();
        assert_eq!(ev.kind, EventKind::Fft);
    }

    #[test]
    fn test_schedule_retries_then_succeeds() {
        let q = Arc::new(ArrayQueue::new(1));
        q.push(Event::new(EventKind::Fft, Tag::frm_sym(0, 0))).unwrap();

        // A consumer drains the queue while schedule() is spinning.
        let q2 = q.clone();
        let drain = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(5));
            q2.pop()
        });
        schedule(&q, Event::new(EventKind::Demul, Tag::frm_sym(0, 1))).unwrap();
        assert!(drain.join().unwrap().is_some());
        assert_eq!(q.pop().unwrap().kind, EventKind::Demul);
    }

    #[test]
    fn test_affinity_is_stable_per_entity() {
        let tq = TaskQueues::new(3, 16, 48);
        for ant in 0..9u16 {
            tq.dispatch(Event::new(EventKind::Fft, Tag::frm_sym_ant(0, 0, ant)))
                .unwrap();
        }
        // Worker 0 sees antennas 0, 3, 6.
        let q = tq.worker_queue(0);
        let ants: Vec<u16> = std::iter::from_fn(|| q.pop()).map(|e| e.tag().ant_id()).collect();
        assert_eq!(ants, vec![0, 3, 6]);
    }
}
