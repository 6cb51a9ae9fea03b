//! Common Types and Configuration
//!
//! Shared definitions used by the baseband engine, the transport layer and
//! the simulator programs.

pub mod config;
pub mod types;
pub mod utils;

/// Number of frame slots in every pipeline ring buffer.
pub const TASK_BUFFER_FRAME_NUM: usize = 40;

/// Number of frame slots in the sender's transmit ring. Kept equal to the
/// pipeline ring size so both sides share one slot-addressing rule.
pub const BUFFER_FRAME_NUM: usize = TASK_BUFFER_FRAME_NUM;

/// Subcarriers that share one 64-byte cache line of complex32 samples.
pub const SC_PER_CACHELINE: usize = 8;

/// Maximum events pulled from the message queue per master iteration.
pub const DEQUEUE_BULK_SIZE: usize = 32;

/// Buffer and sample alignment in bytes.
pub const ALIGN_BYTES: usize = 64;
