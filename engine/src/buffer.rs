//! Frame-Slot Ring Buffers
//!
//! Every stage's payload lives in a pre-allocated, 64-byte-aligned arena
//! carved into `TASK_BUFFER_FRAME_NUM` frame slots of fixed-size windows.
//! Nothing is allocated after construction; a window is addressed by
//! `(frame_id mod F, window_index)` and owned by exactly one task at a time.
//!
//! Writers obtain `&mut [T]` windows through [`FrameRing::window_mut`].
//! Window disjointness is guaranteed by the scheduler: each window index is
//! emitted to exactly one in-flight task, so no two live mutable windows
//! ever alias. Readers see completed writes through the release/acquire
//! hand-off of the completion queue.

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::ptr::NonNull;

use common::{ALIGN_BYTES, TASK_BUFFER_FRAME_NUM};
use num_complex::Complex32;

use crate::EngineError;

/// Owned, 64-byte-aligned, zero-initialized allocation.
struct AlignedBuf<T> {
    ptr: NonNull<T>,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> AlignedBuf<T> {
    fn new(len: usize) -> Result<Self, EngineError> {
        if len == 0 {
            return Ok(AlignedBuf {
                ptr: NonNull::dangling(),
                len: 0,
                _marker: PhantomData,
            });
        }
        let layout = Layout::array::<T>(len)
            .and_then(|l| l.align_to(ALIGN_BYTES))
            .map_err(|e| EngineError::Alloc(e.to_string()))?;
        // SAFETY: layout has nonzero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw as *mut T) else {
            return Err(EngineError::Alloc(format!(
                "{} bytes, align {}",
                layout.size(),
                layout.align()
            )));
        };
        Ok(AlignedBuf {
            ptr,
            len,
            _marker: PhantomData,
        })
    }
}

impl<T> Drop for AlignedBuf<T> {
    fn drop(&mut self) {
        if self.len > 0 {
            let layout = Layout::array::<T>(self.len)
                .and_then(|l| l.align_to(ALIGN_BYTES))
                .expect("layout was valid at alloc");
            // SAFETY: allocated with this exact layout in `new`.
            unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, layout) };
        }
    }
}

// SAFETY: the buffer owns its allocation; element access is coordinated by
// the ring discipline above.
unsafe impl<T: Send> Send for AlignedBuf<T> {}
unsafe impl<T: Send + Sync> Sync for AlignedBuf<T> {}

/// One stage's ring: `TASK_BUFFER_FRAME_NUM` slots of `windows` windows of
/// `width` elements each.
pub struct FrameRing<T> {
    buf: AlignedBuf<T>,
    windows: usize,
    width: usize,
}

impl<T> FrameRing<T> {
    pub fn new(windows: usize, width: usize) -> Result<Self, EngineError> {
        let buf = AlignedBuf::new(TASK_BUFFER_FRAME_NUM * windows * width)?;
        Ok(FrameRing {
            buf,
            windows,
            width,
        })
    }

    /// Elements per window.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Windows per frame slot.
    pub fn windows(&self) -> usize {
        self.windows
    }

    #[inline]
    fn offset(&self, frame_id: u32, window: usize) -> usize {
        debug_assert!(window < self.windows, "window {window} of {}", self.windows);
        let slot = frame_id as usize % TASK_BUFFER_FRAME_NUM;
        (slot * self.windows + window) * self.width
    }

    /// Read view of one window.
    #[inline]
    pub fn window(&self, frame_id: u32, window: usize) -> &[T] {
        let off = self.offset(frame_id, window);
        // SAFETY: offset is in bounds; readers only touch windows whose
        // producing task has completed (queue hand-off orders the write).
        unsafe { std::slice::from_raw_parts(self.buf.ptr.as_ptr().add(off), self.width) }
    }

    /// Write view of one window.
    ///
    /// # Safety
    ///
    /// The caller must hold the task tag addressing this window: the
    /// scheduler emits each `(frame slot, window)` to at most one in-flight
    /// task, and only that task may call this.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn window_mut(&self, frame_id: u32, window: usize) -> &mut [T] {
        let off = self.offset(frame_id, window);
        std::slice::from_raw_parts_mut(self.buf.ptr.as_ptr().add(off), self.width)
    }
}

/// All pipeline rings, constructed once at engine start-up.
///
/// Window layouts (slot-relative, `A` antennas, `U` users, `S` symbols,
/// `D` data symbols, `N` data subcarriers):
///
/// | ring | window key | width | layout |
/// |---|---|---|---|
/// | `rx` | `sym * A + ant` | `2 * ofdm_frame_len` | int16 I/Q |
/// | `data` | `sym * A + ant` | `N` | frequency-domain samples |
/// | `csi` | `ue` | `A * N` | `[ant][sc]` channel estimates |
/// | `precoder` | `zf_block` | `block * U * A` | `[sc][ue][ant]` |
/// | `equal` | `dsym * blocks + blk` | `block * U` | `[sc][ue]` |
/// | `demod` | `dsym * blocks + blk` | `block * U * mod_bits` | `[ue][sc * bits]` LLRs |
/// | `decoded` | `dsym * U + ue` | info bytes | packed bits |
/// | `dl_bits` / `dl_encoded` | `dsym * U + ue` | packed bytes | downlink source / codewords |
/// | `dl_mod` | `dsym * U + ue` | `N` | modulated downlink symbols |
/// | `tx` | `dsym * A + ant` | `2 * ofdm_frame_len` | int16 I/Q |
pub struct Buffers {
    pub rx: FrameRing<i16>,
    pub data: FrameRing<Complex32>,
    pub csi: FrameRing<Complex32>,
    pub precoder: FrameRing<Complex32>,
    pub equal: FrameRing<Complex32>,
    pub demod: FrameRing<i8>,
    pub decoded: FrameRing<u8>,
    pub dl_bits: FrameRing<u8>,
    pub dl_encoded: FrameRing<u8>,
    pub dl_mod: FrameRing<Complex32>,
    pub tx: FrameRing<i16>,
}

impl Buffers {
    pub fn new(cfg: &common::config::Config) -> Result<Self, EngineError> {
        let a = cfg.bs_ant_num;
        let u = cfg.ue_num;
        let s = cfg.symbol_num_perframe();
        let d = cfg.data_symbol_num;
        let n = cfg.ofdm_data_num;
        let samps = 2 * cfg.ofdm_frame_len();
        let blocks = cfg.demul_blocks();
        let block = cfg.demul_block_size;
        let mod_bits = cfg.mod_order_bits();
        let nblocks = cfg.ldpc.nblocks_in_symbol as usize;
        let info_bytes = nblocks * (cfg.ldpc.cb_len as usize + 7) / 8;
        let codew_bytes = nblocks * (cfg.ldpc.cb_codew_len as usize + 7) / 8;
        let dl = cfg.downlink_mode as usize;

        Ok(Buffers {
            rx: FrameRing::new(s * a, samps)?,
            data: FrameRing::new(s * a, n)?,
            csi: FrameRing::new(u, n * a)?,
            precoder: FrameRing::new(cfg.zf_blocks(), cfg.zf_block_size * u * a)?,
            equal: FrameRing::new(d * blocks, block * u)?,
            demod: FrameRing::new(d * blocks, block * u * mod_bits)?,
            decoded: FrameRing::new(d * u, info_bytes)?,
            dl_bits: FrameRing::new(dl * d * u, info_bytes)?,
            dl_encoded: FrameRing::new(dl * d * u, codew_bytes)?,
            dl_mod: FrameRing::new(dl * d * u, n)?,
            tx: FrameRing::new(dl * d * a, samps)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_zero_initialized_and_aligned() {
        let ring: FrameRing<Complex32> = FrameRing::new(4, 64).unwrap();
        let w = ring.window(0, 3);
        assert_eq!(w.len(), 64);
        assert!(w.iter().all(|c| c.re == 0.0 && c.im == 0.0));
        assert_eq!(w.as_ptr() as usize % ALIGN_BYTES, 0);
    }

    #[test]
    fn test_slot_addressing_wraps() {
        let ring: FrameRing<i16> = FrameRing::new(2, 8).unwrap();
        // Frames F apart share a slot; neighbours do not.
        let f = TASK_BUFFER_FRAME_NUM as u32;
        unsafe { ring.window_mut(3, 1)[0] = 77 };
        assert_eq!(ring.window(3 + f, 1)[0], 77);
        assert_eq!(ring.window(4, 1)[0], 0);
    }

    #[test]
    fn test_empty_ring() {
        let ring: FrameRing<u8> = FrameRing::new(0, 0).unwrap();
        assert_eq!(ring.windows(), 0);
        assert_eq!(ring.width(), 0);
    }

    #[test]
    fn test_windows_are_disjoint() {
        let ring: FrameRing<i16> = FrameRing::new(3, 4).unwrap();
        unsafe {
            ring.window_mut(0, 0).fill(1);
            ring.window_mut(0, 1).fill(2);
        }
        assert!(ring.window(0, 0).iter().all(|&x| x == 1));
        assert!(ring.window(0, 1).iter().all(|&x| x == 2));
        assert!(ring.window(0, 2).iter().all(|&x| x == 0));
    }
}
