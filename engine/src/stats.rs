//! Frame Timing Stats
//!
//! Per-frame start/end timestamps recorded by the master on its own clock,
//! a latency summary for shutdown, and the `%.5f`-per-line timestamp file
//! shared with the offline tooling.

use std::io::Write;
use std::path::Path;

use tracing::info;

#[derive(Debug, Default)]
pub struct FrameStats {
    frame_start: Vec<f64>,
    frame_end: Vec<f64>,
    pub dropped_frames: u64,
}

impl FrameStats {
    pub fn new(capacity: usize) -> Self {
        FrameStats {
            frame_start: Vec::with_capacity(capacity),
            frame_end: Vec::with_capacity(capacity),
            dropped_frames: 0,
        }
    }

    pub fn record_start(&mut self, time_us: f64) {
        self.frame_start.push(time_us);
    }

    pub fn record_end(&mut self, time_us: f64) {
        self.frame_end.push(time_us);
    }

    pub fn frames_completed(&self) -> usize {
        self.frame_end.len()
    }

    /// Mean start-to-end latency over the frames that completed.
    pub fn avg_latency_us(&self) -> f64 {
        let n = self.frame_start.len().min(self.frame_end.len());
        if n == 0 {
            return 0.0;
        }
        let total: f64 = (0..n).map(|i| self.frame_end[i] - self.frame_start[i]).sum();
        total / n as f64
    }

    /// Log the shutdown summary.
    pub fn report(&self) {
        info!(
            "processed {} frames, avg latency {:.2} us, {} dropped",
            self.frames_completed(),
            self.avg_latency_us(),
            self.dropped_frames
        );
    }

    /// Write one completion timestamp per line, `%.5f` microseconds.
    pub fn write_frame_ends(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = std::fs::File::create(path)?;
        for t in &self.frame_end {
            writeln!(file, "{t:.5}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_average() {
        let mut stats = FrameStats::new(4);
        stats.record_start(100.0);
        stats.record_end(150.0);
        stats.record_start(200.0);
        stats.record_end(280.0);
        assert_eq!(stats.frames_completed(), 2);
        assert!((stats.avg_latency_us() - 65.0).abs() < 1e-9);
    }

    #[test]
    fn test_timestamp_file_format() {
        let mut stats = FrameStats::new(2);
        stats.record_end(123.456789);
        stats.record_end(200.0);
        let dir = std::env::temp_dir().join("frame_stats_test");
        let path = dir.join("tx_result.txt");
        stats.write_frame_ends(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "123.45679\n200.00000\n");
        std::fs::remove_dir_all(&dir).ok();
    }
}
