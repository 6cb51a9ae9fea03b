//! Baseband Unit
//!
//! Runs the real-time frame pipeline against live antenna traffic: RX
//! shards feed the master scheduler, workers execute the FFT / CSI / ZF /
//! equalize / decode chain (or the downlink reverse), and the process exits
//! once the configured number of frames has been delivered.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use common::config::Config;
use engine::master::Engine;

/// Massive-MIMO baseband unit
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "data/bbu_config.json")]
    conf_file: String,

    /// Worker shard count override
    #[arg(long)]
    num_threads: Option<usize>,

    /// First core used by the pinned threads
    #[arg(long)]
    core_offset: Option<usize>,

    /// Frames to process before exiting
    #[arg(long)]
    frames_to_test: Option<usize>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(args.log_level.as_deref().unwrap_or("info"))
    });
    fmt().with_env_filter(env_filter).with_target(true).init();

    info!("loading configuration from {}", args.conf_file);
    let mut cfg = Config::from_file(&args.conf_file)?;
    if let Some(n) = args.num_threads {
        cfg.worker_thread_num = n;
    }
    if let Some(off) = args.core_offset {
        cfg.core_offset = off;
    }
    if let Some(frames) = args.frames_to_test {
        cfg.frames_to_test = frames;
    }

    info!(
        "{} antennas, {} users, {} subcarriers ({} data), {} mode",
        cfg.bs_ant_num,
        cfg.ue_num,
        cfg.ofdm_ca_num,
        cfg.ofdm_data_num,
        if cfg.downlink_mode { "downlink" } else { "uplink" },
    );

    let engine = Engine::new(cfg)?;
    match engine.run() {
        Ok(report) => {
            info!(
                "run complete: {} frames delivered, {} dropped, avg latency {:.2} us",
                report.delivered, report.dropped, report.avg_latency_us
            );
            Ok(())
        }
        Err(e) => {
            error!("engine failed: {e}");
            Err(e.into())
        }
    }
}
