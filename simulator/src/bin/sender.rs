//! Packet sender: replays prepared IQ toward the baseband unit at a
//! configured frame cadence with optional slow start.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::config::Config;
use simulator::sender::{load_iq, Sender, SenderOptions};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "data/bbu_config.json")]
    conf_file: String,

    /// TX worker threads
    #[arg(long, default_value_t = 4)]
    num_threads: usize,

    /// First core used by the pinned threads
    #[arg(long, default_value_t = 0)]
    core_offset: usize,

    /// Microseconds per frame at the steady rate
    #[arg(long, default_value_t = 5000)]
    delay: u64,

    /// Widen the budget for early frames
    #[arg(long, default_value_t = false)]
    enable_slow_start: bool,

    /// Destination MAC for the kernel-bypass backend; ignored over UDP
    #[arg(long)]
    server_mac_addr: Option<String>,

    /// Directory holding the prepared IQ files
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    if args.server_mac_addr.is_some() {
        warn!("--server_mac_addr only applies to the kernel-bypass backend; ignored over UDP");
    }

    let cfg = Config::from_file(&args.conf_file)?;
    let iq = load_iq(&cfg, &args.data_dir)?;
    let opts = SenderOptions {
        thread_num: args.num_threads,
        core_offset: args.core_offset,
        delay_us: args.delay,
        enable_slow_start: args.enable_slow_start,
        frames_to_send: cfg.frames_to_test,
    };

    let sender = Sender::new(cfg, opts, iq)?;
    let report = sender.run()?;
    info!(
        "sent {} frames in {:.2} s",
        report.frames_sent,
        report.elapsed_us / 1e6
    );
    Ok(())
}
