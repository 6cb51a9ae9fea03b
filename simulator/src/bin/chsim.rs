//! Channel simulator: relays UE-side and BS-side traffic through a random
//! MIMO channel until killed.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use common::config::Config;
use simulator::chsim::{ChSimOptions, ChannelSim};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "data/bbu_config.json")]
    conf_file: String,

    /// BS-side RX threads
    #[arg(long, default_value_t = 1)]
    bs_threads: usize,

    /// UE-side RX threads
    #[arg(long, default_value_t = 1)]
    ue_threads: usize,

    /// Relay worker threads
    #[arg(long, default_value_t = 2)]
    worker_threads: usize,

    /// First core used by the pinned threads
    #[arg(long, default_value_t = 0)]
    core_offset: usize,

    /// Channel draw seed
    #[arg(long, default_value_t = 0)]
    channel_seed: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cfg = Config::from_file(&args.conf_file)?;
    let sim = ChannelSim::new(
        cfg,
        ChSimOptions {
            bs_thread_num: args.bs_threads,
            ue_thread_num: args.ue_threads,
            worker_thread_num: args.worker_threads,
            core_offset: args.core_offset,
            channel_seed: args.channel_seed,
        },
    )?;
    sim.run()?;
    Ok(())
}
