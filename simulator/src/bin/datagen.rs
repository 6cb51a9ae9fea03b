//! Offline generator for the IQ and reference files used by the sender and
//! the correctness benchmarks.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use common::config::Config;
use simulator::datagen::generate;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "data/bbu_config.json")]
    conf_file: String,

    /// Output directory
    #[arg(long, default_value = "data")]
    out_dir: PathBuf,

    /// Seed for the information bits and the channel draw
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cfg = Config::from_file(&args.conf_file)?;
    generate(&cfg, &args.out_dir, args.seed)?;
    Ok(())
}
