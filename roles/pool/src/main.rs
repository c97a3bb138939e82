use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use pool_kas::config::PoolConfig;
use pool_kas::KaspaPool;

#[derive(Parser, Debug)]
#[command(name = "pool_kas")]
#[command(about = "Stratum mining pool server for kaspa-family networks")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "pool-config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    let config = PoolConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    KaspaPool::new(config)
        .start()
        .await
        .context("pool terminated with an error")?;
    Ok(())
}
