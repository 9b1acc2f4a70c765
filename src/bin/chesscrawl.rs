use anyhow::{Context, Result};
use chesscrawl::{run_stage, Cli};
use clap::Parser;
use env_logger::Env;

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.build_config().context("invalid configuration")?;
    log::debug!("running {:?} with raw pages under {}", cli.stage, config.raw_dir.display());
    run_stage(cli.stage, &config)
}
