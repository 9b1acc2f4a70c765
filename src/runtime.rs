//! Stage runners that wire a [`PipelineConfig`] into the pipeline components.
//!
//! Network stages run on a current-thread tokio runtime owned by [`run`];
//! extraction uses its own worker threads; splitting and corpus building are
//! single-threaded. The first interrupt flips the shared stop flag: every
//! stage stops taking new work and the `all` sequence ends after the current
//! stage. A second interrupt exits immediately.

use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

use crate::config::{PipelineConfig, Stage};
use crate::context::StageContext;
use crate::corpus::CorpusBuilder;
use crate::discover::LinkDiscoverer;
use crate::extract::RecordExtractor;
use crate::fetcher::{FetchControls, IndexWindow, PageFetcher, RawStore};
use crate::link_index::LinkStore;
use crate::progress::CheckpointStore;
use crate::source::HttpSource;
use crate::splitter::{split, PartitionAssignment};

/// Runs `stage` (or every stage for [`Stage::All`]) against `config`.
pub fn run(stage: Stage, config: &PipelineConfig) -> Result<()> {
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let controls = FetchControls::from_config(config);
    rt.spawn(watch_interrupt(controls.stop_handle()));

    match stage {
        Stage::Discover => rt.block_on(run_discover(config, &controls)),
        Stage::Fetch => rt.block_on(run_fetch(config, &controls)),
        Stage::Extract => blocking(&rt, config, &controls, run_extract),
        Stage::Split => blocking(&rt, config, &controls, run_split),
        Stage::Build => blocking(&rt, config, &controls, run_build),
        Stage::All => {
            rt.block_on(run_discover(config, &controls))?;
            if stopped(&controls, "fetch") {
                return Ok(());
            }
            rt.block_on(run_fetch(config, &controls))?;
            let offline: [(&str, OfflineStage); 3] = [
                ("extract", run_extract),
                ("split", run_split),
                ("build", run_build),
            ];
            for (name, stage) in offline {
                if stopped(&controls, name) {
                    return Ok(());
                }
                blocking(&rt, config, &controls, stage)?;
            }
            Ok(())
        }
    }
}

type OfflineStage = fn(&PipelineConfig, &FetchControls) -> Result<()>;

/// Runs a synchronous stage on the blocking pool so the interrupt watcher keeps running.
fn blocking(
    rt: &Runtime,
    config: &PipelineConfig,
    controls: &FetchControls,
    stage: OfflineStage,
) -> Result<()> {
    let config = config.clone();
    let controls = controls.clone();
    rt.block_on(rt.spawn_blocking(move || stage(&config, &controls)))
        .context("stage worker panicked")?
}

fn stopped(controls: &FetchControls, next: &str) -> bool {
    if controls.stop_requested() {
        warn!("interrupted; not starting {next}");
        return true;
    }
    false
}

async fn watch_interrupt(stop: Arc<AtomicBool>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    warn!("interrupt received; finishing in-flight work (interrupt again to exit)");
    stop.store(true, Ordering::Release);
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("second interrupt; exiting without a final checkpoint");
        std::process::exit(130);
    }
}

fn http_source(config: &PipelineConfig) -> Result<Arc<HttpSource>> {
    let source = HttpSource::new(&config.user_agent, config.page_timeout())
        .context("failed to build http client")?;
    Ok(Arc::new(source))
}

async fn run_discover(config: &PipelineConfig, controls: &FetchControls) -> Result<()> {
    let discoverer = LinkDiscoverer::new(
        http_source(config)?,
        LinkStore::new(&config.links_path),
        &config.listing_url,
        &config.root_url,
        controls.clone(),
    );
    let ctx = StageContext::begin("discover");
    let outcome = discoverer.discover(&ctx).await;
    ctx.finish().print();
    let (_, summary) = outcome.context("link discovery aborted")?;
    summary.print();
    Ok(())
}

async fn run_fetch(config: &PipelineConfig, controls: &FetchControls) -> Result<()> {
    let links = LinkStore::new(&config.links_path)
        .load_existing()
        .context("no link index; run discover first")?;
    info!(target: "fetch", "loaded {} urls", links.len());

    let fetcher = PageFetcher::new(
        http_source(config)?,
        RawStore::new(&config.raw_dir),
        CheckpointStore::new(config.progress_path(), config.resume_enabled),
        &config.game_url,
        controls.clone(),
    );
    let window = IndexWindow::new(config.start_index, config.end_index);
    let ctx = StageContext::begin("fetch");
    let outcome = fetcher.run(&ctx, &links, window).await;
    ctx.finish().print();
    let progress = outcome.context("fetch aborted")?;
    println!(
        "fetch completed. successful: {}, failed: {}",
        progress.successful_count(),
        progress.failed_count()
    );
    Ok(())
}

fn run_extract(config: &PipelineConfig, controls: &FetchControls) -> Result<()> {
    let extractor = RecordExtractor::from_config(config).with_stop(controls.stop_handle());
    let ctx = StageContext::begin("extract");
    let outcome = extractor.run(&ctx);
    ctx.finish().print();
    let summary = outcome.context("extraction aborted")?;
    println!(
        "extracted {} moves from {} documents ({} failed, see {})",
        summary.moves,
        summary.written,
        summary.failed,
        config.parse_error_path.display()
    );
    Ok(())
}

fn run_split(config: &PipelineConfig, _controls: &FetchControls) -> Result<()> {
    let ctx = StageContext::begin("split");
    let links = LinkStore::new(&config.links_path)
        .load_existing()
        .context("no link index; run discover first")?;
    let assignment = split(
        links.len(),
        config.train_ratio,
        config.valid_ratio,
        config.random_seed,
    )
    .context("invalid split ratios")?;
    assignment
        .save(&config.split_path)
        .context("failed to write partition file")?;
    for (name, games) in assignment.partitions() {
        info!(target: ctx.target(), "{name}: {} games", games.len());
        ctx.record_success();
    }
    ctx.finish().print();
    Ok(())
}

fn run_build(config: &PipelineConfig, controls: &FetchControls) -> Result<()> {
    let ctx = StageContext::begin("build");
    let links = LinkStore::new(&config.links_path)
        .load_existing()
        .context("no link index; run discover first")?;
    let assignment = PartitionAssignment::load(&config.split_path)
        .context("no partition file; run split first")?;
    assignment
        .check_cover(links.len())
        .context("partition file does not match the link index; re-run split")?;

    let builder = CorpusBuilder::from_config(config)
        .context("failed to load start state")?
        .with_stop(controls.stop_handle());
    let outcome = builder.build(&ctx, &assignment, &links.page_counts());
    ctx.finish().print();
    let summary = outcome.context("corpus build aborted")?;
    println!(
        "wrote {} multi-ply and {} single-ply pairs ({} games stopped at a missing page)",
        summary.multi_records, summary.single_records, summary.missing_pages
    );
    Ok(())
}
