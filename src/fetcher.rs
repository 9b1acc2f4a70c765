//! Bounded, resumable download of every game page in the link index.
//!
//! Work items are dispatched through a counting semaphore so at most
//! `max_concurrent` fetches are in flight. Shared [`CrawlProgress`] sits
//! behind a single mutex; checkpoints are written from inside that guard so
//! each one is a consistent snapshot.

use futures_util::future::join_all;
use log::{error, info, warn};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, timeout};

use crate::artifact::{self, ArtifactError, ErrorKind};
use crate::config::PipelineConfig;
use crate::context::StageContext;
use crate::link_index::LinkIndex;
use crate::progress::{CheckpointStore, CrawlProgress};
use crate::source::{FetchError, PageSource};

/// Throttle knobs and the shared stop flag for network stages.
#[derive(Clone, Debug)]
pub struct FetchControls {
    max_concurrent: usize,
    save_frequency: usize,
    request_delay: Duration,
    page_timeout: Duration,
    render_wait: Duration,
    stop: Arc<AtomicBool>,
}

impl FetchControls {
    /// Constructs controls; zero limits are raised to one.
    pub fn new(
        max_concurrent: usize,
        save_frequency: usize,
        request_delay: Duration,
        page_timeout: Duration,
        render_wait: Duration,
    ) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            save_frequency: save_frequency.max(1),
            request_delay,
            page_timeout,
            render_wait,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Controls taken from a pipeline configuration.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.max_concurrent,
            config.save_frequency,
            config.request_delay(),
            config.page_timeout(),
            config.render_wait(),
        )
    }

    /// Replaces the politeness delay.
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Replaces the render-settle wait.
    pub fn with_render_wait(mut self, wait: Duration) -> Self {
        self.render_wait = wait;
        self
    }

    /// Replaces the concurrency limit.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Replaces the checkpoint cadence.
    pub fn with_save_frequency(mut self, save_frequency: usize) -> Self {
        self.save_frequency = save_frequency.max(1);
        self
    }

    /// Maximum in-flight fetches.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Completions between checkpoints.
    pub fn save_frequency(&self) -> usize {
        self.save_frequency
    }

    /// Pause after each request.
    pub fn request_delay(&self) -> Duration {
        self.request_delay
    }

    /// Per-request timeout.
    pub fn page_timeout(&self) -> Duration {
        self.page_timeout
    }

    /// Wait between a response arriving and it being captured.
    pub fn render_wait(&self) -> Duration {
        self.render_wait
    }

    /// Handle that signal handlers flip to stop new work.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Asks running stages to stop issuing new work.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether a stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl Default for FetchControls {
    fn default() -> Self {
        Self::new(
            4,
            10,
            Duration::from_millis(1_000),
            Duration::from_millis(30_000),
            Duration::from_millis(2_000),
        )
    }
}

/// Configured range of game indices to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexWindow {
    /// First game index.
    pub start: usize,
    /// Exclusive upper bound; `None` means the whole index.
    pub end: Option<usize>,
}

impl IndexWindow {
    /// Window over `start..end`.
    pub fn new(start: usize, end: Option<usize>) -> Self {
        Self { start, end }
    }

    /// Clamps the configured window to an index of `len` games.
    pub fn bounds(&self, len: usize) -> Range<usize> {
        let end = self.end.map_or(len, |end| end.min(len));
        self.start.min(end)..end
    }

    /// First index dispatched unconditionally when resuming from `progress`.
    pub fn resume_start(&self, progress: &CrawlProgress, resume: bool, len: usize) -> usize {
        let bounds = self.bounds(len);
        let start = if resume {
            progress.last_index().max(self.start)
        } else {
            self.start
        };
        start.clamp(bounds.start, bounds.end)
    }
}

/// One (game, page) download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Stable game index.
    pub game_index: usize,
    /// Zero-based page number within the game.
    pub page: u32,
    /// URL to request.
    pub url: String,
}

impl WorkItem {
    /// `{game_url}/{game_id}&pg={page}`.
    pub fn new(game_url: &str, game_index: usize, game_id: &str, page: u32) -> Self {
        Self {
            game_index,
            page,
            url: format!("{game_url}/{game_id}&pg={page}"),
        }
    }

    /// Artifact stem shared by the raw page and its record file.
    pub fn artifact_stem(&self) -> String {
        artifact_stem(self.game_index, self.page)
    }

    /// Every page of every game in `range`, in index order.
    pub fn expand(links: &LinkIndex, game_url: &str, range: Range<usize>) -> Vec<Self> {
        range
            .filter_map(|index| links.get(index).map(|entry| (index, entry)))
            .flat_map(|(index, (id, pages))| {
                (0..pages).map(move |page| Self::new(game_url, index, id, page))
            })
            .collect()
    }
}

/// `saved{game_index}_{page}`.
pub fn artifact_stem(game_index: usize, page: u32) -> String {
    format!("saved{game_index}_{page}")
}

/// Directory of raw fetched pages.
#[derive(Debug, Clone)]
pub struct RawStore {
    dir: PathBuf,
}

impl RawStore {
    /// Store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `saved{game}_{page}.html` under the store root.
    pub fn path_for(&self, item: &WorkItem) -> PathBuf {
        self.dir.join(format!("{}.html", item.artifact_stem()))
    }

    /// Replaces the stored page for `item`.
    pub fn write(&self, item: &WorkItem, body: &str) -> Result<PathBuf, ArtifactError> {
        let path = self.path_for(item);
        artifact::write_atomic(&path, body.as_bytes())?;
        Ok(path)
    }
}

/// Concurrent page downloader.
pub struct PageFetcher<S> {
    source: Arc<S>,
    raw: RawStore,
    checkpoints: CheckpointStore,
    game_url: String,
    controls: FetchControls,
}

struct Shared<S> {
    source: Arc<S>,
    raw: RawStore,
    checkpoints: CheckpointStore,
    controls: FetchControls,
    progress: Mutex<CrawlProgress>,
    completed: AtomicUsize,
    halted: AtomicBool,
    target: &'static str,
}

impl<S> Shared<S> {
    /// Whether dispatch should stop: an interrupt, or a worker hit a fatal error.
    fn halted(&self) -> bool {
        self.controls.stop_requested() || self.halted.load(Ordering::Acquire)
    }
}

impl<S: PageSource> PageFetcher<S> {
    /// Builds a fetcher writing pages into `raw` and progress into `checkpoints`.
    pub fn new(
        source: Arc<S>,
        raw: RawStore,
        checkpoints: CheckpointStore,
        game_url: impl Into<String>,
        controls: FetchControls,
    ) -> Self {
        Self {
            source,
            raw,
            checkpoints,
            game_url: game_url.into(),
            controls,
        }
    }

    /// Underlying page source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetches every page of the games in `window` and returns the final progress.
    ///
    /// URLs already marked successful are skipped without a request. Games
    /// before the resume marker are only revisited for URLs that previously
    /// failed. A final checkpoint is written whether the run succeeds or not.
    pub async fn run(
        &self,
        ctx: &StageContext,
        links: &LinkIndex,
        window: IndexWindow,
    ) -> Result<CrawlProgress, FetchError> {
        let target = ctx.target();
        let progress = self.load_progress(target, window.start)?;
        let bounds = window.bounds(links.len());
        let resume_from =
            window.resume_start(&progress, self.checkpoints.resume_enabled(), links.len());
        info!(
            target: target,
            "processing games {resume_from}..{} (revisiting failures from {})",
            bounds.end,
            bounds.start
        );

        let items: Vec<WorkItem> = WorkItem::expand(links, &self.game_url, bounds)
            .into_iter()
            .filter(|item| item.game_index >= resume_from || progress.is_failed(&item.url))
            .collect();
        info!(target: target, "{} work items queued", items.len());

        let shared = Arc::new(Shared {
            source: Arc::clone(&self.source),
            raw: self.raw.clone(),
            checkpoints: self.checkpoints.clone(),
            controls: self.controls.clone(),
            progress: Mutex::new(progress),
            completed: AtomicUsize::new(0),
            halted: AtomicBool::new(false),
            target,
        });

        let outcome = self.dispatch(ctx, &shared, items).await;

        let progress = shared.progress.lock().await;
        let saved = shared.checkpoints.save(&progress);
        info!(
            target: target,
            "fetch finished: {} successful, {} failed in total",
            progress.successful_count(),
            progress.failed_count()
        );
        outcome?;
        saved?;
        Ok(progress.clone())
    }

    fn load_progress(
        &self,
        target: &'static str,
        start_index: usize,
    ) -> Result<CrawlProgress, FetchError> {
        match self.checkpoints.load(start_index) {
            Ok(progress) => {
                if let Some(stamp) = progress.timestamp() {
                    info!(
                        target: target,
                        "resumed from index {} (checkpoint {stamp})",
                        progress.last_index()
                    );
                }
                Ok(progress)
            }
            Err(err) if err.kind() == ErrorKind::Malformed => {
                error!(target: target, "error loading progress, starting over: {err}");
                Ok(CrawlProgress::starting_at(start_index))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn dispatch(
        &self,
        ctx: &StageContext,
        shared: &Arc<Shared<S>>,
        items: Vec<WorkItem>,
    ) -> Result<(), FetchError> {
        let target = ctx.target();
        let semaphore = Arc::new(Semaphore::new(self.controls.max_concurrent()));
        let mut handles = Vec::with_capacity(items.len());
        let mut not_started = 0usize;

        for item in items {
            if shared.halted() {
                not_started += 1;
                continue;
            }
            if shared.progress.lock().await.is_successful(&item.url) {
                ctx.record_skip();
                continue;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if shared.halted() {
                not_started += 1;
                continue;
            }
            let shared = Arc::clone(shared);
            handles.push(tokio::spawn(async move {
                let result = fetch_one(&shared, item).await;
                if result.is_err() {
                    shared.halted.store(true, Ordering::Release);
                }
                drop(permit);
                result
            }));
        }
        if not_started > 0 {
            warn!(target: target, "dispatch halted, {not_started} items were not started");
        }

        let mut fatal = None;
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(true)) => ctx.record_success(),
                Ok(Ok(false)) => ctx.record_failure(),
                Ok(Err(err)) => {
                    error!(target: target, "{err}");
                    fatal.get_or_insert(err);
                }
                Err(err) => {
                    error!(target: target, "fetch task aborted: {err}");
                    fatal.get_or_insert(FetchError::Worker(err));
                }
            }
        }
        fatal.map_or(Ok(()), Err)
    }
}

/// Fetches and stores one page. `Ok(false)` is a recorded, retryable failure;
/// `Err` means the checkpoint could not be written.
async fn fetch_one<S: PageSource>(shared: &Shared<S>, item: WorkItem) -> Result<bool, FetchError> {
    let target = shared.target;
    let result = download(shared, &item).await;

    let mut progress = shared.progress.lock().await;
    let succeeded = match result {
        Ok(path) => {
            info!(target: target, "saved {} to {}", item.url, path.display());
            progress.record_success(&item.url, item.game_index);
            true
        }
        Err(err) => {
            error!(target: target, "failed to fetch {}: {err}", item.url);
            progress.record_failure(&item.url, item.game_index);
            false
        }
    };
    let completed = shared.completed.fetch_add(1, Ordering::AcqRel) + 1;
    if completed % shared.controls.save_frequency() == 0 {
        shared.checkpoints.save(&progress)?;
    }
    drop(progress);

    let delay = shared.controls.request_delay();
    if !delay.is_zero() {
        sleep(delay).await;
    }
    Ok(succeeded)
}

async fn download<S: PageSource>(shared: &Shared<S>, item: &WorkItem) -> Result<PathBuf, FetchError> {
    let limit = shared.controls.page_timeout();
    let body = match timeout(limit, shared.source.fetch(&item.url)).await {
        Ok(body) => body?,
        Err(_) => {
            return Err(FetchError::Timeout {
                url: item.url.clone(),
                after: limit,
            })
        }
    };
    let wait = shared.controls.render_wait();
    if !wait.is_zero() {
        sleep(wait).await;
    }
    Ok(shared.raw.write(item, &body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::MemorySource;

    const GAME_URL: &str = "https://chess.test/annotation.pl";

    fn links() -> LinkIndex {
        let mut links = LinkIndex::new();
        links.insert("g0", 2);
        links.insert("g1", 1);
        links.insert("g2", 3);
        links
    }

    fn all_pages(source: MemorySource) -> MemorySource {
        WorkItem::expand(&links(), GAME_URL, 0..3)
            .into_iter()
            .fold(source, |source, item| {
                let body = format!("<html>{}</html>", item.url);
                source.with_page(&item.url, &body)
            })
    }

    fn quick_controls() -> FetchControls {
        FetchControls::default()
            .with_request_delay(Duration::ZERO)
            .with_render_wait(Duration::ZERO)
    }

    fn fetcher(
        source: MemorySource,
        dir: &Path,
        controls: FetchControls,
        resume: bool,
    ) -> PageFetcher<MemorySource> {
        PageFetcher::new(
            Arc::new(source),
            RawStore::new(dir.join("raw")),
            CheckpointStore::new(dir.join("raw/progress.json"), resume),
            GAME_URL,
            controls,
        )
    }

    #[test]
    fn work_items_follow_game_url_scheme() {
        let items = WorkItem::expand(&links(), GAME_URL, 1..3);
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].url, "https://chess.test/annotation.pl/g1&pg=0");
        assert_eq!(items[0].artifact_stem(), "saved1_0");
        assert_eq!(items[3].artifact_stem(), "saved2_2");
    }

    #[test]
    fn window_clamps_and_honors_resume_marker() {
        let window = IndexWindow::new(1, Some(10));
        assert_eq!(window.bounds(5), 1..5);
        let progress = CrawlProgress::starting_at(3);
        assert_eq!(window.resume_start(&progress, true, 5), 3);
        assert_eq!(window.resume_start(&progress, false, 5), 1);
        assert_eq!(IndexWindow::new(7, None).bounds(5), 5..5);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn second_run_makes_no_requests() {
        let dir = tempfile::tempdir().unwrap();

        let first = fetcher(all_pages(MemorySource::new()), dir.path(), quick_controls(), true);
        let ctx = StageContext::begin("fetch");
        let progress = first.run(&ctx, &links(), IndexWindow::default()).await.unwrap();
        assert_eq!(progress.successful_count(), 6);
        assert_eq!(ctx.succeeded(), 6);
        let raw = dir.path().join("raw/saved2_1.html");
        assert!(std::fs::read_to_string(raw).unwrap().contains("g2&pg=1"));

        let second = fetcher(all_pages(MemorySource::new()), dir.path(), quick_controls(), true);
        let ctx = StageContext::begin("fetch");
        second.run(&ctx, &links(), IndexWindow::default()).await.unwrap();
        assert_eq!(second.source().calls(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn in_flight_requests_never_exceed_limit() {
        let dir = tempfile::tempdir().unwrap();
        let source = all_pages(MemorySource::new()).with_latency(Duration::from_millis(10));
        let fetcher = fetcher(source, dir.path(), quick_controls().with_max_concurrent(2), false);
        let ctx = StageContext::begin("fetch");
        fetcher.run(&ctx, &links(), IndexWindow::default()).await.unwrap();

        assert_eq!(fetcher.source().calls(), 6);
        assert!(fetcher.source().peak_in_flight() <= 2);
        assert!(fetcher.source().peak_in_flight() >= 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failures_are_recorded_then_retried() {
        let dir = tempfile::tempdir().unwrap();
        let missing = "https://chess.test/annotation.pl/g0&pg=1";
        let partial = WorkItem::expand(&links(), GAME_URL, 0..3)
            .into_iter()
            .filter(|item| item.url != missing)
            .fold(MemorySource::new(), |source, item| {
                source.with_page(&item.url, "<html></html>")
            });

        let first = fetcher(partial, dir.path(), quick_controls(), true);
        let ctx = StageContext::begin("fetch");
        let progress = first.run(&ctx, &links(), IndexWindow::default()).await.unwrap();
        assert!(progress.is_failed(missing));
        assert_eq!(ctx.failed(), 1);

        let second = fetcher(all_pages(MemorySource::new()), dir.path(), quick_controls(), true);
        let ctx = StageContext::begin("fetch");
        let progress = second.run(&ctx, &links(), IndexWindow::default()).await.unwrap();
        assert_eq!(second.source().requested(), vec![missing.to_string()]);
        assert!(progress.is_successful(missing));
        assert_eq!(progress.failed_count(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stop_before_start_writes_checkpoint_without_requests() {
        let dir = tempfile::tempdir().unwrap();
        let controls = quick_controls();
        controls.request_stop();
        let fetcher = fetcher(all_pages(MemorySource::new()), dir.path(), controls, true);
        let ctx = StageContext::begin("fetch");
        fetcher.run(&ctx, &links(), IndexWindow::default()).await.unwrap();

        assert_eq!(fetcher.source().calls(), 0);
        assert!(dir.path().join("raw/progress.json").exists());
    }

    fn sequential_controls() -> FetchControls {
        quick_controls().with_max_concurrent(1).with_save_frequency(2)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn checkpoints_every_save_frequency_completions() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("raw/progress.json");
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let source = {
            let seen = Arc::clone(&seen);
            let checkpoint = checkpoint.clone();
            all_pages(MemorySource::new()).with_hook(move |_| {
                let saved = CheckpointStore::new(&checkpoint, true)
                    .load(0)
                    .map(|progress| progress.successful_count())
                    .unwrap_or(usize::MAX);
                seen.lock().unwrap().push(saved);
            })
        };

        let fetcher = fetcher(source, dir.path(), sequential_controls(), true);
        let ctx = StageContext::begin("fetch");
        fetcher.run(&ctx, &links(), IndexWindow::default()).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0, 0, 2, 2, 4, 4]);
        let last = CheckpointStore::new(&checkpoint, true).load(0).unwrap();
        assert_eq!(last.successful_count(), 6);
        assert!(last.timestamp().is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn checkpoint_failure_halts_dispatch_and_keeps_last_good_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("raw/progress.json");
        let source = {
            let staging = artifact::staging_path(&checkpoint);
            all_pages(MemorySource::new()).with_hook(move |call| {
                if call == 3 {
                    std::fs::create_dir_all(&staging).unwrap();
                }
            })
        };

        let fetcher = fetcher(source, dir.path(), sequential_controls(), true);
        let ctx = StageContext::begin("fetch");
        let err = fetcher
            .run(&ctx, &links(), IndexWindow::default())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Artifact(_)), "{err}");
        assert_eq!(fetcher.source().calls(), 4);
        let on_disk = CheckpointStore::new(&checkpoint, true).load(0).unwrap();
        assert_eq!(on_disk.successful_count(), 2);
        assert!(on_disk.is_successful("https://chess.test/annotation.pl/g0&pg=0"));
        assert!(on_disk.is_successful("https://chess.test/annotation.pl/g0&pg=1"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn window_limits_games() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(all_pages(MemorySource::new()), dir.path(), quick_controls(), false);
        let ctx = StageContext::begin("fetch");
        fetcher
            .run(&ctx, &links(), IndexWindow::new(1, Some(2)))
            .await
            .unwrap();
        assert_eq!(
            fetcher.source().requested(),
            vec!["https://chess.test/annotation.pl/g1&pg=0".to_string()]
        );
    }
}
