//! Sequential walk over the listing site that grows the [`LinkIndex`].

use log::{error, info, warn};
use std::sync::Arc;
use tokio::time::sleep;
use url::Url;

use crate::artifact::ArtifactError;
use crate::context::StageContext;
use crate::fetcher::FetchControls;
use crate::html::{self, game_id};
use crate::link_index::{LinkIndex, LinkStore};
use crate::source::{FetchError, PageSource};

/// Walks listing pages and records the page count of every new game.
pub struct LinkDiscoverer<S> {
    source: Arc<S>,
    store: LinkStore,
    listing_url: String,
    root_url: String,
    controls: FetchControls,
}

/// Totals for one discovery run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverSummary {
    /// Navigation pages walked.
    pub navigation_pages: usize,
    /// Games added this run.
    pub new_games: usize,
    /// Listing rows for games already in the index.
    pub known_games: usize,
    /// Navigation pages or game lookups that failed.
    pub failures: usize,
    /// Games in the index after the run.
    pub total_games: usize,
    /// Pages across all indexed games.
    pub total_pages: u64,
}

impl DiscoverSummary {
    /// Prints the link totals to stdout.
    pub fn print(&self) {
        println!(
            "Found {} links with {} total pages",
            self.total_games, self.total_pages
        );
        println!(
            "new: {}, known: {}, failures: {}",
            self.new_games, self.known_games, self.failures
        );
    }
}

impl<S: PageSource> LinkDiscoverer<S> {
    /// Builds a discoverer that persists into `store`.
    pub fn new(
        source: Arc<S>,
        store: LinkStore,
        listing_url: impl Into<String>,
        root_url: impl Into<String>,
        controls: FetchControls,
    ) -> Self {
        Self {
            source,
            store,
            listing_url: listing_url.into(),
            root_url: root_url.into(),
            controls,
        }
    }

    /// Underlying page source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Walks every navigation page and returns the updated index.
    ///
    /// The index is saved after each navigation page. Failures for a single
    /// page or game are logged and counted; only persistence errors abort.
    pub async fn discover(
        &self,
        ctx: &StageContext,
    ) -> Result<(LinkIndex, DiscoverSummary), ArtifactError> {
        let target = ctx.target();
        let mut index = self.store.load()?;
        let mut summary = DiscoverSummary::default();
        info!(target: target, "loaded {} known games", index.len());

        let navigation_pages = match self.navigation_page_count().await {
            Ok(count) => count,
            Err(err) => {
                error!(target: target, "failed to read listing root: {err}");
                summary.failures += 1;
                ctx.record_failure();
                1
            }
        };
        self.pause().await;

        for page in 0..navigation_pages {
            if self.controls.stop_requested() {
                warn!(target: target, "stop requested, ending walk at page {page}");
                break;
            }
            let page_url = format!("{}&p={page}", self.listing_url);
            match self.walk_listing_page(ctx, &page_url, &mut index, &mut summary).await {
                Ok(added) => {
                    self.store.save(&index)?;
                    info!(target: target, "fetched {added} links from page {page}");
                }
                Err(err) => {
                    error!(target: target, "failed to fetch {page_url}: {err}");
                    summary.failures += 1;
                    ctx.record_failure();
                }
            }
            summary.navigation_pages += 1;
            self.pause().await;
        }

        self.store.save(&index)?;
        summary.total_games = index.len();
        summary.total_pages = index.total_pages();
        Ok((index, summary))
    }

    async fn navigation_page_count(&self) -> Result<u32, FetchError> {
        self.page_count(&self.listing_url).await
    }

    async fn page_count(&self, url: &str) -> Result<u32, FetchError> {
        let body = self.source.fetch(url).await?;
        let count = html::page_count(&body).map_err(|source| FetchError::Html {
            url: url.to_string(),
            source,
        })?;
        Ok(count.unwrap_or(1).max(1))
    }

    async fn walk_listing_page(
        &self,
        ctx: &StageContext,
        page_url: &str,
        index: &mut LinkIndex,
        summary: &mut DiscoverSummary,
    ) -> Result<usize, FetchError> {
        let target = ctx.target();
        let body = self.source.fetch(page_url).await?;
        let links = html::listing_links(&body).map_err(|source| FetchError::Html {
            url: page_url.to_string(),
            source,
        })?;

        let mut added = 0;
        for href in links {
            if self.controls.stop_requested() {
                warn!(target: target, "stop requested, leaving {page_url} unfinished");
                break;
            }
            let id = game_id(&href);
            if index.contains(id) {
                info!(target: target, "{id} already exists, skipping");
                summary.known_games += 1;
                ctx.record_skip();
                continue;
            }

            let game_url = match resolve(&self.root_url, &href) {
                Ok(url) => url,
                Err(err) => {
                    warn!(target: target, "cannot resolve {href} against {}: {err}", self.root_url);
                    summary.failures += 1;
                    ctx.record_failure();
                    continue;
                }
            };
            match self.page_count(game_url.as_str()).await {
                Ok(pages) => {
                    info!(target: target, "found new link: {id} with {pages} pages");
                    index.insert(id, pages);
                    summary.new_games += 1;
                    added += 1;
                    ctx.record_success();
                }
                Err(err) => {
                    warn!(target: target, "skipping {id}: {err}");
                    summary.failures += 1;
                    ctx.record_failure();
                }
            }
            self.pause().await;
        }
        Ok(added)
    }

    async fn pause(&self) {
        let delay = self.controls.request_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

fn resolve(root_url: &str, href: &str) -> Result<Url, url::ParseError> {
    Url::parse(root_url)?.join(href)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::MemorySource;

    const ROOT: &str = "https://chess.test";
    const LISTING: &str = "https://chess.test/list.pl?u=all";

    fn listing(games: &[&str]) -> String {
        let rows: String = games
            .iter()
            .map(|id| {
                format!(
                    r#"<tr class="evn_list"><td><a href="/player/x">x</a></td><td><a href="/annotation.pl/{id}">{id}</a></td></tr>"#
                )
            })
            .collect();
        format!("<table>{rows}</table>")
    }

    fn paginator(pages: u32) -> String {
        let anchors: String = (1..=pages).map(|n| format!("<a>{n}</a>")).collect();
        format!(r#"<table class="paginator"><tr><td>{anchors}<a>next</a></td></tr></table>"#)
    }

    fn discoverer(source: MemorySource, store: LinkStore) -> LinkDiscoverer<MemorySource> {
        LinkDiscoverer::new(
            Arc::new(source),
            store,
            LISTING,
            ROOT,
            FetchControls::default().with_request_delay(std::time::Duration::ZERO),
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn records_new_games_and_skips_known_ones() {
        let dir = tempfile::tempdir().unwrap();
        let store = LinkStore::new(dir.path().join("links.json"));
        let mut existing = LinkIndex::new();
        existing.insert("g-old", 2);
        store.save(&existing).unwrap();

        let source = MemorySource::new()
            .with_page(LISTING, &paginator(2))
            .with_page(&format!("{LISTING}&p=0"), &listing(&["g-old", "g-new"]))
            .with_page(&format!("{LISTING}&p=1"), &listing(&["g-single"]))
            .with_page("https://chess.test/annotation.pl/g-new", &paginator(3))
            .with_page("https://chess.test/annotation.pl/g-single", "<p>no paginator</p>");

        let discoverer = discoverer(source, store.clone());
        let ctx = StageContext::begin("discover");
        let (index, summary) = discoverer.discover(&ctx).await.unwrap();

        assert_eq!(index.get(0), Some(("g-old", 2)));
        assert_eq!(index.get(1), Some(("g-new", 3)));
        assert_eq!(index.get(2), Some(("g-single", 1)));
        assert_eq!(summary.new_games, 2);
        assert_eq!(summary.known_games, 1);
        assert_eq!(summary.total_pages, 6);
        assert_eq!(store.load().unwrap(), index);
        assert!(!discoverer
            .source()
            .requested()
            .contains(&"https://chess.test/annotation.pl/g-old".to_string()));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_listing_page_does_not_stop_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        let store = LinkStore::new(dir.path().join("links.json"));
        let source = MemorySource::new()
            .with_page(LISTING, &paginator(2))
            .with_page(&format!("{LISTING}&p=1"), &listing(&["g1"]))
            .with_page("https://chess.test/annotation.pl/g1", "<p></p>");

        let ctx = StageContext::begin("discover");
        let (index, summary) = discoverer(source, store).discover(&ctx).await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.navigation_pages, 2);
        assert_eq!(ctx.failed(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stop_mid_page_keeps_games_found_so_far() {
        let dir = tempfile::tempdir().unwrap();
        let store = LinkStore::new(dir.path().join("links.json"));
        let controls = FetchControls::default().with_request_delay(std::time::Duration::ZERO);
        let stop = controls.stop_handle();
        // Requests: listing root, page 0, then the first game's lookup.
        let source = MemorySource::new()
            .with_page(LISTING, &paginator(2))
            .with_page(&format!("{LISTING}&p=0"), &listing(&["g1", "g2", "g3"]))
            .with_page(&format!("{LISTING}&p=1"), &listing(&["g4"]))
            .with_page("https://chess.test/annotation.pl/g1", "<p></p>")
            .with_page("https://chess.test/annotation.pl/g2", "<p></p>")
            .with_hook(move |call| {
                if call == 3 {
                    stop.store(true, std::sync::atomic::Ordering::Release);
                }
            });

        let discoverer = LinkDiscoverer::new(Arc::new(source), store.clone(), LISTING, ROOT, controls);
        let ctx = StageContext::begin("discover");
        let (index, summary) = discoverer.discover(&ctx).await.unwrap();

        assert_eq!(discoverer.source().calls(), 3);
        assert_eq!(index.len(), 1);
        assert!(index.contains("g1"));
        assert_eq!(summary.navigation_pages, 1);
        assert_eq!(store.load().unwrap(), index);
    }
}
