//! Crash-resumable fetch progress and its checkpoint file.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::artifact::{self, ArtifactError, ErrorKind};

/// Which URLs have been fetched, which failed, and where the last completion was.
///
/// Membership in the successful set is the idempotence key for fetching: a
/// URL found there is never requested again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CrawlProgress {
    #[serde(default, alias = "successfulURLs", alias = "successfulUrls")]
    successful_urls: BTreeSet<String>,
    #[serde(default, alias = "failedURLs", alias = "failedUrls")]
    failed_urls: BTreeSet<String>,
    #[serde(default, alias = "lastIndex")]
    last_index: usize,
    #[serde(default)]
    timestamp: Option<String>,
}

impl CrawlProgress {
    /// Fresh progress whose resume marker starts at `start_index`.
    pub fn starting_at(start_index: usize) -> Self {
        Self {
            last_index: start_index,
            ..Self::default()
        }
    }

    /// Whether `url` was already fetched successfully.
    pub fn is_successful(&self, url: &str) -> bool {
        self.successful_urls.contains(url)
    }

    /// Whether `url` failed on its latest attempt.
    pub fn is_failed(&self, url: &str) -> bool {
        self.failed_urls.contains(url)
    }

    /// Marks `url` fetched; a previous failure for it is cleared.
    pub fn record_success(&mut self, url: &str, game_index: usize) {
        self.failed_urls.remove(url);
        self.successful_urls.insert(url.to_string());
        self.last_index = game_index;
    }

    /// Marks `url` failed so the next run retries it.
    pub fn record_failure(&mut self, url: &str, game_index: usize) {
        self.failed_urls.insert(url.to_string());
        self.last_index = game_index;
    }

    /// Game index of the most recently completed item.
    ///
    /// This is a best-effort marker, not a low-water mark: with several
    /// fetches in flight, items below it may still be unfinished.
    pub fn last_index(&self) -> usize {
        self.last_index
    }

    /// Number of successful URLs.
    pub fn successful_count(&self) -> usize {
        self.successful_urls.len()
    }

    /// Number of failed URLs.
    pub fn failed_count(&self) -> usize {
        self.failed_urls.len()
    }

    /// Failed URLs in sorted order.
    pub fn failed_urls(&self) -> impl Iterator<Item = &str> + '_ {
        self.failed_urls.iter().map(String::as_str)
    }

    /// Time of the checkpoint this progress was loaded from, if any.
    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }
}

#[derive(Serialize)]
struct Checkpoint<'a> {
    successful_urls: &'a BTreeSet<String>,
    failed_urls: &'a BTreeSet<String>,
    last_index: usize,
    timestamp: String,
}

/// Location and resume policy of the crawl checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    resume_enabled: bool,
}

impl CheckpointStore {
    /// Store at `path`; when `resume_enabled` is false, prior checkpoints are ignored.
    pub fn new(path: impl Into<PathBuf>, resume_enabled: bool) -> Self {
        Self {
            path: path.into(),
            resume_enabled,
        }
    }

    /// Checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a prior checkpoint is honored.
    pub fn resume_enabled(&self) -> bool {
        self.resume_enabled
    }

    /// Loads the previous checkpoint.
    ///
    /// Returns fresh progress when resuming is disabled or no checkpoint
    /// exists. A malformed checkpoint surfaces as an error so the caller can
    /// decide whether to start over.
    pub fn load(&self, start_index: usize) -> Result<CrawlProgress, ArtifactError> {
        if !self.resume_enabled {
            return Ok(CrawlProgress::starting_at(start_index));
        }
        match artifact::read_json::<CrawlProgress>(&self.path) {
            Ok(progress) => Ok(progress),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Ok(CrawlProgress::starting_at(start_index))
            }
            Err(err) => Err(err),
        }
    }

    /// Writes `progress` stamped with the current UTC time.
    pub fn save(&self, progress: &CrawlProgress) -> Result<(), ArtifactError> {
        let checkpoint = Checkpoint {
            successful_urls: &progress.successful_urls,
            failed_urls: &progress.failed_urls,
            last_index: progress.last_index,
            timestamp: Utc::now().to_rfc3339(),
        };
        artifact::write_json(&self.path, &checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_clears_prior_failure() {
        let mut progress = CrawlProgress::starting_at(3);
        assert_eq!(progress.last_index(), 3);
        progress.record_failure("u1", 4);
        assert!(progress.is_failed("u1"));
        progress.record_success("u1", 5);
        assert!(progress.is_successful("u1"));
        assert!(!progress.is_failed("u1"));
        assert_eq!(progress.last_index(), 5);
    }

    #[test]
    fn checkpoint_round_trip_sets_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("progress.json"), true);
        let mut progress = CrawlProgress::starting_at(0);
        progress.record_success("a", 1);
        progress.record_failure("b", 2);
        store.save(&progress).unwrap();

        let loaded = store.load(0).unwrap();
        assert!(loaded.is_successful("a"));
        assert!(loaded.is_failed("b"));
        assert_eq!(loaded.last_index(), 2);
        assert!(loaded.timestamp().is_some());
    }

    #[test]
    fn accepts_camel_case_checkpoints() {
        let json = r#"{"successfulURLs": ["x"], "failedURLs": [], "lastIndex": 7}"#;
        let progress: CrawlProgress = serde_json::from_str(json).unwrap();
        assert!(progress.is_successful("x"));
        assert_eq!(progress.last_index(), 7);
    }

    #[test]
    fn disabled_resume_ignores_existing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let mut progress = CrawlProgress::starting_at(0);
        progress.record_success("a", 9);
        CheckpointStore::new(&path, true).save(&progress).unwrap();

        let fresh = CheckpointStore::new(&path, false).load(2).unwrap();
        assert_eq!(fresh, CrawlProgress::starting_at(2));
    }

    #[test]
    fn missing_checkpoint_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("none.json"), true);
        assert_eq!(store.load(1).unwrap().last_index(), 1);
    }
}
