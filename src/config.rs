//! Pipeline configuration and the command-line surface that fills it.

use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// How the corpus builder resets its "previous board" baseline.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineReset {
    /// Carry the previous board across page and game boundaries.
    #[default]
    Never,
    /// Restore the start state at the first page of every game.
    PerGame,
    /// Restore the start state at every page.
    PerPage,
}

/// Encoding of the current-board field in each source line.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateEncoding {
    /// Per-square transition tokens against the previous board.
    #[default]
    Diff,
    /// Piece token or `eps` per square.
    Absolute,
}

/// Every recognized pipeline option.
///
/// Deserializable so an external loader can supply it; `Default` holds the
/// values the command line falls back to.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// First listing page of annotated games.
    pub listing_url: String,
    /// Base URL for per-game annotation pages.
    pub game_url: String,
    /// Origin used to resolve relative links on listing pages.
    pub root_url: String,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Pause between consecutive requests, in milliseconds.
    pub request_delay_ms: u64,
    /// Per-request timeout, in milliseconds.
    pub page_timeout_ms: u64,
    /// Extra wait after a page arrives before it is captured, in milliseconds.
    pub render_wait_ms: u64,
    /// Upper bound on in-flight page fetches.
    pub max_concurrent: usize,
    /// Checkpoint every N completed fetches.
    pub save_frequency: usize,
    /// First game index to fetch.
    pub start_index: usize,
    /// Exclusive upper bound on game indices to fetch.
    pub end_index: Option<usize>,
    /// Whether a prior checkpoint is honored.
    pub resume_enabled: bool,
    /// Fraction of games assigned to `train`.
    pub train_ratio: f64,
    /// Fraction of games assigned to `valid`.
    pub valid_ratio: f64,
    /// Seed for the partition shuffle.
    pub random_seed: u64,
    /// Link index JSON.
    pub links_path: PathBuf,
    /// Directory of raw fetched pages and the crawl checkpoint.
    pub raw_dir: PathBuf,
    /// Directory of extracted move records.
    pub records_dir: PathBuf,
    /// Extraction error log.
    pub parse_error_path: PathBuf,
    /// Partition assignment JSON.
    pub split_path: PathBuf,
    /// Output directory for corpus files.
    pub corpus_dir: PathBuf,
    /// Optional start-state record; the standard opening position is used otherwise.
    pub start_state_path: Option<PathBuf>,
    /// Extraction worker threads (defaults to available parallelism).
    pub extract_workers: Option<usize>,
    /// Baseline reset policy for the corpus builder.
    pub baseline_reset: BaselineReset,
    /// Current-board encoding for the corpus builder.
    pub state_encoding: StateEncoding,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            listing_url: "https://gameknot.com/list_annotated.pl?u=all".to_string(),
            game_url: "https://gameknot.com/annotation.pl".to_string(),
            root_url: "https://gameknot.com".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_delay_ms: 1_000,
            page_timeout_ms: 30_000,
            render_wait_ms: 2_000,
            max_concurrent: 4,
            save_frequency: 10,
            start_index: 0,
            end_index: None,
            resume_enabled: true,
            train_ratio: 0.8,
            valid_ratio: 0.1,
            random_seed: 42,
            links_path: PathBuf::from("data/saved_links.json"),
            raw_dir: PathBuf::from("data/raw"),
            records_dir: PathBuf::from("data/records"),
            parse_error_path: PathBuf::from("data/parse_errors.txt"),
            split_path: PathBuf::from("data/split.json"),
            corpus_dir: PathBuf::from("data/corpus"),
            start_state_path: None,
            extract_workers: None,
            baseline_reset: BaselineReset::Never,
            state_encoding: StateEncoding::Diff,
        }
    }
}

const DEFAULT_USER_AGENT: &str = "chesscrawl/0.1 (+https://github.com/chesscrawl/chesscrawl)";

impl PipelineConfig {
    /// Rejects option combinations no stage can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("listing_url", &self.listing_url),
            ("game_url", &self.game_url),
            ("root_url", &self.root_url),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty(name));
            }
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Zero("max_concurrent"));
        }
        if self.save_frequency == 0 {
            return Err(ConfigError::Zero("save_frequency"));
        }
        if self.extract_workers == Some(0) {
            return Err(ConfigError::Zero("extract_workers"));
        }
        for (name, ratio) in [
            ("train_ratio", self.train_ratio),
            ("valid_ratio", self.valid_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ConfigError::Ratio { name, value: ratio });
            }
        }
        if self.train_ratio + self.valid_ratio > 1.0 {
            return Err(ConfigError::RatioSum(self.train_ratio + self.valid_ratio));
        }
        if let Some(end) = self.end_index {
            if end < self.start_index {
                return Err(ConfigError::Window {
                    start: self.start_index,
                    end,
                });
            }
        }
        Ok(())
    }

    /// Pause between consecutive requests.
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    /// Per-request timeout.
    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }

    /// Wait after a page arrives before capturing it.
    pub fn render_wait(&self) -> Duration {
        Duration::from_millis(self.render_wait_ms)
    }

    /// Crawl checkpoint location, kept beside the raw pages.
    pub fn progress_path(&self) -> PathBuf {
        self.raw_dir.join("progress.json")
    }
}

/// Validation failures for [`PipelineConfig`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A required string option was blank.
    Empty(&'static str),
    /// A count option was zero.
    Zero(&'static str),
    /// A ratio fell outside `[0, 1]`.
    Ratio {
        /// Option name.
        name: &'static str,
        /// Supplied value.
        value: f64,
    },
    /// `train_ratio + valid_ratio` exceeded 1.
    RatioSum(f64),
    /// `end_index` preceded `start_index`.
    Window {
        /// Start of the window.
        start: usize,
        /// End of the window.
        end: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty(name) => write!(f, "{name} must not be empty"),
            Self::Zero(name) => write!(f, "{name} must be greater than zero"),
            Self::Ratio { name, value } => write!(f, "{name} must lie in [0, 1], got {value}"),
            Self::RatioSum(sum) => write!(f, "train_ratio + valid_ratio must not exceed 1, got {sum}"),
            Self::Window { start, end } => {
                write!(f, "end_index {end} precedes start_index {start}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Pipeline stage selected on the command line.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Walk the listing and record page counts for new games.
    Discover,
    /// Download every game page, resuming from the last checkpoint.
    Fetch,
    /// Turn raw pages into move record files.
    Extract,
    /// Partition game indices into train/valid/test.
    Split,
    /// Emit aligned source/target corpus files.
    Build,
    /// Run every stage in order.
    All,
}

/// Command-line interface for the pipeline binary.
///
/// Unset options fall back to [`PipelineConfig::default`].
#[derive(Parser, Debug, Clone)]
#[command(
    name = "chesscrawl",
    about = "Crawl annotated chess games and build a commentary corpus"
)]
pub struct Cli {
    /// Stage to run
    #[command(subcommand)]
    pub stage: Stage,

    /// First listing page of annotated games
    #[arg(long, global = true, env = "CHESSCRAWL_LISTING_URL")]
    pub listing_url: Option<String>,

    /// Base URL for per-game annotation pages
    #[arg(long, global = true, env = "CHESSCRAWL_GAME_URL")]
    pub game_url: Option<String>,

    /// Origin used to resolve listing links
    #[arg(long, global = true, env = "CHESSCRAWL_ROOT_URL")]
    pub root_url: Option<String>,

    /// Milliseconds to wait between requests [default: 1000]
    #[arg(long, global = true, env = "CHESSCRAWL_REQUEST_DELAY_MS")]
    pub request_delay_ms: Option<u64>,

    /// Per-request timeout in milliseconds [default: 30000]
    #[arg(long, global = true, env = "CHESSCRAWL_PAGE_TIMEOUT_MS")]
    pub page_timeout_ms: Option<u64>,

    /// Milliseconds to let a page settle before capturing it [default: 2000]
    #[arg(long, global = true, env = "CHESSCRAWL_RENDER_WAIT_MS")]
    pub render_wait_ms: Option<u64>,

    /// Maximum concurrent page fetches [default: 4]
    #[arg(long, global = true, env = "CHESSCRAWL_MAX_CONCURRENT")]
    pub max_concurrent: Option<usize>,

    /// Write a checkpoint every N completed fetches [default: 10]
    #[arg(long, global = true, env = "CHESSCRAWL_SAVE_FREQUENCY")]
    pub save_frequency: Option<usize>,

    /// First game index to fetch [default: 0]
    #[arg(long, global = true, env = "CHESSCRAWL_START_INDEX")]
    pub start_index: Option<usize>,

    /// Exclusive last game index to fetch
    #[arg(long, global = true, env = "CHESSCRAWL_END_INDEX")]
    pub end_index: Option<usize>,

    /// Ignore any previous crawl checkpoint
    #[arg(long, global = true, env = "CHESSCRAWL_NO_RESUME")]
    pub no_resume: bool,

    /// Fraction of games assigned to train [default: 0.8]
    #[arg(long, global = true, env = "CHESSCRAWL_TRAIN_RATIO")]
    pub train_ratio: Option<f64>,

    /// Fraction of games assigned to valid [default: 0.1]
    #[arg(long, global = true, env = "CHESSCRAWL_VALID_RATIO")]
    pub valid_ratio: Option<f64>,

    /// Seed for the partition shuffle [default: 42]
    #[arg(long, global = true, env = "CHESSCRAWL_SEED")]
    pub seed: Option<u64>,

    /// Data root; every per-stage path is placed inside it [default: data]
    #[arg(long, global = true, env = "CHESSCRAWL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Start-state record used as the corpus baseline
    #[arg(long, global = true, env = "CHESSCRAWL_START_STATE")]
    pub start_state: Option<PathBuf>,

    /// Extraction worker threads [default: available parallelism]
    #[arg(long, global = true, env = "CHESSCRAWL_EXTRACT_WORKERS")]
    pub extract_workers: Option<usize>,

    /// When the corpus baseline returns to the start state [default: never]
    #[arg(long, global = true, env = "CHESSCRAWL_BASELINE_RESET")]
    pub baseline_reset: Option<BaselineReset>,

    /// Encoding of the current board in source lines [default: diff]
    #[arg(long, global = true, env = "CHESSCRAWL_STATE_ENCODING")]
    pub state_encoding: Option<StateEncoding>,
}

impl Cli {
    /// Converts the parsed CLI into a validated [`PipelineConfig`].
    pub fn build_config(&self) -> Result<PipelineConfig, ConfigError> {
        let mut config = PipelineConfig::default();
        if let Some(data) = &self.data_dir {
            config.links_path = data.join("saved_links.json");
            config.raw_dir = data.join("raw");
            config.records_dir = data.join("records");
            config.parse_error_path = data.join("parse_errors.txt");
            config.split_path = data.join("split.json");
            config.corpus_dir = data.join("corpus");
        }

        overlay(&mut config.listing_url, self.listing_url.clone());
        overlay(&mut config.game_url, self.game_url.clone());
        overlay(&mut config.root_url, self.root_url.clone());
        overlay(&mut config.request_delay_ms, self.request_delay_ms);
        overlay(&mut config.page_timeout_ms, self.page_timeout_ms);
        overlay(&mut config.render_wait_ms, self.render_wait_ms);
        overlay(&mut config.max_concurrent, self.max_concurrent);
        overlay(&mut config.save_frequency, self.save_frequency);
        overlay(&mut config.start_index, self.start_index);
        overlay(&mut config.train_ratio, self.train_ratio);
        overlay(&mut config.valid_ratio, self.valid_ratio);
        overlay(&mut config.random_seed, self.seed);
        overlay(&mut config.baseline_reset, self.baseline_reset);
        overlay(&mut config.state_encoding, self.state_encoding);
        if self.end_index.is_some() {
            config.end_index = self.end_index;
        }
        if self.start_state.is_some() {
            config.start_state_path = self.start_state.clone();
        }
        if self.extract_workers.is_some() {
            config.extract_workers = self.extract_workers;
        }
        if self.no_resume {
            config.resume_enabled = false;
        }

        config.validate()?;
        Ok(config)
    }
}

fn overlay<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(PipelineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_concurrency_and_bad_ratios() {
        let mut config = PipelineConfig::default();
        config.max_concurrent = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("max_concurrent")));

        let mut config = PipelineConfig::default();
        config.train_ratio = 0.9;
        config.valid_ratio = 0.2;
        assert!(matches!(config.validate(), Err(ConfigError::RatioSum(_))));

        let mut config = PipelineConfig::default();
        config.valid_ratio = -0.1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Ratio { name: "valid_ratio", .. })
        ));
    }

    #[test]
    fn rejects_inverted_window() {
        let mut config = PipelineConfig::default();
        config.start_index = 10;
        config.end_index = Some(5);
        assert_eq!(
            config.validate(),
            Err(ConfigError::Window { start: 10, end: 5 })
        );
    }

    #[test]
    fn cli_maps_data_dir_and_flags() {
        let cli = Cli::parse_from([
            "chesscrawl",
            "fetch",
            "--data-dir",
            "/tmp/games",
            "--max-concurrent",
            "8",
            "--no-resume",
            "--baseline-reset",
            "per-game",
        ]);
        assert_eq!(cli.stage, Stage::Fetch);
        let config = cli.build_config().expect("valid config");
        assert_eq!(config.max_concurrent, 8);
        assert!(!config.resume_enabled);
        assert_eq!(config.baseline_reset, BaselineReset::PerGame);
        assert_eq!(config.raw_dir, PathBuf::from("/tmp/games/raw"));
        assert_eq!(config.progress_path(), PathBuf::from("/tmp/games/raw/progress.json"));
    }

    #[test]
    fn unset_flags_take_config_defaults() {
        let cli = Cli::parse_from(["chesscrawl", "split", "--seed", "7"]);
        let config = cli.build_config().expect("valid config");
        let defaults = PipelineConfig::default();
        assert_eq!(config.random_seed, 7);
        assert_eq!(
            PipelineConfig {
                random_seed: defaults.random_seed,
                ..config
            },
            defaults
        );
    }

    #[test]
    fn zero_workers_flag_is_rejected() {
        let cli = Cli::parse_from(["chesscrawl", "extract", "--extract-workers", "0"]);
        assert_eq!(cli.build_config(), Err(ConfigError::Zero("extract_workers")));
    }

    #[test]
    fn deserializes_partial_config_over_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"max_concurrent": 2, "state_encoding": "absolute"}"#)
                .unwrap();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.state_encoding, StateEncoding::Absolute);
        assert_eq!(config.random_seed, 42);
    }
}
