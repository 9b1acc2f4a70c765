#![warn(missing_docs)]
//! Core library entry points for the chesscrawl ingestion pipeline.
//!
//! The pipeline runs in five stages that hand off through files on disk:
//! link discovery, page fetching, record extraction, dataset splitting and
//! corpus building. Each stage can be re-run and resumes where it left off.

pub mod artifact;
pub mod board;
pub mod config;
pub mod context;
pub mod corpus;
pub mod discover;
pub mod extract;
pub mod fetcher;
pub mod html;
pub mod link_index;
pub mod notation;
pub mod progress;
pub mod runtime;
pub mod source;
pub mod splitter;

pub use artifact::{ArtifactError, ErrorKind};
pub use board::{BoardCell, BoardSnapshot, Color, Piece, PieceKind, BOARD_SQUARES};
pub use config::{BaselineReset, Cli, ConfigError, PipelineConfig, Stage, StateEncoding};
pub use context::{StageContext, StageReport};
pub use corpus::{CorpusBuilder, CorpusRecord, CorpusSummary};
pub use discover::{DiscoverSummary, LinkDiscoverer};
pub use extract::{ExtractError, ExtractOutcome, ExtractSummary, MoveRecord, RecordExtractor};
pub use fetcher::{FetchControls, IndexWindow, PageFetcher, RawStore, WorkItem};
pub use link_index::{LinkIndex, LinkStore};
pub use progress::{CheckpointStore, CrawlProgress};
pub use runtime::run as run_stage;
pub use source::{FetchError, HttpSource, PageSource};
pub use splitter::{split, PartitionAssignment, SplitError};
