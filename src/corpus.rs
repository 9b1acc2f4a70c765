//! Aligned source/target corpus files built from extracted move records.
//!
//! Each move record becomes one line pair. The source line encodes the board
//! (as a transition from the previous board, or absolutely), the previous
//! board, and the tokenized move list; the target line is the normalized
//! commentary. Records carrying exactly one ply are also written to the
//! single-ply files.

use log::{error, info, warn};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::artifact::{self, ArtifactError, ErrorKind};
use crate::board::{BoardCell, BoardSnapshot};
use crate::config::{BaselineReset, PipelineConfig, StateEncoding};
use crate::context::StageContext;
use crate::extract::MoveRecord;
use crate::fetcher::artifact_stem;
use crate::notation::ply_tokens;
use crate::splitter::PartitionAssignment;

/// Separates the current board from the previous board.
pub const END_OF_CURRENT: &str = "<EOC>";
/// Separates the previous board from the move history.
pub const END_OF_PREVIOUS: &str = "<EOP>";
/// Ends the move history.
pub const END_OF_MOVE_HISTORY: &str = "<EOMH>";

const EMPTY: &str = "eps";

/// One aligned source/target pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusRecord {
    /// Board features and move history.
    pub source: String,
    /// Whitespace-tokenized commentary.
    pub target: String,
    /// Plies in the move history.
    pub plies: usize,
}

impl CorpusRecord {
    /// Encodes `record` against the board that preceded it.
    pub fn from_move(previous: &BoardSnapshot, record: &MoveRecord, encoding: StateEncoding) -> Self {
        let current = match encoding {
            StateEncoding::Diff => diff_tokens(previous, &record.board),
            StateEncoding::Absolute => record.board.occupancy(),
        };
        let plies = ply_tokens(&record.move_text);
        let source = format!(
            "{current} {END_OF_CURRENT} {} {END_OF_PREVIOUS} {} {END_OF_MOVE_HISTORY}",
            previous.occupancy(),
            plies.join(" ")
        );
        Self {
            source,
            target: normalize_comment(&record.comment),
            plies: plies.len(),
        }
    }

    /// Whether this pair also belongs in the single-ply files.
    pub fn is_single_ply(&self) -> bool {
        self.plies == 1
    }
}

/// Per-square transition tokens from `previous` to `current`, space-joined.
///
/// `eps` marks a square that is empty in both or unchanged, `-<piece>` a
/// square that was vacated, and `+<piece>` a square that gained or changed
/// its occupant.
pub fn diff_tokens(previous: &BoardSnapshot, current: &BoardSnapshot) -> String {
    let tokens: Vec<String> = previous
        .cells()
        .iter()
        .zip(current.cells())
        .map(|(before, after)| cell_transition(before, after))
        .collect();
    tokens.join(" ")
}

fn cell_transition(before: &BoardCell, after: &BoardCell) -> String {
    match (before.piece, after.piece) {
        (None, None) => EMPTY.to_string(),
        (Some(gone), None) => format!("-{gone}"),
        (None, Some(arrived)) => format!("+{arrived}"),
        (Some(old), Some(new)) if old == new => EMPTY.to_string(),
        (Some(_), Some(new)) => format!("+{new}"),
    }
}

/// Replaces non-ASCII characters with `?` and collapses whitespace.
pub fn normalize_comment(comment: &str) -> String {
    let ascii: String = comment
        .chars()
        .map(|c| if c.is_ascii() { c } else { '?' })
        .collect();
    ascii.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Loads the baseline board: the `board` of a move-record JSON object, or
/// the standard starting position when no path is given.
pub fn load_start_state(path: Option<&Path>) -> Result<BoardSnapshot, ArtifactError> {
    match path {
        Some(path) => artifact::read_json::<MoveRecord>(path).map(|record| record.board),
        None => Ok(BoardSnapshot::initial_position()),
    }
}

/// Totals for one build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorpusSummary {
    /// Record files consumed.
    pub pages: usize,
    /// Games abandoned at a missing record file.
    pub missing_pages: usize,
    /// Games abandoned at an unreadable record file.
    pub malformed_pages: usize,
    /// Games whose index had no page count.
    pub unknown_games: usize,
    /// Lines written to multi-ply files.
    pub multi_records: usize,
    /// Lines written to single-ply files.
    pub single_records: usize,
    /// Games left unprocessed because a stop was requested.
    pub not_started: usize,
}

impl CorpusSummary {
    fn absorb(&mut self, other: CorpusSummary) {
        self.pages += other.pages;
        self.missing_pages += other.missing_pages;
        self.malformed_pages += other.malformed_pages;
        self.unknown_games += other.unknown_games;
        self.multi_records += other.multi_records;
        self.single_records += other.single_records;
        self.not_started += other.not_started;
    }
}

struct PartitionWriters {
    files: [(PathBuf, BufWriter<File>); 4],
}

impl PartitionWriters {
    const MULTI_SOURCE: usize = 0;
    const MULTI_TARGET: usize = 1;
    const SINGLE_SOURCE: usize = 2;
    const SINGLE_TARGET: usize = 3;

    fn create(dir: &Path, partition: &str) -> Result<Self, ArtifactError> {
        let open = |suffix: &str| -> Result<(PathBuf, BufWriter<File>), ArtifactError> {
            let path = dir.join(format!("{partition}.che-eng.{suffix}"));
            let file = File::create(&path).map_err(|err| ArtifactError::io(&path, err))?;
            Ok((path, BufWriter::new(file)))
        };
        Ok(Self {
            files: [
                open("multi.che")?,
                open("multi.en")?,
                open("single.che")?,
                open("single.en")?,
            ],
        })
    }

    fn write_line(&mut self, slot: usize, line: &str) -> Result<(), ArtifactError> {
        let (path, writer) = &mut self.files[slot];
        writeln!(writer, "{line}").map_err(|err| ArtifactError::io(path, err))
    }

    fn append(&mut self, record: &CorpusRecord) -> Result<(), ArtifactError> {
        self.write_line(Self::MULTI_SOURCE, &record.source)?;
        self.write_line(Self::MULTI_TARGET, &record.target)?;
        if record.is_single_ply() {
            self.write_line(Self::SINGLE_SOURCE, &record.source)?;
            self.write_line(Self::SINGLE_TARGET, &record.target)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(), ArtifactError> {
        for (path, writer) in &mut self.files {
            writer.flush().map_err(|err| ArtifactError::io(path, err))?;
        }
        Ok(())
    }
}

/// Walks partitions game by game and emits corpus files.
#[derive(Debug, Clone)]
pub struct CorpusBuilder {
    records_dir: PathBuf,
    output_dir: PathBuf,
    start_state: BoardSnapshot,
    baseline_reset: BaselineReset,
    state_encoding: StateEncoding,
    stop: Arc<AtomicBool>,
}

impl CorpusBuilder {
    /// Builder reading records from `records_dir` and writing into `output_dir`.
    pub fn new(
        records_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        start_state: BoardSnapshot,
    ) -> Self {
        Self {
            records_dir: records_dir.into(),
            output_dir: output_dir.into(),
            start_state,
            baseline_reset: BaselineReset::default(),
            state_encoding: StateEncoding::default(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builder configured from `config`, loading its start state.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ArtifactError> {
        let start_state = load_start_state(config.start_state_path.as_deref())?;
        Ok(Self::new(&config.records_dir, &config.corpus_dir, start_state)
            .with_baseline_reset(config.baseline_reset)
            .with_state_encoding(config.state_encoding))
    }

    /// Sets when the previous-board baseline returns to the start state.
    pub fn with_baseline_reset(mut self, reset: BaselineReset) -> Self {
        self.baseline_reset = reset;
        self
    }

    /// Sets the current-board encoding.
    pub fn with_state_encoding(mut self, encoding: StateEncoding) -> Self {
        self.state_encoding = encoding;
        self
    }

    /// Shares a stop flag, checked before each partition and each game.
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Builds every partition in `assignment`.
    ///
    /// `page_counts[i]` is the number of pages of game `i`.
    pub fn build(
        &self,
        ctx: &StageContext,
        assignment: &PartitionAssignment,
        page_counts: &[u32],
    ) -> Result<CorpusSummary, ArtifactError> {
        fs::create_dir_all(&self.output_dir)
            .map_err(|err| ArtifactError::io(&self.output_dir, err))?;
        let mut summary = CorpusSummary::default();
        for (name, games) in assignment.partitions() {
            if self.stop_requested() {
                warn!(target: ctx.target(), "stop requested, leaving {name} unwritten");
                summary.not_started += games.len();
                continue;
            }
            summary.absorb(self.build_partition(ctx, name, games, page_counts)?);
        }
        Ok(summary)
    }

    /// Builds the four corpus files of one partition.
    pub fn build_partition(
        &self,
        ctx: &StageContext,
        name: &str,
        games: &[usize],
        page_counts: &[u32],
    ) -> Result<CorpusSummary, ArtifactError> {
        let target = ctx.target();
        info!(target: target, "processing {name} ({} games)", games.len());
        fs::create_dir_all(&self.output_dir)
            .map_err(|err| ArtifactError::io(&self.output_dir, err))?;
        let mut writers = PartitionWriters::create(&self.output_dir, name)?;
        let mut summary = CorpusSummary::default();
        let mut previous = self.start_state.clone();

        for (position, &game) in games.iter().enumerate() {
            if self.stop_requested() {
                summary.not_started = games.len() - position;
                warn!(
                    target: target,
                    "[{name}] stop requested, {} games not processed",
                    summary.not_started
                );
                break;
            }
            let Some(&pages) = page_counts.get(game) else {
                warn!(target: target, "[{name}] game {game} is not in the link index");
                summary.unknown_games += 1;
                ctx.record_failure();
                continue;
            };
            if self.baseline_reset == BaselineReset::PerGame {
                previous = self.start_state.clone();
            }

            for page in 0..pages {
                if self.baseline_reset == BaselineReset::PerPage {
                    previous = self.start_state.clone();
                }
                let path = self
                    .records_dir
                    .join(format!("{}.json", artifact_stem(game, page)));
                let records: Vec<MoveRecord> = match artifact::read_json(&path) {
                    Ok(records) => records,
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        error!(target: target, "file {} not found", path.display());
                        summary.missing_pages += 1;
                        ctx.record_failure();
                        break;
                    }
                    Err(err) if err.kind() == ErrorKind::Malformed => {
                        error!(target: target, "{err}");
                        summary.malformed_pages += 1;
                        ctx.record_failure();
                        break;
                    }
                    Err(err) => return Err(err),
                };

                for record in &records {
                    let line = CorpusRecord::from_move(&previous, record, self.state_encoding);
                    writers.append(&line)?;
                    summary.multi_records += 1;
                    if line.is_single_ply() {
                        summary.single_records += 1;
                    }
                    previous = record.board.clone();
                }
                summary.pages += 1;
                ctx.record_success();
            }
        }

        writers.finish()?;
        info!(
            target: target,
            "processed {name}: {} multi, {} single",
            summary.multi_records,
            summary.single_records
        );
        Ok(summary)
    }
}
