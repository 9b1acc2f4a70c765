//! Raw annotation pages to per-move records.
//!
//! Each raw page holds one `table.dialog` whose rows pair a move cell with a
//! commentary cell. A row is a move row when it has exactly two direct `td`
//! children and contains a `div.cdiag_frame` board diagram. Matching rows
//! come in pairs (the outer row and its nested continuation), so only
//! even-numbered matches are kept.
//!
//! Documents are independent; a pool of worker threads parses them while
//! the calling thread owns the error log.

use crossbeam_channel::bounded;
use log::{debug, error, info, warn};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use unicode_normalization::UnicodeNormalization;

use crate::artifact::{self, ArtifactError};
use crate::board::{BoardSnapshot, Piece, BOARD_SQUARES};
use crate::config::PipelineConfig;
use crate::context::StageContext;
use crate::html::style_px;

/// One half-move as shown on the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    /// Move list text, ASCII only.
    #[serde(rename = "moves")]
    pub move_text: String,
    /// Board after the move.
    pub board: BoardSnapshot,
    /// Annotator commentary.
    pub comment: String,
}

/// What happened to a single document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    /// Records were written; carries the record count.
    Written(usize),
    /// A record file already existed.
    Skipped,
}

/// Totals for one extraction run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Raw documents seen.
    pub documents: usize,
    /// Record files written.
    pub written: usize,
    /// Documents with existing output.
    pub skipped: usize,
    /// Documents left untouched because a stop was requested.
    pub not_started: usize,
    /// Documents that failed; see the error log.
    pub failed: usize,
    /// Move records written across all documents.
    pub moves: usize,
}

/// Errors that prevent a document from producing records.
#[derive(Debug)]
pub enum ExtractError {
    /// The raw document could not be read.
    Read {
        /// Raw document path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// A required element is absent.
    Missing(&'static str),
    /// The diagram did not hold one positioned cell per square.
    BoardSize {
        /// Positioned cells found.
        found: usize,
    },
    /// A piece image lacked readable sprite offsets.
    Sprite {
        /// Square holding the image.
        square: String,
    },
    /// Writing the record file failed.
    Artifact(ArtifactError),
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "cannot read {}: {source}", path.display()),
            Self::Missing(what) => write!(f, "no {what} in document"),
            Self::BoardSize { found } => {
                write!(f, "diagram has {found} positioned cells, expected {BOARD_SQUARES}")
            }
            Self::Sprite { square } => write!(f, "piece image on {square} has no sprite offsets"),
            Self::Artifact(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ExtractError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Artifact(err) => Some(err),
            Self::Missing(_) | Self::BoardSize { .. } | Self::Sprite { .. } => None,
        }
    }
}

impl From<ArtifactError> for ExtractError {
    fn from(err: ArtifactError) -> Self {
        Self::Artifact(err)
    }
}

struct Selectors {
    dialog: Selector,
    row: Selector,
    cell: Selector,
    frame: Selector,
    board: Selector,
    image: Selector,
}

impl Selectors {
    fn new() -> Self {
        Self {
            dialog: Selector::parse("table.dialog").expect("dialog selector"),
            row: Selector::parse("tr").expect("row selector"),
            cell: Selector::parse("td").expect("cell selector"),
            frame: Selector::parse("div.cdiag_frame").expect("frame selector"),
            board: Selector::parse("div#board").expect("board selector"),
            image: Selector::parse("img").expect("image selector"),
        }
    }

    fn direct_cells<'a>(&self, row: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        row.children()
            .filter_map(ElementRef::wrap)
            .filter(|child| self.cell.matches(child))
            .collect()
    }
}

/// Parses one annotation page into its move records.
pub fn parse_document(html: &str) -> Result<Vec<MoveRecord>, ExtractError> {
    parse_with(&Selectors::new(), html)
}

fn parse_with(selectors: &Selectors, html: &str) -> Result<Vec<MoveRecord>, ExtractError> {
    let document = Html::parse_document(html);
    let dialog = document
        .select(&selectors.dialog)
        .next()
        .ok_or(ExtractError::Missing("table.dialog"))?;

    let rows = dialog.select(&selectors.row).filter(|row| {
        selectors.direct_cells(*row).len() == 2 && row.select(&selectors.frame).next().is_some()
    });

    let mut records = Vec::new();
    for (position, row) in rows.enumerate() {
        if position % 2 == 1 {
            continue;
        }
        let cells = selectors.direct_cells(row);
        let move_text = normalize_move_text(&cells[0].text().collect::<String>());
        let board = board_snapshot(selectors, row)?;
        let comment = collapse_whitespace(&cells[1].text().collect::<String>());
        records.push(MoveRecord {
            move_text,
            board,
            comment,
        });
    }
    Ok(records)
}

/// NFKD-decomposes, drops non-ASCII, and cuts at an inline comment marker.
fn normalize_move_text(raw: &str) -> String {
    let ascii: String = raw.nfkd().filter(char::is_ascii).collect();
    let visible = match ascii.split_once("<!--") {
        Some((head, _)) => head,
        None => ascii.as_str(),
    };
    visible.trim().to_string()
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn board_snapshot(selectors: &Selectors, row: ElementRef<'_>) -> Result<BoardSnapshot, ExtractError> {
    let frame = row
        .select(&selectors.frame)
        .next()
        .ok_or(ExtractError::Missing("div.cdiag_frame"))?;
    let board = frame
        .select(&selectors.board)
        .next()
        .ok_or(ExtractError::Missing("div#board"))?;

    let mut occupants = Vec::with_capacity(BOARD_SQUARES);
    let positioned = board
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|child| child.value().name() == "div")
        .filter(|child| {
            let style = child.value().attr("style").unwrap_or_default();
            style_px(style, "left").is_some() && style_px(style, "top").is_some()
        });
    for (index, square) in positioned.enumerate() {
        let piece = match square.select(&selectors.image).next() {
            None => None,
            Some(image) => {
                let style = image.value().attr("style").unwrap_or_default();
                match (style_px(style, "left"), style_px(style, "top")) {
                    (Some(left), Some(top)) => Some(Piece::from_sprite_offset(left, top)),
                    _ => {
                        return Err(ExtractError::Sprite {
                            square: BoardSnapshot::square_name(index),
                        })
                    }
                }
            }
        };
        occupants.push(piece);
    }

    if occupants.len() != BOARD_SQUARES {
        return Err(ExtractError::BoardSize {
            found: occupants.len(),
        });
    }
    Ok(BoardSnapshot::from_fn(|index| occupants[index]))
}

/// Parallel extractor over a directory of raw pages.
#[derive(Debug, Clone)]
pub struct RecordExtractor {
    raw_dir: PathBuf,
    records_dir: PathBuf,
    error_log: PathBuf,
    workers: usize,
    stop: Arc<AtomicBool>,
}

impl RecordExtractor {
    /// Reads pages from `raw_dir` and writes records into `records_dir`.
    pub fn new(
        raw_dir: impl Into<PathBuf>,
        records_dir: impl Into<PathBuf>,
        error_log: impl Into<PathBuf>,
        workers: usize,
    ) -> Self {
        Self {
            raw_dir: raw_dir.into(),
            records_dir: records_dir.into(),
            error_log: error_log.into(),
            workers: workers.max(1),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares a stop flag; once set, no further documents are handed to workers.
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Extractor using the configured directories and worker count.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let workers = config.extract_workers.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        });
        Self::new(
            &config.raw_dir,
            &config.records_dir,
            &config.parse_error_path,
            workers,
        )
    }

    /// Record file for a raw page: same stem, `.json` extension.
    pub fn output_path(&self, raw: &Path) -> PathBuf {
        let stem = raw.file_stem().unwrap_or(raw.as_os_str());
        let mut name = stem.to_os_string();
        name.push(".json");
        self.records_dir.join(name)
    }

    /// Raw `.html` pages in name order.
    pub fn documents(&self) -> Result<Vec<PathBuf>, ArtifactError> {
        let entries = match fs::read_dir(&self.raw_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ArtifactError::io(&self.raw_dir, err)),
        };
        let mut documents = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| ArtifactError::io(&self.raw_dir, err))?.path();
            if path.extension().is_some_and(|ext| ext == "html") {
                documents.push(path);
            }
        }
        documents.sort();
        Ok(documents)
    }

    /// Extracts one raw page. Existing output short-circuits to [`ExtractOutcome::Skipped`].
    pub fn extract(&self, raw: &Path) -> Result<ExtractOutcome, ExtractError> {
        self.extract_with(&Selectors::new(), raw)
    }

    fn extract_with(&self, selectors: &Selectors, raw: &Path) -> Result<ExtractOutcome, ExtractError> {
        let output = self.output_path(raw);
        if output.exists() {
            return Ok(ExtractOutcome::Skipped);
        }
        let html = fs::read_to_string(raw).map_err(|source| ExtractError::Read {
            path: raw.to_path_buf(),
            source,
        })?;
        let records = parse_with(selectors, &html)?;
        artifact::write_json(&output, &records)?;
        Ok(ExtractOutcome::Written(records.len()))
    }

    /// Extracts every raw page across the worker pool.
    ///
    /// Per-document failures are appended to the error log as
    /// `{file}: {error}` lines and do not stop the run. Only a failure to
    /// open or write the log itself is returned.
    pub fn run(&self, ctx: &StageContext) -> Result<ExtractSummary, ArtifactError> {
        let target = ctx.target();
        let documents = self.documents()?;
        let workers = self.workers.min(documents.len()).max(1);
        info!(
            target: target,
            "extracting {} documents with {workers} workers",
            documents.len()
        );

        if let Some(parent) = self.error_log.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| ArtifactError::io(parent, err))?;
            }
        }
        let log_file =
            File::create(&self.error_log).map_err(|err| ArtifactError::io(&self.error_log, err))?;
        let mut log = BufWriter::new(log_file);
        let mut summary = ExtractSummary {
            documents: documents.len(),
            ..ExtractSummary::default()
        };

        let (job_tx, job_rx) = bounded::<PathBuf>(workers * 2);
        let (result_tx, result_rx) =
            bounded::<(PathBuf, Result<ExtractOutcome, ExtractError>)>(workers * 2);

        thread::scope(|scope| -> Result<(), ArtifactError> {
            for _ in 0..workers {
                let jobs = job_rx.clone();
                let results = result_tx.clone();
                scope.spawn(move || {
                    let selectors = Selectors::new();
                    for path in jobs {
                        let outcome = self.extract_with(&selectors, &path);
                        if results.send((path, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(result_tx);

            let stop = &self.stop;
            let feeder = scope.spawn(move || {
                let mut sent = 0usize;
                for path in documents {
                    if stop.load(Ordering::Acquire) || job_tx.send(path).is_err() {
                        break;
                    }
                    sent += 1;
                }
                sent
            });

            for (path, outcome) in result_rx {
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match outcome {
                    Ok(ExtractOutcome::Written(moves)) => {
                        debug!(target: target, "processed {name}: {moves} moves");
                        summary.written += 1;
                        summary.moves += moves;
                        ctx.record_success();
                    }
                    Ok(ExtractOutcome::Skipped) => {
                        summary.skipped += 1;
                        ctx.record_skip();
                    }
                    Err(err) => {
                        error!(target: target, "error processing file {name}: {err}");
                        writeln!(log, "{name}: {err}")
                            .map_err(|err| ArtifactError::io(&self.error_log, err))?;
                        summary.failed += 1;
                        ctx.record_failure();
                    }
                }
            }
            let sent = feeder.join().unwrap_or(0);
            summary.not_started = summary.documents.saturating_sub(sent);
            Ok(())
        })?;

        if summary.not_started > 0 {
            warn!(
                target: target,
                "stop requested, {} documents were not started",
                summary.not_started
            );
        }

        log.flush()
            .map_err(|err| ArtifactError::io(&self.error_log, err))?;
        Ok(summary)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{page, ply};
    use super::*;
    use crate::board::{Color, PieceKind};

    const E4: usize = 35;

    #[test]
    fn keeps_outer_rows_and_decodes_boards() {
        let html = page(&[
            ply("1.\u{a0}e4", &[(E4, 0, -150)], "King's pawn."),
            ply("1... e5 &lt;!-- hidden", &[(E4, 0, -150), (36, -30, -150)], "  Symmetric\n reply "),
        ]);
        let records = parse_document(&html).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].move_text, "1. e4");
        assert_eq!(records[0].comment, "King's pawn.");
        assert_eq!(records[1].move_text, "1... e5");
        assert_eq!(records[1].comment, "Symmetric reply");

        let board = &records[1].board;
        assert_eq!(board.cells().len(), BOARD_SQUARES);
        assert_eq!(
            board.cell("e5").and_then(|cell| cell.piece),
            Some(Piece::new(Color::Black, PieceKind::Pawn))
        );
        assert_eq!(board.cell("e2").and_then(|cell| cell.piece), None);
    }

    #[test]
    fn page_without_dialog_is_an_error() {
        let err = parse_document("<html><body><p>gone</p></body></html>").unwrap_err();
        assert!(matches!(err, ExtractError::Missing("table.dialog")));
    }

    #[test]
    fn short_board_is_rejected() {
        let html = page(&[ply("1. e4", &[], "x")]).replacen(
            r#"<div style="position: absolute; left: 0px; top: 210px;"></div>"#,
            "",
            1,
        );
        assert!(matches!(
            parse_document(&html),
            Err(ExtractError::BoardSize { found: 63 })
        ));
    }

    #[test]
    fn normalizes_move_text_to_ascii() {
        assert_eq!(normalize_move_text(" 12.\u{a0}Nf3\u{2026} "), "12. Nf3...");
        assert_eq!(normalize_move_text("Qh5 <!-- aside -->"), "Qh5");
    }

    #[test]
    fn stop_flag_prevents_new_documents() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        fs::create_dir_all(&raw).unwrap();
        for game in 0..3 {
            let html = page(&[ply("1. e4", &[(E4, 0, -150)], "ok")]);
            fs::write(raw.join(format!("saved{game}_0.html")), html).unwrap();
        }

        let stop = Arc::new(AtomicBool::new(true));
        let extractor = RecordExtractor::new(
            &raw,
            dir.path().join("records"),
            dir.path().join("errors.txt"),
            2,
        )
        .with_stop(Arc::clone(&stop));
        let summary = extractor.run(&StageContext::begin("extract")).unwrap();
        assert_eq!(summary.written, 0);
        assert_eq!(summary.not_started, 3);
        assert!(!dir.path().join("records").exists());

        stop.store(false, Ordering::Release);
        let summary = extractor.run(&StageContext::begin("extract")).unwrap();
        assert_eq!(summary.written, 3);
        assert_eq!(summary.not_started, 0);
    }

    #[test]
    fn run_skips_existing_output_and_logs_failures() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        fs::create_dir_all(&raw).unwrap();
        fs::write(raw.join("saved0_0.html"), page(&[ply("1. e4", &[(E4, 0, -150)], "ok")])).unwrap();
        fs::write(raw.join("saved1_0.html"), "<html><body>nothing</body></html>").unwrap();
        fs::write(raw.join("progress.json"), "{}").unwrap();

        let extractor = RecordExtractor::new(
            &raw,
            dir.path().join("records"),
            dir.path().join("errors.txt"),
            2,
        );
        let ctx = StageContext::begin("extract");
        let summary = extractor.run(&ctx).unwrap();
        assert_eq!(summary.documents, 2);
        assert_eq!(summary.written, 1);
        assert_eq!(summary.failed, 1);
        let log = fs::read_to_string(dir.path().join("errors.txt")).unwrap();
        assert!(log.starts_with("saved1_0.html: "));

        let records: Vec<MoveRecord> =
            artifact::read_json(&dir.path().join("records/saved0_0.json")).unwrap();
        assert_eq!(records[0].move_text, "1. e4");

        fs::remove_file(raw.join("saved1_0.html")).unwrap();
        let ctx = StageContext::begin("extract");
        let summary = extractor.run(&ctx).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert!(fs::read_to_string(dir.path().join("errors.txt")).unwrap().is_empty());
    }
}
