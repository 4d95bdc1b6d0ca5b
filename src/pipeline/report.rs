use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Per-board lifecycle. `Failed` is reachable from every other state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardState {
    Pending,
    Crawling,
    Reconciling,
    Downloading,
    Labeling,
    Done,
    Failed(String),
}

impl fmt::Display for BoardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardState::Pending => f.write_str("pending"),
            BoardState::Crawling => f.write_str("crawling"),
            BoardState::Reconciling => f.write_str("reconciling"),
            BoardState::Downloading => f.write_str("downloading"),
            BoardState::Labeling => f.write_str("labeling"),
            BoardState::Done => f.write_str("done"),
            BoardState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardOutcome {
    pub url: String,
    pub state: BoardState,
    pub pins_seen: usize,
    pub error: Option<String>,
}

impl BoardOutcome {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: BoardState::Pending,
            pins_seen: 0,
            error: None,
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.error = Some(reason.clone());
        self.state = BoardState::Failed(reason);
    }
}

/// Counts contributed by one board.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardTally {
    pub pins_new: usize,
    pub pins_skipped: usize,
    pub images_downloaded: usize,
    pub images_failed: usize,
    pub labels_generated: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl BoardTally {
    /// Add counts gathered for the same board by a later stage.
    pub fn merge(&mut self, other: BoardTally) {
        self.pins_new += other.pins_new;
        self.pins_skipped += other.pins_skipped;
        self.images_downloaded += other.images_downloaded;
        self.images_failed += other.images_failed;
        self.labels_generated += other.labels_generated;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// The externally visible summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub boards_processed: usize,
    pub boards_failed: usize,
    pub pins_new: usize,
    pub pins_skipped: usize,
    pub images_downloaded: usize,
    pub images_failed: usize,
    pub labels_generated: usize,
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub fatal: Option<String>,
    #[serde(default)]
    pub boards: Vec<BoardOutcome>,
}

impl RunReport {
    pub fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            boards_processed: 0,
            boards_failed: 0,
            pins_new: 0,
            pins_skipped: 0,
            images_downloaded: 0,
            images_failed: 0,
            labels_generated: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            cancelled: false,
            fatal: None,
            boards: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    /// Fold one board's outcome and counts into the run totals.
    pub fn absorb(&mut self, outcome: BoardOutcome, tally: BoardTally) {
        match outcome.state {
            BoardState::Done => self.boards_processed += 1,
            BoardState::Failed(_) => self.boards_failed += 1,
            _ => {}
        }
        self.pins_new += tally.pins_new;
        self.pins_skipped += tally.pins_skipped;
        self.images_downloaded += tally.images_downloaded;
        self.images_failed += tally.images_failed;
        self.labels_generated += tally.labels_generated;
        self.errors.extend(tally.errors);
        self.warnings.extend(tally.warnings);
        self.boards.push(outcome);
    }

    pub fn board(&self, url: &str) -> Option<&BoardOutcome> {
        self.boards.iter().find(|b| b.url == url)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {}", self.run_id)?;
        writeln!(f, "  started:    {}", self.started_at.to_rfc3339())?;
        if let Some(end) = self.ended_at {
            writeln!(f, "  ended:      {}", end.to_rfc3339())?;
        }
        writeln!(
            f,
            "  boards:     {} processed, {} failed",
            self.boards_processed, self.boards_failed
        )?;
        writeln!(f, "  pins:       {} new, {} skipped", self.pins_new, self.pins_skipped)?;
        writeln!(
            f,
            "  images:     {} downloaded, {} failed",
            self.images_downloaded, self.images_failed
        )?;
        writeln!(f, "  labels:     {} generated", self.labels_generated)?;
        if self.cancelled {
            writeln!(f, "  cancelled before completion")?;
        }
        if let Some(fatal) = &self.fatal {
            writeln!(f, "  FATAL: {}", fatal)?;
        }
        for board in &self.boards {
            writeln!(f, "  - {} [{}] {} pins", board.url, board.state, board.pins_seen)?;
        }
        for error in &self.errors {
            writeln!(f, "  error: {}", error)?;
        }
        for warning in &self.warnings {
            writeln!(f, "  warning: {}", warning)?;
        }
        Ok(())
    }
}
