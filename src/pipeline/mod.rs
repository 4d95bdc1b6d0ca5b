//! Per-board orchestration: crawl, reconcile, download, label.
//!
//! Boards run on up to `max_sessions` scoped threads, each holding one
//! browser session. Download work for a board fans out over a shared rayon
//! pool. Labeling is handed over a channel to a single label worker with its
//! own pool, so a quota pause stalls only the label stage. Every pool worker
//! opens its own store connection.

pub mod report;

use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::{sleep_unless_stopped, Clock, SystemClock};
use crate::config::{BoardSource, Config, Credentials, Limits};
use crate::crawler::{human_delay, scrape, CrawlPolicy, PinRecord, SessionFactory, WebDriverFactory};
use crate::db::{ImageRecord, Pin, Store};
use crate::download::{DownloadManager, DownloadOutcome, UreqFetcher};
use crate::error::{StoreError, StoreResult};
use crate::labels::{create_provider, LabelClient, LabelOutcome};
use crate::reconcile::{reconcile, Decision};

pub use report::{BoardOutcome, BoardState, BoardTally, RunReport};

pub struct Pipeline {
    db_path: PathBuf,
    sessions: Arc<dyn SessionFactory>,
    downloader: DownloadManager,
    labeler: Option<LabelClient>,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
    credentials: Option<Credentials>,
}

/// Raised when the store cannot be written at all.
struct Fatal(String);

impl From<StoreError> for Fatal {
    fn from(err: StoreError) -> Self {
        Fatal(err.to_string())
    }
}

fn open_worker_store(path: &Path) -> StoreResult<Store> {
    Store::open(path)
}

fn build_pool(name: &'static str, threads: usize) -> Result<rayon::ThreadPool, rayon::ThreadPoolBuildError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("{}-{}", name, i))
        .build()
}

/// Images of one board waiting for labels.
struct LabelJob {
    slot: usize,
    candidates: Vec<(Pin, ImageRecord)>,
}

/// Shared between crawler threads and the label worker for one run.
struct RunState {
    /// Outcome and counts per board, in configured order.
    slots: Mutex<Vec<Option<(BoardOutcome, BoardTally)>>>,
    fatal: Mutex<Option<String>>,
    aborted: AtomicBool,
}

impl RunState {
    fn new(boards: usize) -> Self {
        Self {
            slots: Mutex::new((0..boards).map(|_| None).collect()),
            fatal: Mutex::new(None),
            aborted: AtomicBool::new(false),
        }
    }

    fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Record the first fatal reason and stop starting new work.
    fn abort(&self, reason: String) {
        self.aborted.store(true, Ordering::SeqCst);
        lock(&self.fatal).get_or_insert(reason);
    }

    fn settle(&self, slot: usize, outcome: BoardOutcome, tally: BoardTally) {
        if let Some(entry) = lock(&self.slots).get_mut(slot) {
            *entry = Some((outcome, tally));
        }
    }
}

impl Pipeline {
    pub fn new(
        db_path: &Path,
        sessions: Arc<dyn SessionFactory>,
        downloader: DownloadManager,
        labeler: Option<LabelClient>,
        clock: Arc<dyn Clock>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
            sessions,
            downloader,
            labeler,
            clock,
            stop,
            credentials: None,
        }
    }

    /// Wire the production adapters: WebDriver browser sessions, HTTP
    /// downloads and the configured vision provider.
    pub fn from_config(config: &Config, limits: &Limits, stop: Arc<AtomicBool>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let sessions = Arc::new(WebDriverFactory::new(
            &config.crawler.webdriver_url,
            limits.headless,
            clock.clone(),
            stop.clone(),
        ));
        let fetcher = Arc::new(UreqFetcher::new(
            Duration::from_secs(config.download.timeout_secs),
            &config.download.user_agent,
        ));
        let downloader = DownloadManager::new(fetcher, clock.clone(), &config.storage.download_dir, limits);

        let labeler = if config.labeling.enabled {
            match create_provider(&config.labeling) {
                Ok(provider) => {
                    info!(provider = provider.provider_name(), model = %config.labeling.model, "Labeling enabled");
                    Some(LabelClient::new(
                        Arc::from(provider),
                        clock.clone(),
                        limits,
                        config.labeling.custom_prompt.clone(),
                    ))
                }
                Err(e) => {
                    warn!(error = %e, "Labeling disabled");
                    None
                }
            }
        } else {
            None
        };

        Self::new(
            &config.database.sqlite_path,
            sessions,
            downloader,
            labeler,
            clock,
            stop,
        )
        .with_credentials(config.crawler.credentials.clone())
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run every board and return the report. The report is produced and
    /// persisted (when the store allows) even after a fatal condition.
    pub fn run(&self, boards: &[BoardSource], limits: &Limits) -> RunReport {
        let mut report = RunReport::start();
        info!(run_id = %report.run_id, boards = boards.len(), "Starting run");

        let store = match Store::open_initialized(&self.db_path) {
            Ok(store) => store,
            Err(e) => {
                error!(error = %e, "Store unavailable, aborting run");
                report.fatal = Some(e.to_string());
                report.finish();
                return report;
            }
        };

        let pools = build_pool("pinharvest-worker", limits.workers).and_then(|downloads| {
            let labels = build_pool("pinharvest-label", limits.workers)?;
            Ok((downloads, labels))
        });
        let (pool, label_pool) = match pools {
            Ok(pools) => pools,
            Err(e) => {
                report.fatal = Some(format!("failed to start worker pool: {}", e));
                report.finish();
                self.persist(&store, &report);
                return report;
            }
        };

        let state = RunState::new(boards.len());
        let next = AtomicUsize::new(0);
        let crawlers = limits.max_sessions.min(boards.len()).max(1);
        let (label_tx, label_rx) = mpsc::channel::<LabelJob>();

        std::thread::scope(|scope| {
            let (state, next, pool, label_pool) = (&state, &next, &pool, &label_pool);

            if let Some(labeler) = &self.labeler {
                scope.spawn(move || {
                    for job in label_rx {
                        self.label_board(labeler, job, label_pool, state);
                    }
                    debug!("Label queue drained");
                });
            }

            for _ in 0..crawlers {
                let label_tx = label_tx.clone();
                scope.spawn(move || {
                    let mut first = true;
                    loop {
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        let Some(board) = boards.get(idx) else { break };

                        if !first && !self.stopped() && !state.aborted() {
                            let pause = human_delay(&limits.board_delay_range);
                            sleep_unless_stopped(self.clock.as_ref(), pause, &self.stop);
                        }
                        first = false;

                        let mut outcome = BoardOutcome::new(&board.url);
                        let mut tally = BoardTally::default();
                        if self.stopped() || state.aborted() {
                            state.settle(idx, outcome, tally);
                            continue;
                        }

                        match self.process_board(board, limits, pool, &mut outcome, &mut tally) {
                            Ok(Some(candidates)) => {
                                state.settle(idx, outcome, tally);
                                let job = LabelJob {
                                    slot: idx,
                                    candidates,
                                };
                                if label_tx.send(job).is_err() {
                                    warn!(board = %board.url, "Label worker gone, board left unlabeled");
                                }
                            }
                            Ok(None) => state.settle(idx, outcome, tally),
                            Err(Fatal(reason)) => {
                                error!(board = %board.url, error = %reason, "Store unavailable, aborting run");
                                outcome.fail(format!("store unavailable: {}", reason));
                                state.abort(reason);
                                state.settle(idx, outcome, tally);
                            }
                        }
                    }
                });
            }
            // The label worker exits once every crawler has dropped its sender.
            drop(label_tx);
        });

        let RunState { slots, fatal, .. } = state;
        let slots = slots.into_inner().unwrap_or_else(PoisonError::into_inner);
        for (board, slot) in boards.iter().zip(slots) {
            let (outcome, tally) =
                slot.unwrap_or_else(|| (BoardOutcome::new(&board.url), BoardTally::default()));
            report.absorb(outcome, tally);
        }
        report.fatal = fatal.into_inner().unwrap_or_else(PoisonError::into_inner);

        if let Some(labeler) = &self.labeler {
            let pauses = labeler.quota_pauses();
            if pauses > 0 {
                report.warnings.push(format!(
                    "label quota exhausted {} time(s); labeling paused until the window reset",
                    pauses
                ));
            }
            if let Some(reason) = labeler.disabled_reason() {
                report
                    .errors
                    .push(format!("labeling disabled for this run: {}", reason));
            }
        }
        report.cancelled = self.stopped();
        report.finish();
        self.persist(&store, &report);

        info!(
            run_id = %report.run_id,
            processed = report.boards_processed,
            failed = report.boards_failed,
            pins_new = report.pins_new,
            images = report.images_downloaded,
            labels = report.labels_generated,
            "Run finished"
        );
        report
    }

    fn persist(&self, store: &Store, report: &RunReport) {
        if let Err(e) = store.insert_run_report(report) {
            error!(run_id = %report.run_id, error = %e, "Failed to persist run report");
        }
    }

    fn enter(&self, outcome: &mut BoardOutcome, state: BoardState) {
        debug!(board = %outcome.url, from = %outcome.state, to = %state, "Board state");
        outcome.state = state;
    }

    fn board_done(&self, outcome: &mut BoardOutcome, tally: &BoardTally) {
        self.enter(outcome, BoardState::Done);
        info!(
            board = %outcome.url,
            pins = outcome.pins_seen,
            new = tally.pins_new,
            downloaded = tally.images_downloaded,
            labeled = tally.labels_generated,
            "Board done"
        );
    }

    /// Crawl, reconcile and download one board. Returns the images still
    /// needing labels when the board has to wait on the label worker.
    fn process_board(
        &self,
        board: &BoardSource,
        limits: &Limits,
        pool: &rayon::ThreadPool,
        outcome: &mut BoardOutcome,
        tally: &mut BoardTally,
    ) -> Result<Option<Vec<(Pin, ImageRecord)>>, Fatal> {
        let mut store = Store::open(&self.db_path)?;
        let db_board = store.upsert_board(&board.url, &board.display_name())?;
        info!(board = %board.url, "Processing board");

        // Crawling
        self.enter(outcome, BoardState::Crawling);
        let (records, crawl_error) = match self.crawl(board, limits) {
            Ok(result) => result,
            Err(reason) => {
                tally.errors.push(format!("{}: {}", board.url, reason));
                outcome.fail(reason);
                return Ok(None);
            }
        };
        outcome.pins_seen = records.len();

        // Reconciling. Partial results of a failed crawl are still recorded.
        self.enter(outcome, BoardState::Reconciling);
        let mut queue: Vec<Pin> = Vec::new();
        for record in &records {
            match reconcile(&mut store, db_board.id, record) {
                Ok((Decision::Create, pin)) => {
                    tally.pins_new += 1;
                    queue.push(pin);
                }
                Ok((Decision::RequeueDownload, pin)) => queue.push(pin),
                Ok((Decision::SkipSeen, _)) => tally.pins_skipped += 1,
                Err(StoreError::Constraint(e)) => {
                    error!(board = %board.url, pin = %record.pin_id, error = %e, "Store invariant violated, skipping pin");
                    tally.errors.push(format!("{}: pin {} skipped: {}", board.url, record.pin_id, e));
                }
                Err(e) => return Err(e.into()),
            }
        }
        store.mark_board_crawled(db_board.id)?;

        if let Some(err) = crawl_error {
            warn!(board = %board.url, error = %err, pins = records.len(), "Board failed");
            tally.errors.push(format!("{}: {}", board.url, err));
            outcome.fail(err.to_string());
            return Ok(None);
        }
        if self.stopped() {
            return Ok(None);
        }

        // Downloading
        self.enter(outcome, BoardState::Downloading);
        self.download_all(&queue, pool, tally)?;
        if self.stopped() {
            return Ok(None);
        }

        // Labeling happens on the label worker so quota pauses never hold
        // up the next board.
        self.enter(outcome, BoardState::Labeling);
        if let Some(labeler) = self.labeler.as_ref().filter(|l| !l.is_disabled()) {
            let candidates = store.pins_needing_label(db_board.id)?;
            if !candidates.is_empty() {
                debug!(board = %board.url, pending = candidates.len(), provider = labeler.provider_name(), "Queued for labeling");
                return Ok(Some(candidates));
            }
        }

        self.board_done(outcome, tally);
        Ok(None)
    }

    /// Label one board's images on the label pool, then settle its outcome.
    fn label_board(&self, labeler: &LabelClient, job: LabelJob, pool: &rayon::ThreadPool, state: &RunState) {
        let mut labels = BoardTally::default();
        let result = if state.aborted() {
            Ok(())
        } else {
            self.label_all(labeler, job.candidates, pool, &mut labels)
        };

        let mut slots = lock(&state.slots);
        let Some((outcome, tally)) = slots.get_mut(job.slot).and_then(Option::as_mut) else {
            return;
        };
        tally.merge(labels);
        match result {
            Err(Fatal(reason)) => {
                error!(board = %outcome.url, error = %reason, "Store unavailable, aborting run");
                outcome.fail(format!("store unavailable: {}", reason));
                state.abort(reason);
            }
            // Left in `Labeling`: neither processed nor failed.
            Ok(()) if self.stopped() || state.aborted() => {}
            Ok(()) => self.board_done(outcome, tally),
        }
    }

    /// Drain the crawl stream. A terminal crawl error is returned alongside
    /// the records gathered before it.
    fn crawl(
        &self,
        board: &BoardSource,
        limits: &Limits,
    ) -> Result<(Vec<PinRecord>, Option<crate::error::CrawlError>), String> {
        let mut session = self
            .sessions
            .open()
            .map_err(|e| format!("browser session unavailable: {:#}", e))?;
        let policy = CrawlPolicy::from_limits(limits, self.credentials.clone());
        let mut stream = scrape(
            session.as_mut(),
            &board.url,
            &policy,
            self.clock.as_ref(),
            &self.stop,
        );

        let mut records = Vec::new();
        let mut failure = None;
        for item in stream.by_ref() {
            match item {
                Ok(record) => records.push(record),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        debug!(board = %board.url, reason = ?stream.stop_reason(), scrolls = stream.scrolls(), "Crawl stream drained");
        Ok((records, failure))
    }

    fn download_all(&self, queue: &[Pin], pool: &rayon::ThreadPool, tally: &mut BoardTally) -> Result<(), Fatal> {
        let db_path = self.db_path.as_path();
        let stop = self.stop.as_ref();
        let results: Vec<(&Pin, StoreResult<Option<DownloadOutcome>>)> = pool.install(|| {
            queue
                .par_iter()
                .map_init(
                    || open_worker_store(db_path),
                    |store, pin| {
                        if stop.load(Ordering::SeqCst) {
                            return (pin, Ok(None));
                        }
                        let result = match store {
                            Ok(store) => self.downloader.download(store, pin, stop).map(Some),
                            Err(e) => Err(StoreError::Unavailable(e.to_string())),
                        };
                        (pin, result)
                    },
                )
                .collect()
        });

        for (pin, result) in results {
            match result {
                Ok(Some(DownloadOutcome::Downloaded { .. })) => tally.images_downloaded += 1,
                Ok(Some(DownloadOutcome::Failed { attempts, reason })) => {
                    tally.images_failed += 1;
                    tally.warnings.push(format!(
                        "pin {} download failed after {} attempt(s): {}",
                        pin.pin_id, attempts, reason
                    ));
                }
                Ok(Some(DownloadOutcome::Interrupted)) | Ok(None) => {}
                Err(StoreError::Constraint(e)) => {
                    error!(pin = %pin.pin_id, error = %e, "Store invariant violated, skipping pin");
                    tally.errors.push(format!("pin {} skipped: {}", pin.pin_id, e));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn label_all(
        &self,
        labeler: &LabelClient,
        candidates: Vec<(Pin, ImageRecord)>,
        pool: &rayon::ThreadPool,
        tally: &mut BoardTally,
    ) -> Result<(), Fatal> {
        let db_path = self.db_path.as_path();
        let stop = self.stop.as_ref();
        let results: Vec<(&Pin, StoreResult<Option<LabelOutcome>>)> = pool.install(|| {
            candidates
                .par_iter()
                .map_init(
                    || open_worker_store(db_path),
                    |store, (pin, image)| {
                        if stop.load(Ordering::SeqCst) {
                            return (pin, Ok(None));
                        }
                        let result = match store {
                            Ok(store) => labeler.label_pin(store, pin, image, stop).map(Some),
                            Err(e) => Err(StoreError::Unavailable(e.to_string())),
                        };
                        (pin, result)
                    },
                )
                .collect()
        });

        for (pin, result) in results {
            match result {
                Ok(Some(LabelOutcome::Labeled { parsed })) => {
                    tally.labels_generated += 1;
                    if !parsed {
                        tally
                            .warnings
                            .push(format!("pin {}: vision response unparseable", pin.pin_id));
                    }
                }
                Ok(Some(LabelOutcome::Failed(reason))) => {
                    tally
                        .warnings
                        .push(format!("pin {} labeling failed: {}", pin.pin_id, reason));
                }
                Ok(_) => {}
                Err(StoreError::Constraint(e)) => {
                    error!(pin = %pin.pin_id, error = %e, "Store invariant violated, skipping pin");
                    tally.errors.push(format!("pin {} skipped: {}", pin.pin_id, e));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
