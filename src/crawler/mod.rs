//! Incremental board crawler.
//!
//! [`scrape`] returns a lazy, finite stream of [`PinRecord`]s. The stream is
//! not restartable: a retry always begins again from the top of the board
//! and the reconciler absorbs the duplicates.

pub mod session;
pub mod webdriver;

use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{sleep_unless_stopped, Clock};
use crate::config::{Credentials, Limits};
use crate::error::CrawlError;

pub use session::{BrowserSession, RawPin, SessionFactory};
pub use webdriver::{WebDriverFactory, WebDriverSession};

/// Pin metadata extracted from a board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinRecord {
    pub pin_id: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub image_url: String,
}

impl PinRecord {
    /// Validate a raw node. Nodes without a pin id or image are dropped.
    pub fn from_raw(raw: &RawPin) -> Option<Self> {
        let pin_id = raw
            .pin_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| raw.href.as_deref().and_then(pin_id_from_href))?;

        let image_url = raw
            .image_src
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(upgrade_image_url)?;

        let url = match raw.href.as_deref() {
            Some(href) if href.starts_with("http") => href.to_string(),
            Some(href) if href.starts_with('/') => format!("https://www.pinterest.com{}", href),
            _ => format!("https://www.pinterest.com/pin/{}/", pin_id),
        };

        Some(Self {
            pin_id,
            url,
            title: raw.alt.as_deref().unwrap_or_default().trim().to_string(),
            description: raw.description.as_deref().unwrap_or_default().trim().to_string(),
            image_url,
        })
    }
}

/// Extract `<id>` from a `/pin/<id>/` link.
fn pin_id_from_href(href: &str) -> Option<String> {
    let rest = href.split("/pin/").nth(1)?;
    let id = rest.split(['/', '?', '#']).next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Prefer the 736px rendition over grid-sized thumbnails.
fn upgrade_image_url(src: &str) -> String {
    src.replace("/236x/", "/736x/").replace("/474x/", "/736x/")
}

/// Per-board crawl knobs.
#[derive(Debug, Clone)]
pub struct CrawlPolicy {
    pub max_pins: usize,
    pub scroll_delay: RangeInclusive<Duration>,
    pub stall_limit: u32,
    pub max_scroll_retries: u32,
    pub credentials: Option<Credentials>,
}

impl CrawlPolicy {
    pub fn from_limits(limits: &Limits, credentials: Option<Credentials>) -> Self {
        Self {
            max_pins: limits.max_pins,
            scroll_delay: limits.scroll_delay_range.clone(),
            stall_limit: limits.stall_limit,
            max_scroll_retries: limits.max_scroll_retries,
            credentials,
        }
    }
}

/// A uniformly random delay within `range`.
pub fn human_delay(range: &RangeInclusive<Duration>) -> Duration {
    let min = range.start().as_millis() as u64;
    let max = range.end().as_millis() as u64;
    if max <= min {
        return Duration::from_millis(min);
    }
    Duration::from_millis(rand::rng().random_range(min..=max))
}

/// Why a stream ended without a terminal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxPins,
    Stalled,
    EndOfBoard,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Opening,
    Scrolling,
    Finishing(StopReason),
    Done,
}

pub struct PinStream<'a> {
    session: &'a mut dyn BrowserSession,
    clock: &'a dyn Clock,
    stop: &'a AtomicBool,
    policy: &'a CrawlPolicy,
    board_url: String,
    phase: Phase,
    seen: HashSet<String>,
    buffer: VecDeque<PinRecord>,
    emitted: usize,
    stalled_scrolls: u32,
    scrolls: u32,
    logged_in: bool,
    stop_reason: Option<StopReason>,
}

/// Start crawling `board_url` on `session`.
pub fn scrape<'a>(
    session: &'a mut dyn BrowserSession,
    board_url: &str,
    policy: &'a CrawlPolicy,
    clock: &'a dyn Clock,
    stop: &'a AtomicBool,
) -> PinStream<'a> {
    PinStream {
        session,
        clock,
        stop,
        policy,
        board_url: board_url.to_string(),
        phase: Phase::Opening,
        seen: HashSet::new(),
        buffer: VecDeque::new(),
        emitted: 0,
        stalled_scrolls: 0,
        scrolls: 0,
        logged_in: false,
        stop_reason: None,
    }
}

impl<'a> PinStream<'a> {
    /// Set once the stream has ended.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn scrolls(&self) -> u32 {
        self.scrolls
    }

    fn finish(&mut self, reason: StopReason) {
        if self.phase != Phase::Done {
            info!(
                board = %self.board_url,
                pins = self.emitted + self.buffer.len(),
                scrolls = self.scrolls,
                reason = ?reason,
                "Crawl finished"
            );
        }
        self.phase = Phase::Finishing(reason);
    }

    fn fail(&mut self, err: CrawlError) -> Option<Result<PinRecord, CrawlError>> {
        warn!(board = %self.board_url, error = %err, "Crawl aborted");
        self.phase = Phase::Done;
        self.stop_reason = Some(StopReason::Failed);
        self.buffer.clear();
        Some(Err(err))
    }

    /// Run `op` with in-place retries for transient errors.
    fn with_retries<T>(
        &mut self,
        what: &str,
        mut op: impl FnMut(&mut Self) -> Result<T, CrawlError>,
    ) -> Result<T, CrawlError> {
        let mut attempt = 0;
        loop {
            match op(self) {
                Ok(value) => return Ok(value),
                Err(CrawlError::Transient(msg)) => {
                    attempt += 1;
                    if attempt > self.policy.max_scroll_retries {
                        return Err(CrawlError::Exhausted {
                            attempts: attempt,
                            last: msg,
                        });
                    }
                    debug!(board = %self.board_url, step = what, attempt, error = %msg, "Retrying crawl step");
                    let pause = human_delay(&self.policy.scroll_delay);
                    if !sleep_unless_stopped(self.clock, pause, self.stop) {
                        return Err(CrawlError::Cancelled);
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Check page signals, then extract and buffer unseen pins.
    /// Returns how many new pins were buffered.
    fn harvest(&mut self) -> Result<usize, CrawlError> {
        if self.session.is_bot_challenge_present()? {
            return Err(CrawlError::BotDetected);
        }
        if self.session.is_auth_wall_present()? {
            self.handle_auth_wall()?;
        }

        let raw = self.session.extract_visible_pins()?;
        let room = self
            .policy
            .max_pins
            .saturating_sub(self.emitted + self.buffer.len());
        let mut added = 0;
        for record in raw.iter().filter_map(PinRecord::from_raw) {
            if added >= room {
                break;
            }
            if self.seen.insert(record.pin_id.clone()) {
                self.buffer.push_back(record);
                added += 1;
            }
        }
        Ok(added)
    }

    fn handle_auth_wall(&mut self) -> Result<(), CrawlError> {
        let credentials = match (&self.policy.credentials, self.logged_in) {
            (Some(c), false) => c.clone(),
            _ => return Err(CrawlError::AuthRequired),
        };
        info!(board = %self.board_url, "Login wall detected, switching to authenticated session");
        self.logged_in = true;
        if !self.session.login(&credentials)? {
            return Err(CrawlError::AuthRequired);
        }
        let url = self.board_url.clone();
        self.session.navigate(&url)?;
        if self.session.is_auth_wall_present()? {
            return Err(CrawlError::AuthRequired);
        }
        Ok(())
    }

    fn open(&mut self) -> Result<usize, CrawlError> {
        let url = self.board_url.clone();
        self.with_retries("navigate", |s| s.session.navigate(&url))?;
        self.with_retries("initial extract", |s| s.harvest())
    }

    fn scroll_step(&mut self) -> Result<usize, CrawlError> {
        self.with_retries("scroll", |s| {
            s.session.scroll()?;
            s.harvest()
        })
    }

    fn after_harvest(&mut self, added: usize) {
        if added == 0 {
            self.stalled_scrolls += 1;
        } else {
            self.stalled_scrolls = 0;
        }

        if self.emitted + self.buffer.len() >= self.policy.max_pins {
            self.finish(StopReason::MaxPins);
        } else if self.stalled_scrolls >= self.policy.stall_limit {
            self.finish(StopReason::Stalled);
        } else if matches!(self.session.is_end_of_board(), Ok(true)) {
            self.finish(StopReason::EndOfBoard);
        }
    }
}

impl<'a> Iterator for PinStream<'a> {
    type Item = Result<PinRecord, CrawlError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                self.emitted += 1;
                return Some(Ok(record));
            }

            match self.phase {
                Phase::Done => return None,
                Phase::Finishing(reason) => {
                    self.phase = Phase::Done;
                    self.stop_reason = Some(reason);
                    return None;
                }
                Phase::Opening | Phase::Scrolling if self.stop.load(Ordering::SeqCst) => {
                    self.finish(StopReason::Cancelled);
                }
                Phase::Opening => match self.open() {
                    Ok(added) => {
                        self.phase = Phase::Scrolling;
                        // The first screen never counts as a stall.
                        if added > 0 || self.policy.max_pins == 0 {
                            self.after_harvest(added);
                        }
                    }
                    Err(CrawlError::Cancelled) => self.finish(StopReason::Cancelled),
                    Err(e) => return self.fail(e),
                },
                Phase::Scrolling => {
                    let pause = human_delay(&self.policy.scroll_delay);
                    if !sleep_unless_stopped(self.clock, pause, self.stop) {
                        self.finish(StopReason::Cancelled);
                        continue;
                    }
                    self.scrolls += 1;
                    match self.scroll_step() {
                        Ok(added) => self.after_harvest(added),
                        Err(CrawlError::Cancelled) => self.finish(StopReason::Cancelled),
                        Err(e) => return self.fail(e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted browser session for tests.

    use super::*;
    use std::sync::{Arc, Mutex};

    /// What the fake page does on a given screen.
    #[derive(Debug, Clone)]
    pub enum Screen {
        Pins(Vec<RawPin>),
        Transient,
        AuthWall,
        BotChallenge,
    }

    pub fn raw(id: &str) -> RawPin {
        RawPin {
            pin_id: Some(id.to_string()),
            href: Some(format!("/pin/{}/", id)),
            image_src: Some(format!("https://i.example.com/236x/{}.jpg", id)),
            alt: Some(format!("Pin {}", id)),
            description: None,
        }
    }

    pub fn pins(ids: &[&str]) -> Screen {
        Screen::Pins(ids.iter().map(|id| raw(id)).collect())
    }

    /// Screens are consumed one per extraction; the last one repeats.
    pub struct FakeSession {
        pub screens: VecDeque<Screen>,
        current: Screen,
        pub end_after_screens: Option<usize>,
        pub login_works: bool,
        pub logged_in: bool,
        pub log: Arc<Mutex<Vec<String>>>,
        screens_shown: usize,
    }

    impl FakeSession {
        pub fn new(screens: Vec<Screen>) -> Self {
            Self {
                screens: screens.into(),
                current: Screen::Pins(Vec::new()),
                end_after_screens: None,
                login_works: false,
                logged_in: false,
                log: Arc::new(Mutex::new(Vec::new())),
                screens_shown: 0,
            }
        }

        fn advance(&mut self) {
            if let Some(next) = self.screens.pop_front() {
                self.current = next;
            }
            self.screens_shown += 1;
        }

        fn record(&self, entry: &str) {
            self.log.lock().unwrap().push(entry.to_string());
        }
    }

    impl BrowserSession for FakeSession {
        fn navigate(&mut self, url: &str) -> Result<(), CrawlError> {
            self.record(&format!("navigate {}", url));
            self.advance();
            Ok(())
        }

        fn scroll(&mut self) -> Result<(), CrawlError> {
            self.record("scroll");
            self.advance();
            Ok(())
        }

        fn extract_visible_pins(&mut self) -> Result<Vec<RawPin>, CrawlError> {
            match &self.current {
                Screen::Pins(p) => Ok(p.clone()),
                Screen::Transient => Err(CrawlError::Transient("stale element".into())),
                _ => Ok(Vec::new()),
            }
        }

        fn is_auth_wall_present(&mut self) -> Result<bool, CrawlError> {
            Ok(matches!(self.current, Screen::AuthWall) && !self.logged_in)
        }

        fn is_bot_challenge_present(&mut self) -> Result<bool, CrawlError> {
            Ok(matches!(self.current, Screen::BotChallenge))
        }

        fn is_end_of_board(&mut self) -> Result<bool, CrawlError> {
            Ok(self.end_after_screens.is_some_and(|n| self.screens_shown >= n))
        }

        fn login(&mut self, _credentials: &Credentials) -> Result<bool, CrawlError> {
            self.record("login");
            self.logged_in = self.login_works;
            Ok(self.login_works)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Instant;

    /// Raises the stop flag the first time anything sleeps on it.
    struct StoppingClock {
        inner: ManualClock,
        stop: Arc<AtomicBool>,
    }

    impl Clock for StoppingClock {
        fn now(&self) -> Instant {
            self.inner.now()
        }

        fn sleep(&self, duration: Duration) {
            self.stop.store(true, Ordering::SeqCst);
            self.inner.sleep(duration);
        }
    }

    fn policy(max_pins: usize) -> CrawlPolicy {
        CrawlPolicy {
            max_pins,
            scroll_delay: Duration::from_millis(100)..=Duration::from_millis(200),
            stall_limit: 2,
            max_scroll_retries: 2,
            credentials: None,
        }
    }

    fn collect(
        session: &mut FakeSession,
        policy: &CrawlPolicy,
        clock: &ManualClock,
    ) -> (Vec<Result<PinRecord, CrawlError>>, Option<StopReason>) {
        let stop = AtomicBool::new(false);
        let mut stream = scrape(session, "https://example.com/u/board/", policy, clock, &stop);
        let items: Vec<_> = stream.by_ref().collect();
        let reason = stream.stop_reason();
        (items, reason)
    }

    #[test]
    fn test_pin_record_from_href() {
        let raw = RawPin {
            pin_id: None,
            href: Some("https://www.pinterest.com/pin/12345/?x=1".into()),
            image_src: Some("https://i.pinimg.com/474x/aa/bb.jpg".into()),
            alt: Some("  Denim jacket ".into()),
            description: None,
        };
        let record = PinRecord::from_raw(&raw).unwrap();
        assert_eq!(record.pin_id, "12345");
        assert_eq!(record.image_url, "https://i.pinimg.com/736x/aa/bb.jpg");
        assert_eq!(record.title, "Denim jacket");
    }

    #[test]
    fn test_pin_record_requires_image() {
        let mut r = raw("1");
        r.image_src = None;
        assert!(PinRecord::from_raw(&r).is_none());
    }

    #[test]
    fn test_stops_at_max_pins() {
        let mut session = FakeSession::new(vec![pins(&["1", "2", "3"]), pins(&["1", "2", "3", "4", "5"])]);
        let clock = ManualClock::new();
        let (items, reason) = collect(&mut session, &policy(4), &clock);
        let ids: Vec<_> = items.into_iter().map(|r| r.unwrap().pin_id).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
        assert_eq!(reason, Some(StopReason::MaxPins));
    }

    #[test]
    fn test_stall_ends_crawl_and_delays_are_taken() {
        let mut session = FakeSession::new(vec![pins(&["1", "2"]), pins(&["1", "2"])]);
        let clock = ManualClock::new();
        let (items, reason) = collect(&mut session, &policy(100), &clock);
        assert_eq!(items.len(), 2);
        assert_eq!(reason, Some(StopReason::Stalled));
        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 2);
        for s in sleeps {
            assert!(s >= Duration::from_millis(100) && s <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_end_of_board_marker() {
        let mut session = FakeSession::new(vec![pins(&["1"]), pins(&["1", "2"])]);
        session.end_after_screens = Some(2);
        let clock = ManualClock::new();
        let (items, reason) = collect(&mut session, &policy(100), &clock);
        assert_eq!(items.len(), 2);
        assert_eq!(reason, Some(StopReason::EndOfBoard));
    }

    #[test]
    fn test_bot_detection_emits_partial_then_aborts() {
        let mut session = FakeSession::new(vec![pins(&["1", "2"]), Screen::BotChallenge, pins(&["3"])]);
        let clock = ManualClock::new();
        let (items, reason) = collect(&mut session, &policy(100), &clock);
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok() && items[1].is_ok());
        assert_eq!(items[2].as_ref().unwrap_err(), &CrawlError::BotDetected);
        assert_eq!(reason, Some(StopReason::Failed));
    }

    #[test]
    fn test_auth_wall_without_credentials() {
        let mut session = FakeSession::new(vec![Screen::AuthWall]);
        let clock = ManualClock::new();
        let (items, _) = collect(&mut session, &policy(100), &clock);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap_err(), &CrawlError::AuthRequired);
    }

    #[test]
    fn test_auth_wall_with_credentials_logs_in() {
        let mut session = FakeSession::new(vec![Screen::AuthWall, pins(&["7"]), pins(&["7"])]);
        session.login_works = true;
        let mut p = policy(100);
        p.credentials = Some(Credentials {
            email: "a@example.com".into(),
            password: "pw".into(),
        });
        let clock = ManualClock::new();
        let log = session.log.clone();
        let (items, _) = collect(&mut session, &p, &clock);
        let ids: Vec<_> = items.into_iter().map(|r| r.unwrap().pin_id).collect();
        assert_eq!(ids, vec!["7"]);
        assert!(log.lock().unwrap().iter().any(|e| e == "login"));
    }

    #[test]
    fn test_transient_errors_exhaust() {
        let mut session = FakeSession::new(vec![pins(&["1"]), Screen::Transient]);
        let clock = ManualClock::new();
        let (items, _) = collect(&mut session, &policy(100), &clock);
        assert_eq!(items.len(), 2);
        assert!(matches!(
            items[1],
            Err(CrawlError::Exhausted { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_cancel_before_start() {
        let mut session = FakeSession::new(vec![pins(&["1"])]);
        let clock = ManualClock::new();
        let stop = AtomicBool::new(true);
        let p = policy(10);
        let mut stream = scrape(&mut session, "https://example.com/u/b/", &p, &clock, &stop);
        assert!(stream.next().is_none());
        assert_eq!(stream.stop_reason(), Some(StopReason::Cancelled));
    }

    #[test]
    fn test_stop_during_open_retry_cancels_instead_of_failing() {
        let mut session = FakeSession::new(vec![Screen::Transient]);
        let stop = Arc::new(AtomicBool::new(false));
        let clock = StoppingClock {
            inner: ManualClock::new(),
            stop: stop.clone(),
        };
        let p = policy(10);
        let mut stream = scrape(&mut session, "https://example.com/u/b/", &p, &clock, &stop);
        let items: Vec<_> = stream.by_ref().collect();
        assert!(items.is_empty(), "cancellation must not surface as an error: {:?}", items);
        assert_eq!(stream.stop_reason(), Some(StopReason::Cancelled));
    }

    #[test]
    fn test_stop_during_scroll_pause_keeps_harvested_pins() {
        let mut session = FakeSession::new(vec![pins(&["1", "2"]), Screen::Transient]);
        let stop = Arc::new(AtomicBool::new(false));
        let clock = StoppingClock {
            inner: ManualClock::new(),
            stop: stop.clone(),
        };
        let p = policy(10);
        let mut stream = scrape(&mut session, "https://example.com/u/b/", &p, &clock, &stop);
        let ids: Vec<_> = stream.by_ref().map(|r| r.unwrap().pin_id).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(stream.stop_reason(), Some(StopReason::Cancelled));
    }

    #[test]
    fn test_human_delay_in_range() {
        let range = Duration::from_millis(10)..=Duration::from_millis(20);
        for _ in 0..50 {
            let d = human_delay(&range);
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        let fixed = Duration::ZERO..=Duration::ZERO;
        assert_eq!(human_delay(&fixed), Duration::ZERO);
    }
}
