//! Failure taxonomy shared by the pipeline stages.
//!
//! Stage-local failures are values, not panics: each stage decides from the
//! variant whether to retry, count against a pin's budget, fail a board, or
//! pause. Only [`StoreError::Unavailable`] is fatal to a whole run.

use thiserror::Error;

/// Conditions raised while crawling a single board.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CrawlError {
    /// Network blip or DOM read race. Retried in place.
    #[error("transient crawl error: {0}")]
    Transient(String),

    /// The board sits behind a login wall and no working credentials exist.
    #[error("authentication required to view board")]
    AuthRequired,

    /// A CAPTCHA or bot challenge was served. Never retried within a run.
    #[error("bot detection challenge encountered")]
    BotDetected,

    /// Transient retries for one scroll step ran out.
    #[error("crawler gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    /// The stop flag was raised while the crawler was waiting. Not a failure.
    #[error("crawl cancelled")]
    Cancelled,
}

/// Failures while fetching and verifying one image.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("empty response body")]
    Empty,

    #[error("response is not an image (content-type {0})")]
    NotImage(String),

    #[error("could not decode image: {0}")]
    Undecodable(String),

    #[error("image too small: {width}x{height}")]
    TooSmall { width: u32, height: u32 },

    #[error("failed to write image: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Corrupt, empty or undecodable payloads, as opposed to transport trouble.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            FetchError::Empty
                | FetchError::NotImage(_)
                | FetchError::Undecodable(_)
                | FetchError::TooSmall { .. }
        )
    }
}

/// Failures reported by the external vision service.
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("vision quota exceeded")]
    QuotaExceeded,

    #[error("vision service rejected credentials: {0}")]
    Auth(String),

    #[error("transient vision error: {0}")]
    Transient(String),

    #[error("vision request failed: {0}")]
    Other(String),
}

impl From<ureq::Error> for VisionError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(429, _) => VisionError::QuotaExceeded,
            ureq::Error::Status(code @ (401 | 403), resp) => {
                let body = resp.into_string().unwrap_or_default();
                VisionError::Auth(format!("status {}: {}", code, body))
            }
            ureq::Error::Status(code, _) if code >= 500 => {
                VisionError::Transient(format!("status {}", code))
            }
            ureq::Error::Status(code, resp) => {
                let body = resp.into_string().unwrap_or_default();
                VisionError::Other(format!("status {}: {}", code, body))
            }
            ureq::Error::Transport(t) => VisionError::Transient(t.to_string()),
        }
    }
}

/// Persistent store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness or foreign-key constraint fired. Upserts should make this
    /// unreachable; when seen, the affected pin is skipped.
    #[error("store constraint violation: {0}")]
    Constraint(String),

    /// The store cannot be written at all. Fatal to the run.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(err.to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Unavailable(format!("serialization: {}", err))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
