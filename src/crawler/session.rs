//! Browser automation capability consumed by the crawler.

use anyhow::Result;

use crate::config::Credentials;
use crate::error::CrawlError;

/// A pin node as read from the page, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct RawPin {
    #[serde(default)]
    pub pin_id: Option<String>,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub image_src: Option<String>,
    #[serde(default)]
    pub alt: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// One exclusive, stateful browser session.
///
/// Implementations report DOM races and network trouble as
/// [`CrawlError::Transient`]; the crawler decides how often to retry.
pub trait BrowserSession: Send {
    fn navigate(&mut self, url: &str) -> Result<(), CrawlError>;

    fn scroll(&mut self) -> Result<(), CrawlError>;

    /// Pin nodes currently rendered, including ones already returned earlier.
    fn extract_visible_pins(&mut self) -> Result<Vec<RawPin>, CrawlError>;

    fn is_auth_wall_present(&mut self) -> Result<bool, CrawlError>;

    fn is_bot_challenge_present(&mut self) -> Result<bool, CrawlError>;

    /// Whether the page shows its end-of-content marker.
    fn is_end_of_board(&mut self) -> Result<bool, CrawlError> {
        Ok(false)
    }

    /// Switch to an authenticated session. Returns false when the login did
    /// not take.
    fn login(&mut self, _credentials: &Credentials) -> Result<bool, CrawlError> {
        Ok(false)
    }
}

/// Opens browser sessions; one per concurrently crawled board.
pub trait SessionFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn BrowserSession>>;
}
