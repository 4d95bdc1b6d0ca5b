//! SQLite-backed persistent store.
//!
//! Every worker thread opens its own [`Store`] on the same database file.
//! Pin writes are keyed upserts on `(board_id, pin_id)`, so concurrent
//! reconciliation of the same pin converges on one row.

mod schema;
pub mod labels;
pub mod pins;
pub mod reports;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};

pub use labels::Label;
pub use pins::{ImageRecord, Pin, PinStatus};
pub use reports::BoardStats;
pub use schema::SCHEMA;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    pub id: i64,
    pub url: String,
    pub display_name: String,
    pub last_crawled_at: Option<DateTime<Utc>>,
}

pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database file at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    /// Open and create the schema.
    pub fn open_initialized(path: &Path) -> StoreResult<Self> {
        let store = Self::open(path)?;
        store.initialize()?;
        Ok(store)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ========================================================================
    // Boards
    // ========================================================================

    /// Insert the board if unseen and return the stored row.
    pub fn upsert_board(&self, url: &str, display_name: &str) -> StoreResult<Board> {
        self.conn.execute(
            r#"
            INSERT INTO boards (url, display_name, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(url) DO NOTHING
            "#,
            rusqlite::params![url, display_name, now_string()],
        )?;
        self.get_board_by_url(url)?
            .ok_or_else(|| StoreError::Unavailable(format!("board {} vanished after upsert", url)))
    }

    pub fn get_board_by_url(&self, url: &str) -> StoreResult<Option<Board>> {
        let board = self
            .conn
            .query_row(
                "SELECT id, url, display_name, last_crawled_at FROM boards WHERE url = ?",
                [url],
                |row| {
                    Ok(Board {
                        id: row.get(0)?,
                        url: row.get(1)?,
                        display_name: row.get(2)?,
                        last_crawled_at: row
                            .get::<_, Option<String>>(3)?
                            .as_deref()
                            .and_then(parse_timestamp),
                    })
                },
            )
            .optional()?;
        Ok(board)
    }

    pub fn mark_board_crawled(&self, board_id: i64) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE boards SET last_crawled_at = ? WHERE id = ?",
            rusqlite::params![now_string(), board_id],
        )?;
        Ok(())
    }
}

pub(crate) fn now_string() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn parse_status(s: &str) -> rusqlite::Result<PinStatus> {
    PinStatus::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// A store on a temp file; keep the `TempDir` alive for the test.
    pub fn temp_store() -> (TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_initialized(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::temp_store;
    use super::Store;

    #[test]
    fn test_upsert_board_is_idempotent() {
        let (_dir, store) = temp_store();
        let a = store.upsert_board("https://example.com/u/board/", "board").unwrap();
        let b = store.upsert_board("https://example.com/u/board/", "renamed").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.display_name, "board");
        assert!(b.last_crawled_at.is_none());
    }

    #[test]
    fn test_mark_board_crawled() {
        let (_dir, store) = temp_store();
        let board = store.upsert_board("https://example.com/u/b/", "b").unwrap();
        store.mark_board_crawled(board.id).unwrap();
        let board = store.get_board_by_url("https://example.com/u/b/").unwrap().unwrap();
        assert!(board.last_crawled_at.is_some());
    }

    #[test]
    fn test_second_connection_sees_same_data() {
        let (dir, store) = temp_store();
        store.upsert_board("https://example.com/u/b/", "b").unwrap();
        let other = Store::open(&dir.path().join("test.db")).unwrap();
        assert!(other.get_board_by_url("https://example.com/u/b/").unwrap().is_some());
    }
}
