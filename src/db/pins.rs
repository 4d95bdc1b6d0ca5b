//! Pin and image rows.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::{now_string, parse_status, parse_timestamp, Store};
use crate::crawler::PinRecord;
use crate::error::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinStatus {
    New,
    Downloaded,
    DownloadFailed,
    Labeled,
}

impl PinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PinStatus::New => "new",
            PinStatus::Downloaded => "downloaded",
            PinStatus::DownloadFailed => "download_failed",
            PinStatus::Labeled => "labeled",
        }
    }
}

impl fmt::Display for PinStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PinStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(PinStatus::New),
            "downloaded" => Ok(PinStatus::Downloaded),
            "download_failed" => Ok(PinStatus::DownloadFailed),
            "labeled" => Ok(PinStatus::Labeled),
            other => Err(format!("unknown pin status '{}'", other)),
        }
    }
}

/// A stored pin. `id` is the row key; `pin_id` is the source identifier,
/// unique within its board.
#[derive(Debug, Clone, PartialEq)]
pub struct Pin {
    pub id: i64,
    pub board_id: i64,
    pub pin_id: String,
    pub source_url: String,
    pub title: String,
    pub description: String,
    pub image_url: String,
    pub status: PinStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub pin_ref: i64,
    pub local_path: PathBuf,
    pub thumbnail_path: PathBuf,
    pub checksum: String,
    pub byte_size: u64,
    pub verified: bool,
}

const PIN_COLUMNS: &str = "id, board_id, pin_id, source_url, title, description, image_url, \
                           status, first_seen, last_seen, retry_count";

fn pin_from_row(row: &Row<'_>) -> rusqlite::Result<Pin> {
    let first_seen: String = row.get(8)?;
    let last_seen: String = row.get(9)?;
    Ok(Pin {
        id: row.get(0)?,
        board_id: row.get(1)?,
        pin_id: row.get(2)?,
        source_url: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        image_url: row.get(6)?,
        status: parse_status(&row.get::<_, String>(7)?)?,
        first_seen: parse_timestamp(&first_seen).unwrap_or_default(),
        last_seen: parse_timestamp(&last_seen).unwrap_or_default(),
        retry_count: row.get(10)?,
    })
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        pin_ref: row.get(0)?,
        local_path: PathBuf::from(row.get::<_, String>(1)?),
        thumbnail_path: PathBuf::from(row.get::<_, String>(2)?),
        checksum: row.get(3)?,
        byte_size: row.get::<_, i64>(4)? as u64,
        verified: row.get(5)?,
    })
}

impl Store {
    /// Insert a first-sighted pin with status `new`.
    /// Returns the stored row and whether this call created it.
    pub fn insert_pin(&self, board_id: i64, record: &PinRecord) -> StoreResult<(Pin, bool)> {
        let now = now_string();
        let created = self.conn.execute(
            r#"
            INSERT INTO pins (board_id, pin_id, source_url, title, description, image_url,
                              status, first_seen, last_seen, retry_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'new', ?7, ?7, 0)
            ON CONFLICT(board_id, pin_id) DO NOTHING
            "#,
            rusqlite::params![
                board_id,
                record.pin_id,
                record.url,
                record.title,
                record.description,
                record.image_url,
                now
            ],
        )? == 1;

        let pin = self.get_pin(board_id, &record.pin_id)?.ok_or_else(|| {
            crate::error::StoreError::Unavailable(format!(
                "pin {} vanished after insert",
                record.pin_id
            ))
        })?;
        Ok((pin, created))
    }

    pub fn get_pin(&self, board_id: i64, pin_id: &str) -> StoreResult<Option<Pin>> {
        let sql = format!("SELECT {} FROM pins WHERE board_id = ? AND pin_id = ?", PIN_COLUMNS);
        let pin = self
            .conn
            .query_row(&sql, rusqlite::params![board_id, pin_id], pin_from_row)
            .optional()?;
        Ok(pin)
    }

    pub fn get_pin_by_ref(&self, pin_ref: i64) -> StoreResult<Option<Pin>> {
        let sql = format!("SELECT {} FROM pins WHERE id = ?", PIN_COLUMNS);
        let pin = self.conn.query_row(&sql, [pin_ref], pin_from_row).optional()?;
        Ok(pin)
    }

    pub fn pins_for_board(&self, board_id: i64) -> StoreResult<Vec<Pin>> {
        let sql = format!("SELECT {} FROM pins WHERE board_id = ? ORDER BY id", PIN_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let pins = stmt
            .query_map([board_id], pin_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pins)
    }

    /// Refresh `last_seen` only.
    pub fn touch_pin(&self, pin_ref: i64) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE pins SET last_seen = ? WHERE id = ?",
            rusqlite::params![now_string(), pin_ref],
        )?;
        Ok(())
    }

    /// Record a new source image URL and invalidate the stored image, so the
    /// pin is downloaded again.
    pub fn replace_image_url(&mut self, pin_ref: i64, image_url: &str) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE pins SET image_url = ?, last_seen = ? WHERE id = ?",
            rusqlite::params![image_url, now_string(), pin_ref],
        )?;
        tx.execute("UPDATE images SET verified = 0 WHERE pin_ref = ?", [pin_ref])?;
        tx.commit()?;
        Ok(())
    }

    /// Count one failed download attempt. Once `max_retries` is reached the
    /// pin becomes `download_failed`; a `labeled` pin keeps its status.
    /// Returns the updated pin.
    pub fn record_download_failure(&self, pin_ref: i64, max_retries: u32) -> StoreResult<Option<Pin>> {
        self.conn.execute(
            r#"
            UPDATE pins
            SET retry_count = MIN(retry_count + 1, ?1),
                status = CASE
                    WHEN status != 'labeled' AND retry_count + 1 >= ?1 THEN 'download_failed'
                    ELSE status END
            WHERE id = ?2
            "#,
            rusqlite::params![max_retries, pin_ref],
        )?;
        self.get_pin_by_ref(pin_ref)
    }

    /// Mark a pin permanently failed without touching its retry count.
    pub fn mark_download_failed(&self, pin_ref: i64) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE pins SET status = 'download_failed' WHERE id = ? AND status != 'labeled'",
            [pin_ref],
        )?;
        Ok(())
    }

    /// Persist a verified image and advance the pin in one transaction.
    ///
    /// If a label already exists for exactly this checksum the pin goes
    /// straight back to `labeled`; otherwise it becomes `downloaded`.
    pub fn commit_download(&mut self, image: &ImageRecord) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO images (pin_ref, local_path, thumbnail_path, checksum, byte_size,
                                verified, downloaded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
            ON CONFLICT(pin_ref) DO UPDATE SET
                local_path = excluded.local_path,
                thumbnail_path = excluded.thumbnail_path,
                checksum = excluded.checksum,
                byte_size = excluded.byte_size,
                verified = 1,
                downloaded_at = excluded.downloaded_at
            "#,
            rusqlite::params![
                image.pin_ref,
                image.local_path.to_string_lossy(),
                image.thumbnail_path.to_string_lossy(),
                image.checksum,
                image.byte_size as i64,
                now_string()
            ],
        )?;
        tx.execute(
            r#"
            UPDATE pins
            SET status = CASE
                WHEN EXISTS (SELECT 1 FROM labels l
                             WHERE l.pin_ref = ?1 AND l.image_checksum = ?2)
                THEN 'labeled' ELSE 'downloaded' END
            WHERE id = ?1
            "#,
            rusqlite::params![image.pin_ref, image.checksum],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_image(&self, pin_ref: i64) -> StoreResult<Option<ImageRecord>> {
        let image = self
            .conn
            .query_row(
                r#"
                SELECT pin_ref, local_path, thumbnail_path, checksum, byte_size, verified
                FROM images WHERE pin_ref = ?
                "#,
                [pin_ref],
                image_from_row,
            )
            .optional()?;
        Ok(image)
    }

    /// Pins of a board holding a verified image whose label is missing or was
    /// computed from a different checksum.
    pub fn pins_needing_label(&self, board_id: i64) -> StoreResult<Vec<(Pin, ImageRecord)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT p.id, p.board_id, p.pin_id, p.source_url, p.title, p.description,
                   p.image_url, p.status, p.first_seen, p.last_seen, p.retry_count,
                   i.pin_ref, i.local_path, i.thumbnail_path, i.checksum, i.byte_size, i.verified
            FROM pins p
            JOIN images i ON i.pin_ref = p.id
            LEFT JOIN labels l ON l.pin_ref = p.id
            WHERE p.board_id = ?
              AND i.verified = 1
              AND (l.pin_ref IS NULL OR l.image_checksum != i.checksum)
            ORDER BY p.id
            "#,
        )?;
        let rows = stmt
            .query_map([board_id], |row| {
                let pin = pin_from_row(row)?;
                let image = ImageRecord {
                    pin_ref: row.get(11)?,
                    local_path: PathBuf::from(row.get::<_, String>(12)?),
                    thumbnail_path: PathBuf::from(row.get::<_, String>(13)?),
                    checksum: row.get(14)?,
                    byte_size: row.get::<_, i64>(15)? as u64,
                    verified: row.get(16)?,
                };
                Ok((pin, image))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Operator reset of permanently failed pins with this source id.
    /// Returns how many pins were reset.
    pub fn reset_failed(&self, pin_id: &str) -> StoreResult<usize> {
        let changed = self.conn.execute(
            r#"
            UPDATE pins SET status = 'new', retry_count = 0
            WHERE pin_id = ? AND status = 'download_failed'
            "#,
            [pin_id],
        )?;
        Ok(changed)
    }

    pub fn count_images(&self) -> StoreResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_store;

    fn record(pin_id: &str) -> PinRecord {
        PinRecord {
            pin_id: pin_id.to_string(),
            url: format!("https://example.com/pin/{}/", pin_id),
            title: "Linen dress".to_string(),
            description: String::new(),
            image_url: format!("https://img.example.com/736x/{}.jpg", pin_id),
        }
    }

    fn image_for(pin_ref: i64, checksum: &str) -> ImageRecord {
        ImageRecord {
            pin_ref,
            local_path: PathBuf::from("/tmp/a.jpg"),
            thumbnail_path: PathBuf::from("/tmp/a_thumb.jpg"),
            checksum: checksum.to_string(),
            byte_size: 10,
            verified: true,
        }
    }

    #[test]
    fn test_insert_pin_once_per_board() {
        let (_dir, store) = temp_store();
        let board = store.upsert_board("https://example.com/u/b/", "b").unwrap();
        let (first, created) = store.insert_pin(board.id, &record("1")).unwrap();
        assert!(created);
        assert_eq!(first.status, PinStatus::New);
        let (second, created) = store.insert_pin(board.id, &record("1")).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_same_pin_id_on_two_boards() {
        let (_dir, store) = temp_store();
        let a = store.upsert_board("https://example.com/u/a/", "a").unwrap();
        let b = store.upsert_board("https://example.com/u/b/", "b").unwrap();
        let (pa, _) = store.insert_pin(a.id, &record("1")).unwrap();
        let (pb, created) = store.insert_pin(b.id, &record("1")).unwrap();
        assert!(created);
        assert_ne!(pa.id, pb.id);
    }

    #[test]
    fn test_failure_count_is_bounded() {
        let (_dir, store) = temp_store();
        let board = store.upsert_board("https://example.com/u/b/", "b").unwrap();
        let (pin, _) = store.insert_pin(board.id, &record("1")).unwrap();
        for _ in 0..5 {
            store.record_download_failure(pin.id, 3).unwrap();
        }
        let pin = store.get_pin_by_ref(pin.id).unwrap().unwrap();
        assert_eq!(pin.retry_count, 3);
        assert_eq!(pin.status, PinStatus::DownloadFailed);
    }

    #[test]
    fn test_reset_failed() {
        let (_dir, store) = temp_store();
        let board = store.upsert_board("https://example.com/u/b/", "b").unwrap();
        let (pin, _) = store.insert_pin(board.id, &record("9")).unwrap();
        for _ in 0..3 {
            store.record_download_failure(pin.id, 3).unwrap();
        }
        assert_eq!(store.reset_failed("9").unwrap(), 1);
        let pin = store.get_pin_by_ref(pin.id).unwrap().unwrap();
        assert_eq!(pin.status, PinStatus::New);
        assert_eq!(pin.retry_count, 0);
        assert_eq!(store.reset_failed("9").unwrap(), 0);
    }

    #[test]
    fn test_image_requires_existing_pin() {
        let (_dir, mut store) = temp_store();
        let err = store.commit_download(&image_for(4242, "abc")).unwrap_err();
        assert!(matches!(err, crate::error::StoreError::Constraint(_)));
    }

    #[test]
    fn test_commit_download_and_label_candidates() {
        let (_dir, mut store) = temp_store();
        let board = store.upsert_board("https://example.com/u/b/", "b").unwrap();
        let (pin, _) = store.insert_pin(board.id, &record("1")).unwrap();
        store.commit_download(&image_for(pin.id, "abc")).unwrap();

        let pin = store.get_pin_by_ref(pin.id).unwrap().unwrap();
        assert_eq!(pin.status, PinStatus::Downloaded);
        let candidates = store.pins_needing_label(board.id).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].1.checksum, "abc");
    }

    #[test]
    fn test_replace_image_url_invalidates_image() {
        let (_dir, mut store) = temp_store();
        let board = store.upsert_board("https://example.com/u/b/", "b").unwrap();
        let (pin, _) = store.insert_pin(board.id, &record("1")).unwrap();
        store.commit_download(&image_for(pin.id, "abc")).unwrap();
        store.replace_image_url(pin.id, "https://img.example.com/new.jpg").unwrap();

        let image = store.get_image(pin.id).unwrap().unwrap();
        assert!(!image.verified);
        let pin = store.get_pin_by_ref(pin.id).unwrap().unwrap();
        assert_eq!(pin.image_url, "https://img.example.com/new.jpg");
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            PinStatus::New,
            PinStatus::Downloaded,
            PinStatus::DownloadFailed,
            PinStatus::Labeled,
        ] {
            assert_eq!(status.as_str().parse::<PinStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<PinStatus>().is_err());
    }
}
