//! Run report persistence and read-only summaries.

use rusqlite::OptionalExtension;
use std::path::PathBuf;

use super::labels::{label_from_row, Label};
use super::Store;
use crate::error::StoreResult;
use crate::pipeline::RunReport;

/// Per-board totals for the `stats` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardStats {
    pub url: String,
    pub display_name: String,
    pub last_crawled_at: Option<String>,
    pub pins: i64,
    pub downloaded: i64,
    pub labeled: i64,
    pub failed: i64,
}

/// A labeled pin with everything needed for dataset export.
#[derive(Debug, Clone)]
pub struct LabeledPinRow {
    pub pin_id: String,
    pub board_url: String,
    pub title: String,
    pub description: String,
    pub source_url: String,
    pub image_url: String,
    pub local_path: PathBuf,
    pub thumbnail_path: PathBuf,
    pub checksum: String,
    pub label: Label,
}

impl Store {
    /// Append a finished (or partial) run report. Reports are never updated.
    pub fn insert_run_report(&self, report: &RunReport) -> StoreResult<()> {
        let json = serde_json::to_string(report)?;
        self.conn.execute(
            r#"
            INSERT INTO run_reports (run_id, started_at, ended_at, report)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            rusqlite::params![
                report.run_id.to_string(),
                report.started_at.to_rfc3339(),
                report.ended_at.map(|t| t.to_rfc3339()),
                json
            ],
        )?;
        Ok(())
    }

    pub fn latest_run_report(&self) -> StoreResult<Option<RunReport>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT report FROM run_reports ORDER BY rowid DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn board_stats(&self) -> StoreResult<Vec<BoardStats>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT b.url, b.display_name, b.last_crawled_at,
                   COUNT(p.id),
                   COALESCE(SUM(CASE WHEN p.status IN ('downloaded', 'labeled') THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN p.status = 'labeled' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN p.status = 'download_failed' THEN 1 ELSE 0 END), 0)
            FROM boards b
            LEFT JOIN pins p ON p.board_id = b.id
            GROUP BY b.id
            ORDER BY b.url
            "#,
        )?;
        let stats = stmt
            .query_map([], |row| {
                Ok(BoardStats {
                    url: row.get(0)?,
                    display_name: row.get(1)?,
                    last_crawled_at: row.get(2)?,
                    pins: row.get(3)?,
                    downloaded: row.get(4)?,
                    labeled: row.get(5)?,
                    failed: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats)
    }

    pub fn labeled_pins(&self) -> StoreResult<Vec<LabeledPinRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT p.pin_id, b.url, p.title, p.description, p.source_url, p.image_url,
                   i.local_path, i.thumbnail_path, i.checksum,
                   l.pin_ref, l.categories, l.types, l.colors, l.styles, l.materials,
                   l.confidence, l.parsed, l.raw_response_digest, l.image_checksum, l.created_at
            FROM pins p
            JOIN boards b ON b.id = p.board_id
            JOIN images i ON i.pin_ref = p.id AND i.verified = 1
            JOIN labels l ON l.pin_ref = p.id
            WHERE p.status = 'labeled'
            ORDER BY b.url, p.id
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(LabeledPinRow {
                    pin_id: row.get(0)?,
                    board_url: row.get(1)?,
                    title: row.get(2)?,
                    description: row.get(3)?,
                    source_url: row.get(4)?,
                    image_url: row.get(5)?,
                    local_path: PathBuf::from(row.get::<_, String>(6)?),
                    thumbnail_path: PathBuf::from(row.get::<_, String>(7)?),
                    checksum: row.get(8)?,
                    label: label_from_row(row, 9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
