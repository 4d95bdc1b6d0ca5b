//! Stored AI labels.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};

use super::{parse_timestamp, Store};
use crate::error::StoreResult;

#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub pin_ref: i64,
    pub categories: Vec<String>,
    pub types: Vec<String>,
    pub colors: Vec<String>,
    pub styles: Vec<String>,
    pub materials: Vec<String>,
    pub confidence: f32,
    /// False when the vision response could not be mapped to the taxonomy.
    pub parsed: bool,
    pub raw_response_digest: String,
    /// Checksum of the image the label was computed from.
    pub image_checksum: String,
    pub created_at: DateTime<Utc>,
}

impl Label {
    /// Every label value across all facets, de-duplicated and sorted.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .categories
            .iter()
            .chain(&self.types)
            .chain(&self.colors)
            .chain(&self.styles)
            .chain(&self.materials)
            .cloned()
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }
}

fn json_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn label_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Label> {
    let created_at: String = row.get(offset + 10)?;
    Ok(Label {
        pin_ref: row.get(offset)?,
        categories: json_list(row, offset + 1)?,
        types: json_list(row, offset + 2)?,
        colors: json_list(row, offset + 3)?,
        styles: json_list(row, offset + 4)?,
        materials: json_list(row, offset + 5)?,
        confidence: row.get::<_, f64>(offset + 6)? as f32,
        parsed: row.get(offset + 7)?,
        raw_response_digest: row.get(offset + 8)?,
        image_checksum: row.get(offset + 9)?,
        created_at: parse_timestamp(&created_at).unwrap_or_default(),
    })
}

pub(crate) const LABEL_COLUMNS: &str = "pin_ref, categories, types, colors, styles, materials, \
                                        confidence, parsed, raw_response_digest, image_checksum, \
                                        created_at";

impl Store {
    /// Replace the pin's current label and mark the pin `labeled`, atomically.
    pub fn save_label(&mut self, label: &Label) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO labels (pin_ref, categories, types, colors, styles, materials,
                                confidence, parsed, raw_response_digest, image_checksum,
                                created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(pin_ref) DO UPDATE SET
                categories = excluded.categories,
                types = excluded.types,
                colors = excluded.colors,
                styles = excluded.styles,
                materials = excluded.materials,
                confidence = excluded.confidence,
                parsed = excluded.parsed,
                raw_response_digest = excluded.raw_response_digest,
                image_checksum = excluded.image_checksum,
                created_at = excluded.created_at
            "#,
            rusqlite::params![
                label.pin_ref,
                serde_json::to_string(&label.categories)?,
                serde_json::to_string(&label.types)?,
                serde_json::to_string(&label.colors)?,
                serde_json::to_string(&label.styles)?,
                serde_json::to_string(&label.materials)?,
                label.confidence as f64,
                label.parsed,
                label.raw_response_digest,
                label.image_checksum,
                label.created_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "UPDATE pins SET status = 'labeled' WHERE id = ?",
            [label.pin_ref],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_label(&self, pin_ref: i64) -> StoreResult<Option<Label>> {
        let sql = format!("SELECT {} FROM labels WHERE pin_ref = ?", LABEL_COLUMNS);
        let label = self
            .conn
            .query_row(&sql, [pin_ref], |row| label_from_row(row, 0))
            .optional()?;
        Ok(label)
    }

    pub fn count_labels(&self) -> StoreResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM labels", [], |row| row.get(0))?)
    }
}
