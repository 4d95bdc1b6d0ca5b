use anyhow::{bail, Result};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use crate::db::reports::LabeledPinRow;
use crate::db::Store;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    /// Guess from a file extension, defaulting to JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => ExportFormat::Csv,
            _ => ExportFormat::Json,
        }
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => bail!("unknown export format '{}' (expected json or csv)", other),
        }
    }
}

/// One training example: a labeled pin with its local image.
#[derive(Debug, Serialize)]
pub struct ExportedPin {
    pub pin_id: String,
    pub board_url: String,
    pub title: String,
    pub description: String,
    pub source_url: String,
    pub image_url: String,
    pub local_path: String,
    pub thumbnail_path: String,
    pub checksum: String,
    pub categories: Vec<String>,
    pub types: Vec<String>,
    pub colors: Vec<String>,
    pub styles: Vec<String>,
    pub materials: Vec<String>,
    pub confidence: f32,
    pub parsed: bool,
    pub labeled_at: String,
}

impl From<LabeledPinRow> for ExportedPin {
    fn from(row: LabeledPinRow) -> Self {
        Self {
            pin_id: row.pin_id,
            board_url: row.board_url,
            title: row.title,
            description: row.description,
            source_url: row.source_url,
            image_url: row.image_url,
            local_path: row.local_path.to_string_lossy().into_owned(),
            thumbnail_path: row.thumbnail_path.to_string_lossy().into_owned(),
            checksum: row.checksum,
            categories: row.label.categories,
            types: row.label.types,
            colors: row.label.colors,
            styles: row.label.styles,
            materials: row.label.materials,
            confidence: row.label.confidence,
            parsed: row.label.parsed,
            labeled_at: row.label.created_at.to_rfc3339(),
        }
    }
}

/// Export every labeled pin to `output_path`. Returns the number written.
pub fn export_dataset(store: &Store, output_path: &Path, format: ExportFormat) -> Result<usize> {
    let pins: Vec<ExportedPin> = store
        .labeled_pins()?
        .into_iter()
        .map(ExportedPin::from)
        .collect();
    let count = pins.len();

    match format {
        ExportFormat::Json => export_json(&pins, output_path)?,
        ExportFormat::Csv => export_csv(&pins, output_path)?,
    }

    Ok(count)
}

fn export_json(pins: &[ExportedPin], output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(pins)?;
    let mut file = File::create(output_path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

fn export_csv(pins: &[ExportedPin], output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path)?;

    wtr.write_record([
        "pin_id",
        "board_url",
        "title",
        "description",
        "source_url",
        "image_url",
        "local_path",
        "thumbnail_path",
        "checksum",
        "categories",
        "types",
        "colors",
        "styles",
        "materials",
        "confidence",
        "parsed",
        "labeled_at",
    ])?;

    // List facets are joined with ';' so each stays one cell.
    for pin in pins {
        let record: [&str; 17] = [
            &pin.pin_id,
            &pin.board_url,
            &pin.title,
            &pin.description,
            &pin.source_url,
            &pin.image_url,
            &pin.local_path,
            &pin.thumbnail_path,
            &pin.checksum,
            &pin.categories.join(";"),
            &pin.types.join(";"),
            &pin.colors.join(";"),
            &pin.styles.join(";"),
            &pin.materials.join(";"),
            &format!("{:.3}", pin.confidence),
            if pin.parsed { "true" } else { "false" },
            &pin.labeled_at,
        ];
        wtr.write_record(record)?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::PinRecord;
    use crate::db::test_support::temp_store;
    use crate::db::{ImageRecord, Label};
    use chrono::Utc;
    use std::path::PathBuf;

    fn seed(store: &mut Store) {
        let board = store.upsert_board("https://example.com/u/b/", "b").unwrap();
        for (i, pin_id) in ["1", "2"].iter().enumerate() {
            let (pin, _) = store
                .insert_pin(
                    board.id,
                    &PinRecord {
                        pin_id: pin_id.to_string(),
                        url: format!("https://example.com/pin/{}/", pin_id),
                        title: "Linen, dress".into(),
                        description: String::new(),
                        image_url: format!("https://i.example.com/{}.jpg", pin_id),
                    },
                )
                .unwrap();
            store
                .commit_download(&ImageRecord {
                    pin_ref: pin.id,
                    local_path: PathBuf::from(format!("/data/pins/{}.jpg", pin_id)),
                    thumbnail_path: PathBuf::from(format!("/data/thumbnails/{}_thumb.jpg", pin_id)),
                    checksum: format!("sum{}", pin_id),
                    byte_size: 10,
                    verified: true,
                })
                .unwrap();
            // Only the first pin gets labeled.
            if i == 0 {
                store
                    .save_label(&Label {
                        pin_ref: pin.id,
                        categories: vec!["dress".into()],
                        types: vec!["midi_dress".into()],
                        colors: vec!["sage_green".into(), "cream".into()],
                        styles: vec!["boho".into()],
                        materials: vec!["linen".into()],
                        confidence: 0.8,
                        parsed: true,
                        raw_response_digest: "d".into(),
                        image_checksum: format!("sum{}", pin_id),
                        created_at: Utc::now(),
                    })
                    .unwrap();
            }
        }
    }

    #[test]
    fn test_export_json_only_labeled() {
        let (dir, mut store) = temp_store();
        seed(&mut store);
        let out = dir.path().join("dataset.json");
        let count = export_dataset(&store, &out, ExportFormat::Json).unwrap();
        assert_eq!(count, 1);

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(value[0]["pin_id"], "1");
        assert_eq!(value[0]["colors"][1], "cream");
    }

    #[test]
    fn test_export_csv_quotes_and_joins() {
        let (dir, mut store) = temp_store();
        seed(&mut store);
        let out = dir.path().join("dataset.csv");
        export_dataset(&store, &out, ExportFormat::Csv).unwrap();

        let mut reader = csv::Reader::from_path(&out).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][2], "Linen, dress");
        assert_eq!(&rows[0][11], "sage_green;cream");
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("html".parse::<ExportFormat>().is_err());
        assert_eq!(ExportFormat::from_path(Path::new("x.csv")), ExportFormat::Csv);
        assert_eq!(ExportFormat::Json.extension(), "json");
    }
}
