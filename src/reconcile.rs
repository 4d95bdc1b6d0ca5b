//! Merges crawled pins into the store and decides what work each one needs.

use tracing::debug;

use crate::crawler::PinRecord;
use crate::db::{Pin, PinStatus, Store};
use crate::error::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// First sighting; the pin was stored with status `new`.
    Create,
    /// Nothing to do beyond refreshing `last_seen`.
    SkipSeen,
    /// Stored, but without a verified image.
    RequeueDownload,
}

impl Decision {
    pub fn needs_download(&self) -> bool {
        matches!(self, Decision::Create | Decision::RequeueDownload)
    }
}

/// Reconcile one crawled record against the store.
///
/// Pins in `download_failed` stay skipped until an operator resets them.
/// A changed source image URL invalidates the stored image so the pin is
/// downloaded again.
pub fn reconcile(store: &mut Store, board_id: i64, record: &PinRecord) -> StoreResult<(Decision, Pin)> {
    let (pin, created) = store.insert_pin(board_id, record)?;
    if created {
        return Ok((Decision::Create, pin));
    }

    if pin.status == PinStatus::DownloadFailed {
        store.touch_pin(pin.id)?;
        return Ok((Decision::SkipSeen, pin));
    }

    if !record.image_url.is_empty() && record.image_url != pin.image_url {
        debug!(pin = %pin.pin_id, "Source image changed");
        store.replace_image_url(pin.id, &record.image_url)?;
        let pin = Pin {
            image_url: record.image_url.clone(),
            ..pin
        };
        return Ok((Decision::RequeueDownload, pin));
    }

    store.touch_pin(pin.id)?;
    let verified = store.get_image(pin.id)?.is_some_and(|image| image.verified);
    if verified {
        Ok((Decision::SkipSeen, pin))
    } else {
        Ok((Decision::RequeueDownload, pin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_store;
    use crate::db::ImageRecord;
    use std::path::PathBuf;

    fn record(pin_id: &str, image_url: &str) -> PinRecord {
        PinRecord {
            pin_id: pin_id.to_string(),
            url: format!("https://example.com/pin/{}/", pin_id),
            title: "Wool coat".to_string(),
            description: String::new(),
            image_url: image_url.to_string(),
        }
    }

    fn verified_image(pin_ref: i64) -> ImageRecord {
        ImageRecord {
            pin_ref,
            local_path: PathBuf::from("/tmp/x.jpg"),
            thumbnail_path: PathBuf::from("/tmp/x_thumb.jpg"),
            checksum: "c0ffee".to_string(),
            byte_size: 100,
            verified: true,
        }
    }

    #[test]
    fn test_first_sighting_creates() {
        let (_dir, mut store) = temp_store();
        let board = store.upsert_board("https://example.com/u/b/", "b").unwrap();
        let (decision, pin) = reconcile(&mut store, board.id, &record("1", "https://i/1.jpg")).unwrap();
        assert_eq!(decision, Decision::Create);
        assert_eq!(pin.status, PinStatus::New);
    }

    #[test]
    fn test_downloaded_pin_is_skipped_twice_without_writes() {
        let (_dir, mut store) = temp_store();
        let board = store.upsert_board("https://example.com/u/b/", "b").unwrap();
        let rec = record("1", "https://i/1.jpg");
        let (_, pin) = reconcile(&mut store, board.id, &rec).unwrap();
        store.commit_download(&verified_image(pin.id)).unwrap();
        let images_before = store.count_images().unwrap();

        for _ in 0..2 {
            let (decision, _) = reconcile(&mut store, board.id, &rec).unwrap();
            assert_eq!(decision, Decision::SkipSeen);
        }
        assert_eq!(store.count_images().unwrap(), images_before);
        assert_eq!(store.pins_for_board(board.id).unwrap().len(), 1);
        let pin = store.get_pin_by_ref(pin.id).unwrap().unwrap();
        assert_eq!(pin.status, PinStatus::Downloaded);
    }

    #[test]
    fn test_unverified_pin_is_requeued() {
        let (_dir, mut store) = temp_store();
        let board = store.upsert_board("https://example.com/u/b/", "b").unwrap();
        let rec = record("1", "https://i/1.jpg");
        reconcile(&mut store, board.id, &rec).unwrap();
        let (decision, _) = reconcile(&mut store, board.id, &rec).unwrap();
        assert_eq!(decision, Decision::RequeueDownload);
    }

    #[test]
    fn test_failed_pin_stays_skipped() {
        let (_dir, mut store) = temp_store();
        let board = store.upsert_board("https://example.com/u/b/", "b").unwrap();
        let rec = record("1", "https://i/1.jpg");
        let (_, pin) = reconcile(&mut store, board.id, &rec).unwrap();
        for _ in 0..3 {
            store.record_download_failure(pin.id, 3).unwrap();
        }
        let (decision, _) = reconcile(&mut store, board.id, &rec).unwrap();
        assert_eq!(decision, Decision::SkipSeen);
    }

    #[test]
    fn test_changed_image_url_requeues() {
        let (_dir, mut store) = temp_store();
        let board = store.upsert_board("https://example.com/u/b/", "b").unwrap();
        let (_, pin) = reconcile(&mut store, board.id, &record("1", "https://i/1.jpg")).unwrap();
        store.commit_download(&verified_image(pin.id)).unwrap();

        let (decision, updated) =
            reconcile(&mut store, board.id, &record("1", "https://i/1-new.jpg")).unwrap();
        assert_eq!(decision, Decision::RequeueDownload);
        assert_eq!(updated.image_url, "https://i/1-new.jpg");
        assert!(!store.get_image(pin.id).unwrap().unwrap().verified);
    }
}
