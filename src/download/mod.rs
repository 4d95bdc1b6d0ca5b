//! Image download and verification with bounded retry.

pub mod fetch;
pub mod files;

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{sleep_unless_stopped, Clock};
use crate::config::Limits;
use crate::db::{ImageRecord, Pin, Store};
use crate::error::{FetchError, StoreResult};

pub use fetch::{HttpFetcher, HttpResponse, UreqFetcher};
pub use files::StorageLayout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { checksum: String },
    /// Retry budget exhausted; the pin is now `download_failed`.
    Failed { attempts: u32, reason: String },
    /// Stop was requested while backing off.
    Interrupted,
}

pub struct DownloadManager {
    fetcher: Arc<dyn HttpFetcher>,
    clock: Arc<dyn Clock>,
    layout: StorageLayout,
    max_retries: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    thumbnail_size: u32,
    min_dimension: u32,
}

impl DownloadManager {
    pub fn new(
        fetcher: Arc<dyn HttpFetcher>,
        clock: Arc<dyn Clock>,
        download_dir: &Path,
        limits: &Limits,
    ) -> Self {
        Self {
            fetcher,
            clock,
            layout: StorageLayout::new(download_dir),
            max_retries: limits.max_retries,
            backoff_base: limits.backoff_base,
            backoff_cap: limits.backoff_cap,
            thumbnail_size: limits.thumbnail_size,
            min_dimension: limits.min_dimension,
        }
    }

    /// Delay before the retry that follows failure number `failures`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }

    /// Download, verify and persist the image for `pin`, retrying up to the
    /// pin's remaining budget. Only store failures are returned as errors.
    pub fn download(&self, store: &mut Store, pin: &Pin, stop: &AtomicBool) -> StoreResult<DownloadOutcome> {
        if pin.retry_count >= self.max_retries {
            store.mark_download_failed(pin.id)?;
            return Ok(DownloadOutcome::Failed {
                attempts: pin.retry_count,
                reason: "retry budget already exhausted".to_string(),
            });
        }

        loop {
            match self.fetch_and_store(pin) {
                Ok(image) => {
                    store.commit_download(&image)?;
                    debug!(pin = %pin.pin_id, bytes = image.byte_size, "Image stored");
                    return Ok(DownloadOutcome::Downloaded {
                        checksum: image.checksum,
                    });
                }
                Err(e) => {
                    let failures = store
                        .record_download_failure(pin.id, self.max_retries)?
                        .map(|p| p.retry_count)
                        .unwrap_or(self.max_retries);
                    if failures >= self.max_retries {
                        info!(pin = %pin.pin_id, attempts = failures, error = %e, "Download failed permanently");
                        store.mark_download_failed(pin.id)?;
                        return Ok(DownloadOutcome::Failed {
                            attempts: failures,
                            reason: e.to_string(),
                        });
                    }

                    let delay = self.backoff(failures);
                    warn!(
                        pin = %pin.pin_id,
                        attempt = failures,
                        integrity = e.is_integrity(),
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Download attempt failed"
                    );
                    if !sleep_unless_stopped(self.clock.as_ref(), delay, stop) {
                        return Ok(DownloadOutcome::Interrupted);
                    }
                }
            }
        }
    }

    /// One attempt: fetch, verify, write files. Nothing touches the store.
    fn fetch_and_store(&self, pin: &Pin) -> Result<ImageRecord, FetchError> {
        let response = self.fetcher.fetch(&pin.image_url)?;
        if !response.is_success() {
            return Err(FetchError::Status(response.status));
        }
        if response.body.is_empty() {
            return Err(FetchError::Empty);
        }
        if let Some(ct) = &response.content_type {
            if !ct.trim().to_ascii_lowercase().starts_with("image/") {
                return Err(FetchError::NotImage(ct.clone()));
            }
        }

        let img = image::load_from_memory(&response.body)
            .map_err(|e| FetchError::Undecodable(e.to_string()))?;
        if img.width() < self.min_dimension || img.height() < self.min_dimension {
            return Err(FetchError::TooSmall {
                width: img.width(),
                height: img.height(),
            });
        }

        let stem = StorageLayout::stem(&pin.pin_id, &pin.image_url);
        let (local_path, thumbnail_path) =
            self.layout
                .store(&stem, &response.body, &img, self.thumbnail_size)?;

        Ok(ImageRecord {
            pin_ref: pin.id,
            local_path,
            thumbnail_path,
            checksum: files::checksum(&response.body),
            byte_size: response.body.len() as u64,
            verified: true,
        })
    }
}
