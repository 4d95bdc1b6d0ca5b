use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, warn};

use super::parse::{parse_response, LabelParse, LabelSet};
use super::provider::VisionProvider;
use super::quota::QuotaLimiter;
use crate::clock::Clock;
use crate::config::Limits;
use crate::db::{ImageRecord, Label, Pin, Store};
use crate::error::{StoreResult, VisionError};

#[derive(Debug, Clone, PartialEq)]
pub enum LabelOutcome {
    Labeled { parsed: bool },
    /// A current label for this checksum already exists.
    Unchanged,
    /// The stage was disabled by a credential failure, now or earlier.
    Disabled,
    Failed(String),
    Interrupted,
}

/// Sends verified images to the vision service under a shared quota.
pub struct LabelClient {
    provider: Arc<dyn VisionProvider>,
    clock: Arc<dyn Clock>,
    quota: QuotaLimiter,
    max_transient_retries: u32,
    custom_prompt: Option<String>,
    disabled: AtomicBool,
    disabled_reason: Mutex<Option<String>>,
}

fn base_prompt() -> &'static str {
    "Analyze the fashion content of this image. Identify every visible clothing item, \
     shoe, bag and accessory. Respond with JSON only, in exactly this structure:\n\
     {\n\
       \"detected_fashion_items\": [\n\
         {\"category\": \"...\", \"type\": \"...\", \"colors\": [\"...\"], \
          \"material\": \"...\", \"style\": \"...\", \"confidence\": 0.0}\n\
       ],\n\
       \"comprehensive_style_analysis\": {\"style_category\": \"...\"},\n\
       \"color_analysis\": {\"dominant_colors\": [\"...\"]},\n\
       \"confidence_score\": 0.0\n\
     }\n\
     Categories: Dress, Top, Knit or Sweater Top, Shirt, Pants, Shorts, Skirt, Shoes, \
     Outerwear, Undergarments, Bag, Accessory. Confidence values range from 0.0 to 1.0. \
     If no fashion items are visible return an empty detected_fashion_items list."
}

/// Prompt for one pin, with the pin's own text as context.
pub fn build_prompt(custom_prompt: Option<&str>, pin: &Pin) -> String {
    let mut prompt = String::new();
    if let Some(context) = custom_prompt {
        prompt.push_str(&format!("Context: {}\n\n", context));
    }
    if !pin.title.is_empty() || !pin.description.is_empty() {
        prompt.push_str(&format!(
            "Pin title: {}\nPin description: {}\n\n",
            pin.title, pin.description
        ));
    }
    prompt.push_str(base_prompt());
    prompt
}

impl LabelClient {
    pub fn new(
        provider: Arc<dyn VisionProvider>,
        clock: Arc<dyn Clock>,
        limits: &Limits,
        custom_prompt: Option<String>,
    ) -> Self {
        Self {
            provider,
            clock,
            quota: QuotaLimiter::new(limits.quota_per_window, limits.quota_window),
            max_transient_retries: limits.max_transient_label_retries,
            custom_prompt,
            disabled: AtomicBool::new(false),
            disabled_reason: Mutex::new(None),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn disabled_reason(&self) -> Option<String> {
        self.disabled_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn quota_pauses(&self) -> u32 {
        self.quota.pauses()
    }

    fn disable(&self, reason: String) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            error!(provider = self.provider_name(), error = %reason, "Vision credentials rejected, labeling disabled for this run");
            *self
                .disabled_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(reason);
        }
    }

    /// Call the service for one image, handling quota pauses and transient
    /// retries. Returns the raw response text.
    pub fn analyze(&self, pin: &Pin, image_bytes: &[u8], stop: &AtomicBool) -> Result<String, LabelOutcome> {
        let prompt = build_prompt(self.custom_prompt.as_deref(), pin);
        let mut transient_failures = 0;

        loop {
            if self.is_disabled() {
                return Err(LabelOutcome::Disabled);
            }
            if !self.quota.acquire(self.clock.as_ref(), stop) {
                return Err(LabelOutcome::Interrupted);
            }

            match self.provider.classify(image_bytes, &prompt) {
                Ok(raw) => return Ok(raw),
                Err(VisionError::QuotaExceeded) => {
                    warn!(pin = %pin.pin_id, "Vision service reported quota exceeded");
                    self.quota.exhaust(self.clock.as_ref());
                }
                Err(VisionError::Auth(reason)) => {
                    self.disable(reason);
                    return Err(LabelOutcome::Disabled);
                }
                Err(VisionError::Transient(reason)) => {
                    transient_failures += 1;
                    if transient_failures > self.max_transient_retries {
                        return Err(LabelOutcome::Failed(reason));
                    }
                    debug!(pin = %pin.pin_id, attempt = transient_failures, error = %reason, "Retrying vision request");
                }
                Err(VisionError::Other(reason)) => return Err(LabelOutcome::Failed(reason)),
            }
        }
    }

    /// Label one pin whose image is verified, storing the result. A label
    /// already computed from this checksum is left untouched.
    pub fn label_pin(
        &self,
        store: &mut Store,
        pin: &Pin,
        image: &ImageRecord,
        stop: &AtomicBool,
    ) -> StoreResult<LabelOutcome> {
        if self.is_disabled() {
            return Ok(LabelOutcome::Disabled);
        }
        if let Some(existing) = store.get_label(pin.id)? {
            if existing.image_checksum == image.checksum {
                return Ok(LabelOutcome::Unchanged);
            }
        }

        let bytes = match std::fs::read(&image.local_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(LabelOutcome::Failed(format!(
                    "cannot read {}: {}",
                    image.local_path.display(),
                    e
                )))
            }
        };

        let raw = match self.analyze(pin, &bytes, stop) {
            Ok(raw) => raw,
            Err(outcome) => return Ok(outcome),
        };

        let parsed = parse_response(&raw);
        let (labels, was_parsed) = match &parsed {
            LabelParse::Parsed { labels, .. } => (labels.clone(), true),
            LabelParse::Unparseable { .. } => {
                warn!(pin = %pin.pin_id, "Vision response unparseable, storing empty label");
                (LabelSet::default(), false)
            }
        };

        let label = Label {
            pin_ref: pin.id,
            categories: labels.categories,
            types: labels.types,
            colors: labels.colors,
            styles: labels.styles,
            materials: labels.materials,
            confidence: labels.confidence,
            parsed: was_parsed,
            raw_response_digest: parsed.digest().to_string(),
            image_checksum: image.checksum.clone(),
            created_at: Utc::now(),
        };
        store.save_label(&label)?;
        Ok(LabelOutcome::Labeled { parsed: was_parsed })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Scripted vision service; once the script runs out every call
    /// returns `fallback`.
    pub struct FakeVision {
        script: Mutex<VecDeque<Result<String, VisionError>>>,
        fallback: String,
        clock: Option<Arc<dyn Clock>>,
        pub calls: Mutex<Vec<Option<Instant>>>,
    }

    pub const GOOD_RESPONSE: &str = r#"{"detected_fashion_items": [{"category": "Dress",
        "type": "Midi Dress", "colors": ["Sage Green"], "material": "Linen", "style": "Boho"}],
        "confidence_score": 0.8}"#;

    impl FakeVision {
        pub fn new(script: Vec<Result<String, VisionError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: GOOD_RESPONSE.to_string(),
                clock: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn always(response: &str) -> Self {
            let mut fake = Self::new(Vec::new());
            fake.fallback = response.to_string();
            fake
        }

        /// Record the clock reading at every call.
        pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
            self.clock = Some(clock);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl VisionProvider for FakeVision {
        fn classify(&self, _image_bytes: &[u8], _prompt: &str) -> Result<String, VisionError> {
            let at = self.clock.as_ref().map(|c| c.now());
            self.calls.lock().unwrap().push(at);
            match self.script.lock().unwrap().pop_front() {
                Some(next) => next,
                None => Ok(self.fallback.clone()),
            }
        }

        fn provider_name(&self) -> &'static str {
            "fake"
        }
    }
}
