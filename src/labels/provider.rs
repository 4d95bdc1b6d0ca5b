use anyhow::{bail, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::GenericImageView;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;

use crate::config::{LabelingConfig, VisionProviderType};
use crate::error::VisionError;

/// Longest side of the image sent for analysis.
const UPLOAD_MAX_DIMENSION: u32 = 1024;

/// Trait for vision services that classify an image against a prompt.
///
/// Implementations map HTTP 429 to [`VisionError::QuotaExceeded`] and
/// rejected credentials to [`VisionError::Auth`].
pub trait VisionProvider: Send + Sync {
    /// Send the image with `prompt` and return the model's raw text output.
    fn classify(&self, image_bytes: &[u8], prompt: &str) -> Result<String, VisionError>;

    /// Get the provider name for display
    fn provider_name(&self) -> &'static str;
}

fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(120))
        .build()
}

/// Decode, shrink if larger than `max_dimension`, re-encode as JPEG and
/// base64 the result.
pub fn encode_for_upload(image_bytes: &[u8], max_dimension: u32) -> Result<(String, &'static str), VisionError> {
    let img = image::load_from_memory(image_bytes)
        .map_err(|e| VisionError::Other(format!("Failed to decode image: {}", e)))?;

    let (width, height) = img.dimensions();
    let img = if width > max_dimension || height > max_dimension {
        img.resize(
            max_dimension,
            max_dimension,
            image::imageops::FilterType::Triangle,
        )
    } else {
        img
    };

    let rgb = image::DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, 85);
    rgb.write_with_encoder(encoder)
        .map_err(|e| VisionError::Other(format!("Failed to encode image as JPEG: {}", e)))?;

    Ok((BASE64.encode(buf.into_inner()), "image/jpeg"))
}

fn malformed(provider: &str, err: impl std::fmt::Display) -> VisionError {
    VisionError::Other(format!("Failed to parse {} response: {}", provider, err))
}

// ============================================================================
// OpenAI-compatible provider (OpenAI, LM Studio and compatible APIs)
// ============================================================================

pub struct OpenAICompatibleProvider {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: Vec<OpenAIContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum OpenAIContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

impl OpenAICompatibleProvider {
    pub fn new(endpoint: &str, model: &str, api_key: Option<&str>) -> Self {
        Self {
            agent: agent(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.map(|s| s.to_string()),
        }
    }
}

impl VisionProvider for OpenAICompatibleProvider {
    fn classify(&self, image_bytes: &[u8], prompt: &str) -> Result<String, VisionError> {
        let (base64_image, mime_type) = encode_for_upload(image_bytes, UPLOAD_MAX_DIMENSION)?;
        let data_url = format!("data:{};base64,{}", mime_type, base64_image);

        let request = OpenAIChatRequest {
            model: self.model.clone(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: vec![
                    OpenAIContentPart::Text {
                        text: prompt.to_string(),
                    },
                    OpenAIContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    },
                ],
            }],
            max_tokens: 1200,
            temperature: 0.2,
        };

        let url = format!("{}/chat/completions", self.endpoint);
        let mut req = self.agent.post(&url).set("Content-Type", "application/json");
        if let Some(ref api_key) = self.api_key {
            req = req.set("Authorization", &format!("Bearer {}", api_key));
        }

        let chat_response: OpenAIChatResponse = req
            .send_json(&request)?
            .into_json()
            .map_err(|e| malformed("chat", e))?;

        Ok(chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }

    fn provider_name(&self) -> &'static str {
        "OpenAI-compatible"
    }
}

// ============================================================================
// Anthropic Claude provider
// ============================================================================

pub struct AnthropicProvider {
    agent: ureq::Agent,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AnthropicContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: AnthropicImageSource },
}

#[derive(Debug, Serialize)]
struct AnthropicImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponseContent {
    text: Option<String>,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, model: Option<&str>) -> Self {
        Self {
            agent: agent(),
            api_key: api_key.to_string(),
            model: model.unwrap_or("claude-sonnet-4-20250514").to_string(),
        }
    }
}

impl VisionProvider for AnthropicProvider {
    fn classify(&self, image_bytes: &[u8], prompt: &str) -> Result<String, VisionError> {
        let (base64_image, media_type) = encode_for_upload(image_bytes, UPLOAD_MAX_DIMENSION)?;

        let request = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: 1200,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: vec![
                    AnthropicContent::Image {
                        source: AnthropicImageSource {
                            source_type: "base64".to_string(),
                            media_type: media_type.to_string(),
                            data: base64_image,
                        },
                    },
                    AnthropicContent::Text {
                        text: prompt.to_string(),
                    },
                ],
            }],
        };

        let response: AnthropicResponse = self
            .agent
            .post("https://api.anthropic.com/v1/messages")
            .set("Content-Type", "application/json")
            .set("x-api-key", &self.api_key)
            .set("anthropic-version", "2023-06-01")
            .send_json(&request)?
            .into_json()
            .map_err(|e| malformed("Anthropic", e))?;

        Ok(response
            .content
            .first()
            .and_then(|c| c.text.clone())
            .unwrap_or_default())
    }

    fn provider_name(&self) -> &'static str {
        "Anthropic Claude"
    }
}

// ============================================================================
// Google Gemini provider
// ============================================================================

pub struct GeminiProvider {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { inline_data: GeminiInlineData },
}

#[derive(Debug, Serialize)]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

impl GeminiProvider {
    pub fn new(endpoint: &str, model: &str, api_key: &str) -> Self {
        Self {
            agent: agent(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

impl VisionProvider for GeminiProvider {
    fn classify(&self, image_bytes: &[u8], prompt: &str) -> Result<String, VisionError> {
        let (base64_image, mime_type) = encode_for_upload(image_bytes, UPLOAD_MAX_DIMENSION)?;

        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![
                    GeminiPart::Text {
                        text: prompt.to_string(),
                    },
                    GeminiPart::InlineData {
                        inline_data: GeminiInlineData {
                            mime_type: mime_type.to_string(),
                            data: base64_image,
                        },
                    },
                ],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: 0.2,
                response_mime_type: "application/json".to_string(),
            },
        };

        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let result = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .set("x-goog-api-key", &self.api_key)
            .send_json(&request);

        let response = match result {
            Ok(response) => response,
            // Gemini reports a bad key as 400 with API_KEY_INVALID.
            Err(ureq::Error::Status(400, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                if body.contains("API_KEY_INVALID") {
                    return Err(VisionError::Auth(body));
                }
                return Err(VisionError::Other(format!("status 400: {}", body)));
            }
            Err(e) => return Err(e.into()),
        };

        let parsed: GeminiResponse = response.into_json().map_err(|e| malformed("Gemini", e))?;
        Ok(parsed
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .and_then(|c| c.parts.iter().find_map(|p| p.text.clone()))
            .unwrap_or_default())
    }

    fn provider_name(&self) -> &'static str {
        "Google Gemini"
    }
}

/// Factory function to create the configured provider
pub fn create_provider(config: &LabelingConfig) -> Result<Box<dyn VisionProvider>> {
    let key = config.api_key.as_deref().filter(|k| !k.is_empty());
    match config.provider {
        VisionProviderType::LmStudio => Ok(Box::new(OpenAICompatibleProvider::new(
            &config.endpoint,
            &config.model,
            key,
        ))),
        VisionProviderType::OpenAI => {
            let Some(key) = key else {
                bail!("labeling.api_key is required for the OpenAI provider");
            };
            Ok(Box::new(OpenAICompatibleProvider::new(
                &config.endpoint,
                &config.model,
                Some(key),
            )))
        }
        VisionProviderType::Anthropic => {
            let Some(key) = key else {
                bail!("labeling.api_key is required for the Anthropic provider");
            };
            Ok(Box::new(AnthropicProvider::new(key, Some(&config.model))))
        }
        VisionProviderType::Gemini => {
            let Some(key) = key else {
                bail!("labeling.api_key is required for the Gemini provider");
            };
            Ok(Box::new(GeminiProvider::new(&config.endpoint, &config.model, key)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::fetch::fake::png_bytes;

    #[test]
    fn test_encode_for_upload_shrinks_large_images() {
        let bytes = png_bytes(2048, 1024, [10, 20, 30]);
        let (b64, mime) = encode_for_upload(&bytes, 1024).unwrap();
        assert_eq!(mime, "image/jpeg");
        let decoded = image::load_from_memory(&BASE64.decode(b64).unwrap()).unwrap();
        assert_eq!(decoded.dimensions(), (1024, 512));
    }

    #[test]
    fn test_encode_rejects_garbage() {
        assert!(matches!(
            encode_for_upload(b"not an image", 1024),
            Err(VisionError::Other(_))
        ));
    }

    #[test]
    fn test_create_provider_requires_key() {
        let mut config = LabelingConfig::default();
        config.api_key = None;
        assert!(create_provider(&config).is_err());

        config.provider = VisionProviderType::LmStudio;
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.provider_name(), "OpenAI-compatible");

        config.provider = VisionProviderType::Anthropic;
        config.api_key = Some("sk-test".into());
        assert_eq!(create_provider(&config).unwrap().provider_name(), "Anthropic Claude");
    }
}
