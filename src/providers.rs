use async_trait::async_trait;
use image::{ImageBuffer, Rgba};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::images::InlineImage;
use crate::prompt::{AdFields, AspectRatio, Language};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request to the generation service failed: {0}")]
    Transport(String),
    #[error("generation service returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("the generation service did not return an image")]
    NoImage,
    #[error("could not parse the generation service response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Internal(String),
}

impl ProviderError {
    /// Error text fit for the user: quota-looking failures get an actionable
    /// rewrite, everything else is surfaced verbatim.
    pub fn user_message(&self) -> String {
        let raw = self.to_string();
        if is_quota_message(&raw) {
            "The generation service reported quota exhaustion or rate limiting. \
             Wait a minute before retrying, or reduce the batch size."
                .to_string()
        } else {
            raw
        }
    }
}

/// The upstream service does not guarantee a structured error code, so quota
/// exhaustion is detected by substring. Swap this single function out if a
/// real code ever appears in the contract.
pub fn is_quota_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("quota")
        || lower.contains("rate limit")
        || lower.contains("resource exhausted")
        || lower.contains("resource_exhausted")
        || lower.contains("429")
}

/// Structured ad copy returned by the text capability. All three fields are
/// required; a response missing any of them is a parse failure, never a
/// partial result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdCopySuggestion {
    pub headline: String,
    pub subheadline: String,
    pub cta: String,
}

#[async_trait]
pub trait AdCopyGenerator: Send + Sync {
    async fn suggest(
        &self,
        description: &str,
        language: Language,
    ) -> Result<AdCopySuggestion, ProviderError>;
}

/// One image-generation call: shared encoded payloads plus the built
/// instruction. `ratio` rides along for providers that size output locally;
/// the remote capability reads it from the instruction text.
pub struct AdImageRequest<'a> {
    pub product: &'a InlineImage,
    pub logo: Option<&'a InlineImage>,
    pub instruction: &'a str,
    pub ratio: AspectRatio,
}

#[async_trait]
pub trait AdImageGenerator: Send + Sync {
    async fn generate(&self, request: &AdImageRequest<'_>) -> Result<InlineImage, ProviderError>;
    fn name(&self) -> &'static str;
}

/// Fetch a suggestion and merge it into the fields only on success. On any
/// failure the fields are left exactly as they were.
pub async fn suggest_into(
    fields: &mut AdFields,
    generator: &dyn AdCopyGenerator,
    description: &str,
    language: Language,
) -> Result<(), ProviderError> {
    let suggestion = generator.suggest(description, language).await?;
    fields.apply_suggestion(suggestion);
    Ok(())
}

// --- Gemini wire types (camelCase JSON) ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize, Deserialize, Default)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineImage>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    response_modalities: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
}

#[derive(Deserialize, Default)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

fn first_text(resp: &GenerateContentResponse) -> Option<&str> {
    resp.candidates
        .iter()
        .filter_map(|c| c.content.as_ref())
        .flat_map(|c| c.parts.iter())
        .find_map(|p| p.text.as_deref())
}

fn first_image(resp: GenerateContentResponse) -> Option<InlineImage> {
    resp.candidates
        .into_iter()
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts)
        .find_map(|p| p.inline_data)
}

fn parse_copy(text: &str) -> Result<AdCopySuggestion, ProviderError> {
    serde_json::from_str(text)
        .map_err(|e| ProviderError::Malformed(format!("ad copy JSON did not match schema: {e}")))
}

fn copy_response_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "headline": { "type": "STRING" },
            "subheadline": { "type": "STRING" },
            "cta": { "type": "STRING" }
        },
        "required": ["headline", "subheadline", "cta"]
    })
}

/// Client for Google's generative language API, covering both the text
/// (ad copy) and image capabilities. The credential is injected at
/// construction so tests and offline runs never touch ambient state.
pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    text_model: String,
    image_model: String,
}

impl GeminiProvider {
    pub fn new(api_key: String, text_model: String, image_model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: GEMINI_BASE_URL.to_string(),
            api_key,
            text_model,
            image_model,
        }
    }

    async fn generate_content(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ProviderError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(request)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(parsed) if !parsed.error.message.is_empty() => {
                    if parsed.error.status.is_empty() {
                        parsed.error.message
                    } else {
                        format!("{} ({})", parsed.error.message, parsed.error.status)
                    }
                }
                _ => {
                    let trimmed = body.trim();
                    if trimmed.is_empty() {
                        status.canonical_reason().unwrap_or("request failed").to_string()
                    } else {
                        trimmed.to_string()
                    }
                }
            };
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        resp.json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl AdCopyGenerator for GeminiProvider {
    async fn suggest(
        &self,
        description: &str,
        language: Language,
    ) -> Result<AdCopySuggestion, ProviderError> {
        let prompt = format!(
            "You write short advertising copy. Based on the product description below, \
             produce a punchy headline (at most 6 words), a supporting subheadline \
             (at most 12 words), and a short call to action (at most 4 words), all in {}.\n\n\
             Product description: {}",
            language.name(),
            description
        );
        let request = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: Some(prompt),
                    inline_data: None,
                }],
            }],
            generation_config: Some(GenerationConfig {
                response_modalities: None,
                response_mime_type: Some("application/json"),
                response_schema: Some(copy_response_schema()),
            }),
        };

        let resp = self.generate_content(&self.text_model, &request).await?;
        let text = first_text(&resp)
            .ok_or_else(|| ProviderError::Malformed("response contained no text part".into()))?;
        parse_copy(text)
    }
}

#[async_trait]
impl AdImageGenerator for GeminiProvider {
    async fn generate(&self, req: &AdImageRequest<'_>) -> Result<InlineImage, ProviderError> {
        // Part order matters to the model: product first, then the
        // instruction, then the logo it refers to.
        let mut parts = vec![
            Part {
                text: None,
                inline_data: Some(req.product.clone()),
            },
            Part {
                text: Some(req.instruction.to_string()),
                inline_data: None,
            },
        ];
        if let Some(logo) = req.logo {
            parts.push(Part {
                text: None,
                inline_data: Some(logo.clone()),
            });
        }

        let request = GenerateContentRequest {
            contents: vec![Content { parts }],
            generation_config: Some(GenerationConfig {
                response_modalities: Some(vec!["IMAGE", "TEXT"]),
                response_mime_type: None,
                response_schema: None,
            }),
        };

        let resp = self.generate_content(&self.image_model, &request).await?;
        first_image(resp).ok_or(ProviderError::NoImage)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

/// Offline provider: synthesizes a ratio-shaped placeholder PNG and canned
/// copy. Keeps the full pipeline usable without a credential.
pub struct MockProvider;

impl MockProvider {
    fn dimensions(ratio: AspectRatio) -> (u32, u32) {
        match ratio {
            AspectRatio::Square => (512, 512),
            AspectRatio::Portrait => (512, 640),
            AspectRatio::Story => (450, 800),
            AspectRatio::Landscape => (800, 450),
        }
    }
}

#[async_trait]
impl AdCopyGenerator for MockProvider {
    async fn suggest(
        &self,
        description: &str,
        language: Language,
    ) -> Result<AdCopySuggestion, ProviderError> {
        let subject: String = description.split_whitespace().take(3).collect::<Vec<_>>().join(" ");
        let (headline, cta) = match language {
            Language::English => (format!("Meet {subject}"), "Shop now".to_string()),
            Language::Indonesian => (format!("Kenalan dengan {subject}"), "Beli sekarang".to_string()),
        };
        Ok(AdCopySuggestion {
            headline,
            subheadline: description.chars().take(60).collect(),
            cta,
        })
    }
}

#[async_trait]
impl AdImageGenerator for MockProvider {
    async fn generate(&self, req: &AdImageRequest<'_>) -> Result<InlineImage, ProviderError> {
        let (w, h) = Self::dimensions(req.ratio);
        let tint = (req.instruction.len() % 255) as u8;
        let mut img = ImageBuffer::<Rgba<u8>, Vec<u8>>::new(w, h);
        for (x, y, p) in img.enumerate_pixels_mut() {
            let v = ((x ^ y) & 0xFF) as u8;
            *p = Rgba([v, 255 - v, tint, 255]);
        }
        let mut png_bytes: Vec<u8> = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(
                &mut std::io::Cursor::new(&mut png_bytes),
                image::ImageFormat::Png,
            )
            .map_err(|e| ProviderError::Internal(format!("placeholder encode failed: {e}")))?;
        InlineImage::from_bytes(&png_bytes)
            .map_err(|e| ProviderError::Internal(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
