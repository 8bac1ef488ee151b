//! Tagged request/response types and the provider traits the engine drives.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

pub mod dryrun;
pub mod gemini;

pub use dryrun::{DryrunImageProvider, DryrunTextProvider};
pub use gemini::{GeminiClient, GeminiImageProvider, GeminiTextProvider};

/// Image bytes in transferable form: base64 payload plus MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedImage {
    pub mime_type: String,
    pub data: String,
}

impl EncodedImage {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Encodes raw bytes, sniffing the MIME type from content before trusting `hint`.
    pub fn from_bytes(bytes: &[u8], hint: Option<&str>) -> Self {
        let mime_type = sniff_mime(bytes)
            .or(hint.filter(|value| value.starts_with("image/")))
            .unwrap_or("image/png");
        Self::new(mime_type, BASE64.encode(bytes))
    }

    pub fn parse_data_url(raw: &str) -> Option<Self> {
        let rest = raw.trim().strip_prefix("data:")?;
        let (meta, data) = rest.split_once(',')?;
        let mime_type = meta.strip_suffix(";base64")?;
        if data.is_empty() {
            return None;
        }
        let mime_type = if mime_type.is_empty() {
            "image/png"
        } else {
            mime_type
        };
        Some(Self::new(mime_type, data))
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    pub fn decode(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(self.data.as_bytes())
            .context("image payload is not valid base64")
    }
}

pub(crate) fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    let format = image::guess_format(bytes).ok()?;
    match format {
        image::ImageFormat::Png => Some("image/png"),
        image::ImageFormat::Jpeg => Some("image/jpeg"),
        image::ImageFormat::WebP => Some("image/webp"),
        image::ImageFormat::Gif => Some("image/gif"),
        _ => None,
    }
}

pub(crate) fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPart {
    Text(String),
    Image(EncodedImage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStage {
    /// Rejected before generation started.
    Request,
    /// Generation ran but the output was rejected.
    Candidate,
}

/// What a provider call produced, when the transport itself succeeded.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderOutcome<T> {
    Success(T),
    Blocked { stage: BlockStage, reason: String },
    Overloaded { reason: String },
    Malformed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextPurpose {
    Continuation,
    PolicyRewrite,
}

#[derive(Debug, Clone)]
pub struct TextRequest {
    pub model: String,
    pub purpose: TextPurpose,
    pub system_instruction: Option<String>,
    pub parts: Vec<RequestPart>,
    pub temperature: f32,
    pub timeout: Duration,
    /// 1-based page within the batch this text is for.
    pub page_number: usize,
    pub total_pages: usize,
}

impl TextRequest {
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                RequestPart::Text(text) => Some(text.as_str()),
                RequestPart::Image(_) => None,
            })
            .collect::<Vec<&str>>()
            .join("\n\n")
    }

    pub fn image_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|part| matches!(part, RequestPart::Image(_)))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub model: String,
    /// Fully assembled prompt: render directives plus scene text.
    pub prompt: String,
    pub references: Vec<EncodedImage>,
    pub aspect_ratio: String,
    pub timeout: Duration,
    pub page_number: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub image: EncodedImage,
    pub caption: Option<String>,
}

pub trait TextProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &TextRequest) -> Result<ProviderOutcome<String>>;
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &ImageRequest) -> Result<ProviderOutcome<GeneratedImage>>;
}

/// Non-success HTTP status that was not mapped to a structured outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{provider} request failed ({status}): {body}")]
pub struct HttpStatusError {
    pub provider: String,
    pub status: u16,
    pub body: String,
}
