use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use super::{
    BlockStage, EncodedImage, GeneratedImage, HttpStatusError, ImageProvider, ImageRequest,
    ProviderOutcome, RequestPart, TextProvider, TextRequest,
};
use crate::support::truncate_text;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Finish reasons that mean the candidate was withheld on safety grounds.
const SAFETY_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "PROHIBITED_CONTENT",
    "IMAGE_SAFETY",
    "IMAGE_PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
];

/// Shared transport for the Gemini `generateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl GeminiClient {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let Some(api_key) = non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
        else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let api_base = non_empty_env("GEMINI_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Ok(Self::new(api_base, api_key))
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    /// Posts `payload` and returns either parsed JSON or a structured failure.
    fn post<T>(
        &self,
        model: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<std::result::Result<Value, ProviderOutcome<T>>> {
        let endpoint = self.endpoint_for_model(model);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .timeout(timeout)
            .json(payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .context("Gemini response body read failed")?;

        if !(200..300).contains(&status) {
            return match classify_http_failure(status, &body) {
                Some(outcome) => Ok(Err(outcome)),
                None => Err(HttpStatusError {
                    provider: "Gemini".to_string(),
                    status,
                    body: truncate_text(&body, 512),
                }
                .into()),
            };
        }
        match serde_json::from_str::<Value>(&body) {
            Ok(parsed) => Ok(Ok(parsed)),
            Err(err) => Ok(Err(ProviderOutcome::Malformed {
                reason: format!("invalid JSON payload: {err}"),
            })),
        }
    }
}

pub struct GeminiTextProvider {
    client: GeminiClient,
}

impl GeminiTextProvider {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }
}

impl TextProvider for GeminiTextProvider {
    fn name(&self) -> &str {
        "gemini-text"
    }

    fn generate(&self, request: &TextRequest) -> Result<ProviderOutcome<String>> {
        let payload = build_text_payload(request);
        match self.client.post(&request.model, &payload, request.timeout)? {
            Ok(response) => Ok(interpret_text_response(&response)),
            Err(outcome) => Ok(outcome),
        }
    }
}

pub struct GeminiImageProvider {
    client: GeminiClient,
}

impl GeminiImageProvider {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }
}

impl ImageProvider for GeminiImageProvider {
    fn name(&self) -> &str {
        "gemini-image"
    }

    fn generate(&self, request: &ImageRequest) -> Result<ProviderOutcome<GeneratedImage>> {
        let payload = build_image_payload(request);
        match self.client.post(&request.model, &payload, request.timeout)? {
            Ok(response) => Ok(interpret_image_response(&response)),
            Err(outcome) => Ok(outcome),
        }
    }
}

fn safety_settings() -> Vec<Value> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .into_iter()
    .map(|category| {
        json!({
            "category": category,
            "threshold": "BLOCK_ONLY_HIGH",
        })
    })
    .collect()
}

fn part_json(part: &RequestPart) -> Value {
    match part {
        RequestPart::Text(text) => json!({ "text": text }),
        RequestPart::Image(image) => image_part(image),
    }
}

fn image_part(image: &EncodedImage) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type,
            "data": image.data,
        }
    })
}

pub(crate) fn build_text_payload(request: &TextRequest) -> Value {
    let mut payload = Map::new();
    if let Some(instruction) = request.system_instruction.as_deref() {
        payload.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": instruction }] }),
        );
    }
    payload.insert(
        "contents".to_string(),
        json!([{
            "role": "user",
            "parts": request.parts.iter().map(part_json).collect::<Vec<Value>>(),
        }]),
    );
    payload.insert(
        "generationConfig".to_string(),
        json!({ "temperature": request.temperature }),
    );
    payload.insert("safetySettings".to_string(), Value::Array(safety_settings()));
    Value::Object(payload)
}

pub(crate) fn build_image_payload(request: &ImageRequest) -> Value {
    let mut parts: Vec<Value> = request.references.iter().map(image_part).collect();
    parts.push(json!({ "text": request.prompt }));

    let mut image_config = Map::new();
    if let Some(ratio) = snap_aspect_ratio(&request.aspect_ratio) {
        image_config.insert("aspectRatio".to_string(), Value::String(ratio.to_string()));
    }
    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "responseModalities": ["IMAGE", "TEXT"],
            "imageConfig": Value::Object(image_config),
        },
        "safetySettings": safety_settings(),
    })
}

/// Snaps free-form ratios and orientation words to a ratio Gemini accepts.
pub(crate) fn snap_aspect_ratio(raw: &str) -> Option<&'static str> {
    const SUPPORTED: &[(&str, f64)] = &[
        ("1:1", 1.0),
        ("2:3", 2.0 / 3.0),
        ("3:2", 3.0 / 2.0),
        ("3:4", 3.0 / 4.0),
        ("4:3", 4.0 / 3.0),
        ("4:5", 4.0 / 5.0),
        ("5:4", 5.0 / 4.0),
        ("9:16", 9.0 / 16.0),
        ("16:9", 16.0 / 9.0),
        ("21:9", 21.0 / 9.0),
    ];
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "" => return None,
        "portrait" | "tall" | "page" => return Some("3:4"),
        "landscape" | "wide" | "spread" => return Some("16:9"),
        "square" => return Some("1:1"),
        _ => {}
    }
    if let Some((key, _)) = SUPPORTED.iter().find(|(key, _)| *key == normalized) {
        return Some(key);
    }
    let (left, right) = normalized
        .split_once(':')
        .or_else(|| normalized.split_once('x'))?;
    let left = left.trim().parse::<f64>().ok()?;
    let right = right.trim().parse::<f64>().ok()?;
    if left <= 0.0 || right <= 0.0 {
        return None;
    }
    let target = left / right;
    SUPPORTED
        .iter()
        .min_by(|a, b| {
            (a.1 - target)
                .abs()
                .partial_cmp(&(b.1 - target).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(key, _)| *key)
}

pub(crate) fn classify_http_failure<T>(status: u16, body: &str) -> Option<ProviderOutcome<T>> {
    let upper = body.to_ascii_uppercase();
    if status == 429
        || status == 503
        || upper.contains("RESOURCE_EXHAUSTED")
        || upper.contains("UNAVAILABLE")
        || upper.contains("OVERLOADED")
    {
        return Some(ProviderOutcome::Overloaded {
            reason: format!("HTTP {status}: {}", truncate_text(body.trim(), 200)),
        });
    }
    if status == 400
        && (upper.contains("SAFETY") || upper.contains("PROHIBITED") || upper.contains("BLOCKED"))
    {
        return Some(ProviderOutcome::Blocked {
            stage: BlockStage::Request,
            reason: format!("HTTP 400: {}", truncate_text(body.trim(), 200)),
        });
    }
    // 500/502/504 surface as HttpStatusError for the transient classifier
    None
}

fn prompt_block_reason(response: &Value) -> Option<String> {
    response
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
        .filter(|reason| !reason.is_empty() && *reason != "BLOCK_REASON_UNSPECIFIED")
        .map(str::to_string)
}

fn candidates(response: &Value) -> Vec<Value> {
    response
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn finish_reason(candidate: &Value) -> Option<&str> {
    candidate.get("finishReason").and_then(Value::as_str)
}

fn candidate_parts(candidate: &Value) -> Vec<Value> {
    candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn safety_block(candidates: &[Value]) -> Option<String> {
    candidates
        .iter()
        .filter_map(finish_reason)
        .find(|reason| SAFETY_FINISH_REASONS.contains(reason))
        .map(str::to_string)
}

pub(crate) fn interpret_text_response(response: &Value) -> ProviderOutcome<String> {
    if let Some(reason) = prompt_block_reason(response) {
        return ProviderOutcome::Blocked {
            stage: BlockStage::Request,
            reason,
        };
    }
    let candidates = candidates(response);
    if candidates.is_empty() {
        return ProviderOutcome::Malformed {
            reason: "response contained no candidates".to_string(),
        };
    }
    if let Some(reason) = safety_block(&candidates) {
        return ProviderOutcome::Blocked {
            stage: BlockStage::Candidate,
            reason,
        };
    }
    let text = candidate_parts(&candidates[0])
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<&str>>()
        .join("");
    if text.trim().is_empty() {
        return ProviderOutcome::Malformed {
            reason: format!(
                "candidate finished with {} but returned no text",
                finish_reason(&candidates[0]).unwrap_or("no finish reason")
            ),
        };
    }
    ProviderOutcome::Success(text)
}

pub(crate) fn interpret_image_response(response: &Value) -> ProviderOutcome<GeneratedImage> {
    if let Some(reason) = prompt_block_reason(response) {
        return ProviderOutcome::Blocked {
            stage: BlockStage::Request,
            reason,
        };
    }
    let candidates = candidates(response);
    let mut caption: Option<String> = None;
    for candidate in &candidates {
        for part in candidate_parts(candidate) {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if caption.is_none() && !text.trim().is_empty() {
                    caption = Some(text.trim().to_string());
                }
                continue;
            }
            let Some(inline) = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            return ProviderOutcome::Success(GeneratedImage {
                image: EncodedImage::new(mime_type, data),
                caption,
            });
        }
    }
    if let Some(reason) = safety_block(&candidates) {
        return ProviderOutcome::Blocked {
            stage: BlockStage::Candidate,
            reason,
        };
    }
    let finish = candidates
        .first()
        .and_then(finish_reason)
        .unwrap_or("STOP")
        .to_string();
    ProviderOutcome::Malformed {
        reason: match caption {
            Some(text) => format!(
                "finished with {finish} but returned no image (text: {})",
                truncate_text(&text, 160)
            ),
            None => format!("finished with {finish} but returned no image"),
        },
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{
        build_image_payload, build_text_payload, classify_http_failure, interpret_image_response,
        interpret_text_response, snap_aspect_ratio, GeminiClient,
    };
    use crate::providers::{
        BlockStage, EncodedImage, ImageRequest, ProviderOutcome, RequestPart, TextPurpose,
        TextRequest,
    };

    fn text_request() -> TextRequest {
        TextRequest {
            model: "gemini-2.5-flash".to_string(),
            purpose: TextPurpose::Continuation,
            system_instruction: Some("You write manga scenes.".to_string()),
            parts: vec![
                RequestPart::Image(EncodedImage::new("image/png", "AAAA")),
                RequestPart::Text("Continue the story.".to_string()),
            ],
            temperature: 0.9,
            timeout: Duration::from_secs(30),
            page_number: 2,
            total_pages: 3,
        }
    }

    #[test]
    fn endpoint_accepts_bare_and_prefixed_models() {
        let client = GeminiClient::new("https://example.test/v1beta/", "key");
        assert_eq!(
            client.endpoint_for_model("gemini-2.5-flash"),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
        assert_eq!(
            client.endpoint_for_model("models/custom"),
            "https://example.test/v1beta/models/custom:generateContent"
        );
    }

    #[test]
    fn text_payload_carries_instruction_parts_and_safety() {
        let payload = build_text_payload(&text_request());
        assert_eq!(
            payload["systemInstruction"]["parts"][0]["text"],
            json!("You write manga scenes.")
        );
        let parts = &payload["contents"][0]["parts"];
        assert_eq!(parts[0]["inlineData"]["mimeType"], json!("image/png"));
        assert_eq!(parts[1]["text"], json!("Continue the story."));
        assert_eq!(payload["safetySettings"].as_array().map(Vec::len), Some(4));
    }

    #[test]
    fn image_payload_puts_references_before_prompt() {
        let request = ImageRequest {
            model: "gemini-2.5-flash-image".to_string(),
            prompt: "Page prompt".to_string(),
            references: vec![
                EncodedImage::new("image/png", "AAAA"),
                EncodedImage::new("image/jpeg", "BBBB"),
            ],
            aspect_ratio: "600x800".to_string(),
            timeout: Duration::from_secs(30),
            page_number: 1,
        };
        let payload = build_image_payload(&request);
        let parts = payload["contents"][0]["parts"].as_array().cloned().unwrap_or_default();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1]["inlineData"]["data"], json!("BBBB"));
        assert_eq!(parts[2]["text"], json!("Page prompt"));
        assert_eq!(
            payload["generationConfig"]["imageConfig"]["aspectRatio"],
            json!("3:4")
        );
    }

    #[test]
    fn aspect_ratio_snaps_to_supported_values() {
        assert_eq!(snap_aspect_ratio("3:4"), Some("3:4"));
        assert_eq!(snap_aspect_ratio("portrait"), Some("3:4"));
        assert_eq!(snap_aspect_ratio("1920x1080"), Some("16:9"));
        assert_eq!(snap_aspect_ratio("7:10"), Some("2:3"));
        assert_eq!(snap_aspect_ratio(""), None);
        assert_eq!(snap_aspect_ratio("banana"), None);
    }

    #[test]
    fn http_failures_map_to_overload_block_or_error() {
        assert!(matches!(
            classify_http_failure::<()>(503, "The model is overloaded."),
            Some(ProviderOutcome::Overloaded { .. })
        ));
        assert!(matches!(
            classify_http_failure::<()>(429, "{\"status\": \"RESOURCE_EXHAUSTED\"}"),
            Some(ProviderOutcome::Overloaded { .. })
        ));
        assert!(matches!(
            classify_http_failure::<()>(400, "request blocked by SAFETY filters"),
            Some(ProviderOutcome::Blocked {
                stage: BlockStage::Request,
                ..
            })
        ));
        assert!(classify_http_failure::<()>(400, "invalid argument").is_none());
        assert!(classify_http_failure::<()>(500, "internal").is_none());
    }

    #[test]
    fn text_response_variants() {
        let ok = json!({"candidates": [{"content": {"parts": [{"text": "Page two: "}, {"text": "the chase"}]}, "finishReason": "STOP"}]});
        assert_eq!(
            interpret_text_response(&ok),
            ProviderOutcome::Success("Page two: the chase".to_string())
        );

        let blocked = json!({"promptFeedback": {"blockReason": "PROHIBITED_CONTENT"}});
        assert_eq!(
            interpret_text_response(&blocked),
            ProviderOutcome::Blocked {
                stage: BlockStage::Request,
                reason: "PROHIBITED_CONTENT".to_string()
            }
        );

        let empty = json!({"candidates": [{"finishReason": "MAX_TOKENS"}]});
        assert!(matches!(
            interpret_text_response(&empty),
            ProviderOutcome::Malformed { .. }
        ));
    }

    #[test]
    fn image_response_success_and_candidate_block() {
        let ok = json!({"candidates": [{"content": {"parts": [
            {"text": "Here is your page"},
            {"inlineData": {"mimeType": "image/jpeg", "data": "/9j/AAAA"}}
        ]}, "finishReason": "STOP"}]});
        match interpret_image_response(&ok) {
            ProviderOutcome::Success(generated) => {
                assert_eq!(generated.image.mime_type, "image/jpeg");
                assert_eq!(generated.image.data, "/9j/AAAA");
                assert_eq!(generated.caption.as_deref(), Some("Here is your page"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let blocked = json!({"candidates": [{"finishReason": "IMAGE_SAFETY"}]});
        assert_eq!(
            interpret_image_response(&blocked),
            ProviderOutcome::Blocked {
                stage: BlockStage::Candidate,
                reason: "IMAGE_SAFETY".to_string()
            }
        );
    }

    #[test]
    fn image_response_stop_without_image_is_malformed() {
        let response = json!({"candidates": [{"content": {"parts": [{"text": "I can't draw that"}]}, "finishReason": "STOP"}]});
        match interpret_image_response(&response) {
            ProviderOutcome::Malformed { reason } => {
                assert!(reason.contains("STOP"));
                assert!(reason.contains("no image"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
